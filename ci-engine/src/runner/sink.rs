//! Sinks receiving the combined stdout/stderr of step processes.

use parking_lot::Mutex;
use tracing::info;

/// Receives process output line by line.
///
/// Lines from every attempt of a step go to the same sink; nothing written
/// by a failed attempt is discarded.
pub trait OutputSink: Send + Sync + std::fmt::Debug {
    /// Writes one line of output produced by a step.
    fn write_line(&self, step_id: &str, line: &str);
}

/// Forwards process output to `tracing` at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingOutputSink;

impl OutputSink for TracingOutputSink {
    fn write_line(&self, step_id: &str, line: &str) {
        info!(step_id = %step_id, "{}", line);
    }
}

/// Keeps process output in memory.
#[derive(Debug, Default)]
pub struct BufferedOutputSink {
    lines: Mutex<Vec<(String, String)>>,
}

impl BufferedOutputSink {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every line written for a step.
    #[must_use]
    pub fn lines_for(&self, step_id: &str) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|(id, _)| id == step_id)
            .map(|(_, line)| line.clone())
            .collect()
    }

    /// Returns the total number of lines written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    /// Returns true if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

impl OutputSink for BufferedOutputSink {
    fn write_line(&self, step_id: &str, line: &str) {
        self.lines.lock().push((step_id.to_string(), line.to_string()));
    }
}
