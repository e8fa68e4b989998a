//! Process launching.

use super::OutputSink;
use crate::cancellation::CancellationToken;
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::warn;
use tokio::process::Command;

/// A fully resolved command: program, arguments and extra environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program followed by its arguments. Never empty once resolved.
    pub argv: Vec<String>,
    /// Environment variables added to the inherited environment.
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    /// Creates a command spec.
    #[must_use]
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            env: HashMap::new(),
        }
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Returns the program to execute.
    #[must_use]
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

/// How a launched process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl ProcessExit {
    /// A successful exit.
    #[must_use]
    pub fn success() -> Self {
        Self { code: Some(0) }
    }

    /// An exit with the given code.
    #[must_use]
    pub fn with_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    /// Returns true if the process exited with code zero.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Starts a step's process and waits for it to exit.
///
/// Dropping the returned future must stop the process; the step runner
/// relies on this to enforce attempt deadlines.
#[async_trait]
pub trait ProcessLauncher: Send + Sync + std::fmt::Debug {
    /// Runs the command to completion, streaming its output to the sink.
    async fn launch(
        &self,
        step_id: &str,
        command: &CommandSpec,
        sink: Arc<dyn OutputSink>,
        token: Arc<CancellationToken>,
    ) -> std::io::Result<ProcessExit>;
}

/// Launches commands as operating system processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessLauncher;

#[async_trait]
impl ProcessLauncher for OsProcessLauncher {
    async fn launch(
        &self,
        step_id: &str,
        command: &CommandSpec,
        sink: Arc<dyn OutputSink>,
        token: Arc<CancellationToken>,
    ) -> std::io::Result<ProcessExit> {
        let Some((program, args)) = command.argv.split_first() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command",
            ));
        };

        let mut child = Command::new(program)
            .args(args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            let (status, (), ()) = tokio::join!(
                child.wait(),
                pump(stdout, step_id, sink.as_ref()),
                pump(stderr, step_id, sink.as_ref()),
            );
            status
        };

        tokio::select! {
            status = run => Ok(ProcessExit { code: status?.code() }),
            () = token.cancelled() => Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                token.reason().unwrap_or_else(|| "cancelled".to_string()),
            )),
        }
    }
}

/// Forwards a pipe to the sink line by line until EOF.
///
/// Bytes that are not valid UTF-8 are replaced rather than ending the read,
/// and the pipe stays drained after a read error so the child never blocks
/// or dies writing to it.
async fn pump<R>(reader: Option<R>, step_id: &str, sink: &dyn OutputSink)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => {
                let line = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                sink.write_line(step_id, &String::from_utf8_lossy(line));
            }
            Err(e) => {
                warn!(step_id = %step_id, error = %e, "Failed to read step output, discarding the rest");
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                return;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::runner::BufferedOutputSink;
    use std::time::Duration;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_launch_streams_combined_output() {
        let sink = Arc::new(BufferedOutputSink::new());
        let exit = OsProcessLauncher
            .launch("s", &sh("echo out; echo err 1>&2"), sink.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert!(exit.is_success());
        let mut lines = sink.lines_for("s");
        lines.sort();
        assert_eq!(lines, vec!["err", "out"]);
    }

    #[tokio::test]
    async fn test_launch_reports_exit_code() {
        let sink = Arc::new(BufferedOutputSink::new());
        let exit = OsProcessLauncher
            .launch("s", &sh("exit 3"), sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(exit.code, Some(3));
        assert!(!exit.is_success());
    }

    #[tokio::test]
    async fn test_launch_passes_env() {
        let sink = Arc::new(BufferedOutputSink::new());
        let command = sh("echo $GREETING").with_env("GREETING", "hello");
        OsProcessLauncher
            .launch("s", &command, sink.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.lines_for("s"), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_launch_missing_program() {
        let sink = Arc::new(BufferedOutputSink::new());
        let command = CommandSpec::new(vec!["/nonexistent/ci-engine-binary".to_string()]);
        let result = OsProcessLauncher
            .launch("s", &command, sink, CancellationToken::new())
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_launch_stops_on_cancel() {
        let sink = Arc::new(BufferedOutputSink::new());
        let token = CancellationToken::new();
        let canceller = token.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel("stop");
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            OsProcessLauncher.launch("s", &sh("sleep 30"), sink, token),
        )
        .await
        .unwrap();

        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_stop_output() {
        let sink = Arc::new(BufferedOutputSink::new());
        let script = "printf 'a\\377b\\n'; i=0; while [ $i -lt 20000 ]; do echo line$i; i=$((i+1)); done; echo done";

        let exit = OsProcessLauncher
            .launch("bin", &sh(script), sink.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert!(exit.is_success());
        let lines = sink.lines_for("bin");
        assert_eq!(lines.len(), 20_002);
        assert_eq!(lines[0], "a\u{fffd}b");
        assert_eq!(lines.last().map(String::as_str), Some("done"));
    }

    #[tokio::test]
    async fn test_last_line_without_newline_kept() {
        let sink = Arc::new(BufferedOutputSink::new());
        OsProcessLauncher
            .launch("s", &sh("printf 'one\\r\\ntwo'"), sink.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.lines_for("s"), vec!["one", "two"]);
    }
}
