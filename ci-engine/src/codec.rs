//! Stage payload encoding.
//!
//! A stage arrives as base64 text wrapping the JSON form of an
//! [`Execution`]. Surrounding whitespace is ignored.

use crate::core::Execution;
use crate::errors::DecodeError;
use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::error;

/// Decodes a stage payload into an execution description.
///
/// Fails with [`DecodeError::Transport`] when the text is not valid base64
/// and with [`DecodeError::Structure`] when the decoded bytes do not
/// describe an execution. No partial execution is ever returned.
pub fn decode_stage(encoded: &str) -> Result<Execution, DecodeError> {
    let bytes = STANDARD.decode(encoded.trim()).map_err(|e| {
        error!(error = %e, "failed to decode stage");
        DecodeError::Transport(e.to_string())
    })?;

    serde_json::from_slice(&bytes).map_err(|e| {
        error!(error = %e, "failed to deserialize stage");
        DecodeError::Structure(e.to_string())
    })
}

/// Encodes an execution description as a stage payload.
pub fn encode_stage(execution: &Execution) -> Result<String, serde_json::Error> {
    Ok(STANDARD.encode(serde_json::to_vec(execution)?))
}
