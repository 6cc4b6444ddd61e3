//! NDJSON framing for the child stdio boundary.
//!
//! One JSON-RPC 2.0 object per line in both directions. [`parse_message`] is
//! pure; [`bounded_read_line`] is the async line reader the child endpoint's
//! reader task drives.

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::FramingError;
use crate::jsonrpc::{JsonRpcClassifyError, JsonRpcMessageKind, classify_jsonrpc};

/// Maximum NDJSON message size (10 MB).
///
/// Lines exceeding this limit are rejected before JSON parsing.
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// A classified NDJSON line.
#[derive(Debug, Clone)]
pub struct FrameMessage {
    /// Classified message kind (Request, Response, or Notification).
    pub kind: JsonRpcMessageKind,
    /// The parsed object, forwarded verbatim to whoever consumes it.
    pub value: Value,
}

/// Parse a single NDJSON line into a [`FrameMessage`].
///
/// # Errors
///
/// Returns [`FramingError`] for:
/// - Oversized messages (`MessageTooLarge`), checked before JSON parsing
/// - Empty or invalid JSON (`MalformedJson`)
/// - JSON arrays (`UnsupportedBatch`)
/// - Missing `jsonrpc` field (`MissingVersion`)
/// - Wrong `jsonrpc` version (`UnsupportedVersion`)
/// - Invalid `id` types and unclassifiable objects (`MalformedJson`)
pub fn parse_message(line: &str) -> Result<FrameMessage, FramingError> {
    if line.len() > MAX_MESSAGE_BYTES {
        return Err(FramingError::MessageTooLarge {
            max_bytes: MAX_MESSAGE_BYTES,
        });
    }

    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(FramingError::MalformedJson {
            reason: "empty message".to_string(),
        });
    }

    let value: Value = serde_json::from_str(trimmed).map_err(|e| FramingError::MalformedJson {
        reason: e.to_string(),
    })?;

    classify_value(value)
}

/// Classify an already-parsed value with the same rules as [`parse_message`].
///
/// Used for inbound client payloads that arrive as JSON bodies or frames.
pub fn classify_value(value: Value) -> Result<FrameMessage, FramingError> {
    if value.is_array() {
        return Err(FramingError::UnsupportedBatch);
    }
    if !value.is_object() {
        return Err(FramingError::MalformedJson {
            reason: "message is not a JSON object".to_string(),
        });
    }

    let kind = classify_jsonrpc(&value).map_err(|e| match e {
        JsonRpcClassifyError::InvalidVersion => {
            match value.get("jsonrpc").and_then(|v| v.as_str()) {
                Some(v) => FramingError::UnsupportedVersion {
                    version: v.to_string(),
                },
                None => FramingError::MissingVersion,
            }
        }
        JsonRpcClassifyError::InvalidId => FramingError::MalformedJson {
            reason: "invalid id field".to_string(),
        },
        JsonRpcClassifyError::Unclassifiable => FramingError::MalformedJson {
            reason: "message has neither id nor method".to_string(),
        },
    })?;

    Ok(FrameMessage { kind, value })
}

/// Serialize a message as one NDJSON line (trailing `\n` included).
///
/// `serde_json` never emits raw newlines inside a compact document, so the
/// output is always exactly one line.
pub fn encode_line(value: &Value) -> Result<Vec<u8>, FramingError> {
    let mut bytes = serde_json::to_vec(value).map_err(|e| FramingError::MalformedJson {
        reason: e.to_string(),
    })?;
    if bytes.len() >= MAX_MESSAGE_BYTES {
        return Err(FramingError::MessageTooLarge {
            max_bytes: MAX_MESSAGE_BYTES,
        });
    }
    bytes.push(b'\n');
    Ok(bytes)
}

/// Read one newline-terminated line, refusing to buffer more than `max_bytes`.
///
/// Returns:
/// - `Ok(n)` with `n > 0`: bytes appended to `buf` (newline included)
/// - `Ok(0)`: EOF reached
/// - `Err(FramingError::MessageTooLarge)`: line exceeded `max_bytes` without newline
/// - `Err(FramingError::Io)`: underlying I/O error
pub async fn bounded_read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> Result<usize, FramingError> {
    let mut total = 0usize;
    loop {
        let available = reader.fill_buf().await.map_err(FramingError::Io)?;

        if available.is_empty() {
            return Ok(total);
        }

        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let to_consume = pos + 1;
                if total + to_consume > max_bytes {
                    reader.consume(to_consume);
                    return Err(FramingError::MessageTooLarge { max_bytes });
                }

                buf.extend_from_slice(&available[..to_consume]);
                total += to_consume;
                reader.consume(to_consume);
                return Ok(total);
            }
            None => {
                let len = available.len();
                if total + len > max_bytes {
                    reader.consume(len);
                    return Err(FramingError::MessageTooLarge { max_bytes });
                }

                buf.extend_from_slice(available);
                total += len;
                reader.consume(len);
            }
        }
    }
}
