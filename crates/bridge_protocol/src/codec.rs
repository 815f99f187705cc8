//! Text framing for [`Message`]. One message per frame, UTF-8 JSON.

use crate::error::BusError;
use crate::message::Message;

pub fn encode(message: &Message) -> Result<String, BusError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a single frame. Surrounding whitespace (including the newline the
/// stdio transport appends) is ignored.
pub fn decode(frame: &str) -> Result<Message, BusError> {
    let frame = frame.trim();
    if frame.is_empty() {
        return Err(BusError::EmptyFrame);
    }
    Ok(serde_json::from_str(frame)?)
}
