//! Chat payload codec and the end-of-chat convention.
//!
//! A payload is a string map with one recognized key, `message`. It is bincode
//! encoded (length-prefixed key/value pairs), and unknown keys are ignored when
//! decoding so newer peers can add fields without breaking older ones.

use std::collections::BTreeMap;

/// Key holding the text body.
pub const MESSAGE_KEY: &str = "message";

/// Control word a peer sends to say it ended the chat on purpose.
/// Only an exact match counts; user text merely containing it is ordinary text.
pub const END_CHAT: &str = "end_chat";

/// What a decoded payload means to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatPayload {
    Text(String),
    EndChat,
}

impl ChatPayload {
    /// Classify a body: the exact end-of-chat literal, or text.
    pub fn from_body(body: String) -> Self {
        if body == END_CHAT {
            ChatPayload::EndChat
        } else {
            ChatPayload::Text(body)
        }
    }
}

pub fn encode_message(body: &str) -> Result<Vec<u8>, bincode::Error> {
    let mut map = BTreeMap::new();
    map.insert(MESSAGE_KEY.to_string(), body.to_string());
    bincode::serialize(&map)
}

pub fn encode_end_chat() -> Result<Vec<u8>, bincode::Error> {
    encode_message(END_CHAT)
}

/// Decode a payload back to its `message` body.
pub fn decode_message(bytes: &[u8]) -> Result<String, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let mut map: BTreeMap<String, String> = bincode::deserialize(bytes)?;
    map.remove(MESSAGE_KEY).ok_or(DecodeError::MissingMessage)
}

pub fn decode_payload(bytes: &[u8]) -> Result<ChatPayload, DecodeError> {
    decode_message(bytes).map(ChatPayload::from_body)
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("malformed payload: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("payload has no `message` key")]
    MissingMessage,
}
