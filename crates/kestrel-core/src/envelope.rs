//! Request and response envelopes.
//!
//! The envelope names the method and carries service identity and outcome
//! metadata; the payload inside stays opaque to the transport. Envelopes are
//! serialized with bincode.

use serde::{Deserialize, Serialize};

use crate::{CallState, DecodeError};

/// What a client sends: a method name plus opaque request bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub method: String,
    pub payload: Vec<u8>,
}

impl RequestEnvelope {
    pub fn new(method: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            method: method.into(),
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        bincode::serialize(self).map_err(|e| DecodeError::new(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        bincode::deserialize(bytes).map_err(|e| DecodeError::new(e.to_string()))
    }
}

/// What a server answers: service identity, outcome metadata and opaque
/// response bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub host_name: String,
    pub service_name: String,
    pub service_id: String,
    pub method: String,
    pub error: String,
    pub ret_state: i32,
    pub call_state: CallState,
    pub payload: Vec<u8>,
}

impl ResponseEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        bincode::serialize(self).map_err(|e| DecodeError::new(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        bincode::deserialize(bytes).map_err(|e| DecodeError::new(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_round_trip() {
        let env = RequestEnvelope::new("echo", vec![1, 2, 3]);
        let bytes = env.encode().unwrap();
        assert_eq!(RequestEnvelope::decode(&bytes).unwrap(), env);
    }

    #[test]
    fn response_envelope_round_trip() {
        let env = ResponseEnvelope {
            host_name: "hostA".into(),
            service_name: "mirror".into(),
            service_id: "svc-1".into(),
            method: "echo".into(),
            error: String::new(),
            ret_state: 0,
            call_state: CallState::Executed,
            payload: vec![4],
        };
        let bytes = env.encode().unwrap();
        assert_eq!(ResponseEnvelope::decode(&bytes).unwrap(), env);
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(ResponseEnvelope::decode(&[0xFF; 3]).is_err());
    }
}
