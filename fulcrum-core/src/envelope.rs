//! Envelope & Type Registry (C1).
//!
//! The envelope is the universal wire unit (spec.md §3, §4.1). Its JSON
//! shape is stable: `{type, senderId, targetId, correlationId, timestamp,
//! version, payload}`. `payload` is a self-describing JSON tree; a
//! [`TypeRegistry`] maps `type` strings to decoder functions that turn it
//! into a concrete value when the receiver cares about the shape.

use std::any::Any;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FulcrumError;

pub const PROTOCOL_VERSION: u32 = 1;

/// The universal wire unit (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(rename = "senderId")]
    pub sender_id: String,
    #[serde(rename = "targetId", skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub version: u32,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Build an envelope with a fresh `correlation_id` and the current
    /// timestamp, matching the protocol version this crate speaks.
    pub fn new(
        type_name: impl Into<String>,
        sender_id: impl Into<String>,
        target_id: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            sender_id: sender_id.into(),
            target_id,
            correlation_id: Uuid::new_v4().to_string(),
            timestamp: now_ms(),
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    /// A response envelope that echoes the request's `correlation_id`
    /// (spec.md §3 invariant: "a response envelope echoes the request's
    /// `correlation_id`").
    pub fn response_to(
        request: &Envelope,
        type_name: impl Into<String>,
        sender_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            sender_id: sender_id.into(),
            target_id: Some(request.sender_id.clone()),
            correlation_id: request.correlation_id.clone(),
            timestamp: now_ms(),
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    /// Encode to bytes. Infallible for a well-formed envelope — `Envelope`
    /// only ever holds values `serde_json` can represent.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Envelope is always representable as JSON")
    }

    /// Decode from bytes, failing with `MalformedEnvelope` on invalid shape.
    pub fn decode(bytes: &[u8]) -> Result<Self, FulcrumError> {
        serde_json::from_slice(bytes).map_err(|e| FulcrumError::MalformedEnvelope(e.to_string()))
    }

    /// Whether this is a response to a request (i.e. its type ends in the
    /// request/response pairing suffix the bus synthesizes for
    /// unhandled requests).
    pub fn is_synthesized_error_response(&self) -> bool {
        self.type_name.ends_with("_response")
            && self
                .payload
                .get("error")
                .map(|v| v.is_string())
                .unwrap_or(false)
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as i64
}

/// A decoder turns a raw payload tree into a typed value, boxed as `Any` so
/// the registry can hold decoders for arbitrary concrete types. Unknown
/// types are never run through a decoder — they stay an opaque
/// `serde_json::Value` (spec.md §4.1, §9).
pub type Decoder = fn(&serde_json::Value) -> Result<Box<dyn Any + Send + Sync>, FulcrumError>;

/// Maps `type` strings to decoders (spec.md §4.1).
#[derive(Default)]
pub struct TypeRegistry {
    decoders: HashMap<String, Decoder>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: registering the same decoder function twice for the same
    /// type is a no-op. Registering a *different* decoder for a type
    /// already bound fails with `TypeConflict`.
    pub fn register(&mut self, type_name: impl Into<String>, decoder: Decoder) -> Result<(), FulcrumError> {
        let type_name = type_name.into();
        match self.decoders.get(&type_name) {
            Some(existing) if std::ptr::eq(*existing as *const (), decoder as *const ()) => Ok(()),
            Some(_) => Err(FulcrumError::TypeConflict { type_name }),
            None => {
                self.decoders.insert(type_name, decoder);
                Ok(())
            }
        }
    }

    /// Decode `payload` using the decoder registered for `type_name`. Falls
    /// back to an opaque `serde_json::Value` box when the type is unknown.
    pub fn decode(&self, type_name: &str, payload: &serde_json::Value) -> Result<Box<dyn Any + Send + Sync>, FulcrumError> {
        match self.decoders.get(type_name) {
            Some(decoder) => decoder(payload),
            None => Ok(Box::new(payload.clone())),
        }
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decode_ping(v: &serde_json::Value) -> Result<Box<dyn Any + Send + Sync>, FulcrumError> {
        Ok(Box::new(v.get("nonce").and_then(|n| n.as_u64()).unwrap_or(0)))
    }

    fn decode_ping_alt(_v: &serde_json::Value) -> Result<Box<dyn Any + Send + Sync>, FulcrumError> {
        Ok(Box::new(0u64))
    }

    #[test]
    fn round_trip_encode_decode() {
        let env = Envelope::new("server.heartbeat", "lobby-0", None, serde_json::json!({"tps": 20.0}));
        let bytes = env.encode();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.type_name, env.type_name);
        assert_eq!(decoded.sender_id, env.sender_id);
        assert_eq!(decoded.correlation_id, env.correlation_id);
        assert_eq!(decoded.payload, env.payload);
    }

    #[test]
    fn decode_rejects_malformed_bytes() {
        let err = Envelope::decode(b"not json").unwrap_err();
        assert!(matches!(err, FulcrumError::MalformedEnvelope(_)));
    }

    #[test]
    fn response_echoes_correlation_id() {
        let req = Envelope::new("ping", "proxy-0", Some("lobby-0".into()), serde_json::json!({}));
        let resp = Envelope::response_to(&req, "ping_response", "lobby-0", serde_json::json!({"ok": true}));
        assert_eq!(resp.correlation_id, req.correlation_id);
        assert_eq!(resp.target_id.as_deref(), Some("proxy-0"));
    }

    #[test]
    fn register_same_decoder_twice_is_noop() {
        let mut reg = TypeRegistry::new();
        reg.register("ping", decode_ping).unwrap();
        reg.register("ping", decode_ping).unwrap();
        assert!(reg.is_registered("ping"));
    }

    #[test]
    fn register_conflicting_decoder_fails() {
        let mut reg = TypeRegistry::new();
        reg.register("ping", decode_ping).unwrap();
        let err = reg.register("ping", decode_ping_alt).unwrap_err();
        assert!(matches!(err, FulcrumError::TypeConflict { .. }));
    }

    #[test]
    fn unknown_type_decodes_opaque() {
        let reg = TypeRegistry::new();
        let payload = serde_json::json!({"foo": "bar"});
        let boxed = reg.decode("mystery.type", &payload).unwrap();
        let value = boxed.downcast_ref::<serde_json::Value>().unwrap();
        assert_eq!(value, &payload);
    }

    proptest! {
        #[test]
        fn encode_decode_roundtrips_for_arbitrary_payloads(
            type_name in "[a-z.]{1,20}",
            sender_id in "[a-z0-9-]{1,20}",
            nonce in any::<u64>(),
            text in ".{0,40}",
        ) {
            let env = Envelope::new(type_name, sender_id, None, serde_json::json!({"nonce": nonce, "text": text}));
            let decoded = Envelope::decode(&env.encode()).unwrap();
            prop_assert_eq!(decoded.type_name, env.type_name);
            prop_assert_eq!(decoded.sender_id, env.sender_id);
            prop_assert_eq!(decoded.correlation_id, env.correlation_id);
            prop_assert_eq!(decoded.version, env.version);
            prop_assert_eq!(decoded.payload, env.payload);
        }
    }
}
