//! Serialized shim layout: a msgpack map with two named fields, `config`
//! (the architecture settings, any structured value) and `state` (the
//! framework's own parameter blob, stored as msgpack binary).

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::ShimError;

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    config: &'a serde_json::Value,
    #[serde(with = "serde_bytes")]
    state: &'a [u8],
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default, deserialize_with = "present")]
    config: Option<serde_json::Value>,
    state: Option<ByteBuf>,
}

/// Keeps an explicit `nil` config distinct from a missing one.
fn present<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<serde_json::Value>, D::Error> {
    serde_json::Value::deserialize(d).map(Some)
}

/// A decoded, complete envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub config: serde_json::Value,
    pub state: Vec<u8>,
}

pub fn encode(config: &serde_json::Value, state: &[u8]) -> Result<Vec<u8>, ShimError> {
    Ok(rmp_serde::to_vec_named(&EnvelopeRef { config, state })?)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, ShimError> {
    let raw: RawEnvelope = rmp_serde::from_slice(bytes)?;
    let config = raw.config.ok_or(ShimError::MissingField("config"))?;
    let state = raw.state.ok_or(ShimError::MissingField("state"))?;
    Ok(Envelope {
        config,
        state: state.into_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_round_trip() {
        let config = json!({"hidden": 32, "dropout": 0.1, "layers": ["linear", "relu"]});
        let state = vec![0u8, 1, 2, 255];
        let bytes = encode(&config, &state).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.config, config);
        assert_eq!(decoded.state, state);
    }

    #[test]
    fn test_null_config_survives() {
        let bytes = encode(&serde_json::Value::Null, b"").unwrap();
        assert_eq!(decode(&bytes).unwrap().config, serde_json::Value::Null);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let a = encode(&json!({"b": 1, "a": 2}), b"xyz").unwrap();
        let b = encode(&json!({"a": 2, "b": 1}), b"xyz").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_fields() {
        let mut only_config = BTreeMap::new();
        only_config.insert("config", json!({}));
        let bytes = rmp_serde::to_vec_named(&only_config).unwrap();
        assert!(matches!(decode(&bytes), Err(ShimError::MissingField("state"))));

        #[derive(Serialize)]
        struct OnlyState {
            #[serde(with = "serde_bytes")]
            state: Vec<u8>,
        }
        let bytes = rmp_serde::to_vec_named(&OnlyState { state: vec![1] }).unwrap();
        assert!(matches!(decode(&bytes), Err(ShimError::MissingField("config"))));
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        assert!(matches!(decode(b"\xc1\xc1\xc1"), Err(ShimError::Decode(_))));
        assert!(matches!(decode(&[]), Err(ShimError::Decode(_))));
    }
}
