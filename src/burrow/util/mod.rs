pub mod event_reporter;
pub mod named_lock;
pub mod net;
pub mod timeout_dict;

pub use event_reporter::EventReporter;
pub use named_lock::NamedLockRegistry;
pub use timeout_dict::TimeoutDictionary;

/// Base64 (standard alphabet) serde helper for binary fields on the wire
/// and in persisted JSON.
pub mod serde_b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "super::serde_b64")]
        data: Vec<u8>,
    }

    #[test]
    fn b64_roundtrip() {
        let h = Holder {
            data: vec![0, 1, 2, 254, 255],
        };
        let s = serde_json::to_string(&h).unwrap();
        let back: Holder = serde_json::from_str(&s).unwrap();
        assert_eq!(back.data, h.data);
    }
}
