use serde::{Deserialize, Serialize};

/// A replicated mutation of the key-value state. Encoded as JSON, e.g.
/// `{"operation":"SET","key":"foo","value":"bar"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "UPPERCASE")]
pub enum Command {
    Set { key: String, value: String },
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_wire_format() {
        let encoded = Command::set("foo", "bar").encode().unwrap();
        assert_eq!(
            String::from_utf8(encoded).unwrap(),
            r#"{"operation":"SET","key":"foo","value":"bar"}"#
        );
    }

    #[test]
    fn decodes_set() {
        let command =
            Command::decode(br#"{"operation":"SET","key":"a","value":"1"}"#).unwrap();
        assert_eq!(command, Command::set("a", "1"));
    }

    #[test]
    fn unknown_operation_is_a_decode_error() {
        assert!(Command::decode(br#"{"operation":"DELETE","key":"a"}"#).is_err());
        assert!(Command::decode(b"not json").is_err());
    }
}
