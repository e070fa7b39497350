use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Document identifier. Backed by a v4 UUID but carried on the wire as a
/// 32-character lowercase hex string so that ids stay opaque to every
/// component except the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(Uuid);

impl Oid {
    pub fn new() -> Self {
        Oid(Uuid::new_v4())
    }

    pub const fn nil() -> Self {
        Oid(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn hex(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for Oid {
    fn default() -> Self {
        Oid::nil()
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for Oid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::try_parse(s).map(Oid)
    }
}

impl Serialize for Oid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for Oid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let id = Oid::new();
        let parsed: Oid = id.hex().parse().expect("hex form should parse");
        assert_eq!(id, parsed);
        assert_eq!(id.hex().len(), 32);
    }

    #[test]
    fn test_nil_is_nil() {
        assert!(Oid::nil().is_nil());
        assert!(!Oid::new().is_nil());
    }

    #[test]
    fn test_json_form_is_hex_string() {
        let id = Oid::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.hex()));
        let back: Oid = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
