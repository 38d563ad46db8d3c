use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// 8-byte gateway identifier, as sent in the header of gateway-originated
/// frames. Rendered as 16 lowercase hex digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Eui64([u8; 8]);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid EUI64 {0:?}: expected 16 hex digits")]
pub struct ParseEuiError(String);

impl Eui64 {
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl From<[u8; 8]> for Eui64 {
    fn from(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Eui64({self})")
    }
}

impl FromStr for Eui64 {
    type Err = ParseEuiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseEuiError(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Eui64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Eui64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse() {
        let eui = Eui64::new([0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0xab]);
        assert_eq!(eui.to_string(), "01020304050607ab");
        assert_eq!("01020304050607AB".parse::<Eui64>().unwrap(), eui);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!("0102".parse::<Eui64>().is_err());
        assert!("zz02030405060708".parse::<Eui64>().is_err());
    }

    #[test]
    fn serializes_as_hex_string() {
        let eui = Eui64::new([0xaa; 8]);
        let json = serde_json::to_string(&eui).unwrap();
        assert_eq!(json, "\"aaaaaaaaaaaaaaaa\"");
        assert_eq!(serde_json::from_str::<Eui64>(&json).unwrap(), eui);
    }
}
