//! Value encoding for message payloads.
//!
//! The transport treats payload encoding as opaque: anything `serde` can
//! represent is marshalled to JSON bytes.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::NetError;

/// Encodes a value into payload bytes.
pub fn marshal<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, NetError> {
    serde_json::to_vec(value).map_err(|e| NetError::Encode(e.to_string()))
}

/// Decodes payload bytes into a value of type `T`.
pub fn unmarshal<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, NetError> {
    serde_json::from_slice(bytes).map_err(|e| NetError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NetAddress;

    #[test]
    fn list_of_addresses() {
        let addrs = vec![NetAddress::new("a", 1), NetAddress::new("b", 2)];
        let bytes = marshal(&addrs).unwrap();
        let back: Vec<NetAddress> = unmarshal(&bytes).unwrap();
        assert_eq!(back, addrs);
    }

    #[test]
    fn wrong_shape_is_decode_error() {
        let bytes = marshal(&42u32).unwrap();
        let err = unmarshal::<NetAddress>(&bytes).unwrap_err();
        assert!(matches!(err, NetError::Decode(_)));
    }
}
