//! The conv module provides serde adapters for binary fields that travel as base64 strings

extern crate base64;

use serde::de::Error;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serializer};

/// Serializes `buffer` to a base64-string. Only useful with serde.
/// can be applied to structs by:
/// #[serde(serialize_with = "ser_vec_u8_to_str", deserialize_with = "de_str_to_vec_u8")]
pub fn ser_vec_u8_to_str<T, S>(buffer: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: AsRef<[u8]>,
    S: Serializer,
{
    serializer.serialize_str(&base64::encode_config(buffer.as_ref(), base64::STANDARD))
}

/// Deserializes a string formatted in base64 to a `Vec<u8>`. Only useful with serde.
/// can be applied to structs by:
/// #[serde(serialize_with = "ser_vec_u8_to_str", deserialize_with = "de_str_to_vec_u8")]
pub fn de_str_to_vec_u8<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).and_then(|string| {
        base64::decode_config(string.as_bytes(), base64::STANDARD)
            .map_err(|err| Error::custom(err.to_string()))
    })
}

/// Serializes a list of byte buffers to a sequence of base64-strings.
/// can be applied to structs by:
/// #[serde(serialize_with = "ser_vec_vec_u8_to_str", deserialize_with = "de_str_to_vec_vec_u8")]
pub fn ser_vec_vec_u8_to_str<S>(buffers: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut seq = serializer.serialize_seq(Some(buffers.len()))?;
    for buffer in buffers {
        seq.serialize_element(&base64::encode_config(buffer, base64::STANDARD))?;
    }
    seq.end()
}

/// Deserializes a sequence of base64-strings to a `Vec<Vec<u8>>`.
/// can be applied to structs by:
/// #[serde(serialize_with = "ser_vec_vec_u8_to_str", deserialize_with = "de_str_to_vec_vec_u8")]
pub fn de_str_to_vec_vec_u8<'de, D>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    let strings = Vec::<String>::deserialize(deserializer)?;
    let mut buffers = Vec::with_capacity(strings.len());
    for string in strings {
        let buffer = base64::decode_config(string.as_bytes(), base64::STANDARD)
            .map_err(|err| Error::custom(err.to_string()))?;
        buffers.push(buffer);
    }
    Ok(buffers)
}
