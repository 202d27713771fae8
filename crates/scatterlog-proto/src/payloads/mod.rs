//! CBOR payload types.
//!
//! Bodies are CBOR-encoded with `ciborium`. Only the key exchange lives here;
//! the log message plaintext is in [`crate::message`].

pub mod keys;

use serde::{Serialize, de::DeserializeOwned};

use crate::PayloadError;

pub(crate) fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, PayloadError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| PayloadError::Encode(e.to_string()))?;
    Ok(out)
}

pub(crate) fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PayloadError> {
    ciborium::de::from_reader(bytes).map_err(|e| PayloadError::Decode(e.to_string()))
}
