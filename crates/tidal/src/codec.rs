//! The boundary between application objects and stored state.
//!
//! The storage core never looks inside `state`. A [`Codec`] turns an object
//! into bytes plus the set of object ids it references, and back.

use std::collections::BTreeSet;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use tidal_types::Oid;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}

/// Encoded form of an object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Encoded {
    pub state: Vec<u8>,
    /// Declared outgoing references, read by pack.
    pub refs: BTreeSet<Oid>,
}

/// Converts application objects to and from stored state.
pub trait Codec: Send + Sync {
    type Object: Clone + Send + Sync + 'static;

    fn encode(&self, object: &Self::Object) -> Result<Encoded, CodecError>;

    fn decode(&self, state: &[u8]) -> Result<Self::Object, CodecError>;
}

/// Objects that can declare which other objects they reference.
pub trait References {
    fn references(&self) -> Vec<Oid>;
}

/// JSON codec for serde types.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T> Codec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + References + Clone + Send + Sync + 'static,
{
    type Object = T;

    fn encode(&self, object: &T) -> Result<Encoded, CodecError> {
        let state = serde_json::to_vec(object).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Encoded {
            state,
            refs: object.references().into_iter().collect(),
        })
    }

    fn decode(&self, state: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(state).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
