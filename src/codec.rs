//! # Event Payload Encoding and Decoding
//!
//! Producers hand ShardLog already-serialized payloads tagged with a
//! [`TypeCode`]. On the read side a [`TypeRegistry`] maps each type code to a
//! decoder producing the caller's event family `E`:
//!
//! ```text
//! row (type_code, data) ──► TypeRegistry ──► decoder for type_code ──► E
//!                                 │
//!                                 └── unknown code / bad bytes ──► Err (row dropped by readers)
//! ```
//!
//! JSON via `serde_json` is the default wire format; [`TypeRegistry::register_decoder`]
//! accepts any other format.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::types::TypeCode;

// =============================================================================
// Encoding
// =============================================================================

/// Serializes a payload as JSON bytes.
pub fn encode_json<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

// =============================================================================
// Type Registry
// =============================================================================

type Decoder<E> = Box<dyn Fn(&[u8]) -> Result<E> + Send + Sync>;

/// Registry mapping type codes to payload decoders.
///
/// # Example
///
/// ```rust
/// use serde::Deserialize;
/// use shardlog::codec::TypeRegistry;
///
/// #[derive(Deserialize)]
/// struct Deposited { amount: u64 }
///
/// enum AccountEvent { Deposited(Deposited) }
///
/// let mut registry = TypeRegistry::new();
/// registry.register::<Deposited, _>("Deposited", AccountEvent::Deposited);
///
/// let event = registry.decode("Deposited", br#"{"amount":5}"#).unwrap();
/// assert!(matches!(event, AccountEvent::Deposited(Deposited { amount: 5 })));
/// ```
pub struct TypeRegistry<E> {
    decoders: HashMap<String, Decoder<E>>,
}

impl<E> TypeRegistry<E> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registers a JSON payload type `T` under `type_code`, converting it into
    /// the event family with `into_event`.
    ///
    /// Registering the same code twice replaces the earlier decoder.
    pub fn register<T, F>(&mut self, type_code: impl Into<TypeCode>, into_event: F) -> &mut Self
    where
        T: DeserializeOwned,
        F: Fn(T) -> E + Send + Sync + 'static,
    {
        self.register_decoder(type_code, move |bytes| {
            let payload: T = serde_json::from_slice(bytes)?;
            Ok(into_event(payload))
        })
    }

    /// Registers an arbitrary decoder under `type_code`.
    pub fn register_decoder<F>(&mut self, type_code: impl Into<TypeCode>, decoder: F) -> &mut Self
    where
        F: Fn(&[u8]) -> Result<E> + Send + Sync + 'static,
    {
        let code: TypeCode = type_code.into();
        self.decoders.insert(code.as_str().to_string(), Box::new(decoder));
        self
    }

    /// Returns true if `type_code` has a decoder.
    pub fn contains(&self, type_code: &str) -> bool {
        self.decoders.contains_key(type_code)
    }

    /// Number of registered type codes.
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Returns true if no type code is registered.
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decodes a payload.
    ///
    /// # Errors
    ///
    /// - `Error::UnknownType` if `type_code` is not registered
    /// - whatever the decoder returns, typically `Error::Serialization`
    pub fn decode(&self, type_code: &str, data: &[u8]) -> Result<E> {
        match self.decoders.get(type_code) {
            Some(decoder) => decoder(data),
            None => Err(Error::UnknownType(type_code.to_string())),
        }
    }
}

impl<E> Default for TypeRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
