//! Payload codecs between raw NATS bytes and handler-declared types.
//!
//! Strings travel as UTF-8, the primitive numeric/bool types as fixed-width
//! little-endian, `Bytes` untouched, and everything else as JSON through the
//! [`Json`] wrapper. Naming conventions for JSON payloads live on the type's
//! own serde attributes.

use std::ops::{Deref, DerefMut};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A type that can be decoded from and encoded into a message payload.
pub trait Payload: Sized + Send + Sync + 'static {
    fn decode(bytes: &Bytes) -> Result<Self, DecodeError>;
    fn encode(&self) -> Result<Bytes, DecodeError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("expected {expected} byte(s) for {ty}, got {actual}")]
    Width {
        ty: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("invalid boolean byte {0:#04x}")]
    Bool(u8),
    #[error("JSON payload rejected: {0}")]
    Json(#[from] serde_json::Error),
}

/// Bounded lossy preview of a payload for log lines.
pub fn preview(bytes: &Bytes) -> String {
    const LIMIT: usize = 64;
    let cut = bytes.len().min(LIMIT);
    let mut text = String::from_utf8_lossy(&bytes[..cut]).into_owned();
    if bytes.len() > LIMIT {
        text.push_str("...");
    }
    text
}

impl Payload for String {
    fn decode(bytes: &Bytes) -> Result<Self, DecodeError> {
        Ok(std::str::from_utf8(bytes)?.to_owned())
    }

    fn encode(&self) -> Result<Bytes, DecodeError> {
        Ok(Bytes::copy_from_slice(self.as_bytes()))
    }
}

impl Payload for Bytes {
    fn decode(bytes: &Bytes) -> Result<Self, DecodeError> {
        Ok(bytes.clone())
    }

    fn encode(&self) -> Result<Bytes, DecodeError> {
        Ok(self.clone())
    }
}

impl Payload for bool {
    fn decode(bytes: &Bytes) -> Result<Self, DecodeError> {
        match bytes.as_ref() {
            [0] => Ok(false),
            [1] => Ok(true),
            [other] => Err(DecodeError::Bool(*other)),
            _ => Err(DecodeError::Width {
                ty: "bool",
                expected: 1,
                actual: bytes.len(),
            }),
        }
    }

    fn encode(&self) -> Result<Bytes, DecodeError> {
        Ok(Bytes::copy_from_slice(&[u8::from(*self)]))
    }
}

macro_rules! little_endian_payload {
    ($($ty:ty),+) => {
        $(
            impl Payload for $ty {
                fn decode(bytes: &Bytes) -> Result<Self, DecodeError> {
                    let raw: [u8; std::mem::size_of::<$ty>()] =
                        bytes.as_ref().try_into().map_err(|_| DecodeError::Width {
                            ty: stringify!($ty),
                            expected: std::mem::size_of::<$ty>(),
                            actual: bytes.len(),
                        })?;
                    Ok(<$ty>::from_le_bytes(raw))
                }

                fn encode(&self) -> Result<Bytes, DecodeError> {
                    Ok(Bytes::copy_from_slice(&self.to_le_bytes()))
                }
            }
        )+
    };
}

little_endian_payload!(i32, u32, i64, u64, f64);

/// JSON payload wrapper for arbitrary serde types.
///
/// The same shape as axum's `Json` extractor: the wrapper selects the codec,
/// the inner type is the handler's business.
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Json<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Json<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> From<T> for Json<T> {
    fn from(value: T) -> Self {
        Json(value)
    }
}

impl<T> Payload for Json<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn decode(bytes: &Bytes) -> Result<Self, DecodeError> {
        Ok(Json(serde_json::from_slice(bytes)?))
    }

    fn encode(&self) -> Result<Bytes, DecodeError> {
        Ok(serde_json::to_vec(&self.0)?.into())
    }
}
