//! Cached payloads, their size heuristic and on-disk encoding

use std::any::Any;
use std::io::Cursor;
use std::sync::Arc;

use image::{ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};

use super::CacheError;
use crate::pdf::Bitmap;

/// Size charged for values whose footprint cannot be inspected
pub const DEFAULT_SIZE_ESTIMATE: usize = 1024;

/// A value stored in the two-tier cache
#[derive(Clone)]
pub enum CacheValue {
    Bitmap(Arc<Bitmap>),
    Text(String),
    Bytes(Vec<u8>),
    Structured(serde_json::Value),
    /// Arbitrary in-process value; memory tier only
    Opaque(Arc<dyn Any + Send + Sync>),
}

/// Type tag recorded in the disk manifest
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Bitmap,
    Blob,
}

/// Serialized form of every non-bitmap persistable value
#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
enum Blob {
    Text(String),
    Bytes(Vec<u8>),
    Structured(serde_json::Value),
}

impl CacheValue {
    /// Type-aware size heuristic used for the byte bound
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        match self {
            Self::Bitmap(bitmap) => bitmap.byte_size(),
            Self::Text(text) => text.len(),
            Self::Bytes(bytes) => bytes.len(),
            Self::Structured(value) => serde_json::to_vec(value)
                .map(|v| v.len())
                .unwrap_or(DEFAULT_SIZE_ESTIMATE),
            Self::Opaque(_) => DEFAULT_SIZE_ESTIMATE,
        }
    }

    #[must_use]
    pub fn as_bitmap(&self) -> Option<&Arc<Bitmap>> {
        match self {
            Self::Bitmap(bitmap) => Some(bitmap),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_structured(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Structured(value) => Some(value),
            _ => None,
        }
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Self::Opaque(value) => Arc::clone(value).downcast::<T>().ok(),
            _ => None,
        }
    }

    /// Encode for the disk tier
    pub(crate) fn encode(&self) -> Result<(PayloadKind, Vec<u8>), CacheError> {
        match self {
            Self::Bitmap(bitmap) => {
                let image = RgbaImage::from_raw(bitmap.width, bitmap.height, bitmap.pixels.clone())
                    .ok_or_else(|| CacheError::Corrupt("bitmap buffer size mismatch".into()))?;
                let mut buf = Cursor::new(Vec::new());
                image.write_to(&mut buf, ImageFormat::Png)?;
                Ok((PayloadKind::Bitmap, buf.into_inner()))
            }
            Self::Text(text) => Ok((PayloadKind::Blob, serde_json::to_vec(&Blob::Text(text.clone()))?)),
            Self::Bytes(bytes) => Ok((PayloadKind::Blob, serde_json::to_vec(&Blob::Bytes(bytes.clone()))?)),
            Self::Structured(value) => Ok((
                PayloadKind::Blob,
                serde_json::to_vec(&Blob::Structured(value.clone()))?,
            )),
            Self::Opaque(_) => Err(CacheError::NotPersistable),
        }
    }

    /// Decode a payload read back from the disk tier
    pub(crate) fn decode(kind: PayloadKind, data: &[u8]) -> Result<Self, CacheError> {
        match kind {
            PayloadKind::Bitmap => {
                let image = image::load_from_memory_with_format(data, ImageFormat::Png)?.into_rgba8();
                let (width, height) = image.dimensions();
                let bitmap = Bitmap::from_rgba(width, height, image.into_raw())
                    .ok_or_else(|| CacheError::Corrupt("decoded bitmap size mismatch".into()))?;
                Ok(Self::Bitmap(Arc::new(bitmap)))
            }
            PayloadKind::Blob => Ok(match serde_json::from_slice::<Blob>(data)? {
                Blob::Text(text) => Self::Text(text),
                Blob::Bytes(bytes) => Self::Bytes(bytes),
                Blob::Structured(value) => Self::Structured(value),
            }),
        }
    }
}

impl PartialEq for CacheValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bitmap(a), Self::Bitmap(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Structured(a), Self::Structured(b)) => a == b,
            (Self::Opaque(a), Self::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for CacheValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bitmap(bitmap) => f.debug_tuple("Bitmap").field(bitmap).finish(),
            Self::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Structured(value) => f.debug_tuple("Structured").field(value).finish(),
            Self::Opaque(_) => f.write_str("Opaque(..)"),
        }
    }
}

impl From<Bitmap> for CacheValue {
    fn from(bitmap: Bitmap) -> Self {
        Self::Bitmap(Arc::new(bitmap))
    }
}

impl From<Arc<Bitmap>> for CacheValue {
    fn from(bitmap: Arc<Bitmap>) -> Self {
        Self::Bitmap(bitmap)
    }
}

impl From<String> for CacheValue {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for CacheValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<serde_json::Value> for CacheValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Structured(value)
    }
}
