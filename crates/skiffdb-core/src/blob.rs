use std::fmt;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// Marker property naming a value's object type inside a document body.
pub const OBJECT_TYPE_PROPERTY: &str = "@type";
/// `@type` value identifying a blob/attachment reference.
pub const OBJECT_TYPE_BLOB: &str = "blob";

/// Content-addressed key of a blob: the SHA-1 of its contents, rendered as
/// `sha1-BASE64`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobKey(pub [u8; 20]);

impl BlobKey {
    pub fn compute(data: &[u8]) -> Self {
        BlobKey(Sha1::digest(data).into())
    }

    pub fn parse(s: &str) -> Result<Self> {
        let b64 = s
            .strip_prefix("sha1-")
            .ok_or_else(|| Error::InvalidParameter(format!("bad blob digest '{s}'")))?;
        let bytes = STANDARD_NO_PAD
            .decode(b64)
            .map_err(|_| Error::InvalidParameter(format!("bad blob digest '{s}'")))?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| Error::InvalidParameter(format!("bad blob digest '{s}'")))?;
        Ok(BlobKey(arr))
    }

    pub fn verify(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha1-{}", STANDARD_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobKey({self})")
    }
}

/// Content-addressed attachment storage, consumed by the replicator.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, data: &[u8]) -> Result<BlobKey>;
    async fn get(&self, key: &BlobKey) -> Result<Option<Vec<u8>>>;
    async fn has(&self, key: &BlobKey) -> Result<bool>;
}

/// A blob reference found inside a document body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    /// Dotted key path of the containing dict.
    pub property: String,
    pub key: BlobKey,
    pub length: Option<u64>,
}

/// Walks a body tree collecting every `@type: blob` dict, pre-order.
pub fn find_blob_references(body: &Value) -> Vec<BlobRef> {
    let mut refs = Vec::new();
    walk(body, String::new(), &mut refs);
    refs
}

fn walk(value: &Value, path: String, refs: &mut Vec<BlobRef>) {
    match value {
        Value::Object(map) => {
            let is_blob = map
                .get(OBJECT_TYPE_PROPERTY)
                .and_then(Value::as_str)
                .is_some_and(|t| t == OBJECT_TYPE_BLOB);
            if is_blob
                && let Some(digest) = map.get("digest").and_then(Value::as_str)
                && let Ok(key) = BlobKey::parse(digest)
            {
                refs.push(BlobRef {
                    property: path.clone(),
                    key,
                    length: map.get("length").and_then(Value::as_u64),
                });
                return;
            }
            for (k, v) in map {
                let child = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{path}.{k}")
                };
                walk(v, child, refs);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                walk(v, format!("{path}[{i}]"), refs);
            }
        }
        _ => {}
    }
}
