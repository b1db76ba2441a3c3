//! Round-trippable serialization of a [`FileObject`] to the opaque byte
//! blob stored by the backend.

use crate::{FileObject, FsError};

pub fn encode(object: &FileObject) -> Result<Vec<u8>, FsError> {
    rmp_serde::to_vec(object).map_err(|e| FsError::MalformedObject(e.to_string()))
}

/// Decodes a blob previously produced by [`encode`]. Bytes that did not come
/// from the codec fail with [`FsError::MalformedObject`].
pub fn decode(blob: &[u8]) -> Result<FileObject, FsError> {
    rmp_serde::from_slice(blob).map_err(|e| FsError::MalformedObject(e.to_string()))
}
