//! In-process stand-in for the remote store, used by tests. It keeps the
//! wire's shape: values are encoded blobs keyed by the textual id, and the
//! root id lives under the same reserved key the HTTP adapter uses.

use kvfs_models::codec;
use kvfs_models::{FileObject, FsError, ObjectField, ObjectId, ObjectStore};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

const ROOT_KEY: &str = "root";

#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    gets: Mutex<HashMap<String, usize>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Makes every subsequent call fail with `BackendUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// How many times `get` was asked for this id.
    pub fn get_count(&self, id: ObjectId) -> usize {
        self.gets
            .lock()
            .unwrap()
            .get(&id.to_string())
            .copied()
            .unwrap_or(0)
    }

    /// Number of stored records, the reserved root key included.
    pub fn record_count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.blobs.lock().unwrap().contains_key(&id.to_string())
    }

    fn ensure_online(&self) -> Result<(), FsError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(FsError::BackendUnavailable("store is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl ObjectStore for MemoryStore {
    fn find_root(&self) -> Result<FileObject, FsError> {
        self.ensure_online()?;
        let root_id = {
            let blobs = self.blobs.lock().unwrap();
            blobs
                .get(ROOT_KEY)
                .map(|blob| {
                    let text = std::str::from_utf8(blob)
                        .map_err(|e| FsError::MalformedObject(e.to_string()))?;
                    ObjectId::from_str(text).map_err(|e| FsError::MalformedObject(e.to_string()))
                })
                .transpose()?
        };
        if let Some(root_id) = root_id {
            return self.get(root_id)?.ok_or_else(|| {
                FsError::MalformedObject("root key points at a missing object".to_string())
            });
        }
        let root = self.put(FileObject::new_root())?;
        let root_id = root.require_id()?;
        self.blobs
            .lock()
            .unwrap()
            .insert(ROOT_KEY.to_string(), root_id.to_string().into_bytes());
        Ok(root)
    }

    fn get(&self, id: ObjectId) -> Result<Option<FileObject>, FsError> {
        self.ensure_online()?;
        let key = id.to_string();
        *self.gets.lock().unwrap().entry(key.clone()).or_insert(0) += 1;
        let blobs = self.blobs.lock().unwrap();
        blobs.get(&key).map(|blob| codec::decode(blob)).transpose()
    }

    fn put(&self, mut object: FileObject) -> Result<FileObject, FsError> {
        self.ensure_online()?;
        let id = match object.id {
            Some(id) => id,
            None => {
                let id = ObjectId::new_v4();
                object.id = Some(id);
                id
            }
        };
        let blob = codec::encode(&object)?;
        self.blobs.lock().unwrap().insert(id.to_string(), blob);
        Ok(object)
    }

    fn update(&self, object: &FileObject, _field: ObjectField) -> Result<(), FsError> {
        self.ensure_online()?;
        let id = object.require_id()?;
        let blob = codec::encode(object)?;
        self.blobs.lock().unwrap().insert(id.to_string(), blob);
        Ok(())
    }

    fn delete(&self, id: ObjectId) -> Result<(), FsError> {
        self.ensure_online()?;
        self.blobs.lock().unwrap().remove(&id.to_string());
        Ok(())
    }
}
