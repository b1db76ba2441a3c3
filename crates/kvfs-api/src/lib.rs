pub mod stub;

pub use stub::MemoryStore;

use bytes::Bytes;
use kvfs_models::codec;
use kvfs_models::{FileObject, FsError, ObjectField, ObjectId, ObjectStore};
use reqwest::{Client, Method, StatusCode, Url};
use std::str::FromStr;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

/// Reserved key holding the root object's id. Object keys are textual
/// UUIDs, so this key cannot collide with one.
const ROOT_KEY: &str = "root";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP adapter to the remote key/value store.
///
/// The wire contract is `PUT/GET/DELETE /kv/{key}` with raw blob bodies;
/// a 404 on GET is the confirmed-absence sentinel. The store itself is a
/// dumb key/value server, so ids are allocated here on `put`.
pub struct HttpStore {
    runtime: Runtime, // drives the async client from synchronous callers
    base_url: Url,
    client: Client,
}

impl HttpStore {
    pub fn new(base_url: &str) -> Result<Self, FsError> {
        let base_url =
            Url::from_str(base_url).map_err(|e| FsError::BackendUnavailable(e.to_string()))?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| FsError::BackendUnavailable(e.to_string()))?;
        let runtime = Runtime::new().map_err(|e| FsError::BackendUnavailable(e.to_string()))?;
        Ok(HttpStore {
            runtime,
            base_url,
            client,
        })
    }

    fn key_url(&self, key: &str) -> Result<Url, FsError> {
        self.base_url
            .join(&format!("kv/{key}"))
            .map_err(|e| FsError::BackendUnavailable(e.to_string()))
    }

    fn get_raw(&self, key: &str) -> Result<Option<Bytes>, FsError> {
        let url = self.key_url(key)?;
        let resp = self
            .runtime
            .block_on(async { self.client.get(url).send().await })
            .map_err(|e| FsError::BackendUnavailable(e.to_string()))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = self
                    .runtime
                    .block_on(async { resp.bytes().await })
                    .map_err(|e| FsError::BackendUnavailable(e.to_string()))?;
                Ok(Some(body))
            }
            status => {
                warn!(%key, %status, "unexpected status on get");
                Err(FsError::BackendUnavailable(format!(
                    "get {key}: unexpected status {status}"
                )))
            }
        }
    }

    fn request_no_response(
        &self,
        method: Method,
        key: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(), FsError> {
        let url = self.key_url(key)?;
        let mut req = self.client.request(method.clone(), url);
        if let Some(body) = body {
            req = req.body(body);
        }
        let resp = self
            .runtime
            .block_on(async { req.send().await })
            .map_err(|e| FsError::BackendUnavailable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            warn!(%key, %method, status = %resp.status(), "unexpected status");
            Err(FsError::BackendUnavailable(format!(
                "{method} {key}: unexpected status {}",
                resp.status()
            )))
        }
    }

    fn put_raw(&self, key: &str, blob: Vec<u8>) -> Result<(), FsError> {
        self.request_no_response(Method::PUT, key, Some(blob))
    }

    fn delete_raw(&self, key: &str) -> Result<(), FsError> {
        self.request_no_response(Method::DELETE, key, None)
    }
}

impl ObjectStore for HttpStore {
    fn find_root(&self) -> Result<FileObject, FsError> {
        if let Some(blob) = self.get_raw(ROOT_KEY)? {
            let text = std::str::from_utf8(&blob)
                .map_err(|e| FsError::MalformedObject(e.to_string()))?;
            let root_id =
                ObjectId::from_str(text).map_err(|e| FsError::MalformedObject(e.to_string()))?;
            debug!(%root_id, "root exists, loading it");
            return self.get(root_id)?.ok_or_else(|| {
                FsError::MalformedObject("root key points at a missing object".to_string())
            });
        }
        debug!("no root exists, creating one");
        let root = self.put(FileObject::new_root())?;
        let root_id = root.require_id()?;
        self.put_raw(ROOT_KEY, root_id.to_string().into_bytes())?;
        Ok(root)
    }

    fn get(&self, id: ObjectId) -> Result<Option<FileObject>, FsError> {
        let Some(blob) = self.get_raw(&id.to_string())? else {
            return Ok(None);
        };
        let object = codec::decode(&blob)?;
        // a buggy backend handing back the wrong record is fatal to this
        // operation only
        if object.id != Some(id) {
            return Err(FsError::MalformedObject(format!(
                "decoded object id {:?} mismatches key {id}",
                object.id
            )));
        }
        Ok(Some(object))
    }

    fn put(&self, mut object: FileObject) -> Result<FileObject, FsError> {
        let id = match object.id {
            Some(id) => id,
            None => {
                let id = ObjectId::new_v4();
                object.id = Some(id);
                id
            }
        };
        self.put_raw(&id.to_string(), codec::encode(&object)?)?;
        Ok(object)
    }

    fn update(&self, object: &FileObject, field: ObjectField) -> Result<(), FsError> {
        // the field hint is for backends that can patch in place; the
        // key/value wire always stores the whole blob again
        let id = object.require_id()?;
        debug!(%id, ?field, "write-through");
        self.put_raw(&id.to_string(), codec::encode(object)?)
    }

    fn delete(&self, id: ObjectId) -> Result<(), FsError> {
        self.delete_raw(&id.to_string())
    }
}
