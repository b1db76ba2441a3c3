pub mod codec;

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::collections::BTreeMap;
use std::time::SystemTime;
use thiserror::Error;

/// Opaque stable handle for a stored object; its textual form is the backend key.
pub type ObjectId = uuid::Uuid;

// Kind bits, as found in the top bits of st_mode.
pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ObjectKind {
    Regular = 0,
    Directory = 1,
    Symlink = 2,
}

impl ObjectKind {
    pub fn mode_bits(self) -> u32 {
        match self {
            ObjectKind::Regular => S_IFREG,
            ObjectKind::Directory => S_IFDIR,
            ObjectKind::Symlink => S_IFLNK,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub mode: u32, // kind bits in the S_IFMT range plus permission bits
    pub nlink: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub attrs: BTreeMap<String, Vec<u8>>, // named extended attributes
}

impl Metadata {
    pub fn new(kind: ObjectKind, perm: u32, nlink: u32, uid: u32, gid: u32) -> Self {
        let now = SystemTime::now();
        Metadata {
            mode: kind.mode_bits() | (perm & !S_IFMT),
            nlink,
            size: 0,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
            attrs: BTreeMap::new(),
        }
    }
}

/// Kind-dependent payload of an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Regular(Vec<u8>),
    Directory(BTreeMap<String, ObjectId>),
    Symlink(String),
}

/// A single file-system node: regular file, directory, or symlink.
///
/// `id` is `None` only between construction and insertion into the backend;
/// every object handed out by the store carries its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileObject {
    pub id: Option<ObjectId>,
    pub name: String,
    pub kind: ObjectKind,
    pub meta: Metadata,
    pub data: Payload,
}

impl FileObject {
    pub fn new_regular(name: &str, perm: u32, uid: u32, gid: u32) -> Self {
        FileObject {
            id: None,
            name: name.to_string(),
            kind: ObjectKind::Regular,
            meta: Metadata::new(ObjectKind::Regular, perm, 1, uid, gid),
            data: Payload::Regular(Vec::new()),
        }
    }

    pub fn new_directory(name: &str, perm: u32, uid: u32, gid: u32) -> Self {
        FileObject {
            id: None,
            name: name.to_string(),
            kind: ObjectKind::Directory,
            meta: Metadata::new(ObjectKind::Directory, perm, 2, uid, gid),
            data: Payload::Directory(BTreeMap::new()),
        }
    }

    pub fn new_symlink(name: &str, target: &str, uid: u32, gid: u32) -> Self {
        let mut meta = Metadata::new(ObjectKind::Symlink, 0o777, 1, uid, gid);
        meta.size = target.len() as u64;
        FileObject {
            id: None,
            name: name.to_string(),
            kind: ObjectKind::Symlink,
            meta,
            data: Payload::Symlink(target.to_string()),
        }
    }

    /// The root is the unique directory named `/`.
    pub fn new_root() -> Self {
        FileObject::new_directory("/", 0o755, 0, 0)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == ObjectKind::Directory
    }

    pub fn require_id(&self) -> Result<ObjectId, FsError> {
        self.id
            .ok_or_else(|| FsError::MalformedObject("object has no id".to_string()))
    }

    pub fn children(&self) -> Result<&BTreeMap<String, ObjectId>, FsError> {
        match &self.data {
            Payload::Directory(children) => Ok(children),
            _ => Err(FsError::NotDirectory),
        }
    }

    pub fn children_mut(&mut self) -> Result<&mut BTreeMap<String, ObjectId>, FsError> {
        match &mut self.data {
            Payload::Directory(children) => Ok(children),
            _ => Err(FsError::NotDirectory),
        }
    }

    pub fn bytes(&self) -> Result<&Vec<u8>, FsError> {
        match &self.data {
            Payload::Regular(bytes) => Ok(bytes),
            _ => Err(FsError::WrongKind),
        }
    }

    pub fn bytes_mut(&mut self) -> Result<&mut Vec<u8>, FsError> {
        match &mut self.data {
            Payload::Regular(bytes) => Ok(bytes),
            _ => Err(FsError::WrongKind),
        }
    }

    pub fn link_target(&self) -> Result<&str, FsError> {
        match &self.data {
            Payload::Symlink(target) => Ok(target),
            _ => Err(FsError::WrongKind),
        }
    }
}

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotDirectory,
    #[error("operation not valid for this object kind")]
    WrongKind,
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("malformed object: {0}")]
    MalformedObject(String),
    #[error("capacity exceeded")]
    CapacityExceeded,
}

/// Field selector for partial updates. Backends that can patch a single
/// field use it as such; key/value backends store the whole object again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectField {
    Name,
    Kind,
    Meta,
    Data,
}

/// Stateless request/response adapter to the remote object store.
///
/// All calls are synchronous; transport failures surface as
/// [`FsError::BackendUnavailable`]. `put` is the only path that assigns ids.
pub trait ObjectStore: Send {
    /// One-time root discovery. Creates the root directory on a fresh
    /// backend and returns it.
    fn find_root(&self) -> Result<FileObject, FsError>;

    /// Primary-key lookup; `None` is a confirmed absence, not an error.
    fn get(&self, id: ObjectId) -> Result<Option<FileObject>, FsError>;

    /// Stores the object, allocating an id when it has none, and returns
    /// the stored object with its id set.
    fn put(&self, object: FileObject) -> Result<FileObject, FsError>;

    /// Writes the object back after a single-field mutation. `field` names
    /// the changed field.
    fn update(&self, object: &FileObject, field: ObjectField) -> Result<(), FsError>;

    fn delete(&self, id: ObjectId) -> Result<(), FsError>;
}
