//! The metadata-and-data mutating operations, expressed entirely through
//! the storage manager and the path resolver. One coarse per-mount lock
//! serializes the top-level operations; within one, every backend call is
//! a blocking synchronous call.

use crate::manager::{DirAction, FieldUpdate, StorageManager};
use kvfs_models::{FileObject, FsError, Metadata, ObjectStore, Payload, S_IFMT};
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::SystemTime;
use tracing::debug;

/// Static volume figures reported by `statfs`.
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub bsize: u32,
    pub blocks: u64,
    pub bavail: u64,
}

/// Splits an absolute path into its parent directory path and basename.
fn parent_and_name(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("/", path),
    }
}

/// The file-system operation layer over one mounted tree.
pub struct KvFs<S: ObjectStore> {
    storage: Mutex<StorageManager<S>>,
}

impl<S: ObjectStore> KvFs<S> {
    pub fn new(store: S, cache_capacity: NonZeroUsize) -> Self {
        KvFs {
            storage: Mutex::new(StorageManager::new(store, cache_capacity)),
        }
    }

    /// Runs `f` with the storage manager locked. Introspection hatch for
    /// tests and bridge plumbing; the file-system operations below are the
    /// real surface.
    pub fn with_storage<R>(&self, f: impl FnOnce(&mut StorageManager<S>) -> R) -> R {
        let mut storage = self.storage.lock();
        f(&mut *storage)
    }

    pub fn getattr(&self, path: &str) -> Result<Metadata, FsError> {
        let mut storage = self.storage.lock();
        Ok(storage.resolve(path)?.meta)
    }

    pub fn create(&self, path: &str, mode: u32, uid: u32, gid: u32) -> Result<FileObject, FsError> {
        debug!(path, mode, "create");
        let mut storage = self.storage.lock();
        let (parent_path, name) = parent_and_name(path);
        let mut parent = storage.resolve(parent_path)?;
        let child = storage.insert(FileObject::new_regular(name, mode, uid, gid))?;
        storage.update_directory(&mut parent, DirAction::add(&child)?)?;
        Ok(child)
    }

    pub fn mkdir(&self, path: &str, mode: u32, uid: u32, gid: u32) -> Result<FileObject, FsError> {
        debug!(path, mode, "mkdir");
        let mut storage = self.storage.lock();
        let (parent_path, name) = parent_and_name(path);
        let mut parent = storage.resolve(parent_path)?;
        let child = storage.insert(FileObject::new_directory(name, mode, uid, gid))?;
        storage.update_directory(&mut parent, DirAction::add(&child)?)?;
        // a new subdirectory's ".." adds one link to the parent
        let mut meta = parent.meta.clone();
        meta.nlink += 1;
        storage.update_field(&mut parent, FieldUpdate::Meta(meta))?;
        Ok(child)
    }

    /// Creates a symlink at `path` whose stored payload is the absolute
    /// `target` path as the host sees it.
    pub fn symlink(
        &self,
        path: &str,
        target: &str,
        uid: u32,
        gid: u32,
    ) -> Result<FileObject, FsError> {
        debug!(path, target, "symlink");
        let mut storage = self.storage.lock();
        let (parent_path, name) = parent_and_name(path);
        let mut parent = storage.resolve(parent_path)?;
        let child = storage.insert(FileObject::new_symlink(name, target, uid, gid))?;
        storage.update_directory(&mut parent, DirAction::add(&child)?)?;
        Ok(child)
    }

    /// Reads up to `size` bytes at `offset`; a short read past the end is
    /// permitted.
    pub fn read(&self, path: &str, size: u64, offset: u64) -> Result<Vec<u8>, FsError> {
        let mut storage = self.storage.lock();
        let object = storage.resolve(path)?;
        let bytes = object.bytes()?;
        let start = (offset as usize).min(bytes.len());
        let end = (start + size as usize).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    /// Splices `data` into the file at `offset`: covered bytes are
    /// overwritten, a gap past the current end is zero-filled, the tail is
    /// never shifted. `size` and `data` become visible together; the mount
    /// lock makes the two field write-throughs atomic to observers.
    pub fn write(&self, path: &str, data: &[u8], offset: u64) -> Result<usize, FsError> {
        debug!(path, offset, len = data.len(), "write");
        let mut storage = self.storage.lock();
        let mut object = storage.resolve(path)?;
        let mut bytes = object.bytes()?.clone();
        let offset = offset as usize;
        let end = offset + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset..end].copy_from_slice(data);
        let size = bytes.len() as u64;
        storage.update_field(&mut object, FieldUpdate::Data(Payload::Regular(bytes)))?;
        let mut meta = object.meta.clone();
        meta.size = size;
        storage.update_field(&mut object, FieldUpdate::Meta(meta))?;
        Ok(data.len())
    }

    /// Truncates or zero-extends the file to exactly `length` bytes.
    pub fn truncate(&self, path: &str, length: u64) -> Result<(), FsError> {
        debug!(path, length, "truncate");
        let mut storage = self.storage.lock();
        let mut object = storage.resolve(path)?;
        let mut bytes = object.bytes()?.clone();
        bytes.resize(length as usize, 0);
        storage.update_field(&mut object, FieldUpdate::Data(Payload::Regular(bytes)))?;
        let mut meta = object.meta.clone();
        meta.size = length;
        storage.update_field(&mut object, FieldUpdate::Meta(meta))?;
        Ok(())
    }

    /// Lists a directory: `"."`, `".."`, then the child names.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let mut storage = self.storage.lock();
        let dir = storage.resolve(path)?;
        let mut names = vec![".".to_string(), "..".to_string()];
        names.extend(dir.children()?.keys().cloned());
        Ok(names)
    }

    pub fn readlink(&self, path: &str) -> Result<String, FsError> {
        let mut storage = self.storage.lock();
        let object = storage.resolve(path)?;
        Ok(object.link_target()?.to_string())
    }

    /// Replaces the permission bits, keeping the kind bits untouched.
    pub fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError> {
        debug!(path, mode, "chmod");
        let mut storage = self.storage.lock();
        let mut object = storage.resolve(path)?;
        let mut meta = object.meta.clone();
        meta.mode = (meta.mode & S_IFMT) | (mode & !S_IFMT);
        storage.update_field(&mut object, FieldUpdate::Meta(meta))
    }

    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<(), FsError> {
        debug!(path, ?uid, ?gid, "chown");
        let mut storage = self.storage.lock();
        let mut object = storage.resolve(path)?;
        let mut meta = object.meta.clone();
        if let Some(uid) = uid {
            meta.uid = uid;
        }
        if let Some(gid) = gid {
            meta.gid = gid;
        }
        storage.update_field(&mut object, FieldUpdate::Meta(meta))
    }

    /// Sets access and modification times; an omitted time means now.
    pub fn utimens(
        &self,
        path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<(), FsError> {
        let mut storage = self.storage.lock();
        let mut object = storage.resolve(path)?;
        let now = SystemTime::now();
        let mut meta = object.meta.clone();
        meta.atime = atime.unwrap_or(now);
        meta.mtime = mtime.unwrap_or(now);
        storage.update_field(&mut object, FieldUpdate::Meta(meta))
    }

    pub fn setxattr(&self, path: &str, name: &str, value: &[u8]) -> Result<(), FsError> {
        let mut storage = self.storage.lock();
        let mut object = storage.resolve(path)?;
        let mut meta = object.meta.clone();
        meta.attrs.insert(name.to_string(), value.to_vec());
        storage.update_field(&mut object, FieldUpdate::Meta(meta))
    }

    /// An absent attribute reads as empty.
    pub fn getxattr(&self, path: &str, name: &str) -> Result<Vec<u8>, FsError> {
        let mut storage = self.storage.lock();
        let object = storage.resolve(path)?;
        Ok(object.meta.attrs.get(name).cloned().unwrap_or_default())
    }

    pub fn listxattr(&self, path: &str) -> Result<Vec<String>, FsError> {
        let mut storage = self.storage.lock();
        let object = storage.resolve(path)?;
        Ok(object.meta.attrs.keys().cloned().collect())
    }

    /// Removing an absent attribute is silent.
    pub fn removexattr(&self, path: &str, name: &str) -> Result<(), FsError> {
        let mut storage = self.storage.lock();
        let mut object = storage.resolve(path)?;
        let mut meta = object.meta.clone();
        meta.attrs.remove(name);
        storage.update_field(&mut object, FieldUpdate::Meta(meta))
    }

    /// Moves `old` to `new`. When both live in the same directory the child
    /// map is re-keyed in one atomic action; across directories the entry
    /// is removed, the object renamed, and the entry re-added, with
    /// directory link counts kept true when a subdirectory moves.
    pub fn rename(&self, old: &str, new: &str) -> Result<(), FsError> {
        debug!(old, new, "rename");
        let mut storage = self.storage.lock();
        let mut object = storage.resolve(old)?;
        let (old_parent_path, _) = parent_and_name(old);
        let (new_parent_path, new_name) = parent_and_name(new);
        let old_name = object.name.clone();

        if old_parent_path == new_parent_path {
            let mut parent = storage.resolve(old_parent_path)?;
            storage.update_field(&mut object, FieldUpdate::Name(new_name.to_string()))?;
            storage.update_directory(
                &mut parent,
                DirAction::Rename {
                    old_name,
                    new_name: new_name.to_string(),
                },
            )?;
            return Ok(());
        }

        let mut old_parent = storage.resolve(old_parent_path)?;
        storage.update_directory(&mut old_parent, DirAction::Remove { name: old_name })?;
        storage.update_field(&mut object, FieldUpdate::Name(new_name.to_string()))?;
        let mut new_parent = storage.resolve(new_parent_path)?;
        storage.update_directory(&mut new_parent, DirAction::add(&object)?)?;
        if object.is_dir() {
            let mut meta = old_parent.meta.clone();
            meta.nlink -= 1;
            storage.update_field(&mut old_parent, FieldUpdate::Meta(meta))?;
            let mut meta = new_parent.meta.clone();
            meta.nlink += 1;
            storage.update_field(&mut new_parent, FieldUpdate::Meta(meta))?;
        }
        Ok(())
    }

    /// Unlinks and deletes a non-directory. The parent's link count is
    /// untouched; only the file's own link count is affected by POSIX
    /// unlink semantics.
    pub fn unlink(&self, path: &str) -> Result<(), FsError> {
        debug!(path, "unlink");
        let mut storage = self.storage.lock();
        let object = storage.resolve(path)?;
        let (parent_path, _) = parent_and_name(path);
        let mut parent = storage.resolve(parent_path)?;
        storage.update_directory(
            &mut parent,
            DirAction::Remove {
                name: object.name.clone(),
            },
        )?;
        storage.remove(&object)
    }

    /// Unlinks and deletes a directory, decrementing the parent's link
    /// count. Emptiness is the caller's contract and is not checked here.
    pub fn rmdir(&self, path: &str) -> Result<(), FsError> {
        debug!(path, "rmdir");
        let mut storage = self.storage.lock();
        let object = storage.resolve(path)?;
        if !object.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let (parent_path, _) = parent_and_name(path);
        let mut parent = storage.resolve(parent_path)?;
        let mut meta = parent.meta.clone();
        meta.nlink -= 1;
        storage.update_field(&mut parent, FieldUpdate::Meta(meta))?;
        storage.update_directory(
            &mut parent,
            DirAction::Remove {
                name: object.name.clone(),
            },
        )?;
        storage.remove(&object)
    }

    pub fn statfs(&self) -> FsStats {
        FsStats {
            bsize: 512,
            blocks: 4096,
            bavail: 2048,
        }
    }
}
