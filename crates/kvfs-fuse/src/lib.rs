//! Translates `fuser` callbacks into calls on the file-system operation
//! layer. The operation layer speaks paths while the kernel speaks inodes,
//! so the bridge keeps a private inode-to-path table; it is bridge-local
//! state, never persisted.

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use kvfs_models::{FsError, Metadata, ObjectStore, S_IFDIR, S_IFLNK, S_IFMT};
use kvfs_store::KvFs;
use libc::{EINVAL, ENOENT, ENOSYS, ERANGE};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

const TTL_FILE: Duration = Duration::from_secs(7);
const TTL_DIR: Duration = Duration::from_secs(3);
const ROOT_INO: u64 = 1;

fn map_error(error: &FsError) -> libc::c_int {
    use libc::{EIO, ENOSPC, ENOTDIR};
    match error {
        FsError::NotFound => ENOENT,
        FsError::NotDirectory => ENOTDIR,
        FsError::WrongKind => EINVAL,
        FsError::BackendUnavailable(reason) => {
            warn!(reason, "backend unavailable");
            EIO
        }
        FsError::MalformedObject(reason) => {
            warn!(reason, "malformed object");
            EIO
        }
        FsError::CapacityExceeded => ENOSPC,
    }
}

#[inline]
fn meta_to_attr(meta: &Metadata, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: meta.size,
        blocks: (meta.size + 511) / 512, // 512-byte blocks per POSIX
        atime: meta.atime,
        mtime: meta.mtime,
        ctime: meta.ctime,
        crtime: meta.ctime,
        kind: match meta.mode & S_IFMT {
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::Symlink,
            _ => FileType::RegularFile,
        },
        perm: (meta.mode & 0o7777) as u16,
        nlink: meta.nlink,
        uid: meta.uid,
        gid: meta.gid,
        rdev: 0,
        flags: 0,
        blksize: 512,
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Inode-to-path bookkeeping. Inode numbers are stable for as long as the
/// path exists under that name; a rename carries them over.
struct InodeTable {
    paths: HashMap<u64, String>,
    inos: HashMap<String, u64>,
    next_ino: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = InodeTable {
            paths: HashMap::new(),
            inos: HashMap::new(),
            next_ino: ROOT_INO + 1,
        };
        table.paths.insert(ROOT_INO, "/".to_string());
        table.inos.insert("/".to_string(), ROOT_INO);
        table
    }

    fn path(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).cloned()
    }

    fn assign(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.inos.get(path) {
            return *ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.paths.insert(ino, path.to_string());
        self.inos.insert(path.to_string(), ino);
        ino
    }

    fn forget_path(&mut self, path: &str) {
        if let Some(ino) = self.inos.remove(path) {
            self.paths.remove(&ino);
        }
    }

    /// Rewrites every mapping at or under `old` to live under `new`,
    /// keeping inode numbers stable across the rename.
    fn rename_prefix(&mut self, old: &str, new: &str) {
        let moved: Vec<(String, u64)> = self
            .inos
            .iter()
            .filter(|(path, _)| {
                path.as_str() == old || path.starts_with(&format!("{old}/"))
            })
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();
        for (path, ino) in moved {
            self.inos.remove(&path);
            let rewritten = format!("{new}{}", &path[old.len()..]);
            self.paths.insert(ino, rewritten.clone());
            self.inos.insert(rewritten, ino);
        }
    }
}

pub struct FuseFs<S: ObjectStore> {
    fs: KvFs<S>,
    inodes: InodeTable,
    next_fh: u64,
}

impl<S: ObjectStore> FuseFs<S> {
    pub fn new(fs: KvFs<S>) -> Self {
        FuseFs {
            fs,
            inodes: InodeTable::new(),
            next_fh: 3,
        }
    }

    fn allocate_fh(&mut self) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        fh
    }

    fn attr_for(&mut self, path: &str) -> Result<FileAttr, FsError> {
        let meta = self.fs.getattr(path)?;
        let ino = self.inodes.assign(path);
        Ok(meta_to_attr(&meta, ino))
    }
}

impl<S: ObjectStore> Filesystem for FuseFs<S> {
    fn destroy(&mut self) {
        info!("bridge destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.inodes.path(parent) else {
            reply.error(ENOENT);
            return;
        };
        let path = child_path(&parent_path, &name.to_string_lossy());
        match self.attr_for(&path) {
            Ok(attr) => reply.entry(&TTL_FILE, &attr, 0),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.attr_for(&path) {
            Ok(attr) => {
                let ttl = if attr.kind == FileType::Directory {
                    TTL_DIR
                } else {
                    TTL_FILE
                };
                reply.attr(&ttl, &attr);
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        let specific = |t: TimeOrNow| match t {
            TimeOrNow::SpecificTime(t) => Some(t),
            TimeOrNow::Now => None, // the operation layer defaults to now
        };
        let result = (|| {
            if let Some(mode) = mode {
                self.fs.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.fs.chown(&path, uid, gid)?;
            }
            if let Some(size) = size {
                self.fs.truncate(&path, size)?;
            }
            if atime.is_some() || mtime.is_some() {
                self.fs
                    .utimens(&path, atime.and_then(specific), mtime.and_then(specific))?;
            }
            Ok(())
        })();
        match result.and_then(|()| self.attr_for(&path)) {
            Ok(attr) => {
                let ttl = if attr.kind == FileType::Directory {
                    TTL_DIR
                } else {
                    TTL_FILE
                };
                reply.attr(&ttl, &attr);
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.inodes.path(parent) else {
            reply.error(ENOENT);
            return;
        };
        let path = child_path(&parent_path, &name.to_string_lossy());
        match self
            .fs
            .create(&path, mode, req.uid(), req.gid())
            .and_then(|_| self.attr_for(&path))
        {
            Ok(attr) => {
                let fh = self.allocate_fh();
                reply.created(&TTL_FILE, &attr, 0, fh, 0);
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.inodes.path(parent) else {
            reply.error(ENOENT);
            return;
        };
        let path = child_path(&parent_path, &name.to_string_lossy());
        match self
            .fs
            .mkdir(&path, mode, req.uid(), req.gid())
            .and_then(|_| self.attr_for(&path))
        {
            Ok(attr) => reply.entry(&TTL_DIR, &attr, 0),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.inodes.path(parent) else {
            reply.error(ENOENT);
            return;
        };
        let path = child_path(&parent_path, &link_name.to_string_lossy());
        match self
            .fs
            .symlink(&path, &target.to_string_lossy(), req.uid(), req.gid())
            .and_then(|_| self.attr_for(&path))
        {
            Ok(attr) => reply.entry(&TTL_FILE, &attr, 0),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.readlink(&path) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.inodes.path(parent) else {
            reply.error(ENOENT);
            return;
        };
        let path = child_path(&parent_path, &name.to_string_lossy());
        match self.fs.unlink(&path) {
            Ok(()) => {
                self.inodes.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.inodes.path(parent) else {
            reply.error(ENOENT);
            return;
        };
        let path = child_path(&parent_path, &name.to_string_lossy());
        match self.fs.rmdir(&path) {
            Ok(()) => {
                self.inodes.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(old_parent_path), Some(new_parent_path)) =
            (self.inodes.path(parent), self.inodes.path(new_parent))
        else {
            reply.error(ENOENT);
            return;
        };
        let old = child_path(&old_parent_path, &name.to_string_lossy());
        let new = child_path(&new_parent_path, &new_name.to_string_lossy());
        match self.fs.rename(&old, &new) {
            Ok(()) => {
                self.inodes.forget_path(&new); // a replaced target is gone
                self.inodes.rename_prefix(&old, &new);
                reply.ok();
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        let fh = self.allocate_fh();
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.read(&path, size as u64, offset as u64) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.write(&path, data, offset as u64) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        // every write is already written through
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        let names = match self.fs.readdir(&path) {
            Ok(names) => names,
            Err(e) => {
                reply.error(map_error(&e));
                return;
            }
        };
        for (i, name) in names.iter().enumerate().skip(offset.max(0) as usize) {
            let name = name.as_str();
            let cookie = (i + 1) as i64;
            let full = if name == "." || name == ".." {
                // dot entries point back into already-known directories
                if reply.add(ino, cookie, FileType::Directory, name) {
                    break;
                }
                continue;
            } else {
                child_path(&path, name)
            };
            match self.attr_for(&full) {
                Ok(attr) => {
                    if reply.add(attr.ino, cookie, attr.kind, name) {
                        break;
                    }
                }
                Err(e) => {
                    reply.error(map_error(&e));
                    return;
                }
            }
        }
        reply.ok();
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.setxattr(&path, &name.to_string_lossy(), value) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.getxattr(&path, &name.to_string_lossy()) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if value.len() <= size as usize {
                    reply.data(&value);
                } else {
                    reply.error(ERANGE);
                }
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.listxattr(&path) {
            Ok(names) => {
                let mut packed = Vec::new();
                for name in names {
                    packed.extend_from_slice(name.as_bytes());
                    packed.push(0);
                }
                if size == 0 {
                    reply.size(packed.len() as u32);
                } else if packed.len() <= size as usize {
                    reply.data(&packed);
                } else {
                    reply.error(ERANGE);
                }
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.removexattr(&path, &name.to_string_lossy()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stats = self.fs.statfs();
        reply.statfs(
            stats.blocks,
            stats.bavail,
            stats.bavail,
            0,
            0,
            stats.bsize,
            255,
            stats.bsize,
        );
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        // mode bits are stored, not enforced
        reply.ok();
    }

    // hard links are out of scope
    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _new_parent: u64,
        _new_name: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(ENOSYS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_table_assigns_stable_numbers() {
        let mut t = InodeTable::new();
        assert_eq!(t.path(ROOT_INO).as_deref(), Some("/"));
        let a = t.assign("/a");
        assert_eq!(t.assign("/a"), a);
        let b = t.assign("/a/b");
        assert_ne!(a, b);
        assert_eq!(t.path(b).as_deref(), Some("/a/b"));
    }

    #[test]
    fn rename_prefix_rewrites_the_whole_subtree() {
        let mut t = InodeTable::new();
        let a = t.assign("/a");
        let b = t.assign("/a/b");
        let deep = t.assign("/a/b/c");
        let other = t.assign("/ab"); // shares a textual prefix, not a path prefix

        t.rename_prefix("/a", "/z");
        assert_eq!(t.path(a).as_deref(), Some("/z"));
        assert_eq!(t.path(b).as_deref(), Some("/z/b"));
        assert_eq!(t.path(deep).as_deref(), Some("/z/b/c"));
        assert_eq!(t.path(other).as_deref(), Some("/ab"));
        assert_eq!(t.assign("/z/b"), b);
    }

    #[test]
    fn forget_path_drops_both_directions() {
        let mut t = InodeTable::new();
        let a = t.assign("/a");
        t.forget_path("/a");
        assert_eq!(t.path(a), None);
        assert_ne!(t.assign("/a"), a); // a fresh number after forgetting
    }

    #[test]
    fn child_path_joins_against_the_root() {
        assert_eq!(child_path("/", "a"), "/a");
        assert_eq!(child_path("/a", "b"), "/a/b");
    }
}
