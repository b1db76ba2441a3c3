//! Walks a textual absolute path from the root object through directory
//! child maps. Every hop goes through [`StorageManager::fetch`], so each
//! resolved component promotes its object in the cache.

use crate::manager::StorageManager;
use kvfs_models::{FileObject, FsError, ObjectStore};

impl<S: ObjectStore> StorageManager<S> {
    /// Resolves an absolute `/`-separated path to its object.
    ///
    /// `/a/b/` resolves like `/a/b`; an empty internal component is a
    /// failure. A non-directory met before the last component fails with
    /// `NotDirectory`.
    pub fn resolve(&mut self, path: &str) -> Result<FileObject, FsError> {
        let root = self.root()?;
        if path == "/" {
            return Ok(root);
        }
        if !path.starts_with('/') {
            return Err(FsError::NotFound);
        }

        let mut parts: Vec<&str> = path.split('/').skip(1).collect();
        if parts.last() == Some(&"") {
            parts.pop();
        }

        let mut context = root;
        let count = parts.len();
        for (i, name) in parts.iter().enumerate() {
            let child_id = *context.children()?.get(*name).ok_or(FsError::NotFound)?;
            let child = self.fetch(child_id)?;
            if i + 1 == count {
                return Ok(child);
            }
            if !child.is_dir() {
                return Err(FsError::NotDirectory);
            }
            context = child;
        }
        Ok(context)
    }
}
