use kvfs_cache::{CacheSlot, ObjectCache};
use kvfs_models::{
    FileObject, FsError, Metadata, ObjectField, ObjectId, ObjectKind, ObjectStore, Payload,
};
use std::num::NonZeroUsize;
use tracing::{debug, trace};

/// A single-field mutation, applied to the in-memory copy and then written
/// through to the backend.
#[derive(Debug, Clone)]
pub enum FieldUpdate {
    Name(String),
    Kind(ObjectKind),
    Meta(Metadata),
    Data(Payload),
}

impl FieldUpdate {
    fn field(&self) -> ObjectField {
        match self {
            FieldUpdate::Name(_) => ObjectField::Name,
            FieldUpdate::Kind(_) => ObjectField::Kind,
            FieldUpdate::Meta(_) => ObjectField::Meta,
            FieldUpdate::Data(_) => ObjectField::Data,
        }
    }

    fn apply(&self, object: &mut FileObject) {
        match self {
            FieldUpdate::Name(name) => object.name = name.clone(),
            FieldUpdate::Kind(kind) => object.kind = *kind,
            FieldUpdate::Meta(meta) => object.meta = meta.clone(),
            FieldUpdate::Data(data) => object.data = data.clone(),
        }
    }
}

/// Mutation of a directory's child map.
#[derive(Debug, Clone)]
pub enum DirAction {
    /// Links a child under its name; an existing entry is overwritten.
    Add { name: String, id: ObjectId },
    /// Unlinks a child; fails with `NotFound` when the name is absent.
    Remove { name: String },
    /// Re-keys a child in place; fails with `NotFound` when `old_name`
    /// is absent.
    Rename { old_name: String, new_name: String },
}

impl DirAction {
    pub fn add(child: &FileObject) -> Result<DirAction, FsError> {
        Ok(DirAction::Add {
            name: child.name.clone(),
            id: child.require_id()?,
        })
    }
}

/// Composes cache and backend into a coherent read-through / write-through
/// store. The backend is the single source of truth; the cache is a
/// read-only shadow of it.
///
/// Every write path follows the same discipline: cache-invalidate, mutate
/// the in-memory copy, cache-insert, backend-write. A failed backend write
/// is not rolled back; the error propagates and the operation aborts.
pub struct StorageManager<S: ObjectStore> {
    store: S,
    cache: ObjectCache,
    root_id: Option<ObjectId>,
}

impl<S: ObjectStore> StorageManager<S> {
    pub fn new(store: S, cache_capacity: NonZeroUsize) -> Self {
        StorageManager {
            store,
            cache: ObjectCache::new(cache_capacity),
            root_id: None,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Non-promoting cache inspection.
    pub fn cached(&self, id: ObjectId) -> Option<&CacheSlot> {
        self.cache.peek(&id)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// The root directory. Discovered (or created) on first use, then
    /// served through the cache like any other object.
    pub fn root(&mut self) -> Result<FileObject, FsError> {
        if let Some(root_id) = self.root_id {
            return self.fetch(root_id);
        }
        let root = self.store.find_root()?;
        let root_id = root.require_id()?;
        debug!(%root_id, "root discovered");
        self.root_id = Some(root_id);
        self.cache.put(root_id, CacheSlot::Live(root.clone()));
        Ok(root)
    }

    /// Returns the object for `id`, consulting the backend on a cache miss
    /// and remembering the outcome either way: a live entry, or a tombstone
    /// for a confirmed absence. Tombstones surface as `NotFound`.
    pub fn fetch(&mut self, id: ObjectId) -> Result<FileObject, FsError> {
        match self.cache.get(&id) {
            Some(CacheSlot::Live(object)) => return Ok(object.clone()),
            Some(CacheSlot::Tombstone) => return Err(FsError::NotFound),
            None => {}
        }
        trace!(%id, "cache miss");
        let found = self.store.get(id)?;
        let slot = match &found {
            Some(object) => CacheSlot::Live(object.clone()),
            None => CacheSlot::Tombstone,
        };
        self.cache.put(id, slot);
        found.ok_or(FsError::NotFound)
    }

    /// Stores a freshly constructed object and returns it with its id set.
    /// Linking it under a parent is the caller's business, in the same
    /// logical operation.
    pub fn insert(&mut self, object: FileObject) -> Result<FileObject, FsError> {
        let stored = self.store.put(object)?;
        let id = stored.require_id()?;
        trace!(%id, name = %stored.name, "inserted");
        self.cache.put(id, CacheSlot::Live(stored.clone()));
        Ok(stored)
    }

    /// Applies a single-field mutation to `object` and writes it through.
    /// The cache entry is invalidated before the local mutation so a
    /// concurrent fetch cannot promote a stale entry.
    pub fn update_field(
        &mut self,
        object: &mut FileObject,
        update: FieldUpdate,
    ) -> Result<(), FsError> {
        let id = object.require_id()?;
        self.cache.delete(&id);
        update.apply(object);
        self.cache.put(id, CacheSlot::Live(object.clone()));
        self.store.update(object, update.field())
    }

    /// Mutates a directory's child map per `action` and writes the `data`
    /// field through.
    pub fn update_directory(
        &mut self,
        dir: &mut FileObject,
        action: DirAction,
    ) -> Result<(), FsError> {
        if !dir.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let id = dir.require_id()?;
        self.cache.delete(&id);
        {
            let children = dir.children_mut()?;
            match &action {
                DirAction::Add { name, id } => {
                    children.insert(name.clone(), *id);
                }
                DirAction::Remove { name } => {
                    children.remove(name).ok_or(FsError::NotFound)?;
                }
                DirAction::Rename { old_name, new_name } => {
                    let child_id = children.remove(old_name).ok_or(FsError::NotFound)?;
                    children.insert(new_name.clone(), child_id);
                }
            }
        }
        self.cache.put(id, CacheSlot::Live(dir.clone()));
        self.store.update(dir, ObjectField::Data)
    }

    /// Deletes the object from the backend, then invalidates its cache
    /// entry. Unlinking from the parent happens first, at the caller.
    pub fn remove(&mut self, object: &FileObject) -> Result<(), FsError> {
        let id = object.require_id()?;
        self.store.delete(id)?;
        self.cache.delete(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvfs_api::MemoryStore;
    use kvfs_models::FileObject;

    fn manager(capacity: usize) -> StorageManager<MemoryStore> {
        StorageManager::new(MemoryStore::new(), NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn fetch_reads_through_and_caches() {
        let mut m = manager(8);
        let stored = m.insert(FileObject::new_regular("f", 0o644, 0, 0)).unwrap();
        let id = stored.require_id().unwrap();
        assert_eq!(m.store().get_count(id), 0);

        // drop the cache entry so the next fetch must hit the backend
        m.cache.delete(&id);
        assert_eq!(m.fetch(id).unwrap(), stored);
        assert_eq!(m.store().get_count(id), 1);

        // now served from the cache
        assert_eq!(m.fetch(id).unwrap(), stored);
        assert_eq!(m.store().get_count(id), 1);
    }

    #[test]
    fn confirmed_absence_is_tombstoned_and_not_refetched() {
        let mut m = manager(8);
        let ghost = ObjectId::new_v4();
        assert!(matches!(m.fetch(ghost), Err(FsError::NotFound)));
        assert!(m.cached(ghost).unwrap().is_tombstone());
        assert!(matches!(m.fetch(ghost), Err(FsError::NotFound)));
        assert_eq!(m.store().get_count(ghost), 1);
    }

    #[test]
    fn update_field_refreshes_cache_and_backend() {
        let mut m = manager(8);
        let mut f = m.insert(FileObject::new_regular("f", 0o644, 0, 0)).unwrap();
        let id = f.require_id().unwrap();

        let mut meta = f.meta.clone();
        meta.mode = (meta.mode & kvfs_models::S_IFMT) | 0o600;
        m.update_field(&mut f, FieldUpdate::Meta(meta)).unwrap();

        assert_eq!(f.meta.mode & !kvfs_models::S_IFMT, 0o600);
        match m.cached(id).unwrap() {
            CacheSlot::Live(cached) => assert_eq!(cached.meta.mode, f.meta.mode),
            CacheSlot::Tombstone => panic!("live entry expected"),
        }
        let in_backend = m.store().get(id).unwrap().unwrap();
        assert_eq!(in_backend.meta.mode, f.meta.mode);
    }

    #[test]
    fn update_directory_add_remove_rename() {
        let mut m = manager(8);
        let mut dir = m
            .insert(FileObject::new_directory("d", 0o755, 0, 0))
            .unwrap();
        let child = m.insert(FileObject::new_regular("c", 0o644, 0, 0)).unwrap();

        m.update_directory(&mut dir, DirAction::add(&child).unwrap())
            .unwrap();
        assert_eq!(
            dir.children().unwrap().get("c"),
            Some(&child.require_id().unwrap())
        );

        m.update_directory(
            &mut dir,
            DirAction::Rename {
                old_name: "c".to_string(),
                new_name: "c2".to_string(),
            },
        )
        .unwrap();
        assert!(dir.children().unwrap().contains_key("c2"));
        assert!(!dir.children().unwrap().contains_key("c"));

        m.update_directory(
            &mut dir,
            DirAction::Remove {
                name: "c2".to_string(),
            },
        )
        .unwrap();
        assert!(dir.children().unwrap().is_empty());

        // the backend saw every step
        let in_backend = m
            .store()
            .get(dir.require_id().unwrap())
            .unwrap()
            .unwrap();
        assert!(in_backend.children().unwrap().is_empty());
    }

    #[test]
    fn removing_or_renaming_an_absent_name_fails() {
        let mut m = manager(8);
        let mut dir = m
            .insert(FileObject::new_directory("d", 0o755, 0, 0))
            .unwrap();
        assert!(matches!(
            m.update_directory(
                &mut dir,
                DirAction::Remove {
                    name: "nope".to_string()
                }
            ),
            Err(FsError::NotFound)
        ));
        assert!(matches!(
            m.update_directory(
                &mut dir,
                DirAction::Rename {
                    old_name: "nope".to_string(),
                    new_name: "x".to_string()
                }
            ),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn update_directory_rejects_non_directories() {
        let mut m = manager(8);
        let mut f = m.insert(FileObject::new_regular("f", 0o644, 0, 0)).unwrap();
        assert!(matches!(
            m.update_directory(
                &mut f,
                DirAction::Remove {
                    name: "x".to_string()
                }
            ),
            Err(FsError::NotDirectory)
        ));
    }

    #[test]
    fn remove_deletes_backend_record_and_cache_entry() {
        let mut m = manager(8);
        let f = m.insert(FileObject::new_regular("f", 0o644, 0, 0)).unwrap();
        let id = f.require_id().unwrap();
        m.remove(&f).unwrap();
        assert!(!m.store().contains(id));
        assert!(m.cached(id).is_none());

        // a later fetch tombstones, never a positive entry
        assert!(matches!(m.fetch(id), Err(FsError::NotFound)));
        assert!(m.cached(id).unwrap().is_tombstone());
    }

    #[test]
    fn root_is_discovered_once_and_cached() {
        let mut m = manager(8);
        let first = m.root().unwrap();
        assert_eq!(first.name, "/");
        let root_id = first.require_id().unwrap();
        let second = m.root().unwrap();
        assert_eq!(second.id, first.id);
        // the second call was a cache hit
        assert_eq!(m.store().get_count(root_id), 0);
    }

    #[test]
    fn backend_failure_propagates_unretried() {
        let mut m = manager(8);
        let f = m.insert(FileObject::new_regular("f", 0o644, 0, 0)).unwrap();
        let id = f.require_id().unwrap();
        m.cache.delete(&id);
        m.store().set_offline(true);
        assert!(matches!(m.fetch(id), Err(FsError::BackendUnavailable(_))));
        m.store().set_offline(false);
        assert_eq!(m.fetch(id).unwrap(), f);
    }
}
