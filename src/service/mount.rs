//! Mounted databases and the table that tracks them.
//!
//! Grounded on `dbserver.h`'s `DBMount`/`DBLock`: each mounted database gets
//! its own mutex so that one client's long cursor scan never blocks another
//! database's traffic, while a single global mutex only ever guards the
//! mount table itself (insert/remove/lookup), never an in-flight operation.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{database::Database, err_at, Result};

/// One mounted database: a name, the live [Database], and the mutex that
/// serializes every operation against it.
pub struct Mount {
    name: String,
    db: Mutex<Database>,
}

impl Mount {
    fn new(name: String, db: Database) -> Mount {
        Mount {
            name,
            db: Mutex::new(db),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire exclusive access to the mounted database for the duration of
    /// one protocol verb or admin operation.
    pub fn lock(&self) -> MutexGuard<Database> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Name must match `[A-Za-z0-9_-]{1,127}` and not start with `_` or `-`.
pub fn valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 127 {
        return false;
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if first == '_' || first == '-' {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// name → mount, guarded by a single short-lived lock (the "global mutex" of
/// `DBService`). Never held across database I/O.
#[derive(Default)]
pub struct MountTable {
    mounts: Mutex<HashMap<String, Arc<Mount>>>,
}

impl MountTable {
    pub fn new() -> MountTable {
        MountTable::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Mount>> {
        self.mounts.lock().unwrap().get(name).cloned()
    }

    pub fn insert(&self, name: &str, db: Database) -> Result<Arc<Mount>> {
        if !valid_name(name) {
            return err_at!(InvalidInput, msg: "invalid database name {:?}", name);
        }
        let mut mounts = self.mounts.lock().unwrap();
        if mounts.contains_key(name) {
            return err_at!(MountExists, msg: "database {:?} is already mounted", name);
        }
        let mount = Arc::new(Mount::new(name.to_string(), db));
        mounts.insert(name.to_string(), Arc::clone(&mount));
        Ok(mount)
    }

    pub fn remove(&self, name: &str) -> Result<Arc<Mount>> {
        match self.mounts.lock().unwrap().remove(name) {
            Some(mount) => Ok(mount),
            None => err_at!(NotMounted, msg: "database {:?} is not mounted", name),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.mounts.lock().unwrap().keys().cloned().collect()
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<Mount>)) {
        for mount in self.mounts.lock().unwrap().values() {
            f(mount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_name_rejects_leading_punctuation() {
        assert!(!valid_name("_foo"));
        assert!(!valid_name("-foo"));
        assert!(!valid_name(""));
        assert!(valid_name("foo-bar_1"));
    }

    #[test]
    fn test_valid_name_rejects_oversize() {
        let long = "a".repeat(128);
        assert!(!valid_name(&long));
    }

    #[test]
    fn test_insert_rejects_duplicate_name() {
        let table = MountTable::new();
        let dir = tempfile::tempdir().unwrap();
        let cfg = crate::database::Config::new(dir.path(), "db1");
        let db = Database::create(cfg).unwrap();
        table.insert("db1", db).unwrap();

        let cfg2 = crate::database::Config::new(dir.path(), "db1dup");
        let db2 = Database::create(cfg2).unwrap();
        assert!(table.insert("db1", db2).is_err());
    }
}
