//! A minimal ordered key-value store with a persistent and an in-memory mode.
//!
//! The persistent mode is backed by `redb`. The in-memory mode is backed by an
//! [`im::OrdMap`] and exists for tests and ephemeral runs. Both modes provide
//! ordered lookups (`prev`/`next`), which the storage layer uses for
//! at-or-before-slot queries.

use std::path::Path;

use anyhow::Result;
use im::OrdMap;
use log::info;
use parking_lot::Mutex;
use redb::{Database as Redb, ReadableTable as _, TableDefinition};

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("data");

pub struct Database(DatabaseKind);

enum DatabaseKind {
    Persistent(Redb),
    InMemory {
        map: Mutex<OrdMap<Vec<u8>, Vec<u8>>>,
    },
}

impl Database {
    pub fn persistent(name: &str, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(directory) = path.parent() {
            std::fs::create_dir_all(directory)?;
        }

        info!("opening database {name:?} at {path:?}");

        let database = Redb::create(path)?;

        // Create the table eagerly so read transactions can always open it.
        let transaction = database.begin_write()?;
        transaction.open_table(TABLE)?;
        transaction.commit()?;

        Ok(Self(DatabaseKind::Persistent(database)))
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self(DatabaseKind::InMemory {
            map: Mutex::new(OrdMap::new()),
        })
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        match &self.0 {
            DatabaseKind::Persistent(database) => {
                let transaction = database.begin_read()?;
                let table = transaction.open_table(TABLE)?;
                let value = table.get(key.as_ref())?;

                Ok(value.map(|guard| guard.value().to_vec()))
            }
            DatabaseKind::InMemory { map } => Ok(map.lock().get(key.as_ref()).cloned()),
        }
    }

    pub fn contains_key(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        self.get(key).map(|value| value.is_some())
    }

    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.put_batch(core::iter::once((
            key.as_ref().to_vec(),
            value.as_ref().to_vec(),
        )))
    }

    pub fn put_batch(
        &self,
        pairs: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        match &self.0 {
            DatabaseKind::Persistent(database) => {
                let transaction = database.begin_write()?;

                {
                    let mut table = transaction.open_table(TABLE)?;

                    for (key, value) in pairs {
                        table.insert(key.as_slice(), value.as_slice())?;
                    }
                }

                transaction.commit()?;

                Ok(())
            }
            DatabaseKind::InMemory { map } => {
                let mut map = map.lock();

                for (key, value) in pairs {
                    map.insert(key, value);
                }

                Ok(())
            }
        }
    }

    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<()> {
        match &self.0 {
            DatabaseKind::Persistent(database) => {
                let transaction = database.begin_write()?;

                {
                    let mut table = transaction.open_table(TABLE)?;
                    table.remove(key.as_ref())?;
                }

                transaction.commit()?;

                Ok(())
            }
            DatabaseKind::InMemory { map } => {
                map.lock().remove(key.as_ref());
                Ok(())
            }
        }
    }

    /// The last pair whose key is less than or equal to `key`.
    pub fn prev(&self, key: impl AsRef<[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match &self.0 {
            DatabaseKind::Persistent(database) => {
                let transaction = database.begin_read()?;
                let table = transaction.open_table(TABLE)?;

                let pair = table
                    .range::<&[u8]>(..=key.as_ref())?
                    .next_back()
                    .transpose()?
                    .map(|(key, value)| (key.value().to_vec(), value.value().to_vec()));

                Ok(pair)
            }
            DatabaseKind::InMemory { map } => Ok(map
                .lock()
                .get_prev(key.as_ref())
                .map(|(key, value)| (key.clone(), value.clone()))),
        }
    }

    /// The first pair whose key is greater than or equal to `key`.
    pub fn next(&self, key: impl AsRef<[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match &self.0 {
            DatabaseKind::Persistent(database) => {
                let transaction = database.begin_read()?;
                let table = transaction.open_table(TABLE)?;

                let pair = table
                    .range::<&[u8]>(key.as_ref()..)?
                    .next()
                    .transpose()?
                    .map(|(key, value)| (key.value().to_vec(), value.value().to_vec()));

                Ok(pair)
            }
            DatabaseKind::InMemory { map } => Ok(map
                .lock()
                .get_next(key.as_ref())
                .map(|(key, value)| (key.clone(), value.clone()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Constructor = fn() -> Result<(Database, Option<tempfile::TempDir>)>;

    fn build_in_memory() -> Result<(Database, Option<tempfile::TempDir>)> {
        Ok((Database::in_memory(), None))
    }

    fn build_persistent() -> Result<(Database, Option<tempfile::TempDir>)> {
        let directory = tempfile::tempdir()?;
        let database = Database::persistent("test", directory.path().join("test.redb"))?;
        Ok((database, Some(directory)))
    }

    fn populate(database: &Database) -> Result<()> {
        database.put_batch([
            (b"b".to_vec(), b"1".to_vec()),
            (b"d".to_vec(), b"2".to_vec()),
            (b"f".to_vec(), b"3".to_vec()),
        ])
    }

    fn test_round_trip(constructor: Constructor) -> Result<()> {
        let (database, _directory) = constructor()?;
        populate(&database)?;

        assert_eq!(database.get(b"d")?, Some(b"2".to_vec()));
        assert_eq!(database.get(b"e")?, None);
        assert!(database.contains_key(b"b")?);

        database.delete(b"b")?;
        assert!(!database.contains_key(b"b")?);

        Ok(())
    }

    fn test_prev_and_next(constructor: Constructor) -> Result<()> {
        let (database, _directory) = constructor()?;
        populate(&database)?;

        assert_eq!(database.prev(b"e")?, Some((b"d".to_vec(), b"2".to_vec())));
        assert_eq!(database.prev(b"d")?, Some((b"d".to_vec(), b"2".to_vec())));
        assert_eq!(database.prev(b"a")?, None);

        assert_eq!(database.next(b"e")?, Some((b"f".to_vec(), b"3".to_vec())));
        assert_eq!(database.next(b"g")?, None);

        Ok(())
    }

    #[test]
    fn in_memory_round_trip() -> Result<()> {
        test_round_trip(build_in_memory)
    }

    #[test]
    fn persistent_round_trip() -> Result<()> {
        test_round_trip(build_persistent)
    }

    #[test]
    fn in_memory_prev_and_next() -> Result<()> {
        test_prev_and_next(build_in_memory)
    }

    #[test]
    fn persistent_prev_and_next() -> Result<()> {
        test_prev_and_next(build_persistent)
    }
}
