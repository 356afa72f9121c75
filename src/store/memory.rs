use super::KvStore;
use failure::Fallible;
use std::collections::HashMap;
use std::sync;

/// Volatile store, for tests.
#[derive(Debug, Default)]
pub(crate) struct MemStore {
    records: sync::Mutex<HashMap<String, Vec<u8>>>,
}

impl MemStore {
    pub(crate) fn len(&self) -> usize {
        self.records.lock().expect("poisoned lock").len()
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &str) -> Fallible<Option<Vec<u8>>> {
        let records = self.records.lock().expect("poisoned lock");
        Ok(records.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Fallible<()> {
        let mut records = self.records.lock().expect("poisoned lock");
        records.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Fallible<()> {
        let mut records = self.records.lock().expect("poisoned lock");
        records.remove(key);
        Ok(())
    }
}
