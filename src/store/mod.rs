//! Durable key/value persistence.
//!
//! Each key holds one logical record, replaced as a whole on every write.
//! A missing key is never an error: readers map it to a defined default.

mod file;
#[cfg(test)]
mod memory;

pub(crate) use file::FileStore;
#[cfg(test)]
pub(crate) use memory::MemStore;

use failure::{Fallible, ResultExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Persisted record keys.
pub(crate) mod keys {
    pub(crate) const FW_UPDATE_STATE: &str = "fw.update.state";
    pub(crate) const FW_UPDATE_RESULT: &str = "fw.update.result";
    pub(crate) const FW_INSTALL_PENDING: &str = "fw.install.pending";
    pub(crate) const FW_UPDATE_NOTIFICATION: &str = "fw.update.notification";
    pub(crate) const FW_INTERNAL_STATE: &str = "fw.update.internalState";
    pub(crate) const FW_BYTES_DOWNLOADED: &str = "fw.update.bytesDownloaded";

    pub(crate) const SW_UPDATE_STATE: &str = "sw.update.state";
    pub(crate) const SW_UPDATE_RESULT: &str = "sw.update.result";
    pub(crate) const SW_INSTANCE_ID: &str = "sw.update.instanceId";
    pub(crate) const SW_BYTES_DOWNLOADED: &str = "sw.update.bytesDownloaded";
    pub(crate) const SW_INTERNAL_STATE: &str = "sw.update.internalState";
    pub(crate) const SW_PACKAGE_NAME: &str = "sw.package.name";
    pub(crate) const SW_PACKAGE_VERSION: &str = "sw.package.version";

    pub(crate) const RESUME_PACKAGE_URI: &str = "resume.packageUri";
    pub(crate) const RESUME_UPDATE_TYPE: &str = "resume.updateType";
    pub(crate) const RESUME_PACKAGE_SIZE: &str = "resume.packageSize";
}

/// Raw byte-level store.
///
/// Implementations must replace a record atomically: a reader observes
/// either the previous value or the new one, never a mix.
pub(crate) trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Fallible<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Fallible<()>;
    fn delete(&self, key: &str) -> Fallible<()>;
}

/// Read and decode a record, `None` if absent.
pub(crate) fn get_value<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Fallible<Option<T>> {
    let raw = match store.get(key)? {
        Some(raw) => raw,
        None => return Ok(None),
    };
    let value = serde_json::from_slice(&raw)
        .context(format!("failed to decode record '{}'", key))?;
    Ok(Some(value))
}

/// Encode and write a record.
pub(crate) fn put_value<T: Serialize>(store: &dyn KvStore, key: &str, value: &T) -> Fallible<()> {
    let raw = serde_json::to_vec(value).context(format!("failed to encode record '{}'", key))?;
    store.put(key, &raw)
}

/// Read a record, falling back to the type default when absent.
pub(crate) fn get_or_default<T: DeserializeOwned + Default>(
    store: &dyn KvStore,
    key: &str,
) -> Fallible<T> {
    Ok(get_value(store, key)?.unwrap_or_default())
}
