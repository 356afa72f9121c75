//! Typed views over persisted records.
//!
//! This is the only place that knows which key holds what. Absent keys
//! map to the defaults of their types (`Initial`, `Normal`, `false`, 0).

use crate::state::{InternalState, PackageIdent, UpdateResult, UpdateState, UpdateType};
use crate::store::{self, keys, KvStore};
use failure::Fallible;
use std::sync::Arc;

/// Information needed to pick an interrupted transfer back up.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ResumeRecord {
    /// Package location, absent for uninstall-only records.
    pub(crate) uri: Option<reqwest::Url>,
    pub(crate) update_type: UpdateType,
    /// Bytes durably stored so far.
    pub(crate) byte_offset: u64,
    /// Announced package size, 0 if unknown.
    pub(crate) package_size: u64,
}

impl ResumeRecord {
    pub(crate) fn new(uri: reqwest::Url, update_type: UpdateType) -> Self {
        Self {
            uri: Some(uri),
            update_type,
            byte_offset: 0,
            package_size: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredUri(#[serde(with = "url_serde")] reqwest::Url);

/// Shared handle to the persisted update records.
#[derive(Clone)]
pub(crate) struct Records {
    store: Arc<dyn KvStore>,
}

impl std::fmt::Debug for Records {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Records").finish()
    }
}

impl Records {
    pub(crate) fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn kv(&self) -> &dyn KvStore {
        self.store.as_ref()
    }

    pub(crate) fn resume_record(&self) -> Fallible<Option<ResumeRecord>> {
        let update_type: UpdateType = match store::get_value(self.kv(), keys::RESUME_UPDATE_TYPE)? {
            Some(t) => t,
            None => return Ok(None),
        };
        let uri: Option<StoredUri> = store::get_value(self.kv(), keys::RESUME_PACKAGE_URI)?;
        let package_size = store::get_or_default(self.kv(), keys::RESUME_PACKAGE_SIZE)?;
        let byte_offset = self.byte_offset(update_type)?;

        Ok(Some(ResumeRecord {
            uri: uri.map(|u| u.0),
            update_type,
            byte_offset,
            package_size,
        }))
    }

    pub(crate) fn write_resume_record(&self, record: &ResumeRecord) -> Fallible<()> {
        match record.uri {
            Some(ref uri) => {
                store::put_value(self.kv(), keys::RESUME_PACKAGE_URI, &StoredUri(uri.clone()))?
            }
            None => self.kv().delete(keys::RESUME_PACKAGE_URI)?,
        }
        store::put_value(self.kv(), keys::RESUME_PACKAGE_SIZE, &record.package_size)?;
        self.set_byte_offset(record.update_type, record.byte_offset)?;
        // Written last: its presence marks the record as complete.
        store::put_value(self.kv(), keys::RESUME_UPDATE_TYPE, &record.update_type)
    }

    pub(crate) fn clear_resume_record(&self) -> Fallible<()> {
        self.kv().delete(keys::RESUME_UPDATE_TYPE)?;
        self.kv().delete(keys::RESUME_PACKAGE_URI)?;
        self.kv().delete(keys::RESUME_PACKAGE_SIZE)?;
        self.kv().delete(keys::FW_BYTES_DOWNLOADED)?;
        self.kv().delete(keys::SW_BYTES_DOWNLOADED)
    }

    pub(crate) fn byte_offset(&self, update_type: UpdateType) -> Fallible<u64> {
        store::get_or_default(self.kv(), offset_key(update_type))
    }

    pub(crate) fn set_byte_offset(&self, update_type: UpdateType, offset: u64) -> Fallible<()> {
        store::put_value(self.kv(), offset_key(update_type), &offset)
    }

    pub(crate) fn clear_byte_offset(&self, update_type: UpdateType) -> Fallible<()> {
        self.kv().delete(offset_key(update_type))
    }

    pub(crate) fn set_package_size(&self, size: u64) -> Fallible<()> {
        store::put_value(self.kv(), keys::RESUME_PACKAGE_SIZE, &size)
    }

    pub(crate) fn update_state(&self, update_type: UpdateType) -> Fallible<(UpdateState, UpdateResult)> {
        let (state_key, result_key) = state_keys(update_type);
        let state = store::get_or_default(self.kv(), state_key)?;
        let result = store::get_or_default(self.kv(), result_key)?;
        Ok((state, result))
    }

    pub(crate) fn write_update_state(
        &self,
        update_type: UpdateType,
        state: UpdateState,
        result: UpdateResult,
    ) -> Fallible<()> {
        let (state_key, result_key) = state_keys(update_type);
        store::put_value(self.kv(), result_key, &result)?;
        store::put_value(self.kv(), state_key, &state)
    }

    pub(crate) fn internal_state(&self, update_type: UpdateType) -> Fallible<InternalState> {
        store::get_or_default(self.kv(), internal_key(update_type))
    }

    pub(crate) fn set_internal_state(
        &self,
        update_type: UpdateType,
        internal: InternalState,
    ) -> Fallible<()> {
        trace!("{} internal state -> {:?}", update_type, internal);
        store::put_value(self.kv(), internal_key(update_type), &internal)
    }

    pub(crate) fn sw_instance_id(&self) -> Fallible<Option<u16>> {
        store::get_value(self.kv(), keys::SW_INSTANCE_ID)
    }

    pub(crate) fn set_sw_instance_id(&self, instance_id: u16) -> Fallible<()> {
        store::put_value(self.kv(), keys::SW_INSTANCE_ID, &instance_id)
    }

    pub(crate) fn sw_package(&self) -> Fallible<Option<PackageIdent>> {
        let name: Option<String> = store::get_value(self.kv(), keys::SW_PACKAGE_NAME)?;
        let version: Option<semver::Version> =
            store::get_value(self.kv(), keys::SW_PACKAGE_VERSION)?;
        match (name, version) {
            (Some(name), Some(version)) => Ok(Some(PackageIdent { name, version })),
            _ => Ok(None),
        }
    }

    pub(crate) fn set_sw_package(&self, package: Option<&PackageIdent>) -> Fallible<()> {
        match package {
            Some(p) => {
                store::put_value(self.kv(), keys::SW_PACKAGE_NAME, &p.name)?;
                store::put_value(self.kv(), keys::SW_PACKAGE_VERSION, &p.version)
            }
            None => {
                self.kv().delete(keys::SW_PACKAGE_NAME)?;
                self.kv().delete(keys::SW_PACKAGE_VERSION)
            }
        }
    }

    pub(crate) fn fw_install_pending(&self) -> Fallible<bool> {
        store::get_or_default(self.kv(), keys::FW_INSTALL_PENDING)
    }

    pub(crate) fn set_fw_install_pending(&self, pending: bool) -> Fallible<()> {
        store::put_value(self.kv(), keys::FW_INSTALL_PENDING, &pending)
    }

    pub(crate) fn fw_notification(&self) -> Fallible<bool> {
        store::get_or_default(self.kv(), keys::FW_UPDATE_NOTIFICATION)
    }

    pub(crate) fn set_fw_notification(&self, notify: bool) -> Fallible<()> {
        store::put_value(self.kv(), keys::FW_UPDATE_NOTIFICATION, &notify)
    }
}

fn offset_key(update_type: UpdateType) -> &'static str {
    match update_type {
        UpdateType::Firmware => keys::FW_BYTES_DOWNLOADED,
        UpdateType::Software => keys::SW_BYTES_DOWNLOADED,
    }
}

fn state_keys(update_type: UpdateType) -> (&'static str, &'static str) {
    match update_type {
        UpdateType::Firmware => (keys::FW_UPDATE_STATE, keys::FW_UPDATE_RESULT),
        UpdateType::Software => (keys::SW_UPDATE_STATE, keys::SW_UPDATE_RESULT),
    }
}

fn internal_key(update_type: UpdateType) -> &'static str {
    match update_type {
        UpdateType::Firmware => keys::FW_INTERNAL_STATE,
        UpdateType::Software => keys::SW_INTERNAL_STATE,
    }
}
