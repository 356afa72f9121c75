//! Persisted update state machine.

use super::{PackageIdent, UpdateResult, UpdateState, UpdateType};
use crate::records::Records;
use failure::{Fail, Fallible};
use std::sync::{self, Arc};

/// A persisted state transition, as seen by observers.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct StateChange {
    pub(crate) update_type: UpdateType,
    /// Object-9 instance, for software updates.
    pub(crate) instance_id: Option<u16>,
    pub(crate) state: UpdateState,
    pub(crate) result: UpdateResult,
    pub(crate) update_started: bool,
}

/// Sink for "please resynchronize with the server" signals.
pub(crate) trait Notifier: Send + Sync {
    fn registration_update(&self, change: &StateChange);
}

/// Notifier that only logs, used when no session manager is attached.
#[derive(Debug, Default)]
pub(crate) struct LogNotifier {}

impl Notifier for LogNotifier {
    fn registration_update(&self, change: &StateChange) {
        info!(
            "registration update requested: {} {:?}/{:?}",
            change.update_type, change.state, change.result
        );
    }
}

#[derive(Debug, Fail)]
pub(crate) enum StateError {
    #[fail(display = "no software update session selected")]
    NoSoftwareSession,
}

#[derive(Debug, Default)]
struct Session {
    update_started: bool,
    package: Option<PackageIdent>,
}

/// Single entry point for update state changes.
///
/// Shared between the event loop and the pipeline workers; every setter
/// persists before returning and notifies after persisting.
pub(crate) struct UpdateStateMachine {
    records: Records,
    notifier: Arc<dyn Notifier>,
    session: sync::Mutex<Session>,
}

impl UpdateStateMachine {
    pub(crate) fn new(records: Records, notifier: Arc<dyn Notifier>) -> Fallible<Self> {
        let session = Session {
            update_started: false,
            package: records.sw_package()?,
        };
        Ok(Self {
            records,
            notifier,
            session: sync::Mutex::new(session),
        })
    }

    pub(crate) fn records(&self) -> &Records {
        &self.records
    }

    /// Select the object-9 instance that software state applies to.
    pub(crate) fn begin_software_session(&self, instance_id: u16) -> Fallible<()> {
        let _session = self.session.lock().expect("poisoned lock");
        debug!("software update session for instance {}", instance_id);
        self.records.set_sw_instance_id(instance_id)
    }

    pub(crate) fn software_instance(&self) -> Fallible<Option<u16>> {
        self.records.sw_instance_id()
    }

    /// Record name and version of the current software package.
    ///
    /// Persisted together with the next software state change.
    pub(crate) fn set_software_package(&self, package: Option<PackageIdent>) {
        let mut session = self.session.lock().expect("poisoned lock");
        session.package = package;
    }

    pub(crate) fn set_update_started(&self, started: bool) {
        let mut session = self.session.lock().expect("poisoned lock");
        session.update_started = started;
    }

    pub(crate) fn update_started(&self) -> bool {
        self.session.lock().expect("poisoned lock").update_started
    }

    pub(crate) fn state(&self, update_type: UpdateType) -> Fallible<(UpdateState, UpdateResult)> {
        self.records.update_state(update_type)
    }

    /// Persist a new `(state, result)` pair and notify observers.
    pub(crate) fn set_state(
        &self,
        update_type: UpdateType,
        state: UpdateState,
        result: UpdateResult,
    ) -> Fallible<()> {
        let change = {
            let mut session = self.session.lock().expect("poisoned lock");
            let instance_id = match update_type {
                UpdateType::Firmware => None,
                UpdateType::Software => Some(
                    self.records
                        .sw_instance_id()?
                        .ok_or(StateError::NoSoftwareSession)?,
                ),
            };

            // Cleared first, so nothing observing this change can restart the update.
            if result.is_failure() {
                session.update_started = false;
            }

            self.records.write_update_state(update_type, state, result)?;
            if update_type == UpdateType::Software {
                self.records.set_sw_package(session.package.as_ref())?;
            }

            StateChange {
                update_type,
                instance_id,
                state,
                result,
                update_started: session.update_started,
            }
        };

        info!(
            "{} update state -> {:?}, result {:?}",
            update_type, change.state, change.result
        );
        self.notifier.registration_update(&change);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemStore;

    /// Notifier keeping every change, for assertions.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingNotifier {
        pub(crate) changes: sync::Mutex<Vec<StateChange>>,
    }

    impl Notifier for RecordingNotifier {
        fn registration_update(&self, change: &StateChange) {
            self.changes.lock().unwrap().push(change.clone());
        }
    }

    pub(crate) fn machine() -> (Arc<RecordingNotifier>, UpdateStateMachine) {
        let records = Records::new(Arc::new(MemStore::default()));
        let notifier = Arc::new(RecordingNotifier::default());
        let machine = UpdateStateMachine::new(records, notifier.clone()).unwrap();
        (notifier, machine)
    }

    #[test]
    fn firmware_state_is_persisted_and_notified() {
        let (notifier, machine) = machine();
        machine
            .set_state(
                UpdateType::Firmware,
                UpdateState::DownloadStarted,
                UpdateResult::Downloading,
            )
            .unwrap();

        assert_eq!(
            machine.records().update_state(UpdateType::Firmware).unwrap(),
            (UpdateState::DownloadStarted, UpdateResult::Downloading)
        );
        let changes = notifier.changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].instance_id, None);
    }

    #[test]
    fn software_state_requires_a_session() {
        let (notifier, machine) = machine();
        let err = machine
            .set_state(UpdateType::Software, UpdateState::Downloaded, UpdateResult::Downloaded)
            .unwrap_err();
        assert!(err.downcast_ref::<StateError>().is_some());
        assert!(notifier.changes.lock().unwrap().is_empty());
        assert_eq!(
            machine.state(UpdateType::Software).unwrap(),
            (UpdateState::Initial, UpdateResult::Normal)
        );
    }

    #[test]
    fn failure_clears_started_flag_before_notifying() {
        let (notifier, machine) = machine();
        machine.set_update_started(true);
        machine
            .set_state(
                UpdateType::Firmware,
                UpdateState::DownloadStarted,
                UpdateResult::Downloading,
            )
            .unwrap();
        machine
            .set_state(UpdateType::Firmware, UpdateState::Initial, UpdateResult::DownloadFailed)
            .unwrap();

        let changes = notifier.changes.lock().unwrap();
        assert!(changes[0].update_started);
        assert!(!changes[1].update_started);
        assert!(!machine.update_started());
    }

    #[test]
    fn connection_loss_keeps_started_flag() {
        let (_, machine) = machine();
        machine.set_update_started(true);
        machine
            .set_state(
                UpdateType::Firmware,
                UpdateState::DownloadStarted,
                UpdateResult::ConnectionLost,
            )
            .unwrap();
        assert!(machine.update_started());
    }

    #[test]
    fn software_state_carries_package_record() {
        let (notifier, machine) = machine();
        machine.begin_software_session(4).unwrap();
        machine.set_software_package(Some(PackageIdent {
            name: "gateway".to_string(),
            version: semver::Version::parse("2.0.0").unwrap(),
        }));
        machine
            .set_state(UpdateType::Software, UpdateState::Delivered, UpdateResult::Normal)
            .unwrap();

        let package = machine.records().sw_package().unwrap().unwrap();
        assert_eq!(package.name, "gateway");
        assert_eq!(notifier.changes.lock().unwrap()[0].instance_id, Some(4));
    }
}
