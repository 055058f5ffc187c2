use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, warn};

use super::signal::ReadySignal;
use super::status::{DataSourceErrorInfo, DataSourceState, DataSourceStatus};
use crate::changeset::{Change, ChangeAction, ChangeSet, IntentCode, Selector};
use crate::data_store::DataStore;
use crate::dependency::{sort_collections, Collections};
use crate::item::ItemDescriptor;

/// The single place where a data source's output reaches the store.
///
/// Change-sets are applied one at a time, in the order they are handed over. The status of the
/// source is tracked here too, and the [ReadySignal] completes the first time the source becomes
/// valid or closes.
pub struct DataSourceUpdates {
    store: Arc<DataStore>,
    status: Mutex<DataSourceStatus>,
    status_changed: Condvar,
    ready: ReadySignal,
    applier: Mutex<()>,
}

impl DataSourceUpdates {
    pub fn new(store: Arc<DataStore>) -> Self {
        DataSourceUpdates {
            store,
            status: Mutex::new(DataSourceStatus::new()),
            status_changed: Condvar::new(),
            ready: ReadySignal::new(),
            applier: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    /// The selector to offer the server when (re)connecting.
    pub fn selector(&self) -> Option<Selector> {
        self.store.selector()
    }

    pub fn ready_signal(&self) -> ReadySignal {
        self.ready.clone()
    }

    /// Applies a completed change-set.
    ///
    /// A full transfer replaces the store contents; incremental changes go through the store's
    /// version check. Changes that cannot be parsed are logged and skipped without affecting the
    /// rest of the change-set. A `none` intent only moves the selector forward.
    pub fn apply(&self, change_set: ChangeSet) {
        let _applier = self.applier.lock().unwrap_or_else(PoisonError::into_inner);
        let ChangeSet {
            intent,
            changes,
            selector,
        } = change_set;

        match intent {
            IntentCode::TransferFull => {
                let collections = parse_changes(changes);
                debug!(
                    "applying full transfer of {} items",
                    collections.iter().map(|(_, items)| items.len()).sum::<usize>()
                );
                self.store.init(collections);
            }
            IntentCode::TransferChanges => {
                let mut applied = 0;
                for (kind, items) in parse_changes(changes) {
                    for (key, descriptor) in items {
                        if self.store.upsert(kind, &key, descriptor) {
                            applied += 1;
                        }
                    }
                }
                debug!("applied {} incremental changes", applied);
                self.store.mark_initialized();
            }
            IntentCode::None => debug!("server reports no changes"),
        }

        if let Some(selector) = selector {
            debug!("advancing selector to {}", selector);
            self.store.set_selector(selector);
        }

        if intent != IntentCode::None || self.store.is_initialized() {
            self.update_status(DataSourceState::Valid, None);
        }
    }

    /// Moves to `state`, recording `error` if given.
    ///
    /// An interruption before the first data set leaves the source initializing, and a closed
    /// source stays closed.
    pub fn update_status(&self, state: DataSourceState, error: Option<DataSourceErrorInfo>) {
        let mut status = self.lock_status();
        if status.state == DataSourceState::Closed {
            return;
        }

        let state = match (status.state, state) {
            (DataSourceState::Initializing, DataSourceState::Interrupted) => {
                DataSourceState::Initializing
            }
            (_, state) => state,
        };

        if let Some(error) = error {
            warn!("data source error: {:?}: {}", error.kind, error.message);
            status.last_error = Some(error);
        }
        if status.state != state {
            info!("data source state {:?} -> {:?}", status.state, state);
            status.state = state;
            status.state_since = Utc::now();
        }
        drop(status);
        self.status_changed.notify_all();

        match state {
            DataSourceState::Valid => {
                self.ready.complete(true);
            }
            DataSourceState::Closed => {
                self.ready.complete(false);
            }
            _ => {}
        }
    }

    pub fn status(&self) -> DataSourceStatus {
        self.lock_status().clone()
    }

    /// Blocks up to `timeout` for the source to reach `state`. Returns false on timeout, or as soon
    /// as the source closes while waiting for another state.
    pub fn wait_for(&self, state: DataSourceState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.lock_status();
        loop {
            if status.state == state {
                return true;
            }
            if status.state == DataSourceState::Closed {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            status = self
                .status_changed
                .wait_timeout(status, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn lock_status(&self) -> MutexGuard<'_, DataSourceStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_changes(changes: Vec<Change>) -> Collections {
    let items = changes.into_iter().filter_map(|change| {
        let descriptor = match (change.action, change.object) {
            (ChangeAction::Delete, _) => ItemDescriptor::tombstone(change.version),
            (ChangeAction::Put, Some(object)) => match change.kind.parse_item(object) {
                Ok(item) => ItemDescriptor {
                    version: change.version,
                    item: Some(Arc::new(item)),
                },
                Err(e) => {
                    warn!(
                        "skipping malformed {} '{}' version {}: {}",
                        change.kind, change.key, change.version, e
                    );
                    return None;
                }
            },
            (ChangeAction::Put, None) => {
                warn!("skipping {} '{}': put without a body", change.kind, change.key);
                return None;
            }
        };
        Some((change.kind, vec![(change.key, descriptor)]))
    });
    sort_collections(items)
}
