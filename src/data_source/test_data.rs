use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::error;

use super::signal::LifetimeToken;
use super::updates::DataSourceUpdates;
use super::DataSource;
use crate::changeset::{ChangeSetBuilder, IntentCode};
use crate::flag::Flag;
use crate::item::{DataKind, ItemDescriptor, StorableItem};
use crate::segment::Segment;
use crate::{Error, Result};

/// In-process flag data for tests and local development.
///
/// Every update is given the next version for its key and is pushed to all started
/// [TestDataSource]s as an incremental change-set. A source started later receives the current
/// data as a full transfer.
#[derive(Clone, Default)]
pub struct TestData {
    state: Arc<Mutex<TestDataState>>,
}

#[derive(Default)]
struct TestDataState {
    items: BTreeMap<(DataKind, String), ItemDescriptor>,
    sinks: Vec<(u64, Arc<DataSourceUpdates>)>,
    next_sink_id: u64,
}

impl TestData {
    pub fn new() -> Self {
        Self::default()
    }

    /// A data source that reads from this test data.
    pub fn data_source(&self) -> TestDataSource {
        TestDataSource {
            data: self.clone(),
            sink_id: None,
        }
    }

    /// Adds or replaces a flag. Its version is overwritten with the next one for its key.
    pub fn update_flag(&self, mut flag: Flag) {
        let key = flag.key.clone();
        self.update(DataKind::Features, &key, |version| {
            flag.version = version;
            Some(flag.into())
        });
    }

    /// Adds or replaces a segment. Its version is overwritten with the next one for its key.
    pub fn update_segment(&self, mut segment: Segment) {
        let key = segment.key.clone();
        self.update(DataKind::Segments, &key, |version| {
            segment.version = version;
            Some(segment.into())
        });
    }

    pub fn delete(&self, kind: DataKind, key: &str) {
        self.update(kind, key, |_| None);
    }

    fn lock(&self) -> MutexGuard<'_, TestDataState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<F>(&self, kind: DataKind, key: &str, make: F)
    where
        F: FnOnce(u64) -> Option<StorableItem>,
    {
        let mut state = self.lock();
        let slot = (kind, key.to_string());
        let version = state.items.get(&slot).map_or(1, |d| d.version + 1);
        let descriptor = ItemDescriptor {
            version,
            item: make(version).map(Arc::new),
        };

        let mut builder = ChangeSetBuilder::new();
        builder.start(IntentCode::TransferChanges);
        if !add_change(&mut builder, kind, key, &descriptor) {
            return;
        }
        state.items.insert(slot, descriptor);

        match builder.finish(None) {
            Ok(change_set) => {
                for (_, updates) in &state.sinks {
                    updates.apply(change_set.clone());
                }
            }
            Err(e) => error!("could not build test data change-set: {}", e),
        }
    }
}

fn add_change(
    builder: &mut ChangeSetBuilder,
    kind: DataKind,
    key: &str,
    descriptor: &ItemDescriptor,
) -> bool {
    match &descriptor.item {
        Some(item) => match serde_json::to_value(item.as_ref()) {
            Ok(body) => builder.add_put(kind, key, descriptor.version, body),
            Err(e) => {
                error!("could not encode test {} '{}': {}", kind, key, e);
                return false;
            }
        },
        None => builder.add_delete(kind, key, descriptor.version),
    }
    true
}

/// A [DataSource] backed by [TestData].
pub struct TestDataSource {
    data: TestData,
    sink_id: Option<u64>,
}

impl DataSource for TestDataSource {
    fn start(&mut self, updates: Arc<DataSourceUpdates>, _lifetime: LifetimeToken) -> Result<()> {
        if self.sink_id.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let mut state = self.data.lock();
        let mut builder = ChangeSetBuilder::new();
        builder.start(IntentCode::TransferFull);
        for ((kind, key), descriptor) in &state.items {
            add_change(&mut builder, *kind, key, descriptor);
        }
        updates.apply(builder.finish(None)?);

        let id = state.next_sink_id;
        state.next_sink_id += 1;
        state.sinks.push((id, updates));
        self.sink_id = Some(id);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(id) = self.sink_id.take() {
            self.data.lock().sinks.retain(|(sink_id, _)| *sink_id != id);
        }
    }
}
