//! The indexed store that evaluation reads from and data sources write to.
//!
//! Readers take an immutable [Snapshot] and keep it for as long as they need a consistent view.
//! Writers serialize on a single mutex, build the next snapshot and publish it with one reference
//! swap, so a reader sees either the whole old state or the whole new state.
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use log::{debug, error, warn};
use maplit::hashmap;

use crate::changeset::Selector;
use crate::dependency::Collections;
use crate::flag::Flag;
use crate::item::{storage_key, DataKind, ItemDescriptor, SerializedItem, StorableItem};
use crate::segment::Segment;
use crate::store::Store;

/// Items of one kind by key, tombstones included.
pub type Collection = HashMap<String, ItemDescriptor>;

/// Serialized items by kind, in write order, as handed to a [PersistentDataStore].
pub type SerializedCollections = Vec<(DataKind, Vec<(String, SerializedItem)>)>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("persistent store failure: {0}")]
    Backend(String),

    #[error("failed to encode or decode a stored item")]
    Serialization(#[source] Arc<serde_json::Error>),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(Arc::new(err))
    }
}

/// An immutable view of the whole data set.
#[derive(Clone, Debug)]
pub struct Snapshot {
    collections: HashMap<DataKind, Arc<Collection>>,
    initialized: bool,
}

impl Snapshot {
    /// A snapshot with no items that has never received a full data set.
    pub fn empty() -> Self {
        Snapshot {
            collections: hashmap! {
                DataKind::Segments => Arc::new(Collection::new()),
                DataKind::Features => Arc::new(Collection::new()),
            },
            initialized: false,
        }
    }

    /// Builds an initialized snapshot. Later entries for a key replace earlier ones.
    pub fn from_collections(collections: Collections) -> Self {
        let mut snapshot = Snapshot::empty();
        for (kind, items) in collections {
            let collection = snapshot.collection_mut(kind);
            collection.extend(items);
        }
        snapshot.initialized = true;
        snapshot
    }

    /// Whether the snapshot descends from a full data set.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The live item under `key`; tombstones read as absent.
    pub fn get(&self, kind: DataKind, key: &str) -> Option<&Arc<StorableItem>> {
        self.descriptor(kind, key)
            .and_then(|descriptor| descriptor.item.as_ref())
    }

    /// The slot under `key`, tombstone or not.
    pub fn descriptor(&self, kind: DataKind, key: &str) -> Option<&ItemDescriptor> {
        self.collections
            .get(&kind)
            .and_then(|collection| collection.get(key))
    }

    /// All live items of `kind`.
    pub fn all(&self, kind: DataKind) -> impl Iterator<Item = (&str, &Arc<StorableItem>)> {
        self.collections
            .get(&kind)
            .into_iter()
            .flat_map(|collection| collection.iter())
            .filter_map(|(key, descriptor)| {
                descriptor.item.as_ref().map(|item| (key.as_str(), item))
            })
    }

    fn collection_mut(&mut self, kind: DataKind) -> &mut Collection {
        Arc::make_mut(self.collections.entry(kind).or_default())
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot::empty()
    }
}

impl Store for Snapshot {
    fn flag(&self, flag_key: &str) -> Option<&Flag> {
        self.get(DataKind::Features, flag_key)
            .and_then(|item| item.as_flag())
    }

    fn segment(&self, segment_key: &str) -> Option<&Segment> {
        self.get(DataKind::Segments, segment_key)
            .and_then(|item| item.as_segment())
    }
}

/// A durable backend the store writes through to.
///
/// Implementations key items as `{prefix}:{namespace}/{key}` (see [storage_key]) and must refuse
/// an upsert whose version does not exceed the stored one.
pub trait PersistentDataStore: Send + Sync {
    /// Replaces all contents. Collections arrive in dependency order.
    fn init(&self, collections: SerializedCollections) -> Result<(), StoreError>;

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<SerializedItem>, StoreError>;

    fn all(&self, kind: DataKind) -> Result<HashMap<String, SerializedItem>, StoreError>;

    /// Returns whether the item was written.
    fn upsert(&self, kind: DataKind, key: &str, item: SerializedItem) -> Result<bool, StoreError>;

    /// Whether `init` has ever been called on this backend.
    fn initialized(&self) -> bool;

    fn selector(&self) -> Result<Option<Selector>, StoreError>;

    fn set_selector(&self, selector: &Selector) -> Result<(), StoreError>;
}

/// A [PersistentDataStore] held in process memory, mostly useful for tests and as a model for
/// real backends.
#[derive(Debug, Default)]
pub struct InMemoryPersistentStore {
    prefix: String,
    items: Mutex<BTreeMap<String, SerializedItem>>,
    selector: Mutex<Option<Selector>>,
    initialized: AtomicBool,
}

impl InMemoryPersistentStore {
    pub const DEFAULT_PREFIX: &'static str = "flagsync";

    pub fn new() -> Self {
        Self::with_prefix(Self::DEFAULT_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        InMemoryPersistentStore {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    /// Raw storage keys currently held, in key order.
    pub fn storage_keys(&self) -> Vec<String> {
        lock(&self.items).keys().cloned().collect()
    }
}

impl PersistentDataStore for InMemoryPersistentStore {
    fn init(&self, collections: SerializedCollections) -> Result<(), StoreError> {
        let mut items = lock(&self.items);
        items.clear();
        for (kind, collection) in collections {
            for (key, item) in collection {
                items.insert(storage_key(&self.prefix, kind, &key), item);
            }
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<SerializedItem>, StoreError> {
        Ok(lock(&self.items)
            .get(&storage_key(&self.prefix, kind, key))
            .cloned())
    }

    fn all(&self, kind: DataKind) -> Result<HashMap<String, SerializedItem>, StoreError> {
        let namespace = storage_key(&self.prefix, kind, "");
        Ok(lock(&self.items)
            .range(namespace.clone()..)
            .take_while(|(storage_key, _)| storage_key.starts_with(&namespace))
            .map(|(storage_key, item)| (storage_key[namespace.len()..].to_string(), item.clone()))
            .collect())
    }

    fn upsert(&self, kind: DataKind, key: &str, item: SerializedItem) -> Result<bool, StoreError> {
        let mut items = lock(&self.items);
        let storage_key = storage_key(&self.prefix, kind, key);
        match items.get(&storage_key) {
            Some(existing) if existing.version >= item.version => Ok(false),
            _ => {
                items.insert(storage_key, item);
                Ok(true)
            }
        }
    }

    fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn selector(&self) -> Result<Option<Selector>, StoreError> {
        Ok(lock(&self.selector).clone())
    }

    fn set_selector(&self, selector: &Selector) -> Result<(), StoreError> {
        *lock(&self.selector) = Some(selector.clone());
        Ok(())
    }
}

// Every guarded value is replaced wholesale, so a poisoned lock still holds a consistent value.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct WriterState {
    selector: Option<Selector>,
}

/// The store facade: an in-memory index that evaluation reads, optionally written through to a
/// [PersistentDataStore].
///
/// The in-memory index is authoritative. Writes are applied to it first; a failed write to the
/// backend is retried once and then logged.
pub struct DataStore {
    snapshot: RwLock<Arc<Snapshot>>,
    writer: Mutex<WriterState>,
    persistent: Option<Arc<dyn PersistentDataStore>>,
}

impl Default for DataStore {
    fn default() -> Self {
        DataStore {
            snapshot: RwLock::new(Arc::new(Snapshot::empty())),
            writer: Mutex::new(WriterState::default()),
            persistent: None,
        }
    }
}

impl DataStore {
    /// Create a new empty, uninitialized store.
    pub fn new() -> Self {
        DataStore::default()
    }

    /// Create a store that writes through to `backend`.
    ///
    /// If the backend already holds a data set, the index is loaded from it and the persisted
    /// selector is restored, so evaluation can start before any data source connects.
    pub fn with_persistent(backend: Arc<dyn PersistentDataStore>) -> Self {
        let mut snapshot = Snapshot::empty();
        let mut selector = None;

        if backend.initialized() {
            match load_snapshot(backend.as_ref()) {
                Ok(loaded) => snapshot = loaded,
                Err(e) => warn!("could not load data from persistent store: {}", e),
            }
            match backend.selector() {
                Ok(stored) => selector = stored,
                Err(e) => warn!("could not read selector from persistent store: {}", e),
            }
        }

        DataStore {
            snapshot: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(WriterState { selector }),
            persistent: Some(backend),
        }
    }

    /// The current snapshot. Holding it does not block writers.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, snapshot: Snapshot) {
        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }

    /// Replaces the whole data set. `collections` should already be in dependency order, which is
    /// the order the backend receives them in.
    pub fn init(&self, collections: Collections) {
        let _writer = lock(&self.writer);

        let serialized = self
            .persistent
            .as_ref()
            .map(|_| serialize_collections(&collections));
        self.publish(Snapshot::from_collections(collections));

        if let (Some(backend), Some(serialized)) = (&self.persistent, serialized) {
            write_through("init", || backend.init(serialized.clone()));
        }
    }

    /// The live item under `key`.
    pub fn get(&self, kind: DataKind, key: &str) -> Option<Arc<StorableItem>> {
        self.snapshot().get(kind, key).cloned()
    }

    /// All live items of `kind`.
    pub fn all(&self, kind: DataKind) -> HashMap<String, Arc<StorableItem>> {
        self.snapshot()
            .all(kind)
            .map(|(key, item)| (key.to_string(), Arc::clone(item)))
            .collect()
    }

    /// Stores `descriptor` if its version is newer than whatever is stored under `key`, tombstones
    /// included. Returns whether the store changed.
    pub fn upsert(&self, kind: DataKind, key: &str, descriptor: ItemDescriptor) -> bool {
        let _writer = lock(&self.writer);

        let current = self.snapshot();
        if let Some(existing) = current.descriptor(kind, key) {
            if existing.version >= descriptor.version {
                debug!(
                    "ignoring {} '{}' version {}: already at version {}",
                    kind, key, descriptor.version, existing.version
                );
                return false;
            }
        }

        let serialized = match &self.persistent {
            Some(_) => match descriptor.serialize_item(key) {
                Ok(serialized) => Some(serialized),
                Err(e) => {
                    error!("could not serialize {} '{}': {}", kind, key, e);
                    None
                }
            },
            None => None,
        };

        let mut next = Snapshot::clone(&current);
        next.collection_mut(kind).insert(key.to_string(), descriptor);
        self.publish(next);

        if let (Some(backend), Some(serialized)) = (&self.persistent, serialized) {
            write_through("upsert", || {
                backend.upsert(kind, key, serialized.clone()).map(|_| ())
            });
        }
        true
    }

    /// Writes a tombstone at `version`, under the same version rule as [DataStore::upsert].
    pub fn delete(&self, kind: DataKind, key: &str, version: u64) -> bool {
        self.upsert(kind, key, ItemDescriptor::tombstone(version))
    }

    /// Marks the index as holding a usable data set, e.g. after incremental changes were applied to
    /// a store that never received a full transfer. Contents are left untouched.
    pub fn mark_initialized(&self) {
        let _writer = lock(&self.writer);
        let current = self.snapshot();
        if current.is_initialized() {
            return;
        }
        let mut next = Snapshot::clone(&current);
        next.initialized = true;
        self.publish(next);
    }

    /// Whether the index holds a data set: a full transfer, applied changes, or data loaded from
    /// the backend this store was created with.
    pub fn is_initialized(&self) -> bool {
        self.snapshot().is_initialized()
    }

    /// The selector of the last applied change-set.
    pub fn selector(&self) -> Option<Selector> {
        lock(&self.writer).selector.clone()
    }

    /// Records the selector reached and persists it.
    pub fn set_selector(&self, selector: Selector) {
        let mut writer = lock(&self.writer);
        if let Some(backend) = &self.persistent {
            write_through("set_selector", || backend.set_selector(&selector));
        }
        writer.selector = Some(selector);
    }
}

fn load_snapshot(backend: &dyn PersistentDataStore) -> Result<Snapshot, StoreError> {
    let mut collections = Vec::with_capacity(DataKind::ALL.len());
    for kind in DataKind::ALL {
        let mut items = Vec::new();
        for (key, serialized) in backend.all(kind)? {
            match kind.deserialize_item(&serialized) {
                Ok(descriptor) => items.push((key, descriptor)),
                Err(e) => warn!("skipping unreadable {} '{}' in persistent store: {}", kind, key, e),
            }
        }
        collections.push((kind, items));
    }
    Ok(Snapshot::from_collections(collections))
}

fn serialize_collections(collections: &Collections) -> SerializedCollections {
    collections
        .iter()
        .map(|(kind, items)| {
            let serialized = items
                .iter()
                .filter_map(|(key, descriptor)| match descriptor.serialize_item(key) {
                    Ok(serialized) => Some((key.clone(), serialized)),
                    Err(e) => {
                        error!("could not serialize {} '{}': {}", kind, key, e);
                        None
                    }
                })
                .collect();
            (*kind, serialized)
        })
        .collect()
}

fn write_through<F>(operation: &str, mut write: F)
where
    F: FnMut() -> Result<(), StoreError>,
{
    if let Err(first) = write() {
        warn!("persistent store {} failed, retrying: {}", operation, first);
        if let Err(second) = write() {
            error!("persistent store {} failed: {}", operation, second);
        }
    }
}
