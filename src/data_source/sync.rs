use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{info, warn};

use super::signal::LifetimeToken;
use super::status::{DataSourceState, DataSourceStatus};
use super::updates::DataSourceUpdates;
use super::DataSource;
use crate::data_store::DataStore;
use crate::{Error, Result};

/// Keeps a [DataStore] in sync with a [DataSource].
pub struct DataSync {
    store: Arc<DataStore>,
    updates: Arc<DataSourceUpdates>,
    source: Mutex<Box<dyn DataSource>>,
    lifetime: LifetimeToken,
    started: AtomicBool,
    closed: AtomicBool,
}

impl DataSync {
    pub fn new(store: Arc<DataStore>, source: Box<dyn DataSource>) -> Self {
        DataSync {
            updates: Arc::new(DataSourceUpdates::new(Arc::clone(&store))),
            store,
            source: Mutex::new(source),
            lifetime: LifetimeToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Starts the data source. Returns once it is running; use [DataSync::initialize] to wait for
    /// data.
    pub fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        info!("starting data sync");
        self.source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .start(Arc::clone(&self.updates), self.lifetime.clone())
    }

    /// Blocks up to `timeout` for the first data set. Returns whether the source became ready.
    ///
    /// On timeout the source keeps running and may still become ready later.
    pub fn initialize(&self, timeout: Duration) -> bool {
        match self.updates.ready_signal().wait(timeout) {
            Some(ready) => ready,
            None => {
                warn!("data source not ready after {:?}; continuing in the background", timeout);
                false
            }
        }
    }

    pub fn status(&self) -> DataSourceStatus {
        self.updates.status()
    }

    /// Blocks up to `timeout` for the source to reach `state`.
    pub fn wait_for(&self, state: DataSourceState, timeout: Duration) -> bool {
        self.updates.wait_for(state, timeout)
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    /// Stops the data source and waits for it to exit. The store keeps its data. Calling it again
    /// does nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing data sync");
        self.lifetime.cancel();
        self.source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close();
        self.updates.update_status(DataSourceState::Closed, None);
    }
}

impl Drop for DataSync {
    fn drop(&mut self) {
        self.close();
    }
}
