use std::sync::Arc;

use log::info;

use super::signal::LifetimeToken;
use super::status::DataSourceState;
use super::updates::DataSourceUpdates;
use super::DataSource;
use crate::Result;

/// A source that never connects. It reports ready at once and leaves the store as it is, which
/// is either empty or whatever a persistent store provided.
#[derive(Debug, Default)]
pub struct OfflineDataSource;

impl OfflineDataSource {
    pub fn new() -> Self {
        OfflineDataSource
    }
}

impl DataSource for OfflineDataSource {
    fn start(&mut self, updates: Arc<DataSourceUpdates>, _lifetime: LifetimeToken) -> Result<()> {
        info!("starting in offline mode");
        updates.update_status(DataSourceState::Valid, None);
        Ok(())
    }

    fn close(&mut self) {}
}
