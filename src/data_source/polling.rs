use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, warn};

use super::backoff::jitter;
use super::signal::LifetimeToken;
use super::status::{DataSourceErrorInfo, DataSourceState, ErrorKind};
use super::updates::DataSourceUpdates;
use super::{DataSource, TransportError};
use crate::changeset::Selector;
use crate::protocol::{parse_polling_response, ProtocolError};
use crate::{Error, Result};

/// Fetches the current data set in one request.
pub trait PollingRequester: Send {
    /// Returns the raw response body. `selector` lets the server answer with only what changed.
    fn request(&mut self, selector: Option<&Selector>) -> std::result::Result<String, TransportError>;
}

impl<F> PollingRequester for F
where
    F: FnMut(Option<&Selector>) -> std::result::Result<String, TransportError> + Send,
{
    fn request(&mut self, selector: Option<&Selector>) -> std::result::Result<String, TransportError> {
        self(selector)
    }
}

/// Configuration for [`PollingDataSource`].
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Only set through [`PollingConfig::with_interval`], which enforces the minimum.
    interval: Duration,
    /// Up to this much is randomly taken off each interval, so that many clients do not poll in
    /// lockstep.
    ///
    /// Defaults to [`PollingConfig::DEFAULT_POLL_JITTER`].
    pub jitter: Duration,
}

impl PollingConfig {
    /// Default value for [`PollingConfig::interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
    /// The shortest interval [`PollingConfig::with_interval`] accepts.
    pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(30);
    /// Default value for [`PollingConfig::jitter`].
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);

    pub fn new() -> PollingConfig {
        PollingConfig::default()
    }

    /// Update poll interval with `interval`, raised to [`PollingConfig::MIN_POLL_INTERVAL`] if
    /// shorter.
    pub fn with_interval(mut self, interval: Duration) -> PollingConfig {
        self.interval = interval.max(PollingConfig::MIN_POLL_INTERVAL);
        self
    }

    /// Interval to wait between requests.
    ///
    /// Defaults to [`PollingConfig::DEFAULT_POLL_INTERVAL`].
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn with_jitter(mut self, jitter: Duration) -> PollingConfig {
        self.jitter = jitter;
        self
    }
}

impl Default for PollingConfig {
    fn default() -> PollingConfig {
        PollingConfig {
            interval: PollingConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollingConfig::DEFAULT_POLL_JITTER,
        }
    }
}

/// Requests the data set periodically.
pub struct PollingDataSource {
    requester: Option<Box<dyn PollingRequester>>,
    config: PollingConfig,
    lifetime: Option<LifetimeToken>,
    join_handle: Option<JoinHandle<()>>,
}

impl PollingDataSource {
    pub fn new(requester: Box<dyn PollingRequester>) -> Self {
        Self::with_config(requester, PollingConfig::default())
    }

    pub fn with_config(requester: Box<dyn PollingRequester>, config: PollingConfig) -> Self {
        PollingDataSource {
            requester: Some(requester),
            config,
            lifetime: None,
            join_handle: None,
        }
    }
}

impl DataSource for PollingDataSource {
    fn start(&mut self, updates: Arc<DataSourceUpdates>, lifetime: LifetimeToken) -> Result<()> {
        let mut requester = self.requester.take().ok_or(Error::AlreadyStarted)?;
        let config = self.config.clone();
        let thread_lifetime = lifetime.clone();

        let join_handle = std::thread::Builder::new()
            .name("flagsync-poller".to_owned())
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| loop {
                    if !poll_once(requester.as_mut(), &updates) {
                        return;
                    }
                    let timeout = jitter(config.interval, config.jitter);
                    if thread_lifetime.wait_timeout(timeout) {
                        debug!("poller received stop command");
                        return;
                    }
                }));
                if result.is_err() {
                    error!("polling data source thread panicked");
                    updates.update_status(
                        DataSourceState::Closed,
                        Some(DataSourceErrorInfo::new(ErrorKind::Unknown, "thread panicked")),
                    );
                }
            })?;

        self.lifetime = Some(lifetime);
        self.join_handle = Some(join_handle);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(lifetime) = &self.lifetime {
            lifetime.cancel();
        }
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                error!("polling data source thread panicked");
            }
        }
    }
}

/// Makes one request and applies the result. Returns false when polling should stop.
fn poll_once(requester: &mut dyn PollingRequester, updates: &DataSourceUpdates) -> bool {
    debug!("polling for new data");
    let body = match requester.request(updates.selector().as_ref()) {
        Ok(body) => body,
        Err(e) if !e.is_recoverable() => {
            error!("polling failed permanently: {}", e);
            updates.update_status(DataSourceState::Closed, Some(DataSourceErrorInfo::from(&e)));
            return false;
        }
        Err(e) => {
            warn!("polling request failed: {}", e);
            updates.update_status(DataSourceState::Interrupted, Some(DataSourceErrorInfo::from(&e)));
            return true;
        }
    };

    match parse_polling_response(&body) {
        Ok(change_set) => updates.apply(change_set),
        Err(ProtocolError::ServerError(reason)) => updates.update_status(
            DataSourceState::Interrupted,
            Some(DataSourceErrorInfo::new(ErrorKind::ErrorResponse, reason)),
        ),
        Err(e) => updates.update_status(
            DataSourceState::Interrupted,
            Some(DataSourceErrorInfo::new(ErrorKind::InvalidData, e.to_string())),
        ),
    }
    true
}
