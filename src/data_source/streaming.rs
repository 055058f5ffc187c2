use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info, warn};

use super::backoff::{Backoff, BackoffConfig};
use super::signal::LifetimeToken;
use super::status::{DataSourceErrorInfo, DataSourceState, ErrorKind};
use super::updates::DataSourceUpdates;
use super::{DataSource, TransportError};
use crate::changeset::Selector;
use crate::protocol::{Event, ProtocolAction, ProtocolHandler, RawEvent};
use crate::{Error, Result};

/// A connection that delivers named events, such as a server-sent events stream.
pub trait EventSource: Send {
    /// Opens a connection, offering `selector` so the server can resume from it.
    fn connect(&mut self, selector: Option<&Selector>) -> std::result::Result<(), TransportError>;

    /// Waits up to `timeout` for the next event. `Ok(None)` means nothing arrived in time.
    fn recv(&mut self, timeout: Duration) -> std::result::Result<Option<RawEvent>, TransportError>;

    fn disconnect(&mut self);
}

/// The sending half of a [ChannelEventSource]. Sending an error simulates a dropped connection.
pub type EventSender = Sender<std::result::Result<RawEvent, TransportError>>;

/// Selectors offered on each connect, oldest first.
pub type ConnectionLog = Arc<Mutex<Vec<Option<Selector>>>>;

/// An [EventSource] fed from an in-process channel.
pub struct ChannelEventSource {
    receiver: Receiver<std::result::Result<RawEvent, TransportError>>,
    connections: ConnectionLog,
}

impl ChannelEventSource {
    pub fn new() -> (EventSender, ChannelEventSource) {
        let (sender, receiver) = mpsc::channel();
        let source = ChannelEventSource {
            receiver,
            connections: ConnectionLog::default(),
        };
        (sender, source)
    }

    /// A handle on the log of connections, usable after the source is handed to a data source.
    pub fn connections(&self) -> ConnectionLog {
        Arc::clone(&self.connections)
    }
}

impl EventSource for ChannelEventSource {
    fn connect(&mut self, selector: Option<&Selector>) -> std::result::Result<(), TransportError> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(selector.cloned());
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> std::result::Result<Option<RawEvent>, TransportError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => message.map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn disconnect(&mut self) {}
}

/// Configuration for [`StreamingDataSource`].
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Reconnect delays.
    pub backoff: BackoffConfig,
    /// The longest a single read blocks, which bounds how long cancellation takes to be noticed.
    ///
    /// Defaults to [`StreamingConfig::DEFAULT_READ_TIMEOUT`].
    pub read_timeout: Duration,
}

impl StreamingConfig {
    /// Default value for [`StreamingConfig::read_timeout`].
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

    pub fn new() -> StreamingConfig {
        StreamingConfig::default()
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> StreamingConfig {
        self.backoff = backoff;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> StreamingConfig {
        self.read_timeout = read_timeout;
        self
    }
}

impl Default for StreamingConfig {
    fn default() -> StreamingConfig {
        StreamingConfig {
            backoff: BackoffConfig::default(),
            read_timeout: StreamingConfig::DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Receives events over a long-lived connection and reconnects with backoff when it drops.
pub struct StreamingDataSource {
    source: Option<Box<dyn EventSource>>,
    config: StreamingConfig,
    lifetime: Option<LifetimeToken>,
    join_handle: Option<JoinHandle<()>>,
}

impl StreamingDataSource {
    pub fn new(source: Box<dyn EventSource>) -> Self {
        Self::with_config(source, StreamingConfig::default())
    }

    pub fn with_config(source: Box<dyn EventSource>, config: StreamingConfig) -> Self {
        StreamingDataSource {
            source: Some(source),
            config,
            lifetime: None,
            join_handle: None,
        }
    }
}

impl DataSource for StreamingDataSource {
    fn start(&mut self, updates: Arc<DataSourceUpdates>, lifetime: LifetimeToken) -> Result<()> {
        let source = self.source.take().ok_or(Error::AlreadyStarted)?;
        let config = self.config.clone();
        let thread_lifetime = lifetime.clone();

        let join_handle = std::thread::Builder::new()
            .name("flagsync-stream".to_owned())
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    run_stream(source, &updates, &thread_lifetime, &config)
                }));
                if result.is_err() {
                    error!("streaming data source thread panicked");
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
                error!("streaming data source thread panicked");
            }
        }
    }
}

fn run_stream(
    mut source: Box<dyn EventSource>,
    updates: &DataSourceUpdates,
    lifetime: &LifetimeToken,
    config: &StreamingConfig,
) {
    let mut backoff = Backoff::new(config.backoff.clone());
    let mut handler = ProtocolHandler::new();

    while !lifetime.is_cancelled() {
        let selector = updates.selector();
        debug!("connecting stream with selector {:?}", selector);
        match source.connect(selector.as_ref()) {
            Ok(()) => {
                backoff.connected();
                let result = read_stream(source.as_mut(), &mut handler, updates, lifetime, config);
                source.disconnect();
                handler.reset();
                match result {
                    Ok(()) => break,
                    Err(info) => updates.update_status(DataSourceState::Interrupted, Some(info)),
                }
            }
            Err(e) if !e.is_recoverable() => {
                error!("stream connection failed permanently: {}", e);
                updates.update_status(DataSourceState::Closed, Some(DataSourceErrorInfo::from(&e)));
                return;
            }
            Err(e) => {
                warn!("stream connection failed: {}", e);
                updates.update_status(
                    DataSourceState::Interrupted,
                    Some(DataSourceErrorInfo::from(&e)),
                );
            }
        }

        let delay = backoff.next_delay();
        info!("reconnecting stream in {:?}", delay);
        if lifetime.wait_timeout(delay) {
            break;
        }
    }
    debug!("streaming data source stopped");
}

/// Reads until the connection fails or the lifetime ends. Ok means cancelled; an error describes
/// why the connection has to be re-established.
fn read_stream(
    source: &mut dyn EventSource,
    handler: &mut ProtocolHandler,
    updates: &DataSourceUpdates,
    lifetime: &LifetimeToken,
    config: &StreamingConfig,
) -> std::result::Result<(), DataSourceErrorInfo> {
    loop {
        if lifetime.is_cancelled() {
            return Ok(());
        }

        let raw = match source.recv(config.read_timeout) {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => return Err(DataSourceErrorInfo::from(&e)),
        };

        let action = Event::decode(raw).and_then(|event| handler.handle(event));
        match action {
            Ok(ProtocolAction::None) => {}
            Ok(ProtocolAction::ChangeSet(change_set)) => updates.apply(change_set),
            Ok(ProtocolAction::Goodbye(reason)) => {
                info!("server closed the stream: {}", reason);
                return Err(DataSourceErrorInfo::new(
                    ErrorKind::Unknown,
                    format!("goodbye: {}", reason),
                ));
            }
            Ok(ProtocolAction::Error(error)) => {
                return Err(DataSourceErrorInfo::new(ErrorKind::ErrorResponse, error.reason));
            }
            Err(e) => {
                warn!("dropping stream after protocol error: {}", e);
                return Err(DataSourceErrorInfo::new(ErrorKind::InvalidData, e.to_string()));
            }
        }
    }
}
