//! Data sources feed change-sets into a [crate::DataStore].
//!
//! A source runs on its own thread once started, hands every completed change-set to
//! [DataSourceUpdates], and stops when its [LifetimeToken] is cancelled.
use std::sync::Arc;

use crate::protocol::ProtocolError;
use crate::Result;

mod backoff;
mod offline;
mod polling;
mod signal;
mod status;
mod streaming;
mod sync;
mod test_data;
mod updates;

pub use backoff::BackoffConfig;
pub use offline::OfflineDataSource;
pub use polling::{PollingConfig, PollingDataSource, PollingRequester};
pub use signal::{LifetimeToken, ReadySignal};
pub use status::{DataSourceErrorInfo, DataSourceState, DataSourceStatus, ErrorKind};
pub use streaming::{
    ChannelEventSource, ConnectionLog, EventSender, EventSource, StreamingConfig,
    StreamingDataSource,
};
pub use sync::DataSync;
pub use test_data::{TestData, TestDataSource};
pub use updates::DataSourceUpdates;

/// A failure talking to the server.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server responded with status {0}")]
    Status(u16),

    #[error("connection closed by server")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    /// Whether retrying can help. Authorization failures and most other client errors will not
    /// go away by reconnecting.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TransportError::Status(status) => is_http_error_recoverable(*status),
            _ => true,
        }
    }
}

fn is_http_error_recoverable(status: u16) -> bool {
    if (400..500).contains(&status) {
        matches!(status, 400 | 408 | 429)
    } else {
        true
    }
}

/// A source of flag data.
pub trait DataSource: Send {
    /// Starts delivering data to `updates` until `lifetime` is cancelled or [DataSource::close] is
    /// called. Returns once the source is running, not once it is ready; readiness is reported
    /// through [DataSourceUpdates::ready_signal].
    fn start(&mut self, updates: Arc<DataSourceUpdates>, lifetime: LifetimeToken) -> Result<()>;

    /// Stops the source and waits for its thread to exit. Calling it more than once is harmless.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(400, true)]
    #[test_case(401, false)]
    #[test_case(403, false)]
    #[test_case(404, false)]
    #[test_case(408, true)]
    #[test_case(429, true)]
    #[test_case(500, true)]
    #[test_case(503, true)]
    fn http_status_recoverability(status: u16, recoverable: bool) {
        assert_eq!(TransportError::Status(status).is_recoverable(), recoverable);
    }

    #[test]
    fn network_errors_are_recoverable() {
        assert!(TransportError::Network("reset".into()).is_recoverable());
        assert!(TransportError::Closed.is_recoverable());
    }
}
