use chrono::{DateTime, Utc};

use super::TransportError;

/// Where a data source is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataSourceState {
    /// No data set has been received yet.
    Initializing,
    /// The store holds data from the source and the source is connected.
    Valid,
    /// The source lost its connection or received bad data and is trying to recover. The store
    /// keeps serving the last data it received.
    Interrupted,
    /// The source was shut down, or hit an error it cannot recover from.
    Closed,
}

/// Broad categories of data source failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The connection failed or dropped.
    NetworkError,
    /// The source received data it could not parse.
    InvalidData,
    /// The server answered with an error status or an error event.
    ErrorResponse,
    /// Storing received data failed.
    StoreError,
    Unknown,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataSourceErrorInfo {
    pub kind: ErrorKind,
    /// The HTTP status, when the failure was an error response.
    pub status_code: Option<u16>,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl DataSourceErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        DataSourceErrorInfo {
            kind,
            status_code: None,
            message: message.into(),
            time: Utc::now(),
        }
    }
}

impl From<&TransportError> for DataSourceErrorInfo {
    fn from(err: &TransportError) -> Self {
        let kind = match err {
            TransportError::Network(_) | TransportError::Closed => ErrorKind::NetworkError,
            TransportError::Status(_) => ErrorKind::ErrorResponse,
            TransportError::Protocol(_) => ErrorKind::InvalidData,
        };
        let mut info = DataSourceErrorInfo::new(kind, err.to_string());
        if let TransportError::Status(status) = err {
            info.status_code = Some(*status);
        }
        info
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataSourceStatus {
    pub state: DataSourceState,
    /// When `state` was entered.
    pub state_since: DateTime<Utc>,
    /// The most recent failure, kept after the source recovers.
    pub last_error: Option<DataSourceErrorInfo>,
}

impl DataSourceStatus {
    pub(crate) fn new() -> Self {
        DataSourceStatus {
            state: DataSourceState::Initializing,
            state_since: Utc::now(),
            last_error: None,
        }
    }
}
