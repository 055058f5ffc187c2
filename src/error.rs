use std::sync::Arc;

use crate::changeset::ChangeSetError;
use crate::data_source::TransportError;
use crate::data_store::StoreError;
use crate::protocol::ProtocolError;

/// Result type for the data synchronization side of the library.
///
/// Flag evaluation never fails this way; it reports problems through [crate::Reason::Error].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    ChangeSet(#[from] ChangeSetError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The data source has already been started once.
    #[error("data source already started")]
    AlreadyStarted,

    /// The data sync was closed before the operation could complete.
    #[error("data sync is closed")]
    Closed,

    /// A data source thread panicked. This should normally never happen.
    #[error("data source thread panicked")]
    DataSourcePanicked,

    /// An I/O error, e.g. failing to spawn a thread.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}
