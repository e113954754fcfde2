use std::{error, fmt, result};

/// Type alias for convenience when using the Result type with our error.
pub type SluiceResult<T> = result::Result<T, SluiceError>;

/// Internal error representation with kind, description and optional detail
/// plus source error.
///
/// Boxed to keep the public [`SluiceError`] one pointer wide on the success
/// path.
struct ErrorInner {
    kind: ErrorKind,
    description: &'static str,
    detail: Option<String>,
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

/// Flat classification of engine errors.
///
/// Kinds are deliberately coarse; the classifier in [`crate::classifier`]
/// derives user-facing classes and retry behavior from kind plus driver
/// codes and message patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Connection establishment or loss against any peer.
    ConnectionFailed,
    /// Authentication or authorization rejection.
    AuthenticationFailed,
    /// A query against source, destination or catalog failed.
    QueryFailed,
    /// The source replication stream failed mid-pull.
    ReplicationStreamFailed,
    /// The replication slot is gone or can no longer be read.
    ReplicationSlotInvalid,
    /// The publication backing the mirror does not exist.
    PublicationMissing,
    /// The source binlog position or GTID set is no longer available.
    BinlogInvalid,
    /// The snapshot identifier exported for the initial copy has expired.
    InvalidSnapshotIdentifier,
    /// A destination object was dropped or altered out from under the mirror.
    DestinationModified,
    /// A source or destination ran out of memory.
    OutOfMemory,
    /// Value could not be represented without loss at the destination.
    LossyConversion,
    /// A source value kind has no destination mapping.
    UnsupportedDataType,
    /// The peer kind does not implement the requested capability.
    UnsupportedCapability,
    /// Catalog (metadata store) operation failed.
    CatalogFailed,
    /// The change-buffer spill store failed.
    SpillFailed,
    /// Encoding or decoding of buffered or staged values failed.
    SerializationFailed,
    /// Batch cursors were observed violating their monotonicity invariants.
    InvalidState,
    /// Configuration was missing or inconsistent at use time.
    ConfigError,
    /// A validation check on operator input failed.
    ValidationError,
    /// The destination schema drifted in a way the engine refuses to guess at.
    SchemaDrift,
    /// A worker task panicked.
    WorkerPanic,
    /// A worker task was cancelled.
    WorkerCancelled,
    /// Operation was cancelled by shutdown or workflow cancellation.
    Cancelled,
    /// Clean end-of-stream from a peer.
    Eof,
    /// An I/O failure outside any specific driver.
    Io,
    /// The source asked the engine to terminate (admin shutdown).
    SourceTerminated,
    /// Anything not covered above.
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A stable error type for the engine.
///
/// Carries a kind for classification, a static description, an optional
/// dynamic detail and an optional source error. Construct through
/// [`crate::sluice_error!`] or the `From` tuples below.
pub struct SluiceError(Box<ErrorInner>);

impl SluiceError {
    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    /// Returns the static description.
    pub fn description(&self) -> &'static str {
        self.0.description
    }

    /// Returns the dynamic detail, if any.
    pub fn detail(&self) -> Option<&str> {
        self.0.detail.as_deref()
    }

    /// Attaches a source error, keeping kind and description.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        self.0.source = Some(source.into());
        self
    }

    /// Walks the source chain looking for a typed driver error.
    pub fn downcast_source<T: error::Error + 'static>(&self) -> Option<&T> {
        let mut source = self.0.source.as_deref().map(|e| e as &dyn error::Error);
        while let Some(err) = source {
            if let Some(typed) = err.downcast_ref::<T>() {
                return Some(typed);
            }
            source = err.source();
        }
        None
    }
}

impl fmt::Debug for SluiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SluiceError")
            .field("kind", &self.0.kind)
            .field("description", &self.0.description)
            .field("detail", &self.0.detail)
            .field("source", &self.0.source)
            .finish()
    }
}

impl fmt::Display for SluiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.0.kind, self.0.description)?;
        if let Some(detail) = &self.0.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

impl error::Error for SluiceError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn error::Error + 'static))
    }
}

impl From<(ErrorKind, &'static str)> for SluiceError {
    fn from((kind, description): (ErrorKind, &'static str)) -> Self {
        SluiceError(Box::new(ErrorInner {
            kind,
            description,
            detail: None,
            source: None,
        }))
    }
}

impl From<(ErrorKind, &'static str, String)> for SluiceError {
    fn from((kind, description, detail): (ErrorKind, &'static str, String)) -> Self {
        SluiceError(Box::new(ErrorInner {
            kind,
            description,
            detail: Some(detail),
            source: None,
        }))
    }
}

impl From<tokio_postgres::Error> for SluiceError {
    fn from(err: tokio_postgres::Error) -> Self {
        let kind = match err.as_db_error() {
            Some(db_err) => match db_err.code().code() {
                // Class 08: connection exceptions.
                "08000" | "08001" | "08003" | "08004" | "08006" | "08P01" => {
                    ErrorKind::ConnectionFailed
                }
                // Class 28: authorization.
                "28000" | "28P01" | "42501" => ErrorKind::AuthenticationFailed,
                "53200" => ErrorKind::OutOfMemory,
                "57P01" | "57P05" => ErrorKind::SourceTerminated,
                _ => ErrorKind::QueryFailed,
            },
            None => {
                if err.is_closed() {
                    ErrorKind::ConnectionFailed
                } else {
                    ErrorKind::QueryFailed
                }
            }
        };

        SluiceError::from((kind, "Postgres operation failed", err.to_string())).with_source(err)
    }
}

impl From<sqlx::Error> for SluiceError {
    fn from(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::Configuration(_) => ErrorKind::ConfigError,
            sqlx::Error::Io(_) => ErrorKind::Io,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => ErrorKind::ConnectionFailed,
            sqlx::Error::RowNotFound => ErrorKind::CatalogFailed,
            _ => ErrorKind::CatalogFailed,
        };

        SluiceError::from((kind, "Catalog operation failed", err.to_string())).with_source(err)
    }
}

impl From<mysql_async::Error> for SluiceError {
    fn from(err: mysql_async::Error) -> Self {
        let kind = match &err {
            mysql_async::Error::Io(_) => ErrorKind::ConnectionFailed,
            mysql_async::Error::Server(server_err) => match server_err.code {
                1236 | 1373 => ErrorKind::BinlogInvalid,
                1037 | 1038 | 1041 | 3015 => ErrorKind::OutOfMemory,
                1044 | 1045 | 1130 | 1133 => ErrorKind::AuthenticationFailed,
                1040 | 1053 | 1152 => ErrorKind::ConnectionFailed,
                _ => ErrorKind::QueryFailed,
            },
            _ => ErrorKind::QueryFailed,
        };

        SluiceError::from((kind, "MySQL operation failed", err.to_string())).with_source(err)
    }
}

impl From<mongodb::error::Error> for SluiceError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind as MongoKind;

        let kind = match err.kind.as_ref() {
            MongoKind::Authentication { .. } => ErrorKind::AuthenticationFailed,
            MongoKind::Io(_) | MongoKind::ConnectionPoolCleared { .. } => {
                ErrorKind::ConnectionFailed
            }
            _ => ErrorKind::QueryFailed,
        };

        SluiceError::from((kind, "MongoDB operation failed", err.to_string())).with_source(err)
    }
}

impl From<redb::Error> for SluiceError {
    fn from(err: redb::Error) -> Self {
        SluiceError::from((
            ErrorKind::SpillFailed,
            "Spill store operation failed",
            err.to_string(),
        ))
        .with_source(err)
    }
}

impl From<serde_json::Error> for SluiceError {
    fn from(err: serde_json::Error) -> Self {
        SluiceError::from((
            ErrorKind::SerializationFailed,
            "JSON encoding failed",
            err.to_string(),
        ))
        .with_source(err)
    }
}

impl From<std::io::Error> for SluiceError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ErrorKind::Eof,
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                ErrorKind::ConnectionFailed
            }
            _ => ErrorKind::Io,
        };

        SluiceError::from((kind, "I/O operation failed", err.to_string())).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let err = SluiceError::from((
            ErrorKind::QueryFailed,
            "Merge failed",
            "table orders".to_string(),
        ));
        let rendered = err.to_string();
        assert!(rendered.contains("Merge failed"));
        assert!(rendered.contains("table orders"));
    }

    #[test]
    fn downcast_source_walks_the_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = SluiceError::from(io);
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert!(err.downcast_source::<std::io::Error>().is_some());
    }
}
