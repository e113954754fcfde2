//! Error classifier: maps heterogeneous driver errors onto a small taxonomy
//! that drives retry, alerting or suppression.
//!
//! Classification is table-driven. Code tables map `(source, code)` pairs to
//! classes; message tables refine a code with a regex over the server message.
//! New patterns are added as data, not as new match arms.

use std::sync::LazyLock;

use metrics::counter;
use regex::Regex;

use crate::error::{ErrorKind, SluiceError};
use crate::metrics::SLUICE_ERRORS_CLASSIFIED_TOTAL;

/// What the engine does with an error of a given class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorAction {
    /// Pause the mirror and alert the operator.
    NotifyUser,
    /// Count and log; the activity still fails for retry.
    NotifyTelemetry,
    /// Swallow at the activity boundary.
    Ignore,
    /// Re-raise with the sentinel driving bounded exponential backoff.
    RetryRecoverable,
}

/// Which peer family produced the error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorSource {
    Postgres,
    MySql,
    Mongo,
    ClickHouse,
    Snowflake,
    BigQuery,
    Catalog,
    Net,
    Other,
}

impl ErrorSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSource::Postgres => "postgres",
            ErrorSource::MySql => "mysql",
            ErrorSource::Mongo => "mongo",
            ErrorSource::ClickHouse => "clickhouse",
            ErrorSource::Snowflake => "snowflake",
            ErrorSource::BigQuery => "bigquery",
            ErrorSource::Catalog => "catalog",
            ErrorSource::Net => "net",
            ErrorSource::Other => "other",
        }
    }
}

/// A classified error: stable class name plus the action it implies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorClass {
    pub name: &'static str,
    pub action: ErrorAction,
}

/// Fine-grained provenance attached to a classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorInfo {
    pub source: ErrorSource,
    pub code: String,
}

impl ErrorInfo {
    fn new(source: ErrorSource, code: impl Into<String>) -> Self {
        Self {
            source,
            code: code.into(),
        }
    }
}

pub const NOTIFY_DESTINATION_MODIFIED: ErrorClass = ErrorClass {
    name: "NOTIFY_DESTINATION_MODIFIED",
    action: ErrorAction::NotifyUser,
};
pub const NOTIFY_MV_OR_VIEW: ErrorClass = ErrorClass {
    name: "NOTIFY_MV_OR_VIEW",
    action: ErrorAction::NotifyUser,
};
pub const NOTIFY_OOM: ErrorClass = ErrorClass {
    name: "NOTIFY_OOM",
    action: ErrorAction::NotifyUser,
};
pub const NOTIFY_OOM_SOURCE: ErrorClass = ErrorClass {
    name: "NOTIFY_OOM_SOURCE",
    action: ErrorAction::NotifyUser,
};
pub const NOTIFY_CONNECTIVITY: ErrorClass = ErrorClass {
    name: "NOTIFY_CONNECTIVITY",
    action: ErrorAction::NotifyUser,
};
pub const NOTIFY_SLOT_INVALID: ErrorClass = ErrorClass {
    name: "NOTIFY_SLOT_INVALID",
    action: ErrorAction::NotifyUser,
};
pub const NOTIFY_BINLOG_INVALID: ErrorClass = ErrorClass {
    name: "NOTIFY_BINLOG_INVALID",
    action: ErrorAction::NotifyUser,
};
pub const NOTIFY_PUBLICATION_MISSING: ErrorClass = ErrorClass {
    name: "NOTIFY_PUBLICATION_MISSING",
    action: ErrorAction::NotifyUser,
};
pub const NOTIFY_SOURCE_TABLE_MISSING: ErrorClass = ErrorClass {
    name: "NOTIFY_SOURCE_TABLE_MISSING",
    action: ErrorAction::NotifyUser,
};
pub const NOTIFY_UNSUPPORTED_DATATYPE: ErrorClass = ErrorClass {
    name: "NOTIFY_UNSUPPORTED_DATATYPE",
    action: ErrorAction::NotifyUser,
};
pub const NOTIFY_INVALID_SNAPSHOT_IDENTIFIER: ErrorClass = ErrorClass {
    name: "NOTIFY_INVALID_SNAPSHOT_IDENTIFIER",
    action: ErrorAction::NotifyUser,
};
pub const NOTIFY_SCHEMA_DRIFT: ErrorClass = ErrorClass {
    name: "NOTIFY_SCHEMA_DRIFT",
    action: ErrorAction::NotifyUser,
};
pub const NOTIFY_TERMINATE: ErrorClass = ErrorClass {
    name: "NOTIFY_TERMINATE",
    action: ErrorAction::NotifyUser,
};
pub const IGNORE_EOF: ErrorClass = ErrorClass {
    name: "IGNORE_EOF",
    action: ErrorAction::Ignore,
};
pub const IGNORE_CONN_TEMPORARY: ErrorClass = ErrorClass {
    name: "IGNORE_CONN_TEMPORARY",
    action: ErrorAction::Ignore,
};
pub const IGNORE_CONTEXT_CANCELLED: ErrorClass = ErrorClass {
    name: "IGNORE_CONTEXT_CANCELLED",
    action: ErrorAction::Ignore,
};
pub const RETRY_RECOVERABLE: ErrorClass = ErrorClass {
    name: "ERROR_RETRY_RECOVERABLE",
    action: ErrorAction::RetryRecoverable,
};
pub const WARNING_LOSSY_CONVERSION: ErrorClass = ErrorClass {
    name: "WARNING_LOSSY_CONVERSION",
    action: ErrorAction::NotifyTelemetry,
};
pub const INTERNAL: ErrorClass = ErrorClass {
    name: "INTERNAL",
    action: ErrorAction::NotifyTelemetry,
};
pub const OTHER: ErrorClass = ErrorClass {
    name: "OTHER",
    action: ErrorAction::NotifyTelemetry,
};

/// A typed wrapper destinations attach to driver errors so the classifier can
/// work from `(source, code, message)` without linking every driver crate.
#[derive(Debug)]
pub struct PeerError {
    pub source: ErrorSource,
    pub code: String,
    pub message: String,
}

impl PeerError {
    pub fn new(
        source: ErrorSource,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.source.as_str(), self.code, self.message)
    }
}

impl std::error::Error for PeerError {}

/// One `(source, code) -> class` rule.
struct CodeRule {
    source: ErrorSource,
    codes: &'static [&'static str],
    class: ErrorClass,
}

/// One `(source, code?, message regex) -> class` refinement. Message rules
/// run before code rules so a more specific pattern can override.
struct MessageRule {
    source: ErrorSource,
    code: Option<&'static str>,
    pattern: &'static str,
    class: ErrorClass,
}

static CODE_RULES: &[CodeRule] = &[
    // Postgres SQLSTATE classes.
    CodeRule {
        source: ErrorSource::Postgres,
        codes: &[
            "28000", "28P01", "42501", "42P01", "53100", "53300", "54000", "08000", "08003",
            "08006", "08001", "08004", "08P01", "3D000", "57P03",
        ],
        class: NOTIFY_CONNECTIVITY,
    },
    CodeRule {
        source: ErrorSource::Postgres,
        codes: &["53200"],
        class: NOTIFY_OOM_SOURCE,
    },
    CodeRule {
        source: ErrorSource::Postgres,
        codes: &["57P01", "57P05"],
        class: NOTIFY_TERMINATE,
    },
    CodeRule {
        source: ErrorSource::Postgres,
        codes: &["57014"],
        class: RETRY_RECOVERABLE,
    },
    // MySQL/MariaDB numeric codes.
    CodeRule {
        source: ErrorSource::MySql,
        codes: &["1236", "1373"],
        class: NOTIFY_BINLOG_INVALID,
    },
    CodeRule {
        source: ErrorSource::MySql,
        codes: &["1037", "1038", "1041", "3015"],
        class: NOTIFY_OOM_SOURCE,
    },
    CodeRule {
        source: ErrorSource::MySql,
        codes: &[
            "1021", "1040", "1044", "1045", "1049", "1051", "1053", "1102", "1103", "1109",
            "1119", "1129", "1130", "1133", "1135", "1152", "1194", "1195", "1827",
        ],
        class: NOTIFY_CONNECTIVITY,
    },
    // ClickHouse server codes.
    CodeRule {
        source: ErrorSource::ClickHouse,
        codes: &["241"],
        class: NOTIFY_OOM,
    },
    CodeRule {
        source: ErrorSource::ClickHouse,
        codes: &["60", "16"],
        class: NOTIFY_DESTINATION_MODIFIED,
    },
    CodeRule {
        source: ErrorSource::ClickHouse,
        codes: &["81"],
        class: NOTIFY_CONNECTIVITY,
    },
    CodeRule {
        source: ErrorSource::ClickHouse,
        codes: &["202"],
        class: IGNORE_CONN_TEMPORARY,
    },
    CodeRule {
        source: ErrorSource::ClickHouse,
        codes: &["394", "1000", "439", "516"],
        class: RETRY_RECOVERABLE,
    },
];

static MESSAGE_RULES: &[MessageRule] = &[
    MessageRule {
        source: ErrorSource::Postgres,
        code: Some("42704"),
        pattern: r#"publication ".*?" does not exist"#,
        class: NOTIFY_PUBLICATION_MISSING,
    },
    MessageRule {
        source: ErrorSource::Postgres,
        code: Some("55000"),
        pattern: r"cannot read from logical replication slot|can no longer get changes from replication slot|could not import the requested snapshot",
        class: NOTIFY_SLOT_INVALID,
    },
    MessageRule {
        source: ErrorSource::Postgres,
        code: Some("22023"),
        pattern: r"invalid snapshot identifier",
        class: NOTIFY_INVALID_SNAPSHOT_IDENTIFIER,
    },
    MessageRule {
        source: ErrorSource::Postgres,
        code: Some("XX000"),
        pattern: r"requested WAL segment \w+ has already been removed|could not read from reorderbuffer spill file|could not find record while sending logically-decoded data",
        class: RETRY_RECOVERABLE,
    },
    // "while pushing to view" upgrades table-shape errors to an MV problem.
    MessageRule {
        source: ErrorSource::ClickHouse,
        code: None,
        pattern: r"while pushing to view",
        class: NOTIFY_MV_OR_VIEW,
    },
    MessageRule {
        source: ErrorSource::ClickHouse,
        code: None,
        pattern: r"Cannot parse type Decimal\(\d+, \d+\), expected non-empty binary data with size equal to or less than \d+, got \d+",
        class: NOTIFY_UNSUPPORTED_DATATYPE,
    },
    MessageRule {
        source: ErrorSource::Net,
        code: None,
        pattern: r"(?i)connection reset by peer|broken pipe|use of closed (network )?connection",
        class: IGNORE_CONN_TEMPORARY,
    },
    MessageRule {
        source: ErrorSource::Net,
        code: None,
        pattern: r"(?i)no such host|name resolution|dns error",
        class: NOTIFY_CONNECTIVITY,
    },
];

static COMPILED_MESSAGE_RULES: LazyLock<Vec<(Regex, &'static MessageRule)>> =
    LazyLock::new(|| {
        MESSAGE_RULES
            .iter()
            .map(|rule| {
                let regex =
                    Regex::new(rule.pattern).expect("static classifier pattern must compile");
                (regex, rule)
            })
            .collect()
    });

/// Classifies an error into `(class, info)`.
///
/// The lookup order is: engine error kind fast paths, then the typed
/// `(source, code, message)` attached by drivers, with message refinements
/// taking precedence over bare code rules.
pub fn classify(error: &SluiceError) -> (ErrorClass, ErrorInfo) {
    let (class, info) = classify_inner(error);

    counter!(SLUICE_ERRORS_CLASSIFIED_TOTAL, "class" => class.name).increment(1);

    (class, info)
}

fn classify_inner(error: &SluiceError) -> (ErrorClass, ErrorInfo) {
    // Cancellation and clean end-of-stream are ignorable no matter which
    // driver reported them.
    match error.kind() {
        ErrorKind::Cancelled => {
            return (
                IGNORE_CONTEXT_CANCELLED,
                ErrorInfo::new(ErrorSource::Other, "CONTEXT_CANCELLED"),
            );
        }
        ErrorKind::Eof => {
            return (IGNORE_EOF, ErrorInfo::new(ErrorSource::Net, "EOF"));
        }
        _ => {}
    }

    // Typed Postgres errors carry SQLSTATE directly.
    if let Some(pg_err) = error.downcast_source::<tokio_postgres::Error>() {
        if let Some(db_err) = pg_err.as_db_error() {
            let code = db_err.code().code();
            let message = db_err.message();
            return classify_tables(ErrorSource::Postgres, code, message);
        }
        return (
            NOTIFY_CONNECTIVITY,
            ErrorInfo::new(ErrorSource::Postgres, "UNKNOWN"),
        );
    }

    // Typed MySQL server errors carry the numeric code.
    if let Some(my_err) = error.downcast_source::<mysql_async::Error>() {
        if let mysql_async::Error::Server(server_err) = my_err {
            let code = server_err.code.to_string();
            return classify_tables(ErrorSource::MySql, &code, &server_err.message);
        }
        return (
            NOTIFY_CONNECTIVITY,
            ErrorInfo::new(ErrorSource::MySql, "UNKNOWN"),
        );
    }

    // Destination drivers attach a PeerError with their native code.
    if let Some(peer_err) = error.downcast_source::<PeerError>() {
        return classify_tables(peer_err.source, &peer_err.code, &peer_err.message);
    }

    if let Some(io_err) = error.downcast_source::<std::io::Error>() {
        return classify_tables(ErrorSource::Net, "IO", &io_err.to_string());
    }

    // Remaining kinds with no driver context fall back to kind-derived
    // classes.
    match error.kind() {
        ErrorKind::PublicationMissing => (
            NOTIFY_PUBLICATION_MISSING,
            ErrorInfo::new(ErrorSource::Postgres, "42704"),
        ),
        ErrorKind::ReplicationSlotInvalid => (
            NOTIFY_SLOT_INVALID,
            ErrorInfo::new(ErrorSource::Postgres, "55000"),
        ),
        ErrorKind::BinlogInvalid => (
            NOTIFY_BINLOG_INVALID,
            ErrorInfo::new(ErrorSource::MySql, "1236"),
        ),
        ErrorKind::InvalidSnapshotIdentifier => (
            NOTIFY_INVALID_SNAPSHOT_IDENTIFIER,
            ErrorInfo::new(ErrorSource::Postgres, "22023"),
        ),
        ErrorKind::LossyConversion => (
            WARNING_LOSSY_CONVERSION,
            ErrorInfo::new(ErrorSource::Other, "NUMERIC_OUT_OF_RANGE"),
        ),
        ErrorKind::UnsupportedDataType => (
            NOTIFY_UNSUPPORTED_DATATYPE,
            ErrorInfo::new(ErrorSource::Other, "UNSUPPORTED_DATATYPE"),
        ),
        ErrorKind::SchemaDrift => (
            NOTIFY_SCHEMA_DRIFT,
            ErrorInfo::new(ErrorSource::Other, "SCHEMA_DRIFT"),
        ),
        ErrorKind::SourceTerminated => (
            NOTIFY_TERMINATE,
            ErrorInfo::new(ErrorSource::Postgres, "57P01"),
        ),
        ErrorKind::CatalogFailed => {
            (INTERNAL, ErrorInfo::new(ErrorSource::Catalog, "UNKNOWN"))
        }
        ErrorKind::ConnectionFailed | ErrorKind::AuthenticationFailed => (
            NOTIFY_CONNECTIVITY,
            ErrorInfo::new(ErrorSource::Net, "UNKNOWN"),
        ),
        ErrorKind::OutOfMemory => (NOTIFY_OOM, ErrorInfo::new(ErrorSource::Other, "OOM")),
        ErrorKind::DestinationModified => (
            NOTIFY_DESTINATION_MODIFIED,
            ErrorInfo::new(ErrorSource::Other, "UNKNOWN"),
        ),
        _ => (OTHER, ErrorInfo::new(ErrorSource::Other, "UNKNOWN")),
    }
}

fn classify_tables(source: ErrorSource, code: &str, message: &str) -> (ErrorClass, ErrorInfo) {
    for (regex, rule) in COMPILED_MESSAGE_RULES.iter() {
        if rule.source != source {
            continue;
        }
        if let Some(rule_code) = rule.code
            && rule_code != code
        {
            continue;
        }
        if regex.is_match(message) {
            return (rule.class, ErrorInfo::new(source, code));
        }
    }

    for rule in CODE_RULES {
        if rule.source == source && rule.codes.contains(&code) {
            return (rule.class, ErrorInfo::new(source, code));
        }
    }

    (OTHER, ErrorInfo::new(source, code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sluice_error;

    fn peer_error(source: ErrorSource, code: &str, message: &str) -> SluiceError {
        sluice_error!(ErrorKind::QueryFailed, "Peer operation failed")
            .with_source(PeerError::new(source, code, message))
    }

    #[test]
    fn dropped_publication_notifies_user() {
        let err = peer_error(
            ErrorSource::Postgres,
            "42704",
            r#"publication "sluice_pub_orders" does not exist"#,
        );
        let (class, info) = classify(&err);
        assert_eq!(class, NOTIFY_PUBLICATION_MISSING);
        assert_eq!(class.action, ErrorAction::NotifyUser);
        assert_eq!(info.code, "42704");
    }

    #[test]
    fn invalidated_slot_notifies_user() {
        let err = peer_error(
            ErrorSource::Postgres,
            "55000",
            "cannot read from logical replication slot \"sluice_orders\"",
        );
        let (class, _) = classify(&err);
        assert_eq!(class, NOTIFY_SLOT_INVALID);
    }

    #[test]
    fn removed_wal_segment_is_recoverable() {
        let err = peer_error(
            ErrorSource::Postgres,
            "XX000",
            "requested WAL segment 000000010000000000000012 has already been removed",
        );
        let (class, _) = classify(&err);
        assert_eq!(class, RETRY_RECOVERABLE);
        assert_eq!(class.action, ErrorAction::RetryRecoverable);
    }

    #[test]
    fn mysql_binlog_errors_notify_user() {
        for code in ["1236", "1373"] {
            let err = peer_error(
                ErrorSource::MySql,
                code,
                "Could not find first log file name in binary log index file",
            );
            let (class, info) = classify(&err);
            assert_eq!(class, NOTIFY_BINLOG_INVALID);
            assert_eq!(info.code, code);
        }
    }

    #[test]
    fn clickhouse_unknown_table_is_destination_modified_unless_mv() {
        let plain = peer_error(ErrorSource::ClickHouse, "60", "Table db.orders does not exist");
        assert_eq!(classify(&plain).0, NOTIFY_DESTINATION_MODIFIED);

        let mv = peer_error(
            ErrorSource::ClickHouse,
            "60",
            "Table db.orders_agg does not exist: while pushing to view db.orders_mv",
        );
        assert_eq!(classify(&mv).0, NOTIFY_MV_OR_VIEW);
    }

    #[test]
    fn clickhouse_memory_limit_is_oom() {
        let err = peer_error(
            ErrorSource::ClickHouse,
            "241",
            "Memory limit (total) exceeded: would use 12.01 GiB",
        );
        assert_eq!(classify(&err).0, NOTIFY_OOM);
    }

    #[test]
    fn clickhouse_decimal_parse_is_unsupported_datatype() {
        let err = peer_error(
            ErrorSource::ClickHouse,
            "69",
            "Cannot parse type Decimal(76, 38), expected non-empty binary data \
             with size equal to or less than 32, got 33",
        );
        assert_eq!(classify(&err).0, NOTIFY_UNSUPPORTED_DATATYPE);
    }

    #[test]
    fn cancellation_and_eof_are_ignored() {
        let cancelled = sluice_error!(ErrorKind::Cancelled, "Pull aborted");
        let (class, info) = classify(&cancelled);
        assert_eq!(class, IGNORE_CONTEXT_CANCELLED);
        assert_eq!(class.action, ErrorAction::Ignore);
        assert_eq!(info.code, "CONTEXT_CANCELLED");

        let eof = sluice_error!(ErrorKind::Eof, "Stream ended");
        assert_eq!(classify(&eof).0, IGNORE_EOF);
    }

    #[test]
    fn connection_reset_is_temporary() {
        let err = peer_error(ErrorSource::Net, "IO", "read: connection reset by peer");
        assert_eq!(classify(&err).0, IGNORE_CONN_TEMPORARY);
    }

    #[test]
    fn lossy_conversion_is_telemetry_only() {
        let err = sluice_error!(
            ErrorKind::LossyConversion,
            "Numeric out of destination range",
            "orders.total"
        );
        let (class, _) = classify(&err);
        assert_eq!(class, WARNING_LOSSY_CONVERSION);
        assert_eq!(class.action, ErrorAction::NotifyTelemetry);
    }
}
