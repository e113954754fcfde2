use std::sync::Arc;

use clickhouse::Client;
use serde::Serialize;
use sluice::classifier::{ErrorSource, PeerError};
use sluice::error::{ErrorKind, SluiceError, SluiceResult};
use sluice::sluice_error;
use sluice::types::RawRow;
use tracing::debug;

/// Thin wrapper over the ClickHouse HTTP client.
///
/// Cheaply cloneable; the inner client holds its connection pool in an `Arc`.
/// Every error is wrapped in a [`PeerError`] carrying the server exception
/// code so the classifier can work from data.
#[derive(Clone)]
pub struct ClickHouseClient {
    inner: Arc<Client>,
}

/// Raw-table row in ClickHouse column order.
#[derive(clickhouse::Row, Serialize)]
struct RawRowBinding<'a> {
    _peerdb_uid: &'a str,
    _peerdb_timestamp: i64,
    _peerdb_destination_table_name: &'a str,
    _peerdb_data: &'a str,
    _peerdb_record_type: i16,
    _peerdb_match_data: &'a str,
    _peerdb_batch_id: i64,
    _peerdb_unchanged_toast_columns: &'a str,
}

impl ClickHouseClient {
    /// Creates a client. With an `https://` URL, TLS is handled by the
    /// crate's rustls feature.
    pub fn new(
        url: impl Into<String>,
        user: impl Into<String>,
        password: Option<String>,
        database: impl Into<String>,
    ) -> Self {
        let mut client = Client::default()
            .with_url(url)
            .with_user(user)
            .with_database(database);
        if let Some(password) = password {
            client = client.with_password(password);
        }

        Self {
            inner: Arc::new(client),
        }
    }

    pub async fn execute(&self, sql: &str) -> SluiceResult<()> {
        debug!(sql, "executing clickhouse statement");
        self.inner
            .query(sql)
            .execute()
            .await
            .map_err(classify_error)
    }

    /// Runs a query returning a single column of strings.
    pub async fn fetch_strings(&self, sql: &str) -> SluiceResult<Vec<String>> {
        self.inner
            .query(sql)
            .fetch_all::<String>()
            .await
            .map_err(classify_error)
    }

    /// Runs a query returning `(string, string)` pairs.
    pub async fn fetch_string_pairs(&self, sql: &str) -> SluiceResult<Vec<(String, String)>> {
        self.inner
            .query(sql)
            .fetch_all::<(String, String)>()
            .await
            .map_err(classify_error)
    }

    /// Inserts raw rows through one RowBinary INSERT.
    pub async fn insert_raw_rows(&self, table: &str, rows: &[RawRow]) -> SluiceResult<()> {
        let mut insert = self
            .inner
            .insert::<RawRowBinding<'_>>(table)
            .map_err(classify_error)?;

        for row in rows {
            insert
                .write(&RawRowBinding {
                    _peerdb_uid: &row.uid,
                    _peerdb_timestamp: row.timestamp,
                    _peerdb_destination_table_name: &row.destination_table_name,
                    _peerdb_data: &row.data,
                    _peerdb_record_type: row.record_type,
                    _peerdb_match_data: &row.match_data,
                    _peerdb_batch_id: row.batch_id,
                    _peerdb_unchanged_toast_columns: &row.unchanged_toast_columns,
                })
                .await
                .map_err(classify_error)?;
        }

        insert.end().await.map_err(classify_error)
    }
}

/// Wraps a driver error with the server exception code, when one exists, so
/// the table-driven classifier can route it.
fn classify_error(err: clickhouse::error::Error) -> SluiceError {
    let message = err.to_string();
    let code = match &err {
        clickhouse::error::Error::BadResponse(response) => extract_exception_code(response),
        _ => None,
    };

    sluice_error!(
        ErrorKind::QueryFailed,
        "ClickHouse operation failed",
        message.clone()
    )
    .with_source(PeerError::new(
        ErrorSource::ClickHouse,
        code.unwrap_or_else(|| "UNKNOWN".to_string()),
        message,
    ))
}

/// Pulls the numeric code out of `Code: 241. DB::Exception: ...` responses.
fn extract_exception_code(response: &str) -> Option<String> {
    let rest = response.strip_prefix("Code: ")?;
    let end = rest.find(['.', ','])?;
    let code = &rest[..end];
    code.chars().all(|c| c.is_ascii_digit()).then(|| code.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_codes_parse_from_server_responses() {
        assert_eq!(
            extract_exception_code("Code: 241. DB::Exception: Memory limit exceeded"),
            Some("241".to_string())
        );
        assert_eq!(
            extract_exception_code("Code: 60. DB::Exception: Table x does not exist"),
            Some("60".to_string())
        );
        assert_eq!(extract_exception_code("unexpected"), None);
    }
}
