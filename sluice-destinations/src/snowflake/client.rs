use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sluice::classifier::{ErrorSource, PeerError};
use sluice::error::{ErrorKind, SluiceError, SluiceResult};
use sluice::sluice_error;
use sluice_config::SnowflakeConfig;
use tracing::debug;

/// Lifetime of one signed JWT. Snowflake caps these at an hour; renewing a
/// few minutes early avoids clock-skew rejections.
const JWT_LIFETIME: Duration = Duration::from_secs(55 * 60);

#[derive(Serialize)]
struct Claims {
    iss: String,
    sub: String,
    iat: u64,
    exp: u64,
}

#[derive(Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    timeout: u64,
    database: &'a str,
    schema: Option<&'a str>,
    warehouse: &'a str,
    role: Option<&'a str>,
    parameters: StatementParameters,
}

#[derive(Serialize)]
struct StatementParameters {
    query_tag: String,
}

#[derive(Deserialize)]
struct StatementResponse {
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

struct CachedToken {
    token: String,
    expires_at: SystemTime,
}

/// Snowflake SQL API client authenticated with key-pair JWTs.
///
/// Statements run with a `sluice-mirror-<name>` query tag so operators can
/// attribute warehouse load to mirrors.
#[derive(Clone)]
pub struct SnowflakeClient {
    http: reqwest::Client,
    config: Arc<SnowflakeConfig>,
    encoding_key: Arc<EncodingKey>,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl SnowflakeClient {
    pub fn new(config: SnowflakeConfig) -> SluiceResult<Self> {
        let encoding_key =
            EncodingKey::from_rsa_pem(config.private_key.as_bytes()).map_err(|err| {
                sluice_error!(
                    ErrorKind::ConfigError,
                    "Invalid Snowflake private key",
                    err.to_string()
                )
            })?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.query_timeout_secs.max(1)))
            .build()
            .map_err(|err| {
                sluice_error!(
                    ErrorKind::ConfigError,
                    "Failed to build HTTP client",
                    err.to_string()
                )
            })?;

        Ok(Self {
            http,
            config: Arc::new(config),
            encoding_key: Arc::new(encoding_key),
            token: Arc::new(Mutex::new(None)),
        })
    }

    fn statements_url(&self) -> String {
        format!(
            "https://{}.snowflakecomputing.com/api/v2/statements",
            self.config.account_id
        )
    }

    /// Returns a valid JWT, signing a fresh one when the cache expired.
    fn bearer_token(&self) -> SluiceResult<String> {
        let now = SystemTime::now();

        {
            let cached = self.token.lock();
            if let Some(cached) = cached.as_ref()
                && cached.expires_at > now
            {
                return Ok(cached.token.clone());
            }
        }

        let account = self.config.account_id.to_uppercase();
        let user = self.config.username.to_uppercase();
        let qualified_user = format!("{account}.{user}");
        let issued_at = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();

        let claims = Claims {
            iss: format!(
                "{qualified_user}.{}",
                self.config.public_key_fingerprint
            ),
            sub: qualified_user,
            iat: issued_at,
            exp: issued_at + JWT_LIFETIME.as_secs(),
        };

        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.encoding_key,
        )
        .map_err(|err| {
            sluice_error!(
                ErrorKind::AuthenticationFailed,
                "Failed to sign Snowflake JWT",
                err.to_string()
            )
        })?;

        *self.token.lock() = Some(CachedToken {
            token: token.clone(),
            expires_at: now + JWT_LIFETIME - Duration::from_secs(60),
        });

        Ok(token)
    }

    /// Executes one statement, returning the result rows as text cells.
    pub async fn execute(
        &self,
        mirror_name: &str,
        statement: &str,
    ) -> SluiceResult<Vec<Vec<Option<String>>>> {
        debug!(statement, "executing snowflake statement");

        let request = StatementRequest {
            statement,
            timeout: self.config.query_timeout_secs,
            database: &self.config.database,
            schema: None,
            warehouse: &self.config.warehouse,
            role: self.config.role.as_deref(),
            parameters: StatementParameters {
                query_tag: format!("sluice-mirror-{mirror_name}"),
            },
        };

        let response = self
            .http
            .post(self.statements_url())
            .bearer_auth(self.bearer_token()?)
            .header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body: StatementResponse = response.json().await.map_err(transport_error)?;

        if !status.is_success() {
            let code = body.code.unwrap_or_else(|| status.as_u16().to_string());
            let message = body.message.unwrap_or_else(|| "statement failed".to_string());
            return Err(sluice_error!(
                ErrorKind::QueryFailed,
                "Snowflake statement failed",
                format!("[{code}] {message}")
            )
            .with_source(PeerError::new(ErrorSource::Snowflake, code, message)));
        }

        Ok(body.data)
    }
}

fn transport_error(err: reqwest::Error) -> SluiceError {
    let kind = if err.is_timeout() {
        ErrorKind::QueryFailed
    } else if err.is_connect() {
        ErrorKind::ConnectionFailed
    } else {
        ErrorKind::Io
    };

    sluice_error!(kind, "Snowflake transport failed", err.to_string()).with_source(err)
}
