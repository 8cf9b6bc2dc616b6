//! Time-bounded cache of assumed-role temporary credentials.
//!
//! Workers that execute steps for the same role within the TTL share one set
//! of temporary credentials instead of assuming the role per step. The TTL
//! amortizes refreshes, so the lock is held across the acquisition call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::OrchestrationError;
use crate::Result;

/// Environment variables injected into subprocesses.
pub const ACCESS_KEY_ID_VAR: &str = "ACCESS_KEY_ID";
pub const SECRET_ACCESS_KEY_VAR: &str = "SECRET_ACCESS_KEY";
pub const SESSION_TOKEN_VAR: &str = "SESSION_TOKEN";

/// How long the same credentials are handed out for one role.
pub const DEFAULT_CREDENTIALS_TTL: Duration = Duration::from_secs(5 * 60);

/// Lifetime requested for the temporary credentials themselves.
const CREDENTIALS_DURATION_SECS: i32 = 60 * 60;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
}

impl Credentials {
    /// The variables to merge into a subprocess environment.
    pub fn env_vars(&self) -> [(&'static str, &str); 3] {
        [
            (ACCESS_KEY_ID_VAR, self.access_key_id.as_str()),
            (SECRET_ACCESS_KEY_VAR, self.secret_access_key.as_str()),
            (SESSION_TOKEN_VAR, self.session_token.as_str()),
        ]
    }
}

/// Acquisition of temporary credentials for a role, delegated to the identity
/// collaborator.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn assume_role(&self, role: &str) -> Result<Credentials>;
}

/// Source that always returns the same credentials. Useful for local runs and
/// tests.
pub struct StaticCredentialSource {
    credentials: Credentials,
}

impl StaticCredentialSource {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn assume_role(&self, _role: &str) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }
}

/// STS-backed source.
pub struct StsCredentialSource {
    client: aws_sdk_sts::Client,
    session_name: String,
}

impl StsCredentialSource {
    pub async fn connect(session_name: &str) -> Self {
        let config = aws_config::load_from_env().await;
        Self {
            client: aws_sdk_sts::Client::new(&config),
            session_name: session_name.to_string(),
        }
    }
}

#[async_trait]
impl CredentialSource for StsCredentialSource {
    async fn assume_role(&self, role: &str) -> Result<Credentials> {
        let output = self
            .client
            .assume_role()
            .role_arn(role)
            .role_session_name(&self.session_name)
            .duration_seconds(CREDENTIALS_DURATION_SECS)
            .send()
            .await
            .map_err(|err| OrchestrationError::Credentials {
                role: role.to_string(),
                reason: err.to_string(),
            })?;
        let credentials = output
            .credentials()
            .ok_or_else(|| OrchestrationError::Credentials {
                role: role.to_string(),
                reason: "no credentials in the response".to_string(),
            })?;
        Ok(Credentials {
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            session_token: credentials.session_token().to_string(),
        })
    }
}

struct CacheEntry {
    credentials: Credentials,
    created_at: Instant,
}

/// Process-wide credential cache guarded by a single mutex.
pub struct CredentialCache {
    source: Arc<dyn CredentialSource>,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl CredentialCache {
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self::with_ttl(source, DEFAULT_CREDENTIALS_TTL)
    }

    pub fn with_ttl(source: Arc<dyn CredentialSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return cached credentials for the role, refreshing them when the
    /// cached entry is older than the TTL.
    pub async fn credentials(&self, role: &str) -> Result<Credentials> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(role) {
            if entry.created_at.elapsed() < self.ttl {
                return Ok(entry.credentials.clone());
            }
        }
        debug!("Assuming the role {role}");
        let credentials = self.source.assume_role(role).await?;
        entries.insert(
            role.to_string(),
            CacheEntry {
                credentials: credentials.clone(),
                created_at: Instant::now(),
            },
        );
        Ok(credentials)
    }
}
