//! Account-service collaborators: login session state, the entitlements
//! endpoint, and the error taxonomy for boundary-crossing calls.

pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::entitlements::ServerEntitlements;

pub use http::HttpAccountClient;

/// How a request to the account service authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAuth {
    /// Desktop install: session pair sent as query parameters.
    Desktop {
        app_session_id: String,
        validation_code: String,
    },
    /// Browser install: same-site session cookie carried by the client.
    BrowserCookie,
}

/// Login/session state, owned by the host's auth flows.
pub trait LoginSession: Send + Sync {
    fn is_logged_in(&self) -> bool;

    /// Current authentication material, `None` when logged out or when the
    /// desktop session pair is missing (a contract error surfaced by the
    /// reconciler, not a panic).
    fn auth(&self) -> Option<SessionAuth>;
}

/// Swappable [`LoginSession`] for tests and simple hosts.
#[derive(Debug, Default)]
pub struct StaticSession {
    auth: Mutex<Option<SessionAuth>>,
}

impl StaticSession {
    pub fn logged_out() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn logged_in(auth: SessionAuth) -> Arc<Self> {
        Arc::new(Self {
            auth: Mutex::new(Some(auth)),
        })
    }

    pub fn set_auth(&self, auth: Option<SessionAuth>) {
        *self.auth.lock() = auth;
    }
}

impl LoginSession for StaticSession {
    fn is_logged_in(&self) -> bool {
        self.auth.lock().is_some()
    }

    fn auth(&self) -> Option<SessionAuth> {
        self.auth.lock().clone()
    }
}

/// Failure modes of an entitlements fetch.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("network is offline")]
    Offline,

    /// 4xx: the credentials themselves are invalid, not a transient
    /// condition. Cached state must be cleared.
    #[error("entitlements request rejected with status {0}")]
    Rejected(u16),

    /// 5xx: the service is unhealthy; fall back to cached state.
    #[error("entitlements service unavailable (status {0})")]
    Unavailable(u16),

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed entitlements response: {0}")]
    Decode(String),
}

impl FetchError {
    /// Transient failures resolve via cache fallback and are retried on the
    /// next scheduled check; they never clear state.
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchError::Rejected(_))
    }
}

/// Query context sent with every entitlements request.
#[derive(Debug, Clone)]
pub struct EntitlementsQuery {
    pub base_url: String,
    pub language: String,
    pub app_version: String,
    pub platform: String,
    pub app_type: String,
    pub auth: SessionAuth,
}

/// The `getAppEntitlements` endpoint.
#[async_trait]
pub trait AccountApi: Send + Sync {
    async fn fetch_entitlements(
        &self,
        query: &EntitlementsQuery,
    ) -> Result<ServerEntitlements, FetchError>;
}
