//! HTTP client for the account service.

use async_trait::async_trait;

use super::{AccountApi, EntitlementsQuery, FetchError, SessionAuth};
use crate::entitlements::ServerEntitlements;

/// Production [`AccountApi`] over HTTPS.
///
/// Browser-style installs authenticate with the session cookie held by the
/// client's cookie store; desktop installs append their session pair as
/// query parameters.
pub struct HttpAccountClient {
    client: reqwest::Client,
}

impl HttpAccountClient {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self { client })
    }

    /// Use a preconfigured client (custom proxy, injected cookies).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AccountApi for HttpAccountClient {
    async fn fetch_entitlements(
        &self,
        query: &EntitlementsQuery,
    ) -> Result<ServerEntitlements, FetchError> {
        let url = format!("{}/getAppEntitlements", query.base_url);
        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .query(&[
                ("lang", query.language.as_str()),
                ("version", query.app_version.as_str()),
                ("platform", query.platform.as_str()),
                ("appType", query.app_type.as_str()),
            ]);

        if let SessionAuth::Desktop {
            app_session_id,
            validation_code,
        } = &query.auth
        {
            request = request.query(&[
                ("appSessionID", app_session_id.as_str()),
                ("validationCode", validation_code.as_str()),
            ]);
        }

        let response = request.send().await.map_err(classify_transport_error)?;

        let status = response.status();
        if status.is_client_error() {
            return Err(FetchError::Rejected(status.as_u16()));
        }
        if status.is_server_error() {
            return Err(FetchError::Unavailable(status.as_u16()));
        }
        if !status.is_success() {
            return Err(FetchError::Network(format!(
                "unexpected status {status} from {url}"
            )));
        }

        response
            .json::<ServerEntitlements>()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))
    }
}

fn classify_transport_error(e: reqwest::Error) -> FetchError {
    if e.is_connect() || e.is_timeout() {
        FetchError::Offline
    } else {
        FetchError::Network(e.to_string())
    }
}
