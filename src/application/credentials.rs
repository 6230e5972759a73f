use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use utoipa::ToSchema;

/// Literal marker users can paste into a message to hand over a tool API
/// key. Matching is case-sensitive on purpose; the acknowledgement flow
/// explains the expected spelling.
pub const API_KEY_MARKER: &str = "API KEY:";

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Effective caller identity for one request. Never persisted; dropped with
/// the request.
#[derive(Debug, Clone, Default)]
pub struct CredentialBundle {
    pub session_user_id: Option<String>,
    pub tool_api_key: Option<String>,
}

impl CredentialBundle {
    pub fn is_empty(&self) -> bool {
        self.session_user_id.is_none() && self.tool_api_key.is_none()
    }

    pub fn status(&self) -> AuthStatus {
        let has_session = self.session_user_id.is_some();
        let has_api_key = self.tool_api_key.is_some();
        AuthStatus {
            is_authenticated: has_session || has_api_key,
            has_session,
            has_api_key,
            has_both: has_session && has_api_key,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub is_authenticated: bool,
    pub has_session: bool,
    pub has_api_key: bool,
    pub has_both: bool,
}

/// Identity material the outer layers hand in alongside a request: the
/// ambient session lookup result and any out-of-band bearer key.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    pub session_user_id: Option<String>,
    pub bearer_key: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no usable credential for this request")]
    Unauthenticated,
}

impl AuthError {
    pub fn user_message(&self) -> String {
        match self {
            AuthError::Unauthenticated => {
                "No credentials found. Reply with `API KEY: <your key>` to connect your tools."
                    .to_string()
            }
        }
    }
}

/// Resolution outcome: either a usable bundle, or an API key embedded in
/// the message itself, which short-circuits the request entirely.
#[derive(Debug)]
pub enum Resolution {
    EmbeddedKey { key: String },
    Credentials(CredentialBundle),
}

/// Derives the effective caller identity for one request. Precedence:
/// embedded message key, then session identity, then out-of-band bearer
/// key. The optional key service exchanges a session for a tool API key.
pub struct CredentialResolver {
    http: reqwest::Client,
    key_service_url: Option<String>,
    fetch_timeout: Duration,
}

impl CredentialResolver {
    pub fn new(key_service_url: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            key_service_url,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub async fn resolve(
        &self,
        latest_user_message: Option<&str>,
        identity: &RequestIdentity,
    ) -> Result<Resolution, AuthError> {
        if let Some(key) = latest_user_message.and_then(extract_embedded_key) {
            debug!("request carries an embedded API key; short-circuiting");
            return Ok(Resolution::EmbeddedKey { key });
        }

        let mut bundle = CredentialBundle::default();
        if let Some(user_id) = &identity.session_user_id {
            bundle.session_user_id = Some(user_id.clone());
            bundle.tool_api_key = self.fetch_session_key(user_id).await;
        }
        if bundle.tool_api_key.is_none() {
            bundle.tool_api_key = identity.bearer_key.clone();
        }

        if bundle.is_empty() {
            return Err(AuthError::Unauthenticated);
        }
        Ok(Resolution::Credentials(bundle))
    }

    /// Resolves a bundle without any message context, for the status query.
    pub async fn resolve_identity(&self, identity: &RequestIdentity) -> CredentialBundle {
        match self.resolve(None, identity).await {
            Ok(Resolution::Credentials(bundle)) => bundle,
            _ => CredentialBundle::default(),
        }
    }

    /// Exchanges the session for a per-endpoint API key. Failure is
    /// tolerated: the session identity alone may still open a subset of
    /// endpoints.
    async fn fetch_session_key(&self, user_id: &str) -> Option<String> {
        let url = self.key_service_url.as_deref()?;
        let response = self
            .http
            .get(url)
            .header("cookie", format!("session={user_id}"))
            .timeout(self.fetch_timeout)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                match response.json::<serde_json::Value>().await {
                    Ok(body) => body
                        .get("api_key")
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_string),
                    Err(err) => {
                        warn!(%err, "key service returned unparseable body");
                        None
                    }
                }
            }
            Ok(response) => {
                warn!(status = %response.status(), "key service rejected session");
                None
            }
            Err(err) => {
                warn!(%err, "key service unreachable");
                None
            }
        }
    }
}

/// Finds an `API KEY: <value>` marker and returns the token that follows
/// it, if any.
pub fn extract_embedded_key(text: &str) -> Option<String> {
    let start = text.find(API_KEY_MARKER)? + API_KEY_MARKER.len();
    let key = text[start..].split_whitespace().next()?;
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}
