//! HTTP event-stream transport: a long-lived SSE channel carries the
//! endpoint's JSON-RPC responses, requests go out over a POST back-channel
//! the endpoint announces when the stream opens.

use super::stdio::parse_tool_listing;
use super::{EndpointConnection, EndpointError};
use crate::application::catalog::RemoteToolInfo;
use crate::application::credentials::CredentialBundle;
use crate::config::{CredentialKind, EndpointConfig, TransportConfig};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, COOKIE};
use reqwest_eventsource::{Event, EventSource};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PROTOCOL_VERSION: &str = "2025-06-18";

pub struct SseConnection {
    inner: Arc<SseInner>,
}

struct SseInner {
    endpoint_id: String,
    http: reqwest::Client,
    headers: HeaderMap,
    post_url: AsyncMutex<Option<reqwest::Url>>,
    pending: AsyncMutex<HashMap<String, oneshot::Sender<Result<Value, EndpointError>>>>,
    id_counter: AtomicU64,
    tool_cache: AsyncMutex<Vec<RemoteToolInfo>>,
    cancel: CancellationToken,
}

impl SseConnection {
    /// Opens the event stream, waits for the endpoint's back-channel
    /// announcement and runs the initialize handshake. The caller bounds
    /// the whole sequence with its handshake timeout.
    pub async fn open(
        endpoint: &EndpointConfig,
        credentials: &CredentialBundle,
    ) -> Result<Self, EndpointError> {
        let TransportConfig::StreamOverHttp { url, auth_header } = &endpoint.transport else {
            return Err(EndpointError::NotConfigured {
                endpoint: endpoint.id.clone(),
            });
        };

        let base = reqwest::Url::parse(url).map_err(|err| EndpointError::Unreachable {
            endpoint: endpoint.id.clone(),
            message: format!("invalid endpoint url: {err}"),
        })?;
        let headers = credential_headers(endpoint, auth_header.as_deref(), credentials)?;

        let http = reqwest::Client::new();
        let request = http.get(base.clone()).headers(headers.clone());
        let stream = EventSource::new(request).map_err(|err| EndpointError::Unreachable {
            endpoint: endpoint.id.clone(),
            message: err.to_string(),
        })?;

        let inner = Arc::new(SseInner {
            endpoint_id: endpoint.id.clone(),
            http,
            headers,
            post_url: AsyncMutex::new(None),
            pending: AsyncMutex::new(HashMap::new()),
            id_counter: AtomicU64::new(1),
            tool_cache: AsyncMutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        });

        let (announce_tx, announce_rx) = oneshot::channel();
        let reader_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            reader_inner.reader_loop(stream, base, announce_tx).await;
        });

        announce_rx
            .await
            .map_err(|_| EndpointError::Unreachable {
                endpoint: inner.endpoint_id.clone(),
                message: "stream closed before announcing a back-channel".into(),
            })??;

        let connection = Self { inner };
        match connection.inner.initialize_sequence().await {
            Ok(()) => Ok(connection),
            Err(err) => {
                connection.inner.shutdown().await;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl EndpointConnection for SseConnection {
    async fn tools(&self) -> Vec<RemoteToolInfo> {
        self.inner.tool_cache.lock().await.clone()
    }

    async fn call_tool(
        &self,
        remote_name: &str,
        arguments: Value,
    ) -> Result<Value, EndpointError> {
        let params = json!({
            "name": remote_name,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            }
        });
        self.inner.send_request("tools/call", params).await
    }

    async fn close(&self) {
        self.inner.shutdown().await;
    }
}

impl SseInner {
    async fn initialize_sequence(self: &Arc<Self>) -> Result<(), EndpointError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        self.send_request("initialize", params).await?;
        self.post_message(&json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
            "params": {}
        }))
        .await?;
        self.refresh_tools().await
    }

    async fn refresh_tools(&self) -> Result<(), EndpointError> {
        let result = self.send_request("tools/list", json!({})).await?;
        let mut cache = self.tool_cache.lock().await;
        *cache = parse_tool_listing(&result);
        Ok(())
    }

    async fn reader_loop(
        self: Arc<Self>,
        mut stream: EventSource,
        base: reqwest::Url,
        announce: oneshot::Sender<Result<(), EndpointError>>,
    ) {
        let mut announce = Some(announce);
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = stream.next() => event,
            };
            match event {
                Some(Ok(Event::Open)) => {
                    debug!(endpoint = %self.endpoint_id, "event stream open");
                }
                Some(Ok(Event::Message(message))) => {
                    if message.event == "endpoint" {
                        let outcome = self.record_back_channel(&base, message.data.trim()).await;
                        if let Some(tx) = announce.take() {
                            let _ = tx.send(outcome);
                        }
                        continue;
                    }
                    match serde_json::from_str::<Value>(&message.data) {
                        Ok(value) => Arc::clone(&self).dispatch_inbound(value).await,
                        Err(source) => {
                            warn!(
                                endpoint = %self.endpoint_id,
                                data = %message.data,
                                %source,
                                "received invalid JSON over event stream"
                            );
                        }
                    }
                }
                Some(Err(err)) => {
                    warn!(endpoint = %self.endpoint_id, %err, "event stream error");
                    break;
                }
                None => break,
            }
        }
        stream.close();
        drop(announce);
        self.shutdown().await;
    }

    async fn record_back_channel(&self, base: &reqwest::Url, raw: &str) -> Result<(), EndpointError> {
        let resolved = base.join(raw).map_err(|err| EndpointError::Transport {
            endpoint: self.endpoint_id.clone(),
            message: format!("unusable back-channel url '{raw}': {err}"),
        })?;
        debug!(endpoint = %self.endpoint_id, url = %resolved, "back-channel announced");
        let mut post_url = self.post_url.lock().await;
        *post_url = Some(resolved);
        Ok(())
    }

    async fn dispatch_inbound(self: Arc<Self>, value: Value) {
        match (value.get("id").cloned(), value.get("method").is_some()) {
            (Some(id), false) => self.handle_response(id, value).await,
            (Some(id), true) => self.handle_server_request(id, value).await,
            (None, true) => self.handle_notification(value).await,
            (None, false) => {}
        }
    }

    async fn handle_response(&self, id: Value, value: Value) {
        let key = match &id {
            Value::String(value) => value.clone(),
            Value::Number(num) => num.to_string(),
            _ => return,
        };
        let responder = {
            let mut pending = self.pending.lock().await;
            pending.remove(&key)
        };
        let Some(sender) = responder else {
            debug!(
                endpoint = %self.endpoint_id,
                response_id = key,
                "response for unknown request"
            );
            return;
        };

        if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32000);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            let _ = sender.send(Err(EndpointError::Rpc {
                endpoint: self.endpoint_id.clone(),
                code,
                message,
            }));
        } else {
            let result = value.get("result").cloned().unwrap_or(Value::Null);
            let _ = sender.send(Ok(result));
        }
    }

    async fn handle_server_request(&self, id: Value, value: Value) {
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let reply = match method {
            "ping" => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
            other => {
                warn!(
                    endpoint = %self.endpoint_id,
                    method = other,
                    "endpoint sent unsupported request"
                );
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": -32601,
                        "message": format!("client does not implement method '{other}'"),
                    }
                })
            }
        };
        if let Err(err) = self.post_message(&reply).await {
            warn!(endpoint = %self.endpoint_id, %err, "failed to answer endpoint request");
        }
    }

    async fn handle_notification(self: Arc<Self>, value: Value) {
        let Some(method) = value.get("method").and_then(Value::as_str) else {
            return;
        };
        debug!(endpoint = %self.endpoint_id, method, "notification from endpoint");
        if method == "notifications/tools/list_changed" {
            // The refresh issues its own request; it must run off the
            // reader task or the response could never be delivered.
            tokio::spawn(async move {
                if let Err(err) = self.refresh_tools().await {
                    warn!(endpoint = %self.endpoint_id, %err, "failed to refresh tool listing");
                }
            });
        }
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, EndpointError> {
        let id = format!("req-{}", self.id_counter.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id.clone(), tx);
        }

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        if let Err(err) = self.post_message(&payload).await {
            let mut pending = self.pending.lock().await;
            pending.remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(EndpointError::Terminated {
                endpoint: self.endpoint_id.clone(),
            }),
        }
    }

    async fn post_message(&self, message: &Value) -> Result<(), EndpointError> {
        let url = {
            let post_url = self.post_url.lock().await;
            post_url.clone().ok_or_else(|| EndpointError::Transport {
                endpoint: self.endpoint_id.clone(),
                message: "no back-channel announced yet".into(),
            })?
        };

        let response = self
            .http
            .post(url)
            .headers(self.headers.clone())
            .json(message)
            .send()
            .await
            .map_err(|err| EndpointError::Transport {
                endpoint: self.endpoint_id.clone(),
                message: err.to_string(),
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(EndpointError::Transport {
                endpoint: self.endpoint_id.clone(),
                message: format!("back-channel rejected message: {}", response.status()),
            })
        }
    }

    async fn shutdown(&self) {
        self.cancel.cancel();

        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(EndpointError::Terminated {
                endpoint: self.endpoint_id.clone(),
            }));
        }
        drop(pending);
        self.tool_cache.lock().await.clear();
    }
}

/// Builds the headers both the stream and the back-channel requests carry.
/// The credential the endpoint is configured for must be present.
fn credential_headers(
    endpoint: &EndpointConfig,
    auth_header: Option<&str>,
    credentials: &CredentialBundle,
) -> Result<HeaderMap, EndpointError> {
    let mut headers = HeaderMap::new();
    let missing = || EndpointError::MissingCredential {
        endpoint: endpoint.id.clone(),
    };
    let unusable = |what: &str| EndpointError::Transport {
        endpoint: endpoint.id.clone(),
        message: format!("{what} is not a valid header value"),
    };

    match endpoint.credential {
        CredentialKind::SessionCookie => {
            let user_id = credentials.session_user_id.as_deref().ok_or_else(missing)?;
            let value = HeaderValue::from_str(&format!("session={user_id}"))
                .map_err(|_| unusable("session id"))?;
            headers.insert(COOKIE, value);
        }
        CredentialKind::BearerHeader => {
            let key = credentials.tool_api_key.as_deref().ok_or_else(missing)?;
            match auth_header {
                Some(name) => {
                    let name = HeaderName::from_bytes(name.as_bytes())
                        .map_err(|_| unusable("auth header name"))?;
                    let value =
                        HeaderValue::from_str(key).map_err(|_| unusable("api key"))?;
                    headers.insert(name, value);
                }
                None => {
                    let value = HeaderValue::from_str(&format!("Bearer {key}"))
                        .map_err(|_| unusable("api key"))?;
                    headers.insert(AUTHORIZATION, value);
                }
            }
        }
    }
    Ok(headers)
}
