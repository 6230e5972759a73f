pub mod sse;
pub mod stdio;

use super::catalog::{self, NormalizedTool, RemoteToolInfo};
use super::credentials::CredentialBundle;
use crate::config::{CredentialKind, EndpointConfig, TransportConfig};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("endpoint '{endpoint}' is not configured")]
    NotConfigured { endpoint: String },
    #[error("endpoint '{endpoint}' requires a credential this request does not carry")]
    MissingCredential { endpoint: String },
    #[error("failed to spawn endpoint '{endpoint}': {source}")]
    Spawn {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("endpoint '{endpoint}' is unreachable: {message}")]
    Unreachable { endpoint: String, message: String },
    #[error("endpoint '{endpoint}' transport error: {message}")]
    Transport { endpoint: String, message: String },
    #[error("endpoint '{endpoint}' returned invalid JSON: {source}")]
    InvalidJson {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("endpoint '{endpoint}' returned JSON-RPC error {code}: {message}")]
    Rpc {
        endpoint: String,
        code: i64,
        message: String,
    },
    #[error("endpoint '{endpoint}' terminated unexpectedly")]
    Terminated { endpoint: String },
    #[error("endpoint '{endpoint}' handshake timed out")]
    HandshakeTimeout { endpoint: String },
    #[error("endpoint '{endpoint}' did not answer a call in time")]
    CallTimeout { endpoint: String },
}

impl EndpointError {
    /// Errors that invalidate the cached connection. JSON-RPC level errors
    /// leave the connection usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EndpointError::Rpc { .. })
    }
}

/// A live connection to one tool endpoint.
#[async_trait]
pub trait EndpointConnection: Send + Sync {
    /// Raw tool listing as fetched during the handshake.
    async fn tools(&self) -> Vec<RemoteToolInfo>;

    async fn call_tool(&self, remote_name: &str, arguments: Value)
        -> Result<Value, EndpointError>;

    async fn close(&self);
}

/// Seam between the registry and the concrete transports, so the lifecycle
/// logic can be exercised without spawning processes or opening sockets.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &EndpointConfig,
        credentials: &CredentialBundle,
    ) -> Result<Arc<dyn EndpointConnection>, EndpointError>;
}

/// Production connector dispatching on the configured transport.
pub struct TransportConnector;

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(
        &self,
        endpoint: &EndpointConfig,
        credentials: &CredentialBundle,
    ) -> Result<Arc<dyn EndpointConnection>, EndpointError> {
        match &endpoint.transport {
            TransportConfig::StreamOverHttp { .. } => {
                let connection = sse::SseConnection::open(endpoint, credentials).await?;
                Ok(Arc::new(connection))
            }
            TransportConfig::ProcessPipe { .. } => {
                let connection = stdio::StdioConnection::open(endpoint, credentials).await?;
                Ok(Arc::new(connection))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub tool: NormalizedTool,
    pub endpoint_id: String,
}

/// Merged, name-normalized table of every callable tool available to one
/// generation run.
#[derive(Debug, Clone, Default)]
pub struct MergedCatalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl MergedCatalog {
    pub fn get(&self, local_name: &str) -> Option<&CatalogEntry> {
        self.entries.get(local_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CatalogEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn merge_endpoint(&mut self, endpoint_id: &str, tools: BTreeMap<String, NormalizedTool>) {
        // Same collision rule as within one endpoint: the later arrival
        // gets the disambiguating suffix.
        for (_, mut tool) in tools {
            if self.entries.contains_key(&tool.local_name) {
                let unique =
                    catalog::disambiguate(&tool.local_name, |name| self.entries.contains_key(name));
                warn!(
                    endpoint = %endpoint_id,
                    remote = %tool.remote_name,
                    collided = %tool.local_name,
                    renamed = %unique,
                    "cross-endpoint tool name collision resolved with suffix"
                );
                tool.local_name = unique;
            }
            self.entries.insert(
                tool.local_name.clone(),
                CatalogEntry {
                    tool,
                    endpoint_id: endpoint_id.to_string(),
                },
            );
        }
    }
}

type ConnectionSlot = Arc<AsyncMutex<Option<Arc<dyn EndpointConnection>>>>;

/// Process-wide connection cache: lazy create, reuse across requests,
/// invalidate on transport error, explicit close on shutdown or demand.
/// Each endpoint has its own slot mutex, held across the connect so
/// concurrent requests cannot race duplicate connections.
pub struct ConnectionRegistry {
    endpoints: Vec<EndpointConfig>,
    connector: Arc<dyn Connector>,
    slots: HashMap<String, ConnectionSlot>,
    handshake_timeout: Duration,
    call_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(endpoints: Vec<EndpointConfig>, handshake_timeout: Duration) -> Self {
        Self::with_connector(endpoints, Arc::new(TransportConnector), handshake_timeout)
    }

    pub fn with_connector(
        endpoints: Vec<EndpointConfig>,
        connector: Arc<dyn Connector>,
        handshake_timeout: Duration,
    ) -> Self {
        let slots = endpoints
            .iter()
            .map(|endpoint| {
                (
                    endpoint.id.clone(),
                    Arc::new(AsyncMutex::new(None)) as ConnectionSlot,
                )
            })
            .collect();
        Self {
            endpoints,
            connector,
            slots,
            handshake_timeout,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn endpoints(&self) -> &[EndpointConfig] {
        &self.endpoints
    }

    /// Aggregates the live tool catalog across every endpoint reachable
    /// with the given credentials. A single bad endpoint degrades the
    /// catalog, never the whole aggregation.
    pub async fn merged_catalog(&self, credentials: &CredentialBundle) -> MergedCatalog {
        let mut merged = MergedCatalog::default();
        for endpoint in &self.endpoints {
            if !credential_present(endpoint.credential, credentials) {
                debug!(
                    endpoint = %endpoint.id,
                    "skipping endpoint: required credential absent"
                );
                continue;
            }

            let connection = match self.get_or_create(endpoint, credentials).await {
                Ok(connection) => connection,
                Err(err) => {
                    warn!(endpoint = %endpoint.id, %err, "endpoint unavailable, degrading catalog");
                    continue;
                }
            };

            let infos = connection.tools().await;
            let tools = catalog::build(&infos);
            debug!(
                endpoint = %endpoint.id,
                advertised = infos.len(),
                usable = tools.len(),
                "merging endpoint tools"
            );
            merged.merge_endpoint(&endpoint.id, tools);
        }
        info!(tools = merged.len(), "merged tool catalog assembled");
        merged
    }

    /// Dispatches one call on the cached connection for `endpoint_id`,
    /// bounded by the per-call deadline. Fatal transport errors (timeouts
    /// included) invalidate the slot so the next request reconnects lazily.
    pub async fn invoke(
        &self,
        endpoint_id: &str,
        remote_name: &str,
        arguments: Value,
    ) -> Result<Value, EndpointError> {
        let slot = self
            .slots
            .get(endpoint_id)
            .ok_or_else(|| EndpointError::NotConfigured {
                endpoint: endpoint_id.to_string(),
            })?;

        let connection = {
            let guard = slot.lock().await;
            guard.clone().ok_or_else(|| EndpointError::Terminated {
                endpoint: endpoint_id.to_string(),
            })?
        };

        let call = connection.call_tool(remote_name, arguments);
        let outcome = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(EndpointError::CallTimeout {
                endpoint: endpoint_id.to_string(),
            }),
        };

        match outcome {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.is_fatal() {
                    warn!(endpoint = endpoint_id, %err, "invalidating connection after transport error");
                    let mut guard = slot.lock().await;
                    if let Some(stale) = guard.take() {
                        stale.close().await;
                    }
                }
                Err(err)
            }
        }
    }

    /// Releases every cached connection and clears the cache; the next
    /// aggregation reconnects lazily.
    pub async fn close_all(&self) {
        for (id, slot) in &self.slots {
            let mut guard = slot.lock().await;
            if let Some(connection) = guard.take() {
                debug!(endpoint = %id, "closing endpoint connection");
                connection.close().await;
            }
        }
    }

    async fn get_or_create(
        &self,
        endpoint: &EndpointConfig,
        credentials: &CredentialBundle,
    ) -> Result<Arc<dyn EndpointConnection>, EndpointError> {
        let slot = self
            .slots
            .get(&endpoint.id)
            .ok_or_else(|| EndpointError::NotConfigured {
                endpoint: endpoint.id.clone(),
            })?;

        // Slot lock held through the connect: single-flight per endpoint.
        let mut guard = slot.lock().await;
        if let Some(existing) = guard.as_ref() {
            return Ok(existing.clone());
        }

        let connect = self.connector.connect(endpoint, credentials);
        let connection = match tokio::time::timeout(self.handshake_timeout, connect).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(EndpointError::HandshakeTimeout {
                    endpoint: endpoint.id.clone(),
                });
            }
        };
        *guard = Some(connection.clone());
        Ok(connection)
    }
}

fn credential_present(kind: CredentialKind, credentials: &CredentialBundle) -> bool {
    match kind {
        CredentialKind::SessionCookie => credentials.session_user_id.is_some(),
        CredentialKind::BearerHeader => credentials.tool_api_key.is_some(),
    }
}
