//! REST surface: one streaming chat route plus small introspection routes
//! for the tool catalog and credential status. Swagger UI is served for the
//! whole surface.

use crate::application::bridge::{Bridge, BridgeRequest};
use crate::application::credentials::{AuthStatus, CredentialResolver, RequestIdentity};
use crate::application::endpoints::ConnectionRegistry;
use crate::domain::{ChatMessage, StreamEvent};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

const SESSION_HEADER: &str = "x-session-user";
const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<Bridge>,
    pub registry: Arc<ConnectionRegistry>,
    pub resolver: Arc<CredentialResolver>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChatRequest {
    /// Omitted for a brand-new conversation.
    pub chat_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// Out-of-band tool API key; lowest credential precedence.
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ToolSummary {
    pub name: String,
    pub description: Option<String>,
    pub endpoint_id: String,
    #[schema(value_type = Object)]
    pub parameters: Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ToolListing {
    pub tools: Vec<ToolSummary>,
}

#[derive(OpenApi)]
#[openapi(
    paths(chat, list_tools, auth_status),
    components(schemas(
        ChatRequest,
        ToolSummary,
        ToolListing,
        ChatMessage,
        crate::domain::MessageRole,
        crate::domain::ToolCall,
        crate::domain::StreamEvent,
        crate::domain::ToolResult,
        crate::domain::SideChannelKind,
        AuthStatus,
    )),
    info(
        title = "orrery",
        description = "Tool-aggregating chat bridge over MCP endpoints"
    )
)]
struct ApiDoc;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/chat", post(chat))
        .route("/tools", get(list_tools))
        .route("/auth/status", get(auth_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, router(state)).await
}

/// Event stream that cancels the generation run when the client goes away.
struct GuardedStream {
    inner: ReceiverStream<StreamEvent>,
    cancel: CancellationToken,
}

impl Stream for GuardedStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(event)) => {
                let payload = serde_json::to_string(&event).unwrap_or_else(|_| {
                    r#"{"type":"error","message":"unserializable event"}"#.to_string()
                });
                Poll::Ready(Some(Ok(Event::default().data(payload))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for GuardedStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn identity_from(headers: &HeaderMap, body_key: Option<String>) -> RequestIdentity {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    RequestIdentity {
        session_user_id: header_value(SESSION_HEADER),
        bearer_key: body_key.or_else(|| header_value(API_KEY_HEADER)),
    }
}

#[utoipa::path(
    post,
    path = "/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Server-sent event stream of generation events")
    )
)]
async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> impl IntoResponse {
    let identity = identity_from(&headers, body.api_key);
    let chat_id = body
        .chat_id
        .unwrap_or_else(|| format!("chat-{}", Uuid::new_v4()));
    info!(chat_id = %chat_id, messages = body.messages.len(), "chat request");

    let cancel = CancellationToken::new();
    let events = state.bridge.run(
        BridgeRequest {
            chat_id,
            messages: body.messages,
            identity,
        },
        cancel.clone(),
    );

    Sse::new(GuardedStream {
        inner: events,
        cancel,
    })
    .keep_alive(KeepAlive::default())
}

#[utoipa::path(
    get,
    path = "/tools",
    responses(
        (status = 200, description = "Merged tool catalog for the caller's credentials", body = ToolListing)
    )
)]
async fn list_tools(State(state): State<AppState>, headers: HeaderMap) -> Json<ToolListing> {
    let identity = identity_from(&headers, None);
    let bundle = state.resolver.resolve_identity(&identity).await;
    let catalog = state.registry.merged_catalog(&bundle).await;

    let tools = catalog
        .iter()
        .map(|(name, entry)| ToolSummary {
            name: name.clone(),
            description: entry.tool.description.clone(),
            endpoint_id: entry.endpoint_id.clone(),
            parameters: entry.tool.parameters_schema(),
        })
        .collect();
    Json(ToolListing { tools })
}

#[utoipa::path(
    get,
    path = "/auth/status",
    responses(
        (status = 200, description = "Credential availability for the caller", body = AuthStatus)
    )
)]
async fn auth_status(State(state): State<AppState>, headers: HeaderMap) -> Json<AuthStatus> {
    let identity = identity_from(&headers, None);
    let bundle = state.resolver.resolve_identity(&identity).await;
    Json(bundle.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::bridge::BridgeConfig;
    use crate::application::persistence::MemoryTurnStore;
    use crate::config::ProviderConfig;
    use crate::infrastructure::model::OpenAiProvider;
    use std::time::Duration;

    fn test_state() -> AppState {
        let registry = Arc::new(ConnectionRegistry::new(Vec::new(), Duration::from_secs(5)));
        let resolver = Arc::new(CredentialResolver::new(None));
        let bridge = Arc::new(Bridge::new(
            Arc::new(OpenAiProvider::new(&ProviderConfig::default())),
            registry.clone(),
            resolver.clone(),
            Arc::new(MemoryTurnStore::new()),
            BridgeConfig {
                model: "gpt-4o-mini".into(),
                system_prompt: None,
                max_steps: 5,
                budget: Duration::from_secs(60),
            },
        ));
        AppState {
            bridge,
            registry,
            resolver,
        }
    }

    #[tokio::test]
    async fn router_registers_every_route() {
        // Building the router is what checks the handler signatures,
        // including the SSE response type of the chat route.
        let _router = router(test_state());
    }

    #[test]
    fn identity_prefers_the_body_key_over_the_header() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, "user-1".parse().expect("header"));
        headers.insert(API_KEY_HEADER, "header-key".parse().expect("header"));

        let identity = identity_from(&headers, Some("body-key".into()));
        assert_eq!(identity.session_user_id.as_deref(), Some("user-1"));
        assert_eq!(identity.bearer_key.as_deref(), Some("body-key"));

        let identity = identity_from(&headers, None);
        assert_eq!(identity.bearer_key.as_deref(), Some("header-key"));
    }

    #[test]
    fn openapi_document_builds() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/chat"));
        assert!(doc.paths.paths.contains_key("/tools"));
        assert!(doc.paths.paths.contains_key("/auth/status"));
    }
}
