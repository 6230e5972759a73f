//! Tool-aggregating chat bridge: merges the tool catalogs of configured
//! MCP endpoints, exposes them to an OpenAI-compatible model and streams
//! the resulting generation back over SSE.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use application::bridge::{Bridge, BridgeConfig, BridgeRequest};
pub use application::credentials::{CredentialBundle, CredentialResolver, RequestIdentity};
pub use application::endpoints::ConnectionRegistry;
pub use application::persistence::{MemoryTurnStore, TurnStore};
pub use config::AppConfig;
pub use domain::StreamEvent;
