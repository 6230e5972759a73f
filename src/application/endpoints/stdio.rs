//! Process-pipe transport: spawns the endpoint command and speaks
//! line-delimited JSON-RPC over its stdin/stdout.

use super::{EndpointConnection, EndpointError};
use crate::application::catalog::RemoteToolInfo;
use crate::application::credentials::CredentialBundle;
use crate::config::{EndpointConfig, TransportConfig};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, warn};

const PROTOCOL_VERSION: &str = "2025-06-18";

/// Environment variable the credential is exported under for spawned
/// endpoint processes.
const API_KEY_ENV: &str = "TOOL_API_KEY";
const SESSION_ENV: &str = "TOOL_SESSION_USER";

pub struct StdioConnection {
    inner: Arc<StdioInner>,
}

struct StdioInner {
    endpoint_id: String,
    child: AsyncMutex<Option<Child>>,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    pending: AsyncMutex<HashMap<String, oneshot::Sender<Result<Value, EndpointError>>>>,
    id_counter: AtomicU64,
    tool_cache: AsyncMutex<Vec<RemoteToolInfo>>,
}

impl StdioConnection {
    /// Spawns the endpoint process, runs the initialize handshake and
    /// fetches the tool listing. The credential travels in the child's
    /// environment, never on the command line.
    pub async fn open(
        endpoint: &EndpointConfig,
        credentials: &CredentialBundle,
    ) -> Result<Self, EndpointError> {
        let TransportConfig::ProcessPipe {
            command,
            args,
            env,
            workdir,
        } = &endpoint.transport
        else {
            return Err(EndpointError::NotConfigured {
                endpoint: endpoint.id.clone(),
            });
        };

        let mut cmd = Command::new(command);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }
        if !args.is_empty() {
            cmd.args(args);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(key) = &credentials.tool_api_key {
            cmd.env(API_KEY_ENV, key);
        }
        if let Some(user) = &credentials.session_user_id {
            cmd.env(SESSION_ENV, user);
        }

        let mut child = cmd.spawn().map_err(|source| EndpointError::Spawn {
            endpoint: endpoint.id.clone(),
            source,
        })?;

        let endpoint_id = endpoint.id.clone();
        let stdin = child.stdin.take().ok_or_else(|| EndpointError::Transport {
            endpoint: endpoint_id.clone(),
            message: "failed to capture child stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| EndpointError::Transport {
            endpoint: endpoint_id.clone(),
            message: "failed to capture child stdout".into(),
        })?;

        let inner = Arc::new(StdioInner {
            endpoint_id,
            child: AsyncMutex::new(Some(child)),
            writer: AsyncMutex::new(Some(BufWriter::new(stdin))),
            pending: AsyncMutex::new(HashMap::new()),
            id_counter: AtomicU64::new(1),
            tool_cache: AsyncMutex::new(Vec::new()),
        });

        let reader_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            reader_inner.reader_loop(stdout).await;
        });

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
impl EndpointConnection for StdioConnection {
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

impl StdioInner {
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
        self.send_notification("notifications/initialized", json!({}))
            .await?;
        self.refresh_tools().await
    }

    async fn refresh_tools(&self) -> Result<(), EndpointError> {
        let result = self.send_request("tools/list", json!({})).await?;
        let mut cache = self.tool_cache.lock().await;
        *cache = parse_tool_listing(&result);
        Ok(())
    }

    async fn reader_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(item) = lines.next_line().await {
            let Some(raw) = item else { break };
            if raw.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => Arc::clone(&self).dispatch_inbound(value).await,
                Err(source) => {
                    warn!(
                        endpoint = %self.endpoint_id,
                        line = raw,
                        %source,
                        "received invalid JSON from endpoint process"
                    );
                }
            }
        }
        self.shutdown().await;
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
        let key = match response_key(&id) {
            Some(key) => key,
            None => return,
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
        let outcome = match method {
            "ping" => self.send_response(id, json!({})).await,
            other => {
                warn!(
                    endpoint = %self.endpoint_id,
                    method = other,
                    "endpoint sent unsupported request"
                );
                let error = json!({
                    "code": -32601,
                    "message": format!("client does not implement method '{other}'"),
                });
                self.send_error(id, error).await
            }
        };
        if let Err(err) = outcome {
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
        self.write_message(&payload).await?;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(EndpointError::Terminated {
                endpoint: self.endpoint_id.clone(),
            }),
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), EndpointError> {
        self.write_message(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        }))
        .await
    }

    async fn send_response(&self, id: Value, result: Value) -> Result<(), EndpointError> {
        self.write_message(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result
        }))
        .await
    }

    async fn send_error(&self, id: Value, error: Value) -> Result<(), EndpointError> {
        self.write_message(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": error
        }))
        .await
    }

    async fn write_message(&self, message: &Value) -> Result<(), EndpointError> {
        let encoded =
            serde_json::to_string(message).map_err(|source| EndpointError::InvalidJson {
                endpoint: self.endpoint_id.clone(),
                source,
            })?;

        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or_else(|| EndpointError::Transport {
            endpoint: self.endpoint_id.clone(),
            message: "writer closed".into(),
        })?;
        for chunk in [encoded.as_bytes(), b"\n"] {
            stream
                .write_all(chunk)
                .await
                .map_err(|source| EndpointError::Transport {
                    endpoint: self.endpoint_id.clone(),
                    message: source.to_string(),
                })?;
        }
        stream
            .flush()
            .await
            .map_err(|source| EndpointError::Transport {
                endpoint: self.endpoint_id.clone(),
                message: source.to_string(),
            })
    }

    async fn shutdown(&self) {
        {
            let mut writer = self.writer.lock().await;
            *writer = None;
        }

        {
            let mut child = self.child.lock().await;
            if let Some(mut running) = child.take() {
                if let Err(err) = running.kill().await {
                    debug!(
                        endpoint = %self.endpoint_id,
                        %err,
                        "failed to kill endpoint process (may have already exited)"
                    );
                }
                let _ = running.wait().await;
            }
        }

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

pub(super) fn parse_tool_listing(result: &Value) -> Vec<RemoteToolInfo> {
    let Some(array) = result.get("tools").and_then(Value::as_array) else {
        return Vec::new();
    };
    array
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name").and_then(Value::as_str)?;
            Some(RemoteToolInfo {
                name: name.to_string(),
                description: tool
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                input_schema: tool.get("inputSchema").cloned(),
            })
        })
        .collect()
}

fn response_key(id: &Value) -> Option<String> {
    match id {
        Value::String(value) => Some(value.clone()),
        Value::Number(num) => Some(num.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialKind;
    use std::time::Duration;

    // Line-delimited JSON-RPC responder; pushes one tools/list_changed
    // notification after the first listing.
    const SCRIPTED_SERVER: &str = r#"
notified=0
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\(req-[0-9]*\)".*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{}}\n' "$id";;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{"tools":[{"name":"ping"}]}}\n' "$id"
      if [ "$notified" = "0" ]; then
        notified=1
        printf '{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}\n'
      fi;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":"%s","result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id";;
  esac
done
"#;

    #[tokio::test]
    async fn list_changed_notification_does_not_block_calls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("server.sh");
        std::fs::write(&script, SCRIPTED_SERVER).expect("write script");

        let endpoint = EndpointConfig {
            id: "local".into(),
            transport: TransportConfig::ProcessPipe {
                command: "sh".into(),
                args: vec![script.to_string_lossy().into_owned()],
                env: Default::default(),
                workdir: None,
            },
            credential: CredentialKind::BearerHeader,
        };
        let credentials = CredentialBundle {
            session_user_id: None,
            tool_api_key: Some("k-1".into()),
        };

        let connection = StdioConnection::open(&endpoint, &credentials)
            .await
            .expect("open");

        // The refresh triggered by the notification is in flight; a call
        // must still complete promptly.
        let result = tokio::time::timeout(
            Duration::from_secs(3),
            connection.call_tool("ping", json!({})),
        )
        .await
        .expect("call completed while a listing refresh was in flight")
        .expect("call succeeded");
        assert_eq!(result["content"][0]["text"], "pong");

        connection.close().await;
    }

    #[test]
    fn parses_tool_listing_with_schemas() {
        let result = json!({
            "tools": [
                {
                    "name": "join_meeting",
                    "description": "Join a meeting",
                    "inputSchema": {"type": "object", "properties": {}}
                },
                {"name": "bare_tool"},
                {"description": "nameless, skipped"}
            ]
        });
        let infos = parse_tool_listing(&result);
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].name, "join_meeting");
        assert!(infos[0].input_schema.is_some());
        assert_eq!(infos[1].name, "bare_tool");
        assert!(infos[1].input_schema.is_none());
    }

    #[test]
    fn response_key_accepts_string_and_number_ids() {
        assert_eq!(response_key(&json!("req-1")).as_deref(), Some("req-1"));
        assert_eq!(response_key(&json!(7)).as_deref(), Some("7"));
        assert_eq!(response_key(&json!(null)), None);
    }
}
