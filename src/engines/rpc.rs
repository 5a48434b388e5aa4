//! JSON-RPC over stdio.
//!
//! Session helper for engines that speak JSON-lines RPC on their standard
//! streams. The session owns the single reader over the child's stdout;
//! requests carry caller-assigned integer ids and responses are matched by
//! id, notifications have no id, and lines that fail to parse as JSON are
//! logged and skipped. The handshake is strict: `initialize` as a request,
//! then an `initialized` notification, before any other method.

use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::stream::LineStream;

/// Per-call timeout. A call that exceeds it fails; the supervisor kills
/// the subprocess [`KILL_GRACE`] later.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Delay between a failed call and the subprocess kill.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Commands the execution engine sends into a running RPC session task.
#[derive(Debug)]
pub enum RpcCommand {
    Prompt {
        prompt: String,
        model: Option<String>,
    },
    Cancel,
}

/// A message received from the peer.
#[derive(Debug)]
pub enum RpcIncoming {
    /// Response to one of our requests.
    Response {
        id: i64,
        result: Result<Value, RpcErrorObject>,
    },
    /// Server-initiated request that expects a response.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

#[derive(Debug, Clone)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

impl std::fmt::Display for RpcErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

pub struct RpcSession<W, R> {
    writer: W,
    lines: LineStream<R>,
    next_id: i64,
    initialized: bool,
}

impl<W: AsyncWrite + Unpin, R: AsyncRead + Unpin> RpcSession<W, R> {
    pub fn new(writer: W, reader: R) -> Self {
        Self {
            writer,
            lines: LineStream::new(reader),
            next_id: 0,
            initialized: false,
        }
    }

    fn assign_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    async fn write_line(&mut self, value: Value) -> Result<(), EngineError> {
        let mut line = value.to_string();
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| EngineError::Stream(format!("rpc write failed: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| EngineError::Stream(format!("rpc flush failed: {}", e)))?;
        Ok(())
    }

    pub async fn send_notification(
        &mut self,
        method: &str,
        params: Value,
    ) -> Result<(), EngineError> {
        self.write_line(json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .await
    }

    /// Send a request and return its id without waiting for the response.
    /// For long-running calls that stream notifications, the caller pumps
    /// `next_incoming` itself and matches the id.
    pub async fn send_request(&mut self, method: &str, params: Value) -> Result<i64, EngineError> {
        if !self.initialized && method != "initialize" {
            return Err(EngineError::Session(format!(
                "rpc method '{}' before handshake completed",
                method
            )));
        }
        let id = self.assign_id();
        self.write_line(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await?;
        Ok(id)
    }

    /// Respond to a server-initiated request.
    pub async fn send_response(&mut self, id: Value, result: Value) -> Result<(), EngineError> {
        self.write_line(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        }))
        .await
    }

    /// Read the next incoming message, skipping lines that are not JSON.
    /// Returns `None` at end of stream.
    pub async fn next_incoming(&mut self) -> Result<Option<RpcIncoming>, EngineError> {
        loop {
            let line = match self
                .lines
                .next_line()
                .await
                .map_err(|e| EngineError::Stream(e.to_string()))?
            {
                Some(line) => line,
                None => return Ok(None),
            };
            let value: Value = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(_) => {
                    debug!(line = %line, "skipping non-JSON rpc line");
                    continue;
                }
            };
            return Ok(Some(Self::classify(value)));
        }
    }

    fn classify(value: Value) -> RpcIncoming {
        let method = value.get("method").and_then(Value::as_str);
        let id = value.get("id");
        match (method, id) {
            (Some(method), Some(id)) => RpcIncoming::Request {
                id: id.clone(),
                method: method.to_string(),
                params: value.get("params").cloned().unwrap_or(Value::Null),
            },
            (Some(method), None) => RpcIncoming::Notification {
                method: method.to_string(),
                params: value.get("params").cloned().unwrap_or(Value::Null),
            },
            (None, _) => {
                let id = value.get("id").and_then(Value::as_i64).unwrap_or(-1);
                let result = match value.get("error") {
                    Some(error) => Err(RpcErrorObject {
                        code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                        message: error
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error")
                            .to_string(),
                    }),
                    None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
                };
                RpcIncoming::Response { id, result }
            }
        }
    }

    /// Issue a request and pump incoming messages until its response
    /// arrives, forwarding everything else to `on_other`. Fails after
    /// [`CALL_TIMEOUT`].
    pub async fn call<F>(
        &mut self,
        method: &str,
        params: Value,
        mut on_other: F,
    ) -> Result<Value, EngineError>
    where
        F: FnMut(RpcIncoming),
    {
        let id = self.send_request(method, params).await?;

        let wait = async {
            loop {
                match self.next_incoming().await? {
                    Some(RpcIncoming::Response {
                        id: response_id,
                        result,
                    }) if response_id == id => {
                        return result.map_err(|e| EngineError::Session(e.to_string()));
                    }
                    Some(other) => on_other(other),
                    None => {
                        return Err(EngineError::Stream(
                            "rpc stream closed before response".to_string(),
                        ))
                    }
                }
            }
        };
        match tokio::time::timeout(CALL_TIMEOUT, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(method = method, "rpc call timed out");
                Err(EngineError::EngineTimeout {
                    call: method.to_string(),
                    seconds: CALL_TIMEOUT.as_secs(),
                })
            }
        }
    }

    /// Strict handshake: `initialize` request, then `initialized`
    /// notification. Must complete before any other call.
    pub async fn handshake(&mut self, params: Value) -> Result<Value, EngineError> {
        let result = self.call("initialize", params, |_| {}).await?;
        self.send_notification("initialized", json!({})).await?;
        self.initialized = true;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_line(reader: &mut (impl AsyncRead + Unpin)) -> Value {
        let mut bytes = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            reader.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            bytes.push(byte[0]);
        }
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn call_matches_response_by_id() {
        let (client_writer, mut server_reader) = tokio::io::duplex(4096);
        let (mut server_writer, client_reader) = tokio::io::duplex(4096);
        let mut session = RpcSession::new(client_writer, client_reader);
        session.initialized = true;

        let server = tokio::spawn(async move {
            let request = read_line(&mut server_reader).await;
            assert_eq!(request["method"], "ping");
            let id = request["id"].clone();
            // Interleave an unrelated notification before the response.
            let notification = json!({"jsonrpc": "2.0", "method": "noise", "params": {}});
            server_writer
                .write_all(format!("{}\n", notification).as_bytes())
                .await
                .unwrap();
            let response = json!({"jsonrpc": "2.0", "id": id, "result": {"pong": true}});
            server_writer
                .write_all(format!("{}\n", response).as_bytes())
                .await
                .unwrap();
        });

        let mut seen = Vec::new();
        let result = session
            .call("ping", json!({}), |incoming| {
                if let RpcIncoming::Notification { method, .. } = incoming {
                    seen.push(method);
                }
            })
            .await
            .unwrap();
        assert_eq!(result["pong"], true);
        assert_eq!(seen, vec!["noise".to_string()]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn calls_before_handshake_are_rejected() {
        let (client_writer, _server_reader) = tokio::io::duplex(4096);
        let (_server_writer, client_reader) = tokio::io::duplex(4096);
        let mut session = RpcSession::new(client_writer, client_reader);
        let err = session
            .call("session/new", json!({}), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Session(_)));
    }

    #[tokio::test]
    async fn handshake_sends_initialize_then_initialized() {
        let (client_writer, mut server_reader) = tokio::io::duplex(4096);
        let (mut server_writer, client_reader) = tokio::io::duplex(4096);
        let mut session = RpcSession::new(client_writer, client_reader);

        let server = tokio::spawn(async move {
            let request = read_line(&mut server_reader).await;
            assert_eq!(request["method"], "initialize");
            let response =
                json!({"jsonrpc": "2.0", "id": request["id"], "result": {"ok": true}});
            server_writer
                .write_all(format!("{}\n", response).as_bytes())
                .await
                .unwrap();
            let notification = read_line(&mut server_reader).await;
            assert_eq!(notification["method"], "initialized");
            assert!(notification.get("id").is_none());
        });

        session.handshake(json!({"protocolVersion": 1})).await.unwrap();
        assert!(session.initialized);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn non_json_lines_are_skipped() {
        let (client_writer, _server_reader) = tokio::io::duplex(4096);
        let (mut server_writer, client_reader) = tokio::io::duplex(4096);
        let mut session = RpcSession::new(client_writer, client_reader);

        server_writer
            .write_all(b"garbage that is not json\n{\"jsonrpc\":\"2.0\",\"method\":\"n\",\"params\":{}}\n")
            .await
            .unwrap();
        drop(server_writer);

        match session.next_incoming().await.unwrap() {
            Some(RpcIncoming::Notification { method, .. }) => assert_eq!(method, "n"),
            other => panic!("expected notification, got {:?}", other),
        }
        assert!(session.next_incoming().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn error_responses_become_session_errors() {
        let (client_writer, mut server_reader) = tokio::io::duplex(4096);
        let (mut server_writer, client_reader) = tokio::io::duplex(4096);
        let mut session = RpcSession::new(client_writer, client_reader);
        session.initialized = true;

        let server = tokio::spawn(async move {
            let request = read_line(&mut server_reader).await;
            let response = json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": -32601, "message": "method not found"},
            });
            server_writer
                .write_all(format!("{}\n", response).as_bytes())
                .await
                .unwrap();
        });

        let err = session.call("bogus", json!({}), |_| {}).await.unwrap_err();
        assert!(err.to_string().contains("method not found"));
        server.await.unwrap();
    }
}
