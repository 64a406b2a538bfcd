//! Line-delimited JSON request loop.
//!
//! Each stdin line is one request:
//!
//! ```text
//! {"id": 1, "tool": "mqtt_read", "params": {"topic": "status/system"}}
//! {"id": 2, "resource": "topics/allowed"}
//! {"cancel": 1}
//! ```
//!
//! Each response is one stdout line, `{"id", "result"}` or
//! `{"id", "error": {"kind", "message"}}`. Tool calls run concurrently and
//! may answer out of order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use mcpmqtt::Toolbox;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Request {
    Cancel {
        cancel: Value,
    },
    Tool {
        id: Value,
        tool: String,
        #[serde(default = "empty_params")]
        params: Value,
    },
    Resource {
        id: Value,
        resource: String,
    },
}

fn empty_params() -> Value {
    json!({})
}

type Inflight = Arc<Mutex<HashMap<String, CancellationToken>>>;

fn id_key(id: &Value) -> String {
    id.to_string()
}

fn response(id: Value, result: mcpmqtt::Result<Value>) -> Value {
    match result {
        Ok(result) => json!({"id": id, "result": result}),
        Err(e) => json!({
            "id": id,
            "error": {"kind": e.kind(), "message": e.to_string()},
        }),
    }
}

/// Serve requests from stdin until EOF or Ctrl-C.
///
/// On shutdown every in-flight call is cancelled and its response flushed.
pub async fn run(toolbox: Toolbox) -> Result<()> {
    serve_lines(
        toolbox,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        tokio::signal::ctrl_c(),
    )
    .await
}

async fn serve_lines<R, W, S>(toolbox: Toolbox, mut input: R, output: W, interrupt: S) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Future,
{
    let (out_tx, out_rx) = mpsc::channel::<Value>(64);
    let writer = tokio::spawn(write_responses(out_rx, output));

    let shutdown = CancellationToken::new();
    let inflight: Inflight = Arc::new(Mutex::new(HashMap::new()));
    let mut tasks = JoinSet::new();

    tokio::pin!(interrupt);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = &mut interrupt => {
                info!("interrupted, shutting down");
                break;
            }
            read = input.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => {
                info!("stdin closed, shutting down");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "stdin read failed, shutting down");
                break;
            }
        }

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim(),
            Err(e) => {
                warn!(error = %e, "request is not valid UTF-8");
                let err = mcpmqtt::Error::InvalidArgument(format!("request is not valid UTF-8: {e}"));
                let _ = out_tx.send(response(Value::Null, Err(err))).await;
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<Request>(line) {
            Err(e) => {
                warn!(error = %e, "malformed request");
                let err = mcpmqtt::Error::InvalidArgument(format!("malformed request: {e}"));
                let _ = out_tx.send(response(Value::Null, Err(err))).await;
            }
            Ok(Request::Cancel { cancel }) => match inflight.lock().get(&id_key(&cancel)) {
                Some(token) => {
                    debug!(id = %cancel, "cancelling call");
                    token.cancel();
                }
                None => debug!(id = %cancel, "cancel for unknown call ignored"),
            },
            Ok(Request::Resource { id, resource }) => {
                let _ = out_tx.send(response(id, toolbox.read_resource(&resource))).await;
            }
            Ok(Request::Tool { id, tool, params }) => {
                let key = id_key(&id);
                let token = {
                    let mut inflight = inflight.lock();
                    if inflight.contains_key(&key) {
                        None
                    } else {
                        let token = shutdown.child_token();
                        inflight.insert(key.clone(), token.clone());
                        Some(token)
                    }
                };
                let Some(token) = token else {
                    warn!(%id, "request id already in flight");
                    let err = mcpmqtt::Error::InvalidArgument(format!("request id {id} is already in flight"));
                    let _ = out_tx.send(response(id, Err(err))).await;
                    continue;
                };
                debug!(%id, tool = %tool, "call started");

                let toolbox = toolbox.clone();
                let out = out_tx.clone();
                let inflight = inflight.clone();
                tasks.spawn(async move {
                    let result = toolbox.call(&tool, &params, &token).await;
                    inflight.lock().remove(&key);
                    let _ = out.send(response(id, result)).await;
                });
            }
        }

        while tasks.try_join_next().is_some() {}
    }

    shutdown.cancel();
    while tasks.join_next().await.is_some() {}

    drop(out_tx);
    writer.await??;
    Ok(())
}

async fn write_responses<W>(mut rx: mpsc::Receiver<Value>, mut output: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(value) = rx.recv().await {
        let mut line = serde_json::to_vec(&value)?;
        line.push(b'\n');
        output.write_all(&line).await?;
        output.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpmqtt::{BrokerInfo, Config, ConnectionManager, MqttConfig, Orchestrator};
    use tokio::io::AsyncReadExt;

    /// A toolbox whose broker is never reachable.
    fn offline_toolbox() -> (Toolbox, Arc<ConnectionManager>) {
        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            reconnect_min_delay: 0.05,
            reconnect_max_delay: 0.1,
            ..MqttConfig::default()
        };
        let (manager, inbound) = ConnectionManager::start(&config).unwrap();
        let registry = Arc::new(Config::fallback().registry().unwrap());
        let orchestrator = Orchestrator::new(registry, manager.clone());
        orchestrator.spawn_dispatcher(inbound);
        (Toolbox::new(orchestrator, BrokerInfo::from(&config)), manager)
    }

    async fn serve(input: &[u8]) -> Vec<Value> {
        let (toolbox, manager) = offline_toolbox();
        let (output, mut responses) = tokio::io::duplex(64 * 1024);

        serve_lines(toolbox, input, output, std::future::pending::<()>())
            .await
            .unwrap();
        manager.close().await.unwrap();

        let mut out = String::new();
        responses.read_to_string(&mut out).await.unwrap();
        out.lines().map(|line| serde_json::from_str(line).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_keeps_serving() {
        let input = b"\xff\xfe\n{\"id\": 2, \"resource\": \"topics/allowed\"}\n";
        let responses = serve(input).await;

        assert_eq!(responses.len(), 2, "{responses:?}");
        assert_eq!(responses[0]["id"], Value::Null);
        assert_eq!(responses[0]["error"]["kind"], "invalid_argument");
        assert_eq!(responses[1]["id"], 2);
        assert_eq!(responses[1]["result"]["topics"][0]["pattern"], "test/+");
    }

    #[tokio::test]
    async fn test_duplicate_inflight_id_rejected() {
        let call = r#"{"id": 1, "tool": "mqtt_read", "params": {"topic": "test/a", "timeout": 30}}"#;
        let input = format!("{call}\n{call}\n");
        let responses = serve(input.as_bytes()).await;

        let kinds: Vec<&str> = responses
            .iter()
            .map(|r| r["error"]["kind"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, ["invalid_argument", "cancelled"], "{responses:?}");
        assert!(responses.iter().all(|r| r["id"] == 1));
    }

    #[test]
    fn test_parse_requests() {
        let req: Request =
            serde_json::from_str(r#"{"id": 1, "tool": "mqtt_read", "params": {"topic": "a"}}"#).unwrap();
        assert!(matches!(req, Request::Tool { ref tool, .. } if tool == "mqtt_read"));

        let req: Request = serde_json::from_str(r#"{"id": "x", "tool": "mqtt_publish"}"#).unwrap();
        match req {
            Request::Tool { params, .. } => assert_eq!(params, json!({})),
            other => panic!("unexpected {other:?}"),
        }

        let req: Request = serde_json::from_str(r#"{"id": 2, "resource": "topics/allowed"}"#).unwrap();
        assert!(matches!(req, Request::Resource { .. }));

        let req: Request = serde_json::from_str(r#"{"cancel": 1}"#).unwrap();
        assert!(matches!(req, Request::Cancel { .. }));

        assert!(serde_json::from_str::<Request>(r#"{"id": 3}"#).is_err());
    }

    #[test]
    fn test_response_shape() {
        let ok = response(json!(1), Ok(json!({"success": true})));
        assert_eq!(ok, json!({"id": 1, "result": {"success": true}}));

        let err = response(json!("a"), Err(mcpmqtt::Error::Cancelled));
        assert_eq!(err["id"], "a");
        assert_eq!(err["error"]["kind"], "cancelled");
        assert_eq!(err["error"]["message"], "mqtt: operation cancelled");
    }

    #[test]
    fn test_id_key_distinguishes_types() {
        assert_ne!(id_key(&json!(1)), id_key(&json!("1")));
        assert_eq!(id_key(&json!("abc")), id_key(&json!("abc")));
    }
}
