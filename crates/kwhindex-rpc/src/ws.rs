//! WebSocket JSON-RPC client with auto-reconnect and subscription management.
//!
//! A background task owns the socket. Callers talk to it over a command
//! channel; responses are matched on request id, notifications are routed
//! through the [`SubscriptionManager`]. A new subscription is registered by
//! the socket task as soon as its `eth_subscribe` response is read, so no
//! notification that follows it on the wire can miss the entry. On reconnect
//! every live subscription is re-created and re-keyed to the node's new id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::subscriptions::{SubscriptionId, SubscriptionManager};
use crate::transport::RpcTransport;

type Responder = oneshot::Sender<Result<JsonRpcResponse, TransportError>>;
type SubscribeResponder =
    oneshot::Sender<Result<(SubscriptionId, mpsc::UnboundedReceiver<Value>), TransportError>>;

/// An `eth_subscribe` awaiting its response, keyed by request id.
enum PendingSubscribe {
    /// Re-created after a reconnect; re-key the existing entry.
    Renew(SubscriptionId),
    /// Opened by a caller; register, then hand the receiver back.
    Open {
        kind: String,
        params: Vec<Value>,
        tx: SubscribeResponder,
    },
}

#[derive(Debug, Clone)]
pub struct WsClientConfig {
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(60),
        }
    }
}

enum WsCommand {
    Send {
        req: JsonRpcRequest,
        tx: Responder,
    },
    Subscribe {
        req: JsonRpcRequest,
        kind: String,
        params: Vec<Value>,
        tx: SubscribeResponder,
    },
    Close,
}

pub struct WsRpcClient {
    url: String,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    subscriptions: SubscriptionManager,
    next_id: Arc<AtomicU64>,
}

impl WsRpcClient {
    /// Start the background connection task for `url`.
    ///
    /// Connection failures are retried in the background; requests sent
    /// before the socket is up are queued.
    pub async fn connect(
        url: impl Into<String>,
        config: WsClientConfig,
    ) -> Result<Self, TransportError> {
        let url = url.into();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(TransportError::WebSocket(format!("not a websocket url: {url}")));
        }
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let subscriptions = SubscriptionManager::new();
        let next_id = Arc::new(AtomicU64::new(1));

        tokio::spawn(ws_task(
            url.clone(),
            cmd_rx,
            subscriptions.clone(),
            next_id.clone(),
            config,
        ));

        Ok(Self {
            url,
            cmd_tx,
            subscriptions,
            next_id,
        })
    }

    /// `eth_subscribe` to `kind` (`"newHeads"`, `"logs"`) and return the
    /// notification stream.
    pub async fn subscribe(
        &self,
        kind: &str,
        params: Vec<Value>,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Value>), TransportError> {
        let args = std::iter::once(Value::String(kind.to_string()))
            .chain(params.iter().cloned())
            .collect();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, "eth_subscribe", args);
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Subscribe {
                req,
                kind: kind.to_string(),
                params,
                tx,
            })
            .map_err(|_| TransportError::WebSocket("WS task closed".into()))?;
        let (sub_id, notes) = rx
            .await
            .map_err(|_| TransportError::WebSocket("WS response dropped".into()))??;
        tracing::debug!(kind, subscription = %sub_id, "subscribed");
        Ok((sub_id, notes))
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

impl Drop for WsRpcClient {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WsCommand::Close);
    }
}

#[async_trait]
impl RpcTransport for WsRpcClient {
    async fn send(&self, mut req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        // Ids are owned by the socket so concurrent callers never collide.
        let caller_id = std::mem::replace(
            &mut req.id,
            crate::jsonrpc::RpcId::Number(self.next_id.fetch_add(1, Ordering::Relaxed)),
        );
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Send { req, tx })
            .map_err(|_| TransportError::WebSocket("WS task closed".into()))?;
        let mut resp = rx
            .await
            .map_err(|_| TransportError::WebSocket("WS response dropped".into()))??;
        resp.id = caller_id;
        Ok(resp)
    }

    fn url(&self) -> &str {
        &self.url
    }
}

async fn ws_task(
    url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    subscriptions: SubscriptionManager,
    next_id: Arc<AtomicU64>,
    config: WsClientConfig,
) {
    let mut backoff = config.reconnect_initial;

    loop {
        tracing::info!(url = %url, "connecting via WebSocket");

        let (ws_stream, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "WS connect failed, retrying in {backoff:?}");
                time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.reconnect_max);
                continue;
            }
        };
        backoff = config.reconnect_initial;
        let (mut sink, mut stream) = ws_stream.split();

        let mut pending: HashMap<u64, Responder> = HashMap::new();
        let mut subscribing: HashMap<u64, PendingSubscribe> = HashMap::new();

        for (old_id, kind, params) in subscriptions.active() {
            let id = next_id.fetch_add(1, Ordering::Relaxed);
            let args = std::iter::once(Value::String(kind)).chain(params).collect();
            let req = JsonRpcRequest::new(id, "eth_subscribe", args);
            if let Ok(msg) = serde_json::to_string(&req) {
                if sink.send(Message::Text(msg.into())).await.is_ok() {
                    subscribing.insert(id, PendingSubscribe::Renew(old_id));
                }
            }
        }
        if !subscribing.is_empty() {
            tracing::info!(count = subscribing.len(), "re-subscribing after reconnect");
        }

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(WsCommand::Close) => {
                        let _ = sink.close().await;
                        return;
                    }
                    Some(WsCommand::Send { req, tx }) => {
                        let id = req.id.as_number().unwrap_or(0);
                        match serde_json::to_string(&req) {
                            Ok(msg) => {
                                pending.insert(id, tx);
                                if sink.send(Message::Text(msg.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(Err(e.into()));
                            }
                        }
                    }
                    Some(WsCommand::Subscribe { req, kind, params, tx }) => {
                        let id = req.id.as_number().unwrap_or(0);
                        match serde_json::to_string(&req) {
                            Ok(msg) => {
                                subscribing.insert(id, PendingSubscribe::Open { kind, params, tx });
                                if sink.send(Message::Text(msg.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(Err(e.into()));
                            }
                        }
                    }
                },
                msg = stream.next() => match msg {
                    None => break,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "WS receive error");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        handle_message(text.as_str(), &mut pending, &mut subscribing, &subscriptions);
                    }
                    Some(Ok(Message::Close(_))) => break,
                    _ => {}
                },
            }
        }

        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(TransportError::WebSocket("connection lost".into())));
        }
        for (_, op) in subscribing.drain() {
            if let PendingSubscribe::Open { tx, .. } = op {
                let _ = tx.send(Err(TransportError::WebSocket("connection lost".into())));
            }
        }
        tracing::warn!(url = %url, "WS disconnected, reconnecting in {backoff:?}");
        time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.reconnect_max);
    }
}

fn handle_message(
    text: &str,
    pending: &mut HashMap<u64, Responder>,
    subscribing: &mut HashMap<u64, PendingSubscribe>,
    subscriptions: &SubscriptionManager,
) {
    let Ok(val) = serde_json::from_str::<Value>(text) else {
        tracing::debug!("failed to parse WS message as JSON");
        return;
    };

    if val.get("method").and_then(Value::as_str) == Some("eth_subscription") {
        let params = &val["params"];
        if let Some(id) = params["subscription"].as_str() {
            subscriptions.dispatch(&SubscriptionId(id.to_string()), params["result"].clone());
        }
        return;
    }

    let Ok(resp) = serde_json::from_value::<JsonRpcResponse>(val) else {
        return;
    };
    let Some(id) = resp.id.as_number() else {
        return;
    };

    if let Some(op) = subscribing.remove(&id) {
        match (op, resp.into_result()) {
            (PendingSubscribe::Renew(old), Ok(Value::String(new))) => {
                subscriptions.rekey(&old, SubscriptionId(new))
            }
            (PendingSubscribe::Renew(old), other) => {
                tracing::warn!(subscription = %old, result = ?other, "re-subscribe failed");
                subscriptions.remove(&old);
            }
            (PendingSubscribe::Open { kind, params, tx }, Ok(Value::String(new))) => {
                let sub_id = SubscriptionId(new);
                let rx = subscriptions.register(sub_id.clone(), kind, params);
                let _ = tx.send(Ok((sub_id, rx)));
            }
            (PendingSubscribe::Open { tx, .. }, Ok(other)) => {
                let _ = tx.send(Err(TransportError::Other(format!("eth_subscribe returned {other}"))));
            }
            (PendingSubscribe::Open { tx, .. }, Err(e)) => {
                let _ = tx.send(Err(TransportError::Rpc(e)));
            }
        }
        return;
    }

    if let Some(tx) = pending.remove(&id) {
        let _ = tx.send(Ok(resp));
    }
}
