//! Agent Link (C2): the single duplex text-frame socket to the browser
//! agent. Outbound frames are serialized behind one writer task (the
//! "writer lock"); inbound frames are demultiplexed by request id into the
//! registry's per-request queues.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};

use crate::config::RelayConfig;
use crate::frame::parse_frame;
use crate::lifecycle::LifecycleCoordinator;
use crate::model_registry::ModelRegistry;
use crate::registry::{RequestRegistry, RequestState};

/// A handle to the current generation of the link. Every outbound writer
/// re-fetches this before sending; a stale generation's writer simply finds
/// its channel closed and gives up.
#[derive(Clone)]
pub struct LinkHandle {
    tx: mpsc::Sender<String>,
    generation: u32,
}

impl LinkHandle {
    pub async fn send_json(&self, value: &Value) -> bool {
        let text = value.to_string();
        self.tx.send(text).await.is_ok()
    }
}

struct LinkSlot {
    handle: Option<LinkHandle>,
}

pub struct AgentLink {
    slot: RwLock<LinkSlot>,
    generation: AtomicU32,
    registry: Arc<RequestRegistry>,
    models: Arc<ModelRegistry>,
    config: RelayConfig,
}

impl AgentLink {
    pub fn new(registry: Arc<RequestRegistry>, models: Arc<ModelRegistry>, config: RelayConfig) -> Self {
        Self {
            slot: RwLock::new(LinkSlot { handle: None }),
            generation: AtomicU32::new(0),
            registry,
            models,
            config,
        }
    }

    pub async fn current(&self) -> Option<LinkHandle> {
        self.slot.read().await.handle.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.current().await.is_some()
    }

    /// Accepts a newly-upgraded socket, superseding any prior link, and
    /// drives it until it closes. Spawns the writer and heartbeat tasks and
    /// runs the inbound read loop inline so the caller (the axum handler)
    /// can simply `await` this.
    pub async fn accept(
        self: Arc<Self>,
        socket: WebSocket,
        lifecycle: Arc<LifecycleCoordinator>,
    ) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (mut ws_tx, mut ws_rx) = {
            use futures::StreamExt;
            socket.split()
        };

        let (queue_tx, mut queue_rx) = mpsc::channel::<String>(64);
        let handle = LinkHandle {
            tx: queue_tx,
            generation,
        };

        {
            let mut slot = self.slot.write().await;
            slot.handle = Some(handle.clone());
        }
        tracing::info!(generation, "agent link accepted");

        let pending_ids: Vec<String> = self
            .registry
            .pending()
            .await
            .into_iter()
            .map(|r| r.id.clone())
            .collect();
        if !pending_ids.is_empty() {
            let ack = json!({
                "type": "reconnection_ack",
                "pending_request_ids": pending_ids,
                "message": "resuming delivery for in-flight requests",
            });
            let _ = handle.send_json(&ack).await;
        }

        let send_task = {
            use futures::SinkExt;
            tokio::spawn(async move {
                while let Some(text) = queue_rx.recv().await {
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            })
        };

        let heartbeat_handle = handle.clone();
        let heartbeat_cfg = self.config.clone();
        let last_pong = Arc::new(tokio::sync::Mutex::new(Instant::now()));
        let missed = Arc::new(AtomicU32::new(0));
        let heartbeat_last_pong = last_pong.clone();
        let heartbeat_missed = missed.clone();
        let (dead_tx, mut dead_rx) = tokio::sync::oneshot::channel::<()>();
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_cfg.ping_interval);
            loop {
                ticker.tick().await;
                let ping = json!({"type": "ping", "timestamp": now_millis()});
                if !heartbeat_handle.send_json(&ping).await {
                    let _ = dead_tx.send(());
                    break;
                }
                let elapsed = heartbeat_last_pong.lock().await.elapsed();
                if elapsed > heartbeat_cfg.ping_interval * 2 {
                    let count = heartbeat_missed.fetch_add(1, Ordering::SeqCst) + 1;
                    if count >= heartbeat_cfg.missed_pong_threshold {
                        tracing::warn!("agent link missed {count} consecutive pongs, treating as dead");
                        let _ = dead_tx.send(());
                        break;
                    }
                } else {
                    heartbeat_missed.store(0, Ordering::SeqCst);
                }
            }
        });

        use futures::StreamExt as _;
        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_inbound(&text, &handle, &last_pong, &missed).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "agent link read error");
                            break;
                        }
                    }
                }
                _ = &mut dead_rx => {
                    tracing::warn!("agent link read loop torn down after dead-link detection");
                    break;
                }
            }
        }

        heartbeat_task.abort();
        send_task.abort();

        let mut slot = self.slot.write().await;
        if slot
            .handle
            .as_ref()
            .map(|h| h.generation == generation)
            .unwrap_or(false)
        {
            slot.handle = None;
        }
        drop(slot);

        tracing::info!(generation, "agent link disconnected");
        lifecycle.on_agent_disconnected().await;
    }

    async fn handle_inbound(
        &self,
        text: &str,
        handle: &LinkHandle,
        last_pong: &Arc<tokio::sync::Mutex<Instant>>,
        missed: &Arc<AtomicU32>,
    ) {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            tracing::warn!("dropping unparseable inbound frame");
            return;
        };

        let msg_type = value.get("type").and_then(Value::as_str);
        match msg_type {
            Some("pong") => {
                *last_pong.lock().await = Instant::now();
                missed.store(0, Ordering::SeqCst);
            }
            Some("reconnection_handshake") => {
                self.handle_reconnection_handshake(&value, handle).await;
            }
            Some("model_registry") => {
                let models_data = value.get("models").cloned().unwrap_or(Value::Null);
                let count = self.models.replace_from_agent(&models_data).await;
                let ack = json!({"type": "model_registry_ack", "count": count});
                let _ = handle.send_json(&ack).await;
            }
            _ => {
                if let Some(request_id) = value.get("request_id").and_then(Value::as_str) {
                    let data = value.get("data").cloned().unwrap_or(Value::Null);
                    if let Some(frame) = parse_frame(&data) {
                        self.registry.route_frame(request_id, frame).await;
                    }
                } else {
                    tracing::warn!(?value, "unrecognized inbound agent message");
                }
            }
        }
    }

    async fn handle_reconnection_handshake(&self, value: &Value, handle: &LinkHandle) {
        let ids: Vec<String> = value
            .get("pending_request_ids")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut restored = 0;
        for id in &ids {
            if self.registry.get(id).await.is_some() {
                self.registry.transition(id, RequestState::Processing).await;
                restored += 1;
            }
        }

        let ack = json!({
            "type": "restoration_ack",
            "restored_count": restored,
            "message": "restoration complete",
        });
        let _ = handle.send_json(&ack).await;
        tracing::info!(restored, requested = ids.len(), "reconnection handshake processed");
    }

    pub async fn send_dispatch(
        &self,
        request_id: &str,
        payload: &Value,
        files_to_upload: &Value,
    ) -> bool {
        let Some(handle) = self.current().await else {
            return false;
        };
        let frame = json!({
            "request_id": request_id,
            "payload": payload,
            "files_to_upload": files_to_upload,
        });
        handle.send_json(&frame).await
    }

    pub async fn send_abort(&self, request_id: &str) {
        if let Some(handle) = self.current().await {
            let frame = json!({"type": "abort_request", "request_id": request_id});
            let _ = handle.send_json(&frame).await;
        }
    }

    pub async fn send_refresh_models(&self) -> bool {
        let Some(handle) = self.current().await else {
            return false;
        };
        handle.send_json(&json!({"type": "refresh_models"})).await
    }
}

fn now_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
