//! Request Registry (C1): owns the set of in-flight requests, enforces the
//! concurrency cap, and holds each request's delivery queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};

use crate::frame::AgentFrame;
use crate::model_registry::ModelDescriptor;
use crate::openai::ChatCompletionRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Dispatched,
    Processing,
    Completed,
    Timeout,
    Errored,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Timeout | RequestState::Errored
        )
    }

    pub fn is_pending_delivery(&self) -> bool {
        matches!(self, RequestState::Dispatched | RequestState::Processing)
    }
}

/// The request entity. The original client payload is kept until terminal
/// (observability / potential error reporting); the queue is retained by
/// the registry even while the Agent Link is down.
pub struct Request {
    pub id: String,
    pub model_name: String,
    pub model: ModelDescriptor,
    pub streaming: bool,
    pub payload: ChatCompletionRequest,
    pub created_at: Instant,
    state: std::sync::Mutex<RequestStateTimestamps>,
}

struct RequestStateTimestamps {
    state: RequestState,
    dispatched_at: Option<Instant>,
    last_activity_at: Instant,
    accumulated_response: String,
}

impl Request {
    pub fn state(&self) -> RequestState {
        self.state.lock().unwrap().state
    }

    pub fn append_accumulated(&self, text: &str) {
        let mut guard = self.state.lock().unwrap();
        guard.accumulated_response.push_str(text);
        guard.last_activity_at = Instant::now();
    }

    pub fn accumulated_response(&self) -> String {
        self.state.lock().unwrap().accumulated_response.clone()
    }
}

struct RequestEntry {
    request: Arc<Request>,
    queue_tx: mpsc::Sender<AgentFrame>,
}

struct RegistryInner {
    requests: HashMap<String, RequestEntry>,
}

pub struct Overloaded;

pub struct RequestRegistry {
    inner: Mutex<RegistryInner>,
    cap: usize,
    queue_capacity: usize,
}

impl RequestRegistry {
    pub fn new(cap: usize, queue_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                requests: HashMap::new(),
            }),
            cap,
            queue_capacity,
        }
    }

    /// Atomically checks the live count against the cap and, on success,
    /// inserts a new request and returns it with the receiving half of its
    /// delivery queue. On failure the registry is left unmodified.
    pub async fn admit(
        &self,
        id: String,
        payload: ChatCompletionRequest,
        model_name: String,
        model: ModelDescriptor,
        streaming: bool,
    ) -> Result<(Arc<Request>, mpsc::Receiver<AgentFrame>), Overloaded> {
        let mut inner = self.inner.lock().await;
        if inner.requests.len() >= self.cap {
            return Err(Overloaded);
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let now = Instant::now();
        let request = Arc::new(Request {
            id: id.clone(),
            model_name,
            model,
            streaming,
            payload,
            created_at: now,
            state: std::sync::Mutex::new(RequestStateTimestamps {
                state: RequestState::Pending,
                dispatched_at: None,
                last_activity_at: now,
                accumulated_response: String::new(),
            }),
        });

        inner.requests.insert(
            id,
            RequestEntry {
                request: request.clone(),
                queue_tx: tx,
            },
        );

        Ok((request, rx))
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Request>> {
        self.inner
            .lock()
            .await
            .requests
            .get(id)
            .map(|e| e.request.clone())
    }

    /// Idempotent: safe to call multiple times, including for an id that
    /// was never admitted.
    pub async fn complete(&self, id: &str) {
        self.inner.lock().await.requests.remove(id);
    }

    pub async fn mark_dispatched(&self, id: &str) {
        if let Some(entry) = self.inner.lock().await.requests.get(id) {
            let mut guard = entry.request.state.lock().unwrap();
            guard.state = RequestState::Dispatched;
            guard.dispatched_at = Some(Instant::now());
        }
    }

    pub async fn transition(&self, id: &str, state: RequestState) {
        if let Some(entry) = self.inner.lock().await.requests.get(id) {
            let mut guard = entry.request.state.lock().unwrap();
            guard.state = state;
            guard.last_activity_at = Instant::now();
        }
    }

    /// All requests currently in {Dispatched, Processing}.
    pub async fn pending(&self) -> Vec<Arc<Request>> {
        self.inner
            .lock()
            .await
            .requests
            .values()
            .filter(|e| e.request.state().is_pending_delivery())
            .map(|e| e.request.clone())
            .collect()
    }

    /// All live requests regardless of state (used on agent disconnect:
    /// requests that haven't reached {Dispatched, Processing} yet also
    /// need to fail).
    pub async fn all(&self) -> Vec<Arc<Request>> {
        self.inner
            .lock()
            .await
            .requests
            .values()
            .map(|e| e.request.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.requests.len()
    }

    /// Routes one inbound agent frame to its request's delivery queue.
    /// Drops silently (with a warning) if the id is unknown — including
    /// after `complete`. Backpressure comes from this `send` awaiting a
    /// full bounded channel.
    pub async fn route_frame(&self, id: &str, frame: AgentFrame) {
        let tx = {
            let inner = self.inner.lock().await;
            inner.requests.get(id).map(|e| e.queue_tx.clone())
        };

        match tx {
            Some(tx) => {
                if tx.send(frame).await.is_err() {
                    tracing::warn!(request_id = id, "delivery queue closed before frame delivery");
                }
            }
            None => {
                tracing::warn!(request_id = id, "dropping frame for unknown/closed request");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_registry::Modality;

    fn dummy_payload() -> ChatCompletionRequest {
        serde_json::from_value(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap()
    }

    fn dummy_model() -> ModelDescriptor {
        ModelDescriptor {
            id: "m-id".into(),
            model_type: Modality::Chat,
        }
    }

    #[tokio::test]
    async fn admission_never_exceeds_cap() {
        let registry = RequestRegistry::new(2, 5);
        let a = registry
            .admit("a".into(), dummy_payload(), "m".into(), dummy_model(), true)
            .await;
        let b = registry
            .admit("b".into(), dummy_payload(), "m".into(), dummy_model(), true)
            .await;
        let c = registry
            .admit("c".into(), dummy_payload(), "m".into(), dummy_model(), true)
            .await;

        assert!(a.is_ok());
        assert!(b.is_ok());
        assert!(c.is_err());
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn complete_is_idempotent_and_frees_capacity() {
        let registry = RequestRegistry::new(1, 5);
        let (req, _rx) = registry
            .admit("a".into(), dummy_payload(), "m".into(), dummy_model(), true)
            .await
            .ok()
            .unwrap();
        registry.complete(&req.id).await;
        registry.complete(&req.id).await; // no-op, doesn't panic
        assert_eq!(registry.len().await, 0);

        let again = registry
            .admit("b".into(), dummy_payload(), "m".into(), dummy_model(), true)
            .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn frame_for_unknown_id_is_dropped_not_errored() {
        let registry = RequestRegistry::new(5, 5);
        // Should not panic despite no matching request.
        registry.route_frame("ghost", AgentFrame::Done).await;
    }

    #[tokio::test]
    async fn frames_are_delivered_in_order() {
        let registry = RequestRegistry::new(5, 5);
        let (req, mut rx) = registry
            .admit("a".into(), dummy_payload(), "m".into(), dummy_model(), true)
            .await
            .ok()
            .unwrap();

        registry
            .route_frame(&req.id, AgentFrame::Delta("He".into()))
            .await;
        registry
            .route_frame(&req.id, AgentFrame::Delta("llo".into()))
            .await;
        registry.route_frame(&req.id, AgentFrame::Done).await;

        assert_eq!(rx.recv().await, Some(AgentFrame::Delta("He".into())));
        assert_eq!(rx.recv().await, Some(AgentFrame::Delta("llo".into())));
        assert_eq!(rx.recv().await, Some(AgentFrame::Done));
    }
}
