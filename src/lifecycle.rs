//! Lifecycle Coordinator (C5): ties the registry, agent link, translator
//! and stream translator together across the admit → dispatch → stream →
//! terminal state machine, including disconnect-survival.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;
use uuid::Uuid;

use crate::agent_link::AgentLink;
use crate::frame::AgentFrame;
use crate::model_registry::{ModelDescriptor, ModelRegistry};
use crate::openai::ChatCompletionRequest;
use crate::registry::{RequestRegistry, RequestState};
use crate::translator::translate;
use crate::config::RelayConfig;

#[derive(Debug)]
pub enum AdmissionError {
    AgentUnavailable,
    Overloaded,
    ModelNotFound(String),
}

pub struct AdmittedRequest {
    pub id: String,
    pub model: ModelDescriptor,
    pub streaming: bool,
    pub rx: tokio::sync::mpsc::Receiver<AgentFrame>,
    pub prompt_chars: usize,
}

pub struct LifecycleCoordinator {
    registry: Arc<RequestRegistry>,
    link: Arc<AgentLink>,
    models: Arc<ModelRegistry>,
    config: RelayConfig,
    shutting_down: AtomicBool,
}

impl LifecycleCoordinator {
    pub fn new(
        registry: Arc<RequestRegistry>,
        link: Arc<AgentLink>,
        models: Arc<ModelRegistry>,
        config: RelayConfig,
    ) -> Self {
        Self {
            registry,
            link,
            models,
            config,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Admits, translates, and dispatches one chat request. Returns the
    /// receiving half of its delivery queue for the caller to drive through
    /// the Stream Translator.
    pub async fn admit_and_dispatch(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<AdmittedRequest, AdmissionError> {
        if !self.link.is_connected().await {
            return Err(AdmissionError::AgentUnavailable);
        }

        let model = self
            .models
            .get(&request.model)
            .await
            .ok_or_else(|| AdmissionError::ModelNotFound(request.model.clone()))?;

        let streaming = request.is_streaming();
        let prompt_chars: usize = request
            .messages
            .iter()
            .map(|m| match &m.content {
                Some(crate::openai::Content::Text(t)) => t.len(),
                Some(crate::openai::Content::Parts(parts)) => parts
                    .iter()
                    .map(|p| match p {
                        crate::openai::Part::Text { text } => text.len(),
                        crate::openai::Part::ImageUrl { .. } => 0,
                    })
                    .sum(),
                None => 0,
            })
            .sum();

        let id = Uuid::new_v4().to_string();
        let (stored_request, rx) = self
            .registry
            .admit(id.clone(), request.clone(), request.model.clone(), model.clone(), streaming)
            .await
            .map_err(|_| AdmissionError::Overloaded)?;

        let translated = translate(&request, &model);
        let files: Vec<_> = translated
            .attachments
            .iter()
            .map(|a| {
                json!({
                    "fileName": a.file_name,
                    "contentType": a.content_type,
                    "base64Data": a.base64_data,
                })
            })
            .collect();

        let payload_value = serde_json::to_value(&translated.payload).unwrap_or(serde_json::Value::Null);
        let sent = self
            .link
            .send_dispatch(&stored_request.id, &payload_value, &json!(files))
            .await;

        if !sent {
            self.registry.complete(&stored_request.id).await;
            return Err(AdmissionError::AgentUnavailable);
        }

        self.registry.mark_dispatched(&stored_request.id).await;

        Ok(AdmittedRequest {
            id: stored_request.id.clone(),
            model,
            streaming,
            rx,
            prompt_chars,
        })
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    pub fn link(&self) -> &Arc<AgentLink> {
        &self.link
    }

    pub fn models(&self) -> &Arc<ModelRegistry> {
        &self.models
    }

    pub fn config_snapshot(&self) -> RelayConfig {
        self.config.clone()
    }

    /// Called by the Agent Link when the socket closes. Requests already in
    /// {Dispatched, Processing} enter the grace window; everything else is
    /// failed immediately, since the agent never acknowledged them.
    pub async fn on_agent_disconnected(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let all = self.registry.all().await;
        let mut surviving = Vec::new();
        for request in all {
            if request.state().is_pending_delivery() {
                surviving.push(request.id.clone());
            } else {
                self.fail_request(&request.id, "browser_disconnected").await;
            }
        }

        if surviving.is_empty() {
            return;
        }

        let coordinator = self.clone();
        let grace = self.config.request_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            for id in surviving {
                if let Some(request) = coordinator.registry.get(&id).await {
                    if !request.state().is_terminal() {
                        let secs = grace.as_secs();
                        let message = format!(
                            "Request timed out after {secs} seconds. Browser may have disconnected during Cloudflare challenge."
                        );
                        coordinator.fail_request(&id, &message).await;
                    }
                }
            }
        });
    }

    async fn fail_request(&self, id: &str, message: &str) {
        self.registry.route_frame(id, AgentFrame::Err(message.to_string())).await;
        self.registry.transition(id, RequestState::Errored).await;
        self.registry.complete(id).await;
    }

    /// Fails every live request immediately, bypassing the grace window.
    /// Called once during process shutdown.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for request in self.registry.all().await {
            self.fail_request(&request.id, "server is shutting down").await;
        }
    }

    pub async fn refresh_models(&self) -> bool {
        self.link.send_refresh_models().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_registry::Modality;

    fn config() -> RelayConfig {
        let mut cfg = RelayConfig::default();
        cfg.request_timeout = std::time::Duration::from_millis(30);
        cfg
    }

    fn coordinator() -> Arc<LifecycleCoordinator> {
        let registry = Arc::new(RequestRegistry::new(5, 5));
        let models = Arc::new(ModelRegistry::new());
        let link = Arc::new(AgentLink::new(registry.clone(), models.clone(), config()));
        Arc::new(LifecycleCoordinator::new(registry, link, models, config()))
    }

    #[tokio::test]
    async fn admission_without_agent_fails_with_agent_unavailable() {
        let coord = coordinator();
        let req = ChatCompletionRequest {
            model: "m".into(),
            messages: vec![],
            stream: Some(true),
            temperature: None,
        };
        let result = coord.admit_and_dispatch(req).await;
        assert!(matches!(result, Err(AdmissionError::AgentUnavailable)));
    }

    #[tokio::test]
    async fn disconnect_without_reconnect_times_out_pending_requests() {
        let coord = coordinator();
        let (req, mut rx) = coord
            .registry
            .admit(
                "r1".into(),
                ChatCompletionRequest {
                    model: "m".into(),
                    messages: vec![],
                    stream: Some(true),
                    temperature: None,
                },
                "m".into(),
                ModelDescriptor {
                    id: "m".into(),
                    model_type: Modality::Chat,
                },
                true,
            )
            .await
            .unwrap();
        coord.registry.mark_dispatched(&req.id).await;
        coord.registry.transition(&req.id, RequestState::Processing).await;

        coord.on_agent_disconnected().await;

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;

        let frame = rx.recv().await;
        assert!(matches!(frame, Some(AgentFrame::Err(_))));
        assert!(coord.registry.get("r1").await.is_none());
    }
}
