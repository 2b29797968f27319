//! South-side HTTP API: the OpenAI-compatible chat-completions endpoint,
//! the models listing, the refresh-models trigger, and the `/ws` upgrade
//! that accepts the browser agent's duplex link.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use futures::StreamExt;
use tower_http::cors::CorsLayer;

use crate::error::AppError;
use crate::lifecycle::{AdmissionError, LifecycleCoordinator};
use crate::openai::{ChatCompletionRequest, ModelInfo, ModelsResponse, RefreshModelsResponse};
use crate::stream::{render_non_streaming_response, render_streaming_response, AbortGuard, RenderedFrame};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<LifecycleCoordinator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", axum::routing::post(chat_completions))
        .route("/v1/models", axum::routing::get(list_models))
        .route("/v1/refresh-models", axum::routing::post(refresh_models))
        .route("/ws", axum::routing::get(agent_link_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

impl From<AdmissionError> for AppError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::AgentUnavailable => AppError::AgentUnavailable,
            AdmissionError::Overloaded => AppError::Overloaded,
            AdmissionError::ModelNotFound(name) => AppError::ModelNotFound(name),
        }
    }
}

async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, AppError> {
    let streaming = request.is_streaming();
    let model_name = request.model.clone();

    let admitted = state.coordinator.admit_and_dispatch(request).await?;

    let guard = AbortGuard::new(
        admitted.id.clone(),
        state.coordinator.link().clone(),
        state.coordinator.registry().clone(),
    );

    if streaming {
        let config = state.coordinator_config();
        let sse_stream = render_streaming_response(
            admitted.rx,
            model_name,
            admitted.model.model_type,
            config,
            guard,
        )
        .map(|r| r.map(render_to_event));

        let sse = Sse::new(sse_stream).keep_alive(KeepAlive::default());
        Ok((
            [
                (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
                (header::CONNECTION, HeaderValue::from_static("keep-alive")),
            ],
            [(
                header::HeaderName::from_static("x-accel-buffering"),
                HeaderValue::from_static("no"),
            )],
            sse,
        )
            .into_response())
    } else {
        let body = render_non_streaming_response(
            admitted.rx,
            model_name,
            admitted.model.model_type,
            admitted.prompt_chars,
            guard,
        )
        .await;
        Ok(Json(body).into_response())
    }
}

fn render_to_event(frame: RenderedFrame) -> Event {
    match frame {
        RenderedFrame::Data(value) => Event::default().data(value.to_string()),
        RenderedFrame::Done => Event::default().data("[DONE]"),
    }
}

impl AppState {
    fn coordinator_config(&self) -> crate::config::RelayConfig {
        self.coordinator.config_snapshot()
    }
}

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let models = state.coordinator.models().list().await;
    let created = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let data = models
        .into_iter()
        .map(|(name, descriptor)| ModelInfo {
            id: name,
            object: "model",
            created,
            owned_by: "lmarena",
            model_type: descriptor.model_type.as_str().to_string(),
        })
        .collect();
    Json(ModelsResponse {
        object: "list",
        data,
    })
}

async fn refresh_models(State(state): State<AppState>) -> Json<RefreshModelsResponse> {
    let sent = state.coordinator.refresh_models().await;
    let models: Vec<String> = state
        .coordinator
        .models()
        .list()
        .await
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    Json(RefreshModelsResponse {
        success: sent,
        message: if sent {
            "refresh_models sent to agent".to_string()
        } else {
            "no agent connected".to_string()
        },
        models,
    })
}

async fn agent_link_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let coordinator = state.coordinator.clone();
    ws.on_upgrade(move |socket| async move {
        let link = coordinator.link().clone();
        link.accept(socket, coordinator).await;
    })
}
