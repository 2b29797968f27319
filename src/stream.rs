//! Stream Translator (C4): drains one request's delivery queue and renders
//! it as an OpenAI-shaped streaming or non-streaming chat-completions
//! response, coalescing incremental deltas along the way.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use futures::stream::{self, Stream};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::agent_link::AgentLink;
use crate::config::RelayConfig;
use crate::error::openai_error_body;
use crate::frame::AgentFrame;
use crate::model_registry::Modality;
use crate::openai::Usage;
use crate::registry::RequestRegistry;

/// Releases the request's registry entry on every terminal transition,
/// streamed or not. `armed` governs only the best-effort `abort_request`
/// send: it stays `true` when the client goes away mid-stream, and is
/// cleared by `disarm()` once the stream reaches a natural terminal state,
/// so the agent isn't told to abort a request that already finished.
pub struct AbortGuard {
    request_id: String,
    link: Arc<AgentLink>,
    registry: Arc<RequestRegistry>,
    armed: bool,
}

impl AbortGuard {
    pub fn new(request_id: String, link: Arc<AgentLink>, registry: Arc<RequestRegistry>) -> Self {
        Self {
            request_id,
            link,
            registry,
            armed: true,
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        let request_id = self.request_id.clone();
        let link = self.link.clone();
        let registry = self.registry.clone();
        let send_abort = self.armed;
        tokio::spawn(async move {
            if send_abort {
                link.send_abort(&request_id).await;
                tracing::info!(request_id, "client disconnected mid-stream, aborted");
            }
            registry.complete(&request_id).await;
        });
    }
}

struct ChunkIdentity {
    id: String,
    fingerprint: String,
    created: u64,
}

impl ChunkIdentity {
    fn new() -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4()),
            fingerprint: format!("fp_{:08x}", rand_u32()),
            created: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

fn rand_u32() -> u32 {
    Uuid::new_v4().as_u128() as u32
}

fn render_delta_chunk(identity: &ChunkIdentity, model: &str, delta: &str) -> serde_json::Value {
    serde_json::json!({
        "id": identity.id,
        "object": "chat.completion.chunk",
        "created": identity.created,
        "model": model,
        "system_fingerprint": identity.fingerprint,
        "choices": [{
            "index": 0,
            "delta": {"content": delta},
            "finish_reason": serde_json::Value::Null,
        }]
    })
}

fn render_finish_chunk(identity: &ChunkIdentity, model: &str, finish_reason: &str) -> serde_json::Value {
    serde_json::json!({
        "id": identity.id,
        "object": "chat.completion.chunk",
        "created": identity.created,
        "model": model,
        "system_fingerprint": identity.fingerprint,
        "choices": [{
            "index": 0,
            "delta": {},
            "finish_reason": finish_reason,
        }]
    })
}

/// Media (image/video) terminal chunk: content and `finish_reason` land in
/// the same chunk, matching the single-chunk shape the agent's media
/// responses use (there's no incremental delta to separate it from).
fn render_media_finish_chunk(
    identity: &ChunkIdentity,
    model: &str,
    content: &str,
    finish_reason: &str,
) -> serde_json::Value {
    serde_json::json!({
        "id": identity.id,
        "object": "chat.completion.chunk",
        "created": identity.created,
        "model": model,
        "system_fingerprint": identity.fingerprint,
        "choices": [{
            "index": 0,
            "delta": {"content": content},
            "finish_reason": finish_reason,
        }]
    })
}

fn render_completion(identity: &ChunkIdentity, model: &str, content: &str, usage: Usage) -> serde_json::Value {
    serde_json::json!({
        "id": identity.id,
        "object": "chat.completion",
        "created": identity.created,
        "model": model,
        "system_fingerprint": identity.fingerprint,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop",
        }],
        "usage": usage,
    })
}

/// One emitted unit of the streaming response, framed by the HTTP layer
/// into an actual SSE `Event`.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderedFrame {
    Data(serde_json::Value),
    Done,
}

fn media_content(modality: Modality, urls: &[String]) -> String {
    match modality {
        Modality::Video => urls.join("\n"),
        _ => urls
            .iter()
            .map(|u| format!("![Generated Image]({u})"))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

struct CoalesceState {
    rx: mpsc::Receiver<AgentFrame>,
    buffer: String,
    last_flush: Instant,
    media_urls: Vec<String>,
    modality: Modality,
    model_name: String,
    identity: ChunkIdentity,
    config: RelayConfig,
    pending: VecDeque<RenderedFrame>,
    guard: Option<AbortGuard>,
    done: bool,
}

/// Builds the frame stream for a streaming chat-completions response. The
/// 500ms coalescing window is enforced without a per-request timer task by
/// polling the queue with a short timeout and re-checking elapsed time on
/// each wakeup.
pub fn render_streaming_response(
    rx: mpsc::Receiver<AgentFrame>,
    model_name: String,
    modality: Modality,
    config: RelayConfig,
    guard: AbortGuard,
) -> impl Stream<Item = Result<RenderedFrame, Infallible>> {
    let state = CoalesceState {
        rx,
        buffer: String::new(),
        last_flush: Instant::now(),
        media_urls: Vec::new(),
        modality,
        model_name,
        identity: ChunkIdentity::new(),
        config,
        pending: VecDeque::new(),
        guard: Some(guard),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        if let Some(event) = state.pending.pop_front() {
            return Some((Ok(event), state));
        }
        if state.done {
            return None;
        }

        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }

            match tokio::time::timeout(state.config.queue_poll_interval, state.rx.recv()).await {
                Ok(Some(frame)) => handle_frame(&mut state, frame),
                Ok(None) => {
                    finalize(&mut state);
                    state.done = true;
                }
                Err(_elapsed) => {
                    if matches!(state.modality, Modality::Chat)
                        && !state.buffer.is_empty()
                        && state.last_flush.elapsed() >= state.config.max_buffer_time
                    {
                        flush_buffer(&mut state);
                    }
                }
            }

            if state.done && state.pending.is_empty() {
                return None;
            }
        }
    })
}

fn handle_frame(state: &mut CoalesceState, frame: AgentFrame) {
    match frame {
        AgentFrame::Delta(text) => {
            if matches!(state.modality, Modality::Chat) {
                state.buffer.push_str(&text);
                if state.buffer.len() >= state.config.min_chunk {
                    flush_buffer(state);
                }
            }
        }
        AgentFrame::Media(items) => {
            for item in items {
                if let Some(url) = item.url.or(item.image) {
                    state.media_urls.push(url);
                }
            }
        }
        AgentFrame::Terminal { finish_reason } => {
            flush_terminal(state, &finish_reason);
        }
        AgentFrame::Done => {
            if let Some(mut guard) = state.guard.take() {
                guard.disarm();
            }
            state.pending.push_back(RenderedFrame::Done);
            state.done = true;
        }
        AgentFrame::Err(message) => {
            state
                .pending
                .push_back(RenderedFrame::Data(openai_error_body(&message)));
            state.pending.push_back(RenderedFrame::Done);
            if let Some(mut guard) = state.guard.take() {
                guard.disarm();
            }
            state.done = true;
        }
    }
}

fn flush_buffer(state: &mut CoalesceState) {
    if state.buffer.is_empty() {
        return;
    }
    let text = std::mem::take(&mut state.buffer);
    let chunk = render_delta_chunk(&state.identity, &state.model_name, &text);
    state.pending.push_back(RenderedFrame::Data(chunk));
    state.last_flush = Instant::now();
}

fn flush_terminal(state: &mut CoalesceState, finish_reason: &str) {
    match state.modality {
        Modality::Chat => {
            flush_buffer(state);
            let finish = render_finish_chunk(&state.identity, &state.model_name, finish_reason);
            state.pending.push_back(RenderedFrame::Data(finish));
        }
        Modality::Image | Modality::Video => {
            let content = media_content(state.modality, &state.media_urls);
            let chunk =
                render_media_finish_chunk(&state.identity, &state.model_name, &content, finish_reason);
            state.pending.push_back(RenderedFrame::Data(chunk));
        }
    }
}

fn finalize(state: &mut CoalesceState) {
    if matches!(state.modality, Modality::Chat) {
        flush_buffer(state);
    }
    if let Some(mut guard) = state.guard.take() {
        guard.disarm();
    }
    state.pending.push_back(RenderedFrame::Done);
}

/// Drains the queue to completion for a non-streaming request and renders
/// one `chat.completion` JSON object (or an OpenAI-shaped error body).
pub async fn render_non_streaming_response(
    mut rx: mpsc::Receiver<AgentFrame>,
    model_name: String,
    modality: Modality,
    prompt_chars: usize,
    mut guard: AbortGuard,
) -> serde_json::Value {
    let identity = ChunkIdentity::new();
    let mut buffer = String::new();
    let mut media_urls = Vec::new();

    while let Some(frame) = rx.recv().await {
        match frame {
            AgentFrame::Delta(text) => {
                if matches!(modality, Modality::Chat) {
                    buffer.push_str(&text);
                }
            }
            AgentFrame::Media(items) => {
                for item in items {
                    if let Some(url) = item.url.or(item.image) {
                        media_urls.push(url);
                    }
                }
            }
            AgentFrame::Terminal { .. } => {}
            AgentFrame::Done => {
                guard.disarm();
                break;
            }
            AgentFrame::Err(message) => {
                guard.disarm();
                return openai_error_body(&message);
            }
        }
    }

    let content = match modality {
        Modality::Chat => buffer,
        Modality::Image | Modality::Video => media_content(modality, &media_urls),
    };
    let usage = Usage::estimate(prompt_chars, content.len());
    render_completion(&identity, &model_name, &content, usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn test_config() -> RelayConfig {
        let mut cfg = RelayConfig::default();
        cfg.queue_poll_interval = std::time::Duration::from_millis(5);
        cfg.max_buffer_time = std::time::Duration::from_millis(20);
        cfg
    }

    fn noop_guard() -> AbortGuard {
        AbortGuard {
            request_id: "t".into(),
            link: Arc::new(AgentLink::new(
                Arc::new(RequestRegistry::new(1, 1)),
                Arc::new(crate::model_registry::ModelRegistry::new()),
                RelayConfig::default(),
            )),
            registry: Arc::new(RequestRegistry::new(1, 1)),
            armed: false,
        }
    }

    async fn collect_frames(rx: mpsc::Receiver<AgentFrame>, modality: Modality) -> Vec<RenderedFrame> {
        let stream = render_streaming_response(rx, "m".into(), modality, test_config(), noop_guard());
        stream.map(|f| f.unwrap()).collect::<Vec<_>>().await
    }

    #[tokio::test]
    async fn coalesces_small_deltas_and_terminates_with_done() {
        let (tx, rx) = mpsc::channel(16);
        tx.send(AgentFrame::Delta("He".into())).await.unwrap();
        tx.send(AgentFrame::Delta("llo".into())).await.unwrap();
        tx.send(AgentFrame::Delta(
            " world, this is a longer delta that exceeds the minimum.".into(),
        ))
        .await
        .unwrap();
        tx.send(AgentFrame::Terminal {
            finish_reason: "stop".into(),
        })
        .await
        .unwrap();
        tx.send(AgentFrame::Done).await.unwrap();
        drop(tx);

        let frames = collect_frames(rx, Modality::Chat).await;
        let joined_deltas: String = frames
            .iter()
            .filter_map(|f| match f {
                RenderedFrame::Data(v) => v["choices"][0]["delta"]["content"]
                    .as_str()
                    .map(String::from),
                RenderedFrame::Done => None,
            })
            .collect();
        assert_eq!(
            joined_deltas,
            "Hello world, this is a longer delta that exceeds the minimum."
        );
        assert_eq!(frames.last(), Some(&RenderedFrame::Done));
    }

    #[tokio::test]
    async fn image_modality_emits_single_markdown_chunk() {
        let (tx, rx) = mpsc::channel(16);
        tx.send(AgentFrame::Media(vec![crate::frame::MediaItem {
            image: Some("https://x/y.png".into()),
            url: None,
        }]))
        .await
        .unwrap();
        tx.send(AgentFrame::Terminal {
            finish_reason: "stop".into(),
        })
        .await
        .unwrap();
        tx.send(AgentFrame::Done).await.unwrap();
        drop(tx);

        let frames = collect_frames(rx, Modality::Image).await;
        assert!(frames.iter().any(|f| matches!(f,
            RenderedFrame::Data(v) if v["choices"][0]["delta"]["content"] == "![Generated Image](https://x/y.png)"
        )));
    }

    #[tokio::test]
    async fn error_frame_short_circuits_with_done() {
        let (tx, rx) = mpsc::channel(16);
        tx.send(AgentFrame::Err("Request timed out after 180 seconds.".into()))
            .await
            .unwrap();
        drop(tx);

        let frames = collect_frames(rx, Modality::Chat).await;
        match &frames[0] {
            RenderedFrame::Data(v) => {
                assert!(v["error"]["message"]
                    .as_str()
                    .unwrap()
                    .contains("Request timed out"));
            }
            RenderedFrame::Done => panic!("expected error data frame first"),
        }
        assert_eq!(frames[1], RenderedFrame::Done);
    }

    #[tokio::test]
    async fn non_streaming_image_collects_single_object() {
        let (tx, rx) = mpsc::channel(16);
        tx.send(AgentFrame::Media(vec![crate::frame::MediaItem {
            image: Some("https://x/y.png".into()),
            url: None,
        }]))
        .await
        .unwrap();
        tx.send(AgentFrame::Terminal {
            finish_reason: "stop".into(),
        })
        .await
        .unwrap();
        tx.send(AgentFrame::Done).await.unwrap();
        drop(tx);

        let value = render_non_streaming_response(rx, "m".into(), Modality::Image, 10, noop_guard()).await;
        assert_eq!(
            value["choices"][0]["message"]["content"],
            "![Generated Image](https://x/y.png)"
        );
    }
}
