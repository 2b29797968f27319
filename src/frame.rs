//! The inbound agent-frame tagged union. Parsed once at the Agent Link
//! boundary; nothing downstream re-parses the wire form.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum AgentFrame {
    /// `a0` — incremental text delta.
    Delta(String),
    /// `a2` — media descriptor list (image/video model types).
    Media(Vec<MediaItem>),
    /// `ad` — terminal metadata.
    Terminal { finish_reason: String },
    /// `[DONE]` sentinel.
    Done,
    /// Agent-reported terminal failure, or a synthetic disconnect/timeout
    /// error enqueued by the Lifecycle Coordinator.
    Err(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MediaItem {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Deserialize)]
struct FinishPayload {
    #[serde(rename = "finishReason", default = "default_finish_reason")]
    finish_reason: String,
}

fn default_finish_reason() -> String {
    "stop".to_string()
}

/// Parses one `data` value carried by a `{request_id, data}` inbound
/// message. Returns `None` when the value should be silently dropped:
/// unknown-id routing is handled by the caller, while malformed or
/// unrecognized payload shapes are dropped here.
pub fn parse_frame(data: &Value) -> Option<AgentFrame> {
    match data {
        Value::String(s) => parse_tagged_string(s),
        Value::Object(map) if map.contains_key("error") => {
            let message = map
                .get("error")
                .map(error_value_to_message)
                .unwrap_or_else(|| "unknown error".to_string());
            Some(AgentFrame::Err(message))
        }
        _ => None,
    }
}

fn error_value_to_message(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_tagged_string(s: &str) -> Option<AgentFrame> {
    if s == "[DONE]" {
        return Some(AgentFrame::Done);
    }

    let (tag, body) = s.split_once(':')?;
    match tag {
        "a0" => serde_json::from_str::<String>(body)
            .ok()
            .map(AgentFrame::Delta),
        "a2" => serde_json::from_str::<Vec<MediaItem>>(body)
            .ok()
            .map(AgentFrame::Media),
        "ad" => serde_json::from_str::<FinishPayload>(body)
            .ok()
            .map(|p| AgentFrame::Terminal {
                finish_reason: p.finish_reason,
            }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_delta() {
        let v = Value::String("a0:\"Hello\"".to_string());
        assert_eq!(parse_frame(&v), Some(AgentFrame::Delta("Hello".into())));
    }

    #[test]
    fn parses_done_sentinel() {
        let v = Value::String("[DONE]".to_string());
        assert_eq!(parse_frame(&v), Some(AgentFrame::Done));
    }

    #[test]
    fn parses_terminal_with_default_reason() {
        let v = Value::String("ad:{}".to_string());
        assert_eq!(
            parse_frame(&v),
            Some(AgentFrame::Terminal {
                finish_reason: "stop".into()
            })
        );
    }

    #[test]
    fn parses_terminal_with_explicit_reason() {
        let v = Value::String(r#"ad:{"finishReason":"length"}"#.to_string());
        assert_eq!(
            parse_frame(&v),
            Some(AgentFrame::Terminal {
                finish_reason: "length".into()
            })
        );
    }

    #[test]
    fn parses_media_list() {
        let v = Value::String(r#"a2:[{"image":"https://x/y.png"}]"#.to_string());
        assert_eq!(
            parse_frame(&v),
            Some(AgentFrame::Media(vec![MediaItem {
                image: Some("https://x/y.png".into()),
                url: None,
            }]))
        );
    }

    #[test]
    fn parses_error_object() {
        let v = serde_json::json!({"error": "browser disconnected"});
        assert_eq!(
            parse_frame(&v),
            Some(AgentFrame::Err("browser disconnected".into()))
        );
    }

    #[test]
    fn unrecognized_tag_is_dropped() {
        let v = Value::String("zz:whatever".to_string());
        assert_eq!(parse_frame(&v), None);
    }

    #[test]
    fn malformed_json_body_is_dropped() {
        let v = Value::String("a0:not-json".to_string());
        assert_eq!(parse_frame(&v), None);
    }
}
