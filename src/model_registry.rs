//! Model Registry (C6): name -> descriptor table, updated by the agent over
//! the Agent Link (`model_registry` inbound frame).

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Chat,
    Image,
    Video,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Chat => "chat",
            Modality::Image => "image",
            Modality::Video => "video",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub id: String,
    pub model_type: Modality,
}

#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, ModelDescriptor>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &str) -> Option<ModelDescriptor> {
        self.models.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<(String, ModelDescriptor)> {
        self.models
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.models.read().await.len()
    }

    /// Replaces the registry wholesale from an agent `model_registry` frame.
    /// Type is derived from the reported output capability: presence of
    /// `image` wins over `video`, which wins over the `chat` default.
    pub async fn replace_from_agent(&self, models_data: &Value) -> usize {
        let Some(map) = models_data.as_object() else {
            tracing::warn!("model_registry frame was not a JSON object; ignoring");
            return self.len().await;
        };

        let mut next = HashMap::with_capacity(map.len());
        for (public_name, info) in map {
            let Some(info) = info.as_object() else {
                continue;
            };
            let id = info
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or(public_name)
                .to_string();
            let model_type = derive_modality(info);
            next.insert(
                public_name.clone(),
                ModelDescriptor {
                    id,
                    model_type,
                },
            );
        }

        let count = next.len();
        *self.models.write().await = next;
        tracing::info!(count, "model registry updated from agent");
        count
    }
}

fn derive_modality(info: &serde_json::Map<String, Value>) -> Modality {
    let output_caps = info
        .get("capabilities")
        .and_then(Value::as_object)
        .and_then(|c| c.get("outputCapabilities"))
        .and_then(Value::as_object);

    match output_caps {
        Some(caps) if caps.contains_key("image") => Modality::Image,
        Some(caps) if caps.contains_key("video") => Modality::Video,
        _ => Modality::Chat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn derives_image_type_from_output_capabilities() {
        let registry = ModelRegistry::new();
        let data = json!({
            "image-gen": {
                "id": "abc-123",
                "capabilities": {"outputCapabilities": {"image": {}}}
            }
        });
        registry.replace_from_agent(&data).await;
        let model = registry.get("image-gen").await.unwrap();
        assert_eq!(model.model_type, Modality::Image);
        assert_eq!(model.id, "abc-123");
    }

    #[tokio::test]
    async fn defaults_to_chat_when_no_output_capabilities() {
        let registry = ModelRegistry::new();
        let data = json!({"plain-chat": {"id": "plain"}});
        registry.replace_from_agent(&data).await;
        assert_eq!(registry.get("plain-chat").await.unwrap().model_type, Modality::Chat);
    }

    #[tokio::test]
    async fn replace_is_wholesale_not_merge() {
        let registry = ModelRegistry::new();
        registry.replace_from_agent(&json!({"a": {"id": "a"}})).await;
        registry.replace_from_agent(&json!({"b": {"id": "b"}})).await;
        assert!(registry.get("a").await.is_none());
        assert!(registry.get("b").await.is_some());
    }
}
