use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::{Description, EscalationError, EscalationRequest, Escalator, ImagePart};
use crate::config::EscalationOptions;

const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    /// 第一次失败后到重试前的等待时间
    pub backoff: Duration,
}

impl AnthropicConfig {
    /// 未配置 API 密钥时返回 `None`
    pub fn from_options(opts: &EscalationOptions) -> Option<Self> {
        Some(Self {
            api_key: opts.api_key()?.to_string(),
            base_url: opts.anthropic_url.trim_end_matches('/').to_string(),
            model: opts.anthropic_model.clone(),
            max_tokens: opts.max_tokens,
            timeout: Duration::from_secs(opts.escalation_timeout),
            backoff: Duration::from_millis(opts.escalation_backoff),
        })
    }
}

/// Anthropic Messages API
pub struct AnthropicEscalator {
    config: AnthropicConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [Message; 1],
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

impl ContentBlock {
    fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    fn image(image: &ImagePart) -> Self {
        Self::Image {
            source: ImageSource {
                kind: "base64",
                media_type: image.content_type.clone(),
                data: STANDARD.encode(&image.data),
            },
        }
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

fn build_prompt(request: &EscalationRequest) -> String {
    let dish = request
        .matched_label
        .as_deref()
        .or(request.local_label.as_deref())
        .unwrap_or("unknown");
    let ingredients = if request.ingredients.is_empty() {
        "not specified".to_string()
    } else {
        request.ingredients.join(", ")
    };
    let local = request.local_label.as_deref().unwrap_or("none");
    let task = if request.reference.is_some() {
        "Compare the IMAGE TO EVALUATE against the REFERENCE IMAGE above."
    } else {
        "Identify the dish and analyze the image against the expected ingredients listed."
    };

    format!(
        r#"You are a professional food quality inspector analyzing a prepared dish.

Dish name: {dish}
Local classifier prediction: {local}
Expected ingredients/components: {ingredients}

{task}

Respond ONLY with a raw JSON object, no markdown:

{{
  "score": <integer 0-100>,
  "missing_ingredients": [<list of absent ingredients>],
  "issues_found": [<list of problems with presentation, color, portion>],
  "correct_elements": [<list of things that look right>],
  "overall_assessment": "<one sentence summary>",
  "confidence": "<high|medium|low>"
}}"#
    )
}

impl AnthropicEscalator {
    pub fn new(config: AnthropicConfig) -> Result<Self, EscalationError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EscalationError::Network(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn content(request: &EscalationRequest) -> Vec<ContentBlock> {
        let mut content = vec![];
        if let Some(reference) = &request.reference {
            content.push(ContentBlock::text("REFERENCE IMAGE (how the dish should look):"));
            content.push(ContentBlock::image(reference));
        }
        content.push(ContentBlock::text("IMAGE TO EVALUATE:"));
        content.push(ContentBlock::image(&request.image));
        content.push(ContentBlock::text(build_prompt(request)));
        content
    }

    async fn send(&self, body: &MessagesRequest<'_>) -> Result<String, EscalationError> {
        let url = format!("{}/v1/messages", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EscalationError::Timeout(self.config.timeout)
                } else {
                    EscalationError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EscalationError::Status { status: status.as_u16(), body });
        }

        let response: MessagesResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                EscalationError::Timeout(self.config.timeout)
            } else {
                EscalationError::InvalidResponse(e.to_string())
            }
        })?;

        let text = response
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("\n");
        if text.trim().is_empty() {
            return Err(EscalationError::InvalidResponse("回答中没有文本内容".to_string()));
        }
        Ok(text)
    }
}

#[async_trait]
impl Escalator for AnthropicEscalator {
    /// 网络错误、429 与 5xx 会在等待后重试一次，两次请求共用 `timeout`
    async fn describe(&self, request: &EscalationRequest) -> Result<Description, EscalationError> {
        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            messages: [Message { role: "user", content: Self::content(request) }],
        };

        // 重试也计入同一个超时时间
        let attempts = async {
            match self.send(&body).await {
                Err(e) if e.is_transient() => {
                    warn!("升级请求失败，{:?} 后重试: {}", self.config.backoff, e);
                    tokio::time::sleep(self.config.backoff).await;
                    self.send(&body).await
                }
                result => result,
            }
        };
        let text = tokio::time::timeout(self.config.timeout, attempts)
            .await
            .map_err(|_| EscalationError::Timeout(self.config.timeout))??;
        debug!("升级分析回答: {text}");

        Ok(Description::parse(text, &self.config.model))
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}
