//! 调用外部视觉语言模型做进一步分析

mod anthropic;

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

pub use self::anthropic::*;
use crate::matcher::MatchResult;
use crate::model::InferenceResult;

#[derive(Debug, Error)]
pub enum EscalationError {
    #[error("网络错误: {0}")]
    Network(String),
    #[error("请求超时（{0:?}）")]
    Timeout(Duration),
    #[error("服务返回 {status}: {body}")]
    Status { status: u16, body: String },
    #[error("无法解析响应: {0}")]
    InvalidResponse(String),
}

impl EscalationError {
    /// 是否值得重试
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Timeout(_) | Self::InvalidResponse(_) => false,
        }
    }
}

/// 附带的图片
#[derive(Debug, Clone)]
pub struct ImagePart {
    pub data: Vec<u8>,
    pub content_type: String,
}

/// 一次升级分析的输入
#[derive(Debug, Clone)]
pub struct EscalationRequest {
    /// 待分析的图片
    pub image: ImagePart,
    /// 匹配到的参考图，用于对比
    pub reference: Option<ImagePart>,
    /// 本地模型给出的类别
    pub local_label: Option<String>,
    /// 匹配到的参考图标签
    pub matched_label: Option<String>,
    /// 匹配到的参考图应包含的配料
    pub ingredients: Vec<String>,
}

/// 结构化的评估结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Assessment {
    /// 0 ~ 100
    #[serde(alias = "claude_score", deserialize_with = "deserialize_score")]
    pub score: u8,
    #[serde(default)]
    pub missing_ingredients: Vec<String>,
    #[serde(default)]
    pub issues_found: Vec<String>,
    #[serde(default)]
    pub correct_elements: Vec<String>,
    #[serde(default)]
    pub overall_assessment: String,
    /// high / medium / low
    #[serde(default = "default_confidence")]
    pub confidence: String,
}

fn default_confidence() -> String {
    "medium".to_string()
}

fn deserialize_score<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    let score = f64::deserialize(deserializer)?;
    Ok(score.round().clamp(0.0, 100.0) as u8)
}

/// 外部模型的回答
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Description {
    /// 原始文本
    pub text: String,
    /// 回答是合法 JSON 时解析出的评估
    pub assessment: Option<Assessment>,
    pub model: String,
}

impl Description {
    /// 解析回答文本，非 JSON 内容原样保留
    pub fn parse(text: impl Into<String>, model: impl Into<String>) -> Self {
        let text = text.into();
        let assessment = serde_json::from_str(strip_code_fence(&text)).ok();
        Self { text, assessment, model: model.into() }
    }
}

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[a-zA-Z]*\s*(.*?)\s*```\s*$").expect("invalid regex")
});

/// 去掉包裹回答的 markdown 代码块
pub fn strip_code_fence(text: &str) -> &str {
    match CODE_FENCE.captures(text).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => text.trim(),
    }
}

#[async_trait]
pub trait Escalator: Send + Sync {
    /// 请求外部模型描述图片
    async fn describe(&self, request: &EscalationRequest) -> Result<Description, EscalationError>;

    /// 使用的模型名称
    fn model_name(&self) -> &str;
}

/// 决定是否升级
#[derive(Debug, Clone, Copy)]
pub struct EscalationPolicy {
    /// 有效置信度低于该值时升级
    pub confidence_threshold: f32,
    pub always: bool,
}

impl EscalationPolicy {
    /// 本地模型置信度与匹配相似度中的较大者
    pub fn effective_confidence(inference: &InferenceResult, matched: &MatchResult) -> f32 {
        let similarity = matched.matched().map(|m| m.similarity).unwrap_or(0.0);
        inference.confidence.max(similarity).clamp(0.0, 1.0)
    }

    /// 置信度只有在本地给出了结论（模型类别或匹配结果）时才参与判断
    pub fn should_escalate(
        &self,
        inference: &InferenceResult,
        matched: &MatchResult,
        rich_requested: bool,
    ) -> bool {
        if self.always || rich_requested {
            return true;
        }
        let has_prediction = inference.label.is_some() || matched.is_matched();
        has_prediction && Self::effective_confidence(inference, matched) < self.confidence_threshold
    }
}
