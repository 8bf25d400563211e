use serde::Serialize;
use utoipa::ToSchema;

use crate::escalate::{Assessment, Description};
use crate::matcher::{Decision, MatchCandidate};
use crate::model::{ComponentScores, InferenceResult};
use crate::utils::TimeMeasure;

/// 升级分析的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    /// 不需要升级
    Skipped,
    /// 需要升级但未配置 API 密钥
    Disabled,
    Completed,
    Failed,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Disabled => "disabled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EscalationOutcome {
    pub status: EscalationStatus,
    /// 外部模型的原始回答
    pub description: Option<String>,
    pub assessment: Option<Assessment>,
    pub model: Option<String>,
    pub error: Option<String>,
}

impl EscalationOutcome {
    pub fn new(status: EscalationStatus) -> Self {
        Self { status, description: None, assessment: None, model: None, error: None }
    }

    pub fn completed(description: Description) -> Self {
        Self {
            status: EscalationStatus::Completed,
            description: Some(description.text),
            assessment: description.assessment,
            model: Some(description.model),
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self { error: Some(error.to_string()), ..Self::new(EscalationStatus::Failed) }
    }
}

/// 综合得分
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ScoreBreakdown {
    /// 最相似参考图的相似度换算到 0 ~ 100
    pub visual_score: f32,
    /// 与最相似参考图的颜色相似度，换算到 0 ~ 100
    pub color_score: Option<f32>,
    /// 与最相似参考图的结构相似度，换算到 0 ~ 100
    pub structure_score: Option<f32>,
    /// 外部模型给出的评分
    pub assessment_score: Option<u8>,
    pub final_score: f32,
    /// Excellent / Good / Needs Improvement / Poor
    pub quality_label: String,
}

impl ScoreBreakdown {
    /// 有外部评分时按 `assessment_weight` 加权，否则只使用视觉得分
    pub fn new(similarity: Option<f32>, assessment: Option<&Assessment>, assessment_weight: f32) -> Self {
        let visual_score = similarity.unwrap_or(0.0).clamp(0.0, 1.0) * 100.0;
        let assessment_score = assessment.map(|a| a.score);
        let weight = assessment_weight.clamp(0.0, 1.0);
        let final_score = match assessment_score {
            Some(score) => visual_score * (1.0 - weight) + score as f32 * weight,
            None => visual_score,
        };
        let final_score = (final_score.clamp(0.0, 100.0) * 10.0).round() / 10.0;
        Self {
            visual_score: (visual_score * 10.0).round() / 10.0,
            color_score: None,
            structure_score: None,
            assessment_score,
            final_score,
            quality_label: quality_label(final_score).to_string(),
        }
    }
}

fn to_percent(similarity: f32) -> f32 {
    (similarity.clamp(0.0, 1.0) * 1000.0).round() / 10.0
}

impl ScoreBreakdown {
    /// 附加颜色与结构两部分的得分，不影响最终得分
    pub fn with_components(mut self, components: Option<ComponentScores>) -> Self {
        self.color_score = components.map(|c| to_percent(c.color));
        self.structure_score = components.map(|c| to_percent(c.structure));
        self
    }
}

pub fn quality_label(score: f32) -> &'static str {
    if score >= 85.0 {
        "Excellent"
    } else if score >= 70.0 {
        "Good"
    } else if score >= 50.0 {
        "Needs Improvement"
    } else {
        "Poor"
    }
}

/// 各阶段耗时，单位为毫秒
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct Latency {
    pub validate_ms: f64,
    pub store_ms: f64,
    pub inference_ms: f64,
    pub match_ms: f64,
    pub escalation_ms: f64,
    pub total_ms: f64,
}

impl From<&TimeMeasure> for Latency {
    fn from(tm: &TimeMeasure) -> Self {
        let ms = |stage| tm.get(stage).as_secs_f64() * 1000.0;
        Self {
            validate_ms: ms("validate"),
            store_ms: ms("store"),
            inference_ms: ms("inference"),
            match_ms: ms("match"),
            escalation_ms: ms("escalation"),
            total_ms: tm.total().as_secs_f64() * 1000.0,
        }
    }
}

/// 单张图片的分析结果
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AnalysisResponse {
    /// 最终标签：匹配成功时为参考图标签，否则为模型预测
    pub label: Option<String>,
    /// 本地模型给出的置信度
    pub confidence: f32,
    pub decision: Decision,
    pub similarity: Option<f32>,
    pub prediction: InferenceResult,
    pub matched_reference: Option<MatchCandidate>,
    pub candidates: Vec<MatchCandidate>,
    pub escalation: EscalationOutcome,
    /// 升级分析失败，结果只包含本地分析
    pub escalation_failed: bool,
    pub score: ScoreBreakdown,
    pub latency: Latency,
    pub file_name: Option<String>,
}

/// 批量分析中单张图片的结果
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BatchItem {
    pub index: usize,
    pub file_name: Option<String>,
    pub result: Option<AnalysisResponse>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BatchResponse {
    pub count: usize,
    pub successful: usize,
    /// 成功结果的平均最终得分
    pub average_score: f32,
    pub results: Vec<BatchItem>,
}

impl BatchResponse {
    pub fn new(results: Vec<BatchItem>) -> Self {
        let scores = results
            .iter()
            .filter_map(|item| item.result.as_ref())
            .map(|r| r.score.final_score)
            .collect::<Vec<_>>();
        let average_score = match scores.len() {
            0 => 0.0,
            n => (scores.iter().sum::<f32>() / n as f32 * 10.0).round() / 10.0,
        };
        Self { count: results.len(), successful: scores.len(), average_score, results }
    }
}
