use axum::body::Bytes;
use axum_typed_multipart::{FieldData, TryFromMultipart};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::analysis::{AnalyzeOptions, Upload};
use crate::matcher::IndexStats;
use crate::storage::ReferenceImage;

impl From<FieldData<Bytes>> for Upload {
    fn from(field: FieldData<Bytes>) -> Self {
        Upload {
            data: field.contents,
            content_type: field.metadata.content_type,
            file_name: field.metadata.file_name,
        }
    }
}

/// 分析请求参数
#[derive(TryFromMultipart)]
pub struct ClassifyRequest {
    #[form_data(limit = "unlimited")]
    pub file: FieldData<Bytes>,
    pub rich: Option<bool>,
    pub threshold: Option<f32>,
    pub top_k: Option<usize>,
    pub label: Option<String>,
}

/// 批量分析请求参数
#[derive(TryFromMultipart)]
pub struct BatchClassifyRequest {
    #[form_data(limit = "unlimited")]
    pub file: Vec<FieldData<Bytes>>,
    pub rich: Option<bool>,
    pub threshold: Option<f32>,
    pub top_k: Option<usize>,
    pub label: Option<String>,
}

macro_rules! impl_options {
    ($($ty:ty),*) => {
        $(impl $ty {
            pub fn options(&self) -> AnalyzeOptions {
                AnalyzeOptions {
                    rich: self.rich.unwrap_or(false),
                    threshold: self.threshold,
                    top_k: self.top_k,
                    label: self
                        .label
                        .as_deref()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(str::to_string),
                }
            }
        })*
    };
}

impl_options!(ClassifyRequest, BatchClassifyRequest);

/// 分析表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct ClassifyForm {
    /// 上传的图片，支持 JPEG、PNG、WebP
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub file: String,
    /// 是否请求外部模型给出详细描述
    pub rich: Option<bool>,
    /// 覆盖默认的匹配阈值
    pub threshold: Option<f32>,
    /// 覆盖默认的候选数量
    pub top_k: Option<usize>,
    /// 只与该菜品的参考图比较，没有该菜品时返回 404
    pub label: Option<String>,
}

/// 批量分析表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct BatchClassifyForm {
    /// 上传的图片，可以是多张图片
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub file: Vec<String>,
    pub rich: Option<bool>,
    pub threshold: Option<f32>,
    pub top_k: Option<usize>,
    pub label: Option<String>,
}

/// 添加参考图的请求参数
#[derive(TryFromMultipart)]
pub struct AddReferenceRequest {
    #[form_data(limit = "unlimited")]
    pub file: Vec<FieldData<Bytes>>,
    pub label: String,
    /// 逗号分隔
    pub ingredients: Option<String>,
}

impl AddReferenceRequest {
    pub fn ingredients(&self) -> Vec<String> {
        parse_ingredients(self.ingredients.as_deref().unwrap_or_default())
    }
}

/// 解析逗号分隔的配料列表
pub fn parse_ingredients(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

/// 添加参考图表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct AddReferenceForm {
    /// 参考图，可以是多张图片
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub file: Vec<String>,
    /// 菜品名称
    pub label: String,
    /// 配料，多个配料用逗号分隔
    pub ingredients: Option<String>,
}

/// 参考图概要
#[derive(Debug, Serialize, ToSchema)]
pub struct ReferenceSummary {
    pub id: String,
    pub label: String,
    pub ingredients: Vec<String>,
    pub original_name: Option<String>,
    pub content_type: String,
    pub model_version: String,
    /// 模型版本与当前不一致，不参与匹配
    pub stale: bool,
    pub created_at: DateTime<Utc>,
}

impl ReferenceSummary {
    pub fn new(reference: ReferenceImage, current_version: &str) -> Self {
        Self {
            stale: reference.embedding.model_version != current_version,
            id: reference.id,
            label: reference.label,
            ingredients: reference.ingredients,
            original_name: reference.original_name,
            content_type: reference.content_type,
            model_version: reference.embedding.model_version,
            created_at: reference.created_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AddReferenceResponse {
    pub added: Vec<ReferenceSummary>,
    /// 内容已存在而被跳过的文件名
    pub duplicates: Vec<String>,
    pub index: IndexStats,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReferenceListResponse {
    pub references: Vec<ReferenceSummary>,
    pub index: IndexStats,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeleteReferenceResponse {
    pub deleted: ReferenceSummary,
    pub index: IndexStats,
}

/// 替换某个菜品的配料
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateIngredientsRequest {
    pub ingredients: Vec<String>,
}

impl UpdateIngredientsRequest {
    /// 去掉空白与空项
    pub fn ingredients(&self) -> Vec<String> {
        self.ingredients.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).map(str::to_string).collect()
    }
}

/// 按菜品修改参考图的结果
#[derive(Debug, Serialize, ToSchema)]
pub struct LabelResponse {
    pub label: String,
    /// 受影响的参考图
    pub references: Vec<ReferenceSummary>,
    pub index: IndexStats,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// 就绪状态
#[derive(Debug, Serialize, ToSchema)]
pub struct ReadyResponse {
    pub ready: bool,
    pub model_version: String,
    pub index: IndexStats,
    pub escalation_enabled: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BannerResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub model_version: String,
    pub docs: &'static str,
    pub redoc: &'static str,
}
