//! 本地视觉模型
//!
//! 模型在进程启动时加载一次，之后只读，可在多个线程中并发推理。

pub mod features;
mod manifest;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::spawn_blocking;
use utoipa::ToSchema;

pub use self::features::{ComponentScores, FeatureParams};
pub use self::manifest::*;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("加载模型失败 {path}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("无法解码图片: {0}")]
    InvalidImage(String),
    #[error("推理超时（{0:?}）")]
    InferenceTimeout(Duration),
    #[error("模型版本不一致：索引为 {expected}，查询为 {found}")]
    VersionMismatch { expected: String, found: String },
    #[error("推理任务异常退出: {0}")]
    Worker(String),
}

/// 嵌入向量及计算它的模型版本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    pub model_version: String,
}

/// 单张图片的推理结果
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct InferenceResult {
    /// 对应的临时上传文件 ID
    pub artifact_id: Option<String>,
    #[serde(skip)]
    pub embedding: Embedding,
    /// 最接近的类别，模型没有类别原型时为空
    pub label: Option<String>,
    /// 0 ~ 1
    pub confidence: f32,
    pub model_version: String,
}

/// 基于颜色直方图与亮度结构的特征模型
#[derive(Debug)]
pub struct FeatureModel {
    name: String,
    version: String,
    path: PathBuf,
    params: FeatureParams,
    temperature: f32,
    labels: Vec<String>,
    /// 每行一个已归一化的类别原型
    prototypes: Array2<f32>,
}

impl FeatureModel {
    /// 从清单文件加载模型
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let manifest = ModelManifest::read(path)?;
        let model = Self::from_manifest(manifest, path)?;
        info!(
            "模型加载完成: {}（{} 维，{} 个类别）",
            model.version,
            model.dimension(),
            model.labels.len()
        );
        Ok(model)
    }

    pub fn from_manifest(manifest: ModelManifest, path: &Path) -> Result<Self, ModelError> {
        let dim = manifest.features.dimension();
        let mut labels = Vec::with_capacity(manifest.classes.len());
        let mut prototypes = Array2::zeros((manifest.classes.len(), dim));

        for (i, class) in manifest.classes.iter().enumerate() {
            if class.prototype.len() != dim {
                return Err(ModelError::Load {
                    path: path.to_path_buf(),
                    reason: format!(
                        "类别 {} 的原型维数为 {}，应为 {}",
                        class.label,
                        class.prototype.len(),
                        dim
                    ),
                });
            }
            let mut row = Array1::from_vec(class.prototype.clone());
            features::l2_normalize(&mut row);
            prototypes.row_mut(i).assign(&row);
            labels.push(class.label.clone());
        }

        Ok(Self {
            version: model_version(&manifest.name, &manifest.features),
            name: manifest.name,
            path: path.to_path_buf(),
            params: manifest.features,
            temperature: manifest.temperature,
            labels,
            prototypes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dimension(&self) -> usize {
        self.params.dimension()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// 计算图片的嵌入向量
    pub fn embed(&self, data: &[u8]) -> Result<Embedding, ModelError> {
        let img = features::decode(data).map_err(|e| ModelError::InvalidImage(e.to_string()))?;
        let values = features::extract(&img, &self.params);
        Ok(Embedding { values, model_version: self.version.clone() })
    }

    /// 分别比较颜色与结构特征
    pub fn component_scores(&self, query: &[f32], reference: &[f32]) -> Option<ComponentScores> {
        features::component_similarity(query, reference, &self.params)
    }

    /// 推理，对相同输入总是返回相同结果
    pub fn infer(&self, data: &[u8]) -> Result<InferenceResult, ModelError> {
        let embedding = self.embed(data)?;
        let (label, confidence) = self.classify(&embedding.values);
        debug!("推理结果: {:?} ({:.3})", label, confidence);
        Ok(InferenceResult {
            artifact_id: None,
            model_version: embedding.model_version.clone(),
            embedding,
            label,
            confidence,
        })
    }

    /// 在阻塞线程池中推理，超过 `deadline` 返回 [`ModelError::InferenceTimeout`]
    pub async fn infer_with_deadline<D>(
        self: &Arc<Self>,
        data: D,
        deadline: Duration,
    ) -> Result<InferenceResult, ModelError>
    where
        D: AsRef<[u8]> + Send + 'static,
    {
        let model = self.clone();
        let task = spawn_blocking(move || model.infer(data.as_ref()));
        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ModelError::Worker(e.to_string())),
            Err(_) => Err(ModelError::InferenceTimeout(deadline)),
        }
    }

    /// 最近类别原型的 softmax 概率乘以其余弦相似度
    fn classify(&self, embedding: &[f32]) -> (Option<String>, f32) {
        if self.labels.is_empty() {
            return (None, 0.0);
        }
        let query = Array1::from_vec(embedding.to_vec());
        let cosines = self.prototypes.dot(&query);

        let (best, best_cos) = cosines
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |acc, (i, c)| if c > acc.1 { (i, c) } else { acc });

        let exps = cosines.mapv(|c| ((c - best_cos) * self.temperature).exp());
        let p_best = 1.0 / exps.sum();
        let confidence = (p_best * best_cos.max(0.0)).clamp(0.0, 1.0);

        (Some(self.labels[best].clone()), confidence)
    }
}

/// 模型版本由名称与特征参数决定，类别原型不影响嵌入向量因此不参与计算
pub fn model_version(name: &str, params: &FeatureParams) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(MANIFEST_FORMAT.as_bytes());
    hasher.update(&serde_json::to_vec(params).unwrap_or_default());
    let hash = hasher.finalize().to_hex();
    format!("{}@{}", name, &hash[..12])
}
