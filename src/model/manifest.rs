use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use super::features::{FeatureParams, l2_normalize};
use super::ModelError;
use crate::storage::ReferenceImage;
use crate::utils::write_atomic;

/// 当前支持的模型清单格式
pub const MANIFEST_FORMAT: &str = "foodvision-features/v1";

fn default_temperature() -> f32 {
    10.0
}

/// 类别原型，即同一标签下所有参考图嵌入向量的均值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassPrototype {
    pub label: String,
    pub prototype: Vec<f32>,
    #[serde(default)]
    pub samples: usize,
}

/// 模型清单文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifest {
    pub format: String,
    pub name: String,
    #[serde(default)]
    pub features: FeatureParams,
    /// softmax 温度
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub classes: Vec<ClassPrototype>,
}

impl ModelManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            format: MANIFEST_FORMAT.to_string(),
            name: name.into(),
            features: FeatureParams::default(),
            temperature: default_temperature(),
            classes: vec![],
        }
    }

    /// 读取清单，文件不存在或格式无法识别时返回 [`ModelError::Load`]
    pub fn read(path: &Path) -> Result<Self, ModelError> {
        let load_err = |reason: String| ModelError::Load { path: path.to_path_buf(), reason };

        if !path.is_file() {
            return Err(load_err("模型文件不存在".to_string()));
        }
        let data = fs::read(path).map_err(|e| load_err(e.to_string()))?;
        let manifest: ModelManifest = serde_json::from_slice(&data)
            .map_err(|e| load_err(format!("无法识别的模型格式: {e}")))?;
        if manifest.format != MANIFEST_FORMAT {
            return Err(load_err(format!("无法识别的模型格式: {}", manifest.format)));
        }
        manifest.features.validate().map_err(load_err)?;
        if !manifest.temperature.is_finite() || manifest.temperature <= 0.0 {
            return Err(load_err(format!("无效的温度: {}", manifest.temperature)));
        }
        Ok(manifest)
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &data)
    }

    /// 用参考图重新计算类别原型，返回被跳过的参考图数量
    ///
    /// 只使用与 `model_version` 一致的嵌入向量
    pub fn train_prototypes<'a>(
        &mut self,
        references: impl IntoIterator<Item = &'a ReferenceImage>,
        model_version: &str,
    ) -> usize {
        let dim = self.features.dimension();
        let mut sums: BTreeMap<&str, (Array1<f32>, usize)> = BTreeMap::new();
        let mut skipped = 0;

        for reference in references {
            let embedding = &reference.embedding;
            if embedding.model_version != model_version || embedding.values.len() != dim {
                skipped += 1;
                continue;
            }
            let entry = sums.entry(&reference.label).or_insert_with(|| (Array1::zeros(dim), 0));
            entry.0 += &Array1::from_vec(embedding.values.clone());
            entry.1 += 1;
        }

        self.classes = sums
            .into_iter()
            .map(|(label, (mut sum, samples))| {
                l2_normalize(&mut sum);
                ClassPrototype { label: label.to_string(), prototype: sum.to_vec(), samples }
            })
            .collect();

        skipped
    }
}
