use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::warn;
use ndarray::{Array1, Array2};
use serde::Serialize;
use utoipa::ToSchema;

use crate::model::features::l2_normalize;
use crate::model::{Embedding, ModelError};
use crate::storage::ReferenceImage;

/// 匹配结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Matched,
    NoMatch,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Matched => "matched",
            Decision::NoMatch => "no_match",
        }
    }
}

/// 候选参考图
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MatchCandidate {
    pub id: String,
    pub label: String,
    /// 余弦相似度，范围 [-1, 1]
    pub similarity: f32,
    pub ingredients: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub path: PathBuf,
    /// 归一化后的嵌入向量
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

/// 一次匹配的结果
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MatchResult {
    /// 相似度最高的参考图，索引为空时为空
    pub best: Option<MatchCandidate>,
    pub similarity: Option<f32>,
    pub decision: Decision,
    /// 按相似度从高到低排列的前 K 个候选
    pub candidates: Vec<MatchCandidate>,
}

impl MatchResult {
    pub fn is_matched(&self) -> bool {
        self.decision == Decision::Matched
    }

    /// 判定为匹配的参考图
    pub fn matched(&self) -> Option<&MatchCandidate> {
        self.best.as_ref().filter(|_| self.is_matched())
    }
}

/// 索引统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct IndexStats {
    /// 已索引的参考图数量
    pub indexed: usize,
    /// 因模型版本或维数不一致而被排除的参考图数量
    pub stale: usize,
    /// 因数据损坏被跳过的参考图数量
    pub corrupt: usize,
    /// 不同标签的数量
    pub labels: usize,
}

#[derive(Debug)]
struct Entry {
    id: String,
    label: String,
    ingredients: Vec<String>,
    created_at: DateTime<Utc>,
    path: PathBuf,
}

/// 平坦索引：每行一个已归一化的参考图嵌入向量
///
/// 行按创建时间升序排列，相似度相同时较早的参考图排在前面
#[derive(Debug)]
pub struct ReferenceIndex {
    model_version: String,
    dimension: Option<usize>,
    entries: Vec<Entry>,
    matrix: Array2<f32>,
    stats: IndexStats,
}

impl ReferenceIndex {
    pub fn empty(model_version: impl Into<String>) -> Self {
        Self {
            model_version: model_version.into(),
            dimension: None,
            entries: vec![],
            matrix: Array2::zeros((0, 0)),
            stats: IndexStats::default(),
        }
    }

    /// 构建索引，模型版本不同的参考图会被排除并计入 `stale`
    pub fn build(
        model_version: &str,
        references: impl IntoIterator<Item = ReferenceImage>,
    ) -> Self {
        let mut stale = 0;
        let mut dimension = None;
        let mut accepted = vec![];

        for reference in references {
            let embedding = &reference.embedding;
            if embedding.model_version != model_version {
                warn!(
                    "参考图 {} 的模型版本为 {}，当前为 {}，已排除",
                    reference.id, embedding.model_version, model_version
                );
                stale += 1;
                continue;
            }
            let dim = *dimension.get_or_insert(embedding.values.len());
            if embedding.values.len() != dim {
                warn!("参考图 {} 的嵌入维数为 {}，应为 {}", reference.id, embedding.values.len(), dim);
                stale += 1;
                continue;
            }
            accepted.push(reference);
        }

        accepted.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let dim = dimension.unwrap_or(0);
        let mut matrix = Array2::zeros((accepted.len(), dim));
        let mut entries = Vec::with_capacity(accepted.len());
        for (i, reference) in accepted.into_iter().enumerate() {
            let mut row = Array1::from_vec(reference.embedding.values);
            l2_normalize(&mut row);
            matrix.row_mut(i).assign(&row);
            entries.push(Entry {
                id: reference.id,
                label: reference.label,
                ingredients: reference.ingredients,
                created_at: reference.created_at,
                path: reference.path,
            });
        }

        let labels = entries.iter().map(|e| e.label.as_str()).collect::<HashSet<_>>().len();
        let stats = IndexStats { indexed: entries.len(), stale, corrupt: 0, labels };

        Self { model_version: model_version.to_string(), dimension, entries, matrix, stats }
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> IndexStats {
        self.stats
    }

    pub(super) fn set_corrupt(&mut self, corrupt: usize) {
        self.stats.corrupt = corrupt;
    }

    /// 索引中是否有该类别的参考图
    pub fn has_label(&self, label: &str) -> bool {
        self.entries.iter().any(|e| e.label == label)
    }

    /// 计算与所有参考图的余弦相似度，最高分低于 `threshold` 时结论为不匹配
    pub fn search(
        &self,
        embedding: &Embedding,
        top_k: usize,
        threshold: f32,
    ) -> Result<MatchResult, ModelError> {
        self.search_where(embedding, top_k, threshold, |_| true)
    }

    /// 只与某个类别的参考图比较，索引中没有该类别时返回 `None`
    pub fn search_label(
        &self,
        embedding: &Embedding,
        label: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<Option<MatchResult>, ModelError> {
        if !self.has_label(label) {
            return Ok(None);
        }
        self.search_where(embedding, top_k, threshold, |e| e.label == label).map(Some)
    }

    fn search_where(
        &self,
        embedding: &Embedding,
        top_k: usize,
        threshold: f32,
        keep: impl Fn(&Entry) -> bool,
    ) -> Result<MatchResult, ModelError> {
        if embedding.model_version != self.model_version {
            return Err(ModelError::VersionMismatch {
                expected: self.model_version.clone(),
                found: embedding.model_version.clone(),
            });
        }
        if self.is_empty() {
            return Ok(MatchResult {
                best: None,
                similarity: None,
                decision: Decision::NoMatch,
                candidates: vec![],
            });
        }
        if Some(embedding.values.len()) != self.dimension {
            return Err(ModelError::VersionMismatch {
                expected: format!("{} ({:?} 维)", self.model_version, self.dimension),
                found: format!("{} ({} 维)", embedding.model_version, embedding.values.len()),
            });
        }

        let mut query = Array1::from_vec(embedding.values.clone());
        l2_normalize(&mut query);
        let scores = self.matrix.dot(&query).mapv(|s| if s.is_nan() { -1.0 } else { s.clamp(-1.0, 1.0) });

        let mut order = (0..self.entries.len()).filter(|&i| keep(&self.entries[i])).collect::<Vec<_>>();
        order.sort_by(|&a, &b| match scores[b].total_cmp(&scores[a]) {
            Ordering::Equal => a.cmp(&b),
            other => other,
        });

        let candidates = order
            .into_iter()
            .take(top_k.max(1))
            .map(|i| {
                let entry = &self.entries[i];
                MatchCandidate {
                    id: entry.id.clone(),
                    label: entry.label.clone(),
                    similarity: scores[i],
                    ingredients: entry.ingredients.clone(),
                    created_at: entry.created_at,
                    path: entry.path.clone(),
                    embedding: self.matrix.row(i).to_vec(),
                }
            })
            .collect::<Vec<_>>();

        let best = candidates.first().cloned();
        let similarity = best.as_ref().map(|b| b.similarity);
        let decision = match similarity {
            Some(s) if s >= threshold => Decision::Matched,
            _ => Decision::NoMatch,
        };

        Ok(MatchResult { best, similarity, decision, candidates })
    }
}
