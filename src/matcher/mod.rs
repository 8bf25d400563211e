//! 参考图匹配
//!
//! 新索引在锁外完整构建，再整体替换当前索引。
//! 正在进行的匹配持有旧索引的 `Arc`，不会看到构建到一半的索引。

mod index;

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use log::info;
use tokio::task::spawn_blocking;

pub use self::index::*;
use crate::model::{Embedding, ModelError};
use crate::storage::{ReferenceImage, StorageError, StorageManager};

pub struct Matcher {
    model_version: String,
    current: RwLock<Arc<ReferenceIndex>>,
    /// 同一时间只允许一个刷新任务
    refresh_lock: Mutex<()>,
}

impl Matcher {
    pub fn new(model_version: impl Into<String>) -> Self {
        let model_version = model_version.into();
        Self {
            current: RwLock::new(Arc::new(ReferenceIndex::empty(model_version.clone()))),
            model_version,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    /// 当前索引的快照
    pub fn snapshot(&self) -> Arc<ReferenceIndex> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// 用给定的参考图构建新索引并替换当前索引
    pub fn build_index(&self, references: impl IntoIterator<Item = ReferenceImage>) -> IndexStats {
        let index = ReferenceIndex::build(&self.model_version, references);
        self.swap(index)
    }

    fn swap(&self, index: ReferenceIndex) -> IndexStats {
        let stats = index.stats();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(index);
        info!(
            "索引已更新：{} 张参考图，{} 个标签，排除 {} 张，损坏 {} 张",
            stats.indexed, stats.labels, stats.stale, stats.corrupt
        );
        stats
    }

    /// 在当前索引中查找最相似的参考图
    pub fn match_embedding(
        &self,
        embedding: &Embedding,
        top_k: usize,
        threshold: f32,
    ) -> Result<MatchResult, ModelError> {
        self.snapshot().search(embedding, top_k, threshold)
    }

    /// 只在某个类别的参考图中查找，没有该类别时返回 `None`
    pub fn match_label(
        &self,
        embedding: &Embedding,
        label: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<Option<MatchResult>, ModelError> {
        self.snapshot().search_label(embedding, label, top_k, threshold)
    }

    /// 从存储重新加载参考图并重建索引
    pub fn refresh(&self, storage: &StorageManager) -> Result<IndexStats, StorageError> {
        let _lock = self.refresh_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut references = storage.load_all_references()?;
        let mut index = ReferenceIndex::build(&self.model_version, references.by_ref());
        index.set_corrupt(references.skipped());
        Ok(self.swap(index))
    }

    /// 在阻塞线程池中刷新索引
    pub async fn refresh_in_background(
        self: &Arc<Self>,
        storage: Arc<StorageManager>,
    ) -> anyhow::Result<IndexStats> {
        let matcher = self.clone();
        Ok(spawn_blocking(move || matcher.refresh(&storage)).await??)
    }
}
