mod add;
mod purge;
mod search;
mod server;
mod show;
mod train;

use std::sync::Arc;

use anyhow::Context;
pub use add::*;
use log::info;
pub use purge::*;
pub use search::*;
pub use server::*;
pub use show::*;
pub use train::*;

use crate::config::{ModelOptions, Opts};
use crate::matcher::Matcher;
use crate::model::FeatureModel;
use crate::storage::StorageManager;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// 打开存储目录，不存在时创建
pub fn open_storage(opts: &Opts) -> anyhow::Result<Arc<StorageManager>> {
    let layout = opts.layout();
    let storage = StorageManager::open(&layout, opts.storage.retention())?;
    Ok(Arc::new(storage))
}

/// 加载模型，失败时提示如何创建模型清单
pub fn load_model(opts: &Opts, model: &ModelOptions) -> anyhow::Result<Arc<FeatureModel>> {
    let path = opts.layout().model_manifest(&model.model);
    let model = FeatureModel::load(&path).with_context(|| {
        format!("无法加载模型，可以使用 `foodvision train --init --model {}` 创建", model.model)
    })?;
    Ok(Arc::new(model))
}

/// 加载参考图并构建索引
pub async fn build_matcher(
    model: &FeatureModel,
    storage: Arc<StorageManager>,
) -> anyhow::Result<Arc<Matcher>> {
    let matcher = Arc::new(Matcher::new(model.version()));
    let stats = matcher.refresh_in_background(storage).await?;
    info!("已加载 {} 张参考图", stats.indexed);
    Ok(matcher)
}
