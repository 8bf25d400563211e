use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{info, warn};
use tokio::task::spawn_blocking;

use crate::cli::{SubCommandExtend, open_storage};
use crate::model::{FeatureModel, ModelManifest};
use crate::Opts;

#[derive(Parser, Debug, Clone)]
pub struct TrainCommand {
    /// 模型名称
    #[arg(long, value_name = "NAME", default_value = "food-features")]
    pub model: String,
    /// 创建一个没有类别原型的新模型
    #[arg(long)]
    pub init: bool,
    /// 与 `--init` 一起使用，覆盖已存在的模型
    #[arg(long, requires = "init")]
    pub force: bool,
    /// softmax 温度，越大置信度越集中
    #[arg(long)]
    pub temperature: Option<f32>,
}

impl SubCommandExtend for TrainCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        if let Some(t) = self.temperature {
            if !t.is_finite() || t <= 0.0 {
                bail!("温度必须为正数: {t}");
            }
        }
        let path = opts.layout().model_manifest(&self.model);

        if self.init {
            if path.exists() && !self.force {
                bail!("模型已存在: {}，使用 --force 覆盖", path.display());
            }
            let mut manifest = ModelManifest::new(&self.model);
            if let Some(t) = self.temperature {
                manifest.temperature = t;
            }
            manifest.write(&path).with_context(|| format!("无法写入模型: {}", path.display()))?;
            let model = FeatureModel::load(&path)?;
            info!("已创建模型 {}，版本 {}", model.name(), model.version());
            println!("{}", model.version());
            return Ok(());
        }

        let storage = open_storage(opts)?;
        let model = FeatureModel::load(&path)
            .context("模型不存在，请先使用 `foodvision train --init` 创建")?;
        let version = model.version().to_string();
        let temperature = self.temperature;

        let (manifest, count, skipped) = spawn_blocking(move || -> Result<_> {
            let mut manifest = ModelManifest::read(&path)?;
            if let Some(t) = temperature {
                manifest.temperature = t;
            }
            let references = storage.load_all_references()?.collect::<Vec<_>>();
            let skipped = manifest.train_prototypes(&references, &version);
            manifest.write(&path)?;
            Ok((manifest, references.len(), skipped))
        })
        .await??;

        if skipped > 0 {
            warn!("{skipped} 张参考图的嵌入向量与模型版本不一致，已跳过");
        }
        info!("使用 {} 张参考图训练了 {} 个类别", count - skipped, manifest.classes.len());
        for class in &manifest.classes {
            println!("{}\t{}", class.samples, class.label);
        }
        Ok(())
    }
}
