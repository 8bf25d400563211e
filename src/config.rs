use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::cli::*;

#[derive(Parser, Debug, Clone)]
pub struct ModelOptions {
    /// 模型名称，对应模型目录下的 `<NAME>.json` 清单文件
    #[arg(long, value_name = "NAME", default_value = "food-features")]
    pub model: String,
    /// 单张图片推理的超时时间，单位为毫秒
    #[arg(long, value_name = "MS", default_value_t = 5000)]
    pub inference_timeout: u64,
}

impl ModelOptions {
    pub fn inference_deadline(&self) -> Duration {
        Duration::from_millis(self.inference_timeout)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct MatchOptions {
    /// 判定为匹配的最低余弦相似度，范围从 -1 到 1
    #[arg(long, value_name = "SIMILARITY", default_value_t = 0.85, value_parser = parse_similarity)]
    pub threshold: f32,
    /// 返回的候选参考图数量
    #[arg(long, value_name = "K", default_value_t = 3)]
    pub top_k: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct EscalationOptions {
    /// Anthropic API 密钥，为空时禁用升级分析
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,
    /// Anthropic API 地址
    #[arg(long, value_name = "URL", default_value = "https://api.anthropic.com")]
    pub anthropic_url: String,
    /// 升级分析使用的模型
    #[arg(long, value_name = "MODEL", default_value = "claude-sonnet-4-20250514")]
    pub anthropic_model: String,
    /// 单次升级请求的最大输出 token 数
    #[arg(long, value_name = "N", default_value_t = 1024)]
    pub max_tokens: u32,
    /// 升级请求超时时间，单位为秒
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub escalation_timeout: u64,
    /// 网络抖动时重试前的等待时间，单位为毫秒
    #[arg(long, value_name = "MS", default_value_t = 250)]
    pub escalation_backoff: u64,
    /// 置信度低于该值时自动升级
    #[arg(long, value_name = "CONFIDENCE", default_value_t = 0.5)]
    pub escalation_confidence: f32,
    /// 总是升级，无论置信度高低
    #[arg(long)]
    pub always_escalate: bool,
    /// 最终得分中外部评估分数所占权重
    #[arg(long, value_name = "WEIGHT", default_value_t = 0.25)]
    pub assessment_weight: f32,
}

impl EscalationOptions {
    /// 返回非空的 API 密钥
    pub fn api_key(&self) -> Option<&str> {
        self.anthropic_api_key.as_deref().map(str::trim).filter(|key| !key.is_empty())
    }
}

#[derive(Parser, Debug, Clone)]
pub struct StorageOptions {
    /// 临时上传文件的保留时间，单位为秒
    #[arg(long, global = true, value_name = "SECS", default_value_t = 3600)]
    pub temp_retention: u64,
}

impl StorageOptions {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.temp_retention)
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "foodvision", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// 存储目录，参考图与临时上传文件分别位于 `references` 与 `temp` 子目录
    #[arg(short, long, global = true, default_value = "storage")]
    pub storage_dir: PathBuf,
    /// 模型清单所在目录
    #[arg(short = 'M', long, global = true, default_value = "models")]
    pub model_dir: PathBuf,
    #[command(flatten)]
    pub storage: StorageOptions,
}

impl Opts {
    pub fn layout(&self) -> StorageDir {
        StorageDir::new(&self.storage_dir, &self.model_dir)
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 启动 HTTP 分析服务
    Server(ServerCommand),
    /// 批量添加参考图
    Add(AddCommand),
    /// 在本地识别一张图片
    Search(SearchCommand),
    /// 根据参考图生成模型的类别原型
    Train(TrainCommand),
    /// 清理过期的临时上传文件
    Purge(PurgeCommand),
    /// 列出所有参考图
    Show(ShowCommand),
}

/// 磁盘布局
#[derive(Debug, Clone)]
pub struct StorageDir {
    root: PathBuf,
    models: PathBuf,
}

impl StorageDir {
    pub fn new(root: impl Into<PathBuf>, models: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), models: models.into() }
    }

    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    /// 返回参考图目录
    pub fn references(&self) -> PathBuf {
        self.root.join("references")
    }

    /// 返回临时上传目录
    pub fn temp(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// 返回模型目录
    pub fn models(&self) -> &Path {
        self.models.as_path()
    }

    /// 返回模型清单文件的路径
    pub fn model_manifest(&self, name: &str) -> PathBuf {
        self.models.join(format!("{name}.json"))
    }
}

fn parse_similarity(s: &str) -> Result<f32, String> {
    let value: f32 = s.parse().map_err(|e| format!("无效的相似度: {s} ({e})"))?;
    if !(-1.0..=1.0).contains(&value) {
        return Err(format!("相似度必须位于 [-1, 1] 区间: {s}"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_similarity_range() {
        assert_eq!(parse_similarity("0.9"), Ok(0.9));
        assert_eq!(parse_similarity("-1"), Ok(-1.0));
        assert!(parse_similarity("1.5").is_err());
        assert!(parse_similarity("abc").is_err());
    }

    #[test]
    fn test_layout_paths() {
        let layout = StorageDir::new("storage", "models");
        assert_eq!(layout.references(), PathBuf::from("storage/references"));
        assert_eq!(layout.temp(), PathBuf::from("storage/temp"));
        assert_eq!(layout.model_manifest("food"), PathBuf::from("models/food.json"));
    }

    #[test]
    fn test_global_storage_options() {
        let opts = Opts::try_parse_from(["foodvision", "purge"]).unwrap();
        assert_eq!(opts.storage_dir, PathBuf::from("storage"));
        assert_eq!(opts.storage.retention(), Duration::from_secs(3600));

        let opts = Opts::try_parse_from(["foodvision", "purge", "--temp-retention", "5"]).unwrap();
        assert_eq!(opts.storage.retention(), Duration::from_secs(5));
    }

    #[test]
    fn test_empty_api_key_disables_escalation() {
        let mut escalation = EscalationOptions::try_parse_from(["x"]).unwrap();
        escalation.anthropic_api_key = Some("  ".to_string());
        assert_eq!(escalation.api_key(), None);
        escalation.anthropic_api_key = Some("sk-test".to_string());
        assert_eq!(escalation.api_key(), Some("sk-test"));
    }
}
