use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use rand::distr::{Alphanumeric, SampleString};
use tokio::net::TcpListener;
use tokio::task::spawn_blocking;
use tokio::time::{Duration, MissedTickBehavior, interval};

use crate::analysis::{Analyzer, AnalyzerSettings};
use crate::cli::{SubCommandExtend, build_matcher, load_model, open_storage};
use crate::config::{EscalationOptions, MatchOptions, ModelOptions};
use crate::escalate::{AnthropicConfig, AnthropicEscalator, EscalationPolicy, Escalator};
use crate::matcher::Matcher;
use crate::storage::StorageManager;
use crate::{Opts, server};

#[derive(Parser, Debug, Clone)]
pub struct ServerCommand {
    #[command(flatten)]
    pub model: ModelOptions,
    #[command(flatten)]
    pub matching: MatchOptions,
    #[command(flatten)]
    pub escalation: EscalationOptions,
    /// 监听地址
    #[arg(long, default_value = "0.0.0.0:8000")]
    pub addr: String,
    /// 请求验证 token，不填则随机生成
    #[arg(long, env = "FOODVISION_TOKEN", hide_env_values = true, default_value_t = String::new())]
    pub token: String,
    /// 允许跨域访问的来源，多个来源用逗号分隔
    #[arg(long, value_delimiter = ',', default_value = "*")]
    pub allowed_origins: Vec<String>,
    /// 没有参考图时 /ready 也返回就绪
    #[arg(long)]
    pub allow_empty_index: bool,
    /// 升级分析失败时返回 502 而不是 200
    #[arg(long)]
    pub report_escalation_failure: bool,
    /// 清理过期临时文件的间隔，单位为秒
    #[arg(long, value_name = "SECS", default_value_t = 300)]
    pub purge_interval: u64,
    /// 定期从磁盘重建索引的间隔，单位为秒，不填则只在修改参考图时重建
    #[arg(long, value_name = "SECS")]
    pub refresh_interval: Option<u64>,
    /// 单张图片的大小上限，单位为 MB
    #[arg(long, value_name = "MB", default_value_t = 10)]
    pub max_upload_mb: usize,
}

impl ServerCommand {
    fn escalator(&self) -> anyhow::Result<Option<Arc<dyn Escalator>>> {
        match AnthropicConfig::from_options(&self.escalation) {
            Some(config) => {
                info!("升级分析已启用，模型: {}", config.model);
                Ok(Some(Arc::new(AnthropicEscalator::new(config)?)))
            }
            None => {
                warn!("未设置 ANTHROPIC_API_KEY，升级分析已禁用");
                Ok(None)
            }
        }
    }
}

impl SubCommandExtend for ServerCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let storage = open_storage(opts)?;
        let model = load_model(opts, &self.model)?;
        let matcher = build_matcher(&model, storage.clone()).await?;
        if matcher.snapshot().is_empty() && !self.allow_empty_index {
            warn!("索引为空，添加参考图前 /ready 将返回 503");
        }

        let analyzer = Analyzer {
            model,
            matcher: matcher.clone(),
            storage: storage.clone(),
            escalator: self.escalator()?,
            policy: EscalationPolicy {
                confidence_threshold: self.escalation.escalation_confidence,
                always: self.escalation.always_escalate,
            },
            settings: AnalyzerSettings {
                threshold: self.matching.threshold,
                top_k: self.matching.top_k,
                inference_deadline: self.model.inference_deadline(),
                assessment_weight: self.escalation.assessment_weight,
                max_upload_bytes: self.max_upload_mb * 1024 * 1024,
            },
        };

        let mut token = self.token.clone();
        if token.is_empty() {
            token = Alphanumeric.sample_string(&mut rand::rng(), 32);
            info!("鉴权 token: {}", token);
        }

        // 创建应用状态
        let state = server::AppState::new(
            analyzer,
            token,
            self.allow_empty_index,
            self.report_escalation_failure,
        );

        // 创建应用
        let app = server::create_app(state, &self.allowed_origins);

        tokio::spawn(purge_loop(storage.clone(), Duration::from_secs(self.purge_interval.max(1))));
        if let Some(secs) = self.refresh_interval {
            tokio::spawn(refresh_loop(matcher, storage, Duration::from_secs(secs.max(1))));
        }

        // 启动服务器
        info!("服务器启动：http://{}", &self.addr);
        let listener = TcpListener::bind(&self.addr).await?;
        axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
        info!("服务器已关闭");

        Ok(())
    }
}

/// 定期删除过期的临时文件，启动时立即执行一次
async fn purge_loop(storage: Arc<StorageManager>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let storage = storage.clone();
        match spawn_blocking(move || storage.purge_expired_temp(std::time::SystemTime::now())).await {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => info!("清理了 {n} 个过期临时文件"),
            Ok(Err(e)) => error!("清理临时文件失败: {e}"),
            Err(e) => error!("清理任务异常退出: {e}"),
        }
    }
}

async fn refresh_loop(matcher: Arc<Matcher>, storage: Arc<StorageManager>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // 第一次 tick 立即返回，启动时已经构建过索引
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = matcher.refresh_in_background(storage.clone()).await {
            error!("重建索引失败: {e}");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("无法监听退出信号: {e}");
        std::future::pending::<()>().await;
    }
    info!("收到退出信号，正在关闭服务器");
}
