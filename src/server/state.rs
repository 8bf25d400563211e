use std::sync::Arc;

use crate::analysis::Analyzer;

/// 应用状态
pub struct AppState {
    /// 分析流程，持有模型、索引与存储
    pub analyzer: Analyzer,
    /// 鉴权 token
    pub token: String,
    /// 索引为空时也视为就绪
    pub allow_empty_index: bool,
    /// 升级分析失败时返回 502
    pub report_escalation_failure: bool,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(
        analyzer: Analyzer,
        token: String,
        allow_empty_index: bool,
        report_escalation_failure: bool,
    ) -> Arc<Self> {
        Arc::new(AppState { analyzer, token, allow_empty_index, report_escalation_failure })
    }

    /// 模型已加载，且索引非空或允许空索引
    pub fn is_ready(&self) -> bool {
        self.allow_empty_index || !self.analyzer.matcher.snapshot().is_empty()
    }
}
