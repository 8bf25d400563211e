//! 单次分析请求的处理流程
//!
//! ```text
//! Received → Validated → Stored → Inferred → Matched → (Escalated) → Responded
//! ```
//!
//! 任意阶段失败都会进入 `Errored`，临时文件由 [`TempGuard`] 负责删除。

mod response;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use futures::{StreamExt, stream};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::task::spawn_blocking;

pub use self::response::*;
use crate::escalate::{EscalationPolicy, EscalationRequest, Escalator, ImagePart};
use crate::matcher::{MatchResult, Matcher};
use crate::metrics;
use crate::model::{FeatureModel, InferenceResult, ModelError};
use crate::storage::{StorageError, StorageManager, TempGuard};
use crate::utils::{ALLOWED_CONTENT_TYPES, TimeMeasure, content_type_for, random_suffix};

/// 批量分析时同时处理的图片数量
const BATCH_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("{0}")]
    Validation(String),
    #[error("不支持的图片类型: {0}")]
    UnsupportedMediaType(String),
    #[error("文件过大：{size} 字节，上限为 {limit} 字节")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("没有类别为 {0} 的参考图")]
    UnknownLabel(String),
    #[error("后台任务异常退出: {0}")]
    Internal(String),
}

/// 请求所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validated,
    Stored,
    Inferred,
    Matched,
    Escalated,
    Responded,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::Stored => "stored",
            Self::Inferred => "inferred",
            Self::Matched => "matched",
            Self::Escalated => "escalated",
            Self::Responded => "responded",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 上传的一个文件
#[derive(Debug, Clone)]
pub struct Upload {
    pub data: Bytes,
    pub content_type: Option<String>,
    pub file_name: Option<String>,
}

/// 单次请求可以覆盖的参数
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    /// 请求外部模型给出详细描述
    pub rich: bool,
    pub threshold: Option<f32>,
    pub top_k: Option<usize>,
    /// 只与该类别的参考图比较
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct AnalyzerSettings {
    pub threshold: f32,
    pub top_k: usize,
    pub inference_deadline: Duration,
    pub assessment_weight: f32,
    pub max_upload_bytes: usize,
}

/// 串联模型、匹配与升级分析
pub struct Analyzer {
    pub model: Arc<FeatureModel>,
    pub matcher: Arc<Matcher>,
    pub storage: Arc<StorageManager>,
    pub escalator: Option<Arc<dyn Escalator>>,
    pub policy: EscalationPolicy,
    pub settings: AnalyzerSettings,
}

/// 去掉参数并转为小写，例如 `image/PNG; q=1` -> `image/png`
fn normalize_content_type(content_type: &str) -> String {
    content_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase()
}

/// 根据文件头猜测图片类型
fn sniff_content_type(data: &[u8]) -> Option<&'static str> {
    match image::guess_format(data).ok()? {
        image::ImageFormat::Jpeg => Some("image/jpeg"),
        image::ImageFormat::Png => Some("image/png"),
        image::ImageFormat::WebP => Some("image/webp"),
        _ => None,
    }
}

impl Analyzer {
    /// 校验上传文件，返回其 MIME 类型
    pub fn validate(&self, upload: &Upload) -> Result<String, AnalyzeError> {
        if upload.data.is_empty() {
            return Err(AnalyzeError::Validation("上传的文件为空".to_string()));
        }
        if upload.data.len() > self.settings.max_upload_bytes {
            return Err(AnalyzeError::PayloadTooLarge {
                size: upload.data.len(),
                limit: self.settings.max_upload_bytes,
            });
        }

        let declared = upload
            .content_type
            .as_deref()
            .map(normalize_content_type)
            .filter(|ct| !ct.is_empty() && ct != "application/octet-stream");
        match declared {
            Some(ct) if ALLOWED_CONTENT_TYPES.contains(&ct.as_str()) => Ok(ct),
            Some(ct) => Err(AnalyzeError::UnsupportedMediaType(ct)),
            None => upload
                .file_name
                .as_deref()
                .and_then(|name| content_type_for(name.as_ref()))
                .or_else(|| sniff_content_type(&upload.data))
                .map(str::to_string)
                .ok_or_else(|| AnalyzeError::UnsupportedMediaType("未知".to_string())),
        }
    }

    fn validate_options(&self, opts: &AnalyzeOptions) -> Result<(f32, usize), AnalyzeError> {
        let threshold = opts.threshold.unwrap_or(self.settings.threshold);
        if !(-1.0..=1.0).contains(&threshold) {
            return Err(AnalyzeError::Validation(format!(
                "threshold 必须位于 [-1, 1] 区间: {threshold}"
            )));
        }
        let top_k = opts.top_k.unwrap_or(self.settings.top_k);
        if !(1..=100).contains(&top_k) {
            return Err(AnalyzeError::Validation(format!("top_k 必须位于 [1, 100] 区间: {top_k}")));
        }
        Ok((threshold, top_k))
    }

    /// 分析一张图片
    pub async fn analyze(
        &self,
        upload: Upload,
        opts: AnalyzeOptions,
    ) -> Result<AnalysisResponse, AnalyzeError> {
        let request_id = random_suffix(8);
        let mut stage = Stage::Received;
        debug!("[{request_id}] {stage}: {:?} ({} 字节)", upload.file_name, upload.data.len());

        let result = self.run(&request_id, &mut stage, upload, opts).await;
        match &result {
            Ok(response) => metrics::inc_classify_count(response.decision.as_str()),
            Err(e) => {
                metrics::inc_error_count(stage.as_str());
                match e {
                    AnalyzeError::Storage(_) | AnalyzeError::Internal(_) => {
                        error!("[{request_id}] 在 {stage} 阶段之后失败: {e}")
                    }
                    _ => warn!("[{request_id}] 在 {stage} 阶段之后失败: {e}"),
                }
            }
        }
        result
    }

    async fn run(
        &self,
        request_id: &str,
        stage: &mut Stage,
        upload: Upload,
        opts: AnalyzeOptions,
    ) -> Result<AnalysisResponse, AnalyzeError> {
        let mut tm = TimeMeasure::new();

        let content_type = self.validate(&upload)?;
        let (threshold, top_k) = self.validate_options(&opts)?;
        if let Some(label) = &opts.label {
            if !self.matcher.snapshot().has_label(label) {
                return Err(AnalyzeError::UnknownLabel(label.clone()));
            }
        }
        tm.lap("validate");
        self.advance(request_id, stage, Stage::Validated);

        let guard = self.store(&upload.data, &content_type).await?;
        tm.lap("store");
        self.advance(request_id, stage, Stage::Stored);

        let mut prediction = self
            .model
            .infer_with_deadline(upload.data.clone(), self.settings.inference_deadline)
            .await?;
        prediction.artifact_id = Some(guard.artifact().id.clone());
        metrics::observe_inference_duration(tm.lap("inference"));
        self.advance(request_id, stage, Stage::Inferred);

        let matched = match &opts.label {
            // 校验之后索引可能已被替换
            Some(label) => self
                .matcher
                .match_label(&prediction.embedding, label, top_k, threshold)?
                .ok_or_else(|| AnalyzeError::UnknownLabel(label.clone()))?,
            None => self.matcher.match_embedding(&prediction.embedding, top_k, threshold)?,
        };
        if let Some(similarity) = matched.similarity {
            metrics::observe_best_similarity(similarity);
        }
        tm.lap("match");
        self.advance(request_id, stage, Stage::Matched);

        let escalation = if self.policy.should_escalate(&prediction, &matched, opts.rich) {
            let outcome = self.escalate(&upload.data, &content_type, &prediction, &matched).await;
            tm.lap("escalation");
            self.advance(request_id, stage, Stage::Escalated);
            outcome
        } else {
            EscalationOutcome::new(EscalationStatus::Skipped)
        };
        metrics::inc_escalation_count(escalation.status.as_str());

        let escalation_failed = escalation.status == EscalationStatus::Failed;
        let matched_reference = matched.matched().cloned();
        let label = match &matched_reference {
            Some(reference) => Some(reference.label.clone()),
            None => prediction.label.clone(),
        };
        let components = matched
            .best
            .as_ref()
            .and_then(|best| self.model.component_scores(&prediction.embedding.values, &best.embedding));
        let score = ScoreBreakdown::new(
            matched.similarity,
            escalation.assessment.as_ref(),
            self.settings.assessment_weight,
        )
        .with_components(components);

        // 临时文件在响应前删除
        drop(guard);
        let response = AnalysisResponse {
            label,
            confidence: prediction.confidence,
            decision: matched.decision,
            similarity: matched.similarity,
            matched_reference,
            candidates: matched.candidates,
            escalation,
            escalation_failed,
            score,
            latency: Latency::from(&tm),
            file_name: upload.file_name,
            prediction,
        };
        self.advance(request_id, stage, Stage::Responded);
        info!(
            "[{request_id}] {:?} {:?} 相似度 {:?} 升级 {}，耗时 {:.1}ms",
            response.label,
            response.decision,
            response.similarity,
            response.escalation.status.as_str(),
            response.latency.total_ms
        );
        Ok(response)
    }

    fn advance(&self, request_id: &str, stage: &mut Stage, next: Stage) {
        *stage = next;
        debug!("[{request_id}] {next}");
    }

    async fn store(&self, data: &Bytes, content_type: &str) -> Result<TempGuard, AnalyzeError> {
        let storage = self.storage.clone();
        let data = data.clone();
        let content_type = content_type.to_string();
        // 守卫在阻塞任务内创建，请求被取消时随任务结果一起释放
        let guard = spawn_blocking(move || {
            storage.save_temp(&data, &content_type).map(|artifact| storage.temp_guard(artifact))
        })
        .await
        .map_err(|e| AnalyzeError::Internal(e.to_string()))??;
        Ok(guard)
    }

    async fn escalate(
        &self,
        data: &Bytes,
        content_type: &str,
        prediction: &InferenceResult,
        matched: &MatchResult,
    ) -> EscalationOutcome {
        let Some(escalator) = &self.escalator else {
            return EscalationOutcome::new(EscalationStatus::Disabled);
        };

        let best = matched.matched();
        let reference = match best {
            Some(candidate) => match tokio::fs::read(&candidate.path).await {
                Ok(data) => Some(ImagePart {
                    data,
                    content_type: content_type_for(&candidate.path)
                        .unwrap_or("image/jpeg")
                        .to_string(),
                }),
                Err(e) => {
                    warn!("读取参考图 {} 失败，不附带参考图: {}", candidate.path.display(), e);
                    None
                }
            },
            None => None,
        };

        let request = EscalationRequest {
            image: ImagePart { data: data.to_vec(), content_type: content_type.to_string() },
            reference,
            local_label: prediction.label.clone(),
            matched_label: best.map(|c| c.label.clone()),
            ingredients: best.map(|c| c.ingredients.clone()).unwrap_or_default(),
        };

        match escalator.describe(&request).await {
            Ok(description) => EscalationOutcome::completed(description),
            Err(e) => {
                warn!("升级分析失败（{}）: {}", escalator.model_name(), e);
                EscalationOutcome::failed(e)
            }
        }
    }

    /// 分析多张图片，单张失败不影响其他图片
    pub async fn analyze_batch(&self, uploads: Vec<Upload>, opts: AnalyzeOptions) -> BatchResponse {
        let opts = &opts;
        let results = stream::iter(uploads.into_iter().enumerate())
            .map(|(index, upload)| async move {
                let file_name = upload.file_name.clone();
                match self.analyze(upload, opts.clone()).await {
                    Ok(result) => BatchItem { index, file_name, result: Some(result), error: None },
                    Err(e) => BatchItem { index, file_name, result: None, error: Some(public_message(&e)) },
                }
            })
            .buffered(BATCH_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;
        BatchResponse::new(results)
    }
}

/// 可以返回给调用方的错误信息，内部错误只给出笼统描述
pub fn public_message(err: &AnalyzeError) -> String {
    match err {
        AnalyzeError::Storage(_) | AnalyzeError::Internal(_) => "内部错误".to_string(),
        AnalyzeError::Model(
            ModelError::Load { .. } | ModelError::Worker(_) | ModelError::VersionMismatch { .. },
        ) => "内部错误".to_string(),
        _ => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::config::StorageDir;
    use crate::escalate::{Description, EscalationError};
    use crate::matcher::Decision;
    use crate::model::tests::{solid_png, test_model};
    use crate::storage::ReferenceMeta;

    struct FakeEscalator {
        fail: bool,
    }

    #[async_trait]
    impl Escalator for FakeEscalator {
        async fn describe(&self, request: &EscalationRequest) -> Result<Description, EscalationError> {
            if self.fail {
                return Err(EscalationError::Network("connection reset".to_string()));
            }
            let dish = request.matched_label.as_deref().unwrap_or("unknown");
            let text = format!(r#"{{"score": 60, "overall_assessment": "looks like {dish}"}}"#);
            Ok(Description::parse(text, "fake"))
        }

        fn model_name(&self) -> &str {
            "fake"
        }
    }

    struct Fixture {
        _dir: TempDir,
        analyzer: Analyzer,
    }

    fn fixture(escalator: Option<Arc<dyn Escalator>>, always: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let layout = StorageDir::new(dir.path().join("storage"), dir.path().join("models"));
        let storage = Arc::new(StorageManager::open(&layout, Duration::from_secs(60)).unwrap());
        let model = Arc::new(test_model());
        let matcher = Arc::new(Matcher::new(model.version()));
        let analyzer = Analyzer {
            model,
            matcher,
            storage,
            escalator,
            policy: EscalationPolicy { confidence_threshold: 0.5, always },
            settings: AnalyzerSettings {
                threshold: 0.9,
                top_k: 3,
                inference_deadline: Duration::from_secs(5),
                assessment_weight: 0.25,
                max_upload_bytes: 1024 * 1024,
            },
        };
        Fixture { _dir: dir, analyzer }
    }

    fn upload(data: Vec<u8>, content_type: &str) -> Upload {
        Upload {
            data: Bytes::from(data),
            content_type: Some(content_type.to_string()),
            file_name: Some("dish.png".to_string()),
        }
    }

    fn temp_is_empty(analyzer: &Analyzer) -> bool {
        fs::read_dir(analyzer.storage.temp_dir()).unwrap().next().is_none()
    }

    fn add_reference(analyzer: &Analyzer, data: &[u8], label: &str) {
        let embedding = analyzer.model.embed(data).unwrap();
        let meta = ReferenceMeta {
            label: label.to_string(),
            ingredients: vec!["tomato".to_string()],
            content_type: "image/png".to_string(),
            ..Default::default()
        };
        analyzer.storage.save_reference(data, meta, embedding).unwrap();
        analyzer.matcher.refresh(&analyzer.storage).unwrap();
    }

    #[tokio::test]
    async fn test_solid_red_without_references_is_no_match() {
        let f = fixture(None, false);
        let response = f
            .analyzer
            .analyze(upload(solid_png([255, 0, 0]), "image/png"), AnalyzeOptions::default())
            .await
            .unwrap();
        assert_eq!(response.decision, Decision::NoMatch);
        assert_eq!(response.confidence, response.prediction.confidence);
        assert_eq!(response.escalation.status, EscalationStatus::Skipped);
        assert!(!response.escalation_failed);
        assert!(response.prediction.artifact_id.is_some());
        assert!(temp_is_empty(&f.analyzer));
    }

    #[tokio::test]
    async fn test_matching_reference() {
        let f = fixture(None, false);
        let data = solid_png([20, 160, 40]);
        add_reference(&f.analyzer, &data, "salad");

        let response =
            f.analyzer.analyze(upload(data, "image/png"), AnalyzeOptions::default()).await.unwrap();
        assert_eq!(response.decision, Decision::Matched);
        assert_eq!(response.label.as_deref(), Some("salad"));
        assert!(response.similarity.unwrap() > 0.999);
        assert_eq!(response.score.quality_label, "Excellent");
        assert_eq!(response.score.color_score, Some(100.0));
        assert!(temp_is_empty(&f.analyzer));
    }

    #[tokio::test]
    async fn test_label_scoped_analysis() {
        let f = fixture(None, false);
        let salad = solid_png([20, 160, 40]);
        add_reference(&f.analyzer, &salad, "salad");
        add_reference(&f.analyzer, &solid_png([200, 40, 30]), "soup");

        let opts = AnalyzeOptions { label: Some("soup".to_string()), ..Default::default() };
        let response = f.analyzer.analyze(upload(salad.clone(), "image/png"), opts).await.unwrap();
        assert_eq!(response.decision, Decision::NoMatch);
        assert!(response.candidates.iter().all(|c| c.label == "soup"));
        // 纯色图片结构一致，区别只在颜色
        let score = &response.score;
        assert!(score.color_score.unwrap() < score.structure_score.unwrap());

        let opts = AnalyzeOptions { label: Some("pizza".to_string()), ..Default::default() };
        let err = f.analyzer.analyze(upload(salad, "image/png"), opts).await;
        assert!(matches!(err, Err(AnalyzeError::UnknownLabel(label)) if label == "pizza"));
        assert!(temp_is_empty(&f.analyzer));
    }

    #[tokio::test]
    async fn test_escalation_failure_is_absorbed() {
        let f = fixture(Some(Arc::new(FakeEscalator { fail: true })), true);
        let response = f
            .analyzer
            .analyze(upload(solid_png([255, 0, 0]), "image/png"), AnalyzeOptions::default())
            .await
            .unwrap();
        assert!(response.escalation_failed);
        assert_eq!(response.escalation.status, EscalationStatus::Failed);
        assert!(response.escalation.error.unwrap().contains("connection reset"));
        assert!(temp_is_empty(&f.analyzer));
    }

    #[tokio::test]
    async fn test_rich_request_uses_assessment() {
        let f = fixture(Some(Arc::new(FakeEscalator { fail: false })), false);
        let data = solid_png([20, 160, 40]);
        add_reference(&f.analyzer, &data, "salad");

        let opts = AnalyzeOptions { rich: true, ..Default::default() };
        let response = f.analyzer.analyze(upload(data, "image/png"), opts).await.unwrap();
        assert_eq!(response.escalation.status, EscalationStatus::Completed);
        let assessment = response.escalation.assessment.unwrap();
        assert_eq!(assessment.score, 60);
        assert!(assessment.overall_assessment.contains("salad"));
        assert_eq!(response.score.assessment_score, Some(60));
        assert_eq!(response.score.final_score, 90.0);
    }

    #[tokio::test]
    async fn test_escalation_disabled_without_escalator() {
        let f = fixture(None, true);
        let response = f
            .analyzer
            .analyze(upload(solid_png([255, 0, 0]), "image/png"), AnalyzeOptions::default())
            .await
            .unwrap();
        assert_eq!(response.escalation.status, EscalationStatus::Disabled);
        assert!(!response.escalation_failed);
    }

    #[tokio::test]
    async fn test_invalid_uploads() {
        let f = fixture(None, false);
        let analyzer = &f.analyzer;

        let err = analyzer.analyze(upload(vec![], "image/png"), AnalyzeOptions::default()).await;
        assert!(matches!(err, Err(AnalyzeError::Validation(_))));

        let err = analyzer.analyze(upload(vec![1, 2, 3], "text/plain"), AnalyzeOptions::default()).await;
        assert!(matches!(err, Err(AnalyzeError::UnsupportedMediaType(_))));

        let err = analyzer.analyze(upload(vec![1, 2, 3], "image/png"), AnalyzeOptions::default()).await;
        assert!(matches!(err, Err(AnalyzeError::Model(ModelError::InvalidImage(_)))));

        let err = analyzer
            .analyze(upload(vec![0; 2 * 1024 * 1024], "image/png"), AnalyzeOptions::default())
            .await;
        assert!(matches!(err, Err(AnalyzeError::PayloadTooLarge { .. })));

        let opts = AnalyzeOptions { threshold: Some(1.5), ..Default::default() };
        let err = analyzer.analyze(upload(solid_png([1, 2, 3]), "image/png"), opts).await;
        assert!(matches!(err, Err(AnalyzeError::Validation(_))));

        assert!(temp_is_empty(analyzer));
    }

    #[test]
    fn test_content_type_detection() {
        let f = fixture(None, false);
        let mut u = upload(solid_png([1, 2, 3]), "IMAGE/PNG; charset=binary");
        assert_eq!(f.analyzer.validate(&u).unwrap(), "image/png");

        u.content_type = Some("application/octet-stream".to_string());
        u.file_name = None;
        assert_eq!(f.analyzer.validate(&u).unwrap(), "image/png");

        u.content_type = None;
        u.file_name = Some("photo.JPG".to_string());
        assert_eq!(f.analyzer.validate(&u).unwrap(), "image/jpeg");
    }

    #[tokio::test]
    async fn test_cancelled_store_leaves_no_temp_file() {
        let f = fixture(None, false);
        let data = Bytes::from(solid_png([255, 0, 0]));
        // 只轮询一次就丢弃，写入可能仍在阻塞线程中进行
        let _ = tokio::time::timeout(Duration::ZERO, f.analyzer.store(&data, "image/png")).await;

        for _ in 0..100 {
            if temp_is_empty(&f.analyzer) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("临时文件没有被删除");
    }

    #[tokio::test]
    async fn test_batch() {
        let f = fixture(None, false);
        let data = solid_png([20, 160, 40]);
        add_reference(&f.analyzer, &data, "salad");

        let uploads = vec![
            upload(data, "image/png"),
            upload(b"garbage".to_vec(), "image/png"),
            upload(solid_png([255, 0, 0]), "image/png"),
        ];
        let response = f.analyzer.analyze_batch(uploads, AnalyzeOptions::default()).await;
        assert_eq!(response.count, 3);
        assert_eq!(response.successful, 2);
        assert_eq!(response.results[0].index, 0);
        assert!(response.results[1].error.is_some());
        assert!(response.results[2].result.is_some());
        assert!(temp_is_empty(&f.analyzer));
    }
}
