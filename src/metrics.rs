use std::sync::LazyLock;
use std::time::Duration;

use prometheus::*;

static METRIC_CLASSIFY_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "foodvision_classify_count",
        "count of the classified images",
        &["decision"]
    )
    .unwrap()
});

static METRIC_ERROR_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "foodvision_error_count",
        "count of the failed requests by pipeline stage",
        &["stage"]
    )
    .unwrap()
});

static METRIC_ESCALATION_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "foodvision_escalation_count",
        "count of the escalation outcomes",
        &["status"]
    )
    .unwrap()
});

static METRIC_INFERENCE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "foodvision_inference_duration",
        "duration of the per-image inference in seconds"
    )
    .unwrap()
});

static METRIC_BEST_SIMILARITY: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "foodvision_best_similarity",
        "similarity of the best matching reference",
        (-10..=10).map(|x| x as f64 / 10.).collect()
    )
    .unwrap()
});

/// 增加分类计数
pub fn inc_classify_count(decision: &str) {
    METRIC_CLASSIFY_COUNT.with_label_values(&[decision]).inc();
}

pub fn inc_error_count(stage: &str) {
    METRIC_ERROR_COUNT.with_label_values(&[stage]).inc();
}

pub fn inc_escalation_count(status: &str) {
    METRIC_ESCALATION_COUNT.with_label_values(&[status]).inc();
}

pub fn observe_inference_duration(duration: Duration) {
    METRIC_INFERENCE_DURATION.observe(duration.as_secs_f64());
}

pub fn observe_best_similarity(similarity: f32) {
    METRIC_BEST_SIMILARITY.observe(similarity as f64);
}

/// 以 prometheus 文本格式导出所有指标
pub fn render() -> Result<String> {
    TextEncoder::new().encode_to_string(&prometheus::gather())
}
