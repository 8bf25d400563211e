use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use rand::distr::{Alphanumeric, SampleString};

/// 图片允许的 MIME 类型
pub const ALLOWED_CONTENT_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

/// 根据 MIME 类型返回文件后缀
pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        _ => "bin",
    }
}

/// 根据文件后缀猜测 MIME 类型
pub fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// 随机字母数字串
pub fn random_suffix(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::rng(), len).to_ascii_lowercase()
}

/// 先写入同目录下的隐藏临时文件，再重命名为目标文件
///
/// 读者只可能看到完整的文件或者看不到文件
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "路径缺少文件名"))?;
    let tmp = dir.join(format!(".{}.{}.partial", name.to_string_lossy(), random_suffix(6)));

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// 按阶段累计耗时
#[derive(Debug)]
pub struct TimeMeasure {
    start: Instant,
    last: Instant,
    stages: Vec<(&'static str, Duration)>,
}

impl TimeMeasure {
    pub fn new() -> Self {
        let now = Instant::now();
        Self { start: now, last: now, stages: vec![] }
    }

    /// 记录自上一次记录以来经过的时间
    pub fn lap(&mut self, stage: &'static str) -> Duration {
        let now = Instant::now();
        let elapsed = now - self.last;
        self.last = now;
        match self.stages.iter_mut().find(|(name, _)| *name == stage) {
            Some((_, total)) => *total += elapsed,
            None => self.stages.push((stage, elapsed)),
        }
        elapsed
    }

    pub fn measure<F, R>(&mut self, stage: &'static str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.last = Instant::now();
        let r = f();
        self.lap(stage);
        r
    }

    pub fn get(&self, stage: &str) -> Duration {
        self.stages
            .iter()
            .find(|(name, _)| *name == stage)
            .map(|(_, d)| *d)
            .unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for TimeMeasure {
    fn default() -> Self {
        Self::new()
    }
}

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}
