use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ParallelProgressIterator, ProgressBar};
use log::info;
use rayon::prelude::*;
use regex::Regex;
use tokio::task::spawn_blocking;
use walkdir::WalkDir;

use crate::cli::{SubCommandExtend, load_model, open_storage};
use crate::config::{ModelOptions, Opts};
use crate::server::parse_ingredients;
use crate::storage::{ReferenceMeta, StorageError};
use crate::utils::{content_type_for, pb_style};

#[derive(Parser, Debug, Clone)]
pub struct AddCommand {
    #[command(flatten)]
    pub model: ModelOptions,
    /// 图片所在目录，也可以是单张图片
    pub path: PathBuf,
    /// 参考图标签，不填则使用图片所在目录的名称
    #[arg(short, long)]
    pub label: Option<String>,
    /// 食材列表，多个食材用逗号分隔
    #[arg(short, long)]
    pub ingredients: Option<String>,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,jpeg,png,webp")]
    pub suffix: String,
}

#[derive(Debug, Default)]
struct AddSummary {
    added: AtomicUsize,
    duplicate: AtomicUsize,
    failed: AtomicUsize,
}

impl AddCommand {
    fn collect_files(&self) -> Result<Vec<PathBuf>> {
        let re_suf = format!("(?i)\\.({})$", self.suffix.replace(',', "|"));
        let re_suf = Regex::new(&re_suf).context("无效的后缀名")?;

        if self.path.is_file() {
            return Ok(vec![self.path.clone()]);
        }
        let mut files = WalkDir::new(&self.path)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| re_suf.is_match(&path.to_string_lossy()))
            .collect::<Vec<_>>();
        files.sort();
        Ok(files)
    }

    /// 优先使用 `--label`，其次是图片所在目录名
    fn label_for(&self, path: &Path) -> Option<String> {
        if let Some(label) = &self.label {
            return Some(label.trim().to_string()).filter(|l| !l.is_empty());
        }
        path.parent()
            .and_then(|dir| dir.file_name())
            .map(|name| name.to_string_lossy().trim().to_string())
            .filter(|l| !l.is_empty())
    }
}

impl SubCommandExtend for AddCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let storage = open_storage(opts)?;
        let model = load_model(opts, &self.model)?;
        let files = self.collect_files()?;
        let ingredients = self.ingredients.as_deref().map(parse_ingredients).unwrap_or_default();
        info!("找到 {} 张图片", files.len());

        let cmd = self.clone();
        let summary = spawn_blocking(move || {
            let summary = AddSummary::default();
            let pb = ProgressBar::new(files.len() as u64).with_style(pb_style());

            files.par_iter().progress_with(pb.clone()).for_each(|path| {
                let fail = |reason: String| {
                    pb.println(format!("添加失败 {}: {}", path.display(), reason));
                    summary.failed.fetch_add(1, Ordering::Relaxed);
                };

                let Some(label) = cmd.label_for(path) else {
                    return fail("无法确定标签".to_string());
                };
                let Some(content_type) = content_type_for(path) else {
                    return fail("不支持的图片类型".to_string());
                };
                let data = match std::fs::read(path) {
                    Ok(data) => data,
                    Err(e) => return fail(e.to_string()),
                };
                let embedding = match model.embed(&data) {
                    Ok(embedding) => embedding,
                    Err(e) => return fail(e.to_string()),
                };
                let meta = ReferenceMeta {
                    label,
                    ingredients: ingredients.clone(),
                    original_name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
                    content_type: content_type.to_string(),
                };
                match storage.save_reference(&data, meta, embedding) {
                    Ok(reference) => {
                        pb.set_message(format!("{} -> {}", path.display(), reference.id));
                        summary.added.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(StorageError::DuplicateReference { .. }) => {
                        pb.set_message(format!("跳过图片: {}", path.display()));
                        summary.duplicate.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => fail(e.to_string()),
                }
            });

            pb.finish_and_clear();
            summary
        })
        .await?;

        let added = summary.added.into_inner();
        let duplicate = summary.duplicate.into_inner();
        let failed = summary.failed.into_inner();
        info!("添加 {added} 张，重复 {duplicate} 张，失败 {failed} 张");
        println!("added: {added}\tduplicate: {duplicate}\tfailed: {failed}");
        Ok(())
    }
}
