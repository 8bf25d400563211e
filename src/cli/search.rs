use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::debug;
use serde::Serialize;

use crate::cli::{SubCommandExtend, build_matcher, load_model, open_storage};
use crate::config::{MatchOptions, ModelOptions, Opts};
use crate::matcher::MatchResult;
use crate::model::InferenceResult;

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    #[command(flatten)]
    pub model: ModelOptions,
    #[command(flatten)]
    pub matching: MatchOptions,
    /// 被识别的图片路径
    pub image: PathBuf,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Table,
}

#[derive(Serialize)]
struct SearchOutput<'a> {
    prediction: &'a InferenceResult,
    #[serde(flatten)]
    result: &'a MatchResult,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let data = tokio::fs::read(&self.image).await?;
        let storage = open_storage(opts)?;
        let model = load_model(opts, &self.model)?;
        let matcher = build_matcher(&model, storage).await?;

        let prediction = model.infer_with_deadline(data, self.model.inference_deadline()).await?;
        let result = matcher.match_embedding(
            &prediction.embedding,
            self.matching.top_k,
            self.matching.threshold,
        )?;
        debug!("模型预测: {:?} ({:.3})", prediction.label, prediction.confidence);

        match self.output_format {
            OutputFormat::Json => {
                let output = SearchOutput { prediction: &prediction, result: &result };
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!("decision\t{}", result.decision.as_str());
                if let Some(label) = &prediction.label {
                    println!("model\t{:.2}\t{}", prediction.confidence, label);
                }
                for candidate in &result.candidates {
                    println!("{:.2}\t{}\t{}", candidate.similarity, candidate.label, candidate.id);
                }
            }
        }
        Ok(())
    }
}
