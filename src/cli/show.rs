use anyhow::Result;
use clap::Parser;
use tokio::task::spawn_blocking;

use crate::cli::{OutputFormat, SubCommandExtend, load_model, open_storage};
use crate::config::{ModelOptions, Opts};
use crate::server::ReferenceSummary;

#[derive(Parser, Debug, Clone)]
pub struct ShowCommand {
    #[command(flatten)]
    pub model: ModelOptions,
    /// 只显示该标签的参考图
    #[arg(short, long)]
    pub label: Option<String>,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for ShowCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let storage = open_storage(opts)?;
        let model = load_model(opts, &self.model)?;
        let version = model.version().to_string();
        let label = self.label.clone();

        let mut references = spawn_blocking(move || -> Result<_> {
            Ok(storage
                .load_all_references()?
                .filter(|r| label.as_ref().is_none_or(|l| &r.label == l))
                .map(|r| ReferenceSummary::new(r, &version))
                .collect::<Vec<_>>())
        })
        .await??;
        references.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        match self.output_format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&references)?),
            OutputFormat::Table => {
                for r in &references {
                    let stale = if r.stale { "\tstale" } else { "" };
                    println!(
                        "{}\t{}\t{}\t{}{}",
                        r.id,
                        r.label,
                        r.ingredients.join(","),
                        r.created_at.format("%Y-%m-%d %H:%M:%S"),
                        stale
                    );
                }
            }
        }
        Ok(())
    }
}
