use std::time::SystemTime;

use anyhow::Result;
use clap::Parser;
use log::info;
use tokio::task::spawn_blocking;

use crate::cli::{SubCommandExtend, open_storage};
use crate::Opts;

/// 保留时间由全局参数 `--temp-retention` 决定
#[derive(Parser, Debug, Clone)]
pub struct PurgeCommand {}

impl SubCommandExtend for PurgeCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let storage = open_storage(opts)?;
        let removed = spawn_blocking(move || storage.purge_expired_temp(SystemTime::now())).await??;
        info!("清理了 {removed} 个过期临时文件");
        println!("{removed}");
        Ok(())
    }
}
