//! 磁盘存储
//!
//! ```text
//! storage/
//! ├── references/   <id>.<ext> 参考图，<id>.json 元数据与嵌入向量
//! └── temp/         <毫秒时间戳>-<随机串>.<ext> 上传的临时文件
//! ```
//!
//! 所有写入都先写隐藏的 `.partial` 文件再重命名。

mod reference;
mod temp;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use log::info;
use thiserror::Error;

pub use self::reference::*;
pub use self::temp::*;
use crate::config::StorageDir;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("读写 {path} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("参考图已存在: {id}")]
    DuplicateReference { id: String },
    #[error("参考图数据损坏 {path}: {reason}")]
    CorruptStore { path: PathBuf, reason: String },
    #[error("参考图不存在: {id}")]
    NotFound { id: String },
    #[error("没有类别为 {label} 的参考图")]
    LabelNotFound { label: String },
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

pub(crate) fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io { path: path.to_path_buf(), source }
}

/// 管理参考图与临时上传文件
#[derive(Debug)]
pub struct StorageManager {
    references: PathBuf,
    temp: PathBuf,
    retention: Duration,
    /// 串行化参考图写入，保证去重检查与写入之间没有竞争
    write_lock: Mutex<()>,
}

impl StorageManager {
    /// 打开存储目录，不存在的目录会被创建
    pub fn open(layout: &StorageDir, retention: Duration) -> Result<Self> {
        for dir in [layout.references(), layout.temp(), layout.models().to_path_buf()] {
            if !dir.exists() {
                info!("创建目录: {}", dir.display());
            }
            fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        }
        Ok(Self {
            references: layout.references(),
            temp: layout.temp(),
            retention,
            write_lock: Mutex::new(()),
        })
    }

    pub fn references_dir(&self) -> &Path {
        &self.references
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp
    }

    /// 临时文件的保留时间
    pub fn retention(&self) -> Duration {
        self.retention
    }
}
