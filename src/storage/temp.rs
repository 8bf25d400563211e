use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use super::{Result, StorageManager, io_err};
use crate::utils::{extension_for, random_suffix, write_atomic};

/// 一次请求上传的临时文件
#[derive(Debug, Clone)]
pub struct UploadArtifact {
    pub id: String,
    pub path: PathBuf,
    pub content_type: String,
    pub created_at: SystemTime,
    pub retention: Duration,
}

impl UploadArtifact {
    pub fn expires_at(&self) -> SystemTime {
        self.created_at + self.retention
    }
}

/// 离开作用域时删除临时文件
///
/// 请求成功、失败或被取消（future 被 drop）都会经过这里
#[derive(Debug)]
pub struct TempGuard {
    artifact: UploadArtifact,
}

impl TempGuard {
    pub fn artifact(&self) -> &UploadArtifact {
        &self.artifact
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.artifact.path) {
            Ok(()) => debug!("删除临时文件: {}", self.artifact.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除临时文件 {} 失败: {}", self.artifact.path.display(), e),
        }
    }
}

/// 从文件名中解析创建时间，`.partial` 文件返回 `(时间, true)`
fn parse_temp_name(name: &str) -> Option<(SystemTime, bool)> {
    let (name, partial) = match name.strip_prefix('.') {
        Some(rest) => (rest.strip_suffix(".partial")?, true),
        None => (name, false),
    };
    let millis: u64 = name.split_once('-')?.0.parse().ok()?;
    Some((UNIX_EPOCH + Duration::from_millis(millis), partial))
}

impl StorageManager {
    /// 保存上传的图片到临时目录
    pub fn save_temp(&self, data: &[u8], content_type: &str) -> Result<UploadArtifact> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let id = format!("{:013}-{}", millis, random_suffix(10));
        let path = self.temp.join(format!("{}.{}", id, extension_for(content_type)));

        write_atomic(&path, data).map_err(io_err(&path))?;
        debug!("保存临时文件: {}", path.display());

        Ok(UploadArtifact {
            id,
            path,
            content_type: content_type.to_string(),
            created_at: UNIX_EPOCH + Duration::from_millis(millis),
            retention: self.retention,
        })
    }

    /// 返回一个在 drop 时删除临时文件的守卫
    pub fn temp_guard(&self, artifact: UploadArtifact) -> TempGuard {
        TempGuard { artifact }
    }

    /// 立即删除临时文件，文件已不存在时返回 false
    pub fn remove_temp(&self, artifact: &UploadArtifact) -> Result<bool> {
        remove_if_exists(&artifact.path)
    }

    /// 删除所有超过保留时间的临时文件，返回删除的数量
    ///
    /// 可重复调用，也可以与写入并发执行：写入中的 `.partial` 文件要超过两倍保留时间才会被删除
    pub fn purge_expired_temp(&self, now: SystemTime) -> Result<usize> {
        let entries = fs::read_dir(&self.temp).map_err(io_err(&self.temp))?;
        let mut removed = 0;

        for entry in entries {
            let entry = entry.map_err(io_err(&self.temp))?;
            let name = entry.file_name();
            let Some((created_at, partial)) = parse_temp_name(&name.to_string_lossy()) else {
                continue;
            };
            let limit = if partial { self.retention * 2 } else { self.retention };
            let age = now.duration_since(created_at).unwrap_or_default();
            if age <= limit {
                continue;
            }
            if remove_if_exists(&entry.path())? {
                debug!("清理过期临时文件: {}", entry.path().display());
                removed += 1;
            }
        }

        Ok(removed)
    }
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_err(path)(e)),
    }
}
