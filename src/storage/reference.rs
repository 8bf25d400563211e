use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{Result, StorageError, StorageManager, io_err};
use crate::model::Embedding;
use crate::utils::{extension_for, write_atomic};

/// 已入库的参考图
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    /// 图片内容 blake3 哈希的前 16 字节
    pub id: String,
    pub path: PathBuf,
    pub label: String,
    pub ingredients: Vec<String>,
    pub original_name: Option<String>,
    pub content_type: String,
    pub embedding: Embedding,
    pub created_at: DateTime<Utc>,
}

/// 参考图元数据，保存在 `<id>.json`
#[derive(Debug, Serialize, Deserialize)]
struct ReferenceRecord {
    id: String,
    file_name: String,
    label: String,
    #[serde(default)]
    ingredients: Vec<String>,
    #[serde(default)]
    original_name: Option<String>,
    content_type: String,
    embedding: Embedding,
    created_at: DateTime<Utc>,
}

impl ReferenceRecord {
    fn into_reference(self, dir: &Path) -> ReferenceImage {
        ReferenceImage {
            path: dir.join(&self.file_name),
            id: self.id,
            label: self.label,
            ingredients: self.ingredients,
            original_name: self.original_name,
            content_type: self.content_type,
            embedding: self.embedding,
            created_at: self.created_at,
        }
    }
}

/// 新参考图的描述信息
#[derive(Debug, Clone, Default)]
pub struct ReferenceMeta {
    pub label: String,
    pub ingredients: Vec<String>,
    pub original_name: Option<String>,
    pub content_type: String,
}

/// 由图片内容计算参考图 ID
pub fn reference_id(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    hash.to_hex()[..32].to_string()
}

fn is_valid_id(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

impl StorageManager {
    fn sidecar(&self, id: &str) -> PathBuf {
        self.references.join(format!("{id}.json"))
    }

    /// 保存参考图，内容相同的图片已存在时返回 [`StorageError::DuplicateReference`]，此时存储不变
    pub fn save_reference(
        &self,
        data: &[u8],
        meta: ReferenceMeta,
        embedding: Embedding,
    ) -> Result<ReferenceImage> {
        let id = reference_id(data);
        let sidecar = self.sidecar(&id);
        let file_name = format!("{}.{}", id, extension_for(&meta.content_type));
        let image_path = self.references.join(&file_name);

        let _lock = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        if sidecar.exists() {
            return Err(StorageError::DuplicateReference { id });
        }

        write_atomic(&image_path, data).map_err(io_err(&image_path))?;

        let record = ReferenceRecord {
            id: id.clone(),
            file_name,
            label: meta.label,
            ingredients: meta.ingredients,
            original_name: meta.original_name,
            content_type: meta.content_type,
            embedding,
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&record).map_err(|e| StorageError::CorruptStore {
            path: sidecar.clone(),
            reason: e.to_string(),
        })?;
        // 元数据最后写入，扫描只认元数据，因此读者不会看到半成品
        if let Err(e) = write_atomic(&sidecar, &json) {
            let _ = fs::remove_file(&image_path);
            return Err(io_err(&sidecar)(e));
        }

        info!("添加参考图: {} ({})", id, record.label);
        Ok(record.into_reference(&self.references))
    }

    /// 读取单张参考图的元数据
    pub fn get_reference(&self, id: &str) -> Result<ReferenceImage> {
        if !is_valid_id(id) {
            return Err(StorageError::NotFound { id: id.to_string() });
        }
        let sidecar = self.sidecar(id);
        if !sidecar.exists() {
            return Err(StorageError::NotFound { id: id.to_string() });
        }
        read_record(&sidecar).map(|r| r.into_reference(&self.references))
    }

    /// 删除参考图
    pub fn delete_reference(&self, id: &str) -> Result<ReferenceImage> {
        let _lock = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let reference = self.get_reference(id)?;
        let sidecar = self.sidecar(id);
        fs::remove_file(&sidecar).map_err(io_err(&sidecar))?;
        if let Err(e) = fs::remove_file(&reference.path) {
            warn!("删除参考图文件 {} 失败: {}", reference.path.display(), e);
        }
        info!("删除参考图: {} ({})", id, reference.label);
        Ok(reference)
    }

    /// 找出某个类别的全部元数据文件，损坏的条目跳过
    fn records_with_label(&self, label: &str) -> Result<Vec<(PathBuf, ReferenceRecord)>> {
        let entries = fs::read_dir(&self.references).map_err(io_err(&self.references))?;
        let mut records = vec![];
        for entry in entries {
            let path = entry.map_err(io_err(&self.references))?.path();
            let hidden = path.file_name().is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if hidden || path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match read_record(&path) {
                Ok(record) if record.label == label => records.push((path, record)),
                Ok(_) => {}
                Err(e) => warn!("跳过参考图: {e}"),
            }
        }
        if records.is_empty() {
            return Err(StorageError::LabelNotFound { label: label.to_string() });
        }
        records.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at).then_with(|| a.1.id.cmp(&b.1.id)));
        Ok(records)
    }

    /// 删除某个类别的全部参考图
    pub fn delete_label(&self, label: &str) -> Result<Vec<ReferenceImage>> {
        let _lock = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let records = self.records_with_label(label)?;
        let mut deleted = Vec::with_capacity(records.len());
        for (sidecar, record) in records {
            fs::remove_file(&sidecar).map_err(io_err(&sidecar))?;
            let reference = record.into_reference(&self.references);
            if let Err(e) = fs::remove_file(&reference.path) {
                warn!("删除参考图文件 {} 失败: {}", reference.path.display(), e);
            }
            deleted.push(reference);
        }
        info!("删除类别 {label} 的 {} 张参考图", deleted.len());
        Ok(deleted)
    }

    /// 替换某个类别全部参考图的配料表
    pub fn update_ingredients(&self, label: &str, ingredients: Vec<String>) -> Result<Vec<ReferenceImage>> {
        let _lock = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let records = self.records_with_label(label)?;
        let mut updated = Vec::with_capacity(records.len());
        for (sidecar, mut record) in records {
            record.ingredients = ingredients.clone();
            let json = serde_json::to_vec_pretty(&record).map_err(|e| StorageError::CorruptStore {
                path: sidecar.clone(),
                reason: e.to_string(),
            })?;
            write_atomic(&sidecar, &json).map_err(io_err(&sidecar))?;
            updated.push(record.into_reference(&self.references));
        }
        info!("更新类别 {label} 的配料: {} 张参考图", updated.len());
        Ok(updated)
    }

    /// 读取参考图原始内容
    pub fn read_reference_image(&self, reference: &ReferenceImage) -> Result<Vec<u8>> {
        fs::read(&reference.path).map_err(io_err(&reference.path))
    }

    /// 逐个扫描参考图元数据，每次调用都会重新读取目录
    pub fn scan_references(&self) -> Result<ReferenceScan> {
        let entries = fs::read_dir(&self.references).map_err(io_err(&self.references))?;
        Ok(ReferenceScan { dir: self.references.clone(), entries })
    }

    /// 加载所有参考图，损坏的条目会被记录并跳过
    pub fn load_all_references(&self) -> Result<References> {
        Ok(References { scan: self.scan_references()?, skipped: 0 })
    }
}

fn read_record(path: &Path) -> Result<ReferenceRecord> {
    let data = fs::read(path).map_err(io_err(path))?;
    let record: ReferenceRecord = serde_json::from_slice(&data).map_err(|e| {
        StorageError::CorruptStore { path: path.to_path_buf(), reason: e.to_string() }
    })?;
    let values = &record.embedding.values;
    if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
        return Err(StorageError::CorruptStore {
            path: path.to_path_buf(),
            reason: "嵌入向量为空或包含非法数值".to_string(),
        });
    }
    Ok(record)
}

/// 参考图扫描器，损坏的条目以 [`StorageError::CorruptStore`] 返回
pub struct ReferenceScan {
    dir: PathBuf,
    entries: fs::ReadDir,
}

impl Iterator for ReferenceScan {
    type Item = Result<ReferenceImage>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(io_err(&self.dir)(e))),
            };
            let path = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if hidden || path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            return Some(read_record(&path).map(|r| r.into_reference(&self.dir)));
        }
    }
}

/// 跳过损坏条目的参考图迭代器
pub struct References {
    scan: ReferenceScan,
    skipped: usize,
}

impl References {
    /// 已跳过的损坏条目数量
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for References {
    type Item = ReferenceImage;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.scan.next()? {
                Ok(reference) => {
                    debug!("加载参考图: {} ({})", reference.id, reference.label);
                    return Some(reference);
                }
                Err(e) => {
                    warn!("跳过参考图: {e}");
                    self.skipped += 1;
                }
            }
        }
    }
}
