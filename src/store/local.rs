//! 本地文件系统对象存储
//!
//! `put_if_absent` = 写临时文件 + `hard_link`：目标已存在时 link 失败，
//! 同一目录下的并发提交者之间只有一个能成功。

use std::fs::{self, File};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use log::debug;
use uuid::Uuid;
use super::{check_range, ObjectStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    pub fn root(&self) -> &Path { &self.root }

    fn full(&self, path: &str) -> PathBuf {
        path.split('/').filter(|s| !s.is_empty()).fold(self.root.clone(), |p, s| p.join(s))
    }

    fn io_err(path: &str, e: std::io::Error) -> StoreError {
        match e.kind() {
            ErrorKind::NotFound      => StoreError::NotFound(path.into()),
            ErrorKind::AlreadyExists => StoreError::AlreadyExists(path.into()),
            _ => StoreError::Io { path: path.into(), message: e.to_string() },
        }
    }

    /// 在目标同目录写出临时文件并 fsync
    fn write_temp(&self, path: &str, data: &[u8]) -> StoreResult<PathBuf> {
        let target = self.full(path);
        let dir = target.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| Self::io_err(path, e))?;
        let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut f = File::create(&tmp).map_err(|e| Self::io_err(path, e))?;
        f.write_all(data).map_err(|e| Self::io_err(path, e))?;
        f.sync_all().map_err(|e| Self::io_err(path, e))?;
        Ok(tmp)
    }
}

impl ObjectStore for LocalObjectStore {
    fn put_if_absent(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        let tmp = self.write_temp(path, data)?;
        let res = fs::hard_link(&tmp, self.full(path)).map_err(|e| Self::io_err(path, e));
        if let Err(e) = fs::remove_file(&tmp) {
            debug!("failed to remove temp file {}: {e}", tmp.display());
        }
        res
    }

    fn put(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        let tmp = self.write_temp(path, data)?;
        fs::rename(&tmp, self.full(path)).map_err(|e| Self::io_err(path, e))
    }

    fn get(&self, path: &str) -> StoreResult<Vec<u8>> {
        fs::read(self.full(path)).map_err(|e| Self::io_err(path, e))
    }

    fn get_range(&self, path: &str, range: Range<u64>) -> StoreResult<Vec<u8>> {
        let mut f = File::open(self.full(path)).map_err(|e| Self::io_err(path, e))?;
        let size = f.metadata().map_err(|e| Self::io_err(path, e))?.len();
        check_range(path, &range, size)?;
        f.seek(SeekFrom::Start(range.start)).map_err(|e| Self::io_err(path, e))?;
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        f.read_exact(&mut buf).map_err(|e| Self::io_err(path, e))?;
        Ok(buf)
    }

    fn size(&self, path: &str) -> StoreResult<u64> {
        let meta = fs::metadata(self.full(path)).map_err(|e| Self::io_err(path, e))?;
        if !meta.is_file() {
            return Err(StoreError::NotFound(path.into()));
        }
        Ok(meta.len())
    }

    fn list(&self, dir: &str) -> StoreResult<Vec<String>> {
        let entries = match fs::read_dir(self.full(dir)) {
            Ok(it) => it,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_err(dir, e)),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Self::io_err(dir, e))?;
            let is_file = entry.file_type().map_err(|e| Self::io_err(dir, e))?.is_file();
            let name = entry.file_name().to_string_lossy().into_owned();
            // 跳过写入中的临时文件
            if is_file && !name.starts_with('.') {
                out.push(super::join(dir, &name));
            }
        }
        out.sort();
        Ok(out)
    }

    fn delete(&self, path: &str) -> StoreResult<()> {
        match fs::remove_file(self.full(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(path, e)),
        }
    }
}
