//! 对象存储抽象
//!
//! 路径统一为 `/` 分隔的相对路径。唯一需要原子语义的操作是
//! `put_if_absent`：提交协议用它在 `_versions/<N>.manifest` 上做 CAS。

pub mod local;
pub mod memory;

pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;

use std::ops::Range;
use thiserror::Error;
use crate::common::LanceError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    /// `put_if_absent` 的目标已存在
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for LanceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(path)      => LanceError::Io { path, message: "not found".into() },
            StoreError::AlreadyExists(path) => LanceError::Io { path, message: "already exists".into() },
            StoreError::Io { path, message } => LanceError::Io { path, message },
        }
    }
}

pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// 原子地“不存在才创建”；已存在返回 `AlreadyExists`，且不改变原对象
    fn put_if_absent(&self, path: &str, data: &[u8]) -> StoreResult<()>;

    /// 覆盖写（对读者原子可见）
    fn put(&self, path: &str, data: &[u8]) -> StoreResult<()>;

    fn get(&self, path: &str) -> StoreResult<Vec<u8>>;

    fn get_range(&self, path: &str, range: Range<u64>) -> StoreResult<Vec<u8>>;

    fn size(&self, path: &str) -> StoreResult<u64>;

    /// 列出目录 `dir` 下（非递归）的对象完整路径，按字典序
    fn list(&self, dir: &str) -> StoreResult<Vec<String>>;

    /// 删除对象；不存在视为成功
    fn delete(&self, path: &str) -> StoreResult<()>;

    fn exists(&self, path: &str) -> StoreResult<bool> {
        match self.size(path) {
            Ok(_)                        => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e)                       => Err(e),
        }
    }
}

/// 拼接相对路径，忽略空段
pub fn join(base: &str, rel: &str) -> String {
    match (base.trim_end_matches('/'), rel.trim_start_matches('/')) {
        ("", r) => r.to_string(),
        (b, "") => b.to_string(),
        (b, r)  => format!("{b}/{r}"),
    }
}

/// 路径最后一段
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn check_range(path: &str, range: &Range<u64>, size: u64) -> StoreResult<()> {
    if range.start > range.end || range.end > size {
        return Err(StoreError::Io {
            path:    path.into(),
            message: format!("range {}..{} outside object of {size} bytes", range.start, range.end),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_skips_empty_segments() {
        assert_eq!(join("", "_versions/1.manifest"), "_versions/1.manifest");
        assert_eq!(join("ds/", "/data"), "ds/data");
        assert_eq!(join("ds", ""), "ds");
        assert_eq!(file_name("ds/data/x.lance"), "x.lance");
    }

    /// 两种实现共享的契约测试
    pub(crate) fn exercise_contract(store: &dyn ObjectStore) {
        store.put_if_absent("d/a", b"one").unwrap();
        assert_eq!(store.put_if_absent("d/a", b"two"), Err(StoreError::AlreadyExists("d/a".into())));
        assert_eq!(store.get("d/a").unwrap(), b"one");

        store.put("d/b", b"0123456789").unwrap();
        assert_eq!(store.get_range("d/b", 2..5).unwrap(), b"234");
        assert!(store.get_range("d/b", 8..12).is_err());
        assert_eq!(store.size("d/b").unwrap(), 10);

        store.put("d/sub/c", b"x").unwrap();
        assert_eq!(store.list("d").unwrap(), vec!["d/a".to_string(), "d/b".to_string()]);
        assert!(store.list("missing").unwrap().is_empty());

        assert!(matches!(store.get("d/zzz"), Err(StoreError::NotFound(_))));
        store.delete("d/a").unwrap();
        store.delete("d/a").unwrap();
        assert!(!store.exists("d/a").unwrap());
        assert!(store.exists("d/b").unwrap());
    }
}
