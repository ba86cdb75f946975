//! 全局基础类型与错误定义

use thiserror::Error;

// ── ID 类型别名 ───────────────────────────────────────────────────────────────

/// Manifest 版本号，从 1 开始单调递增
pub type VersionNumber = u64;
pub type FragmentId    = u64;
/// Schema 内稳定的列标识（rename / drop 不改变）
pub type FieldId       = i32;
/// 行地址：`(fragment_id << 32) | row_offset`
pub type RowAddress    = u64;

// ── 行地址 ────────────────────────────────────────────────────────────────────

pub fn row_address(fragment_id: FragmentId, offset: u32) -> RowAddress {
    (fragment_id << 32) | offset as u64
}

pub fn fragment_of(addr: RowAddress) -> FragmentId { addr >> 32 }

pub fn offset_of(addr: RowAddress) -> u32 { (addr & 0xFFFF_FFFF) as u32 }

// ── 版本选择 ──────────────────────────────────────────────────────────────────

/// `read_manifest` 的目标：指定版本或当前最新
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSpec {
    Latest,
    Number(VersionNumber),
}

impl From<VersionNumber> for VersionSpec {
    fn from(v: VersionNumber) -> Self { Self::Number(v) }
}

impl std::fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Latest    => write!(f, "latest"),
            Self::Number(v) => write!(f, "{v}"),
        }
    }
}

// ── 错误 ──────────────────────────────────────────────────────────────────────
//
// 重试策略：
//   • CommitConflict / CommitIOError 只由 commit 循环内部处理
//   • 其余错误一律立即返回给调用方

#[derive(Debug, Error)]
pub enum LanceError {
    /// 校验和 / 格式错误，不重试
    #[error("corrupt data in {location}: {message}")]
    CorruptData { location: String, message: String },

    /// 调用方给出了引擎不支持的类型组合
    #[error("unsupported schema for column `{column}`: {message}")]
    UnsupportedSchema { column: String, message: String },

    #[error("fragment {fragment_id} unavailable ({path}): {message}")]
    FragmentUnavailable { fragment_id: FragmentId, path: String, message: String },

    #[error("commit conflict at version {version}: {message}")]
    CommitConflict { version: VersionNumber, message: String },

    /// 原子发布阶段存储失败；发布前无任何可见状态，调用方可安全重试
    #[error("commit I/O error publishing version {version}: {message}")]
    CommitIOError { version: VersionNumber, message: String },

    #[error("version {0} not found")]
    VersionNotFound(VersionSpec),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("dataset already exists at {0}")]
    DatasetAlreadyExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },
}

impl LanceError {
    pub fn corrupt(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CorruptData { location: location.into(), message: message.into() }
    }

    pub fn unsupported(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnsupportedSchema { column: column.into(), message: message.into() }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// 给 CorruptData 补充定位信息（列名 / 文件路径）
    pub fn within(self, location: &str) -> Self {
        match self {
            Self::CorruptData { location: inner, message } =>
                Self::CorruptData { location: format!("{location}/{inner}"), message },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, LanceError>;

/// 当前时间（毫秒）
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_address_round_trip() {
        let addr = row_address(7, 42);
        assert_eq!(fragment_of(addr), 7);
        assert_eq!(offset_of(addr), 42);
        assert!(row_address(1, 0) > row_address(0, u32::MAX));
    }

    #[test]
    fn corrupt_data_gets_location_prefix() {
        let err = LanceError::corrupt("page", "bad crc").within("col `id`");
        assert_eq!(err.to_string(), "corrupt data in col `id`/page: bad crc");
    }
}
