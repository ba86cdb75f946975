//! 写入 / 提交 / 扫描参数
//!
//! 默认值可被环境变量覆盖（只在构造默认值时读取一次）：
//! - `LANCE_COMMIT_RETRIES`：提交竞争失败后的最大重试次数
//! - `LANCE_BATCH_SIZE`：扫描输出批次的行数

use log::warn;
use crate::field_type::{CompressionType, EncodingType};

pub const DEFAULT_MAX_ROWS_PER_FILE: usize = 1024 * 1024;
/// 每页最多容纳的行数
pub const DEFAULT_MAX_ROWS_PER_PAGE: usize = 1024;
pub const DEFAULT_COMMIT_RETRIES:    u32   = 20;
pub const DEFAULT_BATCH_SIZE:        usize = 1024;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(s) => match s.parse::<T>() {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to parse {key}={s}: {e}, using default");
                default
            }
        },
        Err(_) => default,
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// 页编码参数；`encoding = None` 时按缓冲区自动选择
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    pub compression: CompressionType,
    pub encoding:    Option<EncodingType>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self { compression: CompressionType::Lz4, encoding: None }
    }
}

impl CodecConfig {
    pub fn with_compression(mut self, comp: CompressionType) -> Self {
        self.compression = comp; self
    }
    pub fn with_encoding(mut self, enc: EncodingType) -> Self {
        self.encoding = Some(enc); self
    }
}

// ── Commit ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitConfig {
    /// 输掉 create-if-absent 竞争后最多重试的次数
    pub max_retries: u32,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self { max_retries: env_or("LANCE_COMMIT_RETRIES", DEFAULT_COMMIT_RETRIES) }
    }
}

impl CommitConfig {
    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n; self
    }
}

// ── Write ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// 新建数据集；已存在则报错
    Create,
    /// 追加新 fragment
    Append,
    /// 用新数据替换全部 fragment（不存在时等同 Create）
    Overwrite,
}

#[derive(Debug, Clone)]
pub struct WriteParams {
    pub mode:              WriteMode,
    pub max_rows_per_file: usize,
    pub max_rows_per_page: usize,
    pub codec:             CodecConfig,
    /// 记录进 manifest 的提交者
    pub author:            Option<String>,
    pub commit:            CommitConfig,
}

impl Default for WriteParams {
    fn default() -> Self {
        Self {
            mode:              WriteMode::Create,
            max_rows_per_file: DEFAULT_MAX_ROWS_PER_FILE,
            max_rows_per_page: DEFAULT_MAX_ROWS_PER_PAGE,
            codec:             CodecConfig::default(),
            author:            None,
            commit:            CommitConfig::default(),
        }
    }
}

impl WriteParams {
    pub fn with_mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode; self
    }
    pub fn with_max_rows_per_file(mut self, n: usize) -> Self {
        self.max_rows_per_file = n.max(1); self
    }
    pub fn with_max_rows_per_page(mut self, n: usize) -> Self {
        self.max_rows_per_page = n.max(1); self
    }
    pub fn with_codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec; self
    }
    pub fn with_author(mut self, author: &str) -> Self {
        self.author = Some(author.into()); self
    }
    pub fn with_commit(mut self, commit: CommitConfig) -> Self {
        self.commit = commit; self
    }
}

// ── Scan ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    /// 每个输出批次的最大行数
    pub batch_size: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self { batch_size: env_or("LANCE_BATCH_SIZE", DEFAULT_BATCH_SIZE).max(1) }
    }
}

impl ScanOptions {
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1); self
    }
}

// ── Compaction ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionOptions {
    /// 行数低于此值的 fragment 视为过小；重写后每个 fragment 至多这么多行
    pub target_rows_per_fragment: usize,
    /// 带删除的 fragment 也参与重写（物化删除）
    pub materialize_deletions:    bool,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        Self { target_rows_per_fragment: DEFAULT_MAX_ROWS_PER_FILE, materialize_deletions: true }
    }
}

impl CompactionOptions {
    pub fn with_target_rows_per_fragment(mut self, n: usize) -> Self {
        self.target_rows_per_fragment = n.max(1); self
    }
    pub fn with_materialize_deletions(mut self, yes: bool) -> Self {
        self.materialize_deletions = yes; self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_clamp_to_one() {
        let p = WriteParams::default().with_max_rows_per_page(0).with_max_rows_per_file(0);
        assert_eq!(p.max_rows_per_page, 1);
        assert_eq!(p.max_rows_per_file, 1);
        assert_eq!(p.mode, WriteMode::Create);
    }

    #[test]
    fn unparsable_env_falls_back() {
        assert_eq!(env_or("LANCE_TEST_UNSET_VARIABLE_XYZ", 7usize), 7);
    }
}
