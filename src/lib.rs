//! # lance-storage-engine
//!
//! 带版本的列式数据集存储：列批次编码成数据文件，按 fragment 组织，
//! 每次提交发布一个不可变的 manifest 版本；读者固定在某个版本上，
//! 写者通过乐观并发提交竞争下一个版本号。
//!
//! ## 整体架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Dataset                              │
//! │   write / append / delete / add_columns / compact / restore   │
//! │        │                          │                           │
//! │   Transaction ──commit──► _versions/<N>.manifest              │
//! │   (OCC: put-if-absent，冲突检查，重定基)                       │
//! │        │                          │                           │
//! │   Scanner ──plan──► ScanPlan ──execute──► ScanStream          │
//! │   ├─ Predicate（三值逻辑，zone map 剪枝）                      │
//! │   └─ Index: BTree / Inverted / IVF_FLAT / IVF_PQ              │
//! │        │                                                      │
//! │   Fragment = 数据文件 × N + 删除文件                           │
//! │   ┌────────────────────────────────────────────────────┐      │
//! │   │  DataFile: 列 → 页（codec: encoding + LZ4）          │      │
//! │   │            每页 zone map（min / max / null 计数）     │      │
//! │   └────────────────────────────────────────────────────┘      │
//! │        │                                                      │
//! │   ObjectStore: LocalObjectStore / MemoryObjectStore           │
//! └──────────────────────────────────────────────────────────────┘
//! ```

// ── 基础类型 ──────────────────────────────────────────────────────────────────
pub mod common;
pub mod field_type;
pub mod schema;
pub mod array;
pub mod config;
pub mod format;

// ── 编解码 ────────────────────────────────────────────────────────────────────
pub mod encoding;
pub mod compression;
pub mod page;
pub mod codec;

// ── 存储 ──────────────────────────────────────────────────────────────────────
pub mod store;
pub mod data_file;
pub mod deletion;
pub mod fragment;

// ── 版本与提交 ────────────────────────────────────────────────────────────────
pub mod manifest;
pub mod transaction;
pub mod commit;

// ── 查询 ──────────────────────────────────────────────────────────────────────
pub mod index;
pub mod predicate;
pub mod scanner;
pub mod dataset;

pub use array::{Array, RecordBatch};
pub use common::{row_address, LanceError, Result, RowAddress, VersionNumber, VersionSpec};
pub use config::{CommitConfig, CompactionOptions, ScanOptions, WriteMode, WriteParams};
pub use dataset::{CleanupStats, CompactionMetrics, Dataset};
pub use field_type::{DataType, Field, Value};
pub use index::{IndexParams, MetricType, VectorIndexParams};
pub use predicate::Predicate;
pub use scanner::{ScanState, Scanner};
pub use schema::Schema;
pub use store::{LocalObjectStore, MemoryObjectStore, ObjectStore};
