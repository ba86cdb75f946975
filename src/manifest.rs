//! Manifest：数据集某个版本的完整快照
//!
//! 路径：`<root>/_versions/<N>.manifest`，N 从 1 开始连续递增。
//! Manifest 一经写出不再修改；只有 `cleanup_old_versions` 会删除旧版本。
//!
//! ```text
//! MAGIC "LMAN" | format (u32)
//! version | prev_version | timestamp | tag
//! schema
//! max_fragment_id
//! fragments  [id, physical_rows, files[path, field_ids], deletion?]
//! indices    [IndexMetadata]
//! transaction[uuid, read_version, kind, author, modified ids, flags]
//! CRC32
//! ```

use std::sync::Arc;
use log::debug;
use crate::common::{FragmentId, LanceError, Result, VersionNumber, VersionSpec};
use crate::deletion::DeletionFile;
use crate::format::{MetaReader, MetaWriter};
use crate::fragment::{DataFile, Fragment};
use crate::index::IndexMetadata;
use crate::schema::Schema;
use crate::store::{self, ObjectStore, StoreError, StoreResult};
use crate::transaction::{OperationKind, Transaction};

const MAGIC: &[u8; 4] = b"LMAN";
const FORMAT_VERSION: u32 = 1;
pub const VERSIONS_DIR: &str = "_versions";
const SUFFIX: &str = ".manifest";

/// 生成该版本的提交信息（用于冲突检测）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionMeta {
    pub uuid:                  String,
    pub read_version:          VersionNumber,
    pub kind:                  OperationKind,
    pub author:                Option<String>,
    /// 被修改（删除行 / 重写 / 合并列）的已有 fragment
    pub modified_fragment_ids: Vec<FragmentId>,
    /// 替换了全部 fragment（Overwrite / Restore）
    pub replaces_all:          bool,
    pub schema_changed:        bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub version:         VersionNumber,
    /// 0 表示没有前驱
    pub prev_version:    VersionNumber,
    pub schema:          Schema,
    pub fragments:       Arc<Vec<Fragment>>,
    pub indices:         Vec<IndexMetadata>,
    /// 历史上分配过的最大 fragment id；只增不减
    pub max_fragment_id: Option<FragmentId>,
    pub timestamp:       u64,
    pub transaction:     TransactionMeta,
    pub tag:             Option<String>,
}

impl Manifest {
    pub fn fragment(&self, id: FragmentId) -> Option<&Fragment> {
        self.fragments.iter().find(|f| f.id == id)
    }

    /// 可见行数
    pub fn num_rows(&self) -> u64 {
        self.fragments.iter().map(Fragment::num_rows).sum()
    }

    pub fn index(&self, name: &str) -> Option<&IndexMetadata> {
        self.indices.iter().find(|i| i.name == name)
    }

    // ── 序列化 ────────────────────────────────────────────────────────────────

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = MetaWriter::new();
        w.raw(MAGIC).u32(FORMAT_VERSION)
            .u64(self.version).u64(self.prev_version).u64(self.timestamp)
            .opt_str(self.tag.as_deref())
            .schema(&self.schema);
        match self.max_fragment_id {
            Some(id) => w.u8(1).u64(id),
            None     => w.u8(0),
        };

        w.u32(self.fragments.len() as u32);
        for f in self.fragments.iter() {
            w.u64(f.id).u64(f.physical_rows).u32(f.files.len() as u32);
            for file in &f.files {
                w.str(&file.path).u32(file.field_ids.len() as u32);
                for id in &file.field_ids { w.i32(*id); }
            }
            match &f.deletion_file {
                Some(d) => w.u8(1).str(&d.path).u64(d.num_deleted).u64(d.read_version),
                None    => w.u8(0),
            };
        }

        w.u32(self.indices.len() as u32);
        for idx in &self.indices {
            idx.write_to(&mut w);
        }

        let t = &self.transaction;
        w.str(&t.uuid).u64(t.read_version).u8(t.kind.tag()).opt_str(t.author.as_deref())
            .u64_slice(&t.modified_fragment_ids)
            .bool(t.replaces_all).bool(t.schema_changed);
        w.finish_with_crc()
    }

    pub fn deserialize(data: &[u8], location: &str) -> Result<Self> {
        let mut r = MetaReader::with_crc(data, location)?;
        if r.take(4)? != MAGIC {
            return Err(LanceError::corrupt(location, "invalid manifest magic"));
        }
        let format = r.u32()?;
        if format != FORMAT_VERSION {
            return Err(LanceError::corrupt(location, format!("unsupported manifest format {format}")));
        }
        let version      = r.u64()?;
        let prev_version = r.u64()?;
        let timestamp    = r.u64()?;
        let tag          = r.opt_str()?;
        let schema       = r.schema()?;
        let max_fragment_id = match r.u8()? {
            0 => None,
            _ => Some(r.u64()?),
        };

        let n_frags = r.len_prefix(21)?;
        let mut fragments = Vec::with_capacity(n_frags);
        for _ in 0..n_frags {
            let id            = r.u64()?;
            let physical_rows = r.u64()?;
            let n_files       = r.len_prefix(8)?;
            let mut files = Vec::with_capacity(n_files);
            for _ in 0..n_files {
                let path = r.str()?;
                let n_ids = r.len_prefix(4)?;
                let field_ids = (0..n_ids).map(|_| r.i32()).collect::<Result<Vec<_>>>()?;
                files.push(DataFile { path, field_ids });
            }
            let deletion_file = match r.u8()? {
                0 => None,
                _ => Some(DeletionFile { path: r.str()?, num_deleted: r.u64()?, read_version: r.u64()? }),
            };
            if deletion_file.as_ref().is_some_and(|d| d.num_deleted > physical_rows) {
                return Err(LanceError::corrupt(location, format!("fragment {id} deletes more rows than it has")));
            }
            fragments.push(Fragment { id, physical_rows, files, deletion_file });
        }

        let n_idx = r.len_prefix(1)?;
        let indices = (0..n_idx).map(|_| IndexMetadata::read_from(&mut r)).collect::<Result<Vec<_>>>()?;

        let uuid         = r.str()?;
        let read_version = r.u64()?;
        let kind_tag     = r.u8()?;
        let kind = OperationKind::from_tag(kind_tag)
            .ok_or_else(|| LanceError::corrupt(location, format!("unknown operation tag {kind_tag}")))?;
        let author = r.opt_str()?;
        let modified_fragment_ids = r.u64_vec()?;
        let replaces_all   = r.bool()?;
        let schema_changed = r.bool()?;
        r.finish()?;

        Ok(Self {
            version, prev_version, schema,
            fragments: Arc::new(fragments),
            indices, max_fragment_id, timestamp,
            transaction: TransactionMeta {
                uuid, read_version, kind, author, modified_fragment_ids, replaces_all, schema_changed,
            },
            tag,
        })
    }
}

/// 由父版本和事务推导下一版本（纯函数，不做 I/O）
pub fn append_version(parent: Option<&Manifest>, transaction: &Transaction) -> Result<Manifest> {
    transaction.build_manifest(parent)
}

// ── 读写 ──────────────────────────────────────────────────────────────────────

pub fn manifest_path(base: &str, version: VersionNumber) -> String {
    store::join(base, &format!("{VERSIONS_DIR}/{version}{SUFFIX}"))
}

/// 以 put-if-absent 发布；目标已存在返回 `StoreError::AlreadyExists`
pub fn write_manifest(store: &Arc<dyn ObjectStore>, base: &str, manifest: &Manifest) -> StoreResult<()> {
    store.put_if_absent(&manifest_path(base, manifest.version), &manifest.serialize())
}

/// 已存在的全部版本号（升序）
pub fn list_versions(store: &Arc<dyn ObjectStore>, base: &str) -> Result<Vec<VersionNumber>> {
    let mut versions: Vec<VersionNumber> = store.list(&store::join(base, VERSIONS_DIR))?
        .iter()
        .filter_map(|p| store::file_name(p).strip_suffix(SUFFIX)?.parse().ok())
        .collect();
    versions.sort_unstable();
    Ok(versions)
}

pub fn latest_version(store: &Arc<dyn ObjectStore>, base: &str) -> Result<Option<VersionNumber>> {
    Ok(list_versions(store, base)?.last().copied())
}

pub fn read_manifest(store: &Arc<dyn ObjectStore>, base: &str, spec: VersionSpec) -> Result<Manifest> {
    let version = match spec {
        VersionSpec::Number(v) => v,
        VersionSpec::Latest    => latest_version(store, base)?.ok_or(LanceError::VersionNotFound(spec))?,
    };
    let path = manifest_path(base, version);
    let data = match store.get(&path) {
        Ok(d) => d,
        Err(StoreError::NotFound(_)) => return Err(LanceError::VersionNotFound(VersionSpec::Number(version))),
        Err(e) => return Err(e.into()),
    };
    let manifest = Manifest::deserialize(&data, &path)?;
    if manifest.version != version {
        return Err(LanceError::corrupt(&path, format!("file holds version {}", manifest.version)));
    }
    debug!("loaded manifest v{version}: {} fragments", manifest.fragments.len());
    Ok(manifest)
}

/// `list_versions` 的摘要信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub version:   VersionNumber,
    pub timestamp: u64,
    pub operation: OperationKind,
    pub author:    Option<String>,
    pub tag:       Option<String>,
}

impl From<&Manifest> for VersionInfo {
    fn from(m: &Manifest) -> Self {
        Self {
            version:   m.version,
            timestamp: m.timestamp,
            operation: m.transaction.kind,
            author:    m.transaction.author.clone(),
            tag:       m.tag.clone(),
        }
    }
}
