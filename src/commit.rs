//! 乐观并发提交
//!
//! ```text
//! loop:
//!   latest ← 最新版本
//!   对 (已检查版本, latest] 中每个已提交事务做冲突检查 ── 冲突 → CommitConflict
//!   manifest ← build_manifest(latest)
//!   put_if_absent(_versions/<latest+1>.manifest)
//!     ├─ Ok             → 成功
//!     ├─ AlreadyExists  → 重试（超过 max_retries → CommitConflict）
//!     └─ 其他存储错误    → CommitIOError（不重试）
//! ```
//!
//! 发布前写出的数据 / 删除 / 索引文件对读者不可见；失败后它们只是
//! 未被引用的文件，由 `cleanup_old_versions` 回收。

use std::sync::Arc;
use log::{debug, info, warn};
use crate::common::{LanceError, Result, VersionNumber};
use crate::config::CommitConfig;
use crate::manifest::{self, Manifest};
use crate::store::{ObjectStore, StoreError};
use crate::transaction::Transaction;

#[derive(Debug, Clone)]
pub struct CommitResult {
    pub manifest: Manifest,
    /// 输掉 create-if-absent 竞争的次数
    pub retries:  u32,
}

fn check_conflicts(
    store:   &Arc<dyn ObjectStore>,
    base:    &str,
    txn:     &Transaction,
    range:   std::ops::RangeInclusive<VersionNumber>,
    latest:  &Manifest,
) -> Result<()> {
    for v in range {
        let committed = if v == latest.version {
            latest.transaction.clone()
        } else {
            match manifest::read_manifest(store, base, v.into()) {
                Ok(m) => m.transaction,
                Err(LanceError::VersionNotFound(_)) => return Err(LanceError::CommitConflict {
                    version: v,
                    message: "intervening version was cleaned up before it could be checked".into(),
                }),
                Err(e) => return Err(e),
            }
        };
        if let Some(reason) = txn.conflicts_with(&committed) {
            warn!("{} based on v{} conflicts with v{v}: {reason}", txn.operation.kind(), txn.read_version);
            return Err(LanceError::CommitConflict { version: v, message: reason });
        }
    }
    Ok(())
}

/// 提交事务，返回新发布的 manifest
pub fn commit_transaction(
    store:  &Arc<dyn ObjectStore>,
    base:   &str,
    txn:    &Transaction,
    config: &CommitConfig,
) -> Result<CommitResult> {
    let mut checked_up_to = txn.read_version;
    let mut retries = 0u32;

    loop {
        let parent = match manifest::latest_version(store, base)? {
            Some(v) => Some(manifest::read_manifest(store, base, v.into())?),
            None    => None,
        };
        if let Some(p) = &parent {
            if p.version > checked_up_to {
                check_conflicts(store, base, txn, checked_up_to + 1..=p.version, p)?;
                checked_up_to = p.version;
            }
        }

        let manifest = txn.build_manifest(parent.as_ref())?;
        match manifest::write_manifest(store, base, &manifest) {
            Ok(()) => {
                info!("committed {} as v{} (read v{}, {retries} retries)",
                      txn.operation.kind(), manifest.version, txn.read_version);
                return Ok(CommitResult { manifest, retries });
            }
            Err(StoreError::AlreadyExists(_)) => {
                retries += 1;
                if retries > config.max_retries {
                    return Err(LanceError::CommitConflict {
                        version: manifest.version,
                        message: format!("lost the race for a version slot {retries} times"),
                    });
                }
                debug!("v{} was taken by a concurrent writer, retrying ({retries}/{})",
                       manifest.version, config.max_retries);
            }
            Err(e) => {
                return Err(LanceError::CommitIOError { version: manifest.version, message: e.to_string() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::VersionSpec;
    use crate::field_type::{DataType, Field};
    use crate::fragment::{DataFile, Fragment};
    use crate::schema::Schema;
    use crate::store::{MemoryObjectStore, StoreResult};
    use crate::transaction::Operation;

    fn frag() -> Fragment {
        Fragment { id: 0, physical_rows: 1, files: vec![DataFile { path: "data/x".into(), field_ids: vec![0] }], deletion_file: None }
    }

    fn create(store: &Arc<dyn ObjectStore>) {
        let schema = Schema::new(vec![Field::new("id", DataType::Int32, false)]).unwrap();
        let txn = Transaction::new(0, Operation::Overwrite { fragments: vec![frag()], schema });
        commit_transaction(store, "", &txn, &CommitConfig::default()).unwrap();
    }

    #[test]
    fn stale_append_is_retargeted() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        create(&store);
        let a = Transaction::new(1, Operation::Append { fragments: vec![frag()] });
        let b = Transaction::new(1, Operation::Append { fragments: vec![frag()] });
        commit_transaction(&store, "", &a, &CommitConfig::default()).unwrap();
        let res = commit_transaction(&store, "", &b, &CommitConfig::default()).unwrap();
        assert_eq!(res.manifest.version, 3);
        assert_eq!(res.manifest.fragments.len(), 3);
        assert_eq!(manifest::list_versions(&store, "").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn semantic_conflict_names_the_version() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        create(&store);
        let schema = manifest::read_manifest(&store, "", VersionSpec::Latest).unwrap().schema;
        let a = Transaction::new(1, Operation::Project { schema: schema.rename_field("id", "a").unwrap() });
        let b = Transaction::new(1, Operation::Project { schema: schema.rename_field("id", "b").unwrap() });
        commit_transaction(&store, "", &a, &CommitConfig::default()).unwrap();
        match commit_transaction(&store, "", &b, &CommitConfig::default()) {
            Err(LanceError::CommitConflict { version, .. }) => assert_eq!(version, 2),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    /// 发布总是报“已存在”的存储
    #[derive(Debug)]
    struct AlwaysTaken(MemoryObjectStore);

    impl ObjectStore for AlwaysTaken {
        fn put_if_absent(&self, path: &str, _: &[u8]) -> StoreResult<()> { Err(StoreError::AlreadyExists(path.into())) }
        fn put(&self, path: &str, data: &[u8]) -> StoreResult<()> { self.0.put(path, data) }
        fn get(&self, path: &str) -> StoreResult<Vec<u8>> { self.0.get(path) }
        fn get_range(&self, path: &str, r: std::ops::Range<u64>) -> StoreResult<Vec<u8>> { self.0.get_range(path, r) }
        fn size(&self, path: &str) -> StoreResult<u64> { self.0.size(path) }
        fn list(&self, dir: &str) -> StoreResult<Vec<String>> { self.0.list(dir) }
        fn delete(&self, path: &str) -> StoreResult<()> { self.0.delete(path) }
    }

    #[test]
    fn bounded_retries_end_in_conflict() {
        let store: Arc<dyn ObjectStore> = Arc::new(AlwaysTaken(MemoryObjectStore::new()));
        let schema = Schema::new(vec![Field::new("id", DataType::Int32, false)]).unwrap();
        let txn = Transaction::new(0, Operation::Overwrite { fragments: vec![], schema });
        let err = commit_transaction(&store, "", &txn, &CommitConfig::default().with_max_retries(3)).unwrap_err();
        assert!(matches!(err, LanceError::CommitConflict { version: 1, .. }));
    }
}
