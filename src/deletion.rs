//! 删除向量
//!
//! 一个 fragment 内已删除行的偏移集合（roaring bitmap）。
//! 文件：`_deletions/<fragment>-<read_version>-<uuid>.del`
//!
//! ```text
//! MAGIC "LDEL" | roaring bitmap (portable) | CRC32
//! ```
//!
//! 删除只增不减：新的删除文件总是包含旧文件的全部偏移。

use std::sync::Arc;
use roaring::RoaringBitmap;
use uuid::Uuid;
use crate::common::{FragmentId, LanceError, Result, VersionNumber};
use crate::format::{MetaReader, MetaWriter};
use crate::store::{self, ObjectStore};

const MAGIC: &[u8; 4] = b"LDEL";
pub const DELETIONS_DIR: &str = "_deletions";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeletionVector(RoaringBitmap);

impl DeletionVector {
    pub fn new() -> Self { Self::default() }

    pub fn from_offsets(offsets: impl IntoIterator<Item = u32>) -> Self {
        Self(offsets.into_iter().collect())
    }

    pub fn contains(&self, offset: u32) -> bool { self.0.contains(offset) }
    pub fn len(&self)      -> u64  { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn max(&self)      -> Option<u32> { self.0.max() }

    pub fn union_with(&mut self, other: &DeletionVector) {
        self.0 |= &other.0;
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ { self.0.iter() }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(self.0.serialized_size());
        self.0.serialize_into(&mut body)
            .map_err(|e| LanceError::invalid(format!("serializing deletion vector: {e}")))?;
        let mut w = MetaWriter::new();
        w.raw(MAGIC).raw(&body);
        Ok(w.finish_with_crc())
    }

    pub fn deserialize(data: &[u8], path: &str) -> Result<Self> {
        let mut r = MetaReader::with_crc(data, path)?;
        if r.take(MAGIC.len())? != MAGIC {
            return Err(LanceError::corrupt(path, "invalid deletion file magic"));
        }
        let body = r.take(r.remaining())?;
        RoaringBitmap::deserialize_from(body)
            .map(Self)
            .map_err(|e| LanceError::corrupt(path, e.to_string()))
    }
}

/// Manifest 中记录的删除文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionFile {
    /// 相对数据集根目录的路径
    pub path:         String,
    pub num_deleted:  u64,
    pub read_version: VersionNumber,
}

pub fn write_deletion_file(
    store:        &Arc<dyn ObjectStore>,
    base:         &str,
    fragment_id:  FragmentId,
    read_version: VersionNumber,
    dv:           &DeletionVector,
) -> Result<DeletionFile> {
    let path = format!("{DELETIONS_DIR}/{fragment_id}-{read_version}-{}.del", Uuid::new_v4());
    store.put(&store::join(base, &path), &dv.serialize()?)?;
    Ok(DeletionFile { path, num_deleted: dv.len(), read_version })
}

pub fn read_deletion_file(store: &Arc<dyn ObjectStore>, base: &str, file: &DeletionFile) -> Result<DeletionVector> {
    let full = store::join(base, &file.path);
    let data = store.get(&full)?;
    let dv = DeletionVector::deserialize(&data, &full)?;
    if dv.len() != file.num_deleted {
        return Err(LanceError::corrupt(&full, format!(
            "holds {} deletions, manifest says {}", dv.len(), file.num_deleted)));
    }
    Ok(dv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;

    #[test]
    fn file_round_trip_and_union() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let mut dv = DeletionVector::from_offsets([3, 7]);
        dv.union_with(&DeletionVector::from_offsets([7, 9]));
        let file = write_deletion_file(&store, "ds", 4, 2, &dv).unwrap();
        assert!(file.path.starts_with("_deletions/4-2-"));
        assert_eq!(file.num_deleted, 3);
        let back = read_deletion_file(&store, "ds", &file).unwrap();
        assert_eq!(back.iter().collect::<Vec<_>>(), vec![3, 7, 9]);
    }

    #[test]
    fn checksum_mismatch_is_corrupt() {
        let mut bytes = DeletionVector::from_offsets([1, 2, 3]).serialize().unwrap();
        bytes[5] ^= 1;
        let err = DeletionVector::deserialize(&bytes, "x.del").unwrap_err();
        assert!(matches!(err, LanceError::CorruptData { .. }));
    }
}
