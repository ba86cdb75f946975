//! 内存对象存储（测试 / 临时数据集）

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use parking_lot::RwLock;
use super::{check_range, ObjectStore, StoreError, StoreResult};

#[derive(Debug, Default, Clone)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<BTreeMap<String, Arc<Vec<u8>>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self { Self::default() }

    fn lookup(&self, path: &str) -> StoreResult<Arc<Vec<u8>>> {
        self.objects.read().get(path).cloned().ok_or_else(|| StoreError::NotFound(path.into()))
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put_if_absent(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        let mut objects = self.objects.write();
        if objects.contains_key(path) {
            return Err(StoreError::AlreadyExists(path.into()));
        }
        objects.insert(path.into(), Arc::new(data.to_vec()));
        Ok(())
    }

    fn put(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        self.objects.write().insert(path.into(), Arc::new(data.to_vec()));
        Ok(())
    }

    fn get(&self, path: &str) -> StoreResult<Vec<u8>> {
        Ok(self.lookup(path)?.as_ref().clone())
    }

    fn get_range(&self, path: &str, range: Range<u64>) -> StoreResult<Vec<u8>> {
        let data = self.lookup(path)?;
        check_range(path, &range, data.len() as u64)?;
        Ok(data[range.start as usize..range.end as usize].to_vec())
    }

    fn size(&self, path: &str) -> StoreResult<u64> {
        Ok(self.lookup(path)?.len() as u64)
    }

    fn list(&self, dir: &str) -> StoreResult<Vec<String>> {
        let prefix = match dir.trim_end_matches('/') {
            "" => String::new(),
            d  => format!("{d}/"),
        };
        Ok(self.objects.read()
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !k[prefix.len()..].contains('/'))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn delete(&self, path: &str) -> StoreResult<()> {
        self.objects.write().remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satisfies_store_contract() {
        super::super::tests::exercise_contract(&MemoryObjectStore::new());
    }

    #[test]
    fn clones_share_objects() {
        let a = MemoryObjectStore::new();
        let b = a.clone();
        a.put("x", b"1").unwrap();
        assert_eq!(b.get("x").unwrap(), b"1");
    }
}
