//! 事务：一次可重试的数据集变更
//!
//! 事务只描述“相对读取版本做了什么”，不依赖具体的父 manifest；
//! 提交时若最新版本已前进，先用 `conflicts_with` 检查与期间每个
//! 已提交事务是否冲突，不冲突则在新的父版本上重新 `build_manifest`。
//!
//! 冲突判定（粒度为 fragment）：
//!   • 双方都修改 schema                     → 冲突
//!   • 对方替换了全部 fragment，且己方不是    → 冲突
//!   • 双方修改的已有 fragment 集合相交       → 冲突
//!   • Merge 与 Append（任意先后）            → 冲突
//!   • CreateIndex 遇到对方修改 schema        → 冲突
//!   • 其余情况                               → 在新版本上重放

use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;
use crate::common::{now_millis, FragmentId, LanceError, Result, VersionNumber};
use crate::fragment::Fragment;
use crate::index::IndexMetadata;
use crate::manifest::{Manifest, TransactionMeta};
use crate::schema::Schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Append,
    Delete,
    Overwrite,
    CreateIndex,
    Rewrite,
    Merge,
    Project,
    Restore,
}

impl OperationKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Append      => "Append",
            Self::Delete      => "Delete",
            Self::Overwrite   => "Overwrite",
            Self::CreateIndex => "CreateIndex",
            Self::Rewrite     => "Rewrite",
            Self::Merge       => "Merge",
            Self::Project     => "Project",
            Self::Restore     => "Restore",
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Append      => 1,
            Self::Delete      => 2,
            Self::Overwrite   => 3,
            Self::CreateIndex => 4,
            Self::Rewrite     => 5,
            Self::Merge       => 6,
            Self::Project     => 7,
            Self::Restore     => 8,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Self::Append,
            2 => Self::Delete,
            3 => Self::Overwrite,
            4 => Self::CreateIndex,
            5 => Self::Rewrite,
            6 => Self::Merge,
            7 => Self::Project,
            8 => Self::Restore,
            _ => return None,
        })
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// 一组被重写（合并）的 fragment
#[derive(Debug, Clone, PartialEq)]
pub struct RewriteGroup {
    pub old_fragments: Vec<Fragment>,
    /// 新 fragment 的 id 在提交时分配
    pub new_fragments: Vec<Fragment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// 追加新 fragment（id 未分配）
    Append { fragments: Vec<Fragment> },
    /// `updated_fragments` 带新的删除文件；`deleted_fragment_ids` 整体移除
    Delete {
        updated_fragments:    Vec<Fragment>,
        deleted_fragment_ids: Vec<FragmentId>,
        predicate:            String,
    },
    /// 用新数据替换全部 fragment；也用于创建数据集
    Overwrite { fragments: Vec<Fragment>, schema: Schema },
    /// 注册新索引；同名旧索引被替换
    CreateIndex { new_indices: Vec<IndexMetadata>, removed_indices: Vec<IndexMetadata> },
    /// 数据不变、行地址改变（compaction）
    Rewrite { groups: Vec<RewriteGroup> },
    /// 为已有 fragment 追加数据文件（计算列）；`fragments` 为完整列表
    Merge { fragments: Vec<Fragment>, schema: Schema },
    /// 只改 schema：加空列 / 删列 / 重命名
    Project { schema: Schema },
    /// 以旧版本内容作为新的最新版本
    Restore {
        version:   VersionNumber,
        schema:    Schema,
        fragments: Vec<Fragment>,
        indices:   Vec<IndexMetadata>,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Append { .. }      => OperationKind::Append,
            Self::Delete { .. }      => OperationKind::Delete,
            Self::Overwrite { .. }   => OperationKind::Overwrite,
            Self::CreateIndex { .. } => OperationKind::CreateIndex,
            Self::Rewrite { .. }     => OperationKind::Rewrite,
            Self::Merge { .. }       => OperationKind::Merge,
            Self::Project { .. }     => OperationKind::Project,
            Self::Restore { .. }     => OperationKind::Restore,
        }
    }

    /// 被修改的已有 fragment（不含新增的）
    pub fn modified_fragment_ids(&self) -> Vec<FragmentId> {
        match self {
            Self::Delete { updated_fragments, deleted_fragment_ids, .. } =>
                updated_fragments.iter().map(|f| f.id).chain(deleted_fragment_ids.iter().copied()).collect(),
            Self::Rewrite { groups } =>
                groups.iter().flat_map(|g| g.old_fragments.iter().map(|f| f.id)).collect(),
            Self::Merge { fragments, .. } => fragments.iter().map(|f| f.id).collect(),
            Self::Append { .. } | Self::Overwrite { .. } | Self::CreateIndex { .. }
            | Self::Project { .. } | Self::Restore { .. } => Vec::new(),
        }
    }

    pub fn replaces_all(&self) -> bool {
        matches!(self, Self::Overwrite { .. } | Self::Restore { .. })
    }

    pub fn changes_schema(&self) -> bool {
        matches!(self, Self::Merge { .. } | Self::Project { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    /// 事务基于的版本；创建数据集时为 0
    pub read_version: VersionNumber,
    pub uuid:         String,
    pub operation:    Operation,
    pub author:       Option<String>,
    pub tag:          Option<String>,
}

impl Transaction {
    pub fn new(read_version: VersionNumber, operation: Operation) -> Self {
        Self { read_version, uuid: Uuid::new_v4().hyphenated().to_string(), operation, author: None, tag: None }
    }

    pub fn with_author(mut self, author: Option<String>) -> Self {
        self.author = author; self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.into()); self
    }

    pub fn meta(&self) -> TransactionMeta {
        TransactionMeta {
            uuid:                  self.uuid.clone(),
            read_version:          self.read_version,
            kind:                  self.operation.kind(),
            author:                self.author.clone(),
            modified_fragment_ids: self.operation.modified_fragment_ids(),
            replaces_all:          self.operation.replaces_all(),
            schema_changed:        self.operation.changes_schema(),
        }
    }

    /// 若 `committed` 先提交后本事务不能再提交，返回原因
    pub fn conflicts_with(&self, committed: &TransactionMeta) -> Option<String> {
        let me = self.meta();
        if me.replaces_all {
            return None;
        }
        if me.schema_changed && committed.schema_changed {
            return Some(format!("concurrent {} also changed the schema", committed.kind));
        }
        if committed.replaces_all {
            return Some(format!("concurrent {} replaced every fragment", committed.kind));
        }
        let mine: HashSet<FragmentId> = me.modified_fragment_ids.iter().copied().collect();
        if let Some(id) = committed.modified_fragment_ids.iter().find(|id| mine.contains(id)) {
            return Some(format!("concurrent {} also modified fragment {id}", committed.kind));
        }
        match (me.kind, committed.kind) {
            (OperationKind::Merge, OperationKind::Append) | (OperationKind::Append, OperationKind::Merge) =>
                Some(format!("{} cannot be reordered with a concurrent {}", me.kind, committed.kind)),
            (OperationKind::CreateIndex, _) if committed.schema_changed =>
                Some(format!("concurrent {} changed the indexed schema", committed.kind)),
            _ => None,
        }
    }

    // ── 推导新 manifest ───────────────────────────────────────────────────────

    fn assign_ids(fragments: &[Fragment], next_id: &mut FragmentId) -> Vec<Fragment> {
        fragments.iter().cloned().map(|mut f| {
            f.id = *next_id;
            *next_id += 1;
            f
        }).collect()
    }

    /// 在 `parent` 上应用本事务得到下一版本；`parent = None` 仅用于创建数据集
    pub fn build_manifest(&self, parent: Option<&Manifest>) -> Result<Manifest> {
        let kind = self.operation.kind();
        let new_version = parent.map(|p| p.version + 1).unwrap_or(1);
        let conflict = |message: String| LanceError::CommitConflict { version: new_version, message };

        let (base_schema, base_fragments, base_indices) = match parent {
            Some(p) => (p.schema.clone(), p.fragments.as_ref().clone(), p.indices.clone()),
            None if matches!(self.operation, Operation::Overwrite { .. }) =>
                (Schema::empty(), Vec::new(), Vec::new()),
            None => return Err(LanceError::invalid(format!("{kind} requires an existing dataset"))),
        };
        let mut next_id = parent.and_then(|p| p.max_fragment_id).map(|id| id + 1).unwrap_or(0);

        let mut schema    = base_schema;
        let mut fragments = base_fragments;
        let mut indices   = base_indices;

        match &self.operation {
            Operation::Append { fragments: new } => {
                fragments.extend(Self::assign_ids(new, &mut next_id));
            }
            Operation::Delete { updated_fragments, deleted_fragment_ids, .. } => {
                for id in self.operation.modified_fragment_ids() {
                    if !fragments.iter().any(|f| f.id == id) {
                        return Err(conflict(format!("fragment {id} no longer exists")));
                    }
                }
                fragments.retain(|f| !deleted_fragment_ids.contains(&f.id));
                for f in fragments.iter_mut() {
                    if let Some(updated) = updated_fragments.iter().find(|u| u.id == f.id) {
                        *f = updated.clone();
                    }
                }
            }
            Operation::Overwrite { fragments: new, schema: new_schema } => {
                schema = new_schema.clone();
                fragments = Self::assign_ids(new, &mut next_id);
                indices.clear();
            }
            Operation::CreateIndex { new_indices, removed_indices } => {
                indices.retain(|existing| {
                    !new_indices.iter().any(|n| n.name == existing.name)
                        && !removed_indices.iter().any(|r| r.uuid == existing.uuid)
                });
                indices.extend(new_indices.iter().cloned());
            }
            Operation::Rewrite { groups } => {
                for group in groups {
                    let old_ids: Vec<FragmentId> = group.old_fragments.iter().map(|f| f.id).collect();
                    let Some(pos) = fragments.iter().position(|f| old_ids.contains(&f.id)) else {
                        return Err(conflict("rewrite target fragments no longer exist".into()));
                    };
                    if old_ids.iter().any(|id| !fragments.iter().any(|f| f.id == *id)) {
                        return Err(conflict("rewrite target fragments no longer exist".into()));
                    }
                    fragments.retain(|f| !old_ids.contains(&f.id));
                    let new = Self::assign_ids(&group.new_fragments, &mut next_id);
                    fragments.splice(pos..pos, new);
                    // 旧 fragment 已不存在，索引不再覆盖它们
                    for idx in indices.iter_mut() {
                        for id in old_ids.iter().filter_map(|&id| u32::try_from(id).ok()) {
                            idx.fragment_bitmap.remove(id);
                        }
                    }
                }
            }
            Operation::Merge { fragments: merged, schema: new_schema } => {
                if merged.len() != fragments.len() || merged.iter().any(|m| !fragments.iter().any(|f| f.id == m.id)) {
                    return Err(conflict("merge does not cover the current fragment list".into()));
                }
                schema = new_schema.clone();
                fragments = merged.clone();
            }
            Operation::Project { schema: new_schema } => {
                schema = new_schema.clone();
                indices.retain(|idx| schema.field_by_id(idx.field_id).is_some());
            }
            Operation::Restore { schema: s, fragments: f, indices: i, .. } => {
                schema = s.clone();
                fragments = f.clone();
                indices = i.clone();
            }
        }

        let max_fragment_id = [
            parent.and_then(|p| p.max_fragment_id),
            fragments.iter().map(|f| f.id).max(),
            next_id.checked_sub(1),
        ].into_iter().flatten().max();

        Ok(Manifest {
            version:      new_version,
            prev_version: parent.map(|p| p.version).unwrap_or(0),
            schema,
            fragments:    Arc::new(fragments),
            indices,
            max_fragment_id,
            timestamp:    now_millis(),
            transaction:  self.meta(),
            tag:          self.tag.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_type::{DataType, Field};
    use crate::fragment::DataFile;

    fn frag(id: FragmentId) -> Fragment {
        Fragment {
            id,
            physical_rows: 10,
            files: vec![DataFile { path: format!("data/{id}.lance"), field_ids: vec![0] }],
            deletion_file: None,
        }
    }

    fn schema() -> Schema {
        Schema::new(vec![Field::new("id", DataType::Int64, false)]).unwrap()
    }

    fn created() -> Manifest {
        Transaction::new(0, Operation::Overwrite { fragments: vec![frag(0), frag(0)], schema: schema() })
            .build_manifest(None).unwrap()
    }

    fn delete(ids: &[FragmentId]) -> Transaction {
        Transaction::new(1, Operation::Delete {
            updated_fragments: ids.iter().map(|&i| frag(i)).collect(),
            deleted_fragment_ids: vec![],
            predicate: "x".into(),
        })
    }

    #[test]
    fn appends_get_fresh_ids_and_versions_advance() {
        let v1 = created();
        assert_eq!(v1.fragments.iter().map(|f| f.id).collect::<Vec<_>>(), vec![0, 1]);
        let v2 = Transaction::new(1, Operation::Append { fragments: vec![frag(0)] })
            .build_manifest(Some(&v1)).unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.prev_version, 1);
        assert_eq!(v2.fragments.last().unwrap().id, 2);
        assert_eq!(v2.max_fragment_id, Some(2));
    }

    #[test]
    fn fragment_ids_are_never_reused_after_overwrite() {
        let v1 = created();
        let v2 = Transaction::new(1, Operation::Overwrite { fragments: vec![frag(0)], schema: schema() })
            .build_manifest(Some(&v1)).unwrap();
        assert_eq!(v2.fragments[0].id, 2);
    }

    #[test]
    fn conflict_matrix() {
        let append = Transaction::new(1, Operation::Append { fragments: vec![frag(0)] });
        let project = Transaction::new(1, Operation::Project { schema: schema() });
        let merge = Transaction::new(1, Operation::Merge { fragments: vec![frag(0), frag(1)], schema: schema() });
        let overwrite = Transaction::new(1, Operation::Overwrite { fragments: vec![], schema: schema() });
        let index = Transaction::new(1, Operation::CreateIndex { new_indices: vec![], removed_indices: vec![] });

        assert!(append.conflicts_with(&append.meta()).is_none());
        assert!(append.conflicts_with(&delete(&[0]).meta()).is_none());
        assert!(delete(&[0]).conflicts_with(&append.meta()).is_none());
        assert!(delete(&[0]).conflicts_with(&delete(&[1]).meta()).is_none());
        assert!(delete(&[0, 1]).conflicts_with(&delete(&[1]).meta()).is_some());
        assert!(project.conflicts_with(&project.meta()).is_some());
        assert!(merge.conflicts_with(&append.meta()).is_some());
        assert!(append.conflicts_with(&merge.meta()).is_some());
        assert!(append.conflicts_with(&overwrite.meta()).is_some());
        assert!(overwrite.conflicts_with(&append.meta()).is_none());
        assert!(index.conflicts_with(&project.meta()).is_some());
        assert!(index.conflicts_with(&append.meta()).is_none());
    }

    #[test]
    fn delete_of_vanished_fragment_is_a_conflict() {
        let v1 = created();
        let err = delete(&[9]).build_manifest(Some(&v1)).unwrap_err();
        assert!(matches!(err, LanceError::CommitConflict { version: 2, .. }));
    }

    #[test]
    fn rewrite_replaces_in_place() {
        let v1 = created();
        let v2 = Transaction::new(1, Operation::Append { fragments: vec![frag(0)] })
            .build_manifest(Some(&v1)).unwrap();
        let rewrite = Transaction::new(2, Operation::Rewrite { groups: vec![RewriteGroup {
            old_fragments: vec![v2.fragments[0].clone(), v2.fragments[1].clone()],
            new_fragments: vec![frag(0)],
        }]});
        let v3 = rewrite.build_manifest(Some(&v2)).unwrap();
        assert_eq!(v3.fragments.iter().map(|f| f.id).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[test]
    fn rewrite_of_wide_fragment_id_keeps_low_bitmap_bits() {
        let wide: FragmentId = 1 << 32;
        let mut v1 = created();
        v1.fragments = Arc::new(vec![frag(0), frag(wide)]);
        v1.max_fragment_id = Some(wide);
        v1.indices.push(IndexMetadata {
            uuid:            "u".into(),
            name:            "id_idx".into(),
            field_id:        0,
            params:          crate::index::IndexParams::BTree,
            dataset_version: 1,
            fragment_bitmap: [0u32].into_iter().collect(),
            path:            "_indices/id_idx.idx".into(),
        });
        let rewrite = Transaction::new(1, Operation::Rewrite { groups: vec![RewriteGroup {
            old_fragments: vec![frag(wide)],
            new_fragments: vec![frag(0)],
        }]});
        let v2 = rewrite.build_manifest(Some(&v1)).unwrap();
        assert!(v2.indices[0].fragment_bitmap.contains(0));
        assert_eq!(v2.fragments.iter().map(|f| f.id).collect::<Vec<_>>(), vec![0, wide + 1]);
    }

    #[test]
    fn only_overwrite_can_create() {
        let err = Transaction::new(0, Operation::Append { fragments: vec![] }).build_manifest(None).unwrap_err();
        assert!(matches!(err, LanceError::InvalidInput(_)));
    }
}
