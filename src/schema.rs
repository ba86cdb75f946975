//! Schema 与 schema 演进
//!
//! 顶层字段带稳定的 field id；数据文件按 field id 记录列，
//! 因此 rename / drop 只产生新 Schema，不重写数据。

use std::collections::HashSet;
use crate::common::{FieldId, LanceError, Result};
use crate::field_type::{DataType, Field};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub fields:       Vec<Field>,
    /// 已分配过的最大 field id（drop 后不回收）
    pub max_field_id: FieldId,
}

impl Schema {
    /// 按顺序为字段分配 field id 0..n
    pub fn new(fields: Vec<Field>) -> Result<Self> {
        let fields: Vec<Field> = fields.into_iter()
            .enumerate()
            .map(|(i, f)| f.with_id(i as FieldId))
            .collect();
        let max_field_id = fields.len() as FieldId - 1;
        let schema = Self { fields, max_field_id };
        schema.validate()?;
        Ok(schema)
    }

    /// 保留字段上已有的 id（投影 / 反序列化使用）
    pub(crate) fn from_parts(fields: Vec<Field>, max_field_id: FieldId) -> Self {
        Self { fields, max_field_id }
    }

    pub fn empty() -> Self {
        Self { fields: Vec::new(), max_field_id: -1 }
    }

    pub fn len(&self)      -> usize { self.fields.len() }
    pub fn is_empty(&self) -> bool  { self.fields.is_empty() }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_id(&self, id: FieldId) -> Option<&Field> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn field_ids(&self) -> Vec<FieldId> {
        self.fields.iter().map(|f| f.id).collect()
    }

    pub fn require(&self, name: &str) -> Result<&Field> {
        self.field(name)
            .ok_or_else(|| LanceError::invalid(format!("no column named `{name}` in schema")))
    }

    /// 按列名投影，保持给定顺序
    pub fn project<S: AsRef<str>>(&self, columns: &[S]) -> Result<Schema> {
        let fields = columns.iter()
            .map(|c| self.require(c.as_ref()).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_parts(fields, self.max_field_id))
    }

    /// 校验：列名唯一、类型组合受支持
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for f in &self.fields {
            if f.name.is_empty() {
                return Err(LanceError::invalid("column names must not be empty"));
            }
            if !seen.insert(f.name.as_str()) {
                return Err(LanceError::invalid(format!("duplicate column `{}`", f.name)));
            }
            validate_type(&f.name, &f.data_type)?;
        }
        Ok(())
    }

    // ── 演进 ──────────────────────────────────────────────────────────────────

    /// 追加新列，分配新的 field id
    pub fn add_fields(&self, new_fields: Vec<Field>) -> Result<Schema> {
        let mut next = self.clone();
        for f in new_fields {
            next.max_field_id += 1;
            let id = next.max_field_id;
            next.fields.push(f.with_id(id));
        }
        next.validate()?;
        Ok(next)
    }

    pub fn drop_fields<S: AsRef<str>>(&self, names: &[S]) -> Result<Schema> {
        for n in names {
            self.require(n.as_ref())?;
        }
        let fields = self.fields.iter()
            .filter(|f| !names.iter().any(|n| n.as_ref() == f.name))
            .cloned()
            .collect();
        Ok(Self::from_parts(fields, self.max_field_id))
    }

    pub fn rename_field(&self, old: &str, new: &str) -> Result<Schema> {
        let idx = self.index_of(old)
            .ok_or_else(|| LanceError::invalid(format!("no column named `{old}` in schema")))?;
        let mut next = self.clone();
        next.fields[idx].name = new.into();
        next.validate()?;
        Ok(next)
    }
}

fn validate_type(column: &str, dt: &DataType) -> Result<()> {
    match dt {
        DataType::List(child) => validate_type(column, &child.data_type),
        DataType::FixedSizeList(child, n) => {
            if *n == 0 {
                return Err(LanceError::unsupported(column, "fixed_size_list with size 0"));
            }
            validate_type(column, &child.data_type)
        }
        DataType::Struct(children) => {
            if children.is_empty() {
                return Err(LanceError::unsupported(column, "struct without children"));
            }
            children.iter().try_for_each(|c| validate_type(column, &c.data_type))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::vector("vec", 4),
        ]).unwrap()
    }

    #[test]
    fn ids_are_stable_across_evolution() {
        let s = base();
        assert_eq!(s.field_ids(), vec![0, 1]);

        let s2 = s.add_fields(vec![Field::new("tag", DataType::Utf8, true)]).unwrap();
        assert_eq!(s2.field("tag").unwrap().id, 2);

        let s3 = s2.drop_fields(&["vec"]).unwrap();
        assert_eq!(s3.field_ids(), vec![0, 2]);

        // drop 后新增列不复用旧 id
        let s4 = s3.add_fields(vec![Field::new("score", DataType::Float32, true)]).unwrap();
        assert_eq!(s4.field("score").unwrap().id, 3);

        let s5 = s4.rename_field("tag", "label").unwrap();
        assert_eq!(s5.field("label").unwrap().id, 2);
        assert!(s5.field("tag").is_none());
    }

    #[test]
    fn rejects_duplicates_and_bad_types() {
        let err = base().add_fields(vec![Field::new("id", DataType::Int32, true)]);
        assert!(matches!(err, Err(LanceError::InvalidInput(_))));

        let bad = Schema::new(vec![Field::vector("v", 0)]);
        assert!(matches!(bad, Err(LanceError::UnsupportedSchema { .. })));
    }

    #[test]
    fn project_keeps_requested_order() {
        let p = base().project(&["vec", "id"]).unwrap();
        assert_eq!(p.field_names(), vec!["vec", "id"]);
        assert!(base().project(&["nope"]).is_err());
    }
}
