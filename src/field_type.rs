//! 列的逻辑类型、字段定义与运行时值

use std::cmp::Ordering;
use crate::common::FieldId;

/// 列的逻辑类型
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    Boolean,
    Int8, Int16, Int32, Int64,
    UInt32, UInt64,
    Float32, Float64,
    /// 日期存储为 i32（天数）
    Date32,
    /// 变长 UTF-8 字符串（offsets + data）
    Utf8,
    /// 变长字节
    Binary,
    List(Box<Field>),
    /// 定长列表，向量列使用 `FixedSizeList(Float32, dim)`
    FixedSizeList(Box<Field>, u32),
    Struct(Vec<Field>),
}

impl DataType {
    /// 固定字节宽度；Boolean 按位存储、变长与嵌套类型返回 None
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            Self::Int8                                => Some(1),
            Self::Int16                               => Some(2),
            Self::Int32 | Self::Date32 | Self::UInt32 => Some(4),
            Self::Float32                             => Some(4),
            Self::Int64 | Self::UInt64 | Self::Float64 => Some(8),
            _ => None,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64
                | Self::UInt32 | Self::UInt64 | Self::Date32
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    pub fn is_var_width(&self) -> bool {
        matches!(self, Self::Utf8 | Self::Binary)
    }

    pub fn is_nested(&self) -> bool {
        matches!(self, Self::List(_) | Self::FixedSizeList(..) | Self::Struct(_))
    }

    /// 可比较的标量类型（zone map / btree 索引的键）
    pub fn is_orderable(&self) -> bool {
        !self.is_nested()
    }

    /// 若为 `FixedSizeList<Float32, dim>` 返回 dim
    pub fn vector_dim(&self) -> Option<usize> {
        match self {
            Self::FixedSizeList(child, dim) if child.data_type == Self::Float32 =>
                Some(*dim as usize),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Boolean => write!(f, "bool"),
            Self::Int8    => write!(f, "int8"),
            Self::Int16   => write!(f, "int16"),
            Self::Int32   => write!(f, "int32"),
            Self::Int64   => write!(f, "int64"),
            Self::UInt32  => write!(f, "uint32"),
            Self::UInt64  => write!(f, "uint64"),
            Self::Float32 => write!(f, "float32"),
            Self::Float64 => write!(f, "float64"),
            Self::Date32  => write!(f, "date32"),
            Self::Utf8    => write!(f, "utf8"),
            Self::Binary  => write!(f, "binary"),
            Self::List(c) => write!(f, "list<{}>", c.data_type),
            Self::FixedSizeList(c, n) => write!(f, "fixed_size_list<{}, {n}>", c.data_type),
            Self::Struct(fields) => {
                write!(f, "struct<")?;
                for (i, c) in fields.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}: {}", c.name, c.data_type)?;
                }
                write!(f, ">")
            }
        }
    }
}

// ── Field ─────────────────────────────────────────────────────────────────────

/// 具名、带类型的列定义
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name:      String,
    pub data_type: DataType,
    pub nullable:  bool,
    /// 顶层字段由 Schema 分配；嵌套子字段恒为 -1
    pub id:        FieldId,
}

impl Field {
    pub fn new(name: &str, data_type: DataType, nullable: bool) -> Self {
        Self { name: name.into(), data_type, nullable, id: -1 }
    }

    /// `FixedSizeList<Float32, dim>` 向量列
    pub fn vector(name: &str, dim: u32) -> Self {
        let item = Field::new("item", DataType::Float32, true);
        Self::new(name, DataType::FixedSizeList(Box::new(item), dim), true)
    }

    pub fn list(name: &str, item: DataType) -> Self {
        Self::new(name, DataType::List(Box::new(Field::new("item", item, true))), true)
    }

    pub fn with_id(mut self, id: FieldId) -> Self {
        self.id = id; self
    }
}

// ── 编码 / 压缩 ───────────────────────────────────────────────────────────────

/// 缓冲区编码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingType {
    Plain,
    RunLength,
    DeltaBinary,
    Dictionary,
}

impl EncodingType {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Plain       => 0,
            Self::RunLength   => 1,
            Self::DeltaBinary => 2,
            Self::Dictionary  => 3,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Plain),
            1 => Some(Self::RunLength),
            2 => Some(Self::DeltaBinary),
            3 => Some(Self::Dictionary),
            _ => None,
        }
    }
}

/// 压缩方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Lz4,
}

impl CompressionType {
    pub(crate) fn tag(self) -> u8 {
        match self { Self::None => 0, Self::Lz4 => 1 }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag { 0 => Some(Self::None), 1 => Some(Self::Lz4), _ => None }
    }
}

// ── Value ─────────────────────────────────────────────────────────────────────

/// 列值（行级运行时表示）
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Date32(i32),
    Utf8(String),
    Binary(Vec<u8>),
    /// List 与 FixedSizeList 共用
    List(Vec<Value>),
    Struct(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool { matches!(self, Self::Null) }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(v)   => Some(*v as i64),
            Self::Int16(v)  => Some(*v as i64),
            Self::Int32(v)  => Some(*v as i64),
            Self::Int64(v)  => Some(*v),
            Self::UInt32(v) => Some(*v as i64),
            Self::UInt64(v) => i64::try_from(*v).ok(),
            Self::Date32(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float32(v) => Some(*v as f64),
            Self::Float64(v) => Some(*v),
            Self::UInt64(v)  => Some(*v as f64),
            other            => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self { Self::Utf8(s) => Some(s), _ => None }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(b) => Some(b),
            Self::Utf8(s)   => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// 跨数值类型比较；Null 与任何值不可比
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => None,
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            (Self::Utf8(a), Self::Utf8(b))       => Some(a.cmp(b)),
            (Self::Binary(a), Self::Binary(b))   => Some(a.cmp(b)),
            (Self::UInt64(a), Self::UInt64(b))   => Some(a.cmp(b)),
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
            },
        }
    }

    /// 排序键比较：Null 最小；浮点 -0.0 与 0.0 相等（与 `compare` 一致），
    /// 仅 NaN 按 total order 排在两端
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Null, _)          => Ordering::Less,
            (_, Self::Null)          => Ordering::Greater,
            (Self::Float32(a), Self::Float32(b)) => a.partial_cmp(b).unwrap_or_else(|| a.total_cmp(b)),
            (Self::Float64(a), Self::Float64(b)) => a.partial_cmp(b).unwrap_or_else(|| a.total_cmp(b)),
            (a, b) => a.compare(b).unwrap_or(Ordering::Equal),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null       => write!(f, "NULL"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int8(v)    => write!(f, "{v}"),
            Self::Int16(v)   => write!(f, "{v}"),
            Self::Int32(v)   => write!(f, "{v}"),
            Self::Int64(v)   => write!(f, "{v}"),
            Self::UInt32(v)  => write!(f, "{v}"),
            Self::UInt64(v)  => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Date32(v)  => write!(f, "date({v})"),
            Self::Utf8(s)    => write!(f, "'{s}'"),
            Self::Binary(b)  => write!(f, "x'{}'", b.iter().map(|x| format!("{x:02x}")).collect::<String>()),
            Self::List(vs) | Self::Struct(vs) => {
                let open = if matches!(self, Self::List(_)) { '[' } else { '{' };
                let close = if open == '[' { ']' } else { '}' };
                write!(f, "{open}")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{v}")?;
                }
                write!(f, "{close}")
            }
        }
    }
}

impl From<i32> for Value { fn from(v: i32) -> Self { Self::Int32(v) } }
impl From<i64> for Value { fn from(v: i64) -> Self { Self::Int64(v) } }
impl From<u64> for Value { fn from(v: u64) -> Self { Self::UInt64(v) } }
impl From<f32> for Value { fn from(v: f32) -> Self { Self::Float32(v) } }
impl From<f64> for Value { fn from(v: f64) -> Self { Self::Float64(v) } }
impl From<bool> for Value { fn from(v: bool) -> Self { Self::Boolean(v) } }
impl From<&str> for Value { fn from(v: &str) -> Self { Self::Utf8(v.into()) } }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_across_numeric_types() {
        assert_eq!(Value::Int32(3).compare(&Value::Int64(3)), Some(Ordering::Equal));
        assert_eq!(Value::Float32(2.5).compare(&Value::Int64(3)), Some(Ordering::Less));
        assert_eq!(Value::Null.compare(&Value::Int64(3)), None);
        assert_eq!(Value::Utf8("a".into()).compare(&Value::Int64(3)), None);
    }

    #[test]
    fn vector_dim_only_for_float_lists() {
        assert_eq!(Field::vector("v", 128).data_type.vector_dim(), Some(128));
        assert_eq!(Field::list("l", DataType::Float32).data_type.vector_dim(), None);
    }
}
