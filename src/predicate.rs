//! 过滤谓词
//!
//! 三值逻辑：与 NULL 比较的结果为“未知”，未知在最终结果中视为不匹配，
//! `Not(未知)` 仍是未知。
//!
//! 同一棵谓词树有三种用途：
//! - `evaluate`：在一个批次上逐行求值
//! - `may_match`：依据 zone map 判断一段行是否可能命中（用于剪枝）
//! - `index_query`：能由单个索引回答的叶子谓词转换为索引查询

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Bound;
use std::cmp::Ordering;
use crate::array::RecordBatch;
use crate::common::{LanceError, Result};
use crate::data_file::ZoneMap;
use crate::field_type::{DataType, Value};
use crate::index::inverted::text_matches;
use crate::index::{IndexKind, IndexQuery, ScalarQuery};
use crate::schema::Schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CmpOp {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            Self::Eq    => ord == Ordering::Equal,
            Self::NotEq => ord != Ordering::Equal,
            Self::Lt    => ord == Ordering::Less,
            Self::LtEq  => ord != Ordering::Greater,
            Self::Gt    => ord == Ordering::Greater,
            Self::GtEq  => ord != Ordering::Less,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Eq    => "=",
            Self::NotEq => "!=",
            Self::Lt    => "<",
            Self::LtEq  => "<=",
            Self::Gt    => ">",
            Self::GtEq  => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare { column: String, op: CmpOp, value: Value },
    IsNull(String),
    IsNotNull(String),
    In { column: String, values: Vec<Value> },
    /// 闭区间
    Between { column: String, low: Value, high: Value },
    /// 行文本包含查询的全部词
    TextMatch { column: String, query: String },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

// ── 构造 ──────────────────────────────────────────────────────────────────────

impl Predicate {
    fn cmp(column: &str, op: CmpOp, value: impl Into<Value>) -> Self {
        Self::Compare { column: column.into(), op, value: value.into() }
    }

    pub fn eq(column: &str, v: impl Into<Value>)     -> Self { Self::cmp(column, CmpOp::Eq, v) }
    pub fn not_eq(column: &str, v: impl Into<Value>) -> Self { Self::cmp(column, CmpOp::NotEq, v) }
    pub fn lt(column: &str, v: impl Into<Value>)     -> Self { Self::cmp(column, CmpOp::Lt, v) }
    pub fn lt_eq(column: &str, v: impl Into<Value>)  -> Self { Self::cmp(column, CmpOp::LtEq, v) }
    pub fn gt(column: &str, v: impl Into<Value>)     -> Self { Self::cmp(column, CmpOp::Gt, v) }
    pub fn gt_eq(column: &str, v: impl Into<Value>)  -> Self { Self::cmp(column, CmpOp::GtEq, v) }

    pub fn is_null(column: &str)     -> Self { Self::IsNull(column.into()) }
    pub fn is_not_null(column: &str) -> Self { Self::IsNotNull(column.into()) }

    pub fn is_in<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self::In { column: column.into(), values: values.into_iter().map(Into::into).collect() }
    }

    pub fn between(column: &str, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        Self::Between { column: column.into(), low: low.into(), high: high.into() }
    }

    pub fn text_match(column: &str, query: &str) -> Self {
        Self::TextMatch { column: column.into(), query: query.into() }
    }

    pub fn and(self, other: Predicate) -> Self { Self::And(Box::new(self), Box::new(other)) }
    pub fn or(self, other: Predicate)  -> Self { Self::Or(Box::new(self), Box::new(other)) }
}

impl std::ops::Not for Predicate {
    type Output = Predicate;
    fn not(self) -> Predicate { Predicate::Not(Box::new(self)) }
}

// ── 校验 ──────────────────────────────────────────────────────────────────────

impl Predicate {
    /// 引用到的列（去重，按名字排序）
    pub fn columns(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Self::Compare { column, .. } | Self::In { column, .. } | Self::Between { column, .. }
            | Self::TextMatch { column, .. } | Self::IsNull(column) | Self::IsNotNull(column) => {
                out.insert(column.as_str());
            }
            Self::And(a, b) | Self::Or(a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
            Self::Not(p) => p.collect_columns(out),
        }
    }

    /// 列存在；比较只用于可排序列；全文匹配只用于 Utf8 列
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        match self {
            Self::Compare { column, .. } | Self::In { column, .. } | Self::Between { column, .. } => {
                let f = schema.require(column)?;
                if !f.data_type.is_orderable() {
                    return Err(LanceError::unsupported(column, format!("cannot compare values of type {}", f.data_type)));
                }
                Ok(())
            }
            Self::TextMatch { column, .. } => {
                let f = schema.require(column)?;
                if f.data_type != DataType::Utf8 {
                    return Err(LanceError::unsupported(column, format!("text match needs utf8, found {}", f.data_type)));
                }
                Ok(())
            }
            Self::IsNull(column) | Self::IsNotNull(column) => schema.require(column).map(|_| ()),
            Self::And(a, b) | Self::Or(a, b) => {
                a.validate(schema)?;
                b.validate(schema)
            }
            Self::Not(p) => p.validate(schema),
        }
    }

    /// 顶层 And 拆成的合取项
    pub fn conjuncts(&self) -> Vec<&Predicate> {
        match self {
            Self::And(a, b) => {
                let mut out = a.conjuncts();
                out.extend(b.conjuncts());
                out
            }
            other => vec![other],
        }
    }
}

// ── 求值 ──────────────────────────────────────────────────────────────────────

impl Predicate {
    /// 逐行求值；未知视为不匹配
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<Vec<bool>> {
        Ok(self.eval3(batch)?.into_iter().map(|v| v.unwrap_or(false)).collect())
    }

    fn column_values(batch: &RecordBatch, column: &str) -> Result<Vec<Value>> {
        batch.column_by_name(column)
            .map(|c| c.to_values())
            .ok_or_else(|| LanceError::invalid(format!("filter column `{column}` is not in the batch")))
    }

    fn eval3(&self, batch: &RecordBatch) -> Result<Vec<Option<bool>>> {
        Ok(match self {
            Self::Compare { column, op, value } => Self::column_values(batch, column)?.iter()
                .map(|v| v.compare(value).map(|o| op.holds(o)))
                .collect(),
            Self::IsNull(column) => Self::column_values(batch, column)?.iter()
                .map(|v| Some(v.is_null()))
                .collect(),
            Self::IsNotNull(column) => Self::column_values(batch, column)?.iter()
                .map(|v| Some(!v.is_null()))
                .collect(),
            Self::In { column, values } => Self::column_values(batch, column)?.iter()
                .map(|v| {
                    if v.is_null() { return None; }
                    let hit = values.iter().any(|c| v.compare(c) == Some(Ordering::Equal));
                    if hit { Some(true) } else if values.iter().any(Value::is_null) { None } else { Some(false) }
                })
                .collect(),
            Self::Between { column, low, high } => Self::column_values(batch, column)?.iter()
                .map(|v| Some(v.compare(low)? != Ordering::Less && v.compare(high)? != Ordering::Greater))
                .collect(),
            Self::TextMatch { column, query } => Self::column_values(batch, column)?.iter()
                .map(|v| v.as_str().map(|s| text_matches(s, query)))
                .collect(),
            Self::And(a, b) => a.eval3(batch)?.into_iter().zip(b.eval3(batch)?)
                .map(|pair| match pair {
                    (Some(false), _) | (_, Some(false)) => Some(false),
                    (Some(true), Some(true))            => Some(true),
                    _                                   => None,
                })
                .collect(),
            Self::Or(a, b) => a.eval3(batch)?.into_iter().zip(b.eval3(batch)?)
                .map(|pair| match pair {
                    (Some(true), _) | (_, Some(true)) => Some(true),
                    (Some(false), Some(false))        => Some(false),
                    _                                 => None,
                })
                .collect(),
            Self::Not(p) => p.eval3(batch)?.into_iter().map(|v| v.map(|b| !b)).collect(),
        })
    }
}

// ── Zone map 剪枝 ─────────────────────────────────────────────────────────────

/// 一段行在某列上的统计
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneStats {
    pub zone:     ZoneMap,
    pub num_rows: u32,
}

impl ZoneStats {
    /// 合并多页统计
    pub fn merge(pages: &[(ZoneMap, u32)]) -> Option<Self> {
        let mut iter = pages.iter();
        let (first, n) = iter.next()?;
        let mut out = Self { zone: first.clone(), num_rows: *n };
        for (z, n) in iter {
            out.num_rows += n;
            out.zone.null_count += z.null_count;
            if out.zone.min.is_null() || (!z.min.is_null() && z.min.total_cmp(&out.zone.min) == Ordering::Less) {
                out.zone.min = z.min.clone();
            }
            if out.zone.max.is_null() || (!z.max.is_null() && z.max.total_cmp(&out.zone.max) == Ordering::Greater) {
                out.zone.max = z.max.clone();
            }
        }
        Some(out)
    }

    fn all_null(&self) -> bool { self.zone.all_null(self.num_rows) }
}

impl Predicate {
    /// 返回 false 表示这段行中一定没有匹配；缺少统计时保守地返回 true
    pub fn may_match(&self, stats: &dyn Fn(&str) -> Option<ZoneStats>) -> bool {
        // 值落在 [min, max] 之外才能排除；不可比较时保守处理
        let outside = |s: &ZoneStats, v: &Value| {
            matches!(v.compare(&s.zone.min), Some(Ordering::Less))
                || matches!(v.compare(&s.zone.max), Some(Ordering::Greater))
        };
        match self {
            Self::Compare { column, op, value } => {
                let Some(s) = stats(column) else { return true };
                if s.all_null() || value.is_null() {
                    return false;
                }
                let (lo, hi) = (value.compare(&s.zone.min), value.compare(&s.zone.max));
                match op {
                    CmpOp::Eq    => !outside(&s, value),
                    CmpOp::NotEq => !(lo == Some(Ordering::Equal) && hi == Some(Ordering::Equal)),
                    // min < value
                    CmpOp::Lt    => lo != Some(Ordering::Less) && lo != Some(Ordering::Equal),
                    CmpOp::LtEq  => lo != Some(Ordering::Less),
                    CmpOp::Gt    => hi != Some(Ordering::Greater) && hi != Some(Ordering::Equal),
                    CmpOp::GtEq  => hi != Some(Ordering::Greater),
                }
            }
            Self::IsNull(column) => stats(column).map_or(true, |s| s.zone.null_count > 0),
            Self::IsNotNull(column) => stats(column).map_or(true, |s| !s.all_null()),
            Self::In { column, values } => match stats(column) {
                Some(s) => !s.all_null() && values.iter().any(|v| !v.is_null() && !outside(&s, v)),
                None    => true,
            },
            Self::Between { column, low, high } => match stats(column) {
                Some(s) => !s.all_null()
                    && !matches!(high.compare(&s.zone.min), Some(Ordering::Less))
                    && !matches!(low.compare(&s.zone.max), Some(Ordering::Greater)),
                None => true,
            },
            Self::TextMatch { .. } => true,
            Self::And(a, b) => a.may_match(stats) && b.may_match(stats),
            Self::Or(a, b)  => a.may_match(stats) || b.may_match(stats),
            Self::Not(_)    => true,
        }
    }

    /// 可由单个索引回答的叶子谓词：(列, 需要的索引类型, 查询)
    pub fn index_query(&self) -> Option<(&str, IndexKind, IndexQuery)> {
        fn scalar(column: &str, q: ScalarQuery) -> Option<(&str, IndexKind, IndexQuery)> {
            Some((column, IndexKind::BTree, IndexQuery::Scalar(q)))
        }
        match self {
            Self::Compare { column, op, value } if !value.is_null() => {
                let v = value.clone();
                match op {
                    CmpOp::Eq    => scalar(column, ScalarQuery::Equals(v)),
                    CmpOp::Lt    => scalar(column, ScalarQuery::Range { lower: Bound::Unbounded, upper: Bound::Excluded(v) }),
                    CmpOp::LtEq  => scalar(column, ScalarQuery::Range { lower: Bound::Unbounded, upper: Bound::Included(v) }),
                    CmpOp::Gt    => scalar(column, ScalarQuery::Range { lower: Bound::Excluded(v), upper: Bound::Unbounded }),
                    CmpOp::GtEq  => scalar(column, ScalarQuery::Range { lower: Bound::Included(v), upper: Bound::Unbounded }),
                    CmpOp::NotEq => None,
                }
            }
            Self::Between { column, low, high } if !low.is_null() && !high.is_null() =>
                scalar(column, ScalarQuery::Range { lower: Bound::Included(low.clone()), upper: Bound::Included(high.clone()) }),
            Self::In { column, values } =>
                scalar(column, ScalarQuery::IsIn(values.iter().filter(|v| !v.is_null()).cloned().collect())),
            Self::IsNull(column) => scalar(column, ScalarQuery::IsNull),
            Self::TextMatch { column, query } =>
                Some((column.as_str(), IndexKind::Inverted, IndexQuery::Text(query.clone()))),
            _ => None,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare { column, op, value } => write!(f, "{column} {} {value}", op.symbol()),
            Self::IsNull(c)    => write!(f, "{c} IS NULL"),
            Self::IsNotNull(c) => write!(f, "{c} IS NOT NULL"),
            Self::In { column, values } => {
                write!(f, "{column} IN (")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
            Self::Between { column, low, high } => write!(f, "{column} BETWEEN {low} AND {high}"),
            Self::TextMatch { column, query } => write!(f, "{column} MATCH '{query}'"),
            Self::And(a, b) => write!(f, "({a} AND {b})"),
            Self::Or(a, b)  => write!(f, "({a} OR {b})"),
            Self::Not(p)    => write!(f, "NOT {p}"),
        }
    }
}
