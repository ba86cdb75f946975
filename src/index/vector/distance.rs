//! 向量距离；三种度量都满足“值越小越相近”

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricType {
    /// 平方欧氏距离
    #[default]
    L2,
    /// 1 - cos(a, b)
    Cosine,
    /// 1 - a·b
    Dot,
}

impl MetricType {
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::L2     => l2(a, b),
            Self::Cosine => cosine(a, b),
            Self::Dot    => 1.0 - dot(a, b),
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::L2     => 0,
            Self::Cosine => 1,
            Self::Dot    => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::L2,
            1 => Self::Cosine,
            2 => Self::Dot,
            _ => return None,
        })
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::L2     => "l2",
            Self::Cosine => "cosine",
            Self::Dot    => "dot",
        };
        write!(f, "{s}")
    }
}

pub fn l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// 零向量与任何向量的距离为 1
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let denom = norm(a) * norm(b);
    if denom == 0.0 { 1.0 } else { 1.0 - dot(a, b) / denom }
}

/// 原地归一化；零向量保持不变
pub(crate) fn normalize(v: &mut [f32]) {
    let n = norm(v);
    if n > 0.0 {
        v.iter_mut().for_each(|x| *x /= n);
    }
}
