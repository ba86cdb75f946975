//! IVF 向量索引（IvfFlat / IvfPq）
//!
//! ```text
//! 构建：k-means 训练 num_partitions 个中心 → 每个向量归入最近的分区
//!       IvfFlat 保存原始向量；IvfPq 额外训练 PQ 码本，只保存编码
//! 查询：按查询与中心的距离选 nprobes 个分区 → 分区内逐个计算距离
//!       → 按 (距离, 行地址) 排序取前 k
//! ```
//!
//! Cosine 度量下训练与分区选择都在归一化后的向量上进行。
//! 构建过程通过 `VectorIndexBuilder` 抽象，默认实现为 `CpuVectorIndexBuilder`。

pub mod distance;
pub mod kmeans;
pub mod pq;

use log::debug;
use crate::common::{LanceError, Result, RowAddress};
use crate::format::{MetaReader, MetaWriter};
pub use distance::MetricType;
use distance::normalize;
use kmeans::KMeans;
use pq::ProductQuantizer;

pub const DEFAULT_MAX_ITERATIONS: u32 = 25;
pub const DEFAULT_NPROBES:        usize = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndexParams {
    pub num_partitions:  u32,
    /// 0 表示不做量化（IvfFlat）
    pub num_sub_vectors: u32,
    pub metric:          MetricType,
    pub max_iterations:  u32,
    pub seed:            u64,
}

impl VectorIndexParams {
    pub fn ivf_flat(num_partitions: u32, metric: MetricType) -> Self {
        Self { num_partitions, num_sub_vectors: 0, metric, max_iterations: DEFAULT_MAX_ITERATIONS, seed: 42 }
    }

    pub fn ivf_pq(num_partitions: u32, num_sub_vectors: u32, metric: MetricType) -> Self {
        Self { num_sub_vectors, ..Self::ivf_flat(num_partitions, metric) }
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n.max(1); self
    }
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed; self
    }

    pub fn is_quantized(&self) -> bool { self.num_sub_vectors > 0 }

    pub(crate) fn write_to(&self, w: &mut MetaWriter) {
        w.u32(self.num_partitions).u32(self.num_sub_vectors).u8(self.metric.tag())
            .u32(self.max_iterations).u64(self.seed);
    }

    pub(crate) fn read_from(r: &mut MetaReader) -> Result<Self> {
        let num_partitions  = r.u32()?;
        let num_sub_vectors = r.u32()?;
        let tag             = r.u8()?;
        let metric = MetricType::from_tag(tag)
            .ok_or_else(|| LanceError::corrupt("vector index params", format!("unknown metric tag {tag}")))?;
        Ok(Self { num_partitions, num_sub_vectors, metric, max_iterations: r.u32()?, seed: r.u64()? })
    }
}

/// 一个倒排分区：行地址与（原始向量或 PQ 编码）一一对应
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    pub row_ids: Vec<RowAddress>,
    /// IvfFlat：row_ids.len() × dim
    pub vectors: Vec<f32>,
    /// IvfPq：row_ids.len() × num_sub_vectors
    pub codes:   Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    dim:        usize,
    metric:     MetricType,
    centroids:  Vec<f32>,
    pq:         Option<ProductQuantizer>,
    partitions: Vec<Partition>,
}

impl VectorIndex {
    /// 供自定义 builder 组装结果
    pub fn from_parts(
        dim:        usize,
        metric:     MetricType,
        centroids:  Vec<f32>,
        pq:         Option<ProductQuantizer>,
        partitions: Vec<Partition>,
    ) -> Result<Self> {
        if dim == 0 || centroids.len() != partitions.len() * dim {
            return Err(LanceError::invalid(format!(
                "{} centroid floats do not describe {} partitions of dimension {dim}",
                centroids.len(), partitions.len())));
        }
        for (i, p) in partitions.iter().enumerate() {
            let ok = match &pq {
                Some(q) => p.codes.len() == p.row_ids.len() * q.num_sub_vectors && p.vectors.is_empty(),
                None    => p.vectors.len() == p.row_ids.len() * dim && p.codes.is_empty(),
            };
            if !ok {
                return Err(LanceError::invalid(format!("partition {i} payload does not match its row count")));
            }
        }
        Ok(Self { dim, metric, centroids, pq, partitions })
    }

    pub fn dim(&self)            -> usize      { self.dim }
    pub fn metric(&self)         -> MetricType { self.metric }
    pub fn num_partitions(&self) -> usize      { self.partitions.len() }
    pub fn is_quantized(&self)   -> bool       { self.pq.is_some() }
    pub fn num_rows(&self)       -> usize      { self.partitions.iter().map(|p| p.row_ids.len()).sum() }

    /// 近似 top-k；结果按 (距离, 行地址) 升序
    pub fn search(&self, query: &[f32], k: usize, nprobes: usize) -> Result<Vec<(RowAddress, f32)>> {
        if query.len() != self.dim {
            return Err(LanceError::invalid(format!(
                "query has dimension {}, index has {}", query.len(), self.dim)));
        }
        if k == 0 || self.partitions.is_empty() {
            return Ok(Vec::new());
        }
        let mut probe_query = query.to_vec();
        if self.metric == MetricType::Cosine {
            normalize(&mut probe_query);
        }

        let mut order: Vec<(usize, f32)> = self.centroids.chunks_exact(self.dim)
            .map(|c| distance::l2(c, &probe_query))
            .enumerate()
            .collect();
        order.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        let nprobes = nprobes.clamp(1, order.len());
        debug!("probing {nprobes} of {} partitions", order.len());

        let table = self.pq.as_ref().map(|q| q.distance_table(&probe_query, self.metric));
        let mut hits = Vec::new();
        for &(p, _) in &order[..nprobes] {
            let part = &self.partitions[p];
            match (&self.pq, &table) {
                (Some(q), Some(t)) => {
                    for (i, codes) in part.codes.chunks_exact(q.num_sub_vectors).enumerate() {
                        hits.push((part.row_ids[i], q.approx_distance(t, codes, self.metric)));
                    }
                }
                _ => {
                    for (i, v) in part.vectors.chunks_exact(self.dim).enumerate() {
                        hits.push((part.row_ids[i], self.metric.distance(query, v)));
                    }
                }
            }
        }
        Ok(top_k(hits, k))
    }

    // ── 序列化 ────────────────────────────────────────────────────────────────

    pub(crate) fn write_to(&self, w: &mut MetaWriter) {
        w.u32(self.dim as u32).u8(self.metric.tag()).f32_slice(&self.centroids);
        match &self.pq {
            Some(q) => { w.u8(1); q.write_to(w); }
            None    => { w.u8(0); }
        }
        w.u32(self.partitions.len() as u32);
        for p in &self.partitions {
            w.u64_slice(&p.row_ids).f32_slice(&p.vectors).bytes(&p.codes);
        }
    }

    pub(crate) fn read_from(r: &mut MetaReader) -> Result<Self> {
        let dim = r.u32()? as usize;
        let tag = r.u8()?;
        let metric = MetricType::from_tag(tag)
            .ok_or_else(|| LanceError::corrupt("vector index", format!("unknown metric tag {tag}")))?;
        let centroids = r.f32_vec()?;
        let pq = match r.u8()? {
            0 => None,
            _ => Some(ProductQuantizer::read_from(r)?),
        };
        let n = r.len_prefix(12)?;
        let mut partitions = Vec::with_capacity(n);
        for _ in 0..n {
            partitions.push(Partition { row_ids: r.u64_vec()?, vectors: r.f32_vec()?, codes: r.bytes()?.to_vec() });
        }
        Self::from_parts(dim, metric, centroids, pq, partitions)
            .map_err(|e| LanceError::corrupt("vector index", e.to_string()))
    }
}

/// 按 (距离, 行地址) 排序后截断
pub(crate) fn top_k(mut hits: Vec<(RowAddress, f32)>, k: usize) -> Vec<(RowAddress, f32)> {
    hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    hits.truncate(k);
    hits
}

// ── 构建 ──────────────────────────────────────────────────────────────────────

/// 向量索引构建器；加速实现（如 GPU）可替换默认的 CPU 版本
pub trait VectorIndexBuilder: Send + Sync {
    fn name(&self) -> &str;

    /// `vectors` 为 row_ids.len() × dim 的展平数据
    fn build(
        &self,
        params:  &VectorIndexParams,
        dim:     usize,
        row_ids: &[RowAddress],
        vectors: &[f32],
    ) -> Result<VectorIndex>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CpuVectorIndexBuilder;

impl VectorIndexBuilder for CpuVectorIndexBuilder {
    fn name(&self) -> &str { "cpu" }

    fn build(
        &self,
        params:  &VectorIndexParams,
        dim:     usize,
        row_ids: &[RowAddress],
        vectors: &[f32],
    ) -> Result<VectorIndex> {
        if dim == 0 || vectors.len() != row_ids.len() * dim {
            return Err(LanceError::invalid(format!(
                "{} floats for {} rows of dimension {dim}", vectors.len(), row_ids.len())));
        }
        if params.num_partitions == 0 {
            return Err(LanceError::invalid("an IVF index needs at least one partition"));
        }
        if row_ids.is_empty() {
            return Err(LanceError::invalid("cannot train a vector index on zero vectors"));
        }

        let mut train = vectors.to_vec();
        if params.metric == MetricType::Cosine {
            train.chunks_exact_mut(dim).for_each(normalize);
        }
        let ivf = KMeans::train(&train, dim, params.num_partitions as usize, params.max_iterations, params.seed);
        let pq = if params.is_quantized() {
            Some(ProductQuantizer::train(&train, dim, params.num_sub_vectors as usize,
                                         params.max_iterations, params.seed)?)
        } else {
            None
        };

        let mut partitions = vec![Partition::default(); ivf.k()];
        for ((&row, raw), unit) in row_ids.iter().zip(vectors.chunks_exact(dim)).zip(train.chunks_exact(dim)) {
            let part = &mut partitions[ivf.nearest(unit)];
            part.row_ids.push(row);
            match &pq {
                Some(q) => part.codes.extend(q.encode(unit)),
                None    => part.vectors.extend_from_slice(raw),
            }
        }
        debug!("built {} partitions over {} vectors (pq: {})", ivf.k(), row_ids.len(), pq.is_some());
        VectorIndex::from_parts(dim, params.metric, ivf.centroids, pq, partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;

    fn data(n: usize, dim: usize) -> (Vec<RowAddress>, Vec<f32>) {
        let mut rng = StdRng::seed_from_u64(11);
        ((0..n as u64).collect(), (0..n * dim).map(|_| rng.random::<f32>()).collect())
    }

    fn exact(vectors: &[f32], dim: usize, q: &[f32], k: usize, metric: MetricType) -> Vec<RowAddress> {
        let hits = vectors.chunks_exact(dim).enumerate()
            .map(|(i, v)| (i as u64, metric.distance(q, v)))
            .collect();
        top_k(hits, k).into_iter().map(|(r, _)| r).collect()
    }

    #[rstest]
    #[case(MetricType::L2)]
    #[case(MetricType::Cosine)]
    #[case(MetricType::Dot)]
    fn flat_index_probing_every_partition_is_exact(#[case] metric: MetricType) {
        let (rows, vecs) = data(200, 8);
        let idx = CpuVectorIndexBuilder.build(&VectorIndexParams::ivf_flat(4, metric), 8, &rows, &vecs).unwrap();
        assert_eq!(idx.num_rows(), 200);
        let q = &vecs[8 * 17..8 * 18];
        let got: Vec<_> = idx.search(q, 5, 4).unwrap().into_iter().map(|(r, _)| r).collect();
        assert_eq!(got, exact(&vecs, 8, q, 5, metric));
    }

    #[test]
    fn pq_index_finds_the_query_itself() {
        let (rows, vecs) = data(500, 16);
        let idx = CpuVectorIndexBuilder.build(&VectorIndexParams::ivf_pq(4, 4, MetricType::L2), 16, &rows, &vecs).unwrap();
        assert!(idx.is_quantized());
        let hits = idx.search(&vecs[16 * 42..16 * 43], 10, 4).unwrap();
        assert_eq!(hits.len(), 10);
        assert!(hits.iter().any(|&(r, _)| r == 42));
        assert!(hits.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn ties_break_on_lowest_row_address() {
        let rows = vec![9, 3, 5];
        let vecs = vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        let idx = CpuVectorIndexBuilder.build(&VectorIndexParams::ivf_flat(1, MetricType::L2), 2, &rows, &vecs).unwrap();
        let hits = idx.search(&[1.0, 1.0], 2, 1).unwrap();
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![3, 5]);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let (rows, vecs) = data(10, 4);
        let idx = CpuVectorIndexBuilder.build(&VectorIndexParams::ivf_flat(2, MetricType::L2), 4, &rows, &vecs).unwrap();
        assert!(matches!(idx.search(&[0.0; 3], 1, 1), Err(LanceError::InvalidInput(_))));
    }

    #[test]
    fn index_survives_serialization() {
        let (rows, vecs) = data(60, 4);
        let idx = CpuVectorIndexBuilder.build(&VectorIndexParams::ivf_pq(3, 2, MetricType::Dot), 4, &rows, &vecs).unwrap();
        let mut w = MetaWriter::new();
        idx.write_to(&mut w);
        let bytes = w.finish();
        assert_eq!(VectorIndex::read_from(&mut MetaReader::new(&bytes, "idx")).unwrap(), idx);
    }
}
