//! 乘积量化（PQ）
//!
//! 向量切成 `num_sub_vectors` 段，每段独立训练至多 256 个中心，
//! 编码后每段 1 字节。查询时先算“查询子段 → 各中心”的距离表，
//! 候选的近似距离即按编码查表求和。
//!
//! Cosine 度量下输入须已归一化：单位向量间 1 - cos = |a - b|² / 2。

use crate::common::{LanceError, Result};
use crate::format::{MetaReader, MetaWriter};
use super::distance::{dot, l2, MetricType};
use super::kmeans::KMeans;

pub const MAX_CENTROIDS: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct ProductQuantizer {
    pub dim:             usize,
    pub num_sub_vectors: usize,
    pub num_centroids:   usize,
    /// [sub_vector][centroid][sub_dim]
    codebook:            Vec<f32>,
}

impl ProductQuantizer {
    pub fn train(data: &[f32], dim: usize, num_sub_vectors: usize, max_iterations: u32, seed: u64) -> Result<Self> {
        if num_sub_vectors == 0 || dim % num_sub_vectors != 0 {
            return Err(LanceError::invalid(format!(
                "dimension {dim} is not divisible into {num_sub_vectors} sub-vectors")));
        }
        let n = data.len() / dim;
        if n == 0 {
            return Err(LanceError::invalid("cannot train a product quantizer on zero vectors"));
        }
        let sub_dim = dim / num_sub_vectors;
        let num_centroids = n.min(MAX_CENTROIDS);

        let mut codebook = Vec::with_capacity(num_sub_vectors * num_centroids * sub_dim);
        for s in 0..num_sub_vectors {
            let sub: Vec<f32> = data.chunks_exact(dim)
                .flat_map(|v| v[s * sub_dim..(s + 1) * sub_dim].iter().copied())
                .collect();
            let km = KMeans::train(&sub, sub_dim, num_centroids, max_iterations, seed.wrapping_add(s as u64));
            codebook.extend_from_slice(&km.centroids);
        }
        Ok(Self { dim, num_sub_vectors, num_centroids, codebook })
    }

    fn sub_dim(&self) -> usize { self.dim / self.num_sub_vectors }

    fn centroid(&self, sub: usize, c: usize) -> &[f32] {
        let sd = self.sub_dim();
        let start = (sub * self.num_centroids + c) * sd;
        &self.codebook[start..start + sd]
    }

    pub fn encode(&self, v: &[f32]) -> Vec<u8> {
        let sd = self.sub_dim();
        (0..self.num_sub_vectors)
            .map(|s| {
                let part = &v[s * sd..(s + 1) * sd];
                (0..self.num_centroids)
                    .map(|c| (c, l2(self.centroid(s, c), part)))
                    .fold((0, f32::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
                    .0 as u8
            })
            .collect()
    }

    /// 长度 num_sub_vectors × num_centroids
    pub fn distance_table(&self, query: &[f32], metric: MetricType) -> Vec<f32> {
        let sd = self.sub_dim();
        let mut table = Vec::with_capacity(self.num_sub_vectors * self.num_centroids);
        for s in 0..self.num_sub_vectors {
            let part = &query[s * sd..(s + 1) * sd];
            for c in 0..self.num_centroids {
                let centroid = self.centroid(s, c);
                table.push(match metric {
                    MetricType::Dot => dot(part, centroid),
                    MetricType::L2 | MetricType::Cosine => l2(part, centroid),
                });
            }
        }
        table
    }

    pub fn approx_distance(&self, table: &[f32], codes: &[u8], metric: MetricType) -> f32 {
        let sum: f32 = codes.iter().enumerate()
            .map(|(s, &c)| table[s * self.num_centroids + c as usize])
            .sum();
        match metric {
            MetricType::L2     => sum,
            MetricType::Cosine => sum / 2.0,
            MetricType::Dot    => 1.0 - sum,
        }
    }

    pub(crate) fn write_to(&self, w: &mut MetaWriter) {
        w.u32(self.dim as u32).u32(self.num_sub_vectors as u32).u32(self.num_centroids as u32)
            .f32_slice(&self.codebook);
    }

    pub(crate) fn read_from(r: &mut MetaReader) -> Result<Self> {
        let dim             = r.u32()? as usize;
        let num_sub_vectors = r.u32()? as usize;
        let num_centroids   = r.u32()? as usize;
        let codebook        = r.f32_vec()?;
        if num_sub_vectors == 0 || dim % num_sub_vectors != 0 || num_centroids > MAX_CENTROIDS
            || codebook.len() != num_centroids * dim
        {
            return Err(LanceError::corrupt("pq codebook", format!(
                "dim {dim}, {num_sub_vectors} sub-vectors, {num_centroids} centroids, {} floats",
                codebook.len())));
        }
        Ok(Self { dim, num_sub_vectors, num_centroids, codebook })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_vectors(n: usize, dim: usize) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(3);
        (0..n * dim).map(|_| rng.random::<f32>()).collect()
    }

    #[test]
    fn approximate_distance_tracks_exact_distance() {
        let dim = 8;
        let data = random_vectors(300, dim);
        let pq = ProductQuantizer::train(&data, dim, 4, 10, 1).unwrap();
        let q = &data[..dim];
        let table = pq.distance_table(q, MetricType::L2);
        let self_dist = pq.approx_distance(&table, &pq.encode(q), MetricType::L2);
        let far: Vec<f32> = q.iter().map(|x| x + 5.0).collect();
        let far_dist = pq.approx_distance(&table, &pq.encode(&far), MetricType::L2);
        assert!(self_dist < far_dist);
        assert!(self_dist < 0.5);
    }

    #[test]
    fn small_samples_use_fewer_centroids() {
        let data = random_vectors(10, 4);
        let pq = ProductQuantizer::train(&data, 4, 2, 5, 0).unwrap();
        assert_eq!(pq.num_centroids, 10);
        assert_eq!(pq.encode(&data[..4]).len(), 2);
    }

    #[test]
    fn indivisible_dimension_is_rejected() {
        let err = ProductQuantizer::train(&random_vectors(4, 6), 6, 4, 5, 0).unwrap_err();
        assert!(matches!(err, LanceError::InvalidInput(_)));
    }

    #[test]
    fn codebook_survives_serialization() {
        let pq = ProductQuantizer::train(&random_vectors(50, 4), 4, 2, 5, 0).unwrap();
        let mut w = MetaWriter::new();
        pq.write_to(&mut w);
        let bytes = w.finish();
        let back = ProductQuantizer::read_from(&mut MetaReader::new(&bytes, "pq")).unwrap();
        assert_eq!(back, pq);
    }
}
