//! Lloyd k-means（L2）
//!
//! 初始中心从样本中无放回随机抽取；种子固定，相同输入得到相同结果。
//! 某轮没有分到任何点的中心保留上一轮的位置。

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use super::distance::l2;

#[derive(Debug, Clone, PartialEq)]
pub struct KMeans {
    pub dim:       usize,
    /// k × dim，按行展平
    pub centroids: Vec<f32>,
}

impl KMeans {
    /// `k` 超过样本数时截断为样本数；空输入得到 0 个中心
    pub fn train(data: &[f32], dim: usize, k: usize, max_iterations: u32, seed: u64) -> Self {
        let n = if dim == 0 { 0 } else { data.len() / dim };
        let k = k.min(n);
        if k == 0 {
            return Self { dim, centroids: Vec::new() };
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut centroids: Vec<f32> = sample(&mut rng, n, k).into_iter()
            .flat_map(|i| data[i * dim..(i + 1) * dim].iter().copied())
            .collect();

        let mut assignment = vec![usize::MAX; n];
        for _ in 0..max_iterations.max(1) {
            let mut changed = false;
            for (i, v) in data.chunks_exact(dim).enumerate() {
                let c = nearest(&centroids, dim, v);
                if assignment[i] != c {
                    assignment[i] = c;
                    changed = true;
                }
            }
            if !changed {
                break;
            }

            let mut sums = vec![0.0f32; k * dim];
            let mut counts = vec![0usize; k];
            for (v, &c) in data.chunks_exact(dim).zip(&assignment) {
                counts[c] += 1;
                sums[c * dim..(c + 1) * dim].iter_mut().zip(v).for_each(|(s, x)| *s += x);
            }
            for c in (0..k).filter(|&c| counts[c] > 0) {
                let n = counts[c] as f32;
                for d in 0..dim {
                    centroids[c * dim + d] = sums[c * dim + d] / n;
                }
            }
        }
        Self { dim, centroids }
    }

    pub fn k(&self) -> usize {
        if self.dim == 0 { 0 } else { self.centroids.len() / self.dim }
    }

    pub fn centroid(&self, i: usize) -> &[f32] {
        &self.centroids[i * self.dim..(i + 1) * self.dim]
    }

    pub fn nearest(&self, v: &[f32]) -> usize {
        nearest(&self.centroids, self.dim, v)
    }
}

/// 距离最近的中心下标；并列时取下标小者
pub(crate) fn nearest(centroids: &[f32], dim: usize, v: &[f32]) -> usize {
    let mut best = (0, f32::INFINITY);
    for (i, c) in centroids.chunks_exact(dim).enumerate() {
        let d = l2(c, v);
        if d < best.1 {
            best = (i, d);
        }
    }
    best.0
}
