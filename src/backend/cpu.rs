//! Data-parallel CPU backend with a blocked GEMM

use std::fmt::{self, Debug};
use std::sync::Arc;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::BackendConfig;
use crate::error::{CrucibleError, CrucibleResult};
use super::{check_gemm_dims, check_gemv_dims, check_vector_lengths, Backend, MatRef};

pub const DEFAULT_BLOCK_SIZE: usize = 64;

/// CPU kernels parallelised with rayon.
///
/// Runs on the global rayon pool unless built with an explicit thread count.
#[derive(Clone)]
pub struct CpuBackend {
    block_size: usize,
    pool: Option<Arc<ThreadPool>>,
}

impl CpuBackend {
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0, "contract violation: gemm block size must be positive");
        Self { block_size, pool: None }
    }

    /// Backend with its own pool of `num_threads` workers
    pub fn with_threads(block_size: usize, num_threads: usize) -> CrucibleResult<Self> {
        let mut backend = Self::new(block_size);
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("crucible-cpu-{}", i))
            .build()
            .map_err(|e| CrucibleError::BackendError(e.to_string()))?;
        backend.pool = Some(Arc::new(pool));
        Ok(backend)
    }

    pub fn from_config(config: &BackendConfig) -> CrucibleResult<Self> {
        if config.block_size == 0 {
            return Err(CrucibleError::ConfigurationError(
                "backend.block_size must be positive".to_string(),
            ));
        }
        if config.num_threads == 0 {
            Ok(Self::new(config.block_size))
        } else {
            Self::with_threads(config.block_size, config.num_threads)
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn run<R, F>(&self, f: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl Debug for CpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuBackend")
            .field("block_size", &self.block_size)
            .field("threads", &self.pool.as_ref().map(|p| p.current_num_threads()))
            .finish()
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn axpy(&self, alpha: f32, x: &[f32], y: &mut [f32]) {
        check_vector_lengths("axpy", x.len(), y.len());
        self.run(|| {
            y.par_iter_mut()
                .zip(x.par_iter())
                .for_each(|(y, &x)| *y += alpha * x);
        });
    }

    fn dot(&self, x: &[f32], y: &[f32]) -> f32 {
        check_vector_lengths("dot", x.len(), y.len());
        self.run(|| x.par_iter().zip(y.par_iter()).map(|(&a, &b)| a * b).sum())
    }

    fn gemv(&self, alpha: f32, a: MatRef<'_>, x: &[f32], beta: f32, y: &mut [f32]) {
        check_gemv_dims(&a, x, y);
        self.run(|| {
            y.par_iter_mut().enumerate().for_each(|(i, y)| {
                let acc: f32 = a.row(i).iter().zip(x).map(|(&a, &x)| a * x).sum();
                *y = if beta == 0.0 { alpha * acc } else { alpha * acc + beta * *y };
            });
        });
    }

    fn gemm(&self, alpha: f32, a: MatRef<'_>, b: MatRef<'_>, beta: f32, c: &mut [f32]) {
        check_gemm_dims(&a, &b, c);
        let (k, n) = (a.cols, b.cols);
        if c.is_empty() {
            return;
        }
        let bs = self.block_size;

        self.run(|| {
            if beta == 0.0 {
                c.par_iter_mut().for_each(|v| *v = 0.0);
            } else if beta != 1.0 {
                c.par_iter_mut().for_each(|v| *v *= beta);
            }

            // Each row of C is owned by one task; the K tiles accumulate into it in order
            c.par_chunks_mut(bs * n).enumerate().for_each(|(block, c_block)| {
                let i0 = block * bs;

                for kk in (0..k).step_by(bs) {
                    let k_end = (kk + bs).min(k);
                    c_block.par_chunks_mut(n).enumerate().for_each(|(i, c_row)| {
                        let a_row = a.row(i0 + i);
                        for jj in (0..n).step_by(bs) {
                            let j_end = (jj + bs).min(n);
                            for p in kk..k_end {
                                let scaled = alpha * a_row[p];
                                let b_row = b.row(p);
                                for j in jj..j_end {
                                    c_row[j] += scaled * b_row[j];
                                }
                            }
                        }
                    });
                }
            });
        });
    }

    fn relu(&self, x: &mut [f32]) {
        self.run(|| {
            x.par_iter_mut().for_each(|v| {
                if *v < 0.0 {
                    *v = 0.0;
                }
            })
        });
    }
}
