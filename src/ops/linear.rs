//! Matrix multiplication and leading-dimension slicing

use crate::backend::{require_contiguous, ExecutionContext, MatRef};
use crate::error::{CrucibleError, CrucibleResult};
use crate::tensor::{Shape, Tensor};
use super::{any_requires_grad, propagate};

/// Batch count and per-batch `(m, k, n)` of a supported matmul
struct MatmulDims {
    batch: usize,
    m: usize,
    k: usize,
    n: usize,
}

impl MatmulDims {
    fn resolve(a: &Shape, b: &Shape) -> CrucibleResult<Self> {
        match (a.dims(), b.dims()) {
            (&[m, k], &[k2, n]) => {
                if k != k2 {
                    return Err(CrucibleError::dimension_mismatch("matmul", a, b));
                }
                Ok(Self { batch: 1, m, k, n })
            }
            (&[batch, m, k], &[batch2, k2, n]) => {
                if batch != batch2 || k != k2 {
                    return Err(CrucibleError::dimension_mismatch("matmul", a, b));
                }
                Ok(Self { batch, m, k, n })
            }
            _ => Err(CrucibleError::unsupported_rank("matmul", a, b)),
        }
    }

    fn out_shape(&self, rank: usize) -> Shape {
        if rank == 2 {
            Shape::from([self.m, self.n])
        } else {
            Shape::from([self.batch, self.m, self.n])
        }
    }
}

/// Matrix product with the reference kernels
pub fn matmul(a: &Tensor, b: &Tensor) -> CrucibleResult<Tensor> {
    matmul_with(&ExecutionContext::reference(), a, b)
}

/// Matrix product of two rank-2 tensors, or batched product of two rank-3 tensors
/// sharing their leading dimension. The forward pass runs on `ctx`.
pub fn matmul_with(ctx: &ExecutionContext, a: &Tensor, b: &Tensor) -> CrucibleResult<Tensor> {
    let (a_shape, b_shape) = (a.shape(), b.shape());
    let dims = MatmulDims::resolve(&a_shape, &b_shape)?;
    require_contiguous("matmul", a);
    require_contiguous("matmul", b);

    let out_shape = dims.out_shape(a_shape.ndim());
    tracing::debug!(
        operation = "matmul",
        backend = ctx.name(),
        lhs = %a_shape,
        rhs = %b_shape,
        out = %out_shape,
        "kernel"
    );

    let MatmulDims { batch, m, k, n } = dims;
    let mut data = vec![0.0; batch * m * n];
    {
        let (lhs, rhs) = (a.data(), b.data());
        for bi in 0..batch {
            let a_mat = MatRef::new(&lhs[bi * m * k..(bi + 1) * m * k], m, k);
            let b_mat = MatRef::new(&rhs[bi * k * n..(bi + 1) * k * n], k, n);
            ctx.backend().gemm(1.0, a_mat, b_mat, 0.0, &mut data[bi * m * n..(bi + 1) * m * n]);
        }
    }

    let requires_grad = any_requires_grad(&[a, b]);
    let out = Tensor::from_parts(out_shape, data, requires_grad);

    if requires_grad {
        let (lhs, rhs) = (a.clone(), b.clone());
        out.attach_backward(
            move |node| {
                let grad = node.grad();
                let a_data = lhs.data();
                let b_data = rhs.data();
                let mut grad_a = vec![0.0; batch * m * k];
                let mut grad_b = vec![0.0; batch * k * n];

                for bi in 0..batch {
                    let (a_off, b_off, g_off) = (bi * m * k, bi * k * n, bi * m * n);
                    // dA = dOut · Bᵗ
                    for i in 0..m {
                        for p in 0..k {
                            let mut acc = 0.0;
                            for j in 0..n {
                                acc += grad[g_off + i * n + j] * b_data[b_off + p * n + j];
                            }
                            grad_a[a_off + i * k + p] += acc;
                        }
                    }
                    // dB = Aᵗ · dOut
                    for p in 0..k {
                        for j in 0..n {
                            let mut acc = 0.0;
                            for i in 0..m {
                                acc += a_data[a_off + i * k + p] * grad[g_off + i * n + j];
                            }
                            grad_b[b_off + p * n + j] += acc;
                        }
                    }
                }

                drop((grad, a_data, b_data));
                propagate(&lhs, &grad_a);
                propagate(&rhs, &grad_b);
            },
            vec![a.clone(), b.clone()],
        );
    }

    Ok(out)
}

/// Copy of the block at `index` along the leading dimension.
///
/// A `[rows, cols]` tensor yields a `[cols]` row, a `[batch, rows, cols]` tensor a
/// `[rows, cols]` matrix.
pub fn slice(t: &Tensor, index: usize) -> Tensor {
    let shape = t.shape();
    assert!(
        shape.ndim() == 2 || shape.ndim() == 3,
        "contract violation: slice expects a rank-2 or rank-3 tensor, got shape {}",
        shape
    );
    assert!(
        index < shape.dim(0),
        "contract violation: slice index {} out of bounds for shape {}",
        index,
        shape
    );
    require_contiguous("slice", t);

    let block_shape = Shape::from(&shape.dims()[1..]);
    let block = block_shape.numel();
    let offset = index * block;
    tracing::debug!(operation = "slice", shape = %shape, index, "kernel");

    let data = t.data()[offset..offset + block].to_vec();
    let out = Tensor::from_parts(block_shape, data, t.requires_grad());

    if t.requires_grad() {
        let parent = t.clone();
        out.attach_backward(
            move |node| {
                let mut grad = vec![0.0; parent.numel()];
                grad[offset..offset + block].copy_from_slice(&node.grad());
                propagate(&parent, &grad);
            },
            vec![t.clone()],
        );
    }

    out
}
