//! Activation functions and softmax

use crate::backend::{require_contiguous, ExecutionContext};
use crate::tensor::Tensor;
use super::propagate;

/// Result of an elementwise map, with the layout of `t`
fn map_unary(operation: &'static str, t: &Tensor, f: impl Fn(f32) -> f32) -> Tensor {
    tracing::debug!(operation, shape = %t.shape(), "kernel");
    let data = t.data().iter().map(|&v| f(v)).collect();
    let out = Tensor::from_parts(t.shape(), data, t.requires_grad());
    out.set_strides(t.strides());
    out
}

/// Attach `grad_in_i = coeff(x_i, y_i) · grad_out_i`, with `x` the input and `y` the output
fn attach_elementwise<F>(out: &Tensor, input: &Tensor, coeff: F)
where
    F: Fn(f32, f32) -> f32 + Send + Sync + 'static,
{
    if !input.requires_grad() {
        return;
    }
    let source = input.clone();
    out.attach_backward(
        move |node| {
            let grad: Vec<f32> = {
                let (x, y, g) = (source.data(), node.data(), node.grad());
                x.iter()
                    .zip(y.iter())
                    .zip(g.iter())
                    .map(|((&x, &y), &g)| coeff(x, y) * g)
                    .collect()
            };
            propagate(&source, &grad);
        },
        vec![input.clone()],
    );
}

/// Rectified linear unit with the reference kernels
pub fn relu(t: &Tensor) -> Tensor {
    relu_with(&ExecutionContext::reference(), t)
}

/// Rectified linear unit; the forward pass is the backend's in-place relu on a copy
pub fn relu_with(ctx: &ExecutionContext, t: &Tensor) -> Tensor {
    require_contiguous("relu", t);
    tracing::debug!(operation = "relu", backend = ctx.name(), shape = %t.shape(), "kernel");
    let mut data = t.to_vec();
    ctx.backend().relu(&mut data);
    let out = Tensor::from_parts(t.shape(), data, t.requires_grad());
    attach_elementwise(&out, t, |x, _| if x > 0.0 { 1.0 } else { 0.0 });
    out
}

pub fn leaky_relu(t: &Tensor, alpha: f32) -> Tensor {
    let out = map_unary("leaky_relu", t, |x| if x > 0.0 { x } else { alpha * x });
    attach_elementwise(&out, t, move |x, _| if x > 0.0 { 1.0 } else { alpha });
    out
}

pub fn sigmoid(t: &Tensor) -> Tensor {
    let out = map_unary("sigmoid", t, |x| 1.0 / (1.0 + (-x).exp()));
    attach_elementwise(&out, t, |_, s| s * (1.0 - s));
    out
}

pub fn tanh(t: &Tensor) -> Tensor {
    let out = map_unary("tanh", t, f32::tanh);
    attach_elementwise(&out, t, |_, y| 1.0 - y * y);
    out
}

/// Stabilised softmax of each row of `x`, written into `out`
pub(crate) fn softmax_rows(x: &[f32], row_len: usize, out: &mut [f32]) {
    if row_len == 0 {
        return;
    }
    for (row, out_row) in x.chunks(row_len).zip(out.chunks_mut(row_len)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut total = 0.0;
        for (o, &v) in out_row.iter_mut().zip(row) {
            *o = (v - max).exp();
            total += *o;
        }
        for o in out_row.iter_mut() {
            *o /= total;
        }
    }
}

/// Softmax over the last dimension; rank 0 and rank 1 tensors form a single row.
///
/// Backward is the full Jacobian-vector product
/// `grad_in_i = s_i · (grad_out_i − Σ_j grad_out_j · s_j)` per row.
pub fn softmax(t: &Tensor) -> Tensor {
    require_contiguous("softmax", t);
    let shape = t.shape();
    let row_len = shape.row_len();
    tracing::debug!(operation = "softmax", shape = %shape, row_len, "kernel");

    let mut data = vec![0.0; shape.numel()];
    softmax_rows(&t.data(), row_len, &mut data);
    let out = Tensor::from_parts(shape, data, t.requires_grad());

    if t.requires_grad() && row_len > 0 {
        let input = t.clone();
        out.attach_backward(
            move |node| {
                let grad: Vec<f32> = {
                    let (s, g) = (node.data(), node.grad());
                    let mut grad = vec![0.0; s.len()];
                    for ((s_row, g_row), out_row) in s
                        .chunks(row_len)
                        .zip(g.chunks(row_len))
                        .zip(grad.chunks_mut(row_len))
                    {
                        let weighted: f32 = s_row.iter().zip(g_row).map(|(&s, &g)| s * g).sum();
                        for ((o, &s), &g) in out_row.iter_mut().zip(s_row).zip(g_row) {
                            *o = s * (g - weighted);
                        }
                    }
                    grad
                };
                propagate(&input, &grad);
            },
            vec![t.clone()],
        );
    }

    out
}
