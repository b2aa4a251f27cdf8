//! Scalar losses with fused backward rules

use crate::backend::require_contiguous;
use crate::error::{CrucibleError, CrucibleResult};
use crate::tensor::{Shape, Tensor};
use super::activation::softmax_rows;
use super::{any_requires_grad, propagate};

const LOG_EPSILON: f32 = 1e-9;

fn check_same_shape(operation: &'static str, expected: &Tensor, got: &Tensor) -> CrucibleResult<Shape> {
    let (expected, got) = (expected.shape(), got.shape());
    if expected != got {
        return Err(CrucibleError::shape_mismatch(operation, &expected, &got));
    }
    Ok(expected)
}

/// `−mean(target · ln(softmax(logits) + ε))` as a `[1]` tensor.
///
/// Softmax is taken per row of the last dimension and the mean runs over all `N`
/// elements. The gradient `(softmax − target) / N · grad_out` flows into `logits`
/// only; it is exact for targets whose rows sum to one.
pub fn cross_entropy(logits: &Tensor, target: &Tensor) -> CrucibleResult<Tensor> {
    let shape = check_same_shape("cross_entropy", logits, target)?;
    require_contiguous("cross_entropy", logits);
    require_contiguous("cross_entropy", target);
    tracing::debug!(operation = "cross_entropy", shape = %shape, "kernel");

    let n = shape.numel();
    let mut probs = vec![0.0; n];
    softmax_rows(&logits.data(), shape.row_len(), &mut probs);

    let loss = {
        let y = target.data();
        let total: f32 = probs
            .iter()
            .zip(y.iter())
            .map(|(&s, &t)| -t * (s + LOG_EPSILON).ln())
            .sum();
        total / n as f32
    };

    let requires_grad = any_requires_grad(&[logits, target]);
    let out = Tensor::from_parts(Shape::from([1]), vec![loss], requires_grad);

    if requires_grad {
        let (x, y) = (logits.clone(), target.clone());
        out.attach_backward(
            move |node| {
                let scale = node.grad()[0] / n as f32;
                let grad: Vec<f32> = {
                    let y = y.data();
                    probs.iter().zip(y.iter()).map(|(&s, &t)| (s - t) * scale).collect()
                };
                propagate(&x, &grad);
            },
            vec![logits.clone(), target.clone()],
        );
    }

    Ok(out)
}

/// `mean((pred − target)²)` as a `[1]` tensor
pub fn mse_loss(pred: &Tensor, target: &Tensor) -> CrucibleResult<Tensor> {
    let shape = check_same_shape("mse_loss", pred, target)?;
    require_contiguous("mse_loss", pred);
    require_contiguous("mse_loss", target);
    tracing::debug!(operation = "mse_loss", shape = %shape, "kernel");

    let n = shape.numel();
    let loss = {
        let (p, t) = (pred.data(), target.data());
        let total: f32 = p.iter().zip(t.iter()).map(|(&p, &t)| (p - t) * (p - t)).sum();
        total / n as f32
    };

    let requires_grad = any_requires_grad(&[pred, target]);
    let out = Tensor::from_parts(Shape::from([1]), vec![loss], requires_grad);

    if requires_grad {
        let (p, t) = (pred.clone(), target.clone());
        out.attach_backward(
            move |node| {
                let scale = 2.0 * node.grad()[0] / n as f32;
                let grad: Vec<f32> = {
                    let (pd, td) = (p.data(), t.data());
                    pd.iter().zip(td.iter()).map(|(&a, &b)| (a - b) * scale).collect()
                };
                let negated: Vec<f32> = grad.iter().map(|g| -g).collect();
                propagate(&p, &grad);
                propagate(&t, &negated);
            },
            vec![pred.clone(), target.clone()],
        );
    }

    Ok(out)
}
