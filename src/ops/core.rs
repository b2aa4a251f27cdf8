//! Elementwise arithmetic with broadcasting, reductions and argmax

use crate::error::CrucibleResult;
use crate::tensor::{BroadcastPlan, Shape, Tensor};
use super::{any_requires_grad, propagate};

fn broadcast_binary(operation: &'static str, a: &Tensor, b: &Tensor, rhs_sign: f32) -> CrucibleResult<Tensor> {
    let plan = BroadcastPlan::new(operation, &a.shape(), &a.strides(), &b.shape(), &b.strides())?;
    let out_shape = plan.out_shape().clone();
    tracing::debug!(operation, lhs = %a.shape(), rhs = %b.shape(), out = %out_shape, "kernel");

    let data: Vec<f32> = {
        let (lhs, rhs) = (a.data(), b.data());
        (0..out_shape.numel())
            .map(|i| {
                let (l, r) = plan.offsets(i);
                lhs[l] + rhs_sign * rhs[r]
            })
            .collect()
    };

    let requires_grad = any_requires_grad(&[a, b]);
    let out = Tensor::from_parts(out_shape, data, requires_grad);

    if requires_grad {
        let (lhs, rhs) = (a.clone(), b.clone());
        out.attach_backward(
            move |node| {
                let mut grad_lhs = vec![0.0; lhs.numel()];
                let mut grad_rhs = vec![0.0; rhs.numel()];
                for (i, &g) in node.grad().iter().enumerate() {
                    let (l, r) = plan.offsets(i);
                    grad_lhs[l] += g;
                    grad_rhs[r] += rhs_sign * g;
                }
                propagate(&lhs, &grad_lhs);
                propagate(&rhs, &grad_rhs);
            },
            vec![a.clone(), b.clone()],
        );
    }

    Ok(out)
}

/// Elementwise sum with rank-aligned broadcasting
pub fn add(a: &Tensor, b: &Tensor) -> CrucibleResult<Tensor> {
    broadcast_binary("add", a, b, 1.0)
}

/// Elementwise difference `a - b` with rank-aligned broadcasting
pub fn sub(a: &Tensor, b: &Tensor) -> CrucibleResult<Tensor> {
    broadcast_binary("sub", a, b, -1.0)
}

/// Multiply every element by a constant
pub fn scale(t: &Tensor, factor: f32) -> Tensor {
    tracing::debug!(operation = "scale", shape = %t.shape(), factor, "kernel");
    let data = t.data().iter().map(|&v| v * factor).collect();
    let out = Tensor::from_parts(t.shape(), data, t.requires_grad());
    out.set_strides(t.strides());

    if t.requires_grad() {
        let input = t.clone();
        out.attach_backward(
            move |node| {
                let grad: Vec<f32> = node.grad().iter().map(|&g| g * factor).collect();
                propagate(&input, &grad);
            },
            vec![t.clone()],
        );
    }

    out
}

/// Sum of all elements as a `[1]` tensor
pub fn sum(t: &Tensor) -> Tensor {
    reduce("sum", t, 1.0)
}

/// Mean of all elements as a `[1]` tensor
pub fn mean(t: &Tensor) -> Tensor {
    reduce("mean", t, 1.0 / t.numel() as f32)
}

fn reduce(operation: &'static str, t: &Tensor, weight: f32) -> Tensor {
    tracing::debug!(operation, shape = %t.shape(), "kernel");
    let total: f32 = t.data().iter().sum::<f32>() * weight;
    let out = Tensor::from_parts(Shape::from([1]), vec![total], t.requires_grad());

    if t.requires_grad() {
        let input = t.clone();
        out.attach_backward(
            move |node| {
                let g = node.grad()[0] * weight;
                propagate(&input, &vec![g; input.numel()]);
            },
            vec![t.clone()],
        );
    }

    out
}

/// Flat index of the largest element; the first one wins on ties
pub fn argmax(t: &Tensor) -> usize {
    let data = t.data();
    assert!(!data.is_empty(), "contract violation: argmax of an empty tensor");
    let mut best = 0;
    for (i, &v) in data.iter().enumerate().skip(1) {
        if v > data[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::BackwardOptions;
    use crate::error::CrucibleError;

    fn tensor(values: &[f32], shape: &[usize], requires_grad: bool) -> Tensor {
        Tensor::from_vec(values.to_vec(), shape, requires_grad).unwrap()
    }

    #[test]
    fn test_add_same_shape() {
        let a = tensor(&[1.0, 2.0, 3.0], &[3], false);
        let b = tensor(&[10.0, 20.0, 30.0], &[3], false);
        let c = add(&a, &b).unwrap();
        assert_eq!(c.to_vec(), vec![11.0, 22.0, 33.0]);
        assert!(!c.requires_grad());
        assert!(!c.has_backward());
    }

    #[test]
    fn test_broadcast_backward_reduces() {
        let a = Tensor::ones([3, 2], true);
        let b = tensor(&[10.0, 20.0], &[2], true);
        let c = add(&a, &b).unwrap();
        assert_eq!(c.shape(), Shape::from([3, 2]));
        assert_eq!(c.to_vec(), vec![11.0, 21.0, 11.0, 21.0, 11.0, 21.0]);

        c.backward_with(Some(&[1.0; 6]), BackwardOptions::default());
        assert_eq!(b.grad_to_vec(), vec![3.0, 3.0]);
        assert_eq!(a.grad_to_vec(), vec![1.0; 6]);
    }

    #[test]
    fn test_broadcast_column_against_row() {
        let col = tensor(&[1.0, 2.0, 3.0], &[3, 1], true);
        let row = tensor(&[10.0, 20.0], &[1, 2], true);
        let c = add(&col, &row).unwrap();
        assert_eq!(c.shape(), Shape::from([3, 2]));
        assert_eq!(c.to_vec(), vec![11.0, 21.0, 12.0, 22.0, 13.0, 23.0]);

        c.backward_with(Some(&[1.0; 6]), BackwardOptions::default());
        assert_eq!(col.grad_to_vec(), vec![2.0, 2.0, 2.0]);
        assert_eq!(row.grad_to_vec(), vec![3.0, 3.0]);
    }

    #[test]
    fn test_broadcast_error_is_recoverable() {
        let a = Tensor::ones([3, 2], true);
        let b = Tensor::ones([3], true);
        let err = add(&a, &b).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(
            err,
            CrucibleError::broadcast("add", &Shape::from([3, 2]), &Shape::from([3]))
        );
    }

    #[test]
    fn test_sub_gradient_signs() {
        let a = tensor(&[5.0, 7.0], &[2], true);
        let b = tensor(&[1.0, 2.0], &[2], true);
        let c = sub(&a, &b).unwrap();
        assert_eq!(c.to_vec(), vec![4.0, 5.0]);

        sum(&c).backward_with(None, BackwardOptions::default());
        assert_eq!(a.grad_to_vec(), vec![1.0, 1.0]);
        assert_eq!(b.grad_to_vec(), vec![-1.0, -1.0]);
    }

    #[test]
    fn test_only_requiring_operands_receive_gradient() {
        let a = Tensor::ones([2], true);
        let b = Tensor::ones([2], false);
        sum(&add(&a, &b).unwrap()).backward_with(None, BackwardOptions::default());
        assert_eq!(a.grad_to_vec(), vec![1.0, 1.0]);
        assert_eq!(b.grad_to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_scale_and_mean() {
        let x = tensor(&[1.0, 2.0, 3.0, 6.0], &[2, 2], true);
        let m = mean(&scale(&x, 2.0));
        assert_eq!(m.to_vec(), vec![6.0]);

        m.backward_with(None, BackwardOptions::default());
        assert_eq!(x.grad_to_vec(), vec![0.5; 4]);
    }

    #[test]
    fn test_argmax_first_wins() {
        assert_eq!(argmax(&tensor(&[0.1, 0.9, 0.3, 0.9], &[4], false)), 1);
        assert_eq!(argmax(&tensor(&[-3.0, -1.0, -2.0], &[3], false)), 1);
    }
}
