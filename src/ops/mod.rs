//! Differentiable kernels.
//!
//! Every kernel allocates a fresh result whose `requires_grad` is the OR of its
//! operands' flags. When set, the result carries a backward rule that accumulates
//! into the operands that require gradients.

pub mod activation;
pub mod core;
pub mod linear;
pub mod loss;

pub use self::activation::{leaky_relu, relu, relu_with, sigmoid, softmax, tanh};
pub use self::core::{add, argmax, mean, scale, sub, sum};
pub use self::linear::{matmul, matmul_with, slice};
pub use self::loss::{cross_entropy, mse_loss};

use crate::tensor::Tensor;

pub(crate) fn any_requires_grad(operands: &[&Tensor]) -> bool {
    operands.iter().any(|t| t.requires_grad())
}

/// Accumulate `contribution` into `operand` if it takes part in differentiation
pub(crate) fn propagate(operand: &Tensor, contribution: &[f32]) {
    if operand.requires_grad() {
        operand.accumulate_grad(contribution);
    }
}
