//! Central finite differences for verifying analytic gradients

use crate::tensor::Tensor;
use super::graph::BackwardOptions;

/// Numerical gradient of `loss` with respect to every element of `input`.
///
/// `loss` must recompute its value from the current contents of `input`. Each element
/// is perturbed in place and restored afterwards; the step is measured on the
/// perturbed f32 values so that rounding of `x ± eps` does not bias the quotient.
pub fn finite_diff_grad<F>(input: &Tensor, eps: f64, loss: F) -> Vec<f64>
where
    F: Fn() -> f64,
{
    let numel = input.numel();
    let mut grad = Vec::with_capacity(numel);

    for i in 0..numel {
        let original = input.data()[i];
        let plus = (original as f64 + eps) as f32;
        let minus = (original as f64 - eps) as f32;

        input.data_mut()[i] = plus;
        let loss_plus = loss();
        input.data_mut()[i] = minus;
        let loss_minus = loss();
        input.data_mut()[i] = original;

        grad.push((loss_plus - loss_minus) / (plus as f64 - minus as f64));
    }

    grad
}

/// Largest elementwise difference, relative to the magnitude of the values with a floor of 1
pub fn max_grad_error(analytic: &[f32], numeric: &[f64]) -> f64 {
    assert_eq!(
        analytic.len(),
        numeric.len(),
        "contract violation: comparing {} analytic against {} numeric gradients",
        analytic.len(),
        numeric.len()
    );
    analytic
        .iter()
        .zip(numeric)
        .map(|(&a, &n)| {
            let a = a as f64;
            let scale = a.abs().max(n.abs()).max(1.0);
            (a - n).abs() / scale
        })
        .fold(0.0, f64::max)
}

/// Compare backward gradients against finite differences for every input.
///
/// `build` recomputes the output from `inputs`; the scalar being differentiated is
/// `Σ seed_i · output_i`, which is what `backward_with(Some(seed), ..)` propagates.
/// Returns the worst error over all inputs.
pub fn check_gradients<F>(inputs: &[Tensor], seed: &[f32], eps: f64, build: F) -> f64
where
    F: Fn() -> Tensor,
{
    for input in inputs {
        input.zero_grad();
    }
    let output = build();
    output.backward_with(Some(seed), BackwardOptions::default().retain_graph(false).clear_existing(true));

    let weighted = || {
        let output = build();
        let data = output.data();
        let total: f64 = data.iter()
            .zip(seed)
            .map(|(&y, &g)| y as f64 * g as f64)
            .sum();
        total
    };

    inputs
        .iter()
        .map(|input| {
            let analytic = input.grad_to_vec();
            let numeric = finite_diff_grad(input, eps, &weighted);
            let error = max_grad_error(&analytic, &numeric);
            tracing::debug!(input = %input.id(), error, "gradient check");
            error
        })
        .fold(0.0, f64::max)
}
