//! Sequential, unblocked kernels

use super::{check_gemm_dims, check_gemv_dims, check_vector_lengths, Backend, MatRef};

/// Straight loops in natural order. Deterministic, used as the default for kernels
/// called without a context and as the oracle for optimised backends.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceBackend;

impl Backend for ReferenceBackend {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn axpy(&self, alpha: f32, x: &[f32], y: &mut [f32]) {
        check_vector_lengths("axpy", x.len(), y.len());
        for (y, &x) in y.iter_mut().zip(x) {
            *y += alpha * x;
        }
    }

    fn dot(&self, x: &[f32], y: &[f32]) -> f32 {
        check_vector_lengths("dot", x.len(), y.len());
        x.iter().zip(y).map(|(&a, &b)| a * b).sum()
    }

    fn gemv(&self, alpha: f32, a: MatRef<'_>, x: &[f32], beta: f32, y: &mut [f32]) {
        check_gemv_dims(&a, x, y);
        for (i, y) in y.iter_mut().enumerate() {
            let acc: f32 = a.row(i).iter().zip(x).map(|(&a, &x)| a * x).sum();
            *y = if beta == 0.0 { alpha * acc } else { alpha * acc + beta * *y };
        }
    }

    fn gemm(&self, alpha: f32, a: MatRef<'_>, b: MatRef<'_>, beta: f32, c: &mut [f32]) {
        check_gemm_dims(&a, &b, c);
        let n = b.cols;
        for i in 0..a.rows {
            let a_row = a.row(i);
            for j in 0..n {
                let mut acc = 0.0;
                for (p, &a_ip) in a_row.iter().enumerate() {
                    acc += a_ip * b.data[p * n + j];
                }
                let out = &mut c[i * n + j];
                *out = if beta == 0.0 { alpha * acc } else { alpha * acc + beta * *out };
            }
        }
    }

    fn relu(&self, x: &mut [f32]) {
        for v in x.iter_mut() {
            if *v < 0.0 {
                *v = 0.0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_gemm() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let eye = [1.0, 0.0, 0.0, 1.0];
        let mut c = [0.0; 4];
        ReferenceBackend.gemm(1.0, MatRef::new(&a, 2, 2), MatRef::new(&eye, 2, 2), 0.0, &mut c);
        assert_eq!(c, a);
    }

    #[test]
    fn test_relu_keeps_nan() {
        let mut x = [f32::NAN, -3.0, 0.5];
        ReferenceBackend.relu(&mut x);
        assert!(x[0].is_nan());
        assert_eq!(&x[1..], &[0.0, 0.5]);
    }

    #[test]
    #[should_panic(expected = "contract violation: dot")]
    fn test_dot_length_mismatch() {
        ReferenceBackend.dot(&[1.0, 2.0], &[1.0]);
    }
}
