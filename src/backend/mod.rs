//! BLAS-like compute backends.
//!
//! A [`Backend`] works on flat row-major slices. [`ExecutionContext`] is the handle
//! kernels receive: it wraps a backend and adds the tensor-level entry points that
//! check contiguity before handing buffers over. The process-wide handle
//! ([`set_backend`] / [`current_backend`]) is read by [`ExecutionContext::current`];
//! the last writer wins and swapping while kernels run is the caller's problem.

pub mod cpu;
pub mod device;
pub mod reference;

use std::fmt::{self, Debug};
use std::ops::Deref;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::{RwLock, RwLockReadGuard};

use crate::config::{BackendConfig, BackendKind};
use crate::error::CrucibleResult;
use crate::tensor::Tensor;

pub use cpu::CpuBackend;
pub use device::{DeviceError, DeviceMemory, DevicePtr, HostMirrorDevice};
pub use reference::ReferenceBackend;

/// Borrowed row-major matrix
#[derive(Debug, Clone, Copy)]
pub struct MatRef<'a> {
    pub data: &'a [f32],
    pub rows: usize,
    pub cols: usize,
}

impl<'a> MatRef<'a> {
    pub fn new(data: &'a [f32], rows: usize, cols: usize) -> Self {
        assert_eq!(
            data.len(),
            rows * cols,
            "contract violation: {} elements for a {}x{} matrix",
            data.len(),
            rows,
            cols
        );
        Self { data, rows, cols }
    }

    pub fn row(&self, i: usize) -> &'a [f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }
}

/// Dense primitives every backend provides
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// `y += alpha * x`
    fn axpy(&self, alpha: f32, x: &[f32], y: &mut [f32]);

    fn dot(&self, x: &[f32], y: &[f32]) -> f32;

    /// `y = alpha * A x + beta * y`
    fn gemv(&self, alpha: f32, a: MatRef<'_>, x: &[f32], beta: f32, y: &mut [f32]);

    /// `C = alpha * A B + beta * C`, with `C` of shape `a.rows x b.cols`
    fn gemm(&self, alpha: f32, a: MatRef<'_>, b: MatRef<'_>, beta: f32, c: &mut [f32]);

    /// In-place `max(x, 0)`
    fn relu(&self, x: &mut [f32]);
}

pub(crate) fn check_vector_lengths(operation: &str, x: usize, y: usize) {
    assert_eq!(x, y, "contract violation: {} on vectors of {} and {} elements", operation, x, y);
}

pub(crate) fn check_gemv_dims(a: &MatRef<'_>, x: &[f32], y: &[f32]) {
    assert!(
        x.len() == a.cols && y.len() == a.rows,
        "contract violation: gemv with a {}x{} matrix, x of {} and y of {} elements",
        a.rows,
        a.cols,
        x.len(),
        y.len()
    );
}

pub(crate) fn check_gemm_dims(a: &MatRef<'_>, b: &MatRef<'_>, c: &[f32]) {
    assert!(
        a.cols == b.rows && c.len() == a.rows * b.cols,
        "contract violation: gemm of {}x{} by {}x{} into {} elements",
        a.rows,
        a.cols,
        b.rows,
        b.cols,
        c.len()
    );
}

/// Fail unless `tensor` is laid out contiguously in row-major order
pub(crate) fn require_contiguous(operation: &str, tensor: &Tensor) {
    assert!(
        tensor.is_contiguous(),
        "contract violation: {} requires a contiguous row-major tensor, got shape {} with strides {:?}",
        operation,
        tensor.shape(),
        tensor.strides()
    );
}

fn require_matrix(operation: &str, tensor: &Tensor) -> (usize, usize) {
    let shape = tensor.shape();
    assert_eq!(
        shape.ndim(),
        2,
        "contract violation: {} expects a rank-2 tensor, got shape {}",
        operation,
        shape
    );
    (shape.dim(0), shape.dim(1))
}

lazy_static! {
    static ref CURRENT_BACKEND: RwLock<Arc<dyn Backend>> = RwLock::new(Arc::new(CpuBackend::default()));
}

/// Backend kernels use when handed [`ExecutionContext::current`]
pub fn current_backend() -> Arc<dyn Backend> {
    CURRENT_BACKEND.read().clone()
}

/// Replace the process-wide backend
pub fn set_backend(backend: Arc<dyn Backend>) {
    tracing::info!(backend = backend.name(), "compute backend installed");
    *CURRENT_BACKEND.write() = backend;
}

/// Build a backend from configuration
pub fn backend_from_config(config: &BackendConfig) -> CrucibleResult<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match config.kind {
        BackendKind::Cpu => Arc::new(CpuBackend::from_config(config)?),
        BackendKind::Reference => Arc::new(ReferenceBackend),
    };
    Ok(backend)
}

/// Build the configured backend and make it the process-wide one
pub fn install_from_config(config: &BackendConfig) -> CrucibleResult<()> {
    set_backend(backend_from_config(config)?);
    Ok(())
}

/// Backend handle passed to kernels
#[derive(Clone)]
pub struct ExecutionContext {
    backend: Arc<dyn Backend>,
}

impl Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl ExecutionContext {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Context over the process-wide backend at the time of the call
    pub fn current() -> Self {
        Self::new(current_backend())
    }

    /// Sequential reference kernels
    pub fn reference() -> Self {
        Self::new(Arc::new(ReferenceBackend))
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn name(&self) -> &'static str {
        self.backend.name()
    }

    /// `y += alpha * x` over whole tensors
    pub fn axpy(&self, alpha: f32, x: &Tensor, y: &Tensor) {
        require_contiguous("axpy", x);
        require_contiguous("axpy", y);
        check_vector_lengths("axpy", x.numel(), y.numel());

        let xs = operand_data(x, y);
        self.backend.axpy(alpha, &xs, &mut y.data_mut());
    }

    pub fn dot(&self, x: &Tensor, y: &Tensor) -> f32 {
        require_contiguous("dot", x);
        require_contiguous("dot", y);
        check_vector_lengths("dot", x.numel(), y.numel());
        self.backend.dot(&x.data(), &y.data())
    }

    /// `y = alpha * A x + beta * y` with `A` of rank 2
    pub fn gemv(&self, a: &Tensor, x: &Tensor, y: &Tensor, alpha: f32, beta: f32) {
        require_contiguous("gemv", a);
        require_contiguous("gemv", x);
        require_contiguous("gemv", y);
        let (rows, cols) = require_matrix("gemv", a);

        let a_data = operand_data(a, y);
        let x_data = operand_data(x, y);
        let mut y_data = y.data_mut();
        self.backend.gemv(alpha, MatRef::new(&a_data, rows, cols), &x_data, beta, &mut y_data);
    }

    /// `C = alpha * A B + beta * C` with all three tensors of rank 2
    pub fn gemm(&self, a: &Tensor, b: &Tensor, c: &Tensor, alpha: f32, beta: f32) {
        require_contiguous("gemm", a);
        require_contiguous("gemm", b);
        require_contiguous("gemm", c);
        let (m, k) = require_matrix("gemm", a);
        let (k2, n) = require_matrix("gemm", b);
        let (cm, cn) = require_matrix("gemm", c);
        assert!(
            k == k2 && cm == m && cn == n,
            "contract violation: gemm of {} by {} into {}",
            a.shape(),
            b.shape(),
            c.shape()
        );

        let a_data = operand_data(a, c);
        let b_data = operand_data(b, c);
        let mut c_data = c.data_mut();
        self.backend.gemm(alpha, MatRef::new(&a_data, m, k), MatRef::new(&b_data, k, n), beta, &mut c_data);
    }

    /// In-place rectifier
    pub fn relu(&self, x: &Tensor) {
        require_contiguous("relu", x);
        self.backend.relu(&mut x.data_mut());
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::current()
    }
}

/// Read access to an input buffer; copied when it aliases the output being written
enum Operand<'a> {
    Shared(RwLockReadGuard<'a, Vec<f32>>),
    Copied(Vec<f32>),
}

impl Deref for Operand<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        match self {
            Operand::Shared(guard) => guard.as_slice(),
            Operand::Copied(values) => values.as_slice(),
        }
    }
}

fn operand_data<'a>(input: &'a Tensor, output: &Tensor) -> Operand<'a> {
    if input.ptr_eq(output) {
        Operand::Copied(input.to_vec())
    } else {
        Operand::Shared(input.data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: usize, cols: usize, values: &[f32]) -> Tensor {
        Tensor::from_vec(values.to_vec(), [rows, cols], false).unwrap()
    }

    fn contexts() -> Vec<ExecutionContext> {
        vec![
            ExecutionContext::reference(),
            ExecutionContext::new(Arc::new(CpuBackend::new(2))),
        ]
    }

    #[test]
    fn test_gemm_alpha_beta() {
        for ctx in contexts() {
            let a = matrix(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
            let b = matrix(3, 2, &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
            let c = matrix(2, 2, &[1.0, 1.0, 1.0, 1.0]);
            ctx.gemm(&a, &b, &c, 2.0, 0.5);
            assert_eq!(c.to_vec(), vec![116.5, 128.5, 278.5, 308.5], "{}", ctx.name());
        }
    }

    #[test]
    fn test_gemv_axpy_dot_relu() {
        for ctx in contexts() {
            let a = matrix(2, 2, &[1.0, 2.0, 3.0, 4.0]);
            let x = Tensor::from_vec(vec![1.0, -1.0], [2], false).unwrap();
            let y = Tensor::from_vec(vec![10.0, 20.0], [2], false).unwrap();
            ctx.gemv(&a, &x, &y, 1.0, 1.0);
            assert_eq!(y.to_vec(), vec![9.0, 19.0]);

            ctx.axpy(-2.0, &x, &y);
            assert_eq!(y.to_vec(), vec![7.0, 21.0]);
            assert!((ctx.dot(&x, &y) + 14.0).abs() < 1e-6);

            ctx.relu(&x);
            assert_eq!(x.to_vec(), vec![1.0, 0.0]);
        }
    }

    #[test]
    fn test_axpy_aliasing() {
        let ctx = ExecutionContext::reference();
        let x = Tensor::from_vec(vec![1.0, 2.0], [2], false).unwrap();
        ctx.axpy(1.0, &x, &x);
        assert_eq!(x.to_vec(), vec![2.0, 4.0]);
    }

    #[test]
    #[should_panic(expected = "contiguous")]
    fn test_gemm_rejects_non_contiguous() {
        let a = matrix(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let b = matrix(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let c = Tensor::zeros([2, 2], false);
        a.set_strides(vec![1, 2]);
        ExecutionContext::new(Arc::new(CpuBackend::default())).gemm(&a, &b, &c, 1.0, 0.0);
    }

    #[test]
    #[should_panic(expected = "contract violation: gemm")]
    fn test_gemm_rejects_mismatched_dims() {
        let a = Tensor::zeros([2, 3], false);
        let b = Tensor::zeros([2, 2], false);
        let c = Tensor::zeros([2, 2], false);
        ExecutionContext::reference().gemm(&a, &b, &c, 1.0, 0.0);
    }

    #[test]
    fn test_backend_from_config() {
        let mut config = BackendConfig::default();
        config.kind = BackendKind::Reference;
        assert_eq!(backend_from_config(&config).unwrap().name(), "reference");

        config.kind = BackendKind::Cpu;
        config.num_threads = 2;
        assert_eq!(backend_from_config(&config).unwrap().name(), "cpu");
    }
}
