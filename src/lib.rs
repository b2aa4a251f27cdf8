//! Crucible - reverse-mode automatic differentiation over dense f32 tensors
//!
//! Features:
//! - Shared tensor handles with gradient buffers and dynamically built graphs
//! - Broadcasting arithmetic, batched matmul, slicing, activations, softmax and losses
//! - Pluggable BLAS-like backends (blocked parallel CPU GEMM, sequential reference)
//! - Device memory lifecycle hooks for accelerator backends

pub mod autograd;
pub mod backend;
pub mod config;
pub mod error;
pub mod ops;
pub mod tensor;

pub use autograd::{check_gradients, finite_diff_grad, max_grad_error, topological_sort, BackwardOptions};
pub use backend::{current_backend, set_backend, Backend, CpuBackend, ExecutionContext, ReferenceBackend};
pub use config::{get_config, reset_config, update_config, ConfigBuilder, CrucibleConfig};
pub use error::{CrucibleError, CrucibleResult, ErrorCode};
pub use tensor::{NodeId, Shape, Tensor, WeakTensor};

/// Install the log subscriber and the configured backend.
///
/// Safe to call more than once; an already installed subscriber is kept.
pub fn init() -> CrucibleResult<()> {
    if tracing_subscriber::fmt::try_init().is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    let config = get_config();
    backend::install_from_config(&config.backend)?;
    tracing::info!(backend = current_backend().name(), "Crucible initialized");
    Ok(())
}

/// Get the current crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
