//! Reverse-mode automatic differentiation
//!
//! Kernels build the graph as a side effect: every result that depends on a tensor
//! requiring gradients carries a [`BackwardFn`] and shared references to its operands.
//! [`Tensor::backward`](crate::Tensor::backward) orders the reachable nodes
//! topologically and runs their rules from the root towards the leaves, single-threaded.

pub mod function;
pub mod gradcheck;
pub mod graph;

pub use function::BackwardFn;
pub use gradcheck::{check_gradients, finite_diff_grad, max_grad_error};
pub use graph::{topological_sort, BackwardOptions};
