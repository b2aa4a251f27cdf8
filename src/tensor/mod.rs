//! Tensor data model: shapes, storage, graph linkage and device mirrors

pub mod core;
pub mod devices;
pub mod shape;

pub use self::core::{NodeId, Tensor, WeakTensor};
pub use self::shape::{BroadcastPlan, Shape};
