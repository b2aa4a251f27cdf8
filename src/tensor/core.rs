//! Core tensor type: dense f32 buffer, gradient accumulator and graph linkage

use std::fmt::{self, Debug, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rand::Rng;

use crate::autograd::BackwardFn;
use crate::error::{CrucibleError, CrucibleResult};
use super::devices::DeviceAllocation;
use super::shape::Shape;

static NODE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_node_id() -> NodeId {
    NodeId(NODE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Process-unique identity of a tensor node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Layout {
    pub(crate) shape: Shape,
    pub(crate) strides: Vec<usize>,
}

/// Storage and graph linkage behind a [`Tensor`] handle
pub(crate) struct TensorNode {
    pub(crate) id: NodeId,
    pub(crate) layout: RwLock<Layout>,
    pub(crate) data: RwLock<Vec<f32>>,
    pub(crate) grad: RwLock<Vec<f32>>,
    pub(crate) requires_grad: bool,
    pub(crate) grad_fn: Mutex<Option<BackwardFn>>,
    pub(crate) parents: Mutex<Vec<Tensor>>,
    pub(crate) device: Mutex<Option<DeviceAllocation>>,
}

/// Shared handle to a dense n-dimensional f32 array with a gradient buffer.
///
/// Cloning the handle shares the node. A node stays alive while any caller or
/// downstream result still holds it as an operand.
#[derive(Clone)]
pub struct Tensor(pub(crate) Arc<TensorNode>);

/// Non-owning handle, mostly useful to observe that a graph has been released
#[derive(Clone)]
pub struct WeakTensor(Weak<TensorNode>);

impl WeakTensor {
    pub fn upgrade(&self) -> Option<Tensor> {
        self.0.upgrade().map(Tensor)
    }
}

impl Tensor {
    fn from_node_parts(shape: Shape, data: Vec<f32>, requires_grad: bool) -> Self {
        let numel = shape.numel();
        let strides = shape.contiguous_strides();
        Tensor(Arc::new(TensorNode {
            id: next_node_id(),
            layout: RwLock::new(Layout { shape, strides }),
            data: RwLock::new(data),
            grad: RwLock::new(vec![0.0; numel]),
            requires_grad,
            grad_fn: Mutex::new(None),
            parents: Mutex::new(Vec::new()),
            device: Mutex::new(None),
        }))
    }

    /// Used by kernels that already hold a correctly sized buffer
    pub(crate) fn from_parts(shape: Shape, data: Vec<f32>, requires_grad: bool) -> Self {
        assert_eq!(
            data.len(),
            shape.numel(),
            "contract violation: buffer of {} elements for shape {}",
            data.len(),
            shape
        );
        Self::from_node_parts(shape, data, requires_grad)
    }

    // === Constructors ===

    /// Tensor of the given shape with every element set to `fill` and a zeroed gradient
    pub fn new(shape: impl Into<Shape>, fill: f32, requires_grad: bool) -> Self {
        let shape = shape.into();
        let data = vec![fill; shape.numel()];
        Self::from_node_parts(shape, data, requires_grad)
    }

    pub fn zeros(shape: impl Into<Shape>, requires_grad: bool) -> Self {
        Self::new(shape, 0.0, requires_grad)
    }

    pub fn ones(shape: impl Into<Shape>, requires_grad: bool) -> Self {
        Self::new(shape, 1.0, requires_grad)
    }

    /// Single-element tensor of shape `[1]`
    pub fn scalar(value: f32, requires_grad: bool) -> Self {
        Self::new([1], value, requires_grad)
    }

    pub fn from_vec(data: Vec<f32>, shape: impl Into<Shape>, requires_grad: bool) -> CrucibleResult<Self> {
        let shape = shape.into();
        if data.len() != shape.numel() {
            return Err(CrucibleError::shape_mismatch(
                "from_vec",
                &shape,
                &Shape::new(vec![data.len()]),
            ));
        }
        Ok(Self::from_node_parts(shape, data, requires_grad))
    }

    /// Elements drawn uniformly from `[low, high)`
    pub fn random_uniform<R: Rng>(
        shape: impl Into<Shape>,
        low: f32,
        high: f32,
        requires_grad: bool,
        rng: &mut R,
    ) -> Self {
        let shape = shape.into();
        let data = (0..shape.numel()).map(|_| rng.gen_range(low..high)).collect();
        Self::from_node_parts(shape, data, requires_grad)
    }

    // === Accessors ===

    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn shape(&self) -> Shape {
        self.0.layout.read().shape.clone()
    }

    pub fn strides(&self) -> Vec<usize> {
        self.0.layout.read().strides.clone()
    }

    pub fn ndim(&self) -> usize {
        self.0.layout.read().shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.0.layout.read().shape.numel()
    }

    pub fn requires_grad(&self) -> bool {
        self.0.requires_grad
    }

    pub fn is_contiguous(&self) -> bool {
        let layout = self.0.layout.read();
        layout.shape.is_contiguous(&layout.strides)
    }

    /// Read access to the flat data buffer.
    ///
    /// Reads are recursive so the same tensor can be read twice by one kernel.
    pub fn data(&self) -> RwLockReadGuard<'_, Vec<f32>> {
        self.0.data.read_recursive()
    }

    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Vec<f32>> {
        self.0.data.write()
    }

    pub fn grad(&self) -> RwLockReadGuard<'_, Vec<f32>> {
        self.0.grad.read_recursive()
    }

    pub fn grad_mut(&self) -> RwLockWriteGuard<'_, Vec<f32>> {
        self.0.grad.write()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data().clone()
    }

    pub fn grad_to_vec(&self) -> Vec<f32> {
        self.grad().clone()
    }

    /// Reset the gradient buffer to zeros in place
    pub fn zero_grad(&self) {
        self.grad_mut().iter_mut().for_each(|g| *g = 0.0);
    }

    /// Add `contribution` elementwise into the gradient buffer
    pub(crate) fn accumulate_grad(&self, contribution: &[f32]) {
        let mut grad = self.grad_mut();
        assert_eq!(
            grad.len(),
            contribution.len(),
            "contract violation: gradient contribution of {} elements for {} tensor",
            contribution.len(),
            grad.len()
        );
        for (g, c) in grad.iter_mut().zip(contribution) {
            *g += c;
        }
    }

    /// Operands this tensor was computed from (empty for leaves and after release)
    pub fn parents(&self) -> Vec<Tensor> {
        self.0.parents.lock().clone()
    }

    pub fn has_backward(&self) -> bool {
        self.0.grad_fn.lock().is_some()
    }

    pub fn is_leaf(&self) -> bool {
        self.0.parents.lock().is_empty()
    }

    pub fn ptr_eq(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakTensor {
        WeakTensor(Arc::downgrade(&self.0))
    }

    // === Indexing ===

    fn flat_index(&self, indices: &[usize]) -> usize {
        let layout = self.0.layout.read();
        assert_eq!(
            indices.len(),
            layout.shape.ndim(),
            "contract violation: {} indices for rank-{} tensor {}",
            indices.len(),
            layout.shape.ndim(),
            layout.shape
        );
        let mut offset = 0;
        for (axis, (&idx, &stride)) in indices.iter().zip(&layout.strides).enumerate() {
            assert!(
                idx < layout.shape.dim(axis),
                "contract violation: index {} out of bounds for axis {} of {}",
                idx,
                axis,
                layout.shape
            );
            offset += idx * stride;
        }
        offset
    }

    /// Element at a multi-index (stride dot-product into the flat buffer)
    pub fn at(&self, indices: &[usize]) -> f32 {
        let offset = self.flat_index(indices);
        let data = self.data();
        assert!(offset < data.len(), "contract violation: strides address past the buffer");
        data[offset]
    }

    pub fn set_at(&self, indices: &[usize], value: f32) {
        let offset = self.flat_index(indices);
        let mut data = self.data_mut();
        assert!(offset < data.len(), "contract violation: strides address past the buffer");
        data[offset] = value;
    }

    // === Layout ===

    /// Relabel the buffer with a new shape of the same element count
    pub fn reshape(&self, new_shape: impl Into<Shape>) {
        let new_shape = new_shape.into();
        let mut layout = self.0.layout.write();
        assert_eq!(
            new_shape.numel(),
            layout.shape.numel(),
            "contract violation: cannot reshape {} into {}",
            layout.shape,
            new_shape
        );
        layout.strides = new_shape.contiguous_strides();
        layout.shape = new_shape;
    }

    /// Override the stride bookkeeping without moving any data.
    ///
    /// Backends only accept row-major contiguous strides.
    pub fn set_strides(&self, strides: Vec<usize>) {
        let mut layout = self.0.layout.write();
        assert_eq!(
            strides.len(),
            layout.shape.ndim(),
            "contract violation: {} strides for rank-{} tensor",
            strides.len(),
            layout.shape.ndim()
        );
        layout.strides = strides;
    }

    /// Log shape, values and gradient under `name`
    pub fn print(&self, name: &str) {
        tracing::info!("tensor {} {}\n{}", name, self.id(), self);
    }
}

fn join(values: &[f32]) -> String {
    values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ")
}

fn write_buffer(f: &mut fmt::Formatter<'_>, label: &str, shape: &Shape, buffer: &[f32]) -> fmt::Result {
    match shape.ndim() {
        0 | 1 => writeln!(f, "{}: [{}]", label, join(buffer)),
        2 => {
            writeln!(f, "{}: [", label)?;
            for row in buffer.chunks(shape.dim(1).max(1)) {
                writeln!(f, "  [{}]", join(row))?;
            }
            writeln!(f, "]")
        }
        rank => writeln!(f, "{}: (not shown for rank {})", label, rank),
    }
}

impl Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = self.shape();
        writeln!(f, "Shape    : {}", shape)?;
        write_buffer(f, "Values   ", &shape, &self.data())?;
        write_buffer(f, "Gradient ", &shape, &self.grad())
    }
}

impl Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id())
            .field("shape", &self.shape())
            .field("requires_grad", &self.requires_grad())
            .field("has_backward", &self.has_backward())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_construct_fills_and_zeroes_gradient() {
        let t = Tensor::new([2, 3], 1.5, true);
        assert_eq!(t.numel(), 6);
        assert_eq!(t.strides(), vec![3, 1]);
        assert!(t.to_vec().iter().all(|&v| v == 1.5));
        assert_eq!(t.grad_to_vec(), vec![0.0; 6]);
        assert!(t.requires_grad());
        assert!(t.is_leaf());
        assert!(!t.has_backward());
    }

    #[test]
    fn test_factories() {
        assert!(Tensor::zeros([4], false).to_vec().iter().all(|&v| v == 0.0));
        assert!(Tensor::ones([2, 2], false).to_vec().iter().all(|&v| v == 1.0));
        assert_eq!(Tensor::scalar(3.0, false).shape(), Shape::from([1]));

        let err = Tensor::from_vec(vec![1.0, 2.0, 3.0], [2, 2], false).unwrap_err();
        assert_eq!(err.operation(), Some("from_vec"));
    }

    #[test]
    fn test_random_uniform_is_bounded_and_seeded() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = Tensor::random_uniform([16], -0.5, 0.5, false, &mut rng);
        assert!(a.to_vec().iter().all(|&v| (-0.5..0.5).contains(&v)));

        let mut rng = StdRng::seed_from_u64(7);
        let b = Tensor::random_uniform([16], -0.5, 0.5, false, &mut rng);
        assert_eq!(a.to_vec(), b.to_vec());
    }

    #[test]
    fn test_at_uses_strides() {
        let t = Tensor::from_vec((0..6).map(|v| v as f32).collect(), [2, 3], false).unwrap();
        assert_eq!(t.at(&[0, 0]), 0.0);
        assert_eq!(t.at(&[1, 2]), 5.0);
        t.set_at(&[1, 0], 42.0);
        assert_eq!(t.to_vec()[3], 42.0);
    }

    #[test]
    #[should_panic(expected = "contract violation")]
    fn test_at_rejects_wrong_rank() {
        let t = Tensor::zeros([2, 3], false);
        t.at(&[1]);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_at_rejects_out_of_bounds() {
        let t = Tensor::zeros([2, 3], false);
        t.at(&[2, 0]);
    }

    #[test]
    fn test_reshape_recomputes_strides() {
        let t = Tensor::from_vec((0..6).map(|v| v as f32).collect(), [2, 3], false).unwrap();
        t.reshape([3, 2]);
        assert_eq!(t.strides(), vec![2, 1]);
        assert_eq!(t.at(&[2, 1]), 5.0);
    }

    #[test]
    #[should_panic(expected = "cannot reshape")]
    fn test_reshape_rejects_size_change() {
        Tensor::zeros([2, 3], false).reshape([4, 2]);
    }

    #[test]
    fn test_set_strides_breaks_contiguity() {
        let t = Tensor::zeros([2, 3], false);
        assert!(t.is_contiguous());
        t.set_strides(vec![1, 2]);
        assert!(!t.is_contiguous());
    }

    #[test]
    fn test_zero_grad() {
        let t = Tensor::zeros([3], true);
        t.accumulate_grad(&[1.0, 2.0, 3.0]);
        t.accumulate_grad(&[1.0, 1.0, 1.0]);
        assert_eq!(t.grad_to_vec(), vec![2.0, 3.0, 4.0]);
        t.zero_grad();
        assert_eq!(t.grad_to_vec(), vec![0.0; 3]);
    }

    #[test]
    fn test_display_rank_two() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], [2, 2], false).unwrap();
        let text = t.to_string();
        assert!(text.contains("Shape    : [2, 2]"));
        assert!(text.contains("  [1, 2]"));
        assert!(text.contains("  [3, 4]"));
    }

    #[test]
    fn test_identity() {
        let a = Tensor::zeros([1], false);
        let b = a.clone();
        let c = Tensor::zeros([1], false);
        assert!(a.ptr_eq(&b));
        assert_eq!(a.id(), b.id());
        assert!(!a.ptr_eq(&c));
        assert_ne!(a.id(), c.id());
    }
}
