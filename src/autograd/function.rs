//! Backward rules attached to kernel results

use crate::tensor::Tensor;

/// Local derivative rule of a kernel result.
///
/// The closure receives the node it is attached to, reads that node's gradient
/// buffer at invocation time and accumulates into the gradients of the operands it
/// captured. It must never overwrite an operand gradient.
pub type BackwardFn = Box<dyn Fn(&Tensor) + Send + Sync>;

impl Tensor {
    /// Attach the backward rule and operand list of a freshly computed tensor.
    ///
    /// Called once per tensor, by the kernel that created it, before the tensor is
    /// handed out. The operand list keeps the operands alive until the graph is
    /// released after `backward`.
    pub fn attach_backward<F>(&self, backward: F, operands: Vec<Tensor>)
    where
        F: Fn(&Tensor) + Send + Sync + 'static,
    {
        assert!(
            !operands.is_empty(),
            "contract violation: backward rule for tensor {} needs at least one operand",
            self.id()
        );
        let mut grad_fn = self.0.grad_fn.lock();
        assert!(
            grad_fn.is_none(),
            "contract violation: backward rule already attached to tensor {}",
            self.id()
        );
        *grad_fn = Some(Box::new(backward));
        *self.0.parents.lock() = operands;
    }

    /// Drop the backward rule and the operand references
    pub(crate) fn release_graph(&self) {
        let released = self.0.grad_fn.lock().take();
        let operands = std::mem::take(&mut *self.0.parents.lock());
        drop(released);
        drop(operands);
    }
}
