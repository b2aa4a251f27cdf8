//! Topological ordering and the reverse pass

use std::collections::HashSet;

use crate::config::{self, AutogradConfig};
use crate::tensor::{NodeId, Tensor};

/// Knobs of a single reverse pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackwardOptions {
    /// Keep backward rules and operand links so the graph can be traversed again
    pub retain_graph: bool,
    /// Zero every reachable gradient buffer before seeding the root
    pub clear_existing: bool,
    /// Emit a warning when the default seed is applied to a multi-element root
    pub warn_on_non_scalar_seed: bool,
}

impl Default for BackwardOptions {
    fn default() -> Self {
        Self::from(&AutogradConfig::default())
    }
}

impl From<&AutogradConfig> for BackwardOptions {
    fn from(config: &AutogradConfig) -> Self {
        Self {
            retain_graph: config.retain_graph,
            clear_existing: config.clear_existing,
            warn_on_non_scalar_seed: config.warn_on_non_scalar_seed,
        }
    }
}

impl BackwardOptions {
    pub fn retain_graph(mut self, retain: bool) -> Self {
        self.retain_graph = retain;
        self
    }

    pub fn clear_existing(mut self, clear: bool) -> Self {
        self.clear_existing = clear;
        self
    }
}

/// Every node reachable from `root` through operand links, operands before dependents.
///
/// Depth-first postorder with an explicit stack; each node appears once.
pub fn topological_sort(root: &Tensor) -> Vec<Tensor> {
    let mut order = Vec::new();
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut stack = vec![(root.clone(), false)];

    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !visited.insert(node.id()) {
            continue;
        }
        let parents = node.parents();
        stack.push((node, true));
        for parent in parents.into_iter().rev() {
            if !visited.contains(&parent.id()) {
                stack.push((parent, false));
            }
        }
    }

    order
}

impl Tensor {
    /// Reverse pass with the default seed and the globally configured options
    pub fn backward(&self) {
        let options = BackwardOptions::from(&config::get_config().autograd);
        self.backward_with(None, options);
    }

    /// Reverse pass from this tensor.
    ///
    /// `seed` must hold exactly one value per element. Without a seed, 1.0 is placed
    /// at flat index 0 and every other element is seeded with 0.0.
    pub fn backward_with(&self, seed: Option<&[f32]>, options: BackwardOptions) {
        let order = topological_sort(self);
        let numel = self.numel();

        if options.clear_existing {
            for node in &order {
                node.zero_grad();
            }
        }

        match seed {
            Some(values) => {
                assert_eq!(
                    values.len(),
                    numel,
                    "contract violation: seed of {} elements for root {} of shape {}",
                    values.len(),
                    self.id(),
                    self.shape()
                );
                self.grad_mut().copy_from_slice(values);
            }
            None => {
                if numel > 1 && options.warn_on_non_scalar_seed {
                    tracing::warn!(
                        root = %self.id(),
                        shape = %self.shape(),
                        "default seed applied to a non-scalar root; only element 0 is seeded"
                    );
                }
                let mut grad = self.grad_mut();
                grad.iter_mut().for_each(|g| *g = 0.0);
                if let Some(first) = grad.first_mut() {
                    *first = 1.0;
                }
            }
        }

        for node in order.iter().rev() {
            let grad_fn = node.0.grad_fn.lock();
            if let Some(backward) = grad_fn.as_ref() {
                tracing::trace!(node = %node.id(), shape = %node.shape(), "propagating gradient");
                backward(node);
            }
        }

        if !options.retain_graph {
            for node in &order {
                node.release_graph();
            }
        }
    }
}
