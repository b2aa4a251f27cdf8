//! Shapes, row-major strides and the broadcasting plan used by elementwise kernels

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::error::{CrucibleError, CrucibleResult};

/// Ordered dimension sizes of a dense tensor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    /// Product of all dimensions (1 for rank 0)
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn dim(&self, axis: usize) -> usize {
        self.dims[axis]
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// True for single-element tensors, whatever their rank
    pub fn is_scalar(&self) -> bool {
        self.numel() == 1
    }

    /// Row-major strides: the last dimension is contiguous
    pub fn contiguous_strides(&self) -> Vec<usize> {
        let mut strides = vec![0; self.dims.len()];
        let mut stride = 1;
        for i in (0..self.dims.len()).rev() {
            strides[i] = stride;
            stride *= self.dims[i];
        }
        strides
    }

    /// Whether `strides` describes a contiguous row-major layout of this shape
    pub fn is_contiguous(&self, strides: &[usize]) -> bool {
        if strides.len() != self.dims.len() {
            return false;
        }
        let mut expect = 1;
        for i in (0..self.dims.len()).rev() {
            if strides[i] != expect {
                return false;
            }
            expect *= self.dims[i];
        }
        true
    }

    /// Size of the trailing "row" used by row-wise kernels (softmax, cross-entropy)
    pub fn row_len(&self) -> usize {
        match self.dims.last() {
            Some(&last) if self.dims.len() >= 2 => last,
            _ => self.numel(),
        }
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.dims.iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", "))
    }
}

/// Precomputed index mapping for a rank-aligned broadcast of two operands.
///
/// Shapes are right-aligned; broadcast dimensions get stride 0 so that every
/// output position maps to the operand element it reads.
#[derive(Debug, Clone)]
pub struct BroadcastPlan {
    out_shape: Shape,
    lhs_strides: Vec<usize>,
    rhs_strides: Vec<usize>,
}

impl BroadcastPlan {
    pub fn new(
        operation: &'static str,
        lhs: &Shape,
        lhs_strides: &[usize],
        rhs: &Shape,
        rhs_strides: &[usize],
    ) -> CrucibleResult<Self> {
        let ndim = lhs.ndim().max(rhs.ndim());
        let lhs_shift = ndim - lhs.ndim();
        let rhs_shift = ndim - rhs.ndim();

        let mut out_dims = Vec::with_capacity(ndim);
        let mut lhs_eff = vec![0; ndim];
        let mut rhs_eff = vec![0; ndim];

        for d in 0..ndim {
            let l = if d < lhs_shift { 1 } else { lhs.dim(d - lhs_shift) };
            let r = if d < rhs_shift { 1 } else { rhs.dim(d - rhs_shift) };

            if l != r && l != 1 && r != 1 {
                return Err(CrucibleError::broadcast(operation, lhs, rhs));
            }
            out_dims.push(l.max(r));

            if l != 1 {
                lhs_eff[d] = lhs_strides[d - lhs_shift];
            }
            if r != 1 {
                rhs_eff[d] = rhs_strides[d - rhs_shift];
            }
        }

        Ok(Self {
            out_shape: Shape::new(out_dims),
            lhs_strides: lhs_eff,
            rhs_strides: rhs_eff,
        })
    }

    pub fn out_shape(&self) -> &Shape {
        &self.out_shape
    }

    /// Operand offsets read by output position `flat`
    pub fn offsets(&self, flat: usize) -> (usize, usize) {
        let dims = self.out_shape.dims();
        let mut rest = flat;
        let mut lhs = 0;
        let mut rhs = 0;
        for d in (0..dims.len()).rev() {
            let idx = rest % dims[d];
            rest /= dims[d];
            lhs += idx * self.lhs_strides[d];
            rhs += idx * self.rhs_strides[d];
        }
        (lhs, rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_strides() {
        let shape = Shape::from([2, 3, 4]);
        assert_eq!(shape.contiguous_strides(), vec![12, 4, 1]);
        assert_eq!(shape.numel(), 24);
        assert!(shape.is_contiguous(&[12, 4, 1]));
        assert!(!shape.is_contiguous(&[1, 2, 6]));
        assert!(!shape.is_contiguous(&[4, 1]));
    }

    #[test]
    fn test_rank_zero_shape() {
        let shape = Shape::new(vec![]);
        assert_eq!(shape.numel(), 1);
        assert!(shape.is_scalar());
        assert!(shape.contiguous_strides().is_empty());
        assert_eq!(shape.to_string(), "[]");
    }

    #[test]
    fn test_broadcast_plan_trailing_vector() {
        let a = Shape::from([3, 2]);
        let b = Shape::from([2]);
        let plan = BroadcastPlan::new("add", &a, &a.contiguous_strides(), &b, &b.contiguous_strides()).unwrap();
        assert_eq!(plan.out_shape(), &Shape::from([3, 2]));
        assert_eq!(plan.offsets(0), (0, 0));
        assert_eq!(plan.offsets(3), (3, 1));
        assert_eq!(plan.offsets(4), (4, 0));
    }

    #[test]
    fn test_broadcast_plan_both_sides() {
        let a = Shape::from([3, 1]);
        let b = Shape::from([1, 4]);
        let plan = BroadcastPlan::new("add", &a, &a.contiguous_strides(), &b, &b.contiguous_strides()).unwrap();
        assert_eq!(plan.out_shape(), &Shape::from([3, 4]));
        // row 2, column 3
        assert_eq!(plan.offsets(11), (2, 3));
    }

    #[test]
    fn test_broadcast_plan_rejects_mismatch() {
        let a = Shape::from([3, 2]);
        let b = Shape::from([3]);
        let err = BroadcastPlan::new("add", &a, &a.contiguous_strides(), &b, &b.contiguous_strides()).unwrap_err();
        assert!(matches!(err, CrucibleError::Broadcast { operation: "add", .. }));
    }

    #[test]
    fn test_row_len() {
        assert_eq!(Shape::from([4]).row_len(), 4);
        assert_eq!(Shape::from([2, 5]).row_len(), 5);
        assert_eq!(Shape::from([3, 2, 7]).row_len(), 7);
    }
}
