//! Tensor type with gradient tracking and device placement

use super::BackwardOp;
use crate::{Error, Result};
use ndarray::{Array1, ArrayD, IxDyn, SliceInfoElem};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;

/// Where a tensor (or a quantizer's state) lives
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    /// Accelerator by ordinal
    Accelerator(usize),
}

/// Per-dimension region: `None` keeps the full axis, `Some((start, stop))` is half-open
pub type SubtensorSlice = Option<(usize, usize)>;

/// Tensor with automatic differentiation support
#[derive(Clone)]
pub struct Tensor {
    data: ArrayD<f32>,
    grad: Rc<RefCell<Option<ArrayD<f32>>>>,
    backward_op: Option<Rc<dyn BackwardOp>>,
    requires_grad: bool,
    device: Device,
}

impl Tensor {
    /// Create a new tensor with data
    pub fn new(data: ArrayD<f32>, requires_grad: bool) -> Self {
        Self {
            data,
            grad: Rc::new(RefCell::new(None)),
            backward_op: None,
            requires_grad,
            device: Device::Cpu,
        }
    }

    /// Create a 1-D tensor from a vector
    pub fn from_vec(data: Vec<f32>, requires_grad: bool) -> Self {
        Self::new(Array1::from(data).into_dyn(), requires_grad)
    }

    /// Create a tensor of the given shape from row-major data
    pub fn from_shape_vec(shape: &[usize], data: Vec<f32>, requires_grad: bool) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![data.len()],
            });
        }
        let data = ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| Error::ShapeMismatch {
            expected: shape.to_vec(),
            got: vec![expected],
        })?;
        Ok(Self::new(data, requires_grad))
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: &[usize], requires_grad: bool) -> Self {
        Self::new(ArrayD::zeros(IxDyn(shape)), requires_grad)
    }

    /// Create a tensor filled with ones
    pub fn ones(shape: &[usize], requires_grad: bool) -> Self {
        Self::new(ArrayD::ones(IxDyn(shape)), requires_grad)
    }

    /// Get reference to data
    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    /// Get mutable reference to data
    pub fn data_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.data
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    /// Get gradient (if computed)
    pub fn grad(&self) -> Option<ArrayD<f32>> {
        self.grad.borrow().clone()
    }

    /// Set gradient
    pub fn set_grad(&self, grad: ArrayD<f32>) {
        *self.grad.borrow_mut() = Some(grad);
    }

    /// Accumulate gradient (for when tensor is used multiple times)
    pub fn accumulate_grad(&self, grad: ArrayD<f32>) {
        let mut grad_ref = self.grad.borrow_mut();
        if let Some(existing) = grad_ref.as_mut() {
            *existing = &*existing + &grad;
        } else {
            *grad_ref = Some(grad);
        }
    }

    /// Zero out gradient
    pub fn zero_grad(&self) {
        *self.grad.borrow_mut() = None;
    }

    /// Check if requires gradient
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Get reference to gradient cell (for backward operations)
    pub fn grad_cell(&self) -> Rc<RefCell<Option<ArrayD<f32>>>> {
        self.grad.clone()
    }

    /// Set backward operation
    pub fn set_backward_op(&mut self, op: Rc<dyn BackwardOp>) {
        self.backward_op = Some(op);
    }

    /// Get backward operation
    pub fn backward_op(&self) -> Option<Rc<dyn BackwardOp>> {
        self.backward_op.clone()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Move to a device. Shares the gradient cell with `self`.
    pub fn to(&self, device: Device) -> Self {
        let mut moved = self.clone();
        moved.device = device;
        moved
    }

    /// Copy of the data with no gradient history
    pub fn detach(&self) -> Self {
        let mut detached = Self::new(self.data.clone(), false);
        detached.device = self.device;
        detached
    }

    /// Get size
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Extract a region. Gradients flowing into the result are scattered back
    /// into `self`.
    pub fn slice(&self, slices: &[SubtensorSlice]) -> Result<Tensor> {
        let info = slice_info(self.shape(), slices)?;
        let data = self.data.slice(info.as_slice()).to_owned();

        let mut result = Tensor::new(data, self.requires_grad);
        result.device = self.device;

        if self.requires_grad {
            let backward_op = Rc::new(super::ops::SliceBackward {
                source: self.clone(),
                info,
                result_grad: result.grad_cell(),
            });
            result.set_backward_op(backward_op);
        }

        Ok(result)
    }
}

/// Validate a slice list against `shape` and build the ndarray index expression.
/// Dimensions beyond the end of the list keep their full extent.
pub fn slice_info(shape: &[usize], slices: &[SubtensorSlice]) -> Result<Vec<SliceInfoElem>> {
    if slices.len() > shape.len() {
        return Err(Error::InvalidSlice(format!(
            "{} slices given for a tensor of rank {}",
            slices.len(),
            shape.len()
        )));
    }

    let mut info = Vec::with_capacity(shape.len());
    for (dim, &extent) in shape.iter().enumerate() {
        match slices.get(dim).copied().flatten() {
            Some((start, stop)) => {
                if start >= stop || stop > extent {
                    return Err(Error::InvalidSlice(format!(
                        "range {start}..{stop} out of bounds for dim {dim} of extent {extent}"
                    )));
                }
                info.push(SliceInfoElem::Slice {
                    start: start as isize,
                    end: Some(stop as isize),
                    step: 1,
                });
            }
            None => info.push(SliceInfoElem::Slice {
                start: 0,
                end: None,
                step: 1,
            }),
        }
    }
    Ok(info)
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("data", &self.data)
            .field("grad", &self.grad.borrow())
            .field("requires_grad", &self.requires_grad)
            .field("device", &self.device)
            .finish()
    }
}
