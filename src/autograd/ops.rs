//! Autograd operations with backward passes

use super::{BackwardOp, Tensor};
use crate::{Error, Result};
use ndarray::{Array2, ArrayD, Axis, Ix2, IxDyn, SliceInfoElem};
use std::cell::RefCell;
use std::rc::Rc;

/// Wrap an already fake-quantized value so gradients reach `input` unchanged
///
/// Straight-Through Estimator: ∂L/∂x = ∂L/∂y where y = dequant(quant(x)).
pub fn fake_quant(input: &Tensor, quantized: ArrayD<f32>) -> Tensor {
    let mut result = Tensor::new(quantized, input.requires_grad()).to(input.device());

    if input.requires_grad() {
        let backward_op = Rc::new(StraightThroughBackward {
            input: input.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct StraightThroughBackward {
    input: Tensor,
    result_grad: Rc<RefCell<Option<ArrayD<f32>>>>,
}

impl BackwardOp for StraightThroughBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            self.input.accumulate_grad(grad.clone());

            if let Some(op) = self.input.backward_op() {
                op.backward();
            }
        }
    }
}

pub(crate) struct SliceBackward {
    pub(crate) source: Tensor,
    pub(crate) info: Vec<SliceInfoElem>,
    pub(crate) result_grad: Rc<RefCell<Option<ArrayD<f32>>>>,
}

impl BackwardOp for SliceBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            // Scatter into the source shape; untouched positions get zero
            let mut full = ArrayD::zeros(self.source.data().raw_dim());
            full.slice_mut(self.info.as_slice()).assign(grad);
            self.source.accumulate_grad(full);

            if let Some(op) = self.source.backward_op() {
                op.backward();
            }
        }
    }
}

fn as_matrix(t: &Tensor, what: &str) -> Result<Array2<f32>> {
    match t.ndim() {
        1 => Array2::from_shape_vec((1, t.len()), t.data().iter().copied().collect()).map_err(
            |_| Error::ShapeMismatch {
                expected: vec![1, t.len()],
                got: t.shape().to_vec(),
            },
        ),
        2 => Ok(t
            .data()
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| Error::InvalidParameter(format!("{what}: {e}")))?
            .to_owned()),
        _ => Err(Error::InvalidParameter(format!(
            "{what} must be 1-D or 2-D, got shape {:?}",
            t.shape()
        ))),
    }
}

/// Affine map: y = x @ wᵀ + b
///
/// # Arguments
/// * `x` - Input [batch, in] or [in]
/// * `w` - Weight [out, in]
/// * `b` - Optional bias [out]
pub fn linear(x: &Tensor, w: &Tensor, b: Option<&Tensor>) -> Result<Tensor> {
    let x2 = as_matrix(x, "input")?;
    let w2 = as_matrix(w, "weight")?;
    if w.ndim() != 2 || x2.ncols() != w2.ncols() {
        return Err(Error::ShapeMismatch {
            expected: vec![w2.nrows(), x2.ncols()],
            got: w.shape().to_vec(),
        });
    }

    let mut y = x2.dot(&w2.t());
    if let Some(b) = b {
        if b.len() != w2.nrows() {
            return Err(Error::ShapeMismatch {
                expected: vec![w2.nrows()],
                got: b.shape().to_vec(),
            });
        }
        for mut row in y.rows_mut() {
            row.iter_mut()
                .zip(b.data().iter())
                .for_each(|(v, &bias)| *v += bias);
        }
    }

    let out_shape: Vec<usize> = if x.ndim() == 1 {
        vec![w2.nrows()]
    } else {
        vec![x2.nrows(), w2.nrows()]
    };
    let data = ArrayD::from_shape_vec(IxDyn(&out_shape), y.iter().copied().collect())
        .map_err(|_| Error::ShapeMismatch {
            expected: out_shape.clone(),
            got: y.shape().to_vec(),
        })?;

    let requires_grad =
        x.requires_grad() || w.requires_grad() || b.is_some_and(|b| b.requires_grad());
    let mut result = Tensor::new(data, requires_grad).to(w.device());

    if requires_grad {
        let backward_op = Rc::new(LinearBackward {
            x: x.clone(),
            w: w.clone(),
            b: b.cloned(),
            x2,
            w2,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    Ok(result)
}

struct LinearBackward {
    x: Tensor,
    w: Tensor,
    b: Option<Tensor>,
    x2: Array2<f32>,
    w2: Array2<f32>,
    result_grad: Rc<RefCell<Option<ArrayD<f32>>>>,
}

impl BackwardOp for LinearBackward {
    fn backward(&self) {
        let grad = match self.result_grad.borrow().as_ref() {
            Some(grad) => grad.clone(),
            None => return,
        };
        let rows = self.x2.nrows();
        let g2 = match Array2::from_shape_vec(
            (rows, self.w2.nrows()),
            grad.iter().copied().collect(),
        ) {
            Ok(g2) => g2,
            Err(error) => {
                tracing::debug!(%error, "dropped linear gradient: output gradient misshaped");
                return;
            }
        };

        if self.x.requires_grad() {
            // ∂L/∂x = g @ W
            let gx = g2.dot(&self.w2);
            match ArrayD::from_shape_vec(IxDyn(self.x.shape()), gx.iter().copied().collect()) {
                Ok(gx) => self.x.accumulate_grad(gx),
                Err(error) => {
                    tracing::debug!(%error, "dropped input gradient: reshape to input failed");
                }
            }
        }
        if self.w.requires_grad() {
            // ∂L/∂W = gᵀ @ x
            self.w.accumulate_grad(g2.t().dot(&self.x2).into_dyn());
        }
        if let Some(b) = &self.b {
            if b.requires_grad() {
                b.accumulate_grad(g2.sum_axis(Axis(0)).into_dyn());
            }
        }

        if let Some(op) = self.x.backward_op() {
            op.backward();
        }
        if let Some(op) = self.w.backward_op() {
            op.backward();
        }
        if let Some(op) = self.b.as_ref().and_then(|b| b.backward_op()) {
            op.backward();
        }
    }
}
