//! Tape-based autograd engine
//!
//! Provides automatic differentiation using a computational graph with gradient tape.
//! Quantized parameters flow through [`fake_quant`] so the straight-through
//! estimator carries gradients back to the full-precision weights.

mod backward;
mod context;
mod ops;
mod tensor;


pub use backward::BackwardOp;
pub use context::Context;
pub use ops::{fake_quant, linear};
pub use tensor::{slice_info, Device, SubtensorSlice, Tensor};

/// Perform backward pass on a tensor
pub fn backward(tensor: &mut Tensor, grad_output: Option<ndarray::ArrayD<f32>>) {
    if let Some(grad) = grad_output {
        tensor.set_grad(grad);
    } else {
        // Initialize with ones for scalar loss
        let ones = ndarray::ArrayD::ones(tensor.data().raw_dim());
        tensor.set_grad(ones);
    }

    if let Some(op) = tensor.backward_op() {
        op.backward();
    }
}
