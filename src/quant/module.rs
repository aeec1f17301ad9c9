//! Quantizer module tree
//!
//! Strategies are composed of named submodules (scaling, zero-point,
//! bit-width). Submodules that hold per-tensor parameters can accept a
//! per-call subtensor slice so a weight region can be quantized with the
//! matching region of its parameters.

use crate::autograd::SubtensorSlice;

/// Child indices from a strategy root to a submodule
pub type ModulePath = Vec<usize>;

/// Node of a quantizer's module tree
pub trait QuantModule {
    fn name(&self) -> &str;

    /// Direct children, in a stable order
    fn children_mut(&mut self) -> Vec<&mut dyn QuantModule> {
        Vec::new()
    }

    /// `Some` for modules that accept a per-call slice directive
    fn as_sliceable(&mut self) -> Option<&mut dyn SubtensorSliceable> {
        None
    }
}

/// Module whose output depends on the region of the tensor being quantized
pub trait SubtensorSliceable {
    /// `None` restores full-tensor behaviour
    fn set_subtensor_slice(&mut self, slice: Option<Vec<SubtensorSlice>>);

    fn subtensor_slice(&self) -> Option<&[SubtensorSlice]>;
}

/// Resolve a path produced by [`discover_sliceable`]
pub fn module_at<'a>(
    root: &'a mut dyn QuantModule,
    path: &[usize],
) -> Option<&'a mut dyn QuantModule> {
    match path.split_first() {
        None => Some(root),
        Some((&index, rest)) => {
            let child = root.children_mut().into_iter().nth(index)?;
            module_at(child, rest)
        }
    }
}

/// Walk the whole tree and collect paths of sliceable modules (pre-order)
pub fn discover_sliceable(root: &mut dyn QuantModule) -> Vec<ModulePath> {
    fn walk(module: &mut dyn QuantModule, path: &mut ModulePath, found: &mut Vec<ModulePath>) {
        if module.as_sliceable().is_some() {
            found.push(path.clone());
        }
        for (index, child) in module.children_mut().into_iter().enumerate() {
            path.push(index);
            walk(child, path, found);
            path.pop();
        }
    }

    let mut found = Vec::new();
    walk(root, &mut Vec::new(), &mut found);
    found
}
