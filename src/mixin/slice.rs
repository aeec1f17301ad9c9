//! Scoped subtensor-slice binding

use crate::autograd::SubtensorSlice;
use crate::proxy::WeightQuantProxy;
use crate::quant::{module_at, ModulePath};
use crate::{Error, Result};
use std::ops::{Deref, DerefMut};

/// Binds a slice directive to the sliceable submodules of a proxy's strategy
/// for as long as it lives. Dropping it restores full-tensor mode on every
/// exit path.
pub struct SliceScope<'a> {
    proxy: &'a mut WeightQuantProxy,
    paths: &'a [ModulePath],
}

impl<'a> SliceScope<'a> {
    pub fn bind(
        proxy: &'a mut WeightQuantProxy,
        paths: &'a [ModulePath],
        slices: &[SubtensorSlice],
    ) -> Result<Self> {
        let mut scope = Self { proxy, paths };
        for path in scope.paths {
            let sliceable = module_at(scope.proxy.module_mut(), path)
                .and_then(|module| module.as_sliceable())
                .ok_or_else(|| {
                    Error::Configuration(format!("no sliceable submodule at path {path:?}"))
                })?;
            sliceable.set_subtensor_slice(Some(slices.to_vec()));
        }
        tracing::trace!(modules = scope.paths.len(), ?slices, "bound subtensor slice");
        Ok(scope)
    }
}

impl Deref for SliceScope<'_> {
    type Target = WeightQuantProxy;

    fn deref(&self) -> &Self::Target {
        self.proxy
    }
}

impl DerefMut for SliceScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.proxy
    }
}

impl Drop for SliceScope<'_> {
    fn drop(&mut self) {
        for path in self.paths {
            if let Some(sliceable) =
                module_at(self.proxy.module_mut(), path).and_then(|module| module.as_sliceable())
            {
                sliceable.set_subtensor_slice(None);
            }
        }
        tracing::trace!(modules = self.paths.len(), "reset subtensor slice");
    }
}
