//! Mode shared by a layer and its quantizers

/// Training or inference, plus a count of inference passes since the last
/// switch into inference mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Context {
    training: bool,
    inference_passes: usize,
}

impl Context {
    /// Starts in training mode
    pub fn new() -> Self {
        Self {
            training: true,
            inference_passes: 0,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        if !training && self.training {
            self.inference_passes = 0;
        }
        self.training = training;
    }

    pub fn train(&mut self) {
        self.set_training(true);
    }

    pub fn eval(&mut self) {
        self.set_training(false);
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Note a forward pass; only inference passes are counted
    pub fn record_pass(&mut self) {
        if !self.training {
            self.inference_passes += 1;
        }
    }

    pub fn inference_passes(&self) -> usize {
        self.inference_passes
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
