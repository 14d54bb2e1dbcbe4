use super::*;

/// Like [AdaGrad](super::AdaGrad) but with an exponentially decaying average
/// of squared gradients, so the step size does not vanish.
#[derive(Clone, Debug)]
pub struct RmsProp {
    l_rate: f64,
    decay: f64,
    epsilon: f64,
    mean_square: Slots<f64>,
}

impl RmsProp {
    pub fn builder() -> RmsPropBuilder {
        Default::default()
    }

    pub fn new(l_rate: f64, decay: f64, epsilon: f64) -> Self {
        Self {
            l_rate,
            decay,
            epsilon,
            mean_square: Slots::default(),
        }
    }
}

impl Optimizer for RmsProp {
    fn optimize(&mut self, index: usize, weight: f64, gradient: f64) -> f64 {
        let ms = self.mean_square.get_mut(index);
        *ms = self.decay * *ms + (1. - self.decay) * gradient * gradient;
        weight - self.l_rate * gradient / (ms.sqrt() + self.epsilon)
    }
}

#[derive(Clone, Debug)]
pub struct RmsPropBuilder {
    l_rate: f64,
    decay: f64,
    epsilon: f64,
}

impl Default for RmsPropBuilder {
    fn default() -> Self {
        Self {
            l_rate: 0.001,
            decay: 0.9,
            epsilon: 1e-8,
        }
    }
}

impl RmsPropBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn l_rate(mut self, l_rate: f64) -> Self {
        self.l_rate = l_rate;
        self
    }

    pub fn decay(mut self, decay: f64) -> Self {
        self.decay = decay;
        self
    }

    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn build(self) -> RmsProp {
        RmsProp::new(self.l_rate, self.decay, self.epsilon)
    }
}
