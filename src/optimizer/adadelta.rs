use super::*;

#[derive(Clone, Debug, Default)]
struct Averages {
    grad: f64,
    delta: f64,
}

/// AdaDelta from <https://arxiv.org/abs/1212.5701>. Needs no learning rate;
/// the step is the ratio of the running RMS of past updates to the running
/// RMS of gradients.
#[derive(Clone, Debug)]
pub struct AdaDelta {
    decay: f64,
    epsilon: f64,
    averages: Slots<Averages>,
}

impl AdaDelta {
    pub fn builder() -> AdaDeltaBuilder {
        Default::default()
    }

    pub fn new(decay: f64, epsilon: f64) -> Self {
        Self {
            decay,
            epsilon,
            averages: Slots::default(),
        }
    }
}

impl Optimizer for AdaDelta {
    fn optimize(&mut self, index: usize, weight: f64, gradient: f64) -> f64 {
        let (rho, eps) = (self.decay, self.epsilon);
        let avg = self.averages.get_mut(index);
        avg.grad = rho * avg.grad + (1. - rho) * gradient * gradient;
        let delta = -((avg.delta + eps).sqrt() / (avg.grad + eps).sqrt()) * gradient;
        avg.delta = rho * avg.delta + (1. - rho) * delta * delta;
        weight + delta
    }
}

#[derive(Clone, Debug)]
pub struct AdaDeltaBuilder {
    decay: f64,
    epsilon: f64,
}

impl Default for AdaDeltaBuilder {
    fn default() -> Self {
        Self {
            decay: 0.95,
            epsilon: 1e-6,
        }
    }
}

impl AdaDeltaBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn decay(mut self, decay: f64) -> Self {
        self.decay = decay;
        self
    }

    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn build(self) -> AdaDelta {
        AdaDelta::new(self.decay, self.epsilon)
    }
}
