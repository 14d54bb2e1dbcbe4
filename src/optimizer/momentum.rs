use super::*;

/// Classical momentum: `v = mu * v - l_rate * g`, then `w + v`.
#[derive(Clone, Debug)]
pub struct Momentum {
    l_rate: f64,
    momentum: f64,
    velocity: Slots<f64>,
}

impl Momentum {
    pub fn builder() -> MomentumBuilder {
        Default::default()
    }

    pub fn new(l_rate: f64, momentum: f64) -> Self {
        Self {
            l_rate,
            momentum,
            velocity: Slots::default(),
        }
    }

    pub fn velocity(&self, index: usize) -> Option<f64> {
        self.velocity.get(index).copied()
    }
}

impl Optimizer for Momentum {
    fn optimize(&mut self, index: usize, weight: f64, gradient: f64) -> f64 {
        let v = self.velocity.get_mut(index);
        *v = self.momentum * *v - self.l_rate * gradient;
        weight + *v
    }
}

/// Nesterov accelerated gradient in its look-ahead free form:
/// `v' = mu * v - l_rate * g`, then `w - mu * v + (1 + mu) * v'`.
#[derive(Clone, Debug)]
pub struct Nesterov {
    l_rate: f64,
    momentum: f64,
    velocity: Slots<f64>,
}

impl Nesterov {
    pub fn new(l_rate: f64, momentum: f64) -> Self {
        Self {
            l_rate,
            momentum,
            velocity: Slots::default(),
        }
    }
}

impl Optimizer for Nesterov {
    fn optimize(&mut self, index: usize, weight: f64, gradient: f64) -> f64 {
        let v = self.velocity.get_mut(index);
        let prev = *v;
        *v = self.momentum * prev - self.l_rate * gradient;
        weight - self.momentum * prev + (1. + self.momentum) * *v
    }
}

/// Builds either [Momentum] or [Nesterov].
#[derive(Clone, Debug)]
pub struct MomentumBuilder {
    l_rate: f64,
    momentum: f64,
}

impl Default for MomentumBuilder {
    fn default() -> Self {
        Self {
            l_rate: 0.01,
            momentum: 0.9,
        }
    }
}

impl MomentumBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn l_rate(mut self, l_rate: f64) -> Self {
        self.l_rate = l_rate;
        self
    }

    pub fn momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn build(self) -> Momentum {
        Momentum::new(self.l_rate, self.momentum)
    }

    pub fn build_nesterov(self) -> Nesterov {
        Nesterov::new(self.l_rate, self.momentum)
    }
}
