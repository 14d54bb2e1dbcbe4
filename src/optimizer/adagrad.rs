use super::*;

/// Scales every step by the root of the summed squared gradients seen so far.
#[derive(Clone, Debug)]
pub struct AdaGrad {
    l_rate: f64,
    epsilon: f64,
    accumulator: Slots<f64>,
}

impl AdaGrad {
    pub fn builder() -> AdaGradBuilder {
        Default::default()
    }

    pub fn new(l_rate: f64, epsilon: f64) -> Self {
        Self {
            l_rate,
            epsilon,
            accumulator: Slots::default(),
        }
    }

    /// Sum of squared gradients for the weight at `index`.
    pub fn accumulator(&self, index: usize) -> Option<f64> {
        self.accumulator.get(index).copied()
    }
}

impl Optimizer for AdaGrad {
    fn optimize(&mut self, index: usize, weight: f64, gradient: f64) -> f64 {
        let acc = self.accumulator.get_mut(index);
        *acc += gradient * gradient;
        weight - self.l_rate * gradient / (acc.sqrt() + self.epsilon)
    }
}

#[derive(Clone, Debug)]
pub struct AdaGradBuilder {
    l_rate: f64,
    epsilon: f64,
}

impl Default for AdaGradBuilder {
    fn default() -> Self {
        Self {
            l_rate: 0.01,
            epsilon: 1e-8,
        }
    }
}

impl AdaGradBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn l_rate(mut self, l_rate: f64) -> Self {
        self.l_rate = l_rate;
        self
    }

    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn build(self) -> AdaGrad {
        AdaGrad::new(self.l_rate, self.epsilon)
    }
}
