use super::*;

#[derive(Clone, Debug)]
struct Moments {
    momentum: f64,
    velocity: f64,
    beta1_pow: f64,
    beta2_pow: f64,
}

impl Default for Moments {
    fn default() -> Self {
        Self {
            momentum: 0.,
            velocity: 0.,
            beta1_pow: 1.,
            beta2_pow: 1.,
        }
    }
}

/// The adam optimizer algorithm as shown in the research paper <https://arxiv.org/abs/1412.6980>
///
/// Every weight keeps its own step count, so a weight that first shows up
/// late still gets a full bias correction.
#[derive(Clone, Debug)]
pub struct Adam {
    moments: Slots<Moments>,

    beta1: f64,
    beta2: f64,
    epsilon: f64,

    l_rate: f64,
}

impl Optimizer for Adam {
    fn optimize(&mut self, index: usize, weight: f64, gradient: f64) -> f64 {
        let (beta1, beta2) = (self.beta1, self.beta2);
        let m = self.moments.get_mut(index);

        m.beta1_pow *= beta1;
        m.beta2_pow *= beta2;
        m.momentum = beta1 * m.momentum + (1. - beta1) * gradient;
        m.velocity = beta2 * m.velocity + (1. - beta2) * gradient * gradient;

        let m_hat = m.momentum / (1. - m.beta1_pow);
        let v_hat = m.velocity / (1. - m.beta2_pow);
        weight - self.l_rate * m_hat / (v_hat.sqrt() + self.epsilon)
    }
}

impl Adam {
    pub fn builder() -> AdamBuilder {
        Default::default()
    }

    pub fn new(beta1: f64, beta2: f64, epsilon: f64, l_rate: f64) -> Self {
        Self {
            moments: Slots::default(),
            beta1,
            beta2,
            epsilon,
            l_rate,
        }
    }

    /// `(beta1^t, beta2^t)` for the weight at `index` after `t` updates.
    pub fn bias_correction(&self, index: usize) -> Option<(f64, f64)> {
        self.moments
            .get(index)
            .map(|m| (m.beta1_pow, m.beta2_pow))
    }
}

#[derive(Clone, Debug)]
pub struct AdamBuilder {
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    l_rate: f64,
}

impl Default for AdamBuilder {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            l_rate: 0.01,
        }
    }
}

impl AdamBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn beta1(mut self, beta1: f64) -> Self {
        self.beta1 = beta1;
        self
    }

    pub fn beta2(mut self, beta2: f64) -> Self {
        self.beta2 = beta2;
        self
    }

    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn l_rate(mut self, l_rate: f64) -> Self {
        self.l_rate = l_rate;
        self
    }

    pub fn build(self) -> Adam {
        Adam::new(self.beta1, self.beta2, self.epsilon, self.l_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::minimize;
    use super::*;

    #[test]
    fn correction_factors_decay() {
        let mut opt = Adam::builder().build();
        let mut last = (1., 1.);
        for step in 0..50 {
            opt.optimize(3, 0.5, (step as f64).sin());
            let (b1, b2) = opt.bias_correction(3).unwrap();
            assert!(b1 < last.0 && b2 < last.1);
            last = (b1, b2);
        }
        assert_eq!(opt.bias_correction(0), Some((1., 1.)));
    }

    #[test]
    fn first_step_is_learning_rate() {
        // with bias correction the first step is lr * g / |g|
        let mut opt = Adam::builder().l_rate(0.1).epsilon(0.).build();
        let w = opt.optimize(0, 1., 42.);
        assert!((w - 0.9).abs() < 1e-12);
    }

    #[test]
    fn converges() {
        let w = minimize(Adam::builder().l_rate(0.1).build(), 2000);
        assert!((w - 3.).abs() < 1e-2);
    }
}
