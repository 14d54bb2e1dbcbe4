use super::*;

/// Gradient descent simply steps the weights based on their derivatives.
#[derive(Clone, Debug)]
pub struct GradientDescent {
    l_rate: f64,
}

impl Optimizer for GradientDescent {
    fn optimize(&mut self, _index: usize, weight: f64, gradient: f64) -> f64 {
        weight - self.l_rate * gradient
    }
}

impl GradientDescent {
    pub fn builder() -> GradDescBuilder {
        Default::default()
    }

    pub fn new(l_rate: f64) -> Self {
        Self { l_rate }
    }
}

/// Constructor for [GradientDescent](self::GradientDescent)
#[derive(Clone, Debug)]
pub struct GradDescBuilder {
    l_rate: f64,
}

impl Default for GradDescBuilder {
    fn default() -> Self {
        Self { l_rate: 0.01 }
    }
}

impl GradDescBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn l_rate(mut self, l_rate: f64) -> Self {
        self.l_rate = l_rate;
        self
    }

    pub fn build(self) -> GradientDescent {
        GradientDescent::new(self.l_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_against_gradient() {
        let mut opt = GradientDescent::builder().l_rate(0.5).build();
        assert_eq!(opt.optimize(0, 1., 2.), 0.);
        assert_eq!(opt.optimize(7, 1., -2.), 2.);
    }

    #[test]
    fn converges_on_parabola() {
        let w = super::super::tests::minimize(GradientDescent::new(0.1), 200);
        assert!((w - 3.).abs() < 1e-6);
    }
}
