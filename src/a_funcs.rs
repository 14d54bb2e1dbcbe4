use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

/// Stateless scalar nonlinearity.
#[enum_dispatch]
pub trait ActivFunc {
    fn evaluate(&self, x: f64) -> f64;
    /// Derivative at `inp`. `out` is `evaluate(inp)`, which many functions can reuse.
    fn derivative(&self, inp: f64, out: f64) -> f64;
}

/// Every activation function the crate knows about, in a form that can be
/// stored inside a layer and serialized alongside it.
#[enum_dispatch(ActivFunc)]
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub enum Activation {
    Sigmoid,
    TanH,
    ReLU,
    Elu,
    Selu,
    Identity,
    SoftPlus,
    Softsign,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Sigmoid;
impl ActivFunc for Sigmoid {
    fn evaluate(&self, x: f64) -> f64 {
        1. / (1. + (-x).exp())
    }
    fn derivative(&self, _: f64, out: f64) -> f64 {
        out * (1. - out)
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Identity;
impl ActivFunc for Identity {
    fn evaluate(&self, x: f64) -> f64 {
        x
    }
    fn derivative(&self, _: f64, _: f64) -> f64 {
        1.
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct TanH;
impl ActivFunc for TanH {
    fn evaluate(&self, x: f64) -> f64 {
        x.tanh()
    }
    fn derivative(&self, _inp: f64, out: f64) -> f64 {
        1. - out * out
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct ReLU;
impl ActivFunc for ReLU {
    fn evaluate(&self, x: f64) -> f64 {
        f64::max(x, 0.)
    }
    fn derivative(&self, inp: f64, _out: f64) -> f64 {
        if inp > 0. {
            1.
        } else {
            0.
        }
    }
}

/// Exponential linear unit, `alpha * (e^x - 1)` for negative inputs.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Elu {
    pub alpha: f64,
}

impl Default for Elu {
    fn default() -> Self {
        Self { alpha: 1. }
    }
}

impl ActivFunc for Elu {
    fn evaluate(&self, x: f64) -> f64 {
        if x > 0. {
            x
        } else {
            self.alpha * (x.exp() - 1.)
        }
    }
    fn derivative(&self, inp: f64, out: f64) -> f64 {
        if inp > 0. {
            1.
        } else {
            out + self.alpha
        }
    }
}

const SELU_ALPHA: f64 = 1.673_263_242_354_377_3;
const SELU_SCALE: f64 = 1.050_700_987_355_480_5;

/// Self-normalizing ELU with the fixed constants from Klambauer et al.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Selu;
impl ActivFunc for Selu {
    fn evaluate(&self, x: f64) -> f64 {
        if x > 0. {
            SELU_SCALE * x
        } else {
            SELU_SCALE * SELU_ALPHA * (x.exp() - 1.)
        }
    }
    fn derivative(&self, inp: f64, out: f64) -> f64 {
        if inp > 0. {
            SELU_SCALE
        } else {
            out + SELU_SCALE * SELU_ALPHA
        }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct SoftPlus;
impl ActivFunc for SoftPlus {
    fn evaluate(&self, x: f64) -> f64 {
        // ln(1 + e^x) without overflowing for large x
        x.max(0.) + (-x.abs()).exp().ln_1p()
    }
    fn derivative(&self, inp: f64, _out: f64) -> f64 {
        Sigmoid.evaluate(inp)
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Softsign;
impl ActivFunc for Softsign {
    fn evaluate(&self, x: f64) -> f64 {
        x / (1. + x.abs())
    }
    fn derivative(&self, inp: f64, _out: f64) -> f64 {
        let d = 1. + inp.abs();
        1. / (d * d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Activation; 8] = [
        Activation::Sigmoid(Sigmoid),
        Activation::TanH(TanH),
        Activation::ReLU(ReLU),
        Activation::Elu(Elu { alpha: 1. }),
        Activation::Selu(Selu),
        Activation::Identity(Identity),
        Activation::SoftPlus(SoftPlus),
        Activation::Softsign(Softsign),
    ];

    #[test]
    fn derivatives_match_finite_differences() {
        let eps = 1e-6;
        for f in ALL.iter() {
            // stay away from the kink at zero
            for &x in &[-2.3, -0.7, 0.4, 1.9] {
                let numeric = (f.evaluate(x + eps) - f.evaluate(x - eps)) / (2. * eps);
                let analytic = f.derivative(x, f.evaluate(x));
                assert!(
                    (numeric - analytic).abs() < 1e-6,
                    "{:?} at {}: numeric {} analytic {}",
                    f,
                    x,
                    numeric,
                    analytic
                );
            }
        }
    }

    #[test]
    fn softplus_is_stable_for_large_inputs() {
        assert!((SoftPlus.evaluate(800.) - 800.).abs() < 1e-9);
        assert!(SoftPlus.evaluate(-800.) >= 0.);
    }
}
