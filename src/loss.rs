use serde::{Deserialize, Serialize};

use crate::helpers::softmax_in_place;

/// Loss value of one sample together with its gradient w.r.t. the prediction.
pub struct Loss {
    pub loss: f64,
    pub grads: Vec<f64>,
}

/// Per-sample loss. `forward` gives the sample's contribution, `backward` the
/// gradient of that contribution w.r.t. each output element.
pub trait LossFunc: Sync {
    fn forward(&self, val: &[f64], target: &[f64]) -> f64;
    fn backward(&self, val: &[f64], target: &[f64]) -> Vec<f64>;

    fn eval(&self, val: &[f64], target: &[f64]) -> Loss {
        Loss {
            loss: self.forward(val, target),
            grads: self.backward(val, target),
        }
    }
}

fn assert_len(val: &[f64], target: &[f64]) {
    assert_eq!(
        val.len(),
        target.len(),
        "Value vector must be the same length as target vector. val: {}, target: {}",
        val.len(),
        target.len()
    );
}

/// Clamp applied to probabilities before taking logs.
const PROB_EPS: f64 = 1e-12;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct MeanSquared;

impl LossFunc for MeanSquared {
    fn forward(&self, val: &[f64], target: &[f64]) -> f64 {
        assert_len(val, target);
        let sum: f64 = val
            .iter()
            .zip(target)
            .map(|(v, t)| (v - t) * (v - t))
            .sum();
        sum / val.len() as f64
    }

    fn backward(&self, val: &[f64], target: &[f64]) -> Vec<f64> {
        assert_len(val, target);
        let recip = 1. / val.len() as f64;
        val.iter()
            .zip(target)
            .map(|(v, t)| 2. * (v - t) * recip)
            .collect()
    }
}

/// Cross-entropy on probabilities, e.g. after a sigmoid activation layer.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BinaryCrossEntropy;

impl LossFunc for BinaryCrossEntropy {
    fn forward(&self, val: &[f64], target: &[f64]) -> f64 {
        assert_len(val, target);
        let sum: f64 = val
            .iter()
            .zip(target)
            .map(|(v, t)| {
                let p = v.clamp(PROB_EPS, 1. - PROB_EPS);
                -(t * p.ln() + (1. - t) * (1. - p).ln())
            })
            .sum();
        sum / val.len() as f64
    }

    fn backward(&self, val: &[f64], target: &[f64]) -> Vec<f64> {
        assert_len(val, target);
        let recip = 1. / val.len() as f64;
        val.iter()
            .zip(target)
            .map(|(v, t)| {
                let p = v.clamp(PROB_EPS, 1. - PROB_EPS);
                (p - t) / (p * (1. - p)) * recip
            })
            .collect()
    }
}

/// Cross-entropy on raw logits with the softmax folded in.
/// The gradient is simply `softmax(val) - target`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct SoftmaxCrossEntropy;

impl LossFunc for SoftmaxCrossEntropy {
    fn forward(&self, val: &[f64], target: &[f64]) -> f64 {
        assert_len(val, target);
        let mut probs = val.to_vec();
        softmax_in_place(&mut probs);
        -probs
            .iter()
            .zip(target)
            .map(|(p, t)| t * p.max(PROB_EPS).ln())
            .sum::<f64>()
    }

    fn backward(&self, val: &[f64], target: &[f64]) -> Vec<f64> {
        assert_len(val, target);
        let mut probs = val.to_vec();
        softmax_in_place(&mut probs);
        probs.iter().zip(target).map(|(p, t)| p - t).collect()
    }
}

/// Per-element logistic cross-entropy on raw logits.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct SigmoidCrossEntropy;

impl LossFunc for SigmoidCrossEntropy {
    fn forward(&self, val: &[f64], target: &[f64]) -> f64 {
        assert_len(val, target);
        // max(x, 0) - x*t + ln(1 + e^-|x|)
        let sum: f64 = val
            .iter()
            .zip(target)
            .map(|(x, t)| x.max(0.) - x * t + (-x.abs()).exp().ln_1p())
            .sum();
        sum / val.len() as f64
    }

    fn backward(&self, val: &[f64], target: &[f64]) -> Vec<f64> {
        assert_len(val, target);
        let recip = 1. / val.len() as f64;
        val.iter()
            .zip(target)
            .map(|(x, t)| (1. / (1. + (-x).exp()) - t) * recip)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::tests::check;

    fn numeric_grad<L: LossFunc>(loss: &L, val: &[f64], target: &[f64]) -> Vec<f64> {
        let eps = 1e-6;
        (0..val.len())
            .map(|i| {
                let mut hi = val.to_vec();
                let mut lo = val.to_vec();
                hi[i] += eps;
                lo[i] -= eps;
                (loss.forward(&hi, target) - loss.forward(&lo, target)) / (2. * eps)
            })
            .collect()
    }

    #[test]
    fn mean_squared_values() {
        let Loss { loss, grads } = MeanSquared.eval(&[1., 2.], &[0., 4.]);
        assert!((loss - 2.5).abs() < 1e-12);
        check(&[1., -2.], &grads, 1e-12, "mse gradient");
    }

    #[test]
    fn gradients_match_forward() {
        let val = [0.3, 0.8, 0.1];
        let target = [0., 1., 0.];
        check(
            &numeric_grad(&MeanSquared, &val, &target),
            &MeanSquared.backward(&val, &target),
            1e-6,
            "mse",
        );
        check(
            &numeric_grad(&BinaryCrossEntropy, &val, &target),
            &BinaryCrossEntropy.backward(&val, &target),
            1e-5,
            "bce",
        );
        let logits = [1.5, -0.3, 0.2];
        check(
            &numeric_grad(&SoftmaxCrossEntropy, &logits, &target),
            &SoftmaxCrossEntropy.backward(&logits, &target),
            1e-6,
            "softmax ce",
        );
        check(
            &numeric_grad(&SigmoidCrossEntropy, &logits, &target),
            &SigmoidCrossEntropy.backward(&logits, &target),
            1e-6,
            "sigmoid ce",
        );
    }
}
