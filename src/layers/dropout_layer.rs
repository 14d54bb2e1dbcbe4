use crate::{
    batch::{Batch, Vector},
    error::{Error, Result},
    layers::{check_backward, Context, Layer, LayerBuilder},
};
use rand::{rngs::SmallRng, Rng};
use serde::{Deserialize, Serialize};
use tracing::trace;

const NAME: &str = "dropout";

#[derive(Debug, Clone)]
enum Mask {
    /// Per-sample keep mask drawn during a training forward.
    Sampled(Batch<Vec<bool>>),
    /// Inference forward: everything was scaled by `1 - rate`.
    Scaled(usize),
}

/// Zeroes each unit with probability `rate` while training and scales by
/// `1 - rate` at inference, so the expected activation matches.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DropoutLayer {
    size: usize,
    rate: f64,

    #[serde(skip)]
    mask: Option<Mask>,
}

impl DropoutLayer {
    pub fn new(size: usize, rate: f64) -> Self {
        Self {
            size,
            rate,
            mask: None,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn forward_len(&self) -> Option<usize> {
        match &self.mask {
            Some(Mask::Sampled(m)) => Some(m.len()),
            Some(Mask::Scaled(len)) => Some(*len),
            None => None,
        }
    }
}

impl Layer for DropoutLayer {
    fn in_size(&self) -> usize {
        self.size
    }

    fn out_size(&self) -> usize {
        self.size
    }

    fn forward(&mut self, input: &Batch<Vector>, ctx: &mut Context) -> Result<Batch<Vector>> {
        input.check_width(self.size, NAME)?;

        if !ctx.is_training() {
            let keep = 1. - self.rate;
            self.mask = Some(Mask::Scaled(input.len()));
            return Ok(input.par_map(|_, x| x.iter().map(|v| v * keep).collect()));
        }

        // masks are drawn up front so the parallel part stays deterministic
        let rate = self.rate;
        let rng = ctx.rng();
        let mask: Batch<Vec<bool>> = (0..input.len())
            .map(|_| (0..self.size).map(|_| rng.gen::<f64>() >= rate).collect())
            .collect();
        trace!(samples = input.len(), rate, "dropout mask drawn");

        let out = input.par_map(|s, x| {
            x.iter()
                .zip(&mask[s])
                .map(|(v, keep)| if *keep { *v } else { 0. })
                .collect()
        });
        self.mask = Some(Mask::Sampled(mask));
        Ok(out)
    }

    fn backward(&mut self, deltas: &Batch<Vector>) -> Result<Batch<Vector>> {
        check_backward(deltas, self.forward_len(), self.size, NAME)?;
        match self.mask.as_ref().ok_or(Error::NotReady { layer: NAME })? {
            Mask::Sampled(mask) => Ok(deltas.par_map(|s, d| {
                d.iter()
                    .zip(&mask[s])
                    .map(|(v, keep)| if *keep { *v } else { 0. })
                    .collect()
            })),
            Mask::Scaled(_) => {
                let keep = 1. - self.rate;
                Ok(deltas.par_map(|_, d| d.iter().map(|v| v * keep).collect()))
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if !(0. ..1.).contains(&self.rate) {
            return Err(Error::config(format!(
                "dropout rate must be in [0, 1), got {}",
                self.rate
            )));
        }
        Ok(())
    }
}

pub struct DropoutBuilder {
    rate: f64,
}

impl DropoutBuilder {
    pub fn new(rate: f64) -> Self {
        Self { rate }
    }
}

impl LayerBuilder for DropoutBuilder {
    type Output = DropoutLayer;

    fn connect(self, in_size: usize, _rng: &mut SmallRng) -> Result<Self::Output> {
        if !(0. ..1.).contains(&self.rate) {
            return Err(Error::config(format!(
                "dropout rate must be in [0, 1), got {}",
                self.rate
            )));
        }
        Ok(DropoutLayer::new(in_size, self.rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::tests::{check, check_shapes};
    use rand::SeedableRng;

    #[test]
    fn training_mask_is_reused_in_backward() {
        let mut layer = DropoutLayer::new(64, 0.5);
        let input = Batch::new(vec![vec![1.; 64], vec![2.; 64]]);
        let out = layer.forward(&input, &mut Context::new(true, 42)).unwrap();
        let deltas = Batch::new(vec![vec![3.; 64], vec![3.; 64]]);
        let back = layer.backward(&deltas).unwrap();

        let mut dropped = 0;
        for s in 0..2 {
            for k in 0..64 {
                if out[s][k] == 0. {
                    dropped += 1;
                    assert_eq!(back[s][k], 0.);
                } else {
                    assert_eq!(back[s][k], 3.);
                }
            }
        }
        assert!(dropped > 20 && dropped < 108, "dropped {}", dropped);
    }

    #[test]
    fn inference_scales() {
        let mut layer = DropoutLayer::new(3, 0.25);
        let input = Batch::new(vec![vec![4., 8., -4.]]);
        let out = layer.forward(&input, &mut Context::inference()).unwrap();
        check(&[3., 6., -3.], &out[0], 1e-12, "scaled output");
        check_shapes(&mut layer, &input);
    }

    #[test]
    fn masks_follow_the_seed() {
        let input = Batch::new(vec![vec![1.; 32]]);
        let run = |seed| {
            let mut layer = DropoutLayer::new(32, 0.5);
            layer.forward(&input, &mut Context::new(true, seed)).unwrap()
        };
        assert_eq!(run(9), run(9));
    }

    #[test]
    fn rejects_rate_of_one() {
        let mut rng = SmallRng::seed_from_u64(0);
        assert!(DropoutBuilder::new(1.).connect(4, &mut rng).is_err());
    }
}
