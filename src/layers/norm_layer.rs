use crate::{
    batch::{Batch, Vector},
    error::{Error, Result},
    layers::{check_backward, check_param_len, Context, Layer, LayerBuilder, Params, Updatable},
};
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

const NAME: &str = "batch_norm";

#[derive(Debug, Clone)]
struct Cache {
    normalized: Batch<Vector>,
    inv_std: Vector,
    /// Whether the statistics came from the batch itself.
    batch_stats: bool,
}

/// Batch normalization. Every feature is shifted and scaled to zero mean and
/// unit variance, then mapped through a learned `gamma * x + beta`.
///
/// Training uses the statistics of the current batch and folds them into
/// running averages, which is what inference then uses. Parameters are all
/// gammas followed by all betas.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NormLayer {
    size: usize,
    momentum: f64,
    epsilon: f64,
    params: Params,
    running_mean: Vector,
    running_var: Vector,

    #[serde(skip)]
    cache: Option<Cache>,
}

impl NormLayer {
    pub fn new(size: usize, momentum: f64, epsilon: f64) -> Self {
        let mut values = vec![1.; size];
        values.resize(size * 2, 0.);
        Self {
            size,
            momentum,
            epsilon,
            params: Params::new(values),
            running_mean: vec![0.; size],
            running_var: vec![1.; size],
            cache: None,
        }
    }

    pub fn gamma(&self) -> &[f64] {
        &self.params.values()[..self.size]
    }

    pub fn beta(&self) -> &[f64] {
        &self.params.values()[self.size..]
    }

    pub fn running_mean(&self) -> &[f64] {
        &self.running_mean
    }

    pub fn running_var(&self) -> &[f64] {
        &self.running_var
    }

    /// Biased mean and variance per feature.
    fn batch_stats(&self, input: &Batch<Vector>) -> (Vector, Vector) {
        let mean = input.mean_of(self.size);
        let n = input.len() as f64;
        let mut var = vec![0.; self.size];
        for x in input.iter() {
            for ((v, x), m) in var.iter_mut().zip(x).zip(&mean) {
                *v += (x - m) * (x - m);
            }
        }
        var.iter_mut().for_each(|v| *v /= n);
        (mean, var)
    }
}

impl Layer for NormLayer {
    fn in_size(&self) -> usize {
        self.size
    }

    fn out_size(&self) -> usize {
        self.size
    }

    fn forward(&mut self, input: &Batch<Vector>, ctx: &mut Context) -> Result<Batch<Vector>> {
        input.check_width(self.size, NAME)?;

        let batch_stats = ctx.is_training() && !input.is_empty();
        let (mean, var) = if batch_stats {
            let (mean, var) = self.batch_stats(input);
            let m = self.momentum;
            for (r, b) in self.running_mean.iter_mut().zip(&mean) {
                *r = m * *r + (1. - m) * b;
            }
            for (r, b) in self.running_var.iter_mut().zip(&var) {
                *r = m * *r + (1. - m) * b;
            }
            (mean, var)
        } else {
            (self.running_mean.clone(), self.running_var.clone())
        };

        let inv_std: Vector = var.iter().map(|v| 1. / (v + self.epsilon).sqrt()).collect();
        let normalized = input.par_map(|_, x| {
            x.iter()
                .zip(&mean)
                .zip(&inv_std)
                .map(|((x, m), s)| (x - m) * s)
                .collect::<Vector>()
        });
        let (gamma, beta) = (self.gamma(), self.beta());
        let out = normalized.par_map(|_, xh| {
            xh.iter()
                .zip(gamma)
                .zip(beta)
                .map(|((xh, g), b)| g * xh + b)
                .collect()
        });

        self.cache = Some(Cache {
            normalized,
            inv_std,
            batch_stats,
        });
        Ok(out)
    }

    fn backward(&mut self, deltas: &Batch<Vector>) -> Result<Batch<Vector>> {
        check_backward(
            deltas,
            self.cache.as_ref().map(|c| c.normalized.len()),
            self.size,
            NAME,
        )?;
        let cache = self.cache.as_ref().ok_or(Error::NotReady { layer: NAME })?;
        let gamma = self.gamma();
        let n = deltas.len() as f64;

        // sum over the batch of delta and delta * x_hat, per feature
        let mut sum_d = vec![0.; self.size];
        let mut sum_dx = vec![0.; self.size];
        if cache.batch_stats {
            for (d, xh) in deltas.iter().zip(cache.normalized.iter()) {
                for k in 0..self.size {
                    sum_d[k] += d[k];
                    sum_dx[k] += d[k] * xh[k];
                }
            }
        }

        let results = deltas.par_map(|s, d| {
            let xh = &cache.normalized[s];
            let d_input: Vector = (0..d.len())
                .map(|k| {
                    let scale = gamma[k] * cache.inv_std[k];
                    if cache.batch_stats {
                        scale / n * (n * d[k] - sum_d[k] - xh[k] * sum_dx[k])
                    } else {
                        scale * d[k]
                    }
                })
                .collect();
            let mut grads: Vector = d.iter().zip(xh).map(|(d, xh)| d * xh).collect();
            grads.extend_from_slice(d);
            (d_input, grads)
        });

        let (d_inputs, grads) = results.unzip();
        self.params.set_grads(&grads);
        Ok(d_inputs)
    }

    fn validate(&self) -> Result<()> {
        if self.size == 0 || !(0. ..=1.).contains(&self.momentum) {
            return Err(Error::config(
                "batch norm needs a non-zero width and momentum in [0, 1]",
            ));
        }
        if self.running_mean.len() != self.size || self.running_var.len() != self.size {
            return Err(Error::config(format!(
                "{}: running statistics must have {} entries",
                NAME, self.size
            )));
        }
        check_param_len(&self.params, 2 * self.size, NAME)
    }
}

impl Updatable for NormLayer {
    fn param_count(&self) -> usize {
        self.params.len()
    }

    fn visit(&mut self, func: &mut dyn FnMut(&mut [f64], &mut [f64])) {
        self.params.visit(func)
    }
}

pub struct BatchNormBuilder {
    momentum: f64,
    epsilon: f64,
}

impl BatchNormBuilder {
    pub fn new() -> Self {
        Self {
            momentum: 0.9,
            epsilon: 1e-5,
        }
    }

    pub fn momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }
}

impl Default for BatchNormBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerBuilder for BatchNormBuilder {
    type Output = NormLayer;

    fn connect(self, in_size: usize, _rng: &mut SmallRng) -> Result<Self::Output> {
        if !(0. ..=1.).contains(&self.momentum) {
            return Err(Error::config(format!(
                "batch norm momentum must be in [0, 1], got {}",
                self.momentum
            )));
        }
        Ok(NormLayer::new(in_size, self.momentum, self.epsilon))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::tests::{check, check_input_grads, check_param_grads, check_shapes, random_batch};
    use rand::SeedableRng;

    fn randomized_layer(rng: &mut SmallRng) -> NormLayer {
        let mut layer = NormLayer::new(3, 0.9, 1e-5);
        let values: Vec<f64> = random_batch(rng, 1, 6).into_vec().remove(0);
        layer.set_params(&values);
        layer
    }

    #[test]
    fn training_output_is_normalized() {
        let mut layer = NormLayer::new(2, 0.9, 1e-8);
        let input = Batch::new(vec![vec![1., 10.], vec![3., 20.], vec![5., 30.]]);
        let out = layer.forward(&input, &mut Context::training()).unwrap();
        for k in 0..2 {
            let mean: f64 = out.iter().map(|y| y[k]).sum::<f64>() / 3.;
            let var: f64 = out.iter().map(|y| (y[k] - mean).powi(2)).sum::<f64>() / 3.;
            assert!(mean.abs() < 1e-9);
            assert!((var - 1.).abs() < 1e-6);
        }
        check(&[0.3, 2.], layer.running_mean(), 1e-12, "running mean");
    }

    #[test]
    fn inference_uses_running_statistics() {
        let mut layer = NormLayer::new(1, 0.5, 0.);
        let input = Batch::new(vec![vec![2.], vec![6.]]);
        layer.forward(&input, &mut Context::training()).unwrap();
        // mean 4 var 4, folded into (0, 1) with momentum 0.5
        check(&[2.], layer.running_mean(), 1e-12, "running mean");
        check(&[2.5], layer.running_var(), 1e-12, "running var");

        let out = layer
            .forward(&Batch::new(vec![vec![2.]]), &mut Context::inference())
            .unwrap();
        check(&[0.], &out[0], 1e-12, "inference output");
    }

    #[test]
    fn finite_differences() {
        let mut rng = SmallRng::seed_from_u64(17);
        let mut layer = randomized_layer(&mut rng);
        let input = random_batch(&mut rng, 5, 3);
        check_shapes(&mut layer, &input);
        check_param_grads(&mut layer, &input, 1, 1e-6);
        check_input_grads(&mut layer, &input, 2, 1e-5);
    }
}
