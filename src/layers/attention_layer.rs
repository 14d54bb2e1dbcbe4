use crate::{
    batch::{Batch, Vector},
    error::{Error, Result},
    helpers::{axpy, dot, softmax_backward, softmax_in_place},
    layers::{check_backward, Context, Layer, LayerBuilder},
};
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

const NAME: &str = "attention";

#[derive(Debug, Clone)]
struct Cache {
    inputs: Batch<Vector>,
    /// Per sample, `dec_steps` rows of `enc_steps` weights.
    weights: Batch<Vector>,
}

/// Dot-product attention of decoder states over encoder outputs.
///
/// A sample is `enc_steps` encoder vectors followed by `dec_steps` decoder
/// vectors, all `dim` wide. For every decoder step the output is the
/// softmax(dec . enc) weighted sum of the encoder vectors.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AttentionLayer {
    enc_steps: usize,
    dec_steps: usize,
    dim: usize,

    #[serde(skip)]
    cache: Option<Cache>,
}

impl AttentionLayer {
    pub fn new(enc_steps: usize, dec_steps: usize, dim: usize) -> Result<Self> {
        let layer = Self {
            enc_steps,
            dec_steps,
            dim,
            cache: None,
        };
        layer.validate()?;
        Ok(layer)
    }

    /// Attention weights from the last forward, for sample `sample`.
    pub fn weights(&self, sample: usize) -> Option<&[f64]> {
        self.cache
            .as_ref()
            .and_then(|c| c.weights.get(sample))
            .map(Vec::as_slice)
    }

    fn split<'a>(&self, x: &'a [f64]) -> (&'a [f64], &'a [f64]) {
        x.split_at(self.enc_steps * self.dim)
    }

    fn attend(&self, x: &[f64]) -> (Vector, Vector) {
        let (enc, dec) = self.split(x);
        let mut context = vec![0.; self.dec_steps * self.dim];
        let mut weights = vec![0.; self.dec_steps * self.enc_steps];

        for ((d, ctx), a) in dec
            .chunks(self.dim)
            .zip(context.chunks_mut(self.dim))
            .zip(weights.chunks_mut(self.enc_steps))
        {
            for (score, e) in a.iter_mut().zip(enc.chunks(self.dim)) {
                *score = dot(d, e);
            }
            softmax_in_place(a);
            for (w, e) in a.iter().zip(enc.chunks(self.dim)) {
                axpy(*w, e, ctx);
            }
        }
        (context, weights)
    }

    fn backprop(&self, x: &[f64], weights: &[f64], d_context: &[f64]) -> Vector {
        let (enc, dec) = self.split(x);
        let mut d_input = vec![0.; x.len()];
        let (d_enc, d_dec) = d_input.split_at_mut(self.enc_steps * self.dim);
        let mut d_weights = vec![0.; self.enc_steps];
        let mut d_scores = vec![0.; self.enc_steps];

        for (((d, dd), a), dc) in dec
            .chunks(self.dim)
            .zip(d_dec.chunks_mut(self.dim))
            .zip(weights.chunks(self.enc_steps))
            .zip(d_context.chunks(self.dim))
        {
            // context = sum_k a_k enc_k
            for ((e, de), (w, dw)) in enc
                .chunks(self.dim)
                .zip(d_enc.chunks_mut(self.dim))
                .zip(a.iter().zip(d_weights.iter_mut()))
            {
                axpy(*w, dc, de);
                *dw = dot(dc, e);
            }
            softmax_backward(a, &d_weights, &mut d_scores);
            // score_k = dec . enc_k
            for ((e, de), ds) in enc
                .chunks(self.dim)
                .zip(d_enc.chunks_mut(self.dim))
                .zip(&d_scores)
            {
                axpy(*ds, e, dd);
                axpy(*ds, d, de);
            }
        }
        d_input
    }
}

impl Layer for AttentionLayer {
    fn in_size(&self) -> usize {
        (self.enc_steps + self.dec_steps) * self.dim
    }

    fn out_size(&self) -> usize {
        self.dec_steps * self.dim
    }

    fn forward(&mut self, input: &Batch<Vector>, _ctx: &mut Context) -> Result<Batch<Vector>> {
        input.check_width(self.in_size(), NAME)?;
        let (out, weights) = input.par_map(|_, x| self.attend(x)).unzip();
        self.cache = Some(Cache {
            inputs: input.clone(),
            weights,
        });
        Ok(out)
    }

    fn backward(&mut self, deltas: &Batch<Vector>) -> Result<Batch<Vector>> {
        check_backward(
            deltas,
            self.cache.as_ref().map(|c| c.inputs.len()),
            self.out_size(),
            NAME,
        )?;
        let cache = self.cache.as_ref().ok_or(Error::NotReady { layer: NAME })?;
        Ok(deltas.par_map(|s, d| self.backprop(&cache.inputs[s], &cache.weights[s], d)))
    }

    fn validate(&self) -> Result<()> {
        if self.enc_steps == 0 || self.dec_steps == 0 || self.dim == 0 {
            return Err(Error::config(
                "attention needs non-zero encoder steps, decoder steps and width",
            ));
        }
        Ok(())
    }
}

pub struct AttentionBuilder {
    enc_steps: usize,
    dec_steps: usize,
}

impl AttentionBuilder {
    pub fn new(enc_steps: usize, dec_steps: usize) -> Self {
        Self {
            enc_steps,
            dec_steps,
        }
    }
}

impl LayerBuilder for AttentionBuilder {
    type Output = AttentionLayer;

    /// The vector width is inferred from the previous layer.
    fn connect(self, in_size: usize, _rng: &mut SmallRng) -> Result<Self::Output> {
        let steps = self.enc_steps + self.dec_steps;
        if self.enc_steps == 0 || self.dec_steps == 0 || in_size == 0 || in_size % steps != 0 {
            return Err(Error::config(format!(
                "width {} cannot be split into {} encoder and {} decoder steps",
                in_size, self.enc_steps, self.dec_steps
            )));
        }
        AttentionLayer::new(self.enc_steps, self.dec_steps, in_size / steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::tests::{check, check_input_grads, check_shapes, random_batch};
    use rand::SeedableRng;

    #[test]
    fn orthogonal_keys() {
        let mut layer = AttentionLayer::new(2, 1, 2).unwrap();
        // decoder state matches the first encoder output far better than the second
        let input = Batch::new(vec![vec![10., 0., 0., 10., 1., 0.]]);
        let out = layer.forward(&input, &mut Context::inference()).unwrap();
        let a = 1. / (1. + (-10f64).exp());
        check(&[10. * a, 10. * (1. - a)], &out[0], 1e-12, "context");
        let w = layer.weights(0).unwrap();
        assert!((w.iter().sum::<f64>() - 1.).abs() < 1e-12);
    }

    #[test]
    fn finite_differences() {
        let mut rng = SmallRng::seed_from_u64(5);
        let mut layer = AttentionLayer::new(3, 2, 4).unwrap();
        let input = random_batch(&mut rng, 3, 20);
        check_shapes(&mut layer, &input);
        check_input_grads(&mut layer, &input, 6, 1e-6);
    }

    #[test]
    fn infers_dimension() {
        let mut rng = SmallRng::seed_from_u64(0);
        let layer = AttentionBuilder::new(3, 2).connect(20, &mut rng).unwrap();
        assert_eq!(layer.out_size(), 8);
        assert!(AttentionBuilder::new(3, 2).connect(21, &mut rng).is_err());
    }

    #[test]
    fn rejects_empty_dimensions() {
        assert!(matches!(AttentionLayer::new(0, 2, 4), Err(Error::Config(_))));
        assert!(AttentionLayer::new(3, 0, 4).is_err());
        assert!(AttentionLayer::new(3, 2, 0).is_err());
    }
}
