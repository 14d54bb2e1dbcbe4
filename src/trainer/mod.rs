//! Mini-batch stochastic training for a [`Network`].

mod observer;

pub use observer::{Observer, Silent, TracingObserver};

use crate::{
    batch::{Batch, Vector},
    error::{Error, Result},
    helpers::{axpy, Sampler},
    loss::LossFunc,
    network::Network,
    optimizer::Optimizer,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Added to the gradient norm before dividing, so clipping never divides by zero.
const CLIP_EPS: f64 = 1e-6;

/// One labeled sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Data {
    pub input: Vector,
    pub target: Vector,
}

impl Data {
    pub fn new(input: impl Into<Vector>, target: impl Into<Vector>) -> Self {
        Self {
            input: input.into(),
            target: target.into(),
        }
    }
}

/// This struct contains the configuration information for stochastic training.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// L2 penalty; `weight_decay * w` is added to every gradient.
    pub weight_decay: f64,
    /// Rescale all gradients when their global L2 norm exceeds this.
    pub max_grad_norm: Option<f64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            batch_size: 32,
            weight_decay: 0.,
            max_grad_norm: None,
        }
    }
}

impl TrainConfig {
    pub fn new(epochs: usize, batch_size: usize) -> Self {
        Self {
            epochs,
            batch_size,
            ..Default::default()
        }
    }

    pub fn weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn max_grad_norm(mut self, threshold: f64) -> Self {
        self.max_grad_norm = Some(threshold);
        self
    }
}

impl Network {
    /// Train on `data` for `epochs` passes of mini-batches of `batch_size`.
    /// Returns the mean loss over `data` after the last epoch.
    pub fn fit<O, L>(
        &mut self,
        data: &[Data],
        epochs: usize,
        batch_size: usize,
        optimizer: &mut O,
        loss: &L,
    ) -> Result<f64>
    where
        O: Optimizer + ?Sized,
        L: LossFunc + ?Sized,
    {
        self.fit_with(
            &TrainConfig::new(epochs, batch_size),
            data,
            optimizer,
            loss,
            &mut Silent,
        )
    }

    /// Like [`fit`](Self::fit) with weight decay, gradient clipping and an
    /// observer notified after every epoch.
    pub fn fit_with<O, L, B>(
        &mut self,
        config: &TrainConfig,
        data: &[Data],
        optimizer: &mut O,
        loss: &L,
        observer: &mut B,
    ) -> Result<f64>
    where
        O: Optimizer + ?Sized,
        L: LossFunc + ?Sized,
        B: Observer + ?Sized,
    {
        if config.batch_size == 0 {
            return Err(Error::config("batch size must be non-zero"));
        }
        self.check_data(data)?;
        debug!(
            samples = data.len(),
            epochs = config.epochs,
            batch_size = config.batch_size,
            "starting training"
        );

        let mut sampler = Sampler::new(data.len());
        let mut last = None;
        for epoch in 0..config.epochs {
            sampler.reset();
            let mut batches = 0;
            while sampler.remaining() > 0 {
                let indices = sampler.take(config.batch_size, &mut self.rng).to_vec();
                self.train_batch(config, data, &indices, optimizer, loss)?;
                batches += 1;
            }

            let epoch_loss = self.evaluate(data, loss)?;
            self.set_loss(epoch_loss);
            debug!(epoch, batches, loss = epoch_loss, "epoch finished");
            observer.stepped(epoch, self);
            last = Some(epoch_loss);
        }

        match last {
            Some(l) => Ok(l),
            None => self.evaluate(data, loss),
        }
    }

    /// Mean per-sample loss over `data`, computed in inference mode.
    pub fn evaluate<L: LossFunc + ?Sized>(&mut self, data: &[Data], loss: &L) -> Result<f64> {
        self.check_data(data)?;
        let inputs: Batch<Vector> = data.iter().map(|d| d.input.clone()).collect();
        let outputs = self.forward(&inputs, false)?;
        let total: f64 = outputs
            .iter()
            .zip(data)
            .map(|(out, d)| loss.forward(out, &d.target))
            .sum();
        Ok(total / data.len() as f64)
    }

    fn train_batch<O, L>(
        &mut self,
        config: &TrainConfig,
        data: &[Data],
        indices: &[usize],
        optimizer: &mut O,
        loss: &L,
    ) -> Result<()>
    where
        O: Optimizer + ?Sized,
        L: LossFunc + ?Sized,
    {
        let inputs: Batch<Vector> = indices.iter().map(|&i| data[i].input.clone()).collect();
        let outputs = self.forward(&inputs, true)?;
        let deltas = outputs.par_map(|s, out| loss.backward(out, &data[indices[s]].target));
        self.backward(&deltas)?;

        if config.weight_decay != 0. {
            let decay = config.weight_decay;
            self.visit_params(&mut |params, grads| axpy(decay, params, grads));
        }
        if let Some(threshold) = config.max_grad_norm {
            self.clip_gradients(threshold);
        }
        self.update(optimizer);
        Ok(())
    }

    /// Scale every gradient by `threshold / (norm + eps)` if the global norm
    /// exceeds `threshold`. Returns the norm before clipping.
    pub fn clip_gradients(&mut self, threshold: f64) -> f64 {
        let norm = self.grad_norm();
        if norm > threshold {
            let scale = threshold / (norm + CLIP_EPS);
            trace!(norm, scale, "clipping gradients");
            self.visit_params(&mut |_, grads| grads.iter_mut().for_each(|g| *g *= scale));
        }
        norm
    }

    fn check_data(&self, data: &[Data]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::EmptyData);
        }
        let (in_size, out_size) = (self.in_size(), self.out_size());
        for d in data {
            if d.input.len() != in_size {
                return Err(Error::Width {
                    layer: "input",
                    expected: in_size,
                    found: d.input.len(),
                });
            }
            if d.target.len() != out_size {
                return Err(Error::Width {
                    layer: "target",
                    expected: out_size,
                    found: d.target.len(),
                });
            }
        }
        Ok(())
    }
}
