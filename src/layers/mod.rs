pub mod activation_layer;
pub mod attention_layer;
pub mod conv_layer;
pub mod dense_layer;
pub mod dropout_layer;
pub mod embedding_layer;
pub mod norm_layer;
pub mod recurrent;
pub mod skip_layer;
pub mod softmax_layer;

pub use activation_layer::{ActivationBuilder, ActivationLayer};
pub use attention_layer::{AttentionBuilder, AttentionLayer};
pub use conv_layer::{ConvBuilder, ConvLayer};
pub use dense_layer::{DenseBuilder, DenseLayer};
pub use dropout_layer::{DropoutBuilder, DropoutLayer};
pub use embedding_layer::{EmbeddingBuilder, EmbeddingLayer};
pub use norm_layer::{BatchNormBuilder, NormLayer};
pub use recurrent::{CellKind, RecurrentBuilder, RecurrentLayer};
pub use skip_layer::{SkipBuilder, SkipLayer};
pub use softmax_layer::{SoftmaxBuilder, SoftmaxLayer};

use crate::batch::{Batch, Vector};
use crate::error::{Error, Result};
use crate::optimizer::Optimizer;

use enum_dispatch::enum_dispatch;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Per-call execution state handed to every layer: whether we are training,
/// and the random generator used by stochastic layers such as dropout.
#[derive(Debug, Clone)]
pub struct Context {
    training: bool,
    rng: SmallRng,
}

impl Context {
    pub fn new(training: bool, seed: u64) -> Self {
        Self {
            training,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn training() -> Self {
        Self::new(true, 0)
    }

    pub fn inference() -> Self {
        Self::new(false, 0)
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }
}

/// One stage of the differentiable pipeline.
///
/// `forward` consumes one vector of width [`in_size`](Layer::in_size) per
/// sample and returns one vector of width [`out_size`](Layer::out_size) per
/// sample. Whatever `backward` needs is cached internally and overwritten on
/// the next call.
///
/// `backward` receives the loss gradient w.r.t. this layer's outputs and
/// returns the gradient w.r.t. its inputs. It must follow a `forward` with the
/// same number of samples. Layers with parameters compute their gradient here
/// but never touch their weights; that is left to [`Updatable::update`].
#[enum_dispatch]
pub trait Layer {
    fn in_size(&self) -> usize;
    fn out_size(&self) -> usize;
    fn forward(&mut self, input: &Batch<Vector>, ctx: &mut Context) -> Result<Batch<Vector>>;
    fn backward(&mut self, deltas: &Batch<Vector>) -> Result<Batch<Vector>>;

    /// Forget state carried between calls. Only stateful layers care.
    fn reset_state(&mut self) {}

    /// Checks that the stored geometry and parameter sizes agree. Layers that
    /// come out of a builder always pass; deserialized ones may not.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Capability of layers owning trainable parameters.
///
/// Parameters and gradients share one flat layout per layer. `visit` hands out
/// matching chunks of both in that layout order; everything else is built on it.
pub trait Updatable {
    fn param_count(&self) -> usize;

    fn visit(&mut self, func: &mut dyn FnMut(&mut [f64], &mut [f64]));

    fn params(&mut self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.param_count());
        self.visit(&mut |p, _| out.extend_from_slice(p));
        out
    }

    /// Batch-mean gradient from the last backward pass, zero after an update.
    fn gradients(&mut self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.param_count());
        self.visit(&mut |_, g| out.extend_from_slice(g));
        out
    }

    /// Overwrite every parameter. Panics if `values` has the wrong length.
    fn set_params(&mut self, values: &[f64]) {
        assert_eq!(values.len(), self.param_count(), "Parameter count mismatch");
        let mut offset = 0;
        self.visit(&mut |p, _| {
            p.copy_from_slice(&values[offset..offset + p.len()]);
            offset += p.len();
        });
    }

    /// Step every parameter with `optimizer`, using consecutive global indices
    /// starting at `offset`. Consumes the gradients and returns the next free index.
    fn update(&mut self, optimizer: &mut dyn Optimizer, offset: usize) -> usize {
        let mut idx = offset;
        self.visit(&mut |params, grads| {
            for (w, g) in params.iter_mut().zip(grads.iter_mut()) {
                *w = optimizer.optimize(idx, *w, *g);
                *g = 0.;
                idx += 1;
            }
        });
        idx
    }
}

/// Flat parameter storage with the gradient buffer that mirrors it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Params {
    values: Vec<f64>,
    #[serde(skip)]
    grads: Vec<f64>,
}

impl Params {
    pub fn new(values: Vec<f64>) -> Self {
        let grads = vec![0.; values.len()];
        Self { values, grads }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn grads(&self) -> &[f64] {
        &self.grads
    }

    /// Replace the gradient with the batch mean of per-sample gradients.
    pub(crate) fn set_grads(&mut self, per_sample: &Batch<Vector>) {
        self.grads = per_sample.mean_of(self.values.len());
    }

    pub(crate) fn visit(&mut self, func: &mut dyn FnMut(&mut [f64], &mut [f64])) {
        // deserialized layers come back without a gradient buffer
        if self.grads.len() != self.values.len() {
            self.grads = vec![0.; self.values.len()];
        }
        func(&mut self.values, &mut self.grads);
    }
}

/// Fails unless `params` holds exactly `expected` values.
pub(crate) fn check_param_len(params: &Params, expected: usize, layer: &'static str) -> Result<()> {
    if params.len() != expected {
        return Err(Error::config(format!(
            "{}: expected {} parameters, found {}",
            layer,
            expected,
            params.len()
        )));
    }
    Ok(())
}

/// Validates every layer and every link of a chain fed `in_size` wide input.
/// Returns the output width of the chain.
pub(crate) fn check_chain(in_size: usize, layers: &[LayerKind]) -> Result<usize> {
    let mut width = in_size;
    for (index, layer) in layers.iter().enumerate() {
        layer.validate()?;
        if layer.in_size() != width {
            return Err(Error::config(format!(
                "layer {} ({}) expects width {} but the previous layer outputs {}",
                index,
                layer.name(),
                layer.in_size(),
                width
            )));
        }
        width = layer.out_size();
    }
    Ok(width)
}

/// Checks shared by every backward pass.
pub(crate) fn check_backward(
    deltas: &Batch<Vector>,
    forward_len: Option<usize>,
    width: usize,
    layer: &'static str,
) -> Result<()> {
    let expected = forward_len.ok_or(Error::NotReady { layer })?;
    if deltas.len() != expected {
        return Err(Error::BatchSize {
            layer,
            expected,
            found: deltas.len(),
        });
    }
    deltas.check_width(width, layer)
}

/// Every layer variant the chain can hold.
#[enum_dispatch(Layer)]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LayerKind {
    Dense(DenseLayer),
    Activation(ActivationLayer),
    Dropout(DropoutLayer),
    Conv(ConvLayer),
    Embedding(EmbeddingLayer),
    Softmax(SoftmaxLayer),
    Recurrent(RecurrentLayer),
    Attention(AttentionLayer),
    Skip(SkipLayer),
    BatchNorm(NormLayer),
}

impl LayerKind {
    /// The trainable surface of this layer, if it has one.
    pub fn as_updatable(&mut self) -> Option<&mut dyn Updatable> {
        match self {
            LayerKind::Dense(l) => Some(l),
            LayerKind::Conv(l) => Some(l),
            LayerKind::Embedding(l) => Some(l),
            LayerKind::Recurrent(l) => Some(l),
            LayerKind::Skip(l) => Some(l),
            LayerKind::BatchNorm(l) => Some(l),
            LayerKind::Activation(_)
            | LayerKind::Dropout(_)
            | LayerKind::Softmax(_)
            | LayerKind::Attention(_) => None,
        }
    }

    pub fn param_count(&self) -> usize {
        match self {
            LayerKind::Dense(l) => l.param_count(),
            LayerKind::Conv(l) => l.param_count(),
            LayerKind::Embedding(l) => l.param_count(),
            LayerKind::Recurrent(l) => l.param_count(),
            LayerKind::Skip(l) => l.param_count(),
            LayerKind::BatchNorm(l) => l.param_count(),
            LayerKind::Activation(_)
            | LayerKind::Dropout(_)
            | LayerKind::Softmax(_)
            | LayerKind::Attention(_) => 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Dense(_) => "dense",
            LayerKind::Activation(_) => "activation",
            LayerKind::Dropout(_) => "dropout",
            LayerKind::Conv(_) => "conv",
            LayerKind::Embedding(_) => "embedding",
            LayerKind::Softmax(_) => "softmax",
            LayerKind::Recurrent(_) => "recurrent",
            LayerKind::Attention(_) => "attention",
            LayerKind::Skip(_) => "skip",
            LayerKind::BatchNorm(_) => "batch_norm",
        }
    }
}

/// Trait all layer builders must implement in order to be added to a
/// [LinearBuilder](crate::network::LinearBuilder). `in_size` is the output
/// width of the layer before, `rng` feeds the weight initializer.
pub trait LayerBuilder {
    type Output: Into<LayerKind>;
    fn connect(self, in_size: usize, rng: &mut SmallRng) -> Result<Self::Output>;
}

/// A layer builder with its output type erased so different builders can be queued.
pub(crate) type Connector = Box<dyn FnOnce(usize, &mut SmallRng) -> Result<LayerKind>>;

pub(crate) fn connector<B: LayerBuilder + 'static>(builder: B) -> Connector {
    Box::new(move |in_size, rng| Ok(builder.connect(in_size, rng)?.into()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::Rng;

    /// Compares two arrays with the given error tolerance. Returns None if either of the arrays contains NaN.
    pub(crate) fn is_equal_ish(left: &[f64], right: &[f64], tolerance: f64) -> Option<bool> {
        assert_eq!(left.len(), right.len());
        let err = left
            .iter()
            .zip(right)
            .map(|(l, r)| f64::abs(l - r))
            .try_fold(0., |a: f64, b| if b.is_nan() { None } else { Some(a.max(b)) });
        err.map(|e| e < tolerance)
    }

    pub(crate) fn check(expected: &[f64], output: &[f64], tolerance: f64, id: &str) {
        let diag = || format!("expected: {:?}\nreceived: {:?}", expected, output);

        if let Some(eq) = is_equal_ish(expected, output, tolerance) {
            if eq {
                return;
            } else {
                panic!("Evaluation produced incorrect {}.\n{}", id, diag())
            }
        } else {
            panic!("Evaluation produced a NaN\n{}", diag())
        }
    }

    pub(crate) fn random_batch(rng: &mut SmallRng, len: usize, width: usize) -> Batch<Vector> {
        (0..len)
            .map(|_| (0..width).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect()
    }

    /// `sum_s <deltas_s, output_s>`, a linear probe whose gradient w.r.t. the
    /// output is exactly `deltas`.
    fn probe<L: Layer>(layer: &mut L, input: &Batch<Vector>, deltas: &Batch<Vector>) -> f64 {
        let out = layer
            .forward(input, &mut Context::training())
            .expect("forward failed");
        out.iter()
            .zip(deltas.iter())
            .map(|(o, d)| crate::helpers::dot(o, d))
            .sum()
    }

    const EPS: f64 = 1e-5;

    /// Central-difference check of the parameter gradients of `layer`.
    pub(crate) fn check_param_grads<L: Layer + Updatable>(
        layer: &mut L,
        input: &Batch<Vector>,
        seed: u64,
        tolerance: f64,
    ) {
        let mut rng = SmallRng::seed_from_u64(seed);
        let out = layer.forward(input, &mut Context::training()).unwrap();
        let deltas = random_batch(&mut rng, out.len(), layer.out_size());
        layer.backward(&deltas).unwrap();
        let analytic = layer.gradients();

        let base = layer.params();
        let n = input.len() as f64;
        let mut numeric = Vec::with_capacity(base.len());
        for p in 0..base.len() {
            let mut shifted = base.clone();
            shifted[p] = base[p] + EPS;
            layer.set_params(&shifted);
            let hi = probe(layer, input, &deltas);
            shifted[p] = base[p] - EPS;
            layer.set_params(&shifted);
            let lo = probe(layer, input, &deltas);
            numeric.push((hi - lo) / (2. * EPS) / n);
        }
        layer.set_params(&base);
        check(&numeric, &analytic, tolerance, "parameter gradients");
    }

    /// Central-difference check of the input gradient returned by backward.
    pub(crate) fn check_input_grads<L: Layer>(
        layer: &mut L,
        input: &Batch<Vector>,
        seed: u64,
        tolerance: f64,
    ) {
        let mut rng = SmallRng::seed_from_u64(seed);
        let out = layer.forward(input, &mut Context::training()).unwrap();
        let deltas = random_batch(&mut rng, out.len(), layer.out_size());
        let analytic = layer.backward(&deltas).unwrap();

        for s in 0..input.len() {
            let mut numeric = Vec::with_capacity(layer.in_size());
            for k in 0..layer.in_size() {
                let mut shifted = input.clone();
                shifted[s][k] += EPS;
                let hi = probe(layer, &shifted, &deltas);
                shifted[s][k] -= 2. * EPS;
                let lo = probe(layer, &shifted, &deltas);
                numeric.push((hi - lo) / (2. * EPS));
            }
            check(&numeric, &analytic[s], tolerance, "input gradients");
        }
    }

    /// Forward and backward preserve sample count and report the declared widths.
    pub(crate) fn check_shapes<L: Layer>(layer: &mut L, input: &Batch<Vector>) {
        let out = layer.forward(input, &mut Context::training()).unwrap();
        assert_eq!(out.len(), input.len());
        out.check_width(layer.out_size(), "shape test").unwrap();
        let deltas = Batch::zeroed(out.len(), layer.out_size());
        let back = layer.backward(&deltas).unwrap();
        assert_eq!(back.len(), input.len());
        back.check_width(layer.in_size(), "shape test").unwrap();
    }
}
