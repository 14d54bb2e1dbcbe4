use crate::{
    batch::{Batch, Vector},
    error::{Error, Result},
    layers::{
        check_backward, check_chain, connector, Connector, Context, Layer, LayerBuilder, LayerKind,
        Updatable,
    },
};
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

const NAME: &str = "skip";

/// Residual connection around a sub-chain: `output = sub(x) + x`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SkipLayer {
    size: usize,
    layers: Vec<LayerKind>,

    /// Sample count of the last forward.
    #[serde(skip)]
    forward_len: Option<usize>,
}

impl SkipLayer {
    /// Fails unless the sub-chain maps `size` to `size` and every link matches.
    pub fn new(size: usize, layers: Vec<LayerKind>) -> Result<Self> {
        let layer = Self {
            size,
            layers,
            forward_len: None,
        };
        layer.validate()?;
        Ok(layer)
    }

    pub fn layers(&self) -> &[LayerKind] {
        &self.layers
    }
}

impl Layer for SkipLayer {
    fn in_size(&self) -> usize {
        self.size
    }

    fn out_size(&self) -> usize {
        self.size
    }

    fn forward(&mut self, input: &Batch<Vector>, ctx: &mut Context) -> Result<Batch<Vector>> {
        input.check_width(self.size, NAME)?;
        let mut out = input.clone();
        for layer in &mut self.layers {
            out = layer.forward(&out, ctx)?;
        }
        self.forward_len = Some(input.len());
        Ok(out.add(input))
    }

    fn backward(&mut self, deltas: &Batch<Vector>) -> Result<Batch<Vector>> {
        check_backward(deltas, self.forward_len, self.size, NAME)?;
        let mut grad = deltas.clone();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad)?;
        }
        Ok(grad.add(deltas))
    }

    fn reset_state(&mut self) {
        self.layers.iter_mut().for_each(|l| l.reset_state());
    }

    fn validate(&self) -> Result<()> {
        let width = check_chain(self.size, &self.layers)?;
        if width != self.size {
            return Err(Error::config(format!(
                "skip: sub-chain maps width {} to {}, the shortcut needs them equal",
                self.size, width
            )));
        }
        Ok(())
    }
}

impl Updatable for SkipLayer {
    fn param_count(&self) -> usize {
        self.layers.iter().map(LayerKind::param_count).sum()
    }

    fn visit(&mut self, func: &mut dyn FnMut(&mut [f64], &mut [f64])) {
        for layer in &mut self.layers {
            if let Some(l) = layer.as_updatable() {
                l.visit(func);
            }
        }
    }
}

/// Collects the sub-chain of a [`SkipLayer`] the same way
/// [LinearBuilder](crate::network::LinearBuilder) does for a whole network.
#[derive(Default)]
pub struct SkipBuilder {
    layers: Vec<Connector>,
}

impl SkipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer<B: LayerBuilder + 'static>(mut self, builder: B) -> Self {
        self.layers.push(connector(builder));
        self
    }
}

impl LayerBuilder for SkipBuilder {
    type Output = SkipLayer;

    fn connect(self, in_size: usize, rng: &mut SmallRng) -> Result<Self::Output> {
        let mut width = in_size;
        let mut layers = Vec::with_capacity(self.layers.len());
        for connect in self.layers {
            let layer = connect(width, rng)?;
            width = layer.out_size();
            layers.push(layer);
        }
        SkipLayer::new(in_size, layers)
    }
}
