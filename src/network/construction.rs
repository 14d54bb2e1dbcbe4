use super::Network;
use crate::{
    error::{Error, Result},
    layers::{connector, Connector, Layer, LayerBuilder, LayerKind},
};

use rand::{rngs::SmallRng, SeedableRng};
use tracing::debug;

/// Builder for networks where every layer has a single input and output.
///
/// Layers are queued as builders and connected in order when [`build`](Self::build)
/// is called, each receiving the output width of the one before. Weight
/// initialization draws from a generator seeded with [`seed`](Self::seed), so
/// two builds with the same seed produce identical networks.
pub struct LinearBuilder {
    in_size: usize,
    seed: u64,
    layers: Vec<Connector>,
}

impl LinearBuilder {
    pub fn new(in_size: usize) -> Self {
        LinearBuilder {
            in_size,
            seed: 0,
            layers: Vec::new(),
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Adds a single layer to the network.
    pub fn layer<T: LayerBuilder + 'static>(mut self, layer: T) -> Self {
        self.layers.push(connector(layer));
        self
    }

    /// Adds the result of calling `func` on the layer produced by the provided layer builder.
    pub fn layer_with<T, F, U>(mut self, layer: T, func: F) -> Self
    where
        T: LayerBuilder + 'static,
        F: FnOnce(T::Output) -> U + 'static,
        U: Into<LayerKind>,
    {
        self.layers.push(Box::new(move |in_size, rng: &mut SmallRng| {
            Ok(func(layer.connect(in_size, rng)?).into())
        }));
        self
    }

    /// Adds all of the layers provided by the `builders` argument.
    pub fn layers<T>(mut self, builders: T) -> Self
    where
        T: IntoIterator,
        T::Item: LayerBuilder + 'static,
    {
        for builder in builders {
            self = self.layer(builder);
        }
        self
    }

    /// Connects every queued layer and links them into a [`Network`].
    pub fn build(self) -> Result<Network> {
        if self.in_size == 0 {
            return Err(Error::config("network input width must be non-zero"));
        }
        let mut rng = SmallRng::seed_from_u64(self.seed);
        let mut width = self.in_size;
        let mut layers = Vec::with_capacity(self.layers.len());
        for connect in self.layers {
            let layer = connect(width, &mut rng)?;
            debug!(
                layer = layer.name(),
                in_size = width,
                out_size = layer.out_size(),
                "connected layer"
            );
            width = layer.out_size();
            layers.push(layer);
        }
        Network::with_seed(self.in_size, layers, self.seed)
    }
}
