pub mod construction;

pub use self::construction::LinearBuilder;

use crate::{
    batch::{Batch, Vector},
    error::{Error, Result},
    helpers::global_norm,
    layers::{check_chain, Context, Layer, LayerKind},
    optimizer::Optimizer,
};

use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use std::{fs, path::Path};

/// One slot of the layer arena. Neighbours are referenced by index only.
#[derive(Clone, Debug)]
pub struct Node {
    pub layer: LayerKind,
    pub previous: Option<usize>,
    pub next: Option<usize>,
}

/// A chain of layers together with the random generator that drives sampling
/// and stochastic layers.
///
/// Layers live in an arena and are linked by index, first to last. The
/// output width of every layer equals the input width of the next one, and
/// every layer's parameters match its geometry; both are checked whenever a
/// network is constructed or deserialized.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(into = "NetworkUnvalidated", try_from = "NetworkUnvalidated")]
pub struct Network {
    in_size: usize,
    nodes: Vec<Node>,
    head: Option<usize>,
    seed: u64,
    loss: Option<f64>,
    pub(crate) rng: SmallRng,
}

impl Network {
    pub fn new(in_size: usize, layers: Vec<LayerKind>) -> Result<Self> {
        Self::with_seed(in_size, layers, 0)
    }

    pub fn with_seed(in_size: usize, layers: Vec<LayerKind>, seed: u64) -> Result<Self> {
        check_chain(in_size, &layers)?;

        let count = layers.len();
        let nodes = layers
            .into_iter()
            .enumerate()
            .map(|(idx, layer)| Node {
                layer,
                previous: idx.checked_sub(1),
                next: Some(idx + 1).filter(|n| *n < count),
            })
            .collect();

        Ok(Self {
            in_size,
            nodes,
            head: if count > 0 { Some(0) } else { None },
            seed,
            loss: None,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Network> {
        let s = fs::read_to_string(path)?;
        let network: Network = serde_json::from_str(&s)?;
        Ok(network)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        fs::write(path, serde_json::to_string(&self)?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Network> {
        Self::from_file(path)
    }

    pub fn in_size(&self) -> usize {
        self.in_size
    }

    pub fn out_size(&self) -> usize {
        self.layers().last().map_or(self.in_size, |l| l.out_size())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Aggregate loss over the training data after the last epoch of `fit`.
    pub fn loss(&self) -> Option<f64> {
        self.loss
    }

    pub(crate) fn set_loss(&mut self, loss: f64) {
        self.loss = Some(loss);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    /// Arena indices in chain order.
    fn order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            order.push(idx);
            cursor = self.nodes[idx].next;
        }
        order
    }

    /// Layers in chain order.
    pub fn layers(&self) -> impl Iterator<Item = &LayerKind> + '_ {
        self.order().into_iter().map(move |idx| &self.nodes[idx].layer)
    }

    pub fn param_count(&self) -> usize {
        self.layers().map(LayerKind::param_count).sum()
    }

    /// Feed a batch through every layer. `training` selects the behaviour of
    /// layers such as dropout and batch norm.
    pub fn forward(&mut self, input: &Batch<Vector>, training: bool) -> Result<Batch<Vector>> {
        input.check_width(self.in_size, "input")?;
        let mut ctx = Context::new(training, self.rng.gen());
        let mut current = input.clone();
        for idx in self.order() {
            current = self.nodes[idx].layer.forward(&current, &mut ctx)?;
        }
        Ok(current)
    }

    /// Propagate the loss gradient from the last layer to the first and
    /// return the gradient w.r.t. the network input.
    pub fn backward(&mut self, deltas: &Batch<Vector>) -> Result<Batch<Vector>> {
        let mut current = deltas.clone();
        for idx in self.order().into_iter().rev() {
            current = self.nodes[idx].layer.backward(&current)?;
        }
        Ok(current)
    }

    pub fn predict(&mut self, input: &[f64]) -> Result<Vector> {
        let out = self.predict_batch(&Batch::new(vec![input.to_vec()]))?;
        Ok(out.into_vec().remove(0))
    }

    pub fn predict_batch(&mut self, input: &Batch<Vector>) -> Result<Batch<Vector>> {
        self.forward(input, false)
    }

    /// Calls `func` with every parameter chunk and its gradient, in the same
    /// order the optimizer sees them.
    pub fn visit_params(&mut self, func: &mut dyn FnMut(&mut [f64], &mut [f64])) {
        for idx in self.order() {
            if let Some(layer) = self.nodes[idx].layer.as_updatable() {
                layer.visit(func);
            }
        }
    }

    pub fn params(&mut self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.param_count());
        self.visit_params(&mut |p, _| out.extend_from_slice(p));
        out
    }

    pub fn gradients(&mut self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.param_count());
        self.visit_params(&mut |_, g| out.extend_from_slice(g));
        out
    }

    /// L2 norm of every gradient in the network.
    pub fn grad_norm(&mut self) -> f64 {
        let mut chunks = Vec::new();
        self.visit_params(&mut |_, g| chunks.push(g.to_vec()));
        global_norm(chunks.iter().map(Vec::as_slice))
    }

    /// Step every trainable layer with `optimizer`. Parameters get consecutive
    /// global indices starting at zero, walking the chain front to back.
    pub fn update<O: Optimizer + ?Sized>(&mut self, mut optimizer: &mut O) {
        let mut index = 0;
        for idx in self.order() {
            if let Some(layer) = self.nodes[idx].layer.as_updatable() {
                index = layer.update(&mut optimizer, index);
            }
        }
    }

    /// Clears the state stateful layers carry between calls.
    pub fn reset_state(&mut self) {
        for node in &mut self.nodes {
            node.layer.reset_state();
        }
    }
}

/// Serialized form of a [`Network`]: layers in chain order, validated on load.
#[derive(Serialize, Deserialize)]
struct NetworkUnvalidated {
    in_size: usize,
    seed: u64,
    layers: Vec<LayerKind>,
}

impl From<Network> for NetworkUnvalidated {
    fn from(network: Network) -> Self {
        let order = network.order();
        let mut slots: Vec<Option<LayerKind>> =
            network.nodes.into_iter().map(|n| Some(n.layer)).collect();
        NetworkUnvalidated {
            in_size: network.in_size,
            seed: network.seed,
            layers: order.into_iter().filter_map(|idx| slots[idx].take()).collect(),
        }
    }
}

impl TryFrom<NetworkUnvalidated> for Network {
    type Error = Error;

    fn try_from(value: NetworkUnvalidated) -> Result<Self> {
        debug!(layers = value.layers.len(), "validating deserialized network");
        Network::with_seed(value.in_size, value.layers, value.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        a_funcs::{Identity, Sigmoid},
        initializer::WeightInit,
        layers::{ActivationBuilder, DenseBuilder, DenseLayer, LayerBuilder},
        optimizer::GradientDescent,
    };

    fn dense(in_size: usize, size: usize, weights: Vec<f64>) -> LayerKind {
        let mut rng = SmallRng::seed_from_u64(0);
        DenseLayer::new(WeightInit::new(weights), &mut rng, in_size, size, true, true).into()
    }

    #[test]
    fn links_follow_the_chain() {
        let network = Network::new(
            2,
            vec![dense(2, 3, vec![1.; 6]), dense(3, 1, vec![1.; 3])],
        )
        .unwrap();
        assert_eq!(network.node(0).unwrap().previous, None);
        assert_eq!(network.node(0).unwrap().next, Some(1));
        assert_eq!(network.node(1).unwrap().previous, Some(0));
        assert_eq!(network.node(1).unwrap().next, None);
        assert_eq!(network.out_size(), 1);
        assert_eq!(network.param_count(), 9 + 4);
    }

    #[test]
    fn rejects_mismatched_links() {
        let res = Network::new(2, vec![dense(2, 3, vec![1.; 6]), dense(2, 1, vec![1.; 2])]);
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[test]
    fn chain_forward_and_backward() {
        let mut network = Network::new(
            2,
            vec![dense(2, 2, vec![1., 2., 3., 4.]), dense(2, 1, vec![1., -1.])],
        )
        .unwrap();
        // first layer: [1 + 6, 2 + 8] for input [1, 2]
        let out = network.predict(&[1., 2.]).unwrap();
        assert_eq!(out, vec![-3.]);

        network.forward(&Batch::new(vec![vec![1., 2.]]), true).unwrap();
        let dx = network.backward(&Batch::new(vec![vec![1.]])).unwrap();
        // d out / d x = W1 * W2 = [1 - 2, 3 - 4]
        assert_eq!(dx[0], vec![-1., -1.]);
    }

    #[test]
    fn update_uses_global_indices() {
        struct Recorder(Vec<usize>);
        impl Optimizer for Recorder {
            fn optimize(&mut self, index: usize, weight: f64, _gradient: f64) -> f64 {
                self.0.push(index);
                weight
            }
        }

        let mut rng = SmallRng::seed_from_u64(0);
        let layers: Vec<LayerKind> = vec![
            DenseBuilder::new(3).connect(2, &mut rng).unwrap().into(),
            ActivationBuilder::new(Sigmoid).connect(3, &mut rng).unwrap().into(),
            DenseBuilder::new(1).connect(3, &mut rng).unwrap().into(),
        ];
        let mut network = Network::new(2, layers).unwrap();
        let mut rec = Recorder(Vec::new());
        network.update(&mut rec);
        assert_eq!(rec.0, (0..13).collect::<Vec<_>>());
    }

    #[test]
    fn update_consumes_gradients() {
        let mut network = Network::new(1, vec![dense(1, 1, vec![2.])]).unwrap();
        network.forward(&Batch::new(vec![vec![3.]]), true).unwrap();
        network.backward(&Batch::new(vec![vec![1.]])).unwrap();
        assert_eq!(network.gradients(), vec![3., 1.]);
        assert!((network.grad_norm() - 10f64.sqrt()).abs() < 1e-12);

        network.update(&mut GradientDescent::new(0.5));
        assert_eq!(network.params(), vec![0.5, -0.5]);
        assert_eq!(network.gradients(), vec![0., 0.]);
    }

    #[test]
    fn serde_round_trip_keeps_predictions() {
        let mut rng = SmallRng::seed_from_u64(4);
        let layers: Vec<LayerKind> = vec![
            DenseBuilder::new(4).connect(3, &mut rng).unwrap().into(),
            ActivationBuilder::new(Identity).connect(4, &mut rng).unwrap().into(),
        ];
        let mut network = Network::with_seed(3, layers, 99).unwrap();
        let json = serde_json::to_string(&network).unwrap();
        let mut loaded: Network = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.seed(), 99);
        assert_eq!(
            network.predict(&[1., 2., 3.]).unwrap(),
            loaded.predict(&[1., 2., 3.]).unwrap()
        );
    }

    #[test]
    fn invalid_json_is_rejected() {
        let mut rng = SmallRng::seed_from_u64(0);
        let layers: Vec<LayerKind> = vec![DenseBuilder::new(2).connect(3, &mut rng).unwrap().into()];
        let network = Network::new(3, layers).unwrap();
        let mut value = serde_json::to_value(&network).unwrap();
        value["in_size"] = serde_json::json!(5);
        assert!(serde_json::from_value::<Network>(value).is_err());
    }

    fn dense_and_softmax() -> serde_json::Value {
        let network = LinearBuilder::new(2)
            .layer(DenseBuilder::new(2))
            .layer(crate::layers::SoftmaxBuilder::new())
            .build()
            .unwrap();
        serde_json::to_value(&network).unwrap()
    }

    #[test]
    fn truncated_params_are_rejected() {
        let mut value = dense_and_softmax();
        value["layers"][0]["Dense"]["params"]["values"] = serde_json::json!([0.5, 0.5]);
        let res = serde_json::from_value::<Network>(value);
        assert!(res.is_err());

        let mut value = dense_and_softmax();
        value["layers"][1]["Softmax"]["group_size"] = serde_json::json!(0);
        assert!(serde_json::from_value::<Network>(value).is_err());

        assert!(serde_json::from_value::<Network>(dense_and_softmax()).is_ok());
    }

    #[test]
    fn broken_skip_chain_is_rejected() {
        let network = LinearBuilder::new(3)
            .layer(
                crate::layers::SkipBuilder::new()
                    .layer(DenseBuilder::new(3))
                    .layer(ActivationBuilder::new(Sigmoid)),
            )
            .build()
            .unwrap();
        let mut value = serde_json::to_value(&network).unwrap();
        value["layers"][0]["Skip"]["layers"][1]["Activation"]["size"] = serde_json::json!(4);
        assert!(serde_json::from_value::<Network>(value).is_err());
    }
}
