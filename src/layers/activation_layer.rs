use crate::{
    a_funcs::{ActivFunc, Activation},
    batch::{Batch, Vector},
    error::{Error, Result},
    layers::{check_backward, Context, Layer, LayerBuilder},
};
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

const NAME: &str = "activation";

/// Layer type where every neuron operates only on a single output of the layer below.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ActivationLayer {
    size: usize,
    a_func: Activation,

    #[serde(skip)]
    cache: Option<(Batch<Vector>, Batch<Vector>)>,
}

impl ActivationLayer {
    pub fn new<F: Into<Activation>>(a_func: F, size: usize) -> Self {
        Self {
            size,
            a_func: a_func.into(),
            cache: None,
        }
    }

    pub fn function(&self) -> Activation {
        self.a_func
    }
}

impl Layer for ActivationLayer {
    fn in_size(&self) -> usize {
        self.size
    }

    fn out_size(&self) -> usize {
        self.size
    }

    fn forward(&mut self, input: &Batch<Vector>, _ctx: &mut Context) -> Result<Batch<Vector>> {
        input.check_width(self.size, NAME)?;
        let f = self.a_func;
        let out = input.par_map(|_, x| x.iter().map(|v| f.evaluate(*v)).collect::<Vector>());
        self.cache = Some((input.clone(), out.clone()));
        Ok(out)
    }

    fn backward(&mut self, deltas: &Batch<Vector>) -> Result<Batch<Vector>> {
        check_backward(
            deltas,
            self.cache.as_ref().map(|c| c.0.len()),
            self.size,
            NAME,
        )?;
        let (inputs, outputs) = self.cache.as_ref().ok_or(Error::NotReady { layer: NAME })?;
        let f = self.a_func;
        Ok(deltas.par_map(|s, delta| {
            delta
                .iter()
                .zip(&inputs[s])
                .zip(&outputs[s])
                .map(|((d, i), o)| d * f.derivative(*i, *o))
                .collect()
        }))
    }
}

pub struct ActivationBuilder {
    a_func: Activation,
}

impl ActivationBuilder {
    pub fn new<F: Into<Activation>>(a_func: F) -> Self {
        Self {
            a_func: a_func.into(),
        }
    }
}

impl LayerBuilder for ActivationBuilder {
    type Output = ActivationLayer;

    fn connect(self, in_size: usize, _rng: &mut SmallRng) -> Result<Self::Output> {
        Ok(ActivationLayer::new(self.a_func, in_size))
    }
}
