use crate::{
    batch::{Batch, Vector},
    error::{Error, Result},
    helpers::{softmax_backward, softmax_in_place},
    layers::{check_backward, Context, Layer, LayerBuilder},
};
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

const NAME: &str = "softmax";

/// Softmax over consecutive groups of `group_size` elements, so a sample can
/// hold several concatenated distributions (one per timestep, say).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SoftmaxLayer {
    size: usize,
    group_size: usize,

    #[serde(skip)]
    outputs: Option<Batch<Vector>>,
}

impl SoftmaxLayer {
    /// Fails unless `group_size` is non-zero and divides `size`.
    pub fn new(size: usize, group_size: usize) -> Result<Self> {
        let layer = Self {
            size,
            group_size,
            outputs: None,
        };
        layer.validate()?;
        Ok(layer)
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }
}

impl Layer for SoftmaxLayer {
    fn in_size(&self) -> usize {
        self.size
    }

    fn out_size(&self) -> usize {
        self.size
    }

    fn forward(&mut self, input: &Batch<Vector>, _ctx: &mut Context) -> Result<Batch<Vector>> {
        input.check_width(self.size, NAME)?;
        let group = self.group_size;
        let out = input.par_map(|_, x| {
            let mut y = x.clone();
            y.chunks_mut(group).for_each(softmax_in_place);
            y
        });
        self.outputs = Some(out.clone());
        Ok(out)
    }

    fn backward(&mut self, deltas: &Batch<Vector>) -> Result<Batch<Vector>> {
        check_backward(deltas, self.outputs.as_ref().map(Batch::len), self.size, NAME)?;
        let outputs = self.outputs.as_ref().ok_or(Error::NotReady { layer: NAME })?;
        let group = self.group_size;
        Ok(deltas.par_map(|s, delta| {
            let mut dx = vec![0.; delta.len()];
            for ((y, d), dx) in outputs[s]
                .chunks(group)
                .zip(delta.chunks(group))
                .zip(dx.chunks_mut(group))
            {
                softmax_backward(y, d, dx);
            }
            dx
        }))
    }

    fn validate(&self) -> Result<()> {
        if self.group_size == 0 || self.size % self.group_size != 0 {
            return Err(Error::config(format!(
                "softmax group size {} does not divide width {}",
                self.group_size, self.size
            )));
        }
        Ok(())
    }
}

/// Defaults to a single group spanning the whole input.
#[derive(Default)]
pub struct SoftmaxBuilder {
    group_size: Option<usize>,
}

impl SoftmaxBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grouped(group_size: usize) -> Self {
        Self {
            group_size: Some(group_size),
        }
    }
}

impl LayerBuilder for SoftmaxBuilder {
    type Output = SoftmaxLayer;

    fn connect(self, in_size: usize, _rng: &mut SmallRng) -> Result<Self::Output> {
        SoftmaxLayer::new(in_size, self.group_size.unwrap_or(in_size))
    }
}
