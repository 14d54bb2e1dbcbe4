use crate::{
    batch::{Batch, Vector},
    error::{Error, Result},
    initializer::{Initializer, Xavier},
    layers::{check_backward, check_param_len, Context, Layer, LayerBuilder, Params, Updatable},
};
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

const NAME: &str = "dense";

/// Your run of the mill fully connected (dense) layer.
///
/// Parameters are stored as `in_size * out_size` weights in input-major order
/// followed by `out_size` biases. Use [`weight_index`](Self::weight_index) and
/// [`bias_index`](Self::bias_index) rather than computing offsets by hand.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DenseLayer {
    in_size: usize,
    size: usize,

    params: Params,

    update_weights: bool,
    update_biases: bool,

    #[serde(skip)]
    inputs: Option<Batch<Vector>>,
}

impl DenseLayer {
    pub fn new<I: Initializer>(
        mut init: I,
        rng: &mut SmallRng,
        in_size: usize,
        size: usize,
        update_w: bool,
        update_b: bool,
    ) -> Self {
        let mut values = vec![0.; in_size * size + size];
        init.fill(rng, in_size, size, &mut values[..in_size * size]);
        Self {
            in_size,
            size,
            params: Params::new(values),
            update_weights: update_w,
            update_biases: update_b,
            inputs: None,
        }
    }

    /// Offset of the weight connecting input `input` to output `output`.
    #[inline]
    pub fn weight_index(&self, input: usize, output: usize) -> usize {
        self.size * input + output
    }

    #[inline]
    pub fn bias_index(&self, output: usize) -> usize {
        self.in_size * self.size + output
    }

    pub fn weights(&self) -> &[f64] {
        &self.params.values()[..self.in_size * self.size]
    }

    pub fn biases(&self) -> &[f64] {
        &self.params.values()[self.in_size * self.size..]
    }

    fn eval(&self, input: &[f64]) -> Vector {
        let params = self.params.values();
        let mut out = self.biases().to_vec();
        for (j, x) in input.iter().enumerate() {
            let row = &params[self.weight_index(j, 0)..self.weight_index(j, self.size)];
            for (o, w) in out.iter_mut().zip(row) {
                *o += x * w;
            }
        }
        out
    }
}

impl Layer for DenseLayer {
    fn in_size(&self) -> usize {
        self.in_size
    }

    fn out_size(&self) -> usize {
        self.size
    }

    fn forward(&mut self, input: &Batch<Vector>, _ctx: &mut Context) -> Result<Batch<Vector>> {
        input.check_width(self.in_size, NAME)?;
        let out = input.par_map(|_, x| self.eval(x));
        self.inputs = Some(input.clone());
        Ok(out)
    }

    fn backward(&mut self, deltas: &Batch<Vector>) -> Result<Batch<Vector>> {
        check_backward(
            deltas,
            self.inputs.as_ref().map(Batch::len),
            self.size,
            NAME,
        )?;
        let inputs = self.inputs.as_ref().ok_or(Error::NotReady { layer: NAME })?;
        let this = &*self;
        let params = this.params.values();

        let results = deltas.par_map(|s, delta| {
            let input = &inputs[s];
            let mut d_input = vec![0.; this.in_size];
            let mut grads = vec![0.; params.len()];
            for (j, x) in input.iter().enumerate() {
                let base = this.weight_index(j, 0);
                let row = &params[base..base + this.size];
                d_input[j] = crate::helpers::dot(row, delta);
                if this.update_weights {
                    for (i, d) in delta.iter().enumerate() {
                        grads[base + i] = d * x;
                    }
                }
            }
            if this.update_biases {
                let base = this.bias_index(0);
                grads[base..].copy_from_slice(delta);
            }
            (d_input, grads)
        });

        let (d_inputs, grads) = results.unzip();
        self.params.set_grads(&grads);
        Ok(d_inputs)
    }

    fn validate(&self) -> Result<()> {
        if self.in_size == 0 || self.size == 0 {
            return Err(Error::config("dense layer needs non-zero widths"));
        }
        check_param_len(&self.params, self.in_size * self.size + self.size, NAME)
    }
}

/// Only the trainable blocks are exposed, so frozen weights or biases are
/// never seen by weight decay, clipping or the optimizer.
impl Updatable for DenseLayer {
    fn param_count(&self) -> usize {
        let mut count = 0;
        if self.update_weights {
            count += self.in_size * self.size;
        }
        if self.update_biases {
            count += self.size;
        }
        count
    }

    fn visit(&mut self, func: &mut dyn FnMut(&mut [f64], &mut [f64])) {
        let split = self.bias_index(0);
        let (update_w, update_b) = (self.update_weights, self.update_biases);
        self.params.visit(&mut |values, grads| {
            let (weights, biases) = values.split_at_mut(split);
            let (d_weights, d_biases) = grads.split_at_mut(split);
            if update_w {
                func(weights, d_weights);
            }
            if update_b {
                func(biases, d_biases);
            }
        });
    }
}

pub struct DenseBuilder<I = Xavier> {
    init: I,
    size: usize,
    update_w: bool,
    update_b: bool,
}

impl DenseBuilder<Xavier> {
    pub fn new(size: usize) -> Self {
        Self::with_init(Xavier, size)
    }
}

impl<I> DenseBuilder<I> {
    pub fn with_init(init: I, size: usize) -> Self {
        DenseBuilder {
            init,
            size,
            update_w: true,
            update_b: true,
        }
    }

    /// Freeze the weights and/or biases. Frozen parameters are left out of
    /// [`Updatable::visit`] and never change during training.
    pub fn trainable(mut self, weights: bool, biases: bool) -> Self {
        self.update_w = weights;
        self.update_b = biases;
        self
    }
}

impl<I: Initializer> LayerBuilder for DenseBuilder<I> {
    type Output = DenseLayer;

    fn connect(self, in_size: usize, rng: &mut SmallRng) -> Result<Self::Output> {
        if in_size == 0 || self.size == 0 {
            return Err(Error::config("dense layer needs non-zero widths"));
        }
        Ok(DenseLayer::new(
            self.init,
            rng,
            in_size,
            self.size,
            self.update_w,
            self.update_b,
        ))
    }
}
