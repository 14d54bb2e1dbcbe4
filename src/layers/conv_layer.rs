use crate::{
    batch::{Batch, Vector},
    error::{Error, Result},
    initializer::{Initializer, Xavier},
    layers::{check_backward, check_param_len, Context, Layer, LayerBuilder, Params, Updatable},
};
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

const NAME: &str = "conv";

/// Input and filter geometry. Inputs are channel-major: `[channel][y][x]`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvShape {
    pub channels: usize,
    pub width: usize,
    pub height: usize,
    pub filters: usize,
    pub filter_width: usize,
    pub filter_height: usize,
    /// Non-overlapping max pool window, `(width, height)`.
    pub pool: Option<(usize, usize)>,
}

impl ConvShape {
    pub fn in_size(&self) -> usize {
        self.channels * self.width * self.height
    }

    /// Width and height of one activation map before pooling.
    pub fn map_dims(&self) -> (usize, usize) {
        (
            self.width + 1 - self.filter_width,
            self.height + 1 - self.filter_height,
        )
    }

    /// Width and height of one output map, after pooling if any.
    pub fn out_dims(&self) -> (usize, usize) {
        let (w, h) = self.map_dims();
        match self.pool {
            Some((pw, ph)) => (w / pw, h / ph),
            None => (w, h),
        }
    }

    pub fn map_size(&self) -> usize {
        let (w, h) = self.map_dims();
        self.filters * w * h
    }

    pub fn out_size(&self) -> usize {
        let (w, h) = self.out_dims();
        self.filters * w * h
    }

    fn kernel_size(&self) -> usize {
        self.channels * self.filter_width * self.filter_height
    }

    fn validate(&self) -> Result<()> {
        let dims = [
            self.channels,
            self.width,
            self.height,
            self.filters,
            self.filter_width,
            self.filter_height,
        ];
        if dims.contains(&0) {
            return Err(Error::config("convolution dimensions must be non-zero"));
        }
        if self.filter_width > self.width || self.filter_height > self.height {
            return Err(Error::config(format!(
                "filter {}x{} does not fit a {}x{} input",
                self.filter_width, self.filter_height, self.width, self.height
            )));
        }
        if let Some((pw, ph)) = self.pool {
            let (w, h) = self.map_dims();
            if pw == 0 || ph == 0 || pw > w || ph > h {
                return Err(Error::config(format!(
                    "pool {}x{} does not fit a {}x{} activation map",
                    pw, ph, w, h
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Cache {
    inputs: Batch<Vector>,
    /// Per sample, for each pooled cell, the map index that held the maximum.
    argmax: Option<Batch<Vec<usize>>>,
}

/// Valid 2D cross-correlation with one bias per filter, optionally followed by
/// max pooling.
///
/// Each filter spans every input channel. Parameters are all filter weights,
/// laid out `[filter][channel][ky][kx]`, then one bias per filter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConvLayer {
    shape: ConvShape,
    params: Params,

    #[serde(skip)]
    cache: Option<Cache>,
}

impl ConvLayer {
    pub fn new<I: Initializer>(mut init: I, rng: &mut SmallRng, shape: ConvShape) -> Result<Self> {
        shape.validate()?;
        let weights = shape.filters * shape.kernel_size();
        let mut values = vec![0.; weights + shape.filters];
        init.fill(rng, shape.kernel_size(), shape.filters, &mut values[..weights]);
        Ok(Self {
            shape,
            params: Params::new(values),
            cache: None,
        })
    }

    pub fn shape(&self) -> &ConvShape {
        &self.shape
    }

    #[inline]
    pub fn weight_index(&self, filter: usize, channel: usize, ky: usize, kx: usize) -> usize {
        let s = &self.shape;
        ((filter * s.channels + channel) * s.filter_height + ky) * s.filter_width + kx
    }

    #[inline]
    pub fn bias_index(&self, filter: usize) -> usize {
        self.shape.filters * self.shape.kernel_size() + filter
    }

    #[inline]
    fn input_index(&self, channel: usize, y: usize, x: usize) -> usize {
        (channel * self.shape.height + y) * self.shape.width + x
    }

    #[inline]
    fn map_index(&self, filter: usize, y: usize, x: usize) -> usize {
        let (w, h) = self.shape.map_dims();
        (filter * h + y) * w + x
    }

    fn correlate(&self, input: &[f64]) -> Vector {
        let s = &self.shape;
        let (mw, mh) = s.map_dims();
        let w = self.params.values();
        let mut map = vec![0.; s.map_size()];
        for f in 0..s.filters {
            let bias = w[self.bias_index(f)];
            for oy in 0..mh {
                for ox in 0..mw {
                    let mut acc = bias;
                    for c in 0..s.channels {
                        for ky in 0..s.filter_height {
                            for kx in 0..s.filter_width {
                                acc += w[self.weight_index(f, c, ky, kx)]
                                    * input[self.input_index(c, oy + ky, ox + kx)];
                            }
                        }
                    }
                    map[self.map_index(f, oy, ox)] = acc;
                }
            }
        }
        map
    }

    /// Max over each pool window; ties go to the first cell in scan order.
    fn pool(&self, map: &[f64], pw: usize, ph: usize) -> (Vector, Vec<usize>) {
        let (ow, oh) = self.shape.out_dims();
        let mut out = Vec::with_capacity(self.shape.out_size());
        let mut argmax = Vec::with_capacity(self.shape.out_size());
        for f in 0..self.shape.filters {
            for py in 0..oh {
                for px in 0..ow {
                    let mut best = self.map_index(f, py * ph, px * pw);
                    for y in 0..ph {
                        for x in 0..pw {
                            let idx = self.map_index(f, py * ph + y, px * pw + x);
                            if map[idx] > map[best] {
                                best = idx;
                            }
                        }
                    }
                    out.push(map[best]);
                    argmax.push(best);
                }
            }
        }
        (out, argmax)
    }

    /// Returns `(d_input, d_params)` for one sample given the gradient on the
    /// activation map.
    fn backprop(&self, input: &[f64], d_map: &[f64]) -> (Vector, Vector) {
        let s = &self.shape;
        let (mw, mh) = s.map_dims();
        let w = self.params.values();
        let mut d_input = vec![0.; s.in_size()];
        let mut grads = vec![0.; self.params.len()];
        for f in 0..s.filters {
            for oy in 0..mh {
                for ox in 0..mw {
                    let d = d_map[self.map_index(f, oy, ox)];
                    if d == 0. {
                        continue;
                    }
                    grads[self.bias_index(f)] += d;
                    for c in 0..s.channels {
                        for ky in 0..s.filter_height {
                            for kx in 0..s.filter_width {
                                let wi = self.weight_index(f, c, ky, kx);
                                let ii = self.input_index(c, oy + ky, ox + kx);
                                grads[wi] += d * input[ii];
                                d_input[ii] += d * w[wi];
                            }
                        }
                    }
                }
            }
        }
        (d_input, grads)
    }
}

impl Layer for ConvLayer {
    fn in_size(&self) -> usize {
        self.shape.in_size()
    }

    fn out_size(&self) -> usize {
        self.shape.out_size()
    }

    fn forward(&mut self, input: &Batch<Vector>, _ctx: &mut Context) -> Result<Batch<Vector>> {
        input.check_width(self.in_size(), NAME)?;
        let (out, argmax) = match self.shape.pool {
            None => (input.par_map(|_, x| self.correlate(x)), None),
            Some((pw, ph)) => {
                let (out, argmax) = input
                    .par_map(|_, x| self.pool(&self.correlate(x), pw, ph))
                    .unzip();
                (out, Some(argmax))
            }
        };
        self.cache = Some(Cache {
            inputs: input.clone(),
            argmax,
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
        let this = &*self;

        let results = deltas.par_map(|s, delta| match &cache.argmax {
            Some(argmax) => {
                let mut d_map = vec![0.; this.shape.map_size()];
                for (src, d) in argmax[s].iter().zip(delta) {
                    d_map[*src] += d;
                }
                this.backprop(&cache.inputs[s], &d_map)
            }
            None => this.backprop(&cache.inputs[s], delta),
        });

        let (d_inputs, grads) = results.unzip();
        self.params.set_grads(&grads);
        Ok(d_inputs)
    }

    fn validate(&self) -> Result<()> {
        self.shape.validate()?;
        let s = &self.shape;
        check_param_len(&self.params, s.filters * s.kernel_size() + s.filters, NAME)
    }
}

impl Updatable for ConvLayer {
    fn param_count(&self) -> usize {
        self.params.len()
    }

    fn visit(&mut self, func: &mut dyn FnMut(&mut [f64], &mut [f64])) {
        self.params.visit(func)
    }
}

/// Builds a [`ConvLayer`]. The input geometry must multiply out to the width
/// of the previous layer.
pub struct ConvBuilder<I = Xavier> {
    init: I,
    channels: usize,
    width: usize,
    height: usize,
    filters: Option<(usize, usize, usize)>,
    pool: Option<(usize, usize)>,
}

impl ConvBuilder<Xavier> {
    pub fn new(channels: usize, width: usize, height: usize) -> Self {
        Self::with_init(Xavier, channels, width, height)
    }
}

impl<I> ConvBuilder<I> {
    pub fn with_init(init: I, channels: usize, width: usize, height: usize) -> Self {
        Self {
            init,
            channels,
            width,
            height,
            filters: None,
            pool: None,
        }
    }

    pub fn filters(mut self, count: usize, width: usize, height: usize) -> Self {
        self.filters = Some((count, width, height));
        self
    }

    pub fn pool(mut self, width: usize, height: usize) -> Self {
        self.pool = Some((width, height));
        self
    }
}

impl<I: Initializer> LayerBuilder for ConvBuilder<I> {
    type Output = ConvLayer;

    fn connect(self, in_size: usize, rng: &mut SmallRng) -> Result<Self::Output> {
        let (filters, filter_width, filter_height) =
            self.filters.ok_or(Error::MissingField("filters"))?;
        let shape = ConvShape {
            channels: self.channels,
            width: self.width,
            height: self.height,
            filters,
            filter_width,
            filter_height,
            pool: self.pool,
        };
        if shape.in_size() != in_size {
            return Err(Error::config(format!(
                "convolution input {}x{}x{} does not match width {}",
                shape.channels, shape.width, shape.height, in_size
            )));
        }
        let layer = ConvLayer::new(self.init, rng, shape)?;
        debug!(?shape, out_size = shape.out_size(), "connected convolution");
        Ok(layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        initializer::WeightInit,
        layers::tests::{check, check_input_grads, check_param_grads, check_shapes, random_batch},
    };
    use rand::SeedableRng;

    fn shape(pool: Option<(usize, usize)>) -> ConvShape {
        ConvShape {
            channels: 2,
            width: 5,
            height: 4,
            filters: 3,
            filter_width: 2,
            filter_height: 3,
            pool,
        }
    }

    #[test]
    fn correlation_without_flip() {
        let mut rng = SmallRng::seed_from_u64(0);
        let shape = ConvShape {
            channels: 1,
            width: 3,
            height: 3,
            filters: 1,
            filter_width: 2,
            filter_height: 2,
            pool: None,
        };
        let mut layer =
            ConvLayer::new(WeightInit::new(vec![1., 2., 3., 4.]), &mut rng, shape).unwrap();
        let input = Batch::new(vec![(1..=9).map(|x| x as f64).collect::<Vector>()]);
        let out = layer.forward(&input, &mut Context::inference()).unwrap();
        // top left window is [1 2; 4 5]
        check(&[37., 47., 67., 77.], &out[0], 1e-12, "correlation");
    }

    #[test]
    fn finite_differences() {
        let mut rng = SmallRng::seed_from_u64(21);
        for pool in [None, Some((2, 1))] {
            let mut layer = ConvLayer::new(Xavier, &mut rng, shape(pool)).unwrap();
            let input = random_batch(&mut rng, 3, 40);
            check_shapes(&mut layer, &input);
            check_param_grads(&mut layer, &input, 1, 1e-6);
            check_input_grads(&mut layer, &input, 2, 1e-6);
        }
    }

    fn pooling_layer() -> ConvLayer {
        let mut rng = SmallRng::seed_from_u64(0);
        let shape = ConvShape {
            channels: 1,
            width: 4,
            height: 4,
            filters: 1,
            filter_width: 1,
            filter_height: 1,
            pool: Some((2, 2)),
        };
        ConvLayer::new(WeightInit::new(vec![1.]), &mut rng, shape).unwrap()
    }

    #[rustfmt::skip]
    const POOL_INPUT: [f64; 16] = [
        1., 5., 0., 0.,
        2., 3., 0., 9.,
        4., 4., 1., 1.,
        0., 0., 1., 2.,
    ];

    fn run(layer: &mut ConvLayer, input: Vector) -> (Vector, Vector) {
        let out = layer
            .forward(&Batch::new(vec![input]), &mut Context::inference())
            .unwrap();
        let dx = layer.backward(&Batch::new(vec![vec![1.; 4]])).unwrap();
        (out[0].clone(), dx[0].clone())
    }

    #[test]
    fn pooling_routes_to_the_max() {
        let mut layer = pooling_layer();
        let (out, dx) = run(&mut layer, POOL_INPUT.to_vec());
        check(&[5., 9., 4., 2.], &out, 1e-12, "pooled output");
        // the tie in the third window goes to the first cell scanned
        let mut expected = [0.; 16];
        for idx in [1, 7, 8, 15] {
            expected[idx] = 1.;
        }
        check(&expected, &dx, 1e-12, "routed gradient");

        let mut nudged = POOL_INPUT.to_vec();
        nudged[4] += 0.5;
        let (out2, dx2) = run(&mut layer, nudged);
        assert_eq!(out, out2);
        assert_eq!(dx, dx2);
        assert_eq!(dx2[4], 0.);

        let mut raised = POOL_INPUT.to_vec();
        raised[1] += 0.5;
        let (out3, _) = run(&mut layer, raised);
        assert_ne!(out, out3);

        let mut overtaken = POOL_INPUT.to_vec();
        overtaken[0] = 6.;
        let (out4, dx4) = run(&mut layer, overtaken);
        assert_ne!(out, out4);
        assert_ne!(dx, dx4);
    }

    #[test]
    fn builder_validates_geometry() {
        let mut rng = SmallRng::seed_from_u64(0);
        let missing = ConvBuilder::new(1, 4, 4).connect(16, &mut rng);
        assert_eq!(missing.unwrap_err(), Error::MissingField("filters"));

        let wrong_width = ConvBuilder::new(1, 4, 4).filters(1, 2, 2).connect(15, &mut rng);
        assert!(matches!(wrong_width, Err(Error::Config(_))));

        let too_big = ConvBuilder::new(1, 4, 4).filters(1, 5, 2).connect(16, &mut rng);
        assert!(matches!(too_big, Err(Error::Config(_))));

        let layer = ConvBuilder::new(1, 4, 4)
            .filters(2, 3, 3)
            .pool(2, 2)
            .connect(16, &mut rng)
            .unwrap();
        assert_eq!(layer.out_size(), 2);
    }
}
