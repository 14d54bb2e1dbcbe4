use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardNormal;

//I used this blog post as reference to the initialization methods ->
//https://towardsdatascience.com/weight-initialization-in-neural-networks-a-journey-from-the-basics-to-kaiming-954fb9b47c79

/// Produces initial weight values. `in_size` and `size` are the fan-in and
/// fan-out of the weight being initialized. Randomness comes from the rng the
/// caller threads through, never from a hidden global.
pub trait Initializer {
    fn get(&mut self, rng: &mut SmallRng, in_size: usize, size: usize) -> f64;

    /// Fill `out` with consecutive values.
    fn fill(&mut self, rng: &mut SmallRng, in_size: usize, size: usize, out: &mut [f64]) {
        for w in out {
            *w = self.get(rng, in_size, size);
        }
    }
}

/// Xavier initialization should be used for layers with symetric activation functions such as sigmoid or tanH
#[derive(Clone, Copy, Debug, Default)]
pub struct Xavier;

impl Initializer for Xavier {
    fn get(&mut self, rng: &mut SmallRng, in_size: usize, _size: usize) -> f64 {
        rng.sample::<f64, _>(StandardNormal) / (in_size.max(1) as f64).sqrt()
    }
}

/// Kaiming initialization should be used for layers with asymetric activation functions such as RELU
#[derive(Clone, Copy, Debug, Default)]
pub struct Kaiming;

impl Initializer for Kaiming {
    fn get(&mut self, rng: &mut SmallRng, in_size: usize, _size: usize) -> f64 {
        rng.sample::<f64, _>(StandardNormal) * (2. / in_size.max(1) as f64).sqrt()
    }
}

/// Gaussian with a fixed standard deviation.
#[derive(Clone, Copy, Debug)]
pub struct Normal {
    pub std_dev: f64,
}

impl Normal {
    pub fn new(std_dev: f64) -> Self {
        Self { std_dev }
    }
}

impl Initializer for Normal {
    fn get(&mut self, rng: &mut SmallRng, _in_size: usize, _size: usize) -> f64 {
        rng.sample::<f64, _>(StandardNormal) * self.std_dev
    }
}

/// Always the same value.
#[derive(Clone, Copy, Debug)]
pub struct Constant(pub f64);

impl Initializer for Constant {
    fn get(&mut self, _: &mut SmallRng, _: usize, _: usize) -> f64 {
        self.0
    }
}

pub const ZEROS: Constant = Constant(0.);
pub const ONES: Constant = Constant(1.);

/// This initializer accepts an iterator over f64 values and uses them to initialize the weights.
/// Panics if a weight is requested but the iterator returns None.
pub struct WeightInit<T: Iterator<Item = f64>> {
    iter: T,
}

impl<I: Iterator<Item = f64>> WeightInit<I> {
    pub fn new<T: IntoIterator<Item = f64, IntoIter = I>>(weights: T) -> Self {
        Self {
            iter: weights.into_iter(),
        }
    }
}

impl<I: Iterator<Item = f64>> Initializer for WeightInit<I> {
    fn get(&mut self, _: &mut SmallRng, _in_size: usize, _size: usize) -> f64 {
        self.iter.next().expect("Ran out of weights")
    }
}

impl<T: Initializer + ?Sized> Initializer for &mut T {
    fn get(&mut self, rng: &mut SmallRng, in_size: usize, size: usize) -> f64 {
        (**self).get(rng, in_size, size)
    }
}

impl Initializer for Box<dyn Initializer> {
    fn get(&mut self, rng: &mut SmallRng, in_size: usize, size: usize) -> f64 {
        (**self).get(rng, in_size, size)
    }
}
