pub use adadelta::{AdaDelta, AdaDeltaBuilder};
pub mod adadelta;

pub use adagrad::{AdaGrad, AdaGradBuilder};
pub mod adagrad;

pub use adam::{Adam, AdamBuilder};
pub mod adam;

pub use gradient_descent::{GradDescBuilder, GradientDescent};
pub mod gradient_descent;

pub use momentum::{Momentum, MomentumBuilder, Nesterov};
pub mod momentum;

pub use rmsprop::{RmsProp, RmsPropBuilder};
pub mod rmsprop;

/// A per-parameter update rule.
///
/// The network hands every trainable parameter to the optimizer under a
/// stable global index, in the same order on every update, so state kept per
/// index follows the same weight for the whole life of the optimizer.
pub trait Optimizer {
    /// Returns the new value of the weight at `index` given its gradient.
    fn optimize(&mut self, index: usize, weight: f64, gradient: f64) -> f64;
}

impl<O: Optimizer + ?Sized> Optimizer for &mut O {
    fn optimize(&mut self, index: usize, weight: f64, gradient: f64) -> f64 {
        (**self).optimize(index, weight, gradient)
    }
}

impl<O: Optimizer + ?Sized> Optimizer for Box<O> {
    fn optimize(&mut self, index: usize, weight: f64, gradient: f64) -> f64 {
        (**self).optimize(index, weight, gradient)
    }
}

/// Optimizer state indexed by parameter, grown on first use.
#[derive(Clone, Debug, Default)]
pub(crate) struct Slots<T> {
    items: Vec<T>,
}

impl<T: Default + Clone> Slots<T> {
    pub fn get_mut(&mut self, index: usize) -> &mut T {
        if index >= self.items.len() {
            self.items.resize(index + 1, T::default());
        }
        &mut self.items[index]
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}
