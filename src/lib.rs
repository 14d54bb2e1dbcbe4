//! A layer-chain neural network: batched forward/backward through a chain of
//! layers, per-parameter optimizers, and a mini-batch training loop.

pub mod a_funcs;
pub mod batch;
pub mod error;
pub mod helpers;
pub mod initializer;
pub mod layers;
pub mod loss;
pub mod network;
pub mod optimizer;
pub mod trainer;

pub use batch::{Batch, Vector};
pub use error::{Error, Result};
pub use network::{LinearBuilder, Network};
pub use trainer::{Data, TrainConfig};
