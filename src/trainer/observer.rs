use crate::network::Network;

use tracing::info;

/// Notified after every training epoch, once the aggregate loss has been
/// recomputed. Read it through [`Network::loss`].
pub trait Observer {
    fn stepped(&mut self, epoch: usize, network: &Network);
}

impl<F: FnMut(usize, &Network)> Observer for F {
    fn stepped(&mut self, epoch: usize, network: &Network) {
        self(epoch, network)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl Observer for Silent {
    fn stepped(&mut self, _epoch: usize, _network: &Network) {}
}

/// Reports the loss through `tracing` at `info` level every `every` epochs.
#[derive(Debug, Clone, Copy)]
pub struct TracingObserver {
    every: usize,
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self { every: 1 }
    }
}

impl TracingObserver {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn every(mut self, epochs: usize) -> Self {
        self.every = epochs.max(1);
        self
    }
}

impl Observer for TracingObserver {
    fn stepped(&mut self, epoch: usize, network: &Network) {
        if (epoch + 1) % self.every == 0 {
            info!(epoch, loss = network.loss(), "training");
        }
    }
}
