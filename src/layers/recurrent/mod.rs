//! Recurrent layers unrolled over a fixed number of timesteps.
//!
//! All three cells share one parameter layout (see [`Layout`]): an
//! input-to-gates block, a hidden-to-gates block and a bias block, each
//! `gates * hidden` wide. A cell only decides how gate pre-activations turn
//! into the next state and how to differentiate that.

mod gru;
mod lstm;
mod rnn;

pub use gru::Gru;
pub use lstm::Lstm;
pub use rnn::Rnn;

use crate::{
    batch::{Batch, Vector},
    error::{Error, Result},
    helpers::{axpy, dot},
    initializer::{Initializer, Xavier},
    layers::{check_backward, check_param_len, Context, Layer, LayerBuilder, Params, Updatable},
};
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use std::ops::Range;

const NAME: &str = "recurrent";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Rnn,
    Lstm,
    Gru,
}

impl CellKind {
    pub fn gates(self) -> usize {
        match self {
            CellKind::Rnn => Rnn::GATES,
            CellKind::Lstm => Lstm::GATES,
            CellKind::Gru => Gru::GATES,
        }
    }

    fn has_cell(self) -> bool {
        matches!(self, CellKind::Lstm)
    }
}

/// Offsets into a cell's flat parameter array.
///
/// Gate column `g` is `gate * hidden + unit`. The input block is
/// `input_size` rows of gate columns, the hidden block `hidden` rows, and the
/// bias is one more row.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub input_size: usize,
    pub hidden: usize,
    pub gates: usize,
}

impl Layout {
    #[inline]
    pub fn columns(&self) -> usize {
        self.gates * self.hidden
    }

    #[inline]
    pub fn input_weight(&self, input: usize, column: usize) -> usize {
        input * self.columns() + column
    }

    #[inline]
    pub fn hidden_weight(&self, hidden: usize, column: usize) -> usize {
        (self.input_size + hidden) * self.columns() + column
    }

    #[inline]
    pub fn bias(&self, column: usize) -> usize {
        (self.input_size + self.hidden) * self.columns() + column
    }

    pub fn len(&self) -> usize {
        (self.input_size + self.hidden + 1) * self.columns()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn span(&self, gates: &Range<usize>) -> Range<usize> {
        gates.start * self.hidden..gates.end * self.hidden
    }

    /// Pre-activations of the gate blocks in `gates`, written to `out`.
    pub(crate) fn project(
        &self,
        params: &[f64],
        x: &[f64],
        h: &[f64],
        gates: Range<usize>,
        out: &mut [f64],
    ) {
        let cols = self.span(&gates);
        out.copy_from_slice(&params[self.bias(cols.start)..self.bias(cols.end)]);
        for (i, x) in x.iter().enumerate() {
            let row = self.input_weight(i, cols.start)..self.input_weight(i, cols.end);
            axpy(*x, &params[row], out);
        }
        for (j, h) in h.iter().enumerate() {
            let row = self.hidden_weight(j, cols.start)..self.hidden_weight(j, cols.end);
            axpy(*h, &params[row], out);
        }
    }

    /// Reverse of [`project`](Self::project): given the gradient `da` of the
    /// pre-activations, accumulate into the parameter, input and hidden gradients.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn backprop(
        &self,
        params: &[f64],
        grads: &mut [f64],
        x: &[f64],
        h: &[f64],
        gates: Range<usize>,
        da: &[f64],
        dx: &mut [f64],
        dh: &mut [f64],
    ) {
        let cols = self.span(&gates);
        for (i, (x, dx)) in x.iter().zip(dx.iter_mut()).enumerate() {
            let row = self.input_weight(i, cols.start)..self.input_weight(i, cols.end);
            axpy(*x, da, &mut grads[row.clone()]);
            *dx += dot(&params[row], da);
        }
        for (j, (h, dh)) in h.iter().zip(dh.iter_mut()).enumerate() {
            let row = self.hidden_weight(j, cols.start)..self.hidden_weight(j, cols.end);
            axpy(*h, da, &mut grads[row.clone()]);
            *dh += dot(&params[row], da);
        }
        axpy(1., da, &mut grads[self.bias(cols.start)..self.bias(cols.end)]);
    }
}

/// Hidden state of one sample, plus the cell state for LSTMs (empty otherwise).
/// The same shape carries gradients during backprop.
#[derive(Clone, Debug, PartialEq)]
pub struct State {
    pub h: Vector,
    pub c: Vector,
}

impl State {
    pub fn zeros(hidden: usize, with_cell: bool) -> Self {
        Self {
            h: vec![0.; hidden],
            c: if with_cell { vec![0.; hidden] } else { Vec::new() },
        }
    }
}

/// What one timestep of the forward pass saw and produced.
pub struct Step<'a> {
    pub x: &'a [f64],
    pub prev: &'a State,
    pub next: &'a State,
    /// Post-activation gate values, `gates * hidden` long.
    pub gates: &'a [f64],
}

pub trait Cell {
    const GATES: usize;

    /// Advance one timestep, writing the gate activations to `gates`.
    fn step(layout: &Layout, params: &[f64], x: &[f64], prev: &State, gates: &mut [f64]) -> State;

    /// Backprop through one timestep. `d_next` is the gradient on the state the
    /// step produced; the gradient on `step.prev` is returned. Parameter
    /// gradients accumulate into `grads` and the input gradient into `dx`.
    fn step_back(
        layout: &Layout,
        params: &[f64],
        step: &Step,
        d_next: &State,
        grads: &mut [f64],
        dx: &mut [f64],
    ) -> State;
}

#[derive(Debug, Clone)]
struct Trace {
    /// `timesteps + 1` states, the first being the initial one.
    states: Vec<State>,
    gates: Vec<Vector>,
}

/// Input/output position of processing step `t`.
#[inline]
fn position(t: usize, timesteps: usize, reversed: bool) -> usize {
    if reversed {
        timesteps - 1 - t
    } else {
        t
    }
}

fn unroll<C: Cell>(
    layout: &Layout,
    params: &[f64],
    input: &[f64],
    init: State,
    reversed: bool,
) -> (Vector, Trace) {
    let (n_in, hidden) = (layout.input_size, layout.hidden);
    let timesteps = input.len() / n_in;
    let mut out = vec![0.; timesteps * hidden];
    let mut trace = Trace {
        states: Vec::with_capacity(timesteps + 1),
        gates: Vec::with_capacity(timesteps),
    };
    trace.states.push(init);

    for t in 0..timesteps {
        let p = position(t, timesteps, reversed);
        let x = &input[p * n_in..(p + 1) * n_in];
        let mut gates = vec![0.; layout.columns()];
        let next = C::step(layout, params, x, &trace.states[t], &mut gates);
        out[p * hidden..(p + 1) * hidden].copy_from_slice(&next.h);
        trace.states.push(next);
        trace.gates.push(gates);
    }
    (out, trace)
}

/// Truncated backprop through the timesteps of one unroll. Returns the input
/// gradient and the parameter gradient summed over timesteps.
fn bptt<C: Cell>(
    layout: &Layout,
    params: &[f64],
    input: &[f64],
    trace: &Trace,
    deltas: &[f64],
    reversed: bool,
) -> (Vector, Vector) {
    let (n_in, hidden) = (layout.input_size, layout.hidden);
    let timesteps = trace.gates.len();
    let mut dx = vec![0.; input.len()];
    let mut grads = vec![0.; layout.len()];
    let mut carry = State::zeros(hidden, !trace.states[0].c.is_empty());

    for t in (0..timesteps).rev() {
        let p = position(t, timesteps, reversed);
        axpy(1., &deltas[p * hidden..(p + 1) * hidden], &mut carry.h);
        let step = Step {
            x: &input[p * n_in..(p + 1) * n_in],
            prev: &trace.states[t],
            next: &trace.states[t + 1],
            gates: &trace.gates[t],
        };
        carry = C::step_back(
            layout,
            params,
            &step,
            &carry,
            &mut grads,
            &mut dx[p * n_in..(p + 1) * n_in],
        );
    }
    (dx, grads)
}

/// Shape and behaviour of a [`RecurrentLayer`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecurrentConfig {
    pub kind: CellKind,
    pub input_size: usize,
    pub hidden: usize,
    pub timesteps: usize,
    /// Run a second cell over the reversed sequence and sum the outputs.
    pub bidirectional: bool,
    /// Carry the final state of one forward into the next.
    pub stateful: bool,
}

impl RecurrentConfig {
    fn layout(&self) -> Layout {
        Layout {
            input_size: self.input_size,
            hidden: self.hidden,
            gates: self.kind.gates(),
        }
    }
}

/// One cell's parameters and what its last forward left behind.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct Direction {
    params: Params,
    #[serde(skip)]
    carry: Option<Batch<State>>,
    #[serde(skip)]
    traces: Option<Batch<Trace>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RecurrentLayer {
    config: RecurrentConfig,
    layout: Layout,
    /// Forward cell, then the reversed one when bidirectional.
    cells: Vec<Direction>,

    #[serde(skip)]
    inputs: Option<Batch<Vector>>,
}

impl RecurrentLayer {
    pub fn new<I: Initializer>(
        mut init: I,
        rng: &mut SmallRng,
        config: RecurrentConfig,
    ) -> Result<Self> {
        if config.input_size == 0 || config.hidden == 0 || config.timesteps == 0 {
            return Err(Error::config(
                "recurrent layer needs non-zero input size, hidden size and timesteps",
            ));
        }
        let layout = config.layout();
        let directions = if config.bidirectional { 2 } else { 1 };
        let cells = (0..directions)
            .map(|_| {
                let mut values = vec![0.; layout.len()];
                let weights = layout.bias(0);
                init.fill(rng, layout.input_size + layout.hidden, layout.columns(), &mut values[..weights]);
                Direction {
                    params: Params::new(values),
                    carry: None,
                    traces: None,
                }
            })
            .collect();
        Ok(Self {
            config,
            layout,
            cells,
            inputs: None,
        })
    }

    pub fn config(&self) -> &RecurrentConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn unroll(&self, dir: usize, input: &[f64], init: State) -> (Vector, Trace) {
        let params = self.cells[dir].params.values();
        let reversed = dir == 1;
        match self.config.kind {
            CellKind::Rnn => unroll::<Rnn>(&self.layout, params, input, init, reversed),
            CellKind::Lstm => unroll::<Lstm>(&self.layout, params, input, init, reversed),
            CellKind::Gru => unroll::<Gru>(&self.layout, params, input, init, reversed),
        }
    }

    fn bptt(&self, dir: usize, input: &[f64], trace: &Trace, deltas: &[f64]) -> (Vector, Vector) {
        let params = self.cells[dir].params.values();
        let reversed = dir == 1;
        let layout = &self.layout;
        match self.config.kind {
            CellKind::Rnn => bptt::<Rnn>(layout, params, input, trace, deltas, reversed),
            CellKind::Lstm => bptt::<Lstm>(layout, params, input, trace, deltas, reversed),
            CellKind::Gru => bptt::<Gru>(layout, params, input, trace, deltas, reversed),
        }
    }

    fn initial_states(&self, dir: usize, samples: usize) -> Batch<State> {
        let zeros = || State::zeros(self.layout.hidden, self.config.kind.has_cell());
        match &self.cells[dir].carry {
            Some(carry) if self.config.stateful && carry.len() == samples => carry.clone(),
            Some(carry) if self.config.stateful => {
                debug!(
                    previous = carry.len(),
                    samples, "batch size changed, dropping recurrent state"
                );
                (0..samples).map(|_| zeros()).collect()
            }
            _ => (0..samples).map(|_| zeros()).collect(),
        }
    }
}

impl Layer for RecurrentLayer {
    fn in_size(&self) -> usize {
        self.config.timesteps * self.config.input_size
    }

    fn out_size(&self) -> usize {
        self.config.timesteps * self.config.hidden
    }

    fn forward(&mut self, input: &Batch<Vector>, _ctx: &mut Context) -> Result<Batch<Vector>> {
        input.check_width(self.in_size(), NAME)?;
        let mut total: Option<Batch<Vector>> = None;

        for dir in 0..self.cells.len() {
            let init = self.initial_states(dir, input.len());
            let (out, traces) = input
                .par_map(|s, x| self.unroll(dir, x, init[s].clone()))
                .unzip();

            let cell = &mut self.cells[dir];
            if self.config.stateful {
                cell.carry = Some(
                    traces
                        .iter()
                        .map(|t| t.states[t.states.len() - 1].clone())
                        .collect(),
                );
            }
            cell.traces = Some(traces);
            total = Some(match total {
                Some(sum) => sum.add(&out),
                None => out,
            });
        }

        self.inputs = Some(input.clone());
        Ok(total.unwrap_or_else(|| Batch::zeroed(input.len(), self.out_size())))
    }

    fn backward(&mut self, deltas: &Batch<Vector>) -> Result<Batch<Vector>> {
        check_backward(
            deltas,
            self.inputs.as_ref().map(Batch::len),
            self.out_size(),
            NAME,
        )?;
        let mut total: Option<Batch<Vector>> = None;

        for dir in 0..self.cells.len() {
            let inputs = self.inputs.as_ref().ok_or(Error::NotReady { layer: NAME })?;
            let traces = self.cells[dir]
                .traces
                .as_ref()
                .ok_or(Error::NotReady { layer: NAME })?;
            let (dx, grads) = deltas
                .par_map(|s, d| self.bptt(dir, &inputs[s], &traces[s], d))
                .unzip();

            self.cells[dir].params.set_grads(&grads);
            total = Some(match total {
                Some(sum) => sum.add(&dx),
                None => dx,
            });
        }
        Ok(total.unwrap_or_else(|| Batch::zeroed(deltas.len(), self.in_size())))
    }

    fn reset_state(&mut self) {
        for cell in &mut self.cells {
            cell.carry = None;
        }
    }

    fn validate(&self) -> Result<()> {
        let c = &self.config;
        if c.input_size == 0 || c.hidden == 0 || c.timesteps == 0 {
            return Err(Error::config(
                "recurrent layer needs non-zero input size, hidden size and timesteps",
            ));
        }
        if self.layout != c.layout() {
            return Err(Error::config(format!(
                "{}: stored layout {:?} does not match {:?}",
                NAME, self.layout, c
            )));
        }
        let directions = if c.bidirectional { 2 } else { 1 };
        if self.cells.len() != directions {
            return Err(Error::config(format!(
                "{}: expected {} directions, found {}",
                NAME,
                directions,
                self.cells.len()
            )));
        }
        self.cells
            .iter()
            .try_for_each(|cell| check_param_len(&cell.params, self.layout.len(), NAME))
    }
}

impl Updatable for RecurrentLayer {
    fn param_count(&self) -> usize {
        self.cells.iter().map(|c| c.params.len()).sum()
    }

    fn visit(&mut self, func: &mut dyn FnMut(&mut [f64], &mut [f64])) {
        for cell in &mut self.cells {
            cell.params.visit(func);
        }
    }
}

/// Builds a [`RecurrentLayer`]. The per-timestep input size is the width of
/// the previous layer divided by the number of timesteps.
pub struct RecurrentBuilder<I = Xavier> {
    init: I,
    kind: CellKind,
    hidden: usize,
    timesteps: usize,
    bidirectional: bool,
    stateful: bool,
}

impl RecurrentBuilder<Xavier> {
    pub fn new(kind: CellKind, hidden: usize, timesteps: usize) -> Self {
        Self::with_init(Xavier, kind, hidden, timesteps)
    }

    pub fn lstm(hidden: usize, timesteps: usize) -> Self {
        Self::new(CellKind::Lstm, hidden, timesteps)
    }

    pub fn gru(hidden: usize, timesteps: usize) -> Self {
        Self::new(CellKind::Gru, hidden, timesteps)
    }
}

impl<I> RecurrentBuilder<I> {
    pub fn with_init(init: I, kind: CellKind, hidden: usize, timesteps: usize) -> Self {
        Self {
            init,
            kind,
            hidden,
            timesteps,
            bidirectional: false,
            stateful: false,
        }
    }

    pub fn bidirectional(mut self) -> Self {
        self.bidirectional = true;
        self
    }

    pub fn stateful(mut self) -> Self {
        self.stateful = true;
        self
    }
}

impl<I: Initializer> LayerBuilder for RecurrentBuilder<I> {
    type Output = RecurrentLayer;

    fn connect(self, in_size: usize, rng: &mut SmallRng) -> Result<Self::Output> {
        if self.timesteps == 0 || in_size % self.timesteps != 0 {
            return Err(Error::config(format!(
                "width {} cannot be split into {} timesteps",
                in_size, self.timesteps
            )));
        }
        let config = RecurrentConfig {
            kind: self.kind,
            input_size: in_size / self.timesteps,
            hidden: self.hidden,
            timesteps: self.timesteps,
            bidirectional: self.bidirectional,
            stateful: self.stateful,
        };
        debug!(?config, "connected recurrent layer");
        RecurrentLayer::new(self.init, rng, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::tests::{check_input_grads, check_param_grads, check_shapes, random_batch};
    use rand::SeedableRng;

    fn config(kind: CellKind) -> RecurrentConfig {
        RecurrentConfig {
            kind,
            input_size: 3,
            hidden: 4,
            timesteps: 3,
            bidirectional: false,
            stateful: false,
        }
    }

    fn gradient_check(config: RecurrentConfig, seed: u64) {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut layer = RecurrentLayer::new(Xavier, &mut rng, config).unwrap();
        let input = random_batch(&mut rng, 3, layer.in_size());
        check_shapes(&mut layer, &input);
        check_param_grads(&mut layer, &input, seed + 1, 1e-6);
        check_input_grads(&mut layer, &input, seed + 2, 1e-6);
    }

    #[test]
    fn rnn_finite_differences() {
        gradient_check(config(CellKind::Rnn), 10);
    }

    #[test]
    fn lstm_finite_differences() {
        gradient_check(config(CellKind::Lstm), 20);
    }

    #[test]
    fn gru_finite_differences() {
        gradient_check(config(CellKind::Gru), 30);
    }

    #[test]
    fn bidirectional_finite_differences() {
        for kind in [CellKind::Rnn, CellKind::Lstm, CellKind::Gru] {
            let config = RecurrentConfig {
                bidirectional: true,
                ..config(kind)
            };
            gradient_check(config, 40);
        }
    }

    #[test]
    fn parameter_layout() {
        let mut rng = SmallRng::seed_from_u64(0);
        let layer = RecurrentLayer::new(Xavier, &mut rng, config(CellKind::Lstm)).unwrap();
        let layout = layer.layout();
        assert_eq!(layout.columns(), 16);
        assert_eq!(layout.hidden_weight(0, 0), 3 * 16);
        assert_eq!(layout.bias(0), 7 * 16);
        assert_eq!(layer.param_count(), 8 * 16);
        // biases start at zero
        assert!(layer.cells[0].params.values()[layout.bias(0)..]
            .iter()
            .all(|b| *b == 0.));
    }

    fn two_calls(stateful: bool) -> (Vector, Vector) {
        let mut rng = SmallRng::seed_from_u64(3);
        let config = RecurrentConfig {
            kind: CellKind::Lstm,
            input_size: 2,
            hidden: 3,
            timesteps: 2,
            bidirectional: false,
            stateful,
        };
        let mut layer = RecurrentLayer::new(Xavier, &mut rng, config).unwrap();
        let input = Batch::new(vec![vec![0.5, -1., 1., 0.25]]);
        let first = layer.forward(&input, &mut Context::inference()).unwrap();
        let second = layer.forward(&input, &mut Context::inference()).unwrap();
        (first[0].clone(), second[0].clone())
    }

    #[test]
    fn stateful_lstm_carries_state() {
        let (first, second) = two_calls(true);
        assert_ne!(first, second);
    }

    #[test]
    fn stateless_lstm_starts_fresh() {
        let (first, second) = two_calls(false);
        assert_eq!(first, second);
    }

    #[test]
    fn reset_state_forgets_carry() {
        let mut rng = SmallRng::seed_from_u64(3);
        let config = RecurrentConfig {
            stateful: true,
            ..config(CellKind::Gru)
        };
        let mut layer = RecurrentLayer::new(Xavier, &mut rng, config).unwrap();
        let input = random_batch(&mut rng, 2, layer.in_size());
        let first = layer.forward(&input, &mut Context::inference()).unwrap();
        layer.forward(&input, &mut Context::inference()).unwrap();
        layer.reset_state();
        let third = layer.forward(&input, &mut Context::inference()).unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn builder_splits_timesteps() {
        let mut rng = SmallRng::seed_from_u64(0);
        let layer = RecurrentBuilder::gru(5, 4).connect(12, &mut rng).unwrap();
        assert_eq!(layer.config().input_size, 3);
        assert_eq!(layer.out_size(), 20);
        assert!(RecurrentBuilder::lstm(5, 5).connect(12, &mut rng).is_err());
    }
}
