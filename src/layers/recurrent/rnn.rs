use super::{Cell, Layout, State, Step};

/// Plain Elman cell: `h' = tanh(Wx x + Wh h + b)`.
pub struct Rnn;

impl Cell for Rnn {
    const GATES: usize = 1;

    fn step(layout: &Layout, params: &[f64], x: &[f64], prev: &State, gates: &mut [f64]) -> State {
        layout.project(params, x, &prev.h, 0..1, gates);
        gates.iter_mut().for_each(|a| *a = a.tanh());
        State {
            h: gates.to_vec(),
            c: Vec::new(),
        }
    }

    fn step_back(
        layout: &Layout,
        params: &[f64],
        step: &Step,
        d_next: &State,
        grads: &mut [f64],
        dx: &mut [f64],
    ) -> State {
        let da: Vec<f64> = d_next
            .h
            .iter()
            .zip(&step.next.h)
            .map(|(d, h)| d * (1. - h * h))
            .collect();
        let mut dh = vec![0.; layout.hidden];
        layout.backprop(params, grads, step.x, &step.prev.h, 0..1, &da, dx, &mut dh);
        State {
            h: dh,
            c: Vec::new(),
        }
    }
}
