use super::{Cell, Layout, State, Step};
use crate::helpers::sigmoid;

const UPDATE: usize = 0;
const RESET: usize = 1;
const CANDIDATE: usize = 2;

/// Gated recurrent unit, gate blocks ordered update, reset, candidate.
/// The reset gate is applied to the hidden state before the candidate's
/// hidden projection.
pub struct Gru;

impl Cell for Gru {
    const GATES: usize = 3;

    fn step(layout: &Layout, params: &[f64], x: &[f64], prev: &State, gates: &mut [f64]) -> State {
        let n = layout.hidden;
        let (zr, cand) = gates.split_at_mut(CANDIDATE * n);
        layout.project(params, x, &prev.h, UPDATE..CANDIDATE, zr);
        zr.iter_mut().for_each(|a| *a = sigmoid(*a));

        let reset_h: Vec<f64> = zr[RESET * n..]
            .iter()
            .zip(&prev.h)
            .map(|(r, h)| r * h)
            .collect();
        layout.project(params, x, &reset_h, CANDIDATE..CANDIDATE + 1, cand);
        cand.iter_mut().for_each(|a| *a = a.tanh());

        let h = (0..n)
            .map(|k| {
                let z = zr[UPDATE * n + k];
                (1. - z) * cand[k] + z * prev.h[k]
            })
            .collect();
        State { h, c: Vec::new() }
    }

    fn step_back(
        layout: &Layout,
        params: &[f64],
        step: &Step,
        d_next: &State,
        grads: &mut [f64],
        dx: &mut [f64],
    ) -> State {
        let n = layout.hidden;
        let gates = step.gates;
        let h_prev = &step.prev.h;
        let mut dh = vec![0.; n];

        // candidate path
        let mut d_cand = vec![0.; n];
        let mut d_zr = vec![0.; 2 * n];
        for k in 0..n {
            let z = gates[UPDATE * n + k];
            let c = gates[CANDIDATE * n + k];
            let d = d_next.h[k];
            d_cand[k] = d * (1. - z) * (1. - c * c);
            d_zr[UPDATE * n + k] = d * (h_prev[k] - c) * z * (1. - z);
            dh[k] = d * z;
        }

        let reset_h: Vec<f64> = (0..n).map(|k| gates[RESET * n + k] * h_prev[k]).collect();
        let mut d_reset_h = vec![0.; n];
        layout.backprop(
            params,
            grads,
            step.x,
            &reset_h,
            CANDIDATE..CANDIDATE + 1,
            &d_cand,
            dx,
            &mut d_reset_h,
        );
        for k in 0..n {
            let r = gates[RESET * n + k];
            d_zr[RESET * n + k] = d_reset_h[k] * h_prev[k] * r * (1. - r);
            dh[k] += d_reset_h[k] * r;
        }

        layout.backprop(
            params,
            grads,
            step.x,
            h_prev,
            UPDATE..CANDIDATE,
            &d_zr,
            dx,
            &mut dh,
        );
        State { h: dh, c: Vec::new() }
    }
}
