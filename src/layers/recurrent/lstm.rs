use super::{Cell, Layout, State, Step};
use crate::helpers::sigmoid;

const FORGET: usize = 0;
const CANDIDATE: usize = 1;
const INPUT: usize = 2;
const OUTPUT: usize = 3;

/// Long short-term memory cell. Gate blocks are ordered forget, candidate,
/// input, output.
///
/// ```text
/// f, i, o = sigmoid(..)    g = tanh(..)
/// c' = f * c + i * g
/// h' = o * tanh(c')
/// ```
pub struct Lstm;

impl Cell for Lstm {
    const GATES: usize = 4;

    fn step(layout: &Layout, params: &[f64], x: &[f64], prev: &State, gates: &mut [f64]) -> State {
        let n = layout.hidden;
        layout.project(params, x, &prev.h, 0..4, gates);
        for (block, chunk) in gates.chunks_mut(n).enumerate() {
            if block == CANDIDATE {
                chunk.iter_mut().for_each(|a| *a = a.tanh());
            } else {
                chunk.iter_mut().for_each(|a| *a = sigmoid(*a));
            }
        }

        let mut next = State::zeros(n, true);
        for k in 0..n {
            let f = gates[FORGET * n + k];
            let g = gates[CANDIDATE * n + k];
            let i = gates[INPUT * n + k];
            let o = gates[OUTPUT * n + k];
            next.c[k] = f * prev.c[k] + i * g;
            next.h[k] = o * next.c[k].tanh();
        }
        next
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
        let mut da = vec![0.; 4 * n];
        let mut d_prev = State::zeros(n, true);

        for k in 0..n {
            let f = gates[FORGET * n + k];
            let g = gates[CANDIDATE * n + k];
            let i = gates[INPUT * n + k];
            let o = gates[OUTPUT * n + k];
            let tc = step.next.c[k].tanh();

            let dh = d_next.h[k];
            let dc = d_next.c[k] + dh * o * (1. - tc * tc);

            da[FORGET * n + k] = dc * step.prev.c[k] * f * (1. - f);
            da[CANDIDATE * n + k] = dc * i * (1. - g * g);
            da[INPUT * n + k] = dc * g * i * (1. - i);
            da[OUTPUT * n + k] = dh * tc * o * (1. - o);
            d_prev.c[k] = dc * f;
        }

        layout.backprop(
            params,
            grads,
            step.x,
            &step.prev.h,
            0..4,
            &da,
            dx,
            &mut d_prev.h,
        );
        d_prev
    }
}
