use rand::Rng;

/// Draws indices without replacement using a partial Fisher-Yates shuffle.
/// Each call to [`take`](Self::take) moves the chosen indices to the front of
/// the not-yet-drawn region, so an epoch visits every index exactly once.
#[derive(Debug, Clone)]
pub struct Sampler {
    idxs: Box<[usize]>,
    drawn: usize,
}

impl Sampler {
    pub fn new(size: usize) -> Self {
        Sampler {
            idxs: (0..size).collect(),
            drawn: 0,
        }
    }

    /// Start a new epoch.
    pub fn reset(&mut self) {
        self.drawn = 0;
    }

    pub fn remaining(&self) -> usize {
        self.idxs.len() - self.drawn
    }

    /// Draw up to `n` indices not yet seen this epoch.
    pub fn take<R: Rng + ?Sized>(&mut self, n: usize, rng: &mut R) -> &[usize] {
        let start = self.drawn;
        let end = (start + n).min(self.idxs.len());
        for i in start..end {
            let j = rng.gen_range(i..self.idxs.len());
            self.idxs.swap(i, j);
        }
        self.drawn = end;
        &self.idxs[start..end]
    }
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `y += a * x`
pub fn axpy(a: f64, x: &[f64], y: &mut [f64]) {
    for (y, x) in y.iter_mut().zip(x) {
        *y += a * *x;
    }
}

pub fn sigmoid(x: f64) -> f64 {
    1. / (1. + (-x).exp())
}

/// Max-shifted softmax over the whole slice.
pub fn softmax_in_place(values: &mut [f64]) {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in values.iter_mut() {
        *v /= sum;
    }
}

/// Softmax Jacobian-vector product: `dx_k = y_k * (delta_k - sum_j y_j * delta_j)`.
pub fn softmax_backward(out: &[f64], delta: &[f64], dx: &mut [f64]) {
    let weighted = dot(out, delta);
    for ((dx, y), d) in dx.iter_mut().zip(out).zip(delta) {
        *dx = y * (d - weighted);
    }
}

/// L2 norm over several slices as if they were concatenated.
pub fn global_norm<'a, I: IntoIterator<Item = &'a [f64]>>(slices: I) -> f64 {
    slices
        .into_iter()
        .flat_map(|s| s.iter())
        .map(|x| x * x)
        .sum::<f64>()
        .sqrt()
}
