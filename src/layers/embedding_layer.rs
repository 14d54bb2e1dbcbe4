use crate::{
    batch::{Batch, Vector},
    error::{Error, Result},
    initializer::{Initializer, Normal},
    layers::{check_backward, check_param_len, Context, Layer, LayerBuilder, Params, Updatable},
};
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

const NAME: &str = "embedding";

/// Lookup table from integer ids to learned vectors.
///
/// Input is `seq_len` ids encoded as floats, output is the `dim`-wide rows
/// for those ids, concatenated. Row `id` lives at `id * dim`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EmbeddingLayer {
    vocab: usize,
    dim: usize,
    seq_len: usize,
    params: Params,

    #[serde(skip)]
    ids: Option<Batch<Vec<usize>>>,
}

impl EmbeddingLayer {
    pub fn new<I: Initializer>(
        mut init: I,
        rng: &mut SmallRng,
        vocab: usize,
        dim: usize,
        seq_len: usize,
    ) -> Self {
        let mut values = vec![0.; vocab * dim];
        init.fill(rng, vocab, dim, &mut values);
        Self {
            vocab,
            dim,
            seq_len,
            params: Params::new(values),
            ids: None,
        }
    }

    #[inline]
    pub fn row_index(&self, id: usize) -> usize {
        id * self.dim
    }

    pub fn row(&self, id: usize) -> &[f64] {
        let start = self.row_index(id);
        &self.params.values()[start..start + self.dim]
    }

    fn to_id(&self, raw: f64) -> Result<usize> {
        if raw < 0. || raw.fract() != 0. || raw >= self.vocab as f64 {
            return Err(Error::InvalidIndex {
                layer: NAME,
                index: raw,
                limit: self.vocab,
            });
        }
        Ok(raw as usize)
    }
}

impl Layer for EmbeddingLayer {
    fn in_size(&self) -> usize {
        self.seq_len
    }

    fn out_size(&self) -> usize {
        self.seq_len * self.dim
    }

    fn forward(&mut self, input: &Batch<Vector>, _ctx: &mut Context) -> Result<Batch<Vector>> {
        input.check_width(self.seq_len, NAME)?;
        let ids = input
            .iter()
            .map(|x| x.iter().map(|v| self.to_id(*v)).collect::<Result<Vec<_>>>())
            .collect::<Result<Batch<_>>>()?;

        let out = ids.par_map(|_, ids| {
            let mut y = Vec::with_capacity(self.out_size());
            for id in ids {
                y.extend_from_slice(self.row(*id));
            }
            y
        });
        self.ids = Some(ids);
        Ok(out)
    }

    fn backward(&mut self, deltas: &Batch<Vector>) -> Result<Batch<Vector>> {
        check_backward(deltas, self.ids.as_ref().map(Batch::len), self.out_size(), NAME)?;
        let ids = self.ids.as_ref().ok_or(Error::NotReady { layer: NAME })?;
        let this = &*self;

        let grads = deltas.par_map(|s, delta| {
            let mut g = vec![0.; this.params.len()];
            for (id, d) in ids[s].iter().zip(delta.chunks(this.dim)) {
                let start = this.row_index(*id);
                crate::helpers::axpy(1., d, &mut g[start..start + this.dim]);
            }
            g
        });
        self.params.set_grads(&grads);
        // ids are not differentiable
        Ok(Batch::zeroed(deltas.len(), self.seq_len))
    }

    fn validate(&self) -> Result<()> {
        if self.vocab == 0 || self.dim == 0 || self.seq_len == 0 {
            return Err(Error::config("embedding needs non-zero vocab, dim and length"));
        }
        check_param_len(&self.params, self.vocab * self.dim, NAME)
    }
}

impl Updatable for EmbeddingLayer {
    fn param_count(&self) -> usize {
        self.params.len()
    }

    fn visit(&mut self, func: &mut dyn FnMut(&mut [f64], &mut [f64])) {
        self.params.visit(func)
    }
}

pub struct EmbeddingBuilder<I = Normal> {
    init: I,
    vocab: usize,
    dim: usize,
    seq_len: Option<usize>,
}

impl EmbeddingBuilder<Normal> {
    pub fn new(vocab: usize, dim: usize) -> Self {
        Self::with_init(Normal::new(0.1), vocab, dim)
    }
}

impl<I> EmbeddingBuilder<I> {
    pub fn with_init(init: I, vocab: usize, dim: usize) -> Self {
        Self {
            init,
            vocab,
            dim,
            seq_len: None,
        }
    }

    /// Number of ids per sample. Defaults to the width of the previous layer.
    pub fn seq_len(mut self, seq_len: usize) -> Self {
        self.seq_len = Some(seq_len);
        self
    }
}

impl<I: Initializer> LayerBuilder for EmbeddingBuilder<I> {
    type Output = EmbeddingLayer;

    fn connect(self, in_size: usize, rng: &mut SmallRng) -> Result<Self::Output> {
        let seq_len = self.seq_len.unwrap_or(in_size);
        if seq_len != in_size {
            return Err(Error::config(format!(
                "embedding expects {} ids but the previous layer has width {}",
                seq_len, in_size
            )));
        }
        if self.vocab == 0 || self.dim == 0 || seq_len == 0 {
            return Err(Error::config("embedding needs non-zero vocab, dim and length"));
        }
        Ok(EmbeddingLayer::new(
            self.init, rng, self.vocab, self.dim, seq_len,
        ))
    }
}
