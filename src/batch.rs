use crate::error::{Error, Result};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use std::ops::{Index, IndexMut};

/// One sample's worth of numbers.
pub type Vector = Vec<f64>;

/// An ordered, fixed-size collection with one entry per sample.
///
/// Layers consume and produce batches of [`Vector`]s, and gradient buffers are
/// batches too before they get reduced. The size is decided at construction
/// and never changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Batch<T> {
    items: Box<[T]>,
}

impl<T> Batch<T> {
    pub fn new<I: IntoIterator<Item = T>>(items: I) -> Self {
        items.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.items.get(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items.into_vec()
    }
}

impl<T: Sync> Batch<T> {
    /// Runs `func` for every sample on the worker pool.
    /// Each task writes only its own slot, so the result is in sample order
    /// regardless of which task finishes first.
    pub fn par_map<U, F>(&self, func: F) -> Batch<U>
    where
        U: Send,
        F: Fn(usize, &T) -> U + Sync + Send,
    {
        let out: Vec<U> = self
            .items
            .par_iter()
            .enumerate()
            .map(|(idx, item)| func(idx, item))
            .collect();
        out.into()
    }
}

impl<A, B> Batch<(A, B)> {
    pub fn unzip(self) -> (Batch<A>, Batch<B>) {
        let (a, b): (Vec<A>, Vec<B>) = self.into_vec().into_iter().unzip();
        (a.into(), b.into())
    }
}

impl Batch<Vector> {
    /// A batch of `len` zero vectors of the given width.
    pub fn zeroed(len: usize, width: usize) -> Self {
        (0..len).map(|_| vec![0.; width]).collect()
    }

    /// Fails unless every sample has exactly `expected` elements.
    pub fn check_width(&self, expected: usize, layer: &'static str) -> Result<()> {
        match self.items.iter().find(|v| v.len() != expected) {
            Some(v) => Err(Error::Width {
                layer,
                expected,
                found: v.len(),
            }),
            None => Ok(()),
        }
    }

    /// Elementwise mean over the samples. Summed in index order.
    pub fn mean_of(&self, width: usize) -> Vector {
        let mut acc = vec![0.; width];
        for v in self.items.iter() {
            for (a, x) in acc.iter_mut().zip(v) {
                *a += *x;
            }
        }
        if !self.items.is_empty() {
            let recip = 1. / self.items.len() as f64;
            acc.iter_mut().for_each(|a| *a *= recip);
        }
        acc
    }

    /// Elementwise sum of two batches of equal shape.
    pub fn add(&self, other: &Batch<Vector>) -> Batch<Vector> {
        self.items
            .iter()
            .zip(other.items.iter())
            .map(|(a, b)| a.iter().zip(b).map(|(x, y)| x + y).collect())
            .collect()
    }
}

impl<T> From<Vec<T>> for Batch<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            items: items.into_boxed_slice(),
        }
    }
}

impl<T> FromIterator<T> for Batch<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        iter.into_iter().collect::<Vec<_>>().into()
    }
}

impl<T> Index<usize> for Batch<T> {
    type Output = T;

    fn index(&self, idx: usize) -> &T {
        &self.items[idx]
    }
}

impl<T> IndexMut<usize> for Batch<T> {
    fn index_mut(&mut self, idx: usize) -> &mut T {
        &mut self.items[idx]
    }
}

impl<'a, T> IntoIterator for &'a Batch<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T> IntoIterator for Batch<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.into_vec().into_iter()
    }
}
