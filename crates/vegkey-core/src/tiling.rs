//! Tiling coordinator: exhaustive, disjoint, row-major windows over a grid.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{KeyError, Result};
use crate::grid::{GridGeometry, Window};

/// Requested window size. The last row and column of windows are clipped to
/// the grid, so any positive shape is valid for any grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockShape {
    pub rows: usize,
    pub cols: usize,
}

impl BlockShape {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub fn square(n: usize) -> Self {
        Self::new(n, n)
    }
}

impl Default for BlockShape {
    fn default() -> Self {
        Self::square(512)
    }
}

/// A restartable window sequence for one grid and block shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    width: usize,
    height: usize,
    shape: BlockShape,
    block_rows: usize,
    block_cols: usize,
}

impl Partition {
    pub fn new(grid: &GridGeometry, shape: BlockShape) -> Result<Self> {
        if shape.rows == 0 || shape.cols == 0 {
            return Err(KeyError::InvalidBlockShape { rows: shape.rows, cols: shape.cols });
        }
        Ok(Self {
            width: grid.width,
            height: grid.height,
            shape,
            block_rows: grid.height.div_ceil(shape.rows),
            block_cols: grid.width.div_ceil(shape.cols),
        })
    }

    /// Total number of windows.
    pub fn len(&self) -> usize {
        self.block_rows * self.block_cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shape(&self) -> BlockShape {
        self.shape
    }

    /// The `index`-th window in row-major order, clipped to the grid.
    pub fn get(&self, index: usize) -> Option<Window> {
        if index >= self.len() {
            return None;
        }
        let br = index / self.block_cols;
        let bc = index % self.block_cols;
        let row = br * self.shape.rows;
        let col = bc * self.shape.cols;
        Some(Window::new(
            row,
            col,
            self.shape.rows.min(self.height - row),
            self.shape.cols.min(self.width - col),
        ))
    }

    /// A fresh iterator from the first window. Each call restarts the sequence.
    pub fn iter(&self) -> Windows {
        Windows { partition: *self, next: 0 }
    }
}

impl IntoIterator for &Partition {
    type Item = Window;
    type IntoIter = Windows;

    fn into_iter(self) -> Windows {
        self.iter()
    }
}

/// Lazy row-major iterator over a [`Partition`].
#[derive(Debug, Clone)]
pub struct Windows {
    partition: Partition,
    next: usize,
}

impl Iterator for Windows {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        let w = self.partition.get(self.next)?;
        self.next += 1;
        Some(w)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.partition.len().saturating_sub(self.next);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Windows {}

/// Partition the reference grid into windows of `shape`.
pub fn partition(grid: &GridGeometry, shape: BlockShape) -> Result<Partition> {
    Partition::new(grid, shape)
}

/// Per-window completion flags, shared by all workers of one run.
#[derive(Debug)]
pub struct CompletionTracker {
    done: Vec<AtomicBool>,
    count: AtomicUsize,
}

impl CompletionTracker {
    pub fn new(total: usize) -> Self {
        Self {
            done: (0..total).map(|_| AtomicBool::new(false)).collect(),
            count: AtomicUsize::new(0),
        }
    }

    /// Mark `index` finished. Returns the number of finished windows,
    /// counting each window once.
    pub fn complete(&self, index: usize) -> usize {
        if !self.done[index].swap(true, Ordering::AcqRel) {
            self.count.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.count.load(Ordering::Acquire)
        }
    }

    pub fn is_complete(&self, index: usize) -> bool {
        self.done[index].load(Ordering::Acquire)
    }

    pub fn completed(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn total(&self) -> usize {
        self.done.len()
    }

    pub fn all_complete(&self) -> bool {
        self.completed() == self.total()
    }

    /// Indices of windows not yet finished, ascending.
    pub fn pending(&self) -> Vec<usize> {
        (0..self.total()).filter(|&i| !self.is_complete(i)).collect()
    }
}
