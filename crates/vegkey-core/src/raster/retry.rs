use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;
use crate::grid::Window;
use crate::raster::{LayerSource, RasterMeta};

/// Re-attempts transient read failures of the wrapped source.
///
/// Engine semantics are unchanged: a read either eventually returns the same
/// pixels it would have returned on the first attempt, or fails the run.
pub struct Retrying<S> {
    inner: S,
    attempts: u32,
    backoff: Duration,
}

impl<S: LayerSource> Retrying<S> {
    /// `attempts` counts the first try; values below 1 are treated as 1.
    pub fn new(inner: S, attempts: u32, backoff: Duration) -> Self {
        Self { inner, attempts: attempts.max(1), backoff }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: LayerSource> LayerSource for Retrying<S> {
    fn meta(&self) -> &RasterMeta {
        self.inner.meta()
    }

    fn read_window(&self, window: &Window) -> Result<Vec<f64>> {
        let mut attempt = 1;
        loop {
            match self.inner.read_window(window) {
                Ok(block) => return Ok(block),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    warn!(%window, attempt, error = %e, "layer read failed, retrying");
                    thread::sleep(self.backoff * attempt);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
