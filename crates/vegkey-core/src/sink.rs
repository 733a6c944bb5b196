//! Output sinks and progress reporting.
//!
//! Windows are disjoint, so a sink may accept writes in any order and from
//! any thread. File-backed output goes to a staging path and only appears at
//! its final path once every window has been written.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::{debug, info};

use crate::engine::{ClassificationBuffer, OutputSpec};
use crate::error::{KeyError, Result};
use crate::grid::{insert_window, GridGeometry, Window};
use crate::raster::raw::{header_path, write_all_at};
use crate::raster::{check_bounds, RasterMeta, RawHeader};

/// Destination for finished classification buffers.
pub trait OutputSink: Send + Sync {
    /// Persist `buffer` into the region of the output covered by `window`.
    fn write(&self, window: &Window, buffer: &ClassificationBuffer) -> Result<()>;

    /// Called once after every window was written.
    fn finish(&self) -> Result<()> {
        Ok(())
    }
}

// ── In-memory sink ──────────────────────────────────────────────────────────

/// Collects the whole output grid in memory.
#[derive(Debug)]
pub struct MemorySink {
    width: usize,
    height: usize,
    codes: Mutex<Vec<i32>>,
}

impl MemorySink {
    /// A grid-sized sink pre-filled with `fill`.
    pub fn new(grid: &GridGeometry, fill: i32) -> Self {
        Self {
            width: grid.width,
            height: grid.height,
            codes: Mutex::new(vec![fill; grid.cell_count()]),
        }
    }

    pub fn codes(&self) -> Vec<i32> {
        self.codes.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn into_codes(self) -> Vec<i32> {
        self.codes.into_inner().unwrap_or_default()
    }
}

impl OutputSink for MemorySink {
    fn write(&self, window: &Window, buffer: &ClassificationBuffer) -> Result<()> {
        if !window.fits(self.width, self.height) {
            return Err(KeyError::WindowOutOfBounds { window: *window, width: self.width, height: self.height });
        }
        let mut codes = self
            .codes
            .lock()
            .map_err(|_| KeyError::io("output buffer lock poisoned", std::io::Error::other("poisoned")))?;
        insert_window(&mut codes, self.width, window, buffer.codes());
        Ok(())
    }
}

// ── Streaming-format file sink ──────────────────────────────────────────────

/// Writes the streaming raster format through a `<path>.partial` staging
/// file, promoted to `path` (with its header) by [`OutputSink::finish`].
/// Windows land at their own file offsets, so concurrent writes need no lock.
#[derive(Debug)]
pub struct RawRasterSink {
    final_path: PathBuf,
    staging_path: PathBuf,
    meta: RasterMeta,
    file: File,
}

/// Staging path used while a run is in progress.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

impl RawRasterSink {
    pub fn create(path: impl AsRef<Path>, grid: &GridGeometry, output: &OutputSpec) -> Result<Self> {
        let final_path = path.as_ref().to_path_buf();
        let staging_path = staging_path(&final_path);
        let meta = RasterMeta::new(grid.clone(), output.element_type, Some(output.nodata as f64));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staging_path)
            .map_err(|e| KeyError::io(format!("cannot create {}", staging_path.display()), e))?;
        file.set_len((grid.cell_count() * output.element_type.size()) as u64)
            .map_err(|e| KeyError::io(format!("cannot size {}", staging_path.display()), e))?;

        debug!(path = %staging_path.display(), "opened staging output");
        Ok(Self { final_path, staging_path, meta, file })
    }

    pub fn path(&self) -> &Path {
        &self.final_path
    }

    pub fn staging(&self) -> &Path {
        &self.staging_path
    }
}

impl OutputSink for RawRasterSink {
    fn write(&self, window: &Window, buffer: &ClassificationBuffer) -> Result<()> {
        check_bounds(&self.meta, window)?;
        let size = self.meta.element_type.size();
        let width = self.meta.geometry.width;
        let bytes = buffer.encode(self.meta.element_type);
        let row_bytes = window.cols * size;

        for (r, row) in bytes.chunks_exact(row_bytes).enumerate() {
            let offset = ((window.row + r) * width + window.col) * size;
            write_all_at(&self.file, row, offset as u64).map_err(|e| {
                KeyError::io(format!("cannot write {window} to {}", self.staging_path.display()), e)
            })?;
        }
        Ok(())
    }

    /// Promotes the header before the data, so the final data path never
    /// pairs with a missing or stale header.
    fn finish(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| KeyError::io(format!("cannot flush {}", self.staging_path.display()), e))?;

        let final_header = header_path(&self.final_path);
        let staged_header = staging_path(&final_header);
        RawHeader::new(self.meta.clone()).write(&staged_header)?;

        match fs::remove_file(&self.final_path) {
            Ok(()) => debug!(path = %self.final_path.display(), "removed previous output"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(KeyError::io(format!("cannot replace {}", self.final_path.display()), e)),
        }
        promote(&staged_header, &final_header)?;
        promote(&self.staging_path, &self.final_path)?;
        info!(path = %self.final_path.display(), "output promoted");
        Ok(())
    }
}

fn promote(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to)
        .map_err(|e| KeyError::io(format!("cannot promote {} to {}", from.display(), to.display()), e))
}

// ── Progress ────────────────────────────────────────────────────────────────

/// Best-effort progress signal with a capped number of updates.
///
/// Updates are monotonic even when windows finish out of order: a report is
/// emitted only when it moves past the last emitted step.
#[derive(Debug)]
pub struct ProgressReporter {
    total: usize,
    step: usize,
    last_bucket: AtomicUsize,
    updates: AtomicUsize,
}

impl ProgressReporter {
    pub const DEFAULT_UPDATES: usize = 100;

    pub fn new(total: usize, max_updates: usize) -> Self {
        let step = total.div_ceil(max_updates.max(1)).max(1);
        Self {
            total,
            step,
            last_bucket: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        }
    }

    /// Report that `completed` of `total` windows are done. Returns the
    /// percentage if an update was emitted.
    pub fn report(&self, completed: usize) -> Option<usize> {
        if self.total == 0 || completed == 0 {
            return None;
        }
        let completed = completed.min(self.total);
        let bucket = if completed == self.total {
            self.total.div_ceil(self.step)
        } else {
            completed / self.step
        };
        if bucket == 0 || self.last_bucket.fetch_max(bucket, Ordering::AcqRel) >= bucket {
            return None;
        }
        self.updates.fetch_add(1, Ordering::Relaxed);
        let percent = completed * 100 / self.total;
        info!(completed, total = self.total, percent, "progress");
        Some(percent)
    }

    /// Number of updates emitted so far.
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{ElementType, LayerSource, RawRaster};

    fn output() -> OutputSpec {
        OutputSpec::new(ElementType::I16, -32768).unwrap()
    }

    fn buffer(window: Window, codes: &[i32]) -> ClassificationBuffer {
        let mut b = ClassificationBuffer::new(window, 0);
        b.codes_mut().copy_from_slice(codes);
        b
    }

    #[test]
    fn memory_sink_places_windows() {
        let sink = MemorySink::new(&GridGeometry::unit(3, 2), -1);
        sink.write(&Window::new(0, 1, 2, 2), &buffer(Window::new(0, 1, 2, 2), &[1, 2, 3, 4])).unwrap();
        assert_eq!(sink.into_codes(), vec![-1, 1, 2, -1, 3, 4]);
    }

    #[test]
    fn file_appears_only_after_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let grid = GridGeometry::unit(3, 2);
        let sink = RawRasterSink::create(&path, &grid, &output()).unwrap();

        sink.write(&Window::new(0, 0, 2, 2), &buffer(Window::new(0, 0, 2, 2), &[4474, 4475, 17, 25])).unwrap();
        sink.write(&Window::new(0, 2, 2, 1), &buffer(Window::new(0, 2, 2, 1), &[-32768, 9])).unwrap();
        assert!(!path.exists(), "final path must not exist before promotion");
        assert!(sink.staging().exists());

        sink.finish().unwrap();
        assert!(path.exists());
        assert!(!staging_path(&path).exists());

        let raster = RawRaster::open(&path).unwrap();
        assert_eq!(raster.meta().nodata, Some(-32768.0));
        let values = raster.read_window(&grid.full_window()).unwrap();
        assert_eq!(values, vec![4474.0, 4475.0, -32768.0, 17.0, 25.0, 9.0]);
    }

    #[test]
    fn stale_header_from_a_previous_run_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.bin");
        fs::write(&path, [0u8; 3]).unwrap();
        fs::write(header_path(&path), "{\"format_version\": 1}").unwrap();

        let grid = GridGeometry::unit(2, 1);
        let sink = RawRasterSink::create(&path, &grid, &output()).unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), 3, "previous output stays until promotion");
        let w = grid.full_window();
        sink.write(&w, &buffer(w, &[30, 253])).unwrap();
        sink.finish().unwrap();

        assert!(!staging_path(&header_path(&path)).exists());
        let raster = RawRaster::open(&path).unwrap();
        assert_eq!(raster.meta().element_type, ElementType::I16);
        assert_eq!(raster.read_window(&w).unwrap(), vec![30.0, 253.0]);
    }

    #[test]
    fn out_of_bounds_write_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RawRasterSink::create(dir.path().join("o.bin"), &GridGeometry::unit(2, 2), &output()).unwrap();
        let w = Window::new(1, 1, 2, 2);
        assert!(matches!(
            sink.write(&w, &buffer(w, &[0, 0, 0, 0])),
            Err(KeyError::WindowOutOfBounds { width: 2, height: 2, .. })
        ));
    }

    #[test]
    fn progress_is_capped_and_monotonic() {
        let p = ProgressReporter::new(1000, 10);
        let emitted: Vec<_> = (1..=1000).filter_map(|i| p.report(i)).collect();
        assert_eq!(p.updates(), 10);
        assert_eq!(emitted.last(), Some(&100));
        assert!(emitted.windows(2).all(|w| w[0] < w[1]));

        let late = ProgressReporter::new(10, 100);
        assert_eq!(late.report(5), Some(50));
        assert_eq!(late.report(3), None, "out-of-order completion must not go backwards");
        assert_eq!(late.report(10), Some(100));
    }
}
