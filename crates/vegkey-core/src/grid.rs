use std::fmt;

use serde::{Deserialize, Serialize};

/// Relative tolerance when comparing origins and pixel sizes of two grids.
/// Transforms written by different tools differ in the last few ulps.
const TRANSFORM_TOLERANCE: f64 = 1e-9;

/// Georeferencing and extent of a raster grid.
/// Coordinate math uses f64; rows run from the origin along `pixel_height`
/// (negative for north-up rasters).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    /// X coordinate of the upper-left corner of pixel (0, 0).
    pub origin_x: f64,
    /// Y coordinate of the upper-left corner of pixel (0, 0).
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub width: usize,
    pub height: usize,
    /// Coordinate reference identifier, e.g. `EPSG:3338`.
    pub crs: String,
}

impl GridGeometry {
    pub fn new(
        origin_x: f64,
        origin_y: f64,
        pixel_width: f64,
        pixel_height: f64,
        width: usize,
        height: usize,
        crs: impl Into<String>,
    ) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
            width,
            height,
            crs: crs.into(),
        }
    }

    /// A unit-pixel grid anchored at the origin. Handy for synthetic data.
    pub fn unit(width: usize, height: usize) -> Self {
        Self::new(0.0, height as f64, 1.0, -1.0, width, height, "LOCAL")
    }

    pub fn cell_count(&self) -> usize {
        self.width * self.height
    }

    /// The whole grid as a single window.
    pub fn full_window(&self) -> Window {
        Window::new(0, 0, self.height, self.width)
    }

    /// Describe how `other` differs from `self`, or `None` when the grids agree.
    pub fn mismatch(&self, other: &GridGeometry) -> Option<String> {
        if self.width != other.width || self.height != other.height {
            return Some(format!(
                "dimensions {}x{} vs reference {}x{}",
                other.width, other.height, self.width, self.height
            ));
        }
        if !close(self.pixel_width, other.pixel_width) || !close(self.pixel_height, other.pixel_height) {
            return Some(format!(
                "pixel size ({}, {}) vs reference ({}, {})",
                other.pixel_width, other.pixel_height, self.pixel_width, self.pixel_height
            ));
        }
        let tol_x = self.pixel_width.abs() * TRANSFORM_TOLERANCE;
        let tol_y = self.pixel_height.abs() * TRANSFORM_TOLERANCE;
        if (self.origin_x - other.origin_x).abs() > tol_x || (self.origin_y - other.origin_y).abs() > tol_y {
            return Some(format!(
                "origin ({}, {}) vs reference ({}, {})",
                other.origin_x, other.origin_y, self.origin_x, self.origin_y
            ));
        }
        if self.crs != other.crs {
            return Some(format!("CRS '{}' vs reference '{}'", other.crs, self.crs));
        }
        None
    }
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= a.abs().max(b.abs()) * TRANSFORM_TOLERANCE
}

/// Axis-aligned rectangular sub-region of a grid: offset plus extent, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub row: usize,
    pub col: usize,
    pub rows: usize,
    pub cols: usize,
}

impl Window {
    pub fn new(row: usize, col: usize, rows: usize, cols: usize) -> Self {
        Self { row, col, rows, cols }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major index of window-local pixel (r, c).
    #[inline]
    pub fn index(&self, r: usize, c: usize) -> usize {
        r * self.cols + c
    }

    /// True if the window lies entirely inside a `width` × `height` grid.
    pub fn fits(&self, width: usize, height: usize) -> bool {
        self.row + self.rows <= height && self.col + self.cols <= width
    }

    pub fn overlaps(&self, other: &Window) -> bool {
        self.row < other.row + other.rows
            && other.row < self.row + self.rows
            && self.col < other.col + other.cols
            && other.col < self.col + self.cols
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rows {}..{}, cols {}..{}", self.row, self.row + self.rows, self.col, self.col + self.cols)
    }
}

/// Copy a window's pixels out of a full row-major grid.
pub fn extract_window<T: Copy>(data: &[T], grid_width: usize, window: &Window) -> Vec<T> {
    let mut out = Vec::with_capacity(window.len());
    for r in 0..window.rows {
        let start = (window.row + r) * grid_width + window.col;
        out.extend_from_slice(&data[start..start + window.cols]);
    }
    out
}

/// Paste a window's pixels back into a full row-major grid.
pub fn insert_window<T: Copy>(data: &mut [T], grid_width: usize, window: &Window, block: &[T]) {
    for r in 0..window.rows {
        let start = (window.row + r) * grid_width + window.col;
        data[start..start + window.cols].copy_from_slice(&block[r * window.cols..(r + 1) * window.cols]);
    }
}
