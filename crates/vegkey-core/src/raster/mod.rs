//! Raster layers: element types, metadata, and windowed read access.

pub mod memory;
pub mod raw;
pub mod retry;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{KeyError, Result};
use crate::grid::{GridGeometry, Window};

pub use memory::MemoryRaster;
pub use raw::{RawHeader, RawRaster};
pub use retry::Retrying;

/// Numeric element type of a raster band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl ElementType {
    /// Bytes per element.
    pub fn size(self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, ElementType::F32 | ElementType::F64)
    }

    /// Inclusive value range.
    pub fn range(self) -> (f64, f64) {
        match self {
            ElementType::U8 => (0.0, u8::MAX as f64),
            ElementType::I8 => (i8::MIN as f64, i8::MAX as f64),
            ElementType::U16 => (0.0, u16::MAX as f64),
            ElementType::I16 => (i16::MIN as f64, i16::MAX as f64),
            ElementType::U32 => (0.0, u32::MAX as f64),
            ElementType::I32 => (i32::MIN as f64, i32::MAX as f64),
            ElementType::F32 => (f32::MIN as f64, f32::MAX as f64),
            ElementType::F64 => (f64::MIN, f64::MAX),
        }
    }

    /// True if `code` is representable in this type.
    pub fn fits(self, code: i64) -> bool {
        let (lo, hi) = self.range();
        (code as f64) >= lo && (code as f64) <= hi
    }

    /// True if every value of `other` is representable in `self`.
    pub fn holds(self, other: ElementType) -> bool {
        if self.is_integer() && !other.is_integer() {
            return false;
        }
        let (lo, hi) = self.range();
        let (olo, ohi) = other.range();
        olo >= lo && ohi <= hi
    }

    /// Decode little-endian elements from `bytes`, appending to `out`.
    pub fn decode(self, bytes: &[u8], out: &mut Vec<f64>) {
        match self {
            ElementType::U8 => out.extend(bytes.iter().map(|&b| b as f64)),
            ElementType::I8 => out.extend(bytes.iter().map(|&b| b as i8 as f64)),
            ElementType::U16 => out.extend(
                bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]]) as f64),
            ),
            ElementType::I16 => out.extend(
                bytes.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]]) as f64),
            ),
            ElementType::U32 => out.extend(
                bytes.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64),
            ),
            ElementType::I32 => out.extend(
                bytes.chunks_exact(4).map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64),
            ),
            ElementType::F32 => out.extend(
                bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64),
            ),
            ElementType::F64 => out.extend(bytes.chunks_exact(8).map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                f64::from_le_bytes(b)
            })),
        }
    }

    /// Encode one value as little-endian bytes. Integer types truncate toward
    /// zero and saturate at the type bounds.
    pub fn encode(self, value: f64, out: &mut Vec<u8>) {
        match self {
            ElementType::U8 => out.push(value as u8),
            ElementType::I8 => out.push(value as i8 as u8),
            ElementType::U16 => out.extend_from_slice(&(value as u16).to_le_bytes()),
            ElementType::I16 => out.extend_from_slice(&(value as i16).to_le_bytes()),
            ElementType::U32 => out.extend_from_slice(&(value as u32).to_le_bytes()),
            ElementType::I32 => out.extend_from_slice(&(value as i32).to_le_bytes()),
            ElementType::F32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
            ElementType::F64 => out.extend_from_slice(&value.to_le_bytes()),
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::U8 => "u8",
            ElementType::I8 => "i8",
            ElementType::U16 => "u16",
            ElementType::I16 => "i16",
            ElementType::U32 => "u32",
            ElementType::I32 => "i32",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// Immutable description of one raster band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterMeta {
    pub geometry: GridGeometry,
    pub element_type: ElementType,
    /// Nodata sentinel, if the band declares one.
    pub nodata: Option<f64>,
}

impl RasterMeta {
    pub fn new(geometry: GridGeometry, element_type: ElementType, nodata: Option<f64>) -> Self {
        Self { geometry, element_type, nodata }
    }

    #[inline]
    pub fn is_nodata(&self, v: f64) -> bool {
        match self.nodata {
            Some(nd) => v == nd || (nd.is_nan() && v.is_nan()),
            None => false,
        }
    }
}

/// Uniform windowed read access to one raster band.
///
/// Implementations return the window's pixels row-major, widened to f64.
/// Reads take `&self` so one source can serve many worker threads.
pub trait LayerSource: Send + Sync {
    fn meta(&self) -> &RasterMeta;

    fn read_window(&self, window: &Window) -> Result<Vec<f64>>;
}

impl<T: LayerSource + ?Sized> LayerSource for Arc<T> {
    fn meta(&self) -> &RasterMeta {
        (**self).meta()
    }

    fn read_window(&self, window: &Window) -> Result<Vec<f64>> {
        (**self).read_window(window)
    }
}

/// Reject windows that reach past the grid instead of reading garbage.
pub(crate) fn check_bounds(meta: &RasterMeta, window: &Window) -> Result<()> {
    let g = &meta.geometry;
    if window.fits(g.width, g.height) {
        Ok(())
    } else {
        Err(KeyError::WindowOutOfBounds { window: *window, width: g.width, height: g.height })
    }
}
