use crate::error::Result;
use crate::grid::{extract_window, GridGeometry, Window};
use crate::raster::{check_bounds, ElementType, LayerSource, RasterMeta};

/// A whole raster band held in memory, row-major.
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    meta: RasterMeta,
    data: Vec<f64>,
}

impl MemoryRaster {
    /// Wrap existing row-major values. Panics if the length disagrees with the grid.
    pub fn new(meta: RasterMeta, data: Vec<f64>) -> Self {
        assert_eq!(
            data.len(),
            meta.geometry.cell_count(),
            "raster data length must equal width × height"
        );
        Self { meta, data }
    }

    /// A raster filled with one value.
    pub fn filled(geometry: GridGeometry, element_type: ElementType, nodata: Option<f64>, fill: f64) -> Self {
        let n = geometry.cell_count();
        Self::new(RasterMeta::new(geometry, element_type, nodata), vec![fill; n])
    }

    /// Build from integer values, the common case for cover and code layers.
    pub fn from_ints(
        geometry: GridGeometry,
        element_type: ElementType,
        nodata: Option<f64>,
        values: &[i64],
    ) -> Self {
        let data = values.iter().map(|&v| v as f64).collect();
        Self::new(RasterMeta::new(geometry, element_type, nodata), data)
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.meta.geometry.width + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: f64) {
        let w = self.meta.geometry.width;
        self.data[row * w + col] = val;
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }
}

impl LayerSource for MemoryRaster {
    fn meta(&self) -> &RasterMeta {
        &self.meta
    }

    fn read_window(&self, window: &Window) -> Result<Vec<f64>> {
        check_bounds(&self.meta, window)?;
        Ok(extract_window(&self.data, self.meta.geometry.width, window))
    }
}
