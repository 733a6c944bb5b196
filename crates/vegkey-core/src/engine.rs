//! Rule engine: conditional-overwrite interpretation of a compiled catalog
//! over one window.
//!
//! The buffer starts at the catalog's base code inside the domain mask and at
//! output nodata elsewhere. Each enabled rule, in catalog order, overwrites the
//! pixels where its predicate holds; every other pixel keeps whatever an
//! earlier rule left there. Later predicates read that intermediate value
//! through `current`.

use crate::catalog::compile::PixelContext;
use crate::catalog::{Catalog, CompiledCatalog, CompiledTarget};
use crate::error::{KeyError, Result};
use crate::grid::Window;
use crate::raster::ElementType;
use crate::registry::SealedRegistry;

// ── Output definition ───────────────────────────────────────────────────────

/// Element type and nodata sentinel of the classification output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSpec {
    pub element_type: ElementType,
    pub nodata: i64,
}

impl OutputSpec {
    /// Integer types up to 32-bit signed; the nodata sentinel must fit.
    pub fn new(element_type: ElementType, nodata: i64) -> Result<Self> {
        if !element_type.is_integer() || element_type == ElementType::U32 {
            return Err(KeyError::UnsupportedOutputType(element_type));
        }
        if !element_type.fits(nodata) {
            return Err(KeyError::TypeOverflow {
                code: nodata,
                element_type,
                referenced_by: "output nodata".into(),
            });
        }
        Ok(Self { element_type, nodata })
    }

    /// Check that `code` fits the output type.
    pub fn code(&self, code: i64, referenced_by: &str) -> Result<i32> {
        if self.element_type.fits(code) {
            Ok(code as i32)
        } else {
            Err(KeyError::TypeOverflow {
                code,
                element_type: self.element_type,
                referenced_by: referenced_by.to_string(),
            })
        }
    }

    #[inline]
    pub fn nodata_code(&self) -> i32 {
        self.nodata as i32
    }
}

// ── Classification buffer ───────────────────────────────────────────────────

/// Per-window output codes, row-major, one per pixel of the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationBuffer {
    window: Window,
    codes: Vec<i32>,
}

impl ClassificationBuffer {
    pub fn new(window: Window, fill: i32) -> Self {
        Self { window, codes: vec![fill; window.len()] }
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn codes(&self) -> &[i32] {
        &self.codes
    }

    pub fn codes_mut(&mut self) -> &mut [i32] {
        &mut self.codes
    }

    /// Code at window-relative (row, col).
    pub fn get(&self, row: usize, col: usize) -> i32 {
        self.codes[row * self.window.cols + col]
    }

    pub fn into_codes(self) -> Vec<i32> {
        self.codes
    }

    /// Little-endian bytes in `element_type`.
    pub fn encode(&self, element_type: ElementType) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.codes.len() * element_type.size());
        for &c in &self.codes {
            element_type.encode(c as f64, &mut out);
        }
        out
    }
}

// ── Window inputs ───────────────────────────────────────────────────────────

/// One window's worth of every layer the catalog reads, indexed by slot.
/// `None` marks a pixel holding its layer's nodata sentinel.
#[derive(Debug, Clone)]
pub struct WindowData {
    layers: Vec<Vec<Option<f64>>>,
}

impl WindowData {
    pub fn slot(&self, slot: usize) -> &[Option<f64>] {
        &self.layers[slot]
    }
}

struct Pixel<'a> {
    data: &'a WindowData,
    index: usize,
    current: Option<f64>,
}

impl PixelContext for Pixel<'_> {
    #[inline]
    fn layer(&self, slot: usize) -> Option<f64> {
        self.data.layers[slot][self.index]
    }

    #[inline]
    fn current(&self) -> Option<f64> {
        self.current
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RuleEngine {
    catalog: CompiledCatalog,
    output: OutputSpec,
    active: Vec<usize>,
}

impl RuleEngine {
    pub fn new(catalog: CompiledCatalog, output: OutputSpec) -> Self {
        let active = catalog
            .rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.enabled)
            .map(|(i, _)| i)
            .collect();
        Self { catalog, output, active }
    }

    /// Compile `catalog` against `registry` and build an engine for it.
    pub fn compile(catalog: &Catalog, registry: &SealedRegistry, output: OutputSpec) -> Result<Self> {
        Ok(Self::new(CompiledCatalog::compile(catalog, registry, &output)?, output))
    }

    pub fn catalog(&self) -> &CompiledCatalog {
        &self.catalog
    }

    pub fn output(&self) -> &OutputSpec {
        &self.output
    }

    /// Read every slot's block for `window`, applying `fill_nodata`.
    pub fn read(&self, registry: &SealedRegistry, window: &Window) -> Result<WindowData> {
        let mut layers = Vec::with_capacity(self.catalog.slots.len());
        for slot in &self.catalog.slots {
            let meta = registry.meta(slot.handle);
            let raw = registry.read(slot.handle, window)?;
            layers.push(
                raw.into_iter()
                    .map(|v| if meta.is_nodata(v) { slot.fill } else { Some(v) })
                    .collect(),
            );
        }
        Ok(WindowData { layers })
    }

    /// Run the catalog over one window's inputs. `in_scope` is the window's
    /// domain-mask slice.
    pub fn classify(&self, window: &Window, data: &WindowData, in_scope: &[bool]) -> ClassificationBuffer {
        let nodata = self.output.nodata_code();
        let mut buffer = ClassificationBuffer::new(*window, nodata);

        for (index, code) in buffer.codes.iter_mut().enumerate() {
            if !in_scope[index] {
                continue;
            }
            *code = self.catalog.base_code;
            for &r in &self.active {
                let rule = &self.catalog.rules[r];
                let px = Pixel {
                    data,
                    index,
                    current: (*code != nodata).then_some(*code as f64),
                };
                if rule.predicate.test(&px) {
                    *code = match rule.target {
                        CompiledTarget::Code(c) => c,
                        CompiledTarget::Layer(slot) => px.layer(slot).map_or(nodata, |v| v as i32),
                    };
                }
            }
        }
        buffer
    }

    /// Read and classify `window`.
    pub fn evaluate(&self, window: &Window, registry: &SealedRegistry, in_scope: &[bool]) -> Result<ClassificationBuffer> {
        let data = self.read(registry, window)?;
        Ok(self.classify(window, &data, in_scope))
    }
}
