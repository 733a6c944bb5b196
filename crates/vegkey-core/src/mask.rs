//! Domain mask gate.
//!
//! The gate is the terminal step of every window: pixels outside the area of
//! interest are forced to output nodata after the catalog has run. It is not a
//! rule and no rule can override it.

use serde::{Deserialize, Serialize};

use crate::engine::{ClassificationBuffer, OutputSpec};
use crate::error::Result;
use crate::grid::Window;
use crate::registry::{LayerHandle, SealedRegistry};

/// Which mask-layer values count as in scope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InScope {
    /// The pixel equals this marker.
    Equals(f64),
    /// The pixel holds any value other than the layer's nodata.
    Present,
}

/// Unbound mask definition, as written in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainMask {
    pub layer: String,
    pub in_scope: InScope,
}

impl DomainMask {
    pub fn equals(layer: impl Into<String>, marker: f64) -> Self {
        Self { layer: layer.into(), in_scope: InScope::Equals(marker) }
    }

    pub fn present(layer: impl Into<String>) -> Self {
        Self { layer: layer.into(), in_scope: InScope::Present }
    }

    /// Resolve the mask layer against `registry`.
    pub fn bind(&self, registry: &SealedRegistry, output: &OutputSpec) -> Result<MaskGate> {
        Ok(MaskGate {
            handle: registry.resolve_for(&self.layer, "domain mask")?,
            in_scope: self.in_scope,
            nodata: output.nodata_code(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MaskGate {
    handle: LayerHandle,
    in_scope: InScope,
    nodata: i32,
}

impl MaskGate {
    /// The window's mask slice: `true` where the pixel is in scope. Nodata in
    /// the mask layer is always out of scope.
    pub fn read(&self, registry: &SealedRegistry, window: &Window) -> Result<Vec<bool>> {
        let meta = registry.meta(self.handle);
        let raw = registry.read(self.handle, window)?;
        Ok(raw
            .into_iter()
            .map(|v| {
                !meta.is_nodata(v)
                    && match self.in_scope {
                        InScope::Equals(marker) => v == marker,
                        InScope::Present => true,
                    }
            })
            .collect())
    }

    /// Force every out-of-scope pixel to output nodata.
    pub fn apply(&self, mut buffer: ClassificationBuffer, in_scope: &[bool]) -> ClassificationBuffer {
        for (code, &inside) in buffer.codes_mut().iter_mut().zip(in_scope) {
            if !inside {
                *code = self.nodata;
            }
        }
        buffer
    }
}
