//! Error taxonomy for the classification engine.
//!
//! Validation errors (geometry, names, overflow, catalog syntax) are raised
//! before any window is read. Execution errors abort the run and are wrapped in
//! [`KeyError::WindowFailed`] so the caller can report which window failed.

use std::path::PathBuf;

use crate::grid::Window;
use crate::raster::ElementType;

pub type Result<T> = std::result::Result<T, KeyError>;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// A layer's grid disagrees with the reference grid.
    #[error("layer '{name}' does not match the reference grid: {detail}")]
    GeometryMismatch { name: String, detail: String },

    #[error("layer '{0}' is already registered")]
    DuplicateName(String),

    /// A rule, derived quantity or mask references an unregistered layer.
    #[error("unknown layer '{name}' referenced by {referenced_by}")]
    UnknownLayer { name: String, referenced_by: String },

    /// A code does not fit the output element type.
    #[error("code {code} used by {referenced_by} does not fit output type {element_type}")]
    TypeOverflow {
        code: i64,
        element_type: ElementType,
        referenced_by: String,
    },

    #[error("output element type {0} is not supported; use u8, i8, u16, i16 or i32")]
    UnsupportedOutputType(ElementType),

    #[error("layer registry is empty; register at least one layer before sealing")]
    EmptyRegistry,

    #[error("invalid block shape {rows}x{cols}: both dimensions must be positive")]
    InvalidBlockShape { rows: usize, cols: usize },

    /// A window reaches past the grid it was read from or written to.
    #[error("window {window} exceeds {width}x{height} grid")]
    WindowOutOfBounds { window: Window, width: usize, height: usize },

    #[error("catalog syntax error in {location}: {message}")]
    CatalogSyntax { location: String, message: String },

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("run cancelled after {completed} of {total} windows")]
    Cancelled { completed: usize, total: usize },

    #[error("window {index} ({window}) failed: {source}")]
    WindowFailed {
        index: usize,
        window: Window,
        #[source]
        source: Box<KeyError>,
    },
}

impl KeyError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }

    /// True for failures a retry might clear (I/O only).
    pub fn is_transient(&self) -> bool {
        matches!(self, KeyError::Io { .. })
    }
}
