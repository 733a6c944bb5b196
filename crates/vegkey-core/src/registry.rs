//! Named layer registry with a single reference grid.
//!
//! Registration is open until [`LayerRegistry::seal`], which hands back a
//! [`SealedRegistry`]: the only type the engine reads from. A registry that is
//! still accepting layers therefore cannot be evaluated against.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{KeyError, Result};
use crate::grid::{GridGeometry, Window};
use crate::raster::{LayerSource, RasterMeta};

/// Resolved reference to a registered layer. Cheap to copy; only meaningful
/// for the registry that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerHandle(pub(crate) usize);

impl LayerHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

struct Entry {
    name: String,
    source: Arc<dyn LayerSource>,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("name", &self.name)
            .field("meta", self.source.meta())
            .finish()
    }
}

/// Registry in its registering state.
#[derive(Debug, Default)]
pub struct LayerRegistry {
    entries: Vec<Entry>,
    by_name: HashMap<String, usize>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The grid every layer must share: that of the first registered layer.
    pub fn reference(&self) -> Option<&GridGeometry> {
        self.entries.first().map(|e| &e.source.meta().geometry)
    }

    /// Register `source` under `name`.
    pub fn register(&mut self, name: impl Into<String>, source: impl LayerSource + 'static) -> Result<LayerHandle> {
        self.register_shared(name, Arc::new(source))
    }

    pub fn register_shared(&mut self, name: impl Into<String>, source: Arc<dyn LayerSource>) -> Result<LayerHandle> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(KeyError::DuplicateName(name));
        }
        if let Some(reference) = self.reference() {
            if let Some(detail) = reference.mismatch(&source.meta().geometry) {
                return Err(KeyError::GeometryMismatch { name, detail });
            }
        }
        let handle = LayerHandle(self.entries.len());
        debug!(layer = %name, element_type = %source.meta().element_type, "registered layer");
        self.by_name.insert(name.clone(), handle.0);
        self.entries.push(Entry { name, source });
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close registration. Fails on an empty registry since there is no grid.
    pub fn seal(self) -> Result<SealedRegistry> {
        let reference = self.reference().cloned().ok_or(KeyError::EmptyRegistry)?;
        Ok(SealedRegistry {
            reference,
            entries: self.entries,
            by_name: self.by_name,
        })
    }
}

/// Registry after sealing: immutable, shareable across worker threads.
#[derive(Debug)]
pub struct SealedRegistry {
    reference: GridGeometry,
    entries: Vec<Entry>,
    by_name: HashMap<String, usize>,
}

impl SealedRegistry {
    pub fn reference(&self) -> &GridGeometry {
        &self.reference
    }

    pub fn resolve(&self, name: &str) -> Result<LayerHandle> {
        self.by_name.get(name).map(|&i| LayerHandle(i)).ok_or_else(|| KeyError::UnknownLayer {
            name: name.to_string(),
            referenced_by: "lookup".to_string(),
        })
    }

    /// Like [`resolve`](Self::resolve), naming the referrer in the error.
    pub fn resolve_for(&self, name: &str, referenced_by: &str) -> Result<LayerHandle> {
        self.resolve(name).map_err(|_| KeyError::UnknownLayer {
            name: name.to_string(),
            referenced_by: referenced_by.to_string(),
        })
    }

    pub fn name(&self, handle: LayerHandle) -> &str {
        &self.entries[handle.0].name
    }

    pub fn meta(&self, handle: LayerHandle) -> &RasterMeta {
        self.entries[handle.0].source.meta()
    }

    pub fn read(&self, handle: LayerHandle, window: &Window) -> Result<Vec<f64>> {
        self.entries[handle.0].source.read_window(window)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }
}
