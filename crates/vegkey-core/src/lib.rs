//! Sequential raster reclassification engine.
//!
//! A run registers aligned raster layers, compiles an ordered rule catalog
//! against them, and streams the reference grid window by window:
//! read → evaluate the catalog → gate by the domain mask → write.

pub mod catalog;
pub mod engine;
pub mod error;
pub mod grid;
pub mod manifest;
pub mod mask;
pub mod raster;
pub mod registry;
pub mod runner;
pub mod sink;
pub mod tiling;

pub use catalog::{lint, Catalog, CompiledCatalog, Finding, FindingKind, RuleSpec};
pub use engine::{ClassificationBuffer, OutputSpec, RuleEngine};
pub use error::{KeyError, Result};
pub use grid::{GridGeometry, Window};
pub use manifest::Manifest;
pub use mask::{DomainMask, InScope, MaskGate};
pub use raster::{ElementType, LayerSource, MemoryRaster, RasterMeta, RawRaster, Retrying};
pub use registry::{LayerHandle, LayerRegistry, SealedRegistry};
pub use runner::{Pipeline, PipelineBuilder, RunOptions, RunState, RunSummary};
pub use sink::{MemorySink, OutputSink, ProgressReporter, RawRasterSink};
pub use tiling::{partition, BlockShape, CompletionTracker, Partition};
