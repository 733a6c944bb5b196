//! Run manifest: the explicit list of named layers, the domain mask, the
//! output definition and the catalog for one run.
//!
//! Relative paths resolve against the manifest's own directory, never the
//! process working directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::Catalog;
use crate::engine::OutputSpec;
use crate::error::{KeyError, Result};
use crate::mask::DomainMask;
use crate::raster::raw::header_path;
use crate::raster::{ElementType, RawRaster, Retrying};
use crate::runner::Pipeline;
use crate::sink::RawRasterSink;
use crate::tiling::BlockShape;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDef {
    pub path: PathBuf,
    pub element_type: ElementType,
    pub nodata: i64,
}

/// Bounded retry for transient layer-read failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_backoff_ms() -> u64 {
    200
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub layers: BTreeMap<String, LayerSpec>,
    pub mask: DomainMask,
    pub output: OutputDef,
    pub catalog: PathBuf,
    #[serde(default)]
    pub block: BlockShape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Directory relative paths resolve against; set by the loader.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Manifest {
    pub fn from_json(text: &str, origin: &Path) -> Result<Self> {
        let mut manifest: Manifest =
            serde_json::from_str(text).map_err(|source| KeyError::Json { path: origin.to_path_buf(), source })?;
        manifest.base_dir = origin.parent().map(Path::to_path_buf).unwrap_or_default();
        manifest.validate(origin)?;
        Ok(manifest)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| KeyError::io(format!("cannot read manifest {}", path.display()), e))?;
        Self::from_json(&text, path)
    }

    fn validate(&self, origin: &Path) -> Result<()> {
        if self.layers.is_empty() {
            return Err(KeyError::Manifest("no layers listed".into()));
        }
        let out = self.resolve(&self.output.path);
        if out.extension().is_some_and(|ext| ext == "json") {
            return Err(KeyError::Manifest(format!(
                "output path {} may not end in .json; that name is used for its header",
                out.display()
            )));
        }
        let written = [header_path(&out), out];
        let mut protected = Vec::with_capacity(2 * self.layers.len() + 2);
        for (name, layer) in &self.layers {
            let data = self.resolve(&layer.path);
            protected.push((header_path(&data), format!("the header of input layer '{name}'")));
            protected.push((data, format!("input layer '{name}'")));
        }
        protected.push((self.resolve(&self.catalog), "the catalog".to_string()));
        protected.push((origin.to_path_buf(), "the manifest".to_string()));
        if let Some((path, what)) = protected.iter().find(|(path, _)| written.contains(path)) {
            return Err(KeyError::Manifest(format!("output would overwrite {what} ({})", path.display())));
        }
        if self.retry.is_some_and(|r| r.attempts == 0) {
            return Err(KeyError::Manifest("retry.attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn output_path(&self) -> PathBuf {
        self.resolve(&self.output.path)
    }

    pub fn output_spec(&self) -> Result<OutputSpec> {
        OutputSpec::new(self.output.element_type, self.output.nodata)
    }

    pub fn load_catalog(&self) -> Result<Catalog> {
        Catalog::load(self.resolve(&self.catalog))
    }

    /// Open every layer, then seal and validate. No pixel is read.
    pub fn pipeline(&self) -> Result<Pipeline> {
        let catalog = self.load_catalog()?;
        let mut builder = Pipeline::builder();
        for (name, spec) in &self.layers {
            let path = self.resolve(&spec.path);
            debug!(layer = %name, path = %path.display(), "opening layer");
            let raster = RawRaster::open(&path)?;
            match self.retry {
                Some(r) => builder.register(
                    name.as_str(),
                    Retrying::new(raster, r.attempts, Duration::from_millis(r.backoff_ms)),
                )?,
                None => builder.register(name.as_str(), raster)?,
            };
        }
        builder.build(&catalog, &self.mask, self.output_spec()?)
    }

    /// Staging sink for this manifest's output on `pipeline`'s grid.
    pub fn sink(&self, pipeline: &Pipeline) -> Result<RawRasterSink> {
        RawRasterSink::create(self.output_path(), pipeline.registry().reference(), pipeline.engine().output())
    }
}
