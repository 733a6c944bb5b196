//! Streaming raster format: a row-major little-endian data file plus a JSON
//! header sidecar with the same stem (`layer.bin` + `layer.json`).
//!
//! Windowed reads fetch each row of the window at its file offset, so only the
//! window's bytes are ever resident. Positional reads share one handle across
//! worker threads without a lock.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KeyError, Result};
use crate::grid::Window;
use crate::raster::{check_bounds, LayerSource, RasterMeta};

/// On-disk header. Format version guards against silently misreading files
/// written by a future layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawHeader {
    pub format_version: u32,
    #[serde(flatten)]
    pub meta: RasterMeta,
}

pub const FORMAT_VERSION: u32 = 1;

impl RawHeader {
    pub fn new(meta: RasterMeta) -> Self {
        Self { format_version: FORMAT_VERSION, meta }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| KeyError::io(format!("cannot read header {}", path.display()), e))?;
        let header: RawHeader = serde_json::from_str(&text)
            .map_err(|source| KeyError::Json { path: path.to_path_buf(), source })?;
        if header.format_version != FORMAT_VERSION {
            return Err(KeyError::Manifest(format!(
                "{}: unsupported raster format version {}",
                path.display(),
                header.format_version
            )));
        }
        Ok(header)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|source| KeyError::Json { path: path.to_path_buf(), source })?;
        fs::write(path, json).map_err(|e| KeyError::io(format!("cannot write header {}", path.display()), e))
    }
}

/// Header sidecar path for a data file.
pub fn header_path(data_path: &Path) -> PathBuf {
    data_path.with_extension("json")
}

/// A raster band in the streaming format, opened for windowed reads.
#[derive(Debug)]
pub struct RawRaster {
    path: PathBuf,
    meta: RasterMeta,
    file: File,
}

impl RawRaster {
    /// Open a data file and its header sidecar, checking the file length
    /// against the declared grid.
    pub fn open(data_path: impl AsRef<Path>) -> Result<Self> {
        let path = data_path.as_ref().to_path_buf();
        let header = RawHeader::read(&header_path(&path))?;
        let file = File::open(&path).map_err(|e| KeyError::io(format!("cannot open {}", path.display()), e))?;
        let expected = (header.meta.geometry.cell_count() * header.meta.element_type.size()) as u64;
        let actual = file
            .metadata()
            .map_err(|e| KeyError::io(format!("cannot stat {}", path.display()), e))?
            .len();
        if actual != expected {
            return Err(KeyError::io(
                format!("{} holds {actual} bytes, header implies {expected}", path.display()),
                std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
            ));
        }
        Ok(Self { path, meta: header.meta, file })
    }

    /// Write a complete raster (header + data) in one go.
    pub fn create(data_path: impl AsRef<Path>, meta: &RasterMeta, values: &[f64]) -> Result<()> {
        let path = data_path.as_ref();
        if values.len() != meta.geometry.cell_count() {
            return Err(KeyError::io(
                format!(
                    "{}: {} values for a {}x{} grid",
                    path.display(),
                    values.len(),
                    meta.geometry.width,
                    meta.geometry.height
                ),
                std::io::Error::from(std::io::ErrorKind::InvalidInput),
            ));
        }
        let file = File::create(path).map_err(|e| KeyError::io(format!("cannot create {}", path.display()), e))?;
        let mut out = BufWriter::new(file);
        let mut row = Vec::with_capacity(meta.geometry.width * meta.element_type.size());
        for chunk in values.chunks(meta.geometry.width.max(1)) {
            row.clear();
            for &v in chunk {
                meta.element_type.encode(v, &mut row);
            }
            out.write_all(&row)
                .map_err(|e| KeyError::io(format!("cannot write {}", path.display()), e))?;
        }
        out.flush().map_err(|e| KeyError::io(format!("cannot flush {}", path.display()), e))?;
        RawHeader::new(meta.clone()).write(&header_path(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LayerSource for RawRaster {
    fn meta(&self) -> &RasterMeta {
        &self.meta
    }

    fn read_window(&self, window: &Window) -> Result<Vec<f64>> {
        check_bounds(&self.meta, window)?;
        let size = self.meta.element_type.size();
        let width = self.meta.geometry.width;
        let mut row = vec![0u8; window.cols * size];
        let mut out = Vec::with_capacity(window.len());

        for r in 0..window.rows {
            let offset = ((window.row + r) * width + window.col) * size;
            read_exact_at(&self.file, &mut row, offset as u64)
                .map_err(|e| KeyError::io(format!("read {} at {window}", self.path.display()), e))?;
            self.meta.element_type.decode(&row, &mut out);
        }
        Ok(out)
    }
}

// ── Positional I/O ──────────────────────────────────────────────────────────

#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
}

#[cfg(unix)]
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(n) => {
                let rest = buf;
                buf = &mut rest[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
pub(crate) fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
