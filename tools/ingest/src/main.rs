/// Convert a single-band GeoTIFF into the streaming layer format.
///
/// Grid geometry comes from the GeoTIFF pixel-scale and tiepoint tags, nodata
/// from the GDAL_NODATA tag unless overridden on the command line. Pixel values
/// keep their stored element type.
///
/// Usage:
///   ingest --input picgla.tif --output layers/picgla.bin [--crs EPSG:3338] [--nodata 255]
use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vegkey_core::{ElementType, GridGeometry, RasterMeta, RawRaster};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "ingest", about = "Convert a GeoTIFF band into a streaming raster layer")]
struct Args {
    /// Source GeoTIFF
    #[arg(long)]
    input: PathBuf,

    /// Destination data file; the header is written next to it
    #[arg(long)]
    output: PathBuf,

    /// Coordinate reference identifier recorded in the header
    #[arg(long, default_value = "EPSG:3338")]
    crs: String,

    /// Nodata value (default: the file's GDAL_NODATA tag, if any)
    #[arg(long)]
    nodata: Option<f64>,
}

// ── Decoding ─────────────────────────────────────────────────────────────────

struct Band {
    width: usize,
    height: usize,
    element_type: ElementType,
    values: Vec<f64>,
}

fn widen<T: Copy + Into<f64>>(v: Vec<T>) -> Vec<f64> {
    v.into_iter().map(Into::into).collect()
}

fn decode_band<R: io::Read + io::Seek>(decoder: &mut Decoder<R>) -> Result<Band> {
    let (width, height) = decoder.dimensions().context("Cannot read TIFF dimensions")?;
    let (element_type, values) = match decoder.read_image().context("Cannot decode TIFF pixels")? {
        DecodingResult::U8(v) => (ElementType::U8, widen(v)),
        DecodingResult::I8(v) => (ElementType::I8, widen(v)),
        DecodingResult::U16(v) => (ElementType::U16, widen(v)),
        DecodingResult::I16(v) => (ElementType::I16, widen(v)),
        DecodingResult::U32(v) => (ElementType::U32, widen(v)),
        DecodingResult::I32(v) => (ElementType::I32, widen(v)),
        DecodingResult::F32(v) => (ElementType::F32, widen(v)),
        DecodingResult::F64(v) => (ElementType::F64, v),
        _ => bail!("Unsupported TIFF sample format (64-bit integers are not accepted)"),
    };
    let (width, height) = (width as usize, height as usize);
    ensure!(
        values.len() == width * height,
        "Expected one band of {width}x{height} samples, got {} values",
        values.len()
    );
    Ok(Band { width, height, element_type, values })
}

/// Upper-left corner and signed pixel size from the GeoTIFF tags.
fn read_geometry<R: io::Read + io::Seek>(
    decoder: &mut Decoder<R>,
    width: usize,
    height: usize,
    crs: String,
) -> Result<GridGeometry> {
    let scale = decoder
        .get_tag_f64_vec(Tag::ModelPixelScaleTag)
        .context("Missing ModelPixelScale tag; not a GeoTIFF?")?;
    let tiepoint = decoder
        .get_tag_f64_vec(Tag::ModelTiepointTag)
        .context("Missing ModelTiepoint tag; not a GeoTIFF?")?;
    ensure!(scale.len() >= 2, "ModelPixelScale has {} values, need 2", scale.len());
    ensure!(tiepoint.len() >= 6, "ModelTiepoint has {} values, need 6", tiepoint.len());

    // Tiepoint maps raster (i, j) to model (x, y); shift back to pixel (0, 0).
    let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
    let origin_x = x - i * scale[0];
    let origin_y = y + j * scale[1];
    Ok(GridGeometry::new(origin_x, origin_y, scale[0], -scale[1], width, height, crs))
}

fn read_nodata<R: io::Read + io::Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    let text = decoder.get_tag_ascii_string(Tag::GdalNodata).ok()?;
    let trimmed = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    match trimmed.parse::<f64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(value = %trimmed, "ignoring unparsable GDAL_NODATA tag");
            None
        }
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let bytes = fs::read(&args.input).with_context(|| format!("Cannot read {}", args.input.display()))?;
    let mut decoder = Decoder::new(io::Cursor::new(bytes))
        .with_context(|| format!("{} is not a valid TIFF", args.input.display()))?;

    let band = decode_band(&mut decoder).with_context(|| format!("Cannot decode {}", args.input.display()))?;
    let geometry = read_geometry(&mut decoder, band.width, band.height, args.crs)
        .with_context(|| format!("Cannot georeference {}", args.input.display()))?;
    let nodata = args.nodata.or_else(|| read_nodata(&mut decoder));

    if let Some(v) = nodata {
        let representable = match band.element_type {
            ElementType::F32 | ElementType::F64 => true,
            et => v.fract() == 0.0 && et.fits(v as i64),
        };
        ensure!(representable, "nodata {v} is not representable as {:?}", band.element_type);
    } else {
        warn!(input = %args.input.display(), "no nodata value; every pixel counts as present");
    }

    let meta = RasterMeta::new(geometry, band.element_type, nodata);
    RawRaster::create(&args.output, &meta, &band.values)
        .with_context(|| format!("Cannot write {}", args.output.display()))?;

    info!(
        input = %args.input.display(),
        output = %args.output.display(),
        width = band.width,
        height = band.height,
        element_type = ?band.element_type,
        nodata = ?nodata,
        "layer written"
    );
    Ok(())
}
