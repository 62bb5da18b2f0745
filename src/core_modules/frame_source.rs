// THEORY:
// The `frame_source` module is the Frame Store. A frame is one rendered raster for a
// view at one time sample. The rest of the engine only ever sees a flat, row-major
// `Vec<f32>` plus a width and height, so every on-disk encoding is hidden behind the
// `FrameDecoder` capability:
//
// 1.  **Image formats** (Radiance `.hdr`/`.pic`, TIFF, OpenEXR, PNG) go through the
//     `image` crate and are reduced to a scalar with Radiance's brightness weights.
// 2.  **Portable Float Maps** are parsed directly; rows are stored bottom-up on disk
//     and are flipped to the top-down order every other raster uses.
// 3.  **Raw float dumps** carry no header at all, so their size has to be configured.
//
// `FrameDecoders` owns one adapter per encoding and dispatches on file extension.
// It is itself a `FrameDecoder`, so workers hold a single `Arc<dyn FrameDecoder>`.

use crate::error::{WpdError, WpdResult};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

// Radiance `bright()` coefficients; `pvalue -b` emits exactly this weighting.
const BRIGHT_RED: f32 = 0.265_074_13;
const BRIGHT_GREEN: f32 = 0.670_114_6;
const BRIGHT_BLUE: f32 = 0.064_811_24;

const PFM_HEADER_PROBE_BYTES: usize = 128;

/// A decoded frame: one scalar per pixel, row-major, top row first.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRaster {
    pub width: u32,
    pub height: u32,
    pub values: Vec<f32>,
}

impl FrameRaster {
    pub fn new(width: u32, height: u32, values: Vec<f32>) -> WpdResult<Self> {
        let expected = width as usize * height as usize;
        if values.len() != expected {
            return Err(WpdError::Config(format!(
                "raster of {width}x{height} needs {expected} values, got {}",
                values.len()
            )));
        }
        Ok(Self {
            width,
            height,
            values,
        })
    }
}

/// A frame on disk, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHandle {
    pub path: PathBuf,
    /// Bare file name, used for view matching.
    pub file_name: String,
    /// Normalized, sortable label written to WPD output.
    pub frame_id: String,
}

impl FrameHandle {
    pub fn new(path: impl Into<PathBuf>, marker: &str) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let frame_id = normalize_frame_id(&file_name, marker);
        Self {
            path,
            file_name,
            frame_id,
        }
    }
}

/// Drops everything before the first `marker` so labels survive differently
/// prefixed render outputs (`modelA_plan_L1_0900.hdr` -> `plan_L1_0900.hdr`).
pub fn normalize_frame_id(file_name: &str, marker: &str) -> String {
    if marker.is_empty() {
        return file_name.to_string();
    }
    match file_name.split_once(marker) {
        Some((_, rest)) => format!("{marker}{rest}"),
        None => file_name.to_string(),
    }
}

/// The capability every raster encoding has to provide.
pub trait FrameDecoder: Send + Sync {
    /// Width and height, read as cheaply as the encoding allows.
    fn dimensions(&self, path: &Path) -> WpdResult<(u32, u32)>;

    fn decode(&self, path: &Path) -> WpdResult<FrameRaster>;
}

/// Supported encodings, keyed by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Image,
    Pfm,
    Raw,
}

impl FrameFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
        match ext.as_str() {
            "hdr" | "pic" | "tif" | "tiff" | "exr" | "png" => Some(Self::Image),
            "pfm" => Some(Self::Pfm),
            "raw" | "bin" => Some(Self::Raw),
            _ => None,
        }
    }
}

/// Decodes anything the `image` crate understands into Radiance brightness.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageFrameDecoder;

impl FrameDecoder for ImageFrameDecoder {
    fn dimensions(&self, path: &Path) -> WpdResult<(u32, u32)> {
        let reader = image::ImageReader::open(path)?.with_guessed_format()?;
        Ok(reader.into_dimensions()?)
    }

    fn decode(&self, path: &Path) -> WpdResult<FrameRaster> {
        let image = image::ImageReader::open(path)?
            .with_guessed_format()?
            .decode()?
            .into_rgb32f();
        let (width, height) = image.dimensions();
        let values = image
            .pixels()
            .map(|p| brightness(p.0[0], p.0[1], p.0[2]))
            .collect();
        FrameRaster::new(width, height, values)
    }
}

/// Portable Float Map (`PF` colour, `Pf` greyscale).
#[derive(Debug, Default, Clone, Copy)]
pub struct PfmFrameDecoder;

#[derive(Debug, Clone, Copy, PartialEq)]
struct PfmHeader {
    channels: usize,
    width: u32,
    height: u32,
    little_endian: bool,
    data_offset: usize,
}

impl FrameDecoder for PfmFrameDecoder {
    fn dimensions(&self, path: &Path) -> WpdResult<(u32, u32)> {
        let mut probe = Vec::with_capacity(PFM_HEADER_PROBE_BYTES);
        File::open(path)?
            .take(PFM_HEADER_PROBE_BYTES as u64)
            .read_to_end(&mut probe)?;
        let header = parse_pfm_header(&probe).map_err(|m| WpdError::decode(path, m))?;
        Ok((header.width, header.height))
    }

    fn decode(&self, path: &Path) -> WpdResult<FrameRaster> {
        let bytes = fs::read(path)?;
        decode_pfm(&bytes).map_err(|m| WpdError::decode(path, m))
    }
}

/// Headerless little-endian `f32` stream with an externally known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrameDecoder {
    pub width: u32,
    pub height: u32,
}

impl FrameDecoder for RawFrameDecoder {
    fn dimensions(&self, _path: &Path) -> WpdResult<(u32, u32)> {
        Ok((self.width, self.height))
    }

    fn decode(&self, path: &Path) -> WpdResult<FrameRaster> {
        let bytes = fs::read(path)?;
        let expected = self.width as usize * self.height as usize * 4;
        if bytes.len() != expected {
            return Err(WpdError::decode(
                path,
                format!("expected {expected} bytes, got {}", bytes.len()),
            ));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        FrameRaster::new(self.width, self.height, values)
    }
}

/// Extension-dispatching decoder over every supported encoding.
#[derive(Debug, Default, Clone)]
pub struct FrameDecoders {
    image: ImageFrameDecoder,
    pfm: PfmFrameDecoder,
    raw: Option<RawFrameDecoder>,
}

impl FrameDecoders {
    pub fn new(raw_frame_size: Option<(u32, u32)>) -> Self {
        Self {
            raw: raw_frame_size.map(|(width, height)| RawFrameDecoder { width, height }),
            ..Self::default()
        }
    }

    fn select(&self, path: &Path) -> WpdResult<&dyn FrameDecoder> {
        match FrameFormat::from_path(path) {
            Some(FrameFormat::Image) => Ok(&self.image),
            Some(FrameFormat::Pfm) => Ok(&self.pfm),
            Some(FrameFormat::Raw) => match &self.raw {
                Some(raw) => Ok(raw),
                None => Err(WpdError::decode(
                    path,
                    "raw frames need a configured raw_frame_size",
                )),
            },
            None => Err(WpdError::decode(path, "unsupported frame encoding")),
        }
    }
}

impl FrameDecoder for FrameDecoders {
    fn dimensions(&self, path: &Path) -> WpdResult<(u32, u32)> {
        self.select(path)?.dimensions(path)
    }

    fn decode(&self, path: &Path) -> WpdResult<FrameRaster> {
        self.select(path)?.decode(path)
    }
}

/// Lists every supported frame in `dir`, sorted by file name.
pub fn scan_frame_directory(dir: &Path, marker: &str) -> WpdResult<Vec<FrameHandle>> {
    if !dir.is_dir() {
        return Err(WpdError::MissingDirectory(dir.to_path_buf()));
    }
    let mut frames = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && FrameFormat::from_path(&path).is_some() {
            frames.push(FrameHandle::new(path, marker));
        }
    }
    frames.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(frames)
}

fn brightness(red: f32, green: f32, blue: f32) -> f32 {
    BRIGHT_RED * red + BRIGHT_GREEN * green + BRIGHT_BLUE * blue
}

fn parse_pfm_header(bytes: &[u8]) -> Result<PfmHeader, String> {
    let mut cursor = 0usize;
    let mut next_token = || -> Result<String, String> {
        while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        let start = cursor;
        while cursor < bytes.len() && !bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        if start == cursor {
            return Err("truncated PFM header".to_string());
        }
        Ok(String::from_utf8_lossy(&bytes[start..cursor]).into_owned())
    };

    let channels = match next_token()?.as_str() {
        "PF" => 3,
        "Pf" => 1,
        other => return Err(format!("not a PFM file (magic '{other}')")),
    };
    let width: u32 = next_token()?
        .parse()
        .map_err(|_| "invalid PFM width".to_string())?;
    let height: u32 = next_token()?
        .parse()
        .map_err(|_| "invalid PFM height".to_string())?;
    let scale: f32 = next_token()?
        .parse()
        .map_err(|_| "invalid PFM scale".to_string())?;
    if width == 0 || height == 0 {
        return Err(format!("empty PFM raster ({width}x{height})"));
    }

    // Exactly one whitespace byte separates the scale from the pixel data.
    Ok(PfmHeader {
        channels,
        width,
        height,
        little_endian: scale < 0.0,
        data_offset: cursor + 1,
    })
}

fn decode_pfm(bytes: &[u8]) -> Result<FrameRaster, String> {
    let header = parse_pfm_header(bytes)?;
    let width = header.width as usize;
    let height = header.height as usize;
    let row_floats = width * header.channels;
    let expected = row_floats
        .checked_mul(height)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| format!("PFM raster of {width}x{height} is too large"))?;
    let data = bytes.get(header.data_offset..).unwrap_or_default();
    if data.len() < expected {
        return Err(format!(
            "expected {expected} bytes of pixel data, got {}",
            data.len()
        ));
    }

    let read = |b: &[u8]| {
        let word = [b[0], b[1], b[2], b[3]];
        if header.little_endian {
            f32::from_le_bytes(word)
        } else {
            f32::from_be_bytes(word)
        }
    };

    let mut values = vec![0.0f32; width * height];
    for (disk_row, row_bytes) in data[..expected].chunks_exact(row_floats * 4).enumerate() {
        let y = height - 1 - disk_row;
        let floats: Vec<f32> = row_bytes.chunks_exact(4).map(read).collect();
        for x in 0..width {
            values[y * width + x] = match header.channels {
                1 => floats[x],
                _ => brightness(floats[3 * x], floats[3 * x + 1], floats[3 * x + 2]),
            };
        }
    }

    FrameRaster::new(header.width, header.height, values).map_err(|e| e.to_string())
}
