// THEORY:
// The `aoi` module is the AOI Store. An area of interest is a named polygon in the
// pixel space of exactly one view. AOI definition files are plain text:
//
//   line 1  AOI Points File: <display name>
//   line 2  ASSOCIATED VIEW FILE: <view>.vp
//   line 3  auxiliary metadata (floor level)
//   line 4  CENTRAL x,y: <cx> <cy>
//   line 5  column header / vertex count
//   line 6+ world_x world_y pixel_x pixel_y
//
// Loading is split in two. Grouping only needs the view id, so `AoiFile` reads the
// header lazily and cheaply. The full polygon is parsed later, inside the chunk that
// owns the AOI, so a malformed vertex list costs exactly one AOI and nothing else.
//
// The output identity of an AOI is its file stem: `<stem>.aoi` always maps to
// `<stem>.wpd`, independent of the display name written inside the file.

use crate::error::{WpdError, WpdResult};
use std::fs;
use std::path::{Path, PathBuf};

pub const AOI_EXTENSION: &str = "aoi";

const NAME_MARKER: &str = "AOI Points File:";
const VIEW_MARKER: &str = "ASSOCIATED VIEW FILE:";
const CENTROID_MARKER: &str = "CENTRAL x,y:";
const VIEW_FILE_SUFFIX: &str = ".vp";
const HEADER_LINES: usize = 5;

/// Largest accepted pixel coordinate magnitude. Anything further out is corrupt input.
pub const MAX_PIXEL_COORDINATE: i64 = 1 << 24;

/// A single vertex in pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelPoint {
    pub x: i64,
    pub y: i64,
}

/// A handle to an AOI definition on disk. Cheap to clone and move between workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AoiFile {
    /// The file stem, used as the output key.
    pub name: String,
    pub path: PathBuf,
}

/// A fully parsed, immutable area of interest.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaOfInterest {
    /// The output key (file stem).
    pub name: String,
    /// The human-readable label from line 1, falling back to `name`.
    pub display_name: String,
    /// The view whose pixel space the polygon is expressed in.
    pub view_id: String,
    /// Polygon vertices in authoring order. Not explicitly closed.
    pub polygon: Vec<PixelPoint>,
    /// Label point recorded by the authoring tool, when present.
    pub centroid: Option<(f64, f64)>,
}

impl AoiFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { name, path }
    }

    /// Reads just enough of the file to recover the associated view id.
    pub fn read_view_id(&self) -> WpdResult<String> {
        let text = fs::read_to_string(&self.path)?;
        view_id_from_header(&text).ok_or_else(|| {
            WpdError::Grouping(format!(
                "could not extract view file from {}",
                self.path.display()
            ))
        })
    }

    pub fn load(&self) -> WpdResult<AreaOfInterest> {
        let text = fs::read_to_string(&self.path)
            .map_err(|e| WpdError::aoi_parse(&self.path, e.to_string()))?;
        AreaOfInterest::parse(&self.name, &text)
            .map_err(|message| WpdError::aoi_parse(&self.path, message))
    }
}

impl AreaOfInterest {
    /// Parses AOI text. Errors carry a plain message; callers attach the path.
    pub fn parse(name: &str, text: &str) -> Result<Self, String> {
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() < HEADER_LINES {
            return Err(format!(
                "expected at least {HEADER_LINES} header lines, found {}",
                lines.len()
            ));
        }

        let view_id = view_id_from_header(text)
            .ok_or_else(|| "missing ASSOCIATED VIEW FILE on line 2".to_string())?;

        let display_name = lines[0]
            .split_once(NAME_MARKER)
            .map(|(_, rest)| rest.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| name.to_string());

        let centroid = lines[3].split_once(CENTROID_MARKER).and_then(|(_, rest)| {
            let mut fields = rest.split_whitespace().map(str::parse::<f64>);
            match (fields.next(), fields.next()) {
                (Some(Ok(x)), Some(Ok(y))) => Some((x, y)),
                _ => None,
            }
        });

        let mut polygon = Vec::new();
        for (offset, line) in lines[HEADER_LINES..].iter().enumerate() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                continue;
            }
            let line_no = HEADER_LINES + offset + 1;
            let x = parse_pixel_coordinate(fields[2])
                .ok_or_else(|| format!("line {line_no}: invalid pixel x '{}'", fields[2]))?;
            let y = parse_pixel_coordinate(fields[3])
                .ok_or_else(|| format!("line {line_no}: invalid pixel y '{}'", fields[3]))?;
            polygon.push(PixelPoint { x, y });
        }

        let usable = usable_vertex_count(&polygon);
        if usable < 3 {
            return Err(format!(
                "polygon needs at least 3 distinct vertices, found {usable}"
            ));
        }

        Ok(Self {
            name: name.to_string(),
            display_name,
            view_id,
            polygon,
            centroid,
        })
    }
}

/// Lists every `.aoi` file in `dir`, sorted by file name.
pub fn scan_aoi_directory(dir: &Path) -> WpdResult<Vec<AoiFile>> {
    if !dir.is_dir() {
        return Err(WpdError::MissingDirectory(dir.to_path_buf()));
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_aoi = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(AOI_EXTENSION));
        if path.is_file() && is_aoi {
            files.push(AoiFile::new(path));
        }
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn view_id_from_header(text: &str) -> Option<String> {
    let line = text.lines().nth(1)?;
    let (_, rest) = line.split_once(VIEW_MARKER)?;
    let view = rest.trim();
    let view = view.strip_suffix(VIEW_FILE_SUFFIX).unwrap_or(view).trim();
    (!view.is_empty()).then(|| view.to_string())
}

/// Accepts integers and integer-valued floats ("12", "12.0") within
/// `MAX_PIXEL_COORDINATE` of the origin.
fn parse_pixel_coordinate(field: &str) -> Option<i64> {
    let value = match field.parse::<i64>() {
        Ok(value) => value,
        Err(_) => {
            let value = field.parse::<f64>().ok()?;
            if !value.is_finite() || value.fract() != 0.0 {
                return None;
            }
            value as i64
        }
    };
    (value.abs() <= MAX_PIXEL_COORDINATE).then_some(value)
}

/// Vertices left after dropping consecutive repeats and an explicit closing vertex.
fn usable_vertex_count(polygon: &[PixelPoint]) -> usize {
    let mut distinct: Vec<PixelPoint> = Vec::with_capacity(polygon.len());
    for point in polygon {
        if distinct.last() != Some(point) {
            distinct.push(*point);
        }
    }
    if distinct.len() > 1 && distinct.first() == distinct.last() {
        distinct.pop();
    }
    distinct.len()
}
