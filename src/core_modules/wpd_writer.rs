// THEORY:
// The `wpd_writer` is the Time-Series Writer and the only component allowed to
// create or overwrite `.wpd` files. Records from every chunk are merged per AOI,
// sorted by frame id, and persisted one file per AOI.
//
// Determinism comes from the merge, not from the workers: chunks finish in any
// order, but `merge` sorts each series by `(frame_id, passing_pixels)` so the bytes
// written never depend on completion order or worker count.
//
// File format:
//     total_pixels_in_polygon: <int>
//     frame_id passing_pixels
//     <frame_id> <int>
//     ...

use crate::core_modules::exposure::WpdRecord;
use crate::error::{WpdError, WpdResult};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const WPD_EXTENSION: &str = "wpd";
pub(crate) const TOTAL_PIXELS_PREFIX: &str = "total_pixels_in_polygon:";
const COLUMN_HEADER: &str = "frame_id passing_pixels";

/// Where the series for `aoi_name` lives.
pub fn wpd_path_for(output_dir: &Path, aoi_name: &str) -> PathBuf {
    output_dir.join(format!("{aoi_name}.{WPD_EXTENSION}"))
}

/// One AOI's time series, ascending by frame id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WpdSeries {
    pub aoi_name: String,
    pub total_pixels: u64,
    pub records: Vec<WpdRecord>,
}

impl WpdSeries {
    pub fn frame_ids(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.frame_id.as_str())
    }
}

pub struct TimeSeriesWriter {
    output_dir: PathBuf,
}

impl TimeSeriesWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> WpdResult<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)?;
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Groups records by AOI and sorts each group. Series come back in AOI-name order.
    pub fn merge(records: impl IntoIterator<Item = WpdRecord>) -> Vec<WpdSeries> {
        let mut by_aoi: BTreeMap<String, Vec<WpdRecord>> = BTreeMap::new();
        for record in records {
            by_aoi.entry(record.aoi_name.clone()).or_default().push(record);
        }

        by_aoi
            .into_iter()
            .map(|(aoi_name, mut records)| {
                records.sort_by(|a, b| {
                    a.frame_id
                        .cmp(&b.frame_id)
                        .then(a.passing_pixels.cmp(&b.passing_pixels))
                });
                let total_pixels = records.first().map_or(0, |r| r.total_pixels);
                WpdSeries {
                    aoi_name,
                    total_pixels,
                    records,
                }
            })
            .collect()
    }

    /// Writes one series. An empty series is a no-op and returns `Ok(None)`.
    ///
    /// The file is written next to its destination and renamed into place, so a
    /// crash never leaves a truncated `.wpd` for the skip check to trust.
    pub fn write_series(&self, series: &WpdSeries) -> WpdResult<Option<PathBuf>> {
        if series.records.is_empty() {
            return Ok(None);
        }
        let path = wpd_path_for(&self.output_dir, &series.aoi_name);
        write_atomic(&path, &format_series(series))?;
        debug!(aoi = %series.aoi_name, records = series.records.len(), "wrote series");
        Ok(Some(path))
    }
}

/// Writes `body` to `<path>.tmp` and renames it over `path`.
pub fn write_atomic(path: &Path, body: &str) -> WpdResult<()> {
    let staging = path.with_extension(format!("{WPD_EXTENSION}.tmp"));
    fs::write(&staging, body)?;
    fs::rename(&staging, path)?;
    Ok(())
}

pub fn format_series(series: &WpdSeries) -> String {
    let mut out = String::with_capacity(64 + series.records.len() * 32);
    let _ = writeln!(out, "{TOTAL_PIXELS_PREFIX} {}", series.total_pixels);
    let _ = writeln!(out, "{COLUMN_HEADER}");
    for record in &series.records {
        let _ = writeln!(out, "{} {}", record.frame_id, record.passing_pixels);
    }
    out
}

/// Reads a `.wpd` file back. The AOI name is the file stem.
pub fn read_wpd_file(path: &Path) -> WpdResult<WpdSeries> {
    let aoi_name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| WpdError::wpd_format(path, "no file stem"))?;
    let text = fs::read_to_string(path)?;
    parse_wpd(&aoi_name, &text).map_err(|message| WpdError::wpd_format(path, message))
}

pub fn parse_wpd(aoi_name: &str, text: &str) -> Result<WpdSeries, String> {
    let mut lines = text.lines();

    let total_pixels = lines
        .next()
        .and_then(|l| l.trim().strip_prefix(TOTAL_PIXELS_PREFIX))
        .ok_or_else(|| format!("first line must start with `{TOTAL_PIXELS_PREFIX}`"))?
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("bad total pixel count: {e}"))?;

    match lines.next().map(str::trim) {
        Some(COLUMN_HEADER) => {}
        other => return Err(format!("expected `{COLUMN_HEADER}`, found {other:?}")),
    }

    let mut records = Vec::new();
    for (n, line) in lines.enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (frame_id, count) = line
            .rsplit_once(char::is_whitespace)
            .ok_or_else(|| format!("record {}: expected `<frame_id> <count>`", n + 1))?;
        let passing_pixels = count
            .parse::<u64>()
            .map_err(|e| format!("record {}: {e}", n + 1))?;
        if passing_pixels > total_pixels {
            return Err(format!(
                "record {}: {passing_pixels} passing pixels exceeds total {total_pixels}",
                n + 1
            ));
        }
        records.push(WpdRecord {
            aoi_name: aoi_name.to_string(),
            frame_id: frame_id.trim_end().to_string(),
            total_pixels,
            passing_pixels,
        });
    }

    Ok(WpdSeries {
        aoi_name: aoi_name.to_string(),
        total_pixels,
        records,
    })
}

/// What a directory read produced. A file that fails to parse costs only itself.
#[derive(Debug)]
pub struct SeriesScan<S = WpdSeries> {
    pub series: Vec<S>,
    pub errors: Vec<WpdError>,
}

impl<S> Default for SeriesScan<S> {
    fn default() -> Self {
        Self {
            series: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Every `.wpd` series in `dir`, in file-name order. Only a failure to list the
/// directory itself is an `Err`.
pub fn read_wpd_directory(dir: &Path) -> WpdResult<SeriesScan> {
    read_series_directory(dir, read_wpd_file)
}

/// Runs `read` over every `.wpd` file in `dir`, in file-name order, keeping the
/// failures apart from the series that parsed.
pub fn read_series_directory<S>(
    dir: &Path,
    read: impl Fn(&Path) -> WpdResult<S>,
) -> WpdResult<SeriesScan<S>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(WPD_EXTENSION))
        })
        .collect();
    paths.sort();

    let mut scan = SeriesScan::default();
    for path in &paths {
        match read(path.as_path()) {
            Ok(series) => scan.series.push(series),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable series");
                scan.errors.push(err);
            }
        }
    }
    Ok(scan)
}
