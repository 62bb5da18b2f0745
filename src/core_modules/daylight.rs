// THEORY:
// The `daylight` module is the second extraction mode. Where sunlight mode counts
// lit pixels across a time series, daylight mode works on a single overcast-sky
// render per view and keeps every pixel:
//
// 1.  **Convert**: a rendered value is irradiance in W/m². Times the luminous
//     efficacy (179 lm/W) it is illuminance in lux; as a share of a 10 000 lux sky
//     it is the daylight factor in percent. The two factors fold into `x 1.79`.
// 2.  **Sample**: each AOI is rasterized with the same `RasterMask` as sunlight
//     mode, and every covered pixel is written, row-major, to `<stem>.wpd`:
//
//         total_pixels_in_polygon: <int>
//         pixel_x pixel_y illuminance df_percent
//         <x> <y> <lux> <df>
//
// 3.  **Summarize**: the files are read back and reduced to per-AOI statistics plus,
//     for each daylight-factor threshold, the pixels, share and area at or above it.
//
// A view is expected to carry exactly one frame. Extra frames are ignored with a
// warning; the first in sorted order is used.

use crate::core_modules::aoi::AreaOfInterest;
use crate::core_modules::frame_source::{FrameDecoder, FrameRaster};
use crate::core_modules::raster_mask::RasterMask;
use crate::core_modules::report::{escape, format_area};
use crate::core_modules::view_grouper::ViewGroup;
use crate::core_modules::wpd_writer::{
    SeriesScan, TOTAL_PIXELS_PREFIX, read_series_directory, wpd_path_for, write_atomic,
};
use crate::error::{WpdError, WpdResult};
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lumens per watt for the Radiance white-light convention.
pub const LUMINOUS_EFFICACY: f64 = 179.0;
const REFERENCE_SKY_LUX: f64 = 10_000.0;

pub const DEFAULT_DF_THRESHOLDS: [f64; 3] = [0.5, 1.0, 2.0];
pub const DAYLIGHT_SUMMARY_FILE: &str = "daylight_factor_summary.csv";
const COLUMN_HEADER: &str = "pixel_x pixel_y illuminance df_percent";

pub fn illuminance_lux(value: f32) -> f64 {
    f64::from(value) * LUMINOUS_EFFICACY
}

pub fn daylight_factor_percent(illuminance: f64) -> f64 {
    illuminance * 100.0 / REFERENCE_SKY_LUX
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DaylightPixel {
    pub x: u32,
    pub y: u32,
    pub illuminance: f64,
    pub df_percent: f64,
}

/// One AOI's per-pixel daylight values.
#[derive(Debug, Clone, PartialEq)]
pub struct DaylightSeries {
    pub aoi_name: String,
    pub total_pixels: u64,
    pub pixels: Vec<DaylightPixel>,
}

impl DaylightSeries {
    /// Reads every pixel of `mask` out of `raster`. Both share one resolution.
    pub fn sample(aoi_name: &str, mask: &RasterMask, raster: &FrameRaster) -> Self {
        let width = raster.width as usize;
        let pixels = mask
            .bits
            .iter_ones()
            .map(|(x, y)| {
                let illuminance = illuminance_lux(raster.values[y as usize * width + x as usize]);
                DaylightPixel {
                    x,
                    y,
                    illuminance,
                    df_percent: daylight_factor_percent(illuminance),
                }
            })
            .collect();
        Self {
            aoi_name: aoi_name.to_string(),
            total_pixels: mask.total_pixels,
            pixels,
        }
    }
}

pub fn format_daylight_series(series: &DaylightSeries) -> String {
    let mut out = String::with_capacity(64 + series.pixels.len() * 32);
    let _ = writeln!(out, "{TOTAL_PIXELS_PREFIX} {}", series.total_pixels);
    let _ = writeln!(out, "{COLUMN_HEADER}");
    for p in &series.pixels {
        let _ = writeln!(out, "{} {} {:.4} {:.4}", p.x, p.y, p.illuminance, p.df_percent);
    }
    out
}

pub fn parse_daylight_wpd(aoi_name: &str, text: &str) -> Result<DaylightSeries, String> {
    let mut lines = text.lines();
    let total_pixels = lines
        .next()
        .and_then(|l| l.strip_prefix(TOTAL_PIXELS_PREFIX))
        .ok_or_else(|| format!("first line must start with '{TOTAL_PIXELS_PREFIX}'"))?
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("total pixel count: {e}"))?;
    if lines.next().map(str::trim) != Some(COLUMN_HEADER) {
        return Err(format!("second line must be '{COLUMN_HEADER}'"));
    }

    let mut pixels = Vec::new();
    for (offset, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let line_no = offset + 3;
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [x, y, illuminance, df_percent] = fields[..] else {
            return Err(format!("line {line_no}: expected 4 fields, got {}", fields.len()));
        };
        let bad = |what: &str| format!("line {line_no}: invalid {what}");
        pixels.push(DaylightPixel {
            x: x.parse().map_err(|_| bad("pixel_x"))?,
            y: y.parse().map_err(|_| bad("pixel_y"))?,
            illuminance: illuminance.parse().map_err(|_| bad("illuminance"))?,
            df_percent: df_percent.parse().map_err(|_| bad("df_percent"))?,
        });
    }
    Ok(DaylightSeries {
        aoi_name: aoi_name.to_string(),
        total_pixels,
        pixels,
    })
}

pub fn read_daylight_file(path: &Path) -> WpdResult<DaylightSeries> {
    let aoi_name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| WpdError::wpd_format(path, "no file stem"))?;
    let text = fs::read_to_string(path)?;
    parse_daylight_wpd(&aoi_name, &text).map_err(|message| WpdError::wpd_format(path, message))
}

/// Every daylight `.wpd` in `dir`. Files in another layout are reported, not fatal.
pub fn read_daylight_directory(dir: &Path) -> WpdResult<SeriesScan<DaylightSeries>> {
    read_series_directory(dir, read_daylight_file)
}

/// What one view produced.
#[derive(Debug, Default)]
pub struct DaylightViewResult {
    pub view_id: String,
    pub evaluated_aois: Vec<String>,
    pub series_written: usize,
    pub pixels_written: usize,
    pub errors: Vec<WpdError>,
}

/// Extracts daylight series for whole view groups.
pub struct DaylightExtractor {
    decoder: Arc<dyn FrameDecoder>,
    output_dir: PathBuf,
}

impl DaylightExtractor {
    pub fn new(decoder: Arc<dyn FrameDecoder>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            decoder,
            output_dir: output_dir.into(),
        }
    }

    pub fn extract_view(&self, group: &ViewGroup) -> DaylightViewResult {
        let mut result = DaylightViewResult {
            view_id: group.view_id.clone(),
            ..DaylightViewResult::default()
        };

        let mut aois: Vec<AreaOfInterest> = Vec::with_capacity(group.aois.len());
        for aoi_file in &group.aois {
            match aoi_file.load() {
                Ok(aoi) => aois.push(aoi),
                Err(err) => {
                    warn!(view = %group.view_id, error = %err, "skipping AOI");
                    result.errors.push(err);
                }
            }
        }

        let Some(frame) = group.frames.first() else {
            result.errors.push(WpdError::Grouping(format!(
                "view {} has AOIs but no frames",
                group.view_id
            )));
            return result;
        };
        if group.frames.len() > 1 {
            warn!(
                view = %group.view_id,
                frames = group.frames.len(),
                using = %frame.file_name,
                "daylight view has more than one frame, using the first"
            );
        }
        let raster = match self.decoder.decode(&frame.path) {
            Ok(raster) => raster,
            Err(err) => {
                warn!(view = %group.view_id, frame = %frame.file_name, error = %err, "skipping view");
                result.errors.push(err);
                return result;
            }
        };

        for aoi in &aois {
            let mask = RasterMask::from_polygon(&aoi.polygon, raster.width, raster.height);
            if mask.total_pixels == 0 {
                warn!(aoi = %aoi.name, "polygon covers no pixels at {}x{}", raster.width, raster.height);
                continue;
            }
            let series = DaylightSeries::sample(&aoi.name, &mask, &raster);
            result.evaluated_aois.push(aoi.name.clone());

            let path = wpd_path_for(&self.output_dir, &aoi.name);
            match write_atomic(&path, &format_daylight_series(&series)) {
                Ok(()) => {
                    result.series_written += 1;
                    result.pixels_written += series.pixels.len();
                    debug!(aoi = %aoi.name, pixels = series.pixels.len(), "wrote daylight series");
                }
                Err(err) => {
                    warn!(aoi = %aoi.name, error = %err, "failed to write daylight series");
                    result.errors.push(err);
                }
            }
        }
        result
    }
}

/// Pixels, share and area at or above one daylight-factor threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdCoverage {
    pub threshold: f64,
    pub pixels: u64,
    /// Percent of `total_pixels`, two decimals.
    pub percent_area: f64,
    pub area: f64,
}

/// Per-AOI statistics over one daylight series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaylightStats {
    pub aoi_name: String,
    pub total_pixels: u64,
    pub area: f64,
    pub mean_illuminance: f64,
    pub min_illuminance: f64,
    pub max_illuminance: f64,
    pub mean_df_percent: f64,
    pub min_df_percent: f64,
    pub max_df_percent: f64,
    pub median_df_percent: f64,
    pub coverage: Vec<ThresholdCoverage>,
}

impl DaylightStats {
    /// `None` for a series without pixel rows.
    pub fn from_series(series: &DaylightSeries, area_per_pixel: f64, thresholds: &[f64]) -> Option<Self> {
        if series.pixels.is_empty() {
            return None;
        }
        let count = series.pixels.len() as f64;
        let illuminance: Vec<f64> = series.pixels.iter().map(|p| p.illuminance).collect();
        let mut df: Vec<f64> = series.pixels.iter().map(|p| p.df_percent).collect();
        df.sort_by(f64::total_cmp);

        let coverage = thresholds
            .iter()
            .map(|&threshold| {
                let pixels = df.iter().filter(|v| **v >= threshold).count() as u64;
                let percent_area = if series.total_pixels > 0 {
                    round_to(pixels as f64 / series.total_pixels as f64 * 100.0, 2)
                } else {
                    0.0
                };
                ThresholdCoverage {
                    threshold,
                    pixels,
                    percent_area,
                    area: round_to(pixels as f64 * area_per_pixel, 4),
                }
            })
            .collect();

        Some(Self {
            aoi_name: series.aoi_name.clone(),
            total_pixels: series.total_pixels,
            area: round_to(series.total_pixels as f64 * area_per_pixel, 4),
            mean_illuminance: round_to(illuminance.iter().sum::<f64>() / count, 2),
            min_illuminance: round_to(illuminance.iter().copied().fold(f64::INFINITY, f64::min), 2),
            max_illuminance: round_to(illuminance.iter().copied().fold(f64::NEG_INFINITY, f64::max), 2),
            mean_df_percent: round_to(df.iter().sum::<f64>() / count, 4),
            min_df_percent: round_to(df[0], 4),
            max_df_percent: round_to(df[df.len() - 1], 4),
            median_df_percent: round_to(median_of_sorted(&df), 4),
            coverage,
        })
    }
}

/// Statistics for every readable series, ordered by AOI name.
pub fn summarize(series: &[DaylightSeries], area_per_pixel: f64, thresholds: &[f64]) -> Vec<DaylightStats> {
    let mut stats: Vec<DaylightStats> = series
        .iter()
        .filter_map(|s| DaylightStats::from_series(s, area_per_pixel, thresholds))
        .collect();
    stats.sort_by(|a, b| a.aoi_name.cmp(&b.aoi_name));
    stats
}

pub fn summary_csv(stats: &[DaylightStats], thresholds: &[f64]) -> String {
    let mut out = String::from(
        "aoi,total_pixels,area,mean_illuminance_lux,min_illuminance_lux,max_illuminance_lux,\
         mean_df_percent,min_df_percent,max_df_percent,median_df_percent",
    );
    for t in thresholds {
        let _ = write!(
            out,
            ",pixels_df_gte_{t}pct,pct_area_df_gte_{t}pct,area_df_gte_{t}pct"
        );
    }
    out.push('\n');

    for s in stats {
        let _ = write!(
            out,
            "{},{},{},{},{},{},{},{},{},{}",
            escape(&s.aoi_name),
            s.total_pixels,
            format_area(s.area),
            s.mean_illuminance,
            s.min_illuminance,
            s.max_illuminance,
            s.mean_df_percent,
            s.min_df_percent,
            s.max_df_percent,
            s.median_df_percent
        );
        for c in &s.coverage {
            let _ = write!(out, ",{},{},{}", c.pixels, c.percent_area, format_area(c.area));
        }
        out.push('\n');
    }
    out
}

pub fn write_summary_csv(stats: &[DaylightStats], thresholds: &[f64], dir: &Path) -> WpdResult<PathBuf> {
    let path = dir.join(DAYLIGHT_SUMMARY_FILE);
    fs::write(&path, summary_csv(stats, thresholds))?;
    info!(path = %path.display(), aois = stats.len(), "wrote daylight factor summary");
    Ok(path)
}

fn median_of_sorted(values: &[f64]) -> f64 {
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}
