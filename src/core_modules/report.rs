// THEORY:
// The `report` module is the Report Assembler, a thin presentation layer. It joins
// every AOI's series and compliance result into three CSV tables:
//
// - `wpd_combined.csv`: one row per (AOI, frame) with the derived passing area.
// - `compliance_detail.csv`: one row per AOI, its run and duration, then one
//   passing-area column per frame id seen anywhere in the run.
// - `compliance_summary.csv`: duration pivoted by group (AOI name before the first
//   `_`) and sub-zone (the remainder). Missing cells are 0.
//
// Durations are scored against each AOI's view timeline when one is known, so a
// frame the AOI has no record for counts as a miss rather than disappearing.
//
// Rows are ordered by AOI name and columns by frame id or sub-zone name, so two
// reports over the same series are byte-identical.

use crate::core_modules::compliance::{ComplianceAnalyzer, ComplianceResult};
use crate::core_modules::wpd_writer::WpdSeries;
use crate::error::WpdResult;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const COMBINED_FILE: &str = "wpd_combined.csv";
pub const DETAIL_FILE: &str = "compliance_detail.csv";
pub const SUMMARY_FILE: &str = "compliance_summary.csv";

const GROUP_SEPARATOR: char = '_';

/// One (AOI, frame) row of the combined table.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub aoi_name: String,
    pub frame_id: String,
    pub total_pixels: u64,
    pub passing_pixels: u64,
    pub passing_area: f64,
}

/// Group x sub-zone table of compliance durations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryPivot {
    pub sub_zones: BTreeSet<String>,
    pub cells: BTreeMap<String, BTreeMap<String, f64>>,
}

impl SummaryPivot {
    pub fn insert(&mut self, aoi_name: &str, duration_hours: f64) {
        let (group, sub_zone) = split_group(aoi_name);
        self.sub_zones.insert(sub_zone.to_string());
        // First value wins when two AOIs collapse onto the same cell.
        self.cells
            .entry(group.to_string())
            .or_default()
            .entry(sub_zone.to_string())
            .or_insert(duration_hours);
    }

    pub fn get(&self, group: &str, sub_zone: &str) -> f64 {
        self.cells
            .get(group)
            .and_then(|row| row.get(sub_zone))
            .copied()
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComplianceReport {
    pub rows: Vec<ReportRow>,
    pub results: Vec<ComplianceResult>,
    pub pivot: SummaryPivot,
    /// Every frame id across all series, sorted.
    pub frame_ids: Vec<String>,
    /// Passing area per AOI per frame id, for the detail table.
    areas: BTreeMap<String, BTreeMap<String, f64>>,
}

/// `"U1_Bed_2"` -> `("U1", "Bed_2")`. Names without a separator form their own group.
pub fn split_group(aoi_name: &str) -> (&str, &str) {
    aoi_name
        .split_once(GROUP_SEPARATOR)
        .unwrap_or((aoi_name, ""))
}

pub struct ReportAssembler {
    analyzer: ComplianceAnalyzer,
    timelines: BTreeMap<String, Arc<[String]>>,
}

impl ReportAssembler {
    pub fn new(analyzer: ComplianceAnalyzer) -> Self {
        Self {
            analyzer,
            timelines: BTreeMap::new(),
        }
    }

    /// Full frame lists keyed by AOI name. AOIs without one are scored on their own records.
    pub fn with_timelines(mut self, timelines: BTreeMap<String, Arc<[String]>>) -> Self {
        self.timelines = timelines;
        self
    }

    pub fn assemble(&self, series: &[WpdSeries]) -> ComplianceReport {
        let mut sorted: Vec<&WpdSeries> = series.iter().collect();
        sorted.sort_by(|a, b| a.aoi_name.cmp(&b.aoi_name));

        let mut report = ComplianceReport::default();
        let mut frame_ids = BTreeSet::new();

        for s in sorted {
            let result = match self.timelines.get(&s.aoi_name) {
                Some(timeline) => self.analyzer.analyze_over(s, timeline),
                None => self.analyzer.analyze(s),
            };
            report.pivot.insert(&result.aoi_name, result.duration_hours);

            let areas = report.areas.entry(s.aoi_name.clone()).or_default();
            for record in &s.records {
                let passing_area = self.analyzer.passing_area(record.passing_pixels);
                frame_ids.insert(record.frame_id.clone());
                areas.insert(record.frame_id.clone(), passing_area);
                report.rows.push(ReportRow {
                    aoi_name: record.aoi_name.clone(),
                    frame_id: record.frame_id.clone(),
                    total_pixels: record.total_pixels,
                    passing_pixels: record.passing_pixels,
                    passing_area,
                });
            }
            report.results.push(result);
        }

        report.frame_ids = frame_ids.into_iter().collect();
        debug!(
            aois = report.results.len(),
            rows = report.rows.len(),
            groups = report.pivot.cells.len(),
            "assembled report"
        );
        report
    }

    /// Writes the three tables into `dir` and returns their paths.
    pub fn write_csv(&self, report: &ComplianceReport, dir: &Path) -> WpdResult<Vec<PathBuf>> {
        fs::create_dir_all(dir)?;
        let outputs = [
            (COMBINED_FILE, combined_csv(report)),
            (DETAIL_FILE, detail_csv(report)),
            (SUMMARY_FILE, summary_csv(report)),
        ];

        let mut written = Vec::with_capacity(outputs.len());
        for (name, body) in outputs {
            let path = dir.join(name);
            fs::write(&path, body)?;
            written.push(path);
        }
        info!(dir = %dir.display(), aois = report.results.len(), "wrote compliance report");
        Ok(written)
    }
}

fn combined_csv(report: &ComplianceReport) -> String {
    let mut out = String::from("aoi,frame_id,total_pixels,passing_pixels,passing_area\n");
    for row in &report.rows {
        let _ = writeln!(
            out,
            "{},{},{},{},{}",
            escape(&row.aoi_name),
            escape(&row.frame_id),
            row.total_pixels,
            row.passing_pixels,
            format_area(row.passing_area)
        );
    }
    out
}

fn detail_csv(report: &ComplianceReport) -> String {
    let mut out = String::from("aoi,max_consecutive_frames,duration_hours");
    for frame_id in &report.frame_ids {
        out.push(',');
        out.push_str(&escape(frame_id));
    }
    out.push('\n');

    for result in &report.results {
        let _ = write!(
            out,
            "{},{},{}",
            escape(&result.aoi_name),
            result.max_consecutive_frames,
            result.duration_hours
        );
        let areas = report.areas.get(&result.aoi_name);
        for frame_id in &report.frame_ids {
            out.push(',');
            if let Some(area) = areas.and_then(|a| a.get(frame_id)) {
                out.push_str(&format_area(*area));
            }
        }
        out.push('\n');
    }
    out
}

fn summary_csv(report: &ComplianceReport) -> String {
    let pivot = &report.pivot;
    let mut out = String::from("group");
    for sub_zone in &pivot.sub_zones {
        out.push(',');
        out.push_str(&escape(sub_zone));
    }
    out.push('\n');

    for group in pivot.cells.keys() {
        out.push_str(&escape(group));
        for sub_zone in &pivot.sub_zones {
            let _ = write!(out, ",{}", pivot.get(group, sub_zone));
        }
        out.push('\n');
    }
    out
}

pub(crate) fn format_area(area: f64) -> String {
    let rounded = format!("{area:.6}");
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

pub(crate) fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
