// THEORY:
// The `pipeline` module is the top-level API for the extraction engine. It wires
// the stages together in one fixed order and owns the run's bookkeeping:
//
//   scan -> absence checks -> group -> plan -> execute -> merge -> write -> report
//
// Daylight mode shares everything up to grouping, then samples one frame per view
// and writes per-pixel series and a daylight-factor summary instead.
//
// Fatal conditions (bad configuration, no AOIs, no frames) are detected before the
// output directory is touched, so a failed run leaves nothing behind. Every other
// error is recovered where it happens and lands in the `RunSummary`, which is
// written next to the series as `run_summary.json`.

use crate::core_modules::aoi::scan_aoi_directory;
use crate::core_modules::chunk_planner::chunk_planner::plan_chunks;
use crate::core_modules::compliance::ComplianceAnalyzer;
use crate::core_modules::daylight::{
    DEFAULT_DF_THRESHOLDS, DaylightExtractor, DaylightStats, read_daylight_directory, summarize,
    write_summary_csv,
};
use crate::core_modules::exposure::{ChunkContext, WpdRecord};
use crate::core_modules::frame_source::{FrameDecoder, FrameDecoders, scan_frame_directory};
use crate::core_modules::pixel_map::PixelCalibration;
use crate::core_modules::report::ReportAssembler;
use crate::core_modules::view_grouper::{GroupingOutcome, group_by_view};
use crate::core_modules::wpd_writer::{TimeSeriesWriter, read_wpd_directory};
use crate::error::{ErrorCategory, WpdError, WpdResult};
use crate::parallel_pipeline::{ChunkExecutor, WorkerPool, default_worker_count};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

pub use crate::core_modules::compliance::ComplianceResult;
pub use crate::core_modules::wpd_writer::WpdSeries;

pub const SUMMARY_FILE: &str = "run_summary.json";
const ERROR_EXAMPLES: usize = 3;

/// What a run extracts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Lit-pixel counts over a time series of frames, plus compliance.
    #[default]
    Sunlight,
    /// Per-pixel daylight factor from one frame per view.
    Daylight,
}

impl std::str::FromStr for ExtractionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sunlight" => Ok(Self::Sunlight),
            "daylight" => Ok(Self::Daylight),
            other => Err(format!("expected `sunlight` or `daylight`, got `{other}`")),
        }
    }
}

/// Configuration for the WpdPipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub aoi_directory: PathBuf,
    pub frame_directory: PathBuf,
    pub output_directory: PathBuf,
    /// Pixel values strictly above this are lit.
    pub threshold: f64,
    /// Minimum lit area, in `passing_pixels * area_per_pixel` units, for a frame to count.
    pub minimum_qualifying_area: f64,
    pub worker_count: usize,
    /// Leave AOIs whose `.wpd` already exists untouched.
    pub skip_existing: bool,
    /// Frame ids are the file name from the first occurrence of this token onwards.
    pub frame_marker: String,
    /// Square metres per pixel. Overrides `pixel_to_world_map` when set.
    pub area_per_pixel: Option<f64>,
    pub pixel_to_world_map: Option<PathBuf>,
    /// Width and height of headerless `.raw`/`.bin` frames.
    pub raw_frame_size: Option<(u32, u32)>,
    /// Write the CSV report after the series.
    pub report: bool,
    pub mode: ExtractionMode,
    /// Daylight-factor percentages reported in daylight mode.
    pub df_thresholds: Vec<f64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            aoi_directory: PathBuf::from("aoi"),
            frame_directory: PathBuf::from("frames"),
            output_directory: PathBuf::from("wpd"),
            threshold: 0.0,
            minimum_qualifying_area: 1.0,
            worker_count: default_worker_count(),
            skip_existing: true,
            frame_marker: "plan_".to_string(),
            area_per_pixel: None,
            pixel_to_world_map: None,
            raw_frame_size: None,
            report: true,
            mode: ExtractionMode::default(),
            df_thresholds: DEFAULT_DF_THRESHOLDS.to_vec(),
        }
    }
}

impl PipelineConfig {
    pub fn new(
        aoi_directory: impl Into<PathBuf>,
        frame_directory: impl Into<PathBuf>,
        output_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            aoi_directory: aoi_directory.into(),
            frame_directory: frame_directory.into(),
            output_directory: output_directory.into(),
            ..Self::default()
        }
    }

    /// Loads a JSON config. Fields it leaves out keep their defaults.
    pub fn from_json_file(path: &Path) -> WpdResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| WpdError::Config(format!("{}: {e}", path.display())))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Applies `WPD_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> WpdResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `WPD_*` overrides from any key lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> WpdResult<()> {
        if let Some(v) = lookup("WPD_THRESHOLD") {
            self.threshold = parse_override("WPD_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("WPD_MIN_AREA") {
            self.minimum_qualifying_area = parse_override("WPD_MIN_AREA", &v)?;
        }
        if let Some(v) = lookup("WPD_WORKERS") {
            self.worker_count = parse_override("WPD_WORKERS", &v)?;
        }
        if let Some(v) = lookup("WPD_MODE") {
            self.mode = parse_override("WPD_MODE", &v)?;
        }
        if let Some(v) = lookup("WPD_OUTPUT_DIR") {
            self.output_directory = PathBuf::from(v);
        }
        if let Some(v) = lookup("WPD_SKIP_EXISTING") {
            self.skip_existing = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(WpdError::Config(format!(
                        "WPD_SKIP_EXISTING: expected a boolean, got `{other}`"
                    )));
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> WpdResult<()> {
        if self.worker_count == 0 {
            return Err(WpdError::Config("worker_count must be at least 1".into()));
        }
        if !self.threshold.is_finite() {
            return Err(WpdError::Config("threshold must be finite".into()));
        }
        if !self.minimum_qualifying_area.is_finite() || self.minimum_qualifying_area < 0.0 {
            return Err(WpdError::Config(
                "minimum_qualifying_area must be a non-negative number".into(),
            ));
        }
        if let Some(area) = self.area_per_pixel {
            if !area.is_finite() || area <= 0.0 {
                return Err(WpdError::Config("area_per_pixel must be positive".into()));
            }
        }
        if self.df_thresholds.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err(WpdError::Config(
                "df_thresholds must be non-negative numbers".into(),
            ));
        }
        if self.frame_marker.is_empty() {
            return Err(WpdError::Config("frame_marker must not be empty".into()));
        }
        for dir in [&self.aoi_directory, &self.frame_directory] {
            if !dir.is_dir() {
                return Err(WpdError::MissingDirectory(dir.clone()));
            }
        }
        Ok(())
    }

    /// Explicit value, else the coordinate map, else one unit per pixel.
    pub fn resolve_area_per_pixel(&self) -> WpdResult<f64> {
        if let Some(area) = self.area_per_pixel {
            return Ok(area);
        }
        match &self.pixel_to_world_map {
            Some(path) => Ok(PixelCalibration::from_file(path)
                .map_err(|e| WpdError::Config(e.to_string()))?
                .area_per_pixel()),
            None => {
                warn!("no area_per_pixel or pixel_to_world_map, areas are in pixels");
                Ok(1.0)
            }
        }
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> WpdResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| WpdError::Config(format!("{key}: `{value}`: {e}")))
}

/// Recovered errors of one category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorTally {
    pub count: usize,
    /// The first few messages, for identification.
    pub examples: Vec<String>,
}

/// What a run did. Contains no timings, so identical runs serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub mode: ExtractionMode,
    pub aois_discovered: usize,
    pub aois_skipped_existing: usize,
    pub aois_processed: usize,
    pub frames_discovered: usize,
    pub frames_unmatched: usize,
    pub frames_ambiguous: usize,
    pub views: usize,
    pub chunks: usize,
    pub series_written: usize,
    pub records_written: usize,
    pub area_per_pixel: f64,
    pub compliance: Vec<ComplianceResult>,
    pub daylight: Vec<DaylightStats>,
    pub errors: BTreeMap<ErrorCategory, ErrorTally>,
}

impl RunSummary {
    pub fn record_error(&mut self, err: &WpdError) {
        let tally = self.errors.entry(err.category()).or_default();
        tally.count += 1;
        if tally.examples.len() < ERROR_EXAMPLES {
            tally.examples.push(err.to_string());
        }
    }

    pub fn recovered_errors(&self) -> usize {
        self.errors.values().map(|t| t.count).sum()
    }

    pub fn error_count(&self, category: ErrorCategory) -> usize {
        self.errors.get(&category).map_or(0, |t| t.count)
    }
}

/// The top-level extraction engine.
pub struct WpdPipeline {
    config: PipelineConfig,
    decoder: Arc<dyn FrameDecoder>,
}

impl WpdPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let decoder = Arc::new(FrameDecoders::new(config.raw_frame_size));
        Self { config, decoder }
    }

    /// Replaces the extension-based decoder set.
    pub fn with_decoder(mut self, decoder: Arc<dyn FrameDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs on a `WorkerPool` sized by `worker_count`.
    pub async fn run(&self) -> WpdResult<RunSummary> {
        let pool = WorkerPool::new(self.config.worker_count);
        self.run_with(&pool).await
    }

    /// Runs the configured mode. Sunlight chunks go through `executor`; daylight
    /// views always run on the blocking pool, at most `worker_count` at a time.
    pub async fn run_with<E: ChunkExecutor>(&self, executor: &E) -> WpdResult<RunSummary> {
        let config = &self.config;
        config.validate()?;

        // --- 1. Scan, and stop before writing anything if either side is empty ---
        let aois = scan_aoi_directory(&config.aoi_directory)?;
        let frames = scan_frame_directory(&config.frame_directory, &config.frame_marker)?;
        if aois.is_empty() {
            return Err(WpdError::NoAois(config.aoi_directory.clone()));
        }
        if frames.is_empty() {
            return Err(WpdError::NoFrames(config.frame_directory.clone()));
        }
        let area_per_pixel = config.resolve_area_per_pixel()?;
        info!(
            mode = ?config.mode,
            aois = aois.len(),
            frames = frames.len(),
            threshold = config.threshold,
            area_per_pixel,
            "scanned inputs"
        );

        let mut summary = RunSummary {
            mode: config.mode,
            aois_discovered: aois.len(),
            frames_discovered: frames.len(),
            area_per_pixel,
            ..RunSummary::default()
        };
        let writer = TimeSeriesWriter::new(&config.output_directory)?;

        // --- 2. Group ---
        let grouping = group_by_view(&aois, &frames, writer.output_dir(), config.skip_existing);
        summary.aois_skipped_existing = grouping.skipped_existing.len();
        summary.frames_unmatched = grouping.unmatched_frames.len();
        summary.frames_ambiguous = grouping.ambiguous_frames.len();
        summary.views = grouping.groups.len();
        for err in &grouping.ungrouped_aois {
            summary.record_error(err);
        }
        for name in &grouping.unmatched_frames {
            summary.record_error(&WpdError::Grouping(format!("frame {name} matched no view")));
        }

        // --- 3. Extract ---
        match config.mode {
            ExtractionMode::Sunlight => {
                self.extract_sunlight(executor, &grouping, &writer, &mut summary).await;
            }
            ExtractionMode::Daylight => {
                self.extract_daylight(&grouping, &writer, &mut summary).await;
            }
        }

        let summary_path = writer.output_dir().join(SUMMARY_FILE);
        fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;

        info!(
            views = summary.views,
            chunks = summary.chunks,
            aois_processed = summary.aois_processed,
            aois_skipped = summary.aois_skipped_existing,
            series = summary.series_written,
            records = summary.records_written,
            recovered_errors = summary.recovered_errors(),
            "run complete"
        );
        for (category, tally) in &summary.errors {
            warn!(?category, count = tally.count, examples = ?tally.examples, "recovered errors");
        }
        Ok(summary)
    }

    async fn extract_sunlight<E: ChunkExecutor>(
        &self,
        executor: &E,
        grouping: &GroupingOutcome,
        writer: &TimeSeriesWriter,
        summary: &mut RunSummary,
    ) {
        let config = &self.config;
        let tasks = plan_chunks(&grouping.groups, config.worker_count);
        summary.chunks = tasks.len();

        let context = Arc::new(ChunkContext::new(Arc::clone(&self.decoder), config.threshold));
        let outcomes = executor.execute(tasks, context).await;

        let mut records: Vec<WpdRecord> = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(chunk) => {
                    summary.aois_processed += chunk.evaluated_aois.len();
                    for err in &chunk.errors {
                        summary.record_error(err);
                    }
                    records.extend(chunk.records);
                }
                Err(err) => {
                    warn!(chunk = %outcome.label, error = %err, "chunk dropped");
                    summary.record_error(&err);
                }
            }
        }

        // --- Merge and persist ---
        for series in TimeSeriesWriter::merge(records) {
            match writer.write_series(&series) {
                Ok(Some(_)) => {
                    summary.series_written += 1;
                    summary.records_written += series.records.len();
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(aoi = %series.aoi_name, error = %err, "failed to write series");
                    summary.record_error(&err);
                }
            }
        }

        // --- Report over everything on disk, including skipped AOIs ---
        let analyzer =
            ComplianceAnalyzer::new(config.minimum_qualifying_area, summary.area_per_pixel);
        match read_wpd_directory(writer.output_dir()) {
            Ok(scan) => {
                for err in &scan.errors {
                    summary.record_error(err);
                }
                let assembler =
                    ReportAssembler::new(analyzer).with_timelines(grouping.frame_timelines());
                let report = assembler.assemble(&scan.series);
                if config.report {
                    if let Err(err) = assembler.write_csv(&report, writer.output_dir()) {
                        warn!(error = %err, "failed to write report");
                        summary.record_error(&err);
                    }
                }
                summary.compliance = report.results;
            }
            Err(err) => {
                warn!(error = %err, "could not list series for the report");
                summary.record_error(&err);
            }
        }
    }

    async fn extract_daylight(
        &self,
        grouping: &GroupingOutcome,
        writer: &TimeSeriesWriter,
        summary: &mut RunSummary,
    ) {
        let config = &self.config;
        let extractor = Arc::new(DaylightExtractor::new(
            Arc::clone(&self.decoder),
            writer.output_dir(),
        ));
        let permits = Arc::new(Semaphore::new(config.worker_count));
        summary.chunks = grouping.groups.len();

        let jobs = grouping.groups.values().cloned().map(|group| {
            let extractor = Arc::clone(&extractor);
            let permits = Arc::clone(&permits);
            async move {
                let _permit = permits.acquire_owned().await;
                let view_id = group.view_id.clone();
                tokio::task::spawn_blocking(move || extractor.extract_view(&group))
                    .await
                    .map_err(|e| WpdError::Worker(format!("{view_id}: {e}")))
            }
        });

        for outcome in join_all(jobs).await {
            match outcome {
                Ok(view) => {
                    summary.aois_processed += view.evaluated_aois.len();
                    summary.series_written += view.series_written;
                    summary.records_written += view.pixels_written;
                    for err in &view.errors {
                        summary.record_error(err);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "daylight view dropped");
                    summary.record_error(&err);
                }
            }
        }

        match read_daylight_directory(writer.output_dir()) {
            Ok(scan) => {
                for err in &scan.errors {
                    summary.record_error(err);
                }
                let stats = summarize(&scan.series, summary.area_per_pixel, &config.df_thresholds);
                if config.report {
                    if let Err(err) =
                        write_summary_csv(&stats, &config.df_thresholds, writer.output_dir())
                    {
                        warn!(error = %err, "failed to write daylight summary");
                        summary.record_error(&err);
                    }
                }
                summary.daylight = stats;
            }
            Err(err) => {
                warn!(error = %err, "could not list series for the daylight summary");
                summary.record_error(&err);
            }
        }
    }
}
