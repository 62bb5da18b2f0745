// THEORY:
// This file is the entry point for the `sunlight_wpd` library crate.
// It exposes the `WpdPipeline` and its configuration as the high-level interface
// for turning rendered frames and AOI boundaries into working-plane data and
// compliance figures. The stages underneath (`core_modules`) are public so they
// can be driven one at a time, but most callers only need `pipeline`.
//
// Data flow: AOI store + frame store -> view grouper -> chunk planner ->
// {mask rasterizer + exposure evaluator} per chunk, in parallel -> time-series
// writer -> compliance analyzer -> report assembler. Daylight mode branches after
// grouping into the `daylight` extractor and its summary.

pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use error::{ErrorCategory, WpdError, WpdResult};
pub use pipeline::{ExtractionMode, PipelineConfig, RunSummary, WpdPipeline};
