// THEORY:
// The `compliance` module reduces one AOI's time series to a single number an
// assessor cares about: the longest continuous stretch of frames in which the lit
// area met the minimum, expressed in hours.
//
// 1.  **Run length**: a left-to-right scan. `max_run` only moves on a strictly
//     larger run, so ties go to the first maximal run.
// 2.  **Time step**: read from the time-of-day suffix of the first two frame ids
//     (`..._0900`, `..._0915` -> 0.25 h). Fewer than two frames means one hour.
// 3.  **Truncation**: `floor(run * step * 10) / 10`. Durations are never rounded up.
//
// A series only holds the frames that were actually evaluated. Scored against its
// view's full frame list, a frame skipped for a decode or resolution failure counts
// as not qualifying and breaks the run; it also keeps the step honest.

use crate::core_modules::wpd_writer::WpdSeries;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::warn;

const DEFAULT_STEP_HOURS: f64 = 1.0;

/// Guards `floor` against products like `0.7 * 10 = 6.999...`.
const TRUNCATION_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplianceResult {
    pub aoi_name: String,
    pub max_consecutive_frames: usize,
    pub duration_hours: f64,
}

/// Length of the longest run of consecutive `true` values.
pub fn longest_qualifying_run(qualifies: impl IntoIterator<Item = bool>) -> usize {
    let mut current = 0;
    let mut best = 0;
    for ok in qualifies {
        if ok {
            current += 1;
            if current > best {
                best = current;
            }
        } else {
            current = 0;
        }
    }
    best
}

/// Time of day encoded as `HHMM` in the last `_` segment of a frame id's stem.
pub fn time_of_day_hours(frame_id: &str) -> Option<f64> {
    let stem = Path::new(frame_id).file_stem()?.to_str()?;
    let token = stem.rsplit('_').next()?;
    if token.len() != 4 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: u32 = token[..2].parse().ok()?;
    let minutes: u32 = token[2..].parse().ok()?;
    if hours > 23 || minutes >= 60 {
        return None;
    }
    Some(f64::from(hours) + f64::from(minutes) / 60.0)
}

/// Hours between the first two frames, or one hour when that can't be determined.
pub fn infer_step_hours<'a>(mut frame_ids: impl Iterator<Item = &'a str>) -> f64 {
    let (Some(first), Some(second)) = (frame_ids.next(), frame_ids.next()) else {
        return DEFAULT_STEP_HOURS;
    };
    match (time_of_day_hours(first), time_of_day_hours(second)) {
        (Some(a), Some(b)) if (b - a).abs() > 0.0 => (b - a).abs(),
        _ => {
            warn!(first, second, "cannot infer time step from frame ids, assuming 1 hour");
            DEFAULT_STEP_HOURS
        }
    }
}

/// `floor(value * 10) / 10`.
pub fn truncate_to_tenth(value: f64) -> f64 {
    (value * 10.0 + TRUNCATION_EPSILON).floor() / 10.0
}

#[derive(Debug, Clone, Copy)]
pub struct ComplianceAnalyzer {
    pub minimum_area: f64,
    pub area_per_pixel: f64,
}

impl ComplianceAnalyzer {
    pub fn new(minimum_area: f64, area_per_pixel: f64) -> Self {
        Self {
            minimum_area,
            area_per_pixel,
        }
    }

    pub fn passing_area(&self, passing_pixels: u64) -> f64 {
        passing_pixels as f64 * self.area_per_pixel
    }

    /// Scores a series on its own frame ids.
    pub fn analyze(&self, series: &WpdSeries) -> ComplianceResult {
        self.analyze_over(series, &[])
    }

    /// Scores a series against `timeline`, the sorted frame ids of its view. Frames
    /// without a record do not qualify. Records outside the timeline are still scored.
    pub fn analyze_over(&self, series: &WpdSeries, timeline: &[String]) -> ComplianceResult {
        let passing: BTreeMap<&str, u64> = series
            .records
            .iter()
            .map(|r| (r.frame_id.as_str(), r.passing_pixels))
            .collect();
        let mut frame_ids: BTreeSet<&str> = timeline.iter().map(String::as_str).collect();
        frame_ids.extend(passing.keys().copied());

        let run = longest_qualifying_run(frame_ids.iter().map(|id| {
            passing
                .get(id)
                .is_some_and(|p| self.passing_area(*p) >= self.minimum_area)
        }));
        let step = infer_step_hours(frame_ids.iter().copied());
        ComplianceResult {
            aoi_name: series.aoi_name.clone(),
            max_consecutive_frames: run,
            duration_hours: truncate_to_tenth(run as f64 * step),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::exposure::WpdRecord;

    fn series(frames: &[(&str, u64)]) -> WpdSeries {
        WpdSeries {
            aoi_name: "U1_Bed".into(),
            total_pixels: 100,
            records: frames
                .iter()
                .map(|(f, p)| WpdRecord {
                    aoi_name: "U1_Bed".into(),
                    frame_id: f.to_string(),
                    total_pixels: 100,
                    passing_pixels: *p,
                })
                .collect(),
        }
    }

    #[test]
    fn trailing_run_beats_shorter_leading_run() {
        let areas = [0.5, 1.2, 1.3, 0.0, 2.0, 2.0, 2.0];
        assert_eq!(longest_qualifying_run(areas.iter().map(|a| *a >= 1.0)), 3);
    }

    #[test]
    fn ties_keep_the_same_length() {
        let flags = [true, true, false, true, true];
        assert_eq!(longest_qualifying_run(flags), 2);
        assert_eq!(longest_qualifying_run(std::iter::empty()), 0);
    }

    #[test]
    fn duration_truncates_instead_of_rounding() {
        assert_eq!(truncate_to_tenth(5.0 * 0.25), 1.2);
        assert_eq!(truncate_to_tenth(0.7), 0.7);
        assert_eq!(truncate_to_tenth(0.0), 0.0);
    }

    #[test]
    fn step_comes_from_time_of_day_suffix() {
        assert_eq!(time_of_day_hours("plan_L1_0915.pfm"), Some(9.25));
        assert_eq!(time_of_day_hours("plan_L1_noon.pfm"), None);
        assert_eq!(time_of_day_hours("plan_L1_2359.pfm"), Some(23.0 + 59.0 / 60.0));
        assert_eq!(time_of_day_hours("plan_L1_2459.pfm"), None);
        assert_eq!(time_of_day_hours("plan_L1_2400.pfm"), None);
        assert_eq!(time_of_day_hours("plan_L1_0960.pfm"), None);
        let ids = ["plan_L1_0900.pfm", "plan_L1_0915.pfm", "plan_L1_0930.pfm"];
        assert_eq!(infer_step_hours(ids.into_iter()), 0.25);
        assert_eq!(infer_step_hours(["plan_L1_0900.pfm"].into_iter()), 1.0);
        assert_eq!(infer_step_hours(["a_x", "a_y"].into_iter()), 1.0);
    }

    #[test]
    fn analyze_combines_run_and_step() {
        // area_per_pixel 0.1: 10 passing pixels is exactly the 1.0 minimum.
        let analyzer = ComplianceAnalyzer::new(1.0, 0.1);
        let result = analyzer.analyze(&series(&[
            ("plan_L1_0900.pfm", 5),
            ("plan_L1_0915.pfm", 12),
            ("plan_L1_0930.pfm", 13),
            ("plan_L1_0945.pfm", 0),
            ("plan_L1_1000.pfm", 20),
            ("plan_L1_1015.pfm", 20),
            ("plan_L1_1030.pfm", 10),
            ("plan_L1_1045.pfm", 30),
            ("plan_L1_1100.pfm", 30),
        ]));
        assert_eq!(result.max_consecutive_frames, 5);
        assert_eq!(result.duration_hours, 1.2);
    }

    #[test]
    fn single_frame_defaults_to_one_hour() {
        let analyzer = ComplianceAnalyzer::new(1.0, 1.0);
        let result = analyzer.analyze(&series(&[("plan_L1_1200.pfm", 3)]));
        assert_eq!(result.max_consecutive_frames, 1);
        assert_eq!(result.duration_hours, 1.0);
    }

    #[test]
    fn frames_missing_from_the_series_break_the_run() {
        let analyzer = ComplianceAnalyzer::new(1.0, 1.0);
        // 1000 was never evaluated for this AOI.
        let gappy = series(&[("plan_L1_0900.pfm", 5), ("plan_L1_1100.pfm", 5)]);
        let timeline: Vec<String> = ["plan_L1_0900.pfm", "plan_L1_1000.pfm", "plan_L1_1100.pfm"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let result = analyzer.analyze_over(&gappy, &timeline);
        assert_eq!(result.max_consecutive_frames, 1);
        assert_eq!(result.duration_hours, 1.0);

        let complete = series(&[
            ("plan_L1_0900.pfm", 5),
            ("plan_L1_1000.pfm", 5),
            ("plan_L1_1100.pfm", 5),
        ]);
        let result = analyzer.analyze_over(&complete, &timeline);
        assert_eq!(result.max_consecutive_frames, 3);
        assert_eq!(result.duration_hours, 3.0);
    }

    #[test]
    fn records_outside_the_timeline_are_still_scored() {
        let analyzer = ComplianceAnalyzer::new(1.0, 1.0);
        let result = analyzer.analyze_over(
            &series(&[("plan_L1_0900.pfm", 5), ("plan_L1_0930.pfm", 5)]),
            &["plan_L1_0900.pfm".to_string()],
        );
        assert_eq!(result.max_consecutive_frames, 2);
        assert_eq!(result.duration_hours, 1.0);
    }
}
