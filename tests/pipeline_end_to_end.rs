use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use sunlight_wpd::core_modules::wpd_writer::read_wpd_file;
use sunlight_wpd::parallel_pipeline::InlineExecutor;
use sunlight_wpd::pipeline::{ExtractionMode, PipelineConfig, SUMMARY_FILE, WpdPipeline};
use sunlight_wpd::{ErrorCategory, WpdError};
use tempfile::TempDir;

const SIZE: u32 = 8;

/// Greyscale little-endian PFM. `rows` are top-down; the file stores them bottom-up.
fn write_pfm(path: &Path, width: u32, rows: &[Vec<f32>]) {
    let mut bytes = format!("Pf\n{width} {}\n-1.0\n", rows.len()).into_bytes();
    for row in rows.iter().rev() {
        for v in row {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
    }
    fs::write(path, bytes).expect("write pfm");
}

/// Columns `0..lit_columns` are bright, the rest dark.
fn write_frame(dir: &Path, name: &str, width: u32, height: u32, lit_columns: u32) {
    let rows: Vec<Vec<f32>> = (0..height)
        .map(|_| {
            (0..width)
                .map(|x| if x < lit_columns { 10.0 } else { 0.0 })
                .collect()
        })
        .collect();
    write_pfm(&dir.join(name), width, &rows);
}

/// Axis-aligned rectangle AOI, inclusive corners.
fn write_aoi(dir: &Path, stem: &str, view: &str, (x0, y0): (i64, i64), (x1, y1): (i64, i64)) {
    let text = format!(
        "AOI Points File: {stem}\n\
         ASSOCIATED VIEW FILE: {view}.vp\n\
         FFL z height(m): 12.6\n\
         CENTRAL x,y: {} {}\n\
         NO. PERIMETER POINTS 4: x,y pixel_x pixel_y positions\n\
         0.0 0.0 {x0} {y0}\n\
         1.0 0.0 {x1} {y0}\n\
         1.0 1.0 {x1} {y1}\n\
         0.0 1.0 {x0} {y1}\n",
        (x0 + x1) / 2,
        (y0 + y1) / 2
    );
    fs::write(dir.join(format!("{stem}.aoi")), text).expect("write aoi");
}

struct Fixture {
    root: TempDir,
}

impl Fixture {
    /// Two views. plan_L1 has three AOIs and four 15-minute frames, plan_L2 two AOIs
    /// and two frames. Each later frame lights two more columns.
    fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let aoi = root.path().join("aoi");
        let frames = root.path().join("frames");
        fs::create_dir_all(&aoi).expect("aoi dir");
        fs::create_dir_all(&frames).expect("frame dir");

        write_aoi(&aoi, "U1_Bed", "plan_L1", (0, 0), (1, 3));
        write_aoi(&aoi, "U1_Living", "plan_L1", (2, 0), (5, 3));
        write_aoi(&aoi, "U2_Bed", "plan_L1", (0, 4), (7, 7));
        write_aoi(&aoi, "U3_Bed", "plan_L2", (0, 0), (3, 3));
        write_aoi(&aoi, "U3_Study", "plan_L2", (4, 4), (7, 7));

        for (k, time) in ["0900", "0915", "0930", "0945"].iter().enumerate() {
            let lit = 2 + 2 * k as u32;
            write_frame(&frames, &format!("render_plan_L1_{time}.pfm"), SIZE, SIZE, lit);
        }
        for (k, time) in ["0900", "0915"].iter().enumerate() {
            write_frame(&frames, &format!("render_plan_L2_{time}.pfm"), SIZE, SIZE, 4 * (k as u32 + 1));
        }
        Self { root }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    fn config(&self, output: &str, workers: usize) -> PipelineConfig {
        let mut config = PipelineConfig::new(self.path("aoi"), self.path("frames"), self.path(output));
        config.threshold = 1.0;
        config.minimum_qualifying_area = 4.0;
        config.worker_count = workers;
        config.skip_existing = false;
        config.area_per_pixel = Some(1.0);
        config
    }
}

fn wpd_files(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    fs::read_dir(dir)
        .expect("read output")
        .map(|e| e.expect("entry").path())
        .filter(|p| p.extension().is_some_and(|e| e == "wpd"))
        .map(|p| {
            let name = p.file_name().expect("name").to_string_lossy().into_owned();
            (name, fs::read(&p).expect("read wpd"))
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn output_is_byte_identical_across_worker_counts() {
    let fixture = Fixture::new();

    let single = WpdPipeline::new(fixture.config("one", 1)).run().await.expect("run 1");
    let many = WpdPipeline::new(fixture.config("many", 8)).run().await.expect("run 8");
    let inline = WpdPipeline::new(fixture.config("inline", 3))
        .run_with(&InlineExecutor)
        .await
        .expect("inline");

    assert_eq!(single.series_written, 5);
    assert!(many.chunks > single.chunks);

    let reference = wpd_files(&fixture.path("one"));
    assert_eq!(reference.len(), 5);
    assert_eq!(reference, wpd_files(&fixture.path("many")));
    assert_eq!(reference, wpd_files(&fixture.path("inline")));

    // Re-running into the same directory rewrites the same bytes.
    WpdPipeline::new(fixture.config("one", 5)).run().await.expect("rerun");
    assert_eq!(reference, wpd_files(&fixture.path("one")));
    // Five workers and eight workers plan the same five chunks here.
    assert_eq!(
        fs::read(fixture.path("one").join(SUMMARY_FILE)).expect("summary"),
        fs::read(fixture.path("many").join(SUMMARY_FILE)).expect("summary")
    );
}

#[tokio::test]
async fn records_respect_the_mask_invariant() {
    let fixture = Fixture::new();
    WpdPipeline::new(fixture.config("out", 2))
        .run_with(&InlineExecutor)
        .await
        .expect("run");

    let living = read_wpd_file(&fixture.path("out").join("U1_Living.wpd")).expect("living");
    // x in 2..=5, y in 0..=3.
    assert_eq!(living.total_pixels, 16);
    let passing: Vec<u64> = living.records.iter().map(|r| r.passing_pixels).collect();
    // Lit columns: 0..2, 0..4, 0..6, 0..8.
    assert_eq!(passing, vec![0, 8, 16, 16]);

    let frames: Vec<&str> = living.frame_ids().collect();
    assert_eq!(
        frames,
        vec!["plan_L1_0900.pfm", "plan_L1_0915.pfm", "plan_L1_0930.pfm", "plan_L1_0945.pfm"]
    );

    for name in ["U1_Bed", "U2_Bed", "U3_Bed", "U3_Study"] {
        let series = read_wpd_file(&fixture.path("out").join(format!("{name}.wpd"))).expect(name);
        assert!(series.records.iter().all(|r| r.passing_pixels <= r.total_pixels));
    }
}

#[tokio::test]
async fn compliance_report_is_written() {
    let fixture = Fixture::new();
    let summary = WpdPipeline::new(fixture.config("out", 2))
        .run_with(&InlineExecutor)
        .await
        .expect("run");

    // U1_Living passes (>= 4 px) from 0915 onwards: three 15-minute frames.
    let living = summary
        .compliance
        .iter()
        .find(|c| c.aoi_name == "U1_Living")
        .expect("living");
    assert_eq!(living.max_consecutive_frames, 3);
    assert_eq!(living.duration_hours, 0.7);

    for file in ["wpd_combined.csv", "compliance_detail.csv", "compliance_summary.csv"] {
        assert!(fixture.path("out").join(file).exists(), "{file}");
    }
    let pivot = fs::read_to_string(fixture.path("out").join("compliance_summary.csv")).expect("pivot");
    assert!(pivot.starts_with("group,Bed,Living,Study\n"));
}

#[tokio::test]
async fn existing_output_is_left_untouched() {
    let fixture = Fixture::new();
    let out = fixture.path("out");
    fs::create_dir_all(&out).expect("out");
    let sentinel = "total_pixels_in_polygon: 8\nframe_id passing_pixels\nplan_L1_0900.pfm 7\n";
    fs::write(out.join("U1_Bed.wpd"), sentinel).expect("sentinel");

    let mut config = fixture.config("out", 3);
    config.skip_existing = true;
    let summary = WpdPipeline::new(config).run().await.expect("run");

    assert_eq!(fs::read_to_string(out.join("U1_Bed.wpd")).expect("read"), sentinel);
    assert_eq!(summary.aois_skipped_existing, 1);
    assert_eq!(summary.aois_processed, 4);
    assert_eq!(summary.series_written, 4);
    // The skipped AOI still shows up in the report.
    assert!(summary.compliance.iter().any(|c| c.aoi_name == "U1_Bed"));
}

#[tokio::test]
async fn mismatched_frame_is_skipped_for_its_view() {
    let fixture = Fixture::new();
    write_frame(&fixture.path("frames"), "render_plan_L1_1000.pfm", 6, SIZE, 6);

    let summary = WpdPipeline::new(fixture.config("out", 1))
        .run_with(&InlineExecutor)
        .await
        .expect("run");

    assert!(summary.error_count(ErrorCategory::Decode) >= 1);
    let bed = read_wpd_file(&fixture.path("out").join("U1_Bed.wpd")).expect("bed");
    assert_eq!(bed.records.len(), 4);
    assert!(bed.frame_ids().all(|f| f != "plan_L1_1000.pfm"));
}

#[tokio::test]
async fn empty_aoi_directory_is_fatal_and_writes_nothing() {
    let fixture = Fixture::new();
    for entry in fs::read_dir(fixture.path("aoi")).expect("aoi dir") {
        fs::remove_file(entry.expect("entry").path()).expect("remove");
    }

    let err = WpdPipeline::new(fixture.config("out", 2))
        .run()
        .await
        .expect_err("no AOIs");
    assert!(matches!(err, WpdError::NoAois(_)));
    assert!(err.is_fatal());
    assert!(!fixture.path("out").exists());
}

#[tokio::test]
async fn empty_frame_directory_is_fatal() {
    let fixture = Fixture::new();
    for entry in fs::read_dir(fixture.path("frames")).expect("frame dir") {
        fs::remove_file(entry.expect("entry").path()).expect("remove");
    }

    let err = WpdPipeline::new(fixture.config("out", 2))
        .run()
        .await
        .expect_err("no frames");
    assert!(matches!(err, WpdError::NoFrames(_)));
    assert!(!fixture.path("out").exists());
}

#[tokio::test]
async fn unreadable_aoi_costs_only_itself() {
    let fixture = Fixture::new();
    fs::write(
        fixture.path("aoi").join("U9_Broken.aoi"),
        "AOI Points File: U9_Broken\nASSOCIATED VIEW FILE: plan_L1.vp\nFFL\nCENTRAL x,y: 0 0\nNO. PERIMETER POINTS 2\n0 0 1 1\n0 0 2 2\n",
    )
    .expect("broken aoi");

    let summary = WpdPipeline::new(fixture.config("out", 4)).run().await.expect("run");
    assert_eq!(summary.error_count(ErrorCategory::Parse), 1);
    assert_eq!(summary.series_written, 5);
    assert!(!fixture.path("out").join("U9_Broken.wpd").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_width_frame_costs_only_that_frame() {
    let fixture = Fixture::new();
    fs::write(fixture.path("frames").join("render_plan_L1_1000.pfm"), "Pf\n0 8\n-1.0\n")
        .expect("empty frame");

    let summary = WpdPipeline::new(fixture.config("out", 3)).run().await.expect("run");

    assert_eq!(summary.series_written, 5);
    assert_eq!(summary.error_count(ErrorCategory::Worker), 0);
    assert!(summary.error_count(ErrorCategory::Decode) >= 1);
    let bed = read_wpd_file(&fixture.path("out").join("U1_Bed.wpd")).expect("bed");
    assert_eq!(bed.records.len(), 4);
}

#[tokio::test]
async fn foreign_wpd_file_does_not_block_the_report() {
    let fixture = Fixture::new();
    let out = fixture.path("out");
    fs::create_dir_all(&out).expect("out");
    fs::write(out.join("Legacy.wpd"), "hdr_file passing_pixels\nplan_L1_0900.hdr 12\n")
        .expect("legacy");

    let summary = WpdPipeline::new(fixture.config("out", 2))
        .run_with(&InlineExecutor)
        .await
        .expect("run");

    assert_eq!(summary.series_written, 5);
    assert_eq!(summary.compliance.len(), 5);
    assert_eq!(summary.error_count(ErrorCategory::Output), 1);
    assert!(out.join("compliance_summary.csv").exists());
    assert_eq!(
        fs::read_to_string(out.join("Legacy.wpd")).expect("legacy"),
        "hdr_file passing_pixels\nplan_L1_0900.hdr 12\n"
    );
}

#[tokio::test]
async fn skipped_frame_breaks_the_compliance_run() {
    let fixture = Fixture::new();
    // Same view, wrong size: evaluated for no AOI.
    write_frame(&fixture.path("frames"), "render_plan_L1_0915.pfm", 6, SIZE, 6);

    let summary = WpdPipeline::new(fixture.config("out", 2))
        .run_with(&InlineExecutor)
        .await
        .expect("run");

    let bed = read_wpd_file(&fixture.path("out").join("U1_Bed.wpd")).expect("bed");
    assert!(bed.frame_ids().all(|f| f != "plan_L1_0915.pfm"));

    // U1_Bed qualifies in every evaluated frame, but 0915 is a miss.
    let result = summary
        .compliance
        .iter()
        .find(|c| c.aoi_name == "U1_Bed")
        .expect("bed");
    assert_eq!(result.max_consecutive_frames, 2);
    assert_eq!(result.duration_hours, 0.5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn daylight_mode_writes_pixels_and_summary() {
    let root = tempfile::tempdir().expect("tempdir");
    let (aoi, frames, out) = (root.path().join("aoi"), root.path().join("frames"), root.path().join("out"));
    fs::create_dir_all(&aoi).expect("aoi dir");
    fs::create_dir_all(&frames).expect("frame dir");
    write_aoi(&aoi, "U1_Bed", "plan_L1", (0, 0), (1, 3));
    write_aoi(&aoi, "U1_Living", "plan_L1", (2, 0), (5, 3));
    // 1 W/m² everywhere in columns 0..4: a daylight factor of 1.79%.
    let rows: Vec<Vec<f32>> = (0..SIZE)
        .map(|_| (0..SIZE).map(|x| if x < 4 { 1.0 } else { 0.0 }).collect())
        .collect();
    write_pfm(&frames.join("df_plan_L1.pfm"), SIZE, &rows);

    let mut config = PipelineConfig::new(&aoi, &frames, &out);
    config.mode = ExtractionMode::Daylight;
    config.area_per_pixel = Some(0.25);
    config.worker_count = 2;
    let summary = WpdPipeline::new(config).run().await.expect("run");

    assert_eq!(summary.series_written, 2);
    assert_eq!(summary.records_written, 24);
    assert!(summary.compliance.is_empty());

    let bed = fs::read_to_string(out.join("U1_Bed.wpd")).expect("bed");
    let mut lines = bed.lines();
    assert_eq!(lines.next(), Some("total_pixels_in_polygon: 8"));
    assert_eq!(lines.next(), Some("pixel_x pixel_y illuminance df_percent"));
    assert_eq!(lines.next(), Some("0 0 179.0000 1.7900"));

    let living = summary
        .daylight
        .iter()
        .find(|s| s.aoi_name == "U1_Living")
        .expect("living");
    assert_eq!(living.total_pixels, 16);
    assert_eq!(living.area, 4.0);
    // Columns 2 and 3 are lit: half the room clears 0.5% and 1%, none clears 2%.
    let pixels: Vec<u64> = living.coverage.iter().map(|c| c.pixels).collect();
    assert_eq!(pixels, vec![8, 8, 0]);
    assert_eq!(living.coverage[0].percent_area, 50.0);
    assert!(out.join("daylight_factor_summary.csv").exists());
}
