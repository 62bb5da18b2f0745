// THEORY:
// The `exposure` module is the Exposure Evaluator, the innermost loop of the engine.
// It runs one `ChunkTask` to completion on a single worker:
//
// 1.  **Resolve the view resolution** from the first frame whose header is readable.
//     Every frame of a view must match it; one that does not is skipped. Unreadable
//     headers are recorded like any other decode failure.
// 2.  **Rasterize** each AOI of the chunk once into a chunk-local `MaskCache`. An AOI
//     that fails to parse is recorded and dropped; the chunk carries on. AOIs are
//     parsed even when no frame is readable.
// 3.  **Evaluate frames** independently: decode, build the `BrightMask` once, then AND
//     it against every cached AOI mask and count. One `WpdRecord` per (AOI, frame).
//
// Nothing here is shared with other chunks. The cache is built at the top of
// `evaluate` and dropped when it returns, so there is nothing to lock.

use crate::core_modules::chunk_planner::chunk_planner::ChunkTask;
use crate::core_modules::frame_source::{FrameDecoder, FrameHandle};
use crate::core_modules::raster_mask::{BrightMask, MaskCache};
use crate::error::WpdError;
use std::sync::Arc;
use tracing::{debug, warn};

const PROGRESS_EVERY_FRAMES: usize = 10;

/// Pixels of one AOI that were bright in one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WpdRecord {
    pub aoi_name: String,
    pub frame_id: String,
    pub total_pixels: u64,
    /// Always `<= total_pixels`.
    pub passing_pixels: u64,
}

/// Everything one chunk produced, including the errors it recovered from.
#[derive(Debug, Default)]
pub struct ChunkResult {
    pub label: String,
    pub view_id: String,
    pub records: Vec<WpdRecord>,
    /// AOIs that were rasterized and evaluated.
    pub evaluated_aois: Vec<String>,
    pub frames_evaluated: usize,
    pub errors: Vec<WpdError>,
}

/// Read-only inputs shared by every chunk of a run.
pub struct ChunkContext {
    pub decoder: Arc<dyn FrameDecoder>,
    /// Values strictly above this are bright.
    pub threshold: f64,
}

impl ChunkContext {
    pub fn new(decoder: Arc<dyn FrameDecoder>, threshold: f64) -> Self {
        Self { decoder, threshold }
    }

    pub fn evaluate(&self, task: &ChunkTask) -> ChunkResult {
        let mut result = ChunkResult {
            label: task.label.clone(),
            view_id: task.view_id.clone(),
            ..ChunkResult::default()
        };

        let resolution = self.view_resolution(&task.frames, &mut result);

        // --- 1. Parse the chunk's AOIs, so their errors count even with no frames ---
        let mut aois = Vec::with_capacity(task.aois.len());
        for aoi_file in &task.aois {
            match aoi_file.load() {
                Ok(aoi) => aois.push(aoi),
                Err(err) => {
                    warn!(chunk = %task.label, error = %err, "skipping AOI");
                    result.errors.push(err);
                }
            }
        }

        let Some((first_readable, (width, height))) = resolution else {
            warn!(chunk = %task.label, "no readable frames for view, chunk produces nothing");
            return result;
        };

        // --- 2. Rasterize them once ---
        let mut cache = MaskCache::default();
        for aoi in &aois {
            let mask = cache.insert(aoi, width, height);
            if mask.total_pixels == 0 {
                warn!(aoi = %aoi.name, "polygon covers no pixels at {width}x{height}");
            }
        }
        if cache.is_empty() {
            return result;
        }
        result.evaluated_aois = cache.iter().map(|(name, _)| name.clone()).collect();

        // --- 3. One bright mask per frame, compared against every AOI mask ---
        // Frames before `first_readable` already failed at the header.
        for (index, frame) in task.frames.iter().enumerate().skip(first_readable) {
            if let Some(bright) = self.bright_mask(frame, width, height, &mut result) {
                for (name, mask) in cache.iter() {
                    result.records.push(WpdRecord {
                        aoi_name: name.clone(),
                        frame_id: frame.frame_id.clone(),
                        total_pixels: mask.total_pixels,
                        passing_pixels: mask.passing_pixels(&bright),
                    });
                }
                result.frames_evaluated += 1;
            }
            if (index + 1) % PROGRESS_EVERY_FRAMES == 0 {
                debug!(chunk = %task.label, done = index + 1, total = task.frames.len(), "frames");
            }
        }

        result
    }

    /// Index and size of the first frame with a readable header. Every header
    /// failure before it is recorded.
    fn view_resolution(
        &self,
        frames: &[FrameHandle],
        result: &mut ChunkResult,
    ) -> Option<(usize, (u32, u32))> {
        for (index, frame) in frames.iter().enumerate() {
            match self.decoder.dimensions(&frame.path) {
                Ok(dims) => return Some((index, dims)),
                Err(err) => {
                    warn!(frame = %frame.file_name, error = %err, "unreadable frame header");
                    result.errors.push(err);
                }
            }
        }
        if frames.is_empty() {
            result.errors.push(WpdError::Grouping(format!(
                "view {} has AOIs but no frames",
                result.view_id
            )));
        }
        None
    }

    fn bright_mask(
        &self,
        frame: &FrameHandle,
        width: u32,
        height: u32,
        result: &mut ChunkResult,
    ) -> Option<BrightMask> {
        let raster = match self.decoder.decode(&frame.path) {
            Ok(raster) => raster,
            Err(err) => {
                warn!(frame = %frame.file_name, error = %err, "skipping frame");
                result.errors.push(err);
                return None;
            }
        };
        if (raster.width, raster.height) != (width, height) {
            let err = WpdError::ResolutionMismatch {
                path: frame.path.clone(),
                expected_width: width,
                expected_height: height,
                actual_width: raster.width,
                actual_height: raster.height,
            };
            warn!(frame = %frame.file_name, error = %err, "skipping frame");
            result.errors.push(err);
            return None;
        }
        Some(BrightMask::from_raster(&raster, self.threshold))
    }
}
