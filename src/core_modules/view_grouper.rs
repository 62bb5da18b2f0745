// THEORY:
// The `view_grouper` partitions a run's inputs by view. Every AOI names its view in
// its own header; every frame is attached to the first view whose id occurs in the
// frame's file name. The result is the unit of work the chunk planner splits up.
//
// Policies carried here:
// 1.  **Idempotent skip**: an AOI whose `<stem>.wpd` already exists is left alone
//     when `skip_existing` is set. Stale outputs have to be deleted by hand.
// 2.  **Local failure**: an AOI without a view id, or a frame matching no view, is
//     reported and excluded. Neither stops the run.
// 3.  **Ambiguous matches**: substring matching cannot tell `L1` from `L10`. Frames
//     matching several views still go to the first one in sorted order, but they
//     are flagged so the operator can see it.

use crate::core_modules::aoi::AoiFile;
use crate::core_modules::frame_source::FrameHandle;
use crate::core_modules::wpd_writer::wpd_path_for;
use crate::error::WpdError;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// All AOIs and frames that share one view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewGroup {
    pub view_id: String,
    pub aois: Vec<AoiFile>,
    pub frames: Vec<FrameHandle>,
}

/// The grouping plus everything that was left out of it.
#[derive(Debug, Default)]
pub struct GroupingOutcome {
    pub groups: BTreeMap<String, ViewGroup>,
    /// AOI names skipped because their output already exists.
    pub skipped_existing: Vec<String>,
    /// AOIs without a usable view id.
    pub ungrouped_aois: Vec<WpdError>,
    /// Frame file names that matched no view.
    pub unmatched_frames: Vec<String>,
    /// Frame file names that matched more than one view, with every view they matched.
    pub ambiguous_frames: Vec<(String, Vec<String>)>,
}

impl GroupingOutcome {
    pub fn grouped_aoi_count(&self) -> usize {
        self.groups.values().map(|g| g.aois.len()).sum()
    }

    pub fn grouped_frame_count(&self) -> usize {
        self.groups.values().map(|g| g.frames.len()).sum()
    }

    /// Sorted frame ids of each grouped AOI's view, keyed by AOI name. AOIs of one
    /// view share the same list.
    pub fn frame_timelines(&self) -> BTreeMap<String, Arc<[String]>> {
        let mut timelines = BTreeMap::new();
        for group in self.groups.values() {
            let mut ids: Vec<String> = group.frames.iter().map(|f| f.frame_id.clone()).collect();
            ids.sort();
            ids.dedup();
            let shared: Arc<[String]> = ids.into();
            for aoi in &group.aois {
                timelines.insert(aoi.name.clone(), Arc::clone(&shared));
            }
        }
        timelines
    }
}

/// Groups AOIs by their declared view and attaches frames by substring match.
pub fn group_by_view(
    aois: &[AoiFile],
    frames: &[FrameHandle],
    output_dir: &Path,
    skip_existing: bool,
) -> GroupingOutcome {
    let mut outcome = GroupingOutcome::default();

    for aoi in aois {
        if skip_existing && wpd_path_for(output_dir, &aoi.name).exists() {
            debug!(aoi = %aoi.name, "output exists, skipping");
            outcome.skipped_existing.push(aoi.name.clone());
            continue;
        }
        match aoi.read_view_id() {
            Ok(view_id) => {
                outcome
                    .groups
                    .entry(view_id.clone())
                    .or_insert_with(|| ViewGroup {
                        view_id,
                        ..ViewGroup::default()
                    })
                    .aois
                    .push(aoi.clone());
            }
            Err(err) => {
                warn!(aoi = %aoi.name, error = %err, "AOI excluded from grouping");
                outcome.ungrouped_aois.push(err);
            }
        }
    }

    info!(
        aois = outcome.grouped_aoi_count(),
        views = outcome.groups.len(),
        skipped = outcome.skipped_existing.len(),
        "grouped AOI files by associated view"
    );

    for frame in frames {
        let matches: Vec<&String> = outcome
            .groups
            .keys()
            .filter(|view_id| frame.file_name.contains(view_id.as_str()))
            .collect();

        let Some(first) = matches.first().map(|v| (*v).clone()) else {
            outcome.unmatched_frames.push(frame.file_name.clone());
            continue;
        };
        if matches.len() > 1 {
            let all: Vec<String> = matches.iter().map(|v| (*v).clone()).collect();
            warn!(
                frame = %frame.file_name,
                views = ?all,
                assigned = %first,
                "frame name matches more than one view"
            );
            outcome.ambiguous_frames.push((frame.file_name.clone(), all));
        }
        if let Some(group) = outcome.groups.get_mut(&first) {
            group.frames.push(frame.clone());
        }
    }

    if !outcome.unmatched_frames.is_empty() {
        warn!(
            count = outcome.unmatched_frames.len(),
            first = ?outcome.unmatched_frames.iter().take(3).collect::<Vec<_>>(),
            "frames matched no view group"
        );
    }
    for group in outcome.groups.values() {
        info!(
            view = %group.view_id,
            aois = group.aois.len(),
            frames = group.frames.len(),
            operations = group.aois.len() * group.frames.len(),
            "view group"
        );
    }

    outcome
}
