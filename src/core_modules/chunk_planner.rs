// THEORY:
// The `ChunkPlanner` turns view groups into independent units of parallel work.
// A chunk is a slice of one view's AOI list together with *all* of that view's frames.
//
// Key architectural principles:
// 1.  **Fixed heuristic**: `chunks_per_view = max(1, workers / views)` and
//     `chunk_size = max(1, aois / chunks_per_view)`, both floor divisions. This is not
//     bin packing. It is simple on purpose and reproduced exactly so plans are testable.
// 2.  **AOI-disjoint**: chunks of one view take consecutive, non-overlapping slices of
//     its AOI list. The union of a view's chunks is its AOI list, in order.
// 3.  **Frames are never split**: every chunk re-derives bright masks for every frame
//     of its view. That is the price of workers never talking to each other. The
//     frame list is shared read-only behind an `Arc`.

pub mod chunk_planner {
    use crate::core_modules::aoi::AoiFile;
    use crate::core_modules::frame_source::FrameHandle;
    use crate::core_modules::view_grouper::ViewGroup;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    /// One independent unit of work: a slice of AOIs and every frame of their view.
    #[derive(Debug, Clone)]
    pub struct ChunkTask {
        /// Unique label, `<view>_chunk_<n>`.
        pub label: String,
        pub view_id: String,
        pub aois: Vec<AoiFile>,
        /// All frames of the parent view, shared by every chunk of that view.
        pub frames: Arc<[FrameHandle]>,
    }

    pub fn chunks_per_view(worker_count: usize, view_count: usize) -> usize {
        if view_count == 0 {
            return 1;
        }
        (worker_count / view_count).max(1)
    }

    pub fn chunk_size(aoi_count: usize, chunks_per_view: usize) -> usize {
        (aoi_count / chunks_per_view.max(1)).max(1)
    }

    /// Splits every view's AOIs into chunks, in view order then slice order.
    pub fn plan_chunks(groups: &BTreeMap<String, ViewGroup>, worker_count: usize) -> Vec<ChunkTask> {
        let per_view = chunks_per_view(worker_count, groups.len());
        let mut tasks = Vec::new();

        for group in groups.values() {
            if group.aois.is_empty() {
                continue;
            }
            let frames: Arc<[FrameHandle]> = group.frames.clone().into();
            let size = chunk_size(group.aois.len(), per_view);

            for (index, slice) in group.aois.chunks(size).enumerate() {
                tasks.push(ChunkTask {
                    label: format!("{}_chunk_{index}", group.view_id),
                    view_id: group.view_id.clone(),
                    aois: slice.to_vec(),
                    frames: Arc::clone(&frames),
                });
            }
        }

        tasks
    }
}
