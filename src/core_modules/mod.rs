pub mod aoi;
pub mod chunk_planner;
pub mod compliance;
pub mod daylight;
pub mod exposure;
pub mod frame_source;
pub mod pixel_map;
pub mod raster_mask;
pub mod report;
pub mod view_grouper;
pub mod wpd_writer;
