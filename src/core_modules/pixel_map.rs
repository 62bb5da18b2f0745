// Pixel-to-world calibration. The coordinate map written next to the rendered
// frames starts with a short header:
//
//     # Pixel to world coordinate map
//     # Image dimensions in pixels: width=2048, height=1778
//     # World dimensions in meters: width=29.480000, height=25.590000
//
// Only those two dimension lines are read. The per-pixel table below them is not.

use crate::error::{WpdError, WpdResult};
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelCalibration {
    pub image_width: u32,
    pub image_height: u32,
    pub world_width: f64,
    pub world_height: f64,
}

impl PixelCalibration {
    pub fn from_file(path: &Path) -> WpdResult<Self> {
        let text = fs::read_to_string(path)?;
        let calibration = Self::parse(&text)
            .map_err(|e| WpdError::Config(format!("{}: {e}", path.display())))?;
        info!(
            image = %format!("{}x{}", calibration.image_width, calibration.image_height),
            world_m = %format!("{}x{}", calibration.world_width, calibration.world_height),
            area_per_pixel = calibration.area_per_pixel(),
            "loaded pixel-to-world map"
        );
        Ok(calibration)
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let mut lines = text.lines().skip(1);
        let image_line = lines.next().ok_or("missing image dimensions line")?;
        let world_line = lines.next().ok_or("missing world dimensions line")?;

        let (image_width, image_height) = width_height(image_line)?;
        let (world_width, world_height) = width_height(world_line)?;
        let image_width: u32 = image_width
            .parse()
            .map_err(|e| format!("image width `{image_width}`: {e}"))?;
        let image_height: u32 = image_height
            .parse()
            .map_err(|e| format!("image height `{image_height}`: {e}"))?;
        let world_width: f64 = world_width
            .parse()
            .map_err(|e| format!("world width `{world_width}`: {e}"))?;
        let world_height: f64 = world_height
            .parse()
            .map_err(|e| format!("world height `{world_height}`: {e}"))?;

        if image_width == 0 || image_height == 0 {
            return Err("image dimensions must be non-zero".into());
        }
        Ok(Self {
            image_width,
            image_height,
            world_width,
            world_height,
        })
    }

    /// Square metres covered by one pixel, rounded to six decimals.
    pub fn area_per_pixel(&self) -> f64 {
        let x = self.world_width / f64::from(self.image_width);
        let y = self.world_height / f64::from(self.image_height);
        (x * y * 1e6).round() / 1e6
    }
}

/// Pulls the raw `width=` and `height=` values out of a header line.
fn width_height(line: &str) -> Result<(&str, &str), String> {
    let width = line
        .split_once("width=")
        .map(|(_, rest)| rest.split(',').next().unwrap_or(rest).trim())
        .ok_or_else(|| format!("no `width=` in `{line}`"))?;
    let height = line
        .split_once("height=")
        .map(|(_, rest)| rest.trim())
        .ok_or_else(|| format!("no `height=` in `{line}`"))?;
    Ok((width, height))
}
