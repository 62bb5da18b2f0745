// THEORY:
// The `raster_mask` module turns geometry and thresholds into bits. Everything the
// exposure stage does per frame reduces to "AND two masks, count the ones", so both
// kinds of mask share one representation, `BitGrid`: a row-major bitset packed into
// `u64` words. Packing keeps the hot loop a straight zip over words with a hardware
// popcount, which the compiler vectorizes without any help.
//
// Two masks live here:
// 1.  `RasterMask`, one per AOI and view resolution. It is built once by scan-line
//     filling the polygon and caches its own pixel count.
// 2.  `BrightMask`, one per decoded frame. It marks `value > threshold` and is reused
//     against every AOI mask in the chunk.
//
// Fill rule: a pixel, addressed by its integer centre, is inside when an even-odd
// scan line through its centre places it between two edge crossings, or when a
// Bresenham trace of any edge passes through it. Edge pixels therefore always
// belong to the polygon, which matches how the boundaries were drawn.

use crate::core_modules::aoi::{AreaOfInterest, PixelPoint};
use crate::core_modules::frame_source::FrameRaster;
use std::collections::BTreeMap;

const WORD_BITS: usize = 64;

/// A dense boolean raster packed 64 pixels per word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitGrid {
    width: u32,
    height: u32,
    words: Vec<u64>,
}

impl BitGrid {
    pub fn new(width: u32, height: u32) -> Self {
        let bits = width as usize * height as usize;
        Self {
            width,
            height,
            words: vec![0; bits.div_ceil(WORD_BITS)],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32) {
        let i = self.index(x, y);
        self.words[i / WORD_BITS] |= 1u64 << (i % WORD_BITS);
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> bool {
        let i = self.index(x, y);
        self.words[i / WORD_BITS] & (1u64 << (i % WORD_BITS)) != 0
    }

    /// Sets `x0..=x1` on row `y`.
    fn fill_span(&mut self, y: u32, x0: u32, x1: u32) {
        for x in x0..=x1 {
            self.set(x, y);
        }
    }

    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// Coordinates of every set pixel, row-major.
    pub fn iter_ones(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let width = self.width as usize;
        self.words.iter().enumerate().flat_map(move |(w, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                let i = w * WORD_BITS + bit;
                Some(((i % width) as u32, (i / width) as u32))
            })
        })
    }

    /// `popcount(self AND other)`. Both grids must share a resolution.
    pub fn and_count(&self, other: &BitGrid) -> u64 {
        debug_assert_eq!((self.width, self.height), (other.width, other.height));
        self.words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| (a & b).count_ones() as u64)
            .sum()
    }
}

/// An AOI polygon rasterized at one view resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterMask {
    pub bits: BitGrid,
    /// Always equal to `bits.count_ones()`.
    pub total_pixels: u64,
}

impl RasterMask {
    pub fn from_polygon(polygon: &[PixelPoint], width: u32, height: u32) -> Self {
        let mut bits = BitGrid::new(width, height);
        if width > 0 && height > 0 && polygon.len() >= 3 {
            fill_interior(&mut bits, polygon);
            trace_edges(&mut bits, polygon);
        }
        let total_pixels = bits.count_ones();
        Self { bits, total_pixels }
    }

    /// Pixels of this AOI that are also bright in `frame`.
    pub fn passing_pixels(&self, frame: &BrightMask) -> u64 {
        self.bits.and_count(&frame.bits)
    }
}

/// Per-frame "brighter than threshold" mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrightMask {
    pub bits: BitGrid,
}

impl BrightMask {
    /// Strictly greater than `threshold` counts as bright.
    pub fn from_raster(raster: &FrameRaster, threshold: f64) -> Self {
        let mut bits = BitGrid::new(raster.width, raster.height);
        for (word, values) in bits.words.iter_mut().zip(raster.values.chunks(WORD_BITS)) {
            for (bit, value) in values.iter().enumerate() {
                if f64::from(*value) > threshold {
                    *word |= 1u64 << bit;
                }
            }
        }
        Self { bits }
    }
}

/// Chunk-local mask cache, keyed by AOI name. Built at chunk start, dropped at chunk end.
#[derive(Debug, Default)]
pub struct MaskCache {
    masks: BTreeMap<String, RasterMask>,
}

impl MaskCache {
    pub fn insert(&mut self, aoi: &AreaOfInterest, width: u32, height: u32) -> &RasterMask {
        let mask = RasterMask::from_polygon(&aoi.polygon, width, height);
        self.masks.entry(aoi.name.clone()).or_insert(mask)
    }

    pub fn get(&self, aoi_name: &str) -> Option<&RasterMask> {
        self.masks.get(aoi_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RasterMask)> {
        self.masks.iter()
    }

    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }
}

/// Even-odd scan-line fill over pixel centres, half-open in y.
fn fill_interior(bits: &mut BitGrid, polygon: &[PixelPoint]) {
    let min_y = polygon.iter().map(|p| p.y).min().unwrap_or(0).max(0);
    let max_y = polygon
        .iter()
        .map(|p| p.y)
        .max()
        .unwrap_or(0)
        .min(bits.height as i64 - 1);
    let last_x = bits.width as i64 - 1;

    let mut crossings: Vec<f64> = Vec::with_capacity(polygon.len());
    for y in min_y..=max_y {
        crossings.clear();
        let scan = y as f64;
        for (i, a) in polygon.iter().enumerate() {
            let b = polygon[(i + 1) % polygon.len()];
            if a.y == b.y {
                continue;
            }
            let (lo, hi) = if a.y < b.y { (a, &b) } else { (&b, a) };
            if scan >= lo.y as f64 && scan < hi.y as f64 {
                let t = (scan - lo.y as f64) / (hi.y - lo.y) as f64;
                crossings.push(lo.x as f64 + t * (hi.x - lo.x) as f64);
            }
        }
        crossings.sort_by(f64::total_cmp);

        for pair in crossings.chunks_exact(2) {
            let x0 = (pair[0].ceil() as i64).max(0);
            let x1 = (pair[1].floor() as i64).min(last_x);
            if x0 <= x1 {
                bits.fill_span(y as u32, x0 as u32, x1 as u32);
            }
        }
    }
}

/// Marks every pixel a Bresenham line along each edge passes through. Edges whose
/// bounding box misses the raster are not walked.
fn trace_edges(bits: &mut BitGrid, polygon: &[PixelPoint]) {
    let (w, h) = (bits.width as i64, bits.height as i64);
    for (i, a) in polygon.iter().enumerate() {
        let b = polygon[(i + 1) % polygon.len()];
        if a.x.max(b.x) < 0 || a.x.min(b.x) >= w || a.y.max(b.y) < 0 || a.y.min(b.y) >= h {
            continue;
        }
        let (mut x, mut y) = (a.x, a.y);
        let dx = (b.x - a.x).abs();
        let dy = -(b.y - a.y).abs();
        let sx = if a.x < b.x { 1 } else { -1 };
        let sy = if a.y < b.y { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            if (0..w).contains(&x) && (0..h).contains(&y) {
                bits.set(x as u32, y as u32);
            }
            if x == b.x && y == b.y {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(coords: &[(i64, i64)]) -> Vec<PixelPoint> {
        coords.iter().map(|&(x, y)| PixelPoint { x, y }).collect()
    }

    fn brute_count(mask: &RasterMask) -> u64 {
        let mut count = 0;
        for y in 0..mask.bits.height() {
            for x in 0..mask.bits.width() {
                if mask.bits.get(x, y) {
                    count += 1;
                }
            }
        }
        count
    }

    #[test]
    fn rectangle_includes_its_edges() {
        let mask = RasterMask::from_polygon(&points(&[(2, 2), (5, 2), (5, 4), (2, 4)]), 10, 10);
        assert_eq!(mask.total_pixels, 12);
        assert!(mask.bits.get(2, 2));
        assert!(mask.bits.get(5, 4));
        assert!(!mask.bits.get(6, 4));
        assert!(!mask.bits.get(2, 5));
    }

    #[test]
    fn right_triangle_matches_lattice_count() {
        // Pixels with x + y <= 4 in the first quadrant.
        let mask = RasterMask::from_polygon(&points(&[(0, 0), (4, 0), (0, 4)]), 8, 8);
        assert_eq!(mask.total_pixels, 15);
        assert!(mask.bits.get(2, 2));
        assert!(!mask.bits.get(3, 2));
    }

    #[test]
    fn polygons_are_clipped_to_the_raster() {
        let mask = RasterMask::from_polygon(&points(&[(-5, -5), (20, -5), (20, 20), (-5, 20)]), 4, 3);
        assert_eq!(mask.total_pixels, 12);
    }

    #[test]
    fn set_pixels_come_back_row_major() {
        let mask = RasterMask::from_polygon(&points(&[(1, 0), (2, 0), (2, 1), (1, 1)]), 70, 3);
        let ones: Vec<_> = mask.bits.iter_ones().collect();
        assert_eq!(ones, vec![(1, 0), (2, 0), (1, 1), (2, 1)]);
        assert_eq!(ones.len() as u64, mask.total_pixels);
    }

    #[test]
    fn far_away_polygon_is_empty() {
        let far = 1_000_000_000_000;
        let shape = points(&[(far, far), (far + 10, far), (far, -far)]);
        let mask = RasterMask::from_polygon(&shape, 16, 16);
        assert_eq!(mask.total_pixels, 0);
    }

    #[test]
    fn total_pixels_matches_bit_count_for_concave_shape() {
        let shape = points(&[(1, 1), (9, 1), (9, 9), (5, 4), (1, 9)]);
        let mask = RasterMask::from_polygon(&shape, 11, 11);
        assert_eq!(mask.total_pixels, brute_count(&mask));
        // The notch between the two prongs stays empty.
        assert!(!mask.bits.get(5, 8));
        assert!(mask.bits.get(2, 8));
    }

    #[test]
    fn bright_mask_is_strictly_greater_than_threshold() {
        let raster = FrameRaster::new(3, 1, vec![0.5, 1.0, 1.5]).expect("raster");
        let bright = BrightMask::from_raster(&raster, 1.0);
        assert!(!bright.bits.get(0, 0));
        assert!(!bright.bits.get(1, 0));
        assert!(bright.bits.get(2, 0));
    }

    #[test]
    fn passing_pixels_is_the_intersection_count() {
        let width = 70; // spans a word boundary on every row
        let mut values = vec![0.0f32; width * 2];
        for x in 60..70 {
            values[x] = 10.0;
            values[width + x] = 10.0;
        }
        let raster = FrameRaster::new(width as u32, 2, values).expect("raster");
        let bright = BrightMask::from_raster(&raster, 1.0);
        let mask = RasterMask::from_polygon(&points(&[(0, 0), (64, 0), (64, 1), (0, 1)]), width as u32, 2);

        let passing = mask.passing_pixels(&bright);
        assert_eq!(mask.total_pixels, 130);
        assert_eq!(passing, 10);
        assert!(passing <= mask.total_pixels);
    }

    #[test]
    fn cache_keeps_one_mask_per_aoi() {
        let aoi = AreaOfInterest {
            name: "U1_Bed".into(),
            display_name: "U1 Bed".into(),
            view_id: "plan_L1".into(),
            polygon: points(&[(0, 0), (2, 0), (2, 2), (0, 2)]),
            centroid: None,
        };
        let mut cache = MaskCache::default();
        assert_eq!(cache.insert(&aoi, 4, 4).total_pixels, 9);
        cache.insert(&aoi, 4, 4);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("U1_Bed").is_some());
    }
}
