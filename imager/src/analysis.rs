//! Frame analysis
//!
//! The orchestrator only needs a handful of measurements from a raw frame:
//! contrast, star positions, point spread statistics and a centroid digest
//! for drift. They sit behind [`FrameAnalyzer`] so tests can script focus
//! curves; [`BasicAnalyzer`] is the reference implementation.

use crate::config::StarPosition;
use crate::error::{ImagerError, ImagerResult};

pub const RAW_MONO8: u32 = 0x3157_4152;
pub const RAW_MONO16: u32 = 0x3257_4152;
pub const RAW_RGB24: u32 = 0x3357_4152;
pub const RAW_RGB48: u32 = 0x3657_4152;

const RAW_HEADER_SIZE: usize = 12;

/// Stars reported by one detection pass at most
pub const MAX_DETECTED_STARS: usize = 50;

/// Pixels around a saturated pixel excluded from contrast
const SATURATION_MARGIN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFormat {
    Mono8,
    Mono16,
    Rgb24,
    Rgb48,
}

impl RawFormat {
    pub fn from_signature(signature: u32) -> Option<Self> {
        match signature {
            RAW_MONO8 => Some(RawFormat::Mono8),
            RAW_MONO16 => Some(RawFormat::Mono16),
            RAW_RGB24 => Some(RawFormat::Rgb24),
            RAW_RGB48 => Some(RawFormat::Rgb48),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            RawFormat::Mono8 => 1,
            RawFormat::Mono16 => 2,
            RawFormat::Rgb24 => 3,
            RawFormat::Rgb48 => 6,
        }
    }

    pub fn max_value(self) -> f64 {
        match self {
            RawFormat::Mono8 | RawFormat::Rgb24 => 255.0,
            RawFormat::Mono16 | RawFormat::Rgb48 => 65535.0,
        }
    }

    pub fn is_color(self) -> bool {
        matches!(self, RawFormat::Rgb24 | RawFormat::Rgb48)
    }
}

/// Decoded raw frame, color frames reduced to luminance
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub format: RawFormat,
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<f64>,
}

impl RawFrame {
    /// Decode a raw buffer: 12 byte little endian header (signature, width, height)
    /// followed by the pixel data.
    pub fn parse(bytes: &[u8]) -> ImagerResult<Self> {
        if bytes.len() < RAW_HEADER_SIZE {
            return Err(ImagerError::ReceivedGarbage);
        }
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let format = RawFormat::from_signature(word(0)).ok_or(ImagerError::ReceivedGarbage)?;
        let width = word(4) as usize;
        let height = word(8) as usize;
        let expected = width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(format.bytes_per_pixel()))
            .ok_or(ImagerError::ReceivedGarbage)?;
        let data = &bytes[RAW_HEADER_SIZE..];
        if width == 0 || height == 0 || data.len() < expected {
            return Err(ImagerError::ReceivedGarbage);
        }
        let pixels = match format {
            RawFormat::Mono8 => data[..expected].iter().map(|&b| b as f64).collect(),
            RawFormat::Mono16 => data[..expected]
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]) as f64)
                .collect(),
            RawFormat::Rgb24 => data[..expected]
                .chunks_exact(3)
                .map(|c| (c[0] as f64 + c[1] as f64 + c[2] as f64) / 3.0)
                .collect(),
            RawFormat::Rgb48 => data[..expected]
                .chunks_exact(6)
                .map(|c| {
                    let r = u16::from_le_bytes([c[0], c[1]]) as f64;
                    let g = u16::from_le_bytes([c[2], c[3]]) as f64;
                    let b = u16::from_le_bytes([c[4], c[5]]) as f64;
                    (r + g + b) / 3.0
                })
                .collect(),
        };
        Ok(Self {
            format,
            width,
            height,
            pixels,
        })
    }

    pub fn at(&self, x: usize, y: usize) -> f64 {
        self.pixels[y * self.width + x]
    }

    fn saturation_level(&self) -> f64 {
        self.format.max_value() * 0.99
    }
}

/// Pixels excluded from contrast measurement
#[derive(Debug, Clone, PartialEq)]
pub struct SaturationMask {
    width: usize,
    height: usize,
    masked: Vec<bool>,
}

impl SaturationMask {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            masked: vec![false; width * height],
        }
    }

    pub fn is_masked(&self, x: usize, y: usize) -> bool {
        self.masked.get(y * self.width + x).copied().unwrap_or(false)
    }

    pub fn masked_count(&self) -> usize {
        self.masked.iter().filter(|m| **m).count()
    }

    fn fits(&self, frame: &RawFrame) -> bool {
        self.width == frame.width && self.height == frame.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contrast {
    pub contrast: f64,
    pub saturated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedStar {
    pub x: f64,
    pub y: f64,
    pub luminance: f64,
    pub oversaturated: bool,
    /// Distance from the frame center, 0 at the center and 1 in the corners
    pub nc_distance: f64,
    pub close_to_other: bool,
}

impl DetectedStar {
    /// Whether auto-selection may pick this star
    pub fn is_suitable(&self) -> bool {
        !self.oversaturated && self.nc_distance <= 0.5 && !self.close_to_other
    }
}

/// Point spread statistics at the selection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Psf {
    pub fwhm: f64,
    pub hfd: f64,
    pub peak: f64,
}

/// Centroid summary of the selected stars, compared between frames for drift
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameDigest {
    pub centroid_x: f64,
    pub centroid_y: f64,
    pub stars: usize,
}

pub trait FrameAnalyzer: Send + Sync {
    fn is_bayered(&self, _frame: &RawFrame) -> bool {
        false
    }

    /// Bring the four color filter array channels to a common level
    fn equalize_bayer(&self, _frame: &mut RawFrame) {}

    fn contrast(&self, frame: &RawFrame, mask: Option<&SaturationMask>) -> Contrast;

    /// Create the mask on first use and add the saturated areas of `frame`
    fn update_saturation_mask(&self, frame: &RawFrame, mask: &mut Option<SaturationMask>);

    /// Detect up to `max` stars, brightest first
    fn find_stars(&self, frame: &RawFrame, radius: f64, max: usize) -> Vec<DetectedStar>;

    /// Average point spread statistics over the pinned stars
    fn psf(&self, frame: &RawFrame, stars: &[StarPosition], radius: f64) -> Option<Psf>;

    /// Refine the pinned stars to their centroids and summarize them
    fn digest(&self, frame: &RawFrame, stars: &mut [StarPosition], radius: f64) -> Option<FrameDigest>;

    fn drift(&self, reference: &FrameDigest, current: &FrameDigest) -> (f64, f64) {
        (
            current.centroid_x - reference.centroid_x,
            current.centroid_y - reference.centroid_y,
        )
    }
}

// ============================================================================
// Reference implementation
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct StarMeasure {
    x: f64,
    y: f64,
    flux: f64,
    hfd: f64,
    fwhm: f64,
    peak: f64,
}

/// Straightforward moment based measurements
#[derive(Debug, Clone, Default)]
pub struct BasicAnalyzer {
    bayered: bool,
}

impl BasicAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat monochrome frames as raw color filter array data
    pub fn with_bayer(mut self, bayered: bool) -> Self {
        self.bayered = bayered;
        self
    }

    fn window(frame: &RawFrame, x: f64, y: f64, radius: f64) -> (usize, usize, usize, usize) {
        let r = radius.ceil().max(1.0);
        let x0 = (x - r).floor().max(0.0) as usize;
        let y0 = (y - r).floor().max(0.0) as usize;
        let x1 = ((x + r).ceil() as usize).min(frame.width.saturating_sub(1));
        let y1 = ((y + r).ceil() as usize).min(frame.height.saturating_sub(1));
        (x0, y0, x1, y1)
    }

    fn background(frame: &RawFrame, x0: usize, y0: usize, x1: usize, y1: usize) -> f64 {
        let mut values: Vec<f64> = (y0..=y1)
            .flat_map(|y| (x0..=x1).map(move |x| (x, y)))
            .map(|(x, y)| frame.at(x, y))
            .collect();
        if values.is_empty() {
            return 0.0;
        }
        values.sort_by(|a, b| a.total_cmp(b));
        values[values.len() / 2]
    }

    fn measure(frame: &RawFrame, x: f64, y: f64, radius: f64) -> Option<StarMeasure> {
        if x < 0.0 || y < 0.0 || x >= frame.width as f64 || y >= frame.height as f64 {
            return None;
        }
        let (x0, y0, x1, y1) = Self::window(frame, x, y, radius);
        let background = Self::background(frame, x0, y0, x1, y1);
        let inside = |px: usize, py: usize| {
            let dx = px as f64 - x;
            let dy = py as f64 - y;
            dx * dx + dy * dy <= radius * radius
        };

        let mut flux = 0.0;
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut peak: f64 = 0.0;
        for py in y0..=y1 {
            for px in x0..=x1 {
                if !inside(px, py) {
                    continue;
                }
                let value = (frame.at(px, py) - background).max(0.0);
                flux += value;
                sum_x += value * px as f64;
                sum_y += value * py as f64;
                peak = peak.max(value);
            }
        }
        if flux <= 0.0 || peak <= 0.0 {
            return None;
        }
        let cx = sum_x / flux;
        let cy = sum_y / flux;

        let mut radial = 0.0;
        let mut half_max_pixels = 0usize;
        for py in y0..=y1 {
            for px in x0..=x1 {
                if !inside(px, py) {
                    continue;
                }
                let value = (frame.at(px, py) - background).max(0.0);
                let dx = px as f64 - cx;
                let dy = py as f64 - cy;
                radial += value * (dx * dx + dy * dy).sqrt();
                if value > peak / 2.0 {
                    half_max_pixels += 1;
                }
            }
        }
        Some(StarMeasure {
            x: cx,
            y: cy,
            flux,
            hfd: 2.0 * radial / flux,
            fwhm: 2.0 * (half_max_pixels as f64 / std::f64::consts::PI).sqrt(),
            peak,
        })
    }
}

impl FrameAnalyzer for BasicAnalyzer {
    fn is_bayered(&self, frame: &RawFrame) -> bool {
        self.bayered && !frame.format.is_color()
    }

    fn equalize_bayer(&self, frame: &mut RawFrame) {
        let mut sums = [0.0f64; 4];
        let mut counts = [0usize; 4];
        for y in 0..frame.height {
            for x in 0..frame.width {
                let channel = (y % 2) * 2 + x % 2;
                sums[channel] += frame.at(x, y);
                counts[channel] += 1;
            }
        }
        let means: Vec<f64> = sums
            .iter()
            .zip(counts.iter())
            .map(|(s, c)| if *c > 0 { s / *c as f64 } else { 0.0 })
            .collect();
        let target = means.iter().cloned().fold(0.0, f64::max);
        if target <= 0.0 {
            return;
        }
        let width = frame.width;
        let max_value = frame.format.max_value();
        for (i, value) in frame.pixels.iter_mut().enumerate() {
            let channel = ((i / width) % 2) * 2 + (i % width) % 2;
            if means[channel] > 0.0 {
                *value = (*value * target / means[channel]).min(max_value);
            }
        }
    }

    fn contrast(&self, frame: &RawFrame, mask: Option<&SaturationMask>) -> Contrast {
        let mask = mask.filter(|m| m.fits(frame));
        let level = frame.saturation_level();
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        let mut count = 0usize;
        let mut saturated = false;
        for y in 0..frame.height {
            for x in 0..frame.width {
                if mask.map(|m| m.is_masked(x, y)).unwrap_or(false) {
                    continue;
                }
                let value = frame.at(x, y);
                if value >= level {
                    saturated = true;
                }
                sum += value;
                sum_sq += value * value;
                count += 1;
            }
        }
        if count == 0 || sum <= 0.0 {
            return Contrast {
                contrast: 0.0,
                saturated,
            };
        }
        let mean = sum / count as f64;
        let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
        Contrast {
            contrast: variance.sqrt() / mean,
            saturated,
        }
    }

    fn update_saturation_mask(&self, frame: &RawFrame, mask: &mut Option<SaturationMask>) {
        if !mask.as_ref().map(|m| m.fits(frame)).unwrap_or(false) {
            *mask = Some(SaturationMask::new(frame.width, frame.height));
        }
        let Some(mask) = mask.as_mut() else {
            return;
        };
        let level = frame.saturation_level();
        for y in 0..frame.height {
            for x in 0..frame.width {
                if frame.at(x, y) < level {
                    continue;
                }
                let x0 = x.saturating_sub(SATURATION_MARGIN);
                let y0 = y.saturating_sub(SATURATION_MARGIN);
                let x1 = (x + SATURATION_MARGIN).min(frame.width - 1);
                let y1 = (y + SATURATION_MARGIN).min(frame.height - 1);
                for my in y0..=y1 {
                    for mx in x0..=x1 {
                        mask.masked[my * frame.width + mx] = true;
                    }
                }
            }
        }
    }

    fn find_stars(&self, frame: &RawFrame, radius: f64, max: usize) -> Vec<DetectedStar> {
        let count = frame.pixels.len() as f64;
        if count == 0.0 {
            return Vec::new();
        }
        let mean = frame.pixels.iter().sum::<f64>() / count;
        let sigma = (frame.pixels.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count).sqrt();
        let threshold = mean + 5.0 * sigma.max(1.0);
        let edge = radius.ceil() as usize;
        if frame.width <= 2 * edge || frame.height <= 2 * edge {
            return Vec::new();
        }

        let mut candidates: Vec<(usize, usize, f64)> = Vec::new();
        for y in edge..frame.height - edge {
            for x in edge..frame.width - edge {
                let value = frame.at(x, y);
                if value < threshold {
                    continue;
                }
                let is_local_max = (y - 1..=y + 1)
                    .all(|ny| (x - 1..=x + 1).all(|nx| frame.at(nx, ny) <= value));
                if is_local_max {
                    candidates.push((x, y, value));
                }
            }
        }
        candidates.sort_by(|a, b| b.2.total_cmp(&a.2));

        let level = frame.saturation_level();
        let half_width = frame.width as f64 / 2.0;
        let half_height = frame.height as f64 / 2.0;
        let mut stars: Vec<DetectedStar> = Vec::new();
        for (x, y, value) in candidates {
            if stars.len() >= max {
                break;
            }
            let duplicate = stars.iter().any(|s| {
                (s.x - x as f64).abs() <= radius && (s.y - y as f64).abs() <= radius
            });
            if duplicate {
                continue;
            }
            let Some(measure) = Self::measure(frame, x as f64, y as f64, radius) else {
                continue;
            };
            let dx = (measure.x - half_width) / half_width;
            let dy = (measure.y - half_height) / half_height;
            stars.push(DetectedStar {
                x: measure.x,
                y: measure.y,
                luminance: measure.flux,
                oversaturated: value >= level,
                nc_distance: ((dx * dx + dy * dy) / 2.0).sqrt(),
                close_to_other: false,
            });
        }
        let positions: Vec<(f64, f64)> = stars.iter().map(|s| (s.x, s.y)).collect();
        for (i, star) in stars.iter_mut().enumerate() {
            star.close_to_other = positions.iter().enumerate().any(|(j, (x, y))| {
                i != j && ((star.x - x).powi(2) + (star.y - y).powi(2)).sqrt() < 2.0 * radius
            });
        }
        stars
    }

    fn psf(&self, frame: &RawFrame, stars: &[StarPosition], radius: f64) -> Option<Psf> {
        let measures: Vec<StarMeasure> = stars
            .iter()
            .filter(|s| s.is_pinned())
            .filter_map(|s| Self::measure(frame, s.x, s.y, radius))
            .collect();
        if measures.is_empty() {
            return None;
        }
        let n = measures.len() as f64;
        Some(Psf {
            fwhm: measures.iter().map(|m| m.fwhm).sum::<f64>() / n,
            hfd: measures.iter().map(|m| m.hfd).sum::<f64>() / n,
            peak: measures.iter().map(|m| m.peak).sum::<f64>() / n,
        })
    }

    fn digest(&self, frame: &RawFrame, stars: &mut [StarPosition], radius: f64) -> Option<FrameDigest> {
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut count = 0usize;
        for star in stars.iter_mut().filter(|s| s.is_pinned()) {
            if let Some(measure) = Self::measure(frame, star.x, star.y, radius) {
                star.x = measure.x;
                star.y = measure.y;
                sum_x += measure.x;
                sum_y += measure.y;
                count += 1;
            }
        }
        (count > 0).then(|| FrameDigest {
            centroid_x: sum_x / count as f64,
            centroid_y: sum_y / count as f64,
            stars: count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nightshade_indi::sim::render_raw_mono16;

    fn frame_with(stars: &[(f64, f64, f64, f64)]) -> RawFrame {
        RawFrame::parse(&render_raw_mono16(96, 96, stars, 0.0)).unwrap()
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            RawFrame::parse(b"SIMPLE  =   T"),
            Err(ImagerError::ReceivedGarbage)
        ));
        assert!(RawFrame::parse(&[0u8; 4]).is_err());

        let mut truncated = render_raw_mono16(8, 8, &[], 0.0);
        truncated.truncate(40);
        assert!(RawFrame::parse(&truncated).is_err());
    }

    #[test]
    fn test_parse_formats() {
        let frame = frame_with(&[]);
        assert_eq!(frame.format, RawFormat::Mono16);
        assert_eq!((frame.width, frame.height), (96, 96));
        assert_eq!(frame.at(3, 3), 100.0);

        let mut rgb = Vec::new();
        rgb.extend_from_slice(&RAW_RGB24.to_le_bytes());
        rgb.extend_from_slice(&1u32.to_le_bytes());
        rgb.extend_from_slice(&1u32.to_le_bytes());
        rgb.extend_from_slice(&[30, 60, 90]);
        let frame = RawFrame::parse(&rgb).unwrap();
        assert_eq!(frame.format, RawFormat::Rgb24);
        assert_eq!(frame.pixels, vec![60.0]);
    }

    #[test]
    fn test_find_stars_brightest_first() {
        let frame = frame_with(&[(30.0, 40.0, 1.5, 5000.0), (60.0, 50.0, 1.5, 15000.0)]);
        let stars = BasicAnalyzer::new().find_stars(&frame, 8.0, MAX_DETECTED_STARS);
        assert_eq!(stars.len(), 2);
        assert!((stars[0].x - 60.0).abs() < 0.1);
        assert!((stars[0].y - 50.0).abs() < 0.1);
        assert!(!stars[0].oversaturated);
        assert!(!stars[0].close_to_other);
        assert!(stars.iter().all(|s| s.is_suitable()));
    }

    #[test]
    fn test_find_stars_flags() {
        let frame = frame_with(&[(40.0, 40.0, 1.5, 70000.0), (48.0, 44.0, 1.5, 30000.0)]);
        let stars = BasicAnalyzer::new().find_stars(&frame, 6.0, MAX_DETECTED_STARS);
        assert_eq!(stars.len(), 2);
        assert!(stars[0].oversaturated);
        assert!(stars.iter().all(|s| s.close_to_other));
    }

    #[test]
    fn test_hfd_grows_with_defocus() {
        let analyzer = BasicAnalyzer::new();
        let selection = [StarPosition::new(48.0, 48.0)];
        let sharp = analyzer
            .psf(&frame_with(&[(48.0, 48.0, 1.2, 20000.0)]), &selection, 12.0)
            .unwrap();
        let soft = analyzer
            .psf(&frame_with(&[(48.0, 48.0, 3.0, 20000.0)]), &selection, 12.0)
            .unwrap();
        assert!(sharp.hfd < soft.hfd);
        assert!(sharp.fwhm < soft.fwhm);
        assert!(sharp.peak > soft.peak);
        assert!(analyzer.psf(&frame_with(&[]), &[StarPosition::default()], 12.0).is_none());
    }

    #[test]
    fn test_digest_follows_star() {
        let analyzer = BasicAnalyzer::new();
        let mut selection = [StarPosition::new(45.0, 46.0)];
        let reference = analyzer
            .digest(&frame_with(&[(47.0, 47.0, 1.5, 20000.0)]), &mut selection, 8.0)
            .unwrap();
        assert!((selection[0].x - 47.0).abs() < 0.05);
        let current = analyzer
            .digest(&frame_with(&[(49.0, 46.0, 1.5, 20000.0)]), &mut selection, 8.0)
            .unwrap();
        let (dx, dy) = analyzer.drift(&reference, &current);
        assert!((dx - 2.0).abs() < 0.05);
        assert!((dy + 1.0).abs() < 0.05);
    }

    #[test]
    fn test_saturation_mask_excludes_star() {
        let analyzer = BasicAnalyzer::new();
        let frame = frame_with(&[(48.0, 48.0, 2.0, 80000.0)]);
        let first = analyzer.contrast(&frame, None);
        assert!(first.saturated);

        let mut mask = None;
        analyzer.update_saturation_mask(&frame, &mut mask);
        let mask = mask.unwrap();
        assert!(mask.is_masked(48, 48));
        assert!(!mask.is_masked(5, 5));
        let masked = analyzer.contrast(&frame, Some(&mask));
        assert!(!masked.saturated);
        assert!(masked.contrast < first.contrast);
    }

    #[test]
    fn test_equalize_bayer_levels_channels() {
        let mut frame = RawFrame {
            format: RawFormat::Mono16,
            width: 4,
            height: 4,
            pixels: (0..16)
                .map(|i| if (i / 4) % 2 == 0 && i % 2 == 0 { 200.0 } else { 100.0 })
                .collect(),
        };
        let analyzer = BasicAnalyzer::new().with_bayer(true);
        assert!(analyzer.is_bayered(&frame));
        analyzer.equalize_bayer(&mut frame);
        assert!(frame.pixels.iter().all(|v| (*v - 200.0).abs() < 1e-9));
    }
}
