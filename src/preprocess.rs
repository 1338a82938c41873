use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use exif::{In, Reader, Tag};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::JPEG_QUALITY;
use crate::error::Result;
use crate::state::Side;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ImageFit {
    #[default]
    Contain,  // Scale into the box, pad with black
    Stretch,  // Fill the box, ignore aspect ratio
    Original, // Leave the size alone
}

impl From<String> for ImageFit {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "stretch" => ImageFit::Stretch,
            "original" => ImageFit::Original,
            _ => ImageFit::Contain,
        }
    }
}

impl From<ImageFit> for String {
    fn from(value: ImageFit) -> Self {
        match value {
            ImageFit::Contain => "contain",
            ImageFit::Stretch => "stretch",
            ImageFit::Original => "original",
        }
        .to_string()
    }
}

/// Clockwise rotation applied to every still.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl From<i64> for Rotation {
    fn from(degrees: i64) -> Self {
        match degrees.rem_euclid(360) {
            90 => Rotation::Cw90,
            180 => Rotation::Cw180,
            270 => Rotation::Cw270,
            _ => Rotation::None,
        }
    }
}

impl From<Rotation> for i64 {
    fn from(value: Rotation) -> Self {
        match value {
            Rotation::None => 0,
            Rotation::Cw90 => 90,
            Rotation::Cw180 => 180,
            Rotation::Cw270 => 270,
        }
    }
}

/// Result of preparing a still for a side.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Prepared {
    pub path: PathBuf,
    /// Lives in the scratch directory and may be deleted once used
    pub temporary: bool,
}

impl Prepared {
    fn original(path: &Path) -> Self {
        Self { path: path.to_path_buf(), temporary: false }
    }
}

static FRAME_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Rotates and fits `source` into `target`, writing a scratch JPEG only when something
/// actually changes. Any failure falls back to the untouched source.
pub fn prepare_image(
    source: &Path,
    target: (u32, u32),
    rotation: Rotation,
    fit: ImageFit,
    scratch: Option<&Path>,
    side: Side,
) -> Prepared {
    let orientation = exif_orientation(source);
    match needs_processing(source, target, rotation, fit, orientation) {
        Ok(false) => return Prepared::original(source),
        Ok(true) => {}
        Err(e) => {
            warn!(path = %source.display(), "Could not inspect image: {e}");
            return Prepared::original(source);
        }
    }

    let Some(scratch) = scratch else {
        warn!(path = %source.display(), "No scratch directory, showing image unprocessed");
        return Prepared::original(source);
    };

    match render(source, target, rotation, fit, orientation, scratch, side) {
        Ok(path) => Prepared { path, temporary: true },
        Err(e) => {
            warn!(path = %source.display(), "Could not prepare image: {e}");
            Prepared::original(source)
        }
    }
}

fn needs_processing(
    source: &Path,
    target: (u32, u32),
    rotation: Rotation,
    fit: ImageFit,
    orientation: u32,
) -> Result<bool> {
    if rotation != Rotation::None || orientation > 1 {
        return Ok(true);
    }
    if fit == ImageFit::Original {
        return Ok(false);
    }
    // Already exactly the size of the box
    Ok(image::image_dimensions(source)? != target)
}

fn render(
    source: &Path,
    (width, height): (u32, u32),
    rotation: Rotation,
    fit: ImageFit,
    orientation: u32,
    scratch: &Path,
    side: Side,
) -> Result<PathBuf> {
    let mut image = apply_orientation(image::open(source)?, orientation);

    image = match rotation {
        Rotation::None => image,
        Rotation::Cw90 => image.rotate90(),
        Rotation::Cw180 => image.rotate180(),
        Rotation::Cw270 => image.rotate270(),
    };

    let frame = match fit {
        ImageFit::Stretch => image.resize_exact(width, height, FilterType::Lanczos3).to_rgb8(),
        ImageFit::Contain => {
            let scaled = image.resize(width, height, FilterType::Lanczos3).to_rgb8();
            let mut canvas = RgbImage::from_pixel(width, height, Rgb([0, 0, 0]));
            let x = (width.saturating_sub(scaled.width()) / 2) as i64;
            let y = (height.saturating_sub(scaled.height()) / 2) as i64;
            imageops::overlay(&mut canvas, &scaled, x, y);
            canvas
        }
        ImageFit::Original => image.to_rgb8(),
    };

    let output = scratch.join(format!(
        "frame-{}-{}-{}.jpg",
        side.as_str(),
        Utc::now().timestamp_millis(),
        FRAME_SEQUENCE.fetch_add(1, Ordering::Relaxed)
    ));
    let mut file = File::create(&output)?;
    JpegEncoder::new_with_quality(&mut file, JPEG_QUALITY).encode_image(&frame)?;
    debug!(
        source = %source.display(),
        output = %output.display(),
        rotated = ?rotation,
        "Prepared {}x{} frame",
        frame.width(),
        frame.height()
    );
    Ok(output)
}

// EXIF orientation of JPEG files, 1 (as stored) when absent or unreadable
fn exif_orientation(path: &Path) -> u32 {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_lowercase();
    if extension != "jpg" && extension != "jpeg" {
        return 1;
    }
    let Ok(file) = File::open(path) else {
        return 1;
    };
    match Reader::new().read_from_container(&mut BufReader::new(file)) {
        Ok(exif) => exif
            .get_field(Tag::Orientation, In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1),
        Err(e) => {
            debug!(path = %path.display(), "No EXIF data: {e}");
            1
        }
    }
}

// 1 = as stored, 3 = 180 deg, 6 = 90 deg CW, 8 = 90 deg CCW; 2/4/5/7 add a mirror
fn apply_orientation(image: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(path: &Path, width: u32, height: u32, colour: [u8; 3]) {
        RgbImage::from_pixel(width, height, Rgb(colour)).save(path).unwrap();
    }

    fn is_red(pixel: &Rgb<u8>) -> bool {
        pixel[0] > 200 && pixel[1] < 60 && pixel[2] < 60
    }

    fn is_black(pixel: &Rgb<u8>) -> bool {
        pixel[0] < 40 && pixel[1] < 40 && pixel[2] < 40
    }

    #[test]
    fn contain_rotates_portrait_into_landscape_box() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("portrait.png");
        solid(&source, 100, 200, [255, 0, 0]);

        let prepared = prepare_image(&source, (200, 100), Rotation::Cw90, ImageFit::Contain, Some(dir.path()), Side::Primary);
        assert!(prepared.temporary);
        let output = image::open(&prepared.path).unwrap().to_rgb8();
        assert_eq!(output.dimensions(), (200, 100));
        // Rotated content exactly fills the box, centered
        assert!(is_red(output.get_pixel(100, 50)));
        assert!(is_red(output.get_pixel(5, 50)));
        assert!(is_red(output.get_pixel(194, 50)));
    }

    #[test]
    fn contain_pads_with_black_and_centers() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("square.png");
        solid(&source, 50, 50, [255, 0, 0]);

        let prepared = prepare_image(&source, (200, 100), Rotation::None, ImageFit::Contain, Some(dir.path()), Side::Secondary);
        let output = image::open(&prepared.path).unwrap().to_rgb8();
        assert_eq!(output.dimensions(), (200, 100));
        assert!(is_black(output.get_pixel(10, 50)));
        assert!(is_red(output.get_pixel(100, 50)));
        assert!(is_black(output.get_pixel(190, 50)));
        assert!(prepared.path.file_name().unwrap().to_string_lossy().starts_with("frame-secondary-"));
    }

    #[test]
    fn stretch_fills_the_box() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("wide.png");
        solid(&source, 300, 100, [255, 0, 0]);

        let prepared = prepare_image(&source, (120, 240), Rotation::None, ImageFit::Stretch, Some(dir.path()), Side::Primary);
        let output = image::open(&prepared.path).unwrap().to_rgb8();
        assert_eq!(output.dimensions(), (120, 240));
        assert!(is_red(output.get_pixel(3, 3)));
    }

    #[test]
    fn untouched_images_keep_their_path() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("exact.png");
        solid(&source, 160, 90, [0, 0, 255]);

        let original = prepare_image(&source, (640, 480), Rotation::None, ImageFit::Original, Some(dir.path()), Side::Primary);
        assert_eq!(original, Prepared { path: source.clone(), temporary: false });

        let exact = prepare_image(&source, (160, 90), Rotation::None, ImageFit::Contain, Some(dir.path()), Side::Primary);
        assert!(!exact.temporary);
        assert_eq!(exact.path, source);
    }

    #[test]
    fn original_fit_still_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("tall.png");
        solid(&source, 40, 80, [255, 0, 0]);

        let prepared = prepare_image(&source, (1920, 1080), Rotation::Cw270, ImageFit::Original, Some(dir.path()), Side::Primary);
        assert!(prepared.temporary);
        assert_eq!(image::image_dimensions(&prepared.path).unwrap(), (80, 40));
    }

    #[test]
    fn failures_fall_back_to_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.jpg");
        std::fs::write(&broken, b"not an image").unwrap();
        let prepared = prepare_image(&broken, (100, 100), Rotation::Cw90, ImageFit::Contain, Some(dir.path()), Side::Primary);
        assert_eq!(prepared.path, broken);
        assert!(!prepared.temporary);

        let source = dir.path().join("fine.png");
        solid(&source, 10, 10, [255, 0, 0]);
        let no_scratch = prepare_image(&source, (100, 100), Rotation::None, ImageFit::Contain, None, Side::Primary);
        assert_eq!(no_scratch.path, source);
    }

    #[test]
    fn rotation_and_fit_parse_leniently() {
        assert_eq!(Rotation::from(-90), Rotation::Cw270);
        assert_eq!(Rotation::from(450), Rotation::Cw90);
        assert_eq!(Rotation::from(45), Rotation::None);
        assert_eq!(ImageFit::from("STRETCH".to_string()), ImageFit::Stretch);
        assert_eq!(ImageFit::from("zoom".to_string()), ImageFit::Contain);
    }
}
