use std::io::Cursor;

use fable_contracts::data_url::{encode_data_url, DataUrlPolicy};
use image::{imageops, DynamicImage, ImageFormat, RgbaImage};

/// Longest side a padded canvas may grow to.
pub const MAX_CANVAS_SIDE: u32 = 8192;

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("source image is not a decodable data URL: {0}")]
    Decode(String),
    #[error("source image failed to load: {0}")]
    Load(#[source] image::ImageError),
    #[error(
        "padded canvas would be {width}x{height}, over the {limit} px limit",
        limit = MAX_CANVAS_SIDE
    )]
    Oversize { width: u64, height: u64 },
    #[error("padded canvas could not be rendered: {0}")]
    Render(#[source] image::ImageError),
}

/// Output canvas size plus where the source lands on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanvasGeometry {
    pub width: u32,
    pub height: u32,
    pub offset_x: u32,
    pub offset_y: u32,
}

/// Grows exactly one axis so that `width / height` matches `target_w / target_h`.
///
/// The grown axis may not exceed [`MAX_CANVAS_SIDE`] unless the source is
/// already that large along it.
pub fn canvas_geometry(
    width: u32,
    height: u32,
    target_w: f64,
    target_h: f64,
) -> Result<CanvasGeometry, ComposeError> {
    let original_ratio = width as f64 / height.max(1) as f64;
    let target_ratio = target_w / target_h;
    if target_ratio > original_ratio {
        let exact = height as f64 * target_ratio;
        let new_width = grown_side(exact, width).ok_or(ComposeError::Oversize {
            width: oversize_len(exact),
            height: u64::from(height),
        })?;
        Ok(CanvasGeometry {
            width: new_width,
            height,
            offset_x: (new_width - width) / 2,
            offset_y: 0,
        })
    } else {
        let exact = width as f64 / target_ratio;
        let new_height = grown_side(exact, height).ok_or(ComposeError::Oversize {
            width: u64::from(width),
            height: oversize_len(exact),
        })?;
        Ok(CanvasGeometry {
            width,
            height: new_height,
            offset_x: 0,
            offset_y: (new_height - height) / 2,
        })
    }
}

fn grown_side(exact: f64, original: u32) -> Option<u32> {
    let limit = MAX_CANVAS_SIDE.max(original);
    let rounded = exact.round();
    if !rounded.is_finite() || rounded > f64::from(limit) {
        return None;
    }
    Some((rounded as u32).max(original))
}

fn oversize_len(exact: f64) -> u64 {
    if exact.is_finite() {
        exact.round() as u64
    } else {
        u64::MAX
    }
}

/// Centers the source on a transparent canvas of the target ratio and
/// returns it as a PNG data URL.
pub fn pad_to_aspect_ratio(
    policy: &DataUrlPolicy,
    source_data_url: &str,
    target: (f64, f64),
) -> Result<String, ComposeError> {
    let (_, bytes) = policy
        .decode_bytes(source_data_url)
        .map_err(|err| ComposeError::Decode(format!("{err:#}")))?;
    let source = image::load_from_memory(&bytes).map_err(ComposeError::Load)?;
    let padded = pad_image(&source, target)?;

    let mut encoded = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(padded)
        .write_to(&mut encoded, ImageFormat::Png)
        .map_err(ComposeError::Render)?;
    Ok(encode_data_url("image/png", encoded.get_ref()))
}

fn pad_image(
    source: &DynamicImage,
    (target_w, target_h): (f64, f64),
) -> Result<RgbaImage, ComposeError> {
    let geometry = canvas_geometry(source.width(), source.height(), target_w, target_h)?;
    let rgba = source.to_rgba8();
    let mut canvas = RgbaImage::new(geometry.width, geometry.height);
    imageops::replace(
        &mut canvas,
        &rgba,
        i64::from(geometry.offset_x),
        i64::from(geometry.offset_y),
    );
    Ok(canvas)
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;

    fn solid_png(width: u32, height: u32) -> String {
        let image = RgbaImage::from_pixel(width, height, Rgba([200, 40, 40, 255]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        encode_data_url("image/png", out.get_ref())
    }

    fn decode(data_url: &str) -> DynamicImage {
        let (_, bytes) = DataUrlPolicy::default().decode_bytes(data_url).unwrap();
        image::load_from_memory(&bytes).unwrap()
    }

    #[test]
    fn wider_target_pads_horizontally() {
        let geometry = canvas_geometry(100, 100, 16.0, 9.0).unwrap();
        assert_eq!(geometry.height, 100);
        assert_eq!(geometry.width, 178);
        assert_eq!(geometry.offset_x, 39);
        assert_eq!(geometry.offset_y, 0);
    }

    #[test]
    fn taller_target_pads_vertically() {
        let geometry = canvas_geometry(160, 90, 1.0, 1.0).unwrap();
        assert_eq!((geometry.width, geometry.height), (160, 160));
        assert_eq!((geometry.offset_x, geometry.offset_y), (0, 35));
    }

    #[test]
    fn output_ratio_matches_target_within_rounding() {
        let sources = [(100, 100), (640, 480), (33, 77), (1920, 1080)];
        let targets = [(1.0, 1.0), (3.0, 4.0), (4.0, 3.0), (9.0, 16.0), (16.0, 9.0), (21.0, 9.0)];
        for (width, height) in sources {
            for (tw, th) in targets {
                let geometry = canvas_geometry(width, height, tw, th).unwrap();
                let ratio = geometry.width as f64 / geometry.height as f64;
                let tolerance = 1.0 / geometry.height.min(geometry.width) as f64 + 1e-9;
                assert!(
                    (ratio - tw / th).abs() <= tolerance * (tw / th).max(1.0),
                    "{width}x{height} -> {tw}:{th} gave {}x{}",
                    geometry.width,
                    geometry.height
                );
                assert!(geometry.offset_x + width <= geometry.width);
                assert!(geometry.offset_y + height <= geometry.height);
            }
        }
    }

    #[test]
    fn padded_image_is_centered_on_transparent_canvas() {
        let padded_url =
            pad_to_aspect_ratio(&DataUrlPolicy::default(), &solid_png(10, 10), (2.0, 1.0)).unwrap();
        let padded = decode(&padded_url);
        let rgba = padded.to_rgba8();
        assert_eq!((rgba.width(), rgba.height()), (20, 10));
        assert_eq!(rgba.get_pixel(0, 5)[3], 0);
        assert_eq!(rgba.get_pixel(19, 5)[3], 0);
        assert_eq!(*rgba.get_pixel(5, 5), Rgba([200, 40, 40, 255]));
        assert_eq!(*rgba.get_pixel(14, 5), Rgba([200, 40, 40, 255]));
    }

    #[test]
    fn undecodable_sources_are_load_or_decode_failures() {
        let policy = DataUrlPolicy::default();
        let err =
            pad_to_aspect_ratio(&policy, "data:image/png;base64,@@@", (1.0, 1.0)).unwrap_err();
        assert!(matches!(err, ComposeError::Decode(_)));

        let not_an_image = encode_data_url("image/png", b"definitely not a png");
        let err = pad_to_aspect_ratio(&policy, &not_an_image, (1.0, 1.0)).unwrap_err();
        assert!(matches!(err, ComposeError::Load(_)));
    }

    #[test]
    fn extreme_ratios_are_rejected_before_allocating() {
        let err = canvas_geometry(10, 10, 1e12, 1.0).unwrap_err();
        assert!(matches!(
            err,
            ComposeError::Oversize { width: 10_000_000_000_000, height: 10 }
        ));

        let err = canvas_geometry(1024, 1024, 100_000.0, 1.0).unwrap_err();
        assert!(matches!(err, ComposeError::Oversize { width: 102_400_000, .. }));

        let err = canvas_geometry(1024, 1024, 1.0, 100_000.0).unwrap_err();
        assert!(matches!(err, ComposeError::Oversize { height: 102_400_000, .. }));
        assert!(err.to_string().contains("8192 px limit"));

        let err = pad_to_aspect_ratio(&DataUrlPolicy::default(), &solid_png(10, 10), (1e9, 1.0))
            .unwrap_err();
        assert!(matches!(err, ComposeError::Oversize { .. }));
    }

    #[test]
    fn growth_up_to_the_side_limit_is_allowed() {
        let geometry = canvas_geometry(100, 1, 8192.0, 1.0).unwrap();
        assert_eq!((geometry.width, geometry.height), (MAX_CANVAS_SIDE, 1));
        assert!(canvas_geometry(100, 1, 8193.0, 1.0).is_err());

        let geometry = canvas_geometry(9000, 9000, 1.0, 1.0).unwrap();
        assert_eq!((geometry.width, geometry.height), (9000, 9000));
    }
}
