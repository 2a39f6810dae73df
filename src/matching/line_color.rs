//! Guessing the subway line from the color of the station roundel.

use image::RgbaImage;

use crate::prelude::*;

/// Roundel colors for lines 1 through 9.
const LINE_COLORS: [(&str, [u8; 3]); 9] = [
    ("1호선", [0, 82, 164]),
    ("2호선", [0, 168, 77]),
    ("3호선", [239, 124, 28]),
    ("4호선", [0, 164, 227]),
    ("5호선", [153, 108, 172]),
    ("6호선", [205, 124, 47]),
    ("7호선", [116, 127, 0]),
    ("8호선", [230, 24, 108]),
    ("9호선", [173, 173, 161]),
];

/// Fraction of the photo, from the top, that usually holds the roundel.
const SAMPLE_FRACTION: f64 = 0.35;

/// Look at every Nth pixel.
const PIXEL_STEP: usize = 10;

/// Gray levels outside this range are background, not roundel.
const MIN_GRAY: f64 = 20.0;
const MAX_GRAY: f64 = 250.0;

/// The line whose roundel color is nearest to `rgb`.
pub fn nearest_line(rgb: [u8; 3]) -> &'static str {
    let distance = |color: &[u8; 3]| -> i32 {
        color
            .iter()
            .zip(rgb)
            .map(|(&a, b)| (i32::from(a) - i32::from(b)).pow(2))
            .sum()
    };
    LINE_COLORS
        .iter()
        .min_by_key(|(_, color)| distance(color))
        .map(|(line, _)| *line)
        .unwrap_or(LINE_COLORS[0].0)
}

/// Average color of the sampled region, ignoring near-black, near-white and
/// transparent pixels.
pub fn sample_color(image: &RgbaImage) -> Option<[u8; 3]> {
    let width = image.width() as usize;
    let height = image.height() as usize;
    if width == 0 || height == 0 {
        return None;
    }
    let sample_height = ((height as f64 * SAMPLE_FRACTION).floor() as usize).max(1);
    let pixels = image.as_raw();
    let mut sums = [0u64; 3];
    let mut count = 0u64;
    for offset in (0..width * sample_height).step_by(PIXEL_STEP) {
        let px = &pixels[offset * 4..offset * 4 + 4];
        if px[3] < 128 {
            continue;
        }
        let gray = (f64::from(px[0]) + f64::from(px[1]) + f64::from(px[2])) / 3.0;
        if !(MIN_GRAY..=MAX_GRAY).contains(&gray) {
            continue;
        }
        for (sum, &channel) in sums.iter_mut().zip(&px[..3]) {
            *sum += u64::from(channel);
        }
        count += 1;
    }
    if count == 0 {
        return None;
    }
    Some(sums.map(|sum| (sum as f64 / count as f64).round() as u8))
}

/// Guess the line from an encoded location photo.
///
/// Returns `None` when the photo can't be decoded or has no usable pixels.
pub fn line_from_image(data: &[u8]) -> Option<&'static str> {
    let image = match image::load_from_memory(data) {
        Ok(image) => image.to_rgba8(),
        Err(err) => {
            debug!("Cannot decode location photo for color sampling: {err}");
            return None;
        }
    };
    let color = sample_color(&image)?;
    let line = nearest_line(color);
    debug!(?color, line, "Sampled roundel color");
    Some(line)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, Rgba};

    use super::*;

    fn encode_png(image: &RgbaImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_line_two_green() {
        let mut image = RgbaImage::from_pixel(40, 40, Rgba([0, 168, 77, 255]));
        // The bottom of the photo is ignored.
        for y in 20..40 {
            for x in 0..40 {
                image.put_pixel(x, y, Rgba([230, 24, 108, 255]));
            }
        }
        assert_eq!(line_from_image(&encode_png(&image)), Some("2호선"));
    }

    #[test]
    fn test_background_pixels_are_ignored() {
        let mut image = RgbaImage::from_pixel(30, 30, Rgba([255, 255, 255, 255]));
        for x in 0..30 {
            image.put_pixel(x, 0, Rgba([153, 108, 172, 255]));
        }
        assert_eq!(sample_color(&image), Some([153, 108, 172]));

        let blank = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 255]));
        assert_eq!(sample_color(&blank), None);
    }

    #[test]
    fn test_nearest_line() {
        assert_eq!(nearest_line([0, 80, 160]), "1호선");
        assert_eq!(nearest_line([240, 120, 30]), "3호선");
        assert_eq!(line_from_image(b"not an image"), None);
    }
}
