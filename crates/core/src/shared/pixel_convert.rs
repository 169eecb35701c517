//! Conversion of camera pixel layouts to packed RGB24.
//!
//! Everything except RGB24 goes through ffmpeg's software scaler, which does
//! the chroma upsampling and the BT.601 YUV matrix.

use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context, Flags};
use ffmpeg_next::util::frame::video::Video;
use image::{imageops, RgbImage};

use crate::shared::frame::{FrameError, PixelFormat, Rotation};

/// Converts a tightly packed buffer to RGB24. The caller guarantees the
/// buffer length matches [`PixelFormat::buffer_len`].
pub fn to_rgb24(
    data: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Vec<u8>, FrameError> {
    if format == PixelFormat::Rgb24 {
        return Ok(data.to_vec());
    }

    let source = unpack_planes(data, width, height, format);
    let mut scaler = Context::get(
        ffmpeg_pixel(format),
        width,
        height,
        Pixel::RGB24,
        width,
        height,
        Flags::BILINEAR,
    )
    .map_err(|e| FrameError::Conversion(e.to_string()))?;

    let mut rgb = Video::empty();
    scaler
        .run(&source, &mut rgb)
        .map_err(|e| FrameError::Conversion(e.to_string()))?;

    let row_bytes = width as usize * 3;
    let stride = rgb.stride(0);
    let plane = rgb.data(0);
    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(&plane[start..start + row_bytes]);
    }
    Ok(pixels)
}

/// Applies a clockwise rotation.
pub fn rotate(image: RgbImage, rotation: Rotation) -> RgbImage {
    match rotation {
        Rotation::Deg0 => image,
        Rotation::Deg90 => imageops::rotate90(&image),
        Rotation::Deg180 => imageops::rotate180(&image),
        Rotation::Deg270 => imageops::rotate270(&image),
    }
}

/// `(row bytes, rows)` of each plane of a tightly packed buffer, in order.
pub fn plane_layout(format: PixelFormat, width: u32, height: u32) -> Vec<(usize, usize)> {
    let w = width as usize;
    let h = height as usize;
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    match format {
        PixelFormat::Rgb24 => vec![(w * 3, h)],
        PixelFormat::Rgba8888 => vec![(w * 4, h)],
        PixelFormat::I420 => vec![(w, h), (cw, ch), (cw, ch)],
        PixelFormat::Nv21 => vec![(w, h), (cw * 2, ch)],
    }
}

fn ffmpeg_pixel(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Rgb24 => Pixel::RGB24,
        PixelFormat::Rgba8888 => Pixel::RGBA,
        PixelFormat::I420 => Pixel::YUV420P,
        PixelFormat::Nv21 => Pixel::NV21,
    }
}

/// Copies a packed buffer into an ffmpeg frame, whose rows may be padded.
fn unpack_planes(data: &[u8], width: u32, height: u32, format: PixelFormat) -> Video {
    let mut frame = Video::new(ffmpeg_pixel(format), width, height);
    let mut offset = 0;
    for (index, (row_bytes, rows)) in plane_layout(format, width, height).into_iter().enumerate() {
        let stride = frame.stride(index);
        let plane = frame.data_mut(index);
        for row in 0..rows {
            let start = row * stride;
            plane[start..start + row_bytes].copy_from_slice(&data[offset..offset + row_bytes]);
            offset += row_bytes;
        }
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    /// A uniform I420 frame with the given Y, U and V values.
    fn i420(width: u32, height: u32, y: u8, u: u8, v: u8) -> Vec<u8> {
        let luma = (width * height) as usize;
        let chroma = (width.div_ceil(2) * height.div_ceil(2)) as usize;
        let mut data = vec![y; luma];
        data.extend(std::iter::repeat(u).take(chroma));
        data.extend(std::iter::repeat(v).take(chroma));
        data
    }

    fn nv21(width: u32, height: u32, y: u8, u: u8, v: u8) -> Vec<u8> {
        let luma = (width * height) as usize;
        let chroma = (width.div_ceil(2) * height.div_ceil(2)) as usize;
        let mut data = vec![y; luma];
        for _ in 0..chroma {
            data.extend_from_slice(&[v, u]);
        }
        data
    }

    #[test]
    fn test_rgb24_passes_through() {
        let data: Vec<u8> = (0..24).collect();
        assert_eq!(to_rgb24(&data, 4, 2, PixelFormat::Rgb24).unwrap(), data);
    }

    #[test]
    fn test_rgba_drops_alpha() {
        let data: Vec<u8> = [10, 20, 30, 255].repeat(8 * 8);
        let rgb = to_rgb24(&data, 8, 8, PixelFormat::Rgba8888).unwrap();
        assert_eq!(rgb.len(), 8 * 8 * 3);
        assert_eq!(&rgb[..3], &[10, 20, 30]);
    }

    #[rstest]
    #[case::black(16, [0, 0, 0])]
    #[case::white(235, [255, 255, 255])]
    #[case::grey(126, [128, 128, 128])]
    fn test_yuv_neutral_colors(#[case] y: u8, #[case] expected: [u8; 3]) {
        let rgb = to_rgb24(&i420(8, 8, y, 128, 128), 8, 8, PixelFormat::I420).unwrap();
        for (got, want) in rgb[..3].iter().zip(expected.iter()) {
            assert!((*got as i32 - *want as i32).abs() <= 2, "{:?} vs {expected:?}", &rgb[..3]);
        }
    }

    #[test]
    fn test_yuv_high_v_is_red() {
        let rgb = to_rgb24(&i420(8, 8, 81, 90, 240), 8, 8, PixelFormat::I420).unwrap();
        let (r, g, b) = (rgb[0], rgb[1], rgb[2]);
        assert!(r > 200);
        assert!(g < 60);
        assert!(b < 60);
    }

    #[test]
    fn test_i420_and_nv21_agree() {
        let from_i420 = to_rgb24(&i420(8, 8, 81, 90, 240), 8, 8, PixelFormat::I420).unwrap();
        let from_nv21 = to_rgb24(&nv21(8, 8, 81, 90, 240), 8, 8, PixelFormat::Nv21).unwrap();
        for (a, b) in from_i420.iter().zip(from_nv21.iter()) {
            assert!((*a as i32 - *b as i32).abs() <= 2);
        }
    }

    #[test]
    fn test_i420_odd_dimensions() {
        let data = i420(17, 9, 128, 128, 128);
        assert_eq!(data.len(), PixelFormat::I420.buffer_len(17, 9));
        let rgb = to_rgb24(&data, 17, 9, PixelFormat::I420).unwrap();
        assert_eq!(rgb.len(), 17 * 9 * 3);
    }

    #[rstest]
    #[case::i420(PixelFormat::I420, 3)]
    #[case::nv21(PixelFormat::Nv21, 2)]
    #[case::rgba(PixelFormat::Rgba8888, 1)]
    fn test_plane_layout_covers_buffer(#[case] format: PixelFormat, #[case] planes: usize) {
        let layout = plane_layout(format, 5, 3);
        assert_eq!(layout.len(), planes);
        let total: usize = layout.iter().map(|(bytes, rows)| bytes * rows).sum();
        assert_eq!(total, format.buffer_len(5, 3));
    }

    #[test]
    fn test_rotate_90_moves_top_left_to_top_right() {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        let rotated = rotate(image, Rotation::Deg90);
        assert_eq!(rotated.dimensions(), (1, 2));
        assert_eq!(rotated.get_pixel(0, 0).0, [255, 0, 0]);
    }
}
