//! Pixel conversion and compositing math
//!
//! Decoded frames arrive as RGB or straight-alpha RGBA bytes. Buffers shared
//! with the compositor hold `wl_shm` ARGB8888 words: premultiplied alpha,
//! stored little-endian (B, G, R, A in memory). The drawing primitives in
//! `tiny-skia` treat the four channels independently, so they operate on
//! those bytes directly.

use crate::config::{Anchor, Filter, ScalingMode};
use tiny_skia::{BlendMode, FilterQuality, Paint, Pattern, PixmapMut, PixmapRef, Rect, SpreadMode, Transform};

/// Bytes per native pixel word
pub const BYTES_PER_PIXEL: usize = 4;

/// Row stride in bytes of a native image `width` pixels wide
pub fn format_stride(width: u32) -> usize {
    width as usize * BYTES_PER_PIXEL
}

/// Multiply a colour channel by alpha, rounding to nearest.
///
/// Integer form of `round(c * alpha / 255)`, exact over the whole `u8` range.
#[inline]
pub fn premultiply(channel: u8, alpha: u8) -> u8 {
    let v = channel as u32 * alpha as u32 + 0x80;
    ((v + (v >> 8)) >> 8) as u8
}

/// Convert one source pixel to the native ARGB32 word, as stored bytes.
///
/// Three channels are opaque RGB; four are straight-alpha RGBA.
#[inline]
pub fn convert_pixel(pixel: &[u8], channels: u8) -> [u8; BYTES_PER_PIXEL] {
    let (r, g, b, a) = if channels == 3 {
        (pixel[0], pixel[1], pixel[2], 0xff)
    } else {
        let a = pixel[3];
        (
            premultiply(pixel[0], a),
            premultiply(pixel[1], a),
            premultiply(pixel[2], a),
            a,
        )
    };
    let word = (a as u32) << 24 | (r as u32) << 16 | (g as u32) << 8 | b as u32;
    word.to_le_bytes()
}

/// Convert a whole image of source pixels into native pixels.
///
/// Copies the overlapping region when the two images differ in size.
/// Returns false when the channel count is unsupported.
pub fn convert(
    source: &[u8],
    width: u32,
    height: u32,
    source_stride: usize,
    channels: u8,
    target: &mut [u8],
    target_width: u32,
    target_height: u32,
) -> bool {
    if channels != 3 && channels != 4 {
        return false;
    }

    let step = channels as usize;
    let columns = width.min(target_width) as usize;
    let rows = height.min(target_height) as usize;
    let target_stride = format_stride(target_width);

    for row in 0..rows {
        let src = &source[row * source_stride..][..columns * step];
        let dst = &mut target[row * target_stride..][..columns * BYTES_PER_PIXEL];
        for (pixel, out) in src.chunks_exact(step).zip(dst.chunks_exact_mut(BYTES_PER_PIXEL)) {
            out.copy_from_slice(&convert_pixel(pixel, channels));
        }
    }
    true
}

/// Uniform cover scale and source-space offset for `fill` mode
pub fn fit(source_w: f64, source_h: f64, dest_w: f64, dest_h: f64, anchor: Anchor) -> (f64, f64, f64) {
    let window_ratio = dest_w / dest_h;
    let source_ratio = source_w / source_h;

    if window_ratio > source_ratio {
        // Clipped vertically
        let scale = dest_w / source_w;
        let offset = if anchor.contains(Anchor::TOP) {
            0.0
        } else if anchor.contains(Anchor::BOTTOM) {
            dest_h / scale - source_h
        } else {
            dest_h / 2.0 / scale - source_h / 2.0
        };
        (scale, 0.0, offset)
    } else {
        // Clipped horizontally
        let scale = dest_h / source_h;
        let offset = if anchor.contains(Anchor::LEFT) {
            0.0
        } else if anchor.contains(Anchor::RIGHT) {
            dest_w / scale - source_w
        } else {
            dest_w / 2.0 / scale - source_w / 2.0
        };
        (scale, offset, 0.0)
    }
}

/// Independent axis scales for `stretch` mode
pub fn stretch(source_w: f64, source_h: f64, dest_w: f64, dest_h: f64) -> (f64, f64) {
    (dest_w / source_w, dest_h / source_h)
}

/// Scale for `tile` mode: one image pixel per logical output pixel
pub fn tile(output_scale: i32) -> f64 {
    output_scale as f64
}

/// Where and how the source is drawn onto a buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub scale_x: f64,
    pub scale_y: f64,
    /// Offset in source-space units
    pub offset_x: f64,
    pub offset_y: f64,
    pub repeat: bool,
}

impl Placement {
    /// Compute the placement for a source of `source` size on a buffer of
    /// `dest` pixels belonging to an output with `output_scale`.
    pub fn new(
        mode: ScalingMode,
        anchor: Anchor,
        source: (u32, u32),
        dest: (u32, u32),
        output_scale: i32,
    ) -> Self {
        let (sw, sh) = (source.0 as f64, source.1 as f64);
        let (dw, dh) = (dest.0 as f64, dest.1 as f64);

        match mode {
            ScalingMode::Fill => {
                let (scale, offset_x, offset_y) = fit(sw, sh, dw, dh, anchor);
                Self { scale_x: scale, scale_y: scale, offset_x, offset_y, repeat: false }
            }
            ScalingMode::Stretch => {
                let (scale_x, scale_y) = stretch(sw, sh, dw, dh);
                Self { scale_x, scale_y, offset_x: 0.0, offset_y: 0.0, repeat: false }
            }
            ScalingMode::Tile => {
                let scale = tile(output_scale);
                Self { scale_x: scale, scale_y: scale, offset_x: 0.0, offset_y: 0.0, repeat: true }
            }
        }
    }
}

impl Filter {
    /// Sampling quality handed to the drawing primitive
    pub fn quality(self) -> FilterQuality {
        match self {
            Filter::Fast | Filter::Nearest => FilterQuality::Nearest,
            Filter::Good | Filter::Bilinear => FilterQuality::Bilinear,
            Filter::Best => FilterQuality::Bicubic,
        }
    }
}

/// Paint `source` over the whole of `target` according to `placement`
pub fn composite(source: PixmapRef<'_>, target: &mut PixmapMut<'_>, placement: &Placement, filter: Filter) {
    if placement.scale_x <= 0.0 || placement.scale_y <= 0.0 {
        return;
    }

    let spread = if placement.repeat { SpreadMode::Repeat } else { SpreadMode::Pad };
    let shader = Pattern::new(
        source,
        spread,
        filter.quality(),
        1.0,
        Transform::from_translate(placement.offset_x as f32, placement.offset_y as f32),
    );
    let paint = Paint {
        shader,
        blend_mode: BlendMode::Source,
        anti_alias: false,
        ..Paint::default()
    };

    // The rectangle is in source space; the transform scales it to cover the buffer.
    let width = target.width() as f64 / placement.scale_x;
    let height = target.height() as f64 / placement.scale_y;
    let Some(rect) = Rect::from_xywh(0.0, 0.0, width as f32, height as f32) else {
        return;
    };

    let transform = Transform::from_scale(placement.scale_x as f32, placement.scale_y as f32);
    target.fill_rect(rect, &paint, transform, None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiny_skia::Pixmap;

    #[test]
    fn test_premultiply_matches_float_reference() {
        for c in 0..=255u32 {
            for a in 0..=255u32 {
                let expected = (c as f64 * a as f64 / 255.0).round() as u8;
                assert_eq!(premultiply(c as u8, a as u8), expected, "c={c} a={a}");
            }
        }
    }

    #[test]
    fn test_convert_pixel_layouts() {
        // RGB is forced opaque and stored B, G, R, A
        assert_eq!(convert_pixel(&[0x11, 0x22, 0x33], 3), [0x33, 0x22, 0x11, 0xff]);
        // RGBA is premultiplied, alpha passes through
        assert_eq!(convert_pixel(&[255, 128, 0, 128], 4), [0, 64, 128, 128]);
        assert_eq!(convert_pixel(&[200, 100, 50, 0], 4), [0, 0, 0, 0]);
    }

    #[test]
    fn test_convert_rows_respect_strides() {
        // 2x2 RGB with 2 bytes of row padding
        let source = [1, 2, 3, 4, 5, 6, 0, 0, 7, 8, 9, 10, 11, 12, 0, 0];
        let mut target = vec![0u8; 16];
        assert!(convert(&source, 2, 2, 8, 3, &mut target, 2, 2));
        assert_eq!(&target[..8], &[3, 2, 1, 255, 6, 5, 4, 255]);
        assert_eq!(&target[8..], &[9, 8, 7, 255, 12, 11, 10, 255]);

        assert!(!convert(&source, 2, 2, 8, 2, &mut target, 2, 2));
    }

    #[test]
    fn test_fit_covers_destination() {
        let sizes = [(1.0, 1.0), (100.0, 50.0), (50.0, 100.0), (1920.0, 1080.0), (3.0, 7.0)];
        for &(sw, sh) in &sizes {
            for &(dw, dh) in &sizes {
                let (scale, _, _) = fit(sw, sh, dw, dh, Anchor::empty());
                assert!(scale * sw >= dw - 1e-9, "{sw}x{sh} -> {dw}x{dh}");
                assert!(scale * sh >= dh - 1e-9, "{sw}x{sh} -> {dw}x{dh}");
            }
        }
    }

    #[test]
    fn test_fit_center_is_average_of_edges() {
        // Clipped vertically
        let (_, _, top) = fit(100.0, 100.0, 1920.0, 1080.0, Anchor::TOP);
        let (_, _, bottom) = fit(100.0, 100.0, 1920.0, 1080.0, Anchor::BOTTOM);
        let (_, _, center) = fit(100.0, 100.0, 1920.0, 1080.0, Anchor::empty());
        assert_eq!(top, 0.0);
        assert!((center - (top + bottom) / 2.0).abs() < 1e-9);

        // Clipped horizontally
        let (_, left, _) = fit(400.0, 100.0, 1920.0, 1080.0, Anchor::LEFT);
        let (_, right, _) = fit(400.0, 100.0, 1920.0, 1080.0, Anchor::RIGHT);
        let (_, center, _) = fit(400.0, 100.0, 1920.0, 1080.0, Anchor::TOP);
        assert_eq!(left, 0.0);
        assert!(right < 0.0);
        assert!((center - (left + right) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_placement_modes() {
        let stretch = Placement::new(ScalingMode::Stretch, Anchor::empty(), (100, 50), (200, 200), 1);
        assert_eq!((stretch.scale_x, stretch.scale_y), (2.0, 4.0));

        let tiled = Placement::new(ScalingMode::Tile, Anchor::TOP, (100, 50), (200, 200), 2);
        assert_eq!((tiled.scale_x, tiled.scale_y), (2.0, 2.0));
        assert!(tiled.repeat);
    }

    #[test]
    fn test_composite_fills_buffer() {
        let mut source = Pixmap::new(2, 2).unwrap();
        source.fill(tiny_skia::Color::from_rgba8(10, 20, 30, 255));

        let mut data = vec![0u8; 8 * 4 * 4];
        let mut target = PixmapMut::from_bytes(&mut data, 8, 4).unwrap();
        let placement = Placement::new(ScalingMode::Fill, Anchor::empty(), (2, 2), (8, 4), 1);
        composite(source.as_ref(), &mut target, &placement, Filter::Nearest);

        for pixel in data.chunks_exact(4) {
            assert_eq!(pixel, &[10, 20, 30, 255]);
        }
    }
}
