use image::{Rgb, RgbImage};
use ndarray::Array2;

/// Jet palette: dark blue (0) → cyan → yellow → dark red (1).
pub fn jet(value: f32) -> [u8; 3] {
    let v = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
    let channel = |offset: f32| {
        let c = (1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0);
        (c * 255.0).round() as u8
    };
    [channel(3.0), channel(2.0), channel(1.0)]
}

/// `original * (1 - opacity) + jet(intensity) * opacity`, per pixel.
///
/// `intensity` is `[height, width]` and must match the original raster.
pub fn blend_overlay(original: &RgbImage, intensity: &Array2<f32>, opacity: f32) -> Option<RgbImage> {
    let (width, height) = original.dimensions();
    if intensity.dim() != (height as usize, width as usize) {
        return None;
    }
    let alpha = opacity.clamp(0.0, 1.0);

    Some(RgbImage::from_fn(width, height, |x, y| {
        let base = original.get_pixel(x, y).0;
        let heat = jet(intensity[[y as usize, x as usize]]);
        let mut out = [0u8; 3];
        for c in 0..3 {
            let mixed = base[c] as f32 * (1.0 - alpha) + heat[c] as f32 * alpha;
            out[c] = mixed.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(out)
    }))
}
