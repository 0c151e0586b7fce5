use ndarray::{Array2, Array3, Axis};

use super::SaliencyError;

/// Grad-CAM map at the activation resolution, rescaled to `[0, 1]`.
///
/// `w_c = mean_ij G[c]`, `L = relu(sum_c w_c * A[c])`, then min-max rescale.
/// A map with no positive evidence comes back all zeros.
pub fn class_activation_map(
    activations: &Array3<f32>,
    gradients: &Array3<f32>,
) -> Result<Array2<f32>, SaliencyError> {
    if activations.dim() != gradients.dim() {
        return Err(SaliencyError::ShapeMismatch {
            activations: activations.dim(),
            gradients: gradients.dim(),
        });
    }
    let (channels, h, w) = activations.dim();
    if channels == 0 || h == 0 || w == 0 {
        return Err(SaliencyError::Invariant(format!(
            "empty activation tensor {:?}",
            activations.dim()
        )));
    }

    let weights = gradients
        .mean_axis(Axis(2))
        .and_then(|g| g.mean_axis(Axis(1)))
        .ok_or_else(|| SaliencyError::Invariant("cannot pool gradients".into()))?;

    let mut cam = Array2::<f32>::zeros((h, w));
    for (c, weight) in weights.iter().enumerate() {
        cam.scaled_add(*weight, &activations.index_axis(Axis(0), c));
    }
    // Checked before ReLU: f32::max drops NaN.
    if cam.iter().any(|v| !v.is_finite()) {
        return Err(SaliencyError::Invariant("non-finite values in class activation map".into()));
    }
    cam.mapv_inplace(|v| v.max(0.0));

    let (min, max) = cam
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let span = max - min;
    if span > f32::EPSILON {
        cam.mapv_inplace(|v| (v - min) / span);
    } else {
        cam.fill(0.0);
    }
    Ok(cam)
}

/// Bilinear resize of a `[h, w]` map to `[height, width]` with half-pixel
/// centers (edges clamp).
pub fn upsample_bilinear(map: &Array2<f32>, width: u32, height: u32) -> Array2<f32> {
    let (in_h, in_w) = map.dim();
    let (out_h, out_w) = (height as usize, width as usize);
    if in_h == 0 || in_w == 0 {
        return Array2::zeros((out_h, out_w));
    }

    let scale_y = in_h as f32 / out_h.max(1) as f32;
    let scale_x = in_w as f32 / out_w.max(1) as f32;
    let source = |out: usize, scale: f32, len: usize| -> (usize, usize, f32) {
        let pos = ((out as f32 + 0.5) * scale - 0.5).clamp(0.0, (len - 1) as f32);
        let lo = pos.floor() as usize;
        let hi = (lo + 1).min(len - 1);
        (lo, hi, pos - lo as f32)
    };

    Array2::from_shape_fn((out_h, out_w), |(y, x)| {
        let (y0, y1, fy) = source(y, scale_y, in_h);
        let (x0, x1, fx) = source(x, scale_x, in_w);
        let top = map[[y0, x0]] * (1.0 - fx) + map[[y0, x1]] * fx;
        let bottom = map[[y1, x0]] * (1.0 - fx) + map[[y1, x1]] * fx;
        top * (1.0 - fy) + bottom * fy
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_are_spatial_mean_of_gradients() {
        // Channel 0 positive weight, channel 1 negative weight.
        let acts = Array3::from_shape_fn((2, 2, 2), |(c, y, x)| match c {
            0 => (y * 2 + x) as f32,
            _ => 1.0,
        });
        let grads = Array3::from_shape_fn((2, 2, 2), |(c, _, _)| if c == 0 { 1.0 } else { -0.5 });
        let cam = class_activation_map(&acts, &grads).unwrap();
        // L = A0 - 0.5 → [-0.5, 0.5, 1.5, 2.5] → relu → [0, 0.5, 1.5, 2.5] → /2.5
        assert!((cam[[0, 0]] - 0.0).abs() < 1e-6);
        assert!((cam[[0, 1]] - 0.2).abs() < 1e-6);
        assert!((cam[[1, 0]] - 0.6).abs() < 1e-6);
        assert!((cam[[1, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn negative_evidence_is_rectified_to_zero() {
        let acts = Array3::ones((1, 3, 3));
        let grads = Array3::from_elem((1, 3, 3), -1.0);
        let cam = class_activation_map(&acts, &grads).unwrap();
        assert!(cam.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let err = class_activation_map(&Array3::zeros((2, 7, 7)), &Array3::zeros((2, 7, 6))).unwrap_err();
        assert!(matches!(err, SaliencyError::ShapeMismatch { .. }));
    }

    #[test]
    fn nan_activations_are_invariant_violation() {
        let mut acts = Array3::ones((1, 2, 2));
        acts[[0, 0, 0]] = f32::NAN;
        let err = class_activation_map(&acts, &Array3::ones((1, 2, 2))).unwrap_err();
        assert!(matches!(err, SaliencyError::Invariant(_)));
    }

    #[test]
    fn output_is_unit_range() {
        let acts = Array3::from_shape_fn((3, 5, 5), |(c, y, x)| ((c + 1) * (y + x)) as f32);
        let grads = Array3::from_shape_fn((3, 5, 5), |(c, _, _)| c as f32 - 0.5);
        let cam = class_activation_map(&acts, &grads).unwrap();
        assert!(cam.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(cam.iter().any(|v| *v == 1.0));
    }

    #[test]
    fn upsample_matches_requested_dimensions() {
        let map = Array2::from_shape_fn((7, 7), |(y, x)| (y * 7 + x) as f32 / 48.0);
        let up = upsample_bilinear(&map, 640, 480);
        assert_eq!(up.dim(), (480, 640));
        assert!(up.iter().all(|v| (-1e-6..=1.0 + 1e-6).contains(v)));
    }

    #[test]
    fn upsample_constant_stays_constant() {
        let up = upsample_bilinear(&Array2::from_elem((3, 3), 0.25), 10, 4);
        assert!(up.iter().all(|v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn upsample_is_smooth_between_cells() {
        let map = Array2::from_shape_vec((1, 2), vec![0.0, 1.0]).unwrap();
        let up = upsample_bilinear(&map, 4, 1);
        // Source positions -0.25 (clamped), 0.25, 0.75, 1.25 (clamped).
        let row: Vec<f32> = up.row(0).to_vec();
        assert_eq!(row[0], 0.0);
        assert!((row[1] - 0.25).abs() < 1e-6);
        assert!((row[2] - 0.75).abs() < 1e-6);
        assert_eq!(row[3], 1.0);
    }
}
