//! DICOM intensity windowing: pick a window/level for the study, clip, and
//! rescale linearly to 0–255.

use serde::{Deserialize, Serialize};

use crate::pipeline::types::ImageModality;

/// Lower/upper percentiles for the automatic window on non-calibrated data.
const AUTO_WINDOW_LOW_PERCENTILE: f64 = 0.005;
const AUTO_WINDOW_HIGH_PERCENTILE: f64 = 0.995;

/// VOI window in modality units (Hounsfield units for CT).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub center: f64,
    pub width: f64,
}

impl Window {
    pub const CT_BRAIN: Window = Window { center: 40.0, width: 80.0 };
    pub const CT_LUNG: Window = Window { center: -600.0, width: 1500.0 };
    pub const CT_BONE: Window = Window { center: 400.0, width: 1800.0 };
    pub const CT_ABDOMEN: Window = Window { center: 40.0, width: 400.0 };
    pub const CT_SOFT_TISSUE: Window = Window { center: 50.0, width: 350.0 };

    /// Window spanning `[low, high]`. A degenerate range gets width 1.
    pub fn from_bounds(low: f64, high: f64) -> Self {
        let width = if high > low { high - low } else { 1.0 };
        Self {
            center: low + width / 2.0,
            width,
        }
    }

    pub fn bounds(&self) -> (f64, f64) {
        let half = self.width / 2.0;
        (self.center - half, self.center + half)
    }
}

/// Where the chosen window came from, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSource {
    Embedded,
    Preset,
    Auto,
}

/// Body-region preset. Only CT has a calibrated (Hounsfield) scale.
pub fn preset_for(modality: ImageModality, body_part: Option<&str>) -> Option<Window> {
    if modality != ImageModality::Ct {
        return None;
    }
    let part = body_part.unwrap_or_default().to_ascii_lowercase();
    let has = |keys: &[&str]| keys.iter().any(|k| part.contains(k));

    let window = if has(&["brain", "head"]) {
        Window::CT_BRAIN
    } else if has(&["lung", "chest", "thorax", "thoracic"]) {
        Window::CT_LUNG
    } else if has(&["bone", "spine", "skull", "pelvis", "extremit", "knee", "hip", "shoulder"]) {
        Window::CT_BONE
    } else if has(&["abdomen", "abdominal", "liver", "kidney", "renal"]) {
        Window::CT_ABDOMEN
    } else {
        Window::CT_SOFT_TISSUE
    };
    Some(window)
}

/// Choose a window: the one stored with the study, else the body-region
/// preset, else a robust percentile range of the data itself.
pub fn select_window(
    embedded: Option<Window>,
    values: &[f64],
    modality: ImageModality,
    body_part: Option<&str>,
) -> (Window, WindowSource) {
    if let Some(window) = embedded {
        return (window, WindowSource::Embedded);
    }
    if let Some(window) = preset_for(modality, body_part) {
        return (window, WindowSource::Preset);
    }
    (auto_window(values), WindowSource::Auto)
}

/// Percentile window; widens to the full range when the percentiles collapse.
pub fn auto_window(values: &[f64]) -> Window {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return Window::from_bounds(0.0, 1.0);
    }
    sorted.sort_by(f64::total_cmp);

    let at = |q: f64| sorted[((sorted.len() - 1) as f64 * q).round() as usize];
    let (low, high) = (at(AUTO_WINDOW_LOW_PERCENTILE), at(AUTO_WINDOW_HIGH_PERCENTILE));
    if high > low {
        Window::from_bounds(low, high)
    } else {
        Window::from_bounds(sorted[0], sorted[sorted.len() - 1])
    }
}

/// Clip to the window and rescale to 0–255. `invert` flips MONOCHROME1 data.
///
/// Returns `None` if any value is non-finite.
pub fn apply_window(values: &[f64], window: Window, invert: bool) -> Option<Vec<u8>> {
    let (low, high) = window.bounds();
    let span = high - low;
    values
        .iter()
        .map(|&v| {
            if !v.is_finite() {
                return None;
            }
            let scaled = ((v.clamp(low, high) - low) / span * 255.0).round() as u8;
            Some(if invert { 255 - scaled } else { scaled })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_bounds_round_trip() {
        let w = Window::CT_LUNG;
        assert_eq!(w.bounds(), (-1350.0, 150.0));
        assert_eq!(Window::from_bounds(-1350.0, 150.0), w);
    }

    #[test]
    fn ct_presets_follow_body_part() {
        assert_eq!(preset_for(ImageModality::Ct, Some("Chest")), Some(Window::CT_LUNG));
        assert_eq!(preset_for(ImageModality::Ct, Some("HEAD")), Some(Window::CT_BRAIN));
        assert_eq!(preset_for(ImageModality::Ct, Some("lumbar spine")), Some(Window::CT_BONE));
        assert_eq!(preset_for(ImageModality::Ct, Some("abdomen")), Some(Window::CT_ABDOMEN));
        assert_eq!(preset_for(ImageModality::Ct, None), Some(Window::CT_SOFT_TISSUE));
    }

    #[test]
    fn uncalibrated_modalities_have_no_preset() {
        assert_eq!(preset_for(ImageModality::XRay, Some("chest")), None);
        assert_eq!(preset_for(ImageModality::Mri, Some("brain")), None);
    }

    #[test]
    fn embedded_window_wins() {
        let embedded = Window { center: 10.0, width: 20.0 };
        let (w, source) = select_window(Some(embedded), &[0.0], ImageModality::Ct, Some("chest"));
        assert_eq!(w, embedded);
        assert_eq!(source, WindowSource::Embedded);
    }

    #[test]
    fn xray_without_embedded_uses_auto() {
        let values: Vec<f64> = (0..=1000).map(|v| v as f64).collect();
        let (w, source) = select_window(None, &values, ImageModality::XRay, None);
        assert_eq!(source, WindowSource::Auto);
        let (low, high) = w.bounds();
        assert!(low >= 0.0 && low <= 10.0, "low {low}");
        assert!(high >= 990.0 && high <= 1000.0, "high {high}");
    }

    #[test]
    fn auto_window_on_constant_data_is_valid() {
        let w = auto_window(&[7.0; 16]);
        assert!(w.width >= 1.0);
        let out = apply_window(&[7.0; 4], w, false).unwrap();
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn sub_unit_range_uses_full_gray_scale() {
        // Small RescaleSlope: the whole study spans less than one unit.
        let values: Vec<f64> = (0..100).map(|i| i as f64 / 1000.0).collect();
        let w = auto_window(&values);
        let (low, high) = w.bounds();
        assert!(low.abs() < 1e-9 && (high - 0.099).abs() < 1e-9, "{w:?}");

        let out = apply_window(&values, w, false).unwrap();
        assert_eq!(out.iter().min(), Some(&0));
        assert_eq!(out.iter().max(), Some(&255));
    }

    #[test]
    fn apply_window_clips_and_scales() {
        let w = Window::from_bounds(0.0, 100.0);
        let out = apply_window(&[-50.0, 0.0, 50.0, 100.0, 500.0], w, false).unwrap();
        assert_eq!(out, vec![0, 0, 128, 255, 255]);
    }

    #[test]
    fn apply_window_inverts_monochrome1() {
        let w = Window::from_bounds(0.0, 100.0);
        let out = apply_window(&[0.0, 100.0], w, true).unwrap();
        assert_eq!(out, vec![255, 0]);
    }

    #[test]
    fn nan_values_are_rejected() {
        let w = Window::from_bounds(0.0, 1.0);
        assert!(apply_window(&[0.5, f64::NAN], w, false).is_none());
    }
}
