//! Decision head: global average pooling over the last convolutional
//! activations followed by one linear layer.
//!
//! Because pooling and the linear layer are both linear in the activations,
//! the gradient of a class logit with respect to `A[c, i, j]` is the constant
//! `W[k, c] / (h * w)`. That is all Grad-CAM needs from the backward pass.

use ndarray::{Array1, Array2, Array3, Axis};

use super::manifest::HeadSpec;
use super::ClassifierError;
use crate::pipeline::types::PredictionLabel;

#[derive(Debug, Clone)]
pub struct LinearHead {
    /// `[classes, channels]`, classes is 1 (sigmoid) or 2 (softmax).
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl LinearHead {
    pub fn from_spec(spec: &HeadSpec) -> Result<Self, ClassifierError> {
        let classes = spec.weight.len();
        if !(1..=2).contains(&classes) {
            return Err(ClassifierError::Artifact(format!(
                "head must have 1 or 2 output rows, found {classes}"
            )));
        }
        if spec.bias.len() != classes {
            return Err(ClassifierError::Artifact(format!(
                "head bias has {} entries for {classes} rows",
                spec.bias.len()
            )));
        }
        let channels = spec.weight[0].len();
        if channels == 0 || spec.weight.iter().any(|row| row.len() != channels) {
            return Err(ClassifierError::Artifact(
                "head weight rows must be non-empty and equally sized".into(),
            ));
        }

        let flat: Vec<f32> = spec.weight.iter().flatten().copied().collect();
        if flat.iter().chain(&spec.bias).any(|v| !v.is_finite()) {
            return Err(ClassifierError::Artifact("head contains non-finite values".into()));
        }
        let weight = Array2::from_shape_vec((classes, channels), flat)
            .map_err(|e| ClassifierError::Artifact(e.to_string()))?;

        Ok(Self {
            weight,
            bias: Array1::from_vec(spec.bias.clone()),
        })
    }

    pub fn channels(&self) -> usize {
        self.weight.ncols()
    }

    fn check_channels(&self, activations: &Array3<f32>) -> Result<(), ClassifierError> {
        let (channels, h, w) = activations.dim();
        if channels != self.channels() || h == 0 || w == 0 {
            return Err(ClassifierError::Invariant(format!(
                "activation shape {:?} does not fit a head over {} channels",
                activations.dim(),
                self.channels()
            )));
        }
        Ok(())
    }

    pub fn logits(&self, activations: &Array3<f32>) -> Result<Array1<f32>, ClassifierError> {
        self.check_channels(activations)?;
        let pooled = activations
            .mean_axis(Axis(2))
            .and_then(|a| a.mean_axis(Axis(1)))
            .ok_or_else(|| ClassifierError::Invariant("empty activation map".into()))?;
        Ok(self.weight.dot(&pooled) + &self.bias)
    }

    /// Probability of the abnormal class.
    pub fn abnormal_probability(&self, logits: &Array1<f32>) -> f32 {
        if logits.len() == 1 {
            sigmoid(logits[0])
        } else {
            // Stable two-way softmax.
            sigmoid(logits[1] - logits[0])
        }
    }

    /// `d logit[target] / d A`, same shape as the activations.
    ///
    /// With a single sigmoid output the normal-class logit is `-z`.
    pub fn logit_gradient(
        &self,
        target: PredictionLabel,
        activations: &Array3<f32>,
    ) -> Result<Array3<f32>, ClassifierError> {
        self.check_channels(activations)?;
        let (channels, h, w) = activations.dim();
        let scale = 1.0 / (h * w) as f32;

        let row: Array1<f32> = match (self.weight.nrows(), target) {
            (1, PredictionLabel::Abnormal) => self.weight.row(0).to_owned(),
            (1, PredictionLabel::Normal) => -&self.weight.row(0),
            (_, PredictionLabel::Normal) => self.weight.row(0).to_owned(),
            (_, PredictionLabel::Abnormal) => self.weight.row(1).to_owned(),
        };

        Ok(Array3::from_shape_fn((channels, h, w), |(c, _, _)| row[c] * scale))
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(weight: Vec<Vec<f32>>, bias: Vec<f32>) -> LinearHead {
        LinearHead::from_spec(&HeadSpec { weight, bias }).unwrap()
    }

    #[test]
    fn sigmoid_head_probability() {
        let h = head(vec![vec![1.0, 0.0]], vec![0.0]);
        let acts = Array3::from_elem((2, 3, 3), 0.0);
        let logits = h.logits(&acts).unwrap();
        assert!((h.abnormal_probability(&logits) - 0.5).abs() < 1e-6);

        let acts = Array3::from_elem((2, 3, 3), 2.0);
        let logits = h.logits(&acts).unwrap();
        assert!((logits[0] - 2.0).abs() < 1e-6);
        assert!(h.abnormal_probability(&logits) > 0.88);
    }

    #[test]
    fn softmax_head_probability() {
        let h = head(vec![vec![0.0], vec![0.0]], vec![0.0, 2.0_f32.ln()]);
        let logits = h.logits(&Array3::zeros((1, 2, 2))).unwrap();
        // softmax([0, ln 2]) = [1/3, 2/3]
        assert!((h.abnormal_probability(&logits) - 2.0 / 3.0).abs() < 1e-5);
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let h = head(vec![vec![0.3, -0.7]], vec![0.1]);
        let acts = Array3::from_shape_fn((2, 2, 2), |(c, i, j)| (c + i * 2 + j) as f32 * 0.25);
        let grad = h.logit_gradient(PredictionLabel::Abnormal, &acts).unwrap();

        let eps = 1e-2;
        let mut bumped = acts.clone();
        bumped[[1, 0, 1]] += eps;
        let numeric = (h.logits(&bumped).unwrap()[0] - h.logits(&acts).unwrap()[0]) / eps;
        assert!((numeric - grad[[1, 0, 1]]).abs() < 1e-3);
    }

    #[test]
    fn normal_gradient_is_negated_for_sigmoid_head() {
        let h = head(vec![vec![0.4]], vec![0.0]);
        let acts = Array3::ones((1, 2, 2));
        let up = h.logit_gradient(PredictionLabel::Abnormal, &acts).unwrap();
        let down = h.logit_gradient(PredictionLabel::Normal, &acts).unwrap();
        assert_eq!(up, -down);
    }

    #[test]
    fn channel_mismatch_is_invariant_violation() {
        let h = head(vec![vec![1.0, 1.0]], vec![0.0]);
        let err = h.logits(&Array3::zeros((3, 2, 2))).unwrap_err();
        assert!(matches!(err, ClassifierError::Invariant(_)));
    }

    #[test]
    fn malformed_specs_rejected() {
        let ragged = HeadSpec {
            weight: vec![vec![1.0], vec![1.0, 2.0]],
            bias: vec![0.0, 0.0],
        };
        assert!(LinearHead::from_spec(&ragged).is_err());
        let three = HeadSpec {
            weight: vec![vec![1.0]; 3],
            bias: vec![0.0; 3],
        };
        assert!(LinearHead::from_spec(&three).is_err());
        let bias = HeadSpec {
            weight: vec![vec![1.0]],
            bias: vec![],
        };
        assert!(LinearHead::from_spec(&bias).is_err());
    }
}
