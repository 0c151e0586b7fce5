use std::path::Path;

use ndarray::{Array3, ArrayView3};
use serde::Deserialize;

use super::ClassifierError;

/// Feature extractor up to and including the last convolutional layer.
///
/// `&mut self` because inference runtimes keep per-run scratch state; the
/// owning `ClassifierModel` serializes access.
pub trait Backbone: Send {
    /// `[3, size, size]` normalized input → `[C, h, w]` activations.
    fn forward(&mut self, input: ArrayView3<f32>) -> Result<Array3<f32>, ClassifierError>;

    fn name(&self) -> &str;
}

// ═══════════════════════════════════════════════════════════
// Native convolution stack
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
struct ConvLayerSpec {
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    #[serde(default = "default_stride")]
    stride: usize,
    #[serde(default)]
    padding: usize,
    /// Row-major `[out, in, k, k]`.
    weight: Vec<f32>,
    bias: Vec<f32>,
    #[serde(default = "default_relu")]
    relu: bool,
}

fn default_stride() -> usize {
    1
}

fn default_relu() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct NativeWeights {
    layers: Vec<ConvLayerSpec>,
}

/// Small convolution stack evaluated directly on the CPU.
///
/// Weights file format (`backbone.json`):
/// ```json
/// { "layers": [ { "in_channels": 3, "out_channels": 8, "kernel": 3,
///                 "stride": 2, "padding": 1, "weight": [...], "bias": [...] } ] }
/// ```
#[derive(Debug, Clone)]
pub struct NativeConvBackbone {
    layers: Vec<ConvLayerSpec>,
}

impl NativeConvBackbone {
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        if !path.exists() {
            return Err(ClassifierError::WeightsNotFound(path.to_path_buf()));
        }
        let bytes = std::fs::read(path)?;
        Self::from_json(&bytes)
            .map_err(|e| ClassifierError::Artifact(format!("{}: {e}", path.display())))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ClassifierError> {
        let weights: NativeWeights = serde_json::from_slice(bytes)
            .map_err(|e| ClassifierError::Artifact(e.to_string()))?;
        Self::from_layers(weights.layers)
    }

    fn from_layers(layers: Vec<ConvLayerSpec>) -> Result<Self, ClassifierError> {
        if layers.is_empty() {
            return Err(ClassifierError::Artifact("backbone has no layers".into()));
        }
        let mut channels = 3;
        for (i, layer) in layers.iter().enumerate() {
            if layer.in_channels != channels {
                return Err(ClassifierError::Artifact(format!(
                    "layer {i} expects {} input channels, previous layer yields {channels}",
                    layer.in_channels
                )));
            }
            if layer.kernel == 0 || layer.stride == 0 || layer.out_channels == 0 {
                return Err(ClassifierError::Artifact(format!(
                    "layer {i} has a zero kernel, stride or width"
                )));
            }
            let expected = layer.out_channels * layer.in_channels * layer.kernel * layer.kernel;
            if layer.weight.len() != expected || layer.bias.len() != layer.out_channels {
                return Err(ClassifierError::Artifact(format!(
                    "layer {i} weight/bias sizes do not match its shape"
                )));
            }
            channels = layer.out_channels;
        }
        Ok(Self { layers })
    }

    pub fn output_channels(&self) -> usize {
        self.layers.last().map_or(0, |l| l.out_channels)
    }
}

impl Backbone for NativeConvBackbone {
    fn forward(&mut self, input: ArrayView3<f32>) -> Result<Array3<f32>, ClassifierError> {
        let mut x = input.to_owned();
        for (i, layer) in self.layers.iter().enumerate() {
            x = conv2d(&x, layer).ok_or_else(|| {
                ClassifierError::Inference(format!(
                    "layer {i}: input {:?} too small for kernel {}",
                    x.dim(),
                    layer.kernel
                ))
            })?;
        }
        Ok(x)
    }

    fn name(&self) -> &str {
        "native-conv"
    }
}

/// Direct convolution with zero padding. `None` if the output is empty.
fn conv2d(input: &Array3<f32>, layer: &ConvLayerSpec) -> Option<Array3<f32>> {
    let (in_c, h, w) = input.dim();
    let k = layer.kernel;
    let (ph, pw) = (h + 2 * layer.padding, w + 2 * layer.padding);
    if ph < k || pw < k || in_c != layer.in_channels {
        return None;
    }
    let out_h = (ph - k) / layer.stride + 1;
    let out_w = (pw - k) / layer.stride + 1;

    let pad = layer.padding as isize;
    let mut out = Array3::<f32>::zeros((layer.out_channels, out_h, out_w));
    for ((o, y, x), value) in out.indexed_iter_mut() {
        let mut acc = layer.bias[o];
        for c in 0..in_c {
            let base = (o * in_c + c) * k * k;
            for ky in 0..k {
                let iy = (y * layer.stride + ky) as isize - pad;
                if iy < 0 || iy >= h as isize {
                    continue;
                }
                for kx in 0..k {
                    let ix = (x * layer.stride + kx) as isize - pad;
                    if ix < 0 || ix >= w as isize {
                        continue;
                    }
                    acc += layer.weight[base + ky * k + kx] * input[[c, iy as usize, ix as usize]];
                }
            }
        }
        *value = if layer.relu { acc.max(0.0) } else { acc };
    }
    Some(out)
}

// ═══════════════════════════════════════════════════════════
// Mock
// ═══════════════════════════════════════════════════════════

/// Returns a fixed activation tensor regardless of input, for tests.
pub struct MockBackbone {
    activations: Array3<f32>,
}

impl MockBackbone {
    pub fn new(activations: Array3<f32>) -> Self {
        Self { activations }
    }
}

impl Backbone for MockBackbone {
    fn forward(&mut self, _input: ArrayView3<f32>) -> Result<Array3<f32>, ClassifierError> {
        Ok(self.activations.clone())
    }

    fn name(&self) -> &str {
        "mock"
    }
}
