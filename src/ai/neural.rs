//! Small fully-connected feed-forward network
//!
//! Layers are dense with an activation each, optional per-layer batch
//! normalization and dropout. Training is manual backprop with gradient
//! accumulation, L2 decay, global norm clipping and momentum SGD.
//!
//! Checkpoint layout (little endian):
//! `[magic "BNN1"][u32 layers]` then per layer
//! `[u32 in][u32 out][u8 activation][u8 flags][f32 dropout]`
//! `[f32 weights; in*out][f32 biases; out]` and, when the batch-norm flag
//! is set, `[f32 gamma; out][f32 beta; out][f32 running mean][f32 running var]`.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ai::constants::neural::{
    BATCH_NORM_EPSILON, BATCH_NORM_MOMENTUM, CHECKPOINT_MAGIC, DEFAULT_LEARNING_RATE,
    DEFAULT_MOMENTUM, GRADIENT_CLIP, LEAKY_SLOPE, WEIGHT_DECAY,
};
use crate::util::gaussian;

const FLAG_BATCH_NORM: u8 = 1;
const FLAG_DROPOUT: u8 = 1 << 1;

/// Largest layer accepted from a checkpoint
const MAX_LAYER_UNITS: u32 = 1 << 16;
const MAX_LAYER_WEIGHTS: usize = 1 << 22;

/// Errors from network construction, training and checkpoint IO
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Network needs at least one layer")]
    NoLayers,
    #[error("Layer size must be non-zero")]
    ZeroSizedLayer,
    #[error("Input size mismatch: expected {expected}, got {actual}")]
    InputSize { expected: usize, actual: usize },
    #[error("Output size mismatch: expected {expected}, got {actual}")]
    OutputSize { expected: usize, actual: usize },
    #[error("Backward called without a cached forward pass")]
    NoForwardPass,
    #[error("Network shapes differ")]
    ShapeMismatch,
    #[error("Bad checkpoint magic")]
    BadMagic,
    #[error("Unknown activation tag {0}")]
    UnknownActivation(u8),
    #[error("Malformed checkpoint: {0}")]
    Malformed(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Per-layer activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Activation {
    Linear = 0,
    ReLU = 1,
    LeakyReLU = 2,
    Tanh = 3,
    Sigmoid = 4,
    Softmax = 5,
}

impl Activation {
    pub fn from_tag(tag: u8) -> Result<Self, NetworkError> {
        Ok(match tag {
            0 => Activation::Linear,
            1 => Activation::ReLU,
            2 => Activation::LeakyReLU,
            3 => Activation::Tanh,
            4 => Activation::Sigmoid,
            5 => Activation::Softmax,
            other => return Err(NetworkError::UnknownActivation(other)),
        })
    }

    /// Element-wise activation. Softmax is handled per layer.
    #[inline]
    fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Linear | Activation::Softmax => x,
            Activation::ReLU => x.max(0.0),
            Activation::LeakyReLU => {
                if x > 0.0 {
                    x
                } else {
                    x * LEAKY_SLOPE
                }
            }
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => sigmoid(x),
        }
    }

    /// Derivative given the pre-activation and the activated value
    #[inline]
    fn derivative(self, pre: f32, out: f32) -> f32 {
        match self {
            Activation::Linear | Activation::Softmax => 1.0,
            Activation::ReLU => {
                if pre > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyReLU => {
                if pre > 0.0 {
                    1.0
                } else {
                    LEAKY_SLOPE
                }
            }
            Activation::Tanh => 1.0 - out * out,
            Activation::Sigmoid => out * (1.0 - out),
        }
    }
}

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Numerically stable softmax in place
pub fn softmax_in_place(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}

/// Shape of one layer when building a network
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerSpec {
    pub size: usize,
    pub activation: Activation,
    pub batch_norm: bool,
    pub dropout: f32,
}

impl LayerSpec {
    pub fn new(size: usize, activation: Activation) -> Self {
        Self {
            size,
            activation,
            batch_norm: false,
            dropout: 0.0,
        }
    }

    pub fn with_batch_norm(mut self) -> Self {
        self.batch_norm = true;
        self
    }

    pub fn with_dropout(mut self, rate: f32) -> Self {
        self.dropout = rate.clamp(0.0, 0.95);
        self
    }
}

#[derive(Debug, Clone)]
struct BatchNorm {
    gamma: Vec<f32>,
    beta: Vec<f32>,
    running_mean: f32,
    running_var: f32,
    grad_gamma: Vec<f32>,
    grad_beta: Vec<f32>,
    /// Normalized values and inverse std from the last forward pass
    cache_norm: Vec<f32>,
    cache_inv_std: f32,
}

impl BatchNorm {
    fn new(size: usize) -> Self {
        Self {
            gamma: vec![1.0; size],
            beta: vec![0.0; size],
            running_mean: 0.0,
            running_var: 1.0,
            grad_gamma: vec![0.0; size],
            grad_beta: vec![0.0; size],
            cache_norm: vec![0.0; size],
            cache_inv_std: 1.0,
        }
    }

    /// Normalize across the layer's units
    fn normalize(&self, values: &mut [f32], mean: f32, var: f32) -> f32 {
        let inv_std = 1.0 / (var + BATCH_NORM_EPSILON).sqrt();
        for (i, v) in values.iter_mut().enumerate() {
            *v = self.gamma[i] * ((*v - mean) * inv_std) + self.beta[i];
        }
        inv_std
    }
}

fn mean_var(values: &[f32]) -> (f32, f32) {
    let n = values.len().max(1) as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    (mean, var)
}

/// Dense layer with optimizer state and training caches
#[derive(Debug, Clone)]
pub struct Layer {
    input_size: usize,
    output_size: usize,
    activation: Activation,
    /// Row-major, one row of `input_size` weights per output unit
    weights: Vec<f32>,
    biases: Vec<f32>,
    weight_momentum: Vec<f32>,
    bias_momentum: Vec<f32>,
    weight_grad: Vec<f32>,
    bias_grad: Vec<f32>,
    batch_norm: Option<BatchNorm>,
    dropout: f32,

    cache_input: Vec<f32>,
    cache_pre: Vec<f32>,
    cache_output: Vec<f32>,
    cache_mask: Vec<f32>,
}

impl Layer {
    fn new<R: Rng + ?Sized>(input_size: usize, spec: &LayerSpec, rng: &mut R) -> Self {
        // He init for rectifiers, Xavier for the rest
        let std_dev = match spec.activation {
            Activation::ReLU | Activation::LeakyReLU => (2.0 / input_size as f32).sqrt(),
            _ => (1.0 / input_size as f32).sqrt(),
        };
        let weights = (0..input_size * spec.size).map(|_| gaussian(rng, std_dev)).collect();
        Self::from_parts(
            input_size,
            spec.size,
            spec.activation,
            weights,
            vec![0.0; spec.size],
            spec.batch_norm.then(|| BatchNorm::new(spec.size)),
            spec.dropout,
        )
    }

    fn from_parts(
        input_size: usize,
        output_size: usize,
        activation: Activation,
        weights: Vec<f32>,
        biases: Vec<f32>,
        batch_norm: Option<BatchNorm>,
        dropout: f32,
    ) -> Self {
        Self {
            input_size,
            output_size,
            activation,
            weight_momentum: vec![0.0; weights.len()],
            bias_momentum: vec![0.0; output_size],
            weight_grad: vec![0.0; weights.len()],
            bias_grad: vec![0.0; output_size],
            weights,
            biases,
            batch_norm,
            dropout,
            cache_input: Vec::new(),
            cache_pre: Vec::new(),
            cache_output: Vec::new(),
            cache_mask: Vec::new(),
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    fn weighted_sum(&self, input: &[f32]) -> Vec<f32> {
        let mut out = self.biases.clone();
        for (o, sum) in out.iter_mut().enumerate() {
            let row = &self.weights[o * self.input_size..(o + 1) * self.input_size];
            *sum += row.iter().zip(input).map(|(w, x)| w * x).sum::<f32>();
        }
        out
    }

    fn activate(&self, pre: &[f32]) -> Vec<f32> {
        let mut out: Vec<f32> = pre.iter().map(|&x| self.activation.apply(x)).collect();
        if self.activation == Activation::Softmax {
            softmax_in_place(&mut out);
        }
        out
    }

    /// Inference pass using running batch-norm statistics and no dropout
    fn infer(&self, input: &[f32]) -> Vec<f32> {
        let mut pre = self.weighted_sum(input);
        if let Some(bn) = &self.batch_norm {
            bn.normalize(&mut pre, bn.running_mean, bn.running_var);
        }
        self.activate(&pre)
    }

    fn forward_train<R: Rng + ?Sized>(&mut self, input: &[f32], training: bool, rng: &mut R) -> Vec<f32> {
        let mut pre = self.weighted_sum(input);
        if let Some(bn) = self.batch_norm.as_mut() {
            let (mean, var) = if training {
                let (mean, var) = mean_var(&pre);
                bn.running_mean = BATCH_NORM_MOMENTUM * bn.running_mean + (1.0 - BATCH_NORM_MOMENTUM) * mean;
                bn.running_var = BATCH_NORM_MOMENTUM * bn.running_var + (1.0 - BATCH_NORM_MOMENTUM) * var;
                (mean, var)
            } else {
                (bn.running_mean, bn.running_var)
            };
            let inv_std = 1.0 / (var + BATCH_NORM_EPSILON).sqrt();
            for (i, v) in pre.iter_mut().enumerate() {
                let norm = (*v - mean) * inv_std;
                bn.cache_norm[i] = norm;
                *v = bn.gamma[i] * norm + bn.beta[i];
            }
            bn.cache_inv_std = inv_std;
        }

        let mut output = self.activate(&pre);

        self.cache_mask.clear();
        if training && self.dropout > 0.0 {
            let keep = 1.0 - self.dropout;
            for v in output.iter_mut() {
                let m = if rng.gen::<f32>() < self.dropout { 0.0 } else { 1.0 / keep };
                *v *= m;
                self.cache_mask.push(m);
            }
        }

        self.cache_input.clear();
        self.cache_input.extend_from_slice(input);
        self.cache_pre = pre;
        self.cache_output = output.clone();
        output
    }

    /// Convert a gradient w.r.t. this layer's output into one w.r.t. its weighted sum
    fn output_grad_to_delta(&mut self, grad_output: &[f32]) -> Vec<f32> {
        let mut grad: Vec<f32> = grad_output.to_vec();
        if !self.cache_mask.is_empty() {
            for (g, m) in grad.iter_mut().zip(&self.cache_mask) {
                *g *= m;
            }
        }

        // Activated values before dropout
        let activated: Vec<f32> = if self.cache_mask.is_empty() {
            self.cache_output.clone()
        } else {
            self.cache_pre.iter().map(|&x| self.activation.apply(x)).collect()
        };

        let mut delta = if self.activation == Activation::Softmax {
            let dot: f32 = grad.iter().zip(&activated).map(|(g, y)| g * y).sum();
            activated.iter().zip(&grad).map(|(y, g)| y * (g - dot)).collect::<Vec<f32>>()
        } else {
            grad.iter()
                .zip(self.cache_pre.iter().zip(&activated))
                .map(|(g, (&pre, &out))| g * self.activation.derivative(pre, out))
                .collect()
        };

        self.batch_norm_backward(&mut delta);
        delta
    }

    fn batch_norm_backward(&mut self, delta: &mut [f32]) {
        // Statistics are treated as constants
        if let Some(bn) = self.batch_norm.as_mut() {
            for (i, d) in delta.iter_mut().enumerate() {
                bn.grad_gamma[i] += *d * bn.cache_norm[i];
                bn.grad_beta[i] += *d;
                *d *= bn.gamma[i] * bn.cache_inv_std;
            }
        }
    }

    /// Accumulate parameter gradients and return the gradient w.r.t. the input
    fn accumulate(&mut self, delta: &[f32]) -> Vec<f32> {
        let mut grad_input = vec![0.0; self.input_size];
        for (o, &d) in delta.iter().enumerate() {
            let row = o * self.input_size;
            for i in 0..self.input_size {
                self.weight_grad[row + i] += d * self.cache_input[i];
                grad_input[i] += self.weights[row + i] * d;
            }
            self.bias_grad[o] += d;
        }
        grad_input
    }

    fn grad_norm_sq(&self, scale: f32, decay: f32) -> f32 {
        let mut sum = 0.0;
        for (g, w) in self.weight_grad.iter().zip(&self.weights) {
            let v = g * scale + decay * w;
            sum += v * v;
        }
        sum += self.bias_grad.iter().map(|g| (g * scale).powi(2)).sum::<f32>();
        if let Some(bn) = &self.batch_norm {
            sum += bn.grad_gamma.iter().chain(&bn.grad_beta).map(|g| (g * scale).powi(2)).sum::<f32>();
        }
        sum
    }

    fn apply_update(&mut self, scale: f32, decay: f32, clip: f32, lr: f32, momentum: f32) {
        for i in 0..self.weights.len() {
            let g = (self.weight_grad[i] * scale + decay * self.weights[i]) * clip;
            self.weight_momentum[i] = momentum * self.weight_momentum[i] + g;
            self.weights[i] -= lr * self.weight_momentum[i];
            self.weight_grad[i] = 0.0;
        }
        for i in 0..self.biases.len() {
            let g = self.bias_grad[i] * scale * clip;
            self.bias_momentum[i] = momentum * self.bias_momentum[i] + g;
            self.biases[i] -= lr * self.bias_momentum[i];
            self.bias_grad[i] = 0.0;
        }
        if let Some(bn) = self.batch_norm.as_mut() {
            for i in 0..bn.gamma.len() {
                bn.gamma[i] -= lr * bn.grad_gamma[i] * scale * clip;
                bn.beta[i] -= lr * bn.grad_beta[i] * scale * clip;
                bn.grad_gamma[i] = 0.0;
                bn.grad_beta[i] = 0.0;
            }
        }
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<(), NetworkError> {
        w.write_u32::<LittleEndian>(self.input_size as u32)?;
        w.write_u32::<LittleEndian>(self.output_size as u32)?;
        w.write_u8(self.activation as u8)?;
        let mut flags = 0;
        if self.batch_norm.is_some() {
            flags |= FLAG_BATCH_NORM;
        }
        if self.dropout > 0.0 {
            flags |= FLAG_DROPOUT;
        }
        w.write_u8(flags)?;
        w.write_f32::<LittleEndian>(self.dropout)?;
        for v in self.weights.iter().chain(&self.biases) {
            w.write_f32::<LittleEndian>(*v)?;
        }
        if let Some(bn) = &self.batch_norm {
            for v in bn.gamma.iter().chain(&bn.beta) {
                w.write_f32::<LittleEndian>(*v)?;
            }
            w.write_f32::<LittleEndian>(bn.running_mean)?;
            w.write_f32::<LittleEndian>(bn.running_var)?;
        }
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self, NetworkError> {
        let input_size = r.read_u32::<LittleEndian>()?;
        let output_size = r.read_u32::<LittleEndian>()?;
        if input_size == 0 || output_size == 0 || input_size > MAX_LAYER_UNITS || output_size > MAX_LAYER_UNITS {
            return Err(NetworkError::Malformed("layer size out of range"));
        }
        let (input_size, output_size) = (input_size as usize, output_size as usize);
        if input_size * output_size > MAX_LAYER_WEIGHTS {
            return Err(NetworkError::Malformed("layer too large"));
        }
        let activation = Activation::from_tag(r.read_u8()?)?;
        let flags = r.read_u8()?;
        let dropout = r.read_f32::<LittleEndian>()?;
        if !(0.0..1.0).contains(&dropout) {
            return Err(NetworkError::Malformed("dropout rate out of range"));
        }

        let weights = read_f32s(r, input_size * output_size)?;
        let biases = read_f32s(r, output_size)?;
        let batch_norm = if flags & FLAG_BATCH_NORM != 0 {
            let mut bn = BatchNorm::new(output_size);
            bn.gamma = read_f32s(r, output_size)?;
            bn.beta = read_f32s(r, output_size)?;
            bn.running_mean = r.read_f32::<LittleEndian>()?;
            bn.running_var = r.read_f32::<LittleEndian>()?;
            Some(bn)
        } else {
            None
        };
        let dropout = if flags & FLAG_DROPOUT != 0 { dropout } else { 0.0 };

        Ok(Self::from_parts(input_size, output_size, activation, weights, biases, batch_norm, dropout))
    }
}

fn read_f32s<R: Read>(r: &mut R, count: usize) -> Result<Vec<f32>, NetworkError> {
    let mut values = vec![0.0; count];
    r.read_f32_into::<LittleEndian>(&mut values)?;
    if values.iter().any(|v| !v.is_finite()) {
        return Err(NetworkError::Malformed("non-finite parameter"));
    }
    Ok(values)
}

/// Feed-forward network
#[derive(Debug, Clone)]
pub struct NeuralNetwork {
    layers: Vec<Layer>,
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,
    gradient_clip: f32,
    training: bool,
    /// Backward passes accumulated since the last update
    pending: usize,
    has_forward: bool,
}

impl NeuralNetwork {
    /// Build a network with `input_size` inputs and one layer per spec
    pub fn new<R: Rng + ?Sized>(input_size: usize, specs: &[LayerSpec], rng: &mut R) -> Result<Self, NetworkError> {
        if specs.is_empty() {
            return Err(NetworkError::NoLayers);
        }
        if input_size == 0 || specs.iter().any(|s| s.size == 0) {
            return Err(NetworkError::ZeroSizedLayer);
        }
        let mut layers = Vec::with_capacity(specs.len());
        let mut fan_in = input_size;
        for spec in specs {
            layers.push(Layer::new(fan_in, spec, rng));
            fan_in = spec.size;
        }
        Ok(Self::from_layers(layers))
    }

    fn from_layers(layers: Vec<Layer>) -> Self {
        Self {
            layers,
            learning_rate: DEFAULT_LEARNING_RATE,
            momentum: DEFAULT_MOMENTUM,
            weight_decay: WEIGHT_DECAY,
            gradient_clip: GRADIENT_CLIP,
            training: false,
            pending: 0,
            has_forward: false,
        }
    }

    pub fn input_size(&self) -> usize {
        self.layers.first().map_or(0, Layer::input_size)
    }

    pub fn output_size(&self) -> usize {
        self.layers.last().map_or(0, Layer::output_size)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Layer sizes from input to output
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = vec![self.input_size()];
        shape.extend(self.layers.iter().map(Layer::output_size));
        shape
    }

    pub fn same_shape(&self, other: &NeuralNetwork) -> bool {
        self.layers.len() == other.layers.len()
            && self.layers.iter().zip(&other.layers).all(|(a, b)| {
                a.input_size == b.input_size && a.output_size == b.output_size && a.activation == b.activation
            })
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Overwrite the output layer biases
    pub fn set_output_bias(&mut self, biases: &[f32]) -> Result<(), NetworkError> {
        let last = self.layers.last_mut().ok_or(NetworkError::NoLayers)?;
        if biases.len() != last.output_size {
            return Err(NetworkError::OutputSize { expected: last.output_size, actual: biases.len() });
        }
        last.biases.copy_from_slice(biases);
        Ok(())
    }

    fn check_input(&self, input: &[f32]) -> Result<(), NetworkError> {
        if input.len() != self.input_size() {
            return Err(NetworkError::InputSize { expected: self.input_size(), actual: input.len() });
        }
        Ok(())
    }

    /// Pure inference: running batch-norm statistics, no dropout, no caches
    pub fn predict(&self, input: &[f32]) -> Result<Vec<f32>, NetworkError> {
        self.check_input(input)?;
        let mut activations = input.to_vec();
        for layer in &self.layers {
            activations = layer.infer(&activations);
        }
        Ok(activations)
    }

    /// Forward pass that caches activations for a following backward pass.
    /// In training mode batch-norm uses per-call statistics and dropout is active.
    pub fn forward<R: Rng + ?Sized>(&mut self, input: &[f32], rng: &mut R) -> Result<Vec<f32>, NetworkError> {
        self.check_input(input)?;
        let training = self.training;
        let mut activations = input.to_vec();
        for layer in &mut self.layers {
            activations = layer.forward_train(&activations, training, rng);
        }
        self.has_forward = true;
        Ok(activations)
    }

    /// Backpropagate against a target and accumulate gradients.
    ///
    /// Softmax outputs use cross-entropy (error = output - target), everything
    /// else uses squared error. Returns the loss of the cached forward pass.
    pub fn backward(&mut self, target: &[f32]) -> Result<f32, NetworkError> {
        if !self.has_forward {
            return Err(NetworkError::NoForwardPass);
        }
        let last = self.layers.last_mut().ok_or(NetworkError::NoLayers)?;
        if target.len() != last.output_size {
            return Err(NetworkError::OutputSize { expected: last.output_size, actual: target.len() });
        }

        let (delta, loss) = if last.activation == Activation::Softmax && last.cache_mask.is_empty() {
            let loss = -target
                .iter()
                .zip(&last.cache_output)
                .map(|(t, y)| t * y.max(1e-7).ln())
                .sum::<f32>();
            let mut delta: Vec<f32> = last.cache_output.iter().zip(target).map(|(y, t)| y - t).collect();
            last.batch_norm_backward(&mut delta);
            (delta, loss)
        } else {
            let grad: Vec<f32> = last.cache_output.iter().zip(target).map(|(y, t)| y - t).collect();
            let loss = 0.5 * grad.iter().map(|g| g * g).sum::<f32>();
            (last.output_grad_to_delta(&grad), loss)
        };

        self.propagate(delta);
        Ok(loss)
    }

    /// Backpropagate an externally computed gradient of the loss w.r.t. the outputs
    pub fn backward_from_output_grad(&mut self, grad_output: &[f32]) -> Result<(), NetworkError> {
        if !self.has_forward {
            return Err(NetworkError::NoForwardPass);
        }
        let last = self.layers.last_mut().ok_or(NetworkError::NoLayers)?;
        if grad_output.len() != last.output_size {
            return Err(NetworkError::OutputSize { expected: last.output_size, actual: grad_output.len() });
        }
        let delta = last.output_grad_to_delta(grad_output);
        self.propagate(delta);
        Ok(())
    }

    fn propagate(&mut self, mut delta: Vec<f32>) {
        for i in (0..self.layers.len()).rev() {
            let grad_input = self.layers[i].accumulate(&delta);
            if i > 0 {
                delta = self.layers[i - 1].output_grad_to_delta(&grad_input);
            }
        }
        self.pending += 1;
    }

    /// Apply accumulated gradients: average, L2 decay, global norm clip,
    /// then `momentum = m * momentum + grad; weight -= lr * momentum`.
    /// Returns the pre-clip gradient norm, or `None` when nothing was accumulated.
    pub fn update_weights(&mut self) -> Option<f32> {
        if self.pending == 0 {
            return None;
        }
        let scale = 1.0 / self.pending as f32;
        let norm = self
            .layers
            .iter()
            .map(|l| l.grad_norm_sq(scale, self.weight_decay))
            .sum::<f32>()
            .sqrt();
        let clip = if norm > self.gradient_clip && norm > 0.0 {
            self.gradient_clip / norm
        } else {
            1.0
        };
        for layer in &mut self.layers {
            layer.apply_update(scale, self.weight_decay, clip, self.learning_rate, self.momentum);
        }
        self.pending = 0;
        Some(norm)
    }

    /// Move parameters toward `source` by `tau` (1.0 copies)
    pub fn soft_update_from(&mut self, source: &NeuralNetwork, tau: f32) -> Result<(), NetworkError> {
        if !self.same_shape(source) {
            return Err(NetworkError::ShapeMismatch);
        }
        let blend = |dst: &mut [f32], src: &[f32]| {
            for (d, s) in dst.iter_mut().zip(src) {
                *d = tau * s + (1.0 - tau) * *d;
            }
        };
        for (dst, src) in self.layers.iter_mut().zip(&source.layers) {
            blend(&mut dst.weights, &src.weights);
            blend(&mut dst.biases, &src.biases);
            if let (Some(d), Some(s)) = (dst.batch_norm.as_mut(), src.batch_norm.as_ref()) {
                blend(&mut d.gamma, &s.gamma);
                blend(&mut d.beta, &s.beta);
                d.running_mean = tau * s.running_mean + (1.0 - tau) * d.running_mean;
                d.running_var = tau * s.running_var + (1.0 - tau) * d.running_var;
            }
        }
        Ok(())
    }

    /// Total number of trainable parameters
    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.weights.len() + l.biases.len() + l.batch_norm.as_ref().map_or(0, |b| b.gamma.len() * 2))
            .sum()
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), NetworkError> {
        w.write_all(&CHECKPOINT_MAGIC)?;
        w.write_u32::<LittleEndian>(self.layers.len() as u32)?;
        for layer in &self.layers {
            layer.write_to(w)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, NetworkError> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != CHECKPOINT_MAGIC {
            return Err(NetworkError::BadMagic);
        }
        let count = r.read_u32::<LittleEndian>()?;
        if count == 0 || count > 64 {
            return Err(NetworkError::Malformed("layer count out of range"));
        }
        let mut layers: Vec<Layer> = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let layer = Layer::read_from(r)?;
            if let Some(prev) = layers.last() {
                if prev.output_size != layer.input_size {
                    return Err(NetworkError::Malformed("layer sizes do not chain"));
                }
            }
            layers.push(layer);
        }
        Ok(Self::from_layers(layers))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.parameter_count() * 4);
        // Writing into a Vec cannot fail
        let _ = self.write_to(&mut buf);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetworkError> {
        let mut cursor = io::Cursor::new(bytes);
        Self::read_from(&mut cursor)
    }

    pub fn save(&self, path: &Path) -> Result<(), NetworkError> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write_to(&mut w)?;
        w.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, NetworkError> {
        let mut r = BufReader::new(File::open(path)?);
        Self::read_from(&mut r)
    }

    /// Load a checkpoint with the same shape as `fallback`, keeping the
    /// fallback's optimizer settings. Any failure returns `fallback`.
    pub fn load_or(path: &Path, fallback: NeuralNetwork) -> NeuralNetwork {
        match Self::load(path) {
            Ok(mut loaded) if loaded.same_shape(&fallback) => {
                loaded.learning_rate = fallback.learning_rate;
                loaded.momentum = fallback.momentum;
                loaded.training = fallback.training;
                loaded
            }
            Ok(_) => {
                warn!(path = %path.display(), "Checkpoint shape mismatch, using fresh weights");
                fallback
            }
            Err(NetworkError::Io(e)) if e.kind() == io::ErrorKind::NotFound => fallback,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load checkpoint, using fresh weights");
                fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn small_net(rng: &mut StdRng) -> NeuralNetwork {
        NeuralNetwork::new(
            3,
            &[LayerSpec::new(8, Activation::ReLU), LayerSpec::new(2, Activation::Linear)],
            rng,
        )
        .unwrap()
    }

    // ========================================================================
    // Shape and inference
    // ========================================================================

    #[test]
    fn test_output_shape() {
        let mut r = rng();
        let net = small_net(&mut r);
        assert_eq!(net.shape(), vec![3, 8, 2]);
        assert_eq!(net.predict(&[0.1, 0.2, 0.3]).unwrap().len(), 2);
    }

    #[test]
    fn test_input_size_checked() {
        let mut r = rng();
        let net = small_net(&mut r);
        assert!(matches!(
            net.predict(&[1.0]),
            Err(NetworkError::InputSize { expected: 3, actual: 1 })
        ));
    }

    #[test]
    fn test_empty_network_rejected() {
        let mut r = rng();
        assert!(matches!(NeuralNetwork::new(3, &[], &mut r), Err(NetworkError::NoLayers)));
        assert!(matches!(
            NeuralNetwork::new(3, &[LayerSpec::new(0, Activation::ReLU)], &mut r),
            Err(NetworkError::ZeroSizedLayer)
        ));
    }

    #[test]
    fn test_predict_is_reproducible() {
        let mut r = rng();
        let net = NeuralNetwork::new(
            4,
            &[
                LayerSpec::new(6, Activation::Tanh).with_batch_norm().with_dropout(0.3),
                LayerSpec::new(3, Activation::Softmax),
            ],
            &mut r,
        )
        .unwrap();
        let input = [0.5, -0.2, 0.9, 0.0];
        assert_eq!(net.predict(&input).unwrap(), net.predict(&input).unwrap());
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let mut r = rng();
        let net = NeuralNetwork::new(2, &[LayerSpec::new(5, Activation::Softmax)], &mut r).unwrap();
        let out = net.predict(&[100.0, -50.0]).unwrap();
        let sum: f32 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(out.iter().all(|p| p.is_finite() && *p >= 0.0));
    }

    #[test]
    fn test_dropout_only_in_training() {
        let mut r = rng();
        let mut net = NeuralNetwork::new(
            4,
            &[LayerSpec::new(32, Activation::ReLU).with_dropout(0.5), LayerSpec::new(1, Activation::Linear)],
            &mut r,
        )
        .unwrap();
        let input = [1.0, 1.0, 1.0, 1.0];
        let a = net.forward(&input, &mut r).unwrap();
        let b = net.forward(&input, &mut r).unwrap();
        assert_eq!(a, b);

        assert!(!net.is_training());
        net.set_training(true);
        assert!(net.is_training());
        net.forward(&input, &mut r).unwrap();
        let zeros = net.layers[0].cache_mask.iter().filter(|m| **m == 0.0).count();
        assert!(zeros > 0);
    }

    // ========================================================================
    // Training
    // ========================================================================

    #[test]
    fn test_backward_without_forward() {
        let mut r = rng();
        let mut net = small_net(&mut r);
        assert!(matches!(net.backward(&[0.0, 0.0]), Err(NetworkError::NoForwardPass)));
        assert!(net.update_weights().is_none());
    }

    #[test]
    fn test_regression_loss_decreases() {
        let mut r = rng();
        let mut net = small_net(&mut r);
        net.set_learning_rate(0.01);
        let samples = [([0.0, 0.0, 1.0], [1.0, -1.0]), ([1.0, 0.0, 0.0], [-1.0, 1.0])];

        let loss_of = |net: &NeuralNetwork| -> f32 {
            samples
                .iter()
                .map(|(x, t)| {
                    let y = net.predict(x).unwrap();
                    y.iter().zip(t).map(|(a, b)| (a - b) * (a - b)).sum::<f32>()
                })
                .sum()
        };

        let before = loss_of(&net);
        for _ in 0..300 {
            for (x, t) in &samples {
                net.forward(x, &mut r).unwrap();
                net.backward(t).unwrap();
            }
            net.update_weights();
        }
        assert!(loss_of(&net) < before * 0.25);
    }

    #[test]
    fn test_softmax_classification_learns() {
        let mut r = rng();
        let mut net = NeuralNetwork::new(
            2,
            &[LayerSpec::new(8, Activation::LeakyReLU), LayerSpec::new(2, Activation::Softmax)],
            &mut r,
        )
        .unwrap();
        net.set_learning_rate(0.05);
        for _ in 0..300 {
            net.forward(&[1.0, 0.0], &mut r).unwrap();
            net.backward(&[1.0, 0.0]).unwrap();
            net.forward(&[0.0, 1.0], &mut r).unwrap();
            net.backward(&[0.0, 1.0]).unwrap();
            net.update_weights();
        }
        assert!(net.predict(&[1.0, 0.0]).unwrap()[0] > 0.8);
        assert!(net.predict(&[0.0, 1.0]).unwrap()[1] > 0.8);
    }

    #[test]
    fn test_gradient_norm_clipped() {
        let mut r = rng();
        let mut net = small_net(&mut r);
        net.set_learning_rate(0.0);
        net.forward(&[100.0, 100.0, 100.0], &mut r).unwrap();
        net.backward(&[-1000.0, 1000.0]).unwrap();
        let norm = net.update_weights().unwrap();
        assert!(norm > GRADIENT_CLIP);
        let momentum_norm: f32 = net
            .layers
            .iter()
            .flat_map(|l| l.weight_momentum.iter().chain(&l.bias_momentum))
            .map(|m| m * m)
            .sum::<f32>()
            .sqrt();
        assert!(momentum_norm <= GRADIENT_CLIP + 1e-3);
    }

    #[test]
    fn test_output_grad_matches_backward_for_linear() {
        let mut r = rng();
        let mut a = small_net(&mut r);
        let mut b = a.clone();
        let x = [0.3, -0.7, 0.2];
        let t = [0.5, 0.1];

        let y = a.forward(&x, &mut r).unwrap();
        a.backward(&t).unwrap();
        b.forward(&x, &mut r).unwrap();
        let grad: Vec<f32> = y.iter().zip(&t).map(|(y, t)| y - t).collect();
        b.backward_from_output_grad(&grad).unwrap();

        for (la, lb) in a.layers.iter().zip(&b.layers) {
            for (ga, gb) in la.weight_grad.iter().zip(&lb.weight_grad) {
                assert!((ga - gb).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_soft_update() {
        let mut r = rng();
        let source = small_net(&mut r);
        let mut target = small_net(&mut r);
        target.soft_update_from(&source, 1.0).unwrap();
        let x = [0.1, 0.2, 0.3];
        assert_eq!(target.predict(&x).unwrap(), source.predict(&x).unwrap());

        let other = NeuralNetwork::new(3, &[LayerSpec::new(2, Activation::Linear)], &mut r).unwrap();
        assert!(matches!(target.soft_update_from(&other, 0.5), Err(NetworkError::ShapeMismatch)));
    }

    // ========================================================================
    // Checkpoints
    // ========================================================================

    #[test]
    fn test_checkpoint_roundtrip() {
        let mut r = rng();
        let net = NeuralNetwork::new(
            5,
            &[
                LayerSpec::new(7, Activation::ReLU).with_batch_norm(),
                LayerSpec::new(4, Activation::Sigmoid).with_dropout(0.2),
            ],
            &mut r,
        )
        .unwrap();
        let bytes = net.to_bytes();
        assert_eq!(&bytes[..4], b"BNN1");
        let restored = NeuralNetwork::from_bytes(&bytes).unwrap();
        assert!(restored.same_shape(&net));
        let x = [0.1, 0.4, -0.3, 0.9, 0.0];
        assert_eq!(restored.predict(&x).unwrap(), net.predict(&x).unwrap());
    }

    #[test]
    fn test_checkpoint_rejects_garbage() {
        assert!(matches!(NeuralNetwork::from_bytes(b"XXXX\x01\0\0\0"), Err(NetworkError::BadMagic)));
        let mut r = rng();
        let bytes = small_net(&mut r).to_bytes();
        assert!(matches!(NeuralNetwork::from_bytes(&bytes[..bytes.len() - 3]), Err(NetworkError::Io(_))));
    }

    #[test]
    fn test_load_or_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = rng();
        let fallback = small_net(&mut r);

        let missing = dir.path().join("missing.bnn");
        let loaded = NeuralNetwork::load_or(&missing, fallback.clone());
        assert_eq!(loaded.predict(&[1.0, 1.0, 1.0]).unwrap(), fallback.predict(&[1.0, 1.0, 1.0]).unwrap());

        let corrupt = dir.path().join("corrupt.bnn");
        std::fs::write(&corrupt, b"BNN1garbage").unwrap();
        let loaded = NeuralNetwork::load_or(&corrupt, fallback.clone());
        assert!(loaded.same_shape(&fallback));

        let saved = dir.path().join("saved.bnn");
        let trained = small_net(&mut r);
        trained.save(&saved).unwrap();
        let loaded = NeuralNetwork::load_or(&saved, fallback);
        assert_eq!(loaded.predict(&[1.0, 1.0, 1.0]).unwrap(), trained.predict(&[1.0, 1.0, 1.0]).unwrap());
    }
}
