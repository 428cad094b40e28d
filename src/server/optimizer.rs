//! Gradient application for stored parameters.
//!
//! The optimizer config arrives once with `InitParam` as a JSON blob and is
//! kept next to the parameter for every later gradient.

use crate::core::{ElementType, Error, Gradient, Parameter, Result};
use serde::{Deserialize, Serialize};

/// Supported optimizer algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Plain stochastic gradient descent
    Sgd,
}

impl Default for OptimizerKind {
    fn default() -> Self {
        Self::Sgd
    }
}

/// Optimizer configuration as carried in `ParameterWithConfig::config`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Algorithm to use
    pub kind: OptimizerKind,
    /// Step size
    pub learning_rate: f64,
}

impl OptimizerConfig {
    /// Decode a config blob, falling back to `default` for an empty blob.
    pub fn from_blob(blob: &[u8], default: &OptimizerConfig) -> Result<Self> {
        if blob.is_empty() {
            return Ok(default.clone());
        }
        let config: Self = serde_json::from_slice(blob)
            .map_err(|e| Error::InvalidConfig(format!("optimizer config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Encode as a config blob.
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.learning_rate.is_finite() || self.learning_rate < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "learning rate must be a non-negative number, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Sgd,
            learning_rate: 0.01,
        }
    }
}

/// Applies gradients to a parameter.
pub trait Optimizer: Send + Sync {
    /// Apply `grad` to `param`, replacing its content.
    fn update(&mut self, param: &mut Parameter, grad: &Gradient) -> Result<()>;

    /// The algorithm implemented.
    fn kind(&self) -> OptimizerKind;
}

/// Create an optimizer from configuration.
pub fn create_optimizer(config: &OptimizerConfig) -> Box<dyn Optimizer> {
    match config.kind {
        OptimizerKind::Sgd => Box::new(SgdOptimizer::new(config.learning_rate)),
    }
}

/// `param -= learning_rate * grad`, elementwise.
#[derive(Clone, Debug)]
pub struct SgdOptimizer {
    learning_rate: f64,
}

impl SgdOptimizer {
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }

    fn check_shape(param: &Parameter, grad: &Gradient) -> Result<()> {
        if param.element_type != grad.element_type {
            return Err(Error::InvalidGradient(format!(
                "{}: element type {} does not match parameter type {}",
                grad.name, grad.element_type, param.element_type
            )));
        }
        if param.content.len() != grad.content.len() {
            return Err(Error::InvalidGradient(format!(
                "{}: {} bytes does not match parameter size {}",
                grad.name,
                grad.content.len(),
                param.content.len()
            )));
        }
        if param.content.len() % param.element_type.size_of() != 0 {
            return Err(Error::InvalidGradient(format!(
                "{}: {} bytes is not a whole number of {} elements",
                grad.name,
                param.content.len(),
                param.element_type
            )));
        }
        Ok(())
    }
}

impl Optimizer for SgdOptimizer {
    fn update(&mut self, param: &mut Parameter, grad: &Gradient) -> Result<()> {
        Self::check_shape(param, grad)?;

        let updated: Vec<u8> = match param.element_type {
            ElementType::Float32 => {
                let lr = self.learning_rate as f32;
                param
                    .content
                    .chunks_exact(4)
                    .zip(grad.content.chunks_exact(4))
                    .flat_map(|(p, g)| {
                        let p = f32::from_le_bytes([p[0], p[1], p[2], p[3]]);
                        let g = f32::from_le_bytes([g[0], g[1], g[2], g[3]]);
                        (p - lr * g).to_le_bytes()
                    })
                    .collect()
            }
            ElementType::Float64 => {
                let lr = self.learning_rate;
                param
                    .content
                    .chunks_exact(8)
                    .zip(grad.content.chunks_exact(8))
                    .flat_map(|(p, g)| {
                        let mut pb = [0u8; 8];
                        let mut gb = [0u8; 8];
                        pb.copy_from_slice(p);
                        gb.copy_from_slice(g);
                        (f64::from_le_bytes(pb) - lr * f64::from_le_bytes(gb)).to_le_bytes()
                    })
                    .collect()
            }
            other => return Err(Error::UnsupportedElementType(other)),
        };

        param.content = updated;
        Ok(())
    }

    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Sgd
    }
}
