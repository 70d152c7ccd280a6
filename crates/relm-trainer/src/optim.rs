//! AdamW with decoupled weight decay and checkpointable state.
//!
//! Keeps the first and second moments of every parameter as candle
//! variables, keyed by parameter name, so they can be written next to a
//! model checkpoint and restored when training resumes from it.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use tracing::{debug, warn};

/// Tensor name of the update counter in a saved state.
const STEP_KEY: &str = "step";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWParams {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for AdamWParams {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

struct ParamState {
    name: String,
    var: Var,
    weight_decay: f64,
    exp_avg: Var,
    exp_avg_sq: Var,
}

/// AdamW over named parameter groups, each with its own weight decay.
pub struct AdamW {
    params: AdamWParams,
    states: Vec<ParamState>,
    step_t: usize,
}

impl AdamW {
    #[must_use]
    pub fn new(params: AdamWParams) -> Self {
        Self {
            params,
            states: Vec::new(),
            step_t: 0,
        }
    }

    /// Add parameters sharing one weight decay. Names must be unique across groups.
    pub fn add_group(&mut self, vars: Vec<(String, Var)>, weight_decay: f64) -> Result<()> {
        for (name, var) in vars {
            if self.states.iter().any(|s| s.name == name) {
                bail!("parameter {name} is already in an optimizer group");
            }
            let exp_avg = Var::zeros(var.dims(), var.dtype(), var.device())?;
            let exp_avg_sq = Var::zeros(var.dims(), var.dtype(), var.device())?;
            self.states.push(ParamState {
                name,
                var,
                weight_decay,
                exp_avg,
                exp_avg_sq,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    /// Updates applied so far, including restored ones.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.step_t
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// One update. Parameters without a gradient in `grads` are left alone.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let AdamWParams { lr, beta1, beta2, eps } = self.params;
        let t = i32::try_from(self.step_t).unwrap_or(i32::MAX);
        let scale_m = 1.0 / (1.0 - beta1.powi(t));
        let scale_v = 1.0 / (1.0 - beta2.powi(t));

        for state in &self.states {
            let Some(g) = grads.get(state.var.as_tensor()) else {
                continue;
            };
            let m = ((state.exp_avg.as_tensor() * beta1)? + (g * (1.0 - beta1))?)?;
            let v = ((state.exp_avg_sq.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
            let update = ((&m * scale_m)? / ((&v * scale_v)?.sqrt()? + eps)?)?;
            let decayed = (state.var.as_tensor() * (1.0 - lr * state.weight_decay))?;
            state.var.set(&(decayed - (update * lr)?)?)?;
            state.exp_avg.set(&m)?;
            state.exp_avg_sq.set(&v)?;
        }
        Ok(())
    }

    /// `{name}.exp_avg`, `{name}.exp_avg_sq` for every parameter plus the step counter.
    pub fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::with_capacity(2 * self.states.len() + 1);
        for state in &self.states {
            tensors.insert(format!("{}.exp_avg", state.name), state.exp_avg.as_tensor().clone());
            tensors.insert(format!("{}.exp_avg_sq", state.name), state.exp_avg_sq.as_tensor().clone());
        }
        let step = u32::try_from(self.step_t).context("optimizer step count overflows u32")?;
        tensors.insert(STEP_KEY.to_string(), Tensor::new(&[step], &Device::Cpu)?);
        Ok(tensors)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        candle_core::safetensors::save(&self.state_tensors()?, path)
            .with_context(|| format!("saving optimizer state to {}", path.display()))
    }

    /// Restore moments and the step counter written by [`AdamW::save`].
    /// Returns how many parameters were restored; the others keep zero moments.
    pub fn load(&mut self, path: &Path) -> Result<usize> {
        let device = self
            .states
            .first()
            .map_or(Device::Cpu, |s| s.var.device().clone());
        let tensors = candle_core::safetensors::load(path, &device)
            .with_context(|| format!("reading optimizer state {}", path.display()))?;

        let step = tensors
            .get(STEP_KEY)
            .with_context(|| format!("{}: no {STEP_KEY} tensor", path.display()))?
            .to_vec1::<u32>()?;
        let Some(&step) = step.first() else {
            bail!("{}: empty {STEP_KEY} tensor", path.display());
        };

        let mut restored = 0;
        for state in &self.states {
            let moments = (
                tensors.get(&format!("{}.exp_avg", state.name)),
                tensors.get(&format!("{}.exp_avg_sq", state.name)),
            );
            let (Some(m), Some(v)) = moments else {
                debug!(name = %state.name, "no saved moments");
                continue;
            };
            for (saved, target) in [(m, &state.exp_avg), (v, &state.exp_avg_sq)] {
                if saved.dims() != target.dims() {
                    bail!(
                        "{}: moments of {} have shape {:?} but the parameter has {:?}",
                        path.display(),
                        state.name,
                        saved.dims(),
                        target.dims()
                    );
                }
                target.set(&saved.to_dtype(target.dtype())?)?;
            }
            restored += 1;
        }
        if restored < self.states.len() {
            warn!(
                path = %path.display(),
                restored,
                parameters = self.states.len(),
                "optimizer state covers only part of the parameters"
            );
        }
        self.step_t = step as usize;
        Ok(restored)
    }
}
