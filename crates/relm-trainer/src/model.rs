//! BERT backbone with a tied masked-LM head and per-task classifiers.
//!
//! All parameters live in one [`VarMap`] so that pretrained weights,
//! fine-tuned checkpoints and the optimizer see the same variables.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Init, LayerNorm, Linear, VarBuilder, VarMap};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use serde::Deserialize;
use tracing::{debug, info, warn};

use relm_core::TaskName;

use crate::batch::Batch;

/// Name of the word embedding matrix, shared with the MLM decoder.
pub const WORD_EMBEDDINGS: &str = "bert.embeddings.word_embeddings.weight";

/// The few backbone dimensions the heads need, read from `config.json`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BackboneDims {
    pub hidden_size: usize,
    pub vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

/// `cls.predictions`: transform, then a decoder tied to the word embeddings.
pub struct MlmHead {
    dense: Linear,
    layer_norm: LayerNorm,
    decoder: Linear,
}

impl MlmHead {
    fn load(vb: &VarBuilder, dims: BackboneDims) -> candle_core::Result<Self> {
        let (h, v) = (dims.hidden_size, dims.vocab_size);
        let transform = vb.pp("cls").pp("predictions").pp("transform");
        let dense = candle_nn::linear(h, h, transform.pp("dense"))?;
        let layer_norm = candle_nn::layer_norm(h, dims.layer_norm_eps, transform.pp("LayerNorm"))?;
        let weight = vb
            .pp("bert")
            .pp("embeddings")
            .pp("word_embeddings")
            .get((v, h), "weight")?;
        let bias = vb
            .pp("cls")
            .pp("predictions")
            .get_with_hints(v, "bias", Init::Const(0.))?;
        Ok(Self {
            dense,
            layer_norm,
            decoder: Linear::new(weight, Some(bias)),
        })
    }
}

impl Module for MlmHead {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.dense.forward(xs)?.gelu_erf()?;
        let xs = self.layer_norm.forward(&xs)?;
        self.decoder.forward(&xs)
    }
}

/// Result of copying a weight file into the variable map.
#[derive(Debug, Default)]
pub struct LoadSummary {
    pub loaded: usize,
    /// Model variables the file did not provide.
    pub missing: Vec<String>,
    /// File tensors with no matching variable.
    pub unexpected: Vec<String>,
}

/// Backbone, MLM head and classification heads over a shared [`VarMap`].
pub struct RelmModel {
    varmap: VarMap,
    bert: BertModel,
    mlm: MlmHead,
    pooler: Linear,
    heads: BTreeMap<TaskName, Linear>,
    dims: BackboneDims,
    device: Device,
}

impl RelmModel {
    /// Build the model from a HuggingFace-style directory and load its
    /// pretrained weights. `heads` gives the label count of every
    /// classification task.
    pub fn from_pretrained(
        model_dir: &Path,
        heads: &[(TaskName, usize)],
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let config_path = model_dir.join("config.json");
        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        let config: BertConfig = serde_json::from_str(&config_str)
            .with_context(|| format!("parsing {}", config_path.display()))?;
        let dims: BackboneDims = serde_json::from_str(&config_str)?;

        let model = Self::new(&config, dims, heads, dtype, device)?;
        let weights = pretrained_weights(model_dir)?;
        let summary = model.load_weights(&weights)?;
        info!(
            path = %weights.display(),
            loaded = summary.loaded,
            missing = summary.missing.len(),
            "pretrained weights loaded"
        );
        for name in &summary.missing {
            debug!(name, "initialised from scratch");
        }
        Ok(model)
    }

    /// Freshly initialised model.
    pub fn new(
        config: &BertConfig,
        dims: BackboneDims,
        heads: &[(TaskName, usize)],
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);

        let bert = BertModel::load(vb.pp("bert"), config)?;
        let mlm = MlmHead::load(&vb, dims)?;
        let pooler = candle_nn::linear(
            dims.hidden_size,
            dims.hidden_size,
            vb.pp("bert").pp("pooler").pp("dense"),
        )?;

        let mut classifiers = BTreeMap::new();
        for &(task, num_labels) in heads {
            let prefix = task
                .head_prefix()
                .ok_or_else(|| anyhow!("{task} is not a classification task"))?;
            let head = candle_nn::linear(dims.hidden_size, num_labels, vb.pp(prefix))?;
            classifiers.insert(task, head);
        }

        Ok(Self {
            varmap,
            bert,
            mlm,
            pooler,
            heads: classifiers,
            dims,
            device: device.clone(),
        })
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[must_use]
    pub fn dims(&self) -> BackboneDims {
        self.dims
    }

    #[must_use]
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    #[must_use]
    pub fn has_head(&self, task: TaskName) -> bool {
        self.heads.contains_key(&task)
    }

    /// Final hidden states, `(batch, seq, hidden)`.
    pub fn hidden(&self, batch: &Batch) -> Result<Tensor> {
        Ok(self.bert.forward(
            &batch.input_ids,
            &batch.token_type_ids,
            Some(&batch.attention_mask),
        )?)
    }

    /// Vocabulary logits at flattened `row * seq_len + pos` positions, `(n, vocab)`.
    pub fn mlm_logits_at(&self, hidden: &Tensor, flat_positions: &[u32]) -> Result<Tensor> {
        let (b, t, h) = hidden.dims3()?;
        let index = Tensor::new(flat_positions, &self.device)?;
        let selected = hidden.reshape((b * t, h))?.index_select(&index, 0)?;
        Ok(self.mlm.forward(&selected)?)
    }

    /// Class logits of `task` for the given batch rows, `(rows, labels)`.
    pub fn class_logits(&self, hidden: &Tensor, task: TaskName, rows: &[u32]) -> Result<Tensor> {
        let head = self
            .heads
            .get(&task)
            .ok_or_else(|| anyhow!("no classification head for {task}"))?;
        let index = Tensor::new(rows, &self.device)?;
        let cls = hidden.narrow(1, 0, 1)?.squeeze(1)?.contiguous()?.index_select(&index, 0)?;
        let pooled = self.pooler.forward(&cls)?.tanh()?;
        Ok(head.forward(&pooled)?)
    }

    /// Copy a safetensors or PyTorch weight file into the variables.
    pub fn load_weights(&self, path: &Path) -> Result<LoadSummary> {
        let tensors = read_tensors(path, &self.device)?;
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("variable map lock poisoned"))?;

        let mut summary = LoadSummary::default();
        let mut seen = HashSet::new();
        for (raw, tensor) in tensors {
            let Some(name) = canonical_name(&raw, |n| vars.contains_key(n)) else {
                summary.unexpected.push(raw);
                continue;
            };
            let var = &vars[&name];
            if var.shape() != tensor.shape() {
                bail!(
                    "{}: {name} has shape {:?} but the model expects {:?}",
                    path.display(),
                    tensor.shape(),
                    var.shape()
                );
            }
            var.set(&tensor.to_dtype(var.dtype())?.to_device(var.device())?)?;
            seen.insert(name);
            summary.loaded += 1;
        }
        summary.missing = vars.keys().filter(|k| !seen.contains(*k)).cloned().collect();
        summary.missing.sort();
        summary.unexpected.sort();
        for name in &summary.unexpected {
            debug!(name, "unused tensor in weight file");
        }
        if summary.loaded == 0 {
            warn!(path = %path.display(), "no tensor matched a model variable");
        }
        Ok(summary)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.varmap
            .save(path)
            .with_context(|| format!("saving weights to {}", path.display()))
    }

    /// Every variable with its shape, sorted by name.
    pub fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("variable map lock poisoned"))?;
        let mut named: Vec<(String, Var)> = vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(named)
    }
}

/// Weight file shipped in a model directory.
fn pretrained_weights(model_dir: &Path) -> Result<PathBuf> {
    ["model.safetensors", "pytorch_model.bin"]
        .iter()
        .map(|f| model_dir.join(f))
        .find(|p| p.is_file())
        .ok_or_else(|| anyhow!("no model.safetensors or pytorch_model.bin in {}", model_dir.display()))
}

fn read_tensors(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    let tensors = match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => candle_core::safetensors::load(path, device)?,
        Some("bin" | "pt" | "pth") => candle_core::pickle::read_all(path)?.into_iter().collect(),
        _ => bail!("unsupported weight file {}", path.display()),
    };
    Ok(tensors)
}

/// Map a weight-file tensor name onto a model variable name.
///
/// Old BERT checkpoints name LayerNorm parameters `gamma`/`beta`, and some
/// exports drop the `bert.` prefix.
pub fn canonical_name(raw: &str, is_known: impl Fn(&str) -> bool) -> Option<String> {
    let name = if let Some(stem) = raw.strip_suffix(".gamma") {
        format!("{stem}.weight")
    } else if let Some(stem) = raw.strip_suffix(".beta") {
        format!("{stem}.bias")
    } else {
        raw.to_string()
    };
    if is_known(&name) {
        return Some(name);
    }
    let prefixed = format!("bert.{name}");
    is_known(&prefixed).then_some(prefixed)
}

/// Which parameters are updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeMode {
    /// Every parameter.
    Full,
    /// Prompt rows of the word embeddings plus classification heads (`--freeze_lm`).
    PromptOnly,
    /// Prediction heads only (`--linear_prob`).
    HeadsOnly,
}

fn is_classifier(name: &str) -> bool {
    TaskName::ALL
        .iter()
        .filter_map(|t| t.head_prefix())
        .any(|prefix| name.starts_with(prefix))
}

/// Whether `name` is trained under `mode`.
#[must_use]
pub fn is_trainable(name: &str, mode: FreezeMode) -> bool {
    match mode {
        FreezeMode::Full => true,
        FreezeMode::PromptOnly => name == WORD_EMBEDDINGS || is_classifier(name),
        FreezeMode::HeadsOnly => {
            is_classifier(name)
                || name.starts_with("cls.predictions.transform")
                || name == "cls.predictions.bias"
        }
    }
}

/// Bias and LayerNorm parameters are excluded from weight decay.
#[must_use]
pub fn is_no_decay(name: &str) -> bool {
    name.ends_with(".bias") || name.contains("LayerNorm")
}
