//! # Run Configuration
//!
//! Every knob of a training or evaluation run, validated once before any
//! data is read. Binaries fill it from command-line flags; the trainer
//! persists it next to its checkpoints.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RelmError, Result};
use crate::masking::{MaskMode, MaskingPolicy};
use crate::types::{TaskKind, TaskName};

/// Learning-rate schedule after warmup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrSchedule {
    /// Linear warmup, then linear decay to zero.
    #[default]
    Linear,
    /// Linear warmup, then constant.
    Constant,
}

impl FromStr for LrSchedule {
    type Err = RelmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "constant" => Ok(Self::Constant),
            other => Err(RelmError::InvalidConfig(format!(
                "unknown lr scheduler {other:?} (expected linear or constant)"
            ))),
        }
    }
}

impl fmt::Display for LrSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Constant => write!(f, "constant"),
        }
    }
}

/// Configuration of one run. Immutable once validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Tasks trained jointly. The first one is evaluated.
    pub task_names: Vec<TaskName>,
    /// Training dataset name per task, same order as `task_names`.
    pub train_on: Vec<String>,
    pub eval_on: Option<String>,
    pub test_on: Option<String>,

    pub do_train: bool,
    pub do_eval: bool,
    pub do_test: bool,
    /// Only list parameter names and exit.
    pub print_para_names: bool,

    /// Minimum-force-training masking of the source sentence.
    pub mft: bool,
    pub mask_mode: MaskMode,
    pub mask_rate: f32,
    pub prompt_length: usize,
    pub apply_prompt: bool,
    pub freeze_lm: bool,
    pub linear_prob: bool,

    pub max_seq_length: usize,
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub lr_scheduler_type: LrSchedule,
    pub warmup_proportion: f64,
    pub num_train_epochs: f64,
    /// Overrides `num_train_epochs` when set.
    pub max_train_steps: Option<usize>,
    pub save_steps: usize,
    pub seed: u64,
    pub fp16: bool,
    pub no_cuda: bool,
    pub do_lower_case: bool,

    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Backbone directory (`config.json`, weights, vocabulary).
    pub load_model_path: PathBuf,
    /// Fine-tuned weights loaded over the backbone.
    pub load_state_dict: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            task_names: vec![TaskName::Ecspell],
            train_on: Vec::new(),
            eval_on: None,
            test_on: None,
            do_train: false,
            do_eval: false,
            do_test: false,
            print_para_names: false,
            mft: false,
            mask_mode: MaskMode::NoError,
            mask_rate: 0.2,
            prompt_length: 10,
            apply_prompt: true,
            freeze_lm: false,
            linear_prob: false,
            max_seq_length: 128,
            train_batch_size: 32,
            eval_batch_size: 64,
            gradient_accumulation_steps: 1,
            learning_rate: 5e-5,
            weight_decay: 0.01,
            lr_scheduler_type: LrSchedule::Linear,
            warmup_proportion: 0.1,
            num_train_epochs: 3.0,
            max_train_steps: None,
            save_steps: 100,
            seed: 42,
            fp16: false,
            no_cuda: false,
            do_lower_case: false,
            data_dir: PathBuf::from("data"),
            output_dir: PathBuf::from("model"),
            load_model_path: PathBuf::from("bert-base-chinese"),
            load_state_dict: None,
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the task list and one training dataset per task.
    pub fn with_tasks<I, S>(mut self, tasks: Vec<TaskName>, train_on: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task_names = tasks;
        self.train_on = train_on.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_eval_on(mut self, name: impl Into<String>) -> Self {
        self.eval_on = Some(name.into());
        self
    }

    pub fn with_test_on(mut self, name: impl Into<String>) -> Self {
        self.test_on = Some(name.into());
        self
    }

    /// Select which phases run.
    pub fn with_actions(mut self, train: bool, eval: bool, test: bool) -> Self {
        self.do_train = train;
        self.do_eval = eval;
        self.do_test = test;
        self
    }

    /// Enable minimum-force-training with the given candidate mode and rate.
    pub fn with_mft(mut self, mode: MaskMode, rate: f32) -> Self {
        self.mft = true;
        self.mask_mode = mode;
        self.mask_rate = rate;
        self
    }

    pub fn with_prompt_length(mut self, prompt_length: usize) -> Self {
        self.prompt_length = prompt_length;
        self
    }

    pub fn with_max_seq_length(mut self, max_seq_length: usize) -> Self {
        self.max_seq_length = max_seq_length;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Check the configuration as a whole. Run before touching any data.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RelmError::InvalidConfig(msg));

        if !(self.do_train || self.do_eval || self.do_test || self.print_para_names) {
            return invalid(
                "at least one of --do_train, --do_eval, --do_test or --print_para_names is required"
                    .into(),
            );
        }
        if self.task_names.is_empty() {
            return invalid("no task given".into());
        }
        for (i, task) in self.task_names.iter().enumerate() {
            if self.task_names[..i].contains(task) {
                return invalid(format!("task {task} listed twice"));
            }
        }
        if self.do_train && self.train_on.len() != self.task_names.len() {
            return invalid(format!(
                "{} tasks ({}) but {} train_on datasets",
                self.task_names.len(),
                join(&self.task_names),
                self.train_on.len()
            ));
        }
        if self.do_eval && self.eval_on.is_none() {
            return invalid("--do_eval needs --eval_on".into());
        }
        if self.do_test && self.test_on.is_none() {
            return invalid("--do_test needs --test_on".into());
        }
        if self.mft && self.primary_task().kind() != TaskKind::Csc {
            return invalid(format!(
                "--mft masks correction examples but the first task is {}",
                self.primary_task()
            ));
        }
        if !(0.0..=1.0).contains(&self.mask_rate) || self.mask_rate.is_nan() {
            return invalid(format!("mask rate must lie in [0, 1], got {}", self.mask_rate));
        }
        if self.max_seq_length < 2 * self.prompt_length + 4 {
            return invalid(format!(
                "prompt length {} is too long for max_seq_length {}",
                self.prompt_length, self.max_seq_length
            ));
        }
        if self.freeze_lm && self.linear_prob {
            return invalid("--freeze_lm and --linear_prob are mutually exclusive".into());
        }
        if self.freeze_lm && (!self.apply_prompt || self.prompt_length == 0) {
            return invalid("--freeze_lm trains only prompt tokens and needs prompts".into());
        }
        if self.train_batch_size == 0 || self.eval_batch_size == 0 {
            return invalid("batch sizes must be positive".into());
        }
        if self.gradient_accumulation_steps == 0 {
            return invalid("gradient_accumulation_steps must be positive".into());
        }
        if self.save_steps == 0 {
            return invalid("save_steps must be positive".into());
        }
        if !(self.learning_rate > 0.0) {
            return invalid(format!("learning rate must be positive, got {}", self.learning_rate));
        }
        if !(0.0..=1.0).contains(&self.warmup_proportion) {
            return invalid(format!(
                "warmup proportion must lie in [0, 1], got {}",
                self.warmup_proportion
            ));
        }
        if self.do_train && self.max_train_steps.is_none() && !(self.num_train_epochs > 0.0) {
            return invalid("num_train_epochs must be positive".into());
        }
        Ok(())
    }

    /// The task whose dataset is evaluated and tested.
    #[must_use]
    pub fn primary_task(&self) -> TaskName {
        self.task_names.first().copied().unwrap_or(TaskName::Ecspell)
    }

    /// `(task, dataset)` pairs used for training.
    pub fn train_sets(&self) -> impl Iterator<Item = (TaskName, &str)> + '_ {
        self.task_names
            .iter()
            .copied()
            .zip(self.train_on.iter().map(String::as_str))
    }

    /// Masking applied to training sources, if any.
    pub fn masking_policy(&self) -> Result<Option<MaskingPolicy>> {
        if self.mft {
            MaskingPolicy::minimum_force(self.mask_mode, self.mask_rate).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Examples per forward pass. `train_batch_size` is split over the
    /// accumulation steps.
    #[must_use]
    pub fn micro_batch_size(&self) -> usize {
        (self.train_batch_size / self.gradient_accumulation_steps).max(1)
    }

    /// Micro-batches per epoch turned into the total number of optimizer updates.
    #[must_use]
    pub fn total_updates(&self, batches_per_epoch: usize) -> usize {
        self.max_train_steps.unwrap_or_else(|| {
            let per_epoch = batches_per_epoch.div_ceil(self.gradient_accumulation_steps);
            (per_epoch as f64 * self.num_train_epochs).ceil() as usize
        })
    }

    /// Pretty JSON, as written to `train_args.json`.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn join(tasks: &[TaskName]) -> String {
    tasks
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}
