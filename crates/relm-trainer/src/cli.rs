//! Command-line flags of `relm-train`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use relm_core::{LrSchedule, MaskMode, RunConfig, TaskName};

/// Fine-tune a masked language model to correct Chinese spelling by rephrasing.
///
/// Multi-valued flags take several values or one space-separated string.
#[derive(Parser, Debug, Clone)]
#[command(name = "relm-train", version)]
pub struct Args {
    #[arg(long = "do_train")]
    pub do_train: bool,
    #[arg(long = "do_eval")]
    pub do_eval: bool,
    #[arg(long = "do_test")]
    pub do_test: bool,
    /// List parameters and whether they are trained, then exit.
    #[arg(long = "print_para_names")]
    pub print_para_names: bool,

    /// Tasks to train on; the first one is evaluated.
    #[arg(long = "task_name", num_args = 1.., value_delimiter = ' ', default_value = "ecspell")]
    pub task_name: Vec<String>,
    /// One training dataset name per task.
    #[arg(long = "train_on", num_args = 1.., value_delimiter = ' ')]
    pub train_on: Vec<String>,
    #[arg(long = "eval_on")]
    pub eval_on: Option<String>,
    #[arg(long = "test_on")]
    pub test_on: Option<String>,

    /// Mask source characters of correction examples during training.
    #[arg(long = "mft")]
    pub mft: bool,
    /// Which source positions are sampled: noerror, error or all.
    #[arg(long = "mask_mode", default_value = "noerror")]
    pub mask_mode: String,
    #[arg(long = "mask_rate", default_value_t = 0.2)]
    pub mask_rate: f32,
    /// Learned prompt tokens on each side of the source.
    #[arg(long = "prompt_length", default_value_t = 10)]
    pub prompt_length: usize,
    /// Use [CLS]/[SEP] in place of learned prompt tokens.
    #[arg(long = "not_apply_prompt")]
    pub not_apply_prompt: bool,
    /// Train only the prompt embeddings and classification heads.
    #[arg(long = "freeze_lm")]
    pub freeze_lm: bool,
    /// Train only the prediction heads.
    #[arg(long = "linear_prob")]
    pub linear_prob: bool,

    #[arg(long = "max_seq_length", default_value_t = 128)]
    pub max_seq_length: usize,
    #[arg(long = "train_batch_size", default_value_t = 32)]
    pub train_batch_size: usize,
    #[arg(long = "eval_batch_size", default_value_t = 64)]
    pub eval_batch_size: usize,
    #[arg(long = "gradient_accumulation_steps", default_value_t = 1)]
    pub gradient_accumulation_steps: usize,
    #[arg(long = "learning_rate", default_value_t = 5e-5)]
    pub learning_rate: f64,
    #[arg(long = "weight_decay", default_value_t = 0.01)]
    pub weight_decay: f64,
    /// linear or constant.
    #[arg(long = "lr_scheduler_type", default_value = "linear")]
    pub lr_scheduler_type: String,
    #[arg(long = "warmup_proportion", default_value_t = 0.1)]
    pub warmup_proportion: f64,
    #[arg(long = "num_train_epochs", default_value_t = 3.0)]
    pub num_train_epochs: f64,
    /// Overrides --num_train_epochs.
    #[arg(long = "max_train_steps")]
    pub max_train_steps: Option<usize>,
    #[arg(long = "save_steps", default_value_t = 100)]
    pub save_steps: usize,

    #[arg(long = "seed", default_value_t = 42)]
    pub seed: u64,
    #[arg(long = "fp16")]
    pub fp16: bool,
    #[arg(long = "no_cuda")]
    pub no_cuda: bool,
    #[arg(long = "do_lower_case")]
    pub do_lower_case: bool,

    #[arg(long = "data_dir", default_value = "data")]
    pub data_dir: PathBuf,
    #[arg(long = "output_dir", default_value = "model")]
    pub output_dir: PathBuf,
    /// Pretrained model directory (config.json, vocabulary, weights).
    #[arg(long = "load_model_path", default_value = "bert-base-chinese")]
    pub load_model_path: PathBuf,
    /// Fine-tuned weights loaded over the pretrained ones.
    #[arg(long = "load_state_dict", alias = "load_checkpoint")]
    pub load_state_dict: Option<PathBuf>,
}

impl Args {
    /// Convert to a validated [`RunConfig`].
    pub fn into_config(self) -> Result<RunConfig> {
        let task_names = self
            .task_name
            .iter()
            .map(|t| t.parse::<TaskName>())
            .collect::<relm_core::Result<Vec<_>>>()
            .context("--task_name")?;
        let mask_mode: MaskMode = self.mask_mode.parse().context("--mask_mode")?;
        let lr_scheduler_type: LrSchedule = self
            .lr_scheduler_type
            .parse()
            .context("--lr_scheduler_type")?;

        let config = RunConfig {
            task_names,
            train_on: self.train_on,
            eval_on: self.eval_on,
            test_on: self.test_on,
            do_train: self.do_train,
            do_eval: self.do_eval,
            do_test: self.do_test,
            print_para_names: self.print_para_names,
            mft: self.mft,
            mask_mode,
            mask_rate: self.mask_rate,
            prompt_length: self.prompt_length,
            apply_prompt: !self.not_apply_prompt,
            freeze_lm: self.freeze_lm,
            linear_prob: self.linear_prob,
            max_seq_length: self.max_seq_length,
            train_batch_size: self.train_batch_size,
            eval_batch_size: self.eval_batch_size,
            gradient_accumulation_steps: self.gradient_accumulation_steps,
            learning_rate: self.learning_rate,
            weight_decay: self.weight_decay,
            lr_scheduler_type,
            warmup_proportion: self.warmup_proportion,
            num_train_epochs: self.num_train_epochs,
            max_train_steps: self.max_train_steps,
            save_steps: self.save_steps,
            seed: self.seed,
            fp16: self.fp16,
            no_cuda: self.no_cuda,
            do_lower_case: self.do_lower_case,
            data_dir: self.data_dir,
            output_dir: self.output_dir,
            load_model_path: self.load_model_path,
            load_state_dict: self.load_state_dict,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("relm-train").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_space_separated_tasks() {
        let config = parse(&[
            "--do_train",
            "--task_name",
            "ecspell tnews",
            "--train_on",
            "law",
            "base",
            "--mft",
        ])
        .into_config()
        .unwrap();
        assert_eq!(config.task_names, vec![TaskName::Ecspell, TaskName::Tnews]);
        assert_eq!(config.train_on, vec!["law", "base"]);
        assert!(config.mft);
        assert!(config.apply_prompt);
    }

    #[test]
    fn test_task_count_mismatch_fails() {
        let err = parse(&["--do_train", "--task_name", "ecspell tnews", "--train_on", "law"])
            .into_config()
            .unwrap_err();
        assert!(err.to_string().contains("ecspell tnews"), "{err}");
    }

    #[test]
    fn test_unknown_task_fails() {
        assert!(
            parse(&["--do_train", "--task_name", "cola", "--train_on", "x"])
                .into_config()
                .is_err()
        );
    }

    #[test]
    fn test_checkpoint_alias_and_flags() {
        let config = parse(&[
            "--do_eval",
            "--eval_on",
            "law",
            "--load_checkpoint",
            "model/step-100.safetensors",
            "--not_apply_prompt",
            "--mask_mode",
            "all",
            "--lr_scheduler_type",
            "constant",
        ])
        .into_config()
        .unwrap();
        assert_eq!(config.load_state_dict, Some(PathBuf::from("model/step-100.safetensors")));
        assert!(!config.apply_prompt);
        assert_eq!(config.mask_mode, MaskMode::All);
        assert_eq!(config.lr_scheduler_type, LrSchedule::Constant);
    }

    #[test]
    fn test_defaults_match_run_config() {
        let config = parse(&["--do_eval", "--eval_on", "law"]).into_config().unwrap();
        let expected = RunConfig::new()
            .with_actions(false, true, false)
            .with_eval_on("law");
        assert_eq!(config, expected);
    }

    #[test]
    fn test_no_action_fails() {
        assert!(parse(&["--eval_on", "law"]).into_config().is_err());
    }
}
