//! End-to-end run: load data and model, then train, evaluate and test.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use tracing::{info, warn};

use relm_core::{CharTokenizer, RephraseTemplate, RunConfig, Split, TaskKind, TaskName, load_examples};

use crate::checkpoint::TrainerState;
use crate::dataset::{LabelLists, TaskData, load_label_lists, save_label_lists};
use crate::evaluator::Evaluator;
use crate::model::RelmModel;
use crate::trainer::{Trainer, freeze_mode, parameter_table};

pub const TRAIN_ARGS_FILE: &str = "train_args.json";

/// Sub-directory of `output_dir` receiving test results.
pub const TEST_DIR: &str = "test";

/// `--no_cuda` forces the CPU; otherwise the first CUDA device when present.
pub fn select_device(config: &RunConfig) -> Result<(Device, DType)> {
    let device = if config.no_cuda {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    let dtype = if config.fp16 && device.is_cuda() {
        DType::F16
    } else {
        if config.fp16 {
            warn!("--fp16 needs a CUDA device, running in f32");
        }
        DType::F32
    };
    Ok((device, dtype))
}

fn load_set(
    config: &RunConfig,
    tokenizer: &CharTokenizer,
    labels: &LabelLists,
    task: TaskName,
    split: Split,
    name: &str,
) -> Result<TaskData> {
    let loaded = load_examples(&config.data_dir, task, split, name)
        .with_context(|| format!("loading {split} set {name} of {task}"))?;
    TaskData::encode(loaded, name, tokenizer, labels.get(&task).map(Vec::as_slice))
}

/// Run every phase `config` asks for.
pub fn run(config: &RunConfig) -> Result<()> {
    config.validate()?;
    fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating {}", config.output_dir.display()))?;

    let (device, dtype) = select_device(config)?;
    info!(?device, ?dtype, "device");

    let tokenizer = CharTokenizer::from_model_dir(&config.load_model_path)
        .with_context(|| format!("loading vocabulary from {}", config.load_model_path.display()))?
        .with_lowercase(config.do_lower_case);
    let template = RephraseTemplate::new(
        &tokenizer,
        config.prompt_length,
        config.max_seq_length,
        config.apply_prompt,
    )?;

    let mut labels = load_label_lists(&config.output_dir)?;
    let mut train_sets = Vec::new();
    if config.do_train {
        for (task, name) in config.train_sets() {
            let data = load_set(config, &tokenizer, &LabelLists::new(), task, Split::Train, name)?;
            if task.kind() == TaskKind::Seq {
                labels.insert(task, data.label_list.clone());
            }
            train_sets.push(data);
        }
        save_label_lists(&config.output_dir, &labels)?;
        let args_path = config.output_dir.join(TRAIN_ARGS_FILE);
        fs::write(&args_path, config.to_json()?)
            .with_context(|| format!("writing {}", args_path.display()))?;
    }

    let primary = config.primary_task();
    let eval_set = match (&config.eval_on, config.do_eval) {
        (Some(name), true) => Some(load_set(config, &tokenizer, &labels, primary, Split::Test, name)?),
        _ => None,
    };
    let test_set = match (&config.test_on, config.do_test) {
        (Some(name), true) => Some(load_set(config, &tokenizer, &labels, primary, Split::Test, name)?),
        _ => None,
    };
    for data in eval_set.iter().chain(&test_set) {
        if data.task.kind() == TaskKind::Seq {
            labels.entry(data.task).or_insert_with(|| data.label_list.clone());
        }
    }

    let mut heads = Vec::new();
    for &task in &config.task_names {
        if task.kind() != TaskKind::Seq {
            continue;
        }
        match labels.get(&task) {
            Some(list) if !list.is_empty() => heads.push((task, list.len())),
            _ => warn!(task = %task, "no label list known, skipping its classification head"),
        }
    }

    let model = RelmModel::from_pretrained(&config.load_model_path, &heads, dtype, &device)?;
    if let Some(path) = &config.load_state_dict {
        load_state(&model, path)?;
    }

    if config.print_para_names {
        for param in parameter_table(&model, freeze_mode(config))? {
            println!("{}\t{:?}\t{}", param.name, param.shape, param.trainable);
        }
        return Ok(());
    }

    let evaluator = Evaluator::new(&model, &tokenizer, &template, config.eval_batch_size);
    let mut global_step = TrainerState::load(&config.output_dir)
        .map(|s| s.global_step)
        .unwrap_or(0);

    if config.do_train {
        let trainer = Trainer::new(config, &model, &tokenizer, &template)?;
        let summary = trainer.train(&train_sets, eval_set.as_ref())?;
        info!(
            global_step = summary.global_step,
            train_loss = summary.train_loss,
            best = ?summary.best_checkpoint,
            "training finished"
        );
        global_step = summary.global_step;
        if test_set.is_some() {
            if let Some(best) = &summary.best_checkpoint {
                load_state(&model, best)?;
            }
        }
    } else if let Some(data) = &eval_set {
        let outcome = evaluator.evaluate(data)?;
        outcome.log(global_step, None);
        outcome.write(&config.output_dir, global_step)?;
    }

    if let Some(data) = &test_set {
        let test_dir = config.output_dir.join(TEST_DIR);
        fs::create_dir_all(&test_dir).with_context(|| format!("creating {}", test_dir.display()))?;
        info!("***** Running test *****");
        let outcome = evaluator.evaluate(data)?;
        outcome.log(global_step, None);
        outcome.write(&test_dir, global_step)?;
    }
    Ok(())
}

fn load_state(model: &RelmModel, path: &Path) -> Result<()> {
    let summary = model
        .load_weights(path)
        .with_context(|| format!("loading state dict {}", path.display()))?;
    info!(
        path = %path.display(),
        loaded = summary.loaded,
        missing = summary.missing.len(),
        unexpected = summary.unexpected.len(),
        "state dict loaded"
    );
    Ok(())
}

/// Output paths a run fills, for callers that want to report them.
#[must_use]
pub fn output_files(config: &RunConfig) -> Vec<PathBuf> {
    let mut files = vec![config.output_dir.join(crate::evaluator::EVAL_RESULTS_FILE)];
    if config.do_train {
        files.push(config.output_dir.join(TRAIN_ARGS_FILE));
        files.push(config.output_dir.join(crate::checkpoint::TRAINER_STATE_FILE));
    }
    if config.do_test {
        files.push(config.output_dir.join(TEST_DIR).join(crate::evaluator::EVAL_RESULTS_FILE));
    }
    files
}
