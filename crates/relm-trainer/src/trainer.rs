//! Multi-task fine-tuning loop.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::loss::cross_entropy;
use oorandom::Rand32;
use tracing::{debug, info, warn};

use relm_core::{CharTokenizer, MaskingPolicy, RephraseTemplate, RunConfig, TaskKind};

use crate::batch::{Batch, DataLoader};
use crate::checkpoint::{CheckpointLedger, KEEP_BEST, TrainerState, optimizer_path};
use crate::dataset::TaskData;
use crate::evaluator::Evaluator;
use crate::model::{FreezeMode, RelmModel, WORD_EMBEDDINGS, is_no_decay, is_trainable};
use crate::optim::{AdamW, AdamWParams};
use crate::schedule::LrScheduler;

/// Parameters updated under [`RunConfig::freeze_lm`] / [`RunConfig::linear_prob`].
#[must_use]
pub fn freeze_mode(config: &RunConfig) -> FreezeMode {
    if config.freeze_lm {
        FreezeMode::PromptOnly
    } else if config.linear_prob {
        FreezeMode::HeadsOnly
    } else {
        FreezeMode::Full
    }
}

/// One row of `--print_para_names`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamInfo {
    pub name: String,
    pub shape: Vec<usize>,
    pub trainable: bool,
}

pub fn parameter_table(model: &RelmModel, mode: FreezeMode) -> Result<Vec<ParamInfo>> {
    Ok(model
        .named_vars()?
        .into_iter()
        .map(|(name, var)| ParamInfo {
            trainable: is_trainable(&name, mode),
            shape: var.dims().to_vec(),
            name,
        })
        .collect())
}

/// Outcome of [`Trainer::train`].
#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub global_step: usize,
    /// Mean loss per optimizer update.
    pub train_loss: f64,
    pub best_checkpoint: Option<PathBuf>,
}

/// Trainable variables split into the weight-decay and no-decay groups.
struct ParamGroups {
    decay: Vec<(String, Var)>,
    no_decay: Vec<(String, Var)>,
    /// Word embeddings whose gradient is restricted to the prompt rows.
    prompt_rows: Option<(Var, Tensor)>,
}

impl ParamGroups {
    fn new(model: &RelmModel, mode: FreezeMode, prompt_ids: &[u32]) -> Result<Self> {
        let mut groups = Self {
            decay: Vec::new(),
            no_decay: Vec::new(),
            prompt_rows: None,
        };
        for (name, var) in model.named_vars()? {
            if !is_trainable(&name, mode) {
                continue;
            }
            if mode == FreezeMode::PromptOnly && name == WORD_EMBEDDINGS {
                let vocab = model.dims().vocab_size;
                let mut rows = vec![0f32; vocab];
                for &id in prompt_ids {
                    if let Some(row) = rows.get_mut(id as usize) {
                        *row = 1.0;
                    }
                }
                let mask = Tensor::from_vec(rows, (vocab, 1), model.device())?.to_dtype(var.dtype())?;
                groups.prompt_rows = Some((var.clone(), mask));
                groups.no_decay.push((name, var));
            } else if is_no_decay(&name) {
                groups.no_decay.push((name, var));
            } else {
                groups.decay.push((name, var));
            }
        }
        if groups.decay.is_empty() && groups.no_decay.is_empty() {
            bail!("no trainable parameters");
        }
        Ok(groups)
    }

    fn vars(&self) -> impl Iterator<Item = &Var> {
        self.decay.iter().chain(&self.no_decay).map(|(_, var)| var)
    }
}

/// Sums per-micro-batch gradients until the next optimizer update.
#[derive(Default)]
struct GradAccumulator {
    grads: Option<GradStore>,
    micro_steps: usize,
}

impl GradAccumulator {
    fn add(&mut self, grads: GradStore, groups: &ParamGroups) -> Result<()> {
        self.micro_steps += 1;
        let Some(acc) = self.grads.as_mut() else {
            self.grads = Some(grads);
            return Ok(());
        };
        for var in groups.vars() {
            let Some(g) = grads.get(var.as_tensor()) else {
                continue;
            };
            let sum = match acc.get(var.as_tensor()) {
                Some(prev) => (prev + g)?,
                None => g.clone(),
            };
            acc.insert(var.as_tensor(), sum);
        }
        Ok(())
    }

    fn take(&mut self) -> Option<GradStore> {
        self.micro_steps = 0;
        self.grads.take()
    }
}

pub struct Trainer<'a> {
    config: &'a RunConfig,
    model: &'a RelmModel,
    tokenizer: &'a CharTokenizer,
    template: &'a RephraseTemplate,
    policy: Option<MaskingPolicy>,
}

impl<'a> Trainer<'a> {
    pub fn new(
        config: &'a RunConfig,
        model: &'a RelmModel,
        tokenizer: &'a CharTokenizer,
        template: &'a RephraseTemplate,
    ) -> Result<Self> {
        Ok(Self {
            config,
            model,
            tokenizer,
            template,
            policy: config.masking_policy()?,
        })
    }

    /// Train on the mixed `train_sets`, evaluating on `eval_set` and saving
    /// a checkpoint every `save_steps` updates.
    pub fn train(&self, train_sets: &[TaskData], eval_set: Option<&TaskData>) -> Result<TrainSummary> {
        let pool: Vec<(usize, usize)> = train_sets
            .iter()
            .enumerate()
            .flat_map(|(t, data)| (0..data.len()).map(move |i| (t, i)))
            .collect();
        if pool.is_empty() {
            bail!("training sets are empty");
        }

        let accumulation = self.config.gradient_accumulation_steps.max(1);
        let loader = DataLoader::new(pool.len(), self.config.micro_batch_size());
        let total_updates = self.config.total_updates(loader.num_batches());
        let scheduler = LrScheduler::new(
            self.config.learning_rate,
            total_updates,
            self.config.warmup_proportion,
            self.config.lr_scheduler_type,
        );

        let mode = freeze_mode(self.config);
        let groups = ParamGroups::new(self.model, mode, &self.template.learned_prompt_ids())?;
        let mut optimizer = AdamW::new(AdamWParams {
            lr: scheduler.lr_at(0),
            ..Default::default()
        });
        optimizer.add_group(groups.decay.clone(), self.config.weight_decay)?;
        optimizer.add_group(groups.no_decay.clone(), 0.0)?;
        if let Some(checkpoint) = &self.config.load_state_dict {
            let path = optimizer_path(checkpoint);
            if path.is_file() {
                let restored = optimizer.load(&path)?;
                info!(path = %path.display(), restored, step = optimizer.step_count(), "optimizer state restored");
            }
        }

        info!("***** Running training *****");
        for data in train_sets {
            info!(task = %data.task, dataset = %data.name, examples = data.len(), "training set");
        }
        info!(
            batch_size = self.config.train_batch_size,
            micro_batch_size = self.config.micro_batch_size(),
            accumulation,
            total_updates,
            warmup_steps = scheduler.warmup_steps(),
            ?mode,
            "schedule"
        );

        let mut ledger = CheckpointLedger::scan(&self.config.output_dir, KEEP_BEST)?;
        let mut rng = Rand32::new(self.config.seed);
        let mut accumulator = GradAccumulator::default();
        let mut global_step = 0usize;
        let mut train_loss = 0.0f64;
        let mut last_saved = None;

        'train: for epoch in 0usize.. {
            if global_step >= total_updates {
                break;
            }
            let batches = loader.shuffled(&mut rng);
            let num_batches = batches.len();
            for (step, indices) in batches.into_iter().enumerate() {
                let features = indices
                    .iter()
                    .map(|&i| {
                        let (t, e) = pool[i];
                        let data = &train_sets[t];
                        self.template
                            .feature(data.task, &data.encoded[e], self.policy.as_ref(), &mut rng)
                    })
                    .collect::<relm_core::Result<Vec<_>>>()?;
                let batch = Batch::new(features, self.model.device())?;

                let loss = self.batch_loss(&batch)?;
                let value = f64::from(loss.to_scalar::<f32>()?);
                if !value.is_finite() {
                    bail!("loss diverged at step {global_step} (epoch {epoch}, batch {step}): {value}");
                }
                let grads = (loss / accumulation as f64)?.backward()?;
                accumulator.add(grads, &groups)?;
                train_loss += value / accumulation as f64;

                if accumulator.micro_steps < accumulation && step + 1 < num_batches {
                    continue;
                }
                let Some(mut grads) = accumulator.take() else {
                    continue;
                };
                if let Some((var, mask)) = &groups.prompt_rows {
                    if let Some(g) = grads.get(var.as_tensor()) {
                        let masked = g.broadcast_mul(mask)?;
                        grads.insert(var.as_tensor(), masked);
                    }
                }

                let lr = scheduler.lr_at(global_step);
                optimizer.set_learning_rate(lr);
                optimizer.step(&grads)?;
                global_step += 1;
                debug!(global_step, epoch, lr, loss = value, "update");

                if global_step % self.config.save_steps == 0 {
                    let mean_loss = train_loss / global_step as f64;
                    self.save_checkpoint(&mut ledger, &optimizer, eval_set, global_step, lr, mean_loss)?;
                    last_saved = Some(global_step);
                }
                if global_step >= total_updates {
                    break 'train;
                }
            }
            info!(epoch = epoch + 1, global_step, loss = train_loss / global_step.max(1) as f64, "epoch complete");
        }

        if global_step > 0 && last_saved != Some(global_step) {
            let lr = scheduler.lr_at(global_step);
            let mean_loss = train_loss / global_step as f64;
            self.save_checkpoint(&mut ledger, &optimizer, eval_set, global_step, lr, mean_loss)?;
        }

        Ok(TrainSummary {
            global_step,
            train_loss: train_loss / global_step.max(1) as f64,
            best_checkpoint: ledger.best().map(PathBuf::from),
        })
    }

    /// Sum of the per-task mean losses of a mixed batch.
    fn batch_loss(&self, batch: &Batch) -> Result<Tensor> {
        let hidden = self.model.hidden(batch)?;
        let device = self.model.device();
        let mut total: Option<Tensor> = None;
        for (task, rows) in batch.rows_by_task() {
            let loss = match task.kind() {
                TaskKind::Csc => {
                    let (positions, targets) = batch.labelled_positions(&rows);
                    if positions.is_empty() {
                        continue;
                    }
                    let logits = self.model.mlm_logits_at(&hidden, &positions)?.to_dtype(DType::F32)?;
                    cross_entropy(&logits, &Tensor::new(targets.as_slice(), device)?)?
                }
                TaskKind::Seq => {
                    let labels = rows
                        .iter()
                        .map(|&r| {
                            batch.features[r as usize]
                                .class_label
                                .ok_or_else(|| anyhow!("{task} feature without a class label"))
                        })
                        .collect::<Result<Vec<u32>>>()?;
                    let logits = self.model.class_logits(&hidden, task, &rows)?.to_dtype(DType::F32)?;
                    cross_entropy(&logits, &Tensor::new(labels.as_slice(), device)?)?
                }
            };
            total = Some(match total {
                Some(sum) => (sum + loss)?,
                None => loss,
            });
        }
        total.ok_or_else(|| anyhow!("batch has no labelled position"))
    }

    fn save_checkpoint(
        &self,
        ledger: &mut CheckpointLedger,
        optimizer: &AdamW,
        eval_set: Option<&TaskData>,
        global_step: usize,
        learning_rate: f64,
        train_loss: f64,
    ) -> Result<()> {
        let outcome = match eval_set {
            Some(data) => {
                let evaluator = Evaluator::new(self.model, self.tokenizer, self.template, self.config.eval_batch_size);
                let outcome = evaluator.evaluate(data)?;
                outcome.log(global_step, Some(train_loss));
                outcome.write(&self.config.output_dir, global_step)?;
                Some(outcome)
            }
            None => None,
        };
        let f1 = outcome.as_ref().map(|o| o.f1());

        let path = ledger.path_for(global_step, f1);
        self.model.save(&path)?;
        optimizer.save(&optimizer_path(&path))?;
        info!(path = %path.display(), global_step, "saved checkpoint");
        ledger.record(path.clone(), f1.unwrap_or(global_step as f64))?;

        let file_name = |p: &std::path::Path| p.file_name().map(|n| n.to_string_lossy().into_owned());
        let state = TrainerState {
            global_step,
            learning_rate,
            train_loss,
            eval_f1: f1,
            checkpoint: file_name(&path).context("checkpoint path has no file name")?,
            best_checkpoint: ledger.best().and_then(file_name),
        };
        if let Err(e) = state.save(&self.config.output_dir) {
            warn!(error = %e, "could not write trainer state");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relm_core::{CscExample, Example, MaskMode, TaskExamples, TaskName};
    use tempfile::TempDir;

    use crate::checkpoint::{TRAINER_STATE_FILE, parse_checkpoint_name};
    use crate::evaluator::EVAL_RESULTS_FILE;
    use crate::model::tests::tiny_model;

    fn tokenizer() -> CharTokenizer {
        let mut tokens: Vec<String> = ["[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]"]
            .iter()
            .map(|t| t.to_string())
            .collect();
        tokens.extend((1..=4).map(|i| format!("[unused{i}]")));
        tokens.extend("我今天很高心兴他们在学校读书".chars().map(String::from));
        CharTokenizer::from_tokens(tokens).unwrap()
    }

    fn csc_data(name: &str, pairs: &[(&str, &str)], tok: &CharTokenizer) -> TaskData {
        let examples = pairs
            .iter()
            .enumerate()
            .map(|(i, (src, trg))| Example::Csc(CscExample::new(format!("{name}-{i}"), src, trg).unwrap()))
            .collect();
        let loaded = TaskExamples {
            task: TaskName::Ecspell,
            examples,
        };
        TaskData::encode(loaded, name, tok, None).unwrap()
    }

    fn snapshot(model: &RelmModel) -> Vec<(String, Vec<f32>)> {
        model
            .named_vars()
            .unwrap()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()))
            .collect()
    }

    fn freeze_lm_config(output_dir: &std::path::Path) -> RunConfig {
        let mut config = RunConfig::new()
            .with_tasks(vec![TaskName::Ecspell], ["law"])
            .with_eval_on("law")
            .with_actions(true, true, false)
            .with_mft(MaskMode::NoError, 0.2)
            .with_prompt_length(2)
            .with_max_seq_length(32)
            .with_output_dir(output_dir);
        config.freeze_lm = true;
        config.max_train_steps = Some(8);
        config.save_steps = 2;
        config.train_batch_size = 2;
        config.eval_batch_size = 2;
        config.learning_rate = 1e-2;
        config.warmup_proportion = 0.0;
        config
    }

    fn train_set(tok: &CharTokenizer) -> TaskData {
        csc_data(
            "train_law",
            &[
                ("我今天很高心", "我今天很高兴"),
                ("他们在学校读书", "他们在学校读书"),
                ("我很高心", "我很高兴"),
                ("他们今天读书", "他们今天读书"),
            ],
            tok,
        )
    }

    #[test]
    fn test_freeze_lm_updates_prompt_rows_only() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        let tok = tokenizer();
        let config = freeze_lm_config(dir);
        let template = RephraseTemplate::new(&tok, 2, 32, true).unwrap();
        let model = tiny_model(tok.vocab_size(), &[]);
        let train = train_set(&tok);
        let eval = csc_data("test_law", &[("我今天很高心", "我今天很高兴"), ("他们在学校", "他们在学校")], &tok);

        let before = snapshot(&model);
        let trainer = Trainer::new(&config, &model, &tok, &template).unwrap();
        let summary = trainer.train(std::slice::from_ref(&train), Some(&eval)).unwrap();
        assert_eq!(summary.global_step, 8);
        assert!(summary.train_loss.is_finite());

        let prompt_rows: Vec<usize> = template.learned_prompt_ids().iter().map(|&id| id as usize).collect();
        assert_eq!(prompt_rows.len(), 4);
        let hidden = model.dims().hidden_size;
        for ((name, old), (_, new)) in before.iter().zip(snapshot(&model)) {
            if name != WORD_EMBEDDINGS {
                assert_eq!(old, &new, "{name} changed under --freeze_lm");
                continue;
            }
            for row in 0..model.dims().vocab_size {
                let span = row * hidden..(row + 1) * hidden;
                let changed = old[span.clone()] != new[span];
                assert_eq!(changed, prompt_rows.contains(&row), "embedding row {row}");
            }
        }

        // four saves, the best three kept with their optimizer state
        let mut checkpoints = Vec::new();
        let mut optimizer_files = 0;
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            if parse_checkpoint_name(&name).is_some() {
                assert!(optimizer_path(&path).is_file(), "no optimizer state for {name}");
                checkpoints.push(path);
            } else if name.ends_with(".optimizer.safetensors") {
                optimizer_files += 1;
            }
        }
        assert_eq!(checkpoints.len(), KEEP_BEST);
        assert_eq!(optimizer_files, KEEP_BEST);
        let best = summary.best_checkpoint.unwrap();
        assert!(checkpoints.contains(&best));

        for file in ["sents.tp", "sents.fp", "sents.fn", "sents.wp", TRAINER_STATE_FILE] {
            assert!(dir.join(file).is_file(), "missing {file}");
        }
        let results = std::fs::read_to_string(dir.join(EVAL_RESULTS_FILE)).unwrap();
        let steps: Vec<&str> = results.lines().map(|l| l.split(" |").next().unwrap()).collect();
        assert_eq!(
            steps,
            vec!["Global step = 2", "Global step = 4", "Global step = 6", "Global step = 8"]
        );
        let state = TrainerState::load(dir).unwrap();
        assert_eq!(state.global_step, 8);
        assert!(state.eval_f1.is_some());
    }

    #[test]
    fn test_resumed_run_restores_optimizer_step() {
        let first = TempDir::new().unwrap();
        let tok = tokenizer();
        let template = RephraseTemplate::new(&tok, 2, 32, true).unwrap();
        let model = tiny_model(tok.vocab_size(), &[]);
        let train = train_set(&tok);

        let mut config = freeze_lm_config(first.path());
        config.do_eval = false;
        config.eval_on = None;
        config.max_train_steps = Some(3);
        config.save_steps = 3;
        let summary = Trainer::new(&config, &model, &tok, &template)
            .unwrap()
            .train(std::slice::from_ref(&train), None)
            .unwrap();
        let checkpoint = summary.best_checkpoint.unwrap();
        assert_eq!(checkpoint.file_name().unwrap(), "step-3.safetensors");

        let second = TempDir::new().unwrap();
        let mut resumed = freeze_lm_config(second.path());
        resumed.do_eval = false;
        resumed.eval_on = None;
        resumed.max_train_steps = Some(1);
        resumed.load_state_dict = Some(checkpoint);
        Trainer::new(&resumed, &model, &tok, &template)
            .unwrap()
            .train(std::slice::from_ref(&train), None)
            .unwrap();

        let saved = candle_core::safetensors::load(
            second.path().join("step-1.optimizer.safetensors"),
            &candle_core::Device::Cpu,
        )
        .unwrap();
        assert_eq!(saved["step"].to_vec1::<u32>().unwrap(), vec![4]);
        assert!(saved.contains_key(&format!("{WORD_EMBEDDINGS}.exp_avg")));
    }

    #[test]
    fn test_freeze_mode_from_config() {
        let mut config = RunConfig::new().with_tasks(vec![TaskName::Ecspell], ["law"]);
        assert_eq!(freeze_mode(&config), FreezeMode::Full);
        config.freeze_lm = true;
        assert_eq!(freeze_mode(&config), FreezeMode::PromptOnly);
        config.freeze_lm = false;
        config.linear_prob = true;
        assert_eq!(freeze_mode(&config), FreezeMode::HeadsOnly);
    }

    #[test]
    fn test_accumulator_sums_gradients() {
        let device = candle_core::Device::Cpu;
        let w = Var::new(&[1f32, 2.0], &device).unwrap();
        let groups = ParamGroups {
            decay: vec![("w".to_string(), w.clone())],
            no_decay: Vec::new(),
            prompt_rows: None,
        };
        let mut acc = GradAccumulator::default();
        for scale in [1.0, 3.0] {
            let loss = (w.as_tensor() * scale).unwrap().sum_all().unwrap();
            acc.add(loss.backward().unwrap(), &groups).unwrap();
        }
        assert_eq!(acc.micro_steps, 2);
        let grads = acc.take().unwrap();
        let g = grads.get(w.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(g, vec![4.0, 4.0]);
        assert_eq!(acc.micro_steps, 0);
        assert!(acc.take().is_none());
    }
}
