use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use oorandom::Rand32;
use relm_core::{
    CharTokenizer, Encoded, MaskMode, MaskingPolicy, RephraseTemplate, Split, TaskKind, TaskName,
    load_examples,
};
use relm_trainer::TaskData;
use relm_trainer::preview::MaskPreview;
use tracing::info;

/// Print masked training instances of a correction dataset as JSON lines.
#[derive(Parser, Debug)]
#[command(name = "relm-preview-masks", version)]
struct Args {
    #[arg(long = "task_name", default_value = "ecspell")]
    task_name: String,
    #[arg(long = "train_on")]
    train_on: String,
    #[arg(long = "data_dir", default_value = "data")]
    data_dir: PathBuf,
    /// Model directory holding the vocabulary.
    #[arg(long = "load_model_path", default_value = "bert-base-chinese")]
    load_model_path: PathBuf,
    #[arg(long = "mask_mode", default_value = "noerror")]
    mask_mode: String,
    #[arg(long = "mask_rate", default_value_t = 0.2)]
    mask_rate: f32,
    #[arg(long = "prompt_length", default_value_t = 10)]
    prompt_length: usize,
    #[arg(long = "max_seq_length", default_value_t = 128)]
    max_seq_length: usize,
    #[arg(long = "not_apply_prompt")]
    not_apply_prompt: bool,
    #[arg(long = "do_lower_case")]
    do_lower_case: bool,
    #[arg(long = "seed", default_value_t = 42)]
    seed: u64,
    /// Number of examples to print.
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let task: TaskName = args.task_name.parse()?;
    if task.kind() != TaskKind::Csc {
        bail!("{task} is not a correction task");
    }
    let mode: MaskMode = args.mask_mode.parse()?;
    let policy = MaskingPolicy::minimum_force(mode, args.mask_rate)?;

    let tokenizer =
        CharTokenizer::from_model_dir(&args.load_model_path)?.with_lowercase(args.do_lower_case);
    let template = RephraseTemplate::new(
        &tokenizer,
        args.prompt_length,
        args.max_seq_length,
        !args.not_apply_prompt,
    )?;
    let loaded = load_examples(&args.data_dir, task, Split::Train, &args.train_on)?;
    let data = TaskData::encode(loaded, &args.train_on, &tokenizer, None)?;

    let mut rng = Rand32::new(args.seed);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut printed = 0;
    for (i, encoded) in data.encoded.iter().enumerate().take(args.limit) {
        let (Encoded::Csc(csc), Some(example)) = (encoded, data.csc_example(i)) else {
            continue;
        };
        let feature = template.csc_feature(csc, Some(&policy), &mut rng)?;
        let preview = MaskPreview::new(&tokenizer, &template, example, &feature);
        writeln!(out, "{}", serde_json::to_string(&preview)?)?;
        printed += 1;
    }
    info!(printed, total = data.len(), "done");
    Ok(())
}
