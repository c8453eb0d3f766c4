use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "asrbench",
    version,
    about = "Local ASR benchmark evaluation and metric store tooling"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Ingest(IngestArgs),
    Evaluate(EvaluateArgs),
    Export(ExportArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    #[arg(long, default_value = ".cache/asrbench")]
    pub cache_root: PathBuf,

    /// Directory holding run.json, utterances.jsonl, predictions.jsonl and
    /// latency.jsonl as produced by the inference worker.
    #[arg(long)]
    pub raw_dir: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub ingest_manifest_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    #[arg(long, default_value = ".cache/asrbench")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub job_run_id: i64,

    #[arg(long, default_value_t = 1000)]
    pub iterations: usize,

    #[arg(long, default_value_t = 0.95)]
    pub confidence: f64,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Below this sample count, quantile CIs use the distribution-free
    /// order-statistic method instead of resampling.
    #[arg(long, default_value_t = 30)]
    pub small_sample_threshold: usize,

    #[arg(long, default_value_t = false)]
    pub skip_bootstrap: bool,

    #[arg(long, default_value_t = false)]
    pub remove_numbers: bool,

    #[arg(long)]
    pub evaluate_manifest_path: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ExportShape {
    Legacy,
    Current,
}

impl ExportShape {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Current => "current",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    #[arg(long, default_value = ".cache/asrbench")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub job_run_id: i64,

    #[arg(long, value_enum, default_value_t = ExportShape::Current)]
    pub shape: ExportShape,

    /// Write the export to this path instead of stdout.
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/asrbench")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,
}
