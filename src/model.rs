use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const METRIC_WER: &str = "wer";
pub const METRIC_WER_SENTENCE_PROXY: &str = "wer_sentence_proxy";
pub const METRIC_LATENCY_P50_MS: &str = "latency_p50_ms";
pub const METRIC_LATENCY_P95_MS: &str = "latency_p95_ms";
pub const METRIC_RTF_MEAN: &str = "rtf_mean";
pub const METRIC_RTF_P95: &str = "rtf_p95";

/// run.json in the worker's raw output directory: which benchmark,
/// provider and model produced the batch.
#[derive(Debug, Clone, Deserialize)]
pub struct RunDescriptor {
    pub benchmark_id: String,
    pub provider: String,
    #[serde(default)]
    pub provider_sdk: String,
    #[serde(default)]
    pub provider_sdk_version: String,
    pub model: String,
    #[serde(default)]
    pub model_revision: String,
    pub eval_version: String,
    #[serde(default)]
    pub notes: String,
}

/// One line of utterances.jsonl. Variant metadata is an open string-keyed
/// map (snr_db, subset, ...); the `subset` key, when present, feeds the
/// dashboard label token.
#[derive(Debug, Clone, Deserialize)]
pub struct UtteranceRecord {
    pub external_id: String,
    pub ref_text: String,
    pub duration_s: Option<f64>,
    #[serde(default)]
    pub audio_path: String,
    pub dataset: String,
    #[serde(default)]
    pub split: String,
    #[serde(default)]
    pub variant: BTreeMap<String, serde_json::Value>,
}

/// One line of predictions.jsonl, keyed by the utterance external id.
#[derive(Debug, Clone, Deserialize)]
pub struct PredictionRecord {
    pub external_id: String,
    pub hyp_text: String,
    #[serde(default)]
    pub words: serde_json::Value,
    #[serde(default)]
    pub usage: serde_json::Value,
}

/// One line of latency.jsonl, keyed by the utterance external id.
#[derive(Debug, Clone, Deserialize)]
pub struct LatencyRecord {
    pub external_id: String,
    pub api_time_ms: f64,
    pub total_time_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceFileEntry {
    pub filename: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestPaths {
    pub cache_root: String,
    pub manifest_dir: String,
    pub raw_dir: String,
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestCounts {
    pub utterances_loaded: usize,
    pub predictions_loaded: usize,
    pub latency_samples_loaded: usize,
    pub datasets_seen: usize,
    pub variants_seen: usize,
    pub invalid_records: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub job_run_id: i64,
    pub benchmark_id: String,
    pub provider: String,
    pub model: String,
    pub eval_version: String,
    pub paths: IngestPaths,
    pub counts: IngestCounts,
    pub source_hashes: Vec<SourceFileEntry>,
    pub warnings: Vec<String>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EvalPolicyManifest {
    pub iterations: usize,
    pub confidence: f64,
    pub seed: u64,
    pub small_sample_threshold: usize,
    pub skip_bootstrap: bool,
    pub remove_numbers: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketReport {
    pub dataset_id: i64,
    pub dataset_name: String,
    pub variant_id: i64,
    pub split: String,
    pub n_utterances: usize,
    pub excluded_utterances: usize,
    pub rtf_excluded_utterances: usize,
    pub empty_denominator: bool,
    pub wer: f64,
    pub metrics_written: usize,
    pub bootstrap_rows_written: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluateRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub job_run_id: i64,
    pub policy: EvalPolicyManifest,
    pub buckets: Vec<BucketReport>,
    pub warnings: Vec<String>,
    pub notes: Vec<String>,
}

/// One dashboard leaderboard row. Field names and order are a wire
/// contract with the chart components; CI fields are null when the
/// corresponding interval was not computed.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRow {
    pub benchmark_id: String,
    pub job_run_id: i64,
    pub provider: String,
    pub model: String,
    pub eval_version: String,
    pub label: String,
    pub dataset_id: i64,
    pub dataset_name: String,
    pub variant_id: i64,
    pub n_utterances: i64,
    pub wer: Option<f64>,
    pub wer_ci_low: Option<f64>,
    pub wer_ci_high: Option<f64>,
    pub latency_p50_ms: Option<f64>,
    pub latency_p50_ms_ci_low: Option<f64>,
    pub latency_p50_ms_ci_high: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    pub latency_p95_ms_ci_low: Option<f64>,
    pub latency_p95_ms_ci_high: Option<f64>,
    pub rtf_mean: Option<f64>,
    pub rtf_mean_ci_low: Option<f64>,
    pub rtf_mean_ci_high: Option<f64>,
    pub rtf_p95: Option<f64>,
    pub rtf_p95_ci_low: Option<f64>,
    pub rtf_p95_ci_high: Option<f64>,
}

/// The two bucket shapes consumed by the dashboard. The enum is the shape
/// tag; serialization is untagged so the wire JSON matches the observed
/// contract exactly.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ProviderExport {
    Legacy {
        provider: String,
        results: Vec<SummaryRow>,
    },
    Current {
        provider: String,
        datasets: BTreeMap<String, Vec<SummaryRow>>,
    },
}
