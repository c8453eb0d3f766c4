use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::cli::IngestArgs;
use crate::error::EvalError;
use crate::model::{
    IngestCounts, IngestPaths, IngestRunManifest, LatencyRecord, PredictionRecord, RunDescriptor,
    SourceFileEntry, UtteranceRecord,
};
use crate::store;
use crate::util::{
    ensure_directory, now_utc_string, sha256_file, utc_compact_string, write_json_pretty,
};

pub fn run(args: IngestArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("ingest-{}", utc_compact_string(started_ts));

    let cache_root = args.cache_root.clone();
    let manifest_dir = cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let ingest_manifest_path = args.ingest_manifest_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!("ingest_run_{}.json", utc_compact_string(started_ts)))
    });
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| cache_root.join("asrbench.sqlite"));

    info!(raw_dir = %args.raw_dir.display(), run_id = %run_id, "starting ingest");

    let descriptor = load_run_descriptor(&args.raw_dir.join("run.json"))?;
    let utterances: Vec<UtteranceRecord> = read_jsonl(&args.raw_dir.join("utterances.jsonl"))?;
    let predictions: Vec<PredictionRecord> = read_jsonl(&args.raw_dir.join("predictions.jsonl"))?;
    let latency: Vec<LatencyRecord> = read_jsonl(&args.raw_dir.join("latency.jsonl"))?;

    if utterances.is_empty() {
        bail!(
            "no utterance records in {}",
            args.raw_dir.join("utterances.jsonl").display()
        );
    }

    let mut connection = store::open(&db_path)?;
    let batch = load_batch(
        &mut connection,
        &descriptor,
        &utterances,
        &predictions,
        &latency,
    )?;

    let source_hashes = collect_source_hashes(
        &args.raw_dir,
        &[
            ("run.json", 1),
            ("utterances.jsonl", utterances.len()),
            ("predictions.jsonl", predictions.len()),
            ("latency.jsonl", latency.len()),
        ],
    )?;

    let updated_at = now_utc_string();
    let manifest = IngestRunManifest {
        manifest_version: 1,
        run_id,
        db_schema_version: store::DB_SCHEMA_VERSION.to_string(),
        status: "completed".to_string(),
        started_at,
        updated_at,
        command: render_ingest_command(&args),
        job_run_id: batch.job_run_id,
        benchmark_id: descriptor.benchmark_id.clone(),
        provider: descriptor.provider.clone(),
        model: descriptor.model.clone(),
        eval_version: descriptor.eval_version.clone(),
        paths: IngestPaths {
            cache_root: cache_root.display().to_string(),
            manifest_dir: manifest_dir.display().to_string(),
            raw_dir: args.raw_dir.display().to_string(),
            db_path: db_path.display().to_string(),
        },
        counts: batch.counts,
        source_hashes,
        warnings: batch.warnings,
        notes: vec![
            "Raw worker output loaded into the local sqlite metric store.".to_string(),
            "Re-running ingest for the same raw directory creates a new job run.".to_string(),
        ],
    };

    write_json_pretty(&ingest_manifest_path, &manifest)?;

    info!(path = %ingest_manifest_path.display(), "wrote ingest run manifest");
    info!(
        job_run_id = batch.job_run_id,
        utterances = manifest.counts.utterances_loaded,
        predictions = manifest.counts.predictions_loaded,
        latency_samples = manifest.counts.latency_samples_loaded,
        invalid_records = manifest.counts.invalid_records,
        "ingest completed"
    );

    Ok(())
}

struct LoadedBatch {
    job_run_id: i64,
    counts: IngestCounts,
    warnings: Vec<String>,
}

/// Loads one worker batch inside a single transaction: either the whole
/// job run's raw rows land in the store or none of them do.
fn load_batch(
    connection: &mut Connection,
    descriptor: &RunDescriptor,
    utterances: &[UtteranceRecord],
    predictions: &[PredictionRecord],
    latency: &[LatencyRecord],
) -> Result<LoadedBatch> {
    let tx = connection.transaction()?;

    let provider_id = store::upsert_provider(
        &tx,
        &descriptor.provider,
        &descriptor.provider_sdk,
        &descriptor.provider_sdk_version,
    )?;
    let model_id =
        store::upsert_model(&tx, provider_id, &descriptor.model, &descriptor.model_revision)?;
    store::upsert_benchmark(&tx, &descriptor.benchmark_id, &descriptor.notes)?;
    let job_run_id = store::create_job_run(
        &tx,
        &descriptor.benchmark_id,
        provider_id,
        model_id,
        &descriptor.eval_version,
    )?;

    let mut warnings = Vec::new();
    let mut invalid_records = 0_usize;
    let mut datasets: HashMap<String, i64> = HashMap::new();
    let mut variants: HashMap<(i64, String, String), i64> = HashMap::new();
    let mut utterance_keys: HashMap<&str, (i64, Option<f64>)> = HashMap::new();
    let mut utterances_loaded = 0_usize;

    for record in utterances {
        if let Err(err) = validate_utterance(record) {
            warn!(external_id = %record.external_id, error = %err, "skipping utterance record");
            warnings.push(format!("utterance {}: {err}", record.external_id));
            invalid_records += 1;
            continue;
        }

        let dataset_id = match datasets.get(record.dataset.as_str()) {
            Some(id) => *id,
            None => {
                let id = store::upsert_dataset(&tx, &record.dataset)?;
                datasets.insert(record.dataset.clone(), id);
                id
            }
        };

        let variant_json = serde_json::to_string(&record.variant)
            .with_context(|| format!("failed to encode variant for {}", record.external_id))?;
        let variant_key = (dataset_id, record.split.clone(), variant_json.clone());
        let variant_id = match variants.get(&variant_key) {
            Some(id) => *id,
            None => {
                let id = store::upsert_variant(&tx, dataset_id, &record.split, &variant_json)?;
                variants.insert(variant_key, id);
                id
            }
        };

        let utt_pk = store::upsert_utterance(
            &tx,
            dataset_id,
            variant_id,
            &record.external_id,
            &record.audio_path,
            &record.ref_text,
            record.duration_s,
        )?;

        if utterance_keys
            .insert(record.external_id.as_str(), (utt_pk, record.duration_s))
            .is_some()
        {
            bail!(
                "duplicate external_id {} in batch; external ids must be unique per raw directory",
                record.external_id
            );
        }
        utterances_loaded += 1;
    }

    let mut predictions_loaded = 0_usize;
    for record in predictions {
        if let Err(err) = validate_prediction(record) {
            warn!(external_id = %record.external_id, error = %err, "skipping prediction record");
            warnings.push(format!("prediction {}: {err}", record.external_id));
            invalid_records += 1;
            continue;
        }
        let Some((utt_pk, _)) = utterance_keys.get(record.external_id.as_str()) else {
            warn!(external_id = %record.external_id, "prediction references unknown utterance");
            warnings.push(format!(
                "prediction {}: unknown utterance",
                record.external_id
            ));
            invalid_records += 1;
            continue;
        };

        store::upsert_prediction(
            &tx,
            job_run_id,
            *utt_pk,
            &record.hyp_text,
            &record.words.to_string(),
            &record.usage.to_string(),
        )?;
        predictions_loaded += 1;
    }

    let mut latency_samples_loaded = 0_usize;
    for record in latency {
        if let Err(err) = validate_latency(record) {
            warn!(external_id = %record.external_id, error = %err, "skipping latency record");
            warnings.push(format!("latency {}: {err}", record.external_id));
            invalid_records += 1;
            continue;
        }
        let Some((utt_pk, duration_s)) = utterance_keys.get(record.external_id.as_str()) else {
            warn!(external_id = %record.external_id, "latency sample references unknown utterance");
            warnings.push(format!("latency {}: unknown utterance", record.external_id));
            invalid_records += 1;
            continue;
        };

        let rtf = duration_s
            .filter(|duration| *duration > 0.0)
            .map(|duration| (record.total_time_ms / 1000.0) / duration);
        store::upsert_latency_sample(
            &tx,
            job_run_id,
            *utt_pk,
            record.api_time_ms,
            record.total_time_ms,
            rtf,
        )?;
        latency_samples_loaded += 1;
    }

    let datasets_seen = datasets.len();
    let variants_seen = variants.len();
    tx.commit().context("failed to commit ingest batch")?;

    Ok(LoadedBatch {
        job_run_id,
        counts: IngestCounts {
            utterances_loaded,
            predictions_loaded,
            latency_samples_loaded,
            datasets_seen,
            variants_seen,
            invalid_records,
        },
        warnings,
    })
}

fn load_run_descriptor(path: &Path) -> Result<RunDescriptor> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let descriptor: RunDescriptor =
        serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))?;

    if descriptor.benchmark_id.trim().is_empty()
        || descriptor.provider.trim().is_empty()
        || descriptor.model.trim().is_empty()
        || descriptor.eval_version.trim().is_empty()
    {
        bail!(
            "run descriptor {} must set benchmark_id, provider, model and eval_version",
            path.display()
        );
    }

    Ok(descriptor)
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: T = serde_json::from_str(&line)
            .with_context(|| format!("failed to parse {} line {}", path.display(), index + 1))?;
        records.push(record);
    }

    Ok(records)
}

fn validate_utterance(record: &UtteranceRecord) -> Result<(), EvalError> {
    if record.external_id.trim().is_empty() {
        return Err(EvalError::InvalidInput("missing external_id".to_string()));
    }
    if record.dataset.trim().is_empty() {
        return Err(EvalError::InvalidInput("missing dataset name".to_string()));
    }
    if let Some(duration) = record.duration_s
        && !duration.is_finite()
    {
        return Err(EvalError::InvalidInput(format!(
            "non-finite duration_s: {duration}"
        )));
    }
    Ok(())
}

fn validate_prediction(record: &PredictionRecord) -> Result<(), EvalError> {
    if record.external_id.trim().is_empty() {
        return Err(EvalError::InvalidInput("missing external_id".to_string()));
    }
    Ok(())
}

fn validate_latency(record: &LatencyRecord) -> Result<(), EvalError> {
    if record.external_id.trim().is_empty() {
        return Err(EvalError::InvalidInput("missing external_id".to_string()));
    }
    if !record.api_time_ms.is_finite() || record.api_time_ms < 0.0 {
        return Err(EvalError::InvalidInput(format!(
            "invalid api_time_ms: {}",
            record.api_time_ms
        )));
    }
    if !record.total_time_ms.is_finite() || record.total_time_ms < 0.0 {
        return Err(EvalError::InvalidInput(format!(
            "invalid total_time_ms: {}",
            record.total_time_ms
        )));
    }
    Ok(())
}

fn collect_source_hashes(raw_dir: &Path, files: &[(&str, usize)]) -> Result<Vec<SourceFileEntry>> {
    let mut entries = Vec::with_capacity(files.len());
    for (filename, records) in files {
        let path = raw_dir.join(filename);
        entries.push(SourceFileEntry {
            filename: (*filename).to_string(),
            sha256: sha256_file(&path)?,
            records: *records,
        });
    }
    Ok(entries)
}

fn render_ingest_command(args: &IngestArgs) -> String {
    let mut parts = vec![
        "asrbench ingest".to_string(),
        format!("--cache-root {}", args.cache_root.display()),
        format!("--raw-dir {}", args.raw_dir.display()),
    ];
    if let Some(db_path) = &args.db_path {
        parts.push(format!("--db-path {}", db_path.display()));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_lines(dir: &Path, name: &str, lines: &[&str]) {
        let mut file = fs::File::create(dir.join(name)).expect("create file");
        for line in lines {
            writeln!(file, "{line}").expect("write line");
        }
    }

    #[test]
    fn read_jsonl_skips_blank_lines_and_reports_bad_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_lines(
            dir.path(),
            "utterances.jsonl",
            &[
                r#"{"external_id":"u1","ref_text":"hello","duration_s":1.5,"dataset":"librispeech"}"#,
                "",
                r#"{"external_id":"u2","ref_text":"world","duration_s":null,"dataset":"librispeech","split":"dev-clean","variant":{"subset":"clean"}}"#,
            ],
        );

        let records: Vec<UtteranceRecord> =
            read_jsonl(&dir.path().join("utterances.jsonl")).expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].external_id, "u1");
        assert_eq!(records[1].split, "dev-clean");
        assert_eq!(records[1].duration_s, None);

        write_lines(dir.path(), "broken.jsonl", &["{not json"]);
        let err = read_jsonl::<UtteranceRecord>(&dir.path().join("broken.jsonl")).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn latency_validation_rejects_non_finite_and_negative_times() {
        let record = LatencyRecord {
            external_id: "u1".to_string(),
            api_time_ms: f64::NAN,
            total_time_ms: 100.0,
        };
        assert!(matches!(
            validate_latency(&record),
            Err(EvalError::InvalidInput(_))
        ));

        let record = LatencyRecord {
            external_id: "u1".to_string(),
            api_time_ms: 10.0,
            total_time_ms: -5.0,
        };
        assert!(matches!(
            validate_latency(&record),
            Err(EvalError::InvalidInput(_))
        ));
    }

    #[test]
    fn load_batch_wires_predictions_and_latency_to_utterances() {
        let mut connection = Connection::open_in_memory().expect("open");
        store::ensure_schema(&connection).expect("schema");

        let descriptor = RunDescriptor {
            benchmark_id: "bench-1".to_string(),
            provider: "acme".to_string(),
            provider_sdk: String::new(),
            provider_sdk_version: String::new(),
            model: "acme-asr".to_string(),
            model_revision: String::new(),
            eval_version: "v1".to_string(),
            notes: String::new(),
        };
        let utterances = vec![UtteranceRecord {
            external_id: "u1".to_string(),
            ref_text: "the quick brown fox".to_string(),
            duration_s: Some(1.0),
            audio_path: String::new(),
            dataset: "librispeech".to_string(),
            split: "dev-clean".to_string(),
            variant: Default::default(),
        }];
        let predictions = vec![
            PredictionRecord {
                external_id: "u1".to_string(),
                hyp_text: "the quick fox".to_string(),
                words: serde_json::Value::Null,
                usage: serde_json::Value::Null,
            },
            PredictionRecord {
                external_id: "missing".to_string(),
                hyp_text: "stray".to_string(),
                words: serde_json::Value::Null,
                usage: serde_json::Value::Null,
            },
        ];
        let latency = vec![LatencyRecord {
            external_id: "u1".to_string(),
            api_time_ms: 150.0,
            total_time_ms: 2000.0,
        }];

        let batch =
            load_batch(&mut connection, &descriptor, &utterances, &predictions, &latency)
                .expect("load");

        assert_eq!(batch.counts.utterances_loaded, 1);
        assert_eq!(batch.counts.predictions_loaded, 1);
        assert_eq!(batch.counts.latency_samples_loaded, 1);
        assert_eq!(batch.counts.invalid_records, 1);

        // RTF is derived at ingest: 2000ms over 1.0s of audio.
        let rtf: f64 = connection
            .query_row("SELECT rtf FROM latency_sample", [], |row| row.get(0))
            .expect("rtf");
        assert!((rtf - 2.0).abs() < 1e-9);

        let rows = store::load_eval_rows(&connection, batch.job_run_id).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].hyp_text, "the quick fox");
    }
}
