use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;
use tracing::{info, warn};

use crate::align::{self, AlignmentCounts};
use crate::bootstrap::{
    self, BootstrapConfig, CiBounds, METHOD_BOOTSTRAP_PERCENTILE, METHOD_ORDERSTAT_BINOMIAL,
};
use crate::cli::EvaluateArgs;
use crate::error::EvalError;
use crate::model::{
    BucketReport, EvalPolicyManifest, EvaluateRunManifest, METRIC_LATENCY_P50_MS,
    METRIC_LATENCY_P95_MS, METRIC_RTF_MEAN, METRIC_RTF_P95, METRIC_WER, METRIC_WER_SENTENCE_PROXY,
};
use crate::normalize::{NormalizeOptions, Normalizer};
use crate::stats;
use crate::store::{self, EvalRow};
use crate::util::{ensure_directory, now_utc_string, utc_compact_string, write_json_pretty};

/// Evaluation policy for one run: bootstrap parameters, the quantile-CI
/// method cutover, and the text normalization applied to both sides of
/// every comparison.
pub struct EvalPolicy {
    pub bootstrap: BootstrapConfig,
    pub small_sample_threshold: usize,
    pub skip_bootstrap: bool,
    pub normalize: NormalizeOptions,
}

impl EvalPolicy {
    fn manifest(&self) -> EvalPolicyManifest {
        EvalPolicyManifest {
            iterations: self.bootstrap.iterations,
            confidence: self.bootstrap.confidence,
            seed: self.bootstrap.seed,
            small_sample_threshold: self.small_sample_threshold,
            skip_bootstrap: self.skip_bootstrap,
            remove_numbers: self.normalize.remove_numbers,
        }
    }
}

pub fn run(args: EvaluateArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("eval-{}", utc_compact_string(started_ts));

    let cache_root = args.cache_root.clone();
    let manifest_dir = cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let evaluate_manifest_path = args.evaluate_manifest_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!(
            "evaluate_run_{}.json",
            utc_compact_string(started_ts)
        ))
    });
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| cache_root.join("asrbench.sqlite"));

    let policy = EvalPolicy {
        bootstrap: BootstrapConfig {
            iterations: args.iterations,
            confidence: args.confidence,
            seed: args.seed,
        },
        small_sample_threshold: args.small_sample_threshold,
        skip_bootstrap: args.skip_bootstrap,
        normalize: NormalizeOptions {
            remove_numbers: args.remove_numbers,
            ..NormalizeOptions::default()
        },
    };

    let mut connection = store::open(&db_path)?;
    let info = store::load_job_run_info(&connection, args.job_run_id)?;
    info!(
        job_run_id = info.job_run_id,
        provider = %info.provider,
        model = %info.model,
        eval_version = %info.eval_version,
        run_id = %run_id,
        "starting evaluation"
    );

    let outcome = evaluate_job_run(&mut connection, args.job_run_id, &policy)?;

    let updated_at = now_utc_string();
    let manifest = EvaluateRunManifest {
        manifest_version: 1,
        run_id,
        db_schema_version: store::DB_SCHEMA_VERSION.to_string(),
        status: "completed".to_string(),
        started_at,
        updated_at,
        command: render_evaluate_command(&args),
        job_run_id: args.job_run_id,
        policy: policy.manifest(),
        buckets: outcome.reports,
        warnings: outcome.warnings,
        notes: vec![
            "Metric and bootstrap rows replace prior rows for the same key.".to_string(),
        ],
    };

    write_json_pretty(&evaluate_manifest_path, &manifest)?;

    info!(path = %evaluate_manifest_path.display(), "wrote evaluation run manifest");
    info!(
        job_run_id = args.job_run_id,
        buckets = manifest.buckets.len(),
        "evaluation completed"
    );

    Ok(())
}

pub(crate) struct EvaluationOutcome {
    pub reports: Vec<BucketReport>,
    pub warnings: Vec<String>,
}

/// Scores every (dataset, variant) bucket of the job run against a single
/// consistent snapshot of its predictions. Each bucket's metric set is
/// committed in one transaction; the first failing bucket marks the job
/// run failed and nothing from that bucket survives.
pub(crate) fn evaluate_job_run(
    connection: &mut Connection,
    job_run_id: i64,
    policy: &EvalPolicy,
) -> Result<EvaluationOutcome> {
    let normalizer = Normalizer::new(policy.normalize.clone())?;
    let rows = store::load_eval_rows(connection, job_run_id)?;
    if rows.is_empty() {
        store::mark_job_run(
            connection,
            job_run_id,
            store::JOB_STATUS_FAILED,
            "no predictions to evaluate",
        )?;
        anyhow::bail!("job run {job_run_id} has no predictions to evaluate");
    }

    let buckets = group_buckets(rows);
    let mut reports = Vec::with_capacity(buckets.len());
    let mut warnings = Vec::new();

    for bucket in &buckets {
        let computation = compute_bucket(bucket, &normalizer);
        collect_bucket_warnings(bucket, &computation, &mut warnings);

        match write_bucket(connection, job_run_id, bucket, &computation, policy) {
            Ok(report) => reports.push(report),
            Err(err) => {
                let bucket_key = format!("{}/{}", bucket.dataset_name, bucket.variant_id);
                store::mark_job_run(
                    connection,
                    job_run_id,
                    store::JOB_STATUS_FAILED,
                    &format!("bucket {bucket_key}: {err}"),
                )?;
                return Err(err).with_context(|| format!("failed to persist bucket {bucket_key}"));
            }
        }
    }

    store::mark_job_run(connection, job_run_id, store::JOB_STATUS_COMPLETED, "")?;
    Ok(EvaluationOutcome { reports, warnings })
}

struct Bucket {
    dataset_id: i64,
    dataset_name: String,
    variant_id: i64,
    split: String,
    rows: Vec<EvalRow>,
}

fn group_buckets(rows: Vec<EvalRow>) -> Vec<Bucket> {
    let mut buckets: BTreeMap<(i64, i64), Bucket> = BTreeMap::new();
    for row in rows {
        buckets
            .entry((row.dataset_id, row.variant_id))
            .or_insert_with(|| Bucket {
                dataset_id: row.dataset_id,
                dataset_name: row.dataset_name.clone(),
                variant_id: row.variant_id,
                split: row.split.clone(),
                rows: Vec::new(),
            })
            .rows
            .push(row);
    }
    buckets.into_values().collect()
}

struct BucketComputation {
    n_utterances: usize,
    excluded_utterances: usize,
    scores: Vec<AlignmentCounts>,
    sentence_errors: Vec<f64>,
    totals: AlignmentCounts,
    wer: f64,
    empty_denominator: bool,
    latency_ms: Vec<f64>,
    rtf: Vec<f64>,
    rtf_excluded_utterances: usize,
    latency_p50_ms: Option<f64>,
    latency_p95_ms: Option<f64>,
    rtf_mean: Option<f64>,
    rtf_p95: Option<f64>,
}

/// Pure per-bucket reduction. Utterances that fail validation are
/// excluded from every aggregate; utterances without a usable duration
/// stay in the WER and latency aggregates but drop out of RTF.
fn compute_bucket(bucket: &Bucket, normalizer: &Normalizer) -> BucketComputation {
    let mut scores = Vec::with_capacity(bucket.rows.len());
    let mut sentence_errors = Vec::with_capacity(bucket.rows.len());
    let mut totals = AlignmentCounts::default();
    let mut latency_ms = Vec::new();
    let mut rtf = Vec::new();
    let mut excluded_utterances = 0_usize;
    let mut rtf_excluded_utterances = 0_usize;

    for row in &bucket.rows {
        if let Err(err) = validate_row(row) {
            warn!(
                external_id = %row.external_id,
                dataset = %bucket.dataset_name,
                error = %err,
                "excluding utterance from bucket aggregate"
            );
            excluded_utterances += 1;
            continue;
        }

        let reference = normalizer.normalize(&row.ref_text);
        let hypothesis = normalizer.normalize(&row.hyp_text);
        let ref_words: Vec<&str> = reference.split_whitespace().collect();
        let hyp_words: Vec<&str> = hypothesis.split_whitespace().collect();

        let counts = align::score_words(&ref_words, &hyp_words);
        totals.accumulate(&counts);
        scores.push(counts);
        sentence_errors.push(if reference == hypothesis { 0.0 } else { 1.0 });

        if let Some(total_time_ms) = row.total_time_ms {
            latency_ms.push(total_time_ms);

            match row.duration_s {
                Some(duration) if duration > 0.0 => {
                    rtf.push((total_time_ms / 1000.0) / duration);
                }
                _ => {
                    warn!(
                        external_id = %row.external_id,
                        dataset = %bucket.dataset_name,
                        "missing or zero audio duration; utterance excluded from RTF"
                    );
                    rtf_excluded_utterances += 1;
                }
            }
        }
    }

    // Corpus WER over zero reference words is defined as 0 and flagged;
    // NaN must never reach the store.
    let empty_denominator = totals.ref_len == 0;
    let wer = if empty_denominator {
        0.0
    } else {
        totals.errors() as f64 / totals.ref_len as f64
    };

    BucketComputation {
        n_utterances: scores.len(),
        excluded_utterances,
        latency_p50_ms: stats::quantile(&latency_ms, 0.5),
        latency_p95_ms: stats::quantile(&latency_ms, 0.95),
        rtf_mean: stats::mean(&rtf),
        rtf_p95: stats::quantile(&rtf, 0.95),
        scores,
        sentence_errors,
        totals,
        wer,
        empty_denominator,
        latency_ms,
        rtf,
        rtf_excluded_utterances,
    }
}

fn validate_row(row: &EvalRow) -> Result<(), EvalError> {
    if let Some(total_time_ms) = row.total_time_ms
        && (!total_time_ms.is_finite() || total_time_ms < 0.0)
    {
        return Err(EvalError::InvalidInput(format!(
            "invalid total_time_ms: {total_time_ms}"
        )));
    }
    if let Some(duration) = row.duration_s
        && !duration.is_finite()
    {
        return Err(EvalError::InvalidInput(format!(
            "non-finite duration_s: {duration}"
        )));
    }
    Ok(())
}

fn corpus_wer(scores: &[AlignmentCounts]) -> f64 {
    let mut totals = AlignmentCounts::default();
    for counts in scores {
        totals.accumulate(counts);
    }
    if totals.ref_len == 0 {
        0.0
    } else {
        totals.errors() as f64 / totals.ref_len as f64
    }
}

struct CiRow {
    metric: &'static str,
    bounds: CiBounds,
    iterations: usize,
    method: &'static str,
    seed: Option<u64>,
}

/// Confidence intervals for every point estimate the bucket produced.
/// Resampling always happens at utterance/sample granularity. Quantile
/// metrics switch to the order-statistic interval below the small-sample
/// threshold; which method produced a row is recorded with it.
fn bucket_ci_rows(computation: &BucketComputation, policy: &EvalPolicy) -> Result<Vec<CiRow>> {
    let config = &policy.bootstrap;
    let mut rows = Vec::new();

    if !computation.scores.is_empty() {
        let bounds = bootstrap::bootstrap_ci(&computation.scores, corpus_wer, config)?;
        rows.push(CiRow {
            metric: METRIC_WER,
            bounds,
            iterations: config.iterations,
            method: METHOD_BOOTSTRAP_PERCENTILE,
            seed: Some(config.seed),
        });
    }

    // Sentence-level proxy kept for continuity with older reports.
    if computation.sentence_errors.len() >= 5 {
        let bounds = bootstrap::bootstrap_mean_ci(&computation.sentence_errors, config)?;
        rows.push(CiRow {
            metric: METRIC_WER_SENTENCE_PROXY,
            bounds,
            iterations: config.iterations,
            method: METHOD_BOOTSTRAP_PERCENTILE,
            seed: Some(config.seed),
        });
    }

    for (metric, q) in [(METRIC_LATENCY_P50_MS, 0.5), (METRIC_LATENCY_P95_MS, 0.95)] {
        if let Some(row) = quantile_ci_row(&computation.latency_ms, metric, q, policy)? {
            rows.push(row);
        }
    }

    if !computation.rtf.is_empty() {
        let bounds = bootstrap::bootstrap_mean_ci(&computation.rtf, config)?;
        rows.push(CiRow {
            metric: METRIC_RTF_MEAN,
            bounds,
            iterations: config.iterations,
            method: METHOD_BOOTSTRAP_PERCENTILE,
            seed: Some(config.seed),
        });
    }
    if let Some(row) = quantile_ci_row(&computation.rtf, METRIC_RTF_P95, 0.95, policy)? {
        rows.push(row);
    }

    Ok(rows)
}

fn quantile_ci_row(
    values: &[f64],
    metric: &'static str,
    q: f64,
    policy: &EvalPolicy,
) -> Result<Option<CiRow>> {
    if values.is_empty() {
        return Ok(None);
    }

    if values.len() < policy.small_sample_threshold {
        let mut sorted = values.to_vec();
        sorted.sort_unstable_by(|left, right| left.total_cmp(right));
        let Some((ci_low, ci_high)) =
            stats::order_statistic_ci(&sorted, q, policy.bootstrap.confidence)
        else {
            return Ok(None);
        };
        return Ok(Some(CiRow {
            metric,
            bounds: CiBounds { ci_low, ci_high },
            iterations: 0,
            method: METHOD_ORDERSTAT_BINOMIAL,
            seed: None,
        }));
    }

    let bounds = bootstrap::bootstrap_quantile_ci(values, q, &policy.bootstrap)?;
    Ok(Some(CiRow {
        metric,
        bounds,
        iterations: policy.bootstrap.iterations,
        method: METHOD_BOOTSTRAP_PERCENTILE,
        seed: Some(policy.bootstrap.seed),
    }))
}

/// Persists one bucket's full metric set atomically.
fn write_bucket(
    connection: &mut Connection,
    job_run_id: i64,
    bucket: &Bucket,
    computation: &BucketComputation,
    policy: &EvalPolicy,
) -> Result<BucketReport> {
    let tx = connection.transaction()?;
    let mut metrics_written = 0_usize;

    let wer_extra = json!({
        "n_utterances": computation.n_utterances,
        "excluded_utterances": computation.excluded_utterances,
        "empty_denominator": computation.empty_denominator,
        "total_substitutions": computation.totals.substitutions,
        "total_deletions": computation.totals.deletions,
        "total_insertions": computation.totals.insertions,
        "total_ref_words": computation.totals.ref_len,
    });
    store::write_summary(
        &tx,
        job_run_id,
        bucket.dataset_id,
        bucket.variant_id,
        METRIC_WER,
        computation.wer,
        &wer_extra.to_string(),
    )?;
    metrics_written += 1;

    let sample_extra = json!({"n_samples": computation.latency_ms.len()}).to_string();
    for (metric, value) in [
        (METRIC_LATENCY_P50_MS, computation.latency_p50_ms),
        (METRIC_LATENCY_P95_MS, computation.latency_p95_ms),
    ] {
        if let Some(value) = value {
            store::write_summary(
                &tx,
                job_run_id,
                bucket.dataset_id,
                bucket.variant_id,
                metric,
                value,
                &sample_extra,
            )?;
            metrics_written += 1;
        }
    }

    let rtf_extra = json!({
        "n_samples": computation.rtf.len(),
        "rtf_excluded_utterances": computation.rtf_excluded_utterances,
    })
    .to_string();
    for (metric, value) in [
        (METRIC_RTF_MEAN, computation.rtf_mean),
        (METRIC_RTF_P95, computation.rtf_p95),
    ] {
        if let Some(value) = value {
            store::write_summary(
                &tx,
                job_run_id,
                bucket.dataset_id,
                bucket.variant_id,
                metric,
                value,
                &rtf_extra,
            )?;
            metrics_written += 1;
        }
    }

    let mut bootstrap_rows_written = 0_usize;
    if !policy.skip_bootstrap {
        let ci_extra = json!({"confidence": policy.bootstrap.confidence}).to_string();
        for row in bucket_ci_rows(computation, policy)? {
            store::write_bootstrap(
                &tx,
                job_run_id,
                bucket.dataset_id,
                bucket.variant_id,
                row.metric,
                row.bounds.ci_low,
                row.bounds.ci_high,
                row.iterations,
                row.method,
                row.seed,
                &ci_extra,
            )?;
            bootstrap_rows_written += 1;
        }
    }

    tx.commit().context("failed to commit bucket metrics")?;

    Ok(BucketReport {
        dataset_id: bucket.dataset_id,
        dataset_name: bucket.dataset_name.clone(),
        variant_id: bucket.variant_id,
        split: bucket.split.clone(),
        n_utterances: computation.n_utterances,
        excluded_utterances: computation.excluded_utterances,
        rtf_excluded_utterances: computation.rtf_excluded_utterances,
        empty_denominator: computation.empty_denominator,
        wer: computation.wer,
        metrics_written,
        bootstrap_rows_written,
    })
}

fn collect_bucket_warnings(
    bucket: &Bucket,
    computation: &BucketComputation,
    warnings: &mut Vec<String>,
) {
    let key = format!("{}/{}", bucket.dataset_name, bucket.variant_id);
    if computation.excluded_utterances > 0 {
        warnings.push(format!(
            "bucket {key}: {} utterances excluded as invalid",
            computation.excluded_utterances
        ));
    }
    if computation.rtf_excluded_utterances > 0 {
        warnings.push(format!(
            "bucket {key}: {} utterances lack usable durations and were excluded from RTF",
            computation.rtf_excluded_utterances
        ));
    }
    if computation.empty_denominator {
        warnings.push(format!(
            "bucket {key}: zero reference words; WER recorded as 0 with empty_denominator flag"
        ));
    }
}

fn render_evaluate_command(args: &EvaluateArgs) -> String {
    let mut parts = vec![
        "asrbench evaluate".to_string(),
        format!("--cache-root {}", args.cache_root.display()),
        format!("--job-run-id {}", args.job_run_id),
        format!("--iterations {}", args.iterations),
        format!("--confidence {}", args.confidence),
        format!("--seed {}", args.seed),
        format!("--small-sample-threshold {}", args.small_sample_threshold),
    ];
    if args.skip_bootstrap {
        parts.push("--skip-bootstrap".to_string());
    }
    if args.remove_numbers {
        parts.push("--remove-numbers".to_string());
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_policy() -> EvalPolicy {
        EvalPolicy {
            bootstrap: BootstrapConfig {
                iterations: 200,
                confidence: 0.95,
                seed: 42,
            },
            small_sample_threshold: 30,
            skip_bootstrap: false,
            normalize: NormalizeOptions::default(),
        }
    }

    fn seeded_store() -> (Connection, i64) {
        let connection = Connection::open_in_memory().expect("open");
        store::ensure_schema(&connection).expect("schema");

        let provider_id =
            store::upsert_provider(&connection, "acme", "acme-sdk", "1.0").expect("provider");
        let model_id = store::upsert_model(&connection, provider_id, "acme-asr", "").expect("model");
        store::upsert_benchmark(&connection, "bench-1", "").expect("benchmark");
        let job_run_id = store::create_job_run(&connection, "bench-1", provider_id, model_id, "v1")
            .expect("job run");

        let dataset_id = store::upsert_dataset(&connection, "librispeech").expect("dataset");
        let clean_id = store::upsert_variant(
            &connection,
            dataset_id,
            "dev-clean",
            r#"{"subset":"clean"}"#,
        )
        .expect("variant");

        let cases = [
            ("u1", "the quick brown fox", "the quick fox", 1.0, 2000.0),
            ("u2", "hello world", "hello world", 1.0, 500.0),
            ("u3", "a b c d", "a b c d", 2.0, 800.0),
            ("u4", "open the door", "open a door", 1.5, 900.0),
        ];
        for (external_id, ref_text, hyp_text, duration_s, total_time_ms) in cases {
            let utt_pk = store::upsert_utterance(
                &connection,
                dataset_id,
                clean_id,
                external_id,
                "",
                ref_text,
                Some(duration_s),
            )
            .expect("utterance");
            store::upsert_prediction(&connection, job_run_id, utt_pk, hyp_text, "null", "null")
                .expect("prediction");
            store::upsert_latency_sample(
                &connection,
                job_run_id,
                utt_pk,
                total_time_ms / 2.0,
                total_time_ms,
                None,
            )
            .expect("latency");
        }

        // Second bucket: empty reference only, no latency sample.
        let noisy_id = store::upsert_variant(
            &connection,
            dataset_id,
            "dev-noisy",
            r#"{"subset":"noisy"}"#,
        )
        .expect("variant");
        let utt_pk = store::upsert_utterance(
            &connection,
            dataset_id,
            noisy_id,
            "n1",
            "",
            "[noise]",
            Some(1.0),
        )
        .expect("utterance");
        store::upsert_prediction(&connection, job_run_id, utt_pk, "hello", "null", "null")
            .expect("prediction");

        (connection, job_run_id)
    }

    fn metric_value(connection: &Connection, job_run_id: i64, variant_id: i64, metric: &str) -> f64 {
        connection
            .query_row(
                "SELECT value FROM metric_summary
                 WHERE job_run_id = ?1 AND variant_id = ?2 AND metric = ?3",
                rusqlite::params![job_run_id, variant_id, metric],
                |row| row.get(0),
            )
            .expect("metric value")
    }

    #[test]
    fn evaluate_writes_full_metric_set_per_bucket() {
        let (mut connection, job_run_id) = seeded_store();
        let outcome =
            evaluate_job_run(&mut connection, job_run_id, &test_policy()).expect("evaluate");

        assert_eq!(outcome.reports.len(), 2);
        let clean = &outcome.reports[0];
        assert_eq!(clean.split, "dev-clean");
        assert_eq!(clean.n_utterances, 4);
        assert!(!clean.empty_denominator);

        // 2 errors (1 deletion + 1 substitution) over 13 reference words.
        let wer = metric_value(&connection, job_run_id, clean.variant_id, METRIC_WER);
        assert!((wer - 2.0 / 13.0).abs() < 1e-9, "wer = {wer}");

        let p50 = metric_value(
            &connection,
            job_run_id,
            clean.variant_id,
            METRIC_LATENCY_P50_MS,
        );
        assert!((p50 - 850.0).abs() < 1e-9, "p50 = {p50}");

        // RTF mean over [2.0, 0.5, 0.4, 0.6].
        let rtf_mean = metric_value(&connection, job_run_id, clean.variant_id, METRIC_RTF_MEAN);
        assert!((rtf_mean - 0.875).abs() < 1e-9, "rtf_mean = {rtf_mean}");

        let status: String = connection
            .query_row(
                "SELECT status FROM job_run WHERE job_run_id = ?1",
                [job_run_id],
                |row| row.get(0),
            )
            .expect("status");
        assert_eq!(status, store::JOB_STATUS_COMPLETED);
    }

    #[test]
    fn empty_reference_bucket_flags_denominator_and_stays_finite() {
        let (mut connection, job_run_id) = seeded_store();
        let outcome =
            evaluate_job_run(&mut connection, job_run_id, &test_policy()).expect("evaluate");

        let noisy = &outcome.reports[1];
        assert_eq!(noisy.split, "dev-noisy");
        assert!(noisy.empty_denominator);
        assert_eq!(noisy.wer, 0.0);

        let extra: String = connection
            .query_row(
                "SELECT extra_json FROM metric_summary
                 WHERE job_run_id = ?1 AND variant_id = ?2 AND metric = 'wer'",
                rusqlite::params![job_run_id, noisy.variant_id],
                |row| row.get(0),
            )
            .expect("extra json");
        let extra: serde_json::Value = serde_json::from_str(&extra).expect("parse extra");
        assert_eq!(extra["empty_denominator"], true);
        assert_eq!(extra["total_insertions"], 1);
        assert_eq!(extra["total_ref_words"], 0);
    }

    #[test]
    fn bucket_without_latency_samples_omits_timing_rows_but_keeps_wer() {
        let (mut connection, job_run_id) = seeded_store();
        let outcome =
            evaluate_job_run(&mut connection, job_run_id, &test_policy()).expect("evaluate");

        let noisy = &outcome.reports[1];
        assert_eq!(noisy.split, "dev-noisy");

        let bucket_metrics = |table: &str| -> Vec<String> {
            let mut statement = connection
                .prepare(&format!(
                    "SELECT metric FROM {table}
                     WHERE job_run_id = ?1 AND variant_id = ?2 ORDER BY metric"
                ))
                .expect("prepare");
            statement
                .query_map(rusqlite::params![job_run_id, noisy.variant_id], |row| {
                    row.get(0)
                })
                .expect("query")
                .collect::<Result<Vec<_>, _>>()
                .expect("metrics")
        };

        assert_eq!(bucket_metrics("metric_summary"), vec![METRIC_WER.to_string()]);
        // No timing samples means no timing intervals either; the wer
        // point estimate still gets its resampled interval.
        assert_eq!(bucket_metrics("bootstrap_result"), vec![METRIC_WER.to_string()]);
    }

    #[test]
    fn small_sample_quantile_cis_use_order_statistics() {
        let (mut connection, job_run_id) = seeded_store();
        evaluate_job_run(&mut connection, job_run_id, &test_policy()).expect("evaluate");

        let (method, iterations, seed): (String, i64, Option<i64>) = connection
            .query_row(
                "SELECT method, iterations, seed FROM bootstrap_result
                 WHERE job_run_id = ?1 AND metric = 'latency_p50_ms'",
                [job_run_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .expect("bootstrap row");
        assert_eq!(method, METHOD_ORDERSTAT_BINOMIAL);
        assert_eq!(iterations, 0);
        assert_eq!(seed, None);

        // The mean-statistic metrics still resample.
        let (method, seed): (String, Option<i64>) = connection
            .query_row(
                "SELECT method, seed FROM bootstrap_result
                 WHERE job_run_id = ?1 AND metric = 'rtf_mean'",
                [job_run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("bootstrap row");
        assert_eq!(method, METHOD_BOOTSTRAP_PERCENTILE);
        assert_eq!(seed, Some(42));
    }

    #[test]
    fn reevaluation_is_deterministic_and_idempotent() {
        let (mut connection, job_run_id) = seeded_store();
        evaluate_job_run(&mut connection, job_run_id, &test_policy()).expect("first run");

        let snapshot = |connection: &Connection| -> Vec<(String, f64, f64)> {
            let mut statement = connection
                .prepare(
                    "SELECT metric, ci_low, ci_high FROM bootstrap_result
                     WHERE job_run_id = ?1 ORDER BY metric, variant_id",
                )
                .expect("prepare");
            let rows = statement
                .query_map([job_run_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .expect("query")
                .collect::<Result<Vec<_>, _>>()
                .expect("rows");
            rows
        };

        let first = snapshot(&connection);
        evaluate_job_run(&mut connection, job_run_id, &test_policy()).expect("second run");
        let second = snapshot(&connection);

        assert_eq!(first.len(), second.len());
        for ((metric_a, low_a, high_a), (metric_b, low_b, high_b)) in
            first.iter().zip(second.iter())
        {
            assert_eq!(metric_a, metric_b);
            assert_eq!(low_a.to_bits(), low_b.to_bits(), "metric {metric_a}");
            assert_eq!(high_a.to_bits(), high_b.to_bits(), "metric {metric_a}");
        }

        let summary_count: i64 = connection
            .query_row("SELECT COUNT(*) FROM metric_summary", [], |row| row.get(0))
            .expect("count");
        let first_count = summary_count;
        evaluate_job_run(&mut connection, job_run_id, &test_policy()).expect("third run");
        let second_count: i64 = connection
            .query_row("SELECT COUNT(*) FROM metric_summary", [], |row| row.get(0))
            .expect("count");
        assert_eq!(first_count, second_count, "replace-by-key must not grow rows");
    }

    #[test]
    fn skip_bootstrap_omits_ci_rows_but_keeps_point_estimates() {
        let (mut connection, job_run_id) = seeded_store();
        let policy = EvalPolicy {
            skip_bootstrap: true,
            ..test_policy()
        };
        evaluate_job_run(&mut connection, job_run_id, &policy).expect("evaluate");

        let ci_count: i64 = connection
            .query_row("SELECT COUNT(*) FROM bootstrap_result", [], |row| row.get(0))
            .expect("count");
        assert_eq!(ci_count, 0);

        let summary_count: i64 = connection
            .query_row("SELECT COUNT(*) FROM metric_summary", [], |row| row.get(0))
            .expect("count");
        assert!(summary_count > 0);
    }

    #[test]
    fn rtf_scenarios_match_definition() {
        // 2000ms over 1s of audio is slower than real time; 500ms is faster.
        let bucket = Bucket {
            dataset_id: 1,
            dataset_name: "synthetic".to_string(),
            variant_id: 1,
            split: String::new(),
            rows: vec![
                EvalRow {
                    utt_pk: 1,
                    external_id: "r1".to_string(),
                    ref_text: "a".to_string(),
                    hyp_text: "a".to_string(),
                    duration_s: Some(1.0),
                    total_time_ms: Some(2000.0),
                    dataset_id: 1,
                    dataset_name: "synthetic".to_string(),
                    variant_id: 1,
                    split: String::new(),
                    variant_json: "{}".to_string(),
                },
                EvalRow {
                    utt_pk: 2,
                    external_id: "r2".to_string(),
                    ref_text: "b".to_string(),
                    hyp_text: "b".to_string(),
                    duration_s: Some(1.0),
                    total_time_ms: Some(500.0),
                    dataset_id: 1,
                    dataset_name: "synthetic".to_string(),
                    variant_id: 1,
                    split: String::new(),
                    variant_json: "{}".to_string(),
                },
            ],
        };
        let normalizer = Normalizer::new(NormalizeOptions::default()).expect("normalizer");
        let computation = compute_bucket(&bucket, &normalizer);
        assert_eq!(computation.rtf, vec![2.0, 0.5]);
        assert_eq!(computation.rtf_mean, Some(1.25));
    }

    #[test]
    fn invalid_latency_rows_are_excluded_and_counted() {
        let bucket = Bucket {
            dataset_id: 1,
            dataset_name: "synthetic".to_string(),
            variant_id: 1,
            split: String::new(),
            rows: vec![EvalRow {
                utt_pk: 1,
                external_id: "bad".to_string(),
                ref_text: "a b".to_string(),
                hyp_text: "a b".to_string(),
                duration_s: Some(1.0),
                total_time_ms: Some(f64::NAN),
                dataset_id: 1,
                dataset_name: "synthetic".to_string(),
                variant_id: 1,
                split: String::new(),
                variant_json: "{}".to_string(),
            }],
        };
        let normalizer = Normalizer::new(NormalizeOptions::default()).expect("normalizer");
        let computation = compute_bucket(&bucket, &normalizer);
        assert_eq!(computation.n_utterances, 0);
        assert_eq!(computation.excluded_utterances, 1);
        assert!(computation.empty_denominator);
    }
}
