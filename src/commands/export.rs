use std::collections::{BTreeMap, HashMap};
use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::{ExportArgs, ExportShape};
use crate::model::{
    METRIC_LATENCY_P50_MS, METRIC_LATENCY_P95_MS, METRIC_RTF_MEAN, METRIC_RTF_P95, METRIC_WER,
    ProviderExport, SummaryRow,
};
use crate::store::{self, BootstrapRecord, JobRunInfo, SummaryRecord};
use crate::util::write_json_pretty;

pub fn run(args: ExportArgs) -> Result<()> {
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("asrbench.sqlite"));

    let connection = store::open(&db_path)?;
    let info = store::load_job_run_info(&connection, args.job_run_id)?;
    if info.status != store::JOB_STATUS_COMPLETED {
        warn!(
            job_run_id = info.job_run_id,
            status = %info.status,
            "exporting a job run that has not completed"
        );
    }

    let summaries = store::load_metric_summaries(&connection, args.job_run_id)?;
    if summaries.is_empty() {
        anyhow::bail!("job run {} has no metric summaries to export", args.job_run_id);
    }
    let bootstraps = store::load_bootstrap_results(&connection, args.job_run_id)?;

    let export = build_export(&info, &summaries, &bootstraps, args.shape);
    let row_count = match &export {
        ProviderExport::Legacy { results, .. } => results.len(),
        ProviderExport::Current { datasets, .. } => datasets.values().map(Vec::len).sum(),
    };

    match &args.out {
        Some(path) => {
            write_json_pretty(path, &export)?;
            info!(
                path = %path.display(),
                shape = args.shape.as_str(),
                rows = row_count,
                "wrote export"
            );
        }
        None => {
            let stdout = std::io::stdout();
            let mut output = BufWriter::new(stdout.lock());
            serde_json::to_writer_pretty(&mut output, &export)
                .context("failed to serialize export")?;
            writeln!(output)?;
            output.flush()?;
        }
    }

    Ok(())
}

/// Assembles leaderboard rows from the stored summaries. One row per
/// (dataset, variant) bucket; missing metrics and intervals stay null
/// rather than being dropped or zero-filled.
pub(crate) fn build_export(
    info: &JobRunInfo,
    summaries: &[SummaryRecord],
    bootstraps: &[BootstrapRecord],
    shape: ExportShape,
) -> ProviderExport {
    let mut intervals: HashMap<(i64, i64, &str), (f64, f64)> = HashMap::new();
    for record in bootstraps {
        intervals.insert(
            (record.dataset_id, record.variant_id, record.metric.as_str()),
            (record.ci_low, record.ci_high),
        );
    }

    let mut rows: BTreeMap<(String, i64), SummaryRow> = BTreeMap::new();
    for record in summaries {
        let key = (record.dataset_name.clone(), record.variant_id);
        let row = rows.entry(key).or_insert_with(|| SummaryRow {
            benchmark_id: info.benchmark_id.clone(),
            job_run_id: info.job_run_id,
            provider: info.provider.clone(),
            model: info.model.clone(),
            eval_version: info.eval_version.clone(),
            label: build_label(&record.dataset_name, &record.split, &record.variant_json),
            dataset_id: record.dataset_id,
            dataset_name: record.dataset_name.clone(),
            variant_id: record.variant_id,
            n_utterances: 0,
            wer: None,
            wer_ci_low: None,
            wer_ci_high: None,
            latency_p50_ms: None,
            latency_p50_ms_ci_low: None,
            latency_p50_ms_ci_high: None,
            latency_p95_ms: None,
            latency_p95_ms_ci_low: None,
            latency_p95_ms_ci_high: None,
            rtf_mean: None,
            rtf_mean_ci_low: None,
            rtf_mean_ci_high: None,
            rtf_p95: None,
            rtf_p95_ci_low: None,
            rtf_p95_ci_high: None,
        });

        let ci = intervals
            .get(&(record.dataset_id, record.variant_id, record.metric.as_str()))
            .copied();
        let (ci_low, ci_high) = match ci {
            Some((low, high)) => (Some(low), Some(high)),
            None => (None, None),
        };

        match record.metric.as_str() {
            METRIC_WER => {
                row.wer = Some(record.value);
                row.wer_ci_low = ci_low;
                row.wer_ci_high = ci_high;
                row.n_utterances = utterance_count(&record.extra_json);
            }
            METRIC_LATENCY_P50_MS => {
                row.latency_p50_ms = Some(record.value);
                row.latency_p50_ms_ci_low = ci_low;
                row.latency_p50_ms_ci_high = ci_high;
            }
            METRIC_LATENCY_P95_MS => {
                row.latency_p95_ms = Some(record.value);
                row.latency_p95_ms_ci_low = ci_low;
                row.latency_p95_ms_ci_high = ci_high;
            }
            METRIC_RTF_MEAN => {
                row.rtf_mean = Some(record.value);
                row.rtf_mean_ci_low = ci_low;
                row.rtf_mean_ci_high = ci_high;
            }
            METRIC_RTF_P95 => {
                row.rtf_p95 = Some(record.value);
                row.rtf_p95_ci_low = ci_low;
                row.rtf_p95_ci_high = ci_high;
            }
            // wer_sentence_proxy and any future metric ride along in the
            // store but have no leaderboard column.
            _ => {}
        }
    }

    match shape {
        ExportShape::Legacy => ProviderExport::Legacy {
            provider: info.provider.clone(),
            results: rows.into_values().collect(),
        },
        ExportShape::Current => {
            let mut datasets: BTreeMap<String, Vec<SummaryRow>> = BTreeMap::new();
            for ((dataset_name, _), row) in rows {
                datasets.entry(dataset_name).or_default().push(row);
            }
            ProviderExport::Current {
                provider: info.provider.clone(),
                datasets,
            }
        }
    }
}

fn utterance_count(extra_json: &str) -> i64 {
    serde_json::from_str::<serde_json::Value>(extra_json)
        .ok()
        .and_then(|extra| extra.get("n_utterances").and_then(|value| value.as_i64()))
        .unwrap_or(0)
}

/// Human-readable bucket label shown by the dashboard, e.g.
/// `librispeech [snr_db=10, split=dev-other, subset=noisy]`. The subset
/// token is always present and falls back to the split name.
pub(crate) fn build_label(dataset_name: &str, split: &str, variant_json: &str) -> String {
    let variant: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(variant_json).unwrap_or_default();

    let split_token = if split.is_empty() { "all" } else { split };
    let mut tokens: Vec<String> = variant
        .iter()
        .filter(|(key, _)| key.as_str() != "subset")
        .map(|(key, value)| format!("{key}={}", render_value(value)))
        .collect();
    tokens.push(format!("split={split_token}"));
    let subset = variant
        .get("subset")
        .map(render_value)
        .unwrap_or_else(|| split_token.to_string());
    tokens.push(format!("subset={subset}"));

    format!("{dataset_name} [{}]", tokens.join(", "))
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_info() -> JobRunInfo {
        JobRunInfo {
            job_run_id: 7,
            benchmark_id: "bench-1".to_string(),
            provider: "acme".to_string(),
            model: "acme-asr".to_string(),
            eval_version: "v1".to_string(),
            status: store::JOB_STATUS_COMPLETED.to_string(),
        }
    }

    fn summary(
        dataset_id: i64,
        variant_id: i64,
        metric: &str,
        value: f64,
        extra_json: &str,
    ) -> SummaryRecord {
        SummaryRecord {
            dataset_id,
            dataset_name: "librispeech".to_string(),
            variant_id,
            split: "dev-clean".to_string(),
            variant_json: r#"{"subset":"clean"}"#.to_string(),
            metric: metric.to_string(),
            value,
            extra_json: extra_json.to_string(),
        }
    }

    #[test]
    fn label_includes_variant_split_and_subset_tokens() {
        let label = build_label(
            "librispeech",
            "dev-other",
            r#"{"snr_db":10,"subset":"noisy"}"#,
        );
        assert_eq!(label, "librispeech [snr_db=10, split=dev-other, subset=noisy]");
    }

    #[test]
    fn label_subset_falls_back_to_split_then_all() {
        assert_eq!(
            build_label("voxpopuli", "test", "{}"),
            "voxpopuli [split=test, subset=test]"
        );
        assert_eq!(
            build_label("voxpopuli", "", "{}"),
            "voxpopuli [split=all, subset=all]"
        );
    }

    #[test]
    fn current_shape_groups_rows_by_dataset() {
        let summaries = vec![
            summary(1, 1, METRIC_WER, 0.25, r#"{"n_utterances":40}"#),
            summary(1, 1, METRIC_LATENCY_P50_MS, 850.0, "{}"),
        ];
        let bootstraps = vec![BootstrapRecord {
            dataset_id: 1,
            variant_id: 1,
            metric: METRIC_WER.to_string(),
            ci_low: 0.20,
            ci_high: 0.31,
        }];

        let export = build_export(&test_info(), &summaries, &bootstraps, ExportShape::Current);
        let value = serde_json::to_value(&export).expect("serialize");

        assert_eq!(value["provider"], "acme");
        let rows = value["datasets"]["librispeech"]
            .as_array()
            .expect("dataset rows");
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row["job_run_id"], 7);
        assert_eq!(row["n_utterances"], 40);
        assert_eq!(row["wer"], 0.25);
        assert_eq!(row["wer_ci_low"], 0.20);
        assert_eq!(row["wer_ci_high"], 0.31);
        assert_eq!(row["latency_p50_ms"], 850.0);
        assert_eq!(row["latency_p50_ms_ci_low"], serde_json::Value::Null);
        assert_eq!(row["rtf_mean"], serde_json::Value::Null);
        assert_eq!(
            row["label"],
            "librispeech [split=dev-clean, subset=clean]"
        );
    }

    #[test]
    fn legacy_shape_flattens_rows_under_results() {
        let summaries = vec![summary(1, 1, METRIC_WER, 0.10, r#"{"n_utterances":12}"#)];
        let export = build_export(&test_info(), &summaries, &[], ExportShape::Legacy);
        let value = serde_json::to_value(&export).expect("serialize");

        assert_eq!(value["provider"], "acme");
        assert!(value.get("datasets").is_none());
        let results = value["results"].as_array().expect("results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["wer"], 0.10);
        assert_eq!(results[0]["wer_ci_low"], serde_json::Value::Null);
    }

    #[test]
    fn sentence_proxy_metric_has_no_leaderboard_column() {
        let summaries = vec![
            summary(1, 1, METRIC_WER, 0.10, r#"{"n_utterances":12}"#),
            summary(1, 1, "wer_sentence_proxy", 0.3, "{}"),
        ];
        let export = build_export(&test_info(), &summaries, &[], ExportShape::Legacy);
        let value = serde_json::to_value(&export).expect("serialize");
        assert!(value["results"][0].get("wer_sentence_proxy").is_none());
    }
}
