//! SQLite-backed metric store. Schema and key discipline follow the
//! benchmark data model: every aggregate row is keyed by
//! (job_run, dataset, variant, metric) and writes are replace-by-key, so
//! re-running an evaluation is idempotent. Callers wrap each bucket's
//! writes in one transaction; a failed bucket commits nothing.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::util::now_utc_string;

pub const DB_SCHEMA_VERSION: &str = "0.1.0";

pub const JOB_STATUS_RUNNING: &str = "running";
pub const JOB_STATUS_COMPLETED: &str = "completed";
pub const JOB_STATUS_FAILED: &str = "failed";

pub fn open(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    configure_connection(&connection)?;
    ensure_schema(&connection)?;
    Ok(connection)
}

pub fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

pub fn ensure_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS provider (
          provider_id INTEGER PRIMARY KEY,
          name TEXT NOT NULL UNIQUE,
          sdk TEXT NOT NULL DEFAULT '',
          sdk_version TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS model (
          model_id INTEGER PRIMARY KEY,
          provider_id INTEGER NOT NULL,
          name TEXT NOT NULL,
          revision TEXT NOT NULL DEFAULT '',
          FOREIGN KEY(provider_id) REFERENCES provider(provider_id)
        );

        CREATE TABLE IF NOT EXISTS benchmark (
          benchmark_id TEXT PRIMARY KEY,
          created_at TEXT NOT NULL,
          notes TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS dataset (
          dataset_id INTEGER PRIMARY KEY,
          name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS dataset_variant (
          variant_id INTEGER PRIMARY KEY,
          dataset_id INTEGER NOT NULL,
          split TEXT NOT NULL DEFAULT '',
          variant_json TEXT NOT NULL DEFAULT '{}',
          FOREIGN KEY(dataset_id) REFERENCES dataset(dataset_id)
        );

        CREATE TABLE IF NOT EXISTS job_run (
          job_run_id INTEGER PRIMARY KEY,
          benchmark_id TEXT NOT NULL,
          provider_id INTEGER NOT NULL,
          model_id INTEGER NOT NULL,
          eval_version TEXT NOT NULL,
          started_at TEXT NOT NULL,
          ended_at TEXT,
          status TEXT NOT NULL DEFAULT 'running',
          error_text TEXT NOT NULL DEFAULT '',
          FOREIGN KEY(benchmark_id) REFERENCES benchmark(benchmark_id),
          FOREIGN KEY(provider_id) REFERENCES provider(provider_id),
          FOREIGN KEY(model_id) REFERENCES model(model_id)
        );

        CREATE TABLE IF NOT EXISTS utterance (
          utt_pk INTEGER PRIMARY KEY,
          dataset_id INTEGER NOT NULL,
          variant_id INTEGER NOT NULL,
          external_id TEXT NOT NULL,
          audio_path TEXT NOT NULL DEFAULT '',
          ref_text TEXT NOT NULL,
          duration_s REAL,
          FOREIGN KEY(dataset_id) REFERENCES dataset(dataset_id),
          FOREIGN KEY(variant_id) REFERENCES dataset_variant(variant_id)
        );

        CREATE TABLE IF NOT EXISTS prediction (
          prediction_id INTEGER PRIMARY KEY,
          job_run_id INTEGER NOT NULL,
          utt_pk INTEGER NOT NULL,
          hyp_text TEXT NOT NULL,
          words_json TEXT NOT NULL DEFAULT 'null',
          usage_json TEXT NOT NULL DEFAULT 'null',
          created_at TEXT NOT NULL,
          FOREIGN KEY(job_run_id) REFERENCES job_run(job_run_id),
          FOREIGN KEY(utt_pk) REFERENCES utterance(utt_pk)
        );

        CREATE TABLE IF NOT EXISTS latency_sample (
          lat_id INTEGER PRIMARY KEY,
          job_run_id INTEGER NOT NULL,
          utt_pk INTEGER NOT NULL,
          api_time_ms REAL NOT NULL,
          total_time_ms REAL NOT NULL,
          rtf REAL,
          FOREIGN KEY(job_run_id) REFERENCES job_run(job_run_id),
          FOREIGN KEY(utt_pk) REFERENCES utterance(utt_pk)
        );

        CREATE TABLE IF NOT EXISTS metric_summary (
          summary_id INTEGER PRIMARY KEY,
          job_run_id INTEGER NOT NULL,
          dataset_id INTEGER NOT NULL,
          variant_id INTEGER NOT NULL,
          metric TEXT NOT NULL,
          value REAL NOT NULL,
          extra_json TEXT NOT NULL DEFAULT '{}',
          FOREIGN KEY(job_run_id) REFERENCES job_run(job_run_id)
        );

        CREATE TABLE IF NOT EXISTS bootstrap_result (
          boot_id INTEGER PRIMARY KEY,
          job_run_id INTEGER NOT NULL,
          dataset_id INTEGER NOT NULL,
          variant_id INTEGER NOT NULL,
          metric TEXT NOT NULL,
          ci_low REAL NOT NULL,
          ci_high REAL NOT NULL,
          iterations INTEGER NOT NULL,
          method TEXT NOT NULL,
          seed INTEGER,
          extra_json TEXT NOT NULL DEFAULT '{}',
          FOREIGN KEY(job_run_id) REFERENCES job_run(job_run_id)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS ix_variant_unique
          ON dataset_variant(dataset_id, split, variant_json);
        CREATE UNIQUE INDEX IF NOT EXISTS ix_utt_unique
          ON utterance(dataset_id, variant_id, external_id);
        CREATE UNIQUE INDEX IF NOT EXISTS ix_pred_unique
          ON prediction(job_run_id, utt_pk);
        CREATE UNIQUE INDEX IF NOT EXISTS ix_lat_unique
          ON latency_sample(job_run_id, utt_pk);
        CREATE UNIQUE INDEX IF NOT EXISTS ix_summary_key
          ON metric_summary(job_run_id, dataset_id, variant_id, metric);
        CREATE UNIQUE INDEX IF NOT EXISTS ix_bootstrap_key
          ON bootstrap_result(job_run_id, dataset_id, variant_id, metric);
        ",
    )?;

    let now = now_utc_string();
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now],
    )?;

    Ok(())
}

pub fn upsert_provider(
    connection: &Connection,
    name: &str,
    sdk: &str,
    sdk_version: &str,
) -> Result<i64> {
    connection.execute(
        "INSERT INTO provider(name, sdk, sdk_version) VALUES(?1, ?2, ?3)
         ON CONFLICT(name) DO UPDATE SET sdk=excluded.sdk, sdk_version=excluded.sdk_version",
        params![name, sdk, sdk_version],
    )?;
    let provider_id = connection.query_row(
        "SELECT provider_id FROM provider WHERE name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(provider_id)
}

pub fn upsert_model(
    connection: &Connection,
    provider_id: i64,
    name: &str,
    revision: &str,
) -> Result<i64> {
    let existing: Option<i64> = connection
        .query_row(
            "SELECT model_id FROM model WHERE provider_id = ?1 AND name = ?2 AND revision = ?3",
            params![provider_id, name, revision],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(model_id) = existing {
        return Ok(model_id);
    }

    connection.execute(
        "INSERT INTO model(provider_id, name, revision) VALUES(?1, ?2, ?3)",
        params![provider_id, name, revision],
    )?;
    Ok(connection.last_insert_rowid())
}

pub fn upsert_benchmark(connection: &Connection, benchmark_id: &str, notes: &str) -> Result<()> {
    connection.execute(
        "INSERT INTO benchmark(benchmark_id, created_at, notes) VALUES(?1, ?2, ?3)
         ON CONFLICT(benchmark_id) DO UPDATE SET notes=excluded.notes",
        params![benchmark_id, now_utc_string(), notes],
    )?;
    Ok(())
}

pub fn upsert_dataset(connection: &Connection, name: &str) -> Result<i64> {
    connection.execute(
        "INSERT INTO dataset(name) VALUES(?1) ON CONFLICT(name) DO NOTHING",
        [name],
    )?;
    let dataset_id = connection.query_row(
        "SELECT dataset_id FROM dataset WHERE name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(dataset_id)
}

pub fn upsert_variant(
    connection: &Connection,
    dataset_id: i64,
    split: &str,
    variant_json: &str,
) -> Result<i64> {
    connection.execute(
        "INSERT INTO dataset_variant(dataset_id, split, variant_json) VALUES(?1, ?2, ?3)
         ON CONFLICT(dataset_id, split, variant_json) DO NOTHING",
        params![dataset_id, split, variant_json],
    )?;
    let variant_id = connection.query_row(
        "SELECT variant_id FROM dataset_variant
         WHERE dataset_id = ?1 AND split = ?2 AND variant_json = ?3",
        params![dataset_id, split, variant_json],
        |row| row.get(0),
    )?;
    Ok(variant_id)
}

pub fn create_job_run(
    connection: &Connection,
    benchmark_id: &str,
    provider_id: i64,
    model_id: i64,
    eval_version: &str,
) -> Result<i64> {
    connection.execute(
        "INSERT INTO job_run(benchmark_id, provider_id, model_id, eval_version, started_at, status)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            benchmark_id,
            provider_id,
            model_id,
            eval_version,
            now_utc_string(),
            JOB_STATUS_RUNNING
        ],
    )?;
    Ok(connection.last_insert_rowid())
}

pub fn mark_job_run(
    connection: &Connection,
    job_run_id: i64,
    status: &str,
    error_text: &str,
) -> Result<()> {
    connection.execute(
        "UPDATE job_run SET status = ?2, error_text = ?3, ended_at = ?4 WHERE job_run_id = ?1",
        params![job_run_id, status, error_text, now_utc_string()],
    )?;
    Ok(())
}

pub fn upsert_utterance(
    connection: &Connection,
    dataset_id: i64,
    variant_id: i64,
    external_id: &str,
    audio_path: &str,
    ref_text: &str,
    duration_s: Option<f64>,
) -> Result<i64> {
    connection.execute(
        "INSERT INTO utterance(dataset_id, variant_id, external_id, audio_path, ref_text, duration_s)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(dataset_id, variant_id, external_id) DO UPDATE SET
           audio_path=excluded.audio_path,
           ref_text=excluded.ref_text,
           duration_s=excluded.duration_s",
        params![dataset_id, variant_id, external_id, audio_path, ref_text, duration_s],
    )?;
    let utt_pk = connection.query_row(
        "SELECT utt_pk FROM utterance
         WHERE dataset_id = ?1 AND variant_id = ?2 AND external_id = ?3",
        params![dataset_id, variant_id, external_id],
        |row| row.get(0),
    )?;
    Ok(utt_pk)
}

pub fn upsert_prediction(
    connection: &Connection,
    job_run_id: i64,
    utt_pk: i64,
    hyp_text: &str,
    words_json: &str,
    usage_json: &str,
) -> Result<()> {
    connection.execute(
        "INSERT INTO prediction(job_run_id, utt_pk, hyp_text, words_json, usage_json, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(job_run_id, utt_pk) DO UPDATE SET
           hyp_text=excluded.hyp_text,
           words_json=excluded.words_json,
           usage_json=excluded.usage_json",
        params![job_run_id, utt_pk, hyp_text, words_json, usage_json, now_utc_string()],
    )?;
    Ok(())
}

pub fn upsert_latency_sample(
    connection: &Connection,
    job_run_id: i64,
    utt_pk: i64,
    api_time_ms: f64,
    total_time_ms: f64,
    rtf: Option<f64>,
) -> Result<()> {
    connection.execute(
        "INSERT INTO latency_sample(job_run_id, utt_pk, api_time_ms, total_time_ms, rtf)
         VALUES(?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(job_run_id, utt_pk) DO UPDATE SET
           api_time_ms=excluded.api_time_ms,
           total_time_ms=excluded.total_time_ms,
           rtf=excluded.rtf",
        params![job_run_id, utt_pk, api_time_ms, total_time_ms, rtf],
    )?;
    Ok(())
}

/// Full replace of the point-estimate row for one
/// (job_run, dataset, variant, metric) key. Run inside the bucket's
/// transaction so the whole metric set commits or rolls back together.
pub fn write_summary(
    connection: &Connection,
    job_run_id: i64,
    dataset_id: i64,
    variant_id: i64,
    metric: &str,
    value: f64,
    extra_json: &str,
) -> Result<()> {
    connection.execute(
        "INSERT INTO metric_summary(job_run_id, dataset_id, variant_id, metric, value, extra_json)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(job_run_id, dataset_id, variant_id, metric) DO UPDATE SET
           value=excluded.value,
           extra_json=excluded.extra_json",
        params![job_run_id, dataset_id, variant_id, metric, value, extra_json],
    )?;
    Ok(())
}

/// Companion uncertainty row for a summary key; method, iteration count
/// and seed are persisted for reproducibility audit. Seed is NULL for
/// order-statistic intervals, which draw nothing.
#[allow(clippy::too_many_arguments)]
pub fn write_bootstrap(
    connection: &Connection,
    job_run_id: i64,
    dataset_id: i64,
    variant_id: i64,
    metric: &str,
    ci_low: f64,
    ci_high: f64,
    iterations: usize,
    method: &str,
    seed: Option<u64>,
    extra_json: &str,
) -> Result<()> {
    connection.execute(
        "INSERT INTO bootstrap_result(job_run_id, dataset_id, variant_id, metric,
                                      ci_low, ci_high, iterations, method, seed, extra_json)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(job_run_id, dataset_id, variant_id, metric) DO UPDATE SET
           ci_low=excluded.ci_low,
           ci_high=excluded.ci_high,
           iterations=excluded.iterations,
           method=excluded.method,
           seed=excluded.seed,
           extra_json=excluded.extra_json",
        params![
            job_run_id,
            dataset_id,
            variant_id,
            metric,
            ci_low,
            ci_high,
            iterations as i64,
            method,
            seed.map(|value| value as i64),
            extra_json
        ],
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct JobRunInfo {
    pub job_run_id: i64,
    pub benchmark_id: String,
    pub provider: String,
    pub model: String,
    pub eval_version: String,
    pub status: String,
}

pub fn load_job_run_info(connection: &Connection, job_run_id: i64) -> Result<JobRunInfo> {
    connection
        .query_row(
            "SELECT j.job_run_id, j.benchmark_id, p.name, m.name, j.eval_version, j.status
             FROM job_run j
             JOIN provider p ON p.provider_id = j.provider_id
             JOIN model m ON m.model_id = j.model_id
             WHERE j.job_run_id = ?1",
            [job_run_id],
            |row| {
                Ok(JobRunInfo {
                    job_run_id: row.get(0)?,
                    benchmark_id: row.get(1)?,
                    provider: row.get(2)?,
                    model: row.get(3)?,
                    eval_version: row.get(4)?,
                    status: row.get(5)?,
                })
            },
        )
        .with_context(|| format!("job run {job_run_id} not found"))
}

/// One scored utterance joined with its prediction and latency sample;
/// the evaluation pipeline consumes these as a single consistent snapshot
/// of the job run.
#[derive(Debug, Clone)]
pub struct EvalRow {
    pub utt_pk: i64,
    pub external_id: String,
    pub ref_text: String,
    pub hyp_text: String,
    pub duration_s: Option<f64>,
    pub total_time_ms: Option<f64>,
    pub dataset_id: i64,
    pub dataset_name: String,
    pub variant_id: i64,
    pub split: String,
    pub variant_json: String,
}

pub fn load_eval_rows(connection: &Connection, job_run_id: i64) -> Result<Vec<EvalRow>> {
    let mut statement = connection.prepare(
        "SELECT u.utt_pk, u.external_id, u.ref_text, p.hyp_text, u.duration_s,
                l.total_time_ms, d.dataset_id, d.name, v.variant_id, v.split, v.variant_json
         FROM prediction p
         JOIN utterance u ON u.utt_pk = p.utt_pk
         JOIN dataset d ON d.dataset_id = u.dataset_id
         JOIN dataset_variant v ON v.variant_id = u.variant_id
         LEFT JOIN latency_sample l
           ON l.job_run_id = p.job_run_id AND l.utt_pk = p.utt_pk
         WHERE p.job_run_id = ?1
         ORDER BY d.dataset_id, v.variant_id, u.external_id",
    )?;

    let rows = statement
        .query_map([job_run_id], |row| {
            Ok(EvalRow {
                utt_pk: row.get(0)?,
                external_id: row.get(1)?,
                ref_text: row.get(2)?,
                hyp_text: row.get(3)?,
                duration_s: row.get(4)?,
                total_time_ms: row.get(5)?,
                dataset_id: row.get(6)?,
                dataset_name: row.get(7)?,
                variant_id: row.get(8)?,
                split: row.get(9)?,
                variant_json: row.get(10)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct SummaryRecord {
    pub dataset_id: i64,
    pub dataset_name: String,
    pub variant_id: i64,
    pub split: String,
    pub variant_json: String,
    pub metric: String,
    pub value: f64,
    pub extra_json: String,
}

pub fn load_metric_summaries(
    connection: &Connection,
    job_run_id: i64,
) -> Result<Vec<SummaryRecord>> {
    let mut statement = connection.prepare(
        "SELECT s.dataset_id, d.name, s.variant_id, v.split, v.variant_json,
                s.metric, s.value, s.extra_json
         FROM metric_summary s
         JOIN dataset d ON d.dataset_id = s.dataset_id
         JOIN dataset_variant v ON v.variant_id = s.variant_id
         WHERE s.job_run_id = ?1
         ORDER BY d.name, v.variant_id, s.metric",
    )?;

    let rows = statement
        .query_map([job_run_id], |row| {
            Ok(SummaryRecord {
                dataset_id: row.get(0)?,
                dataset_name: row.get(1)?,
                variant_id: row.get(2)?,
                split: row.get(3)?,
                variant_json: row.get(4)?,
                metric: row.get(5)?,
                value: row.get(6)?,
                extra_json: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct BootstrapRecord {
    pub dataset_id: i64,
    pub variant_id: i64,
    pub metric: String,
    pub ci_low: f64,
    pub ci_high: f64,
}

pub fn load_bootstrap_results(
    connection: &Connection,
    job_run_id: i64,
) -> Result<Vec<BootstrapRecord>> {
    let mut statement = connection.prepare(
        "SELECT dataset_id, variant_id, metric, ci_low, ci_high
         FROM bootstrap_result
         WHERE job_run_id = ?1",
    )?;

    let rows = statement
        .query_map([job_run_id], |row| {
            Ok(BootstrapRecord {
                dataset_id: row.get(0)?,
                variant_id: row.get(1)?,
                metric: row.get(2)?,
                ci_low: row.get(3)?,
                ci_high: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}
