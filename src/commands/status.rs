use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::cli::StatusArgs;

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_dir = args.cache_root.join("manifests");
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("asrbench.sqlite"));

    info!(cache_root = %args.cache_root.display(), "status requested");

    if manifest_dir.exists() {
        let mut manifest_count = 0_usize;
        for entry in std::fs::read_dir(&manifest_dir)
            .with_context(|| format!("failed to read {}", manifest_dir.display()))?
        {
            let entry = entry?;
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                manifest_count += 1;
            }
        }
        info!(
            path = %manifest_dir.display(),
            manifests = manifest_count,
            "manifest directory"
        );
    } else {
        warn!(path = %manifest_dir.display(), "manifest directory missing");
    }

    if !db_path.exists() {
        warn!(path = %db_path.display(), "database file missing");
        return Ok(());
    }

    let connection = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;

    let schema_version: String = connection
        .query_row(
            "SELECT value FROM metadata WHERE key = 'db_schema_version'",
            [],
            |row| row.get(0),
        )
        .unwrap_or_else(|_| "unknown".to_string());

    info!(
        path = %db_path.display(),
        db_schema_version = %schema_version,
        providers = query_count(&connection, "SELECT COUNT(*) FROM provider").unwrap_or(0),
        datasets = query_count(&connection, "SELECT COUNT(*) FROM dataset").unwrap_or(0),
        variants = query_count(&connection, "SELECT COUNT(*) FROM dataset_variant").unwrap_or(0),
        utterances = query_count(&connection, "SELECT COUNT(*) FROM utterance").unwrap_or(0),
        predictions = query_count(&connection, "SELECT COUNT(*) FROM prediction").unwrap_or(0),
        latency_samples = query_count(&connection, "SELECT COUNT(*) FROM latency_sample").unwrap_or(0),
        metric_summaries = query_count(&connection, "SELECT COUNT(*) FROM metric_summary").unwrap_or(0),
        bootstrap_results = query_count(&connection, "SELECT COUNT(*) FROM bootstrap_result").unwrap_or(0),
        "database status"
    );

    let mut statement = connection.prepare(
        "SELECT j.job_run_id, j.benchmark_id, p.name, m.name, j.status, j.started_at
         FROM job_run j
         JOIN provider p ON p.provider_id = j.provider_id
         JOIN model m ON m.model_id = j.model_id
         ORDER BY j.job_run_id",
    )?;
    let job_runs = statement
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if job_runs.is_empty() {
        warn!("no job runs recorded");
    }
    for (job_run_id, benchmark_id, provider, model, status, started_at) in job_runs {
        info!(
            job_run_id,
            benchmark_id = %benchmark_id,
            provider = %provider,
            model = %model,
            status = %status,
            started_at = %started_at,
            "job run"
        );
    }

    Ok(())
}

fn query_count(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}
