use anyhow::Context;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use delta_tracker::{CompetitorId, DeltaConfig, Sample, Session};

// ---------- Output ----------

// One line per adjacent pair in running order
#[derive(Serialize)]
struct Out {
    t: i64,
    ahead: CompetitorId,
    behind: CompetitorId,
    delta_ms: f64,
    to_catch_laps: f64,
}

// ---------- Running order ----------

// Leader first: furthest bucket reached, ties broken by earlier time there.
fn running_order(session: &Session) -> Vec<CompetitorId> {
    let mut order: Vec<(CompetitorId, i64, f64)> = session
        .competitors()
        .into_iter()
        .filter_map(|id| {
            let series = session.series(id)?;
            let (bucket, time) = series.iter().next_back()?;
            Some((id, *bucket, *time))
        })
        .collect();
    order.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.total_cmp(&b.2)));
    order.into_iter().map(|(id, _, _)| id).collect()
}

fn load_config() -> anyhow::Result<DeltaConfig> {
    match std::env::var("DELTA_CONFIG") {
        Ok(path) => DeltaConfig::load(&path)
            .with_context(|| format!("failed to load config at {}", path)),
        Err(_) => Ok(DeltaConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cfg = load_config()?;
    let avg_lap_distance: f64 = std::env::var("AVG_LAP_DISTANCE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5000.0);
    let log_deltas = std::env::var("LOG_DELTAS").ok().as_deref() == Some("1");
    tracing::info!("config: {:?}, average lap distance {}", cfg, avg_lap_distance);

    let session = Session::with_runtime(cfg, tokio::runtime::Handle::current())?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let sample: Sample = match serde_json::from_str(&line) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("line {}: not a sample: {}", line_no, e);
                continue;
            }
        };
        match session.ingest(sample.driver, sample.distance, sample.time) {
            Ok(admission) if log_deltas => {
                tracing::info!(
                    "recv driver={} distance={:.1} time={:.0} {:?}",
                    sample.driver, sample.distance, sample.time, admission
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("line {}: {}", line_no, e),
        }
    }

    tracing::info!(
        "replayed {} lines: {}",
        line_no,
        serde_json::to_string(&session.stats())?
    );

    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default();
    let order = running_order(&session);
    for pair in order.windows(2) {
        let (ahead, behind) = (pair[0], pair[1]);
        let out = Out {
            t: now_ms,
            ahead,
            behind,
            delta_ms: session.delta_between(behind, ahead)?,
            to_catch_laps: session.to_catch_real_time(ahead, behind, avg_lap_distance)?,
        };
        println!("{}", serde_json::to_string(&out)?);
    }
    Ok(())
}
