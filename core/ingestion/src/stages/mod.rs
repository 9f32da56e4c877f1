//! Stage implementations and the bounded fan-out they share.

pub mod circuit;
pub mod diagnostics;
pub mod dtc;
pub mod export;
pub mod function_groups;
pub mod function_parameters;
pub mod function_tree;
pub mod io_mapping;
pub mod system_info;

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::PipelineError;

/// Run `work` over `units` in batches of at most `batch_size`, at most
/// `max_parallel_workers` at a time. Each batch is fully joined before the
/// next starts. A unit error or timeout aborts the remaining work.
///
/// Results come back in input order.
pub async fn fan_out<T, R, F, Fut>(config: &PipelineConfig, label: &str, units: Vec<T>, work: F) -> Result<Vec<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let total = units.len();
    let work = Arc::new(work);
    let permits = Arc::new(Semaphore::new(config.max_parallel_workers.max(1)));
    let timeout = Duration::from_secs(config.unit_timeout_secs);
    let timeout_secs = config.unit_timeout_secs;

    let mut results: Vec<Option<R>> = Vec::with_capacity(total);
    results.resize_with(total, || None);

    let mut pending = units.into_iter().enumerate().peekable();
    let mut batch_number = 0;
    while pending.peek().is_some() {
        batch_number += 1;
        let mut batch = JoinSet::new();
        for (index, unit) in pending.by_ref().take(config.batch_size.max(1)) {
            let work = work.clone();
            let permits = permits.clone();
            let unit_label = format!("{} #{}", label, index + 1);
            batch.spawn(async move {
                let _permit = permits.acquire_owned().await.context("Worker pool closed")?;
                let result = tokio::time::timeout(timeout, work(unit)).await.map_err(|_| {
                    PipelineError::UnitTimeout {
                        unit: unit_label,
                        seconds: timeout_secs,
                    }
                })??;
                Ok::<_, anyhow::Error>((index, result))
            });
        }

        debug!("{}: waiting on batch {} ({} unit(s))", label, batch_number, batch.len());
        while let Some(joined) = batch.join_next().await {
            let (index, result) = joined.with_context(|| format!("{} worker panicked", label))??;
            results[index] = Some(result);
        }
    }

    Ok(results.into_iter().flatten().collect())
}
