//! Parallel backend over independently loaded partitions.

use super::{Combine, ExecutionBackend, MapPlan, tree_reduce};
use crate::config::ExecutionConfig;
use crate::dataset::{Dataset, InMemoryPartitions, PartitionedDataset};
use crate::error::{ErrorContext, Result, WipekitError};
use crate::pipeline::progress::CancellationToken;
use crate::utils::{ordering_values, require_column, sort_permutation, take_rows};
use polars::prelude::*;
use rayon::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Runs partition tasks on a dedicated rayon pool.
///
/// - Partials are merged with a fixed-shape tree reduction.
/// - The first failing partition (lowest index) is reported as
///   [`WipekitError::BackendExecution`]; no partial result is returned.
/// - Cancellation is checked before each partition task starts.
/// - The per-partition timeout is cooperative: a running task is never
///   interrupted, but a task that finishes past its deadline is discarded and
///   reported as [`WipekitError::PartitionTimeout`].
#[derive(Debug, Clone)]
pub struct PartitionedBackend {
    pool: Arc<rayon::ThreadPool>,
    partition_timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
}

impl PartitionedBackend {
    /// Backend with the rayon default thread count and no timeout.
    pub fn new() -> Result<Self> {
        Self::from_config(&ExecutionConfig::default())
    }

    pub fn from_config(config: &ExecutionConfig) -> Result<Self> {
        let mut builder = rayon::ThreadPoolBuilder::new()
            .thread_name(|i| format!("wipekit-partition-{i}"));
        if let Some(threads) = config.max_parallelism {
            builder = builder.num_threads(threads);
        }
        let pool = builder.build().map_err(|e| {
            WipekitError::configuration(
                ErrorContext::new(),
                format!("failed to start partition pool: {e}"),
            )
        })?;
        Ok(Self {
            pool: Arc::new(pool),
            partition_timeout: config.partition_timeout(),
            cancellation: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.partition_timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn parallelism(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `work` for every index in parallel and settle the outcomes.
    ///
    /// Once a partition fails, partitions with a higher index that have not
    /// started yet are skipped; lower ones still run so the reported failure
    /// is always the lowest failing index.
    fn run_all<T, W>(&self, count: usize, label: &str, work: W) -> Result<Vec<T>>
    where
        T: Send,
        W: Fn(usize) -> Result<T> + Sync,
    {
        let first_failure = AtomicUsize::new(usize::MAX);
        let outcomes: Vec<Option<Result<T>>> = self.pool.install(|| {
            (0..count)
                .into_par_iter()
                .map(|index| {
                    if index > first_failure.load(Ordering::SeqCst) {
                        return None;
                    }
                    let outcome = self.run_one(index, label, &work);
                    if outcome.is_err() {
                        first_failure.fetch_min(index, Ordering::SeqCst);
                    }
                    Some(outcome)
                })
                .collect()
        });

        let mut values = Vec::with_capacity(count);
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Some(Ok(value)) => values.push(value),
                Some(Err(WipekitError::Cancelled)) => return Err(WipekitError::Cancelled),
                Some(Err(err)) => {
                    warn!(partition = index, task = label, error = %err, "partition failed");
                    return Err(WipekitError::BackendExecution {
                        partition: index,
                        source: Box::new(err.in_partition(index)),
                    });
                }
                // Skips only follow a failure at a lower index, returned above.
                None => {}
            }
        }
        Ok(values)
    }

    fn run_one<T, W>(&self, index: usize, label: &str, work: &W) -> Result<T>
    where
        W: Fn(usize) -> Result<T> + Sync,
    {
        if let Some(token) = &self.cancellation
            && token.is_cancelled()
        {
            return Err(WipekitError::Cancelled);
        }
        let started = Instant::now();
        let value = work(index)?;
        let elapsed = started.elapsed();
        debug!(partition = index, task = label, elapsed_ms = elapsed.as_millis() as u64, "partition done");
        if let Some(limit) = self.partition_timeout
            && elapsed > limit
        {
            return Err(WipekitError::PartitionTimeout {
                partition: index,
                timeout_ms: limit.as_millis() as u64,
            });
        }
        Ok(value)
    }

    fn map_window<F>(
        &self,
        parts: &PartitionedDataset,
        plan: &MapPlan,
        key: &str,
        task: F,
    ) -> Result<Dataset>
    where
        F: Fn(&DataFrame, Option<&DataFrame>) -> Result<DataFrame> + Sync,
    {
        let count = parts.partition_count();
        let loaded = self.run_all(count, &plan.label, |index| {
            let df = parts.load(index)?;
            let window = PartitionWindow::scan(&df, key, plan.lookback, &plan.label)?;
            Ok((df, window))
        })?;

        let mut order: Vec<usize> = (0..count).filter(|&i| loaded[i].1.is_some()).collect();
        order.sort_by(|&a, &b| {
            let (ra, rb) = (range_of(&loaded[a].1), range_of(&loaded[b].1));
            ra.0.total_cmp(&rb.0)
                .then(ra.1.total_cmp(&rb.1))
                .then(a.cmp(&b))
        });
        for pair in order.windows(2) {
            let (prev, next) = (range_of(&loaded[pair[0]].1), range_of(&loaded[pair[1]].1));
            if next.0 < prev.1 {
                return Err(WipekitError::BackendExecution {
                    partition: pair[1],
                    source: Box::new(WipekitError::schema_mismatch(
                        ErrorContext::new()
                            .stage(plan.label.as_str())
                            .column(key)
                            .partition(pair[1]),
                        format!(
                            "ordering key range [{}, {}] overlaps partition {}",
                            next.0, next.1, pair[0]
                        ),
                    )),
                });
            }
        }

        let mut contexts: Vec<Option<DataFrame>> = vec![None; count];
        for (pos, &index) in order.iter().enumerate().skip(1) {
            contexts[index] = preceding_rows(&loaded, &order[..pos], plan.lookback)?;
        }

        let outputs = self.run_all(count, &plan.label, |index| {
            task(&loaded[index].0, contexts[index].as_ref())
        })?;
        Ok(Dataset::partitioned(InMemoryPartitions::new(outputs)))
    }
}

/// Key range and key-ordered tail of one partition.
#[derive(Debug)]
struct PartitionWindow {
    min: f64,
    max: f64,
    tail: DataFrame,
}

impl PartitionWindow {
    fn scan(df: &DataFrame, key: &str, lookback: usize, label: &str) -> Result<Option<Self>> {
        if df.height() == 0 {
            return Ok(None);
        }
        let keys = ordering_values(require_column(df, key, label)?, label)?;
        let perm = sort_permutation(&keys);
        let (Some(&first), Some(&last)) = (perm.first(), perm.last()) else {
            return Ok(None);
        };
        let start = perm.len().saturating_sub(lookback);
        Ok(Some(Self {
            min: keys[first],
            max: keys[last],
            tail: take_rows(df, &perm[start..])?,
        }))
    }
}

fn range_of(window: &Option<PartitionWindow>) -> (f64, f64) {
    window.as_ref().map_or((f64::NAN, f64::NAN), |w| (w.min, w.max))
}

/// Last `lookback` rows of the key-ordered predecessors, oldest first.
fn preceding_rows(
    loaded: &[(DataFrame, Option<PartitionWindow>)],
    predecessors: &[usize],
    lookback: usize,
) -> Result<Option<DataFrame>> {
    let mut pieces: Vec<&DataFrame> = Vec::new();
    let mut rows = 0usize;
    for &index in predecessors.iter().rev() {
        if rows >= lookback {
            break;
        }
        if let Some(window) = &loaded[index].1 {
            pieces.push(&window.tail);
            rows += window.tail.height();
        }
    }
    let mut pieces = pieces.into_iter().rev();
    let Some(first) = pieces.next() else {
        return Ok(None);
    };
    let mut context = first.clone();
    for piece in pieces {
        context.vstack_mut(piece)?;
    }
    let height = context.height();
    if height > lookback {
        context = context.slice((height - lookback) as i64, lookback);
    }
    Ok(Some(context))
}

impl ExecutionBackend for PartitionedBackend {
    fn name(&self) -> &'static str {
        "partitioned"
    }

    fn aggregate<A, F>(&self, dataset: &Dataset, map: F) -> Result<A>
    where
        A: Combine,
        F: Fn(&DataFrame) -> Result<A> + Sync,
    {
        let count = dataset.partition_count();
        debug!(partitions = count, threads = self.parallelism(), "partitioned aggregate");
        let partials = self.run_all(count, "aggregate", |index| {
            let df = dataset.load_partition(index)?;
            map(&df)
        })?;
        Ok(self.pool.install(|| tree_reduce(partials)))
    }

    fn map_partitions<F>(&self, dataset: &Dataset, plan: &MapPlan, task: F) -> Result<Dataset>
    where
        F: Fn(&DataFrame, Option<&DataFrame>) -> Result<DataFrame> + Sync,
    {
        match (dataset, plan.order_by.as_deref()) {
            (Dataset::Partitioned(parts), Some(key)) if plan.lookback > 0 => {
                self.map_window(parts, plan, key, task)
            }
            _ => {
                let count = dataset.partition_count();
                debug!(partitions = count, task = %plan.label, "partitioned map");
                let outputs = self.run_all(count, &plan.label, |index| {
                    let df = dataset.load_partition(index)?;
                    task(&df, None)
                })?;
                Ok(Dataset::partitioned(InMemoryPartitions::new(outputs)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Moments;
    use crate::utils::numeric_values;

    fn backend() -> PartitionedBackend {
        PartitionedBackend::from_config(&ExecutionConfig {
            max_parallelism: Some(4),
            partition_timeout_ms: None,
        })
        .unwrap()
    }

    fn frame() -> DataFrame {
        df!["t" => (0..20i64).collect::<Vec<_>>(), "x" => (0..20).map(|v| v as f64).collect::<Vec<_>>()]
            .unwrap()
    }

    #[test]
    fn test_aggregate_matches_eager() {
        let ds = Dataset::from_frame_partitioned(&frame(), 7).unwrap();
        let moments: Moments = backend()
            .aggregate(&ds, |df| {
                Ok(Moments::from_values(&numeric_values(require_column(df, "x", "t")?, "t")?))
            })
            .unwrap();
        assert_eq!(moments.count, 20);
        assert!((moments.mean - 9.5).abs() < 1e-12);
    }

    #[test]
    fn test_lowest_failing_partition_is_reported() {
        let ds = Dataset::from_frame_partitioned(&frame(), 8).unwrap();
        let result: Result<u64> = backend().aggregate(&ds, |df| {
            let first = numeric_values(require_column(df, "x", "t")?, "t")?[0].unwrap_or(0.0);
            if first >= 10.0 {
                Err(WipekitError::insufficient_data(ErrorContext::new(), "boom"))
            } else {
                Ok(1)
            }
        });
        match result {
            Err(WipekitError::BackendExecution { partition, source }) => {
                // rows 10.. start in partition 4 (sizes 3,3,3,3,2,2,2,2)
                assert_eq!(partition, 4);
                assert_eq!(source.context().and_then(|c| c.partition), Some(4));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cancellation_returns_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let ds = Dataset::from_frame_partitioned(&frame(), 4).unwrap();
        let result: Result<u64> = backend().with_cancellation(token).aggregate(&ds, |_| Ok(1));
        assert!(matches!(result, Err(WipekitError::Cancelled)));
    }

    #[test]
    fn test_timeout_is_reported() {
        let ds = Dataset::from_frame_partitioned(&frame(), 2).unwrap();
        let result: Result<u64> = backend()
            .with_timeout(Duration::from_millis(1))
            .aggregate(&ds, |_| {
                std::thread::sleep(Duration::from_millis(20));
                Ok(1)
            });
        let err = result.unwrap_err();
        assert_eq!(err.error_code(), "BACKEND_EXECUTION");
        assert!(matches!(err.root_cause(), WipekitError::PartitionTimeout { .. }));
    }

    #[test]
    fn test_window_context_spans_small_partitions() {
        // 17 partitions of one or two rows; lookback of 3 must reach back
        // across several of them.
        let ds = Dataset::from_frame_partitioned(&frame(), 17).unwrap();
        let plan = MapPlan::window("lag", "t", 3);
        let out = backend()
            .map_partitions(&ds, &plan, |df, ctx| {
                let first_t = df.column("t")?.as_materialized_series().i64()?.get(0);
                let expected = first_t.map_or(0, |t| t.min(3)) as usize;
                assert_eq!(ctx.map_or(0, DataFrame::height), expected);
                Ok(df.clone())
            })
            .unwrap();
        assert_eq!(out.collect().unwrap().height(), 20);
    }

    #[test]
    fn test_window_overlap_is_rejected() {
        let a = df!["t" => [1i64, 5], "x" => [1.0, 2.0]].unwrap();
        let b = df!["t" => [3i64, 8], "x" => [3.0, 4.0]].unwrap();
        let ds = Dataset::partitioned(InMemoryPartitions::new(vec![a, b]));
        let err = backend()
            .map_partitions(&ds, &MapPlan::window("lag", "t", 1), |df, _| Ok(df.clone()))
            .unwrap_err();
        assert!(matches!(err, WipekitError::BackendExecution { partition: 1, .. }));
    }

    #[test]
    fn test_window_partitions_out_of_order() {
        let late = df!["t" => [10i64, 11], "x" => [1.0, 2.0]].unwrap();
        let early = df!["t" => [1i64, 2], "x" => [3.0, 4.0]].unwrap();
        let ds = Dataset::partitioned(InMemoryPartitions::new(vec![late, early]));
        let out = backend()
            .map_partitions(&ds, &MapPlan::window("lag", "t", 1), |df, ctx| {
                let first_t = df.column("t")?.as_materialized_series().i64()?.get(0);
                if first_t == Some(10) {
                    let ctx_t = ctx.unwrap().column("t")?.as_materialized_series().i64()?.get(0);
                    assert_eq!(ctx_t, Some(2));
                } else {
                    assert!(ctx.is_none());
                }
                Ok(df.clone())
            })
            .unwrap();
        // output keeps the input partition order
        let t = out.collect().unwrap();
        let first = t.column("t").unwrap().as_materialized_series().i64().unwrap().get(0);
        assert_eq!(first, Some(10));
    }
}
