//! Combinable partial aggregates.
//!
//! Every statistic the pipeline needs is built per partition and then merged
//! with [`Combine::combine`]. Merges are associative and commutative, so the
//! result does not depend on how the data was split or in which order the
//! partitions finished. Integer-valued parts (counts, bucket tallies, min/max)
//! merge exactly; floating-point moments use Chan's parallel update and agree
//! across partitionings up to rounding.

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

/// Associative, commutative merge of two partial aggregates.
///
/// `Default` is the identity element: combining with it leaves the other side
/// unchanged. Backends use it for datasets with zero partitions.
pub trait Combine: Sized + Send + Default {
    fn combine(self, other: Self) -> Self;
}

impl Combine for u64 {
    fn combine(self, other: Self) -> Self {
        self + other
    }
}

impl<T: Combine> Combine for Option<T> {
    fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Some(a), Some(b)) => Some(a.combine(b)),
            (a, None) => a,
            (None, b) => b,
        }
    }
}

impl<T: Combine> Combine for BTreeMap<String, T> {
    fn combine(mut self, other: Self) -> Self {
        for (key, value) in other {
            let merged = match self.remove(&key) {
                Some(existing) => existing.combine(value),
                None => value,
            };
            self.insert(key, merged);
        }
        self
    }
}

impl<A: Combine, B: Combine> Combine for (A, B) {
    fn combine(self, other: Self) -> Self {
        (self.0.combine(other.0), self.1.combine(other.1))
    }
}

// =============================================================================
// Moments
// =============================================================================

/// Count, mean, sum of squared deviations, min and max of a numeric column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Moments {
    /// Build from a slice of optional values, skipping nulls and NaN.
    pub fn from_values(values: &[Option<f64>]) -> Self {
        let mut moments = Self::default();
        for value in values.iter().flatten() {
            moments.observe(*value);
        }
        moments
    }

    /// Welford update with a single value.
    pub fn observe(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    /// Population variance, `None` on an empty column.
    pub fn population_variance(&self) -> Option<f64> {
        (self.count > 0).then(|| self.m2 / self.count as f64)
    }

    /// Sample variance (n - 1 denominator), `None` below two values.
    pub fn sample_variance(&self) -> Option<f64> {
        (self.count > 1).then(|| self.m2 / (self.count - 1) as f64)
    }

    pub fn sample_std(&self) -> Option<f64> {
        self.sample_variance().map(|v| v.max(0.0).sqrt())
    }
}

impl Combine for Moments {
    fn combine(self, other: Self) -> Self {
        if self.count == 0 {
            return other;
        }
        if other.count == 0 {
            return self;
        }
        let n_a = self.count as f64;
        let n_b = other.count as f64;
        let count = self.count + other.count;
        let n = count as f64;
        let delta = other.mean - self.mean;
        // Weighted form keeps the merge symmetric in its arguments.
        let mean = (n_a * self.mean + n_b * other.mean) / n;
        let m2 = self.m2 + other.m2 + delta * delta * n_a * n_b / n;
        Self {
            count,
            mean,
            m2,
            min: min_opt(self.min, other.min),
            max: max_opt(self.max, other.max),
        }
    }
}

fn min_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn max_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

// =============================================================================
// Frequencies
// =============================================================================

/// Category counts plus the number of nulls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frequencies {
    pub counts: BTreeMap<String, u64>,
    pub nulls: u64,
}

impl Frequencies {
    pub fn from_values(values: &[Option<String>]) -> Self {
        let mut freq = Self::default();
        for value in values {
            freq.observe(value.as_deref());
        }
        freq
    }

    pub fn observe(&mut self, value: Option<&str>) {
        match value {
            Some(v) => *self.counts.entry(v.to_string()).or_insert(0) += 1,
            None => self.nulls += 1,
        }
    }

    /// Number of non-null observations.
    pub fn non_null(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn cardinality(&self) -> usize {
        self.counts.len()
    }

    /// Known categories in lexicographic order.
    pub fn categories(&self) -> Vec<String> {
        self.counts.keys().cloned().collect()
    }

    /// Most frequent category; ties resolve to the lexicographically
    /// smallest label.
    pub fn mode(&self) -> Option<&str> {
        let mut best: Option<(&str, u64)> = None;
        for (label, &count) in &self.counts {
            if best.is_none_or(|(_, c)| count > c) {
                best = Some((label.as_str(), count));
            }
        }
        best.map(|(label, _)| label)
    }
}

impl Combine for Frequencies {
    fn combine(mut self, other: Self) -> Self {
        for (label, count) in other.counts {
            *self.counts.entry(label).or_insert(0) += count;
        }
        self.nulls += other.nulls;
        self
    }
}

// =============================================================================
// Quantile sketch
// =============================================================================

/// Default relative accuracy of [`QuantileSketch`].
pub const DEFAULT_SKETCH_ACCURACY: f64 = 0.01;

/// Up to this many values are also kept verbatim so small columns get exact
/// quantiles.
pub const EXACT_VALUE_LIMIT: usize = 2048;

/// Position of a sketch bucket on the real line.
///
/// Derived ordering sorts negative buckets by descending magnitude, then the
/// zero bucket, then positive buckets by ascending magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BucketPos {
    Negative(Reverse<i32>),
    Zero,
    Positive(i32),
}

/// Log-bucketed quantile sketch with bounded relative error.
///
/// Values are mapped to buckets `ceil(log_gamma(|x|))` with
/// `gamma = (1 + alpha) / (1 - alpha)`. Bucket tallies are integers, so the
/// merge is exact and any quantile read from a merged sketch is the same no
/// matter how the input was partitioned. While the total stays under
/// [`EXACT_VALUE_LIMIT`] the raw values are kept as well and quantiles are
/// computed exactly with linear interpolation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileSketch {
    pub relative_accuracy: f64,
    pub count: u64,
    pub zero_count: u64,
    pub positive: BTreeMap<i32, u64>,
    pub negative: BTreeMap<i32, u64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<Vec<f64>>,
}

impl Default for QuantileSketch {
    fn default() -> Self {
        Self::new(DEFAULT_SKETCH_ACCURACY)
    }
}

impl QuantileSketch {
    pub fn new(relative_accuracy: f64) -> Self {
        Self {
            relative_accuracy,
            count: 0,
            zero_count: 0,
            positive: BTreeMap::new(),
            negative: BTreeMap::new(),
            min: None,
            max: None,
            exact: Some(Vec::new()),
        }
    }

    pub fn from_values(values: &[Option<f64>], relative_accuracy: f64) -> Self {
        let mut sketch = Self::new(relative_accuracy);
        for value in values.iter().flatten() {
            sketch.observe(*value);
        }
        sketch
    }

    fn gamma(&self) -> f64 {
        (1.0 + self.relative_accuracy) / (1.0 - self.relative_accuracy)
    }

    fn key(&self, magnitude: f64) -> i32 {
        (magnitude.ln() / self.gamma().ln()).ceil() as i32
    }

    fn bucket_value(&self, key: i32) -> f64 {
        let gamma = self.gamma();
        2.0 * gamma.powi(key) / (gamma + 1.0)
    }

    pub fn observe(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;
        if value == 0.0 {
            self.zero_count += 1;
        } else if value > 0.0 {
            *self.positive.entry(self.key(value)).or_insert(0) += 1;
        } else {
            *self.negative.entry(self.key(-value)).or_insert(0) += 1;
        }
        self.min = min_opt(self.min, Some(value));
        self.max = max_opt(self.max, Some(value));
        if let Some(exact) = self.exact.as_mut() {
            if exact.len() < EXACT_VALUE_LIMIT {
                exact.push(value);
            } else {
                self.exact = None;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Bucket tallies in ascending value order.
    pub fn buckets(&self) -> Vec<(BucketPos, u64)> {
        let mut out = Vec::with_capacity(self.negative.len() + self.positive.len() + 1);
        for (&key, &count) in self.negative.iter().rev() {
            out.push((BucketPos::Negative(Reverse(key)), count));
        }
        if self.zero_count > 0 {
            out.push((BucketPos::Zero, self.zero_count));
        }
        for (&key, &count) in &self.positive {
            out.push((BucketPos::Positive(key), count));
        }
        out
    }

    /// Estimate of the `q`-quantile, `q` in [0, 1]. `None` when empty.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let q = q.clamp(0.0, 1.0);
        if let Some(exact) = &self.exact {
            let mut sorted = exact.clone();
            sorted.sort_by(f64::total_cmp);
            let pos = q * (sorted.len() - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            return Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac);
        }
        if q == 0.0 {
            return self.min;
        }
        if q == 1.0 {
            return self.max;
        }
        let rank = (q * (self.count - 1) as f64).floor() as u64;
        let mut seen = 0u64;
        for (pos, count) in self.buckets() {
            seen += count;
            if seen > rank {
                let estimate = match pos {
                    BucketPos::Negative(Reverse(key)) => -self.bucket_value(key),
                    BucketPos::Zero => 0.0,
                    BucketPos::Positive(key) => self.bucket_value(key),
                };
                let lo = self.min.unwrap_or(estimate);
                let hi = self.max.unwrap_or(estimate);
                return Some(estimate.clamp(lo, hi));
            }
        }
        self.max
    }

    /// The `i / n` quantiles for `i` in `1..n`, with repeated edges
    /// collapsed. Empty when the sketch is.
    pub fn interior_quantiles(&self, n: usize) -> Vec<f64> {
        let mut edges: Vec<f64> = (1..n)
            .filter_map(|i| self.quantile(i as f64 / n as f64))
            .collect();
        edges.dedup();
        edges
    }
}

impl Combine for QuantileSketch {
    fn combine(mut self, other: Self) -> Self {
        if other.count == 0 {
            return self;
        }
        if self.count == 0 {
            return other;
        }
        debug_assert_eq!(
            self.relative_accuracy, other.relative_accuracy,
            "sketches with different accuracy cannot be merged"
        );
        self.count += other.count;
        self.zero_count += other.zero_count;
        for (key, count) in other.positive {
            *self.positive.entry(key).or_insert(0) += count;
        }
        for (key, count) in other.negative {
            *self.negative.entry(key).or_insert(0) += count;
        }
        self.min = min_opt(self.min, other.min);
        self.max = max_opt(self.max, other.max);
        self.exact = match (self.exact, other.exact) {
            (Some(mut a), Some(b)) if a.len() + b.len() <= EXACT_VALUE_LIMIT => {
                a.extend(b);
                Some(a)
            }
            _ => None,
        };
        self
    }
}

// =============================================================================
// Histogram
// =============================================================================

/// Counts over fixed bin edges.
///
/// With `k` edges there are `k + 1` bins: `(-inf, e0]`, `(e0, e1]`, ...,
/// `(e_{k-1}, +inf)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub edges: Vec<f64>,
    pub counts: Vec<u64>,
}

impl Histogram {
    pub fn new(edges: Vec<f64>) -> Self {
        let counts = vec![0; edges.len() + 1];
        Self { edges, counts }
    }

    pub fn from_values(edges: Vec<f64>, values: &[Option<f64>]) -> Self {
        let mut hist = Self::new(edges);
        for value in values.iter().flatten() {
            hist.observe(*value);
        }
        hist
    }

    pub fn bin_of(&self, value: f64) -> usize {
        self.edges.partition_point(|&edge| edge < value)
    }

    pub fn observe(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        let bin = self.bin_of(value);
        self.counts[bin] += 1;
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Share of observations per bin; all zeros when empty.
    pub fn proportions(&self) -> Vec<f64> {
        let total = self.total();
        self.counts
            .iter()
            .map(|&c| if total == 0 { 0.0 } else { c as f64 / total as f64 })
            .collect()
    }
}

impl Combine for Histogram {
    fn combine(mut self, other: Self) -> Self {
        if self.counts.is_empty() {
            return other;
        }
        if other.counts.is_empty() {
            return self;
        }
        debug_assert_eq!(self.edges, other.edges, "histograms with different edges");
        for (mine, theirs) in self.counts.iter_mut().zip(other.counts) {
            *mine += theirs;
        }
        self
    }
}

// =============================================================================
// Schema inference statistics
// =============================================================================

/// Physical storage class seen for a column across partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhysicalKind {
    #[default]
    Null,
    Numeric,
    Temporal,
    Boolean,
    String,
    Other,
}

impl PhysicalKind {
    /// Mixed storage across partitions degrades to strings.
    fn merge(self, other: Self) -> Self {
        match (self, other) {
            (a, b) if a == b => a,
            (PhysicalKind::Null, b) => b,
            (a, PhysicalKind::Null) => a,
            _ => PhysicalKind::String,
        }
    }
}

/// Evidence gathered per column to propose a logical type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceStats {
    pub physical: PhysicalKind,
    pub rows: u64,
    pub nulls: u64,
    /// Non-null values that are numbers or parse as numbers.
    pub numeric_like: u64,
    /// Non-null values that are temporal or match a date pattern.
    pub temporal_like: u64,
    pub distinct: BTreeSet<String>,
    pub distinct_limit: usize,
    /// Set once more than `distinct_limit` values were seen.
    pub saturated: bool,
}

impl Default for InferenceStats {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl InferenceStats {
    pub fn new(distinct_limit: usize) -> Self {
        Self {
            physical: PhysicalKind::Null,
            rows: 0,
            nulls: 0,
            numeric_like: 0,
            temporal_like: 0,
            distinct: BTreeSet::new(),
            distinct_limit,
            saturated: false,
        }
    }

    pub fn non_null(&self) -> u64 {
        self.rows - self.nulls
    }

    pub fn track_distinct(&mut self, value: &str) {
        if self.saturated {
            return;
        }
        if !self.distinct.contains(value) {
            self.distinct.insert(value.to_string());
            if self.distinct.len() > self.distinct_limit {
                self.saturated = true;
                self.distinct.clear();
            }
        }
    }
}

impl Combine for InferenceStats {
    fn combine(mut self, other: Self) -> Self {
        self.physical = self.physical.merge(other.physical);
        self.rows += other.rows;
        self.nulls += other.nulls;
        self.numeric_like += other.numeric_like;
        self.temporal_like += other.temporal_like;
        self.distinct_limit = self.distinct_limit.min(other.distinct_limit);
        self.saturated |= other.saturated;
        if self.saturated {
            self.distinct.clear();
        } else {
            self.distinct.extend(other.distinct);
            if self.distinct.len() > self.distinct_limit {
                self.saturated = true;
                self.distinct.clear();
            }
        }
        self
    }
}

// =============================================================================
// Stage accumulators
// =============================================================================

/// Partial statistics for one target column of a stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnAccumulator {
    /// Rows seen, including nulls.
    pub rows: u64,
    pub moments: Option<Moments>,
    pub frequencies: Option<Frequencies>,
    pub sketch: Option<QuantileSketch>,
}

impl ColumnAccumulator {
    pub fn numeric(values: &[Option<f64>]) -> Self {
        Self {
            rows: values.len() as u64,
            moments: Some(Moments::from_values(values)),
            ..Default::default()
        }
    }

    pub fn numeric_with_sketch(values: &[Option<f64>], relative_accuracy: f64) -> Self {
        Self {
            sketch: Some(QuantileSketch::from_values(values, relative_accuracy)),
            ..Self::numeric(values)
        }
    }

    pub fn categorical(values: &[Option<String>]) -> Self {
        Self {
            rows: values.len() as u64,
            frequencies: Some(Frequencies::from_values(values)),
            ..Default::default()
        }
    }
}

impl Combine for ColumnAccumulator {
    fn combine(self, other: Self) -> Self {
        Self {
            rows: self.rows + other.rows,
            moments: self.moments.combine(other.moments),
            frequencies: self.frequencies.combine(other.frequencies),
            sketch: self.sketch.combine(other.sketch),
        }
    }
}

/// Everything a stage collects from one partition, keyed by column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageAccumulator {
    pub columns: BTreeMap<String, ColumnAccumulator>,
}

impl StageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, acc: ColumnAccumulator) {
        self.columns.insert(column.into(), acc);
    }

    pub fn column(&self, name: &str) -> Option<&ColumnAccumulator> {
        self.columns.get(name)
    }
}

impl Combine for StageAccumulator {
    fn combine(self, other: Self) -> Self {
        Self {
            columns: self.columns.combine(other.columns),
        }
    }
}
