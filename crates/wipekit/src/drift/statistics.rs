//! Distribution distance statistics.

use crate::backend::{BucketPos, Frequencies, QuantileSketch};
use std::collections::BTreeMap;

/// Population stability index between two proportion vectors of equal
/// length. Proportions are floored at `epsilon` so empty bins stay finite.
pub fn psi(reference: &[f64], observed: &[f64], epsilon: f64) -> f64 {
    reference
        .iter()
        .zip(observed)
        .map(|(&r, &o)| {
            let r = r.max(epsilon);
            let o = o.max(epsilon);
            (o - r) * (o / r).ln()
        })
        .sum()
}

/// Proportions of the reference categories plus one trailing unseen bucket,
/// for both sides.
pub fn category_proportions(reference: &Frequencies, observed: &Frequencies) -> (Vec<f64>, Vec<f64>) {
    let ref_total = reference.non_null() as f64;
    let obs_total = observed.non_null() as f64;
    let share = |count: u64, total: f64| if total > 0.0 { count as f64 / total } else { 0.0 };

    let mut ref_props = Vec::with_capacity(reference.counts.len() + 1);
    let mut obs_props = Vec::with_capacity(reference.counts.len() + 1);
    for (label, &count) in &reference.counts {
        ref_props.push(share(count, ref_total));
        obs_props.push(share(observed.counts.get(label).copied().unwrap_or(0), obs_total));
    }
    let unseen: u64 = observed
        .counts
        .iter()
        .filter(|(label, _)| !reference.counts.contains_key(*label))
        .map(|(_, &count)| count)
        .sum();
    ref_props.push(0.0);
    obs_props.push(share(unseen, obs_total));
    (ref_props, obs_props)
}

/// Two-sample Kolmogorov-Smirnov statistic: the largest gap between the
/// empirical CDFs.
///
/// Exact when both sketches still hold their raw values; otherwise the CDFs
/// are compared at every bucket boundary, which needs both sketches built
/// with the same accuracy.
pub fn ks_statistic(reference: &QuantileSketch, observed: &QuantileSketch) -> f64 {
    if reference.count == 0 || observed.count == 0 {
        return 0.0;
    }
    if let (Some(a), Some(b)) = (&reference.exact, &observed.exact) {
        return exact_ks(a, b);
    }
    let mut union: BTreeMap<BucketPos, (u64, u64)> = BTreeMap::new();
    for (pos, count) in reference.buckets() {
        union.entry(pos).or_default().0 += count;
    }
    for (pos, count) in observed.buckets() {
        union.entry(pos).or_default().1 += count;
    }
    let (n_ref, n_obs) = (reference.count as f64, observed.count as f64);
    let (mut cum_ref, mut cum_obs) = (0u64, 0u64);
    let mut max_gap: f64 = 0.0;
    for (a, b) in union.into_values() {
        cum_ref += a;
        cum_obs += b;
        max_gap = max_gap.max((cum_ref as f64 / n_ref - cum_obs as f64 / n_obs).abs());
    }
    max_gap
}

fn exact_ks(reference: &[f64], observed: &[f64]) -> f64 {
    let mut a = reference.to_vec();
    let mut b = observed.to_vec();
    a.sort_by(f64::total_cmp);
    b.sort_by(f64::total_cmp);
    let (n, m) = (a.len() as f64, b.len() as f64);
    let (mut i, mut j) = (0, 0);
    let mut max_gap: f64 = 0.0;
    while i < a.len() && j < b.len() {
        let x = a[i].min(b[j]);
        while i < a.len() && a[i] <= x {
            i += 1;
        }
        while j < b.len() && b[j] <= x {
            j += 1;
        }
        max_gap = max_gap.max((i as f64 / n - j as f64 / m).abs());
    }
    max_gap.max((i as f64 / n - j as f64 / m).abs())
}
