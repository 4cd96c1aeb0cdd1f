//! Customer segmentation by recency, frequency and monetary value.
//!
//! Features are z-scored (recency inverted so that "more recent" is larger)
//! and clustered with Lloyd's k-means. Initial centroids are drawn from a
//! fixed-seed RNG, so the same report always yields the same segments.

use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;

use crate::domain::entities::forecast::{SegmentAssignment, SegmentSummary, SegmentationResult};
use crate::domain::entities::report::VoucherReport;
use crate::domain::errors::{PipelineError, PipelineResult};
use crate::domain::services::report_builder::{distinct_vouchers_by_party, UNSPECIFIED_PARTY};
use crate::domain::value_objects::money::Money;

pub const SEGMENTATION_SEED: u64 = 42;
pub const MIN_CUSTOMERS: usize = 3;
const MAX_CLUSTERS: usize = 4;
const MAX_ITERATIONS: usize = 100;

/// Labels in order of descending mean monetary value
const SEGMENT_LABELS: [&str; MAX_CLUSTERS] = [
    "Champions",
    "Loyal Customers",
    "Potential Loyalists",
    "At Risk",
];

#[derive(Debug, Clone, PartialEq)]
struct CustomerProfile {
    party: String,
    recency_days: i64,
    frequency: usize,
    monetary: f64,
}

fn profiles(report: &VoucherReport) -> Vec<CustomerProfile> {
    let reference = report.summary.last_date;
    let oldest_gap = match (report.summary.first_date, reference) {
        (Some(first), Some(last)) => (last - first).num_days(),
        _ => 0,
    };

    let mut latest: BTreeMap<&str, Option<NaiveDate>> = BTreeMap::new();
    let mut totals: BTreeMap<&str, Money> = BTreeMap::new();
    for v in report.vouchers.iter().filter(|v| v.party != UNSPECIFIED_PARTY) {
        let seen = latest.entry(v.party.as_str()).or_insert(None);
        *seen = (*seen).max(v.date);
        *totals.entry(v.party.as_str()).or_insert_with(Money::zero) += &v.amount;
    }

    let frequency = distinct_vouchers_by_party(report);

    // BTreeMap iteration keeps customers sorted by name
    latest
        .into_iter()
        .map(|(party, last_seen)| {
            let recency_days = match (reference, last_seen) {
                (Some(reference), Some(seen)) => (reference - seen).num_days(),
                _ => oldest_gap,
            };
            CustomerProfile {
                party: party.to_string(),
                recency_days,
                frequency: frequency.get(party).copied().unwrap_or(0),
                monetary: totals.get(party).map(|m| m.abs().to_f64()).unwrap_or(0.0),
            }
        })
        .collect()
}

/// Standardize each column to zero mean and unit variance. Constant columns
/// become all zeros.
fn standardize(rows: &mut [Vec<f64>]) {
    let Some(width) = rows.first().map(|r| r.len()) else {
        return;
    };
    let n = rows.len() as f64;
    for col in 0..width {
        let mean = rows.iter().map(|r| r[col]).sum::<f64>() / n;
        let var = rows.iter().map(|r| (r[col] - mean).powi(2)).sum::<f64>() / n;
        let std = var.sqrt();
        for row in rows.iter_mut() {
            row[col] = if std > 0.0 { (row[col] - mean) / std } else { 0.0 };
        }
    }
}

fn distance_sq(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Index of the nearest centroid, lowest index on ties
fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = distance_sq(point, c);
        if d < best_distance {
            best = i;
            best_distance = d;
        }
    }
    best
}

fn k_means(points: &[Vec<f64>], k: usize, seed: u64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids: Vec<Vec<f64>> = rand::seq::index::sample(&mut rng, points.len(), k)
        .into_iter()
        .map(|i| points[i].clone())
        .collect();

    let mut assignment = vec![usize::MAX; points.len()];
    for _ in 0..MAX_ITERATIONS {
        let next: Vec<usize> = points.iter().map(|p| nearest(p, &centroids)).collect();
        if next == assignment {
            break;
        }
        assignment = next;

        for (c, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<&Vec<f64>> = points
                .iter()
                .zip(&assignment)
                .filter(|(_, a)| **a == c)
                .map(|(p, _)| p)
                .collect();
            // empty clusters keep their previous centroid
            if members.is_empty() {
                continue;
            }
            for (dim, value) in centroid.iter_mut().enumerate() {
                *value = members.iter().map(|m| m[dim]).sum::<f64>() / members.len() as f64;
            }
        }
    }
    assignment
}

fn mean_of(
    customers: &[CustomerProfile],
    members: &[usize],
    f: impl Fn(&CustomerProfile) -> f64,
) -> f64 {
    members.iter().map(|i| f(&customers[*i])).sum::<f64>() / members.len() as f64
}

/// Segment the customers of a sales report.
///
/// Fails with `InsufficientHistory` when fewer than three customers appear.
pub fn segment(report: &VoucherReport) -> PipelineResult<SegmentationResult> {
    segment_with_seed(report, SEGMENTATION_SEED)
}

pub fn segment_with_seed(report: &VoucherReport, seed: u64) -> PipelineResult<SegmentationResult> {
    let customers = profiles(report);
    if customers.len() < MIN_CUSTOMERS {
        return Err(PipelineError::InsufficientHistory {
            required: MIN_CUSTOMERS,
            available: customers.len(),
        });
    }

    let mut features: Vec<Vec<f64>> = customers
        .iter()
        .map(|c| {
            vec![
                1.0 / (c.recency_days.max(0) as f64 + 1.0),
                c.frequency as f64,
                c.monetary,
            ]
        })
        .collect();
    standardize(&mut features);

    let k = MAX_CLUSTERS.min(customers.len());
    let assignment = k_means(&features, k, seed);

    // cluster -> member indices, only clusters that ended up non-empty
    let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, c) in assignment.iter().enumerate() {
        clusters.entry(*c).or_default().push(i);
    }

    let mut ranked: Vec<(usize, f64)> = clusters
        .iter()
        .map(|(c, members)| (*c, mean_of(&customers, members, |p| p.monetary)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut labels: BTreeMap<usize, &str> = BTreeMap::new();
    let mut segments = Vec::with_capacity(ranked.len());
    for (rank, (cluster, mean_monetary)) in ranked.into_iter().enumerate() {
        let label = SEGMENT_LABELS[rank];
        labels.insert(cluster, label);
        let members = &clusters[&cluster];
        segments.push(SegmentSummary {
            label: label.to_string(),
            members: members.len(),
            mean_recency_days: mean_of(&customers, members, |p| p.recency_days as f64),
            mean_frequency: mean_of(&customers, members, |p| p.frequency as f64),
            mean_monetary,
        });
    }

    let assignments = customers
        .iter()
        .zip(&assignment)
        .map(|(c, cluster)| SegmentAssignment {
            subject_id: c.party.clone(),
            recency_days: c.recency_days,
            frequency: c.frequency,
            monetary: c.monetary,
            segment: labels.get(cluster).copied().unwrap_or(SEGMENT_LABELS[0]).to_string(),
        })
        .collect();

    Ok(SegmentationResult {
        assignments,
        segments,
        seed,
    })
}
