use crate::sweep::{SweepPoint, SweepResult};
use serde::{Deserialize, Serialize};

/// Success rate (percent) below which a sweep point counts as broken.
pub const BREAKING_POINT_THRESHOLD_PCT: f64 = 90.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakThroughput {
    pub throughput_bps: f64,
    pub client_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakingPoint {
    pub client_count: Option<u32>,
    pub threshold_pct: f64,
    pub detected: bool,
}

/// Ratios between the largest and smallest client counts. `None` where undefined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalingEfficiency {
    pub throughput_ratio: Option<f64>,
    pub client_ratio: Option<f64>,
    pub efficiency_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub client_count: u32,
    pub throughput_per_client_bps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub total_points: usize,
    pub client_range: Option<(u32, u32)>,
    pub peak: Option<PeakThroughput>,
    pub breaking_point: BreakingPoint,
    pub scaling: ScalingEfficiency,
    /// Ordered by ascending client count.
    pub per_client_trend: Vec<TrendPoint>,
    pub per_client_change_pct: Option<f64>,
    pub monotonic_degradation: bool,
}

pub fn analyze(sweep: &SweepResult) -> AnalysisReport {
    analyze_with_threshold(sweep, BREAKING_POINT_THRESHOLD_PCT)
}

pub fn analyze_with_threshold(sweep: &SweepResult, threshold_pct: f64) -> AnalysisReport {
    // stable sort keeps input order between equal client counts
    let mut by_clients: Vec<&SweepPoint> = sweep.points.iter().collect();
    by_clients.sort_by_key(|p| p.client_count);

    let client_range = by_clients
        .first()
        .zip(by_clients.last())
        .map(|(min, max)| (min.client_count, max.client_count));

    let per_client_trend: Vec<TrendPoint> = by_clients
        .iter()
        .map(|p| TrendPoint {
            client_count: p.client_count,
            throughput_per_client_bps: per_client(p),
        })
        .collect();

    let breaking = by_clients
        .iter()
        .find(|p| p.summary.success_rate_pct < threshold_pct)
        .map(|p| p.client_count);

    AnalysisReport {
        total_points: sweep.points.len(),
        client_range,
        peak: peak(&sweep.points),
        breaking_point: BreakingPoint {
            client_count: breaking,
            threshold_pct,
            detected: breaking.is_some(),
        },
        scaling: scaling(&by_clients),
        per_client_change_pct: change_pct(&per_client_trend),
        monotonic_degradation: is_degrading(&per_client_trend),
        per_client_trend,
    }
}

fn per_client(point: &SweepPoint) -> f64 {
    point.summary.aggregate_throughput_bps / f64::from(point.client_count.max(1))
}

fn peak(points: &[SweepPoint]) -> Option<PeakThroughput> {
    let mut best: Option<&SweepPoint> = None;
    for point in points {
        let better = best.is_none_or(|b| {
            point.summary.aggregate_throughput_bps > b.summary.aggregate_throughput_bps
        });
        if better {
            best = Some(point);
        }
    }
    best.map(|p| PeakThroughput {
        throughput_bps: p.summary.aggregate_throughput_bps,
        client_count: p.client_count,
    })
}

fn scaling(by_clients: &[&SweepPoint]) -> ScalingEfficiency {
    let (Some(min), Some(max)) = (by_clients.first(), by_clients.last()) else {
        return ScalingEfficiency::default();
    };
    if min.client_count == max.client_count || min.client_count == 0 {
        return ScalingEfficiency::default();
    }

    let client_ratio = f64::from(max.client_count) / f64::from(min.client_count);
    let reference = min.summary.aggregate_throughput_bps;
    let throughput_ratio =
        (reference > 0.0).then(|| max.summary.aggregate_throughput_bps / reference);

    ScalingEfficiency {
        throughput_ratio,
        client_ratio: Some(client_ratio),
        efficiency_pct: throughput_ratio.map(|ratio| ratio / client_ratio * 100.0),
    }
}

fn change_pct(trend: &[TrendPoint]) -> Option<f64> {
    let (first, last) = (trend.first()?, trend.last()?);
    if trend.len() < 2 || first.throughput_per_client_bps <= 0.0 {
        return None;
    }
    Some(
        (last.throughput_per_client_bps - first.throughput_per_client_bps)
            / first.throughput_per_client_bps
            * 100.0,
    )
}

fn is_degrading(trend: &[TrendPoint]) -> bool {
    trend.len() >= 2
        && trend
            .windows(2)
            .all(|w| w[1].throughput_per_client_bps <= w[0].throughput_per_client_bps)
        && trend[trend.len() - 1].throughput_per_client_bps < trend[0].throughput_per_client_bps
}
