//! Aggregates derived from the cached record set.
//!
//! Everything here is a pure function of `&[DetectionRecord]`. Stats are
//! recomputed in full after every successful refresh; nothing is updated
//! incrementally.

use serde::Serialize;

use crate::record::{DetectionRecord, RecordId};

pub const DEFAULT_SERIES_WINDOW: usize = 20;
/// A chart needs at least this many points.
pub const MIN_SERIES_POINTS: usize = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct PerCategory<T> {
    pub cascos: T,
    pub chalecos: T,
    pub gafas: T,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Incumplimientos {
    pub cascos: usize,
    pub chalecos: usize,
    pub gafas: usize,
    /// Worst category, not a sum.
    pub total: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct AggregateStats {
    pub total_registros: usize,
    pub total_personas: u64,
    pub max_personas: u32,
    /// Smallest non-zero head count; 0 when no record saw anyone.
    pub min_personas: u32,
    /// Mean of the three category means.
    pub avg_cumplimiento: f64,
    pub cumplimiento: PerCategory<f64>,
    pub incumplimientos: Incumplimientos,
}

pub fn compute_stats(records: &[DetectionRecord]) -> AggregateStats {
    if records.is_empty() {
        return AggregateStats::default();
    }
    let n = records.len() as f64;
    let mean = |f: fn(&DetectionRecord) -> f64| records.iter().map(f).sum::<f64>() / n;
    let below_full = |f: fn(&DetectionRecord) -> f64| {
        records.iter().filter(|r| f(r) < 100.0).count()
    };

    let cumplimiento = PerCategory {
        cascos: mean(|r| r.cumplimiento_cascos),
        chalecos: mean(|r| r.cumplimiento_chalecos),
        gafas: mean(|r| r.cumplimiento_gafas),
    };
    let cascos = below_full(|r| r.cumplimiento_cascos);
    let chalecos = below_full(|r| r.cumplimiento_chalecos);
    let gafas = below_full(|r| r.cumplimiento_gafas);

    AggregateStats {
        total_registros: records.len(),
        total_personas: records.iter().map(|r| r.total_personas as u64).sum(),
        max_personas: records.iter().map(|r| r.total_personas).max().unwrap_or(0),
        min_personas: records
            .iter()
            .map(|r| r.total_personas)
            .filter(|p| *p > 0)
            .min()
            .unwrap_or(0),
        avg_cumplimiento: (cumplimiento.cascos + cumplimiento.chalecos + cumplimiento.gafas) / 3.0,
        cumplimiento,
        incumplimientos: Incumplimientos {
            cascos,
            chalecos,
            gafas,
            total: cascos.max(chalecos).max(gafas),
        },
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub id: RecordId,
    pub timestamp: Option<String>,
    pub cumplimiento_general: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Series {
    /// Fewer than [`MIN_SERIES_POINTS`] records fell inside the window.
    InsufficientData { available: usize },
    /// Oldest first.
    Points(Vec<SeriesPoint>),
}

impl Series {
    pub fn points(&self) -> &[SeriesPoint] {
        match self {
            Series::Points(points) => points,
            Series::InsufficientData { .. } => &[],
        }
    }
}

/// Takes the newest `window` records (input is newest-first, as the backend
/// returns it) and lays them out oldest-first for plotting.
pub fn build_series(records: &[DetectionRecord], window: usize) -> Series {
    let take = records.len().min(window);
    if take < MIN_SERIES_POINTS {
        return Series::InsufficientData { available: take };
    }
    Series::Points(
        records[..take]
            .iter()
            .rev()
            .map(|r| SeriesPoint {
                id: r.id,
                timestamp: r.timestamp.clone(),
                cumplimiento_general: r.cumplimiento_general,
            })
            .collect(),
    )
}

/// Severity bands, ordered from worst to best.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ComplianceBand {
    Critical,
    Danger,
    Warning,
    Success,
}

impl ComplianceBand {
    pub fn as_str(self) -> &'static str {
        match self {
            ComplianceBand::Critical => "critical",
            ComplianceBand::Danger => "danger",
            ComplianceBand::Warning => "warning",
            ComplianceBand::Success => "success",
        }
    }
}

/// `[0,10)` critical, `[10,41)` danger, `[41,80)` warning, `[80,100]` success.
/// A missing or NaN percentage classifies as 0.
pub fn classify_compliance(pct: impl Into<Option<f64>>) -> ComplianceBand {
    let pct = pct.into().filter(|p| !p.is_nan()).unwrap_or(0.0);
    if pct < 10.0 {
        ComplianceBand::Critical
    } else if pct < 41.0 {
        ComplianceBand::Danger
    } else if pct < 80.0 {
        ComplianceBand::Warning
    } else {
        ComplianceBand::Success
    }
}

/// Qualitative grade the backend attaches to overall compliance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ComplianceRating {
    MuyMalo,
    Malo,
    Regular,
    Bueno,
    Excelente,
}

impl ComplianceRating {
    pub fn label(self) -> &'static str {
        match self {
            ComplianceRating::MuyMalo => "Muy Malo",
            ComplianceRating::Malo => "Malo",
            ComplianceRating::Regular => "Regular",
            ComplianceRating::Bueno => "Bueno",
            ComplianceRating::Excelente => "Excelente",
        }
    }
}

pub fn rate_compliance(pct: f64) -> ComplianceRating {
    match pct {
        p if p >= 90.0 => ComplianceRating::Excelente,
        p if p >= 75.0 => ComplianceRating::Bueno,
        p if p >= 60.0 => ComplianceRating::Regular,
        p if p >= 40.0 => ComplianceRating::Malo,
        _ => ComplianceRating::MuyMalo,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, personas: u32, cascos: f64, chalecos: f64, gafas: f64) -> DetectionRecord {
        DetectionRecord {
            id,
            timestamp: None,
            total_personas: personas,
            cumplimiento_cascos: cascos,
            cumplimiento_chalecos: chalecos,
            cumplimiento_gafas: gafas,
            cumplimiento_general: 12.5,
            ruta_imagen: None,
        }
    }

    #[test]
    fn empty_set_is_all_zero() {
        let stats = compute_stats(&[]);
        assert_eq!(stats, AggregateStats::default());
        assert_eq!(stats.avg_cumplimiento, 0.0);
        assert!(!stats.cumplimiento.cascos.is_nan());
    }

    #[test]
    fn min_personas_ignores_empty_frames() {
        let zeros = [record(1, 0, 100.0, 100.0, 100.0), record(2, 0, 100.0, 100.0, 100.0)];
        assert_eq!(compute_stats(&zeros).min_personas, 0);

        let mixed = [
            record(3, 5, 100.0, 100.0, 100.0),
            record(2, 0, 100.0, 100.0, 100.0),
            record(1, 3, 100.0, 100.0, 100.0),
        ];
        let stats = compute_stats(&mixed);
        assert_eq!(stats.min_personas, 3);
        assert_eq!(stats.max_personas, 5);
        assert_eq!(stats.total_personas, 8);
        assert_eq!(stats.total_registros, 3);
    }

    #[test]
    fn averages_are_unweighted_and_overall_is_mean_of_categories() {
        let records = [record(2, 10, 100.0, 50.0, 0.0), record(1, 1, 50.0, 50.0, 30.0)];
        let stats = compute_stats(&records);
        assert_eq!(stats.cumplimiento.cascos, 75.0);
        assert_eq!(stats.cumplimiento.chalecos, 50.0);
        assert_eq!(stats.cumplimiento.gafas, 15.0);
        assert!((stats.avg_cumplimiento - 140.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn incumplimiento_total_is_worst_category() {
        // cascos below 100 in 3 records, chalecos in 1, gafas in 5
        let records = [
            record(5, 1, 90.0, 100.0, 0.0),
            record(4, 1, 90.0, 100.0, 0.0),
            record(3, 1, 90.0, 99.9, 0.0),
            record(2, 1, 100.0, 100.0, 0.0),
            record(1, 1, 100.0, 100.0, 0.0),
        ];
        let inc = compute_stats(&records).incumplimientos;
        assert_eq!((inc.cascos, inc.chalecos, inc.gafas), (3, 1, 5));
        assert_eq!(inc.total, 5);
    }

    #[test]
    fn classification_breakpoints() {
        assert_eq!(classify_compliance(9.0), ComplianceBand::Critical);
        assert_eq!(classify_compliance(9.99), ComplianceBand::Critical);
        assert_eq!(classify_compliance(10.0), ComplianceBand::Danger);
        assert_eq!(classify_compliance(40.0), ComplianceBand::Danger);
        assert_eq!(classify_compliance(41.0), ComplianceBand::Warning);
        assert_eq!(classify_compliance(79.0), ComplianceBand::Warning);
        assert_eq!(classify_compliance(80.0), ComplianceBand::Success);
        assert_eq!(classify_compliance(100.0), ComplianceBand::Success);
        assert_eq!(classify_compliance(None), ComplianceBand::Critical);
        assert_eq!(classify_compliance(f64::NAN), ComplianceBand::Critical);
        assert!(ComplianceBand::Critical < ComplianceBand::Success);
    }

    #[test]
    fn series_needs_two_points() {
        let one = [record(1, 1, 0.0, 0.0, 0.0)];
        assert_eq!(
            build_series(&one, DEFAULT_SERIES_WINDOW),
            Series::InsufficientData { available: 1 }
        );
        assert!(build_series(&[], DEFAULT_SERIES_WINDOW).points().is_empty());
    }

    #[test]
    fn series_keeps_newest_window_oldest_first() {
        // newest first, ids 25..=1
        let records: Vec<_> = (1..=25).rev().map(|id| record(id, 1, 0.0, 0.0, 0.0)).collect();
        let series = build_series(&records, DEFAULT_SERIES_WINDOW);
        let ids: Vec<u64> = series.points().iter().map(|p| p.id).collect();
        assert_eq!(ids, (6..=25).collect::<Vec<u64>>());
    }

    #[test]
    fn rating_thresholds() {
        assert_eq!(rate_compliance(95.0), ComplianceRating::Excelente);
        assert_eq!(rate_compliance(75.0), ComplianceRating::Bueno);
        assert_eq!(rate_compliance(60.0), ComplianceRating::Regular);
        assert_eq!(rate_compliance(40.0), ComplianceRating::Malo);
        assert_eq!(rate_compliance(39.9).label(), "Muy Malo");
    }
}
