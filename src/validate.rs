use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use itertools::Itertools;
use tracing::info;

use crate::error::{Result, StockError};
use crate::postprocess::BatchLogEntry;

/// A (region, batch) row count that disagrees across themes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountMismatch {
    pub region: String,
    pub batch: String,
    pub counts: Vec<(String, usize)>,
}

/// A region where more than one batch deviates from the default batch
/// size - the signature of a double-counted or mis-split batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeAnomaly {
    pub theme: String,
    pub region: String,
    pub deviants: Vec<(String, usize)>,
}

/// Post-hoc report across every theme's logs. Purely diagnostic: building
/// it never mutates any log.
#[derive(Debug, Default)]
pub struct ConsistencyReport {
    /// (theme, region) pairs where a theme is missing a region the others
    /// have.
    pub missing_regions: Vec<(String, String)>,
    /// (theme, region, batches missing from that theme).
    pub batch_mismatches: Vec<(String, String, Vec<String>)>,
    pub count_mismatches: Vec<CountMismatch>,
    pub size_anomalies: Vec<SizeAnomaly>,
    pub regions_checked: usize,
    pub themes_checked: usize,
}

impl ConsistencyReport {
    pub fn valid(&self) -> bool {
        self.missing_regions.is_empty()
            && self.batch_mismatches.is_empty()
            && self.count_mismatches.is_empty()
            && self.size_anomalies.is_empty()
    }
}

impl fmt::Display for ConsistencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "consistency: {} ({} themes, {} regions)",
            if self.valid() { "PASSED" } else { "FAILED" },
            self.themes_checked,
            self.regions_checked
        )?;
        for (theme, region) in &self.missing_regions {
            writeln!(f, "  theme {theme} missing region {region}")?;
        }
        for (theme, region, batches) in &self.batch_mismatches {
            writeln!(f, "  theme {theme} region {region} missing batches {batches:?}")?;
        }
        for m in &self.count_mismatches {
            writeln!(
                f,
                "  region {} batch {} row counts disagree: {:?}",
                m.region, m.batch, m.counts
            )?;
        }
        for a in &self.size_anomalies {
            writeln!(
                f,
                "  theme {} region {} has {} non-default batches: {:?}",
                a.theme,
                a.region,
                a.deviants.len(),
                a.deviants
            )?;
        }
        Ok(())
    }
}

fn batches_by_region(entries: &[BatchLogEntry]) -> BTreeMap<String, BTreeMap<String, usize>> {
    let mut map: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
    for entry in entries {
        map.entry(entry.region.clone())
            .or_default()
            .insert(entry.batch.clone(), entry.len);
    }
    map
}

/// Cross-check the per-theme log registries: every theme covers every
/// region, agrees batch-for-batch, row-for-row, and no region carries more
/// than one odd-sized batch.
pub fn run_consistency_checks(
    themes: &HashMap<String, Vec<BatchLogEntry>>,
    default_batch_size: usize,
) -> ConsistencyReport {
    let mut report = ConsistencyReport {
        themes_checked: themes.len(),
        ..Default::default()
    };

    let by_theme: BTreeMap<&str, BTreeMap<String, BTreeMap<String, usize>>> = themes
        .iter()
        .map(|(theme, entries)| (theme.as_str(), batches_by_region(entries)))
        .collect();

    let all_regions: BTreeSet<&str> = by_theme
        .values()
        .flat_map(|regions| regions.keys().map(String::as_str))
        .collect();
    report.regions_checked = all_regions.len();

    for (theme, regions) in &by_theme {
        for region in &all_regions {
            if !regions.contains_key(*region) {
                report
                    .missing_regions
                    .push((theme.to_string(), region.to_string()));
            }
        }
    }

    // batch sets per region must match across themes
    for region in &all_regions {
        let all_batches: BTreeSet<&str> = by_theme
            .values()
            .filter_map(|regions| regions.get(*region))
            .flat_map(|batches| batches.keys().map(String::as_str))
            .collect();
        for (theme, regions) in &by_theme {
            let Some(batches) = regions.get(*region) else {
                continue; // already reported as a missing region
            };
            let missing: Vec<String> = all_batches
                .iter()
                .filter(|b| !batches.contains_key(**b))
                .map(|b| b.to_string())
                .collect();
            if !missing.is_empty() {
                report
                    .batch_mismatches
                    .push((theme.to_string(), region.to_string(), missing));
            }
        }

        for batch in &all_batches {
            let counts: Vec<(String, usize)> = by_theme
                .iter()
                .filter_map(|(theme, regions)| {
                    regions
                        .get(*region)
                        .and_then(|batches| batches.get(*batch))
                        .map(|len| (theme.to_string(), *len))
                })
                .collect();
            if counts.iter().map(|(_, len)| len).unique().count() > 1 {
                report.count_mismatches.push(CountMismatch {
                    region: region.to_string(),
                    batch: batch.to_string(),
                    counts,
                });
            }
        }
    }

    for (theme, regions) in &by_theme {
        for (region, batches) in regions {
            let deviants: Vec<(String, usize)> = batches
                .iter()
                .filter(|(_, len)| **len != default_batch_size)
                .map(|(batch, len)| (batch.clone(), *len))
                .collect();
            if deviants.len() > 1 {
                report.size_anomalies.push(SizeAnomaly {
                    theme: theme.to_string(),
                    region: region.clone(),
                    deviants,
                });
            }
        }
    }

    info!(valid = report.valid(), "consistency checks complete");
    report
}

/// One postcode's derived degree days, annual and by season.
#[derive(Debug, Clone)]
pub struct DegreeDayRow {
    pub key: String,
    pub annual: f64,
    pub summer: f64,
    pub winter: f64,
}

/// The two seasonal halves must reassemble into the annual total. Anything
/// beyond the tolerance means the seasonal split dropped or double-counted
/// months.
pub fn check_seasonal_consistency(
    metric: &str,
    rows: &[DegreeDayRow],
    tolerance: f64,
) -> Result<()> {
    let breaches = rows
        .iter()
        .filter(|row| (row.summer + row.winter - row.annual).abs() > tolerance)
        .count();
    if breaches > 0 {
        return Err(StockError::Tolerance {
            metric: metric.to_owned(),
            tolerance,
            count: breaches,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(region: &str, batch: &str, len: usize) -> BatchLogEntry {
        BatchLogEntry {
            path: format!("intermediate_data/x/{region}/{batch}_log_file.csv"),
            region: region.to_owned(),
            batch: batch.to_owned(),
            len,
        }
    }

    fn themes(
        fuel: Vec<BatchLogEntry>,
        age: Vec<BatchLogEntry>,
        ty: Vec<BatchLogEntry>,
    ) -> HashMap<String, Vec<BatchLogEntry>> {
        let mut map = HashMap::new();
        map.insert("fuel".to_owned(), fuel);
        map.insert("age".to_owned(), age);
        map.insert("type".to_owned(), ty);
        map
    }

    #[test]
    fn agreeing_logs_pass() {
        let mk = || vec![entry("EE", "0", 10000), entry("EE", "1", 432)];
        let report = run_consistency_checks(&themes(mk(), mk(), mk()), 10000);
        assert!(report.valid(), "{report}");
        assert_eq!(report.regions_checked, 1);
    }

    #[test]
    fn missing_region_is_reported() {
        let full = || vec![entry("EE", "0", 10000), entry("NW", "0", 10000)];
        let partial = vec![entry("EE", "0", 10000)];
        let report = run_consistency_checks(&themes(full(), partial, full()), 10000);
        assert!(!report.valid());
        assert_eq!(
            report.missing_regions,
            vec![("age".to_owned(), "NW".to_owned())]
        );
    }

    #[test]
    fn missing_batch_is_reported() {
        let full = || vec![entry("EE", "0", 10000), entry("EE", "1", 500)];
        let partial = vec![entry("EE", "0", 10000)];
        let report = run_consistency_checks(&themes(full(), full(), partial), 10000);
        assert!(!report.valid());
        assert_eq!(report.batch_mismatches.len(), 1);
        assert_eq!(report.batch_mismatches[0].0, "type");
        assert_eq!(report.batch_mismatches[0].2, vec!["1".to_owned()]);
    }

    #[test]
    fn diverging_row_counts_are_reported() {
        let a = vec![entry("EE", "0", 10000)];
        let b = vec![entry("EE", "0", 9998)];
        let report = run_consistency_checks(&themes(a.clone(), b, a), 10000);
        assert!(!report.valid());
        assert_eq!(report.count_mismatches.len(), 1);
        assert_eq!(report.count_mismatches[0].batch, "0");
    }

    #[test]
    fn one_short_batch_per_region_is_allowed() {
        let mk = || vec![entry("EE", "0", 10000), entry("EE", "1", 432)];
        let report = run_consistency_checks(&themes(mk(), mk(), mk()), 10000);
        assert!(report.size_anomalies.is_empty());
    }

    #[test]
    fn two_odd_sized_batches_in_a_region_are_reported() {
        let mk = || {
            vec![
                entry("EE", "0", 9000),
                entry("EE", "1", 432),
                entry("EE", "2", 10000),
            ]
        };
        let report = run_consistency_checks(&themes(mk(), mk(), mk()), 10000);
        assert!(!report.valid());
        assert_eq!(report.size_anomalies.len(), 3); // one per theme
        assert_eq!(report.size_anomalies[0].deviants.len(), 2);
    }

    #[test]
    fn seasonal_halves_must_sum_to_annual() {
        let rows = vec![
            DegreeDayRow {
                key: "AB1 2CD".to_owned(),
                annual: 2000.0,
                summer: 400.0,
                winter: 1600.0,
            },
            DegreeDayRow {
                key: "AB1 2CE".to_owned(),
                annual: 2000.0,
                summer: 400.0,
                winter: 1500.0,
            },
        ];
        assert!(check_seasonal_consistency("HDD", &rows[..1], 0.001).is_ok());
        let err = check_seasonal_consistency("HDD", &rows, 0.001).unwrap_err();
        assert!(matches!(err, StockError::Tolerance { count: 1, .. }));
    }
}
