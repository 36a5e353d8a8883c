use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, StockError};

/// One completed log file: which region and batch produced it and how many
/// unit rows it holds. The collected entries form the append-only registry
/// the cross-batch validator works from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchLogEntry {
    pub path: String,
    pub region: String,
    pub batch: String,
    pub len: usize,
}

/// In-memory CSV table: header plus string rows. The theme logs carry
/// different column sets, so post-processing works dynamically rather than
/// through typed records.
#[derive(Debug, Clone)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::Reader::from_reader(reader);
        let headers = rdr.headers()?.iter().map(String::from).collect();
        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            rows.push(record.iter().map(String::from).collect());
        }
        Ok(Self { headers, rows })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    pub fn col(&self, name: &str) -> Result<usize> {
        self.headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| StockError::MissingColumn(name.to_owned()))
    }

    pub fn number(&self, row: usize, col: usize) -> Option<f64> {
        let cell = self.rows[row][col].trim();
        if cell.is_empty() {
            None
        } else {
            cell.parse::<f64>().ok()
        }
    }

    pub fn push_column(&mut self, name: &str, values: Vec<String>) {
        assert_eq!(values.len(), self.rows.len());
        self.headers.push(name.to_owned());
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut wtr = csv::Writer::from_path(path)?;
        wtr.write_record(&self.headers)?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

fn format_count(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Scan one theme's intermediate directory
/// (`{root}/{theme}/{region}/{batch}_log_file.csv`) into log entries.
pub fn collect_log_entries(theme_dir: &Path) -> Result<Vec<BatchLogEntry>> {
    let mut entries = Vec::new();
    if !theme_dir.exists() {
        warn!(path = %theme_dir.display(), "theme directory missing");
        return Ok(entries);
    }
    let mut region_dirs: Vec<PathBuf> = std::fs::read_dir(theme_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    region_dirs.sort();

    for region_dir in region_dirs {
        let region = region_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_owned();
        let mut files: Vec<PathBuf> = std::fs::read_dir(&region_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("csv"))
            .collect();
        files.sort();

        for file in files {
            let batch = file
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.split('_').next())
                .unwrap_or_default()
                .to_owned();
            let table = Table::from_path(&file)?;
            entries.push(BatchLogEntry {
                path: file.display().to_string(),
                region: region.clone(),
                batch,
                len: table.rows.len(),
            });
        }
    }
    debug!(entries = entries.len(), "collected log entries");
    Ok(entries)
}

pub fn write_log_entries(path: &Path, entries: &[BatchLogEntry]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut wtr = csv::Writer::from_path(path)?;
    for entry in entries {
        wtr.serialize(entry)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Concatenate the log files behind a set of entries into one table with a
/// `region` column, dropping excluded postcodes and exact duplicate rows.
/// Every log must share the first file's header.
pub fn load_from_entries(entries: &[BatchLogEntry], excluded: &HashSet<String>) -> Result<Table> {
    let mut combined: Option<Table> = None;
    for entry in entries {
        let table = Table::from_path(Path::new(&entry.path))?;
        let pc_idx = table.col("postcode")?;
        if let Some(acc) = combined.as_mut() {
            let mut expected = acc.headers.clone();
            expected.pop();
            if expected != table.headers {
                return Err(StockError::SchemaMismatch {
                    existing: expected,
                    new: table.headers,
                });
            }
            append_rows(acc, &table, pc_idx, &entry.region, excluded);
        } else {
            let mut headers = table.headers.clone();
            headers.push("region".to_owned());
            let mut first = Table {
                headers,
                rows: Vec::new(),
            };
            append_rows(&mut first, &table, pc_idx, &entry.region, excluded);
            combined = Some(first);
        }
    }
    let combined = combined.unwrap_or(Table {
        headers: vec!["postcode".to_owned(), "region".to_owned()],
        rows: Vec::new(),
    });
    info!(rows = combined.rows.len(), "combined theme logs");
    Ok(combined)
}

fn append_rows(
    acc: &mut Table,
    table: &Table,
    pc_idx: usize,
    region: &str,
    excluded: &HashSet<String>,
) {
    let mut seen: HashSet<Vec<String>> = HashSet::new();
    for row in &table.rows {
        if excluded.contains(row[pc_idx].trim()) {
            continue;
        }
        if !seen.insert(row.clone()) {
            warn!(postcode = %row[pc_idx], "dropping duplicate row");
            continue;
        }
        let mut row = row.clone();
        row.push(region.to_owned());
        acc.rows.push(row);
    }
}

/// Columns that are bookkeeping rather than category counts.
const TYPE_META_COLS: [&str; 5] = ["postcode", "len_res", "region", "Unknown", "None_type"];

/// Derive the unknown bucket and per-typology percentage columns for the
/// type theme. The category counts of every row must add up to `len_res`;
/// a mismatch means the aggregation dropped or double-counted buildings.
pub fn type_percentages(table: &mut Table) -> Result<()> {
    let len_res_idx = table.col("len_res")?;
    let unknown_idx = table.col("Unknown")?;
    let none_idx = table.col("None_type")?;

    let all_unknown: Vec<String> = (0..table.rows.len())
        .map(|r| {
            let v = table.number(r, unknown_idx).unwrap_or(0.0)
                + table.number(r, none_idx).unwrap_or(0.0);
            format_count(v)
        })
        .collect();
    table.push_column("all_unknown", all_unknown);

    let category_idxs: Vec<usize> = table
        .headers
        .iter()
        .enumerate()
        .filter(|(_, h)| !TYPE_META_COLS.contains(&h.as_str()))
        .map(|(i, _)| i)
        .collect();

    let pc_idx = table.col("postcode")?;
    let mut violations = Vec::new();
    for r in 0..table.rows.len() {
        let len_res = table.number(r, len_res_idx).unwrap_or(0.0);
        let sum: f64 = category_idxs
            .iter()
            .map(|&c| table.number(r, c).unwrap_or(0.0))
            .sum();
        if (sum - len_res).abs() > f64::EPSILON {
            violations.push(table.rows[r][pc_idx].clone());
        }
    }
    if !violations.is_empty() {
        return Err(StockError::CountConservation(violations));
    }

    push_percentage_columns(table, &category_idxs, len_res_idx);
    check_percentage_ranges(table)
}

/// Recompute the unknown bucket as the residual against `len_res` and
/// derive per-band percentage columns for the age theme. A residual driven
/// negative by double counting surfaces in the range check.
pub fn age_percentages(table: &mut Table) -> Result<()> {
    let len_res_idx = table.col("len_res")?;
    let none_idx = table.col("None_age")?;
    let band_idxs: Vec<usize> = table
        .headers
        .iter()
        .enumerate()
        .filter(|(i, h)| {
            !["postcode", "len_res", "region", "None_age"].contains(&h.as_str()) && *i != none_idx
        })
        .map(|(i, _)| i)
        .collect();

    for r in 0..table.rows.len() {
        let len_res = table.number(r, len_res_idx).unwrap_or(0.0);
        let sum: f64 = band_idxs
            .iter()
            .map(|&c| table.number(r, c).unwrap_or(0.0))
            .sum();
        table.rows[r][none_idx] = format_count(len_res - sum);
    }

    let mut pct_idxs = band_idxs;
    pct_idxs.push(none_idx);
    push_percentage_columns(table, &pct_idxs, len_res_idx);
    check_percentage_ranges(table)
}

fn push_percentage_columns(table: &mut Table, category_idxs: &[usize], len_res_idx: usize) {
    for &c in category_idxs {
        let name = format!("{}_pct", table.headers[c]);
        let values: Vec<String> = (0..table.rows.len())
            .map(|r| {
                let len_res = table.number(r, len_res_idx).unwrap_or(0.0);
                if len_res == 0.0 {
                    String::new()
                } else {
                    let count = table.number(r, c).unwrap_or(0.0);
                    format!("{}", count / len_res * 100.0)
                }
            })
            .collect();
        table.push_column(&name, values);
    }
}

/// Every derived `_pct` column must sit inside [0, 100] after null fill.
pub fn check_percentage_ranges(table: &Table) -> Result<()> {
    let pc_idx = table.col("postcode")?;
    for (c, header) in table.headers.iter().enumerate() {
        if !header.ends_with("_pct") {
            continue;
        }
        let offenders: Vec<String> = (0..table.rows.len())
            .filter(|&r| {
                let v = table.number(r, c).unwrap_or(0.0);
                !(0.0..=100.0).contains(&v)
            })
            .map(|r| table.rows[r][pc_idx].clone())
            .collect();
        if !offenders.is_empty() {
            return Err(StockError::RangeValidation {
                column: header.clone(),
                offenders,
            });
        }
    }
    debug!("all percentage columns within range");
    Ok(())
}

/// Fuel-theme sanity: no duplicated postcodes, and a postcode's total
/// consumption can never undercut its own mean.
pub fn fuel_checks(table: &Table) -> Result<()> {
    let pc_idx = table.col("postcode")?;
    let mut seen = HashSet::new();
    for row in &table.rows {
        if !seen.insert(row[pc_idx].trim().to_owned()) {
            return Err(StockError::DuplicateKey(row[pc_idx].clone()));
        }
    }

    for (total_col, avg_col) in [("total_gas", "avg_gas"), ("total_elec", "avg_elec")] {
        let total_idx = table.col(total_col)?;
        let avg_idx = table.col(avg_col)?;
        let bad = (0..table.rows.len())
            .filter(|&r| {
                match (table.number(r, total_idx), table.number(r, avg_idx)) {
                    (Some(total), Some(avg)) => total < avg,
                    _ => false,
                }
            })
            .count();
        if bad > 0 {
            return Err(StockError::Tolerance {
                metric: format!("{total_col} vs {avg_col}"),
                tolerance: 0.0,
                count: bad,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn table(csv_text: &str) -> Table {
        Table::from_reader(csv_text.as_bytes()).unwrap()
    }

    #[test]
    fn type_percentages_conserve_counts() {
        let mut t = table(
            "postcode,Small low terraces,Large detached,Unknown,None_type,len_res,region\n\
             AB1 2CD,2,1,1,0,4,EE\n\
             AB1 2CE,,,,,0,EE\n",
        );
        type_percentages(&mut t).unwrap();

        let pct = t.col("Small low terraces_pct").unwrap();
        assert_eq!(t.number(0, pct), Some(50.0));
        // all-null row divides nothing
        assert_eq!(t.number(1, pct), None);
        let unk = t.col("all_unknown").unwrap();
        assert_eq!(t.number(0, unk), Some(1.0));
    }

    #[test]
    fn broken_count_conservation_is_fatal() {
        let mut t = table(
            "postcode,Small low terraces,Large detached,Unknown,None_type,len_res,region\n\
             AB1 2CD,2,1,0,0,4,EE\n",
        );
        let err = type_percentages(&mut t).unwrap_err();
        assert!(matches!(err, StockError::CountConservation(v) if v == vec!["AB1 2CD"]));
    }

    #[test]
    fn age_unknown_bucket_is_recomputed_from_len_res() {
        let mut t = table(
            "postcode,Pre 1919,Post 1999,len_res,None_age,region\n\
             AB1 2CD,2,1,5,9,EE\n",
        );
        age_percentages(&mut t).unwrap();
        let none_idx = t.col("None_age").unwrap();
        assert_eq!(t.number(0, none_idx), Some(2.0));
        let pct = t.col("None_age_pct").unwrap();
        assert_eq!(t.number(0, pct), Some(40.0));
    }

    #[test]
    fn out_of_range_percentage_is_fatal() {
        let mut t = table(
            "postcode,Pre 1919,Post 1999,len_res,None_age,region\n\
             AB1 2CD,6,0,4,0,EE\n",
        );
        // six pre-1919 buildings against len_res 4 pushes the band over 100%
        let err = age_percentages(&mut t).unwrap_err();
        assert!(matches!(err, StockError::RangeValidation { column, .. } if column == "Pre 1919_pct"));
    }

    #[test]
    fn fuel_checks_reject_total_below_average() {
        let t = table(
            "postcode,total_gas,avg_gas,total_elec,avg_elec\n\
             AB1 2CD,100,200,50,10\n",
        );
        let err = fuel_checks(&t).unwrap_err();
        assert!(matches!(err, StockError::Tolerance { .. }));
    }

    #[test]
    fn fuel_checks_reject_duplicate_postcodes() {
        let t = table(
            "postcode,total_gas,avg_gas,total_elec,avg_elec\n\
             AB1 2CD,100,10,50,10\n\
             AB1 2CD,100,10,50,10\n",
        );
        let err = fuel_checks(&t).unwrap_err();
        assert!(matches!(err, StockError::DuplicateKey(_)));
    }

    #[test]
    fn log_collection_reads_region_and_batch_from_layout() {
        let dir = tempdir().unwrap();
        let ee = dir.path().join("age/EE");
        std::fs::create_dir_all(&ee).unwrap();
        std::fs::write(
            ee.join("0_log_file.csv"),
            "postcode,len_res\nAB1 2CD,3\nAB1 2CE,1\n",
        )
        .unwrap();
        std::fs::write(ee.join("1_log_file.csv"), "postcode,len_res\nAB2 2CD,2\n").unwrap();

        let entries = collect_log_entries(&dir.path().join("age")).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].region, "EE");
        assert_eq!(entries[0].batch, "0");
        assert_eq!(entries[0].len, 2);
        assert_eq!(entries[1].batch, "1");
        assert_eq!(entries[1].len, 1);
    }

    #[test]
    fn combined_logs_gain_region_and_drop_excluded() {
        let dir = tempdir().unwrap();
        let ee = dir.path().join("age/EE");
        std::fs::create_dir_all(&ee).unwrap();
        std::fs::write(
            ee.join("0_log_file.csv"),
            "postcode,len_res\nAB1 2CD,3\nAB1 2CE,1\n",
        )
        .unwrap();

        let entries = collect_log_entries(&dir.path().join("age")).unwrap();
        let mut excluded = HashSet::new();
        excluded.insert("AB1 2CE".to_owned());
        let combined = load_from_entries(&entries, &excluded).unwrap();

        assert_eq!(combined.headers.last().map(String::as_str), Some("region"));
        assert_eq!(combined.rows.len(), 1);
        assert_eq!(combined.rows[0][0], "AB1 2CD");
        assert_eq!(combined.rows[0].last().map(String::as_str), Some("EE"));
    }
}
