use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::aggregate::{AgeRecord, FuelRecord, TypeRecord};
use crate::error::{Result, StockError};
use crate::postcode::{leading_letters, UnitLink};

/// A flushable per-unit attribute record: serialisable row plus the
/// geographic-unit key used for skip lists and duplicate detection.
pub trait UnitRecord: Serialize {
    fn unit_key(&self) -> &str;
}

impl UnitRecord for FuelRecord {
    fn unit_key(&self) -> &str {
        &self.postcode
    }
}

impl UnitRecord for AgeRecord {
    fn unit_key(&self) -> &str {
        &self.postcode
    }
}

impl UnitRecord for TypeRecord {
    fn unit_key(&self) -> &str {
        &self.postcode
    }
}

/// Batch-runner knobs. The exclusion list is explicit configuration so a
/// run over overlapping postcodes can be carved out without touching
/// process-wide state.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub sub_batch_size: usize,
    pub excluded: HashSet<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            sub_batch_size: 1000,
            excluded: HashSet::new(),
        }
    }
}

/// Outcome counts for one batch run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub skipped: usize,
    pub excluded: usize,
    pub processed: usize,
    pub logged: usize,
}

/// Newline-delimited work list of postcodes.
pub fn load_work_list(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(|line| line.trim().to_owned())
        .filter(|line| !line.is_empty())
        .collect())
}

/// Unit keys already present in a log from a previous run. The log is the
/// sole checkpoint: anything listed here is done and will not be
/// reprocessed.
pub fn completed_units(log_path: &Path) -> Result<HashSet<String>> {
    if !log_path.exists() {
        debug!(path = %log_path.display(), "no existing log, processing all units");
        return Ok(HashSet::new());
    }
    let mut rdr = csv::Reader::from_path(log_path)?;
    let headers = rdr.headers()?.clone();
    let key_idx = headers
        .iter()
        .position(|h| h == "postcode")
        .ok_or_else(|| StockError::MissingColumn("postcode".to_owned()))?;
    let mut done = HashSet::new();
    for record in rdr.records() {
        let record = record?;
        if let Some(key) = record.get(key_idx) {
            done.insert(key.trim().to_owned());
        }
    }
    info!(path = %log_path.display(), done = done.len(), "resuming from existing log");
    Ok(done)
}

/// Column names a record type serialises to, taken from a sample row.
fn header_for<T: Serialize>(record: &T) -> Result<Vec<String>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.serialize(record)?;
    let bytes = wtr
        .into_inner()
        .map_err(|e| StockError::Io(e.into_error()))?;
    let mut rdr = csv::Reader::from_reader(bytes.as_slice());
    Ok(rdr.headers()?.iter().map(String::from).collect())
}

/// Append one sub-batch to the log, creating it with a header on first
/// write. Nothing is appended unless the whole sub-batch passes the
/// duplicate-key check and its columns match the existing header exactly.
pub fn flush_sub_batch<T: UnitRecord>(log_path: &Path, buffer: &[T]) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }

    let mut keys = HashSet::new();
    for record in buffer {
        if !keys.insert(record.unit_key().to_owned()) {
            return Err(StockError::DuplicateKey(record.unit_key().to_owned()));
        }
    }

    if log_path.exists() {
        let mut rdr = csv::Reader::from_path(log_path)?;
        let existing: Vec<String> = rdr.headers()?.iter().map(String::from).collect();
        let new = header_for(&buffer[0])?;
        if existing != new {
            return Err(StockError::SchemaMismatch { existing, new });
        }
        let file = OpenOptions::new().append(true).open(log_path)?;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        for record in buffer {
            wtr.serialize(record)?;
        }
        wtr.flush()?;
    } else {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut wtr = csv::Writer::from_path(log_path)?;
        for record in buffer {
            wtr.serialize(record)?;
        }
        wtr.flush()?;
    }
    debug!(rows = buffer.len(), path = %log_path.display(), "flushed sub-batch");
    Ok(())
}

/// Drive one batch of units through a per-unit processor, appending results
/// to the batch's log in sub-batches. Units already in the log are skipped,
/// which makes a rerun after interruption idempotent at sub-batch
/// granularity: a crash loses at most one unflushed sub-batch.
pub fn run_batch<T, F>(
    units: &[String],
    config: &RunnerConfig,
    log_path: &Path,
    mut process: F,
) -> Result<BatchSummary>
where
    T: UnitRecord,
    F: FnMut(&str) -> Result<Option<T>>,
{
    let done = completed_units(log_path)?;
    let mut summary = BatchSummary {
        total: units.len(),
        ..Default::default()
    };

    let mut buffer: Vec<T> = Vec::new();
    for unit in units {
        let unit = unit.trim();
        if done.contains(unit) {
            summary.skipped += 1;
            continue;
        }
        if config.excluded.contains(unit) {
            summary.excluded += 1;
            continue;
        }
        match process(unit)? {
            Some(record) => {
                summary.processed += 1;
                buffer.push(record);
            }
            None => warn!(unit, "no result for unit"),
        }
        if buffer.len() >= config.sub_batch_size {
            flush_sub_batch(log_path, &buffer)?;
            summary.logged += buffer.len();
            buffer.clear();
        }
    }
    flush_sub_batch(log_path, &buffer)?;
    summary.logged += buffer.len();

    info!(
        total = summary.total,
        skipped = summary.skipped,
        excluded = summary.excluded,
        logged = summary.logged,
        "batch complete"
    );
    Ok(summary)
}

/// Log file location convention shared by the runner and the post-hoc
/// validators.
pub fn log_path_for(intermediate_root: &Path, theme: &str, region: &str, batch_id: &str) -> PathBuf {
    intermediate_root
        .join(theme)
        .join(region)
        .join(format!("{batch_id}_log_file.csv"))
}

/// Split one region's identifier-join file into work lists of `batch_size`
/// postcodes plus per-batch join subsets, recording every work-list path in
/// the append-only registry. Rows whose postcode does not parse are dropped,
/// as they can never be matched.
pub fn split_region_work_lists(
    join_path: &Path,
    batch_dir: &Path,
    registry_path: &Path,
    batch_size: usize,
) -> Result<Vec<PathBuf>> {
    let mut rdr = csv::Reader::from_path(join_path)?;
    let mut links: Vec<UnitLink> = Vec::new();
    for result in rdr.deserialize::<UnitLink>() {
        let link = result?;
        if leading_letters(&link.postcode).is_none() {
            warn!(postcode = %link.postcode, "dropping join row with malformed postcode");
            continue;
        }
        links.push(link);
    }

    let postcodes: Vec<String> = links
        .iter()
        .map(|link| link.postcode.trim().to_owned())
        .unique()
        .collect();
    info!(
        postcodes = postcodes.len(),
        batch_size, "splitting region into work lists"
    );

    std::fs::create_dir_all(batch_dir)?;
    let mut batch_paths = Vec::new();
    for (batch_num, chunk) in postcodes.chunks(batch_size).enumerate() {
        let list_path = batch_dir.join(format!("batch_{batch_num}.txt"));
        std::fs::write(&list_path, chunk.join("\n"))?;

        let members: HashSet<&str> = chunk.iter().map(String::as_str).collect();
        let subset_path = batch_dir.join(format!("onsud_{batch_num}.csv"));
        let mut wtr = csv::Writer::from_path(&subset_path)?;
        for link in links.iter().filter(|l| members.contains(l.postcode.trim())) {
            wtr.serialize(link)?;
        }
        wtr.flush()?;

        append_to_registry(registry_path, &list_path)?;
        batch_paths.push(list_path);
    }
    Ok(batch_paths)
}

fn append_to_registry(registry_path: &Path, list_path: &Path) -> Result<()> {
    use std::io::Write;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(registry_path)?;
    writeln!(file, "{}", list_path.display())?;
    Ok(())
}

/// All work-list paths recorded by the splitter, deduplicated, order
/// preserved.
pub fn load_registry(registry_path: &Path) -> Result<Vec<PathBuf>> {
    let text = std::fs::read_to_string(registry_path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .unique()
        .map(PathBuf::from)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use tempfile::tempdir;

    #[derive(Serialize)]
    struct Row {
        postcode: String,
        len_res: Option<u32>,
    }

    impl UnitRecord for Row {
        fn unit_key(&self) -> &str {
            &self.postcode
        }
    }

    fn row(pc: &str) -> Row {
        Row {
            postcode: pc.to_owned(),
            len_res: Some(1),
        }
    }

    fn line_count(path: &Path) -> usize {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count()
    }

    #[test]
    fn second_run_skips_everything() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("0_log_file.csv");
        let units = vec!["AB1 2CD".to_owned(), "AB1 2CE".to_owned()];
        let config = RunnerConfig::default();

        let first = run_batch(&units, &config, &log, |pc| Ok(Some(row(pc)))).unwrap();
        assert_eq!(first.processed, 2);
        assert_eq!(first.logged, 2);
        assert_eq!(line_count(&log), 3); // header + 2 rows

        let mut calls = 0;
        let second = run_batch(&units, &config, &log, |pc| {
            calls += 1;
            Ok(Some(row(pc)))
        })
        .unwrap();
        assert_eq!(calls, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(second.logged, 0);
        assert_eq!(line_count(&log), 3);
    }

    #[test]
    fn partial_log_resumes_remaining_units() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("0_log_file.csv");
        let config = RunnerConfig::default();

        run_batch(
            &["AB1 2CD".to_owned()],
            &config,
            &log,
            |pc| Ok(Some(row(pc))),
        )
        .unwrap();

        let units = vec!["AB1 2CD".to_owned(), "AB1 2CE".to_owned()];
        let summary = run_batch(&units, &config, &log, |pc| Ok(Some(row(pc)))).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.processed, 1);
        assert_eq!(line_count(&log), 3);
    }

    #[test]
    fn duplicate_keys_append_nothing() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("0_log_file.csv");
        let units = vec!["AB1 2CD".to_owned(), "AB1 2CE".to_owned()];

        let err = run_batch(&units, &RunnerConfig::default(), &log, |_| {
            Ok(Some(row("AB1 2CD")))
        })
        .unwrap_err();
        assert!(matches!(err, StockError::DuplicateKey(k) if k == "AB1 2CD"));
        assert!(!log.exists());
    }

    #[test]
    fn mismatched_columns_are_fatal() {
        #[derive(Serialize)]
        struct OtherRow {
            postcode: String,
            something_else: Option<f64>,
        }
        impl UnitRecord for OtherRow {
            fn unit_key(&self) -> &str {
                &self.postcode
            }
        }

        let dir = tempdir().unwrap();
        let log = dir.path().join("0_log_file.csv");
        run_batch(
            &["AB1 2CD".to_owned()],
            &RunnerConfig::default(),
            &log,
            |pc| Ok(Some(row(pc))),
        )
        .unwrap();

        let err = run_batch(
            &["AB1 2CE".to_owned()],
            &RunnerConfig::default(),
            &log,
            |pc| {
                Ok(Some(OtherRow {
                    postcode: pc.to_owned(),
                    something_else: None,
                }))
            },
        )
        .unwrap_err();
        assert!(matches!(err, StockError::SchemaMismatch { .. }));
        assert_eq!(line_count(&log), 2); // untouched
    }

    #[test]
    fn sub_batches_append_without_repeating_header() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("0_log_file.csv");
        let config = RunnerConfig {
            sub_batch_size: 2,
            ..Default::default()
        };
        let units: Vec<String> = (0..5).map(|i| format!("AB{i} 1AA")).collect();

        let summary = run_batch(&units, &config, &log, |pc| Ok(Some(row(pc)))).unwrap();
        assert_eq!(summary.logged, 5);

        let text = std::fs::read_to_string(&log).unwrap();
        assert_eq!(text.lines().filter(|l| l.contains("postcode")).count(), 1);
        assert_eq!(line_count(&log), 6);
    }

    #[test]
    fn excluded_units_are_not_processed() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("0_log_file.csv");
        let mut config = RunnerConfig::default();
        config.excluded.insert("AB1 2CE".to_owned());
        let units = vec!["AB1 2CD".to_owned(), "AB1 2CE".to_owned()];

        let summary = run_batch(&units, &config, &log, |pc| Ok(Some(row(pc)))).unwrap();
        assert_eq!(summary.excluded, 1);
        assert_eq!(summary.logged, 1);
    }

    #[test]
    fn splitter_writes_lists_subsets_and_registry() {
        let dir = tempdir().unwrap();
        let join_path = dir.path().join("onsud_EE.csv");
        std::fs::write(
            &join_path,
            "UPRN,PCDS,GRIDGB1E,GRIDGB1N\n\
             u1,AB1 2CD,100.0,200.0\n\
             u2,AB1 2CD,101.0,201.0\n\
             u3,AB1 2CE,110.0,210.0\n\
             u4,AB1 2CF,120.0,220.0\n\
             u5,not a postcode,130.0,230.0\n",
        )
        .unwrap();
        let batch_dir = dir.path().join("batches/EE");
        let registry = dir.path().join("batch_paths.txt");

        let paths =
            split_region_work_lists(&join_path, &batch_dir, &registry, 2).unwrap();
        assert_eq!(paths.len(), 2);

        let first = std::fs::read_to_string(&paths[0]).unwrap();
        assert_eq!(first.lines().count(), 2);
        let second = std::fs::read_to_string(&paths[1]).unwrap();
        assert_eq!(second.lines().collect::<Vec<_>>(), vec!["AB1 2CF"]);

        // subset keeps every join row of its postcodes
        let subset = std::fs::read_to_string(batch_dir.join("onsud_0.csv")).unwrap();
        assert_eq!(subset.lines().count(), 4); // header + 3 rows

        let registered = load_registry(&registry).unwrap();
        assert_eq!(registered, paths);
    }
}
