use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use geo::Rect;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::buildings::{parse_numeric, vintage_bucket};
use crate::error::{Result, StockError};
use crate::postcode::BuildingSource;

/// Well-known location of the precomputed lookup table, relative to the
/// working directory of the batch process.
pub const GLOBAL_AVERAGES_PATH: &str = "global_avs/global_average_floor_count_bucket_clean.csv";

/// Height band edges in metres, lower bound inclusive. Dense 1m bins cover
/// the residential range where the survey is thick with samples; bins widen
/// past 20m where tall structures are sparse.
pub const HEIGHT_BINS: [u32; 36] = [
    0, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 22, 24, 26, 28, 30,
    35, 40, 45, 50, 55, 60, 70, 80, 90, 100, 200,
];

/// Band label for a height, e.g. 6.4 -> "6-7m". Heights at or beyond the
/// last edge (200m) have no band and stay unmatched.
pub fn height_bucket(height: f64) -> Option<String> {
    if !height.is_finite() || height < 0.0 {
        return None;
    }
    HEIGHT_BINS.windows(2).find_map(|edge| {
        let (lo, hi) = (edge[0], edge[1]);
        if height >= lo as f64 && height < hi as f64 {
            Some(format!("{}-{}m", lo, hi))
        } else {
            None
        }
    })
}

/// One row of the precomputed lookup: average floor count for a
/// (use type, vintage band, height band) population, with its sample size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalAverage {
    pub use_type: String,
    pub vintage_bucket: String,
    pub height_bucket: String,
    pub global_average_floorcount: f64,
    pub total_count: u64,
}

/// The full lookup table, keyed by the bucket triple. Immutable reference
/// data: loaded once per process and shared read-only.
pub struct GlobalAverages {
    map: HashMap<(String, String, String), GlobalAverage>,
}

impl GlobalAverages {
    pub fn from_rows(rows: Vec<GlobalAverage>) -> Self {
        let mut map = HashMap::new();
        for row in rows {
            map.insert(
                (
                    row.use_type.clone(),
                    row.vintage_bucket.clone(),
                    row.height_bucket.clone(),
                ),
                row,
            );
        }
        Self { map }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut rows = Vec::new();
        for result in rdr.deserialize::<GlobalAverage>() {
            rows.push(result?);
        }
        info!(rows = rows.len(), path = %path.display(), "loaded global average table");
        Ok(Self::from_rows(rows))
    }

    pub fn get(&self, use_type: &str, vintage: &str, height_bucket: &str) -> Option<&GlobalAverage> {
        self.map.get(&(
            use_type.to_owned(),
            vintage.to_owned(),
            height_bucket.to_owned(),
        ))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

static GLOBAL_AVERAGES: OnceCell<GlobalAverages> = OnceCell::new();

/// Process-wide cached table from the well-known path. Batch processes load
/// it lazily on first imputation and never reload.
pub fn global_averages() -> Result<&'static GlobalAverages> {
    GLOBAL_AVERAGES.get_or_try_init(|| GlobalAverages::from_path(Path::new(GLOBAL_AVERAGES_PATH)))
}

/// Rebuild the lookup table by sweeping bounding boxes over the building
/// store. Only buildings whose implied storey height sits inside
/// `storey_range` contribute, so data entry errors do not drag the averages.
pub fn compute_global_averages(
    source: &dyn BuildingSource,
    bboxes: &[Rect<f64>],
    storey_range: (f64, f64),
) -> Result<Vec<GlobalAverage>> {
    let mut acc: BTreeMap<(String, String, String), (f64, u64)> = BTreeMap::new();

    for bbox in bboxes {
        let subset = source.query_bbox(bbox)?;
        if subset.is_empty() {
            warn!(?bbox, "empty subset for bounding box");
            continue;
        }
        for record in subset {
            let height = parse_numeric(record.height.as_deref());
            let fc = parse_numeric(record.floor_count.as_deref());
            let (height, fc) = match (height, fc) {
                (Some(h), Some(f)) if f > 0.0 => (h, f),
                _ => continue,
            };
            let storey = height / fc;
            if storey < storey_range.0 || storey > storey_range.1 {
                continue;
            }
            let key = match (
                record.use_type.clone(),
                vintage_bucket(record.premise_age.as_deref()),
                height_bucket(height),
            ) {
                (Some(u), Some(v), Some(b)) => (u, v, b),
                _ => continue,
            };
            let entry = acc.entry(key).or_insert((0.0, 0));
            entry.0 += fc;
            entry.1 += 1;
        }
    }

    if acc.is_empty() {
        return Err(StockError::EmptyGlobalJoin);
    }

    Ok(acc
        .into_iter()
        .map(
            |((use_type, vintage, bucket), (sum_fc, count))| GlobalAverage {
                use_type,
                vintage_bucket: vintage,
                height_bucket: bucket,
                global_average_floorcount: sum_fc / count as f64,
                total_count: count,
            },
        )
        .collect())
}

/// Drop thin buckets before publishing: a bucket estimated from a handful of
/// buildings is noisier than the local fill it would override.
pub fn filter_min_samples(rows: Vec<GlobalAverage>, min_samples: u64) -> Vec<GlobalAverage> {
    rows.into_iter()
        .filter(|row| row.total_count > min_samples)
        .collect()
}

pub fn write_global_averages(path: &Path, rows: &[GlobalAverage]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut wtr = csv::Writer::from_path(path)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    info!(rows = rows.len(), path = %path.display(), "wrote global average table");
    Ok(())
}
