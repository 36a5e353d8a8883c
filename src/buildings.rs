use geo::{MinimumRotatedRect, Polygon};
use serde::Serialize;

use crate::error::{Result, StockError};
use crate::lookup::{height_bucket, GlobalAverages};

pub const BASEMENT_HEIGHT: f64 = 2.4;
pub const BASEMENT_PERCENTAGE_OF_PREMISE_AREA: f64 = 1.0;

/// Storey-height plausibility window used by the outlier validator.
#[derive(Debug, Clone, Copy)]
pub struct FloorHeightThresholds {
    pub min: f64,
    pub max: f64,
}

impl Default for FloorHeightThresholds {
    fn default() -> Self {
        Self { min: 2.3, max: 5.3 }
    }
}

/// One surveyed structure as it comes out of the building store. Raw height
/// and floor count stay as strings: the survey mixes numbers with free-text
/// placeholders, and non-numeric values become nulls during derivation.
#[derive(Debug, Clone)]
pub struct BuildingRecord {
    pub upn: String,
    pub footprint: Polygon<f64>,
    pub premise_area: Option<f64>,
    pub height: Option<String>,
    pub floor_count: Option<String>,
    pub use_type: Option<String>,
    pub premise_type: Option<String>,
    pub premise_age: Option<String>,
    pub listed_grade: Option<String>,
    pub basement: Option<String>,
    pub uprn_count: Option<f64>,
}

/// Where the canonical floor area came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FloorAreaSource {
    #[serde(rename = "H")]
    H,
    #[serde(rename = "valfc")]
    Valfc,
    #[serde(rename = "FC")]
    Fc,
    #[serde(rename = "none")]
    None,
}

/// Candidate order for the canonical floor area. A global statistical
/// estimate beats a within-postcode fill, which beats a single unverified
/// survey reading. Adding a tier means adding a variant here and a case in
/// `BuildingMetrics::area_candidate`.
pub const AREA_PRIORITY: [FloorAreaSource; 3] =
    [FloorAreaSource::H, FloorAreaSource::Valfc, FloorAreaSource::Fc];

/// A building plus everything derived for it: parsed measurements, outlier
/// validation results, the fallback fills and the resolved floor area.
#[derive(Debug, Clone)]
pub struct BuildingMetrics {
    pub record: BuildingRecord,
    pub age_bucket: Option<String>,
    pub height_numeric: Option<f64>,
    pub floor_count_numeric: Option<f64>,
    pub avg_floor_height: Option<f64>,
    pub min_side: Option<f64>,
    pub validated_height: Option<f64>,
    pub validated_floor_count: Option<f64>,
    pub filled_height: Option<f64>,
    pub filled_floor_count: Option<f64>,
    pub filled_height_bucket: Option<String>,
    pub global_avg_floor_count: Option<f64>,
    pub listed_flag: u32,
    pub base_floor: u32,
    pub basement_heated_vol: Option<f64>,
    pub area_h: Option<f64>,
    pub area_valfc: Option<f64>,
    pub area_fc: Option<f64>,
    pub floor_area: Option<f64>,
    pub floor_area_source: FloorAreaSource,
    pub floor_area_avg: Option<f64>,
}

impl BuildingMetrics {
    fn area_candidate(&self, source: FloorAreaSource) -> Option<f64> {
        match source {
            FloorAreaSource::H => self.area_h,
            FloorAreaSource::Valfc => self.area_valfc,
            FloorAreaSource::Fc => self.area_fc,
            FloorAreaSource::None => None,
        }
    }
}

pub fn parse_numeric(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Collapse the pre-1919 survey eras into one band so vintage matches the
/// global lookup keys.
pub fn vintage_bucket(raw: Option<&str>) -> Option<String> {
    raw.map(|age| match age.trim() {
        "Pre 1837" | "1837-1869" | "1870-1918" => "Pre 1919".to_owned(),
        other => other.to_owned(),
    })
}

/// Shortest edge of the footprint's minimum-area bounding rectangle.
/// Returns None for degenerate geometry, in which case the validator has no
/// geometric evidence against the reported height.
pub fn min_side(footprint: &Polygon<f64>) -> Option<f64> {
    let rect = footprint.minimum_rotated_rect()?;
    rect.exterior()
        .lines()
        .map(|line| (line.dx() * line.dx() + line.dy() * line.dy()).sqrt())
        .fold(None, |acc: Option<f64>, len| {
            Some(acc.map_or(len, |a| a.min(len)))
        })
}

/// The survey mislabels small garden structures as dwellings: a 3m tall,
/// "2 storey" building with zero addresses is an outbuilding.
fn relabel_outbuildings(metrics: &mut BuildingMetrics) {
    let two_storeys = metrics
        .record
        .floor_count
        .as_deref()
        .map(|fc| fc.trim() == "2")
        .unwrap_or(false);
    if metrics.height_numeric == Some(3.0)
        && two_storeys
        && metrics.record.uprn_count == Some(0.0)
    {
        metrics.record.premise_type = Some("Domestic outbuilding".to_owned());
    }
}

fn derive_metrics(record: BuildingRecord) -> BuildingMetrics {
    let height_numeric = parse_numeric(record.height.as_deref());
    let floor_count_numeric = parse_numeric(record.floor_count.as_deref());
    let avg_floor_height = match (height_numeric, floor_count_numeric) {
        (Some(h), Some(fc)) if fc != 0.0 => Some(h / fc),
        _ => None,
    };
    let age_bucket = vintage_bucket(record.premise_age.as_deref());
    let listed_flag = record.listed_grade.is_some() as u32;
    let ms = min_side(&record.footprint);

    let mut metrics = BuildingMetrics {
        age_bucket,
        height_numeric,
        floor_count_numeric,
        avg_floor_height,
        min_side: ms,
        validated_height: None,
        validated_floor_count: None,
        filled_height: None,
        filled_floor_count: None,
        filled_height_bucket: None,
        global_avg_floor_count: None,
        listed_flag,
        base_floor: 0,
        basement_heated_vol: None,
        area_h: None,
        area_valfc: None,
        area_fc: None,
        floor_area: None,
        floor_area_source: FloorAreaSource::None,
        floor_area_avg: None,
        record,
    };
    relabel_outbuildings(&mut metrics);
    metrics
}

/// Null out measurements the footprint geometry contradicts. A height at
/// least three times the footprint's shortest side, or a sub-2m height
/// reported alongside a floor count, is a data entry error. A floor count is
/// only distrusted when the height itself still looks geometrically sane but
/// the implied storey height does not. Individual nulls are expected input
/// noise, never an error.
fn validate_outliers(metrics: &mut BuildingMetrics, thresholds: &FloorHeightThresholds) {
    let three_x_min_side = metrics.min_side.map(|ms| ms * 3.0);

    metrics.validated_height = match metrics.height_numeric {
        Some(h) => {
            let too_tall = three_x_min_side.map(|t| h >= t).unwrap_or(false);
            let too_short = h < 2.0 && metrics.floor_count_numeric.is_some();
            if too_tall || too_short {
                None
            } else {
                Some(h)
            }
        }
        None => None,
    };

    metrics.validated_floor_count = match metrics.floor_count_numeric {
        Some(fc) => {
            let implausible_storey = metrics
                .avg_floor_height
                .map(|s| s < thresholds.min || s > thresholds.max)
                .unwrap_or(false);
            let height_sane = match (metrics.height_numeric, three_x_min_side) {
                (Some(h), Some(t)) => h < t,
                _ => false,
            };
            if implausible_storey && height_sane {
                None
            } else {
                Some(fc)
            }
        }
        None => None,
    };
}

/// Substitute nulled measurements with the group mean. A group with a single
/// member or with no valid values on either axis has no ground truth to fill
/// from, which is a hard stop for the whole unit rather than a silent skip.
fn fill_local_averages(group: &mut [BuildingMetrics]) -> Result<()> {
    let valid_fc: Vec<f64> = group
        .iter()
        .filter_map(|m| m.validated_floor_count)
        .collect();
    let valid_height: Vec<f64> = group.iter().filter_map(|m| m.validated_height).collect();

    if group.len() == 1 || valid_fc.is_empty() || valid_height.is_empty() {
        return Err(StockError::InsufficientLocalBasis {
            group_size: group.len(),
            valid_fc: valid_fc.len(),
            valid_height: valid_height.len(),
        });
    }

    let fc_mean = valid_fc.iter().sum::<f64>() / valid_fc.len() as f64;
    let height_mean = valid_height.iter().sum::<f64>() / valid_height.len() as f64;

    for metrics in group.iter_mut() {
        metrics.filled_floor_count = Some(metrics.validated_floor_count.unwrap_or(fc_mean));
        metrics.filled_height = Some(metrics.validated_height.unwrap_or(height_mean));
        metrics.filled_height_bucket = metrics.filled_height.and_then(height_bucket);
    }
    Ok(())
}

/// Join each building against the global average table on
/// (use type, vintage band, filled height bucket). A miss leaves the global
/// floor count null for that building; a group where nothing joins at all
/// means the table and the survey disagree on vocabulary.
fn fill_global_averages(group: &mut [BuildingMetrics], table: &GlobalAverages) -> Result<()> {
    let mut matched = 0usize;
    for metrics in group.iter_mut() {
        metrics.global_avg_floor_count = match (
            metrics.record.use_type.as_deref(),
            metrics.age_bucket.as_deref(),
            metrics.filled_height_bucket.as_deref(),
        ) {
            (Some(use_type), Some(age), Some(bucket)) => table
                .get(use_type, age, bucket)
                .map(|row| row.global_average_floorcount),
            _ => None,
        };
        if metrics.global_avg_floor_count.is_some() {
            matched += 1;
        }
    }
    if matched == 0 && !group.is_empty() {
        return Err(StockError::EmptyGlobalJoin);
    }
    Ok(())
}

/// Compute the three candidate floor areas and pick the canonical one by
/// walking the priority list. The mean of whichever candidates exist rides
/// along as a diagnostic.
fn resolve_floor_area(metrics: &mut BuildingMetrics) {
    let premise_area = metrics.record.premise_area;
    let area = |fc: Option<f64>| match (premise_area, fc) {
        (Some(a), Some(f)) => Some(a * f),
        _ => None,
    };
    metrics.area_h = area(metrics.global_avg_floor_count);
    metrics.area_valfc = area(metrics.filled_floor_count);
    metrics.area_fc = area(metrics.floor_count_numeric);

    metrics.floor_area = None;
    metrics.floor_area_source = FloorAreaSource::None;
    for source in AREA_PRIORITY {
        if let Some(value) = metrics.area_candidate(source) {
            metrics.floor_area = Some(value);
            metrics.floor_area_source = source;
            break;
        }
    }

    let present: Vec<f64> = [metrics.area_h, metrics.area_valfc, metrics.area_fc]
        .into_iter()
        .flatten()
        .collect();
    metrics.floor_area_avg = if present.is_empty() {
        None
    } else {
        Some(present.iter().sum::<f64>() / present.len() as f64)
    };
}

fn derive_basement_metrics(metrics: &mut BuildingMetrics) {
    metrics.base_floor = matches!(
        metrics.record.basement.as_deref(),
        Some("Basement confirmed") | Some("Basement likely")
    ) as u32;
    metrics.basement_heated_vol = metrics.record.premise_area.map(|area| {
        metrics.base_floor as f64 * area * BASEMENT_HEIGHT * BASEMENT_PERCENTAGE_OF_PREMISE_AREA
    });
}

/// Full measurement-resolution chain for the buildings of one geographic
/// unit: derive numerics, null outliers, fill from the group, fill from the
/// global table, resolve floor areas. Order matters: each tier only sees the
/// gaps the previous one left.
pub fn process_building_group(
    records: Vec<BuildingRecord>,
    table: &GlobalAverages,
    thresholds: &FloorHeightThresholds,
) -> Result<Vec<BuildingMetrics>> {
    if records.is_empty() {
        return Ok(Vec::new());
    }

    let mut group: Vec<BuildingMetrics> = records.into_iter().map(derive_metrics).collect();
    for metrics in group.iter_mut() {
        validate_outliers(metrics, thresholds);
    }
    fill_local_averages(&mut group)?;
    fill_global_averages(&mut group, table)?;
    for metrics in group.iter_mut() {
        resolve_floor_area(metrics);
        derive_basement_metrics(metrics);
    }
    Ok(group)
}
