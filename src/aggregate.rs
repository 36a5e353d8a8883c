use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::buildings::BuildingMetrics;
use crate::error::{Result, StockError};
use crate::{AGE_BANDS, PREM_TYPES, RES_USE_TYPES};

/// Sum accumulator that keeps "zero" and "no data" apart: the total is null
/// until at least one value lands, and nulls are counted alongside.
#[derive(Default)]
pub struct ColSum {
    sum: f64,
    present: u32,
    nulls: u32,
}

impl ColSum {
    pub fn add(&mut self, value: Option<f64>) {
        match value {
            Some(v) => {
                self.sum += v;
                self.present += 1;
            }
            None => self.nulls += 1,
        }
    }

    pub fn total(&self) -> Option<f64> {
        if self.present > 0 {
            Some(self.sum)
        } else {
            None
        }
    }

    pub fn null_count(&self) -> u32 {
        self.nulls
    }
}

/// One postcode's row from the gas or electricity consumption release.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumptionRow {
    #[serde(rename = "Postcode")]
    pub postcode: String,
    #[serde(rename = "Num_meters")]
    pub num_meters: Option<f64>,
    #[serde(rename = "Total_cons_kwh")]
    pub total_kwh: Option<f64>,
    #[serde(rename = "Mean_cons_kwh")]
    pub mean_kwh: Option<f64>,
    #[serde(rename = "Median_cons_kwh")]
    pub median_kwh: Option<f64>,
}

/// Per-postcode consumption lookup. A postcode with no row yields nulls,
/// not an error: meter releases legitimately skip small postcodes.
pub struct ConsumptionTable {
    map: HashMap<String, ConsumptionRow>,
}

impl ConsumptionTable {
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut map = HashMap::new();
        for result in rdr.deserialize::<ConsumptionRow>() {
            let row = result?;
            map.insert(row.postcode.trim().to_owned(), row);
        }
        debug!(postcodes = map.len(), "loaded consumption table");
        Ok(Self { map })
    }

    pub fn from_rows(rows: Vec<ConsumptionRow>) -> Self {
        let mut map = HashMap::new();
        for row in rows {
            map.insert(row.postcode.trim().to_owned(), row);
        }
        Self { map }
    }

    pub fn get(&self, postcode: &str) -> Option<&ConsumptionRow> {
        self.map.get(postcode.trim())
    }
}

/// Flattened fuel-theme attribute record for one postcode. The serialised
/// field names are the log-file schema.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FuelRecord {
    pub postcode: String,

    pub all_types_total_buildings: Option<u32>,
    pub all_types_premise_area_total: Option<f64>,
    #[serde(rename = "all_types_total_fl_area_H_total")]
    pub all_types_fl_area_h_total: Option<f64>,
    #[serde(rename = "all_types_total_fl_area_FC_total")]
    pub all_types_fl_area_fc_total: Option<f64>,
    pub all_types_uprn_count_total: Option<f64>,
    pub all_types_premise_area_null_count: Option<u32>,
    #[serde(rename = "all_types_total_fl_area_H_null_count")]
    pub all_types_fl_area_h_null_count: Option<u32>,
    #[serde(rename = "all_types_total_fl_area_FC_null_count")]
    pub all_types_fl_area_fc_null_count: Option<u32>,

    pub mixed_alltypes_count: Option<u32>,
    pub comm_alltypes_count: Option<u32>,
    pub unknown_alltypes_count: Option<u32>,
    pub all_residential_types_count: Option<u32>,

    pub clean_res_total_buildings: Option<u32>,
    pub clean_res_premise_area_total: Option<f64>,
    #[serde(rename = "clean_res_total_fl_area_H_total")]
    pub clean_res_fl_area_h_total: Option<f64>,
    #[serde(rename = "clean_res_total_fl_area_FC_total")]
    pub clean_res_fl_area_fc_total: Option<f64>,
    pub clean_res_base_floor_total: Option<f64>,
    pub clean_res_basement_heated_vol_total: Option<f64>,
    pub clean_res_listed_bool_total: Option<f64>,
    pub clean_res_uprn_count_total: Option<f64>,
    pub clean_res_premise_area_null_count: Option<u32>,
    #[serde(rename = "clean_res_total_fl_area_H_null_count")]
    pub clean_res_fl_area_h_null_count: Option<u32>,
    #[serde(rename = "clean_res_total_fl_area_FC_null_count")]
    pub clean_res_fl_area_fc_null_count: Option<u32>,

    pub outb_res_total_buildings: Option<u32>,
    pub outb_res_premise_area_total: Option<f64>,
    #[serde(rename = "outb_res_total_fl_area_H_total")]
    pub outb_res_fl_area_h_total: Option<f64>,
    #[serde(rename = "outb_res_total_fl_area_FC_total")]
    pub outb_res_fl_area_fc_total: Option<f64>,
    pub outb_res_uprn_count_total: Option<f64>,
    pub outb_res_premise_area_null_count: Option<u32>,
    #[serde(rename = "outb_res_total_fl_area_H_null_count")]
    pub outb_res_fl_area_h_null_count: Option<u32>,
    #[serde(rename = "outb_res_total_fl_area_FC_null_count")]
    pub outb_res_fl_area_fc_null_count: Option<u32>,

    pub num_meters_gas: Option<f64>,
    pub total_gas: Option<f64>,
    pub avg_gas: Option<f64>,
    pub median_gas: Option<f64>,
    pub num_meters_elec: Option<f64>,
    pub total_elec: Option<f64>,
    pub avg_elec: Option<f64>,
    pub median_elec: Option<f64>,
}

impl FuelRecord {
    pub fn empty(postcode: String) -> Self {
        Self {
            postcode,
            ..Default::default()
        }
    }
}

/// Age-theme attribute record: residential counts per vintage band.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgeRecord {
    pub postcode: String,
    #[serde(rename = "Pre 1919")]
    pub pre_1919: Option<u32>,
    #[serde(rename = "1919-1944")]
    pub b1919_1944: Option<u32>,
    #[serde(rename = "1945-1959")]
    pub b1945_1959: Option<u32>,
    #[serde(rename = "1960-1979")]
    pub b1960_1979: Option<u32>,
    #[serde(rename = "1980-1989")]
    pub b1980_1989: Option<u32>,
    #[serde(rename = "1990-1999")]
    pub b1990_1999: Option<u32>,
    #[serde(rename = "Post 1999")]
    pub post_1999: Option<u32>,
    pub len_res: Option<u32>,
    #[serde(rename = "None_age")]
    pub none_age: Option<u32>,
}

impl AgeRecord {
    pub fn empty(postcode: String) -> Self {
        Self {
            postcode,
            ..Default::default()
        }
    }
}

/// Type-theme attribute record: residential counts per structural typology.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TypeRecord {
    pub postcode: String,
    #[serde(rename = "Medium height flats 5-6 storeys")]
    pub medium_flats: Option<u32>,
    #[serde(rename = "Small low terraces")]
    pub small_terraces: Option<u32>,
    #[serde(rename = "3-4 storey and smaller flats")]
    pub small_flats: Option<u32>,
    #[serde(rename = "Tall terraces 3-4 storeys")]
    pub tall_terraces: Option<u32>,
    #[serde(rename = "Large semi detached")]
    pub large_semi: Option<u32>,
    #[serde(rename = "Standard size detached")]
    pub standard_detached: Option<u32>,
    #[serde(rename = "Standard size semi detached")]
    pub standard_semi: Option<u32>,
    #[serde(rename = "2 storeys terraces with t rear extension")]
    pub terraces_rear_extension: Option<u32>,
    #[serde(rename = "Semi type house in multiples")]
    pub semi_multiples: Option<u32>,
    #[serde(rename = "Tall flats 6-15 storeys")]
    pub tall_flats: Option<u32>,
    #[serde(rename = "Large detached")]
    pub large_detached: Option<u32>,
    #[serde(rename = "Very tall point block flats")]
    pub point_blocks: Option<u32>,
    #[serde(rename = "Very large detached")]
    pub very_large_detached: Option<u32>,
    #[serde(rename = "Planned balanced mixed estates")]
    pub mixed_estates: Option<u32>,
    #[serde(rename = "Linked and step linked premises")]
    pub linked_premises: Option<u32>,
    #[serde(rename = "Domestic outbuilding")]
    pub outbuilding: Option<u32>,
    #[serde(rename = "Unknown")]
    pub unknown: Option<u32>,
    pub len_res: Option<u32>,
    #[serde(rename = "None_type")]
    pub none_type: Option<u32>,
}

impl TypeRecord {
    pub fn empty(postcode: String) -> Self {
        Self {
            postcode,
            ..Default::default()
        }
    }
}

fn is_residential(m: &BuildingMetrics) -> bool {
    m.record.use_type.as_deref() == Some("Residential")
}

fn res_count(metrics: &[BuildingMetrics]) -> u32 {
    metrics.iter().filter(|m| is_residential(m)).count() as u32
}

/// Residential typologies the aggregators recognise. Anything outside this
/// vocabulary is schema drift upstream and must fail loudly instead of
/// being bucketed away.
fn check_res_typologies(metrics: &[BuildingMetrics]) -> Result<()> {
    let mut unexpected: Vec<String> = metrics
        .iter()
        .filter(|m| is_residential(m))
        .filter_map(|m| m.record.premise_type.as_deref())
        .filter(|t| !RES_USE_TYPES.contains(t) && *t != "Domestic outbuilding" && *t != "Unknown")
        .map(|t| t.to_owned())
        .collect();
    unexpected.sort();
    unexpected.dedup();
    if unexpected.is_empty() {
        Ok(())
    } else {
        Err(StockError::UnexpectedCategory(unexpected))
    }
}

struct SubsetSums {
    total_buildings: Option<u32>,
    premise_area: ColSum,
    fl_area_h: ColSum,
    fl_area_fc: ColSum,
    uprn_count: ColSum,
    base_floor: ColSum,
    basement_heated_vol: ColSum,
    listed: ColSum,
}

fn sum_subset<'a, I: Iterator<Item = &'a BuildingMetrics>>(subset: I) -> SubsetSums {
    let mut sums = SubsetSums {
        total_buildings: None,
        premise_area: ColSum::default(),
        fl_area_h: ColSum::default(),
        fl_area_fc: ColSum::default(),
        uprn_count: ColSum::default(),
        base_floor: ColSum::default(),
        basement_heated_vol: ColSum::default(),
        listed: ColSum::default(),
    };
    let mut n = 0u32;
    for m in subset {
        n += 1;
        sums.premise_area.add(m.record.premise_area);
        sums.fl_area_h.add(m.area_h);
        sums.fl_area_fc.add(m.area_fc);
        sums.uprn_count.add(m.record.uprn_count);
        sums.base_floor.add(Some(m.base_floor as f64));
        sums.basement_heated_vol.add(m.basement_heated_vol);
        sums.listed.add(Some(m.listed_flag as f64));
    }
    if n > 0 {
        sums.total_buildings = Some(n);
    }
    sums
}

/// Tally the matched, imputed buildings of one unit into the fuel-theme
/// building columns.
fn fill_building_sums(metrics: &[BuildingMetrics], rec: &mut FuelRecord) -> Result<()> {
    check_res_typologies(metrics)?;

    let all = sum_subset(metrics.iter());
    rec.all_types_total_buildings = all.total_buildings;
    rec.all_types_premise_area_total = all.premise_area.total();
    rec.all_types_fl_area_h_total = all.fl_area_h.total();
    rec.all_types_fl_area_fc_total = all.fl_area_fc.total();
    rec.all_types_uprn_count_total = all.uprn_count.total();
    rec.all_types_premise_area_null_count = Some(all.premise_area.null_count());
    rec.all_types_fl_area_h_null_count = Some(all.fl_area_h.null_count());
    rec.all_types_fl_area_fc_null_count = Some(all.fl_area_fc.null_count());

    let use_count = |label: &str| {
        Some(
            metrics
                .iter()
                .filter(|m| m.record.use_type.as_deref() == Some(label))
                .count() as u32,
        )
    };
    rec.mixed_alltypes_count = use_count("Mixed Use");
    rec.comm_alltypes_count = use_count("Commercial");
    rec.unknown_alltypes_count = use_count("Non Residential");
    rec.all_residential_types_count = Some(res_count(metrics));

    let clean = sum_subset(metrics.iter().filter(|m| {
        is_residential(m)
            && m.record
                .premise_type
                .as_deref()
                .map(|t| RES_USE_TYPES.contains(&t))
                .unwrap_or(false)
    }));
    rec.clean_res_total_buildings = clean.total_buildings;
    rec.clean_res_premise_area_total = clean.premise_area.total();
    rec.clean_res_fl_area_h_total = clean.fl_area_h.total();
    rec.clean_res_fl_area_fc_total = clean.fl_area_fc.total();
    rec.clean_res_base_floor_total = clean.base_floor.total();
    rec.clean_res_basement_heated_vol_total = clean.basement_heated_vol.total();
    rec.clean_res_listed_bool_total = clean.listed.total();
    rec.clean_res_uprn_count_total = clean.uprn_count.total();
    rec.clean_res_premise_area_null_count = Some(clean.premise_area.null_count());
    rec.clean_res_fl_area_h_null_count = Some(clean.fl_area_h.null_count());
    rec.clean_res_fl_area_fc_null_count = Some(clean.fl_area_fc.null_count());

    let outb = sum_subset(
        metrics
            .iter()
            .filter(|m| {
                is_residential(m)
                    && m.record.premise_type.as_deref() == Some("Domestic outbuilding")
            }),
    );
    rec.outb_res_total_buildings = outb.total_buildings;
    rec.outb_res_premise_area_total = outb.premise_area.total();
    rec.outb_res_fl_area_h_total = outb.fl_area_h.total();
    rec.outb_res_fl_area_fc_total = outb.fl_area_fc.total();
    rec.outb_res_uprn_count_total = outb.uprn_count.total();
    rec.outb_res_premise_area_null_count = Some(outb.premise_area.null_count());
    rec.outb_res_fl_area_h_null_count = Some(outb.fl_area_h.null_count());
    rec.outb_res_fl_area_fc_null_count = Some(outb.fl_area_fc.null_count());

    Ok(())
}

/// One postcode's fuel-theme record: building sums plus the gas and
/// electricity consumption looked up from the release tables. An empty
/// building set leaves the building columns null; consumption is looked up
/// either way.
pub fn process_postcode_fuel(
    postcode: &str,
    metrics: &[BuildingMetrics],
    gas: &ConsumptionTable,
    elec: &ConsumptionTable,
) -> Result<FuelRecord> {
    let postcode = postcode.trim();
    let mut rec = FuelRecord::empty(postcode.to_owned());
    if !metrics.is_empty() {
        fill_building_sums(metrics, &mut rec)?;
    }

    if let Some(row) = gas.get(postcode) {
        rec.num_meters_gas = row.num_meters;
        rec.total_gas = row.total_kwh;
        rec.avg_gas = row.mean_kwh;
        rec.median_gas = row.median_kwh;
    }
    if let Some(row) = elec.get(postcode) {
        rec.num_meters_elec = row.num_meters;
        rec.total_elec = row.total_kwh;
        rec.avg_elec = row.mean_kwh;
        rec.median_elec = row.median_kwh;
    }
    Ok(rec)
}

/// One postcode's age-theme record: counts per vintage band among the
/// residential buildings. Bands keep the survey convention that a count
/// column only materialises once a band is observed; missing and
/// "Unknown date" vintages land in the explicit unknown bucket.
pub fn process_postcode_age(postcode: &str, metrics: &[BuildingMetrics]) -> Result<AgeRecord> {
    let postcode = postcode.trim();
    if metrics.is_empty() {
        return Ok(AgeRecord::empty(postcode.to_owned()));
    }

    let mut counts: HashMap<String, u32> = HashMap::new();
    let mut none_age = 0u32;
    let mut unexpected: Vec<String> = Vec::new();
    for m in metrics.iter().filter(|m| is_residential(m)) {
        match m.age_bucket.as_deref() {
            None | Some("Unknown date") => none_age += 1,
            Some(band) if AGE_BANDS.contains(&band) => {
                *counts.entry(band.to_owned()).or_insert(0) += 1;
            }
            Some(other) => unexpected.push(other.to_owned()),
        }
    }
    if !unexpected.is_empty() {
        unexpected.sort();
        unexpected.dedup();
        return Err(StockError::UnexpectedCategory(unexpected));
    }

    let observed = |band: &str| counts.get(band).copied();
    Ok(AgeRecord {
        postcode: postcode.to_owned(),
        pre_1919: observed("Pre 1919"),
        b1919_1944: observed("1919-1944"),
        b1945_1959: observed("1945-1959"),
        b1960_1979: observed("1960-1979"),
        b1980_1989: observed("1980-1989"),
        b1990_1999: observed("1990-1999"),
        post_1999: observed("Post 1999"),
        len_res: Some(res_count(metrics)),
        none_age: Some(none_age),
    })
}

/// One postcode's type-theme record: counts per recognised typology among
/// the residential buildings, with missing typologies in the unknown
/// bucket.
pub fn process_postcode_type(postcode: &str, metrics: &[BuildingMetrics]) -> Result<TypeRecord> {
    let postcode = postcode.trim();
    if metrics.is_empty() {
        return Ok(TypeRecord::empty(postcode.to_owned()));
    }
    check_res_typologies(metrics)?;

    let mut counts: HashMap<String, u32> = HashMap::new();
    let mut none_type = 0u32;
    for m in metrics.iter().filter(|m| is_residential(m)) {
        match m.record.premise_type.as_deref() {
            None => none_type += 1,
            Some(t) if PREM_TYPES.contains(&t) => {
                *counts.entry(t.to_owned()).or_insert(0) += 1;
            }
            // check_res_typologies already rejected anything else
            Some(_) => unreachable!("unrecognised typology survived the schema check"),
        }
    }

    let observed = |label: &str| counts.get(label).copied();
    Ok(TypeRecord {
        postcode: postcode.to_owned(),
        medium_flats: observed("Medium height flats 5-6 storeys"),
        small_terraces: observed("Small low terraces"),
        small_flats: observed("3-4 storey and smaller flats"),
        tall_terraces: observed("Tall terraces 3-4 storeys"),
        large_semi: observed("Large semi detached"),
        standard_detached: observed("Standard size detached"),
        standard_semi: observed("Standard size semi detached"),
        terraces_rear_extension: observed("2 storeys terraces with t rear extension"),
        semi_multiples: observed("Semi type house in multiples"),
        tall_flats: observed("Tall flats 6-15 storeys"),
        large_detached: observed("Large detached"),
        point_blocks: observed("Very tall point block flats"),
        very_large_detached: observed("Very large detached"),
        mixed_estates: observed("Planned balanced mixed estates"),
        linked_premises: observed("Linked and step linked premises"),
        outbuilding: observed("Domestic outbuilding"),
        unknown: observed("Unknown"),
        len_res: Some(res_count(metrics)),
        none_type: Some(none_type),
    })
}
