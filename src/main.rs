use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use aggregate::{
    process_postcode_age, process_postcode_fuel, process_postcode_type, ConsumptionTable,
};
use batch::{
    load_registry, load_work_list, log_path_for, run_batch, split_region_work_lists, RunnerConfig,
    UnitRecord,
};
use buildings::{process_building_group, BuildingMetrics, FloorHeightThresholds};
use error::Result;
use lookup::GlobalAverages;
use postcode::{match_unit_buildings, GeoJsonBuildings, UnitBoundaries, UnitIndex};

pub mod aggregate;
pub mod batch;
pub mod buildings;
pub mod error;
pub mod lookup;
pub mod postcode;
pub mod postprocess;
pub mod validate;

/// Residential typologies recognised by the aggregators. Domestic
/// outbuildings and the survey's own "Unknown" label are tracked
/// separately.
pub const RES_USE_TYPES: [&'static str; 15] = [
    "Medium height flats 5-6 storeys",
    "Small low terraces",
    "3-4 storey and smaller flats",
    "Tall terraces 3-4 storeys",
    "Large semi detached",
    "Standard size detached",
    "Standard size semi detached",
    "2 storeys terraces with t rear extension",
    "Semi type house in multiples",
    "Tall flats 6-15 storeys",
    "Large detached",
    "Very tall point block flats",
    "Very large detached",
    "Planned balanced mixed estates",
    "Linked and step linked premises",
];

/// Column vocabulary of the type theme.
pub const PREM_TYPES: [&'static str; 17] = [
    "Medium height flats 5-6 storeys",
    "Small low terraces",
    "3-4 storey and smaller flats",
    "Tall terraces 3-4 storeys",
    "Large semi detached",
    "Standard size detached",
    "Standard size semi detached",
    "2 storeys terraces with t rear extension",
    "Semi type house in multiples",
    "Tall flats 6-15 storeys",
    "Large detached",
    "Very tall point block flats",
    "Very large detached",
    "Planned balanced mixed estates",
    "Linked and step linked premises",
    "Domestic outbuilding",
    "Unknown",
];

/// Vintage bands of the age theme, oldest first.
pub const AGE_BANDS: [&'static str; 7] = [
    "Pre 1919",
    "1919-1944",
    "1945-1959",
    "1960-1979",
    "1980-1989",
    "1990-1999",
    "Post 1999",
];

pub const THEMES: [&'static str; 3] = ["fuel", "age", "type"];

// Stages to run. Batches are independent, so a cluster run launches one
// process per batch with only the relevant stages enabled.
const STAGE0_SPLIT_REGIONS: bool = false;
const STAGE1_FUEL: bool = true;
const STAGE1_AGE: bool = true;
const STAGE1_TYPE: bool = true;
const STAGE2_POST_PROCESS: bool = true;
const STAGE2_VALIDATE: bool = true;

const BATCH_SIZE: usize = 10_000;
const SUB_BATCH_SIZE: usize = 1_000;

/// Everything the pipeline reads and writes, resolved up front so a batch
/// process fails fast on a missing input instead of half way through.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub buildings_path: PathBuf,
    pub boundaries_path: PathBuf,
    pub gas_path: PathBuf,
    pub elec_path: PathBuf,
    pub onsud_dir: PathBuf,
    pub batches_dir: PathBuf,
    pub registry_path: PathBuf,
    pub intermediate_root: PathBuf,
    pub output_dir: PathBuf,
    pub exclusion_path: PathBuf,
    pub batch_size: usize,
    pub sub_batch_size: usize,
    pub thresholds: FloorHeightThresholds,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let input = PathBuf::from("input_data_sources");
        Self {
            buildings_path: input.join("building_stock/buildings.geojson"),
            boundaries_path: input.join("postcode_boundaries/postcodes.geojson"),
            gas_path: input.join("energy_data/Postcode_level_gas_2022.csv"),
            elec_path: input.join("energy_data/Postcode_level_all_meters_electricity_2022.csv"),
            onsud_dir: input.join("ONS_UPRN_database"),
            batches_dir: PathBuf::from("batches"),
            registry_path: PathBuf::from("batch_paths.txt"),
            intermediate_root: PathBuf::from("intermediate_data"),
            output_dir: PathBuf::from("final_dataset"),
            exclusion_path: PathBuf::from("overlapping_pcs.txt"),
            batch_size: BATCH_SIZE,
            sub_batch_size: SUB_BATCH_SIZE,
            thresholds: FloorHeightThresholds::default(),
        }
    }
}

/// Postcodes carved out of every run (the cross-region overlap set). A
/// missing file just means nothing is excluded.
fn load_exclusions(path: &Path) -> HashSet<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => text
            .lines()
            .map(|line| line.trim().to_owned())
            .filter(|line| !line.is_empty())
            .collect(),
        Err(_) => {
            warn!(path = %path.display(), "no exclusion list found");
            HashSet::new()
        }
    }
}

/// Per-batch processing context: the batch's identifier join plus the
/// shared read-only stores.
struct BatchContext<'a> {
    index: UnitIndex,
    boundaries: &'a UnitBoundaries,
    store: &'a GeoJsonBuildings,
    averages: &'a GlobalAverages,
    thresholds: FloorHeightThresholds,
}

impl BatchContext<'_> {
    fn imputed_unit(&self, postcode: &str) -> Result<Vec<BuildingMetrics>> {
        let matched = match_unit_buildings(postcode, &self.index, self.boundaries, self.store)?;
        if matched.is_empty() {
            return Ok(Vec::new());
        }
        process_building_group(matched, self.averages, &self.thresholds)
    }
}

fn batch_parts(batch_path: &Path) -> (String, String) {
    let region = batch_path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_owned();
    let batch_id = batch_path
        .file_stem()
        .and_then(|n| n.to_str())
        .and_then(|n| n.rsplit('_').next())
        .unwrap_or("0")
        .to_owned();
    (region, batch_id)
}

fn run_theme_batches<T, F>(
    config: &PipelineConfig,
    theme: &str,
    runner: &RunnerConfig,
    mut process: F,
) -> Result<()>
where
    T: UnitRecord,
    F: FnMut(&str, &BatchContext) -> Result<Option<T>>,
{
    let boundaries = UnitBoundaries::from_path(&config.boundaries_path)?;
    let store = GeoJsonBuildings::from_path(&config.buildings_path)?;
    let averages: &GlobalAverages = lookup::global_averages()?;
    info!(
        theme,
        boundaries = boundaries.len(),
        buildings = store.len(),
        "loaded shared stores"
    );

    let batch_paths = load_registry(&config.registry_path)?;
    for batch_path in batch_paths {
        let (region, batch_id) = batch_parts(&batch_path);
        info!(theme, region = %region, batch_id = %batch_id, "processing batch");

        let units = load_work_list(&batch_path)?;
        let subset_path = batch_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("onsud_{batch_id}.csv"));
        let context = BatchContext {
            index: UnitIndex::from_path(&subset_path)?,
            boundaries: &boundaries,
            store: &store,
            averages,
            thresholds: config.thresholds,
        };

        let log_path = log_path_for(&config.intermediate_root, theme, &region, &batch_id);
        let summary = run_batch(&units, runner, &log_path, |pc| process(pc, &context))?;
        info!(theme, region = %region, batch_id = %batch_id, ?summary, "batch done");
    }
    Ok(())
}

fn run_fuel(config: &PipelineConfig, runner: &RunnerConfig) -> Result<()> {
    let gas = ConsumptionTable::from_path(&config.gas_path)?;
    let elec = ConsumptionTable::from_path(&config.elec_path)?;
    run_theme_batches(config, "fuel", runner, |pc, ctx: &BatchContext| {
        let metrics = ctx.imputed_unit(pc)?;
        process_postcode_fuel(pc, &metrics, &gas, &elec).map(Some)
    })
}

fn run_age(config: &PipelineConfig, runner: &RunnerConfig) -> Result<()> {
    run_theme_batches(config, "age", runner, |pc, ctx: &BatchContext| {
        let metrics = ctx.imputed_unit(pc)?;
        process_postcode_age(pc, &metrics).map(Some)
    })
}

fn run_type(config: &PipelineConfig, runner: &RunnerConfig) -> Result<()> {
    run_theme_batches(config, "type", runner, |pc, ctx: &BatchContext| {
        let metrics = ctx.imputed_unit(pc)?;
        process_postcode_type(pc, &metrics).map(Some)
    })
}

fn run_split(config: &PipelineConfig, regions: &[String]) -> Result<()> {
    for region in regions {
        let join_path = config.onsud_dir.join(format!("ONSUD_{region}.csv"));
        let batch_dir = config.batches_dir.join(region);
        info!(region = %region, path = %join_path.display(), "splitting region");
        let paths = split_region_work_lists(
            &join_path,
            &batch_dir,
            &config.registry_path,
            config.batch_size,
        )?;
        info!(region = %region, batches = paths.len(), "region split complete");
    }
    Ok(())
}

fn run_post_process(config: &PipelineConfig, excluded: &HashSet<String>) -> Result<()> {
    let logs_dir = config.output_dir.join("attribute_logs");
    for theme in THEMES {
        let entries = postprocess::collect_log_entries(&config.intermediate_root.join(theme))?;
        postprocess::write_log_entries(&logs_dir.join(format!("{theme}_log_file.csv")), &entries)?;

        let mut table = postprocess::load_from_entries(&entries, excluded)?;
        match theme {
            "type" => postprocess::type_percentages(&mut table)?,
            "age" => postprocess::age_percentages(&mut table)?,
            "fuel" => postprocess::fuel_checks(&table)?,
            _ => unreachable!(),
        }
        let out = config.output_dir.join(format!("processed_{theme}.csv"));
        table.write_csv(&out)?;
        info!(theme, rows = table.rows.len(), path = %out.display(), "post-processed theme");
    }
    Ok(())
}

fn run_validation(config: &PipelineConfig) -> Result<bool> {
    let mut themes = HashMap::new();
    for theme in THEMES {
        let entries = postprocess::collect_log_entries(&config.intermediate_root.join(theme))?;
        themes.insert(theme.to_owned(), entries);
    }
    let report = validate::run_consistency_checks(&themes, config.batch_size);
    println!("{report}");
    Ok(report.valid())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = PipelineConfig::default();
    // One region locally; the job array exports REGION_LIST per task.
    let regions: Vec<String> = std::env::var("REGION_LIST")
        .map(|v| v.split(',').map(|r| r.trim().to_owned()).collect())
        .unwrap_or_else(|_| vec!["NW".to_owned()]);

    let runner = RunnerConfig {
        sub_batch_size: config.sub_batch_size,
        excluded: load_exclusions(&config.exclusion_path),
    };
    info!(?regions, excluded = runner.excluded.len(), "pipeline starting");

    if STAGE0_SPLIT_REGIONS {
        run_split(&config, &regions)?;
    }
    if STAGE1_FUEL {
        run_fuel(&config, &runner)?;
    }
    if STAGE1_AGE {
        run_age(&config, &runner)?;
    }
    if STAGE1_TYPE {
        run_type(&config, &runner)?;
    }
    if STAGE2_POST_PROCESS {
        run_post_process(&config, &runner.excluded)?;
    }
    if STAGE2_VALIDATE && !run_validation(&config)? {
        error!("cross-batch consistency checks failed");
        anyhow::bail!("log consistency validation failed");
    }

    info!("pipeline complete");
    Ok(())
}
