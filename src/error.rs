use thiserror::Error;

/// Failure kinds for the attribution pipeline. Everything here is fatal at
/// the point of detection: each variant means either a data-quality problem
/// that needs a human, or schema drift between pipeline stages. The one
/// expected soft case - a postcode with no buildings - is not an error and
/// is represented by an all-null attribute record instead.
#[derive(Debug, Error)]
pub enum StockError {
    #[error("duplicate unit key: {0}")]
    DuplicateKey(String),

    #[error("cannot derive local fill: {valid_fc} valid floor counts, {valid_height} valid heights in group of {group_size}")]
    InsufficientLocalBasis {
        group_size: usize,
        valid_fc: usize,
        valid_height: usize,
    },

    #[error("log schema mismatch: existing header {existing:?}, new rows {new:?}")]
    SchemaMismatch {
        existing: Vec<String>,
        new: Vec<String>,
    },

    #[error("unexpected residential typology: {0:?}")]
    UnexpectedCategory(Vec<String>),

    #[error("column {column} outside [0, 100] for {offenders:?}")]
    RangeValidation {
        column: String,
        offenders: Vec<String>,
    },

    #[error("seasonal {metric} totals deviate from annual beyond tolerance {tolerance} for {count} rows")]
    Tolerance {
        metric: String,
        tolerance: f64,
        count: usize,
    },

    #[error("no rows joined against the global average table")]
    EmptyGlobalJoin,

    #[error("count conservation violated: category sums do not match len_res for {0:?}")]
    CountConservation(Vec<String>),

    #[error("missing column {0}")]
    MissingColumn(String),

    #[error("missing or non-polygon geometry for feature {0}")]
    BadGeometry(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    GeoJson(#[from] geojson::Error),
}

pub type Result<T> = std::result::Result<T, StockError>;
