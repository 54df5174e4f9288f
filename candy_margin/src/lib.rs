//! Product line profitability and margin aggregation for candy distributor sales.

use std::collections::HashSet;
use std::io::Read;
#[cfg(feature = "fs")]
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

mod export;
mod filter;
mod pareto;
mod summary;

pub use export::{
    products_csv, write_cost_points, write_divisions, write_pareto, write_products,
};
pub use filter::{FilterState, DEFAULT_MARGIN_THRESHOLD_PCT};
pub use pareto::{pareto_curve, ParetoCurve, ParetoPoint, PARETO_GUIDE_SHARE};
pub use summary::{
    cost_diagnostics, division_summary, flag_below_threshold, product_summary, search_products,
    CostPoint, DivisionSummary, ProductSummary, Totals,
};

#[derive(Error, Debug)]
pub enum MarginError {
    #[error("failed to read sales data: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("required column '{0}' not found in header")]
    MissingColumn(String),
    #[error("sales data contained no usable rows")]
    EmptyDataset,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

pub const COL_ORDER_DATE: &str = "Order Date";
pub const COL_SHIP_DATE: &str = "Ship Date";
pub const COL_DIVISION: &str = "Division";
pub const COL_PRODUCT_NAME: &str = "Product Name";
pub const COL_SALES: &str = "Sales";
pub const COL_COST: &str = "Cost";
pub const COL_GROSS_PROFIT: &str = "Gross Profit";
pub const COL_UNITS: &str = "Units";

pub const REQUIRED_COLUMNS: [&str; 8] = [
    COL_ORDER_DATE,
    COL_SHIP_DATE,
    COL_DIVISION,
    COL_PRODUCT_NAME,
    COL_SALES,
    COL_COST,
    COL_GROSS_PROFIT,
    COL_UNITS,
];

/// Date layouts tried in order when no explicit format is configured.
pub const DATE_FORMATS: [&str; 5] = ["%d-%m-%Y", "%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y", "%Y/%m/%d"];

const MAX_ROW_WARNINGS: usize = 10;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadOptions {
    /// chrono format string applied to both date columns; `None` tries [`DATE_FORMATS`].
    pub date_format: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SalesRecord {
    pub order_date: Option<NaiveDate>,
    pub ship_date: Option<NaiveDate>,
    pub division: String,
    pub product_name: String,
    pub sales: f64,
    pub cost: f64,
    pub gross_profit: f64,
    pub units: f64,
}

impl SalesRecord {
    pub fn gross_margin(&self) -> Option<f64> {
        ratio(self.gross_profit, self.sales)
    }

    pub fn profit_per_unit(&self) -> Option<f64> {
        ratio(self.gross_profit, self.units)
    }
}

/// Division that yields `None` instead of an infinite or undefined value.
pub fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator == 0.0 {
        return None;
    }
    let value = numerator / denominator;
    value.is_finite().then_some(value)
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadReport {
    pub rows: usize,
    pub skipped_rows: usize,
    /// Blank numeric cells; each contributes nothing to its column's sums.
    #[serde(default)]
    pub missing_values: usize,
    pub bad_order_dates: usize,
    pub bad_ship_dates: usize,
    pub fingerprint: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Dataset {
    pub records: Vec<SalesRecord>,
    pub report: LoadReport,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Earliest and latest parsed order dates.
    pub fn order_date_bounds(&self) -> Option<(NaiveDate, NaiveDate)> {
        let mut dates = self.records.iter().filter_map(|r| r.order_date);
        let first = dates.next()?;
        Some(dates.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d))))
    }

    /// Unique divisions in first-appearance order.
    pub fn divisions(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .filter(|r| seen.insert(r.division.as_str()))
            .map(|r| r.division.clone())
            .collect()
    }

    /// Concatenate several datasets, keeping record order and summing the load counters.
    pub fn concat(parts: Vec<Dataset>) -> Dataset {
        let mut out = Dataset::default();
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.report.fingerprint.as_bytes());
            out.report.rows += part.report.rows;
            out.report.skipped_rows += part.report.skipped_rows;
            out.report.missing_values += part.report.missing_values;
            out.report.bad_order_dates += part.report.bad_order_dates;
            out.report.bad_ship_dates += part.report.bad_ship_dates;
            out.records.extend(part.records);
        }
        out.report.fingerprint = hex_digest(hasher);
        out
    }
}

#[derive(Debug, Deserialize)]
struct RawRow {
    #[serde(rename = "Order Date", default)]
    order_date: String,
    #[serde(rename = "Ship Date", default)]
    ship_date: String,
    #[serde(rename = "Division")]
    division: String,
    #[serde(rename = "Product Name")]
    product_name: String,
    #[serde(rename = "Sales", default)]
    sales: Option<f64>,
    #[serde(rename = "Cost", default)]
    cost: Option<f64>,
    #[serde(rename = "Gross Profit", default)]
    gross_profit: Option<f64>,
    #[serde(rename = "Units", default)]
    units: Option<f64>,
}

impl RawRow {
    fn missing_values(&self) -> usize {
        [self.sales, self.cost, self.gross_profit, self.units]
            .iter()
            .filter(|v| v.is_none())
            .count()
    }
}

/// Parse sales rows from CSV bytes, coercing unparseable dates to `None`.
///
/// Blank numeric cells keep their row and count as zero in every sum; a
/// non-blank cell that is not a number skips the row.
pub fn parse_sales(input: &[u8], options: &LoadOptions) -> Result<Dataset, MarginError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(input);

    let headers = reader.headers()?.clone();
    for column in REQUIRED_COLUMNS {
        if !headers.iter().any(|h| h == column) {
            return Err(MarginError::MissingColumn(column.to_string()));
        }
    }

    let mut report = LoadReport {
        fingerprint: fingerprint(input),
        ..LoadReport::default()
    };
    let mut records = Vec::new();

    for (idx, row) in reader.deserialize::<RawRow>().enumerate() {
        let raw = match row {
            Ok(raw) => raw,
            Err(err) => {
                report.skipped_rows += 1;
                if report.skipped_rows <= MAX_ROW_WARNINGS {
                    // +2: header line and 1-based numbering
                    warn!("skipping row {}: {}", idx + 2, err);
                }
                continue;
            }
        };

        report.missing_values += raw.missing_values();
        let order_date = coerce_date(&raw.order_date, options);
        if order_date.is_none() {
            report.bad_order_dates += 1;
        }
        let ship_date = coerce_date(&raw.ship_date, options);
        if ship_date.is_none() {
            report.bad_ship_dates += 1;
        }

        records.push(SalesRecord {
            order_date,
            ship_date,
            division: raw.division,
            product_name: raw.product_name,
            sales: raw.sales.unwrap_or(0.0),
            cost: raw.cost.unwrap_or(0.0),
            gross_profit: raw.gross_profit.unwrap_or(0.0),
            units: raw.units.unwrap_or(0.0),
        });
    }

    if report.skipped_rows > MAX_ROW_WARNINGS {
        warn!(
            "{} malformed rows skipped ({} not shown)",
            report.skipped_rows,
            report.skipped_rows - MAX_ROW_WARNINGS
        );
    }
    if records.is_empty() {
        return Err(MarginError::EmptyDataset);
    }

    report.rows = records.len();
    debug!(
        rows = report.rows,
        skipped = report.skipped_rows,
        bad_order_dates = report.bad_order_dates,
        "parsed sales data"
    );
    Ok(Dataset { records, report })
}

pub fn read_sales<R: Read>(mut reader: R, options: &LoadOptions) -> Result<Dataset, MarginError> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    parse_sales(&buf, options)
}

#[cfg(feature = "fs")]
pub fn load_sales(path: &Path, options: &LoadOptions) -> Result<Dataset, MarginError> {
    let file = std::fs::File::open(path)?;
    read_sales(std::io::BufReader::new(file), options)
}

/// Parse a date cell; empty or unrecognised values become `None`.
pub fn coerce_date(value: &str, options: &LoadOptions) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    match options.date_format.as_deref() {
        Some(format) => parse_date_with(value, format),
        None => DATE_FORMATS
            .iter()
            .find_map(|format| parse_date_with(value, format)),
    }
}

fn parse_date_with(value: &str, format: &str) -> Option<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(value, format) {
        return Some(date);
    }
    NaiveDateTime::parse_from_str(value, &format!("{format} %H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(value, &format!("{format} %H:%M")))
        .ok()
        .map(|dt| dt.date())
}

fn fingerprint(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Every view the dashboard shows for one filter selection.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Dashboard {
    pub filters: FilterState,
    pub totals: Totals,
    pub products: Vec<ProductSummary>,
    pub divisions: Vec<DivisionSummary>,
    pub cost_points: Vec<CostPoint>,
    pub pareto: ParetoCurve,
    pub search_results: Option<Vec<ProductSummary>>,
}

/// Filter the dataset and derive every aggregate from the surviving rows.
pub fn build_dashboard(dataset: &Dataset, filters: &FilterState) -> Dashboard {
    let rows = filters.apply(dataset);

    let mut products = product_summary(&rows);
    flag_below_threshold(&mut products, filters.margin_threshold_pct);
    let pareto = pareto_curve(&products);
    let search_results = search_products(&products, &filters.search);

    Dashboard {
        filters: filters.clone(),
        totals: Totals::from_rows(&rows),
        divisions: division_summary(&rows),
        cost_points: cost_diagnostics(&rows),
        products,
        pareto,
        search_results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Row ID,Order Date,Ship Date,Division,Product Name,Sales,Units,Gross Profit,Cost
1,13-10-2021,15-10-2021,Chocolate,Wonka Bar - Triple Dazzle Caramel,30.00,5,20.00,10.00
2,02-01-2022,not a date,Sugar,Laffy Taffy,12.00,4,6.00,6.00
3,,05-01-2022,Chocolate,Wonka Bar - Milk Chocolate,10.00,2,8.00,2.00
";

    #[test]
    fn parses_rows_and_coerces_bad_dates() {
        let ds = parse_sales(SAMPLE.as_bytes(), &LoadOptions::default()).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.report.bad_order_dates, 1);
        assert_eq!(ds.report.bad_ship_dates, 1);
        assert_eq!(
            ds.records[0].order_date,
            NaiveDate::from_ymd_opt(2021, 10, 13)
        );
        assert_eq!(ds.records[1].ship_date, None);
        assert_eq!(ds.records[2].order_date, None);
        assert_eq!(ds.report.fingerprint.len(), 64);
    }

    #[test]
    fn skips_rows_with_malformed_numbers() {
        let input = "\
Order Date,Ship Date,Division,Product Name,Sales,Units,Gross Profit,Cost
2021-01-01,2021-01-02,Sugar,Nerds,abc,1,1,1
2021-01-01,2021-01-02,Sugar,Nerds,4,1,1,3
";
        let ds = parse_sales(input.as_bytes(), &LoadOptions::default()).unwrap();
        assert_eq!(ds.report.skipped_rows, 1);
        assert_eq!(ds.len(), 1);
        assert_eq!(ds.records[0].sales, 4.0);
    }

    #[test]
    fn blank_numeric_cells_keep_the_row() {
        let input = "\
Order Date,Ship Date,Division,Product Name,Sales,Units,Gross Profit,Cost
2021-01-01,2021-01-02,Chocolate,Milk Bar,10,2,6,4
2021-01-03,2021-01-04,Chocolate,Milk Bar,30,4,9,
2021-01-05,2021-01-06,Chocolate,Milk Bar, ,1,2,1
";
        let ds = parse_sales(input.as_bytes(), &LoadOptions::default()).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.report.skipped_rows, 0);
        assert_eq!(ds.report.missing_values, 2);
        assert_eq!(ds.records[1].cost, 0.0);

        let rows: Vec<&SalesRecord> = ds.records.iter().collect();
        let milk = &product_summary(&rows)[0];
        assert_eq!(milk.sales, 40.0);
        assert_eq!(milk.gross_profit, 17.0);
        assert_eq!(milk.units, 7.0);
        assert_eq!(cost_diagnostics(&rows)[0].cost, 5.0);
    }

    #[test]
    fn missing_column_is_reported() {
        let input = "Order Date,Division,Product Name,Sales\n2021-01-01,Sugar,Nerds,1\n";
        let err = parse_sales(input.as_bytes(), &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, MarginError::MissingColumn(ref c) if c == "Ship Date"));
    }

    #[test]
    fn header_only_file_is_empty() {
        let input = "Order Date,Ship Date,Division,Product Name,Sales,Units,Gross Profit,Cost\n";
        let err = parse_sales(input.as_bytes(), &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, MarginError::EmptyDataset));
    }

    #[test]
    fn explicit_date_format_disables_guessing() {
        let opts = LoadOptions {
            date_format: Some("%m/%d/%Y".into()),
        };
        assert_eq!(
            coerce_date("10/13/2021", &opts),
            NaiveDate::from_ymd_opt(2021, 10, 13)
        );
        assert_eq!(coerce_date("2021-10-13", &opts), None);
        assert_eq!(
            coerce_date("2021-10-13", &LoadOptions::default()),
            NaiveDate::from_ymd_opt(2021, 10, 13)
        );
        assert_eq!(
            coerce_date("2021-10-13 08:30:00", &LoadOptions::default()),
            NaiveDate::from_ymd_opt(2021, 10, 13)
        );
    }

    #[test]
    fn ratios_guard_zero_denominators() {
        assert_eq!(ratio(5.0, 0.0), None);
        assert_eq!(ratio(0.0, 0.0), None);
        assert_eq!(ratio(1.0, 4.0), Some(0.25));
    }

    #[test]
    fn derived_row_metrics() {
        let ds = parse_sales(SAMPLE.as_bytes(), &LoadOptions::default()).unwrap();
        let first = &ds.records[0];
        assert!((first.gross_margin().unwrap() - 20.0 / 30.0).abs() < 1e-12);
        assert_eq!(first.profit_per_unit(), Some(4.0));
    }

    #[test]
    fn bounds_and_divisions() {
        let ds = parse_sales(SAMPLE.as_bytes(), &LoadOptions::default()).unwrap();
        assert_eq!(
            ds.order_date_bounds(),
            Some((
                NaiveDate::from_ymd_opt(2021, 10, 13).unwrap(),
                NaiveDate::from_ymd_opt(2022, 1, 2).unwrap()
            ))
        );
        assert_eq!(ds.divisions(), vec!["Chocolate", "Sugar"]);
    }

    #[test]
    fn concat_keeps_order_and_counters() {
        let a = parse_sales(SAMPLE.as_bytes(), &LoadOptions::default()).unwrap();
        let b = a.clone();
        let merged = Dataset::concat(vec![a, b]);
        assert_eq!(merged.len(), 6);
        assert_eq!(merged.report.rows, 6);
        assert_eq!(merged.report.bad_order_dates, 2);
        assert_eq!(merged.records[3].product_name, "Wonka Bar - Triple Dazzle Caramel");
    }

    #[test]
    fn dataset_survives_json_cache() {
        let ds = parse_sales(SAMPLE.as_bytes(), &LoadOptions::default()).unwrap();
        let text = serde_json::to_string(&ds).unwrap();
        let back: Dataset = serde_json::from_str(&text).unwrap();
        assert_eq!(back, ds);
        assert_eq!(back.records[2].order_date, None);
    }
}
