use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use super::{ratio, SalesRecord};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProductSummary {
    pub product_name: String,
    pub sales: f64,
    pub gross_profit: f64,
    pub units: f64,
    pub gross_margin: Option<f64>,
    pub profit_per_unit: Option<f64>,
    #[serde(default)]
    pub below_threshold: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DivisionSummary {
    pub division: String,
    pub sales: f64,
    pub gross_profit: f64,
    pub gross_margin: Option<f64>,
}

/// One product on the cost-vs-sales diagnostic scatter.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CostPoint {
    pub product_name: String,
    pub sales: f64,
    pub cost: f64,
    pub gross_profit: f64,
    pub gross_margin: Option<f64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Totals {
    pub rows: usize,
    pub sales: f64,
    pub cost: f64,
    pub gross_profit: f64,
    pub units: f64,
    pub gross_margin: Option<f64>,
    pub profit_per_unit: Option<f64>,
}

impl Totals {
    pub fn from_rows(rows: &[&SalesRecord]) -> Self {
        let mut totals = rows.iter().fold(Totals::default(), |mut acc, r| {
            acc.rows += 1;
            acc.sales += r.sales;
            acc.cost += r.cost;
            acc.gross_profit += r.gross_profit;
            acc.units += r.units;
            acc
        });
        totals.gross_margin = ratio(totals.gross_profit, totals.sales);
        totals.profit_per_unit = ratio(totals.gross_profit, totals.units);
        totals
    }
}

#[derive(Default)]
struct Sums {
    sales: f64,
    cost: f64,
    gross_profit: f64,
    units: f64,
}

impl Sums {
    fn add(&mut self, record: &SalesRecord) {
        self.sales += record.sales;
        self.cost += record.cost;
        self.gross_profit += record.gross_profit;
        self.units += record.units;
    }
}

fn group_by<'a, F>(rows: &[&'a SalesRecord], key: F) -> BTreeMap<&'a str, Sums>
where
    F: Fn(&'a SalesRecord) -> &'a str,
{
    let mut groups: BTreeMap<&str, Sums> = BTreeMap::new();
    for &row in rows {
        groups.entry(key(row)).or_default().add(row);
    }
    groups
}

/// Per-product totals, most profitable first (ties broken by name).
pub fn product_summary(rows: &[&SalesRecord]) -> Vec<ProductSummary> {
    let mut out: Vec<ProductSummary> = group_by(rows, |r| r.product_name.as_str())
        .into_iter()
        .map(|(name, sums)| ProductSummary {
            product_name: name.to_string(),
            sales: sums.sales,
            gross_profit: sums.gross_profit,
            units: sums.units,
            gross_margin: ratio(sums.gross_profit, sums.sales),
            profit_per_unit: ratio(sums.gross_profit, sums.units),
            below_threshold: false,
        })
        .collect();
    sort_by_profit_desc(&mut out);
    out
}

pub(crate) fn sort_by_profit_desc(products: &mut [ProductSummary]) {
    products.sort_by(|a, b| {
        OrderedFloat(b.gross_profit)
            .cmp(&OrderedFloat(a.gross_profit))
            .then_with(|| a.product_name.cmp(&b.product_name))
    });
}

/// Per-division totals in division name order.
pub fn division_summary(rows: &[&SalesRecord]) -> Vec<DivisionSummary> {
    group_by(rows, |r| r.division.as_str())
        .into_iter()
        .map(|(division, sums)| DivisionSummary {
            division: division.to_string(),
            sales: sums.sales,
            gross_profit: sums.gross_profit,
            gross_margin: ratio(sums.gross_profit, sums.sales),
        })
        .collect()
}

pub fn cost_diagnostics(rows: &[&SalesRecord]) -> Vec<CostPoint> {
    group_by(rows, |r| r.product_name.as_str())
        .into_iter()
        .map(|(name, sums)| CostPoint {
            product_name: name.to_string(),
            sales: sums.sales,
            cost: sums.cost,
            gross_profit: sums.gross_profit,
            gross_margin: ratio(sums.gross_profit, sums.sales),
        })
        .collect()
}

/// Mark products whose margin sits below `threshold_pct` percent.
///
/// Products without a defined margin (zero sales) are never flagged.
pub fn flag_below_threshold(products: &mut [ProductSummary], threshold_pct: u8) {
    let threshold = f64::from(threshold_pct) / 100.0;
    for product in products {
        product.below_threshold = product.gross_margin.is_some_and(|m| m < threshold);
    }
}

/// Case-insensitive substring search on product name; blank terms yield `None`.
///
/// Hits come back in product name order.
pub fn search_products(products: &[ProductSummary], term: &str) -> Option<Vec<ProductSummary>> {
    let needle = term.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    let mut hits: Vec<ProductSummary> = products
        .iter()
        .filter(|p| p.product_name.to_lowercase().contains(&needle))
        .cloned()
        .collect();
    hits.sort_by(|a, b| a.product_name.cmp(&b.product_name));
    Some(hits)
}
