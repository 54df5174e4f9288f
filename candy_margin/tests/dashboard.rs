use std::collections::BTreeSet;

use candy_margin::{build_dashboard, read_sales, FilterState, LoadOptions, PARETO_GUIDE_SHARE};
use chrono::NaiveDate;

const SALES: &str = "\
Row ID,Order ID,Order Date,Ship Date,Ship Mode,Division,Region,Product Name,Sales,Units,Gross Profit,Cost
1,US-2021-1,03-01-2021,07-01-2021,Standard Class,Chocolate,Interior,Wonka Bar - Milk Chocolate,19.50,5,12.35,7.15
2,US-2021-2,15-02-2021,18-02-2021,Second Class,Chocolate,Atlantic,Wonka Bar - Scrumdiddlyumptious,35.10,9,23.40,11.70
3,US-2021-3,20-03-2021,25-03-2021,Standard Class,Sugar,Pacific,Laffy Taffy,6.40,2,4.16,2.24
4,US-2021-4,11-04-2021,13-04-2021,First Class,Sugar,Gulf,Nerds,11.70,3,7.80,3.90
5,US-2021-5,09-05-2021,14-05-2021,Standard Class,Other,Interior,Kazookles,4.99,1,0.99,4.00
6,US-2021-6,30-06-2021,02-07-2021,Standard Class,Chocolate,Atlantic,Wonka Bar - Milk Chocolate,7.80,2,4.94,2.86
7,US-2021-7,??,02-07-2021,Standard Class,Sugar,Atlantic,Nerds,3.90,1,2.60,1.30
";

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[test]
fn default_view_covers_every_dated_row() {
    let ds = read_sales(SALES.as_bytes(), &LoadOptions::default()).unwrap();
    assert_eq!(ds.len(), 7);
    assert_eq!(ds.report.bad_order_dates, 1);

    let filters = FilterState::defaults_for(&ds);
    assert_eq!(filters.date_range, Some((date(2021, 1, 3), date(2021, 6, 30))));

    let dash = build_dashboard(&ds, &filters);
    assert_eq!(dash.totals.rows, 6);
    assert_eq!(dash.products.len(), 5);
    assert_eq!(dash.products[0].product_name, "Wonka Bar - Scrumdiddlyumptious");
    assert_eq!(
        dash.divisions
            .iter()
            .map(|d| d.division.as_str())
            .collect::<Vec<_>>(),
        vec!["Chocolate", "Other", "Sugar"]
    );
    assert!(dash.search_results.is_none());

    for p in &dash.products {
        let margin = p.gross_margin.unwrap();
        assert!((margin - p.gross_profit / p.sales).abs() < 1e-12);
    }

    let last = dash.pareto.points.last().unwrap();
    assert_eq!(last.cumulative_share, Some(1.0));
    assert!(dash.pareto.products_for_share(PARETO_GUIDE_SHARE).unwrap() <= 5);
}

#[test]
fn division_and_search_controls_narrow_the_view() {
    let ds = read_sales(SALES.as_bytes(), &LoadOptions::default()).unwrap();
    let mut filters = FilterState::defaults_for(&ds);
    filters.divisions = Some(BTreeSet::from(["Chocolate".to_string()]));
    filters.search = "MILK".into();

    let dash = build_dashboard(&ds, &filters);
    assert_eq!(dash.divisions.len(), 1);
    assert_eq!(dash.products.len(), 2);

    let hits = dash.search_results.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].product_name, "Wonka Bar - Milk Chocolate");
    assert!((hits[0].sales - 27.30).abs() < 1e-9);
}

#[test]
fn threshold_flags_without_dropping_rows() {
    let ds = read_sales(SALES.as_bytes(), &LoadOptions::default()).unwrap();
    let filters = FilterState::defaults_for(&ds).with_threshold(60).unwrap();
    let dash = build_dashboard(&ds, &filters);
    assert_eq!(dash.totals.rows, 6);

    let kazookles = dash
        .products
        .iter()
        .find(|p| p.product_name == "Kazookles")
        .unwrap();
    assert!(kazookles.below_threshold);
    let scrum = &dash.products[0];
    assert!(!scrum.below_threshold);
}
