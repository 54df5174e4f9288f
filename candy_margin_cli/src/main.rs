use std::cell::Cell;
use std::collections::BTreeSet;
use std::fs;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{self, Write};
use std::panic;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use candy_margin::{
    build_dashboard, load_sales, write_cost_points, write_divisions, write_pareto,
    write_products, CostPoint, Dashboard, Dataset, DivisionSummary, FilterState, LoadOptions,
    MarginError, ParetoCurve, PARETO_GUIDE_SHARE,
};
use chrono::NaiveDate;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use plotters::coord::ranged1d::SegmentValue;
use plotters::prelude::*;
use plotters::style::{FontDesc, FontFamily, FontStyle};
use plotters_backend::{
    BackendColor, BackendCoord, BackendStyle, BackendTextStyle, DrawingBackend, DrawingErrorKind,
};
use rayon::prelude::*;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Product line profitability & margin dashboard", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render the full dashboard: summary CSVs plus division, cost and Pareto charts
    Report(ReportArgs),
    /// Print product summary rows whose name contains a term (case-insensitive)
    Search(SearchArgs),
    /// Summarise what was loaded: row counts, coerced dates, date span, divisions
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Sales CSV files to load (concatenated in order)
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// chrono format for the date columns (default: try common layouts)
    #[arg(long)]
    date_format: Option<String>,

    /// Always re-parse inputs instead of reusing .cache/parsed_sales
    #[arg(long, action = ArgAction::SetTrue)]
    no_cache: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct FilterArgs {
    /// First order date to include (YYYY-MM-DD, default: earliest in data)
    #[arg(long, value_parser = parse_iso_date)]
    start: Option<NaiveDate>,

    /// Last order date to include (YYYY-MM-DD, default: latest in data)
    #[arg(long, value_parser = parse_iso_date)]
    end: Option<NaiveDate>,

    /// Comma separated divisions to include (default: all)
    #[arg(long)]
    divisions: Option<String>,

    /// Flag products whose gross margin is below this percentage
    #[arg(long, default_value_t = candy_margin::DEFAULT_MARGIN_THRESHOLD_PCT,
          value_parser = clap::value_parser!(u8).range(0..=100))]
    margin_threshold: u8,
}

#[derive(Args, Debug)]
struct ReportArgs {
    #[command(flatten)]
    input: InputArgs,

    #[command(flatten)]
    filters: FilterArgs,

    /// Directory receiving the tables and charts
    #[arg(short, long, default_value = "dashboard", value_hint = ValueHint::DirPath)]
    out_dir: PathBuf,

    /// Also write search_results.csv for this product search term
    #[arg(long)]
    search: Option<String>,

    /// Chart image format
    #[arg(long, value_enum, default_value_t = ChartFormatOpt::Png)]
    chart_format: ChartFormatOpt,

    /// Disable chart generation
    #[arg(long, action = ArgAction::SetTrue)]
    no_plot: bool,

    /// Also write the whole dashboard as dashboard.json
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Args, Debug)]
struct SearchArgs {
    /// Product name fragment
    term: String,

    #[command(flatten)]
    input: InputArgs,

    #[command(flatten)]
    filters: FilterArgs,
}

#[derive(Args, Debug)]
struct InspectArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Output report path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ChartFormatOpt {
    Png,
    Svg,
    Both,
}

impl ChartFormatOpt {
    fn kinds(self) -> Vec<ChartKind> {
        match self {
            ChartFormatOpt::Png => vec![ChartKind::Png],
            ChartFormatOpt::Svg => vec![ChartKind::Svg],
            ChartFormatOpt::Both => vec![ChartKind::Png, ChartKind::Svg],
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Report(args) => args.input.verbose,
        Command::Search(args) => args.input.verbose,
        Command::Inspect(args) => args.input.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Report(args) => handle_report(args),
        Command::Search(args) => handle_search(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

fn handle_report(args: ReportArgs) -> Result<()> {
    let t_load = Instant::now();
    let dataset = load_inputs(&args.input)?;
    if args.profile || args.input.verbose {
        info!(
            "Load stage: {:.1} ms ({} rows)",
            t_load.elapsed().as_secs_f64() * 1000.0,
            dataset.len()
        );
    }

    let mut filters = build_filters(&dataset, &args.filters)?;
    if let Some(term) = args.search.as_ref() {
        filters.search = term.clone();
    }

    let t_compute = Instant::now();
    let dashboard = build_dashboard(&dataset, &filters);
    if args.profile || args.input.verbose {
        info!(
            "Aggregate stage: {:.1} ms",
            t_compute.elapsed().as_secs_f64() * 1000.0
        );
    }
    log_headline(&dashboard);

    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("failed to create {}", args.out_dir.display()))?;

    let t_csv = Instant::now();
    write_table(&args.out_dir.join("product_summary.csv"), |w| {
        write_products(&dashboard.products, w)
    })?;
    write_table(&args.out_dir.join("division_summary.csv"), |w| {
        write_divisions(&dashboard.divisions, w)
    })?;
    write_table(&args.out_dir.join("cost_diagnostics.csv"), |w| {
        write_cost_points(&dashboard.cost_points, w)
    })?;
    write_table(&args.out_dir.join("pareto.csv"), |w| {
        write_pareto(&dashboard.pareto, w)
    })?;
    if let Some(results) = dashboard.search_results.as_ref() {
        write_table(&args.out_dir.join("search_results.csv"), |w| {
            write_products(results, w)
        })?;
        info!(
            "Search '{}': {} matching products",
            filters.search.trim(),
            results.len()
        );
    }
    if args.profile || args.input.verbose {
        info!(
            "CSV stage: {:.1} ms",
            t_csv.elapsed().as_secs_f64() * 1000.0
        );
    }
    info!("Wrote tables to {}", args.out_dir.display());

    if args.json {
        let path = args.out_dir.join("dashboard.json");
        let text = serde_json::to_string_pretty(&dashboard)?;
        fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Wrote {}", path.display());
    }

    if !args.no_plot {
        let t_plot = Instant::now();
        for kind in args.chart_format.kinds() {
            for chart in [Chart::DivisionMargin, Chart::CostVsSales, Chart::Pareto] {
                let path = args
                    .out_dir
                    .join(format!("{}.{}", chart.file_stem(), kind.extension()));
                match render_chart_guard(&dashboard, chart, &path, kind) {
                    Ok(()) => info!("Wrote chart: {}", path.display()),
                    Err(err) => warn!("Skipping chart {}: {}", path.display(), err),
                }
            }
        }
        if args.profile || args.input.verbose {
            info!(
                "Plot stage: {:.1} ms",
                t_plot.elapsed().as_secs_f64() * 1000.0
            );
        }
    }

    Ok(())
}

fn handle_search(args: SearchArgs) -> Result<()> {
    if args.term.trim().is_empty() {
        return Err(anyhow!("search term was empty"));
    }
    let dataset = load_inputs(&args.input)?;
    let mut filters = build_filters(&dataset, &args.filters)?;
    filters.search = args.term.clone();

    let dashboard = build_dashboard(&dataset, &filters);
    let results = dashboard.search_results.unwrap_or_default();
    info!("{} products match '{}'", results.len(), args.term.trim());

    let stdout = io::stdout();
    let handle = stdout.lock();
    let mut writer = csv::Writer::from_writer(handle);
    write_products(&results, &mut writer)?;
    Ok(())
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let mut report = String::new();

    let cache_dir = default_cache_dir();
    let mut parts = Vec::with_capacity(args.input.inputs.len());
    for path in &args.input.inputs {
        let dataset = load_cached(&cache_dir, path, &args.input)?;
        report.push_str(&describe_dataset(&path.display().to_string(), &dataset));
        report.push('\n');
        parts.push(dataset);
    }
    if parts.len() > 1 {
        let combined = Dataset::concat(parts);
        report.push_str(&describe_dataset("(combined)", &combined));
    }

    if args.output.as_os_str() == "-" {
        io::stdout().write_all(report.as_bytes())?;
    } else {
        fs::write(&args.output, report)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Inspection report written: {}", args.output.display());
    }
    Ok(())
}

fn describe_dataset(label: &str, dataset: &Dataset) -> String {
    let mut out = String::new();
    let r = &dataset.report;
    out.push_str(&format!("FILE: {}\n", label));
    out.push_str(&format!("  rows: {}\n", r.rows));
    out.push_str(&format!("  skipped_rows: {}\n", r.skipped_rows));
    out.push_str(&format!("  missing_values: {}\n", r.missing_values));
    out.push_str(&format!("  bad_order_dates: {}\n", r.bad_order_dates));
    out.push_str(&format!("  bad_ship_dates: {}\n", r.bad_ship_dates));
    match dataset.order_date_bounds() {
        Some((start, end)) => out.push_str(&format!("  order_dates: {} .. {}\n", start, end)),
        None => out.push_str("  order_dates: n/a\n"),
    }
    let divisions = dataset.divisions();
    out.push_str(&format!("  divisions ({}):\n", divisions.len()));
    for division in divisions {
        out.push_str(&format!("    - {}\n", division));
    }
    out.push_str(&format!("  sha256: {}\n", r.fingerprint));
    out
}

fn load_inputs(args: &InputArgs) -> Result<Dataset> {
    if args.inputs.is_empty() {
        return Err(anyhow!("no input files supplied"));
    }
    let cache_dir = default_cache_dir();
    let parts = args
        .inputs
        .par_iter()
        .map(|path| load_cached(&cache_dir, path, args))
        .collect::<Result<Vec<_>>>()?;
    let dataset = if parts.len() == 1 {
        parts.into_iter().next().unwrap_or_default()
    } else {
        Dataset::concat(parts)
    };
    let r = &dataset.report;
    info!(
        "Loaded {} rows ({} skipped, {} blank numeric cells, {} undated)",
        r.rows, r.skipped_rows, r.missing_values, r.bad_order_dates
    );
    Ok(dataset)
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".cache").join("parsed_sales")
}

fn load_cached(cache_dir: &Path, path: &Path, args: &InputArgs) -> Result<Dataset> {
    let options = LoadOptions {
        date_format: args.date_format.clone(),
    };
    let key = cache_key(path, &options)?;
    if !args.no_cache {
        if let Some(cached) = read_cache(cache_dir, &key) {
            debug!("cache hit for {}", path.display());
            return Ok(cached);
        }
    }
    let dataset = load_sales(path, &options)
        .with_context(|| format!("failed to load {}", path.display()))?;
    // Best-effort cache write
    if fs::create_dir_all(cache_dir).is_ok() {
        if let Err(err) = write_cache(cache_dir, &key, &dataset) {
            debug!("cache write failed: {err}");
        }
    }
    Ok(dataset)
}

fn cache_key(path: &Path, options: &LoadOptions) -> Result<String> {
    use std::time::SystemTime;
    let meta = fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let dur = modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    path.to_string_lossy().hash(&mut hasher);
    meta.len().hash(&mut hasher);
    (dur.as_secs(), dur.subsec_nanos()).hash(&mut hasher);
    options.date_format.hash(&mut hasher);
    Ok(format!("{:016x}", hasher.finish()))
}

fn read_cache(dir: &Path, key: &str) -> Option<Dataset> {
    let text = fs::read_to_string(dir.join(format!("{}.json", key))).ok()?;
    serde_json::from_str(&text).ok()
}

fn write_cache(dir: &Path, key: &str, dataset: &Dataset) -> Result<()> {
    let path = dir.join(format!("{}.json", key));
    let text = serde_json::to_string(dataset)?;
    fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn parse_iso_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

fn parse_division_list(input: &str) -> BTreeSet<String> {
    input
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn build_filters(dataset: &Dataset, args: &FilterArgs) -> Result<FilterState> {
    let mut filters =
        FilterState::defaults_for(dataset).with_threshold(args.margin_threshold)?;

    if args.start.is_some() || args.end.is_some() {
        let (lo, hi) = dataset
            .order_date_bounds()
            .ok_or_else(|| anyhow!("no parseable order dates; cannot apply --start/--end"))?;
        let start = args.start.unwrap_or(lo);
        let end = args.end.unwrap_or(hi);
        if start > end {
            warn!("--start {} is after --end {}; nothing will match", start, end);
        }
        filters.date_range = Some((start, end));
    }

    if let Some(list) = args.divisions.as_ref() {
        let selected = parse_division_list(list);
        let known = dataset.divisions();
        for name in &selected {
            if !known.contains(name) {
                warn!("division '{}' does not occur in the data", name);
            }
        }
        filters.divisions = Some(selected);
    }
    Ok(filters)
}

fn log_headline(dashboard: &Dashboard) {
    let t = &dashboard.totals;
    info!(
        "Filtered view: {} rows, sales {:.2}, gross profit {:.2}, margin {}",
        t.rows,
        t.sales,
        t.gross_profit,
        fmt_pct(t.gross_margin)
    );
    let flagged = dashboard
        .products
        .iter()
        .filter(|p| p.below_threshold)
        .count();
    if flagged > 0 {
        info!(
            "{} of {} products below the {}% margin threshold",
            flagged,
            dashboard.products.len(),
            dashboard.filters.margin_threshold_pct
        );
    }
    if let Some(n) = dashboard.pareto.products_for_share(PARETO_GUIDE_SHARE) {
        info!(
            "Top {} of {} products earn {:.0}% of gross profit",
            n,
            dashboard.pareto.points.len(),
            PARETO_GUIDE_SHARE * 100.0
        );
    }
}

fn fmt_pct(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.1}%", v * 100.0))
        .unwrap_or_else(|| "n/a".into())
}

fn write_table<F>(path: &Path, write_rows: F) -> Result<()>
where
    F: FnOnce(&mut csv::Writer<File>) -> Result<(), MarginError>,
{
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_rows(&mut writer).with_context(|| format!("failed to write {}", path.display()))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ChartKind {
    Png,
    Svg,
}

impl ChartKind {
    fn extension(self) -> &'static str {
        match self {
            ChartKind::Png => "png",
            ChartKind::Svg => "svg",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Chart {
    DivisionMargin,
    CostVsSales,
    Pareto,
}

impl Chart {
    fn file_stem(self) -> &'static str {
        match self {
            Chart::DivisionMargin => "division_margin",
            Chart::CostVsSales => "cost_vs_sales",
            Chart::Pareto => "pareto",
        }
    }
}

const CHART_SIZE: (u32, u32) = (1280, 760);
const BAR_COLOR: RGBColor = RGBColor(76, 114, 176);
const GUIDE_COLOR: RGBColor = RGBColor(200, 0, 100);
const LOW_MARGIN_COLOR: RGBColor = RGBColor(200, 0, 100);
const HIGH_MARGIN_COLOR: RGBColor = RGBColor(30, 144, 255);

fn render_chart_guard(
    dashboard: &Dashboard,
    chart: Chart,
    path: &Path,
    kind: ChartKind,
) -> Result<(), String> {
    let render = || -> Result<()> {
        match kind {
            ChartKind::Png => {
                let backend = BitMapBackend::new(path, CHART_SIZE);
                draw(TextSafeBackend::new(backend).into_drawing_area(), dashboard, chart)
            }
            ChartKind::Svg => {
                let backend = SVGBackend::new(path, CHART_SIZE);
                draw(TextSafeBackend::new(backend).into_drawing_area(), dashboard, chart)
            }
        }
    };

    panic::catch_unwind(panic::AssertUnwindSafe(render))
        .map_err(|_| "plotting backend panicked".to_string())?
        .map_err(|e| format!("plotting error: {}", e))
}

fn draw<DB>(
    root: DrawingArea<DB, plotters::coord::Shift>,
    dashboard: &Dashboard,
    chart: Chart,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    root.fill(&WHITE)?;
    match chart {
        Chart::DivisionMargin => draw_division_chart(
            &root,
            &dashboard.divisions,
            dashboard.filters.margin_threshold(),
        )?,
        Chart::CostVsSales => draw_cost_chart(&root, &dashboard.cost_points)?,
        Chart::Pareto => draw_pareto_chart(&root, &dashboard.pareto)?,
    }
    root.present()?;
    Ok(())
}

fn caption_font() -> FontDesc<'static> {
    FontDesc::new(FontFamily::SansSerif, 28.0, FontStyle::Normal)
}

fn axis_font() -> FontDesc<'static> {
    FontDesc::new(FontFamily::SansSerif, 18.0, FontStyle::Normal)
}

fn draw_division_chart<DB>(
    area: &DrawingArea<DB, plotters::coord::Shift>,
    divisions: &[DivisionSummary],
    threshold: f64,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    if divisions.is_empty() {
        return Ok(());
    }
    let n = divisions.len() as u32;
    let margins: Vec<f64> = divisions
        .iter()
        .map(|d| d.gross_margin.unwrap_or(0.0))
        .collect();
    let y_min = margins.iter().copied().fold(0.0, f64::min);
    let y_max = margins.iter().copied().fold(threshold, f64::max).max(0.05) * 1.1;

    let mut chart = ChartBuilder::on(area)
        .caption("Gross Margin by Division", caption_font())
        .margin(25)
        .set_label_area_size(LabelAreaPosition::Left, 70)
        .set_label_area_size(LabelAreaPosition::Bottom, 60)
        .build_cartesian_2d((0u32..n).into_segmented(), y_min..y_max)?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(divisions.len())
        .x_label_formatter(&|v| match v {
            SegmentValue::CenterOf(i) => divisions
                .get(*i as usize)
                .map(|d| d.division.clone())
                .unwrap_or_default(),
            _ => String::new(),
        })
        .y_label_formatter(&|v| format!("{:.0}%", v * 100.0))
        .y_desc("Gross Margin %")
        .x_desc("Division")
        .label_style(axis_font())
        .draw()?;

    chart.draw_series(margins.iter().enumerate().map(|(i, &margin)| {
        let i = i as u32;
        let mut bar = Rectangle::new(
            [
                (SegmentValue::Exact(i), 0.0),
                (SegmentValue::Exact(i + 1), margin),
            ],
            BAR_COLOR.filled(),
        );
        bar.set_margin(0, 0, 18, 18);
        bar
    }))?;

    chart
        .draw_series(LineSeries::new(
            vec![
                (SegmentValue::Exact(0), threshold),
                (SegmentValue::Exact(n), threshold),
            ],
            plotters::style::Color::stroke_width(&GUIDE_COLOR, 2),
        ))?
        .label(format!("Margin threshold ({:.0}%)", threshold * 100.0))
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], GUIDE_COLOR));

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.7))
        .border_style(BLACK.mix(0.3))
        .label_font(axis_font())
        .position(SeriesLabelPosition::UpperRight)
        .draw()?;
    Ok(())
}

/// Blend between the low and high margin colours; `t` is clamped to 0..=1.
fn margin_color(t: f64) -> RGBColor {
    let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
    let mix = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * t).round() as u8;
    RGBColor(
        mix(LOW_MARGIN_COLOR.0, HIGH_MARGIN_COLOR.0),
        mix(LOW_MARGIN_COLOR.1, HIGH_MARGIN_COLOR.1),
        mix(LOW_MARGIN_COLOR.2, HIGH_MARGIN_COLOR.2),
    )
}

fn draw_cost_chart<DB>(
    area: &DrawingArea<DB, plotters::coord::Shift>,
    points: &[CostPoint],
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    if points.is_empty() {
        return Ok(());
    }
    let x_max = points.iter().map(|p| p.sales).fold(1.0, f64::max) * 1.05;
    let y_max = points.iter().map(|p| p.cost).fold(1.0, f64::max) * 1.05;
    let x_min = points.iter().map(|p| p.sales).fold(0.0, f64::min);
    let y_min = points.iter().map(|p| p.cost).fold(0.0, f64::min);

    let margins: Vec<f64> = points.iter().filter_map(|p| p.gross_margin).collect();
    let m_lo = margins.iter().copied().fold(f64::INFINITY, f64::min);
    let m_hi = margins.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = if m_hi > m_lo { m_hi - m_lo } else { 1.0 };

    let mut chart = ChartBuilder::on(area)
        .caption("Cost vs Sales by Product", caption_font())
        .margin(25)
        .set_label_area_size(LabelAreaPosition::Left, 70)
        .set_label_area_size(LabelAreaPosition::Bottom, 50)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)?;

    chart
        .configure_mesh()
        .x_desc("Sales")
        .y_desc("Cost")
        .x_label_formatter(&|v| format!("{:.0}", v))
        .y_label_formatter(&|v| format!("{:.0}", v))
        .label_style(axis_font())
        .draw()?;

    chart.draw_series(points.iter().map(|p| {
        let color = match p.gross_margin {
            Some(m) => margin_color((m - m_lo) / span),
            None => RGBColor(150, 150, 150),
        };
        Circle::new((p.sales, p.cost), 5, color.filled())
    }))?;

    if m_lo.is_finite() && m_hi.is_finite() {
        for (label, margin) in [("low margin", m_lo), ("high margin", m_hi)] {
            let color = margin_color((margin - m_lo) / span);
            chart
                .draw_series(std::iter::empty::<Rectangle<(f64, f64)>>())?
                .label(format!("{} ({:.1}%)", label, margin * 100.0))
                .legend(move |(x, y)| {
                    Rectangle::new([(x + 5, y - 5), (x + 15, y + 5)], color.filled())
                });
        }
        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.7))
            .border_style(BLACK.mix(0.3))
            .label_font(axis_font())
            .position(SeriesLabelPosition::UpperLeft)
            .draw()?;
    }
    Ok(())
}

fn draw_pareto_chart<DB>(
    area: &DrawingArea<DB, plotters::coord::Shift>,
    curve: &ParetoCurve,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    let series: Vec<(f64, f64)> = curve
        .points
        .iter()
        .filter_map(|p| Some(((p.rank - 1) as f64, p.cumulative_share?)))
        .collect();
    if series.is_empty() {
        return Ok(());
    }
    let x_max = (series.len().saturating_sub(1) as f64).max(1.0);
    let y_min = series.iter().map(|(_, y)| *y).fold(0.0, f64::min);
    let y_max = series.iter().map(|(_, y)| *y).fold(1.0, f64::max) * 1.05;

    let mut chart = ChartBuilder::on(area)
        .caption("Pareto Analysis - Profit Concentration", caption_font())
        .margin(25)
        .set_label_area_size(LabelAreaPosition::Left, 70)
        .set_label_area_size(LabelAreaPosition::Bottom, 50)
        .build_cartesian_2d(0.0..x_max, y_min..y_max)?;

    chart
        .configure_mesh()
        .x_desc("Products (sorted by profit)")
        .y_desc("Cumulative Profit %")
        .x_label_formatter(&|v| format!("{:.0}", v))
        .y_label_formatter(&|v| format!("{:.0}%", v * 100.0))
        .label_style(axis_font())
        .draw()?;

    chart
        .draw_series(LineSeries::new(series, plotters::style::Color::stroke_width(&BAR_COLOR, 2)))?
        .label("Cumulative profit share")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], BAR_COLOR));

    chart
        .draw_series(DashedLineSeries::new(
            vec![(0.0, PARETO_GUIDE_SHARE), (x_max, PARETO_GUIDE_SHARE)],
            12,
            8,
            plotters::style::Color::stroke_width(&GUIDE_COLOR, 2),
        ))?
        .label(format!("{:.0}% of profit", PARETO_GUIDE_SHARE * 100.0))
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], GUIDE_COLOR));

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.7))
        .border_style(BLACK.mix(0.3))
        .label_font(axis_font())
        .position(SeriesLabelPosition::LowerRight)
        .draw()?;
    Ok(())
}

/// Drawing backend that drops text instead of panicking when no system font is available.
///
/// Shapes pass straight through; only text calls are guarded.
struct TextSafeBackend<DB> {
    inner: DB,
    text_dropped: Cell<bool>,
}

impl<DB> TextSafeBackend<DB> {
    fn new(inner: DB) -> Self {
        Self {
            inner,
            text_dropped: Cell::new(false),
        }
    }

    fn note_dropped_text(&self) {
        if !self.text_dropped.replace(true) {
            warn!("no usable font for chart text; labels omitted");
        }
    }
}

type BackendResult<T, E> = Result<T, DrawingErrorKind<E>>;

impl<DB: DrawingBackend> DrawingBackend for TextSafeBackend<DB> {
    type ErrorType = DB::ErrorType;

    fn get_size(&self) -> (u32, u32) {
        self.inner.get_size()
    }

    fn ensure_prepared(&mut self) -> BackendResult<(), DB::ErrorType> {
        self.inner.ensure_prepared()
    }

    fn present(&mut self) -> BackendResult<(), DB::ErrorType> {
        self.inner.present()
    }

    fn draw_pixel(&mut self, at: BackendCoord, color: BackendColor) -> BackendResult<(), DB::ErrorType> {
        self.inner.draw_pixel(at, color)
    }

    fn draw_line<S: BackendStyle>(
        &mut self,
        from: BackendCoord,
        to: BackendCoord,
        style: &S,
    ) -> BackendResult<(), DB::ErrorType> {
        self.inner.draw_line(from, to, style)
    }

    fn draw_rect<S: BackendStyle>(
        &mut self,
        corner: BackendCoord,
        opposite: BackendCoord,
        style: &S,
        fill: bool,
    ) -> BackendResult<(), DB::ErrorType> {
        self.inner.draw_rect(corner, opposite, style, fill)
    }

    fn draw_path<S: BackendStyle, I: IntoIterator<Item = BackendCoord>>(
        &mut self,
        path: I,
        style: &S,
    ) -> BackendResult<(), DB::ErrorType> {
        self.inner.draw_path(path, style)
    }

    fn draw_circle<S: BackendStyle>(
        &mut self,
        center: BackendCoord,
        radius: u32,
        style: &S,
        fill: bool,
    ) -> BackendResult<(), DB::ErrorType> {
        self.inner.draw_circle(center, radius, style, fill)
    }

    fn draw_text<TStyle: BackendTextStyle>(
        &mut self,
        text: &str,
        style: &TStyle,
        pos: BackendCoord,
    ) -> BackendResult<(), DB::ErrorType> {
        let inner = &mut self.inner;
        match panic::catch_unwind(panic::AssertUnwindSafe(|| inner.draw_text(text, style, pos))) {
            Ok(result) => result,
            Err(_) => {
                self.note_dropped_text();
                Ok(())
            }
        }
    }

    fn estimate_text_size<TStyle: BackendTextStyle>(
        &self,
        text: &str,
        style: &TStyle,
    ) -> BackendResult<(u32, u32), DB::ErrorType> {
        panic::catch_unwind(panic::AssertUnwindSafe(|| {
            self.inner.estimate_text_size(text, style)
        }))
        .unwrap_or_else(|_| {
            self.note_dropped_text();
            // rough monospace estimate so layout still reserves space
            let size = style.size().max(1.0);
            Ok(((text.chars().count() as f64 * size * 0.6) as u32, size as u32))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    #[test]
    fn parses_iso_dates() {
        assert_eq!(
            parse_iso_date(" 2021-10-13 "),
            Ok(NaiveDate::from_ymd_opt(2021, 10, 13).unwrap())
        );
        assert!(parse_iso_date("13-10-2021").is_err());
    }

    #[test]
    fn division_list_ignores_blanks() {
        let set = parse_division_list(" Chocolate, ,Sugar,,Other ");
        assert_eq!(
            set.into_iter().collect::<Vec<_>>(),
            vec!["Chocolate", "Other", "Sugar"]
        );
    }

    #[test]
    fn percentages_format_or_na() {
        assert_eq!(fmt_pct(Some(0.25)), "25.0%");
        assert_eq!(fmt_pct(None), "n/a");
    }

    #[test]
    fn margin_colour_endpoints() {
        assert_eq!(margin_color(0.0), LOW_MARGIN_COLOR);
        assert_eq!(margin_color(1.0), HIGH_MARGIN_COLOR);
        assert_eq!(margin_color(f64::NAN), LOW_MARGIN_COLOR);
        assert_eq!(margin_color(5.0), HIGH_MARGIN_COLOR);
    }

    #[test]
    fn chart_formats_expand() {
        assert_eq!(ChartFormatOpt::Both.kinds(), vec![ChartKind::Png, ChartKind::Svg]);
        assert_eq!(ChartKind::Svg.extension(), "svg");
        assert_eq!(Chart::DivisionMargin.file_stem(), "division_margin");
    }

    const SALES: &str = "\
Order Date,Ship Date,Division,Product Name,Sales,Units,Gross Profit,Cost
2021-01-01,2021-01-02,Sugar,Nerds,4,1,1,3
";

    fn input_args(path: &Path, no_cache: bool) -> InputArgs {
        InputArgs {
            inputs: vec![path.to_path_buf()],
            date_format: None,
            no_cache,
            verbose: false,
        }
    }

    #[test]
    fn cache_round_trip_returns_equal_dataset() {
        let dir = TempDir::new().unwrap();
        let csv_path = dir.path().join("sales.csv");
        fs::write(&csv_path, SALES).unwrap();
        let ds = load_sales(&csv_path, &LoadOptions::default()).unwrap();

        write_cache(dir.path(), "abc", &ds).unwrap();
        assert_eq!(read_cache(dir.path(), "abc"), Some(ds));
        assert_eq!(read_cache(dir.path(), "missing"), None);
    }

    #[test]
    fn cache_key_tracks_date_format_size_and_mtime() {
        let dir = TempDir::new().unwrap();
        let csv_path = dir.path().join("sales.csv");
        fs::write(&csv_path, SALES).unwrap();
        let auto = LoadOptions::default();
        let dmy = LoadOptions {
            date_format: Some("%d-%m-%Y".into()),
        };

        let key = cache_key(&csv_path, &auto).unwrap();
        assert_eq!(key, cache_key(&csv_path, &auto).unwrap());
        assert_ne!(key, cache_key(&csv_path, &dmy).unwrap());

        File::options()
            .write(true)
            .open(&csv_path)
            .unwrap()
            .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000))
            .unwrap();
        let touched = cache_key(&csv_path, &auto).unwrap();
        assert_ne!(key, touched);

        fs::write(&csv_path, format!("{SALES}2021-01-03,2021-01-04,Sugar,Nerds,8,2,2,6\n")).unwrap();
        assert_ne!(touched, cache_key(&csv_path, &auto).unwrap());
    }

    #[test]
    fn no_cache_bypasses_stored_dataset() {
        let dir = TempDir::new().unwrap();
        let cache_dir = dir.path().join("cache");
        let csv_path = dir.path().join("sales.csv");
        fs::write(&csv_path, SALES).unwrap();

        let parsed = load_cached(&cache_dir, &csv_path, &input_args(&csv_path, false)).unwrap();
        assert_eq!(parsed.len(), 1);

        let key = cache_key(&csv_path, &LoadOptions::default()).unwrap();
        let mut stale = parsed.clone();
        stale.records.clear();
        write_cache(&cache_dir, &key, &stale).unwrap();

        let hit = load_cached(&cache_dir, &csv_path, &input_args(&csv_path, false)).unwrap();
        assert_eq!(hit, stale);
        let fresh = load_cached(&cache_dir, &csv_path, &input_args(&csv_path, true)).unwrap();
        assert_eq!(fresh, parsed);
    }

    struct NoFontBackend {
        pixels: usize,
    }

    impl DrawingBackend for NoFontBackend {
        type ErrorType = io::Error;

        fn get_size(&self) -> (u32, u32) {
            (16, 16)
        }

        fn ensure_prepared(&mut self) -> Result<(), DrawingErrorKind<io::Error>> {
            Ok(())
        }

        fn present(&mut self) -> Result<(), DrawingErrorKind<io::Error>> {
            Ok(())
        }

        fn draw_pixel(&mut self, _: BackendCoord, _: BackendColor) -> Result<(), DrawingErrorKind<io::Error>> {
            self.pixels += 1;
            Ok(())
        }

        fn draw_text<TStyle: BackendTextStyle>(
            &mut self,
            _: &str,
            _: &TStyle,
            _: BackendCoord,
        ) -> Result<(), DrawingErrorKind<io::Error>> {
            panic!("font lookup failed")
        }

        fn estimate_text_size<TStyle: BackendTextStyle>(
            &self,
            _: &str,
            _: &TStyle,
        ) -> Result<(u32, u32), DrawingErrorKind<io::Error>> {
            panic!("font lookup failed")
        }
    }

    #[test]
    fn text_failures_are_dropped_not_fatal() {
        let mut backend = TextSafeBackend::new(NoFontBackend { pixels: 0 });
        let style = TextStyle::from(axis_font());

        assert!(backend.draw_text("Sugar", &style, (0, 0)).is_ok());
        assert!(backend.text_dropped.get());
        let (w, h) = backend.estimate_text_size("abcd", &style).unwrap();
        assert_eq!(h, 18);
        assert!(w > 0);

        backend.draw_pixel((1, 1), BLACK.to_backend_color()).unwrap();
        assert_eq!(backend.inner.pixels, 1);
    }

    #[test]
    fn cli_parses_report_filters() {
        let cli = Cli::try_parse_from([
            "candy-margin",
            "report",
            "sales.csv",
            "--start",
            "2021-01-01",
            "--divisions",
            "Chocolate,Sugar",
            "--margin-threshold",
            "35",
            "--chart-format",
            "both",
        ])
        .unwrap();
        match cli.command {
            Command::Report(args) => {
                assert_eq!(args.filters.margin_threshold, 35);
                assert_eq!(args.chart_format, ChartFormatOpt::Both);
                assert_eq!(args.input.inputs, vec![PathBuf::from("sales.csv")]);
                assert!(args.filters.end.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["candy-margin", "report", "a.csv", "--margin-threshold", "101"]).is_err());
    }
}
