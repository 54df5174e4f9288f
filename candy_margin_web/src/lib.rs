use std::collections::BTreeSet;

use candy_margin::{
    build_dashboard, parse_sales, products_csv, Dataset, DivisionSummary, FilterState, LoadOptions,
    ProductSummary, DATE_FORMATS, DEFAULT_MARGIN_THRESHOLD_PCT, PARETO_GUIDE_SHARE,
};
use chrono::NaiveDate;
use leptos::*;
use wasm_bindgen::{JsCast, JsValue};
use wasm_bindgen_futures::JsFuture;
use web_sys::{Blob, File, FileList, HtmlInputElement};

mod plots;

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const DATE_INPUT_FORMAT: &str = "%Y-%m-%d";
const AUTO_DATE_FORMAT: &str = "auto";

#[derive(Clone)]
struct FileBytes {
    name: String,
    bytes: Vec<u8>,
}

async fn read_file(file: File) -> Option<FileBytes> {
    let name = file.name();
    let buf = JsFuture::from(file.array_buffer()).await.ok()?;
    let bytes = js_sys::Uint8Array::new(&buf).to_vec();
    Some(FileBytes { name, bytes })
}

fn first_file(list: Option<FileList>) -> Option<File> {
    list?.item(0)
}

fn blob_url_from_str(s: &str) -> Option<String> {
    let parts = js_sys::Array::of1(&JsValue::from_str(s));
    let blob = Blob::new_with_str_sequence(&parts).ok()?;
    web_sys::Url::create_object_url_with_blob(&blob).ok()
}

fn load_options(date_format: &str) -> LoadOptions {
    LoadOptions {
        date_format: (date_format != AUTO_DATE_FORMAT).then(|| date_format.to_string()),
    }
}

fn load_message(name: &str, ds: &Dataset) -> String {
    let mut msg = format!("Loaded {} rows from {name}.", ds.len());
    if ds.report.skipped_rows > 0 {
        msg.push_str(&format!(" Skipped {} malformed rows.", ds.report.skipped_rows));
    }
    if ds.report.missing_values > 0 {
        msg.push_str(&format!(
            " {} blank numeric cells count as zero.",
            ds.report.missing_values
        ));
    }
    if ds.report.bad_order_dates > 0 {
        msg.push_str(&format!(
            " {} rows have an unreadable order date and are hidden while a date range is set.",
            ds.report.bad_order_dates
        ));
    }
    msg
}

/// `<input type="date">` yields an empty string when cleared.
fn parse_date_input(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_INPUT_FORMAT).ok()
}

fn date_input_value(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format(DATE_INPUT_FORMAT).to_string())
        .unwrap_or_default()
}

fn fmt_money(v: f64) -> String {
    if v < 0.0 {
        format!("-${:.2}", -v)
    } else {
        format!("${v:.2}")
    }
}

fn fmt_opt_money(v: Option<f64>) -> String {
    v.map(fmt_money).unwrap_or_else(|| "n/a".to_string())
}

fn fmt_pct(v: Option<f64>) -> String {
    v.map(|m| format!("{:.1}%", m * 100.0))
        .unwrap_or_else(|| "n/a".to_string())
}

#[component]
fn ProductTable(rows: Vec<ProductSummary>) -> impl IntoView {
    let body = rows
        .into_iter()
        .map(|p| {
            view! {
                <tr class=if p.below_threshold { "below-threshold" } else { "" }>
                    <td>{p.product_name}</td>
                    <td class="num">{fmt_money(p.sales)}</td>
                    <td class="num">{fmt_money(p.gross_profit)}</td>
                    <td class="num">{format!("{:.0}", p.units)}</td>
                    <td class="num">{fmt_pct(p.gross_margin)}</td>
                    <td class="num">{fmt_opt_money(p.profit_per_unit)}</td>
                </tr>
            }
        })
        .collect_view();
    view! {
        <table class="summary">
            <thead>
                <tr>
                    <th>"Product Name"</th><th>"Sales"</th><th>"Gross Profit"</th>
                    <th>"Units"</th><th>"Gross Margin"</th><th>"Profit per Unit"</th>
                </tr>
            </thead>
            <tbody>{body}</tbody>
        </table>
    }
}

#[component]
fn DivisionTable(rows: Vec<DivisionSummary>) -> impl IntoView {
    let body = rows
        .into_iter()
        .map(|d| {
            view! {
                <tr>
                    <td>{d.division}</td>
                    <td class="num">{fmt_money(d.sales)}</td>
                    <td class="num">{fmt_money(d.gross_profit)}</td>
                    <td class="num">{fmt_pct(d.gross_margin)}</td>
                </tr>
            }
        })
        .collect_view();
    view! {
        <table class="summary">
            <thead>
                <tr><th>"Division"</th><th>"Sales"</th><th>"Gross Profit"</th><th>"Gross Margin"</th></tr>
            </thead>
            <tbody>{body}</tbody>
        </table>
    }
}

#[component]
pub fn App() -> impl IntoView {
    let (upload, set_upload) = create_signal(Option::<FileBytes>::None);
    let (date_format, set_date_format) = create_signal(String::from(AUTO_DATE_FORMAT));
    let (dataset, set_dataset) = create_signal(Option::<Dataset>::None);
    let (status, set_status) = create_signal(String::from("No file loaded."));
    let (start, set_start) = create_signal(Option::<NaiveDate>::None);
    let (end, set_end) = create_signal(Option::<NaiveDate>::None);
    let (selected, set_selected) = create_signal(BTreeSet::<String>::new());
    let (threshold, set_threshold) = create_signal(DEFAULT_MARGIN_THRESHOLD_PCT);
    let (search, set_search) = create_signal(String::new());
    let (download_href, set_download_href) = create_signal(String::new());

    // Parse only when the upload or date format changes; filter edits reuse the rows.
    create_effect(move |_| {
        let format = date_format.get();
        upload.with(|file| {
            let Some(file) = file else { return };
            match parse_sales(&file.bytes, &load_options(&format)) {
                Ok(ds) => {
                    let defaults = FilterState::defaults_for(&ds);
                    let (lo, hi) = defaults.date_range.unzip();
                    set_start.set(lo);
                    set_end.set(hi);
                    set_selected.set(defaults.divisions.unwrap_or_default());
                    set_status.set(load_message(&file.name, &ds));
                    set_dataset.set(Some(ds));
                }
                Err(err) => {
                    set_dataset.set(None);
                    set_status.set(format!("Could not load {}: {err}", file.name));
                }
            }
        });
    });

    let bounds = create_memo(move |_| {
        dataset.with(|d| d.as_ref().and_then(Dataset::order_date_bounds))
    });
    let division_options = create_memo(move |_| {
        dataset.with(|d| d.as_ref().map(Dataset::divisions).unwrap_or_default())
    });

    let filters = create_memo(move |_| {
        // a cleared date input falls back to the data's own bound
        let date_range = match (start.get(), end.get(), bounds.get()) {
            (Some(s), Some(e), _) => Some((s, e)),
            (s, e, Some((lo, hi))) => Some((s.unwrap_or(lo), e.unwrap_or(hi))),
            _ => None,
        };
        FilterState {
            date_range,
            divisions: Some(selected.get()),
            margin_threshold_pct: threshold.get(),
            search: search.get(),
        }
    });

    let dashboard = create_memo(move |_| {
        filters.with(|f| dataset.with(|d| d.as_ref().map(|ds| build_dashboard(ds, f))))
    });

    create_effect(move |_| {
        dashboard.with(|dash| {
            if let Some(dash) = dash {
                plots::render_division_chart(&dash.divisions, dash.filters.margin_threshold());
                plots::render_cost_chart(&dash.cost_points);
                plots::render_pareto_chart(&dash.pareto);
            }
        });
    });

    create_effect(move |_| {
        let old = download_href.get_untracked();
        if !old.is_empty() {
            let _ = web_sys::Url::revoke_object_url(&old);
        }
        let href = dashboard
            .with(|dash| {
                dash.as_ref()
                    .and_then(|d| products_csv(&d.products).ok())
                    .and_then(|csv| blob_url_from_str(&csv))
            })
            .unwrap_or_default();
        set_download_href.set(href);
    });

    let accept = move |file: Option<File>| {
        let Some(file) = file else {
            set_status.set("No file selected.".to_string());
            return;
        };
        set_status.set(format!("Reading {}…", file.name()));
        spawn_local(async move {
            match read_file(file).await {
                Some(bytes) => set_upload.set(Some(bytes)),
                None => set_status.set("The browser could not read that file.".to_string()),
            }
        });
    };

    let on_file = move |ev: leptos::ev::Event| {
        let input = ev
            .target()
            .and_then(|t| t.dyn_into::<HtmlInputElement>().ok());
        accept(input.and_then(|i| first_file(i.files())));
    };

    let division_controls = move || {
        division_options
            .get()
            .into_iter()
            .map(|name| {
                let checked_name = name.clone();
                let toggle_name = name.clone();
                view! {
                    <label class="check">
                        <input type="checkbox"
                            prop:checked=move || selected.with(|s| s.contains(&checked_name))
                            on:change=move |ev| {
                                let on = event_target_checked(&ev);
                                set_selected.update(|s| {
                                    if on {
                                        s.insert(toggle_name.clone());
                                    } else {
                                        s.remove(&toggle_name);
                                    }
                                });
                            }/>
                        {format!(" {name}")}
                    </label>
                }
            })
            .collect_view()
    };

    let headline = move || {
        dashboard.with(|dash| {
            dash.as_ref().map(|d| {
                let reach = d
                    .pareto
                    .products_for_share(PARETO_GUIDE_SHARE)
                    .map(|n| format!("{n} of {}", d.products.len()))
                    .unwrap_or_else(|| "n/a".to_string());
                view! {
                    <div class="kpis">
                        <div class="kpi"><span>"Rows"</span><strong>{d.totals.rows}</strong></div>
                        <div class="kpi"><span>"Sales"</span><strong>{fmt_money(d.totals.sales)}</strong></div>
                        <div class="kpi"><span>"Gross Profit"</span><strong>{fmt_money(d.totals.gross_profit)}</strong></div>
                        <div class="kpi"><span>"Gross Margin"</span><strong>{fmt_pct(d.totals.gross_margin)}</strong></div>
                        <div class="kpi"><span>"Products for 80% of profit"</span><strong>{reach}</strong></div>
                    </div>
                }
            })
        })
    };

    let product_view = move || {
        dashboard.with(|dash| {
            dash.as_ref().map(|d| {
                let flagged = d.products.iter().filter(|p| p.below_threshold).count();
                view! {
                    <p class="note">{format!(
                        "{flagged} of {} products fall below the {}% margin threshold.",
                        d.products.len(),
                        d.filters.margin_threshold_pct
                    )}</p>
                    <ProductTable rows=d.products.clone()/>
                }
            })
        })
    };

    let division_view = move || {
        dashboard.with(|dash| {
            dash.as_ref()
                .map(|d| view! { <DivisionTable rows=d.divisions.clone()/> })
        })
    };

    let search_view = move || {
        dashboard
            .with(|dash| dash.as_ref().and_then(|d| d.search_results.clone()))
            .map(|rows| {
                let body = if rows.is_empty() {
                    view! { <p class="note">"No products match that search."</p> }.into_view()
                } else {
                    view! { <ProductTable rows=rows/> }.into_view()
                };
                view! {
                    <section>
                        <h2>"Search Results"</h2>
                        {body}
                    </section>
                }
            })
    };

    let has_data = move || dataset.with(Option::is_some);

    view! {
        <main class="dashboard" on:dragover=move |e| { e.prevent_default(); } on:drop=move |e| {
            e.prevent_default();
            accept(e.data_transfer().and_then(|dt| first_file(dt.files())));
        }>
            <header>
                <h1>"Product Line Profitability & Margin Performance Analysis"</h1>
                <p class="subtitle">"Nassau Candy Distributor"</p>
                <p class="note">{"Web version "}{APP_VERSION}</p>
            </header>
            <aside class="sidebar">
                <label class="dropzone">
                    <span>"Drag & drop or click to choose a sales CSV"</span>
                    <input id="file_input" type="file" accept=".csv,text/csv" on:change=on_file/>
                </label>
                <label>"Date format "
                    <select on:change=move |ev| set_date_format.set(event_target_value(&ev))>
                        <option value=AUTO_DATE_FORMAT selected>"auto"</option>
                        {DATE_FORMATS
                            .iter()
                            .map(|&f| view! { <option value=f>{f}</option> })
                            .collect_view()}
                    </select>
                </label>
                <h3>"Filters"</h3>
                <label>"Start date "
                    <input type="date"
                        prop:value=move || date_input_value(start.get())
                        min=move || date_input_value(bounds.get().map(|b| b.0))
                        max=move || date_input_value(bounds.get().map(|b| b.1))
                        on:change=move |ev| set_start.set(parse_date_input(&event_target_value(&ev)))/>
                </label>
                <label>"End date "
                    <input type="date"
                        prop:value=move || date_input_value(end.get())
                        min=move || date_input_value(bounds.get().map(|b| b.0))
                        max=move || date_input_value(bounds.get().map(|b| b.1))
                        on:change=move |ev| set_end.set(parse_date_input(&event_target_value(&ev)))/>
                </label>
                <fieldset>
                    <legend>"Divisions"</legend>
                    {division_controls}
                </fieldset>
                <label>{move || format!("Margin threshold: {}%", threshold.get())}
                    <input type="range" min="0" max="100" step="1"
                        prop:value=move || threshold.get().to_string()
                        on:input=move |ev| {
                            if let Ok(v) = event_target_value(&ev).parse::<u8>() {
                                set_threshold.set(v.min(100));
                            }
                        }/>
                </label>
                <label>"Search product "
                    <input type="search" placeholder="e.g. wonka"
                        prop:value=move || search.get()
                        on:input=move |ev| set_search.set(event_target_value(&ev))/>
                </label>
            </aside>
            <section class="content">
                <p class="status">{move || status.get()}</p>
                {headline}
                <div style=move || if has_data() { "" } else { "display:none;" }>
                    <section>
                        <h2>"Product Profitability Overview"</h2>
                        {product_view}
                        <a id="dl_products" href=move || download_href.get() download="product_summary.csv"
                            style=move || if download_href.get().is_empty() { "display:none;" } else { "display:inline;" }>
                            "Download product_summary.csv"
                        </a>
                    </section>
                    <section>
                        <h2>"Division Performance Dashboard"</h2>
                        <div id=plots::DIVISION_PLOT_ID class="plot"></div>
                        {division_view}
                    </section>
                    <section>
                        <h2>"Cost vs Margin Diagnostics"</h2>
                        <div id=plots::COST_PLOT_ID class="plot"></div>
                    </section>
                    <section>
                        <h2>"Profit Concentration Analysis"</h2>
                        <div id=plots::PARETO_PLOT_ID class="plot"></div>
                    </section>
                    {search_view}
                </div>
                <p class="note">"Nothing leaves your device. All processing happens locally in your browser."</p>
            </section>
        </main>
    }
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen::prelude::wasm_bindgen(start)]
pub fn start() {
    console_error_panic_hook::set_once();
    leptos::mount_to_body(|| view! { <App/> });
}
