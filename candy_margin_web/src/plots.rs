use candy_margin::{CostPoint, DivisionSummary, ParetoCurve, PARETO_GUIDE_SHARE};
use serde::Serialize;
use serde_json::json;
use wasm_bindgen::{JsCast, JsValue};

pub const DIVISION_PLOT_ID: &str = "division_plot";
pub const COST_PLOT_ID: &str = "cost_plot";
pub const PARETO_PLOT_ID: &str = "pareto_plot";

const BAR_OK: &str = "#2b6cb0";
const BAR_LOW: &str = "#c53030";
const GUIDE: &str = "#718096";

// Plotly wants plain objects, not the Map instances the default serializer emits.
fn to_js(value: &serde_json::Value) -> JsValue {
    value
        .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .unwrap_or(JsValue::NULL)
}

fn set(obj: &js_sys::Object, key: &str, value: &JsValue) {
    js_sys::Reflect::set(obj, &JsValue::from_str(key), value).ok();
}

fn number_array<I: IntoIterator<Item = Option<f64>>>(values: I) -> js_sys::Array {
    values
        .into_iter()
        .map(|v| v.map(JsValue::from_f64).unwrap_or(JsValue::NULL))
        .collect()
}

fn string_array<'a, I: IntoIterator<Item = &'a str>>(values: I) -> js_sys::Array {
    values.into_iter().map(JsValue::from_str).collect()
}

fn build_trace(kind: &str, name: &str, x: js_sys::Array, y: js_sys::Array) -> js_sys::Object {
    let trace = js_sys::Object::new();
    set(&trace, "type", &JsValue::from_str(kind));
    set(&trace, "name", &JsValue::from_str(name));
    set(&trace, "x", &JsValue::from(x));
    set(&trace, "y", &JsValue::from(y));
    trace
}

fn horizontal_guide(y: f64) -> serde_json::Value {
    json!({
        "type": "line",
        "xref": "paper",
        "x0": 0.0,
        "x1": 1.0,
        "y0": y,
        "y1": y,
        "line": { "color": GUIDE, "width": 1.5, "dash": "dash" },
    })
}

fn plot_into(div_id: &str, traces: &js_sys::Array, layout: &serde_json::Value) {
    let Some(div) = web_sys::window()
        .and_then(|w| w.document())
        .and_then(|d| d.get_element_by_id(div_id))
    else {
        return;
    };
    let plotly = js_sys::Reflect::get(&js_sys::global(), &JsValue::from_str("Plotly"))
        .unwrap_or(JsValue::UNDEFINED);
    if let Ok(func) = js_sys::Reflect::get(&plotly, &JsValue::from_str("react"))
        .and_then(|v| v.dyn_into::<js_sys::Function>())
    {
        let _ = func.call3(&JsValue::NULL, &JsValue::from(div), traces.as_ref(), &to_js(layout));
    }
}

/// Bars of gross margin per division with the threshold drawn across them.
pub fn render_division_chart(divisions: &[DivisionSummary], threshold: f64) {
    let bars = build_trace(
        "bar",
        "Gross margin",
        string_array(divisions.iter().map(|d| d.division.as_str())),
        number_array(divisions.iter().map(|d| d.gross_margin)),
    );
    let colors: Vec<&str> = divisions
        .iter()
        .map(|d| match d.gross_margin {
            Some(m) if m < threshold => BAR_LOW,
            _ => BAR_OK,
        })
        .collect();
    set(&bars, "marker", &to_js(&json!({ "color": colors })));
    set(
        &bars,
        "hovertemplate",
        &JsValue::from_str("%{x}: %{y:.1%}<extra></extra>"),
    );

    let layout = json!({
        "title": { "text": "Gross Margin by Division" },
        "yaxis": { "title": { "text": "Gross margin" }, "tickformat": ".0%", "rangemode": "tozero" },
        "shapes": [horizontal_guide(threshold)],
        "margin": { "t": 48, "r": 16 },
        "showlegend": false,
    });
    plot_into(DIVISION_PLOT_ID, &js_sys::Array::of1(&bars), &layout);
}

/// Product cost against sales, coloured by margin, with a break-even diagonal.
pub fn render_cost_chart(points: &[CostPoint]) {
    let dots = build_trace(
        "scatter",
        "Products",
        number_array(points.iter().map(|p| Some(p.sales))),
        number_array(points.iter().map(|p| Some(p.cost))),
    );
    set(&dots, "mode", &JsValue::from_str("markers"));
    set(
        &dots,
        "text",
        &string_array(points.iter().map(|p| p.product_name.as_str())).into(),
    );
    let margins: Vec<Option<f64>> = points.iter().map(|p| p.gross_margin).collect();
    set(
        &dots,
        "marker",
        &to_js(&json!({
            "size": 10,
            "color": margins,
            "colorscale": "RdYlGn",
            "showscale": true,
            "colorbar": { "title": { "text": "Margin" }, "tickformat": ".0%" },
        })),
    );
    set(
        &dots,
        "hovertemplate",
        &JsValue::from_str("%{text}<br>Sales $%{x:,.2f}<br>Cost $%{y:,.2f}<extra></extra>"),
    );

    let max = points
        .iter()
        .map(|p| p.sales.max(p.cost))
        .fold(0.0_f64, f64::max);
    let even = build_trace(
        "scatter",
        "Break-even",
        number_array([Some(0.0), Some(max)]),
        number_array([Some(0.0), Some(max)]),
    );
    set(&even, "mode", &JsValue::from_str("lines"));
    set(&even, "hoverinfo", &JsValue::from_str("skip"));
    set(
        &even,
        "line",
        &to_js(&json!({ "color": GUIDE, "dash": "dot", "width": 1 })),
    );

    let layout = json!({
        "title": { "text": "Cost vs Sales" },
        "xaxis": { "title": { "text": "Sales ($)" }, "rangemode": "tozero" },
        "yaxis": { "title": { "text": "Cost ($)" }, "rangemode": "tozero" },
        "margin": { "t": 48, "r": 16 },
        "showlegend": false,
    });
    plot_into(COST_PLOT_ID, &js_sys::Array::of2(&dots, &even), &layout);
}

/// Cumulative share of profit by product rank with the 80% guide.
pub fn render_pareto_chart(curve: &ParetoCurve) {
    let line = build_trace(
        "scatter",
        "Cumulative share",
        number_array(curve.points.iter().map(|p| Some(p.rank as f64))),
        number_array(curve.shares()),
    );
    set(&line, "mode", &JsValue::from_str("lines+markers"));
    set(
        &line,
        "text",
        &string_array(curve.points.iter().map(|p| p.product_name.as_str())).into(),
    );
    set(
        &line,
        "hovertemplate",
        &JsValue::from_str("#%{x} %{text}<br>%{y:.1%} of profit<extra></extra>"),
    );
    set(&line, "line", &to_js(&json!({ "color": BAR_OK, "width": 2 })));

    let layout = json!({
        "title": { "text": "Profit Concentration (Pareto)" },
        "xaxis": { "title": { "text": "Products ranked by gross profit" }, "dtick": 1 },
        "yaxis": { "title": { "text": "Cumulative share of profit" }, "tickformat": ".0%" },
        "shapes": [horizontal_guide(PARETO_GUIDE_SHARE)],
        "margin": { "t": 48, "r": 16 },
        "showlegend": false,
    });
    plot_into(PARETO_PLOT_ID, &js_sys::Array::of1(&line), &layout);
}
