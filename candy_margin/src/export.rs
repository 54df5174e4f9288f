use std::io::Write;

use super::{CostPoint, DivisionSummary, MarginError, ParetoCurve, ProductSummary};

const RATIO_DECIMALS: usize = 4;

/// Undefined ratios are written as empty cells.
fn fmt_opt(value: Option<f64>, decimals: usize) -> String {
    value
        .map(|v| format!("{:.*}", decimals, v))
        .unwrap_or_default()
}

pub fn write_products<W: Write>(
    rows: &[ProductSummary],
    writer: &mut csv::Writer<W>,
) -> Result<(), MarginError> {
    writer.write_record([
        "product_name",
        "sales",
        "gross_profit",
        "units",
        "gross_margin",
        "profit_per_unit",
        "below_threshold",
    ])?;
    for row in rows {
        writer.write_record([
            row.product_name.clone(),
            format!("{:.2}", row.sales),
            format!("{:.2}", row.gross_profit),
            row.units.to_string(),
            fmt_opt(row.gross_margin, RATIO_DECIMALS),
            fmt_opt(row.profit_per_unit, RATIO_DECIMALS),
            row.below_threshold.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_divisions<W: Write>(
    rows: &[DivisionSummary],
    writer: &mut csv::Writer<W>,
) -> Result<(), MarginError> {
    writer.write_record(["division", "sales", "gross_profit", "gross_margin"])?;
    for row in rows {
        writer.write_record([
            row.division.clone(),
            format!("{:.2}", row.sales),
            format!("{:.2}", row.gross_profit),
            fmt_opt(row.gross_margin, RATIO_DECIMALS),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_cost_points<W: Write>(
    rows: &[CostPoint],
    writer: &mut csv::Writer<W>,
) -> Result<(), MarginError> {
    writer.write_record(["product_name", "sales", "cost", "gross_profit", "gross_margin"])?;
    for row in rows {
        writer.write_record([
            row.product_name.clone(),
            format!("{:.2}", row.sales),
            format!("{:.2}", row.cost),
            format!("{:.2}", row.gross_profit),
            fmt_opt(row.gross_margin, RATIO_DECIMALS),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_pareto<W: Write>(
    curve: &ParetoCurve,
    writer: &mut csv::Writer<W>,
) -> Result<(), MarginError> {
    writer.write_record([
        "rank",
        "product_name",
        "gross_profit",
        "cumulative_profit",
        "cumulative_profit_pct",
    ])?;
    for point in &curve.points {
        writer.write_record([
            point.rank.to_string(),
            point.product_name.clone(),
            format!("{:.2}", point.gross_profit),
            format!("{:.2}", point.cumulative_profit),
            fmt_opt(point.cumulative_share, RATIO_DECIMALS),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Product table as CSV text, for browser downloads.
pub fn products_csv(rows: &[ProductSummary]) -> Result<String, MarginError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    write_products(rows, &mut writer)?;
    let bytes = writer.into_inner().map_err(|e| MarginError::Io(e.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(name: &str, margin: Option<f64>) -> ProductSummary {
        ProductSummary {
            product_name: name.to_string(),
            sales: 10.0,
            gross_profit: 4.5,
            units: 3.0,
            gross_margin: margin,
            profit_per_unit: margin.map(|_| 1.5),
            below_threshold: margin.is_none(),
        }
    }

    #[test]
    fn product_rows_blank_undefined_ratios() {
        let text = products_csv(&[product("Kazookles", None)]).unwrap();
        assert_eq!(
            text,
            "product_name,sales,gross_profit,units,gross_margin,profit_per_unit,below_threshold\n\
             Kazookles,10.00,4.50,3,,,true\n"
        );
    }

    #[test]
    fn product_names_are_quoted() {
        let text = products_csv(&[
            product("Wonka Bar, Milk", Some(0.45)),
            product("Say \"Nerds\"", Some(0.45)),
        ])
        .unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1], "\"Wonka Bar, Milk\",10.00,4.50,3,0.4500,1.5000,false");
        assert_eq!(lines[2], "\"Say \"\"Nerds\"\"\",10.00,4.50,3,0.4500,1.5000,false");
    }

    #[test]
    fn pareto_rows_carry_rank_and_share() {
        let curve = crate::pareto_curve(&[product("A", Some(0.5)), product("B", Some(0.5))]);
        let mut buf = Vec::new();
        {
            let mut writer = csv::Writer::from_writer(&mut buf);
            write_pareto(&curve, &mut writer).unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1], "1,A,4.50,4.50,0.5000");
        assert_eq!(lines[2], "2,B,4.50,9.00,1.0000");
    }
}
