use serde::{Deserialize, Serialize};

use super::summary::sort_by_profit_desc;
use super::ProductSummary;

/// Share of total profit marked by the guide line on the concentration chart.
pub const PARETO_GUIDE_SHARE: f64 = 0.8;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ParetoPoint {
    /// 1-based position in the descending-profit ranking.
    pub rank: usize,
    pub product_name: String,
    pub gross_profit: f64,
    pub cumulative_profit: f64,
    /// `None` when total profit is zero.
    pub cumulative_share: Option<f64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ParetoCurve {
    pub points: Vec<ParetoPoint>,
    pub total_profit: f64,
}

impl ParetoCurve {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn shares(&self) -> Vec<Option<f64>> {
        self.points.iter().map(|p| p.cumulative_share).collect()
    }

    /// Number of top products needed before the cumulative share reaches `share`.
    pub fn products_for_share(&self, share: f64) -> Option<usize> {
        self.points
            .iter()
            .find(|p| p.cumulative_share.is_some_and(|s| s >= share))
            .map(|p| p.rank)
    }
}

/// Rank products by gross profit and accumulate their share of the total.
pub fn pareto_curve(products: &[ProductSummary]) -> ParetoCurve {
    let mut ranked = products.to_vec();
    sort_by_profit_desc(&mut ranked);

    let mut running = 0.0;
    let cumulative: Vec<f64> = ranked
        .iter()
        .map(|p| {
            running += p.gross_profit;
            running
        })
        .collect();
    // last running sum doubles as the total so the final share is exactly 1.0
    let total = cumulative.last().copied().unwrap_or(0.0);

    let points = ranked
        .into_iter()
        .zip(cumulative)
        .enumerate()
        .map(|(idx, (product, cum))| ParetoPoint {
            rank: idx + 1,
            product_name: product.product_name,
            gross_profit: product.gross_profit,
            cumulative_profit: cum,
            cumulative_share: super::ratio(cum, total),
        })
        .collect();

    ParetoCurve {
        points,
        total_profit: total,
    }
}
