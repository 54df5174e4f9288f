use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{Dataset, MarginError, SalesRecord};

pub const DEFAULT_MARGIN_THRESHOLD_PCT: u8 = 20;

/// Sidebar state driving every dashboard view.
///
/// `None` in `date_range` or `divisions` means the control places no restriction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterState {
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    pub divisions: Option<BTreeSet<String>>,
    /// Only flags low-margin products; never removes rows.
    pub margin_threshold_pct: u8,
    pub search: String,
}

impl Default for FilterState {
    fn default() -> Self {
        Self {
            date_range: None,
            divisions: None,
            margin_threshold_pct: DEFAULT_MARGIN_THRESHOLD_PCT,
            search: String::new(),
        }
    }
}

impl FilterState {
    /// Initial control values: full order-date span and every division selected.
    pub fn defaults_for(dataset: &Dataset) -> Self {
        Self {
            date_range: dataset.order_date_bounds(),
            divisions: Some(dataset.divisions().into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn with_threshold(mut self, pct: u8) -> Result<Self, MarginError> {
        if pct > 100 {
            return Err(MarginError::InvalidParameter(format!(
                "margin threshold must be 0-100, got {pct}"
            )));
        }
        self.margin_threshold_pct = pct;
        Ok(self)
    }

    pub fn margin_threshold(&self) -> f64 {
        f64::from(self.margin_threshold_pct) / 100.0
    }

    pub fn matches(&self, record: &SalesRecord) -> bool {
        if let Some((start, end)) = self.date_range {
            match record.order_date {
                Some(date) if date >= start && date <= end => {}
                _ => return false,
            }
        }
        if let Some(selected) = self.divisions.as_ref() {
            if !selected.contains(&record.division) {
                return false;
            }
        }
        true
    }

    pub fn apply<'a>(&self, dataset: &'a Dataset) -> Vec<&'a SalesRecord> {
        dataset.records.iter().filter(|r| self.matches(r)).collect()
    }
}
