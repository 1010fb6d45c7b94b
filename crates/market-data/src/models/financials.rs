use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which financial statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Income,
    BalanceSheet,
    CashFlow,
    Earnings,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Income => "income",
            StatementKind::BalanceSheet => "balance_sheet",
            StatementKind::CashFlow => "cash_flow",
            StatementKind::Earnings => "earnings",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reporting period of a statement series.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportingPeriod {
    Quarterly,
    Annual,
}

impl ReportingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportingPeriod::Quarterly => "quarterly",
            ReportingPeriod::Annual => "annual",
        }
    }

    /// Nominal days between consecutive filings.
    pub fn nominal_cadence_days(&self) -> i64 {
        match self {
            ReportingPeriod::Quarterly => 91,
            ReportingPeriod::Annual => 365,
        }
    }
}

impl fmt::Display for ReportingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One filed statement: the fiscal period it closes and its line items.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialStatement {
    pub period_end: NaiveDate,
    /// Filing date when the provider reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filed_on: Option<NaiveDate>,
    /// Line item name to value, e.g. "TotalRevenue"
    pub items: BTreeMap<String, Decimal>,
}
