use serde::{Deserialize, Serialize};

use super::error::{ProjectionError, Result};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    RestOfUk,
    Scotland,
}

impl Region {
    pub fn from_scotland_flag(scotland: bool) -> Self {
        if scotland {
            Region::Scotland
        } else {
            Region::RestOfUk
        }
    }
}

/// Employee National Insurance category letter.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum NiCategory {
    A,
    B,
    C,
    J,
}

impl NiCategory {
    pub fn letter(self) -> &'static str {
        match self {
            NiCategory::A => "A",
            NiCategory::B => "B",
            NiCategory::C => "C",
            NiCategory::J => "J",
        }
    }
}

/// A contribution expressed either as a fraction of its base or as a fixed
/// annual amount in pounds.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContributionValue {
    Rate(f64),
    Amount(f64),
}

impl Default for ContributionValue {
    fn default() -> Self {
        ContributionValue::Rate(0.0)
    }
}

impl ContributionValue {
    /// Interprets an untagged number the way older configs did: values up
    /// to and including 1 are rates, anything larger is an amount.
    pub fn from_magnitude(value: f64) -> Self {
        if value <= 1.0 {
            ContributionValue::Rate(value)
        } else {
            ContributionValue::Amount(value)
        }
    }

    pub fn resolve(self, base: f64) -> f64 {
        match self {
            ContributionValue::Rate(rate) => rate * base.max(0.0),
            ContributionValue::Amount(amount) => amount,
        }
    }

    pub fn validate(self, name: &str) -> Result<()> {
        match self {
            ContributionValue::Rate(rate) => {
                if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
                    return Err(ProjectionError::InvalidRate(format!(
                        "{name} rate must be between 0 and 1, got {rate}"
                    )));
                }
            }
            ContributionValue::Amount(amount) => {
                if !amount.is_finite() || amount < 0.0 {
                    return Err(ProjectionError::InvalidRate(format!(
                        "{name} amount must be >= 0, got {amount}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub current_age: u32,
    pub retirement_age: u32,
    pub salary: f64,
    pub region: Region,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionRates {
    pub lisa: ContributionValue,
    pub isa: ContributionValue,
    pub sipp_employee: ContributionValue,
    pub sipp_employer: ContributionValue,
    pub workplace_employee: ContributionValue,
    pub workplace_employer: ContributionValue,
    /// Share of the would-be LISA amount paid into the ISA once LISA
    /// contributions stop.
    pub shift_lisa_to_isa: f64,
    /// Share of the would-be LISA amount paid into the SIPP once LISA
    /// contributions stop.
    pub shift_lisa_to_sipp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestmentReturns {
    pub lisa: f64,
    pub isa: f64,
    pub sipp: f64,
    pub workplace: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalances {
    pub lisa: f64,
    pub isa: f64,
    pub sipp: f64,
    pub workplace: f64,
}

impl AccountBalances {
    pub fn total(&self) -> f64 {
        self.lisa + self.isa + self.sipp + self.workplace
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeBreakdown {
    pub salary: f64,
    pub take_home_salary: f64,
    pub income_tax: f64,
    pub ni_due: f64,
}

/// Everything a projection run needs. Immutable for the run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionInputs {
    pub user: UserProfile,
    pub contributions: ContributionRates,
    pub returns: InvestmentReturns,
    pub initial_balances: AccountBalances,
    pub inflation: f64,
    pub use_qualifying_earnings: bool,
    pub tax_year: u16,
    pub ni_category: NiCategory,
}

/// One simulated year of the accumulation phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearRow {
    pub age: u32,
    pub salary: f64,
    pub take_home_salary: f64,
    pub income_tax: f64,
    pub ni_due: f64,

    pub lisa_net: f64,
    pub lisa_bonus: f64,
    pub isa_net: f64,
    pub sipp_employee_net: f64,
    pub sipp_employee_gross: f64,
    pub sipp_employer: f64,
    pub workplace_employee_net: f64,
    pub workplace_employee_gross: f64,
    pub workplace_employer: f64,

    pub tax_relief_total: f64,
    /// Higher-rate relief the saver could reclaim outside the pot. Never
    /// added to a balance.
    pub tax_refund: f64,
    pub net_contribution_cost: f64,
    pub unallocated_take_home: f64,

    pub isa_allowance_used: f64,
    pub lisa_allowance_used: f64,
    pub pension_allowance_used: f64,

    pub lisa_growth: f64,
    pub isa_growth: f64,
    pub sipp_growth: f64,
    pub workplace_growth: f64,

    pub pot_lisa: f64,
    pub pot_isa: f64,
    pub pot_sipp: f64,
    pub pot_workplace: f64,
    pub pot_total: f64,

    pub cumulative_lisa: f64,
    pub cumulative_isa: f64,
    pub cumulative_sipp: f64,
    pub cumulative_workplace: f64,
}

impl YearRow {
    pub fn balances(&self) -> AccountBalances {
        AccountBalances {
            lisa: self.pot_lisa,
            isa: self.pot_isa,
            sipp: self.pot_sipp,
            workplace: self.pot_workplace,
        }
    }
}
