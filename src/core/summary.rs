use serde::Serialize;

use super::types::{AccountBalances, YearRow};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionSummary {
    pub final_age: u32,
    pub final_salary: f64,
    pub final_pots: AccountBalances,
    pub final_total: f64,
    pub total_net_contributions: f64,
    pub total_pot_contributions: f64,
    pub total_growth: f64,
    pub growth_multiple: f64,
}

/// `None` when there are no rows to summarise.
pub fn summarize(rows: &[YearRow], initial: &AccountBalances) -> Option<ProjectionSummary> {
    let last = rows.last()?;
    let total_net_contributions: f64 = rows.iter().map(|r| r.net_contribution_cost).sum();
    let total_pot_contributions = last.cumulative_lisa
        + last.cumulative_isa
        + last.cumulative_sipp
        + last.cumulative_workplace;
    let final_total = last.pot_total;

    Some(ProjectionSummary {
        final_age: last.age,
        final_salary: last.salary,
        final_pots: last.balances(),
        final_total,
        total_net_contributions,
        total_pot_contributions,
        total_growth: final_total - initial.total() - total_pot_contributions,
        growth_multiple: final_total / total_net_contributions.max(1.0),
    })
}
