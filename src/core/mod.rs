mod allowance;
mod drawdown;
mod engine;
mod error;
mod solver;
mod summary;
mod tables;
mod types;

pub use allowance::AllowanceTracker;
pub use drawdown::{
    DrawdownRow, DrawdownSettings, WithdrawalPlan, project_drawdown, total_shortfall,
};
pub use engine::{
    Projection, YearOutcome, YearState, project_retirement, project_with, step_year,
    validate_inputs,
};
pub use error::{ProjectionError, Result};
pub use solver::{GoalSolveConfig, GoalSolveIteration, GoalSolveResult, GoalType, solve_goal};
pub use summary::{ProjectionSummary, summarize};
pub use tables::{
    AnnualLimits, Band, NiResolver, TaxRegistry, TaxResolver, TaxTable, YearTables,
    gross_for_net, income_breakdown,
};
pub use types::{
    AccountBalances, ContributionRates, ContributionValue, IncomeBreakdown, InvestmentReturns,
    NiCategory, ProjectionInputs, Region, UserProfile, YearRow,
};
