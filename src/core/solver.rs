use serde::{Deserialize, Serialize};

use super::drawdown::{DrawdownSettings, project_drawdown, total_shortfall};
use super::engine::project_with;
use super::error::{ProjectionError, Result};
use super::tables::{AnnualLimits, NiResolver, TaxResolver};
use super::types::{AccountBalances, ContributionValue, ProjectionInputs, YearRow};

const SHORTFALL_EPS: f64 = 1e-6;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GoalType {
    /// Smallest fixed yearly ISA amount reaching `target_pot` at retirement.
    RequiredIsaContribution,
    /// Largest yearly withdrawal in today's money with no drawdown shortfall.
    MaxDrawdown,
}

#[derive(Debug, Clone, Copy)]
pub struct GoalSolveConfig {
    pub goal_type: GoalType,
    pub target_pot: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
    pub drawdown: DrawdownSettings,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalSolveIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_value: f64,
    /// Pot at retirement, or total drawdown shortfall for `MaxDrawdown`.
    pub metric: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalSolveResult {
    pub goal_type: GoalType,
    pub target_pot: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
    pub solved_value: Option<f64>,
    pub achieved_metric: Option<f64>,
    pub iterations: Vec<GoalSolveIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
struct CandidateEval {
    metric: f64,
    meets_goal: bool,
}

pub fn solve_goal<R: TaxResolver + NiResolver>(
    resolver: &R,
    limits: AnnualLimits,
    inputs: &ProjectionInputs,
    config: GoalSolveConfig,
) -> Result<GoalSolveResult> {
    validate_config(config)?;

    // The accumulation phase does not depend on the withdrawal amount.
    let at_retirement = match config.goal_type {
        GoalType::MaxDrawdown => Some(final_balances(
            inputs,
            &project_with(resolver, limits, inputs)?,
        )),
        GoalType::RequiredIsaContribution => None,
    };
    let evaluate = |value: f64| -> Result<CandidateEval> {
        match at_retirement {
            Some(pots) => evaluate_drawdown(resolver, &limits, inputs, &pots, config, value),
            None => evaluate_isa_contribution(resolver, limits, inputs, config, value),
        }
    };

    let mut iterations = Vec::with_capacity(config.max_iterations as usize);
    let low_eval = evaluate(config.search_min)?;
    let high_eval = evaluate(config.search_max)?;

    let mut solved_value = None;
    let mut converged = false;
    let feasible;
    let message;

    match config.goal_type {
        GoalType::RequiredIsaContribution => {
            if low_eval.meets_goal {
                solved_value = Some(config.search_min);
                converged = true;
                feasible = true;
                message = "Already meets target at lower contribution bound.".to_string();
            } else if !high_eval.meets_goal {
                feasible = false;
                message =
                    "No feasible ISA contribution found within the search bounds.".to_string();
            } else {
                let mut lo = config.search_min;
                let mut hi = config.search_max;
                let mut it = 0;
                while it < config.max_iterations {
                    it += 1;
                    let mid = (lo + hi) * 0.5;
                    let eval = evaluate(mid)?;
                    iterations.push(GoalSolveIteration {
                        iteration: it,
                        lower_bound: lo,
                        upper_bound: hi,
                        candidate_value: mid,
                        metric: eval.metric,
                    });

                    if eval.meets_goal {
                        hi = mid;
                    } else {
                        lo = mid;
                    }

                    if (hi - lo).abs() <= config.tolerance {
                        converged = true;
                        solved_value = Some(hi);
                        break;
                    }
                }
                if solved_value.is_none() {
                    solved_value = Some(hi);
                }
                feasible = true;
                message = if converged {
                    "Solved required ISA contribution.".to_string()
                } else {
                    "Reached max iterations before tolerance was met; returning best estimate."
                        .to_string()
                };
            }
        }
        GoalType::MaxDrawdown => {
            if !low_eval.meets_goal {
                feasible = false;
                message = "No sustainable withdrawal found within the search bounds.".to_string();
            } else if high_eval.meets_goal {
                solved_value = Some(config.search_max);
                converged = true;
                feasible = true;
                message = "Upper withdrawal bound is still sustainable; \
                           increase search max for higher target."
                    .to_string();
            } else {
                let mut lo = config.search_min;
                let mut hi = config.search_max;
                let mut it = 0;
                while it < config.max_iterations {
                    it += 1;
                    let mid = (lo + hi) * 0.5;
                    let eval = evaluate(mid)?;
                    iterations.push(GoalSolveIteration {
                        iteration: it,
                        lower_bound: lo,
                        upper_bound: hi,
                        candidate_value: mid,
                        metric: eval.metric,
                    });

                    if eval.meets_goal {
                        lo = mid;
                    } else {
                        hi = mid;
                    }

                    if (hi - lo).abs() <= config.tolerance {
                        converged = true;
                        solved_value = Some(lo);
                        break;
                    }
                }
                if solved_value.is_none() {
                    solved_value = Some(lo);
                }
                feasible = true;
                message = if converged {
                    "Solved maximum sustainable withdrawal.".to_string()
                } else {
                    "Reached max iterations before tolerance was met; returning best estimate."
                        .to_string()
                };
            }
        }
    }

    let achieved_metric = match solved_value {
        Some(value) => Some(evaluate(value)?.metric),
        None => None,
    };

    Ok(GoalSolveResult {
        goal_type: config.goal_type,
        target_pot: config.target_pot,
        search_min: config.search_min,
        search_max: config.search_max,
        tolerance: config.tolerance,
        max_iterations: config.max_iterations,
        solved_value,
        achieved_metric,
        iterations,
        converged,
        feasible,
        message,
    })
}

fn final_balances(inputs: &ProjectionInputs, rows: &[YearRow]) -> AccountBalances {
    rows.last()
        .map(YearRow::balances)
        .unwrap_or(inputs.initial_balances)
}

fn evaluate_isa_contribution<R: TaxResolver + NiResolver>(
    resolver: &R,
    limits: AnnualLimits,
    inputs: &ProjectionInputs,
    config: GoalSolveConfig,
    isa_amount: f64,
) -> Result<CandidateEval> {
    let mut candidate = inputs.clone();
    candidate.contributions.isa = ContributionValue::Amount(isa_amount.max(0.0));
    let rows = project_with(resolver, limits, &candidate)?;
    let metric = final_balances(&candidate, &rows).total();
    Ok(CandidateEval {
        metric,
        meets_goal: metric + 1e-9 >= config.target_pot,
    })
}

fn evaluate_drawdown<R: TaxResolver>(
    resolver: &R,
    limits: &AnnualLimits,
    inputs: &ProjectionInputs,
    at_retirement: &AccountBalances,
    config: GoalSolveConfig,
    withdrawal: f64,
) -> Result<CandidateEval> {
    let settings = DrawdownSettings {
        annual_withdrawal_today: withdrawal.max(0.0),
        ..config.drawdown
    };
    let rows = project_drawdown(resolver, limits, inputs, at_retirement, &settings)?;
    let metric = total_shortfall(&rows);
    Ok(CandidateEval {
        metric,
        meets_goal: metric <= SHORTFALL_EPS,
    })
}

fn validate_config(config: GoalSolveConfig) -> Result<()> {
    if !config.search_min.is_finite() || !config.search_max.is_finite() {
        return Err(ProjectionError::InvalidGoal(
            "search bounds must be finite".to_string(),
        ));
    }
    if config.search_min < 0.0 {
        return Err(ProjectionError::InvalidGoal(
            "search min must be >= 0".to_string(),
        ));
    }
    if config.search_max <= config.search_min {
        return Err(ProjectionError::InvalidGoal(
            "search max must be greater than search min".to_string(),
        ));
    }
    if !config.tolerance.is_finite() || config.tolerance <= 0.0 {
        return Err(ProjectionError::InvalidGoal(
            "tolerance must be > 0".to_string(),
        ));
    }
    if config.max_iterations == 0 {
        return Err(ProjectionError::InvalidGoal(
            "max iterations must be >= 1".to_string(),
        ));
    }
    if config.goal_type == GoalType::RequiredIsaContribution
        && (!config.target_pot.is_finite() || config.target_pot < 0.0)
    {
        return Err(ProjectionError::InvalidGoal(
            "target pot must be >= 0".to_string(),
        ));
    }
    Ok(())
}
