//! Post-retirement drawdown of the pots built up by the projection.
//!
//! Balances and withdrawals are nominal. The annual target and the state
//! pension are indexed by inflation from the saver's current age. Income tax
//! is charged on the deflated amount and scaled back, so the bands keep their
//! real value.
//!
//! The tax-free part of the pension is a fixed lump: growth on it is
//! credited to the taxable part.

use serde::{Deserialize, Serialize};

use super::error::{ProjectionError, Result};
use super::tables::{AnnualLimits, TaxResolver, gross_for_net};
use super::types::{AccountBalances, ProjectionInputs};

const SHARE_SUM_EPS: f64 = 1e-9;
const REDISTRIBUTION_PASSES: u32 = 3;
const DEPLETED_EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalPlan {
    /// Fraction of the yearly need drawn from this pot.
    pub share: f64,
    /// First age at which the pot may be drawn.
    pub access_age: u32,
}

impl WithdrawalPlan {
    pub const fn new(share: f64, access_age: u32) -> Self {
        Self { share, access_age }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawdownSettings {
    pub annual_withdrawal_today: f64,
    pub end_age: u32,
    pub lisa_return: f64,
    pub isa_return: f64,
    pub pension_return: f64,
    pub lisa: WithdrawalPlan,
    pub isa: WithdrawalPlan,
    pub tax_free_pension: WithdrawalPlan,
    pub taxable_pension: WithdrawalPlan,
}

impl Default for DrawdownSettings {
    fn default() -> Self {
        Self {
            annual_withdrawal_today: 0.0,
            end_age: 100,
            lisa_return: 0.05,
            isa_return: 0.05,
            pension_return: 0.05,
            lisa: WithdrawalPlan::new(0.25, 60),
            isa: WithdrawalPlan::new(0.25, 0),
            tax_free_pension: WithdrawalPlan::new(0.25, 57),
            taxable_pension: WithdrawalPlan::new(0.25, 57),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawdownRow {
    pub age: u32,
    pub price_index: f64,
    pub target_withdrawal: f64,
    pub state_pension: f64,
    pub lisa_withdrawal: f64,
    pub isa_withdrawal: f64,
    pub tax_free_pension_withdrawal: f64,
    pub taxable_pension_withdrawal: f64,
    pub taxable_pension_gross: f64,
    pub income_tax: f64,
    pub shortfall: f64,
    pub lisa_balance: f64,
    pub isa_balance: f64,
    pub tax_free_pension_balance: f64,
    pub taxable_pension_balance: f64,
    pub total_balance: f64,
    pub total_balance_today: f64,
}

const LISA: usize = 0;
const ISA: usize = 1;
const TAX_FREE: usize = 2;
const TAXABLE: usize = 3;

struct TaxContext<'a, R> {
    resolver: &'a R,
    inputs: &'a ProjectionInputs,
    price_index: f64,
    state_pension: f64,
    taxable_gross: f64,
}

impl<R: TaxResolver> TaxContext<'_, R> {
    /// Tax on a nominal income, charged against the bands in today's money.
    fn tax_on(&self, income: f64) -> Result<f64> {
        let real = self.resolver.income_tax(
            income / self.price_index,
            self.inputs.user.region,
            self.inputs.tax_year,
        )?;
        Ok(real * self.price_index)
    }

    fn net_of_extra_gross(&self, gross: f64) -> Result<f64> {
        let other = self.state_pension + self.taxable_gross;
        let extra_tax = self.tax_on(other + gross)? - self.tax_on(other)?;
        Ok((gross - extra_tax).max(0.0))
    }

    /// Draws up to `net` after tax from the taxable pot and returns the net
    /// actually delivered.
    fn withdraw(&mut self, net: f64, balance: &mut f64) -> Result<f64> {
        if net <= 0.0 || *balance <= 0.0 {
            return Ok(0.0);
        }
        let other = self.state_pension + self.taxable_gross;
        let real_gross = gross_for_net(
            self.resolver,
            net / self.price_index,
            other / self.price_index,
            self.inputs.user.region,
            self.inputs.tax_year,
        )?;
        let mut gross = real_gross * self.price_index;
        let delivered = if gross > *balance {
            gross = *balance;
            self.net_of_extra_gross(gross)?
        } else {
            net
        };
        *balance -= gross;
        self.taxable_gross += gross;
        Ok(delivered)
    }
}

fn validate_settings(settings: &DrawdownSettings, retirement_age: u32) -> Result<()> {
    if settings.end_age <= retirement_age {
        return Err(ProjectionError::InvalidAge(format!(
            "drawdown end age {} must be greater than retirement age {retirement_age}",
            settings.end_age
        )));
    }
    if !settings.annual_withdrawal_today.is_finite() || settings.annual_withdrawal_today < 0.0 {
        return Err(ProjectionError::InvalidRate(format!(
            "annual withdrawal must be >= 0, got {}",
            settings.annual_withdrawal_today
        )));
    }
    for (name, rate) in [
        ("lisa", settings.lisa_return),
        ("isa", settings.isa_return),
        ("pension", settings.pension_return),
    ] {
        if !rate.is_finite() || rate <= -1.0 || rate > 1.0 {
            return Err(ProjectionError::InvalidRate(format!(
                "post-retirement {name} return must be greater than -1 and at most 1, got {rate}"
            )));
        }
    }
    let shares = plans(settings).map(|p| p.share);
    if shares.iter().any(|s| !s.is_finite() || !(0.0..=1.0).contains(s)) {
        return Err(ProjectionError::InvalidRate(
            "withdrawal shares must each be between 0 and 1".to_string(),
        ));
    }
    let total: f64 = shares.iter().sum();
    if (total - 1.0).abs() > SHARE_SUM_EPS {
        return Err(ProjectionError::InvalidRate(format!(
            "withdrawal shares must sum to 1, got {total}"
        )));
    }
    Ok(())
}

fn plans(settings: &DrawdownSettings) -> [WithdrawalPlan; 4] {
    [
        settings.lisa,
        settings.isa,
        settings.tax_free_pension,
        settings.taxable_pension,
    ]
}

/// Shares for pots that are not yet accessible are spread evenly over the
/// accessible ones. With nothing accessible every share is zero and the whole
/// need goes unmet.
fn effective_shares(plans: &[WithdrawalPlan; 4], age: u32) -> ([f64; 4], [bool; 4]) {
    let accessible = plans.map(|p| age >= p.access_age);
    let open = accessible.iter().filter(|a| **a).count();
    let mut shares = [0.0; 4];
    if open == 0 {
        return (shares, accessible);
    }
    let locked: f64 = plans
        .iter()
        .zip(accessible)
        .filter(|(_, a)| !a)
        .map(|(p, _)| p.share)
        .sum();
    let spread = locked / open as f64;
    for (idx, plan) in plans.iter().enumerate() {
        if accessible[idx] {
            shares[idx] = plan.share + spread;
        }
    }
    (shares, accessible)
}

/// Draws the retirement pots down from the retirement age until
/// `settings.end_age` (exclusive), one row per year.
pub fn project_drawdown<R: TaxResolver>(
    resolver: &R,
    limits: &AnnualLimits,
    inputs: &ProjectionInputs,
    at_retirement: &AccountBalances,
    settings: &DrawdownSettings,
) -> Result<Vec<DrawdownRow>> {
    let retirement_age = inputs.user.retirement_age;
    validate_settings(settings, retirement_age)?;

    let index_at = |age: u32| {
        let years = age.saturating_sub(inputs.user.current_age);
        (1.0 + inputs.inflation).powi(years as i32)
    };

    let pension = at_retirement.sipp + at_retirement.workplace;
    let tax_free = (pension * 0.25).min(limits.lump_sum_allowance * index_at(retirement_age));
    let mut pots = [
        at_retirement.lisa,
        at_retirement.isa,
        tax_free,
        pension - tax_free,
    ];
    let plans = plans(settings);

    let mut rows = Vec::with_capacity((settings.end_age - retirement_age) as usize);
    for age in retirement_age..settings.end_age {
        let price_index = index_at(age);
        let target = settings.annual_withdrawal_today * price_index;
        let state_pension = if age >= limits.state_pension_age {
            limits.state_pension_per_year * price_index
        } else {
            0.0
        };
        let need = (target - state_pension).max(0.0);

        let (shares, accessible) = effective_shares(&plans, age);
        let mut tax = TaxContext {
            resolver,
            inputs,
            price_index,
            state_pension,
            taxable_gross: 0.0,
        };
        let mut withdrawn = [0.0; 4];

        for idx in 0..4 {
            withdrawn[idx] = draw(idx, shares[idx] * need, &mut pots[idx], &mut tax)?;
        }
        let mut shortfall = need - withdrawn.iter().sum::<f64>();

        let mut pass = 0;
        while shortfall > DEPLETED_EPS && pass < REDISTRIBUTION_PASSES {
            let open: Vec<usize> = (0..4)
                .filter(|&idx| accessible[idx] && pots[idx] > DEPLETED_EPS)
                .collect();
            if open.is_empty() {
                break;
            }
            let per_pot = shortfall / open.len() as f64;
            for idx in open {
                let delivered = draw(idx, per_pot, &mut pots[idx], &mut tax)?;
                withdrawn[idx] += delivered;
                shortfall -= delivered;
            }
            pass += 1;
        }

        let income_tax = tax.tax_on(state_pension + tax.taxable_gross)?;
        let taxable_pension_gross = tax.taxable_gross;

        pots[LISA] = (pots[LISA] * (1.0 + settings.lisa_return)).max(0.0);
        pots[ISA] = (pots[ISA] * (1.0 + settings.isa_return)).max(0.0);
        let tax_free_growth = pots[TAX_FREE] * settings.pension_return;
        pots[TAXABLE] =
            (pots[TAXABLE] * (1.0 + settings.pension_return) + tax_free_growth).max(0.0);
        let total_balance: f64 = pots.iter().sum();

        rows.push(DrawdownRow {
            age,
            price_index,
            target_withdrawal: target,
            state_pension,
            lisa_withdrawal: withdrawn[LISA],
            isa_withdrawal: withdrawn[ISA],
            tax_free_pension_withdrawal: withdrawn[TAX_FREE],
            taxable_pension_withdrawal: withdrawn[TAXABLE],
            taxable_pension_gross,
            income_tax,
            shortfall: shortfall.max(0.0),
            lisa_balance: pots[LISA],
            isa_balance: pots[ISA],
            tax_free_pension_balance: pots[TAX_FREE],
            taxable_pension_balance: pots[TAXABLE],
            total_balance,
            total_balance_today: total_balance / price_index,
        });
    }
    Ok(rows)
}

fn draw<R: TaxResolver>(
    idx: usize,
    net: f64,
    balance: &mut f64,
    tax: &mut TaxContext<'_, R>,
) -> Result<f64> {
    if idx == TAXABLE {
        return tax.withdraw(net, balance);
    }
    let taken = net.min(*balance).max(0.0);
    *balance -= taken;
    Ok(taken)
}

/// Total unmet need across the drawdown.
pub fn total_shortfall(rows: &[DrawdownRow]) -> f64 {
    rows.iter().map(|r| r.shortfall).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tables::TaxRegistry;
    use crate::core::types::{
        ContributionRates, InvestmentReturns, NiCategory, Region, UserProfile,
    };

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= 1e-4,
            "expected {expected}, got {actual}"
        );
    }

    fn inputs(current_age: u32, retirement_age: u32, inflation: f64) -> ProjectionInputs {
        ProjectionInputs {
            user: UserProfile {
                current_age,
                retirement_age,
                salary: 40_000.0,
                region: Region::RestOfUk,
            },
            contributions: ContributionRates::default(),
            returns: InvestmentReturns::default(),
            initial_balances: AccountBalances::default(),
            inflation,
            use_qualifying_earnings: false,
            tax_year: 2025,
            ni_category: NiCategory::A,
        }
    }

    fn flat_settings(withdrawal: f64, end_age: u32) -> DrawdownSettings {
        DrawdownSettings {
            annual_withdrawal_today: withdrawal,
            end_age,
            lisa_return: 0.0,
            isa_return: 0.0,
            pension_return: 0.0,
            lisa: WithdrawalPlan::new(0.0, 0),
            isa: WithdrawalPlan::new(1.0, 0),
            tax_free_pension: WithdrawalPlan::new(0.0, 0),
            taxable_pension: WithdrawalPlan::new(0.0, 0),
        }
    }

    fn setup() -> (TaxRegistry, AnnualLimits) {
        let registry = TaxRegistry::builtin().expect("tables");
        let limits = *registry.limits(2025).expect("limits");
        (registry, limits)
    }

    #[test]
    fn isa_only_plan_draws_the_target_each_year() {
        let (registry, limits) = setup();
        let pots = AccountBalances {
            isa: 100_000.0,
            ..AccountBalances::default()
        };
        let rows = project_drawdown(
            &registry,
            &limits,
            &inputs(55, 60, 0.0),
            &pots,
            &flat_settings(10_000.0, 63),
        )
        .expect("drawdown");

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].age, 60);
        for row in &rows {
            assert_approx(row.isa_withdrawal, 10_000.0);
            assert_approx(row.shortfall, 0.0);
        }
        assert_approx(rows[2].isa_balance, 70_000.0);
    }

    #[test]
    fn pension_splits_into_tax_free_and_taxable_parts() {
        let (registry, limits) = setup();
        let pots = AccountBalances {
            sipp: 60_000.0,
            workplace: 40_000.0,
            ..AccountBalances::default()
        };
        let rows = project_drawdown(
            &registry,
            &limits,
            &inputs(60, 60 + 1, 0.0),
            &pots,
            &flat_settings(0.0, 62),
        )
        .expect("drawdown");
        assert_approx(rows[0].tax_free_pension_balance, 25_000.0);
        assert_approx(rows[0].taxable_pension_balance, 75_000.0);
    }

    #[test]
    fn tax_free_portion_is_capped_by_lump_sum_allowance() {
        let (registry, limits) = setup();
        let pots = AccountBalances {
            sipp: 2_000_000.0,
            ..AccountBalances::default()
        };
        let rows = project_drawdown(
            &registry,
            &limits,
            &inputs(60, 61, 0.0),
            &pots,
            &flat_settings(0.0, 62),
        )
        .expect("drawdown");
        assert_approx(rows[0].tax_free_pension_balance, 268_275.0);
    }

    #[test]
    fn state_pension_reduces_the_need() {
        let (registry, limits) = setup();
        let pots = AccountBalances {
            isa: 500_000.0,
            ..AccountBalances::default()
        };
        let rows = project_drawdown(
            &registry,
            &limits,
            &inputs(60, 66, 0.0),
            &pots,
            &flat_settings(20_000.0, 68),
        )
        .expect("drawdown");
        assert_approx(rows[0].state_pension, 0.0);
        assert_approx(rows[0].isa_withdrawal, 20_000.0);
        assert_approx(rows[1].state_pension, 11_973.0);
        assert_approx(rows[1].isa_withdrawal, 20_000.0 - 11_973.0);
    }

    #[test]
    fn taxable_pension_pays_the_gross_for_the_net_need() {
        let (registry, limits) = setup();
        let pots = AccountBalances {
            sipp: 400_000.0,
            ..AccountBalances::default()
        };
        let mut settings = flat_settings(8_000.0 + 11_973.0, 68);
        settings.isa.share = 0.0;
        settings.taxable_pension.share = 1.0;
        let rows = project_drawdown(&registry, &limits, &inputs(60, 67, 0.0), &pots, &settings)
            .expect("drawdown");

        let row = &rows[0];
        assert_approx(row.taxable_pension_withdrawal, 8_000.0);
        // 11,973 state pension leaves 597 of allowance, the rest taxed at 20%.
        let expected_gross = 597.0 + (8_000.0 - 597.0) / 0.8;
        assert_approx(row.taxable_pension_gross, expected_gross);
        let expected_tax = (11_973.0 + expected_gross - 12_570.0) * 0.20;
        assert_approx(row.income_tax, expected_tax);
    }

    #[test]
    fn locked_pot_shares_move_to_accessible_pots() {
        let (registry, limits) = setup();
        let pots = AccountBalances {
            lisa: 50_000.0,
            isa: 50_000.0,
            ..AccountBalances::default()
        };
        let mut settings = flat_settings(10_000.0, 62);
        settings.lisa = WithdrawalPlan::new(0.5, 61);
        settings.isa = WithdrawalPlan::new(0.5, 0);
        let rows = project_drawdown(&registry, &limits, &inputs(55, 60, 0.0), &pots, &settings)
            .expect("drawdown");

        assert_approx(rows[0].lisa_withdrawal, 0.0);
        assert_approx(rows[0].isa_withdrawal, 10_000.0);
        assert_approx(rows[1].lisa_withdrawal, 5_000.0);
        assert_approx(rows[1].isa_withdrawal, 5_000.0);
    }

    #[test]
    fn depleted_pot_shortfall_is_covered_by_other_pots() {
        let (registry, limits) = setup();
        let pots = AccountBalances {
            lisa: 2_000.0,
            isa: 50_000.0,
            ..AccountBalances::default()
        };
        let mut settings = flat_settings(10_000.0, 61);
        settings.lisa.share = 0.5;
        settings.isa.share = 0.5;
        let rows = project_drawdown(&registry, &limits, &inputs(55, 60, 0.0), &pots, &settings)
            .expect("drawdown");

        assert_approx(rows[0].lisa_withdrawal, 2_000.0);
        assert_approx(rows[0].isa_withdrawal, 8_000.0);
        assert_approx(rows[0].shortfall, 0.0);
    }

    #[test]
    fn exhausted_pots_report_a_shortfall_and_never_go_negative() {
        let (registry, limits) = setup();
        let pots = AccountBalances {
            isa: 15_000.0,
            ..AccountBalances::default()
        };
        let rows = project_drawdown(
            &registry,
            &limits,
            &inputs(55, 60, 0.0),
            &pots,
            &flat_settings(10_000.0, 63),
        )
        .expect("drawdown");

        assert_approx(rows[1].isa_withdrawal, 5_000.0);
        assert_approx(rows[1].shortfall, 5_000.0);
        assert_approx(rows[2].shortfall, 10_000.0);
        assert_approx(total_shortfall(&rows), 15_000.0);
        assert!(rows.iter().all(|r| r.isa_balance >= 0.0));
    }

    #[test]
    fn target_is_indexed_from_current_age() {
        let (registry, limits) = setup();
        let pots = AccountBalances {
            isa: 1_000_000.0,
            ..AccountBalances::default()
        };
        let rows = project_drawdown(
            &registry,
            &limits,
            &inputs(58, 60, 0.02),
            &pots,
            &flat_settings(10_000.0, 61),
        )
        .expect("drawdown");
        assert_approx(rows[0].price_index, 1.02 * 1.02);
        assert_approx(rows[0].target_withdrawal, 10_000.0 * 1.02 * 1.02);
    }

    #[test]
    fn nothing_accessible_leaves_the_whole_need_unmet() {
        let (registry, limits) = setup();
        let pots = AccountBalances {
            lisa: 100_000.0,
            isa: 100_000.0,
            ..AccountBalances::default()
        };
        let mut settings = flat_settings(20_000.0, 58);
        settings.lisa = WithdrawalPlan::new(0.5, 60);
        settings.isa = WithdrawalPlan::new(0.5, 60);
        settings.tax_free_pension.access_age = 60;
        settings.taxable_pension.access_age = 60;
        let rows = project_drawdown(&registry, &limits, &inputs(50, 55, 0.0), &pots, &settings)
            .expect("drawdown");

        for row in &rows {
            assert_approx(row.lisa_withdrawal + row.isa_withdrawal, 0.0);
            assert_approx(row.shortfall, 20_000.0);
        }
        assert_approx(total_shortfall(&rows), 60_000.0);
        assert_approx(rows[2].total_balance, 200_000.0);
    }

    #[test]
    fn tax_free_lump_stays_fixed_while_its_growth_goes_to_taxable() {
        let (registry, limits) = setup();
        let pots = AccountBalances {
            sipp: 100_000.0,
            ..AccountBalances::default()
        };
        let mut settings = flat_settings(0.0, 62);
        settings.pension_return = 0.10;
        let rows = project_drawdown(&registry, &limits, &inputs(55, 60, 0.0), &pots, &settings)
            .expect("drawdown");

        assert_approx(rows[0].tax_free_pension_balance, 25_000.0);
        assert_approx(rows[0].taxable_pension_balance, 85_000.0);
        assert_approx(rows[1].tax_free_pension_balance, 25_000.0);
        assert_approx(rows[1].taxable_pension_balance, 85_000.0 * 1.1 + 2_500.0);
    }

    #[test]
    fn pension_tax_keeps_its_real_value_under_inflation() {
        let (registry, limits) = setup();
        let pots = AccountBalances {
            sipp: 5_000_000.0,
            ..AccountBalances::default()
        };
        let mut settings = flat_settings(20_000.0, 91);
        settings.isa.share = 0.0;
        settings.taxable_pension.share = 1.0;

        let inflated = inputs(30, 90, 0.03);
        let inflated = project_drawdown(&registry, &limits, &inflated, &pots, &settings)
            .expect("inflated drawdown");

        let row = &inflated[0];
        let index = 1.03f64.powi(60);
        assert_approx(row.price_index, index);
        assert!(row.income_tax > 0.0);

        // The same real withdrawal with no inflation pays the same real tax.
        let today = inputs(89, 90, 0.0);
        let today = project_drawdown(&registry, &limits, &today, &pots, &settings)
            .expect("today drawdown");
        let expected = &today[0];
        assert!((row.income_tax / index - expected.income_tax).abs() < 1e-3);
        assert!((row.taxable_pension_gross / index - expected.taxable_pension_gross).abs() < 1e-3);
    }

    #[test]
    fn shares_must_sum_to_one() {
        let (registry, limits) = setup();
        let mut settings = flat_settings(10_000.0, 70);
        settings.lisa.share = 0.2;
        let err = project_drawdown(
            &registry,
            &limits,
            &inputs(55, 60, 0.0),
            &AccountBalances::default(),
            &settings,
        )
        .expect_err("shares sum to 1.2");
        assert!(matches!(err, ProjectionError::InvalidRate(_)));
    }

    #[test]
    fn end_age_must_follow_retirement() {
        let (registry, limits) = setup();
        let err = project_drawdown(
            &registry,
            &limits,
            &inputs(55, 60, 0.0),
            &AccountBalances::default(),
            &flat_settings(10_000.0, 60),
        )
        .expect_err("end age equals retirement age");
        assert!(matches!(err, ProjectionError::InvalidAge(_)));
    }
}
