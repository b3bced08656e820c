use super::allowance::AllowanceTracker;
use super::error::{ProjectionError, Result};
use super::tables::{AnnualLimits, NiResolver, TaxRegistry, TaxResolver, income_breakdown};
use super::types::{AccountBalances, ProjectionInputs, YearRow};

const SHIFT_SUM_EPS: f64 = 1e-9;

/// State carried from one simulated year into the next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YearState {
    pub age: u32,
    pub salary: f64,
    pub balances: AccountBalances,
    pub cumulative: AccountBalances,
    pub allowances: AllowanceTracker,
}

impl YearState {
    pub fn initial(inputs: &ProjectionInputs, limits: AnnualLimits) -> Self {
        Self {
            age: inputs.user.current_age,
            salary: inputs.user.salary,
            balances: inputs.initial_balances,
            cumulative: AccountBalances::default(),
            allowances: AllowanceTracker::new(limits),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct YearOutcome {
    pub row: YearRow,
    pub next: YearState,
}

#[derive(Debug, Clone, Copy)]
struct RequestedContributions {
    lisa: f64,
    isa: f64,
    sipp_employee: f64,
    sipp_employer: f64,
    workplace_employee: f64,
    workplace_employer: f64,
}

#[derive(Debug, Clone, Copy)]
struct GrantedContributions {
    lisa_net: f64,
    lisa_bonus: f64,
    isa_net: f64,
    sipp_employee_net: f64,
    sipp_employee_gross: f64,
    sipp_employer: f64,
    workplace_employee_net: f64,
    workplace_employee_gross: f64,
    workplace_employer: f64,
}

impl GrantedContributions {
    fn into_pots(self) -> AccountBalances {
        AccountBalances {
            lisa: self.lisa_net + self.lisa_bonus,
            isa: self.isa_net,
            sipp: self.sipp_employee_gross + self.sipp_employer,
            workplace: self.workplace_employee_gross + self.workplace_employer,
        }
    }

    fn relief_total(self) -> f64 {
        (self.sipp_employee_gross - self.sipp_employee_net)
            + (self.workplace_employee_gross - self.workplace_employee_net)
    }

    fn net_cost(self) -> f64 {
        self.lisa_net + self.isa_net + self.sipp_employee_net + self.workplace_employee_net
    }
}

pub fn validate_inputs(inputs: &ProjectionInputs) -> Result<()> {
    let user = &inputs.user;
    if user.retirement_age <= user.current_age {
        return Err(ProjectionError::InvalidAge(format!(
            "retirement age {} must be greater than current age {}",
            user.retirement_age, user.current_age
        )));
    }
    if !user.salary.is_finite() || user.salary < 0.0 {
        return Err(ProjectionError::InvalidIncome(format!(
            "salary must be >= 0, got {}",
            user.salary
        )));
    }

    let contributions = &inputs.contributions;
    for (name, value) in [
        ("lisa", contributions.lisa),
        ("isa", contributions.isa),
        ("sipp employee", contributions.sipp_employee),
        ("sipp employer", contributions.sipp_employer),
        ("workplace employee", contributions.workplace_employee),
        ("workplace employer", contributions.workplace_employer),
    ] {
        value.validate(name)?;
    }

    for (name, shift) in [
        ("shift_lisa_to_isa", contributions.shift_lisa_to_isa),
        ("shift_lisa_to_sipp", contributions.shift_lisa_to_sipp),
    ] {
        if !shift.is_finite() || !(0.0..=1.0).contains(&shift) {
            return Err(ProjectionError::InvalidRate(format!(
                "{name} must be between 0 and 1, got {shift}"
            )));
        }
    }
    let shift_total = contributions.shift_lisa_to_isa + contributions.shift_lisa_to_sipp;
    if shift_total > 1.0 + SHIFT_SUM_EPS {
        return Err(ProjectionError::InvalidRate(format!(
            "LISA redirection shares must sum to at most 1, got {shift_total}"
        )));
    }

    let returns = &inputs.returns;
    for (name, rate) in [
        ("lisa return", returns.lisa),
        ("isa return", returns.isa),
        ("sipp return", returns.sipp),
        ("workplace return", returns.workplace),
        ("inflation", inputs.inflation),
    ] {
        if !rate.is_finite() || rate <= -1.0 || rate > 1.0 {
            return Err(ProjectionError::InvalidRate(format!(
                "{name} must be greater than -1 and at most 1, got {rate}"
            )));
        }
    }

    let balances = &inputs.initial_balances;
    for (name, balance) in [
        ("lisa", balances.lisa),
        ("isa", balances.isa),
        ("sipp", balances.sipp),
        ("workplace", balances.workplace),
    ] {
        if !balance.is_finite() || balance < 0.0 {
            return Err(ProjectionError::InvalidBalance(format!(
                "initial {name} balance must be >= 0, got {balance}"
            )));
        }
    }
    Ok(())
}

/// Runs one tax year: take-home pay, contribution requests, LISA
/// redirection, allowance clipping, top-ups, growth and salary growth.
pub fn step_year<R: TaxResolver + NiResolver>(
    resolver: &R,
    limits: &AnnualLimits,
    inputs: &ProjectionInputs,
    state: YearState,
) -> Result<YearOutcome> {
    let income = income_breakdown(
        resolver,
        state.salary,
        inputs.user.region,
        inputs.tax_year,
        inputs.ni_category,
    )?;
    let take_home = income.take_home_salary;

    let mut requested = requested_contributions(inputs, limits, state.salary, take_home);
    if state.age >= limits.lisa_max_contribution_age {
        redirect_lisa(&mut requested, inputs);
    }

    let mut allowances = state.allowances;
    allowances.reset();
    let granted = grant_contributions(&mut allowances, limits, requested);

    let tax_relief_total = granted.relief_total();
    let employee_gross = granted.sipp_employee_gross + granted.workplace_employee_gross;
    let tax_refund = if employee_gross > 0.0 {
        let tax_full = resolver.income_tax(state.salary, inputs.user.region, inputs.tax_year)?;
        let tax_reduced = resolver.income_tax(
            (state.salary - employee_gross).max(0.0),
            inputs.user.region,
            inputs.tax_year,
        )?;
        (tax_full - tax_reduced - tax_relief_total).max(0.0)
    } else {
        0.0
    };

    let paid_in = granted.into_pots();
    let before = state.balances;
    let balances = AccountBalances {
        lisa: grow(before.lisa, paid_in.lisa, inputs.returns.lisa),
        isa: grow(before.isa, paid_in.isa, inputs.returns.isa),
        sipp: grow(before.sipp, paid_in.sipp, inputs.returns.sipp),
        workplace: grow(before.workplace, paid_in.workplace, inputs.returns.workplace),
    };
    let cumulative = AccountBalances {
        lisa: state.cumulative.lisa + paid_in.lisa,
        isa: state.cumulative.isa + paid_in.isa,
        sipp: state.cumulative.sipp + paid_in.sipp,
        workplace: state.cumulative.workplace + paid_in.workplace,
    };
    let net_contribution_cost = granted.net_cost();

    let row = YearRow {
        age: state.age,
        salary: state.salary,
        take_home_salary: take_home,
        income_tax: income.income_tax,
        ni_due: income.ni_due,
        lisa_net: granted.lisa_net,
        lisa_bonus: granted.lisa_bonus,
        isa_net: granted.isa_net,
        sipp_employee_net: granted.sipp_employee_net,
        sipp_employee_gross: granted.sipp_employee_gross,
        sipp_employer: granted.sipp_employer,
        workplace_employee_net: granted.workplace_employee_net,
        workplace_employee_gross: granted.workplace_employee_gross,
        workplace_employer: granted.workplace_employer,
        tax_relief_total,
        tax_refund,
        net_contribution_cost,
        unallocated_take_home: take_home - net_contribution_cost,
        isa_allowance_used: allowances.isa_used,
        lisa_allowance_used: allowances.lisa_used,
        pension_allowance_used: allowances.pension_used,
        lisa_growth: balances.lisa - before.lisa - paid_in.lisa,
        isa_growth: balances.isa - before.isa - paid_in.isa,
        sipp_growth: balances.sipp - before.sipp - paid_in.sipp,
        workplace_growth: balances.workplace - before.workplace - paid_in.workplace,
        pot_lisa: balances.lisa,
        pot_isa: balances.isa,
        pot_sipp: balances.sipp,
        pot_workplace: balances.workplace,
        pot_total: balances.total(),
        cumulative_lisa: cumulative.lisa,
        cumulative_isa: cumulative.isa,
        cumulative_sipp: cumulative.sipp,
        cumulative_workplace: cumulative.workplace,
    };

    Ok(YearOutcome {
        row,
        next: YearState {
            age: state.age + 1,
            salary: state.salary * (1.0 + inputs.inflation),
            balances,
            cumulative,
            allowances,
        },
    })
}

fn requested_contributions(
    inputs: &ProjectionInputs,
    limits: &AnnualLimits,
    salary: f64,
    take_home: f64,
) -> RequestedContributions {
    let workplace_base = if inputs.use_qualifying_earnings {
        (salary.clamp(
            limits.qualifying_earnings_lower,
            limits.qualifying_earnings_upper.max(limits.qualifying_earnings_lower),
        ) - limits.qualifying_earnings_lower)
            .max(0.0)
    } else {
        take_home
    };

    let c = &inputs.contributions;
    RequestedContributions {
        lisa: c.lisa.resolve(take_home),
        isa: c.isa.resolve(take_home),
        sipp_employee: c.sipp_employee.resolve(take_home),
        sipp_employer: c.sipp_employer.resolve(take_home),
        workplace_employee: c.workplace_employee.resolve(workplace_base),
        workplace_employer: c.workplace_employer.resolve(workplace_base),
    }
}

// Whatever the shares leave unassigned is dropped.
fn redirect_lisa(requested: &mut RequestedContributions, inputs: &ProjectionInputs) {
    let would_be = requested.lisa;
    requested.lisa = 0.0;
    requested.isa += would_be * inputs.contributions.shift_lisa_to_isa;
    requested.sipp_employee += would_be * inputs.contributions.shift_lisa_to_sipp;
}

fn grant_contributions(
    allowances: &mut AllowanceTracker,
    limits: &AnnualLimits,
    requested: RequestedContributions,
) -> GrantedContributions {
    let (lisa_net, lisa_bonus) = allowances.grant_lisa(requested.lisa);
    let isa_net = allowances.grant_isa(requested.isa);

    let net_share = 1.0 - limits.basic_rate_relief;
    let sipp_employee_gross = allowances.grant_pension(requested.sipp_employee / net_share);
    let workplace_employee_gross =
        allowances.grant_pension(requested.workplace_employee / net_share);
    let sipp_employer = allowances.grant_pension(requested.sipp_employer);
    let workplace_employer = allowances.grant_pension(requested.workplace_employer);

    GrantedContributions {
        lisa_net,
        lisa_bonus,
        isa_net,
        sipp_employee_net: sipp_employee_gross * net_share,
        sipp_employee_gross,
        sipp_employer,
        workplace_employee_net: workplace_employee_gross * net_share,
        workplace_employee_gross,
        workplace_employer,
    }
}

fn grow(balance: f64, contribution: f64, rate: f64) -> f64 {
    ((balance + contribution) * (1.0 + rate)).max(0.0)
}

enum DriverState {
    Running(YearState),
    Done,
}

/// Lazily yields one row per simulated age from the current age up to, but
/// not including, the retirement age. Stops after the first error.
pub struct Projection<'a, R> {
    resolver: &'a R,
    limits: AnnualLimits,
    inputs: &'a ProjectionInputs,
    state: DriverState,
}

impl<'a, R: TaxResolver + NiResolver> Projection<'a, R> {
    pub fn new(
        resolver: &'a R,
        limits: AnnualLimits,
        inputs: &'a ProjectionInputs,
    ) -> Result<Self> {
        validate_inputs(inputs)?;
        Ok(Self {
            resolver,
            limits,
            inputs,
            state: DriverState::Running(YearState::initial(inputs, limits)),
        })
    }
}

impl<R: TaxResolver + NiResolver> Iterator for Projection<'_, R> {
    type Item = Result<YearRow>;

    fn next(&mut self) -> Option<Self::Item> {
        let state = match std::mem::replace(&mut self.state, DriverState::Done) {
            DriverState::Running(state) if state.age < self.inputs.user.retirement_age => state,
            _ => return None,
        };
        match step_year(self.resolver, &self.limits, self.inputs, state) {
            Ok(outcome) => {
                self.state = DriverState::Running(outcome.next);
                Some(Ok(outcome.row))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

pub fn project_with<R: TaxResolver + NiResolver>(
    resolver: &R,
    limits: AnnualLimits,
    inputs: &ProjectionInputs,
) -> Result<Vec<YearRow>> {
    Projection::new(resolver, limits, inputs)?.collect()
}

/// Projects every year from the current age to retirement using the
/// registry's tables and limits for `inputs.tax_year`.
pub fn project_retirement(
    registry: &TaxRegistry,
    inputs: &ProjectionInputs,
) -> Result<Vec<YearRow>> {
    let limits = *registry.limits(inputs.tax_year)?;
    project_with(registry, limits, inputs)
}
