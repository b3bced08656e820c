mod export;
mod server;

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::core::{
    AccountBalances, ContributionRates, ContributionValue, DrawdownSettings, InvestmentReturns,
    NiCategory, ProjectionError, ProjectionInputs, Region, TaxRegistry, UserProfile,
    WithdrawalPlan, project_drawdown, project_retirement, summarize,
};

pub use export::{
    format_drawdown_table, format_projection_table, format_summary, write_csv, write_csv_file,
};
pub use server::run_http_server;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error("{0}")]
    Invalid(String),
}

/// Parses a contribution given on the command line or in a config file.
///
/// `5%` is a rate, `£3000` is an amount, and a bare number follows the
/// magnitude rule of [`ContributionValue::from_magnitude`].
pub fn parse_contribution(raw: &str) -> Result<ContributionValue, String> {
    let text = raw.trim();
    if let Some(pct) = text.strip_suffix('%') {
        let value = pct
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("invalid percentage '{raw}'"))?;
        return Ok(ContributionValue::Rate(value / 100.0));
    }
    if let Some(amount) = text.strip_prefix('£') {
        let value = amount
            .trim()
            .replace(',', "")
            .parse::<f64>()
            .map_err(|_| format!("invalid amount '{raw}'"))?;
        return Ok(ContributionValue::Amount(value));
    }
    text.parse::<f64>()
        .map(ContributionValue::from_magnitude)
        .map_err(|_| format!("invalid contribution '{raw}'; use 0.05, 5%, or £3000"))
}

fn parse_ni_category(raw: &str) -> Result<NiCategory, String> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "A" => Ok(NiCategory::A),
        "B" => Ok(NiCategory::B),
        "C" => Ok(NiCategory::C),
        "J" => Ok(NiCategory::J),
        other => Err(format!("unknown NI category '{other}'")),
    }
}

/// A contribution as written in JSON: a bare number, a `"5%"`/`"£3000"`
/// string, or a tagged `{"rate": ..}` / `{"amount": ..}` object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ContributionInput {
    Number(f64),
    Text(String),
    Tagged(ContributionValue),
}

impl ContributionInput {
    fn resolve(self) -> Result<ContributionValue, String> {
        match self {
            ContributionInput::Number(value) => Ok(ContributionValue::from_magnitude(value)),
            ContributionInput::Text(text) => parse_contribution(&text),
            ContributionInput::Tagged(value) => Ok(value),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ProjectionPayload {
    current_age: Option<u32>,
    retirement_age: Option<u32>,
    salary: Option<f64>,
    scotland: Option<bool>,
    tax_year: Option<u16>,
    ni_category: Option<String>,
    use_qualifying_earnings: Option<bool>,

    lisa_rate: Option<ContributionInput>,
    isa_rate: Option<ContributionInput>,
    sipp_employee_rate: Option<ContributionInput>,
    sipp_employer_rate: Option<ContributionInput>,
    workplace_employee_rate: Option<ContributionInput>,
    workplace_employer_rate: Option<ContributionInput>,
    shift_lisa_to_isa: Option<f64>,
    shift_lisa_to_sipp: Option<f64>,

    roi_lisa: Option<f64>,
    roi_isa: Option<f64>,
    roi_sipp: Option<f64>,
    roi_workplace: Option<f64>,
    inflation: Option<f64>,

    lisa_start: Option<f64>,
    isa_start: Option<f64>,
    sipp_start: Option<f64>,
    workplace_start: Option<f64>,

    drawdown_withdrawal: Option<f64>,
    drawdown_end_age: Option<u32>,
    postret_roi_lisa: Option<f64>,
    postret_roi_isa: Option<f64>,
    postret_roi_pension: Option<f64>,
    lisa_withdrawal_share: Option<f64>,
    isa_withdrawal_share: Option<f64>,
    taxfree_withdrawal_share: Option<f64>,
    taxable_withdrawal_share: Option<f64>,
    lisa_access_age: Option<u32>,
    isa_access_age: Option<u32>,
    pension_access_age: Option<u32>,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "planwise",
    about = "UK retirement projection across LISA, ISA, SIPP and workplace pension"
)]
pub struct Cli {
    #[arg(long, default_value_t = 30)]
    pub current_age: u32,
    #[arg(long, default_value_t = 67)]
    pub retirement_age: u32,
    #[arg(long, default_value_t = 40_000.0, help = "Gross annual salary in £")]
    pub salary: f64,
    #[arg(long, help = "Use Scottish income tax bands")]
    pub scotland: bool,
    #[arg(long, help = "Tax year for band lookup; defaults to the latest loaded year")]
    pub tax_year: Option<u16>,
    #[arg(long, default_value = "A", value_parser = parse_ni_category)]
    pub ni_category: NiCategory,
    #[arg(long, help = "Base workplace contributions on qualifying earnings")]
    pub use_qualifying_earnings: bool,

    #[arg(long, default_value = "0.05", value_parser = parse_contribution)]
    pub lisa_rate: ContributionValue,
    #[arg(long, default_value = "0.05", value_parser = parse_contribution)]
    pub isa_rate: ContributionValue,
    #[arg(long, default_value = "0.05", value_parser = parse_contribution)]
    pub sipp_employee_rate: ContributionValue,
    #[arg(long, default_value = "0", value_parser = parse_contribution)]
    pub sipp_employer_rate: ContributionValue,
    #[arg(long, default_value = "0.05", value_parser = parse_contribution)]
    pub workplace_employee_rate: ContributionValue,
    #[arg(long, default_value = "0.03", value_parser = parse_contribution)]
    pub workplace_employer_rate: ContributionValue,
    #[arg(long, default_value_t = 0.5, help = "Share of LISA redirected to ISA from 50")]
    pub shift_lisa_to_isa: f64,
    #[arg(long, default_value_t = 0.5, help = "Share of LISA redirected to SIPP from 50")]
    pub shift_lisa_to_sipp: f64,

    #[arg(long, default_value_t = 0.05)]
    pub roi_lisa: f64,
    #[arg(long, default_value_t = 0.05)]
    pub roi_isa: f64,
    #[arg(long, default_value_t = 0.05)]
    pub roi_sipp: f64,
    #[arg(long, default_value_t = 0.05)]
    pub roi_workplace: f64,
    #[arg(long, default_value_t = 0.02)]
    pub inflation: f64,

    #[arg(long, default_value_t = 0.0)]
    pub lisa_start: f64,
    #[arg(long, default_value_t = 0.0)]
    pub isa_start: f64,
    #[arg(long, default_value_t = 0.0)]
    pub sipp_start: f64,
    #[arg(long, default_value_t = 0.0)]
    pub workplace_start: f64,

    #[arg(long, help = "Annual retirement withdrawal in today's money; enables drawdown")]
    pub drawdown_withdrawal: Option<f64>,
    #[arg(long, default_value_t = 100)]
    pub drawdown_end_age: u32,
    #[arg(long, default_value_t = 0.05)]
    pub postret_roi_lisa: f64,
    #[arg(long, default_value_t = 0.05)]
    pub postret_roi_isa: f64,
    #[arg(long, default_value_t = 0.05)]
    pub postret_roi_pension: f64,
    #[arg(long, default_value_t = 0.25)]
    pub lisa_withdrawal_share: f64,
    #[arg(long, default_value_t = 0.25)]
    pub isa_withdrawal_share: f64,
    #[arg(long, default_value_t = 0.25)]
    pub taxfree_withdrawal_share: f64,
    #[arg(long, default_value_t = 0.25)]
    pub taxable_withdrawal_share: f64,
    #[arg(long, default_value_t = 60)]
    pub lisa_access_age: u32,
    #[arg(long, default_value_t = 0)]
    pub isa_access_age: u32,
    #[arg(long, default_value_t = 57)]
    pub pension_access_age: u32,

    #[arg(long, help = "Load parameters from a JSON config file")]
    pub config: Option<PathBuf>,
    #[arg(long, help = "Replace the built-in tax tables with a JSON file")]
    pub tables: Option<PathBuf>,
    #[arg(long, help = "Write projection rows to a CSV file")]
    pub output: Option<PathBuf>,
    #[arg(long, help = "Write drawdown rows to a CSV file")]
    pub drawdown_output: Option<PathBuf>,
    #[arg(long, help = "Print summary statistics")]
    pub summary: bool,
}

#[derive(Debug, Clone)]
pub struct ProjectionRequest {
    pub inputs: ProjectionInputs,
    pub drawdown: Option<DrawdownSettings>,
}

fn build_request(cli: &Cli, registry: &TaxRegistry) -> Result<ProjectionRequest, String> {
    if cli.retirement_age <= cli.current_age {
        return Err("--retirement-age must be > --current-age".to_string());
    }
    if !cli.salary.is_finite() || cli.salary < 0.0 {
        return Err("--salary must be >= 0".to_string());
    }
    for (flag, value) in [
        ("--lisa-rate", cli.lisa_rate),
        ("--isa-rate", cli.isa_rate),
        ("--sipp-employee-rate", cli.sipp_employee_rate),
        ("--sipp-employer-rate", cli.sipp_employer_rate),
        ("--workplace-employee-rate", cli.workplace_employee_rate),
        ("--workplace-employer-rate", cli.workplace_employer_rate),
    ] {
        value.validate(flag).map_err(|e| e.to_string())?;
    }
    for (flag, shift) in [
        ("--shift-lisa-to-isa", cli.shift_lisa_to_isa),
        ("--shift-lisa-to-sipp", cli.shift_lisa_to_sipp),
    ] {
        if !(0.0..=1.0).contains(&shift) {
            return Err(format!("{flag} must be between 0 and 1"));
        }
    }
    if cli.shift_lisa_to_isa + cli.shift_lisa_to_sipp > 1.0 + 1e-9 {
        return Err("--shift-lisa-to-isa plus --shift-lisa-to-sipp must be <= 1".to_string());
    }
    for (flag, rate) in [
        ("--roi-lisa", cli.roi_lisa),
        ("--roi-isa", cli.roi_isa),
        ("--roi-sipp", cli.roi_sipp),
        ("--roi-workplace", cli.roi_workplace),
        ("--inflation", cli.inflation),
    ] {
        if !rate.is_finite() || rate <= -1.0 || rate > 1.0 {
            return Err(format!("{flag} must be > -1 and <= 1"));
        }
    }
    for (flag, balance) in [
        ("--lisa-start", cli.lisa_start),
        ("--isa-start", cli.isa_start),
        ("--sipp-start", cli.sipp_start),
        ("--workplace-start", cli.workplace_start),
    ] {
        if !balance.is_finite() || balance < 0.0 {
            return Err(format!("{flag} must be >= 0"));
        }
    }

    let tax_year = cli.tax_year.unwrap_or_else(|| registry.latest_year());
    if registry.limits(tax_year).is_err() {
        let years: Vec<String> = registry.years().map(|y| y.to_string()).collect();
        return Err(format!(
            "--tax-year {tax_year} is not loaded; available: {}",
            years.join(", ")
        ));
    }

    let inputs = ProjectionInputs {
        user: UserProfile {
            current_age: cli.current_age,
            retirement_age: cli.retirement_age,
            salary: cli.salary,
            region: Region::from_scotland_flag(cli.scotland),
        },
        contributions: ContributionRates {
            lisa: cli.lisa_rate,
            isa: cli.isa_rate,
            sipp_employee: cli.sipp_employee_rate,
            sipp_employer: cli.sipp_employer_rate,
            workplace_employee: cli.workplace_employee_rate,
            workplace_employer: cli.workplace_employer_rate,
            shift_lisa_to_isa: cli.shift_lisa_to_isa,
            shift_lisa_to_sipp: cli.shift_lisa_to_sipp,
        },
        returns: InvestmentReturns {
            lisa: cli.roi_lisa,
            isa: cli.roi_isa,
            sipp: cli.roi_sipp,
            workplace: cli.roi_workplace,
        },
        initial_balances: AccountBalances {
            lisa: cli.lisa_start,
            isa: cli.isa_start,
            sipp: cli.sipp_start,
            workplace: cli.workplace_start,
        },
        inflation: cli.inflation,
        use_qualifying_earnings: cli.use_qualifying_earnings,
        tax_year,
        ni_category: cli.ni_category,
    };

    let drawdown = match cli.drawdown_withdrawal {
        None => None,
        Some(withdrawal) => {
            if !withdrawal.is_finite() || withdrawal < 0.0 {
                return Err("--drawdown-withdrawal must be >= 0".to_string());
            }
            if cli.drawdown_end_age <= cli.retirement_age {
                return Err("--drawdown-end-age must be > --retirement-age".to_string());
            }
            Some(drawdown_settings(cli, withdrawal))
        }
    };

    Ok(ProjectionRequest { inputs, drawdown })
}

fn drawdown_settings(cli: &Cli, withdrawal: f64) -> DrawdownSettings {
    DrawdownSettings {
        annual_withdrawal_today: withdrawal,
        end_age: cli.drawdown_end_age,
        lisa_return: cli.postret_roi_lisa,
        isa_return: cli.postret_roi_isa,
        pension_return: cli.postret_roi_pension,
        lisa: WithdrawalPlan {
            share: cli.lisa_withdrawal_share,
            access_age: cli.lisa_access_age,
        },
        isa: WithdrawalPlan {
            share: cli.isa_withdrawal_share,
            access_age: cli.isa_access_age,
        },
        tax_free_pension: WithdrawalPlan {
            share: cli.taxfree_withdrawal_share,
            access_age: cli.pension_access_age,
        },
        taxable_pension: WithdrawalPlan {
            share: cli.taxable_withdrawal_share,
            access_age: cli.pension_access_age,
        },
    }
}

fn default_cli_for_api() -> Cli {
    Cli {
        current_age: 30,
        retirement_age: 67,
        salary: 40_000.0,
        scotland: false,
        tax_year: None,
        ni_category: NiCategory::A,
        use_qualifying_earnings: false,
        lisa_rate: ContributionValue::Rate(0.05),
        isa_rate: ContributionValue::Rate(0.05),
        sipp_employee_rate: ContributionValue::Rate(0.05),
        sipp_employer_rate: ContributionValue::Rate(0.0),
        workplace_employee_rate: ContributionValue::Rate(0.05),
        workplace_employer_rate: ContributionValue::Rate(0.03),
        shift_lisa_to_isa: 0.5,
        shift_lisa_to_sipp: 0.5,
        roi_lisa: 0.05,
        roi_isa: 0.05,
        roi_sipp: 0.05,
        roi_workplace: 0.05,
        inflation: 0.02,
        lisa_start: 0.0,
        isa_start: 0.0,
        sipp_start: 0.0,
        workplace_start: 0.0,
        drawdown_withdrawal: None,
        drawdown_end_age: 100,
        postret_roi_lisa: 0.05,
        postret_roi_isa: 0.05,
        postret_roi_pension: 0.05,
        lisa_withdrawal_share: 0.25,
        isa_withdrawal_share: 0.25,
        taxfree_withdrawal_share: 0.25,
        taxable_withdrawal_share: 0.25,
        lisa_access_age: 60,
        isa_access_age: 0,
        pension_access_age: 57,
        config: None,
        tables: None,
        output: None,
        drawdown_output: None,
        summary: false,
    }
}

fn apply_payload(cli: &mut Cli, payload: ProjectionPayload) -> Result<(), String> {
    if let Some(v) = payload.current_age {
        cli.current_age = v;
    }
    if let Some(v) = payload.retirement_age {
        cli.retirement_age = v;
    }
    if let Some(v) = payload.salary {
        cli.salary = v;
    }
    if let Some(v) = payload.scotland {
        cli.scotland = v;
    }
    if let Some(v) = payload.tax_year {
        cli.tax_year = Some(v);
    }
    if let Some(v) = payload.ni_category {
        cli.ni_category = parse_ni_category(&v).map_err(|e| format!("niCategory: {e}"))?;
    }
    if let Some(v) = payload.use_qualifying_earnings {
        cli.use_qualifying_earnings = v;
    }

    for (key, input, slot) in [
        ("lisaRate", payload.lisa_rate, &mut cli.lisa_rate),
        ("isaRate", payload.isa_rate, &mut cli.isa_rate),
        ("sippEmployeeRate", payload.sipp_employee_rate, &mut cli.sipp_employee_rate),
        ("sippEmployerRate", payload.sipp_employer_rate, &mut cli.sipp_employer_rate),
        (
            "workplaceEmployeeRate",
            payload.workplace_employee_rate,
            &mut cli.workplace_employee_rate,
        ),
        (
            "workplaceEmployerRate",
            payload.workplace_employer_rate,
            &mut cli.workplace_employer_rate,
        ),
    ] {
        if let Some(input) = input {
            *slot = input.resolve().map_err(|e| format!("{key}: {e}"))?;
        }
    }
    if let Some(v) = payload.shift_lisa_to_isa {
        cli.shift_lisa_to_isa = v;
    }
    if let Some(v) = payload.shift_lisa_to_sipp {
        cli.shift_lisa_to_sipp = v;
    }

    if let Some(v) = payload.roi_lisa {
        cli.roi_lisa = v;
    }
    if let Some(v) = payload.roi_isa {
        cli.roi_isa = v;
    }
    if let Some(v) = payload.roi_sipp {
        cli.roi_sipp = v;
    }
    if let Some(v) = payload.roi_workplace {
        cli.roi_workplace = v;
    }
    if let Some(v) = payload.inflation {
        cli.inflation = v;
    }

    if let Some(v) = payload.lisa_start {
        cli.lisa_start = v;
    }
    if let Some(v) = payload.isa_start {
        cli.isa_start = v;
    }
    if let Some(v) = payload.sipp_start {
        cli.sipp_start = v;
    }
    if let Some(v) = payload.workplace_start {
        cli.workplace_start = v;
    }

    if let Some(v) = payload.drawdown_withdrawal {
        cli.drawdown_withdrawal = Some(v);
    }
    if let Some(v) = payload.drawdown_end_age {
        cli.drawdown_end_age = v;
    }
    if let Some(v) = payload.postret_roi_lisa {
        cli.postret_roi_lisa = v;
    }
    if let Some(v) = payload.postret_roi_isa {
        cli.postret_roi_isa = v;
    }
    if let Some(v) = payload.postret_roi_pension {
        cli.postret_roi_pension = v;
    }
    if let Some(v) = payload.lisa_withdrawal_share {
        cli.lisa_withdrawal_share = v;
    }
    if let Some(v) = payload.isa_withdrawal_share {
        cli.isa_withdrawal_share = v;
    }
    if let Some(v) = payload.taxfree_withdrawal_share {
        cli.taxfree_withdrawal_share = v;
    }
    if let Some(v) = payload.taxable_withdrawal_share {
        cli.taxable_withdrawal_share = v;
    }
    if let Some(v) = payload.lisa_access_age {
        cli.lisa_access_age = v;
    }
    if let Some(v) = payload.isa_access_age {
        cli.isa_access_age = v;
    }
    if let Some(v) = payload.pension_access_age {
        cli.pension_access_age = v;
    }
    Ok(())
}

fn request_from_payload(
    payload: ProjectionPayload,
    registry: &TaxRegistry,
) -> Result<ProjectionRequest, String> {
    let mut cli = default_cli_for_api();
    apply_payload(&mut cli, payload)?;
    build_request(&cli, registry)
}

#[cfg(test)]
fn request_from_json(json: &str, registry: &TaxRegistry) -> Result<ProjectionRequest, String> {
    let payload = serde_json::from_str::<ProjectionPayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    request_from_payload(payload, registry)
}

/// Loads the built-in tables, or the JSON file at `path` when given.
pub fn load_registry(path: Option<&Path>) -> Result<TaxRegistry, ApiError> {
    match path {
        None => Ok(TaxRegistry::builtin()?),
        Some(path) => {
            let json = fs::read_to_string(path)?;
            let registry = TaxRegistry::from_json(&json)?;
            info!(
                path = %path.display(),
                latest_year = registry.latest_year(),
                "loaded tax tables"
            );
            Ok(registry)
        }
    }
}

fn load_config(cli: &mut Cli, path: &Path) -> Result<(), ApiError> {
    let json = fs::read_to_string(path)?;
    let payload = serde_json::from_str::<ProjectionPayload>(&json)?;
    apply_payload(cli, payload).map_err(ApiError::Invalid)?;
    debug!(path = %path.display(), "applied config file");
    Ok(())
}

/// Runs one projection from command line arguments and writes the requested
/// tables, summary and CSV files.
pub fn run_cli(mut cli: Cli) -> Result<(), ApiError> {
    let registry = load_registry(cli.tables.as_deref())?;
    if let Some(path) = cli.config.clone() {
        load_config(&mut cli, &path)?;
    }
    let request = build_request(&cli, &registry).map_err(ApiError::Invalid)?;
    let rows = project_retirement(&registry, &request.inputs)?;
    let summary = summarize(&rows, &request.inputs.initial_balances);
    if let Some(summary) = &summary {
        debug!(
            final_age = summary.final_age,
            final_total = summary.final_total,
            "projection complete"
        );
    }

    if let Some(path) = &cli.output {
        write_csv_file(path, &rows)?;
        println!("Results saved to {}", path.display());
    }
    if cli.summary {
        if let Some(summary) = &summary {
            print!("{}", format_summary(summary));
        }
    }
    if cli.output.is_none() && !cli.summary {
        print!("{}", format_projection_table(&rows));
    }

    if let Some(settings) = &request.drawdown {
        let limits = registry.limits(request.inputs.tax_year)?;
        let at_retirement = rows
            .last()
            .map(|row| row.balances())
            .unwrap_or(request.inputs.initial_balances);
        let drawdown =
            project_drawdown(&registry, limits, &request.inputs, &at_retirement, settings)?;
        match &cli.drawdown_output {
            Some(path) => {
                write_csv_file(path, &drawdown)?;
                println!("Drawdown saved to {}", path.display());
            }
            None => print!("{}", format_drawdown_table(&drawdown)),
        }
    }
    Ok(())
}
