//! Tax, National Insurance and allowance tables.
//!
//! The registry is built once from a JSON document (the built-in one is
//! compiled into the binary), validated, and then only read. Projections
//! borrow it through the [`TaxResolver`] and [`NiResolver`] traits so tests
//! can substitute their own tables.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::error::{ProjectionError, Result};
use super::types::{IncomeBreakdown, NiCategory, Region};

const BUILTIN_TABLES_JSON: &str = include_str!("../../data/tables.json");

/// One progressive band. `upper == None` marks the unbounded top band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub lower: f64,
    pub upper: Option<f64>,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxTable {
    pub personal_allowance: f64,
    pub bands: Vec<Band>,
}

impl TaxTable {
    pub fn tax_due(&self, income: f64) -> f64 {
        progressive_charge(income, &self.bands)
    }

    fn top_rate(&self) -> f64 {
        self.bands.iter().map(|b| b.rate).fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnnualLimits {
    pub isa_allowance: f64,
    pub lisa_allowance: f64,
    pub lisa_max_contribution_age: u32,
    pub lisa_bonus_rate: f64,
    pub pension_annual_allowance: f64,
    pub basic_rate_relief: f64,
    pub qualifying_earnings_lower: f64,
    pub qualifying_earnings_upper: f64,
    pub lump_sum_allowance: f64,
    pub state_pension_age: u32,
    pub state_pension_per_year: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearTables {
    pub tax: HashMap<Region, TaxTable>,
    pub ni: HashMap<NiCategory, Vec<Band>>,
    pub limits: AnnualLimits,
}

#[derive(Debug, Deserialize)]
struct RegistryDocument {
    years: BTreeMap<u16, YearTables>,
}

pub trait TaxResolver {
    fn tax_table(&self, region: Region, tax_year: u16) -> Result<&TaxTable>;

    fn income_tax(&self, income: f64, region: Region, tax_year: u16) -> Result<f64> {
        Ok(self.tax_table(region, tax_year)?.tax_due(income))
    }
}

pub trait NiResolver {
    fn ni_bands(&self, tax_year: u16, category: NiCategory) -> Result<&[Band]>;

    fn ni_due(&self, income: f64, tax_year: u16, category: NiCategory) -> Result<f64> {
        Ok(progressive_charge(income, self.ni_bands(tax_year, category)?))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaxRegistry {
    years: BTreeMap<u16, YearTables>,
}

impl TaxRegistry {
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_TABLES_JSON)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let doc = serde_json::from_str::<RegistryDocument>(json)
            .map_err(|e| ProjectionError::InvalidTables(format!("malformed tables JSON: {e}")))?;
        Self::from_years(doc.years)
    }

    pub fn from_years(years: BTreeMap<u16, YearTables>) -> Result<Self> {
        if years.is_empty() {
            return Err(ProjectionError::InvalidTables(
                "at least one tax year is required".to_string(),
            ));
        }
        for (year, tables) in &years {
            for (region, table) in &tables.tax {
                validate_bands(&table.bands, &format!("{year} {region:?} income tax"))?;
                if !table.personal_allowance.is_finite() || table.personal_allowance < 0.0 {
                    return Err(ProjectionError::InvalidTables(format!(
                        "{year} {region:?} personal allowance must be >= 0"
                    )));
                }
            }
            for (category, bands) in &tables.ni {
                validate_bands(bands, &format!("{year} NI category {}", category.letter()))?;
            }
            validate_limits(*year, &tables.limits)?;
        }
        Ok(Self { years })
    }

    pub fn years(&self) -> impl Iterator<Item = u16> + '_ {
        self.years.keys().copied()
    }

    pub fn latest_year(&self) -> u16 {
        // from_years rejects an empty map
        self.years.keys().next_back().copied().unwrap_or_default()
    }

    pub fn year_tables(&self, tax_year: u16) -> Result<&YearTables> {
        self.years
            .get(&tax_year)
            .ok_or(ProjectionError::UnknownTaxYear(tax_year))
    }

    pub fn limits(&self, tax_year: u16) -> Result<&AnnualLimits> {
        Ok(&self.year_tables(tax_year)?.limits)
    }
}

impl TaxResolver for TaxRegistry {
    fn tax_table(&self, region: Region, tax_year: u16) -> Result<&TaxTable> {
        self.year_tables(tax_year)?.tax.get(&region).ok_or_else(|| {
            ProjectionError::InvalidTables(format!("{tax_year} has no {region:?} income tax bands"))
        })
    }
}

impl NiResolver for TaxRegistry {
    fn ni_bands(&self, tax_year: u16, category: NiCategory) -> Result<&[Band]> {
        self.year_tables(tax_year)?
            .ni
            .get(&category)
            .map(Vec::as_slice)
            .ok_or_else(|| ProjectionError::UnknownNiCategory {
                category: category.letter().to_string(),
                year: tax_year,
            })
    }
}

/// Gross salary minus income tax and employee NI.
pub fn income_breakdown<R: TaxResolver + NiResolver>(
    resolver: &R,
    salary: f64,
    region: Region,
    tax_year: u16,
    category: NiCategory,
) -> Result<IncomeBreakdown> {
    if !salary.is_finite() || salary < 0.0 {
        return Err(ProjectionError::InvalidIncome(format!(
            "salary must be >= 0, got {salary}"
        )));
    }
    let income_tax = resolver.income_tax(salary, region, tax_year)?;
    let ni_due = resolver.ni_due(salary, tax_year, category)?;
    Ok(IncomeBreakdown {
        salary,
        take_home_salary: salary - income_tax - ni_due,
        income_tax,
        ni_due,
    })
}

/// Gross amount that nets `target_net` after the income tax it adds on top
/// of `other_income`.
pub fn gross_for_net<R: TaxResolver>(
    resolver: &R,
    target_net: f64,
    other_income: f64,
    region: Region,
    tax_year: u16,
) -> Result<f64> {
    if target_net <= 0.0 {
        return Ok(0.0);
    }
    let table = resolver.tax_table(region, tax_year)?;
    let other = other_income.max(0.0);
    let base_tax = table.tax_due(other);
    let net_of = |gross: f64| gross - (table.tax_due(other + gross) - base_tax);

    let mut lo = target_net;
    let mut hi = target_net / (1.0 - table.top_rate()).max(1e-6) + 1.0;
    for _ in 0..100 {
        let mid = (lo + hi) * 0.5;
        if net_of(mid) < target_net {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1e-7 {
            break;
        }
    }
    Ok(hi)
}

fn progressive_charge(income: f64, bands: &[Band]) -> f64 {
    if income <= 0.0 {
        return 0.0;
    }
    bands
        .iter()
        .map(|band| {
            let top = band.upper.map_or(income, |upper| income.min(upper));
            (top - band.lower).max(0.0) * band.rate
        })
        .sum()
}

fn validate_bands(bands: &[Band], label: &str) -> Result<()> {
    let invalid = |msg: &str| ProjectionError::InvalidTables(format!("{label}: {msg}"));

    let Some(first) = bands.first() else {
        return Err(invalid("at least one band is required"));
    };
    if first.lower != 0.0 {
        return Err(invalid("first band must start at 0"));
    }

    let mut expected_lower = 0.0;
    for (idx, band) in bands.iter().enumerate() {
        if !(0.0..=1.0).contains(&band.rate) {
            return Err(invalid("band rates must be between 0 and 1"));
        }
        if band.lower != expected_lower {
            return Err(invalid("bands must be contiguous and non-overlapping"));
        }
        let is_last = idx + 1 == bands.len();
        match band.upper {
            Some(upper) if upper > band.lower && upper.is_finite() => {
                if is_last {
                    return Err(invalid("the last band must be unbounded"));
                }
                expected_lower = upper;
            }
            Some(_) => return Err(invalid("band bounds must be strictly increasing")),
            None if !is_last => return Err(invalid("only the last band may be unbounded")),
            None => {}
        }
    }
    Ok(())
}

fn validate_limits(year: u16, limits: &AnnualLimits) -> Result<()> {
    for (name, value) in [
        ("isa_allowance", limits.isa_allowance),
        ("lisa_allowance", limits.lisa_allowance),
        ("pension_annual_allowance", limits.pension_annual_allowance),
        ("qualifying_earnings_lower", limits.qualifying_earnings_lower),
        ("qualifying_earnings_upper", limits.qualifying_earnings_upper),
        ("lump_sum_allowance", limits.lump_sum_allowance),
        ("state_pension_per_year", limits.state_pension_per_year),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(ProjectionError::InvalidTables(format!(
                "{year} {name} must be >= 0"
            )));
        }
    }
    for (name, rate) in [
        ("lisa_bonus_rate", limits.lisa_bonus_rate),
        ("basic_rate_relief", limits.basic_rate_relief),
    ] {
        if !(0.0..1.0).contains(&rate) {
            return Err(ProjectionError::InvalidTables(format!(
                "{year} {name} must be in [0, 1)"
            )));
        }
    }
    if limits.qualifying_earnings_upper < limits.qualifying_earnings_lower {
        return Err(ProjectionError::InvalidTables(format!(
            "{year} qualifying earnings upper limit is below the lower limit"
        )));
    }
    Ok(())
}
