use std::fmt::Write as _;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use super::ApiError;
use crate::core::{DrawdownRow, ProjectionSummary, YearRow};

/// Writes one header row then one record per item.
pub fn write_csv<W: Write, T: Serialize>(writer: W, rows: &[T]) -> Result<(), csv::Error> {
    let mut wtr = csv::Writer::from_writer(writer);
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_csv_file<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), ApiError> {
    let file = File::create(path)?;
    write_csv(file, rows)?;
    Ok(())
}

fn gbp(value: f64) -> String {
    let rounded = value.round();
    let digits = format!("{:.0}", rounded.abs());
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if rounded < 0.0 {
        format!("-£{grouped}")
    } else {
        format!("£{grouped}")
    }
}

pub fn format_projection_table(rows: &[YearRow]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>4} {:>11} {:>11} {:>9} {:>9} {:>9} {:>9} {:>11} {:>11} {:>11} {:>11} {:>12}",
        "Age",
        "Salary",
        "Take-home",
        "LISA",
        "ISA",
        "SIPP",
        "Workplace",
        "Pot LISA",
        "Pot ISA",
        "Pot SIPP",
        "Pot Work",
        "Pot Total"
    );
    for r in rows {
        let _ = writeln!(
            out,
            "{:>4} {:>11} {:>11} {:>9} {:>9} {:>9} {:>9} {:>11} {:>11} {:>11} {:>11} {:>12}",
            r.age,
            gbp(r.salary),
            gbp(r.take_home_salary),
            gbp(r.lisa_net + r.lisa_bonus),
            gbp(r.isa_net),
            gbp(r.sipp_employee_gross + r.sipp_employer),
            gbp(r.workplace_employee_gross + r.workplace_employer),
            gbp(r.pot_lisa),
            gbp(r.pot_isa),
            gbp(r.pot_sipp),
            gbp(r.pot_workplace),
            gbp(r.pot_total),
        );
    }
    out
}

pub fn format_summary(summary: &ProjectionSummary) -> String {
    let rule = "=".repeat(50);
    let mut out = String::new();
    let _ = writeln!(out, "\n{rule}\nRETIREMENT PROJECTION SUMMARY\n{rule}");
    let _ = writeln!(out, "Final age: {}", summary.final_age);
    let _ = writeln!(out, "Final salary: {}\n", gbp(summary.final_salary));
    let _ = writeln!(out, "Final pot values:");
    let _ = writeln!(out, "  LISA:      {}", gbp(summary.final_pots.lisa));
    let _ = writeln!(out, "  ISA:       {}", gbp(summary.final_pots.isa));
    let _ = writeln!(out, "  SIPP:      {}", gbp(summary.final_pots.sipp));
    let _ = writeln!(out, "  Workplace: {}", gbp(summary.final_pots.workplace));
    let _ = writeln!(out, "  TOTAL:     {}\n", gbp(summary.final_total));
    let _ = writeln!(
        out,
        "Total net contributions: {}",
        gbp(summary.total_net_contributions)
    );
    let _ = writeln!(out, "Total growth: {}", gbp(summary.total_growth));
    let _ = writeln!(out, "Growth multiple: {:.1}x", summary.growth_multiple);
    out
}

pub fn format_drawdown_table(rows: &[DrawdownRow]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>4} {:>10} {:>10} {:>9} {:>9} {:>10} {:>10} {:>9} {:>9} {:>12} {:>12}",
        "Age",
        "Target",
        "State pen",
        "LISA",
        "ISA",
        "Tax-free",
        "Taxable",
        "Tax",
        "Shortfall",
        "Balance",
        "Today's £"
    );
    for r in rows {
        let _ = writeln!(
            out,
            "{:>4} {:>10} {:>10} {:>9} {:>9} {:>10} {:>10} {:>9} {:>9} {:>12} {:>12}",
            r.age,
            gbp(r.target_withdrawal),
            gbp(r.state_pension),
            gbp(r.lisa_withdrawal),
            gbp(r.isa_withdrawal),
            gbp(r.tax_free_pension_withdrawal),
            gbp(r.taxable_pension_gross),
            gbp(r.income_tax),
            gbp(r.shortfall),
            gbp(r.total_balance),
            gbp(r.total_balance_today),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        AccountBalances, ContributionRates, InvestmentReturns, NiCategory, ProjectionInputs,
        Region, TaxRegistry, UserProfile, project_retirement, summarize,
    };

    fn sample_rows() -> Vec<YearRow> {
        let registry = TaxRegistry::builtin().expect("tables");
        let inputs = ProjectionInputs {
            user: UserProfile {
                current_age: 30,
                retirement_age: 33,
                salary: 40_000.0,
                region: Region::RestOfUk,
            },
            contributions: ContributionRates::default(),
            returns: InvestmentReturns::default(),
            initial_balances: AccountBalances::default(),
            inflation: 0.0,
            use_qualifying_earnings: false,
            tax_year: 2025,
            ni_category: NiCategory::A,
        };
        project_retirement(&registry, &inputs).expect("projection")
    }

    #[test]
    fn gbp_groups_thousands() {
        assert_eq!(gbp(0.0), "£0");
        assert_eq!(gbp(999.4), "£999");
        assert_eq!(gbp(1_234_567.0), "£1,234,567");
        assert_eq!(gbp(-20_000.0), "-£20,000");
    }

    #[test]
    fn csv_has_camel_case_header_and_one_record_per_row() {
        let rows = sample_rows();
        let mut buf = Vec::new();
        write_csv(&mut buf, &rows).expect("csv");
        let text = String::from_utf8(buf).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), rows.len() + 1);
        assert!(lines[0].starts_with("age,salary,takeHomeSalary,incomeTax,niDue"));
        assert!(lines[1].starts_with("30,40000"));
    }

    #[test]
    fn projection_table_prints_a_line_per_row() {
        let rows = sample_rows();
        let table = format_projection_table(&rows);
        assert_eq!(table.lines().count(), rows.len() + 1);
        assert!(table.contains("£40,000"));
    }

    #[test]
    fn summary_mentions_growth_multiple() {
        let rows = sample_rows();
        let summary = summarize(&rows, &AccountBalances::default()).expect("summary");
        let text = format_summary(&summary);
        assert!(text.contains("RETIREMENT PROJECTION SUMMARY"));
        assert!(text.contains("Final age: 32"));
        assert!(text.contains("Growth multiple: 0.0x"));
    }
}
