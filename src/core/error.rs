use thiserror::Error;

/// Failures raised while validating or running a projection.
///
/// None of these are recoverable mid-run: a projection either completes for
/// every simulated year or returns the first error it hits.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProjectionError {
    #[error("invalid income: {0}")]
    InvalidIncome(String),

    #[error("invalid rate: {0}")]
    InvalidRate(String),

    #[error("invalid age: {0}")]
    InvalidAge(String),

    #[error("invalid balance: {0}")]
    InvalidBalance(String),

    #[error("no tax tables for tax year {0}")]
    UnknownTaxYear(u16),

    #[error("no NI bands for category {category} in tax year {year}")]
    UnknownNiCategory { category: String, year: u16 },

    #[error("invalid tax tables: {0}")]
    InvalidTables(String),

    #[error("invalid goal: {0}")]
    InvalidGoal(String),
}

pub type Result<T> = std::result::Result<T, ProjectionError>;
