use super::tables::AnnualLimits;

/// Per tax year consumption of the ISA, LISA and pension annual allowances.
///
/// `isa_used` counts ISA subscriptions plus raw LISA subscriptions.
/// `lisa_used` counts raw LISA subscriptions plus the government bonus.
/// `pension_used` counts gross employee and employer pension contributions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AllowanceTracker {
    limits: AnnualLimits,
    pub isa_used: f64,
    pub lisa_used: f64,
    pub pension_used: f64,
}

impl AllowanceTracker {
    pub fn new(limits: AnnualLimits) -> Self {
        Self {
            limits,
            isa_used: 0.0,
            lisa_used: 0.0,
            pension_used: 0.0,
        }
    }

    /// Nothing carries forward between tax years.
    pub fn reset(&mut self) {
        self.isa_used = 0.0;
        self.lisa_used = 0.0;
        self.pension_used = 0.0;
    }

    pub fn isa_remaining(&self) -> f64 {
        (self.limits.isa_allowance - self.isa_used).max(0.0)
    }

    pub fn lisa_remaining(&self) -> f64 {
        (self.limits.lisa_allowance - self.lisa_used).max(0.0)
    }

    pub fn pension_remaining(&self) -> f64 {
        (self.limits.pension_annual_allowance - self.pension_used).max(0.0)
    }

    /// Grants up to `requested` of raw LISA subscription and returns
    /// `(raw, bonus)`. Raw plus bonus stays within the LISA allowance and
    /// raw stays within the combined ISA allowance.
    pub fn grant_lisa(&mut self, requested: f64) -> (f64, f64) {
        let bonus_rate = self.limits.lisa_bonus_rate;
        let max_raw = self.lisa_remaining() / (1.0 + bonus_rate);
        let raw = requested.min(max_raw).min(self.isa_remaining()).max(0.0);
        let bonus = raw * bonus_rate;
        self.lisa_used += raw + bonus;
        self.isa_used += raw;
        (raw, bonus)
    }

    pub fn grant_isa(&mut self, requested: f64) -> f64 {
        let granted = requested.min(self.isa_remaining()).max(0.0);
        self.isa_used += granted;
        granted
    }

    /// `gross` includes basic-rate relief for employee contributions.
    pub fn grant_pension(&mut self, gross: f64) -> f64 {
        let granted = gross.min(self.pension_remaining()).max(0.0);
        self.pension_used += granted;
        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    fn limits() -> AnnualLimits {
        AnnualLimits {
            isa_allowance: 20_000.0,
            lisa_allowance: 4_000.0,
            lisa_max_contribution_age: 50,
            lisa_bonus_rate: 0.25,
            pension_annual_allowance: 60_000.0,
            basic_rate_relief: 0.20,
            qualifying_earnings_lower: 6_240.0,
            qualifying_earnings_upper: 50_270.0,
            lump_sum_allowance: 268_275.0,
            state_pension_age: 67,
            state_pension_per_year: 11_973.0,
        }
    }

    #[test]
    fn lisa_bonus_counts_against_lisa_allowance() {
        let mut tracker = AllowanceTracker::new(limits());
        let (raw, bonus) = tracker.grant_lisa(10_000.0);
        assert_approx(raw, 3_200.0);
        assert_approx(bonus, 800.0);
        assert_approx(tracker.lisa_used, 4_000.0);
        assert_approx(tracker.isa_used, 3_200.0);

        let (raw, bonus) = tracker.grant_lisa(100.0);
        assert_approx(raw, 0.0);
        assert_approx(bonus, 0.0);
    }

    #[test]
    fn isa_shares_the_allowance_with_lisa() {
        let mut tracker = AllowanceTracker::new(limits());
        tracker.grant_lisa(2_000.0);
        let granted = tracker.grant_isa(25_000.0);
        assert_approx(granted, 18_000.0);
        assert_approx(tracker.isa_remaining(), 0.0);
    }

    #[test]
    fn pension_grants_clip_at_the_annual_allowance() {
        let mut tracker = AllowanceTracker::new(limits());
        assert_approx(tracker.grant_pension(50_000.0), 50_000.0);
        assert_approx(tracker.grant_pension(15_000.0), 10_000.0);
        assert_approx(tracker.grant_pension(1.0), 0.0);
    }

    #[test]
    fn negative_requests_grant_nothing() {
        let mut tracker = AllowanceTracker::new(limits());
        assert_approx(tracker.grant_isa(-5.0), 0.0);
        assert_approx(tracker.grant_pension(-5.0), 0.0);
        assert_eq!(tracker.grant_lisa(-5.0), (0.0, 0.0));
        assert_approx(tracker.isa_used, 0.0);
    }

    #[test]
    fn reset_restores_every_allowance() {
        let mut tracker = AllowanceTracker::new(limits());
        tracker.grant_lisa(4_000.0);
        tracker.grant_isa(20_000.0);
        tracker.grant_pension(60_000.0);
        tracker.reset();
        assert_approx(tracker.isa_remaining(), 20_000.0);
        assert_approx(tracker.lisa_remaining(), 4_000.0);
        assert_approx(tracker.pension_remaining(), 60_000.0);
    }
}
