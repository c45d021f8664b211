//! Per-block compute metering
//!
//! A [`ComputronCounter`] converts what each crank cost into beans and
//! stops the kernel once the block's budget is spent. Failed cranks are
//! charged a fixed penalty so that a vat cannot run for free by failing.

use swing_kernel::RunPolicy;

use crate::config::{ChainParams, BLOCK_COMPUTE_LIMIT, VAT_CREATION, XSNAP_COMPUTRON};

/// Computrons charged for a crank that failed.
pub const FAILED_CRANK_COMPUTRONS: u64 = 1_000_000;

/// Run policy that spends a block's bean budget.
#[derive(Clone, Debug)]
pub struct ComputronCounter {
    limit: u64,
    vat_creation: u64,
    per_computron: u64,
    total_beans: u64,
    never_stop: bool,
}

impl ComputronCounter {
    /// Budget from `params`. With `never_stop` the counter still counts
    /// but never asks the kernel to stop (bootstrap).
    pub fn new(params: &ChainParams, never_stop: bool) -> Self {
        Self {
            limit: params.beans(BLOCK_COMPUTE_LIMIT),
            vat_creation: params.beans(VAT_CREATION),
            per_computron: params.beans(XSNAP_COMPUTRON),
            total_beans: 0,
            never_stop,
        }
    }

    /// Beans spent so far.
    pub fn total_beans(&self) -> u64 {
        self.total_beans
    }

    /// Whether the budget still allows work.
    pub fn should_run(&self) -> bool {
        self.never_stop || self.total_beans < self.limit
    }

    fn charge(&mut self, beans: u64) -> bool {
        self.total_beans = self.total_beans.saturating_add(beans);
        self.should_run()
    }

    fn computron_beans(&self, computrons: u64) -> u64 {
        computrons.saturating_mul(self.per_computron)
    }
}

impl RunPolicy for ComputronCounter {
    fn vat_created(&mut self, _computrons: Option<u64>) -> bool {
        self.charge(self.vat_creation)
    }

    fn crank_complete(&mut self, computrons: Option<u64>) -> bool {
        let beans = self.computron_beans(computrons.unwrap_or(0));
        self.charge(beans)
    }

    fn crank_failed(&mut self) -> bool {
        let beans = self.computron_beans(FAILED_CRANK_COMPUTRONS);
        self.charge(beans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swing_kernel::PolicyInput;

    fn params(limit: u64) -> ChainParams {
        ChainParams::default()
            .with_beans(BLOCK_COMPUTE_LIMIT, limit)
            .with_beans(VAT_CREATION, 50)
            .with_beans(XSNAP_COMPUTRON, 10)
    }

    #[test]
    fn test_cranks_charged_by_computron() {
        let mut counter = ComputronCounter::new(&params(1_000), false);
        assert!(counter.consult(PolicyInput::Crank { computrons: Some(30) }));
        assert_eq!(counter.total_beans(), 300);
        assert!(counter.consult(PolicyInput::Crank { computrons: None }));
        assert_eq!(counter.total_beans(), 300);
        assert!(counter.consult(PolicyInput::CreateVat { computrons: Some(999) }));
        assert_eq!(counter.total_beans(), 350);
        assert!(!counter.consult(PolicyInput::Crank { computrons: Some(65) }));
        assert!(!counter.should_run());
    }

    #[test]
    fn test_failed_crank_is_punitive() {
        let mut counter = ComputronCounter::new(&params(u64::MAX), false);
        assert!(counter.consult(PolicyInput::CrankFailed));
        assert_eq!(counter.total_beans(), FAILED_CRANK_COMPUTRONS * 10);
    }

    #[test]
    fn test_never_stop_keeps_counting() {
        let mut counter = ComputronCounter::new(&params(1), true);
        assert!(counter.consult(PolicyInput::Crank { computrons: Some(100) }));
        assert!(counter.should_run());
        assert_eq!(counter.total_beans(), 1_000);
    }

    #[test]
    fn test_charges_saturate() {
        let mut counter = ComputronCounter::new(&params(u64::MAX), false);
        counter.consult(PolicyInput::Crank { computrons: Some(u64::MAX) });
        counter.consult(PolicyInput::CrankFailed);
        assert_eq!(counter.total_beans(), u64::MAX);
        assert!(!counter.should_run());
    }
}
