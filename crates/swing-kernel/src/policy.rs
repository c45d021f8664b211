//! Run policies
//!
//! [`Kernel::run`](crate::Kernel::run) consults a policy after every crank
//! and stops when it says so. Policies see what each crank cost, so a
//! host can cap the compute spent per block.

/// What a crank did, as reported to the policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyInput {
    /// The queues were empty (or only held work that was skipped).
    None,
    /// A vat was created and started.
    CreateVat {
        /// Compute used by `startVat`, if metered.
        computrons: Option<u64>,
    },
    /// A delivery completed.
    Crank {
        /// Compute used, if metered.
        computrons: Option<u64>,
    },
    /// A delivery failed and was rolled back.
    CrankFailed,
}

/// Decides whether [`Kernel::run`](crate::Kernel::run) keeps going.
///
/// Each hook returns `true` to continue.
pub trait RunPolicy {
    /// A vat was created.
    fn vat_created(&mut self, computrons: Option<u64>) -> bool;

    /// A delivery completed.
    fn crank_complete(&mut self, computrons: Option<u64>) -> bool;

    /// A delivery failed.
    fn crank_failed(&mut self) -> bool;

    /// A step found nothing to do.
    fn empty_crank(&mut self) -> bool {
        true
    }

    /// Dispatch on a [`PolicyInput`].
    fn consult(&mut self, input: PolicyInput) -> bool {
        match input {
            PolicyInput::None => self.empty_crank(),
            PolicyInput::CreateVat { computrons } => self.vat_created(computrons),
            PolicyInput::Crank { computrons } => self.crank_complete(computrons),
            PolicyInput::CrankFailed => self.crank_failed(),
        }
    }
}

/// Run until the queues drain.
#[derive(Clone, Copy, Debug, Default)]
pub struct ForeverPolicy;

impl RunPolicy for ForeverPolicy {
    fn vat_created(&mut self, _computrons: Option<u64>) -> bool {
        true
    }

    fn crank_complete(&mut self, _computrons: Option<u64>) -> bool {
        true
    }

    fn crank_failed(&mut self) -> bool {
        true
    }
}

/// Run at most `limit` non-empty cranks.
#[derive(Clone, Copy, Debug)]
pub struct CrankLimitPolicy {
    remaining: u64,
}

impl CrankLimitPolicy {
    /// Allow `limit` cranks.
    pub fn new(limit: u64) -> Self {
        Self { remaining: limit }
    }

    fn tick(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining > 0
    }
}

impl RunPolicy for CrankLimitPolicy {
    fn vat_created(&mut self, _computrons: Option<u64>) -> bool {
        self.tick()
    }

    fn crank_complete(&mut self, _computrons: Option<u64>) -> bool {
        self.tick()
    }

    fn crank_failed(&mut self) -> bool {
        self.tick()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crank_limit_counts_every_kind() {
        let mut policy = CrankLimitPolicy::new(3);
        assert!(policy.consult(PolicyInput::Crank { computrons: None }));
        assert!(policy.consult(PolicyInput::None));
        assert!(policy.consult(PolicyInput::CrankFailed));
        assert!(!policy.consult(PolicyInput::CreateVat { computrons: Some(5) }));
    }

    #[test]
    fn test_forever_never_stops() {
        let mut policy = ForeverPolicy;
        for _ in 0..100 {
            assert!(policy.consult(PolicyInput::Crank { computrons: Some(1) }));
        }
    }
}
