//! Runtime-checkable invariants over the kernel tables
//!
//! Used by tests and by hosts that want a consistency audit after a run.
//!
//! # Invariants
//!
//! 1. **Refcount accuracy**: every object and promise refcount equals the
//!    count recomputed from c-lists, the run-queue, promise queues,
//!    settlement data and pins
//! 2. **Reachable within recognizable**: no object is reachable by more
//!    holders than can recognize it
//! 3. **C-list symmetry**: both directions of every c-list entry agree
//! 4. **Live owners and deciders**: owners and deciders are vats that
//!    have not been terminated

use std::collections::BTreeMap;

use crate::error::KeeperError;
use crate::keeper::KernelKeeper;
use crate::types::{KernelSlot, ObjectRefCount, PromiseState};

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all kernel invariants.
///
/// Returns a list of violations (empty if all invariants hold). Errors
/// only when the tables cannot be read at all.
pub fn check_all_invariants(keeper: &KernelKeeper) -> Result<Vec<InvariantViolation>, KeeperError> {
    let mut violations = Vec::new();
    let expected = recompute_refcounts(keeper, &mut violations)?;
    violations.extend(check_refcount_accuracy(keeper, &expected)?);
    violations.extend(check_owners_and_deciders(keeper)?);
    Ok(violations)
}

#[derive(Default)]
struct Expected {
    objects: BTreeMap<KernelSlot, ObjectRefCount>,
    promises: BTreeMap<KernelSlot, u64>,
}

impl Expected {
    fn reachable(&mut self, kref: KernelSlot) {
        match kref {
            KernelSlot::Object(_) => {
                let rc = self.objects.entry(kref).or_default();
                rc.reachable += 1;
                rc.recognizable += 1;
            }
            KernelSlot::Promise(_) => *self.promises.entry(kref).or_default() += 1,
            KernelSlot::Device(_) => {}
        }
    }
}

fn recompute_refcounts(
    keeper: &KernelKeeper,
    violations: &mut Vec<InvariantViolation>,
) -> Result<Expected, KeeperError> {
    let mut expected = Expected::default();

    for vat_id in keeper.vat_ids()? {
        for entry in keeper.clist_entries(vat_id)? {
            // invariant 3
            if keeper.vat_to_kernel_existing(vat_id, entry.vref)? != Some(entry.kref) {
                violations.push(InvariantViolation {
                    invariant: "clist_symmetry",
                    description: format!(
                        "{vat_id}: {} maps to {} but not back",
                        entry.kref, entry.vref
                    ),
                });
            }
            match entry.kref {
                KernelSlot::Object(_) if entry.vref.is_object_import() => {
                    let rc = expected.objects.entry(entry.kref).or_default();
                    rc.recognizable += 1;
                    if entry.reachable {
                        rc.reachable += 1;
                    }
                }
                KernelSlot::Promise(_) => *expected.promises.entry(entry.kref).or_default() += 1,
                _ => {}
            }
        }
    }

    for event in keeper.run_queue_events()? {
        for kref in event.held_refs() {
            expected.reachable(kref);
        }
    }

    for kpid in keeper.kernel_promises()? {
        match keeper.get_kernel_promise(kpid)?.state {
            PromiseState::Unresolved { queue, .. } => {
                for msg in &queue {
                    for slot in msg.slots() {
                        expected.reachable(*slot);
                    }
                }
            }
            PromiseState::Fulfilled(data) | PromiseState::Rejected(data) => {
                for slot in &data.slots {
                    expected.reachable(*slot);
                }
            }
        }
    }

    for (kref, count) in keeper.pinned()? {
        for _ in 0..count {
            expected.reachable(kref);
        }
    }
    Ok(expected)
}

/// Invariants 1 and 2
fn check_refcount_accuracy(
    keeper: &KernelKeeper,
    expected: &Expected,
) -> Result<Vec<InvariantViolation>, KeeperError> {
    let mut violations = Vec::new();

    for ko in keeper.kernel_objects()? {
        let actual = keeper.object_ref_count(ko)?;
        let want = expected.objects.get(&ko).copied().unwrap_or_default();
        if actual != want {
            violations.push(InvariantViolation {
                invariant: "refcount_accuracy",
                description: format!("{ko} has refcount {actual}, holders account for {want}"),
            });
        }
        if actual.reachable > actual.recognizable {
            violations.push(InvariantViolation {
                invariant: "reachable_within_recognizable",
                description: format!("{ko} has refcount {actual}"),
            });
        }
    }
    for ko in expected.objects.keys() {
        if !keeper.kernel_object_exists(*ko)? {
            violations.push(InvariantViolation {
                invariant: "refcount_accuracy",
                description: format!("{ko} is referenced but no longer exists"),
            });
        }
    }

    for kp in keeper.kernel_promises()? {
        let actual = keeper.get_kernel_promise(kp)?.ref_count;
        let want = expected.promises.get(&kp).copied().unwrap_or(0);
        if actual != want {
            violations.push(InvariantViolation {
                invariant: "refcount_accuracy",
                description: format!("{kp} has refcount {actual}, holders account for {want}"),
            });
        }
    }
    for kp in expected.promises.keys() {
        if !keeper.has_kernel_promise(*kp)? {
            violations.push(InvariantViolation {
                invariant: "refcount_accuracy",
                description: format!("{kp} is referenced but no longer exists"),
            });
        }
    }
    Ok(violations)
}

/// Invariant 4
fn check_owners_and_deciders(keeper: &KernelKeeper) -> Result<Vec<InvariantViolation>, KeeperError> {
    let mut violations = Vec::new();
    for ko in keeper.kernel_objects()? {
        if let Some(owner) = keeper.owner_of_kernel_object(ko)? {
            if !keeper.is_vat_alive(owner)? {
                violations.push(InvariantViolation {
                    invariant: "live_owners",
                    description: format!("{ko} is owned by dead vat {owner}"),
                });
            }
        }
    }
    for kp in keeper.kernel_promises()? {
        if let Some(decider) = keeper.decider(kp)? {
            if !keeper.is_vat_alive(decider)? {
                violations.push(InvariantViolation {
                    invariant: "live_deciders",
                    description: format!("{kp} is decided by dead vat {decider}"),
                });
            }
        }
    }
    Ok(violations)
}
