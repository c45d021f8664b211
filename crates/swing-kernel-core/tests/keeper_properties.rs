//! Property tests for the kernel tables

use proptest::prelude::*;
use swing_kernel_core::{check_all_invariants, KernelKeeper, RunQueueEvent, VatOptions};
use swing_store::{BundleId, SwingStore};
use swing_vat::{CapData, Message, VatId, VatSlot};

fn fresh_keeper() -> KernelKeeper {
    let mut keeper = KernelKeeper::new(SwingStore::in_memory());
    keeper.create_kernel_state().unwrap();
    keeper
}

/// A step against one importer's view of one exported object.
#[derive(Clone, Debug)]
enum Op {
    Import,
    Drop,
    Forget,
    Enqueue,
    Consume,
    Pin,
    Unpin,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Import),
        Just(Op::Drop),
        Just(Op::Forget),
        Just(Op::Enqueue),
        Just(Op::Consume),
        Just(Op::Pin),
        Just(Op::Unpin),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn run_queue_preserves_enqueue_order(methods in prop::collection::vec("[a-z]{1,8}", 1..40)) {
        let mut keeper = fresh_keeper();
        let ko = keeper.add_kernel_object(VatId(1)).unwrap();
        for method in &methods {
            keeper
                .enqueue(&RunQueueEvent::Send {
                    target: ko,
                    msg: Message::new(method.as_str(), CapData::new("[]", vec![]), None),
                })
                .unwrap();
        }
        let mut seen = Vec::new();
        while let Some(event) = keeper.pop_run_queue().unwrap() {
            if let RunQueueEvent::Send { msg, .. } = &event {
                seen.push(msg.method.clone());
            }
            keeper.release_event_refs(&event).unwrap();
        }
        prop_assert_eq!(seen, methods);
        prop_assert_eq!(keeper.object_ref_count(ko).unwrap().reachable, 0);
    }

    #[test]
    fn refcounts_track_holders(ops in prop::collection::vec(op(), 1..60)) {
        let mut keeper = fresh_keeper();
        let bundle = BundleId::for_bytes(b"b");
        let a = keeper.create_vat_state(&VatOptions::named("a"), &bundle).unwrap();
        let b = keeper.create_vat_state(&VatOptions::named("b"), &bundle).unwrap();
        let ko = keeper.map_vat_slot_to_kernel_slot(a, VatSlot::export(1), true).unwrap();

        for op in ops {
            match op {
                Op::Import => {
                    keeper.map_kernel_slot_to_vat_slot(b, ko, true).unwrap();
                }
                Op::Drop => keeper.clear_reachable_flag(b, ko).unwrap(),
                Op::Forget => {
                    if keeper.get_reachable_flag(b, ko).unwrap() == Some(false) {
                        keeper.delete_clist_entry(b, ko).unwrap();
                    }
                }
                Op::Enqueue => keeper
                    .enqueue(&RunQueueEvent::Send {
                        target: ko,
                        msg: Message::new("m", CapData::new("[]", vec![]), None),
                    })
                    .unwrap(),
                Op::Consume => {
                    if let Some(event) = keeper.pop_run_queue().unwrap() {
                        keeper.release_event_refs(&event).unwrap();
                    }
                }
                Op::Pin => keeper.pin(ko).unwrap(),
                Op::Unpin => keeper.unpin(ko).unwrap(),
            }
            let rc = keeper.object_ref_count(ko).unwrap();
            prop_assert!(rc.reachable <= rc.recognizable);
            let violations = check_all_invariants(&keeper).unwrap();
            prop_assert!(violations.is_empty(), "{:?}", violations);
        }
    }
}
