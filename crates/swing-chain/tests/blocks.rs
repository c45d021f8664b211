//! Block cycle scenarios against a real kernel

use serde_json::{json, Value};
use swing_chain::{
    BlockAction, BlockError, BlockInfo, BlockManager, ChainConfig, ChainParams, ChainSend,
    InboundAction, BLOCK_COMPUTE_LIMIT, BRIDGE_DEVICE, TIMER_DEVICE, XSNAP_COMPUTRON,
};
use swing_kernel::{Kernel, KernelConfig, NamedBundles, StaticVatConfig};
use swing_store::{MemoryBackend, SwingStore};
use swing_vat::{
    slot_marker, CapData, DeliveryResult, LocalBundle, LocalWorkerFactory, SyscallHandler, SyscallValue,
    VatDelivery, VatSlot, VatSyscall, VatSyscallResult, VatWorker,
};

/// Counts inbound actions and acknowledges each one to the chain. An
/// action with `sleepUntil` schedules a wakeup instead, reported to the
/// chain as `woke`.
#[derive(Default)]
struct Bank {
    bridge: Option<VatSlot>,
    timer: Option<VatSlot>,
}

impl Bank {
    fn tell_chain(&self, sys: &mut dyn SyscallHandler, destination: &str, body: Value) -> bool {
        let Some(bridge) = self.bridge else {
            return false;
        };
        let sent = sys.syscall(&VatSyscall::CallNow {
            target: bridge,
            method: "send".into(),
            args: CapData::plain(&json!([destination, body])),
        });
        !sent.is_error()
    }
}

impl VatWorker for Bank {
    fn deliver(&mut self, d: &VatDelivery, sys: &mut dyn SyscallHandler) -> DeliveryResult {
        match d {
            VatDelivery::StartVat { vat_parameters } => {
                self.bridge = vat_parameters.slots.first().copied();
                self.timer = vat_parameters.slots.get(1).copied();
                DeliveryResult::ok()
            }
            VatDelivery::Message { msg, .. } if msg.method == "inbound" => {
                let args = msg.args.body_json().unwrap_or(Value::Null);
                if let Some(when) = args[1]["sleepUntil"].as_u64() {
                    let Some(timer) = self.timer else {
                        return DeliveryResult::error("no timer");
                    };
                    let set = sys.syscall(&VatSyscall::CallNow {
                        target: timer,
                        method: "setWakeup".into(),
                        args: CapData::from_json(&json!([when, slot_marker(0)]), vec![VatSlot::export(1)]),
                    });
                    if set.is_error() {
                        return DeliveryResult::error("timer refused");
                    }
                    return DeliveryResult::ok();
                }
                let count = match sys.syscall(&VatSyscall::VatstoreGet { key: "count".into() }) {
                    VatSyscallResult::Ok(SyscallValue::Text(Some(n))) => n.parse::<u64>().unwrap_or(0),
                    _ => 0,
                };
                sys.syscall(&VatSyscall::VatstoreSet {
                    key: "count".into(),
                    value: (count + 1).to_string(),
                });
                if !self.tell_chain(sys, "ack", args[1].clone()) {
                    return DeliveryResult::error("bridge refused");
                }
                if args[1]["fail"].as_bool() == Some(true) {
                    return DeliveryResult::error("failed after acknowledging");
                }
                DeliveryResult::ok_metered(10)
            }
            VatDelivery::Message { msg, .. } if msg.method == "wake" => {
                let args = msg.args.body_json().unwrap_or(Value::Null);
                if !self.tell_chain(sys, "woke", args[0].clone()) {
                    return DeliveryResult::error("bridge refused");
                }
                DeliveryResult::ok()
            }
            _ => DeliveryResult::ok(),
        }
    }
}

fn kernel_config() -> KernelConfig {
    let mut bank = StaticVatConfig::new("bank");
    bank.devices = vec![BRIDGE_DEVICE.to_string(), TIMER_DEVICE.to_string()];
    let mut config = KernelConfig::default();
    config.vats.insert("bank".to_string(), bank);
    config
}

fn bundles() -> NamedBundles {
    let mut bundles = NamedBundles::new();
    bundles.insert("bank".to_string(), LocalBundle::new("bank").to_bytes());
    bundles
}

fn chain_config() -> ChainConfig {
    ChainConfig::default().route("bank", "bank")
}

fn open(store: SwingStore) -> BlockManager<LocalWorkerFactory> {
    let mut factory = LocalWorkerFactory::new();
    factory.register("bank", Bank::default);
    let kernel = Kernel::new(store, factory, kernel_config());
    BlockManager::new(kernel, chain_config()).unwrap()
}

fn bootstrapped(store: SwingStore) -> BlockManager<LocalWorkerFactory> {
    let mut manager = open(store);
    let sends = manager.bootstrap_block(0, &bundles()).unwrap();
    assert!(sends.is_empty());
    manager
}

fn deposit(n: u64) -> InboundAction {
    InboundAction::new("bank", json!({ "n": n }))
}

fn sleep_until(when: u64) -> InboundAction {
    InboundAction::new("bank", json!({ "sleepUntil": when }))
}

fn woke(when: u64) -> ChainSend {
    ChainSend {
        destination: "woke".to_string(),
        body: json!(when),
    }
}

fn ack(n: u64) -> ChainSend {
    ChainSend {
        destination: "ack".to_string(),
        body: json!({ "n": n }),
    }
}

fn execute(
    manager: &mut BlockManager<LocalWorkerFactory>,
    block: &BlockInfo,
    actions: Vec<InboundAction>,
) -> Vec<ChainSend> {
    manager.begin_block(block).unwrap();
    for action in actions {
        manager.queue_inbound(action).unwrap();
    }
    manager.end_block(block).unwrap()
}

fn run_block(
    manager: &mut BlockManager<LocalWorkerFactory>,
    height: u64,
    actions: Vec<InboundAction>,
) -> Vec<ChainSend> {
    let block = BlockInfo::new(height, height * 5);
    let sends = execute(manager, &block, actions);
    manager.commit_block(&block).unwrap();
    sends
}

fn processed(manager: &BlockManager<LocalWorkerFactory>) -> u64 {
    let kernel = manager.kernel();
    let bank = kernel.vat_id("bank").unwrap();
    kernel
        .keeper()
        .vatstore_get(bank, "count")
        .unwrap()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

#[test]
fn test_block_cycle_collects_sends() {
    let mut manager = bootstrapped(SwingStore::in_memory());
    let sends = run_block(&mut manager, 1, vec![deposit(1), deposit(2)]);
    assert_eq!(sends, vec![ack(1), ack(2)]);
    assert_eq!(manager.computed_height(), 1);
    assert_eq!(manager.kernel().store().get("host.height").unwrap().as_deref(), Some("1"));
    assert!(manager.leftover_actions().unwrap().is_empty());
    assert_eq!(processed(&manager), 2);
}

#[test]
fn test_end_block_at_computed_height_replays() {
    let mut manager = bootstrapped(SwingStore::in_memory());
    let first = run_block(&mut manager, 1, vec![deposit(1)]);
    let cranks = manager.kernel().crank_number().unwrap();

    let block = BlockInfo::new(1, 5);
    let again = execute(&mut manager, &block, vec![deposit(1)]);
    assert_eq!(again, first);
    assert_eq!(manager.kernel().crank_number().unwrap(), cranks);
    assert!(manager.pending_actions().is_empty());
    manager.commit_block(&block).unwrap();
    assert_eq!(processed(&manager), 1);
}

#[test]
fn test_crash_between_end_and_commit_rederives_sends() {
    let backend = MemoryBackend::new();
    let before_crash = {
        let mut manager = bootstrapped(SwingStore::open(backend.clone()));
        run_block(&mut manager, 1, vec![deposit(1)]);
        execute(&mut manager, &BlockInfo::new(2, 10), vec![deposit(2), deposit(3)])
    };

    let mut manager = open(SwingStore::open(backend));
    assert_eq!(manager.computed_height(), 1);
    let after_restart = run_block(&mut manager, 2, vec![deposit(2), deposit(3)]);
    assert_eq!(after_restart, before_crash);
    assert_eq!(processed(&manager), 3);
}

#[test]
fn test_restart_after_commit_replays_recorded_sends() {
    let backend = MemoryBackend::new();
    let committed = {
        let mut manager = bootstrapped(SwingStore::open(backend.clone()));
        run_block(&mut manager, 1, vec![deposit(1)])
    };

    let mut manager = open(SwingStore::open(backend));
    let replayed = run_block(&mut manager, 1, vec![deposit(1)]);
    assert_eq!(replayed, committed);
    assert_eq!(processed(&manager), 1);

    let next = run_block(&mut manager, 2, vec![deposit(2)]);
    assert_eq!(next, vec![ack(2)]);
}

#[test]
fn test_height_gap_decoheres_for_good() {
    let mut manager = bootstrapped(SwingStore::in_memory());
    run_block(&mut manager, 1, vec![]);

    let err = manager.begin_block(&BlockInfo::new(3, 15)).unwrap_err();
    assert!(matches!(err, BlockError::Decoherence(_)));
    assert!(manager.decoherence().is_some());

    let err = manager.begin_block(&BlockInfo::new(2, 10)).unwrap_err();
    assert!(matches!(err, BlockError::Decoherence(_)));
    assert!(matches!(
        manager.queue_inbound(deposit(1)),
        Err(BlockError::Decoherence(_))
    ));
}

#[test]
fn test_second_begin_of_same_block_decoheres() {
    let mut manager = bootstrapped(SwingStore::in_memory());
    run_block(&mut manager, 1, vec![]);
    let block = BlockInfo::new(2, 10);
    manager.begin_block(&block).unwrap();
    assert!(matches!(
        manager.begin_block(&block),
        Err(BlockError::Decoherence(_))
    ));
}

#[test]
fn test_commit_of_uncomputed_block_decoheres() {
    let mut manager = bootstrapped(SwingStore::in_memory());
    run_block(&mut manager, 1, vec![]);
    let block = BlockInfo::new(2, 10);
    manager.begin_block(&block).unwrap();
    assert!(matches!(
        manager.commit_block(&block),
        Err(BlockError::Decoherence(_))
    ));
}

#[test]
fn test_compute_limit_defers_inbound_actions() {
    let mut manager = bootstrapped(SwingStore::in_memory());
    let params = ChainParams::default()
        .with_beans(BLOCK_COMPUTE_LIMIT, 15)
        .with_beans(XSNAP_COMPUTRON, 1);

    let block = BlockInfo::new(1, 5).with_params(params.clone());
    let sends = execute(&mut manager, &block, vec![deposit(1), deposit(2), deposit(3)]);
    manager.commit_block(&block).unwrap();
    assert_eq!(sends, vec![ack(1), ack(2)]);
    assert_eq!(manager.leftover_actions().unwrap(), vec![deposit(3)]);

    let block = BlockInfo::new(2, 10).with_params(params);
    let sends = execute(&mut manager, &block, vec![]);
    manager.commit_block(&block).unwrap();
    assert_eq!(sends, vec![ack(3)]);
    assert!(manager.leftover_actions().unwrap().is_empty());
    assert_eq!(processed(&manager), 3);
}

#[test]
fn test_unrouted_inbound_is_refused() {
    let mut manager = bootstrapped(SwingStore::in_memory());
    let err = manager
        .queue_inbound(InboundAction::new("wallet", json!({})))
        .unwrap_err();
    assert!(matches!(err, BlockError::Unrouted(kind) if kind == "wallet"));
    assert!(manager.decoherence().is_none());
}

#[test]
fn test_bootstrap_runs_once() {
    let mut manager = bootstrapped(SwingStore::in_memory());
    assert!(matches!(
        manager.bootstrap_block(0, &bundles()),
        Err(BlockError::Bootstrap(_))
    ));
    run_block(&mut manager, 1, vec![]);
    assert!(matches!(
        manager.bootstrap_block(0, &bundles()),
        Err(BlockError::Bootstrap(_))
    ));
}

#[test]
fn test_json_action_stream() {
    let mut manager = bootstrapped(SwingStore::in_memory());
    let stream = json!([
        { "type": "BEGIN_BLOCK", "blockHeight": 4, "blockTime": 20 },
        { "type": "INBOUND", "kind": "bank", "body": { "n": 9 } },
        { "type": "END_BLOCK", "blockHeight": 4, "blockTime": 20 },
        { "type": "COMMIT_BLOCK", "blockHeight": 4, "blockTime": 20 }
    ]);
    let actions: Vec<BlockAction> = serde_json::from_value(stream).unwrap();
    let mut sends = Vec::new();
    for action in actions {
        sends.extend(manager.handle(action).unwrap());
    }
    assert_eq!(sends, vec![ack(9)]);
    assert_eq!(manager.computed_height(), 4);
}

#[test]
fn test_wakeup_fires_in_first_block_at_its_time() {
    let mut manager = bootstrapped(SwingStore::in_memory());
    assert_eq!(run_block(&mut manager, 1, vec![sleep_until(12)]), vec![]);
    assert_eq!(manager.timer().pending(), 1);
    assert_eq!(manager.kernel().keeper().pinned().unwrap().len(), 1);

    // block 2 is at time 10, block 3 at time 15
    assert_eq!(run_block(&mut manager, 2, vec![]), vec![]);
    assert_eq!(manager.timer().last_polled(), 10);
    assert_eq!(run_block(&mut manager, 3, vec![]), vec![woke(12)]);
    assert_eq!(run_block(&mut manager, 4, vec![]), vec![]);

    assert_eq!(manager.timer().pending(), 0);
    assert!(manager.kernel().keeper().pinned().unwrap().is_empty());
    assert!(manager.kernel().check_invariants().unwrap().is_empty());
}

#[test]
fn test_wakeups_survive_restart() {
    let backend = MemoryBackend::new();
    {
        let mut manager = bootstrapped(SwingStore::open(backend.clone()));
        run_block(&mut manager, 1, vec![sleep_until(8)]);
    }
    let mut manager = open(SwingStore::open(backend));
    assert_eq!(manager.timer().pending(), 1);
    assert_eq!(manager.timer().last_polled(), 5);
    assert_eq!(run_block(&mut manager, 2, vec![]), vec![woke(8)]);
}

#[test]
fn test_priority_actions_run_before_earlier_normal_ones() {
    let mut manager = bootstrapped(SwingStore::in_memory());
    let sends = run_block(
        &mut manager,
        1,
        vec![deposit(1), InboundAction::priority("bank", json!({ "n": 2 }))],
    );
    assert_eq!(sends, vec![ack(2), ack(1)]);
}

#[test]
fn test_forced_actions_ignore_the_compute_limit() {
    let mut manager = bootstrapped(SwingStore::in_memory());
    let params = ChainParams::default()
        .with_beans(BLOCK_COMPUTE_LIMIT, 5)
        .with_beans(XSNAP_COMPUTRON, 1);

    let block = BlockInfo::new(1, 5).with_params(params.clone());
    let forced = |n: u64| InboundAction::forced("bank", json!({ "n": n }));
    let sends = execute(&mut manager, &block, vec![forced(1), deposit(3), forced(2)]);
    manager.commit_block(&block).unwrap();
    assert_eq!(sends, vec![ack(1), ack(2)]);
    assert_eq!(manager.leftover_actions().unwrap(), vec![deposit(3)]);

    // without forced work the limit applies again
    let block = BlockInfo::new(2, 10).with_params(params);
    let sends = execute(&mut manager, &block, vec![deposit(4)]);
    manager.commit_block(&block).unwrap();
    assert_eq!(sends, vec![ack(3)]);
    assert_eq!(manager.leftover_actions().unwrap(), vec![deposit(4)]);
}

#[test]
fn test_replayed_sends_confirmed_by_the_chain() {
    let mut manager = bootstrapped(SwingStore::in_memory());
    let committed = run_block(&mut manager, 1, vec![deposit(1)]);
    let block = BlockInfo::new(1, 5);

    let replayed = execute(&mut manager, &block, vec![]);
    assert_eq!(replayed, committed);
    manager.confirm_replay(1, &replayed).unwrap();
    assert!(manager.decoherence().is_none());
}

#[test]
fn test_replay_acknowledged_differently_decoheres() {
    let mut manager = bootstrapped(SwingStore::in_memory());
    run_block(&mut manager, 1, vec![deposit(1)]);
    let block = BlockInfo::new(1, 5);

    execute(&mut manager, &block, vec![]);
    assert!(matches!(
        manager.confirm_replay(1, &[ack(7)]),
        Err(BlockError::Decoherence(_))
    ));
    assert!(manager.decoherence().is_some());

    let mut manager = bootstrapped(SwingStore::in_memory());
    run_block(&mut manager, 1, vec![deposit(1)]);
    execute(&mut manager, &block, vec![]);
    assert!(matches!(
        manager.confirm_replay(1, &[]),
        Err(BlockError::Decoherence(reason)) if reason.contains("acknowledged 0")
    ));
}

#[test]
fn test_recorded_sends_checked_against_their_hash() {
    let backend = MemoryBackend::new();
    {
        let mut manager = bootstrapped(SwingStore::open(backend.clone()));
        run_block(&mut manager, 1, vec![deposit(1)]);
    }
    let mut manager = open(SwingStore::open(backend));
    manager
        .kernel_mut()
        .store_mut()
        .host_set("host.chainSends", &serde_json::to_string(&vec![ack(9)]).unwrap())
        .unwrap();
    let block = BlockInfo::new(1, 5);
    manager.begin_block(&block).unwrap();
    assert!(matches!(
        manager.end_block(&block),
        Err(BlockError::Decoherence(_))
    ));
}

#[test]
fn test_sends_from_an_aborted_crank_stay_in_the_block() {
    let mut manager = bootstrapped(SwingStore::in_memory());
    let bank = manager.kernel().vat_id("bank").unwrap();
    let doomed = InboundAction::new("bank", json!({ "n": 1, "fail": true }));
    let sends = run_block(&mut manager, 1, vec![doomed]);
    assert_eq!(
        sends,
        vec![ChainSend {
            destination: "ack".to_string(),
            body: json!({ "n": 1, "fail": true }),
        }]
    );
    assert!(!manager.kernel().keeper().is_vat_alive(bank).unwrap());
}
