//! Block manager
//!
//! Drives the kernel from the chain's block cycle and keeps the kernel's
//! computed height in step with the chain's committed height.
//!
//! ```text
//!                 ┌──────────────── replay (height == computed) ─────────┐
//!                 │                                                      ▼
//!   BEGIN_BLOCK ──┴─▶ record begin ──▶ INBOUND* ──▶ END_BLOCK ──▶ chain sends
//!                                                      │
//!          leftover run-queue ─▶ forced queue (then stop)
//!                             └▶ priority queue ─▶ timer poll ─▶ inbound queue
//!                                                      │
//!                                                      ▼
//!                                   COMMIT_BLOCK: host.height, host.chainSends,
//!                                                 one store commit
//! ```
//!
//! Any other height is decoherence: the manager refuses every further
//! action.

use std::collections::VecDeque;

use serde::de::DeserializeOwned;
use serde_json::json;
use swing_kernel::{Kernel, KernelError, NamedBundles};
use swing_store::SwingStore;
use swing_vat::{CapData, WorkerFactory};
use tracing::{debug, error, info, warn};

use crate::action::{BlockAction, BlockInfo, InboundAction, InboundQueue};
use crate::bridge::{sends_hash, BridgeDevice, ChainSend, Outbox, BRIDGE_DEVICE};
use crate::computron::ComputronCounter;
use crate::config::{ChainConfig, ChainParams};
use crate::error::BlockError;
use crate::timer::{TimerDevice, TimerSchedule, TIMER_DEVICE};

/// Last height whose results were computed and committed.
pub const HEIGHT_KEY: &str = "host.height";
/// Height of the block that began executing.
pub const BEGIN_HEIGHT_KEY: &str = "host.beginHeight";
/// Chain sends of the committed block, for replay.
pub const CHAIN_SENDS_KEY: &str = "host.chainSends";
/// Hash of the committed chain sends.
pub const CHAIN_SENDS_HASH_KEY: &str = "host.chainSendsHash";
/// Normal inbound actions a block ran out of budget for.
pub const INBOUND_QUEUE_KEY: &str = "host.inboundQueue";
/// Priority inbound actions a block ran out of budget for.
pub const PRIORITY_QUEUE_KEY: &str = "host.priorityQueue";
/// Timer wakeups and the last polled time.
pub const TIMER_KEY: &str = "host.timer";
/// Set once the bootstrap block has run.
pub const BOOTSTRAPPED_KEY: &str = "host.bootstrapped";

/// Method handler vats receive inbound actions on.
const INBOUND_METHOD: &str = "inbound";
/// Method timer handlers receive wakeups on.
const WAKE_METHOD: &str = "wake";

/// Runs the kernel one block at a time.
pub struct BlockManager<F: WorkerFactory> {
    kernel: Kernel<F>,
    config: ChainConfig,
    outbox: Outbox,
    timer: TimerSchedule,
    computed_height: u64,
    begin_height: u64,
    block_params: Option<ChainParams>,
    pending: Vec<InboundAction>,
    last_sends: Option<(u64, Vec<ChainSend>)>,
    replayed: Option<(u64, Vec<ChainSend>)>,
    decohered: Option<String>,
}

impl<F: WorkerFactory> BlockManager<F> {
    /// Wrap a kernel, registering the bridge and timer devices on it. The
    /// kernel may be fresh or reopened over committed state.
    pub fn new(mut kernel: Kernel<F>, config: ChainConfig) -> Result<Self, BlockError> {
        config.validate()?;
        let outbox = Outbox::new();
        kernel.register_device(BRIDGE_DEVICE, Box::new(BridgeDevice::new(outbox.clone())));
        let timer = TimerSchedule::new();
        if let Some(saved) = kernel.store().get(TIMER_KEY)? {
            timer.restore(&saved)?;
        }
        kernel.register_device(TIMER_DEVICE, Box::new(TimerDevice::new(timer.clone())));

        let computed_height = read_host(kernel.store(), HEIGHT_KEY)?.unwrap_or(0);
        let begin_height = read_host(kernel.store(), BEGIN_HEIGHT_KEY)?.unwrap_or(computed_height);
        info!(computed_height, begin_height, wakeups = timer.pending(), "block manager ready");
        Ok(Self {
            kernel,
            config,
            outbox,
            timer,
            computed_height,
            begin_height,
            block_params: None,
            pending: Vec::new(),
            last_sends: None,
            replayed: None,
            decohered: None,
        })
    }

    // ========================================================================
    // Actions
    // ========================================================================

    /// Initialize the kernel and run bootstrap to completion. Runs once
    /// per chain, before the first block; committed with that block.
    pub fn bootstrap_block(&mut self, block_time: u64, bundles: &NamedBundles) -> Result<Vec<ChainSend>, BlockError> {
        self.check_coherent()?;
        if self.computed_height != 0 || self.begin_height != 0 {
            return Err(BlockError::Bootstrap(format!(
                "chain is already at height {}",
                self.computed_height
            )));
        }
        if self.kernel.store().has(BOOTSTRAPPED_KEY)? {
            return Err(BlockError::Bootstrap("bootstrap already ran".to_string()));
        }
        info!(block_time, "bootstrap block");

        self.kernel.initialize(bundles)?;
        self.poll_timer(block_time)?;
        let mut policy = ComputronCounter::new(&self.config.params, true);
        let cranks = self.kernel.run(&mut policy)?;
        self.save_timer()?;
        self.kernel.store_mut().host_set(BOOTSTRAPPED_KEY, "true")?;

        let sends = self.outbox.drain();
        info!(cranks, beans = policy.total_beans(), sends = sends.len(), "bootstrap finished");
        Ok(sends)
    }

    /// Record the block about to execute.
    pub fn begin_block(&mut self, block: &BlockInfo) -> Result<(), BlockError> {
        self.check_coherent()?;
        let height = block.block_height;
        self.block_params = Some(block.params.clone().unwrap_or_else(|| self.config.params.clone()));

        if self.needs_execution(height)? {
            if self.begin_height == height {
                return Err(self.decohere(format!("block {height} had already begun execution")));
            }
            self.begin_height = height;
            self.kernel
                .store_mut()
                .host_set(BEGIN_HEIGHT_KEY, &height.to_string())?;
            info!(height, block_time = block.block_time, "begin block");
        } else {
            info!(height, "begin block (replay)");
        }
        Ok(())
    }

    /// Queue an inbound action for the current block.
    pub fn queue_inbound(&mut self, action: InboundAction) -> Result<(), BlockError> {
        self.check_coherent()?;
        if self.config.handler(&action.kind).is_none() {
            return Err(BlockError::Unrouted(action.kind));
        }
        debug!(kind = %action.kind, queue = ?action.queue, "queued inbound action");
        self.pending.push(action);
        Ok(())
    }

    /// Execute the block, or replay its recorded sends if it was already
    /// computed.
    ///
    /// Execution order, each step followed by a kernel run, until the
    /// compute budget is spent:
    ///
    /// 1. leftover run-queue work
    /// 2. forced actions, if any, without a compute limit; nothing else
    ///    is taken this block
    /// 3. priority actions
    /// 4. a timer poll with the block time
    /// 5. normal actions
    ///
    /// Unprocessed priority and normal actions are kept for the next
    /// block.
    pub fn end_block(&mut self, block: &BlockInfo) -> Result<Vec<ChainSend>, BlockError> {
        self.check_coherent()?;
        let height = block.block_height;

        if !self.needs_execution(height)? {
            let dropped = std::mem::take(&mut self.pending);
            let sends = self.recorded_sends(height)?;
            info!(height, sends = sends.len(), dropped = dropped.len(), "end block (replay)");
            self.replayed = Some((height, sends.clone()));
            return Ok(sends);
        }
        if height != self.begin_height {
            return Err(self.decohere(format!(
                "trying to end block {height}, expected began block {}",
                self.begin_height
            )));
        }

        let params = self
            .block_params
            .clone()
            .unwrap_or_else(|| self.config.params.clone());
        let mut forced = VecDeque::new();
        let mut priority: VecDeque<InboundAction> = self.saved_queue(PRIORITY_QUEUE_KEY)?.into();
        let mut inbound: VecDeque<InboundAction> = self.saved_queue(INBOUND_QUEUE_KEY)?.into();
        let leftover = priority.len() + inbound.len();
        for action in std::mem::take(&mut self.pending) {
            match action.queue {
                InboundQueue::Forced => forced.push_back(action),
                InboundQueue::Priority => priority.push_back(action),
                InboundQueue::Inbound => inbound.push_back(action),
            }
        }

        let mut policy = ComputronCounter::new(&params, !forced.is_empty());
        let mut cranks = self.kernel.run(&mut policy)?;
        let mut processed = 0usize;
        let mut woken = 0usize;
        if policy.should_run() {
            if !forced.is_empty() {
                let (n, c) = self.process_queue(&mut forced, &mut policy)?;
                processed += n;
                cranks += c;
            } else {
                let (n, c) = self.process_queue(&mut priority, &mut policy)?;
                processed += n;
                cranks += c;
                if policy.should_run() {
                    woken = self.poll_timer(block.block_time)?;
                    cranks += self.kernel.run(&mut policy)?;
                }
                if policy.should_run() {
                    let (n, c) = self.process_queue(&mut inbound, &mut policy)?;
                    processed += n;
                    cranks += c;
                }
            }
        }
        self.save_queue(PRIORITY_QUEUE_KEY, priority.make_contiguous())?;
        self.save_queue(INBOUND_QUEUE_KEY, inbound.make_contiguous())?;
        self.save_timer()?;

        let sends = self.outbox.drain();
        self.computed_height = height;
        self.last_sends = Some((height, sends.clone()));
        info!(
            height,
            cranks,
            beans = policy.total_beans(),
            leftover,
            processed,
            woken,
            deferred = priority.len() + inbound.len(),
            sends = sends.len(),
            "end block"
        );
        Ok(sends)
    }

    /// Check what the chain acknowledged when the sends of a replayed
    /// `END_BLOCK` were issued again. Any difference in count or content
    /// is decoherence.
    pub fn confirm_replay(&mut self, height: u64, acknowledged: &[ChainSend]) -> Result<(), BlockError> {
        self.check_coherent()?;
        let Some((replayed_height, replayed)) = self.replayed.take() else {
            return Err(self.decohere(format!("no replayed block to confirm at height {height}")));
        };
        if replayed_height != height {
            return Err(self.decohere(format!(
                "confirming replay of block {height}, but block {replayed_height} was replayed"
            )));
        }
        if replayed.len() != acknowledged.len() {
            return Err(self.decohere(format!(
                "block {height} replayed {} chain sends, chain acknowledged {}",
                replayed.len(),
                acknowledged.len()
            )));
        }
        if sends_hash(&replayed)? != sends_hash(acknowledged)? {
            return Err(self.decohere(format!("block {height} replayed chain sends differ from the chain's")));
        }
        debug!(height, sends = replayed.len(), "replay confirmed");
        Ok(())
    }

    /// Persist the computed block in one store commit.
    pub fn commit_block(&mut self, block: &BlockInfo) -> Result<(), BlockError> {
        self.check_coherent()?;
        let height = block.block_height;
        if height != self.computed_height {
            return Err(self.decohere(format!(
                "committed height {height} does not match computed height {}",
                self.computed_height
            )));
        }
        let sends = self.recorded_sends(height)?;
        let hash = sends_hash(&sends)?;
        let store = self.kernel.store_mut();
        store.host_set(HEIGHT_KEY, &height.to_string())?;
        store.host_set(CHAIN_SENDS_KEY, &serde_json::to_string(&sends)?)?;
        store.host_set(CHAIN_SENDS_HASH_KEY, &hash)?;
        self.kernel.commit()?;
        self.block_params = None;
        info!(height, sends_hash = %hash, "commit block");
        Ok(())
    }

    /// Dispatch one action. Only `END_BLOCK` produces sends.
    pub fn handle(&mut self, action: BlockAction) -> Result<Vec<ChainSend>, BlockError> {
        debug!(action = action.kind(), "block action");
        match action {
            BlockAction::BeginBlock(block) => self.begin_block(&block).map(|()| Vec::new()),
            BlockAction::Inbound(inbound) => self.queue_inbound(inbound).map(|()| Vec::new()),
            BlockAction::EndBlock(block) => self.end_block(&block),
            BlockAction::CommitBlock(block) => self.commit_block(&block).map(|()| Vec::new()),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Height of the last computed block.
    pub fn computed_height(&self) -> u64 {
        self.computed_height
    }

    /// Height of the last block that began executing.
    pub fn begin_height(&self) -> u64 {
        self.begin_height
    }

    /// Inbound actions queued for the current block.
    pub fn pending_actions(&self) -> &[InboundAction] {
        &self.pending
    }

    /// Actions deferred to the next block, priority queue first.
    pub fn leftover_actions(&self) -> Result<Vec<InboundAction>, BlockError> {
        let mut actions = self.saved_queue(PRIORITY_QUEUE_KEY)?;
        actions.extend(self.saved_queue(INBOUND_QUEUE_KEY)?);
        Ok(actions)
    }

    /// The timer schedule the kernel's `timer` device writes to.
    pub fn timer(&self) -> &TimerSchedule {
        &self.timer
    }

    /// Why the manager stopped, if it has.
    pub fn decoherence(&self) -> Option<&str> {
        self.decohered.as_deref()
    }

    /// The kernel being driven.
    pub fn kernel(&self) -> &Kernel<F> {
        &self.kernel
    }

    /// The kernel being driven, for host operations between blocks.
    pub fn kernel_mut(&mut self) -> &mut Kernel<F> {
        &mut self.kernel
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// `true` to execute `height`, `false` to replay it.
    fn needs_execution(&mut self, height: u64) -> Result<bool, BlockError> {
        // nothing committed yet: the first block may have any height
        if self.computed_height == 0 || height == self.computed_height + 1 {
            return Ok(true);
        }
        if height == self.computed_height {
            return Ok(false);
        }
        Err(self.decohere(format!(
            "cannot move computed state from height {} to {height}",
            self.computed_height
        )))
    }

    fn recorded_sends(&mut self, height: u64) -> Result<Vec<ChainSend>, BlockError> {
        if let Some((recorded, sends)) = &self.last_sends {
            if *recorded == height {
                return Ok(sends.clone());
            }
        }
        let sends: Vec<ChainSend> = read_host(self.kernel.store(), CHAIN_SENDS_KEY)?.unwrap_or_default();
        if let Some(expected) = self.kernel.store().get(CHAIN_SENDS_HASH_KEY)? {
            if sends_hash(&sends)? != expected {
                return Err(self.decohere(format!("recorded chain sends for block {height} fail their hash")));
            }
        }
        Ok(sends)
    }

    /// Take actions from `queue` while the budget allows, running the
    /// kernel after each. Returns actions taken and cranks run.
    fn process_queue(
        &mut self,
        queue: &mut VecDeque<InboundAction>,
        policy: &mut ComputronCounter,
    ) -> Result<(usize, u64), BlockError> {
        let mut processed = 0;
        let mut cranks = 0;
        while policy.should_run() {
            let Some(action) = queue.pop_front() else {
                break;
            };
            self.perform(&action)?;
            processed += 1;
            cranks += self.kernel.run(&mut *policy)?;
        }
        Ok((processed, cranks))
    }

    /// Deliver `inbound(kind, body)` to the action's handler vat. Actions
    /// whose handler is gone are dropped with a warning.
    fn perform(&mut self, action: &InboundAction) -> Result<(), BlockError> {
        let Some(vat) = self.config.handler(&action.kind).map(str::to_string) else {
            warn!(kind = %action.kind, "inbound action has no route; dropped");
            return Ok(());
        };
        let args = CapData::plain(&json!([action.kind, action.body]));
        let sent = self
            .kernel
            .vat_id(&vat)
            .and_then(|vat_id| self.kernel.vat_root(vat_id))
            .and_then(|root| self.kernel.send_only(root, INBOUND_METHOD, args));
        match sent {
            Ok(()) => Ok(()),
            Err(e) if droppable(&e) => {
                warn!(kind = %action.kind, %vat, error = %e, "inbound action dropped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Advance the timer to `now` and queue `wake(when)` for every due
    /// wakeup. Returns the number of wakeups queued.
    fn poll_timer(&mut self, now: u64) -> Result<usize, BlockError> {
        let due = self.timer.poll(now);
        for wakeup in &due {
            let args = CapData::plain(&json!([wakeup.when]));
            match self.kernel.send_only(wakeup.handler, WAKE_METHOD, args) {
                Ok(()) => {}
                Err(e) if droppable(&e) => {
                    warn!(handler = %wakeup.handler, when = wakeup.when, error = %e, "wakeup dropped");
                }
                Err(e) => return Err(e.into()),
            }
            self.kernel.unpin(wakeup.handler)?;
        }
        for handler in self.timer.take_released() {
            self.kernel.unpin(handler)?;
        }
        debug!(now, added = due.len(), "timer polled");
        Ok(due.len())
    }

    fn save_timer(&mut self) -> Result<(), BlockError> {
        let saved = self.timer.to_json()?;
        self.kernel.store_mut().host_set(TIMER_KEY, &saved)?;
        Ok(())
    }

    fn saved_queue(&self, key: &str) -> Result<Vec<InboundAction>, BlockError> {
        Ok(read_host(self.kernel.store(), key)?.unwrap_or_default())
    }

    fn save_queue(&mut self, key: &str, actions: &[InboundAction]) -> Result<(), BlockError> {
        let store = self.kernel.store_mut();
        if actions.is_empty() {
            store.host_delete(key)?;
        } else {
            store.host_set(key, &serde_json::to_string(actions)?)?;
        }
        Ok(())
    }

    fn check_coherent(&self) -> Result<(), BlockError> {
        match &self.decohered {
            Some(reason) => Err(BlockError::Decoherence(reason.clone())),
            None => Ok(()),
        }
    }

    fn decohere(&mut self, reason: String) -> BlockError {
        error!(%reason, "decoherence");
        self.decohered = Some(reason.clone());
        BlockError::Decoherence(reason)
    }
}

/// Host sends that fail without hurting the kernel are dropped.
fn droppable(e: &KernelError) -> bool {
    !e.is_fatal() && !matches!(e, KernelError::NotInitialized)
}

fn read_host<T: DeserializeOwned>(store: &SwingStore, key: &str) -> Result<Option<T>, BlockError> {
    match store.get(key)? {
        Some(value) => Ok(Some(serde_json::from_str(&value)?)),
        None => Ok(None),
    }
}
