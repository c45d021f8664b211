//! Vat warehouse
//!
//! Keeps workers online and brings them back when needed. A worker is
//! started lazily on the first delivery to its vat: from the latest heap
//! snapshot if there is one, then the current transcript span is replayed
//! against it. Any divergence during replay is anachrophobia and is fatal
//! to the kernel.
//!
//! ```text
//!   ensure_online(v)
//!     ├─ bundle  = bundles[v.source]
//!     ├─ snap    = snapshots[v]           (optional)
//!     ├─ worker  = factory.start(bundle, snap)
//!     └─ replay  transcript[v].current_span
//!
//!   deliver(v, d)
//!     ├─ ensure_online(v)
//!     ├─ worker.deliver(d, KernelSyscallHandler)
//!     ├─ transcript[v] += { d, syscalls, result }
//!     └─ queue notifies
//! ```

use std::collections::BTreeMap;

use swing_kernel_core::KernelKeeper;
use swing_vat::{DeliveryResult, VatDelivery, VatId, VatWorker, WorkerFactory};
use tracing::{debug, info, warn};

use crate::device::DeviceRegistry;
use crate::error::{KernelError, SyscallError};
use crate::syscall::{ExitRequest, KernelSyscallHandler};
use crate::transcript::{replay_entry, TranscriptEntry};

/// What one delivery produced.
#[derive(Debug)]
pub(crate) struct DeliveryReport {
    pub result: DeliveryResult,
    pub illegal: Option<SyscallError>,
    pub exit: Option<ExitRequest>,
}

/// Online workers and the factory that makes them.
pub struct VatWarehouse<F: WorkerFactory> {
    factory: F,
    online: BTreeMap<VatId, Box<dyn VatWorker>>,
    snapshot_initial: u64,
    snapshot_interval: u64,
}

impl<F: WorkerFactory> VatWarehouse<F> {
    /// Create a warehouse with the given snapshot cadence.
    pub fn new(factory: F, snapshot_initial: u64, snapshot_interval: u64) -> Self {
        Self {
            factory,
            online: BTreeMap::new(),
            snapshot_initial,
            snapshot_interval,
        }
    }

    /// The worker factory.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Check whether a vat has a live worker.
    pub fn is_online(&self, vat_id: VatId) -> bool {
        self.online.contains_key(&vat_id)
    }

    /// Start a worker for the vat if it has none, replaying its current
    /// transcript span.
    pub fn ensure_online(&mut self, keeper: &KernelKeeper, vat_id: VatId) -> Result<(), KernelError> {
        if self.online.contains_key(&vat_id) {
            return Ok(());
        }
        let vat = vat_id.to_string();
        let bundle_id = keeper.vat_source(vat_id)?;
        let bundle = keeper
            .store()
            .get_bundle(&bundle_id)?
            .ok_or_else(|| KernelError::UnknownBundle(bundle_id.to_string()))?;
        let snapshot = keeper.store().load_snapshot(&vat)?;
        // a snapshot from an earlier incarnation is deleted at upgrade, so
        // any snapshot here belongs to the current span's start
        let mut worker = self
            .factory
            .start_worker(vat_id, &bundle, snapshot.as_ref().map(|(_, bytes)| bytes.as_slice()))
            .map_err(|source| KernelError::Worker { vat_id, source })?;

        let items = keeper.store().read_current_span(&vat)?;
        let replayed = items.len();
        for (position, raw) in items {
            let entry = TranscriptEntry::parse(vat_id, position, &raw)?;
            if let Some(detail) = replay_entry(worker.as_mut(), &entry) {
                worker.shutdown();
                warn!(vat_id = %vat_id, position, %detail, "replay diverged");
                return Err(KernelError::Anachrophobia {
                    vat_id,
                    position,
                    detail,
                });
            }
        }
        info!(
            vat_id = %vat_id,
            from_snapshot = snapshot.is_some(),
            replayed,
            "vat online"
        );
        self.online.insert(vat_id, worker);
        Ok(())
    }

    /// Run one delivery and record it in the transcript.
    pub(crate) fn deliver(
        &mut self,
        keeper: &mut KernelKeeper,
        devices: &mut DeviceRegistry,
        vat_id: VatId,
        delivery: &VatDelivery,
    ) -> Result<DeliveryReport, KernelError> {
        self.ensure_online(keeper, vat_id)?;
        let worker = self
            .online
            .get_mut(&vat_id)
            .ok_or_else(|| KernelError::UnknownVat(vat_id.to_string()))?;

        let mut handler = KernelSyscallHandler::new(keeper, devices, vat_id);
        let result = worker.deliver(delivery, &mut handler);
        let outcome = handler.finish();

        if let Some(fault) = outcome.illegal.as_ref().filter(|e| e.is_kernel_fault()) {
            return Err(KernelError::Panicked(format!(
                "kernel fault during delivery to {vat_id}: {fault}"
            )));
        }

        let entry = TranscriptEntry {
            d: delivery.clone(),
            sc: outcome.records,
            r: result.clone(),
        };
        let position = keeper
            .store_mut()
            .add_transcript_item(&vat_id.to_string(), &serde_json::to_string(&entry)?)?;
        debug!(
            vat_id = %vat_id,
            kind = delivery.kind(),
            position,
            syscalls = entry.sc.len(),
            ok = result.is_ok(),
            "delivered"
        );
        outcome.notifies.flush(keeper)?;

        Ok(DeliveryReport {
            result,
            illegal: outcome.illegal,
            exit: outcome.exit,
        })
    }

    /// Save a heap snapshot when the span has grown past the threshold.
    /// Returns `true` if one was taken.
    pub fn maybe_save_snapshot(&mut self, keeper: &mut KernelKeeper, vat_id: VatId) -> Result<bool, KernelError> {
        let Some(worker) = self.online.get_mut(&vat_id) else {
            return Ok(false);
        };
        let vat = vat_id.to_string();
        let bounds = keeper.store().current_span_bounds(&vat)?;
        let threshold = if keeper.store().snapshot_info(&vat)?.is_some() {
            self.snapshot_interval
        } else {
            self.snapshot_initial
        };
        if bounds.len() < threshold {
            return Ok(false);
        }
        let Some(bytes) = worker.snapshot() else {
            return Ok(false);
        };
        let info = keeper.store_mut().save_snapshot(&vat, bounds.end_pos, &bytes)?;
        keeper.store_mut().rollover_span(&vat)?;
        info!(vat_id = %vat_id, end_pos = info.end_pos, size = info.size, hash = %info.hash, "saved heap snapshot");
        Ok(true)
    }

    /// Shut a vat's worker down. The next delivery restarts it.
    pub fn stop_worker(&mut self, vat_id: VatId) {
        if let Some(mut worker) = self.online.remove(&vat_id) {
            worker.shutdown();
            debug!(vat_id = %vat_id, "worker stopped");
        }
    }

    /// Shut every worker down.
    pub fn shutdown_all(&mut self) {
        let vats: Vec<VatId> = self.online.keys().copied().collect();
        for vat_id in vats {
            self.stop_worker(vat_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use swing_kernel_core::VatOptions;
    use swing_store::SwingStore;
    use swing_vat::{
        CapData, FnWorker, LocalWorkerFactory, SyscallHandler, SyscallValue, VatSyscall,
        VatSyscallResult, WorkerError,
    };

    struct Counter {
        count: u64,
    }

    impl VatWorker for Counter {
        fn deliver(&mut self, _d: &VatDelivery, sys: &mut dyn SyscallHandler) -> DeliveryResult {
            self.count += 1;
            sys.syscall(&VatSyscall::VatstoreSet {
                key: "count".into(),
                value: self.count.to_string(),
            });
            DeliveryResult::ok()
        }

        fn snapshot(&mut self) -> Option<Vec<u8>> {
            Some(self.count.to_string().into_bytes())
        }
    }

    fn keeper_with_vat(bundle: &[u8]) -> (KernelKeeper, VatId) {
        let mut keeper = KernelKeeper::new(SwingStore::in_memory());
        keeper.create_kernel_state().unwrap();
        let bundle_id = keeper.store_mut().add_bundle(bundle).unwrap();
        let vat_id = keeper
            .create_vat_state(&VatOptions::named("counter"), &bundle_id)
            .unwrap();
        (keeper, vat_id)
    }

    fn counter_factory() -> (LocalWorkerFactory, Vec<u8>) {
        let mut factory = LocalWorkerFactory::new();
        let bundle = factory.register_restorable("counter", |snapshot: Option<&[u8]>| {
            let count = match snapshot {
                Some(bytes) => std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| WorkerError::SnapshotRestore("bad counter".into()))?,
                None => 0,
            };
            Ok(Counter { count })
        });
        (factory, bundle.to_bytes())
    }

    #[test]
    fn test_deliveries_are_recorded_and_replayed() {
        let (factory, bundle) = counter_factory();
        let (mut keeper, vat_id) = keeper_with_vat(&bundle);
        let mut devices = DeviceRegistry::new();
        let mut warehouse = VatWarehouse::new(factory, 100, 100);

        for _ in 0..3 {
            let report = warehouse
                .deliver(&mut keeper, &mut devices, vat_id, &VatDelivery::BringOutYourDead)
                .unwrap();
            assert!(report.result.is_ok());
            assert!(report.illegal.is_none());
        }
        assert_eq!(keeper.vatstore_get(vat_id, "count").unwrap().as_deref(), Some("3"));

        // a restarted worker replays three deliveries and carries on at four
        warehouse.stop_worker(vat_id);
        warehouse
            .deliver(&mut keeper, &mut devices, vat_id, &VatDelivery::BringOutYourDead)
            .unwrap();
        assert_eq!(keeper.vatstore_get(vat_id, "count").unwrap().as_deref(), Some("4"));
        assert_eq!(warehouse.factory().started(), 2);
    }

    #[test]
    fn test_snapshot_shortens_replay() {
        let (factory, bundle) = counter_factory();
        let (mut keeper, vat_id) = keeper_with_vat(&bundle);
        let mut devices = DeviceRegistry::new();
        let mut warehouse = VatWarehouse::new(factory, 2, 10);

        warehouse
            .deliver(&mut keeper, &mut devices, vat_id, &VatDelivery::BringOutYourDead)
            .unwrap();
        assert!(!warehouse.maybe_save_snapshot(&mut keeper, vat_id).unwrap());
        warehouse
            .deliver(&mut keeper, &mut devices, vat_id, &VatDelivery::BringOutYourDead)
            .unwrap();
        assert!(warehouse.maybe_save_snapshot(&mut keeper, vat_id).unwrap());

        let bounds = keeper.store().current_span_bounds(&vat_id.to_string()).unwrap();
        assert_eq!((bounds.start_pos, bounds.end_pos), (2, 2));

        warehouse.stop_worker(vat_id);
        warehouse
            .deliver(&mut keeper, &mut devices, vat_id, &VatDelivery::BringOutYourDead)
            .unwrap();
        assert_eq!(keeper.vatstore_get(vat_id, "count").unwrap().as_deref(), Some("3"));
    }

    #[test]
    fn test_divergent_replay_is_anachrophobia() {
        let mut factory = LocalWorkerFactory::new();
        let bundle = factory.register("fickle", || {
            let mut first = true;
            FnWorker::new(move |_d: &VatDelivery, sys: &mut dyn SyscallHandler| {
                let key = if first { "a" } else { "b" };
                first = false;
                sys.syscall(&VatSyscall::VatstoreGet { key: key.into() });
                DeliveryResult::ok()
            })
        });
        let (mut keeper, vat_id) = keeper_with_vat(&bundle.to_bytes());
        let mut devices = DeviceRegistry::new();
        let mut warehouse = VatWarehouse::new(factory, 100, 100);

        warehouse
            .deliver(&mut keeper, &mut devices, vat_id, &VatDelivery::BringOutYourDead)
            .unwrap();

        // rewrite the recorded syscall so the fresh worker no longer matches
        let vat = vat_id.to_string();
        let (_, raw) = keeper.store().read_current_span(&vat).unwrap().remove(0);
        let mut entry = TranscriptEntry::parse(vat_id, 0, &raw).unwrap();
        entry.sc[0].s = VatSyscall::VatstoreGet { key: "z".into() };
        entry.sc[0].r = VatSyscallResult::Ok(SyscallValue::Text(None));
        keeper.store_mut().delete_vat_transcripts(&vat).unwrap();
        keeper.store_mut().init_transcript(&vat).unwrap();
        keeper
            .store_mut()
            .add_transcript_item(&vat, &serde_json::to_string(&entry).unwrap())
            .unwrap();

        warehouse.stop_worker(vat_id);
        let err = warehouse
            .deliver(
                &mut keeper,
                &mut devices,
                vat_id,
                &VatDelivery::StartVat {
                    vat_parameters: CapData::plain(&json!({})),
                },
            )
            .unwrap_err();
        assert!(matches!(err, KernelError::Anachrophobia { position: 0, .. }));
        assert!(err.is_fatal());
    }
}
