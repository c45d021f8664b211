//! The kernel: one crank at a time over the kernel tables
//!
//! [`Kernel`] owns the [`KernelKeeper`], the [`VatWarehouse`] and the
//! [`DeviceRegistry`]. Hosts put work on the run-queue with the host
//! operations and drive it with [`Kernel::step`] or [`Kernel::run`].
//!
//! # Crank
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ start_crank ── savepoint "start"                               │
//! │                                                                │
//! │   event = gcActions ▸ reapQueue ▸ runQueue                     │
//! │   release the event's refcounts ── savepoint "deliver"         │
//! │                                                                │
//! │   route ──▶ translate ──▶ worker.deliver ──syscalls──▶ keeper  │
//! │                                                                │
//! │   abort?      rollback to "deliver" (message consumed)         │
//! │               or "start" (message re-attempted next crank)     │
//! │   terminate?  reject decided promises, drop c-list, stop worker│
//! │                                                                │
//! │ process_refcounts ── crank number ── crank hashes ── end_crank │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Host operations (`queue_to_kref`, `create_vat`, ...) run in a crank
//! of their own so their writes are hashed like any other.

mod crank;
mod host;
mod queries;
mod routing;
mod termination;

pub use queries::PromiseStatus;

use serde_json::{json, Map, Value};
use swing_kernel_core::{KernelCapData, KernelKeeper, KernelSlot, RunQueueEvent, VatOptions};
use swing_store::SwingStore;
use swing_vat::{slot_marker, CapData, Message, VatId, VatSlot, WorkerFactory};
use tracing::{error, info};

use crate::config::{KernelConfig, NamedBundles};
use crate::device::{Device, DeviceRegistry};
use crate::error::KernelError;
use crate::policy::{PolicyInput, RunPolicy};
use crate::warehouse::VatWarehouse;

/// The swingset kernel.
pub struct Kernel<F: WorkerFactory> {
    keeper: KernelKeeper,
    warehouse: VatWarehouse<F>,
    devices: DeviceRegistry,
    config: KernelConfig,
    panic: Option<String>,
}

impl<F: WorkerFactory> Kernel<F> {
    /// Create a kernel over a store. The store may already hold kernel
    /// state from an earlier run, in which case `initialize` must not be
    /// called again; vats come back online on their next delivery.
    pub fn new(store: SwingStore, factory: F, config: KernelConfig) -> Self {
        let warehouse = VatWarehouse::new(factory, config.snapshot_initial, config.snapshot_interval);
        Self {
            keeper: KernelKeeper::new(store),
            warehouse,
            devices: DeviceRegistry::new(),
            config,
            panic: None,
        }
    }

    /// Register a device. Devices known at `initialize` get a `kd` ref;
    /// after a restart the host registers the same names again.
    pub fn register_device(&mut self, name: impl Into<String>, device: Box<dyn Device>) {
        self.devices.register(name, device);
    }

    /// Check whether the store holds a kernel.
    pub fn is_initialized(&self) -> Result<bool, KernelError> {
        Ok(self.keeper.is_initialized()?)
    }

    /// The configuration the kernel was built with.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    /// Write the initial kernel state: device refs, every static vat
    /// (queued to start) and, if configured, the bootstrap message.
    ///
    /// # Returns
    /// The pinned result promise of `bootstrap(vats, devices)`, if there
    /// is a bootstrap vat.
    pub fn initialize(&mut self, bundles: &NamedBundles) -> Result<Option<KernelSlot>, KernelError> {
        self.check_panic()?;
        if self.keeper.is_initialized()? {
            return Err(KernelError::AlreadyInitialized);
        }
        self.config.validate()?;
        self.keeper.start_crank()?;
        self.keeper.establish_savepoint("init")?;
        match self.write_initial_state(bundles) {
            Ok(bootstrap) => {
                self.keeper.process_refcounts()?;
                self.keeper.store_mut().emit_crank_hashes()?;
                self.keeper.end_crank()?;
                info!(
                    vats = self.config.vats.len(),
                    devices = self.devices.names().count(),
                    "kernel initialized"
                );
                Ok(bootstrap)
            }
            Err(e) => {
                self.keeper.rollback_to("init")?;
                self.keeper.end_crank()?;
                Err(e)
            }
        }
    }

    fn write_initial_state(&mut self, bundles: &NamedBundles) -> Result<Option<KernelSlot>, KernelError> {
        self.keeper.create_kernel_state()?;

        let device_names: Vec<String> = self.devices.names().map(str::to_string).collect();
        let mut device_refs = Vec::with_capacity(device_names.len());
        for name in &device_names {
            device_refs.push((name.clone(), self.keeper.add_kernel_device(name)?));
        }

        let mut roots = Vec::with_capacity(self.config.vats.len());
        let vats: Vec<_> = self
            .config
            .vats
            .iter()
            .map(|(name, vat)| (name.clone(), vat.clone()))
            .collect();
        for (name, vat) in vats {
            let bytes = bundles
                .get(&vat.bundle)
                .ok_or_else(|| KernelError::UnknownBundle(vat.bundle.clone()))?;
            let bundle_id = self.keeper.store_mut().add_bundle(bytes)?;
            let options = VatOptions {
                name: name.clone(),
                critical: vat.critical,
                enable_pipelining: vat
                    .enable_pipelining
                    .unwrap_or(self.config.default_enable_pipelining),
                reap_interval: vat.reap_interval,
                dynamic: false,
            };
            let vat_id = self.keeper.create_vat_state(&options, &bundle_id)?;
            let root = self.export_root(vat_id)?;
            roots.push((name, root));

            let mut granted = Vec::with_capacity(vat.devices.len());
            for device in &vat.devices {
                let kref = device_refs
                    .iter()
                    .find(|(n, _)| n == device)
                    .map(|(_, kref)| *kref)
                    .ok_or_else(|| KernelError::UnknownDevice(device.clone()))?;
                granted.push((device.clone(), kref));
            }
            let vat_parameters = static_vat_parameters(&vat.parameters, &granted);
            self.keeper.enqueue(&RunQueueEvent::StartVat {
                vat_id,
                vat_parameters,
            })?;
        }

        let Some(bootstrap) = self.config.bootstrap.clone() else {
            return Ok(None);
        };
        let target = roots
            .iter()
            .find(|(name, _)| *name == bootstrap)
            .map(|(_, root)| *root)
            .ok_or_else(|| KernelError::UnknownVat(bootstrap.clone()))?;

        let mut slots = Vec::new();
        let mut vat_map = Map::new();
        for (name, root) in &roots {
            vat_map.insert(name.clone(), slot_marker(slots.len()));
            slots.push(*root);
        }
        let mut device_map = Map::new();
        for (name, kref) in &device_refs {
            device_map.insert(name.clone(), slot_marker(slots.len()));
            slots.push(*kref);
        }
        let args = CapData::from_json(&json!([vat_map, device_map]), slots);
        let result = self.keeper.add_kernel_promise(None)?;
        self.keeper.pin(result)?;
        self.keeper.enqueue(&RunQueueEvent::Send {
            target,
            msg: Message::new("bootstrap", args, Some(result)),
        })?;
        info!(vat = %bootstrap, %target, %result, "queued bootstrap");
        Ok(Some(result))
    }

    /// Give a new vat its root object and pin it for the vat's lifetime.
    fn export_root(&mut self, vat_id: VatId) -> Result<KernelSlot, KernelError> {
        let root = self
            .keeper
            .map_vat_slot_to_kernel_slot(vat_id, VatSlot::ROOT, true)?;
        self.keeper.pin(root)?;
        Ok(root)
    }

    // ========================================================================
    // Running
    // ========================================================================

    /// Run one crank.
    ///
    /// Returns [`PolicyInput::None`] when there was nothing to do. Any
    /// error leaves the kernel panicked.
    pub fn step(&mut self) -> Result<PolicyInput, KernelError> {
        self.check_panic()?;
        self.require_initialized()?;
        match self.crank() {
            Ok(input) => Ok(input),
            Err(e) => Err(self.enter_panic(e)),
        }
    }

    /// Run cranks until the queues drain or the policy says stop.
    /// Returns the number of cranks that did work.
    pub fn run(&mut self, policy: &mut dyn RunPolicy) -> Result<u64, KernelError> {
        let mut cranks = 0;
        loop {
            let input = self.step()?;
            if input == PolicyInput::None {
                return Ok(cranks);
            }
            cranks += 1;
            if !policy.consult(input) {
                return Ok(cranks);
            }
        }
    }

    /// Commit every crank since the last commit.
    pub fn commit(&mut self) -> Result<(), KernelError> {
        self.check_panic()?;
        self.keeper.store_mut().commit()?;
        Ok(())
    }

    /// Stop every worker. Uncommitted state stays pending in the store.
    pub fn shutdown(&mut self) {
        self.warehouse.shutdown_all();
        info!("kernel shut down");
    }

    /// Why the kernel panicked, if it has.
    pub fn panic_message(&self) -> Option<&str> {
        self.panic.as_deref()
    }

    fn check_panic(&self) -> Result<(), KernelError> {
        match &self.panic {
            Some(message) => Err(KernelError::Panicked(message.clone())),
            None => Ok(()),
        }
    }

    fn require_initialized(&self) -> Result<(), KernelError> {
        if self.keeper.is_initialized()? {
            Ok(())
        } else {
            Err(KernelError::NotInitialized)
        }
    }

    /// Make the kernel refuse further work.
    fn enter_panic(&mut self, err: KernelError) -> KernelError {
        if self.panic.is_none() {
            error!(error = %err, "kernel panic");
            self.panic = Some(err.to_string());
            self.warehouse.shutdown_all();
        }
        err
    }
}

/// `startVat` parameters of a static vat: its configured JSON plus a
/// `devices` record of the devices it was granted.
fn static_vat_parameters(parameters: &Value, granted: &[(String, KernelSlot)]) -> KernelCapData {
    if granted.is_empty() {
        return CapData::plain(parameters);
    }
    let mut body = match parameters {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    let mut devices = Map::new();
    let mut slots = Vec::with_capacity(granted.len());
    for (name, kref) in granted {
        devices.insert(name.clone(), slot_marker(slots.len()));
        slots.push(*kref);
    }
    body.insert("devices".to_string(), Value::Object(devices));
    CapData::from_json(&Value::Object(body), slots)
}
