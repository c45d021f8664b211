//! In-process workers
//!
//! A local bundle is a tiny JSON document naming a registered
//! constructor. The factory builds a fresh worker from that constructor
//! every time the kernel asks, which is what replay needs: the same code,
//! a clean heap.

use std::cell::Cell;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::protocol::{DeliveryResult, VatDelivery};
use crate::slot::VatId;
use crate::worker::{SyscallHandler, VatWorker, WorkerError, WorkerFactory};

const LOCAL_FORMAT: &str = "local";

/// Bundle format understood by [`LocalWorkerFactory`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalBundle {
    /// Always `"local"`.
    pub module_format: String,
    /// Registered constructor name.
    pub name: String,
}

impl LocalBundle {
    /// Bundle naming a registered constructor.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            module_format: LOCAL_FORMAT.to_string(),
            name: name.into(),
        }
    }

    /// Encode for the bundle store.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode from the bundle store.
    pub fn parse(bytes: &[u8]) -> Result<Self, WorkerError> {
        let bundle: LocalBundle = serde_json::from_slice(bytes)
            .map_err(|e| WorkerError::InvalidBundle(e.to_string()))?;
        if bundle.module_format != LOCAL_FORMAT {
            return Err(WorkerError::InvalidBundle(format!(
                "unsupported module format {:?}",
                bundle.module_format
            )));
        }
        Ok(bundle)
    }
}

type Constructor = Box<dyn Fn(VatId, Option<&[u8]>) -> Result<Box<dyn VatWorker>, WorkerError>>;

/// Worker factory over registered in-process constructors.
#[derive(Default)]
pub struct LocalWorkerFactory {
    constructors: BTreeMap<String, Constructor>,
    started: Cell<u64>,
}

impl LocalWorkerFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for workers without snapshot support.
    pub fn register<W, F>(&mut self, name: &str, make: F) -> LocalBundle
    where
        W: VatWorker + 'static,
        F: Fn() -> W + 'static,
    {
        self.constructors.insert(
            name.to_string(),
            Box::new(move |_: VatId, _: Option<&[u8]>| {
                Ok::<_, WorkerError>(Box::new(make()) as Box<dyn VatWorker>)
            }),
        );
        LocalBundle::new(name)
    }

    /// Register a constructor that can restore from a heap snapshot.
    pub fn register_restorable<W, F>(&mut self, name: &str, make: F) -> LocalBundle
    where
        W: VatWorker + 'static,
        F: Fn(Option<&[u8]>) -> Result<W, WorkerError> + 'static,
    {
        self.constructors.insert(
            name.to_string(),
            Box::new(move |_: VatId, snapshot: Option<&[u8]>| {
                let worker = make(snapshot)?;
                Ok::<_, WorkerError>(Box::new(worker) as Box<dyn VatWorker>)
            }),
        );
        LocalBundle::new(name)
    }

    /// Number of workers started so far.
    pub fn started(&self) -> u64 {
        self.started.get()
    }
}

impl WorkerFactory for LocalWorkerFactory {
    fn start_worker(
        &self,
        vat_id: VatId,
        bundle: &[u8],
        snapshot: Option<&[u8]>,
    ) -> Result<Box<dyn VatWorker>, WorkerError> {
        let bundle = LocalBundle::parse(bundle)?;
        let make = self
            .constructors
            .get(&bundle.name)
            .ok_or_else(|| WorkerError::UnknownBundle(bundle.name.clone()))?;
        let worker = make(vat_id, snapshot)?;
        self.started.set(self.started.get() + 1);
        debug!(vat_id = %vat_id, bundle = %bundle.name, restored = snapshot.is_some(), "started local worker");
        Ok(worker)
    }
}

/// A worker whose behavior is a closure.
pub struct FnWorker<F> {
    behavior: F,
}

impl<F> FnWorker<F>
where
    F: FnMut(&VatDelivery, &mut dyn SyscallHandler) -> DeliveryResult,
{
    /// Wrap a closure.
    pub fn new(behavior: F) -> Self {
        Self { behavior }
    }
}

impl<F> VatWorker for FnWorker<F>
where
    F: FnMut(&VatDelivery, &mut dyn SyscallHandler) -> DeliveryResult,
{
    fn deliver(
        &mut self,
        delivery: &VatDelivery,
        syscalls: &mut dyn SyscallHandler,
    ) -> DeliveryResult {
        (self.behavior)(delivery, syscalls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{VatSyscall, VatSyscallResult};

    struct AcceptAll;

    impl SyscallHandler for AcceptAll {
        fn syscall(&mut self, _call: &VatSyscall) -> VatSyscallResult {
            VatSyscallResult::ok()
        }
    }

    #[test]
    fn test_factory_builds_fresh_workers() {
        let mut factory = LocalWorkerFactory::new();
        let bundle = factory.register("noop", || FnWorker::new(|_, _| DeliveryResult::ok()));
        let bytes = bundle.to_bytes();

        let mut worker = factory.start_worker(VatId(1), &bytes, None).unwrap();
        let result = worker.deliver(&VatDelivery::BringOutYourDead, &mut AcceptAll);
        assert!(result.is_ok());

        factory.start_worker(VatId(1), &bytes, None).unwrap();
        assert_eq!(factory.started(), 2);
    }

    #[test]
    fn test_unknown_and_invalid_bundles() {
        let factory = LocalWorkerFactory::new();
        let missing = LocalBundle::new("missing").to_bytes();
        assert!(matches!(
            factory.start_worker(VatId(1), &missing, None),
            Err(WorkerError::UnknownBundle(_))
        ));
        assert!(matches!(
            factory.start_worker(VatId(1), b"not json", None),
            Err(WorkerError::InvalidBundle(_))
        ));
    }
}
