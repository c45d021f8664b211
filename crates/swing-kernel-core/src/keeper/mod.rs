//! The kernel keeper: typed access to kernel state held in the store
//!
//! Every table lives in the kv namespace of a [`SwingStore`], so crank
//! savepoints and block commits cover all of it. The keeper adds typed
//! accessors and the refcount bookkeeping on top.
//!
//! # Schema
//!
//! | key                         | value                                  |
//! |-----------------------------|----------------------------------------|
//! | `ko.nextID` `kp.nextID` `kd.nextID` `vat.nextID` | allocation counters |
//! | `ko<N>.owner`               | owning vat (absent when orphaned)      |
//! | `ko<N>.refCount`            | `reachable,recognizable`               |
//! | `kp<N>.state`               | `unresolved` / `fulfilled` / `rejected`|
//! | `kp<N>.refCount`            | holder count                           |
//! | `kp<N>.decider`             | deciding vat or empty                  |
//! | `kp<N>.subscribers`         | comma-separated vat IDs                |
//! | `kp<N>.queue.<M>`           | messages waiting on the promise        |
//! | `kp<N>.data`                | settlement capdata                     |
//! | `kd<N>.owner`               | device name                            |
//! | `runQueue` / `runQueue.<M>` | `[head,tail]` and queued events        |
//! | `gcActions`                 | pending GC actions                     |
//! | `reapQueue`                 | vats owed `bringOutYourDead`           |
//! | `kernel.pins`               | kernel-held refs                       |
//! | `<vat>.c.<kref>`            | `R <vref>` or `_ <vref>`               |
//! | `<vat>.c.<vref>`            | kref                                   |
//! | `<vat>.options` `<vat>.source` `<vat>.lifecycle` | vat records       |
//! | `<vat>.vs.<key>`            | vatstore                               |

mod clist;
mod gc;
mod objects;
mod promises;
mod queue;
mod vats;

pub use clist::ClistEntry;
pub use objects::RefKind;
pub use promises::Settlement;
pub use vats::UpgradeOutcome;

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::Serialize;
use swing_store::SwingStore;
use tracing::debug;

use crate::error::KeeperError;
use crate::types::KernelSlot;

const INITIALIZED_KEY: &str = "initialized";
const CRANK_NUMBER_KEY: &str = "crankNumber";

/// Typed view of kernel state.
pub struct KernelKeeper {
    store: SwingStore,
    maybe_free: BTreeSet<KernelSlot>,
}

impl KernelKeeper {
    /// Wrap a store. Call [`create_kernel_state`](Self::create_kernel_state)
    /// once on a fresh store.
    pub fn new(store: SwingStore) -> Self {
        Self {
            store,
            maybe_free: BTreeSet::new(),
        }
    }

    /// Borrow the underlying store.
    pub fn store(&self) -> &SwingStore {
        &self.store
    }

    /// Mutably borrow the underlying store.
    pub fn store_mut(&mut self) -> &mut SwingStore {
        &mut self.store
    }

    /// Give back the store.
    pub fn into_store(self) -> SwingStore {
        self.store
    }

    /// Check whether kernel state has been created in this store.
    pub fn is_initialized(&self) -> Result<bool, KeeperError> {
        Ok(self.store.has(INITIALIZED_KEY)?)
    }

    /// Write the initial counters and empty tables.
    pub fn create_kernel_state(&mut self) -> Result<(), KeeperError> {
        if self.is_initialized()? {
            return Err(KeeperError::invariant("kernel state already created"));
        }
        for counter in ["ko.nextID", "kp.nextID", "kd.nextID", "vat.nextID", "upgrade.nextID"] {
            self.store.set(counter, "1")?;
        }
        self.store.set("runQueue", "[0,0]")?;
        self.store.set("gcActions", "[]")?;
        self.store.set("reapQueue", "[]")?;
        self.store.set("kernel.pins", "{}")?;
        self.store.set("vat.names", "[]")?;
        self.store.set("vat.dynamicIDs", "[]")?;
        self.store.set("vats.terminated", "[]")?;
        self.store.set(CRANK_NUMBER_KEY, "0")?;
        self.store.set(INITIALIZED_KEY, "true")?;
        debug!("created kernel state");
        Ok(())
    }

    // ========================================================================
    // Crank bracketing
    // ========================================================================

    /// Open a crank in the store.
    pub fn start_crank(&mut self) -> Result<(), KeeperError> {
        self.maybe_free.clear();
        Ok(self.store.start_crank()?)
    }

    /// Mark a rollback point.
    pub fn establish_savepoint(&mut self, name: &str) -> Result<(), KeeperError> {
        Ok(self.store.establish_savepoint(name)?)
    }

    /// Undo writes back to a savepoint.
    pub fn rollback_to(&mut self, name: &str) -> Result<(), KeeperError> {
        Ok(self.store.rollback_to(name)?)
    }

    /// Close the crank.
    pub fn end_crank(&mut self) -> Result<(), KeeperError> {
        Ok(self.store.end_crank()?)
    }

    /// Number of completed cranks.
    pub fn crank_number(&self) -> Result<u64, KeeperError> {
        Ok(self.get_u64(CRANK_NUMBER_KEY)?.unwrap_or(0))
    }

    /// Advance the crank counter.
    pub fn increment_crank_number(&mut self) -> Result<u64, KeeperError> {
        let next = self.crank_number()? + 1;
        self.store.set(CRANK_NUMBER_KEY, &next.to_string())?;
        Ok(next)
    }

    // ========================================================================
    // Encoding helpers
    // ========================================================================

    pub(crate) fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, KeeperError> {
        match self.store.get(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| KeeperError::corrupt(key, e)),
            None => Ok(None),
        }
    }

    pub(crate) fn set_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), KeeperError> {
        let raw = serde_json::to_string(value).map_err(|e| KeeperError::corrupt(key, e))?;
        self.store.set(key, &raw)?;
        Ok(())
    }

    pub(crate) fn get_u64(&self, key: &str) -> Result<Option<u64>, KeeperError> {
        match self.store.get(key)? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e| KeeperError::corrupt(key, e)),
            None => Ok(None),
        }
    }

    pub(crate) fn get_parsed<T>(&self, key: &str) -> Result<Option<T>, KeeperError>
    where
        T: std::str::FromStr,
        T::Err: ToString,
    {
        match self.store.get(key)? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e| KeeperError::corrupt(key, e)),
            None => Ok(None),
        }
    }

    /// Read a counter and bump it.
    pub(crate) fn allocate_id(&mut self, counter_key: &str) -> Result<u64, KeeperError> {
        let id = self
            .get_u64(counter_key)?
            .ok_or_else(|| KeeperError::corrupt(counter_key, "missing counter"))?;
        self.store.set(counter_key, &(id + 1).to_string())?;
        Ok(id)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::fresh_keeper;
    use super::*;

    #[test]
    fn test_create_kernel_state_once() {
        let mut keeper = fresh_keeper();
        assert!(keeper.is_initialized().unwrap());
        assert!(keeper.create_kernel_state().is_err());
    }

    #[test]
    fn test_crank_number_advances() {
        let mut keeper = fresh_keeper();
        assert_eq!(keeper.crank_number().unwrap(), 0);
        assert_eq!(keeper.increment_crank_number().unwrap(), 1);
        assert_eq!(keeper.crank_number().unwrap(), 1);
    }

    #[test]
    fn test_allocate_id_is_monotonic() {
        let mut keeper = fresh_keeper();
        let a = keeper.allocate_id("ko.nextID").unwrap();
        let b = keeper.allocate_id("ko.nextID").unwrap();
        assert_eq!(b, a + 1);
    }
}
