//! Kernel promises

use std::collections::BTreeSet;

use swing_vat::VatId;

use super::objects::RefKind;
use super::KernelKeeper;
use crate::error::KeeperError;
use crate::types::{
    KernelCapData, KernelMessage, KernelPromise, KernelSlot, PromiseState, RunQueueEvent,
};

/// What a settlement released.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Settlement {
    /// Vats that subscribed before settlement and are owed a notify.
    pub subscribers: BTreeSet<VatId>,
    /// Messages that were waiting on the promise. They are already back
    /// on the run-queue, addressed to the settled promise.
    pub queue: Vec<KernelMessage>,
}

fn key(kpid: KernelSlot, field: &str) -> String {
    format!("{kpid}.{field}")
}

fn parse_subscribers(raw: &str) -> Result<BTreeSet<VatId>, String> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

impl KernelKeeper {
    /// Allocate an unresolved promise.
    pub fn add_kernel_promise(&mut self, decider: Option<VatId>) -> Result<KernelSlot, KeeperError> {
        let kpid = KernelSlot::Promise(self.allocate_id("kp.nextID")?);
        self.store.set(&key(kpid, "state"), "unresolved")?;
        self.store.set(&key(kpid, "refCount"), "0")?;
        self.store.set(
            &key(kpid, "decider"),
            &decider.map(|v| v.to_string()).unwrap_or_default(),
        )?;
        self.store.set(&key(kpid, "subscribers"), "")?;
        self.store.set(&key(kpid, "queue.nextID"), "0")?;
        Ok(kpid)
    }

    /// Check whether a promise exists.
    pub fn has_kernel_promise(&self, kpid: KernelSlot) -> Result<bool, KeeperError> {
        Ok(kpid.is_promise() && self.store.has(&key(kpid, "state"))?)
    }

    pub(crate) fn promise_ref_count(&self, kpid: KernelSlot) -> Result<u64, KeeperError> {
        self.get_u64(&key(kpid, "refCount"))?
            .ok_or(KeeperError::UnknownKref(kpid))
    }

    pub(crate) fn set_promise_ref_count(&mut self, kpid: KernelSlot, count: u64) -> Result<(), KeeperError> {
        self.store.set(&key(kpid, "refCount"), &count.to_string())?;
        Ok(())
    }

    /// Read a promise.
    pub fn get_kernel_promise(&self, kpid: KernelSlot) -> Result<KernelPromise, KeeperError> {
        let state_key = key(kpid, "state");
        let tag = self
            .store
            .get(&state_key)?
            .ok_or(KeeperError::UnknownKref(kpid))?;
        let ref_count = self.promise_ref_count(kpid)?;
        let state = match tag.as_str() {
            "unresolved" => {
                let subscribers_key = key(kpid, "subscribers");
                let raw = self.store.get(&subscribers_key)?.unwrap_or_default();
                PromiseState::Unresolved {
                    decider: self.decider(kpid)?,
                    subscribers: parse_subscribers(&raw)
                        .map_err(|e| KeeperError::corrupt(&subscribers_key, e))?,
                    queue: self.promise_queue(kpid)?,
                }
            }
            "fulfilled" | "rejected" => {
                let data: KernelCapData = self
                    .get_json(&key(kpid, "data"))?
                    .ok_or_else(|| KeeperError::corrupt(&key(kpid, "data"), "missing"))?;
                if tag == "fulfilled" {
                    PromiseState::Fulfilled(data)
                } else {
                    PromiseState::Rejected(data)
                }
            }
            other => return Err(KeeperError::corrupt(&state_key, other)),
        };
        Ok(KernelPromise { ref_count, state })
    }

    /// Deciding vat of an unresolved promise.
    pub fn decider(&self, kpid: KernelSlot) -> Result<Option<VatId>, KeeperError> {
        let decider_key = key(kpid, "decider");
        match self.store.get(&decider_key)?.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e: String| KeeperError::corrupt(&decider_key, e)),
        }
    }

    /// Hand resolution authority to a vat, or to the run-queue (`None`).
    pub fn set_decider(&mut self, kpid: KernelSlot, decider: Option<VatId>) -> Result<(), KeeperError> {
        self.require_unresolved(kpid)?;
        self.store.set(
            &key(kpid, "decider"),
            &decider.map(|v| v.to_string()).unwrap_or_default(),
        )?;
        Ok(())
    }

    /// Add a vat to the subscriber set of an unresolved promise.
    pub fn add_subscriber(&mut self, kpid: KernelSlot, vat_id: VatId) -> Result<(), KeeperError> {
        self.require_unresolved(kpid)?;
        let subscribers_key = key(kpid, "subscribers");
        let raw = self.store.get(&subscribers_key)?.unwrap_or_default();
        let mut subscribers =
            parse_subscribers(&raw).map_err(|e| KeeperError::corrupt(&subscribers_key, e))?;
        subscribers.insert(vat_id);
        let joined = subscribers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.store.set(&subscribers_key, &joined)?;
        Ok(())
    }

    /// Park a message on an unresolved promise. The queue holds its own
    /// reachable count on every slot of the message.
    pub fn add_message_to_promise_queue(
        &mut self,
        kpid: KernelSlot,
        msg: &KernelMessage,
    ) -> Result<(), KeeperError> {
        self.require_unresolved(kpid)?;
        for slot in msg.slots() {
            self.increment_ref_count(*slot, RefKind::Reachable)?;
        }
        let n = self.allocate_id(&key(kpid, "queue.nextID"))?;
        self.set_json(&key(kpid, &format!("queue.{n}")), msg)
    }

    fn promise_queue(&self, kpid: KernelSlot) -> Result<Vec<KernelMessage>, KeeperError> {
        let prefix = format!("{kpid}.queue.");
        let len = self.get_u64(&key(kpid, "queue.nextID"))?.unwrap_or(0);
        let mut queue = Vec::with_capacity(len as usize);
        for n in 0..len {
            let item_key = format!("{prefix}{n}");
            let msg = self
                .get_json(&item_key)?
                .ok_or_else(|| KeeperError::corrupt(&item_key, "missing queued message"))?;
            queue.push(msg);
        }
        Ok(queue)
    }

    fn require_unresolved(&self, kpid: KernelSlot) -> Result<(), KeeperError> {
        match self.store.get(&key(kpid, "state"))?.as_deref() {
            Some("unresolved") => Ok(()),
            Some(_) => Err(KeeperError::AlreadyResolved(kpid)),
            None => Err(KeeperError::UnknownKref(kpid)),
        }
    }

    /// Settle a promise.
    ///
    /// The settlement data's slots gain a reachable holder. Messages that
    /// were waiting on the promise move to the tail of the run-queue,
    /// still addressed to the promise. The decider and subscriber set are
    /// cleared; subscribers are returned so the caller can notify them.
    /// Settling twice is [`KeeperError::AlreadyResolved`].
    pub fn resolve_kernel_promise(
        &mut self,
        kpid: KernelSlot,
        rejected: bool,
        data: &KernelCapData,
    ) -> Result<Settlement, KeeperError> {
        let PromiseState::Unresolved {
            subscribers, queue, ..
        } = self.get_kernel_promise(kpid)?.state
        else {
            return Err(KeeperError::AlreadyResolved(kpid));
        };

        for slot in &data.slots {
            self.increment_ref_count(*slot, RefKind::Reachable)?;
        }
        self.drain_promise_queue(kpid, &queue)?;
        self.store.delete(&key(kpid, "queue.nextID"))?;
        self.store.delete(&key(kpid, "decider"))?;
        self.store.delete(&key(kpid, "subscribers"))?;
        self.store.set(
            &key(kpid, "state"),
            if rejected { "rejected" } else { "fulfilled" },
        )?;
        self.set_json(&key(kpid, "data"), data)?;
        Ok(Settlement { subscribers, queue })
    }

    /// Move every message waiting on an unresolved promise back to the
    /// run-queue, leaving the promise unresolved with an empty queue.
    /// Used when the decider accepts pipelined messages.
    pub fn requeue_kernel_promise(&mut self, kpid: KernelSlot) -> Result<usize, KeeperError> {
        self.require_unresolved(kpid)?;
        let queue = self.promise_queue(kpid)?;
        if queue.is_empty() {
            return Ok(0);
        }
        self.drain_promise_queue(kpid, &queue)?;
        self.store.set(&key(kpid, "queue.nextID"), "0")?;
        Ok(queue.len())
    }

    fn drain_promise_queue(&mut self, kpid: KernelSlot, queue: &[KernelMessage]) -> Result<(), KeeperError> {
        for (n, msg) in queue.iter().enumerate() {
            self.store.delete(&key(kpid, &format!("queue.{n}")))?;
            self.enqueue(&RunQueueEvent::Send {
                target: kpid,
                msg: msg.clone(),
            })?;
            for slot in msg.slots() {
                self.decrement_ref_count(*slot, RefKind::Reachable)?;
            }
        }
        Ok(())
    }

    /// Remove a promise from the table. Does not touch refcounts of its
    /// settlement data; see [`process_refcounts`](Self::process_refcounts).
    pub fn delete_kernel_promise(&mut self, kpid: KernelSlot) -> Result<(), KeeperError> {
        let queue_len = self.get_u64(&key(kpid, "queue.nextID"))?.unwrap_or(0);
        for n in 0..queue_len {
            self.store.delete(&key(kpid, &format!("queue.{n}")))?;
        }
        for field in ["state", "refCount", "decider", "subscribers", "queue.nextID", "data"] {
            self.store.delete(&key(kpid, field))?;
        }
        Ok(())
    }

    /// Every promise in the table, in kpid order.
    pub fn kernel_promises(&self) -> Result<Vec<KernelSlot>, KeeperError> {
        let mut kpids = Vec::new();
        for k in self.store.keys_with_prefix("kp")? {
            if let Some(id) = k.strip_suffix(".state") {
                kpids.push(id.parse().map_err(|e: String| KeeperError::corrupt(&k, e))?);
            }
        }
        kpids.sort();
        Ok(kpids)
    }

    /// Unresolved promises the vat decides, found through its c-list.
    pub fn enumerate_promises_by_decider(&self, vat_id: VatId) -> Result<Vec<KernelSlot>, KeeperError> {
        let mut found = Vec::new();
        for entry in self.clist_entries(vat_id)? {
            if !entry.kref.is_promise() {
                continue;
            }
            if self.decider(entry.kref)? == Some(vat_id) {
                found.push(entry.kref);
            }
        }
        Ok(found)
    }
}
