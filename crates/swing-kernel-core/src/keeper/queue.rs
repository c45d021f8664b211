//! The run-queue
//!
//! Stored as `runQueue = [head, tail]` plus one `runQueue.<N>` entry per
//! event. Events hold refcounts on every kref they mention from the moment
//! they are enqueued until the crank that consumes them releases them.

use tracing::trace;

use super::objects::RefKind;
use super::KernelKeeper;
use crate::error::KeeperError;
use crate::types::RunQueueEvent;

const RUN_QUEUE_KEY: &str = "runQueue";

impl KernelKeeper {
    fn run_queue_bounds(&self) -> Result<(u64, u64), KeeperError> {
        let bounds: [u64; 2] = self
            .get_json(RUN_QUEUE_KEY)?
            .ok_or_else(|| KeeperError::corrupt(RUN_QUEUE_KEY, "missing"))?;
        Ok((bounds[0], bounds[1]))
    }

    /// Append an event and take its refcounts.
    pub fn enqueue(&mut self, event: &RunQueueEvent) -> Result<(), KeeperError> {
        for kref in event.held_refs() {
            self.increment_ref_count(kref, RefKind::Reachable)?;
        }
        self.push_raw(event)
    }

    /// Append an event whose refcounts are already held, such as a message
    /// leaving a settled promise's queue.
    pub fn push_raw(&mut self, event: &RunQueueEvent) -> Result<(), KeeperError> {
        let (head, tail) = self.run_queue_bounds()?;
        self.set_json(&format!("{RUN_QUEUE_KEY}.{tail}"), event)?;
        self.set_json(RUN_QUEUE_KEY, &[head, tail + 1])?;
        trace!(kind = event.kind(), position = tail, "enqueued");
        Ok(())
    }

    /// Remove the oldest event. Its refcounts stay held; the caller
    /// releases them with [`release_event_refs`](Self::release_event_refs).
    pub fn pop_run_queue(&mut self) -> Result<Option<RunQueueEvent>, KeeperError> {
        let (head, tail) = self.run_queue_bounds()?;
        if head == tail {
            return Ok(None);
        }
        let key = format!("{RUN_QUEUE_KEY}.{head}");
        let event = self
            .get_json(&key)?
            .ok_or_else(|| KeeperError::corrupt(&key, "missing queued event"))?;
        self.store.delete(&key)?;
        self.set_json(RUN_QUEUE_KEY, &[head + 1, tail])?;
        Ok(Some(event))
    }

    /// Events waiting on the run-queue.
    pub fn run_queue_length(&self) -> Result<u64, KeeperError> {
        let (head, tail) = self.run_queue_bounds()?;
        Ok(tail - head)
    }

    /// Snapshot of the run-queue in delivery order.
    pub fn run_queue_events(&self) -> Result<Vec<RunQueueEvent>, KeeperError> {
        let (head, tail) = self.run_queue_bounds()?;
        (head..tail)
            .map(|n| {
                let key = format!("{RUN_QUEUE_KEY}.{n}");
                self.get_json(&key)?
                    .ok_or_else(|| KeeperError::corrupt(&key, "missing queued event"))
            })
            .collect()
    }

    /// Drop the refcounts an event held while queued.
    pub fn release_event_refs(&mut self, event: &RunQueueEvent) -> Result<(), KeeperError> {
        for kref in event.held_refs() {
            self.decrement_ref_count(kref, RefKind::Reachable)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::fresh_keeper;
    use super::*;
    use crate::types::KernelSlot;
    use swing_vat::{CapData, Message, VatId};

    fn send(target: KernelSlot, method: &str) -> RunQueueEvent {
        RunQueueEvent::Send {
            target,
            msg: Message::new(method, CapData::new("[]", vec![]), None),
        }
    }

    #[test]
    fn test_run_queue_is_fifo() {
        let mut keeper = fresh_keeper();
        let ko = keeper.add_kernel_object(VatId(1)).unwrap();
        keeper.enqueue(&send(ko, "first")).unwrap();
        keeper.enqueue(&send(ko, "second")).unwrap();
        assert_eq!(keeper.run_queue_length().unwrap(), 2);

        assert_eq!(keeper.pop_run_queue().unwrap(), Some(send(ko, "first")));
        assert_eq!(keeper.pop_run_queue().unwrap(), Some(send(ko, "second")));
        assert_eq!(keeper.pop_run_queue().unwrap(), None);
    }

    #[test]
    fn test_queued_event_holds_refs_until_released() {
        let mut keeper = fresh_keeper();
        let ko = keeper.add_kernel_object(VatId(1)).unwrap();
        keeper.enqueue(&send(ko, "ping")).unwrap();
        assert_eq!(keeper.object_ref_count(ko).unwrap().reachable, 1);

        let event = keeper.pop_run_queue().unwrap().unwrap();
        assert_eq!(keeper.object_ref_count(ko).unwrap().reachable, 1);
        keeper.release_event_refs(&event).unwrap();
        assert_eq!(keeper.object_ref_count(ko).unwrap().reachable, 0);
    }
}
