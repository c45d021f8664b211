//! The `timer` device
//!
//! Vats schedule wakeups with
//! `callNow(timer, "setWakeup", [when, handler])` and cancel them with
//! `callNow(timer, "removeWakeup", [handler])`. The chain's block time is
//! the only clock: the block manager polls the [`TimerSchedule`] with it
//! and sends `wake(when)` to every handler whose time has come.
//!
//! ```text
//!   vat ── setWakeup ──▶ TimerDevice ──▶ TimerSchedule ◀── poll(block_time) ── BlockManager
//!                          (pins handler)                                          │
//!   handler ◀────────────────────── wake(when) ───────────────────────────────────┘
//! ```
//!
//! Handlers stay pinned in the kernel while scheduled. Like the bridge
//! outbox, the schedule is not part of a crank's savepoint.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use swing_kernel::Device;
use swing_kernel_core::{KernelCapData, KernelSlot};
use swing_vat::CapData;
use tracing::debug;

/// Name the timer device is registered under.
pub const TIMER_DEVICE: &str = "timer";

/// A due wakeup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Wakeup {
    /// Time the wakeup was scheduled for.
    pub when: u64,
    /// Object to send `wake(when)` to.
    pub handler: KernelSlot,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleState {
    last_polled: u64,
    wakeups: BTreeMap<u64, Vec<KernelSlot>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    released: Vec<KernelSlot>,
}

/// Wakeups shared between the timer device and the block manager.
#[derive(Clone, Debug, Default)]
pub struct TimerSchedule {
    state: Rc<RefCell<ScheduleState>>,
}

impl TimerSchedule {
    /// Create an empty schedule.
    pub fn new() -> Self {
        Self::default()
    }

    /// Time of the last poll.
    pub fn last_polled(&self) -> u64 {
        self.state.borrow().last_polled
    }

    /// Number of scheduled wakeups.
    pub fn pending(&self) -> usize {
        self.state.borrow().wakeups.values().map(Vec::len).sum()
    }

    /// Advance the clock to `now` and take every wakeup due by then, in
    /// time order. The clock never moves backwards.
    pub fn poll(&self, now: u64) -> Vec<Wakeup> {
        let mut state = self.state.borrow_mut();
        state.last_polled = state.last_polled.max(now);
        let later = state.wakeups.split_off(&now.saturating_add(1));
        let due = std::mem::replace(&mut state.wakeups, later);
        due.into_iter()
            .flat_map(|(when, handlers)| handlers.into_iter().map(move |handler| Wakeup { when, handler }))
            .collect()
    }

    /// Handlers whose wakeups were cancelled since the last call.
    pub fn take_released(&self) -> Vec<KernelSlot> {
        std::mem::take(&mut self.state.borrow_mut().released)
    }

    /// Serialized form for host state.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&*self.state.borrow())
    }

    /// Replace the schedule with a serialized one.
    pub fn restore(&self, json: &str) -> Result<(), serde_json::Error> {
        *self.state.borrow_mut() = serde_json::from_str(json)?;
        Ok(())
    }

    fn set_wakeup(&self, when: u64, handler: KernelSlot) {
        self.state.borrow_mut().wakeups.entry(when).or_default().push(handler);
    }

    fn remove_wakeups(&self, handler: KernelSlot) -> usize {
        let mut state = self.state.borrow_mut();
        let mut removed = 0;
        state.wakeups.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|h| *h != handler);
            removed += before - handlers.len();
            !handlers.is_empty()
        });
        for _ in 0..removed {
            state.released.push(handler);
        }
        removed
    }
}

/// Device view of a [`TimerSchedule`].
pub struct TimerDevice {
    schedule: TimerSchedule,
}

impl TimerDevice {
    /// Timer backed by `schedule`.
    pub fn new(schedule: TimerSchedule) -> Self {
        Self { schedule }
    }
}

fn handler_of(args: &KernelCapData) -> Result<KernelSlot, String> {
    match args.slots.as_slice() {
        [handler] if handler.is_object() => Ok(*handler),
        _ => Err("expected exactly one handler object".to_string()),
    }
}

impl Device for TimerDevice {
    fn invoke(&mut self, method: &str, args: &KernelCapData) -> Result<KernelCapData, String> {
        let body = args.body_json().map_err(|e| e.to_string())?;
        match method {
            "getLastPolled" => Ok(CapData::plain(&Value::from(self.schedule.last_polled()))),
            "setWakeup" => {
                let when = body[0]
                    .as_u64()
                    .ok_or_else(|| "setWakeup takes [when, handler]".to_string())?;
                let handler = handler_of(args)?;
                debug!(when, %handler, "timer wakeup set");
                self.schedule.set_wakeup(when, handler);
                Ok(CapData::plain(&Value::from(when)))
            }
            "removeWakeup" => {
                let handler = handler_of(args)?;
                let removed = self.schedule.remove_wakeups(handler);
                debug!(%handler, removed, "timer wakeups removed");
                Ok(CapData::plain(&Value::from(removed)))
            }
            _ => Err(format!("timer has no method {method:?}")),
        }
    }

    fn retains_arguments(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use swing_vat::slot_marker;

    fn wakeup_args(when: u64, handler: KernelSlot) -> KernelCapData {
        CapData::from_json(&json!([when, slot_marker(0)]), vec![handler])
    }

    #[test]
    fn test_poll_takes_due_wakeups_in_time_order() {
        let schedule = TimerSchedule::new();
        let mut timer = TimerDevice::new(schedule.clone());
        timer.invoke("setWakeup", &wakeup_args(30, KernelSlot::Object(3))).unwrap();
        timer.invoke("setWakeup", &wakeup_args(10, KernelSlot::Object(1))).unwrap();
        timer.invoke("setWakeup", &wakeup_args(20, KernelSlot::Object(2))).unwrap();

        assert!(schedule.poll(9).is_empty());
        let due = schedule.poll(20);
        assert_eq!(
            due,
            vec![
                Wakeup { when: 10, handler: KernelSlot::Object(1) },
                Wakeup { when: 20, handler: KernelSlot::Object(2) },
            ]
        );
        assert_eq!(schedule.pending(), 1);
        assert_eq!(schedule.last_polled(), 20);

        // an older block time does not rewind the clock
        schedule.poll(5);
        let read = timer.invoke("getLastPolled", &CapData::plain(&json!([]))).unwrap();
        assert_eq!(read.body_json().unwrap(), json!(20));
    }

    #[test]
    fn test_remove_wakeup_releases_handler() {
        let schedule = TimerSchedule::new();
        let mut timer = TimerDevice::new(schedule.clone());
        let handler = KernelSlot::Object(4);
        timer.invoke("setWakeup", &wakeup_args(10, handler)).unwrap();
        timer.invoke("setWakeup", &wakeup_args(50, handler)).unwrap();
        let removed = timer
            .invoke("removeWakeup", &CapData::from_json(&json!([slot_marker(0)]), vec![handler]))
            .unwrap();
        assert_eq!(removed.body_json().unwrap(), json!(2));
        assert_eq!(schedule.take_released(), vec![handler, handler]);
        assert!(schedule.poll(100).is_empty());
    }

    #[test]
    fn test_schedule_survives_serialization() {
        let schedule = TimerSchedule::new();
        let mut timer = TimerDevice::new(schedule.clone());
        timer.invoke("setWakeup", &wakeup_args(7, KernelSlot::Object(9))).unwrap();
        schedule.poll(3);

        let restored = TimerSchedule::new();
        restored.restore(&schedule.to_json().unwrap()).unwrap();
        assert_eq!(restored.last_polled(), 3);
        assert_eq!(restored.poll(7), vec![Wakeup { when: 7, handler: KernelSlot::Object(9) }]);
    }

    #[test]
    fn test_malformed_calls_refused() {
        let mut timer = TimerDevice::new(TimerSchedule::new());
        assert!(timer.invoke("setWakeup", &CapData::plain(&json!([5]))).is_err());
        assert!(timer
            .invoke("setWakeup", &CapData::from_json(&json!(["soon", slot_marker(0)]), vec![KernelSlot::Object(1)]))
            .is_err());
        assert!(timer
            .invoke("setWakeup", &wakeup_args(5, KernelSlot::Device(1)))
            .is_err());
        assert!(timer.invoke("tick", &CapData::plain(&json!([]))).is_err());
    }
}
