//! Transcript entries, replay and NDJSON export
//!
//! Every delivery a vat receives is recorded as one transcript entry:
//! the delivery, each syscall it made with the result the kernel gave
//! back, and the delivery result. Bringing a worker back online replays
//! the entries of the current span against a fresh worker; the
//! [`ReplayHandler`] answers each syscall from the record and flags the
//! first one that differs.
//!
//! ```text
//!   record:  deliver(d) ──► syscall s1 ──► kernel ──► r1 ──► ... ──► result
//!                                   │                   │
//!                                   ▼                   ▼
//!                       { d, sc: [{s: s1, r: r1}, ...], r: result }
//!
//!   replay:  deliver(d) ──► syscall s1' ──► s1' == s1 ? r1 : divergence
//! ```

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use swing_kernel_core::KernelKeeper;
use swing_vat::{
    DeliveryResult, SyscallHandler, VatDelivery, VatId, VatSyscall, VatSyscallResult, VatWorker,
    WorkerFactory,
};
use tracing::debug;

use crate::error::KernelError;

/// One syscall and the answer it got.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallRecord {
    /// The syscall, in vat refs.
    pub s: VatSyscall,
    /// What the kernel returned.
    pub r: VatSyscallResult,
}

/// One stored transcript item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// The delivery, in vat refs.
    pub d: VatDelivery,
    /// Syscalls made during the delivery, in order.
    pub sc: Vec<SyscallRecord>,
    /// How the delivery ended.
    pub r: DeliveryResult,
}

impl TranscriptEntry {
    /// Decode a stored item.
    pub fn parse(vat_id: VatId, position: u64, raw: &str) -> Result<Self, KernelError> {
        serde_json::from_str(raw).map_err(|e| {
            KernelError::Keeper(swing_kernel_core::KeeperError::corrupt(
                &format!("{vat_id}.transcript.{position}"),
                e,
            ))
        })
    }
}

/// Answers syscalls from a recorded entry during replay.
pub struct ReplayHandler<'a> {
    expected: &'a [SyscallRecord],
    next: usize,
    divergence: Option<String>,
}

impl<'a> ReplayHandler<'a> {
    /// Replay against the syscalls of one entry.
    pub fn new(expected: &'a [SyscallRecord]) -> Self {
        Self {
            expected,
            next: 0,
            divergence: None,
        }
    }

    /// First difference found, including syscalls the worker failed to
    /// make.
    pub fn finish(self) -> Option<String> {
        if self.divergence.is_some() {
            return self.divergence;
        }
        if self.next < self.expected.len() {
            return Some(format!(
                "worker made {} syscalls, transcript records {}",
                self.next,
                self.expected.len()
            ));
        }
        None
    }
}

impl SyscallHandler for ReplayHandler<'_> {
    fn syscall(&mut self, call: &VatSyscall) -> VatSyscallResult {
        if self.divergence.is_some() {
            return VatSyscallResult::Error("replay diverged".to_string());
        }
        let index = self.next;
        self.next += 1;
        match self.expected.get(index) {
            Some(record) if record.s == *call => record.r.clone(),
            Some(record) => {
                self.divergence = Some(format!(
                    "syscall {index}: expected {}, got {}",
                    record.s.kind(),
                    describe(call)
                ));
                VatSyscallResult::Error("replay diverged".to_string())
            }
            None => {
                self.divergence = Some(format!("syscall {index}: unexpected extra {}", describe(call)));
                VatSyscallResult::Error("replay diverged".to_string())
            }
        }
    }
}

fn describe(call: &VatSyscall) -> String {
    serde_json::to_string(call).unwrap_or_else(|_| call.kind().to_string())
}

/// Replay one entry against a worker, returning the divergence if any.
pub fn replay_entry(worker: &mut dyn VatWorker, entry: &TranscriptEntry) -> Option<String> {
    let mut handler = ReplayHandler::new(&entry.sc);
    let result = worker.deliver(&entry.d, &mut handler);
    let divergence = handler.finish();
    if divergence.is_some() {
        return divergence;
    }
    if result.status != entry.r.status {
        return Some(format!(
            "delivery status {:?}, transcript records {:?}",
            result.status, entry.r.status
        ));
    }
    None
}

// ============================================================================
// NDJSON export
// ============================================================================

/// First line of an exported transcript.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVatLine {
    /// Always `"create-vat"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Vat the transcript belongs to.
    #[serde(rename = "vatID")]
    pub vat_id: VatId,
    /// Bundle of the exported incarnation.
    pub vat_source_bundle: String,
    /// Parameters of the incarnation's `startVat`, if it is in the export.
    pub vat_parameters: Value,
}

/// Every later line of an exported transcript.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryLine {
    /// Transcript position.
    pub transcript_num: u64,
    /// The delivery.
    pub d: VatDelivery,
    /// Syscalls with their results.
    pub syscalls: Vec<SyscallRecord>,
    /// Delivery result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<DeliveryResult>,
}

/// Write the current incarnation of a vat's transcript as NDJSON.
/// Returns the number of deliveries written.
pub fn export_transcript(
    keeper: &KernelKeeper,
    vat_id: VatId,
    out: &mut dyn Write,
) -> Result<u64, KernelError> {
    let vat = vat_id.to_string();
    let start = keeper.incarnation_start(vat_id)?;
    let end = keeper.store().current_span_bounds(&vat)?.end_pos;
    let items = keeper.store().read_transcript_range(&vat, start, end)?;

    let mut entries = Vec::with_capacity(items.len());
    for (position, raw) in &items {
        entries.push((*position, TranscriptEntry::parse(vat_id, *position, raw)?));
    }
    let vat_parameters = entries
        .iter()
        .find_map(|(_, e)| match &e.d {
            VatDelivery::StartVat { vat_parameters } => serde_json::to_value(vat_parameters).ok(),
            _ => None,
        })
        .unwrap_or(Value::Null);
    let header = CreateVatLine {
        kind: "create-vat".to_string(),
        vat_id,
        vat_source_bundle: keeper.vat_source(vat_id)?.to_string(),
        vat_parameters,
    };
    writeln!(out, "{}", serde_json::to_string(&header)?)?;

    for (position, entry) in entries {
        let line = DeliveryLine {
            transcript_num: position,
            d: entry.d,
            syscalls: entry.sc,
            result: Some(entry.r),
        };
        writeln!(out, "{}", serde_json::to_string(&line)?)?;
    }
    Ok(items.len() as u64)
}

/// Summary of a successful file replay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayReport {
    /// Vat named in the file header.
    pub vat_id: VatId,
    /// Deliveries replayed.
    pub deliveries: u64,
}

/// Replay an exported transcript against a fresh worker started from
/// `bundle`. Fails with [`KernelError::Anachrophobia`] at the first
/// divergent delivery.
pub fn replay_transcript<F: WorkerFactory>(
    input: impl BufRead,
    factory: &F,
    bundle: &[u8],
) -> Result<ReplayReport, KernelError> {
    let mut lines = input.lines();
    let header_text = lines
        .next()
        .ok_or_else(|| KernelError::config("empty transcript file"))??;
    let header: CreateVatLine = serde_json::from_str(&header_text)?;
    if header.kind != "create-vat" {
        return Err(KernelError::config(format!(
            "transcript starts with {:?}, not create-vat",
            header.kind
        )));
    }
    let vat_id = header.vat_id;
    let mut worker = factory
        .start_worker(vat_id, bundle, None)
        .map_err(|source| KernelError::Worker { vat_id, source })?;

    let mut deliveries = 0;
    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let item: DeliveryLine = serde_json::from_str(&line)?;
        let mut handler = ReplayHandler::new(&item.syscalls);
        let result = worker.deliver(&item.d, &mut handler);
        let mut divergence = handler.finish();
        if divergence.is_none() {
            if let Some(expected) = &item.result {
                if expected.status != result.status {
                    divergence = Some(format!(
                        "delivery status {:?}, transcript records {:?}",
                        result.status, expected.status
                    ));
                }
            }
        }
        if let Some(detail) = divergence {
            worker.shutdown();
            return Err(KernelError::Anachrophobia {
                vat_id,
                position: item.transcript_num,
                detail,
            });
        }
        deliveries += 1;
    }
    worker.shutdown();
    debug!(vat_id = %vat_id, deliveries, "transcript replay matched");
    Ok(ReplayReport { vat_id, deliveries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use swing_vat::{CapData, LocalWorkerFactory, Message, FnWorker, VatSlot};

    fn vatstore_get(key: &str) -> VatSyscall {
        VatSyscall::VatstoreGet { key: key.into() }
    }

    fn ping() -> VatDelivery {
        VatDelivery::Message {
            target: VatSlot::ROOT,
            msg: Message::new("ping", CapData::plain(&json!([])), None),
        }
    }

    #[test]
    fn test_replay_handler_returns_recorded_results() {
        let records = vec![SyscallRecord {
            s: vatstore_get("a"),
            r: VatSyscallResult::Ok(swing_vat::SyscallValue::Text(Some("1".into()))),
        }];
        let mut handler = ReplayHandler::new(&records);
        assert_eq!(handler.syscall(&vatstore_get("a")).text(), Some("1"));
        assert_eq!(handler.finish(), None);
    }

    #[test]
    fn test_replay_handler_flags_mismatch_and_shortfall() {
        let records = vec![
            SyscallRecord {
                s: vatstore_get("a"),
                r: VatSyscallResult::ok(),
            },
            SyscallRecord {
                s: vatstore_get("b"),
                r: VatSyscallResult::ok(),
            },
        ];
        let mut handler = ReplayHandler::new(&records);
        assert!(handler.syscall(&vatstore_get("x")).is_error());
        assert!(handler.finish().unwrap().contains("syscall 0"));

        let mut handler = ReplayHandler::new(&records);
        handler.syscall(&vatstore_get("a"));
        assert!(handler.finish().unwrap().contains("made 1 syscalls"));
    }

    #[test]
    fn test_replay_file_detects_mutated_syscall() {
        let mut factory = LocalWorkerFactory::new();
        let bundle = factory.register("reader", || {
            FnWorker::new(|_d: &VatDelivery, sys: &mut dyn SyscallHandler| {
                sys.syscall(&VatSyscall::VatstoreGet { key: "count".into() });
                DeliveryResult::ok()
            })
        });
        let header = json!({
            "type": "create-vat",
            "vatID": "v1",
            "vatSourceBundle": "b1-00",
            "vatParameters": null,
        });
        let good = DeliveryLine {
            transcript_num: 0,
            d: ping(),
            syscalls: vec![SyscallRecord {
                s: vatstore_get("count"),
                r: VatSyscallResult::Ok(swing_vat::SyscallValue::Text(None)),
            }],
            result: Some(DeliveryResult::ok()),
        };
        let mut bad = good.clone();
        bad.transcript_num = 1;
        bad.syscalls[0].s = vatstore_get("tampered");

        let file = format!(
            "{}\n{}\n",
            header,
            serde_json::to_string(&good).unwrap()
        );
        let report = replay_transcript(file.as_bytes(), &factory, &bundle.to_bytes()).unwrap();
        assert_eq!(report.deliveries, 1);
        assert_eq!(report.vat_id, VatId(1));

        let file = format!(
            "{}\n{}\n{}\n",
            header,
            serde_json::to_string(&good).unwrap(),
            serde_json::to_string(&bad).unwrap()
        );
        let err = replay_transcript(file.as_bytes(), &factory, &bundle.to_bytes()).unwrap_err();
        assert!(matches!(err, KernelError::Anachrophobia { position: 1, .. }));
    }
}
