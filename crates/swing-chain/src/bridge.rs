//! The `bridge` device
//!
//! Vats reach the chain through `callNow(bridge, "send", [destination, body])`.
//! Sends are collected in an [`Outbox`] shared with the block manager,
//! which hands them to the chain at the end of the block.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use swing_kernel::Device;
use swing_kernel_core::KernelCapData;
use swing_vat::CapData;
use tracing::debug;

/// Name the bridge device is registered under.
pub const BRIDGE_DEVICE: &str = "bridge";

/// One chain-directed effect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSend {
    /// Chain module the send is for.
    pub destination: String,
    /// Payload.
    pub body: Value,
}

/// Sends produced since the outbox was last drained.
///
/// The outbox is outside the kernel store, so it is not part of a crank's
/// savepoint: a crank that calls the bridge and then aborts still leaves
/// its sends here for the block's output.
#[derive(Clone, Debug, Default)]
pub struct Outbox {
    sends: Rc<RefCell<Vec<ChainSend>>>,
}

impl Outbox {
    /// Create an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every pending send.
    pub fn drain(&self) -> Vec<ChainSend> {
        self.sends.borrow_mut().drain(..).collect()
    }

    /// Number of pending sends.
    pub fn len(&self) -> usize {
        self.sends.borrow().len()
    }

    /// Check whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, send: ChainSend) {
        self.sends.borrow_mut().push(send);
    }
}

/// SHA-256 over the canonical JSON of `sends`, hex encoded.
pub fn sends_hash(sends: &[ChainSend]) -> Result<String, serde_json::Error> {
    Ok(hex::encode(Sha256::digest(serde_json::to_vec(sends)?)))
}

/// Device that turns vat calls into [`ChainSend`]s.
pub struct BridgeDevice {
    outbox: Outbox,
}

impl BridgeDevice {
    /// Bridge feeding `outbox`.
    pub fn new(outbox: Outbox) -> Self {
        Self { outbox }
    }
}

impl Device for BridgeDevice {
    fn invoke(&mut self, method: &str, args: &KernelCapData) -> Result<KernelCapData, String> {
        if method != "send" {
            return Err(format!("bridge has no method {method:?}"));
        }
        if !args.slots.is_empty() {
            return Err("capabilities cannot be sent to the chain".to_string());
        }
        let body = args.body_json().map_err(|e| e.to_string())?;
        let (destination, body) = match body {
            Value::Array(mut parts) if parts.len() == 2 => {
                let body = parts.pop().unwrap_or(Value::Null);
                match parts.pop() {
                    Some(Value::String(destination)) => (destination, body),
                    _ => return Err("send destination must be a string".to_string()),
                }
            }
            _ => return Err("send takes [destination, body]".to_string()),
        };
        debug!(%destination, "chain send");
        self.outbox.push(ChainSend { destination, body });
        Ok(CapData::plain(&Value::Null))
    }
}
