//! Block actions as the chain sends them

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ChainParams;

/// Height and time of the block an action belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    /// Block height.
    pub block_height: u64,
    /// Block time, seconds since the epoch.
    pub block_time: u64,
    /// Metering for this block; `BEGIN_BLOCK` only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ChainParams>,
}

impl BlockInfo {
    /// Block at `height` and `time` with no parameters.
    pub fn new(block_height: u64, block_time: u64) -> Self {
        Self {
            block_height,
            block_time,
            params: None,
        }
    }

    /// Attach block parameters.
    pub fn with_params(mut self, params: ChainParams) -> Self {
        self.params = Some(params);
        self
    }
}

/// Which queue an inbound action waits in. `END_BLOCK` drains them in
/// declaration order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InboundQueue {
    /// Must finish in this block: the block runs without a compute limit
    /// and nothing else is taken.
    Forced,
    /// Taken before the timer and the normal queue.
    Priority,
    /// Normal actions.
    #[default]
    Inbound,
}

impl InboundQueue {
    fn is_inbound(&self) -> bool {
        *self == InboundQueue::Inbound
    }
}

/// A chain-originated action for a handler vat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundAction {
    /// Routing key in the bridge table.
    pub kind: String,
    /// Payload, delivered as `inbound(kind, body)`.
    pub body: Value,
    /// Queue the action is taken from.
    #[serde(default, skip_serializing_if = "InboundQueue::is_inbound")]
    pub queue: InboundQueue,
}

impl InboundAction {
    /// Create a normal action.
    pub fn new(kind: impl Into<String>, body: Value) -> Self {
        Self {
            kind: kind.into(),
            body,
            queue: InboundQueue::Inbound,
        }
    }

    /// Create an action for the priority queue.
    pub fn priority(kind: impl Into<String>, body: Value) -> Self {
        Self::new(kind, body).in_queue(InboundQueue::Priority)
    }

    /// Create an action that must run in this block.
    pub fn forced(kind: impl Into<String>, body: Value) -> Self {
        Self::new(kind, body).in_queue(InboundQueue::Forced)
    }

    /// Move the action to `queue`.
    pub fn in_queue(mut self, queue: InboundQueue) -> Self {
        self.queue = queue;
        self
    }
}

/// One step of the block cycle.
///
/// ```text
/// BEGIN_BLOCK ──▶ INBOUND* ──▶ END_BLOCK ──▶ COMMIT_BLOCK ──▶ BEGIN_BLOCK ...
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockAction {
    /// Record the block being started.
    BeginBlock(BlockInfo),
    /// Queue work for the block.
    Inbound(InboundAction),
    /// Run the block.
    EndBlock(BlockInfo),
    /// Persist the block's results.
    CommitBlock(BlockInfo),
}

impl BlockAction {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BlockAction::BeginBlock(_) => "BEGIN_BLOCK",
            BlockAction::Inbound(_) => "INBOUND",
            BlockAction::EndBlock(_) => "END_BLOCK",
            BlockAction::CommitBlock(_) => "COMMIT_BLOCK",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_actions_parse_from_chain_json() {
        let begin: BlockAction = serde_json::from_value(json!({
            "type": "BEGIN_BLOCK",
            "blockHeight": 7,
            "blockTime": 1700,
            "params": { "beansPerUnit": { "blockComputeLimit": 10 } }
        }))
        .unwrap();
        let BlockAction::BeginBlock(info) = begin else {
            panic!("wrong variant");
        };
        assert_eq!(info.block_height, 7);
        assert_eq!(info.params.unwrap().beans_per_unit["blockComputeLimit"], 10);

        let inbound: BlockAction =
            serde_json::from_value(json!({ "type": "INBOUND", "kind": "bank", "body": [1] })).unwrap();
        assert_eq!(inbound, BlockAction::Inbound(InboundAction::new("bank", json!([1]))));
        assert_eq!(inbound.kind(), "INBOUND");

        let urgent: BlockAction = serde_json::from_value(json!({
            "type": "INBOUND", "kind": "bank", "body": null, "queue": "priority"
        }))
        .unwrap();
        assert_eq!(urgent, BlockAction::Inbound(InboundAction::priority("bank", Value::Null)));
    }

    #[test]
    fn test_normal_queue_is_left_implicit() {
        let v = serde_json::to_value(InboundAction::new("bank", json!(1))).unwrap();
        assert_eq!(v, json!({ "kind": "bank", "body": 1 }));
        let v = serde_json::to_value(InboundAction::forced("bank", json!(1))).unwrap();
        assert_eq!(v["queue"], "forced");
    }

    #[test]
    fn test_commit_serializes_without_params() {
        let v = serde_json::to_value(BlockAction::CommitBlock(BlockInfo::new(3, 30))).unwrap();
        assert_eq!(v, json!({ "type": "COMMIT_BLOCK", "blockHeight": 3, "blockTime": 30 }));
    }
}
