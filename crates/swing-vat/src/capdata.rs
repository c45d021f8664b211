//! Capability data: a JSON body plus an ordered list of slots
//!
//! The body refers to slot `i` with the marker `{"@qclass":"slot","index":i}`.
//! The same shape is used on both sides of the vat boundary; only the
//! slot type changes (vrefs inside a vat, krefs inside the kernel).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Serialized data with embedded capability references.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData<S> {
    /// JSON text.
    pub body: String,
    /// References, addressed positionally from the body.
    pub slots: Vec<S>,
}

impl<S> CapData<S> {
    /// Wrap a body and slots.
    pub fn new(body: impl Into<String>, slots: Vec<S>) -> Self {
        Self {
            body: body.into(),
            slots,
        }
    }

    /// Encode a JSON value with the given slots.
    pub fn from_json(value: &Value, slots: Vec<S>) -> Self {
        Self {
            body: value.to_string(),
            slots,
        }
    }

    /// Body with no slots.
    pub fn plain(value: &Value) -> Self {
        Self::from_json(value, Vec::new())
    }

    /// Data carrying one reference and nothing else.
    pub fn single_slot(slot: S) -> Self {
        Self::from_json(&slot_marker(0), vec![slot])
    }

    /// `undefined`-equivalent empty data.
    pub fn empty() -> Self {
        Self::plain(&Value::Null)
    }

    /// Kernel-generated error value.
    pub fn error(message: &str) -> Self {
        Self::plain(&json!({
            "@qclass": "error",
            "name": "Error",
            "message": message,
        }))
    }

    /// Parse the body.
    pub fn body_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    /// If the body is exactly one slot marker, return that slot.
    pub fn as_single_slot(&self) -> Option<&S> {
        if self.slots.len() != 1 {
            return None;
        }
        match self.body_json() {
            Ok(v) if v == slot_marker(0) => self.slots.first(),
            _ => None,
        }
    }

    /// Translate every slot, keeping the body.
    pub fn try_map_slots<T, E>(&self, mut f: impl FnMut(&S) -> Result<T, E>) -> Result<CapData<T>, E> {
        let slots = self.slots.iter().map(&mut f).collect::<Result<Vec<_>, E>>()?;
        Ok(CapData {
            body: self.body.clone(),
            slots,
        })
    }
}

/// Marker the body uses to refer to slot `index`.
pub fn slot_marker(index: usize) -> Value {
    json!({ "@qclass": "slot", "index": index })
}

/// A method invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message<S> {
    /// Method name.
    pub method: String,
    /// Arguments.
    pub args: CapData<S>,
    /// Promise to resolve with the result, if the sender wants one.
    pub result: Option<S>,
}

impl<S> Message<S> {
    /// Create a message.
    pub fn new(method: impl Into<String>, args: CapData<S>, result: Option<S>) -> Self {
        Self {
            method: method.into(),
            args,
            result,
        }
    }

    /// Every slot the message mentions: args then result.
    pub fn slots(&self) -> impl Iterator<Item = &S> {
        self.args.slots.iter().chain(self.result.iter())
    }
}

/// One promise settlement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution<S> {
    /// The promise being settled.
    pub promise: S,
    /// `true` for a rejection.
    pub rejected: bool,
    /// Fulfillment value or rejection reason.
    pub data: CapData<S>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_slot_detection() {
        let data = CapData::single_slot("ko5");
        assert_eq!(data.as_single_slot(), Some(&"ko5"));

        let two = CapData::from_json(&json!([slot_marker(0), slot_marker(1)]), vec!["ko1", "ko2"]);
        assert_eq!(two.as_single_slot(), None);

        let wrapped = CapData::from_json(&json!({ "x": slot_marker(0) }), vec!["ko1"]);
        assert_eq!(wrapped.as_single_slot(), None);
    }

    #[test]
    fn test_try_map_slots_short_circuits() {
        let data = CapData::new("[]", vec![1, 2, 3]);
        let doubled: Result<CapData<i32>, ()> = data.try_map_slots(|s| Ok(s * 2));
        assert_eq!(doubled.unwrap().slots, vec![2, 4, 6]);

        let failed: Result<CapData<i32>, i32> =
            data.try_map_slots(|s| if *s == 2 { Err(*s) } else { Ok(*s) });
        assert_eq!(failed.unwrap_err(), 2);
    }

    #[test]
    fn test_error_body_shape() {
        let err: CapData<String> = CapData::error("vat terminated");
        let body = err.body_json().unwrap();
        assert_eq!(body["@qclass"], "error");
        assert_eq!(body["message"], "vat terminated");
        assert!(err.slots.is_empty());
    }
}
