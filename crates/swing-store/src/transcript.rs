//! Per-vat transcript store
//!
//! A vat's transcript is a sequence of items at positions `0..endPos`.
//! The *current span* `[startPos, endPos)` is what must be replayed to
//! bring a worker back online: it begins at the latest heap snapshot or
//! at the start of the current incarnation, whichever is later. Items
//! from earlier spans are retained for export.
//!
//! Span bounds live in consensus kv keys (`<vat>.t.startPosition`,
//! `<vat>.t.endPosition`, `<vat>.t.incarnation`) so they roll back with
//! the rest of a crank.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::SwingStore;

/// Bounds of a vat's current transcript span.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanBounds {
    /// First position in the span.
    pub start_pos: u64,
    /// One past the last position in the span.
    pub end_pos: u64,
    /// Incarnation the span belongs to.
    pub incarnation: u64,
}

impl SpanBounds {
    /// Number of items in the span.
    pub fn len(&self) -> u64 {
        self.end_pos - self.start_pos
    }

    /// Check whether the span holds no items.
    pub fn is_empty(&self) -> bool {
        self.start_pos == self.end_pos
    }
}

fn start_key(vat_id: &str) -> String {
    format!("{vat_id}.t.startPosition")
}

fn end_key(vat_id: &str) -> String {
    format!("{vat_id}.t.endPosition")
}

fn incarnation_key(vat_id: &str) -> String {
    format!("{vat_id}.t.incarnation")
}

impl SwingStore {
    fn read_u64(&self, key: &str) -> Result<Option<u64>, StoreError> {
        match self.get(key)? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e| StoreError::corrupt(key, e)),
            None => Ok(None),
        }
    }

    /// Create an empty transcript for a new vat at incarnation 0.
    pub fn init_transcript(&mut self, vat_id: &str) -> Result<(), StoreError> {
        if self.has(&end_key(vat_id))? {
            return Err(StoreError::transcript(vat_id, "already initialized"));
        }
        self.set(&start_key(vat_id), "0")?;
        self.set(&end_key(vat_id), "0")?;
        self.set(&incarnation_key(vat_id), "0")?;
        Ok(())
    }

    /// Check whether a vat has a transcript.
    pub fn has_transcript(&self, vat_id: &str) -> Result<bool, StoreError> {
        self.has(&end_key(vat_id))
    }

    /// Bounds of the vat's current span.
    pub fn current_span_bounds(&self, vat_id: &str) -> Result<SpanBounds, StoreError> {
        let missing = || StoreError::transcript(vat_id, "no transcript");
        Ok(SpanBounds {
            start_pos: self.read_u64(&start_key(vat_id))?.ok_or_else(missing)?,
            end_pos: self.read_u64(&end_key(vat_id))?.ok_or_else(missing)?,
            incarnation: self.read_u64(&incarnation_key(vat_id))?.ok_or_else(missing)?,
        })
    }

    /// Append an item to the current span and return its position.
    pub fn add_transcript_item(&mut self, vat_id: &str, item: &str) -> Result<u64, StoreError> {
        let bounds = self.current_span_bounds(vat_id)?;
        let position = bounds.end_pos;
        self.write_transcript_item(vat_id, position, Some(item.to_string()));
        self.set(&end_key(vat_id), &(position + 1).to_string())?;
        Ok(position)
    }

    /// Read every item of the current span, in order.
    pub fn read_current_span(&self, vat_id: &str) -> Result<Vec<(u64, String)>, StoreError> {
        let bounds = self.current_span_bounds(vat_id)?;
        self.read_transcript_range(vat_id, bounds.start_pos, bounds.end_pos)
    }

    /// Read items at positions `[start, end)`.
    pub fn read_transcript_range(
        &self,
        vat_id: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<(u64, String)>, StoreError> {
        let bounds = self.current_span_bounds(vat_id)?;
        if start > end || end > bounds.end_pos {
            return Err(StoreError::transcript(
                vat_id,
                format!("range {start}..{end} outside 0..{}", bounds.end_pos),
            ));
        }
        let mut items = Vec::with_capacity((end - start) as usize);
        for position in start..end {
            let item = self.read_transcript_item(vat_id, position)?.ok_or_else(|| {
                StoreError::transcript(vat_id, format!("missing item at {position}"))
            })?;
            items.push((position, item));
        }
        Ok(items)
    }

    /// Close the current span and start a new one in the same incarnation
    /// (after a heap snapshot). Returns the new start position.
    pub fn rollover_span(&mut self, vat_id: &str) -> Result<u64, StoreError> {
        let bounds = self.current_span_bounds(vat_id)?;
        self.set(&start_key(vat_id), &bounds.end_pos.to_string())?;
        Ok(bounds.end_pos)
    }

    /// Close the current span and start the next incarnation. Returns the
    /// new incarnation number.
    pub fn rollover_incarnation(&mut self, vat_id: &str) -> Result<u64, StoreError> {
        let bounds = self.current_span_bounds(vat_id)?;
        let incarnation = bounds.incarnation + 1;
        self.set(&start_key(vat_id), &bounds.end_pos.to_string())?;
        self.set(&incarnation_key(vat_id), &incarnation.to_string())?;
        Ok(incarnation)
    }

    /// Remove every item and the span bounds of a vat.
    pub fn delete_vat_transcripts(&mut self, vat_id: &str) -> Result<(), StoreError> {
        let bounds = self.current_span_bounds(vat_id)?;
        for position in 0..bounds.end_pos {
            self.write_transcript_item(vat_id, position, None);
        }
        self.delete(&start_key(vat_id))?;
        self.delete(&end_key(vat_id))?;
        self.delete(&incarnation_key(vat_id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read_span() {
        let mut store = SwingStore::in_memory();
        store.init_transcript("v1").unwrap();
        assert_eq!(store.add_transcript_item("v1", "a").unwrap(), 0);
        assert_eq!(store.add_transcript_item("v1", "b").unwrap(), 1);
        let span = store.read_current_span("v1").unwrap();
        assert_eq!(span, vec![(0, "a".to_string()), (1, "b".to_string())]);
    }

    #[test]
    fn test_rollover_incarnation_starts_new_span() {
        let mut store = SwingStore::in_memory();
        store.init_transcript("v2").unwrap();
        store.add_transcript_item("v2", "old").unwrap();
        assert_eq!(store.rollover_incarnation("v2").unwrap(), 1);
        store.add_transcript_item("v2", "new").unwrap();

        let bounds = store.current_span_bounds("v2").unwrap();
        assert_eq!(
            bounds,
            SpanBounds {
                start_pos: 1,
                end_pos: 2,
                incarnation: 1
            }
        );
        assert_eq!(store.read_current_span("v2").unwrap().len(), 1);
        assert_eq!(store.read_transcript_range("v2", 0, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_rollover_span_keeps_incarnation() {
        let mut store = SwingStore::in_memory();
        store.init_transcript("v1").unwrap();
        store.add_transcript_item("v1", "a").unwrap();
        assert_eq!(store.rollover_span("v1").unwrap(), 1);
        let bounds = store.current_span_bounds("v1").unwrap();
        assert_eq!(bounds.incarnation, 0);
        assert!(bounds.is_empty());
    }

    #[test]
    fn test_transcript_append_rolls_back_with_crank() {
        let mut store = SwingStore::in_memory();
        store.init_transcript("v1").unwrap();
        store.start_crank().unwrap();
        store.establish_savepoint("deliver").unwrap();
        store.add_transcript_item("v1", "doomed").unwrap();
        store.rollback_to("deliver").unwrap();
        store.end_crank().unwrap();
        assert!(store.current_span_bounds("v1").unwrap().is_empty());
        assert!(store.read_transcript_range("v1", 0, 1).is_err());
    }

    #[test]
    fn test_double_init_is_refused() {
        let mut store = SwingStore::in_memory();
        store.init_transcript("v1").unwrap();
        assert!(store.init_transcript("v1").is_err());
    }

    #[test]
    fn test_delete_vat_transcripts() {
        let mut store = SwingStore::in_memory();
        store.init_transcript("v3").unwrap();
        store.add_transcript_item("v3", "a").unwrap();
        store.delete_vat_transcripts("v3").unwrap();
        assert!(!store.has_transcript("v3").unwrap());
    }
}
