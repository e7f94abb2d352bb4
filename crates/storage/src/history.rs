use std::collections::HashMap;
use std::ops::Range;

use super::error::{ConflictSnafu, InvariantViolationSnafu, NotFoundSnafu, StorageResult};
use super::ids::{MessageId, RoundId};
use super::types::MessageRecord;

/// Append-only ordered record list for one conversation.
///
/// Records keep their insertion position for their whole life. `replace` swaps a
/// record in place under the same id, which keeps quote references valid after a
/// retraction or an edit.
#[derive(Debug, Clone, Default)]
pub struct HistoryStore {
    records: Vec<MessageRecord>,
    positions: HashMap<MessageId, usize>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<MessageRecord>) -> StorageResult<Self> {
        let mut store = Self::new();
        for record in records {
            store.append(record)?;
        }
        Ok(store)
    }

    pub fn append(&mut self, record: MessageRecord) -> StorageResult<()> {
        if self.positions.contains_key(&record.id) {
            return ConflictSnafu {
                stage: "history-append",
                entity: "message",
                details: format!("message '{}' already exists", record.id),
            }
            .fail();
        }

        self.positions.insert(record.id, self.records.len());
        self.records.push(record);
        Ok(())
    }

    /// Replaces the record stored under `id`, returning the previous value.
    pub fn replace(&mut self, id: MessageId, record: MessageRecord) -> StorageResult<MessageRecord> {
        if record.id != id {
            return InvariantViolationSnafu {
                stage: "history-replace",
                details: format!("replacement id '{}' does not match '{id}'", record.id),
            }
            .fail();
        }

        let position = self.require_position(id, "history-replace")?;
        Ok(std::mem::replace(&mut self.records[position], record))
    }

    pub fn remove(&mut self, id: MessageId) -> StorageResult<MessageRecord> {
        let position = self.require_position(id, "history-remove")?;
        let removed = self.records.remove(position);
        self.positions.remove(&id);
        self.reindex_from(position);
        Ok(removed)
    }

    /// Drops every record produced by one generation round.
    pub fn remove_round(&mut self, round_id: RoundId) -> Vec<MessageRecord> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.records)
            .into_iter()
            .partition(|record| record.round_id == Some(round_id));
        self.records = kept;
        self.reindex_from(0);
        removed
    }

    pub fn list(&self) -> &[MessageRecord] {
        &self.records
    }

    pub fn get(&self, id: MessageId) -> Option<&MessageRecord> {
        self.positions.get(&id).map(|position| &self.records[*position])
    }

    pub fn position(&self, id: MessageId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    pub fn slice(&self, range: Range<usize>) -> &[MessageRecord] {
        let end = range.end.min(self.records.len());
        let start = range.start.min(end);
        &self.records[start..end]
    }

    pub fn last(&self) -> Option<&MessageRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.records.iter().filter(|record| !record.read).count()
    }

    /// Marks every record read and returns how many changed.
    pub fn mark_all_read(&mut self) -> usize {
        let mut changed = 0;
        for record in self.records.iter_mut().filter(|record| !record.read) {
            record.read = true;
            changed += 1;
        }
        changed
    }

    pub fn into_records(self) -> Vec<MessageRecord> {
        self.records
    }

    fn require_position(&self, id: MessageId, stage: &'static str) -> StorageResult<usize> {
        match self.positions.get(&id) {
            Some(position) => Ok(*position),
            None => NotFoundSnafu {
                stage,
                entity: "message",
                id: id.to_string(),
            }
            .fail(),
        }
    }

    fn reindex_from(&mut self, start: usize) {
        if start == 0 {
            self.positions.clear();
        }
        for (position, record) in self.records.iter().enumerate().skip(start) {
            self.positions.insert(record.id, position);
        }
    }
}
