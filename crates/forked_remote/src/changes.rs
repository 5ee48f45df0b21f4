//! Pending changes awaiting transmission.

use crate::ids::{RecordId, ZoneId};
use serde::{Deserialize, Serialize};

/// A queued intent to save or delete one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingRecordZoneChange {
    /// Save the record.
    SaveRecord(RecordId),
    /// Delete the record.
    DeleteRecord(RecordId),
}

impl PendingRecordZoneChange {
    /// Returns the record this change applies to.
    pub fn record_id(&self) -> &RecordId {
        match self {
            PendingRecordZoneChange::SaveRecord(id) | PendingRecordZoneChange::DeleteRecord(id) => id,
        }
    }
}

/// A queued intent to save or delete one zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingDatabaseChange {
    /// Create the zone.
    SaveZone(ZoneId),
    /// Delete the zone.
    DeleteZone(ZoneId),
}

impl PendingDatabaseChange {
    /// Returns the zone this change applies to.
    pub fn zone_id(&self) -> &ZoneId {
        match self {
            PendingDatabaseChange::SaveZone(id) | PendingDatabaseChange::DeleteZone(id) => id,
        }
    }
}

/// The engine's queue of pending changes.
///
/// # Invariants
///
/// - At most one pending change per record and per zone
/// - A new change replaces a pending change of the opposite kind
/// - Adding a change that is already pending is a no-op
/// - Changes keep the order in which they were first queued
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChanges {
    record_zone_changes: Vec<PendingRecordZoneChange>,
    database_changes: Vec<PendingDatabaseChange>,
}

impl PendingChanges {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues record changes.
    pub fn add_record_zone_changes(&mut self, changes: &[PendingRecordZoneChange]) {
        for change in changes {
            if self.record_zone_changes.contains(change) {
                continue;
            }
            self.record_zone_changes
                .retain(|pending| pending.record_id() != change.record_id());
            self.record_zone_changes.push(change.clone());
        }
    }

    /// Removes record changes.
    pub fn remove_record_zone_changes(&mut self, changes: &[PendingRecordZoneChange]) {
        self.record_zone_changes
            .retain(|pending| !changes.contains(pending));
    }

    /// Returns pending record changes in queue order.
    pub fn record_zone_changes(&self) -> &[PendingRecordZoneChange] {
        &self.record_zone_changes
    }

    /// Queues zone changes.
    pub fn add_database_changes(&mut self, changes: &[PendingDatabaseChange]) {
        for change in changes {
            if self.database_changes.contains(change) {
                continue;
            }
            self.database_changes
                .retain(|pending| pending.zone_id() != change.zone_id());
            self.database_changes.push(change.clone());
        }
    }

    /// Removes zone changes.
    pub fn remove_database_changes(&mut self, changes: &[PendingDatabaseChange]) {
        self.database_changes
            .retain(|pending| !changes.contains(pending));
    }

    /// Returns pending zone changes in queue order.
    pub fn database_changes(&self) -> &[PendingDatabaseChange] {
        &self.database_changes
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.record_zone_changes.is_empty() && self.database_changes.is_empty()
    }

    /// Clears both queues.
    pub fn clear(&mut self) {
        self.record_zone_changes.clear();
        self.database_changes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(name: &str) -> RecordId {
        RecordId::new(name, ZoneId::new("zone"))
    }

    #[test]
    fn duplicate_save_is_ignored() {
        let mut pending = PendingChanges::new();
        let save = PendingRecordZoneChange::SaveRecord(record("a"));
        pending.add_record_zone_changes(&[save.clone()]);
        pending.add_record_zone_changes(&[save.clone()]);
        assert_eq!(pending.record_zone_changes(), &[save]);
    }

    #[test]
    fn delete_replaces_save() {
        let mut pending = PendingChanges::new();
        pending.add_record_zone_changes(&[PendingRecordZoneChange::SaveRecord(record("a"))]);
        pending.add_record_zone_changes(&[PendingRecordZoneChange::DeleteRecord(record("a"))]);
        assert_eq!(
            pending.record_zone_changes(),
            &[PendingRecordZoneChange::DeleteRecord(record("a"))]
        );
    }

    #[test]
    fn other_records_are_untouched() {
        let mut pending = PendingChanges::new();
        pending.add_record_zone_changes(&[
            PendingRecordZoneChange::SaveRecord(record("a")),
            PendingRecordZoneChange::SaveRecord(record("b")),
        ]);
        pending.remove_record_zone_changes(&[PendingRecordZoneChange::SaveRecord(record("a"))]);
        assert_eq!(
            pending.record_zone_changes(),
            &[PendingRecordZoneChange::SaveRecord(record("b"))]
        );
    }

    #[test]
    fn zone_changes_coalesce() {
        let mut pending = PendingChanges::new();
        let zone = ZoneId::new("zone");
        pending.add_database_changes(&[PendingDatabaseChange::DeleteZone(zone.clone())]);
        pending.add_database_changes(&[PendingDatabaseChange::SaveZone(zone.clone())]);
        assert_eq!(
            pending.database_changes(),
            &[PendingDatabaseChange::SaveZone(zone)]
        );
        pending.clear();
        assert!(pending.is_empty());
    }

    proptest! {
        #[test]
        fn at_most_one_change_per_record(ops in prop::collection::vec((0u8..3, any::<bool>()), 1..50)) {
            let mut pending = PendingChanges::new();
            for (name, save) in &ops {
                let id = record(&format!("r{name}"));
                let change = if *save {
                    PendingRecordZoneChange::SaveRecord(id)
                } else {
                    PendingRecordZoneChange::DeleteRecord(id)
                };
                pending.add_record_zone_changes(&[change]);
            }

            for name in 0u8..3 {
                let id = record(&format!("r{name}"));
                let for_id: Vec<_> = pending
                    .record_zone_changes()
                    .iter()
                    .filter(|change| change.record_id() == &id)
                    .collect();
                let last = ops.iter().rev().find(|(n, _)| *n == name);
                match last {
                    None => prop_assert!(for_id.is_empty()),
                    Some((_, save)) => {
                        prop_assert_eq!(for_id.len(), 1);
                        let is_save = matches!(for_id[0], PendingRecordZoneChange::SaveRecord(_));
                        prop_assert_eq!(is_save, *save);
                    }
                }
            }
        }
    }
}
