//! Durable op log: the persisted history of durable batches.
//!
//! Replaying the log into a fresh `Replica<Durable>` rebuilds every durable
//! entity, which is how durable state survives a restart and how a relay
//! catches up late joiners.

use std::cell::RefCell;
use std::path::Path;

use crate::backing::OpBatch;
use crate::error::GoalError;

/// Append-only storage of durable batches.
pub trait OpLog {
    /// Appends a batch at the end of the log.
    fn append(&self, batch: &OpBatch) -> Result<(), GoalError>;

    /// Returns every batch in append order.
    fn replay(&self) -> Result<Vec<OpBatch>, GoalError>;

    /// Number of batches stored.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// IN-MEMORY LOG
// ============================================================================

/// Volatile log, for tests and for relays that do not need restarts.
#[derive(Debug, Default)]
pub struct MemoryOpLog {
    batches: RefCell<Vec<OpBatch>>,
}

impl MemoryOpLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OpLog for MemoryOpLog {
    fn append(&self, batch: &OpBatch) -> Result<(), GoalError> {
        self.batches.borrow_mut().push(batch.clone());
        Ok(())
    }

    fn replay(&self) -> Result<Vec<OpBatch>, GoalError> {
        Ok(self.batches.borrow().clone())
    }

    fn len(&self) -> usize {
        self.batches.borrow().len()
    }
}

// ============================================================================
// SLED LOG (persistent)
// ============================================================================

/// Log backed by an embedded sled database.
///
/// Keys are big-endian sequence numbers, so sled's byte order is append
/// order.
pub struct SledOpLog {
    db: sled::Db,
}

impl SledOpLog {
    /// Opens (or creates) a log at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GoalError> {
        let db = sled::open(path)
            .map_err(|e| GoalError::Storage(format!("Failed to open sled DB: {}", e)))?;
        Ok(Self { db })
    }

    /// Opens a log that is deleted when dropped.
    pub fn open_temp() -> Result<Self, GoalError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| GoalError::Storage(format!("Failed to open temp DB: {}", e)))?;
        Ok(Self { db })
    }

    fn next_sequence(&self) -> Result<u64, GoalError> {
        match self.db.last()? {
            Some((key, _)) => {
                let bytes = <[u8; 8]>::try_from(&key[..]).map_err(|_| {
                    GoalError::Storage(format!("corrupt sequence key of {} bytes", key.len()))
                })?;
                Ok(u64::from_be_bytes(bytes) + 1)
            }
            None => Ok(0),
        }
    }
}

impl OpLog for SledOpLog {
    fn append(&self, batch: &OpBatch) -> Result<(), GoalError> {
        let sequence = self.next_sequence()?;
        let value = serde_json::to_vec(batch)?;
        self.db.insert(sequence.to_be_bytes(), value)?;
        self.db
            .flush()
            .map_err(|e| GoalError::Storage(format!("Flush failed: {}", e)))?;
        Ok(())
    }

    fn replay(&self) -> Result<Vec<OpBatch>, GoalError> {
        let mut batches = Vec::with_capacity(self.db.len());
        for entry in self.db.iter() {
            let (_, value) = entry?;
            batches.push(serde_json::from_slice(&value)?);
        }
        Ok(batches)
    }

    fn len(&self) -> usize {
        self.db.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::{Durable, Replica, Slot};
    use goalsync_env::NodeId;
    use uuid::Uuid;

    fn history() -> (Replica<Durable>, Vec<OpBatch>) {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let root = replica.create_root(Uuid::new_v4(), "decoration").unwrap();
        let pos = root.child_or_create("p");
        for x in 0..12 {
            pos.transact(|tx| {
                tx.set(Slot::due(), x as u64 * 10);
                tx.set(Slot::field("x"), x);
            });
        }
        let batches = replica.drain_outbox();
        (replica, batches)
    }

    fn replays_in_order(log: &dyn OpLog) {
        let (source, batches) = history();
        for batch in &batches {
            log.append(batch).unwrap();
        }
        assert_eq!(log.len(), batches.len());
        assert_eq!(log.replay().unwrap(), batches);

        let restored = Replica::<Durable>::new(NodeId::from_seed(1));
        for batch in log.replay().unwrap() {
            restored.apply(&batch).unwrap();
        }
        let entity = source.entity_ids()[0];
        assert_eq!(
            restored.root(entity).unwrap().to_json(),
            source.root(entity).unwrap().to_json()
        );
    }

    #[test]
    fn test_memory_log_replays_in_order() {
        replays_in_order(&MemoryOpLog::new());
    }

    #[test]
    fn test_sled_log_replays_in_order() {
        // More than 10 batches: byte order must not be lexical decimal order
        replays_in_order(&SledOpLog::open_temp().unwrap());
    }

    #[test]
    fn test_empty_log() {
        let log = SledOpLog::open_temp().unwrap();
        assert!(log.is_empty());
        assert!(log.replay().unwrap().is_empty());
    }
}
