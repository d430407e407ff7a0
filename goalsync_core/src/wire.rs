//! Wire codec: `OpBatch` <-> `MutationEnvelope`.
//!
//! Payloads are JSON. The envelope's channel is checked against the batch it
//! carries so a relay can never smuggle durable ops onto the ephemeral
//! replica or vice versa.

use goalsync_env::MutationEnvelope;

use crate::backing::OpBatch;
use crate::error::GoalError;

/// Encodes a batch into an envelope stamped with `timestamp_ms`.
pub fn encode(batch: &OpBatch, timestamp_ms: u64) -> Result<MutationEnvelope, GoalError> {
    let payload = serde_json::to_vec(batch)?;
    Ok(MutationEnvelope::new(payload, timestamp_ms, batch.channel))
}

/// Decodes the batch carried by an envelope.
///
/// # Errors
/// `Codec` if the payload is not a batch, or if the batch's channel differs
/// from the envelope's.
pub fn decode(envelope: &MutationEnvelope) -> Result<OpBatch, GoalError> {
    let batch: OpBatch = serde_json::from_slice(&envelope.payload)?;
    if batch.channel != envelope.channel {
        return Err(GoalError::Codec(format!(
            "{} batch in {} envelope",
            batch.channel, envelope.channel
        )));
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::{BatchBody, Durable, Ephemeral, Replica, Slot};
    use goalsync_env::{ChannelKind, NodeId};
    use uuid::Uuid;

    #[test]
    fn test_envelope_carries_batch() {
        let replica = Replica::<Ephemeral>::new(NodeId::from_seed(1));
        let root = replica.create_root(Uuid::new_v4(), "cursor").unwrap();
        root.child_or_create("pt").transact(|tx| {
            tx.set(Slot::due(), 1_234u64);
            tx.set(Slot::field("x"), 0.5);
        });

        for batch in replica.drain_outbox() {
            let envelope = encode(&batch, 99).unwrap();
            assert_eq!(envelope.channel, ChannelKind::Ephemeral);
            assert_eq!(envelope.timestamp_ms, 99);
            assert_eq!(decode(&envelope).unwrap(), batch);
        }
    }

    #[test]
    fn test_removal_encodes() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let entity = Uuid::new_v4();
        replica.create_root(entity, "test").unwrap();
        replica.drain_outbox();
        replica.remove_root(entity);

        let batch = replica.drain_outbox().remove(0);
        let decoded = decode(&encode(&batch, 0).unwrap()).unwrap();
        assert_eq!(decoded.body, BatchBody::Remove);
        assert_eq!(decoded.entity, entity);
    }

    #[test]
    fn test_garbage_payload_is_codec_error() {
        let envelope = MutationEnvelope::new(b"not json".to_vec(), 0, ChannelKind::Durable);
        assert!(matches!(decode(&envelope), Err(GoalError::Codec(_))));
    }

    #[test]
    fn test_channel_mismatch_is_codec_error() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        replica.create_root(Uuid::new_v4(), "test").unwrap();
        let mut envelope = encode(&replica.drain_outbox()[0], 0).unwrap();
        envelope.channel = ChannelKind::Ephemeral;
        assert!(matches!(decode(&envelope), Err(GoalError::Codec(_))));
    }
}
