//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the "God's eye view" of the session:
//! - Which entities exist, on which channel, owned by whom
//! - The latest authoritative value of every written goal field
//! - Which entities were removed or died with their owner
//!
//! Scenarios only let an entity's owner write to it, so "latest write" is
//! well defined without knowing the replicas' tie-break.

use goalsync_core::{Fields, SyncClient};
use goalsync_env::{ChannelKind, NodeId, SyncContext};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// A ground truth entity.
#[derive(Debug, Clone)]
pub struct ExpectedEntity {
    pub kind: String,
    pub channel: ChannelKind,
    pub owner: NodeId,

    /// goal name -> fields written so far
    pub goals: BTreeMap<String, Fields>,
}

/// The Oracle - ground truth of authoritative writes.
#[derive(Debug, Default)]
pub struct Oracle {
    entities: BTreeMap<Uuid, ExpectedEntity>,
    gone: BTreeSet<Uuid>,
    writes: u64,
}

impl Oracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a spawned entity.
    pub fn spawn(&mut self, id: Uuid, kind: &str, channel: ChannelKind, owner: NodeId) {
        self.entities.insert(
            id,
            ExpectedEntity {
                kind: kind.to_string(),
                channel,
                owner,
                goals: BTreeMap::new(),
            },
        );
    }

    /// Records a write; later writes win field by field.
    pub fn record_write(&mut self, id: Uuid, goal: &str, partial: &Fields) {
        if let Some(entity) = self.entities.get_mut(&id) {
            let fields = entity.goals.entry(goal.to_string()).or_default();
            for (key, value) in partial {
                fields.insert(key.clone(), value.clone());
            }
            self.writes += 1;
        }
    }

    /// Records an explicit removal.
    pub fn remove(&mut self, id: Uuid) {
        if self.entities.remove(&id).is_some() {
            self.gone.insert(id);
        }
    }

    /// Records a departed owner: its ephemeral entities are gone.
    pub fn owner_left(&mut self, owner: NodeId) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self
            .entities
            .iter()
            .filter(|(_, e)| e.owner == owner && e.channel == ChannelKind::Ephemeral)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.remove(*id);
        }
        ids
    }

    pub fn entity(&self, id: Uuid) -> Option<&ExpectedEntity> {
        self.entities.get(&id)
    }

    /// Live entities in id order.
    pub fn entity_ids(&self) -> Vec<Uuid> {
        self.entities.keys().copied().collect()
    }

    /// Live entities owned by `owner` on `channel`.
    pub fn owned_by(&self, owner: NodeId, channel: ChannelKind) -> Vec<Uuid> {
        self.entities
            .iter()
            .filter(|(_, e)| e.owner == owner && e.channel == channel)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.entities.len()
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Checks one peer's replicated state against the truth.
    ///
    /// Every live entity must be present with every written field equal;
    /// every gone entity must be absent.
    pub fn verify_authoritative<C: SyncContext>(&self, client: &SyncClient<C>) -> Result<(), String> {
        let peer = client.node();
        for (id, expected) in &self.entities {
            let present = match expected.channel {
                ChannelKind::Durable => client.durable_entity(*id).is_some(),
                ChannelKind::Ephemeral => client.ephemeral_entity(*id).is_some(),
            };
            if !present {
                return Err(format!("peer {} is missing {} entity {}", peer, expected.kind, id));
            }

            for (goal, fields) in &expected.goals {
                let actual = client
                    .goal_json(*id, goal)
                    .ok_or_else(|| format!("peer {} has no goal {} on {}", peer, goal, id))?;
                for (key, value) in fields {
                    if actual.get(key) != Some(value) {
                        return Err(format!(
                            "peer {} {}/{}.{} = {:?}, expected {}",
                            peer,
                            id,
                            goal,
                            key,
                            actual.get(key),
                            value
                        ));
                    }
                }
            }
        }

        for id in &self.gone {
            if client.durable_entity(*id).is_some() || client.ephemeral_entity(*id).is_some() {
                return Err(format!("peer {} still renders removed entity {}", peer, id));
            }
        }
        Ok(())
    }

    /// Checks that one peer's rendered values reached the truth.
    ///
    /// Numbers match within `tolerance`; anything else must be equal.
    pub fn verify_rendered<C: SyncContext>(
        &self,
        client: &SyncClient<C>,
        tolerance: f64,
    ) -> Result<(), String> {
        let peer = client.node();
        for (id, expected) in &self.entities {
            for (goal, fields) in &expected.goals {
                let rendered = client
                    .rendered(*id, goal)
                    .ok_or_else(|| format!("peer {} renders nothing for {}/{}", peer, id, goal))?;
                for (key, value) in fields {
                    let actual = rendered.get(key);
                    if !close_enough(actual, value, tolerance) {
                        return Err(format!(
                            "peer {} renders {}/{}.{} = {:?}, expected {}",
                            peer, id, goal, key, actual, value
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

fn close_enough(actual: Option<&Value>, expected: &Value, tolerance: f64) -> bool {
    match (actual.and_then(Value::as_f64), expected.as_f64()) {
        (Some(a), Some(e)) => (a - e).abs() <= tolerance,
        _ => actual == Some(expected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goalsync_core::fields_from_json;
    use goalsync_env::TokioContext;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        fields_from_json(value).unwrap()
    }

    #[test]
    fn test_oracle_latest_write_wins_per_field() {
        let mut oracle = Oracle::new();
        let id = Uuid::new_v4();
        oracle.spawn(id, "decoration", ChannelKind::Durable, NodeId::from_seed(1));

        oracle.record_write(id, "position", &fields(json!({"x": 1.0, "y": 2.0})));
        oracle.record_write(id, "position", &fields(json!({"x": 5.0})));

        let goals = &oracle.entity(id).unwrap().goals;
        assert_eq!(goals["position"]["x"], json!(5.0));
        assert_eq!(goals["position"]["y"], json!(2.0));
        assert_eq!(oracle.writes(), 2);
    }

    #[test]
    fn test_oracle_owner_left_only_ephemeral() {
        let mut oracle = Oracle::new();
        let owner = NodeId::from_seed(1);
        let cursor = Uuid::new_v4();
        let chair = Uuid::new_v4();
        oracle.spawn(cursor, "cursor", ChannelKind::Ephemeral, owner);
        oracle.spawn(chair, "decoration", ChannelKind::Durable, owner);

        assert_eq!(oracle.owner_left(owner), vec![cursor]);
        assert_eq!(oracle.entity_ids(), vec![chair]);
    }

    #[test]
    fn test_verify_against_client() {
        let mut client =
            SyncClient::new(NodeId::from_seed(1), TokioContext::shared(), Default::default());
        let mut oracle = Oracle::new();
        let id = Uuid::new_v4();
        client.spawn_entity(id, "decoration", ChannelKind::Durable).unwrap();
        oracle.spawn(id, "decoration", ChannelKind::Durable, client.node());

        let write = fields(json!({"text": "hi"}));
        client.update_goal_at(id, "label", write.clone(), 0).unwrap();
        oracle.record_write(id, "label", &write);

        assert!(oracle.verify_authoritative(&client).is_ok());
        assert!(oracle.verify_rendered(&client, 0.0).is_err());
        client.frame();
        assert!(oracle.verify_rendered(&client, 0.0).is_ok());

        oracle.record_write(id, "label", &fields(json!({"text": "bye"})));
        assert!(oracle.verify_authoritative(&client).is_err());
    }

    #[test]
    fn test_close_enough() {
        assert!(close_enough(Some(&json!(1.0005)), &json!(1.0), 0.001));
        assert!(!close_enough(Some(&json!(1.1)), &json!(1.0), 0.001));
        assert!(close_enough(Some(&json!(true)), &json!(true), 0.0));
        assert!(!close_enough(None, &json!(1.0), 1.0));
    }
}
