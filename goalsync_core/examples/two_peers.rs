//! Two clients sharing one entity, with envelopes passed by hand.
//!
//! Run with: cargo run -p goalsync_core --example two_peers

use goalsync_core::{fields_from_json, ClientConfig, GoalError, SyncClient};
use goalsync_env::{ChannelKind, NodeId, TokioContext};
use serde_json::json;
use uuid::Uuid;

fn exchange(from: &SyncClient<TokioContext>, to: &mut SyncClient<TokioContext>) -> Result<usize, GoalError> {
    let envelopes = from.outgoing()?;
    for envelope in &envelopes {
        to.receive(from.node(), envelope)?;
    }
    Ok(envelopes.len())
}

fn main() -> Result<(), GoalError> {
    let context = TokioContext::shared();
    let mut alice = SyncClient::new(NodeId::from_seed(1), context.clone(), ClientConfig::default());
    let mut bob = SyncClient::new(NodeId::from_seed(2), context, ClientConfig::default());

    let id = Uuid::new_v4();
    alice.spawn_entity(id, "decoration", ChannelKind::Durable)?;
    exchange(&alice, &mut bob)?;
    println!("bob sees {} entity", bob.entity_count());

    alice.update_goal(id, "position", fields_from_json(json!({"x": 10.0, "y": 0.0, "z": 0.0}))?)?;
    alice.update_goal(id, "label", fields_from_json(json!({"text": "crate"}))?)?;
    exchange(&alice, &mut bob)?;

    for frame in 1..=30 {
        let stats = bob.frame();
        alice.frame();
        if frame % 5 == 0 {
            let x = bob
                .rendered(id, "position")
                .and_then(|p| p.get("x").and_then(|v| v.as_f64()))
                .unwrap_or_default();
            println!("frame {:2}: x = {:6.3} ({} active)", frame, x, stats.active());
        }
    }

    println!("bob's label: {:?}", bob.goal_json(id, "label"));
    Ok(())
}
