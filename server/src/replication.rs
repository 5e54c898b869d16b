//! Area-of-interest replication channel.
//!
//! Each tick every user gets a diff of the entities inside its view box:
//! creates carry the full replicated slice, updates only changed
//! properties, deletes only the nid. The per-user `known_entities` map is
//! the baseline, so emission is idempotent and coalescing under
//! back-pressure cannot lose state.

use crate::client_manager::ViewBox;
use crate::game::{GameState, PLATFORM_NID_BASE};
use shared::protocol::{EntityProp, EntitySlice, Message, ModelId};
use shared::Nid;
use std::collections::HashMap;

/// Builds the replicated slice of every live entity, in deterministic
/// order: players by nid, dummies, projectiles, platforms.
pub fn entity_slices(game: &GameState) -> Vec<EntitySlice> {
    let mut slices = Vec::new();

    for nid in game.player_nids() {
        let p = &game.players[&nid];
        slices.push(EntitySlice {
            nid,
            model_id: ModelId::Player,
            x: p.kin.position[0],
            y: p.kin.position[1],
            z: p.kin.position[2],
            yaw: p.kin.yaw,
            grounded: p.kin.grounded,
            health: p.health,
            max_health: p.max_health,
            pid: p.kin.grounded_platform_pid,
            owner_nid: None,
            radius: None,
        });
    }

    for d in &game.dummies {
        slices.push(EntitySlice {
            nid: d.nid,
            model_id: ModelId::TrainingDummy,
            x: d.position.x,
            y: d.position.y,
            z: d.position.z,
            yaw: d.yaw,
            grounded: true,
            health: d.health,
            max_health: d.max_health,
            pid: None,
            owner_nid: None,
            radius: None,
        });
    }

    for p in &game.projectiles {
        slices.push(EntitySlice {
            nid: p.nid,
            model_id: ModelId::Projectile,
            x: p.position.x,
            y: p.position.y,
            z: p.position.z,
            yaw: 0.0,
            grounded: false,
            health: 0,
            max_health: 0,
            pid: None,
            owner_nid: Some(p.owner_nid),
            radius: Some(p.radius),
        });
    }

    // Platforms replicate their static anchor; clients sample the shared
    // timeline for the live pose, so position updates never stream.
    for def in game.layout.platforms.defs() {
        let anchor = match def.motion {
            shared::PlatformMotion::Linear { origin, .. } => origin,
            shared::PlatformMotion::Rotating { origin, .. } => origin,
        };
        slices.push(EntitySlice {
            nid: PLATFORM_NID_BASE + def.pid,
            model_id: ModelId::Platform,
            x: anchor[0],
            y: anchor[1],
            z: anchor[2],
            yaw: 0.0,
            grounded: false,
            health: 0,
            max_health: 0,
            pid: Some(def.pid),
            owner_nid: None,
            radius: None,
        });
    }

    slices
}

/// Filters slices to the user's view. The owning user always sees its
/// own player entity regardless of intersection.
pub fn visible_for<'a>(slices: &'a [EntitySlice], view: &ViewBox, owner_nid: Nid) -> Vec<&'a EntitySlice> {
    slices
        .iter()
        .filter(|s| s.nid == owner_nid || view.contains(s.x, s.y, s.z))
        .collect()
}

/// Property-level diff between the last emitted slice and the current
/// one. Only mutable fields participate; identity fields (model, pid,
/// owner, radius) are fixed at create time.
pub fn diff_props(prev: &EntitySlice, cur: &EntitySlice) -> Vec<EntityProp> {
    let mut props = Vec::new();
    if cur.x != prev.x {
        props.push(EntityProp::X(cur.x));
    }
    if cur.y != prev.y {
        props.push(EntityProp::Y(cur.y));
    }
    if cur.z != prev.z {
        props.push(EntityProp::Z(cur.z));
    }
    if cur.yaw != prev.yaw {
        props.push(EntityProp::Yaw(cur.yaw));
    }
    if cur.grounded != prev.grounded {
        props.push(EntityProp::Grounded(cur.grounded));
    }
    if cur.health != prev.health {
        props.push(EntityProp::Health(cur.health));
    }
    if cur.max_health != prev.max_health {
        props.push(EntityProp::MaxHealth(cur.max_health));
    }
    props
}

/// Computes one user's replication frame and advances its baseline.
/// Within the frame, creates precede updates precede deletes.
pub fn diff_for_user(
    known: &mut HashMap<Nid, EntitySlice>,
    visible: &[&EntitySlice],
) -> Vec<Message> {
    let mut creates = Vec::new();
    let mut updates = Vec::new();

    for slice in visible {
        match known.get(&slice.nid) {
            None => {
                creates.push(Message::CreateEntity((*slice).clone()));
                known.insert(slice.nid, (*slice).clone());
            }
            Some(prev) => {
                let props = diff_props(prev, slice);
                if !props.is_empty() {
                    updates.push(Message::UpdateEntity {
                        nid: slice.nid,
                        props,
                    });
                    known.insert(slice.nid, (*slice).clone());
                }
            }
        }
    }

    let visible_nids: std::collections::HashSet<Nid> = visible.iter().map(|s| s.nid).collect();
    let gone: Vec<Nid> = known
        .keys()
        .copied()
        .filter(|nid| !visible_nids.contains(nid))
        .collect();

    let mut frame = creates;
    frame.extend(updates);
    for nid in gone {
        known.remove(&nid);
        frame.push(Message::DeleteEntity { nid });
    }
    frame
}
