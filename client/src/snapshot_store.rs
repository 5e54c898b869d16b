//! Client-side entity store fed by the replication diff stream, with
//! temporal interpolation for remote entities.

use log::debug;
use shared::protocol::{EntityProp, EntitySlice, Message, ModelId};
use shared::world::Vec3;
use shared::Nid;
use std::collections::HashMap;

/// Remote entities render this far in the past so there are always two
/// buffered states to interpolate between.
pub const INTERPOLATION_DELAY: f64 = 0.1;

/// One replicated entity with its two most recent authoritative poses.
#[derive(Debug, Clone)]
pub struct RemoteEntity {
    pub slice: EntitySlice,
    prev_time: f64,
    prev_pos: Vec3,
    prev_yaw: f32,
    latest_time: f64,
    latest_pos: Vec3,
    latest_yaw: f32,
}

impl RemoteEntity {
    fn new(slice: EntitySlice, now: f64) -> Self {
        let pos = Vec3::new(slice.x, slice.y, slice.z);
        Self {
            prev_time: now,
            prev_pos: pos,
            prev_yaw: slice.yaw,
            latest_time: now,
            latest_pos: pos,
            latest_yaw: slice.yaw,
            slice,
        }
    }

    fn push_pose(&mut self, now: f64) {
        self.prev_time = self.latest_time;
        self.prev_pos = self.latest_pos;
        self.prev_yaw = self.latest_yaw;
        self.latest_time = now;
        self.latest_pos = Vec3::new(self.slice.x, self.slice.y, self.slice.z);
        self.latest_yaw = self.slice.yaw;
    }

    /// Pose at `render_time`, interpolating between the two buffered
    /// authoritative states and clamping at the ends.
    pub fn sample(&self, render_time: f64) -> (Vec3, f32) {
        if self.latest_time <= self.prev_time {
            return (self.latest_pos, self.latest_yaw);
        }
        let alpha = ((render_time - self.prev_time) / (self.latest_time - self.prev_time))
            .clamp(0.0, 1.0) as f32;
        let pos = self.prev_pos + (self.latest_pos - self.prev_pos) * alpha;
        let yaw = self.prev_yaw + shared::math::yaw_difference(self.latest_yaw, self.prev_yaw) * alpha;
        (pos, yaw)
    }
}

/// Applies create/update/delete frames and answers render queries.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    entities: HashMap<Nid, RemoteEntity>,
}

impl SnapshotStore {
    /// Applies one replication frame at receive time `now` (seconds).
    /// Returns `true` if the message was a replication frame.
    pub fn apply(&mut self, message: &Message, now: f64) -> bool {
        match message {
            Message::CreateEntity(slice) => {
                self.entities
                    .insert(slice.nid, RemoteEntity::new(slice.clone(), now));
                true
            }
            Message::UpdateEntity { nid, props } => {
                match self.entities.get_mut(nid) {
                    Some(entity) => {
                        for prop in props {
                            apply_prop(&mut entity.slice, prop);
                        }
                        entity.push_pose(now);
                    }
                    None => {
                        // An update for an unknown nid means we missed the
                        // create; the next full create will resync.
                        debug!("Update for unknown entity {nid}");
                    }
                }
                true
            }
            Message::DeleteEntity { nid } => {
                self.entities.remove(nid);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, nid: Nid) -> Option<&RemoteEntity> {
        self.entities.get(&nid)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Nid, &RemoteEntity)> {
        self.entities.iter()
    }

    /// Nids of entities of a given kind, sorted.
    pub fn nids_of_kind(&self, model_id: ModelId) -> Vec<Nid> {
        let mut nids: Vec<Nid> = self
            .entities
            .iter()
            .filter(|(_, e)| e.slice.model_id == model_id)
            .map(|(nid, _)| *nid)
            .collect();
        nids.sort_unstable();
        nids
    }
}

fn apply_prop(slice: &mut EntitySlice, prop: &EntityProp) {
    match *prop {
        EntityProp::X(v) => slice.x = v,
        EntityProp::Y(v) => slice.y = v,
        EntityProp::Z(v) => slice.z = v,
        EntityProp::Yaw(v) => slice.yaw = v,
        EntityProp::Grounded(v) => slice.grounded = v,
        EntityProp::Health(v) => slice.health = v,
        EntityProp::MaxHealth(v) => slice.max_health = v,
    }
}
