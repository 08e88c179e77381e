//! Authoritative movement: validation, commit and rollback
//!
//! Every proposed move runs through one pass of
//! `surface check -> speed check -> commit | reject`. The controller is the
//! only writer of entity positions and motion baselines. It never calls
//! back into the network layer; outcomes leave as [`Broadcast`] messages on
//! an mpsc channel owned by whoever drives the session.
//!
//! Per-entity state lives in [`WorldSession`], an explicit context object
//! owned by the server loop and passed in on every call.

use crate::error::{MoveRejection, SurfaceError};
use crate::motion::{EntityMotionState, MotionValidator};
use crate::surface::{SurfaceConfig, SurfaceGrid, SurfaceIngest, SurfaceSample, SurfaceStats};
use log::{debug, error, info, warn};
use shared::{AnimationState, EntitySnapshot, RejectReason, Vec3};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A client's proposed new state for its entity
#[derive(Debug, Clone)]
pub struct MoveProposal {
    pub move_id: u32,
    pub position: Vec3,
    pub rotation: Vec3,
    pub animation: AnimationState,
}

impl MoveProposal {
    pub fn at(move_id: u32, position: Vec3) -> Self {
        Self {
            move_id,
            position,
            rotation: Vec3::ZERO,
            animation: AnimationState::default(),
        }
    }
}

/// Outcome messages emitted by the authority
#[derive(Debug, Clone, PartialEq)]
pub enum Broadcast {
    /// New state was accepted and should reach every client.
    Committed { move_id: u32, state: EntitySnapshot },
    /// Proposal dropped; `state` is the unchanged authoritative state.
    Rejected {
        move_id: u32,
        reason: RejectReason,
        state: EntitySnapshot,
    },
}

#[derive(Debug)]
struct EntityRecord {
    public: EntitySnapshot,
    motion: Option<EntityMotionState>,
    registered_at: f64,
    speed_override: Option<f32>,
}

/// Live entities and per-entity focus for one world
#[derive(Debug)]
pub struct WorldSession {
    entities: HashMap<u32, EntityRecord>,
    focus: HashMap<u32, u32>,
    spawn_position: Vec3,
    spawn_rotation: Vec3,
}

impl WorldSession {
    pub fn new(spawn_position: Vec3, spawn_rotation: Vec3) -> Self {
        Self {
            entities: HashMap::new(),
            focus: HashMap::new(),
            spawn_position,
            spawn_rotation,
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, entity_id: u32) -> bool {
        self.entities.contains_key(&entity_id)
    }

    pub fn snapshot(&self, entity_id: u32) -> Option<&EntitySnapshot> {
        self.entities.get(&entity_id).map(|r| &r.public)
    }

    pub fn motion_state(&self, entity_id: u32) -> Option<&EntityMotionState> {
        self.entities.get(&entity_id).and_then(|r| r.motion.as_ref())
    }

    /// All public states ordered by entity id
    pub fn snapshots(&self) -> Vec<EntitySnapshot> {
        let mut states: Vec<EntitySnapshot> =
            self.entities.values().map(|r| r.public.clone()).collect();
        states.sort_by_key(|s| s.entity_id);
        states
    }

    pub fn focus(&self, entity_id: u32) -> Option<u32> {
        self.focus.get(&entity_id).copied()
    }

    pub fn enter_focus(&mut self, entity_id: u32, target: u32) {
        if self.entities.contains_key(&entity_id) {
            self.focus.insert(entity_id, target);
        }
    }

    /// Clears focus only when `target` is the current one, so a late exit
    /// from an older interactable does not drop a newer focus.
    pub fn exit_focus(&mut self, entity_id: u32, target: u32) {
        if self.focus.get(&entity_id) == Some(&target) {
            self.focus.remove(&entity_id);
        }
    }
}

fn check_finite(position: &Vec3) -> Result<(), MoveRejection> {
    if position.is_finite() {
        Ok(())
    } else {
        Err(MoveRejection::NonFinitePosition)
    }
}

pub struct AuthorityController {
    grid: Option<Arc<SurfaceGrid>>,
    ingest: SurfaceIngest,
    motion: MotionValidator,
    strict_surface: bool,
    outbox: mpsc::UnboundedSender<Broadcast>,
}

impl AuthorityController {
    pub fn new(
        motion: MotionValidator,
        strict_surface: bool,
        outbox: mpsc::UnboundedSender<Broadcast>,
    ) -> Self {
        Self {
            grid: None,
            ingest: SurfaceIngest::new(),
            motion,
            strict_surface,
            outbox,
        }
    }

    pub fn surface(&self) -> Option<&Arc<SurfaceGrid>> {
        self.grid.as_ref()
    }

    /// Creates the entity at the world spawn. Its motion baseline is seeded
    /// from the spawn position and `now` on first validation.
    pub fn register_entity(
        &mut self,
        session: &mut WorldSession,
        entity_id: u32,
        now: f64,
    ) -> EntitySnapshot {
        let public = EntitySnapshot::new(entity_id, session.spawn_position, session.spawn_rotation);
        session.entities.insert(
            entity_id,
            EntityRecord {
                public: public.clone(),
                motion: None,
                registered_at: now,
                speed_override: None,
            },
        );
        info!(
            "Registered entity {} at ({:.2}, {:.2}, {:.2})",
            entity_id, public.position.x, public.position.y, public.position.z
        );
        public
    }

    /// Discards the entity's state and focus.
    pub fn remove_entity(&mut self, session: &mut WorldSession, entity_id: u32) -> bool {
        session.focus.remove(&entity_id);
        if session.entities.remove(&entity_id).is_some() {
            info!("Removed entity {}", entity_id);
            true
        } else {
            false
        }
    }

    pub fn set_speed_override(
        &mut self,
        session: &mut WorldSession,
        entity_id: u32,
        max_speed: Option<f32>,
    ) -> bool {
        match session.entities.get_mut(&entity_id) {
            Some(record) => {
                record.speed_override = max_speed;
                true
            }
            None => false,
        }
    }

    fn check_surface(&self, position: &Vec3) -> Result<(), MoveRejection> {
        match &self.grid {
            Some(grid) if grid.is_on_surface(position) => Ok(()),
            Some(_) => Err(MoveRejection::OffSurface),
            None if self.strict_surface => Err(MoveRejection::OffSurface),
            None => {
                debug!("No surface grid loaded, skipping surface validation");
                Ok(())
            }
        }
    }

    /// Validates one proposal and either commits it or re-asserts the
    /// current state. Evaluated exactly once; nothing is retried.
    pub fn propose_move(
        &mut self,
        session: &mut WorldSession,
        entity_id: u32,
        proposal: MoveProposal,
        now: f64,
    ) -> Result<EntitySnapshot, MoveRejection> {
        let Some(record) = session.entities.get_mut(&entity_id) else {
            warn!(
                "Rejected move {} for entity {}: unknown entity",
                proposal.move_id, entity_id
            );
            return Err(MoveRejection::UnknownEntity(entity_id));
        };

        let baseline = record
            .motion
            .unwrap_or_else(|| EntityMotionState::new(record.public.position, record.registered_at));
        let limit = record.speed_override.unwrap_or(self.motion.max_speed());

        let verdict = check_finite(&proposal.position)
            .and_then(|_| self.check_surface(&proposal.position))
            .and_then(|_| {
                self.motion
                    .check_with_limit(&baseline, &proposal.position, now, limit)
            });

        match verdict {
            Ok(()) => {
                record.public.position = proposal.position;
                record.public.rotation = proposal.rotation;
                record.public.animation = proposal.animation;
                record.motion = Some(EntityMotionState::new(proposal.position, now));

                debug!(
                    "Committed move {} for entity {} at ({:.2}, {:.2}, {:.2})",
                    proposal.move_id,
                    entity_id,
                    proposal.position.x,
                    proposal.position.y,
                    proposal.position.z
                );

                let state = record.public.clone();
                self.emit(Broadcast::Committed {
                    move_id: proposal.move_id,
                    state: state.clone(),
                });
                Ok(state)
            }
            Err(rejection) => {
                warn!(
                    "Rejected move {} for entity {}: {}",
                    proposal.move_id, entity_id, rejection
                );
                self.emit(Broadcast::Rejected {
                    move_id: proposal.move_id,
                    reason: rejection.reason(),
                    state: record.public.clone(),
                });
                Err(rejection)
            }
        }
    }

    fn emit(&self, message: Broadcast) {
        if let Err(e) = self.outbox.send(message) {
            error!("Failed to queue authority broadcast: {}", e);
        }
    }

    pub fn set_surface_config(&mut self, config: SurfaceConfig) -> Result<(), SurfaceError> {
        self.ingest.set_config(config)
    }

    /// Staging is frozen while a grid is installed; a reload starts with
    /// `clear_surface`.
    pub fn upload_surface_point(&mut self, sample: SurfaceSample) -> Result<(), SurfaceError> {
        if self.grid.is_some() {
            return Err(SurfaceError::GridInstalled);
        }
        self.ingest.upload_point(sample)
    }

    /// Full clear: staged samples and the installed grid both go.
    pub fn clear_surface(&mut self) {
        self.ingest.clear();
        self.grid = None;
        info!("Surface grid cleared");
    }

    /// Builds the staged samples into a grid and swaps it in.
    pub fn commit_surface(&mut self) -> Result<SurfaceStats, SurfaceError> {
        if self.grid.is_some() {
            return Err(SurfaceError::GridInstalled);
        }
        let grid = self.ingest.build()?;
        let stats = grid.stats();
        self.grid = Some(Arc::new(grid));
        info!(
            "Surface grid installed: {} samples in {} cells",
            stats.sample_count, stats.cell_count
        );
        Ok(stats)
    }

    pub fn load_surface_export(
        &mut self,
        path: &std::path::Path,
    ) -> Result<SurfaceStats, SurfaceError> {
        self.clear_surface();
        self.ingest.load_export(path)?;
        self.commit_surface()
    }

    pub fn surface_stats(&self) -> SurfaceStats {
        match &self.grid {
            Some(grid) => grid.stats(),
            None => self.ingest.stats(),
        }
    }
}
