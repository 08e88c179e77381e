//! Client-side reconciliation toward authoritative state
//!
//! The locally controlled entity moves on local prediction every tick. When
//! an authoritative position arrives that is further away than could be
//! explained by one round trip at the current speed, the engine stops
//! predicting and eases the local position onto the authoritative one with a
//! critically damped spring, or snaps when the error is teleport-sized.
//!
//! Corrections target the latest authoritative position; there is no
//! per-move replay. The pending-move queue only tracks what is in flight for
//! acknowledgement and round-trip measurement.

use log::{debug, info};
use shared::{Vec3, PENDING_MOVE_CAPACITY, PENDING_MOVE_HORIZON_SECS, SNAP_DISTANCE};
use std::collections::VecDeque;

/// A proposed position that has been sent and not yet acknowledged
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingMove {
    pub move_id: u32,
    pub position: Vec3,
    /// Local clock seconds at send time
    pub sent_at: f64,
}

/// FIFO of in-flight moves bounded by age and count
#[derive(Debug, Clone)]
pub struct PendingMoves {
    entries: VecDeque<PendingMove>,
    horizon: f64,
    capacity: usize,
}

impl Default for PendingMoves {
    fn default() -> Self {
        Self::new(PENDING_MOVE_HORIZON_SECS, PENDING_MOVE_CAPACITY)
    }
}

impl PendingMoves {
    pub fn new(horizon: f64, capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            horizon,
            capacity: capacity.max(1),
        }
    }

    /// Appends a move, evicting the oldest entries past the count bound.
    pub fn push(&mut self, pending: PendingMove) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(pending);
    }

    /// Drops entries older than the horizon.
    pub fn expire(&mut self, now: f64) {
        while let Some(front) = self.entries.front() {
            if now - front.sent_at > self.horizon {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Removes `move_id` and everything sent before it, returning the
    /// acknowledged entry if it was still queued.
    pub fn acknowledge(&mut self, move_id: u32) -> Option<PendingMove> {
        let mut acknowledged = None;
        while let Some(front) = self.entries.front() {
            if front.move_id > move_id {
                break;
            }
            if let Some(entry) = self.entries.pop_front() {
                if entry.move_id == move_id {
                    acknowledged = Some(entry);
                }
            }
        }
        acknowledged
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn oldest(&self) -> Option<&PendingMove> {
        self.entries.front()
    }

    pub fn newest(&self) -> Option<&PendingMove> {
        self.entries.back()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileConfig {
    /// Round-trip estimate used until measurements arrive, in seconds
    pub expected_rtt: f64,
    /// Fixed slack added to the trigger threshold, in world units
    pub safety_margin: f32,
    pub snap_distance: f32,
    /// Spring angular frequency; higher converges faster
    pub correction_rate: f32,
    /// Completion band as a fraction of the trigger threshold
    pub completion_ratio: f32,
    /// Smallest completion band, so a zero trigger still lets a
    /// correction finish
    pub min_completion: f32,
    /// Weight of each new round-trip sample
    pub rtt_smoothing: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            expected_rtt: 0.1,
            safety_margin: 1.5,
            snap_distance: SNAP_DISTANCE,
            correction_rate: 10.0,
            completion_ratio: 0.25,
            min_completion: 0.05,
            rtt_smoothing: 0.125,
        }
    }
}

/// What one reconciliation tick did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconcileStep {
    Idle,
    Easing { distance: f32 },
    Snapped,
    Converged,
}

/// Predictive mover for one locally controlled entity
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    config: ReconcileConfig,
    local_position: Vec3,
    correction_velocity: Vec3,
    authoritative_position: Vec3,
    is_reconciling: bool,
    /// Completion band fixed when reconciliation started
    completion_threshold: f32,
    current_speed: f32,
    expected_rtt: f64,
    pending: PendingMoves,
    next_move_id: u32,
}

impl ReconciliationEngine {
    pub fn new(config: ReconcileConfig, start: Vec3) -> Self {
        Self {
            config,
            local_position: start,
            correction_velocity: Vec3::ZERO,
            authoritative_position: start,
            is_reconciling: false,
            completion_threshold: 0.0,
            current_speed: 0.0,
            expected_rtt: config.expected_rtt,
            pending: PendingMoves::default(),
            next_move_id: 1,
        }
    }

    pub fn local_position(&self) -> Vec3 {
        self.local_position
    }

    pub fn authoritative_position(&self) -> Vec3 {
        self.authoritative_position
    }

    pub fn is_reconciling(&self) -> bool {
        self.is_reconciling
    }

    /// Predicted positions may only be sent while not correcting.
    pub fn can_transmit(&self) -> bool {
        !self.is_reconciling
    }

    pub fn current_speed(&self) -> f32 {
        self.current_speed
    }

    pub fn expected_rtt(&self) -> f64 {
        self.expected_rtt
    }

    pub fn pending(&self) -> &PendingMoves {
        &self.pending
    }

    pub fn divergence(&self) -> f32 {
        self.local_position.distance(&self.authoritative_position)
    }

    /// How far client and server may legitimately drift before correcting
    pub fn trigger_threshold(&self) -> f32 {
        self.current_speed * self.expected_rtt as f32 + self.config.safety_margin
    }

    /// Distance at which an active correction is considered done
    pub fn completion_threshold(&self) -> f32 {
        if self.is_reconciling {
            self.completion_threshold
        } else {
            self.completion_band(self.trigger_threshold())
        }
    }

    fn completion_band(&self, trigger: f32) -> f32 {
        (trigger * self.config.completion_ratio).max(self.config.min_completion)
    }

    /// Applies this tick's locally predicted position. Ignored while a
    /// correction owns the local position; returns whether it was applied.
    pub fn predict(&mut self, position: Vec3, dt: f32) -> bool {
        if self.is_reconciling {
            return false;
        }
        if dt > 0.0 {
            self.current_speed = position.distance(&self.local_position) / dt;
        }
        self.local_position = position;
        true
    }

    /// Handles an authoritative position pushed by the server.
    pub fn on_authoritative(&mut self, position: Vec3) {
        self.authoritative_position = position;
        if self.is_reconciling {
            return;
        }

        let distance = self.divergence();
        let trigger = self.trigger_threshold();
        if distance > trigger {
            self.is_reconciling = true;
            self.completion_threshold = self.completion_band(trigger);
            self.correction_velocity = Vec3::ZERO;
            debug!(
                "Reconciling: divergence {:.2} > trigger {:.2}",
                distance, trigger
            );
        }
    }

    /// A commit for `move_id` arrived at local time `now`.
    pub fn on_commit(&mut self, move_id: u32, position: Vec3, now: f64) {
        self.acknowledge(move_id, now);
        self.on_authoritative(position);
    }

    /// The server refused `move_id` and re-asserted `position`.
    pub fn on_rejection(&mut self, move_id: u32, position: Vec3, now: f64) {
        self.acknowledge(move_id, now);
        self.pending.clear();
        self.on_authoritative(position);
    }

    fn acknowledge(&mut self, move_id: u32, now: f64) {
        if let Some(acked) = self.pending.acknowledge(move_id) {
            let sample = (now - acked.sent_at).max(0.0);
            self.expected_rtt += (sample - self.expected_rtt) * self.config.rtt_smoothing;
        }
    }

    /// Advances an active correction by `dt` seconds.
    pub fn tick(&mut self, dt: f32) -> ReconcileStep {
        if !self.is_reconciling {
            return ReconcileStep::Idle;
        }

        let target = self.authoritative_position;
        let distance = self.divergence();

        if distance > self.config.snap_distance {
            info!("Divergence {:.2} too large, snapping to authority", distance);
            self.local_position = target;
            self.finish();
            return ReconcileStep::Snapped;
        }

        // Exact step of a critically damped spring toward the target.
        let omega = self.config.correction_rate;
        let decay = (-omega * dt).exp();
        let offset = self.local_position - target;
        let temp = (self.correction_velocity + offset * omega) * dt;
        self.correction_velocity = (self.correction_velocity - temp * omega) * decay;
        self.local_position = target + (offset + temp) * decay;

        let distance = self.divergence();
        if distance < self.completion_threshold {
            debug!("Reconciled within {:.3}", distance);
            self.finish();
            return ReconcileStep::Converged;
        }

        ReconcileStep::Easing { distance }
    }

    fn finish(&mut self) {
        self.is_reconciling = false;
        self.correction_velocity = Vec3::ZERO;
    }

    /// Queues the current local position for sending, or `None` while
    /// reconciling.
    pub fn outgoing(&mut self, now: f64) -> Option<PendingMove> {
        self.pending.expire(now);
        if self.is_reconciling {
            return None;
        }

        let pending = PendingMove {
            move_id: self.next_move_id,
            position: self.local_position,
            sent_at: now,
        };
        self.next_move_id = self.next_move_id.wrapping_add(1);
        self.pending.push(pending);
        Some(pending)
    }
}
