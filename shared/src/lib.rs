use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const PROTOCOL_VERSION: u32 = 1;

/// Fastest legitimate movement in world units per second, margin included.
pub const MAX_SPEED: f32 = 10.0;
/// Divergence beyond which the client teleports instead of easing.
pub const SNAP_DISTANCE: f32 = 5.0;
pub const PENDING_MOVE_HORIZON_SECS: f64 = 2.0;
pub const PENDING_MOVE_CAPACITY: usize = 60;
/// Largest UDP payload over IPv4; receive buffers are sized to it.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn distance(&self, other: &Vec3) -> f32 {
        (*self - *other).length()
    }

    /// Distance on the horizontal (x/z) plane, ignoring height.
    pub fn horizontal_distance(&self, other: &Vec3) -> f32 {
        let dx = self.x - other.x;
        let dz = self.z - other.z;
        (dx * dx + dz * dz).sqrt()
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f32) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Animation intent carried alongside a movement proposal. The server stores
/// it verbatim on commit; it plays no part in validation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct AnimationState {
    pub horizontal_movement: f32,
    pub vertical_movement: f32,
    pub combo_count: u32,
    pub is_moving: bool,
    pub is_grounded: bool,
    pub is_jumping: bool,
    pub is_attacking: bool,
}

/// Public, replicated state of one entity.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub entity_id: u32,
    pub position: Vec3,
    pub rotation: Vec3,
    pub animation: AnimationState,
}

impl EntitySnapshot {
    pub fn new(entity_id: u32, position: Vec3, rotation: Vec3) -> Self {
        Self {
            entity_id,
            position,
            rotation,
            animation: AnimationState::default(),
        }
    }
}

/// Ingestion request a `SurfaceResult` answers
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStep {
    Clear,
    Config,
    Point,
    Commit,
}

/// Wire code for a rejected proposal. Diagnostics only: clients handle
/// every reason the same way.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    OffSurface,
    SpeedViolation,
    StaleTimestamp,
    UnknownEntity,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::OffSurface => "off_surface",
            RejectReason::SpeedViolation => "speed_violation",
            RejectReason::StaleTimestamp => "stale_timestamp",
            RejectReason::UnknownEntity => "unknown_entity",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Connect {
        client_version: u32,
    },
    ProposeMove {
        move_id: u32,
        position: Vec3,
        rotation: Vec3,
        animation: AnimationState,
    },
    FocusEnter {
        target: u32,
    },
    FocusExit {
        target: u32,
    },
    SurfaceSetConfig {
        cell_size: f32,
        vertical_tolerance: f32,
        origin_x: f32,
        origin_z: f32,
    },
    SurfaceUploadPoint {
        position: Vec3,
        grid_x: i32,
        grid_z: i32,
    },
    SurfaceClear,
    SurfaceCommit,
    Disconnect,

    Connected {
        client_id: u32,
        entity: EntitySnapshot,
    },
    MoveCommitted {
        move_id: u32,
        state: EntitySnapshot,
    },
    MoveRejected {
        move_id: u32,
        reason: RejectReason,
        state: EntitySnapshot,
    },
    EntityState {
        state: EntitySnapshot,
    },
    WorldState {
        tick: u32,
        timestamp: u64,
        entities: Vec<EntitySnapshot>,
    },
    SurfaceResult {
        step: SurfaceStep,
        ok: bool,
        message: String,
    },
    Disconnected {
        reason: String,
    },
}

/// Wall-clock milliseconds since the Unix epoch, saturating at zero.
pub fn timestamp_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    (millis.min(u64::MAX as u128)) as u64
}
