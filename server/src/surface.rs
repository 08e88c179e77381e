//! Walkable-surface map and the surface validator
//!
//! An offline bake exports sampled points on traversable ground, each tagged
//! with the grid cell it falls in. The server ingests them through
//! [`SurfaceIngest`] under one [`SurfaceConfig`], freezes them into an
//! immutable [`SurfaceGrid`], and answers "is this position walkable" with a
//! 3x3 cell neighbourhood sweep.
//!
//! The grid is hashed by cell, so a query costs the number of samples in
//! nine cells regardless of the total sample count.

use crate::error::SurfaceError;
use log::info;
use serde::{Deserialize, Serialize};
use shared::Vec3;
use std::collections::HashMap;
use std::path::Path;

/// Horizontal acceptance radius, in cells, around each sample
const HORIZONTAL_REACH_CELLS: f32 = 1.5;

/// Mapping from world coordinates to grid cells plus the vertical tolerance
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct SurfaceConfig {
    pub cell_size: f32,
    pub vertical_tolerance: f32,
    pub origin_x: f32,
    pub origin_z: f32,
}

impl SurfaceConfig {
    pub fn new(cell_size: f32, vertical_tolerance: f32, origin_x: f32, origin_z: f32) -> Self {
        Self {
            cell_size,
            vertical_tolerance,
            origin_x,
            origin_z,
        }
    }

    /// Cell containing the given world position
    pub fn cell_of(&self, position: &Vec3) -> (i32, i32) {
        let cell_x = ((position.x - self.origin_x) / self.cell_size).floor() as i32;
        let cell_z = ((position.z - self.origin_z) / self.cell_size).floor() as i32;
        (cell_x, cell_z)
    }

    fn validate(&self) -> Result<(), SurfaceError> {
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(SurfaceError::ConfigMismatch(format!(
                "cell size must be positive, got {}",
                self.cell_size
            )));
        }
        if !(self.vertical_tolerance.is_finite() && self.vertical_tolerance >= 0.0) {
            return Err(SurfaceError::ConfigMismatch(format!(
                "vertical tolerance must be non-negative, got {}",
                self.vertical_tolerance
            )));
        }
        Ok(())
    }
}

/// One baked walkable point
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct SurfaceSample {
    pub position: Vec3,
    pub grid_x: i32,
    pub grid_z: i32,
}

impl SurfaceSample {
    pub fn new(position: Vec3, grid_x: i32, grid_z: i32) -> Self {
        Self {
            position,
            grid_x,
            grid_z,
        }
    }
}

/// Immutable spatial index over surface samples, bound to the config it was
/// built under.
#[derive(Debug, Clone)]
pub struct SurfaceGrid {
    config: SurfaceConfig,
    cells: HashMap<(i32, i32), Vec<SurfaceSample>>,
    sample_count: usize,
}

impl SurfaceGrid {
    fn from_samples(config: SurfaceConfig, samples: &[SurfaceSample]) -> Self {
        let mut cells: HashMap<(i32, i32), Vec<SurfaceSample>> = HashMap::new();
        // Duplicates are kept; the validator checks every sample in a cell.
        for sample in samples {
            cells
                .entry((sample.grid_x, sample.grid_z))
                .or_default()
                .push(*sample);
        }

        Self {
            config,
            cells,
            sample_count: samples.len(),
        }
    }

    pub fn config(&self) -> &SurfaceConfig {
        &self.config
    }

    pub fn samples_in(&self, cell_x: i32, cell_z: i32) -> &[SurfaceSample] {
        self.cells
            .get(&(cell_x, cell_z))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// True when some sample in the 3x3 neighbourhood of the position's cell
    /// lies within 1.5 cells horizontally and within the vertical tolerance.
    pub fn is_on_surface(&self, position: &Vec3) -> bool {
        let config = &self.config;
        let (cell_x, cell_z) = config.cell_of(position);
        let reach = config.cell_size * HORIZONTAL_REACH_CELLS;

        for dx in -1..=1 {
            for dz in -1..=1 {
                let hit = self.samples_in(cell_x + dx, cell_z + dz).iter().any(|sample| {
                    position.horizontal_distance(&sample.position) < reach
                        && (sample.position.y - position.y).abs() < config.vertical_tolerance
                });
                if hit {
                    return true;
                }
            }
        }

        false
    }

    pub fn stats(&self) -> SurfaceStats {
        SurfaceStats {
            sample_count: self.sample_count,
            cell_count: self.cells.len(),
            config: Some(self.config),
        }
    }
}

/// Free-standing form of the surface check; the grid must have been built
/// under `config`.
pub fn is_on_surface(position: &Vec3, grid: &SurfaceGrid, config: &SurfaceConfig) -> bool {
    debug_assert_eq!(grid.config(), config);
    grid.is_on_surface(position)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceStats {
    pub sample_count: usize,
    pub cell_count: usize,
    pub config: Option<SurfaceConfig>,
}

/// JSON layout produced by the offline bake
#[derive(Debug, Serialize, Deserialize)]
pub struct SurfaceExport {
    pub config: SurfaceConfig,
    pub points: Vec<SurfaceSample>,
}

/// Staging area for an upload: config first, then points, then `build`.
#[derive(Debug, Default)]
pub struct SurfaceIngest {
    config: Option<SurfaceConfig>,
    samples: Vec<SurfaceSample>,
}

impl SurfaceIngest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> Option<&SurfaceConfig> {
        self.config.as_ref()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sets the config. Replacing a different config while samples are
    /// staged would leave them under the wrong cell mapping, so that
    /// requires a `clear` first.
    pub fn set_config(&mut self, config: SurfaceConfig) -> Result<(), SurfaceError> {
        config.validate()?;

        if !self.samples.is_empty() && self.config != Some(config) {
            return Err(SurfaceError::ConfigLocked);
        }

        info!(
            "Surface config set: cell_size={}, vertical_tolerance={}, origin=({}, {})",
            config.cell_size, config.vertical_tolerance, config.origin_x, config.origin_z
        );
        self.config = Some(config);
        Ok(())
    }

    pub fn upload_point(&mut self, sample: SurfaceSample) -> Result<(), SurfaceError> {
        let config = self.config.as_ref().ok_or_else(|| {
            SurfaceError::ConfigMismatch("point uploaded before any surface config".to_string())
        })?;

        let expected = config.cell_of(&sample.position);
        if expected != (sample.grid_x, sample.grid_z) {
            return Err(SurfaceError::ConfigMismatch(format!(
                "sample at ({}, {}, {}) tagged cell ({}, {}) but config maps it to ({}, {})",
                sample.position.x,
                sample.position.y,
                sample.position.z,
                sample.grid_x,
                sample.grid_z,
                expected.0,
                expected.1
            )));
        }

        self.samples.push(sample);
        Ok(())
    }

    /// Drops every staged sample; the config stays.
    pub fn clear(&mut self) {
        let dropped = self.samples.len();
        self.samples.clear();
        info!("Surface staging cleared ({} samples dropped)", dropped);
    }

    pub fn build(&self) -> Result<SurfaceGrid, SurfaceError> {
        let config = self.config.ok_or_else(|| {
            SurfaceError::ConfigMismatch("cannot build a grid without a config".to_string())
        })?;
        if self.samples.is_empty() {
            return Err(SurfaceError::Empty);
        }
        Ok(SurfaceGrid::from_samples(config, &self.samples))
    }

    pub fn stats(&self) -> SurfaceStats {
        let cell_count = {
            let mut cells: Vec<(i32, i32)> =
                self.samples.iter().map(|s| (s.grid_x, s.grid_z)).collect();
            cells.sort_unstable();
            cells.dedup();
            cells.len()
        };

        SurfaceStats {
            sample_count: self.samples.len(),
            cell_count,
            config: self.config,
        }
    }

    /// Applies a parsed export: config, then every point in order.
    pub fn apply_export(&mut self, export: SurfaceExport) -> Result<(), SurfaceError> {
        self.set_config(export.config)?;
        for sample in export.points {
            self.upload_point(sample)?;
        }
        Ok(())
    }

    /// Reads a JSON export from disk and stages it.
    pub fn load_export(&mut self, path: &Path) -> Result<(), SurfaceError> {
        let data =
            std::fs::read_to_string(path).map_err(|e| SurfaceError::Export(e.to_string()))?;
        let export: SurfaceExport =
            serde_json::from_str(&data).map_err(|e| SurfaceError::Export(e.to_string()))?;

        info!(
            "Loading {} surface samples from {}",
            export.points.len(),
            path.display()
        );
        self.apply_export(export)
    }
}
