//! Simulation configuration.
//!
//! Inputs are TOML documents deserialized into the structs below. Semantic
//! validation (cell-count minimums, CFL limits, divisibility of the mesh by
//! the block) happens in the mesh constructor, not here; this module only
//! defines the shape of the input and its defaults.

use serde::{Deserialize, Serialize};

/// Top-level simulation input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub time: TimeConfig,
    pub mesh: MeshConfig,
    #[serde(default)]
    pub meshblock: Option<MeshBlockConfig>,
    /// Static refinement regions, applied at construction.
    #[serde(default)]
    pub refinement: Vec<RefinementRegion>,
    #[serde(default)]
    pub physics: PhysicsConfig,
}

/// `[time]` section: temporal bounds of the simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeConfig {
    #[serde(default)]
    pub start_time: f64,
    pub tlim: f64,
    pub cfl_number: f64,
    /// Cycle limit; negative means unlimited.
    #[serde(default = "default_nlim")]
    pub nlim: i64,
}

fn default_nlim() -> i64 {
    -1
}

/// `[mesh]` section: the root grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub nx1: usize,
    #[serde(default = "one")]
    pub nx2: usize,
    #[serde(default = "one")]
    pub nx3: usize,

    pub x1min: f64,
    pub x1max: f64,
    #[serde(default)]
    pub x2min: f64,
    #[serde(default = "one_f64")]
    pub x2max: f64,
    #[serde(default)]
    pub x3min: f64,
    #[serde(default = "one_f64")]
    pub x3max: f64,

    /// Geometric cell-size ratios; 1.0 is a uniform grid.
    #[serde(default = "one_f64")]
    pub x1rat: f64,
    #[serde(default = "one_f64")]
    pub x2rat: f64,
    #[serde(default = "one_f64")]
    pub x3rat: f64,

    #[serde(default = "default_bc")]
    pub ix1_bc: BoundaryFlag,
    #[serde(default = "default_bc")]
    pub ox1_bc: BoundaryFlag,
    #[serde(default = "default_bc")]
    pub ix2_bc: BoundaryFlag,
    #[serde(default = "default_bc")]
    pub ox2_bc: BoundaryFlag,
    #[serde(default = "default_bc")]
    pub ix3_bc: BoundaryFlag,
    #[serde(default = "default_bc")]
    pub ox3_bc: BoundaryFlag,

    #[serde(default)]
    pub refinement: Refinement,
    /// Maximum number of levels above the root (adaptive meshes only).
    #[serde(default = "one_i32")]
    pub numlevel: i32,
    /// Worker-pool size within one rank.
    #[serde(default = "one")]
    pub num_threads: usize,
}

fn one() -> usize {
    1
}

fn one_i32() -> i32 {
    1
}

fn one_f64() -> f64 {
    1.0
}

fn default_bc() -> BoundaryFlag {
    BoundaryFlag::Periodic
}

impl MeshConfig {
    /// Spatial dimensionality implied by the cell counts.
    pub fn dim(&self) -> usize {
        if self.nx3 > 1 {
            3
        } else if self.nx2 > 1 {
            2
        } else {
            1
        }
    }

    /// The six boundary flags in `(inner, outer) x (x1, x2, x3)` order.
    pub fn boundary_flags(&self) -> [BoundaryFlag; 6] {
        [
            self.ix1_bc, self.ox1_bc, self.ix2_bc, self.ox2_bc, self.ix3_bc, self.ox3_bc,
        ]
    }
}

/// `[meshblock]` section: per-block cell counts. Each count must divide the
/// corresponding mesh count; omitted axes default to the whole mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshBlockConfig {
    pub nx1: usize,
    #[serde(default)]
    pub nx2: Option<usize>,
    #[serde(default)]
    pub nx3: Option<usize>,
}

/// One `[[refinement]]` table: a statically refined region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementRegion {
    pub x1min: f64,
    pub x1max: f64,
    #[serde(default)]
    pub x2min: f64,
    #[serde(default)]
    pub x2max: f64,
    #[serde(default)]
    pub x3min: f64,
    #[serde(default)]
    pub x3max: f64,
    /// Physical refinement level (1 = one level above the root).
    pub level: i32,
}

/// `[physics]` section: what the external solver stores per block. The core
/// only sizes storage from this; it never interprets the variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicsConfig {
    /// Number of cell-centered conservative variables.
    #[serde(default = "default_nhydro")]
    pub nhydro: usize,
    /// Allocate face-centered field components.
    #[serde(default)]
    pub magnetic: bool,
    /// Allocate the primitive buffers persisted on restart.
    #[serde(default)]
    pub relativistic: bool,
}

fn default_nhydro() -> usize {
    5
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            nhydro: default_nhydro(),
            magnetic: false,
            relativistic: false,
        }
    }
}

/// Refinement mode of the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Refinement {
    #[default]
    Static,
    Adaptive,
}

/// Boundary condition attached to one face of the mesh or of a block.
///
/// Positive codes map to external handlers; `Interior` (code -1) marks a
/// block face shared with a neighboring block and never appears in input
/// files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryFlag {
    Interior,
    Reflect,
    Outflow,
    User,
    Periodic,
}

impl BoundaryFlag {
    /// Stable integer code used in the restart layout.
    pub fn code(self) -> i32 {
        match self {
            BoundaryFlag::Interior => -1,
            BoundaryFlag::Reflect => 1,
            BoundaryFlag::Outflow => 2,
            BoundaryFlag::User => 3,
            BoundaryFlag::Periodic => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(BoundaryFlag::Interior),
            1 => Some(BoundaryFlag::Reflect),
            2 => Some(BoundaryFlag::Outflow),
            3 => Some(BoundaryFlag::User),
            4 => Some(BoundaryFlag::Periodic),
            _ => None,
        }
    }

    pub fn is_periodic(self) -> bool {
        matches!(self, BoundaryFlag::Periodic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_codes_round_trip() {
        for flag in [
            BoundaryFlag::Interior,
            BoundaryFlag::Reflect,
            BoundaryFlag::Outflow,
            BoundaryFlag::User,
            BoundaryFlag::Periodic,
        ] {
            assert_eq!(BoundaryFlag::from_code(flag.code()), Some(flag));
        }
        assert_eq!(BoundaryFlag::from_code(0), None);
    }

    #[test]
    fn minimal_input() {
        let config: SimulationConfig = toml::from_str(
            r#"
            [time]
            tlim = 1.0
            cfl_number = 0.3

            [mesh]
            nx1 = 16
            x1min = 0.0
            x1max = 1.0

            [meshblock]
            nx1 = 4

            [[refinement]]
            x1min = 0.25
            x1max = 0.5
            level = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.mesh.dim(), 1);
        assert_eq!(config.mesh.nx2, 1);
        assert_eq!(config.time.nlim, -1);
        assert_eq!(config.refinement.len(), 1);
        assert_eq!(config.physics.nhydro, 5);
        assert_eq!(config.mesh.ix1_bc, BoundaryFlag::Periodic);
    }
}
