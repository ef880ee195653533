//! Capability interfaces supplied by the external solver.
//!
//! The core never implements physics. Problem generation, the
//! conserved-to-primitive map, physical boundary application, the refinement
//! criterion, and the per-block time step are all enrolled here as plain
//! function records; the mesh only invokes them.

use crate::mesh::MeshBlock;

/// Verdict of the refinement criterion for one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefinementFlag {
    Derefine,
    #[default]
    Keep,
    Refine,
}

impl RefinementFlag {
    pub fn as_i8(self) -> i8 {
        match self {
            RefinementFlag::Derefine => -1,
            RefinementFlag::Keep => 0,
            RefinementFlag::Refine => 1,
        }
    }

    pub fn from_i8(value: i8) -> Self {
        match value {
            -1 => RefinementFlag::Derefine,
            1 => RefinementFlag::Refine,
            _ => RefinementFlag::Keep,
        }
    }
}

pub type BlockFn = Box<dyn Fn(&mut MeshBlock) + Send + Sync>;
pub type CriterionFn = Box<dyn Fn(&MeshBlock) -> RefinementFlag + Send + Sync>;
pub type TimeStepFn = Box<dyn Fn(&MeshBlock) -> f64 + Send + Sync>;

/// The record of enrolled callbacks. Every field is optional; a mesh with no
/// hooks still constructs and balances, it just carries unset state.
#[derive(Default)]
pub struct MeshHooks {
    /// Fills a fresh block with initial conditions.
    pub problem_generator: Option<BlockFn>,
    /// Derives primitive state after ghost zones are current.
    pub conserved_to_primitive: Option<BlockFn>,
    /// Applies physical boundary conditions on exterior faces.
    pub physical_boundaries: Option<BlockFn>,
    /// Flags a block for refinement, derefinement, or neither.
    pub refinement_criterion: Option<CriterionFn>,
    /// Produces the stable time step of one block.
    pub block_time_step: Option<TimeStepFn>,
}

impl MeshHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enroll_problem_generator(
        &mut self,
        f: impl Fn(&mut MeshBlock) + Send + Sync + 'static,
    ) {
        self.problem_generator = Some(Box::new(f));
    }

    pub fn enroll_conserved_to_primitive(
        &mut self,
        f: impl Fn(&mut MeshBlock) + Send + Sync + 'static,
    ) {
        self.conserved_to_primitive = Some(Box::new(f));
    }

    pub fn enroll_physical_boundaries(
        &mut self,
        f: impl Fn(&mut MeshBlock) + Send + Sync + 'static,
    ) {
        self.physical_boundaries = Some(Box::new(f));
    }

    pub fn enroll_refinement_criterion(
        &mut self,
        f: impl Fn(&MeshBlock) -> RefinementFlag + Send + Sync + 'static,
    ) {
        self.refinement_criterion = Some(Box::new(f));
    }

    pub fn enroll_block_time_step(
        &mut self,
        f: impl Fn(&MeshBlock) -> f64 + Send + Sync + 'static,
    ) {
        self.block_time_step = Some(Box::new(f));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_codes_round_trip() {
        for flag in [
            RefinementFlag::Derefine,
            RefinementFlag::Keep,
            RefinementFlag::Refine,
        ] {
            assert_eq!(RefinementFlag::from_i8(flag.as_i8()), flag);
        }
    }
}
