//! The physical state container of one block.

use crate::array::{Array3, Array4};
use crate::config::{BoundaryFlag, PhysicsConfig};
use crate::geometry::{LogicalLocation, RegionSize};
use crate::hooks::RefinementFlag;
use crate::task::TaskState;
use crate::NGHOST;

use super::bvals::BoundaryState;
use super::neighbor::NeighborBlock;

/// Byte width of a `RegionSize` in the restart layout: six bounds and three
/// ratios as reals, three cell counts as 64-bit integers.
pub const REGION_SIZE_NBYTES: usize = 12 * 8;

/// Cell-centered and face-centered state owned by a block. The face arrays
/// are empty unless the physics enables them; the primitive buffers `w`/`w1`
/// are empty unless the physics is relativistic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldData {
    pub u: Array4,
    pub w: Array4,
    pub w1: Array4,
    pub bx1: Array3,
    pub bx2: Array3,
    pub bx3: Array3,
}

/// Half-resolution buffers used during restriction and prolongation, sized
/// with a one-cell coarse ghost beyond what prolongation stencils reach.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoarseFields {
    pub u: Array4,
    pub bx1: Array3,
    pub bx2: Array3,
    pub bx3: Array3,
}

/// A rectangular subgrid at a single refinement level, owning cell data and
/// ghosts.
pub struct MeshBlock {
    pub gid: i32,
    pub lid: i32,
    pub loc: LogicalLocation,
    pub block_size: RegionSize,
    pub bcs: [BoundaryFlag; 6],
    pub cost: f64,

    /// Ghost-augmented active index ranges, inclusive.
    pub is: usize,
    pub ie: usize,
    pub js: usize,
    pub je: usize,
    pub ks: usize,
    pub ke: usize,

    /// Coarse-buffer index ranges; zero when the mesh is single-level.
    pub cnghost: usize,
    pub cis: usize,
    pub cie: usize,
    pub cjs: usize,
    pub cje: usize,
    pub cks: usize,
    pub cke: usize,

    pub data: FieldData,
    pub coarse: Option<CoarseFields>,

    pub neighbors: Vec<NeighborBlock>,
    /// Level of the neighboring region per direction offset (index `ox + 1`
    /// per axis); -1 where no block exists.
    pub nblevel: [[[i32; 3]; 3]; 3],

    pub new_block_dt: f64,
    pub refine_flag: RefinementFlag,
    pub task_state: TaskState,
    pub bstate: BoundaryState,
}

impl MeshBlock {
    pub fn new(
        gid: i32,
        lid: i32,
        loc: LogicalLocation,
        block_size: RegionSize,
        bcs: [BoundaryFlag; 6],
        physics: &PhysicsConfig,
        multilevel: bool,
    ) -> Self {
        let (nx1, nx2, nx3) = (block_size.nx1, block_size.nx2, block_size.nx3);

        let is = NGHOST;
        let ie = is + nx1 - 1;
        let (js, je) = if nx2 > 1 { (NGHOST, NGHOST + nx2 - 1) } else { (0, 0) };
        let (ks, ke) = if nx3 > 1 { (NGHOST, NGHOST + nx3 - 1) } else { (0, 0) };

        let ncells1 = nx1 + 2 * NGHOST;
        let ncells2 = if nx2 > 1 { nx2 + 2 * NGHOST } else { 1 };
        let ncells3 = if nx3 > 1 { nx3 + 2 * NGHOST } else { 1 };
        let f2 = (nx2 > 1) as usize;
        let f3 = (nx3 > 1) as usize;

        let u = Array4::new(physics.nhydro, ncells3, ncells2, ncells1);
        let (w, w1) = if physics.relativistic {
            (
                Array4::new(physics.nhydro, ncells3, ncells2, ncells1),
                Array4::new(physics.nhydro, ncells3, ncells2, ncells1),
            )
        } else {
            (Array4::default(), Array4::default())
        };
        // Face arrays carry one extra plane along their own axis even in
        // collapsed dimensions; the two planes are kept identical there.
        let (bx1, bx2, bx3) = if physics.magnetic {
            (
                Array3::new(ncells3, ncells2, ncells1 + 1),
                Array3::new(ncells3, ncells2 + 1, ncells1),
                Array3::new(ncells3 + 1, ncells2, ncells1),
            )
        } else {
            (Array3::default(), Array3::default(), Array3::default())
        };

        let (cnghost, cis, cie, cjs, cje, cks, cke, coarse) = if multilevel {
            let cnghost = (NGHOST + 1) / 2 + 1;
            let cis = cnghost;
            let cie = cis + nx1 / 2 - 1;
            let (cjs, cje) = if nx2 > 1 { (cnghost, cnghost + nx2 / 2 - 1) } else { (0, 0) };
            let (cks, cke) = if nx3 > 1 { (cnghost, cnghost + nx3 / 2 - 1) } else { (0, 0) };

            let cnc1 = nx1 / 2 + 2 * cnghost;
            let cnc2 = if nx2 > 1 { nx2 / 2 + 2 * cnghost } else { 1 };
            let cnc3 = if nx3 > 1 { nx3 / 2 + 2 * cnghost } else { 1 };

            let coarse = CoarseFields {
                u: Array4::new(physics.nhydro, cnc3, cnc2, cnc1),
                bx1: if physics.magnetic {
                    Array3::new(cnc3, cnc2, cnc1 + 1)
                } else {
                    Array3::default()
                },
                bx2: if physics.magnetic {
                    Array3::new(cnc3, cnc2 + 1, cnc1)
                } else {
                    Array3::default()
                },
                bx3: if physics.magnetic {
                    Array3::new(cnc3 + 1, cnc2, cnc1)
                } else {
                    Array3::default()
                },
            };
            (cnghost, cis, cie, cjs, cje, cks, cke, Some(coarse))
        } else {
            (0, 0, 0, 0, 0, 0, 0, None)
        };

        Self {
            gid,
            lid,
            loc,
            block_size,
            bcs,
            cost: 1.0,
            is,
            ie,
            js,
            je,
            ks,
            ke,
            cnghost,
            cis,
            cie,
            cjs,
            cje,
            cks,
            cke,
            data: FieldData { u, w, w1, bx1, bx2, bx3 },
            coarse,
            neighbors: Vec::new(),
            nblevel: [[[-1; 3]; 3]; 3],
            new_block_dt: f64::MAX,
            refine_flag: RefinementFlag::Keep,
            task_state: TaskState::default(),
            bstate: BoundaryState::default(),
        }
    }

    /// 1 when the block extends in x2, else 0.
    pub fn f2(&self) -> usize {
        (self.block_size.nx2 > 1) as usize
    }

    /// 1 when the block extends in x3, else 0.
    pub fn f3(&self) -> usize {
        (self.block_size.nx3 > 1) as usize
    }

    pub fn has_field(&self) -> bool {
        !self.data.bx1.is_empty()
    }

    /// Restart payload size of this block in bytes.
    pub fn size_in_bytes(&self) -> usize {
        let mut size = REGION_SIZE_NBYTES + 6 * 4;
        size += 8 * self.data.u.len();
        size += 8 * (self.data.w.len() + self.data.w1.len());
        size += 8 * (self.data.bx1.len() + self.data.bx2.len() + self.data.bx3.len());
        size
    }

    /// Accumulates the cell-volume-weighted sum of every conservative
    /// variable over the active zones.
    pub fn integrate_conservative(&self, totals: &mut [f64]) {
        let (nvar, ..) = self.data.u.dims();
        assert!(totals.len() >= nvar);

        let size = &self.block_size;
        let widths = |n: usize, pos: &dyn Fn(f64) -> f64| -> Vec<f64> {
            (0..n)
                .map(|i| pos((i + 1) as f64 / n as f64) - pos(i as f64 / n as f64))
                .collect()
        };
        let dx1 = widths(size.nx1, &|r| size.position_x1(r));
        let dx2 = widths(size.nx2, &|r| size.position_x2(r));
        let dx3 = widths(size.nx3, &|r| size.position_x3(r));

        for n in 0..nvar {
            for k in self.ks..=self.ke {
                for j in self.js..=self.je {
                    for i in self.is..=self.ie {
                        let volume = dx1[i - self.is] * dx2[j - self.js] * dx3[k - self.ks];
                        totals[n] += self.data.u[(n, k, j, i)] * volume;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_size(nx1: usize, nx2: usize, nx3: usize) -> RegionSize {
        RegionSize {
            x1min: 0.0,
            x1max: 1.0,
            x2min: 0.0,
            x2max: 1.0,
            x3min: 0.0,
            x3max: 1.0,
            x1rat: 1.0,
            x2rat: 1.0,
            x3rat: 1.0,
            nx1,
            nx2,
            nx3,
        }
    }

    #[test]
    fn index_ranges_cover_ghosts() {
        let block = MeshBlock::new(
            0,
            0,
            LogicalLocation::default(),
            unit_size(8, 4, 1),
            [BoundaryFlag::Outflow; 6],
            &PhysicsConfig::default(),
            true,
        );

        assert_eq!((block.is, block.ie), (2, 9));
        assert_eq!((block.js, block.je), (2, 5));
        assert_eq!((block.ks, block.ke), (0, 0));
        assert_eq!(block.data.u.dims(), (5, 1, 8, 12));

        // Coarse buffers: half resolution plus the coarse ghost.
        assert_eq!(block.cnghost, 2);
        assert_eq!((block.cis, block.cie), (2, 5));
        let coarse = block.coarse.as_ref().unwrap();
        assert_eq!(coarse.u.dims(), (5, 1, 6, 8));
    }

    #[test]
    fn face_field_shapes() {
        let physics = PhysicsConfig {
            nhydro: 5,
            magnetic: true,
            relativistic: false,
        };
        let block = MeshBlock::new(
            0,
            0,
            LogicalLocation::default(),
            unit_size(4, 4, 4),
            [BoundaryFlag::Outflow; 6],
            &physics,
            false,
        );

        assert_eq!(block.data.bx1.dims(), (8, 8, 9));
        assert_eq!(block.data.bx2.dims(), (8, 9, 8));
        assert_eq!(block.data.bx3.dims(), (9, 8, 8));
    }

    #[test]
    fn conserved_integral_matches_uniform_state() {
        let mut block = MeshBlock::new(
            0,
            0,
            LogicalLocation::default(),
            unit_size(4, 4, 1),
            [BoundaryFlag::Outflow; 6],
            &PhysicsConfig::default(),
            false,
        );
        block.data.u.fill(2.0);

        let mut totals = vec![0.0; 5];
        block.integrate_conservative(&mut totals);
        // Uniform density 2 over the unit square.
        for &total in &totals {
            assert!((total - 2.0).abs() < 1e-12);
        }
    }

    #[test]
    fn restart_size_counts_every_array() {
        let physics = PhysicsConfig {
            nhydro: 4,
            magnetic: true,
            relativistic: true,
        };
        let block = MeshBlock::new(
            0,
            0,
            LogicalLocation::default(),
            unit_size(4, 1, 1),
            [BoundaryFlag::Outflow; 6],
            &physics,
            false,
        );

        let cells = 8; // nx1 + 2 ghosts
        let expected = REGION_SIZE_NBYTES
            + 24
            + 8 * (3 * 4 * cells)                        // u, w, w1
            + 8 * ((cells + 1) + 2 * cells + 2 * cells); // bx1, bx2, bx3
        assert_eq!(block.size_in_bytes(), expected);
    }
}
