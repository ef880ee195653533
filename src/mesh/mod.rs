//! Mesh construction and the step driver.
//!
//! A `Mesh` owns the replicated topology (tree, location/rank/cost lists)
//! and the blocks assigned to this rank. All ranks construct the same mesh
//! from the same configuration; they diverge only in which blocks they
//! materialize.

mod amr;
mod balance;
mod block;
mod bvals;
mod list;
mod neighbor;
mod refine;
mod restart;

pub use balance::{load_balance, Balance};
pub use block::{CoarseFields, FieldData, MeshBlock, REGION_SIZE_NBYTES};
pub use bvals::BoundaryState;
pub use list::BlockList;
pub use neighbor::{BufferIdTable, NeighborBlock, NeighborKind};
pub use refine::FineCoarseMap;
pub use restart::{read_restart_header, RestartHeader};

use crate::comm::{Communicator, SerialComm};
use crate::config::{BoundaryFlag, PhysicsConfig, Refinement, SimulationConfig};
use crate::error::{MeshError, Result};
use crate::geometry::{BlockTree, LogicalLocation, RegionSize};
use crate::hooks::{MeshHooks, RefinementFlag};
use crate::task::{TaskList, TaskStatus};

use std::fmt::Write as _;

#[cfg(feature = "parallel")]
use rayon::iter::ParallelIterator;

/// What stage of the lifecycle an initialization pass serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitFlag {
    /// Fresh start: run the problem generator, then (with AMR) iterate the
    /// refinement warm-up until the tree stabilizes.
    Fresh,
    /// Restarted from a file: state is already loaded, dt comes from the
    /// header.
    Restart,
    /// After a regrid: skip the problem generator but re-derive primitives
    /// and the time step.
    PostRegrid,
}

pub struct Mesh {
    pub(crate) comm: Box<dyn Communicator + Send>,
    pub(crate) my_rank: usize,
    pub(crate) nranks: usize,
    /// Construct-and-report only; blocks are never materialized.
    pub(crate) test_only: bool,

    pub mesh_size: RegionSize,
    pub mesh_bcs: [BoundaryFlag; 6],
    pub(crate) block_nx: (usize, usize, usize),
    pub(crate) physics: PhysicsConfig,

    pub root_level: i32,
    pub current_level: i32,
    pub max_level: i32,
    pub(crate) nrbx: [i64; 3],
    pub multilevel: bool,
    pub adaptive: bool,
    pub(crate) face_only: bool,
    pub num_threads: usize,

    pub start_time: f64,
    pub time: f64,
    pub dt: f64,
    pub cfl_number: f64,
    pub tlim: f64,
    pub ncycle: i64,
    pub nlim: i64,

    pub tree: BlockTree,
    pub nbtotal: usize,
    pub loclist: Vec<LogicalLocation>,
    pub ranklist: Vec<usize>,
    pub costlist: Vec<f64>,
    pub nslist: Vec<usize>,
    pub nblist: Vec<usize>,
    pub(crate) table: BufferIdTable,
    pub blocks: BlockList,
}

fn config_err(message: String) -> MeshError {
    MeshError::Config(message)
}

impl Mesh {
    /// Builds the mesh, balances it, and materializes this rank's blocks.
    pub fn new(config: &SimulationConfig, comm: Box<dyn Communicator + Send>) -> Result<Self> {
        Self::build(config, comm, None)
    }

    /// Mesh-test mode: construct and balance for a pretended rank count, but
    /// do not materialize blocks. Too few blocks is a warning here, not an
    /// error.
    pub fn new_test(config: &SimulationConfig, nranks: usize) -> Result<Self> {
        Self::build(config, Box::new(SerialComm), Some(nranks))
    }

    fn build(
        config: &SimulationConfig,
        comm: Box<dyn Communicator + Send>,
        test_ranks: Option<usize>,
    ) -> Result<Self> {
        let mc = &config.mesh;
        let tc = &config.time;

        if mc.num_threads < 1 {
            return Err(config_err(format!(
                "number of mesh threads must be >= 1, but num_threads={}",
                mc.num_threads
            )));
        }
        if mc.nx1 < 4 {
            return Err(config_err(format!("mesh nx1 must be >= 4, but nx1={}", mc.nx1)));
        }
        if mc.nx2 < 1 || mc.nx3 < 1 {
            return Err(config_err("mesh nx2 and nx3 must be >= 1".into()));
        }
        if mc.nx2 == 1 && mc.nx3 > 1 {
            return Err(config_err(format!(
                "nx2=1, nx3={}: 2D problems in the x1-x3 plane are not supported",
                mc.nx3
            )));
        }
        let dim = mc.dim();
        if tc.cfl_number > 1.0 && dim == 1 {
            return Err(config_err(
                "the CFL number must be no larger than 1.0 in 1D".into(),
            ));
        }
        if tc.cfl_number > 0.5 && dim > 1 {
            return Err(config_err(
                "the CFL number must be no larger than 0.5 in 2D/3D".into(),
            ));
        }
        if mc.x1max <= mc.x1min || mc.x2max <= mc.x2min || mc.x3max <= mc.x3min {
            return Err(config_err("each axis maximum must exceed its minimum".into()));
        }
        for (name, rat) in [("x1rat", mc.x1rat), ("x2rat", mc.x2rat), ("x3rat", mc.x3rat)] {
            if (rat - 1.0).abs() > 0.1 {
                return Err(config_err(format!(
                    "cell-size ratios must satisfy 0.9 <= {name} <= 1.1, but {name}={rat}"
                )));
            }
        }

        let mesh_size = RegionSize {
            x1min: mc.x1min,
            x1max: mc.x1max,
            x2min: mc.x2min,
            x2max: mc.x2max,
            x3min: mc.x3min,
            x3max: mc.x3max,
            x1rat: mc.x1rat,
            x2rat: mc.x2rat,
            x3rat: mc.x3rat,
            nx1: mc.nx1,
            nx2: mc.nx2,
            nx3: mc.nx3,
        };
        let mesh_bcs = mc.boundary_flags();
        if mesh_bcs.contains(&BoundaryFlag::Interior) {
            return Err(config_err("mesh boundaries may not be interior".into()));
        }
        for axis in 0..3 {
            if mesh_bcs[2 * axis].is_periodic() != mesh_bcs[2 * axis + 1].is_periodic() {
                return Err(config_err(
                    "periodic boundaries must be set on both sides of an axis".into(),
                ));
            }
        }

        // Per-block cell counts default to the whole mesh along each axis.
        let bnx1 = config.meshblock.as_ref().map(|b| b.nx1).unwrap_or(mc.nx1);
        let bnx2 = if dim >= 2 {
            config
                .meshblock
                .as_ref()
                .and_then(|b| b.nx2)
                .unwrap_or(mc.nx2)
        } else {
            mc.nx2
        };
        let bnx3 = if dim == 3 {
            config
                .meshblock
                .as_ref()
                .and_then(|b| b.nx3)
                .unwrap_or(mc.nx3)
        } else {
            mc.nx3
        };

        if mc.nx1 % bnx1 != 0 || mc.nx2 % bnx2 != 0 || mc.nx3 % bnx3 != 0 {
            return Err(config_err(
                "the mesh must be evenly divisible by the meshblock".into(),
            ));
        }
        if bnx1 < 4 || (bnx2 < 4 && dim >= 2) || (bnx3 < 4 && dim == 3) {
            return Err(config_err(
                "each meshblock must be at least 4 cells across every extended axis".into(),
            ));
        }

        let nrbx = [
            (mc.nx1 / bnx1) as i64,
            (mc.nx2 / bnx2) as i64,
            (mc.nx3 / bnx3) as i64,
        ];
        let nbmax = nrbx.iter().copied().max().unwrap();
        let mut root_level = 0;
        while (1_i64 << root_level) < nbmax {
            root_level += 1;
        }

        let adaptive = mc.refinement == Refinement::Adaptive;
        let mut multilevel = adaptive;
        let max_level = if adaptive {
            let max_level = mc.numlevel + root_level - 1;
            if max_level > 63 {
                return Err(config_err(format!(
                    "the number of refinement levels must be smaller than {}",
                    63 - root_level + 1
                )));
            }
            max_level
        } else {
            63
        };

        let nranks = test_ranks.unwrap_or_else(|| comm.size());
        let my_rank = if test_ranks.is_some() { 0 } else { comm.rank() };
        let test_only = test_ranks.is_some();

        if my_rank == 0 {
            log::info!("root grid = {} x {} x {} blocks", nrbx[0], nrbx[1], nrbx[2]);
        }

        let mut tree = BlockTree::new(nrbx, dim, root_level, max_level, mesh_bcs);
        let mut current_level = root_level;

        // Static refinement regions.
        for region in &config.refinement {
            if region.level < 1 {
                return Err(config_err(
                    "refinement level must be larger than 0 (root level = 0)".into(),
                ));
            }
            let lrlev = region.level + root_level;
            if lrlev > max_level {
                return Err(config_err(
                    "refinement level exceeds the maximum level".into(),
                ));
            }
            if region.x1min > region.x1max
                || region.x2min > region.x2max
                || region.x3min > region.x3max
            {
                return Err(config_err("an invalid refinement region is specified".into()));
            }
            if region.x1min < mesh_size.x1min
                || region.x1max > mesh_size.x1max
                || (dim >= 2 && (region.x2min < mesh_size.x2min || region.x2max > mesh_size.x2max))
                || (dim == 3 && (region.x3min < mesh_size.x3min || region.x3max > mesh_size.x3max))
            {
                return Err(config_err(
                    "refinement regions must lie inside the mesh".into(),
                ));
            }
            current_level = current_level.max(lrlev);
            if lrlev != root_level {
                multilevel = true;
            }

            // Find the logical index range covering the region at the target
            // level, snapped outward to even/odd so whole octets are created.
            let logical_range = |min: f64,
                                 max: f64,
                                 nrb: i64,
                                 pos: &dyn Fn(f64) -> f64|
             -> (i64, i64) {
                let lxmax = nrb * (1_i64 << region.level);
                let mut lmin = 0;
                while lmin < lxmax {
                    if pos((lmin + 1) as f64 / lxmax as f64) > min {
                        break;
                    }
                    lmin += 1;
                }
                let mut lmax = lmin;
                while lmax < lxmax {
                    if pos((lmax + 1) as f64 / lxmax as f64) >= max {
                        break;
                    }
                    lmax += 1;
                }
                let lmin = lmin - (lmin % 2);
                let lmax = if lmax % 2 == 0 { lmax + 1 } else { lmax };
                (lmin, lmax)
            };

            let (lx1min, lx1max) = logical_range(region.x1min, region.x1max, nrbx[0], &|r| {
                mesh_size.position_x1(r)
            });
            let (lx2min, lx2max) = if dim >= 2 {
                logical_range(region.x2min, region.x2max, nrbx[1], &|r| {
                    mesh_size.position_x2(r)
                })
            } else {
                (0, 0)
            };
            let (lx3min, lx3max) = if dim == 3 {
                logical_range(region.x3min, region.x3max, nrbx[2], &|r| {
                    mesh_size.position_x3(r)
                })
            } else {
                (0, 0)
            };

            if my_rank == 0 {
                log::info!(
                    "refinement: logical level = {lrlev}, lx1 = {lx1min}..{lx1max}, \
                     lx2 = {lx2min}..{lx2max}, lx3 = {lx3min}..{lx3max}"
                );
            }

            let mut nnew = 0;
            let mut k = lx3min;
            loop {
                let mut j = lx2min;
                loop {
                    let mut i = lx1min;
                    while i < lx1max {
                        tree.add_block(LogicalLocation::new(lrlev, i, j, k), &mut nnew)?;
                        i += 2;
                    }
                    j += 2;
                    if dim < 2 || j >= lx2max {
                        break;
                    }
                }
                k += 2;
                if dim < 3 || k >= lx3max {
                    break;
                }
            }
        }

        if multilevel && (bnx1 % 2 == 1 || (bnx2 % 2 == 1 && bnx2 > 1) || (bnx3 % 2 == 1 && bnx3 > 1))
        {
            return Err(config_err(
                "block sizes must be even to use mesh refinement".into(),
            ));
        }

        let face_only = !config.physics.magnetic && !multilevel;
        let table = BufferIdTable::new(dim, multilevel, face_only);

        let (loclist, _) = tree.enumerate();
        let nbtotal = loclist.len();
        current_level = loclist
            .iter()
            .map(|loc| loc.level)
            .max()
            .unwrap_or(root_level)
            .max(current_level);

        if nbtotal < nranks {
            if test_only {
                log::warn!("too few blocks: {nbtotal} blocks for {nranks} ranks");
            } else {
                return Err(MeshError::TooFewBlocks { nbtotal, nranks });
            }
        }

        let costlist = vec![1.0; nbtotal];
        let mut mesh = Self {
            comm,
            my_rank,
            nranks,
            test_only,
            mesh_size,
            mesh_bcs,
            block_nx: (bnx1, bnx2, bnx3),
            physics: config.physics.clone(),
            root_level,
            current_level,
            max_level,
            nrbx,
            multilevel,
            adaptive,
            face_only,
            num_threads: mc.num_threads,
            start_time: tc.start_time,
            time: tc.start_time,
            dt: f64::MAX * 0.4,
            cfl_number: tc.cfl_number,
            tlim: tc.tlim,
            ncycle: 0,
            nlim: tc.nlim,
            tree,
            nbtotal,
            loclist,
            ranklist: Vec::new(),
            costlist,
            nslist: Vec::new(),
            nblist: Vec::new(),
            table,
            blocks: BlockList::new(),
        };

        mesh.rebalance_from_costs()?;
        if !mesh.test_only {
            mesh.materialize_local_blocks()?;
        }
        Ok(mesh)
    }

    pub(crate) fn rebalance_from_costs(&mut self) -> Result<()> {
        if self.nbtotal >= self.nranks {
            let balance = load_balance(&self.costlist, self.nranks, self.adaptive)?;
            self.ranklist = balance.rank;
            self.nslist = balance.start;
            self.nblist = balance.count;
        } else {
            // Mesh-test mode with too few blocks; report what exists.
            self.ranklist = (0..self.nbtotal).collect();
            self.nslist = (0..self.nbtotal).collect();
            self.nblist = vec![1; self.nbtotal];
        }
        Ok(())
    }

    fn materialize_local_blocks(&mut self) -> Result<()> {
        let nbs = self.nslist[self.my_rank];
        let nbe = nbs + self.nblist[self.my_rank];

        self.blocks.clear();
        for gid in nbs..nbe {
            let loc = self.loclist[gid];
            let (block_size, block_bcs) = self.set_block_size_and_boundaries(loc);
            let block = MeshBlock::new(
                gid as i32,
                (gid - nbs) as i32,
                loc,
                block_size,
                block_bcs,
                &self.physics,
                self.multilevel,
            );
            self.blocks.push(block);
        }
        self.resolve_neighbors();
        Ok(())
    }

    pub(crate) fn resolve_neighbors(&mut self) {
        let tree = &self.tree;
        let ranklist = &self.ranklist;
        let nslist = &self.nslist;
        let table = &self.table;
        for block in self.blocks.iter_mut() {
            block.search_and_set_neighbors(tree, ranklist, nslist, table);
        }
    }

    /// Derives a block's physical extents and boundary codes from its
    /// logical location; interior faces get the reserved interior flag.
    pub fn set_block_size_and_boundaries(
        &self,
        loc: LogicalLocation,
    ) -> (RegionSize, [BoundaryFlag; 6]) {
        let (bnx1, bnx2, bnx3) = self.block_nx;
        let mut size = RegionSize {
            x1rat: self.mesh_size.x1rat,
            x2rat: self.mesh_size.x2rat,
            x3rat: self.mesh_size.x3rat,
            nx1: bnx1,
            nx2: bnx2,
            nx3: bnx3,
            ..self.mesh_size
        };
        let mut bcs = [BoundaryFlag::Interior; 6];
        let shift = loc.level - self.root_level;

        // x1
        let extent = self.nrbx[0] << shift;
        if loc.lx1 == 0 {
            size.x1min = self.mesh_size.x1min;
            bcs[0] = self.mesh_bcs[0];
        } else {
            size.x1min = self.mesh_size.position_x1(loc.lx1 as f64 / extent as f64);
        }
        if loc.lx1 == extent - 1 {
            size.x1max = self.mesh_size.x1max;
            bcs[1] = self.mesh_bcs[1];
        } else {
            size.x1max = self
                .mesh_size
                .position_x1((loc.lx1 + 1) as f64 / extent as f64);
        }

        // x2
        if self.mesh_size.nx2 == 1 {
            size.x2min = self.mesh_size.x2min;
            size.x2max = self.mesh_size.x2max;
            bcs[2] = self.mesh_bcs[2];
            bcs[3] = self.mesh_bcs[3];
        } else {
            let extent = self.nrbx[1] << shift;
            if loc.lx2 == 0 {
                size.x2min = self.mesh_size.x2min;
                bcs[2] = self.mesh_bcs[2];
            } else {
                size.x2min = self.mesh_size.position_x2(loc.lx2 as f64 / extent as f64);
            }
            if loc.lx2 == extent - 1 {
                size.x2max = self.mesh_size.x2max;
                bcs[3] = self.mesh_bcs[3];
            } else {
                size.x2max = self
                    .mesh_size
                    .position_x2((loc.lx2 + 1) as f64 / extent as f64);
            }
        }

        // x3
        if self.mesh_size.nx3 == 1 {
            size.x3min = self.mesh_size.x3min;
            size.x3max = self.mesh_size.x3max;
            bcs[4] = self.mesh_bcs[4];
            bcs[5] = self.mesh_bcs[5];
        } else {
            let extent = self.nrbx[2] << shift;
            if loc.lx3 == 0 {
                size.x3min = self.mesh_size.x3min;
                bcs[4] = self.mesh_bcs[4];
            } else {
                size.x3min = self.mesh_size.position_x3(loc.lx3 as f64 / extent as f64);
            }
            if loc.lx3 == extent - 1 {
                size.x3max = self.mesh_size.x3max;
                bcs[5] = self.mesh_bcs[5];
            } else {
                size.x3max = self
                    .mesh_size
                    .position_x3((loc.lx3 + 1) as f64 / extent as f64);
            }
        }

        (size, bcs)
    }

    /// Runs a computation on every local block. With the `parallel` feature
    /// the blocks are dispatched onto the rayon pool; blocks are disjoint,
    /// so tasks never contend.
    pub fn for_each_block<F: Fn(&mut MeshBlock) + Send + Sync>(&mut self, f: F) {
        #[cfg(feature = "parallel")]
        self.blocks.par_iter_mut().for_each(|block| f(block));

        #[cfg(not(feature = "parallel"))]
        self.blocks.iter_mut().for_each(|block| f(block));
    }

    /// Initialization before the main loop, and re-initialization after a
    /// regrid. On a fresh adaptive start this repeats until the tree
    /// stabilizes; shrinking or more-than-doubling block counts during the
    /// warm-up are reported but not fatal.
    pub fn initialize(&mut self, flag: InitFlag, hooks: &MeshHooks) -> Result<()> {
        let inbound = self.nbtotal;

        loop {
            if flag == InitFlag::Fresh {
                if let Some(pgen) = &hooks.problem_generator {
                    self.for_each_block(|block| pgen(block));
                }
            }

            self.exchange_ghosts();

            if let Some(c2p) = &hooks.conserved_to_primitive {
                self.for_each_block(|block| c2p(block));
            }
            if let Some(apply) = &hooks.physical_boundaries {
                self.for_each_block(|block| apply(block));
            }

            if flag != InitFlag::Fresh || !self.adaptive {
                break;
            }

            let before = self.nbtotal;
            self.flag_blocks_for_refinement(hooks);
            self.adaptive_mesh_refinement(hooks)?;

            if self.nbtotal == before {
                break;
            }
            if self.nbtotal < before && self.my_rank == 0 {
                log::warn!(
                    "the number of blocks decreased during adaptive grid initialization; \
                     possibly the refinement criterion is misconfigured"
                );
            }
            if self.nbtotal > 2 * inbound && self.my_rank == 0 {
                log::warn!(
                    "the number of blocks more than doubled during initialization; \
                     more computing power than expected may be required"
                );
            }
        }

        if matches!(flag, InitFlag::Fresh | InitFlag::PostRegrid) {
            if let Some(block_dt) = &hooks.block_time_step {
                self.for_each_block(|block| block.new_block_dt = block_dt(block));
            }
            self.new_time_step();
        }

        Ok(())
    }

    /// Evaluates the refinement criterion on every local block, clamped so
    /// the tree never leaves `[root_level, max_level]`.
    pub fn flag_blocks_for_refinement(&mut self, hooks: &MeshHooks) {
        let Some(criterion) = &hooks.refinement_criterion else {
            return;
        };
        let (root_level, max_level) = (self.root_level, self.max_level);
        for block in self.blocks.iter_mut() {
            let mut flag = criterion(block);
            if flag == RefinementFlag::Refine && block.loc.level >= max_level {
                flag = RefinementFlag::Keep;
            }
            if flag == RefinementFlag::Derefine && block.loc.level <= root_level {
                flag = RefinementFlag::Keep;
            }
            block.refine_flag = flag;
        }
    }

    /// Reduces the per-block time steps to the global `dt`, capped at twice
    /// the previous step and clamped to the remaining time.
    pub fn new_time_step(&mut self) {
        let mut min_dt = f64::MAX;
        for block in self.blocks.iter() {
            min_dt = min_dt.min(block.new_block_dt);
        }
        let min_dt = self.comm.allreduce_min(min_dt);

        self.dt = (min_dt * self.cfl_number).min(2.0 * self.dt);
        if self.time < self.tlim && self.tlim - self.time < self.dt {
            self.dt = self.tlim - self.time;
        }
    }

    /// Processes the task list once on every block, polling fairly: a block
    /// whose next task cannot run yet is skipped, not waited on.
    pub fn update_one_step(&mut self, tasks: &dyn TaskList) {
        let nslots = self.table.max_neighbors();
        let num_tasks = tasks.num_tasks();
        for block in self.blocks.iter_mut() {
            block.task_state.start(num_tasks);
            block.bstate.start_receiving(nslots);
        }

        let mut remaining = self.blocks.len();
        let mut complete = vec![false; remaining];
        while remaining > 0 {
            for (slot, block) in self.blocks.iter_mut().enumerate() {
                if complete[slot] {
                    continue;
                }
                if tasks.do_one_task(block) == TaskStatus::Complete {
                    complete[slot] = true;
                    remaining -= 1;
                }
            }
        }

        for block in self.blocks.iter_mut() {
            block.bstate.clear();
        }
    }

    pub fn find_block(&self, gid: i32) -> Option<&MeshBlock> {
        self.blocks.find(gid)
    }

    pub fn find_block_mut(&mut self, gid: i32) -> Option<&mut MeshBlock> {
        self.blocks.find_mut(gid)
    }

    /// Total number of cells, for performance accounting.
    pub fn total_cells(&self) -> i64 {
        let (bnx1, bnx2, bnx3) = self.block_nx;
        self.nbtotal as i64 * (bnx1 * bnx2 * bnx3) as i64
    }

    /// Globally reduced cell-volume-weighted totals of the conservative
    /// variables.
    pub fn total_conserved(&self) -> Vec<f64> {
        let mut totals = vec![0.0; self.physics.nhydro];
        for block in self.blocks.iter() {
            block.integrate_conservative(&mut totals);
        }
        self.comm.allreduce_sum(&mut totals);
        totals
    }

    /// A textual report of the block structure, level population, and load
    /// balance. Cost statistics index by block.
    pub fn structure_report(&self) -> String {
        let mut out = String::new();
        writeln!(
            out,
            "logical level of the physical root grid = {}",
            self.root_level
        )
        .unwrap();
        writeln!(
            out,
            "logical level of maximum refinement = {}",
            self.current_level
        )
        .unwrap();

        let mut mincost = f64::INFINITY;
        let mut maxcost = 0.0_f64;
        let mut totalcost = 0.0;
        let mut level_counts = vec![0usize; (self.current_level - self.root_level + 1) as usize];

        for (gid, loc) in self.loclist.iter().enumerate() {
            writeln!(
                out,
                "block {gid}: lx1 = {}, lx2 = {}, lx3 = {}, logical level = {}, \
                 physical level = {}, cost = {}, rank = {}",
                loc.lx1,
                loc.lx2,
                loc.lx3,
                loc.level,
                loc.level - self.root_level,
                self.costlist[gid],
                self.ranklist[gid],
            )
            .unwrap();
            mincost = mincost.min(self.costlist[gid]);
            maxcost = maxcost.max(self.costlist[gid]);
            totalcost += self.costlist[gid];
            level_counts[(loc.level - self.root_level) as usize] += 1;
        }

        for (physical, count) in level_counts.iter().enumerate() {
            if *count > 0 {
                writeln!(
                    out,
                    "level {} (logical level {}): {} blocks",
                    physical,
                    physical + self.root_level as usize,
                    count
                )
                .unwrap();
            }
        }
        writeln!(out, "total: {} blocks", self.nbtotal).unwrap();
        writeln!(
            out,
            "load balance: minimum cost = {mincost}, maximum cost = {maxcost}, \
             average cost = {}",
            totalcost / self.nbtotal as f64
        )
        .unwrap();

        for rank in 0..self.ranklist.iter().copied().max().map_or(0, |r| r + 1) {
            let cost: f64 = self
                .ranklist
                .iter()
                .zip(&self.costlist)
                .filter(|(&r, _)| r == rank)
                .map(|(_, &c)| c)
                .sum();
            let count = self.ranklist.iter().filter(|&&r| r == rank).count();
            writeln!(out, "rank {rank}: {count} blocks, cost = {cost}").unwrap();
        }

        out
    }

    /// Writes the block-corner polylines consumed by external plotting, one
    /// polyline per block.
    pub fn write_meshtest_dat(&self, path: &std::path::Path) -> Result<()> {
        let dim = self.mesh_size.dim();
        if dim < 2 {
            return Ok(());
        }

        let mut out = String::new();
        for (gid, loc) in self.loclist.iter().enumerate() {
            let dx = 1.0 / (1_i64 << loc.level) as f64;
            let (x, y, z) = (
                loc.lx1 as f64 * dx,
                loc.lx2 as f64 * dx,
                loc.lx3 as f64 * dx,
            );
            let ll = loc.level;
            let rank = self.ranklist[gid];
            writeln!(
                out,
                "#block {gid} at {} {} {} {ll}",
                loc.lx1, loc.lx2, loc.lx3
            )
            .unwrap();
            if dim == 2 {
                for (cx, cy) in [
                    (x, y),
                    (x + dx, y),
                    (x + dx, y + dx),
                    (x, y + dx),
                    (x, y),
                ] {
                    writeln!(out, "{cx} {cy} {ll} {rank}").unwrap();
                }
            } else {
                for (cx, cy, cz) in [
                    (x, y, z),
                    (x + dx, y, z),
                    (x + dx, y + dx, z),
                    (x, y + dx, z),
                    (x, y, z),
                    (x, y, z + dx),
                    (x + dx, y, z + dx),
                    (x + dx, y, z),
                    (x + dx, y, z + dx),
                    (x + dx, y + dx, z + dx),
                    (x + dx, y + dx, z),
                    (x + dx, y + dx, z + dx),
                    (x, y + dx, z + dx),
                    (x, y + dx, z),
                    (x, y + dx, z + dx),
                    (x, y, z + dx),
                    (x, y, z),
                ] {
                    writeln!(out, "{cx} {cy} {cz} {ll} {rank}").unwrap();
                }
            }
            writeln!(out).unwrap();
            writeln!(out).unwrap();
        }

        std::fs::write(path, out)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{MeshBlockConfig, MeshConfig, RefinementRegion, TimeConfig};

    pub(crate) fn base_config(nx: (usize, usize, usize), block: (usize, usize, usize)) -> SimulationConfig {
        SimulationConfig {
            time: TimeConfig {
                start_time: 0.0,
                tlim: 1.0,
                cfl_number: 0.3,
                nlim: -1,
            },
            mesh: MeshConfig {
                nx1: nx.0,
                nx2: nx.1,
                nx3: nx.2,
                x1min: 0.0,
                x1max: 1.0,
                x2min: 0.0,
                x2max: 1.0,
                x3min: 0.0,
                x3max: 1.0,
                x1rat: 1.0,
                x2rat: 1.0,
                x3rat: 1.0,
                ix1_bc: BoundaryFlag::Outflow,
                ox1_bc: BoundaryFlag::Outflow,
                ix2_bc: BoundaryFlag::Outflow,
                ox2_bc: BoundaryFlag::Outflow,
                ix3_bc: BoundaryFlag::Outflow,
                ox3_bc: BoundaryFlag::Outflow,
                refinement: Refinement::Static,
                numlevel: 1,
                num_threads: 1,
            },
            meshblock: Some(MeshBlockConfig {
                nx1: block.0,
                nx2: Some(block.1),
                nx3: Some(block.2),
            }),
            refinement: Vec::new(),
            physics: PhysicsConfig::default(),
        }
    }

    #[test]
    fn rejects_bad_configs() {
        let mut config = base_config((16, 1, 1), (4, 1, 1));
        config.time.cfl_number = 1.5;
        assert!(matches!(
            Mesh::new(&config, Box::new(SerialComm)),
            Err(MeshError::Config(_))
        ));

        let mut config = base_config((16, 1, 1), (5, 1, 1));
        config.meshblock = Some(MeshBlockConfig {
            nx1: 5,
            nx2: None,
            nx3: None,
        });
        assert!(Mesh::new(&config, Box::new(SerialComm)).is_err());

        let mut config = base_config((16, 1, 1), (4, 1, 1));
        config.mesh.x1rat = 1.5;
        assert!(Mesh::new(&config, Box::new(SerialComm)).is_err());
    }

    #[test]
    fn static_refinement_region_in_one_dimension() {
        let mut config = base_config((16, 1, 1), (4, 1, 1));
        config.refinement.push(RefinementRegion {
            x1min: 0.25,
            x1max: 0.5,
            x2min: 0.0,
            x2max: 0.0,
            x3min: 0.0,
            x3max: 0.0,
            level: 1,
        });

        let mesh = Mesh::new(&config, Box::new(SerialComm)).unwrap();

        // Root block 1 is replaced by two level-1 leaves.
        assert_eq!(mesh.nbtotal, 5);
        let levels: Vec<i32> = mesh
            .loclist
            .iter()
            .map(|l| l.level - mesh.root_level)
            .collect();
        assert_eq!(levels, vec![0, 1, 1, 0, 0]);

        // Leftmost level-1 leaf: one coarser neighbor on its inner-x face.
        let fine_gid = mesh
            .loclist
            .iter()
            .position(|l| l.level == mesh.root_level + 1)
            .unwrap();
        let fine = mesh.find_block(fine_gid as i32).unwrap();
        let inner: Vec<_> = fine.neighbors.iter().filter(|r| r.ox1 == -1).collect();
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0].level, mesh.root_level);
    }

    #[test]
    fn block_bounds_and_interior_flags() {
        let config = base_config((16, 16, 1), (4, 4, 1));
        let mesh = Mesh::new(&config, Box::new(SerialComm)).unwrap();

        // Interior block: all interior boundary codes.
        let (size, bcs) = mesh.set_block_size_and_boundaries(LogicalLocation::new(
            mesh.root_level,
            1,
            1,
            0,
        ));
        assert!(bcs[..4].iter().all(|&b| b == BoundaryFlag::Interior));
        assert!((size.x1min - 0.25).abs() < 1e-12);
        assert!((size.x1max - 0.5).abs() < 1e-12);

        // Corner block keeps the mesh boundary codes on exterior faces.
        let (_, corner) =
            mesh.set_block_size_and_boundaries(LogicalLocation::new(mesh.root_level, 0, 0, 0));
        assert_eq!(corner[0], BoundaryFlag::Outflow);
        assert_eq!(corner[1], BoundaryFlag::Interior);
    }

    #[test]
    fn mesh_test_mode_balances_without_blocks() {
        let config = base_config((32, 32, 1), (4, 4, 1));
        let mesh = Mesh::new_test(&config, 3).unwrap();

        assert_eq!(mesh.nbtotal, 64);
        assert_eq!(mesh.nblist.iter().sum::<usize>(), 64);
        assert!(mesh.nblist.iter().all(|&n| n >= 1));
        assert!(mesh.blocks.is_empty());

        let report = mesh.structure_report();
        assert!(report.contains("total: 64 blocks"));
    }

    #[test]
    fn timestep_growth_cap_and_clamp() {
        let config = base_config((16, 1, 1), (4, 1, 1));
        let mut mesh = Mesh::new(&config, Box::new(SerialComm)).unwrap();

        let mut hooks = MeshHooks::new();
        hooks.enroll_block_time_step(|_| 1.0);
        hooks.enroll_problem_generator(|block| block.data.u.fill(1.0));
        mesh.initialize(InitFlag::Fresh, &hooks).unwrap();

        // First step: cfl * dt_local wins over the growth cap.
        assert!((mesh.dt - 0.3).abs() < 1e-12);

        // Growth is capped at twice the previous step.
        mesh.dt = 0.1;
        for block in mesh.blocks.iter_mut() {
            block.new_block_dt = 1.0;
        }
        mesh.new_time_step();
        assert!((mesh.dt - 0.2).abs() < 1e-12);

        // The final step is clamped to the remaining time.
        mesh.time = mesh.tlim - 0.05;
        mesh.new_time_step();
        assert!((mesh.dt - 0.05).abs() < 1e-12);
    }

    /// A fresh adaptive start re-runs refinement until the block count is
    /// stable; a criterion that refines the domain center once converges in
    /// a single extra pass.
    #[test]
    fn adaptive_warm_up_stabilizes() {
        let mut config = base_config((32, 32, 1), (8, 8, 1));
        config.mesh.refinement = Refinement::Adaptive;
        config.mesh.numlevel = 2;

        let mut mesh = Mesh::new(&config, Box::new(SerialComm)).unwrap();
        assert_eq!(mesh.nbtotal, 16);

        let mut hooks = MeshHooks::new();
        hooks.enroll_problem_generator(|block| block.data.u.fill(1.0));
        hooks.enroll_refinement_criterion(|block| {
            let size = &block.block_size;
            let covers_center = size.x1min <= 0.5
                && size.x1max >= 0.5
                && size.x2min <= 0.5
                && size.x2max >= 0.5;
            if covers_center && size.x1max - size.x1min > 0.2 {
                crate::hooks::RefinementFlag::Refine
            } else {
                crate::hooks::RefinementFlag::Keep
            }
        });

        mesh.initialize(InitFlag::Fresh, &hooks).unwrap();
        assert!(mesh.nbtotal > 16);
        assert_eq!(mesh.current_level, mesh.root_level + 1);

        // The criterion is satisfied; another cycle changes nothing.
        let settled = mesh.nbtotal;
        mesh.flag_blocks_for_refinement(&hooks);
        mesh.adaptive_mesh_refinement(&hooks).unwrap();
        assert_eq!(mesh.nbtotal, settled);
    }

    #[test]
    fn update_one_step_polls_every_block() {
        use crate::task::NoTasks;

        let config = base_config((16, 1, 1), (4, 1, 1));
        let mut mesh = Mesh::new(&config, Box::new(SerialComm)).unwrap();
        mesh.update_one_step(&NoTasks);
        assert!(mesh.blocks.iter().all(|b| b.task_state.remaining == 0));
    }
}
