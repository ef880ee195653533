//! Restart persistence.
//!
//! Layout (fixed-width native-endian fields; reader and writer must run on
//! matching hosts):
//!
//! ```text
//! header:  nbtotal(i32), root_level(i32), mesh_size(RegionSize),
//!          mesh_bcs[6](i32), time(f64), dt(f64), ncycle(i32)
//! index:   nbtotal x { gid(i32), location(i32 + 3 x i64), cost(f64),
//!          offset(u64) }
//! then per block at its offset:
//!          RegionSize, bcs[6](i32), u[flat],
//!          optional w, w1, optional bx1, bx2, bx3
//! ```
//!
//! A `RegionSize` is six bounds and three ratios as f64 plus three cell
//! counts as u64. Every rank reads its own blocks directly at their
//! offsets; writing funnels payloads to rank 0.

use bytes::{Buf, BufMut};

use crate::array::{Array3, Array4};
use crate::comm::{Communicator, Tag};
use crate::config::{BoundaryFlag, Refinement, SimulationConfig};
use crate::error::{MeshError, Result};
use crate::geometry::{BlockTree, LogicalLocation, RegionSize};

use super::block::{MeshBlock, REGION_SIZE_NBYTES};
use super::neighbor::BufferIdTable;
use super::{BlockList, Mesh};

const HEADER_NBYTES: usize = 4 + 4 + REGION_SIZE_NBYTES + 6 * 4 + 8 + 8 + 4;
const INDEX_ENTRY_NBYTES: usize = 4 + (4 + 3 * 8) + 8 + 8;

/// The fixed leading section of a restart file.
#[derive(Debug, Clone)]
pub struct RestartHeader {
    pub nbtotal: usize,
    pub root_level: i32,
    pub mesh_size: RegionSize,
    pub mesh_bcs: [BoundaryFlag; 6],
    pub time: f64,
    pub dt: f64,
    pub ncycle: i64,
}

fn put_region(buf: &mut Vec<u8>, size: &RegionSize) {
    for v in [
        size.x1min, size.x1max, size.x2min, size.x2max, size.x3min, size.x3max, size.x1rat,
        size.x2rat, size.x3rat,
    ] {
        buf.put_f64_ne(v);
    }
    for n in [size.nx1, size.nx2, size.nx3] {
        buf.put_u64_ne(n as u64);
    }
}

fn get_region(buf: &mut &[u8]) -> Result<RegionSize> {
    if buf.remaining() < REGION_SIZE_NBYTES {
        return Err(MeshError::Restart("truncated region record".into()));
    }
    let mut reals = [0.0; 9];
    for v in reals.iter_mut() {
        *v = buf.get_f64_ne();
    }
    let nx1 = buf.get_u64_ne() as usize;
    let nx2 = buf.get_u64_ne() as usize;
    let nx3 = buf.get_u64_ne() as usize;
    Ok(RegionSize {
        x1min: reals[0],
        x1max: reals[1],
        x2min: reals[2],
        x2max: reals[3],
        x3min: reals[4],
        x3max: reals[5],
        x1rat: reals[6],
        x2rat: reals[7],
        x3rat: reals[8],
        nx1,
        nx2,
        nx3,
    })
}

fn put_bcs(buf: &mut Vec<u8>, bcs: &[BoundaryFlag; 6]) {
    for bc in bcs {
        buf.put_i32_ne(bc.code());
    }
}

fn get_bcs(buf: &mut &[u8]) -> Result<[BoundaryFlag; 6]> {
    let mut bcs = [BoundaryFlag::Outflow; 6];
    for bc in bcs.iter_mut() {
        let code = buf.get_i32_ne();
        *bc = BoundaryFlag::from_code(code)
            .ok_or_else(|| MeshError::Restart(format!("unknown boundary code {code}")))?;
    }
    Ok(bcs)
}

fn put_array3(buf: &mut Vec<u8>, array: &Array3) {
    for &v in array.as_slice() {
        buf.put_f64_ne(v);
    }
}

fn get_array3(buf: &mut &[u8], array: &mut Array3) -> Result<()> {
    if buf.remaining() < 8 * array.len() {
        return Err(MeshError::Restart("truncated field record".into()));
    }
    for v in array.as_mut_slice() {
        *v = buf.get_f64_ne();
    }
    Ok(())
}

fn put_array4(buf: &mut Vec<u8>, array: &Array4) {
    for &v in array.as_slice() {
        buf.put_f64_ne(v);
    }
}

fn get_array4(buf: &mut &[u8], array: &mut Array4) -> Result<()> {
    if buf.remaining() < 8 * array.len() {
        return Err(MeshError::Restart("truncated field record".into()));
    }
    for v in array.as_mut_slice() {
        *v = buf.get_f64_ne();
    }
    Ok(())
}

/// A block's restart payload, exactly `size_in_bytes` long.
fn encode_block(block: &MeshBlock) -> Vec<u8> {
    let mut buf = Vec::with_capacity(block.size_in_bytes());
    put_region(&mut buf, &block.block_size);
    put_bcs(&mut buf, &block.bcs);
    put_array4(&mut buf, &block.data.u);
    put_array4(&mut buf, &block.data.w);
    put_array4(&mut buf, &block.data.w1);
    put_array3(&mut buf, &block.data.bx1);
    put_array3(&mut buf, &block.data.bx2);
    put_array3(&mut buf, &block.data.bx3);
    debug_assert_eq!(buf.len(), block.size_in_bytes());
    buf
}

fn decode_block(block: &mut MeshBlock, mut payload: &[u8]) -> Result<()> {
    let buf = &mut payload;
    block.block_size = get_region(buf)?;
    block.bcs = get_bcs(buf)?;
    let mut u = std::mem::take(&mut block.data.u);
    get_array4(buf, &mut u)?;
    block.data.u = u;
    let mut w = std::mem::take(&mut block.data.w);
    get_array4(buf, &mut w)?;
    block.data.w = w;
    let mut w1 = std::mem::take(&mut block.data.w1);
    get_array4(buf, &mut w1)?;
    block.data.w1 = w1;
    let mut bx1 = std::mem::take(&mut block.data.bx1);
    get_array3(buf, &mut bx1)?;
    block.data.bx1 = bx1;
    let mut bx2 = std::mem::take(&mut block.data.bx2);
    get_array3(buf, &mut bx2)?;
    block.data.bx2 = bx2;
    let mut bx3 = std::mem::take(&mut block.data.bx3);
    get_array3(buf, &mut bx3)?;
    block.data.bx3 = bx3;
    Ok(())
}

fn restart_tag(gid: usize) -> Tag {
    // High bit keeps restart traffic out of the exchange tag space.
    (1_u64 << 62) | gid as u64
}

/// Reads just the header of a restart file.
pub fn read_restart_header(path: &std::path::Path) -> Result<RestartHeader> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < HEADER_NBYTES {
        return Err(MeshError::Restart("file shorter than the header".into()));
    }
    let mut buf = bytes.as_slice();
    parse_header(&mut buf)
}

fn parse_header(buf: &mut &[u8]) -> Result<RestartHeader> {
    let nbtotal = buf.get_i32_ne();
    if nbtotal <= 0 {
        return Err(MeshError::Restart(format!("invalid block count {nbtotal}")));
    }
    let root_level = buf.get_i32_ne();
    let mesh_size = get_region(buf)?;
    let mesh_bcs = get_bcs(buf)?;
    let time = buf.get_f64_ne();
    let dt = buf.get_f64_ne();
    let ncycle = buf.get_i32_ne() as i64;
    Ok(RestartHeader {
        nbtotal: nbtotal as usize,
        root_level,
        mesh_size,
        mesh_bcs,
        time,
        dt,
        ncycle,
    })
}

impl Mesh {
    /// Writes the full mesh state. Every rank participates; rank 0 collects
    /// remote payloads and performs the file I/O.
    pub fn write_restart(&self, path: &std::path::Path) -> Result<()> {
        if self.my_rank != 0 {
            for block in self.blocks.iter() {
                self.comm
                    .send(0, restart_tag(block.gid as usize), encode_block(block));
            }
            self.comm.barrier();
            return Ok(());
        }

        let mut file = Vec::new();
        file.put_i32_ne(self.nbtotal as i32);
        file.put_i32_ne(self.root_level);
        put_region(&mut file, &self.mesh_size);
        put_bcs(&mut file, &self.mesh_bcs);
        file.put_f64_ne(self.time);
        file.put_f64_ne(self.dt);
        file.put_i32_ne(self.ncycle as i32);

        // Payload sizes are uniform, so offsets are known up front.
        let payload_nbytes = self
            .blocks
            .iter()
            .next()
            .map(|b| b.size_in_bytes())
            .unwrap_or(0);
        let data_start = HEADER_NBYTES + self.nbtotal * INDEX_ENTRY_NBYTES;

        for gid in 0..self.nbtotal {
            let loc = self.loclist[gid];
            file.put_i32_ne(gid as i32);
            file.put_i32_ne(loc.level);
            file.put_i64_ne(loc.lx1);
            file.put_i64_ne(loc.lx2);
            file.put_i64_ne(loc.lx3);
            file.put_f64_ne(self.costlist[gid]);
            file.put_u64_ne((data_start + gid * payload_nbytes) as u64);
        }
        debug_assert_eq!(file.len(), data_start);

        for gid in 0..self.nbtotal {
            let payload = if self.ranklist[gid] == 0 {
                encode_block(self.blocks.find(gid as i32).expect("local block missing"))
            } else {
                self.comm.recv(self.ranklist[gid], restart_tag(gid))
            };
            debug_assert_eq!(payload.len(), payload_nbytes);
            file.extend_from_slice(&payload);
        }

        std::fs::write(path, file)?;
        self.comm.barrier();
        Ok(())
    }

    /// Reconstructs a mesh from a restart file. Topology and state come
    /// from the file; temporal limits, block sizing, physics, and the
    /// refinement mode come from the configuration.
    pub fn from_restart(
        config: &SimulationConfig,
        comm: Box<dyn Communicator + Send>,
        path: &std::path::Path,
    ) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        if bytes.len() < HEADER_NBYTES {
            return Err(MeshError::Restart("file shorter than the header".into()));
        }
        let mut buf = bytes.as_slice();
        let header = parse_header(&mut buf)?;
        let nbtotal = header.nbtotal;

        if bytes.len() < HEADER_NBYTES + nbtotal * INDEX_ENTRY_NBYTES {
            return Err(MeshError::Restart("file shorter than its block index".into()));
        }

        let mut loclist = Vec::with_capacity(nbtotal);
        let mut costlist = Vec::with_capacity(nbtotal);
        let mut offsets = Vec::with_capacity(nbtotal);
        for _ in 0..nbtotal {
            let _gid = buf.get_i32_ne();
            let level = buf.get_i32_ne();
            let lx1 = buf.get_i64_ne();
            let lx2 = buf.get_i64_ne();
            let lx3 = buf.get_i64_ne();
            loclist.push(LogicalLocation::new(level, lx1, lx2, lx3));
            costlist.push(buf.get_f64_ne());
            offsets.push(buf.get_u64_ne() as usize);
        }

        let mc = &config.mesh;
        let tc = &config.time;
        if mc.num_threads < 1 {
            return Err(MeshError::Config(format!(
                "number of mesh threads must be >= 1, but num_threads={}",
                mc.num_threads
            )));
        }
        let mesh_size = header.mesh_size;
        let dim = mesh_size.dim();
        if tc.cfl_number > 1.0 && dim == 1 {
            return Err(MeshError::Config(
                "the CFL number must be no larger than 1.0 in 1D".into(),
            ));
        }
        if tc.cfl_number > 0.5 && dim > 1 {
            return Err(MeshError::Config(
                "the CFL number must be no larger than 0.5 in 2D/3D".into(),
            ));
        }

        let bnx1 = config.meshblock.as_ref().map(|b| b.nx1).unwrap_or(mesh_size.nx1);
        let bnx2 = config
            .meshblock
            .as_ref()
            .and_then(|b| b.nx2)
            .unwrap_or(mesh_size.nx2);
        let bnx3 = config
            .meshblock
            .as_ref()
            .and_then(|b| b.nx3)
            .unwrap_or(mesh_size.nx3);
        if bnx1 == 0 || bnx2 == 0 || bnx3 == 0 {
            return Err(MeshError::Config("meshblock sizes must be positive".into()));
        }
        let nrbx = [
            (mesh_size.nx1 / bnx1) as i64,
            (mesh_size.nx2 / bnx2) as i64,
            (mesh_size.nx3 / bnx3) as i64,
        ];

        let root_level = header.root_level;
        let adaptive = mc.refinement == Refinement::Adaptive;
        let mut multilevel = adaptive;
        let mut current_level = root_level;
        for loc in &loclist {
            if loc.level != root_level {
                multilevel = true;
            }
            current_level = current_level.max(loc.level);
        }
        let max_level = if adaptive {
            mc.numlevel + root_level - 1
        } else {
            63
        };

        // Rebuild the tree and check that it reproduces the stored forest.
        let mut tree = BlockTree::new(nrbx, dim, root_level, max_level, header.mesh_bcs);
        for &loc in &loclist {
            tree.add_block_without_refine(loc);
        }
        let (rebuilt, _) = tree.enumerate();
        if rebuilt.len() != nbtotal {
            return Err(MeshError::TreeRebuild {
                expected: nbtotal,
                found: rebuilt.len(),
            });
        }
        if rebuilt != loclist {
            return Err(MeshError::Restart(
                "tree reconstruction reordered the stored blocks".into(),
            ));
        }

        let nranks = comm.size();
        let my_rank = comm.rank();
        if nbtotal < nranks {
            return Err(MeshError::TooFewBlocks { nbtotal, nranks });
        }

        let face_only = !config.physics.magnetic && !multilevel;
        let table = BufferIdTable::new(dim, multilevel, face_only);

        let mut mesh = Self {
            comm,
            my_rank,
            nranks,
            test_only: false,
            mesh_size,
            mesh_bcs: header.mesh_bcs,
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
            time: header.time,
            dt: header.dt,
            cfl_number: tc.cfl_number,
            tlim: tc.tlim,
            ncycle: header.ncycle,
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

        let nbs = mesh.nslist[my_rank];
        let nbe = nbs + mesh.nblist[my_rank];
        for gid in nbs..nbe {
            let loc = mesh.loclist[gid];
            let (block_size, block_bcs) = mesh.set_block_size_and_boundaries(loc);
            let mut block = MeshBlock::new(
                gid as i32,
                (gid - nbs) as i32,
                loc,
                block_size,
                block_bcs,
                &mesh.physics,
                mesh.multilevel,
            );
            block.cost = mesh.costlist[gid];

            let offset = offsets[gid];
            let end = offset + block.size_in_bytes();
            if end > bytes.len() {
                return Err(MeshError::Restart(format!(
                    "payload of block {gid} extends past the end of the file"
                )));
            }
            decode_block(&mut block, &bytes[offset..end])?;
            mesh.blocks.push(block);
        }
        mesh.resolve_neighbors();

        Ok(mesh)
    }
}
