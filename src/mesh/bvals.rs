//! Ghost-zone exchange between neighboring blocks.
//!
//! One exchange round fills every block's ghost cells from its neighbors:
//! same-level neighbors copy slabs directly (cell-centered and face-centered
//! state), finer neighbors restrict before packing, and coarser neighbors
//! send the covering cells which the receiver expands into its fine ghosts.
//! Every payload is deposited into the slot named by the record's buffer id,
//! so arrivals in any order land correctly. All receives are posted (slots
//! allocated) before any send completes; with every block communicating at
//! once this is what rules out deadlock.

use crate::comm::{pack_reals, unpack_reals, Communicator, Tag};
use crate::NGHOST;

use super::block::MeshBlock;
use super::neighbor::NeighborBlock;
use super::Mesh;

/// Per-block landing slots for one exchange round, indexed by buffer id.
#[derive(Debug, Clone, Default)]
pub struct BoundaryState {
    slots: Vec<Option<Vec<f64>>>,
}

impl BoundaryState {
    /// Allocates the landing slots; the posting of all receives.
    pub fn start_receiving(&mut self, nslots: usize) {
        self.slots.clear();
        self.slots.resize(nslots, None);
    }

    pub fn deposit(&mut self, slot: usize, payload: Vec<f64>) {
        debug_assert!(self.slots[slot].is_none(), "buffer slot filled twice");
        self.slots[slot] = Some(payload);
    }

    pub fn take(&mut self, slot: usize) -> Option<Vec<f64>> {
        self.slots[slot].take()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Tag of a ghost-exchange message: the receiver's local block id and the
/// slot the payload belongs in.
fn exchange_tag(lid: i32, slot: usize) -> Tag {
    ((lid as u64) << 8) | slot as u64
}

/// Inclusive index range along one axis.
type Span = (usize, usize);

fn same_send_span(lo: usize, hi: usize, ox: i64) -> Span {
    match ox {
        0 => (lo, hi),
        1 => (hi - NGHOST + 1, hi),
        _ => (lo, lo + NGHOST - 1),
    }
}

fn same_recv_span(lo: usize, hi: usize, ox: i64) -> Span {
    match ox {
        0 => (lo, hi),
        1 => (hi + 1, hi + NGHOST),
        _ => (lo - NGHOST, lo - 1),
    }
}

/// Assigns a record's `(fi1, fi2)` to the axes its direction leaves free, in
/// axis order.
fn transverse_fine_offsets(nb: &NeighborBlock) -> [i64; 3] {
    let mut result = [0; 3];
    let mut fine = [nb.fi1, nb.fi2].into_iter();
    for (axis, ox) in [nb.ox1, nb.ox2, nb.ox3].into_iter().enumerate() {
        if ox == 0 {
            result[axis] = fine.next().unwrap_or(0);
        }
    }
    result
}

impl MeshBlock {
    fn active_span(&self, axis: usize) -> Span {
        match axis {
            0 => (self.is, self.ie),
            1 => (self.js, self.je),
            _ => (self.ks, self.ke),
        }
    }

    fn coarse_span(&self, axis: usize) -> Span {
        match axis {
            0 => (self.cis, self.cie),
            1 => (self.cjs, self.cje),
            _ => (self.cks, self.cke),
        }
    }

    fn extended(&self, axis: usize) -> bool {
        match axis {
            0 => true,
            1 => self.block_size.nx2 > 1,
            _ => self.block_size.nx3 > 1,
        }
    }

    fn active_count(&self, axis: usize) -> usize {
        match axis {
            0 => self.block_size.nx1,
            1 => self.block_size.nx2,
            _ => self.block_size.nx3,
        }
    }
}

/// Packs the payload this block owes the given neighbor.
fn pack_exchange(block: &MeshBlock, nb: &NeighborBlock, magnetic: bool) -> Vec<f64> {
    let level = block.loc.level;
    let ox = [nb.ox1, nb.ox2, nb.ox3];

    if nb.level == level {
        pack_same_level(block, ox, magnetic)
    } else if nb.level < level {
        pack_to_coarser(block, ox)
    } else {
        pack_to_finer(block, nb, ox)
    }
}

fn pack_same_level(block: &MeshBlock, ox: [i64; 3], magnetic: bool) -> Vec<f64> {
    let span: Vec<Span> = (0..3)
        .map(|axis| {
            let (lo, hi) = block.active_span(axis);
            same_send_span(lo, hi, ox[axis])
        })
        .collect();
    let (nvar, ..) = block.data.u.dims();

    let mut payload = Vec::new();
    for n in 0..nvar {
        for k in span[2].0..=span[2].1 {
            for j in span[1].0..=span[1].1 {
                for i in span[0].0..=span[0].1 {
                    payload.push(block.data.u[(n, k, j, i)]);
                }
            }
        }
    }

    if magnetic {
        let (f2, f3) = (block.f2(), block.f3());
        for k in span[2].0..=span[2].1 {
            for j in span[1].0..=span[1].1 {
                for i in span[0].0..=span[0].1 + 1 {
                    payload.push(block.data.bx1[(k, j, i)]);
                }
            }
        }
        for k in span[2].0..=span[2].1 {
            for j in span[1].0..=span[1].1 + f2 {
                for i in span[0].0..=span[0].1 {
                    payload.push(block.data.bx2[(k, j, i)]);
                }
            }
        }
        for k in span[2].0..=span[2].1 + f3 {
            for j in span[1].0..=span[1].1 {
                for i in span[0].0..=span[0].1 {
                    payload.push(block.data.bx3[(k, j, i)]);
                }
            }
        }
    }

    payload
}

/// Restricts the cells adjacent to the shared boundary and packs them at the
/// neighbor's (coarser) resolution.
fn pack_to_coarser(block: &MeshBlock, ox: [i64; 3]) -> Vec<f64> {
    let span: Vec<Span> = (0..3)
        .map(|axis| {
            let (clo, chi) = block.coarse_span(axis);
            if block.extended(axis) {
                same_send_span(clo, chi, ox[axis])
            } else {
                (0, 0)
            }
        })
        .collect();
    let (nvar, ..) = block.data.u.dims();
    let (e2, e3) = (block.f2(), block.f3());

    let fine_start = |axis: usize, c: usize| -> usize {
        let (clo, _) = block.coarse_span(axis);
        let (lo, _) = block.active_span(axis);
        if block.extended(axis) {
            lo + 2 * (c - clo)
        } else {
            0
        }
    };

    let mut payload = Vec::new();
    for n in 0..nvar {
        for ck in span[2].0..=span[2].1 {
            for cj in span[1].0..=span[1].1 {
                for ci in span[0].0..=span[0].1 {
                    let (fi, fj, fk) = (
                        fine_start(0, ci),
                        fine_start(1, cj),
                        fine_start(2, ck),
                    );
                    let mut sum = 0.0;
                    for dk in 0..=e3 {
                        for dj in 0..=e2 {
                            for di in 0..=1 {
                                sum += block.data.u[(n, fk + dk, fj + dj, fi + di)];
                            }
                        }
                    }
                    payload.push(sum / (2 * (1 + e2) * (1 + e3)) as f64);
                }
            }
        }
    }
    payload
}

/// Packs the cells of this (coarser) block that cover the finer neighbor's
/// ghost region: one cell deep along the shared boundary, the neighbor's
/// half along the free axes.
fn pack_to_finer(block: &MeshBlock, nb: &NeighborBlock, ox: [i64; 3]) -> Vec<f64> {
    let fine = transverse_fine_offsets(nb);
    let span: Vec<Span> = (0..3)
        .map(|axis| {
            let (lo, hi) = block.active_span(axis);
            match ox[axis] {
                1 => (hi, hi),
                -1 => (lo, lo),
                _ => {
                    if block.extended(axis) {
                        let half = block.active_count(axis) / 2;
                        let start = lo + fine[axis] as usize * half;
                        (start, start + half - 1)
                    } else {
                        (0, 0)
                    }
                }
            }
        })
        .collect();
    let (nvar, ..) = block.data.u.dims();

    let mut payload = Vec::new();
    for n in 0..nvar {
        for k in span[2].0..=span[2].1 {
            for j in span[1].0..=span[1].1 {
                for i in span[0].0..=span[0].1 {
                    payload.push(block.data.u[(n, k, j, i)]);
                }
            }
        }
    }
    payload
}

/// Writes a received payload into this block's ghost zones.
fn apply_exchange(block: &mut MeshBlock, nb: &NeighborBlock, payload: &[f64], magnetic: bool) {
    let level = block.loc.level;
    if nb.level == level {
        apply_same_level(block, nb, payload, magnetic);
    } else if nb.level > level {
        apply_from_finer(block, nb, payload);
    } else {
        apply_from_coarser(block, nb, payload);
    }
}

fn apply_same_level(block: &mut MeshBlock, nb: &NeighborBlock, payload: &[f64], magnetic: bool) {
    let ox = [nb.ox1, nb.ox2, nb.ox3];
    let span: Vec<Span> = (0..3)
        .map(|axis| {
            let (lo, hi) = block.active_span(axis);
            same_recv_span(lo, hi, ox[axis])
        })
        .collect();
    let (nvar, ..) = block.data.u.dims();

    let mut cursor = 0;
    let mut next = || {
        let value = payload[cursor];
        cursor += 1;
        value
    };

    for n in 0..nvar {
        for k in span[2].0..=span[2].1 {
            for j in span[1].0..=span[1].1 {
                for i in span[0].0..=span[0].1 {
                    block.data.u[(n, k, j, i)] = next();
                }
            }
        }
    }

    if magnetic {
        let (f2, f3) = (block.f2(), block.f3());
        for k in span[2].0..=span[2].1 {
            for j in span[1].0..=span[1].1 {
                for i in span[0].0..=span[0].1 + 1 {
                    block.data.bx1[(k, j, i)] = next();
                }
            }
        }
        for k in span[2].0..=span[2].1 {
            for j in span[1].0..=span[1].1 + f2 {
                for i in span[0].0..=span[0].1 {
                    block.data.bx2[(k, j, i)] = next();
                }
            }
        }
        for k in span[2].0..=span[2].1 + f3 {
            for j in span[1].0..=span[1].1 {
                for i in span[0].0..=span[0].1 {
                    block.data.bx3[(k, j, i)] = next();
                }
            }
        }

        // Collapsed axes keep both face planes identical.
        if f2 == 0 {
            for k in span[2].0..=span[2].1 {
                for i in span[0].0..=span[0].1 {
                    block.data.bx2[(k, 1, i)] = block.data.bx2[(k, 0, i)];
                }
            }
        }
        if f3 == 0 {
            for j in span[1].0..=span[1].1 {
                for i in span[0].0..=span[0].1 {
                    block.data.bx3[(1, j, i)] = block.data.bx3[(0, j, i)];
                }
            }
        }
    }

    debug_assert_eq!(cursor, payload.len());
}

/// The finer neighbor already restricted; its payload lands at this block's
/// own resolution, in the half-slab the neighbor covers.
fn apply_from_finer(block: &mut MeshBlock, nb: &NeighborBlock, payload: &[f64]) {
    let ox = [nb.ox1, nb.ox2, nb.ox3];
    let fine = transverse_fine_offsets(nb);
    let span: Vec<Span> = (0..3)
        .map(|axis| {
            let (lo, hi) = block.active_span(axis);
            match ox[axis] {
                0 => {
                    if block.extended(axis) {
                        let half = block.active_count(axis) / 2;
                        let start = lo + fine[axis] as usize * half;
                        (start, start + half - 1)
                    } else {
                        (0, 0)
                    }
                }
                _ => same_recv_span(lo, hi, ox[axis]),
            }
        })
        .collect();
    let (nvar, ..) = block.data.u.dims();

    let mut cursor = 0;
    for n in 0..nvar {
        for k in span[2].0..=span[2].1 {
            for j in span[1].0..=span[1].1 {
                for i in span[0].0..=span[0].1 {
                    block.data.u[(n, k, j, i)] = payload[cursor];
                    cursor += 1;
                }
            }
        }
    }
    debug_assert_eq!(cursor, payload.len());
}

/// The coarser neighbor sent covering cells; expand each into the fine ghost
/// cells it covers.
fn apply_from_coarser(block: &mut MeshBlock, nb: &NeighborBlock, payload: &[f64]) {
    let ox = [nb.ox1, nb.ox2, nb.ox3];
    let (nvar, ..) = block.data.u.dims();

    // Per axis: the coarse slab length and the map from slab index to the
    // fine cells covered.
    let lengths: Vec<usize> = (0..3)
        .map(|axis| {
            if ox[axis] != 0 {
                1
            } else if block.extended(axis) {
                block.active_count(axis) / 2
            } else {
                1
            }
        })
        .collect();

    let spans: Vec<Span> = (0..3).map(|axis| block.active_span(axis)).collect();
    let extended: Vec<bool> = (0..3).map(|axis| block.extended(axis)).collect();

    let fine_cells = |axis: usize, t: usize| -> Vec<usize> {
        let (lo, hi) = spans[axis];
        match ox[axis] {
            1 => (hi + 1..=hi + NGHOST).collect(),
            -1 => (lo - NGHOST..=lo - 1).collect(),
            _ => {
                if extended[axis] {
                    vec![lo + 2 * t, lo + 2 * t + 1]
                } else {
                    vec![0]
                }
            }
        }
    };

    let mut cursor = 0;
    for n in 0..nvar {
        for tk in 0..lengths[2] {
            for tj in 0..lengths[1] {
                for ti in 0..lengths[0] {
                    let value = payload[cursor];
                    cursor += 1;
                    let ks = fine_cells(2, tk);
                    let js = fine_cells(1, tj);
                    let is = fine_cells(0, ti);
                    for &k in &ks {
                        for &j in &js {
                            for &i in &is {
                                block.data.u[(n, k, j, i)] = value;
                            }
                        }
                    }
                }
            }
        }
    }
    debug_assert_eq!(cursor, payload.len());
}

impl Mesh {
    /// One full round of ghost exchange over faces, edges, and corners.
    pub fn exchange_ghosts(&mut self) {
        let nslots = self.table.max_neighbors();
        for block in self.blocks.iter_mut() {
            block.bstate.start_receiving(nslots);
        }

        let magnetic = self.physics.magnetic;
        let my_rank = self.my_rank;

        // Pack and dispatch every outgoing payload; same-rank deposits are
        // buffered so blocks are never borrowed twice.
        let mut local = Vec::new();
        for block in self.blocks.iter() {
            for nb in &block.neighbors {
                let payload = pack_exchange(block, nb, magnetic);
                if nb.rank == my_rank {
                    local.push((nb.gid, nb.targetid, payload));
                } else {
                    self.comm
                        .send(nb.rank, exchange_tag(nb.lid, nb.targetid), pack_reals(&payload));
                }
            }
        }
        for (gid, slot, payload) in local {
            self.blocks
                .find_mut(gid)
                .expect("same-rank neighbor not in list")
                .bstate
                .deposit(slot, payload);
        }

        // Drain the remote arrivals.
        let pending: Vec<(i32, usize, usize, Tag)> = self
            .blocks
            .iter()
            .flat_map(|block| {
                block
                    .neighbors
                    .iter()
                    .filter(|nb| nb.rank != my_rank)
                    .map(move |nb| {
                        (
                            block.gid,
                            nb.bufid,
                            nb.rank,
                            exchange_tag(block.lid, nb.bufid),
                        )
                    })
            })
            .collect();
        for (gid, slot, rank, tag) in pending {
            let payload = unpack_reals(&self.comm.recv(rank, tag));
            self.blocks
                .find_mut(gid)
                .expect("receiving block vanished")
                .bstate
                .deposit(slot, payload);
        }

        // Apply every deposited payload.
        for block in self.blocks.iter_mut() {
            let records = block.neighbors.clone();
            for nb in &records {
                let payload = block
                    .bstate
                    .take(nb.bufid)
                    .expect("exchange payload missing");
                apply_exchange(block, nb, &payload, magnetic);
            }
            block.bstate.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::base_config;
    use super::super::{InitFlag, Mesh};
    use crate::comm::SerialComm;
    use crate::hooks::MeshHooks;

    /// Fills each block with its gid and checks that same-level ghost zones
    /// pick up the neighbor's value.
    #[test]
    fn same_level_ghosts_carry_neighbor_state() {
        let config = base_config((16, 1, 1), (4, 1, 1));
        let mut mesh = Mesh::new(&config, Box::new(SerialComm)).unwrap();

        for block in mesh.blocks.iter_mut() {
            let gid = block.gid as f64;
            block.data.u.fill(gid);
        }
        mesh.exchange_ghosts();

        let block = mesh.find_block(1).unwrap();
        // Inner-x ghosts hold block 0, outer-x ghosts hold block 2.
        assert_eq!(block.data.u[(0, 0, 0, 0)], 0.0);
        assert_eq!(block.data.u[(0, 0, 0, 1)], 0.0);
        assert_eq!(block.data.u[(0, 0, 0, block.ie + 1)], 2.0);
        assert_eq!(block.data.u[(0, 0, 0, block.ie + 2)], 2.0);
    }

    /// Across a level jump, the fine block sees piecewise-constant coarse
    /// data and the coarse block sees restricted fine data.
    #[test]
    fn multilevel_ghosts_cross_the_jump() {
        let mut config = base_config((16, 1, 1), (4, 1, 1));
        config.refinement.push(crate::config::RefinementRegion {
            x1min: 0.25,
            x1max: 0.5,
            x2min: 0.0,
            x2max: 0.0,
            x3min: 0.0,
            x3max: 0.0,
            level: 1,
        });
        let mut mesh = Mesh::new(&config, Box::new(SerialComm)).unwrap();

        let mut hooks = MeshHooks::new();
        hooks.enroll_problem_generator(|block| {
            let level = block.loc.level as f64;
            block.data.u.fill(level);
        });
        mesh.initialize(InitFlag::Fresh, &hooks).unwrap();

        // Block 1 is the left fine leaf (level root+1); its coarser inner
        // neighbor fills the inner ghosts with the coarse value.
        let fine = mesh.find_block(1).unwrap();
        let fine_level = fine.loc.level as f64;
        assert_eq!(fine.data.u[(0, 0, 0, 0)], fine_level - 1.0);
        assert_eq!(fine.data.u[(0, 0, 0, 1)], fine_level - 1.0);
        // Its outer neighbor is the same-level right fine leaf.
        assert_eq!(fine.data.u[(0, 0, 0, fine.ie + 1)], fine_level);

        // Block 0 (coarse) sees the restricted fine value in its outer
        // ghosts.
        let coarse = mesh.find_block(0).unwrap();
        assert_eq!(coarse.data.u[(0, 0, 0, coarse.ie + 1)], fine_level);
    }
}
