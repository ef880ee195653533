//! Neighbor enumeration and the canonical buffer-id catalog.
//!
//! Every block lists up to `maxneighbor` adjacent blocks over faces, edges,
//! and corners. Each record carries two slot numbers: `bufid`, the
//! position-determined slot this neighbor occupies in the block's own
//! catalog, and `targetid`, the slot the block occupies in the neighbor's
//! catalog. Exchange messages are deposited into pre-allocated slots keyed by
//! these ids, so receivers accept out-of-order arrivals.

use crate::geometry::BlockTree;

use super::block::MeshBlock;

/// Adjacency class of a neighbor record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborKind {
    Face,
    Edge,
    Corner,
}

/// One entry of a block's neighbor list.
#[derive(Debug, Clone, Copy)]
pub struct NeighborBlock {
    pub rank: usize,
    pub level: i32,
    pub gid: i32,
    pub lid: i32,
    pub ox1: i64,
    pub ox2: i64,
    pub ox3: i64,
    pub kind: NeighborKind,
    /// Slot of this neighbor in the local catalog.
    pub bufid: usize,
    /// Slot of this block in the neighbor's catalog.
    pub targetid: usize,
    /// Fine-subdivision indices when the neighbor is finer.
    pub fi1: i64,
    pub fi2: i64,
}

/// Stable encoding of a direction and fine-index pair. Bijective over the
/// admissible tuples, independent of block identity, identical on every
/// rank.
fn encode(ox1: i64, ox2: i64, ox3: i64, fi1: i64, fi2: i64) -> u16 {
    (((ox1 + 1) as u16) << 6)
        | (((ox2 + 1) as u16) << 4)
        | (((ox3 + 1) as u16) << 2)
        | ((fi1 as u16) << 1)
        | fi2 as u16
}

/// The per-mesh catalog of buffer slots. Construction order fixes the slot
/// of every `(direction, fine-index)` tuple; the neighbor search advances its
/// slot counter in exactly the same order, so counter values and catalog
/// positions agree by construction.
#[derive(Debug, Clone)]
pub struct BufferIdTable {
    ids: Vec<u16>,
    /// Fine-subdivision counts along the first and second transverse axes.
    pub nf1: usize,
    pub nf2: usize,
    pub dim: usize,
    pub face_only: bool,
}

impl BufferIdTable {
    pub fn new(dim: usize, multilevel: bool, face_only: bool) -> Self {
        let nf1 = if multilevel && dim >= 2 { 2 } else { 1 };
        let nf2 = if multilevel && dim >= 3 { 2 } else { 1 };
        let mut ids = Vec::new();

        // Faces, one group of nf1*nf2 slots per direction.
        for n in [-1_i64, 1] {
            for f2 in 0..nf2 as i64 {
                for f1 in 0..nf1 as i64 {
                    ids.push(encode(n, 0, 0, f1, f2));
                }
            }
        }
        if dim >= 2 {
            for n in [-1_i64, 1] {
                for f2 in 0..nf2 as i64 {
                    for f1 in 0..nf1 as i64 {
                        ids.push(encode(0, n, 0, f1, f2));
                    }
                }
            }
        }
        if dim == 3 {
            for n in [-1_i64, 1] {
                for f2 in 0..nf2 as i64 {
                    for f1 in 0..nf1 as i64 {
                        ids.push(encode(0, 0, n, f1, f2));
                    }
                }
            }
        }

        if !face_only {
            if dim >= 2 {
                // x1-x2 edges, subdivided along x3.
                for m in [-1_i64, 1] {
                    for n in [-1_i64, 1] {
                        for f1 in 0..nf2 as i64 {
                            ids.push(encode(n, m, 0, f1, 0));
                        }
                    }
                }
            }
            if dim == 3 {
                // x1-x3 edges, subdivided along x2.
                for m in [-1_i64, 1] {
                    for n in [-1_i64, 1] {
                        for f1 in 0..nf1 as i64 {
                            ids.push(encode(n, 0, m, f1, 0));
                        }
                    }
                }
                // x2-x3 edges, subdivided along x1.
                for m in [-1_i64, 1] {
                    for n in [-1_i64, 1] {
                        for f1 in 0..nf1 as i64 {
                            ids.push(encode(0, n, m, f1, 0));
                        }
                    }
                }
                // Corners.
                for l in [-1_i64, 1] {
                    for m in [-1_i64, 1] {
                        for n in [-1_i64, 1] {
                            ids.push(encode(n, m, l, 0, 0));
                        }
                    }
                }
            }
        }

        Self {
            ids,
            nf1,
            nf2,
            dim,
            face_only,
        }
    }

    /// Largest possible neighbor count, which is also the number of slots.
    pub fn max_neighbors(&self) -> usize {
        self.ids.len()
    }

    /// The slot of a `(direction, fine-index)` tuple.
    pub fn find(&self, ox1: i64, ox2: i64, ox3: i64, fi1: i64, fi2: i64) -> usize {
        let id = encode(ox1, ox2, ox3, fi1, fi2);
        self.ids
            .iter()
            .position(|&entry| entry == id)
            .expect("direction outside the catalog")
    }
}

impl MeshBlock {
    /// Rebuilds the neighbor list of this block from the tree and the
    /// current distribution. Slots for absent neighbors are skipped but
    /// still advance the counter, keeping buffer ids position-determined.
    pub fn search_and_set_neighbors(
        &mut self,
        tree: &BlockTree,
        ranklist: &[usize],
        nslist: &[usize],
        table: &BufferIdTable,
    ) {
        let loc = self.loc;
        let (myfx1, myfx2, myfx3) = loc.fine_offsets();
        let myox1 = myfx1 * 2 - 1;
        let myox2 = if self.block_size.nx2 > 1 { myfx2 * 2 - 1 } else { 0 };
        let myox3 = if self.block_size.nx3 > 1 { myfx3 * 2 - 1 } else { 0 };
        let (nf1, nf2) = (table.nf1 as i64, table.nf2 as i64);

        let mut records = Vec::new();
        let mut bufid = 0usize;
        self.nblevel = [[[-1; 3]; 3]; 3];
        self.nblevel[1][1][1] = loc.level;

        let record = |records: &mut Vec<NeighborBlock>,
                      gid: i32,
                      level: i32,
                      (ox1, ox2, ox3): (i64, i64, i64),
                      kind: NeighborKind,
                      bufid: usize,
                      targetid: usize,
                      fi1: i64,
                      fi2: i64| {
            let rank = ranklist[gid as usize];
            records.push(NeighborBlock {
                rank,
                level,
                gid,
                lid: gid - nslist[rank] as i32,
                ox1,
                ox2,
                ox3,
                kind,
                bufid,
                targetid,
                fi1,
                fi2,
            });
        };

        // x1 faces.
        for n in [-1_i64, 1] {
            let Some(nb) = tree.find_neighbor(loc, n, 0, 0) else {
                bufid += (nf1 * nf2) as usize;
                continue;
            };
            if !tree.is_leaf(nb) {
                // Finer: one record per abutting child leaf.
                let fface = (1 - (n + 1) / 2) as usize;
                self.nblevel[1][1][(n + 1) as usize] = loc.level + 1;
                for f2 in 0..nf2 {
                    for f1 in 0..nf1 {
                        let leaf = tree
                            .child(nb, fface, f1 as usize, f2 as usize)
                            .expect("finer neighbor missing abutting child");
                        let tbid = table.find(-n, 0, 0, 0, 0);
                        record(
                            &mut records,
                            tree.gid(leaf),
                            tree.location(leaf).level,
                            (n, 0, 0),
                            NeighborKind::Face,
                            bufid,
                            tbid,
                            f1,
                            f2,
                        );
                        bufid += 1;
                    }
                }
            } else {
                let nlevel = tree.location(nb).level;
                self.nblevel[1][1][(n + 1) as usize] = nlevel;
                let tbid = if nlevel == loc.level {
                    table.find(-n, 0, 0, 0, 0)
                } else {
                    table.find(-n, 0, 0, myfx2, myfx3)
                };
                record(
                    &mut records,
                    tree.gid(nb),
                    nlevel,
                    (n, 0, 0),
                    NeighborKind::Face,
                    bufid,
                    tbid,
                    0,
                    0,
                );
                bufid += (nf1 * nf2) as usize;
            }
        }

        if self.block_size.nx2 == 1 {
            self.neighbors = records;
            return;
        }

        // x2 faces.
        for n in [-1_i64, 1] {
            let Some(nb) = tree.find_neighbor(loc, 0, n, 0) else {
                bufid += (nf1 * nf2) as usize;
                continue;
            };
            if !tree.is_leaf(nb) {
                let fface = (1 - (n + 1) / 2) as usize;
                self.nblevel[1][(n + 1) as usize][1] = loc.level + 1;
                for f2 in 0..nf2 {
                    for f1 in 0..nf1 {
                        let leaf = tree
                            .child(nb, f1 as usize, fface, f2 as usize)
                            .expect("finer neighbor missing abutting child");
                        let tbid = table.find(0, -n, 0, 0, 0);
                        record(
                            &mut records,
                            tree.gid(leaf),
                            tree.location(leaf).level,
                            (0, n, 0),
                            NeighborKind::Face,
                            bufid,
                            tbid,
                            f1,
                            f2,
                        );
                        bufid += 1;
                    }
                }
            } else {
                let nlevel = tree.location(nb).level;
                self.nblevel[1][(n + 1) as usize][1] = nlevel;
                let tbid = if nlevel == loc.level {
                    table.find(0, -n, 0, 0, 0)
                } else {
                    table.find(0, -n, 0, myfx1, myfx3)
                };
                record(
                    &mut records,
                    tree.gid(nb),
                    nlevel,
                    (0, n, 0),
                    NeighborKind::Face,
                    bufid,
                    tbid,
                    0,
                    0,
                );
                bufid += (nf1 * nf2) as usize;
            }
        }

        // x3 faces.
        if self.block_size.nx3 > 1 {
            for n in [-1_i64, 1] {
                let Some(nb) = tree.find_neighbor(loc, 0, 0, n) else {
                    bufid += (nf1 * nf2) as usize;
                    continue;
                };
                if !tree.is_leaf(nb) {
                    let fface = (1 - (n + 1) / 2) as usize;
                    self.nblevel[(n + 1) as usize][1][1] = loc.level + 1;
                    for f2 in 0..nf2 {
                        for f1 in 0..nf1 {
                            let leaf = tree
                                .child(nb, f1 as usize, f2 as usize, fface)
                                .expect("finer neighbor missing abutting child");
                            let tbid = table.find(0, 0, -n, 0, 0);
                            record(
                                &mut records,
                                tree.gid(leaf),
                                tree.location(leaf).level,
                                (0, 0, n),
                                NeighborKind::Face,
                                bufid,
                                tbid,
                                f1,
                                f2,
                            );
                            bufid += 1;
                        }
                    }
                } else {
                    let nlevel = tree.location(nb).level;
                    self.nblevel[(n + 1) as usize][1][1] = nlevel;
                    let tbid = if nlevel == loc.level {
                        table.find(0, 0, -n, 0, 0)
                    } else {
                        table.find(0, 0, -n, myfx1, myfx2)
                    };
                    record(
                        &mut records,
                        tree.gid(nb),
                        nlevel,
                        (0, 0, n),
                        NeighborKind::Face,
                        bufid,
                        tbid,
                        0,
                        0,
                    );
                    bufid += (nf1 * nf2) as usize;
                }
            }
        }

        if table.face_only {
            self.neighbors = records;
            return;
        }

        // x1-x2 edges.
        for m in [-1_i64, 1] {
            for n in [-1_i64, 1] {
                let Some(nb) = tree.find_neighbor(loc, n, m, 0) else {
                    bufid += nf2 as usize;
                    continue;
                };
                if !tree.is_leaf(nb) {
                    let ff1 = (1 - (n + 1) / 2) as usize;
                    let ff2 = (1 - (m + 1) / 2) as usize;
                    self.nblevel[1][(m + 1) as usize][(n + 1) as usize] = loc.level + 1;
                    for f1 in 0..nf2 {
                        let leaf = tree
                            .child(nb, ff1, ff2, f1 as usize)
                            .expect("finer neighbor missing abutting child");
                        let tbid = table.find(-n, -m, 0, 0, 0);
                        record(
                            &mut records,
                            tree.gid(leaf),
                            tree.location(leaf).level,
                            (n, m, 0),
                            NeighborKind::Edge,
                            bufid,
                            tbid,
                            f1,
                            0,
                        );
                        bufid += 1;
                    }
                } else {
                    let nlevel = tree.location(nb).level;
                    self.nblevel[1][(m + 1) as usize][(n + 1) as usize] = nlevel;
                    let tbid = if nlevel == loc.level {
                        table.find(-n, -m, 0, 0, 0)
                    } else {
                        table.find(-n, -m, 0, myfx3, 0)
                    };
                    // Deduplication: a coarser diagonal exchange is booked by
                    // the child actually touching it.
                    if nlevel >= loc.level || (myox1 == n && myox2 == m) {
                        record(
                            &mut records,
                            tree.gid(nb),
                            nlevel,
                            (n, m, 0),
                            NeighborKind::Edge,
                            bufid,
                            tbid,
                            0,
                            0,
                        );
                    }
                    bufid += nf2 as usize;
                }
            }
        }

        if self.block_size.nx3 == 1 {
            self.neighbors = records;
            return;
        }

        // x1-x3 edges.
        for m in [-1_i64, 1] {
            for n in [-1_i64, 1] {
                let Some(nb) = tree.find_neighbor(loc, n, 0, m) else {
                    bufid += nf1 as usize;
                    continue;
                };
                if !tree.is_leaf(nb) {
                    let ff1 = (1 - (n + 1) / 2) as usize;
                    let ff2 = (1 - (m + 1) / 2) as usize;
                    self.nblevel[(m + 1) as usize][1][(n + 1) as usize] = loc.level + 1;
                    for f1 in 0..nf1 {
                        let leaf = tree
                            .child(nb, ff1, f1 as usize, ff2)
                            .expect("finer neighbor missing abutting child");
                        let tbid = table.find(-n, 0, -m, 0, 0);
                        record(
                            &mut records,
                            tree.gid(leaf),
                            tree.location(leaf).level,
                            (n, 0, m),
                            NeighborKind::Edge,
                            bufid,
                            tbid,
                            f1,
                            0,
                        );
                        bufid += 1;
                    }
                } else {
                    let nlevel = tree.location(nb).level;
                    self.nblevel[(m + 1) as usize][1][(n + 1) as usize] = nlevel;
                    let tbid = if nlevel == loc.level {
                        table.find(-n, 0, -m, 0, 0)
                    } else {
                        table.find(-n, 0, -m, myfx2, 0)
                    };
                    if nlevel >= loc.level || (myox1 == n && myox3 == m) {
                        record(
                            &mut records,
                            tree.gid(nb),
                            nlevel,
                            (n, 0, m),
                            NeighborKind::Edge,
                            bufid,
                            tbid,
                            0,
                            0,
                        );
                    }
                    bufid += nf1 as usize;
                }
            }
        }

        // x2-x3 edges.
        for m in [-1_i64, 1] {
            for n in [-1_i64, 1] {
                let Some(nb) = tree.find_neighbor(loc, 0, n, m) else {
                    bufid += nf1 as usize;
                    continue;
                };
                if !tree.is_leaf(nb) {
                    let ff1 = (1 - (n + 1) / 2) as usize;
                    let ff2 = (1 - (m + 1) / 2) as usize;
                    self.nblevel[(m + 1) as usize][(n + 1) as usize][1] = loc.level + 1;
                    for f1 in 0..nf1 {
                        let leaf = tree
                            .child(nb, f1 as usize, ff1, ff2)
                            .expect("finer neighbor missing abutting child");
                        let tbid = table.find(0, -n, -m, 0, 0);
                        record(
                            &mut records,
                            tree.gid(leaf),
                            tree.location(leaf).level,
                            (0, n, m),
                            NeighborKind::Edge,
                            bufid,
                            tbid,
                            f1,
                            0,
                        );
                        bufid += 1;
                    }
                } else {
                    let nlevel = tree.location(nb).level;
                    self.nblevel[(m + 1) as usize][(n + 1) as usize][1] = nlevel;
                    let tbid = if nlevel == loc.level {
                        table.find(0, -n, -m, 0, 0)
                    } else {
                        table.find(0, -n, -m, myfx1, 0)
                    };
                    if nlevel >= loc.level || (myox2 == n && myox3 == m) {
                        record(
                            &mut records,
                            tree.gid(nb),
                            nlevel,
                            (0, n, m),
                            NeighborKind::Edge,
                            bufid,
                            tbid,
                            0,
                            0,
                        );
                    }
                    bufid += nf1 as usize;
                }
            }
        }

        // Corners.
        for l in [-1_i64, 1] {
            for m in [-1_i64, 1] {
                for n in [-1_i64, 1] {
                    let Some(mut nb) = tree.find_neighbor(loc, n, m, l) else {
                        bufid += 1;
                        continue;
                    };
                    if !tree.is_leaf(nb) {
                        let ff1 = (1 - (n + 1) / 2) as usize;
                        let ff2 = (1 - (m + 1) / 2) as usize;
                        let ff3 = (1 - (l + 1) / 2) as usize;
                        nb = tree
                            .child(nb, ff1, ff2, ff3)
                            .expect("finer neighbor missing abutting child");
                        debug_assert!(tree.is_leaf(nb));
                    }
                    let nlevel = tree.location(nb).level;
                    self.nblevel[(l + 1) as usize][(m + 1) as usize][(n + 1) as usize] = nlevel;
                    if nlevel >= loc.level || (myox1 == n && myox2 == m && myox3 == l) {
                        let tbid = table.find(-n, -m, -l, 0, 0);
                        record(
                            &mut records,
                            tree.gid(nb),
                            nlevel,
                            (n, m, l),
                            NeighborKind::Corner,
                            bufid,
                            tbid,
                            0,
                            0,
                        );
                    }
                    bufid += 1;
                }
            }
        }

        self.neighbors = records;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BoundaryFlag, PhysicsConfig};
    use crate::geometry::{LogicalLocation, RegionSize};

    #[test]
    fn catalog_sizes() {
        assert_eq!(BufferIdTable::new(1, false, true).max_neighbors(), 2);
        assert_eq!(BufferIdTable::new(2, true, false).max_neighbors(), 12);
        assert_eq!(BufferIdTable::new(3, false, true).max_neighbors(), 6);
        assert_eq!(BufferIdTable::new(3, true, true).max_neighbors(), 24);
        assert_eq!(BufferIdTable::new(3, true, false).max_neighbors(), 56);
    }

    #[test]
    fn catalog_is_bijective() {
        let table = BufferIdTable::new(3, true, false);
        let mut seen = std::collections::HashSet::new();
        for slot in 0..table.max_neighbors() {
            assert!(seen.insert(table.ids[slot]));
        }
        // Base slots of opposite faces are distinct and invertible.
        let inner = table.find(-1, 0, 0, 0, 0);
        let outer = table.find(1, 0, 0, 0, 0);
        assert_ne!(inner, outer);
    }

    fn test_block(loc: LogicalLocation, nx: (usize, usize, usize)) -> MeshBlock {
        let size = RegionSize {
            x1min: 0.0,
            x1max: 1.0,
            x2min: 0.0,
            x2max: 1.0,
            x3min: 0.0,
            x3max: 1.0,
            x1rat: 1.0,
            x2rat: 1.0,
            x3rat: 1.0,
            nx1: nx.0,
            nx2: nx.1,
            nx3: nx.2,
        };
        MeshBlock::new(
            0,
            0,
            loc,
            size,
            [BoundaryFlag::Outflow; 6],
            &PhysicsConfig::default(),
            true,
        )
    }

    /// Builds the tree, resolves every leaf's neighbors on one rank, and
    /// returns the blocks keyed by gid.
    fn resolve_all(
        mut tree: crate::geometry::BlockTree,
        nx: (usize, usize, usize),
        table: &BufferIdTable,
    ) -> Vec<MeshBlock> {
        let (loclist, _) = tree.enumerate();
        let ranklist = vec![0usize; loclist.len()];
        let nslist = vec![0usize];

        loclist
            .iter()
            .enumerate()
            .map(|(gid, &loc)| {
                let mut block = test_block(loc, nx);
                block.gid = gid as i32;
                block.lid = gid as i32;
                block.search_and_set_neighbors(&tree, &ranklist, &nslist, table);
                block
            })
            .collect()
    }

    #[test]
    fn face_records_are_symmetric() {
        use crate::geometry::BlockTree;

        let mut tree = BlockTree::new([2, 2, 1], 2, 1, 63, [BoundaryFlag::Outflow; 6]);
        let mut nnew = 0;
        tree.add_block(LogicalLocation::new(2, 0, 0, 0), &mut nnew)
            .unwrap();

        let table = BufferIdTable::new(2, true, false);
        let blocks = resolve_all(tree, (4, 4, 1), &table);

        for block in &blocks {
            for record in block
                .neighbors
                .iter()
                .filter(|r| r.kind == NeighborKind::Face)
            {
                let other = &blocks[record.gid as usize];
                let mirror = other
                    .neighbors
                    .iter()
                    .find(|s| {
                        s.gid == block.gid
                            && s.ox1 == -record.ox1
                            && s.ox2 == -record.ox2
                            && s.ox3 == -record.ox3
                    })
                    .expect("neighbor does not list us back");
                assert_eq!(record.targetid, mirror.bufid);
                assert_eq!(mirror.targetid, record.bufid);
            }
        }
    }

    #[test]
    fn coarse_face_neighbor_of_refined_leaf() {
        use crate::geometry::BlockTree;

        // 4 x 1 root grid, two level-3 leaves replacing root block 1.
        let mut tree = BlockTree::new([4, 1, 1], 1, 2, 63, [BoundaryFlag::Outflow; 6]);
        let mut nnew = 0;
        tree.add_block(LogicalLocation::new(3, 2, 0, 0), &mut nnew)
            .unwrap();

        let table = BufferIdTable::new(1, true, false);
        let blocks = resolve_all(tree, (4, 1, 1), &table);
        assert_eq!(blocks.len(), 5);

        // Leftmost refined leaf: its inner-x1 neighbor is the single coarser
        // root leaf.
        let fine = blocks
            .iter()
            .find(|b| b.loc == LogicalLocation::new(3, 2, 0, 0))
            .unwrap();
        let inner: Vec<_> = fine.neighbors.iter().filter(|r| r.ox1 == -1).collect();
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0].level, 2);

        // The coarse neighbor lists both abutting fine leaves on that face.
        let coarse = blocks
            .iter()
            .find(|b| b.loc == LogicalLocation::new(2, 0, 0, 0))
            .unwrap();
        let toward_fine: Vec<_> = coarse.neighbors.iter().filter(|r| r.ox1 == 1).collect();
        assert_eq!(toward_fine.len(), 1);
        assert_eq!(toward_fine[0].level, 3);
    }

    #[test]
    fn refined_center_in_three_dimensions() {
        use crate::geometry::BlockTree;

        let mut tree = BlockTree::new([4, 4, 4], 3, 2, 63, [BoundaryFlag::Periodic; 6]);
        let center = LogicalLocation::new(2, 1, 1, 1);
        let node = tree.find_block(center).unwrap();
        let mut nnew = 0;
        tree.refine(node, &mut nnew).unwrap();
        assert_eq!(nnew, 7);

        let table = BufferIdTable::new(3, true, false);
        assert_eq!(table.max_neighbors(), 56);
        let blocks = resolve_all(tree, (4, 4, 4), &table);

        // One of the new children: a coarser record on its outer face, and
        // sibling records inward.
        let child = blocks
            .iter()
            .find(|b| b.loc == center.child(0, 0, 0))
            .unwrap();
        let outer: Vec<_> = child
            .neighbors
            .iter()
            .filter(|r| (r.ox1, r.ox2, r.ox3) == (-1, 0, 0))
            .collect();
        assert_eq!(outer.len(), 1);
        assert_eq!(outer[0].level, 2);

        // The coarse face neighbor at (0,1,1) lists all four face cousins
        // with distinct fine indices.
        let coarse = blocks
            .iter()
            .find(|b| b.loc == LogicalLocation::new(2, 0, 1, 1))
            .unwrap();
        let cousins: Vec<_> = coarse
            .neighbors
            .iter()
            .filter(|r| (r.ox1, r.ox2, r.ox3) == (1, 0, 0) && r.level == 3)
            .collect();
        assert_eq!(cousins.len(), 4);
        let fine_pairs: std::collections::HashSet<_> =
            cousins.iter().map(|r| (r.fi1, r.fi2)).collect();
        assert_eq!(fine_pairs.len(), 4);
    }
}
