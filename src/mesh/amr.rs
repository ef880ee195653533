//! The adaptive refinement step.
//!
//! Runs after a time step when the mesh is adaptive. Phase A mutates the
//! tree identically on every rank from identically gathered flags; the
//! remaining phases propagate costs, rebalance, migrate field data along the
//! six relation paths (same/coarser/finer x local/remote), and re-initialize.
//! Any transport failure mid-migration leaves the mesh half-built and is
//! fatal by design; there are no retries.

use bytes::{Buf, BufMut};

use crate::comm::{pack_reals, unpack_reals, Communicator, Tag};
use crate::error::Result;
use crate::geometry::LogicalLocation;
use crate::hooks::{MeshHooks, RefinementFlag};

use super::block::MeshBlock;
use super::refine::{
    prolong_cc, prolong_internal_field, prolong_shared_fx1, prolong_shared_fx2, prolong_shared_fx3,
    restrict_cc, restrict_fx1, restrict_fx2, restrict_fx3, FineCoarseMap,
};
use super::{load_balance, BlockList, InitFlag, Mesh};

/// Migration tag: the receiver's new local id and the contributing octant.
/// Unique per source-destination leg, so a receiver can accept all its
/// payloads in any order.
fn amr_tag(lid: usize, ox1: i64, ox2: i64, ox3: i64) -> Tag {
    ((lid as u64) << 3) | ((ox1 as u64) << 2) | ((ox2 as u64) << 1) | ox3 as u64
}

fn put_location(buf: &mut Vec<u8>, loc: LogicalLocation) {
    buf.put_i32_ne(loc.level);
    buf.put_i64_ne(loc.lx1);
    buf.put_i64_ne(loc.lx2);
    buf.put_i64_ne(loc.lx3);
}

fn get_location(buf: &mut &[u8]) -> LogicalLocation {
    let level = buf.get_i32_ne();
    let lx1 = buf.get_i64_ne();
    let lx2 = buf.get_i64_ne();
    let lx3 = buf.get_i64_ne();
    LogicalLocation::new(level, lx1, lx2, lx3)
}

impl Mesh {
    /// One full adaptive-refinement cycle.
    pub fn adaptive_mesh_refinement(&mut self, hooks: &MeshHooks) -> Result<()> {
        let nlbl = 1usize << self.tree.dim();

        // Phase A1: all-gather the flagged locations so every rank derives
        // the same mutation from the same list.
        let mut blob = Vec::new();
        let local_ref: Vec<LogicalLocation> = self
            .blocks
            .iter()
            .filter(|b| b.refine_flag == RefinementFlag::Refine)
            .map(|b| b.loc)
            .collect();
        let local_deref: Vec<LogicalLocation> = self
            .blocks
            .iter()
            .filter(|b| b.refine_flag == RefinementFlag::Derefine)
            .map(|b| b.loc)
            .collect();
        blob.put_u32_ne(local_ref.len() as u32);
        blob.put_u32_ne(local_deref.len() as u32);
        for &loc in local_ref.iter().chain(&local_deref) {
            put_location(&mut blob, loc);
        }

        let mut lref = Vec::new();
        let mut lderef = Vec::new();
        for rank_blob in self.comm.allgather(blob) {
            let mut cursor = rank_blob.as_slice();
            let nref = cursor.get_u32_ne() as usize;
            let nderef = cursor.get_u32_ne() as usize;
            for _ in 0..nref {
                lref.push(get_location(&mut cursor));
            }
            for _ in 0..nderef {
                lderef.push(get_location(&mut cursor));
            }
        }

        if lref.is_empty() && lderef.is_empty() {
            return Ok(());
        }

        // Phase A2/A3: a parent is derefined only when its whole octet is
        // flagged; candidates are processed deepest first so earlier
        // collapses cannot invalidate later ones.
        let mut clderef = Vec::new();
        if lderef.len() >= nlbl {
            let flagged: std::collections::HashSet<LogicalLocation> =
                lderef.iter().copied().collect();
            for &loc in &lderef {
                if !loc.is_octet_base() {
                    continue;
                }
                let parent = loc.parent();
                let complete = (0..nlbl).all(|slot| {
                    let (ox1, ox2, ox3) =
                        ((slot & 1) as i64, ((slot >> 1) & 1) as i64, ((slot >> 2) & 1) as i64);
                    flagged.contains(&parent.child(ox1, ox2, ox3))
                });
                if complete {
                    clderef.push(parent);
                }
            }
            clderef.sort_unstable_by(|a, b| b.cmp(a));
        }

        // Phase A4: refinements first (cascading), then derefinements.
        let mut nnew = 0;
        let mut ndel = 0;
        for &loc in &lref {
            if let Some(node) = self.tree.find_block(loc) {
                self.tree.refine(node, &mut nnew)?;
            }
        }
        for &loc in &clderef {
            if let Some(node) = self.tree.find_block(loc) {
                self.tree.derefine(node, &mut ndel);
            }
        }

        // Phase A5: enumerate the new forest and relate it to the old one.
        let ntot = (self.nbtotal as i64 + nnew as i64 - ndel as i64) as usize;
        let (newloc, newtoold) = self.tree.enumerate();
        debug_assert_eq!(newloc.len(), ntot);

        let mut oldtonew = vec![0usize; self.nbtotal];
        let mut k = 1;
        for n in 1..ntot {
            let prev = newtoold[n - 1];
            let cur = newtoold[n];
            if cur == prev + 1 {
                oldtonew[k] = n;
                k += 1;
            } else if cur == prev + nlbl as i32 {
                // A collapsed octet: the remaining children map to the
                // block just passed.
                for _ in 0..nlbl - 1 {
                    oldtonew[k] = n - 1;
                    k += 1;
                }
                oldtonew[k] = n;
                k += 1;
            }
        }
        while k < self.nbtotal {
            oldtonew[k] = ntot - 1;
            k += 1;
        }

        // Phase B: cost propagation.
        let mut newcost = vec![0.0; ntot];
        for n in 0..ntot {
            let pg = newtoold[n] as usize;
            if newloc[n].level >= self.loclist[pg].level {
                newcost[n] = self.costlist[pg];
            } else {
                let sum: f64 = self.costlist[pg..pg + nlbl].iter().sum();
                newcost[n] = sum / nlbl as f64;
            }
        }

        let old_loclist = std::mem::replace(&mut self.loclist, Vec::new());
        let old_ranklist = std::mem::replace(&mut self.ranklist, Vec::new());
        let onbs = self.nslist[self.my_rank];
        let onbe = onbs + self.nblist[self.my_rank];

        // Phase C: new balance.
        let balance = load_balance(&newcost, self.nranks, true)?;
        let newrank = balance.rank;
        let new_nslist = balance.start;
        let new_nblist = balance.count;
        let nbs = new_nslist[self.my_rank];
        let nbe = nbs + new_nblist[self.my_rank];

        let me = self.my_rank;
        let magnetic = self.physics.magnetic;

        // Phase D1: send every old local block that lands elsewhere.
        for on in onbs..onbe {
            let nn = oldtonew[on];
            let oloc = old_loclist[on];
            let block = self.blocks.find(on as i32).expect("old block missing");

            if newloc[nn].level == oloc.level {
                if newrank[nn] != me {
                    let payload = pack_same(block, magnetic);
                    let lid = nn - new_nslist[newrank[nn]];
                    self.comm
                        .send(newrank[nn], amr_tag(lid, 0, 0, 0), pack_reals(&payload));
                }
            } else if newloc[nn].level > oloc.level {
                // Coarse to fine: one payload per remote child octant.
                for l in 0..nlbl {
                    if newrank[nn + l] == me {
                        continue;
                    }
                    let payload = pack_c2f(block, newloc[nn + l].fine_offsets(), magnetic);
                    let lid = nn + l - new_nslist[newrank[nn + l]];
                    self.comm
                        .send(newrank[nn + l], amr_tag(lid, 0, 0, 0), pack_reals(&payload));
                }
            } else {
                // Fine to coarse: this child contributes its octant.
                if newrank[nn] != me {
                    let payload = pack_f2c(block, magnetic);
                    let (ox1, ox2, ox3) = oloc.fine_offsets();
                    let lid = nn - new_nslist[newrank[nn]];
                    self.comm
                        .send(newrank[nn], amr_tag(lid, ox1, ox2, ox3), pack_reals(&payload));
                }
            }
        }

        // Phase D2: build the new block list, filling from local sources.
        let mut newlist = BlockList::new();
        for n in nbs..nbe {
            let on = newtoold[n] as usize;
            let oloc = old_loclist[on];

            if old_ranklist[on] == me && oloc.level == newloc[n].level {
                // Staying on this rank at the same level: relink in place.
                let mut block = self.blocks.detach(on as i32).expect("surviving block missing");
                block.gid = n as i32;
                block.lid = (n - nbs) as i32;
                block.cost = newcost[n];
                newlist.push(block);
                continue;
            }

            let (block_size, block_bcs) = self.set_block_size_and_boundaries(newloc[n]);
            let mut block = MeshBlock::new(
                n as i32,
                (n - nbs) as i32,
                newloc[n],
                block_size,
                block_bcs,
                &self.physics,
                self.multilevel,
            );
            block.cost = newcost[n];

            if oloc.level > newloc[n].level {
                // Collapsing: gather whichever children live here.
                for l in 0..nlbl {
                    if old_ranklist[on + l] != me {
                        continue;
                    }
                    let child = self.blocks.find((on + l) as i32).expect("child missing");
                    let payload = pack_f2c(child, magnetic);
                    apply_f2c(&mut block, old_loclist[on + l].fine_offsets(), &payload, magnetic);
                }
            } else if oloc.level < newloc[n].level && old_ranklist[on] == me {
                let parent = self.blocks.find(on as i32).expect("parent missing");
                let payload = pack_c2f(parent, newloc[n].fine_offsets(), magnetic);
                apply_c2f(&mut block, &payload, magnetic);
            }

            newlist.push(block);
        }

        // Phase D3: receive the remote contributions.
        for n in nbs..nbe {
            let on = newtoold[n] as usize;
            let oloc = old_loclist[on];
            let lid = n - nbs;

            if oloc.level == newloc[n].level {
                if old_ranklist[on] != me {
                    let payload =
                        unpack_reals(&self.comm.recv(old_ranklist[on], amr_tag(lid, 0, 0, 0)));
                    let block = newlist.find_mut(n as i32).expect("new block missing");
                    apply_same(block, &payload, magnetic);
                }
            } else if oloc.level > newloc[n].level {
                for l in 0..nlbl {
                    if old_ranklist[on + l] == me {
                        continue;
                    }
                    let (ox1, ox2, ox3) = old_loclist[on + l].fine_offsets();
                    let payload = unpack_reals(
                        &self
                            .comm
                            .recv(old_ranklist[on + l], amr_tag(lid, ox1, ox2, ox3)),
                    );
                    let block = newlist.find_mut(n as i32).expect("new block missing");
                    apply_f2c(block, (ox1, ox2, ox3), &payload, magnetic);
                }
            } else if old_ranklist[on] != me {
                let payload =
                    unpack_reals(&self.comm.recv(old_ranklist[on], amr_tag(lid, 0, 0, 0)));
                let block = newlist.find_mut(n as i32).expect("new block missing");
                apply_c2f(block, &payload, magnetic);
            }
        }

        // Phase E: install the new structures atomically, then re-resolve
        // neighbors and re-initialize.
        self.blocks.clear();
        self.blocks = newlist;
        self.loclist = newloc;
        self.ranklist = newrank;
        self.costlist = newcost;
        self.nslist = new_nslist;
        self.nblist = new_nblist;
        self.nbtotal = ntot;
        self.current_level = self
            .loclist
            .iter()
            .map(|loc| loc.level)
            .max()
            .unwrap_or(self.root_level);

        self.resolve_neighbors();
        self.initialize(InitFlag::PostRegrid, hooks)?;
        Ok(())
    }
}

/// Packs a block's whole state for a same-level move: active conservative
/// cells plus the three face arrays, each with its own extents.
fn pack_same(block: &MeshBlock, magnetic: bool) -> Vec<f64> {
    let (nvar, ..) = block.data.u.dims();
    let (f2, f3) = (block.f2(), block.f3());
    let mut payload = Vec::new();

    for n in 0..nvar {
        for k in block.ks..=block.ke {
            for j in block.js..=block.je {
                for i in block.is..=block.ie {
                    payload.push(block.data.u[(n, k, j, i)]);
                }
            }
        }
    }
    if magnetic {
        for k in block.ks..=block.ke {
            for j in block.js..=block.je {
                for i in block.is..=block.ie + 1 {
                    payload.push(block.data.bx1[(k, j, i)]);
                }
            }
        }
        for k in block.ks..=block.ke {
            for j in block.js..=block.je + f2 {
                for i in block.is..=block.ie {
                    payload.push(block.data.bx2[(k, j, i)]);
                }
            }
        }
        for k in block.ks..=block.ke + f3 {
            for j in block.js..=block.je {
                for i in block.is..=block.ie {
                    payload.push(block.data.bx3[(k, j, i)]);
                }
            }
        }
    }
    payload
}

fn apply_same(block: &mut MeshBlock, payload: &[f64], magnetic: bool) {
    let (nvar, ..) = block.data.u.dims();
    let (f2, f3) = (block.f2(), block.f3());
    let mut cursor = 0;
    let mut next = |payload: &[f64]| {
        let v = payload[cursor];
        cursor += 1;
        v
    };

    for n in 0..nvar {
        for k in block.ks..=block.ke {
            for j in block.js..=block.je {
                for i in block.is..=block.ie {
                    block.data.u[(n, k, j, i)] = next(payload);
                }
            }
        }
    }
    if magnetic {
        for k in block.ks..=block.ke {
            for j in block.js..=block.je {
                for i in block.is..=block.ie + 1 {
                    block.data.bx1[(k, j, i)] = next(payload);
                }
            }
        }
        for k in block.ks..=block.ke {
            for j in block.js..=block.je + f2 {
                for i in block.is..=block.ie {
                    block.data.bx2[(k, j, i)] = next(payload);
                }
            }
        }
        for k in block.ks..=block.ke + f3 {
            for j in block.js..=block.je {
                for i in block.is..=block.ie {
                    block.data.bx3[(k, j, i)] = next(payload);
                }
            }
        }
        duplicate_collapsed_planes(block);
    }
    debug_assert_eq!(cursor, payload.len());
}

/// Face arrays keep both planes of a collapsed axis identical.
fn duplicate_collapsed_planes(block: &mut MeshBlock) {
    if block.f2() == 0 {
        for k in block.ks..=block.ke {
            for i in block.is..=block.ie {
                block.data.bx2[(k, block.js + 1, i)] = block.data.bx2[(k, block.js, i)];
            }
        }
    }
    if block.f3() == 0 {
        for j in block.js..=block.je {
            for i in block.is..=block.ie {
                block.data.bx3[(block.ks + 1, j, i)] = block.data.bx3[(block.ks, j, i)];
            }
        }
    }
}

/// Restricts a finer block's state to its parent's resolution and packs the
/// full coarse active region (faces conserve the fine face-flux sums).
fn pack_f2c(block: &MeshBlock, magnetic: bool) -> Vec<f64> {
    let (nvar, ..) = block.data.u.dims();
    let (f2, f3) = (block.f2(), block.f3());
    let map = FineCoarseMap::from_block(block);
    let coarse = block.coarse.as_ref().expect("fine-to-coarse path needs coarse buffers");

    let mut cu = coarse.u.clone();
    restrict_cc(
        &block.data.u,
        &mut cu,
        0..nvar,
        (block.cis as i64, block.cie as i64),
        (block.cjs as i64, block.cje as i64),
        (block.cks as i64, block.cke as i64),
        &map,
    );

    let mut payload = Vec::new();
    for n in 0..nvar {
        for ck in block.cks..=block.cke {
            for cj in block.cjs..=block.cje {
                for ci in block.cis..=block.cie {
                    payload.push(cu[(n, ck, cj, ci)]);
                }
            }
        }
    }

    if magnetic {
        let mut cb1 = coarse.bx1.clone();
        let mut cb2 = coarse.bx2.clone();
        let mut cb3 = coarse.bx3.clone();
        restrict_fx1(
            &block.data.bx1,
            &mut cb1,
            (block.cis as i64, block.cie as i64 + 1),
            (block.cjs as i64, block.cje as i64),
            (block.cks as i64, block.cke as i64),
            &map,
        );
        restrict_fx2(
            &block.data.bx2,
            &mut cb2,
            (block.cis as i64, block.cie as i64),
            (block.cjs as i64, (block.cje + f2) as i64),
            (block.cks as i64, block.cke as i64),
            &map,
        );
        restrict_fx3(
            &block.data.bx3,
            &mut cb3,
            (block.cis as i64, block.cie as i64),
            (block.cjs as i64, block.cje as i64),
            (block.cks as i64, (block.cke + f3) as i64),
            &map,
        );

        for ck in block.cks..=block.cke {
            for cj in block.cjs..=block.cje {
                for ci in block.cis..=block.cie + 1 {
                    payload.push(cb1[(ck, cj, ci)]);
                }
            }
        }
        for ck in block.cks..=block.cke {
            for cj in block.cjs..=block.cje + f2 {
                for ci in block.cis..=block.cie {
                    payload.push(cb2[(ck, cj, ci)]);
                }
            }
        }
        for ck in block.cks..=block.cke + f3 {
            for cj in block.cjs..=block.cje {
                for ci in block.cis..=block.cie {
                    payload.push(cb3[(ck, cj, ci)]);
                }
            }
        }
    }

    payload
}

/// Writes one child's restricted contribution into its octant of the
/// coarser block.
fn apply_f2c(
    block: &mut MeshBlock,
    (ox1, ox2, ox3): (i64, i64, i64),
    payload: &[f64],
    magnetic: bool,
) {
    let (nvar, ..) = block.data.u.dims();
    let (nx1, nx2, nx3) = (
        block.block_size.nx1,
        block.block_size.nx2,
        block.block_size.nx3,
    );
    let (f2, f3) = (block.f2(), block.f3());

    let (is, ie) = if ox1 == 0 {
        (block.is, block.is + nx1 / 2 - 1)
    } else {
        (block.is + nx1 / 2, block.ie)
    };
    let (js, je) = if ox2 == 0 {
        (block.js, block.js + nx2 / 2 - f2)
    } else {
        (block.js + nx2 / 2, block.je)
    };
    let (ks, ke) = if ox3 == 0 {
        (block.ks, block.ks + nx3 / 2 - f3)
    } else {
        (block.ks + nx3 / 2, block.ke)
    };

    let mut cursor = 0;
    let mut next = |payload: &[f64]| {
        let v = payload[cursor];
        cursor += 1;
        v
    };

    for n in 0..nvar {
        for k in ks..=ke {
            for j in js..=je {
                for i in is..=ie {
                    block.data.u[(n, k, j, i)] = next(payload);
                }
            }
        }
    }
    if magnetic {
        for k in ks..=ke {
            for j in js..=je {
                for i in is..=ie + 1 {
                    block.data.bx1[(k, j, i)] = next(payload);
                }
            }
        }
        for k in ks..=ke {
            for j in js..=je + f2 {
                for i in is..=ie {
                    block.data.bx2[(k, j, i)] = next(payload);
                }
            }
        }
        for k in ks..=ke + f3 {
            for j in js..=je {
                for i in is..=ie {
                    block.data.bx3[(k, j, i)] = next(payload);
                }
            }
        }
        duplicate_collapsed_planes(block);
    }
    debug_assert_eq!(cursor, payload.len());
}

/// Packs the quadrant of a coarse block that a new finer block will cover,
/// padded by the one-cell coarse halo prolongation needs.
fn pack_c2f(
    block: &MeshBlock,
    (ox1, ox2, ox3): (i64, i64, i64),
    magnetic: bool,
) -> Vec<f64> {
    let (nvar, ..) = block.data.u.dims();
    let (nx1, nx2, nx3) = (
        block.block_size.nx1,
        block.block_size.nx2,
        block.block_size.nx3,
    );
    let (f2, f3) = (block.f2(), block.f3());

    let (is, ie) = if ox1 == 0 {
        (block.is - 1, block.is + nx1 / 2)
    } else {
        (block.is + nx1 / 2 - 1, block.ie + 1)
    };
    let (js, je) = if ox2 == 0 {
        (block.js - f2, block.js + nx2 / 2)
    } else {
        (block.js + nx2 / 2 - f2, block.je + f2)
    };
    let (ks, ke) = if ox3 == 0 {
        (block.ks - f3, block.ks + nx3 / 2)
    } else {
        (block.ks + nx3 / 2 - f3, block.ke + f3)
    };

    let mut payload = Vec::new();
    for n in 0..nvar {
        for k in ks..=ke {
            for j in js..=je {
                for i in is..=ie {
                    payload.push(block.data.u[(n, k, j, i)]);
                }
            }
        }
    }
    if magnetic {
        for k in ks..=ke {
            for j in js..=je {
                for i in is..=ie + 1 {
                    payload.push(block.data.bx1[(k, j, i)]);
                }
            }
        }
        for k in ks..=ke {
            for j in js..=je + f2 {
                for i in is..=ie {
                    payload.push(block.data.bx2[(k, j, i)]);
                }
            }
        }
        for k in ks..=ke + f3 {
            for j in js..=je {
                for i in is..=ie {
                    payload.push(block.data.bx3[(k, j, i)]);
                }
            }
        }
    }
    payload
}

/// Loads a received coarse quadrant into the new fine block's coarse
/// buffers and prolongs: cells with limited slopes, the field by shared
/// faces then the divergence-preserving interior solve.
fn apply_c2f(block: &mut MeshBlock, payload: &[f64], magnetic: bool) {
    let (nvar, ..) = block.data.u.dims();
    let (f2, f3) = (block.f2(), block.f3());
    let (cis, cie) = (block.cis, block.cie);
    let (cjs, cje) = (block.cjs, block.cje);
    let (cks, cke) = (block.cks, block.cke);

    let (is0, ie0) = (cis - 1, cie + 1);
    let (js0, je0) = (cjs - f2, cje + f2);
    let (ks0, ke0) = (cks - f3, cke + f3);

    let mut coarse = block.coarse.take().expect("coarse-to-fine path needs coarse buffers");

    let mut cursor = 0;
    let mut next = |payload: &[f64]| {
        let v = payload[cursor];
        cursor += 1;
        v
    };

    for n in 0..nvar {
        for k in ks0..=ke0 {
            for j in js0..=je0 {
                for i in is0..=ie0 {
                    coarse.u[(n, k, j, i)] = next(payload);
                }
            }
        }
    }
    if magnetic {
        for k in ks0..=ke0 {
            for j in js0..=je0 {
                for i in is0..=ie0 + 1 {
                    coarse.bx1[(k, j, i)] = next(payload);
                }
            }
        }
        for k in ks0..=ke0 {
            for j in js0..=je0 + f2 {
                for i in is0..=ie0 {
                    coarse.bx2[(k, j, i)] = next(payload);
                }
            }
        }
        for k in ks0..=ke0 + f3 {
            for j in js0..=je0 {
                for i in is0..=ie0 {
                    coarse.bx3[(k, j, i)] = next(payload);
                }
            }
        }
    }
    debug_assert_eq!(cursor, payload.len());

    let map = FineCoarseMap::from_block(block);
    prolong_cc(
        &coarse.u,
        &mut block.data.u,
        0..nvar,
        (is0 as i64, ie0 as i64),
        (js0 as i64, je0 as i64),
        (ks0 as i64, ke0 as i64),
        &map,
    );

    if magnetic {
        prolong_shared_fx1(
            &coarse.bx1,
            &mut block.data.bx1,
            (is0 as i64, ie0 as i64 + 1),
            (js0 as i64, je0 as i64),
            (ks0 as i64, ke0 as i64),
            &map,
        );
        prolong_shared_fx2(
            &coarse.bx2,
            &mut block.data.bx2,
            (is0 as i64, ie0 as i64),
            (js0 as i64, (je0 + f2) as i64),
            (ks0 as i64, ke0 as i64),
            &map,
        );
        prolong_shared_fx3(
            &coarse.bx3,
            &mut block.data.bx3,
            (is0 as i64, ie0 as i64),
            (js0 as i64, je0 as i64),
            (ks0 as i64, (ke0 + f3) as i64),
            &map,
        );

        let size = &block.block_size;
        let spacing = (
            (size.x1max - size.x1min) / size.nx1 as f64,
            (size.x2max - size.x2min) / size.nx2 as f64,
            (size.x3max - size.x3min) / size.nx3 as f64,
        );
        prolong_internal_field(
            &mut block.data.bx1,
            &mut block.data.bx2,
            &mut block.data.bx3,
            (is0 as i64, ie0 as i64),
            (js0 as i64, je0 as i64),
            (ks0 as i64, ke0 as i64),
            &map,
            spacing,
        );
        duplicate_collapsed_planes(block);
    }

    block.coarse = Some(coarse);
}

#[cfg(test)]
mod tests {
    use super::super::tests::base_config;
    use super::super::{InitFlag, Mesh};
    use crate::comm::{ChannelCluster, SerialComm};
    use crate::config::Refinement;
    use crate::hooks::{MeshHooks, RefinementFlag};

    fn adaptive_config() -> crate::config::SimulationConfig {
        let mut config = base_config((16, 1, 1), (4, 1, 1));
        config.mesh.refinement = Refinement::Adaptive;
        config.mesh.numlevel = 3;
        config
    }

    fn linear_profile_hooks() -> MeshHooks {
        let mut hooks = MeshHooks::new();
        hooks.enroll_problem_generator(|block| {
            let (nvar, nk, nj, ni) = block.data.u.dims();
            let x0 = block.block_size.x1min;
            let dx = (block.block_size.x1max - block.block_size.x1min)
                / block.block_size.nx1 as f64;
            for n in 0..nvar {
                for k in 0..nk {
                    for j in 0..nj {
                        for i in 0..ni {
                            let x = x0 + (i as f64 - block.is as f64 + 0.5) * dx;
                            block.data.u[(n, k, j, i)] = 1.0 + n as f64 + x;
                        }
                    }
                }
            }
        });
        hooks
    }

    /// Refine one block, then collapse it again: conserved totals survive
    /// both transitions and the tree returns to its original shape.
    #[test]
    fn refine_then_derefine_round_trip() {
        let config = adaptive_config();
        let mut mesh = Mesh::new(&config, Box::new(SerialComm)).unwrap();
        let hooks = linear_profile_hooks();
        mesh.initialize(InitFlag::Fresh, &hooks).unwrap();

        let original_loclist = mesh.loclist.clone();
        let before = mesh.total_conserved();

        mesh.find_block_mut(1).unwrap().refine_flag = RefinementFlag::Refine;
        mesh.adaptive_mesh_refinement(&hooks).unwrap();
        assert_eq!(mesh.nbtotal, 5);

        let mid = mesh.total_conserved();
        for (a, b) in before.iter().zip(&mid) {
            assert!((a - b).abs() < 1e-12, "refinement lost conservation");
        }

        // Flag the whole octet for collapse.
        let parent_level = mesh.root_level;
        for block in mesh.blocks.iter_mut() {
            if block.loc.level == parent_level + 1 {
                block.refine_flag = RefinementFlag::Derefine;
            } else {
                block.refine_flag = RefinementFlag::Keep;
            }
        }
        mesh.adaptive_mesh_refinement(&hooks).unwrap();

        assert_eq!(mesh.nbtotal, 4);
        assert_eq!(mesh.loclist, original_loclist);

        let after = mesh.total_conserved();
        for (a, b) in before.iter().zip(&after) {
            assert!((a - b).abs() < 1e-12, "round trip lost conservation");
        }
    }

    /// A uniform face field stays uniform and divergence-free through a
    /// refinement.
    #[test]
    fn field_survives_refinement() {
        let mut config = base_config((16, 16, 1), (4, 4, 1));
        config.mesh.refinement = Refinement::Adaptive;
        config.mesh.numlevel = 2;
        config.physics.magnetic = true;

        let mut mesh = Mesh::new(&config, Box::new(SerialComm)).unwrap();
        let mut hooks = MeshHooks::new();
        hooks.enroll_problem_generator(|block| {
            block.data.u.fill(1.0);
            block.data.bx1.fill(3.0);
            block.data.bx2.fill(-2.0);
        });
        mesh.initialize(InitFlag::Fresh, &hooks).unwrap();

        mesh.find_block_mut(5).unwrap().refine_flag = RefinementFlag::Refine;
        mesh.adaptive_mesh_refinement(&hooks).unwrap();
        assert_eq!(mesh.nbtotal, 19);

        for block in mesh.blocks.iter() {
            for k in block.ks..=block.ke {
                for j in block.js..=block.je {
                    for i in block.is..=block.ie {
                        assert!((block.data.bx1[(k, j, i)] - 3.0).abs() < 1e-13);
                        let div = block.data.bx1[(k, j, i + 1)] - block.data.bx1[(k, j, i)]
                            + block.data.bx2[(k, j + 1, i)]
                            - block.data.bx2[(k, j, i)];
                        assert!(div.abs() < 1e-12);
                    }
                }
            }
        }
    }

    /// Two ranks refine and migrate concurrently; the replicated lists come
    /// out identical and globally conserved totals are unchanged.
    #[test]
    fn concurrent_regrid_is_deterministic_and_conservative() {
        let comms = ChannelCluster::new(2);

        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let config = adaptive_config();
                    let mut mesh = Mesh::new(&config, Box::new(comm)).unwrap();
                    let hooks = linear_profile_hooks();
                    mesh.initialize(InitFlag::Fresh, &hooks).unwrap();

                    let before = mesh.total_conserved();

                    // Rank 0 owns the low-gid blocks; refine the first one.
                    for block in mesh.blocks.iter_mut() {
                        if block.gid == 0 {
                            block.refine_flag = RefinementFlag::Refine;
                        }
                    }
                    mesh.adaptive_mesh_refinement(&hooks).unwrap();

                    let after = mesh.total_conserved();
                    (mesh.loclist.clone(), mesh.ranklist.clone(), before, after)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let (loc0, rank0, before0, after0) = &results[0];
        let (loc1, rank1, _, after1) = &results[1];

        assert_eq!(loc0, loc1);
        assert_eq!(rank0, rank1);
        assert_eq!(loc0.len(), 5);
        for (a, b) in before0.iter().zip(after0) {
            assert!((a - b).abs() < 1e-12);
        }
        for (a, b) in after0.iter().zip(after1) {
            assert!((a - b).abs() < 1e-13);
        }
    }
}
