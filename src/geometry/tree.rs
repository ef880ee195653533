use super::LogicalLocation;
use crate::config::BoundaryFlag;
use crate::error::{MeshError, Result};

/// Null index, used internally to make storage of `Option<usize>` cheaper.
const NULL: usize = usize::MAX;

/// Index of a node in a [`BlockTree`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Node {
    loc: LogicalLocation,
    parent: usize,
    /// Child slots indexed `ox1 + 2*ox2 + 4*ox3`; `NULL` where absent.
    children: [usize; 8],
    leaf: bool,
    /// Global block id of a leaf. Refined children inherit their parent's
    /// id and a collapsed parent takes its first child's, so that after a
    /// regrid every new leaf still knows which pre-regrid block covered it.
    gid: i32,
}

/// The refinement tree owning the logical topology of the mesh.
///
/// The root layer is an `nrbx1 x nrbx2 x nrbx3` grid of leaves at level
/// `root_level = ceil(log2(max(nrbx)))`; levels below that exist only to give
/// the grid a single entry point. Nodes live in an index arena with a free
/// list (removal only happens through [`BlockTree::derefine`]), so node ids
/// stay stable across mutations.
///
/// Two invariants hold at all times: children of an internal node exactly
/// tile its range, and leaves sharing any face, edge, or corner differ in
/// level by at most one. [`BlockTree::refine`] preserves the second by
/// cascading into coarser neighbors.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockTree {
    nodes: Vec<Node>,
    free: Vec<usize>,
    root: usize,
    dim: usize,
    nrbx: [i64; 3],
    root_level: i32,
    max_level: i32,
    periodic: [bool; 3],
}

fn child_slot(ox1: i64, ox2: i64, ox3: i64) -> usize {
    debug_assert!((0..2).contains(&ox1) && (0..2).contains(&ox2) && (0..2).contains(&ox3));
    (ox1 + 2 * ox2 + 4 * ox3) as usize
}

impl BlockTree {
    /// Builds the root grid.
    pub fn new(
        nrbx: [i64; 3],
        dim: usize,
        root_level: i32,
        max_level: i32,
        bcs: [BoundaryFlag; 6],
    ) -> Self {
        let periodic = [
            bcs[0].is_periodic() && bcs[1].is_periodic(),
            bcs[2].is_periodic() && bcs[3].is_periodic(),
            bcs[4].is_periodic() && bcs[5].is_periodic(),
        ];

        let mut tree = Self {
            nodes: vec![Node {
                loc: LogicalLocation::default(),
                parent: NULL,
                children: [NULL; 8],
                leaf: true,
                gid: -1,
            }],
            free: Vec::new(),
            root: 0,
            dim,
            nrbx,
            root_level,
            max_level,
            periodic,
        };
        tree.grow_root(tree.root);
        tree
    }

    pub fn root_level(&self) -> i32 {
        self.root_level
    }

    pub fn max_level(&self) -> i32 {
        self.max_level
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn nrbx(&self) -> [i64; 3] {
        self.nrbx
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.nodes[id.0].leaf
    }

    pub fn location(&self, id: NodeId) -> LogicalLocation {
        self.nodes[id.0].loc
    }

    pub fn gid(&self, id: NodeId) -> i32 {
        self.nodes[id.0].gid
    }

    /// The child of an internal node in octant `(ox1, ox2, ox3)`.
    pub fn child(&self, id: NodeId, ox1: usize, ox2: usize, ox3: usize) -> Option<NodeId> {
        let child = self.nodes[id.0].children[child_slot(ox1 as i64, ox2 as i64, ox3 as i64)];
        (child != NULL).then_some(NodeId(child))
    }

    fn alloc(&mut self, node: Node) -> usize {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = node;
            idx
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    /// Recursively subdivides down to the root level, creating only nodes
    /// that overlap the root grid.
    fn grow_root(&mut self, idx: usize) {
        let loc = self.nodes[idx].loc;
        if loc.level == self.root_level {
            return;
        }

        let shift = self.root_level - loc.level - 1;
        self.nodes[idx].leaf = false;

        for ox3 in 0..=((self.dim >= 3) as i64) {
            for ox2 in 0..=((self.dim >= 2) as i64) {
                for ox1 in 0..=1_i64 {
                    let child = loc.child(ox1, ox2, ox3);
                    if (child.lx1 << shift) >= self.nrbx[0]
                        || (child.lx2 << shift) >= self.nrbx[1]
                        || (child.lx3 << shift) >= self.nrbx[2]
                    {
                        continue;
                    }

                    let cidx = self.alloc(Node {
                        loc: child,
                        parent: idx,
                        children: [NULL; 8],
                        leaf: true,
                        gid: -1,
                    });
                    self.nodes[idx].children[child_slot(ox1, ox2, ox3)] = cidx;
                    self.grow_root(cidx);
                }
            }
        }
    }

    /// Applies a logical offset at `loc`'s level, wrapping over periodic
    /// boundaries. Returns `None` when the offset leaves the mesh through a
    /// non-periodic wall.
    fn shifted(
        &self,
        loc: LogicalLocation,
        ox1: i64,
        ox2: i64,
        ox3: i64,
    ) -> Option<LogicalLocation> {
        let mut lx = [loc.lx1 + ox1, loc.lx2 + ox2, loc.lx3 + ox3];

        for axis in 0..3 {
            let extent = if axis < self.dim {
                self.nrbx[axis] << (loc.level - self.root_level)
            } else {
                1
            };
            if lx[axis] < 0 {
                if !self.periodic[axis] {
                    return None;
                }
                lx[axis] += extent;
            } else if lx[axis] >= extent {
                if !self.periodic[axis] {
                    return None;
                }
                lx[axis] -= extent;
            }
        }

        Some(LogicalLocation::new(loc.level, lx[0], lx[1], lx[2]))
    }

    /// Ensures a leaf exists at `loc`, refining ancestors as needed. Every
    /// refinement performed along the way cascades to keep the 2:1
    /// constraint. `nnew` is advanced by the number of leaves created.
    pub fn add_block(&mut self, loc: LogicalLocation, nnew: &mut i32) -> Result<()> {
        if loc.level > self.max_level {
            return Err(MeshError::LevelOverflow {
                level: loc.level,
                max_level: self.max_level,
            });
        }

        let mut idx = self.root;
        for lev in 0..loc.level {
            if self.nodes[idx].leaf {
                self.refine(NodeId(idx), nnew)?;
            }
            let shift = loc.level - lev - 1;
            let slot = child_slot(
                (loc.lx1 >> shift) & 1,
                (loc.lx2 >> shift) & 1,
                (loc.lx3 >> shift) & 1,
            );
            idx = self.nodes[idx].children[slot];
            debug_assert!(idx != NULL, "location outside the root grid");
        }
        Ok(())
    }

    /// Recreates the node path for `loc` without any cascading, used when
    /// rebuilding a tree from a restart index whose topology is already
    /// consistent.
    pub fn add_block_without_refine(&mut self, loc: LogicalLocation) {
        let mut idx = self.root;
        for lev in 0..loc.level {
            self.nodes[idx].leaf = false;
            let shift = loc.level - lev - 1;
            let (ox1, ox2, ox3) = (
                (loc.lx1 >> shift) & 1,
                (loc.lx2 >> shift) & 1,
                (loc.lx3 >> shift) & 1,
            );
            let slot = child_slot(ox1, ox2, ox3);

            if self.nodes[idx].children[slot] == NULL {
                let child = Node {
                    loc: self.nodes[idx].loc.child(ox1, ox2, ox3),
                    parent: idx,
                    children: [NULL; 8],
                    leaf: true,
                    gid: -1,
                };
                let cidx = self.alloc(child);
                self.nodes[idx].children[slot] = cidx;
            }
            idx = self.nodes[idx].children[slot];
        }
    }

    /// Replaces a leaf with `2^dim` children and refines any neighbor still
    /// one level coarser than the leaf was.
    pub fn refine(&mut self, id: NodeId, nnew: &mut i32) -> Result<()> {
        let idx = id.0;
        if !self.nodes[idx].leaf {
            return Ok(());
        }

        let loc = self.nodes[idx].loc;
        if loc.level >= self.max_level {
            return Err(MeshError::LevelOverflow {
                level: loc.level + 1,
                max_level: self.max_level,
            });
        }

        let gid = self.nodes[idx].gid;
        self.nodes[idx].leaf = false;

        for ox3 in 0..=((self.dim >= 3) as i64) {
            for ox2 in 0..=((self.dim >= 2) as i64) {
                for ox1 in 0..=1_i64 {
                    let cidx = self.alloc(Node {
                        loc: loc.child(ox1, ox2, ox3),
                        parent: idx,
                        children: [NULL; 8],
                        leaf: true,
                        gid,
                    });
                    self.nodes[idx].children[child_slot(ox1, ox2, ox3)] = cidx;
                }
            }
        }
        *nnew += (1 << self.dim) - 1;

        // Cascade: every neighbor must reach at least this node's old level.
        let r3 = (self.dim >= 3) as i64;
        let r2 = (self.dim >= 2) as i64;
        for ox3 in -r3..=r3 {
            for ox2 in -r2..=r2 {
                for ox1 in -1..=1_i64 {
                    if ox1 == 0 && ox2 == 0 && ox3 == 0 {
                        continue;
                    }
                    if let Some(nloc) = self.shifted(loc, ox1, ox2, ox3) {
                        self.add_block(nloc, nnew)?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Collapses the `2^dim` leaf children of an internal node back into a
    /// leaf. Returns `false` without mutating when the collapse would put a
    /// neighboring leaf two levels away.
    pub fn derefine(&mut self, id: NodeId, ndel: &mut i32) -> bool {
        let idx = id.0;
        if self.nodes[idx].leaf {
            return false;
        }
        if self.nodes[idx]
            .children
            .iter()
            .any(|&c| c != NULL && !self.nodes[c].leaf)
        {
            return false;
        }

        let loc = self.nodes[idx].loc;
        let r3 = (self.dim >= 3) as i64;
        let r2 = (self.dim >= 2) as i64;

        for ox3 in -r3..=r3 {
            for ox2 in -r2..=r2 {
                for ox1 in -1..=1_i64 {
                    if ox1 == 0 && ox2 == 0 && ox3 == 0 {
                        continue;
                    }
                    let Some(neighbor) = self.find_neighbor(loc, ox1, ox2, ox3) else {
                        continue;
                    };
                    if self.nodes[neighbor.0].leaf {
                        continue;
                    }
                    // The neighbor holds finer leaves; the ones touching this
                    // node must themselves be leaves.
                    if self.any_facing_child_internal(neighbor.0, ox1, ox2, ox3) {
                        return false;
                    }
                }
            }
        }

        // The collapsed leaf keeps its first child's id as the pre-regrid
        // representative.
        self.nodes[idx].gid = self.nodes[self.nodes[idx].children[0]].gid;

        for slot in 0..8 {
            let child = self.nodes[idx].children[slot];
            if child != NULL {
                self.free.push(child);
                self.nodes[idx].children[slot] = NULL;
            }
        }

        self.nodes[idx].leaf = true;
        *ndel += (1 << self.dim) - 1;
        true
    }

    /// True if any child of `idx` on the side facing back along
    /// `(ox1, ox2, ox3)` is internal.
    fn any_facing_child_internal(&self, idx: usize, ox1: i64, ox2: i64, ox3: i64) -> bool {
        let range = |ox: i64, extent: bool| -> std::ops::RangeInclusive<i64> {
            match ox {
                1 => 0..=0,
                -1 => 1..=1,
                _ => 0..=extent as i64,
            }
        };

        for ci in range(ox1, true) {
            for cj in range(ox2, self.dim >= 2) {
                for ck in range(ox3, self.dim >= 3) {
                    let child = self.nodes[idx].children[child_slot(ci, cj, ck)];
                    if child != NULL && !self.nodes[child].leaf {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Finds the node at exactly `loc`, which may be internal.
    pub fn find_block(&self, loc: LogicalLocation) -> Option<NodeId> {
        let mut idx = self.root;
        for lev in 0..loc.level {
            if self.nodes[idx].leaf {
                return None;
            }
            let shift = loc.level - lev - 1;
            let slot = child_slot(
                (loc.lx1 >> shift) & 1,
                (loc.lx2 >> shift) & 1,
                (loc.lx3 >> shift) & 1,
            );
            let child = self.nodes[idx].children[slot];
            if child == NULL {
                return None;
            }
            idx = child;
        }
        Some(NodeId(idx))
    }

    /// Returns the leaf at `loc`, or the finest ancestor leaf covering it.
    pub fn find_leaf(&self, loc: LogicalLocation) -> NodeId {
        let mut idx = self.root;
        for lev in 0..loc.level {
            if self.nodes[idx].leaf {
                break;
            }
            let shift = loc.level - lev - 1;
            let slot = child_slot(
                (loc.lx1 >> shift) & 1,
                (loc.lx2 >> shift) & 1,
                (loc.lx3 >> shift) & 1,
            );
            let child = self.nodes[idx].children[slot];
            if child == NULL {
                break;
            }
            idx = child;
        }
        NodeId(idx)
    }

    /// Locates the node adjacent to `loc` in direction `(ox1, ox2, ox3)`.
    /// The result is at `loc`'s level when one exists there, the covering
    /// coarser leaf otherwise, and `None` across a non-periodic wall.
    pub fn find_neighbor(
        &self,
        loc: LogicalLocation,
        ox1: i64,
        ox2: i64,
        ox3: i64,
    ) -> Option<NodeId> {
        let nloc = self.shifted(loc, ox1, ox2, ox3)?;

        let mut idx = self.root;
        for lev in 0..nloc.level {
            if self.nodes[idx].leaf {
                return Some(NodeId(idx));
            }
            let shift = nloc.level - lev - 1;
            let slot = child_slot(
                (nloc.lx1 >> shift) & 1,
                (nloc.lx2 >> shift) & 1,
                (nloc.lx3 >> shift) & 1,
            );
            let child = self.nodes[idx].children[slot];
            if child == NULL {
                return None;
            }
            idx = child;
        }
        Some(NodeId(idx))
    }

    /// Number of leaves in the tree.
    pub fn count_blocks(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self.root];
        while let Some(idx) = stack.pop() {
            if self.nodes[idx].leaf {
                count += 1;
            } else {
                stack.extend(
                    self.nodes[idx]
                        .children
                        .iter()
                        .copied()
                        .filter(|&c| c != NULL),
                );
            }
        }
        count
    }

    /// Flattens the leaves in pre-order (Z-ordered children), assigning each
    /// leaf its global id. Returns the location list together with each
    /// leaf's previous id, which maps new block ids to the blocks that
    /// covered them before the latest regrid.
    pub fn enumerate(&mut self) -> (Vec<LogicalLocation>, Vec<i32>) {
        let mut loclist = Vec::new();
        let mut oldgid = Vec::new();
        self.enumerate_node(self.root, &mut loclist, &mut oldgid);
        (loclist, oldgid)
    }

    fn enumerate_node(
        &mut self,
        idx: usize,
        loclist: &mut Vec<LogicalLocation>,
        oldgid: &mut Vec<i32>,
    ) {
        if self.nodes[idx].leaf {
            oldgid.push(self.nodes[idx].gid);
            self.nodes[idx].gid = loclist.len() as i32;
            loclist.push(self.nodes[idx].loc);
            return;
        }
        for slot in 0..8 {
            let child = self.nodes[idx].children[slot];
            if child != NULL {
                self.enumerate_node(child, loclist, oldgid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn periodic_bcs() -> [BoundaryFlag; 6] {
        [BoundaryFlag::Periodic; 6]
    }

    fn outflow_bcs() -> [BoundaryFlag; 6] {
        [BoundaryFlag::Outflow; 6]
    }

    /// Checks the 2:1 constraint over every leaf pair related by a unit
    /// offset at either level.
    fn assert_two_to_one(tree: &BlockTree) {
        let mut tree = tree.clone();
        let (loclist, _) = tree.enumerate();
        let r2 = (tree.dim() >= 2) as i64;
        let r3 = (tree.dim() >= 3) as i64;

        for &loc in &loclist {
            for ox3 in -r3..=r3 {
                for ox2 in -r2..=r2 {
                    for ox1 in -1..=1_i64 {
                        if ox1 == 0 && ox2 == 0 && ox3 == 0 {
                            continue;
                        }
                        if let Some(neighbor) = tree.find_neighbor(loc, ox1, ox2, ox3) {
                            if tree.is_leaf(neighbor) {
                                let nlevel = tree.location(neighbor).level;
                                assert!(
                                    (nlevel - loc.level).abs() <= 1,
                                    "leaf {loc:?} vs neighbor level {nlevel}"
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn root_grid_shape() {
        // 4 x 1 root blocks: root level 2, non-square tree.
        let tree = BlockTree::new([4, 1, 1], 1, 2, 63, outflow_bcs());
        assert_eq!(tree.count_blocks(), 4);

        let mut tree = tree;
        let (loclist, _) = tree.enumerate();
        let lx: Vec<i64> = loclist.iter().map(|l| l.lx1).collect();
        assert_eq!(lx, vec![0, 1, 2, 3]);
        assert!(loclist.iter().all(|l| l.level == 2));
    }

    #[test]
    fn add_block_cascades() {
        let mut tree = BlockTree::new([4, 4, 1], 2, 2, 63, outflow_bcs());
        assert_eq!(tree.count_blocks(), 16);

        // Jump two levels at a corner; the cascade keeps 2:1 everywhere.
        let mut nnew = 0;
        tree.add_block(LogicalLocation::new(4, 0, 0, 0), &mut nnew)
            .unwrap();

        assert!(nnew > 0);
        assert_eq!(tree.count_blocks(), 16 + nnew as usize);
        assert_two_to_one(&tree);
    }

    #[test]
    fn level_overflow_is_rejected() {
        let mut tree = BlockTree::new([2, 1, 1], 1, 1, 2, outflow_bcs());
        let mut nnew = 0;
        let err = tree.add_block(LogicalLocation::new(3, 0, 0, 0), &mut nnew);
        assert!(matches!(err, Err(MeshError::LevelOverflow { .. })));
    }

    #[test]
    fn periodic_neighbors_wrap() {
        let tree = BlockTree::new([4, 1, 1], 1, 2, 63, periodic_bcs());
        let left_edge = LogicalLocation::new(2, 0, 0, 0);

        let wrapped = tree.find_neighbor(left_edge, -1, 0, 0).unwrap();
        assert_eq!(tree.location(wrapped).lx1, 3);

        let walled = BlockTree::new([4, 1, 1], 1, 2, 63, outflow_bcs());
        assert!(walled.find_neighbor(left_edge, -1, 0, 0).is_none());
    }

    #[test]
    fn coarse_neighbor_is_covering_leaf() {
        let mut tree = BlockTree::new([4, 1, 1], 1, 2, 63, outflow_bcs());
        let mut nnew = 0;
        tree.add_block(LogicalLocation::new(3, 2, 0, 0), &mut nnew)
            .unwrap();

        // The outer-x neighbor of the leftmost refined leaf is the coarser
        // level-2 leaf at lx1 = 0.
        let neighbor = tree
            .find_neighbor(LogicalLocation::new(3, 2, 0, 0), -1, 0, 0)
            .unwrap();
        assert!(tree.is_leaf(neighbor));
        assert_eq!(tree.location(neighbor), LogicalLocation::new(2, 0, 0, 0));
    }

    #[test]
    fn refine_then_derefine_restores_tree() {
        let mut tree = BlockTree::new([2, 2, 1], 2, 1, 63, outflow_bcs());
        let (before, _) = tree.clone().enumerate();

        let target = LogicalLocation::new(1, 0, 0, 0);
        let node = tree.find_block(target).unwrap();
        let mut nnew = 0;
        tree.refine(node, &mut nnew).unwrap();
        assert_eq!(nnew, 3);
        assert_eq!(tree.count_blocks(), 7);

        let mut ndel = 0;
        assert!(tree.derefine(node, &mut ndel));
        assert_eq!(ndel, 3);

        let (after, _) = tree.enumerate();
        assert_eq!(before, after);
    }

    #[test]
    fn derefine_refused_next_to_finer_leaves() {
        let mut tree = BlockTree::new([2, 1, 1], 1, 1, 63, outflow_bcs());
        let mut nnew = 0;
        tree.add_block(LogicalLocation::new(3, 0, 0, 0), &mut nnew)
            .unwrap();
        tree.add_block(LogicalLocation::new(4, 4, 0, 0), &mut nnew)
            .unwrap();
        assert_two_to_one(&tree);

        // Collapsing (2, 0) would put its new level-2 leaf face to face with
        // the level-4 leaves under (3, 2).
        let shallow = tree.find_block(LogicalLocation::new(2, 0, 0, 0)).unwrap();
        let mut ndel = 0;
        assert!(!tree.derefine(shallow, &mut ndel));
        assert_eq!(ndel, 0);

        // Collapsing (3, 2) itself only leaves level-3 leaves behind, which
        // every neighbor tolerates.
        let deep = tree.find_block(LogicalLocation::new(3, 2, 0, 0)).unwrap();
        assert!(tree.derefine(deep, &mut ndel));
        assert_eq!(ndel, 1);
    }

    #[test]
    fn random_refinement_keeps_two_to_one() {
        use rand::Rng;

        let mut rng = rand::rng();
        let mut tree = BlockTree::new([4, 4, 1], 2, 2, 6, periodic_bcs());

        for _ in 0..40 {
            let (loclist, _) = tree.enumerate();
            let pick = loclist[rng.random_range(0..loclist.len())];
            if pick.level < 6 {
                let node = tree.find_block(pick).unwrap();
                let mut nnew = 0;
                tree.refine(node, &mut nnew).unwrap();
            }
        }

        assert_two_to_one(&tree);
    }

    #[test]
    fn serialized_tree_round_trips() -> eyre::Result<()> {
        let mut tree = BlockTree::new([2, 2, 1], 2, 1, 63, outflow_bcs());
        let mut nnew = 0;
        tree.add_block(LogicalLocation::new(3, 0, 0, 0), &mut nnew)?;

        let text = ron::to_string(&tree)?;
        let mut restored: BlockTree = ron::from_str(&text)?;

        assert_eq!(tree.count_blocks(), restored.count_blocks());
        let (original, _) = tree.enumerate();
        let (recovered, _) = restored.enumerate();
        assert_eq!(original, recovered);
        Ok(())
    }

    #[test]
    fn enumeration_reports_previous_ids() {
        let mut tree = BlockTree::new([2, 1, 1], 1, 1, 63, outflow_bcs());
        let (_, _) = tree.enumerate();

        let node = tree.find_block(LogicalLocation::new(1, 1, 0, 0)).unwrap();
        assert_eq!(tree.gid(node), 1);

        let mut nnew = 0;
        tree.refine(node, &mut nnew).unwrap();
        let (loclist, oldgid) = tree.enumerate();

        assert_eq!(loclist.len(), 3);
        // Both children of block 1 report it as their pre-regrid cover.
        assert_eq!(oldgid, vec![0, 1, 1]);
    }
}
