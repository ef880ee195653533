//! The per-rank block collection.

use super::MeshBlock;

/// The blocks owned by this rank, in ascending gid order.
///
/// The original kept a doubly linked list for O(1) splice during regridding;
/// in Rust the same operation is a `detach`/`reattach` pair over owned slots,
/// and the regrid rebuilds the collection wholesale anyway. Detached slots
/// leave holes that iteration skips.
#[derive(Default)]
pub struct BlockList {
    slots: Vec<Option<MeshBlock>>,
}

impl BlockList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a block; its gid must exceed every gid already present.
    pub fn push(&mut self, block: MeshBlock) {
        debug_assert!(self
            .iter()
            .last()
            .map(|prev| prev.gid < block.gid)
            .unwrap_or(true));
        self.slots.push(Some(block));
    }

    /// Number of attached blocks.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &MeshBlock> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MeshBlock> {
        self.slots.iter_mut().filter_map(|slot| slot.as_mut())
    }

    #[cfg(feature = "parallel")]
    pub fn par_iter_mut(&mut self) -> impl rayon::iter::ParallelIterator<Item = &mut MeshBlock> {
        use rayon::prelude::*;
        self.slots.par_iter_mut().filter_map(|slot| slot.as_mut())
    }

    /// The block with the given gid, if attached. A linear walk, as in the
    /// original; rank-local block counts are small.
    pub fn find(&self, gid: i32) -> Option<&MeshBlock> {
        self.iter().find(|block| block.gid == gid)
    }

    pub fn find_mut(&mut self, gid: i32) -> Option<&mut MeshBlock> {
        self.iter_mut().find(|block| block.gid == gid)
    }

    /// Detaches and returns the block with the given gid, leaving a hole.
    /// Used by the regrid to move a surviving block into the next list
    /// without copying its field data.
    pub fn detach(&mut self, gid: i32) -> Option<MeshBlock> {
        self.slots
            .iter_mut()
            .find(|slot| slot.as_ref().map(|b| b.gid == gid).unwrap_or(false))?
            .take()
    }

    /// Drops every remaining block.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BoundaryFlag, PhysicsConfig};
    use crate::geometry::{LogicalLocation, RegionSize};

    fn block(gid: i32) -> MeshBlock {
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
            nx1: 4,
            nx2: 1,
            nx3: 1,
        };
        MeshBlock::new(
            gid,
            gid,
            LogicalLocation::default(),
            size,
            [BoundaryFlag::Outflow; 6],
            &PhysicsConfig::default(),
            false,
        )
    }

    #[test]
    fn detach_leaves_order_intact() {
        let mut list = BlockList::new();
        for gid in 0..4 {
            list.push(block(gid));
        }

        let taken = list.detach(2).unwrap();
        assert_eq!(taken.gid, 2);
        assert_eq!(list.len(), 3);
        assert!(list.find(2).is_none());

        let gids: Vec<i32> = list.iter().map(|b| b.gid).collect();
        assert_eq!(gids, vec![0, 1, 3]);
    }
}
