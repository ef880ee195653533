//! Logical and physical geometry of the block hierarchy: integer block
//! coordinates, physical region extents, and the refinement tree.

mod location;
mod region;
mod tree;

pub use location::LogicalLocation;
pub use region::RegionSize;
pub use tree::{BlockTree, NodeId};
