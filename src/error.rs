use thiserror::Error;

/// Error raised while constructing or mutating a mesh.
///
/// Every variant carries a single-line human message. None of these are
/// recoverable within a step; callers are expected to propagate them to the
/// driver, which reports and shuts down.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("refinement level {level} exceeds the maximum level {max_level}")]
    LevelOverflow { level: i32, max_level: i32 },

    #[error("too few blocks: {nbtotal} blocks for {nranks} ranks")]
    TooFewBlocks { nbtotal: usize, nranks: usize },

    #[error(
        "at least one rank was assigned no blocks; \
         decrease the rank count or use smaller blocks"
    )]
    EmptyRank,

    #[error("tree reconstruction failed: block counts do not match ({expected} != {found})")]
    TreeRebuild { expected: usize, found: usize },

    #[error("restart file is broken: {0}")]
    Restart(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MeshError>;
