pub mod barrier;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod core;
pub mod engine;
pub mod func_unit;
pub mod instruction;
pub mod interconn;
pub mod mem_fetch;
pub mod opcodes;
pub mod operand_collector;
pub mod register_set;
pub mod scheduler;
pub mod scoreboard;
pub mod simt;
pub mod stats;
pub mod sync;
pub mod warp;

pub use crate::core::{Core, PipelineStage};
pub use cluster::Cluster;

/// Virtual byte address used throughout the model.
#[allow(non_camel_case_types)]
pub type address = u64;

/// Maximum number of divergent fragments of one warp that may be resident
/// in the issue and operand-collection stages at the same time.
pub const MAX_WARP_FRAGMENTS: usize = 2;

/// Identity of one issue group.
///
/// Fragments of the same warp issued in the same cycle share this
/// `(warp id, issue cycle)` key and count once against pipe width caps.
pub type UniqueWarpKey = (usize, u64);
