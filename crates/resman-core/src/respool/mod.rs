//! Resource pools: the priority-FIFO gang queue, the pool node, and the
//! pool tree.

pub mod pool;
pub mod queue;
pub mod tree;

pub use pool::{AdmittedGang, ResourcePool, SubQueue};
pub use queue::GangQueue;
pub use tree::Tree;
