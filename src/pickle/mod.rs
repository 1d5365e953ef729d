//! Symbolic pickle interpretation
//!
//! Pickle artifacts are never handed to a real unpickler. The machine here
//! walks the opcode stream and builds an inert object graph, which the safety
//! scanner inspects and the estimator adapters read model parameters from.

pub mod heap;
pub mod machine;
pub mod numpy;

pub use heap::{GlobalRef, Heap, Node, NodeId, Object};
pub use machine::{Flavor, GlobalUse, Machine, PickleError, Unpickled, unpickle};
