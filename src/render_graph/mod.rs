//! Render Graph System
//!
//! Passes declare the attachments they own and the attachments of other
//! passes they read or write. The graph derives the execution order from
//! those declarations, compiles image layouts between passes and owns the
//! per-frame device resources.

pub mod directed_graph;
pub mod executor;
pub mod graph;
pub mod pass;
pub mod resources;

pub use directed_graph::*;
pub use graph::*;
pub use pass::*;
pub use resources::*;
