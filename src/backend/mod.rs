//! Backend abstraction layer
//!
//! Provides the device trait the render graph is written against, a dummy
//! device for tests and a Vulkan device for real rendering.

pub mod dummy;
pub mod traits;
pub mod types;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub use dummy::DummyDevice;
pub use traits::*;
pub use types::*;
