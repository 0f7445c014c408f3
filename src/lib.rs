//! Render Graph Engine - declarative render passes with automatic scheduling
//!
//! A renderer declares its passes, the attachments each pass owns and the
//! attachments it reads from or writes into other passes. The render graph
//! then:
//! - derives an execution order from the declared dependencies and rejects cycles
//! - compiles store ops and image layouts so every attachment is left in the
//!   layout its next consumer expects
//! - creates render passes, textures, framebuffers and descriptor sets for each
//!   frame in flight
//! - keeps resources of a previous build alive until no in-flight frame can
//!   still use them
//!
//! All GPU work goes through the [`backend::RenderDevice`] trait. The crate
//! ships a Vulkan implementation (feature `vulkan-backend`) and a dummy
//! device used by tests.

pub mod backend;
pub mod error;
pub mod render_graph;

pub use backend::{DummyDevice, RenderDevice};
#[cfg(feature = "vulkan-backend")]
pub use backend::vulkan::VulkanDevice;
pub use error::{RenderGraphError, RenderGraphResult};
pub use render_graph::{
    BuildState, OutputTargets, PassExecutionContext, PassId, RenderGraph, RenderGraphPass,
};

use backend::ShaderStageFlags;

/// Frames in flight used when nothing else is configured
pub const DEFAULT_MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Configuration for one render graph build
#[derive(Debug, Clone)]
pub struct RenderGraphConfig {
    /// Number of per-frame resource copies; output targets must match it
    pub max_frames_in_flight: usize,
    /// Prefix of every device object label
    pub debug_name: String,
    /// Shader stages read attachments are bound for
    pub read_attachment_stage: ShaderStageFlags,
}

impl Default for RenderGraphConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: DEFAULT_MAX_FRAMES_IN_FLIGHT,
            debug_name: "RenderGraph".to_string(),
            read_attachment_stage: ShaderStageFlags::FRAGMENT,
        }
    }
}

impl RenderGraphConfig {
    pub fn with_max_frames_in_flight(mut self, frames: usize) -> Self {
        self.max_frames_in_flight = frames;
        self
    }

    pub fn with_debug_name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = name.into();
        self
    }

    pub fn with_read_attachment_stage(mut self, stage: ShaderStageFlags) -> Self {
        self.read_attachment_stage = stage;
        self
    }
}
