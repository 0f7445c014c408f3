//! Render graph error types.

use crate::backend::{BackendError, Extent2D};
use crate::render_graph::BuildState;
use thiserror::Error;

/// Errors reported while declaring, building, resizing or executing a render graph.
///
/// Everything except [`RenderGraphError::Backend`] is an authoring mistake in
/// the graph declaration. A failed build leaves the graph empty; declaring it
/// again is the only way to recover.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderGraphError {
    #[error("`{operation}` is not allowed while the render graph is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: BuildState,
    },
    #[error("Pass {0} does not exist in this render graph")]
    PassNotFound(usize),
    #[error("Pass `{pass}` has no attachment named `{attachment}`")]
    AttachmentNotFound { pass: String, attachment: String },
    #[error("Expected {expected} output targets (one per frame in flight), got {actual}")]
    FrameCountMismatch { expected: usize, actual: usize },
    #[error("max_frames_in_flight must be at least 1")]
    InvalidFramesInFlight,
    #[error("No output attachment was set")]
    NoOutputAttachment,
    #[error("Dependency cycle detected at pass `{0}`")]
    CycleDetected(String),
    #[error("Pass `{0}` has more than one depth-stencil attachment")]
    MultipleDepthStencilAttachments(String),
    #[error("Output targets changed from {expected} to {actual}; rebuild the graph instead of resizing")]
    OutputFormatChanged { expected: String, actual: String },
    #[error("Output target of frame {frame} is {actual:?}, expected {expected:?}")]
    OutputExtentMismatch {
        frame: usize,
        expected: Extent2D,
        actual: Extent2D,
    },
    #[error("Frame index {index} is out of range for {frames} frames in flight")]
    FrameIndexOutOfRange { index: usize, frames: usize },
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

pub type RenderGraphResult<T> = Result<T, RenderGraphError>;
