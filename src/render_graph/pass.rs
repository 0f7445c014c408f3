//! Render pass declarations for the render graph

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::render_graph::graph::PassId;
use std::any::Any;
use std::fmt;

/// Index of a local attachment within its pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttachmentIndex(pub(crate) usize);

impl AttachmentIndex {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Attachment defined and owned by a pass
#[derive(Debug, Clone, PartialEq)]
pub struct LocalAttachment {
    pub description: AttachmentDescription,
    pub name: String,
    /// Layout the attachment is used in while this pass renders
    pub optimal_layout: ImageLayout,
}

/// Reference to an attachment owned by another pass
///
/// Resolved by name when the graph is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalAttachment {
    pub pass: PassId,
    pub name: String,
    /// Layout the referencing pass expects the attachment in
    pub optimal_layout: ImageLayout,
}

/// Context handed to a pass callback while its render pass is active
pub struct PassExecutionContext<'a> {
    pub(crate) device: &'a mut dyn Any,
    pub pass: PassId,
    pub render_pass: RenderPassHandle,
    pub framebuffer: FramebufferHandle,
    pub command_buffer: CommandBufferHandle,
    /// Sampled read attachments in declaration order; `None` if the pass reads nothing
    pub read_descriptor_set: Option<DescriptorSetHandle>,
    pub frame_index: usize,
    pub extent: Extent2D,
}

impl<'a> PassExecutionContext<'a> {
    /// Get the device as concrete type
    pub fn device<D: RenderDevice + 'static>(&mut self) -> Option<&mut D> {
        self.device.downcast_mut::<D>()
    }
}

/// Records the commands of one pass
pub type PassCallback = Box<dyn FnMut(&mut PassExecutionContext<'_>) + Send>;

/// Declaration of one render pass: its own attachments, the attachments it
/// reads from or writes into other passes and the callback recording it.
///
/// Equality is structural: the name and callback are ignored.
#[derive(Default)]
pub struct RenderGraphPass {
    name: String,
    attachments: Vec<LocalAttachment>,
    color_attachments: Vec<AttachmentIndex>,
    depth_stencil_attachments: Vec<AttachmentIndex>,
    resolve_attachments: Vec<AttachmentIndex>,
    read_inputs: Vec<ExternalAttachment>,
    write_inputs: Vec<ExternalAttachment>,
    callback: Option<PassCallback>,
}

impl RenderGraphPass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a color attachment.
    ///
    /// Attachment names must be unique within a pass; lookups return the first match.
    pub fn add_color_attachment(
        &mut self,
        description: AttachmentDescription,
        name: impl Into<String>,
        optimal_layout: ImageLayout,
    ) -> AttachmentIndex {
        let index = self.push_attachment(description, name.into(), optimal_layout);
        self.color_attachments.push(index);
        index
    }

    pub fn add_depth_stencil_attachment(
        &mut self,
        description: AttachmentDescription,
        name: impl Into<String>,
        optimal_layout: ImageLayout,
    ) -> AttachmentIndex {
        let index = self.push_attachment(description, name.into(), optimal_layout);
        self.depth_stencil_attachments.push(index);
        index
    }

    pub fn add_resolve_attachment(
        &mut self,
        description: AttachmentDescription,
        name: impl Into<String>,
        optimal_layout: ImageLayout,
    ) -> AttachmentIndex {
        let index = self.push_attachment(description, name.into(), optimal_layout);
        self.resolve_attachments.push(index);
        index
    }

    /// Sample another pass's attachment in this pass's shaders
    pub fn add_read_input(
        &mut self,
        pass: PassId,
        name: impl Into<String>,
        optimal_layout: ImageLayout,
    ) {
        self.read_inputs.push(ExternalAttachment {
            pass,
            name: name.into(),
            optimal_layout,
        });
    }

    /// Render into another pass's attachment, keeping its contents
    pub fn add_write_input(
        &mut self,
        pass: PassId,
        name: impl Into<String>,
        optimal_layout: ImageLayout,
    ) {
        self.write_inputs.push(ExternalAttachment {
            pass,
            name: name.into(),
            optimal_layout,
        });
    }

    /// Set the callback that records this pass's commands
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&mut PassExecutionContext<'_>) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&mut PassExecutionContext<'_>) + Send + 'static,
    {
        self.set_callback(callback);
        self
    }

    /// Find a local attachment by name
    pub fn get_local_attachment(&self, name: &str) -> Option<AttachmentIndex> {
        self.attachments
            .iter()
            .position(|a| a.name == name)
            .map(AttachmentIndex)
    }

    pub fn attachment(&self, index: AttachmentIndex) -> Option<&LocalAttachment> {
        self.attachments.get(index.0)
    }

    pub fn attachments(&self) -> &[LocalAttachment] {
        &self.attachments
    }

    pub fn color_attachments(&self) -> &[AttachmentIndex] {
        &self.color_attachments
    }

    pub fn depth_stencil_attachments(&self) -> &[AttachmentIndex] {
        &self.depth_stencil_attachments
    }

    pub fn resolve_attachments(&self) -> &[AttachmentIndex] {
        &self.resolve_attachments
    }

    pub fn read_inputs(&self) -> &[ExternalAttachment] {
        &self.read_inputs
    }

    pub fn write_inputs(&self) -> &[ExternalAttachment] {
        &self.write_inputs
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    pub(crate) fn attachment_mut(&mut self, index: AttachmentIndex) -> Option<&mut LocalAttachment> {
        self.attachments.get_mut(index.0)
    }

    pub(crate) fn callback_mut(&mut self) -> Option<&mut PassCallback> {
        self.callback.as_mut()
    }

    fn push_attachment(
        &mut self,
        description: AttachmentDescription,
        name: String,
        optimal_layout: ImageLayout,
    ) -> AttachmentIndex {
        self.attachments.push(LocalAttachment {
            description,
            name,
            optimal_layout,
        });
        AttachmentIndex(self.attachments.len() - 1)
    }
}

impl PartialEq for RenderGraphPass {
    fn eq(&self, other: &Self) -> bool {
        self.attachments == other.attachments
            && self.color_attachments == other.color_attachments
            && self.depth_stencil_attachments == other.depth_stencil_attachments
            && self.resolve_attachments == other.resolve_attachments
            && self.read_inputs == other.read_inputs
            && self.write_inputs == other.write_inputs
    }
}

impl fmt::Debug for RenderGraphPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderGraphPass")
            .field("name", &self.name)
            .field("attachments", &self.attachments)
            .field("read_inputs", &self.read_inputs)
            .field("write_inputs", &self.write_inputs)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
