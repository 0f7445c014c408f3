//! Device abstraction consumed by the render graph
//!
//! The render graph never talks to a graphics API directly. It creates and
//! destroys device objects and records commands exclusively through
//! [`RenderDevice`], which the Vulkan backend and the dummy backend implement.

use crate::backend::types::*;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to create resource: {0}")]
    ResourceCreationFailed(String),
    #[error("Invalid {0} handle")]
    InvalidHandle(&'static str),
    #[error("Attachment reference {index} is out of range ({count} attachments defined)")]
    InvalidAttachmentReference { index: u32, count: u32 },
    #[error("Subpass attachment added before any subpass was started")]
    NoActiveSubpass,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU texture (image plus its default view)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a device render pass object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassHandle(pub(crate) u64);

/// Handle to a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferHandle(pub(crate) u64);

/// Handle to a descriptor set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetHandle(pub(crate) u64);

/// Handle to a command buffer in the recording state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferHandle(pub(crate) u64);

impl CommandBufferHandle {
    /// Wrap a backend-specific raw command buffer value
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Reference from a subpass to a defined attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentReference {
    pub index: u32,
    pub layout: ImageLayout,
}

/// Attachment roles within one subpass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubpassDescription {
    pub color_attachments: Vec<AttachmentReference>,
    pub depth_stencil_attachment: Option<AttachmentReference>,
    pub resolve_attachments: Vec<AttachmentReference>,
}

/// Render pass descriptor
///
/// Built in two phases: every attachment is defined first, then subpasses
/// assign roles to the defined attachment indices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderPassDescriptor {
    pub label: Option<String>,
    attachments: Vec<AttachmentDescription>,
    subpasses: Vec<SubpassDescription>,
}

impl RenderPassDescriptor {
    pub fn new(label: Option<String>) -> Self {
        Self {
            label,
            attachments: Vec::new(),
            subpasses: Vec::new(),
        }
    }

    /// Define an attachment and return its index
    pub fn define_attachment(&mut self, description: AttachmentDescription) -> u32 {
        self.attachments.push(description);
        (self.attachments.len() - 1) as u32
    }

    /// Start a new subpass; subsequent role assignments apply to it
    pub fn begin_subpass(&mut self) {
        self.subpasses.push(SubpassDescription::default());
    }

    pub fn add_color_attachment(&mut self, index: u32, layout: ImageLayout) -> BackendResult<()> {
        let reference = self.reference(index, layout)?;
        self.current_subpass()?.color_attachments.push(reference);
        Ok(())
    }

    pub fn set_depth_stencil_attachment(
        &mut self,
        index: u32,
        layout: ImageLayout,
    ) -> BackendResult<()> {
        let reference = self.reference(index, layout)?;
        self.current_subpass()?.depth_stencil_attachment = Some(reference);
        Ok(())
    }

    pub fn add_resolve_attachment(&mut self, index: u32, layout: ImageLayout) -> BackendResult<()> {
        let reference = self.reference(index, layout)?;
        self.current_subpass()?.resolve_attachments.push(reference);
        Ok(())
    }

    pub fn attachments(&self) -> &[AttachmentDescription] {
        &self.attachments
    }

    pub fn subpasses(&self) -> &[SubpassDescription] {
        &self.subpasses
    }

    fn reference(&self, index: u32, layout: ImageLayout) -> BackendResult<AttachmentReference> {
        if index as usize >= self.attachments.len() {
            return Err(BackendError::InvalidAttachmentReference {
                index,
                count: self.attachments.len() as u32,
            });
        }
        Ok(AttachmentReference { index, layout })
    }

    fn current_subpass(&mut self) -> BackendResult<&mut SubpassDescription> {
        self.subpasses.last_mut().ok_or(BackendError::NoActiveSubpass)
    }
}

/// Framebuffer descriptor; attachments are in render pass attachment order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferDescriptor {
    pub label: Option<String>,
    pub render_pass: RenderPassHandle,
    pub width: u32,
    pub height: u32,
    pub attachments: Vec<TextureHandle>,
}

/// One sampled image binding of a descriptor set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorImageBinding {
    pub binding: u32,
    pub texture: TextureHandle,
    pub layout: ImageLayout,
    pub stage: ShaderStageFlags,
}

/// Descriptor set of combined image samplers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorSetDescriptor {
    pub label: Option<String>,
    pub images: Vec<DescriptorImageBinding>,
}

impl DescriptorSetDescriptor {
    pub fn new(label: Option<String>) -> Self {
        Self {
            label,
            images: Vec::new(),
        }
    }

    /// Append a sampled image at the next binding slot
    pub fn add_image_sampler(
        &mut self,
        texture: TextureHandle,
        layout: ImageLayout,
        stage: ShaderStageFlags,
    ) {
        let binding = self.images.len() as u32;
        self.images.push(DescriptorImageBinding {
            binding,
            texture,
            layout,
            stage,
        });
    }
}

/// Graphics device operations the render graph relies on
///
/// Creation calls are synchronous and must not race with command submission
/// on the same device. Destroy calls assume the GPU no longer uses the object.
pub trait RenderDevice {
    // Resource creation

    /// Create a render pass object
    fn create_render_pass(&mut self, desc: &RenderPassDescriptor)
        -> BackendResult<RenderPassHandle>;

    /// Create a texture with a default full view
    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    /// Query dimensions, format and last known layout of a texture
    fn texture_info(&self, texture: TextureHandle) -> Option<TextureInfo>;

    /// Create a framebuffer compatible with `desc.render_pass`
    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor)
        -> BackendResult<FramebufferHandle>;

    /// Get the extent a framebuffer was created with
    fn framebuffer_extent(&self, framebuffer: FramebufferHandle) -> Option<Extent2D>;

    /// Create and populate a descriptor set of sampled images
    fn create_descriptor_set(
        &mut self,
        desc: &DescriptorSetDescriptor,
    ) -> BackendResult<DescriptorSetHandle>;

    // Command recording

    /// Begin a render pass over the whole framebuffer area
    fn begin_render_pass(
        &mut self,
        command_buffer: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        clear_values: &[ClearValue],
    );

    /// End the current render pass
    fn end_render_pass(&mut self, command_buffer: CommandBufferHandle);

    /// Record an aggregated pipeline barrier
    fn pipeline_barrier(&mut self, command_buffer: CommandBufferHandle, barrier: &PipelineBarrier);

    // Resource cleanup

    /// Destroy a render pass object
    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle);

    /// Destroy a texture created by [`RenderDevice::create_texture`]
    fn destroy_texture(&mut self, texture: TextureHandle);

    /// Destroy a framebuffer
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);

    /// Destroy a descriptor set
    fn destroy_descriptor_set(&mut self, descriptor_set: DescriptorSetHandle);
}
