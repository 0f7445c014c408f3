//! Per-frame device resources of a built render graph and the hold queue
//! that defers their destruction

use crate::backend::traits::*;
use crate::render_graph::pass::AttachmentIndex;

/// Textures the output attachment renders into, one per frame in flight
///
/// The graph borrows these textures and never destroys them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTargets {
    /// Textures presented by some later step of the caller
    Offscreen(Vec<TextureHandle>),
    /// Swapchain images, left in the present layout at the end of each frame
    Swapchain(Vec<TextureHandle>),
}

impl OutputTargets {
    pub fn textures(&self) -> &[TextureHandle] {
        match self {
            OutputTargets::Offscreen(textures) | OutputTargets::Swapchain(textures) => textures,
        }
    }

    pub fn len(&self) -> usize {
        self.textures().len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures().is_empty()
    }

    pub fn is_swapchain(&self) -> bool {
        matches!(self, OutputTargets::Swapchain(_))
    }

    pub(crate) fn kind(&self) -> &'static str {
        if self.is_swapchain() {
            "swapchain"
        } else {
            "offscreen"
        }
    }
}

/// Device objects one pass needs to render one frame slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPassResources {
    /// One texture per local attachment, by attachment index
    pub attachment_textures: Vec<TextureHandle>,
    pub framebuffer: FramebufferHandle,
    pub read_descriptor_set: Option<DescriptorSetHandle>,
    /// Attachment bound to a caller-owned output target
    pub(crate) borrowed_attachment: Option<AttachmentIndex>,
}

impl RenderPassResources {
    pub fn texture(&self, attachment: AttachmentIndex) -> Option<TextureHandle> {
        self.attachment_textures.get(attachment.index()).copied()
    }

    /// Textures created for this pass, excluding a borrowed output target
    pub fn owned_textures(&self) -> impl Iterator<Item = (AttachmentIndex, TextureHandle)> + '_ {
        self.attachment_textures
            .iter()
            .enumerate()
            .map(|(i, &texture)| (AttachmentIndex(i), texture))
            .filter(move |(index, _)| Some(*index) != self.borrowed_attachment)
    }

    pub fn destroy<D: RenderDevice + ?Sized>(self, device: &mut D) {
        if let Some(descriptor_set) = self.read_descriptor_set {
            device.destroy_descriptor_set(descriptor_set);
        }
        device.destroy_framebuffer(self.framebuffer);
        for (_, texture) in self.owned_textures() {
            device.destroy_texture(texture);
        }
    }
}

/// Objects created by a build that has not finished yet, released if it fails
#[derive(Debug, Default)]
pub(crate) struct PendingResources {
    pub textures: Vec<TextureHandle>,
    pub framebuffers: Vec<FramebufferHandle>,
    pub descriptor_sets: Vec<DescriptorSetHandle>,
}

impl PendingResources {
    pub fn destroy<D: RenderDevice + ?Sized>(self, device: &mut D) {
        log::debug!(
            "Releasing {} textures, {} framebuffers and {} descriptor sets of a failed build",
            self.textures.len(),
            self.framebuffers.len(),
            self.descriptor_sets.len()
        );
        for descriptor_set in self.descriptor_sets {
            device.destroy_descriptor_set(descriptor_set);
        }
        for framebuffer in self.framebuffers {
            device.destroy_framebuffer(framebuffer);
        }
        for texture in self.textures {
            device.destroy_texture(texture);
        }
    }
}

/// Device objects retired by a rebuild or resize
#[derive(Debug, Default)]
pub struct ResourceGeneration {
    pub render_passes: Vec<RenderPassHandle>,
    /// `[pass][frame]`
    pub resources: Vec<Vec<RenderPassResources>>,
    /// Executed frames left before the generation is destroyed
    pub frames_remaining: usize,
}

impl ResourceGeneration {
    pub fn is_empty(&self) -> bool {
        self.render_passes.is_empty() && self.resources.iter().all(|frames| frames.is_empty())
    }

    pub fn destroy<D: RenderDevice + ?Sized>(self, device: &mut D) {
        for resources in self.resources.into_iter().flatten() {
            resources.destroy(device);
        }
        for render_pass in self.render_passes {
            device.destroy_render_pass(render_pass);
        }
    }
}

/// Deferred-destruction queue for resources that in-flight frames may still use
///
/// Each generation counts down once per executed frame and is destroyed when
/// the count reaches zero.
#[derive(Debug, Default)]
pub struct ResourceHold {
    generations: Vec<ResourceGeneration>,
}

impl ResourceHold {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a generation; empty generations are dropped
    pub fn push(&mut self, generation: ResourceGeneration) {
        if generation.is_empty() {
            return;
        }
        log::debug!(
            "Holding {} render passes and {} pass resources for {} frames",
            generation.render_passes.len(),
            generation.resources.len(),
            generation.frames_remaining
        );
        self.generations.push(generation);
    }

    /// Count one executed frame and destroy generations that expired.
    ///
    /// Returns the number of generations destroyed.
    pub fn tick<D: RenderDevice + ?Sized>(&mut self, device: &mut D) -> usize {
        let mut evicted = 0;
        // Reverse order keeps the remaining indices valid while removing
        for i in (0..self.generations.len()).rev() {
            let generation = &mut self.generations[i];
            generation.frames_remaining = generation.frames_remaining.saturating_sub(1);
            if generation.frames_remaining == 0 {
                self.generations.remove(i).destroy(device);
                evicted += 1;
            }
        }
        if evicted > 0 {
            log::trace!("Resource hold evicted {} generations", evicted);
        }
        evicted
    }

    /// Destroy every held generation immediately; the device must be idle
    pub fn clear<D: RenderDevice + ?Sized>(&mut self, device: &mut D) {
        for generation in self.generations.drain(..) {
            generation.destroy(device);
        }
    }

    pub fn len(&self) -> usize {
        self.generations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    pub fn generations(&self) -> &[ResourceGeneration] {
        &self.generations
    }
}
