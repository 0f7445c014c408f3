//! Common value types shared between the render graph and device backends

/// Implements the set operations shared by all flag types in this module.
macro_rules! impl_flags {
    ($name:ident) => {
        impl $name {
            pub const fn empty() -> Self {
                Self(0)
            }

            pub fn bits(&self) -> u32 {
                self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0 == 0
            }

            pub fn contains(&self, other: Self) -> bool {
                (self.0 & other.0) == other.0
            }

            pub fn intersects(&self, other: Self) -> bool {
                (self.0 & other.0) != 0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self::Output {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    Rg32Float,
    Depth16Unorm,
    Depth32Float,
    Depth24PlusStencil8,
    Depth32FloatStencil8,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(
            self,
            TextureFormat::Depth16Unorm
                | TextureFormat::Depth32Float
                | TextureFormat::Depth24PlusStencil8
                | TextureFormat::Depth32FloatStencil8
        )
    }

    pub fn has_stencil(&self) -> bool {
        matches!(
            self,
            TextureFormat::Depth24PlusStencil8 | TextureFormat::Depth32FloatStencil8
        )
    }

    /// Image aspect a full view of this format covers
    pub fn aspect(&self) -> ImageAspect {
        if self.has_stencil() {
            ImageAspect::DepthStencil
        } else if self.is_depth() {
            ImageAspect::Depth
        } else {
            ImageAspect::Color
        }
    }
}

/// Image aspect covered by a texture view or barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageAspect {
    Color,
    Depth,
    DepthStencil,
}

/// Layout an image is kept in between GPU operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    /// Contents are undefined; only valid as a source layout
    Undefined,
    General,
    ColorAttachment,
    DepthStencilAttachment,
    DepthStencilReadOnly,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

impl ImageLayout {
    /// Memory accesses an image in this layout is expected to see
    pub fn access_mask(&self) -> AccessFlags {
        match self {
            ImageLayout::Undefined | ImageLayout::PresentSrc => AccessFlags::empty(),
            ImageLayout::General => AccessFlags::MEMORY_READ | AccessFlags::MEMORY_WRITE,
            ImageLayout::ColorAttachment => {
                AccessFlags::COLOR_ATTACHMENT_READ | AccessFlags::COLOR_ATTACHMENT_WRITE
            }
            ImageLayout::DepthStencilAttachment => {
                AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            ImageLayout::DepthStencilReadOnly => {
                AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | AccessFlags::SHADER_READ
            }
            ImageLayout::ShaderReadOnly => AccessFlags::SHADER_READ,
            ImageLayout::TransferSrc => AccessFlags::TRANSFER_READ,
            ImageLayout::TransferDst => AccessFlags::TRANSFER_WRITE,
        }
    }
}

/// What happens to an attachment's contents when a render pass begins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

/// What happens to an attachment's contents when a render pass ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Store,
    DontCare,
}

/// Value an attachment is cleared to when its load op is [`LoadOp::Clear`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub const BLACK: Self = ClearValue::Color([0.0, 0.0, 0.0, 1.0]);
    pub const TRANSPARENT: Self = ClearValue::Color([0.0, 0.0, 0.0, 0.0]);
    pub const DEPTH_ONE: Self = ClearValue::DepthStencil {
        depth: 1.0,
        stencil: 0,
    };
}

/// Texture usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureUsage(u32);

impl TextureUsage {
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const SAMPLED: Self = Self(1 << 2);
    pub const STORAGE: Self = Self(1 << 3);
    pub const COLOR_ATTACHMENT: Self = Self(1 << 4);
    pub const DEPTH_STENCIL_ATTACHMENT: Self = Self(1 << 5);
    pub const INPUT_ATTACHMENT: Self = Self(1 << 6);
}

impl_flags!(TextureUsage);

/// Shader stage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderStageFlags(u32);

impl ShaderStageFlags {
    pub const VERTEX: Self = Self(1 << 0);
    pub const FRAGMENT: Self = Self(1 << 1);
    pub const COMPUTE: Self = Self(1 << 2);
    pub const VERTEX_FRAGMENT: Self = Self((1 << 0) | (1 << 1));
    pub const ALL: Self = Self((1 << 0) | (1 << 1) | (1 << 2));
}

impl_flags!(ShaderStageFlags);

/// Pipeline stages a barrier waits on or blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineStageFlags(u32);

impl PipelineStageFlags {
    pub const TOP_OF_PIPE: Self = Self(1 << 0);
    pub const VERTEX_SHADER: Self = Self(1 << 1);
    pub const FRAGMENT_SHADER: Self = Self(1 << 2);
    pub const EARLY_FRAGMENT_TESTS: Self = Self(1 << 3);
    pub const LATE_FRAGMENT_TESTS: Self = Self(1 << 4);
    pub const COLOR_ATTACHMENT_OUTPUT: Self = Self(1 << 5);
    pub const COMPUTE_SHADER: Self = Self(1 << 6);
    pub const TRANSFER: Self = Self(1 << 7);
    pub const BOTTOM_OF_PIPE: Self = Self(1 << 8);
    pub const ALL_GRAPHICS: Self = Self(1 << 9);
    pub const ALL_COMMANDS: Self = Self(1 << 10);
}

impl_flags!(PipelineStageFlags);

/// Memory access flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessFlags(u32);

impl AccessFlags {
    pub const SHADER_READ: Self = Self(1 << 0);
    pub const SHADER_WRITE: Self = Self(1 << 1);
    pub const COLOR_ATTACHMENT_READ: Self = Self(1 << 2);
    pub const COLOR_ATTACHMENT_WRITE: Self = Self(1 << 3);
    pub const DEPTH_STENCIL_ATTACHMENT_READ: Self = Self(1 << 4);
    pub const DEPTH_STENCIL_ATTACHMENT_WRITE: Self = Self(1 << 5);
    pub const TRANSFER_READ: Self = Self(1 << 6);
    pub const TRANSFER_WRITE: Self = Self(1 << 7);
    pub const MEMORY_READ: Self = Self(1 << 8);
    pub const MEMORY_WRITE: Self = Self(1 << 9);
}

impl_flags!(AccessFlags);

/// Dependency flags for pipeline barriers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DependencyFlags(u32);

impl DependencyFlags {
    pub const BY_REGION: Self = Self(1 << 0);
}

impl_flags!(DependencyFlags);

/// Two-dimensional size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Describes one attachment of a render pass
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentDescription {
    pub format: TextureFormat,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
    pub initial_layout: ImageLayout,
    pub final_layout: ImageLayout,
    pub usage: TextureUsage,
    pub clear_value: ClearValue,
}

impl AttachmentDescription {
    /// A cleared color attachment that ends in [`ImageLayout::ColorAttachment`]
    pub fn color(format: TextureFormat) -> Self {
        Self {
            format,
            load_op: LoadOp::Clear,
            store_op: StoreOp::DontCare,
            stencil_load_op: LoadOp::DontCare,
            stencil_store_op: StoreOp::DontCare,
            initial_layout: ImageLayout::Undefined,
            final_layout: ImageLayout::ColorAttachment,
            usage: TextureUsage::COLOR_ATTACHMENT,
            clear_value: ClearValue::BLACK,
        }
    }

    /// A cleared depth attachment that ends in [`ImageLayout::DepthStencilAttachment`]
    pub fn depth_stencil(format: TextureFormat) -> Self {
        let stencil_load_op = if format.has_stencil() {
            LoadOp::Clear
        } else {
            LoadOp::DontCare
        };

        Self {
            format,
            load_op: LoadOp::Clear,
            store_op: StoreOp::DontCare,
            stencil_load_op,
            stencil_store_op: StoreOp::DontCare,
            initial_layout: ImageLayout::Undefined,
            final_layout: ImageLayout::DepthStencilAttachment,
            usage: TextureUsage::DEPTH_STENCIL_ATTACHMENT,
            clear_value: ClearValue::DEPTH_ONE,
        }
    }

    pub fn with_load_op(mut self, load_op: LoadOp) -> Self {
        self.load_op = load_op;
        self
    }

    pub fn with_store_op(mut self, store_op: StoreOp) -> Self {
        self.store_op = store_op;
        self
    }

    pub fn with_layouts(mut self, initial: ImageLayout, final_layout: ImageLayout) -> Self {
        self.initial_layout = initial;
        self.final_layout = final_layout;
        self
    }

    pub fn with_usage(mut self, usage: TextureUsage) -> Self {
        self.usage |= usage;
        self
    }

    pub fn with_clear_value(mut self, clear_value: ClearValue) -> Self {
        self.clear_value = clear_value;
        self
    }
}

/// Texture descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            mip_levels: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::SAMPLED | TextureUsage::COPY_DST,
        }
    }
}

/// Properties of a live texture as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    /// Layout the device last knew the texture to be in
    pub layout: ImageLayout,
    pub aspect: ImageAspect,
}

impl TextureInfo {
    pub fn extent(&self) -> Extent2D {
        Extent2D::new(self.width, self.height)
    }
}

/// Global memory barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
}

/// Image memory barrier with an optional layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub texture: crate::backend::TextureHandle,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub aspect: ImageAspect,
}

impl ImageBarrier {
    /// Transition between two layouts with access masks derived from the layouts
    pub fn transition(
        texture: crate::backend::TextureHandle,
        aspect: ImageAspect,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) -> Self {
        Self {
            texture,
            old_layout,
            new_layout,
            src_access: old_layout.access_mask(),
            dst_access: new_layout.access_mask(),
            aspect,
        }
    }
}

/// Aggregated pipeline barrier submitted as a single command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineBarrier {
    pub src_stage: PipelineStageFlags,
    pub dst_stage: PipelineStageFlags,
    pub dependency_flags: DependencyFlags,
    pub memory_barriers: Vec<MemoryBarrier>,
    pub image_barriers: Vec<ImageBarrier>,
}

impl PipelineBarrier {
    pub fn new(src_stage: PipelineStageFlags, dst_stage: PipelineStageFlags) -> Self {
        Self {
            src_stage,
            dst_stage,
            dependency_flags: DependencyFlags::empty(),
            memory_barriers: Vec::new(),
            image_barriers: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.memory_barriers.is_empty() && self.image_barriers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_operations() {
        let usage = TextureUsage::COLOR_ATTACHMENT | TextureUsage::SAMPLED;
        assert!(usage.contains(TextureUsage::SAMPLED));
        assert!(!usage.contains(TextureUsage::STORAGE));
        assert!(usage.intersects(TextureUsage::SAMPLED | TextureUsage::STORAGE));
        assert!(TextureUsage::empty().is_empty());
    }

    #[test]
    fn test_format_aspect() {
        assert_eq!(TextureFormat::Rgba8Unorm.aspect(), ImageAspect::Color);
        assert_eq!(TextureFormat::Depth32Float.aspect(), ImageAspect::Depth);
        assert_eq!(
            TextureFormat::Depth24PlusStencil8.aspect(),
            ImageAspect::DepthStencil
        );
    }

    #[test]
    fn test_depth_attachment_defaults() {
        let depth = AttachmentDescription::depth_stencil(TextureFormat::Depth32Float);
        assert_eq!(depth.stencil_load_op, LoadOp::DontCare);
        assert_eq!(depth.final_layout, ImageLayout::DepthStencilAttachment);

        let stencil = AttachmentDescription::depth_stencil(TextureFormat::Depth24PlusStencil8);
        assert_eq!(stencil.stencil_load_op, LoadOp::Clear);
    }

    #[test]
    fn test_transition_access_masks() {
        let barrier = ImageBarrier::transition(
            crate::backend::TextureHandle(7),
            ImageAspect::Color,
            ImageLayout::ShaderReadOnly,
            ImageLayout::ColorAttachment,
        );
        assert_eq!(barrier.src_access, AccessFlags::SHADER_READ);
        assert!(barrier.dst_access.contains(AccessFlags::COLOR_ATTACHMENT_WRITE));
    }
}
