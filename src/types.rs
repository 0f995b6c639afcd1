// Public data model for the RHI
//
// Everything here is backend agnostic. The vulkan module translates
// these into native enums when recording commands or creating objects.

use bitflags::bitflags;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

/// Process-wide id of a created resource (buffer or image).
pub type ResourceId = u64;
/// Process-wide id of a view materialized from a resource.
pub type ResourceViewId = u64;
/// Process-wide id of a sampler.
pub type SamplerId = u64;
/// Application-chosen id of a loaded shader program.
pub type ShaderProgramId = u64;
/// A preprocessor/feature permutation of a shader program.
pub type ShaderPermutationId = u64;
/// Application-chosen id of a registered vertex input layout.
pub type VertexInputLayoutId = u64;

/// The graphics driver the instance should load.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Api {
    Vulkan,
    D3d12,
    D3d11,
}

/// Application identification handed to the driver.
#[derive(Clone, Debug, Default)]
pub struct AppInfo {
    pub app_name: String,
    pub engine_name: String,
    pub app_version: u32,
    pub engine_version: u32,
}

bitflags! {
    /// Optional instance layers and features. Flags whose backing layer
    /// or extension is missing on the installed driver are silently
    /// dropped with a warning; the created instance records what was
    /// actually granted.
    pub struct LayerFlags: u32 {
        const DEBUG_VALIDATION     = 1 << 0;
        const GPU_DEBUG_VALIDATION = 1 << 1;
        const API_DUMP             = 1 << 2;
        const DEBUG_MARKING        = 1 << 3;
        const RAYTRACING           = 1 << 4;
        const MESH_SHADING         = 1 << 5;
    }
}

/// Raw platform window/display pair used for surface creation. The RHI
/// does no windowing of its own, callers pass handles from whatever
/// window system they use.
#[derive(Copy, Clone)]
pub struct WindowHandle {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

/// Parameters for logical device creation.
#[derive(Clone, Default)]
pub struct DeviceCreateInfo {
    /// When present, a presentation surface is created and the
    /// swapchain extension is enabled.
    pub window: Option<WindowHandle>,
}

/// Texel and element formats understood by the RHI.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ResourceFormat {
    Unknown,
    R8Uint,
    R16Float,
    R32Float,
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Unorm,
    B8G8R8A8Srgb,
    R16G16B16A16Float,
    R32G32B32A32Float,
    R32G32B32A32Uint,
    R32G32Float,
    R32G32Uint,
    R11G11B10Float,
    D16Unorm,
    D24UnormS8Uint,
    D32Float,
    D32FloatS8Uint,
    Bc1Unorm,
    Bc2Unorm,
    Bc3Unorm,
    Bc4Unorm,
    Bc5Unorm,
    Bc7Unorm,
    R24UnormX8Typeless,
}

impl ResourceFormat {
    /// Whether the format carries a depth aspect.
    pub fn is_depth(self) -> bool {
        matches!(
            self,
            ResourceFormat::D16Unorm
                | ResourceFormat::D24UnormS8Uint
                | ResourceFormat::D32Float
                | ResourceFormat::D32FloatS8Uint
        )
    }

    /// Whether the format carries a stencil aspect.
    pub fn has_stencil(self) -> bool {
        matches!(
            self,
            ResourceFormat::D24UnormS8Uint | ResourceFormat::D32FloatS8Uint
        )
    }
}

bitflags! {
    /// Roles a resource may serve during its lifetime.
    pub struct ResourceUsage: u32 {
        const VERTEX_BUFFER    = 1 << 0;
        const INDEX_BUFFER     = 1 << 1;
        const CONSTANT_BUFFER  = 1 << 2;
        const SHADER_RESOURCE  = 1 << 3;
        const UNORDERED_ACCESS = 1 << 4;
        const RENDER_TARGET    = 1 << 5;
        const DEPTH_STENCIL    = 1 << 6;
        const COPY_SOURCE      = 1 << 7;
        const COPY_DESTINATION = 1 << 8;
        const INDIRECT_BUFFER  = 1 << 9;
    }
}

/// Which heap class backs a resource.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ResourceMemoryUsage {
    CpuOnly,
    CpuToGpu,
    GpuToCpu,
    GpuOnly,
    CpuVisible,
}

impl ResourceMemoryUsage {
    /// Host-visible usages get their pages persistently mapped.
    pub fn is_host_visible(self) -> bool {
        !matches!(self, ResourceMemoryUsage::GpuOnly)
    }
}

/// Dimensionality of a resource.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ResourceDimension {
    Buffer,
    Dim1d,
    Dim2d,
    Dim3d,
}

/// The single tracked invariant about how a resource will next be
/// read or written. Drives barrier emission; transitioning to the
/// current state is a no-op.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ResourceState {
    Common,
    VertexBuffer,
    IndexBuffer,
    ConstantBuffer,
    IndirectArgs,
    ShaderResource,
    UnorderedAccess,
    RenderTarget,
    DepthStencilReadOnly,
    DepthStencilWrite,
    CopySource,
    CopyDestination,
    Present,
    AccelerationStructure,
}

/// Description of a buffer or image to create.
///
/// For buffers, `width` is the size in bytes and the remaining extent
/// fields are ignored.
#[derive(Clone, Debug)]
pub struct GraphicsResourceDescription {
    pub name: Option<String>,
    pub dimension: ResourceDimension,
    pub width: u64,
    pub height: u32,
    pub depth_or_array_size: u32,
    pub mip_levels: u32,
    pub samples: u32,
    pub format: ResourceFormat,
    pub usage: ResourceUsage,
    pub memory_usage: ResourceMemoryUsage,
}

impl Default for GraphicsResourceDescription {
    fn default() -> Self {
        Self {
            name: None,
            dimension: ResourceDimension::Buffer,
            width: 0,
            height: 1,
            depth_or_array_size: 1,
            mip_levels: 1,
            samples: 1,
            format: ResourceFormat::Unknown,
            usage: ResourceUsage::empty(),
            memory_usage: ResourceMemoryUsage::GpuOnly,
        }
    }
}

/// What a view exposes of its resource.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ResourceViewType {
    RenderTarget,
    DepthStencil,
    ShaderResource,
    UnorderedAccess,
}

/// Dimensionality of a view.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ResourceViewDimension {
    Buffer,
    Dim1d,
    Dim1dArray,
    Dim2d,
    Dim2dArray,
    Dim2dMultisample,
    Dim3d,
    Cube,
    CubeArray,
}

/// A typed window onto a resource. Hashed to cache views on their
/// owning resource, so two identical descriptions share one view.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct ResourceViewDescription {
    pub view_type: ResourceViewType,
    pub dimension: ResourceViewDimension,
    pub format: ResourceFormat,
    pub base_array_layer: u32,
    pub layer_count: u32,
    pub base_mip_level: u32,
    pub mip_level_count: u32,
    /// Buffer views only.
    pub first_element: u32,
    pub num_elements: u32,
    pub byte_stride: u32,
}

impl Default for ResourceViewDescription {
    fn default() -> Self {
        Self {
            view_type: ResourceViewType::ShaderResource,
            dimension: ResourceViewDimension::Dim2d,
            format: ResourceFormat::Unknown,
            base_array_layer: 0,
            layer_count: 1,
            base_mip_level: 0,
            mip_level_count: 1,
            first_element: 0,
            num_elements: 0,
            byte_stride: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    Nearest,
    Linear,
    Cubic,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SamplerAddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
    MirrorClampToEdge,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SamplerMipMapMode {
    Nearest,
    Linear,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BorderColor {
    TransparentBlack,
    OpaqueBlack,
    OpaqueWhite,
}

/// Sampler parameters. Uniquely identified by a 64-bit hash of the
/// description, see [`SamplerDescription::hash_id`].
#[derive(Copy, Clone, Debug)]
pub struct SamplerDescription {
    pub address_mode_u: SamplerAddressMode,
    pub address_mode_v: SamplerAddressMode,
    pub address_mode_w: SamplerAddressMode,
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mip_map_mode: SamplerMipMapMode,
    pub min_lod: f32,
    pub max_lod: f32,
    pub max_anisotropy: f32,
    pub mip_lod_bias: f32,
    pub compare_op: CompareOp,
    pub border_color: BorderColor,
}

impl Default for SamplerDescription {
    fn default() -> Self {
        Self {
            address_mode_u: SamplerAddressMode::Repeat,
            address_mode_v: SamplerAddressMode::Repeat,
            address_mode_w: SamplerAddressMode::Repeat,
            min_filter: Filter::Linear,
            mag_filter: Filter::Linear,
            mip_map_mode: SamplerMipMapMode::Linear,
            min_lod: 0.0,
            max_lod: 1.0,
            max_anisotropy: 0.0,
            mip_lod_bias: 0.0,
            compare_op: CompareOp::Never,
            border_color: BorderColor::TransparentBlack,
        }
    }
}

impl SamplerDescription {
    /// Stable 64-bit content hash over the description, floats taken
    /// by bit pattern.
    pub fn hash_id(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut h = DefaultHasher::new();
        (self.address_mode_u as u32).hash(&mut h);
        (self.address_mode_v as u32).hash(&mut h);
        (self.address_mode_w as u32).hash(&mut h);
        (self.min_filter as u32).hash(&mut h);
        (self.mag_filter as u32).hash(&mut h);
        (self.mip_map_mode as u32).hash(&mut h);
        self.min_lod.to_bits().hash(&mut h);
        self.max_lod.to_bits().hash(&mut h);
        self.max_anisotropy.to_bits().hash(&mut h);
        self.mip_lod_bias.to_bits().hash(&mut h);
        (self.compare_op as u32).hash(&mut h);
        (self.border_color as u32).hash(&mut h);
        h.finish()
    }
}

/// How many images the presentation engine cycles through.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameBuffering {
    Single,
    Double,
    Triple,
}

bitflags! {
    /// Presentation behavior. Empty flags mean a normal present.
    pub struct PresentConfig: u32 {
        const SKIP_PRESENT  = 1 << 0;
        const DELAY_PRESENT = 1 << 1;
    }
}

/// Parameters for swapchain creation and rebuild.
#[derive(Copy, Clone, Debug)]
pub struct SwapchainCreateDescription {
    pub desired_frames: u32,
    pub render_width: u32,
    pub render_height: u32,
    pub format: ResourceFormat,
    pub buffering: FrameBuffering,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IndexType {
    Unsigned16,
    Unsigned32,
}

bitflags! {
    /// Shader stages a binding is visible to.
    pub struct ShaderStage: u32 {
        const VERTEX   = 1 << 0;
        const PIXEL    = 1 << 1;
        const GEOMETRY = 1 << 2;
        const HULL     = 1 << 3;
        const DOMAIN   = 1 << 4;
        const COMPUTE  = 1 << 5;
        const TASK     = 1 << 6;
        const MESH     = 1 << 7;
        const ALL      = 0xff;
    }
}

bitflags! {
    /// Aspects cleared by `clear_depth_stencil`.
    pub struct ClearFlags: u32 {
        const DEPTH   = 1 << 0;
        const STENCIL = 1 << 1;
    }
}

bitflags! {
    /// Behavior of `Context::push_state`.
    pub struct ContextFlags: u32 {
        const INHERIT_PIPELINE_STATE = 1 << 0;
    }
}

bitflags! {
    /// Per render-target channel write mask.
    pub struct ColorComponents: u32 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
        const ALL = 0xf;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    IncrementAndClamp,
    DecrementAndClamp,
    Invert,
    IncrementAndWrap,
    DecrementAndWrap,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    ConstantColor,
    OneMinusConstantColor,
    ConstantAlpha,
    OneMinusConstantAlpha,
    SrcAlphaSaturate,
    Src1Color,
    OneMinusSrc1Color,
    Src1Alpha,
    OneMinusSrc1Alpha,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogicOp {
    Clear,
    And,
    AndReverse,
    Copy,
    AndInverted,
    NoOp,
    Xor,
    Or,
    Nor,
    Equivalent,
    Invert,
    OrReverse,
    CopyInverted,
    OrInverted,
    Nand,
    Set,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CullMode {
    None,
    Front,
    Back,
    FrontAndBack,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrontFace {
    CounterClockwise,
    Clockwise,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PolygonMode {
    Fill,
    Line,
    Point,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

impl Default for PrimitiveTopology {
    fn default() -> Self {
        PrimitiveTopology::TriangleList
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InputRate {
    PerVertex,
    PerInstance,
}

/// One attribute within a vertex binding.
#[derive(Clone, Debug)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: ResourceFormat,
    pub offset_bytes: u32,
    pub semantic: String,
}

/// One vertex buffer binding and its attributes.
#[derive(Clone, Debug)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride_bytes: u32,
    pub input_rate: InputRate,
    pub attributes: Vec<VertexAttribute>,
}

/// A complete vertex input layout, registered on the device under a
/// caller-chosen id and referenced from pipeline state.
#[derive(Clone, Debug, Default)]
pub struct VertexInputLayout {
    pub bindings: Vec<VertexBinding>,
}

/// Opaque compiled shader bytecode plus its entry point. The RHI does
/// no compilation or reflection of its own.
#[derive(Clone, Debug)]
pub struct ShaderBlob {
    pub entry: String,
    pub code: Vec<u32>,
}

/// Slot-to-binding translation tables produced by an external shader
/// tool. Indexed by the application's logical slot.
#[derive(Clone, Debug, Default)]
pub struct ShaderProgramReflection {
    pub cbvs: Vec<u32>,
    pub srvs: Vec<u32>,
    pub uavs: Vec<u32>,
    pub samplers: Vec<u32>,
}

/// The stages making up one shader program permutation.
#[derive(Clone, Debug)]
pub enum ShaderProgramDefinition {
    Graphics {
        vs: ShaderBlob,
        ps: Option<ShaderBlob>,
        gs: Option<ShaderBlob>,
        hs: Option<ShaderBlob>,
        ds: Option<ShaderBlob>,
        reflection: Option<ShaderProgramReflection>,
    },
    Compute {
        cs: ShaderBlob,
        reflection: Option<ShaderProgramReflection>,
    },
}

/// Byte range of a mapped resource.
#[derive(Copy, Clone, Debug)]
pub struct MapRange {
    pub offset_bytes: u64,
    pub size_bytes: u64,
}

/// One region of a buffer-to-buffer copy.
#[derive(Copy, Clone, Debug)]
pub struct CopyBufferRegion {
    pub src_offset_bytes: u64,
    pub dst_offset_bytes: u64,
    pub size_bytes: u64,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_hash_is_stable() {
        let a = SamplerDescription::default();
        let b = SamplerDescription::default();
        assert_eq!(a.hash_id(), b.hash_id());

        let c = SamplerDescription {
            max_anisotropy: 16.0,
            ..SamplerDescription::default()
        };
        assert_ne!(a.hash_id(), c.hash_id());
    }

    #[test]
    fn depth_formats() {
        assert!(ResourceFormat::D32Float.is_depth());
        assert!(!ResourceFormat::D32Float.has_stencil());
        assert!(ResourceFormat::D24UnormS8Uint.has_stencil());
        assert!(!ResourceFormat::R8G8B8A8Unorm.is_depth());
    }

    #[test]
    fn shader_stage_all_covers_every_stage() {
        let each = ShaderStage::VERTEX
            | ShaderStage::PIXEL
            | ShaderStage::GEOMETRY
            | ShaderStage::HULL
            | ShaderStage::DOMAIN
            | ShaderStage::COMPUTE
            | ShaderStage::TASK
            | ShaderStage::MESH;
        assert_eq!(each, ShaderStage::ALL);
    }
}
