// Translation tables between the RHI data model and native vulkan
// enums. Pure functions only, no device state.

use ash::vk;

use crate::types::*;

/// The image layout a resource state implies.
pub fn image_layout_for_state(state: ResourceState) -> vk::ImageLayout {
    match state {
        ResourceState::Common => vk::ImageLayout::UNDEFINED,
        ResourceState::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ResourceState::DepthStencilReadOnly => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ResourceState::DepthStencilWrite => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ResourceState::ShaderResource => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ResourceState::UnorderedAccess => vk::ImageLayout::GENERAL,
        ResourceState::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ResourceState::CopyDestination => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ResourceState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        // Buffer-ish states have no image layout; GENERAL keeps the
        // validation layers quiet if one ever reaches an image.
        ResourceState::VertexBuffer
        | ResourceState::IndexBuffer
        | ResourceState::ConstantBuffer
        | ResourceState::IndirectArgs
        | ResourceState::AccelerationStructure => vk::ImageLayout::GENERAL,
    }
}

/// The access mask commands in a resource state will use.
pub fn access_mask_for_state(state: ResourceState) -> vk::AccessFlags {
    match state {
        ResourceState::Common => vk::AccessFlags::empty(),
        ResourceState::VertexBuffer => vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
        ResourceState::IndexBuffer => vk::AccessFlags::INDEX_READ,
        ResourceState::ConstantBuffer => vk::AccessFlags::UNIFORM_READ,
        ResourceState::IndirectArgs => vk::AccessFlags::INDIRECT_COMMAND_READ,
        ResourceState::ShaderResource => vk::AccessFlags::SHADER_READ,
        ResourceState::UnorderedAccess => {
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE
        }
        ResourceState::RenderTarget => {
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        }
        ResourceState::DepthStencilReadOnly => vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
        ResourceState::DepthStencilWrite => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        ResourceState::CopySource => vk::AccessFlags::TRANSFER_READ,
        ResourceState::CopyDestination => vk::AccessFlags::TRANSFER_WRITE,
        ResourceState::Present => vk::AccessFlags::empty(),
        ResourceState::AccelerationStructure => {
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
        }
    }
}

/// Host access implied by the heap class, folded into barrier
/// destination masks so mapped writes stay visible.
pub fn host_access_for_memory_usage(usage: ResourceMemoryUsage) -> vk::AccessFlags {
    match usage {
        ResourceMemoryUsage::GpuOnly => vk::AccessFlags::empty(),
        ResourceMemoryUsage::CpuOnly | ResourceMemoryUsage::CpuVisible => {
            vk::AccessFlags::HOST_READ | vk::AccessFlags::HOST_WRITE
        }
        ResourceMemoryUsage::CpuToGpu => vk::AccessFlags::HOST_WRITE,
        ResourceMemoryUsage::GpuToCpu => vk::AccessFlags::HOST_READ,
    }
}

/// required/preferred memory property flags per heap class.
pub fn memory_properties_for_usage(
    usage: ResourceMemoryUsage,
) -> (vk::MemoryPropertyFlags, vk::MemoryPropertyFlags) {
    match usage {
        ResourceMemoryUsage::CpuOnly | ResourceMemoryUsage::CpuVisible => (
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_CACHED,
        ),
        ResourceMemoryUsage::GpuOnly => (
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
        ),
        ResourceMemoryUsage::CpuToGpu => (
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ),
        ResourceMemoryUsage::GpuToCpu => (
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_COHERENT | vk::MemoryPropertyFlags::HOST_CACHED,
        ),
    }
}

pub fn vk_format(format: ResourceFormat) -> vk::Format {
    match format {
        ResourceFormat::Unknown => vk::Format::UNDEFINED,
        ResourceFormat::R8Uint => vk::Format::R8_UINT,
        ResourceFormat::R16Float => vk::Format::R16_SFLOAT,
        ResourceFormat::R32Float => vk::Format::R32_SFLOAT,
        ResourceFormat::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        ResourceFormat::R8G8B8A8Srgb => vk::Format::R8G8B8A8_SRGB,
        ResourceFormat::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
        ResourceFormat::B8G8R8A8Srgb => vk::Format::B8G8R8A8_SRGB,
        ResourceFormat::R16G16B16A16Float => vk::Format::R16G16B16A16_SFLOAT,
        ResourceFormat::R32G32B32A32Float => vk::Format::R32G32B32A32_SFLOAT,
        ResourceFormat::R32G32B32A32Uint => vk::Format::R32G32B32A32_UINT,
        ResourceFormat::R32G32Float => vk::Format::R32G32_SFLOAT,
        ResourceFormat::R32G32Uint => vk::Format::R32G32_UINT,
        ResourceFormat::R11G11B10Float => vk::Format::B10G11R11_UFLOAT_PACK32,
        ResourceFormat::D16Unorm => vk::Format::D16_UNORM,
        ResourceFormat::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
        ResourceFormat::D32Float => vk::Format::D32_SFLOAT,
        ResourceFormat::D32FloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
        ResourceFormat::Bc1Unorm => vk::Format::BC1_RGBA_UNORM_BLOCK,
        ResourceFormat::Bc2Unorm => vk::Format::BC2_UNORM_BLOCK,
        ResourceFormat::Bc3Unorm => vk::Format::BC3_UNORM_BLOCK,
        ResourceFormat::Bc4Unorm => vk::Format::BC4_UNORM_BLOCK,
        ResourceFormat::Bc5Unorm => vk::Format::BC5_UNORM_BLOCK,
        ResourceFormat::Bc7Unorm => vk::Format::BC7_UNORM_BLOCK,
        ResourceFormat::R24UnormX8Typeless => vk::Format::X8_D24_UNORM_PACK32,
    }
}

pub fn resource_format_from_vk(format: vk::Format) -> ResourceFormat {
    match format {
        vk::Format::R8_UINT => ResourceFormat::R8Uint,
        vk::Format::R16_SFLOAT => ResourceFormat::R16Float,
        vk::Format::R32_SFLOAT => ResourceFormat::R32Float,
        vk::Format::R8G8B8A8_UNORM => ResourceFormat::R8G8B8A8Unorm,
        vk::Format::R8G8B8A8_SRGB => ResourceFormat::R8G8B8A8Srgb,
        vk::Format::B8G8R8A8_UNORM => ResourceFormat::B8G8R8A8Unorm,
        vk::Format::B8G8R8A8_SRGB => ResourceFormat::B8G8R8A8Srgb,
        vk::Format::R16G16B16A16_SFLOAT => ResourceFormat::R16G16B16A16Float,
        vk::Format::R32G32B32A32_SFLOAT => ResourceFormat::R32G32B32A32Float,
        vk::Format::R32G32B32A32_UINT => ResourceFormat::R32G32B32A32Uint,
        vk::Format::R32G32_SFLOAT => ResourceFormat::R32G32Float,
        vk::Format::R32G32_UINT => ResourceFormat::R32G32Uint,
        vk::Format::B10G11R11_UFLOAT_PACK32 => ResourceFormat::R11G11B10Float,
        vk::Format::D16_UNORM => ResourceFormat::D16Unorm,
        vk::Format::D24_UNORM_S8_UINT => ResourceFormat::D24UnormS8Uint,
        vk::Format::D32_SFLOAT => ResourceFormat::D32Float,
        vk::Format::D32_SFLOAT_S8_UINT => ResourceFormat::D32FloatS8Uint,
        vk::Format::BC1_RGBA_UNORM_BLOCK => ResourceFormat::Bc1Unorm,
        vk::Format::BC2_UNORM_BLOCK => ResourceFormat::Bc2Unorm,
        vk::Format::BC3_UNORM_BLOCK => ResourceFormat::Bc3Unorm,
        vk::Format::BC4_UNORM_BLOCK => ResourceFormat::Bc4Unorm,
        vk::Format::BC5_UNORM_BLOCK => ResourceFormat::Bc5Unorm,
        vk::Format::BC7_UNORM_BLOCK => ResourceFormat::Bc7Unorm,
        vk::Format::X8_D24_UNORM_PACK32 => ResourceFormat::R24UnormX8Typeless,
        _ => ResourceFormat::Unknown,
    }
}

/// Aspect flags for a depth/stencil format. Formats without stencil
/// only report the depth bit.
pub fn depth_stencil_aspect(format: ResourceFormat) -> vk::ImageAspectFlags {
    let mut aspect = vk::ImageAspectFlags::DEPTH;
    if format.has_stencil() {
        aspect |= vk::ImageAspectFlags::STENCIL;
    }
    aspect
}

pub fn vk_shader_stages(stages: ShaderStage) -> vk::ShaderStageFlags {
    let mut out = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStage::VERTEX) {
        out |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(ShaderStage::PIXEL) {
        out |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stages.contains(ShaderStage::GEOMETRY) {
        out |= vk::ShaderStageFlags::GEOMETRY;
    }
    if stages.contains(ShaderStage::HULL) {
        out |= vk::ShaderStageFlags::TESSELLATION_CONTROL;
    }
    if stages.contains(ShaderStage::DOMAIN) {
        out |= vk::ShaderStageFlags::TESSELLATION_EVALUATION;
    }
    if stages.contains(ShaderStage::COMPUTE) {
        out |= vk::ShaderStageFlags::COMPUTE;
    }
    if stages.contains(ShaderStage::TASK) {
        out |= vk::ShaderStageFlags::TASK_NV;
    }
    if stages.contains(ShaderStage::MESH) {
        out |= vk::ShaderStageFlags::MESH_NV;
    }
    out
}

pub fn vk_index_type(ty: IndexType) -> vk::IndexType {
    match ty {
        IndexType::Unsigned16 => vk::IndexType::UINT16,
        IndexType::Unsigned32 => vk::IndexType::UINT32,
    }
}

pub fn vk_topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
    }
}

pub fn vk_cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
        CullMode::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
    }
}

pub fn vk_front_face(face: FrontFace) -> vk::FrontFace {
    match face {
        FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
    }
}

pub fn vk_polygon_mode(mode: PolygonMode) -> vk::PolygonMode {
    match mode {
        PolygonMode::Fill => vk::PolygonMode::FILL,
        PolygonMode::Line => vk::PolygonMode::LINE,
        PolygonMode::Point => vk::PolygonMode::POINT,
    }
}

pub fn vk_compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

pub fn vk_stencil_op(op: StencilOp) -> vk::StencilOp {
    match op {
        StencilOp::Keep => vk::StencilOp::KEEP,
        StencilOp::Zero => vk::StencilOp::ZERO,
        StencilOp::Replace => vk::StencilOp::REPLACE,
        StencilOp::IncrementAndClamp => vk::StencilOp::INCREMENT_AND_CLAMP,
        StencilOp::DecrementAndClamp => vk::StencilOp::DECREMENT_AND_CLAMP,
        StencilOp::Invert => vk::StencilOp::INVERT,
        StencilOp::IncrementAndWrap => vk::StencilOp::INCREMENT_AND_WRAP,
        StencilOp::DecrementAndWrap => vk::StencilOp::DECREMENT_AND_WRAP,
    }
}

pub fn vk_blend_factor(factor: BlendFactor) -> vk::BlendFactor {
    match factor {
        BlendFactor::Zero => vk::BlendFactor::ZERO,
        BlendFactor::One => vk::BlendFactor::ONE,
        BlendFactor::SrcColor => vk::BlendFactor::SRC_COLOR,
        BlendFactor::OneMinusSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        BlendFactor::DstColor => vk::BlendFactor::DST_COLOR,
        BlendFactor::OneMinusDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
        BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        BlendFactor::ConstantColor => vk::BlendFactor::CONSTANT_COLOR,
        BlendFactor::OneMinusConstantColor => vk::BlendFactor::ONE_MINUS_CONSTANT_COLOR,
        BlendFactor::ConstantAlpha => vk::BlendFactor::CONSTANT_ALPHA,
        BlendFactor::OneMinusConstantAlpha => vk::BlendFactor::ONE_MINUS_CONSTANT_ALPHA,
        BlendFactor::SrcAlphaSaturate => vk::BlendFactor::SRC_ALPHA_SATURATE,
        BlendFactor::Src1Color => vk::BlendFactor::SRC1_COLOR,
        BlendFactor::OneMinusSrc1Color => vk::BlendFactor::ONE_MINUS_SRC1_COLOR,
        BlendFactor::Src1Alpha => vk::BlendFactor::SRC1_ALPHA,
        BlendFactor::OneMinusSrc1Alpha => vk::BlendFactor::ONE_MINUS_SRC1_ALPHA,
    }
}

pub fn vk_blend_op(op: BlendOp) -> vk::BlendOp {
    match op {
        BlendOp::Add => vk::BlendOp::ADD,
        BlendOp::Subtract => vk::BlendOp::SUBTRACT,
        BlendOp::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
        BlendOp::Min => vk::BlendOp::MIN,
        BlendOp::Max => vk::BlendOp::MAX,
    }
}

pub fn vk_logic_op(op: LogicOp) -> vk::LogicOp {
    match op {
        LogicOp::Clear => vk::LogicOp::CLEAR,
        LogicOp::And => vk::LogicOp::AND,
        LogicOp::AndReverse => vk::LogicOp::AND_REVERSE,
        LogicOp::Copy => vk::LogicOp::COPY,
        LogicOp::AndInverted => vk::LogicOp::AND_INVERTED,
        LogicOp::NoOp => vk::LogicOp::NO_OP,
        LogicOp::Xor => vk::LogicOp::XOR,
        LogicOp::Or => vk::LogicOp::OR,
        LogicOp::Nor => vk::LogicOp::NOR,
        LogicOp::Equivalent => vk::LogicOp::EQUIVALENT,
        LogicOp::Invert => vk::LogicOp::INVERT,
        LogicOp::OrReverse => vk::LogicOp::OR_REVERSE,
        LogicOp::CopyInverted => vk::LogicOp::COPY_INVERTED,
        LogicOp::OrInverted => vk::LogicOp::OR_INVERTED,
        LogicOp::Nand => vk::LogicOp::NAND,
        LogicOp::Set => vk::LogicOp::SET,
    }
}

pub fn vk_color_components(mask: ColorComponents) -> vk::ColorComponentFlags {
    let mut out = vk::ColorComponentFlags::empty();
    if mask.contains(ColorComponents::R) {
        out |= vk::ColorComponentFlags::R;
    }
    if mask.contains(ColorComponents::G) {
        out |= vk::ColorComponentFlags::G;
    }
    if mask.contains(ColorComponents::B) {
        out |= vk::ColorComponentFlags::B;
    }
    if mask.contains(ColorComponents::A) {
        out |= vk::ColorComponentFlags::A;
    }
    out
}

pub fn vk_input_rate(rate: InputRate) -> vk::VertexInputRate {
    match rate {
        InputRate::PerVertex => vk::VertexInputRate::VERTEX,
        InputRate::PerInstance => vk::VertexInputRate::INSTANCE,
    }
}

pub fn vk_filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
        Filter::Cubic => vk::Filter::CUBIC_IMG,
    }
}

pub fn vk_address_mode(mode: SamplerAddressMode) -> vk::SamplerAddressMode {
    match mode {
        SamplerAddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        SamplerAddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        SamplerAddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        SamplerAddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        SamplerAddressMode::MirrorClampToEdge => vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE,
    }
}

pub fn vk_mipmap_mode(mode: SamplerMipMapMode) -> vk::SamplerMipmapMode {
    match mode {
        SamplerMipMapMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        SamplerMipMapMode::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

pub fn vk_border_color(color: BorderColor) -> vk::BorderColor {
    match color {
        BorderColor::TransparentBlack => vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        BorderColor::OpaqueBlack => vk::BorderColor::FLOAT_OPAQUE_BLACK,
        BorderColor::OpaqueWhite => vk::BorderColor::FLOAT_OPAQUE_WHITE,
    }
}

/// Buffer usage bits for a resource description.
pub fn vk_buffer_usage(usage: ResourceUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.contains(ResourceUsage::VERTEX_BUFFER) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(ResourceUsage::INDEX_BUFFER) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(ResourceUsage::CONSTANT_BUFFER) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(ResourceUsage::SHADER_RESOURCE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(ResourceUsage::UNORDERED_ACCESS) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(ResourceUsage::COPY_SOURCE) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(ResourceUsage::COPY_DESTINATION) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(ResourceUsage::INDIRECT_BUFFER) {
        flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    flags
}

/// Image usage bits for a resource description.
pub fn vk_image_usage(usage: ResourceUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(ResourceUsage::RENDER_TARGET) {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(ResourceUsage::DEPTH_STENCIL) {
        flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if usage.contains(ResourceUsage::SHADER_RESOURCE) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(ResourceUsage::UNORDERED_ACCESS) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(ResourceUsage::COPY_SOURCE) {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(ResourceUsage::COPY_DESTINATION) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    flags
}

/// Format features an image with the given usage needs, used to pick
/// between optimal and linear tiling.
pub fn vk_format_features(usage: ResourceUsage) -> vk::FormatFeatureFlags {
    let mut flags = vk::FormatFeatureFlags::empty();
    if usage.contains(ResourceUsage::RENDER_TARGET) {
        flags |= vk::FormatFeatureFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(ResourceUsage::DEPTH_STENCIL) {
        flags |= vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if usage.contains(ResourceUsage::SHADER_RESOURCE) {
        flags |= vk::FormatFeatureFlags::SAMPLED_IMAGE;
    }
    if usage.contains(ResourceUsage::UNORDERED_ACCESS) {
        flags |= vk::FormatFeatureFlags::STORAGE_IMAGE;
    }
    if usage.contains(ResourceUsage::COPY_SOURCE) {
        flags |= vk::FormatFeatureFlags::TRANSFER_SRC;
    }
    if usage.contains(ResourceUsage::COPY_DESTINATION) {
        flags |= vk::FormatFeatureFlags::TRANSFER_DST;
    }
    flags
}

pub fn vk_image_view_type(dim: ResourceViewDimension) -> vk::ImageViewType {
    match dim {
        ResourceViewDimension::Dim1d => vk::ImageViewType::TYPE_1D,
        ResourceViewDimension::Dim1dArray => vk::ImageViewType::TYPE_1D_ARRAY,
        ResourceViewDimension::Dim2d | ResourceViewDimension::Dim2dMultisample => {
            vk::ImageViewType::TYPE_2D
        }
        ResourceViewDimension::Dim2dArray => vk::ImageViewType::TYPE_2D_ARRAY,
        ResourceViewDimension::Dim3d => vk::ImageViewType::TYPE_3D,
        ResourceViewDimension::Cube => vk::ImageViewType::CUBE,
        ResourceViewDimension::CubeArray => vk::ImageViewType::CUBE_ARRAY,
        ResourceViewDimension::Buffer => vk::ImageViewType::TYPE_2D,
    }
}

/// The layout a view's type expects the image to be in when bound.
pub fn expected_layout_for_view(view_type: ResourceViewType) -> vk::ImageLayout {
    match view_type {
        ResourceViewType::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ResourceViewType::DepthStencil => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ResourceViewType::ShaderResource => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ResourceViewType::UnorderedAccess => vk::ImageLayout::GENERAL,
    }
}

pub fn vk_sample_count(samples: u32) -> vk::SampleCountFlags {
    match samples {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

/// Round `value` up to the next multiple of `align`. `align` of zero
/// or one returns the value untouched.
pub fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        return value;
    }
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_basics() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(13, 0), 13);
        assert_eq!(align_up(13, 1), 13);
    }

    #[test]
    fn state_maps_are_consistent() {
        // Present has no access, Common has no layout.
        assert_eq!(access_mask_for_state(ResourceState::Present), vk::AccessFlags::empty());
        assert_eq!(
            image_layout_for_state(ResourceState::Common),
            vk::ImageLayout::UNDEFINED
        );
        // Write states must include a write access bit.
        assert!(access_mask_for_state(ResourceState::RenderTarget)
            .contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));
        assert!(access_mask_for_state(ResourceState::CopyDestination)
            .contains(vk::AccessFlags::TRANSFER_WRITE));
    }

    #[test]
    fn format_round_trip() {
        for f in [
            ResourceFormat::R8G8B8A8Unorm,
            ResourceFormat::B8G8R8A8Unorm,
            ResourceFormat::D32Float,
            ResourceFormat::D24UnormS8Uint,
            ResourceFormat::R11G11B10Float,
        ]
        .iter()
        {
            assert_eq!(resource_format_from_vk(vk_format(*f)), *f);
        }
    }

    #[test]
    fn depth_only_format_has_no_stencil_aspect() {
        assert_eq!(
            depth_stencil_aspect(ResourceFormat::D32Float),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            depth_stencil_aspect(ResourceFormat::D24UnormS8Uint),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
