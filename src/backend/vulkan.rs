//! Vulkan structures for copy commands.
//!
//! A Vulkan [`TransferBackend`](super::TransferBackend) records each
//! [`CopyCommand`] into a transfer command buffer and signals a timeline
//! semaphore whose value becomes the [`FenceId`](super::FenceId). This module
//! provides the conversions such a backend needs: formats, aspects, and
//! `vkCmdCopyBuffer*` regions. Scratch memory maps to one host-visible,
//! host-coherent `VkBuffer`; scratch offsets are offsets into it.

use super::{CopyCommand, ImageCopy};
use crate::error::Error;
use crate::format::{FormatProperties, TextureFormat};
use ash::vk;
use smallvec::SmallVec;

/// Vulkan format of a texture format.
pub fn to_vk_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::R8Unorm => vk::Format::R8_UNORM,
        TextureFormat::Rg8Unorm => vk::Format::R8G8_UNORM,
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::Bc1RgbaUnorm => vk::Format::BC1_RGBA_UNORM_BLOCK,
        TextureFormat::Bc3RgbaUnorm => vk::Format::BC3_UNORM_BLOCK,
        TextureFormat::Bc7RgbaUnorm => vk::Format::BC7_UNORM_BLOCK,
        TextureFormat::Etc2Rgb8Unorm => vk::Format::ETC2_R8G8B8_UNORM_BLOCK,
        TextureFormat::Astc8x8Unorm => vk::Format::ASTC_8X8_UNORM_BLOCK,
        TextureFormat::Nv12 => vk::Format::G8_B8R8_2PLANE_420_UNORM,
        TextureFormat::I420 => vk::Format::G8_B8_R8_3PLANE_420_UNORM,
    }
}

/// Aspect addressing `plane` of `format`.
pub fn plane_aspect(format: &FormatProperties, plane: u32) -> vk::ImageAspectFlags {
    if !format.is_multi_planar() {
        return vk::ImageAspectFlags::COLOR;
    }
    match plane {
        0 => vk::ImageAspectFlags::PLANE_0,
        1 => vk::ImageAspectFlags::PLANE_1,
        _ => vk::ImageAspectFlags::PLANE_2,
    }
}

/// `vkCmdCopyBuffer` region.
pub fn buffer_copy(src_offset: u64, dst_offset: u64, size: u64) -> vk::BufferCopy {
    vk::BufferCopy::default()
        .src_offset(src_offset)
        .dst_offset(dst_offset)
        .size(size)
}

/// `vkCmdCopyBufferToImage` / `vkCmdCopyImageToBuffer` region.
///
/// Row pitch is expressed in texels of the copied plane, as Vulkan expects.
/// Offsets and extents of subsampled planes are in plane coordinates.
pub fn buffer_image_copy(copy: &ImageCopy, format: &FormatProperties) -> vk::BufferImageCopy {
    let plane = format.plane(copy.plane);
    let row_blocks = copy.row_pitch / plane.bytes_per_block.max(1);

    vk::BufferImageCopy::default()
        .buffer_offset(copy.scratch_offset as u64)
        .buffer_row_length(row_blocks * format.block_width)
        .buffer_image_height(copy.rows_per_slice * format.block_height)
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(plane_aspect(format, copy.plane))
                .mip_level(copy.mip_level)
                .base_array_layer(copy.array_slice)
                .layer_count(1),
        )
        .image_offset(vk::Offset3D {
            x: (copy.offset.x / plane.subsample_x) as i32,
            y: (copy.offset.y / plane.subsample_y) as i32,
            z: copy.offset.z as i32,
        })
        .image_extent(vk::Extent3D {
            width: copy.extent.width.div_ceil(plane.subsample_x),
            height: copy.extent.height.div_ceil(plane.subsample_y),
            depth: copy.extent.depth,
        })
}

/// Regions to record for `command`.
pub enum VkCopyRegions {
    /// Scratch buffer to or from a device buffer.
    Buffer(vk::BufferCopy),
    /// Scratch buffer to or from an image.
    Image(SmallVec<[vk::BufferImageCopy; 4]>),
}

/// Copy regions of `command`, with scratch offsets into the scratch buffer.
pub fn copy_regions(command: &CopyCommand) -> VkCopyRegions {
    match command {
        CopyCommand::BufferWrite {
            source, offset, ..
        } => VkCopyRegions::Buffer(buffer_copy(source.offset as u64, *offset, source.len as u64)),
        CopyCommand::BufferRead {
            offset,
            destination,
            ..
        } => VkCopyRegions::Buffer(buffer_copy(
            *offset,
            destination.offset as u64,
            destination.len as u64,
        )),
        CopyCommand::ImageWrite {
            format, regions, ..
        } => VkCopyRegions::Image(
            regions
                .iter()
                .map(|r| buffer_image_copy(r, format))
                .collect(),
        ),
        CopyCommand::ImageRead { format, region, .. } => {
            VkCopyRegions::Image(std::iter::once(buffer_image_copy(region, format)).collect())
        }
    }
}

impl From<vk::Result> for Error {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Error::BackendSubmission("device lost".into()),
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                Error::BackendSubmission("out of memory".into())
            }
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED => {
                Error::InvalidRequest("format not supported".into())
            }
            other => Error::BackendSubmission(format!("Vulkan error: {:?}", other)),
        }
    }
}
