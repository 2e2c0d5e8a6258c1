//! Texture format and addressing types for image transfers.
//!
//! These types describe *what* an image copy touches: which format the texels
//! are stored in, which mip levels and layers are addressed, and how large the
//! addressed box is. Sizes are always computed in whole blocks, so a 5x5
//! region of a 4x4 block-compressed format occupies 2x2 blocks.
//!
//! # Design Principles
//!
//! - **Whole blocks**: partial trailing blocks round up, never down
//! - **Small, Copy types**: ranges and properties are passed by value
//! - **Explicit planes**: multi-planar formats describe every plane

use crate::error::{Error, Result};

// ============================================================================
// Texture addressing
// ============================================================================

/// Dimensionality of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum TextureType {
    /// Single 2D image.
    #[default]
    TwoD,
    /// Array of 2D images.
    TwoDArray,
    /// Volume image; `depth` slices per level.
    ThreeD,
    /// Cube map; six faces per layer.
    Cube,
}

impl TextureType {
    /// Number of array slices one logical layer expands to.
    #[inline]
    pub fn faces_per_layer(&self) -> u32 {
        match self {
            Self::Cube => 6,
            _ => 1,
        }
    }
}

/// Texel offset inside an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Offset3D {
    /// X offset in texels.
    pub x: u32,
    /// Y offset in texels.
    pub y: u32,
    /// Z offset in texels (volume images only).
    pub z: u32,
}

/// Texel extent of an image region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Extent3D {
    /// Width in texels.
    pub width: u32,
    /// Height in texels.
    pub height: u32,
    /// Depth in texels.
    pub depth: u32,
}

impl Extent3D {
    /// Create an extent.
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Extent of mip level `level` derived from this base extent.
    ///
    /// Each dimension halves per level and never drops below 1.
    pub fn at_mip_level(&self, level: u32) -> Self {
        let shrink = |v: u32| v.checked_shr(level).unwrap_or(0).max(1);
        Self {
            width: shrink(self.width),
            height: shrink(self.height),
            depth: shrink(self.depth),
        }
    }
}

/// A 2D rectangle used by readbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rect2D {
    /// Left edge in texels.
    pub x: u32,
    /// Top edge in texels.
    pub y: u32,
    /// Width in texels.
    pub width: u32,
    /// Height in texels.
    pub height: u32,
}

impl Rect2D {
    /// Create a rectangle.
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// The subresource box addressed by an image write.
///
/// `x/y/z` and `width/height/depth` describe the box at `mip_level`; deeper
/// levels (when `num_mip_levels > 1`) use the halved extent and offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureRange {
    /// Texel offset at the first addressed level.
    pub offset: Offset3D,
    /// Texel extent at the first addressed level.
    pub extent: Extent3D,
    /// First array layer.
    pub layer: u32,
    /// Number of array layers (cube maps count layers, not faces).
    pub num_layers: u32,
    /// First mip level.
    pub mip_level: u32,
    /// Number of mip levels.
    pub num_mip_levels: u32,
}

impl TextureRange {
    /// A single-level, single-layer 2D box.
    pub const fn new_2d(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            offset: Offset3D { x, y, z: 0 },
            extent: Extent3D::new(width, height, 1),
            layer: 0,
            num_layers: 1,
            mip_level: 0,
            num_mip_levels: 1,
        }
    }

    /// A single-level volume box.
    pub const fn new_3d(x: u32, y: u32, z: u32, width: u32, height: u32, depth: u32) -> Self {
        Self {
            offset: Offset3D { x, y, z },
            extent: Extent3D::new(width, height, depth),
            layer: 0,
            num_layers: 1,
            mip_level: 0,
            num_mip_levels: 1,
        }
    }

    /// Address `count` layers starting at `first`.
    pub const fn with_layers(mut self, first: u32, count: u32) -> Self {
        self.layer = first;
        self.num_layers = count;
        self
    }

    /// Address `count` mip levels starting at `first`.
    pub const fn with_mip_levels(mut self, first: u32, count: u32) -> Self {
        self.mip_level = first;
        self.num_mip_levels = count;
        self
    }

    /// Box for the `index`-th addressed level (0 = `mip_level`).
    pub fn level_box(&self, index: u32) -> (Offset3D, Extent3D) {
        let extent = self.extent.at_mip_level(index);
        let shift = |v: u32| v.checked_shr(index).unwrap_or(0);
        let offset = Offset3D {
            x: shift(self.offset.x),
            y: shift(self.offset.y),
            z: shift(self.offset.z),
        };
        (offset, extent)
    }
}

// ============================================================================
// Formats
// ============================================================================

/// Plane arrangement of a format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum PlaneLayout {
    /// All channels interleaved in one plane.
    #[default]
    Single,
    /// Full-resolution luma plane plus interleaved 2x2-subsampled chroma (NV12).
    TwoPlane420,
    /// Full-resolution luma plus two 2x2-subsampled chroma planes (I420).
    ThreePlane420,
}

/// Storage description of one plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PlaneProperties {
    /// Bytes per texel block of this plane.
    pub bytes_per_block: u32,
    /// Horizontal subsampling factor relative to the image width.
    pub subsample_x: u32,
    /// Vertical subsampling factor relative to the image height.
    pub subsample_y: u32,
}

/// Block geometry and plane layout of a texture format.
///
/// Uncompressed formats use 1x1x1 blocks whose size is the texel size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FormatProperties {
    /// Block width in texels.
    pub block_width: u32,
    /// Block height in texels.
    pub block_height: u32,
    /// Block depth in texels.
    pub block_depth: u32,
    /// Bytes per block of the first plane.
    pub bytes_per_block: u32,
    /// Whether blocks are compressed (BC, ETC, ASTC).
    pub compressed: bool,
    /// Plane arrangement.
    pub planes: PlaneLayout,
}

impl FormatProperties {
    /// Properties of an uncompressed single-plane format.
    pub const fn uncompressed(bytes_per_texel: u32) -> Self {
        Self {
            block_width: 1,
            block_height: 1,
            block_depth: 1,
            bytes_per_block: bytes_per_texel,
            compressed: false,
            planes: PlaneLayout::Single,
        }
    }

    /// Properties of a block-compressed 2D format.
    pub const fn compressed(block_width: u32, block_height: u32, bytes_per_block: u32) -> Self {
        Self {
            block_width,
            block_height,
            block_depth: 1,
            bytes_per_block,
            compressed: true,
            planes: PlaneLayout::Single,
        }
    }

    /// Properties of a multi-planar 8-bit YUV format.
    pub const fn planar(planes: PlaneLayout) -> Self {
        Self {
            block_width: 1,
            block_height: 1,
            block_depth: 1,
            bytes_per_block: 1,
            compressed: false,
            planes,
        }
    }

    /// Check that blocks have a size.
    ///
    /// The sizing helpers divide by the block dimensions, so every staging
    /// entry point runs this before touching them.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] if a block dimension or the block byte size
    /// is 0.
    pub fn validate(&self) -> Result<()> {
        if self.block_width == 0 || self.block_height == 0 || self.block_depth == 0 {
            return Err(Error::InvalidRequest(format!(
                "format block {}x{}x{} has a zero dimension",
                self.block_width, self.block_height, self.block_depth
            )));
        }
        if self.bytes_per_block == 0 {
            return Err(Error::InvalidRequest("format block has 0 bytes".into()));
        }
        Ok(())
    }

    /// Whether texels are stored in multi-texel compressed blocks.
    #[inline]
    pub fn is_block_compressed(&self) -> bool {
        self.compressed || self.block_width > 1 || self.block_height > 1 || self.block_depth > 1
    }

    /// Number of planes.
    pub fn plane_count(&self) -> u32 {
        match self.planes {
            PlaneLayout::Single => 1,
            PlaneLayout::TwoPlane420 => 2,
            PlaneLayout::ThreePlane420 => 3,
        }
    }

    /// Whether the format has more than one plane.
    #[inline]
    pub fn is_multi_planar(&self) -> bool {
        self.plane_count() > 1
    }

    /// Storage description of plane `index`.
    pub fn plane(&self, index: u32) -> PlaneProperties {
        let full = PlaneProperties {
            bytes_per_block: self.bytes_per_block,
            subsample_x: 1,
            subsample_y: 1,
        };
        match (self.planes, index) {
            (_, 0) | (PlaneLayout::Single, _) => full,
            (PlaneLayout::TwoPlane420, _) => PlaneProperties {
                bytes_per_block: self.bytes_per_block * 2,
                subsample_x: 2,
                subsample_y: 2,
            },
            (PlaneLayout::ThreePlane420, _) => PlaneProperties {
                bytes_per_block: self.bytes_per_block,
                subsample_x: 2,
                subsample_y: 2,
            },
        }
    }

    /// Blocks needed to cover `width` texels of plane `plane`.
    pub fn blocks_x(&self, plane: u32, width: u32) -> u32 {
        let p = self.plane(plane);
        width.div_ceil(p.subsample_x).div_ceil(self.block_width)
    }

    /// Block rows needed to cover `height` texels of plane `plane`.
    pub fn blocks_y(&self, plane: u32, height: u32) -> u32 {
        let p = self.plane(plane);
        height.div_ceil(p.subsample_y).div_ceil(self.block_height)
    }

    /// Block slices needed to cover `depth` texels.
    pub fn blocks_z(&self, depth: u32) -> u32 {
        depth.div_ceil(self.block_depth)
    }

    /// Tightly packed bytes for one block row of `width` texels.
    pub fn bytes_per_row(&self, plane: u32, width: u32) -> u64 {
        self.blocks_x(plane, width) as u64 * self.plane(plane).bytes_per_block as u64
    }

    /// Tightly packed bytes for a `width` x `height` x `depth` box of one plane.
    pub fn bytes_per_plane(&self, plane: u32, extent: Extent3D) -> u64 {
        self.bytes_per_row(plane, extent.width)
            * self.blocks_y(plane, extent.height) as u64
            * self.blocks_z(extent.depth) as u64
    }

    /// Tightly packed bytes for a box across all planes.
    pub fn bytes_per_box(&self, extent: Extent3D) -> u64 {
        (0..self.plane_count())
            .map(|plane| self.bytes_per_plane(plane, extent))
            .sum()
    }

    /// Tightly packed bytes for a whole texture range.
    pub fn bytes_per_range(&self, texture_type: TextureType, range: &TextureRange) -> u64 {
        let slices = range.num_layers as u64 * texture_type.faces_per_layer() as u64;
        (0..range.num_mip_levels)
            .map(|level| self.bytes_per_box(range.level_box(level).1) * slices)
            .sum()
    }
}

/// Texture formats the staging paths know how to size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum TextureFormat {
    /// 8-bit single channel.
    R8Unorm,
    /// 8-bit two channel.
    Rg8Unorm,
    /// 8-bit RGBA.
    #[default]
    Rgba8Unorm,
    /// 8-bit BGRA.
    Bgra8Unorm,
    /// 16-bit float RGBA.
    Rgba16Float,
    /// 32-bit float RGBA.
    Rgba32Float,
    /// BC1 (DXT1), 4x4 blocks of 8 bytes.
    Bc1RgbaUnorm,
    /// BC3 (DXT5), 4x4 blocks of 16 bytes.
    Bc3RgbaUnorm,
    /// BC7, 4x4 blocks of 16 bytes.
    Bc7RgbaUnorm,
    /// ETC2 RGB, 4x4 blocks of 8 bytes.
    Etc2Rgb8Unorm,
    /// ASTC 8x8, blocks of 16 bytes.
    Astc8x8Unorm,
    /// YUV 4:2:0 semi-planar (Y plane, then interleaved UV plane).
    Nv12,
    /// YUV 4:2:0 planar (Y plane, then U plane, then V plane).
    I420,
}

impl TextureFormat {
    /// Block geometry of this format.
    pub fn properties(&self) -> FormatProperties {
        match self {
            Self::R8Unorm => FormatProperties::uncompressed(1),
            Self::Rg8Unorm => FormatProperties::uncompressed(2),
            Self::Rgba8Unorm | Self::Bgra8Unorm => FormatProperties::uncompressed(4),
            Self::Rgba16Float => FormatProperties::uncompressed(8),
            Self::Rgba32Float => FormatProperties::uncompressed(16),
            Self::Bc1RgbaUnorm | Self::Etc2Rgb8Unorm => FormatProperties::compressed(4, 4, 8),
            Self::Bc3RgbaUnorm | Self::Bc7RgbaUnorm => FormatProperties::compressed(4, 4, 16),
            Self::Astc8x8Unorm => FormatProperties::compressed(8, 8, 16),
            Self::Nv12 => FormatProperties::planar(PlaneLayout::TwoPlane420),
            Self::I420 => FormatProperties::planar(PlaneLayout::ThreePlane420),
        }
    }
}
