//! Image transfer planning.
//!
//! Images are rarely linear in memory the way the device wants them. This
//! module decides how many scratch bytes an image write or read needs, where
//! every row lands inside the reservation, and re-packs rows between the
//! caller's layout and the device's.
//!
//! The layout class is picked once per transfer from the format and the
//! backend's row pitch requirement:
//!
//! | Class             | Device row pitch                    | Offsets           |
//! |-------------------|-------------------------------------|-------------------|
//! | `Linear`          | tightly packed                      | any texel         |
//! | `Tiled`           | packed, rounded up to the alignment | any texel         |
//! | `BlockCompressed` | whole blocks, tightly packed        | block boundaries  |

use crate::backend::ImageCopy;
use crate::error::{Error, Result};
use crate::format::{Extent3D, FormatProperties, Offset3D, Rect2D, TextureRange, TextureType};
use smallvec::SmallVec;

// ============================================================================
// Layout classes
// ============================================================================

/// How rows of an image transfer are laid out in scratch memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageLayoutClass {
    /// Rows tightly packed.
    Linear,
    /// Rows padded to a device row pitch alignment.
    Tiled {
        /// Row pitch alignment in bytes (> 1).
        row_pitch_alignment: u32,
    },
    /// Rows of whole compressed blocks.
    BlockCompressed,
}

impl ImageLayoutClass {
    /// Pick the layout class for `format` on a device requiring
    /// `row_pitch_alignment`.
    pub fn select(format: &FormatProperties, row_pitch_alignment: u32) -> Self {
        if format.is_block_compressed() {
            Self::BlockCompressed
        } else if row_pitch_alignment > 1 {
            Self::Tiled {
                row_pitch_alignment,
            }
        } else {
            Self::Linear
        }
    }

    /// Scratch row pitch for a row of `packed_row_bytes`.
    pub fn device_row_pitch(&self, packed_row_bytes: u64) -> u64 {
        match self {
            Self::Linear | Self::BlockCompressed => packed_row_bytes,
            Self::Tiled {
                row_pitch_alignment,
            } => {
                let alignment = *row_pitch_alignment as u64;
                packed_row_bytes.div_ceil(alignment) * alignment
            }
        }
    }

    /// Check that a box starts where this layout can address it.
    fn check_origin(&self, format: &FormatProperties, plane: u32, offset: Offset3D) -> Result<()> {
        if *self == Self::BlockCompressed
            && (offset.x % format.block_width != 0
                || offset.y % format.block_height != 0
                || offset.z % format.block_depth != 0)
        {
            return Err(Error::InvalidRequest(format!(
                "offset {:?} is not aligned to {}x{} blocks",
                offset, format.block_width, format.block_height
            )));
        }
        let p = format.plane(plane);
        if offset.x % p.subsample_x != 0 || offset.y % p.subsample_y != 0 {
            return Err(Error::InvalidRequest(format!(
                "offset {:?} splits a subsampled texel of plane {}",
                offset, plane
            )));
        }
        Ok(())
    }
}

/// Reject a scratch alignment that cannot hold whole blocks of `format`.
fn check_block_alignment(format: &FormatProperties, ring_alignment: u32) -> Result<()> {
    for plane in 0..format.plane_count() {
        let bytes = format.plane(plane).bytes_per_block;
        if bytes == 0 || ring_alignment % bytes != 0 {
            return Err(Error::InvalidRequest(format!(
                "staging alignment {} is not a multiple of the {}-byte block of plane {}",
                ring_alignment, bytes, plane
            )));
        }
    }
    Ok(())
}

fn align_up(value: u64, alignment: u32) -> u64 {
    value.div_ceil(alignment as u64) * alignment as u64
}

/// Bytes spanned by `rows` rows of `row_bytes` at `pitch`; the last row is
/// not padded.
fn span(rows: u64, pitch: u64, row_bytes: u64) -> u64 {
    match rows {
        0 => 0,
        n => (n - 1) * pitch + row_bytes,
    }
}

fn copy_rows(
    rows: u64,
    row_bytes: u64,
    (src, src_offset, src_pitch): (&[u8], u64, u64),
    (dst, dst_offset, dst_pitch): (&mut [u8], u64, u64),
    flip: bool,
) -> Result<()> {
    let len = row_bytes as usize;
    for row in 0..rows {
        let target_row = if flip { rows - 1 - row } else { row };
        let from = (src_offset + row * src_pitch) as usize;
        let to = (dst_offset + target_row * dst_pitch) as usize;
        let source = src
            .get(from..from + len)
            .ok_or_else(|| Error::InvalidRequest("source row out of bounds".into()))?;
        dst.get_mut(to..to + len)
            .ok_or_else(|| Error::InvalidRequest("destination row out of bounds".into()))?
            .copy_from_slice(source);
    }
    Ok(())
}

// ============================================================================
// Writes
// ============================================================================

/// One subresource plane of an image write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlannedCopy {
    /// Offset of the first row relative to the start of the reservation.
    pub scratch_offset: u64,
    /// Scratch row pitch.
    pub scratch_row_pitch: u64,
    /// Offset of the first row inside the caller's bytes.
    pub source_offset: u64,
    /// Row pitch inside the caller's bytes.
    pub source_row_pitch: u64,
    /// Bytes per block row.
    pub row_bytes: u64,
    /// Block rows per depth slice.
    pub rows_per_slice: u32,
    /// Block rows across all depth slices.
    pub rows: u64,
    /// Plane index.
    pub plane: u32,
    /// Absolute mip level.
    pub mip_level: u32,
    /// Absolute array slice.
    pub array_slice: u32,
    /// Texel offset at this mip level.
    pub offset: Offset3D,
    /// Texel extent at this mip level.
    pub extent: Extent3D,
}

impl PlannedCopy {
    /// Scratch bytes occupied by this copy.
    pub fn scratch_len(&self) -> u64 {
        self.rows * self.scratch_row_pitch
    }

    /// Device copy region for a reservation starting at `base`.
    pub fn image_copy(&self, base: u32) -> ImageCopy {
        ImageCopy {
            scratch_offset: base + self.scratch_offset as u32,
            row_pitch: self.scratch_row_pitch as u32,
            rows_per_slice: self.rows_per_slice,
            plane: self.plane,
            mip_level: self.mip_level,
            array_slice: self.array_slice,
            offset: self.offset,
            extent: self.extent,
        }
    }
}

/// Scratch layout of an image write.
#[derive(Clone, Debug)]
pub struct ImageWritePlan {
    /// Selected layout class.
    pub layout: ImageLayoutClass,
    /// Sub-copies in source order: level, then slice, then plane.
    pub copies: SmallVec<[PlannedCopy; 4]>,
    /// Scratch bytes to reserve.
    pub scratch_size: u64,
    /// Caller bytes the write consumes.
    pub source_size: u64,
}

impl ImageWritePlan {
    /// Lay out a write of `range`.
    ///
    /// `bytes_per_row` of 0 means the caller's rows are tightly packed. A
    /// larger pitch is accepted for single-level single-plane writes; it
    /// must cover a packed row.
    pub fn new(
        texture_type: TextureType,
        range: &TextureRange,
        format: &FormatProperties,
        bytes_per_row: u32,
        layout: ImageLayoutClass,
        ring_alignment: u32,
    ) -> Result<Self> {
        format.validate()?;
        let mut plan = Self {
            layout,
            copies: SmallVec::new(),
            scratch_size: 0,
            source_size: 0,
        };
        let extent = range.extent;
        if extent.width == 0
            || extent.height == 0
            || extent.depth == 0
            || range.num_layers == 0
            || range.num_mip_levels == 0
        {
            return Ok(plan);
        }
        check_block_alignment(format, ring_alignment)?;

        let is_volume = texture_type == TextureType::ThreeD;
        if !is_volume && (extent.depth != 1 || range.offset.z != 0) {
            return Err(Error::InvalidRequest(format!(
                "{:?} images have no depth (range {:?})",
                texture_type, range
            )));
        }
        if is_volume && (range.layer != 0 || range.num_layers != 1) {
            return Err(Error::InvalidRequest(
                "volume images have a single layer".into(),
            ));
        }
        if texture_type == TextureType::TwoD && (range.layer != 0 || range.num_layers != 1) {
            return Err(Error::InvalidRequest(
                "2D images have a single layer; use TwoDArray".into(),
            ));
        }

        let single = range.num_mip_levels == 1 && format.plane_count() == 1;
        let packed_base = format.bytes_per_row(0, extent.width);
        let custom_pitch = match bytes_per_row as u64 {
            0 => None,
            pitch if pitch < packed_base => {
                return Err(Error::InvalidRequest(format!(
                    "bytes_per_row {} is below the packed row size {}",
                    pitch, packed_base
                )));
            }
            pitch if pitch == packed_base => None,
            pitch if single => Some(pitch),
            pitch => {
                return Err(Error::InvalidRequest(format!(
                    "bytes_per_row {} must be 0 or {} for multi-level or multi-planar writes",
                    pitch, packed_base
                )));
            }
        };

        let faces = texture_type.faces_per_layer();
        let first_slice = range.layer * faces;
        let slice_count = range.num_layers * faces;

        for level in 0..range.num_mip_levels {
            let (offset, level_extent) = range.level_box(level);
            for slice in first_slice..first_slice + slice_count {
                for plane in 0..format.plane_count() {
                    layout.check_origin(format, plane, offset)?;

                    let row_bytes = format.bytes_per_row(plane, level_extent.width);
                    let rows_per_slice = format.blocks_y(plane, level_extent.height);
                    let rows = rows_per_slice as u64 * format.blocks_z(level_extent.depth) as u64;
                    let source_row_pitch = custom_pitch.unwrap_or(row_bytes);
                    let scratch_row_pitch = layout.device_row_pitch(row_bytes);
                    let scratch_offset = align_up(plan.scratch_size, ring_alignment);

                    let copy = PlannedCopy {
                        scratch_offset,
                        scratch_row_pitch,
                        source_offset: plan.source_size,
                        source_row_pitch,
                        row_bytes,
                        rows_per_slice,
                        rows,
                        plane,
                        mip_level: range.mip_level + level,
                        array_slice: if is_volume { 0 } else { slice },
                        offset,
                        extent: level_extent,
                    };
                    plan.scratch_size = scratch_offset + copy.scratch_len();
                    plan.source_size += span(rows, source_row_pitch, row_bytes);
                    plan.copies.push(copy);
                }
            }
        }
        Ok(plan)
    }

    /// Whether the write touches no texels.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    /// Copy rows from `source` into a reservation's bytes.
    pub fn pack(&self, source: &[u8], scratch: &mut [u8]) -> Result<()> {
        for copy in &self.copies {
            copy_rows(
                copy.rows,
                copy.row_bytes,
                (source, copy.source_offset, copy.source_row_pitch),
                (scratch, copy.scratch_offset, copy.scratch_row_pitch),
                false,
            )?;
        }
        Ok(())
    }

    /// Device copy regions for a reservation starting at `base`.
    pub fn image_copies(&self, base: u32) -> SmallVec<[ImageCopy; 4]> {
        self.copies.iter().map(|c| c.image_copy(base)).collect()
    }
}

// ============================================================================
// Reads
// ============================================================================

/// Scratch layout of an image readback.
#[derive(Clone, Copy, Debug)]
pub struct ImageReadPlan {
    /// Selected layout class.
    pub layout: ImageLayoutClass,
    /// The copy, with `scratch_offset` relative to the reservation.
    pub copy: PlannedCopy,
    /// Row pitch inside the caller's destination.
    pub destination_row_pitch: u64,
    /// Destination bytes the read fills.
    pub destination_size: u64,
    /// Reverse row order while unpacking.
    pub flip_vertical: bool,
}

impl ImageReadPlan {
    /// Lay out a readback of `rect` from one subresource.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        level: u32,
        layer: u32,
        rect: Rect2D,
        format: &FormatProperties,
        bytes_per_row: u32,
        flip_vertical: bool,
        layout: ImageLayoutClass,
        ring_alignment: u32,
    ) -> Result<Self> {
        format.validate()?;
        if format.is_multi_planar() {
            return Err(Error::InvalidRequest(
                "readback of multi-planar formats is not supported".into(),
            ));
        }
        if flip_vertical && layout == ImageLayoutClass::BlockCompressed {
            return Err(Error::InvalidRequest(
                "vertical flip of block-compressed rows is not supported".into(),
            ));
        }
        check_block_alignment(format, ring_alignment)?;

        let offset = Offset3D {
            x: rect.x,
            y: rect.y,
            z: 0,
        };
        layout.check_origin(format, 0, offset)?;

        let row_bytes = format.bytes_per_row(0, rect.width);
        let rows_per_slice = format.blocks_y(0, rect.height);
        let destination_row_pitch = match bytes_per_row as u64 {
            0 => row_bytes,
            pitch if pitch < row_bytes => {
                return Err(Error::InvalidRequest(format!(
                    "bytes_per_row {} is below the packed row size {}",
                    pitch, row_bytes
                )));
            }
            pitch => pitch,
        };
        let rows = if rect.width == 0 { 0 } else { rows_per_slice as u64 };

        Ok(Self {
            layout,
            copy: PlannedCopy {
                scratch_offset: 0,
                scratch_row_pitch: layout.device_row_pitch(row_bytes),
                source_offset: 0,
                source_row_pitch: destination_row_pitch,
                row_bytes,
                rows_per_slice,
                rows,
                plane: 0,
                mip_level: level,
                array_slice: layer,
                offset,
                extent: Extent3D::new(rect.width, rect.height, 1),
            },
            destination_row_pitch,
            destination_size: span(rows, destination_row_pitch, row_bytes),
            flip_vertical,
        })
    }

    /// Whether the read touches no texels.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.copy.rows == 0
    }

    /// Scratch bytes to reserve.
    #[inline]
    pub fn scratch_size(&self) -> u64 {
        self.copy.scratch_len()
    }

    /// Copy rows from a reservation's bytes into `destination`.
    pub fn unpack(&self, scratch: &[u8], destination: &mut [u8]) -> Result<()> {
        copy_rows(
            self.copy.rows,
            self.copy.row_bytes,
            (scratch, 0, self.copy.scratch_row_pitch),
            (destination, 0, self.destination_row_pitch),
            self.flip_vertical,
        )
    }
}
