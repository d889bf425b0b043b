//! Alternative page layouts of an object inside the global address space.
//!
//! All dimensions are in pages. Rotated views walk each column bottom-up,
//! remapped views walk rows; both pad every column (row) out to `dst_stride`
//! with scratch entries.

use crate::error::{VmaError, VmaResult};
use crate::mem::SgTable;
use crate::utils::{GTT_PAGE_SIZE, align_up};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PlaneInfo {
    pub offset: u32,
    pub width: u32,
    pub height: u32,
    pub src_stride: u32,
    pub dst_stride: u32,
}

impl PlaneInfo {
    /// A plane whose destination stride matches its source layout.
    #[must_use]
    pub const fn new(offset: u32, width: u32, height: u32, src_stride: u32) -> Self {
        Self {
            offset,
            width,
            height,
            src_stride,
            dst_stride: 0,
        }
    }

    #[must_use]
    pub const fn dst_stride(mut self, stride: u32) -> Self {
        self.dst_stride = stride;
        self
    }

    const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    fn last_page(&self) -> Option<u64> {
        u64::from(self.height - 1)
            .checked_mul(u64::from(self.src_stride))?
            .checked_add(u64::from(self.offset))?
            .checked_add(u64::from(self.width - 1))
    }
}

/// Rounds `pages` up to a multiple of `alignment`; 0 leaves it packed.
fn align_pages(pages: u64, alignment: u32) -> Option<u64> {
    match alignment {
        0 => Some(pages),
        a => pages.checked_next_multiple_of(u64::from(a)),
    }
}

/// How an object's pages are laid out in a VMA. The derived ordering is the
/// registry's strict weak ordering over view contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum View {
    #[default]
    Normal,
    /// A window of `size` pages starting at page `offset`.
    Partial { offset: u64, size: u64 },
    Rotated { planes: [PlaneInfo; 2] },
    Remapped {
        planes: [PlaneInfo; 2],
        /// Each plane starts on a multiple of this many pages (0 = packed).
        plane_alignment: u32,
    },
}

impl View {
    #[must_use]
    pub const fn is_normal(&self) -> bool {
        matches!(self, Self::Normal)
    }

    fn planes(&self) -> &[PlaneInfo] {
        match self {
            Self::Rotated { planes } | Self::Remapped { planes, .. } => planes,
            Self::Normal | Self::Partial { .. } => &[],
        }
    }

    /// Checks the view against an object of `obj_pages` pages.
    ///
    /// # Errors
    /// `InvalidArgument` if the view reaches outside the object, its
    /// strides cannot hold a plane, or its plane alignment is not a power
    /// of two.
    pub fn validate(&self, obj_pages: u64) -> VmaResult<()> {
        if let Self::Partial { offset, size } = *self {
            if size == 0 || offset.checked_add(size).is_none_or(|end| end > obj_pages) {
                return Err(VmaError::InvalidArgument(format!(
                    "partial view {offset}+{size} outside object of {obj_pages} pages"
                )));
            }
            return Ok(());
        }

        if let Self::Remapped { plane_alignment, .. } = *self {
            if plane_alignment != 0 && !plane_alignment.is_power_of_two() {
                return Err(VmaError::InvalidArgument(format!(
                    "plane alignment {plane_alignment} is not a power of two"
                )));
            }
        }

        let rotated = matches!(self, Self::Rotated { .. });
        for plane in self.planes().iter().filter(|p| !p.is_empty()) {
            let needed = if rotated { plane.height } else { plane.width };
            if plane.src_stride < plane.width || plane.dst_stride < needed {
                return Err(VmaError::InvalidArgument(format!(
                    "plane strides too small: {plane:?}"
                )));
            }
            if plane.last_page().is_none_or(|last| last >= obj_pages) {
                return Err(VmaError::InvalidArgument(format!(
                    "plane outside object of {obj_pages} pages: {plane:?}"
                )));
            }
        }
        Ok(())
    }

    /// Number of pages the view maps, padding included, or `None` if that
    /// does not fit in a `u64`.
    #[must_use]
    pub fn size_pages(&self, obj_pages: u64) -> Option<u64> {
        match *self {
            Self::Normal => Some(obj_pages),
            Self::Partial { size, .. } => Some(size),
            Self::Rotated { planes } => {
                planes.iter().filter(|p| !p.is_empty()).try_fold(0u64, |size, p| {
                    u64::from(p.dst_stride)
                        .checked_mul(u64::from(p.width))?
                        .checked_add(size)
                })
            }
            Self::Remapped {
                planes,
                plane_alignment,
            } => planes.iter().filter(|p| !p.is_empty()).try_fold(0u64, |size, p| {
                u64::from(p.dst_stride)
                    .checked_mul(u64::from(p.height))?
                    .checked_add(align_pages(size, plane_alignment)?)
            }),
        }
    }

    /// Page list of the view over the object's pages.
    #[must_use]
    pub fn build_pages(&self, obj: &Arc<SgTable>) -> Arc<SgTable> {
        match *self {
            Self::Normal => obj.clone(),
            Self::Partial { offset, size } => Arc::new(obj.slice_pages(offset, size)),
            Self::Rotated { planes } => {
                let mut sg = SgTable::new();
                for plane in planes.iter().filter(|p| !p.is_empty()) {
                    rotate_pages(obj, plane, &mut sg);
                }
                sg.trim();
                Arc::new(sg)
            }
            Self::Remapped {
                planes,
                plane_alignment,
            } => {
                let mut sg = SgTable::new();
                for plane in planes.iter().filter(|p| !p.is_empty()) {
                    let pad = align_up(sg.num_pages(), u64::from(plane_alignment)) - sg.num_pages();
                    if pad > 0 {
                        sg.push_padding(pad * GTT_PAGE_SIZE);
                    }
                    remap_pages(obj, plane, &mut sg);
                }
                sg.trim();
                Arc::new(sg)
            }
        }
    }
}

fn push_page(obj: &SgTable, index: u64, sg: &mut SgTable) {
    sg.push(obj.page_dma(index).unwrap_or(0), GTT_PAGE_SIZE);
}

fn rotate_pages(obj: &SgTable, plane: &PlaneInfo, sg: &mut SgTable) {
    let stride = u64::from(plane.src_stride);
    let height = u64::from(plane.height);
    for column in 0..u64::from(plane.width) {
        let mut index = stride * (height - 1) + column + u64::from(plane.offset);
        for _ in 0..height {
            push_page(obj, index, sg);
            index = index.wrapping_sub(stride);
        }
        let left = u64::from(plane.dst_stride) - height;
        if left > 0 {
            sg.push_padding(left * GTT_PAGE_SIZE);
        }
    }
}

fn remap_pages(obj: &SgTable, plane: &PlaneInfo, sg: &mut SgTable) {
    let width = u64::from(plane.width);
    for row in 0..u64::from(plane.height) {
        let first = u64::from(plane.offset) + row * u64::from(plane.src_stride);
        for column in 0..width {
            push_page(obj, first + column, sg);
        }
        let left = u64::from(plane.dst_stride) - width;
        if left > 0 {
            sg.push_padding(left * GTT_PAGE_SIZE);
        }
    }
}
