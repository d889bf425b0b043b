/// Smallest granule the GTT maps.
pub const GTT_PAGE_SIZE: u64 = 4096;
pub const GTT_PAGE_SHIFT: u32 = 12;
pub const GTT_MIN_ALIGNMENT: u64 = GTT_PAGE_SIZE;

#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    if align <= 1 {
        return val;
    }
    (val + align - 1) & !(align - 1)
}

#[must_use]
pub const fn align_down(val: u64, align: u64) -> u64 {
    if align <= 1 {
        return val;
    }
    val & !(align - 1)
}

#[must_use]
pub const fn is_aligned(val: u64, align: u64) -> bool {
    align <= 1 || val & (align - 1) == 0
}

/// True if `[start, start + size)` does not fit below `max`, including on overflow.
#[must_use]
pub const fn range_overflows(start: u64, size: u64, max: u64) -> bool {
    match start.checked_add(size) {
        Some(end) => start >= max || end > max,
        None => true,
    }
}

#[must_use]
pub const fn ranges_overlap(a_start: u64, a_end: u64, b_start: u64, b_end: u64) -> bool {
    a_start < b_end && b_start < a_end
}

#[must_use]
pub const fn pages_to_bytes(pages: u64) -> u64 {
    pages << GTT_PAGE_SHIFT
}

#[must_use]
pub const fn bytes_to_pages(bytes: u64) -> u64 {
    bytes >> GTT_PAGE_SHIFT
}
