use crate::error::{VmaError, VmaResult};
use crate::utils::{GTT_PAGE_SIZE, align_up, range_overflows};
use std::collections::BTreeMap;

/// An allocated span of a managed range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub start: u64,
    pub size: u64,
    pub color: u64,
}

impl Node {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.size
    }

    #[must_use]
    pub const fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end()
    }
}

/// A free span between two nodes, with the colours of its neighbours.
#[derive(Debug, Clone, Copy)]
struct Hole {
    start: u64,
    end: u64,
    prev_color: Option<u64>,
    next_color: Option<u64>,
}

/// Manages a range of address space, tracking allocated nodes by start
/// address.
///
/// With colouring enabled, a node whose neighbour has a different colour is
/// kept one page away from it, so that the neighbour's prefetch never crosses
/// into memory of incompatible cacheability.
#[derive(Debug)]
pub struct RangeManager {
    base: u64,
    limit: u64,
    color_adjust: bool,

    // Tracks occupied ranges: start address -> node
    nodes: BTreeMap<u64, Node>,
    allocated: u64,
}

impl RangeManager {
    #[must_use]
    pub fn new(base: u64, limit: u64) -> Self {
        Self {
            base,
            limit,
            color_adjust: false,
            nodes: BTreeMap::new(),
            allocated: 0,
        }
    }

    #[must_use]
    pub fn with_color_adjust(mut self, enabled: bool) -> Self {
        self.color_adjust = enabled;
        self
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.base
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.limit
    }

    #[must_use]
    pub fn color_adjust(&self) -> bool {
        self.color_adjust
    }

    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn get(&self, start: u64) -> Option<&Node> {
        self.nodes.get(&start)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Nodes intersecting `[start, end)`, in address order.
    pub fn overlapping(&self, start: u64, end: u64) -> impl Iterator<Item = &Node> {
        let first = self
            .nodes
            .range(..start)
            .next_back()
            .filter(|(_, n)| n.end() > start)
            .map_or(start, |(&s, _)| s);
        self.nodes.range(first..end).map(|(_, n)| n)
    }

    /// Places a node at exactly `offset`.
    ///
    /// # Errors
    /// `NoSpace` if the span is outside the range or occupied, `Conflict` if
    /// it is free but sits against a neighbour of a different colour.
    pub fn reserve_fixed(&mut self, size: u64, offset: u64, color: u64) -> VmaResult<Node> {
        if size == 0
            || offset < self.base
            || range_overflows(offset, size, self.limit)
        {
            return Err(VmaError::NoSpace);
        }

        let hole = self.hole_at(offset).ok_or(VmaError::NoSpace)?;
        if offset + size > hole.end {
            return Err(VmaError::NoSpace);
        }

        let (adj_start, adj_end) = self.adjust(&hole, color);
        if offset < adj_start || offset + size > adj_end {
            return Err(VmaError::Conflict { offset });
        }

        Ok(self.insert(Node {
            start: offset,
            size,
            color,
        }))
    }

    /// Places a node in the smallest hole of `[range_start, range_end)` that
    /// fits it at `alignment`.
    ///
    /// # Errors
    /// `NoSpace` if nothing fits. Requests larger than the window fail
    /// without scanning.
    pub fn insert_best_fit(
        &mut self,
        size: u64,
        alignment: u64,
        color: u64,
        range_start: u64,
        range_end: u64,
    ) -> VmaResult<Node> {
        let range_start = range_start.max(self.base);
        let range_end = range_end.min(self.limit);
        if size == 0 || range_end <= range_start || size > range_end - range_start {
            return Err(VmaError::NoSpace);
        }
        let alignment = alignment.max(1);

        let mut best: Option<(u64, u64)> = None; // (hole size, start)
        for hole in self.holes() {
            if hole.end <= range_start || hole.start >= range_end {
                continue;
            }
            let (adj_start, adj_end) = self.adjust(&hole, color);
            let lo = adj_start.max(range_start);
            let hi = adj_end.min(range_end);
            if hi <= lo {
                continue;
            }

            let start = if alignment.is_power_of_two() {
                align_up(lo, alignment)
            } else {
                lo.div_ceil(alignment) * alignment
            };
            if start >= hi || hi - start < size {
                continue;
            }

            let hole_size = hole.end - hole.start;
            if best.is_none_or(|(best_size, _)| hole_size < best_size) {
                best = Some((hole_size, start));
            }
        }

        let (_, start) = best.ok_or(VmaError::NoSpace)?;
        Ok(self.insert(Node { start, size, color }))
    }

    /// Releases the node starting at `start`.
    pub fn remove(&mut self, start: u64) -> Option<Node> {
        let node = self.nodes.remove(&start)?;
        self.allocated -= node.size;
        Some(node)
    }

    fn insert(&mut self, node: Node) -> Node {
        debug_assert!(
            self.overlapping(node.start, node.end()).next().is_none(),
            "overlapping node at 0x{:x}",
            node.start
        );
        self.nodes.insert(node.start, node);
        self.allocated += node.size;
        debug_assert!(self.valid_space(&node), "colour violation at 0x{:x}", node.start);
        node
    }

    /// Neighbours of a different colour must be separated by a hole.
    fn valid_space(&self, node: &Node) -> bool {
        if !self.color_adjust {
            return true;
        }
        let prev = self.nodes.range(..node.start).next_back().map(|(_, n)| n);
        let next = self.nodes.range(node.end()..).next().map(|(_, n)| n);

        prev.is_none_or(|p| p.color == node.color || p.end() < node.start)
            && next.is_none_or(|n| n.color == node.color || node.end() < n.start)
    }

    fn adjust(&self, hole: &Hole, color: u64) -> (u64, u64) {
        let mut start = hole.start;
        let mut end = hole.end;
        if self.color_adjust {
            if hole.prev_color.is_some_and(|c| c != color) {
                start = start.saturating_add(GTT_PAGE_SIZE);
            }
            if hole.next_color.is_some_and(|c| c != color) {
                end = end.saturating_sub(GTT_PAGE_SIZE);
            }
        }
        (start, end)
    }

    /// The hole containing `addr`, if `addr` is free.
    fn hole_at(&self, addr: u64) -> Option<Hole> {
        let prev = self.nodes.range(..=addr).next_back().map(|(_, n)| *n);
        if prev.is_some_and(|p| p.end() > addr) {
            return None;
        }
        let next = self.nodes.range(addr..).next().map(|(_, n)| *n);
        Some(Hole {
            start: prev.map_or(self.base, |p| p.end()),
            end: next.map_or(self.limit, |n| n.start),
            prev_color: prev.map(|p| p.color),
            next_color: next.map(|n| n.color),
        })
    }

    fn holes(&self) -> Vec<Hole> {
        let mut holes = Vec::with_capacity(self.nodes.len() + 1);
        let mut cursor = self.base;
        let mut prev_color = None;

        for node in self.nodes.values() {
            if node.start > cursor {
                holes.push(Hole {
                    start: cursor,
                    end: node.start,
                    prev_color,
                    next_color: Some(node.color),
                });
            }
            cursor = node.end();
            prev_color = Some(node.color);
        }

        if self.limit > cursor {
            holes.push(Hole {
                start: cursor,
                end: self.limit,
                prev_color,
                next_color: None,
            });
        }
        holes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = GTT_PAGE_SIZE;

    #[test]
    fn test_fixed_rejects_occupied() {
        let mut mm = RangeManager::new(0, 1 << 20);
        mm.reserve_fixed(2 * PAGE, PAGE, 0).unwrap();
        assert_eq!(mm.reserve_fixed(PAGE, 2 * PAGE, 0), Err(VmaError::NoSpace));
        assert_eq!(mm.reserve_fixed(2 * PAGE, 0, 0), Err(VmaError::NoSpace));
        assert!(mm.reserve_fixed(PAGE, 0, 0).is_ok());
        assert!(mm.reserve_fixed(PAGE, 3 * PAGE, 0).is_ok());
        assert_eq!(mm.allocated_bytes(), 4 * PAGE);
    }

    #[test]
    fn test_fixed_colour_conflict() {
        let mut mm = RangeManager::new(0, 1 << 32).with_color_adjust(true);
        mm.reserve_fixed(PAGE, 0, 1).unwrap();
        assert_eq!(
            mm.reserve_fixed(PAGE, PAGE, 2),
            Err(VmaError::Conflict { offset: PAGE })
        );
        // Same colour may touch.
        assert!(mm.reserve_fixed(PAGE, PAGE, 1).is_ok());
        assert!(mm.reserve_fixed(PAGE, 3 * PAGE, 2).is_ok());
    }

    #[test]
    fn test_best_fit_prefers_smallest_hole() {
        let mut mm = RangeManager::new(0, 64 * PAGE);
        mm.reserve_fixed(PAGE, 4 * PAGE, 0).unwrap();
        mm.reserve_fixed(PAGE, 7 * PAGE, 0).unwrap();
        // Holes: [0,4) [5,7) [8,64) in pages.
        let node = mm.insert_best_fit(2 * PAGE, PAGE, 0, 0, 64 * PAGE).unwrap();
        assert_eq!(node.start, 5 * PAGE);
    }

    #[test]
    fn test_best_fit_alignment_and_window() {
        let mut mm = RangeManager::new(0, 64 * PAGE);
        mm.reserve_fixed(PAGE, 0, 0).unwrap();
        let node = mm
            .insert_best_fit(PAGE, 16 * PAGE, 0, 0, 64 * PAGE)
            .unwrap();
        assert_eq!(node.start, 16 * PAGE);

        assert_eq!(
            mm.insert_best_fit(8 * PAGE, PAGE, 0, 0, 4 * PAGE),
            Err(VmaError::NoSpace)
        );
    }

    #[test]
    fn test_best_fit_keeps_colour_gap() {
        let mut mm = RangeManager::new(0, 8 * PAGE).with_color_adjust(true);
        mm.reserve_fixed(PAGE, 0, 1).unwrap();
        let node = mm.insert_best_fit(PAGE, PAGE, 2, 0, 8 * PAGE).unwrap();
        assert_eq!(node.start, 2 * PAGE);
    }

    #[test]
    fn test_remove_and_overlapping() {
        let mut mm = RangeManager::new(0, 16 * PAGE);
        mm.reserve_fixed(2 * PAGE, 2 * PAGE, 0).unwrap();
        mm.reserve_fixed(PAGE, 8 * PAGE, 0).unwrap();
        let hits: Vec<u64> = mm.overlapping(3 * PAGE, 9 * PAGE).map(|n| n.start).collect();
        assert_eq!(hits, vec![2 * PAGE, 8 * PAGE]);

        assert!(mm.remove(2 * PAGE).is_some());
        assert!(mm.remove(2 * PAGE).is_none());
        assert_eq!(mm.allocated_bytes(), PAGE);
    }
}
