use gem_vma::gtt::range::{Node, RangeManager};
use gem_vma::utils::GTT_PAGE_SIZE;
use gem_vma::{Device, DeviceConfig, VmDesc, VmaError};
use proptest::prelude::*;

const PAGE: u64 = GTT_PAGE_SIZE;

#[test]
fn test_adjacent_colours_need_a_hole() {
    let dev = Device::new(DeviceConfig::new().accel(false)).unwrap();
    let vm = dev.create_vm(VmDesc::new(1 << 32).coloring(true));
    let mut guard = vm.lock();

    guard.reserve_fixed(PAGE, 0, 1).unwrap();
    assert_eq!(
        guard.reserve_fixed(PAGE, PAGE, 2),
        Err(VmaError::Conflict { offset: PAGE })
    );

    let node = guard.reserve_fixed(PAGE, 2 * PAGE, 2).unwrap();
    assert_eq!(node.start, 2 * PAGE);
    assert_eq!(guard.nodes().len(), 2);
}

#[test]
fn test_uncoloured_space_packs_tightly() {
    let dev = Device::new(DeviceConfig::new().accel(false)).unwrap();
    let vm = dev.create_vm(VmDesc::new(1 << 32));
    let mut guard = vm.lock();

    guard.reserve_fixed(PAGE, 0, 1).unwrap();
    guard.reserve_fixed(PAGE, PAGE, 2).unwrap();
    assert_eq!(guard.allocated_bytes(), 2 * PAGE);
}

#[test]
fn test_ggtt_colours_without_llc() {
    let dev = Device::new(DeviceConfig::new().llc(false).accel(false)).unwrap();
    assert!(dev.ggtt().has_cache_coloring());
    let dev = Device::new(DeviceConfig::new().accel(false)).unwrap();
    assert!(!dev.ggtt().has_cache_coloring());
}

#[derive(Debug, Clone)]
enum Op {
    Fixed { page: u64, pages: u64, color: u64 },
    BestFit { pages: u64, align_shift: u32, color: u64 },
    Remove { pick: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..60u64, 1..5u64, 0..3u64).prop_map(|(page, pages, color)| Op::Fixed {
            page,
            pages,
            color
        }),
        (1..9u64, 0..4u32, 0..3u64).prop_map(|(pages, align_shift, color)| Op::BestFit {
            pages,
            align_shift,
            color
        }),
        any::<usize>().prop_map(|pick| Op::Remove { pick }),
    ]
}

fn check_layout(nodes: &[Node], coloured: bool) -> Result<(), TestCaseError> {
    for pair in nodes.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        prop_assert!(a.end() <= b.start, "{a:?} overlaps {b:?}");
        if coloured && a.color != b.color {
            prop_assert!(a.end() < b.start, "{a:?} touches {b:?}");
        }
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_nodes_never_overlap(coloured in any::<bool>(), ops in prop::collection::vec(op(), 1..64)) {
        let mut mm = RangeManager::new(0, 64 * PAGE).with_color_adjust(coloured);

        for op in ops {
            match op {
                Op::Fixed { page, pages, color } => {
                    let _ = mm.reserve_fixed(pages * PAGE, page * PAGE, color);
                }
                Op::BestFit { pages, align_shift, color } => {
                    let _ = mm.insert_best_fit(pages * PAGE, PAGE << align_shift, color, 0, 64 * PAGE);
                }
                Op::Remove { pick } => {
                    let starts: Vec<u64> = mm.iter().map(|n| n.start).collect();
                    if !starts.is_empty() {
                        mm.remove(starts[pick % starts.len()]);
                    }
                }
            }

            let nodes: Vec<Node> = mm.iter().copied().collect();
            check_layout(&nodes, coloured)?;
            prop_assert_eq!(mm.allocated_bytes(), nodes.iter().map(|n| n.size).sum::<u64>());
        }
    }
}
