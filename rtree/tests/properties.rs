extern crate proptest;

use proptest::prelude::ProptestConfig;

use rtree::{RTree, Range};

proptest::prop_compose! {
    pub fn arb_range()(start in 0i64..4096, len in 1i64..256) -> Range {
        Range::new(start, start + len)
    }
}

fn collect(tree: &RTree<usize>) -> Vec<(i64, i64, usize)> {
    let mut out = Vec::new();
    tree.walk(|r, d| {
        out.push((r.start, r.stop, *d));
        true
    });
    out.sort();
    out
}

proptest::proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64, .. ProptestConfig::default()
    })]

    #[test]
    fn shape_invariants_hold_under_insertion(ranges in proptest::collection::vec(arb_range(), 0..256)) {
        let mut tree = RTree::new();
        for (idx, range) in ranges.iter().enumerate() {
            tree.add(*range, idx);
            assert!(tree.check());
        }
        assert_eq!(ranges.len(), tree.count());
        // Every inserted entry comes back out of a walk exactly once.
        let mut expected: Vec<(i64, i64, usize)> = ranges
            .iter()
            .enumerate()
            .map(|(idx, r)| (r.start, r.stop, idx))
            .collect();
        expected.sort();
        assert_eq!(expected, collect(&tree));
    }

    #[test]
    fn overlap_returns_exactly_the_intersecting_entries(
        ranges in proptest::collection::vec(arb_range(), 1..128),
        query in arb_range(),
    ) {
        let mut tree = RTree::new();
        for (idx, range) in ranges.iter().enumerate() {
            tree.add(*range, idx);
        }
        let mut got = Vec::new();
        assert!(tree.overlap(&query, |r, d| {
            got.push((r.start, r.stop, *d));
            true
        }));
        got.sort();
        let mut expected: Vec<(i64, i64, usize)> = ranges
            .iter()
            .enumerate()
            .filter(|(_, r)| r.overlaps(&query))
            .map(|(idx, r)| (r.start, r.stop, idx))
            .collect();
        expected.sort();
        assert_eq!(expected, got);
    }

    #[test]
    fn removal_preserves_shape_and_contents(
        ranges in proptest::collection::vec(arb_range(), 1..128),
        victims in proptest::collection::vec(proptest::bool::ANY, 1..128),
    ) {
        // Deduplicate by (start, stop) so exact-match removal is unambiguous.
        let mut shadow: Vec<(Range, usize)> = Vec::new();
        let mut tree = RTree::new();
        for (idx, range) in ranges.iter().enumerate() {
            if shadow.iter().any(|(r, _)| r.matches(range)) {
                continue;
            }
            shadow.push((*range, idx));
            tree.add(*range, idx);
        }
        for (slot, remove) in victims.iter().enumerate() {
            if !remove || slot >= shadow.len() {
                continue;
            }
            let (range, idx) = shadow[slot];
            assert_eq!(Some(idx), tree.remove(&range));
            shadow[slot].1 = usize::MAX;
            assert!(tree.check());
        }
        let mut expected: Vec<(i64, i64, usize)> = shadow
            .iter()
            .filter(|(_, idx)| *idx != usize::MAX)
            .map(|(r, idx)| (r.start, r.stop, *idx))
            .collect();
        expected.sort();
        assert_eq!(expected, collect(&tree));
    }
}
