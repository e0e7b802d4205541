//! RainTree level arithmetic.
//!
//! All functions work on positions in a sorted address list rotated so the
//! local node sits at index 0. They are pure so every node sharing the list
//! derives the same tree.

/// Smallest `k` with `3^k >= n`. Zero for `n <= 1`.
pub fn max_level(n: usize) -> u8 {
    let mut level = 0u8;
    let mut span: u128 = 1;
    while span < n as u128 {
        span *= 3;
        level += 1;
    }
    level
}

/// Neighbourhood size considered at `level` in a tree of height `top` over
/// `n` peers.
///
/// Each step down from `top` keeps two thirds of the previous range, capped
/// at `3^level` so the three sub-ranges of every level still tile their
/// parent.
pub fn level_size(n: usize, top: u8, level: u8) -> usize {
    if level == 0 || level > top {
        return 0;
    }
    let depth = u32::from(top - level);
    let shrunk = (n as u128 * 2u128.pow(depth)) / 3u128.pow(depth);
    let cap = 3u128.pow(u32::from(level));
    shrunk.min(cap) as usize
}

/// Rotated indices of the targets at `level`: one third and two thirds into
/// the level's neighbourhood. Self (index 0) is never a target and equal
/// targets collapse to one.
pub fn target_offsets(n: usize, top: u8, level: u8) -> Vec<usize> {
    let size = level_size(n, top, level);
    let mut offsets = Vec::with_capacity(2);
    for offset in [size / 3, size * 2 / 3] {
        if offset != 0 && offset < n && !offsets.contains(&offset) {
            offsets.push(offset);
        }
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashMap};

    #[test]
    fn level_table() {
        for (n, level) in [
            (0, 0),
            (1, 0),
            (2, 1),
            (3, 1),
            (4, 2),
            (9, 2),
            (10, 3),
            (27, 3),
            (28, 4),
            (81, 4),
            (82, 5),
        ] {
            assert_eq!(max_level(n), level, "n = {n}");
        }
    }

    fn trace(n: usize) -> Vec<Vec<usize>> {
        let top = max_level(n);
        (1..=top).rev().map(|l| target_offsets(n, top, l)).collect()
    }

    #[test]
    fn reference_traces() {
        assert_eq!(trace(1), Vec::<Vec<usize>>::new());
        assert_eq!(trace(2), vec![vec![1]]);
        assert_eq!(trace(3), vec![vec![1, 2]]);
        assert_eq!(trace(6), vec![vec![2, 4], vec![1, 2]]);
        assert_eq!(trace(9), vec![vec![3, 6], vec![1, 2]]);
        assert_eq!(trace(12), vec![vec![4, 8], vec![2, 5], vec![1, 2]]);
        assert_eq!(trace(27), vec![vec![9, 18], vec![3, 6], vec![1, 2]]);
    }

    #[test]
    fn level_sizes_never_exceed_the_ring() {
        for n in 1..500 {
            let top = max_level(n);
            for level in 1..=top {
                assert!(level_size(n, top, level) <= n);
            }
            assert_eq!(level_size(n, top, 0), 0);
            assert_eq!(level_size(n, top, top + 1), 0);
        }
    }

    /// Largest `k` with `3^k <= n`.
    fn floor_log3(n: usize) -> u32 {
        let mut k = 0;
        let mut span = 3;
        while span <= n {
            span *= 3;
            k += 1;
        }
        k
    }

    /// Replays one broadcast over `n` nodes with instant, lossless delivery
    /// and returns how many copies each node received (the originator's
    /// local delivery counts as one).
    fn simulate(n: usize, origin: usize) -> Vec<u32> {
        let top = max_level(n);
        let mut receipts = vec![0u32; n];
        let mut delivered = vec![false; n];
        let mut propagated: Vec<BTreeSet<u8>> = vec![BTreeSet::new(); n];
        let mut queue = Vec::new();

        receipts[origin] = 1;
        delivered[origin] = true;
        propagated[origin].extend(1..=top);
        for level in (1..=top).rev() {
            for offset in target_offsets(n, top, level) {
                queue.push(((origin + offset) % n, level));
            }
        }

        while let Some((node, level)) = queue.pop() {
            receipts[node] += 1;
            delivered[node] = true;
            if !propagated[node].insert(level) {
                continue;
            }
            for next in (1..level).rev() {
                for offset in target_offsets(n, top, next) {
                    queue.push(((node + offset) % n, next));
                }
            }
        }

        assert!(delivered.iter().all(|d| *d), "n = {n}: coverage gap");
        receipts
    }

    #[test]
    fn every_node_is_reached_with_bounded_redundancy() {
        let mut worst: HashMap<usize, u32> = HashMap::new();
        for n in 1..=300 {
            let receipts = simulate(n, 0);
            let max = receipts.iter().copied().max().unwrap_or(0);
            let bound = floor_log3(n) + 1;
            assert!(max <= bound, "n = {n}: {max} copies exceeds {bound}");
            worst.insert(n, max);
        }
        assert_eq!(worst[&2], 1);
        assert_eq!(worst[&7], 2);
        assert_eq!(worst[&9], 1);
        assert_eq!(worst[&12], 3);
    }

    #[test]
    fn origin_does_not_change_the_shape() {
        for n in [5, 12, 40] {
            let from_zero = simulate(n, 0);
            let mut from_three = simulate(n, 3);
            from_three.rotate_left(3);
            assert_eq!(from_zero, from_three);
        }
    }
}
