//! Index arithmetic over the implicit block tree.
//!
//! Nodes are numbered breadth-first: the root is `0`, and the children of
//! node `i` are `2i + 1` and `2i + 2`. A node's level is its depth, so level
//! `l` holds the `2^l` nodes `2^l - 1 ..= 2^(l+1) - 2`.

/// Returns the number of nodes in a tree whose deepest level is `levels`.
#[inline]
pub const fn num_nodes(levels: u32) -> usize {
    (1 << (levels + 1)) - 1
}

/// Returns the depth of node `idx`. The root is at level 0.
#[inline]
pub const fn level(idx: usize) -> u32 {
    // floor(log2(idx + 1))
    usize::BITS - 1 - (idx + 1).leading_zeros()
}

/// Returns the smallest node index at level `level`.
#[inline]
pub const fn first_index_of_level(level: u32) -> usize {
    (1 << level) - 1
}

/// Returns the position of `idx` among the nodes of its level, counting from
/// the left.
#[inline]
pub const fn offset_in_level(idx: usize) -> usize {
    idx - first_index_of_level(level(idx))
}

/// Returns the parent of `idx`.
///
/// The root has no parent; passing `0` is a logic error.
#[inline]
pub const fn parent(idx: usize) -> usize {
    debug_assert!(idx > 0, "the root has no parent");
    (idx - 1) / 2
}

/// Returns the other child of `parent(idx)`.
///
/// The root has no buddy; passing `0` is a logic error.
#[inline]
pub const fn buddy(idx: usize) -> usize {
    debug_assert!(idx > 0, "the root has no buddy");
    if is_left_child(idx) {
        idx + 1
    } else {
        idx - 1
    }
}

/// Left children have odd indices, right children even ones.
#[inline]
pub const fn is_left_child(idx: usize) -> bool {
    idx & 1 == 1
}

/// Returns the first child of `idx`.
#[inline]
pub const fn left_child(idx: usize) -> usize {
    2 * idx + 1
}

/// Returns the second child of `idx`.
#[inline]
pub const fn right_child(idx: usize) -> usize {
    2 * idx + 2
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_CHECKED_LEVELS: u32 = 12;

    #[test]
    fn levels_partition_the_tree() {
        for l in 0..=MAX_CHECKED_LEVELS {
            let first = first_index_of_level(l);
            let next = first_index_of_level(l + 1);
            assert_eq!(next - first, 1 << l);

            for idx in first..next {
                assert_eq!(level(idx), l, "idx {idx}");
                assert_eq!(offset_in_level(idx), idx - first);
            }
        }

        assert_eq!(num_nodes(0), 1);
        assert_eq!(num_nodes(3), 15);
        assert_eq!(num_nodes(MAX_CHECKED_LEVELS), first_index_of_level(MAX_CHECKED_LEVELS + 1));
    }

    #[test]
    fn children_and_parents_agree() {
        for idx in 0..num_nodes(MAX_CHECKED_LEVELS - 1) {
            let (l, r) = (left_child(idx), right_child(idx));

            assert_eq!(parent(l), idx);
            assert_eq!(parent(r), idx);
            assert!(is_left_child(l));
            assert!(!is_left_child(r));
            assert_eq!(level(l), level(idx) + 1);
            assert_eq!(offset_in_level(l), 2 * offset_in_level(idx));
            assert_eq!(offset_in_level(r), 2 * offset_in_level(idx) + 1);
        }
    }

    #[test]
    fn buddies_pair_up_siblings() {
        for idx in 1..num_nodes(MAX_CHECKED_LEVELS) {
            let b = buddy(idx);

            assert_ne!(b, idx);
            assert_eq!(buddy(b), idx);
            assert_eq!(parent(b), parent(idx));
            assert_eq!(level(b), level(idx));
            assert_eq!(offset_in_level(b) ^ 1, offset_in_level(idx));
        }
    }

    // Usable in constant expressions.
    const PARENT_OF_EIGHT: usize = parent(8);
    const BUDDY_OF_EIGHT: usize = buddy(8);

    #[test]
    fn parent_and_buddy_are_const() {
        assert_eq!(PARENT_OF_EIGHT, 3);
        assert_eq!(BUDDY_OF_EIGHT, 7);
    }

    #[test]
    fn small_tree_by_hand() {
        assert_eq!(buddy(1), 2);
        assert_eq!(buddy(2), 1);
        assert_eq!(buddy(5), 6);
        assert_eq!(buddy(14), 13);
        assert_eq!(parent(14), 6);
        assert_eq!(parent(13), 6);
        assert_eq!(level(0), 0);
        assert_eq!(level(2), 1);
        assert_eq!(level(7), 3);
        assert_eq!(offset_in_level(13), 6);
    }
}
