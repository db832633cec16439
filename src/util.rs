#[inline]
pub(crate) const fn round_up_to_multiple_of(val: usize, to: usize) -> usize {
    let diff = val % to;
    if diff == 0 {
        val
    } else {
        val + (to - diff)
    }
}

/// Same as `round_up_to_multiple_of` but reports overflow instead of wrapping.
#[inline]
pub(crate) const fn checked_round_up_to_multiple_of(val: usize, to: usize) -> Option<usize> {
    let diff = val % to;
    if diff == 0 {
        Some(val)
    } else {
        val.checked_add(to - diff)
    }
}

#[inline]
pub(crate) const fn min(left: usize, right: usize) -> usize {
    if left > right {
        right
    } else {
        left
    }
}

#[inline]
pub(crate) const fn max(left: usize, right: usize) -> usize {
    if left < right {
        right
    } else {
        left
    }
}
