//! Stable merge of two already-sorted vectors into one.

/// Merges two vectors that are each individually sorted under `cmp` into a
/// single sorted vector, preferring elements from `left` on ties.
///
/// This is the only ordering primitive the engine uses: snapshot rewind,
/// event insertion, and event removal all reduce to "replay a merged tail".
pub fn merge_sorted_by<T>(left: Vec<T>, right: Vec<T>, mut cmp: impl FnMut(&T, &T) -> std::cmp::Ordering) -> Vec<T> {
    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();

    loop {
        match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => {
                if cmp(l, r) != std::cmp::Ordering::Greater {
                    out.push(left.next().unwrap());
                } else {
                    out.push(right.next().unwrap());
                }
            }
            (Some(_), None) => out.push(left.next().unwrap()),
            (None, Some(_)) => out.push(right.next().unwrap()),
            (None, None) => break,
        }
    }
    out
}
