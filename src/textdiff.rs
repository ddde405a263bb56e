//! Minimal line-oriented diff used to align two assembly listings. Myers'
//! greedy O(ND) algorithm with an explicit trace, backtracked into an edit
//! script, then folded into side-by-side rows the importer walks.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Keep,
    Delete,
    Insert,
}

fn edit_script<T: PartialEq>(a: &[T], b: &[T]) -> Vec<Edit> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = n + m;
    if max == 0 {
        return Vec::new();
    }

    let offset = max;
    let width = 2 * max as usize + 1;
    let mut v = vec![0isize; width];
    let mut trace: Vec<Vec<isize>> = Vec::new();

    'search: for d in 0..=max {
        trace.push(v.clone());
        let mut k = -d;
        while k <= d {
            let idx = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x >= n && y >= m {
                break 'search;
            }
            k += 2;
        }
    }

    let mut ops = Vec::new();
    let mut x = n;
    let mut y = m;
    for (d, v) in trace.iter().enumerate().rev() {
        let d = d as isize;
        let k = x - y;
        let prev_k = if k == -d
            || (k != d && v[(k - 1 + offset) as usize] < v[(k + 1 + offset) as usize])
        {
            k + 1
        } else {
            k - 1
        };
        let prev_x = v[(prev_k + offset) as usize];
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            ops.push(Edit::Keep);
            x -= 1;
            y -= 1;
        }
        if d > 0 {
            if x == prev_x {
                ops.push(Edit::Insert);
                y -= 1;
            } else {
                ops.push(Edit::Delete);
                x -= 1;
            }
        }
    }
    ops.reverse();
    ops
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    /// Identical line on both sides.
    Same,
    /// A deleted line paired with an inserted one.
    Changed,
    LeftOnly,
    RightOnly,
}

/// One aligned row. Indices are zero-based positions into the input slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Row {
    pub left: Option<usize>,
    pub right: Option<usize>,
    pub kind: RowKind,
}

/// Aligns two sequences side by side. Adjacent delete and insert runs are
/// zipped into `Changed` rows as far as the shorter run reaches; the rest
/// falls out as one-sided rows.
pub fn side_by_side<T: PartialEq>(a: &[T], b: &[T]) -> Vec<Row> {
    let script = edit_script(a, b);
    let mut rows = Vec::with_capacity(script.len());

    let mut x = 0usize;
    let mut y = 0usize;
    let mut i = 0usize;
    while i < script.len() {
        match script[i] {
            Edit::Keep => {
                rows.push(Row {
                    left: Some(x),
                    right: Some(y),
                    kind: RowKind::Same,
                });
                x += 1;
                y += 1;
                i += 1;
            }
            Edit::Delete => {
                let mut deletes = 0;
                while i + deletes < script.len() && script[i + deletes] == Edit::Delete {
                    deletes += 1;
                }
                let mut inserts = 0;
                while i + deletes + inserts < script.len()
                    && script[i + deletes + inserts] == Edit::Insert
                {
                    inserts += 1;
                }
                let paired = deletes.min(inserts);
                for _ in 0..paired {
                    rows.push(Row {
                        left: Some(x),
                        right: Some(y),
                        kind: RowKind::Changed,
                    });
                    x += 1;
                    y += 1;
                }
                for _ in paired..deletes {
                    rows.push(Row {
                        left: Some(x),
                        right: None,
                        kind: RowKind::LeftOnly,
                    });
                    x += 1;
                }
                for _ in paired..inserts {
                    rows.push(Row {
                        left: None,
                        right: Some(y),
                        kind: RowKind::RightOnly,
                    });
                    y += 1;
                }
                i += deletes + inserts;
            }
            Edit::Insert => {
                rows.push(Row {
                    left: None,
                    right: Some(y),
                    kind: RowKind::RightOnly,
                });
                y += 1;
                i += 1;
            }
        }
    }
    rows
}

/// Byte ranges that actually differ between the two sides of a `Changed`
/// row, found by trimming the common prefix and suffix. Operates on bytes;
/// assembly listings are ASCII.
pub fn changed_ranges(
    left: &str,
    right: &str,
) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
    let l = left.as_bytes();
    let r = right.as_bytes();

    let mut start = 0;
    while start < l.len().min(r.len()) && l[start] == r[start] {
        start += 1;
    }
    let mut end_l = l.len();
    let mut end_r = r.len();
    while end_l > start && end_r > start && l[end_l - 1] == r[end_r - 1] {
        end_l -= 1;
        end_r -= 1;
    }
    (start..end_l, start..end_r)
}
