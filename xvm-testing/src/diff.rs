//! Line-based unified diff between expected and actual golden content

/// Lines of unchanged context around each change
const CONTEXT: usize = 1;

/// Above this many table cells the changed middle is reported as a whole
/// block replaced.
const MAX_LCS_CELLS: usize = 4_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    Delete,
    Insert,
}

/// One step of the edit script; `a` and `b` are the positions in each side
/// when the step is taken.
#[derive(Debug, Clone, Copy)]
struct Edit {
    op: Op,
    a: usize,
    b: usize,
}

/// Renders a unified diff of `expected` against `actual`, with one line of
/// context. Returns an empty string when both are equal.
pub fn unified_diff(expected: &str, actual: &str) -> String {
    let a: Vec<&str> = expected.split_inclusive('\n').collect();
    let b: Vec<&str> = actual.split_inclusive('\n').collect();

    let edits = edit_script(&a, &b);
    let changes: Vec<usize> = edits
        .iter()
        .enumerate()
        .filter(|(_, e)| e.op != Op::Equal)
        .map(|(i, _)| i)
        .collect();
    if changes.is_empty() {
        return String::new();
    }

    let mut out = String::from("--- Expected\n+++ Actual\n");
    let mut i = 0;
    while i < changes.len() {
        let start = changes[i].saturating_sub(CONTEXT);
        let mut end = changes[i] + 1;
        let mut j = i;
        while j + 1 < changes.len() && changes[j + 1] - end <= 2 * CONTEXT {
            j += 1;
            end = changes[j] + 1;
        }
        let end = (end + CONTEXT).min(edits.len());
        write_hunk(&mut out, &edits[start..end], &a, &b);
        i = j + 1;
    }
    out
}

fn write_hunk(out: &mut String, hunk: &[Edit], a: &[&str], b: &[&str]) {
    let a_len = hunk.iter().filter(|e| e.op != Op::Insert).count();
    let b_len = hunk.iter().filter(|e| e.op != Op::Delete).count();
    out.push_str(&format!(
        "@@ -{} +{} @@\n",
        format_range(hunk[0].a, a_len),
        format_range(hunk[0].b, b_len)
    ));

    for edit in hunk {
        let (prefix, line) = match edit.op {
            Op::Equal => (' ', a[edit.a]),
            Op::Delete => ('-', a[edit.a]),
            Op::Insert => ('+', b[edit.b]),
        };
        out.push(prefix);
        out.push_str(line);
        if !line.ends_with('\n') {
            out.push('\n');
        }
    }
}

fn format_range(start: usize, len: usize) -> String {
    match len {
        0 => format!("{start},0"),
        1 => format!("{}", start + 1),
        _ => format!("{},{len}", start + 1),
    }
}

/// Longest-common-subsequence edit script, after stripping the common prefix
/// and suffix.
fn edit_script(a: &[&str], b: &[&str]) -> Vec<Edit> {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let mid_a = &a[prefix..a.len() - suffix];
    let mid_b = &b[prefix..b.len() - suffix];
    let (n, m) = (mid_a.len(), mid_b.len());

    let mut edits = Vec::with_capacity(a.len() + b.len());
    for k in 0..prefix {
        edits.push(Edit { op: Op::Equal, a: k, b: k });
    }

    if n.saturating_mul(m) > MAX_LCS_CELLS {
        edits.extend((0..n).map(|i| Edit {
            op: Op::Delete,
            a: prefix + i,
            b: prefix,
        }));
        edits.extend((0..m).map(|j| Edit {
            op: Op::Insert,
            a: prefix + n,
            b: prefix + j,
        }));
    } else {
        lcs_edits(mid_a, mid_b, prefix, &mut edits);
    }

    for k in 0..suffix {
        edits.push(Edit {
            op: Op::Equal,
            a: prefix + n + k,
            b: prefix + m + k,
        });
    }
    edits
}

fn lcs_edits(mid_a: &[&str], mid_b: &[&str], offset: usize, edits: &mut Vec<Edit>) {
    let (n, m) = (mid_a.len(), mid_b.len());

    // lcs[i][j]: length of the LCS of mid_a[i..] and mid_b[j..]
    let mut lcs = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if mid_a[i] == mid_b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n || j < m {
        let (pa, pb) = (offset + i, offset + j);
        if i < n && j < m && mid_a[i] == mid_b[j] {
            edits.push(Edit { op: Op::Equal, a: pa, b: pb });
            i += 1;
            j += 1;
        } else if j == m || (i < n && lcs[i + 1][j] >= lcs[i][j + 1]) {
            edits.push(Edit { op: Op::Delete, a: pa, b: pb });
            i += 1;
        } else {
            edits.push(Edit { op: Op::Insert, a: pa, b: pb });
            j += 1;
        }
    }
}
