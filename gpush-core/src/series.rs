//! Series assembly: reconstructing the contiguous stack of commits that
//! belong to one push/review group, given a single representative commit.
//!
//! The walk follows first-parent links toward the root and (optionally)
//! first-child links toward the tip, stopping at the first commit whose
//! group disagrees with the anchor's. Ungrouped ("loose") commits next
//! to the series are captured provisionally and only retained once a
//! bound commit on the same side confirms they belong.

use crate::error::Result;
use crate::graph::CommitTable;
use crate::registry::ChangeRegistry;

/// Whether to extend the series past the anchor toward the tip.
///
/// `AncestorsOnly` is used by sweep-style callers that only care about
/// what the anchor sits on top of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesMode {
    WithDescendants,
    AncestorsOnly,
}

/// A reconstructed series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Series {
    /// Member commit ids, root to tip.
    pub commits: Vec<String>,
    /// The resolved group, or `None` when the whole run is loose.
    pub group: Option<u64>,
    /// The true first-parent boundary: the commit the series sits on,
    /// when known.
    pub base: Option<String>,
    /// Loose commits above the series, not part of it (informational).
    pub prospects: Vec<String>,
}

fn group_of(
    table: &CommitTable,
    registry: &ChangeRegistry,
    branch: &str,
    commit_id: &str,
) -> Result<Option<u64>> {
    let changeid = match table.get(commit_id).and_then(|c| c.changeid.as_deref()) {
        Some(cid) => cid,
        None => return Ok(None),
    };
    Ok(registry
        .active_for(changeid, branch)?
        .and_then(|ch| ch.grp))
}

/// Reconstructs the series containing `anchor` on `branch`.
///
/// For a synthetic chain of commits sharing one group, the result is
/// identical whichever member is passed as the anchor.
///
/// # Errors
///
/// Propagates registry invariant violations; the walk itself cannot
/// fail.
pub fn assemble(
    table: &CommitTable,
    registry: &ChangeRegistry,
    branch: &str,
    anchor: &str,
    mode: SeriesMode,
) -> Result<Series> {
    let anchor_bound = group_of(table, registry, branch, anchor)?.is_some();

    // Rootward, anchor included. Commits are collected tip-to-root and
    // reversed at the end.
    let mut rootward: Vec<String> = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    let mut group: Option<u64> = None;
    let mut cursor = Some(anchor.to_owned());
    while let Some(id) = cursor {
        let commit = match table.get(&id) {
            Some(c) => c,
            // Parent beyond the visited boundary: the chain ends here.
            None => break,
        };
        match group_of(table, registry, branch, &id)? {
            None => pending.push(id.clone()),
            Some(g) => match group {
                None => {
                    // First bound commit; it fixes the group for the
                    // accumulated loose run above it.
                    group = Some(g);
                    rootward.append(&mut pending);
                    rootward.push(id.clone());
                }
                Some(bound) if g == bound => {
                    rootward.append(&mut pending);
                    rootward.push(id.clone());
                }
                Some(_) => {
                    // A different series below ours; unconfirmed loose
                    // commits in between belong to neither.
                    pending.clear();
                    break;
                }
            },
        }
        cursor = commit.first_parent().map(str::to_owned);
    }
    if group.is_none() {
        // Fully loose run: the anchor and its contiguous loose ancestors
        // form the (ungrouped) series.
        rootward.append(&mut pending);
    }
    pending.clear();
    rootward.reverse();
    let mut commits = rootward;

    // Tipward, only from a bound anchor: extending a loose anchor
    // through its descendants would pull in unrelated later work.
    let mut prospects: Vec<String> = Vec::new();
    if anchor_bound && mode == SeriesMode::WithDescendants {
        let mut cursor = table.get(anchor).and_then(|c| c.fp_child.clone());
        while let Some(id) = cursor {
            match group_of(table, registry, branch, &id)? {
                None => pending.push(id.clone()),
                Some(g) if Some(g) == group => {
                    commits.append(&mut pending);
                    commits.push(id.clone());
                }
                Some(_) => break,
            }
            cursor = table.get(&id).and_then(|c| c.fp_child.clone());
        }
        // Trailing unconfirmed loose commits are reported, not included.
        prospects = pending;
    }

    let base = commits
        .first()
        .and_then(|root| table.get(root))
        .and_then(|c| c.first_parent().map(str::to_owned));

    Ok(Series {
        commits,
        group,
        base,
        prospects,
    })
}
