//! Garbage collection: pruning Change records and fetched-patchset
//! cache refs that no longer correspond to reachable, relevant state.
//!
//! Requires a full-history walk of every local branch, so it is
//! time-gated rather than run on every invocation. Decisions accumulate
//! per item; one odd Change never aborts the whole pass. Ref deletions
//! default to a reported dry-run — distributed state is never deleted
//! silently without an explicit opt-in.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use git2::Oid;
use log::{debug, info, warn};

use crate::context::{branch_upstream_tip, Context};
use crate::error::Result;
use crate::graph;
use crate::ledger;
use crate::report::Report;

/// Whether computed ref deletions are executed or only reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcRefDeletion {
    #[default]
    DryRun,
    Apply,
}

/// Summary of one garbage-collection pass.
#[derive(Debug, Default)]
pub struct GcOutcome {
    /// The pass was skipped because the interval has not elapsed.
    pub skipped: bool,
    /// Changes kept because their identifier is reachable locally.
    pub kept_local: usize,
    /// Changes kept because they are the tip of a kept push lineage.
    pub kept_push_tip: usize,
    /// Changes kept because the server still shows them open.
    pub kept_active: usize,
    /// Keys marked garbage.
    pub pruned: Vec<u64>,
    /// Cache refs deleted (or that would be deleted in dry-run).
    pub cache_refs_pruned: Vec<String>,
    pub reports: Vec<Report>,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Runs a garbage-collection pass.
///
/// `force` bypasses the interval gate. `deletion` controls whether the
/// computed cache-ref deletions are applied; the default reports them
/// only.
pub fn run_gc(ctx: &mut Context, force: bool, deletion: GcRefDeletion) -> Result<GcOutcome> {
    let mut outcome = GcOutcome::default();

    let now = now_secs();
    let interval = ctx.config.gc_interval.as_secs() as i64;
    if !force && ctx.registry.last_gc > 0 && now - ctx.registry.last_gc < interval {
        debug!(
            "gc skipped; last run {}s ago, interval {}s",
            now - ctx.registry.last_gc,
            interval
        );
        outcome.skipped = true;
        return Ok(outcome);
    }

    // Pass 1+2: enumerate local branches and their upstream boundaries.
    let (tips, excludes) = local_branch_tips(ctx)?;

    // Pass 3: one combined walk for every locally reachable identifier.
    let reachable = {
        let Context { repo, commits, .. } = ctx;
        graph::collect_changeids(repo, commits, &tips, &excludes)?
    };
    info!(
        "{} change ids reachable from {} local branches",
        reachable.len(),
        tips.len()
    );

    // Keep: exists locally, then transitively the recorded tips of kept
    // push lineages (a kept change's base points at the commit another
    // change last pushed).
    let mut keep: HashSet<u64> = HashSet::new();
    let mut pushed_by: HashMap<String, u64> = HashMap::new();
    for ch in ctx.registry.iter().filter(|ch| !ch.garbage) {
        if let Some(pushed) = &ch.pushed {
            pushed_by.insert(pushed.clone(), ch.key);
        }
        if reachable.contains(&ch.id) {
            keep.insert(ch.key);
        }
    }
    outcome.kept_local = keep.len();
    loop {
        let mut grew = false;
        let bases: Vec<String> = keep
            .iter()
            .filter_map(|k| ctx.registry.get(*k).and_then(|ch| ch.base.clone()))
            .collect();
        for base in bases {
            if let Some(&key) = pushed_by.get(&base) {
                grew |= keep.insert(key);
            }
        }
        if !grew {
            break;
        }
    }
    outcome.kept_push_tip = keep.len() - outcome.kept_local;

    // Pass 4: ask the server about the remainder.
    let candidate_ids: Vec<String> = {
        let mut ids: Vec<String> = ctx
            .registry
            .iter()
            .filter(|ch| !ch.garbage && !keep.contains(&ch.key))
            .map(|ch| ch.id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    };
    // Cache refs are pruned against server truth too, so their change
    // numbers join the same batch.
    let cache_numbers: Vec<u64> = {
        let mut numbers: Vec<u64> = ledger::list_cache_refs(&ctx.repo)?
            .into_iter()
            .map(|(number, _, _, _)| number)
            .collect();
        numbers.sort_unstable();
        numbers.dedup();
        numbers
    };
    let mut predicates: Vec<String> = candidate_ids
        .iter()
        .map(|id| format!("change:{}", id))
        .collect();
    predicates.extend(cache_numbers.iter().map(|n| format!("change:{}", n)));
    if !predicates.is_empty() {
        if ctx.transport.is_some() {
            let reports = ctx.query(&predicates)?;
            outcome.reports.extend(reports);
        } else {
            // Without a server we cannot prove anything terminal; err
            // toward keeping.
            warn!(
                "no queryable remote; keeping all {} candidates",
                candidate_ids.len()
            );
        }
    }

    let candidates: Vec<(u64, String)> = ctx
        .registry
        .iter()
        .filter(|ch| !ch.garbage && !keep.contains(&ch.key))
        .map(|ch| (ch.key, ch.id.clone()))
        .collect();
    let have_server = ctx.transport.is_some();
    for (key, id) in candidates {
        let open_on_server = ctx
            .gerrit
            .numbers_for_id(&id)
            .iter()
            .filter_map(|n| ctx.gerrit.get(*n))
            .any(|info| !info.status.is_terminal());
        if open_on_server || !have_server {
            outcome.kept_active += 1;
            keep.insert(key);
        } else {
            debug!("pruning change {} ({}): unreachable and terminal", key, id);
            ctx.registry.mark_garbage(key);
            outcome.pruned.push(key);
        }
    }

    // Pass 5: prune fetched-patchset cache refs to the minimum suffix
    // needed to resume work.
    let doomed = prune_cache_refs(ctx, have_server)?;
    // Pass 6: apply or report.
    match deletion {
        GcRefDeletion::Apply => {
            for name in &doomed {
                if ctx.opts.dry_run {
                    info!("dry-run: would delete {}", name);
                } else {
                    ctx.repo.find_reference(name)?.delete()?;
                }
            }
        }
        GcRefDeletion::DryRun => {
            if !doomed.is_empty() {
                outcome.reports.push(Report::Flowed(format!(
                    "gc would delete {} stale fetch refs; re-run with --apply to delete them",
                    doomed.len()
                )));
            }
        }
    }
    outcome.cache_refs_pruned = doomed;

    ctx.registry.last_gc = now;
    ctx.registry.mark_dirty();
    ctx.save_state()?;

    if !outcome.pruned.is_empty() {
        outcome.reports.push(Report::Flowed(format!(
            "garbage-collected {} stale changes",
            outcome.pruned.len()
        )));
    }
    Ok(outcome)
}

/// Tips of all local branches plus the exclusion boundaries formed by
/// their upstreams.
fn local_branch_tips(ctx: &Context) -> Result<(Vec<Oid>, Vec<Oid>)> {
    let mut tips = Vec::new();
    let mut excludes = Vec::new();
    for branch in ctx.repo.branches(Some(git2::BranchType::Local))? {
        let (branch, _) = branch?;
        let name = match branch.name()? {
            Some(n) => n.to_owned(),
            None => continue,
        };
        if let Some(tip) = branch.get().target() {
            tips.push(tip);
        }
        if let Some(up) = branch_upstream_tip(&ctx.repo, &name) {
            excludes.push(up);
        }
    }
    Ok((tips, excludes))
}

/// Computes which cache refs to drop: for each server Change keep the
/// current patch set (and the previous one when the Change is terminal,
/// so a just-merged series can still be diffed), then extend the keep
/// set recursively along push-base chains referenced by kept refs.
fn prune_cache_refs(ctx: &Context, have_server: bool) -> Result<Vec<String>> {
    let refs = ledger::list_cache_refs(&ctx.repo)?;
    if refs.is_empty() {
        return Ok(Vec::new());
    }

    let mut keep: HashSet<(u64, u32)> = HashSet::new();
    let mut worklist: Vec<(u64, u32)> = Vec::new();
    for &(number, ps, _, _) in &refs {
        let info = match ctx.gerrit.get(number) {
            Some(info) => info,
            None => {
                // Queried and absent: the change is gone server-side
                // and the ref is stale. Unqueried (no server): keep —
                // nothing is proven.
                if !have_server && keep.insert((number, ps)) {
                    worklist.push((number, ps));
                }
                continue;
            }
        };
        let current = match info.current_patch_set() {
            Some(ps) => ps.number,
            None => continue,
        };
        let keep_this = ps == current
            || (info.status.is_terminal() && ps + 1 == current);
        if keep_this && keep.insert((number, ps)) {
            worklist.push((number, ps));
        }
    }

    // Recursive extension over push-base ancestry: a kept patch set that
    // was pushed on top of another cached patch set keeps that one too.
    while let Some((number, ps)) = worklist.pop() {
        let base_rev = ctx
            .gerrit
            .get(number)
            .and_then(|info| info.patch_sets.iter().find(|p| p.number == ps))
            .and_then(|p| p.push_base.clone());
        if let Some(base_rev) = base_rev {
            if let Some(owner) = ctx.gerrit.lookup_revision(&base_rev) {
                if refs.iter().any(|&(n, p, _, _)| (n, p) == owner) && keep.insert(owner) {
                    worklist.push(owner);
                }
            }
        }
    }

    Ok(refs
        .into_iter()
        .filter(|&(n, p, _, _)| !keep.contains(&(n, p)))
        .map(|(_, _, name, _)| name)
        .collect())
}
