//! Source map resolution: assigning every local commit to a Change
//! record, detecting new, moved, copied and hidden changes across
//! branches.
//!
//! The algorithm runs in three explicit phases instead of an ad-hoc
//! retry loop:
//!
//! 1. a planning pass over the branch's commits collects, per commit,
//!    the candidate Changes on other branches and the set of branches
//!    whose history must be consulted;
//! 2. a batched visitation pass walks each requested branch exactly
//!    once, producing its set of reachable review identifiers;
//! 3. an assignment pass applies the decision table with full
//!    knowledge of which candidates vanished from their recorded branch
//!    and which persist there.
//!
//! This bounds the work by the number of distinct branches touched, not
//! by assignment order.

use std::collections::{HashMap, HashSet};

use git2::Oid;
use log::{debug, info};

use crate::context::{branch_tip, branch_upstream_tip, Context};
use crate::error::{Error, Result};
use crate::graph::{self, ChangeIdMode};
use crate::types::Change;

/// What the user asked to happen to one commit's Change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SourceAction {
    /// Reuse the Change on this branch, or create a new one.
    #[default]
    Default,
    /// Transplant the Change's identity from another branch; `from` is
    /// auto-detected when `None`.
    Move { from: Option<String> },
    /// Duplicate the Change onto this branch, keeping it active on the
    /// other branch too.
    Copy { from: Option<String> },
    /// Deactivate without deleting.
    Hide,
    /// Reactivate a hidden record on this branch.
    Unhide,
}

/// Result of resolving one branch.
#[derive(Debug, Default)]
pub struct ResolveOutcome {
    /// (commit id, change key) for every local commit, oldest first.
    pub assignments: Vec<(String, u64)>,
    /// Keys of Changes created during this resolution.
    pub created: Vec<u64>,
}

struct PendingCommit {
    commit_id: String,
    changeid: String,
    action: SourceAction,
}

/// Resolves every local commit of `branch` to a Change record.
///
/// `tip` and `excludes` delimit the branch's local commits (typically
/// tip = branch head, excludes = its upstream). `actions` maps commit
/// ids to explicit user intents; unmentioned commits get
/// `SourceAction::Default`.
///
/// # Errors
///
/// `Error::User` for every ambiguity the tool refuses to guess about
/// (see the decision table in `decide`); `Error::State` for duplicate
/// identifiers on one branch.
pub fn resolve_branch(
    ctx: &mut Context,
    branch: &str,
    tip: Oid,
    excludes: &[Oid],
    actions: &HashMap<String, SourceAction>,
) -> Result<ResolveOutcome> {
    let Context {
        repo,
        commits,
        registry,
        ..
    } = ctx;

    let chain = graph::first_parent_chain(repo, commits, tip, excludes, ChangeIdMode::Require)?;
    commits.link_chain(&chain);

    // Phase 1: plan. Gather per-commit work and the branches to visit.
    let mut pending: Vec<PendingCommit> = Vec::new();
    let mut branches_to_visit: HashSet<String> = HashSet::new();
    let mut seen_ids: HashMap<String, String> = HashMap::new();
    for commit_id in &chain {
        let changeid = commits
            .get(commit_id)
            .and_then(|c| c.changeid.clone())
            .ok_or_else(|| Error::Internal(format!("commit {} lost its Change-Id", commit_id)))?;

        if let Some(earlier) = seen_ids.insert(changeid.clone(), commit_id.clone()) {
            return Err(Error::State(format!(
                "duplicate Change-Id {} on branch {} (commits {} and {})",
                changeid, branch, earlier, commit_id
            )));
        }

        let action = actions.get(commit_id).cloned().unwrap_or_default();

        // The easy case needs no visitation and no pending entry.
        if action == SourceAction::Default
            && registry.active_for(&changeid, branch)?.is_some()
        {
            pending.push(PendingCommit {
                commit_id: commit_id.clone(),
                changeid,
                action,
            });
            continue;
        }

        // Any other-branch record is a potential source; its branch must
        // be consulted to classify it as vanished or persisting. An
        // explicitly named source is consulted as well (for the
        // placeholder decision on move).
        for key in registry.keys_for_id(&changeid) {
            let src = &registry.get(key).expect("indexed key").src;
            if src != branch && src != crate::types::DETACHED_SRC {
                branches_to_visit.insert(src.clone());
            }
        }
        match &action {
            SourceAction::Move { from: Some(b) } | SourceAction::Copy { from: Some(b) } => {
                branches_to_visit.insert(b.clone());
            }
            _ => {}
        }
        pending.push(PendingCommit {
            commit_id: commit_id.clone(),
            changeid,
            action,
        });
    }

    // Phase 2: batched visitation. Walk each requested branch once.
    let mut visited: HashMap<String, HashSet<String>> = HashMap::new();
    for other in branches_to_visit {
        let ids = match branch_tip(repo, &other)? {
            Some(tip) => {
                let upstream = branch_upstream_tip(repo, &other);
                let excludes: Vec<Oid> = upstream.into_iter().collect();
                graph::collect_changeids(repo, commits, &[tip], &excludes)?
            }
            // A recorded source branch that no longer exists reaches
            // nothing; everything on it has vanished.
            None => HashSet::new(),
        };
        debug!("visited branch {}: {} change ids", other, ids.len());
        visited.insert(other, ids);
    }

    // Phase 3: assignment.
    let pre_next_key = registry.next_key;
    let mut outcome = ResolveOutcome::default();
    for p in pending {
        let key = decide(registry, branch, &p, &visited)?;
        if !registry.get(key).map(|ch| ch.is_active()).unwrap_or(false) {
            // Hidden assignments still map the commit, so a later
            // unhide finds it; they are just not pushed.
            debug!("commit {} maps to hidden change {}", p.commit_id, key);
        }
        outcome.assignments.push((p.commit_id, key));
    }
    outcome.created = outcome
        .assignments
        .iter()
        .map(|(_, k)| *k)
        .filter(|k| *k >= pre_next_key)
        .collect();
    Ok(outcome)
}

/// Applies the decision table for one commit. Returns the key of the
/// Change the commit now belongs to.
fn decide(
    registry: &mut crate::registry::ChangeRegistry,
    branch: &str,
    p: &PendingCommit,
    visited: &HashMap<String, HashSet<String>>,
) -> Result<u64> {
    let changeid = &p.changeid;
    match &p.action {
        SourceAction::Default => {
            if let Some(ch) = registry.active_for(changeid, branch)? {
                return Ok(ch.key);
            }
            // A hidden record on this branch keeps the commit mapped but
            // stays deactivated; reactivation is always an explicit
            // request. This is what keeps a move's placeholder inert when
            // the old branch is synced again.
            if let Some(ch) = registry.find(changeid, branch) {
                debug!("commit {} stays on hidden change {}", p.commit_id, ch.key);
                return Ok(ch.key);
            }

            let (vanished, persisting) = classify(registry, branch, changeid, visited);
            if !persisting.is_empty() {
                let mut all: Vec<&str> = persisting.iter().map(|(_, s)| s.as_str()).collect();
                all.extend(vanished.iter().map(|(_, s)| s.as_str()));
                return Err(Error::User(format!(
                    "{} still exists on other branches ({}); \
                     use --move, --copy or --hide to say what should happen",
                    changeid,
                    all.join(", ")
                )));
            }
            match vanished.as_slice() {
                [] => {
                    let key = registry.create(changeid, branch);
                    debug!("created change {} for {} on {}", key, changeid, branch);
                    Ok(key)
                }
                [(key, src)] => {
                    // The common rename-the-branch case: a single record
                    // whose branch no longer reaches it follows the
                    // commit automatically.
                    info!("moving {} from {} to {}", changeid, src, branch);
                    let key = *key;
                    registry.get_mut(key).expect("classified key").src = branch.to_owned();
                    Ok(key)
                }
                many => {
                    let srcs: Vec<&str> = many.iter().map(|(_, s)| s.as_str()).collect();
                    Err(Error::User(format!(
                        "{} vanished from several branches ({}); \
                         pass a source with --move to disambiguate",
                        changeid,
                        srcs.join(", ")
                    )))
                }
            }
        }

        SourceAction::Move { from } => {
            if from.as_deref() == Some(branch) {
                return Err(Error::User(format!(
                    "cannot move {} from {}: that is the current branch",
                    changeid, branch
                )));
            }
            let (src_key, src_branch) = pick_source(registry, branch, changeid, from.as_deref())?;
            if let Some(existing) = registry.find(changeid, branch) {
                if !existing.hide && !existing.garbage {
                    return Err(Error::User(format!(
                        "{} already exists on {} and is not hidden",
                        changeid, branch
                    )));
                }
                // The hidden record is superseded by the moved identity.
                let stale = existing.key;
                registry.mark_garbage(stale);
            }
            // If the old branch still reaches the identifier, leave a
            // hidden placeholder so it does not look brand-new there
            // later.
            let still_there = visited
                .get(&src_branch)
                .map(|ids| ids.contains(changeid))
                .unwrap_or(false);
            if still_there {
                let key = registry.next_key;
                registry.next_key += 1;
                let mut placeholder = Change::new(key, changeid, &src_branch);
                placeholder.hide = true;
                registry.insert(placeholder);
                debug!("left hidden placeholder {} on {}", key, src_branch);
            }
            let ch = registry.get_mut(src_key).expect("picked key");
            ch.src = branch.to_owned();
            ch.hide = false;
            Ok(src_key)
        }

        SourceAction::Copy { from } => {
            if registry.active_for(changeid, branch)?.is_some() {
                return Err(Error::User(format!(
                    "{} already exists on {}; nothing to copy",
                    changeid, branch
                )));
            }
            let (src_key, _) = pick_source(registry, branch, changeid, from.as_deref())?;
            let (tgt, topic) = {
                let src = registry.get(src_key).expect("picked key");
                (src.tgt.clone(), src.topic.clone())
            };
            let key = registry.create(changeid, branch);
            let ch = registry.get_mut(key).expect("created key");
            ch.tgt = tgt;
            ch.topic = topic;
            Ok(key)
        }

        SourceAction::Hide => {
            if let Some(key) = registry.find(changeid, branch).map(|ch| ch.key) {
                registry.get_mut(key).expect("found key").hide = true;
                return Ok(key);
            }
            let key = registry.create(changeid, branch);
            registry.get_mut(key).expect("created key").hide = true;
            Ok(key)
        }

        SourceAction::Unhide => {
            let key = registry
                .find(changeid, branch)
                .map(|ch| ch.key)
                .ok_or_else(|| {
                    Error::User(format!(
                        "{} has no record on {} to unhide",
                        changeid, branch
                    ))
                })?;
            registry.get_mut(key).expect("found key").hide = false;
            Ok(key)
        }
    }
}

/// Splits the other-branch records of `changeid` into those whose branch
/// no longer reaches the identifier (vanished) and those whose branch
/// still does (persisting). Hidden records participate in neither — they
/// are deliberate user state, not ambiguity.
fn classify(
    registry: &crate::registry::ChangeRegistry,
    branch: &str,
    changeid: &str,
    visited: &HashMap<String, HashSet<String>>,
) -> (Vec<(u64, String)>, Vec<(u64, String)>) {
    let mut vanished = Vec::new();
    let mut persisting = Vec::new();
    for key in registry.keys_for_id(changeid) {
        let ch = registry.get(key).expect("indexed key");
        if ch.src == branch || ch.hide {
            continue;
        }
        let reaches = visited
            .get(&ch.src)
            .map(|ids| ids.contains(changeid))
            .unwrap_or(false);
        if reaches {
            persisting.push((key, ch.src.clone()));
        } else {
            vanished.push((key, ch.src.clone()));
        }
    }
    (vanished, persisting)
}

/// Chooses the source record for an explicit move/copy.
fn pick_source(
    registry: &crate::registry::ChangeRegistry,
    branch: &str,
    changeid: &str,
    from: Option<&str>,
) -> Result<(u64, String)> {
    if let Some(from) = from {
        return registry
            .find(changeid, from)
            .map(|ch| (ch.key, ch.src.clone()))
            .ok_or_else(|| {
                Error::User(format!("branch {} does not have change {}", from, changeid))
            });
    }
    let candidates: Vec<(u64, String)> = registry
        .keys_for_id(changeid)
        .into_iter()
        .filter_map(|key| {
            let ch = registry.get(key).expect("indexed key");
            (ch.src != branch).then(|| (key, ch.src.clone()))
        })
        .collect();
    match candidates.as_slice() {
        [] => Err(Error::User(format!(
            "no other branch has change {}",
            changeid
        ))),
        [one] => Ok(one.clone()),
        many => {
            let srcs: Vec<&str> = many.iter().map(|(_, s)| s.as_str()).collect();
            Err(Error::User(format!(
                "{} exists on several branches ({}); pass a source to disambiguate",
                changeid,
                srcs.join(", ")
            )))
        }
    }
}
