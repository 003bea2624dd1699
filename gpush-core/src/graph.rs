//! Commit graph ingestion.
//!
//! Walks local history with git2 revwalks and maintains the process-wide
//! commit table. Traversal is incremental: a commit id already in the
//! table is never re-processed, so repeated walks that pass previously
//! seen tips as exclusions cost time proportional to new history only.

use std::collections::{HashMap, HashSet};

use git2::{Oid, Repository, Sort};
use log::debug;

use crate::error::{Error, Result};
use crate::types::{Commit, Ident};

/// Whether a missing `Change-Id:` trailer is an error.
///
/// Pushing requires an identifier on every commit; read-only enumeration
/// (other-branch visitation, GC sweeps) tolerates commits without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeIdMode {
    Require,
    Allow,
}

/// Traversal scope. Series analysis follows first parents only; existence
/// checks walk all parents so merged-in side branches still count as
/// reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkScope {
    FirstParent,
    Full,
}

/// Process-wide table of every commit visited during this run.
///
/// Keyed by commit id; a commit is created the first time its id is seen
/// and is immutable afterwards apart from the first-parent child link
/// assigned during series analysis. Entries are never removed within a
/// run.
#[derive(Debug, Default)]
pub struct CommitTable {
    commits: HashMap<String, Commit>,
}

impl CommitTable {
    pub fn new() -> Self {
        CommitTable::default()
    }

    pub fn get(&self, id: &str) -> Option<&Commit> {
        self.commits.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.commits.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Registers a freshly visited commit.
    ///
    /// # Errors
    ///
    /// `Error::Internal` if the id is already present — the same commit
    /// must never be instantiated twice.
    pub fn register(&mut self, commit: Commit) -> Result<()> {
        if self.commits.contains_key(&commit.id) {
            return Err(Error::Internal(format!(
                "commit {} instantiated twice",
                commit.id
            )));
        }
        self.commits.insert(commit.id.clone(), commit);
        Ok(())
    }

    /// Assigns first-parent child links along a branch chain given
    /// oldest-first. Links from a previous chain on the same commits are
    /// overwritten; the tip's link is cleared.
    pub fn link_chain(&mut self, ids: &[String]) {
        for pair in ids.windows(2) {
            if let Some(c) = self.commits.get_mut(&pair[0]) {
                c.fp_child = Some(pair[1].clone());
            }
        }
        if let Some(tip) = ids.last() {
            if let Some(c) = self.commits.get_mut(tip) {
                c.fp_child = None;
            }
        }
    }
}

/// Extracts the review identifier from a commit message.
///
/// The identifier is the value of a `Change-Id:` trailer line; when the
/// message carries several, the last one is authoritative.
pub fn parse_changeid(message: &str) -> Option<String> {
    let mut found = None;
    for line in message.lines() {
        if let Some(rest) = line.strip_prefix("Change-Id:") {
            let token = rest.trim();
            if !token.is_empty() && !token.contains(char::is_whitespace) {
                found = Some(token.to_owned());
            }
        }
    }
    found
}

fn ident_of(sig: &git2::Signature<'_>) -> Ident {
    Ident {
        name: String::from_utf8_lossy(sig.name_bytes()).into_owned(),
        email: String::from_utf8_lossy(sig.email_bytes()).into_owned(),
        when: sig.when().seconds(),
    }
}

fn load_commit(repo: &Repository, oid: Oid, mode: ChangeIdMode) -> Result<Commit> {
    let c = repo.find_commit(oid)?;
    let message = String::from_utf8_lossy(c.message_raw_bytes()).into_owned();
    let changeid = parse_changeid(&message);
    if changeid.is_none() && mode == ChangeIdMode::Require {
        return Err(Error::User(format!(
            "commit {} has no Change-Id; amend the commit message before pushing",
            oid
        )));
    }
    let subject = message.lines().next().unwrap_or("").to_owned();
    let author = ident_of(&c.author());
    let committer = ident_of(&c.committer());
    Ok(Commit {
        id: oid.to_string(),
        parents: c.parent_ids().map(|p| p.to_string()).collect(),
        tree: c.tree_id().to_string(),
        changeid,
        subject,
        message,
        author,
        committer,
        fp_child: None,
    })
}

fn walker<'a>(
    repo: &'a Repository,
    tips: &[Oid],
    excludes: &[Oid],
    scope: WalkScope,
) -> Result<git2::Revwalk<'a>> {
    let mut walk = repo.revwalk()?;
    walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
    if scope == WalkScope::FirstParent {
        walk.simplify_first_parent()?;
    }
    for tip in tips {
        walk.push(*tip)?;
    }
    for ex in excludes {
        // Hiding an unknown object is tolerated; a boundary that was
        // rewritten away just stops excluding anything.
        if repo.find_commit(*ex).is_ok() {
            walk.hide(*ex)?;
        }
    }
    Ok(walk)
}

/// Walks from `tips` down to `excludes` and registers every commit not
/// already in the table. Returns the newly registered ids, oldest first.
///
/// # Errors
///
/// `Error::User` when `mode` is `Require` and a commit lacks a Change-Id
/// trailer; git errors otherwise.
pub fn visit_commits(
    repo: &Repository,
    table: &mut CommitTable,
    tips: &[Oid],
    excludes: &[Oid],
    scope: WalkScope,
    mode: ChangeIdMode,
) -> Result<Vec<String>> {
    let mut new_ids = Vec::new();
    for oid in walker(repo, tips, excludes, scope)? {
        let oid = oid?;
        let id = oid.to_string();
        if table.contains(&id) {
            continue;
        }
        table.register(load_commit(repo, oid, mode)?)?;
        new_ids.push(id);
    }
    debug!("visited {} new commits", new_ids.len());
    Ok(new_ids)
}

/// Returns the full first-parent chain from `tip` down to `excludes`,
/// oldest first, registering commits not yet in the table.
///
/// Unlike `visit_commits`, already-known commits stay in the returned
/// order — callers use the chain to assign branch links and to enumerate
/// the branch's local commits.
pub fn first_parent_chain(
    repo: &Repository,
    table: &mut CommitTable,
    tip: Oid,
    excludes: &[Oid],
    mode: ChangeIdMode,
) -> Result<Vec<String>> {
    let mut chain = Vec::new();
    for oid in walker(repo, &[tip], excludes, WalkScope::FirstParent)? {
        let oid = oid?;
        let id = oid.to_string();
        if !table.contains(&id) {
            table.register(load_commit(repo, oid, mode)?)?;
        }
        chain.push(id);
    }
    Ok(chain)
}

/// Collects every review identifier reachable from `tips` (full-parent
/// traversal), registering unknown commits along the way. Commits without
/// an identifier are skipped.
pub fn collect_changeids(
    repo: &Repository,
    table: &mut CommitTable,
    tips: &[Oid],
    excludes: &[Oid],
) -> Result<HashSet<String>> {
    let mut ids = HashSet::new();
    for oid in walker(repo, tips, excludes, WalkScope::Full)? {
        let oid = oid?;
        let id = oid.to_string();
        if !table.contains(&id) {
            table.register(load_commit(repo, oid, ChangeIdMode::Allow)?)?;
        }
        if let Some(cid) = table.get(&id).and_then(|c| c.changeid.clone()) {
            ids.insert(cid);
        }
    }
    Ok(ids)
}
