//! Shared scratch-repository helpers for the integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use git2::{BranchType, Oid, Repository};
use tempfile::TempDir;

use gpush_core::gerrit::QueryTransport;
use gpush_core::Result;

/// A fresh repository in a temporary directory, with enough config to
/// create commits.
pub fn scratch_repo() -> (TempDir, Repository) {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path()).unwrap();
    let mut cfg = repo.config().unwrap();
    cfg.set_str("user.name", "Test Author").unwrap();
    cfg.set_str("user.email", "author@example.com").unwrap();
    (dir, repo)
}

/// Commits onto `branch` (creating it when missing) with a `Change-Id:`
/// trailer in the message.
pub fn commit_change(repo: &Repository, branch: &str, subject: &str, changeid: &str) -> Oid {
    commit_raw(
        repo,
        branch,
        subject,
        &format!("{}\n\nChange-Id: {}\n", subject, changeid),
    )
}

/// Commits onto `branch` with a verbatim message. The subject doubles as
/// file content so every commit gets a distinct tree.
pub fn commit_raw(repo: &Repository, branch: &str, subject: &str, message: &str) -> Oid {
    let sig = repo.signature().unwrap();
    let blob = repo.blob(format!("{}\n", subject).as_bytes()).unwrap();
    let mut builder = repo.treebuilder(None).unwrap();
    builder.insert("file", blob, 0o100644).unwrap();
    let tree = repo.find_tree(builder.write().unwrap()).unwrap();

    let parent = repo
        .find_branch(branch, BranchType::Local)
        .ok()
        .map(|b| b.get().peel_to_commit().unwrap());
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    repo.commit(
        Some(&format!("refs/heads/{}", branch)),
        &sig,
        &sig,
        message,
        &tree,
        &parents,
    )
    .unwrap()
}

pub fn branch_at(repo: &Repository, name: &str, oid: Oid) {
    let commit = repo.find_commit(oid).unwrap();
    repo.branch(name, &commit, false).unwrap();
}

pub fn delete_branch(repo: &Repository, name: &str) {
    repo.find_branch(name, BranchType::Local)
        .unwrap()
        .delete()
        .unwrap();
}

pub fn tip_of(repo: &Repository, branch: &str) -> Oid {
    repo.find_branch(branch, BranchType::Local)
        .unwrap()
        .get()
        .target()
        .unwrap()
}

/// Transport that replays canned response lines and records every query
/// batch it receives.
pub struct FakeTransport {
    lines: Vec<String>,
    queries: Rc<RefCell<Vec<Vec<String>>>>,
}

impl FakeTransport {
    pub fn new(lines: Vec<String>) -> (Self, Rc<RefCell<Vec<Vec<String>>>>) {
        let queries = Rc::new(RefCell::new(Vec::new()));
        let transport = FakeTransport {
            lines,
            queries: Rc::clone(&queries),
        };
        (transport, queries)
    }
}

impl QueryTransport for FakeTransport {
    fn query(&mut self, predicates: &[String]) -> Result<Vec<String>> {
        self.queries.borrow_mut().push(predicates.to_vec());
        Ok(self.lines.clone())
    }
}

/// One line of `gerrit query --format JSON` output for a change with the
/// given patch sets as (number, revision) pairs.
pub fn change_json(
    number: u64,
    id: &str,
    status: &str,
    branch: &str,
    patch_sets: &[(u32, &str)],
) -> String {
    let sets: Vec<serde_json::Value> = patch_sets
        .iter()
        .map(|&(n, rev)| {
            serde_json::json!({
                "number": n,
                "revision": rev,
                "ref": format!("refs/changes/00/{}/{}", number, n),
                "createdOn": 1_700_000_000 + i64::from(n),
            })
        })
        .collect();
    serde_json::json!({
        "project": "tools",
        "number": number,
        "id": id,
        "subject": format!("change {}", number),
        "status": status,
        "branch": branch,
        "patchSets": sets,
    })
    .to_string()
}
