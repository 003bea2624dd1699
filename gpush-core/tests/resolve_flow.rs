//! End-to-end source-map resolution against real repositories: change
//! creation, idempotent re-runs, branch moves, copies and hiding.

mod common;

use std::collections::HashMap;

use gpush_core::context::{Context, RunOpts};
use gpush_core::resolve::{resolve_branch, SourceAction};
use gpush_core::series::{assemble, SeriesMode};
use gpush_core::Error;

fn no_actions() -> HashMap<String, SourceAction> {
    HashMap::new()
}

#[test]
fn new_commits_become_changes_oldest_first() {
    let (_dir, repo) = common::scratch_repo();
    let a = common::commit_change(&repo, "dev", "first", "Iaaaa");
    let b = common::commit_change(&repo, "dev", "second", "Ibbbb");

    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    let outcome = resolve_branch(&mut ctx, "dev", b, &[], &no_actions()).unwrap();

    assert_eq!(
        outcome.assignments,
        vec![(a.to_string(), 10000), (b.to_string(), 10001)]
    );
    assert_eq!(outcome.created, vec![10000, 10001]);
    assert_eq!(ctx.registry.get(10000).unwrap().id, "Iaaaa");
    assert_eq!(ctx.registry.get(10001).unwrap().src, "dev");
}

#[test]
fn rerun_reuses_changes_and_writes_nothing() {
    let (dir, repo) = common::scratch_repo();
    let a = common::commit_change(&repo, "dev", "first", "Iaaaa");

    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    resolve_branch(&mut ctx, "dev", a, &[], &no_actions()).unwrap();
    assert!(ctx.save_state().unwrap());

    // A fresh process maps the same commit to the same change and has
    // nothing to persist.
    let repo = git2::Repository::open(dir.path()).unwrap();
    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    let outcome = resolve_branch(&mut ctx, "dev", a, &[], &no_actions()).unwrap();
    assert_eq!(outcome.assignments, vec![(a.to_string(), 10000)]);
    assert!(outcome.created.is_empty());
    assert!(!ctx.save_state().unwrap());
}

#[test]
fn commit_without_changeid_is_rejected() {
    let (_dir, repo) = common::scratch_repo();
    let a = common::commit_raw(&repo, "dev", "no trailer", "no trailer\n\nbody\n");

    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    let err = resolve_branch(&mut ctx, "dev", a, &[], &no_actions()).unwrap_err();
    assert!(matches!(err, Error::User(_)));
}

#[test]
fn duplicate_changeid_on_one_branch_is_fatal() {
    let (_dir, repo) = common::scratch_repo();
    common::commit_change(&repo, "dev", "first", "Iaaaa");
    let b = common::commit_change(&repo, "dev", "second", "Iaaaa");

    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    let err = resolve_branch(&mut ctx, "dev", b, &[], &no_actions()).unwrap_err();
    assert!(matches!(err, Error::State(_)));
}

#[test]
fn vanished_source_moves_automatically() {
    let (dir, repo) = common::scratch_repo();
    let a = common::commit_change(&repo, "feature", "work", "Iaaaa");

    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    resolve_branch(&mut ctx, "feature", a, &[], &no_actions()).unwrap();
    ctx.save_state().unwrap();

    // Rename the branch out from under the record.
    common::branch_at(&ctx.repo, "dev", a);
    common::delete_branch(&ctx.repo, "feature");

    let repo = git2::Repository::open(dir.path()).unwrap();
    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    let outcome = resolve_branch(&mut ctx, "dev", a, &[], &no_actions()).unwrap();

    // The record follows the commit, keeping its key.
    assert_eq!(outcome.assignments, vec![(a.to_string(), 10000)]);
    assert!(outcome.created.is_empty());
    assert_eq!(ctx.registry.get(10000).unwrap().src, "dev");
}

#[test]
fn persisting_elsewhere_needs_an_explicit_action() {
    let (dir, repo) = common::scratch_repo();
    let f = common::commit_change(&repo, "feature", "work", "Iaaaa");

    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    resolve_branch(&mut ctx, "feature", f, &[], &no_actions()).unwrap();
    ctx.save_state().unwrap();

    // A cherry-picked twin on another branch, while feature still exists.
    let d = common::commit_change(&ctx.repo, "dev", "work again", "Iaaaa");

    let repo = git2::Repository::open(dir.path()).unwrap();
    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    let err = resolve_branch(&mut ctx, "dev", d, &[], &no_actions()).unwrap_err();
    match err {
        Error::User(msg) => assert!(msg.contains("feature"), "message: {}", msg),
        other => panic!("expected a user error, got {:?}", other),
    }
}

#[test]
fn move_leaves_a_hidden_placeholder_on_a_live_source() {
    let (dir, repo) = common::scratch_repo();
    let f = common::commit_change(&repo, "feature", "work", "Iaaaa");

    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    resolve_branch(&mut ctx, "feature", f, &[], &no_actions()).unwrap();
    ctx.save_state().unwrap();
    let d = common::commit_change(&ctx.repo, "dev", "work again", "Iaaaa");

    let repo = git2::Repository::open(dir.path()).unwrap();
    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    let mut actions = HashMap::new();
    actions.insert(d.to_string(), SourceAction::Move { from: None });
    let outcome = resolve_branch(&mut ctx, "dev", d, &[], &actions).unwrap();

    assert_eq!(outcome.assignments, vec![(d.to_string(), 10000)]);
    let moved = ctx.registry.get(10000).unwrap();
    assert_eq!(moved.src, "dev");
    assert!(moved.is_active());

    // The still-reachable identifier on feature keeps a hidden record so
    // it does not look brand-new there later.
    let placeholder = ctx.registry.find("Iaaaa", "feature").unwrap();
    assert_eq!(placeholder.key, 10001);
    assert!(placeholder.hide);
}

#[test]
fn copy_keeps_the_source_active() {
    let (dir, repo) = common::scratch_repo();
    let f = common::commit_change(&repo, "feature", "work", "Iaaaa");

    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    resolve_branch(&mut ctx, "feature", f, &[], &no_actions()).unwrap();
    {
        let ch = ctx.registry.get_mut(10000).unwrap();
        ch.tgt = Some("main".into());
        ch.topic = Some("cleanup".into());
    }
    ctx.save_state().unwrap();
    let d = common::commit_change(&ctx.repo, "dev", "work again", "Iaaaa");

    let repo = git2::Repository::open(dir.path()).unwrap();
    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    let mut actions = HashMap::new();
    actions.insert(d.to_string(), SourceAction::Copy { from: None });
    let outcome = resolve_branch(&mut ctx, "dev", d, &[], &actions).unwrap();

    assert_eq!(outcome.assignments, vec![(d.to_string(), 10001)]);
    assert_eq!(outcome.created, vec![10001]);
    let copy = ctx.registry.get(10001).unwrap();
    assert_eq!(copy.src, "dev");
    assert_eq!(copy.tgt.as_deref(), Some("main"));
    assert_eq!(copy.topic.as_deref(), Some("cleanup"));
    // The original stays active on its branch.
    assert!(ctx.registry.get(10000).unwrap().is_active());
    assert_eq!(ctx.registry.get(10000).unwrap().src, "feature");
}

#[test]
fn hide_survives_a_plain_rerun() {
    let (dir, repo) = common::scratch_repo();
    let a = common::commit_change(&repo, "dev", "first", "Iaaaa");

    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    let mut actions = HashMap::new();
    actions.insert(a.to_string(), SourceAction::Hide);
    let outcome = resolve_branch(&mut ctx, "dev", a, &[], &actions).unwrap();
    assert_eq!(outcome.assignments, vec![(a.to_string(), 10000)]);
    assert!(!ctx.registry.get(10000).unwrap().is_active());
    ctx.save_state().unwrap();

    // A plain re-run in a fresh process still maps the commit to the
    // hidden record, without reactivating it.
    let repo = git2::Repository::open(dir.path()).unwrap();
    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    let outcome = resolve_branch(&mut ctx, "dev", a, &[], &no_actions()).unwrap();
    assert_eq!(outcome.assignments, vec![(a.to_string(), 10000)]);
    assert!(outcome.created.is_empty());
    assert!(!ctx.registry.get(10000).unwrap().is_active());
    assert!(!ctx.save_state().unwrap());
}

#[test]
fn unhide_is_an_explicit_action() {
    let (_dir, repo) = common::scratch_repo();
    let a = common::commit_change(&repo, "dev", "first", "Iaaaa");

    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    let mut actions = HashMap::new();
    actions.insert(a.to_string(), SourceAction::Hide);
    resolve_branch(&mut ctx, "dev", a, &[], &actions).unwrap();
    assert!(!ctx.registry.get(10000).unwrap().is_active());

    let mut actions = HashMap::new();
    actions.insert(a.to_string(), SourceAction::Unhide);
    let outcome = resolve_branch(&mut ctx, "dev", a, &[], &actions).unwrap();
    assert_eq!(outcome.assignments, vec![(a.to_string(), 10000)]);
    assert!(outcome.created.is_empty());
    assert!(ctx.registry.get(10000).unwrap().is_active());
}

#[test]
fn unhide_without_a_record_is_rejected() {
    let (_dir, repo) = common::scratch_repo();
    let a = common::commit_change(&repo, "dev", "first", "Iaaaa");

    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    let mut actions = HashMap::new();
    actions.insert(a.to_string(), SourceAction::Unhide);
    let err = resolve_branch(&mut ctx, "dev", a, &[], &actions).unwrap_err();
    assert!(matches!(err, Error::User(_)));
}

#[test]
fn move_placeholder_survives_a_sync_of_the_old_branch() {
    let (dir, repo) = common::scratch_repo();
    let f = common::commit_change(&repo, "feature", "work", "Iaaaa");

    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    resolve_branch(&mut ctx, "feature", f, &[], &no_actions()).unwrap();
    ctx.save_state().unwrap();
    let d = common::commit_change(&ctx.repo, "dev", "work again", "Iaaaa");

    let repo = git2::Repository::open(dir.path()).unwrap();
    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    let mut actions = HashMap::new();
    actions.insert(d.to_string(), SourceAction::Move { from: None });
    resolve_branch(&mut ctx, "dev", d, &[], &actions).unwrap();
    ctx.save_state().unwrap();

    // Syncing the old branch again must not wake the placeholder up; the
    // review would otherwise be active on both branches at once.
    let repo = git2::Repository::open(dir.path()).unwrap();
    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    let outcome = resolve_branch(&mut ctx, "feature", f, &[], &no_actions()).unwrap();
    assert_eq!(outcome.assignments, vec![(f.to_string(), 10001)]);
    assert!(outcome.created.is_empty());

    let placeholder = ctx.registry.get(10001).unwrap();
    assert_eq!(placeholder.src, "feature");
    assert!(placeholder.hide, "placeholder must stay hidden");
    let moved = ctx.registry.get(10000).unwrap();
    assert_eq!(moved.src, "dev");
    assert!(moved.is_active());
    assert!(!ctx.save_state().unwrap());
}

#[test]
fn move_from_the_current_branch_is_rejected() {
    let (_dir, repo) = common::scratch_repo();
    let d = common::commit_change(&repo, "dev", "work", "Iaaaa");

    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    resolve_branch(&mut ctx, "dev", d, &[], &no_actions()).unwrap();

    let mut actions = HashMap::new();
    actions.insert(
        d.to_string(),
        SourceAction::Move {
            from: Some("dev".into()),
        },
    );
    let err = resolve_branch(&mut ctx, "dev", d, &[], &actions).unwrap_err();
    assert!(matches!(err, Error::User(_)));
    // The record is untouched, not garbage-marked out of the ledger.
    let ch = ctx.registry.get(10000).unwrap();
    assert!(ch.is_active());
    assert_eq!(ch.src, "dev");
}

#[test]
fn resolved_tip_series_binds_into_one_group() {
    let (_dir, repo) = common::scratch_repo();
    let a = common::commit_change(&repo, "dev", "first", "Iaaaa");
    let b = common::commit_change(&repo, "dev", "second", "Ibbbb");

    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    let outcome = resolve_branch(&mut ctx, "dev", b, &[], &no_actions()).unwrap();

    // Freshly created changes form one loose run at the tip.
    let series = assemble(
        &ctx.commits,
        &ctx.registry,
        "dev",
        &b.to_string(),
        SeriesMode::WithDescendants,
    )
    .unwrap();
    assert_eq!(series.commits, vec![a.to_string(), b.to_string()]);
    assert_eq!(series.group, None);

    let keys: Vec<u64> = outcome.assignments.iter().map(|(_, k)| *k).collect();
    let grp = ctx.registry.bind_group(&keys);
    assert_eq!(grp, 1);

    // Bound, the same series comes back from either anchor.
    for anchor in [a, b] {
        let series = assemble(
            &ctx.commits,
            &ctx.registry,
            "dev",
            &anchor.to_string(),
            SeriesMode::WithDescendants,
        )
        .unwrap();
        assert_eq!(series.commits, vec![a.to_string(), b.to_string()]);
        assert_eq!(series.group, Some(1));
    }
}

#[test]
fn explicit_move_source_must_hold_the_change() {
    let (_dir, repo) = common::scratch_repo();
    let d = common::commit_change(&repo, "dev", "work", "Iaaaa");

    let mut ctx = Context::with_transport(repo, RunOpts::default(), None).unwrap();
    let mut actions = HashMap::new();
    actions.insert(
        d.to_string(),
        SourceAction::Move {
            from: Some("nowhere".into()),
        },
    );
    let err = resolve_branch(&mut ctx, "dev", d, &[], &actions).unwrap_err();
    assert!(matches!(err, Error::User(_)));
}
