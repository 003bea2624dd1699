//! gpush — Gerrit push/pull state tooling.
//!
//! The binary is deliberately thin: parse arguments, initialize
//! logging, open a [`gpush_core::context::Context`], run one flow, and
//! render the resulting reports. All state logic lives in `gpush-core`.

mod cli;

use std::collections::HashMap;
use std::process::ExitCode;

use clap::Parser;
use gpush_core::context::{branch_tip, branch_upstream_tip, Context};
use gpush_core::gc::{run_gc, GcRefDeletion};
use gpush_core::report::{wrap, Report, FLOW_WIDTH};
use gpush_core::resolve::{resolve_branch, SourceAction};
use gpush_core::series::{self, SeriesMode};
use gpush_core::{Error, Result};
use log::debug;

use cli::{Cli, Command};

fn main() -> ExitCode {
    let args = Cli::parse();

    let level = if args.common.debug {
        "debug"
    } else if args.common.verbose {
        "info"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", wrap(&e.to_string(), FLOW_WIDTH));
            if e.is_user() {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            }
        }
    }
}

fn run(args: Cli) -> Result<()> {
    let opts = args.common.run_opts();
    let mut ctx = Context::open(std::path::Path::new("."), opts)?;

    match args.command {
        Command::Sync {
            mv,
            move_from,
            copy,
            copy_from,
            hide,
            unhide,
        } => {
            let actions = build_actions(&ctx, &mv, move_from, &copy, copy_from, &hide, &unhide)?;
            sync(&mut ctx, actions)?;
        }
        Command::Pull => {
            let remote = ctx.config.remote.clone();
            ctx.runner.run_mutating(&["git", "fetch", &remote])?;
            sync(&mut ctx, HashMap::new())?;
            let outcome = run_gc(&mut ctx, false, GcRefDeletion::DryRun)?;
            print_reports(&outcome.reports);
        }
        Command::Gc { force, apply } => {
            let deletion = if apply {
                GcRefDeletion::Apply
            } else {
                GcRefDeletion::DryRun
            };
            let outcome = run_gc(&mut ctx, force, deletion)?;
            if outcome.skipped && !opts.quiet {
                println!("gc interval has not elapsed; use --force to run anyway");
            }
            print_reports(&outcome.reports);
        }
        Command::Backup { branches } => backup(&mut ctx, branches)?,
    }
    Ok(())
}

/// The shared reconcile flow: map local commits to Changes, refresh
/// server truth for the involved reviews, persist.
fn sync(ctx: &mut Context, actions: HashMap<String, SourceAction>) -> Result<()> {
    let branch = ctx.head_branch()?;
    let tip = ctx
        .repo
        .head()?
        .target()
        .ok_or_else(|| Error::User("HEAD points at no commit".into()))?;
    let excludes: Vec<git2::Oid> = branch_upstream_tip(&ctx.repo, &branch).into_iter().collect();

    let outcome = resolve_branch(ctx, &branch, tip, &excludes, &actions)?;

    // The series at the tip. A fully loose run is bound into a fresh
    // group so the stack stays one unit across rebases.
    let series = series::assemble(
        &ctx.commits,
        &ctx.registry,
        &branch,
        &tip.to_string(),
        SeriesMode::WithDescendants,
    )?;
    let mut group = series.group;
    if group.is_none() {
        let keys: Vec<u64> = outcome
            .assignments
            .iter()
            .filter(|(commit, _)| series.commits.contains(commit))
            .filter(|(_, key)| {
                ctx.registry
                    .get(*key)
                    .map(|ch| ch.is_active())
                    .unwrap_or(false)
            })
            .map(|(_, key)| *key)
            .collect();
        if !keys.is_empty() {
            group = Some(ctx.registry.bind_group(&keys));
        }
    }
    if ctx.opts.verbose {
        println!(
            "{} local commits, {} new changes; series of {} (group {})",
            outcome.assignments.len(),
            outcome.created.len(),
            series.commits.len(),
            group.map(|g| g.to_string()).unwrap_or_else(|| "-".into()),
        );
    }

    // Refresh server truth for every involved review; the branch
    // tracker runs as part of the query.
    let predicates: Vec<String> = {
        let mut ids: Vec<String> = outcome
            .assignments
            .iter()
            .filter_map(|(_, key)| ctx.registry.get(*key))
            .map(|ch| format!("change:{}", ch.id))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    };
    if ctx.transport.is_some() {
        let reports = ctx.query(&predicates)?;
        print_reports(&reports);
    } else {
        debug!("no queryable remote; skipping server refresh");
    }

    ctx.save_state()?;
    Ok(())
}

/// Maps the --move/--copy/--hide/--unhide options onto commit-keyed
/// actions.
fn build_actions(
    ctx: &Context,
    mv: &[String],
    move_from: Option<String>,
    copy: &[String],
    copy_from: Option<String>,
    hide: &[String],
    unhide: &[String],
) -> Result<HashMap<String, SourceAction>> {
    let mut actions: HashMap<String, SourceAction> = HashMap::new();
    let mut insert = |spec: &str, action: SourceAction| -> Result<()> {
        let oid = resolve_commitish(ctx, spec)?;
        if actions.insert(oid.clone(), action).is_some() {
            return Err(Error::User(format!(
                "conflicting --move/--copy/--hide/--unhide options for commit {}",
                oid
            )));
        }
        Ok(())
    };
    for spec in mv {
        insert(
            spec,
            SourceAction::Move {
                from: move_from.clone(),
            },
        )?;
    }
    for spec in copy {
        insert(
            spec,
            SourceAction::Copy {
                from: copy_from.clone(),
            },
        )?;
    }
    for spec in hide {
        insert(spec, SourceAction::Hide)?;
    }
    for spec in unhide {
        insert(spec, SourceAction::Unhide)?;
    }
    Ok(actions)
}

fn resolve_commitish(ctx: &Context, spec: &str) -> Result<String> {
    let obj = ctx
        .repo
        .revparse_single(spec)
        .map_err(|_| Error::User(format!("malformed or unknown revision {:?}", spec)))?;
    let commit = obj
        .peel_to_commit()
        .map_err(|_| Error::User(format!("{:?} does not name a commit", spec)))?;
    Ok(commit.id().to_string())
}

/// Pushes branches to the personal backup namespace on the review
/// remote: `refs/personal/<user>/<branch>`.
fn backup(ctx: &mut Context, branches: Vec<String>) -> Result<()> {
    let branches = if branches.is_empty() {
        vec![ctx.head_branch()?]
    } else {
        branches
    };
    let user = backup_user(ctx)?;
    let remote = ctx.config.remote.clone();
    for branch in branches {
        let tip = branch_tip(&ctx.repo, &branch)?
            .ok_or_else(|| Error::User(format!("no local branch named {}", branch)))?;
        let refspec = format!("+{}:refs/personal/{}/{}", tip, user, branch);
        ctx.runner
            .run_mutating(&["git", "push", &remote, &refspec])?;
        if !ctx.opts.quiet {
            println!("backed up {} to refs/personal/{}/{}", branch, user, branch);
        }
    }
    Ok(())
}

fn backup_user(ctx: &Context) -> Result<String> {
    if let Some(updater) = &ctx.config.updater {
        return Ok(updater.clone());
    }
    let cfg = ctx.repo.config()?;
    let email = cfg
        .get_string("user.email")
        .map_err(|_| Error::User("set user.email or gpush.updater for backups".into()))?;
    Ok(email.split('@').next().unwrap_or(&email).to_owned())
}

fn print_reports(reports: &[Report]) {
    for report in reports {
        println!("{}", report.render());
    }
}
