//! The per-repository session object.
//!
//! `Context` owns everything that used to be ambient state: the
//! repository handle, the commit table, the Change registry, the server
//! cache, the state store and the run flags. Components take it (or the
//! fields they need) explicitly, so multi-repository and test-harness
//! use is safe — there is no hidden global state.

use std::path::Path;

use git2::{Oid, Repository};
use log::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::gerrit::{GerritCache, QueryTransport, SshTransport};
use crate::graph::CommitTable;
use crate::ledger::StateStore;
use crate::process::CmdRunner;
use crate::registry::ChangeRegistry;
use crate::report::Report;
use crate::types::DETACHED_SRC;

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOpts {
    pub verbose: bool,
    pub quiet: bool,
    pub dry_run: bool,
}

pub struct Context {
    pub repo: Repository,
    pub config: Config,
    pub opts: RunOpts,
    pub runner: CmdRunner,
    pub commits: CommitTable,
    pub registry: ChangeRegistry,
    pub gerrit: GerritCache,
    pub store: StateStore,
    /// `None` when the configured remote is absent or not queryable;
    /// operations that need the server then fail with a user error.
    pub transport: Option<Box<dyn QueryTransport>>,
}

impl Context {
    /// Opens the repository containing `path`, loads configuration and
    /// the persisted state, and wires up the ssh transport when the
    /// configured remote allows it.
    pub fn open(path: &Path, opts: RunOpts) -> Result<Context> {
        let repo = Repository::discover(path)?;
        let config = Config::load(&repo);
        let runner = CmdRunner::new(opts.dry_run);

        let transport = match remote_url(&repo, &config.remote) {
            Some(url) => match SshTransport::from_remote_url(&url, runner.clone()) {
                Ok(t) => Some(Box::new(t) as Box<dyn QueryTransport>),
                Err(e) => {
                    debug!("remote {} not queryable: {}", config.remote, e);
                    None
                }
            },
            None => {
                debug!("no remote named {}", config.remote);
                None
            }
        };

        let mut store = StateStore::new();
        let registry = store.load(&repo)?;

        Ok(Context {
            repo,
            config,
            opts,
            runner,
            commits: CommitTable::new(),
            registry,
            gerrit: GerritCache::new(),
            store,
            transport,
        })
    }

    /// Builds a context around an already-open repository and transport;
    /// the constructor used by the test harness.
    pub fn with_transport(
        repo: Repository,
        opts: RunOpts,
        transport: Option<Box<dyn QueryTransport>>,
    ) -> Result<Context> {
        let config = Config::load(&repo);
        let runner = CmdRunner::new(opts.dry_run);
        let mut store = StateStore::new();
        let registry = store.load(&repo)?;
        Ok(Context {
            repo,
            config,
            opts,
            runner,
            commits: CommitTable::new(),
            registry,
            gerrit: GerritCache::new(),
            store,
            transport,
        })
    }

    /// The checked-out branch name, or the detached sentinel.
    pub fn head_branch(&self) -> Result<String> {
        let head = self.repo.head()?;
        if !head.is_branch() {
            return Ok(DETACHED_SRC.to_owned());
        }
        Ok(head
            .shorthand()
            .map(str::to_owned)
            .unwrap_or_else(|| DETACHED_SRC.to_owned()))
    }

    /// Queries the server for `predicates` and reconciles target
    /// branches. Returns the tracker's notices.
    ///
    /// # Errors
    ///
    /// `Error::User` when no queryable remote is configured.
    pub fn query(&mut self, predicates: &[String]) -> Result<Vec<Report>> {
        let Context {
            transport,
            gerrit,
            registry,
            opts,
            config,
            ..
        } = self;
        let transport = transport.as_deref_mut().ok_or_else(|| {
            Error::User(format!(
                "remote {:?} is not a queryable gerrit remote; \
                 set gpush.remote to an ssh remote",
                config.remote
            ))
        })?;
        let (_refreshed, reports) =
            crate::gerrit::refresh(transport, gerrit, registry, opts.quiet, predicates)?;
        Ok(reports)
    }

    /// Persists the registry if anything changed. Returns whether a
    /// write happened.
    pub fn save_state(&mut self) -> Result<bool> {
        let Context {
            repo,
            registry,
            store,
            opts,
            ..
        } = self;
        store.save(repo, registry, opts.dry_run)
    }
}

/// URL of a named remote, if it exists.
pub fn remote_url(repo: &Repository, name: &str) -> Option<String> {
    repo.find_remote(name)
        .ok()
        .and_then(|r| r.url().map(str::to_owned))
}

/// Tip of a local branch, `None` when the branch does not exist.
pub fn branch_tip(repo: &Repository, branch: &str) -> Result<Option<Oid>> {
    match repo.find_branch(branch, git2::BranchType::Local) {
        Ok(b) => Ok(b.get().target()),
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Tip of a local branch's upstream, when one is configured and valid.
pub fn branch_upstream_tip(repo: &Repository, branch: &str) -> Option<Oid> {
    repo.find_branch(branch, git2::BranchType::Local)
        .ok()?
        .upstream()
        .ok()?
        .get()
        .target()
}
