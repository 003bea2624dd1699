//! Command-line surface. Everything here is parsing and validation;
//! the engine only ever sees typed parameters.

use clap::{Args, Parser, Subcommand};
use gpush_core::context::RunOpts;

#[derive(Parser, Debug)]
#[command(name = "gpush", version, about = "Gerrit push/pull state tooling")]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct CommonOpts {
    /// Report more of what is happening
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress notices
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Compute everything but execute no mutating commands
    #[arg(short = 'n', long, global = true)]
    pub dry_run: bool,
}

impl CommonOpts {
    pub fn run_opts(&self) -> RunOpts {
        RunOpts {
            verbose: self.verbose,
            quiet: self.quiet,
            dry_run: self.dry_run,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Reconcile local commits with tracked changes and the server
    Sync {
        /// Move this commit's change from another branch (repeatable)
        #[arg(long = "move", value_name = "COMMIT")]
        mv: Vec<String>,

        /// Source branch for --move; auto-detected when omitted
        #[arg(long, value_name = "BRANCH", requires = "mv")]
        move_from: Option<String>,

        /// Copy this commit's change from another branch, keeping it
        /// active there too (repeatable)
        #[arg(long, value_name = "COMMIT")]
        copy: Vec<String>,

        /// Source branch for --copy; auto-detected when omitted
        #[arg(long, value_name = "BRANCH", requires = "copy")]
        copy_from: Option<String>,

        /// Hide this commit's change without deleting it (repeatable)
        #[arg(long, value_name = "COMMIT")]
        hide: Vec<String>,

        /// Reactivate a previously hidden change (repeatable)
        #[arg(long, value_name = "COMMIT")]
        unhide: Vec<String>,
    },

    /// Fetch from the review remote, then reconcile and garbage-collect
    Pull,

    /// Garbage-collect stale change records and cached fetch refs
    Gc {
        /// Run even if the gc interval has not elapsed
        #[arg(long)]
        force: bool,

        /// Actually delete stale refs instead of reporting them
        #[arg(long)]
        apply: bool,
    },

    /// Push personal backup branches to the review remote
    Backup {
        /// Branches to back up; defaults to the current branch
        branches: Vec<String>,
    },
}
