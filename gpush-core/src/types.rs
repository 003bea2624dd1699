//! Core data model: commits as seen by the engine, and the Change records
//! that map them onto review-server entities.
//!
//! Optional string fields use `Option<String>` throughout so that "absent"
//! and "empty string" stay distinct — the ledger serializes them
//! differently and the distinction is meaningful (an empty topic clears
//! the server topic; an absent one leaves it alone).

/// Branch sentinel recorded in `Change::src` for work done on a detached
/// HEAD.
pub const DETACHED_SRC: &str = "-";

/// First key handed out by a fresh registry. Keys below this are reserved
/// so that hand-edited ledgers are recognizable.
pub const FIRST_CHANGE_KEY: u64 = 10000;

/// One identity triple from a commit header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    pub name: String,
    pub email: String,
    /// Seconds since the Unix epoch.
    pub when: i64,
}

/// One local commit, immutable once registered in the commit table.
///
/// `changeid` holds the review identifier parsed from the last
/// `Change-Id:` trailer in the message; `None` when the message carries
/// no trailer (tolerated only in enumeration contexts).
///
/// `fp_child` is the first-parent child link on the branch currently
/// under analysis. It is assigned when a branch chain is linked, not at
/// registration time, because a commit's child depends on which branch
/// is being looked at.
#[derive(Debug, Clone)]
pub struct Commit {
    pub id: String,
    /// Ordered parent ids; the first parent is the mainline ancestor.
    pub parents: Vec<String>,
    pub tree: String,
    pub changeid: Option<String>,
    pub subject: String,
    pub message: String,
    pub author: Ident,
    pub committer: Ident,
    pub fp_child: Option<String>,
}

impl Commit {
    /// The first-parent ancestor id, if the commit is not a root.
    pub fn first_parent(&self) -> Option<&str> {
        self.parents.first().map(String::as_str)
    }
}

/// One unit of review, independent of any single commit.
///
/// A Change is identified locally by `key` (monotonic, stable across
/// restarts) and correlated with the server by `id` (the Change-Id).
/// Several Change records may share an `id` as long as they live on
/// different local branches — the same review can exist on more than one
/// branch at once (cherry-picks) — but at most one non-hidden record per
/// (`id`, branch) pair is active at a time.
#[derive(Debug, Clone, Default)]
pub struct Change {
    /// Locally assigned sequence number; the stable local identity.
    pub key: u64,
    /// Server-assigned review identifier (Change-Id), stable across pushes.
    pub id: String,
    /// Series/group identifier; set when the Change is bound into a stack.
    pub grp: Option<u64>,
    /// Local branch this Change currently lives on (`DETACHED_SRC` for
    /// detached work).
    pub src: String,
    /// Target branch. Mirrors the server's authoritative branch once
    /// queried; `None` for records written by versions that never
    /// recorded one.
    pub tgt: Option<String>,
    /// Cached server topic.
    pub topic: Option<String>,
    /// SHA the series was last pushed on top of.
    pub base: Option<String>,
    /// SHA of the commit most recently pushed as this Change.
    pub pushed: Option<String>,
    /// The local commit SHA that `pushed` was derived from. Differs from
    /// the current local commit when content was amended but not yet
    /// pushed.
    pub orig: Option<String>,
    /// Excluded from push by the user.
    pub exclude: bool,
    /// Deactivated without being deleted.
    pub hide: bool,
    /// Pending target branch, not yet pushed.
    pub ntgt: Option<String>,
    /// Pending topic, not yet pushed.
    pub ntopic: Option<String>,
    /// Pending push base, not yet pushed.
    pub nbase: Option<String>,
    /// Logically deleted. Garbage records are skipped by every lookup and
    /// omitted from the serialized ledger; they are never physically
    /// erased within a run.
    pub garbage: bool,
}

impl Change {
    pub fn new(key: u64, id: &str, src: &str) -> Self {
        Change {
            key,
            id: id.to_owned(),
            src: src.to_owned(),
            ..Change::default()
        }
    }

    /// True when the record participates in lookups: not hidden, not
    /// garbage.
    pub fn is_active(&self) -> bool {
        !self.hide && !self.garbage
    }
}

/// Review status reported by the server.
///
/// Anything that is not `Merged` or `Abandoned` is non-terminal: the
/// Change is still actionable and must be kept alive by the garbage
/// collector regardless of local reachability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewStatus {
    New,
    Merged,
    Abandoned,
    /// Any other open state the server may report (e.g. drafts on older
    /// servers). Treated as non-terminal.
    Other(String),
}

impl ReviewStatus {
    pub fn from_server(s: &str) -> Self {
        match s {
            "NEW" => ReviewStatus::New,
            "MERGED" => ReviewStatus::Merged,
            "ABANDONED" => ReviewStatus::Abandoned,
            other => ReviewStatus::Other(other.to_owned()),
        }
    }

    /// Terminal states are no longer actionable on the server.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReviewStatus::Merged | ReviewStatus::Abandoned)
    }
}

/// One patch set of a server-side Change.
#[derive(Debug, Clone)]
pub struct PatchSet {
    pub number: u32,
    /// Seconds since the Unix epoch.
    pub created: i64,
    /// Commit SHA of this revision.
    pub revision: String,
    /// SHA the revision was pushed on top of, when the server knows it.
    pub push_base: Option<String>,
    /// Ref to fetch this revision from (`refs/changes/...`).
    pub ref_name: String,
}

/// Cached snapshot of a remote Change's server-side truth.
///
/// Refreshed on every query batch; only the per-patchset fetched-ref
/// mapping is persisted across runs.
#[derive(Debug, Clone)]
pub struct GerritInfo {
    /// Server-assigned numeric key.
    pub number: u64,
    /// Change-Id.
    pub id: String,
    pub subject: String,
    pub status: ReviewStatus,
    /// Authoritative target branch.
    pub branch: String,
    pub topic: Option<String>,
    /// Ordered by patch-set number.
    pub patch_sets: Vec<PatchSet>,
    /// Reviewer emails (or usernames when no email is exposed).
    pub reviewers: Vec<String>,
}

impl GerritInfo {
    /// The current (highest-numbered) patch set.
    pub fn current_patch_set(&self) -> Option<&PatchSet> {
        self.patch_sets.iter().max_by_key(|ps| ps.number)
    }
}
