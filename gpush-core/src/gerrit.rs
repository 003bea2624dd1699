//! Review-server query client.
//!
//! Issues one batched `gerrit query` per request over ssh and parses the
//! line-delimited JSON response into `GerritInfo` records. The transport
//! is a trait so tests (and future REST support) can substitute the ssh
//! invocation.

use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::process::CmdRunner;
use crate::registry::ChangeRegistry;
use crate::report::Report;
use crate::track;
use crate::types::{GerritInfo, PatchSet, ReviewStatus};

/// Issues one batched query and returns the raw response lines.
pub trait QueryTransport {
    fn query(&mut self, predicates: &[String]) -> Result<Vec<String>>;
}

/// ssh-based transport against a `gerrit query` capable server.
pub struct SshTransport {
    runner: CmdRunner,
    /// Leading argv: `ssh [-p PORT] user@host gerrit query ...`.
    ssh_args: Vec<String>,
}

impl SshTransport {
    /// Builds a transport from a remote URL of the form
    /// `ssh://[user@]host[:port]/project`.
    ///
    /// # Errors
    ///
    /// `Error::User` for URLs this tool cannot query over (http remotes,
    /// local paths).
    pub fn from_remote_url(url: &str, runner: CmdRunner) -> Result<Self> {
        let rest = url.strip_prefix("ssh://").ok_or_else(|| {
            Error::User(format!(
                "remote url {:?} is not an ssh gerrit remote; set gpush.remote",
                url
            ))
        })?;
        let host_part = rest.split('/').next().unwrap_or(rest);
        let (host, port) = match host_part.rsplit_once(':') {
            Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
                (h.to_owned(), Some(p.to_owned()))
            }
            _ => (host_part.to_owned(), None),
        };
        if host.is_empty() {
            return Err(Error::User(format!("remote url {:?} has no host", url)));
        }
        let mut ssh_args = vec!["ssh".to_owned()];
        if let Some(port) = port {
            ssh_args.push("-p".to_owned());
            ssh_args.push(port);
        }
        ssh_args.push(host);
        Ok(SshTransport { runner, ssh_args })
    }
}

impl QueryTransport for SshTransport {
    fn query(&mut self, predicates: &[String]) -> Result<Vec<String>> {
        let joined = predicates
            .iter()
            .map(|p| format!("({})", p))
            .collect::<Vec<_>>()
            .join(" OR ");
        let mut argv: Vec<&str> = self.ssh_args.iter().map(String::as_str).collect();
        argv.extend([
            "gerrit",
            "query",
            "--format",
            "JSON",
            "--patch-sets",
            "--all-reviewers",
            "--",
            &joined,
        ]);
        self.runner.stream_lines(&argv, None)
    }
}

fn de_opt_u64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u64>, D::Error> {
    // Older servers emit numbers as JSON strings.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(u64),
        Str(String),
    }
    Ok(match Option::<NumOrStr>::deserialize(d)? {
        None => None,
        Some(NumOrStr::Num(n)) => Some(n),
        Some(NumOrStr::Str(s)) => s.parse().ok(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPatchSet {
    #[serde(default, deserialize_with = "de_opt_u64")]
    number: Option<u64>,
    #[serde(default)]
    revision: Option<String>,
    #[serde(default, rename = "ref")]
    ref_name: Option<String>,
    #[serde(default)]
    created_on: Option<i64>,
    #[serde(default)]
    base: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChange {
    #[serde(default, deserialize_with = "de_opt_u64")]
    number: Option<u64>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    patch_sets: Vec<RawPatchSet>,
    #[serde(default)]
    all_reviewers: Vec<RawAccount>,
}

fn require<T>(field: Option<T>, what: &str, context: &str) -> Result<T> {
    field.ok_or_else(|| Error::Proto(format!("{} missing {}", context, what)))
}

/// Parses one response line.
///
/// Returns `Ok(None)` for objects that are not change records — rows
/// lacking `number` or `id`, such as the trailing stats row — and
/// `Error::Proto` when a change record is missing a mandatory field.
pub fn parse_info_line(line: &str) -> Result<Option<GerritInfo>> {
    let raw: RawChange = serde_json::from_str(line)?;
    let (number, id) = match (raw.number, raw.id) {
        (Some(n), Some(i)) => (n, i),
        _ => return Ok(None),
    };
    let context = format!("change {}", number);

    let status = ReviewStatus::from_server(&require(raw.status, "status", &context)?);
    let branch = require(raw.branch, "branch", &context)?;

    let mut patch_sets = Vec::with_capacity(raw.patch_sets.len());
    for ps in raw.patch_sets {
        let ps_number = require(ps.number, "patchSets[].number", &context)?;
        let ps_number = u32::try_from(ps_number).map_err(|_| {
            Error::Proto(format!("{}: patch set number {} out of range", context, ps_number))
        })?;
        let revision = require(ps.revision, "patchSets[].revision", &context)?;
        patch_sets.push(PatchSet {
            number: ps_number,
            created: ps.created_on.unwrap_or(0),
            revision,
            push_base: ps.base,
            ref_name: ps.ref_name.unwrap_or_default(),
        });
    }
    patch_sets.sort_by_key(|ps| ps.number);

    let reviewers = raw
        .all_reviewers
        .into_iter()
        .filter_map(|a| a.email.or(a.username))
        .collect();

    Ok(Some(GerritInfo {
        number,
        id,
        subject: raw.subject.unwrap_or_default(),
        status,
        branch,
        topic: raw.topic,
        patch_sets,
        reviewers,
    }))
}

/// In-memory cache of server-side truth, refreshed per query batch.
///
/// Indexed by server number, by review id (several numbers can share an
/// id when a review was cherry-picked server-side), and globally by
/// patch-set revision.
#[derive(Debug, Default)]
pub struct GerritCache {
    by_number: HashMap<u64, GerritInfo>,
    by_id: HashMap<String, Vec<u64>>,
    by_revision: HashMap<String, (u64, u32)>,
}

impl GerritCache {
    pub fn new() -> Self {
        GerritCache::default()
    }

    pub fn get(&self, number: u64) -> Option<&GerritInfo> {
        self.by_number.get(&number)
    }

    pub fn numbers_for_id(&self, id: &str) -> &[u64] {
        self.by_id.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The owning (change number, patch-set number) of a revision. Each
    /// revision belongs to at most one patch set globally.
    pub fn lookup_revision(&self, revision: &str) -> Option<(u64, u32)> {
        self.by_revision.get(revision).copied()
    }

    pub fn infos(&self) -> impl Iterator<Item = &GerritInfo> {
        self.by_number.values()
    }

    pub fn insert(&mut self, info: GerritInfo) {
        let numbers = self.by_id.entry(info.id.clone()).or_default();
        if !numbers.contains(&info.number) {
            numbers.push(info.number);
        }
        for ps in &info.patch_sets {
            self.by_revision
                .insert(ps.revision.clone(), (info.number, ps.number));
        }
        self.by_number.insert(info.number, info);
    }
}

/// Issues one batched query and folds the response into the cache, then
/// reconciles recorded target branches against the server's (the branch
/// tracker runs as a side effect of every successful query).
///
/// Returns the user-visible notices produced by the tracker and the
/// numbers of the refreshed records.
pub fn refresh(
    transport: &mut dyn QueryTransport,
    cache: &mut GerritCache,
    registry: &mut ChangeRegistry,
    quiet: bool,
    predicates: &[String],
) -> Result<(Vec<u64>, Vec<Report>)> {
    if predicates.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }
    debug!("querying {} predicates", predicates.len());
    let lines = transport.query(predicates)?;
    let mut refreshed = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(info) = parse_info_line(&line)? {
            refreshed.push(info.number);
            cache.insert(info);
        }
    }
    let reports = track::update_branches(registry, cache, quiet);
    Ok((refreshed, reports))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = r#"{"project":"tools","branch":"dev","id":"Iabc","number":4711,"subject":"Fix it","status":"NEW","topic":"cleanup","allReviewers":[{"name":"R","email":"r@example.com"}],"patchSets":[{"number":1,"revision":"1111111111111111111111111111111111111111","ref":"refs/changes/11/4711/1","createdOn":1700000000},{"number":2,"revision":"2222222222222222222222222222222222222222","ref":"refs/changes/11/4711/2","createdOn":1700001000}]}"#;

    #[test]
    fn parses_a_change_line() {
        let info = parse_info_line(LINE).unwrap().unwrap();
        assert_eq!(info.number, 4711);
        assert_eq!(info.id, "Iabc");
        assert_eq!(info.status, ReviewStatus::New);
        assert_eq!(info.branch, "dev");
        assert_eq!(info.patch_sets.len(), 2);
        assert_eq!(info.current_patch_set().unwrap().number, 2);
        assert_eq!(info.reviewers, vec!["r@example.com".to_owned()]);
    }

    #[test]
    fn stats_row_is_skipped() {
        let line = r#"{"type":"stats","rowCount":1,"runTimeMilliseconds":12}"#;
        assert!(parse_info_line(line).unwrap().is_none());
    }

    #[test]
    fn stringly_numbers_are_tolerated() {
        let line = r#"{"id":"Iabc","number":"17","status":"MERGED","branch":"dev","patchSets":[{"number":"1","revision":"aaaa"}]}"#;
        let info = parse_info_line(line).unwrap().unwrap();
        assert_eq!(info.number, 17);
        assert!(info.status.is_terminal());
    }

    #[test]
    fn missing_mandatory_field_is_a_protocol_error() {
        let line = r#"{"id":"Iabc","number":17,"branch":"dev","patchSets":[]}"#;
        assert!(matches!(parse_info_line(line), Err(Error::Proto(_))));
        let line = r#"{"id":"Iabc","number":17,"status":"NEW","branch":"dev","patchSets":[{"number":1}]}"#;
        assert!(matches!(parse_info_line(line), Err(Error::Proto(_))));
    }

    #[test]
    fn cache_indexes_revisions_globally() {
        let mut cache = GerritCache::new();
        cache.insert(parse_info_line(LINE).unwrap().unwrap());
        assert_eq!(
            cache.lookup_revision("2222222222222222222222222222222222222222"),
            Some((4711, 2))
        );
        assert_eq!(cache.numbers_for_id("Iabc"), &[4711]);
    }

    #[test]
    fn ssh_url_parsing() {
        let runner = CmdRunner::new(false);
        let t =
            SshTransport::from_remote_url("ssh://user@review.example.com:29418/tools", runner)
                .unwrap();
        assert_eq!(
            t.ssh_args,
            vec!["ssh", "-p", "29418", "user@review.example.com"]
        );
        let runner = CmdRunner::new(false);
        assert!(SshTransport::from_remote_url("https://example.com/r", runner).is_err());
    }
}
