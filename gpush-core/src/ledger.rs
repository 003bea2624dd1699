//! State persistence: the textual ledger and its git-ref storage.
//!
//! The registry serializes to a small line-oriented format — a header of
//! `key value` lines (counters and metadata), a blank line, then one
//! blank-line-separated block of `key value` lines per Change. The text
//! is committed as a blob onto `refs/gpush/state` so state replicates
//! between machines along with the repository.
//!
//! Frequently-changing scalar fields (`pushed`, `base`, `orig`) are NOT
//! in the blob: each lives in its own ref (`refs/gpush/i<key>_<field>`),
//! so a push that only advances a SHA touches one ref instead of
//! rewriting the whole ledger and polluting the replicated history.
//! Fetched-patchset cache refs (`refs/gpush/g<number>_<ps>`) share the
//! namespace and are pruned by the garbage collector.

use std::collections::HashMap;

use git2::{Oid, Repository};
use log::{debug, info};

use crate::error::{Error, Result};
use crate::registry::ChangeRegistry;
use crate::types::Change;

pub const STATE_REF: &str = "refs/gpush/state";
pub const REF_NAMESPACE: &str = "refs/gpush/";

/// Marker written for a present-but-empty string value, so an empty
/// value never collides with the blank lines that separate blocks.
const EMPTY_MARKER: &str = "\"\"";

/// Header metadata that round-trips through the ledger but is not part
/// of the registry proper.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerMeta {
    /// Verification token of a staged ("new") ledger variant.
    pub verify: Option<String>,
    /// Identity string of the tool instance that last updated the state.
    pub updater: Option<String>,
}

fn encode_value(v: &str) -> &str {
    if v.is_empty() {
        EMPTY_MARKER
    } else {
        v
    }
}

fn decode_value(v: &str) -> String {
    if v == EMPTY_MARKER {
        String::new()
    } else {
        v.to_owned()
    }
}

fn push_field(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push(' ');
    out.push_str(encode_value(value));
    out.push('\n');
}

fn push_opt(out: &mut String, key: &str, value: &Option<String>) {
    if let Some(v) = value {
        push_field(out, key, v);
    }
}

/// Serializes the registry and metadata to canonical ledger text.
///
/// Garbage records are omitted. Field order is fixed so that an
/// unchanged registry always produces byte-identical text — the
/// minimal-diff save depends on that.
pub fn serialize(registry: &ChangeRegistry, meta: &LedgerMeta) -> String {
    let mut out = String::new();
    push_field(&mut out, "next_key", &registry.next_key.to_string());
    push_field(&mut out, "next_group", &registry.next_group.to_string());
    push_field(&mut out, "last_gc", &registry.last_gc.to_string());
    push_opt(&mut out, "verify", &meta.verify);
    push_opt(&mut out, "updater", &meta.updater);

    for ch in registry.iter().filter(|ch| !ch.garbage) {
        out.push('\n');
        push_field(&mut out, "key", &ch.key.to_string());
        push_field(&mut out, "id", &ch.id);
        push_field(&mut out, "src", &ch.src);
        push_opt(&mut out, "tgt", &ch.tgt);
        push_opt(&mut out, "topic", &ch.topic);
        if let Some(grp) = ch.grp {
            push_field(&mut out, "grp", &grp.to_string());
        }
        if ch.exclude {
            push_field(&mut out, "exclude", "1");
        }
        if ch.hide {
            push_field(&mut out, "hide", "1");
        }
        push_opt(&mut out, "ntgt", &ch.ntgt);
        push_opt(&mut out, "ntopic", &ch.ntopic);
        push_opt(&mut out, "nbase", &ch.nbase);
    }
    out
}

fn parse_counter(value: &str, what: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| Error::State(format!("bad {} in ledger header: {:?}", what, value)))
}

fn split_line(line: &str, lineno: usize) -> Result<(&str, &str)> {
    match line.split_once(' ') {
        Some((k, v)) if !k.is_empty() && !v.is_empty() => Ok((k, v)),
        _ => Err(Error::State(format!(
            "malformed ledger line {}: {:?}",
            lineno, line
        ))),
    }
}

fn parse_block(lines: &[(usize, &str)]) -> Result<Change> {
    let mut ch = Change::default();
    let mut have_key = false;
    for &(lineno, line) in lines {
        let (k, v) = split_line(line, lineno)?;
        let v = decode_value(v);
        match k {
            "key" => {
                ch.key = parse_counter(&v, "change key")?;
                have_key = true;
            }
            "id" => ch.id = v,
            "src" => ch.src = v,
            "tgt" => ch.tgt = Some(v),
            "topic" => ch.topic = Some(v),
            "grp" => ch.grp = Some(parse_counter(&v, "group")?),
            "exclude" => ch.exclude = v == "1",
            "hide" => ch.hide = v == "1",
            "ntgt" => ch.ntgt = Some(v),
            "ntopic" => ch.ntopic = Some(v),
            "nbase" => ch.nbase = Some(v),
            other => {
                return Err(Error::State(format!(
                    "unknown change field {:?} at ledger line {}",
                    other, lineno
                )))
            }
        }
    }
    if !have_key || ch.id.is_empty() || ch.src.is_empty() {
        return Err(Error::State(
            "change block missing key, id or src".into(),
        ));
    }
    Ok(ch)
}

/// Parses ledger text into a fresh registry plus header metadata.
///
/// # Errors
///
/// Any malformed content is `Error::State`: the ledger is replicated
/// between machines, so guessing at its meaning is worse than refusing.
pub fn parse(text: &str) -> Result<(ChangeRegistry, LedgerMeta)> {
    let mut registry = ChangeRegistry::new();
    let mut meta = LedgerMeta::default();

    let mut lines = text.lines().enumerate().peekable();

    // Header section: key/value lines up to the first blank line.
    while let Some(&(lineno, line)) = lines.peek() {
        if line.is_empty() {
            break;
        }
        lines.next();
        let (k, v) = split_line(line, lineno + 1)?;
        let v = decode_value(v);
        match k {
            "next_key" => registry.next_key = parse_counter(&v, "next_key")?,
            "next_group" => registry.next_group = parse_counter(&v, "next_group")?,
            "last_gc" => {
                registry.last_gc = v
                    .parse()
                    .map_err(|_| Error::State(format!("bad last_gc: {:?}", v)))?
            }
            "verify" => meta.verify = Some(v),
            "updater" => meta.updater = Some(v),
            other => {
                return Err(Error::State(format!(
                    "unknown ledger header key {:?} at line {}",
                    other,
                    lineno + 1
                )))
            }
        }
    }

    // Change blocks, separated by blank lines.
    let mut block: Vec<(usize, &str)> = Vec::new();
    let finish =
        |block: &mut Vec<(usize, &str)>, registry: &mut ChangeRegistry| -> Result<()> {
            if block.is_empty() {
                return Ok(());
            }
            let ch = parse_block(block)?;
            if registry.contains_key(ch.key) {
                return Err(Error::State(format!("duplicate change key {}", ch.key)));
            }
            registry.insert(ch);
            block.clear();
            Ok(())
        };
    for (lineno, line) in lines {
        if line.is_empty() {
            finish(&mut block, &mut registry)?;
        } else {
            block.push((lineno + 1, line));
        }
    }
    finish(&mut block, &mut registry)?;

    registry.clear_dirty();
    Ok((registry, meta))
}

/// Name of the auxiliary ref holding one frequently-changing scalar of
/// one Change.
pub fn aux_ref_name(key: u64, field: &str) -> String {
    format!("{}i{}_{}", REF_NAMESPACE, key, field)
}

/// Name of the cache ref remembering a fetched patch set.
pub fn cache_ref_name(number: u64, ps: u32) -> String {
    format!("{}g{}_{}", REF_NAMESPACE, number, ps)
}

/// Parses a cache ref name back into (change number, patch-set number).
pub fn parse_cache_ref(name: &str) -> Option<(u64, u32)> {
    let rest = name.strip_prefix(REF_NAMESPACE)?.strip_prefix('g')?;
    let (number, ps) = rest.split_once('_')?;
    Some((number.parse().ok()?, ps.parse().ok()?))
}

const AUX_FIELDS: [&str; 3] = ["pushed", "base", "orig"];

fn aux_field_of(ch: &Change, field: &str) -> Option<String> {
    match field {
        "pushed" => ch.pushed.clone(),
        "base" => ch.base.clone(),
        "orig" => ch.orig.clone(),
        _ => None,
    }
}

fn set_aux_field(ch: &mut Change, field: &str, value: String) {
    match field {
        "pushed" => ch.pushed = Some(value),
        "base" => ch.base = Some(value),
        "orig" => ch.orig = Some(value),
        _ => {}
    }
}

/// Owns the load/save protocol against `refs/gpush/state` and the
/// auxiliary refs.
///
/// Keeps the last loaded/saved text so that a save with no intervening
/// mutation is a byte-compare and a no-op.
#[derive(Debug, Default)]
pub struct StateStore {
    last_text: Option<String>,
    pub meta: LedgerMeta,
}

impl StateStore {
    pub fn new() -> Self {
        StateStore::default()
    }

    /// Loads the ledger and auxiliary refs into a registry.
    ///
    /// A missing state ref is a fresh start, not an error.
    pub fn load(&mut self, repo: &Repository) -> Result<ChangeRegistry> {
        let text = match read_state_text(repo)? {
            Some(text) => text,
            None => {
                debug!("no state ref; starting fresh");
                self.last_text = None;
                self.meta = LedgerMeta::default();
                return Ok(ChangeRegistry::new());
            }
        };
        let (mut registry, meta) = parse(&text)?;
        self.meta = meta;
        self.last_text = Some(text);

        // Scalars split out of the blob live in per-change refs.
        for (key, field, oid) in list_aux_refs(repo)? {
            if let Some(ch) = registry.get_mut(key) {
                set_aux_field(ch, field.as_str(), oid.to_string());
            }
            // A ref for an unknown key is stale; GC will collect it.
        }
        registry.clear_dirty();
        Ok(registry)
    }

    /// Persists the registry: ledger blob (when its text changed) and
    /// auxiliary refs (only those whose value changed). Returns whether
    /// anything was written.
    ///
    /// In dry-run mode nothing is written and `Ok(false)` is returned.
    pub fn save(
        &mut self,
        repo: &Repository,
        registry: &mut ChangeRegistry,
        dry_run: bool,
    ) -> Result<bool> {
        let text = serialize(registry, &self.meta);
        let blob_unchanged = self.last_text.as_deref() == Some(text.as_str());

        if dry_run {
            if !blob_unchanged {
                info!("dry-run: would update {}", STATE_REF);
            }
            return Ok(false);
        }

        let mut wrote = false;
        if !blob_unchanged {
            write_state_text(repo, &text)?;
            self.last_text = Some(text);
            wrote = true;
        }
        wrote |= self.sync_aux_refs(repo, registry)?;
        registry.clear_dirty();
        Ok(wrote)
    }

    /// Brings the aux refs in line with the registry: update refs whose
    /// value changed, create missing ones, and explicitly delete the
    /// refs of garbage-marked Changes rather than leaving them stale.
    fn sync_aux_refs(&self, repo: &Repository, registry: &ChangeRegistry) -> Result<bool> {
        let mut existing: HashMap<String, Oid> = HashMap::new();
        for (key, field, oid) in list_aux_refs(repo)? {
            existing.insert(aux_ref_name(key, &field), oid);
        }

        let mut desired: HashMap<String, Oid> = HashMap::new();
        for ch in registry.iter().filter(|ch| !ch.garbage) {
            for field in AUX_FIELDS {
                if let Some(sha) = aux_field_of(ch, field) {
                    let oid = Oid::from_str(&sha).map_err(|_| {
                        Error::State(format!("change {}: bad {} sha {:?}", ch.key, field, sha))
                    })?;
                    desired.insert(aux_ref_name(ch.key, field), oid);
                }
            }
        }

        let mut wrote = false;
        for (name, oid) in &desired {
            if existing.get(name) != Some(oid) {
                repo.reference(name, *oid, true, "gpush: state update")?;
                wrote = true;
            }
        }
        for name in existing.keys() {
            if !desired.contains_key(name) {
                repo.find_reference(name)?.delete()?;
                wrote = true;
            }
        }
        Ok(wrote)
    }
}

fn read_state_text(repo: &Repository) -> Result<Option<String>> {
    let reference = match repo.find_reference(STATE_REF) {
        Ok(r) => r,
        Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let commit = reference.peel_to_commit()?;
    let tree = commit.tree()?;
    let entry = tree
        .get_name("state")
        .ok_or_else(|| Error::State(format!("{} has no state entry", STATE_REF)))?;
    let object = entry.to_object(repo)?;
    let blob = object
        .as_blob()
        .ok_or_else(|| Error::State(format!("{} state entry is not a blob", STATE_REF)))?;
    Ok(Some(
        String::from_utf8_lossy(blob.content()).into_owned(),
    ))
}

fn write_state_text(repo: &Repository, text: &str) -> Result<()> {
    let blob = repo.blob(text.as_bytes())?;
    let mut builder = repo.treebuilder(None)?;
    builder.insert("state", blob, 0o100644)?;
    let tree = repo.find_tree(builder.write()?)?;

    let parent = match repo.find_reference(STATE_REF) {
        Ok(r) => Some(r.peel_to_commit()?),
        Err(e) if e.code() == git2::ErrorCode::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();

    let sig = repo
        .signature()
        .or_else(|_| git2::Signature::now("gpush", "gpush@localhost"))?;
    repo.commit(
        Some(STATE_REF),
        &sig,
        &sig,
        "gpush: state update",
        &tree,
        &parents,
    )?;
    debug!("wrote {} ({} bytes)", STATE_REF, text.len());
    Ok(())
}

/// Enumerates auxiliary per-change refs as (key, field, target).
pub fn list_aux_refs(repo: &Repository) -> Result<Vec<(u64, String, Oid)>> {
    let mut out = Vec::new();
    for reference in repo.references_glob(&format!("{}i*", REF_NAMESPACE))? {
        let reference = reference?;
        let name = match reference.name() {
            Some(n) => n.to_owned(),
            None => continue,
        };
        let rest = match name.strip_prefix(REF_NAMESPACE).and_then(|r| r.strip_prefix('i')) {
            Some(r) => r,
            None => continue,
        };
        let (key, field) = match rest.split_once('_') {
            Some((k, f)) => (k, f),
            None => continue,
        };
        let key: u64 = match key.parse() {
            Ok(k) => k,
            Err(_) => continue,
        };
        if let Some(oid) = reference.target() {
            out.push((key, field.to_owned(), oid));
        }
    }
    Ok(out)
}

/// Enumerates fetched-patchset cache refs as (change number, patch-set
/// number, ref name, target).
pub fn list_cache_refs(repo: &Repository) -> Result<Vec<(u64, u32, String, Oid)>> {
    let mut out = Vec::new();
    for reference in repo.references_glob(&format!("{}g*", REF_NAMESPACE))? {
        let reference = reference?;
        let name = match reference.name() {
            Some(n) => n.to_owned(),
            None => continue,
        };
        if let (Some((number, ps)), Some(oid)) = (parse_cache_ref(&name), reference.target()) {
            out.push((number, ps, name, oid));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_registry() -> ChangeRegistry {
        let mut reg = ChangeRegistry::new();
        let k = reg.create("Iabc", "dev");
        {
            let ch = reg.get_mut(k).unwrap();
            ch.tgt = Some("dev".into());
            ch.grp = Some(3);
            ch.hide = true;
        }
        let k2 = reg.create("Idef", "feature");
        reg.get_mut(k2).unwrap().topic = Some(String::new());
        reg
    }

    #[test]
    fn round_trip_preserves_fields() {
        let reg = sample_registry();
        let meta = LedgerMeta {
            verify: None,
            updater: Some("host-a".into()),
        };
        let text = serialize(&reg, &meta);
        let (parsed, parsed_meta) = parse(&text).unwrap();

        assert_eq!(parsed_meta, meta);
        assert_eq!(parsed.next_key, reg.next_key);
        assert_eq!(parsed.next_group, reg.next_group);
        assert_eq!(parsed.len(), 2);

        let a = parsed.get(10000).unwrap();
        assert_eq!(a.id, "Iabc");
        assert_eq!(a.src, "dev");
        assert_eq!(a.tgt.as_deref(), Some("dev"));
        assert_eq!(a.grp, Some(3));
        assert!(a.hide);
    }

    #[test]
    fn empty_string_survives_distinct_from_absent() {
        let reg = sample_registry();
        let text = serialize(&reg, &LedgerMeta::default());
        assert!(text.contains("topic \"\"\n"), "ledger text:\n{}", text);

        let (parsed, _) = parse(&text).unwrap();
        let b = parsed.get(10001).unwrap();
        assert_eq!(b.topic.as_deref(), Some(""));
        assert_eq!(b.tgt, None);
    }

    #[test]
    fn garbage_changes_are_omitted() {
        let mut reg = sample_registry();
        reg.mark_garbage(10000);
        let text = serialize(&reg, &LedgerMeta::default());
        let (parsed, _) = parse(&text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(parsed.get(10000).is_none());
        // The counter does not move backwards just because a record died.
        assert_eq!(parsed.next_key, 10002);
    }

    #[test]
    fn header_resumes_counters() {
        let text = "next_key 10002\nnext_group 1\nlast_gc 0\n\nkey 10000\nid Iabc\nsrc dev\ntgt dev\n";
        let (parsed, _) = parse(text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.next_key, 10002);
    }

    #[test]
    fn malformed_content_is_fatal() {
        assert!(matches!(parse("next_key zork\n"), Err(Error::State(_))));
        assert!(matches!(parse("bogus_header 1\n"), Err(Error::State(_))));
        // Block without an id.
        let text = "next_key 10001\nnext_group 1\nlast_gc 0\n\nkey 10000\nsrc dev\n";
        assert!(matches!(parse(text), Err(Error::State(_))));
        // Duplicate keys.
        let text =
            "next_key 10001\nnext_group 1\nlast_gc 0\n\nkey 10000\nid Ia\nsrc dev\n\nkey 10000\nid Ib\nsrc dev\n";
        assert!(matches!(parse(text), Err(Error::State(_))));
    }

    #[test]
    fn cache_ref_names_round_trip() {
        let name = cache_ref_name(4711, 3);
        assert_eq!(name, "refs/gpush/g4711_3");
        assert_eq!(parse_cache_ref(&name), Some((4711, 3)));
        assert_eq!(parse_cache_ref("refs/gpush/i10000_pushed"), None);
    }
}
