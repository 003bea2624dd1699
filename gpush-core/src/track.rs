//! Branch tracker: keeps each Change's recorded target branch in sync
//! with the server's authoritative one.
//!
//! A reviewer can retarget a Change on the server without the pusher
//! knowing, so after every query batch the recorded `tgt` of any Change
//! whose last-pushed commit came back in the response is reconciled
//! against the server branch.

use log::debug;

use crate::gerrit::GerritCache;
use crate::registry::ChangeRegistry;
use crate::report::Report;

/// Reconciles recorded target branches against the cache.
///
/// Emits one grouped notice (one header plus one line per affected
/// Change) rather than a line per item; suppressed entirely in quiet
/// mode. Changes written by old ledgers that never recorded a target get
/// a debug note only — there is nothing meaningful to compare against.
pub fn update_branches(
    registry: &mut ChangeRegistry,
    cache: &GerritCache,
    quiet: bool,
) -> Vec<Report> {
    // Collect first: the registry cannot be mutated while iterating it.
    let mut moves: Vec<(u64, String)> = Vec::new();
    for ch in registry.iter() {
        if ch.garbage {
            continue;
        }
        let pushed = match &ch.pushed {
            Some(sha) => sha,
            None => continue,
        };
        let (number, _ps) = match cache.lookup_revision(pushed) {
            Some(hit) => hit,
            None => continue,
        };
        let server_branch = match cache.get(number) {
            Some(info) => &info.branch,
            None => continue,
        };
        match &ch.tgt {
            Some(tgt) if tgt == server_branch => {}
            Some(_) => moves.push((ch.key, server_branch.clone())),
            None => {
                debug!(
                    "change {} ({}) has no recorded target branch; adopting {}",
                    ch.key, ch.id, server_branch
                );
                moves.push((ch.key, server_branch.clone()));
            }
        }
    }

    let mut notices = Vec::new();
    let mut noticed = false;
    for (key, branch) in moves {
        let had_tgt = registry.get(key).and_then(|ch| ch.tgt.clone()).is_some();
        if let Some(ch) = registry.get_mut(key) {
            ch.tgt = Some(branch.clone());
            if ch.ntgt.as_deref() == Some(branch.as_str()) {
                // The pending retarget is now the server's reality.
                ch.ntgt = None;
            }
        }
        // Only branch *moves* are notice-worthy; adopting a target for an
        // old record is bookkeeping.
        if had_tgt && !quiet {
            if !noticed {
                notices.push(Report::Flowed(
                    "Notice: the target branch of some changes was changed on Gerrit:"
                        .to_owned(),
                ));
                noticed = true;
            }
            if let Some(ch) = registry.get(key) {
                notices.push(Report::change(ch, format!("now targets {}", branch)));
            }
        }
    }
    notices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gerrit::parse_info_line;

    fn cache_with(branch: &str, revision: &str) -> GerritCache {
        let line = format!(
            r#"{{"id":"Iabc","number":7,"status":"NEW","branch":"{}","patchSets":[{{"number":1,"revision":"{}"}}]}}"#,
            branch, revision
        );
        let mut cache = GerritCache::new();
        cache.insert(parse_info_line(&line).unwrap().unwrap());
        cache
    }

    #[test]
    fn retarget_updates_and_notices() {
        let mut reg = ChangeRegistry::new();
        let k = reg.create("Iabc", "dev");
        {
            let ch = reg.get_mut(k).unwrap();
            ch.tgt = Some("dev".into());
            ch.pushed = Some("aaaa".into());
        }
        reg.clear_dirty();

        let cache = cache_with("stable", "aaaa");
        let notices = update_branches(&mut reg, &cache, false);
        assert_eq!(reg.get(k).unwrap().tgt.as_deref(), Some("stable"));
        assert!(reg.is_dirty());
        assert_eq!(notices.len(), 2, "header plus one change line");
    }

    #[test]
    fn matching_pending_target_is_cleared() {
        let mut reg = ChangeRegistry::new();
        let k = reg.create("Iabc", "dev");
        {
            let ch = reg.get_mut(k).unwrap();
            ch.tgt = Some("dev".into());
            ch.ntgt = Some("stable".into());
            ch.pushed = Some("aaaa".into());
        }
        let cache = cache_with("stable", "aaaa");
        update_branches(&mut reg, &cache, true);
        let ch = reg.get(k).unwrap();
        assert_eq!(ch.tgt.as_deref(), Some("stable"));
        assert_eq!(ch.ntgt, None);
    }

    #[test]
    fn old_record_without_target_gets_no_notice() {
        let mut reg = ChangeRegistry::new();
        let k = reg.create("Iabc", "dev");
        reg.get_mut(k).unwrap().pushed = Some("aaaa".into());

        let cache = cache_with("stable", "aaaa");
        let notices = update_branches(&mut reg, &cache, false);
        assert!(notices.is_empty());
        assert_eq!(reg.get(k).unwrap().tgt.as_deref(), Some("stable"));
    }

    #[test]
    fn quiet_mode_suppresses_notices() {
        let mut reg = ChangeRegistry::new();
        let k = reg.create("Iabc", "dev");
        {
            let ch = reg.get_mut(k).unwrap();
            ch.tgt = Some("dev".into());
            ch.pushed = Some("aaaa".into());
        }
        let cache = cache_with("stable", "aaaa");
        let notices = update_branches(&mut reg, &cache, true);
        assert!(notices.is_empty());
        assert_eq!(reg.get(k).unwrap().tgt.as_deref(), Some("stable"));
    }

    #[test]
    fn unchanged_branch_stays_clean() {
        let mut reg = ChangeRegistry::new();
        let k = reg.create("Iabc", "dev");
        {
            let ch = reg.get_mut(k).unwrap();
            ch.tgt = Some("dev".into());
            ch.pushed = Some("aaaa".into());
        }
        reg.clear_dirty();
        let cache = cache_with("dev", "aaaa");
        let notices = update_branches(&mut reg, &cache, false);
        assert!(notices.is_empty());
        assert!(!reg.is_dirty());
    }
}
