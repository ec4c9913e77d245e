//! Heuristic text detectors for worker output and hosted artifacts.
//!
//! Worker output is free-form text, so everything here is best-effort: a
//! missed match only delays reconciliation, it never corrupts state.

use std::sync::LazyLock;

use regex::Regex;

static ARTIFACT_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://[A-Za-z0-9.\-]+/[A-Za-z0-9_.\-]+/[A-Za-z0-9_.\-]+/pull/(\d+)")
        .expect("artifact url regex")
});

static LINK_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:close[sd]?|fix(?:e[sd])?|resolve[sd]?)\b:?\s+#(\d+)\b")
        .expect("link phrase regex")
});

/// Completion-artifact URL found in free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLink {
    pub url: String,
    pub number: u64,
}

/// First pull-request URL in `text`, if any.
pub fn find_artifact_url(text: &str) -> Option<ArtifactLink> {
    let caps = ARTIFACT_URL.captures(text)?;
    let number = caps.get(1)?.as_str().parse().ok()?;
    Some(ArtifactLink {
        url: caps.get(0)?.as_str().to_string(),
        number,
    })
}

/// Whether `text` links `item_id` with an accepted closing phrase
/// (`Closes #42`, `fixes: #42`, `Resolved #42`, ...).
pub fn links_item(text: &str, item_id: u64) -> bool {
    LINK_PHRASE.captures_iter(text).any(|caps| {
        caps.get(1)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .is_some_and(|id| id == item_id)
    })
}

/// Whether captured output shows `branch` was created or pushed.
pub fn mentions_branch_creation(text: &str, branch: &str) -> bool {
    if !text.contains(branch) {
        return false;
    }
    let lower = text.to_ascii_lowercase();
    lower.contains("[new branch]")
        || lower.contains("set up to track")
        || lower.contains("switched to a new branch")
        || lower.contains("git push")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_pull_request_url_in_prose() {
        let link = find_artifact_url("Opened https://github.com/acme/app/pull/317 for review.")
            .expect("url");
        assert_eq!(link.number, 317);
        assert_eq!(link.url, "https://github.com/acme/app/pull/317");
    }

    #[test]
    fn ignores_issue_urls() {
        assert_eq!(find_artifact_url("see https://github.com/acme/app/issues/4"), None);
    }

    #[test]
    fn accepts_linking_phrasings() {
        for text in [
            "Closes #42",
            "fixes #42",
            "Fixed: #42",
            "This resolves #42.",
            "close #42",
        ] {
            assert!(links_item(text, 42), "{text}");
        }
    }

    #[test]
    fn rejects_other_ids_and_bare_mentions() {
        assert!(!links_item("Closes #420", 42));
        assert!(!links_item("related to #42", 42));
        assert!(!links_item("Closes #41", 42));
    }

    #[test]
    fn detects_branch_creation_markers() {
        let push = " * [new branch]      item-42 -> item-42";
        assert!(mentions_branch_creation(push, "item-42"));
        assert!(mentions_branch_creation(
            "branch 'item-42' set up to track 'origin/item-42'.",
            "item-42"
        ));
        assert!(!mentions_branch_creation(" * [new branch] item-7 -> item-7", "item-42"));
        assert!(!mentions_branch_creation("edited item-42/readme", "item-42"));
    }
}
