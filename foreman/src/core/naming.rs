//! Deterministic workspace and branch naming.
//!
//! Every item maps to exactly one directory name and one branch name; the
//! reverse parsers are used by the orphan sweep to recover ids from whatever
//! it finds on disk or in the ref list.

use anyhow::Result;

use crate::error::ForemanError;

/// Prefix shared by workspace directories and branches.
pub const ITEM_PREFIX: &str = "item-";

pub const DEFAULT_BRANCH_MAX_LEN: usize = 64;

/// Length of the longest item name (`item-` plus a 20-digit `u64`). Branch
/// limits below this could map two items onto one branch.
pub const MIN_BRANCH_MAX_LEN: usize = ITEM_PREFIX.len() + 20;

/// Directory name for an item's workspace (`item-<id>`).
pub fn workspace_dir_name(item_id: u64) -> String {
    format!("{ITEM_PREFIX}{item_id}")
}

/// Sanitize a raw name into a branch-safe token.
///
/// Lowercases, maps anything outside `[a-z0-9]` to `-`, collapses runs of
/// hyphens, strips leading/trailing hyphens, and caps the length.
pub fn sanitize_branch(raw: &str, max_len: usize) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut last_hyphen = true;
    for ch in raw.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            out.push(ch);
            last_hyphen = false;
        } else if !last_hyphen {
            out.push('-');
            last_hyphen = true;
        }
    }
    out.truncate(max_len);
    let trimmed = out.trim_matches('-').to_string();
    if trimmed.is_empty() {
        return Err(ForemanError::validation(format!(
            "branch name from '{raw}' is empty after sanitizing"
        ))
        .into());
    }
    Ok(trimmed)
}

/// Branch name for an item's workspace.
///
/// Never truncates: a name that does not fit `max_len` is rejected, since a
/// shortened name would parse back as a different id.
pub fn branch_name(item_id: u64, max_len: usize) -> Result<String> {
    let name = workspace_dir_name(item_id);
    if name.len() > max_len {
        return Err(ForemanError::validation(format!(
            "branch name '{name}' exceeds branch_max_len {max_len}"
        ))
        .into());
    }
    sanitize_branch(&name, max_len)
}

/// Recover an item id from a directory or branch name (`item-42` → 42).
pub fn parse_item_id(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(ITEM_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
