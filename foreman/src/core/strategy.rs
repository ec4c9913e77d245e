//! Ordered worktree-creation strategies.
//!
//! Provisioning walks this list in order with a single loop. Each strategy
//! names the failure that allows falling through to the next one; any other
//! failure stops the walk.

/// How to attach the item branch to a new worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorktreeStrategy {
    /// `git worktree add -b <branch> <path> <base>`.
    CreateBranch,
    /// `git worktree add -B <branch> <path> <upstream-default>`: resets an
    /// existing branch to the upstream default branch.
    ForceRecreateBranch,
}

/// Failure classes a strategy attempt can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// The branch name is already taken.
    BranchExists,
    /// Anything else: stop trying.
    Fatal,
}

impl WorktreeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateBranch => "create-branch",
            Self::ForceRecreateBranch => "force-recreate-branch",
        }
    }

    /// The failure after which the next strategy may be tried.
    pub fn falls_through_on(self) -> Option<FailureMode> {
        match self {
            Self::CreateBranch => Some(FailureMode::BranchExists),
            Self::ForceRecreateBranch => None,
        }
    }
}

/// Strategies in the order provisioning tries them.
pub const WORKTREE_STRATEGIES: [WorktreeStrategy; 2] = [
    WorktreeStrategy::CreateBranch,
    WorktreeStrategy::ForceRecreateBranch,
];

/// Classify git stderr from a failed `worktree add`.
pub fn classify_worktree_failure(stderr: &str) -> FailureMode {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("already exists") && lower.contains("branch") {
        FailureMode::BranchExists
    } else {
        FailureMode::Fatal
    }
}

/// Decide whether to continue after `strategy` failed with `mode`.
pub fn should_fall_through(strategy: WorktreeStrategy, mode: FailureMode) -> bool {
    strategy.falls_through_on() == Some(mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_first_then_force() {
        assert_eq!(WORKTREE_STRATEGIES[0], WorktreeStrategy::CreateBranch);
        assert_eq!(WORKTREE_STRATEGIES[1], WorktreeStrategy::ForceRecreateBranch);
    }

    #[test]
    fn classifies_existing_branch() {
        let stderr = "fatal: a branch named 'item-42' already exists";
        assert_eq!(classify_worktree_failure(stderr), FailureMode::BranchExists);
        assert_eq!(
            classify_worktree_failure("fatal: invalid reference: main"),
            FailureMode::Fatal
        );
    }

    #[test]
    fn only_branch_conflict_falls_through() {
        assert!(should_fall_through(
            WorktreeStrategy::CreateBranch,
            FailureMode::BranchExists
        ));
        assert!(!should_fall_through(
            WorktreeStrategy::CreateBranch,
            FailureMode::Fatal
        ));
        assert!(!should_fall_through(
            WorktreeStrategy::ForceRecreateBranch,
            FailureMode::BranchExists
        ));
    }
}
