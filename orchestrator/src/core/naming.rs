//! Task identifier minting and branch naming.
//!
//! Identifiers are ULIDs: globally unique without coordination and sortable
//! by creation time, so FIFO dispatch can tiebreak on id. The first characters
//! of the identifier seed the feature branch and generator thread names.

use thiserror::Error;
use ulid::Ulid;

/// Branch namespace for generated feature branches.
const BRANCH_PREFIX: &str = "amp/";

/// Characters and patterns git refuses in branch names.
const INVALID_SEQUENCES: &[&str] = &[" ", "~", "^", ":", "?", "*", "[", "\\", "..", "@{"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BranchNameError {
    #[error("branch name cannot be empty")]
    Empty,
    #[error("branch name contains invalid sequence {0:?}")]
    InvalidSequence(&'static str),
    #[error("branch name cannot start or end with {0:?}")]
    BadEdge(char),
}

/// Mint a new task identifier.
pub fn mint_task_id() -> String {
    Ulid::new().to_string()
}

/// Derive the feature branch for a task id: `amp/` plus the first six
/// characters of the id, lowercased.
pub fn branch_for(task_id: &str) -> String {
    let suffix: String = task_id.chars().take(6).collect::<String>().to_lowercase();
    format!("{BRANCH_PREFIX}{suffix}")
}

/// Derive the generator session handle for a task id.
pub fn thread_for(task_id: &str) -> String {
    let suffix: String = task_id.chars().take(8).collect::<String>().to_lowercase();
    format!("thread-{suffix}")
}

/// Reject names git would refuse as a branch ref.
pub fn validate_branch_name(name: &str) -> Result<(), BranchNameError> {
    if name.is_empty() {
        return Err(BranchNameError::Empty);
    }
    for seq in INVALID_SEQUENCES {
        if name.contains(seq) {
            return Err(BranchNameError::InvalidSequence(seq));
        }
    }
    for edge in ['-', '.'] {
        if name.starts_with(edge) || name.ends_with(edge) {
            return Err(BranchNameError::BadEdge(edge));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_are_unique_and_sortable() {
        let a = mint_task_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = mint_task_id();
        assert_ne!(a, b);
        assert!(a < b, "later id should sort after earlier id");
    }

    #[test]
    fn branch_uses_first_six_chars_lowercased() {
        let branch = branch_for("01ARZ3NDEKTSV4RRFFQ69G5FAV");
        assert_eq!(branch, "amp/01arz3");
        assert!(validate_branch_name(&branch).is_ok());
    }

    #[test]
    fn minted_branch_matches_expected_shape() {
        let id = mint_task_id();
        let branch = branch_for(&id);
        assert!(branch.starts_with("amp/"));
        let suffix = &branch["amp/".len()..];
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn thread_handle_uses_first_eight_chars() {
        assert_eq!(thread_for("01ARZ3NDEKTSV4RRFFQ69G5FAV"), "thread-01arz3nd");
    }

    #[test]
    fn rejects_git_invalid_names() {
        assert_eq!(validate_branch_name(""), Err(BranchNameError::Empty));
        assert!(matches!(
            validate_branch_name("has space"),
            Err(BranchNameError::InvalidSequence(" "))
        ));
        assert!(matches!(
            validate_branch_name("a..b"),
            Err(BranchNameError::InvalidSequence(".."))
        ));
        assert!(matches!(
            validate_branch_name("ref@{1}"),
            Err(BranchNameError::InvalidSequence("@{"))
        ));
        assert!(matches!(
            validate_branch_name("-lead"),
            Err(BranchNameError::BadEdge('-'))
        ));
        assert!(matches!(
            validate_branch_name("trail."),
            Err(BranchNameError::BadEdge('.'))
        ));
    }
}
