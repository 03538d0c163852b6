//! Conflict resolution for destination paths that already exist.
//!
//! Decisions are made once per task at admission, before any byte moves,
//! and are never re-evaluated mid-transfer. The engine stays
//! presentation-agnostic: when a batch's policy is `Ask`, the decision is
//! delegated to a host-supplied [`ConflictPrompt`] (a dialog in a GUI
//! shell); headless hosts get [`SkipPrompt`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use ferry_core::fs::FsMetadata;
use ferry_core::{path as fpath, Error, FileSystem, Result};

use crate::task::SidedPath;

/// Batch-wide default policy for destination conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Delegate each conflict to the prompt.
    #[default]
    Ask,
    Overwrite,
    Skip,
    Rename,
}

/// Resolution for one destination path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictDecision {
    /// No conflict: the destination does not exist.
    Proceed,
    /// Replace the existing destination.
    Overwrite,
    /// Leave the destination alone; the task completes as skipped.
    Skip,
    /// Write to a freshly computed non-colliding path instead.
    Rename(String),
    /// Abort admission of the whole batch.
    Cancel,
}

/// A conflict put to the operator.
#[derive(Debug, Clone)]
pub struct ConflictRequest {
    pub destination: SidedPath,
    pub existing: FsMetadata,
    /// Source metadata when already known.
    pub source: Option<FsMetadata>,
}

/// What the operator chose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptChoice {
    Overwrite,
    Skip,
    Rename,
    Cancel,
}

/// A prompt answer, optionally promoted to the batch policy.
#[derive(Debug, Clone, Copy)]
pub struct PromptAnswer {
    pub choice: PromptChoice,
    /// Apply this choice to every remaining conflict in the batch.
    pub apply_to_all: bool,
}

/// Host-supplied conflict dialog.
pub trait ConflictPrompt: Send + Sync {
    fn resolve(&self, request: &ConflictRequest) -> PromptAnswer;
}

/// Headless default: skip anything that already exists.
pub struct SkipPrompt;

impl ConflictPrompt for SkipPrompt {
    fn resolve(&self, _request: &ConflictRequest) -> PromptAnswer {
        PromptAnswer {
            choice: PromptChoice::Skip,
            apply_to_all: false,
        }
    }
}

/// Fixed-answer prompt, for tests and scripted runs.
pub struct StaticPrompt {
    pub choice: PromptChoice,
    pub apply_to_all: bool,
}

impl ConflictPrompt for StaticPrompt {
    fn resolve(&self, _request: &ConflictRequest) -> PromptAnswer {
        PromptAnswer {
            choice: self.choice,
            apply_to_all: self.apply_to_all,
        }
    }
}

/// Upper bound on numbered-variant probing before giving up.
const MAX_RENAME_PROBES: u32 = 1000;

/// Resolves destination conflicts at batch admission.
pub struct ConflictResolver {
    prompt: Arc<dyn ConflictPrompt>,
}

impl ConflictResolver {
    pub fn new(prompt: Arc<dyn ConflictPrompt>) -> Self {
        Self { prompt }
    }

    /// Decide what to do about `destination`.
    ///
    /// Deterministic for identical (destination existence/metadata,
    /// source metadata, policy) inputs. When the prompt answers with
    /// apply-to-all, `policy` is promoted so the rest of the batch skips
    /// the prompt.
    pub async fn resolve(
        &self,
        fs: &dyn FileSystem,
        destination: &SidedPath,
        source: Option<FsMetadata>,
        policy: &mut ConflictPolicy,
    ) -> Result<ConflictDecision> {
        let existing = match fs.stat(&destination.path).await {
            Ok(meta) => meta,
            Err(Error::NotFound { .. }) => return Ok(ConflictDecision::Proceed),
            Err(e) => return Err(e),
        };

        let choice = match *policy {
            ConflictPolicy::Overwrite => PromptChoice::Overwrite,
            ConflictPolicy::Skip => PromptChoice::Skip,
            ConflictPolicy::Rename => PromptChoice::Rename,
            ConflictPolicy::Ask => {
                let answer = self.prompt.resolve(&ConflictRequest {
                    destination: destination.clone(),
                    existing,
                    source,
                });
                if answer.apply_to_all {
                    *policy = match answer.choice {
                        PromptChoice::Overwrite => ConflictPolicy::Overwrite,
                        PromptChoice::Skip => ConflictPolicy::Skip,
                        PromptChoice::Rename => ConflictPolicy::Rename,
                        PromptChoice::Cancel => ConflictPolicy::Ask,
                    };
                }
                answer.choice
            }
        };

        match choice {
            PromptChoice::Overwrite => Ok(ConflictDecision::Overwrite),
            PromptChoice::Skip => Ok(ConflictDecision::Skip),
            PromptChoice::Cancel => Ok(ConflictDecision::Cancel),
            PromptChoice::Rename => {
                let renamed = next_free_variant(fs, destination).await?;
                Ok(ConflictDecision::Rename(renamed))
            }
        }
    }
}

/// Compute the first free numbered variant of a destination:
/// `report.txt` -> `report (1).txt` -> `report (2).txt` -> ...
async fn next_free_variant(fs: &dyn FileSystem, destination: &SidedPath) -> Result<String> {
    let dir = fpath::parent(&destination.path);
    let name = destination.file_name();

    for n in 1..=MAX_RENAME_PROBES {
        let candidate = fpath::join(&dir, &fpath::numbered_variant(name, n));
        match fs.stat(&candidate).await {
            Err(Error::NotFound { .. }) => return Ok(candidate),
            Ok(_) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Error::PathUnavailable {
        path: destination.path.clone(),
        message: "no free numbered variant".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_test_utils::MemoryFs;

    fn resolver(choice: PromptChoice, apply_to_all: bool) -> ConflictResolver {
        ConflictResolver::new(Arc::new(StaticPrompt {
            choice,
            apply_to_all,
        }))
    }

    #[tokio::test]
    async fn absent_destination_proceeds() {
        let fs = MemoryFs::new();
        let resolver = resolver(PromptChoice::Cancel, false);
        let mut policy = ConflictPolicy::Ask;

        let decision = resolver
            .resolve(&fs, &SidedPath::remote("/out/a.txt"), None, &mut policy)
            .await
            .unwrap();
        assert_eq!(decision, ConflictDecision::Proceed);
    }

    #[tokio::test]
    async fn policy_overrides_prompt() {
        let fs = MemoryFs::new();
        fs.add_file("/out/a.txt", b"old".to_vec());
        // Prompt would cancel, but the batch policy says overwrite.
        let resolver = resolver(PromptChoice::Cancel, false);
        let mut policy = ConflictPolicy::Overwrite;

        let decision = resolver
            .resolve(&fs, &SidedPath::remote("/out/a.txt"), None, &mut policy)
            .await
            .unwrap();
        assert_eq!(decision, ConflictDecision::Overwrite);
    }

    #[tokio::test]
    async fn apply_to_all_promotes_policy() {
        let fs = MemoryFs::new();
        fs.add_file("/out/a.txt", b"old".to_vec());
        let resolver = resolver(PromptChoice::Skip, true);
        let mut policy = ConflictPolicy::Ask;

        let decision = resolver
            .resolve(&fs, &SidedPath::remote("/out/a.txt"), None, &mut policy)
            .await
            .unwrap();
        assert_eq!(decision, ConflictDecision::Skip);
        assert_eq!(policy, ConflictPolicy::Skip);
    }

    #[tokio::test]
    async fn rename_probes_numbered_variants() {
        let fs = MemoryFs::new();
        fs.add_file("/out/report.txt", b"v0".to_vec());
        fs.add_file("/out/report (1).txt", b"v1".to_vec());
        let resolver = resolver(PromptChoice::Rename, false);
        let mut policy = ConflictPolicy::Ask;

        let decision = resolver
            .resolve(&fs, &SidedPath::remote("/out/report.txt"), None, &mut policy)
            .await
            .unwrap();
        assert_eq!(
            decision,
            ConflictDecision::Rename("/out/report (2).txt".to_string())
        );
    }

    #[tokio::test]
    async fn resolution_is_deterministic() {
        let fs = MemoryFs::new();
        fs.add_file("/out/a.txt", b"old".to_vec());
        let resolver = resolver(PromptChoice::Rename, false);

        let mut p1 = ConflictPolicy::Ask;
        let d1 = resolver
            .resolve(&fs, &SidedPath::remote("/out/a.txt"), None, &mut p1)
            .await
            .unwrap();
        let mut p2 = ConflictPolicy::Ask;
        let d2 = resolver
            .resolve(&fs, &SidedPath::remote("/out/a.txt"), None, &mut p2)
            .await
            .unwrap();
        assert_eq!(d1, d2);
    }
}
