//! Batch planning: expanding an operator request into ordered tasks.
//!
//! A request names top-level sources; the planner walks directories
//! through the source-side capability and emits one task per entry, in an
//! order that keeps directory creation ahead of contents and deletes
//! deepest-first. Destination conflicts are resolved here, once per
//! top-level source, before anything is admitted: a skip drops the whole
//! item, a rename re-roots it, an overwrite splices deepest-first deletes
//! of the existing destination ahead of it, and a cancel aborts the whole
//! request. Entries inside a transferred tree overwrite in place without
//! further prompting.

use tracing::debug;

use ferry_core::{path as fpath, Error, FileSystem, Result};

use crate::conflict::{ConflictDecision, ConflictPolicy, ConflictResolver};
use crate::task::{Side, SidedPath, Sides, Verb};

/// An operator request: one verb applied to a set of sources.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub verb: Verb,
    pub sources: Vec<SidedPath>,
    /// Destination directory; `None` for Delete.
    pub dest_dir: Option<SidedPath>,
    /// Default conflict policy for the batch.
    pub policy: ConflictPolicy,
}

impl TransferRequest {
    pub fn copy(sources: Vec<SidedPath>, dest_dir: SidedPath) -> Self {
        Self {
            verb: Verb::Copy,
            sources,
            dest_dir: Some(dest_dir),
            policy: ConflictPolicy::Ask,
        }
    }

    pub fn r#move(sources: Vec<SidedPath>, dest_dir: SidedPath) -> Self {
        Self {
            verb: Verb::Move,
            sources,
            dest_dir: Some(dest_dir),
            policy: ConflictPolicy::Ask,
        }
    }

    pub fn delete(sources: Vec<SidedPath>) -> Self {
        Self {
            verb: Verb::Delete,
            sources,
            dest_dir: None,
            policy: ConflictPolicy::Ask,
        }
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// One planned task, before admission assigns identity.
#[derive(Debug, Clone)]
pub struct PlannedTask {
    pub verb: Verb,
    pub source: SidedPath,
    pub destination: Option<SidedPath>,
    pub source_is_dir: bool,
    /// Resolved as Skip at planning time: admitted already-completed.
    pub skip: bool,
    /// Claimable only once every planned task at index <= after_seq is
    /// terminal.
    pub after_seq: Option<u32>,
}

impl PlannedTask {
    fn skipped(verb: Verb, source: SidedPath, destination: SidedPath) -> Self {
        Self {
            verb,
            source,
            destination: Some(destination),
            source_is_dir: false,
            skip: true,
            after_seq: None,
        }
    }
}

/// A walked entry: absolute source path plus path relative to the walk
/// base.
#[derive(Debug, Clone)]
struct WalkEntry {
    path: String,
    rel: String,
    is_dir: bool,
}

/// Expands operator requests into ordered, conflict-annotated task lists.
pub struct Planner {
    sides: Sides,
    resolver: ConflictResolver,
}

impl Planner {
    pub fn new(sides: Sides, resolver: ConflictResolver) -> Self {
        Self { sides, resolver }
    }

    /// Expand a request. Sources must exist; a missing source fails the
    /// whole request before anything is admitted. Returns
    /// `Error::Cancelled` when the operator cancels out of a conflict
    /// prompt.
    pub async fn plan(&self, request: &TransferRequest) -> Result<Vec<PlannedTask>> {
        if request.sources.is_empty() {
            return Ok(Vec::new());
        }
        let mut plan: Vec<PlannedTask> = Vec::new();
        let mut policy = request.policy;

        for source in &request.sources {
            match request.verb {
                Verb::Delete => self.plan_delete(source, &mut plan).await?,
                Verb::Copy => {
                    let dest_dir = request_dest(request)?;
                    self.plan_copy(source, dest_dir, &mut policy, &mut plan)
                        .await?;
                }
                Verb::Move => {
                    let dest_dir = request_dest(request)?;
                    self.plan_move(source, dest_dir, &mut policy, &mut plan)
                        .await?;
                }
            }
        }

        debug!(tasks = plan.len(), verb = ?request.verb, "request planned");
        Ok(plan)
    }

    /// Resolve the destination for one top-level source. Returns the
    /// (possibly renamed) destination and the barrier index to wait on,
    /// or `None` when the item is skipped (a marker task was emitted).
    async fn resolve_root(
        &self,
        verb: Verb,
        source: &SidedPath,
        dest_root: SidedPath,
        source_meta: ferry_core::fs::FsMetadata,
        policy: &mut ConflictPolicy,
        plan: &mut Vec<PlannedTask>,
    ) -> Result<Option<(SidedPath, Option<u32>)>> {
        let dest_fs = self.sides.fs(dest_root.side);
        let decision = self
            .resolver
            .resolve(dest_fs.as_ref(), &dest_root, Some(source_meta), policy)
            .await?;

        match decision {
            ConflictDecision::Cancel => Err(Error::Cancelled),
            ConflictDecision::Skip => {
                plan.push(PlannedTask::skipped(verb, source.clone(), dest_root));
                Ok(None)
            }
            ConflictDecision::Rename(path) => Ok(Some((dest_root.with_path(path), None))),
            ConflictDecision::Overwrite => {
                // Clear the existing destination first, deepest-first;
                // the transfer itself waits for the last delete.
                self.plan_delete(&dest_root, plan).await?;
                let barrier = Some(plan.len() as u32 - 1);
                Ok(Some((dest_root, barrier)))
            }
            ConflictDecision::Proceed => Ok(Some((dest_root, None))),
        }
    }

    async fn plan_copy(
        &self,
        source: &SidedPath,
        dest_dir: &SidedPath,
        policy: &mut ConflictPolicy,
        plan: &mut Vec<PlannedTask>,
    ) -> Result<()> {
        let fs = self.sides.fs(source.side);
        let meta = fs.stat(&source.path).await?;
        let dest_root = dest_dir.with_path(fpath::join(&dest_dir.path, source.file_name()));

        if meta.is_dir && dest_dir.side == source.side && fpath::is_within(&source.path, &dest_root.path)
        {
            return Err(Error::PathUnavailable {
                path: dest_root.path,
                message: "destination lies inside the source directory".to_string(),
            });
        }

        let Some((dest_root, barrier)) = self
            .resolve_root(Verb::Copy, source, dest_root, meta, policy, plan)
            .await?
        else {
            return Ok(());
        };

        if !meta.is_dir {
            plan.push(PlannedTask {
                verb: Verb::Copy,
                source: source.clone(),
                destination: Some(dest_root),
                source_is_dir: false,
                skip: false,
                after_seq: barrier,
            });
            return Ok(());
        }

        // The directory itself first, then contents parent-first.
        plan.push(PlannedTask {
            verb: Verb::Copy,
            source: source.clone(),
            destination: Some(dest_root.clone()),
            source_is_dir: true,
            skip: false,
            after_seq: barrier,
        });
        for entry in self.walk(source.side, &source.path).await? {
            plan.push(PlannedTask {
                verb: Verb::Copy,
                source: source.with_path(entry.path),
                destination: Some(dest_root.with_path(fpath::join(&dest_root.path, &entry.rel))),
                source_is_dir: entry.is_dir,
                skip: false,
                after_seq: barrier,
            });
        }
        Ok(())
    }

    async fn plan_move(
        &self,
        source: &SidedPath,
        dest_dir: &SidedPath,
        policy: &mut ConflictPolicy,
        plan: &mut Vec<PlannedTask>,
    ) -> Result<()> {
        if source.side == dest_dir.side {
            // Single rename, directory or file; the capability moves the
            // whole tree.
            let fs = self.sides.fs(source.side);
            let meta = fs.stat(&source.path).await?;
            let dest_root = dest_dir.with_path(fpath::join(&dest_dir.path, source.file_name()));
            if meta.is_dir && fpath::is_within(&source.path, &dest_root.path) {
                return Err(Error::PathUnavailable {
                    path: dest_root.path,
                    message: "destination lies inside the source directory".to_string(),
                });
            }
            let Some((dest_root, barrier)) = self
                .resolve_root(Verb::Move, source, dest_root, meta, policy, plan)
                .await?
            else {
                return Ok(());
            };
            plan.push(PlannedTask {
                verb: Verb::Move,
                source: source.clone(),
                destination: Some(dest_root),
                source_is_dir: meta.is_dir,
                skip: false,
                after_seq: barrier,
            });
            return Ok(());
        }

        // Cross-side move: copy everything over, then delete the source
        // deepest-first once every copy has settled.
        let before = plan.len();
        self.plan_copy(source, dest_dir, policy, plan).await?;
        if plan.len() == before || plan[before..].iter().all(|t| t.skip) {
            // The whole item was skipped; nothing to delete.
            return Ok(());
        }
        let barrier = plan.len() as u32 - 1;
        self.plan_delete(source, plan).await?;
        for task in plan.iter_mut().skip(barrier as usize + 1) {
            if task.after_seq.is_none() {
                task.after_seq = Some(barrier);
            }
        }
        Ok(())
    }

    async fn plan_delete(&self, source: &SidedPath, plan: &mut Vec<PlannedTask>) -> Result<()> {
        let fs = self.sides.fs(source.side);
        let meta = fs.stat(&source.path).await?;

        let mut targets: Vec<(String, bool)> = Vec::new();
        if meta.is_dir {
            // Reversed pre-order puts every child before its parent.
            let mut walked = self.walk(source.side, &source.path).await?;
            walked.reverse();
            targets.extend(walked.into_iter().map(|e| (e.path, e.is_dir)));
            targets.push((source.path.clone(), true));
        } else {
            targets.push((source.path.clone(), false));
        }

        for (path, is_dir) in targets {
            // Deletes run strictly in order so parents empty out before
            // their own removal.
            let after_seq = if plan.is_empty() {
                None
            } else {
                Some(plan.len() as u32 - 1)
            };
            plan.push(PlannedTask {
                verb: Verb::Delete,
                source: source.with_path(path),
                destination: None,
                source_is_dir: is_dir,
                skip: false,
                after_seq,
            });
        }
        Ok(())
    }

    /// Pre-order walk of a directory tree; directories precede their
    /// contents, listings come back sorted from the capability.
    async fn walk(&self, side: Side, base: &str) -> Result<Vec<WalkEntry>> {
        let fs = self.sides.fs(side);
        let mut out = Vec::new();
        let mut stack: Vec<String> = vec![base.to_string()];

        while let Some(dir) = stack.pop() {
            let entries = fs.list(&dir).await?;
            // Push in reverse so the stack pops subdirectories in listing
            // order.
            let mut pending: Vec<String> = Vec::new();
            for entry in entries {
                let rel = entry
                    .path
                    .strip_prefix(&format!("{}/", base.trim_end_matches('/')))
                    .unwrap_or(&entry.path)
                    .to_string();
                out.push(WalkEntry {
                    path: entry.path.clone(),
                    rel,
                    is_dir: entry.is_dir,
                });
                if entry.is_dir {
                    pending.push(entry.path);
                }
            }
            for dir in pending.into_iter().rev() {
                stack.push(dir);
            }
        }
        Ok(out)
    }
}

fn request_dest(request: &TransferRequest) -> Result<&SidedPath> {
    request.dest_dir.as_ref().ok_or_else(|| Error::InvalidState {
        expected: "destination directory".into(),
        actual: "none".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{PromptChoice, SkipPrompt, StaticPrompt};
    use ferry_test_utils::MemoryFs;
    use std::sync::Arc;

    fn planner_with(remote: MemoryFs, prompt: PromptChoice) -> Planner {
        Planner::new(
            Sides::new(Arc::new(MemoryFs::new()), Arc::new(remote)),
            ConflictResolver::new(Arc::new(StaticPrompt {
                choice: prompt,
                apply_to_all: false,
            })),
        )
    }

    fn planner(remote: MemoryFs) -> Planner {
        Planner::new(
            Sides::new(Arc::new(MemoryFs::new()), Arc::new(remote)),
            ConflictResolver::new(Arc::new(SkipPrompt)),
        )
    }

    #[tokio::test]
    async fn single_file_copy_plans_one_task() {
        let remote = MemoryFs::new();
        remote.add_file("/scratch/a.txt", b"x".to_vec());
        remote.add_dir("/dest");
        let planner = planner(remote);

        let plan = planner
            .plan(&TransferRequest::copy(
                vec![SidedPath::remote("/scratch/a.txt")],
                SidedPath::remote("/dest"),
            ))
            .await
            .unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].destination.as_ref().unwrap().path, "/dest/a.txt");
        assert!(!plan[0].skip);
    }

    #[tokio::test]
    async fn directory_copy_is_parent_first() {
        let remote = MemoryFs::new();
        remote.add_file("/src/tree/a.txt", b"a".to_vec());
        remote.add_file("/src/tree/sub/b.txt", b"b".to_vec());
        remote.add_dir("/dest");
        let planner = planner(remote);

        let plan = planner
            .plan(&TransferRequest::copy(
                vec![SidedPath::remote("/src/tree")],
                SidedPath::remote("/dest"),
            ))
            .await
            .unwrap();

        let paths: Vec<&str> = plan.iter().map(|t| t.source.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["/src/tree", "/src/tree/sub", "/src/tree/a.txt", "/src/tree/sub/b.txt"]
        );
        // Every directory appears before anything inside it.
        let dir_idx = paths.iter().position(|p| *p == "/src/tree/sub").unwrap();
        let file_idx = paths.iter().position(|p| *p == "/src/tree/sub/b.txt").unwrap();
        assert!(dir_idx < file_idx);

        assert_eq!(
            plan[3].destination.as_ref().unwrap().path,
            "/dest/tree/sub/b.txt"
        );
    }

    #[tokio::test]
    async fn directory_delete_is_deepest_first_and_sequential() {
        let remote = MemoryFs::new();
        remote.add_file("/src/tree/a.txt", b"a".to_vec());
        remote.add_file("/src/tree/sub/b.txt", b"b".to_vec());
        let planner = planner(remote);

        let plan = planner
            .plan(&TransferRequest::delete(vec![SidedPath::remote("/src/tree")]))
            .await
            .unwrap();

        let paths: Vec<&str> = plan.iter().map(|t| t.source.path.as_str()).collect();
        // Children strictly before their parents; the root last.
        let sub = paths.iter().position(|p| *p == "/src/tree/sub").unwrap();
        let sub_child = paths.iter().position(|p| *p == "/src/tree/sub/b.txt").unwrap();
        assert!(sub_child < sub);
        assert_eq!(*paths.last().unwrap(), "/src/tree");

        // Deletes chain one after another.
        for (i, task) in plan.iter().enumerate() {
            if i == 0 {
                assert_eq!(task.after_seq, None);
            } else {
                assert_eq!(task.after_seq, Some(i as u32 - 1));
            }
        }
    }

    #[tokio::test]
    async fn same_side_directory_move_is_one_rename() {
        let remote = MemoryFs::new();
        remote.add_file("/src/tree/a.txt", b"a".to_vec());
        remote.add_dir("/dest");
        let planner = planner(remote);

        let plan = planner
            .plan(&TransferRequest::r#move(
                vec![SidedPath::remote("/src/tree")],
                SidedPath::remote("/dest"),
            ))
            .await
            .unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].verb, Verb::Move);
        assert!(plan[0].source_is_dir);
        assert_eq!(plan[0].destination.as_ref().unwrap().path, "/dest/tree");
    }

    #[tokio::test]
    async fn cross_side_move_copies_then_deletes_behind_barrier() {
        let remote = MemoryFs::new();
        remote.add_file("/src/tree/a.txt", b"a".to_vec());
        let local = MemoryFs::new();
        local.add_dir("/downloads");
        let planner = Planner::new(
            Sides::new(Arc::new(local), Arc::new(remote)),
            ConflictResolver::new(Arc::new(SkipPrompt)),
        );

        let plan = planner
            .plan(&TransferRequest::r#move(
                vec![SidedPath::remote("/src/tree")],
                SidedPath::local("/downloads"),
            ))
            .await
            .unwrap();

        let copies: Vec<&PlannedTask> = plan.iter().filter(|t| t.verb == Verb::Copy).collect();
        let deletes: Vec<&PlannedTask> = plan.iter().filter(|t| t.verb == Verb::Delete).collect();
        assert_eq!(copies.len(), 2); // dir + file
        assert_eq!(deletes.len(), 2); // file + dir, deepest first

        let last_copy = plan.iter().rposition(|t| t.verb == Verb::Copy).unwrap() as u32;
        assert!(deletes.iter().all(|t| t.after_seq.unwrap() >= last_copy));
        assert_eq!(deletes[0].source.side, Side::Remote);
        assert_eq!(copies[1].destination.as_ref().unwrap().side, Side::Local);
    }

    #[tokio::test]
    async fn skip_decision_drops_the_whole_item() {
        let remote = MemoryFs::new();
        remote.add_file("/src/tree/a.txt", b"a".to_vec());
        remote.add_dir("/dest/tree"); // collides
        let planner = planner_with(remote, PromptChoice::Skip);

        let plan = planner
            .plan(&TransferRequest::copy(
                vec![SidedPath::remote("/src/tree")],
                SidedPath::remote("/dest"),
            ))
            .await
            .unwrap();

        assert_eq!(plan.len(), 1);
        assert!(plan[0].skip);
    }

    #[tokio::test]
    async fn overwrite_decision_splices_destination_deletes() {
        let remote = MemoryFs::new();
        remote.add_file("/src/a.txt", b"new".to_vec());
        remote.add_file("/dest/a.txt", b"old".to_vec());
        let planner = planner_with(remote, PromptChoice::Overwrite);

        let plan = planner
            .plan(&TransferRequest::copy(
                vec![SidedPath::remote("/src/a.txt")],
                SidedPath::remote("/dest"),
            ))
            .await
            .unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].verb, Verb::Delete);
        assert_eq!(plan[0].source.path, "/dest/a.txt");
        assert_eq!(plan[1].verb, Verb::Copy);
        assert_eq!(plan[1].after_seq, Some(0));
    }

    #[tokio::test]
    async fn rename_decision_reroutes_the_destination() {
        let remote = MemoryFs::new();
        remote.add_file("/src/a.txt", b"new".to_vec());
        remote.add_file("/dest/a.txt", b"old".to_vec());
        let planner = planner_with(remote, PromptChoice::Rename);

        let plan = planner
            .plan(&TransferRequest::copy(
                vec![SidedPath::remote("/src/a.txt")],
                SidedPath::remote("/dest"),
            ))
            .await
            .unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(
            plan[0].destination.as_ref().unwrap().path,
            "/dest/a (1).txt"
        );
    }

    #[tokio::test]
    async fn cancel_decision_aborts_planning() {
        let remote = MemoryFs::new();
        remote.add_file("/src/a.txt", b"new".to_vec());
        remote.add_file("/dest/a.txt", b"old".to_vec());
        let planner = planner_with(remote, PromptChoice::Cancel);

        let err = planner
            .plan(&TransferRequest::copy(
                vec![SidedPath::remote("/src/a.txt")],
                SidedPath::remote("/dest"),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn copy_into_own_subtree_is_rejected() {
        let remote = MemoryFs::new();
        remote.add_file("/src/tree/a.txt", b"a".to_vec());
        let planner = planner(remote);

        let err = planner
            .plan(&TransferRequest::copy(
                vec![SidedPath::remote("/src/tree")],
                SidedPath::remote("/src/tree/sub"),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PathUnavailable { .. }));
    }

    #[tokio::test]
    async fn missing_source_fails_planning() {
        let remote = MemoryFs::new();
        let planner = planner(remote);

        let err = planner
            .plan(&TransferRequest::delete(vec![SidedPath::remote("/absent")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
