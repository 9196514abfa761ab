use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};

use crate::error::WreckitError;
use crate::git::{self, DiffStats, EnsuredBranch, GitFileChange, PreflightIssue};

const CHANNEL_CAPACITY: usize = 64;

/// Commands processed strictly FIFO by the single gateway task. `gh` calls are
/// *not* funneled through this channel -- they run directly against the repo
/// from the caller, matching the spec's "gh invocations are not serialized".
enum GatewayCommand {
    IsRepo { reply: oneshot::Sender<bool> },
    EnsureBranch { base: String, prefix: String, slug: String, reply: oneshot::Sender<Result<EnsuredBranch, WreckitError>> },
    CleanupBranch { name: String, delete_remote: bool, reply: oneshot::Sender<Result<(), WreckitError>> },
    CommitAll { message: String, reply: oneshot::Sender<Result<String, WreckitError>> },
    PushBranch { branch: String, reply: oneshot::Sender<Result<(), WreckitError>> },
    MergeAndPushToBase { branch: String, base: String, reply: oneshot::Sender<Result<(), WreckitError>> },
    GetStatus { reply: oneshot::Sender<Result<Vec<GitFileChange>, WreckitError>> },
    DiffStats { against_ref: String, reply: oneshot::Sender<Result<DiffStats, WreckitError>> },
    AddedLines { against_ref: String, reply: oneshot::Sender<Result<Vec<String>, WreckitError>> },
    GetHeadSha { reply: oneshot::Sender<Result<String, WreckitError>> },
    IsAncestor { sha: String, reply: oneshot::Sender<Result<bool, WreckitError>> },
    CheckPreflight { allowed_remote_patterns: Vec<String>, reply: oneshot::Sender<Vec<PreflightIssue>> },
    CheckMergeConflicts { branch: String, reply: oneshot::Sender<Result<bool, WreckitError>> },
    RunQualityGates { commands: Vec<String>, reply: oneshot::Sender<Result<(), WreckitError>> },
}

/// A cheap, cloneable handle to the single git-serializing task. All `git`
/// invocations issued through this handle are processed strictly in the order
/// they were sent, holding the gateway's attention for the full duration of a
/// multi-step command (e.g. `check_merge_conflicts`'s checkout+compare+restore).
#[derive(Clone)]
pub struct GatewayHandle {
    sender: mpsc::Sender<GatewayCommand>,
}

impl GatewayHandle {
    async fn send<T>(&self, command: GatewayCommand, rx: oneshot::Receiver<T>) -> T {
        // The gateway task only stops when every handle (including this one) is
        // dropped, so a send failure here would mean a logic bug, not a runtime
        // condition callers need to handle; surfacing it as a panic matches the
        // "never silently drop a git command" requirement.
        if self.sender.send(command).await.is_err() {
            panic!("git gateway task is not running");
        }
        rx.await.expect("git gateway dropped its reply channel")
    }

    pub async fn is_repo(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(GatewayCommand::IsRepo { reply }, rx).await
    }

    pub async fn ensure_branch(&self, base: &str, prefix: &str, slug: &str) -> Result<EnsuredBranch, WreckitError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            GatewayCommand::EnsureBranch { base: base.to_string(), prefix: prefix.to_string(), slug: slug.to_string(), reply },
            rx,
        )
        .await
    }

    pub async fn cleanup_branch(&self, name: &str, delete_remote: bool) -> Result<(), WreckitError> {
        let (reply, rx) = oneshot::channel();
        self.send(GatewayCommand::CleanupBranch { name: name.to_string(), delete_remote, reply }, rx).await
    }

    pub async fn commit_all(&self, message: &str) -> Result<String, WreckitError> {
        let (reply, rx) = oneshot::channel();
        self.send(GatewayCommand::CommitAll { message: message.to_string(), reply }, rx).await
    }

    pub async fn push_branch(&self, branch: &str) -> Result<(), WreckitError> {
        let (reply, rx) = oneshot::channel();
        self.send(GatewayCommand::PushBranch { branch: branch.to_string(), reply }, rx).await
    }

    pub async fn merge_and_push_to_base(&self, branch: &str, base: &str) -> Result<(), WreckitError> {
        let (reply, rx) = oneshot::channel();
        self.send(GatewayCommand::MergeAndPushToBase { branch: branch.to_string(), base: base.to_string(), reply }, rx).await
    }

    pub async fn get_status(&self) -> Result<Vec<GitFileChange>, WreckitError> {
        let (reply, rx) = oneshot::channel();
        self.send(GatewayCommand::GetStatus { reply }, rx).await
    }

    pub async fn diff_stats(&self, against_ref: &str) -> Result<DiffStats, WreckitError> {
        let (reply, rx) = oneshot::channel();
        self.send(GatewayCommand::DiffStats { against_ref: against_ref.to_string(), reply }, rx).await
    }

    pub async fn added_lines(&self, against_ref: &str) -> Result<Vec<String>, WreckitError> {
        let (reply, rx) = oneshot::channel();
        self.send(GatewayCommand::AddedLines { against_ref: against_ref.to_string(), reply }, rx).await
    }

    pub async fn get_head_sha(&self) -> Result<String, WreckitError> {
        let (reply, rx) = oneshot::channel();
        self.send(GatewayCommand::GetHeadSha { reply }, rx).await
    }

    pub async fn is_ancestor(&self, sha: &str) -> Result<bool, WreckitError> {
        let (reply, rx) = oneshot::channel();
        self.send(GatewayCommand::IsAncestor { sha: sha.to_string(), reply }, rx).await
    }

    pub async fn check_preflight(&self, allowed_remote_patterns: &[String]) -> Vec<PreflightIssue> {
        let (reply, rx) = oneshot::channel();
        self.send(
            GatewayCommand::CheckPreflight { allowed_remote_patterns: allowed_remote_patterns.to_vec(), reply },
            rx,
        )
        .await
    }

    /// Holds the gateway's attention for the whole checkout+compare+restore
    /// sequence, matching the spec's atomicity requirement for this operation.
    pub async fn check_merge_conflicts(&self, branch: &str) -> Result<bool, WreckitError> {
        let (reply, rx) = oneshot::channel();
        self.send(GatewayCommand::CheckMergeConflicts { branch: branch.to_string(), reply }, rx).await
    }

    pub async fn run_quality_gates(&self, commands: &[String]) -> Result<(), WreckitError> {
        let (reply, rx) = oneshot::channel();
        self.send(GatewayCommand::RunQualityGates { commands: commands.to_vec(), reply }, rx).await
    }
}

async fn run_gateway(mut rx: mpsc::Receiver<GatewayCommand>, repo_dir: PathBuf) {
    while let Some(command) = rx.recv().await {
        match command {
            GatewayCommand::IsRepo { reply } => {
                let _ = reply.send(git::is_repo(&repo_dir));
            }
            GatewayCommand::EnsureBranch { base, prefix, slug, reply } => {
                let _ = reply.send(git::ensure_branch(&base, &prefix, &slug, &repo_dir));
            }
            GatewayCommand::CleanupBranch { name, delete_remote, reply } => {
                let _ = reply.send(git::cleanup_branch(&name, delete_remote, &repo_dir));
            }
            GatewayCommand::CommitAll { message, reply } => {
                let _ = reply.send(git::commit_all(&message, &repo_dir));
            }
            GatewayCommand::PushBranch { branch, reply } => {
                let _ = reply.send(git::push_branch(&branch, &repo_dir));
            }
            GatewayCommand::MergeAndPushToBase { branch, base, reply } => {
                let _ = reply.send(git::merge_and_push_to_base(&branch, &base, &repo_dir));
            }
            GatewayCommand::GetStatus { reply } => {
                let _ = reply.send(git::get_status(&repo_dir));
            }
            GatewayCommand::DiffStats { against_ref, reply } => {
                let _ = reply.send(git::diff_stats(&against_ref, &repo_dir));
            }
            GatewayCommand::AddedLines { against_ref, reply } => {
                let _ = reply.send(git::added_lines_from_diff(&repo_dir, &against_ref));
            }
            GatewayCommand::GetHeadSha { reply } => {
                let _ = reply.send(git::get_head_sha(&repo_dir));
            }
            GatewayCommand::IsAncestor { sha, reply } => {
                let _ = reply.send(git::is_ancestor(&sha, &repo_dir));
            }
            GatewayCommand::CheckPreflight { allowed_remote_patterns, reply } => {
                let _ = reply.send(git::check_git_preflight(&repo_dir, &allowed_remote_patterns));
            }
            GatewayCommand::CheckMergeConflicts { branch, reply } => {
                let _ = reply.send(git::check_merge_conflicts(&branch, &repo_dir));
            }
            GatewayCommand::RunQualityGates { commands, reply } => {
                let _ = reply.send(git::run_quality_gates(&commands, &repo_dir));
            }
        }
    }
}

/// Spawn the single task that owns every serialized `git` invocation for this
/// process. Every caller clones the returned `GatewayHandle`; the FIFO ordering
/// falls out of the underlying `mpsc` channel's delivery order, not an explicit
/// lock.
pub fn spawn_gateway(repo_dir: PathBuf) -> (GatewayHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let task = tokio::spawn(run_gateway(rx, repo_dir));
    (GatewayHandle { sender: tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn init_repo(dir: &std::path::Path) {
        StdCommand::new("git").arg("init").arg("-q").current_dir(dir).status().unwrap();
        StdCommand::new("git").args(["config", "user.email", "t@example.com"]).current_dir(dir).status().unwrap();
        StdCommand::new("git").args(["config", "user.name", "t"]).current_dir(dir).status().unwrap();
        std::fs::write(dir.join("README.md"), "hi").unwrap();
        StdCommand::new("git").args(["add", "."]).current_dir(dir).status().unwrap();
        StdCommand::new("git").args(["commit", "-q", "-m", "init"]).current_dir(dir).status().unwrap();
    }

    #[tokio::test]
    async fn is_repo_true_after_init() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let (handle, _task) = spawn_gateway(dir.path().to_path_buf());
        assert!(handle.is_repo().await);
    }

    #[tokio::test]
    async fn commit_all_then_head_sha_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let (handle, _task) = spawn_gateway(dir.path().to_path_buf());
        std::fs::write(dir.path().join("a.txt"), "content").unwrap();
        let sha = handle.commit_all("[001-foo][research] add a.txt").await.unwrap();
        let head = handle.get_head_sha().await.unwrap();
        assert_eq!(sha, head);
    }

    #[tokio::test]
    async fn get_status_reports_untracked_file() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let (handle, _task) = spawn_gateway(dir.path().to_path_buf());
        std::fs::write(dir.path().join("new.txt"), "x").unwrap();
        let status = handle.get_status().await.unwrap();
        assert!(status.iter().any(|c| c.path == "new.txt"));
    }
}
