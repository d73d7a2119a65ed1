//! In-memory fakes for the external collaborators (testing only)
//!
//! Provides `FakeVcs`, `FakeManifest`, `FakeReleaseTool`, `FakeAuditTool` and
//! `ScriptedPrompter`, which satisfy the capability traits without git,
//! network access or subprocesses.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::audit::AuditTool;
use crate::error::Result;
use crate::exec::CommandOutput;
use crate::gate::Prompter;
use crate::manifest::ManifestReader;
use crate::model::DeployTarget;
use crate::release::ReleaseTool;
use crate::vcs::VersionControl;

const DEFAULT_BRANCH: &str = "main";

// ---------------------------------------------------------------------------
// FakeVcs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct RemoteRepo {
    commit: String,
    tags: BTreeMap<String, String>,
}

/// State of one cloned working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCopy {
    pub repo: String,
    /// Commit HEAD points at.
    pub head: String,
    /// Branch name, or the commit id when detached.
    pub current_ref: String,
    /// Commit the local default branch points at.
    pub branch_commit: String,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct VcsState {
    remotes: BTreeMap<String, RemoteRepo>,
    locals: BTreeMap<PathBuf, LocalCopy>,
    failing: BTreeSet<String>,
    failing_for: BTreeSet<(String, String)>,
    calls: Vec<(String, PathBuf)>,
}

impl VcsState {
    fn should_fail(&self, op: &str, repo: &str) -> bool {
        self.failing.contains(op)
            || self
                .failing_for
                .contains(&(op.to_string(), repo.to_string()))
    }

    /// Longest configured remote name contained in `url`.
    fn remote_for_url(&self, url: &str) -> Option<String> {
        self.remotes
            .keys()
            .filter(|name| url.contains(name.as_str()))
            .max_by_key(|name| name.len())
            .cloned()
    }
}

/// In-memory version control: remotes are named repositories with a tip
/// commit and tags; working copies are tracked by directory.
#[derive(Debug, Default)]
pub struct FakeVcs {
    state: Mutex<VcsState>,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_remote(&self, name: &str, commit: &str) {
        let mut state = self.state.lock().unwrap();
        state.remotes.insert(
            name.to_string(),
            RemoteRepo {
                commit: commit.to_string(),
                tags: BTreeMap::new(),
            },
        );
    }

    /// Move the remote default branch to `commit`.
    pub fn set_remote_commit(&self, name: &str, commit: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(remote) = state.remotes.get_mut(name) {
            remote.commit = commit.to_string();
        }
    }

    pub fn add_remote_tag(&self, name: &str, tag: &str, commit: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(remote) = state.remotes.get_mut(name) {
            remote.tags.insert(tag.to_string(), commit.to_string());
        }
    }

    pub fn remote_has_tag(&self, name: &str, tag: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .remotes
            .get(name)
            .is_some_and(|r| r.tags.contains_key(tag))
    }

    /// Make every call of `op` fail.
    pub fn fail_operation(&self, op: &str) {
        self.state.lock().unwrap().failing.insert(op.to_string());
    }

    /// Make `op` fail for one repository only.
    pub fn fail_operation_for(&self, op: &str, repo: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_for
            .insert((op.to_string(), repo.to_string()));
    }

    /// Number of calls made to `op`.
    pub fn calls_for(&self, op: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.iter().filter(|(o, _)| o == op).count()
    }

    pub fn local_state(&self, dir: &Path) -> Option<LocalCopy> {
        self.state.lock().unwrap().locals.get(dir).cloned()
    }

    /// Record the call, then apply `f` to the working copy in `dir`.
    fn with_local<F>(&self, op: &str, dir: &Path, f: F) -> CommandOutput
    where
        F: FnOnce(&mut LocalCopy, Option<&mut RemoteRepo>) -> CommandOutput,
    {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.calls.push((op.to_string(), dir.to_path_buf()));

        let Some(local) = state.locals.get_mut(dir) else {
            return CommandOutput::failed(format!(
                "fatal: not a git repository: {}",
                dir.display()
            ));
        };
        if state.failing.contains(op)
            || state
                .failing_for
                .contains(&(op.to_string(), local.repo.clone()))
        {
            return CommandOutput::failed(format!("fatal: {op} failed for {}", local.repo));
        }
        let remote = state.remotes.get_mut(&local.repo);
        f(local, remote)
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn clone_repo(&self, url: &str, dir: &Path, _depth: Option<u32>) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        state.calls.push(("clone".to_string(), dir.to_path_buf()));

        let Some(name) = state.remote_for_url(url) else {
            return CommandOutput::failed(format!("ERROR: Repository not found: {url}"));
        };
        if state.should_fail("clone", &name) {
            return CommandOutput::failed(format!("fatal: clone failed for {name}"));
        }
        let remote = state.remotes[&name].clone();
        state.locals.insert(
            dir.to_path_buf(),
            LocalCopy {
                repo: name,
                head: remote.commit.clone(),
                current_ref: DEFAULT_BRANCH.to_string(),
                branch_commit: remote.commit,
                tags: remote.tags,
            },
        );
        CommandOutput::ok("")
    }

    async fn fetch(&self, dir: &Path) -> CommandOutput {
        self.with_local("fetch", dir, |local, remote| {
            if let Some(remote) = remote {
                local.tags = remote.tags.clone();
            }
            CommandOutput::ok("")
        })
    }

    async fn reset_to_remote_default(&self, dir: &Path) -> CommandOutput {
        self.with_local("reset", dir, |local, remote| {
            let Some(remote) = remote else {
                return CommandOutput::failed("fatal: remote gone");
            };
            local.head = remote.commit.clone();
            local.branch_commit = remote.commit.clone();
            local.current_ref = DEFAULT_BRANCH.to_string();
            CommandOutput::ok("")
        })
    }

    async fn head_commit(&self, dir: &Path) -> CommandOutput {
        self.with_local("head", dir, |local, _| {
            CommandOutput::ok(format!("{}\n", local.head))
        })
    }

    async fn current_ref(&self, dir: &Path) -> CommandOutput {
        self.with_local("current_ref", dir, |local, _| {
            CommandOutput::ok(format!("{}\n", local.current_ref))
        })
    }

    async fn checkout(&self, dir: &Path, reference: &str) -> CommandOutput {
        self.with_local("checkout", dir, |local, _| {
            if reference == DEFAULT_BRANCH {
                local.head = local.branch_commit.clone();
                local.current_ref = DEFAULT_BRANCH.to_string();
            } else if let Some(commit) = local.tags.get(reference).cloned() {
                local.head = commit.clone();
                local.current_ref = commit;
            } else if reference == local.head
                || reference == local.branch_commit
                || local.tags.values().any(|c| c == reference)
            {
                local.head = reference.to_string();
                local.current_ref = reference.to_string();
            } else {
                return CommandOutput::failed(format!(
                    "error: pathspec '{reference}' did not match any file(s) known to git"
                ));
            }
            CommandOutput::ok("")
        })
    }

    async fn tag_exists(&self, dir: &Path, tag: &str) -> bool {
        self.with_local("tag_exists", dir, |local, _| {
            if local.tags.contains_key(tag) {
                CommandOutput::ok("")
            } else {
                CommandOutput::failed("")
            }
        })
        .success
    }

    async fn create_tag(&self, dir: &Path, tag: &str, _message: &str) -> CommandOutput {
        self.with_local("create_tag", dir, |local, _| {
            if local.tags.contains_key(tag) {
                return CommandOutput::failed(format!("fatal: tag '{tag}' already exists"));
            }
            local.tags.insert(tag.to_string(), local.head.clone());
            CommandOutput::ok("")
        })
    }

    async fn push_tag(&self, dir: &Path, tag: &str) -> CommandOutput {
        self.with_local("push_tag", dir, |local, remote| {
            let (Some(commit), Some(remote)) = (local.tags.get(tag), remote) else {
                return CommandOutput::failed(format!("error: src refspec {tag} does not match any"));
            };
            remote.tags.insert(tag.to_string(), commit.clone());
            CommandOutput::ok(format!(" * [new tag]         {tag} -> {tag}\n"))
        })
    }

    async fn delete_tag(&self, dir: &Path, tag: &str) -> CommandOutput {
        self.with_local("delete_tag", dir, |local, _| match local.tags.remove(tag) {
            Some(_) => CommandOutput::ok(format!("Deleted tag '{tag}'\n")),
            None => CommandOutput::failed(format!("error: tag '{tag}' not found.")),
        })
    }

    async fn delete_remote_tag(&self, dir: &Path, tag: &str) -> CommandOutput {
        self.with_local("delete_remote_tag", dir, |_, remote| {
            match remote.and_then(|r| r.tags.remove(tag)) {
                Some(_) => CommandOutput::ok(format!(" - [deleted]         {tag}\n")),
                None => CommandOutput::failed(format!(
                    "error: unable to delete '{tag}': remote ref does not exist"
                )),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// FakeManifest
// ---------------------------------------------------------------------------

/// Resolves versions by (repository, commit) of the working copy in `dir`,
/// so reads follow scoped checkouts made through a [`FakeVcs`].
#[derive(Debug)]
pub struct FakeManifest {
    vcs: Arc<FakeVcs>,
    versions: Mutex<BTreeMap<(String, String), String>>,
}

impl FakeManifest {
    pub fn new(vcs: Arc<FakeVcs>) -> Self {
        Self {
            vcs,
            versions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn set_version(&self, repo: &str, commit: &str, version: &str) {
        self.versions
            .lock()
            .unwrap()
            .insert((repo.to_string(), commit.to_string()), version.to_string());
    }
}

#[async_trait]
impl ManifestReader for FakeManifest {
    async fn resolved_version(&self, dir: &Path, _dependency: &str) -> Result<Option<String>> {
        let Some(local) = self.vcs.local_state(dir) else {
            return Ok(None);
        };
        let versions = self.versions.lock().unwrap();
        Ok(versions.get(&(local.repo, local.head)).cloned())
    }
}

// ---------------------------------------------------------------------------
// FakeReleaseTool
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ReleaseState {
    failing_deploys: BTreeSet<(String, String)>,
    failing_ssh: BTreeSet<String>,
    failing_before: bool,
    failing_prepare: BTreeSet<String>,
    prepared: Vec<PathBuf>,
    deploys: Vec<(PathBuf, String)>,
    targets: Vec<(PathBuf, DeployTarget)>,
    remote_commands: Vec<(PathBuf, String, String)>,
    ssh_checks: Vec<PathBuf>,
    server_urls: BTreeMap<(String, String), String>,
    busy: BTreeSet<PathBuf>,
    overlapped: bool,
}

/// Records every invocation and tracks how many deploys run at once.
#[derive(Debug, Default)]
pub struct FakeReleaseTool {
    state: Mutex<ReleaseState>,
    delay: Option<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeReleaseTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold each deploy for `delay` so overlapping runs are observable.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail_deploy(&self, repo: &str, environment: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_deploys
            .insert((repo.to_string(), environment.to_string()));
    }

    pub fn fail_ssh(&self, repo: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_ssh
            .insert(repo.to_string());
    }

    pub fn fail_prepare(&self, repo: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_prepare
            .insert(repo.to_string());
    }

    pub fn fail_before_command(&self) {
        self.state.lock().unwrap().failing_before = true;
    }

    pub fn set_server_url(&self, repo: &str, environment: &str, url: &str) {
        self.state
            .lock()
            .unwrap()
            .server_urls
            .insert((repo.to_string(), environment.to_string()), url.to_string());
    }

    /// (directory, environment) of every deploy, in call order.
    pub fn deploys(&self) -> Vec<(PathBuf, String)> {
        self.state.lock().unwrap().deploys.clone()
    }

    pub fn targets(&self) -> Vec<(PathBuf, DeployTarget)> {
        self.state.lock().unwrap().targets.clone()
    }

    pub fn remote_commands(&self) -> Vec<(PathBuf, String, String)> {
        self.state.lock().unwrap().remote_commands.clone()
    }

    /// Directories prepared, in call order.
    pub fn prepared(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().prepared.clone()
    }

    pub fn ssh_checks(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().ssh_checks.clone()
    }

    /// Highest number of deploys observed running at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// True if two deploys ever ran against the same directory at once.
    pub fn saw_same_dir_overlap(&self) -> bool {
        self.state.lock().unwrap().overlapped
    }
}

fn dir_matches(dir: &Path, repo: &str) -> bool {
    dir.ends_with(repo)
}

#[async_trait]
impl ReleaseTool for FakeReleaseTool {
    async fn prepare(&self, dir: &Path) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        state.prepared.push(dir.to_path_buf());
        if state.failing_prepare.iter().any(|repo| dir_matches(dir, repo)) {
            CommandOutput::failed("Could not find gem 'rails' in any of the gem sources\n")
        } else {
            CommandOutput::ok("Bundle complete!\n")
        }
    }

    async fn set_non_interactive_target(&self, dir: &Path, target: &DeployTarget) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .targets
            .push((dir.to_path_buf(), target.clone()));
        Ok(())
    }

    async fn deploy(&self, dir: &Path, environment: &str) -> CommandOutput {
        let fail = {
            let mut state = self.state.lock().unwrap();
            state.deploys.push((dir.to_path_buf(), environment.to_string()));
            if !state.busy.insert(dir.to_path_buf()) {
                state.overlapped = true;
            }
            state
                .failing_deploys
                .iter()
                .any(|(repo, env)| env == environment && dir_matches(dir, repo))
        };
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.state.lock().unwrap().busy.remove(dir);

        if fail {
            CommandOutput::failed(format!(
                "cap aborted!\nSSHKit::Runner::ExecuteError: deploy of {} to {environment} failed\n",
                dir.display()
            ))
        } else {
            CommandOutput::ok(format!("deployed {} to {environment}\n", dir.display()))
        }
    }

    async fn remote_execute(&self, dir: &Path, environment: &str, command: &str) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        state.remote_commands.push((
            dir.to_path_buf(),
            environment.to_string(),
            command.to_string(),
        ));
        if state.failing_before {
            CommandOutput::failed(format!("remote_execute['{command}'] failed\n"))
        } else {
            CommandOutput::ok(format!("ran '{command}' on {environment}\n"))
        }
    }

    async fn ssh_check(&self, dir: &Path, environment: &str) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        state.ssh_checks.push(dir.to_path_buf());
        if state.failing_ssh.iter().any(|repo| dir_matches(dir, repo)) {
            CommandOutput::failed(format!("ssh to {environment} hosts refused\n"))
        } else {
            CommandOutput::ok(format!("ssh to {environment} hosts ok\n"))
        }
    }

    async fn configured_server_url(&self, dir: &Path, environment: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .server_urls
            .iter()
            .find(|((repo, env), _)| env == environment && dir_matches(dir, repo))
            .map(|(_, url)| url.clone())
    }
}

// ---------------------------------------------------------------------------
// FakeAuditTool
// ---------------------------------------------------------------------------

/// Returns a canned output per repository; unknown repositories are clean.
#[derive(Debug, Default)]
pub struct FakeAuditTool {
    outputs: Mutex<BTreeMap<String, CommandOutput>>,
    audited: Mutex<Vec<PathBuf>>,
}

impl FakeAuditTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_output(&self, repo: &str, output: CommandOutput) {
        self.outputs
            .lock()
            .unwrap()
            .insert(repo.to_string(), output);
    }

    pub fn audited(&self) -> Vec<PathBuf> {
        self.audited.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditTool for FakeAuditTool {
    async fn audit(&self, dir: &Path) -> CommandOutput {
        self.audited.lock().unwrap().push(dir.to_path_buf());
        let outputs = self.outputs.lock().unwrap();
        outputs
            .iter()
            .find(|(repo, _)| dir_matches(dir, repo))
            .map(|(_, out)| out.clone())
            .unwrap_or_else(|| CommandOutput::ok("No vulnerabilities found\n"))
    }
}

// ---------------------------------------------------------------------------
// ScriptedPrompter
// ---------------------------------------------------------------------------

/// Answers questions from a queue and records them. Declines once the queue
/// runs out.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: Mutex<VecDeque<bool>>,
    questions: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new(answers: Vec<bool>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            questions: Mutex::new(Vec::new()),
        }
    }

    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().unwrap().clone()
    }
}

impl Prompter for ScriptedPrompter {
    fn confirm(&self, question: &str, _default: bool) -> bool {
        self.questions.lock().unwrap().push(question.to_string());
        self.answers.lock().unwrap().pop_front().unwrap_or(false)
    }
}
