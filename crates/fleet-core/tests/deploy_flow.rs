//! End-to-end deploy runs against in-memory collaborators.
//!
//! Covers:
//! - fan-out unit planning and stable result ordering
//! - failure isolation with verbatim failed output
//! - pre-flight gates abort before any unit is dispatched
//! - bounded parallelism with sequential units per repository
//! - before-command, progress file and prune safety
//! - per-repository audit and working-copy preparation

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::fakes::{FakeAuditTool, FakeManifest, FakeReleaseTool, FakeVcs, ScriptedPrompter};
use fleet_core::{
    AuditOutcome, CommandOutput, DeployOrchestrator, DeployRequest, DeployTarget, FleetConfig,
    FleetError, ProgressFileConfig, RepoCache, RepoSelection, Repository, UnitState,
};
use tempfile::TempDir;

struct Fleet {
    tmp: TempDir,
    vcs: Arc<FakeVcs>,
    release: Arc<FakeReleaseTool>,
    config: Arc<FleetConfig>,
    cache: RepoCache,
}

impl Fleet {
    fn new(repos: Vec<Repository>, release: FakeReleaseTool) -> Self {
        Self::with_config(repos, release, |_| {})
    }

    fn with_config(
        repos: Vec<Repository>,
        release: FakeReleaseTool,
        tweak: impl FnOnce(&mut FleetConfig),
    ) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let vcs = Arc::new(FakeVcs::new());
        for repo in &repos {
            vcs.add_remote(&repo.name, "c1");
        }
        let environments: BTreeMap<String, String> = ["stage", "qa", "prod"]
            .iter()
            .map(|env| (env.to_string(), format!("https://status.example.org/{env}")))
            .collect();
        let mut config = FleetConfig {
            cache_root: tmp.path().join("repos"),
            num_parallel_processes: 2,
            environments,
            repositories: repos,
            ..Default::default()
        };
        tweak(&mut config);
        let config = Arc::new(config);
        let cache = RepoCache::new(Arc::clone(&config), vcs.clone());
        Self {
            tmp,
            vcs,
            release: Arc::new(release),
            config,
            cache,
        }
    }

    fn orchestrator(&self) -> DeployOrchestrator {
        let manifest = Arc::new(FakeManifest::new(self.vcs.clone()));
        DeployOrchestrator::new(
            Arc::clone(&self.config),
            self.cache.clone(),
            self.release.clone(),
            manifest,
        )
    }

    fn tag_everywhere(&self, tag: &str) {
        for repo in &self.config.repositories {
            self.vcs.add_remote_tag(&repo.name, tag, "c1");
        }
    }
}

fn request(env: &str, target: DeployTarget) -> DeployRequest {
    DeployRequest {
        environment: env.to_string(),
        target,
        selection: RepoSelection::default(),
        skip_update: false,
    }
}

fn tag(name: &str) -> DeployTarget {
    DeployTarget::Tag(name.to_string())
}

// ---- Fan-out ----

#[tokio::test]
async fn fan_out_produces_one_result_per_unit() {
    let fleet = Fleet::new(
        vec![
            Repository::new("A"),
            Repository::new("B").with_fan_out("prod", "extra"),
        ],
        FakeReleaseTool::new(),
    );
    fleet.tag_everywhere("rel-1");
    let prompter = ScriptedPrompter::new(vec![]);

    let run = fleet
        .orchestrator()
        .run(&request("prod", tag("rel-1")), &prompter)
        .await
        .expect("deploy run");

    let units: Vec<(&str, &str)> = run
        .results
        .iter()
        .map(|r| (r.repo(), r.environment()))
        .collect();
    assert_eq!(units, vec![("A", "prod"), ("B", "prod"), ("B", "extra")]);
    assert!(run.all_succeeded());
    assert!(prompter.questions().is_empty());
    assert_eq!(
        run.status_page.as_deref(),
        Some("https://status.example.org/prod")
    );
    assert!(fleet
        .release
        .targets()
        .iter()
        .all(|(_, t)| *t == tag("rel-1")));
}

// ---- Failure isolation ----

#[tokio::test]
async fn failed_unit_keeps_output_and_siblings_unaffected() {
    let release = FakeReleaseTool::new();
    release.fail_deploy("B", "prod");
    let repos = vec![
        Repository::new("A"),
        Repository::new("B").with_fan_out("prod", "extra"),
        Repository::new("C"),
    ];
    let fleet = Fleet::new(repos.clone(), release);
    fleet.cache.sync_all(&repos).await.unwrap();

    let results = fleet
        .orchestrator()
        .deploy_all(&repos, "prod", &DeployTarget::DefaultBranch)
        .await;

    assert_eq!(results.len(), 4);
    let failed: Vec<_> = results.iter().filter(|r| !r.succeeded()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].state, UnitState::Failed);
    assert_eq!((failed[0].repo(), failed[0].environment()), ("B", "prod"));
    assert!(failed[0]
        .output
        .contains("cap aborted!\nSSHKit::Runner::ExecuteError"));

    let b_extra = results
        .iter()
        .find(|r| r.repo() == "B" && r.environment() == "extra")
        .unwrap();
    assert!(b_extra.succeeded());
    assert!(results.iter().all(|r| r.state.is_terminal()));
}

// ---- Pre-flight gates ----

#[tokio::test]
async fn declined_default_branch_confirmation_dispatches_nothing() {
    let fleet = Fleet::new(vec![Repository::new("A")], FakeReleaseTool::new());
    let prompter = ScriptedPrompter::new(vec![false]);

    let err = fleet
        .orchestrator()
        .run(&request("stage", DeployTarget::DefaultBranch), &prompter)
        .await
        .unwrap_err();

    assert!(matches!(err, FleetError::ConfirmationDeclined { .. }));
    assert!(fleet.release.deploys().is_empty());
}

#[tokio::test]
async fn approval_prompt_names_flagged_repos() {
    let fleet = Fleet::new(
        vec![
            Repository::new("A").requiring_confirmation("prod"),
            Repository::new("B"),
        ],
        FakeReleaseTool::new(),
    );
    fleet.tag_everywhere("rel-1");
    let prompter = ScriptedPrompter::new(vec![true]);

    let run = fleet
        .orchestrator()
        .run(&request("prod", tag("rel-1")), &prompter)
        .await
        .unwrap();

    assert_eq!(run.results.len(), 2);
    let questions = prompter.questions();
    assert_eq!(questions.len(), 1);
    assert!(questions[0].contains("(A)"));
}

#[tokio::test]
async fn missing_tag_aborts_and_names_repos() {
    let fleet = Fleet::new(
        vec![Repository::new("A"), Repository::new("B")],
        FakeReleaseTool::new(),
    );
    fleet.vcs.add_remote_tag("A", "rel-9", "c1");
    let prompter = ScriptedPrompter::new(vec![true, true]);

    let err = fleet
        .orchestrator()
        .run(&request("qa", tag("rel-9")), &prompter)
        .await
        .unwrap_err();

    match err {
        FleetError::MissingTag { repos, .. } => assert_eq!(repos, vec!["B".to_string()]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(fleet.release.deploys().is_empty());
}

#[tokio::test]
async fn unsupported_environment_is_rejected() {
    let fleet = Fleet::new(vec![Repository::new("A")], FakeReleaseTool::new());
    let prompter = ScriptedPrompter::new(vec![true]);
    let err = fleet
        .orchestrator()
        .run(&request("moon", DeployTarget::DefaultBranch), &prompter)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Config(_)));
}

#[tokio::test]
async fn failed_cache_sync_aborts_before_dispatch() {
    let fleet = Fleet::new(vec![Repository::new("A")], FakeReleaseTool::new());
    fleet.vcs.fail_operation("clone");
    let prompter = ScriptedPrompter::new(vec![true]);

    let err = fleet
        .orchestrator()
        .run(&request("stage", DeployTarget::DefaultBranch), &prompter)
        .await
        .unwrap_err();

    assert!(matches!(err, FleetError::CacheCreate { .. }));
    assert!(prompter.questions().is_empty());
    assert!(fleet.release.deploys().is_empty());
}

// ---- Concurrency ----

#[tokio::test]
async fn parallelism_is_bounded_and_units_of_a_repo_never_overlap() {
    let repos: Vec<Repository> = (0..6)
        .map(|i| Repository::new(format!("org/svc-{i}")).with_fan_out("prod", "extra"))
        .collect();
    let fleet = Fleet::new(
        repos.clone(),
        FakeReleaseTool::with_delay(Duration::from_millis(20)),
    );
    fleet.cache.sync_all(&repos).await.unwrap();

    let results = fleet
        .orchestrator()
        .deploy_all(&repos, "prod", &DeployTarget::DefaultBranch)
        .await;

    assert_eq!(results.len(), 12);
    assert!(fleet.release.max_concurrency() <= 2);
    assert!(!fleet.release.saw_same_dir_overlap());

    let names: Vec<&str> = results.iter().map(|r| r.repo()).collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
}

// ---- Supplements ----

#[tokio::test]
async fn before_command_output_is_kept_and_failure_is_not_fatal() {
    let release = FakeReleaseTool::new();
    release.fail_before_command();
    let repos = vec![Repository::new("A")];
    let fleet = Fleet::new(repos.clone(), release);
    fleet.cache.sync_all(&repos).await.unwrap();

    let results = fleet
        .orchestrator()
        .with_before_command("sudo systemctl restart sidekiq")
        .deploy_all(&repos, "qa", &DeployTarget::DefaultBranch)
        .await;

    assert!(results[0].succeeded());
    assert!(results[0].output.contains("remote_execute"));
    let commands = fleet.release.remote_commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].2, "sudo systemctl restart sidekiq");
}

#[tokio::test]
async fn progress_file_written_per_repository() {
    let progress_dir = tempfile::tempdir().unwrap();
    let location = progress_dir.path().to_path_buf();
    let repos = vec![Repository::new("sul-dlss/argo")];
    let fleet = Fleet::with_config(repos.clone(), FakeReleaseTool::new(), |config| {
        config.progress_file = ProgressFileConfig {
            enabled: true,
            location,
        };
    });
    fleet.cache.sync_all(&repos).await.unwrap();

    fleet
        .orchestrator()
        .deploy_all(&repos, "stage", &DeployTarget::DefaultBranch)
        .await;

    let text = std::fs::read_to_string(progress_dir.path().join("argo-deploy.log")).unwrap();
    assert!(text.ends_with("sul-dlss/argo deploy complete"));
}

#[tokio::test]
async fn skip_listed_repos_are_dropped_from_the_run() {
    let fleet = Fleet::new(
        vec![Repository::new("A").skipping("qa"), Repository::new("B")],
        FakeReleaseTool::new(),
    );
    fleet.tag_everywhere("rel-1");
    let prompter = ScriptedPrompter::new(vec![]);

    let run = fleet
        .orchestrator()
        .run(&request("qa", tag("rel-1")), &prompter)
        .await
        .unwrap();

    assert_eq!(run.results.len(), 1);
    assert_eq!(run.results[0].repo(), "B");
}

#[tokio::test]
async fn excluded_primary_still_deploys_its_fan_out() {
    let fleet = Fleet::new(
        vec![
            Repository::new("A"),
            Repository::new("B")
                .with_fan_out("prod", "extra")
                .excluding("prod"),
        ],
        FakeReleaseTool::new(),
    );
    fleet.tag_everywhere("rel-1");
    let prompter = ScriptedPrompter::new(vec![]);

    let run = fleet
        .orchestrator()
        .run(&request("prod", tag("rel-1")), &prompter)
        .await
        .unwrap();

    let units: Vec<(&str, &str, bool)> = run
        .results
        .iter()
        .map(|r| (r.repo(), r.environment(), r.unit.primary))
        .collect();
    assert_eq!(units, vec![("A", "prod", true), ("B", "extra", false)]);
    assert_eq!(fleet.release.deploys().len(), 2);
}

#[tokio::test]
async fn skipped_primary_drops_the_fan_out_too() {
    let fleet = Fleet::new(
        vec![
            Repository::new("A"),
            Repository::new("B")
                .with_fan_out("prod", "extra")
                .skipping("prod"),
        ],
        FakeReleaseTool::new(),
    );
    fleet.tag_everywhere("rel-1");

    let run = fleet
        .orchestrator()
        .run(&request("prod", tag("rel-1")), &ScriptedPrompter::new(vec![]))
        .await
        .unwrap();

    let repos: Vec<&str> = run.results.iter().map(|r| r.repo()).collect();
    assert_eq!(repos, vec!["A"]);
}

#[tokio::test]
async fn deployed_repos_are_audited_unless_flagged() {
    let fleet = Fleet::new(
        vec![
            Repository::new("A"),
            Repository::new("B").with_fan_out("prod", "extra"),
            Repository::new("C").without_audit(),
        ],
        FakeReleaseTool::new(),
    );
    fleet.tag_everywhere("rel-1");
    let audit = Arc::new(FakeAuditTool::new());
    audit.set_output(
        "B",
        CommandOutput::failed(
            "Name: rack\nVersion: 2.2.3\nAdvisory: CVE-2022-30123\n\nVulnerabilities found!\n",
        ),
    );

    let run = fleet
        .orchestrator()
        .with_audit(audit.clone())
        .run(&request("prod", tag("rel-1")), &ScriptedPrompter::new(vec![]))
        .await
        .unwrap();

    assert!(run.all_succeeded());
    assert_eq!(audit.audited().len(), 2);
    let report = run.audit.expect("audit report");
    let audited: Vec<&str> = report.repos.iter().map(|r| r.repo.as_str()).collect();
    assert_eq!(audited, vec!["A", "B"]);
    assert_eq!(report.repos[0].outcome, AuditOutcome::Clean);
    assert_eq!(
        report.findings().get("B"),
        Some(&vec!["CVE-2022-30123".to_string()])
    );
}

#[tokio::test]
async fn run_without_audit_tool_has_no_audit_report() {
    let fleet = Fleet::new(vec![Repository::new("A")], FakeReleaseTool::new());
    fleet.tag_everywhere("rel-1");

    let run = fleet
        .orchestrator()
        .run(&request("qa", tag("rel-1")), &ScriptedPrompter::new(vec![]))
        .await
        .unwrap();

    assert!(run.audit.is_none());
}

#[tokio::test]
async fn synced_copies_are_prepared_and_prepare_failure_is_not_fatal() {
    let release = FakeReleaseTool::new();
    release.fail_prepare("A");
    let fleet = Fleet::new(vec![Repository::new("A"), Repository::new("B")], release);
    fleet.tag_everywhere("rel-1");

    let run = fleet
        .orchestrator()
        .run(&request("stage", tag("rel-1")), &ScriptedPrompter::new(vec![]))
        .await
        .unwrap();

    let mut prepared = fleet.release.prepared();
    prepared.sort();
    assert_eq!(
        prepared,
        vec![fleet.tmp.path().join("repos/A"), fleet.tmp.path().join("repos/B")]
    );
    assert_eq!(run.results.len(), 2);
    assert!(run.all_succeeded());
}

#[tokio::test]
async fn skip_update_leaves_copies_unprepared() {
    let repos = vec![Repository::new("A")];
    let fleet = Fleet::new(repos.clone(), FakeReleaseTool::new());
    fleet.tag_everywhere("rel-1");
    fleet.cache.sync_all(&repos).await.unwrap();

    let skip = DeployRequest {
        skip_update: true,
        ..request("stage", tag("rel-1"))
    };
    fleet
        .orchestrator()
        .run(&skip, &ScriptedPrompter::new(vec![]))
        .await
        .unwrap();

    assert!(fleet.release.prepared().is_empty());
    assert_eq!(fleet.release.deploys().len(), 1);
}

#[tokio::test]
async fn prune_only_runs_for_the_full_fleet() {
    let fleet = Fleet::new(
        vec![Repository::new("org/a"), Repository::new("org/b")],
        FakeReleaseTool::new(),
    );
    fleet.tag_everywhere("rel-1");
    let stale = fleet.tmp.path().join("repos/org/decommissioned");
    std::fs::create_dir_all(&stale).unwrap();
    let orchestrator = fleet.orchestrator();

    let subset = DeployRequest {
        selection: RepoSelection {
            only: vec!["org/a".to_string()],
            ..Default::default()
        },
        ..request("stage", tag("rel-1"))
    };
    orchestrator
        .run(&subset, &ScriptedPrompter::new(vec![]))
        .await
        .unwrap();
    assert!(stale.exists());

    orchestrator
        .run(&request("stage", tag("rel-1")), &ScriptedPrompter::new(vec![]))
        .await
        .unwrap();
    assert!(!stale.exists());
    assert!(fleet.tmp.path().join("repos/org/b").exists());
}
