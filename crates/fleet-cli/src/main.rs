//! Fleet - deployment orchestrator for independently versioned services
//!
//! The `fleet` command keeps a local cache of every service repository and
//! drives the external release tool across the whole fleet.
//!
//! ## Commands
//!
//! - `refresh-cache`: Clone or refresh the working copies
//! - `deploy`: Deploy the fleet (or a subset) to one environment
//! - `check-dependency-versions`: Report shared dependency version divergence
//! - `tag`: Create, verify or delete a release tag across repositories
//! - `audit`: Run the dependency audit tool in every repository
//! - `check-ssh`: Verify SSH access for every repository

mod prompt;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use fleet_core::release::prepare_all;
use fleet_core::report::render_consistency;
use fleet_core::status::warn_on_url_mismatch;
use fleet_core::{
    check_control_master, BundleAudit, Capistrano, ConsistencyChecker, DeployOrchestrator,
    DeployRequest, DeployTarget, DivergenceAction, FleetConfig, FleetReport, GitCli,
    LockfileReader, ManifestReader, ReleaseTool, RepoAuditor, RepoCache, RepoSelection,
    ReportAggregator, RunSpan, SshChecker, StatusChecker, TagManager, DEFAULT_CONFIG_PATH,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

use crate::prompt::StdinPrompter;

const DEFAULT_TAG_MESSAGE: &str = "created by fleet";
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "fleet")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deploy a fleet of service repositories", long_about = None)]
struct Cli {
    /// Path to the fleet configuration file
    #[arg(long, global = true, env = "FLEET_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and reports
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Comma-separated repository filters.
#[derive(Args, Debug, Default)]
struct RepoFilter {
    /// Only these repositories
    #[arg(long, value_delimiter = ',', value_name = "NAMES", conflicts_with = "except")]
    only: Vec<String>,

    /// Every repository except these
    #[arg(long, value_delimiter = ',', value_name = "NAMES")]
    except: Vec<String>,
}

impl RepoFilter {
    fn selection(self, tracked_only: bool) -> RepoSelection {
        RepoSelection {
            only: self.only,
            except: self.except,
            tracked_only,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Clone missing working copies and reset existing ones to the remote default branch
    RefreshCache {
        #[command(flatten)]
        filter: RepoFilter,
    },

    /// Deploy repositories to an environment
    Deploy {
        /// Environment to deploy to
        #[arg(short, long)]
        environment: String,

        /// Deploy this tag instead of each repository's default branch
        #[arg(short, long)]
        tag: Option<String>,

        #[command(flatten)]
        filter: RepoFilter,

        /// Only repositories tracking the shared dependency
        #[arg(long)]
        tracked_only: bool,

        /// Use the cached working copies as they are
        #[arg(short, long)]
        skip_update: bool,

        /// Remote command to run on each server before deploying
        #[arg(short, long)]
        before_command: Option<String>,

        /// Do not require a running SSH control master
        #[arg(long)]
        skip_control_master: bool,

        /// Check each repository's status URL after deploying
        #[arg(long)]
        check_status: bool,
    },

    /// Report the shared dependency's version across tracked repositories
    CheckDependencyVersions {
        /// Read versions at this tag instead of the default branches
        #[arg(short, long)]
        tag: Option<String>,

        /// Use the cached working copies as they are
        #[arg(short, long)]
        skip_update: bool,
    },

    /// Manage a release tag across repositories
    Tag {
        /// Only repositories tracking the shared dependency
        #[arg(long)]
        tracked_only: bool,

        #[command(subcommand)]
        action: TagAction,
    },

    /// Run the dependency audit tool in every repository
    Audit,

    /// Verify SSH access to every server of an environment
    CheckSsh {
        /// Environment to check
        #[arg(short, long)]
        environment: String,

        #[command(flatten)]
        filter: RepoFilter,

        /// Use the cached working copies as they are
        #[arg(short, long)]
        skip_update: bool,

        /// Do not require a running SSH control master
        #[arg(long)]
        skip_control_master: bool,
    },
}

#[derive(Subcommand)]
enum TagAction {
    /// Create an annotated tag locally and push it
    Create {
        /// Tag name
        name: String,

        /// Tag message
        #[arg(short, long, default_value = DEFAULT_TAG_MESSAGE)]
        message: String,
    },
    /// Verify a tag exists on every remote
    Verify {
        /// Tag name
        name: String,
    },
    /// Delete a tag locally and remotely
    Delete {
        /// Tag name
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    fleet_core::init_tracing(cli.json, level);

    let fleet = Fleet::load(&cli.config)?;
    let output = Output { json: cli.json };

    match cli.command {
        Commands::RefreshCache { filter } => {
            cmd_refresh_cache(&fleet, filter.selection(false)).await
        }
        Commands::Deploy {
            environment,
            tag,
            filter,
            tracked_only,
            skip_update,
            before_command,
            skip_control_master,
            check_status,
        } => {
            let request = DeployRequest {
                environment,
                target: DeployTarget::from_tag(tag),
                selection: filter.selection(tracked_only),
                skip_update,
            };
            let options = DeployOptions {
                before_command,
                skip_control_master,
                check_status,
            };
            cmd_deploy(&fleet, &output, request, options).await
        }
        Commands::CheckDependencyVersions { tag, skip_update } => {
            cmd_check_dependency_versions(&fleet, &output, DeployTarget::from_tag(tag), skip_update)
                .await
        }
        Commands::Tag {
            tracked_only,
            action,
        } => cmd_tag(&fleet, &output, tracked_only, action).await,
        Commands::Audit => cmd_audit(&fleet, &output).await,
        Commands::CheckSsh {
            environment,
            filter,
            skip_update,
            skip_control_master,
        } => {
            cmd_check_ssh(
                &fleet,
                &output,
                &environment,
                filter.selection(false),
                skip_update,
                skip_control_master,
            )
            .await
        }
    }
}

/// Loaded configuration plus the production collaborators built from it.
struct Fleet {
    config: Arc<FleetConfig>,
    cache: RepoCache,
}

impl Fleet {
    fn load(path: &Path) -> Result<Self> {
        let config = FleetConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        Ok(Self::from_config(config))
    }

    fn from_config(config: FleetConfig) -> Self {
        let config = Arc::new(config);
        let cache = RepoCache::new(Arc::clone(&config), Arc::new(GitCli::new()));
        Self { config, cache }
    }

    fn release_tool(&self) -> Arc<dyn ReleaseTool> {
        Arc::new(Capistrano::new(self.config.release_tool.clone()))
    }

    fn manifest(&self) -> Arc<dyn ManifestReader> {
        let lockfile = self
            .config
            .dependency
            .as_ref()
            .map(|d| d.lockfile.clone())
            .unwrap_or_else(|| "Gemfile.lock".to_string());
        Arc::new(LockfileReader::new(lockfile))
    }

    fn ensure_environment(&self, environment: &str) -> Result<()> {
        if !self.config.environments.is_empty() && !self.config.is_supported_env(environment) {
            let supported: Vec<&str> = self.config.environments.keys().map(String::as_str).collect();
            anyhow::bail!(
                "Unsupported environment '{}' (expected one of: {})",
                environment,
                supported.join(", ")
            );
        }
        Ok(())
    }

    /// Fails unless the configured control-master session is up.
    async fn ensure_control_master(&self, skip: bool) -> Result<()> {
        let Some(host) = self.config.control_master_host.as_deref() else {
            return Ok(());
        };
        if skip {
            info!(host = %host, "skipping control master check");
            return Ok(());
        }
        let out = check_control_master(host).await;
        if !out.success {
            anyhow::bail!(
                "SSH control master is not running for {}. Start one with `ssh -MNf {}` or pass --skip-control-master.\n{}",
                host,
                host,
                out.output.trim_end()
            );
        }
        Ok(())
    }
}

struct DeployOptions {
    before_command: Option<String>,
    skip_control_master: bool,
    check_status: bool,
}

/// Where finished reports go.
struct Output {
    json: bool,
}

impl Output {
    fn render(&self, report: &FleetReport) -> Result<String> {
        if self.json {
            report.to_json().context("Failed to serialize report")
        } else {
            Ok(report.render_markdown())
        }
    }

    /// Print the report; error when it records any failure.
    fn emit(&self, report: &FleetReport, failure: &str) -> Result<()> {
        println!("{}", self.render(report)?);
        if report.has_failures() {
            anyhow::bail!("{}", failure)
        }
        Ok(())
    }
}

/// Clone or refresh working copies; prune only for a whole-fleet refresh.
async fn cmd_refresh_cache(fleet: &Fleet, selection: RepoSelection) -> Result<()> {
    let span = RunSpan::enter("refresh-cache");
    let repos = selection.apply(&fleet.config.repositories)?;

    let copies = fleet.cache.sync_all(&repos).await?;
    prepare_all(fleet.release_tool().as_ref(), &copies, fleet.config.parallelism()).await;
    for copy in &copies {
        let action = if copy.created { "created" } else { "updated" };
        println!("{:<40} {:<8} {}", copy.repo, action, copy.commit);
    }

    if !selection.is_subset() {
        let removed = fleet.cache.prune(&fleet.config.repositories)?;
        for path in &removed {
            println!("pruned {}", path.display());
        }
    }

    info!(run_id = %span.run_id(), repos = copies.len(), "cache refreshed");
    Ok(())
}

async fn cmd_deploy(
    fleet: &Fleet,
    output: &Output,
    request: DeployRequest,
    options: DeployOptions,
) -> Result<()> {
    let span = RunSpan::enter("deploy");
    fleet.ensure_environment(&request.environment)?;
    fleet.ensure_control_master(options.skip_control_master).await?;

    let release = fleet.release_tool();
    let mut orchestrator = DeployOrchestrator::new(
        Arc::clone(&fleet.config),
        fleet.cache.clone(),
        Arc::clone(&release),
        fleet.manifest(),
    )
    .with_audit(Arc::new(BundleAudit::new(fleet.config.audit_tool.clone())));
    if let Some(command) = options.before_command {
        orchestrator = orchestrator.with_before_command(command);
    }

    let run = orchestrator.run(&request, &StdinPrompter).await?;

    let mut agg = ReportAggregator::new(format!(
        "Deploy {} to {}",
        run.target, run.environment
    ));
    agg.add_deploy_results(&run.results);
    if let Some(consistency) = run.consistency.clone() {
        agg.set_consistency(consistency);
    }
    let audit_clean = !run.audit.as_ref().is_some_and(|a| !a.is_clean());
    if let Some(audit) = run.audit.clone() {
        agg.set_audit(audit);
    }

    if options.check_status {
        let deployed: Vec<_> = fleet
            .config
            .repositories
            .iter()
            .filter(|r| run.results.iter().any(|res| res.repo() == r.name))
            .cloned()
            .collect();
        for repo in &deployed {
            let dir = fleet.cache.repo_dir(&repo.name);
            warn_on_url_mismatch(release.as_ref(), &dir, repo, &run.environment).await;
        }
        let checks = StatusChecker::new(STATUS_TIMEOUT)
            .check_all(&deployed, &run.environment)
            .await;
        agg.add_status_checks(checks);
    }
    if let Some(page) = &run.status_page {
        agg.add_note(format!("Check the status page for {}: {}", run.environment, page));
    }

    let report = agg.finish();
    let failed = run.failed().count();
    info!(
        run_id = %span.run_id(),
        units = run.results.len(),
        failed = failed,
        audit_clean = audit_clean,
        "deploy finished"
    );
    let summary = if audit_clean {
        format!("{failed} deploy unit(s) failed")
    } else {
        format!("{failed} deploy unit(s) failed; audit reported vulnerabilities or errors")
    };
    output.emit(&report, &summary)
}

async fn cmd_check_dependency_versions(
    fleet: &Fleet,
    output: &Output,
    target: DeployTarget,
    skip_update: bool,
) -> Result<()> {
    let _span = RunSpan::enter("check-dependency-versions");
    let dependency = fleet
        .config
        .dependency
        .as_ref()
        .context("No [dependency] section in the configuration")?;

    let tracked = fleet.config.tracked_repositories();
    if tracked.is_empty() {
        anyhow::bail!("No repository is marked dependency_tracked");
    }
    if !skip_update {
        fleet.cache.sync_all(&tracked).await?;
    }

    let checker = ConsistencyChecker::new(fleet.cache.clone(), fleet.manifest());
    let report = checker.check(&tracked, &dependency.name, &target).await?;
    let action = dependency.policy().action_for(report.verdict);

    if output.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", render_consistency(&report));
    }

    if action == DivergenceAction::Block {
        anyhow::bail!(
            "{} versions diverge: {}",
            dependency.name,
            report.group_summaries().join("; ")
        );
    }
    Ok(())
}

async fn cmd_tag(fleet: &Fleet, output: &Output, tracked_only: bool, action: TagAction) -> Result<()> {
    let _span = RunSpan::enter("tag");
    let selection = RepoSelection {
        tracked_only,
        ..Default::default()
    };
    let repos = selection.apply(&fleet.config.repositories)?;
    fleet.cache.sync_all(&repos).await?;

    let manager = TagManager::new(fleet.cache.clone(), fleet.config.parallelism());
    let (report, failure) = match action {
        TagAction::Create { name, message } => {
            let outcomes = manager.create(&name, &message, &repos).await;
            let mut agg = ReportAggregator::new(format!("Create tag {name}"));
            agg.add_tag_outcomes(&outcomes);
            (agg.finish(), format!("Failed to create tag {name} everywhere"))
        }
        TagAction::Verify { name } => {
            let statuses = manager.verify(&name, &repos).await;
            let mut agg = ReportAggregator::new(format!("Verify tag {name}"));
            agg.add_tag_statuses(&statuses);
            (agg.finish(), format!("Tag {name} is not present everywhere"))
        }
        TagAction::Delete { name } => {
            let outcomes = manager.delete(&name, &repos).await;
            let mut agg = ReportAggregator::new(format!("Delete tag {name}"));
            agg.add_tag_outcomes(&outcomes);
            (agg.finish(), format!("Failed to delete tag {name} everywhere"))
        }
    };
    output.emit(&report, &failure)
}

async fn cmd_audit(fleet: &Fleet, output: &Output) -> Result<()> {
    let _span = RunSpan::enter("audit");
    let repos: Vec<_> = fleet
        .config
        .repositories
        .iter()
        .filter(|r| !r.skip_audit)
        .cloned()
        .collect();
    let copies = fleet.cache.sync_all(&repos).await?;
    prepare_all(fleet.release_tool().as_ref(), &copies, fleet.config.parallelism()).await;

    let tool = Arc::new(BundleAudit::new(fleet.config.audit_tool.clone()));
    let audit = RepoAuditor::new(fleet.cache.clone(), tool, fleet.config.parallelism())
        .audit_all(&repos)
        .await;

    let mut agg = ReportAggregator::new("Dependency audit");
    agg.set_audit(audit);
    output.emit(&agg.finish(), "Audit reported vulnerabilities or errors")
}

async fn cmd_check_ssh(
    fleet: &Fleet,
    output: &Output,
    environment: &str,
    selection: RepoSelection,
    skip_update: bool,
    skip_control_master: bool,
) -> Result<()> {
    let _span = RunSpan::enter("check-ssh");
    fleet.ensure_environment(environment)?;
    fleet.ensure_control_master(skip_control_master).await?;

    let repos: Vec<_> = selection
        .apply(&fleet.config.repositories)?
        .into_iter()
        .filter(|r| !r.skips(environment))
        .collect();
    if !skip_update {
        fleet.cache.sync_all(&repos).await?;
    }

    let results = SshChecker::new(fleet.cache.clone(), fleet.release_tool())
        .check_all(&repos, environment)
        .await;

    let mut agg = ReportAggregator::new(format!("SSH check for {environment}"));
    agg.add_ssh_results(&results);
    output.emit(&agg.finish(), "SSH check failed for some repositories")
}
