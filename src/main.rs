//! # Ingest Agent CLI (`iagent`)
//!
//! The `iagent` binary drives the ingestion agent from the command line:
//! full inventory runs, incremental syncs, sync-cursor management, and the
//! agent API server.
//!
//! ## Usage
//!
//! ```bash
//! iagent --config ./config/iagent.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `iagent scm run-inventory` | Full inventory ingestion from a repository |
//! | `iagent scm incremental-sync` | Commit-driven sync since the stored cursor |
//! | `iagent scm get-sync-state` | Show the stored cursor for a source |
//! | `iagent scm reset-sync` | Delete the cursor, forcing a full sync |
//! | `iagent scm list-issues` | List repository issues with comments |
//! | `iagent scm get-repo` | List repository files (metadata only) |
//! | `iagent fs build-config` | Write an inventory manifest for a local tree |
//! | `iagent fs check-status` | Hash-diff the local tree against the Ingester |
//! | `iagent fs run-inventory` | Full filesystem ingestion |
//! | `iagent serve` | Start the agent HTTP API |

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use ingest_agent::collector_fs;
use ingest_agent::config::{self, Config, FsCollectorConfig};
use ingest_agent::ingester::{IngestApi, IngesterClient};
use ingest_agent::models::{ContentFilter, SyncOutcome};
use ingest_agent::scm::{Scm, ScmProvider, SourceApi};
use ingest_agent::server;
use ingest_agent::sync::{source_id, SyncEngine, SyncOptions};

/// Ingest Agent — keeps a remote Ingester in step with source repositories.
#[derive(Parser)]
#[command(
    name = "iagent",
    about = "Ingest Agent — incremental document ingestion from SCM hosts and local trees",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(
        long,
        global = true,
        env = "INGEST_AGENT_CONFIG",
        default_value = "./config/iagent.toml"
    )]
    config: PathBuf,

    /// Print results as JSON instead of a human summary.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect from a GitHub- or Gitea-style repository host.
    Scm {
        #[command(subcommand)]
        action: ScmAction,
    },

    /// Collect from a local directory tree.
    Fs {
        #[command(subcommand)]
        action: FsAction,
    },

    /// Start the agent HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind`.
    Serve,
}

/// Arguments shared by every repository-scoped command.
#[derive(clap::Args, Clone)]
struct RepoArgs {
    /// SCM backend.
    #[arg(long, value_enum)]
    scm: Scm,

    /// Repository name.
    #[arg(long)]
    repo: String,

    /// Repository owner. Falls back to `scm.owner` from the config.
    #[arg(long)]
    owner: Option<String>,

    /// Branch to operate on.
    #[arg(long, default_value = "main")]
    branch: String,

    /// Which content kinds to cover. Participates in the source identity.
    #[arg(long, value_enum, default_value = "all")]
    content_filter: ContentFilter,
}

/// Workflow-triggering arguments for ingestion commands.
#[derive(clap::Args, Clone)]
struct WorkflowArgs {
    /// Start processing workflows after a clean ingestion run.
    #[arg(long)]
    start_workflows: bool,

    /// Workflow definition to start. Required with --start-workflows.
    #[arg(long)]
    workflow_definition_id: Option<String>,

    /// Parameter set for the workflow. Required with --start-workflows.
    #[arg(long)]
    param_set_id: Option<String>,

    /// Workflow priority.
    #[arg(long, default_value_t = 0)]
    priority: u32,
}

#[derive(Subcommand)]
enum ScmAction {
    /// Enumerate the whole repository and ingest what the Ingester reports
    /// as new or mismatched.
    RunInventory {
        #[command(flatten)]
        repo: RepoArgs,
        #[command(flatten)]
        workflows: WorkflowArgs,
    },

    /// Sync only the files touched by commits since the stored cursor.
    /// Falls back to a full inventory when no cursor exists.
    IncrementalSync {
        #[command(flatten)]
        repo: RepoArgs,
        #[command(flatten)]
        workflows: WorkflowArgs,
    },

    /// Show the stored sync cursor for a source.
    GetSyncState {
        #[command(flatten)]
        repo: RepoArgs,
    },

    /// Delete the sync cursor, forcing the next sync to run a full pass.
    ResetSync {
        #[command(flatten)]
        repo: RepoArgs,
    },

    /// List issues (with comments) for a repository.
    ListIssues {
        #[command(flatten)]
        repo: RepoArgs,
    },

    /// List repository files without downloading content metadata you
    /// already have elsewhere.
    GetRepo {
        #[command(flatten)]
        repo: RepoArgs,
    },
}

#[derive(Subcommand)]
enum FsAction {
    /// Scan the configured tree and write `inventory.json` describing it.
    BuildConfig,

    /// Ask the Ingester which local files are new or mismatched.
    CheckStatus {
        /// Source identity for the tree. Defaults to `fs:<root>`.
        #[arg(long)]
        source: Option<String>,
    },

    /// Scan, diff, and ingest the local tree.
    RunInventory {
        /// Source identity for the tree. Defaults to `fs:<root>`.
        #[arg(long)]
        source: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        Config::minimal()
    };

    match cli.command {
        Commands::Scm { action } => run_scm(action, &cfg, cli.json).await?,
        Commands::Fs { action } => run_fs(action, &cfg, cli.json).await?,
        Commands::Serve => server::run_server(&cfg).await?,
    }

    Ok(())
}

fn resolve_owner(args: &RepoArgs, cfg: &Config) -> anyhow::Result<String> {
    args.owner
        .clone()
        .or_else(|| cfg.scm.owner.clone())
        .context("no repository owner given; pass --owner or set scm.owner in the config")
}

fn sync_options(args: &RepoArgs, workflows: &WorkflowArgs, owner: String) -> SyncOptions {
    SyncOptions {
        repo: args.repo.clone(),
        owner,
        branch: args.branch.clone(),
        content_filter: args.content_filter,
        priority: workflows.priority,
        start_workflows: workflows.start_workflows,
        workflow_definition_id: workflows.workflow_definition_id.clone(),
        param_set_id: workflows.param_set_id.clone(),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_scm(action: ScmAction, cfg: &Config, json: bool) -> anyhow::Result<()> {
    match action {
        ScmAction::RunInventory { repo, workflows } => {
            let owner = resolve_owner(&repo, cfg)?;
            let provider = ScmProvider::from_config(repo.scm, &cfg.scm)?;
            let ingester = IngesterClient::new(&cfg.ingester)?;
            let engine =
                SyncEngine::new(&provider, &ingester, repo.scm, cfg.scm.extensions.clone());

            let report = engine
                .load_inventory(&sync_options(&repo, &workflows, owner))
                .await?;

            if json {
                print_json(&report)?;
            } else {
                println!("inventory: {} files", report.inventory.len());
                println!("to process: {}", report.to_process.len());
                println!("ingested: {}", report.ingested.len());
                print_errors(&report.errors);
            }
        }

        ScmAction::IncrementalSync { repo, workflows } => {
            let owner = resolve_owner(&repo, cfg)?;
            let provider = ScmProvider::from_config(repo.scm, &cfg.scm)?;
            let ingester = IngesterClient::new(&cfg.ingester)?;
            let engine =
                SyncEngine::new(&provider, &ingester, repo.scm, cfg.scm.extensions.clone());

            let outcome = engine
                .incremental_sync(&sync_options(&repo, &workflows, owner))
                .await?;

            if json {
                print_json(&outcome)?;
            } else {
                match outcome {
                    SyncOutcome::FullSync(report) => {
                        println!("no sync cursor found, ran full inventory");
                        println!("inventory: {} files", report.inventory.len());
                        println!("ingested: {}", report.ingested.len());
                        print_errors(&report.errors);
                    }
                    SyncOutcome::Incremental(report) => {
                        println!("status: {}", report.status);
                        println!("commits processed: {}", report.commits_processed);
                        println!(
                            "files changed: {} (removed: {})",
                            report.files_changed, report.files_removed
                        );
                        println!("ingested: {}", report.ingested.len());
                        if let Some(sha) = &report.new_commit_sha {
                            println!("cursor advanced to {sha}");
                        } else if !report.errors.is_empty() {
                            println!("cursor not advanced (errors below)");
                        }
                        print_errors(&report.errors);
                    }
                }
            }
        }

        ScmAction::GetSyncState { repo } => {
            let owner = resolve_owner(&repo, cfg)?;
            let ingester = IngesterClient::new(&cfg.ingester)?;
            let source = source_id(repo.scm.as_str(), &owner, &repo.repo, repo.content_filter);
            let state = ingester.get_sync_state(&source).await?;
            if json {
                print_json(&state)?;
            } else {
                println!("source: {}", state.source_id);
                println!("branch: {}", state.branch);
                match &state.last_commit_sha {
                    Some(sha) => println!("last commit: {sha}"),
                    None => println!("never synced"),
                }
                if let Some(date) = &state.last_sync_date {
                    println!("last sync: {date}");
                }
            }
        }

        ScmAction::ResetSync { repo } => {
            let owner = resolve_owner(&repo, cfg)?;
            let ingester = IngesterClient::new(&cfg.ingester)?;
            let source = source_id(repo.scm.as_str(), &owner, &repo.repo, repo.content_filter);
            let result = ingester.reset_sync_state(&source).await?;
            if json {
                print_json(&result)?;
            } else {
                println!("sync state reset for {source}");
            }
        }

        ScmAction::ListIssues { repo } => {
            let owner = resolve_owner(&repo, cfg)?;
            let provider = ScmProvider::from_config(repo.scm, &cfg.scm)?;
            let issues = provider
                .list_issues(&repo.repo, Some(&owner), true, None)
                .await?;
            if json {
                print_json(&issues)?;
            } else {
                println!("{} issues in {owner}/{}", issues.len(), repo.repo);
                for issue in &issues {
                    let number = issue.get("number").and_then(|n| n.as_i64()).unwrap_or(0);
                    let title = issue.get("title").and_then(|t| t.as_str()).unwrap_or("");
                    let state = issue.get("state").and_then(|s| s.as_str()).unwrap_or("");
                    println!("  #{number} [{state}] {title}");
                }
            }
        }

        ScmAction::GetRepo { repo } => {
            let owner = resolve_owner(&repo, cfg)?;
            let provider = ScmProvider::from_config(repo.scm, &cfg.scm)?;
            let files = provider
                .list_repo_files(&repo.repo, Some(&owner), None, &repo.branch)
                .await?;
            if json {
                let listing: Vec<serde_json::Value> = files
                    .iter()
                    .map(|f| {
                        serde_json::json!({
                            "uri": f.uri,
                            "sha256": f.sha256,
                            "content_type": f.content_type,
                            "last_updated": f.last_updated,
                        })
                    })
                    .collect();
                print_json(&listing)?;
            } else {
                println!("{} files in {owner}/{}", files.len(), repo.repo);
                for f in &files {
                    println!("  {} ({})", f.uri, &f.sha256[..12]);
                }
            }
        }
    }
    Ok(())
}

fn fs_config(cfg: &Config) -> anyhow::Result<FsCollectorConfig> {
    cfg.fs
        .clone()
        .context("filesystem collector is not configured; add an [fs] section")
}

async fn run_fs(action: FsAction, cfg: &Config, json: bool) -> anyhow::Result<()> {
    let fs = fs_config(cfg)?;

    match action {
        FsAction::BuildConfig => {
            let manifest = collector_fs::build_manifest(&fs)?;
            let out_path = fs.root.join("inventory.json");
            std::fs::write(&out_path, serde_json::to_string_pretty(&manifest)?)
                .with_context(|| format!("writing {}", out_path.display()))?;
            if json {
                print_json(&manifest)?;
            } else {
                println!("wrote {} entries to {}", manifest.len(), out_path.display());
            }
        }

        FsAction::CheckStatus { source } => {
            let ingester = IngesterClient::new(&cfg.ingester)?;
            let source = source.unwrap_or_else(|| format!("fs:{}", fs.root.display()));
            let to_process = collector_fs::check_status(&fs, &ingester, &source).await?;
            if json {
                print_json(&to_process)?;
            } else {
                println!("{} files need processing", to_process.len());
                for uri in &to_process {
                    println!("  {uri}");
                }
            }
        }

        FsAction::RunInventory { source } => {
            let ingester = IngesterClient::new(&cfg.ingester)?;
            let source = source.unwrap_or_else(|| format!("fs:{}", fs.root.display()));
            let report = collector_fs::run_inventory(&fs, &ingester, &source).await?;
            if json {
                print_json(&report)?;
            } else {
                println!("inventory: {} files", report.inventory.len());
                println!("ingested: {}", report.ingested.len());
                print_errors(&report.errors);
            }
        }
    }
    Ok(())
}

fn print_errors(errors: &[ingest_agent::models::IngestionError]) {
    if errors.is_empty() {
        return;
    }
    println!("errors: {}", errors.len());
    for e in errors {
        println!("  {}: {}", e.uri, e.error);
    }
}
