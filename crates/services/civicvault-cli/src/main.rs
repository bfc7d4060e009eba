//! `civic`; CLI surface over the CivicVault record engine.
//!
//! The command layer stays thin: argument parsing, principal resolution,
//! output shaping, exit codes. Every rule about records lives in the core.
//!
//! Exit codes: 0 success, 1 operational failure, 2 usage/validation
//! failure.

use anyhow::Result;
use civicvault_common::config::{AppConfig, Manifest};
use civicvault_core::container::{self, Container};
use civicvault_core::engine::{OpContext, RecordInput, RecordPatch};
use civicvault_core::error::ErrorKind;
use civicvault_core::index::ConflictPolicy;
use civicvault_core::model::activity::ActivityBmc;
use civicvault_core::model::record::RecordFilter;
use civicvault_core::model::user::{UserBmc, UserForCreate, UserForUpdate};
use civicvault_core::{Principal, UserId};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "civic", author, version, about = "Git-native civic records", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Machine-readable JSON output
    #[arg(long, global = true)]
    json: bool,
    /// Suppress human-facing text
    #[arg(long, global = true)]
    silent: bool,
    /// Validate and log intent without committing side effects
    #[arg(long, global = true)]
    dry_run: bool,
    /// Comma-separated hook names to suppress for this invocation
    #[arg(long, global = true, value_delimiter = ',')]
    dry_run_hooks: Vec<String>,
    /// Session token to act as an authenticated user
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scaffold a civic data directory here
    Init {
        /// Dataset name for the manifest
        #[arg(long, default_value = "civic-records")]
        name: String,
    },
    /// Create a record
    Create {
        record_type: String,
        title: String,
        /// Markdown body (template-rendered when omitted)
        #[arg(long)]
        content: Option<String>,
        /// Metadata as inline JSON
        #[arg(long)]
        metadata: Option<String>,
        /// Replay protection key
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// Edit a record's title, content, or metadata
    Edit {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Transition a record to a new status
    Status {
        id: String,
        new_status: String,
        #[arg(short, long)]
        message: Option<String>,
    },
    /// List records
    List {
        #[arg(long)]
        record_type: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Show one record with content
    View { id: String },
    /// Search records by title
    Search { query: String },
    /// Validate records offline
    Validate {
        record_type: Option<String>,
        slug: Option<String>,
    },
    /// Generate index.yml, optionally reconciling the database
    Index {
        #[arg(long)]
        sync_db: bool,
        #[arg(long, default_value = "file-wins")]
        conflict_resolution: String,
    },
    /// Commit pending hand edits under records/
    Commit { message: String },
    /// Diff a record between two commits
    Diff {
        id: String,
        #[arg(long)]
        commit1: String,
        #[arg(long)]
        commit2: String,
    },
    /// History of a record
    History { id: String },
    /// Export the records tree
    Export { dest: PathBuf },
    /// Import an exported records tree
    Import { src: PathBuf },
    /// Archive (delete) a record
    Delete { id: String },
    /// Restore an archived record
    Restore { id: String },
    /// Hook management
    Hook {
        #[command(subcommand)]
        command: HookCommands,
    },
    /// User management
    Users {
        #[command(subcommand)]
        command: UsersCommands,
    },
}

#[derive(Subcommand, Debug)]
enum HookCommands {
    /// Show hook enablement
    List,
    /// Enable an event's handlers
    Enable { event: String },
    /// Disable an event's handlers
    Disable { event: String },
    /// Show subscriber bindings from hooks.yml
    Config,
    /// Recent hook emissions from the audit mirror
    Logs {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[derive(Subcommand, Debug)]
enum UsersCommands {
    /// Create a user
    Create {
        username: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "public")]
        role: String,
        #[arg(long, default_value = "password")]
        auth_provider: String,
    },
    /// List users
    List,
    /// Update a user's profile or role
    Update {
        id: i64,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        role: Option<String>,
    },
    /// Delete a user
    Delete { id: i64 },
    /// Store a new password hash for a password-provider user
    SetPassword {
        username: String,
        password_hash: String,
    },
    /// Rotate a password given proof of the current hash
    ChangePassword {
        username: String,
        current_hash: String,
        new_hash: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    civicvault_common::tracing::setup_tracing(cli.json);

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => exit_code_for(&e),
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(core_err) = err.downcast_ref::<civicvault_core::Error>() {
        match core_err.kind() {
            ErrorKind::Validation => 2,
            _ => 1,
        }
    } else {
        1
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Init { name } = &cli.command {
        let dir = std::env::current_dir()?;
        container::scaffold(&dir, name)?;
        emit(&cli, json!({"initialized": dir.display().to_string()}), || {
            println!("Initialized civic data directory at {}", dir.display());
        });
        return Ok(());
    }

    let (manifest, manifest_dir) = Manifest::discover(&std::env::current_dir()?)?;
    let app_config = Arc::new(AppConfig::load().unwrap_or_default());
    let container = Container::init(manifest, &manifest_dir, app_config).await?;

    let ctx = resolve_principal(&cli, &container).await?;
    let op = OpContext {
        source: civicvault_core::activity::Source::Cli,
        dry_run_hooks: cli.dry_run_hooks.clone(),
        silent: cli.silent,
        idempotency_key: None,
        dry_run: cli.dry_run,
        expected_updated_at: None,
    };

    match dispatch(&cli, &container, &ctx, op).await {
        Ok(()) => Ok(()),
        Err(e) => {
            report_error(&cli, &e);
            Err(e)
        }
    }
}

async fn resolve_principal(cli: &Cli, container: &Container) -> Result<Principal> {
    match &cli.token {
        Some(token) => Ok(UserBmc::resolve_token(&container.mm, token).await?),
        None => Ok(Principal::system()),
    }
}

fn report_error(cli: &Cli, err: &anyhow::Error) {
    if cli.json {
        let (kind, message) = match err.downcast_ref::<civicvault_core::Error>() {
            Some(e) => (e.kind().as_ref().to_string(), e.to_string()),
            None => ("operational".to_string(), err.to_string()),
        };
        println!(
            "{}",
            json!({"success": false, "error": {"kind": kind, "message": message}})
        );
    } else if !cli.silent {
        eprintln!("Error: {err}");
        if let Some(e) = err.downcast_ref::<civicvault_core::Error>() {
            if e.kind() == ErrorKind::Authorization {
                eprintln!("Run `civic auth:login` to get a new session token");
            }
        }
    }
}

fn emit(cli: &Cli, data: serde_json::Value, human: impl FnOnce()) {
    if cli.json {
        println!("{}", json!({"success": true, "data": data}));
    } else if !cli.silent {
        human();
    }
}

async fn dispatch(cli: &Cli, container: &Container, ctx: &Principal, op: OpContext) -> Result<()> {
    let engine = &container.engine;

    match &cli.command {
        Commands::Init { .. } => unreachable!("handled before container init"),

        Commands::Create {
            record_type,
            title,
            content,
            metadata,
            idempotency_key,
        } => {
            let metadata = metadata
                .as_deref()
                .map(serde_json::from_str::<serde_json::Value>)
                .transpose()?;
            let mut op = op;
            op.idempotency_key = idempotency_key.clone();
            let record = engine
                .create(
                    ctx,
                    &op,
                    RecordInput {
                        record_type: record_type.clone(),
                        title: title.clone(),
                        content: content.clone(),
                        metadata,
                        authors: Vec::new(),
                    },
                )
                .await?;
            maybe_reindex(container, ctx).await;
            emit(cli, serde_json::to_value(&record)?, || {
                println!("Created {} ({})", record.id, record.status);
            });
        }

        Commands::Edit {
            id,
            title,
            content,
            metadata,
        } => {
            let metadata = metadata
                .as_deref()
                .map(serde_json::from_str::<serde_json::Value>)
                .transpose()?;
            let record = engine
                .update(
                    ctx,
                    &op,
                    id,
                    RecordPatch {
                        title: title.clone(),
                        content: content.clone(),
                        metadata,
                        ..Default::default()
                    },
                )
                .await?;
            maybe_reindex(container, ctx).await;
            emit(cli, serde_json::to_value(&record)?, || {
                println!("Updated {}", record.id);
            });
        }

        Commands::Status {
            id,
            new_status,
            message,
        } => {
            let record = engine
                .set_status(ctx, &op, id, new_status, message.as_deref())
                .await?;
            maybe_reindex(container, ctx).await;
            emit(cli, serde_json::to_value(&record)?, || {
                println!("{} -> {}", record.id, record.status);
            });
        }

        Commands::List {
            record_type,
            status,
            author,
            tag,
            limit,
            offset,
        } => {
            let page = engine
                .list(
                    ctx,
                    RecordFilter {
                        record_type: record_type.clone().map(Into::into),
                        status: status.clone(),
                        author: author.clone(),
                        tag: tag.clone(),
                        query: None,
                        visible_statuses: None,
                        limit: *limit,
                        offset: *offset,
                    },
                )
                .await?;
            emit(cli, serde_json::to_value(&page)?, || {
                for r in &page.items {
                    println!("{:<40} {:<12} {}", r.id.as_str(), r.status, r.title);
                }
                println!("{} of {} records", page.items.len(), page.total);
            });
        }

        Commands::View { id } => {
            let record = engine.get(ctx, id).await?;
            emit(cli, serde_json::to_value(&record)?, || {
                println!("# {} [{}]\n", record.title, record.status);
                println!("{}", record.content);
            });
        }

        Commands::Search { query } => {
            let page = engine
                .list(
                    ctx,
                    RecordFilter {
                        query: Some(query.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            emit(cli, serde_json::to_value(&page)?, || {
                for r in &page.items {
                    println!("{:<40} {}", r.id.as_str(), r.title);
                }
            });
        }

        Commands::Validate { record_type, slug } => {
            let reports = match (record_type, slug) {
                (Some(t), Some(s)) => {
                    let report = engine.validate(ctx, &format!("{t}/{s}")).await?;
                    vec![(format!("{t}/{s}"), report)]
                }
                _ => {
                    let page = engine
                        .list(
                            ctx,
                            RecordFilter {
                                record_type: record_type.clone().map(Into::into),
                                limit: i64::MAX,
                                ..Default::default()
                            },
                        )
                        .await?;
                    let mut out = Vec::new();
                    for r in page.items {
                        let report = engine.validate(ctx, r.id.as_str()).await?;
                        out.push((r.id.to_string(), report));
                    }
                    out
                }
            };

            let all_valid = reports.iter().all(|(_, r)| r.valid);
            emit(
                cli,
                json!({"valid": all_valid, "records": reports.iter().map(|(id, r)| json!({"id": id, "valid": r.valid, "errors": r.errors})).collect::<Vec<_>>()}),
                || {
                    for (id, report) in &reports {
                        if report.valid {
                            println!("{id}: ok");
                        } else {
                            println!("{id}: INVALID");
                            for err in &report.errors {
                                println!("  - {err}");
                            }
                        }
                    }
                },
            );
            if !all_valid {
                return Err(civicvault_core::Error::InvalidInput(
                    "validation failed".to_string(),
                )
                .into());
            }
        }

        Commands::Index {
            sync_db,
            conflict_resolution,
        } => {
            let index = container.indexing.generate(ctx).await?;
            if *sync_db {
                let policy = ConflictPolicy::parse(conflict_resolution)?;
                let report = container.indexing.sync_db(ctx, policy).await?;
                emit(
                    cli,
                    json!({"index": {"totalRecords": index.metadata.total_records}, "sync": report}),
                    || {
                        println!(
                            "Indexed {} records; sync: {} updated, {} conflicts",
                            index.metadata.total_records, report.rows_updated, report.conflicts
                        );
                    },
                );
            } else {
                emit(
                    cli,
                    json!({"totalRecords": index.metadata.total_records, "errors": index.errors}),
                    || {
                        println!("Indexed {} records", index.metadata.total_records);
                    },
                );
            }
        }

        Commands::Commit { message } => {
            use civicvault_core::store::git_store;
            let _guard = container.mm.git_lock.lock().await;
            let repo = container.mm.open_repo()?;
            let (added, removed) = git_store::pending_changes(&repo, "records/")?;
            if added.is_empty() && removed.is_empty() {
                emit(cli, json!({"committed": false}), || {
                    println!("Nothing to commit");
                });
            } else {
                let (name, email) = ctx.git_identity();
                let added_paths: Vec<std::path::PathBuf> =
                    added.iter().map(Into::into).collect();
                let removed_paths: Vec<std::path::PathBuf> =
                    removed.iter().map(Into::into).collect();
                let oid = git_store::commit_changes(
                    &repo,
                    &added_paths,
                    &removed_paths,
                    message,
                    &name,
                    &email,
                )?;
                emit(
                    cli,
                    json!({"committed": true, "oid": oid.to_string(), "files": added.len() + removed.len()}),
                    || {
                        println!("Committed {} file(s) as {}", added.len() + removed.len(), oid);
                    },
                );
            }
        }

        Commands::Diff {
            id,
            commit1,
            commit2,
        } => {
            let diff = engine.diff(ctx, id, commit1, commit2).await?;
            emit(cli, json!({"diff": diff}), || println!("{diff}"));
        }

        Commands::History { id } => {
            let revisions = engine.history(ctx, id).await?;
            emit(
                cli,
                json!(revisions.iter().map(|r| json!({"oid": r.oid, "message": r.message, "author": r.author_name, "time": r.time})).collect::<Vec<_>>()),
                || {
                    for r in &revisions {
                        println!("{} {} ({})", &r.oid[..8.min(r.oid.len())], r.message.lines().next().unwrap_or(""), r.author_name);
                    }
                },
            );
        }

        Commands::Export { dest } => {
            let copied = engine.export(ctx, dest).await?;
            emit(cli, json!({"exported": copied}), || {
                println!("Exported {copied} files to {}", dest.display());
            });
        }

        Commands::Import { src } => {
            let imported = engine.import(ctx, &op, src).await?;
            maybe_reindex(container, ctx).await;
            emit(cli, json!({"imported": imported}), || {
                println!("Imported {imported} records from {}", src.display());
            });
        }

        Commands::Delete { id } => {
            engine.delete(ctx, &op, id).await?;
            maybe_reindex(container, ctx).await;
            emit(cli, json!({"deleted": id}), || {
                println!("Archived {id}");
            });
        }

        Commands::Restore { id } => {
            let record = engine.restore(ctx, &op, id).await?;
            maybe_reindex(container, ctx).await;
            emit(cli, serde_json::to_value(&record)?, || {
                println!("Restored {} ({})", record.id, record.status);
            });
        }

        Commands::Hook { command } => match command {
            HookCommands::List => {
                let config = container.hooks.config().await;
                emit(cli, serde_json::to_value(&config)?, || {
                    println!("hooks enabled: {}", config.enabled);
                    let mut events: Vec<_> = config.events.iter().collect();
                    events.sort();
                    for (event, enabled) in events {
                        println!("  {event}: {}", if *enabled { "enabled" } else { "disabled" });
                    }
                });
            }
            HookCommands::Config => {
                let config = container.hooks.config().await;
                emit(cli, serde_json::to_value(&config.bindings)?, || {
                    let mut bindings: Vec<_> = config.bindings.iter().collect();
                    bindings.sort();
                    for (event, workflows) in bindings {
                        println!("{event}: {}", workflows.join(", "));
                    }
                });
            }
            HookCommands::Enable { event } => {
                container.hooks.set_enabled(event, true).await;
                persist_hooks_config(container).await?;
                emit(cli, json!({"enabled": event}), || {
                    println!("Enabled {event}");
                });
            }
            HookCommands::Disable { event } => {
                container.hooks.set_enabled(event, false).await;
                persist_hooks_config(container).await?;
                emit(cli, json!({"disabled": event}), || {
                    println!("Disabled {event}");
                });
            }
            HookCommands::Logs { limit } => {
                let rows = ActivityBmc::list_recent(ctx, &container.mm, Some("hook:"), *limit).await?;
                emit(cli, serde_json::to_value(&rows)?, || {
                    for row in &rows {
                        println!("{} {} {} [{}]", row.timestamp, row.actor, row.action, row.result);
                    }
                });
            }
        },

        Commands::Users { command } => match command {
            UsersCommands::Create {
                username,
                email,
                name,
                role,
                auth_provider,
            } => {
                let id = UserBmc::create(
                    ctx,
                    &container.mm,
                    UserForCreate {
                        username: username.clone(),
                        email: email.clone(),
                        name: name.clone(),
                        role: role.clone(),
                        auth_provider: auth_provider.clone(),
                        password_hash: None,
                    },
                )
                .await?;
                emit(cli, json!({"id": id.get(), "username": username}), || {
                    println!("Created user {username} ({role})");
                });
            }
            UsersCommands::List => {
                let users = UserBmc::list_all(ctx, &container.mm).await?;
                emit(cli, serde_json::to_value(&users)?, || {
                    for u in &users {
                        println!("{:<6} {:<20} {:<10} {}", u.id.get(), u.username, u.role, u.auth_provider);
                    }
                });
            }
            UsersCommands::Update { id, email, name, role } => {
                UserBmc::update(
                    ctx,
                    &container.mm,
                    UserId::new(*id),
                    UserForUpdate {
                        email: email.clone(),
                        name: name.clone(),
                        role: role.clone(),
                    },
                )
                .await?;
                emit(cli, json!({"updated": id}), || println!("Updated user {id}"));
            }
            UsersCommands::Delete { id } => {
                UserBmc::delete(ctx, &container.mm, UserId::new(*id)).await?;
                emit(cli, json!({"deleted": id}), || println!("Deleted user {id}"));
            }
            UsersCommands::SetPassword {
                username,
                password_hash,
            } => {
                UserBmc::set_password(ctx, &container.mm, username, password_hash).await?;
                emit(cli, json!({"updated": username}), || {
                    println!("Password updated for {username}");
                });
            }
            UsersCommands::ChangePassword {
                username,
                current_hash,
                new_hash,
            } => {
                UserBmc::change_password(ctx, &container.mm, username, current_hash, new_hash)
                    .await?;
                emit(cli, json!({"updated": username}), || {
                    println!("Password changed for {username}");
                });
            }
        },
    }

    Ok(())
}

/// Writes the bus's current enablement back to `.civic/hooks.yml` so the
/// toggle survives this process.
async fn persist_hooks_config(container: &Container) -> Result<()> {
    let config = container.hooks.config().await;
    let path = container.mm.data_dir.join(".civic").join("hooks.yml");
    config.save(&path)?;
    Ok(())
}

/// Regenerate index.yml after a mutation when the manifest opts in.
async fn maybe_reindex(container: &Container, ctx: &Principal) {
    if container.manifest.auto_index {
        if let Err(e) = container.indexing.generate(ctx).await {
            tracing::warn!(error = %e, "auto index regeneration failed");
        }
    }
}
