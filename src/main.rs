//! permtree - permission administration CLI

use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use permtree::{
    Namespace, PermissibleKind, PermissionValue, Permissions, PermissionsConfig, References,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Permission engine administration tool
#[derive(Parser, Debug)]
#[command(name = "permtree", version, about = "Inspect and edit permission nodes and grants")]
struct Cli {
    /// TOML config file; toggles are written back to it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backend to load instead of the configured one
    #[arg(short, long, global = true)]
    backend: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a node for an entity
    Check {
        entity: Uuid,
        permission: String,
        /// Scope tokens (repeatable)
        #[arg(long = "ref")]
        refs: Vec<String>,
    },
    /// Show whether an entity is permitted, banned or not whitelisted
    State { entity: Uuid },
    /// List nodes matching a pattern
    Nodes {
        #[arg(default_value = "*")]
        pattern: String,
    },
    /// Register a node and save it to the backend
    CreateNode {
        permission: String,
        /// Default value (true/false, an integer, or text)
        #[arg(long)]
        default: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Grant a node to an entity or group
    Grant {
        holder: Uuid,
        permission: String,
        #[arg(long)]
        value: Option<String>,
        #[arg(long = "ref")]
        refs: Vec<String>,
        /// The holder is a group
        #[arg(long)]
        group: bool,
        /// Seconds until the grant lapses
        #[arg(long)]
        expires_in: Option<i64>,
    },
    /// Revoke a grant
    Revoke {
        holder: Uuid,
        permission: String,
        #[arg(long = "ref")]
        refs: Vec<String>,
        #[arg(long)]
        group: bool,
    },
    /// Add a holder to a group
    Join {
        holder: Uuid,
        target: Uuid,
        #[arg(long = "ref")]
        refs: Vec<String>,
        /// The holder is a group
        #[arg(long)]
        group: bool,
        #[arg(long)]
        expires_in: Option<i64>,
    },
    /// Show or set the default group for a scope
    DefaultGroup {
        /// Group to make the default; omit to show the current one
        group: Option<Uuid>,
        #[arg(long = "ref")]
        refs: Vec<String>,
    },
}

fn kind(group: bool) -> PermissibleKind {
    if group {
        PermissibleKind::Group
    } else {
        PermissibleKind::Entity
    }
}

fn expiry(seconds: Option<i64>) -> Result<Option<chrono::DateTime<Utc>>> {
    match seconds {
        None => Ok(None),
        Some(s) if s <= 0 => bail!("--expires-in must be positive"),
        Some(s) => match Duration::try_seconds(s) {
            Some(d) => Ok(Some(Utc::now() + d)),
            None => bail!("--expires-in is out of range"),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "permtree=info".into());
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let mut config = PermissionsConfig::load(cli.config.as_deref())?;
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    let permissions = permtree::open(config, cli.config).await?;

    run(&permissions, cli.command).await?;
    permissions.end().await;
    Ok(())
}

async fn run(permissions: &Permissions, command: Command) -> Result<()> {
    match command {
        Command::Check {
            entity,
            permission,
            refs,
        } => {
            let result = permissions
                .check_permission(entity, &Namespace::parse(&permission)?, &References::new(refs))
                .await?;
            println!("{}", result);
            println!("allowed: {}", result.is_true());
        }
        Command::State { entity } => {
            println!("{}", permissions.check_permissible_state(entity).await?);
        }
        Command::Nodes { pattern } => {
            for node in permissions.get_nodes(&Namespace::parse(&pattern)?) {
                let default = match &node.default_value {
                    PermissionValue::Unset => "-".to_string(),
                    v => v.to_string(),
                };
                println!(
                    "{:<32} {:<6} {:<8} {}",
                    node.namespace.to_string(),
                    node.value_type.to_string(),
                    default,
                    node.description.as_deref().unwrap_or("")
                );
            }
        }
        Command::CreateNode {
            permission,
            default,
            description,
        } => {
            let namespace = Namespace::parse_concrete(&permission)?;
            let default = default
                .as_deref()
                .map(PermissionValue::parse_loose)
                .unwrap_or_default();
            permissions.create_node(&namespace, default)?;
            if let Some(description) = description {
                permissions.set_node_description(&namespace, &description);
            }
            let node = permissions.save_node(&namespace).await?;
            println!("Created {} ({})", node.namespace, node.value_type);
        }
        Command::Grant {
            holder,
            permission,
            value,
            refs,
            group,
            expires_in,
        } => {
            let grant = permissions
                .grant(
                    kind(group),
                    holder,
                    &Namespace::parse_concrete(&permission)?,
                    value.as_deref().map(PermissionValue::parse_loose),
                    References::new(refs),
                    expiry(expires_in)?,
                )
                .await?;
            println!(
                "Granted {} to {} {} [{}]",
                grant.namespace,
                kind(group),
                holder,
                grant.references
            );
        }
        Command::Revoke {
            holder,
            permission,
            refs,
            group,
        } => {
            let removed = permissions
                .revoke(
                    kind(group),
                    holder,
                    &Namespace::parse_concrete(&permission)?,
                    &References::new(refs),
                )
                .await?;
            if !removed {
                bail!("{} holds no such grant", holder);
            }
            println!("Revoked {} from {}", permission, holder);
        }
        Command::Join {
            holder,
            target,
            refs,
            group,
            expires_in,
        } => {
            let added = permissions
                .add_membership(
                    kind(group),
                    holder,
                    target,
                    References::new(refs),
                    expiry(expires_in)?,
                )
                .await?;
            if !added {
                bail!("{} is already a member of {} in that scope", holder, target);
            }
            println!("{} joined {}", holder, target);
        }
        Command::DefaultGroup { group, refs } => {
            let references = References::new(refs);
            match group {
                Some(group) => {
                    permissions.set_default_group(group, &references).await?;
                    println!("Default group for [{}] is {}", references, group);
                }
                None => match permissions.get_default_group(&references).await? {
                    Some(group) => println!("{}", group.id()),
                    None => println!("No default group for [{}]", references),
                },
            }
        }
    }
    Ok(())
}
