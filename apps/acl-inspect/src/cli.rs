use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use modkit_security::{AclValue, PermissionKind};

#[derive(Debug, Parser)]
#[command(name = "acl-inspect", version, about = "Inspect ModKit ACL configurations")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate a configuration file and list every problem found.
    Validate { config: PathBuf },
    /// Print the access filter compiled for one principal.
    Explain {
        config: PathBuf,
        #[arg(long)]
        entity: String,
        #[arg(long, default_value = "read")]
        kind: PermissionKind,
        /// Principal identifier; omit to explain the anonymous case.
        #[arg(long, value_parser = parse_subject)]
        principal: Option<AclValue>,
        #[arg(long = "role")]
        roles: Vec<String>,
        #[arg(long)]
        unrestricted: bool,
        #[arg(long, value_enum, default_value_t = Dialect::Postgres)]
        dialect: Dialect,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

/// Integers first, then UUIDs, else the raw string.
fn parse_subject(raw: &str) -> Result<AclValue, String> {
    if let Ok(n) = raw.parse::<i64>() {
        return Ok(AclValue::Int(n));
    }
    if let Ok(u) = uuid::Uuid::parse_str(raw) {
        return Ok(AclValue::Uuid(u));
    }
    if raw.is_empty() {
        return Err("principal identifier must not be empty".to_owned());
    }
    Ok(AclValue::from(raw))
}
