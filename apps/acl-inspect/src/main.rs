mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use modkit_acl::sql::select_statement;
use modkit_acl::{AclConfig, MetadataRegistry, PredicateCompiler, SelectQuery, SortOrder};
use modkit_security::{AclValue, PermissionKind, Principal};
use sea_orm::sea_query::{PostgresQueryBuilder, SqliteQueryBuilder};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, Dialect};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_registry(path: &Path) -> anyhow::Result<MetadataRegistry> {
    let config = AclConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
    Ok(MetadataRegistry::from_config(config)?)
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let config = AclConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
    let errors = modkit_acl::metadata::validate(&config);
    if errors.is_empty() {
        let registry = MetadataRegistry::from_config(config)?;
        let mut total = 0_usize;
        let mut governed = 0_usize;
        for name in registry.entity_types() {
            let meta = registry.entity(name)?;
            total += 1;
            if meta.is_governed() {
                governed += 1;
                println!("  {name} ({})", meta.table);
            }
        }
        println!("{}: {total} entity types, {governed} governed", path.display());
        return Ok(());
    }
    for error in &errors {
        println!("error: {error}");
    }
    bail!("{} configuration problem(s) found", errors.len())
}

struct ExplainRequest {
    entity: String,
    kind: PermissionKind,
    principal: Option<AclValue>,
    roles: Vec<String>,
    unrestricted: bool,
    dialect: Dialect,
}

fn explain(path: &Path, request: ExplainRequest) -> anyhow::Result<()> {
    let registry = Arc::new(load_registry(path)?);
    let meta = registry.entity(&request.entity)?.clone();

    let principal = request.principal.map(|subject| {
        let admin = request
            .roles
            .iter()
            .any(|r| registry.admin_roles().contains(r));
        Principal::builder(subject)
            .roles(request.roles)
            .unrestricted(request.unrestricted || admin)
            .build()
    });
    tracing::debug!(
        entity = %meta.name,
        kind = %request.kind,
        anonymous = principal.is_none(),
        "compiling access filter"
    );

    let expr = PredicateCompiler::new(Arc::clone(&registry)).compile(
        principal.as_ref(),
        &meta.name,
        request.kind,
    );
    println!("-- access expression");
    println!("{expr}");
    for chain in expr.delegation_paths() {
        println!("-- delegates through {}", chain.join(" -> "));
    }

    let query = SelectQuery::new(meta.name.clone(), expr)
        .order_by(vec![SortOrder::asc(meta.id_column.clone())]);
    let stmt = select_statement(&meta, &query);
    let sql = match request.dialect {
        Dialect::Postgres => stmt.to_string(PostgresQueryBuilder),
        Dialect::Sqlite => stmt.to_string(SqliteQueryBuilder),
    };
    println!("-- sql");
    println!("{sql}");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Command::Validate { config } => validate(&config),
        Command::Explain {
            config,
            entity,
            kind,
            principal,
            roles,
            unrestricted,
            dialect,
        } => explain(
            &config,
            ExplainRequest {
                entity,
                kind,
                principal,
                roles,
                unrestricted,
                dialect,
            },
        ),
    }
}
