use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ormkit::config::Settings;
use ormkit::loadplan::{LoadPlanBuilder, LoadQueryInfluencers};
use ormkit::metadata::MappingModel;
use ormkit::persister::PersisterRegistry;
use ormkit::sql::{Dialect, KeyRestriction, LoadQueryBuilder, MutationSqlBuilder, ProcedureWrapper, dialect_for_name};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ormkit")]
#[command(about = "Inspect load plans and generated SQL for a mapping model")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the load plan tree and the rendered load SQL of an entity
    Plan {
        #[arg(long)]
        mapping: PathBuf,
        #[arg(long)]
        entity: String,
        #[arg(long)]
        max_fetch_depth: Option<usize>,
        #[arg(long)]
        profile: Vec<String>,
        #[arg(long, default_value = "ansi")]
        dialect: String,
    },
    /// Print the insert, update and delete SQL of an entity
    Sql {
        #[arg(long)]
        mapping: PathBuf,
        #[arg(long)]
        entity: String,
        #[arg(long, default_value = "ansi")]
        dialect: String,
        /// Wrap each statement into a stored routine
        #[arg(long)]
        procedures: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Plan {
            mapping,
            entity,
            max_fetch_depth,
            profile,
            dialect,
        } => print_plan(&mapping, &entity, max_fetch_depth, &profile, &dialect),
        Command::Sql {
            mapping,
            entity,
            dialect,
            procedures,
        } => print_sql(&mapping, &entity, &dialect, procedures),
    }
}

fn boot(mapping: &Path, dialect: &str, settings: &Settings) -> Result<(PersisterRegistry, Arc<dyn Dialect>)> {
    let json = fs::read_to_string(mapping).with_context(|| format!("reading {}", mapping.display()))?;
    let model = MappingModel::from_json(&json).context("parsing mapping model")?;
    let dialect = dialect_for_name(dialect)?;
    let registry = PersisterRegistry::build(&model, settings, dialect.as_ref()).context("building persisters")?;
    Ok((registry, dialect))
}

fn print_plan(
    mapping: &Path,
    entity: &str,
    max_fetch_depth: Option<usize>,
    profiles: &[String],
    dialect: &str,
) -> Result<()> {
    let mut settings = Settings::new();
    settings.max_fetch_depth = max_fetch_depth;
    let (registry, dialect) = boot(mapping, dialect, &settings)?;

    let mut influencers = LoadQueryInfluencers::new();
    for profile in profiles {
        influencers.enable_fetch_profile(&registry, profile)?;
    }
    let plan = LoadPlanBuilder::entity_plan(&registry, &influencers, max_fetch_depth, entity)?;
    let query = LoadQueryBuilder::new(&registry, dialect.as_ref()).build(&plan, KeyRestriction::Id)?;

    println!("{}", plan);
    println!("{}", query.rendered.sql);
    Ok(())
}

fn print_sql(mapping: &Path, entity: &str, dialect: &str, procedures: bool) -> Result<()> {
    let (registry, dialect) = boot(mapping, dialect, &Settings::new())?;
    let persister = registry.entity(entity)?;
    let sql = MutationSqlBuilder::new(dialect.as_ref()).entity(persister)?;

    let mut statements = vec![("insert", sql.insert)];
    if let Some(update) = sql.update {
        statements.push(("update", update));
    }
    statements.push(("delete", sql.delete));

    let wrapper = if procedures {
        Some(ProcedureWrapper::new(dialect.clone(), "orm")?)
    } else {
        None
    };
    for (kind, rendered) in statements {
        println!("-- {}", kind);
        match &wrapper {
            Some(wrapper) => {
                let outcome = wrapper.wrap(&rendered)?;
                println!("{}", outcome.routine.definition.ddl);
                println!("{}", outcome.routine.call.sql);
            }
            None => println!("{}", rendered.sql),
        }
    }
    Ok(())
}
