use anyhow::{Context, Result};
use clap::Parser;
use nl2sql_engine::{Engine, EngineConfig, SchemaCatalog};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nl2sql")]
#[command(about = "Translate a natural-language question into schema-safe SQL")]
struct Args {
    /// The question to translate
    question: Option<String>,

    /// Schema catalog JSON file
    #[arg(long, conflicts_with = "sqlite")]
    schema: Option<PathBuf>,

    /// SQLite database whose schema should be introspected
    #[arg(long)]
    sqlite: Option<PathBuf>,

    /// Print the schema description sent to the model and exit
    #[arg(long)]
    print_schema: bool,

    /// Validate this SQL against the catalog instead of translating
    #[arg(long, value_name = "SQL")]
    validate: Option<String>,

    /// Never call the language model
    #[arg(long)]
    rule_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_timer(ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let catalog = match (&args.schema, &args.sqlite) {
        (Some(path), _) => SchemaCatalog::from_json_file(path)
            .with_context(|| format!("loading schema catalog {}", path.display()))?,
        (None, Some(path)) => SchemaCatalog::from_sqlite(path)
            .with_context(|| format!("introspecting {}", path.display()))?,
        (None, None) => SchemaCatalog::storefront(),
    };

    if args.print_schema {
        print!("{}", catalog.schema_prompt());
        return Ok(());
    }

    let config = EngineConfig::from_env()?;
    let engine = if args.rule_only {
        Engine::rule_only(catalog, config)?
    } else {
        Engine::new(catalog, config)?
    };

    if let Some(sql) = &args.validate {
        let verdict = engine.validate(sql);
        println!("{}", serde_json::to_string_pretty(&verdict)?);
        return Ok(());
    }

    let question = args.question.context("a question is required")?;
    info!("Translating: {}", question);
    let translation = engine.translate(&question).await;
    println!("{}", serde_json::to_string_pretty(&translation)?);

    Ok(())
}
