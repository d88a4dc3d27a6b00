use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use heya_client::{ChatClient, ChatMessage, ChatRequest};
use heya_core::{Config, LogLevel};
use heya_store_sqlite::{new_migration, Db, MigrationSource, StoreOptions};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "heya")]
#[command(about = "SQLite-backed chat assistant")]
struct Cli {
    /// Database path; overrides the DSN environment variable.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Schema snapshot path written after migrations apply.
    #[arg(long)]
    schema: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    Migrate {
        #[command(subcommand)]
        command: MigrateCommand,
    },
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },
    Ask(AskArgs),
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    Show,
    Set(SettingsSetArgs),
}

#[derive(Debug, Args)]
struct SettingsSetArgs {
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    editor: Option<String>,
    #[arg(long)]
    codify: Option<bool>,
    /// Sampling temperature in tenths (10 means 1.0).
    #[arg(long)]
    temp: Option<i64>,
}

#[derive(Debug, Subcommand)]
enum MigrateCommand {
    /// Report applied and pending migrations without applying anything.
    Status,
    /// Apply all pending bundled migrations.
    Run,
    /// Scaffold the next numbered migration file.
    New(MigrateNewArgs),
}

#[derive(Debug, Args)]
struct MigrateNewArgs {
    #[arg(long, default_value = "migration")]
    dir: PathBuf,
}

#[derive(Debug, Subcommand)]
enum SchemaCommand {
    /// Regenerate the schema snapshot from the live database.
    Dump,
}

#[derive(Debug, Args)]
struct AskArgs {
    prompt: String,
    /// Override the configured model for this request.
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    max_tokens: Option<u32>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env();
    init_tracing(config.log_level);
    for warning in &config.warnings {
        tracing::warn!("{warning}");
    }

    let options = store_options(&cli, &config);
    match cli.command {
        Command::Config { command } => run_config(&command, &config),
        Command::Settings { command } => run_settings(command, options),
        Command::Migrate { command } => run_migrate(command, options),
        Command::Schema { command } => run_schema(&command, options),
        Command::Ask(args) => run_ask(&args, &config, options),
    }
}

fn init_tracing(level: LogLevel) {
    let filter = tracing_subscriber::EnvFilter::new(level.as_filter());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn store_options(cli: &Cli, config: &Config) -> StoreOptions {
    let dsn = cli
        .db
        .as_ref()
        .map_or_else(|| config.dsn.clone(), |path| path.to_string_lossy().into_owned());
    let mut options = StoreOptions::new(dsn);
    if let Some(schema) = &cli.schema {
        options = options.schema_path(schema.clone());
    }
    options
}

fn run_config(command: &ConfigCommand, config: &Config) -> Result<()> {
    match command {
        ConfigCommand::Show => emit_json(serde_json::json!({
            "dsn": config.dsn,
            "env": config.env.as_str(),
            "log_level": config.log_level.as_str(),
            "openai_api_key_set": config.openai_api_key.is_some(),
        })),
    }
}

fn run_settings(command: SettingsCommand, options: StoreOptions) -> Result<()> {
    let db = Db::open(options)?;
    match command {
        SettingsCommand::Show => {
            let settings = db.bootstrap_settings()?;
            emit_json(serde_json::to_value(&settings).context("failed to serialize settings")?)
        }
        SettingsCommand::Set(args) => {
            let mut settings = db.bootstrap_settings()?;
            if let Some(model) = args.model {
                settings.model = model;
            }
            if let Some(editor) = args.editor {
                settings.editor = editor;
            }
            if let Some(codify) = args.codify {
                settings.codify = codify;
            }
            if let Some(temp) = args.temp {
                settings.temp = temp;
            }
            db.update_settings(&settings)?;
            emit_json(serde_json::to_value(&settings).context("failed to serialize settings")?)
        }
    }
}

fn run_migrate(command: MigrateCommand, options: StoreOptions) -> Result<()> {
    match command {
        MigrateCommand::Status => {
            let db = Db::open_with_source(options, &MigrationSource::empty())?;
            let applied = db.applied_migrations()?;
            let bundled = MigrationSource::bundled();
            let pending: Vec<String> = bundled
                .names()
                .filter(|name| !applied.iter().any(|applied_name| applied_name == name))
                .map(str::to_string)
                .collect();
            emit_json(serde_json::json!({
                "applied": applied,
                "pending": pending,
            }))
        }
        MigrateCommand::Run => {
            let mut db = Db::open_with_source(options, &MigrationSource::empty())?;
            let before = db.applied_migrations()?;
            db.migrate(&MigrationSource::bundled())?;
            let applied = db.applied_migrations()?;
            let newly_applied: Vec<&String> =
                applied.iter().filter(|name| !before.contains(name)).collect();
            emit_json(serde_json::json!({
                "applied": applied,
                "newly_applied": newly_applied,
            }))
        }
        MigrateCommand::New(args) => {
            let path = new_migration(&args.dir)?;
            emit_json(serde_json::json!({ "created": path }))
        }
    }
}

fn run_schema(command: &SchemaCommand, options: StoreOptions) -> Result<()> {
    match command {
        SchemaCommand::Dump => {
            let schema_path = options.schema_path.clone();
            let db = Db::open(options)?;
            db.dump_schema()?;
            emit_json(serde_json::json!({ "schema_path": schema_path }))
        }
    }
}

fn run_ask(args: &AskArgs, config: &Config, options: StoreOptions) -> Result<()> {
    let api_key = config.require_api_key()?;
    let db = Db::open(options)?;
    let settings = db.bootstrap_settings()?;
    let model = args.model.clone().unwrap_or_else(|| settings.model.clone());

    #[allow(clippy::cast_precision_loss)]
    let temperature = settings.temp as f32 / 10.0;
    let request = ChatRequest {
        model: model.clone(),
        messages: vec![ChatMessage::user(args.prompt.as_str())],
        temperature,
        max_tokens: args.max_tokens,
    };

    let reply = ChatClient::new(api_key).complete(&request).context("chat completion failed")?;

    let title = conversation_title(&args.prompt);
    let conversation_id = db.record_conversation(&title, &slugify(&title), &model)?;

    emit_json(serde_json::json!({
        "conversation_id": conversation_id,
        "model": model,
        "reply": reply,
    }))
}

fn emit_json(value: Value) -> Result<()> {
    let rendered =
        serde_json::to_string_pretty(&value).context("failed to render JSON output")?;
    println!("{rendered}");
    Ok(())
}

/// First line of the prompt, capped at 60 characters.
fn conversation_title(prompt: &str) -> String {
    let first_line = prompt.trim().lines().next().unwrap_or_default();
    first_line.chars().take(60).collect()
}

fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut last_dash = true;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_punctuation_runs() {
        assert_eq!(slugify("Why   WAL?!"), "why-wal");
        assert_eq!(slugify("  -- already -- dashed --  "), "already-dashed");
        assert_eq!(slugify(""), "");
    }

    #[test]
    fn conversation_title_uses_first_line_only() {
        assert_eq!(conversation_title("fix build\nmore context"), "fix build");
        let long = "x".repeat(100);
        assert_eq!(conversation_title(&long).chars().count(), 60);
    }
}
