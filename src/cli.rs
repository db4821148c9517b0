use std::collections::HashSet;
use std::fmt::Display;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::builder::styling::{AnsiColor, Color, Style, Styles};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::aot::{Generator, Shell, generate};
use clap_complete_nushell::Nushell;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use crate::ai::synthesis::{ClusterSynopsis, prompt_templates};
use crate::ai::{OAIEmbedder, OpenAiGenerator, SchemaInfo, get_client};
use crate::config::PipelineConfig;
use crate::ingest::{IngestReport, IngestServices, PdfTextExtractor, SupabaseStorage, ingest_pdf};
use crate::pipeline::{Services, run_clustering};
use crate::store::postgres::PgFeedbackStore;
use crate::submit::submit_response;
use crate::AppResult;

const STYLES: Styles = Styles::styled()
    .header(Style::new().bold())
    .usage(Style::new().bold())
    .error(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Red))))
    .literal(
        Style::new()
            .bold()
            .fg_color(Some(Color::Ansi(AnsiColor::Green))),
    )
    .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Yellow))))
    .valid(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Cyan))))
    .invalid(Style::new().fg_color(Some(Color::Ansi(AnsiColor::BrightRed))))
    .context(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Magenta))))
    .context_value(
        Style::new()
            .bold()
            .fg_color(Some(Color::Ansi(AnsiColor::Cyan))),
    );

/// Long-form CLI description shown in `--help`.
const LONG_ABOUT: &str = "Cohort AI - Turn teacher feedback into grounded training plans

This tool:
- groups teacher survey responses per feedback category with k-means over their embeddings
- summarizes each group with a language model (strict JSON)
- drafts a training curriculum for each group, grounded in uploaded PDF training material

Settings can come from flags, environment variables, or a `.env` file in the working directory.";

/// Cohort AI - Turn teacher feedback into grounded training plans.
#[derive(Parser, Debug, Clone)]
#[command(author, version, propagate_version = true, about, long_about = Some(LONG_ABOUT), styles = STYLES)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub cmd: Cmd,
}

/// Top-level commands supported by the CLI.
#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Recompute every cluster, summary and training plan
    ///
    /// Existing clusters are deleted before the pass starts and the new ones are inserted in a
    /// single transaction at the end
    Cluster {
        #[command(flatten)]
        db: DatabaseArgs,
        #[command(flatten)]
        llm: LlmArgs,
        #[command(flatten)]
        embed: EmbedArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
        /// Output file for the JSON result
        /// If not provided, prints to stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },

    /// Upload a PDF, split it into chunks and store their embeddings
    Ingest {
        /// The PDF to ingest
        file: PathBuf,
        #[command(flatten)]
        db: DatabaseArgs,
        #[command(flatten)]
        embed: EmbedArgs,
        #[command(flatten)]
        storage: StorageArgs,
        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },

    /// Store a teacher response read from a JSON file (`-` for stdin)
    Submit {
        /// Path to the JSON payload, or `-` to read stdin
        input: String,
        #[command(flatten)]
        db: DatabaseArgs,
        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },

    /// Create or update the database tables
    Migrate {
        #[command(flatten)]
        db: DatabaseArgs,
        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },

    /// Generate shell completion for a given shell
    Completion {
        /// Output file to write the completion script to
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// The shell to generate the completion for
        #[arg(value_enum)]
        shell: CompletionShell,

        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },

    /// Show the model contracts
    Show {
        #[command(subcommand)]
        what: ShowCmd,
    },
}

static SHOW_CMD_ABOUT: &str = "Show the structured response schema or the prompt templates.
This is mainly for debugging purposes, e.g. to check what the language model is asked to return.";

#[derive(Subcommand, Debug, Clone)]
#[command(about = "Show the model contracts.", long_about = SHOW_CMD_ABOUT)]
pub enum ShowCmd {
    /// JSON Schema of the cluster summary the model must return
    Schema {
        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },

    /// The raw prompt templates
    Prompts {
        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },
}

/// Supported completion targets for shell auto-completion.
#[derive(ValueEnum, Clone, Debug)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
    Nushell,
}

impl Display for CompletionShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompletionShell::Bash => "bash",
            CompletionShell::Zsh => "zsh",
            CompletionShell::Fish => "fish",
            CompletionShell::PowerShell => "powershell",
            CompletionShell::Elvish => "elvish",
            CompletionShell::Nushell => "nushell",
        };
        write!(f, "{}", s)
    }
}

impl Generator for &CompletionShell {
    fn generate(&self, cmd: &clap::builder::Command, buf: &mut dyn Write) {
        match self {
            CompletionShell::Bash => Shell::Bash.generate(cmd, buf),
            CompletionShell::Zsh => Shell::Zsh.generate(cmd, buf),
            CompletionShell::Fish => Shell::Fish.generate(cmd, buf),
            CompletionShell::PowerShell => Shell::PowerShell.generate(cmd, buf),
            CompletionShell::Elvish => Shell::Elvish.generate(cmd, buf),
            CompletionShell::Nushell => Nushell.generate(cmd, buf),
        }
    }

    fn file_name(&self, name: &str) -> String {
        match self {
            CompletionShell::Bash => Shell::Bash.file_name(name),
            CompletionShell::Zsh => Shell::Zsh.file_name(name),
            CompletionShell::Fish => Shell::Fish.file_name(name),
            CompletionShell::PowerShell => Shell::PowerShell.file_name(name),
            CompletionShell::Elvish => Shell::Elvish.file_name(name),
            CompletionShell::Nushell => Nushell.file_name(name),
        }
    }
}

/// Postgres connection settings.
#[derive(Args, Debug, Clone)]
pub struct DatabaseArgs {
    /// Postgres connection URL
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    /// Connections kept in the pool
    #[arg(long, env = "COHORT_AI_DB_MAX_CONNECTIONS", default_value_t = 1)]
    pub db_max_connections: u32,
}

impl DatabaseArgs {
    pub async fn connect(&self) -> AppResult<PgFeedbackStore> {
        PgFeedbackStore::connect(&self.database_url, self.db_max_connections).await
    }
}

/// Generative model settings (any OpenAI-compatible chat completions server).
#[derive(Args, Debug, Clone)]
pub struct LlmArgs {
    /// Base URL of the chat completions API
    #[arg(long, env = "COHORT_AI_LLM_BASE_URL", default_value = "https://api.groq.com/openai/v1")]
    pub llm_base_url: String,

    /// API key for the chat completions API
    ///
    /// Falls back to `GROQ_API_KEY`
    #[arg(long, env = "COHORT_AI_LLM_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    /// Model used for summaries and training plans
    #[arg(long, env = "COHORT_AI_LLM_MODEL", default_value = "llama-3.1-8b-instant")]
    pub llm_model: String,
}

impl LlmArgs {
    pub fn generator(&self) -> OpenAiGenerator {
        let api_key = self
            .llm_api_key
            .clone()
            .or_else(|| std::env::var("GROQ_API_KEY").ok());
        let client = get_client(&self.llm_base_url, api_key.as_deref());
        OpenAiGenerator::new(client, &self.llm_model)
    }
}

/// Embedding model settings (any OpenAI-compatible `/embeddings` server).
#[derive(Args, Debug, Clone)]
pub struct EmbedArgs {
    /// Base URL of the embeddings API
    #[arg(long, env = "COHORT_AI_EMBED_BASE_URL", default_value = "http://localhost:8080/v1")]
    pub embed_base_url: String,

    /// API key for the embeddings API
    #[arg(long, env = "COHORT_AI_EMBED_API_KEY", hide_env_values = true)]
    pub embed_api_key: Option<String>,

    /// Embedding model; must match the space of the stored response vectors
    #[arg(long, env = "COHORT_AI_EMBED_MODEL", default_value = "all-mpnet-base-v2")]
    pub embed_model: String,
}

impl EmbedArgs {
    pub fn embedder(&self) -> OAIEmbedder {
        let client = get_client(&self.embed_base_url, self.embed_api_key.as_deref());
        OAIEmbedder::new(client, &self.embed_model)
    }
}

/// Object storage settings for uploaded PDFs.
#[derive(Args, Debug, Clone)]
pub struct StorageArgs {
    /// Supabase project URL
    #[arg(long, env = "SUPABASE_URL")]
    pub supabase_url: String,

    /// Supabase service role key
    #[arg(long, env = "SUPABASE_SERVICE_ROLE_KEY", hide_env_values = true)]
    pub supabase_service_role_key: String,

    /// Storage bucket for training materials
    #[arg(long, env = "COHORT_AI_BUCKET", default_value = "training_materials")]
    pub bucket: String,
}

/// Overrides for the clustering pass.
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// Category that never produces clusters (repeatable)
    ///
    /// Defaults to "Class Metadata"
    #[arg(long = "skip-category", value_name = "CATEGORY")]
    pub skip_categories: Vec<String>,

    /// Category summarized as a whole instead of clustered (repeatable)
    ///
    /// Defaults to "Engagement", "Assessment" and "Resources"
    #[arg(long = "summary-only-category", value_name = "CATEGORY")]
    pub summary_only_categories: Vec<String>,

    /// Pause after each clustered cohort
    ///
    /// Accepts durations like `150ms`, `1s` or `0s`
    #[arg(long, default_value = "150ms")]
    pub cohort_delay: String,

    /// Seed for the k-means initialization
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl PipelineArgs {
    pub fn to_config(&self) -> AppResult<PipelineConfig> {
        let mut config = PipelineConfig {
            cohort_delay: humantime::parse_duration(&self.cohort_delay)?,
            seed: self.seed,
            ..PipelineConfig::default()
        };
        if !self.skip_categories.is_empty() {
            config.skip_categories = self.skip_categories.iter().cloned().collect::<HashSet<_>>();
        }
        if !self.summary_only_categories.is_empty() {
            config.summary_only_categories = self
                .summary_only_categories
                .iter()
                .cloned()
                .collect::<HashSet<_>>();
        }
        Ok(config)
    }
}

/// Helper trait for accessing verbosity flags on commands.
pub trait GetVerbosity {
    fn get_verbosity(&self) -> &Verbosity<InfoLevel>;
}

impl GetVerbosity for Cmd {
    fn get_verbosity(&self) -> &Verbosity<InfoLevel> {
        match self {
            Cmd::Cluster { verbosity, .. } => verbosity,
            Cmd::Ingest { verbosity, .. } => verbosity,
            Cmd::Submit { verbosity, .. } => verbosity,
            Cmd::Migrate { verbosity, .. } => verbosity,
            Cmd::Completion { verbosity, .. } => verbosity,
            Cmd::Show { what } => what.get_verbosity(),
        }
    }
}

impl GetVerbosity for ShowCmd {
    fn get_verbosity(&self) -> &Verbosity<InfoLevel> {
        match self {
            ShowCmd::Schema { verbosity } => verbosity,
            ShowCmd::Prompts { verbosity } => verbosity,
        }
    }
}

/// Print `value` as pretty JSON to stdout or write it to `output`.
async fn emit_json<T: Serialize>(value: &T, output: Option<&Path>) -> AppResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            tokio::fs::write(path, json.as_bytes()).await?;
            info!("Wrote {}", path.display());
        }
        None => tracing_indicatif::indicatif_println!("{json}"),
    }
    Ok(())
}

async fn read_input(input: &str) -> AppResult<String> {
    if input == "-" {
        let mut payload = String::new();
        tokio::io::stdin().read_to_string(&mut payload).await?;
        Ok(payload)
    } else {
        Ok(tokio::fs::read_to_string(input).await?)
    }
}

impl Cmd {
    /// Execute the chosen top-level command.
    #[tracing::instrument(name = "Running command", level = "info", skip(self))]
    pub async fn run(&self) -> AppResult<()> {
        match self {
            Cmd::Cluster {
                db,
                llm,
                embed,
                pipeline,
                output,
                ..
            } => {
                let config = pipeline.to_config()?;
                let store = db.connect().await?;
                let generator = llm.generator();
                let embedder = embed.embedder();
                let services = Services {
                    store: &store,
                    generator: &generator,
                    embedder: &embedder,
                };
                let report = run_clustering(&services, &config).await?;
                emit_json(&report, output.as_deref()).await
            }
            Cmd::Ingest {
                file,
                db,
                embed,
                storage,
                ..
            } => {
                let bytes = tokio::fs::read(file).await?;
                let file_name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let store = db.connect().await?;
                let objects = SupabaseStorage::new(
                    &storage.supabase_url,
                    &storage.supabase_service_role_key,
                    &storage.bucket,
                );
                let embedder = embed.embedder();
                let services = IngestServices {
                    objects: &objects,
                    extractor: &PdfTextExtractor,
                    embedder: &embedder,
                    store: &store,
                };
                let report = ingest_pdf(&services, &file_name, &bytes).await?;
                if let IngestReport::Error { message } = &report {
                    warn!("Ingestion of {file_name} stopped: {message}");
                }
                emit_json(&report, None).await
            }
            Cmd::Submit { input, db, .. } => {
                let payload = read_input(input).await?;
                let store = db.connect().await?;
                let report = submit_response(&store, &payload).await;
                emit_json(&report, None).await
            }
            Cmd::Migrate { db, .. } => {
                db.connect().await?.migrate().await?;
                info!("Database is up to date");
                Ok(())
            }
            Cmd::Completion { shell, output, .. } => {
                let mut cmd = Cli::command();
                if let Some(output_path) = output {
                    let mut file = std::fs::OpenOptions::new()
                        .write(true)
                        .truncate(true)
                        .create(true)
                        .open(output_path)?;
                    generate(shell, &mut cmd, "cohort-ai", &mut file);
                    info!(
                        "Generated completion script for {} at {}",
                        shell,
                        output_path.display()
                    );
                } else {
                    generate(shell, &mut cmd, "cohort-ai", &mut std::io::stdout());
                }
                Ok(())
            }
            Cmd::Show { what } => {
                match what {
                    ShowCmd::Schema { .. } => {
                        let schema = serde_json::to_string_pretty(&ClusterSynopsis::schema_value())?;
                        tracing_indicatif::indicatif_println!(
                            "Schema for response type {}:\n{}\n{schema}",
                            ClusterSynopsis::title(),
                            ClusterSynopsis::description()
                        );
                    }
                    ShowCmd::Prompts { .. } => {
                        for (name, template) in prompt_templates()? {
                            tracing_indicatif::indicatif_println!("# {name}\n\n{template}");
                        }
                    }
                }
                Ok(())
            }
        }
    }
}
