mod interactive;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use promptlab_config::AppConfig;
use promptlab_llm::{CompletionRequest, InferenceClient};
use promptlab_prompt::{builtin_templates, find_template};
use promptlab_runtime::{ConversationStore, HttpConversationStore};

#[derive(Debug, Parser)]
#[command(
    name = "promptlab",
    version,
    about = "Conversation workbench client for a local LLM experiment server"
)]
struct Cli {
    /// Path to the config file (default: .promptlab/config.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Interactive chat against the configured experiment.
    Chat {
        /// Run the tool-augmented agent loop instead of plain chat.
        #[arg(long)]
        agent: bool,
    },
    /// One-shot completion over a prompt (reads stdin when omitted).
    Complete {
        prompt: Option<String>,
        /// Render the prompt through a built-in template first.
        #[arg(long, value_name = "ID")]
        template: Option<String>,
    },
    /// List the built-in completion templates.
    Templates,
    /// List saved conversations for the configured experiment.
    Conversations,
    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(".promptlab").join("config.toml"));
    let config = AppConfig::load_from(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command.unwrap_or(Commands::Chat { agent: false }) {
        Commands::Chat { agent } => {
            ensure_model(&config, &config_path)?;
            interactive::run_chat_session(&config, agent).await
        }
        Commands::Complete { prompt, template } => {
            ensure_model(&config, &config_path)?;
            run_completion(&config, prompt, template.as_deref()).await
        }
        Commands::Templates => {
            list_templates();
            Ok(())
        }
        Commands::Conversations => list_conversations(&config).await,
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// A session without a running model is blocked before any request is made.
fn ensure_model(config: &AppConfig, config_path: &Path) -> Result<()> {
    if !config.has_model() {
        bail!(
            "no model is running — set [experiment] model in {}",
            config_path.display()
        );
    }
    Ok(())
}

async fn run_completion(
    config: &AppConfig,
    prompt: Option<String>,
    template_id: Option<&str>,
) -> Result<()> {
    let text = match prompt {
        Some(text) => text,
        None => {
            let mut buffer = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buffer)
                .await
                .context("read prompt from stdin")?;
            buffer
        }
    };

    let template = match template_id {
        Some(id) => Some(find_template(id).with_context(|| {
            format!("unknown template {id:?}; run `promptlab templates` for the list")
        })?),
        None => None,
    };

    let generation = &config.generation;
    let (prompt, temperature, max_tokens, top_p) = match &template {
        Some(t) => (
            t.render(text.trim_end()),
            t.temperature.unwrap_or(generation.temperature),
            t.max_tokens.unwrap_or(generation.max_tokens),
            t.top_p.unwrap_or(generation.top_p),
        ),
        None => (
            text,
            generation.temperature,
            generation.max_tokens,
            generation.top_p,
        ),
    };

    let llm = InferenceClient::new(&config.backend.base_url);
    let request = CompletionRequest {
        model: config.experiment.model.clone(),
        adaptor: config.experiment.adaptor_opt().map(ToString::to_string),
        prompt,
        temperature,
        max_tokens,
        top_p,
        stream: false,
        stop_sequences: generation.stop.clone(),
    };
    let result = llm.completion(&request).await?;
    println!("{}", result.text);
    Ok(())
}

fn list_templates() {
    for template in builtin_templates() {
        println!("{}  {}", template.id, template.title);
    }
}

async fn list_conversations(config: &AppConfig) -> Result<()> {
    let store = HttpConversationStore::new(&config.backend.base_url);
    let conversations = store.list(&config.experiment.id).await?;
    if conversations.is_empty() {
        println!("(no saved conversations)");
        return Ok(());
    }
    for saved in conversations {
        match saved.turns() {
            Ok(turns) => println!("{}  ({} turns)", saved.id, turns.len()),
            Err(err) => println!("{}  (unreadable: {err})", saved.id),
        }
    }
    Ok(())
}
