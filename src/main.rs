#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unnecessary_wraps,
    dead_code
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use parley::agent::{EngineAgent, Persona, ScriptedEngine};
use parley::config::Config;
use parley::conversation::{create_conversation_store, ConversationStore};
use parley::interceptor::MessageInterceptor;
use parley::message::Message;
use parley::routing::create_router;
use parley::storage::{create_hybrid_storage, create_storage, Storage};

/// `parley` - message interception and conversation routing.
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version)]
#[command(about = "Inspect and drive the message interception pipeline.", long_about = None)]
struct Cli {
    /// Config directory (overrides PARLEY_CONFIG_DIR)
    #[arg(long, global = true)]
    config_dir: Option<String>,

    /// Explicit config file; must exist
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show configuration, storage backend and routing rules
    Status,

    /// List storage keys matching a glob pattern
    Keys {
        #[arg(default_value = "*")]
        pattern: String,
    },

    /// Print the value or list stored under a key
    Get { key: String },

    /// List active conversations
    Conversations {
        /// Only conversations this participant belongs to
        #[arg(long)]
        participant: Option<String>,
    },

    /// Print the most recent messages of a conversation
    History {
        conversation_id: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Close a conversation
    Close { conversation_id: String },

    /// Remove expired keys
    Cleanup,

    /// Copy every key from the hybrid primary to its secondary
    #[command(long_about = "\
Copy every key from the hybrid primary backend to its secondary.

Uses the [storage.hybrid] section regardless of storage.backend. \
Re-running overwrites keys already copied.

Examples:
  parley migrate
  PARLEY_DATA_DIR=/srv/parley parley migrate")]
    Migrate,

    /// Run one message through the pipeline with the scripted engine
    #[command(long_about = "\
Run one message through the full pipeline.

The message is routed, bound to a conversation and answered by a \
scripted agent with canned replies. State is persisted in the \
configured storage backend, so follow-up sends continue the same \
conversation.

Examples:
  parley send --from user_123 hello
  parley send --from user_123 --to assistant \"what are your prices?\"")]
    Send {
        #[arg(long)]
        from: String,
        /// Agent id; defaults to interceptor.default_agent
        #[arg(long)]
        to: Option<String>,
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("PARLEY_CONFIG_DIR", config_dir);
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path).await?,
        None => Config::load_or_init().await?,
    };

    match cli.command {
        Commands::Status => status(&config).await,

        Commands::Keys { pattern } => {
            let storage = create_storage(&config.storage).await?;
            let keys = storage.list_keys(&pattern).await?;
            for key in &keys {
                println!("{key}");
            }
            println!("\n{} key(s)", keys.len());
            Ok(())
        }

        Commands::Get { key } => {
            let storage = create_storage(&config.storage).await?;
            if let Some(value) = storage.get(&key).await? {
                println!("{}", serde_json::to_string_pretty(&value)?);
                return Ok(());
            }
            let list = storage.get_list(&key, 0, -1).await?;
            if list.is_empty() {
                println!("(not found)");
            } else {
                println!("{}", serde_json::to_string_pretty(&list)?);
            }
            Ok(())
        }

        Commands::Conversations { participant } => {
            let conversations = open_conversations(&config).await?;
            let active = conversations.list_active(participant.as_deref()).await?;
            if active.is_empty() {
                println!("No active conversations.");
            }
            for ctx in &active {
                println!(
                    "{}  participants: {}  agent: {}  updated: {}",
                    ctx.conversation_id,
                    ctx.participant_ids.join(", "),
                    ctx.agent_id.as_deref().unwrap_or("-"),
                    ctx.updated_at.to_rfc3339()
                );
            }
            Ok(())
        }

        Commands::History {
            conversation_id,
            limit,
        } => {
            let conversations = open_conversations(&config).await?;
            if conversations.get(&conversation_id).await?.is_none() {
                bail!("conversation not found: {conversation_id}");
            }
            for msg in conversations.get_history(&conversation_id, limit).await? {
                println!(
                    "[{}] {} -> {}: {}",
                    msg.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    msg.sender_id,
                    msg.recipient_id,
                    msg.content
                );
            }
            if let Some(stats) = conversations.stats(&conversation_id).await? {
                println!(
                    "\n{} message(s), {} participant(s), {}s, {}",
                    stats.message_count,
                    stats.participant_count,
                    stats.duration_secs,
                    if stats.is_active { "active" } else { "closed" }
                );
            }
            Ok(())
        }

        Commands::Close { conversation_id } => {
            let conversations = open_conversations(&config).await?;
            conversations.close(&conversation_id).await?;
            println!("Closed {conversation_id}");
            Ok(())
        }

        Commands::Cleanup => {
            let storage = create_storage(&config.storage).await?;
            let removed = storage.cleanup_expired().await?;
            println!("Removed {removed} expired key(s)");
            Ok(())
        }

        Commands::Migrate => {
            let hybrid = create_hybrid_storage(&config.storage).await?;
            let report = hybrid.migrate_to_secondary().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }

        Commands::Send { from, to, text } => send(&config, from, to, text).await,
    }
}

async fn open_conversations(config: &Config) -> Result<Arc<dyn ConversationStore>> {
    let storage = create_storage(&config.storage).await?;
    Ok(create_conversation_store(storage))
}

async fn status(config: &Config) -> Result<()> {
    println!("parley {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Config:      {}", config.config_path.display());
    println!("Storage:     {}", config.storage.backend);
    println!("  Data dir:  {}", config.storage.resolved_data_dir().display());
    println!("  Redis:     {}", config.storage.redis_url);
    println!(
        "  Hybrid:    {} -> {} (sync: {})",
        config.storage.hybrid.primary,
        config
            .storage
            .hybrid
            .secondary
            .map_or_else(|| "none".to_string(), |b| b.to_string()),
        if config.storage.hybrid.sync { "on" } else { "off" }
    );
    println!(
        "Interceptor: default agent {}, poll {}ms, history {}",
        if config.interceptor.default_agent.is_empty() {
            "(none)"
        } else {
            config.interceptor.default_agent.as_str()
        },
        config.interceptor.queue_poll_interval_ms,
        config.interceptor.history_limit
    );
    println!(
        "Routing:     inactivity {}s, default priority {}",
        config.routing.inactivity_timeout_secs, config.routing.default_rule_priority
    );

    let storage = create_storage(&config.storage).await?;
    let router = create_router(storage, &config.routing)?;
    println!();
    println!("Rules:");
    for rule in router.list_rules().await {
        println!(
            "  {:>4}  {}{}",
            rule.priority,
            rule.name,
            if rule.builtin { " (built-in)" } else { "" }
        );
    }
    Ok(())
}

fn scripted_engine() -> ScriptedEngine {
    ScriptedEngine::new()
        .with_response("hello", "Hello! I'm your AI assistant. How can I help you today?")
        .with_response(
            "help",
            "I'm here to help! You can ask me about:\n- Technical support\n- Product information\n- General questions",
        )
        .with_response("bye", "Thank you for chatting! Have a great day!")
        .with_response("support", "I can help you with technical issues. Please describe your problem.")
        .with_response("price", "For pricing information, please visit our website or contact sales.")
}

async fn send(config: &Config, from: String, to: Option<String>, text: String) -> Result<()> {
    let agent_id = to
        .or_else(|| Some(config.interceptor.default_agent.clone()))
        .filter(|id| !id.is_empty())
        .context("no agent given: pass --to or set interceptor.default_agent")?;

    let storage = create_storage(&config.storage).await?;
    let router = create_router(storage.clone(), &config.routing)?;
    let conversations = create_conversation_store(storage);

    let agent = EngineAgent::new(
        agent_id.as_str(),
        Persona::new("Assistant", "AI Helper", "Helpful, friendly, and knowledgeable"),
    )
    .with_engine(Arc::new(scripted_engine()))
    .with_history(conversations.clone(), config.interceptor.history_limit);

    let interceptor = MessageInterceptor::from_config(router, conversations, &config.interceptor)
        .with_default_agent(agent_id.as_str());
    interceptor.register_agent(Arc::new(agent));

    let mut message = Message::new(from, agent_id, text);
    let response = interceptor.intercept(&mut message).await?;
    match response {
        Some(reply) => {
            println!("{}", reply.content);
            if let Some(id) = &message.conversation_id {
                println!("\n(conversation {id})");
            }
        }
        None => println!("(no response, message {})", message.status),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_has_no_flag_conflicts() {
        Cli::command().debug_assert();
    }

    #[test]
    fn send_parses_sender_and_text() {
        let cli = Cli::try_parse_from(["parley", "send", "--from", "user_123", "hello there"])
            .expect("send invocation should parse");
        match cli.command {
            Commands::Send { from, to, text } => {
                assert_eq!(from, "user_123");
                assert!(to.is_none());
                assert_eq!(text, "hello there");
            }
            other => panic!("expected send command, got {other:?}"),
        }
    }

    #[test]
    fn history_limit_defaults_to_twenty() {
        let cli = Cli::try_parse_from(["parley", "history", "c-1"]).unwrap();
        match cli.command {
            Commands::History { limit, .. } => assert_eq!(limit, 20),
            other => panic!("expected history command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn scripted_engine_answers_canned_prompts() {
        use parley::agent::ResponseEngine;
        let engine = scripted_engine();
        let msg = Message::new("user_002", "assistant", "What are your prices?");
        let text = engine.generate(&msg, &[], &Persona::default()).await.unwrap();
        assert!(text.starts_with("For pricing information"));
    }
}
