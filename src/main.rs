//! synth - ask the tiered model router a question from the command line.
//!
//! Answers go to stdout; logs go to stderr and are filtered by `SYNTH_LOG`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use synth_core::augment::{
    CombinedWebSearch, ContextAugmenter, DuckDuckGoSearch, EmbeddingRetrievalStore,
    InMemoryRetrievalStore, RetrievalStore, WikipediaSearch,
};
use synth_core::{
    Action, AugmentFlags, CapabilityTable, ContextHint, Health, HttpBackend, Pipeline, Query,
    SynthConfig, Tier,
};

#[derive(Parser, Debug)]
#[command(name = "synth", version, about = "Route a question to the best available model")]
struct Cli {
    /// Configuration file (defaults to ~/.config/synth/synth.toml then ./synth.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Answer a question
    Ask {
        /// Question text
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,

        /// Start at this tier (fast, balanced, smart, cloud-primary, cloud-secondary)
        #[arg(long)]
        tier: Option<Tier>,

        /// Clipboard content to include as context
        #[arg(long)]
        clipboard: Option<String>,

        /// Screen text to include as context
        #[arg(long)]
        screen: Option<String>,

        /// Always search the web
        #[arg(long)]
        web: bool,

        /// Always consult the knowledge store
        #[arg(long)]
        retrieval: bool,

        /// Files to index into the knowledge store (glob, `~` allowed)
        #[arg(long)]
        corpus: Option<String>,

        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Probe every configured backend and print its health
    ///
    /// Exits with status 1 when any backend is unreachable.
    Health {
        #[arg(long)]
        json: bool,

        /// Also send a short prompt to each reachable tier and report request stats
        #[arg(long)]
        smoke: bool,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("SYNTH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Knowledge store for `ask`: embedding-ranked when an embedding model is
/// configured, term overlap otherwise.
async fn build_store(
    config: &SynthConfig,
    corpus: Option<&str>,
    clipboard: Option<&str>,
) -> Result<Arc<dyn RetrievalStore>> {
    if let (Some(model), Some(endpoint)) =
        (config.augment.embedding_model.as_deref(), config.embedding_endpoint())
    {
        let store = EmbeddingRetrievalStore::new(endpoint)?.with_model(model);
        if let Some(pattern) = corpus {
            let added = store.index_glob(pattern).await?;
            tracing::info!(added, pattern, "corpus embedded");
        }
        if let Some(text) = clipboard {
            if let Err(e) = store.add_clipboard_content(text).await {
                tracing::warn!(error = %e, "clipboard not stored");
            }
        }
        return Ok(Arc::new(store));
    }

    let store = InMemoryRetrievalStore::new();
    if let Some(pattern) = corpus {
        let added = store.index_glob(pattern)?;
        tracing::info!(added, pattern, "corpus indexed");
    }
    if let Some(text) = clipboard {
        store.add_clipboard_content(text);
    }
    Ok(Arc::new(store))
}

fn load_config(path: Option<&PathBuf>) -> Result<SynthConfig> {
    let config = match path {
        Some(path) => SynthConfig::load_from_path(path),
        None => SynthConfig::load(),
    };
    config.context("failed to load configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Ask {
            text,
            tier,
            clipboard,
            screen,
            web,
            retrieval,
            corpus,
            json,
        } => {
            let store = build_store(&config, corpus.as_deref(), clipboard.as_deref()).await?;

            let mut hints = Vec::new();
            if let Some(content) = clipboard {
                hints.push(ContextHint::clipboard(content));
            }
            if let Some(content) = screen {
                hints.push(ContextHint::screen(content));
            }

            let search = CombinedWebSearch::new()
                .with_provider("duckduckgo", Arc::new(DuckDuckGoSearch::new()?))
                .with_provider("wikipedia", Arc::new(WikipediaSearch::new()?));
            let augmenter = ContextAugmenter::new(config.augment.clone())
                .with_retrieval(store)
                .with_web_search(Arc::new(search))
                .with_capabilities(CapabilityTable::with_builtins());
            let mut pipeline = Pipeline::from_config(&config, Arc::new(HttpBackend::new()?))?
                .with_augmenter(augmenter);
            let _prober = pipeline.spawn_configured_probing();

            let query = Query::new(text.join(" "))
                .with_hints(hints)
                .with_override(tier)
                .with_flags(AugmentFlags {
                    force_retrieval: retrieval,
                    force_web_search: web,
                });

            let answered = pipeline
                .handle(query, &tokio_util::sync::CancellationToken::new())
                .await;
            pipeline.shutdown();

            let outcome = match answered {
                Ok(outcome) => outcome,
                Err(err) if err.is_exhausted() => {
                    eprintln!("synth: no backend could answer");
                    for attempt in err.attempts().unwrap_or_default() {
                        eprintln!(
                            "  {:<16} {:<17} {:>6}ms  {}",
                            attempt.tier.to_string(),
                            attempt.outcome.to_string(),
                            attempt.latency_ms,
                            attempt.detail.as_deref().unwrap_or("")
                        );
                    }
                    std::process::exit(2);
                }
                Err(err) => return Err(err.into()),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                return Ok(());
            }

            println!("{}", outcome.result.answer_text);
            if let Action::Recognized(action) = &outcome.action {
                let params: Vec<String> = action
                    .parameters
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                eprintln!(
                    "\naction: {} {}{}",
                    action.kind,
                    params.join(" "),
                    if action.requires_confirmation {
                        " (needs confirmation)"
                    } else {
                        ""
                    }
                );
            }
            if let Some(tier) = outcome.source() {
                eprintln!(
                    "[{} | confidence {:.2} | {} attempt(s)]",
                    tier,
                    outcome.result.confidence,
                    outcome.attempts.len()
                );
            }
        }
        Commands::Health { json, smoke } => {
            let pipeline = Pipeline::from_config(&config, Arc::new(HttpBackend::new()?))?;
            pipeline.prober().probe_all().await;

            let report = pipeline.registry().snapshot();
            if smoke {
                for row in report.iter().filter(|r| r.health == Health::Reachable) {
                    if let Err(e) = pipeline.dispatcher().dispatch("Say OK.", &[row.tier]).await {
                        tracing::warn!(tier = %row.tier, error = %e, "smoke request failed");
                    }
                }
            }
            let stats = smoke.then(|| pipeline.stats());

            if json {
                let body = serde_json::json!({ "backends": report, "stats": stats });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                for row in &report {
                    println!(
                        "{:<16} {:<12} {:<32} {}",
                        row.tier.to_string(),
                        row.health.to_string(),
                        row.endpoint,
                        row.model
                    );
                }
                if let Some(stats) = &stats {
                    println!(
                        "\nrequests: {} total, {} ok, {} failed, avg {:.0}ms",
                        stats.total_requests,
                        stats.successful_requests,
                        stats.failed_requests,
                        stats.avg_response_time_ms
                    );
                }
            }

            if report.iter().any(|r| r.health == Health::Unreachable) {
                std::process::exit(1);
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
