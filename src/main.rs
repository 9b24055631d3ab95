//! CLI entry point for the knowledge-base search engine.
//!
//! Every command that touches the index loads settings, opens the data
//! directory, runs, and shuts the index down cleanly before exiting.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use kbsearch::display::{self, THEME};
use kbsearch::io::{ExitCode, JsonResponse, OutputFormat, ResponseMeta};
use kbsearch::semantic::build_embedder;
use kbsearch::{
    ArticleId, ArticleSource, ArticleText, CategoryId, JsonArticleSource, KbError,
    KnowledgeIndex, SearchFilters, Settings,
};
use serde::Serialize;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Knowledge-base semantic search
#[derive(Parser)]
#[command(
    name = "kbsearch",
    version = env!("CARGO_PKG_VERSION"),
    about = "Semantic search over knowledge-base articles",
    long_about = "Embed knowledge-base articles and find the ones most similar to a question.",
    next_line_help = true,
    styles = clap_cargo_style(),
    after_help = "Quick Start:\n  $ kbsearch init\n  $ kbsearch import articles.json\n  $ kbsearch search how do I reset my password"
)]
struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
enum Commands {
    /// Initialize project
    #[command(about = "Set up .kbsearch directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show current configuration settings
    #[command(about = "Display active settings from .kbsearch/settings.toml")]
    Config,

    /// Embed every article in a JSON file
    #[command(
        about = "Import articles from a JSON file",
        after_help = "The file holds an array of objects:\n  [{\"id\": 1, \"title\": \"Reset password\", \"content\": \"...\", \"category_id\": 3}]"
    )]
    Import {
        /// JSON file with articles
        file: PathBuf,

        /// Re-embed articles whose text did not change
        #[arg(short, long)]
        force: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Embed or re-embed one article
    Upsert {
        #[arg(long)]
        id: u64,

        #[arg(long, default_value = "")]
        title: String,

        #[arg(long, default_value = "")]
        content: String,

        #[arg(long)]
        category: Option<u64>,
    },

    /// Remove an article from the index
    Delete { id: u64 },

    /// Re-fetch an article's text and re-embed it
    Reindex {
        id: u64,

        /// JSON file the article text is read from
        #[arg(long)]
        articles: PathBuf,
    },

    /// Find the articles most similar to a question
    #[command(
        after_help = "Examples:\n  kbsearch search reset password\n  kbsearch search shipping costs -k 3 --category 2\n  kbsearch search refund --json | jq '.data[].article_id'"
    )]
    Search {
        /// Query text
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,

        /// Number of results (defaults to search.default_k)
        #[arg(short)]
        k: Option<usize>,

        /// Only articles in these categories
        #[arg(long)]
        category: Vec<u64>,

        /// Minimum similarity score
        #[arg(long)]
        threshold: Option<f32>,

        /// JSON article file used to show titles
        #[arg(long)]
        articles: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show index statistics
    Health {
        /// Also compare the index with the vector store
        #[arg(long)]
        verify: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Rebuild the similarity index from the vector store
    Rebuild,

    /// Rewrite the vector log without superseded records
    Compact,
}

impl Commands {
    fn output_format(&self) -> OutputFormat {
        let json = match self {
            Self::Import { json, .. } | Self::Search { json, .. } | Self::Health { json, .. } => {
                *json
            }
            _ => false,
        };
        OutputFormat::from_json_flag(json)
    }
}

#[derive(Serialize)]
struct SearchHit {
    article_id: ArticleId,
    score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let format = cli.command.output_format();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(error) => report_error(&error, format),
    };
    std::process::exit(code.into());
}

fn report_error(error: &anyhow::Error, format: OutputFormat) -> ExitCode {
    let Some(kb_error) = error.downcast_ref::<KbError>() else {
        eprintln!("{}", THEME.error_with_icon(&format!("{error:#}")));
        return ExitCode::GeneralError;
    };

    if format.is_json() {
        let response = JsonResponse::from_error(kb_error);
        match serde_json::to_string_pretty(&response) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Error serializing response: {e}"),
        }
    } else {
        eprintln!("{}", THEME.error_with_icon(&format!("{error:#}")));
        for suggestion in kb_error.recovery_suggestions() {
            eprintln!("  {}", THEME.apply(&THEME.dim, suggestion));
        }
    }
    ExitCode::from_error(kb_error)
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let settings = match path {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("Configuration error loading from {}", path.display()))?,
        None => Settings::load().context("Configuration error")?,
    };
    Ok(settings)
}

fn article_id(raw: u64) -> anyhow::Result<ArticleId> {
    ArticleId::new(raw).context("article ids start at 1")
}

fn category_id(raw: u64) -> anyhow::Result<CategoryId> {
    CategoryId::new(raw).context("category ids start at 1")
}

fn print_json<T: Serialize>(data: T, started: Instant) -> anyhow::Result<()> {
    let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let response = JsonResponse::success(data).with_meta(ResponseMeta::now(elapsed));
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let started = Instant::now();
    let format = cli.command.output_format();

    if let Commands::Init { force } = &cli.command {
        let root = std::env::current_dir()?;
        let path = Settings::init_config_file(&root, *force)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        println!(
            "{}",
            THEME.success_with_icon(&format!("Created configuration file at: {}", path.display()))
        );
        println!("Edit this file to customize your settings.");
        return Ok(ExitCode::Success);
    }

    let settings = load_settings(cli.config.as_deref())?;
    kbsearch::logging::init(&settings.logging)?;

    if let Commands::Config = &cli.command {
        println!("{}", THEME.apply(&THEME.header, "Current Configuration:"));
        println!("{}", "=".repeat(50));
        println!("{}", toml::to_string_pretty(&settings)?);
        return Ok(ExitCode::Success);
    }

    // Article files double as the reindex source
    let source: Option<Arc<JsonArticleSource>> = match &cli.command {
        Commands::Import { file, .. } => Some(Arc::new(JsonArticleSource::load(file)?)),
        Commands::Reindex { articles, .. } => Some(Arc::new(JsonArticleSource::load(articles)?)),
        Commands::Search {
            articles: Some(path),
            ..
        } => Some(Arc::new(JsonArticleSource::load(path)?)),
        _ => None,
    };

    let embedder = build_embedder(&settings.embedding)?;
    let index = KnowledgeIndex::open_with_embedder(
        &settings,
        embedder,
        source
            .clone()
            .map(|source| source as Arc<dyn ArticleSource>),
    )
    .await?;

    let result = execute(&index, cli.command, source.as_deref(), format, started).await;
    let closed = index.shutdown().await;
    let code = result?;
    closed?;
    Ok(code)
}

async fn execute(
    index: &KnowledgeIndex,
    command: Commands,
    source: Option<&JsonArticleSource>,
    format: OutputFormat,
    started: Instant,
) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Init { .. } | Commands::Config => {
            // Handled before the index is opened
            Ok(ExitCode::Success)
        }

        Commands::Import { force, .. } => {
            let articles = source.map(JsonArticleSource::articles).unwrap_or_default();
            let report = index.index_articles(articles, force).await?;

            if format.is_json() {
                print_json(&report, started)?;
            } else {
                println!("{}", display::create_import_table(&report));
                for (id, reason) in &report.failed {
                    eprintln!(
                        "{}",
                        THEME.warning_with_icon(&format!("Article {id}: {reason}"))
                    );
                }
            }
            Ok(if report.failed.is_empty() {
                ExitCode::Success
            } else {
                ExitCode::EmbeddingError
            })
        }

        Commands::Upsert {
            id,
            title,
            content,
            category,
        } => {
            let mut article = ArticleText::new(article_id(id)?, title, content);
            if let Some(category) = category {
                article = article.with_category(category_id(category)?);
            }
            let outcome = index.upsert(&article).await?;
            println!(
                "{}",
                THEME.success_with_icon(&format!("Article {id}: {outcome:?}"))
            );
            Ok(ExitCode::Success)
        }

        Commands::Delete { id } => {
            let outcome = index.remove(article_id(id)?).await?;
            println!(
                "{}",
                THEME.success_with_icon(&format!("Article {id}: {outcome:?}"))
            );
            Ok(ExitCode::Success)
        }

        Commands::Reindex { id, .. } => {
            let outcome = index.reindex(article_id(id)?).await?;
            println!(
                "{}",
                THEME.success_with_icon(&format!("Article {id}: {outcome:?}"))
            );
            Ok(ExitCode::Success)
        }

        Commands::Search {
            query,
            k,
            category,
            threshold,
            ..
        } => {
            let mut filters = SearchFilters {
                categories: category
                    .into_iter()
                    .map(category_id)
                    .collect::<anyhow::Result<_>>()?,
                min_score: None,
            };
            if let Some(threshold) = threshold {
                filters = filters.with_min_score(threshold);
            }

            let results = index.search(query.join(" "), k, filters).await?;
            let title_of = |id: ArticleId| {
                source
                    .and_then(|s| s.article(id).ok().flatten())
                    .map(|article| article.title)
            };

            if format.is_json() {
                let hits: Vec<SearchHit> = results
                    .iter()
                    .map(|r| SearchHit {
                        article_id: r.article_id,
                        score: r.score.get(),
                        title: title_of(r.article_id),
                    })
                    .collect();
                print_json(hits, started)?;
            } else if results.is_empty() {
                println!("{}", THEME.warning_with_icon("No matching articles"));
            } else {
                let titles: Option<&dyn Fn(ArticleId) -> Option<String>> = if source.is_some() {
                    Some(&title_of)
                } else {
                    None
                };
                println!("{}", display::create_results_table(&results, titles));
            }
            Ok(ExitCode::from_search_results(&results))
        }

        Commands::Health { verify, .. } => {
            let verified = if verify {
                Some(index.verify().await)
            } else {
                None
            };
            let report = index.health();

            if format.is_json() {
                print_json(&report, started)?;
            } else {
                println!("{}", display::create_health_table(&report));
            }
            match verified {
                Some(Err(e)) => Err(e.into()),
                _ if report.consistent => Ok(ExitCode::Success),
                _ => Ok(ExitCode::IndexInconsistent),
            }
        }

        Commands::Rebuild => {
            let stats = index.rebuild().await?;
            let layout = if stats.flat {
                "flat".to_string()
            } else {
                format!("{} partitions", stats.partitions)
            };
            println!(
                "{}",
                THEME.success_with_icon(&format!(
                    "Rebuilt index: {} articles, {layout}",
                    stats.entries
                ))
            );
            Ok(ExitCode::Success)
        }

        Commands::Compact => {
            let (before, after) = index.compact()?;
            println!(
                "{}",
                THEME.success_with_icon(&format!(
                    "Compacted vector log: {before} -> {after} bytes"
                ))
            );
            Ok(ExitCode::Success)
        }
    }
}
