use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use corpusqa::app::App;
use corpusqa::config;
use corpusqa::control::{TurnOutcome, TurnRequest};
use corpusqa::models::{ChunkMetadata, MetadataFilter};
use corpusqa::server;
use corpusqa::state::{EventSink, ResumeSignal, TurnEvent};

#[derive(Parser)]
#[command(name = "cqa", version, about = "Grounded question answering over your documents")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "./config/cqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a default configuration file and initialize the store
    Init,

    /// Ingest a document file (or every .md/.txt file in a directory)
    Ingest {
        /// File or directory to ingest
        path: PathBuf,
        /// Optional category tag applied to every chunk
        #[arg(long)]
        category: Option<String>,
        /// Optional knowledge-type tag (e.g. reference, policy, faq)
        #[arg(long)]
        knowledge_type: Option<String>,
        /// Optional folder tag
        #[arg(long)]
        folder: Option<String>,
    },

    /// Ask a question and print the answer
    Ask {
        /// The question
        question: String,
        /// Force web search for this question
        #[arg(long)]
        web: bool,
        /// Restrict retrieval to one source file
        #[arg(long)]
        source: Option<String>,
        /// Number of passages to retrieve
        #[arg(long)]
        top_k: Option<usize>,
        /// Preference rules to apply to the answer (free text)
        #[arg(long)]
        prefs: Option<String>,
    },

    /// Run retrieval only and print the matching passages
    Search {
        /// The search query
        query: String,
        /// Number of passages to retrieve
        #[arg(long)]
        top_k: Option<usize>,
        /// Restrict retrieval to one source file
        #[arg(long)]
        source: Option<String>,
    },

    /// Delete every chunk ingested from a source file
    Delete {
        /// The source file name used at ingest time
        source: String,
    },

    /// Start the HTTP server
    Serve,
}

const DEFAULT_CONFIG: &str = r#"[store]
backend = "sqlite"
path = "./data/cqa.db"

[chunking]
strategy = "fixed"
parent_child = true
parent_chars = 2000
child_chars = 400
child_overlap = 80

[retrieval]
top_k = 4

[embedding]
provider = "hash"
dims = 256

[generator]
provider = "disabled"

[control]
max_retries = 3
human_approval = false

[server]
bind = "127.0.0.1:7431"
"#;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "corpusqa=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        return init(&cli.config).await;
    }

    let config = config::load_config(&cli.config)?;
    let app = Arc::new(App::from_config(config).await?);

    match cli.command {
        Commands::Init => unreachable!(),
        Commands::Ingest {
            path,
            category,
            knowledge_type,
            folder,
        } => ingest(&app, &path, category, knowledge_type, folder).await,
        Commands::Ask {
            question,
            web,
            source,
            top_k,
            prefs,
        } => ask(&app, question, web, source, top_k, prefs).await,
        Commands::Search {
            query,
            top_k,
            source,
        } => search(&app, &query, top_k, source).await,
        Commands::Delete { source } => delete(&app, &source).await,
        Commands::Serve => server::run_server(app).await,
    }
}

async fn init(config_path: &PathBuf) -> Result<()> {
    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
    } else {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(config_path, DEFAULT_CONFIG)?;
        println!("Wrote {}", config_path.display());
    }

    let config = config::load_config(config_path)?;
    // Builds the store and runs migrations as a side effect.
    App::from_config(config).await?;
    println!("Store initialized.");
    Ok(())
}

async fn ingest(
    app: &Arc<App>,
    path: &PathBuf,
    category: Option<String>,
    knowledge_type: Option<String>,
    folder: Option<String>,
) -> Result<()> {
    let files: Vec<PathBuf> = if path.is_dir() {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let p = entry.path();
            let ext = p.extension().and_then(|e| e.to_str()).unwrap_or("");
            if p.is_file() && matches!(ext, "md" | "txt") {
                found.push(p);
            }
        }
        found.sort();
        if found.is_empty() {
            bail!("No .md or .txt files in {}", path.display());
        }
        found
    } else {
        vec![path.clone()]
    };

    for file in files {
        let text = std::fs::read_to_string(&file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let source_file = file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        let metadata = ChunkMetadata {
            source_file: source_file.clone(),
            category: category.clone(),
            knowledge_type: knowledge_type.clone(),
            folder: folder.clone(),
        };
        let stats = app.index.ingest(&text, metadata).await?;
        println!(
            "Ingested {} ({} parents, {} children)",
            source_file, stats.parents, stats.children
        );
    }

    Ok(())
}

async fn ask(
    app: &Arc<App>,
    question: String,
    web: bool,
    source: Option<String>,
    top_k: Option<usize>,
    prefs: Option<String>,
) -> Result<()> {
    let filter = match source {
        Some(s) => MetadataFilter::by_source(&s),
        None => MetadataFilter::default(),
    };
    let request = TurnRequest {
        question,
        history: Vec::new(),
        preferences: prefs,
        filter,
        top_k,
        force_web_search: web,
        turn_id: None,
    };

    let (sink, rx) = EventSink::new();
    let printer = tokio::spawn(print_events(rx));

    let mut outcome = app.control.run_turn(request, &sink).await?;
    drop(sink);
    printer.await?;

    // Keep answering approval gates until the turn completes.
    loop {
        match outcome {
            TurnOutcome::Complete { answer, state } => {
                println!("\n{}", answer);
                if !state.kb_docs.is_empty() {
                    println!("\nSources:");
                    let mut seen = Vec::new();
                    for chunk in &state.kb_docs {
                        if !seen.contains(&chunk.metadata.source_file) {
                            println!("  - {}", chunk.metadata.source_file);
                            seen.push(chunk.metadata.source_file.clone());
                        }
                    }
                }
                for hit in &state.web_docs {
                    println!("  - {} ({})", hit.title, hit.url);
                }
                return Ok(());
            }
            TurnOutcome::Suspended(turn) => {
                let signal = prompt_for_signal()?;
                let (sink, rx) = EventSink::new();
                let printer = tokio::spawn(print_events(rx));
                outcome = app.control.resume(turn, signal, &sink).await?;
                drop(sink);
                printer.await?;
            }
        }
    }
}

async fn print_events(mut rx: tokio::sync::mpsc::UnboundedReceiver<TurnEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            TurnEvent::Status { node } => eprintln!("[{}]", node),
            TurnEvent::Token { .. } => {}
            TurnEvent::Interrupt { context } => {
                println!("\nReview requested for: {}", context.question);
                println!("Search query: {}", context.search_query);
                for (i, preview) in context.doc_previews.iter().enumerate() {
                    println!("  {}. {}", i + 1, preview);
                }
            }
            TurnEvent::Done => {}
        }
    }
}

fn prompt_for_signal() -> Result<ResumeSignal> {
    loop {
        print!("Approve these sources? [y]es / [n]o / [w]eb search / [f]eedback: ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        match line.trim().to_lowercase().as_str() {
            "y" | "yes" => return Ok(ResumeSignal::Approved),
            "n" | "no" => return Ok(ResumeSignal::Rejected),
            "w" | "web" => return Ok(ResumeSignal::WebSearchRequested),
            "f" | "feedback" => {
                print!("Feedback: ");
                std::io::stdout().flush()?;
                let mut feedback = String::new();
                std::io::stdin().read_line(&mut feedback)?;
                return Ok(ResumeSignal::Feedback(feedback.trim().to_string()));
            }
            _ => println!("Please answer y, n, w, or f."),
        }
    }
}

async fn search(
    app: &Arc<App>,
    query: &str,
    top_k: Option<usize>,
    source: Option<String>,
) -> Result<()> {
    let filter = match source {
        Some(s) => MetadataFilter::by_source(&s),
        None => MetadataFilter::default(),
    };
    let k = top_k.unwrap_or(app.config.retrieval.top_k);
    let results = app.engine.retrieve(query, k, &filter).await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, chunk) in results.iter().enumerate() {
        println!("{}. [{}]", i + 1, chunk.metadata.source_file);
        for line in chunk.text.lines().take(3) {
            println!("   {}", line);
        }
        println!();
    }
    Ok(())
}

async fn delete(app: &Arc<App>, source: &str) -> Result<()> {
    let stats = app.index.delete_by_source(source).await?;
    if stats.children == 0 {
        println!("Nothing indexed under {}", source);
    } else {
        println!(
            "Deleted {} chunks and {} parent passages from {}",
            stats.children, stats.parents, source
        );
    }
    Ok(())
}
