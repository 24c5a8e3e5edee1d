//! TOSCheck CLI
//!
//! Flags risky clauses in Terms of Service and Privacy documents, builds passage indexes
//! and explains clauses against a knowledge base.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use toscheck_lib::models::{CombineMode, ScanEngine};
use toscheck_lib::services::config_store::{AppConfig, ConfigStore};
use toscheck_lib::services::detection::{
    answer_query, explain_clauses, label_chunks, DocumentScan, EmbeddingRetriever, ExplainSettings, FlagPipeline,
    PassageIndex, PatternMatcher, SeedSet,
};
use toscheck_lib::services::embedding_cache::DiskEmbeddingCache;
use toscheck_lib::services::providers::{ChatModel, Embedder, ProviderClient};
use toscheck_lib::services::text_processor::{chunk_text, normalize_text};

#[derive(Parser)]
#[command(name = "toscheck")]
#[command(about = "TOSCheck - flag risky Terms of Service and Privacy clauses", long_about = None)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a UTF-8 text document and print the flag report
    Scan {
        /// Document to scan
        input: PathBuf,

        /// Detection engine: heuristics, rag, llm or hybrid
        #[arg(long)]
        engine: Option<String>,

        /// Sentences per window
        #[arg(long)]
        window: Option<usize>,

        /// Sentences shared by consecutive windows
        #[arg(long)]
        overlap: Option<usize>,

        /// Similarity threshold for seed matches
        #[arg(long)]
        threshold: Option<f32>,

        /// Max suspect sentences kept by the heuristic detector
        #[arg(long)]
        max_suspects: Option<usize>,

        /// Rewrite rationales with a second LLM pass
        #[arg(long)]
        llm_polish: bool,

        /// Keep only LLM flags confirmed by the pattern or seed detectors
        #[arg(long)]
        intersect: bool,

        /// Send every sentence to the LLM instead of pattern-preselected ones
        #[arg(long)]
        no_preselect: bool,

        /// Category rules JSON
        #[arg(long)]
        rules: Option<PathBuf>,

        /// Seed sentences JSON
        #[arg(long)]
        seeds: Option<PathBuf>,

        /// Sentence segmenter service URL
        #[arg(long)]
        segmenter: Option<String>,

        /// Print a readable summary instead of JSON
        #[arg(long)]
        text: bool,

        /// Write the JSON report to this path
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Chunk and embed a file (or a directory of knowledge-base files) into a passage index
    Index {
        /// File or directory to index
        #[arg(long)]
        input: PathBuf,

        /// Index directory
        #[arg(long, default_value = ".ragcache")]
        cache: PathBuf,

        /// Max words per chunk
        #[arg(long, default_value = "500")]
        max_tokens: usize,

        /// Words carried over between chunks
        #[arg(long, default_value = "150")]
        overlap: usize,
    },

    /// Ask a question against one passage index
    Ask {
        #[arg(long)]
        query: String,

        /// Index directory
        #[arg(long, default_value = ".ragcache")]
        cache: PathBuf,

        /// Passages used as context
        #[arg(long, default_value = "6")]
        k: usize,

        /// Write the answer and hits as JSON to this path
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Explain every document chunk against a knowledge-base index
    Explain {
        /// Document index directory
        #[arg(long, default_value = ".ragcache")]
        cache: PathBuf,

        /// Knowledge-base index directory
        #[arg(long, default_value = "kb_rag")]
        kb: PathBuf,

        /// KB passages per clause
        #[arg(long, default_value = "3")]
        k_kb: usize,

        /// Drop KB matches scoring below this
        #[arg(long, default_value = "0.30")]
        kb_threshold: f32,

        /// Write explanations as JSON to this path
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Manage provider API keys stored in the config file
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Store a key
    Set {
        #[arg(long, default_value = "openai")]
        provider: String,
        #[arg(long)]
        value: String,
    },
    /// Show whether a key is stored
    Show {
        #[arg(long, default_value = "openai")]
        provider: String,
    },
    /// Remove a stored key
    Delete {
        #[arg(long, default_value = "openai")]
        provider: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    toscheck_lib::init_logging(if cli.verbose { "debug" } else { "info" });

    // `key set` may create the config file, so it does not need one up front.
    let config = match cli.command {
        Commands::Key { .. } => AppConfig::default(),
        _ => ConfigStore::load_from(cli.config.as_deref()).map_err(|e| anyhow!(e))?,
    };

    match cli.command {
        Commands::Scan {
            input,
            engine,
            window,
            overlap,
            threshold,
            max_suspects,
            llm_polish,
            intersect,
            no_preselect,
            rules,
            seeds,
            segmenter,
            text,
            out,
        } => {
            let mut config = config;
            let scan = &mut config.scan;
            if let Some(engine) = engine {
                scan.engine = ScanEngine::parse(&engine).ok_or_else(|| anyhow!("unknown engine '{}'", engine))?;
            }
            if let Some(w) = window {
                scan.window_size = w;
            }
            if let Some(o) = overlap {
                scan.overlap = o;
            }
            if let Some(t) = threshold {
                scan.similarity_threshold = t;
            }
            if let Some(m) = max_suspects {
                scan.max_suspects = m;
            }
            scan.llm_polish |= llm_polish;
            scan.preselect &= !no_preselect;
            if intersect {
                scan.combine = CombineMode::Intersect;
            }
            if let Some(rules) = rules {
                config.rules_path = Some(rules.display().to_string());
            }
            if let Some(seeds) = seeds {
                config.scan.seeds_path = Some(seeds.display().to_string());
            }
            if segmenter.is_some() {
                config.segmenter_url = segmenter;
            }

            let document = read_document(&input)?;
            let pipeline = build_pipeline(&config)?;
            let result = pipeline.scan_text(&document).await;

            if let Some(path) = &out {
                write_json(path, &result.report)?;
                info!("Wrote report: {}", path.display());
            }
            if text {
                print_summary(&result);
            } else if out.is_none() {
                println!("{}", serde_json::to_string_pretty(&result.report)?);
            }
        }

        Commands::Index {
            input,
            cache,
            max_tokens,
            overlap,
        } => {
            let chunks = collect_chunks(&input, max_tokens, overlap)?;
            if chunks.is_empty() {
                bail!("nothing to index in {}", input.display());
            }
            let retriever = build_retriever(&config);
            let index = PassageIndex::build(&retriever, chunks)
                .await
                .context("Failed to embed chunks")?;
            index.save(&cache).context("Failed to save index")?;
            println!("Indexed {} chunks -> {}", index.len(), cache.display());
        }

        Commands::Ask { query, cache, k, json } => {
            let index = PassageIndex::load(&cache).with_context(|| format!("Failed to load index {}", cache.display()))?;
            let retriever = build_retriever(&config);
            let chat = build_chat(&config);
            let answer = answer_query(chat.as_ref(), &retriever, &index, &query, k, config.scan.llm_timeout_secs).await?;
            if let Some(path) = &json {
                write_json(path, &answer)?;
            }
            println!("{}", answer.answer);
        }

        Commands::Explain {
            cache,
            kb,
            k_kb,
            kb_threshold,
            json,
        } => {
            let document = PassageIndex::load(&cache).with_context(|| format!("Failed to load index {}", cache.display()))?;
            let kb_index = PassageIndex::load(&kb).with_context(|| format!("Failed to load KB index {}", kb.display()))?;
            let retriever = build_retriever(&config);
            let chat = build_chat(&config);
            let settings = ExplainSettings {
                k_kb,
                kb_threshold,
                timeout_secs: config.scan.llm_timeout_secs,
                ..ExplainSettings::default()
            };

            let explanations = explain_clauses(chat.as_ref(), &retriever, &document, &kb_index, &settings).await?;
            if let Some(path) = &json {
                #[derive(Serialize)]
                #[serde(rename_all = "camelCase")]
                struct Output<'a> {
                    generated_at: String,
                    explanations: &'a [toscheck_lib::services::detection::Explanation],
                }
                write_json(
                    path,
                    &Output {
                        generated_at: chrono::Utc::now().to_rfc3339(),
                        explanations: &explanations,
                    },
                )?;
            }
            for e in &explanations {
                println!("## Clause {}\n\n{}\n", e.clause_idx, e.answer);
            }
        }

        Commands::Key { action } => {
            let store = ConfigStore::at(cli.config.as_deref()).context("No config directory available")?;
            match action {
                KeyAction::Set { provider, value } => {
                    store.set_api_key(&provider, value.trim()).map_err(|e| anyhow!(e))?;
                    println!("Stored key for {}", provider);
                }
                KeyAction::Show { provider } => match store.get_api_key(&provider).map_err(|e| anyhow!(e))? {
                    Some(key) => println!("{}: {}", provider, mask_key(&key)),
                    None => println!("{}: not set", provider),
                },
                KeyAction::Delete { provider } => {
                    store.delete_api_key(&provider).map_err(|e| anyhow!(e))?;
                    println!("Deleted key for {}", provider);
                }
            }
        }
    }

    Ok(())
}

fn mask_key(key: &str) -> String {
    let tail: String = key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    format!("****{}", tail)
}

fn read_document(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {} as UTF-8 text", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

fn build_chat(config: &AppConfig) -> Arc<dyn ChatModel> {
    Arc::new(ProviderClient::from_config(config))
}

fn build_retriever(config: &AppConfig) -> EmbeddingRetriever {
    let embedder: Arc<dyn Embedder> = Arc::new(ProviderClient::from_config(config));
    let cache = DiskEmbeddingCache::new(config.resolved_cache_dir().join("embeddings"));
    EmbeddingRetriever::new(embedder, Arc::new(cache))
}

fn build_pipeline(config: &AppConfig) -> Result<FlagPipeline> {
    let matcher = match config.rules_path.as_deref() {
        Some(path) => PatternMatcher::load(Path::new(path)).context("Failed to load category rules")?,
        None => PatternMatcher::builtin().clone(),
    };
    let seeds = match config.scan.seeds_path.as_deref() {
        Some(path) => SeedSet::load(Path::new(path)).map_err(|e| anyhow!(e))?,
        None => SeedSet::builtin(),
    };
    info!(
        "Rules version {} ({} categories), {} seeds",
        matcher.version(),
        matcher.category_names().len(),
        seeds.len()
    );

    Ok(FlagPipeline::new(config.scan.clone(), Arc::new(matcher))
        .with_seeds(seeds)
        .with_chat(build_chat(config))
        .with_retriever(Arc::new(build_retriever(config)))
        .with_segmenter_url(config.segmenter_url.clone()))
}

/// Chunks of one file, or labelled chunks of every text file in a directory.
fn collect_chunks(input: &Path, max_tokens: usize, overlap: usize) -> Result<Vec<String>> {
    if !input.is_dir() {
        let text = normalize_text(&read_document(input)?);
        return Ok(chunk_text(&text, max_tokens, overlap));
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(input)
        .with_context(|| format!("Failed to list {}", input.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("txt") | Some("md")
                )
        })
        .collect();
    files.sort();

    let mut chunks = Vec::new();
    for file in files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let text = normalize_text(&read_document(&file)?);
        chunks.extend(label_chunks(&name, chunk_text(&text, max_tokens, overlap)));
    }
    Ok(chunks)
}

fn print_summary(scan: &DocumentScan) {
    let report = &scan.report;
    println!(
        "Scan {} engine={} sentences={} windows={}{}",
        report.scan_id,
        report.engine.as_str(),
        report.sentence_count,
        report.window_count,
        if report.degraded { " (degraded)" } else { "" }
    );
    for source in &report.sources {
        println!(
            "  source {}: ok={} failed={}{}",
            source.detector,
            source.windows_ok,
            source.windows_failed,
            source
                .last_error
                .as_deref()
                .map(|e| format!(" last_error={}", e))
                .unwrap_or_default()
        );
    }
    println!();

    if report.flags.is_empty() {
        println!("No risky clauses flagged.");
        return;
    }
    for flag in &report.flags {
        println!("[{}] {}", flag.category, flag.rationale);
        for &i in &flag.sentence_indexes {
            if let Some(sentence) = usize::try_from(i).ok().and_then(|i| scan.sentences.get(i)) {
                println!("  {:>4}: {}", i, sentence);
            }
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_key_keeps_last_four() {
        assert_eq!(mask_key("sk-abcdef1234"), "****1234");
        assert_eq!(mask_key("ab"), "****ab");
    }

    #[test]
    fn test_key_set_parses_with_default_provider() {
        let cli = Cli::try_parse_from(["toscheck", "--config", "c.json", "key", "set", "--value", "sk-1"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some(Path::new("c.json")));
        match cli.command {
            Commands::Key {
                action: KeyAction::Set { provider, value },
            } => {
                assert_eq!(provider, "openai");
                assert_eq!(value, "sk-1");
            }
            _ => panic!("expected key set"),
        }
    }
}
