use serde::Serialize;
use toscheck_lib::services::sentence_segmenter::{segment_document, SegmenterBackend};
use toscheck_lib::services::text_processor::normalize_text;

fn preview(s: &str, max_chars: usize) -> String {
    let mut out: String = s.chars().take(max_chars).collect();
    if s.chars().count() > max_chars {
        out.push_str("...");
    }
    out.replace('\n', " ")
}

fn parse_arg_value(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!(
            "Usage:\n  cargo run --bin segment_text -- <path.txt> [--segmenter <url>] [--sentences <n>] [--out <json_path>]\n\nNotes:\n  - Without --segmenter (or TOSCHECK_SEGMENTER_URL) the lexical splitter is used."
        );
        return Ok(());
    }

    let path = args[1].clone();
    let segmenter = parse_arg_value(&args, "--segmenter")
        .or_else(|| std::env::var("TOSCHECK_SEGMENTER_URL").ok())
        .filter(|u| !u.trim().is_empty());
    let sentences_n: usize = parse_arg_value(&args, "--sentences")
        .and_then(|s| s.parse().ok())
        .unwrap_or(50);
    let out_path = parse_arg_value(&args, "--out");

    let raw = std::fs::read_to_string(&path).map_err(|e| format!("read file failed: {}", e))?;
    let text = normalize_text(&raw);
    let (sentences, backend) = segment_document(&text, segmenter.as_deref()).await;

    println!("File: {}", path);
    println!("Text: {} chars ({} bytes)", text.chars().count(), text.len());
    println!(
        "Segmenter: {}",
        match backend {
            SegmenterBackend::Service => segmenter.clone().unwrap_or_default(),
            SegmenterBackend::Lexical => "lexical".to_string(),
        }
    );
    println!();

    println!("Sentences: {}", sentences.len());
    for (i, s) in sentences.iter().take(sentences_n).enumerate() {
        println!("[S{:04}] chars={}  {}", i, s.chars().count(), preview(s, 120));
    }
    if sentences.len() > sentences_n {
        println!("... ({} more sentences)", sentences.len() - sentences_n);
    }

    if let Some(out_path) = out_path {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Output {
            file: String,
            backend: String,
            chars: usize,
            sentences: Vec<String>,
        }

        let out = Output {
            file: path.clone(),
            backend: format!("{:?}", backend).to_lowercase(),
            chars: text.chars().count(),
            sentences,
        };

        let json = serde_json::to_string_pretty(&out).map_err(|e| e.to_string())?;
        std::fs::write(&out_path, json).map_err(|e| format!("write out failed: {}", e))?;
        println!();
        println!("Wrote JSON: {}", out_path);
    }

    Ok(())
}
