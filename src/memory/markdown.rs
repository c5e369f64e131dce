//! File-backed markdown memory engine.
//!
//! The semantic search engine proper is an external collaborator; this is
//! the built-in fallback wired at boot when none is configured. Retained
//! turns land in daily conversation logs as timestamped sections, important
//! facts are deduplicated into `MEMORY.md`, and recall is token-overlap
//! scoring over stored sections.

use crate::envelope::MemorySnippet;
use crate::memory::signal::SensitiveDetector;
use crate::memory::{CONTEXT_SEPARATOR, MemoryEngine, RecallResult, ReflectReceipt, RetainReceipt};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Local;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const TOP_K: usize = 5;
const MEMORY_FILE_HEADER: &str = "# 메모리\n\n영구 사실과 선호도가 기록됩니다.\n\n";

pub struct MarkdownMemoryEngine {
    memory_dir: PathBuf,
    detector: SensitiveDetector,
}

impl MarkdownMemoryEngine {
    pub fn new(memory_dir: PathBuf, detector: SensitiveDetector) -> Result<Self> {
        std::fs::create_dir_all(memory_dir.join("conversations"))?;
        let memory_md = memory_dir.join("MEMORY.md");
        if !memory_md.exists() {
            std::fs::write(&memory_md, MEMORY_FILE_HEADER)?;
        }
        Ok(Self {
            memory_dir,
            detector,
        })
    }

    fn daily_log_path(&self) -> PathBuf {
        self.memory_dir
            .join("conversations")
            .join(format!("{}.md", Local::now().format("%Y-%m-%d")))
    }

    fn append_section(&self, path: &Path, content: &str, role: &str, bank_id: &str) -> Result<()> {
        let now = Local::now();
        let bank_part = if bank_id.is_empty() {
            String::new()
        } else {
            format!(" bank:{}", bank_id)
        };
        let section = format!("\n## {} [{}]{}\n{}\n", now.format("%H:%M:%S"), role, bank_part, content);

        if path.exists() {
            let mut existing = std::fs::read_to_string(path)?;
            existing.push_str(&section);
            std::fs::write(path, existing)?;
        } else {
            let header = format!("# {} 대화\n", now.format("%Y-%m-%d"));
            std::fs::write(path, format!("{}{}", header, section))?;
        }
        Ok(())
    }

    fn append_fact(&self, fact: &str, source: &str) -> Result<bool> {
        let path = self.memory_dir.join("MEMORY.md");
        let existing = std::fs::read_to_string(&path).unwrap_or_default();
        if existing.contains(fact) {
            debug!(fact = %fact.chars().take(50).collect::<String>(), "fact already recorded");
            return Ok(false);
        }
        let source_part = if source.is_empty() {
            String::new()
        } else {
            format!(" (from: {})", source)
        };
        let line = format!("- [{}] {}{}\n", Local::now().format("%Y-%m-%d"), fact, source_part);
        std::fs::write(&path, format!("{}{}", existing, line))?;
        Ok(true)
    }

    /// All candidate snippets: conversation sections (bank-filtered when a
    /// bank is given) plus MEMORY.md fact lines.
    fn snippets(&self, bank_id: &str) -> Vec<(String, String)> {
        let mut out = Vec::new();

        let conversations = self.memory_dir.join("conversations");
        if let Ok(entries) = std::fs::read_dir(&conversations) {
            let mut files: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
            files.sort();
            for file in files {
                let Ok(content) = std::fs::read_to_string(&file) else {
                    continue;
                };
                let source = file.display().to_string();
                for section in content.split("\n## ").skip(1) {
                    let bank_match =
                        bank_id.is_empty() || section.lines().next().is_some_and(|h| h.contains(&format!("bank:{}", bank_id)));
                    if !bank_match {
                        continue;
                    }
                    let body: String = section.lines().skip(1).collect::<Vec<_>>().join("\n");
                    if !body.trim().is_empty() {
                        out.push((body.trim().to_string(), source.clone()));
                    }
                }
            }
        }

        let memory_md = self.memory_dir.join("MEMORY.md");
        if let Ok(content) = std::fs::read_to_string(&memory_md) {
            for line in content.lines().filter(|l| l.starts_with("- ")) {
                out.push((line.trim_start_matches("- ").to_string(), memory_md.display().to_string()));
            }
        }
        out
    }
}

/// Fraction of query tokens found in the snippet (substring match, so
/// Korean particles don't break recall).
fn overlap_score(query: &str, snippet: &str) -> f64 {
    let tokens: Vec<String> = query
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| c.is_ascii_punctuation() || c == '?').to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return 0.0;
    }
    let snippet_lower = snippet.to_lowercase();
    let hits = tokens.iter().filter(|t| snippet_lower.contains(t.as_str())).count();
    hits as f64 / tokens.len() as f64
}

#[async_trait]
impl MemoryEngine for MarkdownMemoryEngine {
    async fn retain(&self, text: &str, context: &str, bank_id: &str) -> Result<RetainReceipt> {
        let role = match context {
            "user" | "assistant" | "system" => context,
            _ => "user",
        };
        let log_path = self.daily_log_path();
        self.append_section(&log_path, text, role, bank_id)?;

        let facts = self.detector.detect_important_facts(text);
        let mut facts_detected = 0;
        for fact in &facts {
            if self.append_fact(fact, bank_id)? {
                facts_detected += 1;
            }
        }

        info!(bank_id, content_len = text.len(), facts_detected, "memory retained");
        Ok(RetainReceipt {
            status: "retained".into(),
            bank_id: bank_id.to_string(),
            content_length: text.len(),
            facts_detected,
            log_path: Some(log_path.display().to_string()),
        })
    }

    async fn recall(&self, query: &str, bank_id: &str) -> Result<RecallResult> {
        let mut scored: Vec<(f64, String, String)> = self
            .snippets(bank_id)
            .into_iter()
            .map(|(content, source)| (overlap_score(query, &content), content, source))
            .filter(|(score, _, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(TOP_K);

        let memories: Vec<MemorySnippet> = scored
            .into_iter()
            .map(|(score, content, source)| MemorySnippet {
                content,
                score,
                source,
            })
            .collect();
        let context = memories
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(CONTEXT_SEPARATOR);

        Ok(RecallResult {
            context,
            memories,
            query: query.to_string(),
            bank_id: bank_id.to_string(),
        })
    }

    async fn reflect(&self, bank_id: &str) -> Result<ReflectReceipt> {
        let indexed_files = std::fs::read_dir(self.memory_dir.join("conversations"))
            .map(|entries| entries.flatten().count())
            .unwrap_or(0);
        Ok(ReflectReceipt {
            status: "ok".into(),
            bank_id: bank_id.to_string(),
            indexed_files,
        })
    }

    async fn health_check(&self) -> bool {
        self.memory_dir.exists()
    }
}
