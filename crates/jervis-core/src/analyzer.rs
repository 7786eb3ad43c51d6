use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::git::{project_repo_dir, Git};
use crate::pipeline::SymbolExtractor;
use crate::types::{AnalysisItem, Symbol, SymbolType};

/// Per-language regex rules for the heuristic symbol pass. Not a real
/// CPG (§GLOSSARY) — a single-pass line scanner good enough to drive
/// the pipeline's routing and embedding stages off real source text.
struct LanguageRules {
    function_re: Regex,
    class_re: Regex,
    /// Block end is found by brace counting (C-like languages) rather
    /// than by indentation (Python).
    brace_based: bool,
}

fn language_for_extension(ext: &str) -> Option<(&'static str, &'static str)> {
    match ext {
        "rs" => Some(("rust", "rust")),
        "py" => Some(("python", "python")),
        "js" | "jsx" | "mjs" => Some(("javascript", "javascript")),
        "ts" | "tsx" => Some(("typescript", "typescript")),
        "go" => Some(("go", "go")),
        "java" => Some(("java", "java")),
        "kt" | "kts" => Some(("kotlin", "kotlin")),
        _ => None,
    }
}

fn rules_for(language: &str) -> Option<LanguageRules> {
    let (function_re, class_re, brace_based) = match language {
        "rust" => (
            r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?fn\s+([A-Za-z_][A-Za-z0-9_]*)",
            r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:struct|enum|trait|impl(?:<[^>]*>)?\s+(?:[A-Za-z_][A-Za-z0-9_]*\s+for\s+)?)\s*([A-Za-z_][A-Za-z0-9_]*)",
            true,
        ),
        "python" => (r"^\s*(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(", r"^\s*class\s+([A-Za-z_][A-Za-z0-9_]*)", false),
        "javascript" | "typescript" => (
            r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s+([A-Za-z_$][A-Za-z0-9_$]*)",
            r"^\s*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+([A-Za-z_$][A-Za-z0-9_$]*)",
            true,
        ),
        "go" => (
            r"^\s*func\s+(?:\([^)]*\)\s*)?([A-Za-z_][A-Za-z0-9_]*)\s*\(",
            r"^\s*type\s+([A-Za-z_][A-Za-z0-9_]*)\s+struct\b",
            true,
        ),
        "java" => (
            r"^\s*(?:public|private|protected)?\s*(?:static\s+)?(?:final\s+)?[A-Za-z_][A-Za-z0-9_<>\[\],\s]*\s+([A-Za-z_][A-Za-z0-9_]*)\s*\([^;{]*\)\s*\{",
            r"^\s*(?:public|private|protected)?\s*(?:abstract\s+|final\s+)?(?:class|interface)\s+([A-Za-z_][A-Za-z0-9_]*)",
            true,
        ),
        "kotlin" => (
            r"^\s*(?:public|private|protected|internal)?\s*(?:suspend\s+)?fun\s+([A-Za-z_][A-Za-z0-9_]*)",
            r"^\s*(?:public|private|protected|internal)?\s*(?:data\s+|sealed\s+|abstract\s+)?(?:class|interface|object)\s+([A-Za-z_][A-Za-z0-9_]*)",
            true,
        ),
        _ => return None,
    };
    Some(LanguageRules {
        function_re: Regex::new(function_re).ok()?,
        class_re: Regex::new(class_re).ok()?,
        brace_based,
    })
}

struct Span {
    name: String,
    start: usize,
    end: usize,
}

fn indent_of(line: &str) -> usize {
    line.chars().take_while(|c| *c == ' ' || *c == '\t').count()
}

/// From `start` (0-based, the line the definition header is on), finds the
/// last line index belonging to the same block.
fn block_end_brace(lines: &[&str], start: usize) -> usize {
    let mut depth = 0i32;
    let mut opened = false;
    for (i, line) in lines.iter().enumerate().skip(start) {
        for ch in line.chars() {
            match ch {
                '{' => {
                    depth += 1;
                    opened = true;
                }
                '}' => depth -= 1,
                _ => {}
            }
        }
        if opened && depth <= 0 {
            return i;
        }
    }
    lines.len().saturating_sub(1)
}

fn block_end_indent(lines: &[&str], start: usize) -> usize {
    let base_indent = indent_of(lines[start]);
    let mut end = start;
    for (i, line) in lines.iter().enumerate().skip(start + 1) {
        if line.trim().is_empty() {
            continue;
        }
        if indent_of(line) <= base_indent {
            break;
        }
        end = i;
    }
    end
}

fn find_spans(lines: &[&str], re: &Regex, brace_based: bool) -> Vec<Span> {
    let mut spans = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let Some(caps) = re.captures(line) else { continue };
        let Some(name) = caps.get(1) else { continue };
        let end = if brace_based { block_end_brace(lines, i) } else { block_end_indent(lines, i) };
        spans.push(Span { name: name.as_str().to_string(), start: i, end });
    }
    spans
}

/// Picks the innermost class span that contains `line`, if any.
fn enclosing_class<'a>(classes: &'a [Span], line: usize) -> Option<&'a Span> {
    classes
        .iter()
        .filter(|c| c.start < line && line <= c.end)
        .min_by_key(|c| c.end - c.start)
}

fn extract_symbols(language: &str, content: &str) -> Vec<Symbol> {
    let Some(rules) = rules_for(language) else { return Vec::new() };
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let classes = find_spans(&lines, &rules.class_re, rules.brace_based);
    let functions = find_spans(&lines, &rules.function_re, rules.brace_based);

    let mut symbols = Vec::with_capacity(classes.len() + functions.len());

    for class in &classes {
        let parent = enclosing_class(&classes, class.start).map(|c| c.name.clone());
        symbols.push(Symbol {
            symbol_type: SymbolType::Class,
            full_name: class.name.clone(),
            signature: Some(lines[class.start].trim().to_string()),
            line_start: class.start as u32 + 1,
            line_end: class.end as u32 + 1,
            node_id: format!("{language}:{}:{}", class.start, class.name),
            language: language.to_string(),
            code: Some(lines[class.start..=class.end].join("\n")),
            parent_class: parent,
        });
    }

    for function in &functions {
        // A function whose header line is itself a class header (e.g. a
        // Rust `impl` block matched by both regexes) is not a function.
        if classes.iter().any(|c| c.start == function.start) {
            continue;
        }
        let parent = enclosing_class(&classes, function.start).map(|c| c.name.clone());
        let symbol_type = if parent.is_some() { SymbolType::Method } else { SymbolType::Function };
        symbols.push(Symbol {
            symbol_type,
            full_name: function.name.clone(),
            signature: Some(lines[function.start].trim().to_string()),
            line_start: function.start as u32 + 1,
            line_end: function.end as u32 + 1,
            node_id: format!("{language}:{}:{}", function.start, function.name),
            language: language.to_string(),
            code: Some(lines[function.start..=function.end].join("\n")),
            parent_class: parent,
        });
    }

    symbols
}

/// Stage P1 (§4.4): walks a project's default branch via git plumbing
/// (`ls-tree`/`show`, never a checked-out working copy) and streams one
/// `AnalysisItem` per discovered symbol as each file is parsed — a single
/// pass per file, never materializing the whole project's symbol tree
/// before sending the first item.
pub struct GitSymbolExtractor {
    data_dir: String,
    worker_id: String,
}

impl GitSymbolExtractor {
    pub fn new(data_dir: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self { data_dir: data_dir.into(), worker_id: worker_id.into() }
    }
}

#[async_trait]
impl SymbolExtractor for GitSymbolExtractor {
    async fn discover(&self, project_id: i64, tx: mpsc::Sender<AnalysisItem>) -> Result<()> {
        let repo_dir = project_repo_dir(&self.data_dir, project_id);
        let worker_id = self.worker_id.clone();

        // Git subprocess calls are blocking; run the whole discovery pass
        // off the async executor and stream results back over a
        // synchronous channel bridged into the async `tx`.
        let (file_tx, mut file_rx) = tokio::sync::mpsc::channel::<(String, Vec<Symbol>)>(16);
        let blocking = tokio::task::spawn_blocking(move || -> Result<()> {
            let git = Git::new(repo_dir);
            let branch = git.default_branch().context("resolve default branch for discovery")?;
            let files = git.ls_files(&branch).context("list files for discovery")?;
            for path in files {
                let Some(ext) = path.rsplit('.').next() else { continue };
                let Some((lang_key, lang_label)) = language_for_extension(ext) else { continue };
                let content = match git.show_file(&branch, &path) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(path, error = %e, "discovery failed to read file, skipped");
                        continue;
                    }
                };
                let symbols = extract_symbols(lang_key, &content)
                    .into_iter()
                    .map(|mut s| {
                        s.language = lang_label.to_string();
                        s
                    })
                    .collect();
                if file_tx.blocking_send((path, symbols)).is_err() {
                    break;
                }
            }
            Ok(())
        });

        while let Some((file_path, symbols)) = file_rx.recv().await {
            for symbol in symbols {
                let item = AnalysisItem {
                    file_path: file_path.clone(),
                    symbol,
                    project_id,
                    worker_id: worker_id.clone(),
                    ts: Utc::now(),
                };
                if tx.send(item).await.is_err() {
                    return Ok(());
                }
            }
        }

        blocking.await.context("discovery task panicked")??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_rust_function_and_struct() {
        let content = "pub struct Foo {\n    x: i32,\n}\n\npub fn bar(x: i32) -> i32 {\n    x + 1\n}\n";
        let symbols = extract_symbols("rust", content);
        assert!(symbols.iter().any(|s| s.symbol_type == SymbolType::Class && s.full_name == "Foo"));
        let bar = symbols.iter().find(|s| s.full_name == "bar").unwrap();
        assert_eq!(bar.symbol_type, SymbolType::Function);
        assert!(bar.code.as_deref().unwrap().contains("x + 1"));
    }

    #[test]
    fn nests_python_method_under_its_class() {
        let content = "class Greeter:\n    def __init__(self, name):\n        self.name = name\n\n    def greet(self):\n        return f\"hi {self.name}\"\n";
        let symbols = extract_symbols("python", content);
        let greet = symbols.iter().find(|s| s.full_name == "greet").unwrap();
        assert_eq!(greet.symbol_type, SymbolType::Method);
        assert_eq!(greet.parent_class.as_deref(), Some("Greeter"));
    }

    #[test]
    fn top_level_python_function_has_no_parent() {
        let content = "def standalone():\n    return 1\n";
        let symbols = extract_symbols("python", content);
        let function = symbols.iter().find(|s| s.full_name == "standalone").unwrap();
        assert_eq!(function.symbol_type, SymbolType::Function);
        assert!(function.parent_class.is_none());
    }

    #[test]
    fn unsupported_extension_yields_no_symbols() {
        assert!(language_for_extension("txt").is_none());
    }

    #[test]
    fn typescript_class_and_method_like_function_are_found() {
        let content = "export class Widget {\n  render() {\n    return 1\n  }\n}\n\nexport function helper() {\n  return 2\n}\n";
        let symbols = extract_symbols("typescript", content);
        assert!(symbols.iter().any(|s| s.full_name == "Widget" && s.symbol_type == SymbolType::Class));
        assert!(symbols.iter().any(|s| s.full_name == "helper" && s.symbol_type == SymbolType::Function));
    }
}
