use anyhow::Result;
use std::collections::HashMap;

/// One candidate in the LLM gateway's ordered fallback list (C9).
#[derive(Debug, Clone)]
pub struct LlmCandidate {
    pub name: String,
    pub base_url: String,
    pub context_window: u32,
    /// "ollama" or "openai" — selects the request/response shape C9 speaks.
    pub api_kind: String,
}

/// Per-`ConnectionKind` poller tuning (C4).
#[derive(Debug, Clone, Copy)]
pub struct PollerTuning {
    pub polling_interval_ms: u64,
    pub initial_delay_ms: u64,
    pub cycle_delay_ms: u64,
}

/// Full application configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,
    pub sqlite_path: String,

    // C4 poller tuning, one per connection kind.
    pub git_poller: PollerTuning,
    pub issue_tracker_poller: PollerTuning,
    pub wiki_poller: PollerTuning,
    pub mail_poller: PollerTuning,
    pub chat_poller: PollerTuning,

    // C6 indexing pipeline.
    pub pipeline_channel_capacity: usize,
    pub pipeline_storage_workers: usize,
    pub pipeline_tick_s: u64,

    // HTTP timeouts (§5).
    pub http_connect_timeout_s: u64,
    pub http_socket_timeout_s: u64,

    // Git subprocess timeouts.
    pub git_clone_timeout_s: u64,
    pub git_log_timeout_s: u64,

    // C9 LLM Gateway candidate list, tried in order.
    pub llm_candidates: Vec<LlmCandidate>,

    // C8 Vector Store Gateway.
    pub vector_store_base_url: String,
    pub vector_store_api_key: String,

    // C9 Embedding Gateway, one model per ModelType.
    pub code_embedding_model: String,
    pub code_embedding_base_url: String,
    pub text_embedding_model: String,
    pub text_embedding_base_url: String,

    // C3 Durable Work Queue.
    pub queue_lease_timeout_s: i64,
    pub queue_max_attempts: i64,

    // C12 User-Dialog Coordinator.
    pub dialog_timeout_s: u64,

    // C10 tool registry toggles: which tools the plan executor may dispatch.
    pub tools_enabled: HashMap<String, bool>,

    // HTTP surface (§6).
    pub web_bind: String,
    pub web_port: u16,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_usize(key: &str, dotenv: &HashMap<String, String>, default: usize) -> usize {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn poller_tuning(
    prefix: &str,
    dotenv: &HashMap<String, String>,
    default_polling_ms: u64,
) -> PollerTuning {
    PollerTuning {
        polling_interval_ms: get_u64(&format!("{prefix}_POLL_INTERVAL_MS"), dotenv, default_polling_ms),
        initial_delay_ms: get_u64(&format!("{prefix}_POLL_INITIAL_DELAY_MS"), dotenv, 5_000),
        cycle_delay_ms: get_u64(&format!("{prefix}_POLL_CYCLE_DELAY_MS"), dotenv, 10_000),
    }
}

/// `NAME:BASE_URL:CONTEXT_WINDOW:API_KIND|NAME:...` — order is fallback order.
fn parse_llm_candidates(raw: &str) -> Vec<LlmCandidate> {
    let mut out = Vec::new();
    for entry in raw.split('|') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let parts: Vec<&str> = entry.splitn(4, ':').collect();
        if parts.len() < 2 {
            continue;
        }
        out.push(LlmCandidate {
            name: parts[0].to_string(),
            base_url: parts[1].to_string(),
            context_window: parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(8_192),
            api_kind: parts.get(3).copied().unwrap_or("openai").to_string(),
        });
    }
    out
}

fn parse_tool_toggles(raw: &str) -> HashMap<String, bool> {
    let mut map = HashMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some(name) = entry.strip_prefix('-') {
            map.insert(name.to_string(), false);
        } else {
            map.insert(entry.to_string(), true);
        }
    }
    map
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        let data_dir = get_str("DATA_DIR", &dotenv, "store");
        let default_sqlite = format!("{data_dir}/jervis.db");
        let sqlite_path = get_str("SQLITE_PATH", &dotenv, &default_sqlite);

        let default_candidates =
            "local:http://127.0.0.1:11434:8192:ollama|gpt-4o-mini:https://api.openai.com/v1:128000:openai";
        let llm_candidates = parse_llm_candidates(&get_str(
            "LLM_CANDIDATES",
            &dotenv,
            default_candidates,
        ));

        let default_tools = "search_knowledge_base,search_git_log,ask_user";
        let tools_enabled = parse_tool_toggles(&get_str("TOOLS_ENABLED", &dotenv, default_tools));

        Ok(Config {
            data_dir,
            sqlite_path,
            git_poller: poller_tuning("GIT", &dotenv, 5 * 60_000),
            issue_tracker_poller: poller_tuning("ISSUE_TRACKER", &dotenv, 2 * 60_000),
            wiki_poller: poller_tuning("WIKI", &dotenv, 10 * 60_000),
            mail_poller: poller_tuning("MAIL", &dotenv, 60_000),
            chat_poller: poller_tuning("CHAT", &dotenv, 30_000),
            pipeline_channel_capacity: get_usize("PIPELINE_CHANNEL_CAPACITY", &dotenv, 100),
            pipeline_storage_workers: get_usize("PIPELINE_STORAGE_WORKERS", &dotenv, 4),
            pipeline_tick_s: get_u64("PIPELINE_TICK_S", &dotenv, 30),
            http_connect_timeout_s: get_u64("HTTP_CONNECT_TIMEOUT_S", &dotenv, 30),
            http_socket_timeout_s: get_u64("HTTP_SOCKET_TIMEOUT_S", &dotenv, 300),
            git_clone_timeout_s: get_u64("GIT_CLONE_TIMEOUT_S", &dotenv, 600),
            git_log_timeout_s: get_u64("GIT_LOG_TIMEOUT_S", &dotenv, 30),
            llm_candidates,
            vector_store_base_url: get_str("VECTOR_STORE_BASE_URL", &dotenv, "http://127.0.0.1:6333"),
            vector_store_api_key: get_str("VECTOR_STORE_API_KEY", &dotenv, ""),
            code_embedding_model: get_str("CODE_EMBEDDING_MODEL", &dotenv, "nomic-embed-text"),
            code_embedding_base_url: get_str("CODE_EMBEDDING_BASE_URL", &dotenv, "http://127.0.0.1:11434/v1"),
            text_embedding_model: get_str("TEXT_EMBEDDING_MODEL", &dotenv, "nomic-embed-text"),
            text_embedding_base_url: get_str("TEXT_EMBEDDING_BASE_URL", &dotenv, "http://127.0.0.1:11434/v1"),
            queue_lease_timeout_s: get_i64("QUEUE_LEASE_TIMEOUT_S", &dotenv, 600),
            queue_max_attempts: get_i64("QUEUE_MAX_ATTEMPTS", &dotenv, 5),
            dialog_timeout_s: get_u64("DIALOG_TIMEOUT_S", &dotenv, 15 * 60),
            tools_enabled,
            web_bind: get_str("WEB_BIND", &dotenv, "127.0.0.1"),
            web_port: get_u16("WEB_PORT", &dotenv, 3131),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_llm_candidates_in_order() {
        let candidates = parse_llm_candidates("a:http://a:4096:ollama|b:http://b:8192:openai");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].name, "a");
        assert_eq!(candidates[0].context_window, 4096);
        assert_eq!(candidates[1].api_kind, "openai");
    }

    #[test]
    fn tool_toggles_support_negation() {
        let toggles = parse_tool_toggles("search_knowledge_base,-post_chat_message");
        assert_eq!(toggles.get("search_knowledge_base"), Some(&true));
        assert_eq!(toggles.get("post_chat_message"), Some(&false));
    }

    #[test]
    fn defaults_apply_without_env_or_dotenv() {
        let dotenv = HashMap::new();
        let tuning = poller_tuning("GIT", &dotenv, 300_000);
        assert_eq!(tuning.polling_interval_ms, 300_000);
        assert_eq!(tuning.cycle_delay_ms, 10_000);
    }
}
