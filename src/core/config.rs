use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ColloquyConfig — file-based config loader (colloquy.json) with env-var
// fallback for every field.
// ---------------------------------------------------------------------------

pub const ENV_CONFIG: &str = "COLLOQUY_CONFIG";
pub const ENV_CHAT_URL: &str = "COLLOQUY_CHAT_URL";
pub const ENV_OUTPUT_DIR: &str = "COLLOQUY_OUTPUT_DIR";
pub const ENV_DATA_DIR: &str = "COLLOQUY_DATA_DIR";
pub const ENV_REPLY_TIMEOUT_SECS: &str = "COLLOQUY_REPLY_TIMEOUT_SECS";
pub const ENV_STOP_GRACE_MS: &str = "COLLOQUY_STOP_GRACE_MS";

/// Automation sub-config (mirrors the `automation` key in colloquy.json).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct AutomationSection {
    /// URL of the hosted chat application to drive.
    pub chat_url: Option<String>,
    /// Hard upper bound on waiting for one reply to finish generating.
    pub reply_timeout_secs: Option<u64>,
    /// Grace period between a stop request and surface teardown, letting an
    /// in-flight scrape hand its rows back.
    pub stop_grace_ms: Option<u64>,
}

impl AutomationSection {
    /// Chat URL: JSON field → `COLLOQUY_CHAT_URL` env var → `None`.
    /// There is no baked-in default; the CLI requires one of the three.
    pub fn resolve_chat_url(&self) -> Option<String> {
        if let Some(u) = &self.chat_url {
            if !u.trim().is_empty() {
                return Some(u.clone());
            }
        }
        std::env::var(ENV_CHAT_URL).ok().filter(|v| !v.trim().is_empty())
    }

    /// Reply timeout: JSON field → `COLLOQUY_REPLY_TIMEOUT_SECS` env → 180 s.
    pub fn resolve_reply_timeout(&self) -> Duration {
        let secs = self
            .reply_timeout_secs
            .or_else(|| std::env::var(ENV_REPLY_TIMEOUT_SECS).ok().and_then(|v| v.parse().ok()))
            .unwrap_or(180);
        Duration::from_secs(secs)
    }

    /// Stop grace period: JSON field → `COLLOQUY_STOP_GRACE_MS` env → 2000 ms.
    pub fn resolve_stop_grace(&self) -> Duration {
        let ms = self
            .stop_grace_ms
            .or_else(|| std::env::var(ENV_STOP_GRACE_MS).ok().and_then(|v| v.parse().ok()))
            .unwrap_or(2_000);
        Duration::from_millis(ms)
    }
}

/// Export sub-config.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct ExportSection {
    pub output_dir: Option<String>,
}

impl ExportSection {
    /// Output directory: JSON field → `COLLOQUY_OUTPUT_DIR` env var →
    /// platform download dir → `~/.colloquy/exports`.
    pub fn resolve_output_dir(&self) -> PathBuf {
        if let Some(d) = &self.output_dir {
            if !d.trim().is_empty() {
                return PathBuf::from(d);
            }
        }
        if let Ok(d) = std::env::var(ENV_OUTPUT_DIR) {
            if !d.trim().is_empty() {
                return PathBuf::from(d);
            }
        }
        if let Some(d) = dirs::download_dir() {
            return d;
        }
        fallback_export_dir()
    }

    /// Last-resort delivery directory for the plain-text export strategy.
    pub fn resolve_fallback_dir(&self) -> PathBuf {
        fallback_export_dir()
    }
}

fn fallback_export_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".colloquy")
        .join("exports")
}

/// Storage sub-config for the task registry's on-disk spill.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct StorageSection {
    pub data_dir: Option<String>,
}

impl StorageSection {
    /// Data directory: JSON field → `COLLOQUY_DATA_DIR` env var →
    /// `~/.colloquy/tasks`.
    pub fn resolve_data_dir(&self) -> PathBuf {
        if let Some(d) = &self.data_dir {
            if !d.trim().is_empty() {
                return PathBuf::from(d);
            }
        }
        if let Ok(d) = std::env::var(ENV_DATA_DIR) {
            if !d.trim().is_empty() {
                return PathBuf::from(d);
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".colloquy")
            .join("tasks")
    }
}

/// Top-level config loaded from `colloquy.json`.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct ColloquyConfig {
    #[serde(default)]
    pub automation: AutomationSection,
    #[serde(default)]
    pub export: ExportSection,
    #[serde(default)]
    pub storage: StorageSection,
    /// Host-page markup profile; every selector can be overridden per site.
    #[serde(default)]
    pub page: PageProfile,
}

/// Load `colloquy.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `COLLOQUY_CONFIG` env var path
/// 2. `./colloquy.json` (process cwd)
/// 3. `../colloquy.json` (one level up)
///
/// Missing file → `ColloquyConfig::default()` (silent, env-var fallbacks
/// apply). Parse error → log a warning, return the default.
pub fn load_config() -> ColloquyConfig {
    let mut candidates = vec![
        PathBuf::from("colloquy.json"),
        PathBuf::from("../colloquy.json"),
    ];
    if let Ok(env_path) = std::env::var(ENV_CONFIG) {
        candidates.insert(0, PathBuf::from(env_path));
    }

    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<ColloquyConfig>(&contents) {
                Ok(cfg) => {
                    tracing::info!("colloquy.json loaded from {}", path.display());
                    return cfg;
                }
                Err(e) => {
                    tracing::warn!(
                        "colloquy.json parse error at {}: {} — using defaults",
                        path.display(),
                        e
                    );
                    return ColloquyConfig::default();
                }
            },
            Err(_) => continue, // not found at this path — try next
        }
    }

    ColloquyConfig::default()
}

// ---------------------------------------------------------------------------
// PageProfile — the one place that knows the target site's markup.
//
// The batch driver never touches these selectors directly; only the CDP
// surface adapter reads them, so swapping the hosted chat app is a config
// change, not a code change.
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize, Clone, Debug)]
pub struct PageProfile {
    /// Ordered candidates for the chat input region (rich editor first).
    #[serde(default = "default_input_selectors")]
    pub input_selectors: Vec<String>,
    /// Container whose CSS class set encodes the send control's busy/idle
    /// state.
    #[serde(default = "default_send_control")]
    pub send_control: String,
    /// The clickable send button inside the control container.
    #[serde(default = "default_send_button")]
    pub send_button: String,
    /// Class present on the control while a reply is streaming.
    #[serde(default = "default_busy_class")]
    pub busy_class: String,
    /// Class present while the control refuses input.
    #[serde(default = "default_disabled_class")]
    pub disabled_class: String,
    /// One assistant reply bubble.
    #[serde(default = "default_answer_block")]
    pub answer_block: String,
    /// Markdown body inside a reply bubble (falls back to the whole bubble).
    #[serde(default = "default_answer_body")]
    pub answer_body: String,
    /// Container of cited-source links.
    #[serde(default = "default_sources_container")]
    pub sources_container: String,
    #[serde(default = "default_source_link")]
    pub source_link: String,
    #[serde(default = "default_source_title")]
    pub source_title: String,
    #[serde(default = "default_source_snippet")]
    pub source_snippet: String,
    #[serde(default = "default_source_site")]
    pub source_site: String,
    #[serde(default = "default_source_time")]
    pub source_time: String,
    /// Region that marks an answer as search-backed.
    #[serde(default = "default_search_region")]
    pub search_region: String,
    /// Tip text inside the search region.
    #[serde(default = "default_search_tip")]
    pub search_tip: String,
    /// Keywords that identify the tip text as a citation marker.
    #[serde(default = "default_search_tip_keywords")]
    pub search_tip_keywords: Vec<String>,
    /// Ordered candidates for the sidebar entry naming the current thread.
    #[serde(default = "default_sidebar_history")]
    pub sidebar_history: Vec<String>,
    /// Ordered candidates for the "new conversation" control.
    #[serde(default = "default_new_chat_buttons")]
    pub new_chat_buttons: Vec<String>,
    /// Ordered candidates for a control that reveals a collapsed sidebar.
    #[serde(default = "default_sidebar_toggles")]
    pub sidebar_toggles: Vec<String>,
    /// Elements whose presence indicates a fresh, empty thread.
    #[serde(default = "default_welcome_indicators")]
    pub welcome_indicators: Vec<String>,
    /// Selectors counted when checking whether a thread has any messages.
    #[serde(default = "default_message_blocks")]
    pub message_blocks: Vec<String>,
    /// Label used when no thread title can be scraped.
    #[serde(default = "default_label")]
    pub default_label: String,
}

impl Default for PageProfile {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty profile deserializes via field defaults")
    }
}

fn default_input_selectors() -> Vec<String> {
    [
        ".chat-input-editor[data-lexical-editor=\"true\"][contenteditable=\"true\"]",
        ".chat-input-editor[contenteditable=\"true\"]",
        "[data-lexical-editor=\"true\"][contenteditable=\"true\"]",
        ".chat-input-editor",
        "[contenteditable=\"true\"][role=\"textbox\"]",
    ]
    .map(String::from)
    .to_vec()
}

fn default_send_control() -> String {
    ".send-button-container".into()
}

fn default_send_button() -> String {
    ".send-button".into()
}

fn default_busy_class() -> String {
    "stop".into()
}

fn default_disabled_class() -> String {
    "disabled".into()
}

fn default_answer_block() -> String {
    ".segment-assistant".into()
}

fn default_answer_body() -> String {
    ".markdown-container .markdown".into()
}

fn default_sources_container() -> String {
    ".sites".into()
}

fn default_source_link() -> String {
    "a.site".into()
}

fn default_source_title() -> String {
    ".title".into()
}

fn default_source_snippet() -> String {
    ".snippet".into()
}

fn default_source_site() -> String {
    ".name".into()
}

fn default_source_time() -> String {
    ".date".into()
}

fn default_search_region() -> String {
    ".search-plus".into()
}

fn default_search_tip() -> String {
    ".search-plus .search-plus-tips".into()
}

fn default_search_tip_keywords() -> Vec<String> {
    ["search", "source", "reference", "搜索", "来源", "参考"]
        .map(String::from)
        .to_vec()
}

fn default_sidebar_history() -> Vec<String> {
    [
        ".sidebar-nav .history-part ul li:first-child a",
        ".history-part ul li:first-child a.chat-info-item",
        ".sidebar-nav .history-part ul li:first-child",
        ".history-part ul li:first-child",
        ".sidebar-nav ul li:first-child a",
        ".chat-info-item",
    ]
    .map(String::from)
    .to_vec()
}

fn default_new_chat_buttons() -> Vec<String> {
    [
        ".sidebar-nav .new-chat-btn",
        ".sidebar-nav a[href=\"/\"]",
        "a.new-chat-btn",
        ".new-chat-btn",
        "a[href=\"/\"]",
    ]
    .map(String::from)
    .to_vec()
}

fn default_sidebar_toggles() -> Vec<String> {
    [
        ".sidebar-toggle",
        ".menu-toggle",
        ".hamburger",
        ".nav-toggle",
        "[data-testid=\"sidebar-toggle\"]",
    ]
    .map(String::from)
    .to_vec()
}

fn default_welcome_indicators() -> Vec<String> {
    [
        ".welcome-message",
        ".chat-welcome",
        ".empty-chat",
        ".no-messages",
        ".chat-placeholder",
    ]
    .map(String::from)
    .to_vec()
}

fn default_message_blocks() -> Vec<String> {
    [".message", ".chat-message", ".segment-user", ".segment-assistant"]
        .map(String::from)
        .to_vec()
}

fn default_label() -> String {
    "untitled conversation".into()
}
