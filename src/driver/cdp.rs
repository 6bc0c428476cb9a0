//! CDP adapter: implements [`ChatSurface`] over a live chromiumoxide page.
//!
//! This is the only module that touches the host page's markup, and it does
//! so exclusively through the configured [`PageProfile`] selectors. All DOM
//! work runs as injected JavaScript; captured HTML fragments are handed to
//! the pure extraction functions in [`collect`](super::collect).

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Page;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::collect;
use super::surface::{
    control_state_from_classes, ChatSurface, ControlState, InputStatus, SurfaceError,
    ThreadIndicators,
};
use crate::core::config::PageProfile;
use crate::core::types::ResultRow;
use crate::relay::Event;

/// Cadence of the character-by-character typing fallback.
const TYPING_CHAR_DELAY: Duration = Duration::from_millis(50);
/// Wait for the source panel to start loading after a search-backed answer.
const SOURCES_LOAD_WAIT: Duration = Duration::from_secs(3);
/// Source-container poll budget.
const SOURCES_POLL_ATTEMPTS: u32 = 10;
const SOURCES_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Settle once the container exists, before parsing it.
const SOURCES_SETTLE: Duration = Duration::from_secs(1);
/// Wait for the thread title to be generated when no sources are cited.
const LABEL_GENERATION_WAIT: Duration = Duration::from_secs(5);
/// Sidebar label retry ladder.
const LABEL_RETRIES: u32 = 3;
const LABEL_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Wait after revealing a collapsed sidebar.
const SIDEBAR_REVEAL_WAIT: Duration = Duration::from_secs(1);

const DOM_REVISION_OBSERVER: &str = r#"
(() => {
    if (window.__colloquyDomRev !== undefined) return true;
    window.__colloquyDomRev = 0;
    const target = document.body || document.documentElement;
    new MutationObserver(() => { window.__colloquyDomRev += 1; })
        .observe(target, { childList: true, subtree: true, attributes: true, attributeFilter: ['class'] });
    return true;
})()
"#;

pub struct CdpSurface {
    page: Page,
    profile: PageProfile,
    events: Option<broadcast::Sender<Event>>,
}

impl CdpSurface {
    /// Wrap an already-navigated page and install the mutation-revision
    /// observer used as the polling wakeup hint.
    pub async fn attach(
        page: Page,
        profile: PageProfile,
        events: Option<broadcast::Sender<Event>>,
    ) -> Result<Self, SurfaceError> {
        let surface = Self { page, profile, events };
        surface.eval::<bool>(DOM_REVISION_OBSERVER.to_string()).await?;
        Ok(surface)
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    async fn eval<T: DeserializeOwned>(&self, js: String) -> Result<T, SurfaceError> {
        let result = self
            .page
            .evaluate(js)
            .await
            .map_err(|e| SurfaceError::Eval(e.to_string()))?;
        result
            .into_value::<T>()
            .map_err(|e| SurfaceError::Eval(e.to_string()))
    }

    fn json(value: &impl serde::Serialize) -> String {
        serde_json::to_string(value).expect("selector/config strings serialize")
    }

    /// `let el = …first match of the configured input selectors…`
    fn pick_input_js(&self) -> String {
        format!(
            r#"
            let el = null;
            for (const s of {sels}) {{
                try {{ el = document.querySelector(s); }} catch (e) {{ el = null; }}
                if (el) break;
            }}"#,
            sels = Self::json(&self.profile.input_selectors)
        )
    }

    /// One attempt at reading the thread title from the sidebar history.
    async fn probe_label(&self) -> Result<Option<String>, SurfaceError> {
        let js = format!(
            r#"
            (() => {{
                for (const s of {sels}) {{
                    try {{
                        const el = document.querySelector(s);
                        if (el && el.textContent && el.textContent.trim()) {{
                            return el.textContent.trim();
                        }}
                    }} catch (e) {{}}
                }}
                return null;
            }})()
            "#,
            sels = Self::json(&self.profile.sidebar_history)
        );
        self.eval::<Option<String>>(js).await
    }

    /// Full label ladder: sidebar → retries (the sidebar may still be
    /// loading) → page title → configured default.
    async fn fetch_label(&self, retry: bool) -> String {
        match self.probe_label().await {
            Ok(Some(label)) => return label,
            Ok(None) => {}
            Err(e) => warn!("cdp: label probe failed: {e}"),
        }

        if retry {
            for attempt in 1..=LABEL_RETRIES {
                tokio::time::sleep(LABEL_RETRY_DELAY).await;
                debug!("cdp: retrying thread label ({attempt}/{LABEL_RETRIES})");
                if let Ok(Some(label)) = self.probe_label().await {
                    return label;
                }
            }
        }

        if let Ok(Some(title)) = self
            .eval::<Option<String>>(
                "(() => { const t = document.title; return t && t.trim() ? t.trim() : null; })()"
                    .to_string(),
            )
            .await
        {
            return title;
        }

        self.profile.default_label.clone()
    }

    /// Poll for the cited-sources container and return its HTML when it
    /// appears within the budget.
    async fn await_sources_container(&self) -> Option<String> {
        let js = format!(
            r#"
            (() => {{
                const c = document.querySelector({sel});
                return c ? c.outerHTML : null;
            }})()
            "#,
            sel = Self::json(&self.profile.sources_container)
        );
        for attempt in 0..SOURCES_POLL_ATTEMPTS {
            match self.eval::<Option<String>>(js.clone()).await {
                Ok(Some(html)) => return Some(html),
                Ok(None) => {
                    debug!(
                        "cdp: waiting for sources container ({}/{})",
                        attempt + 1,
                        SOURCES_POLL_ATTEMPTS
                    );
                }
                Err(e) => warn!("cdp: sources container probe failed: {e}"),
            }
            tokio::time::sleep(SOURCES_POLL_INTERVAL).await;
        }
        None
    }

    fn send_source_progress(&self, current: usize, total: usize) {
        if let Some(events) = &self.events {
            let _ = events.send(Event::SourceProgress { current, total });
        }
    }
}

#[async_trait]
impl ChatSurface for CdpSurface {
    async fn input_status(&self) -> Result<InputStatus, SurfaceError> {
        let js = format!(
            r#"
            (() => {{
                {pick}
                if (!el) return 'missing';
                const hidden = el.style.display === 'none' || el.offsetParent === null;
                return hidden ? 'hidden' : 'ready';
            }})()
            "#,
            pick = self.pick_input_js()
        );
        match self.eval::<String>(js).await?.as_str() {
            "ready" => Ok(InputStatus::Ready),
            "hidden" => Ok(InputStatus::Hidden),
            _ => Ok(InputStatus::Missing),
        }
    }

    async fn fill_input(&self, text: &str) -> Result<bool, SurfaceError> {
        let js = format!(
            r#"
            (() => {{
                {pick}
                if (!el) return 'missing';
                const text = {text};
                el.focus();
                const selection = window.getSelection();
                const range = document.createRange();
                range.selectNodeContents(el);
                selection.removeAllRanges();
                selection.addRange(range);

                let applied = false;
                if (document.execCommand) {{
                    try {{ applied = document.execCommand('insertText', false, text); }} catch (e) {{}}
                }}
                if (!applied) {{
                    el.innerHTML = '';
                    const p = document.createElement('p');
                    p.textContent = text;
                    el.appendChild(p);
                    const caret = document.createRange();
                    caret.setStart(p, p.childNodes.length);
                    caret.collapse(true);
                    selection.removeAllRanges();
                    selection.addRange(caret);
                }}
                el.dispatchEvent(new Event('input', {{ bubbles: true, cancelable: true }}));
                el.dispatchEvent(new Event('change', {{ bubbles: true, cancelable: true }}));

                const current = el.textContent || '';
                const prefix = text.slice(0, Math.min(10, text.length));
                return current.includes(prefix) ? 'verified' : 'unverified';
            }})()
            "#,
            pick = self.pick_input_js(),
            text = Self::json(&text)
        );
        match self.eval::<String>(js).await?.as_str() {
            "verified" => Ok(true),
            "unverified" => Ok(false),
            _ => Err(SurfaceError::Missing("chat input region")),
        }
    }

    async fn type_input(&self, text: &str, token: &CancellationToken) -> Result<(), SurfaceError> {
        debug!("cdp: simulated typing of {} character(s)", text.chars().count());
        let mut first = true;
        for ch in text.chars() {
            if token.is_cancelled() {
                debug!("cdp: stop signal during simulated typing");
                return Ok(());
            }
            let js = format!(
                r#"
                (() => {{
                    {pick}
                    if (!el) return false;
                    if ({first}) {{
                        el.focus();
                        el.innerHTML = '';
                    }}
                    let p = el.querySelector('p');
                    if (!p) {{
                        p = document.createElement('p');
                        el.appendChild(p);
                    }}
                    const ch = {ch};
                    p.textContent = (p.textContent || '') + ch;
                    el.dispatchEvent(new InputEvent('input', {{
                        bubbles: true, cancelable: true, data: ch, inputType: 'insertText'
                    }}));
                    return true;
                }})()
                "#,
                pick = self.pick_input_js(),
                first = first,
                ch = Self::json(&ch.to_string())
            );
            if !self.eval::<bool>(js).await? {
                return Err(SurfaceError::Missing("chat input region"));
            }
            first = false;
            tokio::time::sleep(TYPING_CHAR_DELAY).await;
        }
        Ok(())
    }

    async fn press_enter(&self) -> Result<(), SurfaceError> {
        let js = format!(
            r#"
            (() => {{
                {pick}
                if (!el) return false;
                el.focus();
                for (const type of ['keydown', 'keyup']) {{
                    el.dispatchEvent(new KeyboardEvent(type, {{
                        key: 'Enter', code: 'Enter', keyCode: 13, which: 13,
                        bubbles: true, cancelable: true
                    }}));
                }}
                return true;
            }})()
            "#,
            pick = self.pick_input_js()
        );
        if self.eval::<bool>(js).await? {
            Ok(())
        } else {
            Err(SurfaceError::Missing("chat input region"))
        }
    }

    async fn click_send(&self) -> Result<(), SurfaceError> {
        let js = format!(
            r#"
            (() => {{
                const container = document.querySelector({control});
                if (!container) return false;
                const button = container.querySelector({button});
                if (!button) return false;
                button.click();
                return true;
            }})()
            "#,
            control = Self::json(&self.profile.send_control),
            button = Self::json(&self.profile.send_button)
        );
        if self.eval::<bool>(js).await? {
            Ok(())
        } else {
            Err(SurfaceError::Missing("send control"))
        }
    }

    async fn control_state(&self) -> Result<ControlState, SurfaceError> {
        let js = format!(
            r#"
            (() => {{
                const c = document.querySelector({sel});
                return c ? (c.className || '') : null;
            }})()
            "#,
            sel = Self::json(&self.profile.send_control)
        );
        Ok(match self.eval::<Option<String>>(js).await? {
            Some(classes) => control_state_from_classes(
                &classes,
                &self.profile.disabled_class,
                &self.profile.busy_class,
            ),
            None => ControlState::Unknown,
        })
    }

    async fn dom_revision(&self) -> u64 {
        self.eval::<u64>(
            "(() => window.__colloquyDomRev === undefined ? 0 : window.__colloquyDomRev)()"
                .to_string(),
        )
        .await
        .unwrap_or(0)
    }

    async fn collect_exchange(&self, question: &str) -> Result<Vec<ResultRow>, SurfaceError> {
        let block_js = format!(
            r#"
            (() => {{
                const blocks = document.querySelectorAll({sel});
                if (!blocks.length) return null;
                return blocks[blocks.length - 1].outerHTML;
            }})()
            "#,
            sel = Self::json(&self.profile.answer_block)
        );
        let block_html = self
            .eval::<Option<String>>(block_js)
            .await?
            .ok_or(SurfaceError::Missing("assistant reply block"))?;

        let answer = collect::answer_text(&block_html, &self.profile);
        debug!("cdp: answer extracted ({} chars)", answer.chars().count());

        if collect::has_source_citations(&block_html, &self.profile) {
            debug!("cdp: answer cites sources; waiting for the source panel");
            tokio::time::sleep(SOURCES_LOAD_WAIT).await;

            let sources = match self.await_sources_container().await {
                Some(container_html) => {
                    tokio::time::sleep(SOURCES_SETTLE).await;
                    let sources = collect::parse_sources(&container_html, &self.profile);
                    self.send_source_progress(0, sources.len());
                    self.send_source_progress(sources.len(), sources.len());
                    sources
                }
                None => {
                    warn!("cdp: citation marker present but the source panel never appeared");
                    Vec::new()
                }
            };

            let label = self.fetch_label(true).await;
            return Ok(collect::compose_rows(question, &answer, &label, &sources));
        }

        // No sources: give the host a moment to generate the thread title.
        tokio::time::sleep(LABEL_GENERATION_WAIT).await;
        let label = self.fetch_label(false).await;
        Ok(collect::compose_rows(question, &answer, &label, &[]))
    }

    async fn conversation_label(&self) -> String {
        self.fetch_label(false).await
    }

    async fn reset_thread_shortcut(&self) -> Result<(), SurfaceError> {
        let js = r#"
            (() => {
                window.focus();
                for (const target of [document, document.body, document.documentElement]) {
                    if (!target) continue;
                    for (const type of ['keydown', 'keyup']) {
                        target.dispatchEvent(new KeyboardEvent(type, {
                            key: 'k', code: 'KeyK', keyCode: 75, which: 75,
                            ctrlKey: true, bubbles: true, cancelable: true
                        }));
                    }
                }
                return true;
            })()
        "#;
        self.eval::<bool>(js.to_string()).await.map(|_| ())
    }

    async fn reset_thread_click(&self) -> Result<(), SurfaceError> {
        let probe_js = format!(
            r#"
            (() => {{
                for (const s of {sels}) {{
                    try {{
                        const el = document.querySelector(s);
                        if (el) return {{ found: true, visible: el.offsetParent !== null }};
                    }} catch (e) {{}}
                }}
                return {{ found: false, visible: false }};
            }})()
            "#,
            sels = Self::json(&self.profile.new_chat_buttons)
        );

        #[derive(serde::Deserialize)]
        struct Probe {
            found: bool,
            visible: bool,
        }
        let probe: Probe = self.eval(probe_js).await?;
        if !probe.found {
            return Err(SurfaceError::Missing("new conversation control"));
        }

        if !probe.visible {
            debug!("cdp: new conversation control hidden; revealing the sidebar");
            let toggle_js = format!(
                r#"
                (() => {{
                    for (const s of {sels}) {{
                        try {{
                            const el = document.querySelector(s);
                            if (el && el.offsetParent !== null) {{ el.click(); return true; }}
                        }} catch (e) {{}}
                    }}
                    return false;
                }})()
                "#,
                sels = Self::json(&self.profile.sidebar_toggles)
            );
            if !self.eval::<bool>(toggle_js).await.unwrap_or(false) {
                debug!("cdp: no usable sidebar toggle; clicking anyway");
            }
            tokio::time::sleep(SIDEBAR_REVEAL_WAIT).await;
        }

        let click_js = format!(
            r#"
            (() => {{
                let el = null;
                for (const s of {sels}) {{
                    try {{ el = document.querySelector(s); }} catch (e) {{ el = null; }}
                    if (el) break;
                }}
                if (!el) return false;
                try {{ el.scrollIntoView({{ behavior: 'smooth', block: 'center' }}); }} catch (e) {{}}
                const opts = {{ bubbles: true, cancelable: true, view: window, detail: 1, button: 0 }};
                for (const type of ['mousedown', 'mouseup', 'click']) {{
                    try {{ el.dispatchEvent(new MouseEvent(type, opts)); }} catch (e) {{}}
                }}
                try {{ el.click(); }} catch (e) {{}}
                return true;
            }})()
            "#,
            sels = Self::json(&self.profile.new_chat_buttons)
        );
        if self.eval::<bool>(click_js).await? {
            Ok(())
        } else {
            Err(SurfaceError::Missing("new conversation control"))
        }
    }

    async fn thread_indicators(&self) -> Result<ThreadIndicators, SurfaceError> {
        let js = format!(
            r#"
            (() => {{
                const path = window.location.pathname;
                const atRoot = path === '/' || path === '';

                const welcome = {welcome}.some(s => {{
                    try {{ return !!document.querySelector(s); }} catch (e) {{ return false; }}
                }});

                let messages = 0;
                for (const s of {messages}) {{
                    try {{ messages += document.querySelectorAll(s).length; }} catch (e) {{}}
                }}

                let inputEmpty = true;
                for (const s of {inputs}) {{
                    let el = null;
                    try {{ el = document.querySelector(s); }} catch (e) {{}}
                    if (el) {{
                        inputEmpty = !el.textContent || el.textContent.trim() === '';
                        break;
                    }}
                }}

                return {{
                    at_root_path: atRoot,
                    welcome_visible: welcome,
                    no_messages: messages === 0,
                    input_empty: inputEmpty
                }};
            }})()
            "#,
            welcome = Self::json(&self.profile.welcome_indicators),
            messages = Self::json(&self.profile.message_blocks),
            inputs = Self::json(&self.profile.input_selectors)
        );
        self.eval::<ThreadIndicators>(js).await
    }
}
