//! Pure HTML extraction for answers, cited sources, and thread labels.
//!
//! Everything here operates on captured HTML strings so it can be exercised
//! against fixture markup without a live page. The CDP adapter is the only
//! caller that feeds it real captures.

use scraper::{ElementRef, Html, Selector};
use tracing::warn;

use crate::core::config::PageProfile;
use crate::core::types::{ResultRow, SourceCitation};

const SNIPPET_LIMIT: usize = 200;

fn parse_selector(raw: &str) -> Option<Selector> {
    match Selector::parse(raw) {
        Ok(sel) => Some(sel),
        Err(e) => {
            warn!("collect: invalid selector '{raw}': {e:?}");
            None
        }
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn first_text(doc: &Html, raw_selector: &str) -> Option<String> {
    let sel = parse_selector(raw_selector)?;
    doc.select(&sel).map(element_text).find(|t| !t.is_empty())
}

/// Extract the reply text from one answer block: the markdown body when
/// present, the whole block's text otherwise.
pub fn answer_text(block_html: &str, profile: &PageProfile) -> String {
    let doc = Html::parse_fragment(block_html);
    if let Some(text) = first_text(&doc, &profile.answer_body) {
        return text;
    }
    doc.root_element().text().collect::<String>().trim().to_string()
}

/// Whether an answer block carries cited web sources. Four signals, any of
/// which counts: a sites container, citation keywords in the search-tip
/// text, a search region, or direct source links.
pub fn has_source_citations(block_html: &str, profile: &PageProfile) -> bool {
    let doc = Html::parse_fragment(block_html);

    if let Some(sel) = parse_selector(&profile.sources_container) {
        if doc.select(&sel).next().is_some() {
            return true;
        }
    }

    if let Some(sel) = parse_selector(&profile.search_tip) {
        for tip in doc.select(&sel) {
            let text = element_text(tip).to_lowercase();
            if profile
                .search_tip_keywords
                .iter()
                .any(|kw| text.contains(&kw.to_lowercase()))
            {
                return true;
            }
        }
    }

    if let Some(sel) = parse_selector(&profile.search_region) {
        if doc.select(&sel).next().is_some() {
            return true;
        }
    }

    if let Some(sel) = parse_selector(&profile.source_link) {
        if doc.select(&sel).next().is_some() {
            return true;
        }
    }

    false
}

/// Extract every cited source from the sources container's HTML, in page
/// order, with 1-based indices.
pub fn parse_sources(container_html: &str, profile: &PageProfile) -> Vec<SourceCitation> {
    let doc = Html::parse_fragment(container_html);
    let Some(link_sel) = parse_selector(&profile.source_link) else {
        return Vec::new();
    };

    doc.select(&link_sel)
        .enumerate()
        .map(|(i, link)| {
            let sub_text = |raw: &str| {
                parse_selector(raw)
                    .and_then(|sel| link.select(&sel).next())
                    .map(element_text)
                    .unwrap_or_default()
            };
            SourceCitation {
                index: (i + 1) as u32,
                title: sub_text(&profile.source_title),
                content: truncate_snippet(&sub_text(&profile.source_snippet)),
                site: sub_text(&profile.source_site),
                url: link.value().attr("href").unwrap_or_default().to_string(),
                time: sub_text(&profile.source_time),
            }
        })
        .collect()
}

/// Snippets are capped so one verbose source cannot dominate the export.
fn truncate_snippet(content: &str) -> String {
    if content.chars().count() <= SNIPPET_LIMIT {
        return content.to_string();
    }
    let cut: String = content.chars().take(SNIPPET_LIMIT).collect();
    format!("{cut}...")
}

/// Pull the current thread's title out of the sidebar history, trying each
/// configured selector in order.
pub fn conversation_label_from(page_html: &str, profile: &PageProfile) -> Option<String> {
    let doc = Html::parse_document(page_html);
    profile
        .sidebar_history
        .iter()
        .find_map(|raw| first_text(&doc, raw))
}

/// Compose one or more result rows for a collected exchange: a row per
/// source when the answer cites any, a single bare row otherwise.
pub fn compose_rows(
    question: &str,
    answer: &str,
    label: &str,
    sources: &[SourceCitation],
) -> Vec<ResultRow> {
    if sources.is_empty() {
        return vec![ResultRow::bare(question, answer, label)];
    }
    sources
        .iter()
        .enumerate()
        .map(|(i, source)| {
            ResultRow::bare(question, answer, label).with_source((i + 1) as u32, source)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn profile() -> PageProfile {
        PageProfile::default()
    }

    const ANSWER_BLOCK: &str = r#"
        <div class="segment-assistant">
          <div class="markdown-container"><div class="markdown">
            The sky is blue because of Rayleigh scattering.
          </div></div>
        </div>"#;

    #[test]
    fn answer_prefers_markdown_body() {
        let text = answer_text(ANSWER_BLOCK, &profile());
        assert_eq!(text, "The sky is blue because of Rayleigh scattering.");
    }

    #[test]
    fn answer_falls_back_to_block_text() {
        let text = answer_text(
            r#"<div class="segment-assistant">plain reply text</div>"#,
            &profile(),
        );
        assert_eq!(text, "plain reply text");
    }

    #[test]
    fn citation_detection_via_container_and_links() {
        let with_container = r#"<div><div class="sites"></div></div>"#;
        assert!(has_source_citations(with_container, &profile()));

        let with_links = r#"<div><a class="site" href="https://a.example"></a></div>"#;
        assert!(has_source_citations(with_links, &profile()));

        let with_tip =
            r#"<div class="search-plus"><span class="search-plus-tips">3 sources</span></div>"#;
        assert!(has_source_citations(with_tip, &profile()));

        assert!(!has_source_citations("<div>no citations here</div>", &profile()));
    }

    const SOURCES: &str = r#"
        <div class="sites">
          <a class="site" href="https://first.example/a">
            <span class="title">First title</span>
            <span class="snippet">First snippet</span>
            <span class="name">first.example</span>
            <span class="date">2026-01-02</span>
          </a>
          <a class="site" href="https://second.example/b">
            <span class="title">Second title</span>
            <span class="snippet">Second snippet</span>
            <span class="name">second.example</span>
            <span class="date">2026-01-03</span>
          </a>
        </div>"#;

    #[test]
    fn sources_parse_in_order_with_indices() {
        let sources = parse_sources(SOURCES, &profile());
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].index, 1);
        assert_eq!(sources[0].title, "First title");
        assert_eq!(sources[0].url, "https://first.example/a");
        assert_eq!(sources[1].index, 2);
        assert_eq!(sources[1].site, "second.example");
        assert_eq!(sources[1].time, "2026-01-03");
    }

    #[test]
    fn long_snippets_are_truncated_on_char_boundaries() {
        let long = "雨".repeat(300);
        let html = format!(
            r#"<div class="sites"><a class="site" href="u"><span class="snippet">{long}</span></a></div>"#
        );
        let sources = parse_sources(&html, &profile());
        assert_eq!(sources[0].content.chars().count(), 203); // 200 + "..."
        assert!(sources[0].content.ends_with("..."));
    }

    #[test]
    fn label_comes_from_first_matching_sidebar_entry() {
        let html = r#"
            <div class="sidebar-nav"><div class="history-part"><ul>
              <li><a class="chat-info-item">Weather questions</a></li>
              <li><a class="chat-info-item">Older thread</a></li>
            </ul></div></div>"#;
        assert_eq!(
            conversation_label_from(html, &profile()),
            Some("Weather questions".to_string())
        );
        assert_eq!(conversation_label_from("<div></div>", &profile()), None);
    }

    #[test]
    fn compose_rows_shapes() {
        let none = compose_rows("q", "a", "thread", &[]);
        assert_eq!(none.len(), 1);
        assert_eq!(none[0].sequence_index, None);
        assert!(none[0].source_url.is_empty());

        let sources = parse_sources(SOURCES, &profile());
        let rows = compose_rows("q", "a", "thread", &sources);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.question == "q" && r.answer == "a"));
        assert_eq!(rows[0].sequence_index, Some(1));
        assert_eq!(rows[1].sequence_index, Some(2));
    }
}
