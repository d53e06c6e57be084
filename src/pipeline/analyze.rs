//! Phase 1: per-page analysis.
//!
//! One combined model call per page returns both the Markdown transcription
//! and a JSON list of diagram bounding boxes. Models do not always honour the
//! delimiter contract, so the diagram JSON is located by an ordered chain of
//! strategies:
//!
//! ```text
//! ===DIAGRAMS_START=== … ===DIAGRAMS_END===   Delimited
//! ```json { … } ```                            Fenced
//! { … "diagrams" … }                           Bare
//! (nothing usable)                              Unmatched → zero diagrams
//! ```
//!
//! A strategy whose text does not parse into an accepted shape falls through
//! to the next one.

use crate::config::ModelRole;
use crate::error::ForgeError;
use crate::pipeline::encode;
use crate::pipeline::llm::AiClient;
use crate::pipeline::postprocess::clean_markdown;
use crate::pipeline::render::{PageRenderer, RenderOptions};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

static RE_DIAGRAMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"===DIAGRAMS_START===([\s\S]*?)===DIAGRAMS_END===").expect("static regex")
});
static RE_FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```json\s*(\{[\s\S]*?\})\s*```").expect("static regex"));
static RE_BARE_DIAGRAMS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\{[\s\S]*"diagrams"[\s\S]*\}"#).expect("static regex"));
static RE_MARKDOWN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"===MARKDOWN_START===([\s\S]*?)===MARKDOWN_END===").expect("static regex")
});
static RE_FENCE_TOKENS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```json|```markdown|```").expect("static regex"));

/// Which strategy produced the diagram list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagramSource {
    Delimited,
    Fenced,
    Bare,
    Unmatched,
}

/// One detected diagram.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagramItem {
    /// 0-based page index.
    pub page_idx: usize,
    /// `[ymin, xmin, ymax, xmax]` on a 0–1000 scale. `None` when the model
    /// omitted or mangled the box; such items cannot be cropped.
    pub box_2d: Option<[f32; 4]>,
    pub label: String,
    /// Id used in the page's `***[ID]***` placeholder.
    pub id: String,
    pub visual_summary: Option<String>,
    pub output_type: Option<String>,
    /// Document-unique id, `P{page}_D{n}`.
    pub temp_id: String,
    /// Set by deduplication: a later page shows the same diagram.
    pub skip: bool,
}

impl DiagramItem {
    pub fn placeholder(&self) -> String {
        format!("***[{}]***", self.id)
    }
}

/// Result of analysing one page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageAnalysis {
    pub page_idx: usize,
    pub text: String,
    pub items: Vec<DiagramItem>,
    pub source: DiagramSource,
}

impl PageAnalysis {
    /// Placeholder analysis for a page whose call failed.
    pub fn failed(page_idx: usize, message: &str) -> Self {
        Self {
            page_idx,
            text: format!("> [!ERROR] Page Analysis Failed: {message}"),
            items: Vec::new(),
            source: DiagramSource::Unmatched,
        }
    }
}

/// Parse the raw reply of the combined call.
pub fn parse_analysis(page_idx: usize, raw: &str) -> PageAnalysis {
    let (source, raw_items) = locate_diagrams(raw);
    let items = raw_items
        .iter()
        .enumerate()
        .map(|(idx, v)| normalise_item(page_idx, idx, v))
        .collect();
    PageAnalysis {
        page_idx,
        text: extract_markdown(raw),
        items,
        source,
    }
}

fn locate_diagrams(raw: &str) -> (DiagramSource, Vec<Value>) {
    let candidates = [
        (DiagramSource::Delimited, RE_DIAGRAMS.captures(raw).map(|c| c[1].to_string())),
        (DiagramSource::Fenced, RE_FENCED_JSON.captures(raw).map(|c| c[1].to_string())),
        (DiagramSource::Bare, RE_BARE_DIAGRAMS.find(raw).map(|m| m.as_str().to_string())),
    ];
    for (source, text) in candidates {
        let Some(text) = text else { continue };
        match parse_diagram_json(&text) {
            Some(items) => return (source, items),
            None => debug!("{source:?} diagram block did not parse, trying next strategy"),
        }
    }
    (DiagramSource::Unmatched, Vec::new())
}

/// Accepts a bare array, `{"diagrams": [...]}`, or a single
/// `{"diagram_present": true, "box_2d": [...]}` object.
fn parse_diagram_json(text: &str) -> Option<Vec<Value>> {
    let cleaned = text.trim().replace("```json", "").replace("```", "");
    let parsed: Value = serde_json::from_str(cleaned.trim()).ok()?;
    match parsed {
        Value::Array(items) => Some(items),
        Value::Object(ref obj) => {
            if let Some(Value::Array(items)) = obj.get("diagrams") {
                Some(items.clone())
            } else if is_truthy(obj.get("diagram_present")) && obj.contains_key("box_2d") {
                Some(vec![parsed])
            } else {
                None
            }
        }
        _ => None,
    }
}

fn is_truthy(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::Null) | None => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(_) => true,
    }
}

fn non_empty_str(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_box(v: Option<&Value>) -> Option<[f32; 4]> {
    let arr = v?.as_array()?;
    if arr.len() != 4 {
        return None;
    }
    let mut out = [0f32; 4];
    for (slot, n) in out.iter_mut().zip(arr) {
        *slot = n.as_f64()? as f32;
    }
    Some(out)
}

fn normalise_item(page_idx: usize, idx: usize, v: &Value) -> DiagramItem {
    DiagramItem {
        page_idx,
        box_2d: parse_box(v.get("box_2d")),
        label: non_empty_str(v, "label").unwrap_or_else(|| "Diagram".to_string()),
        id: non_empty_str(v, "id").unwrap_or_else(|| format!("DIAGRAM_{}", idx + 1)),
        visual_summary: non_empty_str(v, "visual_summary"),
        output_type: non_empty_str(v, "output_type"),
        temp_id: format!("P{page_idx}_D{idx}"),
        skip: false,
    }
}

/// The MARKDOWN section when present, else the reply minus the diagram block
/// and any fence tokens.
fn extract_markdown(raw: &str) -> String {
    if let Some(section) = RE_MARKDOWN.captures(raw).map(|c| c[1].trim().to_string()) {
        if !section.is_empty() {
            return section;
        }
    }
    let without_diagrams = RE_DIAGRAMS.replace(raw, "");
    RE_FENCE_TOKENS
        .replace_all(&without_diagrams, "")
        .trim()
        .to_string()
}

/// Render a page, run the combined call and parse the reply.
///
/// Render and call failures degrade to an error callout on the page. Errors
/// that make every other page fail too (daily quota, unusable provider) are
/// returned as `Err` and abort the document.
pub async fn analyze_page(
    renderer: &dyn PageRenderer,
    client: &AiClient,
    path: &Path,
    render: RenderOptions,
    prompt: &str,
    page_idx: usize,
) -> Result<PageAnalysis, ForgeError> {
    let outcome = async {
        let image = renderer.render_page(path, page_idx, render).await?;
        let png = encode::png_bytes(&image)?;
        let request = client.request(ModelRole::Transcription, prompt.to_string(), Some(png));
        client.call(&request).await
    }
    .await;

    match outcome {
        Ok(reply) => {
            let mut page = parse_analysis(page_idx, &reply.text);
            page.text = clean_markdown(&page.text).trim_end().to_string();
            if !page.items.is_empty() {
                debug!(
                    "Page {}: detected {} diagrams ({:?})",
                    page_idx + 1,
                    page.items.len(),
                    page.source
                );
            }
            Ok(page)
        }
        Err(e) if e.aborts_document() => Err(e),
        Err(e) => {
            warn!("Page {}: analysis failed: {e}", page_idx + 1);
            Ok(PageAnalysis::failed(page_idx, &e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimited_reply() {
        let raw = "===DIAGRAMS_START===\n{\"diagrams\":[{\"box_2d\":[100,100,500,900],\"label\":\"Graph\",\"id\":\"DIAGRAM_1\",\"visual_summary\":\"sine wave\"}]}\n===DIAGRAMS_END===\n===MARKDOWN_START===\n# Intro\n***[DIAGRAM_1]***\n===MARKDOWN_END===";
        let page = parse_analysis(2, raw);
        assert_eq!(page.source, DiagramSource::Delimited);
        assert_eq!(page.text, "# Intro\n***[DIAGRAM_1]***");
        assert_eq!(page.items.len(), 1);
        let item = &page.items[0];
        assert_eq!(item.temp_id, "P2_D0");
        assert_eq!(item.box_2d, Some([100.0, 100.0, 500.0, 900.0]));
        assert_eq!(item.visual_summary.as_deref(), Some("sine wave"));
        assert_eq!(item.placeholder(), "***[DIAGRAM_1]***");
    }

    #[test]
    fn fenced_reply_without_markdown_delimiters() {
        let raw = "Here you go:\n```json\n{\"diagrams\": [{\"box_2d\": [0,0,10,10]}]}\n```\n## Text body";
        let page = parse_analysis(0, raw);
        assert_eq!(page.source, DiagramSource::Fenced);
        assert_eq!(page.items[0].id, "DIAGRAM_1");
        assert_eq!(page.items[0].label, "Diagram");
        assert!(page.text.contains("## Text body"));
        assert!(!page.text.contains("```"));
    }

    #[test]
    fn bare_object_and_array_shapes() {
        let page = parse_analysis(0, "prefix {\"diagrams\": []} suffix");
        assert_eq!(page.source, DiagramSource::Bare);
        assert!(page.items.is_empty());

        let page = parse_analysis(
            1,
            "===DIAGRAMS_START===[{\"box_2d\":[1,2,3,4],\"id\":\"A\"},{\"box_2d\":[5,6,7,8]}]===DIAGRAMS_END===",
        );
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[1].id, "DIAGRAM_2");
        assert_eq!(page.items[1].temp_id, "P1_D1");
    }

    #[test]
    fn single_present_object() {
        let raw = "===DIAGRAMS_START={\"diagram_present\": true, \"box_2d\": [1,1,9,9]}";
        // Broken delimiter: nothing matches, zero diagrams.
        assert_eq!(parse_analysis(0, raw).source, DiagramSource::Unmatched);

        let raw = "===DIAGRAMS_START==={\"diagram_present\": true, \"box_2d\": [1,1,9,9]}===DIAGRAMS_END===";
        let page = parse_analysis(0, raw);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].box_2d, Some([1.0, 1.0, 9.0, 9.0]));
    }

    #[test]
    fn malformed_delimited_json_falls_through() {
        let raw = "===DIAGRAMS_START===not json===DIAGRAMS_END===\n```json\n{\"diagrams\":[{\"box_2d\":[1,1,2,2]}]}\n```";
        let page = parse_analysis(0, raw);
        assert_eq!(page.source, DiagramSource::Fenced);
        assert_eq!(page.items.len(), 1);
    }

    #[test]
    fn garbage_yields_zero_diagrams_and_text() {
        let page = parse_analysis(0, "Just some notes about {braces}.");
        assert_eq!(page.source, DiagramSource::Unmatched);
        assert!(page.items.is_empty());
        assert_eq!(page.text, "Just some notes about {braces}.");
    }

    #[test]
    fn bad_box_is_kept_without_coordinates() {
        let page = parse_analysis(0, "[{\"box_2d\":[1,2,3],\"label\":\"Circuit\"}]");
        // A bare array is not matched by any strategy.
        assert!(page.items.is_empty());

        let page = parse_analysis(
            0,
            "===DIAGRAMS_START===[{\"box_2d\":[1,2,3],\"label\":\"Circuit\"}]===DIAGRAMS_END===",
        );
        assert_eq!(page.items[0].box_2d, None);
        assert_eq!(page.items[0].label, "Circuit");
    }

    #[test]
    fn failure_callout() {
        let page = PageAnalysis::failed(3, "boom");
        assert_eq!(page.text, "> [!ERROR] Page Analysis Failed: boom");
        assert!(page.items.is_empty());
    }
}
