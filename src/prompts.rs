//! Prompt texts and prompt assembly.
//!
//! Prompts come in two layers:
//!
//! 1. **Editable parts** ([`PromptParts`]) — style guide, transcription goal,
//!    diagram-detection goal, Excalidraw goal and refinement goal. These are
//!    stored per subject on disk by [`crate::store`] and resolved through the
//!    subject → global defaults → system defaults hierarchy.
//!
//! 2. **Fixed output contracts** — the delimiter instructions for the
//!    combined analysis call and the strict Excalidraw JSON schema. These are
//!    appended here, never stored, because the response parsers in
//!    [`crate::pipeline::analyze`] and [`crate::pipeline::assets`] depend on
//!    them verbatim.

use serde::{Deserialize, Serialize};

/// Placeholder in the transcription and refinement goals that is replaced
/// with the subject's style guide.
pub const STYLE_GUIDE_TOKEN: &str = "{{STYLE_GUIDE}}";

pub const DIAGRAMS_START: &str = "===DIAGRAMS_START===";
pub const DIAGRAMS_END: &str = "===DIAGRAMS_END===";
pub const MARKDOWN_START: &str = "===MARKDOWN_START===";
pub const MARKDOWN_END: &str = "===MARKDOWN_END===";

/// The five editable prompt parts of a subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptParts {
    pub style_guide: String,
    pub transcription_goal: String,
    pub coordinate_goal: String,
    pub excalidraw_goal: String,
    pub refinement_goal: String,
}

/// Identifies one prompt part and its on-disk file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptPart {
    StyleGuide,
    Transcription,
    DiagramDetection,
    Excalidraw,
    Refinement,
}

impl PromptPart {
    pub const ALL: [PromptPart; 5] = [
        PromptPart::StyleGuide,
        PromptPart::Transcription,
        PromptPart::DiagramDetection,
        PromptPart::Excalidraw,
        PromptPart::Refinement,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            PromptPart::StyleGuide => "styleGuide.md",
            PromptPart::Transcription => "transcription.md",
            PromptPart::DiagramDetection => "diagramDetection.md",
            PromptPart::Excalidraw => "excalidraw.md",
            PromptPart::Refinement => "refinement.md",
        }
    }
}

impl PromptParts {
    pub fn get(&self, part: PromptPart) -> &str {
        match part {
            PromptPart::StyleGuide => &self.style_guide,
            PromptPart::Transcription => &self.transcription_goal,
            PromptPart::DiagramDetection => &self.coordinate_goal,
            PromptPart::Excalidraw => &self.excalidraw_goal,
            PromptPart::Refinement => &self.refinement_goal,
        }
    }

    pub fn set(&mut self, part: PromptPart, text: String) {
        let slot = match part {
            PromptPart::StyleGuide => &mut self.style_guide,
            PromptPart::Transcription => &mut self.transcription_goal,
            PromptPart::DiagramDetection => &mut self.coordinate_goal,
            PromptPart::Excalidraw => &mut self.excalidraw_goal,
            PromptPart::Refinement => &mut self.refinement_goal,
        };
        *slot = text;
    }

    /// Per-part fallback: the first non-empty value wins.
    pub fn layered(layers: &[&PromptParts]) -> PromptParts {
        let mut out = PromptParts::default();
        for part in PromptPart::ALL {
            let pick = layers
                .iter()
                .map(|l| l.get(part))
                .find(|t| !t.trim().is_empty())
                .unwrap_or_default();
            out.set(part, pick.to_string());
        }
        out
    }

    /// Built-in texts used to seed `prompts/defaults` on first start.
    pub fn builtin() -> PromptParts {
        PromptParts {
            style_guide: DEFAULT_STYLE_GUIDE.to_string(),
            transcription_goal: DEFAULT_TRANSCRIPTION_GOAL.to_string(),
            coordinate_goal: DEFAULT_DIAGRAM_DETECTION_GOAL.to_string(),
            excalidraw_goal: DEFAULT_EXCALIDRAW_GOAL.to_string(),
            refinement_goal: DEFAULT_REFINEMENT_GOAL.to_string(),
        }
    }

    /// Transcription goal with the style guide substituted in.
    pub fn transcription_prompt(&self) -> String {
        substitute_style_guide(&self.transcription_goal, &self.style_guide)
    }
}

/// Replace the first [`STYLE_GUIDE_TOKEN`] with the style guide.
pub fn substitute_style_guide(goal: &str, style_guide: &str) -> String {
    goal.replacen(STYLE_GUIDE_TOKEN, style_guide, 1)
}

// ── Built-in defaults ────────────────────────────────────────────────────

pub const DEFAULT_STYLE_GUIDE: &str = r#"- Use ## for lecture sections and ### for subsections.
- Write formulas in LaTeX: $inline$ and $$display$$.
- Keep the original language of the slides.
- Prefer bullet lists over long paragraphs."#;

pub const DEFAULT_TRANSCRIPTION_GOAL: &str = r#"You are transcribing one page of a lecture script or slide deck into Markdown notes.

Preserve ALL text content and the reading order. Ignore page numbers, repeated headers and footers, and decorative elements.

Follow this style guide:
{{STYLE_GUIDE}}"#;

pub const DEFAULT_DIAGRAM_DETECTION_GOAL: &str = r#"Locate every visual element worth keeping as a separate figure: graphs, charts, circuit diagrams, flowcharts, sketches and tables drawn as images.
Do not report logos, decorative icons or plain text blocks.
Give each element a concise label and a one-sentence visual summary. If an element must stay a raster image (photographs, dense plots), add "output_type": "image"."#;

pub const DEFAULT_EXCALIDRAW_GOAL: &str = r#"Recreate the diagram in the image as an Excalidraw drawing.
Use simple shapes, arrows and text elements. Keep the relative layout of the original, keep all labels, and omit shading or textures."#;

pub const DEFAULT_REFINEMENT_GOAL: &str = r#"You receive the raw page-by-page transcription of a whole document. Merge it into one coherent set of notes:
- Remove content duplicated by build-up slides.
- Fix heading levels so the document has a consistent hierarchy.
- Keep every image link of the form ![...](pending:...) that still belongs to the content, unchanged. Drop the ones that duplicate another.

Follow this style guide:
{{STYLE_GUIDE}}

Return only the Markdown."#;

// ── Fixed output contracts ───────────────────────────────────────────────

/// Build the single prompt for the combined transcription + detection call.
pub fn combined_analysis_prompt(transcription: &str, detection: &str) -> String {
    format!(
        r#"{transcription}

---
**TASK: VISUAL ELEMENT DETECTION (High Priority)**
{detection}

**COMBINED OUTPUT INSTRUCTIONS (STRICT):**
You are generating two distinct outputs.

**1. DIAGRAMS (JSON):**
- Scan for graphs, charts, circuits, sketches.
- Output a JSON object containing a "diagrams" array.
- **IMPORTANT:** Wrap the JSON content exactly between `{DIAGRAMS_START}` and `{DIAGRAMS_END}`.
- **JSON Format:**
  {{
    "diagrams": [
      {{
        "box_2d": [ymin, xmin, ymax, xmax],
        "label": "ConciseLabel",
        "id": "DIAGRAM_1",
        "visual_summary": "Short description for duplicate detection"
      }}
    ]
  }}
  *Scale: 0 to 1000.*

**2. TRANSCRIPTION (Markdown):**
- Full fidelity text, headers, math (LaTeX in $...$).
- Insert placeholders: `***[DIAGRAM_ID]***` (e.g., `***[DIAGRAM_1]***`) exactly where the diagram is.
- Output Markdown between `{MARKDOWN_START}` and `{MARKDOWN_END}`.
"#
    )
}

/// Schema contract appended to every Excalidraw goal.
pub const EXCALIDRAW_STRICT_SUFFIX: &str = r##"
---
**STRICT TECHNICAL REQUIREMENTS (OVERRIDE)**
You must output a SINGLE JSON object containing ONLY the Excalidraw structure.
DO NOT include Markdown formatting like ```json. Return raw JSON.

**Required JSON Structure:**
{
  "type": "excalidraw",
  "version": 2,
  "source": "https://excalidraw.com",
  "elements": [
    {
      "type": "rectangle" | "ellipse" | "diamond" | "arrow" | "line" | "text" | "freedraw",
      "x": number, "y": number, "width": number, "height": number, "angle": 0,
      "strokeColor": "#1e1e1e", "backgroundColor": "transparent", "fillStyle": "solid",
      "strokeWidth": 1, "strokeStyle": "solid", "roughness": 1, "opacity": 100,
      "groupIds": [], "boundElements": null, "seed": number, "version": 1, "versionNonce": number,
      "isDeleted": false,
      "roundness": null | { "type": 2 } | { "type": 3 },
      "text": "string", "fontSize": 20, "fontFamily": 1, "textAlign": "left", "verticalAlign": "top",
      "points": [[x,y], [x,y]]
    }
  ],
  "appState": { "viewBackgroundColor": "#ffffff", "currentItemFontFamily": 1 },
  "confidence": number
}
"confidence" is your confidence in this conversion, from 0.0 to 1.0.
"##;

pub fn excalidraw_prompt(goal: &str) -> String {
    format!("{goal}\n{EXCALIDRAW_STRICT_SUFFIX}")
}

/// Whole-document refinement request: goal (style guide substituted) followed
/// by the document itself.
pub fn refinement_prompt(goal: &str, style_guide: &str, document: &str) -> String {
    let mut p = substitute_style_guide(goal, style_guide);
    p.push_str("\n\n**INPUT DATA:**\n");
    p.push_str(document);
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn style_guide_is_substituted_once() {
        let out = substitute_style_guide("A {{STYLE_GUIDE}} B {{STYLE_GUIDE}}", "S");
        assert_eq!(out, "A S B {{STYLE_GUIDE}}");
    }

    #[test]
    fn layered_picks_first_non_empty_per_part() {
        let subject = PromptParts {
            style_guide: "subject style".into(),
            ..Default::default()
        };
        let global = PromptParts {
            transcription_goal: "global transcription".into(),
            style_guide: "global style".into(),
            ..Default::default()
        };
        let system = PromptParts::builtin();
        let out = PromptParts::layered(&[&subject, &global, &system]);
        assert_eq!(out.style_guide, "subject style");
        assert_eq!(out.transcription_goal, "global transcription");
        assert_eq!(out.coordinate_goal, DEFAULT_DIAGRAM_DETECTION_GOAL);
    }

    #[test]
    fn combined_prompt_carries_delimiters() {
        let p = combined_analysis_prompt("T", "D");
        for marker in [DIAGRAMS_START, DIAGRAMS_END, MARKDOWN_START, MARKDOWN_END] {
            assert!(p.contains(marker), "missing {marker}");
        }
        assert!(p.starts_with("T\n"));
        assert!(p.contains("***[DIAGRAM_1]***"));
    }

    #[test]
    fn refinement_prompt_appends_document() {
        let p = refinement_prompt("Refine. {{STYLE_GUIDE}}", "terse", "# Doc");
        assert_eq!(p, "Refine. terse\n\n**INPUT DATA:**\n# Doc");
    }

    #[test]
    fn builtin_transcription_uses_style_guide() {
        let parts = PromptParts::builtin();
        let t = parts.transcription_prompt();
        assert!(!t.contains(STYLE_GUIDE_TOKEN));
        assert!(t.contains("LaTeX"));
    }
}
