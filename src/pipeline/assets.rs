//! Phases 3 and 5: diagram crops, pending markers and final resources.
//!
//! Preparation crops every non-skipped diagram and puts an inert marker
//! `![Diagram: <label>](pending:<temp id>)` in the page text. Refinement may
//! drop markers; only the survivors are resolved, either into an Excalidraw
//! drawing (non-table, not forced to image, confident enough) or into the raw
//! crop as a PNG attachment.

use crate::config::ModelRole;
use crate::error::ForgeError;
use crate::pipeline::analyze::DiagramItem;
use crate::pipeline::bundle::{random_id, Attachment, BundleFile, NoteEntry};
use crate::pipeline::encode;
use crate::pipeline::llm::AiClient;
use crate::prompts::excalidraw_prompt;
use crate::store::sanitize_filename;
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Pixels added around every box before cropping.
pub const CROP_PADDING: f32 = 20.0;
/// Crops this small or smaller in either dimension are rejected.
pub const MIN_CROP_SIDE: u32 = 10;
const MAX_LABEL_LEN: usize = 50;

static RE_PENDING_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\]\(pending:([a-zA-Z0-9_]+)\)").expect("static regex"));
static RE_PENDING_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[[^\]]*\]\(pending:([a-zA-Z0-9_]+)\)").expect("static regex"));

/// Pixel rectangle `(x, y, width, height)` for a 0–1000 box on a `w × h`
/// image, or `None` when the padded, clamped crop is degenerate.
pub fn crop_rect(w: u32, h: u32, box_2d: &[f32; 4]) -> Option<(u32, u32, u32, u32)> {
    let c = |v: f32| v.clamp(0.0, 1000.0);
    let [ymin, xmin, ymax, xmax] = box_2d.map(c);
    let (wf, hf) = (w as f32, h as f32);

    let x1 = ((xmin / 1000.0) * wf - CROP_PADDING).floor().max(0.0);
    let y1 = ((ymin / 1000.0) * hf - CROP_PADDING).floor().max(0.0);
    let x2 = ((xmax / 1000.0) * wf + CROP_PADDING).ceil().min(wf);
    let y2 = ((ymax / 1000.0) * hf + CROP_PADDING).ceil().min(hf);

    let (cw, ch) = (x2 - x1, y2 - y1);
    if !(cw > MIN_CROP_SIDE as f32 && ch > MIN_CROP_SIDE as f32) {
        return None;
    }
    Some((x1 as u32, y1 as u32, cw as u32, ch as u32))
}

/// A prepared, not yet resolved diagram.
#[derive(Debug, Clone)]
pub struct PendingAsset {
    pub temp_id: String,
    pub id: String,
    pub label: String,
    pub safe_label: String,
    /// `<safe label>_<rand4>`, shared by every file generated for it.
    pub base_name: String,
    pub crop_png: Vec<u8>,
    pub is_table: bool,
    pub force_image: bool,
}

impl PendingAsset {
    pub fn marker(&self) -> String {
        format!("![Diagram: {}](pending:{})", self.safe_label, self.temp_id)
    }
}

/// Labels containing "table" or "tabelle" are tables.
pub fn is_table_label(label: &str) -> bool {
    let l = label.to_lowercase();
    l.contains("table") || l.contains("tabelle")
}

/// Crop a diagram out of its page render. `Ok(None)` when the box is missing
/// or the crop is degenerate.
pub fn prepare_asset(item: &DiagramItem, page: &DynamicImage) -> Result<Option<PendingAsset>, ForgeError> {
    let Some(box_2d) = item.box_2d else {
        return Ok(None);
    };
    let Some((x, y, w, h)) = crop_rect(page.width(), page.height(), &box_2d) else {
        warn!("{}: degenerate crop for box {:?}", item.temp_id, box_2d);
        return Ok(None);
    };
    let crop = page.crop_imm(x, y, w, h);
    let crop_png = encode::png_bytes(&crop)?;

    let safe_label: String = sanitize_filename(&item.label).chars().take(MAX_LABEL_LEN).collect();
    Ok(Some(PendingAsset {
        temp_id: item.temp_id.clone(),
        id: item.id.clone(),
        label: item.label.clone(),
        base_name: format!("{safe_label}_{}", random_id(4)),
        safe_label,
        crop_png,
        is_table: is_table_label(&item.label),
        force_image: item.output_type.as_deref() == Some("image"),
    }))
}

/// Replace each diagram placeholder in a page's text.
///
/// * skipped → removed
/// * prepared → pending marker on its own line (appended when the model
///   forgot the placeholder)
/// * crop failed → warning callout
pub fn inject_markers(
    text: &str,
    items: &[DiagramItem],
    pending: &HashMap<String, PendingAsset>,
) -> String {
    let mut out = text.to_string();
    for item in items {
        let placeholder = item.placeholder();
        let has_placeholder = out.contains(&placeholder);
        if item.skip {
            out = out.replacen(&placeholder, "", 1);
        } else if let Some(asset) = pending.get(&item.temp_id) {
            let block = format!("\n{}\n", asset.marker());
            if has_placeholder {
                out = out.replacen(&placeholder, &block, 1);
            } else {
                out.push_str(&block);
            }
        } else {
            let callout = format!("\n> [!WARNING] Asset Prep Failed for {}\n", item.id);
            out = out.replacen(&placeholder, &callout, 1);
        }
    }
    out
}

/// Temp ids of pending markers still in `doc`, in order of first appearance.
pub fn surviving_ids(doc: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for cap in RE_PENDING_ID.captures_iter(doc) {
        let id = cap[1].to_string();
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}

/// Point every marker for `temp_id` at `final_path`, keeping its label.
pub fn replace_pending(doc: &str, temp_id: &str, final_path: &str) -> String {
    doc.replace(&format!("](pending:{temp_id})"), &format!("]({final_path})"))
}

/// Remove any marker that could not be resolved.
pub fn drop_unresolved(doc: &str) -> String {
    RE_PENDING_LINK.replace_all(doc, "").into_owned()
}

// ── Excalidraw ───────────────────────────────────────────────────────────

/// Parse a drawing reply: fence-stripped JSON, else the outermost braces.
/// Returns the object only when it has an `elements` array.
pub fn parse_excalidraw(raw: &str) -> Option<Value> {
    let stripped = raw.replace("```json", "").replace("```", "");
    let parsed = serde_json::from_str::<Value>(stripped.trim()).ok().or_else(|| {
        let first = raw.find('{')?;
        let last = raw.rfind('}')?;
        (last > first)
            .then(|| serde_json::from_str::<Value>(&raw[first..=last]).ok())
            .flatten()
    })?;
    parsed.get("elements").filter(|e| e.is_array())?;
    Some(parsed)
}

/// Self-reported confidence, 1.0 when absent.
pub fn confidence(drawing: &Value) -> f64 {
    drawing.get("confidence").and_then(Value::as_f64).unwrap_or(1.0)
}

/// Normalised Excalidraw document around the model's elements.
pub fn excalidraw_document(drawing: &Value) -> Value {
    json!({
        "type": "excalidraw",
        "version": 2,
        "source": "https://excalidraw.com",
        "elements": drawing.get("elements").cloned().unwrap_or_else(|| json!([])),
        "appState": { "viewBackgroundColor": "#ffffff", "currentItemFontFamily": 1 },
        "files": {}
    })
}

/// How survivors are resolved for one document.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub generate_excalidraw: bool,
    pub threshold: f32,
    /// Excalidraw goal; empty disables vector synthesis.
    pub excalidraw_goal: String,
    pub parent_note_id: String,
    /// Bundle folder that holds drawings.
    pub note_dir: String,
}

/// Final form of one surviving diagram.
#[derive(Debug, Clone)]
pub struct ResolvedAsset {
    pub temp_id: String,
    pub final_path: String,
    pub file: BundleFile,
    pub child: Option<NoteEntry>,
    pub attachment: Option<Attachment>,
}

async fn try_excalidraw(
    client: &AiClient,
    asset: &PendingAsset,
    opts: &ResolveOptions,
) -> Result<Option<ResolvedAsset>, ForgeError> {
    let request = client.request(
        ModelRole::Excalidraw,
        excalidraw_prompt(&opts.excalidraw_goal),
        Some(asset.crop_png.clone()),
    );
    let reply = client.call(&request).await?;
    let Some(drawing) = parse_excalidraw(&reply.text) else {
        debug!("{}: drawing reply had no elements", asset.label);
        return Ok(None);
    };
    let conf = confidence(&drawing);
    if conf < f64::from(opts.threshold) {
        debug!("{}: drawing confidence {conf:.2} below threshold", asset.label);
        return Ok(None);
    }

    let file_name = format!("{}.excalidraw", asset.base_name);
    let path = format!("{}/{}", opts.note_dir, file_name);
    let bytes = serde_json::to_vec_pretty(&excalidraw_document(&drawing))
        .map_err(|e| ForgeError::Internal(e.to_string()))?;
    info!("Generated Excalidraw for {}", asset.label);
    Ok(Some(ResolvedAsset {
        temp_id: asset.temp_id.clone(),
        final_path: path.clone(),
        file: BundleFile { path, bytes },
        child: Some(NoteEntry::canvas(&opts.parent_note_id, &asset.label, &file_name)),
        attachment: None,
    }))
}

fn raster(asset: &PendingAsset) -> ResolvedAsset {
    let name = format!("{}.png", asset.base_name);
    ResolvedAsset {
        temp_id: asset.temp_id.clone(),
        final_path: name.clone(),
        file: BundleFile {
            path: name.clone(),
            bytes: asset.crop_png.clone(),
        },
        child: None,
        attachment: Some(Attachment::image(&asset.label, &name)),
    }
}

/// Resolve one surviving diagram. Never fails: any drawing failure falls
/// back to the raster crop.
pub async fn resolve_asset(client: &AiClient, asset: &PendingAsset, opts: &ResolveOptions) -> ResolvedAsset {
    let wants_vector = opts.generate_excalidraw
        && !asset.is_table
        && !asset.force_image
        && !opts.excalidraw_goal.trim().is_empty();
    if wants_vector {
        match try_excalidraw(client, asset, opts).await {
            Ok(Some(resolved)) => return resolved,
            Ok(None) => {}
            Err(e) => warn!("Excalidraw generation failed for {}: {e}", asset.label),
        }
    }
    raster(asset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn item(id: &str, temp: &str, b: Option<[f32; 4]>, label: &str) -> DiagramItem {
        DiagramItem {
            page_idx: 0,
            box_2d: b,
            label: label.into(),
            id: id.into(),
            visual_summary: None,
            output_type: None,
            temp_id: temp.into(),
            skip: false,
        }
    }

    #[test]
    fn crop_is_padded_and_clamped() {
        assert_eq!(crop_rect(1000, 2000, &[100.0, 100.0, 200.0, 300.0]), Some((80, 180, 240, 240)));
        assert_eq!(crop_rect(1000, 1000, &[-50.0, 0.0, 2000.0, 1000.0]), Some((0, 0, 1000, 1000)));
    }

    #[test]
    fn tiny_crops_are_rejected() {
        // A zero-size box on a tiny page stays within 10 px after padding.
        assert_eq!(crop_rect(10, 10, &[500.0, 500.0, 500.0, 500.0]), None);
        assert_eq!(crop_rect(200, 8, &[0.0, 0.0, 1000.0, 1000.0]), None);
        assert!(crop_rect(12, 12, &[0.0, 0.0, 1000.0, 1000.0]).is_some());
    }

    #[test]
    fn prepare_flags_tables_and_forced_images() {
        let page = DynamicImage::ImageRgba8(RgbaImage::from_pixel(400, 400, Rgba([0, 0, 0, 255])));
        let mut it = item("DIAGRAM_1", "P0_D0", Some([100.0, 100.0, 500.0, 500.0]), "Results Tabelle");
        it.output_type = Some("image".into());
        let asset = prepare_asset(&it, &page).unwrap().unwrap();
        assert!(asset.is_table);
        assert!(asset.force_image);
        assert_eq!(asset.safe_label, "Results_Tabelle");
        assert!(asset.base_name.starts_with("Results_Tabelle_"));
        assert_eq!(asset.base_name.len(), "Results_Tabelle_".len() + 4);
        assert_eq!(asset.marker(), "![Diagram: Results_Tabelle](pending:P0_D0)");

        let none = prepare_asset(&item("D", "P0_D1", None, "x"), &page).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn markers_replace_placeholders() {
        let page = DynamicImage::ImageRgba8(RgbaImage::from_pixel(400, 400, Rgba([0, 0, 0, 255])));
        let kept = item("DIAGRAM_1", "P1_D0", Some([100.0, 100.0, 500.0, 500.0]), "Graph");
        let mut skipped = item("DIAGRAM_2", "P1_D1", Some([100.0, 100.0, 500.0, 500.0]), "Old");
        skipped.skip = true;
        let failed = item("DIAGRAM_3", "P1_D2", None, "Bad");
        let forgotten = item("DIAGRAM_4", "P1_D3", Some([0.0, 0.0, 900.0, 900.0]), "Late");

        let mut pending = HashMap::new();
        for it in [&kept, &forgotten] {
            let a = prepare_asset(it, &page).unwrap().unwrap();
            pending.insert(a.temp_id.clone(), a);
        }

        let text = "A ***[DIAGRAM_1]*** B ***[DIAGRAM_2]*** C ***[DIAGRAM_3]***";
        let out = inject_markers(text, &[kept, skipped, failed, forgotten], &pending);
        assert!(out.contains("\n![Diagram: Graph](pending:P1_D0)\n"));
        assert!(!out.contains("DIAGRAM_2"));
        assert!(out.contains("> [!WARNING] Asset Prep Failed for DIAGRAM_3"));
        assert!(out.ends_with("\n![Diagram: Late](pending:P1_D3)\n"));
    }

    #[test]
    fn survivors_and_replacement() {
        let doc = "x ![Diagram: A](pending:P0_D0) y ![Keep](pending:P2_D1) ![Diagram: A](pending:P0_D0)";
        assert_eq!(surviving_ids(doc), vec!["P0_D0", "P2_D1"]);

        let doc = replace_pending(doc, "P0_D0", "Note/A_abcd.excalidraw");
        assert!(doc.contains("![Diagram: A](Note/A_abcd.excalidraw)"));
        assert!(!doc.contains("pending:P0_D0"));
        assert_eq!(drop_unresolved(&doc).matches("pending:").count(), 0);
        assert!(drop_unresolved(&doc).contains("Note/A_abcd.excalidraw"));
    }

    #[test]
    fn excalidraw_reply_parsing() {
        let fenced = "```json\n{\"elements\": [{\"type\": \"rectangle\"}], \"confidence\": 0.9}\n```";
        let d = parse_excalidraw(fenced).unwrap();
        assert!((confidence(&d) - 0.9).abs() < 1e-9);

        let chatty = "Sure! {\"elements\": []} hope that helps";
        let d = parse_excalidraw(chatty).unwrap();
        assert_eq!(confidence(&d), 1.0);

        assert!(parse_excalidraw("{\"type\": \"excalidraw\"}").is_none());
        assert!(parse_excalidraw("no json").is_none());

        let doc = excalidraw_document(&d);
        assert_eq!(doc["version"], 2);
        assert_eq!(doc["appState"]["viewBackgroundColor"], "#ffffff");
        assert!(doc["files"].as_object().unwrap().is_empty());
    }
}
