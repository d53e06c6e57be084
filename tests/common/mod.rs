//! Test doubles shared by the integration tests.
//!
//! * [`FakeRenderer`] draws every page as a uniform image whose red channel
//!   is the page index, so a model double can tell pages (and crops taken
//!   from them) apart.
//! * [`ScriptedModel`] answers by prompt kind: analysis replies per page,
//!   one Excalidraw reply, and a refinement reply.

#![allow(dead_code)]

use async_trait::async_trait;
use image::{DynamicImage, Rgba, RgbaImage};
use noteforge::{ForgeError, ModelError, ModelReply, ModelRequest, PageRenderer, RenderOptions, VisionModel};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const PAGE_SIDE: u32 = 400;

pub struct FakeRenderer {
    pub pages: usize,
    pub renders: AtomicUsize,
}

impl FakeRenderer {
    pub fn new(pages: usize) -> Self {
        Self {
            pages,
            renders: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PageRenderer for FakeRenderer {
    async fn page_count(&self, _path: &Path) -> Result<usize, ForgeError> {
        Ok(self.pages)
    }

    async fn render_page(
        &self,
        _path: &Path,
        page_idx: usize,
        _opts: RenderOptions,
    ) -> Result<DynamicImage, ForgeError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        let px = Rgba([page_idx as u8, 10, 20, 255]);
        Ok(DynamicImage::ImageRgba8(RgbaImage::from_pixel(PAGE_SIDE, PAGE_SIDE, px)))
    }
}

/// Page index encoded in a request's image, if any.
pub fn page_of(request: &ModelRequest) -> Option<usize> {
    let png = request.image_png.as_deref()?;
    let img = image::load_from_memory(png).ok()?.to_rgba8();
    Some(img.get_pixel(0, 0)[0] as usize)
}

#[derive(Default)]
pub struct ScriptedModel {
    /// Analysis reply per page; a missing page answers with a fatal error.
    pub pages: HashMap<usize, String>,
    /// Excalidraw reply; `None` answers with a fatal error.
    pub drawing: Option<String>,
    /// Refinement reply; `None` answers with a fatal error.
    pub refined: Option<String>,
    pub analysis_calls: AtomicUsize,
    pub drawing_calls: AtomicUsize,
    pub refine_calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
    /// Credential carried by each request, in call order.
    pub keys: Mutex<Vec<String>>,
    /// Simulated service time per call.
    pub latency: Duration,
}

impl ScriptedModel {
    pub fn total_calls(&self) -> usize {
        self.analysis_calls.load(Ordering::SeqCst)
            + self.drawing_calls.load(Ordering::SeqCst)
            + self.refine_calls.load(Ordering::SeqCst)
    }
}

fn reply(text: &str) -> Result<ModelReply, ModelError> {
    Ok(ModelReply {
        text: text.to_string(),
        input_tokens: 100,
        output_tokens: 20,
    })
}

fn rejected() -> Result<ModelReply, ModelError> {
    Err(ModelError::new(Some(400), "invalid request"))
}

#[async_trait]
impl VisionModel for ScriptedModel {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelReply, ModelError> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        self.keys.lock().unwrap().push(request.api_key.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if request.prompt.contains("STRICT TECHNICAL REQUIREMENTS") {
            self.drawing_calls.fetch_add(1, Ordering::SeqCst);
            return match &self.drawing {
                Some(t) => reply(t),
                None => rejected(),
            };
        }
        if request.prompt.contains("VISUAL ELEMENT DETECTION") {
            self.analysis_calls.fetch_add(1, Ordering::SeqCst);
            let page = page_of(request).unwrap_or(usize::MAX);
            return match self.pages.get(&page) {
                Some(t) => reply(t),
                None => rejected(),
            };
        }
        self.refine_calls.fetch_add(1, Ordering::SeqCst);
        match &self.refined {
            Some(t) => reply(t),
            None => rejected(),
        }
    }
}

/// A delimited analysis reply with one diagram.
pub fn analysis_reply(label: &str, box_2d: [u32; 4], summary: &str, markdown: &str) -> String {
    format!(
        "===DIAGRAMS_START===\n{{\"diagrams\":[{{\"box_2d\":[{},{},{},{}],\"label\":\"{label}\",\"id\":\"DIAGRAM_1\",\"visual_summary\":\"{summary}\"}}]}}\n===DIAGRAMS_END===\n===MARKDOWN_START===\n{markdown}\n===MARKDOWN_END===",
        box_2d[0], box_2d[1], box_2d[2], box_2d[3]
    )
}

/// A plain page with no diagrams.
pub fn text_reply(markdown: &str) -> String {
    format!("===DIAGRAMS_START===\n{{\"diagrams\":[]}}\n===DIAGRAMS_END===\n===MARKDOWN_START===\n{markdown}\n===MARKDOWN_END===")
}

pub fn drawing_reply(confidence: f64) -> String {
    format!(
        r#"{{"type":"excalidraw","elements":[{{"type":"rectangle","x":0,"y":0,"width":10,"height":10}}],"confidence":{confidence}}}"#
    )
}

/// Write a file that passes the PDF magic check.
pub fn write_pdf_stub(path: &Path) -> PathBuf {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).unwrap();
    }
    std::fs::write(path, b"%PDF-1.7\n%stub\n").unwrap();
    path.to_path_buf()
}

/// Names and bytes of every entry in an archive.
pub fn read_zip(path: &Path) -> HashMap<String, Vec<u8>> {
    use std::io::Read;
    let file = std::fs::File::open(path).unwrap();
    let mut zip = zip::ZipArchive::new(file).unwrap();
    let mut out = HashMap::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).unwrap();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).unwrap();
        out.insert(entry.name().to_string(), bytes);
    }
    out
}
