//! Post-processing: deterministic cleanup of model-generated Markdown.
//!
//! Applied to every page transcription and to the refined document. The
//! rules fix model quirks without touching content:
//!
//! 1. Strip outer markdown fences
//! 2. Normalise line endings (CRLF → LF)
//! 3. Trim trailing whitespace per line
//! 4. Collapse 3+ consecutive blank lines down to 2
//! 5. Blank line before headings
//! 6. Insert a missing GFM table separator row
//! 7. Drop mid-table separator rows
//! 8. Turn invented image links into italic captions
//! 9. Strip invisible Unicode
//! 10. Exactly one final newline
//!
//! Rule 8 never touches `pending:` markers or relative references to files
//! inside the bundle: those are the pipeline's own links.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules in order.
pub fn clean_markdown(input: &str) -> String {
    let s = strip_markdown_fences(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = normalise_heading_spacing(&s);
    let s = fix_broken_tables(&s);
    let s = remove_mid_table_separators(&s);
    let s = remove_hallucinated_images(&s);
    let s = remove_invisible_chars(&s);
    ensure_final_newline(&s)
}

// ── Rule 1 ───────────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?\n(.*)\n```\s*$").expect("static regex"));

fn strip_markdown_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rules 2–4 ────────────────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn trim_trailing_whitespace(input: &str) -> String {
    input.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").expect("static regex"));

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").into_owned()
}

// ── Rule 5 ───────────────────────────────────────────────────────────────

static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,6} ").expect("static regex"));

fn normalise_heading_spacing(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 64);
    for (i, line) in input.lines().enumerate() {
        if i > 0 && RE_HEADING.is_match(line) {
            let kept = out.trim_end_matches('\n').len();
            out.truncate(kept);
            out.push_str("\n\n");
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

// ── Rules 6–7: tables ────────────────────────────────────────────────────

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.contains('-') && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

/// Insert a separator after a header row that lacks one. Only the first row
/// of a table block is considered a header.
fn fix_broken_tables(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 4);
    let mut prev_was_table = false;

    for (i, line) in lines.iter().enumerate() {
        out.push((*line).to_string());
        let is_row = is_table_row(line);
        if is_row && !prev_was_table && !is_separator_row(line) {
            let next = lines.get(i + 1).copied().unwrap_or("");
            if is_table_row(next) && !is_separator_row(next) {
                let cols = line.trim().matches('|').count().saturating_sub(1).max(1);
                let mut sep = String::from("|");
                for _ in 0..cols {
                    sep.push_str(" --- |");
                }
                out.push(sep);
            }
        }
        prev_was_table = is_row;
    }
    out.join("\n")
}

fn remove_mid_table_separators(input: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut row = 0usize;
    for line in input.lines() {
        if is_table_row(line) {
            row += 1;
            if is_separator_row(line) && row != 2 {
                continue;
            }
        } else {
            row = 0;
        }
        out.push(line);
    }
    out.join("\n")
}

// ── Rule 8: invented image links ─────────────────────────────────────────

static RE_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").expect("static regex"));

const FAKE_DOMAINS: [&str; 7] = [
    "example.com",
    "placeholder.com",
    "via.placeholder.com",
    "dummyimage.com",
    "lorempixel.com",
    "picsum.photos",
    "placehold.it",
];

/// Links the pipeline writes itself: pending markers, bundle-local drawings
/// and rasters.
fn is_pipeline_link(url: &str) -> bool {
    url.starts_with("pending:")
        || url.ends_with(".excalidraw")
        || (url.ends_with(".png") && !url.contains("://") && url.contains('_'))
}

fn is_invented_url(url: &str) -> bool {
    let u = url.trim();
    if u.is_empty() {
        return true;
    }
    if is_pipeline_link(u) {
        return false;
    }
    if !u.starts_with("http://") && !u.starts_with("https://") {
        return true;
    }
    FAKE_DOMAINS.iter().any(|d| u.contains(d))
}

fn remove_hallucinated_images(input: &str) -> String {
    RE_IMAGE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let alt = caps[1].trim();
            if !is_invented_url(&caps[2]) {
                caps[0].to_string()
            } else if alt.is_empty() {
                String::new()
            } else {
                format!("*{alt}*")
            }
        })
        .into_owned()
}

// ── Rules 9–10 ───────────────────────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'],
        "",
    )
}

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{trimmed}\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_outer_fences() {
        assert_eq!(strip_markdown_fences("```markdown\n# A\nb\n```"), "# A\nb");
        assert_eq!(strip_markdown_fences("```\n# A\n```"), "# A");
        assert_eq!(strip_markdown_fences("# A"), "# A");
    }

    #[test]
    fn whitespace_rules() {
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
        assert_eq!(trim_trailing_whitespace("  a   \nb  "), "  a\nb");
        assert_eq!(collapse_blank_lines("a\n\n\n\n\n\nb"), "a\n\n\nb");
        assert_eq!(ensure_final_newline("x\n\n\n"), "x\n");
        assert_eq!(ensure_final_newline(""), "\n");
    }

    #[test]
    fn heading_gets_blank_line() {
        let out = normalise_heading_spacing("text\n## Section\nmore");
        assert!(out.contains("text\n\n## Section\n"));
        let out = normalise_heading_spacing("text\n#hashtag");
        assert!(out.contains("text\n#hashtag"));
    }

    #[test]
    fn broken_table_gets_separator() {
        let out = fix_broken_tables("| A | B |\n| 1 | 2 |\n| 3 | 4 |");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(is_separator_row(lines[1]));
        assert!(!is_separator_row(lines[3]));
    }

    #[test]
    fn mid_table_separator_dropped() {
        let out = remove_mid_table_separators("| A |\n| --- |\n| 1 |\n| --- |\n| 2 |");
        assert_eq!(out, "| A |\n| --- |\n| 1 |\n| 2 |");
    }

    #[test]
    fn invented_images_become_captions() {
        let out = remove_hallucinated_images("![Chart](chart.png) ![x](https://example.com/a.png)");
        assert_eq!(out, "*Chart* *x*");
        let out = remove_hallucinated_images("![](image-url)");
        assert_eq!(out, "");
    }

    #[test]
    fn pipeline_links_survive() {
        let md = "![Diagram: Graph](pending:P0_D0)\n![Graph](Lecture/Graph_ab12.excalidraw)\n![T](Table_x9Zq.png)";
        assert_eq!(remove_hallucinated_images(md), md);
        let real = "![Figure](https://arxiv.org/fig1.png)";
        assert_eq!(remove_hallucinated_images(real), real);
    }

    #[test]
    fn placeholders_and_pending_markers_pass_the_full_chain() {
        let md = "# Title\r\n\r\nText  \r\n***[DIAGRAM_1]***\r\n![Diagram: A](pending:P1_D0)\u{200B}";
        let out = clean_markdown(md);
        assert!(out.contains("***[DIAGRAM_1]***"));
        assert!(out.contains("![Diagram: A](pending:P1_D0)"));
        assert!(!out.contains('\r'));
        assert!(out.ends_with(")\n"));
    }
}
