//! Phase 2: build-up slide deduplication.
//!
//! Lecture decks often reveal a diagram step by step over consecutive
//! slides. When a diagram on page N sits in the same place as one on page
//! N+1 and (if both carry a summary) describes the same thing, the earlier,
//! less complete one is skipped.

use crate::pipeline::analyze::DiagramItem;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use tracing::info;

static RE_NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\W+").expect("static regex"));

/// Duplicate thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupThresholds {
    /// IoU must be strictly greater than this.
    pub iou: f32,
    /// Summary token similarity must be at least this.
    pub summary: f32,
}

impl Default for DedupThresholds {
    fn default() -> Self {
        Self {
            iou: 0.6,
            summary: 0.3,
        }
    }
}

/// Intersection-over-union of two `[ymin, xmin, ymax, xmax]` boxes.
///
/// Returns 0 for degenerate input instead of NaN.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let [ay1, ax1, ay2, ax2] = *a;
    let [by1, bx1, by2, bx2] = *b;

    let ix = (ax2.min(bx2) - ax1.max(bx1)).max(0.0);
    let iy = (ay2.min(by2) - ay1.max(by1)).max(0.0);
    let inter = ix * iy;

    let area_a = (ax2 - ax1) * (ay2 - ay1);
    let area_b = (bx2 - bx1) * (by2 - by1);
    let union = area_a + area_b - inter;
    if union <= 0.0 || !union.is_finite() {
        return 0.0;
    }
    (inter / union).clamp(0.0, 1.0)
}

fn tokens(s: &str) -> HashSet<String> {
    RE_NON_WORD
        .split(&s.to_lowercase())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// `|A ∩ B| / max(|A|, |B|)` over lowercase word tokens. Two summaries with
/// no tokens at all count as similar.
pub fn token_similarity(a: &str, b: &str) -> f32 {
    let ta = tokens(a);
    let tb = tokens(b);
    let denom = ta.len().max(tb.len());
    if denom == 0 {
        return 1.0;
    }
    ta.intersection(&tb).count() as f32 / denom as f32
}

fn is_duplicate(cur: &DiagramItem, next: &DiagramItem, t: DedupThresholds) -> bool {
    let (Some(a), Some(b)) = (&cur.box_2d, &next.box_2d) else {
        return false;
    };
    if iou(a, b) <= t.iou {
        return false;
    }
    match (&cur.visual_summary, &next.visual_summary) {
        (Some(sa), Some(sb)) => token_similarity(sa, sb) >= t.summary,
        _ => true,
    }
}

/// Mark earlier diagrams of build-up sequences with `skip`.
///
/// `items` must be ordered by page. Each diagram is compared only with
/// diagrams on the immediately following page. Returns the number skipped.
pub fn mark_build_up_duplicates(items: &mut [DiagramItem], t: DedupThresholds) -> usize {
    let mut skipped = 0;
    for i in 0..items.len() {
        for j in (i + 1)..items.len() {
            let (cur_page, next_page) = (items[i].page_idx, items[j].page_idx);
            if next_page > cur_page + 1 {
                break;
            }
            if next_page == cur_page {
                continue;
            }
            if is_duplicate(&items[i], &items[j], t) {
                if !items[i].skip {
                    skipped += 1;
                    info!(
                        "Skipping build-up diagram on page {} (duplicate on page {})",
                        cur_page + 1,
                        next_page + 1
                    );
                }
                items[i].skip = true;
            }
        }
    }
    skipped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(page: usize, n: usize, b: [f32; 4], summary: Option<&str>) -> DiagramItem {
        DiagramItem {
            page_idx: page,
            box_2d: Some(b),
            label: "Graph".into(),
            id: format!("DIAGRAM_{}", n + 1),
            visual_summary: summary.map(str::to_string),
            output_type: None,
            temp_id: format!("P{page}_D{n}"),
            skip: false,
        }
    }

    #[test]
    fn iou_identity_disjoint_and_bounds() {
        let a = [100.0, 100.0, 500.0, 500.0];
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &[600.0, 600.0, 900.0, 900.0]), 0.0);
        let half = iou(&a, &[100.0, 300.0, 500.0, 700.0]);
        assert!(half > 0.0 && half < 1.0);
        assert!((half - 1.0 / 3.0).abs() < 1e-5);
        assert_eq!(iou(&[0.0; 4], &[0.0; 4]), 0.0);
    }

    #[test]
    fn similarity_is_case_and_punctuation_insensitive() {
        assert_eq!(token_similarity("Sine wave, amplitude", "sine WAVE amplitude!"), 1.0);
        assert_eq!(token_similarity("bar chart", "circuit diagram"), 0.0);
        assert!((token_similarity("a b c d", "a b") - 0.5).abs() < 1e-6);
    }

    #[test]
    fn consecutive_build_up_skips_earlier() {
        let b = [100.0, 100.0, 600.0, 900.0];
        let mut items = vec![
            item(0, 0, b, Some("supply and demand curves")),
            item(1, 0, [105.0, 100.0, 600.0, 905.0], Some("supply and demand curves with equilibrium")),
        ];
        assert_eq!(mark_build_up_duplicates(&mut items, DedupThresholds::default()), 1);
        assert!(items[0].skip);
        assert!(!items[1].skip);
    }

    #[test]
    fn different_summaries_are_kept() {
        let b = [100.0, 100.0, 600.0, 900.0];
        let mut items = vec![
            item(0, 0, b, Some("bar chart of revenue")),
            item(1, 0, b, Some("circuit with two resistors")),
        ];
        assert_eq!(mark_build_up_duplicates(&mut items, DedupThresholds::default()), 0);
    }

    #[test]
    fn only_adjacent_pages_are_compared() {
        let b = [100.0, 100.0, 600.0, 900.0];
        let mut items = vec![item(0, 0, b, None), item(0, 1, b, None), item(2, 0, b, None)];
        mark_build_up_duplicates(&mut items, DedupThresholds::default());
        assert!(items.iter().all(|i| !i.skip));
    }

    #[test]
    fn missing_box_is_never_a_duplicate() {
        let b = [100.0, 100.0, 600.0, 900.0];
        let mut a = item(0, 0, b, None);
        a.box_2d = None;
        let mut items = vec![a, item(1, 0, b, None)];
        assert_eq!(mark_build_up_duplicates(&mut items, DedupThresholds::default()), 0);
    }

    #[test]
    fn custom_thresholds_apply() {
        let mut items = vec![
            item(0, 0, [100.0, 100.0, 500.0, 500.0], None),
            item(1, 0, [100.0, 300.0, 500.0, 700.0], None),
        ];
        assert_eq!(mark_build_up_duplicates(&mut items, DedupThresholds::default()), 0);
        let loose = DedupThresholds { iou: 0.2, summary: 0.3 };
        assert_eq!(mark_build_up_duplicates(&mut items, loose), 1);
    }
}
