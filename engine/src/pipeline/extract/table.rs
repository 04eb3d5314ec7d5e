use async_trait::async_trait;
use lopdf::{Object, content::Content};

use crate::{
    error::PipelineError,
    pipeline::{
        extract::TextExtractor,
        types::{DocumentChunk, ExtractionMethod},
    },
};

/// Table-aware extraction. Walks the page content stream tracking text
/// positions, groups fragments into rows by their y coordinate and orders
/// them by x, so columnar label/value layouts survive as separable lines.
pub struct TableAwareExtractor;

struct Fragment {
    x: f32,
    y: f32,
    text: String,
}

#[async_trait]
impl TextExtractor for TableAwareExtractor {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::TableAware
    }

    async fn extract_page(
        &self,
        chunk: &DocumentChunk,
        page: u32,
    ) -> Result<String, PipelineError> {
        let pages = chunk.doc.get_pages();
        let page_id = pages
            .get(&page)
            .copied()
            .ok_or_else(|| PipelineError::Extraction(format!("page {page} not found")))?;

        let content_bytes = chunk
            .doc
            .get_page_content(page_id)
            .map_err(|err| PipelineError::Extraction(format!("page {page} content: {err}")))?;
        let content = Content::decode(&content_bytes)
            .map_err(|err| PipelineError::Extraction(format!("page {page} decode: {err}")))?;

        Ok(assemble_rows(collect_fragments(&content)))
    }
}

fn collect_fragments(content: &Content) -> Vec<Fragment> {
    let mut fragments = Vec::new();
    let mut x = 0.0f32;
    let mut y = 0.0f32;
    // Line start for T* and TD leading tracking.
    let mut line_x = 0.0f32;
    let mut leading = 12.0f32;

    for op in &content.operations {
        match op.operator.as_str() {
            "Tm" => {
                if op.operands.len() == 6 {
                    x = to_f32(&op.operands[4]);
                    y = to_f32(&op.operands[5]);
                    line_x = x;
                }
            }
            "Td" => {
                if op.operands.len() == 2 {
                    line_x += to_f32(&op.operands[0]);
                    y += to_f32(&op.operands[1]);
                    x = line_x;
                }
            }
            "TD" => {
                if op.operands.len() == 2 {
                    line_x += to_f32(&op.operands[0]);
                    let dy = to_f32(&op.operands[1]);
                    leading = -dy;
                    y += dy;
                    x = line_x;
                }
            }
            "TL" => {
                if let Some(v) = op.operands.first() {
                    leading = to_f32(v);
                }
            }
            "T*" => {
                y -= leading;
                x = line_x;
            }
            "Tj" | "'" => {
                if let Some(text) = op.operands.iter().find_map(decode_string) {
                    let advance = text.chars().count() as f32 * 6.0;
                    fragments.push(Fragment { x, y, text });
                    x += advance;
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = op.operands.first() {
                    let mut text = String::new();
                    for item in items {
                        if let Some(part) = decode_string(item) {
                            text.push_str(&part);
                        }
                    }
                    if !text.is_empty() {
                        let advance = text.chars().count() as f32 * 6.0;
                        fragments.push(Fragment { x, y, text });
                        x += advance;
                    }
                }
            }
            _ => {}
        }
    }

    fragments
}

/// Buckets fragments into rows (y within half a line height) and joins each
/// row left to right, widening the gap between distant columns so that
/// `label   value` pairs keep their boundary.
fn assemble_rows(mut fragments: Vec<Fragment>) -> String {
    if fragments.is_empty() {
        return String::new();
    }

    fragments.sort_by(|a, b| {
        b.y.partial_cmp(&a.y)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.x.partial_cmp(&b.x).unwrap_or(std::cmp::Ordering::Equal))
    });

    let mut rows: Vec<Vec<Fragment>> = Vec::new();
    for frag in fragments {
        match rows.last_mut() {
            Some(row) if (row[0].y - frag.y).abs() < 6.0 => row.push(frag),
            _ => rows.push(vec![frag]),
        }
    }

    let mut out = String::new();
    for row in rows {
        let mut line = String::new();
        let mut last_end = None::<f32>;
        for frag in row {
            if let Some(end) = last_end {
                let gap = frag.x - end;
                line.push_str(if gap > 24.0 { "    " } else { " " });
            }
            last_end = Some(frag.x + frag.text.chars().count() as f32 * 6.0);
            line.push_str(frag.text.trim_end());
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }

    out
}

fn decode_string(obj: &Object) -> Option<String> {
    match obj {
        Object::String(bytes, _) => Some(String::from_utf8_lossy(bytes).into_owned()),
        _ => None,
    }
}

fn to_f32(obj: &Object) -> f32 {
    match obj {
        Object::Integer(v) => *v as f32,
        Object::Real(v) => *v as f32,
        _ => 0.0,
    }
}
