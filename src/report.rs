//! Stats document to PDF.
//!
//! The report is a minimal PDF 1.4 file using the standard Helvetica fonts,
//! so no font data is embedded. Output carries no creation date or random
//! document id: the same stats document always renders to the same bytes.

use std::fmt::Write as _;

use crate::stats::StatsDocument;

const PAGE_WIDTH: f32 = 595.0;
const PAGE_HEIGHT: f32 = 842.0;
const MARGIN: f32 = 56.0;
const BODY_SIZE: f32 = 12.0;
const HEADING_SIZE: f32 = 14.0;
const TITLE_SIZE: f32 = 18.0;
const LINE_ADVANCE: f32 = 1.6;
const RULE: &str = "---------------------------";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportOptions {
    pub title: String,
    pub organization: String,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            title: "Object Detection Report".to_string(),
            organization: "INCLUSIVE GROUP".to_string(),
        }
    }
}

pub fn report_filename(file_id: &str) -> String {
    format!("report_{file_id}.pdf")
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Style {
    Title,
    Heading,
    Body,
}

impl Style {
    fn font(self) -> &'static str {
        match self {
            Style::Title | Style::Heading => "F2",
            Style::Body => "F1",
        }
    }

    fn size(self) -> f32 {
        match self {
            Style::Title => TITLE_SIZE,
            Style::Heading => HEADING_SIZE,
            Style::Body => BODY_SIZE,
        }
    }
}

/// Renders the three report sections for `doc`.
pub fn render_report(doc: &StatsDocument, options: &ReportOptions) -> Vec<u8> {
    let mut lines: Vec<(Style, String)> = vec![
        (Style::Title, options.title.clone()),
        (Style::Heading, options.organization.clone()),
        (Style::Body, format!("Video: {}", doc.file_id)),
        (Style::Body, format!("Frames analyzed: {}", doc.frames_processed)),
        (Style::Body, String::new()),
    ];

    section(
        &mut lines,
        "General Statistics",
        doc.stats
            .detections_by_class
            .iter()
            .map(|(label, count)| format!("{label}: {count} detections")),
        "No detections recorded.",
    );
    section(
        &mut lines,
        "Errors Detected",
        doc.stats
            .errors
            .iter()
            .map(|(label, count)| format!("{label}: {count} errors")),
        "No errors recorded.",
    );
    section(
        &mut lines,
        "Error Details",
        doc.error_times.iter().map(|alert| {
            format!(
                "{} with {:.2} confidence at second {:.2}",
                alert.label(),
                alert.confidence(),
                alert.timestamp_s()
            )
        }),
        "No alerts recorded.",
    );

    let pages = paginate(&lines);
    assemble(&pages)
}

fn section(
    lines: &mut Vec<(Style, String)>,
    heading: &str,
    rows: impl Iterator<Item = String>,
    empty: &str,
) {
    lines.push((Style::Heading, heading.to_string()));
    lines.push((Style::Body, RULE.to_string()));
    let before = lines.len();
    lines.extend(rows.map(|row| (Style::Body, row)));
    if lines.len() == before {
        lines.push((Style::Body, empty.to_string()));
    }
    lines.push((Style::Body, String::new()));
}

/// Lays lines out top to bottom, breaking to a new page at the bottom margin.
/// Returns one content stream per page.
fn paginate(lines: &[(Style, String)]) -> Vec<String> {
    let mut pages = Vec::new();
    let mut content = String::new();
    let mut y = PAGE_HEIGHT - MARGIN;

    for (style, text) in lines {
        let advance = style.size() * LINE_ADVANCE;
        if y - advance < MARGIN {
            pages.push(std::mem::take(&mut content));
            y = PAGE_HEIGHT - MARGIN;
        }
        y -= advance;
        if text.is_empty() {
            continue;
        }
        let _ = writeln!(
            content,
            "BT /{} {} Tf {} {} Td ({}) Tj ET",
            style.font(),
            fmt_num(style.size()),
            fmt_num(MARGIN),
            fmt_num(y),
            escape_text(text)
        );
    }
    pages.push(content);
    pages
}

fn assemble(pages: &[String]) -> Vec<u8> {
    // 1 catalog, 2 page tree, 3-4 fonts, then a (page, content) pair per page.
    let page_ids: Vec<usize> = (0..pages.len()).map(|i| 5 + i * 2).collect();
    let mut objects: Vec<Vec<u8>> = Vec::with_capacity(4 + pages.len() * 2);

    objects.push(b"<< /Type /Catalog /Pages 2 0 R >>".to_vec());
    let kids = page_ids
        .iter()
        .map(|id| format!("{id} 0 R"))
        .collect::<Vec<_>>()
        .join(" ");
    objects.push(
        format!(
            "<< /Type /Pages /Kids [{}] /Count {} >>",
            kids,
            pages.len()
        )
        .into_bytes(),
    );
    objects.push(
        b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>"
            .to_vec(),
    );
    objects.push(
        b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica-Bold /Encoding /WinAnsiEncoding >>"
            .to_vec(),
    );
    for (page, content) in page_ids.iter().zip(pages) {
        objects.push(
            format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {} {}] \
                 /Resources << /Font << /F1 3 0 R /F2 4 0 R >> >> /Contents {} 0 R >>",
                fmt_num(PAGE_WIDTH),
                fmt_num(PAGE_HEIGHT),
                page + 1
            )
            .into_bytes(),
        );
        let stream = encode_win_ansi(content);
        let mut obj = format!("<< /Length {} >>\nstream\n", stream.len()).into_bytes();
        obj.extend_from_slice(&stream);
        obj.extend_from_slice(b"\nendstream");
        objects.push(obj);
    }

    let mut out: Vec<u8> = b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n".to_vec();
    let mut offsets = Vec::with_capacity(objects.len());
    for (idx, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n", idx + 1).as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\nendobj\n");
    }

    let xref_at = out.len();
    let mut xref = format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1);
    for offset in offsets {
        let _ = write!(xref, "{offset:010} 00000 n \n");
    }
    let _ = write!(
        xref,
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
        objects.len() + 1,
        xref_at
    );
    out.extend_from_slice(xref.as_bytes());
    out
}

fn fmt_num(value: f32) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    if rounded.fract() == 0.0 {
        format!("{}", rounded as i64)
    } else {
        format!("{rounded:.2}")
    }
}

fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '(' | ')' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            '\n' | '\r' | '\t' => out.push(' '),
            _ => out.push(ch),
        }
    }
    out
}

/// Latin-1 characters map 1:1 onto WinAnsi; anything else becomes `?`.
fn encode_win_ansi(content: &str) -> Vec<u8> {
    content
        .chars()
        .map(|ch| match u32::from(ch) {
            code @ 0..=0x7F => code as u8,
            code @ 0xA0..=0xFF => code as u8,
            _ => b'?',
        })
        .collect()
}
