//! The one-page analysis PDF.

use image::{codecs::jpeg::JpegEncoder, imageops::FilterType};
use lopdf::{
    Dictionary, Document, Object, ObjectId, Stream, StringFormat,
    content::{Content, Operation},
    dictionary,
};

use crate::{data_url::ImagePayload, prelude::*};

use super::{ReportInput, format_date};

/// A4, in points.
const PAGE_W: f32 = 595.0;
const PAGE_H: f32 = 842.0;
const MARGIN: f32 = 40.0;
const CONTENT_W: f32 = PAGE_W - 2.0 * MARGIN;
/// Leave room for the footer.
const BOTTOM: f32 = PAGE_H - 70.0;

/// Most photos we put on the page.
const MAX_PHOTOS: usize = 4;
/// Longest side of an embedded photo, in pixels.
const MAX_PHOTO_PX: u32 = 1600;

/// A Korean font every PDF reader ships, so we don't embed one.
const FONT_NAME: &str = "HYGoThic-Medium";

type Rgb = (f32, f32, f32);

const SLATE_900: Rgb = (0.059, 0.090, 0.165);
const SLATE_700: Rgb = (0.200, 0.255, 0.333);
const SLATE_500: Rgb = (0.392, 0.455, 0.545);
const SLATE_400: Rgb = (0.580, 0.639, 0.722);
const SLATE_200: Rgb = (0.886, 0.910, 0.941);
const SLATE_100: Rgb = (0.945, 0.961, 0.976);
const SLATE_50: Rgb = (0.973, 0.980, 0.988);
const INDIGO_600: Rgb = (0.310, 0.275, 0.898);
const INDIGO_500: Rgb = (0.388, 0.400, 0.945);

/// Approximate advance width: ASCII is half-width, everything else full.
fn text_width(text: &str, size: f32) -> f32 {
    text.chars()
        .map(|c| if c.is_ascii() { 0.5 } else { 1.0 })
        .sum::<f32>()
        * size
}

/// Encode text as big-endian UCS-2 for the `UniKS-UCS2-H` CMap.
fn ucs2(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if u32::from(c) > 0xFFFF { '?' } else { c })
        .flat_map(|c| {
            let mut units = [0u16; 2];
            let unit = c.encode_utf16(&mut units)[0];
            unit.to_be_bytes()
        })
        .collect()
}

/// Greedy word wrap. Words too long for a line are split by character.
fn wrap(text: &str, size: f32, width: f32) -> Vec<String> {
    let mut lines = vec![];
    for paragraph in text.lines() {
        let mut line = String::new();
        for word in paragraph.split_whitespace() {
            let candidate = if line.is_empty() {
                word.to_owned()
            } else {
                format!("{line} {word}")
            };
            if text_width(&candidate, size) <= width {
                line = candidate;
                continue;
            }
            if !line.is_empty() {
                lines.push(std::mem::take(&mut line));
            }
            for c in word.chars() {
                line.push(c);
                if text_width(&line, size) > width {
                    line.pop();
                    lines.push(std::mem::take(&mut line));
                    line.push(c);
                }
            }
        }
        lines.push(line);
    }
    lines
}

/// Re-encode a photo as a baseline RGB JPEG that any reader can show.
fn to_pdf_jpeg(image: &ImagePayload) -> Result<(Vec<u8>, u32, u32)> {
    let mut decoded =
        image::load_from_memory(&image.data).context("Could not decode photo for PDF")?;
    if decoded.width() > MAX_PHOTO_PX || decoded.height() > MAX_PHOTO_PX {
        decoded = decoded.resize(MAX_PHOTO_PX, MAX_PHOTO_PX, FilterType::Triangle);
    }
    let rgb = decoded.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, 85)
        .encode_image(&rgb)
        .context("Could not encode photo for PDF")?;
    Ok((jpeg, rgb.width(), rgb.height()))
}

/// Drawing operations, with `y` measured down from the top of the page.
#[derive(Default)]
struct Canvas {
    ops: Vec<Operation>,
}

impl Canvas {
    fn fill_color(&mut self, (r, g, b): Rgb) {
        self.ops
            .push(Operation::new("rg", vec![r.into(), g.into(), b.into()]));
    }

    fn rect(&mut self, x: f32, y: f32, w: f32, h: f32, color: Rgb) {
        self.fill_color(color);
        self.ops.push(Operation::new(
            "re",
            vec![x.into(), (PAGE_H - y - h).into(), w.into(), h.into()],
        ));
        self.ops.push(Operation::new("f", vec![]));
    }

    fn hline(&mut self, x: f32, y: f32, w: f32, (r, g, b): Rgb) {
        let y = PAGE_H - y;
        self.ops
            .push(Operation::new("RG", vec![r.into(), g.into(), b.into()]));
        self.ops.push(Operation::new("w", vec![0.75f32.into()]));
        self.ops.push(Operation::new("m", vec![x.into(), y.into()]));
        self.ops
            .push(Operation::new("l", vec![(x + w).into(), y.into()]));
        self.ops.push(Operation::new("S", vec![]));
    }

    /// Draw text with its baseline at `y`.
    fn text(&mut self, x: f32, y: f32, size: f32, color: Rgb, text: &str) {
        self.fill_color(color);
        self.ops.push(Operation::new("BT", vec![]));
        self.ops
            .push(Operation::new("Tf", vec!["F1".into(), size.into()]));
        self.ops
            .push(Operation::new("Td", vec![x.into(), (PAGE_H - y).into()]));
        self.ops.push(Operation::new(
            "Tj",
            vec![Object::String(ucs2(text), StringFormat::Hexadecimal)],
        ));
        self.ops.push(Operation::new("ET", vec![]));
    }

    fn image(&mut self, name: &str, x: f32, y: f32, w: f32, h: f32) {
        self.ops.push(Operation::new("q", vec![]));
        self.ops.push(Operation::new(
            "cm",
            vec![
                w.into(),
                0f32.into(),
                0f32.into(),
                h.into(),
                x.into(),
                (PAGE_H - y - h).into(),
            ],
        ));
        self.ops.push(Operation::new("Do", vec![Object::Name(name.into())]));
        self.ops.push(Operation::new("Q", vec![]));
    }

    fn section_title(&mut self, y: f32, title: &str) {
        self.rect(MARGIN, y, 3.0, 13.0, INDIGO_600);
        self.text(MARGIN + 8.0, y + 10.5, 11.0, SLATE_700, title);
    }
}

/// Add the font objects and return the Type0 font's ID.
fn add_font(doc: &mut Document) -> ObjectId {
    let descriptor_id = doc.add_object(dictionary! {
        "Type" => "FontDescriptor",
        "FontName" => FONT_NAME,
        "Flags" => 4,
        "FontBBox" => vec![(-6).into(), (-145).into(), 1003.into(), 880.into()],
        "ItalicAngle" => 0,
        "Ascent" => 880,
        "Descent" => -120,
        "CapHeight" => 880,
        "StemV" => 93,
    });
    let cid_font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "CIDFontType0",
        "BaseFont" => FONT_NAME,
        "CIDSystemInfo" => dictionary! {
            "Registry" => Object::string_literal("Adobe"),
            "Ordering" => Object::string_literal("Korea1"),
            "Supplement" => 1,
        },
        "FontDescriptor" => descriptor_id,
        "DW" => 1000,
        // Half-width Latin.
        "W" => vec![1.into(), 95.into(), 500.into()],
    });
    doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type0",
        "BaseFont" => FONT_NAME,
        "Encoding" => "UniKS-UCS2-H",
        "DescendantFonts" => vec![cid_font_id.into()],
    })
}

fn header(canvas: &mut Canvas, input: &ReportInput) -> f32 {
    canvas.text(MARGIN, 52.0, 9.0, SLATE_500, "AdMate Vision AI Analysis");
    canvas.text(MARGIN, 72.0, 16.0, SLATE_900, "광고 성과 & 인사이트 리포트");
    let date = format_date(&input.date_str, ".");
    canvas.text(
        PAGE_W - MARGIN - text_width(&date, 9.0),
        72.0,
        9.0,
        SLATE_500,
        &date,
    );
    canvas.hline(MARGIN, 84.0, CONTENT_W, SLATE_200);
    104.0
}

fn kpi_boxes(canvas: &mut Canvas, input: &ReportInput, y: f32) -> f32 {
    let total = input
        .analysis
        .as_ref()
        .map(|a| a.metrics.total_exposure)
        .filter(|t| *t > 0)
        .or_else(|| input.exposure.as_ref().map(|e| e.total_exposure))
        .filter(|t| *t > 0)
        .map_or_else(|| "-명".to_owned(), |t| format!("{:.1}만명", t as f64 / 10_000.0));
    let score = input
        .analysis
        .as_ref()
        .map_or_else(|| "-점".to_owned(), |a| format!("{}점", a.metrics.score));
    let boxes = [
        ("광고주", input.advertiser_name.clone(), SLATE_900),
        ("위치", format!("{} ({})", input.station, input.line), SLATE_900),
        ("총 노출(추정)", total, SLATE_900),
        ("AdMate Score", score, INDIGO_600),
    ];
    let gap = 10.0;
    let w = (CONTENT_W - gap * 3.0) / 4.0;
    for (i, (label, value, color)) in boxes.iter().enumerate() {
        let x = MARGIN + (w + gap) * i as f32;
        canvas.rect(x, y, w, 40.0, SLATE_100);
        canvas.text(x + 8.0, y + 14.0, 7.0, SLATE_500, label);
        // Long values get cut to the box.
        let mut shown = value.clone();
        while text_width(&shown, 10.0) > w - 16.0 && shown.pop().is_some() {}
        canvas.text(x + 8.0, y + 31.0, 10.0, *color, &shown);
    }
    y + 60.0
}

fn analysis_text(canvas: &mut Canvas, text: &str, y: f32) -> f32 {
    let size = 9.0;
    let leading = 13.5;
    let mut lines = wrap(text, size, CONTENT_W - 16.0);
    // Keep room for the chart and photos.
    lines.truncate(16);
    canvas.section_title(y, "AI 분석 리포트");
    let card_y = y + 20.0;
    let card_h = lines.len() as f32 * leading + 12.0;
    canvas.rect(MARGIN, card_y, CONTENT_W, card_h, SLATE_50);
    for (i, line) in lines.iter().enumerate() {
        canvas.text(
            MARGIN + 8.0,
            card_y + 16.0 + leading * i as f32,
            size,
            SLATE_700,
            line,
        );
    }
    card_y + card_h + 20.0
}

fn traffic_chart(canvas: &mut Canvas, points: &[super::ChartPoint], y: f32) -> f32 {
    canvas.section_title(y, "시간대별 유동인구 추이");
    let top = y + 24.0;
    let height = 100.0;
    // Bars scale to the chart's own maximum.
    let max = points
        .iter()
        .map(|p| p.value)
        .fold(1.0f64, f64::max) as f32;
    let gap = 4.0;
    let bar_w = (CONTENT_W - gap * (points.len() as f32 - 1.0)) / points.len() as f32;
    for (i, point) in points.iter().enumerate() {
        let x = MARGIN + (bar_w + gap) * i as f32;
        let h = (point.value.max(0.0) as f32 / max) * height;
        canvas.rect(x, top + height - h, bar_w, h, INDIGO_500);
        let label_x = x + (bar_w - text_width(&point.label, 7.0)) / 2.0;
        canvas.text(label_x, top + height + 11.0, 7.0, SLATE_500, &point.label);
    }
    canvas.hline(MARGIN, top + height + 1.0, CONTENT_W, SLATE_400);
    top + height + 28.0
}

/// Returns the XObject names and IDs of the photos drawn.
fn photo_grid(
    canvas: &mut Canvas,
    doc: &mut Document,
    images: &[ImagePayload],
    y: f32,
) -> Vec<(String, ObjectId)> {
    let gap = 10.0;
    let cell_w = (CONTENT_W - gap) / 2.0;
    let cell_h = 150.0;
    if y + 20.0 + cell_h > BOTTOM {
        warn!("No room for photos in the analysis PDF");
        return vec![];
    }
    canvas.section_title(y, "현장 촬영 증빙");
    let mut xobjects = vec![];
    let mut slot = 0;
    for image in images.iter().take(MAX_PHOTOS) {
        let (jpeg, width, height) = match to_pdf_jpeg(image) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!("Skipping photo in PDF: {err:#}");
                continue;
            }
        };
        let cell_x = MARGIN + (cell_w + gap) * (slot % 2) as f32;
        let cell_y = y + 20.0 + (cell_h + gap) * (slot / 2) as f32;
        if cell_y + cell_h > BOTTOM {
            break;
        }
        canvas.rect(cell_x, cell_y, cell_w, cell_h, SLATE_100);

        // Fit inside the cell, keeping the aspect ratio.
        let scale = (cell_w / width as f32).min(cell_h / height as f32);
        let (w, h) = (width as f32 * scale, height as f32 * scale);
        let name = format!("Im{}", slot + 1);
        canvas.image(
            &name,
            cell_x + (cell_w - w) / 2.0,
            cell_y + (cell_h - h) / 2.0,
            w,
            h,
        );
        let id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => i64::from(width),
                "Height" => i64::from(height),
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            jpeg,
        ));
        xobjects.push((name, id));
        slot += 1;
    }
    xobjects
}

/// Render the analysis PDF.
#[instrument(level = "debug", skip_all, fields(advertiser = %input.advertiser_name))]
pub fn render_pdf(input: &ReportInput) -> Result<Vec<u8>> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = add_font(&mut doc);

    let mut canvas = Canvas::default();
    let mut y = header(&mut canvas, input);
    y = kpi_boxes(&mut canvas, input, y);
    if let Some(analysis) = &input.analysis {
        if !analysis.analysis_text.trim().is_empty() {
            y = analysis_text(&mut canvas, &analysis.analysis_text, y);
        }
        if !analysis.chart_data.is_empty() {
            y = traffic_chart(&mut canvas, &analysis.chart_data, y);
        }
    }
    let xobjects = if input.images.is_empty() {
        vec![]
    } else {
        photo_grid(&mut canvas, &mut doc, &input.images, y)
    };

    let footer = "© AdMate Vision. AI-Powered Advertisement Analysis System.";
    canvas.hline(MARGIN, PAGE_H - 45.0, CONTENT_W, SLATE_200);
    canvas.text(
        (PAGE_W - text_width(footer, 8.0)) / 2.0,
        PAGE_H - 30.0,
        8.0,
        SLATE_400,
        footer,
    );

    let content = Content { operations: canvas.ops };
    let content_id = doc.add_object(Stream::new(
        dictionary! {},
        content.encode().context("Could not encode PDF content")?,
    ));

    let mut xobject_dict = Dictionary::new();
    for (name, id) in &xobjects {
        xobject_dict.set(name.as_bytes().to_vec(), *id);
    }
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
        "XObject" => xobject_dict,
    });
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), PAGE_W.into(), PAGE_H.into()],
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).context("Could not write PDF")?;
    debug!(bytes = out.len(), photos = xobjects.len(), "Rendered PDF");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::tests::{bare_input, full_input};

    fn image_count(pdf: &[u8]) -> usize {
        let doc = Document::load_mem(pdf).unwrap();
        assert_eq!(doc.get_pages().len(), 1);
        doc.objects
            .values()
            .filter(|object| match object {
                Object::Stream(stream) => {
                    stream.dict.get(b"Subtype").and_then(Object::as_name).ok()
                        == Some(b"Image".as_slice())
                }
                _ => false,
            })
            .count()
    }

    #[test]
    fn test_full_pdf() {
        let pdf = render_pdf(&full_input()).unwrap();
        assert!(pdf.starts_with(b"%PDF-1.5"));
        assert_eq!(image_count(&pdf), 3);
    }

    #[test]
    fn test_bare_pdf() {
        let pdf = render_pdf(&bare_input()).unwrap();
        assert_eq!(image_count(&pdf), 0);
    }

    #[test]
    fn test_at_most_four_photos() {
        let mut input = full_input();
        let photo = input.images[0].clone();
        input.images = vec![photo; 6];
        // Drop the narrative so there's room for the whole grid.
        input.analysis = None;
        assert_eq!(image_count(&render_pdf(&input).unwrap()), 4);
    }

    #[test]
    fn test_bad_photo_is_skipped() {
        let mut input = bare_input();
        input.images = vec![ImagePayload::from_bytes(b"not an image".to_vec())];
        assert_eq!(image_count(&render_pdf(&input).unwrap()), 0);
    }

    #[test]
    fn test_wrap() {
        let lines = wrap("가나다 라마바 사아자", 10.0, 35.0);
        assert_eq!(lines, ["가나다", "라마바", "사아자"]);
        let lines = wrap("가나다라마바", 10.0, 20.0);
        assert_eq!(lines, ["가나", "다라", "마바"]);
        assert_eq!(wrap("a\nb", 10.0, 100.0), ["a", "b"]);
    }

    #[test]
    fn test_ucs2() {
        assert_eq!(ucs2("A가"), vec![0x00, 0x41, 0xAC, 0x00]);
        assert_eq!(ucs2("😀"), vec![0x00, 0x3F]);
    }
}
