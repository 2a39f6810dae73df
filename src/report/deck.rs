//! The exposure slide deck, written directly as Office Open XML.
//!
//! Slides: a cover, an exposure summary (table, bar chart and pie chart of
//! time bands, peak first), one slide per pair of photos, and a closing
//! contact slide. Charts are drawn with plain shapes so the deck has no
//! embedded workbooks.

use std::io::Cursor;

use crate::{capture::archive::build_zip, data_url::ImagePayload, prelude::*};

use super::{ReportInput, format_count, format_date, xml_escape};

const EMU_PER_INCH: f64 = 914_400.0;
const SLIDE_W: f64 = 13.333;
const SLIDE_H: f64 = 7.5;

/// DrawingML angles are in 60,000ths of a degree.
const ANGLE_UNIT: f64 = 60_000.0;

const INDIGO: &str = "4F46E5";
const INDIGO_LIGHT: &str = "A5B4FC";
const SLATE_900: &str = "0F172A";
const SLATE_600: &str = "475569";
const SLATE_100: &str = "F1F5F9";
const BORDER: &str = "CCCCCC";
const PIE_COLORS: &[&str] = &[
    "4F46E5", "0EA5E9", "10B981", "F59E0B", "EF4444", "8B5CF6", "EC4899", "64748B",
];

const NS: &str = r#"xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships" xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main""#;
const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;
const REL_NS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const PKG_REL_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";

fn emu(inches: f64) -> i64 {
    (inches * EMU_PER_INCH).round() as i64
}

/// A position and size, in inches.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Rect {
    x: f64,
    y: f64,
    w: f64,
    h: f64,
}

impl Rect {
    const fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    fn full_slide() -> Self {
        Self::new(0.0, 0.0, SLIDE_W, SLIDE_H)
    }

    /// The largest rectangle with the given aspect ratio, centered inside us.
    fn fit(self, width_px: u32, height_px: u32) -> Self {
        if width_px == 0 || height_px == 0 {
            return self;
        }
        let aspect = f64::from(width_px) / f64::from(height_px);
        let (w, h) = if self.w / self.h > aspect {
            (self.h * aspect, self.h)
        } else {
            (self.w, self.w / aspect)
        };
        Self::new(self.x + (self.w - w) / 2.0, self.y + (self.h - h) / 2.0, w, h)
    }

    fn xfrm(&self) -> String {
        format!(
            r#"<a:xfrm><a:off x="{}" y="{}"/><a:ext cx="{}" cy="{}"/></a:xfrm>"#,
            emu(self.x),
            emu(self.y),
            emu(self.w),
            emu(self.h)
        )
    }
}

#[derive(Clone, Copy, Debug)]
struct TextStyle {
    size_pt: u32,
    bold: bool,
    color: &'static str,
    centered: bool,
}

impl TextStyle {
    const fn new(size_pt: u32) -> Self {
        Self {
            size_pt,
            bold: false,
            color: SLATE_900,
            centered: false,
        }
    }

    const fn bold(mut self) -> Self {
        self.bold = true;
        self
    }

    const fn centered(mut self) -> Self {
        self.centered = true;
        self
    }

    const fn color(mut self, color: &'static str) -> Self {
        self.color = color;
        self
    }

    fn run(&self, text: &str) -> String {
        format!(
            r#"<a:r><a:rPr lang="ko-KR" sz="{}" b="{}" dirty="0"><a:solidFill><a:srgbClr val="{}"/></a:solidFill><a:ea typeface="Malgun Gothic"/></a:rPr><a:t>{}</a:t></a:r>"#,
            self.size_pt * 100,
            u8::from(self.bold),
            self.color,
            xml_escape(text)
        )
    }

    fn paragraphs(&self, text: &str) -> String {
        let align = if self.centered { "ctr" } else { "l" };
        text.split('\n')
            .map(|line| format!(r#"<a:p><a:pPr algn="{align}"/>{}</a:p>"#, self.run(line)))
            .collect()
    }
}

fn solid_fill(color: &str) -> String {
    format!(r#"<a:solidFill><a:srgbClr val="{color}"/></a:solidFill>"#)
}

/// One slide under construction.
#[derive(Debug, Default)]
struct Slide {
    shapes: String,
    shape_count: u32,
    /// Relationship targets for pictures. `rId1` is always the layout.
    images: Vec<String>,
}

impl Slide {
    fn next_id(&mut self) -> u32 {
        self.shape_count += 1;
        // ID 1 belongs to the shape tree itself.
        self.shape_count + 1
    }

    fn shape(&mut self, rect: Rect, geometry: &str, fill: Option<&str>, body: Option<String>) {
        let id = self.next_id();
        let fill = fill.map_or_else(|| "<a:noFill/>".to_owned(), solid_fill);
        let tx_box = if body.is_some() { r#" txBox="1""# } else { "" };
        let body = body
            .map(|paragraphs| {
                format!(
                    r#"<p:txBody><a:bodyPr wrap="square" rtlCol="0" anchor="ctr"><a:normAutofit/></a:bodyPr><a:lstStyle/>{paragraphs}</p:txBody>"#
                )
            })
            .unwrap_or_default();
        self.shapes.push_str(&format!(
            r#"<p:sp><p:nvSpPr><p:cNvPr id="{id}" name="Shape {id}"/><p:cNvSpPr{tx_box}/><p:nvPr/></p:nvSpPr><p:spPr>{}{geometry}{fill}<a:ln><a:noFill/></a:ln></p:spPr>{body}</p:sp>"#,
            rect.xfrm()
        ));
    }

    fn text(&mut self, rect: Rect, text: &str, style: TextStyle) {
        self.shape(
            rect,
            r#"<a:prstGeom prst="rect"><a:avLst/></a:prstGeom>"#,
            None,
            Some(style.paragraphs(text)),
        );
    }

    fn filled_rect(&mut self, rect: Rect, color: &str) {
        self.shape(
            rect,
            r#"<a:prstGeom prst="rect"><a:avLst/></a:prstGeom>"#,
            Some(color),
            None,
        );
    }

    fn ellipse(&mut self, rect: Rect, color: &str) {
        self.shape(
            rect,
            r#"<a:prstGeom prst="ellipse"><a:avLst/></a:prstGeom>"#,
            Some(color),
            None,
        );
    }

    /// A pie wedge. Angles are degrees clockwise from three o'clock.
    fn wedge(&mut self, rect: Rect, start_deg: f64, end_deg: f64, color: &str) {
        let start = (start_deg.rem_euclid(360.0) * ANGLE_UNIT).round() as i64;
        let end = (end_deg.rem_euclid(360.0) * ANGLE_UNIT).round() as i64;
        let geometry = format!(
            r#"<a:prstGeom prst="pie"><a:avLst><a:gd name="adj1" fmla="val {start}"/><a:gd name="adj2" fmla="val {end}"/></a:avLst></a:prstGeom>"#
        );
        self.shape(rect, &geometry, Some(color), None);
    }

    fn table(&mut self, rect: Rect, col_widths: &[f64], rows: &[Vec<String>]) {
        let id = self.next_id();
        let row_h = emu(rect.h / rows.len().max(1) as f64);
        let grid = col_widths
            .iter()
            .map(|w| format!(r#"<a:gridCol w="{}"/>"#, emu(*w)))
            .collect::<String>();
        let border = format!(r#"<a:lnB w="6350">{}</a:lnB>"#, solid_fill(BORDER));
        let mut body = String::new();
        for (i, row) in rows.iter().enumerate() {
            let header = i == 0;
            let style = if header {
                TextStyle::new(14).bold()
            } else {
                TextStyle::new(14)
            };
            body.push_str(&format!(r#"<a:tr h="{row_h}">"#));
            for cell in row {
                let fill = if header { solid_fill(SLATE_100) } else { String::new() };
                body.push_str(&format!(
                    r#"<a:tc><a:txBody><a:bodyPr/><a:lstStyle/>{}</a:txBody><a:tcPr anchor="ctr">{border}{fill}</a:tcPr></a:tc>"#,
                    style.paragraphs(cell)
                ));
            }
            body.push_str("</a:tr>");
        }
        self.shapes.push_str(&format!(
            r#"<p:graphicFrame><p:nvGraphicFramePr><p:cNvPr id="{id}" name="Table {id}"/><p:cNvGraphicFramePr><a:graphicFrameLocks noGrp="1"/></p:cNvGraphicFramePr><p:nvPr/></p:nvGraphicFramePr><p:xfrm><a:off x="{}" y="{}"/><a:ext cx="{}" cy="{}"/></p:xfrm><a:graphic><a:graphicData uri="http://schemas.openxmlformats.org/drawingml/2006/table"><a:tbl><a:tblPr firstRow="1"/><a:tblGrid>{grid}</a:tblGrid>{body}</a:tbl></a:graphicData></a:graphic></p:graphicFrame>"#,
            emu(rect.x),
            emu(rect.y),
            emu(rect.w),
            emu(rect.h)
        ));
    }

    fn picture(&mut self, rect: Rect, image: &DeckImage) {
        let id = self.next_id();
        self.images.push(image.target.clone());
        let rel_id = self.images.len() + 1;
        let rect = rect.fit(image.width, image.height);
        self.shapes.push_str(&format!(
            r#"<p:pic><p:nvPicPr><p:cNvPr id="{id}" name="Picture {id}"/><p:cNvPicPr><a:picLocks noChangeAspect="1"/></p:cNvPicPr><p:nvPr/></p:nvPicPr><p:blipFill><a:blip r:embed="rId{rel_id}"/><a:stretch><a:fillRect/></a:stretch></p:blipFill><p:spPr>{}<a:prstGeom prst="rect"><a:avLst/></a:prstGeom></p:spPr></p:pic>"#,
            rect.xfrm()
        ));
    }

    fn to_xml(&self) -> String {
        format!(
            r#"{XML_DECL}<p:sld {NS}><p:cSld><p:spTree><p:nvGrpSpPr><p:cNvPr id="1" name=""/><p:cNvGrpSpPr/><p:nvPr/></p:nvGrpSpPr><p:grpSpPr><a:xfrm><a:off x="0" y="0"/><a:ext cx="0" cy="0"/><a:chOff x="0" y="0"/><a:chExt cx="0" cy="0"/></a:xfrm></p:grpSpPr>{}</p:spTree></p:cSld><p:clrMapOvr><a:masterClrMapping/></p:clrMapOvr></p:sld>"#,
            self.shapes
        )
    }

    fn rels_xml(&self) -> String {
        let mut rels = format!(
            r#"<Relationship Id="rId1" Type="{REL_NS}/slideLayout" Target="../slideLayouts/slideLayout1.xml"/>"#
        );
        for (i, target) in self.images.iter().enumerate() {
            rels.push_str(&format!(
                r#"<Relationship Id="rId{}" Type="{REL_NS}/image" Target="{target}"/>"#,
                i + 2
            ));
        }
        format!(r#"{XML_DECL}<Relationships xmlns="{PKG_REL_NS}">{rels}</Relationships>"#)
    }
}

/// An image stored in the package.
#[derive(Clone, Debug)]
struct DeckImage {
    target: String,
    width: u32,
    height: u32,
}

/// The package under construction.
#[derive(Debug, Default)]
struct DeckBuilder {
    slides: Vec<Slide>,
    media: Vec<(String, Vec<u8>)>,
}

impl DeckBuilder {
    /// Store an image. Only JPEG and PNG go into the deck; anything else is
    /// skipped.
    fn add_image(&mut self, image: &ImagePayload) -> Option<DeckImage> {
        let ext = match image.mime_type.as_str() {
            "image/jpeg" => "jpeg",
            "image/png" => "png",
            other => {
                warn!(mime_type = other, "Skipping image format the deck cannot embed");
                return None;
            }
        };
        let (width, height) = match image::ImageReader::new(Cursor::new(&image.data))
            .with_guessed_format()
            .map_err(anyhow::Error::from)
            .and_then(|reader| Ok(reader.into_dimensions()?))
        {
            Ok(dims) => dims,
            Err(err) => {
                warn!("Skipping unreadable image: {err:#}");
                return None;
            }
        };
        let name = format!("image{}.{ext}", self.media.len() + 1);
        self.media.push((name.clone(), image.data.clone()));
        Some(DeckImage {
            target: format!("../media/{name}"),
            width,
            height,
        })
    }

    fn background(&mut self, slide: &mut Slide, image: Option<&ImagePayload>) {
        if let Some(image) = image.and_then(|image| self.add_image(image)) {
            let full = Rect::full_slide();
            slide.images.push(image.target.clone());
            let id = slide.next_id();
            let rel_id = slide.images.len() + 1;
            // Stretched, not fitted: templates are made for the slide size.
            slide.shapes.push_str(&format!(
                r#"<p:pic><p:nvPicPr><p:cNvPr id="{id}" name="Background"/><p:cNvPicPr/><p:nvPr/></p:nvPicPr><p:blipFill><a:blip r:embed="rId{rel_id}"/><a:stretch><a:fillRect/></a:stretch></p:blipFill><p:spPr>{}<a:prstGeom prst="rect"><a:avLst/></a:prstGeom></p:spPr></p:pic>"#,
                full.xfrm()
            ));
        }
    }

    fn package(self, title: &str) -> Result<Vec<u8>> {
        let slide_count = self.slides.len();
        let mut entries = vec![
            ("[Content_Types].xml".to_owned(), content_types(slide_count)),
            ("_rels/.rels".to_owned(), root_rels()),
            ("docProps/core.xml".to_owned(), core_props(title)),
            ("docProps/app.xml".to_owned(), app_props(slide_count)),
            ("ppt/presentation.xml".to_owned(), presentation(slide_count)),
            (
                "ppt/_rels/presentation.xml.rels".to_owned(),
                presentation_rels(slide_count),
            ),
            ("ppt/slideMasters/slideMaster1.xml".to_owned(), slide_master()),
            (
                "ppt/slideMasters/_rels/slideMaster1.xml.rels".to_owned(),
                format!(
                    r#"{XML_DECL}<Relationships xmlns="{PKG_REL_NS}"><Relationship Id="rId1" Type="{REL_NS}/slideLayout" Target="../slideLayouts/slideLayout1.xml"/><Relationship Id="rId2" Type="{REL_NS}/theme" Target="../theme/theme1.xml"/></Relationships>"#
                ),
            ),
            ("ppt/slideLayouts/slideLayout1.xml".to_owned(), slide_layout()),
            (
                "ppt/slideLayouts/_rels/slideLayout1.xml.rels".to_owned(),
                format!(
                    r#"{XML_DECL}<Relationships xmlns="{PKG_REL_NS}"><Relationship Id="rId1" Type="{REL_NS}/slideMaster" Target="../slideMasters/slideMaster1.xml"/></Relationships>"#
                ),
            ),
            ("ppt/theme/theme1.xml".to_owned(), theme()),
        ]
        .into_iter()
        .map(|(path, xml)| (path, xml.into_bytes()))
        .collect::<Vec<_>>();

        for (i, slide) in self.slides.iter().enumerate() {
            let n = i + 1;
            entries.push((format!("ppt/slides/slide{n}.xml"), slide.to_xml().into_bytes()));
            entries.push((
                format!("ppt/slides/_rels/slide{n}.xml.rels"),
                slide.rels_xml().into_bytes(),
            ));
        }
        for (name, data) in self.media {
            entries.push((format!("ppt/media/{name}"), data));
        }
        build_zip(&entries)
    }
}

fn content_types(slide_count: usize) -> String {
    let slides = (1..=slide_count)
        .map(|n| {
            format!(
                r#"<Override PartName="/ppt/slides/slide{n}.xml" ContentType="application/vnd.openxmlformats-officedocument.presentationml.slide+xml"/>"#
            )
        })
        .collect::<String>();
    format!(
        r#"{XML_DECL}<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Default Extension="jpeg" ContentType="image/jpeg"/><Default Extension="png" ContentType="image/png"/><Override PartName="/ppt/presentation.xml" ContentType="application/vnd.openxmlformats-officedocument.presentationml.presentation.main+xml"/><Override PartName="/ppt/slideMasters/slideMaster1.xml" ContentType="application/vnd.openxmlformats-officedocument.presentationml.slideMaster+xml"/><Override PartName="/ppt/slideLayouts/slideLayout1.xml" ContentType="application/vnd.openxmlformats-officedocument.presentationml.slideLayout+xml"/><Override PartName="/ppt/theme/theme1.xml" ContentType="application/vnd.openxmlformats-officedocument.theme+xml"/><Override PartName="/docProps/core.xml" ContentType="application/vnd.openxmlformats-package.core-properties+xml"/><Override PartName="/docProps/app.xml" ContentType="application/vnd.openxmlformats-officedocument.extended-properties+xml"/>{slides}</Types>"#
    )
}

fn root_rels() -> String {
    format!(
        r#"{XML_DECL}<Relationships xmlns="{PKG_REL_NS}"><Relationship Id="rId1" Type="{REL_NS}/officeDocument" Target="ppt/presentation.xml"/><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/package/2006/relationships/metadata/core-properties" Target="docProps/core.xml"/><Relationship Id="rId3" Type="{REL_NS}/extended-properties" Target="docProps/app.xml"/></Relationships>"#
    )
}

fn core_props(title: &str) -> String {
    let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    format!(
        r#"{XML_DECL}<cp:coreProperties xmlns:cp="http://schemas.openxmlformats.org/package/2006/metadata/core-properties" xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:dcterms="http://purl.org/dc/terms/" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"><dc:title>{}</dc:title><dc:creator>AdMate Vision</dc:creator><dcterms:created xsi:type="dcterms:W3CDTF">{now}</dcterms:created><dcterms:modified xsi:type="dcterms:W3CDTF">{now}</dcterms:modified></cp:coreProperties>"#,
        xml_escape(title)
    )
}

fn app_props(slide_count: usize) -> String {
    format!(
        r#"{XML_DECL}<Properties xmlns="http://schemas.openxmlformats.org/officeDocument/2006/extended-properties"><Application>admate-report</Application><Slides>{slide_count}</Slides></Properties>"#
    )
}

fn presentation(slide_count: usize) -> String {
    let ids = (1..=slide_count)
        .map(|n| format!(r#"<p:sldId id="{}" r:id="rId{}"/>"#, 255 + n, n + 2))
        .collect::<String>();
    format!(
        r#"{XML_DECL}<p:presentation {NS} saveSubsetFonts="1"><p:sldMasterIdLst><p:sldMasterId id="2147483648" r:id="rId1"/></p:sldMasterIdLst><p:sldIdLst>{ids}</p:sldIdLst><p:sldSz cx="{}" cy="{}"/><p:notesSz cx="6858000" cy="9144000"/></p:presentation>"#,
        emu(SLIDE_W),
        emu(SLIDE_H)
    )
}

fn presentation_rels(slide_count: usize) -> String {
    let slides = (1..=slide_count)
        .map(|n| {
            format!(
                r#"<Relationship Id="rId{}" Type="{REL_NS}/slide" Target="slides/slide{n}.xml"/>"#,
                n + 2
            )
        })
        .collect::<String>();
    format!(
        r#"{XML_DECL}<Relationships xmlns="{PKG_REL_NS}"><Relationship Id="rId1" Type="{REL_NS}/slideMaster" Target="slideMasters/slideMaster1.xml"/><Relationship Id="rId2" Type="{REL_NS}/theme" Target="theme/theme1.xml"/>{slides}</Relationships>"#
    )
}

const EMPTY_TREE: &str = r#"<p:spTree><p:nvGrpSpPr><p:cNvPr id="1" name=""/><p:cNvGrpSpPr/><p:nvPr/></p:nvGrpSpPr><p:grpSpPr/></p:spTree>"#;

fn slide_master() -> String {
    format!(
        r#"{XML_DECL}<p:sldMaster {NS}><p:cSld><p:bg><p:bgRef idx="1001"><a:schemeClr val="bg1"/></p:bgRef></p:bg>{EMPTY_TREE}</p:cSld><p:clrMap bg1="lt1" tx1="dk1" bg2="lt2" tx2="dk2" accent1="accent1" accent2="accent2" accent3="accent3" accent4="accent4" accent5="accent5" accent6="accent6" hlink="hlink" folHlink="folHlink"/><p:sldLayoutIdLst><p:sldLayoutId id="2147483649" r:id="rId1"/></p:sldLayoutIdLst></p:sldMaster>"#
    )
}

fn slide_layout() -> String {
    format!(
        r#"{XML_DECL}<p:sldLayout {NS} type="blank" preserve="1"><p:cSld name="Blank">{EMPTY_TREE}</p:cSld><p:clrMapOvr><a:masterClrMapping/></p:clrMapOvr></p:sldLayout>"#
    )
}

fn theme() -> String {
    let colors = [
        ("dk1", "000000"),
        ("lt1", "FFFFFF"),
        ("dk2", "1E293B"),
        ("lt2", "F1F5F9"),
        ("accent1", PIE_COLORS[0]),
        ("accent2", PIE_COLORS[1]),
        ("accent3", PIE_COLORS[2]),
        ("accent4", PIE_COLORS[3]),
        ("accent5", PIE_COLORS[4]),
        ("accent6", PIE_COLORS[5]),
        ("hlink", "2563EB"),
        ("folHlink", "7C3AED"),
    ]
    .iter()
    .map(|(name, rgb)| format!(r#"<a:{name}><a:srgbClr val="{rgb}"/></a:{name}>"#))
    .collect::<String>();
    let font = r#"<a:latin typeface="Malgun Gothic"/><a:ea typeface="Malgun Gothic"/><a:cs typeface=""/>"#;
    let fill = r#"<a:solidFill><a:schemeClr val="phClr"/></a:solidFill>"#;
    let line = format!(r#"<a:ln w="6350">{fill}</a:ln>"#);
    let effect = "<a:effectStyle><a:effectLst/></a:effectStyle>";
    format!(
        r#"{XML_DECL}<a:theme xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" name="AdMate"><a:themeElements><a:clrScheme name="AdMate">{colors}</a:clrScheme><a:fontScheme name="AdMate"><a:majorFont>{font}</a:majorFont><a:minorFont>{font}</a:minorFont></a:fontScheme><a:fmtScheme name="AdMate"><a:fillStyleLst>{fills}</a:fillStyleLst><a:lnStyleLst>{lines}</a:lnStyleLst><a:effectStyleLst>{effects}</a:effectStyleLst><a:bgFillStyleLst>{fills}</a:bgFillStyleLst></a:fmtScheme></a:themeElements></a:theme>"#,
        fills = fill.repeat(3),
        lines = line.repeat(3),
        effects = effect.repeat(3),
    )
}

/// Optional background images for the deck.
///
/// Looked up as `cover`, `content` and `closing`, each `.png`, `.jpg` or
/// `.jpeg`, in the template directory. Missing files just mean a plain
/// background.
#[derive(Clone, Debug, Default)]
pub struct DeckTemplate {
    /// Behind the cover slide.
    pub cover: Option<ImagePayload>,
    /// Behind the summary and photo slides.
    pub content: Option<ImagePayload>,
    /// Behind the closing slide.
    pub closing: Option<ImagePayload>,
}

impl DeckTemplate {
    /// Load whatever backgrounds exist in `dir`.
    pub async fn load(dir: &Path) -> Self {
        Self {
            cover: Self::load_one(dir, "cover").await,
            content: Self::load_one(dir, "content").await,
            closing: Self::load_one(dir, "closing").await,
        }
    }

    async fn load_one(dir: &Path, stem: &str) -> Option<ImagePayload> {
        for ext in ["png", "jpg", "jpeg"] {
            let path = dir.join(format!("{stem}.{ext}"));
            if !path.exists() {
                continue;
            }
            match ImagePayload::from_path(&path).await {
                Ok(image) => return Some(image),
                Err(err) => warn!(path = %path.display(), "Ignoring deck template: {err:#}"),
            }
        }
        debug!(dir = %dir.display(), stem, "No deck template image");
        None
    }
}

fn title_bar(slide: &mut Slide, title: &str) {
    slide.filled_rect(Rect::new(0.0, 0.0, 0.15, SLIDE_H), INDIGO);
    slide.text(
        Rect::new(0.5, 0.3, 12.3, 0.6),
        title,
        TextStyle::new(24).bold(),
    );
}

fn cover_slide(builder: &mut DeckBuilder, input: &ReportInput, template: &DeckTemplate) {
    let mut slide = Slide::default();
    builder.background(&mut slide, template.cover.as_ref());
    if template.cover.is_none() {
        slide.filled_rect(Rect::new(0.0, 2.2, SLIDE_W, 0.08), INDIGO);
    }
    slide.text(
        Rect::new(0.5, 2.5, 12.3, 0.9),
        &format!("{} 게재 현황 보고서", input.advertiser_name),
        TextStyle::new(32).bold().centered(),
    );
    let mut location = format!("{} {}", input.line, input.station);
    if let Some(subtitle) = input.subtitle.as_deref().filter(|s| !s.trim().is_empty()) {
        location.push_str(&format!(" · {subtitle}"));
    }
    slide.text(
        Rect::new(0.5, 3.5, 12.3, 0.5),
        &location,
        TextStyle::new(20).centered().color(SLATE_600),
    );
    if !input.date_str.is_empty() {
        slide.text(
            Rect::new(0.5, 4.1, 12.3, 0.4),
            &format!("보고 일자: {}", format_date(&input.date_str, "-")),
            TextStyle::new(14).centered().color(SLATE_600),
        );
    }
    builder.slides.push(slide);
}

fn summary_slide(builder: &mut DeckBuilder, input: &ReportInput, template: &DeckTemplate) {
    let mut slide = Slide::default();
    builder.background(&mut slide, template.content.as_ref());
    title_bar(&mut slide, "예상 노출량 요약");

    let mut rows = vec![
        vec!["항목".to_owned(), "내용".to_owned()],
        vec!["역/호선".to_owned(), format!("{} {}", input.line, input.station)],
    ];
    let Some(exposure) = &input.exposure else {
        rows.push(vec!["예상 총 노출량".to_owned(), "데이터 없음".to_owned()]);
        slide.table(Rect::new(0.5, 1.2, 12.3, 1.4), &[3.0, 9.3], &rows);
        builder.slides.push(slide);
        return;
    };
    let bands = exposure.bands_by_exposure();
    rows.push(vec![
        "일평균 유동인구".to_owned(),
        format!("{}명", format_count(exposure.daily_flow)),
    ]);
    rows.push(vec!["게재 기간".to_owned(), format!("{}일", exposure.display_days)]);
    rows.push(vec![
        "예상 총 노출량".to_owned(),
        format!("{}명", format_count(exposure.total_exposure)),
    ]);
    if let Some(peak) = bands.first() {
        rows.push(vec!["피크 시간대".to_owned(), peak.band.clone()]);
    }
    let band_total = bands.iter().map(|b| b.exposure).sum::<u64>();
    if band_total == 0 {
        slide.table(
            Rect::new(0.5, 1.2, 12.3, 0.5 * rows.len() as f64),
            &[3.0, 9.3],
            &rows,
        );
        builder.slides.push(slide);
        return;
    }
    slide.table(
        Rect::new(0.5, 1.2, 5.8, 0.5 * rows.len() as f64),
        &[2.2, 3.6],
        &rows,
    );

    // Horizontal bars, peak first.
    slide.text(
        Rect::new(6.9, 1.1, 6.0, 0.4),
        "시간대별 예상 노출량",
        TextStyle::new(14).bold(),
    );
    let max = bands[0].exposure.max(1) as f64;
    let row_h = (2.6 / bands.len() as f64).min(0.45);
    for (i, band) in bands.iter().enumerate() {
        let y = 1.6 + row_h * i as f64;
        let color = if i == 0 { INDIGO } else { INDIGO_LIGHT };
        let bar_w = (band.exposure as f64 / max * 3.6).max(0.02);
        slide.text(Rect::new(6.9, y, 1.0, row_h), &band.band, TextStyle::new(11));
        slide.filled_rect(Rect::new(7.9, y + row_h * 0.15, bar_w, row_h * 0.7), color);
        slide.text(
            Rect::new(7.95 + bar_w, y, 1.3, row_h),
            &format_count(band.exposure),
            TextStyle::new(11).color(SLATE_600),
        );
    }

    // Pie of band shares, clockwise from twelve o'clock.
    let pie = Rect::new(6.9, 4.4, 2.7, 2.7);
    let mut angle = 270.0;
    for (i, band) in bands.iter().enumerate() {
        let share = band.exposure as f64 / band_total as f64;
        let color = PIE_COLORS[i % PIE_COLORS.len()];
        if share >= 0.9999 {
            slide.ellipse(pie, color);
        } else if share > 0.0 {
            slide.wedge(pie, angle, angle + share * 360.0, color);
        }
        angle += share * 360.0;

        let y = 4.5 + 0.32 * i as f64;
        slide.filled_rect(Rect::new(9.9, y + 0.08, 0.16, 0.16), color);
        slide.text(
            Rect::new(10.15, y, 2.8, 0.32),
            &format!("{} {:.0}%", band.band, share * 100.0),
            TextStyle::new(11),
        );
    }
    builder.slides.push(slide);
}

fn photo_slides(builder: &mut DeckBuilder, input: &ReportInput, template: &DeckTemplate) {
    let images = input
        .images
        .iter()
        .filter_map(|image| builder.add_image(image))
        .collect::<Vec<_>>();
    for (page, pair) in images.chunks(2).enumerate() {
        let mut slide = Slide::default();
        builder.background(&mut slide, template.content.as_ref());
        let first = page * 2 + 1;
        let title = if pair.len() == 2 {
            format!("촬영 이미지 {first}-{}", first + 1)
        } else {
            format!("촬영 이미지 {first}")
        };
        title_bar(&mut slide, &title);
        for (i, image) in pair.iter().enumerate() {
            slide.picture(Rect::new(0.5 + 6.3 * i as f64, 1.1, 6.0, 6.0), image);
        }
        builder.slides.push(slide);
    }
}

fn closing_slide(builder: &mut DeckBuilder, input: &ReportInput, template: &DeckTemplate) {
    let mut slide = Slide::default();
    builder.background(&mut slide, template.closing.as_ref());
    slide.text(
        Rect::new(0.5, 2.4, 12.3, 0.9),
        "감사합니다",
        TextStyle::new(32).bold().centered(),
    );
    let contact = [
        input
            .campaign_manager_name
            .as_deref()
            .map(|name| format!("캠페인 담당자: {name}")),
        input.campaign_manager_email.clone(),
    ]
    .into_iter()
    .flatten()
    .filter(|line| !line.trim().is_empty())
    .collect::<Vec<_>>();
    if !contact.is_empty() {
        slide.text(
            Rect::new(0.5, 3.5, 12.3, 1.0),
            &contact.join("\n"),
            TextStyle::new(16).centered().color(SLATE_600),
        );
    }
    builder.slides.push(slide);
}

/// Something that turns report input into a `.pptx` file.
pub trait DeckRenderer: Send + Sync + 'static {
    fn render(&self, input: &ReportInput) -> Result<Vec<u8>>;
}

impl DeckRenderer for DeckTemplate {
    fn render(&self, input: &ReportInput) -> Result<Vec<u8>> {
        render_deck(input, self)
    }
}

/// Render the exposure deck as a `.pptx` file.
#[instrument(level = "debug", skip_all, fields(advertiser = %input.advertiser_name))]
pub fn render_deck(input: &ReportInput, template: &DeckTemplate) -> Result<Vec<u8>> {
    let mut builder = DeckBuilder::default();
    cover_slide(&mut builder, input, template);
    summary_slide(&mut builder, input, template);
    photo_slides(&mut builder, input, template);
    closing_slide(&mut builder, input, template);
    debug!(
        slides = builder.slides.len(),
        media = builder.media.len(),
        "Rendered deck"
    );
    builder.package(&format!("게재 현황 보고서 - {}", input.advertiser_name))
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use zip::ZipArchive;

    use super::*;
    use crate::report::tests::{bare_input, full_input};

    fn read_entry(pptx: &[u8], name: &str) -> String {
        let mut archive = ZipArchive::new(Cursor::new(pptx)).unwrap();
        let mut out = String::new();
        archive.by_name(name).unwrap().read_to_string(&mut out).unwrap();
        out
    }

    fn entry_names(pptx: &[u8]) -> Vec<String> {
        let archive = ZipArchive::new(Cursor::new(pptx)).unwrap();
        archive.file_names().map(str::to_owned).collect()
    }

    #[test]
    fn test_full_deck() {
        let pptx = render_deck(&full_input(), &DeckTemplate::default()).unwrap();
        let names = entry_names(&pptx);
        let slides = names
            .iter()
            .filter(|n| n.starts_with("ppt/slides/slide"))
            .count();
        // Cover, summary, two photo slides for three photos, closing.
        assert_eq!(slides, 5);
        assert_eq!(names.iter().filter(|n| n.starts_with("ppt/media/")).count(), 3);

        let cover = read_entry(&pptx, "ppt/slides/slide1.xml");
        assert!(cover.contains("SSG &amp; Co 게재 현황 보고서"));
        assert!(cover.contains("2024-03-05"));

        let summary = read_entry(&pptx, "ppt/slides/slide2.xml");
        let peak = summary.find("<a:t>07-09</a:t>").unwrap();
        let later = summary.find("<a:t>20-23</a:t>").unwrap();
        assert!(peak < later);
        assert!(summary.contains(r#"prst="pie""#));

        let closing = read_entry(&pptx, "ppt/slides/slide5.xml");
        assert!(closing.contains("pm@example.com"));

        let presentation = read_entry(&pptx, "ppt/presentation.xml");
        assert_eq!(presentation.matches("<p:sldId ").count(), 5);
    }

    #[test]
    fn test_bare_deck() {
        let pptx = render_deck(&bare_input(), &DeckTemplate::default()).unwrap();
        let names = entry_names(&pptx);
        assert!(names.contains(&"ppt/slides/slide3.xml".to_owned()));
        assert!(!names.contains(&"ppt/slides/slide4.xml".to_owned()));
        assert!(!names.iter().any(|n| n.starts_with("ppt/media/")));
        let summary = read_entry(&pptx, "ppt/slides/slide2.xml");
        assert!(summary.contains("데이터 없음"));
    }

    #[tokio::test]
    async fn test_template_backgrounds() {
        let dir = tempfile::tempdir().unwrap();
        let missing = DeckTemplate::load(dir.path()).await;
        assert!(missing.cover.is_none());

        let mut png = Vec::new();
        image::RgbImage::from_pixel(16, 9, image::Rgb([0, 0, 0]))
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        tokio::fs::write(dir.path().join("cover.png"), &png).await.unwrap();
        let template = DeckTemplate::load(dir.path()).await;
        assert!(template.cover.is_some());
        assert!(template.closing.is_none());

        let pptx = render_deck(&bare_input(), &template).unwrap();
        let rels = read_entry(&pptx, "ppt/slides/_rels/slide1.xml.rels");
        assert!(rels.contains("../media/image1.png"));
    }

    #[test]
    fn test_fit_keeps_aspect() {
        let fitted = Rect::new(0.0, 0.0, 6.0, 6.0).fit(400, 200);
        assert_eq!(fitted, Rect::new(0.0, 1.5, 6.0, 3.0));
    }
}
