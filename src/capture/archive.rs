//! Photo archives: bundling captured photos on the client, and pulling them
//! back out on the server.

use std::{
    collections::HashSet,
    io::{Cursor, Read as _, Write as _},
};

use zip::{CompressionMethod, ZipArchive, ZipWriter, write::SimpleFileOptions};

use crate::{data_url::ImagePayload, prelude::*};

use super::{StationVisit, filename::visit_folder, resolve::VisitMeta};

/// Extensions we treat as photos when extracting an archive.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// Write `(path, bytes)` entries into an in-memory ZIP.
pub fn build_zip(entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (path, bytes) in entries {
        writer
            .start_file(path.as_str(), options)
            .with_context(|| format!("cannot add {path:?} to archive"))?;
        writer
            .write_all(bytes)
            .with_context(|| format!("cannot write {path:?} to archive"))?;
    }
    let cursor = writer.finish().context("cannot finish archive")?;
    Ok(cursor.into_inner())
}

/// Replace the extension of a generated filename with the one matching the
/// actual image bytes.
fn with_image_extension(name: &str, payload: &ImagePayload) -> String {
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    format!("{stem}.{}", payload.extension())
}

/// Pick an archive path that hasn't been used yet, adding `_2`, `_3`, ...
/// to the stem when two visits produce the same name.
fn unique_path(used: &mut HashSet<String>, folder: Option<&str>, name: &str) -> String {
    let join = |name: &str| match folder {
        Some(folder) => format!("{folder}/{name}"),
        None => name.to_owned(),
    };
    let mut path = join(name);
    let (stem, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    let mut n = 2;
    while used.contains(&path) {
        path = join(&format!("{stem}_{n}.{ext}"));
        n += 1;
    }
    used.insert(path.clone());
    path
}

/// Bundle every visit's ad photos under their resolved filenames.
///
/// With more than one visit, each visit's photos go in a
/// `{station}_{line}/` folder. Visits that resolve to the same folder and
/// names keep all their photos.
pub fn bundle_visits(visits: &[(&StationVisit, &VisitMeta)]) -> Result<Vec<u8>> {
    let use_folders = visits.len() > 1;
    let mut used = HashSet::new();
    let mut entries = vec![];
    for (visit, meta) in visits {
        let folder = use_folders.then(|| visit_folder(&meta.station_name, &meta.subway_line));
        for (item, name) in visit.ad_images.iter().zip(&meta.filenames) {
            let payload = ImagePayload::from_data_url(&item.image)
                .with_context(|| format!("bad photo in visit {}", visit.visit_id))?;
            let name = with_image_extension(name, &payload);
            let path = unique_path(&mut used, folder.as_deref(), &name);
            entries.push((path, payload.data));
        }
    }
    build_zip(&entries)
}

/// Is this archive entry a photo?
fn is_image_entry(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Extract the photos from an archive, sorted by entry name.
pub fn extract_images(zip_bytes: &[u8]) -> Result<Vec<(String, ImagePayload)>> {
    let mut archive =
        ZipArchive::new(Cursor::new(zip_bytes)).context("cannot open photo archive")?;
    let mut images = vec![];
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .with_context(|| format!("cannot read archive entry {i}"))?;
        if file.is_dir() || !is_image_entry(file.name()) {
            continue;
        }
        let name = file.name().to_owned();
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)
            .with_context(|| format!("cannot extract {name:?}"))?;
        images.push((name, ImagePayload::from_bytes(data)));
    }
    images.sort_by(|a, b| a.0.cmp(&b.0));
    debug!(count = images.len(), "Extracted photos from archive");
    Ok(images)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::capture::{AdCaptureItem, FALLBACK_LABEL};

    #[test]
    fn test_extract_only_sorted_images() {
        let zip = build_zip(&[
            ("b.jpg".to_owned(), b"second".to_vec()),
            ("notes.txt".to_owned(), b"skip me".to_vec()),
            ("a.PNG".to_owned(), b"first".to_vec()),
            ("dir/c.webp".to_owned(), b"third".to_vec()),
        ])
        .unwrap();

        let images = extract_images(&zip).unwrap();
        let names = images.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["a.PNG", "b.jpg", "dir/c.webp"]);
        assert_eq!(images[1].1.data, b"second");
    }

    fn skipped_visit(image: &str) -> (StationVisit, VisitMeta) {
        let mut visit = StationVisit::new();
        visit.skip_location = true;
        visit.ad_images.push(AdCaptureItem {
            image: image.to_owned(),
            captured_at: Utc::now(),
        });
        let mut meta = VisitMeta {
            visit_id: visit.visit_id.clone(),
            station_name: FALLBACK_LABEL.to_owned(),
            subway_line: FALLBACK_LABEL.to_owned(),
            advertiser_name: "SSG".to_owned(),
            advertiser_id: Some("ssg".to_owned()),
            date_str: "20240305".to_owned(),
            filenames: vec![],
            skip_location: true,
            needs_correction: false,
        };
        meta.rename(visit.ad_images.len(), None);
        (visit, meta)
    }

    #[test]
    fn test_same_day_skipped_visits_keep_every_photo() {
        let (first, first_meta) = skipped_visit("data:image/jpeg;base64,AAAA");
        let (second, second_meta) = skipped_visit("data:image/jpeg;base64,BBBB");
        let zip = bundle_visits(&[(&first, &first_meta), (&second, &second_meta)]).unwrap();

        let images = extract_images(&zip).unwrap();
        let names = images.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>();
        assert_eq!(
            names,
            [
                "미인식_미인식/SSG_20240305_01.jpg",
                "미인식_미인식/SSG_20240305_01_2.jpg",
            ]
        );
        assert_ne!(images[0].1.data, images[1].1.data);
    }

    #[test]
    fn test_png_photos_get_png_names() {
        let mut png = vec![];
        image::RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3]))
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let url = ImagePayload::from_bytes(png).to_data_url();
        let (visit, meta) = skipped_visit(&url);
        let zip = bundle_visits(&[(&visit, &meta)]).unwrap();

        let images = extract_images(&zip).unwrap();
        assert_eq!(images[0].0, "SSG_20240305_01.png");
        assert_eq!(images[0].1.mime_type, "image/png");
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(extract_images(b"not a zip").is_err());
    }
}
