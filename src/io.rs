//! I/O utilities.
//!
//! Reading JSON and TOML configuration-like files (advertiser directories,
//! capture sessions, prompts), and writing JSON or JSONL output to a file or
//! standard output.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Map;
use tokio::{
    fs::{self, File},
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::prelude::*;

/// A JSON object.
pub type JsonObject = Map<String, Value>;

/// Is this path JSON-like, based on its extension?
fn is_json_like(path: &Path) -> bool {
    let ext = path.extension().unwrap_or_default();
    ext == "json" || ext == "jsonl"
}

/// Is this path TOML, based on its extension?
fn is_toml(path: &Path) -> bool {
    path.extension().unwrap_or_default() == "toml"
}

/// Read TOML or JSON from a file.
///
/// The extension decides the format. Files with any other extension are
/// parsed as JSON when they look like JSON, and as TOML otherwise.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    // Read all at once because our parsing libraries don't do async I/O.
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    let parse_json = |data: &str| {
        serde_json::from_str(data).with_context(|| {
            format!("Failed to parse JSON from file at path: {:?}", path)
        })
    };
    let parse_toml = |data: &str| {
        toml::from_str(data).with_context(|| {
            format!("Failed to parse TOML from file at path: {:?}", path)
        })
    };
    if is_json_like(path) {
        parse_json(&data)
    } else if is_toml(path) {
        parse_toml(&data)
    } else if data.trim_start().starts_with('{') {
        parse_json(&data)
    } else if data.trim_start().starts_with('[') {
        // A JSON array or a TOML table header.
        parse_json(&data).or_else(|_| parse_toml(&data))
    } else {
        parse_toml(&data)
    }
}

/// Write a value as pretty-printed JSON, replacing the file in one step.
pub async fn write_json_file<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize,
{
    let json = serde_json::to_vec_pretty(value).context("Failed to serialize JSON")?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &json)
        .await
        .with_context(|| format!("Failed to write file at path: {:?}", tmp_path))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to replace file at path: {:?}", path))?;
    Ok(())
}

/// Create a writer for either standard output or a file.
async fn create_writer(path: Option<&Path>) -> Result<Box<dyn AsyncWrite + Unpin + Send>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write serializable records as JSONL to either standard output or a file.
pub async fn write_jsonl<T>(path: Option<&Path>, records: &[T]) -> Result<()>
where
    T: Serialize,
{
    let mut writer = BufWriter::new(create_writer(path).await?);
    for record in records {
        let json =
            serde_json::to_string(record).context("Failed to serialize JSON record")?;
        writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write JSON to output")?;
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}

/// Write one value as pretty-printed JSON to either standard output or a file.
pub async fn write_json<T>(path: Option<&Path>, value: &T) -> Result<()>
where
    T: Serialize,
{
    let mut writer = BufWriter::new(create_writer(path).await?);
    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    writer
        .write_all(json.as_bytes())
        .await
        .context("Failed to write JSON to output")?;
    writer
        .write_all(b"\n")
        .await
        .context("Failed to write newline to output")?;
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, Serialize, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_read_toml_and_json() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("sample.toml");
        fs::write(&toml_path, "name = \"a\"\ncount = 2\n").await.unwrap();
        let sample: Sample = read_json_or_toml(&toml_path).await.unwrap();
        assert_eq!(sample, Sample { name: "a".to_owned(), count: 2 });

        let json_path = dir.path().join("sample.json");
        write_json_file(&json_path, &sample).await.unwrap();
        let round: Sample = read_json_or_toml(&json_path).await.unwrap();
        assert_eq!(round, sample);
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Directory {
        samples: Vec<Sample>,
    }

    #[tokio::test]
    async fn test_read_toml_starting_with_table_header() {
        let dir = tempfile::tempdir().unwrap();
        let toml = "[[samples]]\nname = \"a\"\ncount = 1\n\n[[samples]]\nname = \"b\"\ncount = 2\n";
        let expected = Directory {
            samples: vec![
                Sample { name: "a".to_owned(), count: 1 },
                Sample { name: "b".to_owned(), count: 2 },
            ],
        };

        let toml_path = dir.path().join("directory.toml");
        fs::write(&toml_path, toml).await.unwrap();
        let parsed: Directory = read_json_or_toml(&toml_path).await.unwrap();
        assert_eq!(parsed, expected);

        // Without a known extension, a leading table header is still TOML.
        let bare_path = dir.path().join("directory");
        fs::write(&bare_path, toml).await.unwrap();
        let parsed: Directory = read_json_or_toml(&bare_path).await.unwrap();
        assert_eq!(parsed, expected);

        let json_path = dir.path().join("directory.conf");
        fs::write(&json_path, r#"{"samples": [{"name": "a", "count": 1}]}"#)
            .await
            .unwrap();
        let parsed: Directory = read_json_or_toml(&json_path).await.unwrap();
        assert_eq!(parsed.samples.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_has_context() {
        let err = read_json_or_toml::<Sample>(Path::new("/nonexistent/x.toml"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read file"));
    }
}
