//! The advertiser directory.
//!
//! Advertisers are managed elsewhere. We load a snapshot from a JSON or TOML
//! file and treat it as read-only.

use schemars::JsonSchema;

use crate::{io::read_json_or_toml, prelude::*};

/// A registered advertiser.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertiserRecord {
    /// Stable ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Contact email for the advertiser.
    #[serde(default)]
    pub email: Option<String>,
    /// Campaign manager's name.
    #[serde(default)]
    pub campaign_manager_name: Option<String>,
    /// Campaign manager's email.
    #[serde(default)]
    pub campaign_manager_email: Option<String>,
    /// Case-insensitive terms to look for in OCR text.
    #[serde(default)]
    pub search_terms: Vec<String>,
}

/// On-disk shape of the directory file.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DirectoryFile {
    Wrapped { advertisers: Vec<AdvertiserRecord> },
    List(Vec<AdvertiserRecord>),
}

/// All known advertisers, in registration order.
#[derive(Clone, Debug, Default)]
pub struct AdvertiserDirectory {
    advertisers: Vec<AdvertiserRecord>,
}

impl AdvertiserDirectory {
    /// Build a directory from records.
    pub fn new(advertisers: Vec<AdvertiserRecord>) -> Self {
        Self { advertisers }
    }

    /// Load a directory from a JSON or TOML file.
    ///
    /// TOML files use `[[advertisers]]` tables. JSON files may be either a
    /// bare array or an object with an `advertisers` array.
    pub async fn load(path: &Path) -> Result<Self> {
        let file: DirectoryFile = read_json_or_toml(path)
            .await
            .with_context(|| format!("Failed to load advertiser directory {:?}", path))?;
        let advertisers = match file {
            DirectoryFile::Wrapped { advertisers } | DirectoryFile::List(advertisers) => {
                advertisers
            }
        };
        info!(count = advertisers.len(), "Loaded advertiser directory");
        Ok(Self { advertisers })
    }

    /// All advertisers.
    pub fn all(&self) -> &[AdvertiserRecord] {
        &self.advertisers
    }

    /// Look up an advertiser by ID.
    pub fn get(&self, id: &str) -> Option<&AdvertiserRecord> {
        self.advertisers.iter().find(|a| a.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_toml_and_json() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("advertisers.toml");
        tokio::fs::write(
            &toml_path,
            r#"
[[advertisers]]
id = "ssg"
name = "에스에스지닷컴"
email = "ad@ssg.example"
campaignManagerName = "김담당"
campaignManagerEmail = "manager@agency.example"
searchTerms = ["SSG", "SSG.COM"]
"#,
        )
        .await
        .unwrap();
        let directory = AdvertiserDirectory::load(&toml_path).await.unwrap();
        let ssg = directory.get("ssg").unwrap();
        assert_eq!(ssg.search_terms, ["SSG", "SSG.COM"]);
        assert_eq!(ssg.campaign_manager_name.as_deref(), Some("김담당"));

        let json_path = dir.path().join("advertisers.json");
        tokio::fs::write(&json_path, r#"[{"id": "lg", "name": "LG전자"}]"#)
            .await
            .unwrap();
        let directory = AdvertiserDirectory::load(&json_path).await.unwrap();
        assert_eq!(directory.all().len(), 1);
        assert!(directory.get("ssg").is_none());
    }
}
