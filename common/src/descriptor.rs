use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deployment::Kind;

/// Release descriptor: the metadata document written at the release root,
/// embedded into the bundle archive, and (augmented) into every sandbox.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Descriptor {
    pub model_name: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub author: String,
    pub description: String,
    pub paths: ReleasePaths,
    pub files: FileInventory,
    pub requirements: Requirements,
    pub interface_type: String,
    pub api_endpoints: BTreeMap<String, EndpointDoc>,
    #[serde(default)]
    pub instances: Vec<InstanceSummary>,

    // Per-instance augmentation, present only in sandbox copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_type: Option<Kind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_api_url: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReleasePaths {
    pub model_folder: PathBuf,
    pub release_folder: PathBuf,
    pub web_app_folder: PathBuf,
    pub inference_app_folder: PathBuf,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FileInventory {
    pub web_app_folder: String,
    pub inference_app_folder: String,
    /// Paths of model-weight files relative to the inference half root.
    pub model_weights: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Requirements {
    pub combined: Vec<String>,
    pub web_app: Vec<String>,
    pub inference_app: Vec<String>,
}

impl Requirements {
    pub fn for_kind(&self, kind: Kind) -> &[String] {
        match kind {
            Kind::Web => &self.web_app,
            Kind::Inference => &self.inference_app,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EndpointDoc {
    pub method: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<String>,
}

/// Instance summaries appended to the release descriptor after successful
/// deployments. Single-kind deployments record one half; a deploy of both
/// halves records the pair it wired together.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum InstanceSummary {
    Single {
        id: Uuid,
        #[serde(rename = "type")]
        kind: Kind,
        port: u16,
        created_at: DateTime<Utc>,
    },
    Pair {
        web_app: HalfRef,
        inference_app: HalfRef,
        created_at: DateTime<Utc>,
    },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HalfRef {
    pub id: Uuid,
    pub port: u16,
}

impl Descriptor {
    /// The fixed endpoint catalog advertised for every dual-interface model.
    pub fn default_api_endpoints() -> BTreeMap<String, EndpointDoc> {
        BTreeMap::from([
            (
                "predict".to_string(),
                EndpointDoc {
                    method: "POST".to_string(),
                    description: "Make predictions using the model".to_string(),
                    parameters: Some(
                        "Depends on the specific model implementation".to_string(),
                    ),
                },
            ),
            (
                "health".to_string(),
                EndpointDoc {
                    method: "GET".to_string(),
                    description: "Check if the API is running properly".to_string(),
                    parameters: None,
                },
            ),
        ])
    }

    /// Serialize with the 4-space indentation every descriptor on disk uses.
    pub fn to_pretty_json(&self) -> serde_json::Result<Vec<u8>> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut serializer)?;
        Ok(buf)
    }

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        let json = self
            .to_pretty_json()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        std::fs::write(path, json)
    }

    pub fn read_from(path: &Path) -> io::Result<Self> {
        let contents = std::fs::read(path)?;
        serde_json::from_slice(&contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

/// Parse a `requirements.txt`: one dependency per non-comment line, version
/// pins stripped down to the bare package name.
pub fn parse_requirements(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let name = line
                .split(|c| matches!(c, '=' | '<' | '>'))
                .next()
                .unwrap_or_default()
                .trim();
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requirements_are_stripped_to_bare_names() {
        let parsed = parse_requirements(
            "flask==2.3.0\n# a comment\n\nnumpy>=1.24\ntorch<2\n  requests  \n",
        );
        assert_eq!(parsed, vec!["flask", "numpy", "torch", "requests"]);
    }

    #[test]
    fn pretty_json_uses_four_space_indent() {
        let descriptor = Descriptor {
            model_name: "ocr".to_string(),
            version: "1.0".to_string(),
            created_at: Utc::now(),
            author: "Unknown".to_string(),
            description: "Model ocr".to_string(),
            paths: ReleasePaths {
                model_folder: "models/ocr".into(),
                release_folder: "models/ocr/release".into(),
                web_app_folder: "models/ocr/src/web_app".into(),
                inference_app_folder: "models/ocr/src/inference_app".into(),
            },
            files: FileInventory {
                web_app_folder: "web_app".to_string(),
                inference_app_folder: "inference_app".to_string(),
                model_weights: vec![],
            },
            requirements: Requirements::default(),
            interface_type: "dual".to_string(),
            api_endpoints: Descriptor::default_api_endpoints(),
            instances: vec![],
            instance_id: None,
            app_type: None,
            port: None,
            deployed_at: None,
            app_dir: None,
            inference_api_url: None,
        };

        let json = String::from_utf8(descriptor.to_pretty_json().unwrap()).unwrap();
        assert!(json.contains("\n    \"model_name\": \"ocr\""));
        // Augmentation fields stay out of release copies.
        assert!(!json.contains("instance_id"));

        let back: Descriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back.model_name, "ocr");
    }

    #[test]
    fn instance_summaries_serialize_both_shapes() {
        let single = InstanceSummary::Single {
            id: Uuid::new_v4(),
            kind: Kind::Web,
            port: 4242,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&single).unwrap();
        assert_eq!(json["type"], "web_app");

        let pair = InstanceSummary::Pair {
            web_app: HalfRef {
                id: Uuid::new_v4(),
                port: 1,
            },
            inference_app: HalfRef {
                id: Uuid::new_v4(),
                port: 2,
            },
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&pair).unwrap();
        assert!(json.get("web_app").is_some());
    }
}
