use std::{fs, io, path::PathBuf};

use uuid::Uuid;

use crate::deployment::Kind;

/// Manager to take care of the directories holding model releases and
/// deployed instance sandboxes.
///
/// ```text
/// <root>/models/<model>/release/descriptor.json
/// <root>/models/<model>/release/<model>.zip
/// <root>/models/<model>/src/web_app/...
/// <root>/models/<model>/src/inference_app/...
/// <root>/deployed_models/<model>/<kind>_<uuid>/
/// ```
#[derive(Clone)]
pub struct StorageManager {
    root: PathBuf,
}

impl StorageManager {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Path of the directory that contains all model releases.
    pub fn models_path(&self) -> io::Result<PathBuf> {
        let models_path = self.root.join("models");
        fs::create_dir_all(&models_path)?;

        Ok(models_path)
    }

    /// Path for a specific model.
    pub fn model_path(&self, model: &str) -> io::Result<PathBuf> {
        let model_path = self.models_path()?.join(model);
        fs::create_dir_all(&model_path)?;

        Ok(model_path)
    }

    /// Release directory of a model, holding the descriptor and the bundle.
    pub fn release_path(&self, model: &str) -> io::Result<PathBuf> {
        let release_path = self.model_path(model)?.join("release");
        fs::create_dir_all(&release_path)?;

        Ok(release_path)
    }

    /// Extracted source tree for one half of a model.
    pub fn src_path(&self, model: &str, kind: Kind) -> io::Result<PathBuf> {
        let src_path = self.model_path(model)?.join("src").join(kind.dir_name());
        fs::create_dir_all(&src_path)?;

        Ok(src_path)
    }

    pub fn release_descriptor_path(&self, model: &str) -> PathBuf {
        self.root
            .join("models")
            .join(model)
            .join("release")
            .join("descriptor.json")
    }

    pub fn bundle_path(&self, model: &str) -> PathBuf {
        self.root
            .join("models")
            .join(model)
            .join("release")
            .join(format!("{model}.zip"))
    }

    /// Sandbox directory for one deployed instance.
    pub fn sandbox_path(&self, model: &str, kind: Kind, instance_id: &Uuid) -> io::Result<PathBuf> {
        let sandbox_path = self
            .root
            .join("deployed_models")
            .join(model)
            .join(format!("{}_{instance_id}", kind.dir_name()));
        fs::create_dir_all(&sandbox_path)?;

        Ok(sandbox_path)
    }

    pub fn model_exists(&self, model: &str) -> bool {
        self.root.join("models").join(model).is_dir()
    }

    /// Names of all models present on disk.
    pub fn list_models(&self) -> io::Result<Vec<String>> {
        let mut models = Vec::new();
        for entry in fs::read_dir(self.models_path()?)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                models.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        models.sort();

        Ok(models)
    }

    /// Delete everything under `models/<model>`. Used to roll back a failed
    /// packaging attempt so uploads never leave partial state behind.
    pub fn remove_model(&self, model: &str) -> io::Result<()> {
        let path = self.root.join("models").join(model);
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        }

        Ok(())
    }
}

/// Reduce an operator-supplied model name to a filesystem- and shell-safe
/// directory name: whitespace collapses to underscores, anything outside
/// `[A-Za-z0-9._-]` is dropped, and leading/trailing dots go away so the
/// result can never traverse out of the models directory.
pub fn sanitize_model_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();

    cleaned.trim_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_separators_and_metacharacters() {
        assert_eq!(sanitize_model_name("ocr"), "ocr");
        assert_eq!(sanitize_model_name("my model v2"), "my_model_v2");
        assert_eq!(sanitize_model_name("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_model_name("rm -rf /; echo"), "rm_-rf__echo");
        assert_eq!(sanitize_model_name("$(whoami)"), "whoami");
        assert_eq!(sanitize_model_name("..."), "");
        assert_eq!(sanitize_model_name("  "), "");
    }

    #[test]
    fn layout_matches_the_documented_tree() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path().to_path_buf());

        let release = storage.release_path("ocr").unwrap();
        assert!(release.ends_with("models/ocr/release"));
        assert!(release.is_dir());

        let src = storage.src_path("ocr", Kind::Inference).unwrap();
        assert!(src.ends_with("models/ocr/src/inference_app"));

        let id = Uuid::new_v4();
        let sandbox = storage.sandbox_path("ocr", Kind::Web, &id).unwrap();
        assert!(sandbox.ends_with(format!("deployed_models/ocr/web_app_{id}")));

        assert!(storage.model_exists("ocr"));
        assert_eq!(storage.list_models().unwrap(), vec!["ocr".to_string()]);

        storage.remove_model("ocr").unwrap();
        assert!(!storage.model_exists("ocr"));
    }
}
