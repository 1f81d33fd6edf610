use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use modelbay_common::deployment::{Kind, State};
use modelbay_common::descriptor::Descriptor;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

/// One running (or once-running) child process serving half of a model.
///
/// The process handle itself lives with the deployment manager; this record
/// is what status queries and the proxy see.
#[derive(Clone, Debug, Serialize)]
pub struct Instance {
    pub id: Uuid,
    pub kind: Kind,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: State,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub deploying: bool,
    pub sandbox_dir: PathBuf,
}

impl Instance {
    pub fn new(id: Uuid, kind: Kind, port: u16, host: &str, sandbox_dir: PathBuf) -> Self {
        Self {
            id,
            kind,
            port,
            pid: None,
            status: State::Initializing,
            url: format!("http://{host}:{port}"),
            created_at: Utc::now(),
            deploying: true,
            sandbox_dir,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.deploying && self.status == State::Running
    }
}

/// Everything the registry knows about one model.
struct ModelEntry {
    web: Vec<Instance>,
    inference: Vec<Instance>,
    descriptor: Descriptor,
    bundle_path: PathBuf,
}

impl ModelEntry {
    fn list(&self, kind: Kind) -> &Vec<Instance> {
        match kind {
            Kind::Web => &self.web,
            Kind::Inference => &self.inference,
        }
    }

    fn list_mut(&mut self, kind: Kind) -> &mut Vec<Instance> {
        match kind {
            Kind::Web => &mut self.web,
            Kind::Inference => &mut self.inference,
        }
    }
}

/// Process-memory map of models to their live instance records. This is the
/// authoritative runtime truth; descriptor JSON on disk may lag behind it.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<String, ModelEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model, or refresh its descriptor and bundle path if it is
    /// already known. Existing instance records are kept either way.
    pub async fn get_or_create(&self, model: &str, descriptor: &Descriptor, bundle_path: &Path) {
        let mut inner = self.inner.write().await;
        match inner.get_mut(model) {
            Some(entry) => {
                entry.descriptor = descriptor.clone();
                entry.bundle_path = bundle_path.to_path_buf();
            }
            None => {
                inner.insert(
                    model.to_string(),
                    ModelEntry {
                        web: Vec::new(),
                        inference: Vec::new(),
                        descriptor: descriptor.clone(),
                        bundle_path: bundle_path.to_path_buf(),
                    },
                );
            }
        }
    }

    pub async fn contains(&self, model: &str) -> bool {
        self.inner.read().await.contains_key(model)
    }

    pub async fn model_info(&self, model: &str) -> Option<(Descriptor, PathBuf)> {
        self.inner
            .read()
            .await
            .get(model)
            .map(|entry| (entry.descriptor.clone(), entry.bundle_path.clone()))
    }

    /// Insert a fresh record. Returns false when the model is unknown.
    pub async fn append_instance(&self, model: &str, instance: Instance) -> bool {
        let mut inner = self.inner.write().await;
        match inner.get_mut(model) {
            Some(entry) => {
                entry.list_mut(instance.kind).push(instance);
                true
            }
            None => false,
        }
    }

    /// Transition a provisioned instance to running and attach its pid.
    pub async fn set_running(&self, model: &str, kind: Kind, id: Uuid, pid: u32) {
        let mut inner = self.inner.write().await;
        if let Some(instance) = inner
            .get_mut(model)
            .and_then(|entry| entry.list_mut(kind).iter_mut().find(|i| i.id == id))
        {
            if !instance.status.is_terminal() {
                instance.status = State::Running;
                instance.deploying = false;
                instance.pid = Some(pid);
            }
        }
    }

    /// Update an instance's status. Terminal states are sticky: a stopped or
    /// failed record never transitions again under the same id. Returns
    /// whether the update was applied.
    pub async fn update_status(&self, model: &str, kind: Kind, id: Uuid, status: State) -> bool {
        let mut inner = self.inner.write().await;
        let Some(instance) = inner
            .get_mut(model)
            .and_then(|entry| entry.list_mut(kind).iter_mut().find(|i| i.id == id))
        else {
            return false;
        };

        if instance.status.is_terminal() {
            return false;
        }

        instance.status = status;
        instance.deploying = false;

        true
    }

    /// Pick a running instance uniformly at random. Callers must tolerate an
    /// empty result.
    pub async fn pick_running(&self, model: &str, kind: Kind) -> Option<Instance> {
        let inner = self.inner.read().await;
        let candidates: Vec<&Instance> = inner
            .get(model)?
            .list(kind)
            .iter()
            .filter(|instance| instance.is_running())
            .collect();

        candidates.choose(&mut rand::thread_rng()).map(|i| (*i).clone())
    }

    pub async fn find(&self, model: &str, kind: Kind, id: Uuid) -> Option<Instance> {
        self.inner
            .read()
            .await
            .get(model)?
            .list(kind)
            .iter()
            .find(|instance| instance.id == id)
            .cloned()
    }

    /// All records for a model, web instances first. None when the model is
    /// not registered.
    pub async fn instances(&self, model: &str) -> Option<Vec<Instance>> {
        let inner = self.inner.read().await;
        let entry = inner.get(model)?;
        let mut all = entry.web.clone();
        all.extend(entry.inference.iter().cloned());

        Some(all)
    }

    pub async fn has_running(&self, model: &str, kind: Kind) -> bool {
        self.inner
            .read()
            .await
            .get(model)
            .map(|entry| entry.list(kind).iter().any(Instance::is_running))
            .unwrap_or(false)
    }

    pub async fn any_deploying(&self, model: &str, kind: Kind) -> bool {
        self.inner
            .read()
            .await
            .get(model)
            .map(|entry| entry.list(kind).iter().any(|instance| instance.deploying))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use modelbay_common::descriptor::{FileInventory, ReleasePaths, Requirements};

    use super::*;

    fn descriptor(model: &str) -> Descriptor {
        Descriptor {
            model_name: model.to_string(),
            version: "1.0".to_string(),
            created_at: Utc::now(),
            author: "Unknown".to_string(),
            description: format!("Model {model}"),
            paths: ReleasePaths {
                model_folder: format!("models/{model}").into(),
                release_folder: format!("models/{model}/release").into(),
                web_app_folder: format!("models/{model}/src/web_app").into(),
                inference_app_folder: format!("models/{model}/src/inference_app").into(),
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
        }
    }

    async fn registry_with(model: &str) -> Registry {
        let registry = Registry::new();
        registry
            .get_or_create(model, &descriptor(model), Path::new("bundle.zip"))
            .await;
        registry
    }

    fn running(kind: Kind, port: u16) -> Instance {
        let mut instance = Instance::new(Uuid::new_v4(), kind, port, "127.0.0.1", "sb".into());
        instance.status = State::Running;
        instance.deploying = false;
        instance
    }

    #[tokio::test]
    async fn pick_running_skips_deploying_and_terminal_instances() {
        let registry = registry_with("ocr").await;

        let healthy = running(Kind::Inference, 9001);
        let mut stopped = running(Kind::Inference, 9002);
        stopped.status = State::Stopped;
        let initializing = Instance::new(Uuid::new_v4(), Kind::Inference, 9003, "127.0.0.1", "sb".into());

        for instance in [healthy.clone(), stopped, initializing] {
            registry.append_instance("ocr", instance).await;
        }

        for _ in 0..50 {
            let picked = registry.pick_running("ocr", Kind::Inference).await.unwrap();
            assert_eq!(picked.id, healthy.id);
        }
        assert!(registry.pick_running("ocr", Kind::Web).await.is_none());
        assert!(registry.pick_running("missing", Kind::Web).await.is_none());
    }

    #[tokio::test]
    async fn pick_running_is_roughly_uniform() {
        let registry = registry_with("ocr").await;

        let instances: Vec<Instance> = (0..3).map(|i| running(Kind::Inference, 9100 + i)).collect();
        for instance in &instances {
            registry.append_instance("ocr", instance.clone()).await;
        }

        let mut counts: HashMap<Uuid, u32> = HashMap::new();
        for _ in 0..1000 {
            let picked = registry.pick_running("ocr", Kind::Inference).await.unwrap();
            *counts.entry(picked.id).or_default() += 1;
        }

        for instance in &instances {
            let share = counts[&instance.id];
            assert!(
                (233..=433).contains(&share),
                "instance got {share} of 1000 picks"
            );
        }
    }

    #[tokio::test]
    async fn terminal_states_are_sticky() {
        let registry = registry_with("ocr").await;
        let instance = running(Kind::Web, 9200);
        let id = instance.id;
        registry.append_instance("ocr", instance).await;

        assert!(registry.update_status("ocr", Kind::Web, id, State::Stopped).await);
        assert!(!registry.update_status("ocr", Kind::Web, id, State::Running).await);

        let record = registry.find("ocr", Kind::Web, id).await.unwrap();
        assert_eq!(record.status, State::Stopped);
    }

    #[tokio::test]
    async fn reupload_refreshes_metadata_but_keeps_instances() {
        let registry = registry_with("ocr").await;
        registry.append_instance("ocr", running(Kind::Web, 9300)).await;

        let mut refreshed = descriptor("ocr");
        refreshed.version = "2.0".to_string();
        registry
            .get_or_create("ocr", &refreshed, Path::new("bundle2.zip"))
            .await;

        let (descriptor, bundle) = registry.model_info("ocr").await.unwrap();
        assert_eq!(descriptor.version, "2.0");
        assert_eq!(bundle, PathBuf::from("bundle2.zip"));
        assert_eq!(registry.instances("ocr").await.unwrap().len(), 1);
    }
}
