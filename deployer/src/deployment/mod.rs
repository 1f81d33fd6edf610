use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use modelbay_common::deployment::{Kind, State};
use modelbay_common::descriptor::{Descriptor, HalfRef, InstanceSummary};
use modelbay_common::log::LogSink;
use modelbay_common::storage::StorageManager;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ports::PortAllocator;
use crate::registry::{Instance, Registry};
use crate::sandbox::{self, Sandbox};

type ChildHandles = Arc<Mutex<HashMap<Uuid, Child>>>;

/// Lock table admitting one concurrent deployment per (model, kind). Clones
/// share the table.
#[derive(Clone, Default)]
pub struct DeployLocks {
    held: Arc<Mutex<HashSet<(String, Kind)>>>,
}

impl DeployLocks {
    fn try_acquire(&self, model: &str, kind: Kind) -> Option<DeployGuard> {
        let mut held = self.held.lock().unwrap();
        if held.insert((model.to_string(), kind)) {
            Some(DeployGuard {
                locks: self.clone(),
                model: model.to_string(),
                kind,
            })
        } else {
            None
        }
    }

    pub fn is_held(&self, model: &str, kind: Kind) -> bool {
        self.held
            .lock()
            .unwrap()
            .contains(&(model.to_string(), kind))
    }
}

/// Held for the full duration of one deployment; releasing on drop covers
/// both the success and every failure path.
struct DeployGuard {
    locks: DeployLocks,
    model: String,
    kind: Kind,
}

impl Drop for DeployGuard {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap()
            .remove(&(self.model.clone(), self.kind));
    }
}

/// Orchestrates sandbox provisioning and process lifecycle for model
/// instances. Cloneable; all clones share the registry, lock table, port
/// reservations and child process handles.
#[derive(Clone)]
pub struct DeploymentManager {
    storage: StorageManager,
    registry: Registry,
    locks: DeployLocks,
    ports: Arc<PortAllocator>,
    children: ChildHandles,
    sink: Option<Arc<dyn LogSink>>,
    python_bin: String,
    host: String,
}

impl DeploymentManager {
    pub fn new(
        storage: StorageManager,
        registry: Registry,
        sink: Option<Arc<dyn LogSink>>,
        python_bin: String,
        host: String,
    ) -> Self {
        Self {
            storage,
            registry,
            locks: DeployLocks::default(),
            ports: Arc::new(PortAllocator::new()),
            children: Default::default(),
            sink,
            python_bin,
            host,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn is_deploying(&self, model: &str, kind: Kind) -> bool {
        self.locks.is_held(model, kind)
    }

    /// Deploy one half of a model. The single-flight lock for
    /// `(model, kind)` is held for the whole procedure; a second caller gets
    /// `AlreadyDeploying` instead of queueing behind the first.
    #[instrument(skip(self), fields(%model, %kind))]
    pub async fn deploy(&self, model: &str, kind: Kind) -> Result<Instance> {
        let _guard = self
            .locks
            .try_acquire(model, kind)
            .ok_or_else(|| Error::AlreadyDeploying {
                model: model.to_string(),
                kind,
            })?;

        let (descriptor, bundle_path) = self.ensure_registered(model).await?;

        let instance_id = Uuid::new_v4();
        let port = self.ports.allocate()?;
        let sandbox_dir = self.storage.sandbox_path(model, kind, &instance_id)?;

        // The record goes in before provisioning starts so status queries see
        // a consistent picture while the sandbox is being built.
        let instance = Instance::new(instance_id, kind, port, &self.host, sandbox_dir);
        self.registry.append_instance(model, instance.clone()).await;

        info!(%instance_id, port, "deploying new instance");

        match self
            .provision_and_spawn(model, kind, &descriptor, &bundle_path, instance_id, port)
            .await
        {
            Ok(pid) => {
                self.registry.set_running(model, kind, instance_id, pid).await;
                let mut deployed = instance;
                deployed.status = State::Running;
                deployed.deploying = false;
                deployed.pid = Some(pid);
                Ok(deployed)
            }
            Err(err) => {
                self.registry
                    .update_status(model, kind, instance_id, State::Failed)
                    .await;
                self.ports.release(port);
                Err(err)
            }
        }
    }

    /// Deploy both halves in parallel. Successful halves stay running and
    /// visible when the other fails; nothing is rolled back.
    #[instrument(skip(self), fields(%model))]
    pub async fn deploy_both(&self, model: &str) -> Result<(Instance, Instance)> {
        let (web, inference) = tokio::join!(
            self.deploy(model, Kind::Web),
            self.deploy(model, Kind::Inference)
        );

        match (web, inference) {
            (Ok(web), Ok(inference)) => {
                self.wire_web_to_inference(&web, &inference).await;
                self.record_release_summary(
                    model,
                    InstanceSummary::Pair {
                        web_app: HalfRef {
                            id: web.id,
                            port: web.port,
                        },
                        inference_app: HalfRef {
                            id: inference.id,
                            port: inference.port,
                        },
                        created_at: chrono::Utc::now(),
                    },
                )
                .await;
                info!("deployed model with both halves");
                Ok((web, inference))
            }
            (web, inference) => {
                let mut failed = Vec::new();
                let mut succeeded = Vec::new();
                for (kind, outcome) in [(Kind::Web, &web), (Kind::Inference, &inference)] {
                    match outcome {
                        Ok(_) => succeeded.push(kind),
                        Err(error) => {
                            error!(%kind, %error, "half failed to deploy");
                            failed.push(kind);
                        }
                    }
                }
                Err(Error::PartialDeployment { failed, succeeded })
            }
        }
    }

    /// Fire-and-forget deployment of one half (or both when `kind` is None).
    /// Failures surface through the registry and the instance log only.
    pub fn deploy_in_background(&self, model: String, kind: Option<Kind>) {
        let manager = self.clone();
        tokio::spawn(async move {
            match kind {
                Some(kind) => match manager.deploy(&model, kind).await {
                    Ok(instance) => {
                        manager
                            .record_release_summary(
                                &model,
                                InstanceSummary::Single {
                                    id: instance.id,
                                    kind,
                                    port: instance.port,
                                    created_at: instance.created_at,
                                },
                            )
                            .await;
                        info!(%model, %kind, "background deployment finished");
                    }
                    Err(error) => error!(%model, %kind, %error, "background deployment failed"),
                },
                None => {
                    if let Err(error) = manager.deploy_both(&model).await {
                        error!(%model, %error, "background deployment failed");
                    }
                }
            }
        });
    }

    /// Stop one instance: signal the child and mark the record stopped. The
    /// record and its sandbox stay around for post-mortem log viewing.
    pub async fn stop(&self, model: &str, kind: Kind, instance_id: Uuid) -> Result<()> {
        if !self.registry.contains(model).await {
            return Err(Error::UnknownModel(model.to_string()));
        }
        if self.registry.find(model, kind, instance_id).await.is_none() {
            return Err(Error::UnknownInstance(instance_id));
        }

        self.kill_child(instance_id);
        self.registry
            .update_status(model, kind, instance_id, State::Stopped)
            .await;
        info!(%model, %kind, %instance_id, "instance stopped");

        Ok(())
    }

    /// Demote an instance whose backend no longer answers. Called by the
    /// proxy on connect failure; process death is detected lazily this way.
    pub async fn demote_failed(&self, model: &str, kind: Kind, instance_id: Uuid) {
        self.kill_child(instance_id);
        self.registry
            .update_status(model, kind, instance_id, State::Failed)
            .await;
        warn!(%model, %kind, %instance_id, "instance demoted to failed");
    }

    /// Terminate every child process. Called once on server shutdown.
    pub fn shutdown(&self) {
        let mut children = self.children.lock().unwrap();
        for (instance_id, child) in children.iter_mut() {
            match child.start_kill() {
                Ok(()) => trace!(%instance_id, "sent kill to instance process"),
                Err(error) => warn!(%instance_id, %error, "failed to kill instance process"),
            }
        }
        children.clear();
    }

    /// Make sure the model is in the registry, loading its release metadata
    /// from disk when the server was restarted since the upload.
    async fn ensure_registered(&self, model: &str) -> Result<(Descriptor, PathBuf)> {
        if let Some(info) = self.registry.model_info(model).await {
            return Ok(info);
        }

        let descriptor_path = self.storage.release_descriptor_path(model);
        let bundle_path = self.storage.bundle_path(model);
        if !descriptor_path.is_file() {
            return Err(Error::UnknownModel(model.to_string()));
        }
        if !bundle_path.is_file() {
            return Err(Error::MissingBundle(model.to_string()));
        }

        let descriptor = Descriptor::read_from(&descriptor_path)?;
        self.registry
            .get_or_create(model, &descriptor, &bundle_path)
            .await;

        Ok((descriptor, bundle_path))
    }

    async fn provision_and_spawn(
        &self,
        model: &str,
        kind: Kind,
        descriptor: &Descriptor,
        bundle_path: &Path,
        instance_id: Uuid,
        port: u16,
    ) -> Result<u32> {
        // Web halves learn where a running inference API lives, if any is up
        // by the time they are provisioned.
        let inference_url = if kind.wants_inference_url() {
            self.registry
                .pick_running(model, Kind::Inference)
                .await
                .map(|instance| instance.url)
        } else {
            None
        };

        let mut descriptor = descriptor.clone();
        descriptor.inference_api_url = inference_url.clone();

        let sandbox = sandbox::provision(
            &self.storage,
            self.sink.clone(),
            &self.python_bin,
            model,
            bundle_path,
            &descriptor,
            kind,
            instance_id,
            port,
        )
        .await?;

        let mut child = self
            .spawn_app(model, kind, instance_id, port, &sandbox, inference_url)
            .await?;
        let pid = child.id().unwrap_or_default();
        pump_stdio(&mut child, &sandbox);
        self.children.lock().unwrap().insert(instance_id, child);

        Ok(pid)
    }

    async fn spawn_app(
        &self,
        model: &str,
        kind: Kind,
        instance_id: Uuid,
        port: u16,
        sandbox: &Sandbox,
        inference_url: Option<String>,
    ) -> Result<Child> {
        sandbox
            .logger
            .append(format!(
                "Running command: {} {}",
                sandbox.python.display(),
                sandbox.entry.display()
            ))
            .await;
        sandbox
            .logger
            .append(format!("Working directory: {}", sandbox.dir.display()))
            .await;

        let mut command = Command::new(&sandbox.python);
        command
            .arg(&sandbox.entry)
            .current_dir(&sandbox.dir)
            .env("PORT", port.to_string())
            .env("MODEL_NAME", model)
            .env("INSTANCE_ID", instance_id.to_string())
            .env("APP_DIR", &sandbox.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(url) = inference_url {
            command.env("INFERENCE_API_URL", url);
        }
        // Detach from the server's controlling session so a ctrl-c in the
        // terminal does not take every deployed app down with it.
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(Error::SpawnFailure)?;
        sandbox
            .logger
            .append(format!(
                "{kind} process started with PID {}",
                child.id().unwrap_or_default()
            ))
            .await;

        Ok(child)
    }

    /// After both halves of a deploy-both come up, write the inference URL
    /// into the web sandbox's descriptor so the frontend can find its API.
    async fn wire_web_to_inference(&self, web: &Instance, inference: &Instance) {
        let path = web.sandbox_dir.join("descriptor.json");
        let result = async {
            let mut descriptor = Descriptor::read_from(&path)?;
            descriptor.inference_api_url = Some(inference.url.clone());
            descriptor.write_to(&path)
        }
        .await;

        if let Err(error) = result {
            warn!(path = %path.display(), %error, "failed to wire web instance to inference API");
        }
    }

    /// Opportunistically append an instance summary to the release
    /// descriptor. The registry stays authoritative; a write failure here is
    /// only logged.
    async fn record_release_summary(&self, model: &str, summary: InstanceSummary) {
        let path = self.storage.release_descriptor_path(model);
        let result = async {
            let mut descriptor = Descriptor::read_from(&path)?;
            descriptor.instances.push(summary);
            descriptor.write_to(&path)
        }
        .await;

        if let Err(error) = result {
            warn!(%model, %error, "failed to update release descriptor");
        }
    }

    fn kill_child(&self, instance_id: Uuid) {
        if let Some(mut child) = self.children.lock().unwrap().remove(&instance_id) {
            match child.start_kill() {
                Ok(()) => info!(%instance_id, "initiated instance process killing"),
                Err(error) => error!(
                    %instance_id,
                    %error,
                    "failed to start the killing of the instance process"
                ),
            }
        }
    }
}

fn pump_stdio(child: &mut Child, sandbox: &Sandbox) {
    if let Some(stdout) = child.stdout.take() {
        let logger = sandbox.logger.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                logger.append(line).await;
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let logger = sandbox.logger.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                logger.append(line).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_flight_admits_one_holder_per_pair() {
        let locks = DeployLocks::default();

        let guard = locks.try_acquire("ocr", Kind::Web).unwrap();
        assert!(locks.try_acquire("ocr", Kind::Web).is_none());
        // Other pairs deploy independently.
        assert!(locks.try_acquire("ocr", Kind::Inference).is_some());
        assert!(locks.try_acquire("asr", Kind::Web).is_some());

        assert!(locks.is_held("ocr", Kind::Web));
        drop(guard);
        assert!(!locks.is_held("ocr", Kind::Web));
        assert!(locks.try_acquire("ocr", Kind::Web).is_some());
    }

    #[test]
    fn concurrent_acquires_leave_exactly_one_winner() {
        let locks = DeployLocks::default();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                std::thread::spawn(move || locks.try_acquire("ocr", Kind::Inference))
            })
            .collect();

        // Keep every won guard alive until all threads have reported, so a
        // release cannot hand the lock to a later thread mid-test.
        let guards: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();
        assert_eq!(guards.iter().filter(|guard| guard.is_some()).count(), 1);
    }

    #[tokio::test]
    async fn deploy_of_unknown_model_fails_and_releases_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DeploymentManager::new(
            StorageManager::new(dir.path().to_path_buf()),
            Registry::new(),
            None,
            "python3".to_string(),
            "127.0.0.1".to_string(),
        );

        let err = manager.deploy("ghost", Kind::Web).await.unwrap_err();
        assert!(matches!(err, Error::UnknownModel(_)));
        // The guard must have been dropped on the failure path.
        assert!(!manager.is_deploying("ghost", Kind::Web));
    }

    #[tokio::test]
    async fn second_deploy_is_rejected_while_the_first_holds_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DeploymentManager::new(
            StorageManager::new(dir.path().to_path_buf()),
            Registry::new(),
            None,
            "python3".to_string(),
            "127.0.0.1".to_string(),
        );

        let _guard = manager.locks.try_acquire("ocr", Kind::Web).unwrap();
        let err = manager.deploy("ocr", Kind::Web).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyDeploying { .. }));
    }
}
