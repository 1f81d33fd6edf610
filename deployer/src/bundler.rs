use std::fs::{self, File};
use std::io::{self, Cursor, Read, Seek};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use modelbay_common::deployment::Kind;
use modelbay_common::descriptor::{
    self, Descriptor, FileInventory, ReleasePaths, Requirements,
};
use modelbay_common::storage::{sanitize_model_name, StorageManager};
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Error, Result};

/// Extension suffixes that mark a file as model weights.
const WEIGHT_EXTENSIONS: [&str; 4] = ["pt", "pth", "onnx", "h5"];

/// Operator-supplied upload: a model name, the two half archives, and
/// optional release metadata.
pub struct Upload {
    pub model_name: String,
    pub version: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub web_app: Bytes,
    pub inference_app: Bytes,
}

/// Package an upload into a release: validate both halves, extract them under
/// the model's src tree, derive the descriptor, and assemble the canonical
/// bundle archive. Returns the descriptor and the bundle path.
///
/// A failed packaging leaves no partial state behind: when the model did not
/// exist before, its directory is removed again on error.
pub async fn package(storage: StorageManager, upload: Upload) -> Result<(Descriptor, PathBuf)> {
    let model = sanitize_model_name(&upload.model_name);
    if model.is_empty() {
        return Err(Error::InvalidName);
    }

    tokio::task::spawn_blocking(move || {
        let existed = storage.model_exists(&model);
        let result = package_blocking(&storage, &model, &upload);
        if result.is_err() && !existed {
            if let Err(error) = storage.remove_model(&model) {
                warn!(%model, %error, "failed to clean up after packaging error");
            }
        }
        result
    })
    .await
    .expect("blocking packaging task panicked")
}

fn package_blocking(
    storage: &StorageManager,
    model: &str,
    upload: &Upload,
) -> Result<(Descriptor, PathBuf)> {
    // Both archives must be sound before anything lands on disk.
    validate_half(&upload.web_app, Kind::Web)?;
    validate_half(&upload.inference_app, Kind::Inference)?;

    let model_folder = storage.model_path(model)?;
    let release_folder = storage.release_path(model)?;
    let web_folder = storage.src_path(model, Kind::Web)?;
    let inference_folder = storage.src_path(model, Kind::Inference)?;

    unpack(open_archive(&upload.web_app, Kind::Web)?, None, &web_folder)?;
    unpack(
        open_archive(&upload.inference_app, Kind::Inference)?,
        None,
        &inference_folder,
    )?;

    let web_requirements = read_requirements(&web_folder)?;
    let inference_requirements = read_requirements(&inference_folder)?;

    let mut combined = web_requirements.clone();
    for requirement in &inference_requirements {
        if !combined.contains(requirement) {
            combined.push(requirement.clone());
        }
    }

    let descriptor = Descriptor {
        model_name: upload.model_name.trim().to_string(),
        version: upload.version.clone().unwrap_or_else(|| "1.0".to_string()),
        created_at: chrono::Utc::now(),
        author: upload.author.clone().unwrap_or_else(|| "Unknown".to_string()),
        description: upload
            .description
            .clone()
            .unwrap_or_else(|| format!("Model {model}")),
        paths: ReleasePaths {
            model_folder,
            release_folder: release_folder.clone(),
            web_app_folder: web_folder.clone(),
            inference_app_folder: inference_folder.clone(),
        },
        files: FileInventory {
            web_app_folder: Kind::Web.dir_name().to_string(),
            inference_app_folder: Kind::Inference.dir_name().to_string(),
            model_weights: collect_weights(&inference_folder)?,
        },
        requirements: Requirements {
            combined,
            web_app: web_requirements,
            inference_app: inference_requirements,
        },
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

    // The descriptor lands at the release root and inside each half, so both
    // the bundle and every extracted tree are self-describing.
    let descriptor_path = release_folder.join("descriptor.json");
    descriptor.write_to(&descriptor_path)?;
    descriptor.write_to(&web_folder.join("descriptor.json"))?;
    descriptor.write_to(&inference_folder.join("descriptor.json"))?;

    let bundle_path = storage.bundle_path(model);
    write_bundle(&bundle_path, &descriptor_path, &web_folder, &inference_folder)?;

    info!(%model, bundle = %bundle_path.display(), "packaged release");

    Ok((descriptor, bundle_path))
}

fn open_archive(data: &Bytes, kind: Kind) -> Result<ZipArchive<Cursor<&[u8]>>> {
    ZipArchive::new(Cursor::new(data.as_ref()))
        .map_err(|err| Error::BundleMalformed(format!("unreadable {kind} archive: {err}")))
}

fn validate_half(data: &Bytes, kind: Kind) -> Result<()> {
    let archive = open_archive(data, kind)?;
    let has_entrypoint = archive
        .file_names()
        .any(|name| name == "app.py" || name == kind.fallback_entry());
    if !has_entrypoint {
        return Err(Error::BundleMalformed(format!(
            "{kind} archive has no app entrypoint (expected app.py or {})",
            kind.fallback_entry()
        )));
    }

    Ok(())
}

/// Extract a zip archive into `dest`. With a subtree prefix only entries
/// under `<subtree>/` are written, prefix stripped. Entries that would
/// escape `dest` are skipped.
pub(crate) fn unpack<R: Read + Seek>(
    mut archive: ZipArchive<R>,
    subtree: Option<&str>,
    dest: &Path,
) -> io::Result<()> {
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(path) = entry.enclosed_name() else {
            continue;
        };
        let path = match subtree {
            Some(prefix) => match path.strip_prefix(prefix) {
                Ok(stripped) if stripped.as_os_str().is_empty() => continue,
                Ok(stripped) => stripped.to_path_buf(),
                Err(_) => continue,
            },
            None => path,
        };

        let target = dest.join(path);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
    }

    Ok(())
}

fn read_requirements(half_folder: &Path) -> io::Result<Vec<String>> {
    let path = half_folder.join("requirements.txt");
    if !path.is_file() {
        warn!(path = %path.display(), "requirements.txt not found");
        return Ok(Vec::new());
    }

    Ok(descriptor::parse_requirements(&fs::read_to_string(path)?))
}

fn collect_weights(root: &Path) -> io::Result<Vec<String>> {
    let mut weights = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else if path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| WEIGHT_EXTENSIONS.contains(&ext))
            {
                let rel = path.strip_prefix(root).expect("walked path is under its root");
                weights.push(rel.to_string_lossy().into_owned());
            }
        }
    }
    weights.sort();

    Ok(weights)
}

fn write_bundle(
    bundle_path: &Path,
    descriptor_path: &Path,
    web_folder: &Path,
    inference_folder: &Path,
) -> io::Result<()> {
    let file = File::create(bundle_path)?;
    let mut bundle = ZipWriter::new(file);

    add_file(&mut bundle, descriptor_path, "descriptor.json")?;
    add_tree(&mut bundle, web_folder, Kind::Web.dir_name())?;
    add_tree(&mut bundle, inference_folder, Kind::Inference.dir_name())?;

    bundle.finish()?;

    Ok(())
}

fn deflated() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn add_file(bundle: &mut ZipWriter<File>, path: &Path, name: &str) -> io::Result<()> {
    bundle.start_file(name, deflated())?;
    let mut file = File::open(path)?;
    io::copy(&mut file, bundle)?;

    Ok(())
}

fn add_tree(bundle: &mut ZipWriter<File>, root: &Path, prefix: &str) -> io::Result<()> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else {
                let rel = path.strip_prefix(root).expect("walked path is under its root");
                add_file(bundle, &path, &format!("{prefix}/{}", rel.display()))?;
            }
        }
    }

    Ok(())
}
