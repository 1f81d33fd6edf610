mod error;

use std::time::Duration;

use axum::body::{Body, BoxBody};
use axum::extract::multipart::Field;
use axum::extract::{DefaultBodyLimit, Extension, Multipart, Path};
use axum::http::{Request, Response};
use axum::response::{Html, IntoResponse};
use axum::routing::{any, get, post};
use axum::{Form, Json, Router};
use bytes::Bytes;
use modelbay_common::deployment::Kind;
use modelbay_common::descriptor::Descriptor;
use modelbay_common::log::read_tail;
use modelbay_common::storage::sanitize_model_name;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, debug_span, field, Span};
use uuid::Uuid;

use crate::bundler::{self, Upload};
use crate::deployment::DeploymentManager;
use crate::error::Error;
use crate::proxy;
use crate::registry::Instance;

pub use self::error::ApiError;
use self::error::Result;

const REDIRECT_SECONDS: u64 = 5;
const LOG_TAIL_BYTES: u64 = 16 * 1024;
const API_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Model bundles routinely carry weight files; the default 2 MB body limit
/// would reject them.
const UPLOAD_LIMIT_BYTES: usize = 1024 * 1024 * 1024;

pub fn make_router(deployment_manager: DeploymentManager) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/upload", post(upload_model))
        .route("/models", get(list_models))
        .route("/model/:name", get(model_view))
        .route("/model/:name/api_doc", get(api_doc))
        .route("/model/:name/instances", get(instances_view))
        .route("/model/:name/status", get(model_status))
        .route("/model/:name/create_instance", post(create_instance))
        .route("/model/:name/stop_instance", post(stop_instance))
        .route("/model/:name/*subpath", any(proxy_model))
        .layer(DefaultBodyLimit::max(UPLOAD_LIMIT_BYTES))
        .layer(Extension(deployment_manager))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<Body>| {
                    debug_span!("request", http.uri = %request.uri(), http.method = %request.method(), http.status_code = field::Empty)
                })
                .on_response(
                    |response: &Response<BoxBody>, latency: Duration, span: &Span| {
                        span.record("http.status_code", response.status().as_u16());
                        debug!(latency = format_args!("{} ns", latency.as_nanos()), "finished processing request");
                    },
                ),
        )
}

async fn index() -> Html<&'static str> {
    Html(
        "<h1>modelbay</h1>\
         <p>POST /upload with model_name, web_app and inference_app to deploy a model.</p>",
    )
}

async fn upload_model(
    Extension(manager): Extension<DeploymentManager>,
    mut multipart: Multipart,
) -> Result<Json<Value>> {
    let mut model_name = String::new();
    let mut version = None;
    let mut author = None;
    let mut description = None;
    let mut web_app: Option<Bytes> = None;
    let mut inference_app: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| Error::InvalidUpload(err.to_string()))?
    {
        match field.name() {
            Some("model_name") => model_name = read_text(field).await?,
            Some("version") => version = Some(read_text(field).await?),
            Some("author") => author = Some(read_text(field).await?),
            Some("description") => description = Some(read_text(field).await?),
            Some("web_app") => web_app = Some(read_bytes(field).await?),
            Some("inference_app") => inference_app = Some(read_bytes(field).await?),
            _ => {}
        }
    }

    if model_name.trim().is_empty() {
        return Err(Error::InvalidName.into());
    }
    let web_app = web_app
        .filter(|data| !data.is_empty())
        .ok_or_else(|| Error::InvalidUpload("no file provided for web_app".to_string()))?;
    let inference_app = inference_app
        .filter(|data| !data.is_empty())
        .ok_or_else(|| Error::InvalidUpload("no file provided for inference_app".to_string()))?;

    let (descriptor, bundle_path) = bundler::package(
        manager.storage().clone(),
        Upload {
            model_name: model_name.clone(),
            version,
            author,
            description,
            web_app,
            inference_app,
        },
    )
    .await?;

    let model = sanitize_model_name(&model_name);
    manager
        .registry()
        .get_or_create(&model, &descriptor, &bundle_path)
        .await;
    manager.deploy_in_background(model.clone(), None);

    Ok(Json(json!({
        "model_name": model,
        "message": "Model is being deployed. Please wait...",
        "redirect_url": format!("/model/{model}"),
        "redirect_seconds": REDIRECT_SECONDS,
    })))
}

async fn read_text(field: Field<'_>) -> Result<String> {
    Ok(field
        .text()
        .await
        .map_err(|err| Error::InvalidUpload(err.to_string()))?)
}

async fn read_bytes(field: Field<'_>) -> Result<Bytes> {
    Ok(field
        .bytes()
        .await
        .map_err(|err| Error::InvalidUpload(err.to_string()))?)
}

async fn list_models(
    Extension(manager): Extension<DeploymentManager>,
) -> Result<Json<Vec<String>>> {
    let models = manager.storage().list_models().map_err(Error::Io)?;

    Ok(Json(models))
}

/// The model's frontend view. Serves the picked web instance's coordinates,
/// or a deploying status while instances come up, lazily starting a
/// deployment of both halves when nothing runs and none is in flight.
async fn model_view(
    Extension(manager): Extension<DeploymentManager>,
    Path(name): Path<String>,
) -> Result<axum::response::Response> {
    require_release(&manager, &name)?;

    if let Some(web) = manager.registry().pick_running(&name, Kind::Web).await {
        let inference = manager.registry().pick_running(&name, Kind::Inference).await;
        return Ok(Json(json!({
            "model_name": name,
            "instance_id": web.id,
            "web_app_port": web.port,
            "web_app_url": web.url,
            "inference_app_url": inference.as_ref().map(|i| i.url.clone()),
            "inference_app_port": inference.map(|i| i.port),
        }))
        .into_response());
    }

    let deploying = manager.is_deploying(&name, Kind::Web)
        || manager.is_deploying(&name, Kind::Inference)
        || manager.registry().any_deploying(&name, Kind::Web).await;
    if deploying {
        return Ok(deploying_view(
            &name,
            "Model deployment is in progress. Please wait...",
        ));
    }

    if !manager.storage().bundle_path(&name).is_file() {
        return Err(Error::MissingBundle(name).into());
    }
    manager.deploy_in_background(name.clone(), None);

    Ok(deploying_view(
        &name,
        "Starting model deployment. This may take a few minutes...",
    ))
}

async fn api_doc(
    Extension(manager): Extension<DeploymentManager>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    require_release(&manager, &name)?;
    let descriptor = Descriptor::read_from(&manager.storage().release_descriptor_path(&name))
        .map_err(Error::Io)?;

    let api_endpoints = json!({
        "Model API": format!("/model/{name}/"),
        "API Doc": format!("/model/{name}/api_doc"),
        "Instances": format!("/model/{name}/instances"),
    });

    let detailed_api_docs = match manager.registry().pick_running(&name, Kind::Inference).await {
        Some(instance) => probe_api_info(&instance).await,
        None => Value::String(
            "No running inference instances available for API definition.".to_string(),
        ),
    };

    let num_endpoints = descriptor.api_endpoints.len();

    Ok(Json(json!({
        "model_name": name,
        "descriptor": descriptor,
        "num_endpoints": num_endpoints,
        "api_endpoints": api_endpoints,
        "detailed_api_docs": detailed_api_docs,
    })))
}

/// Probe a running inference instance for its self-reported API definition.
async fn probe_api_info(instance: &Instance) -> Value {
    let result = async {
        let uri: hyper::Uri = format!("{}/gradio_api/info", instance.url)
            .parse()
            .map_err(|err: hyper::http::uri::InvalidUri| err.to_string())?;
        let response = tokio::time::timeout(API_PROBE_TIMEOUT, proxy::http_client().get(uri))
            .await
            .map_err(|_| "timed out".to_string())?
            .map_err(|err| err.to_string())?;
        if !response.status().is_success() {
            return Err(format!("status {}", response.status()));
        }
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|err| err.to_string())?;
        serde_json::from_slice::<Value>(&body).map_err(|err| err.to_string())
    }
    .await;

    match result {
        Ok(value) => value,
        Err(error) => Value::String(format!(
            "Error fetching API definition from instance at port {}: {error}",
            instance.port
        )),
    }
}

async fn instances_view(
    Extension(manager): Extension<DeploymentManager>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    let records = manager.registry().instances(&name).await.unwrap_or_default();

    let mut instances = Vec::with_capacity(records.len());
    for record in records {
        let logs = read_tail(&record.sandbox_dir.join("app.log"), LOG_TAIL_BYTES)
            .await
            .unwrap_or_default();
        instances.push(json!({
            "instance_id": record.id,
            "type": record.kind,
            "label": kind_label(record.kind),
            "port": record.port,
            "url": record.url,
            "status": record.status,
            "deployed_at": record.created_at,
            "app_dir": record.sandbox_dir,
            "logs": logs,
        }));
    }

    let descriptor = Descriptor::read_from(&manager.storage().release_descriptor_path(&name)).ok();

    Ok(Json(json!({
        "model_name": name,
        "descriptor": descriptor,
        "instances": instances,
    })))
}

fn kind_label(kind: Kind) -> &'static str {
    match kind {
        Kind::Web => "Web App (Frontend)",
        Kind::Inference => "Inference API (Backend)",
    }
}

/// Deployment status as the frontend polls it: `deploying` is true only
/// while a kind with no running instance has a deployment under way.
async fn model_status(
    Extension(manager): Extension<DeploymentManager>,
    Path(name): Path<String>,
) -> Json<Value> {
    let records = manager.registry().instances(&name).await.unwrap_or_default();

    let mut instances = Vec::new();
    let mut has_running_web = false;
    let mut has_running_inference = false;
    let mut web_deploying = false;
    let mut inference_deploying = false;

    for record in &records {
        match record.kind {
            Kind::Web => web_deploying |= record.deploying,
            Kind::Inference => inference_deploying |= record.deploying,
        }
        if record.is_running() {
            match record.kind {
                Kind::Web => has_running_web = true,
                Kind::Inference => has_running_inference = true,
            }
            instances.push(json!({
                "type": record.kind,
                "id": record.id,
                "port": record.port,
                "url": record.url,
            }));
        }
    }

    let mut deploying = (web_deploying && !has_running_web)
        || (inference_deploying && !has_running_inference);

    // A held deployment lock counts too, until both halves have something
    // running to serve with.
    if !(has_running_web && has_running_inference)
        && (manager.is_deploying(&name, Kind::Web)
            || manager.is_deploying(&name, Kind::Inference))
    {
        deploying = true;
    }

    Json(json!({
        "model_name": name,
        "deploying": deploying,
        "instances": instances,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateInstanceForm {
    #[serde(default = "default_app_type")]
    app_type: String,
}

fn default_app_type() -> String {
    Kind::Web.dir_name().to_string()
}

async fn create_instance(
    Extension(manager): Extension<DeploymentManager>,
    Path(name): Path<String>,
    Form(form): Form<CreateInstanceForm>,
) -> Result<Json<Value>> {
    let kind: Kind = form.app_type.parse().map_err(|_| {
        Error::InvalidUpload("app_type must be web_app or inference_app".to_string())
    })?;

    require_release(&manager, &name)?;

    if manager.is_deploying(&name, kind) {
        return Err(Error::AlreadyDeploying { model: name, kind }.into());
    }
    manager.deploy_in_background(name.clone(), Some(kind));

    Ok(Json(json!({
        "model_name": name,
        "message": format!("Starting {kind} deployment. This may take a few minutes..."),
        "redirect_url": format!("/model/{name}/instances"),
        "redirect_seconds": REDIRECT_SECONDS,
    })))
}

#[derive(Debug, Deserialize)]
pub struct StopInstanceForm {
    instance_id: Uuid,
    #[serde(default)]
    instance_type: String,
}

async fn stop_instance(
    Extension(manager): Extension<DeploymentManager>,
    Path(name): Path<String>,
    Form(form): Form<StopInstanceForm>,
) -> Result<Json<Value>> {
    // Accept both the canonical kind values and the human labels the
    // instances view renders.
    let kind = if form.instance_type.contains("Web App")
        || form.instance_type == Kind::Web.dir_name()
    {
        Kind::Web
    } else {
        Kind::Inference
    };

    manager.stop(&name, kind, form.instance_id).await?;

    Ok(Json(json!({
        "model_name": name,
        "instance_id": form.instance_id,
        "status": "stopped",
    })))
}

async fn proxy_model(
    Extension(manager): Extension<DeploymentManager>,
    Path((name, subpath)): Path<(String, String)>,
    req: Request<Body>,
) -> axum::response::Response {
    proxy::handle(&manager, &name, &subpath, req)
        .await
        .into_response()
}

fn require_release(manager: &DeploymentManager, name: &str) -> Result<()> {
    if !manager.storage().model_exists(name)
        || !manager.storage().release_descriptor_path(name).is_file()
    {
        return Err(Error::UnknownModel(name.to_string()).into());
    }

    Ok(())
}

fn deploying_view(model: &str, message: &str) -> axum::response::Response {
    Json(json!({
        "model_name": model,
        "message": message,
        "redirect_url": format!("/model/{model}"),
        "redirect_seconds": REDIRECT_SECONDS,
    }))
    .into_response()
}
