use bytes::Bytes;
use hyper::client::HttpConnector;
use hyper::header::{
    HeaderValue, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, HOST, RETRY_AFTER,
    TRANSFER_ENCODING,
};
use hyper::http::request::Parts;
use hyper::{Body, Client, Request, Response, StatusCode, Uri};
use modelbay_common::deployment::Kind;
use once_cell::sync::Lazy;
use serde_json::json;
use tracing::{instrument, trace, warn};

use crate::deployment::DeploymentManager;
use crate::error::Error;
use crate::registry::Instance;

static PROXY_CLIENT: Lazy<Client<HttpConnector>> = Lazy::new(Client::new);

/// Compatibility default expected by the hosted frontend kind. Injected only
/// when the caller's query string carries no session_hash of its own.
const SESSION_HASH_PARAM: &str = "session_hash";
const SESSION_HASH_DEFAULT: &str = "1234";

const RETRY_HINT_SECONDS: u64 = 5;

pub(crate) fn http_client() -> &'static Client<HttpConnector> {
    &PROXY_CLIENT
}

/// Forward a model-scoped request to a running inference instance, starting
/// a background deployment when none exists.
///
/// The request body is buffered up front so a dead backend can be demoted
/// and the pick retried once without losing the payload.
#[instrument(name = "proxy_request", skip(manager, req), fields(%model, %subpath, http.method = %req.method()))]
pub async fn handle(
    manager: &DeploymentManager,
    model: &str,
    subpath: &str,
    req: Request<Body>,
) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let body = match hyper::body::to_bytes(body).await {
        Ok(body) => body,
        Err(error) => {
            warn!(%error, "failed to read request body");
            return plain_response(StatusCode::BAD_REQUEST, "could not read request body");
        }
    };

    let Some(target) = manager.registry().pick_running(model, Kind::Inference).await else {
        return not_ready(manager, model).await;
    };

    match forward(&target, subpath, &parts, body.clone()).await {
        Ok(response) => response,
        Err(error) => {
            // Liveness is detected by connect: a backend that no longer
            // answers is demoted and the pick retried once.
            warn!(%error, instance_id = %target.id, "forward failed; demoting instance");
            manager.demote_failed(model, Kind::Inference, target.id).await;

            match manager.registry().pick_running(model, Kind::Inference).await {
                Some(retry) => forward(&retry, subpath, &parts, body)
                    .await
                    .unwrap_or_else(|error| {
                        warn!(%error, instance_id = %retry.id, "retry forward failed");
                        upstream_error_response()
                    }),
                None => not_ready(manager, model).await,
            }
        }
    }
}

async fn not_ready(manager: &DeploymentManager, model: &str) -> Response<Body> {
    let known = manager.registry().contains(model).await
        || (manager.storage().release_descriptor_path(model).is_file()
            && manager.storage().bundle_path(model).is_file());
    if !known {
        return json_response(
            StatusCode::NOT_FOUND,
            json!({ "message": format!("unknown model: {model}") }),
        );
    }

    if !manager.is_deploying(model, Kind::Inference) {
        trace!(%model, "no running backend; starting background deployment");
        manager.deploy_in_background(model.to_string(), Some(Kind::Inference));
    }

    let mut response = json_response(
        StatusCode::SERVICE_UNAVAILABLE,
        json!({
            "message": format!(
                "inference backend for {model} is deploying; retry in a few seconds"
            ),
        }),
    );
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from(RETRY_HINT_SECONDS));
    response
}

/// Forward one buffered request 1:1 to the target instance: method, body,
/// cookies and headers are preserved, except `Host`; the fixed hop-by-hop
/// header set is stripped from the response. Redirects are handed back to
/// the client untouched.
async fn forward(
    target: &Instance,
    subpath: &str,
    parts: &Parts,
    body: Bytes,
) -> Result<Response<Body>, Error> {
    let uri = target_uri(&target.url, subpath, parts.uri.query())
        .map_err(|err| Error::ProxyUpstream(err.to_string()))?;

    let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
    for (name, value) in &parts.headers {
        if name != &HOST {
            builder = builder.header(name, value);
        }
    }
    let request = builder
        .body(Body::from(body))
        .map_err(|err| Error::ProxyUpstream(err.to_string()))?;

    let mut response = PROXY_CLIENT
        .request(request)
        .await
        .map_err(|err| Error::ProxyUpstream(err.to_string()))?;

    for name in [CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING, CONNECTION] {
        response.headers_mut().remove(name);
    }

    Ok(response)
}

fn target_uri(
    base: &str,
    subpath: &str,
    query: Option<&str>,
) -> Result<Uri, hyper::http::uri::InvalidUri> {
    format!("{base}/{subpath}{}", compose_query(query)).parse()
}

fn compose_query(original: Option<&str>) -> String {
    match original {
        None | Some("") => format!("?{SESSION_HASH_PARAM}={SESSION_HASH_DEFAULT}"),
        Some(query)
            if query
                .split('&')
                .any(|pair| pair.split('=').next() == Some(SESSION_HASH_PARAM)) =>
        {
            format!("?{query}")
        }
        Some(query) => format!("?{query}&{SESSION_HASH_PARAM}={SESSION_HASH_DEFAULT}"),
    }
}

fn upstream_error_response() -> Response<Body> {
    json_response(
        StatusCode::BAD_GATEWAY,
        json!({ "message": "upstream inference instance did not answer" }),
    )
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message))
        .unwrap()
}
