use std::convert::Infallible;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use hyper::service::{make_service_fn, service_fn};
use hyper::Response;
use modelbay_common::deployment::{Kind, State};
use modelbay_common::storage::StorageManager;
use modelbay_deployer::bundler::{self, Upload};
use modelbay_deployer::deployment::DeploymentManager;
use modelbay_deployer::handlers::make_router;
use modelbay_deployer::registry::{Instance, Registry};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

fn zip_of(files: &[(&str, &[u8])]) -> bytes::Bytes {
    let mut buf = std::io::Cursor::new(Vec::new());
    let mut writer = ZipWriter::new(&mut buf);
    for (name, contents) in files {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap();
    bytes::Bytes::from(buf.into_inner())
}

/// Package a minimal dual bundle and register it, the way an upload would.
async fn packaged_manager() -> (DeploymentManager, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageManager::new(dir.path().to_path_buf());

    let (descriptor, bundle_path) = bundler::package(
        storage.clone(),
        Upload {
            model_name: "ocr".to_string(),
            version: None,
            author: None,
            description: None,
            web_app: zip_of(&[("app.py", b"print('web')" as &[u8])]),
            inference_app: zip_of(&[("app.py", b"print('inference')" as &[u8])]),
        },
    )
    .await
    .unwrap();

    let registry = Registry::new();
    registry.get_or_create("ocr", &descriptor, &bundle_path).await;

    // A python that can never exist keeps accidental background deployments
    // cheap and deterministic.
    let manager = DeploymentManager::new(
        storage,
        registry,
        None,
        "/nonexistent/python".to_string(),
        "127.0.0.1".to_string(),
    );

    (manager, dir)
}

/// A stand-in inference backend answering `{"prediction":0}` on /predict and
/// counting every request it sees.
async fn spawn_backend(hits: Arc<AtomicUsize>) -> SocketAddr {
    let make_svc = make_service_fn(move |_conn| {
        let hits = hits.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<hyper::Body>| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let body = if req.uri().path() == "/predict" {
                        "{\"prediction\":0}"
                    } else {
                        "ok"
                    };
                    Ok::<_, Infallible>(Response::new(hyper::Body::from(body)))
                }
            }))
        }
    });

    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let server = hyper::Server::bind(&addr).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);

    addr
}

fn running_instance(addr: SocketAddr) -> Instance {
    Instance {
        id: Uuid::new_v4(),
        kind: Kind::Inference,
        port: addr.port(),
        pid: None,
        status: State::Running,
        url: format!("http://{addr}"),
        created_at: chrono::Utc::now(),
        deploying: false,
        sandbox_dir: "unused".into(),
    }
}

#[tokio::test]
async fn proxied_predictions_match_the_backend_and_respect_stop() {
    let (manager, _dir) = packaged_manager().await;

    let first_hits = Arc::new(AtomicUsize::new(0));
    let second_hits = Arc::new(AtomicUsize::new(0));
    let first = running_instance(spawn_backend(first_hits.clone()).await);
    let second = running_instance(spawn_backend(second_hits.clone()).await);
    manager.registry().append_instance("ocr", first.clone()).await;
    manager.registry().append_instance("ocr", second.clone()).await;

    let router = make_router(manager.clone());

    // E2: the proxied response matches what the backend answers directly.
    let response = router
        .clone()
        .oneshot(
            Request::post("/model/ocr/predict")
                .body(Body::from("{\"x\":1}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"{\"prediction\":0}");

    // The status view lists both running instances on distinct ports.
    let response = router
        .clone()
        .oneshot(Request::get("/model/ocr/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status: Value =
        serde_json::from_slice(&hyper::body::to_bytes(response.into_body()).await.unwrap())
            .unwrap();
    assert_eq!(status["deploying"], false);
    assert_eq!(status["instances"].as_array().unwrap().len(), 2);
    assert_ne!(
        status["instances"][0]["port"],
        status["instances"][1]["port"]
    );

    // E5: stop one instance; every following forward lands on the other.
    let response = router
        .clone()
        .oneshot(
            Request::post("/model/ocr/stop_instance")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(format!(
                    "instance_id={}&instance_type=inference_app",
                    second.id
                )))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stopped_hits_before = second_hits.load(Ordering::SeqCst);
    for _ in 0..100 {
        let response = router
            .clone()
            .oneshot(
                Request::post("/model/ocr/predict")
                    .body(Body::from("{\"x\":1}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(second_hits.load(Ordering::SeqCst), stopped_hits_before);
    assert!(first_hits.load(Ordering::SeqCst) >= 100);

    // A stopped instance never comes back under the same id.
    let record = manager
        .registry()
        .find("ocr", Kind::Inference, second.id)
        .await
        .unwrap();
    assert_eq!(record.status, State::Stopped);
}

#[tokio::test]
async fn lazy_deploy_answers_503_with_a_retry_hint() {
    let (manager, _dir) = packaged_manager().await;
    let router = make_router(manager);

    // E3: packaged on disk, nothing running. The request must not block on
    // the deployment it kicks off.
    let response = router
        .clone()
        .oneshot(
            Request::get("/model/ocr/some")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key(header::RETRY_AFTER));

    // Unknown models get 404, not a deployment attempt.
    let response = router
        .oneshot(
            Request::get("/model/ghost/some")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn dead_backend_is_demoted_and_the_pick_retried() {
    let (manager, _dir) = packaged_manager().await;

    // One dead instance (nothing listens on its port), one live one.
    let dead = running_instance(SocketAddr::from(([127, 0, 0, 1], 9)));
    let live_hits = Arc::new(AtomicUsize::new(0));
    let live = running_instance(spawn_backend(live_hits.clone()).await);
    manager.registry().append_instance("ocr", dead.clone()).await;
    manager.registry().append_instance("ocr", live).await;

    let router = make_router(manager.clone());

    // Forward until the dead one has been hit and demoted; every response
    // must still be a 200 served by the live backend.
    for _ in 0..20 {
        let response = router
            .clone()
            .oneshot(
                Request::post("/model/ocr/predict")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let record = manager
        .registry()
        .find("ocr", Kind::Inference, dead.id)
        .await
        .unwrap();
    assert_eq!(record.status, State::Failed);
    assert!(live_hits.load(Ordering::SeqCst) >= 20);
}

#[tokio::test]
async fn stopping_an_unknown_instance_is_not_found() {
    let (manager, _dir) = packaged_manager().await;
    manager
        .registry()
        .append_instance("ocr", running_instance(SocketAddr::from(([127, 0, 0, 1], 9))))
        .await;
    let router = make_router(manager);

    let response = router
        .oneshot(
            Request::post("/model/ocr/stop_instance")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(format!(
                    "instance_id={}&instance_type=inference_app",
                    Uuid::new_v4()
                )))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
