//! End-to-end tests of the control surface, driven through the router
//! with an in-process bus and a local git fixture.

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use scm::Registry;
use scm_config::Settings;
use scm_server::{AppState, router};
use serde_json::Value;
use tower::ServiceExt;

fn have_tools() -> bool {
    let ok = scm_process::command_exists("git")
        && scm_process::command_exists("rsync")
        && scm_process::command_exists("tar");
    if !ok {
        eprintln!("git, rsync or tar is not installed, skipping");
    }
    ok
}

async fn git_fixture(root: &Path) -> String {
    let repo = root.join("repo");
    std::fs::create_dir_all(repo.join("toto")).expect("mkdir");
    std::fs::write(repo.join("toto/test"), "Hello world").expect("write");
    for args in [
        vec!["init", "-b", "master", "."],
        vec!["config", "user.email", "you@example.com"],
        vec!["config", "user.name", "Your Name"],
        vec!["add", "."],
        vec!["commit", "-m", "Initial commit"],
    ] {
        let result = scm_process::run_command_in_dir("git", &args, &repo)
            .await
            .expect("git");
        assert!(result.success, "git {args:?} failed: {}", result.stderr);
    }
    repo.display().to_string()
}

struct TestNode {
    router: Router,
    registry: Arc<Registry>,
}

async fn setup(root: &Path, repo: &str) -> TestNode {
    let mut settings = Settings::default();
    settings.target = root.join("config");
    settings.master_target = root.join("master_config");
    settings.secret = Some("changeme".to_string());
    settings.github_secret = Some("hook-secret".to_string());
    settings.master_config = Some(format!(
        r#"
sources:
  s1:
    type: git
    repo: {repo}
    template_engines:
      - type: hbs
        data:
          param: world
          api_key: hidden
"#
    ));
    let settings = Arc::new(settings);

    let bus = scm_broadcast::connect(None).await.expect("bus");
    let registry = Registry::new(Arc::clone(&settings), bus);
    registry.init().await.expect("init");

    // The inline config loads in the background.
    for _ in 0..100 {
        if let Some(engine) = registry.get_source("s1").await
            && engine.is_loaded()
        {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    let engine = registry.get_source("s1").await.expect("s1");
    assert!(engine.is_loaded(), "s1 never loaded");

    TestNode {
        router: router(AppState {
            registry: Arc::clone(&registry),
            settings,
        }),
        registry,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn get_admin(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("X-Scm-Secret", "changeme")
        .body(Body::empty())
        .expect("request")
}

fn post_admin(uri: &str, event: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("X-Scm-Secret", "changeme")
        .header("X-GitHub-Event", event)
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn refresh_requires_a_credential() {
    if !have_tools() {
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let repo = git_fixture(td.path()).await;
    let node = setup(td.path(), &repo).await;

    let response = node
        .router
        .clone()
        .oneshot(get("/scm/1/refresh/s1"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = node
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/scm/1/refresh/s1")
                .header("X-Scm-Secret", "wrong")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn refresh_of_unknown_id_is_not_found() {
    if !have_tools() {
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let repo = git_fixture(td.path()).await;
    let node = setup(td.path(), &repo).await;

    let response = node
        .router
        .clone()
        .oneshot(get_admin("/scm/1/refresh/missing"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn refresh_triggers_a_reload() {
    if !have_tools() {
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let repo = git_fixture(td.path()).await;
    let node = setup(td.path(), &repo).await;

    let response = node
        .router
        .clone()
        .oneshot(get_admin("/scm/1/refresh/s1"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, serde_json::json!({"status": 200}));
}

#[tokio::test]
async fn webhook_filters_events_and_branches() {
    if !have_tools() {
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let repo = git_fixture(td.path()).await;
    let node = setup(td.path(), &repo).await;

    // Non-push events are acknowledged but ignored.
    let response = node
        .router
        .clone()
        .oneshot(post_admin(
            "/scm/1/refresh/s1",
            "pull_request",
            r#"{"ref": "refs/heads/master"}"#,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        serde_json::json!({"status": 200, "ignored": true, "reason": "Not a push"})
    );

    // Pushes on another branch are ignored with the sanitized branch name.
    let response = node
        .router
        .clone()
        .oneshot(post_admin(
            "/scm/1/refresh/s1",
            "push",
            r#"{"ref": "refs/heads/dev"}"#,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        serde_json::json!({"status": 200, "ignored": true, "reason": "Not master branch"})
    );

    // A missing ref is a hard error.
    let response = node
        .router
        .clone()
        .oneshot(post_admin("/scm/1/refresh/s1", "push", "{}"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // The matching branch refreshes.
    let response = node
        .router
        .clone()
        .oneshot(post_admin(
            "/scm/1/refresh/s1",
            "push",
            r#"{"ref": "refs/heads/master"}"#,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, serde_json::json!({"status": 200}));
}

#[tokio::test]
async fn webhook_signature_grants_access() {
    if !have_tools() {
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let repo = git_fixture(td.path()).await;
    let node = setup(td.path(), &repo).await;

    let body = r#"{"ref": "refs/heads/master"}"#;
    let signature = scm_auth::sign_body(b"hook-secret", body.as_bytes()).expect("sign");

    let response = node
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/scm/1/refresh/s1")
                .header("X-GitHub-Event", "push")
                .header("X-Hub-Signature-256", &signature)
                .body(Body::from(body))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, serde_json::json!({"status": 200}));

    // A tampered signature falls back to anonymous and is rejected.
    let mut tampered = signature.into_bytes();
    let last = tampered.last_mut().expect("non-empty");
    *last = if *last == b'0' { b'1' } else { b'0' };
    let response = node
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/scm/1/refresh/s1")
                .header("X-GitHub-Event", "push")
                .header(
                    "X-Hub-Signature-256",
                    String::from_utf8(tampered).expect("utf8"),
                )
                .body(Body::from(body))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn status_aggregates_and_redacts() {
    if !have_tools() {
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let repo = git_fixture(td.path()).await;
    let node = setup(td.path(), &repo).await;

    let response = node
        .router
        .clone()
        .oneshot(get_admin("/scm/1/status"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;

    let slaves = body["slaves"].as_object().expect("slaves");
    assert_eq!(slaves.len(), 1);
    let (_, entry) = slaves.iter().next().expect("one node");
    let s1 = &entry["sources"]["s1"];
    assert_eq!(s1["type"], "git");
    assert!(s1["hash"].is_string(), "missing hash: {s1}");
    assert!(s1.get("ssh_key").is_none());
    assert!(s1.get("hostname").is_none());
    assert!(s1.get("pid").is_none());
    // Sensitive template data is masked.
    assert_eq!(s1["template_engines"][0]["data"]["param"], "world");
    assert_eq!(s1["template_engines"][0]["data"]["api_key"], "•••");

    let response = node
        .router
        .clone()
        .oneshot(get_admin("/scm/1/status/s1"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let statuses = body["statuses"].as_array().expect("statuses");
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0]["hash"].is_string());
    assert!(statuses[0].get("hostname").is_none());
}

#[tokio::test]
async fn tarball_round_trips() {
    if !have_tools() {
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let repo = git_fixture(td.path()).await;
    let node = setup(td.path(), &repo).await;

    let response = node
        .router
        .clone()
        .oneshot(get_admin("/scm/1/tarball/s1"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("application/x-gtar")
    );
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();

    let extract = td.path().join("extract");
    std::fs::create_dir_all(&extract).expect("mkdir");
    let result = scm_process::run_command_filter(
        "tar",
        &[
            "--extract",
            "--gzip",
            "--directory",
            &extract.display().to_string(),
        ],
        &[],
        &bytes,
    )
    .await
    .expect("extract");
    assert!(result.success, "tar extract failed: {}", result.stderr);

    assert_eq!(
        std::fs::read_to_string(extract.join("toto/test")).expect("read"),
        "Hello world"
    );
    assert!(extract.join(".gitstats").is_file());

    // The extraction matches the materialized source byte for byte.
    let published = node
        .registry
        .get_source("s1")
        .await
        .expect("s1")
        .target_path();
    assert_eq!(
        std::fs::read(extract.join(".gitstats")).expect("read"),
        std::fs::read(published.join(".gitstats")).expect("read")
    );

    // Unknown ids have no tarball.
    let response = node
        .router
        .clone()
        .oneshot(get_admin("/scm/1/tarball/missing"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn slave_fetches_the_published_tarball() {
    if !have_tools() {
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let repo = git_fixture(td.path()).await;
    let node = setup(td.path(), &repo).await;

    // Serve the master surface on an ephemeral port.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let address = listener.local_addr().expect("address");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, node.router).await;
    });

    // A slave engine of the same source, pointing at the master.
    let mut slave_settings = Settings::default();
    slave_settings.is_slave = true;
    slave_settings.target = td.path().join("slave_config");
    slave_settings.master_target = td.path().join("slave_master_config");
    slave_settings.secret = Some("changeme".to_string());
    slave_settings.api_base_url = Some(format!("http://{address}/scm/"));
    slave_settings.retry_delay = 0;

    let mut declaration = scm_config::SourceDeclaration::new(scm_config::SourceKind::Git);
    declaration.repo = Some(repo.clone());
    let engine = scm::SourceEngine::new("s1", declaration, false, Arc::new(slave_settings.clone()))
        .await
        .expect("engine");

    // Stale content disappears with the delete-then-extract semantics.
    let target = engine.target_path();
    std::fs::create_dir_all(&target).expect("mkdir");
    std::fs::write(target.join("stale"), "old").expect("write");

    engine.fetch().await.expect("fetch");
    assert!(engine.is_loaded());
    assert_eq!(
        std::fs::read_to_string(target.join("toto/test")).expect("read"),
        "Hello world"
    );
    assert!(target.join(".gitstats").is_file());
    assert!(!target.join("stale").exists());

    // An unknown id exhausts the retries and leaves the engine unloaded.
    let mut declaration = scm_config::SourceDeclaration::new(scm_config::SourceKind::Git);
    declaration.repo = Some(repo);
    let missing = scm::SourceEngine::new("missing", declaration, false, Arc::new(slave_settings))
        .await
        .expect("engine");
    assert!(missing.fetch().await.is_err());
    assert!(!missing.is_loaded());

    server.abort();
}

#[tokio::test]
async fn health_needs_no_credential() {
    let td = tempfile::tempdir().expect("tempdir");
    let mut settings = Settings::default();
    settings.target = td.path().join("config");
    settings.master_target = td.path().join("master_config");
    settings.master_config = Some("sources: {}\n".to_string());
    let settings = Arc::new(settings);

    let bus = scm_broadcast::connect(None).await.expect("bus");
    let registry = Registry::new(Arc::clone(&settings), bus);
    registry.init().await.expect("init");

    let app = router(AppState { registry, settings });
    let response = app
        .oneshot(get("/health"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}
