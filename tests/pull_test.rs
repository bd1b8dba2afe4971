//! End-to-end pull scenarios against a mock v2 registry

mod common;

use common::*;
use docker_image_puller::logging::Logger;
use docker_image_puller::pull::PullSession;
use docker_image_puller::registry::client::Remote;
use docker_image_puller::stream;
use docker_image_puller::{ImageRef, PullError};
use serde_json::{Value, json};
use tokio_util::io::SyncIoBridge;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_remote(reference: &ImageRef) -> Remote {
    Remote::builder(reference.clone())
        .with_plain_http(true)
        .with_logger(Logger::new_quiet())
        .build()
        .unwrap()
}

fn session(reference: &ImageRef, parent: &std::path::Path) -> PullSession {
    PullSession::new(test_remote(reference), Logger::new_quiet())
        .with_workspace_parent(parent.to_path_buf())
}

fn image_config(contents: &std::collections::BTreeMap<String, Vec<u8>>) -> (String, Value) {
    let (name, bytes) = contents
        .iter()
        .find(|(name, _)| name.ends_with(".json") && *name != "manifest.json")
        .expect("image config file present");
    (name.clone(), serde_json::from_slice(bytes).unwrap())
}

#[tokio::test]
async fn test_pull_with_bearer_auth() {
    let server = MockServer::start().await;
    let top = layer(b"top layer tar bytes", r#"{"id":"top","os":"linux","architecture":"amd64"}"#);
    let bottom = layer(b"bottom layer tar bytes", r#"{"id":"bottom"}"#);
    let manifest = signed_manifest("library/redis", "3.0.5", &[&top, &bottom]);
    mount_bearer_registry(&server, "library/redis", "3.0.5", &manifest, &[&top, &bottom]).await;

    let reference =
        ImageRef::parse(&format!("docker://{}/library/redis:3.0.5", server.address())).unwrap();
    let parent = tempfile::tempdir().unwrap();
    let workspace = session(&reference, parent.path()).pull().await.unwrap();

    let contents = workspace_contents(workspace.path());

    // manifest.json lists the two layers bottom-up
    let manifest_json: Value =
        serde_json::from_slice(contents.get("manifest.json").unwrap()).unwrap();
    let layers = manifest_json[0]["Layers"].as_array().unwrap();
    assert_eq!(layers.len(), 2);
    assert_eq!(
        contents.get(layers[0].as_str().unwrap()).unwrap(),
        &bottom.payload
    );
    assert_eq!(
        contents.get(layers[1].as_str().unwrap()).unwrap(),
        &top.payload
    );

    // The image id is the digest of the config bytes, and repositories maps
    // the familiar name and tag to it
    let (config_name, config) = image_config(&contents);
    let image_id_hex = config_name.strip_suffix(".json").unwrap().to_string();
    assert_eq!(
        digest_of(contents.get(&config_name).unwrap()),
        format!("sha256:{}", image_id_hex)
    );
    let repositories: Value =
        serde_json::from_slice(contents.get("repositories").unwrap()).unwrap();
    let expected_name = format!("{}/redis", server.address());
    assert_eq!(repositories[&expected_name]["3.0.5"], json!(image_id_hex));

    // The rootfs chain records the uncompressed diff ids bottom-up
    let diff_ids = config["rootfs"]["diff_ids"].as_array().unwrap();
    assert_eq!(diff_ids[0], json!(digest_of(&bottom.payload)));
    assert_eq!(diff_ids[1], json!(digest_of(&top.payload)));

    workspace.delete().unwrap();
}

#[tokio::test]
async fn test_pull_canonical_reference_verifies() {
    let server = MockServer::start().await;
    let only = layer(b"layer bytes", r#"{"id":"only"}"#);
    let manifest = signed_manifest("library/app", "latest", &[&only]);
    let digest = manifest.canonical_digest.clone();

    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    mount_manifest(&server, "library/app", &digest, &manifest.raw).await;
    mount_blob(&server, "library/app", &only).await;

    let reference =
        ImageRef::parse(&format!("docker://{}/library/app@{}", server.address(), digest)).unwrap();
    let parent = tempfile::tempdir().unwrap();

    // Canonical pulls verify but cannot be finalized without a tag, so the
    // manifest verification is exercised via the session's failure mode
    let result = session(&reference, parent.path()).pull().await;
    assert!(matches!(result, Err(PullError::Validation(_))));
    assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_pull_canonical_reference_tamper_fails() {
    let server = MockServer::start().await;
    let only = layer(b"layer bytes", r#"{"id":"only"}"#);
    let manifest = signed_manifest("library/app", "latest", &[&only]);
    let digest = manifest.canonical_digest.clone();

    // Flip bytes inside the canonical region
    let tampered = String::from_utf8(manifest.raw.clone())
        .unwrap()
        .replacen("amd64", "arm64", 1)
        .into_bytes();

    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    mount_manifest(&server, "library/app", &digest, &tampered).await;

    let reference =
        ImageRef::parse(&format!("docker://{}/library/app@{}", server.address(), digest)).unwrap();
    let parent = tempfile::tempdir().unwrap();
    let result = session(&reference, parent.path()).pull().await;
    assert!(matches!(result, Err(PullError::Manifest(_))));
    assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_pull_with_throwaway_layer() {
    let server = MockServer::start().await;
    let top = layer(b"top", r#"{"id":"top","os":"linux"}"#);
    let middle = throwaway_layer(r#"{"id":"middle","throwaway":true}"#);
    let bottom = layer(b"bottom", r#"{"id":"bottom"}"#);
    let manifest = signed_manifest("library/app", "latest", &[&top, &middle, &bottom]);
    // The throwaway blob is never requested on a direct pull
    mount_anonymous_registry(&server, "library/app", "latest", &manifest, &[&top, &bottom]).await;

    let reference =
        ImageRef::parse(&format!("docker://{}/library/app:latest", server.address())).unwrap();
    let parent = tempfile::tempdir().unwrap();
    let workspace = session(&reference, parent.path()).pull().await.unwrap();

    let contents = workspace_contents(workspace.path());
    let manifest_json: Value =
        serde_json::from_slice(contents.get("manifest.json").unwrap()).unwrap();
    assert_eq!(manifest_json[0]["Layers"].as_array().unwrap().len(), 2);

    let layer_dirs = std::fs::read_dir(workspace.path())
        .unwrap()
        .filter(|e| e.as_ref().unwrap().path().is_dir())
        .count();
    assert_eq!(layer_dirs, 2);

    // History keeps all three entries, the middle one flagged
    let (_, config) = image_config(&contents);
    let history = config["history"].as_array().unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[1]["empty_layer"], json!(true));
    assert!(history[0].get("empty_layer").is_none());
    assert_eq!(config["rootfs"]["diff_ids"].as_array().unwrap().len(), 2);

    workspace.delete().unwrap();
}

#[tokio::test]
async fn test_pull_integrity_failure_removes_workspace() {
    let server = MockServer::start().await;
    let mut bad = layer(b"actual payload", r#"{"id":"only"}"#);
    // The manifest promises a digest the served bytes do not hash to
    bad.blob_sum = digest_of(b"some other blob");
    let manifest = signed_manifest("library/app", "latest", &[&bad]);
    mount_anonymous_registry(&server, "library/app", "latest", &manifest, &[&bad]).await;

    let reference =
        ImageRef::parse(&format!("docker://{}/library/app:latest", server.address())).unwrap();
    let parent = tempfile::tempdir().unwrap();
    let result = session(&reference, parent.path()).pull().await;

    assert!(matches!(result, Err(PullError::Integrity { .. })));
    assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_pull_empty_manifest_fails() {
    let server = MockServer::start().await;
    let manifest = signed_manifest("library/app", "latest", &[]);
    mount_anonymous_registry(&server, "library/app", "latest", &manifest, &[]).await;

    let reference =
        ImageRef::parse(&format!("docker://{}/library/app:latest", server.address())).unwrap();
    let parent = tempfile::tempdir().unwrap();
    let result = session(&reference, parent.path()).pull().await;
    assert!(matches!(result, Err(PullError::Manifest(_))));
    assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_pull_unsupported_protocol() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/_ping"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let reference =
        ImageRef::parse(&format!("docker://{}/library/app:latest", server.address())).unwrap();
    let parent = tempfile::tempdir().unwrap();
    let result = session(&reference, parent.path()).pull().await;
    assert!(matches!(result, Err(PullError::Registry(_))));
}

#[tokio::test]
async fn test_stream_round_trip_matches_direct_pull() {
    let server = MockServer::start().await;
    let top = layer(b"top layer tar", r#"{"id":"top","os":"linux"}"#);
    let middle = throwaway_layer(r#"{"id":"middle","throwaway":true}"#);
    let bottom = layer(b"bottom layer tar", r#"{"id":"bottom"}"#);
    let manifest = signed_manifest("library/app", "latest", &[&top, &middle, &bottom]);
    // The producer streams every manifest entry, throwaway blobs included;
    // the consumer drains them to keep the tar framing aligned
    mount_anonymous_registry(
        &server,
        "library/app",
        "latest",
        &manifest,
        &[&top, &middle, &bottom],
    )
    .await;

    let reference =
        ImageRef::parse(&format!("docker://{}/library/app:latest", server.address())).unwrap();

    // Direct pull
    let parent_direct = tempfile::tempdir().unwrap();
    let direct = session(&reference, parent_direct.path())
        .pull()
        .await
        .unwrap();

    // Produce into a pipe and reconstruct on the consumer side
    let remote = test_remote(&reference);
    let (reader, mut writer) = tokio::io::duplex(64 * 1024);
    let producer = tokio::spawn(async move {
        stream::produce(&remote, &Logger::new_quiet(), &mut writer).await
    });

    let parent_stream = tempfile::tempdir().unwrap();
    let stream_parent_path = parent_stream.path().to_path_buf();
    let consumer_reference = reference.clone();
    let consumer = tokio::task::spawn_blocking(move || {
        stream::import_from_stream(
            SyncIoBridge::new(reader),
            &consumer_reference,
            Some(&stream_parent_path),
            &Logger::new_quiet(),
        )
    });

    let streamed = consumer.await.unwrap().unwrap();
    producer.await.unwrap().unwrap();

    // Identical trees modulo the workspace directory names
    assert_eq!(
        workspace_contents(direct.path()),
        workspace_contents(streamed.path())
    );

    direct.delete().unwrap();
    streamed.delete().unwrap();
}

#[tokio::test]
async fn test_producer_error_truncates_stream() {
    let server = MockServer::start().await;
    let only = layer(b"layer bytes", r#"{"id":"only"}"#);
    let manifest = signed_manifest("library/app", "latest", &[&only]);
    // Manifest is served but the blob endpoint is not mounted, so the
    // producer fails mid-stream and drops its end of the pipe
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    mount_manifest(&server, "library/app", "latest", &manifest.raw).await;

    let reference =
        ImageRef::parse(&format!("docker://{}/library/app:latest", server.address())).unwrap();
    let reader = stream::stream_layers(
        std::sync::Arc::new(test_remote(&reference)),
        Logger::new_quiet(),
    );

    let parent = tempfile::tempdir().unwrap();
    let parent_path = parent.path().to_path_buf();
    let consumer_reference = reference.clone();
    let result = tokio::task::spawn_blocking(move || {
        stream::import_from_stream(
            SyncIoBridge::new(reader),
            &consumer_reference,
            Some(&parent_path),
            &Logger::new_quiet(),
        )
    })
    .await
    .unwrap();

    assert!(result.is_err());
    assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_auth_rechallenge_mid_session_reuses_token() {
    let server = MockServer::start().await;
    let only = layer(b"layer bytes", r#"{"id":"only"}"#);
    let manifest = signed_manifest("library/app", "latest", &[&only]);
    let challenge = format!(
        "Bearer realm=\"{}/token\",service=\"registry.test\"",
        server.uri()
    );
    let authorization = format!("Bearer {}", TEST_TOKEN);

    // Some registries allow the protocol probe anonymously
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    // The challenge omits a scope; the client supplies its pull-scope hint,
    // and the one token fetch covers the manifest and every blob after it
    Mock::given(method("GET"))
        .and(path("/token"))
        .and(query_param("scope", "repository:library/app:pull"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": TEST_TOKEN, "expires_in": 300})),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v2/library/app/manifests/latest"))
        .and(MissingHeader("authorization"))
        .respond_with(
            ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge.as_str()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/library/app/manifests/latest"))
        .and(header("Authorization", authorization.as_str()))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(
                    "Content-Type",
                    "application/vnd.docker.distribution.manifest.v1+prettyjws",
                )
                .set_body_bytes(manifest.raw.clone()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/library/app/blobs/{}", only.blob_sum)))
        .and(header("Authorization", authorization.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(only.blob.clone()))
        .mount(&server)
        .await;

    let reference =
        ImageRef::parse(&format!("docker://{}/library/app:latest", server.address())).unwrap();
    let parent = tempfile::tempdir().unwrap();
    let workspace = session(&reference, parent.path()).pull().await.unwrap();
    workspace.delete().unwrap();
}

#[tokio::test]
async fn test_blob_401_with_cached_token_fails_unauthorized() {
    let server = MockServer::start().await;
    let only = layer(b"layer bytes", r#"{"id":"only"}"#);
    let manifest = signed_manifest("library/app", "latest", &[&only]);
    let challenge = format!(
        "Bearer realm=\"{}/token\",service=\"registry.test\"",
        server.uri()
    );
    let authorization = format!("Bearer {}", TEST_TOKEN);

    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    mount_token_endpoint(&server).await;
    Mock::given(method("GET"))
        .and(path("/v2/library/app/manifests/latest"))
        .and(MissingHeader("authorization"))
        .respond_with(
            ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge.as_str()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/library/app/manifests/latest"))
        .and(header("Authorization", authorization.as_str()))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(
                    "Content-Type",
                    "application/vnd.docker.distribution.manifest.v1+prettyjws",
                )
                .set_body_bytes(manifest.raw.clone()),
        )
        .mount(&server)
        .await;
    // The blob endpoint rejects even the fresh token; no infinite recovery
    Mock::given(method("GET"))
        .and(path(format!("/v2/library/app/blobs/{}", only.blob_sum)))
        .respond_with(
            ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge.as_str()),
        )
        .mount(&server)
        .await;

    let reference =
        ImageRef::parse(&format!("docker://{}/library/app:latest", server.address())).unwrap();
    let parent = tempfile::tempdir().unwrap();
    let result = session(&reference, parent.path()).pull().await;
    assert!(matches!(result, Err(PullError::Unauthorized)));
    assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
}
