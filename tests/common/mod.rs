//! Shared fixtures for the integration tests: schema 1 manifest builders
//! and a mock v2 registry.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::json;
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use wiremock::matchers::{header, method, path};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

pub const TEST_TOKEN: &str = "integration-test-token";

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// One fixture layer: the uncompressed payload, the gzipped blob as the
/// registry would serve it, and the manifest fields referring to it.
pub struct FixtureLayer {
    pub payload: Vec<u8>,
    pub blob: Vec<u8>,
    pub blob_sum: String,
    pub v1_compatibility: String,
}

pub fn layer(payload: &[u8], v1_compatibility: &str) -> FixtureLayer {
    let blob = gzip(payload);
    let blob_sum = digest_of(&blob);
    FixtureLayer {
        payload: payload.to_vec(),
        blob,
        blob_sum,
        v1_compatibility: v1_compatibility.to_string(),
    }
}

/// A throwaway layer still occupies a manifest slot (and a stream entry),
/// conventionally backed by the empty gzip blob. The throwaway marker
/// lives in its v1 compatibility JSON.
pub fn throwaway_layer(v1_compatibility: &str) -> FixtureLayer {
    layer(b"", v1_compatibility)
}

pub struct FixtureManifest {
    pub raw: Vec<u8>,
    /// Digest of the canonical payload, for canonical-reference pulls
    pub canonical_digest: String,
}

/// Build a signed schema 1 manifest. `layers` are in manifest order, top
/// layer first.
pub fn signed_manifest(name: &str, tag: &str, layers: &[&FixtureLayer]) -> FixtureManifest {
    let fs_layers: Vec<_> = layers
        .iter()
        .map(|l| json!({"blobSum": l.blob_sum}))
        .collect();
    let history: Vec<_> = layers
        .iter()
        .map(|l| json!({"v1Compatibility": l.v1_compatibility}))
        .collect();

    let payload = serde_json::to_vec_pretty(&json!({
        "schemaVersion": 1,
        "name": name,
        "tag": tag,
        "architecture": "amd64",
        "fsLayers": fs_layers,
        "history": history,
    }))
    .unwrap();

    FixtureManifest {
        canonical_digest: digest_of(&payload),
        raw: jws_wrap(&payload),
    }
}

/// Wrap a payload in a prettyjws envelope: signatures are appended before
/// the closing brace and the protected header records how to reassemble
/// the canonical bytes.
pub fn jws_wrap(payload: &[u8]) -> Vec<u8> {
    let format_length = payload.len() - 2;
    let format_tail = URL_SAFE_NO_PAD.encode(&payload[format_length..]);
    let protected = URL_SAFE_NO_PAD.encode(
        format!(
            "{{\"formatLength\":{},\"formatTail\":\"{}\",\"time\":\"2016-02-01T00:00:00Z\"}}",
            format_length, format_tail
        )
        .as_bytes(),
    );
    let mut raw = payload[..format_length].to_vec();
    raw.extend_from_slice(
        format!(
            ",\n   \"signatures\": [{{\"header\": {{}}, \"protected\": \"{}\", \"signature\": \"\"}}]\n}}",
            protected
        )
        .as_bytes(),
    );
    raw
}

/// Matches requests that do not carry the given header at all
pub struct MissingHeader(pub &'static str);

impl Match for MissingHeader {
    fn matches(&self, request: &Request) -> bool {
        !request.headers.contains_key(self.0)
    }
}

pub async fn mount_blob(server: &MockServer, repo: &str, fixture: &FixtureLayer) {
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/blobs/{}", repo, fixture.blob_sum)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(fixture.blob.clone()))
        .mount(server)
        .await;
}

/// A registry that answers everything without authentication
pub async fn mount_anonymous_registry(
    server: &MockServer,
    repo: &str,
    tag: &str,
    manifest: &FixtureManifest,
    layers: &[&FixtureLayer],
) {
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    mount_manifest(server, repo, tag, &manifest.raw).await;
    for fixture in layers {
        mount_blob(server, repo, fixture).await;
    }
}

pub async fn mount_manifest(server: &MockServer, repo: &str, reference: &str, raw: &[u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/manifests/{}", repo, reference)))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(
                    "Content-Type",
                    "application/vnd.docker.distribution.manifest.v1+prettyjws",
                )
                .set_body_bytes(raw.to_vec()),
        )
        .mount(server)
        .await;
}

fn bearer_challenge(server: &MockServer, repo: &str) -> String {
    format!(
        "Bearer realm=\"{}/token\",service=\"registry.test\",scope=\"repository:{}:pull\"",
        server.uri(),
        repo
    )
}

pub async fn mount_token_endpoint(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": TEST_TOKEN, "expires_in": 300})),
        )
        .mount(server)
        .await;
}

/// A registry that 401s every unauthenticated request with a Bearer
/// challenge pointing at its own token endpoint, and serves content once
/// the test token is presented.
pub async fn mount_bearer_registry(
    server: &MockServer,
    repo: &str,
    tag: &str,
    manifest: &FixtureManifest,
    layers: &[&FixtureLayer],
) {
    let challenge = bearer_challenge(server, repo);
    let authorization = format!("Bearer {}", TEST_TOKEN);

    mount_token_endpoint(server).await;

    Mock::given(method("GET"))
        .and(path("/v2/"))
        .and(MissingHeader("authorization"))
        .respond_with(
            ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge.as_str()),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .and(header("Authorization", authorization.as_str()))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/manifests/{}", repo, tag)))
        .and(MissingHeader("authorization"))
        .respond_with(
            ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge.as_str()),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/manifests/{}", repo, tag)))
        .and(header("Authorization", authorization.as_str()))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(
                    "Content-Type",
                    "application/vnd.docker.distribution.manifest.v1+prettyjws",
                )
                .set_body_bytes(manifest.raw.clone()),
        )
        .mount(server)
        .await;

    for fixture in layers {
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/blobs/{}", repo, fixture.blob_sum)))
            .and(MissingHeader("authorization"))
            .respond_with(
                ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge.as_str()),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/blobs/{}", repo, fixture.blob_sum)))
            .and(header("Authorization", authorization.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(fixture.blob.clone()))
            .mount(server)
            .await;
    }
}

/// Collect every file under `root` as relative-path -> contents
pub fn workspace_contents(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut contents = BTreeMap::new();
    collect_files(root, root, &mut contents);
    contents
}

fn collect_files(root: &Path, dir: &Path, contents: &mut BTreeMap<String, Vec<u8>>) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, contents);
        } else {
            let relative = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
            contents.insert(relative, std::fs::read(&path).unwrap());
        }
    }
}
