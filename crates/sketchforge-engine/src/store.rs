use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;
use sha1::{Digest, Sha1};
use sketchforge_contracts::config::{Secret, StorageConfig};
use sketchforge_contracts::errors::StageError;
use sketchforge_contracts::sketch::{Artifact, UploadSource};
use tracing::info;

use crate::transport::{
    error_chain_text, http_client, response_json_or_error, STAGE_DETAIL_MAX_CHARS,
};

const DELIVERY_BASE: &str = "https://res.cloudinary.com";

/// Durable storage for finished images.
///
/// Both call shapes converge on [`ArtifactStore::upload`]. Stores never delete
/// the source file and never reuse an earlier result for identical content.
pub trait ArtifactStore: Send + Sync {
    fn upload(&self, source: &UploadSource, public_id: Option<&str>) -> Result<Artifact, StageError>;

    fn upload_local(&self, path: &Path, public_id: Option<&str>) -> Result<Artifact, StageError> {
        self.upload(&UploadSource::LocalPath(path.to_path_buf()), public_id)
    }

    fn upload_from_url(&self, url: &str, public_id: Option<&str>) -> Result<Artifact, StageError> {
        self.upload(&UploadSource::RemoteUrl(url.to_string()), public_id)
    }
}

/// Signed uploads to Cloudinary's image upload API.
pub struct CloudinaryStore {
    endpoint: String,
    api_key: String,
    api_secret: Secret,
    http: HttpClient,
}

impl CloudinaryStore {
    pub fn new(config: StorageConfig) -> Result<Self> {
        Ok(Self {
            endpoint: format!("{}/{}/image/upload", config.api_base, config.cloud_name),
            api_key: config.api_key,
            api_secret: config.api_secret,
            http: http_client(config.request_timeout)?,
        })
    }

    fn build_form(
        &self,
        source: &UploadSource,
        public_id: Option<&str>,
        timestamp: u64,
    ) -> Result<MultipartForm> {
        let mut signed = vec![("timestamp", timestamp.to_string())];
        if let Some(id) = public_id {
            signed.push(("public_id", id.to_string()));
        }
        let signature = sign_params(&signed, self.api_secret.expose());

        let file_part = match source {
            UploadSource::LocalPath(path) => {
                let bytes = fs::read(path)
                    .with_context(|| format!("failed reading {}", path.display()))?;
                let file_name = path
                    .file_name()
                    .and_then(|value| value.to_str())
                    .unwrap_or("upload.png")
                    .to_string();
                MultipartPart::bytes(bytes).file_name(file_name)
            }
            UploadSource::RemoteUrl(url) => MultipartPart::text(url.clone()),
        };

        let mut form = MultipartForm::new()
            .part("file", file_part)
            .text("api_key", self.api_key.clone())
            .text("signature", signature);
        for (key, value) in signed {
            form = form.text(key, value);
        }
        Ok(form)
    }

    fn send(&self, source: &UploadSource, public_id: Option<&str>) -> Result<Artifact> {
        let form = self.build_form(source, public_id, unix_timestamp())?;
        let response = self
            .http
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .with_context(|| format!("Cloudinary upload request failed ({})", self.endpoint))?;
        let payload = response_json_or_error("Cloudinary", response)?;
        parse_upload_response(&payload, public_id)
    }
}

impl ArtifactStore for CloudinaryStore {
    fn upload(&self, source: &UploadSource, public_id: Option<&str>) -> Result<Artifact, StageError> {
        let artifact = self
            .send(source, public_id)
            .map_err(|err| StageError::Upload(error_chain_text(&err, STAGE_DETAIL_MAX_CHARS)))?;
        info!(url = %artifact.url, public_id = ?artifact.public_id, "artifact uploaded");
        Ok(artifact)
    }
}

/// Cloudinary request signature: parameters sorted by key, joined as
/// `k=v&k=v`, secret appended, SHA-1, lowercase hex.
pub fn sign_params(params: &[(&str, String)], api_secret: &str) -> String {
    let mut sorted: Vec<&(&str, String)> = params
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .collect();
    sorted.sort_by(|left, right| left.0.cmp(right.0));
    let joined = sorted
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<String>>()
        .join("&");
    let mut hasher = Sha1::new();
    hasher.update(joined.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn parse_upload_response(payload: &Value, requested_id: Option<&str>) -> Result<Artifact> {
    let url = payload
        .get("secure_url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .context("Cloudinary response has no secure_url")?;
    let public_id = payload
        .get("public_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| requested_id.map(str::to_string));
    Ok(Artifact {
        url: url.to_string(),
        public_id,
    })
}

/// Transformation options for [`optimize_url`]. `None` leaves a parameter out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub crop: Option<String>,
    pub quality: Option<String>,
    pub format: Option<String>,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            crop: Some("auto".to_string()),
            quality: Some("auto".to_string()),
            format: Some("auto".to_string()),
        }
    }
}

/// Delivery URL for an uploaded asset with resize/format/quality applied.
pub fn optimize_url(cloud_name: &str, public_id: &str, options: &DeliveryOptions) -> String {
    let mut params: Vec<(&str, String)> = Vec::new();
    if let Some(crop) = non_blank(options.crop.as_deref()) {
        params.push(("c", crop.to_string()));
    }
    if let Some(format) = non_blank(options.format.as_deref()) {
        params.push(("f", format.to_string()));
    }
    if let Some(height) = options.height {
        params.push(("h", height.to_string()));
    }
    if let Some(quality) = non_blank(options.quality.as_deref()) {
        params.push(("q", quality.to_string()));
    }
    if let Some(width) = options.width {
        params.push(("w", width.to_string()));
    }
    let transformation = params
        .iter()
        .map(|(key, value)| format!("{key}_{value}"))
        .collect::<Vec<String>>()
        .join(",");
    let public_id = public_id.trim().trim_start_matches('/');
    if transformation.is_empty() {
        format!("{DELIVERY_BASE}/{cloud_name}/image/upload/{public_id}")
    } else {
        format!("{DELIVERY_BASE}/{cloud_name}/image/upload/{transformation}/{public_id}")
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn unix_timestamp() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use anyhow::Result;
    use chrono::Utc;
    use serde_json::json;
    use sketchforge_contracts::config::{Secret, StorageConfig};
    use sketchforge_contracts::errors::StageError;

    use super::{
        optimize_url, parse_upload_response, sign_params, ArtifactStore, CloudinaryStore,
        DeliveryOptions,
    };
    use crate::test_support::{serve, CannedResponse};

    fn store(api_base: &str) -> Result<CloudinaryStore> {
        CloudinaryStore::new(StorageConfig {
            api_base: api_base.to_string(),
            cloud_name: "demo".to_string(),
            api_key: "1234".to_string(),
            api_secret: Secret::new("topsecret"),
            request_timeout: Duration::from_secs(5),
        })
    }

    #[test]
    fn signature_matches_documented_example() {
        // Example from Cloudinary's signature documentation.
        let params = vec![
            ("timestamp", "1315060510".to_string()),
            ("public_id", "sample_image".to_string()),
            ("eager", "w_400,h_300,c_pad|w_260,h_200,c_crop".to_string()),
        ];
        assert_eq!(
            sign_params(&params, "abcd"),
            "bfd09f95f331f558cbd1320e67aa8d488770583e"
        );
    }

    #[test]
    fn signature_ignores_empty_values_and_order() {
        let a = sign_params(
            &[
                ("timestamp", "1".to_string()),
                ("public_id", "x".to_string()),
            ],
            "s",
        );
        let b = sign_params(
            &[
                ("public_id", "x".to_string()),
                ("timestamp", "1".to_string()),
                ("folder", String::new()),
            ],
            "s",
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn upload_response_requires_secure_url() -> Result<()> {
        let artifact = parse_upload_response(
            &json!({ "secure_url": "https://res.cloudinary.com/demo/image/upload/v1/house123.png", "public_id": "house123" }),
            None,
        )?;
        assert_eq!(
            artifact.url,
            "https://res.cloudinary.com/demo/image/upload/v1/house123.png"
        );
        assert_eq!(artifact.public_id.as_deref(), Some("house123"));

        let fallback = parse_upload_response(&json!({ "secure_url": "https://x/y.png" }), Some("mine"))?;
        assert_eq!(fallback.public_id.as_deref(), Some("mine"));

        assert!(parse_upload_response(&json!({ "url": "http://x/y.png" }), None).is_err());
        Ok(())
    }

    #[test]
    fn optimize_url_orders_transformations() {
        let defaults = optimize_url("demo", "house123", &DeliveryOptions::default());
        assert_eq!(
            defaults,
            "https://res.cloudinary.com/demo/image/upload/c_auto,f_auto,q_auto/house123"
        );

        let sized = optimize_url(
            "demo",
            "house123",
            &DeliveryOptions {
                width: Some(500),
                height: Some(500),
                ..DeliveryOptions::default()
            },
        );
        assert_eq!(
            sized,
            "https://res.cloudinary.com/demo/image/upload/c_auto,f_auto,h_500,q_auto,w_500/house123"
        );

        let bare = optimize_url(
            "demo",
            "house123",
            &DeliveryOptions {
                width: None,
                height: None,
                crop: None,
                quality: None,
                format: Some(" ".to_string()),
            },
        );
        assert_eq!(bare, "https://res.cloudinary.com/demo/image/upload/house123");
    }

    #[test]
    fn same_file_twice_yields_two_uploads() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("generated_image_a.png");
        fs::write(&path, b"same-bytes")?;

        let (base, requests) = serve(vec![
            CannedResponse::json(
                200,
                &json!({ "secure_url": "https://res.cloudinary.com/demo/image/upload/v1/first.png", "public_id": "first" }),
            ),
            CannedResponse::json(
                200,
                &json!({ "secure_url": "https://res.cloudinary.com/demo/image/upload/v2/second.png", "public_id": "second" }),
            ),
        ])?;
        let store = store(&base)?;
        let first = store.upload_local(&path, Some("first"))?;
        let second = store.upload_local(&path, Some("second"))?;
        assert_ne!(first.url, second.url);
        assert!(path.exists());

        let first_request = requests.recv()?;
        let second_request = requests.recv()?;
        assert_eq!(first_request.method, "POST");
        assert_eq!(first_request.target, "/demo/image/upload");
        for (request, id) in [(first_request, "first"), (second_request, "second")] {
            let body = request.body_text();
            assert!(body.contains("same-bytes"));
            assert!(body.contains("filename=\"generated_image_a.png\""));
            assert!(body.contains("name=\"api_key\"\r\n\r\n1234"));
            assert!(body.contains(&format!("name=\"public_id\"\r\n\r\n{id}")));
            assert!(body.contains("name=\"signature\""));
            assert!(!body.contains("topsecret"));
        }
        Ok(())
    }

    #[test]
    fn upload_timestamp_is_current_unix_seconds() -> Result<()> {
        let (base, requests) = serve(vec![CannedResponse::json(
            200,
            &json!({ "secure_url": "https://res.cloudinary.com/demo/image/upload/v1/now.png" }),
        )])?;
        store(&base)?.upload_from_url("https://example.com/cat.png", None)?;
        let body = requests.recv()?.body_text();
        let marker = "name=\"timestamp\"\r\n\r\n";
        let start = body.find(marker).map(|index| index + marker.len());
        let sent: i64 = start
            .map(|start| {
                body[start..]
                    .chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
            })
            .unwrap_or_default()
            .parse()?;
        assert!((Utc::now().timestamp() - sent).abs() <= 60, "timestamp {sent}");
        Ok(())
    }

    #[test]
    fn remote_urls_are_sent_as_text() -> Result<()> {
        let (base, requests) = serve(vec![CannedResponse::json(
            200,
            &json!({ "secure_url": "https://res.cloudinary.com/demo/image/upload/v1/remote.png" }),
        )])?;
        let artifact = store(&base)?.upload_from_url("https://example.com/cat.png", None)?;
        assert_eq!(
            artifact.url,
            "https://res.cloudinary.com/demo/image/upload/v1/remote.png"
        );
        let body = requests.recv()?.body_text();
        assert!(body.contains("name=\"file\"\r\n\r\nhttps://example.com/cat.png"));
        assert!(!body.contains("name=\"public_id\""));
        Ok(())
    }

    #[test]
    fn provider_errors_and_missing_files_are_upload_errors() -> Result<()> {
        let (base, _requests) = serve(vec![CannedResponse::json(
            401,
            &json!({ "error": { "message": "Invalid Signature" } }),
        )])?;
        let store = store(&base)?;
        match store.upload_from_url("https://example.com/cat.png", None) {
            Err(StageError::Upload(detail)) => assert!(detail.contains("401"), "{detail}"),
            other => panic!("unexpected result {other:?}"),
        }

        let temp = tempfile::tempdir()?;
        let missing = temp.path().join("nope.png");
        assert!(matches!(
            store.upload_local(&missing, None),
            Err(StageError::Upload(_))
        ));
        Ok(())
    }
}
