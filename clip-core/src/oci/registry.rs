use std::collections::HashMap;
use std::io::Read;
use std::sync::RwLock;

use serde::Deserialize;
use tracing::debug;

use crate::error::{ClipError, Result};

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Environment variable carrying a JSON map of
/// `host -> {username, password}`.
pub const OCI_AUTH_ENV: &str = "CLIP_OCI_AUTH";

/// A parsed image reference: `[registry/]repository[:tag|@digest]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub reference: String,
}

impl ImageRef {
    pub fn parse(image: &str) -> Result<Self> {
        let (rest, reference) = if let Some((head, digest)) = image.split_once('@') {
            (head, digest.to_string())
        } else {
            match image.rsplit_once(':') {
                // A ':' before the last '/' is a registry port, not a tag.
                Some((head, tag)) if !tag.contains('/') => (head, tag.to_string()),
                _ => (image, "latest".to_string()),
            }
        };

        let (registry, mut repository) = match rest.split_once('/') {
            Some((host, path))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_string(), path.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), rest.to_string()),
        };
        if repository.is_empty() {
            return Err(ClipError::Format(format!("invalid image reference: {image}")));
        }
        if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            repository = format!("library/{repository}");
        }
        Ok(Self {
            registry,
            repository,
            reference,
        })
    }
}

/// One layer as enumerated by the image manifest, bottom layer first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerDescriptor {
    pub digest: String,
    pub size: u64,
    pub media_type: String,
}

/// Source of compressed layer blobs; the registry client is the real
/// implementation, tests supply in-memory ones.
pub trait LayerSource: Send + Sync {
    fn open_layer(&self, digest: &str) -> Result<Box<dyn Read + Send>>;
}

#[derive(Deserialize)]
struct Descriptor {
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
    digest: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Deserialize)]
struct Platform {
    architecture: String,
    os: String,
}

#[derive(Deserialize)]
struct ManifestDoc {
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

#[derive(Deserialize)]
struct AuthEntry {
    username: String,
    password: String,
}

/// Looks up credentials for `host` in `CLIP_REGISTRY_USER_<NORM>` /
/// `CLIP_REGISTRY_PASS_<NORM>` (host uppercased, `.`/`-`/`:` mapped to
/// `_`), falling back to the `CLIP_OCI_AUTH` JSON blob.
pub fn credentials_for(host: &str) -> Option<(String, String)> {
    let norm: String = host
        .chars()
        .map(|c| match c {
            '.' | '-' | ':' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect();
    let user = std::env::var(format!("CLIP_REGISTRY_USER_{norm}")).ok();
    let pass = std::env::var(format!("CLIP_REGISTRY_PASS_{norm}")).ok();
    if let (Some(user), Some(pass)) = (user, pass) {
        return Some((user, pass));
    }

    let blob = std::env::var(OCI_AUTH_ENV).ok()?;
    let map: HashMap<String, AuthEntry> = serde_json::from_str(&blob).ok()?;
    map.get(host).map(|e| (e.username.clone(), e.password.clone()))
}

/// Minimal client for the OCI distribution protocol: token auth,
/// manifest resolution, streaming blob GETs.
pub struct RegistryClient {
    http: reqwest::blocking::Client,
    base: String,
    repository: String,
    basic: Option<(String, String)>,
    token: RwLock<Option<String>>,
}

impl RegistryClient {
    pub fn new(registry: &str, repository: &str) -> Result<Self> {
        let base = if registry.starts_with("http://") || registry.starts_with("https://") {
            registry.trim_end_matches('/').to_string()
        } else {
            format!("https://{registry}")
        };
        let host = base
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string();
        let http = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| ClipError::Io(std::io::Error::other(e)))?;
        Ok(Self {
            http,
            base,
            repository: repository.to_string(),
            basic: credentials_for(&host),
            token: RwLock::new(None),
        })
    }

    pub fn registry_url(&self) -> &str {
        &self.base
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    fn get(&self, url: &str, accept: Option<&str>) -> Result<reqwest::blocking::Response> {
        for attempt in 0..2 {
            let mut req = self.http.get(url);
            if let Some(accept) = accept {
                req = req.header(reqwest::header::ACCEPT, accept);
            }
            if let Ok(token) = self.token.read()
                && let Some(token) = token.as_deref()
            {
                req = req.bearer_auth(token);
            }
            let resp = req
                .send()
                .map_err(|e| ClipError::Io(std::io::Error::other(e)))?;

            match resp.status().as_u16() {
                200 | 206 => return Ok(resp),
                401 if attempt == 0 => {
                    let challenge = resp
                        .headers()
                        .get(reqwest::header::WWW_AUTHENTICATE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    self.refresh_token(&challenge)?;
                }
                401 | 403 => {
                    return Err(ClipError::Auth(format!(
                        "registry rejected credentials for {url}"
                    )));
                }
                404 => return Err(ClipError::NotFound(url.to_string())),
                status => {
                    return Err(ClipError::Io(std::io::Error::other(format!(
                        "registry returned status {status} for {url}"
                    ))));
                }
            }
        }
        Err(ClipError::Auth(format!("authentication loop for {url}")))
    }

    fn refresh_token(&self, challenge: &str) -> Result<()> {
        let params = parse_bearer_challenge(challenge).ok_or_else(|| {
            ClipError::Auth(format!("unsupported auth challenge: {challenge:?}"))
        })?;
        let realm = params
            .get("realm")
            .ok_or_else(|| ClipError::Auth("auth challenge without realm".into()))?;

        let mut req = self.http.get(realm);
        if let Some(service) = params.get("service") {
            req = req.query(&[("service", service.as_str())]);
        }
        let scope = format!("repository:{}:pull", self.repository);
        req = req.query(&[("scope", scope.as_str())]);
        if let Some((user, pass)) = &self.basic {
            req = req.basic_auth(user, Some(pass));
        }

        let resp = req
            .send()
            .map_err(|e| ClipError::Io(std::io::Error::other(e)))?;
        if !resp.status().is_success() {
            return Err(ClipError::Auth(format!(
                "token endpoint returned status {}",
                resp.status()
            )));
        }

        #[derive(Deserialize)]
        struct TokenDoc {
            #[serde(default)]
            token: Option<String>,
            #[serde(default)]
            access_token: Option<String>,
        }
        let doc: TokenDoc = resp
            .json()
            .map_err(|e| ClipError::Auth(format!("token response decode: {e}")))?;
        let token = doc
            .token
            .or(doc.access_token)
            .ok_or_else(|| ClipError::Auth("token response without token".into()))?;
        if let Ok(mut slot) = self.token.write() {
            *slot = Some(token);
        }
        debug!(repository = %self.repository, "acquired registry token");
        Ok(())
    }

    /// Resolves `reference` to the platform manifest's layer list,
    /// bottom layer first. Image indexes are narrowed to linux/amd64.
    pub fn resolve_layers(&self, reference: &str) -> Result<Vec<LayerDescriptor>> {
        let accept = [
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST,
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_DOCKER_LIST,
        ]
        .join(", ");

        let url = format!("{}/v2/{}/manifests/{}", self.base, self.repository, reference);
        let doc: ManifestDoc = self
            .get(&url, Some(&accept))?
            .json()
            .map_err(|e| ClipError::Format(format!("manifest decode: {e}")))?;

        let doc = if doc.layers.is_empty() && !doc.manifests.is_empty() {
            let chosen = doc
                .manifests
                .iter()
                .find(|d| {
                    d.platform
                        .as_ref()
                        .is_some_and(|p| p.os == "linux" && p.architecture == "amd64")
                })
                .or(doc.manifests.first())
                .ok_or_else(|| ClipError::Format("empty image index".into()))?;
            let url = format!(
                "{}/v2/{}/manifests/{}",
                self.base, self.repository, chosen.digest
            );
            self.get(&url, Some(&accept))?
                .json()
                .map_err(|e| ClipError::Format(format!("manifest decode: {e}")))?
        } else {
            doc
        };

        if doc.layers.is_empty() {
            return Err(ClipError::Format(format!(
                "no layers in manifest {reference} ({:?})",
                doc.media_type
            )));
        }
        Ok(doc
            .layers
            .into_iter()
            .map(|d| LayerDescriptor {
                digest: d.digest,
                size: d.size,
                media_type: d.media_type.unwrap_or_default(),
            })
            .collect())
    }
}

impl LayerSource for RegistryClient {
    fn open_layer(&self, digest: &str) -> Result<Box<dyn Read + Send>> {
        let url = format!("{}/v2/{}/blobs/{}", self.base, self.repository, digest);
        let resp = self.get(&url, None)?;
        Ok(Box::new(resp))
    }
}

fn parse_bearer_challenge(challenge: &str) -> Option<HashMap<String, String>> {
    let rest = challenge.strip_prefix("Bearer ")?;
    let mut params = HashMap::new();
    for part in rest.split(',') {
        let (k, v) = part.trim().split_once('=')?;
        params.insert(k.to_string(), v.trim_matches('"').to_string());
    }
    Some(params)
}
