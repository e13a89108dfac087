use crate::config::StaticFilesConfig;
use crate::server::response::{
    empty_body, ErrorResponse, RequestBody, ResponseBody, ResponseBuilder,
};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use http::request::Parts;
use hyper::{Method, Request, Response, StatusCode};
use mime_guess::MimeGuess;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Serves every request that no proxy rule claims.
#[async_trait]
pub trait LocalContent: Send + Sync {
    async fn serve(&self, req: Request<RequestBody>) -> Result<Response<ResponseBody>>;
}

pub struct StaticFileHandler {
    root: Option<PathBuf>,
    index_files: Vec<String>,
    spa_fallback: bool,
}

#[async_trait]
impl LocalContent for StaticFileHandler {
    async fn serve(&self, req: Request<RequestBody>) -> Result<Response<ResponseBody>> {
        let (parts, _body) = req.into_parts();
        self.serve_file(&parts).await
    }
}

impl StaticFileHandler {
    pub fn new(config: &StaticFilesConfig) -> Self {
        Self {
            root: config.root.as_ref().map(PathBuf::from),
            index_files: config.index_files.clone(),
            spa_fallback: config.spa_fallback,
        }
    }

    pub async fn serve_file(&self, parts: &Parts) -> Result<Response<ResponseBody>> {
        if parts.method != Method::GET && parts.method != Method::HEAD {
            return Ok(ErrorResponse::method_not_allowed().build());
        }

        let Some(root) = self.root.as_deref() else {
            return Ok(ErrorResponse::not_found().build());
        };

        let request_path = parts.uri.path();
        let sanitized_path = match sanitize_path(request_path) {
            Ok(path) => path,
            Err(e) => {
                warn!(path = %request_path, error = %e, "Rejected static file path");
                return Ok(ErrorResponse::forbidden().build());
            }
        };

        let full_path = root.join(&sanitized_path);

        debug!("Serving static file: {}", full_path.display());

        let metadata = match fs::metadata(&full_path).await {
            Ok(meta) => meta,
            Err(_) => return self.fallback(parts, root, &sanitized_path).await,
        };

        // Symlinks may still point outside the root.
        if !is_safe_path(&full_path, root) {
            warn!("Attempted path traversal: {}", request_path);
            return Ok(ErrorResponse::forbidden().build());
        }

        let file_path = if metadata.is_dir() {
            match self.find_index_file(&full_path).await {
                Some(index_path) => index_path,
                None => return Ok(ErrorResponse::forbidden().build()),
            }
        } else {
            full_path
        };

        self.serve_single_file(parts, &file_path).await
    }

    /// History API fallback: extension-less paths resolve to the root index.
    async fn fallback(
        &self,
        parts: &Parts,
        root: &Path,
        sanitized_path: &str,
    ) -> Result<Response<ResponseBody>> {
        let looks_like_route = sanitized_path
            .rsplit('/')
            .next()
            .map_or(true, |segment| !segment.contains('.'));

        if self.spa_fallback && looks_like_route {
            if let Some(index_path) = self.find_index_file(root).await {
                debug!(path = %parts.uri.path(), "Serving SPA fallback");
                return self.serve_single_file(parts, &index_path).await;
            }
        }

        Ok(ErrorResponse::not_found().build())
    }

    async fn serve_single_file(
        &self,
        parts: &Parts,
        file_path: &Path,
    ) -> Result<Response<ResponseBody>> {
        let metadata = match fs::metadata(file_path).await {
            Ok(meta) => meta,
            Err(_) => return Ok(ErrorResponse::not_found().build()),
        };

        if metadata.is_dir() {
            return Ok(ErrorResponse::forbidden().build());
        }

        let mime_type = MimeGuess::from_path(file_path)
            .first()
            .unwrap_or(mime::APPLICATION_OCTET_STREAM);

        let etag = generate_etag(&metadata);

        if let Some(if_none_match) = parts.headers.get("if-none-match") {
            if if_none_match.to_str().unwrap_or("") == etag {
                return Ok(ResponseBuilder::new(StatusCode::NOT_MODIFIED)
                    .header_string("etag", etag)
                    .build());
            }
        } else if let Some(if_modified_since) = parts.headers.get("if-modified-since") {
            if let Ok(since_time) =
                httpdate::parse_http_date(if_modified_since.to_str().unwrap_or(""))
            {
                if let Ok(modified_time) = metadata.modified() {
                    // Header dates have second precision.
                    if httpdate::fmt_http_date(modified_time)
                        == httpdate::fmt_http_date(since_time)
                        || modified_time <= since_time
                    {
                        return Ok(ResponseBuilder::new(StatusCode::NOT_MODIFIED).build());
                    }
                }
            }
        }

        let content = match fs::read(file_path).await {
            Ok(content) => Bytes::from(content),
            Err(e) => {
                warn!(path = %file_path.display(), error = %e, "Failed to read static file");
                return Ok(ErrorResponse::internal_server_error().build());
            }
        };

        let mut response = ResponseBuilder::new(StatusCode::OK)
            .header_string("content-type", mime_type.to_string())
            .header_string("content-length", content.len().to_string())
            .header_string("etag", etag)
            .header_string("last-modified", format_last_modified(&metadata))
            .header("cache-control", "no-cache")
            .body(content)
            .build();

        if parts.method == Method::HEAD {
            *response.body_mut() = empty_body();
        }

        Ok(response)
    }

    async fn find_index_file(&self, dir_path: &Path) -> Option<PathBuf> {
        for index_file in &self.index_files {
            let index_path = dir_path.join(index_file);
            if let Ok(metadata) = fs::metadata(&index_path).await {
                if metadata.is_file() {
                    return Some(index_path);
                }
            }
        }
        None
    }
}

fn sanitize_path(path: &str) -> Result<String> {
    let decoded =
        urlencoding::decode(path).map_err(|_| anyhow::anyhow!("Invalid URL encoding"))?;

    let path = decoded.trim_start_matches('/');

    if path.contains('\0') {
        return Err(anyhow::anyhow!("Invalid path"));
    }

    let escapes = Path::new(path)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(anyhow::anyhow!("Invalid path"));
    }

    Ok(path.to_string())
}

fn is_safe_path(requested_path: &Path, document_root: &Path) -> bool {
    let canonical_requested = requested_path
        .canonicalize()
        .unwrap_or_else(|_| requested_path.to_path_buf());

    let canonical_root = document_root
        .canonicalize()
        .unwrap_or_else(|_| document_root.to_path_buf());

    canonical_requested.starts_with(canonical_root)
}

fn generate_etag(metadata: &std::fs::Metadata) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    metadata.len().hash(&mut hasher);
    if let Ok(modified) = metadata.modified() {
        if let Ok(duration) = modified.duration_since(std::time::UNIX_EPOCH) {
            duration.as_nanos().hash(&mut hasher);
        }
    }
    format!("W/\"{:x}\"", hasher.finish())
}

fn format_last_modified(metadata: &std::fs::Metadata) -> String {
    match metadata.modified() {
        Ok(time) => httpdate::fmt_http_date(time),
        Err(_) => httpdate::fmt_http_date(std::time::SystemTime::now()),
    }
}
