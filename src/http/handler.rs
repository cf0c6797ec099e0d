//! Application logic: what a parsed request turns into.
//!
//! Everything here is synchronous and produces either a finished
//! [`Response`] or the path of a CGI program to run. The `Connection`
//! header is left to the response queue.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::cgi::is_cgi_path;
use crate::http::mime;
use crate::http::request::{Method, Request};
use crate::http::response::{error_page_body, Response, ResponseBuilder, StatusCode};
use crate::route::EffectiveConfig;

#[derive(Debug)]
pub enum Outcome {
    Respond(Response),
    /// Run this program and relay its output.
    Cgi(PathBuf),
}

pub fn handle(request: &Request, config: &EffectiveConfig) -> Outcome {
    if let Some((status, target)) = config.redirect() {
        return Outcome::Respond(redirect(status, &target));
    }

    if !request.method.is_supported() || !config.allows(request.method) {
        return Outcome::Respond(method_not_allowed(config));
    }

    if let Some(max) = config.client_max_body_size() {
        if request.body.len() > max {
            return Outcome::Respond(error_response(StatusCode::PAYLOAD_TOO_LARGE, config));
        }
    }

    let fs_path = match map_path(&config.root(), &request.path) {
        Ok(path) => path,
        Err(status) => return Outcome::Respond(error_response(status, config)),
    };

    if matches!(request.method, Method::GET | Method::POST)
        && is_cgi_path(&fs_path, config.cgi_extensions())
        && fs_path.is_file()
    {
        return Outcome::Cgi(fs_path);
    }

    let response = match request.method {
        Method::GET => serve_get(&fs_path, request, config),
        Method::POST => serve_post(request, config),
        Method::DELETE => serve_delete(&fs_path, config),
        _ => method_not_allowed(config),
    };
    Outcome::Respond(response)
}

/// Error response, using the configured `error_page` file when readable.
pub fn error_response(status: StatusCode, config: &EffectiveConfig) -> Response {
    if let Some(page) = config.error_page(status) {
        match fs::read(&page) {
            Ok(body) => {
                return ResponseBuilder::new(status)
                    .header("Content-Type", mime::content_type(&page))
                    .body(body)
                    .build();
            }
            Err(e) => debug!(page = %page.display(), error = %e, "error page unreadable"),
        }
    }
    ResponseBuilder::new(status)
        .header("Content-Type", "text/html")
        .body(error_page_body(status))
        .build()
}

/// Root-relative filesystem path for a normalized request path.
///
/// Rejects anything that could climb out of `root` after percent-decoding.
pub fn map_path(root: &Path, path: &str) -> Result<PathBuf, StatusCode> {
    let decoded = urlencoding::decode(path).map_err(|_| StatusCode::BAD_REQUEST)?;
    if decoded.contains('\0') {
        return Err(StatusCode::BAD_REQUEST);
    }

    let relative = Path::new(decoded.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(root.join(relative))
}

fn redirect(status: StatusCode, target: &str) -> Response {
    if status.is_redirect() {
        return ResponseBuilder::new(status)
            .header("Location", target)
            .header("Content-Type", "text/html")
            .body(error_page_body(status))
            .build();
    }
    ResponseBuilder::new(status)
        .header("Content-Type", "text/plain")
        .body(target.as_bytes().to_vec())
        .build()
}

fn method_not_allowed(config: &EffectiveConfig) -> Response {
    let allow = config
        .allowed_methods()
        .into_iter()
        .filter(|m| Method::from_str(m).is_some_and(|m| m.is_supported()))
        .collect::<Vec<_>>()
        .join(", ");
    let mut response = error_response(StatusCode::METHOD_NOT_ALLOWED, config);
    response.headers.push(("Allow".to_string(), allow));
    response
}

fn io_status(e: &io::Error) -> StatusCode {
    match e.kind() {
        io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn serve_get(fs_path: &Path, request: &Request, config: &EffectiveConfig) -> Response {
    let meta = match fs::metadata(fs_path) {
        Ok(meta) => meta,
        Err(e) => return error_response(io_status(&e), config),
    };

    if meta.is_file() {
        return serve_file(fs_path, config);
    }
    if !meta.is_dir() {
        return error_response(StatusCode::FORBIDDEN, config);
    }

    if !request.path.ends_with('/') {
        let mut location = format!("{}/", request.path);
        if let Some(query) = &request.query {
            location.push('?');
            location.push_str(query);
        }
        return redirect(StatusCode::MOVED_PERMANENTLY, &location);
    }

    for index in config.index() {
        let candidate = fs_path.join(&index);
        if candidate.is_file() {
            return serve_file(&candidate, config);
        }
    }

    if config.autoindex() {
        return match directory_listing(fs_path, &request.path) {
            Ok(body) => ResponseBuilder::new(StatusCode::OK)
                .header("Content-Type", "text/html")
                .body(body)
                .build(),
            Err(e) => error_response(io_status(&e), config),
        };
    }
    error_response(StatusCode::FORBIDDEN, config)
}

fn serve_file(path: &Path, config: &EffectiveConfig) -> Response {
    match fs::read(path) {
        Ok(body) => ResponseBuilder::new(StatusCode::OK)
            .header("Content-Type", mime::content_type(path))
            .body(body)
            .build(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read file");
            error_response(io_status(&e), config)
        }
    }
}

fn directory_listing(dir: &Path, request_path: &str) -> io::Result<Vec<u8>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();

    let mut html = format!(
        "<html><head><title>Index of {request_path}</title></head>\
         <body><h1>Index of {request_path}</h1><hr><pre>\n<a href=\"../\">../</a>\n"
    );
    for name in names {
        let href = urlencoding::encode(name.trim_end_matches('/')).into_owned();
        let slash = if name.ends_with('/') { "/" } else { "" };
        html.push_str(&format!("<a href=\"{href}{slash}\">{}</a>\n", escape_html(&name)));
    }
    html.push_str("</pre><hr></body></html>\n");
    Ok(html.into_bytes())
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn serve_post(request: &Request, config: &EffectiveConfig) -> Response {
    let Some(dir) = config.upload_path() else {
        return method_not_allowed(config);
    };

    let name = match request.path.rsplit('/').next() {
        Some(last) if !last.is_empty() => match urlencoding::decode(last) {
            Ok(decoded) if !decoded.contains('/') && decoded != ".." && decoded != "." => {
                decoded.into_owned()
            }
            _ => return error_response(StatusCode::BAD_REQUEST, config),
        },
        _ => generated_name(),
    };

    let target = dir.join(&name);
    match fs::write(&target, &request.body) {
        Ok(()) => {
            debug!(path = %target.display(), bytes = request.body.len(), "upload stored");
            ResponseBuilder::new(StatusCode::CREATED)
                .header("Content-Type", "text/plain")
                .header("Location", request.path.clone())
                .body(format!("stored {name}\n").into_bytes())
                .build()
        }
        Err(e) => {
            warn!(path = %target.display(), error = %e, "upload failed");
            let status = match io_status(&e) {
                StatusCode::NOT_FOUND => StatusCode::INTERNAL_SERVER_ERROR,
                other => other,
            };
            error_response(status, config)
        }
    }
}

fn generated_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("upload-{nanos}")
}

fn serve_delete(fs_path: &Path, config: &EffectiveConfig) -> Response {
    let meta = match fs::metadata(fs_path) {
        Ok(meta) => meta,
        Err(e) => return error_response(io_status(&e), config),
    };
    if meta.is_dir() {
        return error_response(StatusCode::FORBIDDEN, config);
    }
    match fs::remove_file(fs_path) {
        Ok(()) => ResponseBuilder::new(StatusCode::NO_CONTENT).build(),
        Err(e) => error_response(io_status(&e), config),
    }
}
