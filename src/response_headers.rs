//! Response header policy for served files.
//!
//! Content type resolution, cache policy per media family, disposition,
//! validators (ETag / Last-Modified) and CORS headers.

use hyper::header::{self, HeaderValue};
use hyper::http::response::Builder;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::time::SystemTime;

/// Characters `encodeURIComponent` leaves alone, so filenames render the way browsers expect
const FILENAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Content type by file extension, falling back to `application/octet-stream`
pub fn content_type_for_filename(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "pdf" => "application/pdf",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "avi" => "video/avi",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "txt" => "text/plain",
        "html" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "zip" => "application/zip",
        "rar" => "application/x-rar-compressed",
        "7z" => "application/x-7z-compressed",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        _ => DEFAULT_CONTENT_TYPE,
    }
}

/// Prefer the backend's content type unless it is missing or generic.
pub fn resolve_content_type(backend_type: Option<&str>, file_name: &str) -> String {
    match backend_type.map(str::trim) {
        Some(ct)
            if !ct.is_empty()
                && !ct.eq_ignore_ascii_case(DEFAULT_CONTENT_TYPE)
                && !ct.eq_ignore_ascii_case("binary/octet-stream") =>
        {
            ct.to_string()
        }
        _ => content_type_for_filename(file_name).to_string(),
    }
}

pub fn is_media(content_type: &str) -> bool {
    content_type.starts_with("video/") || content_type.starts_with("audio/")
}

/// Cache-Control by media family
pub fn cache_control_for(content_type: &str) -> &'static str {
    if is_media(content_type) {
        "public, max-age=86400, stale-while-revalidate=604800"
    } else if content_type.starts_with("image/") {
        "public, max-age=31536000, immutable"
    } else {
        "public, max-age=3600"
    }
}

fn is_inline(content_type: &str) -> bool {
    ["image/", "video/", "audio/", "text/", "application/pdf"]
        .iter()
        .any(|prefix| content_type.starts_with(prefix))
}

pub fn is_compressible(content_type: &str) -> bool {
    [
        "text/",
        "application/json",
        "application/javascript",
        "application/xml",
    ]
    .iter()
    .any(|prefix| content_type.starts_with(prefix))
}

pub fn content_disposition(file_name: &str, content_type: &str) -> String {
    format!(
        "{}; filename=\"{}\"",
        if is_inline(content_type) {
            "inline"
        } else {
            "attachment"
        },
        utf8_percent_encode(file_name, FILENAME_ENCODE_SET)
    )
}

/// Quoted ETag that changes whenever the object's last-modified time (or,
/// lacking one, its size) changes.
pub fn generate_etag(file_name: &str, last_modified: Option<&str>, size: u64) -> String {
    let volatility = match last_modified {
        Some(lm) if !lm.is_empty() => lm.to_string(),
        _ => size.to_string(),
    };
    let hash = blake3::hash(format!("{}_{}", file_name, volatility).as_bytes());
    format!("\"{}\"", &hash.to_hex()[..32])
}

/// `If-None-Match` comparison: exact match against any listed tag, or `*`.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    if_none_match
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || candidate == etag)
}

/// Validators and presentation headers shared by every file response
#[derive(Debug, Clone)]
pub struct FileHeaders {
    pub content_type: String,
    pub etag: String,
    pub last_modified: String,
    pub cache_control: &'static str,
    pub disposition: String,
    pub compressible: bool,
}

impl FileHeaders {
    pub fn new(
        file_name: &str,
        backend_type: Option<&str>,
        last_modified: Option<&str>,
        size: u64,
    ) -> Self {
        let content_type = resolve_content_type(backend_type, file_name);
        Self {
            etag: generate_etag(file_name, last_modified, size),
            last_modified: last_modified
                .filter(|lm| !lm.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| httpdate::fmt_http_date(SystemTime::now())),
            cache_control: cache_control_for(&content_type),
            disposition: content_disposition(file_name, &content_type),
            compressible: is_compressible(&content_type),
            content_type,
        }
    }

    /// Add every file header (plus CORS) to `builder`.
    pub fn apply(&self, builder: Builder) -> Builder {
        let builder = with_cors(builder)
            .header(header::CONTENT_TYPE, &self.content_type)
            .header(header::ETAG, &self.etag)
            .header(header::LAST_MODIFIED, &self.last_modified)
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::CACHE_CONTROL, self.cache_control)
            .header(header::CONTENT_DISPOSITION, &self.disposition);
        if self.compressible {
            builder.header(header::VARY, "Accept-Encoding")
        } else {
            builder
        }
    }
}

/// CORS headers sent on every file and preflight response
pub fn with_cors(builder: Builder) -> Builder {
    builder
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"))
        .header(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, HEAD, OPTIONS"),
        )
        .header(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Range, If-None-Match"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Response;

    #[test]
    fn test_content_type_by_extension() {
        assert_eq!(content_type_for_filename("movie.MP4"), "video/mp4");
        assert_eq!(content_type_for_filename("report.pdf"), "application/pdf");
        assert_eq!(content_type_for_filename("archive.tar.7z"), "application/x-7z-compressed");
        assert_eq!(content_type_for_filename("README"), "application/octet-stream");
        assert_eq!(content_type_for_filename("blob.xyz"), "application/octet-stream");
    }

    #[test]
    fn test_backend_type_wins_unless_generic() {
        assert_eq!(resolve_content_type(Some("audio/aac"), "x.bin"), "audio/aac");
        assert_eq!(
            resolve_content_type(Some("application/octet-stream"), "clip.webm"),
            "video/webm"
        );
        assert_eq!(resolve_content_type(None, "photo.png"), "image/png");
    }

    #[test]
    fn test_cache_control_policy() {
        assert_eq!(
            cache_control_for("video/mp4"),
            "public, max-age=86400, stale-while-revalidate=604800"
        );
        assert_eq!(
            cache_control_for("audio/mpeg"),
            "public, max-age=86400, stale-while-revalidate=604800"
        );
        assert_eq!(
            cache_control_for("image/png"),
            "public, max-age=31536000, immutable"
        );
        assert_eq!(cache_control_for("application/zip"), "public, max-age=3600");
    }

    #[test]
    fn test_content_disposition() {
        assert_eq!(
            content_disposition("my video.mp4", "video/mp4"),
            "inline; filename=\"my%20video.mp4\""
        );
        assert_eq!(
            content_disposition("data.zip", "application/zip"),
            "attachment; filename=\"data.zip\""
        );
        assert_eq!(
            content_disposition("리포트.pdf", "application/pdf"),
            "inline; filename=\"%EB%A6%AC%ED%8F%AC%ED%8A%B8.pdf\""
        );
    }

    #[test]
    fn test_etag_tracks_volatility_signal() {
        let a = generate_etag("a.mp4", Some("Wed, 21 Oct 2015 07:28:00 GMT"), 10);
        let b = generate_etag("a.mp4", Some("Thu, 22 Oct 2015 07:28:00 GMT"), 10);
        let c = generate_etag("a.mp4", Some("Wed, 21 Oct 2015 07:28:00 GMT"), 99);
        assert_ne!(a, b);
        assert_eq!(a, c, "size is ignored when last-modified is known");
        assert!(a.starts_with('"') && a.ends_with('"'));

        assert_ne!(generate_etag("a.mp4", None, 10), generate_etag("a.mp4", None, 11));
    }

    #[test]
    fn test_etag_matching() {
        let etag = generate_etag("a", None, 1);
        assert!(etag_matches(&etag, &etag));
        assert!(etag_matches(&format!("\"other\", {}", etag), &etag));
        assert!(etag_matches("*", &etag));
        assert!(!etag_matches("\"other\"", &etag));
    }

    #[test]
    fn test_apply_sets_vary_only_for_compressible() {
        let text = FileHeaders::new("notes.txt", None, None, 5);
        let resp = text.apply(Response::builder()).body(()).unwrap();
        assert_eq!(resp.headers()[header::VARY], "Accept-Encoding");
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(resp.headers().contains_key(header::LAST_MODIFIED));

        let video = FileHeaders::new("clip.mp4", None, None, 5);
        let resp = video.apply(Response::builder()).body(()).unwrap();
        assert!(!resp.headers().contains_key(header::VARY));
        assert_eq!(resp.headers()[header::ACCEPT_RANGES], "bytes");
    }
}
