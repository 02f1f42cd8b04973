//! Parameter binding for query strings and request bodies.
//!
//! Supported body encodings are `application/x-www-form-urlencoded`,
//! `multipart/form-data` and `application/json`. Binding never fails a
//! request: anything malformed is logged at debug level and left absent.
//!
//! Multipart bodies are scanned as a stream so spooled uploads are never
//! loaded whole. File parts are recorded as byte ranges into the body
//! rather than copied.

use std::collections::HashMap;
use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::http::body::RequestBody;
use crate::http::request::{FileUpload, Request};

const SCAN_BLOCK: usize = 16 * 1024;
const MAX_PART_HEADER: usize = 16 * 1024;
const MAX_TEXT_FIELD: usize = 1024 * 1024;
const MAX_INLINE_FORM: u64 = 8 * 1024 * 1024;

/// Populate `params`, `files` and `json` from the query string and body.
pub async fn bind(request: &mut Request) {
    if let Some(query) = request.query.as_deref() {
        merge_urlencoded(&mut request.params, query.as_bytes());
    }

    let Some(content_type) = request.content_type.clone() else {
        return;
    };
    if request.body.is_empty() {
        return;
    }
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    match mime.as_str() {
        "application/x-www-form-urlencoded" => {
            if request.body.len() > MAX_INLINE_FORM {
                tracing::debug!(len = request.body.len(), "Urlencoded body too large to bind");
                return;
            }
            match request.body.to_bytes().await {
                Ok(bytes) => merge_urlencoded(&mut request.params, &bytes),
                Err(e) => tracing::debug!(error = %e, "Failed to read form body"),
            }
        }
        "application/json" => {
            if request.body.len() > MAX_INLINE_FORM {
                tracing::debug!(len = request.body.len(), "JSON body too large to bind");
                return;
            }
            let parsed = match request.body.to_bytes().await {
                Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match parsed {
                Ok(value) => request.json = Some(value),
                Err(e) => tracing::debug!(error = %e, "Ignoring malformed JSON body"),
            }
        }
        "multipart/form-data" => {
            let Some(boundary) = boundary_param(&content_type) else {
                tracing::debug!(content_type = %content_type, "Multipart body without boundary");
                return;
            };
            let reader = match request.body.reader().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(error = %e, "Failed to open multipart body");
                    return;
                }
            };
            match parse_multipart(reader, &boundary).await {
                Ok(parts) => {
                    for (name, value) in parts.fields {
                        request.params.entry(name).or_insert(value);
                    }
                    request.files = parts.files;
                }
                Err(e) => tracing::debug!(error = %e, "Ignoring malformed multipart body"),
            }
        }
        _ => {}
    }
}

/// Read the bytes of one uploaded file out of the request body.
pub async fn read_upload(body: &RequestBody, upload: &FileUpload) -> io::Result<Bytes> {
    let mut reader = body.reader().await?;
    tokio::io::copy(&mut (&mut reader).take(upload.offset), &mut tokio::io::sink()).await?;
    let mut out = Vec::with_capacity(upload.length as usize);
    (&mut reader).take(upload.length).read_to_end(&mut out).await?;
    Ok(Bytes::from(out))
}

fn merge_urlencoded(params: &mut HashMap<String, String>, input: &[u8]) {
    for (k, v) in url::form_urlencoded::parse(input) {
        params.entry(k.into_owned()).or_insert_with(|| v.into_owned());
    }
}

fn boundary_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|p| {
        let (k, v) = p.trim().split_once('=')?;
        if k.trim().eq_ignore_ascii_case("boundary") {
            let v = v.trim().trim_matches('"');
            (!v.is_empty()).then(|| v.to_string())
        } else {
            None
        }
    })
}

#[derive(Debug, Default)]
struct MultipartParts {
    fields: Vec<(String, String)>,
    files: Vec<FileUpload>,
}

#[derive(Debug, thiserror::Error)]
enum MultipartError {
    #[error("body ended before the closing boundary")]
    Truncated,
    #[error("part header block too large")]
    HeaderTooLarge,
    #[error("part without a form-data name")]
    MissingName,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Sliding window over a body reader that remembers the absolute offset of
/// its first byte.
struct Scanner<R> {
    reader: R,
    buf: Vec<u8>,
    base: u64,
    eof: bool,
}

impl<R: AsyncRead + Unpin> Scanner<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(SCAN_BLOCK),
            base: 0,
            eof: false,
        }
    }

    /// Read another block. Returns false once the body is exhausted.
    async fn fill(&mut self) -> io::Result<bool> {
        if self.eof {
            return Ok(false);
        }
        let start = self.buf.len();
        self.buf.resize(start + SCAN_BLOCK, 0);
        let n = self.reader.read(&mut self.buf[start..]).await?;
        self.buf.truncate(start + n);
        if n == 0 {
            self.eof = true;
        }
        Ok(n > 0)
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
        self.base += n as u64;
    }

    fn find(&self, needle: &[u8], from: usize) -> Option<usize> {
        if self.buf.len() < from + needle.len() {
            return None;
        }
        self.buf[from..]
            .windows(needle.len())
            .position(|w| w == needle)
            .map(|i| i + from)
    }

    async fn ensure(&mut self, n: usize) -> io::Result<bool> {
        while self.buf.len() < n {
            if !self.fill().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

async fn parse_multipart<R: AsyncRead + Unpin>(
    reader: R,
    boundary: &str,
) -> Result<MultipartParts, MultipartError> {
    let first = format!("--{}", boundary).into_bytes();
    let delimiter = format!("\r\n--{}", boundary).into_bytes();
    let mut scan = Scanner::new(reader);
    let mut parts = MultipartParts::default();

    // Preamble.
    loop {
        if let Some(i) = scan.find(&first, 0) {
            scan.consume(i + first.len());
            break;
        }
        let keep = scan.buf.len().saturating_sub(first.len() - 1);
        scan.consume(keep);
        if !scan.fill().await? {
            return Err(MultipartError::Truncated);
        }
    }

    loop {
        if !scan.ensure(2).await? {
            return Err(MultipartError::Truncated);
        }
        if &scan.buf[..2] == b"--" {
            return Ok(parts);
        }
        // Skip transport padding up to the line break.
        let line_end = loop {
            if let Some(i) = scan.find(b"\r\n", 0) {
                break i;
            }
            if !scan.fill().await? {
                return Err(MultipartError::Truncated);
            }
        };
        scan.consume(line_end + 2);

        let header_end = loop {
            if scan.buf.starts_with(b"\r\n") {
                break 0;
            }
            if let Some(i) = scan.find(b"\r\n\r\n", 0) {
                break i + 2;
            }
            if scan.buf.len() > MAX_PART_HEADER {
                return Err(MultipartError::HeaderTooLarge);
            }
            if !scan.fill().await? {
                return Err(MultipartError::Truncated);
            }
        };
        let header = PartHeader::parse(&scan.buf[..header_end])?;
        scan.consume(header_end + 2);

        let start = scan.base;
        let mut text = Vec::new();
        let mut oversized = false;
        let end = loop {
            let found = scan.find(&delimiter, 0);
            let take = match found {
                Some(i) => i,
                None => scan.buf.len().saturating_sub(delimiter.len() - 1),
            };
            if header.filename.is_none() && !oversized {
                if text.len() + take > MAX_TEXT_FIELD {
                    oversized = true;
                    text = Vec::new();
                } else {
                    text.extend_from_slice(&scan.buf[..take]);
                }
            }
            if found.is_some() {
                let end = scan.base + take as u64;
                scan.consume(take + delimiter.len());
                break end;
            }
            scan.consume(take);
            if !scan.fill().await? {
                return Err(MultipartError::Truncated);
            }
        };

        match header.filename {
            Some(filename) => parts.files.push(FileUpload {
                field: header.name,
                filename,
                content_type: header.content_type,
                offset: start,
                length: end - start,
            }),
            None if oversized => {
                tracing::debug!(
                    field = %header.name,
                    len = end - start,
                    limit = MAX_TEXT_FIELD,
                    "Dropping oversized multipart text field"
                );
            }
            None => parts
                .fields
                .push((header.name, String::from_utf8_lossy(&text).into_owned())),
        }
    }
}

#[derive(Debug)]
struct PartHeader {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
}

impl PartHeader {
    fn parse(block: &[u8]) -> Result<Self, MultipartError> {
        let block = String::from_utf8_lossy(block);
        let mut name = None;
        let mut filename = None;
        let mut content_type = None;

        for line in block.split("\r\n").filter(|l| !l.is_empty()) {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            if key.eq_ignore_ascii_case("content-disposition") {
                for param in value.split(';').skip(1) {
                    let Some((k, v)) = param.trim().split_once('=') else {
                        continue;
                    };
                    let v = v.trim().trim_matches('"').to_string();
                    match k.trim().to_ascii_lowercase().as_str() {
                        "name" => name = Some(v),
                        "filename" => filename = Some(v),
                        _ => {}
                    }
                }
            } else if key.eq_ignore_ascii_case("content-type") {
                content_type = Some(value.trim().to_string());
            }
        }

        Ok(Self {
            name: name.ok_or(MultipartError::MissingName)?,
            filename,
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::test_support::request;
    use http::Method;

    fn multipart_body() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"preamble\r\n--XyZ\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"title\"\r\n\r\n");
        body.extend_from_slice(b"hello there\r\n--XyZ\r\n");
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"doc\"; filename=\"a.bin\"\r\nContent-Type: application/octet-stream\r\n\r\n",
        );
        body.extend(std::iter::repeat(b'q').take(40_000));
        body.extend_from_slice(b"\r\n--XyZ--\r\n");
        body
    }

    #[tokio::test]
    async fn multipart_fields_and_file_ranges() {
        let body = multipart_body();
        let mut req = request(Method::POST, "/upload?title=ignored&x=1", &[]);
        req.content_type = Some("multipart/form-data; boundary=XyZ".into());
        req.body = RequestBody::Memory(Bytes::from(body));

        bind(&mut req).await;

        // Query parameters are bound first and win.
        assert_eq!(req.params.get("title").map(String::as_str), Some("ignored"));
        assert_eq!(req.params.get("x").map(String::as_str), Some("1"));
        assert_eq!(req.files.len(), 1);
        let file = &req.files[0];
        assert_eq!(file.field, "doc");
        assert_eq!(file.filename, "a.bin");
        assert_eq!(file.length, 40_000);

        let data = read_upload(&req.body, file).await.unwrap();
        assert!(data.iter().all(|&b| b == b'q'));
        assert_eq!(data.len(), 40_000);
    }

    #[tokio::test]
    async fn text_field_is_bound() {
        let body = multipart_body();
        let mut req = request(Method::POST, "/upload", &[]);
        req.content_type = Some("multipart/form-data; boundary=\"XyZ\"".into());
        req.body = RequestBody::Memory(Bytes::from(body));
        bind(&mut req).await;
        assert_eq!(req.params.get("title").map(String::as_str), Some("hello there"));
    }

    #[tokio::test]
    async fn oversized_text_field_is_dropped() {
        let mut body = b"--XyZ\r\nContent-Disposition: form-data; name=\"big\"\r\n\r\n".to_vec();
        body.extend(std::iter::repeat(b'b').take(MAX_TEXT_FIELD + 10));
        body.extend_from_slice(b"\r\n--XyZ\r\nContent-Disposition: form-data; name=\"small\"\r\n\r\nok\r\n--XyZ--\r\n");

        let mut req = request(Method::POST, "/upload", &[]);
        req.content_type = Some("multipart/form-data; boundary=XyZ".into());
        req.body = RequestBody::Memory(Bytes::from(body));
        bind(&mut req).await;

        assert!(!req.params.contains_key("big"));
        assert_eq!(req.params.get("small").map(String::as_str), Some("ok"));
    }

    #[tokio::test]
    async fn truncated_multipart_degrades_to_absent() {
        let mut req = request(Method::POST, "/upload", &[]);
        req.content_type = Some("multipart/form-data; boundary=XyZ".into());
        req.body = RequestBody::Memory(Bytes::from_static(
            b"--XyZ\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nno end",
        ));
        bind(&mut req).await;
        assert!(req.params.is_empty());
        assert!(req.files.is_empty());
    }

    #[tokio::test]
    async fn urlencoded_and_json() {
        let mut req = request(Method::POST, "/", &[]);
        req.content_type = Some("application/x-www-form-urlencoded".into());
        req.body = RequestBody::Memory(Bytes::from_static(b"a=1&b=hello+world&a=2"));
        bind(&mut req).await;
        assert_eq!(req.params.get("a").map(String::as_str), Some("1"));
        assert_eq!(req.params.get("b").map(String::as_str), Some("hello world"));

        let mut req = request(Method::POST, "/", &[]);
        req.content_type = Some("application/json; charset=utf-8".into());
        req.body = RequestBody::Memory(Bytes::from_static(b"{\"n\": 3}"));
        bind(&mut req).await;
        assert_eq!(req.json, Some(serde_json::json!({"n": 3})));

        let mut req = request(Method::POST, "/", &[]);
        req.content_type = Some("application/json".into());
        req.body = RequestBody::Memory(Bytes::from_static(b"{broken"));
        bind(&mut req).await;
        assert!(req.json.is_none());
    }
}
