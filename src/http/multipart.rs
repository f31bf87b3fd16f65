//! Minimal `multipart/form-data` parsing for module uploads.

use crate::error::{Result, SandtraceError};

#[derive(Debug, Clone)]
pub struct Part {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn invalid(msg: impl Into<String>) -> SandtraceError {
    SandtraceError::InvalidUpload(msg.into())
}

/// Extracts the boundary from a `Content-Type` header value.
pub fn boundary(content_type: &str) -> Result<String> {
    let mut params = content_type.split(';').map(str::trim);
    let mime = params.next().unwrap_or_default();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return Err(invalid(format!("expected multipart/form-data, got {:?}", mime)));
    }
    params
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
        .ok_or_else(|| invalid("multipart boundary missing"))
}

/// `name="wasm"; filename="x.wasm"` style parameters of a disposition header.
fn disposition_param(value: &str, key: &str) -> Option<String> {
    value.split(';').map(str::trim).find_map(|p| {
        let (k, v) = p.split_once('=')?;
        k.trim()
            .eq_ignore_ascii_case(key)
            .then(|| v.trim().trim_matches('"').to_string())
    })
}

pub fn parse(body: &[u8], boundary: &str) -> Result<Vec<Part>> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let separator = format!("\r\n--{}", boundary).into_bytes();

    let mut pos = find_from(body, &delimiter, 0).ok_or_else(|| invalid("multipart body has no boundary"))?;
    pos += delimiter.len();

    let mut parts = Vec::new();
    loop {
        if body[pos..].starts_with(b"--") {
            return Ok(parts);
        }
        if !body[pos..].starts_with(b"\r\n") {
            return Err(invalid("malformed multipart boundary line"));
        }
        pos += 2;

        let head_end = find_from(body, b"\r\n\r\n", pos).ok_or_else(|| invalid("multipart part has no header end"))?;
        let head = std::str::from_utf8(&body[pos..head_end]).map_err(|_| invalid("multipart headers are not UTF-8"))?;

        let mut name = None;
        let mut filename = None;
        let mut content_type = None;
        for line in head.split("\r\n").filter(|l| !l.is_empty()) {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| invalid(format!("bad multipart header {:?}", line)))?;
            if key.trim().eq_ignore_ascii_case("content-disposition") {
                name = disposition_param(value, "name");
                filename = disposition_param(value, "filename");
            } else if key.trim().eq_ignore_ascii_case("content-type") {
                content_type = Some(value.trim().to_string());
            }
        }
        let name = name.ok_or_else(|| invalid("multipart part without a name"))?;

        let data_start = head_end + 4;
        let data_end =
            find_from(body, &separator, data_start).ok_or_else(|| invalid("multipart part is not terminated"))?;
        parts.push(Part {
            name,
            filename,
            content_type,
            data: body[data_start..data_end].to_vec(),
        });
        pos = data_end + separator.len();
    }
}

/// Returns the bytes of the field called `field`.
pub fn extract_field(content_type: Option<&str>, body: &[u8], field: &str) -> Result<Vec<u8>> {
    let content_type = content_type.ok_or_else(|| invalid("missing Content-Type header"))?;
    let boundary = boundary(content_type)?;
    parse(body, &boundary)?
        .into_iter()
        .find(|p| p.name == field)
        .map(|p| p.data)
        .ok_or_else(|| invalid(format!("multipart field '{}' missing", field)))
}
