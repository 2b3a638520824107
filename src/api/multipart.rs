//! `multipart/form-data` body parsing for uploads.

use anyhow::{anyhow, Result};

use super::http::{find, find_from};

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Part<'a> {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: &'a [u8],
}

/// Boundary parameter of a `multipart/form-data` content type.
pub(crate) fn boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';').map(str::trim);
    let mime = params.next()?;
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| unquote(value.trim()).to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn parse<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<Part<'a>>> {
    let delimiter = format!("--{}", boundary);
    let delimiter = delimiter.as_bytes();
    let part_end = [b"\r\n".as_slice(), delimiter].concat();

    let mut cursor = find(body, delimiter).ok_or_else(|| anyhow!("missing opening boundary"))?
        + delimiter.len();
    let mut parts = Vec::new();
    loop {
        let rest = &body[cursor..];
        if rest.starts_with(b"--") {
            return Ok(parts);
        }
        if !rest.starts_with(b"\r\n") {
            return Err(anyhow!("malformed boundary line"));
        }
        cursor += 2;

        let headers_end =
            find_from(body, b"\r\n\r\n", cursor).ok_or_else(|| anyhow!("unterminated part headers"))?;
        let headers = std::str::from_utf8(&body[cursor..headers_end])
            .map_err(|_| anyhow!("part headers are not utf-8"))?;
        let data_start = headers_end + 4;
        let data_end =
            find_from(body, &part_end, data_start).ok_or_else(|| anyhow!("unterminated part"))?;

        let mut name = None;
        let mut filename = None;
        let mut content_type = None;
        for line in headers.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            if key.eq_ignore_ascii_case("content-disposition") {
                for param in value.split(';').map(str::trim) {
                    match param.split_once('=') {
                        Some((k, v)) if k.eq_ignore_ascii_case("name") => {
                            name = Some(unquote(v).to_string())
                        }
                        Some((k, v)) if k.eq_ignore_ascii_case("filename") => {
                            filename = Some(unquote(v).to_string())
                        }
                        _ => {}
                    }
                }
            } else if key.eq_ignore_ascii_case("content-type") {
                content_type = Some(value.trim().to_string());
            }
        }

        parts.push(Part {
            name: name.ok_or_else(|| anyhow!("part without a name"))?,
            filename,
            content_type,
            data: &body[data_start..data_end],
        });
        cursor = data_end + part_end.len();
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"preamble\r\n--XyZ\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"note\"\r\n\r\n");
        body.extend_from_slice(b"hello\r\n--XyZ\r\n");
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"file\"; filename=\"cat.png\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
        body.extend_from_slice(&[0, 1, b'\r', b'\n', 2]);
        body.extend_from_slice(b"\r\n--XyZ--\r\n");
        body
    }

    #[test]
    fn extracts_boundary() {
        assert_eq!(
            boundary("multipart/form-data; boundary=XyZ").as_deref(),
            Some("XyZ")
        );
        assert_eq!(
            boundary("multipart/form-data; charset=utf-8; boundary=\"a b\"").as_deref(),
            Some("a b")
        );
        assert_eq!(boundary("application/json"), None);
        assert_eq!(boundary("multipart/form-data"), None);
    }

    #[test]
    fn parses_fields_and_binary_files() -> Result<()> {
        let body = body();
        let parts = parse(&body, "XyZ")?;
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "note");
        assert_eq!(parts[0].filename, None);
        assert_eq!(parts[0].data, b"hello");
        assert_eq!(parts[1].name, "file");
        assert_eq!(parts[1].filename.as_deref(), Some("cat.png"));
        assert_eq!(parts[1].content_type.as_deref(), Some("image/png"));
        assert_eq!(parts[1].data, &[0, 1, b'\r', b'\n', 2]);
        Ok(())
    }

    #[test]
    fn rejects_truncated_bodies() {
        let body = body();
        assert!(parse(&body[..body.len() - 12], "XyZ").is_err());
        assert!(parse(b"no boundary here", "XyZ").is_err());
    }
}
