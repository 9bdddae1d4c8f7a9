//! The HTTP-spec request adapter.
//!
//! A target model endpoint is described by a plain-text blueprint: a request
//! line (`METHOD URL`), header lines until a blank line, and the remainder as
//! body.  The body may carry the placeholders `<<PROMPT>>`,
//! `<<BASE64_IMAGE>>` and `<<BASE64_AUDIO>>`.  Parsing derives the spec's
//! modality once; materialization substitutes a concrete prompt payload into
//! the body and yields a request ready to be sent by the target client.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProbeError;

pub const PROMPT_PLACEHOLDER: &str = "<<PROMPT>>";
pub const IMAGE_PLACEHOLDER: &str = "<<BASE64_IMAGE>>";
pub const AUDIO_PLACEHOLDER: &str = "<<BASE64_AUDIO>>";

const HTTP_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS",
];

/// Which placeholder channel the spec uses.  Exactly one modality per spec,
/// derived at parse time: multipart content wins, then image, then audio,
/// then text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
    Audio,
    Files,
}

impl Modality {
    pub fn detect(content_type: Option<&str>, body: &str) -> Self {
        let multipart = content_type
            .map(|ct| ct.trim().to_ascii_lowercase().starts_with("multipart/"))
            .unwrap_or(false);
        if multipart {
            Modality::Files
        } else if body.contains(IMAGE_PLACEHOLDER) {
            Modality::Image
        } else if body.contains(AUDIO_PLACEHOLDER) {
            Modality::Audio
        } else {
            Modality::Text
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
            Modality::Audio => "audio",
            Modality::Files => "files",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed HTTP blueprint.  Header casing and order are preserved as given.
#[derive(Clone, Debug)]
pub struct HttpSpec {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub modality: Modality,
}

/// One file attachment for a multipart request.
#[derive(Clone, Debug)]
pub struct FilePart {
    pub field: String,
    pub filename: String,
    pub mime: String,
    pub data: Vec<u8>,
}

/// The concrete prompt payload for one attempt.  The variant must match the
/// spec's modality or materialization fails before any request is sent.
#[derive(Clone, Debug)]
pub enum PromptPayload {
    Text {
        prompt: String,
    },
    Image {
        prompt: String,
        image_b64: String,
    },
    Audio {
        prompt: String,
        audio_b64: String,
    },
    Files {
        prompt: String,
        files: Vec<FilePart>,
    },
}

impl PromptPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            PromptPayload::Text { .. } => "text",
            PromptPayload::Image { .. } => "image",
            PromptPayload::Audio { .. } => "audio",
            PromptPayload::Files { .. } => "files",
        }
    }

    pub fn prompt(&self) -> &str {
        match self {
            PromptPayload::Text { prompt }
            | PromptPayload::Image { prompt, .. }
            | PromptPayload::Audio { prompt, .. }
            | PromptPayload::Files { prompt, .. } => prompt,
        }
    }

    fn matches(&self, modality: Modality) -> bool {
        matches!(
            (self, modality),
            (PromptPayload::Text { .. }, Modality::Text)
                | (PromptPayload::Image { .. }, Modality::Image)
                | (PromptPayload::Audio { .. }, Modality::Audio)
                | (PromptPayload::Files { .. }, Modality::Files)
        )
    }
}

/// Body of a materialized request.  Multipart bodies keep their parts
/// structured so the HTTP client can assemble the form with a proper
/// boundary.
#[derive(Clone, Debug)]
pub enum RequestBody {
    Bytes(Vec<u8>),
    Multipart {
        text_fields: Vec<(String, String)>,
        files: Vec<FilePart>,
    },
}

/// A request ready to send: blueprint headers plus the substituted body.
#[derive(Clone, Debug)]
pub struct MaterializedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpSpec {
    /// Parse a raw blueprint.  Fails when the first line is not
    /// `METHOD URL`, the method is unknown, the URL does not parse or the
    /// blank-line separator between headers and body is absent.
    pub fn parse(blueprint: &str) -> Result<Self, ProbeError> {
        let (head, body) = split_head_body(blueprint)
            .ok_or_else(|| ProbeError::Spec("missing blank-line separator".into()))?;

        let mut lines = head.lines();
        let request_line = lines
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| ProbeError::Spec("empty request line".into()))?;
        let (method, url) = request_line
            .split_once(char::is_whitespace)
            .ok_or_else(|| {
                ProbeError::Spec(format!("request line is not 'METHOD URL': {request_line:?}"))
            })?;
        let method = method.trim().to_ascii_uppercase();
        if !HTTP_METHODS.contains(&method.as_str()) {
            return Err(ProbeError::Spec(format!("unknown HTTP method {method:?}")));
        }
        let url = url.trim();
        reqwest::Url::parse(url).map_err(|e| ProbeError::Spec(format!("bad URL {url:?}: {e}")))?;

        let mut headers = Vec::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| {
                ProbeError::Spec(format!("malformed header line {line:?}"))
            })?;
            headers.push((name.trim_end().to_string(), value.trim().to_string()));
        }

        let content_type = lookup_header(&headers, "content-type");
        let modality = Modality::detect(content_type, body);

        Ok(HttpSpec {
            method,
            url: url.to_string(),
            headers,
            body: body.to_string(),
            modality,
        })
    }

    /// Render the spec back to blueprint text.  Round-trips with `parse` up
    /// to header-value trimming and a single trailing newline.
    pub fn print(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.method);
        out.push(' ');
        out.push_str(&self.url);
        out.push('\n');
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out
    }

    pub fn content_type(&self) -> Option<&str> {
        lookup_header(&self.headers, "content-type")
    }

    fn is_json(&self) -> bool {
        self.content_type()
            .map(|ct| ct.to_ascii_lowercase().contains("json"))
            .unwrap_or(false)
    }

    /// Substitute the payload into the body and produce a concrete request.
    ///
    /// Each placeholder is substituted exactly once.  `<<PROMPT>>` receives
    /// the prompt text, JSON-escaped when the spec declares a JSON content
    /// type.  Placeholders left over after substitution (a channel the
    /// payload does not carry) are stripped so none survive in the wire
    /// body.  A `Content-Length` header is appended when missing and the
    /// byte body is non-empty.
    pub fn materialize(&self, payload: &PromptPayload) -> Result<MaterializedRequest, ProbeError> {
        if !payload.matches(self.modality) {
            return Err(ProbeError::Modality {
                expected: self.modality,
                supplied: payload.kind(),
            });
        }

        let prompt_value = if self.is_json() {
            escape_json_string(payload.prompt())
        } else {
            payload.prompt().to_string()
        };

        let body = match payload {
            PromptPayload::Files { prompt, files } => {
                RequestBody::Multipart {
                    text_fields: multipart_text_fields(&self.body, prompt),
                    files: files.clone(),
                }
            }
            PromptPayload::Text { .. } => {
                let rendered = self.body.replacen(PROMPT_PLACEHOLDER, &prompt_value, 1);
                RequestBody::Bytes(strip_placeholders(&rendered).into_bytes())
            }
            PromptPayload::Image { image_b64, .. } => {
                let rendered = self
                    .body
                    .replacen(PROMPT_PLACEHOLDER, &prompt_value, 1)
                    .replacen(IMAGE_PLACEHOLDER, image_b64, 1);
                RequestBody::Bytes(strip_placeholders(&rendered).into_bytes())
            }
            PromptPayload::Audio { audio_b64, .. } => {
                let rendered = self
                    .body
                    .replacen(PROMPT_PLACEHOLDER, &prompt_value, 1)
                    .replacen(AUDIO_PLACEHOLDER, audio_b64, 1);
                RequestBody::Bytes(strip_placeholders(&rendered).into_bytes())
            }
        };

        let mut headers = self.headers.clone();
        if let RequestBody::Bytes(bytes) = &body {
            if !bytes.is_empty() && lookup_header(&headers, "content-length").is_none() {
                headers.push(("Content-Length".to_string(), bytes.len().to_string()));
            }
        }

        Ok(MaterializedRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers,
            body,
        })
    }
}

/// Split the blueprint into head (request line + headers) and body at the
/// first blank line.  Returns `None` when the separator is absent.
fn split_head_body(blueprint: &str) -> Option<(&str, &str)> {
    if let Some(idx) = blueprint.find("\r\n\r\n") {
        return Some((&blueprint[..idx], &blueprint[idx + 4..]));
    }
    blueprint
        .find("\n\n")
        .map(|idx| (&blueprint[..idx], &blueprint[idx + 2..]))
}

fn lookup_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Remove any placeholder tokens the substitution pass did not cover, so no
/// placeholder ever reaches the wire.
fn strip_placeholders(body: &str) -> String {
    body.replace(PROMPT_PLACEHOLDER, "")
        .replace(IMAGE_PLACEHOLDER, "")
        .replace(AUDIO_PLACEHOLDER, "")
}

/// Derive the text fields of a multipart form from the blueprint body.  A
/// JSON-object body contributes one field per string entry (with
/// `<<PROMPT>>` substituted); any other non-empty body becomes a single
/// `prompt` field when it carries the placeholder.  The file slot itself is
/// filled from the payload's files, never from body placeholders.
fn multipart_text_fields(body: &str, prompt: &str) -> Vec<(String, String)> {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(body) {
        return map
            .into_iter()
            .filter_map(|(k, v)| {
                v.as_str()
                    .map(|s| (k, s.replacen(PROMPT_PLACEHOLDER, prompt, 1)))
            })
            .collect();
    }
    if body.contains(PROMPT_PLACEHOLDER) {
        return vec![("prompt".to_string(), prompt.to_string())];
    }
    Vec::new()
}

/// JSON-escape a string value without the surrounding quotes, for splicing
/// into a JSON body template.
pub(crate) fn escape_json_string(value: &str) -> String {
    match serde_json::to_string(value) {
        Ok(mut json) => {
            if json.len() >= 2 {
                json.remove(0);
                json.pop();
            }
            json
        }
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_quotes_and_newlines() {
        assert_eq!(escape_json_string("a\"b\nc"), "a\\\"b\\nc");
        assert_eq!(escape_json_string("plain"), "plain");
    }

    #[test]
    fn rejects_missing_separator() {
        let err = HttpSpec::parse("POST https://x/\nContent-Type: text/plain").unwrap_err();
        assert!(matches!(err, ProbeError::Spec(_)));
    }

    #[test]
    fn rejects_unknown_method() {
        let err = HttpSpec::parse("YEET https://x/\n\n").unwrap_err();
        assert!(matches!(err, ProbeError::Spec(_)));
    }

    #[test]
    fn rejects_bad_url() {
        let err = HttpSpec::parse("POST not-a-url\n\n").unwrap_err();
        assert!(matches!(err, ProbeError::Spec(_)));
    }

    #[test]
    fn preserves_header_casing_and_order() {
        let spec = HttpSpec::parse(
            "POST https://x/\nX-First: 1\ncontent-type: application/json\nX-Last: 2\n\n{}",
        )
        .unwrap();
        let names: Vec<&str> = spec.headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["X-First", "content-type", "X-Last"]);
    }

    #[test]
    fn crlf_blueprints_parse() {
        let spec =
            HttpSpec::parse("POST https://x/\r\nContent-Type: application/json\r\n\r\n{\"p\":1}")
                .unwrap();
        assert_eq!(spec.body, "{\"p\":1}");
    }
}
