//! Body buffering, content-type classification, and structured parsing for
//! the request logger.

use std::collections::BTreeMap;
use std::fmt;

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;
use percent_encoding::percent_decode;
use serde_json::{Map, Value};

/// Content types whose bodies are read and logged. Matched as
/// case-insensitive substrings of the `Content-Type` header.
pub const LOGGABLE_CONTENT_TYPES: [&str; 4] = [
    "application/json",
    "application/x-www-form-urlencoded",
    "application/xml",
    "text/xml",
];

#[must_use]
pub fn should_log(content_type: &str) -> bool {
    let lowered = content_type.to_ascii_lowercase();
    LOGGABLE_CONTENT_TYPES.iter().any(|t| lowered.contains(t))
}

/// Which side of the exchange a body belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Request,
    Response,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Request => "request",
            Self::Response => "response",
        })
    }
}

/// Parser chosen for a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Json,
    Form,
    Xml,
    Raw,
}

impl BodyFormat {
    /// Picks a parser by case-sensitive substring match, so a type admitted
    /// by [`should_log`] only through different casing is logged raw.
    #[must_use]
    pub fn detect(content_type: &str, phase: Phase) -> Self {
        if content_type.contains("application/json") {
            Self::Json
        } else if phase == Phase::Request
            && content_type.contains("application/x-www-form-urlencoded")
        {
            Self::Form
        } else if content_type.contains("application/xml") || content_type.contains("text/xml") {
            Self::Xml
        } else {
            Self::Raw
        }
    }

    fn label(self) -> Option<&'static str> {
        match self {
            Self::Json => Some("JSON"),
            Self::Form => Some("form-urlencoded"),
            Self::Xml => Some("XML"),
            Self::Raw => None,
        }
    }

    /// Log message for a successfully parsed body, e.g. `JSON request-body parsed`.
    #[must_use]
    pub fn parsed_message(self, phase: Phase) -> String {
        match self.label() {
            Some(label) => format!("{label} {phase}-body parsed"),
            None => format!("{phase}-body"),
        }
    }

    /// Error text for a body that failed to parse, e.g. `failed to parse JSON request-body`.
    #[must_use]
    pub fn failure_message(self, phase: Phase) -> String {
        match self.label() {
            Some(label) => format!("failed to parse {label} {phase}-body"),
            None => format!("failed to read {phase}-body"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid form-urlencoded data: {0}")]
    Form(&'static str),
    #[error("body is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("invalid XML: {0}")]
    Xml(#[from] roxmltree::Error),
}

/// A body decoded for logging.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedBody {
    Json(Value),
    /// Field name to comma-joined values.
    Form(BTreeMap<String, String>),
    Xml(Value),
    Raw(String),
}

impl ParsedBody {
    /// Compact text written into the log event.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Json(value) | Self::Xml(value) => value.to_string(),
            Self::Form(fields) => {
                let object: Map<String, Value> = fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                Value::Object(object).to_string()
            }
            Self::Raw(text) => text.clone(),
        }
    }
}

/// Decodes `bytes` with the parser for `format`. Raw bodies never fail and
/// are cut to `max_length` characters.
///
/// # Errors
///
/// Returns a [`BodyError`] when the bytes are not valid for the format.
pub fn parse(format: BodyFormat, bytes: &[u8], max_length: usize) -> Result<ParsedBody, BodyError> {
    match format {
        BodyFormat::Json => Ok(ParsedBody::Json(serde_json::from_slice(bytes)?)),
        BodyFormat::Form => Ok(ParsedBody::Form(parse_form(bytes)?)),
        BodyFormat::Xml => {
            let text = std::str::from_utf8(bytes)?;
            let doc = roxmltree::Document::parse(text)?;
            Ok(ParsedBody::Xml(xml_to_json(doc.root_element())))
        }
        BodyFormat::Raw => Ok(ParsedBody::Raw(truncate(bytes, max_length))),
    }
}

fn truncate(bytes: &[u8], max_length: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    match text.char_indices().nth(max_length) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.into_owned(),
    }
}

/// Strict `application/x-www-form-urlencoded` parsing: a malformed escape,
/// invalid UTF-8, or a `;` in a key rejects the whole body.
fn parse_form(bytes: &[u8]) -> Result<BTreeMap<String, String>, BodyError> {
    let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for pair in bytes.split(|b| *b == b'&') {
        if pair.is_empty() {
            continue;
        }
        if pair.contains(&b';') {
            return Err(BodyError::Form("invalid semicolon separator"));
        }
        let (key, value) = match pair.iter().position(|b| *b == b'=') {
            Some(idx) => (&pair[..idx], &pair[idx + 1..]),
            None => (pair, &[][..]),
        };
        let key = decode_component(key)?;
        let value = decode_component(value)?;
        fields.entry(key).or_default().push(value);
    }
    Ok(fields
        .into_iter()
        .map(|(key, values)| (key, values.join(",")))
        .collect())
}

fn decode_component(raw: &[u8]) -> Result<String, BodyError> {
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' {
            let valid = raw
                .get(i + 1..i + 3)
                .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
            if !valid {
                return Err(BodyError::Form("invalid percent escape"));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    let spaced: Vec<u8> = raw
        .iter()
        .map(|b| if *b == b'+' { b' ' } else { *b })
        .collect();
    percent_decode(&spaced)
        .decode_utf8()
        .map(std::borrow::Cow::into_owned)
        .map_err(|_| BodyError::Form("invalid UTF-8 in field"))
}

/// Maps an XML element to `{"tag", "attributes", "text", "children"}`,
/// leaving out empty members.
fn xml_to_json(node: roxmltree::Node<'_, '_>) -> Value {
    let mut object = Map::new();
    object.insert("tag".into(), Value::String(node.tag_name().name().to_string()));

    let attributes: Map<String, Value> = node
        .attributes()
        .map(|a| (a.name().to_string(), Value::String(a.value().to_string())))
        .collect();
    if !attributes.is_empty() {
        object.insert("attributes".into(), Value::Object(attributes));
    }

    let text: String = node
        .children()
        .filter(roxmltree::Node::is_text)
        .filter_map(|n| n.text())
        .collect();
    let text = text.trim();
    if !text.is_empty() {
        object.insert("text".into(), Value::String(text.to_string()));
    }

    let children: Vec<Value> = node
        .children()
        .filter(roxmltree::Node::is_element)
        .map(xml_to_json)
        .collect();
    if !children.is_empty() {
        object.insert("children".into(), Value::Array(children));
    }
    Value::Object(object)
}

/// Outcome of draining a body: every byte received, plus the error that
/// stopped the read early, if any.
#[derive(Debug)]
pub struct Drained {
    pub bytes: Bytes,
    pub error: Option<axum::Error>,
}

/// Reads `body` to the end. On a transport error the bytes received so far
/// are kept so the caller can still restore them.
pub async fn drain(mut body: Body) -> Drained {
    let mut buf = BytesMut::new();
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                if let Ok(data) = frame.into_data() {
                    buf.extend_from_slice(&data);
                }
            }
            Err(error) => {
                return Drained {
                    bytes: buf.freeze(),
                    error: Some(error),
                };
            }
        }
    }
    Drained {
        bytes: buf.freeze(),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_is_case_insensitive_substring() {
        assert!(should_log("application/json; charset=utf-8"));
        assert!(should_log("Application/JSON"));
        assert!(should_log("text/xml"));
        assert!(should_log("application/x-www-form-urlencoded"));
        assert!(!should_log("multipart/form-data; boundary=x"));
        assert!(!should_log("text/html"));
        assert!(!should_log(""));
    }

    #[test]
    fn dispatch_is_case_sensitive() {
        assert_eq!(BodyFormat::detect("application/json", Phase::Request), BodyFormat::Json);
        assert_eq!(BodyFormat::detect("Application/JSON", Phase::Request), BodyFormat::Raw);
        assert_eq!(BodyFormat::detect("text/xml", Phase::Request), BodyFormat::Xml);
    }

    #[test]
    fn form_responses_are_logged_raw() {
        let ct = "application/x-www-form-urlencoded";
        assert_eq!(BodyFormat::detect(ct, Phase::Request), BodyFormat::Form);
        assert_eq!(BodyFormat::detect(ct, Phase::Response), BodyFormat::Raw);
    }

    #[test]
    fn messages_name_format_and_phase() {
        assert_eq!(
            BodyFormat::Json.failure_message(Phase::Request),
            "failed to parse JSON request-body"
        );
        assert_eq!(
            BodyFormat::Xml.failure_message(Phase::Response),
            "failed to parse XML response-body"
        );
        assert_eq!(
            BodyFormat::Form.parsed_message(Phase::Request),
            "form-urlencoded request-body parsed"
        );
    }

    #[test]
    fn json_parses_and_rejects() {
        let parsed = parse(BodyFormat::Json, br#"{"a":1}"#, 10).unwrap();
        assert_eq!(parsed.render(), r#"{"a":1}"#);
        assert!(parse(BodyFormat::Json, b"{bad", 10).is_err());
        assert!(parse(BodyFormat::Json, b"", 10).is_err());
    }

    #[test]
    fn form_joins_repeated_values() {
        let parsed = parse(BodyFormat::Form, b"tag=a&name=Jane+Doe&tag=b%21", 10).unwrap();
        let ParsedBody::Form(fields) = parsed else {
            panic!("expected form");
        };
        assert_eq!(fields["tag"], "a,b!");
        assert_eq!(fields["name"], "Jane Doe");
    }

    #[test]
    fn form_rejects_bad_escapes() {
        assert!(parse(BodyFormat::Form, b"a=%zz", 10).is_err());
        assert!(parse(BodyFormat::Form, b"a=%4", 10).is_err());
        assert!(parse(BodyFormat::Form, b"a=%ff", 10).is_err());
        assert!(parse(BodyFormat::Form, b"a=1;b=2", 10).is_err());
    }

    #[test]
    fn xml_becomes_structured_value() {
        let parsed = parse(
            BodyFormat::Xml,
            br#"<order id="7"><item>Bolt</item></order>"#,
            10,
        )
        .unwrap();
        let ParsedBody::Xml(value) = parsed else {
            panic!("expected xml");
        };
        assert_eq!(value["tag"], "order");
        assert_eq!(value["attributes"]["id"], "7");
        assert_eq!(value["children"][0]["text"], "Bolt");

        assert!(parse(BodyFormat::Xml, b"<order>", 10).is_err());
    }

    #[test]
    fn raw_is_truncated_by_characters() {
        let parsed = parse(BodyFormat::Raw, "привет мир".as_bytes(), 6).unwrap();
        assert_eq!(parsed, ParsedBody::Raw("привет".to_string()));
        let short = parse(BodyFormat::Raw, b"hi", 6).unwrap();
        assert_eq!(short, ParsedBody::Raw("hi".to_string()));
    }

    #[tokio::test]
    async fn drain_keeps_prefix_on_error() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"{\"par")),
            Err(std::io::Error::other("connection reset")),
        ];
        let body = Body::from_stream(futures_util::stream::iter(chunks));

        let drained = drain(body).await;
        assert_eq!(&drained.bytes[..], b"{\"par");
        assert!(drained.error.is_some());
    }

    #[tokio::test]
    async fn drain_reads_whole_body() {
        let drained = drain(Body::from("a=1")).await;
        assert_eq!(&drained.bytes[..], b"a=1");
        assert!(drained.error.is_none());
    }

    proptest::proptest! {
        #[test]
        fn raw_truncation_is_a_char_prefix(text in "\\PC{0,64}", max in 0usize..80) {
            let ParsedBody::Raw(cut) = parse(BodyFormat::Raw, text.as_bytes(), max).unwrap() else {
                unreachable!("raw format yields raw text");
            };
            proptest::prop_assert!(cut.chars().count() <= max);
            proptest::prop_assert!(text.starts_with(&cut));
        }

        #[test]
        fn form_never_panics(bytes in proptest::collection::vec(proptest::num::u8::ANY, 0..64)) {
            let _ = parse(BodyFormat::Form, &bytes, 16);
        }
    }
}
