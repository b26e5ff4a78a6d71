//! `multipart/form-data` bodies for test requests.

use bytes::Bytes;

/// Bytes of random material in a generated boundary.
const BOUNDARY_BYTES: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartFile {
    pub field_name: String,
    pub file_name: String,
    pub content: Bytes,
}

/// Multipart payload. Files are written first, then plain fields, each
/// group in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Multipart {
    files: Vec<MultipartFile>,
    fields: Vec<(String, String)>,
}

impl Multipart {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn add_file(
        mut self,
        field_name: impl Into<String>,
        file_name: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        self.files.push(MultipartFile {
            field_name: field_name.into(),
            file_name: file_name.into(),
            content: content.into(),
        });
        self
    }

    #[must_use]
    pub fn add_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Adds every pair as a plain field.
    #[must_use]
    pub fn add_form<K, V>(self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        pairs
            .into_iter()
            .fold(self, |form, (name, value)| form.add_field(name, value))
    }

    #[must_use]
    pub fn files(&self) -> &[MultipartFile] {
        &self.files
    }

    #[must_use]
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Encodes with a fresh random boundary, returning `(content_type, body)`.
    #[must_use]
    pub fn encode(&self) -> (String, Vec<u8>) {
        let boundary = random_boundary();
        (content_type(&boundary), self.encode_with_boundary(&boundary))
    }

    /// Encodes with a caller-chosen boundary.
    #[must_use]
    pub fn encode_with_boundary(&self, boundary: &str) -> Vec<u8> {
        let mut out = Vec::new();
        let mut first = true;
        let mut open_part = |out: &mut Vec<u8>, headers: &[String]| {
            if !first {
                out.extend_from_slice(b"\r\n");
            }
            first = false;
            out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            for header in headers {
                out.extend_from_slice(header.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"\r\n");
        };

        for file in &self.files {
            open_part(
                &mut out,
                &[
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"",
                        escape_quotes(&file.field_name),
                        escape_quotes(&file.file_name)
                    ),
                    "Content-Type: application/octet-stream".to_string(),
                ],
            );
            out.extend_from_slice(&file.content);
        }
        for (name, value) in &self.fields {
            open_part(
                &mut out,
                &[format!(
                    "Content-Disposition: form-data; name=\"{}\"",
                    escape_quotes(name)
                )],
            );
            out.extend_from_slice(value.as_bytes());
        }

        out.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        out
    }
}

#[must_use]
pub fn content_type(boundary: &str) -> String {
    format!("multipart/form-data; boundary={boundary}")
}

fn random_boundary() -> String {
    hex::encode(rand::random::<[u8; BOUNDARY_BYTES]>())
}

fn escape_quotes(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
