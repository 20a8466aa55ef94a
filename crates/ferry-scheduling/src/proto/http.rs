/// A header with all its values.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Header {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, repeated, tag = "2")]
    pub values: Vec<String>,
}

/// An opaque HTTP request carried from the frontend to the querier.
#[derive(Clone, PartialEq, prost::Message)]
pub struct HttpRequest {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(string, tag = "2")]
    pub url: String,
    #[prost(message, repeated, tag = "3")]
    pub headers: Vec<Header>,
    #[prost(bytes = "vec", tag = "4")]
    pub body: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HttpResponse {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(message, repeated, tag = "2")]
    pub headers: Vec<Header>,
    #[prost(bytes = "vec", tag = "3")]
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Returns the header entries as `(key, values)` pairs.
    pub fn header_values(&self) -> impl Iterator<Item = (&str, impl Iterator<Item = &str>)> {
        self.headers
            .iter()
            .map(|h| (h.key.as_str(), h.values.iter().map(|v| v.as_str())))
    }
}

impl HttpResponse {
    pub fn with_text(code: i32, text: impl Into<String>) -> Self {
        Self {
            code,
            headers: vec![Header {
                key: "Content-Type".to_string(),
                values: vec!["text/plain; charset=utf-8".to_string()],
            }],
            body: text.into().into_bytes(),
        }
    }
}
