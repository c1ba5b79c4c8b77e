//! The cloneable request descriptor carried through the gate stack.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use http::Method;
use serde::Serialize;

/// A self-contained description of one outbound request: method, URL, headers
/// and body. Unlike `http::Request`, the descriptor is `Clone`, so the retry
/// layer can resubmit it verbatim.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Option<Bytes>,
    resubmitted: bool,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            resubmitted: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::PATCH, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Serializes `payload` as the JSON body and sets the content type.
    pub fn json<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.body = Some(Bytes::from(serde_json::to_vec(payload)?));
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub(crate) fn into_parts(self) -> (Method, String, HeaderMap, Option<Bytes>) {
        (self.method, self.url, self.headers, self.body)
    }
}

/// Marks requests that have already been resubmitted by a retry layer, so
/// stacked retry layers cannot compound retries of one logical request.
pub trait Resubmittable {
    fn is_resubmitted(&self) -> bool;
    fn mark_resubmitted(&mut self);
}

impl Resubmittable for ApiRequest {
    fn is_resubmitted(&self) -> bool {
        self.resubmitted
    }

    fn mark_resubmitted(&mut self) {
        self.resubmitted = true;
    }
}
