//! Request descriptors and the purl batch wire types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HTTP method of an [`ApiRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// A request against the service, relative to the executor's base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// POST with a JSON body.
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            body: Some(body),
            ..Self::new(Method::Post, path)
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Append query parameters.
    pub fn with_query<K, V>(mut self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.query
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }
}

/// One entry of a purl batch lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurlComponent {
    pub purl: String,
}

/// Body of `POST /purl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurlBatchRequest {
    pub components: Vec<PurlComponent>,
}

impl PurlBatchRequest {
    pub fn from_purls<I, S>(purls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            components: purls
                .into_iter()
                .map(|p| PurlComponent { purl: p.into() })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purl_batch_serialization() {
        let body = PurlBatchRequest::from_purls(["pkg:npm/lodash@4.17.21", "pkg:pypi/requests@2.31.0"]);
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(
            json,
            r#"{"components":[{"purl":"pkg:npm/lodash@4.17.21"},{"purl":"pkg:pypi/requests@2.31.0"}]}"#
        );
    }

    #[test]
    fn request_builder_appends_query() {
        let req = ApiRequest::post("/purl", Value::Null)
            .with_query([("alerts", "true")])
            .with_query([("compact", "false")]);
        assert_eq!(req.method, Method::Post);
        assert_eq!(
            req.query,
            vec![
                ("alerts".to_string(), "true".to_string()),
                ("compact".to_string(), "false".to_string())
            ]
        );
        assert_eq!(Method::Delete.to_string(), "DELETE");
    }
}
