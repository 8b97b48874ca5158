//! Signed HTTP client for outgoing inter-service calls

use super::{AuthHeaders, ServiceIdentity};
use reqwest::{Client, Method, RequestBuilder};
use std::time::Duration;

/// reqwest wrapper that signs every request with this service's identity
#[derive(Clone)]
pub struct SignedClient {
    client: Client,
    identity: ServiceIdentity,
    timeout: Duration,
}

impl SignedClient {
    pub fn new(identity: ServiceIdentity, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            identity,
            timeout,
        }
    }

    /// Build a signed request. The signed path is the URL path without the query string.
    ///
    /// An unparseable URL still yields a builder; reqwest reports it on `send()`.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let path = reqwest::Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| "/".to_string());

        let headers = AuthHeaders::generate(&self.identity, method.as_str(), &path);
        let mut builder = self.client.request(method, url).timeout(self.timeout);
        for (name, value) in headers.pairs() {
            builder = builder.header(name, value);
        }
        builder
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(Method::POST, url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Verifier, HEADER_NONCE, HEADER_SERVICE_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP};

    #[test]
    fn test_signed_request_verifies_on_path_only() {
        let identity = ServiceIdentity::new("codebot", "shared", vec![]).unwrap();
        let client = SignedClient::new(identity, Duration::from_secs(5));
        let request = client
            .post("http://gateway:8080/internal/test-skill?debug=1")
            .build()
            .unwrap();

        let headers = request.headers();
        let auth = crate::auth::AuthHeaders {
            service_id: headers[HEADER_SERVICE_ID].to_str().unwrap().to_string(),
            timestamp: headers[HEADER_TIMESTAMP].to_str().unwrap().to_string(),
            nonce: headers[HEADER_NONCE].to_str().unwrap().to_string(),
            signature: headers[HEADER_SIGNATURE].to_str().unwrap().to_string(),
        };

        let verifier = Verifier::new(ServiceIdentity::new("gateway", "shared", vec!["codebot".into()]).unwrap());
        assert!(verifier.verify(&auth, "POST", "/internal/test-skill").is_ok());
    }
}
