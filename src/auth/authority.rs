use std::fmt;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Serialize;

/// External decision point for whether an (api key, device) pair may submit data.
///
/// `Ok(false)` is an explicit rejection; `Err` means the authority could not be
/// consulted. Callers treat both as "not authenticated" for that call.
pub trait AuthAuthority: Send + Sync {
    fn authorize(&self, api_key: &str, device_id: &str) -> Result<bool, AuthorityError>;
}

#[derive(Debug)]
pub enum AuthorityError {
    BuildClient { source: reqwest::Error },
    Request { url: String, source: reqwest::Error },
}

impl fmt::Display for AuthorityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuildClient { source } => {
                write!(f, "failed to build authentication HTTP client: {source}")
            }
            Self::Request { url, source } => {
                write!(f, "authentication request to '{url}' failed: {source}")
            }
        }
    }
}

impl std::error::Error for AuthorityError {}

#[derive(Serialize)]
struct AuthorizeRequest<'a> {
    api_key: &'a str,
    device_id: &'a str,
}

/// POSTs `{"api_key", "device_id"}` as JSON; any 2xx response accepts the pair.
pub struct HttpAuthority {
    url: String,
    client: Client,
}

impl HttpAuthority {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, AuthorityError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|source| AuthorityError::BuildClient { source })?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

impl AuthAuthority for HttpAuthority {
    fn authorize(&self, api_key: &str, device_id: &str) -> Result<bool, AuthorityError> {
        let response = self
            .client
            .post(&self.url)
            .json(&AuthorizeRequest { api_key, device_id })
            .send()
            .map_err(|source| AuthorityError::Request {
                url: self.url.clone(),
                source,
            })?;
        Ok(response.status().is_success())
    }
}

/// Accepts every pair. Used when no authority URL is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenAuthority;

impl AuthAuthority for OpenAuthority {
    fn authorize(&self, _api_key: &str, _device_id: &str) -> Result<bool, AuthorityError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use serde_json::Value;

    use super::{AuthAuthority, HttpAuthority, OpenAuthority};

    /// Answers a single HTTP request with `status_line` and returns the JSON body it received.
    fn one_shot_http_server(status_line: &'static str) -> (String, JoinHandle<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test http server");
        let url = format!("http://{}/authorize", listener.local_addr().expect("local addr"));

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept authority request");
            let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));

            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("read header line");
                let trimmed = line.trim_end();
                if trimmed.is_empty() {
                    break;
                }
                if let Some((name, value)) = trimmed.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().expect("content length");
                    }
                }
            }

            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).expect("read request body");

            let mut stream = stream;
            let response = format!("{status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            stream
                .write_all(response.as_bytes())
                .expect("write authority response");
            serde_json::from_slice(&body).expect("request body should be JSON")
        });

        (url, handle)
    }

    #[test]
    fn success_status_accepts_and_posts_pair() {
        let (url, server) = one_shot_http_server("HTTP/1.1 200 OK");
        let authority =
            HttpAuthority::new(url, Duration::from_secs(5)).expect("client should build");

        let accepted = authority
            .authorize("key-123", "mill-1")
            .expect("authority should respond");
        assert!(accepted);

        let body = server.join().expect("server thread should finish");
        assert_eq!(body["api_key"], "key-123");
        assert_eq!(body["device_id"], "mill-1");
    }

    #[test]
    fn non_success_status_rejects() {
        let (url, server) = one_shot_http_server("HTTP/1.1 403 Forbidden");
        let authority =
            HttpAuthority::new(url, Duration::from_secs(5)).expect("client should build");

        let accepted = authority
            .authorize("revoked", "mill-1")
            .expect("authority should respond");
        assert!(!accepted);
        server.join().expect("server thread should finish");
    }

    #[test]
    fn unreachable_authority_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind placeholder");
        let url = format!("http://{}/authorize", listener.local_addr().expect("local addr"));
        drop(listener);

        let authority =
            HttpAuthority::new(url, Duration::from_millis(500)).expect("client should build");
        assert!(authority.authorize("key", "mill-1").is_err());
    }

    #[test]
    fn open_authority_accepts_everything() {
        assert!(OpenAuthority.authorize("", "").expect("open authority never fails"));
    }
}
