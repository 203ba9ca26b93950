//! Blocking HTTP transport for the harness.
//!
//! [`HttpServiceClient`] hands every status code back to the harness; only
//! failures to talk to the cluster at all become errors.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rollcheck_harness::{
    HarnessError, HarnessResult, Method, ServiceClient, ServiceRequest, ServiceResponse,
};

use crate::settings::ServiceSettings;

pub struct HttpServiceClient {
    agent: ureq::Agent,
    base_url: String,
    authorization: Option<String>,
}

impl HttpServiceClient {
    pub fn new(settings: &ServiceSettings) -> Self {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(settings.timeout_secs)))
            .build();
        let authorization = match (&settings.username, &settings.password) {
            (Some(user), Some(password)) => Some(basic_auth(user, password)),
            _ => None,
        };

        HttpServiceClient {
            agent: ureq::Agent::new_with_config(config),
            base_url: settings.url.trim_end_matches('/').to_string(),
            authorization,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn prepare<B>(&self, mut builder: ureq::RequestBuilder<B>, request: &ServiceRequest) -> ureq::RequestBuilder<B> {
        for (key, value) in &request.params {
            builder = builder.query(key, value);
        }
        if let Some(auth) = &self.authorization {
            builder = builder.header("Authorization", auth);
        }
        builder
    }

    fn send(&self, request: &ServiceRequest) -> Result<ureq::http::Response<ureq::Body>, ureq::Error> {
        let url = format!("{}{}", self.base_url, request.path);
        match request.method {
            Method::Get => self.prepare(self.agent.get(&url), request).call(),
            Method::Delete => self.prepare(self.agent.delete(&url), request).call(),
            Method::Put | Method::Post => {
                let builder = match request.method {
                    Method::Put => self.agent.put(&url),
                    _ => self.agent.post(&url),
                };
                let builder = self.prepare(builder, request);
                match &request.body {
                    Some(body) => builder
                        .content_type(request.content_type.as_deref().unwrap_or("application/json"))
                        .send(body.as_str()),
                    None => builder.send_empty(),
                }
            }
        }
    }
}

impl ServiceClient for HttpServiceClient {
    fn call(&self, request: &ServiceRequest) -> HarnessResult<ServiceResponse> {
        let response = self.send(request).map_err(|e| classify(e, request))?;
        let status = response.status().as_u16();
        let body = response
            .into_body()
            .read_to_string()
            .map_err(|e| classify(e, request))?;
        tracing::trace!(%request, status, "http exchange");
        Ok(ServiceResponse::new(status, body))
    }
}

fn basic_auth(user: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{}:{}", user, password)))
}

/// Transport failures are `Unreachable`; everything else is a harness bug
/// or a misconfiguration and is `Fatal`.
pub(crate) fn classify(err: ureq::Error, request: &ServiceRequest) -> HarnessError {
    let transport = matches!(
        err,
        ureq::Error::Io(_)
            | ureq::Error::Timeout(_)
            | ureq::Error::HostNotFound
            | ureq::Error::ConnectionFailed
    );
    let message = format!("{}: {}", request, err);
    if transport {
        HarnessError::unreachable(message)
    } else {
        HarnessError::fatal(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serve one canned response and hand back the raw request head.
    fn one_shot_server(status_line: &'static str, body: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut head = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if let Some(len) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = len.trim().parse().unwrap();
                }
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                head.push_str(&line);
            }
            let mut payload = vec![0u8; content_length];
            std::io::Read::read_exact(&mut reader, &mut payload).unwrap();
            head.push_str(&String::from_utf8(payload).unwrap());

            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            )
            .unwrap();
            head
        });
        (url, handle)
    }

    fn settings(url: &str) -> ServiceSettings {
        ServiceSettings {
            url: url.to_string(),
            timeout_secs: 5,
            ..ServiceSettings::default()
        }
    }

    #[test]
    fn error_statuses_are_responses_not_errors() {
        let (url, server) = one_shot_server("503 Service Unavailable", r#"{"error":"no shards"}"#);
        let client = HttpServiceClient::new(&settings(&url));

        let response = client
            .call(&ServiceRequest::get("/bwc_watch_index/_search").param("size", "0"))
            .unwrap();

        assert_eq!(response.status, 503);
        assert!(response.is_unavailable());
        let head = server.join().unwrap();
        assert!(head.starts_with("GET /bwc_watch_index/_search?size=0 HTTP/1.1"));
        assert!(head.contains(&basic_auth("test_user", "x-pack-test-password")));
    }

    #[test]
    fn json_bodies_are_sent_with_content_type() {
        let (url, server) = one_shot_server("200 OK", r#"{"acknowledged":true}"#);
        let client = HttpServiceClient::new(&settings(&url));

        let response = client
            .call(&ServiceRequest::put("/_xpack/rollup/job/x").json(&serde_json::json!({"page_size": 100})))
            .unwrap();

        assert!(response.is_success());
        let head = server.join().unwrap().to_ascii_lowercase();
        assert!(head.starts_with("put /_xpack/rollup/job/x"));
        assert!(head.contains("content-type: application/json"));
        assert!(head.ends_with(r#"{"page_size":100}"#));
    }

    #[test]
    fn closed_port_is_unreachable() {
        // Bind then drop to get a port nothing listens on.
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let client = HttpServiceClient::new(&settings(&format!("http://127.0.0.1:{}", port)));

        let err = client.call(&ServiceRequest::get("/")).unwrap_err();
        assert!(err.aborts_run(), "expected unreachable, got {err:?}");
    }

    #[test]
    fn transport_errors_classify_as_unreachable() {
        let request = ServiceRequest::get("/_cluster/health");
        assert!(classify(ureq::Error::HostNotFound, &request).aborts_run());
        assert!(classify(ureq::Error::ConnectionFailed, &request).aborts_run());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(classify(ureq::Error::Io(io), &request).aborts_run());

        let fatal = classify(ureq::Error::BadUri("::".to_string()), &request);
        assert!(matches!(fatal, HarnessError::Fatal { .. }));
        assert!(fatal.to_string().contains("GET /_cluster/health"));
    }

    #[test]
    fn credentials_are_optional() {
        let client = HttpServiceClient::new(&ServiceSettings {
            username: None,
            ..settings("http://localhost:9200/")
        });
        assert!(client.authorization.is_none());
        assert_eq!(client.base_url(), "http://localhost:9200");
    }
}
