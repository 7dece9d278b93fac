//! Protocol-aware liveness probes.
//!
//! Probes never fail with an error: a refused connection, a timeout or a bad
//! status all come back as [`HealthResult::Unhealthy`] carrying the reason.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;

use crate::error::SupervisorError;
use crate::registry::ServiceSpec;

/// How a service is probed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthProbe {
    /// `GET http://127.0.0.1:<port><path>`; anything below 500 counts,
    /// so an application-level 404 on `/` is still alive.
    Http { path: String },
    /// `eth_accounts` JSON-RPC call; only HTTP 200 counts.
    JsonRpc,
}

#[derive(Debug)]
pub enum HealthResult {
    Healthy { status: u16 },
    Unhealthy(SupervisorError),
}

impl HealthResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthResult::Healthy { .. })
    }
}

/// Shared HTTP client with a hard per-request deadline.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: reqwest::Client,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            // probes target loopback, never an HTTP(S)_PROXY
            .no_proxy()
            .build()
            .context("Failed to build health-check HTTP client")?;
        Ok(Self { client, timeout })
    }

    pub async fn check(&self, spec: &ServiceSpec) -> HealthResult {
        self.probe(&spec.name, spec.port, &spec.health).await
    }

    pub async fn probe(&self, service: &str, port: u16, probe: &HealthProbe) -> HealthResult {
        let response = match probe {
            HealthProbe::Http { path } => {
                let url = probe_url(port, path);
                log::trace!("{service}: GET {url}");
                self.client.get(url).send().await
            }
            HealthProbe::JsonRpc => {
                let url = probe_url(port, "/");
                log::trace!("{service}: POST eth_accounts to {url}");
                self.client
                    .post(url)
                    .json(&json!({
                        "jsonrpc": "2.0",
                        "method": "eth_accounts",
                        "params": [],
                        "id": 1
                    }))
                    .send()
                    .await
            }
        };

        let status = match response {
            Ok(response) => response.status().as_u16(),
            Err(e) => return HealthResult::Unhealthy(self.classify(service, &e)),
        };

        let healthy = match probe {
            HealthProbe::Http { .. } => (200..500).contains(&status),
            HealthProbe::JsonRpc => status == 200,
        };

        if healthy {
            HealthResult::Healthy { status }
        } else {
            HealthResult::Unhealthy(SupervisorError::HealthCheckStatus {
                service: service.to_string(),
                status,
            })
        }
    }

    fn classify(&self, service: &str, err: &reqwest::Error) -> SupervisorError {
        if err.is_timeout() {
            return SupervisorError::HealthCheckTimeout {
                service: service.to_string(),
                timeout: self.timeout,
            };
        }

        use std::error::Error as _;

        // reqwest wraps the interesting part (ECONNREFUSED, ...) a few levels down
        let mut reason = err.to_string();
        let mut source = err.source();
        while let Some(inner) = source {
            reason = inner.to_string();
            source = inner.source();
        }

        SupervisorError::HealthCheckRefused {
            service: service.to_string(),
            reason,
        }
    }
}

fn probe_url(port: u16, path: &str) -> String {
    if path.starts_with('/') {
        format!("http://127.0.0.1:{port}{path}")
    } else {
        format!("http://127.0.0.1:{port}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    /// Read one HTTP request (headers plus `Content-Length` body).
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let body_len = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length")
                            .then(|| v.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + body_len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Serve `status_line` to every connection, forwarding the raw requests.
    async fn responder(status_line: &'static str) -> (u16, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let request = read_request(&mut stream).await;
                let _ = tx.send(request);
                let reply = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                );
                let _ = stream.write_all(reply.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        (port, rx)
    }

    fn checker() -> HealthChecker {
        HealthChecker::new(Duration::from_millis(500)).unwrap()
    }

    fn root() -> HealthProbe {
        HealthProbe::Http { path: "/".into() }
    }

    #[tokio::test]
    async fn http_probe_tolerates_not_found() {
        let (port, mut requests) = responder("404 Not Found").await;
        let result = checker().probe("web", port, &root()).await;
        assert!(matches!(result, HealthResult::Healthy { status: 404 }));
        assert!(requests.recv().await.unwrap().starts_with("GET / "));
    }

    #[tokio::test]
    async fn http_probe_uses_configured_path() {
        let (port, mut requests) = responder("200 OK").await;
        let probe = HealthProbe::Http { path: "api".into() };
        assert!(checker().probe("api", port, &probe).await.is_healthy());
        assert!(requests.recv().await.unwrap().starts_with("GET /api "));
    }

    #[tokio::test]
    async fn http_probe_rejects_server_errors() {
        let (port, _requests) = responder("503 Service Unavailable").await;
        let result = checker().probe("api", port, &root()).await;
        assert!(matches!(
            result,
            HealthResult::Unhealthy(SupervisorError::HealthCheckStatus { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn json_rpc_probe_posts_eth_accounts() {
        let (port, mut requests) = responder("200 OK").await;
        let result = checker().probe("node", port, &HealthProbe::JsonRpc).await;
        assert!(matches!(result, HealthResult::Healthy { status: 200 }));

        let request = requests.recv().await.unwrap();
        assert!(request.starts_with("POST / "));
        assert!(request.contains(r#""method":"eth_accounts""#));
        assert!(request.contains(r#""jsonrpc":"2.0""#));
    }

    #[tokio::test]
    async fn json_rpc_probe_requires_exactly_200() {
        let (port, _requests) = responder("404 Not Found").await;
        let result = checker().probe("node", port, &HealthProbe::JsonRpc).await;
        assert!(!result.is_healthy());
    }

    #[tokio::test]
    async fn refused_connection_is_unhealthy_not_an_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = checker().probe("node", port, &HealthProbe::JsonRpc).await;
        assert!(matches!(
            result,
            HealthResult::Unhealthy(SupervisorError::HealthCheckRefused { .. })
        ));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let checker = HealthChecker::new(Duration::from_millis(200)).unwrap();
        let result = checker.probe("web", port, &root()).await;
        assert!(matches!(
            result,
            HealthResult::Unhealthy(SupervisorError::HealthCheckTimeout { .. })
        ));
    }
}
