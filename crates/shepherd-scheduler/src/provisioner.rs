//! Provisioning collaborator: recreates an application on a chosen instance.
//!
//! The container pipeline itself lives on the worker instances. The
//! rescheduler only asks an instance to recreate an application from its
//! stored configuration and waits for the verdict.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde::Serialize;
use shepherd_state::{ApplicationRecord, BoxFuture};
use tracing::debug;

use crate::error::ProvisionError;

/// Everything an instance needs to recreate one application.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecreateRequest {
    pub name: String,
    pub language: String,
    pub owner: String,
    /// Instance address (`host:port`) that should run the application.
    pub destination: String,
    pub config: serde_json::Value,
}

impl RecreateRequest {
    pub fn for_record(record: &ApplicationRecord, destination: &str) -> Self {
        Self {
            name: record.name.clone(),
            language: record.language.clone(),
            owner: record.owner.clone(),
            destination: destination.to_string(),
            config: record.config.clone(),
        }
    }
}

/// Recreates applications on worker instances.
pub trait Provisioner: Send + Sync {
    fn recreate<'a>(&'a self, request: &'a RecreateRequest) -> BoxFuture<'a, Result<(), ProvisionError>>;
}

/// Posts recreate requests to the destination instance over HTTP/1.
///
/// `POST http://{destination}/api/v1/applications/{language}` with the
/// request as JSON; any 2xx is success.
#[derive(Debug, Clone)]
pub struct HttpProvisioner {
    connect_timeout: Duration,
}

impl HttpProvisioner {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn post(&self, request: &RecreateRequest) -> Result<(), ProvisionError> {
        let destination = request.destination.as_str();
        let uri = format!("http://{destination}/api/v1/applications/{}", request.language);

        let stream = match tokio::time::timeout(
            self.connect_timeout,
            tokio::net::TcpStream::connect(destination),
        )
        .await
        {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return Err(ProvisionError::Connect {
                    destination: destination.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ProvisionError::Connect {
                    destination: destination.to_string(),
                    reason: format!("no connection within {:?}", self.connect_timeout),
                });
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ProvisionError::Request(format!("handshake: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let body = serde_json::to_vec(request)
            .map_err(|e| ProvisionError::Request(format!("serialize: {e}")))?;

        let req = http::Request::builder()
            .method("POST")
            .uri(&uri)
            .header("host", destination)
            .header("content-type", "application/json")
            .header("user-agent", "shepherd/0.1")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| ProvisionError::Request(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ProvisionError::Request(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            debug!(%uri, app = %request.name, "recreate accepted");
            return Ok(());
        }

        let body = match resp.into_body().collect().await {
            Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
            Err(e) => format!("<unreadable body: {e}>"),
        };
        Err(ProvisionError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

impl Provisioner for HttpProvisioner {
    fn recreate<'a>(&'a self, request: &'a RecreateRequest) -> BoxFuture<'a, Result<(), ProvisionError>> {
        Box::pin(self.post(request))
    }
}
