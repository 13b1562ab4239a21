//! Management channel.
//!
//! Newline-delimited JSON over a Unix socket: certificate creation
//! requests, status GETs, and admin state PUTs. The socket file's
//! permissions gate who may connect; the requester name sent with a state
//! PUT is the transport-authenticated identity (the PVA engine supplies the
//! peer certificate CN there; the local socket supplies the calling user)
//! and is checked against the ACF administrator list before any transition.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::error::{CmsError, CmsResult};
use crate::issuance::{CertCreationRequest, IssuancePipeline, IssuanceResponse};
use crate::status::StatusValue;
use crate::status_publisher::{AdminAction, StatusPublisher};

/// Requests accepted on the management socket.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    GetStatus {
        cert_id: String,
    },
    SetState {
        cert_id: String,
        state: String,
        requester: String,
    },
    CreateCertificate {
        ccr: CertCreationRequest,
    },
}

/// Responses sent back to clients.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    Status { value: StatusValue },
    Created { response: IssuanceResponse },
    Error { kind: String, message: String },
}

impl Response {
    fn from_error(e: &CmsError) -> Self {
        Response::Error {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

/// Split `<issuer>:<serial>` into its parts. The serial is decimal, as
/// printed by the issuance response and the operator tool.
pub fn parse_cert_id(cert_id: &str) -> CmsResult<(String, u64)> {
    let (issuer, serial) = cert_id
        .split_once(':')
        .ok_or_else(|| CmsError::Config(format!("bad certificate id {cert_id:?}")))?;
    let serial = serial
        .parse()
        .map_err(|_| CmsError::Config(format!("bad serial in certificate id {cert_id:?}")))?;
    Ok((issuer.to_string(), serial))
}

pub struct AdminChannel {
    publisher: Arc<StatusPublisher>,
    pipeline: Arc<IssuancePipeline>,
    socket_path: PathBuf,
}

impl AdminChannel {
    pub fn new(
        publisher: Arc<StatusPublisher>,
        pipeline: Arc<IssuancePipeline>,
        socket_path: PathBuf,
    ) -> Self {
        AdminChannel {
            publisher,
            pipeline,
            socket_path,
        }
    }

    /// Bind the socket and serve until the task is dropped.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).context(format!(
                "Failed to remove existing socket at {}",
                self.socket_path.display()
            ))?;
        }
        let listener = UnixListener::bind(&self.socket_path).context(format!(
            "Failed to bind Unix socket at {}",
            self.socket_path.display()
        ))?;
        info!(socket = %self.socket_path.display(), "management channel listening");

        loop {
            let (stream, _addr) = listener.accept().await?;
            let channel = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = channel.handle_client(stream).await {
                    warn!(error = %e, "management client failed");
                }
            });
        }
    }

    async fn handle_client(&self, stream: UnixStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<Request>(&line) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => Response::Error {
                    kind: "Config".to_string(),
                    message: format!("malformed request: {e}"),
                },
            };
            let mut payload = serde_json::to_string(&response)?;
            payload.push('\n');
            write_half.write_all(payload.as_bytes()).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> Response {
        // Store and signing work is synchronous; hand it to the blocking
        // pool so the accept loop keeps breathing.
        let publisher = Arc::clone(&self.publisher);
        let pipeline = Arc::clone(&self.pipeline);
        let result = tokio::task::spawn_blocking(move || match request {
            Request::GetStatus { cert_id } => {
                let (_, serial) = parse_cert_id(&cert_id)?;
                publisher.get_status_value(serial).map(|value| Response::Status { value })
            }
            Request::SetState {
                cert_id,
                state,
                requester,
            } => {
                let (_, serial) = parse_cert_id(&cert_id)?;
                let action = AdminAction::parse(&state)?;
                publisher
                    .put_state(serial, action, &requester)
                    .map(|value| Response::Status { value })
            }
            Request::CreateCertificate { ccr } => pipeline
                .process(&ccr)
                .map(|response| Response::Created { response }),
        })
        .await;

        match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => Response::from_error(&e),
            Err(join_err) => Response::Error {
                kind: "CmsUnavailable".to_string(),
                message: format!("request handler failed: {join_err}"),
            },
        }
    }
}

/// Blocking client used by the operator tool: one request, one response.
pub fn request_over_socket(
    socket_path: &Path,
    request: &Request,
    timeout: Duration,
) -> CmsResult<Response> {
    use std::io::{BufRead, BufReader as StdBufReader, Write};
    use std::os::unix::net::UnixStream as StdUnixStream;

    let stream = StdUnixStream::connect(socket_path).map_err(|e| {
        CmsError::CmsUnavailable(format!(
            "cannot reach management service at {}: {e}",
            socket_path.display()
        ))
    })?;
    stream
        .set_read_timeout(Some(timeout))
        .and_then(|()| stream.set_write_timeout(Some(timeout)))
        .map_err(|e| CmsError::CmsUnavailable(format!("cannot configure socket: {e}")))?;

    let mut payload = serde_json::to_string(request)
        .map_err(|e| CmsError::Config(format!("cannot encode request: {e}")))?;
    payload.push('\n');
    let mut writer = stream
        .try_clone()
        .map_err(|e| CmsError::CmsUnavailable(format!("socket clone failed: {e}")))?;
    writer
        .write_all(payload.as_bytes())
        .map_err(|e| CmsError::CmsUnavailable(format!("cannot send request: {e}")))?;

    let mut line = String::new();
    StdBufReader::new(stream)
        .read_line(&mut line)
        .map_err(|e| CmsError::CmsUnavailable(format!("no response from service: {e}")))?;
    serde_json::from_str(&line)
        .map_err(|e| CmsError::CryptoParse(format!("malformed response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthRegistry;
    use crate::bus::{InProcessBus, StatusBus};
    use crate::cert_factory::{usage, CaMaterial, CertFactory};
    use crate::crypto::KeyPair;
    use crate::issuance::ApprovalPolicy;
    use crate::status::{issuer_id, CertStatus};
    use crate::status_factory::CertStatusFactory;
    use crate::store::CertStore;
    use crate::tls::StapleCache;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn start_channel(dir: &tempfile::TempDir) -> (Arc<AdminChannel>, PathBuf) {
        let store = Arc::new(CertStore::open(&dir.path().join("certs.db")).unwrap());
        let bus = Arc::new(InProcessBus::new());

        let kp = KeyPair::generate_with_bits(2048).unwrap();
        let now = Utc::now().timestamp();
        let signed = CertFactory::new(1, kp.public_key().unwrap())
            .common_name("Channel Test CA")
            .validity(now - 60, now + 86_400 * 365)
            .usage(usage::CA)
            .self_signed(kp.pkey.clone())
            .build()
            .unwrap();
        let ca = CaMaterial {
            cert: signed.cert,
            key: kp.pkey,
            chain: Vec::new(),
        };
        let issuer = issuer_id(&ca.cert).unwrap();

        let publisher = Arc::new(StatusPublisher::new(
            Arc::clone(&store),
            CertStatusFactory::new(ca.clone(), 30),
            bus as Arc<dyn StatusBus>,
            ca.clone(),
            issuer,
            vec!["admin".to_string()],
            true,
            Arc::new(StapleCache::new()),
        ));
        let pipeline = Arc::new(IssuancePipeline::new(
            store,
            Arc::clone(&publisher),
            ca,
            AuthRegistry::with_defaults(None),
            ApprovalPolicy::default(),
        ));

        let socket = dir.path().join("pvacms.sock");
        let channel = Arc::new(AdminChannel::new(publisher, pipeline, socket.clone()));
        (channel, socket)
    }

    fn ccr(name: &str) -> CertCreationRequest {
        let kp = KeyPair::generate_with_bits(2048).unwrap();
        let now = Utc::now().timestamp();
        CertCreationRequest {
            name: name.to_string(),
            country: "US".to_string(),
            organization: "test.org".to_string(),
            organization_unit: String::new(),
            auth_type: "std".to_string(),
            usage: usage::CLIENT,
            not_before: now - 60,
            not_after: now + 86_400,
            pub_key: kp.public_key_pem().unwrap(),
            verifier: BTreeMap::new(),
        }
    }

    #[test]
    fn test_parse_cert_id() {
        let (issuer, serial) = parse_cert_id("27975e6b:7246297371190731775").unwrap();
        assert_eq!(issuer, "27975e6b");
        assert_eq!(serial, 7246297371190731775);
        assert!(parse_cert_id("no-colon").is_err());
        assert!(parse_cert_id("ab:not-a-number").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_response_cycle() {
        let dir = tempdir().unwrap();
        let (channel, socket) = start_channel(&dir);
        let server = tokio::spawn(channel.serve());

        // Wait for the socket to appear
        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let socket_for_client = socket.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let timeout = Duration::from_secs(5);

            // Create a certificate request (basic method, so it parks)
            let created = request_over_socket(
                &socket_for_client,
                &Request::CreateCertificate { ccr: ccr("cli9") },
                timeout,
            )
            .unwrap();
            let (serial, pv) = match created {
                Response::Created { response } => {
                    assert_eq!(response.status, CertStatus::PendingApproval);
                    assert!(response.cert_pem.is_none());
                    (response.serial, response.status_pv_uri)
                }
                other => panic!("unexpected response {other:?}"),
            };
            let (issuer, _) = crate::status::parse_status_pv_name(&pv).unwrap();
            let cert_id = format!("{issuer}:{serial}");

            // GET sees the pending status
            let got = request_over_socket(
                &socket_for_client,
                &Request::GetStatus {
                    cert_id: cert_id.clone(),
                },
                timeout,
            )
            .unwrap();
            match got {
                Response::Status { value } => {
                    assert_eq!(value.status, CertStatus::PendingApproval)
                }
                other => panic!("unexpected response {other:?}"),
            }

            // Non-admin PUT is refused
            let refused = request_over_socket(
                &socket_for_client,
                &Request::SetState {
                    cert_id: cert_id.clone(),
                    state: "APPROVED".to_string(),
                    requester: "mallory".to_string(),
                },
                timeout,
            )
            .unwrap();
            match refused {
                Response::Error { kind, .. } => assert_eq!(kind, "AuthReject"),
                other => panic!("unexpected response {other:?}"),
            }

            // Admin approval transitions and returns the signed PEM
            let approved = request_over_socket(
                &socket_for_client,
                &Request::SetState {
                    cert_id,
                    state: "APPROVED".to_string(),
                    requester: "admin".to_string(),
                },
                timeout,
            )
            .unwrap();
            match approved {
                Response::Status { value } => {
                    assert_eq!(value.status, CertStatus::Valid);
                    assert!(value.cert_pem.is_some());
                }
                other => panic!("unexpected response {other:?}"),
            }
        })
        .await;
        server.abort();
        outcome.unwrap();
    }
}
