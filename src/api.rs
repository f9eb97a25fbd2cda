//! Request dispatch
//!
//! Transport-agnostic handling of the publish API. A front end fills in an
//! [`ApiRequest`] from whatever server it runs in and writes the returned
//! [`ApiResponse`] back. Paths:
//!
//! | Path | Auth | Reply |
//! |---|---|---|
//! | `/config` | none | `repos:<names>` |
//! | `/ping` | none | `OK` |
//! | `/exists?cid=X` | identity | `PRESENT:<path>` or `MISSING` |
//! | `/update?cid=X` | identity | as `/exists`, refreshing the timestamp if present |
//! | `/publish?cid=X` | identity, body, a local repository | `PRESENT:<path>` or `OK` |
//! | `/startup` | loopback | `OK` |
//! | `/shutdown` | loopback | `OK` once the queue has drained |

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use userpub_protocol::{Cid, ConfigSnapshot, RejectKind, Rejection, Reply};
use userpub_worker::{layout, QueueError};

use crate::context::{ServiceContext, ServiceState};
use crate::identity::Credentials;
use crate::staging::{StageError, StageOutcome};

/// One API call, as seen by the dispatcher.
pub struct ApiRequest {
    /// Path below the API mount point, e.g. `/publish`.
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: String,
    pub remote_addr: IpAddr,
    pub authorization: Option<String>,
    pub client_dn: Option<String>,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl ApiRequest {
    /// A bodyless request.
    pub fn new(path: impl Into<String>, query: impl Into<String>, remote_addr: IpAddr) -> Self {
        Self {
            path: path.into(),
            query: query.into(),
            remote_addr,
            authorization: None,
            client_dn: None,
            content_length: None,
            body: Box::new(io::empty()),
        }
    }

    fn credentials(&self) -> Credentials {
        Credentials {
            remote_addr: self.remote_addr,
            authorization: self.authorization.clone(),
            client_dn: self.client_dn.clone(),
        }
    }
}

impl fmt::Debug for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiRequest")
            .field("path", &self.path)
            .field("query", &self.query)
            .field("remote_addr", &self.remote_addr)
            .field("client_dn", &self.client_dn)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Response status and plain-text body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub reason: &'static str,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    /// Headers every response carries.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("Cache-control", "max-age=0".to_string()),
            ("Content-Length", self.body.len().to_string()),
        ];
        if self.is_success() {
            headers.push(("Content-Type", "text/plain".to_string()));
        }
        headers
    }
}

impl From<Reply> for ApiResponse {
    fn from(reply: Reply) -> Self {
        Self {
            status: 200,
            reason: "OK",
            body: reply.body(),
        }
    }
}

impl From<Rejection> for ApiResponse {
    fn from(rejection: Rejection) -> Self {
        Self {
            status: rejection.kind.status(),
            reason: rejection.kind.reason_phrase(),
            body: rejection.body(),
        }
    }
}

/// Parse a query string. The whole string is percent-decoded first, then
/// split into `key=value` pairs; the first occurrence of a key wins and
/// empty values are dropped.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let decoded = urlencoding::decode(query)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| query.to_string());

    let mut params = HashMap::new();
    for pair in decoded.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        if key.is_empty() || value.is_empty() {
            continue;
        }
        params.entry(key.to_string()).or_insert_with(|| value.to_string());
    }
    params
}

/// Routes requests to the service.
#[derive(Clone)]
pub struct Dispatcher {
    context: Arc<ServiceContext>,
}

impl Dispatcher {
    pub fn new(context: Arc<ServiceContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.context
    }

    pub fn handle(&self, request: ApiRequest) -> ApiResponse {
        self.handle_at(request, SystemTime::now())
    }

    /// Handle a request as of `now` (config cache and token expiry).
    pub fn handle_at(&self, mut request: ApiRequest, now: SystemTime) -> ApiResponse {
        let ip = request.remote_addr;
        let config = self.context.config_at(now);
        let snapshot = Arc::clone(&config.snapshot);

        let loopback = ip.is_loopback();
        let startup = loopback && request.path == "/startup";
        if loopback && request.path == "/shutdown" {
            self.context.shutdown();
            return Reply::Ok.into();
        }
        if startup {
            self.context.startup(&snapshot);
        }

        if self.context.state() != ServiceState::Running {
            return reject(ip, "-", Rejection::bad_request("Service not running"));
        }
        if startup {
            return Reply::Ok.into();
        }

        match request.path.as_str() {
            "/config" => {
                info!(%ip, "returning config");
                return Reply::Repos(snapshot.repo_names()).into();
            }
            "/ping" => {
                if snapshot.host_repos.is_empty() {
                    return reject(ip, "-", Rejection::bad_request("not configured"));
                }
                return Reply::Ok.into();
            }
            _ => {}
        }

        let principal = match self
            .context
            .resolver()
            .resolve(&request.credentials(), &config, DateTime::<Utc>::from(now))
        {
            Ok(principal) => principal,
            Err(e) => return reject(ip, "-", Rejection::access_denied(e.to_string())),
        };
        let principal = principal.as_str();

        let params = parse_query(&request.query);
        let cid = match params.get("cid").map(|raw| Cid::parse(raw)).transpose() {
            Ok(cid) => cid,
            Err(e) => return reject(ip, principal, Rejection::bad_request(e)),
        };

        let path = request.path.clone();
        let verb = path.strip_prefix('/').unwrap_or_default();
        if !matches!(verb, "exists" | "update" | "publish") {
            return reject(ip, principal, Rejection::not_found("Unrecognized api"));
        }
        let Some(cid) = cid else {
            return reject(ip, principal, Rejection::bad_request(format!("{} with no cid", verb)));
        };

        let result = match verb {
            "exists" => Ok(self.exists(ip, principal, &snapshot, &cid)),
            "update" => self.update(ip, principal, &snapshot, &cid),
            _ => self.publish(ip, principal, &snapshot, &cid, &mut request),
        };
        match result {
            Ok(reply) => reply.into(),
            Err(rejection) => reject(ip, principal, rejection),
        }
    }

    fn exists(&self, ip: IpAddr, principal: &str, snapshot: &ConfigSnapshot, cid: &Cid) -> Reply {
        match layout::locate_cid(snapshot, cid) {
            Some(host_repo) => {
                info!(%ip, principal, repo = %host_repo.repo, cid = %cid, "present");
                Reply::Present(snapshot.artifact_path(&host_repo.repo, cid).display().to_string())
            }
            None => {
                info!(%ip, principal, cid = %cid, "missing");
                Reply::Missing
            }
        }
    }

    fn update(
        &self,
        ip: IpAddr,
        principal: &str,
        snapshot: &Arc<ConfigSnapshot>,
        cid: &Cid,
    ) -> Result<Reply, Rejection> {
        let reply = self.exists(ip, principal, snapshot, cid);
        if matches!(reply, Reply::Present(_)) {
            self.context
                .request_timestamp_refresh(snapshot, cid, principal)
                .map_err(queue_rejection)?;
        } else {
            info!(%ip, principal, cid = %cid, "skipping update");
        }
        Ok(reply)
    }

    fn publish(
        &self,
        ip: IpAddr,
        principal: &str,
        snapshot: &Arc<ConfigSnapshot>,
        cid: &Cid,
        request: &mut ApiRequest,
    ) -> Result<Reply, Rejection> {
        // Nothing here would ever drain the queued item.
        if !self.context.serves_locally(snapshot) {
            return Err(Rejection::unavailable("not configured for this host"));
        }

        let length = request.content_length.unwrap_or(0);
        let outcome = self
            .context
            .staging()
            .stage(&snapshot.queue_dir, cid, &mut request.body, length)
            .map_err(|e| {
                warn!(%ip, principal, cid = %cid, "{}", e);
                match e {
                    StageError::Drain(_) => Rejection::bad_request("error reading publish data"),
                    _ => Rejection::bad_request("error getting publish data"),
                }
            })?;

        match outcome {
            StageOutcome::AlreadyInProgress => Ok(Reply::Ok),
            StageOutcome::Staged(_) => self
                .context
                .queue_or_stamp(snapshot, cid, principal)
                .map_err(queue_rejection),
        }
    }
}

fn queue_rejection(e: QueueError) -> Rejection {
    Rejection::unavailable(e.to_string())
}

fn reject(ip: IpAddr, principal: &str, rejection: Rejection) -> ApiResponse {
    match rejection.kind {
        RejectKind::AccessDenied => warn!(%ip, principal, code = rejection.kind.status(), "{}", rejection.message),
        _ => info!(%ip, principal, code = rejection.kind.status(), "{}", rejection.message),
    }
    rejection.into()
}
