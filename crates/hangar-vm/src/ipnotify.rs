//! Guest IP announcement arbiter.
//!
//! The hypervisor does not expose guest-assigned addresses, so each guest
//! announces itself with `POST /notify-ip {runner_id, ip_address}` where
//! `runner_id` is the guest's own hardware UUID, not the runner id the
//! agent knows. The arbiter pairs announcements with waiting `start()`
//! calls:
//!
//! ```text
//!  announcement (uuid, ip)
//!    ├── uuid mapped to runner R and R is waiting  →  deliver to R
//!    └── otherwise                                 →  deliver to oldest waiter,
//!                                                     remember uuid → that runner
//! ```
//!
//! A waiter leaves the queue when it is served, when it times out, when
//! its future is dropped, or when its runner is cancelled. Cancelling also
//! forgets every guest UUID mapped to that runner, so the next boot's
//! announcement cannot be routed to a runner that no longer exists.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::{Json, Router};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{Instrument, Span, debug, error, info, warn};

pub type ArbiterResult<T> = Result<T, ArbiterError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArbiterError {
    #[error("timeout waiting for IP notification for runner {runner_id} after {timeout:?}")]
    Timeout { runner_id: String, timeout: Duration },

    #[error("no pending requests")]
    NoPendingRequests,

    #[error("could not deliver IP to runner {0}")]
    DeliveryFailed(String),
}

/// Body of `POST /notify-ip`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAnnouncement {
    /// Guest hardware UUID.
    #[serde(default)]
    pub runner_id: String,
    #[serde(default)]
    pub ip_address: String,
}

struct Pending {
    token: u64,
    runner_id: String,
    tx: oneshot::Sender<String>,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<Pending>,
    guest_to_runner: HashMap<String, String>,
    next_token: u64,
}

impl Inner {
    fn take_for_runner(&mut self, runner_id: &str) -> Option<Pending> {
        let pos = self.queue.iter().position(|p| p.runner_id == runner_id)?;
        self.queue.remove(pos)
    }
}

/// Shared FIFO of runners waiting for their guest to announce an IP.
#[derive(Clone, Default)]
pub struct IpArbiter {
    inner: Arc<Mutex<Inner>>,
}

/// Removes a waiter's queue entry however the wait ends.
struct PendingGuard<'a> {
    arbiter: &'a IpArbiter,
    token: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.arbiter.inner.lock().expect("arbiter lock");
        inner.queue.retain(|p| p.token != self.token);
    }
}

impl IpArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until a guest announcement is matched to `runner_id`.
    pub async fn wait_for_ip(&self, runner_id: &str, timeout: Duration) -> ArbiterResult<String> {
        let (tx, rx) = oneshot::channel();
        let token = {
            let mut inner = self.inner.lock().expect("arbiter lock");
            let token = inner.next_token;
            inner.next_token += 1;
            inner.queue.push_back(Pending {
                token,
                runner_id: runner_id.to_string(),
                tx,
            });
            token
        };
        let _guard = PendingGuard {
            arbiter: self,
            token,
        };
        debug!(%runner_id, "waiting for guest IP announcement");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ip)) => Ok(ip),
            Ok(Err(_)) => Err(ArbiterError::DeliveryFailed(runner_id.to_string())),
            Err(_) => Err(ArbiterError::Timeout {
                runner_id: runner_id.to_string(),
                timeout,
            }),
        }
    }

    /// Route an announcement from guest `guest_id`. Returns the runner id
    /// it was delivered to.
    pub fn notify(&self, guest_id: &str, ip_address: &str) -> ArbiterResult<String> {
        let mut inner = self.inner.lock().expect("arbiter lock");

        let mapped = inner
            .guest_to_runner
            .get(guest_id)
            .cloned()
            .and_then(|runner_id| inner.take_for_runner(&runner_id));

        let pending = match mapped {
            Some(p) => {
                debug!(%guest_id, runner_id = %p.runner_id, "guest already mapped");
                p
            }
            None => inner.queue.pop_front().ok_or(ArbiterError::NoPendingRequests)?,
        };

        let runner_id = pending.runner_id;
        inner
            .guest_to_runner
            .insert(guest_id.to_string(), runner_id.clone());
        pending
            .tx
            .send(ip_address.to_string())
            .map_err(|_| ArbiterError::DeliveryFailed(runner_id.clone()))?;

        info!(%guest_id, %runner_id, %ip_address, "guest IP delivered");
        Ok(runner_id)
    }

    /// Drop every waiter and guest mapping for `runner_id`. A waiter still
    /// blocked in [`Self::wait_for_ip`] fails with `DeliveryFailed`.
    /// Returns the number of waiters removed.
    pub fn cancel(&self, runner_id: &str) -> usize {
        let mut inner = self.inner.lock().expect("arbiter lock");
        let before = inner.queue.len();
        inner.queue.retain(|p| p.runner_id != runner_id);
        inner.guest_to_runner.retain(|_, rid| rid != runner_id);
        let removed = before - inner.queue.len();
        if removed > 0 {
            debug!(%runner_id, removed, "pending IP wait cancelled");
        }
        removed
    }

    /// Number of runners currently waiting.
    pub fn pending(&self) -> usize {
        self.inner.lock().expect("arbiter lock").queue.len()
    }

    /// Runner a guest UUID was last matched to.
    pub fn runner_for_guest(&self, guest_id: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("arbiter lock")
            .guest_to_runner
            .get(guest_id)
            .cloned()
    }
}

// ── HTTP endpoint ──────────────────────────────────────────────────

/// Router exposing `POST /notify-ip`.
pub fn build_router(arbiter: IpArbiter) -> Router {
    Router::new()
        .route("/notify-ip", post(notify_ip))
        .with_state(arbiter)
}

/// POST /notify-ip
async fn notify_ip(State(arbiter): State<IpArbiter>, body: Bytes) -> impl IntoResponse {
    let announcement: IpAnnouncement = match serde_json::from_slice(&body) {
        Ok(a) => a,
        Err(e) => {
            warn!(error = %e, "invalid IP notification body");
            return (StatusCode::BAD_REQUEST, "Invalid request body").into_response();
        }
    };
    if announcement.runner_id.is_empty() || announcement.ip_address.is_empty() {
        warn!("IP notification missing runner_id or ip_address");
        return (StatusCode::BAD_REQUEST, "Missing runner_id or ip_address").into_response();
    }

    info!(guest_id = %announcement.runner_id, ip_address = %announcement.ip_address, "IP notification received");
    match arbiter.notify(&announcement.runner_id, &announcement.ip_address) {
        Ok(_) => (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response(),
        Err(ArbiterError::NoPendingRequests) => {
            warn!(guest_id = %announcement.runner_id, "no pending requests");
            (StatusCode::NOT_FOUND, "No pending requests").into_response()
        }
        Err(e) => {
            error!(error = %e, "IP delivery failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

/// Serve the announcement endpoint on an already-bound listener until
/// `shutdown` flips to `true`.
pub async fn serve(
    arbiter: IpArbiter,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    span: Span,
) -> std::io::Result<()> {
    let local = listener.local_addr()?;
    async move {
        info!(addr = %local, "IP notification server listening");
        axum::serve(listener, build_router(arbiter))
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn wait_until_pending(arbiter: &IpArbiter, n: usize) {
        for _ in 0..100 {
            if arbiter.pending() == n {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected {n} pending waiters, have {}", arbiter.pending());
    }

    fn spawn_wait(arbiter: &IpArbiter, runner_id: &str) -> tokio::task::JoinHandle<ArbiterResult<String>> {
        let arbiter = arbiter.clone();
        let runner_id = runner_id.to_string();
        tokio::spawn(async move { arbiter.wait_for_ip(&runner_id, Duration::from_secs(30)).await })
    }

    #[tokio::test]
    async fn unmapped_guest_goes_to_oldest_waiter() {
        let arbiter = IpArbiter::new();
        let r1 = spawn_wait(&arbiter, "r1");
        wait_until_pending(&arbiter, 1).await;
        let r2 = spawn_wait(&arbiter, "r2");
        wait_until_pending(&arbiter, 2).await;

        assert_eq!(arbiter.notify("guest-a", "10.0.0.1").unwrap(), "r1");
        assert_eq!(r1.await.unwrap().unwrap(), "10.0.0.1");
        assert_eq!(arbiter.runner_for_guest("guest-a").as_deref(), Some("r1"));
        assert_eq!(arbiter.pending(), 1);

        assert_eq!(arbiter.notify("guest-b", "10.0.0.2").unwrap(), "r2");
        assert_eq!(r2.await.unwrap().unwrap(), "10.0.0.2");
    }

    #[tokio::test]
    async fn mapped_guest_skips_fifo_order() {
        let arbiter = IpArbiter::new();
        let first = spawn_wait(&arbiter, "r1");
        wait_until_pending(&arbiter, 1).await;
        arbiter.notify("guest-a", "10.0.0.1").unwrap();
        first.await.unwrap().unwrap();

        // r2 queues first, then r1 waits again (e.g. after a network reset).
        let r2 = spawn_wait(&arbiter, "r2");
        wait_until_pending(&arbiter, 1).await;
        let r1_again = spawn_wait(&arbiter, "r1");
        wait_until_pending(&arbiter, 2).await;

        assert_eq!(arbiter.notify("guest-a", "10.0.0.9").unwrap(), "r1");
        assert_eq!(r1_again.await.unwrap().unwrap(), "10.0.0.9");
        assert_eq!(arbiter.pending(), 1);
        r2.abort();
    }

    #[tokio::test]
    async fn no_waiters_is_an_error() {
        let arbiter = IpArbiter::new();
        assert_eq!(
            arbiter.notify("guest-a", "10.0.0.1").unwrap_err(),
            ArbiterError::NoPendingRequests
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_waiter_leaves_queue() {
        let arbiter = IpArbiter::new();
        let err = arbiter
            .wait_for_ip("r1", Duration::from_secs(120))
            .await
            .unwrap_err();
        assert!(matches!(err, ArbiterError::Timeout { ref runner_id, .. } if runner_id == "r1"));
        assert_eq!(arbiter.pending(), 0);
    }

    #[tokio::test]
    async fn dropped_waiter_leaves_queue() {
        let arbiter = IpArbiter::new();
        let handle = spawn_wait(&arbiter, "r1");
        wait_until_pending(&arbiter, 1).await;
        handle.abort();
        let _ = handle.await;
        assert_eq!(arbiter.pending(), 0);
    }

    #[tokio::test]
    async fn cancel_frees_queue_for_next_runner() {
        let arbiter = IpArbiter::new();
        let stale = spawn_wait(&arbiter, "r1");
        wait_until_pending(&arbiter, 1).await;

        assert_eq!(arbiter.cancel("r1"), 1);
        assert_eq!(
            stale.await.unwrap().unwrap_err(),
            ArbiterError::DeliveryFailed("r1".into())
        );

        let fresh = spawn_wait(&arbiter, "r2");
        wait_until_pending(&arbiter, 1).await;
        assert_eq!(arbiter.notify("guest-b", "10.0.0.2").unwrap(), "r2");
        assert_eq!(fresh.await.unwrap().unwrap(), "10.0.0.2");
    }

    #[tokio::test]
    async fn cancel_forgets_guest_mapping() {
        let arbiter = IpArbiter::new();
        let first = spawn_wait(&arbiter, "r1");
        wait_until_pending(&arbiter, 1).await;
        arbiter.notify("guest-a", "10.0.0.1").unwrap();
        first.await.unwrap().unwrap();

        assert_eq!(arbiter.cancel("r1"), 0);
        assert_eq!(arbiter.runner_for_guest("guest-a"), None);
    }

    #[tokio::test]
    async fn serve_uses_the_bound_listener() {
        let arbiter = IpArbiter::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(arbiter.clone(), listener, shutdown_rx, Span::none()));

        let waiter = spawn_wait(&arbiter, "r1");
        wait_until_pending(&arbiter, 1).await;

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (mut sender, conn) =
            hyper::client::conn::http1::handshake(hyper_util::rt::TokioIo::new(stream))
                .await
                .unwrap();
        tokio::spawn(conn);
        let req = Request::builder()
            .method("POST")
            .uri("/notify-ip")
            .header("host", addr.to_string())
            .header("content-type", "application/json")
            .body(http_body_util::Full::new(Bytes::from(
                r#"{"runner_id":"g1","ip_address":"10.0.0.7"}"#,
            )))
            .unwrap();
        let resp = sender.send_request(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(waiter.await.unwrap().unwrap(), "10.0.0.7");

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }

    async fn post(router: Router, method: &str, body: &str) -> StatusCode {
        let req = Request::builder()
            .method(method)
            .uri("/notify-ip")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        router.oneshot(req).await.unwrap().status()
    }

    #[tokio::test]
    async fn http_status_codes() {
        let arbiter = IpArbiter::new();
        let router = build_router(arbiter.clone());

        assert_eq!(post(router.clone(), "GET", "").await, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(post(router.clone(), "POST", "not json").await, StatusCode::BAD_REQUEST);
        assert_eq!(
            post(router.clone(), "POST", r#"{"runner_id":"g1"}"#).await,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            post(router.clone(), "POST", r#"{"runner_id":"g1","ip_address":"10.0.0.1"}"#).await,
            StatusCode::NOT_FOUND
        );

        let waiter = spawn_wait(&arbiter, "r1");
        wait_until_pending(&arbiter, 1).await;
        assert_eq!(
            post(router, "POST", r#"{"runner_id":"g1","ip_address":"10.0.0.1"}"#).await,
            StatusCode::OK
        );
        assert_eq!(waiter.await.unwrap().unwrap(), "10.0.0.1");
    }
}
