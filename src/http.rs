//! HTTP API
//!
//! - `GET  /health` - Health check with row counts
//! - `POST /escrows` - Record an uploaded fingerprint and its locked amount
//! - `POST /deals` - Register a deal (duration validated here)
//! - `GET  /deals/fingerprint/{fingerprint}` - Aggregate view for a fingerprint
//! - `GET  /deals/{deal_id}` - Aggregate view for a chain deal id
//! - `GET  /deals/{deal_id}/transitions` - Status history
//! - `PUT  /attestations` - `{"deal_id_list": "1,2,3"}`, signer from `x-signer-id`
//! - `POST /release/{fingerprint}` - Evaluate release now
//! - `POST /refunds/{deal_ref}/confirm` - Report a confirmed refund

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::db::{self, NewContentInput, NewDealInput};
use crate::error::BridgeError;
use crate::services::response::{self, HttpResponse};
use crate::services::Services;

pub const SIGNER_HEADER: &str = "x-signer-id";

#[derive(Debug, Deserialize)]
struct AttestationRequest {
    deal_id_list: String,
}

/// HTTP server state
pub struct HttpServer {
    services: Services,
    pool: db::DbPool,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(services: Services, pool: db::DbPool, bind_addr: SocketAddr) -> Self {
        Self {
            services,
            pool,
            bind_addr,
        }
    }

    /// Accept connections until shutdown
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BridgeError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.changed() => break,
            };
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }

        info!("HTTP server stopped");
        Ok(())
    }

    async fn handle_request(&self, req: Request<Incoming>) -> Result<HttpResponse, hyper::Error> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let headers = req.headers().clone();
        debug!(method = %method, path = %path, "Incoming request");

        let body = req.collect().await?.to_bytes();
        Ok(self.route(&method, &path, &headers, body).await)
    }

    /// Dispatch a fully-read request
    pub async fn route(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> HttpResponse {
        let result = match (method, path) {
            (&Method::GET, "/health") => self.health(),
            (&Method::POST, "/escrows") => self.record_escrow(&body),
            (&Method::POST, "/deals") => self.create_deal(&body),
            (&Method::PUT, "/attestations") => self.ingest_attestations(headers, &body),
            (&Method::GET, p) if p.starts_with("/deals/fingerprint/") => {
                let fingerprint = p.strip_prefix("/deals/fingerprint/").unwrap_or("");
                self.services
                    .queries
                    .deal_summary_by_fingerprint(fingerprint)
                    .map(|summary| response::ok(&summary))
            }
            (&Method::GET, p) if p.starts_with("/deals/") && p.ends_with("/transitions") => {
                let raw = p
                    .strip_prefix("/deals/")
                    .and_then(|rest| rest.strip_suffix("/transitions"))
                    .unwrap_or("");
                parse_deal_id(raw).and_then(|id| {
                    self.services
                        .queries
                        .transitions_by_deal_id(id)
                        .map(|log| response::ok(&log))
                })
            }
            (&Method::GET, p) if p.starts_with("/deals/") => {
                let raw = p.strip_prefix("/deals/").unwrap_or("");
                parse_deal_id(raw).and_then(|id| {
                    self.services
                        .queries
                        .deal_summary_by_deal_id(id)
                        .map(|summary| response::ok(&summary))
                })
            }
            (&Method::POST, p) if p.starts_with("/release/") => {
                let fingerprint = p.strip_prefix("/release/").unwrap_or("");
                self.services
                    .release
                    .evaluate(fingerprint)
                    .map(|decision| response::ok(&decision))
            }
            (&Method::POST, p) if p.starts_with("/refunds/") && p.ends_with("/confirm") => {
                let deal_ref = p
                    .strip_prefix("/refunds/")
                    .and_then(|rest| rest.strip_suffix("/confirm"))
                    .unwrap_or("");
                self.services
                    .release
                    .confirm_refund(deal_ref)
                    .map(|changed| response::ok(&serde_json::json!({ "confirmed": changed })))
            }
            (_, "/health" | "/escrows" | "/deals" | "/attestations") => {
                Ok(response::method_not_allowed())
            }
            _ => Ok(response::not_found("Not Found")),
        };

        result.unwrap_or_else(|e| response::from_error(&e))
    }

    fn health(&self) -> Result<HttpResponse, BridgeError> {
        let stats = db::stats(&self.pool)?;
        Ok(response::ok(&serde_json::json!({
            "status": "ok",
            "threshold": self.services.config.threshold(),
            "deals": stats.deals,
            "open_deals": stats.open_deals,
            "escrows": stats.escrows,
            "releases": stats.releases,
        })))
    }

    fn record_escrow(&self, body: &Bytes) -> Result<HttpResponse, BridgeError> {
        let input: NewContentInput = parse_json(body)?;
        let escrow = self.services.ledger.record_upload(&input)?;
        Ok(response::created(&escrow))
    }

    fn create_deal(&self, body: &Bytes) -> Result<HttpResponse, BridgeError> {
        let input: NewDealInput = parse_json(body)?;
        let deal = self.services.registry.create_deal(&input)?;
        Ok(response::created(&deal))
    }

    fn ingest_attestations(
        &self,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<HttpResponse, BridgeError> {
        let request: AttestationRequest = parse_json(body)?;
        let signer = headers
            .get(SIGNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| self.services.config.current().attestation.default_signer)
            .ok_or_else(|| BridgeError::InvalidInput(format!("missing {} header", SIGNER_HEADER)))?;

        let result = self
            .services
            .attestations
            .record_batch(&request.deal_id_list, &signer)?;
        Ok(response::ok(&result))
    }
}

fn parse_json<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, BridgeError> {
    serde_json::from_slice(body)
        .map_err(|e| BridgeError::InvalidInput(format!("invalid body: {}", e)))
}

fn parse_deal_id(raw: &str) -> Result<i64, BridgeError> {
    raw.parse()
        .map_err(|_| BridgeError::InvalidInput(format!("invalid deal id '{}'", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainDealInfo, ChainObserver};
    use crate::config::{Config, ConfigHandle};
    use crate::db::{open_in_memory, DealMerge, DealStatus, LockPaymentStatus};
    use hyper::header::HeaderValue;
    use hyper::StatusCode;

    struct NoChain;

    #[async_trait::async_trait]
    impl ChainObserver for NoChain {
        async fn get_deal_info(&self, _deal_cid: &str) -> Result<ChainDealInfo, BridgeError> {
            Err(BridgeError::Upstream("offline".into()))
        }
    }

    fn server() -> HttpServer {
        let pool = open_in_memory().unwrap();
        let config = ConfigHandle::new(Config::default());
        let services = Services::new(pool.clone(), Arc::new(NoChain), config);
        HttpServer::new(services, pool, "127.0.0.1:0".parse().unwrap())
    }

    async fn body_json(response: HttpResponse) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let server = server();
        let response = server
            .route(&Method::GET, "/health", &HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_deal_duration_rejected_with_400() {
        let server = server();
        let body = Bytes::from(
            r#"{"fingerprint":"cidA","deal_cid":"bafy1","provider_id":"f0100","committed_duration_epochs":518399}"#,
        );
        let response = server.route(&Method::POST, "/deals", &HeaderMap::new(), body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_attestations_require_signer() {
        let server = server();
        let body = Bytes::from(r#"{"deal_id_list":"1,2"}"#);

        let response = server
            .route(&Method::PUT, "/attestations", &HeaderMap::new(), body.clone())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let mut headers = HeaderMap::new();
        headers.insert(SIGNER_HEADER, HeaderValue::from_static("alice"));
        let response = server.route(&Method::PUT, "/attestations", &headers, body).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["recorded"], serde_json::json!([1, 2]));
    }

    #[tokio::test]
    async fn test_summary_routes() {
        let server = server();
        let escrow = Bytes::from(r#"{"fingerprint":"cidA","size_bytes":10,"locked_amount":"10"}"#);
        let response = server
            .route(&Method::POST, "/escrows", &HeaderMap::new(), escrow.clone())
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let response = server.route(&Method::POST, "/escrows", &HeaderMap::new(), escrow).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let deal = Bytes::from(
            r#"{"fingerprint":"cidA","deal_cid":"bafy1","deal_id":1,"provider_id":"f0100","committed_duration_epochs":518400,"deal_status":"published"}"#,
        );
        let response = server.route(&Method::POST, "/deals", &HeaderMap::new(), deal).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = server
            .route(&Method::GET, "/deals/fingerprint/cidA", &HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let summary = body_json(response).await;
        assert_eq!(summary["dealStatus"], "published");
        assert_eq!(summary["unlockStatus"], false);
        assert_eq!(summary["lockedAmount"], "10");

        let response = server
            .route(&Method::GET, "/deals/1", &HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = server
            .route(&Method::GET, "/deals/abc", &HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = server
            .route(&Method::POST, "/release/cidA", &HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(body_json(response).await["decision"], "not_eligible");

        // Fail the deal so it waits for a refund
        let deal = server.services.registry.find_by_deal_id(1).unwrap().unwrap();
        let merge =
            DealMerge::from_deal(&deal).status(DealStatus::Error, LockPaymentStatus::Refunding);
        server.services.registry.apply_merge(&deal, &merge, "test").unwrap();

        let confirm = format!("/refunds/{}/confirm", deal.id);
        let response = server
            .route(&Method::POST, &confirm, &HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["confirmed"], true);
        let response = server
            .route(&Method::POST, &confirm, &HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(body_json(response).await["confirmed"], false);

        let response = server
            .route(&Method::POST, "/refunds/missing/confirm", &HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = server
            .route(&Method::GET, "/deals/1/transitions", &HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let history = body_json(response).await;
        let to_lock: Vec<&str> = history
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["toLockStatus"].as_str().unwrap())
            .collect();
        assert_eq!(to_lock, vec!["refunding", "refunded"]);

        let response = server
            .route(&Method::GET, "/deals/99/transitions", &HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
