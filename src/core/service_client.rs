// src/core/service_client.rs
//! Typed boundary to the job-portal backend. Every response is normalized into
//! `PremiumResult`; callers never see status codes or raw bodies.

use chrono::Utc;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{PremiumError, PremiumResult};
use crate::types::{
    response::{CheckPaidResponse, CreateOrderRequest, CreateOrderResponse, VerifyResponse},
    Order, PaidProbe, User, UserId, VerificationRequest,
};

const PROFILE_ENDPOINT: &str = "/profile";
const CREATE_ORDER_ENDPOINT: &str = "/payment/create-order";
const VERIFY_ENDPOINT: &str = "/payment/verify";
const CHECK_PAID_ENDPOINT: &str = "/payment/check-paid";

const DEFAULT_CURRENCY: &str = "INR";
/// Retryable failures get one more attempt.
const RETRY_ATTEMPTS: usize = 2;

/// The four server operations the premium flow depends on.
pub trait PaymentBackend: Send + Sync + 'static {
    /// Authoritative profile for the token's owner.
    fn get_profile(&self, token: &str) -> impl Future<Output = PremiumResult<User>> + Send;

    /// Create an order and extract the processor session from it.
    fn create_order(
        &self,
        user_id: &UserId,
        amount: u64,
    ) -> impl Future<Output = PremiumResult<Order>> + Send;

    /// `Ok(())` when the server accepted the payment, `VerificationRejected` otherwise.
    fn verify_payment(
        &self,
        request: &VerificationRequest,
    ) -> impl Future<Output = PremiumResult<()>> + Send;

    /// Paid-status poll. Transport failures come back as `PaidProbe::Unknown`.
    fn check_paid(&self, user_id: &UserId) -> impl Future<Output = PremiumResult<PaidProbe>> + Send;
}

pub struct ServiceClient {
    client: reqwest::Client,
    base_url: String,
    payment_timeout: Duration,
}

impl ServiceClient {
    /// Create new service client with configuration
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.api_base_url.clone(),
            payment_timeout: config.payment_timeout,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    /// Send once and return the body of a 2xx response.
    async fn execute(&self, request: RequestBuilder) -> PremiumResult<String> {
        let request_id = Uuid::new_v4().to_string();
        let response = request
            .header("X-Request-Id", &request_id)
            .send()
            .await
            .map_err(PremiumError::from)?;

        let status = response.status();
        trace!(%request_id, %status, "Backend response");

        if status == StatusCode::UNAUTHORIZED {
            return Err(PremiumError::Unauthenticated);
        }

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            warn!(%request_id, %status, body = %error_text, "Backend returned error status");
            return Err(PremiumError::Server {
                status: status.as_u16(),
            });
        }

        response.text().await.map_err(PremiumError::from)
    }

    /// Rebuild and resend the request while the failure is retryable.
    async fn execute_with_retry<F>(&self, operation: &str, build: F) -> PremiumResult<String>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.execute(build()).await {
                Err(e) if e.is_retryable() && attempt < RETRY_ATTEMPTS => {
                    warn!(operation, attempt, error = %e, "Retrying backend call");
                }
                other => return other,
            }
        }
    }
}

fn decode<R: DeserializeOwned>(body: &str, operation: &str) -> PremiumResult<R> {
    serde_json::from_str(body).map_err(|e| {
        warn!(operation, error = %e, "Malformed backend response");
        PremiumError::Network(format!("malformed {} response: {}", operation, e))
    })
}

impl PaymentBackend for ServiceClient {
    async fn get_profile(&self, token: &str) -> PremiumResult<User> {
        let url = self.url(PROFILE_ENDPOINT);
        debug!("Fetching profile: {}", url);

        let body = self
            .execute(self.client.get(&url).bearer_auth(token))
            .await?;
        decode(&body, "profile")
    }

    async fn create_order(&self, user_id: &UserId, amount: u64) -> PremiumResult<Order> {
        let url = self.url(CREATE_ORDER_ENDPOINT);
        let payload = CreateOrderRequest {
            user_id: user_id.as_str(),
            amount,
        };

        info!(%user_id, amount, "Creating payment order");

        let body = self
            .execute_with_retry("create-order", || {
                self.client
                    .post(&url)
                    .timeout(self.payment_timeout)
                    .json(&payload)
            })
            .await
            .map_err(|e| match e {
                PremiumError::Server { status } if (400..500).contains(&status) => {
                    PremiumError::OrderInvalid(format!("order rejected with status {}", status))
                }
                other => other,
            })?;

        let response: CreateOrderResponse = serde_json::from_str(&body)
            .map_err(|e| PremiumError::OrderInvalid(format!("malformed order body: {}", e)))?;

        let order_id = response.resolved_order_id()?;
        let session = response.session_token()?;

        Ok(Order {
            order_id,
            user_id: user_id.clone(),
            amount: response.amount.unwrap_or(amount),
            currency: response
                .currency
                .clone()
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            key_id: response.key_id.clone(),
            session,
            created_at: Utc::now(),
        })
    }

    async fn verify_payment(&self, request: &VerificationRequest) -> PremiumResult<()> {
        let url = self.url(VERIFY_ENDPOINT);
        let idempotency_key = request.idempotency_key();

        info!(user_id = %request.user_id, order_id = %request.order_id, "Verifying payment");

        let body = self
            .execute_with_retry("verify", || {
                self.client
                    .post(&url)
                    .timeout(self.payment_timeout)
                    .header("Idempotency-Key", &idempotency_key)
                    .json(request)
            })
            .await
            .map_err(|e| match e {
                // The server refused this user/order pair; repeating will not help.
                PremiumError::Server { status }
                    if (400..500).contains(&status) && status != 408 && status != 429 =>
                {
                    warn!(
                        user_id = %request.user_id,
                        order_id = %request.order_id,
                        status,
                        "Verification refused by server"
                    );
                    PremiumError::VerificationRejected
                }
                other => other,
            })?;

        let response: VerifyResponse = decode(&body, "verify")?;
        if response.success {
            Ok(())
        } else {
            Err(PremiumError::VerificationRejected)
        }
    }

    async fn check_paid(&self, user_id: &UserId) -> PremiumResult<PaidProbe> {
        let url = format!("{}/{}", self.url(CHECK_PAID_ENDPOINT), user_id);

        let result = self
            .execute(self.client.get(&url).timeout(self.payment_timeout))
            .await
            .and_then(|body| decode::<CheckPaidResponse>(&body, "check-paid"));

        match result {
            Ok(response) if response.paid() => Ok(PaidProbe::Paid),
            Ok(_) => Ok(PaidProbe::Unpaid),
            Err(PremiumError::Unauthenticated) => Err(PremiumError::Unauthenticated),
            Err(e) => {
                debug!(%user_id, error = %e, "Paid-status probe inconclusive");
                Ok(PaidProbe::Unknown)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    type Seen = Arc<Mutex<Vec<String>>>;

    /// Local backend answering with `responses` in order; the last one repeats.
    /// Returns the API base URL and the raw requests received.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Seen) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        tokio::spawn(async move {
            let mut served = 0;
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let request = read_request(&mut socket).await;
                log.lock().unwrap().push(request);

                let (status, body) = responses[served.min(responses.len() - 1)];
                served += 1;
                let reply = format!(
                    "HTTP/1.1 {} Status\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}/api", addr), seen)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_lowercase()
    }

    fn client_for(base_url: &str) -> ServiceClient {
        ServiceClient::new(&ClientConfig::default().with_api_base_url(base_url)).unwrap()
    }

    const ORDER_BODY: &str = r#"{"orderId":"o1","amount":99,"currency":"INR","cashfreeResponse":"{\"payment_session_id\":\"sess_1\"}"}"#;

    #[test]
    fn test_url_join() {
        let config = ClientConfig::default().with_api_base_url("http://localhost:8080/api/");
        let client = ServiceClient::new(&config).unwrap();
        assert_eq!(
            client.url(CREATE_ORDER_ENDPOINT),
            "http://localhost:8080/api/payment/create-order"
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        // Nothing listens on port 1 of the loopback interface.
        let config = ClientConfig::default().with_api_base_url("http://127.0.0.1:1/api");
        let client = ServiceClient::new(&config).unwrap();
        let user = UserId::from(42u64);

        assert_eq!(client.check_paid(&user).await, Ok(PaidProbe::Unknown));
        assert!(matches!(
            client.get_profile("token").await,
            Err(PremiumError::Network(_))
        ));
        assert!(matches!(
            client
                .verify_payment(&VerificationRequest::new(user, "o1"))
                .await,
            Err(PremiumError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_profile_unauthorized_is_unauthenticated() {
        let (url, seen) = serve(vec![(401, r#"{"error":"expired"}"#)]).await;
        let client = client_for(&url);

        assert_eq!(
            client.get_profile("tok").await,
            Err(PremiumError::Unauthenticated)
        );
        let requests = seen.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].starts_with("get /api/profile"));
        assert!(requests[0].contains("authorization: bearer tok"));
    }

    #[tokio::test]
    async fn test_profile_with_null_payment_status() {
        let (url, _) = serve(vec![(200, r#"{"id":42,"name":"Asha","paymentStatus":null}"#)]).await;
        let user = client_for(&url).get_profile("tok").await.unwrap();
        assert_eq!(user.id, UserId::from(42u64));
        assert!(!user.payment_status);
    }

    #[tokio::test]
    async fn test_create_order_client_error_is_order_invalid() {
        let (url, seen) = serve(vec![(400, r#"{"error":"bad amount"}"#)]).await;
        let result = client_for(&url).create_order(&UserId::from(42u64), 0).await;

        assert!(matches!(result, Err(PremiumError::OrderInvalid(_))));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_order_retries_server_error_once() {
        let (url, seen) = serve(vec![(503, "{}"), (200, ORDER_BODY)]).await;
        let order = client_for(&url)
            .create_order(&UserId::from(42u64), 99)
            .await
            .unwrap();

        assert_eq!(order.order_id, "o1");
        assert_eq!(order.session, crate::types::SessionToken::SessionId("sess_1".into()));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_create_order_gives_up_after_one_retry() {
        let (url, seen) = serve(vec![(503, "{}")]).await;
        let result = client_for(&url).create_order(&UserId::from(42u64), 99).await;

        assert_eq!(result, Err(PremiumError::Server { status: 503 }));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_verify_sends_idempotency_and_request_id() {
        let (url, seen) = serve(vec![(200, r#"{"success":true}"#)]).await;
        let request = VerificationRequest::new(UserId::from(42u64), "o1");

        assert_eq!(client_for(&url).verify_payment(&request).await, Ok(()));
        let sent = seen.lock().unwrap()[0].clone();
        assert!(sent.starts_with("post /api/payment/verify"));
        assert!(sent.contains("idempotency-key: 42:o1"));
        assert!(sent.contains("x-request-id: "));
        assert!(sent.contains(r#""userid":"42""#));
    }

    #[tokio::test]
    async fn test_verify_refusals_are_rejections() {
        let (url, seen) = serve(vec![(400, r#"{"success":false}"#)]).await;
        let request = VerificationRequest::new(UserId::from(42u64), "o1");
        let result = client_for(&url).verify_payment(&request).await;

        assert_eq!(result, Err(PremiumError::VerificationRejected));
        assert_eq!(
            result.unwrap_err().kind(),
            crate::error::FailureKind::VerificationRejected
        );
        assert_eq!(seen.lock().unwrap().len(), 1);

        let (url, _) = serve(vec![(200, r#"{"success":false}"#)]).await;
        assert_eq!(
            client_for(&url).verify_payment(&request).await,
            Err(PremiumError::VerificationRejected)
        );
    }

    #[tokio::test]
    async fn test_verify_retries_server_error_with_same_key() {
        let (url, seen) = serve(vec![(502, "{}"), (200, r#"{"success":true}"#)]).await;
        let request = VerificationRequest::new(UserId::from(42u64), "o1");

        assert_eq!(client_for(&url).verify_payment(&request).await, Ok(()));
        let requests = seen.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert!(requests
            .iter()
            .all(|r| r.contains("idempotency-key: 42:o1")));
    }

    #[tokio::test]
    async fn test_check_paid_normalization() {
        let user = UserId::from(42u64);

        let (url, seen) = serve(vec![(500, "{}")]).await;
        assert_eq!(client_for(&url).check_paid(&user).await, Ok(PaidProbe::Unknown));
        assert!(seen.lock().unwrap()[0].starts_with("get /api/payment/check-paid/42"));

        let (url, _) = serve(vec![(200, "true")]).await;
        assert_eq!(client_for(&url).check_paid(&user).await, Ok(PaidProbe::Paid));

        let (url, _) = serve(vec![(200, r#"{"paid":false}"#)]).await;
        assert_eq!(client_for(&url).check_paid(&user).await, Ok(PaidProbe::Unpaid));

        let (url, _) = serve(vec![(401, "{}")]).await;
        assert_eq!(
            client_for(&url).check_paid(&user).await,
            Err(PremiumError::Unauthenticated)
        );
    }
}
