//! JSON over HTTP transport for the algorithm service.
//!
//! Every call is a `POST http://<endpoint>/v1/<service>/<method>` with the
//! request message as body. Failures come back as a non-2xx status whose
//! body, when present, is an [`RpcStatus`].

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::service::{AlgorithmConnector, AlgorithmService, RpcCode, RpcResult, RpcStatus};
use crate::wire::{
    GetEarlyStoppingRulesReply, GetEarlyStoppingRulesRequest, GetSuggestionsReply,
    GetSuggestionsRequest, ValidateAlgorithmSettingsRequest, ValidateEarlyStoppingSettingsRequest,
};

const SUGGESTION_SERVICE: &str = "Suggestion";
const EARLY_STOPPING_SERVICE: &str = "EarlyStopping";

/// One algorithm service endpoint reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAlgorithmService {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpAlgorithmService {
    pub fn new(endpoint: impl Into<String>, client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            client,
            timeout,
        }
    }

    fn url(&self, service: &str, method: &str) -> String {
        format!("http://{}/v1/{}/{}", self.endpoint, service, method)
    }

    async fn send<Req>(&self, service: &str, method: &str, request: &Req) -> RpcResult<reqwest::Response>
    where
        Req: Serialize + Sync,
    {
        let url = self.url(service, method);
        debug!(url = %url, "calling algorithm service");

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| transport_status(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(error_status(status, &body))
    }

    async fn post<Req, Rep>(&self, service: &str, method: &str, request: &Req) -> RpcResult<Rep>
    where
        Req: Serialize + Sync,
        Rep: DeserializeOwned,
    {
        let response = self.send(service, method, request).await?;
        response.json::<Rep>().await.map_err(|e| {
            RpcStatus::new(RpcCode::Internal, format!("malformed {} reply: {}", method, e))
        })
    }

    /// Post a call whose reply carries no payload; any body is ignored.
    async fn post_empty<Req>(&self, service: &str, method: &str, request: &Req) -> RpcResult<()>
    where
        Req: Serialize + Sync,
    {
        self.send(service, method, request).await.map(|_| ())
    }
}

#[async_trait]
impl AlgorithmService for HttpAlgorithmService {
    async fn get_suggestions(&self, request: GetSuggestionsRequest) -> RpcResult<GetSuggestionsReply> {
        self.post(SUGGESTION_SERVICE, "GetSuggestions", &request).await
    }

    async fn validate_algorithm_settings(
        &self,
        request: ValidateAlgorithmSettingsRequest,
    ) -> RpcResult<()> {
        self.post_empty(SUGGESTION_SERVICE, "ValidateAlgorithmSettings", &request)
            .await
    }

    async fn validate_early_stopping_settings(
        &self,
        request: ValidateEarlyStoppingSettingsRequest,
    ) -> RpcResult<()> {
        self.post_empty(EARLY_STOPPING_SERVICE, "ValidateEarlyStoppingSettings", &request)
            .await
    }

    async fn get_early_stopping_rules(
        &self,
        request: GetEarlyStoppingRulesRequest,
    ) -> RpcResult<GetEarlyStoppingRulesReply> {
        self.post(EARLY_STOPPING_SERVICE, "GetEarlyStoppingRules", &request)
            .await
    }
}

/// Connector handing out HTTP services that share one connection pool.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl AlgorithmConnector for HttpConnector {
    fn connect(&self, endpoint: &str) -> Arc<dyn AlgorithmService> {
        Arc::new(HttpAlgorithmService::new(
            endpoint,
            self.client.clone(),
            self.timeout,
        ))
    }
}

fn transport_status(err: &reqwest::Error) -> RpcStatus {
    if err.is_timeout() {
        RpcStatus::new(RpcCode::DeadlineExceeded, err.to_string())
    } else if err.is_connect() || err.is_request() {
        RpcStatus::unavailable(err.to_string())
    } else {
        RpcStatus::new(RpcCode::Unknown, err.to_string())
    }
}

/// Status carried by a non-2xx reply: the JSON body when it parses, else a
/// code derived from the HTTP status.
fn error_status(status: StatusCode, body: &str) -> RpcStatus {
    if let Ok(parsed) = serde_json::from_str::<RpcStatus>(body) {
        return parsed;
    }

    let code = match status {
        StatusCode::BAD_REQUEST => RpcCode::InvalidArgument,
        StatusCode::NOT_FOUND | StatusCode::NOT_IMPLEMENTED => RpcCode::Unimplemented,
        StatusCode::SERVICE_UNAVAILABLE => RpcCode::Unavailable,
        _ => RpcCode::Unknown,
    };
    let message = if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        body.to_string()
    };
    RpcStatus::new(code, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_layout() {
        let service = HttpAlgorithmService::new(
            "mnist-random.default:6789",
            reqwest::Client::new(),
            Duration::from_secs(1),
        );
        assert_eq!(
            service.url(SUGGESTION_SERVICE, "GetSuggestions"),
            "http://mnist-random.default:6789/v1/Suggestion/GetSuggestions"
        );
    }

    #[test]
    fn test_error_body_wins() {
        let status = error_status(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"code": "INVALID_ARGUMENT", "message": "unknown setting"}"#,
        );
        assert_eq!(status.code, RpcCode::InvalidArgument);
        assert_eq!(status.message, "unknown setting");
    }

    #[test]
    fn test_status_fallbacks() {
        assert_eq!(error_status(StatusCode::BAD_REQUEST, "").code, RpcCode::InvalidArgument);
        assert_eq!(error_status(StatusCode::NOT_FOUND, "").code, RpcCode::Unimplemented);
        assert_eq!(error_status(StatusCode::NOT_IMPLEMENTED, "").code, RpcCode::Unimplemented);
        assert_eq!(
            error_status(StatusCode::SERVICE_UNAVAILABLE, "").code,
            RpcCode::Unavailable
        );
        let other = error_status(StatusCode::BAD_GATEWAY, "upstream gone");
        assert_eq!(other.code, RpcCode::Unknown);
        assert_eq!(other.message, "upstream gone");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unavailable() {
        let connector = HttpConnector::new(Duration::from_secs(2));
        let service = connector.connect("127.0.0.1:1");
        let err = service
            .validate_algorithm_settings(ValidateAlgorithmSettingsRequest {
                experiment: Default::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err.code, RpcCode::Unavailable | RpcCode::DeadlineExceeded));
    }
}
