//! The coordination service: its push channel protocol and its
//! request/response API.

use crate::channel::{ChannelProtocol, Credentials, CredentialsProvider, InboundClass};
use crate::error::{CallError, ChannelError};
use crate::lock;
use async_trait::async_trait;
use callcore::net::{HttpClient, HttpRequest, HttpResponse};
use callcore::protocol::coordinator::{
    ApiError, ClientDetails, CoordinatorEvent, CoordinatorEventKind, CoordinatorRequest,
    GetOrCreateCallRequest, GetOrCreateCallResponse, HealthCheckMessage, JoinCallRequest,
    JoinCallResponse, RejectCallRequest, UserRef, WsAuthMessage,
};
use callcore::types::call::CallId;
use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex};

pub struct CoordinatorProtocol {
    user: UserRef,
    client_details: ClientDetails,
    connection_id: Mutex<Option<String>>,
}

impl CoordinatorProtocol {
    pub fn new(user: UserRef, client_details: ClientDetails) -> Self {
        Self {
            user,
            client_details,
            connection_id: Mutex::new(None),
        }
    }

    pub fn connection_id(&self) -> Option<String> {
        lock(&self.connection_id).clone()
    }
}

impl ChannelProtocol for CoordinatorProtocol {
    const NAME: &'static str = "coordinator";
    type Outbound = CoordinatorRequest;
    type Inbound = CoordinatorEvent;
    type Kind = CoordinatorEventKind;

    fn auth_message(&self, credentials: &Credentials) -> Option<CoordinatorRequest> {
        Some(CoordinatorRequest::Auth(WsAuthMessage {
            token: credentials.token.clone(),
            user_details: self.user.clone(),
            client_details: self.client_details.clone(),
        }))
    }

    fn keepalive_message(&self) -> CoordinatorRequest {
        CoordinatorRequest::HealthCheck(HealthCheckMessage::new(self.connection_id()))
    }

    fn classify(&self, message: &CoordinatorEvent) -> InboundClass {
        match message {
            CoordinatorEvent::ConnectionOk { connection_id, .. } => {
                *lock(&self.connection_id) = Some(connection_id.clone());
                InboundClass::ConnectionOk
            }
            CoordinatorEvent::ConnectionError { error } if error.is_token_expired() => {
                InboundClass::ConnectionError(ChannelError::AuthExpired)
            }
            CoordinatorEvent::ConnectionError { error } if error.unrecoverable => {
                InboundClass::ConnectionError(ChannelError::Protocol(error.message.clone()))
            }
            CoordinatorEvent::ConnectionError { error } => {
                InboundClass::ConnectionError(ChannelError::Transport(error.message.clone()))
            }
            CoordinatorEvent::HealthCheck { .. } => InboundClass::HealthCheck,
            _ => InboundClass::Event,
        }
    }

    fn kind(message: &CoordinatorEvent) -> CoordinatorEventKind {
        message.kind()
    }
}

/// Call operations offered by the coordination service.
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    async fn get_or_create_call(
        &self,
        call: &CallId,
        request: &GetOrCreateCallRequest,
    ) -> Result<GetOrCreateCallResponse, CallError>;

    async fn join_call(&self, call: &CallId, request: &JoinCallRequest) -> Result<JoinCallResponse, CallError>;

    async fn accept_call(&self, call: &CallId) -> Result<(), CallError>;

    async fn reject_call(&self, call: &CallId, request: &RejectCallRequest) -> Result<(), CallError>;

    async fn end_call(&self, call: &CallId) -> Result<(), CallError>;
}

/// Maps a non-2xx response to [`CallError::Coordinator`]. Client errors
/// other than rate limiting cannot be fixed by retrying.
fn coordinator_error(response: &HttpResponse) -> CallError {
    let status = response.status_code;
    let api_error: Option<ApiError> = response.json().ok();
    let client_error = (400..500).contains(&status) && status != 429;
    match api_error {
        Some(error) => CallError::Coordinator {
            status,
            code: Some(error.code),
            unrecoverable: error.unrecoverable || client_error,
            message: error.message,
        },
        None => CallError::Coordinator {
            status,
            code: None,
            message: response.body_string().unwrap_or_default(),
            unrecoverable: client_error,
        },
    }
}

#[derive(Clone, Copy)]
enum Method {
    Get,
    Post,
}

pub struct HttpCoordinatorApi {
    http: Arc<dyn HttpClient>,
    base_url: String,
    api_key: String,
    client_details: ClientDetails,
    credentials: Arc<dyn CredentialsProvider>,
}

impl HttpCoordinatorApi {
    pub fn new(
        http: Arc<dyn HttpClient>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        client_details: ClientDetails,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client_details,
            credentials,
        }
    }

    fn url(&self, call: &CallId, action: Option<&str>) -> String {
        let mut url = format!(
            "{}/call/{}/{}",
            self.base_url,
            urlencoding::encode(&call.call_type),
            urlencoding::encode(&call.id)
        );
        if let Some(action) = action {
            url.push('/');
            url.push_str(action);
        }
        url.push_str("?api_key=");
        url.push_str(&urlencoding::encode(&self.api_key));
        url
    }

    /// Sends a request, refreshing the token and retrying once when the
    /// service reports it as expired.
    async fn request<B, T>(&self, method: Method, url: String, body: Option<&B>) -> Result<T, CallError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let mut refreshed = false;
        loop {
            let credentials = if refreshed {
                self.credentials.refresh().await?
            } else {
                self.credentials.current().await?
            };

            let request = match method {
                Method::Get => HttpRequest::get(url.clone()),
                Method::Post => HttpRequest::post(url.clone()),
            }
            .with_header("Authorization", credentials.token)
            .with_header("stream-auth-type", "jwt")
            .with_header("X-Stream-Client", self.client_details.header_value());
            let request = match body {
                Some(body) => request
                    .with_json(body)
                    .map_err(|e| CallError::Protocol(e.to_string()))?,
                None => request,
            };

            debug!(target: "Coordinator", "{} {}", request.method, url);
            let response = self
                .http
                .execute(request)
                .await
                .map_err(|e| CallError::Transport(e.to_string()))?;

            if response.is_success() {
                return response
                    .json()
                    .map_err(|e| CallError::Protocol(format!("unexpected response: {e}")));
            }

            let error = coordinator_error(&response);
            if let CallError::Coordinator {
                code: Some(code), ..
            } = &error
            {
                if *code == callcore::protocol::coordinator::TOKEN_EXPIRED_CODE && !refreshed {
                    warn!(target: "Coordinator", "Token expired, refreshing");
                    refreshed = true;
                    continue;
                }
            }
            return Err(error);
        }
    }
}

#[async_trait]
impl CoordinatorApi for HttpCoordinatorApi {
    async fn get_or_create_call(
        &self,
        call: &CallId,
        request: &GetOrCreateCallRequest,
    ) -> Result<GetOrCreateCallResponse, CallError> {
        self.request(Method::Post, self.url(call, None), Some(request)).await
    }

    async fn join_call(&self, call: &CallId, request: &JoinCallRequest) -> Result<JoinCallResponse, CallError> {
        self.request(Method::Post, self.url(call, Some("join")), Some(request))
            .await
    }

    async fn accept_call(&self, call: &CallId) -> Result<(), CallError> {
        let _: serde_json::Value = self
            .request::<(), _>(Method::Post, self.url(call, Some("accept")), None)
            .await?;
        Ok(())
    }

    async fn reject_call(&self, call: &CallId, request: &RejectCallRequest) -> Result<(), CallError> {
        let _: serde_json::Value = self
            .request(Method::Post, self.url(call, Some("reject")), Some(request))
            .await?;
        Ok(())
    }

    async fn end_call(&self, call: &CallId) -> Result<(), CallError> {
        let _: serde_json::Value = self
            .request::<(), _>(Method::Post, self.url(call, Some("mark_ended")), None)
            .await?;
        Ok(())
    }
}

/// Fetches the call's metadata without creating it.
pub async fn get_call(api: &HttpCoordinatorApi, call: &CallId) -> Result<GetOrCreateCallResponse, CallError> {
    api.request::<(), _>(Method::Get, api.url(call, None), None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StaticCredentials;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedHttp {
        responses: Mutex<VecDeque<HttpResponse>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedHttp {
        fn new(responses: Vec<(u16, serde_json::Value)>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|(status_code, body)| HttpResponse {
                            status_code,
                            body: body.to_string().into_bytes(),
                        })
                        .collect(),
                ),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedHttp {
        async fn execute(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no scripted response"))
        }
    }

    struct Refreshing(AtomicU32);

    #[async_trait]
    impl CredentialsProvider for Refreshing {
        async fn current(&self) -> Result<Credentials, ChannelError> {
            Ok(Credentials::new("stale"))
        }

        async fn refresh(&self) -> Result<Credentials, ChannelError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Credentials::new("fresh"))
        }
    }

    fn client_for(http: Arc<ScriptedHttp>, credentials: Arc<dyn CredentialsProvider>) -> HttpCoordinatorApi {
        HttpCoordinatorApi::new(
            http,
            "https://video.example.com/video/",
            "key 1",
            ClientDetails::default(),
            credentials,
        )
    }

    fn join_response() -> serde_json::Value {
        json!({
            "call": {"cid": "default:a b", "id": "a b", "type": "default", "created_by": {"id": "alice"}},
            "credentials": {
                "server": {"url": "https://sfu", "ws_endpoint": "wss://sfu/ws", "edge_name": "edge-1"},
                "token": "sfu-token"
            },
            "own_capabilities": ["send-audio"]
        })
    }

    #[tokio::test]
    async fn join_builds_url_and_headers() {
        let http = ScriptedHttp::new(vec![(201, join_response())]);
        let api = client_for(http.clone(), Arc::new(StaticCredentials(Credentials::new("tok"))));
        let response = api
            .join_call(&CallId::new("default", "a b"), &JoinCallRequest::default())
            .await
            .unwrap();
        assert_eq!(response.credentials.server.edge_name, "edge-1");

        let requests = http.requests.lock().unwrap();
        assert_eq!(
            requests[0].url,
            "https://video.example.com/video/call/default/a%20b/join?api_key=key%201"
        );
        assert_eq!(requests[0].headers["Authorization"], "tok");
        assert_eq!(requests[0].method, "POST");
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_once() {
        let expired = json!({"code": 40, "message": "token expired"});
        let http = ScriptedHttp::new(vec![(401, expired.clone()), (200, join_response())]);
        let credentials = Arc::new(Refreshing(AtomicU32::new(0)));
        let api = client_for(http.clone(), credentials.clone());
        api.join_call(&CallId::new("default", "x"), &JoinCallRequest::default())
            .await
            .unwrap();
        assert_eq!(credentials.0.load(Ordering::SeqCst), 1);
        assert_eq!(http.requests.lock().unwrap()[1].headers["Authorization"], "fresh");

        let http = ScriptedHttp::new(vec![(401, expired.clone()), (401, expired)]);
        let api = client_for(http, Arc::new(Refreshing(AtomicU32::new(0))));
        let err = api.accept_call(&CallId::new("default", "x")).await.unwrap_err();
        assert!(err.is_unrecoverable());
    }

    #[tokio::test]
    async fn status_codes_decide_recoverability() {
        let http = ScriptedHttp::new(vec![
            (404, json!({"code": 16, "message": "call not found"})),
            (429, json!({"code": 9, "message": "slow down"})),
            (503, json!("unavailable")),
        ]);
        let api = client_for(http, Arc::new(StaticCredentials(Credentials::new("t"))));
        let call = CallId::new("default", "x");

        match api.accept_call(&call).await.unwrap_err() {
            CallError::Coordinator {
                status,
                code,
                unrecoverable,
                ..
            } => {
                assert_eq!((status, code, unrecoverable), (404, Some(16), true));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!api.accept_call(&call).await.unwrap_err().is_unrecoverable());
        assert!(!api.end_call(&call).await.unwrap_err().is_unrecoverable());
    }

    #[test]
    fn connection_errors_are_classified() {
        let protocol = CoordinatorProtocol::new(UserRef::new("me"), ClientDetails::default());
        let expired: CoordinatorEvent = serde_json::from_value(json!({
            "type": "connection.error", "error": {"code": 40, "message": "expired"}
        }))
        .unwrap();
        assert!(matches!(
            protocol.classify(&expired),
            InboundClass::ConnectionError(ChannelError::AuthExpired)
        ));

        let ok: CoordinatorEvent =
            serde_json::from_value(json!({"type": "connection.ok", "connection_id": "c-1"})).unwrap();
        assert!(matches!(protocol.classify(&ok), InboundClass::ConnectionOk));
        match protocol.keepalive_message() {
            CoordinatorRequest::HealthCheck(msg) => assert_eq!(msg.client_id.as_deref(), Some("c-1")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
