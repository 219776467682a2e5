//! AWS JSON 1.1 protocol client.
//!
//! Every operation is a `POST /` with the operation named in the
//! `X-Amz-Target` header and the request as a JSON body. Errors come back
//! as a JSON body whose `__type` names the exception.

use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use super::SinkError;
use super::sigv4::{self, Credentials, Scope, SignableRequest};

const CONTENT_TYPE: &str = "application/x-amz-json-1.1";

#[derive(Debug, Clone)]
pub struct AwsJsonClient {
    http: reqwest::Client,
    endpoint: Url,
    region: String,
    service: &'static str,
    target_prefix: &'static str,
    credentials: Option<Credentials>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(alias = "Message", default)]
    message: String,
}

impl AwsJsonClient {
    pub fn new(
        endpoint: &str,
        region: &str,
        service: &'static str,
        target_prefix: &'static str,
        timeout: Duration,
        credentials: Option<Credentials>,
    ) -> Result<Self, SinkError> {
        let endpoint = Url::parse(endpoint).map_err(|e| SinkError::Api {
            code: "InvalidEndpoint".to_string(),
            message: format!("{endpoint}: {e}"),
        })?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SinkError::Transport)?;
        if credentials.is_none() {
            log::warn!("No AWS credentials in environment, sending unsigned requests to {endpoint}");
        }
        Ok(Self {
            http,
            endpoint,
            region: region.to_string(),
            service,
            target_prefix,
            credentials,
        })
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    fn headers(&self, operation: &str, body: &[u8]) -> Result<HeaderMap, SinkError> {
        let amz_date = sigv4::amz_date(Utc::now());
        let mut pairs = vec![
            ("content-type".to_string(), CONTENT_TYPE.to_string()),
            ("host".to_string(), self.host()),
            ("x-amz-date".to_string(), amz_date.clone()),
            (
                "x-amz-target".to_string(),
                format!("{}.{operation}", self.target_prefix),
            ),
        ];

        if let Some(credentials) = &self.credentials {
            if let Some(token) = &credentials.session_token {
                pairs.push(("x-amz-security-token".to_string(), token.clone()));
            }
            let request = SignableRequest {
                method: "POST",
                path: self.endpoint.path(),
                query: self.endpoint.query().unwrap_or_default(),
                headers: &pairs,
                payload: body,
            };
            let scope = Scope {
                region: &self.region,
                service: self.service,
            };
            let authorization = sigv4::authorization(credentials, &request, &amz_date, scope);
            pairs.push(("authorization".to_string(), authorization));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            // reqwest derives Host from the URL.
            if name == "host" {
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| SinkError::Api {
                code: "InvalidHeader".to_string(),
                message: e.to_string(),
            })?;
            let value = HeaderValue::from_str(&value).map_err(|e| SinkError::Api {
                code: "InvalidHeader".to_string(),
                message: e.to_string(),
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    /// Invoke `operation` and decode its JSON response.
    pub async fn call<Req, Resp>(&self, operation: &str, request: &Req) -> Result<Resp, SinkError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request).map_err(|e| SinkError::Decode(e.to_string()))?;
        let headers = self.headers(operation, &body)?;

        let response = self
            .http
            .post(self.endpoint.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(transport_error)?;

        if status.is_success() {
            return serde_json::from_slice(&bytes).map_err(|e| SinkError::Decode(e.to_string()));
        }

        let error: ErrorBody = serde_json::from_slice(&bytes).unwrap_or_else(|_| ErrorBody {
            kind: String::new(),
            message: String::from_utf8_lossy(&bytes).into_owned(),
        });
        Err(classify(status.as_u16(), &error.kind, error.message))
    }
}

fn transport_error(e: reqwest::Error) -> SinkError {
    if e.is_timeout() {
        SinkError::Timeout
    } else {
        SinkError::Transport(e)
    }
}

/// Map an error response onto the sink error taxonomy.
///
/// `kind` may carry a namespace (`com.amazonaws.logs#ResourceNotFoundException`).
pub(crate) fn classify(status: u16, kind: &str, message: String) -> SinkError {
    let code = kind.rsplit('#').next().unwrap_or(kind);
    match code {
        "InvalidSequenceTokenException" | "DataAlreadyAcceptedException" => {
            SinkError::TokenRejected(message)
        }
        "ResourceNotFoundException" => SinkError::NotFound(message),
        "AccessDeniedException"
        | "UnrecognizedClientException"
        | "InvalidSignatureException"
        | "IncompleteSignature"
        | "MissingAuthenticationToken"
        | "ExpiredTokenException" => SinkError::Auth(message),
        "ThrottlingException"
        | "ProvisionedThroughputExceededException"
        | "LimitExceededException"
        | "ServiceUnavailableException" => SinkError::Throttled(message),
        _ if status == 401 || status == 403 => SinkError::Auth(message),
        _ if status == 429 || status >= 500 => SinkError::Throttled(message),
        _ => SinkError::Api {
            code: if code.is_empty() {
                format!("HTTP{status}")
            } else {
                code.to_string()
            },
            message,
        },
    }
}
