//! Client-facing error mapping for the proxy front-end
//!
//! Every failure this proxy produces on its own behalf leaves through one
//! funnel: a wire code, a matching status, and a small JSON body. Whatever
//! the backend returns once proxying has started passes through untouched.

use crate::manifest::ResolveError;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde_json::json;
use std::time::Duration;

/// Wire codes for the proxy's own failures, echoed in the `X-Proxy-Error`
/// header so callers can branch without parsing the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateErrorCode {
    /// Missing or unusable routing headers
    MissingRoutingHeaders,
    /// Container runtime query failed
    RuntimeUnavailable,
    /// No compose fragment declares the requested service
    ServiceNotFound,
    /// Compose invocation failed to bring the service up
    StartFailed,
    /// The service started but its port never opened in time
    NotReady,
    /// The backend could not be reached after activation
    ConnectionFailed,
}

impl GateErrorCode {
    /// Routing problems are the client's fault; everything else is a
    /// failed activation or an unreachable backend.
    pub fn status(self) -> StatusCode {
        match self {
            GateErrorCode::MissingRoutingHeaders => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GateErrorCode::MissingRoutingHeaders => "MISSING_ROUTING_HEADERS",
            GateErrorCode::RuntimeUnavailable => "RUNTIME_UNAVAILABLE",
            GateErrorCode::ServiceNotFound => "SERVICE_NOT_FOUND",
            GateErrorCode::StartFailed => "START_FAILED",
            GateErrorCode::NotReady => "NOT_READY",
            GateErrorCode::ConnectionFailed => "CONNECTION_FAILED",
        }
    }

    fn body(self, message: &str) -> String {
        json!({
            "error": self.as_str(),
            "message": message,
            "status": self.status().as_u16(),
        })
        .to_string()
    }

    /// Turn this code into the response the client sees.
    pub fn respond(self, message: impl AsRef<str>) -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::builder()
            .status(self.status())
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .header("X-Proxy-Error", self.as_str())
            .body(
                Full::new(Bytes::from(self.body(message.as_ref())))
                    .map_err(|e| match e {})
                    .boxed(),
            )
            .expect("static parts always form a valid response")
    }
}

/// Why an activation attempt could not produce a running, reachable service
#[derive(Debug)]
pub enum ActivationError {
    /// The container runtime could not be queried
    Runtime(anyhow::Error),
    /// The manifest tree did not yield a start recipe for the service
    Resolve(ResolveError),
    /// The compose invocation failed
    StartFailed {
        service: String,
        source: anyhow::Error,
    },
    /// The container came up but its port never accepted a connection
    NotReady {
        service: String,
        port: u16,
        waited: Duration,
    },
}

impl ActivationError {
    /// Map this error onto the client-facing code
    pub fn code(&self) -> GateErrorCode {
        match self {
            ActivationError::Runtime(_) => GateErrorCode::RuntimeUnavailable,
            ActivationError::Resolve(ResolveError::ServiceNotFound { .. }) => {
                GateErrorCode::ServiceNotFound
            }
            ActivationError::Resolve(_) => GateErrorCode::StartFailed,
            ActivationError::StartFailed { .. } => GateErrorCode::StartFailed,
            ActivationError::NotReady { .. } => GateErrorCode::NotReady,
        }
    }
}

impl std::fmt::Display for ActivationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivationError::Runtime(e) => write!(f, "container runtime error: {}", e),
            ActivationError::Resolve(e) => write!(f, "{}", e),
            ActivationError::StartFailed { service, source } => {
                write!(f, "failed to start service {}: {}", service, source)
            }
            ActivationError::NotReady {
                service,
                port,
                waited,
            } => write!(
                f,
                "service {} did not open port {} within {}s",
                service,
                port,
                waited.as_secs()
            ),
        }
    }
}

impl std::error::Error for ActivationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ActivationError::Runtime(e) => Some(e.as_ref()),
            ActivationError::Resolve(e) => Some(e),
            ActivationError::StartFailed { source, .. } => Some(source.as_ref()),
            ActivationError::NotReady { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_CODES: [GateErrorCode; 6] = [
        GateErrorCode::MissingRoutingHeaders,
        GateErrorCode::RuntimeUnavailable,
        GateErrorCode::ServiceNotFound,
        GateErrorCode::StartFailed,
        GateErrorCode::NotReady,
        GateErrorCode::ConnectionFailed,
    ];

    #[test]
    fn test_only_routing_errors_blame_the_client() {
        for code in ALL_CODES {
            let expected = if code == GateErrorCode::MissingRoutingHeaders {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::BAD_GATEWAY
            };
            assert_eq!(code.status(), expected, "wrong status for {:?}", code);
        }
    }

    #[test]
    fn test_wire_codes_are_screaming_snake_case() {
        for code in ALL_CODES {
            let s = code.as_str();
            assert!(!s.is_empty());
            assert!(
                s.chars().all(|c| c.is_ascii_uppercase() || c == '_'),
                "unexpected wire code {:?}",
                s
            );
        }
    }

    #[test]
    fn test_body_is_valid_json_with_all_fields() {
        let body: serde_json::Value = serde_json::from_str(
            &GateErrorCode::ServiceNotFound.body("no compose fragment declares alpha"),
        )
        .expect("body parses as JSON");

        assert_eq!(body["error"], "SERVICE_NOT_FOUND");
        assert_eq!(body["message"], "no compose fragment declares alpha");
        assert_eq!(body["status"], 502);
    }

    #[test]
    fn test_respond_sets_status_and_headers() {
        let response = GateErrorCode::NotReady.respond("port 80 never opened");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "NOT_READY");
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );

        let response = GateErrorCode::MissingRoutingHeaders.respond("no x-target-service");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_message_quoting_survives_json_encoding() {
        let body: serde_json::Value = serde_json::from_str(
            &GateErrorCode::StartFailed.body(r#"compose said: unknown flag "--lazy""#),
        )
        .expect("quoted message still parses");
        assert_eq!(body["message"], r#"compose said: unknown flag "--lazy""#);
    }

    #[test]
    fn test_activation_error_codes() {
        let err = ActivationError::Runtime(anyhow::anyhow!("socket gone"));
        assert_eq!(err.code(), GateErrorCode::RuntimeUnavailable);

        let err = ActivationError::Resolve(ResolveError::ServiceNotFound {
            service: "alpha".to_string(),
        });
        assert_eq!(err.code(), GateErrorCode::ServiceNotFound);

        let err = ActivationError::StartFailed {
            service: "alpha".to_string(),
            source: anyhow::anyhow!("exit code 1"),
        };
        assert_eq!(err.code(), GateErrorCode::StartFailed);

        let err = ActivationError::NotReady {
            service: "alpha".to_string(),
            port: 80,
            waited: Duration::from_secs(20),
        };
        assert_eq!(err.code(), GateErrorCode::NotReady);
    }

    #[test]
    fn test_activation_error_display() {
        let err = ActivationError::NotReady {
            service: "alpha".to_string(),
            port: 8080,
            waited: Duration::from_secs(20),
        };
        let message = err.to_string();
        assert!(message.contains("alpha"));
        assert!(message.contains("8080"));
        assert!(message.contains("20"));
    }
}
