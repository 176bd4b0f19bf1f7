//! Error taxonomy shared by every Fabrik crate.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Errors suitable for branching by callers and for storage in `status.error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum FabrikError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("page not found: {0}")]
    PageNotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("gone: {0}")]
    Gone(String),
    #[error("unprocessable entity: {0}")]
    UnprocessableEntity(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
    #[error("timeout: {0}")]
    Timeout(String),
    /// Admission deferred the deployment into the queue. Never surfaced to transport.
    #[error("deployment delayed: {0}")]
    DeploymentDelayed(String),
    #[error("deployment attempt rejected: {0}")]
    DeploymentAttemptRejected(String),
    #[error("Service Instance with ID {0} already exists")]
    ServiceInstanceAlreadyExists(String),
    #[error("Could not find Service Instance with ID {0}")]
    ServiceInstanceNotFound(String),
    #[error("Service Instance with ID {0} is not operational")]
    ServiceInstanceNotOperational(String),
    #[error("Could not find any Agent supporting feature '{0}'")]
    FeatureNotSupported(String),
    #[error("director service unavailable: {0}")]
    DirectorServiceUnavailable(String),
    #[error("cache: {0}")]
    Cache(String),
}

pub type FabrikResult<T> = Result<T, FabrikError>;

impl FabrikError {
    /// Translate an upstream HTTP status into the error taxonomy.
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            400 => Self::BadRequest(message),
            404 if message.to_ascii_lowercase().contains("page not found") => Self::PageNotFound(message),
            404 => Self::NotFound(message),
            409 => Self::Conflict(message),
            403 => Self::Forbidden(message),
            410 => Self::Gone(message),
            _ => Self::InternalServerError(message),
        }
    }

    /// HTTP status equivalent of this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) | Self::ServiceInstanceAlreadyExists(_) => 400,
            Self::NotFound(_) | Self::PageNotFound(_) | Self::ServiceInstanceNotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Forbidden(_) => 403,
            Self::Gone(_) => 410,
            Self::UnprocessableEntity(_) | Self::ServiceInstanceNotOperational(_) => 422,
            Self::FeatureNotSupported(_) => 502,
            Self::DirectorServiceUnavailable(_) => 503,
            Self::Timeout(_) | Self::DeploymentDelayed(_) | Self::DeploymentAttemptRejected(_) | Self::InternalServerError(_) | Self::Cache(_) => 500,
        }
    }

    /// Stable machine-readable name, written next to the status in stored errors.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BadRequest",
            Self::NotFound(_) => "NotFound",
            Self::PageNotFound(_) => "PageNotFound",
            Self::Conflict(_) => "Conflict",
            Self::Forbidden(_) => "Forbidden",
            Self::Gone(_) => "Gone",
            Self::UnprocessableEntity(_) => "UnprocessableEntity",
            Self::InternalServerError(_) => "InternalServerError",
            Self::Timeout(_) => "Timeout",
            Self::DeploymentDelayed(_) => "DeploymentDelayed",
            Self::DeploymentAttemptRejected(_) => "DeploymentAttemptRejected",
            Self::ServiceInstanceAlreadyExists(_) => "ServiceInstanceAlreadyExists",
            Self::ServiceInstanceNotFound(_) => "ServiceInstanceNotFound",
            Self::ServiceInstanceNotOperational(_) => "ServiceInstanceNotOperational",
            Self::FeatureNotSupported(_) => "FeatureNotSupported",
            Self::DirectorServiceUnavailable(_) => "DirectorServiceUnavailable",
            Self::Cache(_) => "Cache",
        }
    }

    /// The upstream message (or instance id for the instance-specific variants).
    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest(m) | Self::NotFound(m) | Self::PageNotFound(m) | Self::Conflict(m) | Self::Forbidden(m) | Self::Gone(m)
            | Self::UnprocessableEntity(m) | Self::InternalServerError(m) | Self::Timeout(m) | Self::DeploymentDelayed(m)
            | Self::DeploymentAttemptRejected(m) | Self::ServiceInstanceAlreadyExists(m) | Self::ServiceInstanceNotFound(m)
            | Self::ServiceInstanceNotOperational(m) | Self::FeatureNotSupported(m) | Self::DirectorServiceUnavailable(m) | Self::Cache(m) => m,
        }
    }

    /// True for the plain and instance-specific not-found variants.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::PageNotFound(_) | Self::ServiceInstanceNotFound(_))
    }

    /// The form persisted into `status.error`.
    pub fn to_error_json(&self) -> Value {
        json!({ "code": self.reason(), "status": self.status_code(), "message": self.message(), "description": self.to_string() })
    }

    /// Rebuild an error stored in `status.error`.
    ///
    /// Accepts the shape written by [`FabrikError::to_error_json`] as well as bare
    /// `{statusCode, message}` / `{status, body: {message}}` objects and plain strings.
    pub fn from_error_json(v: &Value) -> Self {
        if let Some(s) = v.as_str() {
            return Self::InternalServerError(s.to_string());
        }
        let message = v
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| v.pointer("/body/message").and_then(Value::as_str))
            .or_else(|| v.get("description").and_then(Value::as_str))
            .unwrap_or("unknown error")
            .to_string();
        let status = v
            .get("status")
            .or_else(|| v.get("statusCode"))
            .and_then(|s| s.as_u64().or_else(|| s.as_str().and_then(|t| t.parse().ok())))
            .unwrap_or(500) as u16;
        match v.get("code").and_then(Value::as_str) {
            Some("Timeout") => Self::Timeout(message),
            Some("DeploymentAttemptRejected") => Self::DeploymentAttemptRejected(message),
            Some("ServiceInstanceNotFound") => Self::ServiceInstanceNotFound(message),
            Some("ServiceInstanceAlreadyExists") => Self::ServiceInstanceAlreadyExists(message),
            Some("ServiceInstanceNotOperational") => Self::ServiceInstanceNotOperational(message),
            Some("FeatureNotSupported") => Self::FeatureNotSupported(message),
            Some("UnprocessableEntity") => Self::UnprocessableEntity(message),
            Some("DirectorServiceUnavailable") => Self::DirectorServiceUnavailable(message),
            _ => Self::from_status(status, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_translation_table() {
        assert_eq!(FabrikError::from_status(400, "x"), FabrikError::BadRequest("x".into()));
        assert_eq!(FabrikError::from_status(404, "x"), FabrikError::NotFound("x".into()));
        assert_eq!(FabrikError::from_status(404, "404 page not found"), FabrikError::PageNotFound("404 page not found".into()));
        assert_eq!(FabrikError::from_status(409, "x"), FabrikError::Conflict("x".into()));
        assert_eq!(FabrikError::from_status(403, "x"), FabrikError::Forbidden("x".into()));
        assert_eq!(FabrikError::from_status(410, "x"), FabrikError::Gone("x".into()));
        assert_eq!(FabrikError::from_status(502, "x"), FabrikError::InternalServerError("x".into()));
        assert_eq!(FabrikError::from_status(422, "x"), FabrikError::InternalServerError("x".into()));
    }

    #[test]
    fn stored_error_rebuilds_variant() {
        let e = FabrikError::Conflict("already there".into());
        let back = FabrikError::from_error_json(&e.to_error_json());
        assert_eq!(back, e);
        let nf = FabrikError::ServiceInstanceNotFound("abc".into());
        assert_eq!(FabrikError::from_error_json(&nf.to_error_json()), nf);

        let raw = serde_json::json!({ "statusCode": 404, "message": "gone missing" });
        assert_eq!(FabrikError::from_error_json(&raw), FabrikError::NotFound("gone missing".into()));

        let body = serde_json::json!({ "status": "403", "body": { "message": "nope" } });
        assert_eq!(FabrikError::from_error_json(&body), FabrikError::Forbidden("nope".into()));
    }
}
