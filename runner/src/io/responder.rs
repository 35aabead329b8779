//! Structured-response capability: the seam between steps and model backends.
//!
//! A [`StructuredResponder`] turns a system instruction, a user payload and a
//! target schema into raw response text. [`invoke_structured`] is the only way
//! steps reach a backend: it enforces the time budget, parses the response,
//! checks it against the schema and deserializes it. Backends never see or
//! branch on step logic, and steps never see provider-specific shapes.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::core::graph::StepName;
use crate::core::schema::{ROOT_FIELD, SchemaDescriptor, parse_response_json};
use crate::error::{CapabilityError, WorkflowError};

/// Parameters for one capability invocation.
#[derive(Debug, Clone)]
pub struct ResponseRequest {
    /// Run the invocation belongs to. Backends may use it to isolate scratch files.
    pub run_id: String,
    pub step: StepName,
    pub system_instruction: String,
    pub user_payload: String,
    pub schema: &'static SchemaDescriptor,
    /// Time left in the run's budget.
    pub timeout: Duration,
}

/// Abstraction over structured-response backends.
///
/// Implementations must be safe to call from concurrent runs.
#[async_trait]
pub trait StructuredResponder: Send + Sync {
    /// Produce the raw response body for `request`.
    ///
    /// Return `Err` only when no response was obtained at all; malformed
    /// content is detected by the caller.
    async fn respond(&self, request: &ResponseRequest) -> Result<String, CapabilityError>;
}

/// Invoke the backend and return a value of type `T` conforming to `request.schema`.
///
/// - No response (backend error or timeout): [`WorkflowError::Capability`].
/// - Unparseable or non-conforming response: [`WorkflowError::SchemaConformance`].
///
/// Nothing is retried here; retry policy for transient failures belongs to
/// whoever drives the run.
#[instrument(skip_all, fields(run_id = %request.run_id, step = %request.step, schema = request.schema.name()))]
pub async fn invoke_structured<T, R>(responder: &R, request: &ResponseRequest) -> Result<T, WorkflowError>
where
    T: DeserializeOwned,
    R: StructuredResponder + ?Sized,
{
    let step = request.step;
    let raw = match tokio::time::timeout(request.timeout, responder.respond(request)).await {
        Ok(Ok(raw)) => raw,
        Ok(Err(source)) => {
            warn!(err = %source, "capability failed");
            return Err(WorkflowError::Capability { step, source });
        }
        Err(_) => {
            warn!(timeout_secs = request.timeout.as_secs(), "capability timed out");
            return Err(WorkflowError::Capability {
                step,
                source: CapabilityError::Timeout(request.timeout),
            });
        }
    };
    debug!(bytes = raw.len(), "capability responded");

    let conformance = |field: &str, detail: String| WorkflowError::SchemaConformance {
        step,
        schema: request.schema.name().to_string(),
        field: field.to_string(),
        detail,
    };

    let value = parse_response_json(&raw)
        .map_err(|detail| conformance(ROOT_FIELD, format!("response is not JSON: {detail}")))?;
    request
        .schema
        .check(&value)
        .map_err(|violation| conformance(&violation.field, violation.detail))?;
    serde_json::from_value(value).map_err(|err| conformance(ROOT_FIELD, err.to_string()))
}
