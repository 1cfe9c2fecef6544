//! Admission webhooks for the custom resources, served over HTTPS.
//!
//! Validation problems never fail the HTTP call. They are reported as a denied
//! [`AdmissionResponse`] carrying one line per [`FieldError`].

use std::{fmt, net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{Json, Router, extract::State, routing::post};
use axum_server::tls_rustls::RustlsConfig;
use serde::de::DeserializeOwned;
use serde_json::json;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    client::Client,
    kube::core::{
        DynamicObject,
        admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    },
};
use strum::Display;
use tracing::{debug, info, warn};

use crate::{config::WebhookConfig, metrics::OperatorMetrics};

pub mod pod_template;
pub mod risingwave;
pub mod scale_view;

pub const MUTATE_RISINGWAVE: &str = "mutate-risingwave";
pub const VALIDATE_RISINGWAVE: &str = "validate-risingwave";
pub const MUTATE_SCALE_VIEW: &str = "mutate-risingwavescaleview";
pub const VALIDATE_SCALE_VIEW: &str = "validate-risingwavescaleview";
pub const VALIDATE_POD_TEMPLATE: &str = "validate-risingwavepodtemplate";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to load the serving certificate from {}", cert_dir.display()))]
    LoadCertificate {
        source: std::io::Error,
        cert_dir: PathBuf,
    },

    #[snafu(display("webhook server failed"))]
    Serve { source: std::io::Error },
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum FieldErrorKind {
    Invalid,
    Required,
    Forbidden,
    NotFound,
}

/// A problem with one field of the reviewed object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldError {
    pub kind: FieldErrorKind,
    pub path: String,
    pub detail: String,
}

impl FieldError {
    fn new(kind: FieldErrorKind, path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn invalid(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(FieldErrorKind::Invalid, path, detail)
    }

    pub fn required(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(FieldErrorKind::Required, path, detail)
    }

    pub fn forbidden(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(FieldErrorKind::Forbidden, path, detail)
    }

    pub fn not_found(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(FieldErrorKind::NotFound, path, detail)
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.detail)
        } else {
            write!(f, "{}: {}", self.path, self.detail)
        }
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum DenialReason {
    Invalid,
    Forbidden,
    Conflict,
    BadRequest,
    InternalError,
}

impl DenialReason {
    pub fn code(&self) -> u16 {
        match self {
            DenialReason::Invalid => 422,
            DenialReason::Forbidden => 403,
            DenialReason::Conflict => 409,
            DenialReason::BadRequest => 400,
            DenialReason::InternalError => 500,
        }
    }
}

/// Why a request is rejected: a reason plus all field errors that were found.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Denial {
    pub reason: DenialReason,
    pub errors: Vec<FieldError>,
}

impl Denial {
    pub fn new(reason: DenialReason, errors: Vec<FieldError>) -> Self {
        Self { reason, errors }
    }

    pub fn single(reason: DenialReason, error: FieldError) -> Self {
        Self::new(reason, vec![error])
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::single(DenialReason::InternalError, FieldError::invalid("", detail))
    }

    /// `Ok` if `errors` is empty, a denial with `reason` otherwise.
    pub fn check(reason: DenialReason, errors: Vec<FieldError>) -> Result<(), Denial> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self::new(reason, errors))
        }
    }

    pub fn message(&self) -> String {
        self.errors
            .iter()
            .map(FieldError::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// What a webhook decided: allow, possibly with a patch, or deny.
pub type Admission = Result<Option<json_patch::Patch>, Denial>;

pub struct WebhookState {
    pub client: Client,
    pub open_kruise_available: bool,
    pub metrics: OperatorMetrics,
}

impl WebhookState {
    fn respond(
        &self,
        webhook: &str,
        request: &AdmissionRequest<DynamicObject>,
        admission: Admission,
    ) -> Json<AdmissionReview<DynamicObject>> {
        let name = request.name.as_str();
        let response = match admission {
            Ok(None) => {
                debug!(webhook, name, operation = ?request.operation, "allowed");
                AdmissionResponse::from(request)
            }
            Ok(Some(patch)) => {
                debug!(webhook, name, operations = patch.0.len(), "allowed with patch");
                match AdmissionResponse::from(request).with_patch(patch) {
                    Ok(response) => response,
                    Err(error) => deny(request, Denial::internal(error.to_string())),
                }
            }
            Err(denial) => {
                info!(
                    webhook,
                    name,
                    operation = ?request.operation,
                    reason = %denial.reason,
                    message = %denial.message(),
                    "denied"
                );
                deny(request, denial)
            }
        };
        self.metrics.observe_webhook(webhook, response.allowed);
        Json(response.into_review())
    }
}

fn deny(request: &AdmissionRequest<DynamicObject>, denial: Denial) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request).deny(denial.message());
    response.result.reason = denial.reason.to_string();
    response.result.code = denial.reason.code();
    response
}

/// Reads the reviewed object of a request as the typed resource.
pub fn parse_object<K: DeserializeOwned>(
    obj: Option<&DynamicObject>,
    field: &str,
) -> Result<K, Denial> {
    let Some(obj) = obj else {
        return Err(Denial::single(
            DenialReason::BadRequest,
            FieldError::required(field, "missing in the admission request"),
        ));
    };
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|error| {
            Denial::single(
                DenialReason::BadRequest,
                FieldError::invalid(field, format!("cannot be parsed: {error}")),
            )
        })
}

/// A patch replacing the spec of `raw` by `spec`, or `None` if they are equal.
pub fn spec_patch(raw: Option<&DynamicObject>, spec: serde_json::Value) -> Admission {
    if raw.and_then(|raw| raw.data.get("spec")) == Some(&spec) {
        return Ok(None);
    }
    serde_json::from_value(json!([{ "op": "add", "path": "/spec", "value": spec }]))
        .map(Some)
        .map_err(|error| Denial::internal(error.to_string()))
}

/// The admission request of a review, or the response to send back if there is none.
fn admission_request(
    review: AdmissionReview<DynamicObject>,
) -> Result<AdmissionRequest<DynamicObject>, Json<AdmissionReview<DynamicObject>>> {
    review.try_into().map_err(|error| {
        warn!(%error, "invalid admission review");
        Json(AdmissionResponse::invalid(error.to_string()).into_review())
    })
}

type Review = Json<AdmissionReview<DynamicObject>>;

async fn mutate_risingwave(State(state): State<Arc<WebhookState>>, Json(review): Review) -> Review {
    let request = match admission_request(review) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let admission = risingwave::mutate(&request);
    state.respond(MUTATE_RISINGWAVE, &request, admission)
}

async fn validate_risingwave(
    State(state): State<Arc<WebhookState>>,
    Json(review): Review,
) -> Review {
    let request = match admission_request(review) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let admission = risingwave::validate(&request, state.open_kruise_available).map(|()| None);
    state.respond(VALIDATE_RISINGWAVE, &request, admission)
}

async fn mutate_scale_view(State(state): State<Arc<WebhookState>>, Json(review): Review) -> Review {
    let request = match admission_request(review) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let admission = scale_view::mutate(&state.client, &request).await;
    state.respond(MUTATE_SCALE_VIEW, &request, admission)
}

async fn validate_scale_view(
    State(state): State<Arc<WebhookState>>,
    Json(review): Review,
) -> Review {
    let request = match admission_request(review) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let admission = scale_view::validate(&state.client, &request)
        .await
        .map(|()| None);
    state.respond(VALIDATE_SCALE_VIEW, &request, admission)
}

async fn validate_pod_template(
    State(state): State<Arc<WebhookState>>,
    Json(review): Review,
) -> Review {
    let request = match admission_request(review) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let admission = pod_template::validate(&request).map(|()| None);
    state.respond(VALIDATE_POD_TEMPLATE, &request, admission)
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(&format!("/{MUTATE_RISINGWAVE}"), post(mutate_risingwave))
        .route(&format!("/{VALIDATE_RISINGWAVE}"), post(validate_risingwave))
        .route(&format!("/{MUTATE_SCALE_VIEW}"), post(mutate_scale_view))
        .route(&format!("/{VALIDATE_SCALE_VIEW}"), post(validate_scale_view))
        .route(&format!("/{VALIDATE_POD_TEMPLATE}"), post(validate_pod_template))
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    config: &WebhookConfig,
    state: Arc<WebhookState>,
) -> Result<(), Error> {
    let tls = RustlsConfig::from_pem_file(config.cert_path(), config.key_path())
        .await
        .context(LoadCertificateSnafu {
            cert_dir: config.cert_dir.clone(),
        })?;

    info!(%addr, "starting webhook server");
    axum_server::bind_rustls(addr, tls)
        .serve(router(state).into_make_service())
        .await
        .context(ServeSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denial_message() {
        let denial = Denial::new(
            DenialReason::Invalid,
            vec![
                FieldError::invalid("spec.image", "invalid image reference"),
                FieldError::forbidden("spec.enableOpenKruise", "OpenKruise is disabled"),
            ],
        );
        assert_eq!(
            denial.message(),
            "spec.image: invalid image reference\nspec.enableOpenKruise: OpenKruise is disabled"
        );
        assert_eq!(denial.reason.code(), 422);
        assert_eq!(Denial::check(DenialReason::Forbidden, Vec::new()), Ok(()));
    }

    #[test]
    fn test_spec_patch() {
        let raw: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "risingwave.risingwavelabs.com/v1alpha1",
            "kind": "RisingWave",
            "metadata": {"name": "rw"},
            "spec": {"image": "risingwave"},
        }))
        .unwrap();

        assert_eq!(spec_patch(Some(&raw), json!({"image": "risingwave"})), Ok(None));

        let patch = spec_patch(Some(&raw), json!({"image": "risingwave:v2"}))
            .unwrap()
            .expect("spec changed");
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([{"op": "add", "path": "/spec", "value": {"image": "risingwave:v2"}}])
        );
    }
}
