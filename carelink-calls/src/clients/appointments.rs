use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;

use carelink_shared::errors::{AppError, AppResult, ErrorCode};

use crate::models::Appointment;

/// Read-only view of the appointment service.
#[async_trait]
pub trait AppointmentDirectory: Send + Sync {
    async fn find(&self, appointment_id: &str) -> AppResult<Option<Appointment>>;
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Appointment record as returned by `GET /internal/appointments/{id}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppointmentRecord {
    id: String,
    doctor_id: String,
    #[serde(alias = "doctorEmail")]
    doctor_identity: String,
    patient_id: String,
    #[serde(alias = "patientEmail")]
    patient_identity: String,
}

impl From<AppointmentRecord> for Appointment {
    fn from(r: AppointmentRecord) -> Self {
        Self {
            id: r.id,
            doctor_id: r.doctor_id,
            doctor_identity: r.doctor_identity,
            patient_id: r.patient_id,
            patient_identity: r.patient_identity,
        }
    }
}

#[derive(Clone)]
pub struct HttpAppointmentDirectory {
    http_client: reqwest::Client,
    base_url: Url,
}

impl HttpAppointmentDirectory {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("appointment service URL {base_url} cannot carry a path");
        }
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { http_client, base_url })
    }

    /// `{base}/internal/appointments/{id}` with the id encoded as a single path segment.
    /// `None` for ids that cannot name an appointment.
    fn appointment_url(&self, appointment_id: &str) -> Option<Url> {
        if appointment_id.is_empty() || appointment_id == "." || appointment_id == ".." {
            return None;
        }
        let mut url = self.base_url.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .ok()?
            .pop_if_empty()
            .extend(["internal", "appointments", appointment_id]);
        Some(url)
    }
}

#[async_trait]
impl AppointmentDirectory for HttpAppointmentDirectory {
    async fn find(&self, appointment_id: &str) -> AppResult<Option<Appointment>> {
        let Some(url) = self.appointment_url(appointment_id) else {
            return Ok(None);
        };
        let res = self.http_client.get(url).send().await.map_err(|e| {
            tracing::warn!(error = %e, appointment_id, "appointment service unreachable");
            AppError::new(ErrorCode::ServiceUnavailable, "appointment service unavailable")
        })?;

        match res.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let record = res.json::<AppointmentRecord>().await.map_err(|e| {
                    tracing::error!(error = %e, appointment_id, "failed to parse appointment response");
                    AppError::internal("invalid appointment service response")
                })?;
                Ok(Some(record.into()))
            }
            status => {
                tracing::error!(status = %status, appointment_id, "appointment lookup failed");
                Err(AppError::new(
                    ErrorCode::ServiceUnavailable,
                    "appointment service unavailable",
                ))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Static
// ---------------------------------------------------------------------------

/// Fixed set of appointments, for local runs without the appointment service and for tests.
#[derive(Debug, Default, Clone)]
pub struct StaticAppointmentDirectory {
    appointments: HashMap<String, Appointment>,
}

impl StaticAppointmentDirectory {
    pub fn new(appointments: impl IntoIterator<Item = Appointment>) -> Self {
        Self {
            appointments: appointments.into_iter().map(|a| (a.id.clone(), a)).collect(),
        }
    }
}

#[async_trait]
impl AppointmentDirectory for StaticAppointmentDirectory {
    async fn find(&self, appointment_id: &str) -> AppResult<Option<Appointment>> {
        Ok(self.appointments.get(appointment_id).cloned())
    }
}
