//! Collaborator capabilities consumed by the queue.
//!
//! The queue never drives the portal or owns company data itself. It depends on:
//! - a [`ConsultationRunner`] that logs in, navigates and scrapes messages
//! - a [`CompanyDirectory`] that knows which companies exist and their credentials

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fiscalq_core::CompanyId;

use crate::failure::FailureKind;

/// Portal login material for one company.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub login: String,
    pub password: String,
    pub state_registration: String,
}

impl core::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"***")
            .field("state_registration", &self.state_registration)
            .finish()
    }
}

/// One fiscal-account message retrieved from the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub subject: String,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Classified failure reported by the automation boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct ConsultationFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl ConsultationFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Capability that performs one consultation against the portal.
///
/// Implementations must classify every error into a [`FailureKind`]. The worker
/// additionally enforces `timeout` and turns panics into `Unknown` failures.
#[async_trait]
pub trait ConsultationRunner: Send + Sync + 'static {
    async fn run_consultation(
        &self,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Vec<Message>, ConsultationFailure>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("company directory unavailable: {0}")]
    Unavailable(String),
}

/// Read access to the company collaborator.
#[async_trait]
pub trait CompanyDirectory: Send + Sync + 'static {
    async fn company_exists(&self, company_id: CompanyId) -> Result<bool, DirectoryError>;

    /// `None` when the company is unknown or inactive.
    async fn credentials(&self, company_id: CompanyId) -> Result<Option<Credentials>, DirectoryError>;
}
