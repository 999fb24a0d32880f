//! Failure classification decided at the automation boundary.

use serde::{Deserialize, Serialize};

use fiscalq_core::DomainError;

/// Closed set of consultation failure kinds.
///
/// The automation collaborator classifies its error once; the retry policy only
/// ever looks at this kind, never at portal error text.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Network,
    PortalMaintenance,
    InvalidCredentials,
    AccountLocked,
    CaptchaBlocked,
    /// Malformed response or business-logic rejection by the portal.
    Rejected,
    /// Anything unclassified, including crashes of the automation itself.
    Unknown,
}

impl FailureKind {
    pub const ALL: [FailureKind; 8] = [
        FailureKind::Timeout,
        FailureKind::Network,
        FailureKind::PortalMaintenance,
        FailureKind::InvalidCredentials,
        FailureKind::AccountLocked,
        FailureKind::CaptchaBlocked,
        FailureKind::Rejected,
        FailureKind::Unknown,
    ];

    /// Transient failures are expected to resolve on their own and may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            FailureKind::Timeout
            | FailureKind::Network
            | FailureKind::PortalMaintenance
            | FailureKind::Unknown => true,
            FailureKind::InvalidCredentials
            | FailureKind::AccountLocked
            | FailureKind::CaptchaBlocked
            | FailureKind::Rejected => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Network => "network",
            FailureKind::PortalMaintenance => "portal_maintenance",
            FailureKind::InvalidCredentials => "invalid_credentials",
            FailureKind::AccountLocked => "account_locked",
            FailureKind::CaptchaBlocked => "captcha_blocked",
            FailureKind::Rejected => "rejected",
            FailureKind::Unknown => "unknown",
        }
    }

    /// Short explanation for operators inspecting a failed job.
    pub fn operator_message(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "the portal took too long to respond",
            FailureKind::Network => "could not reach the portal",
            FailureKind::PortalMaintenance => "the portal is under maintenance",
            FailureKind::InvalidCredentials => {
                "login rejected: check the company's login and password"
            }
            FailureKind::AccountLocked => "the portal account is locked",
            FailureKind::CaptchaBlocked => {
                "the portal detected automation or requires a CAPTCHA verification"
            }
            FailureKind::Rejected => "the portal rejected the consultation",
            FailureKind::Unknown => "unexpected error while running the consultation",
        }
    }
}

impl core::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for FailureKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown failure kind: {s}")))
    }
}
