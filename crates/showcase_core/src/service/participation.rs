//! Participation requests relayed to a project's responsible member.
//!
//! # Responsibility
//! - Validate an interested visitor's request.
//! - Compose the outbound message and hand it to a `Mailer`.
//!
//! # Invariants
//! - All five request fields are required and non-blank.
//! - Both email addresses must look like `local@domain.tld`.
//! - Nothing is persisted; delivery is the mailer's concern.

use crate::model::validation::ValidationError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::fmt::{Display, Formatter};

/// Sender shown on outbound participation messages.
pub const PARTICIPATION_SENDER: &str = "Project Showcase <noreply@showcase.local>";

static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex")
});

/// Request body of the participation form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ParticipationRequest {
    pub project_title: String,
    pub responsible_email: String,
    pub requester_name: String,
    pub requester_email: String,
    pub message: String,
}

/// Plain-text message ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub from: String,
    pub to: String,
    pub reply_to: String,
    pub subject: String,
    pub body: String,
}

/// Transport failure reported by a `Mailer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailError(pub String);

impl Display for MailError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MailError {}

/// Outbound mail transport handle.
pub trait Mailer: Send + Sync {
    fn send(&self, message: &OutboundMessage) -> Result<(), MailError>;
}

/// Validates one participation request.
///
/// # Errors
/// - `MissingField` for the first blank field, in declaration order.
/// - `InvalidEmail` when an address does not look like one.
pub fn validate_participation(request: &ParticipationRequest) -> Result<(), ValidationError> {
    let required = [
        ("project_title", &request.project_title),
        ("responsible_email", &request.responsible_email),
        ("requester_name", &request.requester_name),
        ("requester_email", &request.requester_email),
        ("message", &request.message),
    ];
    if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
        return Err(ValidationError::MissingField(*field));
    }

    for address in [&request.responsible_email, &request.requester_email] {
        if !EMAIL_REGEX.is_match(address.trim()) {
            return Err(ValidationError::InvalidEmail(address.trim().to_string()));
        }
    }
    Ok(())
}

pub fn compose_participation_message(request: &ParticipationRequest) -> OutboundMessage {
    let title = request.project_title.trim();
    let requester_email = request.requester_email.trim();
    let body = format!(
        "New participation request\n\n\
         Project: {title}\n\
         Name: {name}\n\
         Contact email: {requester_email}\n\n\
         Message:\n{message}\n\n\
         To answer, write to: {requester_email}\n",
        name = request.requester_name.trim(),
        message = request.message.trim_end(),
    );

    OutboundMessage {
        from: PARTICIPATION_SENDER.to_string(),
        to: request.responsible_email.trim().to_string(),
        reply_to: requester_email.to_string(),
        subject: format!("New participation request - {title}"),
        body,
    }
}
