//! Consent prompts.
//!
//! The controller never decides on its own whether a session or a one-off
//! action is granted; it asks a [`ConsentPrompt`], which may be a terminal,
//! a UI bridge, or nothing at all ([`HeadlessConsent`]).

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;

use crate::channel::Origin;
use crate::error::KeychainError;
use crate::gateway::Fee;
use crate::policy::{Call, ContractAddress, PolicySet, TypedData};

/// What the user is being asked to allow.
#[derive(Debug, Clone)]
pub enum ConsentKind {
    /// Grant a session over `policies`; `register` also registers it on-chain.
    Session { policies: PolicySet, register: bool },
    Execute { calls: Vec<Call>, max_fee: Option<Fee> },
    SignMessage { typed_data: TypedData },
    DeployContract,
    SetDelegate { delegate: ContractAddress },
}

#[derive(Debug, Clone)]
pub struct ConsentRequest {
    pub origin: Origin,
    pub kind: ConsentKind,
}

impl ConsentRequest {
    /// Human-readable lines describing the request.
    pub fn summary(&self) -> Vec<String> {
        let mut lines = vec![format!("{} requests:", self.origin)];
        match &self.kind {
            ConsentKind::Session { policies, register } => {
                lines.push(if *register {
                    "a registered session allowed to:".to_string()
                } else {
                    "a session allowed to:".to_string()
                });
                let normalized = policies.normalize();
                if normalized.is_empty() {
                    lines.push("  (no policies)".to_string());
                }
                for policy in &normalized.policies {
                    lines.push(format!("  - {}", policy.describe()));
                }
                if normalized.verified {
                    lines.push("  (verified policies)".to_string());
                }
            }
            ConsentKind::Execute { calls, max_fee } => {
                lines.push(format!("a transaction with {} call(s):", calls.len()));
                for call in calls {
                    lines.push(format!(
                        "  - {} on {}",
                        call.entrypoint,
                        call.contract_address.short()
                    ));
                }
                if let Some(fee) = max_fee {
                    lines.push(format!("  max fee {fee}"));
                }
            }
            ConsentKind::SignMessage { typed_data } => {
                let primary = typed_data
                    .0
                    .get("primaryType")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                lines.push(format!("a signature over a {primary} message"));
            }
            ConsentKind::DeployContract => lines.push("deployment of this account".to_string()),
            ConsentKind::SetDelegate { delegate } => {
                lines.push(format!("delegating this account to {}", delegate.short()))
            }
        }
        lines
    }
}

/// The user's answer to an approved request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Approval {
    /// Session lifetime; the configured default when `None`.
    pub duration: Option<Duration>,
    /// Per-session fee cap (or the fee for a one-off transaction).
    pub max_fee: Option<Fee>,
    /// Requested policies with the user's `authorized` toggles applied.
    pub policies: Option<PolicySet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentDecision {
    Approve(Approval),
    Cancel,
    /// No way to ask the user right now.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Settings,
    Menu,
}

#[async_trait]
pub trait ConsentPrompt: Send + Sync {
    async fn request_consent(&self, request: &ConsentRequest) -> ConsentDecision;

    /// Show a keychain view. Prompts without UI cannot.
    async fn open_view(&self, view: View) -> Result<(), KeychainError> {
        Err(KeychainError::InteractionRequired(format!(
            "cannot open {view:?} without a user interface"
        )))
    }
}

/// Never able to ask; every consent-requiring request fails with
/// `USER_INTERACTION_REQUIRED`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessConsent;

#[async_trait]
impl ConsentPrompt for HeadlessConsent {
    async fn request_consent(&self, request: &ConsentRequest) -> ConsentDecision {
        tracing::info!(origin = %request.origin, "Consent needed but no prompt is available");
        ConsentDecision::Unavailable
    }
}

/// Asks on the controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConsent;

#[async_trait]
impl ConsentPrompt for TerminalConsent {
    async fn request_consent(&self, request: &ConsentRequest) -> ConsentDecision {
        let lines = request.summary();
        let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
            let mut stderr = std::io::stderr();
            writeln!(stderr)?;
            for line in &lines {
                writeln!(stderr, "{line}")?;
            }
            write!(stderr, "Approve? [y/N]: ")?;
            stderr.flush()?;

            let mut answer = String::new();
            std::io::stdin().read_line(&mut answer)?;
            Ok(answer)
        })
        .await;

        match answer {
            Ok(Ok(answer)) => match answer.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => ConsentDecision::Approve(Approval::default()),
                _ => ConsentDecision::Cancel,
            },
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Could not read consent from terminal");
                ConsentDecision::Unavailable
            }
            Err(e) => {
                tracing::warn!(error = %e, "Consent prompt task failed");
                ConsentDecision::Unavailable
            }
        }
    }

    async fn open_view(&self, view: View) -> Result<(), KeychainError> {
        tracing::info!(?view, "Keychain view requested");
        eprintln!("Requested keychain view: {view:?}");
        Ok(())
    }
}
