//! Caller authorization.
//!
//! A synchronous policy decision over the `auth_request` metadata and the
//! configured mode. Every decision carries a machine-readable strategy
//! token and is logged on the audit target.

use voice_bridge_config::{AuthorizationConfig, AuthorizationMode};
use voice_bridge_core::{CallId, CallerInfo};

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthDecision {
    pub authorized: bool,
    /// Which path produced the decision.
    pub strategy: &'static str,
    pub reason: Option<String>,
}

impl AuthDecision {
    fn accept(strategy: &'static str) -> Self {
        Self {
            authorized: true,
            strategy,
            reason: None,
        }
    }

    fn reject(strategy: &'static str, reason: impl Into<String>) -> Self {
        Self {
            authorized: false,
            strategy,
            reason: Some(reason.into()),
        }
    }
}

/// Decide whether a caller may proceed.
pub fn authorize(
    config: &AuthorizationConfig,
    metadata: &CallerInfo,
    call_id: &CallId,
) -> AuthDecision {
    let decision = decide(config, metadata);
    tracing::info!(
        target: "audit",
        call_id = %call_id,
        authorized = decision.authorized,
        strategy = decision.strategy,
        reason = decision.reason.as_deref().unwrap_or(""),
        "Authorization decision"
    );
    decision
}

fn decide(config: &AuthorizationConfig, metadata: &CallerInfo) -> AuthDecision {
    if config.mode == AuthorizationMode::Disabled {
        return AuthDecision::reject("disabled", "voice calling is disabled");
    }

    let Some(tenant_id) = metadata.tenant_id.as_deref().filter(|t| !t.is_empty()) else {
        return AuthDecision::reject("validation-failed", "missing tenant id");
    };
    let Some(user_id) = metadata.user_id.as_deref().filter(|u| !u.is_empty()) else {
        return AuthDecision::reject("validation-failed", "missing user id");
    };

    if metadata.is_pstn() && !config.allow_pstn {
        return AuthDecision::reject("pstn-blocked", "PSTN callers are not allowed");
    }

    match config.mode {
        AuthorizationMode::Disabled => unreachable!("handled above"),
        AuthorizationMode::Open => AuthDecision::accept("open"),
        AuthorizationMode::Allowlist => {
            let user = user_id.to_lowercase();
            let upn = metadata
                .user_principal_name
                .as_deref()
                .map(str::to_lowercase);
            let allowed = config.allow_from.iter().any(|entry| {
                let entry = entry.to_lowercase();
                entry == user || upn.as_deref() == Some(entry.as_str())
            });
            if allowed {
                AuthDecision::accept("allowlist")
            } else {
                AuthDecision::reject("allowlist", "caller not on the allow list")
            }
        }
        AuthorizationMode::TenantOnly => {
            if config.allowed_tenants.iter().any(|t| t == tenant_id) {
                AuthDecision::accept("tenant-only")
            } else {
                AuthDecision::reject("tenant-only", "tenant not allowed")
            }
        }
    }
}
