//! Admission pipeline for inbound commands.
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. message content (`Validator::validate_message`)
//! 2. user access for the action's permission
//! 3. room access (read)
//! 4. command shape for the resolved role
//! 5. rate limit for (identity, action)
//!
//! Only an admitted request consumes rate-limit quota.

use std::{sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    access::{AccessController, AccessReason, AccessTables},
    actions::ActionCatalog,
    config::{Config, SecurityConfig},
    domain::{IncomingCommand, Permission, Role},
    rate_limit::{RateLimitStatus, RateLimiter},
    validation::{ValidationReason, Validator},
    Result,
};

/// Why a command was turned away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Denial {
    AccessDenied(AccessReason),
    RateLimited { reset_time_ms: i64 },
    ValidationFailed(ValidationReason),
}

impl Denial {
    pub fn reason(&self) -> &'static str {
        match self {
            Denial::AccessDenied(r) => r.as_str(),
            Denial::RateLimited { .. } => "rate_limit_exceeded",
            Denial::ValidationFailed(r) => r.as_str(),
        }
    }

    /// Short text safe to show the caller. Never includes internals.
    pub fn user_notice(&self, now_ms: i64) -> String {
        match self {
            Denial::AccessDenied(AccessReason::UserBlocked) => "Your account is blocked.".to_string(),
            Denial::AccessDenied(AccessReason::RoomNotAllowed) => {
                "This room is not allowed to use the bot.".to_string()
            }
            Denial::AccessDenied(_) => "Access denied.".to_string(),
            Denial::RateLimited { reset_time_ms } => {
                let ms = (reset_time_ms - now_ms).max(0);
                let secs = (ms + 999) / 1000;
                format!("Too many requests. Try again in {} seconds.", secs.max(1))
            }
            Denial::ValidationFailed(ValidationReason::TooLong) => "Message is too long.".to_string(),
            Denial::ValidationFailed(ValidationReason::MissingArguments) => {
                "This command needs an argument.".to_string()
            }
            Denial::ValidationFailed(_) => "Message rejected.".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub denial: Option<Denial>,
    pub details: Option<String>,
    pub role: Option<Role>,
    pub rate_limit: Option<RateLimitStatus>,
}

impl Decision {
    pub fn reason(&self) -> &'static str {
        self.denial.as_ref().map_or("allowed", Denial::reason)
    }

    fn admit(role: Role, rate_limit: RateLimitStatus) -> Self {
        Self {
            allowed: true,
            denial: None,
            details: None,
            role: Some(role),
            rate_limit: Some(rate_limit),
        }
    }

    fn deny(denial: Denial, details: Option<String>, role: Option<Role>) -> Self {
        Self {
            allowed: false,
            denial: Some(denial),
            details,
            role,
            rate_limit: None,
        }
    }
}

struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Gatekeeper {
    validator: Validator,
    access: AccessController,
    limiter: Arc<RateLimiter>,
    default_limit: u32,
    window: Duration,
    sweep_interval: Duration,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Gatekeeper {
    pub fn new(config: &Config) -> Result<Self> {
        Self::from_parts(&config.security, config.access.clone())
    }

    pub fn from_parts(security: &SecurityConfig, tables: AccessTables) -> Result<Self> {
        let catalog = ActionCatalog::default().with_rate_limits(&security.rate_limits);
        let validator = Validator::new(security.max_message_length, catalog)?;

        Ok(Self {
            validator,
            access: AccessController::new(tables),
            limiter: Arc::new(RateLimiter::new(security.enabled)),
            default_limit: security.rate_limit_default,
            window: security.rate_limit_window,
            sweep_interval: security.sweep_interval,
            sweeper: Mutex::new(None),
        })
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn access(&self) -> &AccessController {
        &self.access
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Start the background window sweep. Idempotent.
    pub async fn start(&self) {
        let mut guard = self.sweeper.lock().await;
        if guard.is_some() || !self.limiter.is_enabled() {
            return;
        }

        let cancel = CancellationToken::new();
        let handle = self
            .limiter
            .spawn_sweeper(self.sweep_interval, cancel.clone());
        *guard = Some(Sweeper { cancel, handle });
        info!(every_ms = self.sweep_interval.as_millis() as u64, "rate-limit sweep started");
    }

    /// Stop the sweep and wait for it to exit.
    pub async fn shutdown(&self) {
        let Some(sweeper) = self.sweeper.lock().await.take() else {
            return;
        };
        sweeper.cancel.cancel();
        if let Err(e) = sweeper.handle.await {
            warn!(error = %e, "rate-limit sweeper did not exit cleanly");
        }
    }

    pub fn check(&self, cmd: &IncomingCommand) -> Decision {
        self.check_at(cmd, self.limiter.now_ms())
    }

    pub fn check_at(&self, cmd: &IncomingCommand, now_ms: i64) -> Decision {
        let identity = &cmd.identity;
        let action = cmd.action.as_str();

        let message = self.validator.validate_message(cmd.raw_text.as_deref());
        if !message.valid {
            warn!(%identity, action, reason = message.reason.as_str(), "message rejected");
            return Decision::deny(Denial::ValidationFailed(message.reason), message.details, None);
        }

        let policy = self.validator.catalog().get(action);
        let user = self.access.check_user_access(identity, &policy.permission);
        if !user.allowed {
            return Decision::deny(Denial::AccessDenied(user.reason), None, user.role);
        }
        let role = user.role.unwrap_or(Role::Guest);

        let room = self.access.check_room_access(&cmd.room_id, &Permission::READ);
        if !room.allowed {
            return Decision::deny(Denial::AccessDenied(room.reason), None, Some(role));
        }

        let command = self.validator.validate_command(action, &cmd.args, role);
        if !command.valid {
            let denial = match command.reason {
                ValidationReason::InsufficientPermissions => {
                    Denial::AccessDenied(AccessReason::InsufficientPermissions)
                }
                other => Denial::ValidationFailed(other),
            };
            warn!(%identity, action, reason = denial.reason(), "command rejected");
            return Decision::deny(denial, command.details, Some(role));
        }

        let limit = policy.rate_limit.unwrap_or(self.default_limit);
        let status = self
            .limiter
            .check_at(identity, action, limit, self.window, now_ms);
        if !status.allowed {
            return Decision {
                rate_limit: Some(status),
                ..Decision::deny(
                    Denial::RateLimited {
                        reset_time_ms: status.reset_time_ms,
                    },
                    None,
                    Some(role),
                )
            };
        }

        debug!(%identity, action, %role, remaining = status.remaining, "command admitted");
        Decision::admit(role, status)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::domain::{Identity, RoomId};

    fn gatekeeper(security: SecurityConfig) -> Gatekeeper {
        let mut t = AccessTables::default();
        t.roles.insert(Identity::new("@alice:x"), Role::User);
        t.roles.insert(Identity::new("@root:x"), Role::Admin);
        t.roles.insert(Identity::new("@blocked:x"), Role::Admin);
        t.blocked.insert(Identity::new("@blocked:x"));
        Gatekeeper::from_parts(&security, t).unwrap()
    }

    fn cmd(identity: &str, text: &str) -> IncomingCommand {
        IncomingCommand::from_text(Identity::new(identity), RoomId::new("!room:x"), text, "!")
            .unwrap()
    }

    #[test]
    fn blocked_identity_is_denied_before_anything_else() {
        let gk = gatekeeper(SecurityConfig::default());
        let d = gk.check_at(&cmd("@blocked:x", "!help"), 0);
        assert!(!d.allowed);
        assert_eq!(d.denial, Some(Denial::AccessDenied(AccessReason::UserBlocked)));
        assert_eq!(d.reason(), "user_blocked");
    }

    #[test]
    fn guest_cannot_ask_but_can_get_help() {
        let gk = gatekeeper(SecurityConfig::default());
        let d = gk.check_at(&cmd("@stranger:x", "!ask what is rust"), 0);
        assert!(!d.allowed);
        assert_eq!(
            d.denial,
            Some(Denial::AccessDenied(AccessReason::InsufficientPermissions))
        );
        assert_eq!(d.role, Some(Role::Guest));

        assert!(gk.check_at(&cmd("@stranger:x", "!help"), 0).allowed);
    }

    #[test]
    fn fourth_request_within_window_is_rate_limited() {
        let gk = gatekeeper(SecurityConfig {
            rate_limit_default: 3,
            ..SecurityConfig::default()
        });
        let t0 = 1_000_000;
        for i in 0..3 {
            let d = gk.check_at(&cmd("@alice:x", "!ping"), t0 + i);
            assert!(d.allowed, "request {i}");
        }

        let d = gk.check_at(&cmd("@alice:x", "!ping"), t0 + 10);
        assert!(!d.allowed);
        assert_eq!(
            d.denial,
            Some(Denial::RateLimited {
                reset_time_ms: t0 + 60_000
            })
        );
        assert_eq!(d.rate_limit.map(|s| s.remaining), Some(0));
        assert_eq!(
            d.denial.unwrap().user_notice(t0 + 10),
            "Too many requests. Try again in 60 seconds."
        );
    }

    #[test]
    fn per_action_override_applies() {
        let gk = gatekeeper(SecurityConfig {
            rate_limits: HashMap::from([("ask".to_string(), 1)]),
            ..SecurityConfig::default()
        });
        assert!(gk.check_at(&cmd("@alice:x", "!ask one"), 0).allowed);
        assert!(!gk.check_at(&cmd("@alice:x", "!ask two"), 1).allowed);
        assert!(gk.check_at(&cmd("@alice:x", "!ping"), 2).allowed);
    }

    #[test]
    fn overlong_message_is_rejected_as_too_long() {
        let gk = gatekeeper(SecurityConfig::default());
        let text = format!("!ask {}", "ab ".repeat(2000));
        let d = gk.check_at(&cmd("@alice:x", &text), 0);
        assert_eq!(
            d.denial,
            Some(Denial::ValidationFailed(ValidationReason::TooLong))
        );
        assert!(d.details.is_some());
    }

    #[test]
    fn missing_arguments_are_a_validation_failure() {
        let gk = gatekeeper(SecurityConfig::default());
        let d = gk.check_at(&cmd("@alice:x", "!ask"), 0);
        assert_eq!(
            d.denial,
            Some(Denial::ValidationFailed(ValidationReason::MissingArguments))
        );
    }

    #[test]
    fn unknown_actions_are_admin_only() {
        let gk = gatekeeper(SecurityConfig::default());
        assert!(!gk.check_at(&cmd("@alice:x", "!drop_tables"), 0).allowed);
        assert!(gk.check_at(&cmd("@root:x", "!drop_tables"), 0).allowed);
    }

    #[test]
    fn denied_checks_do_not_consume_quota() {
        let gk = gatekeeper(SecurityConfig {
            rate_limit_default: 1,
            ..SecurityConfig::default()
        });
        let _ = gk.check_at(&cmd("@alice:x", "!ask"), 0);
        assert!(gk.check_at(&cmd("@alice:x", "!ask something"), 1).allowed);
    }

    #[test]
    fn room_allow_list_is_checked_after_user_access() {
        let mut t = AccessTables::default();
        t.roles.insert(Identity::new("@alice:x"), Role::User);
        t.rooms.insert(RoomId::new("!ok:x"), vec![Permission::READ]);
        let gk = Gatekeeper::from_parts(&SecurityConfig::default(), t).unwrap();

        let elsewhere = gk.check_at(&cmd("@alice:x", "!ping"), 0);
        assert_eq!(
            elsewhere.denial,
            Some(Denial::AccessDenied(AccessReason::RoomNotAllowed))
        );

        let ok = IncomingCommand::from_text(Identity::new("@alice:x"), RoomId::new("!ok:x"), "!ping", "!")
            .unwrap();
        assert!(gk.check_at(&ok, 0).allowed);
    }

    #[test]
    fn disabled_limiter_never_rate_limits() {
        let gk = gatekeeper(SecurityConfig {
            enabled: false,
            rate_limit_default: 1,
            ..SecurityConfig::default()
        });
        for t in 0..20 {
            assert!(gk.check_at(&cmd("@alice:x", "!ping"), t).allowed);
        }
    }

    #[test]
    fn notices_do_not_leak_details() {
        let notice = Denial::ValidationFailed(ValidationReason::SuspiciousContent).user_notice(0);
        assert_eq!(notice, "Message rejected.");
        assert_eq!(
            Denial::RateLimited { reset_time_ms: 1_500 }.user_notice(1_000),
            "Too many requests. Try again in 1 seconds."
        );
    }

    #[tokio::test]
    async fn start_and_shutdown_are_idempotent() {
        let gk = gatekeeper(SecurityConfig {
            sweep_interval: Duration::from_millis(5),
            ..SecurityConfig::default()
        });
        gk.start().await;
        gk.start().await;
        gk.shutdown().await;
        gk.shutdown().await;
    }
}
