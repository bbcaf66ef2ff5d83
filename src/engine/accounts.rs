use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tracing::info;
use ulid::Ulid;

use crate::audit::TimelineEvent;
use crate::limits::*;
use crate::model::*;

use super::conflict::{validate_amount, validate_len};
use super::{now_ms, Engine, EngineError, SharedUser};

const MS_PER_DAY: Ms = 86_400_000;
const DEFAULT_DISCOUNT_REASON: &str = "Manual admin update";

/// Roles `actor` may hand out when creating an account.
fn may_grant(actor: Role, role: Role) -> bool {
    match actor {
        Role::Owner => true,
        Role::SeniorAdmin => matches!(role, Role::Admin | Role::User),
        Role::Admin => role == Role::User,
        Role::User => false,
    }
}

/// Role change rules: owner assigns anything; senior_admin manages admins and users only.
fn may_change_role(actor: Role, current: Role, requested: Role) -> Result<(), EngineError> {
    match actor {
        Role::Owner => Ok(()),
        Role::SeniorAdmin => {
            if matches!(current, Role::Owner | Role::SeniorAdmin) {
                return Err(EngineError::Forbidden(
                    "senior_admin cannot change an owner or senior_admin",
                ));
            }
            if !matches!(requested, Role::Admin | Role::User) {
                return Err(EngineError::Forbidden("senior_admin may only assign admin or user"));
            }
            Ok(())
        }
        Role::Admin | Role::User => Err(EngineError::Forbidden("only owner or senior_admin may change roles")),
    }
}

fn validate_email(email: &str) -> Result<(), EngineError> {
    validate_len(email, MAX_EMAIL_LEN, "email too long")?;
    if is_email(email) {
        Ok(())
    } else {
        Err(EngineError::Invalid(format!("invalid email: {email}")))
    }
}

fn require_staff(actor: &Actor, action: &'static str) -> Result<(), EngineError> {
    if actor.is_privileged() {
        Ok(())
    } else {
        Err(EngineError::Forbidden(action))
    }
}

impl Engine {
    pub(super) fn user_handle(&self, id: &Ulid) -> Result<SharedUser, EngineError> {
        self.get_user(id)
            .ok_or_else(|| EngineError::NotFound(format!("user {id}")))
    }

    /// Create an account.
    ///
    /// Staff may create roles they are allowed to grant. Without a staff
    /// requester, only self-registration is possible: the session login must be
    /// the new email and the role must be `user`.
    pub async fn register_user(
        &self,
        requester: Option<&Actor>,
        login: &str,
        id: Ulid,
        email: String,
        name: String,
        role: Role,
    ) -> Result<User, EngineError> {
        let allowed = match requester {
            Some(actor) if actor.is_privileged() => may_grant(actor.role, role),
            _ => role == Role::User && login.trim().eq_ignore_ascii_case(email.trim()),
        };
        if !allowed {
            return Err(EngineError::Forbidden("not allowed to create this account"));
        }
        let user = self.insert_user(id, email, name, role).await?;
        let actor = requester.cloned().unwrap_or_else(|| Actor::from(&user));
        self.audit.log_event(
            TimelineEvent::new(
                &actor,
                user.id.to_string(),
                "user",
                "user_registered",
                format!("user {} registered as {}", user.email, user.role),
            )
            .with("role", user.role.as_str()),
        );
        Ok(user)
    }

    /// Create the configured owner account if no account uses `email` yet.
    pub async fn bootstrap_owner(&self, email: &str, name: &str) -> Result<Option<User>, EngineError> {
        if let Some(existing) = self.user_id_by_email(email) {
            info!(user = %existing, "owner account {email} already present");
            return Ok(None);
        }
        let user = self
            .insert_user(Ulid::new(), email.to_string(), name.to_string(), Role::Owner)
            .await?;
        info!(user = %user.id, "bootstrapped owner account {email}");
        self.audit.log_event(TimelineEvent::new(
            &Actor::from(&user),
            user.id.to_string(),
            "user",
            "user_registered",
            format!("owner {email} bootstrapped"),
        ));
        Ok(Some(user))
    }

    async fn insert_user(&self, id: Ulid, email: String, name: String, role: Role) -> Result<User, EngineError> {
        let email = email.trim().to_string();
        validate_email(&email)?;
        validate_len(&name, MAX_NAME_LEN, "name too long")?;
        let _commit = self.commit_gate.read().await;
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("user {id}")));
        }
        // Reserve the email before the WAL write so concurrent registrations cannot both win.
        let key = email.to_lowercase();
        match self.emails.entry(key.clone()) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(format!("email {email}"))),
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let user = User::new(id, email, name, role, now_ms());
        let event = Event::UserRegistered { user: user.clone() };
        if let Err(e) = self.wal_append(&event).await {
            self.emails.remove(&key);
            return Err(e);
        }
        self.users.insert(id, Arc::new(Mutex::new(user.clone())));
        Ok(user)
    }

    pub async fn change_role(&self, actor: &Actor, user_id: Ulid, role: Role) -> Result<User, EngineError> {
        let user = self.user_handle(&user_id)?;
        let _serial = self.role_changes.lock().await;
        let current = user.lock().await.role;
        may_change_role(actor.role, current, role)?;
        if current == role {
            return Ok(user.lock().await.clone());
        }
        if current == Role::Owner && self.count_owners().await <= 1 {
            return Err(EngineError::Invalid("cannot demote the last owner".into()));
        }

        let _commit = self.commit_gate.read().await;
        let mut guard = user.lock().await;
        let event = Event::RoleChanged { user_id, role };
        self.persist_user_event(&mut guard, &event).await?;
        self.audit.log_event(
            TimelineEvent::new(
                actor,
                user_id.to_string(),
                "user",
                "role_change",
                format!("role of {} changed from {current} to {role}", guard.email),
            )
            .with("old_role", current.as_str())
            .with("new_role", role.as_str()),
        );
        Ok(guard.clone())
    }

    /// Locks one user at a time; callers serialize role changes.
    async fn count_owners(&self) -> usize {
        let users: Vec<SharedUser> = self.users.iter().map(|e| e.value().clone()).collect();
        let mut owners = 0;
        for user in users {
            if user.lock().await.role == Role::Owner {
                owners += 1;
            }
        }
        owners
    }

    pub async fn deposit(&self, actor: &Actor, user_id: Ulid, amount: Money) -> Result<User, EngineError> {
        require_staff(actor, "only staff may deposit funds")?;
        if amount <= Money::ZERO {
            return Err(EngineError::Invalid("deposit must be positive".into()));
        }
        validate_amount(amount)?;
        let user = self.user_handle(&user_id)?;
        let _commit = self.commit_gate.read().await;
        let mut guard = user.lock().await;
        let event = Event::BalanceAdjusted { user_id, delta: amount };
        self.persist_user_event(&mut guard, &event).await?;
        self.audit.log_event(
            TimelineEvent::new(
                actor,
                user_id.to_string(),
                "user",
                "balance_deposit",
                format!("deposited {amount} to {}", guard.email),
            )
            .with("amount", amount.as_f64())
            .with("balance", guard.balance.as_f64()),
        );
        Ok(guard.clone())
    }

    pub async fn set_credit_limit(&self, actor: &Actor, user_id: Ulid, limit: Money) -> Result<User, EngineError> {
        require_staff(actor, "only staff may set credit limits")?;
        if limit < Money::ZERO {
            return Err(EngineError::Invalid("credit limit must not be negative".into()));
        }
        validate_amount(limit)?;
        let user = self.user_handle(&user_id)?;
        let _commit = self.commit_gate.read().await;
        let mut guard = user.lock().await;
        let previous = guard.credit_limit;
        let event = Event::CreditLimitSet { user_id, limit };
        self.persist_user_event(&mut guard, &event).await?;
        self.audit.log_event(
            TimelineEvent::new(
                actor,
                user_id.to_string(),
                "user",
                "credit_limit_change",
                format!("credit limit of {} set to {limit}", guard.email),
            )
            .with("old_limit", previous.as_f64())
            .with("new_limit", limit.as_f64()),
        );
        Ok(guard.clone())
    }

    /// Replace the user's subscription with a fresh, unfrozen one.
    pub async fn assign_subscription(
        &self,
        actor: &Actor,
        user_id: Ulid,
        hours: Hours,
        plan: Option<String>,
    ) -> Result<User, EngineError> {
        require_staff(actor, "only staff may assign subscriptions")?;
        if hours < Hours::ZERO {
            return Err(EngineError::Invalid("subscription hours must not be negative".into()));
        }
        if hours.minutes() > MAX_SUBSCRIPTION_MINUTES {
            return Err(EngineError::LimitExceeded("subscription too large"));
        }
        if let Some(plan) = &plan {
            validate_len(plan, MAX_PLAN_LEN, "plan name too long")?;
        }
        let user = self.user_handle(&user_id)?;
        let _commit = self.commit_gate.read().await;
        let mut guard = user.lock().await;
        let event = Event::SubscriptionAssigned {
            user_id,
            subscription: Subscription::new(hours, plan.clone()),
        };
        self.persist_user_event(&mut guard, &event).await?;
        self.audit.log_event(
            TimelineEvent::new(
                actor,
                user_id.to_string(),
                "subscription",
                "subscription_assigned",
                format!("{hours}h subscription assigned to {}", guard.email),
            )
            .with("hours", hours.as_f64())
            .with("plan", plan.unwrap_or_default()),
        );
        Ok(guard.clone())
    }

    /// Set the user's personal discount. Each change is kept in the user's
    /// discount history and recorded in the timeline.
    pub async fn set_personal_discount(
        &self,
        actor: &Actor,
        user_id: Ulid,
        percent: u8,
        reason: Option<String>,
    ) -> Result<User, EngineError> {
        require_staff(actor, "only staff may set discounts")?;
        if percent > 100 {
            return Err(EngineError::Invalid("discount must be between 0 and 100 percent".into()));
        }
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_DISCOUNT_REASON.to_string());
        validate_len(&reason, MAX_REASON_LEN, "discount reason too long")?;
        let user = self.user_handle(&user_id)?;
        let _commit = self.commit_gate.read().await;
        let mut guard = user.lock().await;
        let old_percent = guard.personal_discount_percent;
        let event = Event::DiscountSet {
            user_id,
            change: DiscountChange {
                old_percent,
                new_percent: percent,
                reason: reason.clone(),
                changed_by: actor.name.clone(),
                at: now_ms(),
            },
        };
        self.persist_user_event(&mut guard, &event).await?;
        info!(user = %user_id, "discount {old_percent}% -> {percent}%");
        self.audit.log_event(
            TimelineEvent::new(
                actor,
                user_id.to_string(),
                "user",
                "discount_change",
                format!("Changed discount from {old_percent}% to {percent}%. Reason: {reason}"),
            )
            .with("old_percent", old_percent)
            .with("new_percent", percent)
            .with("reason", reason),
        );
        Ok(guard.clone())
    }

    /// Freezing lasts `freeze_days` from now.
    pub async fn set_subscription_frozen(
        &self,
        actor: &Actor,
        user_id: Ulid,
        frozen: bool,
    ) -> Result<User, EngineError> {
        require_staff(actor, "only staff may freeze subscriptions")?;
        let user = self.user_handle(&user_id)?;
        let _commit = self.commit_gate.read().await;
        let mut guard = user.lock().await;
        let Some(sub) = guard.subscription.as_ref() else {
            return Err(EngineError::Invalid(format!("{} has no subscription", guard.email)));
        };
        if sub.frozen == frozen {
            return Ok(guard.clone());
        }
        let frozen_until = frozen.then(|| now_ms() + self.settings.freeze_days * MS_PER_DAY);
        let event = Event::SubscriptionFrozen {
            user_id,
            frozen,
            frozen_until,
        };
        self.persist_user_event(&mut guard, &event).await?;
        let (event_type, verb) = if frozen {
            ("subscription_frozen", "frozen")
        } else {
            ("subscription_unfrozen", "unfrozen")
        };
        let mut audit = TimelineEvent::new(
            actor,
            user_id.to_string(),
            "subscription",
            event_type,
            format!("subscription of {} {verb}", guard.email),
        );
        if let Some(until) = frozen_until {
            audit = audit.with("frozen_until", until);
        }
        self.audit.log_event(audit);
        Ok(guard.clone())
    }
}
