//! Account service
//!
//! Registration, credential checks and profile maintenance. Balances are
//! never touched here; money moves only through the entitlement engine.

use crate::config::{
    MAX_FULL_NAME_LENGTH, MAX_USERNAME_LENGTH, MIN_PASSWORD_LENGTH, MIN_USERNAME_LENGTH,
};
use crate::crypto;
use crate::database::models::{
    Account, ActivityKind, PageRequest, Paged, RegisterRequest, Role, UpdateProfileRequest,
};
use crate::database::repository::accounts;
use crate::database::Repository;
use crate::error::{AppError, FieldError, Result};
use crate::services::access::{self, Actor};
use crate::services::activity::ActivityRecorder;
use serde_json::json;

fn is_username_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// `local@domain.tld` with no whitespace and exactly one `@`
fn is_plausible_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
}

#[derive(Clone)]
pub struct AccountService {
    repo: Repository,
    activity: ActivityRecorder,
}

impl AccountService {
    pub fn new(repo: Repository, activity: ActivityRecorder) -> Self {
        Self { repo, activity }
    }

    /// Self-service registration; new accounts are regular users
    pub async fn register(&self, req: RegisterRequest) -> Result<Account> {
        self.register_as(req, Role::User).await
    }

    /// Create an account with an explicit role (seeding and admin provisioning)
    pub async fn register_as(&self, req: RegisterRequest, role: Role) -> Result<Account> {
        validate_registration(&req)?;

        let hash = crypto::hash_password(&req.password)?;

        let account = self
            .repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    let (username_taken, email_taken) =
                        accounts::username_or_email_taken(conn, &req.username, &req.email).await?;
                    if username_taken {
                        return Err(AppError::Conflict("Username already exists".to_string()));
                    }
                    if email_taken {
                        return Err(AppError::Conflict("Email already exists".to_string()));
                    }

                    let account = accounts::insert_account(conn, &req, &hash, role).await?;

                    ActivityRecorder::record_in(
                        conn,
                        &account.id,
                        ActivityKind::Register,
                        json!({ "username": account.username, "role": role }),
                    )
                    .await;

                    Ok(account)
                })
            })
            .await?;

        tracing::info!("Registered account {} ({:?})", account.username, role);
        Ok(account)
    }

    /// Check credentials by username or email
    pub async fn authenticate(&self, login: &str, password: &str) -> Result<Account> {
        let mut conn = self.repo.connection().await?;

        let account = match accounts::find_by_login(&mut conn, login).await? {
            Some(account) => account,
            None => {
                tracing::debug!("Login failed for unknown account");
                return Err(invalid_credentials());
            }
        };

        if !crypto::verify_password(password, &account.password_hash)? {
            tracing::debug!("Login failed for {}", account.username);
            return Err(invalid_credentials());
        }

        if !account.is_active {
            return Err(AppError::Unauthorized("Account is deactivated".to_string()));
        }

        accounts::touch_last_login(&mut conn, &account.id).await?;
        drop(conn);

        self.activity
            .record(&account.id, ActivityKind::Login, json!({}))
            .await;

        tracing::info!("Account {} logged in", account.username);
        self.get(&account.id).await
    }

    pub async fn get(&self, account_id: &str) -> Result<Account> {
        let mut conn = self.repo.connection().await?;
        accounts::get_account(&mut conn, account_id).await
    }

    pub async fn update_profile(
        &self,
        actor: &Actor,
        req: UpdateProfileRequest,
    ) -> Result<Account> {
        if let Some(name) = &req.full_name {
            let name = name.trim();
            if name.is_empty() || name.chars().count() > MAX_FULL_NAME_LENGTH {
                return Err(AppError::invalid_field(
                    "full_name",
                    format!("Full name must be 1 to {} characters", MAX_FULL_NAME_LENGTH),
                ));
            }
        }

        let mut conn = self.repo.connection().await?;
        let account = accounts::update_profile(&mut conn, &actor.account_id, &req).await?;
        drop(conn);

        self.activity
            .record(&account.id, ActivityKind::UpdateProfile, json!({}))
            .await;

        Ok(account)
    }

    /// Administrator change of role and/or active flag
    pub async fn set_role_and_status(
        &self,
        actor: &Actor,
        account_id: &str,
        role: Option<Role>,
        is_active: Option<bool>,
    ) -> Result<Account> {
        access::ensure_moderator(actor)?;

        let demotes_self = is_active == Some(false) || role.is_some_and(|r| r != Role::Admin);
        if account_id == actor.account_id && demotes_self {
            return Err(AppError::InvalidState(
                "Administrators cannot demote or deactivate themselves".to_string(),
            ));
        }

        let mut conn = self.repo.connection().await?;
        let account = accounts::set_role_and_status(&mut conn, account_id, role, is_active).await?;
        drop(conn);

        self.activity
            .record(
                &actor.account_id,
                ActivityKind::UpdateAccount,
                json!({ "account_id": account_id, "role": role, "is_active": is_active }),
            )
            .await;

        tracing::info!(
            "Account {} updated by {}: role {:?}, active {}",
            account.username,
            actor.account_id,
            account.role,
            account.is_active
        );
        Ok(account)
    }

    pub async fn list(
        &self,
        actor: &Actor,
        role: Option<Role>,
        page: PageRequest,
    ) -> Result<Paged<Account>> {
        access::ensure_moderator(actor)?;

        let mut conn = self.repo.connection().await?;
        let (items, total) = accounts::list_accounts(&mut conn, role, page).await?;
        Ok(Paged::new(items, total, page))
    }
}

fn invalid_credentials() -> AppError {
    AppError::Unauthorized("Invalid username or password".to_string())
}

fn validate_registration(req: &RegisterRequest) -> Result<()> {
    let mut errors = Vec::new();

    let username = req.username.trim();
    let username_len = username.chars().count();
    if !(MIN_USERNAME_LENGTH..=MAX_USERNAME_LENGTH).contains(&username_len) {
        errors.push(FieldError::new(
            "username",
            format!(
                "Username must be {} to {} characters",
                MIN_USERNAME_LENGTH, MAX_USERNAME_LENGTH
            ),
        ));
    } else if !username.chars().all(is_username_char) {
        errors.push(FieldError::new(
            "username",
            "Username may only contain letters, digits, dots and underscores",
        ));
    }

    if !is_plausible_email(req.email.trim()) {
        errors.push(FieldError::new("email", "Email is not valid"));
    }

    if req.password.chars().count() < MIN_PASSWORD_LENGTH {
        errors.push(FieldError::new(
            "password",
            format!("Password must be at least {} characters", MIN_PASSWORD_LENGTH),
        ));
    }

    let full_name = req.full_name.trim();
    if full_name.is_empty() || full_name.chars().count() > MAX_FULL_NAME_LENGTH {
        errors.push(FieldError::new(
            "full_name",
            format!("Full name must be 1 to {} characters", MAX_FULL_NAME_LENGTH),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::ValidationFailed(errors))
    }
}
