//! Entitlement engine
//!
//! Decides whether an account may download a document or library file and
//! moves money when a purchase is needed. Every balance change in the crate
//! goes through this service: the balance update, its ledger entry and any
//! counter it implies commit together or not at all.
//!
//! Each operation runs as a retrying unit of work. The balance is swapped
//! with a compare-and-swap update, so two concurrent charges against the same
//! account can never both pass the funds check on a stale balance.

use crate::database::models::{
    Account, ActivityKind, Document, EntryDetail, EntryKind, EntryStatus, KindTotal, LedgerEntry,
    LedgerFilter, LibraryFile, PageRequest, Paged, Pricing,
};
use crate::database::repository::{accounts, documents, ledger, library_files};
use crate::database::Repository;
use crate::error::{AppError, Result};
use crate::services::access::{self, Actor};
use crate::services::activity::ActivityRecorder;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::SqliteConnection;

/// Why an account may access an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessBasis {
    Free,
    /// Uploader or administrator
    Owner,
    /// A completed purchase already exists; nothing was charged
    AlreadyPurchased,
    /// Charged by this call
    Purchased,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChargeOutcome {
    pub eligible: bool,
    pub basis: AccessBasis,
    /// The purchase entry created by this call, if money moved
    pub transaction: Option<LedgerEntry>,
}

impl ChargeOutcome {
    pub fn granted(basis: AccessBasis) -> Self {
        Self {
            eligible: true,
            basis,
            transaction: None,
        }
    }

    fn purchased(entry: LedgerEntry) -> Self {
        Self {
            eligible: true,
            basis: AccessBasis::Purchased,
            transaction: Some(entry),
        }
    }

    pub fn charged(&self) -> i64 {
        self.transaction.as_ref().map_or(0, |entry| -entry.amount)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreditReceipt {
    pub transaction: LedgerEntry,
    pub new_balance: i64,
}

/// Result of comparing an account balance with its ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerAudit {
    pub balance: i64,
    pub ledger_sum: i64,
    pub consistent: bool,
}

#[derive(Clone)]
pub struct EntitlementEngine {
    repo: Repository,
    max_attempts: u32,
}

impl EntitlementEngine {
    pub fn new(repo: Repository, max_attempts: u32) -> Self {
        Self { repo, max_attempts }
    }

    /// Grant download access to a document, charging its download price once
    pub async fn check_and_charge(
        &self,
        account_id: &str,
        document_id: &str,
        file_id: Option<&str>,
    ) -> Result<ChargeOutcome> {
        let account_id = account_id.to_string();
        let document_id = document_id.to_string();
        let file_id = file_id.map(str::to_string);

        let outcome = self
            .repo
            .unit_of_work_retrying(self.max_attempts, move |conn| {
                let account_id = account_id.clone();
                let document_id = document_id.clone();
                let file_id = file_id.clone();
                Box::pin(async move {
                    charge_document(conn, &account_id, &document_id, file_id.as_deref()).await
                })
            })
            .await?;

        if let Some(entry) = &outcome.transaction {
            tracing::info!(
                "Account {} bought document {} for {} (balance {} -> {})",
                entry.account_id,
                document_id_of(entry),
                -entry.amount,
                entry.balance_before,
                entry.balance_after
            );
        }

        Ok(outcome)
    }

    /// Grant download access to a library file, charging its price once
    pub async fn check_and_charge_file(
        &self,
        account_id: &str,
        library_file_id: &str,
    ) -> Result<ChargeOutcome> {
        let account_id = account_id.to_string();
        let library_file_id = library_file_id.to_string();

        let outcome = self
            .repo
            .unit_of_work_retrying(self.max_attempts, move |conn| {
                let account_id = account_id.clone();
                let library_file_id = library_file_id.clone();
                Box::pin(async move { charge_file(conn, &account_id, &library_file_id).await })
            })
            .await?;

        if let Some(entry) = &outcome.transaction {
            tracing::info!(
                "Account {} bought library file {:?} for {}",
                entry.account_id,
                entry.library_file_id,
                -entry.amount
            );
        }

        Ok(outcome)
    }

    /// Credit a top-up to an account
    pub async fn deposit(
        &self,
        account_id: &str,
        amount: i64,
        method: &str,
        external_ref: Option<&str>,
    ) -> Result<CreditReceipt> {
        ensure_positive(amount)?;
        if method.trim().is_empty() {
            return Err(AppError::invalid_field("method", "Payment method is required"));
        }

        let detail = EntryDetail {
            payment_method: Some(method.trim().to_string()),
            external_ref: external_ref.map(str::to_string),
            ..EntryDetail::default()
        };
        let description = format!("Deposit via {}", method.trim());

        let receipt = self
            .credit(account_id, EntryKind::Deposit, amount, description, detail)
            .await?;

        tracing::info!(
            "Deposited {} to account {} (balance {})",
            amount,
            account_id,
            receipt.new_balance
        );
        Ok(receipt)
    }

    /// Administrator credit outside the payment flow
    pub async fn grant_bonus(
        &self,
        actor: &Actor,
        account_id: &str,
        amount: i64,
        reason: &str,
    ) -> Result<CreditReceipt> {
        access::ensure_moderator(actor)?;
        ensure_positive(amount)?;
        let reason = required_reason(reason)?;

        let receipt = self
            .credit(
                account_id,
                EntryKind::Bonus,
                amount,
                format!("Bonus: {}", reason),
                EntryDetail::default(),
            )
            .await?;

        tracing::info!(
            "Admin {} granted bonus {} to account {}",
            actor.account_id,
            amount,
            account_id
        );
        Ok(receipt)
    }

    /// Return the money of a completed purchase.
    ///
    /// Access already granted stays granted and the download counter is left
    /// alone. Each purchase can be refunded once.
    pub async fn refund(&self, actor: &Actor, entry_id: &str, reason: &str) -> Result<LedgerEntry> {
        access::ensure_moderator(actor)?;
        let reason = required_reason(reason)?;

        let admin_id = actor.account_id.clone();
        let entry_id = entry_id.to_string();

        let refund = self
            .repo
            .unit_of_work_retrying(self.max_attempts, move |conn| {
                let admin_id = admin_id.clone();
                let entry_id = entry_id.clone();
                let reason = reason.clone();
                Box::pin(async move { refund_entry(conn, &admin_id, &entry_id, &reason).await })
            })
            .await?;

        tracing::info!(
            "Refunded {} to account {} for entry {:?}",
            refund.amount,
            refund.account_id,
            refund.reference_entry_id
        );
        Ok(refund)
    }

    /// Ledger history of one account, newest first
    pub async fn history(
        &self,
        account_id: &str,
        filter: &LedgerFilter,
        page: PageRequest,
    ) -> Result<Paged<LedgerEntry>> {
        let mut conn = self.repo.connection().await?;
        let (entries, total) =
            ledger::list_entries(&mut conn, Some(account_id), filter, page).await?;
        Ok(Paged::new(entries, total, page))
    }

    /// Ledger history across all accounts
    pub async fn all_entries(
        &self,
        actor: &Actor,
        filter: &LedgerFilter,
        page: PageRequest,
    ) -> Result<Paged<LedgerEntry>> {
        access::ensure_moderator(actor)?;
        let mut conn = self.repo.connection().await?;
        let (entries, total) = ledger::list_entries(&mut conn, None, filter, page).await?;
        Ok(Paged::new(entries, total, page))
    }

    /// Completed totals per entry kind for one account
    pub async fn totals(
        &self,
        account_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<KindTotal>> {
        let mut conn = self.repo.connection().await?;
        ledger::totals_by_kind(&mut conn, Some(account_id), since).await
    }

    /// Compare the stored balance with the sum of completed entries
    pub async fn audit(&self, account_id: &str) -> Result<LedgerAudit> {
        let mut conn = self.repo.connection().await?;
        let balance = ledger::current_balance(&mut conn, account_id).await?;
        let ledger_sum = ledger::ledger_sum(&mut conn, account_id).await?;

        let audit = LedgerAudit {
            balance,
            ledger_sum,
            consistent: balance == ledger_sum,
        };

        if !audit.consistent {
            tracing::error!(
                "Ledger mismatch on account {}: balance {} vs entries {}",
                account_id,
                balance,
                ledger_sum
            );
        }

        Ok(audit)
    }

    async fn credit(
        &self,
        account_id: &str,
        kind: EntryKind,
        amount: i64,
        description: String,
        detail: EntryDetail,
    ) -> Result<CreditReceipt> {
        let account_id = account_id.to_string();

        self.repo
            .unit_of_work_retrying(self.max_attempts, move |conn| {
                let account_id = account_id.clone();
                let description = description.clone();
                let detail = detail.clone();
                Box::pin(async move {
                    active_account(conn, &account_id).await?;
                    let entry =
                        ledger::apply_entry(conn, &account_id, kind, amount, &description, &detail)
                            .await?;

                    ActivityRecorder::record_in(
                        conn,
                        &account_id,
                        activity_kind(kind),
                        json!({
                            "entry_id": entry.id,
                            "amount": amount,
                            "external_ref": detail.external_ref,
                        }),
                    )
                    .await;

                    let new_balance = entry.balance_after;
                    Ok(CreditReceipt {
                        transaction: entry,
                        new_balance,
                    })
                })
            })
            .await
    }
}

/// Whether an actor may use a document without paying now.
///
/// Uploaders and administrators never pay.
pub(crate) async fn holds_document(
    conn: &mut SqliteConnection,
    actor: &Actor,
    document: &Document,
) -> Result<bool> {
    if access::can_edit(document, actor) || document.pricing() == Pricing::Free {
        return Ok(true);
    }
    Ok(ledger::find_document_purchase(conn, &actor.account_id, &document.id)
        .await?
        .is_some())
}

/// Whether an actor may use a library file without paying now
pub(crate) async fn holds_file(
    conn: &mut SqliteConnection,
    actor: &Actor,
    file: &LibraryFile,
) -> Result<bool> {
    if access::can_edit(file, actor) || file.price == 0 {
        return Ok(true);
    }
    Ok(ledger::find_file_purchase(conn, &actor.account_id, &file.id)
        .await?
        .is_some())
}

fn as_actor(account: &Account) -> Actor {
    Actor::new(account.id.clone(), account.role)
}

async fn charge_document(
    conn: &mut SqliteConnection,
    account_id: &str,
    document_id: &str,
    file_id: Option<&str>,
) -> Result<ChargeOutcome> {
    let document = documents::get_document(conn, document_id).await?;
    let account = active_account(conn, account_id).await?;

    let attachment_id = match file_id {
        Some(file_id) => Some(
            document
                .file(file_id)
                .ok_or_else(|| AppError::not_found("FileAttachment", file_id))?
                .id
                .clone(),
        ),
        None => None,
    };

    if access::can_edit(&document, &as_actor(&account)) {
        return Ok(ChargeOutcome::granted(AccessBasis::Owner));
    }

    let price = match document.pricing() {
        Pricing::Free => return Ok(ChargeOutcome::granted(AccessBasis::Free)),
        Pricing::Priced { download_price, .. } => download_price,
    };

    if ledger::find_document_purchase(conn, account_id, document_id)
        .await?
        .is_some()
    {
        return Ok(ChargeOutcome::granted(AccessBasis::AlreadyPurchased));
    }

    if !access::can_view(&document, None) {
        return Err(AppError::InvalidState(
            "Document is not approved for sale".to_string(),
        ));
    }

    ensure_funds(&account, price)?;

    let detail = EntryDetail {
        document_id: Some(document.id.clone()),
        attachment_id,
        ..EntryDetail::default()
    };
    let description = format!("Download of \"{}\"", document.title.0.vi);

    let entry = ledger::apply_entry(conn, account_id, EntryKind::Purchase, -price, &description, &detail)
        .await
        .map_err(purchase_race)?;

    documents::increment_download_count(conn, document_id).await?;

    ActivityRecorder::record_in(
        conn,
        account_id,
        ActivityKind::Purchase,
        json!({ "document_id": document_id, "entry_id": entry.id, "amount": price }),
    )
    .await;

    Ok(ChargeOutcome::purchased(entry))
}

async fn charge_file(
    conn: &mut SqliteConnection,
    account_id: &str,
    library_file_id: &str,
) -> Result<ChargeOutcome> {
    let file = library_files::get_file(conn, library_file_id).await?;
    let account = active_account(conn, account_id).await?;

    if access::can_edit(&file, &as_actor(&account)) {
        return Ok(ChargeOutcome::granted(AccessBasis::Owner));
    }

    if file.price == 0 {
        return Ok(ChargeOutcome::granted(AccessBasis::Free));
    }

    if ledger::find_file_purchase(conn, account_id, library_file_id)
        .await?
        .is_some()
    {
        return Ok(ChargeOutcome::granted(AccessBasis::AlreadyPurchased));
    }

    if !file.is_approved {
        return Err(AppError::InvalidState(
            "File is not approved for sale".to_string(),
        ));
    }

    ensure_funds(&account, file.price)?;

    let detail = EntryDetail {
        library_file_id: Some(file.id.clone()),
        ..EntryDetail::default()
    };
    let description = format!("Download of \"{}\"", file.name);

    let entry = ledger::apply_entry(
        conn,
        account_id,
        EntryKind::Purchase,
        -file.price,
        &description,
        &detail,
    )
    .await
    .map_err(purchase_race)?;

    library_files::increment_download_count(conn, library_file_id).await?;

    ActivityRecorder::record_in(
        conn,
        account_id,
        ActivityKind::Purchase,
        json!({ "library_file_id": library_file_id, "entry_id": entry.id, "amount": file.price }),
    )
    .await;

    Ok(ChargeOutcome::purchased(entry))
}

async fn refund_entry(
    conn: &mut SqliteConnection,
    admin_id: &str,
    entry_id: &str,
    reason: &str,
) -> Result<LedgerEntry> {
    let original = ledger::get_entry(conn, entry_id).await?;

    if original.kind != EntryKind::Purchase {
        return Err(AppError::InvalidState(
            "Only purchases can be refunded".to_string(),
        ));
    }

    if original.status != EntryStatus::Completed {
        return Err(AppError::InvalidState(
            "Only completed purchases can be refunded".to_string(),
        ));
    }

    if ledger::find_refund_of(conn, entry_id).await?.is_some() {
        return Err(AppError::Conflict("Purchase already refunded".to_string()));
    }

    let detail = EntryDetail {
        document_id: original.document_id.clone(),
        attachment_id: original.attachment_id.clone(),
        library_file_id: original.library_file_id.clone(),
        reference_entry_id: Some(original.id.clone()),
        ..EntryDetail::default()
    };

    let refund = ledger::apply_entry(
        conn,
        &original.account_id,
        EntryKind::Refund,
        original.amount.abs(),
        &format!("Refund: {}", reason),
        &detail,
    )
    .await
    .map_err(|e| e.on_unique_violation("Purchase already refunded"))?;

    ActivityRecorder::record_in(
        conn,
        admin_id,
        ActivityKind::Refund,
        json!({
            "entry_id": refund.id,
            "original_entry_id": original.id,
            "account_id": original.account_id,
            "amount": refund.amount,
            "reason": reason,
        }),
    )
    .await;

    Ok(refund)
}

async fn active_account(conn: &mut SqliteConnection, account_id: &str) -> Result<Account> {
    let account = accounts::get_account(conn, account_id).await?;
    if !account.is_active {
        return Err(AppError::Forbidden("Account is deactivated".to_string()));
    }
    Ok(account)
}

fn ensure_funds(account: &Account, price: i64) -> Result<()> {
    if account.balance < price {
        return Err(AppError::InsufficientFunds {
            required: price,
            current: account.balance,
            deficit: price - account.balance,
        });
    }
    Ok(())
}

fn ensure_positive(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(AppError::invalid_field("amount", "Amount must be greater than 0"));
    }
    Ok(())
}

fn required_reason(reason: &str) -> Result<String> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(AppError::invalid_field("reason", "A reason is required"));
    }
    Ok(reason.to_string())
}

/// A concurrent purchase of the same item won the unique index; retry sees it
fn purchase_race(e: AppError) -> AppError {
    match e.on_unique_violation("Purchase recorded concurrently") {
        AppError::Conflict(msg) => AppError::ConcurrentUpdate(msg),
        other => other,
    }
}

fn activity_kind(kind: EntryKind) -> ActivityKind {
    match kind {
        EntryKind::Deposit => ActivityKind::Deposit,
        EntryKind::Purchase => ActivityKind::Purchase,
        EntryKind::Refund => ActivityKind::Refund,
        EntryKind::Bonus => ActivityKind::Bonus,
    }
}

fn document_id_of(entry: &LedgerEntry) -> &str {
    entry.document_id.as_deref().unwrap_or("-")
}
