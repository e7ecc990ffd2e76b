//! Integration tests for doclib
//!
//! These tests drive the public services end to end:
//! - Wallet purchases, refunds and the ledger audit
//! - Moderation of documents
//! - Category deletion checks
//! - Custom-field validation and rating aggregates

use doclib::app::App;
use doclib::config::AppConfig;
use doclib::database::models::{
    Account, ApprovalStatus, CreateCategoryRequest, CreateDocumentRequest,
    CreateLibraryFileRequest, CustomFieldsConfig, Document, EntryKind, LedgerFilter,
    LocalizedKeywords, LocalizedText, PageRequest, Pricing, RatingTarget, RegisterRequest, Role,
    UploadedFile,
};
use doclib::error::AppError;
use doclib::services::access::Actor;
use doclib::services::entitlement::AccessBasis;
use doclib::services::moderation::Decision;
use doclib::services::validator;
use serde_json::{json, Map};
use tempfile::TempDir;

struct Harness {
    app: App,
    _temp: TempDir,
}

async fn harness() -> Harness {
    let temp = TempDir::new().unwrap();
    let app = App::build(AppConfig::with_data_dir(temp.path()))
        .await
        .unwrap();

    Harness { app, _temp: temp }
}

fn actor(account: &Account) -> Actor {
    Actor::new(account.id.clone(), account.role)
}

impl Harness {
    async fn account(&self, username: &str, role: Role) -> Account {
        self.app
            .accounts
            .register_as(
                RegisterRequest {
                    username: username.to_string(),
                    email: format!("{}@example.com", username),
                    password: "correct horse battery".to_string(),
                    full_name: format!("{} Nguyen", username),
                    phone: None,
                    address: None,
                },
                role,
            )
            .await
            .unwrap()
    }

    async fn category(&self, admin: &Account, code: &str, parent_id: Option<String>) -> String {
        self.app
            .categories
            .create(
                &actor(admin),
                CreateCategoryRequest {
                    code: code.to_string(),
                    name: LocalizedText::new(code, code),
                    description: None,
                    parent_id,
                    sort_order: 0,
                    custom_fields_config: CustomFieldsConfig::default(),
                },
            )
            .await
            .unwrap()
            .id
    }

    /// Uploaded by `uploader`, then approved by `admin` when needed
    async fn approved_document(
        &self,
        uploader: &Account,
        admin: &Account,
        category_id: &str,
        pricing: Pricing,
    ) -> Document {
        let doc = self
            .app
            .documents
            .create(&actor(uploader), document_request(category_id, pricing))
            .await
            .unwrap();

        if doc.status == ApprovalStatus::Approved {
            return doc;
        }
        self.app
            .moderation
            .decide(&actor(admin), &doc.id, Decision::Approve)
            .await
            .unwrap()
    }

    async fn balance(&self, account_id: &str) -> i64 {
        self.app.accounts.get(account_id).await.unwrap().balance
    }
}

fn document_request(category_id: &str, pricing: Pricing) -> CreateDocumentRequest {
    CreateDocumentRequest {
        category_id: category_id.to_string(),
        title: LocalizedText::new("Bài giảng Giải tích", "Calculus lecture"),
        summary: LocalizedText::new("Chương 1", "Chapter 1"),
        keywords: LocalizedKeywords::default(),
        primary_language: "vi".to_string(),
        custom_fields: Map::new(),
        pricing,
        files: vec![UploadedFile {
            name: "giai-tich.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            data: b"%PDF-1.7 calculus".to_vec(),
        }],
    }
}

fn priced(download_price: i64) -> Pricing {
    Pricing::Priced {
        view_price: 0,
        download_price,
    }
}

#[tokio::test]
async fn test_purchase_end_to_end() {
    let h = harness().await;
    let admin = h.account("admin", Role::Admin).await;
    let teacher = h.account("teacher", Role::Teacher).await;
    let student = h.account("student", Role::User).await;
    let category = h.category(&admin, "math", None).await;
    let doc = h.approved_document(&teacher, &admin, &category, priced(60)).await;

    h.app
        .entitlement
        .deposit(&student.id, 100, "bank_transfer", Some("TX-1"))
        .await
        .unwrap();

    let first = h
        .app
        .documents
        .download(&actor(&student), &doc.id, None)
        .await
        .unwrap();
    assert!(first.outcome.eligible);
    assert_eq!(first.outcome.basis, AccessBasis::Purchased);
    assert_eq!(h.balance(&student.id).await, 40);

    let purchases = h
        .app
        .entitlement
        .history(
            &student.id,
            &LedgerFilter {
                kind: Some(EntryKind::Purchase),
                ..Default::default()
            },
            PageRequest::default(),
        )
        .await
        .unwrap();
    assert_eq!(purchases.total, 1);
    let entry = &purchases.items[0];
    assert_eq!(entry.amount, -60);
    assert_eq!(entry.balance_before, 100);
    assert_eq!(entry.balance_after, 40);
    assert_eq!(entry.document_id.as_deref(), Some(doc.id.as_str()));

    let stored = h.app.documents.get(None, &doc.id).await.unwrap();
    assert_eq!(stored.download_count, 1);

    let second = h
        .app
        .entitlement
        .check_and_charge(&student.id, &doc.id, None)
        .await
        .unwrap();
    assert!(second.eligible);
    assert_eq!(second.basis, AccessBasis::AlreadyPurchased);
    assert!(second.transaction.is_none());
    assert_eq!(h.balance(&student.id).await, 40);

    let audit = h.app.entitlement.audit(&student.id).await.unwrap();
    assert!(audit.consistent);
    assert_eq!(audit.ledger_sum, 40);
}

#[tokio::test]
async fn test_concurrent_downloads_charge_once() {
    let h = harness().await;
    let admin = h.account("admin", Role::Admin).await;
    let student = h.account("student", Role::User).await;
    let category = h.category(&admin, "math", None).await;
    let doc = h.approved_document(&admin, &admin, &category, priced(60)).await;
    h.app
        .entitlement
        .deposit(&student.id, 100, "card", None)
        .await
        .unwrap();

    let (a, b) = {
        let (engine_a, engine_b) = (h.app.entitlement.clone(), h.app.entitlement.clone());
        let (id_a, id_b) = (student.id.clone(), student.id.clone());
        let (doc_a, doc_b) = (doc.id.clone(), doc.id.clone());
        tokio::join!(
            tokio::spawn(async move { engine_a.check_and_charge(&id_a, &doc_a, None).await }),
            tokio::spawn(async move { engine_b.check_and_charge(&id_b, &doc_b, None).await }),
        )
    };
    let outcomes = [a.unwrap().unwrap(), b.unwrap().unwrap()];

    let purchased = outcomes
        .iter()
        .filter(|o| o.basis == AccessBasis::Purchased)
        .count();
    assert_eq!(purchased, 1);
    assert_eq!(h.balance(&student.id).await, 40);
    assert!(h.app.entitlement.audit(&student.id).await.unwrap().consistent);
}

#[tokio::test]
async fn test_insufficient_funds_reports_deficit() {
    let h = harness().await;
    let admin = h.account("admin", Role::Admin).await;
    let student = h.account("student", Role::User).await;
    let category = h.category(&admin, "math", None).await;
    let doc = h.approved_document(&admin, &admin, &category, priced(60)).await;
    h.app
        .entitlement
        .deposit(&student.id, 25, "card", None)
        .await
        .unwrap();

    let result = h
        .app
        .documents
        .download(&actor(&student), &doc.id, None)
        .await;

    match result {
        Err(AppError::InsufficientFunds {
            required,
            current,
            deficit,
        }) => {
            assert_eq!((required, current, deficit), (60, 25, 35));
        }
        Err(other) => panic!("expected insufficient funds, got {}", other),
        Ok(_) => panic!("expected insufficient funds"),
    }
    assert_eq!(h.balance(&student.id).await, 25);
}

#[tokio::test]
async fn test_refund_restores_balance_and_keeps_counter() {
    let h = harness().await;
    let admin = h.account("admin", Role::Admin).await;
    let student = h.account("student", Role::User).await;
    let category = h.category(&admin, "math", None).await;
    let doc = h.approved_document(&admin, &admin, &category, priced(60)).await;
    h.app
        .entitlement
        .deposit(&student.id, 100, "card", None)
        .await
        .unwrap();

    let outcome = h
        .app
        .entitlement
        .check_and_charge(&student.id, &doc.id, None)
        .await
        .unwrap();
    let purchase = outcome.transaction.unwrap();

    let refund = h
        .app
        .entitlement
        .refund(&actor(&admin), &purchase.id, "Corrupted file")
        .await
        .unwrap();
    assert_eq!(refund.amount, 60);
    assert_eq!(refund.reference_entry_id.as_deref(), Some(purchase.id.as_str()));
    assert_eq!(h.balance(&student.id).await, 100);

    let stored = h.app.documents.get(None, &doc.id).await.unwrap();
    assert_eq!(stored.download_count, 1);

    let again = h
        .app
        .entitlement
        .refund(&actor(&admin), &purchase.id, "Twice")
        .await;
    assert!(matches!(again, Err(AppError::Conflict(_))));

    let by_student = h
        .app
        .entitlement
        .refund(&actor(&student), &purchase.id, "Please")
        .await;
    assert!(matches!(by_student, Err(AppError::Forbidden(_))));

    assert!(h.app.entitlement.audit(&student.id).await.unwrap().consistent);
}

#[tokio::test]
async fn test_moderation_lifecycle() {
    let h = harness().await;
    let admin = h.account("admin", Role::Admin).await;
    let teacher = h.account("teacher", Role::Teacher).await;
    let category = h.category(&admin, "math", None).await;

    let doc = h
        .app
        .documents
        .create(&actor(&teacher), document_request(&category, Pricing::Free))
        .await
        .unwrap();
    assert_eq!(doc.status, ApprovalStatus::Pending);

    let queue = h
        .app
        .moderation
        .queue(&actor(&admin), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(queue.total, 1);

    let rejected = h
        .app
        .moderation
        .decide(
            &actor(&admin),
            &doc.id,
            Decision::Reject {
                reason: "Missing references".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(rejected.status, ApprovalStatus::Rejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("Missing references"));

    let resubmitted = h
        .app
        .moderation
        .resubmit(&actor(&teacher), &doc.id)
        .await
        .unwrap();
    assert_eq!(resubmitted.status, ApprovalStatus::Pending);

    let approved = h
        .app
        .moderation
        .decide(&actor(&admin), &doc.id, Decision::Approve)
        .await
        .unwrap();
    assert_eq!(approved.status, ApprovalStatus::Approved);
    assert_eq!(approved.approver_id.as_deref(), Some(admin.id.as_str()));

    let twice = h
        .app
        .moderation
        .decide(&actor(&admin), &doc.id, Decision::Approve)
        .await;
    assert!(matches!(twice, Err(AppError::InvalidState(_))));

    let stored = h.app.documents.get(None, &doc.id).await.unwrap();
    assert_eq!(stored.status, ApprovalStatus::Approved);

    let by_teacher = h
        .app
        .moderation
        .decide(&actor(&teacher), &doc.id, Decision::Approve)
        .await;
    assert!(matches!(by_teacher, Err(AppError::Forbidden(_))));
}

#[tokio::test]
async fn test_category_delete_checks_each_reference() {
    let h = harness().await;
    let admin = h.account("admin", Role::Admin).await;
    let admin_actor = actor(&admin);

    let with_child = h.category(&admin, "parent", None).await;
    h.category(&admin, "child", Some(with_child.clone())).await;
    let with_document = h.category(&admin, "documents", None).await;
    h.approved_document(&admin, &admin, &with_document, Pricing::Free)
        .await;
    let with_file = h.category(&admin, "files", None).await;
    h.app
        .library_files
        .upload(
            &admin_actor,
            CreateLibraryFileRequest {
                name: "Đề cương".to_string(),
                description: None,
                price: 0,
                category_id: Some(with_file.clone()),
                file: UploadedFile {
                    name: "de-cuong.pdf".to_string(),
                    mime_type: "application/pdf".to_string(),
                    data: b"outline".to_vec(),
                },
            },
        )
        .await
        .unwrap();
    let unused = h.category(&admin, "unused", None).await;

    for (id, needle) in [
        (&with_child, "child"),
        (&with_document, "documents"),
        (&with_file, "library files"),
    ] {
        match h.app.categories.delete(&admin_actor, id).await {
            Err(AppError::InvalidState(msg)) => assert!(msg.contains(needle), "{}", msg),
            other => panic!("expected invalid state for {}, got {:?}", needle, other),
        }
        assert!(h.app.categories.get(id).await.is_ok());
    }

    h.app.categories.delete(&admin_actor, &unused).await.unwrap();
    assert!(matches!(
        h.app.categories.get(&unused).await,
        Err(AppError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_custom_field_validation_is_deterministic() {
    let config: CustomFieldsConfig = serde_json::from_value(json!({
        "required": ["author", "year"],
        "fieldTypes": {
            "year": { "type": "number", "validation": { "min": 1900, "max": 2100 } },
            "level": { "type": "select", "options": ["basic", "advanced"] }
        }
    }))
    .unwrap();
    let fields = json!({ "year": 1800, "level": "expert" })
        .as_object()
        .cloned()
        .unwrap();

    let first = validator::validate(&config, &fields);
    let second = validator::validate(&config, &fields);

    assert_eq!(first, second);
    let names: Vec<_> = first.iter().map(|e| e.field.as_str()).collect();
    assert_eq!(
        names,
        vec!["customFields.author", "customFields.level", "customFields.year"]
    );
}

#[tokio::test]
async fn test_rating_aggregate_follows_changes() {
    let h = harness().await;
    let admin = h.account("admin", Role::Admin).await;
    let category = h.category(&admin, "math", None).await;
    let doc = h.approved_document(&admin, &admin, &category, Pricing::Free).await;
    let target = RatingTarget::Document(doc.id.clone());

    let mut rating_ids = Vec::new();
    for (name, score) in [("anh", 5), ("binh", 3), ("chi", 4)] {
        let rater = h.account(name, Role::User).await;
        let change = h
            .app
            .ratings
            .rate(&actor(&rater), target.clone(), score, None)
            .await
            .unwrap();
        rating_ids.push((rater, change.rating.id));
    }

    let aggregate = h.app.ratings.recompute(&target).await.unwrap();
    assert_eq!(aggregate.count, 3);
    assert!((aggregate.average - 4.0).abs() < 1e-9);
    assert_eq!(
        h.app.ratings.distribution(&target).await.unwrap(),
        [0, 0, 1, 1, 1]
    );

    let duplicate = h
        .app
        .ratings
        .rate(&actor(&rating_ids[0].0), target.clone(), 1, None)
        .await;
    assert!(matches!(duplicate, Err(AppError::Conflict(_))));
    let unchanged = h.app.documents.get(None, &doc.id).await.unwrap();
    assert_eq!(unchanged.rating_count, 3);

    let (binh, binh_rating) = &rating_ids[1];
    let after_delete = h.app.ratings.delete(&actor(binh), binh_rating).await.unwrap();
    assert_eq!(after_delete.count, 2);
    assert!((after_delete.average - 4.5).abs() < 1e-9);

    for (rater, id) in [&rating_ids[0], &rating_ids[2]] {
        h.app.ratings.delete(&actor(rater), id).await.unwrap();
    }
    let cleared = h.app.documents.get(None, &doc.id).await.unwrap();
    assert_eq!(cleared.rating_count, 0);
    assert_eq!(cleared.rating_average, 0.0);
}
