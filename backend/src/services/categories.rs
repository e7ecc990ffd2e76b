//! Category service
//!
//! Categories form a tree and carry the custom-field schema of their
//! documents. Deleting one is refused while anything still points at it.

use crate::database::models::{
    ActivityKind, Category, CategoryNode, CreateCategoryRequest, UpdateCategoryRequest,
};
use crate::database::repository::categories;
use crate::database::Repository;
use crate::error::{AppError, FieldError, Result};
use crate::services::access::{self, Actor};
use crate::services::activity::ActivityRecorder;
use serde_json::json;
use std::collections::{HashMap, HashSet};

#[derive(Clone)]
pub struct CategoryService {
    repo: Repository,
}

impl CategoryService {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    pub async fn create(&self, actor: &Actor, req: CreateCategoryRequest) -> Result<Category> {
        access::ensure_moderator(actor)?;
        validate_names(Some(&req.code), Some(&req.name.vi))?;

        let admin_id = actor.account_id.clone();
        let category = self
            .repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    if let Some(parent_id) = &req.parent_id {
                        categories::get_category(conn, parent_id).await?;
                    }

                    let category = categories::insert_category(conn, &req).await?;

                    ActivityRecorder::record_in(
                        conn,
                        &admin_id,
                        ActivityKind::CreateCategory,
                        json!({ "category_id": category.id, "code": category.code }),
                    )
                    .await;

                    Ok(category)
                })
            })
            .await?;

        tracing::info!("Created category {} ({})", category.code, category.id);
        Ok(category)
    }

    pub async fn update(
        &self,
        actor: &Actor,
        category_id: &str,
        req: UpdateCategoryRequest,
    ) -> Result<Category> {
        access::ensure_moderator(actor)?;
        validate_names(req.code.as_ref(), req.name.as_ref().map(|n| &n.vi))?;

        let admin_id = actor.account_id.clone();
        let id = category_id.to_string();

        let category = self
            .repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    categories::get_category(conn, &id).await?;

                    if let Some(Some(parent_id)) = &req.parent_id {
                        if parent_id == &id {
                            return Err(AppError::InvalidState(
                                "A category cannot be its own parent".to_string(),
                            ));
                        }
                        categories::get_category(conn, parent_id).await?;
                        if categories::ancestor_ids(conn, parent_id).await?.contains(&id) {
                            return Err(AppError::InvalidState(
                                "A category cannot move under its own descendant".to_string(),
                            ));
                        }
                    }

                    let category = categories::update_category(conn, &id, &req).await?;

                    ActivityRecorder::record_in(
                        conn,
                        &admin_id,
                        ActivityKind::UpdateCategory,
                        json!({ "category_id": id }),
                    )
                    .await;

                    Ok(category)
                })
            })
            .await?;

        tracing::info!("Updated category {}", category.id);
        Ok(category)
    }

    /// Delete a category nothing refers to
    pub async fn delete(&self, actor: &Actor, category_id: &str) -> Result<()> {
        access::ensure_moderator(actor)?;

        let admin_id = actor.account_id.clone();
        let id = category_id.to_string();

        self.repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    let category = categories::get_category(conn, &id).await?;
                    let (children, documents, files) =
                        categories::count_references(conn, &id).await?;

                    if children > 0 {
                        return Err(AppError::InvalidState(format!(
                            "Category has {} child categories",
                            children
                        )));
                    }
                    if documents > 0 {
                        return Err(AppError::InvalidState(format!(
                            "Category is used by {} documents",
                            documents
                        )));
                    }
                    if files > 0 {
                        return Err(AppError::InvalidState(format!(
                            "Category is used by {} library files",
                            files
                        )));
                    }

                    categories::delete_category(conn, &id).await?;

                    ActivityRecorder::record_in(
                        conn,
                        &admin_id,
                        ActivityKind::DeleteCategory,
                        json!({ "category_id": id, "code": category.code }),
                    )
                    .await;

                    Ok(())
                })
            })
            .await?;

        tracing::info!("Deleted category {}", category_id);
        Ok(())
    }

    pub async fn get(&self, category_id: &str) -> Result<Category> {
        let mut conn = self.repo.connection().await?;
        categories::get_category(&mut conn, category_id).await
    }

    /// Category forest ordered by sort order, with approved document counts
    pub async fn tree(&self, include_inactive: bool) -> Result<Vec<CategoryNode>> {
        let mut conn = self.repo.connection().await?;
        let all = categories::list_categories(&mut conn, include_inactive).await?;
        let counts = categories::approved_document_counts(&mut conn).await?;

        Ok(build_tree(all, &counts))
    }
}

fn validate_names(code: Option<&String>, name_vi: Option<&String>) -> Result<()> {
    let mut errors = Vec::new();

    if code.is_some_and(|c| c.trim().is_empty()) {
        errors.push(FieldError::new("code", "Category code is required"));
    }
    if name_vi.is_some_and(|n| n.trim().is_empty()) {
        errors.push(FieldError::new("name.vi", "Category name is required"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::ValidationFailed(errors))
    }
}

/// Categories whose parent is missing from `all` become roots
fn build_tree(all: Vec<Category>, counts: &HashMap<String, i64>) -> Vec<CategoryNode> {
    let known: HashSet<String> = all.iter().map(|c| c.id.clone()).collect();

    let mut by_parent: HashMap<Option<String>, Vec<Category>> = HashMap::new();
    for category in all {
        let parent = category
            .parent_id
            .clone()
            .filter(|parent| known.contains(parent));
        by_parent.entry(parent).or_default().push(category);
    }

    attach(None, &mut by_parent, counts)
}

fn attach(
    parent: Option<String>,
    by_parent: &mut HashMap<Option<String>, Vec<Category>>,
    counts: &HashMap<String, i64>,
) -> Vec<CategoryNode> {
    let Some(children) = by_parent.remove(&parent) else {
        return Vec::new();
    };

    children
        .into_iter()
        .map(|category| {
            let nested = attach(Some(category.id.clone()), by_parent, counts);
            CategoryNode {
                document_count: counts.get(&category.id).copied().unwrap_or(0),
                category,
                children: nested,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{ApprovalStatus, LocalizedText, Pricing, Role};
    use crate::test_support::{actor, fixture};

    fn request(code: &str, parent_id: Option<&str>, sort_order: i64) -> CreateCategoryRequest {
        CreateCategoryRequest {
            code: code.to_string(),
            name: LocalizedText::new(code, code),
            description: None,
            parent_id: parent_id.map(str::to_string),
            sort_order,
            custom_fields_config: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_create_requires_admin_and_unique_code() {
        let fx = fixture().await;
        let admin = fx.account("admin", Role::Admin).await;
        let teacher = fx.account("teacher", Role::Teacher).await;
        let service = CategoryService::new(fx.repo.clone());

        let denied = service.create(&actor(&teacher), request("math", None, 0)).await;
        assert!(matches!(denied, Err(AppError::Forbidden(_))));

        service
            .create(&actor(&admin), request("math", None, 0))
            .await
            .unwrap();
        let duplicate = service.create(&actor(&admin), request("math", None, 1)).await;
        assert!(matches!(duplicate, Err(AppError::Conflict(_))));

        let orphan = service
            .create(&actor(&admin), request("algebra", Some("missing"), 0))
            .await;
        assert!(matches!(orphan, Err(AppError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_reparenting_rejects_self_and_cycles() {
        let fx = fixture().await;
        let admin = fx.account("admin", Role::Admin).await;
        let service = CategoryService::new(fx.repo.clone());
        let admin = actor(&admin);

        let root = service.create(&admin, request("science", None, 0)).await.unwrap();
        let child = service
            .create(&admin, request("physics", Some(&root.id), 0))
            .await
            .unwrap();
        let grandchild = service
            .create(&admin, request("optics", Some(&child.id), 0))
            .await
            .unwrap();

        let onto_self = UpdateCategoryRequest {
            parent_id: Some(Some(root.id.clone())),
            ..Default::default()
        };
        let result = service.update(&admin, &root.id, onto_self).await;
        assert!(matches!(result, Err(AppError::InvalidState(_))));

        let onto_descendant = UpdateCategoryRequest {
            parent_id: Some(Some(grandchild.id.clone())),
            ..Default::default()
        };
        let result = service.update(&admin, &root.id, onto_descendant).await;
        assert!(matches!(result, Err(AppError::InvalidState(_))));

        let detach = UpdateCategoryRequest {
            parent_id: Some(None),
            sort_order: Some(5),
            ..Default::default()
        };
        let moved = service.update(&admin, &grandchild.id, detach).await.unwrap();
        assert!(moved.parent_id.is_none());
        assert_eq!(moved.sort_order, 5);
    }

    #[tokio::test]
    async fn test_each_reference_blocks_delete() {
        let fx = fixture().await;
        let admin_account = fx.account("admin", Role::Admin).await;
        let admin = actor(&admin_account);
        let service = CategoryService::new(fx.repo.clone());

        let parent = service.create(&admin, request("parent", None, 0)).await.unwrap();
        let child = service
            .create(&admin, request("child", Some(&parent.id), 0))
            .await
            .unwrap();
        match service.delete(&admin, &parent.id).await {
            Err(AppError::InvalidState(msg)) => assert!(msg.contains("child")),
            other => panic!("expected child block, got {:?}", other),
        }

        let with_doc = service.create(&admin, request("docs", None, 0)).await.unwrap();
        fx.document(&admin_account, &with_doc.id, Pricing::Free, ApprovalStatus::Approved)
            .await;
        match service.delete(&admin, &with_doc.id).await {
            Err(AppError::InvalidState(msg)) => assert!(msg.contains("documents")),
            other => panic!("expected document block, got {:?}", other),
        }

        let with_file = service.create(&admin, request("files", None, 0)).await.unwrap();
        let file = fx.library_file(&admin_account, 0, true).await;
        sqlx::query("UPDATE library_files SET category_id = ? WHERE id = ?")
            .bind(&with_file.id)
            .bind(&file.id)
            .execute(fx.repo.pool())
            .await
            .unwrap();
        match service.delete(&admin, &with_file.id).await {
            Err(AppError::InvalidState(msg)) => assert!(msg.contains("library files")),
            other => panic!("expected file block, got {:?}", other),
        }

        service.delete(&admin, &child.id).await.unwrap();
        service.delete(&admin, &parent.id).await.unwrap();
        assert!(matches!(
            service.get(&parent.id).await,
            Err(AppError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_tree_is_nested_and_ordered() {
        let fx = fixture().await;
        let admin_account = fx.account("admin", Role::Admin).await;
        let admin = actor(&admin_account);
        let service = CategoryService::new(fx.repo.clone());

        let b = service.create(&admin, request("b-root", None, 2)).await.unwrap();
        let a = service.create(&admin, request("a-root", None, 1)).await.unwrap();
        service
            .create(&admin, request("leaf-2", Some(&a.id), 2))
            .await
            .unwrap();
        let leaf = service
            .create(&admin, request("leaf-1", Some(&a.id), 1))
            .await
            .unwrap();
        fx.document(&admin_account, &leaf.id, Pricing::Free, ApprovalStatus::Approved)
            .await;
        fx.document(&admin_account, &leaf.id, Pricing::Free, ApprovalStatus::Pending)
            .await;

        let tree = service.tree(false).await.unwrap();

        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].category.id, a.id);
        assert_eq!(tree[1].category.id, b.id);
        let codes: Vec<_> = tree[0]
            .children
            .iter()
            .map(|n| n.category.code.as_str())
            .collect();
        assert_eq!(codes, vec!["leaf-1", "leaf-2"]);
        assert_eq!(tree[0].children[0].document_count, 1);
    }
}
