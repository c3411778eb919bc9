use crate::error::{AppError, AppResult};
use crate::store::LeadStore;
use crate::types::{Column, ColumnRequest, ResolvedColumn};

pub const DEFAULT_COLUMN_TITLE: &str = "Initial Prospect";
pub const DEFAULT_COLUMN_COLOR: &str = "blue";

/// Returns the user's earliest column, creating the default one when the user has none.
///
/// Creation goes through the store's insert-if-absent on the title key, so two
/// requests racing on an empty board end up with the same column.
pub async fn resolve_or_create_first(store: &dyn LeadStore, user_id: &str) -> AppResult<Column> {
    if let Some(column) = store.first_column(user_id).await? {
        return Ok(column);
    }
    let column = store
        .insert_column_if_absent(user_id, DEFAULT_COLUMN_TITLE, DEFAULT_COLUMN_COLOR)
        .await?;
    tracing::info!(user_id, column_id = column.id, "created default pipeline column");
    Ok(column)
}

/// Returns the requested column when it belongs to the user, or the first column
/// when none was requested. A foreign or unknown id is a bad request.
pub async fn resolve_target(
    store: &dyn LeadStore,
    user_id: &str,
    column_id: Option<i64>,
) -> AppResult<Column> {
    let Some(column_id) = column_id else {
        return resolve_or_create_first(store, user_id).await;
    };
    store
        .list_columns(user_id)
        .await?
        .into_iter()
        .find(|c| c.id == column_id)
        .ok_or_else(|| AppError::bad_request(format!("column {column_id} not found")))
}

/// Maps requested `{title, color}` pairs onto columns, creating the missing ones.
///
/// A title that already exists keeps its stored color; the requested color only
/// applies to newly created columns.
pub async fn resolve_by_titles(
    store: &dyn LeadStore,
    user_id: &str,
    requested: &[ColumnRequest],
) -> AppResult<Vec<ResolvedColumn>> {
    let mut known = store.list_columns(user_id).await?;
    let mut resolved = Vec::with_capacity(requested.len());

    for request in requested {
        let title = request.title.trim();
        let wanted = title.to_lowercase();
        let found = known
            .iter()
            .find(|c| c.title.trim().to_lowercase() == wanted)
            .cloned();

        let column = match found {
            Some(column) => column,
            None => {
                let color = request
                    .color
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .unwrap_or(DEFAULT_COLUMN_COLOR);
                let column = store.insert_column_if_absent(user_id, title, color).await?;
                tracing::debug!(user_id, column_id = column.id, title, "created pipeline column");
                known.push(column.clone());
                column
            }
        };

        resolved.push(ResolvedColumn {
            title: title.to_string(),
            color: column.color,
            id: column.id.to_string(),
        });
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn request(title: &str, color: Option<&str>) -> ColumnRequest {
        ColumnRequest {
            title: title.to_string(),
            color: color.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn first_column_is_reused() {
        let store = MemoryStore::new();
        let first = resolve_or_create_first(&store, "u1").await.unwrap();
        let second = resolve_or_create_first(&store, "u1").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.title, DEFAULT_COLUMN_TITLE);
        assert_eq!(store.list_columns("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn first_column_prefers_earliest_existing() {
        let store = MemoryStore::new();
        let lead_in = store.insert_column_if_absent("u1", "Lead In", "gray").await.unwrap();
        store.insert_column_if_absent("u1", "Closed", "green").await.unwrap();
        let first = resolve_or_create_first(&store, "u1").await.unwrap();
        assert_eq!(first.id, lead_in.id);
    }

    #[tokio::test]
    async fn racing_first_calls_share_one_column() {
        let store = MemoryStore::new();
        let (a, b) = tokio::join!(
            resolve_or_create_first(&store, "u1"),
            resolve_or_create_first(&store, "u1")
        );
        assert_eq!(a.unwrap().id, b.unwrap().id);
        assert_eq!(store.list_columns("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn target_column_must_belong_to_user() {
        let store = MemoryStore::new();
        let mine = store.insert_column_if_absent("u1", "Hot", "red").await.unwrap();
        let theirs = store.insert_column_if_absent("u2", "Hot", "red").await.unwrap();

        let found = resolve_target(&store, "u1", Some(mine.id)).await.unwrap();
        assert_eq!(found.id, mine.id);
        assert!(matches!(
            resolve_target(&store, "u1", Some(theirs.id)).await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            resolve_target(&store, "u1", Some(999)).await,
            Err(AppError::BadRequest(_))
        ));

        // no request falls back to the first column
        let first = resolve_target(&store, "u1", None).await.unwrap();
        assert_eq!(first.id, mine.id);
    }

    #[tokio::test]
    async fn existing_color_wins_over_requested() {
        let store = MemoryStore::new();
        let existing = store.insert_column_if_absent("u1", "Qualified", "purple").await.unwrap();

        let resolved = resolve_by_titles(
            &store,
            "u1",
            &[request("qualified", Some("red")), request("Won", Some("green")), request("Lost", None)],
        )
        .await
        .unwrap();

        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved[0].id, existing.id.to_string());
        assert_eq!(resolved[0].color, "purple");
        assert_eq!(resolved[0].title, "qualified");
        assert_eq!(resolved[1].color, "green");
        assert_eq!(resolved[2].color, DEFAULT_COLUMN_COLOR);
        assert_eq!(store.list_columns("u1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn repeated_titles_resolve_to_one_column() {
        let store = MemoryStore::new();
        let resolved = resolve_by_titles(
            &store,
            "u1",
            &[request("Follow up", Some("blue")), request("FOLLOW UP", Some("red"))],
        )
        .await
        .unwrap();
        assert_eq!(resolved[0].id, resolved[1].id);
        assert_eq!(resolved[1].color, "blue");

        let again = resolve_by_titles(&store, "u1", &[request("follow up", None)])
            .await
            .unwrap();
        assert_eq!(again[0].id, resolved[0].id);
        assert_eq!(store.list_columns("u1").await.unwrap().len(), 1);
    }
}
