use async_trait::async_trait;
use roach_cdc::checkpoints::{Checkpoint, CheckpointSaver};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;

/// Stores reader checkpoints in a table of the target database.
pub struct TableBackedCheckpointSaver {
    pool: PgPool,
    checkpoint_table: String,
}

impl TableBackedCheckpointSaver {
    /// Creates new [`TableBackedCheckpointSaver`].
    /// Will create the table if it doesn't exist.
    pub async fn new(pool: PgPool, table_name: &str) -> anyhow::Result<Self> {
        sqlx::query(&get_checkpoint_table_schema(table_name))
            .execute(&pool)
            .await?;

        Ok(TableBackedCheckpointSaver {
            pool,
            checkpoint_table: table_name.to_string(),
        })
    }
}

fn get_checkpoint_table_schema(table_name: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table_name} (
            subscriber_id TEXT PRIMARY KEY,
            last_keys JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now())"
    )
}

#[async_trait]
impl CheckpointSaver for TableBackedCheckpointSaver {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (subscriber_id, last_keys, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (subscriber_id)
            DO UPDATE SET last_keys = excluded.last_keys, updated_at = excluded.updated_at",
            self.checkpoint_table
        ))
        .bind(&checkpoint.subscriber_id)
        .bind(Json(&checkpoint.last_keys))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_checkpoint(&self, subscriber_id: &str) -> anyhow::Result<Option<Checkpoint>> {
        let row: Option<(Json<Vec<Value>>,)> = sqlx::query_as(&format!(
            "SELECT last_keys FROM {} WHERE subscriber_id = $1",
            self.checkpoint_table
        ))
        .bind(subscriber_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(Json(last_keys),)| Checkpoint::new(subscriber_id, last_keys)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roach_cdc_test_utils::{database_url_or_skip, unique_name};
    use serde_json::json;

    #[tokio::test]
    async fn test_save_and_load_checkpoint() {
        let url = database_url_or_skip!();
        let pool = PgPool::connect(&url).await.unwrap();
        let saver = TableBackedCheckpointSaver::new(pool, &unique_name())
            .await
            .unwrap();

        assert!(saver.load_checkpoint("sub1").await.unwrap().is_none());

        for key in 0..3 {
            saver
                .save_checkpoint(&Checkpoint::new("sub1", vec![json!(key), json!("eu")]))
                .await
                .unwrap();
        }

        let loaded = saver.load_checkpoint("sub1").await.unwrap().unwrap();
        assert_eq!(loaded.last_keys, vec![json!(2), json!("eu")]);
    }
}
