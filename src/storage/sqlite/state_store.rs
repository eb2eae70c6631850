//! SQLite implementation of the processor state store.

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};

use crate::interfaces::event_log::Result;
use crate::interfaces::state_store::ProcessorStateStore;
use crate::processing::state::{StreamProcessorId, StreamProcessorState};
use crate::storage::schema::{ProcessorStates, CREATE_PROCESSOR_STATES_TABLE};

/// SQLite implementation of ProcessorStateStore.
///
/// One record per (tenant, processor, stream); the state value is stored
/// whole as JSON and replaced wholesale on every persist.
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Create a new SQLite state store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_PROCESSOR_STATES_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessorStateStore for SqliteStateStore {
    async fn load(&self, id: &StreamProcessorId) -> Result<Option<StreamProcessorState>> {
        let query = Query::select()
            .column(ProcessorStates::StateData)
            .from(ProcessorStates::Table)
            .and_where(Expr::col(ProcessorStates::Tenant).eq(id.tenant.to_string()))
            .and_where(Expr::col(ProcessorStates::Processor).eq(&id.processor))
            .and_where(Expr::col(ProcessorStates::Stream).eq(&id.stream))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;

        match row {
            Some(row) => {
                let state_data: String = row.get("state_data");
                Ok(Some(serde_json::from_str(&state_data)?))
            }
            None => Ok(None),
        }
    }

    async fn persist(&self, id: &StreamProcessorId, state: &StreamProcessorState) -> Result<()> {
        let state_data = serde_json::to_string(state)?;

        let query = Query::insert()
            .into_table(ProcessorStates::Table)
            .columns([
                ProcessorStates::Tenant,
                ProcessorStates::Processor,
                ProcessorStates::Stream,
                ProcessorStates::StateData,
                ProcessorStates::UpdatedAt,
            ])
            .values_panic([
                id.tenant.to_string().into(),
                id.processor.clone().into(),
                id.stream.clone().into(),
                state_data.into(),
                Utc::now().to_rfc3339().into(),
            ])
            .on_conflict(
                OnConflict::columns([
                    ProcessorStates::Tenant,
                    ProcessorStates::Processor,
                    ProcessorStates::Stream,
                ])
                .update_columns([ProcessorStates::StateData, ProcessorStates::UpdatedAt])
                .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;

        Ok(())
    }
}
