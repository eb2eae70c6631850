//! SQLite implementation of the event log and event fetcher.

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::{Acquire, Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::events::{
    AggregateMetadata, Commit, CommittedEvent, ExecutionContext, StreamEvent, UncommittedEvent,
    EVENT_LOG_STREAM,
};
use crate::interfaces::event_log::{EventFetcher, EventLog, Result, StorageError};
use crate::storage::schema::{AggregateVersions, EventLog as EventLogTable, StreamEvents, Watermarks};

/// SQLite implementation of the durable event log.
///
/// The append, the watermark bump, and every aggregate version update run
/// in one transaction; nothing is visible on failure.
pub struct SqliteEventLog {
    pool: SqlitePool,
}

impl SqliteEventLog {
    /// Create a new SQLite event log.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        use crate::storage::schema::{
            CREATE_AGGREGATE_VERSIONS_TABLE, CREATE_EVENT_LOG_TABLE, CREATE_STREAM_EVENTS_TABLE,
            CREATE_WATERMARKS_TABLE,
        };
        sqlx::query(CREATE_EVENT_LOG_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_STREAM_EVENTS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_WATERMARKS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_AGGREGATE_VERSIONS_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Next free position for a stream, inside the caller's transaction.
///
/// Bootstraps from the stream's last physical entry when the stream has
/// data but no watermark record yet; this recovery path runs once per
/// stream.
async fn next_position_tx(conn: &mut SqliteConnection, tenant: &str, stream: &str) -> Result<u64> {
    let query = Query::select()
        .column(Watermarks::NextPosition)
        .from(Watermarks::Table)
        .and_where(Expr::col(Watermarks::Tenant).eq(tenant))
        .and_where(Expr::col(Watermarks::Stream).eq(stream))
        .to_string(SqliteQueryBuilder);

    if let Some(row) = sqlx::query(&query).fetch_optional(&mut *conn).await? {
        let next: i64 = row.get("next_position");
        return Ok(next as u64);
    }

    // No watermark yet: recover it from the last physical entry.
    let query = if stream == EVENT_LOG_STREAM {
        Query::select()
            .expr(Expr::col(EventLogTable::Sequence).max())
            .from(EventLogTable::Table)
            .and_where(Expr::col(EventLogTable::Tenant).eq(tenant))
            .to_string(SqliteQueryBuilder)
    } else {
        Query::select()
            .expr(Expr::col(StreamEvents::Position).max())
            .from(StreamEvents::Table)
            .and_where(Expr::col(StreamEvents::Tenant).eq(tenant))
            .and_where(Expr::col(StreamEvents::Stream).eq(stream))
            .to_string(SqliteQueryBuilder)
    };

    let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
    let next = match row {
        Some(row) => {
            let max: Option<i64> = row.get(0);
            max.map(|m| m as u64 + 1).unwrap_or(0)
        }
        None => 0,
    };

    if next > 0 {
        update_watermark_tx(conn, tenant, stream, next).await?;
    }

    Ok(next)
}

/// Upsert a stream's watermark, inside the caller's transaction.
async fn update_watermark_tx(
    conn: &mut SqliteConnection,
    tenant: &str,
    stream: &str,
    next_position: u64,
) -> Result<()> {
    let query = Query::insert()
        .into_table(Watermarks::Table)
        .columns([
            Watermarks::Tenant,
            Watermarks::Stream,
            Watermarks::NextPosition,
            Watermarks::UpdatedAt,
        ])
        .values_panic([
            tenant.into(),
            stream.into(),
            (next_position as i64).into(),
            Utc::now().to_rfc3339().into(),
        ])
        .on_conflict(
            OnConflict::columns([Watermarks::Tenant, Watermarks::Stream])
                .update_columns([Watermarks::NextPosition, Watermarks::UpdatedAt])
                .to_owned(),
        )
        .to_string(SqliteQueryBuilder);

    sqlx::query(&query).execute(&mut *conn).await?;
    Ok(())
}

async fn aggregate_version_tx(
    conn: &mut SqliteConnection,
    tenant: &str,
    event_source: &str,
    root_type: Uuid,
) -> Result<Option<u64>> {
    let query = Query::select()
        .column(AggregateVersions::Version)
        .from(AggregateVersions::Table)
        .and_where(Expr::col(AggregateVersions::Tenant).eq(tenant))
        .and_where(Expr::col(AggregateVersions::EventSource).eq(event_source))
        .and_where(Expr::col(AggregateVersions::RootType).eq(root_type.to_string()))
        .to_string(SqliteQueryBuilder);

    let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
    Ok(row.map(|row| {
        let version: i64 = row.get("version");
        version as u64
    }))
}

fn decode_event(event_data: &str) -> Result<CommittedEvent> {
    Ok(serde_json::from_str(event_data)?)
}

fn sequence_conflict(e: sqlx::Error, position: u64) -> StorageError {
    match &e {
        sqlx::Error::Database(db)
            if db.kind() == sqlx::error::ErrorKind::UniqueViolation =>
        {
            StorageError::SequenceConflict { position }
        }
        _ => StorageError::from(e),
    }
}

fn stamp(
    event: UncommittedEvent,
    sequence: u64,
    occurred: chrono::DateTime<Utc>,
    context: &ExecutionContext,
    aggregate: Option<AggregateMetadata>,
) -> CommittedEvent {
    CommittedEvent {
        sequence,
        occurred,
        event_source: event.event_source,
        execution_context: context.clone(),
        artifact: event.artifact,
        public: event.public,
        content: event.content,
        aggregate,
    }
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn persist_commit(
        &self,
        context: &ExecutionContext,
        commit: Commit,
    ) -> Result<Vec<CommittedEvent>> {
        let tenant = context.tenant.to_string();
        let occurred = Utc::now();

        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let base_sequence = next_position_tx(&mut *tx, &tenant, EVENT_LOG_STREAM).await?;
        let mut sequence = base_sequence;
        let mut committed = Vec::with_capacity(commit.event_count());

        for event in commit.events {
            committed.push(stamp(event, sequence, occurred, context, None));
            sequence += 1;
        }

        for group in commit.aggregate_groups {
            let stored = aggregate_version_tx(&mut *tx, &tenant, &group.event_source, group.root_type)
                .await?
                .unwrap_or(0);
            if stored != group.expected_version {
                // Transaction dropped without commit; nothing is visible.
                return Err(StorageError::VersionConflict {
                    event_source: group.event_source,
                    root_type: group.root_type,
                    expected: group.expected_version,
                    stored,
                });
            }

            let next_version = group.expected_version + group.events.len() as u64;
            for (offset, mut event) in group.events.into_iter().enumerate() {
                event.event_source = group.event_source.clone();
                committed.push(stamp(
                    event,
                    sequence,
                    occurred,
                    context,
                    Some(AggregateMetadata {
                        root_type: group.root_type,
                        applied_version: group.expected_version + offset as u64 + 1,
                    }),
                ));
                sequence += 1;
            }

            let query = Query::insert()
                .into_table(AggregateVersions::Table)
                .columns([
                    AggregateVersions::Tenant,
                    AggregateVersions::EventSource,
                    AggregateVersions::RootType,
                    AggregateVersions::Version,
                ])
                .values_panic([
                    tenant.clone().into(),
                    group.event_source.clone().into(),
                    group.root_type.to_string().into(),
                    (next_version as i64).into(),
                ])
                .on_conflict(
                    OnConflict::columns([
                        AggregateVersions::Tenant,
                        AggregateVersions::EventSource,
                        AggregateVersions::RootType,
                    ])
                    .update_columns([AggregateVersions::Version])
                    .to_owned(),
                )
                .to_string(SqliteQueryBuilder);

            sqlx::query(&query).execute(&mut *tx).await?;
        }

        for event in &committed {
            let event_data = serde_json::to_string(event)?;
            let query = Query::insert()
                .into_table(EventLogTable::Table)
                .columns([
                    EventLogTable::Tenant,
                    EventLogTable::Sequence,
                    EventLogTable::EventSource,
                    EventLogTable::RootType,
                    EventLogTable::Version,
                    EventLogTable::EventData,
                ])
                .values_panic([
                    tenant.clone().into(),
                    (event.sequence as i64).into(),
                    event.event_source.clone().into(),
                    event.aggregate.map(|a| a.root_type.to_string()).into(),
                    event.aggregate.map(|a| a.applied_version as i64).into(),
                    event_data.into(),
                ])
                .to_string(SqliteQueryBuilder);

            sqlx::query(&query)
                .execute(&mut *tx)
                .await
                .map_err(|e| sequence_conflict(e, event.sequence))?;
        }

        update_watermark_tx(&mut *tx, &tenant, EVENT_LOG_STREAM, sequence).await?;

        tx.commit().await?;

        Ok(committed)
    }

    async fn next_position(&self, tenant: Uuid, stream: &str) -> Result<u64> {
        let tenant = tenant.to_string();
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;
        let next = next_position_tx(&mut *tx, &tenant, stream).await?;
        // Commit so a bootstrapped watermark is persisted.
        tx.commit().await?;
        Ok(next)
    }

    async fn aggregate_version(
        &self,
        tenant: Uuid,
        event_source: &str,
        root_type: Uuid,
    ) -> Result<Option<u64>> {
        let tenant = tenant.to_string();
        let mut conn = self.pool.acquire().await?;
        aggregate_version_tx(&mut *conn, &tenant, event_source, root_type).await
    }

    async fn fetch_for_aggregate(
        &self,
        tenant: Uuid,
        event_source: &str,
        root_type: Uuid,
    ) -> Result<Vec<CommittedEvent>> {
        let query = Query::select()
            .column(EventLogTable::EventData)
            .from(EventLogTable::Table)
            .and_where(Expr::col(EventLogTable::Tenant).eq(tenant.to_string()))
            .and_where(Expr::col(EventLogTable::EventSource).eq(event_source))
            .and_where(Expr::col(EventLogTable::RootType).eq(root_type.to_string()))
            .order_by(EventLogTable::Sequence, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let event_data: String = row.get("event_data");
            events.push(decode_event(&event_data)?);
        }

        Ok(events)
    }

    async fn append_to_stream(
        &self,
        tenant: Uuid,
        stream: &str,
        events: Vec<(String, CommittedEvent)>,
    ) -> Result<Vec<u64>> {
        let tenant = tenant.to_string();

        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let base = next_position_tx(&mut *tx, &tenant, stream).await?;
        let mut positions = Vec::with_capacity(events.len());

        for (offset, (partition, event)) in events.into_iter().enumerate() {
            let position = base + offset as u64;
            let event_data = serde_json::to_string(&event)?;

            let query = Query::insert()
                .into_table(StreamEvents::Table)
                .columns([
                    StreamEvents::Tenant,
                    StreamEvents::Stream,
                    StreamEvents::Position,
                    StreamEvents::Partition,
                    StreamEvents::EventData,
                ])
                .values_panic([
                    tenant.clone().into(),
                    stream.into(),
                    (position as i64).into(),
                    partition.into(),
                    event_data.into(),
                ])
                .to_string(SqliteQueryBuilder);

            sqlx::query(&query)
                .execute(&mut *tx)
                .await
                .map_err(|e| sequence_conflict(e, position))?;

            positions.push(position);
        }

        let next = base + positions.len() as u64;
        update_watermark_tx(&mut *tx, &tenant, stream, next).await?;

        tx.commit().await?;

        Ok(positions)
    }
}

#[async_trait]
impl EventFetcher for SqliteEventLog {
    async fn fetch(
        &self,
        tenant: Uuid,
        stream: &str,
        position: u64,
    ) -> Result<Option<StreamEvent>> {
        if stream == EVENT_LOG_STREAM {
            let query = Query::select()
                .column(EventLogTable::EventData)
                .from(EventLogTable::Table)
                .and_where(Expr::col(EventLogTable::Tenant).eq(tenant.to_string()))
                .and_where(Expr::col(EventLogTable::Sequence).eq(position as i64))
                .to_string(SqliteQueryBuilder);

            let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
            return match row {
                Some(row) => {
                    let event_data: String = row.get("event_data");
                    let event = decode_event(&event_data)?;
                    Ok(Some(StreamEvent {
                        stream: stream.to_string(),
                        position,
                        partition: event.event_source.clone(),
                        event,
                    }))
                }
                None => Ok(None),
            };
        }

        let query = Query::select()
            .column(StreamEvents::Partition)
            .column(StreamEvents::EventData)
            .from(StreamEvents::Table)
            .and_where(Expr::col(StreamEvents::Tenant).eq(tenant.to_string()))
            .and_where(Expr::col(StreamEvents::Stream).eq(stream))
            .and_where(Expr::col(StreamEvents::Position).eq(position as i64))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => {
                let partition: String = row.get("partition");
                let event_data: String = row.get("event_data");
                Ok(Some(StreamEvent {
                    stream: stream.to_string(),
                    position,
                    partition,
                    event: decode_event(&event_data)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn find_next(
        &self,
        tenant: Uuid,
        stream: &str,
        partition: &str,
        from: u64,
    ) -> Result<Option<u64>> {
        let query = if stream == EVENT_LOG_STREAM {
            Query::select()
                .expr(Expr::col(EventLogTable::Sequence).min())
                .from(EventLogTable::Table)
                .and_where(Expr::col(EventLogTable::Tenant).eq(tenant.to_string()))
                .and_where(Expr::col(EventLogTable::EventSource).eq(partition))
                .and_where(Expr::col(EventLogTable::Sequence).gte(from as i64))
                .to_string(SqliteQueryBuilder)
        } else {
            Query::select()
                .expr(Expr::col(StreamEvents::Position).min())
                .from(StreamEvents::Table)
                .and_where(Expr::col(StreamEvents::Tenant).eq(tenant.to_string()))
                .and_where(Expr::col(StreamEvents::Stream).eq(stream))
                .and_where(Expr::col(StreamEvents::Partition).eq(partition))
                .and_where(Expr::col(StreamEvents::Position).gte(from as i64))
                .to_string(SqliteQueryBuilder)
        };

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => {
                let min: Option<i64> = row.get(0);
                Ok(min.map(|p| p as u64))
            }
            None => Ok(None),
        }
    }
}
