//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Event log table schema.
#[derive(Iden)]
pub enum EventLog {
    Table,
    #[iden = "tenant"]
    Tenant,
    #[iden = "sequence"]
    Sequence,
    #[iden = "event_source"]
    EventSource,
    #[iden = "root_type"]
    RootType,
    #[iden = "version"]
    Version,
    #[iden = "event_data"]
    EventData,
}

/// Derived stream events table schema.
#[derive(Iden)]
pub enum StreamEvents {
    Table,
    #[iden = "tenant"]
    Tenant,
    #[iden = "stream"]
    Stream,
    #[iden = "position"]
    Position,
    #[iden = "partition"]
    Partition,
    #[iden = "event_data"]
    EventData,
}

/// Per-stream watermark table schema.
#[derive(Iden)]
pub enum Watermarks {
    Table,
    #[iden = "tenant"]
    Tenant,
    #[iden = "stream"]
    Stream,
    #[iden = "next_position"]
    NextPosition,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Aggregate root version table schema.
#[derive(Iden)]
pub enum AggregateVersions {
    Table,
    #[iden = "tenant"]
    Tenant,
    #[iden = "event_source"]
    EventSource,
    #[iden = "root_type"]
    RootType,
    #[iden = "version"]
    Version,
}

/// Stream processor state table schema.
#[derive(Iden)]
pub enum ProcessorStates {
    Table,
    #[iden = "tenant"]
    Tenant,
    #[iden = "processor"]
    Processor,
    #[iden = "stream"]
    Stream,
    #[iden = "state_data"]
    StateData,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// SQL for creating the event log table.
pub const CREATE_EVENT_LOG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS event_log (
    tenant TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    event_source TEXT NOT NULL,
    root_type TEXT,
    version INTEGER,
    event_data TEXT NOT NULL,
    PRIMARY KEY (tenant, sequence)
);

CREATE INDEX IF NOT EXISTS idx_event_log_source ON event_log(tenant, event_source);
CREATE INDEX IF NOT EXISTS idx_event_log_aggregate ON event_log(tenant, event_source, root_type);
"#;

/// SQL for creating the derived stream events table.
pub const CREATE_STREAM_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stream_events (
    tenant TEXT NOT NULL,
    stream TEXT NOT NULL,
    position INTEGER NOT NULL,
    "partition" TEXT NOT NULL,
    event_data TEXT NOT NULL,
    PRIMARY KEY (tenant, stream, position)
);

CREATE INDEX IF NOT EXISTS idx_stream_events_partition ON stream_events(tenant, stream, "partition", position);
"#;

/// SQL for creating the watermarks table.
pub const CREATE_WATERMARKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS watermarks (
    tenant TEXT NOT NULL,
    stream TEXT NOT NULL,
    next_position INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (tenant, stream)
);
"#;

/// SQL for creating the aggregate versions table.
pub const CREATE_AGGREGATE_VERSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS aggregate_versions (
    tenant TEXT NOT NULL,
    event_source TEXT NOT NULL,
    root_type TEXT NOT NULL,
    version INTEGER NOT NULL,
    PRIMARY KEY (tenant, event_source, root_type)
);
"#;

/// SQL for creating the processor states table.
pub const CREATE_PROCESSOR_STATES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS processor_states (
    tenant TEXT NOT NULL,
    processor TEXT NOT NULL,
    stream TEXT NOT NULL,
    state_data TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (tenant, processor, stream)
);
"#;
