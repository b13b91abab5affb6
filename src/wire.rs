use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveTime;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;

use crate::auth::SessiondAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct SessiondHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SessiondQueryParser>,
}

impl SessiondHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SessiondQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, query: &str, format: &Format) -> PgWireResult<Vec<Response>> {
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::debug!("rejected query: {e}");
                metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        tracing::debug!(command = label, "executing");

        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertProfessional { id, name } => {
                engine
                    .register_professional(id, name)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteProfessional { id } => {
                engine.remove_professional(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertLocal { id, name } => {
                engine.register_local(id, name).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteLocal { id } => {
                engine.remove_local(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertSession { session } => {
                engine.create_session(session).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::BatchInsertSessions { sessions } => {
                let created = engine
                    .batch_create_sessions(sessions)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("INSERT").with_rows(created.len()),
                )])
            }
            Command::UpdateSession { id, patch } => {
                engine.update_session(id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteSession { id } => {
                engine.delete_session(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::BatchDeleteSessions { ids } => {
                let removed = engine.batch_delete_sessions(ids).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(removed))])
            }
            Command::SelectSession { id } => {
                let sessions = match engine.get_session(id).await {
                    Ok(session) => vec![session],
                    Err(EngineError::SessionNotFound(_)) => Vec::new(),
                    Err(e) => return Err(engine_err(e)),
                };
                Ok(vec![session_rows(&sessions, format)])
            }
            Command::SelectSessions { filter } => {
                let sessions = engine.fetch_sessions(&filter).await.map_err(engine_err)?;
                Ok(vec![session_rows(&sessions, format)])
            }
            Command::SelectProfessionals => {
                Ok(vec![directory_rows(&engine.list_professionals().await, format)])
            }
            Command::SelectLocals => Ok(vec![directory_rows(&engine.list_locals().await, format)]),
            Command::SelectConflicts { request } => {
                let report = engine.check_conflicts(&request).await.map_err(engine_err)?;
                Ok(vec![conflict_rows(&report, format)])
            }
            Command::SelectAvailability {
                date,
                professional_id,
                local_id,
                window,
            } => {
                let availability = engine
                    .day_availability(date, professional_id, local_id, window)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![availability_rows(&availability, format)])
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

type Columns = Vec<(&'static str, Type)>;

fn session_columns() -> Columns {
    vec![
        ("id", Type::VARCHAR),
        ("title", Type::VARCHAR),
        ("date", Type::VARCHAR),
        ("start_time", Type::VARCHAR),
        ("end_time", Type::VARCHAR),
        ("state", Type::VARCHAR),
        ("capacity", Type::INT8),
        ("registered_count", Type::INT8),
        ("session_link", Type::VARCHAR),
        ("professional_id", Type::VARCHAR),
        ("local_id", Type::VARCHAR),
        ("community_service_id", Type::VARCHAR),
    ]
}

fn directory_columns() -> Columns {
    vec![("id", Type::VARCHAR), ("kind", Type::VARCHAR), ("name", Type::VARCHAR)]
}

/// The rule that fired, followed by the conflicting session.
fn conflict_columns() -> Columns {
    let mut columns = vec![("rule", Type::VARCHAR)];
    columns.extend(session_columns());
    columns
}

/// Busy slots first (`kind` professional or local), then free gaps (`kind` free).
fn availability_columns() -> Columns {
    vec![
        ("date", Type::VARCHAR),
        ("kind", Type::VARCHAR),
        ("start_time", Type::VARCHAR),
        ("end_time", Type::VARCHAR),
        ("session_id", Type::VARCHAR),
        ("title", Type::VARCHAR),
    ]
}

/// Field descriptions in the result format the client asked for.
fn fields(columns: Columns, format: &Format) -> Vec<FieldInfo> {
    columns
        .into_iter()
        .enumerate()
        .map(|(i, (name, ty))| FieldInfo::new(name.into(), None, None, ty, format.format_for(i)))
        .collect()
}

fn format_time(t: NaiveTime) -> String {
    t.format("%H:%M:%S").to_string()
}

fn encode_session(encoder: &mut DataRowEncoder, s: &Session) -> PgWireResult<()> {
    encoder.encode_field(&s.id.to_string())?;
    encoder.encode_field(&s.title)?;
    encoder.encode_field(&s.date.to_string())?;
    encoder.encode_field(&format_time(s.span.start))?;
    encoder.encode_field(&format_time(s.span.end))?;
    encoder.encode_field(&s.state.as_str().to_string())?;
    encoder.encode_field(&i64::from(s.capacity))?;
    encoder.encode_field(&i64::from(s.registered_count))?;
    encoder.encode_field(&s.session_link)?;
    encoder.encode_field(&s.professional_id.to_string())?;
    encoder.encode_field(&s.local_id.map(|id| id.to_string()))?;
    encoder.encode_field(&s.community_service_id.map(|id| id.to_string()))?;
    Ok(())
}

fn session_rows(sessions: &[Session], format: &Format) -> Response {
    let schema = Arc::new(fields(session_columns(), format));
    let rows: Vec<PgWireResult<_>> = sessions
        .iter()
        .map(|s| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_session(&mut encoder, s)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn directory_rows(entries: &[DirectoryEntry], format: &Format) -> Response {
    let schema = Arc::new(fields(directory_columns(), format));
    let rows: Vec<PgWireResult<_>> = entries
        .iter()
        .map(|entry| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&entry.id.to_string())?;
            encoder.encode_field(&entry.kind.as_str().to_string())?;
            encoder.encode_field(&entry.name)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn conflict_rows(report: &ConflictReport, format: &Format) -> Response {
    let schema = Arc::new(fields(conflict_columns(), format));
    let tagged = report
        .professional_conflicts
        .iter()
        .map(|s| (ConflictReason::Professional, s))
        .chain(
            report
                .local_conflicts
                .iter()
                .map(|s| (ConflictReason::Local, s)),
        );
    let rows: Vec<PgWireResult<_>> = tagged
        .map(|(reason, s)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&reason.as_str().to_string())?;
            encode_session(&mut encoder, s)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn availability_rows(availability: &DayAvailability, format: &Format) -> Response {
    let schema = Arc::new(fields(availability_columns(), format));
    let date = availability.date.to_string();
    let busy = availability.busy_slots.iter().map(|slot| {
        (
            slot.kind.as_str(),
            slot.span,
            Some(slot.session_id.to_string()),
            Some(slot.title.clone()),
        )
    });
    let free = availability
        .free
        .iter()
        .map(|span| ("free", *span, None, None));
    let rows: Vec<PgWireResult<_>> = busy
        .chain(free)
        .map(|(kind, span, session_id, title)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&date)?;
            encoder.encode_field(&kind.to_string())?;
            encoder.encode_field(&format_time(span.start))?;
            encoder.encode_field(&format_time(span.end))?;
            encoder.encode_field(&session_id)?;
            encoder.encode_field(&title)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Row description for a statement, picked from the table it selects from.
/// Statements with `$n` placeholders can't be parsed yet, so this looks at
/// the raw text.
fn result_columns(sql: &str) -> Columns {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    let table = upper
        .split_once(" FROM ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_end_matches(';'));
    match table {
        Some("SESSIONS") => session_columns(),
        Some("PROFESSIONALS") | Some("LOCALS") => directory_columns(),
        Some("CONFLICTS") => conflict_columns(),
        Some("AVAILABILITY") => availability_columns(),
        _ => vec![],
    }
}

fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    fields(result_columns(sql), format)
}

#[async_trait]
impl SimpleQueryHandler for SessiondHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query, &Format::UnifiedText).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SessiondQueryParser;

#[async_trait]
impl QueryParser for SessiondQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(
            stmt,
            column_format.unwrap_or(&Format::UnifiedText),
        ))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SessiondHandler {
    type Statement = String;
    type QueryParser = SessiondQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let mut responses = self.run(&sql, &portal.result_column_format).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement, &Format::UnifiedText),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals. Highest index first so
/// `$1` doesn't clobber the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

/// Per-server handler set. Every field is shared, so cloning one per
/// connection is cheap.
#[derive(Clone)]
pub struct SessiondFactory {
    handler: Arc<SessiondHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SessiondAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SessiondFactory {
    pub fn new(engine: Arc<Engine>, password: impl Into<String>) -> Self {
        let auth_source = SessiondAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SessiondHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SessiondFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(socket: TcpStream, factory: SessiondFactory) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// Application code in the SQLSTATE field, message verbatim.
fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::Wal(detail) = &e {
        tracing::error!("storage failure: {detail}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.code().into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
