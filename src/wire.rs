use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::engine::{EngineError, ReservationEngine};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct ClaimdHandler {
    tenants: Arc<TenantManager>,
    query_parser: Arc<ClaimdQueryParser>,
}

impl ClaimdHandler {
    pub fn new(tenants: Arc<TenantManager>) -> Self {
        Self {
            tenants,
            query_parser: Arc::new(ClaimdQueryParser),
        }
    }

    async fn resolve_engine<C: ClientInfo>(
        &self,
        client: &C,
    ) -> PgWireResult<Arc<ReservationEngine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenants
            .get_or_create(&db)
            .await
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Parse, execute and record one statement.
    async fn run(
        &self,
        engine: &ReservationEngine,
        query: &str,
        format: &Format,
    ) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let command = observability::command_label(&cmd);

        let started = Instant::now();
        let result = execute_command(engine, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => command, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => command)
            .record(started.elapsed().as_secs_f64());
        debug!(command, status, "query");

        result.map_err(engine_err)
    }
}

async fn execute_command(
    engine: &ReservationEngine,
    cmd: Command,
    format: &Format,
) -> Result<Response, EngineError> {
    match cmd {
        Command::InsertResource { id, capacity, name } => {
            engine.create_resource(id, name, capacity).await?;
            Ok(insert_tag(1))
        }
        Command::DeleteResource { id } => {
            engine.delete_resource(&id).await?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::SelectResources { id } => {
            let resources = match id {
                Some(id) => vec![engine.resource(&id).await?],
                None => engine.resources().await?,
            };
            Ok(resource_rows(resources, format))
        }
        Command::InsertClaim {
            resource_id,
            claimant_id,
        } => {
            let rows = match engine.reserve(&resource_id, &claimant_id).await? {
                ReserveOutcome::Reserved(_) => 1,
                ReserveOutcome::AlreadyReserved(_) => 0,
            };
            Ok(insert_tag(rows))
        }
        Command::DeleteClaim {
            resource_id,
            claimant_id,
        } => {
            let rows = match engine.cancel(&resource_id, &claimant_id).await? {
                CancelOutcome::Released(_) => 1,
                CancelOutcome::NotClaimed => 0,
            };
            Ok(Response::Execution(Tag::new("DELETE").with_rows(rows)))
        }
        Command::SelectClaims { resource_id } => {
            let claims = engine.list_claims(&resource_id).await?;
            Ok(claim_rows(claims, format))
        }
    }
}

fn insert_tag(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_oid(0).with_rows(rows))
}

fn resource_rows(resources: Vec<Resource>, format: &Format) -> Response {
    let schema = Arc::new(resources_schema(format));
    let rows: Vec<PgWireResult<_>> = resources
        .into_iter()
        .map(|rs| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&rs.id.to_string())?;
            encoder.encode_field(&rs.name)?;
            encoder.encode_field(&i64::from(rs.capacity))?;
            encoder.encode_field(&(rs.claimed() as i64))?;
            encoder.encode_field(&(rs.version as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn claim_rows(claims: Vec<Claim>, format: &Format) -> Response {
    let schema = Arc::new(claims_schema(format));
    let rows: Vec<PgWireResult<_>> = claims
        .into_iter()
        .map(|claim| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&claim.id.to_string())?;
            encoder.encode_field(&claim.resource_id.to_string())?;
            encoder.encode_field(&claim.claimant_id.to_string())?;
            encoder.encode_field(&claim.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Field list in the result format the client asked for.
fn schema(fields: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    fields
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            FieldInfo::new(name.to_string(), None, None, ty.clone(), format.format_for(i))
        })
        .collect()
}

fn resources_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("capacity", Type::INT8),
            ("claimed", Type::INT8),
            ("version", Type::INT8),
        ],
        format,
    )
}

fn claims_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[
            ("id", Type::VARCHAR),
            ("resource_id", Type::VARCHAR),
            ("claimant_id", Type::VARCHAR),
            ("created_at", Type::INT8),
        ],
        format,
    )
}

/// Row description for a statement that may still hold `$n` placeholders.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if !upper.starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("CLAIMS") {
        claims_schema(format)
    } else if upper.contains("RESOURCES") {
        resources_schema(format)
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for ClaimdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client).await?;
        Ok(vec![self.run(&engine, query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ClaimdQueryParser;

#[async_trait]
impl QueryParser for ClaimdQueryParser {
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
        Ok(vec![Type::VARCHAR; count_params(stmt)?])
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
impl ExtendedQueryHandler for ClaimdHandler {
    type Statement = String;
    type QueryParser = ClaimdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client).await?;
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&engine, &sql, &portal.result_column_format).await
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
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)?];
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

/// The protocol carries the parameter count as an Int16.
const MAX_PARAMS: usize = u16::MAX as usize;

/// Highest `$N` placeholder in `sql`, capped at [`MAX_PARAMS`].
fn count_params(sql: &str) -> PgWireResult<usize> {
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
        let digits = &sql[start..i];
        if digits.is_empty() {
            continue;
        }
        match digits.parse::<usize>() {
            Ok(n) if n <= MAX_PARAMS => max = max.max(n),
            _ => {
                return Err(user_error(
                    "42601",
                    format!("placeholder ${digits} exceeds {MAX_PARAMS} parameters"),
                ));
            }
        }
    }
    Ok(max)
}

/// Inline bound text-format parameters as quoted literals. Higher indices go
/// first so `$1` never clobbers the prefix of `$10`.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Auth ─────────────────────────────────────────────────────────

/// One shared cleartext password for every user and database.
#[derive(Debug)]
pub struct PasswordAuthSource {
    password: String,
}

impl PasswordAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for PasswordAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ClaimdFactory {
    handler: Arc<ClaimdHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<PasswordAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ClaimdFactory {
    pub fn new(tenants: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(ClaimdHandler::new(tenants)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                PasswordAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ClaimdFactory {
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
pub async fn process_connection(
    socket: TcpStream,
    tenants: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(ClaimdFactory::new(tenants, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engine failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::Full { .. } => "53400",
        EngineError::ConflictExhausted { .. } => "40001",
        EngineError::DuplicateInFlight { .. } => "55P03",
        EngineError::InvalidId(_) | EngineError::InvalidCapacity(_) => "22023",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::HasClaims { .. } => "2BP01",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Storage(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BackoffPolicy;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM resources").unwrap(), 0);
        assert_eq!(
            count_params("INSERT INTO claims (resource_id, claimant_id) VALUES ($1, $2)").unwrap(),
            2
        );
        assert_eq!(count_params("SELECT $3, $1, $12").unwrap(), 12);
        assert_eq!(count_params("SELECT '$'").unwrap(), 0);
        assert_eq!(count_params("SELECT $65535").unwrap(), 65535);
    }

    fn error_code(err: PgWireError) -> String {
        match err {
            PgWireError::UserError(info) => info.code,
            other => panic!("expected a user error, got {other:?}"),
        }
    }

    #[test]
    fn oversized_placeholder_is_a_syntax_error() {
        let err = count_params("SELECT * FROM claims WHERE resource_id = $99999999999")
            .err()
            .expect("placeholder should be rejected");
        assert_eq!(error_code(err), "42601");

        let err = count_params("SELECT $65536").err().expect("over the limit");
        assert_eq!(error_code(err), "42601");

        let err = count_params("SELECT $999999999999999999999999999")
            .err()
            .expect("overflows usize");
        assert_eq!(error_code(err), "42601");
    }

    #[test]
    fn substitute_params_quotes_and_escapes() {
        let params = vec![Some(b"room-1".to_vec()), Some(b"o'brien".to_vec())];
        let sql = substitute_params(
            "DELETE FROM claims WHERE resource_id = $1 AND claimant_id = $2",
            &params,
        );
        assert_eq!(
            sql,
            "DELETE FROM claims WHERE resource_id = 'room-1' AND claimant_id = 'o''brien'"
        );
    }

    #[test]
    fn substitute_params_handles_double_digits_and_null() {
        let mut params: Vec<Option<Vec<u8>>> = (1..=10)
            .map(|i| Some(i.to_string().into_bytes()))
            .collect();
        params[1] = None;
        let sql = substitute_params("$1 $2 $10", &params);
        assert_eq!(sql, "'1' NULL '10'");
    }

    #[test]
    fn result_schema_follows_table() {
        assert_eq!(
            result_schema(
                "SELECT * FROM claims WHERE resource_id = $1",
                &Format::UnifiedText
            )
            .len(),
            4
        );
        assert_eq!(
            result_schema("select * from resources", &Format::UnifiedBinary).len(),
            5
        );
        assert!(result_schema("INSERT INTO claims VALUES ($1, $2)", &Format::UnifiedText).is_empty());
    }

    #[test]
    fn engine_errors_map_to_sqlstate() {
        let rid = ResourceId::from("r");
        assert_eq!(sqlstate(&EngineError::NotFound(rid.clone())), "P0002");
        assert_eq!(
            sqlstate(&EngineError::Full {
                resource_id: rid.clone(),
                capacity: 1
            }),
            "53400"
        );
        assert_eq!(
            sqlstate(&EngineError::ConflictExhausted {
                resource_id: rid.clone(),
                attempts: 3
            }),
            "40001"
        );
        assert_eq!(
            sqlstate(&EngineError::DuplicateInFlight {
                resource_id: rid,
                claimant_id: ClaimantId::from("c"),
            }),
            "55P03"
        );
        assert_eq!(sqlstate(&EngineError::InvalidCapacity(0)), "22023");
    }

    async fn exec(engine: &ReservationEngine, sql: &str) -> Result<Response, EngineError> {
        execute_command(engine, sql::parse_sql(sql).unwrap(), &Format::UnifiedText).await
    }

    fn is_execution(resp: Response) -> bool {
        matches!(resp, Response::Execution(_))
    }

    #[tokio::test]
    async fn claim_commands_drive_engine() {
        let engine = ReservationEngine::in_memory(BackoffPolicy::immediate(3));
        exec(&engine, "INSERT INTO resources (id, capacity) VALUES ('r', 1)")
            .await
            .unwrap();

        let reserve = "INSERT INTO claims (resource_id, claimant_id) VALUES ('r', 'a')";
        assert!(is_execution(exec(&engine, reserve).await.unwrap()));
        // Repeating the reserve is accepted without taking a second slot.
        assert!(is_execution(exec(&engine, reserve).await.unwrap()));

        let err = exec(
            &engine,
            "INSERT INTO claims (resource_id, claimant_id) VALUES ('r', 'b')",
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::Full { .. }));

        let cancel = "DELETE FROM claims WHERE resource_id = 'r' AND claimant_id = 'a'";
        assert!(is_execution(exec(&engine, cancel).await.unwrap()));
        assert!(is_execution(exec(&engine, cancel).await.unwrap()));
        assert!(
            engine
                .list_claimants(&ResourceId::from("r"))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn select_commands_return_rows() {
        let engine = ReservationEngine::in_memory(BackoffPolicy::immediate(3));
        exec(&engine, "INSERT INTO resources (id, capacity) VALUES ('r', 2)")
            .await
            .unwrap();
        assert!(matches!(
            exec(&engine, "SELECT * FROM resources").await.unwrap(),
            Response::Query(_)
        ));
        assert!(matches!(
            exec(&engine, "SELECT * FROM claims WHERE resource_id = 'r'")
                .await
                .unwrap(),
            Response::Query(_)
        ));
        let err = exec(&engine, "SELECT * FROM claims WHERE resource_id = 'gone'")
            .await
            .err()
            .unwrap();
        assert_eq!(sqlstate(&err), "P0002");
    }

    #[tokio::test]
    async fn deleting_claimed_resource_fails() {
        let engine = ReservationEngine::in_memory(BackoffPolicy::immediate(3));
        exec(&engine, "INSERT INTO resources (id, capacity) VALUES ('r', 2)")
            .await
            .unwrap();
        exec(
            &engine,
            "INSERT INTO claims (resource_id, claimant_id) VALUES ('r', 'a')",
        )
        .await
        .unwrap();

        let err = exec(&engine, "DELETE FROM resources WHERE id = 'r'")
            .await
            .err()
            .unwrap();
        assert_eq!(sqlstate(&err), "2BP01");
    }
}
