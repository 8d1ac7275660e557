//! SQLite storage backend.
//!
//! Records live in one table per schema table: an `id` primary key, a
//! `_status` lifecycle column, and one column per schema column. Local
//! storage entries live in a distinguished `local_storage` table. The
//! schema version marker is SQLite's `user_version` pragma.

use crate::{
    backend::StorageBackend,
    call::RawStatement,
    error::{AdapterError, Result},
};
use duffel_store::{
    migration_chain, BatchOperation, Clause, ColumnType, Comparison, Migration, MigrationStep,
    RawRecord, RecordId, RecordStatus, Schema, SchemaVersion, SerializedQuery, SortDirection,
    TableName, TableSchema, ID_FIELD, STATUS_FIELD,
};
use rusqlite::{params_from_iter, types::Value as SqlValue, Connection};
use serde_json::Value;
use std::path::Path;

/// The narrow relational surface the backend is built on.
///
/// Owns the one live connection; ownership by a single execution context is
/// what makes the `&mut self` methods safe without locking.
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    /// Open a database file. `:memory:` is accepted.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        if path != Path::new(":memory:") {
            // WAL for better concurrent read performance on real files
            let _: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        }
        Ok(Self { conn })
    }

    /// Execute a statement, returning the number of affected rows.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let n = self
            .conn
            .execute(sql, params_from_iter(params.iter().cloned()))?;
        Ok(n)
    }

    /// Run a query, mapping each row through `f`.
    pub fn query_rows<T, F>(&self, sql: &str, params: &[SqlValue], mut f: F) -> Result<Vec<T>>
    where
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter().cloned()), |row| f(row))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Run `body` inside a transaction; rolled back unless it succeeds.
    pub fn transaction<T, F>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let tx = self.conn.transaction()?;
        let result = body(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// The stored schema version marker.
    pub fn user_version(&self) -> Result<SchemaVersion> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version as SchemaVersion)
    }

    /// Set the schema version marker.
    pub fn set_user_version(&self, version: SchemaVersion) -> Result<()> {
        self.conn
            .pragma_update(None, "user_version", version as i64)?;
        Ok(())
    }

    /// Get a local storage entry.
    pub fn get_local_storage_entry(&self, key: &str) -> Result<Option<String>> {
        use rusqlite::OptionalExtension;
        let value = self
            .conn
            .query_row(
                "SELECT value FROM local_storage WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Create or overwrite a local storage entry.
    pub fn set_local_storage_entry(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO local_storage (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    /// Remove a local storage entry. Missing keys are a no-op.
    pub fn remove_local_storage_entry(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM local_storage WHERE key = ?1", [key])?;
        Ok(())
    }

    /// Names of all user tables, enumerable for destructive reset.
    pub fn table_names(&self) -> Result<Vec<String>> {
        self.query_rows(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
            &[],
            |row| row.get(0),
        )
    }

    /// Drop every user table and reset the version marker to 0.
    pub fn destroy_everything(&mut self) -> Result<()> {
        let tables = self.table_names()?;
        for table in tables {
            self.conn
                .execute_batch(&format!("DROP TABLE {}", quote_ident(&table)))?;
        }
        self.set_user_version(0)?;
        Ok(())
    }
}

/// `StorageBackend` over [`SqliteDatabase`].
pub struct SqliteBackend {
    db: SqliteDatabase,
    schema: Schema,
    migrations: Vec<Migration>,
}

impl SqliteBackend {
    /// Open (but do not yet set up) a SQLite backend.
    pub fn open<P: AsRef<Path>>(
        path: P,
        schema: Schema,
        migrations: Vec<Migration>,
    ) -> Result<Self> {
        let db = SqliteDatabase::open(path)?;
        Ok(Self {
            db,
            schema,
            migrations,
        })
    }

    fn table_schema(&self, table: &str) -> Result<&TableSchema> {
        schema_table(&self.schema, table)
    }

    fn create_schema_tables(conn: &Connection, schema: &Schema) -> Result<()> {
        for table in schema.tables.values() {
            conn.execute_batch(&create_table_sql(table))?;
        }
        Ok(())
    }

    fn apply_migrations(&mut self, stored: SchemaVersion) -> Result<()> {
        let chain = migration_chain(&self.migrations, stored, self.schema.version)
            .map_err(|e| AdapterError::SetUpFailure(e.to_string()))?;

        for migration in chain {
            tracing::info!(to_version = migration.to_version, "running migration");
            self.db.transaction(|conn| {
                for step in &migration.steps {
                    match step {
                        MigrationStep::CreateTable(table) => {
                            conn.execute_batch(&create_table_sql(table))?;
                        }
                        MigrationStep::AddColumns { table, columns } => {
                            for column in columns {
                                conn.execute_batch(&format!(
                                    "ALTER TABLE {} ADD COLUMN {} {}",
                                    quote_ident(table),
                                    quote_ident(&column.name),
                                    sql_type(column.column_type),
                                ))?;
                            }
                        }
                    }
                }
                Ok(())
            })?;
            self.db.set_user_version(migration.to_version)?;
        }
        Ok(())
    }

    fn select_records(
        &self,
        query: &SerializedQuery,
        include_deleted: bool,
    ) -> Result<Vec<RawRecord>> {
        let table_schema = self.table_schema(query.table())?;
        let (sql, params) = select_sql(table_schema, query, include_deleted);
        self.db
            .query_rows(&sql, &params, |row| row_to_record(table_schema, row))
    }
}

impl StorageBackend for SqliteBackend {
    fn set_up(&mut self) -> Result<()> {
        self.db
            .execute(
                "CREATE TABLE IF NOT EXISTS local_storage (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL
                )",
                &[],
            )
            .map_err(|e| AdapterError::SetUpFailure(e.to_string()))?;

        let stored = self.db.user_version()?;
        let target = self.schema.version;

        if stored == 0 {
            tracing::info!(version = target, "setting up fresh database");
            let schema = self.schema.clone();
            self.db
                .transaction(|conn| Self::create_schema_tables(conn, &schema))
                .map_err(|e| AdapterError::SetUpFailure(e.to_string()))?;
            self.db.set_user_version(target)?;
        } else if stored < target {
            self.apply_migrations(stored)
                .map_err(|e| match e {
                    AdapterError::SetUpFailure(_) => e,
                    other => AdapterError::SetUpFailure(other.to_string()),
                })?;
        } else if stored > target {
            return Err(AdapterError::SetUpFailure(format!(
                "database version {} is newer than schema version {}",
                stored, target
            )));
        }
        Ok(())
    }

    fn find(&mut self, table: &TableName, id: &RecordId) -> Result<Option<RawRecord>> {
        let query = SerializedQuery::new(table.clone())
            .and_where(ID_FIELD, Comparison::Eq(Value::String(id.clone())))
            .limit(1);
        let mut records = self.select_records(&query, false)?;
        Ok(records.pop())
    }

    fn query(&mut self, query: &SerializedQuery) -> Result<Vec<RawRecord>> {
        self.select_records(query, false)
    }

    fn query_ids(&mut self, query: &SerializedQuery) -> Result<Vec<RecordId>> {
        let records = self.select_records(query, false)?;
        Ok(records
            .iter()
            .filter_map(|r| r.id().map(str::to_string))
            .collect())
    }

    fn unsafe_query_raw(&mut self, query: &SerializedQuery) -> Result<Vec<Value>> {
        let records = self.select_records(query, true)?;
        Ok(records.iter().map(RawRecord::to_value).collect())
    }

    fn count(&mut self, query: &SerializedQuery) -> Result<usize> {
        let table_schema = self.table_schema(query.table())?;
        let (sql, params) = count_sql(table_schema, query);
        let counts: Vec<i64> = self.db.query_rows(&sql, &params, |row| row.get(0))?;
        Ok(counts.first().copied().unwrap_or(0) as usize)
    }

    fn batch(&mut self, operations: &[BatchOperation]) -> Result<()> {
        // The transaction borrows the connection mutably, so operations go
        // through a free function that borrows only the schema
        let schema = &self.schema;
        let tx = self.db.conn.transaction()?;
        let mut result = Ok(());
        for op in operations {
            if let Err(e) = apply_operation(schema, &tx, op) {
                result = Err(e);
                break;
            }
        }
        match result {
            Ok(()) => {
                tx.commit()?;
                Ok(())
            }
            Err(e) => {
                // Dropping the transaction rolls it back
                drop(tx);
                Err(e)
            }
        }
    }

    fn get_deleted_records(&mut self, table: &TableName) -> Result<Vec<RecordId>> {
        self.table_schema(table)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = 'deleted' ORDER BY {}",
            quote_ident(ID_FIELD),
            quote_ident(table),
            quote_ident(STATUS_FIELD),
            quote_ident(ID_FIELD),
        );
        self.db.query_rows(&sql, &[], |row| row.get(0))
    }

    fn unsafe_execute(&mut self, statements: &[RawStatement]) -> Result<()> {
        self.db.transaction(|conn| {
            for statement in statements {
                let params: Vec<SqlValue> = statement.args.iter().map(json_to_sql).collect();
                conn.execute(&statement.sql, params_from_iter(params))?;
            }
            Ok(())
        })
    }

    fn get_local(&mut self, key: &str) -> Result<Option<String>> {
        self.db.get_local_storage_entry(key)
    }

    fn set_local(&mut self, key: &str, value: &str) -> Result<()> {
        self.db.set_local_storage_entry(key, value)
    }

    fn remove_local(&mut self, key: &str) -> Result<()> {
        self.db.remove_local_storage_entry(key)
    }

    fn unsafe_reset(&mut self) -> Result<()> {
        tracing::warn!("resetting database: dropping all tables");
        self.db.destroy_everything()?;
        self.db.execute(
            "CREATE TABLE IF NOT EXISTS local_storage (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            )",
            &[],
        )?;
        let schema = self.schema.clone();
        self.db
            .transaction(|conn| Self::create_schema_tables(conn, &schema))?;
        // The version marker stays at 0: the data is gone, so the database
        // reads as uninitialized until the next set_up.
        Ok(())
    }

    fn user_version(&mut self) -> Result<SchemaVersion> {
        self.db.user_version()
    }

    fn close(&mut self) -> Result<()> {
        tracing::debug!("closing sqlite backend");
        Ok(())
    }
}

fn schema_table<'a>(schema: &'a Schema, table: &str) -> Result<&'a TableSchema> {
    schema
        .get_table(table)
        .ok_or_else(|| AdapterError::StorageFailure {
            table: Some(table.to_string()),
            id: None,
            message: "table not found".into(),
        })
}

/// Apply one batch operation inside an open transaction.
fn apply_operation(schema: &Schema, conn: &Connection, op: &BatchOperation) -> Result<()> {
    match op {
        BatchOperation::Create { table, id, record } => {
            let table_schema = schema_table(schema, table)?;
            schema.validate_payload(table, record.fields())?;

            let (columns, mut params) = record_params(table_schema, record);
            params.insert(0, SqlValue::Text(id.clone()));
            params.insert(1, SqlValue::Text(status_for(record, RecordStatus::Created)));

            let mut names = vec![quote_ident(ID_FIELD), quote_ident(STATUS_FIELD)];
            names.extend(columns.iter().map(|c| quote_ident(c)));
            let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(table),
                names.join(", "),
                placeholders.join(", "),
            );

            conn.execute(&sql, params_from_iter(params))
                .map_err(|e| match e {
                    rusqlite::Error::SqliteFailure(code, _)
                        if code.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        AdapterError::StorageFailure {
                            table: Some(table.clone()),
                            id: Some(id.clone()),
                            message: "record already exists".into(),
                        }
                    }
                    other => other.into(),
                })?;
            Ok(())
        }
        BatchOperation::Update { table, id, record } => {
            let table_schema = schema_table(schema, table)?;
            schema.validate_payload(table, record.fields())?;

            let (columns, mut params) = record_params(table_schema, record);
            params.insert(0, SqlValue::Text(status_for(record, RecordStatus::Updated)));

            let mut assignments = vec![format!("{} = ?1", quote_ident(STATUS_FIELD))];
            for (i, column) in columns.iter().enumerate() {
                assignments.push(format!("{} = ?{}", quote_ident(column), i + 2));
            }
            params.push(SqlValue::Text(id.clone()));
            let sql = format!(
                "UPDATE {} SET {} WHERE {} = ?{}",
                quote_ident(table),
                assignments.join(", "),
                quote_ident(ID_FIELD),
                params.len(),
            );

            let affected = conn.execute(&sql, params_from_iter(params))?;
            if affected == 0 {
                return Err(AdapterError::StorageFailure {
                    table: Some(table.clone()),
                    id: Some(id.clone()),
                    message: "record not found".into(),
                });
            }
            Ok(())
        }
        BatchOperation::DestroyPermanently { table, id } => {
            // Missing id is a no-op, like any other DELETE
            let sql = format!(
                "DELETE FROM {} WHERE {} = ?1",
                quote_ident(table),
                quote_ident(ID_FIELD),
            );
            conn.execute(&sql, [id])?;
            Ok(())
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::String => "TEXT",
        ColumnType::Int => "INTEGER",
        ColumnType::Float => "REAL",
        ColumnType::Bool => "INTEGER",
        ColumnType::Timestamp => "INTEGER",
        ColumnType::Json => "TEXT",
    }
}

fn create_table_sql(table: &TableSchema) -> String {
    let mut columns = vec![
        format!("{} TEXT PRIMARY KEY NOT NULL", quote_ident(ID_FIELD)),
        format!(
            "{} TEXT NOT NULL DEFAULT 'created'",
            quote_ident(STATUS_FIELD)
        ),
    ];
    for column in &table.columns {
        columns.push(format!(
            "{} {}",
            quote_ident(&column.name),
            sql_type(column.column_type)
        ));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({});
         CREATE INDEX IF NOT EXISTS {} ON {} ({});",
        quote_ident(&table.name),
        columns.join(", "),
        quote_ident(&format!("idx_{}_status", table.name)),
        quote_ident(&table.name),
        quote_ident(STATUS_FIELD),
    )
}

/// Column names and bound values for a record's schema columns, in schema
/// order. Missing fields bind as NULL.
fn record_params(table: &TableSchema, record: &RawRecord) -> (Vec<String>, Vec<SqlValue>) {
    let mut columns = Vec::with_capacity(table.columns.len());
    let mut params = Vec::with_capacity(table.columns.len());
    for column in &table.columns {
        columns.push(column.name.clone());
        match record.get(&column.name) {
            Some(value) => params.push(json_to_sql(value)),
            None => params.push(SqlValue::Null),
        }
    }
    (columns, params)
}

fn status_for(record: &RawRecord, default: RecordStatus) -> String {
    let status = record
        .get(STATUS_FIELD)
        .and_then(Value::as_str)
        .and_then(RecordStatus::parse)
        .unwrap_or(default);
    status.as_str().to_string()
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        // Nested structures persist as JSON text
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(column_type: ColumnType, value: SqlValue) -> Value {
    match (column_type, value) {
        (_, SqlValue::Null) => Value::Null,
        (ColumnType::Bool, SqlValue::Integer(i)) => Value::Bool(i != 0),
        (ColumnType::Json, SqlValue::Text(s)) => {
            serde_json::from_str(&s).unwrap_or(Value::String(s))
        }
        (_, SqlValue::Integer(i)) => Value::from(i),
        (_, SqlValue::Real(r)) => Value::from(r),
        (_, SqlValue::Text(s)) => Value::String(s),
        (_, SqlValue::Blob(_)) => Value::Null,
    }
}

fn row_to_record(table: &TableSchema, row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    let mut record = RawRecord::empty();

    let id: String = row.get(0)?;
    let status: String = row.get(1)?;
    record.set(ID_FIELD, Value::String(id));
    record.set(STATUS_FIELD, Value::String(status));

    for (i, column) in table.columns.iter().enumerate() {
        let value: SqlValue = row.get(i + 2)?;
        record.set(column.name.clone(), sql_to_json(column.column_type, value));
    }
    Ok(record)
}

/// The column expression for a query field: `id`, `_status`, or a schema
/// column. Unknown fields read as NULL, matching the document backend's
/// missing-field semantics.
fn field_expr(table: &TableSchema, field: &str) -> String {
    if field == ID_FIELD || field == STATUS_FIELD || table.get_column(field).is_some() {
        quote_ident(field)
    } else {
        "NULL".to_string()
    }
}

fn clause_sql(table: &TableSchema, clause: &Clause, params: &mut Vec<SqlValue>) -> String {
    match clause {
        Clause::Where { field, op } => {
            let expr = field_expr(table, field);
            comparison_sql(&expr, op, params)
        }
        Clause::And(clauses) => {
            if clauses.is_empty() {
                "1".to_string()
            } else {
                let parts: Vec<String> = clauses
                    .iter()
                    .map(|c| clause_sql(table, c, params))
                    .collect();
                format!("({})", parts.join(" AND "))
            }
        }
        Clause::Or(clauses) => {
            if clauses.is_empty() {
                "0".to_string()
            } else {
                let parts: Vec<String> = clauses
                    .iter()
                    .map(|c| clause_sql(table, c, params))
                    .collect();
                format!("({})", parts.join(" OR "))
            }
        }
    }
}

fn comparison_sql(expr: &str, op: &Comparison, params: &mut Vec<SqlValue>) -> String {
    // IS / IS NOT are null-safe in SQLite, matching the document backend's
    // missing-field-as-null equality semantics.
    match op {
        Comparison::Eq(value) => {
            params.push(json_to_sql(value));
            format!("({} IS ?{})", expr, params.len())
        }
        Comparison::NotEq(value) => {
            params.push(json_to_sql(value));
            format!("({} IS NOT ?{})", expr, params.len())
        }
        Comparison::Gt(value) => ordered_sql(expr, ">", value, params),
        Comparison::Gte(value) => ordered_sql(expr, ">=", value, params),
        Comparison::Lt(value) => ordered_sql(expr, "<", value, params),
        Comparison::Lte(value) => ordered_sql(expr, "<=", value, params),
        Comparison::OneOf(options) => {
            if options.is_empty() {
                return "0".to_string();
            }
            let mut placeholders = Vec::new();
            let mut has_null = false;
            for option in options {
                if option.is_null() {
                    has_null = true;
                } else {
                    params.push(json_to_sql(option));
                    placeholders.push(format!("?{}", params.len()));
                }
            }
            let mut parts = Vec::new();
            if !placeholders.is_empty() {
                parts.push(format!("{} IN ({})", expr, placeholders.join(", ")));
            }
            if has_null {
                parts.push(format!("{} IS NULL", expr));
            }
            format!("({})", parts.join(" OR "))
        }
    }
}

fn ordered_sql(expr: &str, op: &str, value: &Value, params: &mut Vec<SqlValue>) -> String {
    if value.is_null() {
        // Nothing orders against null
        return "0".to_string();
    }
    params.push(json_to_sql(value));
    format!("({} {} ?{} AND {} IS NOT NULL)", expr, op, params.len(), expr)
}

fn where_sql(
    table: &TableSchema,
    query: &SerializedQuery,
    include_deleted: bool,
    params: &mut Vec<SqlValue>,
) -> String {
    let mut parts = Vec::new();
    if !include_deleted {
        parts.push(format!("{} IS NOT 'deleted'", quote_ident(STATUS_FIELD)));
    }
    for clause in query.clauses() {
        parts.push(clause_sql(table, clause, params));
    }
    if parts.is_empty() {
        "1".to_string()
    } else {
        parts.join(" AND ")
    }
}

fn order_sql(table: &TableSchema, query: &SerializedQuery) -> String {
    let mut keys: Vec<String> = query
        .sort()
        .iter()
        .map(|key| {
            let direction = match key.direction {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            };
            format!("{} {}", field_expr(table, &key.field), direction)
        })
        .collect();
    // Stable output for callers that diff result sets
    keys.push(format!("{} ASC", quote_ident(ID_FIELD)));
    format!("ORDER BY {}", keys.join(", "))
}

fn select_sql(
    table: &TableSchema,
    query: &SerializedQuery,
    include_deleted: bool,
) -> (String, Vec<SqlValue>) {
    let mut params = Vec::new();
    let mut columns = vec![quote_ident(ID_FIELD), quote_ident(STATUS_FIELD)];
    columns.extend(table.columns.iter().map(|c| quote_ident(&c.name)));

    let mut sql = format!(
        "SELECT {} FROM {} WHERE {} {}",
        columns.join(", "),
        quote_ident(&table.name),
        where_sql(table, query, include_deleted, &mut params),
        order_sql(table, query),
    );
    if let Some(limit) = query.limit_value() {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    (sql, params)
}

fn count_sql(table: &TableSchema, query: &SerializedQuery) -> (String, Vec<SqlValue>) {
    let mut params = Vec::new();
    let filter = where_sql(table, query, false, &mut params);
    let sql = match query.limit_value() {
        // COUNT over a limited subquery, so the limit caps the count too
        Some(limit) => format!(
            "SELECT COUNT(*) FROM (SELECT 1 FROM {} WHERE {} LIMIT {})",
            quote_ident(&table.name),
            filter,
            limit,
        ),
        None => format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            quote_ident(&table.name),
            filter,
        ),
    };
    (sql, params)
}
