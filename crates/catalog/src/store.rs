//! The tag-graph store over PostgreSQL.
//!
//! All durable state lives in the backing database; the store owns the
//! connection pool, the transaction retry loop, the triple primitives with
//! their transactional bookkeeping (reverse index, change tracking), tag
//! definition management, and query execution.

use crate::authz::{self, PrincipalSchemaView, TagdefEntry, TagdefSnapshot};
use crate::cache::TxCache;
use crate::error::{CatalogError, CatalogResult};
use crate::models::{ResultRow, bind_value, decode_row};
use crate::schema;
use curio_core::config::{CatalogConfig, LimitsConfig, PgSslMode};
use curio_core::{
    AccessMode, DbType, Decision, PolicyName, PrincipalContext, SubjectId, TagDef, TagRef,
    TagValue, reserved,
};
use curio_query::{
    CompileOptions, CompiledQuery, Path, QueryShape, compile, parse_path, tag_table,
};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{PgConnection, PgPool};
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;

async fn load_text_map(
    conn: &mut PgConnection,
    tag: &str,
) -> CatalogResult<std::collections::HashMap<i64, String>> {
    let rows: Vec<(i64, String)> =
        sqlx::query_as(&format!("SELECT subject, value FROM {}", tag_table(tag)))
            .fetch_all(conn)
            .await?;
    Ok(rows.into_iter().collect())
}

async fn load_flag_map(
    conn: &mut PgConnection,
    tag: &str,
) -> CatalogResult<std::collections::HashMap<i64, bool>> {
    let rows: Vec<(i64, bool)> =
        sqlx::query_as(&format!("SELECT subject, value FROM {}", tag_table(tag)))
            .fetch_all(conn)
            .await?;
    Ok(rows.into_iter().collect())
}

async fn load_list_map(
    conn: &mut PgConnection,
    tag: &str,
) -> CatalogResult<std::collections::HashMap<i64, Vec<String>>> {
    let rows: Vec<(i64, String)> =
        sqlx::query_as(&format!("SELECT subject, value FROM {}", tag_table(tag)))
            .fetch_all(conn)
            .await?;
    let mut map: std::collections::HashMap<i64, Vec<String>> = Default::default();
    for (subject, value) in rows {
        map.entry(subject).or_default().push(value);
    }
    Ok(map)
}

/// Tags whose change invalidates the tag definition snapshot.
const TAGDEF_TAGS: &[&str] = &[
    reserved::TAGDEF,
    reserved::TAGDEF_DBTYPE,
    reserved::TAGDEF_MULTIVALUE,
    reserved::TAGDEF_UNIQUE,
    reserved::TAGDEF_TAGREF,
    reserved::TAGDEF_SOFT,
    reserved::TAGDEF_READPOLICY,
    reserved::TAGDEF_WRITEPOLICY,
    reserved::TAG_READERS,
    reserved::TAG_WRITERS,
    reserved::OWNER,
];

/// Query options accepted alongside a path.
#[derive(Clone, Debug)]
pub struct QueryOptions {
    pub shape: QueryShape,
    /// Named view expanding the default projection.
    pub view: Option<String>,
    pub row_limit: Option<u64>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            shape: QueryShape::Triples,
            view: None,
            row_limit: None,
        }
    }
}

/// The catalog store.
pub struct CatalogStore {
    pool: PgPool,
    limits: LimitsConfig,
    tagdef_cache: TxCache<(), Arc<TagdefSnapshot>>,
    view_cache: TxCache<String, Arc<Vec<String>>>,
    subject_cache: TxCache<String, SubjectId>,
}

impl CatalogStore {
    /// Create a store from configuration, connect, and bootstrap.
    pub async fn from_config(config: &CatalogConfig) -> CatalogResult<Self> {
        let db = &config.database;
        db.validate().map_err(CatalogError::Internal)?;

        let mut opts = if let Some(url) = &db.url {
            tracing::info!("connecting to PostgreSQL using connection URL");
            PgConnectOptions::from_str(url)?
        } else {
            let mut opts = PgConnectOptions::new();
            if let Some(host) = &db.host {
                opts = opts.host(host);
            }
            if let Some(port) = db.port {
                opts = opts.port(port);
            }
            if let Some(user) = &db.username {
                opts = opts.username(user);
            }
            if let Some(pass) = &db.password {
                opts = opts.password(pass);
            }
            if let Some(database) = &db.database {
                opts = opts.database(database);
            }
            if let Some(mode) = db.ssl_mode {
                let sqlx_mode = match mode {
                    PgSslMode::Disable => SqlxPgSslMode::Disable,
                    PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                    PgSslMode::Require => SqlxPgSslMode::Require,
                };
                opts = opts.ssl_mode(sqlx_mode);
            }
            tracing::info!(
                host = db.host.as_deref().unwrap_or("<none>"),
                database = db.database.as_deref().unwrap_or("<none>"),
                "connecting to PostgreSQL"
            );
            opts
        };

        // Server-side statement timeout bounds every query in a request.
        if let Some(timeout_ms) = db.statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
        }

        let pool = PgPoolOptions::new()
            .max_connections(db.max_connections)
            .connect_with(opts)
            .await?;

        Self::with_pool(pool, config).await
    }

    /// Create a store from a connection URL with default limits.
    pub async fn from_url(url: &str, max_connections: u32) -> CatalogResult<Self> {
        let config = CatalogConfig {
            database: curio_core::config::DatabaseConfig {
                url: Some(url.to_string()),
                max_connections,
                ..Default::default()
            },
            ..Default::default()
        };
        Self::from_config(&config).await
    }

    async fn with_pool(pool: PgPool, config: &CatalogConfig) -> CatalogResult<Self> {
        let store = Self {
            pool,
            limits: config.limits.clone(),
            tagdef_cache: TxCache::new(&config.cache),
            view_cache: TxCache::new(&config.cache),
            subject_cache: TxCache::new(&config.cache),
        };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Check database connectivity and health.
    pub async fn health_check(&self) -> CatalogResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Run one logical operation in a transaction, retrying transient
    /// conflicts from scratch up to the configured bound. Non-transient
    /// errors abort immediately with no partial write.
    pub async fn with_retry<T, F>(&self, op: F) -> CatalogResult<T>
    where
        F: AsyncFn(&mut PgConnection) -> CatalogResult<T>,
    {
        let mut attempts: u32 = 0;
        loop {
            let mut txn = self.pool.begin().await?;
            match op(&mut *txn).await {
                Ok(value) => match txn.commit().await {
                    Ok(()) => return Ok(value),
                    Err(e) => {
                        let err = CatalogError::from(e);
                        if err.is_transient() && attempts < self.limits.max_txn_retries {
                            attempts += 1;
                            tracing::warn!(attempts, "retrying transaction after commit conflict");
                            continue;
                        }
                        return Err(err.into_user());
                    }
                },
                Err(err) => {
                    let _ = txn.rollback().await;
                    if err.is_transient() && attempts < self.limits.max_txn_retries {
                        attempts += 1;
                        tracing::warn!(attempts, error = %err, "retrying transaction");
                        continue;
                    }
                    return Err(err.into_user());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Bootstrap
    // ------------------------------------------------------------------

    /// Create the fixed relations and the reserved system tags on first run.
    async fn bootstrap(&self) -> CatalogResult<()> {
        self.with_retry(async |conn| {
            schema::deploy_core(conn).await?;

            let deployed: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = 't_tagdef')",
            )
            .fetch_one(&mut *conn)
            .await?;
            if deployed {
                return Ok(());
            }

            tracing::info!("bootstrapping reserved system tags");
            let defs = reserved::bootstrap_tagdefs();
            for td in &defs {
                schema::deploy_tag(conn, td).await?;
            }
            for td in &defs {
                self.insert_tagdef_triples(conn, td).await?;
            }
            Ok(())
        })
        .await
    }

    /// Write one tag definition's self-describing triples onto a fresh
    /// subject. Returns the tagdef's subject id.
    async fn insert_tagdef_triples(
        &self,
        conn: &mut PgConnection,
        td: &TagDef,
    ) -> CatalogResult<SubjectId> {
        let id = self.new_subject(conn).await?;
        let text = |v: &str| Some(TagValue::Text(v.to_string()));
        let flag = |v: bool| Some(TagValue::Boolean(v));

        let pairs: Vec<(&str, Option<TagValue>)> = vec![
            (reserved::TAGDEF, text(&td.name)),
            (reserved::TAGDEF_DBTYPE, text(td.dbtype.as_str())),
            (reserved::TAGDEF_MULTIVALUE, flag(td.multivalue)),
            (reserved::TAGDEF_UNIQUE, flag(td.unique)),
            (reserved::TAGDEF_READPOLICY, text(td.readpolicy.as_str())),
            (reserved::TAGDEF_WRITEPOLICY, text(td.writepolicy.as_str())),
        ];
        for (tag, value) in pairs {
            let def = self.reserved_def(tag)?;
            self.set_triple_noauthn(conn, &def, id, value.as_ref()).await?;
        }
        if let Some(tagref) = &td.tagref {
            let def = self.reserved_def(reserved::TAGDEF_TAGREF)?;
            self.set_triple_noauthn(conn, &def, id, text(&tagref.target).as_ref())
                .await?;
            let def = self.reserved_def(reserved::TAGDEF_SOFT)?;
            self.set_triple_noauthn(conn, &def, id, flag(tagref.soft).as_ref())
                .await?;
        }
        if let Some(owner) = &td.owner {
            let def = self.reserved_def(reserved::OWNER)?;
            self.set_triple_noauthn(conn, &def, id, text(owner).as_ref())
                .await?;
        }
        Ok(id)
    }

    fn reserved_def(&self, name: &str) -> CatalogResult<TagDef> {
        reserved::bootstrap_tagdefs()
            .into_iter()
            .find(|td| td.name == name)
            .ok_or_else(|| CatalogError::Internal(format!("unknown reserved tag '{name}'")))
    }

    // ------------------------------------------------------------------
    // Change tracking
    // ------------------------------------------------------------------

    pub(crate) async fn bump_tag_txid(
        &self,
        conn: &mut PgConnection,
        tag: &str,
    ) -> CatalogResult<()> {
        sqlx::query(
            "INSERT INTO tag_last_modified (tagname, txid) VALUES ($1, txid_current()) \
             ON CONFLICT (tagname) DO UPDATE SET txid = EXCLUDED.txid",
        )
        .bind(tag)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub(crate) async fn bump_subject_txid(
        &self,
        conn: &mut PgConnection,
        subject: SubjectId,
    ) -> CatalogResult<()> {
        sqlx::query(
            "INSERT INTO subject_last_tagged (subject, txid) VALUES ($1, txid_current()) \
             ON CONFLICT (subject) DO UPDATE SET txid = EXCLUDED.txid",
        )
        .bind(subject)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Latest change txid across a set of tags: the authoritative staleness
    /// check for cached structures derived from them.
    pub(crate) async fn latest_tag_txid(
        &self,
        conn: &mut PgConnection,
        tags: &[&str],
    ) -> CatalogResult<i64> {
        let names: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        let txid: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(txid), 0) FROM tag_last_modified WHERE tagname = ANY($1)",
        )
        .bind(names)
        .fetch_one(&mut *conn)
        .await?;
        Ok(txid)
    }

    // ------------------------------------------------------------------
    // Tag definition snapshot
    // ------------------------------------------------------------------

    /// The current tag definition snapshot, served from cache when its
    /// underlying tags have not changed.
    pub async fn snapshot(&self, conn: &mut PgConnection) -> CatalogResult<Arc<TagdefSnapshot>> {
        let latest = self.latest_tag_txid(conn, TAGDEF_TAGS).await?;
        if let Some(snapshot) = self.tagdef_cache.lookup(&(), latest) {
            return Ok(snapshot);
        }
        let snapshot = Arc::new(self.load_snapshot(conn, latest).await?);
        self.tagdef_cache.insert((), latest, snapshot.clone());
        Ok(snapshot)
    }

    async fn load_snapshot(
        &self,
        conn: &mut PgConnection,
        txid: i64,
    ) -> CatalogResult<TagdefSnapshot> {
        let names: Vec<(i64, String)> =
            sqlx::query_as(&format!("SELECT subject, value FROM {}", tag_table(reserved::TAGDEF)))
                .fetch_all(&mut *conn)
                .await?;

        let dbtypes = load_text_map(conn, reserved::TAGDEF_DBTYPE).await?;
        let readpolicies = load_text_map(conn, reserved::TAGDEF_READPOLICY).await?;
        let writepolicies = load_text_map(conn, reserved::TAGDEF_WRITEPOLICY).await?;
        let tagrefs = load_text_map(conn, reserved::TAGDEF_TAGREF).await?;
        let owners = load_text_map(conn, reserved::OWNER).await?;
        let multivalues = load_flag_map(conn, reserved::TAGDEF_MULTIVALUE).await?;
        let uniques = load_flag_map(conn, reserved::TAGDEF_UNIQUE).await?;
        let softs = load_flag_map(conn, reserved::TAGDEF_SOFT).await?;
        let readers = load_list_map(conn, reserved::TAG_READERS).await?;
        let writers = load_list_map(conn, reserved::TAG_WRITERS).await?;

        let mut entries = std::collections::HashMap::with_capacity(names.len());
        for (subject, name) in names {
            let dbtype = dbtypes
                .get(&subject)
                .map(|s| DbType::parse(s))
                .transpose()?
                .ok_or_else(|| {
                    CatalogError::Internal(format!("tagdef '{name}' is missing its dbtype"))
                })?;
            let readpolicy = readpolicies
                .get(&subject)
                .map(|s| PolicyName::parse(s))
                .transpose()?
                .unwrap_or(PolicyName::Anonymous);
            let writepolicy = writepolicies
                .get(&subject)
                .map(|s| PolicyName::parse(s))
                .transpose()?
                .unwrap_or(PolicyName::Subject);
            let tagref = tagrefs.get(&subject).map(|target| TagRef {
                target: target.clone(),
                soft: softs.get(&subject).copied().unwrap_or(false),
            });

            let def = TagDef {
                name: name.clone(),
                dbtype,
                multivalue: multivalues.get(&subject).copied().unwrap_or(false),
                unique: uniques.get(&subject).copied().unwrap_or(false),
                tagref,
                readpolicy,
                writepolicy,
                owner: owners.get(&subject).cloned(),
            };
            entries.insert(
                name,
                TagdefEntry {
                    def,
                    subject,
                    tag_readers: readers.get(&subject).cloned().unwrap_or_default(),
                    tag_writers: writers.get(&subject).cloned().unwrap_or_default(),
                },
            );
        }
        Ok(TagdefSnapshot { entries, txid })
    }

    // ------------------------------------------------------------------
    // Triple primitives (authorization-blind)
    // ------------------------------------------------------------------

    fn check_value_shape(td: &TagDef, value: Option<&TagValue>) -> CatalogResult<()> {
        match (td.dbtype, value) {
            (DbType::Empty, None) => Ok(()),
            (DbType::Empty, Some(_)) => Err(CatalogError::Malformed(format!(
                "presence-only tag '{}' takes no value",
                td.name
            ))),
            (_, None) => Err(CatalogError::Malformed(format!(
                "tag '{}' requires a value",
                td.name
            ))),
            (dbtype, Some(v)) if !v.matches(dbtype) => Err(CatalogError::Malformed(format!(
                "tag '{}' holds {}, got {}",
                td.name,
                dbtype,
                v.type_name()
            ))),
            _ => Ok(()),
        }
    }

    /// Set one triple without authorization checks; the caller has already
    /// decided. Returns whether anything changed.
    ///
    /// Non-multivalue typed tags upsert in place (update preferred over
    /// delete+insert); multivalue tags treat an existing triple as a no-op.
    /// The reverse index and both change-tracking txids move in the same
    /// transaction.
    pub async fn set_triple_noauthn(
        &self,
        conn: &mut PgConnection,
        td: &TagDef,
        subject: SubjectId,
        value: Option<&TagValue>,
    ) -> CatalogResult<bool> {
        Self::check_value_shape(td, value)?;
        let table = tag_table(&td.name);

        let changed = match value {
            None => {
                let result =
                    sqlx::query(&format!(
                        "INSERT INTO {table} (subject) VALUES ($1) ON CONFLICT DO NOTHING"
                    ))
                    .bind(subject)
                    .execute(&mut *conn)
                    .await?;
                result.rows_affected() > 0
            }
            Some(v) if td.multivalue => {
                let expr = schema::value_write_expr(td.dbtype, "$2");
                let sql = format!(
                    "INSERT INTO {table} (subject, value) VALUES ($1, {expr}) \
                     ON CONFLICT DO NOTHING"
                );
                let result = bind_value(sqlx::query(&sql).bind(subject), v)
                    .execute(&mut *conn)
                    .await?;
                result.rows_affected() > 0
            }
            Some(v) => {
                let expr = schema::value_write_expr(td.dbtype, "$2");
                let update = format!(
                    "UPDATE {table} SET value = {expr} \
                     WHERE subject = $1 AND value IS DISTINCT FROM {expr}"
                );
                let result = bind_value(sqlx::query(&update).bind(subject), v)
                    .execute(&mut *conn)
                    .await?;
                if result.rows_affected() > 0 {
                    true
                } else {
                    let exists: bool = sqlx::query_scalar(&format!(
                        "SELECT EXISTS (SELECT 1 FROM {table} WHERE subject = $1)"
                    ))
                    .bind(subject)
                    .fetch_one(&mut *conn)
                    .await?;
                    if exists {
                        // Same value already in place.
                        false
                    } else {
                        let insert =
                            format!("INSERT INTO {table} (subject, value) VALUES ($1, {expr})");
                        bind_value(sqlx::query(&insert).bind(subject), v)
                            .execute(&mut *conn)
                            .await?;
                        true
                    }
                }
            }
        };

        if changed {
            self.record_presence(conn, td, subject).await?;
            self.bump_tag_txid(conn, &td.name).await?;
            self.bump_subject_txid(conn, subject).await?;
        }
        Ok(changed)
    }

    /// Delete triples without authorization checks. `value` of `None`
    /// removes every triple of the tag on the subject. Returns the number
    /// of triples removed.
    pub async fn delete_triple_noauthn(
        &self,
        conn: &mut PgConnection,
        td: &TagDef,
        subject: SubjectId,
        value: Option<&TagValue>,
    ) -> CatalogResult<u64> {
        let table = tag_table(&td.name);
        let deleted = match value {
            None => {
                sqlx::query(&format!("DELETE FROM {table} WHERE subject = $1"))
                    .bind(subject)
                    .execute(&mut *conn)
                    .await?
                    .rows_affected()
            }
            Some(v) => {
                Self::check_value_shape(td, Some(v))?;
                let expr = schema::value_write_expr(td.dbtype, "$2");
                let sql = format!("DELETE FROM {table} WHERE subject = $1 AND value = {expr}");
                bind_value(sqlx::query(&sql).bind(subject), v)
                    .execute(&mut *conn)
                    .await?
                    .rows_affected()
            }
        };

        if deleted > 0 {
            let remaining: bool = sqlx::query_scalar(&format!(
                "SELECT EXISTS (SELECT 1 FROM {table} WHERE subject = $1)"
            ))
            .bind(subject)
            .fetch_one(&mut *conn)
            .await?;
            if !remaining {
                self.clear_presence(conn, td, subject).await?;
            }
            self.bump_tag_txid(conn, &td.name).await?;
            self.bump_subject_txid(conn, subject).await?;
        }
        Ok(deleted)
    }

    /// Record the tag in the subject's reverse "tags present" set.
    async fn record_presence(
        &self,
        conn: &mut PgConnection,
        td: &TagDef,
        subject: SubjectId,
    ) -> CatalogResult<()> {
        // The reverse index tag does not index itself.
        if td.name == reserved::TAGS {
            return Ok(());
        }
        let result = sqlx::query(&format!(
            "INSERT INTO {} (subject, value) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            tag_table(reserved::TAGS)
        ))
        .bind(subject)
        .bind(&td.name)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() > 0 {
            self.bump_tag_txid(conn, reserved::TAGS).await?;
        }
        Ok(())
    }

    async fn clear_presence(
        &self,
        conn: &mut PgConnection,
        td: &TagDef,
        subject: SubjectId,
    ) -> CatalogResult<()> {
        if td.name == reserved::TAGS {
            return Ok(());
        }
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE subject = $1 AND value = $2",
            tag_table(reserved::TAGS)
        ))
        .bind(subject)
        .bind(&td.name)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() > 0 {
            self.bump_tag_txid(conn, reserved::TAGS).await?;
        }
        Ok(())
    }

    /// Read one subject's triples for a tag, without authorization.
    pub async fn get_triples_noauthn(
        &self,
        conn: &mut PgConnection,
        td: &TagDef,
        subject: SubjectId,
    ) -> CatalogResult<Vec<Option<TagValue>>> {
        let table = tag_table(&td.name);
        if td.dbtype == DbType::Empty {
            let present: bool = sqlx::query_scalar(&format!(
                "SELECT EXISTS (SELECT 1 FROM {table} WHERE subject = $1)"
            ))
            .bind(subject)
            .fetch_one(&mut *conn)
            .await?;
            return Ok(if present { vec![None] } else { Vec::new() });
        }

        let value_col = match td.dbtype {
            DbType::Tsvector => "(value)::text",
            _ => "value",
        };
        let rows = sqlx::query(&format!(
            "SELECT {value_col} AS value FROM {table} WHERE subject = $1 ORDER BY value"
        ))
        .bind(subject)
        .fetch_all(&mut *conn)
        .await?;

        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            let decoded = decode_row(row)?;
            let value = decoded
                .get("value")
                .and_then(|c| c.as_value().cloned())
                .ok_or_else(|| CatalogError::Internal("triple decoded without value".into()))?;
            values.push(Some(value));
        }
        Ok(values)
    }

    // ------------------------------------------------------------------
    // Subjects
    // ------------------------------------------------------------------

    pub(crate) async fn new_subject(&self, conn: &mut PgConnection) -> CatalogResult<SubjectId> {
        let id: i64 = sqlx::query_scalar("INSERT INTO subjects DEFAULT VALUES RETURNING id")
            .fetch_one(&mut *conn)
            .await?;
        Ok(id)
    }

    pub(crate) async fn subject_exists(
        &self,
        conn: &mut PgConnection,
        subject: SubjectId,
    ) -> CatalogResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM subjects WHERE id = $1)")
                .bind(subject)
                .fetch_one(&mut *conn)
                .await?;
        Ok(exists)
    }

    /// Create a subject with its provenance tags (owner, created, modified).
    pub(crate) async fn create_subject_noauthn(
        &self,
        conn: &mut PgConnection,
        snapshot: &TagdefSnapshot,
        owner: Option<&str>,
    ) -> CatalogResult<SubjectId> {
        let id = self.new_subject(conn).await?;
        let now = TagValue::Timestamptz(OffsetDateTime::now_utc());
        if let Some(owner) = owner {
            let entry = snapshot.require(reserved::OWNER)?;
            self.set_triple_noauthn(conn, &entry.def, id, Some(&TagValue::Text(owner.into())))
                .await?;
        }
        let created = snapshot.require(reserved::CREATED)?;
        self.set_triple_noauthn(conn, &created.def, id, Some(&now)).await?;
        let modified = snapshot.require(reserved::MODIFIED)?;
        self.set_triple_noauthn(conn, &modified.def, id, Some(&now)).await?;
        Ok(id)
    }

    /// Remove a subject and all its triples. Fails with a conflict if any
    /// other tag still holds a hard reference to one of its unique values.
    pub(crate) async fn delete_subject_noauthn(
        &self,
        conn: &mut PgConnection,
        snapshot: &TagdefSnapshot,
        subject: SubjectId,
    ) -> CatalogResult<()> {
        let tags: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT value FROM {} WHERE subject = $1",
            tag_table(reserved::TAGS)
        ))
        .bind(subject)
        .fetch_all(&mut *conn)
        .await?;

        for tag in tags {
            let entry = snapshot.require(&tag)?;
            self.delete_triple_noauthn(conn, &entry.def, subject, None).await?;
        }
        sqlx::query("DELETE FROM subjects WHERE id = $1")
            .bind(subject)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Create a subject owned by the acting principal.
    pub async fn create_subject(&self, ctx: &PrincipalContext) -> CatalogResult<SubjectId> {
        let Some(principal) = ctx.principal.clone() else {
            return Err(CatalogError::Unauthorized(
                "subject creation requires authentication".into(),
            ));
        };
        self.with_retry(async |conn| {
            let snapshot = self.snapshot(conn).await?;
            self.create_subject_noauthn(conn, &snapshot, Some(&principal))
                .await
        })
        .await
    }

    /// Delete a subject the principal owns (or may write).
    pub async fn delete_subject(
        &self,
        ctx: &PrincipalContext,
        subject: SubjectId,
    ) -> CatalogResult<()> {
        self.with_retry(async |conn| {
            if !self.subject_exists(conn, subject).await? {
                return Err(CatalogError::NotFound(format!("subject {subject}")));
            }
            if !authz::subject_visible(conn, ctx, subject).await? {
                // Indistinguishable from absent, by design.
                return Err(CatalogError::NotFound(format!("subject {subject}")));
            }
            if !ctx.superuser {
                let access = authz::fetch_subject_access(conn, subject, AccessMode::Write).await?;
                let allowed = match &access.owner {
                    Some(owner) => {
                        ctx.principal.as_deref() == Some(owner.as_str())
                            || access.acl.iter().any(|a| ctx.attributes.contains(a))
                    }
                    None => ctx.principal.is_some(),
                };
                if !allowed {
                    return Err(CatalogError::Forbidden(format!(
                        "subject {subject} deletion denied"
                    )));
                }
            }
            let snapshot = self.snapshot(conn).await?;
            self.delete_subject_noauthn(conn, &snapshot, subject).await
        })
        .await
    }

    /// Resolve the single subject holding `value` in a unique tag, through
    /// the unique-subject cache.
    pub async fn resolve_unique_subject(
        &self,
        conn: &mut PgConnection,
        entry: &TagdefEntry,
        value: &TagValue,
    ) -> CatalogResult<Option<SubjectId>> {
        if !entry.def.unique {
            return Err(CatalogError::Malformed(format!(
                "tag '{}' is not unique",
                entry.def.name
            )));
        }
        let key = format!("{}={}", entry.def.name, value.render());
        let latest = self.latest_tag_txid(conn, &[&entry.def.name]).await?;
        if let Some(id) = self.subject_cache.lookup(&key, latest) {
            return Ok(Some(id));
        }
        let found = authz::lookup_subject_by_value(conn, &entry.def, value).await?;
        if let Some(id) = found {
            self.subject_cache.insert(key, latest, id);
        }
        Ok(found)
    }

    // ------------------------------------------------------------------
    // Checked triple operations
    // ------------------------------------------------------------------

    /// Read a subject's triples for one tag, enforcing the tag's read
    /// policy. An invisible subject reads as absent, not forbidden.
    pub async fn get_triples(
        &self,
        ctx: &PrincipalContext,
        subject: SubjectId,
        tagname: &str,
    ) -> CatalogResult<Vec<Option<TagValue>>> {
        self.with_retry(async |conn| {
            let snapshot = self.snapshot(conn).await?;
            let entry = snapshot.require(tagname)?.clone();
            if !self.subject_exists(conn, subject).await?
                || !authz::subject_visible(conn, ctx, subject).await?
            {
                return Err(CatalogError::NotFound(format!("subject {subject}")));
            }

            if entry.def.readpolicy.examines_object() {
                // Per-value authorization: filter to the readable values.
                let values = self.get_triples_noauthn(conn, &entry.def, subject).await?;
                let mut readable = Vec::new();
                for value in values {
                    let d = authz::evaluate(
                        conn,
                        &snapshot,
                        ctx,
                        AccessMode::Read,
                        &entry,
                        Some(subject),
                        value.as_ref(),
                    )
                    .await?;
                    if d == Decision::Allow {
                        readable.push(value);
                    }
                }
                return Ok(readable);
            }

            let decision = authz::evaluate(
                conn,
                &snapshot,
                ctx,
                AccessMode::Read,
                &entry,
                Some(subject),
                None,
            )
            .await?;
            authz::require(decision, ctx, &format!("reading tag '{tagname}'"))?;
            self.get_triples_noauthn(conn, &entry.def, subject).await
        })
        .await
    }

    /// Set one triple, enforcing the tag's write policy.
    pub async fn set_triple(
        &self,
        ctx: &PrincipalContext,
        subject: SubjectId,
        tagname: &str,
        value: Option<&TagValue>,
    ) -> CatalogResult<bool> {
        self.with_retry(async |conn| {
            let snapshot = self.snapshot(conn).await?;
            let entry = snapshot.require(tagname)?.clone();
            if !self.subject_exists(conn, subject).await?
                || !authz::subject_visible(conn, ctx, subject).await?
            {
                return Err(CatalogError::NotFound(format!("subject {subject}")));
            }
            let decision = authz::evaluate(
                conn,
                &snapshot,
                ctx,
                AccessMode::Write,
                &entry,
                Some(subject),
                value,
            )
            .await?;
            authz::require(decision, ctx, &format!("writing tag '{tagname}'"))?;
            self.set_triple_noauthn(conn, &entry.def, subject, value).await
        })
        .await
    }

    /// Delete triples of one tag, enforcing the tag's write policy.
    pub async fn delete_triple(
        &self,
        ctx: &PrincipalContext,
        subject: SubjectId,
        tagname: &str,
        value: Option<&TagValue>,
    ) -> CatalogResult<u64> {
        self.with_retry(async |conn| {
            let snapshot = self.snapshot(conn).await?;
            let entry = snapshot.require(tagname)?.clone();
            if !self.subject_exists(conn, subject).await?
                || !authz::subject_visible(conn, ctx, subject).await?
            {
                return Err(CatalogError::NotFound(format!("subject {subject}")));
            }
            let decision = authz::evaluate(
                conn,
                &snapshot,
                ctx,
                AccessMode::Write,
                &entry,
                Some(subject),
                value,
            )
            .await?;
            authz::require(decision, ctx, &format!("deleting tag '{tagname}'"))?;
            self.delete_triple_noauthn(conn, &entry.def, subject, value).await
        })
        .await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Compile a path without executing it.
    pub async fn compile_path(
        &self,
        ctx: &PrincipalContext,
        path: &Path,
        options: &QueryOptions,
    ) -> CatalogResult<CompiledQuery> {
        self.with_retry(async |conn| {
            let snapshot = self.snapshot(conn).await?;
            let default_projection = match &options.view {
                Some(view) => self.view_tags(conn, view).await?.as_ref().clone(),
                None => Vec::new(),
            };
            let schema_view = PrincipalSchemaView::new(&snapshot, ctx);
            let compile_options = CompileOptions {
                shape: options.shape,
                default_projection,
                row_limit: options.row_limit,
            };
            Ok(compile(path, &schema_view, ctx, &compile_options)?)
        })
        .await
    }

    /// Parse, compile, and execute a query path.
    pub async fn query(
        &self,
        ctx: &PrincipalContext,
        path: &str,
        options: &QueryOptions,
    ) -> CatalogResult<Vec<ResultRow>> {
        let path = parse_path(path)?;
        self.query_path(ctx, &path, options).await
    }

    /// Compile and execute a parsed path in one transaction.
    pub async fn query_path(
        &self,
        ctx: &PrincipalContext,
        path: &Path,
        options: &QueryOptions,
    ) -> CatalogResult<Vec<ResultRow>> {
        self.with_retry(async |conn| {
            let snapshot = self.snapshot(conn).await?;
            let default_projection = match &options.view {
                Some(view) => self.view_tags(conn, view).await?.as_ref().clone(),
                None => Vec::new(),
            };
            let schema_view = PrincipalSchemaView::new(&snapshot, ctx);
            let compile_options = CompileOptions {
                shape: options.shape,
                default_projection,
                row_limit: options.row_limit,
            };
            let compiled = compile(path, &schema_view, ctx, &compile_options)?;
            tracing::debug!(sql = %compiled.sql, params = compiled.params.len(), "executing query");
            self.execute_in(conn, &compiled).await
        })
        .await
    }

    /// Execute a compiled query on an existing connection.
    pub async fn execute_in(
        &self,
        conn: &mut PgConnection,
        compiled: &CompiledQuery,
    ) -> CatalogResult<Vec<ResultRow>> {
        let mut query = sqlx::query(&compiled.sql);
        for value in &compiled.params {
            query = bind_value(query, value);
        }
        let rows = query.fetch_all(&mut *conn).await?;
        rows.iter().map(decode_row).collect()
    }

    /// The tags a named view projects, through the view cache.
    pub async fn view_tags(
        &self,
        conn: &mut PgConnection,
        view: &str,
    ) -> CatalogResult<Arc<Vec<String>>> {
        let latest = self
            .latest_tag_txid(conn, &[reserved::VIEW, reserved::VIEW_TAGS])
            .await?;
        if let Some(tags) = self.view_cache.lookup(&view.to_string(), latest) {
            return Ok(tags);
        }
        let subject: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT subject FROM {} WHERE value = $1",
            tag_table(reserved::VIEW)
        ))
        .bind(view)
        .fetch_optional(&mut *conn)
        .await?;
        let Some(subject) = subject else {
            return Err(CatalogError::NotFound(format!("view '{view}'")));
        };
        let tags: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT value FROM {} WHERE subject = $1 ORDER BY value",
            tag_table(reserved::VIEW_TAGS)
        ))
        .bind(subject)
        .fetch_all(&mut *conn)
        .await?;
        let tags = Arc::new(tags);
        self.view_cache.insert(view.to_string(), latest, tags.clone());
        Ok(tags)
    }

    // ------------------------------------------------------------------
    // Schema operations
    // ------------------------------------------------------------------

    /// Define a new tag: validate the descriptor, write its self-describing
    /// triples, and provision its storage, all in one transaction.
    pub async fn define_tag(&self, ctx: &PrincipalContext, td: &TagDef) -> CatalogResult<()> {
        td.validate()?;
        if reserved::is_reserved(&td.name) {
            return Err(CatalogError::Conflict(format!(
                "tag '{}' is reserved",
                td.name
            )));
        }
        if ctx.is_anonymous() {
            return Err(CatalogError::Unauthorized(
                "tag definition requires authentication".into(),
            ));
        }

        let mut td = td.clone();
        if td.owner.is_none() {
            td.owner = ctx.principal.clone();
        }

        self.with_retry(async |conn| {
            let snapshot = self.snapshot(conn).await?;
            if snapshot.get(&td.name).is_some() {
                return Err(CatalogError::Conflict(format!(
                    "tag '{}' is already defined",
                    td.name
                )));
            }
            if let Some(tagref) = &td.tagref {
                let target = snapshot.get(&tagref.target).ok_or_else(|| {
                    CatalogError::Malformed(format!(
                        "referenced tag '{}' is not defined",
                        tagref.target
                    ))
                })?;
                if !target.def.unique {
                    return Err(CatalogError::Malformed(format!(
                        "referenced tag '{}' is not unique",
                        tagref.target
                    )));
                }
            }
            self.insert_tagdef_triples(conn, &td).await?;
            schema::deploy_tag(conn, &td).await?;
            Ok(())
        })
        .await?;

        self.tagdef_cache.clear();
        tracing::info!(tag = %td.name, dbtype = %td.dbtype, "tag defined");
        Ok(())
    }

    /// Undefine a tag: refuse while hard references remain, otherwise drop
    /// its storage, its data, and its definition.
    pub async fn undefine_tag(&self, ctx: &PrincipalContext, name: &str) -> CatalogResult<()> {
        if reserved::is_reserved(name) {
            return Err(CatalogError::Forbidden(format!(
                "reserved tag '{name}' cannot be undefined"
            )));
        }

        self.with_retry(async |conn| {
            let snapshot = self.snapshot(conn).await?;
            let entry = snapshot.require(name)?.clone();

            if !ctx.superuser {
                let allowed = match (&ctx.principal, &entry.def.owner) {
                    (Some(p), Some(o)) => p == o,
                    _ => false,
                };
                if !allowed {
                    return Err(CatalogError::Forbidden(format!(
                        "undefining tag '{name}' denied"
                    )));
                }
            }

            let referrers = snapshot.hard_referrers(name);
            if !referrers.is_empty() {
                let names: Vec<&str> =
                    referrers.iter().map(|e| e.def.name.as_str()).collect();
                return Err(CatalogError::Conflict(format!(
                    "tag '{name}' is referenced by: {}",
                    names.join(", ")
                )));
            }

            // Remove the tag's presence from every subject's reverse set.
            sqlx::query(&format!(
                "DELETE FROM {} WHERE value = $1",
                tag_table(reserved::TAGS)
            ))
            .bind(name)
            .execute(&mut *conn)
            .await?;
            self.bump_tag_txid(conn, reserved::TAGS).await?;

            schema::drop_tag(conn, name).await?;
            self.delete_subject_noauthn(conn, &snapshot, entry.subject).await?;

            sqlx::query("DELETE FROM tag_last_modified WHERE tagname = $1")
                .bind(name)
                .execute(&mut *conn)
                .await?;
            Ok(())
        })
        .await?;

        self.tagdef_cache.clear();
        self.view_cache.clear();
        self.subject_cache.clear();
        tracing::info!(tag = %name, "tag undefined");
        Ok(())
    }

    /// Define a named view: a subject carrying the view name and its
    /// projected tags.
    pub async fn define_view(
        &self,
        ctx: &PrincipalContext,
        name: &str,
        tags: &[String],
    ) -> CatalogResult<()> {
        let Some(principal) = ctx.principal.clone() else {
            return Err(CatalogError::Unauthorized(
                "view definition requires authentication".into(),
            ));
        };
        self.with_retry(async |conn| {
            let snapshot = self.snapshot(conn).await?;
            for tag in tags {
                snapshot.require(tag)?;
            }
            let id = self
                .create_subject_noauthn(conn, &snapshot, Some(&principal))
                .await?;
            let view = snapshot.require(reserved::VIEW)?;
            self.set_triple_noauthn(
                conn,
                &view.def,
                id,
                Some(&TagValue::Text(name.to_string())),
            )
            .await?;
            let view_tags = snapshot.require(reserved::VIEW_TAGS)?;
            for tag in tags {
                self.set_triple_noauthn(
                    conn,
                    &view_tags.def,
                    id,
                    Some(&TagValue::Text(tag.clone())),
                )
                .await?;
            }
            Ok(())
        })
        .await?;
        self.view_cache.invalidate(&name.to_string());
        Ok(())
    }
}
