//! Bulk mutation engine.
//!
//! Applies large (subject × tag) row sets against the graph with
//! create-or-merge semantics: rows are staged into a temporary relation,
//! classified against the graph on the path's unique key tags, authorized
//! per tag and per row, and applied through the triple primitives so every
//! write carries its reverse-index and change-tracking bookkeeping. A single
//! disallowed row aborts the entire mutation.
//!
//! Inputs larger than one batch are chunked; each batch is one transaction,
//! which is the mutation's effective atomicity granularity for very large
//! inputs.

use crate::authz::{self, TagdefEntry, TagdefSnapshot};
use crate::error::{CatalogError, CatalogResult};
use crate::models::bind_value;
use crate::store::CatalogStore;
use curio_core::{AccessMode, DbType, PrincipalContext, SubjectId, TagValue, reserved};
use curio_query::{Path, QueryShape, quote_ident, tag_table};
use sqlx::PgConnection;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// Disposition for input rows matching no existing subject.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnMissing {
    Create,
    Ignore,
    Abort,
}

impl OnMissing {
    pub fn parse(s: &str) -> CatalogResult<Self> {
        match s {
            "create" => Ok(Self::Create),
            "ignore" => Ok(Self::Ignore),
            "abort" => Ok(Self::Abort),
            _ => Err(CatalogError::Malformed(format!(
                "unknown on-missing mode: {s}"
            ))),
        }
    }
}

/// Disposition for input rows matching an existing subject.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnExisting {
    Merge,
    /// Full set replacement per tag: reserved, currently unsupported.
    Replace,
    Ignore,
    Abort,
}

impl OnExisting {
    pub fn parse(s: &str) -> CatalogResult<Self> {
        match s {
            "merge" => Ok(Self::Merge),
            "replace" => Ok(Self::Replace),
            "ignore" => Ok(Self::Ignore),
            "abort" => Ok(Self::Abort),
            _ => Err(CatalogError::Malformed(format!(
                "unknown on-existing mode: {s}"
            ))),
        }
    }
}

/// One input row: tag name to raw value. An absent or null value leaves the
/// tag untouched.
pub type InputRow = BTreeMap<String, Option<String>>;

/// What a bulk mutation did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub created: u64,
    pub updated: u64,
}

/// Per-row classification against the graph.
enum RowMatch {
    Missing,
    Existing(SubjectId),
}

/// What an input cell asks for, after parsing.
enum WriteAction {
    Set(Option<TagValue>),
    /// Presence-only tags accept `false` to clear the flag.
    Clear,
    Skip,
}

impl CatalogStore {
    /// Merge an input row set into the graph along a path: the path's
    /// subject predicates name the unique key tags, its list predicates the
    /// tags to write.
    pub async fn bulk_update(
        &self,
        ctx: &PrincipalContext,
        path: &Path,
        rows: &[InputRow],
        on_missing: OnMissing,
        on_existing: OnExisting,
    ) -> CatalogResult<BulkOutcome> {
        if on_existing == OnExisting::Replace {
            return Err(CatalogError::Malformed(
                "replace semantics are reserved and not supported".into(),
            ));
        }

        let mut outcome = BulkOutcome::default();
        for batch in rows.chunks(self.limits().bulk_batch_rows.max(1)) {
            let applied = self
                .with_retry(async |conn| {
                    self.apply_batch(conn, ctx, path, batch, on_missing, on_existing)
                        .await
                })
                .await?;
            outcome.created += applied.created;
            outcome.updated += applied.updated;
        }
        Ok(outcome)
    }

    async fn apply_batch(
        &self,
        conn: &mut PgConnection,
        ctx: &PrincipalContext,
        path: &Path,
        rows: &[InputRow],
        on_missing: OnMissing,
        on_existing: OnExisting,
    ) -> CatalogResult<BulkOutcome> {
        let snapshot = self.snapshot(conn).await?;
        let last = path.last();

        // The subject predicates must pin identity through unique tags.
        let key_entries: Vec<TagdefEntry> = last
            .subject_tags()
            .iter()
            .filter_map(|t| snapshot.get(t))
            .filter(|e| e.def.unique)
            .cloned()
            .collect();
        if key_entries.is_empty() {
            return Err(CatalogError::Malformed(
                "bulk update requires at least one unique key tag in the subject predicates"
                    .into(),
            ));
        }
        for tag in last.subject_tags() {
            snapshot.require(tag)?;
        }
        let write_entries: Vec<TagdefEntry> = last
            .list_tags()
            .iter()
            .map(|t| snapshot.require(t).cloned())
            .collect::<CatalogResult<_>>()?;

        // Parse every row up front so a malformed cell aborts before any
        // mutation is issued.
        let parsed_keys = parse_key_values(&key_entries, rows)?;

        let matches = self
            .classify_rows(conn, &key_entries, &parsed_keys, rows.len())
            .await?;

        let mut missing: Vec<usize> = Vec::new();
        let mut existing: Vec<(usize, SubjectId)> = Vec::new();
        for (i, m) in matches.into_iter().enumerate() {
            match m {
                RowMatch::Missing => missing.push(i),
                RowMatch::Existing(id) => existing.push((i, id)),
            }
        }

        match on_missing {
            OnMissing::Abort if !missing.is_empty() => {
                return Err(CatalogError::NotFound(format!(
                    "{} input rows match no existing subject",
                    missing.len()
                )));
            }
            _ => {}
        }
        match on_existing {
            OnExisting::Abort if !existing.is_empty() => {
                return Err(CatalogError::Conflict(format!(
                    "{} input rows match existing subjects",
                    existing.len()
                )));
            }
            _ => {}
        }

        let mut outcome = BulkOutcome::default();
        let mut targets: Vec<(usize, SubjectId, bool)> = Vec::new();

        if on_missing == OnMissing::Create && !missing.is_empty() {
            let Some(principal) = ctx.principal.clone() else {
                return Err(CatalogError::Unauthorized(
                    "subject creation requires authentication".into(),
                ));
            };
            for &i in &missing {
                let id = self
                    .create_subject_noauthn(conn, &snapshot, Some(&principal))
                    .await?;
                // Identity-defining key tags are written under their own
                // write policies.
                for (entry, values) in key_entries.iter().zip(&parsed_keys) {
                    let value = &values[i];
                    let d = authz::evaluate(
                        conn,
                        &snapshot,
                        ctx,
                        AccessMode::Write,
                        entry,
                        Some(id),
                        Some(value),
                    )
                    .await?;
                    authz::require(d, ctx, &format!("writing tag '{}'", entry.def.name))?;
                    self.set_triple_noauthn(conn, &entry.def, id, Some(value)).await?;
                }
                targets.push((i, id, true));
                outcome.created += 1;
            }
        }

        if on_existing != OnExisting::Ignore {
            for (i, id) in existing {
                targets.push((i, id, false));
            }
        }

        // Authorize every write first, then apply: failures are cheap and
        // leave no partial state.
        let mut writes: Vec<(SubjectId, usize, WriteAction, bool)> = Vec::new();
        for &(row_idx, subject, created) in &targets {
            for (w, entry) in write_entries.iter().enumerate() {
                let action = parse_write_action(entry, rows[row_idx].get(&entry.def.name))?;
                let value = match &action {
                    WriteAction::Skip => continue,
                    WriteAction::Clear => None,
                    WriteAction::Set(v) => v.as_ref(),
                };
                let d = authz::evaluate(
                    conn,
                    &snapshot,
                    ctx,
                    AccessMode::Write,
                    entry,
                    Some(subject),
                    value,
                )
                .await?;
                authz::require(d, ctx, &format!("writing tag '{}'", entry.def.name))?;
                writes.push((subject, w, action, created));
            }
        }

        let mut touched: HashSet<SubjectId> = HashSet::new();
        for (subject, w, action, created) in writes {
            let entry = &write_entries[w];
            let changed = match action {
                WriteAction::Skip => false,
                WriteAction::Clear => {
                    self.delete_triple_noauthn(conn, &entry.def, subject, None).await? > 0
                }
                WriteAction::Set(value) => {
                    if entry.def.unique
                        && let Some(new_value) = &value
                    {
                        self.cascade_unique_change(conn, &snapshot, entry, subject, new_value)
                            .await?;
                    }
                    self.set_triple_noauthn(conn, &entry.def, subject, value.as_ref())
                        .await?
                }
            };
            if changed && !created {
                touched.insert(subject);
            }
        }
        outcome.updated += touched.len() as u64;

        tracing::info!(
            created = outcome.created,
            updated = outcome.updated,
            rows = rows.len(),
            "bulk update batch applied"
        );
        Ok(outcome)
    }

    /// Stage key values and classify each input row as existing or missing.
    /// More than one distinct subject for a row is an ambiguity conflict.
    async fn classify_rows(
        &self,
        conn: &mut PgConnection,
        key_entries: &[TagdefEntry],
        parsed_keys: &[Vec<TagValue>],
        row_count: usize,
    ) -> CatalogResult<Vec<RowMatch>> {
        let staging = quote_ident(&format!("bulk_{}", Uuid::new_v4().simple()));

        let mut columns = vec!["row_num BIGINT NOT NULL".to_string()];
        for (k, entry) in key_entries.iter().enumerate() {
            let sql_type = entry.def.dbtype.sql_type().ok_or_else(|| {
                CatalogError::Internal(format!(
                    "unique tag '{}' has no value column",
                    entry.def.name
                ))
            })?;
            columns.push(format!("k{k} {sql_type} NOT NULL"));
        }
        sqlx::query(&format!(
            "CREATE TEMPORARY TABLE {staging} ({}) ON COMMIT DROP",
            columns.join(", ")
        ))
        .execute(&mut *conn)
        .await?;

        for i in 0..row_count {
            let placeholders: Vec<String> =
                (0..=key_entries.len()).map(|n| format!("${}", n + 1)).collect();
            let sql = format!(
                "INSERT INTO {staging} VALUES ({})",
                placeholders.join(", ")
            );
            let mut query = sqlx::query(&sql).bind(i as i64);
            for values in parsed_keys {
                query = bind_value(query, &values[i]);
            }
            query.execute(&mut *conn).await?;
        }

        // One membership scan per key tag; unique constraints guarantee at
        // most one subject per key value.
        let mut matched: HashMap<i64, HashSet<SubjectId>> = HashMap::new();
        for (k, entry) in key_entries.iter().enumerate() {
            let sql = format!(
                "SELECT r.row_num, t.subject FROM {staging} r \
                 JOIN {} t ON t.value = r.k{k}",
                tag_table(&entry.def.name)
            );
            let rows: Vec<(i64, i64)> = sqlx::query_as(&sql).fetch_all(&mut *conn).await?;
            for (row_num, subject) in rows {
                matched.entry(row_num).or_default().insert(subject);
            }
        }

        let mut result = Vec::with_capacity(row_count);
        for i in 0..row_count {
            match matched.get(&(i as i64)) {
                None => result.push(RowMatch::Missing),
                Some(subjects) if subjects.len() == 1 => {
                    result.push(RowMatch::Existing(*subjects.iter().next().expect("nonempty")));
                }
                Some(subjects) => {
                    return Err(CatalogError::Conflict(format!(
                        "input row {i} matches {} distinct subjects",
                        subjects.len()
                    )));
                }
            }
        }
        Ok(result)
    }

    /// When a unique tag's value is about to change on a subject, delete the
    /// now-dangling triples of every tag that hard-references it, closed
    /// transitively over the reference graph.
    async fn cascade_unique_change(
        &self,
        conn: &mut PgConnection,
        snapshot: &TagdefSnapshot,
        entry: &TagdefEntry,
        subject: SubjectId,
        new_value: &TagValue,
    ) -> CatalogResult<()> {
        if entry.def.multivalue {
            // Multivalue merge is insert-only; no value is displaced.
            return Ok(());
        }
        let old_values = self.get_triples_noauthn(conn, &entry.def, subject).await?;
        let Some(Some(old_value)) = old_values.into_iter().next() else {
            return Ok(());
        };
        if old_value == *new_value {
            return Ok(());
        }
        self.cascade_value_removal(conn, snapshot, &entry.def.name, &old_value)
            .await
    }

    /// Delete every triple (transitively) referencing `value` through a hard
    /// tagref to `tag`.
    pub(crate) async fn cascade_value_removal(
        &self,
        conn: &mut PgConnection,
        snapshot: &TagdefSnapshot,
        tag: &str,
        value: &TagValue,
    ) -> CatalogResult<()> {
        let mut worklist: Vec<String> = vec![tag.to_string()];
        let mut visited: HashSet<String> = HashSet::new();

        while let Some(current) = worklist.pop() {
            if !visited.insert(current.clone()) {
                return Err(CatalogError::Internal(format!(
                    "reference cycle through tag '{current}'"
                )));
            }
            for referrer in snapshot.hard_referrers(&current) {
                let table = tag_table(&referrer.def.name);
                let sql = format!("SELECT subject FROM {table} WHERE value = $1");
                let subjects: Vec<(i64,)> = {
                    let query = bind_value(sqlx::query(&sql), value);
                    let rows = query.fetch_all(&mut *conn).await?;
                    rows.iter()
                        .map(|r| sqlx::Row::try_get::<i64, _>(r, 0).map(|v| (v,)))
                        .collect::<Result<_, _>>()?
                };
                if subjects.is_empty() {
                    continue;
                }
                tracing::debug!(
                    tag = %referrer.def.name,
                    count = subjects.len(),
                    "cascading dangling reference deletions"
                );
                for (s,) in subjects {
                    self.delete_triple_noauthn(conn, &referrer.def, s, Some(value))
                        .await?;
                }
                // A unique referrer's removed value dangles its own
                // referents in turn.
                if referrer.def.unique {
                    worklist.push(referrer.def.name.clone());
                }
            }
        }
        Ok(())
    }

    /// Delete every subject a path matches: verify write authorization over
    /// the whole set first, cascade dangling references, then apply.
    pub async fn bulk_delete_subjects(
        &self,
        ctx: &PrincipalContext,
        path: &Path,
    ) -> CatalogResult<u64> {
        self.with_retry(async |conn| {
            let snapshot = self.snapshot(conn).await?;
            let subjects = self.matched_subjects(conn, ctx, path).await?;

            for &subject in &subjects {
                let access =
                    authz::fetch_subject_access(conn, subject, AccessMode::Write).await?;
                let allowed = ctx.superuser
                    || match &access.owner {
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

            for &subject in &subjects {
                // Unique values held by this subject may be referenced from
                // outside the deletion set; those triples go first.
                let present: Vec<String> = sqlx::query_scalar(&format!(
                    "SELECT value FROM {} WHERE subject = $1",
                    tag_table(reserved::TAGS)
                ))
                .bind(subject)
                .fetch_all(&mut *conn)
                .await?;
                for tag in present {
                    let entry = snapshot.require(&tag)?;
                    if !entry.def.unique {
                        continue;
                    }
                    for value in self
                        .get_triples_noauthn(conn, &entry.def, subject)
                        .await?
                        .into_iter()
                        .flatten()
                    {
                        self.cascade_value_removal(conn, &snapshot, &tag, &value).await?;
                    }
                }
                self.delete_subject_noauthn(conn, &snapshot, subject).await?;
            }
            Ok(subjects.len() as u64)
        })
        .await
    }

    /// Delete the named tags from every subject a path matches, with the
    /// same authorize-then-cascade-then-apply structure.
    pub async fn bulk_delete_tags(
        &self,
        ctx: &PrincipalContext,
        path: &Path,
        tags: &[String],
    ) -> CatalogResult<u64> {
        self.with_retry(async |conn| {
            let snapshot = self.snapshot(conn).await?;
            let entries: Vec<TagdefEntry> = tags
                .iter()
                .map(|t| snapshot.require(t).cloned())
                .collect::<CatalogResult<_>>()?;
            let subjects = self.matched_subjects(conn, ctx, path).await?;

            // Verify authorization over the entire affected set first.
            let mut planned: Vec<(SubjectId, usize)> = Vec::new();
            for &subject in &subjects {
                for (w, entry) in entries.iter().enumerate() {
                    let values = self.get_triples_noauthn(conn, &entry.def, subject).await?;
                    if values.is_empty() {
                        continue;
                    }
                    for value in &values {
                        let d = authz::evaluate(
                            conn,
                            &snapshot,
                            ctx,
                            AccessMode::Write,
                            entry,
                            Some(subject),
                            value.as_ref(),
                        )
                        .await?;
                        authz::require(d, ctx, &format!("deleting tag '{}'", entry.def.name))?;
                    }
                    planned.push((subject, w));
                }
            }

            let mut deleted = 0u64;
            for (subject, w) in planned {
                let entry = &entries[w];
                if entry.def.unique {
                    for value in self
                        .get_triples_noauthn(conn, &entry.def, subject)
                        .await?
                        .into_iter()
                        .flatten()
                    {
                        self.cascade_value_removal(conn, &snapshot, &entry.def.name, &value)
                            .await?;
                    }
                }
                deleted += self
                    .delete_triple_noauthn(conn, &entry.def, subject, None)
                    .await?;
            }
            tracing::info!(subjects = subjects.len(), deleted, "bulk tag deletion applied");
            Ok(deleted)
        })
        .await
    }

    /// The exact, read-filtered set of subjects a path matches.
    async fn matched_subjects(
        &self,
        conn: &mut PgConnection,
        ctx: &PrincipalContext,
        path: &Path,
    ) -> CatalogResult<Vec<SubjectId>> {
        let snapshot = self.snapshot(conn).await?;
        let schema_view = crate::authz::PrincipalSchemaView::new(&snapshot, ctx);
        let compiled = curio_query::compile(
            path,
            &schema_view,
            ctx,
            &curio_query::CompileOptions {
                shape: QueryShape::Triples,
                default_projection: Vec::new(),
                row_limit: None,
            },
        )?;
        let rows = self.execute_in(conn, &compiled).await?;
        Ok(rows.iter().filter_map(|r| r.id()).collect())
    }
}

fn parse_key_values(
    key_entries: &[TagdefEntry],
    rows: &[InputRow],
) -> CatalogResult<Vec<Vec<TagValue>>> {
    let mut parsed = Vec::with_capacity(key_entries.len());
    for entry in key_entries {
        let mut column = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let raw = row
                .get(&entry.def.name)
                .and_then(|v| v.as_deref())
                .ok_or_else(|| {
                    CatalogError::Malformed(format!(
                        "input row {i} is missing key tag '{}'",
                        entry.def.name
                    ))
                })?;
            column.push(TagValue::parse(entry.def.dbtype, raw)?);
        }
        parsed.push(column);
    }
    Ok(parsed)
}

fn parse_write_action(
    entry: &TagdefEntry,
    raw: Option<&Option<String>>,
) -> CatalogResult<WriteAction> {
    let Some(Some(raw)) = raw else {
        return Ok(WriteAction::Skip);
    };
    if entry.def.dbtype == DbType::Empty {
        return match TagValue::parse(DbType::Boolean, raw)? {
            TagValue::Boolean(true) => Ok(WriteAction::Set(None)),
            _ => Ok(WriteAction::Clear),
        };
    }
    Ok(WriteAction::Set(Some(TagValue::parse(
        entry.def.dbtype,
        raw,
    )?)))
}
