//! Compiles a parsed path into one relational query.
//!
//! The compiler walks the path against a schema view (tag definitions plus
//! the acting principal's pre-resolved static read decisions) and emits a
//! single SQL statement with positional bindings. Read authorization is
//! folded into the query itself: statically denied tags compile to NULL or
//! empty sets, and tags whose policy depends on per-row state compile with
//! an inline ownership or object-visibility guard.

use crate::ast::{Path, PathElem, PredValue, Predicate, PredicateOp};
use crate::sql::{SqlParams, quote_ident, tag_table};
use curio_core::{DbType, Decision, Policy, PrincipalContext, TagDef, TagValue, reserved};
use thiserror::Error;

/// Schema metadata the compiler consults: tag definitions and the acting
/// principal's memoized static read decisions (`readok`).
pub trait SchemaView {
    fn tagdef(&self, name: &str) -> Option<&TagDef>;

    /// Static (subject-independent) read decision for the tag.
    fn readok(&self, name: &str) -> Decision;

    /// Whether the principal passes the tag's own ACL — the tag atom of a
    /// compound policy. Static, so resolvable without row context.
    fn tag_acl_read(&self, name: &str) -> bool;
}

/// Response shape of a compiled query; exactly one per query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryShape {
    /// One row per subject with projected tag columns (default).
    Triples,
    /// Distinct value enumeration of the single projected tag.
    Values,
    /// Cardinality of the distinct values of the single projected tag.
    Count,
    /// Top or bottom N values of the single projected tag by frequency.
    TopVals { limit: u32, bottom: bool },
}

/// Compilation options.
#[derive(Clone, Debug)]
pub struct CompileOptions {
    pub shape: QueryShape,
    /// Projection applied when the final element lists no tags (typically
    /// the expansion of a named view).
    pub default_projection: Vec<String>,
    /// Row bound for `Triples` queries.
    pub row_limit: Option<u64>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            shape: QueryShape::Triples,
            default_projection: Vec::new(),
            row_limit: None,
        }
    }
}

/// A compiled query: SQL text plus its ordered parameter bindings.
#[derive(Clone, Debug)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<TagValue>,
}

/// Compilation failure: the path is malformed with respect to the schema.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("unknown tag: {0}")]
    UnknownTag(String),

    #[error("operator {op} not supported for tag '{tag}' of dbtype {dbtype}")]
    OpNotSupported {
        tag: String,
        op: &'static str,
        dbtype: &'static str,
    },

    #[error(transparent)]
    InvalidValue(#[from] curio_core::Error),

    #[error("sub-query must project exactly one tag")]
    SubqueryProjection,

    #[error("sub-query projects dbtype {found}, but tag '{tag}' holds {expected}")]
    SubqueryType {
        tag: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("sub-query values are only usable with = and !=")]
    SubqueryOperator,

    #[error("{shape} queries require exactly one projected tag")]
    ShapeProjection { shape: &'static str },

    #[error("{shape} queries require a value-bearing tag, not '{tag}'")]
    ShapeNeedsValues { shape: &'static str, tag: String },

    #[error("no bridging tag between path elements {0} and {1}")]
    NoBridge(usize, usize),

    #[error("ambiguous bridging tags between path elements {0} and {1}")]
    AmbiguousBridge(usize, usize),

    #[error("reference cycle through tag '{0}'")]
    ReferenceCycle(String),
}

/// Whether a predicate list pins down at most one subject: it constrains a
/// `unique` tag by equality to literal values. Callers may then assert
/// single-row semantics downstream.
pub fn is_unique_identifying(preds: &[Predicate], schema: &dyn SchemaView) -> bool {
    preds.iter().any(|p| {
        p.op == Some(PredicateOp::Equal)
            && !p.values.is_empty()
            && p.values
                .iter()
                .all(|v| matches!(v, PredValue::Literal(_)))
            && schema.tagdef(&p.tag).is_some_and(|td| td.unique)
    })
}

/// Compile a path into one query for the given principal.
pub fn compile(
    path: &Path,
    schema: &dyn SchemaView,
    ctx: &PrincipalContext,
    options: &CompileOptions,
) -> Result<CompiledQuery, CompileError> {
    let mut compiler = Compiler {
        schema,
        ctx,
        params: SqlParams::new(),
        aliases: 0,
        ref_stack: Vec::new(),
    };
    let sql = compiler.compile_path(path, options)?;
    Ok(CompiledQuery {
        sql,
        params: compiler.params.into_values(),
    })
}

/// Read-authorization guard over one tag, attached at the relevant column.
enum Guard {
    Allow,
    Deny,
    /// Boolean SQL condition; references the columns it was built against.
    Cond(String),
}

impl Guard {
    fn and(self, other: Guard) -> Guard {
        match (self, other) {
            (Guard::Deny, _) | (_, Guard::Deny) => Guard::Deny,
            (Guard::Allow, g) | (g, Guard::Allow) => g,
            (Guard::Cond(a), Guard::Cond(b)) => Guard::Cond(format!("({a} AND {b})")),
        }
    }

    fn or(self, other: Guard) -> Guard {
        match (self, other) {
            (Guard::Allow, _) | (_, Guard::Allow) => Guard::Allow,
            (Guard::Deny, g) | (g, Guard::Deny) => g,
            (Guard::Cond(a), Guard::Cond(b)) => Guard::Cond(format!("({a} OR {b})")),
        }
    }
}

struct Compiler<'a> {
    schema: &'a dyn SchemaView,
    ctx: &'a PrincipalContext,
    params: SqlParams,
    aliases: usize,
    /// Tags currently being resolved through reference guards; a revisit is
    /// a reference cycle, which is a configuration error.
    ref_stack: Vec<String>,
}

impl<'a> Compiler<'a> {
    fn alias(&mut self, prefix: &str) -> String {
        self.aliases += 1;
        format!("{prefix}{}", self.aliases)
    }

    fn tagdef(&self, name: &str) -> Result<&'a TagDef, CompileError> {
        self.schema
            .tagdef(name)
            .ok_or_else(|| CompileError::UnknownTag(name.to_string()))
    }

    fn compile_path(
        &mut self,
        path: &Path,
        options: &CompileOptions,
    ) -> Result<String, CompileError> {
        let subject_set = self.subject_set(&path.elems)?;
        let last = path.last();

        // Expand the default projection (a view) when the final element
        // names no tags of its own.
        let effective: Vec<Predicate>;
        let listpreds: &[Predicate] = if last.listpreds.is_empty() {
            effective = options
                .default_projection
                .iter()
                .map(|t| Predicate::present(t.clone()))
                .collect();
            &effective
        } else {
            &last.listpreds
        };

        match options.shape {
            QueryShape::Triples => self.triples_query(&subject_set, last, listpreds, options),
            QueryShape::Values => {
                let tag = single_projection("values", listpreds)?;
                let inner = self.shape_values_sql(&subject_set, &tag, "values")?;
                Ok(format!(
                    "SELECT DISTINCT value AS {} FROM ({inner}) AS vals ORDER BY 1 ASC NULLS LAST",
                    quote_ident(&tag)
                ))
            }
            QueryShape::Count => {
                let tag = single_projection("count", listpreds)?;
                let inner = self.shape_values_sql(&subject_set, &tag, "count")?;
                Ok(format!(
                    "SELECT COUNT(DISTINCT value) AS count FROM ({inner}) AS vals"
                ))
            }
            QueryShape::TopVals { limit, bottom } => {
                let tag = single_projection("topvals", listpreds)?;
                let inner = self.shape_values_sql(&subject_set, &tag, "topvals")?;
                let dir = if bottom { "ASC" } else { "DESC" };
                let p = self.params.push(TagValue::Int8(i64::from(limit)));
                Ok(format!(
                    "SELECT value AS {}, COUNT(*) AS count FROM ({inner}) AS vals \
                     GROUP BY value ORDER BY 2 {dir}, 1 ASC LIMIT {p}",
                    quote_ident(&tag)
                ))
            }
        }
    }

    // ------------------------------------------------------------------
    // Subject set: chained path elements
    // ------------------------------------------------------------------

    /// Build the id-set query for the whole chain: each element compiles to
    /// `SELECT s.id FROM subjects AS s ...`, constrained by the previous
    /// element's bridge values.
    fn subject_set(&mut self, elems: &[PathElem]) -> Result<String, CompileError> {
        let mut current: Option<String> = None;
        for (i, elem) in elems.iter().enumerate() {
            let bridge_cond = match current {
                None => None,
                Some(prev_set) => {
                    let (ta, tb) = self.find_bridge(&elems[i - 1], elem, i)?;
                    let values_sql = self.tag_values_sql(&prev_set, &ta, false)?;
                    Some(self.membership_condition(&tb, &values_sql)?)
                }
            };
            current = Some(self.element_subjects(elem, bridge_cond)?);
        }
        Ok(current.expect("path is never empty"))
    }

    fn element_subjects(
        &mut self,
        elem: &PathElem,
        bridge_cond: Option<String>,
    ) -> Result<String, CompileError> {
        let mut joins: Vec<String> = Vec::new();
        let mut conds: Vec<String> = Vec::new();
        if let Some(cond) = bridge_cond {
            conds.push(cond);
        }

        for tag in elem.subject_tags() {
            let preds: Vec<&Predicate> =
                elem.subjpreds.iter().filter(|p| p.tag == tag).collect();
            self.tag_group_condition(tag, &preds, &mut joins, &mut conds)?;
        }

        let mut sql = String::from("SELECT s.id FROM subjects AS s");
        for join in &joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !conds.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conds.join(" AND "));
        }
        Ok(sql)
    }

    /// Merge all predicates naming one tag into a single compiled
    /// sub-expression.
    fn tag_group_condition(
        &mut self,
        tag: &str,
        preds: &[&Predicate],
        joins: &mut Vec<String>,
        conds: &mut Vec<String>,
    ) -> Result<(), CompileError> {
        let td = self.tagdef(tag)?.clone();
        let has_absent = preds.iter().any(|p| p.op == Some(PredicateOp::Absent));
        let has_present = preds.iter().any(|p| p.op != Some(PredicateOp::Absent));

        if has_absent && has_present {
            // Contradictory by construction: valid, but can never match.
            conds.push("FALSE".to_string());
            return Ok(());
        }

        if has_absent {
            let a = self.alias("ab");
            joins.push(format!(
                "LEFT OUTER JOIN {} AS {a} ON ({a}.subject = s.id)",
                tag_table(tag)
            ));
            conds.push(format!("{a}.subject IS NULL"));
            return Ok(());
        }

        let t = self.alias("t");
        let mut inner = vec![format!("{t}.subject = s.id")];

        match self.read_guard(&td, &format!("{t}.subject"), &format!("{t}.value"))? {
            Guard::Deny => {
                conds.push("FALSE".to_string());
                return Ok(());
            }
            Guard::Cond(guard) => inner.push(guard),
            Guard::Allow => {}
        }

        if let Guard::Cond(filter) = self.ref_filter(&td, &format!("{t}.value"))? {
            inner.push(filter);
        }

        // Free-text terms across all predicates of this tag combine into one
        // search expression.
        let mut required_words: Vec<String> = Vec::new();
        let mut negated_words: Vec<String> = Vec::new();

        for pred in preds {
            let Some(op) = pred.op else { continue };
            if op.is_word() {
                for v in &pred.values {
                    match v {
                        PredValue::Literal(s) => {
                            if op == PredicateOp::Word {
                                required_words.push(s.clone());
                            } else {
                                negated_words.push(s.clone());
                            }
                        }
                        PredValue::Subquery(_) => return Err(CompileError::SubqueryOperator),
                    }
                }
                continue;
            }
            inner.push(self.value_condition(&td, op, &pred.values, &format!("{t}.value"))?);
        }

        if !required_words.is_empty() || !negated_words.is_empty() {
            inner.push(self.word_condition(
                &td,
                &required_words,
                &negated_words,
                &format!("{t}.value"),
            )?);
        }

        conds.push(format!(
            "EXISTS (SELECT 1 FROM {} AS {t} WHERE {})",
            tag_table(tag),
            inner.join(" AND ")
        ));
        Ok(())
    }

    fn value_condition(
        &mut self,
        td: &TagDef,
        op: PredicateOp,
        values: &[PredValue],
        col: &str,
    ) -> Result<String, CompileError> {
        let unsupported = || CompileError::OpNotSupported {
            tag: td.name.clone(),
            op: op.token(),
            dbtype: td.dbtype.as_str(),
        };

        if td.dbtype == DbType::Empty {
            return Err(unsupported());
        }

        if op.is_typed() {
            if op.requires_order() && !td.dbtype.is_ordered() {
                return Err(unsupported());
            }
            if td.dbtype == DbType::Tsvector {
                return Err(unsupported());
            }

            let mut literals: Vec<TagValue> = Vec::new();
            let mut subqueries: Vec<String> = Vec::new();
            for v in values {
                match v {
                    PredValue::Literal(raw) => {
                        literals.push(TagValue::parse(td.dbtype, raw)?);
                    }
                    PredValue::Subquery(path) => {
                        if !matches!(op, PredicateOp::Equal | PredicateOp::NotEqual) {
                            return Err(CompileError::SubqueryOperator);
                        }
                        subqueries.push(self.subquery_values(td, path)?);
                    }
                }
            }

            return Ok(match op {
                PredicateOp::Equal | PredicateOp::NotEqual => {
                    let mut memberships: Vec<String> = Vec::new();
                    if !literals.is_empty() {
                        memberships.push(format!("{col} IN {}", self.params.push_list(literals)));
                    }
                    for sub in subqueries {
                        memberships.push(format!("{col} IN ({sub})"));
                    }
                    let any = memberships.join(" OR ");
                    if op == PredicateOp::Equal {
                        format!("({any})")
                    } else {
                        format!("NOT ({any})")
                    }
                }
                _ => {
                    // Range ops: any-of across the value list.
                    let sql_op = match op {
                        PredicateOp::Lt => "<",
                        PredicateOp::Leq => "<=",
                        PredicateOp::Gt => ">",
                        PredicateOp::Geq => ">=",
                        _ => unreachable!("typed ops are exhaustive"),
                    };
                    let parts: Vec<String> = literals
                        .into_iter()
                        .map(|v| format!("{col} {sql_op} {}", self.params.push(v)))
                        .collect();
                    format!("({})", parts.join(" OR "))
                }
            });
        }

        // Textual pattern operators.
        let operand = match td.dbtype {
            DbType::Text => col.to_string(),
            DbType::Tsvector | DbType::Empty => return Err(unsupported()),
            _ if op == PredicateOp::Like => return Err(unsupported()),
            _ => format!("({col})::text"),
        };
        let sql_op = match op {
            PredicateOp::Like => "LIKE",
            PredicateOp::Regexp => "~",
            PredicateOp::NotRegexp => "!~",
            PredicateOp::CiRegexp => "~*",
            PredicateOp::NotCiRegexp => "!~*",
            _ => unreachable!("word ops handled by caller"),
        };

        let parts: Vec<String> = values
            .iter()
            .map(|v| match v {
                PredValue::Literal(raw) => Ok(format!(
                    "{operand} {sql_op} {}",
                    self.params.push(TagValue::Text(raw.clone()))
                )),
                PredValue::Subquery(_) => Err(CompileError::SubqueryOperator),
            })
            .collect::<Result<_, _>>()?;
        Ok(format!("({})", parts.join(" OR ")))
    }

    /// One boolean text-search expression for all free-text terms on a tag:
    /// required words conjoin, negated words carry the `!` marker.
    fn word_condition(
        &mut self,
        td: &TagDef,
        required: &[String],
        negated: &[String],
        col: &str,
    ) -> Result<String, CompileError> {
        let document = match td.dbtype {
            DbType::Tsvector => col.to_string(),
            DbType::Text => format!("to_tsvector('simple', {col})"),
            _ => {
                return Err(CompileError::OpNotSupported {
                    tag: td.name.clone(),
                    op: PredicateOp::Word.token(),
                    dbtype: td.dbtype.as_str(),
                });
            }
        };

        let quote = |w: &str| format!("'{}'", w.replace('\'', "''"));
        let mut terms: Vec<String> = required.iter().map(|w| quote(w)).collect();
        terms.extend(negated.iter().map(|w| format!("!{}", quote(w))));
        let tsquery = terms.join(" & ");

        Ok(format!(
            "{document} @@ to_tsquery('simple', {})",
            self.params.push(TagValue::Text(tsquery))
        ))
    }

    /// Membership of a subquery's projected values.
    fn subquery_values(&mut self, outer: &TagDef, path: &Path) -> Result<String, CompileError> {
        let tag = {
            let tags = path.last().list_tags();
            if tags.len() != 1 {
                return Err(CompileError::SubqueryProjection);
            }
            tags[0].to_string()
        };
        let td = self.tagdef(&tag)?;
        if td.dbtype != outer.dbtype {
            return Err(CompileError::SubqueryType {
                tag: outer.name.clone(),
                expected: outer.dbtype.as_str(),
                found: td.dbtype.as_str(),
            });
        }
        let subject_set = self.subject_set(&path.elems)?;
        self.tag_values_sql(&subject_set, &tag, false)
    }

    // ------------------------------------------------------------------
    // Bridging between chained elements
    // ------------------------------------------------------------------

    /// Pick the single unambiguous bridging pair (projection tag of the
    /// previous element, subject tag of the next).
    fn find_bridge(
        &self,
        a: &PathElem,
        b: &PathElem,
        b_index: usize,
    ) -> Result<(String, String), CompileError> {
        let a_tags = a.list_tags();
        let b_tags = b.subject_tags();
        let a_index = b_index - 1;

        let mut candidates: Vec<(String, String)> = Vec::new();

        if b_tags.is_empty() {
            // No subject predicates downstream: the reference target itself
            // identifies the next element's subjects.
            for ta in &a_tags {
                if let Some(td) = self.schema.tagdef(ta)
                    && let Some(tagref) = &td.tagref
                {
                    candidates.push((ta.to_string(), tagref.target.clone()));
                }
            }
        } else {
            for ta in &a_tags {
                for tb in &b_tags {
                    let (Some(tda), Some(tdb)) =
                        (self.schema.tagdef(ta), self.schema.tagdef(tb))
                    else {
                        continue;
                    };
                    let related = tda.tagref.as_ref().is_some_and(|r| r.target == *tb)
                        || tdb.tagref.as_ref().is_some_and(|r| r.target == *ta);
                    if related {
                        candidates.push((ta.to_string(), tb.to_string()));
                    }
                }
            }
            if candidates.is_empty() {
                // Fall back to the single common scalar dbtype.
                for ta in &a_tags {
                    for tb in &b_tags {
                        let (Some(tda), Some(tdb)) =
                            (self.schema.tagdef(ta), self.schema.tagdef(tb))
                        else {
                            continue;
                        };
                        if tda.dbtype == tdb.dbtype && tda.dbtype.is_scalar() {
                            candidates.push((ta.to_string(), tb.to_string()));
                        }
                    }
                }
            }
        }

        match candidates.len() {
            0 => Err(CompileError::NoBridge(a_index, b_index)),
            1 => Ok(candidates.remove(0)),
            _ => Err(CompileError::AmbiguousBridge(a_index, b_index)),
        }
    }

    /// `value IN (...)` membership for the bridge constraint on tag `tb` of
    /// the current element.
    fn membership_condition(
        &mut self,
        tb: &str,
        values_sql: &str,
    ) -> Result<String, CompileError> {
        let td = self.tagdef(tb)?.clone();
        let t = self.alias("t");
        let mut inner = vec![
            format!("{t}.subject = s.id"),
            format!("{t}.value IN ({values_sql})"),
        ];
        match self.read_guard(&td, &format!("{t}.subject"), &format!("{t}.value"))? {
            Guard::Deny => return Ok("FALSE".to_string()),
            Guard::Cond(guard) => inner.push(guard),
            Guard::Allow => {}
        }
        Ok(format!(
            "EXISTS (SELECT 1 FROM {} AS {t} WHERE {})",
            tag_table(tb),
            inner.join(" AND ")
        ))
    }

    /// Authorization-filtered value enumeration of one tag over a subject
    /// set: the building block for bridges, subqueries, and value shapes.
    /// `cast_text` renders search documents as text for client-facing value
    /// shapes; comparisons (bridges, subqueries) keep the stored type.
    fn tag_values_sql(
        &mut self,
        subject_set: &str,
        tag: &str,
        cast_text: bool,
    ) -> Result<String, CompileError> {
        let td = self.tagdef(tag)?.clone();
        if td.dbtype == DbType::Empty {
            return Err(CompileError::ShapeNeedsValues {
                shape: "value",
                tag: tag.to_string(),
            });
        }
        let t = self.alias("v");
        let selector = if cast_text && td.dbtype == DbType::Tsvector {
            format!("({t}.value)::text AS value")
        } else {
            format!("{t}.value")
        };
        let mut conds = vec![format!("{t}.subject IN ({subject_set})")];
        match self.read_guard(&td, &format!("{t}.subject"), &format!("{t}.value"))? {
            Guard::Deny => conds.push("FALSE".to_string()),
            Guard::Cond(guard) => conds.push(guard),
            Guard::Allow => {}
        }
        if let Guard::Cond(filter) = self.ref_filter(&td, &format!("{t}.value"))? {
            conds.push(filter);
        }
        Ok(format!(
            "SELECT {selector} FROM {} AS {t} WHERE {}",
            tag_table(tag),
            conds.join(" AND ")
        ))
    }

    // ------------------------------------------------------------------
    // Authorization guards
    // ------------------------------------------------------------------

    /// Build the per-row guard for a tag whose static read decision is not
    /// already final. Subject-based atoms bind to `subj_col`; object-based
    /// atoms restrict `value_col` to visible referenced values.
    fn read_guard(
        &mut self,
        td: &TagDef,
        subj_col: &str,
        value_col: &str,
    ) -> Result<Guard, CompileError> {
        match self.schema.readok(&td.name) {
            Decision::Allow => Ok(Guard::Allow),
            Decision::Deny => Ok(Guard::Deny),
            Decision::Indeterminate => {
                self.guard_tree(&td.readpolicy.policy(), td, subj_col, value_col)
            }
        }
    }

    fn guard_tree(
        &mut self,
        policy: &Policy,
        td: &TagDef,
        subj_col: &str,
        value_col: &str,
    ) -> Result<Guard, CompileError> {
        Ok(match policy {
            Policy::Anonymous => Guard::Allow,
            Policy::System => Guard::Deny,
            Policy::TagAcl => {
                if self.schema.tag_acl_read(&td.name) {
                    Guard::Allow
                } else {
                    Guard::Deny
                }
            }
            Policy::Subject => self.subject_acl_guard(subj_col, true),
            Policy::SubjectOwner => self.subject_acl_guard(subj_col, false),
            Policy::Object => self.object_guard(td, value_col, false)?,
            Policy::ObjectOwner => self.object_guard(td, value_col, true)?,
            Policy::And(a, b) => {
                let left = self.guard_tree(a, td, subj_col, value_col)?;
                let right = self.guard_tree(b, td, subj_col, value_col)?;
                left.and(right)
            }
            Policy::Or(a, b) => {
                let left = self.guard_tree(a, td, subj_col, value_col)?;
                let right = self.guard_tree(b, td, subj_col, value_col)?;
                left.or(right)
            }
        })
    }

    /// Ownership (and optionally ACL) test over the subject in `subj_col`.
    fn subject_acl_guard(&mut self, subj_col: &str, with_acl: bool) -> Guard {
        let Some(principal) = self.ctx.principal.clone() else {
            return Guard::Deny;
        };
        let ow = self.alias("ow");
        let mut guard = format!(
            "EXISTS (SELECT 1 FROM {} AS {ow} WHERE {ow}.subject = {subj_col} AND {ow}.value = {})",
            tag_table(reserved::OWNER),
            self.params.push(TagValue::Text(principal))
        );
        if with_acl && !self.ctx.attributes.is_empty() {
            let rd = self.alias("rd");
            let mut attrs: Vec<String> = self.ctx.attributes.iter().cloned().collect();
            attrs.sort();
            let list = self
                .params
                .push_list(attrs.into_iter().map(TagValue::Text));
            guard = format!(
                "({guard} OR EXISTS (SELECT 1 FROM {} AS {rd} \
                 WHERE {rd}.subject = {subj_col} AND {rd}.value IN {list}))",
                tag_table(reserved::READERS)
            );
        }
        Guard::Cond(guard)
    }

    /// Restrict a tagref tag's values to those whose referenced subject the
    /// principal may see (or owns, for owner-based object policies).
    fn object_guard(
        &mut self,
        td: &TagDef,
        value_col: &str,
        owner_only: bool,
    ) -> Result<Guard, CompileError> {
        let Some(tagref) = &td.tagref else {
            // An object policy on a tag with no reference can never resolve.
            return Ok(Guard::Deny);
        };
        let target = tagref.target.clone();
        if self.ref_stack.contains(&target) {
            return Err(CompileError::ReferenceCycle(target));
        }
        let target_td = self.tagdef(&target)?.clone();

        self.ref_stack.push(target.clone());
        let result = self.object_guard_inner(&target_td, value_col, owner_only);
        self.ref_stack.pop();
        result
    }

    fn object_guard_inner(
        &mut self,
        target_td: &TagDef,
        value_col: &str,
        owner_only: bool,
    ) -> Result<Guard, CompileError> {
        let u = self.alias("u");
        let mut conds: Vec<String> = Vec::new();

        // The referenced tag's own read authorization applies recursively.
        match self.read_guard(target_td, &format!("{u}.subject"), &format!("{u}.value"))? {
            Guard::Deny => return Ok(Guard::Deny),
            Guard::Cond(guard) => conds.push(guard),
            Guard::Allow => {}
        }

        match self.subject_acl_guard(&format!("{u}.subject"), !owner_only) {
            Guard::Deny => return Ok(Guard::Deny),
            Guard::Cond(guard) => conds.push(guard),
            Guard::Allow => {}
        }

        let where_clause = if conds.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conds.join(" AND "))
        };
        Ok(Guard::Cond(format!(
            "{value_col} IN (SELECT {u}.value FROM {} AS {u}{where_clause})",
            tag_table(&target_td.name)
        )))
    }

    /// Referential transparency: constraining or projecting a hard-reference
    /// tag is always restricted through the referenced tag's own read-
    /// filtered values, so unreadable objects cannot be discovered.
    fn ref_filter(&mut self, td: &TagDef, value_col: &str) -> Result<Guard, CompileError> {
        let Some(tagref) = &td.tagref else {
            return Ok(Guard::Allow);
        };
        if tagref.soft {
            return Ok(Guard::Allow);
        }
        let target = tagref.target.clone();
        if self.schema.readok(&target) == Decision::Allow {
            return Ok(Guard::Allow);
        }
        if self.ref_stack.contains(&target) {
            return Err(CompileError::ReferenceCycle(target));
        }
        let target_td = self.tagdef(&target)?.clone();

        self.ref_stack.push(target.clone());
        let guard = self.read_guard(&target_td, "__ref_subject__", "__ref_value__");
        self.ref_stack.pop();

        let u = self.alias("u");
        let where_clause = match guard? {
            Guard::Allow => String::new(),
            Guard::Deny => " WHERE FALSE".to_string(),
            Guard::Cond(cond) => {
                let cond = cond
                    .replace("__ref_subject__", &format!("{u}.subject"))
                    .replace("__ref_value__", &format!("{u}.value"));
                format!(" WHERE {cond}")
            }
        };
        Ok(Guard::Cond(format!(
            "{value_col} IN (SELECT {u}.value FROM {} AS {u}{where_clause})",
            tag_table(&target)
        )))
    }

    // ------------------------------------------------------------------
    // Result shapes
    // ------------------------------------------------------------------

    fn triples_query(
        &mut self,
        subject_set: &str,
        last: &PathElem,
        listpreds: &[Predicate],
        options: &CompileOptions,
    ) -> Result<String, CompileError> {
        let mut columns = vec!["s.id AS id".to_string()];

        let mut seen: Vec<&str> = Vec::new();
        for pred in listpreds {
            if seen.contains(&pred.tag.as_str()) {
                continue;
            }
            seen.push(&pred.tag);
            let expr = self.projection_expr(&pred.tag)?;
            columns.push(format!("{expr} AS {}", quote_ident(&pred.tag)));
        }

        let mut sql = format!(
            "SELECT {} FROM subjects AS s WHERE s.id IN ({subject_set})",
            columns.join(", ")
        );

        let mut order_parts: Vec<String> = Vec::new();
        for order in &last.ordertags {
            let expr = if seen.contains(&order.tag.as_str()) {
                quote_ident(&order.tag)
            } else {
                self.projection_expr(&order.tag)?
            };
            order_parts.push(format!("{expr} {} NULLS LAST", order.dir.sql()));
        }
        // Subject id tiebreak keeps output deterministic.
        order_parts.push("s.id ASC".to_string());
        sql.push_str(" ORDER BY ");
        sql.push_str(&order_parts.join(", "));

        if let Some(limit) = options.row_limit {
            let p = self.params.push(TagValue::Int8(limit as i64));
            sql.push_str(&format!(" LIMIT {p}"));
        }
        Ok(sql)
    }

    /// Correlated projection of one tag for the subject in `s.id`.
    fn projection_expr(&mut self, tag: &str) -> Result<String, CompileError> {
        let td = self.tagdef(tag)?.clone();

        let t = self.alias("p");
        let value_col = format!("{t}.value");

        // Guards built against the projection's own columns. Object-based
        // conditions restrict the value column inside the correlated select;
        // subject-based conditions wrap the expression so an unreadable tag
        // always reads as NULL, revealing nothing.
        let guard = self.read_guard(&td, "s.id", &value_col)?;
        if matches!(guard, Guard::Deny) {
            return Ok("NULL".to_string());
        }

        let expr = if td.dbtype == DbType::Empty {
            format!(
                "EXISTS (SELECT 1 FROM {} AS {t} WHERE {t}.subject = s.id)",
                tag_table(tag)
            )
        } else {
            let mut inner = vec![format!("{t}.subject = s.id")];
            if let Guard::Cond(cond) = &guard
                && cond.contains(&value_col)
            {
                inner.push(cond.clone());
            }
            if let Guard::Cond(filter) = self.ref_filter(&td, &value_col)? {
                inner.push(filter);
            }
            let value_expr = if td.dbtype == DbType::Tsvector {
                format!("({value_col})::text")
            } else {
                value_col.clone()
            };
            let selector = if td.multivalue {
                format!("array_agg({value_expr} ORDER BY {value_expr})")
            } else {
                value_expr
            };
            format!(
                "(SELECT {selector} FROM {} AS {t} WHERE {})",
                tag_table(tag),
                inner.join(" AND ")
            )
        };

        Ok(match guard {
            Guard::Allow => expr,
            Guard::Deny => unreachable!("handled above"),
            Guard::Cond(cond) => {
                if cond.contains(&value_col) {
                    // Already applied inside the correlated select.
                    expr
                } else {
                    format!("CASE WHEN {cond} THEN {expr} ELSE NULL END")
                }
            }
        })
    }

    fn shape_values_sql(
        &mut self,
        subject_set: &str,
        tag: &str,
        shape: &'static str,
    ) -> Result<String, CompileError> {
        let td = self.tagdef(tag)?;
        if td.dbtype == DbType::Empty {
            return Err(CompileError::ShapeNeedsValues {
                shape,
                tag: tag.to_string(),
            });
        }
        self.tag_values_sql(subject_set, tag, true)
    }
}

fn single_projection(
    shape: &'static str,
    listpreds: &[Predicate],
) -> Result<String, CompileError> {
    let mut tags: Vec<&str> = Vec::new();
    for p in listpreds {
        if !tags.contains(&p.tag.as_str()) {
            tags.push(&p.tag);
        }
    }
    if tags.len() != 1 {
        return Err(CompileError::ShapeProjection { shape });
    }
    Ok(tags[0].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_path;
    use curio_core::{PolicyName, TagRef};
    use std::collections::HashMap;

    struct MockSchema {
        tagdefs: HashMap<String, TagDef>,
        readok: HashMap<String, Decision>,
        tag_acl: HashMap<String, bool>,
    }

    impl MockSchema {
        fn new(defs: Vec<TagDef>) -> Self {
            let mut tagdefs = HashMap::new();
            let mut readok = HashMap::new();
            for td in defs {
                // Anonymous policies resolve statically; everything else is
                // left open unless a test overrides it.
                let decision = match td.readpolicy {
                    PolicyName::Anonymous => Decision::Allow,
                    PolicyName::System => Decision::Deny,
                    _ => Decision::Indeterminate,
                };
                readok.insert(td.name.clone(), decision);
                tagdefs.insert(td.name.clone(), td);
            }
            Self {
                tagdefs,
                readok,
                tag_acl: HashMap::new(),
            }
        }

        fn with_readok(mut self, tag: &str, decision: Decision) -> Self {
            self.readok.insert(tag.to_string(), decision);
            self
        }
    }

    impl SchemaView for MockSchema {
        fn tagdef(&self, name: &str) -> Option<&TagDef> {
            self.tagdefs.get(name)
        }

        fn readok(&self, name: &str) -> Decision {
            self.readok.get(name).copied().unwrap_or(Decision::Deny)
        }

        fn tag_acl_read(&self, name: &str) -> bool {
            self.tag_acl.get(name).copied().unwrap_or(false)
        }
    }

    fn schema() -> MockSchema {
        MockSchema::new(vec![
            TagDef::new("name", DbType::Text).unique(),
            TagDef::new("email", DbType::Text),
            TagDef::new("age", DbType::Int8),
            TagDef::new("dept", DbType::Text),
            TagDef::new("keywords", DbType::Text).multivalue(),
            TagDef::new("manager", DbType::Text).with_tagref(TagRef::hard("name")),
            TagDef::new("archived", DbType::Empty),
            TagDef::new("notes", DbType::Tsvector),
            TagDef::new("salary", DbType::Int8)
                .with_policies(PolicyName::SubjectOwner, PolicyName::SubjectOwner),
        ])
    }

    fn anon() -> PrincipalContext {
        PrincipalContext::anonymous()
    }

    fn alice() -> PrincipalContext {
        PrincipalContext::authenticated("alice", vec![])
    }

    fn compile_str(
        path: &str,
        schema: &MockSchema,
        ctx: &PrincipalContext,
        options: &CompileOptions,
    ) -> Result<CompiledQuery, CompileError> {
        let path = parse_path(path).unwrap();
        compile(&path, schema, ctx, options)
    }

    #[test]
    fn test_simple_equality_binds_parameter() {
        let q = compile_str("name=alice(email)", &schema(), &anon(), &Default::default())
            .unwrap();
        assert!(q.sql.contains("\"t_name\""));
        assert!(q.sql.contains("IN ($1)"));
        assert_eq!(q.params, vec![TagValue::Text("alice".into())]);
        // No value text ever lands in the SQL.
        assert!(!q.sql.contains("alice"));
    }

    #[test]
    fn test_typed_values_are_parsed() {
        let q = compile_str("age:lt:30", &schema(), &anon(), &Default::default()).unwrap();
        assert_eq!(q.params, vec![TagValue::Int8(30)]);
        assert!(q.sql.contains("< $1"));

        assert!(matches!(
            compile_str("age=young", &schema(), &anon(), &Default::default()),
            Err(CompileError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_duplicate_tag_predicates_conjoin_in_one_exists() {
        let q = compile_str("age:geq:18;age:lt:30", &schema(), &anon(), &Default::default())
            .unwrap();
        assert_eq!(q.sql.matches("EXISTS (SELECT 1 FROM \"t_age\"").count(), 1);
        assert!(q.sql.contains(">= $1"));
        assert!(q.sql.contains("< $2"));
    }

    #[test]
    fn test_absence_compiles_to_left_outer_join() {
        let q = compile_str("email:absent:", &schema(), &anon(), &Default::default()).unwrap();
        assert!(q.sql.contains("LEFT OUTER JOIN \"t_email\""));
        assert!(q.sql.contains("IS NULL"));
    }

    #[test]
    fn test_presence_plus_absence_is_always_empty_not_error() {
        let q = compile_str("email;email:absent:", &schema(), &anon(), &Default::default())
            .unwrap();
        assert!(q.sql.contains("FALSE"));
    }

    #[test]
    fn test_word_predicates_merge_into_one_tsquery() {
        let q = compile_str(
            "notes:word:alpha;notes:word:beta;notes:!word:gamma",
            &schema(),
            &anon(),
            &Default::default(),
        )
        .unwrap();
        assert_eq!(
            q.params,
            vec![TagValue::Text("'alpha' & 'beta' & !'gamma'".into())]
        );
        assert!(q.sql.contains("to_tsquery('simple', $1)"));
    }

    #[test]
    fn test_statically_denied_projection_is_null() {
        let schema = schema().with_readok("salary", Decision::Deny);
        let q = compile_str("name=alice(salary)", &schema, &anon(), &Default::default())
            .unwrap();
        assert!(q.sql.contains("NULL AS \"salary\""));
        assert!(!q.sql.contains("\"t_salary\""));
    }

    #[test]
    fn test_indeterminate_projection_gets_ownership_guard() {
        let q = compile_str("name=bob(salary)", &schema(), &alice(), &Default::default())
            .unwrap();
        assert!(q.sql.contains("CASE WHEN"));
        assert!(q.sql.contains("\"t_owner\""));
        assert!(q.params.contains(&TagValue::Text("alice".into())));
    }

    #[test]
    fn test_indeterminate_filter_for_anonymous_is_empty() {
        // An anonymous principal can never satisfy an ownership guard, so
        // filtering on the guarded tag compiles to an empty match.
        let q = compile_str("salary:gt:100", &schema(), &anon(), &Default::default()).unwrap();
        assert!(q.sql.contains("FALSE"));
    }

    #[test]
    fn test_multivalue_projection_aggregates() {
        let q = compile_str("name=alice(keywords)", &schema(), &anon(), &Default::default())
            .unwrap();
        assert!(q.sql.contains("array_agg"));
    }

    #[test]
    fn test_presence_only_projection_is_exists() {
        let q = compile_str("name=alice(archived)", &schema(), &anon(), &Default::default())
            .unwrap();
        assert!(q.sql.contains("EXISTS (SELECT 1 FROM \"t_archived\""));
    }

    #[test]
    fn test_ordering_with_nulls_last_and_id_tiebreak() {
        let q = compile_str(
            "dept=eng(name;age)age:desc:",
            &schema(),
            &anon(),
            &Default::default(),
        )
        .unwrap();
        assert!(q.sql.contains("ORDER BY \"age\" DESC NULLS LAST, s.id ASC"));
    }

    #[test]
    fn test_values_shape_requires_single_projection() {
        let options = CompileOptions {
            shape: QueryShape::Values,
            ..Default::default()
        };
        let q = compile_str("dept=eng(name)", &schema(), &anon(), &options).unwrap();
        assert!(q.sql.starts_with("SELECT DISTINCT value"));

        assert!(matches!(
            compile_str("dept=eng(name;email)", &schema(), &anon(), &options),
            Err(CompileError::ShapeProjection { .. })
        ));
    }

    #[test]
    fn test_count_shape() {
        let options = CompileOptions {
            shape: QueryShape::Count,
            ..Default::default()
        };
        let q = compile_str("(dept)", &schema(), &anon(), &options).unwrap();
        assert!(q.sql.contains("COUNT(DISTINCT value)"));
    }

    #[test]
    fn test_topvals_shape_binds_limit() {
        let options = CompileOptions {
            shape: QueryShape::TopVals {
                limit: 10,
                bottom: false,
            },
            ..Default::default()
        };
        let q = compile_str("(dept)", &schema(), &anon(), &options).unwrap();
        assert!(q.sql.contains("GROUP BY value"));
        assert!(q.sql.contains("ORDER BY 2 DESC"));
        assert_eq!(q.params.last(), Some(&TagValue::Int8(10)));
    }

    #[test]
    fn test_subquery_membership() {
        let q = compile_str(
            "manager=@(dept=eng(name))",
            &schema(),
            &anon(),
            &Default::default(),
        )
        .unwrap();
        assert!(q.sql.contains("\"t_manager\""));
        assert!(q.sql.contains("IN (SELECT"));
        assert_eq!(q.params, vec![TagValue::Text("eng".into())]);
    }

    #[test]
    fn test_subquery_requires_single_projection() {
        assert!(matches!(
            compile_str(
                "manager=@(dept=eng(name;email))",
                &schema(),
                &anon(),
                &Default::default()
            ),
            Err(CompileError::SubqueryProjection)
        ));
    }

    #[test]
    fn test_subquery_dbtype_mismatch() {
        assert!(matches!(
            compile_str(
                "manager=@(dept=eng(age))",
                &schema(),
                &anon(),
                &Default::default()
            ),
            Err(CompileError::SubqueryType { .. })
        ));
    }

    #[test]
    fn test_chained_path_bridges_through_reference() {
        // manager references name, so element 2 is keyed by name values
        // produced by element 1.
        let q = compile_str(
            "dept=eng(manager)/name(email)",
            &schema(),
            &anon(),
            &Default::default(),
        )
        .unwrap();
        assert!(q.sql.contains("\"t_manager\""));
        assert!(q.sql.contains("\"t_name\""));
    }

    #[test]
    fn test_chained_path_without_subjpreds_uses_ref_target() {
        let q = compile_str(
            "dept=eng(manager)/(email)",
            &schema(),
            &anon(),
            &Default::default(),
        )
        .unwrap();
        assert!(q.sql.contains("\"t_name\""));
    }

    #[test]
    fn test_chained_path_without_bridge_is_error() {
        assert!(matches!(
            compile_str(
                "dept=eng(archived)/age:gt:5(email)",
                &schema(),
                &anon(),
                &Default::default()
            ),
            Err(CompileError::NoBridge(0, 1))
        ));
    }

    #[test]
    fn test_ambiguous_bridge_is_error() {
        // Both email and dept are text; two scalar pairs, no references.
        assert!(matches!(
            compile_str(
                "age:gt:5(email;dept)/email(name)",
                &schema(),
                &anon(),
                &Default::default()
            ),
            Err(CompileError::AmbiguousBridge(0, 1))
        ));
    }

    #[test]
    fn test_unknown_tag() {
        assert!(matches!(
            compile_str("nope=1", &schema(), &anon(), &Default::default()),
            Err(CompileError::UnknownTag(_))
        ));
    }

    #[test]
    fn test_op_dbtype_mismatch() {
        assert!(matches!(
            compile_str("archived=1", &schema(), &anon(), &Default::default()),
            Err(CompileError::OpNotSupported { .. })
        ));
        assert!(matches!(
            compile_str("notes:lt:x", &schema(), &anon(), &Default::default()),
            Err(CompileError::OpNotSupported { .. })
        ));
    }

    #[test]
    fn test_default_projection_expands_view() {
        let options = CompileOptions {
            default_projection: vec!["name".to_string(), "email".to_string()],
            ..Default::default()
        };
        let q = compile_str("dept=eng", &schema(), &anon(), &options).unwrap();
        assert!(q.sql.contains("AS \"name\""));
        assert!(q.sql.contains("AS \"email\""));
    }

    #[test]
    fn test_row_limit_is_bound() {
        let options = CompileOptions {
            row_limit: Some(50),
            ..Default::default()
        };
        let q = compile_str("dept=eng(name)", &schema(), &anon(), &options).unwrap();
        assert!(q.sql.ends_with("LIMIT $2"));
        assert_eq!(q.params.last(), Some(&TagValue::Int8(50)));
    }

    #[test]
    fn test_unique_identifying_detection() {
        let s = schema();
        let path = parse_path("name=alice;dept=eng").unwrap();
        assert!(is_unique_identifying(&path.elems[0].subjpreds, &s));

        let path = parse_path("dept=eng").unwrap();
        assert!(!is_unique_identifying(&path.elems[0].subjpreds, &s));

        let path = parse_path("name:like:al%25").unwrap();
        assert!(!is_unique_identifying(&path.elems[0].subjpreds, &s));

        let path = parse_path("name=@(dept=eng(name))").unwrap();
        assert!(!is_unique_identifying(&path.elems[0].subjpreds, &s));
    }

    #[test]
    fn test_hard_reference_filter_applies_when_target_guarded() {
        let mut schema = schema();
        schema.tagdefs.get_mut("name").unwrap().readpolicy = PolicyName::SubjectOwner;
        let schema = schema.with_readok("name", Decision::Indeterminate);
        let q = compile_str("manager=bob", &schema, &alice(), &Default::default()).unwrap();
        // Filtering a hard tagref goes through the referenced tag's own
        // read-filtered values.
        assert!(q.sql.matches("\"t_name\"").count() >= 1);
        assert!(q.sql.contains("\"t_owner\""));
    }

    #[test]
    fn test_reference_cycle_detected() {
        let mut s = schema();
        s.tagdefs.insert(
            "a".to_string(),
            TagDef::new("a", DbType::Text)
                .unique()
                .with_tagref(TagRef::hard("b")),
        );
        s.tagdefs.insert(
            "b".to_string(),
            TagDef::new("b", DbType::Text)
                .unique()
                .with_tagref(TagRef::hard("a")),
        );
        s.readok.insert("a".to_string(), Decision::Indeterminate);
        s.readok.insert("b".to_string(), Decision::Indeterminate);
        s.tagdefs.get_mut("a").unwrap().readpolicy = PolicyName::Object;
        s.tagdefs.get_mut("b").unwrap().readpolicy = PolicyName::Object;

        assert!(matches!(
            compile_str("a=1", &s, &alice(), &Default::default()),
            Err(CompileError::ReferenceCycle(_))
        ));
    }
}
