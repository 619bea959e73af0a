//! Policy resolution against the live graph.
//!
//! The pure three-valued evaluator lives in `curio_core::policy`; this
//! module supplies what it cannot know on its own: the tag definition
//! snapshot with per-principal memoized static decisions (`readok`/
//! `writeok`), subject ownership and ACL rows, and referenced-object
//! resolution for object-based policies (cycle-safe; a cycle in the
//! reference graph is a configuration error, not recursion).

use crate::error::{CatalogError, CatalogResult};
use crate::models::bind_value;
use curio_core::policy::{self, PolicyInputs};
use curio_core::{AccessMode, Decision, PrincipalContext, SubjectAccess, SubjectId, TagDef, TagValue, reserved};
use curio_query::{SchemaView, tag_table};
use sqlx::PgConnection;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

/// One tag definition as loaded from the graph: the definition itself, the
/// subject that carries it, and its own ACLs.
#[derive(Clone, Debug)]
pub struct TagdefEntry {
    pub def: TagDef,
    /// The tagdef's own subject id.
    pub subject: SubjectId,
    pub tag_readers: Vec<String>,
    pub tag_writers: Vec<String>,
}

impl TagdefEntry {
    fn acl(&self, mode: AccessMode) -> &[String] {
        match mode {
            AccessMode::Read => &self.tag_readers,
            AccessMode::Write => &self.tag_writers,
        }
    }
}

/// An immutable snapshot of every tag definition, loaded as of one txid and
/// cached until the tagdef tags change.
#[derive(Clone, Debug, Default)]
pub struct TagdefSnapshot {
    pub entries: HashMap<String, TagdefEntry>,
    /// Change-tracking txid the snapshot was loaded at.
    pub txid: i64,
}

impl TagdefSnapshot {
    pub fn get(&self, name: &str) -> Option<&TagdefEntry> {
        self.entries.get(name)
    }

    pub fn require(&self, name: &str) -> CatalogResult<&TagdefEntry> {
        self.entries
            .get(name)
            .ok_or_else(|| CatalogError::NotFound(format!("tag '{name}' is not defined")))
    }

    /// Tags holding a hard reference to `target`.
    pub fn hard_referrers(&self, target: &str) -> Vec<&TagdefEntry> {
        self.entries
            .values()
            .filter(|e| {
                e.def
                    .tagref
                    .as_ref()
                    .is_some_and(|r| !r.soft && r.target == target)
            })
            .collect()
    }
}

/// The static (subject-independent) policy decision for one tag and mode.
pub fn static_decision(
    mode: AccessMode,
    entry: &TagdefEntry,
    ctx: &PrincipalContext,
) -> Decision {
    let inputs = PolicyInputs::static_only(entry.def.owner.as_deref(), entry.acl(mode));
    policy::evaluate(mode, entry.def.policy(mode), ctx, &inputs)
}

/// Turn a fully resolved decision into the caller-visible outcome.
///
/// `Indeterminate` fails closed: with no credentials it means
/// "authentication required", with credentials it is a denial.
pub fn require(decision: Decision, ctx: &PrincipalContext, what: &str) -> CatalogResult<()> {
    match decision {
        Decision::Allow => Ok(()),
        Decision::Deny => Err(CatalogError::Forbidden(format!("{what} denied by policy"))),
        Decision::Indeterminate => {
            if ctx.is_anonymous() {
                Err(CatalogError::Unauthorized(format!(
                    "{what} requires authentication"
                )))
            } else {
                Err(CatalogError::Forbidden(format!(
                    "{what} denied: policy could not be resolved"
                )))
            }
        }
    }
}

/// Schema view for the query compiler: tag definitions plus memoized static
/// read decisions for one principal. Request-scoped.
pub struct PrincipalSchemaView<'a> {
    snapshot: &'a TagdefSnapshot,
    ctx: &'a PrincipalContext,
    readok: RefCell<HashMap<String, Decision>>,
}

impl<'a> PrincipalSchemaView<'a> {
    pub fn new(snapshot: &'a TagdefSnapshot, ctx: &'a PrincipalContext) -> Self {
        Self {
            snapshot,
            ctx,
            readok: RefCell::new(HashMap::new()),
        }
    }
}

impl SchemaView for PrincipalSchemaView<'_> {
    fn tagdef(&self, name: &str) -> Option<&TagDef> {
        self.snapshot.get(name).map(|e| &e.def)
    }

    fn readok(&self, name: &str) -> Decision {
        if let Some(d) = self.readok.borrow().get(name) {
            return *d;
        }
        let d = match self.snapshot.get(name) {
            Some(entry) => static_decision(AccessMode::Read, entry, self.ctx),
            None => Decision::Deny,
        };
        self.readok.borrow_mut().insert(name.to_string(), d);
        d
    }

    fn tag_acl_read(&self, name: &str) -> bool {
        let Some(entry) = self.snapshot.get(name) else {
            return false;
        };
        let owner_match = match (&self.ctx.principal, &entry.def.owner) {
            (Some(p), Some(o)) => p == o,
            _ => false,
        };
        owner_match
            || entry
                .tag_readers
                .iter()
                .any(|a| self.ctx.attributes.contains(a))
    }
}

/// Fetch a subject's owner and mode-relevant ACL.
pub async fn fetch_subject_access(
    conn: &mut PgConnection,
    subject: SubjectId,
    mode: AccessMode,
) -> CatalogResult<SubjectAccess> {
    let owner: Option<String> = sqlx::query_scalar(&format!(
        "SELECT value FROM {} WHERE subject = $1",
        tag_table(reserved::OWNER)
    ))
    .bind(subject)
    .fetch_optional(&mut *conn)
    .await?;

    let acl_tag = match mode {
        AccessMode::Read => reserved::READERS,
        AccessMode::Write => reserved::WRITERS,
    };
    let acl: Vec<String> = sqlx::query_scalar(&format!(
        "SELECT value FROM {} WHERE subject = $1",
        tag_table(acl_tag)
    ))
    .bind(subject)
    .fetch_all(&mut *conn)
    .await?;

    Ok(SubjectAccess { owner, acl })
}

/// Whether the principal can see the subject at all. Ownerless subjects are
/// public; owned subjects are visible to their owner and read ACL. Used to
/// keep unauthorized reads indistinguishable from absent subjects.
pub async fn subject_visible(
    conn: &mut PgConnection,
    ctx: &PrincipalContext,
    subject: SubjectId,
) -> CatalogResult<bool> {
    if ctx.superuser {
        return Ok(true);
    }
    let access = fetch_subject_access(conn, subject, AccessMode::Read).await?;
    Ok(subject_acl_allows(ctx, &access))
}

fn subject_acl_allows(ctx: &PrincipalContext, access: &SubjectAccess) -> bool {
    match &access.owner {
        None => true,
        Some(owner) => {
            ctx.principal.as_deref() == Some(owner.as_str())
                || access.acl.iter().any(|a| ctx.attributes.contains(a))
        }
    }
}

/// Find the subject carrying `value` in a unique tag.
pub async fn lookup_subject_by_value(
    conn: &mut PgConnection,
    td: &TagDef,
    value: &TagValue,
) -> CatalogResult<Option<SubjectId>> {
    let sql = format!(
        "SELECT subject FROM {} WHERE value = $1",
        tag_table(&td.name)
    );
    match bind_value(sqlx::query(&sql), value)
        .fetch_optional(&mut *conn)
        .await?
    {
        Some(row) => Ok(Some(sqlx::Row::try_get::<i64, _>(&row, 0)?)),
        None => Ok(None),
    }
}

/// Evaluate a tag's policy for one access, resolving whatever row state the
/// static decision left open.
pub async fn evaluate(
    conn: &mut PgConnection,
    snapshot: &TagdefSnapshot,
    ctx: &PrincipalContext,
    mode: AccessMode,
    entry: &TagdefEntry,
    subject: Option<SubjectId>,
    value: Option<&TagValue>,
) -> CatalogResult<Decision> {
    let static_d = static_decision(mode, entry, ctx);
    if static_d != Decision::Indeterminate {
        return Ok(static_d);
    }

    let subject_access = match subject {
        Some(id) => Some(fetch_subject_access(conn, id, mode).await?),
        None => None,
    };

    let (object_access, object_readable) = if entry.def.policy(mode).examines_object() {
        match value {
            Some(value) => {
                let readable =
                    referenced_readability(conn, snapshot, ctx, entry, value).await?;
                let object_access = match referenced_subject(conn, snapshot, entry, value).await? {
                    Some(obj) => Some(fetch_subject_access(conn, obj, AccessMode::Read).await?),
                    None => None,
                };
                (object_access, Some(readable))
            }
            None => (None, None),
        }
    } else {
        (None, None)
    };

    let inputs = PolicyInputs {
        tag_owner: entry.def.owner.as_deref(),
        tag_acl: entry.acl(mode),
        subject: subject_access.as_ref(),
        object: object_access.as_ref(),
        object_readable,
    };
    Ok(policy::evaluate(mode, entry.def.policy(mode), ctx, &inputs))
}

async fn referenced_subject(
    conn: &mut PgConnection,
    snapshot: &TagdefSnapshot,
    entry: &TagdefEntry,
    value: &TagValue,
) -> CatalogResult<Option<SubjectId>> {
    let Some(tagref) = &entry.def.tagref else {
        return Ok(None);
    };
    let target = snapshot.require(&tagref.target)?;
    lookup_subject_by_value(conn, &target.def, value).await
}

/// Readability of the object a tagref value points at, walking the
/// reference chain. Values relate by equality along the chain, so the same
/// value is chased through each hop.
async fn referenced_readability(
    conn: &mut PgConnection,
    snapshot: &TagdefSnapshot,
    ctx: &PrincipalContext,
    start: &TagdefEntry,
    value: &TagValue,
) -> CatalogResult<Decision> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut entry = start;
    let mut decision = Decision::Allow;

    loop {
        let Some(tagref) = &entry.def.tagref else {
            // Object policy on a tag without a reference can never resolve.
            return Ok(Decision::Deny);
        };
        if !visited.insert(tagref.target.clone()) {
            return Err(CatalogError::Internal(format!(
                "reference cycle through tag '{}'",
                tagref.target
            )));
        }
        let target = snapshot.require(&tagref.target)?;

        let Some(obj) = lookup_subject_by_value(conn, &target.def, value).await? else {
            // Dangling (soft) reference: nothing to authorize against.
            return Ok(Decision::Deny);
        };

        let access = fetch_subject_access(conn, obj, AccessMode::Read).await?;
        if !ctx.superuser && !subject_acl_allows(ctx, &access) {
            return Ok(Decision::Deny);
        }

        // The referenced tag's own read policy applies as well.
        let tag_d = {
            let static_d = static_decision(AccessMode::Read, target, ctx);
            if static_d != Decision::Indeterminate {
                static_d
            } else if target.def.readpolicy.examines_object() {
                // Chase the chain one hop deeper.
                entry = target;
                continue;
            } else {
                let inputs = PolicyInputs {
                    tag_owner: target.def.owner.as_deref(),
                    tag_acl: &target.tag_readers,
                    subject: Some(&access),
                    object: None,
                    object_readable: None,
                };
                policy::evaluate(AccessMode::Read, target.def.readpolicy, ctx, &inputs)
            }
        };
        decision = decision.and(tag_d);
        return Ok(decision);
    }
}
