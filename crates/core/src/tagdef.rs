//! Tag definitions and the reserved system tags.

use crate::error::{Error, Result};
use crate::policy::{AccessMode, PolicyName};
use crate::value::DbType;
use crate::MAX_TAG_NAME_LEN;
use serde::{Deserialize, Serialize};

/// Reference from one tag's values to another tag's unique values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRef {
    /// Name of the referenced tag; it must be `unique`.
    pub target: String,
    /// Soft references skip referential-integrity and cascade enforcement.
    #[serde(default)]
    pub soft: bool,
}

impl TagRef {
    pub fn hard(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            soft: false,
        }
    }

    pub fn soft(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            soft: true,
        }
    }
}

/// Declaration of one tag: its storage type, constraints, and policies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagDef {
    pub name: String,
    pub dbtype: DbType,
    /// May a subject hold more than one value for this tag.
    #[serde(default)]
    pub multivalue: bool,
    /// Is the value globally unique across subjects.
    #[serde(default)]
    pub unique: bool,
    /// Optional reference constraint on values.
    #[serde(default)]
    pub tagref: Option<TagRef>,
    pub readpolicy: PolicyName,
    pub writepolicy: PolicyName,
    /// Principal allowed to alter the definition.
    #[serde(default)]
    pub owner: Option<String>,
}

impl TagDef {
    /// A plain tag with the default policies (world-readable, writable by the
    /// subject's ACL or owner).
    pub fn new(name: impl Into<String>, dbtype: DbType) -> Self {
        Self {
            name: name.into(),
            dbtype,
            multivalue: false,
            unique: false,
            tagref: None,
            readpolicy: PolicyName::Anonymous,
            writepolicy: PolicyName::Subject,
            owner: None,
        }
    }

    pub fn multivalue(mut self) -> Self {
        self.multivalue = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_tagref(mut self, tagref: TagRef) -> Self {
        self.tagref = Some(tagref);
        self
    }

    pub fn with_policies(mut self, read: PolicyName, write: PolicyName) -> Self {
        self.readpolicy = read;
        self.writepolicy = write;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// The policy governing the given access mode.
    pub fn policy(&self, mode: AccessMode) -> PolicyName {
        match mode {
            AccessMode::Read => self.readpolicy,
            AccessMode::Write => self.writepolicy,
        }
    }

    /// Whether this is one of the catalog's own reserved tags.
    pub fn is_reserved(&self) -> bool {
        reserved::is_reserved(&self.name)
    }

    /// Check the definition's local invariants (everything not requiring a
    /// catalog lookup; tagref target existence is checked at define time).
    pub fn validate(&self) -> Result<()> {
        validate_tag_name(&self.name)?;

        if self.dbtype == DbType::Empty {
            if self.multivalue || self.unique {
                return Err(Error::InvalidTagDef(format!(
                    "presence-only tag '{}' cannot be multivalue or unique",
                    self.name
                )));
            }
            if self.tagref.is_some() {
                return Err(Error::InvalidTagDef(format!(
                    "presence-only tag '{}' cannot reference another tag",
                    self.name
                )));
            }
        }

        if self.unique && !self.dbtype.supports_unique() {
            return Err(Error::InvalidTagDef(format!(
                "tag '{}' of dbtype {} cannot be unique",
                self.name, self.dbtype
            )));
        }

        if self.tagref.is_some() && !self.dbtype.is_scalar() {
            return Err(Error::InvalidTagDef(format!(
                "tag '{}' of dbtype {} cannot reference another tag",
                self.name, self.dbtype
            )));
        }

        if let Some(tagref) = &self.tagref
            && tagref.target == self.name
        {
            return Err(Error::InvalidTagDef(format!(
                "tag '{}' cannot reference itself",
                self.name
            )));
        }

        Ok(())
    }
}

/// Validate a tag name: short, URL-safe, and free of the path grammar's
/// structural characters.
pub fn validate_tag_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_TAG_NAME_LEN {
        return Err(Error::InvalidTagName(name.to_string()));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphabetic() {
        return Err(Error::InvalidTagName(name.to_string()));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
        return Err(Error::InvalidTagName(name.to_string()));
    }
    Ok(())
}

/// The reserved system tags the catalog itself depends on.
///
/// Tag definitions are self-describing: each tagdef is a subject carrying
/// these tags, and the catalog bootstraps them directly through the schema
/// manager before anything else exists.
pub mod reserved {
    use super::*;

    /// Unique name of a tag definition; the anchor of the self-describing
    /// schema.
    pub const TAGDEF: &str = "tagdef";
    pub const TAGDEF_DBTYPE: &str = "tagdef-dbtype";
    pub const TAGDEF_MULTIVALUE: &str = "tagdef-multivalue";
    pub const TAGDEF_UNIQUE: &str = "tagdef-unique";
    pub const TAGDEF_TAGREF: &str = "tagdef-tagref";
    pub const TAGDEF_SOFT: &str = "tagdef-soft";
    pub const TAGDEF_READPOLICY: &str = "tagdef-readpolicy";
    pub const TAGDEF_WRITEPOLICY: &str = "tagdef-writepolicy";
    /// Owning principal of any subject.
    pub const OWNER: &str = "owner";
    /// Per-subject read ACL.
    pub const READERS: &str = "readers";
    /// Per-subject write ACL.
    pub const WRITERS: &str = "writers";
    /// Per-tagdef read ACL, bound on the tagdef's subject.
    pub const TAG_READERS: &str = "tagreaders";
    /// Per-tagdef write ACL, bound on the tagdef's subject.
    pub const TAG_WRITERS: &str = "tagwriters";
    /// The reverse "tags present" index, maintained transactionally.
    pub const TAGS: &str = "tags";
    pub const CREATED: &str = "created";
    pub const MODIFIED: &str = "modified";
    /// Unique name of a view (a named default projection).
    pub const VIEW: &str = "view";
    /// The tags a view projects.
    pub const VIEW_TAGS: &str = "view-tags";

    /// All reserved tag names, in bootstrap order (referenced tags first).
    pub const NAMES: &[&str] = &[
        TAGDEF,
        TAGDEF_DBTYPE,
        TAGDEF_MULTIVALUE,
        TAGDEF_UNIQUE,
        TAGDEF_TAGREF,
        TAGDEF_SOFT,
        TAGDEF_READPOLICY,
        TAGDEF_WRITEPOLICY,
        OWNER,
        READERS,
        WRITERS,
        TAG_READERS,
        TAG_WRITERS,
        TAGS,
        CREATED,
        MODIFIED,
        VIEW,
        VIEW_TAGS,
    ];

    pub fn is_reserved(name: &str) -> bool {
        NAMES.contains(&name)
    }

    fn system_tag(name: &str, dbtype: DbType) -> TagDef {
        TagDef::new(name, dbtype)
            .with_policies(PolicyName::Anonymous, PolicyName::System)
            .with_owner("system")
    }

    /// The bootstrap tag definitions, in deployment order.
    pub fn bootstrap_tagdefs() -> Vec<TagDef> {
        vec![
            system_tag(TAGDEF, DbType::Text).unique(),
            system_tag(TAGDEF_DBTYPE, DbType::Text),
            system_tag(TAGDEF_MULTIVALUE, DbType::Boolean),
            system_tag(TAGDEF_UNIQUE, DbType::Boolean),
            system_tag(TAGDEF_TAGREF, DbType::Text).with_tagref(TagRef::soft(TAGDEF)),
            system_tag(TAGDEF_SOFT, DbType::Boolean),
            system_tag(TAGDEF_READPOLICY, DbType::Text),
            system_tag(TAGDEF_WRITEPOLICY, DbType::Text),
            TagDef::new(OWNER, DbType::Text)
                .with_policies(PolicyName::Anonymous, PolicyName::SubjectOwner)
                .with_owner("system"),
            TagDef::new(READERS, DbType::Text)
                .multivalue()
                .with_policies(PolicyName::SubjectOwner, PolicyName::SubjectOwner)
                .with_owner("system"),
            TagDef::new(WRITERS, DbType::Text)
                .multivalue()
                .with_policies(PolicyName::SubjectOwner, PolicyName::SubjectOwner)
                .with_owner("system"),
            TagDef::new(TAG_READERS, DbType::Text)
                .multivalue()
                .with_policies(PolicyName::Anonymous, PolicyName::SubjectOwner)
                .with_owner("system"),
            TagDef::new(TAG_WRITERS, DbType::Text)
                .multivalue()
                .with_policies(PolicyName::Anonymous, PolicyName::SubjectOwner)
                .with_owner("system"),
            system_tag(TAGS, DbType::Text)
                .multivalue()
                .with_tagref(TagRef::soft(TAGDEF)),
            system_tag(CREATED, DbType::Timestamptz),
            system_tag(MODIFIED, DbType::Timestamptz),
            TagDef::new(VIEW, DbType::Text)
                .unique()
                .with_policies(PolicyName::Anonymous, PolicyName::Subject)
                .with_owner("system"),
            TagDef::new(VIEW_TAGS, DbType::Text)
                .multivalue()
                .with_tagref(TagRef::soft(TAGDEF))
                .with_policies(PolicyName::Anonymous, PolicyName::SubjectOwner)
                .with_owner("system"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_tag_name() {
        assert!(validate_tag_name("name").is_ok());
        assert!(validate_tag_name("tagdef-dbtype").is_ok());
        assert!(validate_tag_name("a1_b.c").is_ok());
        assert!(validate_tag_name("").is_err());
        assert!(validate_tag_name("1name").is_err());
        assert!(validate_tag_name("has space").is_err());
        assert!(validate_tag_name("semi;colon").is_err());
        assert!(validate_tag_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_empty_tag_constraints() {
        assert!(TagDef::new("flag", DbType::Empty).validate().is_ok());
        assert!(TagDef::new("flag", DbType::Empty).unique().validate().is_err());
        assert!(
            TagDef::new("flag", DbType::Empty)
                .multivalue()
                .validate()
                .is_err()
        );
        assert!(
            TagDef::new("flag", DbType::Empty)
                .with_tagref(TagRef::hard("name"))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_tsvector_cannot_be_unique() {
        assert!(
            TagDef::new("doc", DbType::Tsvector)
                .unique()
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_self_reference_rejected() {
        assert!(
            TagDef::new("name", DbType::Text)
                .with_tagref(TagRef::hard("name"))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_bootstrap_tagdefs_are_valid() {
        let defs = reserved::bootstrap_tagdefs();
        assert_eq!(defs.len(), reserved::NAMES.len());
        for def in &defs {
            def.validate().expect("bootstrap tagdef must validate");
            assert!(def.is_reserved());
        }
    }
}
