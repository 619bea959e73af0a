//! Authorization policy vocabulary and the three-valued evaluator.
//!
//! Every tag declares independent read and write policies drawn from a closed
//! vocabulary. Evaluation is three-valued: `Indeterminate` means the answer
//! depends on information the caller has not supplied yet (the subject row,
//! or the referenced object), and the caller must re-evaluate once it is
//! known or fail closed.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Which access is being evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

/// Outcome of a policy evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Decision {
    Allow,
    Deny,
    /// The answer depends on information not yet available (the subject has
    /// not been fetched, or the policy examines a not-yet-known value).
    Indeterminate,
}

impl Decision {
    /// Three-valued conjunction: Deny dominates, then Indeterminate.
    pub fn and(self, other: Decision) -> Decision {
        match (self, other) {
            (Decision::Deny, _) | (_, Decision::Deny) => Decision::Deny,
            (Decision::Indeterminate, _) | (_, Decision::Indeterminate) => Decision::Indeterminate,
            _ => Decision::Allow,
        }
    }

    /// Three-valued disjunction: Allow dominates, then Indeterminate.
    pub fn or(self, other: Decision) -> Decision {
        match (self, other) {
            (Decision::Allow, _) | (_, Decision::Allow) => Decision::Allow,
            (Decision::Indeterminate, _) | (_, Decision::Indeterminate) => Decision::Indeterminate,
            _ => Decision::Deny,
        }
    }

    pub fn is_allow(self) -> bool {
        self == Decision::Allow
    }

    pub fn is_deny(self) -> bool {
        self == Decision::Deny
    }
}

/// The stored policy vocabulary.
///
/// Each name maps to one fixed combinator tree over the policy atoms; the
/// tree, not the name, is what gets evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyName {
    /// Always permitted.
    Anonymous,
    /// Never permitted except to a superuser.
    System,
    /// Principal is in the subject's ACL or owns the subject.
    Subject,
    /// Principal owns the subject.
    SubjectOwner,
    /// Principal is in the tag's own ACL or owns the tag definition.
    Tag,
    TagOrSubject,
    TagAndSubject,
    TagOrOwner,
    TagAndOwner,
    /// The subject referenced by the tag's value is readable by the principal.
    Object,
    /// Principal owns the subject referenced by the tag's value.
    ObjectOwner,
}

impl PolicyName {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "anonymous" => Ok(Self::Anonymous),
            "system" => Ok(Self::System),
            "subject" => Ok(Self::Subject),
            "subjectowner" => Ok(Self::SubjectOwner),
            "tag" => Ok(Self::Tag),
            "tagorsubject" => Ok(Self::TagOrSubject),
            "tagandsubject" => Ok(Self::TagAndSubject),
            "tagorowner" => Ok(Self::TagOrOwner),
            "tagandowner" => Ok(Self::TagAndOwner),
            "object" => Ok(Self::Object),
            "objectowner" => Ok(Self::ObjectOwner),
            _ => Err(Error::UnknownPolicy(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::System => "system",
            Self::Subject => "subject",
            Self::SubjectOwner => "subjectowner",
            Self::Tag => "tag",
            Self::TagOrSubject => "tagorsubject",
            Self::TagAndSubject => "tagandsubject",
            Self::TagOrOwner => "tagorowner",
            Self::TagAndOwner => "tagandowner",
            Self::Object => "object",
            Self::ObjectOwner => "objectowner",
        }
    }

    /// Expand into the combinator tree this name denotes.
    pub fn policy(&self) -> Policy {
        match self {
            Self::Anonymous => Policy::Anonymous,
            Self::System => Policy::System,
            Self::Subject => Policy::Subject,
            Self::SubjectOwner => Policy::SubjectOwner,
            Self::Tag => Policy::TagAcl,
            Self::TagOrSubject => Policy::or(Policy::TagAcl, Policy::Subject),
            Self::TagAndSubject => Policy::and(Policy::TagAcl, Policy::Subject),
            Self::TagOrOwner => Policy::or(Policy::TagAcl, Policy::SubjectOwner),
            Self::TagAndOwner => Policy::and(Policy::TagAcl, Policy::SubjectOwner),
            Self::Object => Policy::Object,
            Self::ObjectOwner => Policy::ObjectOwner,
        }
    }

    /// Whether evaluation may need the referenced object resolved.
    pub fn examines_object(&self) -> bool {
        matches!(self, Self::Object | Self::ObjectOwner)
    }
}

impl fmt::Display for PolicyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A policy as a closed tree of atoms and AND/OR combinators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Policy {
    Anonymous,
    System,
    TagAcl,
    Subject,
    SubjectOwner,
    Object,
    ObjectOwner,
    And(Box<Policy>, Box<Policy>),
    Or(Box<Policy>, Box<Policy>),
}

impl Policy {
    pub fn and(a: Policy, b: Policy) -> Policy {
        Policy::And(Box::new(a), Box::new(b))
    }

    pub fn or(a: Policy, b: Policy) -> Policy {
        Policy::Or(Box::new(a), Box::new(b))
    }

    fn eval(&self, ctx: &PrincipalContext, inputs: &PolicyInputs<'_>) -> Decision {
        match self {
            Policy::Anonymous => Decision::Allow,
            Policy::System => Decision::Deny,
            Policy::TagAcl => {
                if ctx.owns(inputs.tag_owner) || ctx.holds_any(inputs.tag_acl) {
                    Decision::Allow
                } else {
                    Decision::Deny
                }
            }
            Policy::Subject => match inputs.subject {
                None => Decision::Indeterminate,
                Some(s) => {
                    if ctx.owns(s.owner.as_deref()) || ctx.holds_any(&s.acl) {
                        Decision::Allow
                    } else {
                        Decision::Deny
                    }
                }
            },
            Policy::SubjectOwner => match inputs.subject {
                None => Decision::Indeterminate,
                Some(s) => {
                    if ctx.owns(s.owner.as_deref()) {
                        Decision::Allow
                    } else {
                        Decision::Deny
                    }
                }
            },
            Policy::Object => inputs.object_readable.unwrap_or(Decision::Indeterminate),
            Policy::ObjectOwner => match inputs.object {
                None => Decision::Indeterminate,
                Some(o) => {
                    if ctx.owns(o.owner.as_deref()) {
                        Decision::Allow
                    } else {
                        Decision::Deny
                    }
                }
            },
            Policy::And(a, b) => a.eval(ctx, inputs).and(b.eval(ctx, inputs)),
            Policy::Or(a, b) => a.eval(ctx, inputs).or(b.eval(ctx, inputs)),
        }
    }
}

/// Identity and held attributes of the acting principal.
#[derive(Clone, Debug, Default)]
pub struct PrincipalContext {
    /// Authenticated principal name, or `None` for anonymous requests.
    pub principal: Option<String>,
    /// Attributes/roles held by the principal, including its own name.
    pub attributes: HashSet<String>,
    /// Superuser bypasses every policy check.
    pub superuser: bool,
}

impl PrincipalContext {
    /// An unauthenticated request.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// An authenticated principal with the given attributes.
    pub fn authenticated(principal: impl Into<String>, attributes: Vec<String>) -> Self {
        let principal = principal.into();
        let mut attrs: HashSet<String> = attributes.into_iter().collect();
        attrs.insert(principal.clone());
        Self {
            principal: Some(principal),
            attributes: attrs,
            superuser: false,
        }
    }

    /// The catalog acting on its own behalf (bootstrap, internal maintenance).
    pub fn system() -> Self {
        Self {
            principal: Some("system".to_string()),
            attributes: HashSet::from(["system".to_string()]),
            superuser: true,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.principal.is_none()
    }

    fn owns(&self, owner: Option<&str>) -> bool {
        match (self.principal.as_deref(), owner) {
            (Some(p), Some(o)) => p == o,
            _ => false,
        }
    }

    fn holds_any(&self, attrs: &[String]) -> bool {
        attrs.iter().any(|a| self.attributes.contains(a))
    }
}

/// Per-subject access inputs: the subject's owner and the ACL relevant to the
/// mode being evaluated (readers for Read, writers for Write).
#[derive(Clone, Debug, Default)]
pub struct SubjectAccess {
    pub owner: Option<String>,
    pub acl: Vec<String>,
}

/// Everything a policy tree may examine.
///
/// Fields left unset make the corresponding atoms evaluate `Indeterminate`,
/// which is how the static `readok`/`writeok` pre-resolution works: evaluate
/// once with only the tag-level inputs, and cache the result.
#[derive(Clone, Debug, Default)]
pub struct PolicyInputs<'a> {
    /// Owner of the tag definition.
    pub tag_owner: Option<&'a str>,
    /// The tag's own ACL for the mode being evaluated.
    pub tag_acl: &'a [String],
    /// The subject's owner and mode-relevant ACL, when fetched.
    pub subject: Option<&'a SubjectAccess>,
    /// The referenced object's owner and ACL, when resolved.
    pub object: Option<&'a SubjectAccess>,
    /// Recursively evaluated readability of the referenced object.
    pub object_readable: Option<Decision>,
}

impl<'a> PolicyInputs<'a> {
    /// Inputs known without fetching any subject: the static case.
    pub fn static_only(tag_owner: Option<&'a str>, tag_acl: &'a [String]) -> Self {
        Self {
            tag_owner,
            tag_acl,
            ..Default::default()
        }
    }
}

/// Evaluate a policy for a principal.
///
/// This is the single authoritative place the superuser bypass lives; no
/// other component may short-circuit a policy check.
pub fn evaluate(
    _mode: AccessMode,
    policy: PolicyName,
    ctx: &PrincipalContext,
    inputs: &PolicyInputs<'_>,
) -> Decision {
    if ctx.superuser {
        return Decision::Allow;
    }
    policy.policy().eval(ctx, inputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> PrincipalContext {
        PrincipalContext::authenticated("alice", vec!["staff".to_string()])
    }

    fn subj(owner: &str, acl: &[&str]) -> SubjectAccess {
        SubjectAccess {
            owner: Some(owner.to_string()),
            acl: acl.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_three_valued_and_or() {
        use Decision::*;
        assert_eq!(Allow.and(Allow), Allow);
        assert_eq!(Allow.and(Deny), Deny);
        assert_eq!(Indeterminate.and(Deny), Deny);
        assert_eq!(Allow.and(Indeterminate), Indeterminate);
        assert_eq!(Deny.or(Allow), Allow);
        assert_eq!(Indeterminate.or(Allow), Allow);
        assert_eq!(Deny.or(Indeterminate), Indeterminate);
        assert_eq!(Deny.or(Deny), Deny);
    }

    #[test]
    fn test_anonymous_policy_always_allows() {
        let d = evaluate(
            AccessMode::Read,
            PolicyName::Anonymous,
            &PrincipalContext::anonymous(),
            &PolicyInputs::default(),
        );
        assert_eq!(d, Decision::Allow);
    }

    #[test]
    fn test_system_denies_everyone_but_superuser() {
        let d = evaluate(
            AccessMode::Write,
            PolicyName::System,
            &alice(),
            &PolicyInputs::default(),
        );
        assert_eq!(d, Decision::Deny);

        let d = evaluate(
            AccessMode::Write,
            PolicyName::System,
            &PrincipalContext::system(),
            &PolicyInputs::default(),
        );
        assert_eq!(d, Decision::Allow);
    }

    #[test]
    fn test_subject_policy_indeterminate_without_subject() {
        let d = evaluate(
            AccessMode::Read,
            PolicyName::Subject,
            &alice(),
            &PolicyInputs::default(),
        );
        assert_eq!(d, Decision::Indeterminate);
    }

    #[test]
    fn test_subject_policy_resolves_with_subject() {
        let s = subj("bob", &["staff"]);
        let inputs = PolicyInputs {
            subject: Some(&s),
            ..Default::default()
        };
        assert_eq!(
            evaluate(AccessMode::Read, PolicyName::Subject, &alice(), &inputs),
            Decision::Allow
        );

        let s = subj("bob", &["admins"]);
        let inputs = PolicyInputs {
            subject: Some(&s),
            ..Default::default()
        };
        assert_eq!(
            evaluate(AccessMode::Read, PolicyName::Subject, &alice(), &inputs),
            Decision::Deny
        );
    }

    #[test]
    fn test_subjectowner_requires_exact_owner() {
        let s = subj("alice", &[]);
        let inputs = PolicyInputs {
            subject: Some(&s),
            ..Default::default()
        };
        assert_eq!(
            evaluate(AccessMode::Write, PolicyName::SubjectOwner, &alice(), &inputs),
            Decision::Allow
        );

        let s = subj("bob", &[]);
        let inputs = PolicyInputs {
            subject: Some(&s),
            ..Default::default()
        };
        assert_eq!(
            evaluate(AccessMode::Write, PolicyName::SubjectOwner, &alice(), &inputs),
            Decision::Deny
        );
    }

    #[test]
    fn test_tag_acl_is_static() {
        let acl = vec!["staff".to_string()];
        let inputs = PolicyInputs::static_only(Some("bob"), &acl);
        assert_eq!(
            evaluate(AccessMode::Read, PolicyName::Tag, &alice(), &inputs),
            Decision::Allow
        );

        let acl = vec!["admins".to_string()];
        let inputs = PolicyInputs::static_only(Some("bob"), &acl);
        assert_eq!(
            evaluate(AccessMode::Read, PolicyName::Tag, &alice(), &inputs),
            Decision::Deny
        );
    }

    #[test]
    fn test_tagorsubject_static_deny_becomes_indeterminate() {
        // Tag atom denies, subject atom can't resolve yet: the OR must stay
        // open rather than denying outright.
        let inputs = PolicyInputs::static_only(None, &[]);
        assert_eq!(
            evaluate(AccessMode::Read, PolicyName::TagOrSubject, &alice(), &inputs),
            Decision::Indeterminate
        );
    }

    #[test]
    fn test_tagandsubject_static_deny_short_circuits() {
        let inputs = PolicyInputs::static_only(None, &[]);
        assert_eq!(
            evaluate(AccessMode::Read, PolicyName::TagAndSubject, &alice(), &inputs),
            Decision::Deny
        );
    }

    #[test]
    fn test_object_policy_uses_resolved_readability() {
        let inputs = PolicyInputs {
            object_readable: Some(Decision::Allow),
            ..Default::default()
        };
        assert_eq!(
            evaluate(AccessMode::Read, PolicyName::Object, &alice(), &inputs),
            Decision::Allow
        );
        assert_eq!(
            evaluate(AccessMode::Read, PolicyName::Object, &alice(), &PolicyInputs::default()),
            Decision::Indeterminate
        );
    }

    #[test]
    fn test_monotonicity_in_attributes() {
        // Adding attributes never turns Allow into Deny.
        let s = subj("bob", &["staff"]);
        let inputs = PolicyInputs {
            subject: Some(&s),
            ..Default::default()
        };
        let fewer = PrincipalContext::authenticated("carol", vec!["staff".to_string()]);
        let more = PrincipalContext::authenticated(
            "carol",
            vec!["staff".to_string(), "admins".to_string()],
        );
        for name in [
            PolicyName::Subject,
            PolicyName::TagOrSubject,
            PolicyName::TagAndSubject,
        ] {
            let d_fewer = evaluate(AccessMode::Read, name, &fewer, &inputs);
            let d_more = evaluate(AccessMode::Read, name, &more, &inputs);
            if d_fewer == Decision::Allow {
                assert_eq!(d_more, Decision::Allow);
            }
        }
    }

    #[test]
    fn test_policy_name_round_trip() {
        for name in [
            "anonymous",
            "system",
            "subject",
            "subjectowner",
            "tag",
            "tagorsubject",
            "tagandsubject",
            "tagorowner",
            "tagandowner",
            "object",
            "objectowner",
        ] {
            assert_eq!(PolicyName::parse(name).unwrap().as_str(), name);
        }
        assert!(PolicyName::parse("everyone").is_err());
    }
}
