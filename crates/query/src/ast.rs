//! Abstract syntax of the path query language.

use crate::parse::encode_payload;
use std::fmt;

/// Comparison operator of a predicate.
///
/// A predicate with no operator at all means "tag is present, value
/// unconstrained"; that case is `Predicate::op == None`, not a variant here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PredicateOp {
    /// Tag is absent from the subject.
    Absent,
    Equal,
    NotEqual,
    Lt,
    Leq,
    Gt,
    Geq,
    /// SQL LIKE pattern match.
    Like,
    /// Case-sensitive regular expression match.
    Regexp,
    NotRegexp,
    /// Case-insensitive regular expression match.
    CiRegexp,
    NotCiRegexp,
    /// Free-text word match.
    Word,
    /// Negated free-text word match.
    NotWord,
}

impl PredicateOp {
    /// The surface token for this operator.
    pub fn token(&self) -> &'static str {
        match self {
            Self::Absent => ":absent:",
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Lt => ":lt:",
            Self::Leq => ":leq:",
            Self::Gt => ":gt:",
            Self::Geq => ":geq:",
            Self::Like => ":like:",
            Self::Regexp => ":regexp:",
            Self::NotRegexp => ":!regexp:",
            Self::CiRegexp => ":ciregexp:",
            Self::NotCiRegexp => ":!ciregexp:",
            Self::Word => ":word:",
            Self::NotWord => ":!word:",
        }
    }

    /// Whether this operator takes a value list.
    pub fn takes_values(&self) -> bool {
        !matches!(self, Self::Absent)
    }

    /// Whether the operand is matched as a pattern against the value's text
    /// form rather than parsed as a typed value.
    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            Self::Like
                | Self::Regexp
                | Self::NotRegexp
                | Self::CiRegexp
                | Self::NotCiRegexp
                | Self::Word
                | Self::NotWord
        )
    }

    /// Whether this is a free-text search operator.
    pub fn is_word(&self) -> bool {
        matches!(self, Self::Word | Self::NotWord)
    }

    /// Whether the operand must be parsed as a value of the tag's dbtype.
    pub fn is_typed(&self) -> bool {
        matches!(
            self,
            Self::Equal | Self::NotEqual | Self::Lt | Self::Leq | Self::Gt | Self::Geq
        )
    }

    /// Whether this operator requires an ordered dbtype.
    pub fn requires_order(&self) -> bool {
        matches!(self, Self::Lt | Self::Leq | Self::Gt | Self::Geq)
    }
}

impl fmt::Display for PredicateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// One predicate operand: a literal payload string or a nested sub-query.
#[derive(Clone, Debug, PartialEq)]
pub enum PredValue {
    /// Percent-decoded literal; typed against the tag's dbtype at compile
    /// time.
    Literal(String),
    /// `@(...)` set-membership against the values produced by a nested query.
    Subquery(Path),
}

impl fmt::Display for PredValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(s) => f.write_str(&encode_payload(s)),
            Self::Subquery(path) => write!(f, "@({path})"),
        }
    }
}

/// One constraint over a tag: (tag, operator-or-none, values).
#[derive(Clone, Debug, PartialEq)]
pub struct Predicate {
    pub tag: String,
    pub op: Option<PredicateOp>,
    pub values: Vec<PredValue>,
}

impl Predicate {
    /// A bare presence predicate.
    pub fn present(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            op: None,
            values: Vec::new(),
        }
    }

    /// An absence predicate.
    pub fn absent(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            op: Some(PredicateOp::Absent),
            values: Vec::new(),
        }
    }

    /// An equality predicate over literal values.
    pub fn equals(tag: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            tag: tag.into(),
            op: Some(PredicateOp::Equal),
            values: values.into_iter().map(PredValue::Literal).collect(),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_payload(&self.tag))?;
        if let Some(op) = self.op {
            f.write_str(op.token())?;
            for (i, v) in self.values.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{v}")?;
            }
        }
        Ok(())
    }
}

/// Sort direction of an order tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn token(&self) -> &'static str {
        match self {
            Self::Asc => ":asc:",
            Self::Desc => ":desc:",
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// An ordering directive on a projected tag.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderTag {
    pub tag: String,
    pub dir: Direction,
}

impl fmt::Display for OrderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", encode_payload(&self.tag), self.dir.token())
    }
}

/// One path element: subject predicates, projection (list) predicates, and
/// order tags.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PathElem {
    /// Constraints selecting the element's subjects.
    pub subjpreds: Vec<Predicate>,
    /// Tags projected for each selected subject.
    pub listpreds: Vec<Predicate>,
    /// Ordering over the projected tags.
    pub ordertags: Vec<OrderTag>,
}

impl PathElem {
    /// Tags named by the subject predicates, deduplicated in first-seen order.
    pub fn subject_tags(&self) -> Vec<&str> {
        dedup_tags(&self.subjpreds)
    }

    /// Tags named by the list predicates, deduplicated in first-seen order.
    pub fn list_tags(&self) -> Vec<&str> {
        dedup_tags(&self.listpreds)
    }
}

fn dedup_tags(preds: &[Predicate]) -> Vec<&str> {
    let mut seen = Vec::new();
    for p in preds {
        if !seen.contains(&p.tag.as_str()) {
            seen.push(p.tag.as_str());
        }
    }
    seen
}

impl fmt::Display for PathElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, p) in self.subjpreds.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{p}")?;
        }
        if !self.listpreds.is_empty() || !self.ordertags.is_empty() {
            f.write_str("(")?;
            for (i, p) in self.listpreds.iter().enumerate() {
                if i > 0 {
                    f.write_str(";")?;
                }
                write!(f, "{p}")?;
            }
            f.write_str(")")?;
            for (i, o) in self.ordertags.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{o}")?;
            }
        }
        Ok(())
    }
}

/// An ordered sequence of path elements; element *i*'s result set constrains
/// element *i+1* through the bridging tag.
#[derive(Clone, Debug, PartialEq)]
pub struct Path {
    pub elems: Vec<PathElem>,
}

impl Path {
    pub fn single(elem: PathElem) -> Self {
        Self { elems: vec![elem] }
    }

    /// The final element, whose projection shapes the result.
    pub fn last(&self) -> &PathElem {
        self.elems.last().expect("path is never empty")
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.elems.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}
