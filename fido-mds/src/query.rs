//! This implements a query language over metadata entries. This is loosely
//! based on the SCIM query language.
//!
//! `aaguid eq abcd or (aaid eq 4e4e#4005 and not (status eq revoked))`
//!
//! Attributes are `aaguid`, `aaid`, `aki` (an attestation certificate key
//! identifier) and `status` (the latest status of the entry).

use crate::mds::{AuthenticatorStatus, MetadataEntry};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AttrValueAssertion {
    Aaguid(Uuid),
    Aaid(String),
    Aki(String),
    Status(AuthenticatorStatus),
}

impl AttrValueAssertion {
    fn holds(&self, entry: &MetadataEntry) -> bool {
        match self {
            AttrValueAssertion::Aaguid(u) => entry.matches_aaguid(u),
            AttrValueAssertion::Aaid(a) => entry.matches_aaid(a),
            AttrValueAssertion::Aki(k) => entry.matches_attestation_certificate_key_identifier(k),
            AttrValueAssertion::Status(s) => entry.latest_status() == Some(*s),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Query {
    Op(AttrValueAssertion, CompareOp),
    And(Box<Query>, Box<Query>),
    Or(Box<Query>, Box<Query>),
    Not(Box<Query>),
}

impl Query {
    pub fn matches(&self, entry: &MetadataEntry) -> bool {
        match self {
            Query::Op(ava, CompareOp::Equal) => ava.holds(entry),
            Query::Op(ava, CompareOp::NotEqual) => !ava.holds(entry),
            Query::And(a, b) => a.matches(entry) && b.matches(entry),
            Query::Or(a, b) => a.matches(entry) || b.matches(entry),
            Query::Not(q) => !q.matches(entry),
        }
    }
}

impl FromStr for Query {
    type Err = peg::error::ParseError<peg::str::LineCol>;

    fn from_str(q: &str) -> Result<Self, Self::Err> {
        query::parse(q.trim())
    }
}

peg::parser! {
    grammar query() for str {
        pub rule parse() -> Query = precedence!{
                 a:(@) separator()+ "or" separator()+ b:@ {
                Query::Or(
                    Box::new(a),
                    Box::new(b)
                )
            }
            --
            a:(@) separator()+ "and" separator()+ b:@ {
                Query::And(
                    Box::new(a),
                    Box::new(b)
                )
            }
            --
            "not" separator()+ "(" e:parse() ")" {
                Query::Not(Box::new(e))
            }
            --
            "(" e:parse() ")" { e }
            a:expr() { a }
        }

        rule separator() =
            ['\n' | ' ' | '\t' ]

        rule operator() =
            ['\n' | ' ' | '\t' | '(' | ')' ]

        pub(crate) rule expr() -> Query =
            uuid_expr() / aaid_expr() / aki_expr() / status_expr()

        rule uuid_expr() -> Query =
            "aaguid" separator()+ c:compareop() separator()+ v:uuid() { Query::Op(AttrValueAssertion::Aaguid(v), c) }

        rule aaid_expr() -> Query =
            "aaid" separator()+ c:compareop() separator()+ v:value() { Query::Op(AttrValueAssertion::Aaid(v), c) }

        rule aki_expr() -> Query =
            "aki" separator()+ c:compareop() separator()+ v:value() { Query::Op(AttrValueAssertion::Aki(v), c) }

        rule status_expr() -> Query =
            "status" separator()+ c:compareop() separator()+ v:status() { Query::Op(AttrValueAssertion::Status(v), c) }

        pub(crate) rule compareop() -> CompareOp =
            "eq" { CompareOp::Equal } /
            "ne" { CompareOp::NotEqual }

        pub(crate) rule uuid() -> Uuid =
            s:$((!operator()[_])+) {? Uuid::from_str(s).map_err(|_| "invalid UUID" ) }

        pub(crate) rule status() -> AuthenticatorStatus =
            s:$((!operator()[_])+) {? AuthenticatorStatus::from_str(s).map_err(|_| "invalid status" ) }

        rule value() -> String =
            s:$((!operator()[_])+) { s.to_string() }
    }
}
