//! Typed boolean query builder.
//!
//! A dependency spec such as `Category:Report AND Has owner::Team A;Team B`
//! is parsed into a [`QueryExpr`]: a disjunction of conjunctions of
//! conditions. The expression renders to the store's query syntax:
//!
//! ```text
//! "A AND B"            -> [[A]] [[B]]
//! "A OR B"             -> [[A]] OR [[B]]
//! "A;B;"  (sep = ';')  -> [[A||B]]
//! "Has owner::X"       -> [[Has owner::X]]
//! ```
//!
//! `AND` and `OR` are only operators when they stand alone as whitespace
//! separated words, so an identifier such as `ORDERS` or `BRAND` is never
//! split. Identifiers containing a reserved sequence of the query syntax are
//! rejected rather than rendered ambiguously.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const OPEN: &str = "[[";
const CLOSE: &str = "]]";
const VALUE_OR: &str = "||";
const PROPERTY_SEP: &str = "::";
const OR_KEYWORD: &str = "OR";
const AND_KEYWORD: &str = "AND";

const RESERVED: [&str; 3] = [OPEN, CLOSE, VALUE_OR];

/// Errors raised while building or parsing a query expression
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryBuildError {
    #[error("dependency spec is empty")]
    Empty,

    #[error("empty operand next to AND/OR in {0:?}")]
    EmptyCondition(String),

    #[error("identifier {0:?} contains reserved sequence {1:?}")]
    ReservedSequence(String, &'static str),

    #[error("malformed query at byte {position}: {reason}")]
    Malformed { position: usize, reason: String },
}

fn check_reserved(text: &str) -> Result<(), QueryBuildError> {
    for seq in RESERVED {
        if text.contains(seq) {
            return Err(QueryBuildError::ReservedSequence(text.to_string(), seq));
        }
    }
    Ok(())
}

// ============================================================================
// Condition
// ============================================================================

/// A single `[[...]]` condition.
///
/// Without a property the values are record keys (`[[A||B]]` matches record
/// `A` or record `B`). With a property the condition matches records whose
/// property holds one of the values (`[[Has owner::X||Y]]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Condition {
    property: Option<String>,
    values: Vec<String>,
}

impl Condition {
    pub fn new<I, S>(property: Option<String>, values: I) -> Result<Self, QueryBuildError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values
            .into_iter()
            .map(|v| v.into().trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        if values.is_empty() {
            return Err(QueryBuildError::EmptyCondition(
                property.unwrap_or_default(),
            ));
        }
        let property = match property {
            Some(p) => {
                let p = p.trim().to_string();
                if p.is_empty() {
                    return Err(QueryBuildError::EmptyCondition(values.join(VALUE_OR)));
                }
                check_reserved(&p)?;
                if p.contains(PROPERTY_SEP) {
                    return Err(QueryBuildError::ReservedSequence(p, PROPERTY_SEP));
                }
                Some(p)
            }
            None => None,
        };
        for value in &values {
            check_reserved(value)?;
        }
        Ok(Self { property, values })
    }

    /// Condition matching exactly one record key.
    pub fn record(key: impl Into<String>) -> Result<Self, QueryBuildError> {
        Self::new(None, [key.into()])
    }

    /// Condition matching records whose `property` points at `value`.
    pub fn property(
        property: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, QueryBuildError> {
        Self::new(Some(property.into()), [value.into()])
    }

    pub fn property_name(&self) -> Option<&str> {
        self.property.as_deref()
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Parse the text of one operand, splitting value lists on `separator`.
    fn parse_operand(text: &str, separator: Option<char>) -> Result<Self, QueryBuildError> {
        let (property, rest) = match text.split_once(PROPERTY_SEP) {
            Some((p, rest)) => (Some(p.to_string()), rest),
            None => (None, text),
        };
        match separator {
            Some(sep) => Self::new(property, rest.split(sep)),
            None => Self::new(property, [rest]),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(OPEN)?;
        if let Some(p) = &self.property {
            write!(f, "{}{}", p, PROPERTY_SEP)?;
        }
        f.write_str(&self.values.join(VALUE_OR))?;
        f.write_str(CLOSE)
    }
}

// ============================================================================
// Conjunction / expression
// ============================================================================

/// Conditions that must all hold
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Conjunction {
    conditions: Vec<Condition>,
}

impl Conjunction {
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }
}

impl fmt::Display for Conjunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.conditions.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

/// Disjunction of conjunctions; `OR` binds weaker than `AND`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryExpr {
    disjuncts: Vec<Conjunction>,
}

impl From<Condition> for QueryExpr {
    fn from(condition: Condition) -> Self {
        Self {
            disjuncts: vec![Conjunction {
                conditions: vec![condition],
            }],
        }
    }
}

impl QueryExpr {
    /// Require `condition` in addition to the last conjunction.
    pub fn and(mut self, condition: Condition) -> Self {
        if let Some(last) = self.disjuncts.last_mut() {
            last.conditions.push(condition);
        }
        self
    }

    /// Accept `condition` as an alternative to everything built so far.
    pub fn or(mut self, condition: Condition) -> Self {
        self.disjuncts.push(Conjunction {
            conditions: vec![condition],
        });
        self
    }

    pub fn disjuncts(&self) -> &[Conjunction] {
        &self.disjuncts
    }

    /// Parse a human-authored dependency spec.
    ///
    /// `separator` is the multi-value list separator of the host, if any: a
    /// single trailing separator is dropped and internal separators become
    /// value alternatives of the enclosing condition.
    ///
    /// A dangling operator (`"A AND"`, `"OR B"`) is rejected here with
    /// [`QueryBuildError::EmptyCondition`] instead of being sent to the store;
    /// the resolver records it as a failure of that one value.
    pub fn from_spec(raw: &str, separator: Option<char>) -> Result<Self, QueryBuildError> {
        let mut text = raw.trim();
        if let Some(sep) = separator {
            text = text.strip_suffix(sep).unwrap_or(text).trim_end();
        }
        if text.is_empty() {
            return Err(QueryBuildError::Empty);
        }

        let mut disjuncts = Vec::new();
        let mut conditions = Vec::new();
        let mut words: Vec<&str> = Vec::new();

        let flush = |words: &mut Vec<&str>| -> Result<Condition, QueryBuildError> {
            if words.is_empty() {
                return Err(QueryBuildError::EmptyCondition(raw.to_string()));
            }
            let operand = words.join(" ");
            words.clear();
            Condition::parse_operand(&operand, separator)
        };

        for word in text.split_whitespace() {
            match word {
                AND_KEYWORD => conditions.push(flush(&mut words)?),
                OR_KEYWORD => {
                    conditions.push(flush(&mut words)?);
                    disjuncts.push(Conjunction {
                        conditions: std::mem::take(&mut conditions),
                    });
                }
                _ => words.push(word),
            }
        }
        conditions.push(flush(&mut words)?);
        disjuncts.push(Conjunction { conditions });

        Ok(Self { disjuncts })
    }

    /// Record keys this expression matches when it is a plain disjunction of
    /// bare record conditions (`[[A]] OR [[B]]` and `[[A||B]]` both give
    /// `["A", "B"]`). `None` for anything involving properties or `AND`.
    pub fn record_alternatives(&self) -> Option<Vec<&str>> {
        let mut out = Vec::new();
        for conj in &self.disjuncts {
            match conj.conditions.as_slice() {
                [only] if only.property.is_none() => {
                    out.extend(only.values.iter().map(String::as_str))
                }
                _ => return None,
            }
        }
        Some(out)
    }
}

impl fmt::Display for QueryExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, conj) in self.disjuncts.iter().enumerate() {
            if i > 0 {
                write!(f, " {} ", OR_KEYWORD)?;
            }
            write!(f, "{}", conj)?;
        }
        Ok(())
    }
}

/// Parses the rendered query syntax back into an expression.
impl FromStr for QueryExpr {
    type Err = QueryBuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut disjuncts = Vec::new();
        let mut conditions = Vec::new();
        let mut pos = 0;

        loop {
            let rest = &s[pos..];
            let trimmed = rest.trim_start();
            pos += rest.len() - trimmed.len();
            if trimmed.is_empty() {
                break;
            }

            if let Some(body) = trimmed.strip_prefix(OPEN) {
                let end = body.find(CLOSE).ok_or_else(|| QueryBuildError::Malformed {
                    position: pos,
                    reason: "unterminated condition".into(),
                })?;
                let inner = &body[..end];
                let (property, values) = match inner.split_once(PROPERTY_SEP) {
                    Some((p, v)) => (Some(p.to_string()), v),
                    None => (None, inner),
                };
                conditions.push(Condition::new(property, values.split(VALUE_OR))?);
                pos += OPEN.len() + end + CLOSE.len();
            } else if let Some(after) = trimmed.strip_prefix(OR_KEYWORD) {
                let separated = after.starts_with(char::is_whitespace) || after.starts_with(OPEN);
                if conditions.is_empty() || !separated {
                    return Err(QueryBuildError::Malformed {
                        position: pos,
                        reason: "misplaced OR".into(),
                    });
                }
                disjuncts.push(Conjunction {
                    conditions: std::mem::take(&mut conditions),
                });
                pos += OR_KEYWORD.len();
            } else {
                return Err(QueryBuildError::Malformed {
                    position: pos,
                    reason: "expected [[ or OR".into(),
                });
            }
        }

        if conditions.is_empty() {
            return Err(if disjuncts.is_empty() {
                QueryBuildError::Empty
            } else {
                QueryBuildError::Malformed {
                    position: pos,
                    reason: "trailing OR".into(),
                }
            });
        }
        disjuncts.push(Conjunction { conditions });
        Ok(Self { disjuncts })
    }
}
