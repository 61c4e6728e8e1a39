//! Query construction and filter dialect translation
//!
//! A [`QuerySpec`] captures one logical query in a single vocabulary. The
//! two supported index services speak incompatible filter dialects, so each
//! [`FilterClause`] is compiled per endpoint kind: pywb-style servers accept
//! the full six-way modifier set as literal prefix characters, wayback-style
//! servers accept only the regex forms and use different wire names for some
//! fields. Both mappings are data tables so a new endpoint kind is additive.

use crate::catalog::EndpointKind;
use crate::timeutil::validate_timestamp;
use crate::{CdxError, Result};

/// Default limit applied to one-shot `get` queries, preventing accidental
/// unbounded fetches.
pub const DEFAULT_GET_LIMIT: u64 = 1000;

/// Safety cap applied to `iter` queries when the caller sets no limit.
pub const DEFAULT_ITER_LIMIT: u64 = 100_000;

/// Canonical (pywb) field name → wayback wire name.
///
/// Normalization of returned rows uses the same table in reverse.
pub const FIELDS_TO_WAYBACK: &[(&str, &str)] = &[
    ("status", "statuscode"),
    ("url", "original"),
    ("mime", "mimetype"),
];

/// How the url pattern matches against the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchType {
    #[default]
    Exact,
    Prefix,
    Domain,
}

impl MatchType {
    pub fn as_wire(self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Prefix => "prefix",
            MatchType::Domain => "domain",
        }
    }
}

/// The closed set of filter modifiers.
///
/// The full six-way set only has meaning on pywb-style endpoints; wayback
/// supports the two regex forms and rejects the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterModifier {
    Substring,
    Exact,
    Regex,
    NotSubstring,
    NotExact,
    NotRegex,
}

impl FilterModifier {
    /// The pywb literal prefix for this modifier.
    pub fn pywb_prefix(self) -> &'static str {
        match self {
            FilterModifier::Regex => "",
            FilterModifier::NotRegex => "!",
            FilterModifier::Exact => "=",
            FilterModifier::NotExact => "!=",
            FilterModifier::Substring => "~",
            FilterModifier::NotSubstring => "!~",
        }
    }
}

/// One logical AND-combined predicate over a capture field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterClause {
    pub modifier: FilterModifier,
    pub field: String,
    pub expr: String,
}

impl FilterClause {
    /// Parses the CLI/API filter syntax: an optional modifier prefix
    /// (`=`, `~`, `!`, `!=`, `!~`), a field name, `:`, and an expression.
    pub fn parse(raw: &str) -> Result<FilterClause> {
        let (modifier, rest) = if let Some(rest) = raw.strip_prefix("!=") {
            (FilterModifier::NotExact, rest)
        } else if let Some(rest) = raw.strip_prefix("!~") {
            (FilterModifier::NotSubstring, rest)
        } else if let Some(rest) = raw.strip_prefix('!') {
            (FilterModifier::NotRegex, rest)
        } else if let Some(rest) = raw.strip_prefix('=') {
            (FilterModifier::Exact, rest)
        } else if let Some(rest) = raw.strip_prefix('~') {
            (FilterModifier::Substring, rest)
        } else {
            (FilterModifier::Regex, raw)
        };

        let (field, expr) = rest.split_once(':').ok_or_else(|| {
            CdxError::Usage(format!("filter {:?} needs the form [modifier]field:expression", raw))
        })?;
        if field.is_empty() {
            return Err(CdxError::Usage(format!("filter {:?} has an empty field name", raw)));
        }

        Ok(FilterClause {
            modifier,
            field: field.to_string(),
            expr: expr.to_string(),
        })
    }

    /// Compiles this clause into the query-string fragment the given
    /// endpoint kind understands. Pure: same clause + same kind always
    /// yields the same fragment.
    pub fn compile(&self, kind: EndpointKind) -> Result<String> {
        let prefix = match kind {
            EndpointKind::Pywb => self.modifier.pywb_prefix(),
            EndpointKind::Wayback => match self.modifier {
                FilterModifier::Regex => "",
                FilterModifier::NotRegex => "!",
                other => {
                    return Err(CdxError::Usage(format!(
                        "the wayback-style endpoint does not support the {:?} filter modifier, \
                         only regex and not-regex",
                        other
                    )))
                }
            },
        };
        Ok(format!("{}{}:{}", prefix, rename_field(&self.field, kind), self.expr))
    }
}

/// Renames a canonical field to its wire name for the given endpoint kind.
fn rename_field(field: &str, kind: EndpointKind) -> String {
    match kind {
        EndpointKind::Pywb => field.to_string(),
        EndpointKind::Wayback => FIELDS_TO_WAYBACK
            .iter()
            .find(|(canonical, _)| *canonical == field)
            .map(|(_, wire)| wire.to_string())
            .unwrap_or_else(|| field.to_string()),
    }
}

/// Whether records stream shard-newest-first (`mixed`) or oldest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrawlOrder {
    #[default]
    Mixed,
    Ascending,
}

/// One logical query against the virtual index.
///
/// Owned by the call that created it and never mutated after construction.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub url: String,
    pub match_type: Option<MatchType>,
    /// Inclusive lower time bound, any digit prefix of a 14-digit timestamp
    pub from_ts: Option<String>,
    /// Inclusive upper time bound
    pub to: Option<String>,
    /// Request distance-sorted results around this timestamp
    pub closest: Option<String>,
    /// Hard ceiling on records yielded, enforced client-side
    pub limit: Option<u64>,
    pub filters: Vec<FilterClause>,
}

impl QuerySpec {
    pub fn new(url: &str) -> QuerySpec {
        QuerySpec {
            url: url.to_string(),
            ..QuerySpec::default()
        }
    }

    /// Checks the time bounds are plausible digit strings.
    pub fn validate(&self) -> Result<()> {
        for ts in [&self.from_ts, &self.to, &self.closest].into_iter().flatten() {
            validate_timestamp(ts)?;
        }
        Ok(())
    }

    /// The effective limit for the given mode; `get` defaults lower than
    /// `iter`, and both are capped.
    pub fn effective_limit(&self, get_mode: bool) -> u64 {
        let default = if get_mode { DEFAULT_GET_LIMIT } else { DEFAULT_ITER_LIMIT };
        self.limit.unwrap_or(default).min(DEFAULT_ITER_LIMIT)
    }

    /// Builds the common query parameters for one endpoint, compiling each
    /// filter clause into that endpoint's dialect. Paging parameters are
    /// appended by the page fetcher.
    pub fn to_params(&self, kind: EndpointKind) -> Result<Vec<(String, String)>> {
        self.validate()?;
        let mut params = vec![
            ("url".to_string(), self.url.clone()),
            ("output".to_string(), "json".to_string()),
        ];
        if let Some(mt) = self.match_type {
            params.push(("matchType".to_string(), mt.as_wire().to_string()));
        }
        if let Some(from) = &self.from_ts {
            params.push(("from".to_string(), from.clone()));
        }
        if let Some(to) = &self.to {
            params.push(("to".to_string(), to.clone()));
        }
        if let Some(closest) = &self.closest {
            // Only wayback sorts by distance natively; pywb results get
            // re-sorted client-side after fetching.
            if kind == EndpointKind::Wayback {
                params.push(("closest".to_string(), closest.clone()));
                params.push(("sort".to_string(), "closest".to_string()));
            }
        }
        for clause in &self.filters {
            params.push(("filter".to_string(), clause.compile(kind)?));
        }
        Ok(params)
    }
}
