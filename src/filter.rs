//! Selection predicates over service properties.
//!
//! Filters use the LDAP-style syntax common to service registries:
//! `(key=value)`, `(key=*)`, `(&(..)(..))`, `(|(..)(..))` and `(!(..))`.
//! The characters `(`, `)`, `*` and `\` are escaped with a backslash inside
//! values.

use std::fmt;
use std::str::FromStr;

use nom::{
    branch::alt,
    bytes::complete::{is_not, take_while1},
    character::complete::{anychar, char, multispace0},
    combinator::{all_consuming, map, peek, recognize, verify},
    multi::{fold_many0, many1},
    sequence::{delimited, pair, preceded, terminated},
    Finish, IResult,
};

use crate::error::{FilterError, FilterResult};
use crate::properties::{
    Properties, DATA_SOURCE, JNDI_SERVICE_NAME, OBJECT_CLASS, PERSISTENCE_PROVIDER,
    PERSISTENCE_PROVIDER_NAME,
};
use crate::unit::PersistenceUnit;

/// JNDI prefix used by persistence units that reference a data source service.
const DATA_SOURCE_PREFIX: &str = "osgi:service/javax.sql.DataSource";

/// A boolean selection rule over service properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// The property equals the value, or contains it for multi-valued properties.
    Equals { key: String, value: String },
    /// The property is set.
    Present(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Matches services whose `key` property equals `value`.
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Matches services that set `key`.
    pub fn present(key: impl Into<String>) -> Self {
        Filter::Present(key.into())
    }

    /// Matches services published under the given capability.
    pub fn capability(name: impl Into<String>) -> Self {
        Filter::equals(OBJECT_CLASS, name)
    }

    /// Conjunction of this filter and `other`, flattening nested conjunctions.
    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut parts) => {
                parts.push(other);
                Filter::And(parts)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    /// Disjunction of this filter and `other`, flattening nested disjunctions.
    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut parts) => {
                parts.push(other);
                Filter::Or(parts)
            }
            first => Filter::Or(vec![first, other]),
        }
    }

    /// Matches services this filter rejects.
    pub fn negate(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Evaluate the filter against a property map.
    pub fn matches(&self, properties: &Properties) -> bool {
        match self {
            Filter::Equals { key, value } => properties
                .get(key)
                .map(|actual| actual.matches(value))
                .unwrap_or(false),
            Filter::Present(key) => properties.contains(key),
            Filter::And(parts) => parts.iter().all(|p| p.matches(properties)),
            Filter::Or(parts) => parts.iter().any(|p| p.matches(properties)),
            Filter::Not(inner) => !inner.matches(properties),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Equals { key, value } => write!(f, "({}={})", key, escape(value)),
            Filter::Present(key) => write!(f, "({}=*)", key),
            Filter::And(parts) => {
                f.write_str("(&")?;
                for part in parts {
                    write!(f, "{}", part)?;
                }
                f.write_str(")")
            }
            Filter::Or(parts) => {
                f.write_str("(|")?;
                for part in parts {
                    write!(f, "{}", part)?;
                }
                f.write_str(")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
        }
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> FilterResult<Self> {
        match all_consuming(terminated(filter_expr, multispace0))(s).finish() {
            Ok((_, filter)) => Ok(filter),
            Err(err) => Err(FilterError::InvalidSyntax {
                filter: s.to_string(),
                position: s.len() - err.input.len(),
                reason: err.code.description().to_string(),
            }),
        }
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '(' | ')' | '*' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// =============================================================================
// Parsing
// =============================================================================

/// `( filtercomp )`, with optional whitespace around the parentheses.
fn filter_expr(input: &str) -> IResult<&str, Filter> {
    delimited(
        pair(multispace0, char('(')),
        alt((and_list, or_list, not_filter, item)),
        pair(multispace0, char(')')),
    )(input)
}

fn and_list(input: &str) -> IResult<&str, Filter> {
    map(preceded(char('&'), many1(filter_expr)), Filter::And)(input)
}

fn or_list(input: &str) -> IResult<&str, Filter> {
    map(preceded(char('|'), many1(filter_expr)), Filter::Or)(input)
}

fn not_filter(input: &str) -> IResult<&str, Filter> {
    map(preceded(char('!'), filter_expr), Filter::negate)(input)
}

/// `key=value` or `key=*`. Ordering operators and substrings are rejected.
fn item(input: &str) -> IResult<&str, Filter> {
    let (input, key) = terminated(attribute, char('='))(input)?;
    let result = alt((
        map(
            delimited(multispace0, char('*'), peek(preceded(multispace0, char(')')))),
            |_| Filter::present(key),
        ),
        map(value_text, |value| Filter::equals(key, value)),
    ))(input);
    result
}

fn attribute(input: &str) -> IResult<&str, &str> {
    verify(
        map(
            take_while1(|c: char| !matches!(c, '=' | '(' | ')' | '<' | '>' | '~' | '*' | '\\')),
            str::trim,
        ),
        |key: &str| !key.is_empty(),
    )(input)
}

/// Value characters up to the closing parenthesis, with `\x` unescaped to `x`.
fn value_text(input: &str) -> IResult<&str, String> {
    fold_many0(
        alt((is_not("\\()*"), preceded(char('\\'), recognize(anychar)))),
        String::new,
        |mut value, part| {
            value.push_str(part);
            value
        },
    )(input)
}

/// Build the predicate selecting persistence providers for a unit.
///
/// A unit that pins a provider implementation only matches providers
/// advertising exactly that name; otherwise any persistence provider matches.
pub fn provider_filter(unit: &PersistenceUnit) -> Filter {
    let capability = Filter::capability(PERSISTENCE_PROVIDER);
    match unit.provider_class_name() {
        Some(name) => capability.and(Filter::equals(PERSISTENCE_PROVIDER_NAME, name)),
        None => capability,
    }
}

/// Build the predicate selecting the data source a unit refers to.
///
/// `reference` is either a bare JNDI service name or an
/// `osgi:service/javax.sql.DataSource/<filter>` lookup.
pub fn data_source_filter(reference: &str, unit_name: &str) -> FilterResult<Filter> {
    let reference = reference.trim();
    let invalid = || FilterError::InvalidDataSource {
        reference: reference.to_string(),
        unit: unit_name.to_string(),
    };
    if reference.is_empty() {
        return Err(invalid());
    }

    let sub_filter = match reference.strip_prefix(DATA_SOURCE_PREFIX) {
        Some(rest) => match rest.strip_prefix('/') {
            Some(lookup) if !lookup.is_empty() => lookup.parse::<Filter>()?,
            _ if rest.is_empty() || rest == "/" => Filter::present(JNDI_SERVICE_NAME),
            _ => return Err(invalid()),
        },
        None => Filter::equals(JNDI_SERVICE_NAME, reference),
    };

    Ok(Filter::capability(DATA_SOURCE).and(sub_filter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::PropertyValue;
    use crate::unit::Module;

    fn provider_props(name: &str) -> Properties {
        Properties::new()
            .with(
                OBJECT_CLASS,
                PropertyValue::List(vec![PERSISTENCE_PROVIDER.to_string()]),
            )
            .with(PERSISTENCE_PROVIDER_NAME, name)
    }

    #[test]
    fn test_parse_and_display() {
        let text = "(&(objectClass=javax.sql.DataSource)(osgi.jndi.service.name=tasklist))";
        let filter: Filter = text.parse().unwrap();
        assert_eq!(filter.to_string(), text);
        assert_eq!(
            filter,
            Filter::capability(DATA_SOURCE).and(Filter::equals(JNDI_SERVICE_NAME, "tasklist"))
        );
    }

    #[test]
    fn test_parse_not_or_present() {
        let filter: Filter = "(|(a=1)(!(b=*)))".parse().unwrap();
        let with_b = Properties::new().with("b", "x");
        let with_a = Properties::new().with("a", "1").with("b", "x");
        assert!(filter.matches(&Properties::new()));
        assert!(!filter.matches(&with_b));
        assert!(filter.matches(&with_a));
    }

    #[test]
    fn test_escaped_values_round_trip() {
        let filter = Filter::equals("name", "a(b)*c\\d");
        let text = filter.to_string();
        assert_eq!(text, "(name=a\\(b\\)\\*c\\\\d)");
        assert_eq!(text.parse::<Filter>().unwrap(), filter);
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "(", "(a=b", "a=b", "(&)", "(=b)", "(a>=1)", "(a=b*c)", "(a=b))"] {
            let err = bad.parse::<Filter>().unwrap_err();
            assert!(
                matches!(err, FilterError::InvalidSyntax { .. }),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_error_reports_position() {
        let err = "(a=b))".parse::<Filter>().unwrap_err();
        assert!(matches!(err, FilterError::InvalidSyntax { position: 5, .. }));

        let spaced: Filter = " (&(a=1) ( b = * ) ) ".parse().unwrap();
        assert_eq!(spaced, Filter::equals("a", "1").and(Filter::present("b")));
    }

    #[test]
    fn test_provider_filter_pinned_name() {
        let mut unit = PersistenceUnit::new("orders", Module::new("app", "1.0.0"));
        unit.set_provider_class_name(Some("EclipseLink".to_string()));
        let filter = provider_filter(&unit);

        assert_eq!(
            filter.to_string(),
            "(&(objectClass=javax.persistence.spi.PersistenceProvider)(javax.persistence.provider=EclipseLink))"
        );
        assert!(filter.matches(&provider_props("EclipseLink")));
        assert!(!filter.matches(&provider_props("Hibernate")));
        assert!(!filter.matches(
            &Properties::new().with(PERSISTENCE_PROVIDER_NAME, "EclipseLink")
        ));
    }

    #[test]
    fn test_provider_filter_any_provider() {
        let unit = PersistenceUnit::new("orders", Module::new("app", "1.0.0"));
        let filter = provider_filter(&unit);

        assert_eq!(
            filter.to_string(),
            "(objectClass=javax.persistence.spi.PersistenceProvider)"
        );
        assert!(filter.matches(&provider_props("EclipseLink")));
        assert!(filter.matches(&provider_props("Hibernate")));
        assert!(!filter.matches(&Properties::new().with(OBJECT_CLASS, DATA_SOURCE)));
    }

    #[test]
    fn test_data_source_filter_full() {
        let filter = data_source_filter(
            "osgi:service/javax.sql.DataSource/(osgi.jndi.service.name=tasklist)",
            "test",
        )
        .unwrap();
        assert_eq!(
            filter.to_string(),
            "(&(objectClass=javax.sql.DataSource)(osgi.jndi.service.name=tasklist))"
        );
    }

    #[test]
    fn test_data_source_filter_simple() {
        let filter = data_source_filter("tasklist", "test").unwrap();
        assert_eq!(
            filter.to_string(),
            "(&(objectClass=javax.sql.DataSource)(osgi.jndi.service.name=tasklist))"
        );
    }

    #[test]
    fn test_data_source_filter_any_named() {
        let filter = data_source_filter(DATA_SOURCE_PREFIX, "test").unwrap();
        assert_eq!(
            filter.to_string(),
            "(&(objectClass=javax.sql.DataSource)(osgi.jndi.service.name=*))"
        );
    }

    #[test]
    fn test_data_source_filter_rejects_garbage() {
        assert!(matches!(
            data_source_filter("  ", "test"),
            Err(FilterError::InvalidDataSource { .. })
        ));
        assert!(matches!(
            data_source_filter("osgi:service/javax.sql.DataSource/(broken", "test"),
            Err(FilterError::InvalidSyntax { .. })
        ));
    }
}
