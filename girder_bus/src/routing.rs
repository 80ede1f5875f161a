use std::fmt::{Debug, Display, Formatter};

/// A topic route pattern compiled for repeated matching.
///
/// The pattern grammar is the AMQP topic grammar: segments separated by dots,
/// `*` standing in for exactly one segment, `#` standing in for zero or more
/// segments. A pattern with no wildcards matches only its own literal text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    source: String,
    segments: Vec<Segment>,
    literal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    One,
    Any,
}

impl RoutePattern {
    /// Compiles the given pattern text.
    pub fn compile(pattern: impl Into<String>) -> Self {
        let source = pattern.into();

        let segments = source
            .split('.')
            .map(|segment| match segment {
                "*" => Segment::One,
                "#" => Segment::Any,
                literal => Segment::Literal(literal.to_string()),
            })
            .collect::<Vec<_>>();

        let literal = segments
            .iter()
            .all(|segment| matches!(segment, Segment::Literal(_)));

        Self {
            source,
            segments,
            literal,
        }
    }

    /// Reports the original pattern text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Reports whether this pattern contains no wildcards.
    pub fn is_literal(&self) -> bool {
        self.literal
    }

    /// Reports whether the given route matches this pattern.
    pub fn matches(&self, route: &str) -> bool {
        if self.literal {
            return self.source == route;
        }

        let route = route.split('.').collect::<Vec<_>>();

        Self::matches_from(&self.segments, &route)
    }

    fn matches_from(pattern: &[Segment], route: &[&str]) -> bool {
        match pattern.split_first() {
            None => route.is_empty(),
            Some((Segment::Literal(literal), rest)) => match route.split_first() {
                Some((head, tail)) => head == literal && Self::matches_from(rest, tail),
                None => false,
            },
            Some((Segment::One, rest)) => match route.split_first() {
                Some((_, tail)) => Self::matches_from(rest, tail),
                None => false,
            },
            // `#` consumes any number of leading segments, including none
            Some((Segment::Any, rest)) => {
                (0..=route.len()).any(|skipped| Self::matches_from(rest, &route[skipped..]))
            }
        }
    }
}

impl Display for RoutePattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

/// An ordered collection of [`RoutePattern`]s, each carrying an associated
/// value (normally a message handler).
///
/// Resolution is deliberately deterministic: an exact (literal) match always
/// wins, otherwise the first wildcard pattern to match in **registration
/// order** wins. A route resolves to at most one entry.
#[derive(Debug, Clone)]
pub struct RouteTable<T> {
    entries: Vec<(RoutePattern, T)>,
}

impl<T> RouteTable<T> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers the given pattern with its associated value, consuming and
    /// returning the table for chaining.
    pub fn on(mut self, pattern: impl Into<String>, value: T) -> Self {
        self.insert(pattern, value);

        self
    }

    /// Registers the given pattern with its associated value.
    pub fn insert(&mut self, pattern: impl Into<String>, value: T) {
        self.entries.push((RoutePattern::compile(pattern), value));
    }

    /// Resolves the given route to at most one registered entry: an exact
    /// match if one exists, else the first matching wildcard pattern in
    /// registration order.
    pub fn resolve(&self, route: &str) -> Option<(&RoutePattern, &T)> {
        let exact = self
            .entries
            .iter()
            .find(|(pattern, _)| pattern.is_literal() && pattern.source() == route);

        exact
            .or_else(|| self.entries.iter().find(|(pattern, _)| pattern.matches(route)))
            .map(|(pattern, value)| (pattern, value))
    }

    /// Iterates over the registered pattern texts, in registration order.
    /// These double as the queue binding keys.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(pattern, _)| pattern.source())
    }

    /// Reports the number of registered patterns.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Reports whether no patterns are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for RouteTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn literal_pattern_matches_itself_only() {
        // Given
        let pattern = RoutePattern::compile("order.created");

        // Then
        assert!(pattern.is_literal());
        assert!(pattern.matches("order.created"));
        assert!(!pattern.matches("order.created.eu"));
        assert!(!pattern.matches("order"));
    }

    #[test]
    fn star_matches_exactly_one_segment() {
        // Given
        let pattern = RoutePattern::compile("order.*.eu");

        // Then
        assert!(pattern.matches("order.created.eu"));
        assert!(pattern.matches("order.cancelled.eu"));
        assert!(!pattern.matches("order.eu"));
        assert!(!pattern.matches("order.created.shipped.eu"));
    }

    #[test]
    fn hash_matches_zero_or_more_segments() {
        // Given
        let pattern = RoutePattern::compile("order.#");

        // Then
        assert!(pattern.matches("order"));
        assert!(pattern.matches("order.created"));
        assert!(pattern.matches("order.created.eu.priority"));
        assert!(!pattern.matches("invoice.created"));
    }

    #[test]
    fn hash_in_the_middle() {
        // Given
        let pattern = RoutePattern::compile("order.#.eu");

        // Then
        assert!(pattern.matches("order.eu"));
        assert!(pattern.matches("order.created.eu"));
        assert!(pattern.matches("order.created.priority.eu"));
        assert!(!pattern.matches("order.created"));
    }

    #[test]
    fn exact_match_beats_earlier_wildcard() {
        // Given: the wildcard is registered first
        let table = RouteTable::new()
            .on("order.*", "wildcard")
            .on("order.created", "exact");

        // When
        let (pattern, value) = table.resolve("order.created").unwrap();

        // Then
        assert_eq!(*value, "exact");
        assert_eq!(pattern.source(), "order.created");
    }

    #[test]
    fn wildcards_resolve_in_registration_order() {
        // Given: two overlapping wildcards
        let table = RouteTable::new()
            .on("order.#", "first")
            .on("order.*", "second");

        // When
        let (_, value) = table.resolve("order.created").unwrap();

        // Then
        assert_eq!(*value, "first");
    }

    #[test]
    fn unmatched_route_resolves_to_none() {
        // Given
        let table = RouteTable::new().on("order.*", "wildcard");

        // Then
        assert!(table.resolve("invoice.created").is_none());
    }

    #[test]
    fn patterns_double_as_binding_keys() {
        // Given
        let table = RouteTable::new().on("order.#", 1).on("invoice.*", 2);

        // Then
        assert_eq!(
            table.patterns().collect::<Vec<_>>(),
            vec!["order.#", "invoice.*"],
        );
    }
}
