//! Subscription filters (NIP-01 `REQ` payloads).

use crate::nip01::Event;
use crate::tag_parsing::has_tag_value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declarative predicate over events.
///
/// Every populated field must match for the filter to match. Several filters
/// in one subscription are OR-combined, see [`filters_match`]. `limit` is only
/// a hint for the relay's initial query and is never enforced locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Tag queries keyed as they appear on the wire (`"#e"`, `"#p"`, ...).
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Match events carrying a `letter` tag with one of `values`.
    pub fn tag<I, S>(mut self, letter: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(format!("#{letter}"))
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Shorthand for `#e` references.
    pub fn events<I, S>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tag('e', ids)
    }

    /// Shorthand for `#p` references.
    pub fn pubkeys<I, S>(self, pubkeys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tag('p', pubkeys)
    }

    /// Whether `event` satisfies every populated field.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids
            && !ids.iter().any(|id| *id == event.id)
        {
            return false;
        }
        if let Some(authors) = &self.authors
            && !authors.iter().any(|author| *author == event.pubkey)
        {
            return false;
        }
        if let Some(kinds) = &self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }

        self.tags.iter().all(|(key, values)| {
            let name = key.strip_prefix('#').unwrap_or(key);
            has_tag_value(&event.tags, name, values)
        })
    }
}

/// OR-combination of several filters.
pub fn filters_match(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|filter| filter.matches(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> Event {
        Event {
            id: "id-1".to_string(),
            pubkey: "alice".to_string(),
            created_at: 100,
            kind: 1,
            tags: vec![vec!["e".to_string(), "root".to_string()]],
            content: "hello".to_string(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn serializes_wire_shape() {
        let filter = Filter::new()
            .kinds([1, 7])
            .authors(["alice"])
            .events(["root"])
            .since(10)
            .limit(5);
        assert_eq!(
            serde_json::to_value(&filter).unwrap(),
            json!({"authors": ["alice"], "kinds": [1, 7], "since": 10, "limit": 5, "#e": ["root"]})
        );
    }

    #[test]
    fn empty_filter_is_empty_object() {
        assert_eq!(serde_json::to_string(&Filter::new()).unwrap(), "{}");
    }

    #[test]
    fn deserializes_tag_queries() {
        let filter: Filter =
            serde_json::from_value(json!({"kinds": [1], "#p": ["bob"], "until": 9})).unwrap();
        assert_eq!(filter.kinds, Some(vec![1]));
        assert_eq!(filter.until, Some(9));
        assert_eq!(filter.tags.get("#p"), Some(&vec!["bob".to_string()]));
    }

    #[test]
    fn matches_each_field() {
        let event = event();
        assert!(Filter::new().matches(&event));
        assert!(Filter::new().ids(["id-1"]).matches(&event));
        assert!(!Filter::new().ids(["id-2"]).matches(&event));
        assert!(!Filter::new().authors(["bob"]).matches(&event));
        assert!(!Filter::new().kinds([7]).matches(&event));
        assert!(!Filter::new().since(101).matches(&event));
        assert!(!Filter::new().until(99).matches(&event));
        assert!(Filter::new().events(["root"]).matches(&event));
        assert!(!Filter::new().pubkeys(["root"]).matches(&event));
    }

    #[test]
    fn limit_is_not_a_predicate() {
        assert!(Filter::new().limit(0).matches(&event()));
    }

    #[test]
    fn filters_are_or_combined() {
        let filters = vec![Filter::new().kinds([7]), Filter::new().authors(["alice"])];
        assert!(filters_match(&filters, &event()));
        assert!(!filters_match(&filters[..1], &event()));
        assert!(!filters_match(&[], &event()));
    }
}
