//! Helpers for reading `["name", "value", ...]` tag arrays.

pub(crate) fn tag_name(tag: &[String]) -> Option<&str> {
    tag.first().map(String::as_str)
}

pub(crate) fn tag_field(tag: &[String], index: usize) -> Option<&str> {
    tag.get(index).map(String::as_str)
}

pub(crate) fn is_tag(tag: &[String], name: &str) -> bool {
    matches!(tag_name(tag), Some(tag_name) if tag_name == name)
}

/// Every first value of tags called `name`, in tag order.
pub(crate) fn tag_values<'a>(
    tags: &'a [Vec<String>],
    name: &'a str,
) -> impl Iterator<Item = &'a str> + 'a {
    tags.iter()
        .filter(move |tag| is_tag(tag, name))
        .filter_map(|tag| tag_field(tag, 1))
}

/// Whether any tag called `name` carries one of `wanted` as its value.
pub(crate) fn has_tag_value(tags: &[Vec<String>], name: &str, wanted: &[String]) -> bool {
    tag_values(tags, name).any(|value| wanted.iter().any(|w| w == value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> Vec<Vec<String>> {
        vec![
            vec!["e".to_string(), "event-1".to_string()],
            vec!["p".to_string()],
            vec!["e".to_string(), "event-2".to_string(), "wss://relay".to_string()],
        ]
    }

    #[test]
    fn values_skip_tags_without_value() {
        let tags = tags();
        assert_eq!(tag_values(&tags, "e").collect::<Vec<_>>(), vec!["event-1", "event-2"]);
        assert_eq!(tag_values(&tags, "p").count(), 0);
    }

    #[test]
    fn has_value_matches_any_wanted() {
        let tags = tags();
        assert!(has_tag_value(&tags, "e", &["nope".to_string(), "event-2".to_string()]));
        assert!(!has_tag_value(&tags, "p", &["event-1".to_string()]));
    }
}
