//! Permission slug matching.
//!
//! A granted slug satisfies a required slug when it is an exact match, the
//! global `*`, or a `prefix.*` pattern whose prefix covers the requirement.
//! Matching is one-directional: patterns live on the granted side only, a
//! required slug is always literal.

/// Whether `granted` satisfies `required`.
#[must_use]
pub fn matches(granted: &str, required: &str) -> bool {
    if granted == "*" {
        return true;
    }
    if granted == required {
        return true;
    }
    if let Some(prefix) = granted.strip_suffix(".*") {
        return required
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'));
    }
    false
}

/// Whether any slug in `granted` satisfies `required`.
#[must_use]
pub fn any_matches<'a, I>(granted: I, required: &str) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    granted.into_iter().any(|slug| matches(slug, required))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(matches("posts.view", "posts.view"));
        assert!(!matches("posts.view", "posts.edit"));
    }

    #[test]
    fn global_wildcard_matches_everything() {
        assert!(matches("*", "posts.view"));
        assert!(matches("*", "roles.manage"));
        assert!(matches("*", "*"));
    }

    #[test]
    fn prefix_wildcard_matches_segment_children() {
        assert!(matches("posts.*", "posts.view"));
        assert!(matches("posts.*", "posts.delete"));
        assert!(!matches("posts.*", "users.view"));
    }

    #[test]
    fn prefix_wildcard_requires_a_segment_boundary() {
        // "posts.*" must not cover "postscript.view".
        assert!(!matches("posts.*", "postscript.view"));
        assert!(!matches("posts.*", "posts"));
    }

    #[test]
    fn required_side_is_literal() {
        // A required pattern is not expanded against granted slugs.
        assert!(!matches("posts.view", "posts.*"));
        assert!(!matches("posts.view", "*"));
    }

    #[test]
    fn any_matches_scans_the_set() {
        let granted = ["users.view", "posts.*"];
        assert!(any_matches(granted, "posts.edit"));
        assert!(any_matches(granted, "users.view"));
        assert!(!any_matches(granted, "roles.manage"));
    }
}
