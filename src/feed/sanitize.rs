use std::collections::{HashMap, HashSet};

use ammonia::Builder;

const ALLOWED_TAGS: [&str; 14] = [
    "a",
    "b",
    "blockquote",
    "br",
    "code",
    "em",
    "i",
    "li",
    "ol",
    "p",
    "pre",
    "strong",
    "u",
    "ul",
];

const ALLOWED_SCHEMES: [&str; 3] = ["http", "https", "mailto"];

const LINK_REL: &str = "noopener noreferrer nofollow";

/// Reduces entry description HTML to a small formatting allow-list.
///
/// Paragraphs, line breaks, emphasis, lists, quotes, code and links survive.
/// Everything else is unwrapped to its text, except `<script>` and `<style>`
/// whose content is dropped too. Attributes other than `href`/`title` on
/// links are removed, as are links whose scheme is not http(s) or mailto.
/// Surviving links get `rel="noopener noreferrer nofollow"`.
pub fn sanitize_html(html: &str) -> String {
    let tag_attributes = HashMap::from([("a", HashSet::from(["href", "title"]))]);

    Builder::default()
        .tags(HashSet::from(ALLOWED_TAGS))
        .tag_attributes(tag_attributes)
        .generic_attributes(HashSet::new())
        .url_schemes(HashSet::from(ALLOWED_SCHEMES))
        .link_rel(Some(LINK_REL))
        .clean(html)
        .to_string()
}
