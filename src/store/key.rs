//! Storage key derivation from project identity.

const KEY_PREFIX: &str = "pool_";

pub(super) fn pool_key(project_name: &str) -> Option<String> {
    let slug = slugify(project_name);
    if slug.is_empty() {
        return None;
    }
    Some(format!("{KEY_PREFIX}{slug}"))
}

pub(super) fn slugify(value: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = false;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_matches('-').to_owned()
}
