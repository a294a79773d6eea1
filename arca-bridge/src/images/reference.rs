//! Image reference normalization and lookup keys.
//!
//! Docker's shorthand rules, applied deterministically:
//! 1. No `:tag` and no `@digest` -> append `:latest`.
//! 2. First slash-delimited token without a `.` -> prefix `docker.io`;
//!    a bare single-component name additionally gains `library/`.
//!
//! Normalization is idempotent: applying it twice changes nothing.

/// Normalize a user-supplied reference into its fully qualified form.
pub fn normalize_reference(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return trimmed.to_string();
    }

    // Split off any @digest suffix first; tags never follow a digest.
    let (name_and_tag, digest) = match trimmed.split_once('@') {
        Some((name, digest)) => (name, Some(digest)),
        None => (trimmed, None),
    };

    // A ':' after the last '/' is a tag separator; earlier colons belong
    // to a registry port.
    let (name, tag) = match name_and_tag.rfind(':') {
        Some(idx) if !name_and_tag[idx..].contains('/') => {
            (&name_and_tag[..idx], Some(&name_and_tag[idx + 1..]))
        }
        _ => (name_and_tag, None),
    };

    let qualified_name = qualify_name(name);

    let mut out = qualified_name;
    if let Some(tag) = tag {
        out.push(':');
        out.push_str(tag);
    } else if digest.is_none() {
        out.push_str(":latest");
    }
    if let Some(digest) = digest {
        out.push('@');
        out.push_str(digest);
    }
    out
}

fn qualify_name(name: &str) -> String {
    let mut components: Vec<&str> = name.split('/').collect();

    let first_is_registry = components
        .first()
        .map(|token| token.contains('.'))
        .unwrap_or(false);

    if !first_is_registry {
        if components.len() == 1 {
            components.insert(0, "library");
        }
        components.insert(0, "docker.io");
    }

    components.join("/")
}

/// True if `candidate` is a plausible short-ID prefix: 12 to 64 lowercase
/// hex characters.
pub fn is_id_prefix(candidate: &str) -> bool {
    (12..=64).contains(&candidate.len())
        && candidate
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_uppercase())
}
