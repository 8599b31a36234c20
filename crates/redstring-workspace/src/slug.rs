// slug.rs — Slug derivation and uniqueness against existing workspaces.

/// Normalize a display name to an identifier-safe token.
///
/// Lowercases, keeps ASCII letters and digits, and collapses every other run
/// of characters into a single `-`. An empty result becomes `"workspace"`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "workspace".to_string()
    } else {
        slug
    }
}

/// `base`, or `base-2`, `base-3`, … whichever is first not `taken`.
/// Comparison is case-insensitive.
pub fn unique_slug(base: &str, taken: impl Fn(&str) -> bool) -> String {
    let base = base.to_ascii_lowercase();
    if !taken(&base) {
        return base;
    }
    (2..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_normalizes() {
        assert_eq!(slugify("My Universe"), "my-universe");
        assert_eq!(slugify("  Hello, World!! "), "hello-world");
        assert_eq!(slugify("Ünïcode only"), "n-code-only");
        assert_eq!(slugify("***"), "workspace");
        assert_eq!(slugify("already-ok_2"), "already-ok-2");
    }

    #[test]
    fn unique_slug_appends_counter() {
        let taken = ["alpha", "alpha-2"];
        assert_eq!(unique_slug("alpha", |s| taken.contains(&s)), "alpha-3");
        assert_eq!(unique_slug("Beta", |s| taken.contains(&s)), "beta");
    }
}
