//! Tile URL templates.
//!
//! Templates address tiles with literal placeholders: `{x}`, `{y}` and `{z}`
//! are required, `{s}` optionally selects a rotating subdomain. Substitution
//! is purely textual and each placeholder is replaced exactly once.

mod rotator;

pub use rotator::SubdomainRotator;

/// Required placeholders every template must contain.
const REQUIRED: [&str; 3] = ["{x}", "{y}", "{z}"];

/// Subdomains assumed when a template uses `{s}` but none were configured.
pub const DEFAULT_SUBDOMAINS: [&str; 3] = ["a", "b", "c"];

/// Outcome of validating a URL template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateValidation {
    /// True iff all required placeholders are present.
    pub valid: bool,
    /// Placeholders found in the template, in canonical order.
    pub placeholders: Vec<String>,
    /// Required placeholders that are absent.
    pub missing: Vec<String>,
    /// Non-fatal mismatches between the template and the subdomain config.
    pub warnings: Vec<String>,
}

/// Checks a template for the required `{x}`/`{y}`/`{z}` placeholders and for
/// subdomain consistency.
///
/// `has_subdomains` reflects whether the caller configured a subdomain list;
/// a `{s}` placeholder without one (or the reverse) is only a warning, since
/// defaults cover the former and the latter is merely unused configuration.
pub fn validate_template(template: &str, has_subdomains: bool) -> TemplateValidation {
    let mut placeholders = Vec::new();
    let mut missing = Vec::new();

    for name in REQUIRED {
        if template.contains(name) {
            placeholders.push(name.to_string());
        } else {
            missing.push(name.to_string());
        }
    }

    let has_slot = template.contains("{s}");
    if has_slot {
        placeholders.push("{s}".to_string());
    }

    let mut warnings = Vec::new();
    if has_slot && !has_subdomains {
        warnings.push(format!(
            "template uses {{s}} but no subdomains were configured; defaulting to {:?}",
            DEFAULT_SUBDOMAINS
        ));
    }
    if !has_slot && has_subdomains {
        warnings.push("subdomains configured but template has no {s} placeholder".to_string());
    }

    TemplateValidation {
        valid: missing.is_empty(),
        placeholders,
        missing,
        warnings,
    }
}

/// Substitutes one tile's coordinates (and optionally a subdomain) into a
/// template. Each placeholder is replaced once.
pub fn materialize(template: &str, x: u32, y: u32, z: u8, subdomain: Option<&str>) -> String {
    let mut url = template
        .replacen("{x}", &x.to_string(), 1)
        .replacen("{y}", &y.to_string(), 1)
        .replacen("{z}", &z.to_string(), 1);
    if let Some(sub) = subdomain {
        url = url.replacen("{s}", sub, 1);
    }
    url
}
