//! Kubernetes helpers: label selectors, naming, pluralization

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

use crate::{Error, Result};

// =============================================================================
// Label selectors
// =============================================================================

/// Convert a structured selector to the `labelSelector` query string form
///
/// `None` and an empty selector both yield an empty string (select everything).
pub fn label_selector_to_string(selector: Option<&LabelSelector>) -> Result<String> {
    let Some(selector) = selector else {
        return Ok(String::new());
    };

    let mut terms = Vec::new();
    if let Some(labels) = &selector.match_labels {
        for (key, value) in labels {
            terms.push(format!("{}={}", key, value));
        }
    }
    for requirement in selector.match_expressions.iter().flatten() {
        terms.push(requirement_to_string(requirement)?);
    }
    Ok(terms.join(","))
}

fn requirement_to_string(req: &LabelSelectorRequirement) -> Result<String> {
    let values = req.values.clone().unwrap_or_default();
    let needs_values = |op: &str| -> Result<String> {
        if values.is_empty() {
            return Err(Error::LabelSelectorParsing {
                message: format!("operator {} on key {} requires values", op, req.key),
            });
        }
        let mut sorted = values.clone();
        sorted.sort();
        Ok(sorted.join(","))
    };

    match req.operator.as_str() {
        "In" => Ok(format!("{} in ({})", req.key, needs_values("In")?)),
        "NotIn" => Ok(format!("{} notin ({})", req.key, needs_values("NotIn")?)),
        "Exists" => Ok(req.key.clone()),
        "DoesNotExist" => Ok(format!("!{}", req.key)),
        other => Err(Error::LabelSelectorParsing {
            message: format!("unknown operator {} on key {}", other, req.key),
        }),
    }
}

/// Evaluate a selector against a label set
///
/// Unknown operators never match.
pub fn label_selector_matches(
    selector: Option<&LabelSelector>,
    labels: &BTreeMap<String, String>,
) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let labels_ok = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));
    let expressions_ok = selector.match_expressions.iter().flatten().all(|req| {
        let values = req.values.as_deref().unwrap_or_default();
        match req.operator.as_str() {
            "In" => labels.get(&req.key).is_some_and(|v| values.contains(v)),
            "NotIn" => labels.get(&req.key).map_or(true, |v| !values.contains(v)),
            "Exists" => labels.contains_key(&req.key),
            "DoesNotExist" => !labels.contains_key(&req.key),
            _ => false,
        }
    });
    labels_ok && expressions_ok
}

/// Parse an equality-only selector string (`a=b,c=d`), as built by the controller
pub fn parse_equality_selector(selector: &str) -> BTreeMap<String, String> {
    selector
        .split(',')
        .filter_map(|term| term.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

// =============================================================================
// Naming
// =============================================================================

/// Maximum length of a label value and of a DNS-1123 label
pub const MAX_LABEL_LEN: usize = 63;

/// Turn an arbitrary string into a DNS-1123 label (`[a-z0-9]([-a-z0-9]*[a-z0-9])?`)
pub fn sanitize_dns_label(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    truncate_trimmed(out.trim_matches('-'), MAX_LABEL_LEN, '-')
}

/// Turn an arbitrary string into a valid label value
///
/// Keeps `[A-Za-z0-9._-]`, replaces everything else by `_`, and trims
/// non-alphanumerics at both ends.
pub fn sanitize_label_value(input: &str) -> String {
    let replaced: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = replaced.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    let mut value: String = trimmed.chars().take(MAX_LABEL_LEN).collect();
    while value.ends_with(|c: char| !c.is_ascii_alphanumeric()) {
        value.pop();
    }
    value
}

fn truncate_trimmed(input: &str, max: usize, trim: char) -> String {
    let mut value: String = input.chars().take(max).collect();
    while value.ends_with(trim) {
        value.pop();
    }
    value
}

/// Stable name for a pattern-managed object
///
/// The readable `hint` is kept as far as the length limit allows; the hash of
/// every component keeps names distinct when hints collide after sanitization.
pub fn managed_name(prefix: &str, hint: &str, components: &[&str]) -> String {
    let hash = deterministic_hash(&components.join("\u{0}"));
    let short = &hash[..10];
    let head = sanitize_dns_label(&format!("{}-{}", prefix, hint));
    let room = MAX_LABEL_LEN - short.len() - 1;
    let head = truncate_trimmed(&head, room, '-');
    format!("{}-{}", head, short)
}

/// Compute a 16 hex char digest of `input` (truncated SHA-256)
///
/// Stable across toolchains, unlike `DefaultHasher`, so it may be persisted in
/// object names.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    use std::fmt::Write;

    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

// =============================================================================
// Kinds and resources
// =============================================================================

const IRREGULAR_PLURALS: &[(&str, &str)] = &[
    ("endpoints", "endpoints"),
    ("ingress", "ingresses"),
    ("ingressclass", "ingressclasses"),
    ("networkpolicy", "networkpolicies"),
    ("podsecuritypolicy", "podsecuritypolicies"),
    ("priorityclass", "priorityclasses"),
    ("storageclass", "storageclasses"),
    ("runtimeclass", "runtimeclasses"),
    ("gatewayclass", "gatewayclasses"),
    ("remotesyncer", "remotesyncers"),
];

/// Lowercase plural resource name of a kind (`ConfigMap` -> `configmaps`)
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if let Some((_, plural)) = IRREGULAR_PLURALS.iter().find(|(s, _)| *s == lower) {
        return (*plural).to_string();
    }
    if lower.ends_with('s') || lower.ends_with('x') || lower.ends_with("ch") || lower.ends_with("sh")
    {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Split an `apiVersion` into its group and version (`apps/v1` -> (`apps`, `v1`))
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}
