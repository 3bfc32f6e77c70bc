//! Field resolution module
//!
//! Extracts a named field's value from one decoded event record.
//! Resolution runs through an ordered pipeline of extractor strategies:
//! first-class attributes, the alias table, the decoder's pre-parsed
//! event data, two fast payload shapes, and finally a full section scan
//! over EventData/UserData/System. Malformed payloads resolve to absent,
//! never an error.

use crate::models::LogEntry;
use chrono::SecondsFormat;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Generic `<Tag attrs>text</Tag>` shape used by the full section scan.
static TAG_PAIR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<([A-Za-z_][\w.\-]*)((?:\s[^>]*)?)>([^<]*)</"#)
        .expect("TAG_PAIR_REGEX pattern is valid")
});

/// `Name="value"` attribute shape inside a Data tag.
static NAME_ATTR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)Name\s*=\s*"([^"]*)""#).expect("NAME_ATTR_REGEX pattern is valid")
});

/// Run-scoped memo for field resolution.
///
/// Owned by a single evaluation pass and never shared across concurrent
/// runs. Memoizes resolved (event, field) values, per-field compiled
/// regexes for the fast payload shapes, and per-event parsed payload maps.
/// Purely a performance aid; resolution is correct without it.
#[derive(Default)]
pub struct FieldCache {
    values: HashMap<(u64, String), Option<String>>,
    field_regexes: HashMap<String, Option<(Regex, Regex)>>,
    payloads: HashMap<u64, Option<Vec<(String, String)>>>,
}

impl FieldCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiled fast-shape regexes for a field name, built on first use.
    /// A name that cannot form a valid pattern memoizes as `None`.
    fn fast_shapes(&mut self, name: &str) -> Option<&(Regex, Regex)> {
        self.field_regexes
            .entry(name.to_string())
            .or_insert_with(|| {
                let escaped = regex::escape(name);
                let data_shape = Regex::new(&format!(
                    r#"(?is)<Data\s+Name\s*=\s*"{escaped}"\s*>([^<]*)</Data>"#
                ))
                .ok()?;
                let tag_shape =
                    Regex::new(&format!(r#"(?is)<{escaped}(?:\s[^>]*)?>([^<]*)</{escaped}>"#))
                        .ok()?;
                Some((data_shape, tag_shape))
            })
            .as_ref()
    }

    /// Parsed (name, value) pairs for an event's raw payload, built on
    /// first use. Events with no usable payload memoize as `None`.
    fn parsed_payload(&mut self, event: &LogEntry) -> Option<&[(String, String)]> {
        self.payloads
            .entry(event.id)
            .or_insert_with(|| parse_payload_sections(&event.raw_xml))
            .as_deref()
    }
}

/// Resolves named fields from event records via the extractor pipeline.
pub struct FieldResolver;

impl FieldResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolves `name` on `event`, memoizing through `cache`.
    ///
    /// Returns `None` for unknown fields, empty attributes, and malformed
    /// payloads alike; callers treat all of these as "absent".
    pub fn resolve(&self, event: &LogEntry, name: &str, cache: &mut FieldCache) -> Option<String> {
        let key = (event.id, name.to_string());
        if let Some(hit) = cache.values.get(&key) {
            return hit.clone();
        }

        let resolved = resolve_uncached(event, name, cache);
        cache.values.insert(key, resolved.clone());
        resolved
    }
}

impl Default for FieldResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// The ordered strategy chain. Each stage returns the first value it can
/// produce; later stages only run when earlier ones come up empty.
fn resolve_uncached(event: &LogEntry, name: &str, cache: &mut FieldCache) -> Option<String> {
    extract_attribute(event, name)
        .or_else(|| extract_event_data(event, name))
        .or_else(|| extract_fast_shape(event, name, cache))
        .or_else(|| extract_payload_scan(event, name, cache))
}

/// Stage 1: first-class attributes plus the fixed alias table
/// (Provider -> provider, EventID -> event_id, Computer -> computer).
fn extract_attribute(event: &LogEntry, name: &str) -> Option<String> {
    let non_empty = |s: &str| {
        if s.is_empty() {
            None
        } else {
            Some(s.to_string())
        }
    };

    match name {
        "EventID" | "eventId" | "event_id" => Some(event.event_id.to_string()),
        "Provider" | "provider" | "source" => non_empty(&event.provider),
        "Channel" | "channel" | "path" => non_empty(&event.channel),
        "Computer" | "computer" => non_empty(&event.computer),
        "Level" | "level" => non_empty(&event.level),
        "Message" | "message" => non_empty(&event.message),
        "Timestamp" | "timestamp" => event
            .timestamp
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        _ => None,
    }
}

/// Stage 2: the decoder's pre-parsed name/value pairs, when present.
fn extract_event_data(event: &LogEntry, name: &str) -> Option<String> {
    let data = event.event_data.as_ref()?;
    data.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

/// Stage 3: two fast payload shapes, `<Data Name="X">v</Data>` and
/// `<X>v</X>`, tried before any full parse.
fn extract_fast_shape(event: &LogEntry, name: &str, cache: &mut FieldCache) -> Option<String> {
    if event.raw_xml.is_empty() {
        return None;
    }
    let (data_shape, tag_shape) = cache.fast_shapes(name)?;
    let captured = data_shape
        .captures(&event.raw_xml)
        .or_else(|| tag_shape.captures(&event.raw_xml))?;
    Some(unescape_markup(captured.get(1)?.as_str().trim()))
}

/// Stage 4: full scan over the EventData/UserData/System sections of the
/// payload, memoized per event.
fn extract_payload_scan(event: &LogEntry, name: &str, cache: &mut FieldCache) -> Option<String> {
    let pairs = cache.parsed_payload(event)?;
    pairs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

/// Extracts (name, value) pairs from the payload's EventData, UserData and
/// System sections. Returns `None` when no section yields anything, which
/// covers garbled payloads without ever failing.
fn parse_payload_sections(raw: &str) -> Option<Vec<(String, String)>> {
    if raw.is_empty() {
        return None;
    }

    let mut pairs = Vec::new();
    for section in ["EventData", "UserData", "System"] {
        if let Some(body) = section_body(raw, section) {
            collect_tag_pairs(body, &mut pairs);
        }
    }

    // A payload with no recognizable sections still gets one whole-text
    // pass so flat renderings remain resolvable.
    if pairs.is_empty() {
        collect_tag_pairs(raw, &mut pairs);
    }

    if pairs.is_empty() {
        None
    } else {
        Some(pairs)
    }
}

/// Case-insensitive extraction of one `<Section>...</Section>` body.
fn section_body<'a>(raw: &'a str, section: &str) -> Option<&'a str> {
    let lower = raw.to_ascii_lowercase();
    let open_tag = format!("<{}", section.to_ascii_lowercase());
    let close_tag = format!("</{}>", section.to_ascii_lowercase());

    let open_at = lower.find(&open_tag)?;
    let body_at = open_at + lower[open_at..].find('>')? + 1;
    let close_at = body_at + lower[body_at..].find(&close_tag)?;
    if body_at > close_at || !raw.is_char_boundary(body_at) || !raw.is_char_boundary(close_at) {
        return None;
    }
    Some(&raw[body_at..close_at])
}

/// Collects `<Data Name="N">v</Data>` and generic `<Tag>v</Tag>` pairs.
fn collect_tag_pairs(body: &str, pairs: &mut Vec<(String, String)>) {
    for cap in TAG_PAIR_REGEX.captures_iter(body) {
        let tag = &cap[1];
        let attrs = &cap[2];
        let value = unescape_markup(cap[3].trim());
        if value.is_empty() {
            continue;
        }

        // <Data Name="X"> pairs key on the Name attribute; everything else
        // keys on the tag itself.
        let name = if tag.eq_ignore_ascii_case("Data") {
            match NAME_ATTR_REGEX.captures(attrs) {
                Some(attr) => attr[1].to_string(),
                None => continue,
            }
        } else {
            tag.to_string()
        };

        pairs.push((name, value));
    }
}

/// Minimal entity unescaping for values lifted out of the raw payload.
fn unescape_markup(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogEntry;

    fn event_with_xml(xml: &str) -> LogEntry {
        LogEntry {
            id: 1,
            raw_xml: xml.to_string(),
            ..LogEntry::default()
        }
    }

    #[test]
    fn test_resolves_first_class_attributes() {
        let resolver = FieldResolver::new();
        let mut cache = FieldCache::new();
        let event = LogEntry {
            id: 7,
            event_id: 4688,
            provider: "Microsoft-Windows-Security-Auditing".to_string(),
            computer: "WS01".to_string(),
            ..LogEntry::default()
        };

        assert_eq!(
            resolver.resolve(&event, "EventID", &mut cache).as_deref(),
            Some("4688")
        );
        assert_eq!(
            resolver.resolve(&event, "Provider", &mut cache).as_deref(),
            Some("Microsoft-Windows-Security-Auditing")
        );
        assert_eq!(
            resolver.resolve(&event, "Computer", &mut cache).as_deref(),
            Some("WS01")
        );
    }

    #[test]
    fn test_pre_parsed_data_wins_over_payload() {
        let resolver = FieldResolver::new();
        let mut cache = FieldCache::new();
        let mut event = event_with_xml(r#"<Data Name="Image">C:\from\payload.exe</Data>"#);
        event.event_data = Some(vec![("Image".to_string(), "C:\\from\\map.exe".to_string())]);

        assert_eq!(
            resolver.resolve(&event, "Image", &mut cache).as_deref(),
            Some("C:\\from\\map.exe")
        );
    }

    #[test]
    fn test_fast_shape_data_name() {
        let resolver = FieldResolver::new();
        let mut cache = FieldCache::new();
        let event = event_with_xml(
            r#"<EventData><Data Name="Image">C:\Windows\System32\cmd.exe</Data></EventData>"#,
        );

        assert_eq!(
            resolver.resolve(&event, "Image", &mut cache).as_deref(),
            Some("C:\\Windows\\System32\\cmd.exe")
        );
    }

    #[test]
    fn test_fast_shape_bare_tag() {
        let resolver = FieldResolver::new();
        let mut cache = FieldCache::new();
        let event = event_with_xml("<UserData><TargetUserName>alice</TargetUserName></UserData>");

        assert_eq!(
            resolver
                .resolve(&event, "TargetUserName", &mut cache)
                .as_deref(),
            Some("alice")
        );
    }

    #[test]
    fn test_section_scan_finds_system_fields() {
        let resolver = FieldResolver::new();
        let mut cache = FieldCache::new();
        // Tag name differs in case from the requested field, so the fast
        // shapes miss and the section scan has to find it.
        let event = event_with_xml("<System><task>12288</task></System>");

        assert_eq!(
            resolver.resolve(&event, "Task", &mut cache).as_deref(),
            Some("12288")
        );
    }

    #[test]
    fn test_entities_are_unescaped() {
        let resolver = FieldResolver::new();
        let mut cache = FieldCache::new();
        let event = event_with_xml(
            r#"<EventData><Data Name="CommandLine">cmd.exe /c &quot;echo 1 &amp; echo 2&quot;</Data></EventData>"#,
        );

        assert_eq!(
            resolver
                .resolve(&event, "CommandLine", &mut cache)
                .as_deref(),
            Some("cmd.exe /c \"echo 1 & echo 2\"")
        );
    }

    #[test]
    fn test_garbled_payload_resolves_absent() {
        let resolver = FieldResolver::new();
        let mut cache = FieldCache::new();
        let event = event_with_xml("<<<<not markup at all &&& <Data Name=>");

        assert!(resolver.resolve(&event, "Image", &mut cache).is_none());
        assert!(resolver.resolve(&event, "Anything", &mut cache).is_none());
    }

    #[test]
    fn test_memoization_returns_identical_results() {
        let resolver = FieldResolver::new();
        let mut cache = FieldCache::new();
        let event = event_with_xml(r#"<EventData><Data Name="User">bob</Data></EventData>"#);

        let first = resolver.resolve(&event, "User", &mut cache);
        let second = resolver.resolve(&event, "User", &mut cache);
        assert_eq!(first.as_deref(), Some("bob"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_attribute_is_absent() {
        let resolver = FieldResolver::new();
        let mut cache = FieldCache::new();
        let event = LogEntry::default();

        assert!(resolver.resolve(&event, "Provider", &mut cache).is_none());
        assert!(resolver.resolve(&event, "Computer", &mut cache).is_none());
    }
}
