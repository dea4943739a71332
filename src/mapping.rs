//! Field-mapping engine — bidirectional translation between a record's
//! local attributes and the provider's merge-field model.
//!
//! The provider knows three shapes of field: flat scalar fields, one
//! composite "address" field (six sub-keys), and multi-valued categorical
//! groups. Locally everything is an attribute on a [`Record`]. Outbound
//! updates can be partial: a [`ChangeSet`] diff restricts the output to the
//! tags whose attributes actually changed.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, Error, Result};

/// Sub-keys of the composite address field, in mapping order.
pub const ADDRESS_PARTS: [&str; 6] = ["addr1", "addr2", "city", "state", "zip", "country"];

/// Payload key under which the provider nests categorical groupings.
pub const GROUPINGS_TAG: &str = "GROUPINGS";

/// Inbound merge payload: provider tag -> value.
pub type MergePayload = serde_json::Map<String, Value>;

/// A local attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Text(String),
    /// A structured value with an optional normalizable short code
    /// (e.g. a country object). The code is substituted on the wire when
    /// present; otherwise the raw text is sent as-is.
    Coded { raw: String, code: Option<String> },
}

impl AttrValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// The value as it should appear on the wire.
    pub fn wire_value(&self) -> &str {
        match self {
            Self::Text(raw) => raw,
            Self::Coded { raw, code } => code.as_deref().unwrap_or(raw),
        }
    }
}

/// A local record: an identity plus arbitrary named attributes.
#[derive(Debug, Clone, Default)]
pub struct Record {
    /// Out-of-band identity (e.g. `contacts.contact:2579`), managed by the
    /// primary-identity field.
    pub identifier: String,
    attrs: HashMap<String, AttrValue>,
}

impl Record {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            attrs: HashMap::new(),
        }
    }

    pub fn set(&mut self, attr: impl Into<String>, value: AttrValue) -> &mut Self {
        self.attrs.insert(attr.into(), value);
        self
    }

    pub fn get(&self, attr: &str) -> Option<&AttrValue> {
        self.attrs.get(attr)
    }
}

/// One attribute's before/after pair inside a [`ChangeSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub old: Option<AttrValue>,
    pub new: Option<AttrValue>,
}

/// A typed diff between two record states.
///
/// Produced by [`ChangeSet::diff`] rather than assembled ad hoc by callers,
/// so partial updates always describe a real before/after transition.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    changes: HashMap<String, Change>,
}

impl ChangeSet {
    /// Compute the attribute-level diff between two records.
    pub fn diff(before: &Record, after: &Record) -> Self {
        let mut changes = HashMap::new();
        let attrs: BTreeSet<&String> = before.attrs.keys().chain(after.attrs.keys()).collect();
        for attr in attrs {
            let old = before.get(attr).cloned();
            let new = after.get(attr).cloned();
            if old != new {
                changes.insert(attr.clone(), Change { old, new });
            }
        }
        Self { changes }
    }

    /// A single-attribute change, mostly for tests and targeted updates.
    pub fn single(attr: impl Into<String>, old: Option<AttrValue>, new: Option<AttrValue>) -> Self {
        let mut changes = HashMap::new();
        changes.insert(attr.into(), Change { old, new });
        Self { changes }
    }

    pub fn contains(&self, attr: &str) -> bool {
        self.changes.contains_key(attr)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn get(&self, attr: &str) -> Option<&Change> {
        self.changes.get(attr)
    }
}

/// Mapping from one provider merge tag to local attribute(s).
#[derive(Debug, Clone)]
pub enum FieldMapping {
    /// Flat field: one tag, one attribute.
    Plain { tag: String, attr: String },
    /// Composite address field: one tag, an ordered 6-tuple of attributes
    /// (street line 1, street line 2, city, region, postal code, country).
    Composite { tag: String, attrs: Vec<String> },
}

impl FieldMapping {
    pub fn tag(&self) -> &str {
        match self {
            Self::Plain { tag, .. } | Self::Composite { tag, .. } => tag,
        }
    }

    /// The (sub-key, attribute) pairs of a composite mapping. Raises a
    /// configuration error unless exactly 6 attributes are specified.
    fn address_pairs(&self) -> Result<Vec<(&'static str, &str)>> {
        match self {
            Self::Composite { tag, attrs } => {
                if attrs.len() != 6 {
                    return Err(Error::Config(ConfigError::BadCompositeMapping {
                        tag: tag.clone(),
                        count: attrs.len(),
                    }));
                }
                Ok(ADDRESS_PARTS
                    .iter()
                    .zip(attrs.iter())
                    .map(|(part, attr)| (*part, attr.as_str()))
                    .collect())
            }
            Self::Plain { .. } => Ok(Vec::new()),
        }
    }
}

/// Mapping from one provider group to a local attribute. The attribute's
/// value must match one of the group's known option strings to be sent.
#[derive(Debug, Clone)]
pub struct GroupMapping {
    pub group_id: String,
    pub attr: String,
}

/// One categorical grouping on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grouping {
    pub id: String,
    pub groups: String,
}

/// Canonical byte-safe re-encoding for all scalar text destined for the
/// wire. Source systems have shown inconsistent encoding; this pass is
/// required, not optional.
pub fn wire_text(value: &str) -> String {
    String::from_utf8_lossy(value.as_bytes())
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .collect()
}

/// The engine: configured field and group mappings for one provider list.
#[derive(Debug, Clone, Default)]
pub struct FieldMappingEngine {
    fields: Vec<FieldMapping>,
    groups: Vec<GroupMapping>,
    /// Tag of the primary-identity field, if the list is linked to local
    /// records. Always included on full snapshots, always excluded from
    /// partial updates.
    identity_tag: Option<String>,
    /// Known option strings per group id; values outside this set are
    /// dropped, never sent as free text.
    group_options: HashMap<String, BTreeSet<String>>,
}

impl FieldMappingEngine {
    pub fn new(fields: Vec<FieldMapping>, groups: Vec<GroupMapping>) -> Self {
        Self {
            fields,
            groups,
            identity_tag: None,
            group_options: HashMap::new(),
        }
    }

    pub fn with_identity_tag(mut self, tag: impl Into<String>) -> Self {
        self.identity_tag = Some(tag.into());
        self
    }

    pub fn with_group_options<I, S>(mut self, group_id: impl Into<String>, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_options.insert(
            group_id.into(),
            options.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn identity_tag(&self) -> Option<&str> {
        self.identity_tag.as_deref()
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// Translate an inbound merge payload into local attribute values.
    /// Unknown tags are ignored; a malformed composite configuration is a
    /// configuration error.
    pub fn parse(&self, payload: &MergePayload) -> Result<HashMap<String, String>> {
        let mut result: HashMap<String, String> = HashMap::new();

        for mapping in &self.fields {
            let Some(value) = payload.get(mapping.tag()) else {
                continue;
            };
            match mapping {
                FieldMapping::Plain { attr, .. } => {
                    if let Some(text) = value.as_str() {
                        result.insert(attr.clone(), text.to_string());
                    }
                }
                FieldMapping::Composite { .. } => {
                    let pairs = mapping.address_pairs()?;
                    // Only split when the provider structured the value as
                    // sub-keys; a flat string stays unparsed.
                    let Some(parts) = value.as_object() else {
                        continue;
                    };
                    // All six sub-keys must be present or the whole
                    // composite is ignored.
                    if !pairs.iter().all(|(part, _)| parts.contains_key(*part)) {
                        continue;
                    }
                    for (part, attr) in pairs {
                        let sub = parts
                            .get(part)
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        match result.get_mut(attr) {
                            // Later non-empty values extend, never overwrite.
                            Some(existing) => {
                                if !sub.is_empty() {
                                    existing.push_str("  ");
                                    existing.push_str(sub);
                                }
                            }
                            None => {
                                result.insert(attr.to_string(), sub.to_string());
                            }
                        }
                    }
                }
            }
        }

        if let Some(groupings) = payload.get(GROUPINGS_TAG).and_then(Value::as_array) {
            for grouping in groupings {
                let Ok(grouping) = serde_json::from_value::<Grouping>(grouping.clone()) else {
                    continue;
                };
                for mapping in &self.groups {
                    if mapping.group_id == grouping.id {
                        result.insert(mapping.attr.clone(), grouping.groups.clone());
                    }
                }
            }
        }

        Ok(result)
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Build outbound merge values from a record.
    ///
    /// With `changes = None` a full snapshot is emitted (initial subscribe),
    /// including the primary-identity tag. With a diff, only tags whose
    /// attributes appear in the diff are emitted, and the identity tag is
    /// excluded — identity is managed out-of-band.
    pub fn build(&self, record: &Record, changes: Option<&ChangeSet>) -> Result<MergePayload> {
        let mut out = MergePayload::new();

        if changes.is_none()
            && let Some(tag) = &self.identity_tag
            && !record.identifier.is_empty()
        {
            out.insert(tag.clone(), Value::String(wire_text(&record.identifier)));
        }

        for mapping in &self.fields {
            if self.identity_tag.as_deref() == Some(mapping.tag()) {
                continue;
            }
            match mapping {
                FieldMapping::Plain { tag, attr } => {
                    let included = changes.is_none_or(|c| c.contains(attr));
                    if !included {
                        continue;
                    }
                    if let Some(value) = record.get(attr) {
                        let text = wire_text(value.wire_value());
                        if !text.is_empty() {
                            out.insert(tag.clone(), Value::String(text));
                        }
                    }
                }
                FieldMapping::Composite { tag, .. } => {
                    let pairs = mapping.address_pairs()?;
                    let triggered =
                        changes.is_none_or(|c| pairs.iter().any(|(_, attr)| c.contains(attr)));
                    if !triggered {
                        continue;
                    }
                    // The provider expects a complete composite object:
                    // missing attributes become empty strings, and an
                    // attribute used twice only contributes once.
                    let mut value = serde_json::Map::new();
                    let mut done: BTreeSet<&str> = BTreeSet::new();
                    for (part, attr) in pairs {
                        let text = if done.insert(attr) {
                            record
                                .get(attr)
                                .map(|v| wire_text(v.wire_value()))
                                .unwrap_or_default()
                        } else {
                            String::new()
                        };
                        value.insert(part.to_string(), Value::String(text));
                    }
                    out.insert(tag.clone(), Value::Object(value));
                }
            }
        }

        let mut groupings = Vec::new();
        for mapping in &self.groups {
            let included = changes.is_none_or(|c| c.contains(&mapping.attr));
            if !included {
                continue;
            }
            let Some(value) = record.get(&mapping.attr) else {
                continue;
            };
            let text = wire_text(value.wire_value());
            if text.is_empty() {
                continue;
            }
            // Unknown options are dropped, never sent as free text.
            let known = self
                .group_options
                .get(&mapping.group_id)
                .is_some_and(|options| options.contains(&text));
            if known {
                groupings.push(Grouping {
                    id: mapping.group_id.clone(),
                    groups: text,
                });
            }
        }
        if !groupings.is_empty() {
            out.insert(
                GROUPINGS_TAG.to_string(),
                serde_json::to_value(groupings).unwrap_or(Value::Null),
            );
        }

        Ok(out)
    }

    /// Tags this engine may legitimately emit, used to validate merge values
    /// on single-record subscribes.
    pub fn known_tags(&self) -> BTreeSet<String> {
        let mut tags: BTreeSet<String> =
            self.fields.iter().map(|m| m.tag().to_string()).collect();
        tags.insert(GROUPINGS_TAG.to_string());
        if let Some(tag) = &self.identity_tag {
            tags.insert(tag.clone());
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address_engine() -> FieldMappingEngine {
        FieldMappingEngine::new(
            vec![
                FieldMapping::Plain {
                    tag: "FNAME".into(),
                    attr: "first_name".into(),
                },
                FieldMapping::Composite {
                    tag: "ADDRESS".into(),
                    attrs: vec![
                        "street_1".into(),
                        "street_2".into(),
                        "city".into(),
                        "region".into(),
                        "postal_code".into(),
                        "country".into(),
                    ],
                },
            ],
            vec![GroupMapping {
                group_id: "42".into(),
                attr: "lang".into(),
            }],
        )
        .with_group_options("42", ["en", "de"])
    }

    fn full_record() -> Record {
        let mut record = Record::new("contacts.contact:2579");
        record
            .set("first_name", AttrValue::text("Ada"))
            .set("street_1", AttrValue::text("Karl-Schwarzschild-Str. 2"))
            .set("street_2", AttrValue::text("Building B"))
            .set("city", AttrValue::text("Garching"))
            .set("region", AttrValue::text("Bavaria"))
            .set("postal_code", AttrValue::text("85748"))
            .set(
                "country",
                AttrValue::Coded {
                    raw: "Germany".into(),
                    code: Some("DE".into()),
                },
            )
            .set("lang", AttrValue::text("de"));
        record
    }

    #[test]
    fn full_snapshot_emits_all_mapped_tags() {
        let engine = address_engine().with_identity_tag("DPID");
        let out = engine.build(&full_record(), None).unwrap();

        assert_eq!(out["DPID"], "contacts.contact:2579");
        assert_eq!(out["FNAME"], "Ada");
        let address = out["ADDRESS"].as_object().unwrap();
        assert_eq!(address["addr1"], "Karl-Schwarzschild-Str. 2");
        assert_eq!(address["country"], "DE"); // code substituted
        let groupings: Vec<Grouping> =
            serde_json::from_value(out[GROUPINGS_TAG].clone()).unwrap();
        assert_eq!(groupings, vec![Grouping { id: "42".into(), groups: "de".into() }]);
    }

    #[test]
    fn composite_round_trip() {
        let engine = address_engine();
        let record = full_record();
        let payload = engine.build(&record, None).unwrap();
        let parsed = engine.parse(&payload).unwrap();

        assert_eq!(parsed["street_1"], "Karl-Schwarzschild-Str. 2");
        assert_eq!(parsed["street_2"], "Building B");
        assert_eq!(parsed["city"], "Garching");
        assert_eq!(parsed["region"], "Bavaria");
        assert_eq!(parsed["postal_code"], "85748");
        assert_eq!(parsed["country"], "DE");
        assert_eq!(parsed["first_name"], "Ada");
    }

    #[test]
    fn partial_update_is_minimal() {
        let engine = address_engine().with_identity_tag("DPID");
        let changes = ChangeSet::single(
            "first_name",
            Some(AttrValue::text("Ada")),
            Some(AttrValue::text("Grace")),
        );
        let out = engine.build(&full_record(), Some(&changes)).unwrap();

        assert_eq!(out.len(), 1, "only FNAME expected, got {out:?}");
        assert_eq!(out["FNAME"], "Ada"); // value comes from the record
        assert!(!out.contains_key("DPID"), "identity excluded on partial");
    }

    #[test]
    fn composite_siblings_emitted_together() {
        let engine = address_engine();
        let changes = ChangeSet::single(
            "city",
            Some(AttrValue::text("Munich")),
            Some(AttrValue::text("Garching")),
        );
        let out = engine.build(&full_record(), Some(&changes)).unwrap();

        assert!(out.contains_key("ADDRESS"));
        assert!(!out.contains_key("FNAME"));
        let address = out["ADDRESS"].as_object().unwrap();
        assert_eq!(address.len(), 6, "composite must be complete");
    }

    #[test]
    fn missing_composite_attrs_emit_empty_strings() {
        let engine = address_engine();
        let mut record = Record::new("r:1");
        record.set("city", AttrValue::text("Garching"));
        let out = engine.build(&record, None).unwrap();
        let address = out["ADDRESS"].as_object().unwrap();
        assert_eq!(address["addr1"], "");
        assert_eq!(address["city"], "Garching");
        assert_eq!(address["country"], "");
    }

    #[test]
    fn unknown_group_option_dropped() {
        let engine = address_engine();
        let mut record = full_record();
        record.set("lang", AttrValue::text("fr")); // only en/de are known
        let out = engine.build(&record, None).unwrap();
        assert!(
            !out.contains_key(GROUPINGS_TAG),
            "unknown option must not be sent as free text"
        );
    }

    #[test]
    fn bad_composite_config_is_an_error() {
        let engine = FieldMappingEngine::new(
            vec![FieldMapping::Composite {
                tag: "ADDRESS".into(),
                attrs: vec!["street".into(), "city".into()],
            }],
            Vec::new(),
        );
        let err = engine.build(&full_record(), None).unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::BadCompositeMapping { count: 2, .. })
        ));
    }

    #[test]
    fn parse_ignores_unknown_tags_and_flat_composites() {
        let engine = address_engine();
        let mut payload = MergePayload::new();
        payload.insert("MYSTERY".into(), Value::String("x".into()));
        // Composite arriving as a flat string is left unparsed.
        payload.insert("ADDRESS".into(), Value::String("one line".into()));
        let parsed = engine.parse(&payload).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn parse_concatenates_repeated_target_attrs() {
        // Both street lines feed the same local attribute.
        let engine = FieldMappingEngine::new(
            vec![FieldMapping::Composite {
                tag: "ADDRESS".into(),
                attrs: vec![
                    "street".into(),
                    "street".into(),
                    "city".into(),
                    "region".into(),
                    "postal_code".into(),
                    "country".into(),
                ],
            }],
            Vec::new(),
        );
        let mut address = serde_json::Map::new();
        for (part, value) in [
            ("addr1", "Line one"),
            ("addr2", "Line two"),
            ("city", "Garching"),
            ("state", ""),
            ("zip", "85748"),
            ("country", "DE"),
        ] {
            address.insert(part.into(), Value::String(value.into()));
        }
        let mut payload = MergePayload::new();
        payload.insert("ADDRESS".into(), Value::Object(address));

        let parsed = engine.parse(&payload).unwrap();
        assert_eq!(parsed["street"], "Line one  Line two");
    }

    #[test]
    fn parse_groupings() {
        let engine = address_engine();
        let mut payload = MergePayload::new();
        payload.insert(
            GROUPINGS_TAG.into(),
            serde_json::json!([{"id": "42", "groups": "en"}]),
        );
        let parsed = engine.parse(&payload).unwrap();
        assert_eq!(parsed["lang"], "en");
    }

    #[test]
    fn known_tags_cover_fields_groups_and_identity() {
        let engine = address_engine().with_identity_tag("DPID");
        let tags = engine.known_tags();
        assert!(tags.contains("FNAME"));
        assert!(tags.contains("ADDRESS"));
        assert!(tags.contains(GROUPINGS_TAG));
        assert!(tags.contains("DPID"));
        assert!(!tags.contains("MYSTERY"));
    }

    #[test]
    fn changeset_diff_detects_changes() {
        let before = full_record();
        let mut after = full_record();
        after.set("city", AttrValue::text("Munich"));
        after.set("new_attr", AttrValue::text("x"));

        let diff = ChangeSet::diff(&before, &after);
        assert!(diff.contains("city"));
        assert!(diff.contains("new_attr"));
        assert!(!diff.contains("first_name"));
        assert_eq!(
            diff.get("city").unwrap().old,
            Some(AttrValue::text("Garching"))
        );
    }

    #[test]
    fn wire_text_strips_control_characters() {
        assert_eq!(wire_text("a\u{0}b\u{7}c"), "abc");
        assert_eq!(wire_text("keep\nnewline\tand tab"), "keep\nnewline\tand tab");
        assert_eq!(wire_text("résumé"), "résumé");
    }
}
