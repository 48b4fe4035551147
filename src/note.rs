//! Bracket-tag encoding of listing details.
//!
//! A listing's note column packs its structured attributes in front of the
//! free-text description:
//!
//! ```text
//! [Service: أعمال سباكة] [Province: عمان] [Area: خلدا] [Phone: 0790000000] Ten years of experience
//! ```
//!
//! Callers work with [`NoteFields`]; the tag string only exists at the storage
//! boundary.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::error::{Error, Result};

pub const DEFAULT_SERVICE: &str = "فني متخصص";
pub const DEFAULT_PROVINCE: &str = "الأردن";

const TAG_SERVICE: &str = "Service";
const TAG_PROVINCE: &str = "Province";
const TAG_AREA: &str = "Area";
const TAG_PHONE: &str = "Phone";

/// How the poster prefers to be reached, from the older `[Comm: …]` tag
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContactPreference {
    #[default]
    Call,
    WhatsApp,
}

impl ContactPreference {
    /// Read the `[Comm: …]` tag; anything but `whatsapp` means a call
    pub fn from_note(note: &str) -> Self {
        match patterns().comm.captures(note).and_then(|c| c.get(1)) {
            Some(m) if m.as_str().trim().eq_ignore_ascii_case("whatsapp") => ContactPreference::WhatsApp,
            _ => ContactPreference::Call,
        }
    }
}

/// Country named by an older-format note, if any
pub fn legacy_country(note: &str) -> Option<String> {
    let country = capture(&patterns().country, note, "");
    (!country.is_empty()).then_some(country)
}

/// Structured attributes of a listing
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoteFields {
    pub service: String,
    pub province: String,
    pub area: String,
    pub phone: String,
    pub bio: String,
}

/// Exact-value filter over decoded listing details; `None` matches anything
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoteFilter {
    pub service: Option<String>,
    pub province: Option<String>,
    pub area: Option<String>,
}

struct Patterns {
    service: Regex,
    province: Regex,
    area: Regex,
    phone: Regex,
    city: Regex,
    country: Regex,
    comm: Regex,
    strip: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let tag = |name: &str| Regex::new(&format!(r"\[{}: (.*?)\]", name)).expect("static tag pattern");
        Patterns {
            service: tag(TAG_SERVICE),
            province: tag(TAG_PROVINCE),
            area: tag(TAG_AREA),
            phone: tag(TAG_PHONE),
            city: tag("City"),
            country: tag("Country"),
            comm: tag("Comm"),
            strip: Regex::new(r"(?i)\[(?:Service|Province|Area|Phone|Country|City|Comm):.*?\]")
                .expect("static strip pattern"),
        }
    })
}

fn capture(re: &Regex, note: &str, default: &str) -> String {
    re.captures(note)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
        .to_string()
}

impl NoteFields {
    /// Pack the fields into a note string.
    ///
    /// Values may not contain bracket characters; the tag format has no escaping.
    pub fn encode(&self) -> Result<String> {
        let tagged = [
            (TAG_SERVICE, &self.service),
            (TAG_PROVINCE, &self.province),
            (TAG_AREA, &self.area),
            (TAG_PHONE, &self.phone),
        ];
        for (tag, value) in tagged {
            if value.contains('[') || value.contains(']') {
                return Err(Error::Validation(format!("{} may not contain '[' or ']'", tag)));
            }
        }

        let note = format!(
            "[{}: {}] [{}: {}] [{}: {}] [{}: {}] {}",
            TAG_SERVICE, self.service, TAG_PROVINCE, self.province, TAG_AREA, self.area, TAG_PHONE, self.phone, self.bio
        );
        Ok(note.trim().to_string())
    }

    /// Extract the fields from a note, using defaults for absent tags.
    ///
    /// Older notes carry `[City: …]` where newer ones carry `[Area: …]`.
    pub fn decode(note: &str) -> Self {
        let p = patterns();
        let mut area = capture(&p.area, note, "");
        if area.is_empty() {
            area = capture(&p.city, note, "");
        }
        Self {
            service: capture(&p.service, note, DEFAULT_SERVICE),
            province: capture(&p.province, note, DEFAULT_PROVINCE),
            area,
            phone: capture(&p.phone, note, ""),
            bio: p.strip.replace_all(note, "").trim().to_string(),
        }
    }

    /// Require every form field to be filled in
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("service", &self.service),
            ("province", &self.province),
            ("area", &self.area),
            ("phone", &self.phone),
            ("bio", &self.bio),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, v)| v.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(format!("missing required fields: {}", missing.join(", "))))
        }
    }

    pub fn matches(&self, filter: &NoteFilter) -> bool {
        let eq = |want: &Option<String>, have: &str| want.as_deref().map_or(true, |w| w.is_empty() || w == have);
        eq(&filter.service, &self.service) && eq(&filter.province, &self.province) && eq(&filter.area, &self.area)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NoteFields {
        NoteFields {
            service: "أعمال سباكة".to_string(),
            province: "عمان".to_string(),
            area: "خلدا".to_string(),
            phone: "0790000000".to_string(),
            bio: "Ten years fixing pipes. Available evenings.".to_string(),
        }
    }

    #[test]
    fn test_encode_layout() {
        let note = sample().encode().unwrap();
        assert_eq!(
            note,
            "[Service: أعمال سباكة] [Province: عمان] [Area: خلدا] [Phone: 0790000000] Ten years fixing pipes. Available evenings."
        );
    }

    #[test]
    fn test_decode_recovers_fields() {
        let fields = sample();
        let decoded = NoteFields::decode(&fields.encode().unwrap());
        assert_eq!(decoded, fields);
    }

    #[test]
    fn test_decode_missing_tags_uses_defaults() {
        let decoded = NoteFields::decode("just a description");
        assert_eq!(decoded.service, DEFAULT_SERVICE);
        assert_eq!(decoded.province, DEFAULT_PROVINCE);
        assert_eq!(decoded.area, "");
        assert_eq!(decoded.phone, "");
        assert_eq!(decoded.bio, "just a description");
    }

    #[test]
    fn test_decode_tags_in_any_order() {
        let decoded = NoteFields::decode("intro [Phone: 123] middle [Service: نقل عفش] end");
        assert_eq!(decoded.service, "نقل عفش");
        assert_eq!(decoded.phone, "123");
        assert_eq!(decoded.bio, "intro  middle  end");
    }

    #[test]
    fn test_strip_is_case_insensitive() {
        let decoded = NoteFields::decode("[service: x] [PHONE: 1] bio");
        // extraction is case-sensitive, removal is not
        assert_eq!(decoded.service, DEFAULT_SERVICE);
        assert_eq!(decoded.bio, "bio");
    }

    #[test]
    fn test_decode_older_note_format() {
        let note = "[Country: الأردن] [Province: إربد] [City: الحصن] [Phone: 0771111111] [Comm: whatsapp] Need a plumber";
        let decoded = NoteFields::decode(note);
        assert_eq!(decoded.province, "إربد");
        assert_eq!(decoded.area, "الحصن");
        assert_eq!(decoded.phone, "0771111111");
        assert_eq!(decoded.bio, "Need a plumber");
        assert_eq!(ContactPreference::from_note(note), ContactPreference::WhatsApp);
        assert_eq!(legacy_country(note).as_deref(), Some("الأردن"));
    }

    #[test]
    fn test_contact_preference_defaults_to_call() {
        assert_eq!(ContactPreference::from_note(&sample().encode().unwrap()), ContactPreference::Call);
        assert_eq!(ContactPreference::from_note("[Comm: sms] x"), ContactPreference::Call);
        assert!(legacy_country("[Area: خلدا] x").is_none());
    }

    #[test]
    fn test_area_tag_wins_over_city() {
        let decoded = NoteFields::decode("[Area: خلدا] [City: عمان] bio");
        assert_eq!(decoded.area, "خلدا");
    }

    #[test]
    fn test_encode_rejects_brackets() {
        let mut fields = sample();
        fields.area = "Downtown [north]".to_string();
        let err = fields.encode().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_validate_reports_missing_fields() {
        let mut fields = sample();
        fields.phone = "  ".to_string();
        fields.bio = String::new();
        let err = fields.validate().unwrap_err();
        assert!(err.to_string().contains("phone, bio"));
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_filter_matches_exact_values() {
        let fields = sample();
        let mut filter = NoteFilter::default();
        assert!(fields.matches(&filter));

        filter.province = Some("عمان".to_string());
        assert!(fields.matches(&filter));

        filter.area = Some("عبدون".to_string());
        assert!(!fields.matches(&filter));
    }
}
