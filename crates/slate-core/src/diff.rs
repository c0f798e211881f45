use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DomainError;

/// A partial update to a Scene's content fields. Produced by agent roles as
/// the `diff` payload of a proposal; also the shape of a manual edit.
/// Unset fields leave the scene unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneDiff {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narrative_goal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotional_beat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_of_day: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub characters: Option<Vec<String>>,
}

const STRING_FIELDS: [&str; 6] = [
    "title",
    "script",
    "narrative_goal",
    "emotional_beat",
    "location",
    "time_of_day",
];

impl SceneDiff {
    /// Parse a stored diff payload. Structural problems (not an object, a
    /// recognized field with the wrong type) are `MalformedDiff`; keys the
    /// diff vocabulary doesn't know are ignored, so a diff with no
    /// recognized fields parses as empty.
    pub fn from_value(value: &Value) -> Result<Self, DomainError> {
        let obj = value
            .as_object()
            .ok_or_else(|| DomainError::MalformedDiff("diff payload is not an object".into()))?;

        let mut diff = SceneDiff::default();
        for field in STRING_FIELDS {
            if let Some(v) = obj.get(field) {
                let s = v.as_str().ok_or_else(|| {
                    DomainError::MalformedDiff(format!("field `{field}` must be a string"))
                })?;
                diff.set_string_field(field, s.to_owned());
            }
        }

        if let Some(v) = obj.get("characters") {
            let arr = v.as_array().ok_or_else(|| {
                DomainError::MalformedDiff("field `characters` must be an array".into())
            })?;
            let mut names = Vec::with_capacity(arr.len());
            for entry in arr {
                let name = entry.as_str().ok_or_else(|| {
                    DomainError::MalformedDiff("`characters` entries must be strings".into())
                })?;
                names.push(name.to_owned());
            }
            diff.characters = Some(names);
        }

        Ok(diff)
    }

    fn set_string_field(&mut self, field: &str, value: String) {
        match field {
            "title" => self.title = Some(value),
            "script" => self.script = Some(value),
            "narrative_goal" => self.narrative_goal = Some(value),
            "emotional_beat" => self.emotional_beat = Some(value),
            "location" => self.location = Some(value),
            "time_of_day" => self.time_of_day = Some(value),
            _ => unreachable!("not a string field: {field}"),
        }
    }

    /// True when the diff touches nothing. Applying an empty diff is a
    /// no-op for the scene (no version bump, no event).
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.script.is_none()
            && self.narrative_goal.is_none()
            && self.emotional_beat.is_none()
            && self.location.is_none()
            && self.time_of_day.is_none()
            && self.characters.is_none()
    }

    /// Names of the fields this diff would change, for event payloads.
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.title.is_some() {
            fields.push("title");
        }
        if self.script.is_some() {
            fields.push("script");
        }
        if self.narrative_goal.is_some() {
            fields.push("narrative_goal");
        }
        if self.emotional_beat.is_some() {
            fields.push("emotional_beat");
        }
        if self.location.is_some() {
            fields.push("location");
        }
        if self.time_of_day.is_some() {
            fields.push("time_of_day");
        }
        if self.characters.is_some() {
            fields.push("characters");
        }
        fields
    }

    /// Reject character lists that name the same character twice.
    /// Comparison is case-insensitive on the trimmed name.
    pub fn validate(&self) -> Result<(), DomainError> {
        if let Some(characters) = &self.characters {
            let mut seen = std::collections::HashSet::new();
            for name in characters {
                let key = name.trim().to_lowercase();
                if !seen.insert(key) {
                    return Err(DomainError::DuplicateCharacterName(name.clone()));
                }
            }
        }
        Ok(())
    }
}
