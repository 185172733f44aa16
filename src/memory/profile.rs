//! Structured user profile with a closed attribute set.
//!
//! The policy is strict: an unrecognized key is an error both when
//! updating and when loading a persisted profile.

use crate::{MemoryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Recognized profile attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKey {
    UserId,
    PreferredChartTypes,
    ColorScheme,
    Domain,
    Audience,
}

impl ProfileKey {
    pub const ALL: [ProfileKey; 5] = [
        ProfileKey::UserId,
        ProfileKey::PreferredChartTypes,
        ProfileKey::ColorScheme,
        ProfileKey::Domain,
        ProfileKey::Audience,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserId => "user_id",
            Self::PreferredChartTypes => "preferred_chart_types",
            Self::ColorScheme => "color_scheme",
            Self::Domain => "domain",
            Self::Audience => "audience",
        }
    }

    /// Tag that lets a memory note override this attribute.
    ///
    /// `user_id` is never overridden.
    pub fn keyword(&self) -> Option<&'static str> {
        match self {
            Self::UserId => None,
            Self::PreferredChartTypes => Some("chart_type"),
            Self::ColorScheme => Some("color"),
            Self::Domain => Some("domain"),
            Self::Audience => Some("audience"),
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Self::PreferredChartTypes)
    }

    /// Keys a note can override, in rendering order.
    pub fn overridable() -> impl Iterator<Item = ProfileKey> {
        Self::ALL.into_iter().filter(|k| k.keyword().is_some())
    }
}

impl FromStr for ProfileKey {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "user_id" => Ok(Self::UserId),
            "preferred_chart_types" => Ok(Self::PreferredChartTypes),
            "color_scheme" | "default_color_scheme" => Ok(Self::ColorScheme),
            "domain" | "industry" => Ok(Self::Domain),
            "audience" | "audience_level" => Ok(Self::Audience),
            other => Err(MemoryError::UnknownAttribute(other.to_string())),
        }
    }
}

impl fmt::Display for ProfileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A profile value: always a string or an ordered list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileValue {
    Text(String),
    List(Vec<String>),
}

impl ProfileValue {
    /// Interpret raw tool input for `key`: list keys split on commas.
    pub fn from_input(key: ProfileKey, raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(MemoryError::Validation(format!("value for {} must not be empty", key)));
        }
        if key.is_list() {
            let items: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if items.is_empty() {
                return Err(MemoryError::Validation(format!("value for {} has no items", key)));
            }
            Ok(Self::List(items))
        } else {
            Ok(Self::Text(raw.to_string()))
        }
    }

    /// Render as a YAML scalar or flow sequence.
    pub fn to_yaml(&self) -> String {
        match self {
            Self::Text(s) => yaml_quote(s),
            Self::List(items) => format!(
                "[{}]",
                items.iter().map(|s| yaml_quote(s)).collect::<Vec<_>>().join(", ")
            ),
        }
    }
}

impl fmt::Display for ProfileValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::List(items) => f.write_str(&items.join(", ")),
        }
    }
}

fn yaml_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Mapping from recognized keys to values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Profile {
    values: BTreeMap<ProfileKey, ProfileValue>,
}

impl Profile {
    /// Default profile: only the user id.
    pub fn for_user(user_id: &str) -> Self {
        let mut values = BTreeMap::new();
        values.insert(ProfileKey::UserId, ProfileValue::Text(user_id.to_string()));
        Self { values }
    }

    pub fn get(&self, key: ProfileKey) -> Option<&ProfileValue> {
        self.values.get(&key)
    }

    /// Set a value. Returns the previous value.
    pub fn set(&mut self, key: ProfileKey, value: ProfileValue) -> Option<ProfileValue> {
        self.values.insert(key, value)
    }

    /// Entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (ProfileKey, &ProfileValue)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_parsing_and_aliases() {
        assert_eq!("domain".parse::<ProfileKey>().unwrap(), ProfileKey::Domain);
        assert_eq!("Industry".parse::<ProfileKey>().unwrap(), ProfileKey::Domain);
        assert_eq!("audience_level".parse::<ProfileKey>().unwrap(), ProfileKey::Audience);
        assert_eq!(
            "default_color_scheme".parse::<ProfileKey>().unwrap(),
            ProfileKey::ColorScheme
        );
        assert!(matches!(
            "favorite_food".parse::<ProfileKey>(),
            Err(MemoryError::UnknownAttribute(k)) if k == "favorite_food"
        ));
    }

    #[test]
    fn test_list_value_from_input() {
        let v = ProfileValue::from_input(ProfileKey::PreferredChartTypes, "bar, line,,").unwrap();
        assert_eq!(v, ProfileValue::List(vec!["bar".into(), "line".into()]));
        let v = ProfileValue::from_input(ProfileKey::Domain, " finance ").unwrap();
        assert_eq!(v, ProfileValue::Text("finance".into()));
        assert!(ProfileValue::from_input(ProfileKey::Domain, "  ").is_err());
    }

    #[test]
    fn test_profile_serialization_is_flat() {
        let mut profile = Profile::for_user("u1");
        profile.set(ProfileKey::PreferredChartTypes, ProfileValue::List(vec!["bar".into()]));
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["user_id"], "u1");
        assert_eq!(json["preferred_chart_types"][0], "bar");
    }

    #[test]
    fn test_unknown_key_fails_to_deserialize() {
        let res = serde_json::from_str::<Profile>(r#"{"user_id":"u1","mood":"happy"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_yaml_rendering() {
        assert_eq!(ProfileValue::Text("say \"hi\"".into()).to_yaml(), "\"say \\\"hi\\\"\"");
        assert_eq!(
            ProfileValue::List(vec!["bar".into(), "line".into()]).to_yaml(),
            "[\"bar\", \"line\"]"
        );
    }

    #[test]
    fn test_overridable_excludes_user_id() {
        let keys: Vec<_> = ProfileKey::overridable().collect();
        assert_eq!(keys.len(), 4);
        assert!(!keys.contains(&ProfileKey::UserId));
    }
}
