//! profile.json reader for static user personalization

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Static personalization data about the user
///
/// Read-only once loaded. Conversations freeze a copy at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub profession: Option<String>,
    #[serde(default)]
    pub interests: Vec<String>,
    /// Free-form notes, forwarded to the model verbatim
    #[serde(default)]
    pub memory: Vec<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: "User".to_string(),
            age: Some(20),
            profession: Some("unset".to_string()),
            interests: vec!["unset".to_string()],
            memory: Vec::new(),
        }
    }
}

/// On-disk wrapper: `{ "my_profile": { ... } }`
#[derive(Debug, Serialize, Deserialize)]
struct ProfileFile {
    my_profile: Profile,
}

impl Profile {
    /// Render the fixed preamble sent as the system message of every request
    #[must_use]
    pub fn preamble(&self) -> String {
        let mut parts = vec![format!("You are talking with {}.", self.name)];

        if let Some(age) = self.age {
            parts.push(format!("Age: {age}"));
        }
        if let Some(profession) = &self.profession {
            parts.push(format!("Profession: {profession}"));
        }
        if !self.interests.is_empty() {
            parts.push(format!("Interests: {}", self.interests.join(", ")));
        }
        if !self.memory.is_empty() {
            let notes: Vec<String> = self.memory.iter().map(|m| format!("- {m}")).collect();
            parts.push(format!("Things to remember:\n{}", notes.join("\n")));
        }

        parts.join("\n")
    }
}

/// Reader for profile.json files
pub struct ProfileReader;

impl ProfileReader {
    /// Read a profile, writing the default profile when the file is missing
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be parsed, or the default
    /// cannot be written
    pub fn read_or_init<P: AsRef<Path>>(path: P) -> Result<Profile> {
        let path = path.as_ref();

        if !path.exists() {
            let profile = Profile::default();
            let content = serde_json::to_string_pretty(&ProfileFile {
                my_profile: profile.clone(),
            })?;
            std::fs::write(path, content)
                .map_err(|e| Error::Profile(format!("failed to write default profile: {e}")))?;
            tracing::warn!(path = %path.display(), "profile not found, wrote default profile");
            return Ok(profile);
        }

        Self::read(path)
    }

    /// Read and parse a profile.json file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Profile> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Profile(format!("failed to read profile: {e}")))?;

        let file: ProfileFile = serde_json::from_str(&content)
            .map_err(|e| Error::Profile(format!("failed to parse profile: {e}")))?;

        tracing::debug!(path = %path.display(), "loaded profile");
        Ok(file.my_profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_wrapped_profile() {
        let json = r#"{
            "my_profile": {
                "name": "Lin",
                "age": 31,
                "profession": "Engineer",
                "interests": ["hiking", "rust"],
                "memory": ["allergic to peanuts"]
            }
        }"#;
        let file: ProfileFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.my_profile.name, "Lin");
        assert_eq!(file.my_profile.interests, vec!["hiking", "rust"]);
    }

    #[test]
    fn preamble_includes_fields() {
        let profile = Profile {
            name: "Lin".to_string(),
            age: Some(31),
            profession: Some("Engineer".to_string()),
            interests: vec!["hiking".to_string(), "rust".to_string()],
            memory: vec!["allergic to peanuts".to_string()],
        };
        let preamble = profile.preamble();

        assert!(preamble.starts_with("You are talking with Lin."));
        assert!(preamble.contains("Age: 31"));
        assert!(preamble.contains("Profession: Engineer"));
        assert!(preamble.contains("Interests: hiking, rust"));
        assert!(preamble.contains("- allergic to peanuts"));
    }

    #[test]
    fn preamble_omits_empty_memory() {
        let profile = Profile {
            memory: Vec::new(),
            ..Profile::default()
        };
        assert!(!profile.preamble().contains("Things to remember"));
    }

    #[test]
    fn missing_file_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");

        let profile = ProfileReader::read_or_init(&path).unwrap();
        assert_eq!(profile, Profile::default());
        assert!(path.exists());

        let reread = ProfileReader::read(&path).unwrap();
        assert_eq!(reread, profile);
    }

    #[test]
    fn malformed_file_is_profile_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = ProfileReader::read_or_init(&path).unwrap_err();
        assert!(matches!(err, Error::Profile(_)));
    }
}
