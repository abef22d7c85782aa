//! Known-user store.
//!
//! A small YAML file of facts about the people in the chat, keyed by
//! Telegram user id:
//!
//! ```yaml
//! 123456789:
//!   name: Alice
//!   description: Prefers short answers. Works on compilers.
//!   last_updated: 2026-03-01T12:00:00Z
//! ```
//!
//! The same file serves as hand-written pre-seed and as runtime state.
//! Entries are parsed one at a time, so a single broken record costs only
//! that record. Keys may be quoted (`"123":`).
//!
//! When a load skips anything, the file is copied to
//! `<name>.corrupt-<timestamp>` before the store can overwrite it, so a
//! typo never costs the records that could not be read.

use crate::bot::error::BotError;
use crate::bot::persist::atomic_write;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Map key in the file; not repeated inside the entry.
    #[serde(skip)]
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(
        default,
        alias = "last_updated_by_ai",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_updated: Option<DateTime<Utc>>,
}

impl UserProfile {
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            name: None,
            description: String::new(),
            last_updated: None,
        }
    }

    /// `- User ID 42 (Alice): likes tea`
    pub fn prompt_line(&self) -> String {
        let name_part = match &self.name {
            Some(name) if !name.is_empty() => format!(" ({name})"),
            _ => String::new(),
        };
        let description = if self.description.is_empty() {
            "No description available."
        } else {
            &self.description
        };
        format!("- User ID {}{name_part}: {description}", self.user_id)
    }
}

/// Fields to merge into a profile. `None` leaves the field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Outcome of reading the YAML file.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: usize,
    /// `StoreCorrupt` for every skipped entry, or the whole file when it
    /// is not a YAML mapping.
    pub skipped: Vec<BotError>,
    /// Copy of the file taken because something was skipped.
    pub backup: Option<PathBuf>,
}

pub struct UserStore {
    path: PathBuf,
    profiles: BTreeMap<i64, UserProfile>,
    dirty: bool,
}

impl UserStore {
    /// An empty store bound to `path`. Nothing is read.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            profiles: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Open the store at `path`, reading whatever valid entries it has.
    pub async fn load(path: impl Into<PathBuf>) -> Result<(Self, LoadReport)> {
        let mut store = Self::new(path);
        let report = store.reload().await?;
        Ok((store, report))
    }

    /// Re-read the file, replacing in-memory profiles. A missing file
    /// empties the store.
    pub async fn reload(&mut self) -> Result<LoadReport> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };

        let (profiles, mut report) = parse_profiles(&content);
        if !report.skipped.is_empty() {
            report.backup = Some(self.back_up().await?);
        }
        self.profiles = profiles;
        self.dirty = false;
        Ok(LoadReport {
            loaded: self.profiles.len(),
            ..report
        })
    }

    /// Copy the current file next to itself as `<name>.corrupt-<ts>`.
    async fn back_up(&self) -> Result<PathBuf> {
        let name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("known_users.yaml");
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let backup = self.path.with_file_name(format!("{name}.corrupt-{stamp}"));
        tokio::fs::copy(&self.path, &backup)
            .await
            .with_context(|| format!("Failed to back up {}", self.path.display()))?;
        Ok(backup)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn get(&self, user_id: i64) -> Option<&UserProfile> {
        self.profiles.get(&user_id)
    }

    /// Merge `update` into the profile, creating it if absent. Returns
    /// whether anything changed.
    pub fn upsert(&mut self, user_id: i64, update: ProfileUpdate) -> bool {
        let mut created = false;
        let profile = self.profiles.entry(user_id).or_insert_with(|| {
            created = true;
            UserProfile::new(user_id)
        });

        let mut changed = created;
        if let Some(name) = update.name {
            if profile.name.as_deref() != Some(name.as_str()) {
                profile.name = Some(name);
                changed = true;
            }
        }
        if let Some(description) = update.description {
            if profile.description != description {
                profile.description = description;
                changed = true;
            }
        }

        if changed {
            profile.last_updated = Some(Utc::now());
            self.dirty = true;
        }
        changed
    }

    /// Record a sender the first time they are seen. Existing profiles
    /// are left untouched.
    pub fn observe(&mut self, user_id: i64, display_name: Option<&str>) -> bool {
        if self.profiles.contains_key(&user_id) {
            return false;
        }
        let mut profile = UserProfile::new(user_id);
        profile.name = display_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        profile.last_updated = Some(Utc::now());
        self.profiles.insert(user_id, profile);
        self.dirty = true;
        true
    }

    /// Write every profile to disk atomically.
    pub async fn persist(&mut self) -> Result<()> {
        let yaml = serde_yaml::to_string(&self.profiles).context("Failed to serialize users")?;
        atomic_write(&self.path, yaml.as_bytes()).await?;
        self.dirty = false;
        Ok(())
    }

    /// Persist only when something changed since the last write. Returns
    /// whether a write happened.
    pub async fn persist_if_dirty(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        self.persist().await?;
        Ok(true)
    }

    /// Text placed inside `<known_users>` in the system prompt.
    pub fn prompt_section(&self) -> String {
        if self.profiles.is_empty() {
            return "No specific user information is currently known.".to_string();
        }
        let mut section = String::from("Known users in this chat:\n");
        for profile in self.profiles.values() {
            section.push_str(&profile.prompt_line());
            section.push('\n');
        }
        section
    }
}

/// Parse the YAML document entry by entry.
fn parse_profiles(content: &str) -> (BTreeMap<i64, UserProfile>, LoadReport) {
    let mut profiles = BTreeMap::new();
    let mut report = LoadReport::default();

    if content.trim().is_empty() {
        return (profiles, report);
    }

    let root: serde_yaml::Value = match serde_yaml::from_str(content) {
        Ok(v) => v,
        Err(e) => {
            report.skipped.push(BotError::StoreCorrupt {
                entry: "<file>".to_string(),
                reason: e.to_string(),
            });
            return (profiles, report);
        }
    };

    let mapping = match root {
        serde_yaml::Value::Mapping(m) => m,
        serde_yaml::Value::Null => return (profiles, report),
        other => {
            report.skipped.push(BotError::StoreCorrupt {
                entry: "<file>".to_string(),
                reason: format!("expected a mapping of user ids, found {}", yaml_kind(&other)),
            });
            return (profiles, report);
        }
    };

    for (key, value) in mapping {
        let user_id = match parse_user_id(&key) {
            Some(id) => id,
            None => {
                report.skipped.push(BotError::StoreCorrupt {
                    entry: describe_key(&key),
                    reason: "user id is not an integer".to_string(),
                });
                continue;
            }
        };

        // A bare key with no body is a user we know nothing about yet.
        let parsed = if value.is_null() {
            Ok(UserProfile::new(user_id))
        } else {
            serde_yaml::from_value::<UserProfile>(value)
        };

        match parsed {
            Ok(mut profile) => {
                profile.user_id = user_id;
                profiles.insert(user_id, profile);
            }
            Err(e) => report.skipped.push(BotError::StoreCorrupt {
                entry: user_id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    (profiles, report)
}

/// `123` or `"123"`.
fn parse_user_id(key: &serde_yaml::Value) -> Option<i64> {
    key.as_i64()
        .or_else(|| key.as_str().and_then(|s| s.trim().parse().ok()))
}

fn describe_key(key: &serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| yaml_kind(other).to_string()),
    }
}

fn yaml_kind(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "a boolean",
        serde_yaml::Value::Number(_) => "a number",
        serde_yaml::Value::String(_) => "a string",
        serde_yaml::Value::Sequence(_) => "a list",
        serde_yaml::Value::Mapping(_) => "a mapping",
        serde_yaml::Value::Tagged(_) => "a tagged value",
    }
}

// ── Tests ────────────────────────────────────────────────────────
