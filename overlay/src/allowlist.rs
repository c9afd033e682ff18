//! Allow-list store (component B): parses and emits the `authorized_keys`
//! file and provides atomic, whole-file rewrites.
//!
//! Per the allow-list edit model design note, the file is represented as an
//! ordered list of records rather than edited with line-level string
//! surgery: every write reads the current file, mutates the in-memory
//! record list, reserializes the whole thing to a sibling temp file, and
//! atomically renames it into place.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{OverlayError, Result};
use crate::identity::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Member,
}

impl Default for Role {
    fn default() -> Self {
        Role::Member
    }
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }

    fn parse(s: &str) -> Option<Role> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "member" => Some(Role::Member),
            _ => None,
        }
    }
}

/// One allow-list entry. `expires_at` is a Unix timestamp (seconds) when
/// present; the on-disk representation carries it as RFC3339.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowListEntry {
    pub peer_id: PeerId,
    pub comment: Option<String>,
    pub role: Role,
    pub group_id: Option<String>,
    pub verification_tag: Option<String>,
    pub expires_at: Option<i64>,
}

impl AllowListEntry {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            comment: None,
            role: Role::Member,
            group_id: None,
            verification_tag: None,
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now_unix: i64) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now_unix)
    }

    fn to_line(&self) -> String {
        let mut attrs = Vec::new();
        if let Some(c) = &self.comment {
            attrs.push(format!("comment={}", escape_value(c)));
        }
        if self.role != Role::Member {
            attrs.push(format!("role={}", self.role.as_str()));
        }
        if let Some(g) = &self.group_id {
            attrs.push(format!("group={}", g));
        }
        if let Some(v) = &self.verification_tag {
            attrs.push(format!("verified={}", v));
        }
        if let Some(exp) = self.expires_at {
            attrs.push(format!("expires={}", unix_to_rfc3339(exp)));
        }
        if attrs.is_empty() {
            self.peer_id.0.clone()
        } else {
            format!("{} # {}", self.peer_id.0, attrs.join(", "))
        }
    }

    fn from_line(line: &str) -> Result<Option<Self>> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(None);
        }

        let (id_part, attr_part) = match trimmed.split_once('#') {
            Some((id, attrs)) => (id.trim(), Some(attrs.trim())),
            None => (trimmed, None),
        };

        let peer_id: PeerId = id_part.parse().map_err(|_| {
            OverlayError::configuration(format!("malformed peer id in allow-list: '{id_part}'"))
        })?;

        let mut entry = AllowListEntry::new(peer_id);
        if let Some(attrs) = attr_part {
            for raw in attrs.split(',') {
                let raw = raw.trim();
                if raw.is_empty() {
                    continue;
                }
                let (key, value) = raw.split_once('=').unwrap_or((raw, ""));
                let key = key.trim().to_ascii_lowercase();
                let value = value.trim();
                match key.as_str() {
                    "comment" => entry.comment = Some(unescape_value(value)),
                    "role" => {
                        entry.role = Role::parse(value).ok_or_else(|| {
                            OverlayError::configuration(format!("unknown role '{value}'"))
                        })?;
                    }
                    "group" => entry.group_id = Some(value.to_string()),
                    "verified" => entry.verification_tag = Some(value.to_string()),
                    "expires" => {
                        entry.expires_at = Some(rfc3339_to_unix(value)?);
                    }
                    _ => {} // unknown attribute keys are ignored, not rejected
                }
            }
        }
        Ok(Some(entry))
    }
}

fn escape_value(s: &str) -> String {
    s.replace(',', "\\,")
}

fn unescape_value(s: &str) -> String {
    s.replace("\\,", ",")
}

fn unix_to_rfc3339(unix: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(unix, 0)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string())
}

fn rfc3339_to_unix(s: &str) -> Result<i64> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp())
        .map_err(|e| OverlayError::configuration(format!("malformed expires timestamp '{s}': {e}")))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Parse/emit/mutate the allow-list file.
pub struct AllowListStore {
    path: PathBuf,
}

impl AllowListStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the current on-disk contents, in file order. A missing file is
    /// treated as an empty allow-list (the daemon may not have paired with
    /// anyone yet).
    pub fn load(&self) -> Result<Vec<AllowListEntry>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(OverlayError::configuration(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )))
            }
        };
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Vec<AllowListEntry>> {
        let mut entries = Vec::new();
        for line in text.lines() {
            if let Some(entry) = AllowListEntry::from_line(line)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub fn emit(entries: &[AllowListEntry]) -> String {
        let mut out = String::new();
        for entry in entries {
            out.push_str(&entry.to_line());
            out.push('\n');
        }
        out
    }

    /// Atomically rewrite the file: temp file in the same directory, then
    /// rename. Malformed ids in `entries` are rejected before anything is
    /// written, so a bad mutation can never clobber a good file.
    fn write_all(&self, entries: &[AllowListEntry]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .map_err(|e| OverlayError::configuration(format!("cannot create {}: {e}", dir.display())))?;

        let contents = Self::emit(entries);
        let tmp_path = dir.join(format!(
            ".{}.tmp-{}",
            self.path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("authorized_keys"),
            std::process::id()
        ));

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp_path)
                .map_err(|e| OverlayError::configuration(format!("cannot create temp file: {e}")))?;
            use std::io::Write;
            file.write_all(contents.as_bytes())
                .map_err(|e| OverlayError::configuration(format!("cannot write temp file: {e}")))?;
        }
        #[cfg(not(unix))]
        {
            fs::write(&tmp_path, &contents)
                .map_err(|e| OverlayError::configuration(format!("cannot write temp file: {e}")))?;
        }

        fs::rename(&tmp_path, &self.path)
            .map_err(|e| OverlayError::configuration(format!("cannot rename into place: {e}")))?;
        Ok(())
    }

    /// Idempotent add: if `peer_id` is already present, update its comment
    /// and role in place (still via remove+re-add at the record level) and
    /// otherwise succeed without duplicating.
    pub fn add_peer(
        &self,
        peer_id: PeerId,
        comment: Option<String>,
        role: Role,
        group_id: Option<String>,
    ) -> Result<()> {
        let mut entries = self.load()?;
        if let Some(existing) = entries.iter_mut().find(|e| e.peer_id == peer_id) {
            existing.comment = comment.or_else(|| existing.comment.clone());
            existing.role = role;
            if group_id.is_some() {
                existing.group_id = group_id;
            }
        } else {
            let mut entry = AllowListEntry::new(peer_id);
            entry.comment = comment;
            entry.role = role;
            entry.group_id = group_id;
            entries.push(entry);
        }
        self.write_all(&entries)
    }

    pub fn remove_peer(&self, peer_id: &PeerId) -> Result<bool> {
        let mut entries = self.load()?;
        let before = entries.len();
        entries.retain(|e| &e.peer_id != peer_id);
        let removed = entries.len() != before;
        if removed {
            self.write_all(&entries)?;
        }
        Ok(removed)
    }

    /// The set of peer ids currently authorized (not expired), as consulted
    /// by the gater.
    pub fn authorized_set(&self) -> Result<std::collections::HashSet<PeerId>> {
        let now = now_unix();
        Ok(self
            .load()?
            .into_iter()
            .filter(|e| !e.is_expired(now))
            .map(|e| e.peer_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_peer(seed: u8) -> PeerId {
        PeerId(hex::encode([seed; 32]))
    }

    #[test]
    fn round_trip_preserves_entry_set() {
        let mut a = AllowListEntry::new(sample_peer(1));
        a.comment = Some("laptop".into());
        a.role = Role::Admin;
        let mut b = AllowListEntry::new(sample_peer(2));
        b.expires_at = Some(1_700_000_000);

        let text = AllowListStore::emit(&[a.clone(), b.clone()]);
        let parsed = AllowListStore::parse(&text).unwrap();

        assert_eq!(parsed, vec![a, b]);
    }

    #[test]
    fn comment_only_and_blank_lines_are_ignored() {
        let text = "# a comment\n\n   \n# another\n";
        let parsed = AllowListStore::parse(text).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn malformed_peer_id_is_rejected() {
        let err = AllowListStore::parse("not-a-valid-id\n").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn add_peer_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = AllowListStore::new(dir.path().join("authorized_keys"));

        store
            .add_peer(sample_peer(1), Some("laptop".into()), Role::Member, None)
            .unwrap();
        store
            .add_peer(sample_peer(1), Some("updated".into()), Role::Admin, None)
            .unwrap();

        let entries = store.load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].comment.as_deref(), Some("updated"));
        assert_eq!(entries[0].role, Role::Admin);
    }

    #[test]
    fn remove_peer_rewrites_atomically() {
        let dir = tempdir().unwrap();
        let store = AllowListStore::new(dir.path().join("authorized_keys"));
        store.add_peer(sample_peer(1), None, Role::Member, None).unwrap();
        store.add_peer(sample_peer(2), None, Role::Member, None).unwrap();

        assert!(store.remove_peer(&sample_peer(1)).unwrap());
        assert!(!store.remove_peer(&sample_peer(1)).unwrap());

        let entries = store.load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].peer_id, sample_peer(2));
    }

    #[test]
    #[cfg(unix)]
    fn rewritten_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        let store = AllowListStore::new(&path);
        store.add_peer(sample_peer(1), None, Role::Member, None).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn expired_entries_are_excluded_from_the_authorized_set() {
        let dir = tempdir().unwrap();
        let store = AllowListStore::new(dir.path().join("authorized_keys"));
        let mut entries = Vec::new();
        let mut expired = AllowListEntry::new(sample_peer(1));
        expired.expires_at = Some(1); // long past
        entries.push(expired);
        entries.push(AllowListEntry::new(sample_peer(2)));
        store.write_all(&entries).unwrap();

        let set = store.authorized_set().unwrap();
        assert!(!set.contains(&sample_peer(1)));
        assert!(set.contains(&sample_peer(2)));
    }

    #[test]
    fn missing_file_is_an_empty_allow_list() {
        let dir = tempdir().unwrap();
        let store = AllowListStore::new(dir.path().join("does-not-exist"));
        assert!(store.load().unwrap().is_empty());
    }
}
