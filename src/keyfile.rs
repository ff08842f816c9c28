//! INI-style key files: the repository config format.
//!
//! The on-disk contract is the classic keyfile dialect: `[group]` headers
//! (including quoted groups like `[remote "origin"]`), `key=value` pairs,
//! `#`/`;` comments, and `;`-separated string lists.  Group and key order is
//! preserved so that a parse/serialize cycle is stable.

use anyhow::{anyhow, Result};

use crate::RepoError;

/// One `[group]` section.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Group {
    name: String,
    entries: Vec<(String, String)>,
}

impl Group {
    fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn set(&mut self, key: &str, value: String) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key.to_string(), value));
        }
    }
}

/// A parsed key file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyFile {
    groups: Vec<Group>,
}

impl KeyFile {
    /// An empty key file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse key file data.
    pub fn parse(data: &str) -> Result<Self> {
        let mut r = Self::new();
        let mut current: Option<usize> = None;
        for (lineno, line) in data.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[') {
                let name = name
                    .strip_suffix(']')
                    .ok_or_else(|| anyhow!("line {}: unterminated group header", lineno + 1))?
                    .trim();
                if name.is_empty() {
                    return Err(anyhow!("line {}: empty group name", lineno + 1));
                }
                current = Some(r.group_index_or_insert(name));
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("line {}: expected key=value", lineno + 1))?;
            let idx = current
                .ok_or_else(|| anyhow!("line {}: key outside of any group", lineno + 1))?;
            r.groups[idx]
                .entries
                .push((key.trim().to_string(), value.trim().to_string()));
        }
        Ok(r)
    }

    fn group_index_or_insert(&mut self, name: &str) -> usize {
        if let Some(i) = self.groups.iter().position(|g| g.name == name) {
            return i;
        }
        self.groups.push(Group {
            name: name.to_string(),
            entries: Vec::new(),
        });
        self.groups.len() - 1
    }

    /// Serialize back to key file data.
    pub fn to_data(&self) -> String {
        let mut out = String::new();
        for (i, group) in self.groups.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(&format!("[{}]\n", group.name));
            for (k, v) in &group.entries {
                out.push_str(&format!("{k}={v}\n"));
            }
        }
        out
    }

    /// The group names, in file order.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.name.as_str())
    }

    /// Whether the group exists.
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g.name == group)
    }

    /// Get a string value; a missing group or key is an error.
    pub fn string(&self, group: &str, key: &str) -> Result<String> {
        self.optional_string(group, key)?
            .ok_or_else(|| RepoError::not_found(format!("key '{key}' in group '{group}'")))
    }

    /// Get a string value, or `None` if the group or key does not exist.
    pub fn optional_string(&self, group: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .groups
            .iter()
            .find(|g| g.name == group)
            .and_then(|g| g.get(key))
            .map(|v| v.to_string()))
    }

    /// Get a string value with a default.
    pub fn string_with_default(&self, group: &str, key: &str, default: &str) -> String {
        self.optional_string(group, key)
            .ok()
            .flatten()
            .unwrap_or_else(|| default.to_string())
    }

    /// Get a boolean value, or `None` if the group or key does not exist.
    /// A present key with a non-boolean value is an error.
    pub fn optional_bool(&self, group: &str, key: &str) -> Result<Option<bool>> {
        match self.optional_string(group, key)? {
            None => Ok(None),
            Some(v) => match v.as_str() {
                "true" | "1" => Ok(Some(true)),
                "false" | "0" => Ok(Some(false)),
                o => Err(anyhow!("key '{group}.{key}': invalid boolean value '{o}'")),
            },
        }
    }

    /// Get a boolean value with a default.
    pub fn bool_with_default(&self, group: &str, key: &str, default: bool) -> Result<bool> {
        Ok(self.optional_bool(group, key)?.unwrap_or(default))
    }

    /// Get a `;`-separated string list, or `None` if absent.
    pub fn optional_string_list(&self, group: &str, key: &str) -> Result<Option<Vec<String>>> {
        Ok(self.optional_string(group, key)?.map(|v| {
            v.split(';')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect()
        }))
    }

    /// Set a string value, creating the group if needed.
    pub fn set_string(&mut self, group: &str, key: &str, value: &str) {
        let idx = self.group_index_or_insert(group);
        self.groups[idx].set(key, value.to_string());
    }

    /// Set a boolean value, creating the group if needed.
    pub fn set_bool(&mut self, group: &str, key: &str, value: bool) {
        self.set_string(group, key, if value { "true" } else { "false" });
    }

    /// Set a string list value, creating the group if needed.
    pub fn set_string_list(&mut self, group: &str, key: &str, values: &[String]) {
        let mut joined = values.join(";");
        if !joined.is_empty() {
            joined.push(';');
        }
        self.set_string(group, key, &joined);
    }

    /// Remove a whole group; returns whether it was present.
    pub fn remove_group(&mut self, group: &str) -> bool {
        let before = self.groups.len();
        self.groups.retain(|g| g.name != group);
        self.groups.len() != before
    }

    /// Remove one key; returns whether it was present.
    pub fn remove_key(&mut self, group: &str, key: &str) -> bool {
        if let Some(g) = self.groups.iter_mut().find(|g| g.name == group) {
            let before = g.entries.len();
            g.entries.retain(|(k, _)| k != key);
            return g.entries.len() != before;
        }
        false
    }

    /// Copy every entry of `group` in `self` into `dest` under the same name.
    pub fn copy_group_into(&self, group: &str, dest: &mut KeyFile) {
        if let Some(g) = self.groups.iter().find(|g| g.name == group) {
            for (k, v) in &g.entries {
                dest.set_string(group, k, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const EXAMPLE: &str = indoc! { r#"
        # repository configuration
        [core]
        repo_version=1
        mode=bare-user

        [remote "origin"]
        url=https://example.com/repo
        gpg-verify=false
        branches=main;stable;
    "# };

    #[test]
    fn test_parse() {
        let kf = KeyFile::parse(EXAMPLE).unwrap();
        assert_eq!(kf.string("core", "repo_version").unwrap(), "1");
        assert_eq!(kf.string("core", "mode").unwrap(), "bare-user");
        assert_eq!(
            kf.string(r#"remote "origin""#, "url").unwrap(),
            "https://example.com/repo"
        );
        assert_eq!(
            kf.optional_bool(r#"remote "origin""#, "gpg-verify").unwrap(),
            Some(false)
        );
        assert_eq!(
            kf.optional_string_list(r#"remote "origin""#, "branches")
                .unwrap()
                .unwrap(),
            vec!["main".to_string(), "stable".to_string()]
        );
    }

    #[test]
    fn test_optional() {
        let kf = KeyFile::parse(EXAMPLE).unwrap();
        assert_eq!(kf.optional_string("core", "missing").unwrap(), None);
        assert_eq!(kf.optional_string("nogroup", "missing").unwrap(), None);
        assert!(kf.string("core", "missing").is_err());
        let e = kf.string("core", "missing").unwrap_err();
        assert!(e.downcast_ref::<crate::RepoError>().is_some());
    }

    #[test]
    fn test_bad_boolean() {
        let kf = KeyFile::parse("[core]\nfsync=maybe\n").unwrap();
        assert!(kf.optional_bool("core", "fsync").is_err());
    }

    #[test]
    fn test_roundtrip_and_mutation() {
        let mut kf = KeyFile::parse(EXAMPLE).unwrap();
        kf.set_string("core", "mode", "archive-z2");
        kf.set_bool("core", "tombstone-commits", true);
        assert!(kf.remove_group(r#"remote "origin""#));
        assert!(!kf.remove_group(r#"remote "origin""#));

        let reparsed = KeyFile::parse(&kf.to_data()).unwrap();
        assert_eq!(reparsed, kf);
        assert_eq!(reparsed.string("core", "mode").unwrap(), "archive-z2");
        assert!(!reparsed.has_group(r#"remote "origin""#));
    }

    #[test]
    fn test_parse_errors() {
        assert!(KeyFile::parse("[core\n").is_err());
        assert!(KeyFile::parse("key=value\n").is_err());
        assert!(KeyFile::parse("[core]\nnot a pair\n").is_err());
    }
}
