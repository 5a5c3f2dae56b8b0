//! Unknown-key detection for `parlance.toml`.
//!
//! The raw text is parsed into a `toml::Value` before serde sees it. Keys
//! that match no field produce a warning, with the closest known key when
//! one is near enough to be a typo. Warnings never stop a config loading.

use std::collections::BTreeSet;
use std::fmt;

use super::PipelineConfig;

/// Largest edit distance still reported as a likely typo.
const MAX_SUGGESTION_DISTANCE: usize = 3;

/// Non-fatal config finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub key: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (did you mean '{suggestion}'?)")?;
        }
        Ok(())
    }
}

/// Every dotted key path `PipelineConfig` accepts.
///
/// Derived from a serialized default config, so new fields are picked up
/// without a hand-kept list.
pub fn known_config_keys() -> BTreeSet<String> {
    let value = toml::Value::try_from(PipelineConfig::default())
        .unwrap_or_else(|_| toml::Value::Table(toml::map::Map::new()));
    collect_key_paths(&value, "").into_iter().collect()
}

/// Dotted paths of every key in a TOML tree, tables included.
pub fn collect_key_paths(value: &toml::Value, prefix: &str) -> Vec<String> {
    let Some(table) = value.as_table() else {
        return Vec::new();
    };

    table
        .iter()
        .flat_map(|(key, child)| {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            let mut paths = vec![path.clone()];
            paths.extend(collect_key_paths(child, &path));
            paths
        })
        .collect()
}

/// Edit distance over chars.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = diagonal + usize::from(ca != cb);
            diagonal = row[j + 1];
            row[j + 1] = substitution.min(row[j] + 1).min(row[j + 1] + 1);
        }
    }
    row[b.len()]
}

/// Closest known key within `MAX_SUGGESTION_DISTANCE`, ties broken alphabetically.
pub fn closest_key<'a, I>(unknown: &str, known: I) -> Option<String>
where
    I: IntoIterator<Item = &'a String>,
{
    known
        .into_iter()
        .map(|candidate| (edit_distance(unknown, candidate), candidate))
        .filter(|(distance, _)| *distance <= MAX_SUGGESTION_DISTANCE)
        .min()
        .map(|(_, candidate)| candidate.clone())
}

/// Warnings for keys in `raw_toml` that `PipelineConfig` does not define.
///
/// Unparseable text yields no warnings; serde reports the parse error.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ConfigWarning> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new();
    };

    let known = known_config_keys();
    let found = collect_key_paths(&value, "");

    found
        .into_iter()
        // Children of an unknown table would each repeat the same warning.
        .filter(|key| {
            key.rsplit_once('.')
                .map_or(true, |(parent, _)| known.contains(parent))
        })
        .filter(|key| !known.contains(key))
        .map(|key| ConfigWarning {
            message: format!("Unknown config key '{key}'"),
            suggestion: closest_key(&key, &known),
            key,
        })
        .collect()
}
