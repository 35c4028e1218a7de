// ABOUTME: Table selection for a sync run
// ABOUTME: Intersects both schemas, then applies include and exclude lists

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::config::SyncOptions;

/// Include/exclude rules applied to the tables common to both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableFilter {
    include: Option<BTreeSet<String>>,
    exclude: Option<BTreeSet<String>>,
}

impl TableFilter {
    /// Build a filter from raw lists. Blank entries are ignored and names are trimmed.
    pub fn new(include: Option<&[String]>, exclude: Option<&[String]>) -> Self {
        fn normalize(values: Option<&[String]>) -> Option<BTreeSet<String>> {
            let set: BTreeSet<String> = values?
                .iter()
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(String::from)
                .collect();
            if set.is_empty() {
                None
            } else {
                Some(set)
            }
        }

        Self {
            include: normalize(include),
            exclude: normalize(exclude),
        }
    }

    pub fn from_options(options: &SyncOptions) -> Self {
        Self::new(options.include.as_deref(), options.exclude.as_deref())
    }

    /// Creates an empty filter (sync every common table)
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_none() && self.exclude.is_none()
    }

    /// Determines if a table should be synchronized
    pub fn should_sync_table(&self, table: &str) -> bool {
        if let Some(ref include) = self.include {
            if !include.contains(table) {
                return false;
            }
        }
        if let Some(ref exclude) = self.exclude {
            if exclude.contains(table) {
                return false;
            }
        }
        true
    }

    /// Tables present on both sides that pass the filter, sorted by name.
    pub fn resolve<'a>(
        &self,
        source_tables: impl IntoIterator<Item = &'a str>,
        target_tables: impl IntoIterator<Item = &'a str>,
    ) -> Vec<String> {
        let target: BTreeSet<&str> = target_tables.into_iter().collect();
        let common: BTreeSet<&str> = source_tables
            .into_iter()
            .filter(|name| target.contains(name))
            .collect();

        common
            .into_iter()
            .filter(|name| self.should_sync_table(name))
            .map(String::from)
            .collect()
    }

    /// Returns a stable fingerprint for the filter configuration
    pub fn fingerprint(&self) -> String {
        fn hash_option_set(hasher: &mut Sha256, values: &Option<BTreeSet<String>>) {
            match values {
                Some(items) => {
                    for item in items {
                        hasher.update(item.as_bytes());
                        hasher.update(b"|");
                    }
                }
                None => hasher.update(b"<none>"),
            }
        }

        let mut hasher = Sha256::new();
        hash_option_set(&mut hasher, &self.include);
        hasher.update(b"#");
        hash_option_set(&mut hasher, &self.exclude);

        format!("{:x}", hasher.finalize())
    }
}
