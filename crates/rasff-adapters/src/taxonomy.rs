//! Static category lookup tables and the classifier built on them.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use rasff_core::ClassificationPair;
use serde::Deserialize;

const BUILTIN_PRODUCT_RULES: &str = include_str!("../../../rules/product_categories.yaml");
const BUILTIN_HAZARD_RULES: &str = include_str!("../../../rules/hazard_categories.yaml");

pub const PRODUCT_RULES_FILE: &str = "product_categories.yaml";
pub const HAZARD_RULES_FILE: &str = "hazard_categories.yaml";

#[derive(Debug, Clone, Deserialize)]
struct CategoryRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<CategoryRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryRule {
    term: String,
    category: String,
    group: String,
}

/// Lower-cased term -> `(specific, group)`. Read-only once built.
#[derive(Debug, Clone, Default)]
pub struct CategoryTable {
    entries: HashMap<String, ClassificationPair>,
}

impl CategoryTable {
    pub fn from_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, ClassificationPair)>,
        K: AsRef<str>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(term, pair)| (lookup_key(term.as_ref()), pair))
                .collect(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: CategoryRulesFile = serde_yaml::from_str(text).context("parsing category rules")?;
        Ok(Self::from_entries(file.rules.into_iter().map(|rule| {
            (rule.term, ClassificationPair::new(rule.category, rule.group))
        })))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unknown, empty and missing terms all fall back to `Unknown/Unknown`.
    pub fn lookup(&self, raw: Option<&str>) -> ClassificationPair {
        let Some(raw) = raw else {
            return ClassificationPair::unknown();
        };
        let key = lookup_key(raw);
        if key.is_empty() {
            return ClassificationPair::unknown();
        }
        self.entries
            .get(&key)
            .cloned()
            .unwrap_or_else(ClassificationPair::unknown)
    }
}

fn lookup_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub fn classify(raw: Option<&str>, table: &CategoryTable) -> ClassificationPair {
    table.lookup(raw)
}

/// Product and hazard tables injected into the normalizer.
#[derive(Debug, Clone, Default)]
pub struct Taxonomy {
    pub products: CategoryTable,
    pub hazards: CategoryTable,
}

impl Taxonomy {
    pub fn new(products: CategoryTable, hazards: CategoryTable) -> Self {
        Self { products, hazards }
    }

    /// Tables compiled from the `rules/` directory at build time.
    pub fn builtin() -> Result<Self> {
        Ok(Self {
            products: CategoryTable::from_yaml_str(BUILTIN_PRODUCT_RULES)
                .context("built-in product categories")?,
            hazards: CategoryTable::from_yaml_str(BUILTIN_HAZARD_RULES)
                .context("built-in hazard categories")?,
        })
    }

    pub fn from_rules_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            products: CategoryTable::from_yaml_file(dir.join(PRODUCT_RULES_FILE))?,
            hazards: CategoryTable::from_yaml_file(dir.join(HAZARD_RULES_FILE))?,
        })
    }
}
