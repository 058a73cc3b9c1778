//! # Reward Catalogs
//!
//! The card and item catalogs are external data. A mine's distribution map
//! may name anything; only names present in the matching catalog are
//! eligible for the card or item channel.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MiningError, MiningResult};

/// Which reward channel a catalog lookup is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RewardKind {
    /// Spell cards.
    Card,
    /// Inventory items.
    Item,
}

/// Card and item catalogs with the default weight each entry gets in a new
/// mine's distribution map.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    /// Card name to default weight.
    pub cards: BTreeMap<String, f64>,
    /// Item name to default weight.
    pub items: BTreeMap<String, f64>,
}

impl Catalog {
    /// Builds a catalog from `(name, weight)` pairs.
    #[must_use]
    pub fn new<C, I, S>(cards: C, items: I) -> Self
    where
        C: IntoIterator<Item = (S, f64)>,
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            cards: cards.into_iter().map(|(n, w)| (n.into(), w)).collect(),
            items: items.into_iter().map(|(n, w)| (n.into(), w)).collect(),
        }
    }

    /// Parses a catalog from TOML (`[cards]` and `[items]` tables).
    ///
    /// # Errors
    ///
    /// Returns [`MiningError::InvalidConfig`] on syntax errors or negative
    /// weights.
    #[allow(clippy::neg_cmp_op_on_partial_ord)]
    pub fn from_toml_str(source: &str) -> MiningResult<Self> {
        let catalog: Self =
            toml::from_str(source).map_err(|e| MiningError::InvalidConfig(e.to_string()))?;
        if let Some((name, weight)) = catalog
            .cards
            .iter()
            .chain(catalog.items.iter())
            .find(|(_, w)| !(**w >= 0.0))
        {
            return Err(MiningError::InvalidConfig(format!(
                "catalog entry {name} has invalid weight {weight}"
            )));
        }
        Ok(catalog)
    }

    /// Loads a catalog from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`MiningError::InvalidConfig`] if the file is unreadable or
    /// invalid.
    pub fn from_file(path: impl AsRef<Path>) -> MiningResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            MiningError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    /// Whether `name` belongs to the catalog of `kind`.
    #[inline]
    #[must_use]
    pub fn contains(&self, kind: RewardKind, name: &str) -> bool {
        match kind {
            RewardKind::Card => self.cards.contains_key(name),
            RewardKind::Item => self.items.contains_key(name),
        }
    }

    /// Distribution map for a newly opened mine.
    #[must_use]
    pub fn default_distributions(&self) -> BTreeMap<String, f64> {
        self.cards
            .iter()
            .chain(self.items.iter())
            .map(|(name, weight)| (name.clone(), *weight))
            .collect()
    }
}
