//! Ordered list of the photos a source currently offers.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::Error;
use crate::source::{PhotoId, PhotoSource};

/// How the index orders the photos it keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexOrder {
    /// Keep the order reported by the source.
    #[default]
    Source,
    /// Shuffle once per build.
    Shuffled,
}

/// Build options applied on every rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOptions {
    pub order: IndexOrder,
    pub shuffle_seed: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct PhotoIndex {
    ids: Vec<PhotoId>,
}

impl PhotoIndex {
    /// Enumerates `source`, keeping image entries only.
    ///
    /// An empty folder yields an empty index, not an error.
    pub fn build(source: &dyn PhotoSource, options: IndexOptions) -> Result<Self, Error> {
        let entries = source.list_images()?;
        let listed = entries.len();
        let mut ids: Vec<PhotoId> = entries
            .into_iter()
            .filter(|entry| entry.is_image())
            .map(|entry| entry.id)
            .collect();

        if options.order == IndexOrder::Shuffled {
            let seed = options.shuffle_seed.unwrap_or_else(rand::random);
            let mut rng = StdRng::seed_from_u64(seed);
            ids.shuffle(&mut rng);
            debug!(seed, "shuffled photo index");
        }

        info!(
            location = %source.location(),
            listed,
            photos = ids.len(),
            "photo index built"
        );
        Ok(Self { ids })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&PhotoId> {
        self.ids.get(position)
    }

    pub fn as_slice(&self) -> &[PhotoId] {
        &self.ids
    }
}
