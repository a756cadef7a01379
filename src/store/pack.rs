//! Card packs: the scenario and response pools a store is seeded with.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use super::Store;
use crate::error::StoreResult;
use crate::types::{ResponseCard, Scenario};

const BUILTIN_PACK: &str = include_str!("../../data/default_pack.json");

#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("failed to read card pack: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse card pack: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("card pack has no {0}")]
    Empty(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSeed {
    pub category: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardPack {
    pub scenarios: Vec<ScenarioSeed>,
    pub responses: Vec<String>,
}

impl CardPack {
    /// The pack compiled into the binary
    pub fn builtin() -> Result<Self, PackError> {
        Self::parse(BUILTIN_PACK)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PackError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    fn parse(raw: &str) -> Result<Self, PackError> {
        let mut pack: CardPack = serde_json::from_str(raw)?;
        pack.normalize();
        if pack.scenarios.is_empty() {
            return Err(PackError::Empty("scenarios"));
        }
        if pack.responses.is_empty() {
            return Err(PackError::Empty("responses"));
        }
        Ok(pack)
    }

    /// Trim whitespace, drop blank entries and exact duplicate responses
    fn normalize(&mut self) {
        self.scenarios.retain_mut(|s| {
            s.category = s.category.trim().to_string();
            s.text = s.text.trim().to_string();
            !s.category.is_empty() && !s.text.is_empty()
        });

        let mut seen = HashSet::new();
        self.responses = std::mem::take(&mut self.responses)
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty() && seen.insert(r.clone()))
            .collect();
    }

    /// Insert every scenario and response card. Returns (scenarios, responses).
    pub async fn seed(&self, store: &dyn Store) -> StoreResult<(usize, usize)> {
        for seed in &self.scenarios {
            store
                .insert_scenario(Scenario {
                    id: ulid::Ulid::new().to_string(),
                    category: seed.category.clone(),
                    text: seed.text.clone(),
                })
                .await?;
        }
        for text in &self.responses {
            store
                .insert_card(ResponseCard::new(text.clone(), None))
                .await?;
        }
        tracing::info!(
            scenarios = self.scenarios.len(),
            responses = self.responses.len(),
            "Card pack seeded"
        );
        Ok((self.scenarios.len(), self.responses.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::io::Write;

    #[test]
    fn test_builtin_pack_parses() {
        let pack = CardPack::builtin().unwrap();
        assert!(pack.scenarios.len() >= 5);
        assert!(pack.responses.len() >= 50);
    }

    #[test]
    fn test_from_file_normalizes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "scenarios": [{{"category": " Pets ", "text": "Why is the cat ____?"}},
                              {{"category": "", "text": "dropped"}}],
                "responses": ["A laser pointer", " A laser pointer ", "", "Tuna"]
            }}"#
        )
        .unwrap();

        let pack = CardPack::from_file(file.path()).unwrap();
        assert_eq!(pack.scenarios.len(), 1);
        assert_eq!(pack.scenarios[0].category, "Pets");
        assert_eq!(pack.responses, vec!["A laser pointer", "Tuna"]);
    }

    #[test]
    fn test_empty_pack_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"scenarios": [], "responses": ["x"]}}"#).unwrap();
        assert!(matches!(
            CardPack::from_file(file.path()),
            Err(PackError::Empty("scenarios"))
        ));

        assert!(matches!(
            CardPack::from_file("/definitely/not/here.json"),
            Err(PackError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_seed_populates_store() {
        let store = MemoryStore::new();
        let pack = CardPack {
            scenarios: vec![
                ScenarioSeed {
                    category: "A".into(),
                    text: "one".into(),
                },
                ScenarioSeed {
                    category: "B".into(),
                    text: "two".into(),
                },
            ],
            responses: vec!["x".into(), "y".into()],
        };

        let counts = pack.seed(&store).await.unwrap();
        assert_eq!(counts, (2, 2));
        assert_eq!(store.list_categories().await.unwrap(), vec!["A", "B"]);
        assert_eq!(
            store
                .sample_active_cards(&HashSet::new(), 10)
                .await
                .unwrap()
                .len(),
            2
        );
    }
}
