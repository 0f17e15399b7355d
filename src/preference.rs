//! Preference pairs for DPO
//!
//! Cascade pairing: after a stable sort by score (descending) every item is
//! preferred over each item ranked below it, giving n·(n−1)/2 pairs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::PairingScope;
use crate::dataset::repair::{jsonl_files, repair};
use crate::dataset::DataPoint;
use crate::error::{DatagenError, Result};
use crate::types::Role;

/// Flattened data point: prompt text, response text, score
#[derive(Debug, Clone, PartialEq)]
pub struct DataItem {
    pub prompt: String,
    pub response: String,
    pub score: f64,
}

impl From<&DataPoint> for DataItem {
    fn from(point: &DataPoint) -> Self {
        let first = |role: Role| {
            point
                .chat_history
                .iter()
                .find(|m| m.role == role)
                .map(|m| m.content.as_str())
                .unwrap_or_default()
        };
        Self {
            prompt: format!("{}\n\n{}", first(Role::System), first(Role::User)),
            response: point.response.content.clone(),
            score: point.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferencePair {
    pub prompt: String,
    #[serde(rename = "chosen")]
    pub chosen_response: String,
    #[serde(rename = "rejected")]
    pub rejected_response: String,
}

/// Cascade over every item regardless of prompt
pub fn build_pairs(items: &[DataItem]) -> Vec<PreferencePair> {
    let mut ranked: Vec<&DataItem> = items.iter().collect();
    // Stable: equal scores keep their input order
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

    let n = ranked.len();
    let mut pairs = Vec::with_capacity(n * n.saturating_sub(1) / 2);
    for i in 0..n {
        for j in (i + 1)..n {
            pairs.push(PreferencePair {
                prompt: ranked[i].prompt.clone(),
                chosen_response: ranked[i].response.clone(),
                rejected_response: ranked[j].response.clone(),
            });
        }
    }
    pairs
}

pub fn build_pairs_scoped(items: &[DataItem], scope: PairingScope) -> Vec<PreferencePair> {
    match scope {
        PairingScope::Global => build_pairs(items),
        PairingScope::PerPrompt => {
            // Groups in order of first appearance
            let mut index: HashMap<&str, usize> = HashMap::new();
            let mut groups: Vec<Vec<DataItem>> = Vec::new();
            for item in items {
                let slot = *index.entry(item.prompt.as_str()).or_insert_with(|| {
                    groups.push(Vec::new());
                    groups.len() - 1
                });
                groups[slot].push(item.clone());
            }
            debug!(groups = groups.len(), items = items.len(), "Pairing per prompt");
            groups.iter().flat_map(|g| build_pairs(g)).collect()
        }
    }
}

/// Data items from every JSONL file in `dir`; unreadable lines are counted
pub fn load_data_items(dir: &Path) -> Result<(Vec<DataItem>, usize)> {
    let mut items = Vec::new();
    let mut skipped = 0;

    for path in jsonl_files(dir)? {
        let report = repair(&fs::read_to_string(&path)?);
        skipped += report.discarded;
        let before = items.len();

        for object in report.objects {
            match serde_json::from_value::<DataPoint>(object) {
                Ok(point) => items.push(DataItem::from(&point)),
                Err(e) => {
                    let err = DatagenError::MalformedRecord(e.to_string());
                    warn!(file = %path.display(), error = %err, "Skipping data point");
                    skipped += 1;
                }
            }
        }
        debug!(file = %path.display(), items = items.len() - before, "Data points extracted");
    }

    Ok((items, skipped))
}

/// One pair per line
pub fn write_pairs(path: &Path, pairs: &[PreferencePair]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    for pair in pairs {
        serde_json::to_writer(&mut writer, pair)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;

    info!(path = %path.display(), pairs = pairs.len(), "⚖️ Preference pairs written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PromptMessage;
    use std::path::PathBuf;

    fn item(prompt: &str, response: &str, score: f64) -> DataItem {
        DataItem {
            prompt: prompt.to_string(),
            response: response.to_string(),
            score,
        }
    }

    fn responses(pairs: &[PreferencePair]) -> Vec<(&str, &str)> {
        pairs
            .iter()
            .map(|p| (p.chosen_response.as_str(), p.rejected_response.as_str()))
            .collect()
    }

    #[test]
    fn cascade_orders_by_score() {
        let items = vec![item("p", "five", 5.0), item("p", "one", 1.0), item("p", "ten", 10.0)];
        let pairs = build_pairs(&items);
        assert_eq!(
            responses(&pairs),
            vec![("ten", "five"), ("ten", "one"), ("five", "one")]
        );
    }

    #[test]
    fn pair_count_is_n_choose_two() {
        for n in 0usize..7 {
            let items: Vec<DataItem> = (0..n).map(|i| item("p", "r", i as f64)).collect();
            assert_eq!(build_pairs(&items).len(), n * n.saturating_sub(1) / 2);
        }
    }

    #[test]
    fn equal_scores_keep_input_order() {
        let items = vec![item("p", "first", 1.0), item("p", "second", 1.0)];
        assert_eq!(responses(&build_pairs(&items)), vec![("first", "second")]);
    }

    #[test]
    fn per_prompt_scope_never_mixes_prompts() {
        let items = vec![
            item("a", "a1", 3.0),
            item("b", "b1", 9.0),
            item("a", "a2", 1.0),
            item("b", "b2", 2.0),
            item("a", "a3", 2.0),
        ];
        let scoped = build_pairs_scoped(&items, PairingScope::PerPrompt);
        assert_eq!(scoped.len(), 3 + 1);
        assert!(scoped
            .iter()
            .all(|p| p.chosen_response[..1] == p.prompt[..] && p.rejected_response[..1] == p.prompt[..]));

        assert_eq!(build_pairs_scoped(&items, PairingScope::Global).len(), 10);
    }

    #[test]
    fn prompt_joins_first_system_and_user() {
        let point = DataPoint {
            chat_history: vec![
                PromptMessage {
                    role: Role::System,
                    content: "sys".to_string(),
                },
                PromptMessage {
                    role: Role::User,
                    content: "u1".to_string(),
                },
                PromptMessage {
                    role: Role::User,
                    content: "u2".to_string(),
                },
            ],
            response: PromptMessage {
                role: Role::Assistant,
                content: "resp".to_string(),
            },
            score: 2.5,
        };
        let item = DataItem::from(&point);
        assert_eq!(item.prompt, "sys\n\nu1");
        assert_eq!(item.response, "resp");
    }

    #[test]
    fn pairs_round_trip_through_jsonl() {
        let dir: PathBuf = std::env::temp_dir()
            .join(format!("datagen_pairs_{}", uuid::Uuid::new_v4()));
        let path = dir.join("dpo").join("pairs.jsonl");
        let pairs = build_pairs(&[item("p", "good", 2.0), item("p", "bad", 1.0)]);
        write_pairs(&path, &pairs).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(line["chosen"], "good");
        assert_eq!(line["rejected"], "bad");
        assert_eq!(line["prompt"], "p");

        let _ = fs::remove_dir_all(&dir);
    }
}
