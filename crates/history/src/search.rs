//! Lexical conversation search.
//!
//! Score per interaction:
//! ```text
//! score = Σ over distinct query terms t present: 1 + ln(tf(t))
//! ```
//! normalized by the number of distinct query terms, so 1.0 means every
//! term appeared once.  Ties go to the newer interaction.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::Interaction;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "with", "this", "that", "was", "what",
    "can", "how", "from", "have", "has", "our", "your",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub thread_id: Uuid,
    pub interaction_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub user: String,
    pub assistant: String,
    pub score: f32,
}

pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .map(str::to_lowercase)
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

pub(crate) fn rank<'a>(
    query: &str,
    candidates: impl Iterator<Item = (Uuid, &'a Interaction)>,
    limit: usize,
) -> Vec<SearchHit> {
    let terms: BTreeSet<String> = tokenize(query).into_iter().collect();
    if terms.is_empty() || limit == 0 {
        return Vec::new();
    }

    let mut scored: Vec<(f32, Uuid, &Interaction)> = candidates
        .filter_map(|(thread_id, interaction)| {
            let mut tf: HashMap<String, usize> = HashMap::new();
            for token in tokenize(&interaction.user_message.content)
                .into_iter()
                .chain(tokenize(&interaction.final_message.content))
            {
                *tf.entry(token).or_default() += 1;
            }
            let raw: f32 = terms
                .iter()
                .filter_map(|term| tf.get(term))
                .map(|&count| 1.0 + (count as f32).ln())
                .sum();
            (raw > 0.0).then(|| (raw / terms.len() as f32, thread_id, interaction))
        })
        .collect();

    scored.sort_by(|(ls, _, li), (rs, _, ri)| {
        rs.total_cmp(ls)
            .then_with(|| ri.created_at().cmp(&li.created_at()))
    });

    scored
        .into_iter()
        .take(limit)
        .map(|(score, thread_id, interaction)| SearchHit {
            thread_id,
            interaction_id: interaction.id,
            created_at: interaction.created_at(),
            user: interaction.user_message.content.clone(),
            assistant: interaction.final_message.content.clone(),
            score,
        })
        .collect()
}
