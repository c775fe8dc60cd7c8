//! Burden-weighted context compaction.
//!
//! Interactions are walked newest to oldest while a running burden `B`
//! accumulates `length * w`, with `w = base_weight * (1 + weight_growth)^k`
//! for the k-th interaction from the end.  Once `B` reaches the threshold,
//! long interior texts (assistant preambles, tool results) are cut down to
//! head + marker + tail.  The final reply is only cut when it is longer than
//! `final_min_length`.  User messages are never touched.
//!
//! The input is cloned; stored history is never modified.

use serde_json::Value;
use tracing::{debug, info};

use shellbot_config::CompactionConfig;
use shellbot_history::{Interaction, StepResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub original_length: usize,
    pub compacted_length: usize,
    pub truncated_fields: usize,
    pub dropped_interactions: usize,
}

#[derive(Debug, Clone)]
pub struct Compacted {
    pub interactions: Vec<Interaction>,
    pub report: CompactionReport,
}

#[derive(Debug, Clone)]
pub struct Compactor {
    config: CompactionConfig,
}

impl Compactor {
    pub fn new(config: CompactionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn compact(&self, interactions: &[Interaction]) -> Compacted {
        let cfg = &self.config;
        let original_length: usize = interactions.iter().map(interaction_length).sum();
        let mut kept: Vec<Interaction> = interactions.to_vec();
        let mut burden = 0.0_f64;
        let mut truncated_fields = 0usize;

        for (age, interaction) in kept.iter_mut().rev().enumerate() {
            let weight = cfg.base_weight * (1.0 + cfg.weight_growth).powi(age as i32);

            for step in &mut interaction.steps {
                if let Some(message) = step.assistant_message.as_mut() {
                    let len = char_len(&message.content);
                    if burden >= cfg.burden_threshold && len > cfg.interior_min_length {
                        truncated_fields += self.truncate_in_place(&mut message.content);
                    }
                    burden += len as f64 * weight;
                }

                let len = result_length(&step.result);
                if burden >= cfg.burden_threshold && len > cfg.interior_min_length {
                    truncated_fields += self.truncate_result(&mut step.result);
                }
                burden += len as f64 * weight;
            }

            let final_len = char_len(&interaction.final_message.content);
            if burden >= cfg.burden_threshold && final_len > cfg.final_min_length {
                truncated_fields += self.truncate_in_place(&mut interaction.final_message.content);
            }
            burden += final_len as f64 * weight;
            burden += char_len(&interaction.user_message.content) as f64 * weight;
        }

        let mut compacted_length: usize = kept.iter().map(interaction_length).sum();
        let mut dropped_interactions = 0usize;
        while compacted_length > cfg.max_total_length && kept.len() > 1 {
            let oldest = kept.remove(0);
            compacted_length -= interaction_length(&oldest);
            dropped_interactions += 1;
        }

        let report = CompactionReport {
            original_length,
            compacted_length,
            truncated_fields,
            dropped_interactions,
        };
        if truncated_fields > 0 || dropped_interactions > 0 {
            info!(
                interactions = interactions.len(),
                original_length,
                compacted_length,
                truncated_fields,
                dropped_interactions,
                burden,
                "context compacted"
            );
        } else {
            debug!(interactions = interactions.len(), original_length, "context within budget");
        }

        Compacted {
            interactions: kept,
            report,
        }
    }

    /// Head + marker + tail, or `None` when that would not be shorter.
    pub fn truncate_text(&self, text: &str) -> Option<String> {
        let cfg = &self.config;
        let len = char_len(text);
        let floor = cfg.preserve_head_chars + cfg.preserve_tail_chars + char_len(&cfg.truncation_marker);
        if len <= floor {
            return None;
        }
        let head: String = text.chars().take(cfg.preserve_head_chars).collect();
        let tail: String = text.chars().skip(len - cfg.preserve_tail_chars).collect();
        Some(format!("{head}{}{tail}", cfg.truncation_marker))
    }

    fn truncate_in_place(&self, text: &mut String) -> usize {
        match self.truncate_text(text) {
            Some(short) => {
                *text = short;
                1
            }
            None => 0,
        }
    }

    fn truncate_result(&self, result: &mut StepResult) -> usize {
        match result {
            StepResult::Result(value) => self.truncate_json(value),
            StepResult::Error(err) => self.truncate_in_place(&mut err.message),
        }
    }

    /// Truncate every string leaf separately so the JSON shape survives.
    fn truncate_json(&self, value: &mut Value) -> usize {
        match value {
            Value::String(text) => self.truncate_in_place(text),
            Value::Array(items) => items.iter_mut().map(|item| self.truncate_json(item)).sum(),
            Value::Object(map) => map.values_mut().map(|item| self.truncate_json(item)).sum(),
            _ => 0,
        }
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn json_text_length(value: &Value) -> usize {
    match value {
        Value::String(text) => char_len(text),
        Value::Array(items) => items.iter().map(json_text_length).sum(),
        Value::Object(map) => map.values().map(json_text_length).sum(),
        _ => 0,
    }
}

fn result_length(result: &StepResult) -> usize {
    match result {
        StepResult::Result(value) => json_text_length(value),
        StepResult::Error(err) => char_len(&err.message),
    }
}

/// Char-length proxy for an interaction's share of the context.
pub fn interaction_length(interaction: &Interaction) -> usize {
    let interior: usize = interaction
        .steps
        .iter()
        .map(|step| {
            step.assistant_message
                .as_ref()
                .map_or(0, |message| char_len(&message.content))
                + result_length(&step.result)
        })
        .sum();
    char_len(&interaction.user_message.content)
        + interior
        + char_len(&interaction.final_message.content)
}
