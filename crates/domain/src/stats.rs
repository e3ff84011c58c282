//! Finalize stage 5 ("Stats") computations (spec §4.8).
//!
//! Pure functions over a merged utterance view; the Finalizer (in
//! `services`) calls these and persists the result.

use crate::model::Utterance;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SpeakerStats {
    pub talk_time_ms: i64,
    pub turns: u32,
    pub interruptions: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub per_speaker: BTreeMap<String, SpeakerStats>,
}

/// Compute per-speaker talk time, turn count, and interruption count over
/// a merged transcript (spec §4.8 stage 5). Utterances without a resolved
/// `speaker_name` do not contribute to any speaker's stats.
pub fn compute_stats(merged: &[Utterance]) -> SessionStats {
    let mut stats = SessionStats::default();

    for u in merged {
        let Some(name) = &u.speaker_name else {
            continue;
        };
        let entry = stats.per_speaker.entry(name.clone()).or_default();
        entry.talk_time_ms += (u.end_ms - u.start_ms).max(0);
        entry.turns += 1;
    }

    for (i, u) in merged.iter().enumerate() {
        let Some(name) = &u.speaker_name else {
            continue;
        };
        let interrupts_someone = merged[..i].iter().any(|prev| {
            prev.speaker_name.is_some()
                && prev.speaker_name.as_deref() != Some(name.as_str())
                && u.start_ms >= prev.start_ms
                && u.start_ms < prev.end_ms
        });
        if interrupts_someone {
            stats
                .per_speaker
                .entry(name.clone())
                .or_default()
                .interruptions += 1;
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Decision, IdentitySource, StreamRole};

    fn utt(name: &str, start_ms: i64, end_ms: i64) -> Utterance {
        Utterance {
            utterance_id: format!("u-{start_ms}"),
            stream_role: StreamRole::Students,
            cluster_id: None,
            speaker_name: Some(name.to_string()),
            decision: Decision::Confirm,
            text: "hi".to_string(),
            start_ms,
            end_ms,
            is_final: true,
            identity_source: Some(IdentitySource::NameExtract),
            evidence: None,
        }
    }

    #[test]
    fn talk_time_and_turns_accumulate_per_speaker() {
        let merged = vec![utt("Alice", 0, 1000), utt("Alice", 2000, 2500), utt("Bob", 3000, 3200)];
        let stats = compute_stats(&merged);
        assert_eq!(stats.per_speaker["Alice"].talk_time_ms, 1500);
        assert_eq!(stats.per_speaker["Alice"].turns, 2);
        assert_eq!(stats.per_speaker["Bob"].turns, 1);
    }

    #[test]
    fn interruption_detected_when_start_falls_inside_prior_turn() {
        let merged = vec![utt("Alice", 0, 2000), utt("Bob", 1000, 1500)];
        let stats = compute_stats(&merged);
        assert_eq!(stats.per_speaker["Bob"].interruptions, 1);
        assert_eq!(stats.per_speaker["Alice"].interruptions, 0);
    }

    #[test]
    fn no_interruption_for_sequential_non_overlapping_turns() {
        let merged = vec![utt("Alice", 0, 1000), utt("Bob", 1000, 2000)];
        let stats = compute_stats(&merged);
        assert_eq!(stats.per_speaker["Bob"].interruptions, 0);
    }
}
