//! Reconciler (spec §4.6).
//!
//! Produces two stateless views over the per-stream utterance sequences:
//! `raw` (concatenation, ordered by `start_ms`) and `merged` (coalesced
//! same-speaker runs, near-duplicates across streams removed). Both are
//! pure functions of their input — no persisted cache, recomputed on
//! every call (spec guarantee).

use crate::model::{StreamRole, Utterance};
use std::collections::HashSet;

/// Coalescing window for adjacent same-speaker, same-stream utterances
/// (spec §4.6 default; exposed as a knob per Design Note §9's open
/// question).
pub const MERGE_GAP_MS: i64 = 400;
/// Token overlap threshold for near-duplicate elimination.
pub const PREFIX_SUFFIX_OVERLAP_MIN: f64 = 0.60;
/// Jaccard similarity threshold for near-duplicate elimination.
pub const JACCARD_MIN: f64 = 0.70;

fn stream_order(role: StreamRole) -> u8 {
    match role {
        StreamRole::Teacher => 0,
        StreamRole::Students => 1,
    }
}

/// Concatenation of both streams ordered by `start_ms`; ties break
/// `teacher` before `students` (spec §4.6).
pub fn raw_view(teacher: &[Utterance], students: &[Utterance]) -> Vec<Utterance> {
    let mut all: Vec<Utterance> = teacher.iter().chain(students.iter()).cloned().collect();
    all.sort_by(|a, b| {
        a.start_ms
            .cmp(&b.start_ms)
            .then_with(|| stream_order(a.stream_role).cmp(&stream_order(b.stream_role)))
    });
    all
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|t| t.trim_matches(|c: char| c.is_ascii_punctuation()).to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    let sa: HashSet<&String> = a.iter().collect();
    let sb: HashSet<&String> = b.iter().collect();
    if sa.is_empty() && sb.is_empty() {
        return 1.0;
    }
    let intersection = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Fraction of the shorter token sequence that appears as a shared prefix
/// or shared suffix of the longer one.
fn prefix_suffix_overlap(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };

    let prefix_len = shorter
        .iter()
        .zip(longer.iter())
        .take_while(|(x, y)| x == y)
        .count();
    let suffix_len = shorter
        .iter()
        .rev()
        .zip(longer.iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let best = prefix_len.max(suffix_len);
    best as f64 / shorter.len() as f64
}

fn contains_other(a: &str, b: &str) -> bool {
    let la = a.to_lowercase();
    let lb = b.to_lowercase();
    la.contains(&lb) || lb.contains(&la)
}

/// Whether `a` and `b` should be treated as the same utterance surfacing
/// on both streams (spec §4.6 near-duplicate rule).
pub fn is_near_duplicate(a: &Utterance, b: &Utterance) -> bool {
    let ta = tokenize(&a.text);
    let tb = tokenize(&b.text);
    prefix_suffix_overlap(&ta, &tb) >= PREFIX_SUFFIX_OVERLAP_MIN
        || jaccard(&ta, &tb) >= JACCARD_MIN
        || contains_other(&a.text, &b.text)
}

/// Merge `u` (earlier, retained) with `v` (later, coalesced into `u`) by
/// concatenating text and extending `end_ms`.
fn coalesce(u: &mut Utterance, v: &Utterance) {
    u.text.push(' ');
    u.text.push_str(&v.text);
    u.end_ms = u.end_ms.max(v.end_ms);
}

/// The merged transcript view (spec §4.6). Guarantees
/// `len(merged) <= len(raw)` for any input (P4) because both passes only
/// ever fold an entry into its neighbor, never split one.
pub fn merged_view(teacher: &[Utterance], students: &[Utterance]) -> Vec<Utterance> {
    let raw = raw_view(teacher, students);

    // Pass 1: coalesce adjacent same-speaker, same-stream runs within the
    // merge gap.
    let mut coalesced: Vec<Utterance> = Vec::with_capacity(raw.len());
    for u in raw {
        let should_merge = coalesced.last().is_some_and(|prev: &Utterance| {
            prev.stream_role == u.stream_role
                && prev.speaker_name.is_some()
                && prev.speaker_name == u.speaker_name
                && u.start_ms - prev.end_ms < MERGE_GAP_MS
        });
        if should_merge {
            let prev = coalesced.last_mut().expect("checked above");
            coalesce(prev, &u);
        } else {
            coalesced.push(u);
        }
    }

    // Pass 2: eliminate near-duplicates across streams. Sequential scan
    // over the sorted list; a near-duplicate pair collapses to the
    // earlier-starting (tie: teacher-before-students) entry.
    let mut merged: Vec<Utterance> = Vec::with_capacity(coalesced.len());
    for u in coalesced {
        let duplicate_of_prev = merged
            .last()
            .is_some_and(|prev| is_near_duplicate(prev, &u));
        if !duplicate_of_prev {
            merged.push(u);
        }
        // else: `u` is dropped; `prev` (earlier start_ms, or teacher on a
        // tie since raw_view already ordered ties that way) is retained.
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Decision, IdentitySource};

    fn utt(role: StreamRole, name: &str, text: &str, start_ms: i64, end_ms: i64) -> Utterance {
        Utterance {
            utterance_id: format!("u-{start_ms}"),
            stream_role: role,
            cluster_id: None,
            speaker_name: Some(name.to_string()),
            decision: Decision::Confirm,
            text: text.to_string(),
            start_ms,
            end_ms,
            is_final: true,
            identity_source: Some(IdentitySource::Teacher),
            evidence: None,
        }
    }

    #[test]
    fn raw_view_orders_by_start_ms_then_teacher_first() {
        let teacher = vec![utt(StreamRole::Teacher, "Carol", "hello", 1000, 1500)];
        let students = vec![utt(StreamRole::Students, "Alice", "hi", 1000, 1400)];
        let raw = raw_view(&teacher, &students);
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0].stream_role, StreamRole::Teacher);
    }

    #[test]
    fn merge_contractivity_holds_for_disjoint_utterances() {
        let teacher = vec![
            utt(StreamRole::Teacher, "Carol", "Welcome", 0, 1000),
            utt(StreamRole::Teacher, "Carol", "everyone", 5000, 6000),
        ];
        let students = vec![utt(StreamRole::Students, "Alice", "Hi", 2000, 2500)];
        let raw = raw_view(&teacher, &students);
        let merged = merged_view(&teacher, &students);
        assert!(merged.len() <= raw.len());
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn coalesces_same_speaker_within_gap() {
        let teacher = vec![
            utt(StreamRole::Teacher, "Carol", "Welcome", 0, 1000),
            utt(StreamRole::Teacher, "Carol", "everyone", 1100, 1800),
        ];
        let merged = merged_view(&teacher, &[]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].text, "Welcome everyone");
        assert_eq!(merged[0].end_ms, 1800);
    }

    #[test]
    fn does_not_coalesce_across_gap_threshold() {
        let teacher = vec![
            utt(StreamRole::Teacher, "Carol", "Welcome", 0, 1000),
            utt(StreamRole::Teacher, "Carol", "everyone", 1500, 2000),
        ];
        let merged = merged_view(&teacher, &[]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn eliminates_cross_stream_near_duplicate() {
        let teacher = vec![utt(
            StreamRole::Teacher,
            "Carol",
            "let's begin the interview now",
            0,
            2000,
        )];
        let students = vec![utt(
            StreamRole::Students,
            "Carol",
            "let's begin the interview now",
            0,
            2000,
        )];
        let merged = merged_view(&teacher, &students);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].stream_role, StreamRole::Teacher);
    }

    #[test]
    fn containment_counts_as_near_duplicate() {
        let a = utt(StreamRole::Teacher, "Carol", "let's begin", 0, 1000);
        let b = utt(StreamRole::Students, "Carol", "let's begin now please", 0, 1200);
        assert!(is_near_duplicate(&a, &b));
    }

    #[test]
    fn distinct_speakers_are_never_near_duplicates_by_containment_alone() {
        let a = utt(StreamRole::Teacher, "Carol", "the weather is nice", 0, 1000);
        let b = utt(StreamRole::Students, "Alice", "completely different remark", 2000, 3000);
        assert!(!is_near_duplicate(&a, &b));
    }
}
