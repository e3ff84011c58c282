//! Speaker Resolver (spec §4.5).
//!
//! The resolution ladder is a pure function over session state: given an
//! already-computed embedding for a `students`-stream utterance (the
//! embedding RPC itself lives behind the Inference Client in
//! `services::resolver`), decide the speaker identity. This realizes
//! Design Note §9: a single `resolve()` function, no second path.

use crate::model::{
    BindingMeta, BindingSource, Cluster, Decision, IdentitySource, ParticipantProfile, RosterEntry,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolverError {
    #[error("cluster {0} is not known to this session")]
    UnknownCluster(String),
}

/// Thresholds from spec §4.5 / §9 (open question: exposed as knobs, these
/// are the documented defaults).
#[derive(Debug, Clone, Copy)]
pub struct ResolverThresholds {
    pub enrollment_top_score_min: f32,
    pub enrollment_margin_min: f32,
    pub name_extract_lock_confidence: f32,
}

impl Default for ResolverThresholds {
    fn default() -> Self {
        Self {
            enrollment_top_score_min: 0.72,
            enrollment_margin_min: 0.08,
            name_extract_lock_confidence: 0.93,
        }
    }
}

/// Outcome of running the ladder for one utterance.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub decision: Decision,
    pub speaker_name: Option<String>,
    pub identity_source: Option<IdentitySource>,
    /// Present when the resolver created or refreshed a binding that the
    /// caller must persist (`bindings[cluster_id]` + `binding_meta`).
    pub new_binding: Option<NewBinding>,
}

#[derive(Debug, Clone)]
pub struct NewBinding {
    pub cluster_id: String,
    pub name: String,
    pub source: BindingSource,
    pub confidence: f64,
    pub locked: bool,
}

fn unknown() -> Resolution {
    Resolution {
        decision: Decision::Unknown,
        speaker_name: None,
        identity_source: Some(IdentitySource::Unknown),
        new_binding: None,
    }
}

fn confirmed(name: String, source: IdentitySource) -> Resolution {
    Resolution {
        decision: Decision::Confirm,
        speaker_name: Some(name),
        identity_source: Some(source),
        new_binding: None,
    }
}

/// Teacher-stream identity is bound directly by priority: the configured
/// interviewer name beats everything else, no RPC involved (spec §4.5).
pub fn resolve_teacher(interviewer_name: &str) -> Resolution {
    if interviewer_name.is_empty() {
        return unknown();
    }
    confirmed(interviewer_name.to_string(), IdentitySource::Teacher)
}

/// Cosine similarity between two equal-length embedding vectors.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn normalize_for_match(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Fuzzy, case-insensitive match of an extracted token against the roster.
fn fuzzy_roster_match<'a>(token: &str, roster: &'a [RosterEntry]) -> Option<&'a RosterEntry> {
    let needle = normalize_for_match(token);
    if needle.is_empty() {
        return None;
    }
    roster.iter().find(|entry| {
        let hay = normalize_for_match(&entry.name);
        hay == needle || hay.contains(&needle) || needle.contains(&hay)
    })
}

/// Rule-based name extraction from transcript text. Supports both
/// English and Chinese self-introduction patterns (spec §4.5 "both
/// languages supported"). Returns the extracted token and a confidence.
pub fn extract_name_candidate(text: &str) -> Option<(String, f32)> {
    const EN_PATTERNS: &[&str] = &[
        "my name is ",
        "i'm ",
        "i am ",
        "this is ",
        "call me ",
    ];
    const ZH_PATTERNS: &[&str] = &["我叫", "我是", "我的名字是"];

    let lower = text.to_lowercase();
    for pat in EN_PATTERNS {
        if let Some(idx) = lower.find(pat) {
            let rest = &text[idx + pat.len()..];
            let token = rest
                .split(|c: char| matches!(c, ',' | '.' | '!' | '?' | '\n'))
                .next()
                .unwrap_or("")
                .split_whitespace()
                .take(2)
                .collect::<Vec<_>>()
                .join(" ");
            if !token.is_empty() {
                return Some((token, 0.95));
            }
        }
    }
    for pat in ZH_PATTERNS {
        if let Some(idx) = text.find(pat) {
            let rest = &text[idx + pat.len()..];
            let token: String = rest.chars().take(4).collect();
            if !token.is_empty() {
                return Some((token, 0.95));
            }
        }
    }
    None
}

/// Run the full resolution ladder for a `students`-stream utterance
/// (spec §4.5). `embedding` is `None` when no embedding could be
/// extracted for this utterance (e.g. too short) — in that case steps 1,
/// 2 and 4 are still attempted and step 3 is skipped.
#[allow(clippy::too_many_arguments)]
pub fn resolve_students(
    text: &str,
    cluster_id: Option<&str>,
    embedding: Option<&[f32]>,
    clusters: &[Cluster],
    bindings: &std::collections::BTreeMap<String, String>,
    binding_meta: &std::collections::BTreeMap<String, BindingMeta>,
    participant_profiles: &[ParticipantProfile],
    roster: &[RosterEntry],
    thresholds: ResolverThresholds,
) -> Resolution {
    // 1. Locked manual binding.
    if let Some(cid) = cluster_id {
        if let Some(meta) = binding_meta.get(cid) {
            if meta.locked {
                if let Some(name) = bindings.get(cid) {
                    return confirmed(name.clone(), IdentitySource::ManualMap);
                }
            }
        }

        // 2. Existing binding.
        if let Some(name) = bindings.get(cid) {
            let source = binding_meta
                .get(cid)
                .map(|m| binding_source_to_identity(m.source))
                .unwrap_or(IdentitySource::Preconfig);
            return confirmed(name.clone(), source);
        }
    }

    // 3. Enrollment-profile match.
    if let (Some(embedding), false) = (embedding, participant_profiles.is_empty()) {
        let mut scored: Vec<(f32, &ParticipantProfile)> = participant_profiles
            .iter()
            .map(|p| (cosine_similarity(embedding, &p.centroid), p))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((top_score, top_profile)) = scored.first().copied() {
            let second_score = scored.get(1).map(|(s, _)| *s).unwrap_or(0.0);
            let margin = top_score - second_score;
            if top_score >= thresholds.enrollment_top_score_min
                && margin >= thresholds.enrollment_margin_min
            {
                let mut resolution =
                    confirmed(top_profile.name.clone(), IdentitySource::EnrollmentMatch);
                if let Some(cid) = cluster_id {
                    resolution.new_binding = Some(NewBinding {
                        cluster_id: cid.to_string(),
                        name: top_profile.name.clone(),
                        source: BindingSource::EnrollmentMatch,
                        confidence: top_score as f64,
                        locked: false,
                    });
                }
                return resolution;
            }
        }
    }

    // 4. Name extraction from transcript.
    if let Some((token, confidence)) = extract_name_candidate(text) {
        if let Some(entry) = fuzzy_roster_match(&token, roster) {
            let mut resolution = confirmed(entry.name.clone(), IdentitySource::NameExtract);
            if let Some(cid) = cluster_id {
                resolution.new_binding = Some(NewBinding {
                    cluster_id: cid.to_string(),
                    name: entry.name.clone(),
                    source: BindingSource::NameExtract,
                    confidence: confidence as f64,
                    locked: confidence >= thresholds.name_extract_lock_confidence,
                });
            }
            return resolution;
        }
    }

    // 5. Unknown.
    unknown()
}

fn binding_source_to_identity(source: BindingSource) -> IdentitySource {
    match source {
        BindingSource::TeamsParticipants => IdentitySource::TeamsParticipants,
        BindingSource::Preconfig => IdentitySource::Preconfig,
        BindingSource::EnrollmentMatch => IdentitySource::EnrollmentMatch,
        BindingSource::NameExtract => IdentitySource::NameExtract,
        BindingSource::ManualMap => IdentitySource::ManualMap,
    }
}

/// Validate a manual `cluster_map` operation (spec §4.5): the cluster
/// must already exist. This closes the "dangling binding" hole called
/// out in Design Note §9 / spec §8 P6.
pub fn validate_cluster_map(clusters: &[Cluster], cluster_id: &str) -> Result<(), ResolverError> {
    if clusters.iter().any(|c| c.cluster_id == cluster_id) {
        Ok(())
    } else {
        Err(ResolverError::UnknownCluster(cluster_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EnrollmentStatus;

    fn profile(name: &str, centroid: Vec<f32>) -> ParticipantProfile {
        ParticipantProfile {
            name: name.to_string(),
            email: None,
            centroid,
            sample_count: 5,
            sample_seconds: 10.0,
            status: EnrollmentStatus::Ready,
        }
    }

    #[test]
    fn teacher_always_resolves_to_interviewer() {
        let r = resolve_teacher("Carol");
        assert_eq!(r.speaker_name.as_deref(), Some("Carol"));
        assert_eq!(r.identity_source, Some(IdentitySource::Teacher));
        assert_eq!(r.decision, Decision::Confirm);
    }

    #[test]
    fn locked_manual_binding_wins_over_everything() {
        let mut bindings = std::collections::BTreeMap::new();
        bindings.insert("c1".to_string(), "Alice".to_string());
        let mut meta = std::collections::BTreeMap::new();
        meta.insert(
            "c1".to_string(),
            BindingMeta {
                source: BindingSource::NameExtract,
                confidence: 0.95,
                locked: true,
                updated_at: 0,
            },
        );
        let r = resolve_students(
            "hello",
            Some("c1"),
            None,
            &[],
            &bindings,
            &meta,
            &[],
            &[],
            ResolverThresholds::default(),
        );
        assert_eq!(r.speaker_name.as_deref(), Some("Alice"));
        assert_eq!(r.identity_source, Some(IdentitySource::ManualMap));
    }

    #[test]
    fn enrollment_match_requires_score_and_margin() {
        let profiles = vec![profile("Alice", vec![1.0, 0.0]), profile("Bob", vec![0.0, 1.0])];
        let r = resolve_students(
            "hi",
            Some("c1"),
            Some(&[1.0, 0.0]),
            &[],
            &Default::default(),
            &Default::default(),
            &profiles,
            &[],
            ResolverThresholds::default(),
        );
        assert_eq!(r.speaker_name.as_deref(), Some("Alice"));
        assert_eq!(r.identity_source, Some(IdentitySource::EnrollmentMatch));
        assert!(r.new_binding.is_some());
    }

    #[test]
    fn enrollment_match_rejected_when_margin_too_small() {
        let profiles = vec![
            profile("Alice", vec![1.0, 0.05]),
            profile("Bob", vec![0.98, 0.0]),
        ];
        let r = resolve_students(
            "hi",
            Some("c1"),
            Some(&[1.0, 0.0]),
            &[],
            &Default::default(),
            &Default::default(),
            &profiles,
            &[],
            ResolverThresholds::default(),
        );
        assert_eq!(r.decision, Decision::Unknown);
    }

    #[test]
    fn name_extraction_matches_roster_english() {
        let roster = vec![RosterEntry {
            name: "Alice".to_string(),
            email: None,
        }];
        let r = resolve_students(
            "Hi, my name is Alice.",
            Some("c1"),
            None,
            &[],
            &Default::default(),
            &Default::default(),
            &[],
            &roster,
            ResolverThresholds::default(),
        );
        assert_eq!(r.speaker_name.as_deref(), Some("Alice"));
        assert_eq!(r.identity_source, Some(IdentitySource::NameExtract));
        let binding = r.new_binding.expect("should propose a binding");
        assert!(binding.locked, "0.95 confidence should lock the binding");
    }

    #[test]
    fn name_extraction_matches_roster_chinese() {
        let roster = vec![RosterEntry {
            name: "小明".to_string(),
            email: None,
        }];
        let r = resolve_students(
            "大家好,我叫小明",
            Some("c1"),
            None,
            &[],
            &Default::default(),
            &Default::default(),
            &[],
            &roster,
            ResolverThresholds::default(),
        );
        assert_eq!(r.speaker_name.as_deref(), Some("小明"));
    }

    #[test]
    fn falls_back_to_unknown() {
        let r = resolve_students(
            "just some ambient noise",
            None,
            None,
            &[],
            &Default::default(),
            &Default::default(),
            &[],
            &[],
            ResolverThresholds::default(),
        );
        assert_eq!(r.decision, Decision::Unknown);
        assert!(r.speaker_name.is_none());
    }

    #[test]
    fn cluster_map_rejects_unknown_cluster() {
        let err = validate_cluster_map(&[], "ghost").unwrap_err();
        assert_eq!(err, ResolverError::UnknownCluster("ghost".to_string()));
    }

    #[test]
    fn cluster_map_accepts_known_cluster() {
        let clusters = vec![Cluster {
            cluster_id: "c1".to_string(),
            centroid: vec![0.0],
            sample_count: 1,
            bound_name: None,
        }];
        assert!(validate_cluster_map(&clusters, "c1").is_ok());
    }
}
