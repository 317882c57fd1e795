//! Trait alignment scoring.  Pure and deterministic: the same transcript and
//! trait set always yield the same score.

use std::collections::BTreeMap;

use regex::Regex;

use persona_core::TraitValue;

/// Score returned when there is nothing to compare.
pub const NEUTRAL_SCORE: f64 = 0.5;

const SIGNAL_BIAS: f64 = 1.3;
const CONSISTENCY_BONUS: f64 = 0.1;
const CONSISTENCY_SHARE: f64 = 0.6;
const STRONG_TRAIT: f64 = 0.7;
const CONFIDENT_NUDGE: f64 = 0.2;
const UNCERTAIN_NUDGE: f64 = 0.3;
const ROOT_SUFFIXES: &[&str] = &["ing", "ive", "ful", "ed"];
const MIN_ROOT_LEN: usize = 3;

/// How well `transcript` reflects `traits`, in `[0, 1]`.
///
/// Keyword traits score the share of their keywords found in the transcript;
/// dial traits start at the dial value and move with literal
/// "confident"/"uncertain" language.
pub fn evaluate_alignment(transcript: &str, traits: &BTreeMap<String, TraitValue>) -> f64 {
    if traits.is_empty() || transcript.trim().is_empty() {
        return NEUTRAL_SCORE;
    }

    let lowered = transcript.to_lowercase();
    let scores = traits
        .values()
        .map(|value| match value {
            TraitValue::Dial(level) => dial_score(*level, &lowered),
            other => keyword_score(&other.keywords().unwrap_or_default(), &lowered),
        })
        .collect::<Vec<_>>();

    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    let strong = scores.iter().filter(|score| **score > STRONG_TRAIT).count();
    let bonus = if strong as f64 / scores.len() as f64 > CONSISTENCY_SHARE {
        CONSISTENCY_BONUS
    } else {
        0.0
    };
    (mean + bonus).clamp(0.0, 1.0)
}

fn dial_score(level: f64, transcript: &str) -> f64 {
    let mut score = level.clamp(0.0, 1.0);
    if transcript.contains("confident") {
        score += CONFIDENT_NUDGE;
    }
    if transcript.contains("uncertain") {
        score -= UNCERTAIN_NUDGE;
    }
    score.clamp(0.0, 1.0)
}

fn keyword_score(keywords: &[String], transcript: &str) -> f64 {
    if keywords.is_empty() {
        return NEUTRAL_SCORE;
    }
    let total = keywords
        .iter()
        .map(|keyword| keyword_matches(keyword, transcript))
        .sum::<usize>();
    let score = (total as f64 / keywords.len() as f64).min(1.0);
    if score > 0.0 {
        (score * SIGNAL_BIAS).min(1.0)
    } else {
        0.0
    }
}

/// Best match count over exact, prefix and root-stripped matching.
pub fn keyword_matches(keyword: &str, transcript: &str) -> usize {
    let keyword = keyword.trim().to_lowercase();
    if keyword.is_empty() {
        return 0;
    }
    let escaped = regex::escape(&keyword);

    let mut patterns = vec![format!(r"\b{escaped}\b"), format!(r"\b{escaped}\w*")];
    if let Some(root) = strip_root(&keyword) {
        patterns.push(format!(r"\b{}\w*", regex::escape(root)));
    }

    patterns
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .map(|re| re.find_iter(transcript).count())
        .max()
        .unwrap_or(0)
}

fn strip_root(keyword: &str) -> Option<&str> {
    ROOT_SUFFIXES.iter().find_map(|suffix| {
        keyword
            .strip_suffix(suffix)
            .filter(|root| root.chars().count() >= MIN_ROOT_LEN)
    })
}
