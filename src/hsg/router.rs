//! Sector routing
//!
//! Classifier-first: a per-tenant model wins when its confidence
//! clears the gate. Otherwise deterministic keyword and pattern
//! heuristics score each sector; everything else lands in `semantic`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::classifier::{Prediction, CONFIDENCE_GATE};
use crate::types::Sector;

/// Heuristic score a sector must clear to become primary
const PRIMARY_THRESHOLD: f64 = 0.25;
/// Heuristic score a sector must clear to ride along as secondary
const SECONDARY_THRESHOLD: f64 = 0.3;
/// Cap on secondary sectors
const MAX_SECONDARY: usize = 3;

/// Routing decision for one text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    pub primary: Sector,
    pub secondary: Vec<Sector>,
}

static IMPERATIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(run|install|configure|execute|click|open|build|deploy|restart|create|delete|compile|type|press|step \d+|first,|then|next,|finally)\b")
        .expect("imperative regex")
});

static EMOTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(love|hate|excited|angry|happy|sad|frustrat\w*|annoy\w*|thrilled|worried|afraid|amazing|terrible|awesome|wonderful)\b")
        .expect("emotive regex")
});

static TIME_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(yesterday|today|tomorrow|last (week|month|year|night)|this (morning|week|month)|ago|on (monday|tuesday|wednesday|thursday|friday|saturday|sunday)|when i|\d{4}-\d{2}-\d{2})\b")
        .expect("time regex")
});

static SCHEDULE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(schedule[sd]?|deadline|due|at \d{1,2}(:\d{2})?\s*(am|pm)|every (day|week|month|hour)|remind)\b")
        .expect("schedule regex")
});

static SENSORY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(saw|see|hear[d]?|sound\w*|color|bright|dark\w* (room|sky)|loud|quiet|taste[sd]?|smell\w*|texture|image|photo)\b")
        .expect("sensory regex")
});

static CONTEXTUAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(project|repo(sitory)?|workspace|file|directory|branch|environment|config(uration)?|session)\b")
        .expect("contextual regex")
});

static REFLECTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(realiz\w*|insight|pattern|noticed that|in retrospect|lesson learned|tend[s]? to)\b")
        .expect("reflective regex")
});

/// Sector router
#[derive(Debug, Default, Clone)]
pub struct SectorRouter;

impl SectorRouter {
    /// Heuristic scores per sector in [0,1], keyed by match density
    pub fn heuristic_scores(&self, text: &str) -> Vec<(Sector, f64)> {
        let word_count = text.split_whitespace().count().max(1) as f64;
        // A couple of pattern hits should saturate short texts
        let density = |hits: usize| ((hits as f64 * 4.0) / word_count).min(1.0);

        let mut scores = vec![
            (Sector::Procedural, density(IMPERATIVE.find_iter(text).count())),
            (Sector::Emotional, density(EMOTIVE.find_iter(text).count())),
            (Sector::Episodic, density(TIME_REFERENCE.find_iter(text).count())),
            (Sector::Temporal, density(SCHEDULE.find_iter(text).count())),
            (Sector::Sensory, density(SENSORY.find_iter(text).count())),
            (Sector::Contextual, density(CONTEXTUAL.find_iter(text).count())),
            (Sector::Reflective, density(REFLECTIVE.find_iter(text).count())),
        ];
        // Exclamation emphasis feeds the emotional score
        let exclamations = text.matches('!').count();
        if exclamations > 0 {
            if let Some(entry) = scores.iter_mut().find(|(s, _)| *s == Sector::Emotional) {
                entry.1 = (entry.1 + 0.15 * exclamations as f64).min(1.0);
            }
        }
        scores
    }

    /// Route text into one primary and up to three secondary sectors.
    ///
    /// `prediction` is the per-tenant classifier output when a model
    /// exists; it wins outright above the confidence gate.
    pub fn route(&self, text: &str, prediction: Option<Prediction>) -> Routing {
        let scores = self.heuristic_scores(text);

        let primary = match prediction {
            Some(p) if p.confidence >= CONFIDENCE_GATE => p.sector,
            _ => scores
                .iter()
                .filter(|(_, score)| *score >= PRIMARY_THRESHOLD)
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(sector, _)| *sector)
                .unwrap_or(Sector::Semantic),
        };

        let mut ranked: Vec<(Sector, f64)> = scores
            .into_iter()
            .filter(|(sector, score)| *sector != primary && *score > SECONDARY_THRESHOLD)
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        Routing {
            primary,
            secondary: ranked
                .into_iter()
                .take(MAX_SECONDARY)
                .map(|(sector, _)| sector)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_semantic() {
        let router = SectorRouter;
        let routing = router.route("the capital of france is paris", None);
        assert_eq!(routing.primary, Sector::Semantic);
        assert!(routing.secondary.is_empty());
    }

    #[test]
    fn test_imperatives_route_procedural() {
        let router = SectorRouter;
        let routing = router.route("Run the installer, then configure the service", None);
        assert_eq!(routing.primary, Sector::Procedural);
    }

    #[test]
    fn test_emotive_routes_emotional() {
        let router = SectorRouter;
        let routing = router.route("I love this and I'm so excited!", None);
        assert_eq!(routing.primary, Sector::Emotional);
    }

    #[test]
    fn test_time_reference_routes_episodic() {
        let router = SectorRouter;
        let routing = router.route("Yesterday the deploy failed when I merged", None);
        assert_eq!(routing.primary, Sector::Episodic);
    }

    #[test]
    fn test_classifier_overrides_heuristics() {
        let router = SectorRouter;
        let prediction = Prediction {
            sector: Sector::Procedural,
            confidence: 0.9,
        };
        // Heuristics alone would say semantic
        let routing = router.route("a short note", Some(prediction));
        assert_eq!(routing.primary, Sector::Procedural);
    }

    #[test]
    fn test_low_confidence_prediction_ignored() {
        let router = SectorRouter;
        let prediction = Prediction {
            sector: Sector::Emotional,
            confidence: 0.3,
        };
        let routing = router.route("a short note", Some(prediction));
        assert_eq!(routing.primary, Sector::Semantic);
    }

    #[test]
    fn test_secondary_capped_and_excludes_primary() {
        let router = SectorRouter;
        let text = "Yesterday I deployed the project! Run the build, then check the config. \
                    I was so excited and happy! The deadline is due tomorrow at 5pm.";
        let routing = router.route(text, None);
        assert!(routing.secondary.len() <= 3);
        assert!(!routing.secondary.contains(&routing.primary));
    }

    #[test]
    fn test_heuristics_deterministic() {
        let router = SectorRouter;
        let text = "Run the tests after lunch tomorrow";
        assert_eq!(router.route(text, None), router.route(text, None));
    }
}
