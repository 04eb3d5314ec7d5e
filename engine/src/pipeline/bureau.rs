use tracing::debug;

use crate::pipeline::types::{Bureau, BureauGuess};

/// Header phrases that identify a bureau outright.
const EXPERIAN_STRONG: &[&str] = &["experian", "experian information solutions"];
const EQUIFAX_STRONG: &[&str] = &["equifax", "equifax information services"];
const TRANSUNION_STRONG: &[&str] = &["transunion", "trans union"];

/// Structural labels each format tends to use; weaker evidence on their own.
const EXPERIAN_WEAK: &[&str] = &["recent balance", "date of status", "credit limit or original amount"];
const EQUIFAX_WEAK: &[&str] = &["balance owed", "prior paying history", "scheduled payment amount"];
const TRANSUNION_WEAK: &[&str] = &["pay status", "date updated", "high balance"];

const STRONG_WEIGHT: f32 = 0.6;
const WEAK_WEIGHT: f32 = 0.2;

/// Classifies merged report text as one bureau's format, or Unknown when the
/// evidence is too close to call.
pub struct BureauDetector {
    epsilon: f32,
}

impl BureauDetector {
    pub fn new(epsilon: f32) -> Self {
        Self { epsilon }
    }

    pub fn detect(&self, merged_text: &str) -> BureauGuess {
        let lower = merged_text.to_lowercase();

        let mut scores = [
            (Bureau::Experian, score(&lower, EXPERIAN_STRONG, EXPERIAN_WEAK)),
            (Bureau::Equifax, score(&lower, EQUIFAX_STRONG, EQUIFAX_WEAK)),
            (
                Bureau::TransUnion,
                score(&lower, TRANSUNION_STRONG, TRANSUNION_WEAK),
            ),
        ];
        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let (best_bureau, best) = scores[0];
        let (_, second) = scores[1];
        debug!(bureau = %best_bureau, best, second, "bureau detection scores");

        if best == 0.0 || best - second < self.epsilon {
            // Too close to call; guessing here would mis-route the parser.
            return BureauGuess {
                bureau: Bureau::Unknown,
                confidence: best,
            };
        }

        BureauGuess {
            bureau: best_bureau,
            confidence: best.min(1.0),
        }
    }
}

fn score(text: &str, strong: &[&str], weak: &[&str]) -> f32 {
    let strong_hits = strong.iter().filter(|p| text.contains(**p)).count() as f32;
    let weak_hits = weak.iter().filter(|p| text.contains(**p)).count() as f32;
    (strong_hits * STRONG_WEIGHT + weak_hits * WEAK_WEIGHT).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_transunion_header() {
        let detector = BureauDetector::new(0.15);
        let guess = detector.detect("TransUnion Consumer Report\nPay Status: Current\nHigh Balance: $900");
        assert_eq!(guess.bureau, Bureau::TransUnion);
        assert!(guess.confidence > 0.5);
    }

    #[test]
    fn ambiguous_text_returns_unknown() {
        let detector = BureauDetector::new(0.15);
        // Both bureaus named with equal strength.
        let guess = detector.detect("experian equifax joint disclosure");
        assert_eq!(guess.bureau, Bureau::Unknown);
    }

    #[test]
    fn no_signal_returns_unknown() {
        let detector = BureauDetector::new(0.15);
        assert_eq!(detector.detect("grocery list: milk, eggs").bureau, Bureau::Unknown);
    }
}
