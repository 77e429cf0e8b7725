//! Rule-based evaluator and composer.
//!
//! Candidates are treated as a list of sentences. Constraints are small
//! textual rules:
//!
//! | Constraint          | Meaning                                          |
//! |---------------------|--------------------------------------------------|
//! | `forbid:<term>`     | no sentence may use `<term>`                     |
//! | `require:<term>`    | the candidate must mention `<term>`              |
//! | `max_sentences:<n>` | at most `n` sentences                            |
//!
//! Independently of constraints, [`RuleEvaluator`] flags sentence pairs that
//! take opposite sides of a keyword pair (always/never, can/cannot, ...) as
//! `consistency:<pos>/<neg>` violations, and reports hedging phrases
//! ("unclear", "insufficient data", ...) as knowledge gaps.
//!
//! [`RuleComposer`] can satisfy `forbid`, `require` and `max_sentences` on
//! its own. It never picks a side in a consistency conflict; that takes an
//! arbiter ruling such as `forbid:never`.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use resolution::{
    ComposeError, Composer, ConstraintSet, Contradiction, Evaluation, Evaluator, EvaluatorError,
    GapKind, GapNote, Violation,
};
use tracing::debug;

/// Consistency findings reported per pass.
pub const MAX_CONSISTENCY_FINDINGS: usize = 3;

const OPPOSITIONS: [(&str, &str); 7] = [
    ("always", "never"),
    ("all", "none"),
    ("possible", "impossible"),
    ("can", "cannot"),
    ("must", "must not"),
    ("true", "false"),
    ("proven", "unproven"),
];

const GAP_PHRASES: [&str; 8] = [
    "unclear",
    "uncertain",
    "unknown",
    "insufficient data",
    "requires further research",
    "not well understood",
    "conflicting evidence",
    "preliminary findings",
];

struct Opposition {
    positive: &'static str,
    negative: &'static str,
    positive_re: Regex,
    negative_re: Regex,
}

impl Opposition {
    /// Whether the sentence takes the positive side. Occurrences of the
    /// negative phrase are removed first so "must not" never reads as "must".
    fn asserts(&self, sentence: &str) -> bool {
        let scrubbed = self.negative_re.replace_all(sentence, " ");
        self.positive_re.is_match(&scrubbed)
    }

    fn denies(&self, sentence: &str) -> bool {
        self.negative_re.is_match(sentence)
    }

    fn constraint(&self) -> String {
        format!("consistency:{}/{}", self.positive, self.negative)
    }
}

static OPPOSITION_RULES: LazyLock<Vec<Opposition>> = LazyLock::new(|| {
    OPPOSITIONS
        .iter()
        .map(|&(positive, negative)| Opposition {
            positive,
            negative,
            positive_re: word_regex(positive).expect("opposition regex should compile"),
            negative_re: word_regex(negative).expect("opposition regex should compile"),
        })
        .collect()
});

fn word_regex(term: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(term.trim())))
}

// ── Sentences ──────────────────────────────────────────────────────

/// Split text into trimmed, non-empty sentences.
pub fn sentences(text: &str) -> Vec<String> {
    text.split(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn join_sentences(sentences: &[String]) -> String {
    sentences
        .iter()
        .map(|s| format!("{}.", s))
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Constraint rules ───────────────────────────────────────────────

/// A constraint this module knows how to check and apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Forbid(String),
    Require(String),
    MaxSentences(usize),
}

impl Rule {
    /// Parse a constraint text. Unknown families yield `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let (family, arg) = text.split_once(':')?;
        let arg = arg.trim();
        if arg.is_empty() {
            return None;
        }
        match family.trim() {
            "forbid" => Some(Self::Forbid(arg.to_string())),
            "require" => Some(Self::Require(arg.to_string())),
            "max_sentences" => arg.parse().ok().map(Self::MaxSentences),
            _ => None,
        }
    }

    pub fn constraint(&self) -> String {
        match self {
            Self::Forbid(term) => format!("forbid:{}", term),
            Self::Require(term) => format!("require:{}", term),
            Self::MaxSentences(n) => format!("max_sentences:{}", n),
        }
    }
}

fn rules_of(constraints: &ConstraintSet) -> Vec<Rule> {
    constraints
        .texts()
        .filter_map(|text| {
            let rule = Rule::parse(text);
            if rule.is_none() {
                debug!(constraint = %text, "Constraint not handled by rule engine");
            }
            rule
        })
        .collect()
}

fn mentions(text: &str, term: &str) -> Result<bool, regex::Error> {
    Ok(word_regex(term)?.is_match(text))
}

// ── Evaluator ──────────────────────────────────────────────────────

/// Keyword and constraint checker.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleEvaluator;

impl RuleEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Opposition pairs asserted in one sentence and denied in a later one.
    /// One finding per pair, at most [`MAX_CONSISTENCY_FINDINGS`].
    fn consistency(&self, sentences: &[String]) -> Vec<Violation> {
        let mut found = Vec::new();
        for rule in OPPOSITION_RULES.iter() {
            if found.len() >= MAX_CONSISTENCY_FINDINGS {
                break;
            }
            let conflict = sentences.iter().enumerate().any(|(i, first)| {
                sentences[i + 1..].iter().any(|second| {
                    (rule.asserts(first) && rule.denies(second))
                        || (rule.denies(first) && rule.asserts(second))
                })
            });
            if conflict {
                found.push(
                    Violation::new(
                        rule.constraint(),
                        format!("claims both '{}' and '{}'", rule.positive, rule.negative),
                    )
                    .with_suggestion(format!("forbid:{}", rule.negative)),
                );
            }
        }
        found
    }

    fn check(
        &self,
        rule: &Rule,
        candidate: &str,
        sentences: &[String],
    ) -> Result<Option<Violation>, EvaluatorError> {
        let malformed = |e: regex::Error| EvaluatorError::Malformed(e.to_string());
        let violation = match rule {
            Rule::Forbid(term) => {
                let re = word_regex(term).map_err(malformed)?;
                sentences.iter().any(|s| re.is_match(s)).then(|| {
                    Violation::new(rule.constraint(), format!("uses forbidden term '{}'", term))
                })
            }
            Rule::Require(term) => (!mentions(candidate, term).map_err(malformed)?).then(|| {
                Violation::new(rule.constraint(), format!("missing required term '{}'", term))
            }),
            Rule::MaxSentences(limit) => (sentences.len() > *limit).then(|| {
                Violation::new(rule.constraint(), format!("more than {} sentences", limit))
            }),
        };
        Ok(violation)
    }

    fn gaps(&self, sentences: &[String]) -> Vec<GapNote> {
        let mut gaps = Vec::new();
        for sentence in sentences {
            let lower = sentence.to_lowercase();
            for phrase in GAP_PHRASES {
                if lower.contains(phrase) {
                    let kind = if phrase == "conflicting evidence" {
                        GapKind::ContradictorySources
                    } else {
                        GapKind::InsufficientEvidence
                    };
                    gaps.push(GapNote {
                        description: format!("knowledge gap indicated by '{}'", phrase),
                        context: sentence.clone(),
                        kind,
                    });
                }
            }
        }
        gaps
    }
}

#[async_trait]
impl Evaluator for RuleEvaluator {
    async fn evaluate(
        &self,
        candidate: &str,
        constraints: &ConstraintSet,
    ) -> Result<Evaluation, EvaluatorError> {
        let sentences = sentences(candidate);
        if sentences.is_empty() {
            return Err(EvaluatorError::Malformed("candidate has no sentences".into()));
        }

        let mut violations = self.consistency(&sentences);
        for rule in rules_of(constraints) {
            if let Some(v) = self.check(&rule, candidate, &sentences)? {
                violations.push(v);
            }
        }

        Ok(Evaluation {
            violations,
            gaps: self.gaps(&sentences),
        })
    }
}

// ── Composer ───────────────────────────────────────────────────────

/// Rewrites candidates to satisfy `forbid`, `require` and `max_sentences`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleComposer;

impl RuleComposer {
    pub fn new() -> Self {
        Self
    }

    fn apply(&self, text: &str, constraints: &ConstraintSet) -> Result<String, ComposeError> {
        let failed = |e: regex::Error| ComposeError::Failed(e.to_string());
        let rules = rules_of(constraints);
        let mut kept = sentences(text);

        for rule in &rules {
            if let Rule::Forbid(term) = rule {
                let re = word_regex(term).map_err(failed)?;
                kept.retain(|s| !re.is_match(s));
            }
        }

        let mut missing = Vec::new();
        for rule in &rules {
            if let Rule::Require(term) = rule {
                let joined = kept.join(" ");
                if !mentions(&joined, term).map_err(failed)? {
                    missing.push(term.clone());
                }
            }
        }

        let limit = rules
            .iter()
            .filter_map(|r| match r {
                Rule::MaxSentences(n) => Some(*n),
                _ => None,
            })
            .min();
        if let Some(limit) = limit {
            kept.truncate(limit.saturating_sub(missing.len()));
        }
        kept.extend(missing);

        if kept.is_empty() {
            return Err(ComposeError::Failed(
                "no sentence survives the active constraints".into(),
            ));
        }
        Ok(join_sentences(&kept))
    }
}

#[async_trait]
impl Composer for RuleComposer {
    async fn draft(&self, input: &str, constraints: &ConstraintSet) -> Result<String, ComposeError> {
        if sentences(input).is_empty() {
            return Err(ComposeError::Malformed("input has no sentences".into()));
        }
        self.apply(input, constraints)
    }

    async fn revise(
        &self,
        candidate: &str,
        unresolved: &[Contradiction],
        constraints: &ConstraintSet,
    ) -> Result<String, ComposeError> {
        debug!(unresolved = unresolved.len(), "Revising against active constraints");
        self.apply(candidate, constraints)
    }
}
