//! Exit-gate challenges
//!
//! Termination while enforcing is allowed only after the operator solves a
//! generated challenge. Content comes from a pluggable
//! [`ChallengeGenerator`]; answers come from an [`AnswerSource`] so the
//! gatekeeper works the same against a terminal, a socket, or a test script.

use crate::error::{FocusError, Result};
use crate::state::{EnforcementState, MAX_DIFFICULTY, MIN_DIFFICULTY};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;

/// Attempts per round unless configured otherwise
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Failed rounds in a row that raise the difficulty by one
pub const ROUNDS_BEFORE_ESCALATION: u32 = 2;

/// One generated question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub prompt: String,
    pub expected_answer: i64,
    pub difficulty_level: u8,
}

/// Result of checking one answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Correct,
    Incorrect,
}

/// How a round ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Passed { attempts: u32 },
    Exhausted,
}

/// Difficulty change caused by repeated failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    pub from: u8,
    pub to: u8,
}

/// Produces `(prompt, answer)` pairs for a difficulty level
pub trait ChallengeGenerator: Send + Sync {
    fn generate(&self, difficulty: u8) -> (String, i64);
}

/// Supplies the operator's answer to a challenge
#[async_trait]
pub trait AnswerSource: Send {
    /// Return the raw answer text, or [`FocusError::ChallengeAbandoned`]
    /// if the operator walked away
    async fn answer(&mut self, challenge: &Challenge, attempt: u32, max_attempts: u32) -> Result<String>;
}

/// Default content: arithmetic that gets harder with each level
///
/// 1. two two-digit operands with `+ - *`
/// 2. a three-digit and a two-digit operand
/// 3. `(a + b) * c`
/// 4. the n-th Fibonacci number for n in 5..=10
/// 5. the median of five integers in 1..=100
#[derive(Debug, Default, Clone, Copy)]
pub struct ArithmeticLadder;

impl ArithmeticLadder {
    /// Generate with a caller-supplied RNG
    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R, difficulty: u8) -> (String, i64) {
        match difficulty.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY) {
            1 => {
                let (a, b) = (rng.gen_range(10..=99), rng.gen_range(10..=99));
                binary_op(rng, a, b)
            }
            2 => {
                let (a, b) = (rng.gen_range(100..=999), rng.gen_range(10..=99));
                binary_op(rng, a, b)
            }
            3 => {
                let a: i64 = rng.gen_range(10..=99);
                let b: i64 = rng.gen_range(10..=99);
                let c: i64 = rng.gen_range(2..=9);
                (format!("What is ({a} + {b}) * {c}?"), (a + b) * c)
            }
            4 => {
                let n: u32 = rng.gen_range(5..=10);
                (
                    format!("What is Fibonacci number {n}? (F1 = F2 = 1)"),
                    fibonacci(n),
                )
            }
            _ => {
                let mut values: Vec<i64> = (0..5).map(|_| rng.gen_range(1..=100)).collect();
                let listed = values
                    .iter()
                    .map(i64::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                values.sort_unstable();
                (format!("What is the median of [{listed}]?"), values[2])
            }
        }
    }
}

impl ChallengeGenerator for ArithmeticLadder {
    fn generate(&self, difficulty: u8) -> (String, i64) {
        Self::generate_with(&mut rand::thread_rng(), difficulty)
    }
}

fn binary_op<R: Rng + ?Sized>(rng: &mut R, a: i64, b: i64) -> (String, i64) {
    match rng.gen_range(0..3) {
        0 => (format!("What is {a} + {b}?"), a + b),
        1 => (format!("What is {a} - {b}?"), a - b),
        _ => (format!("What is {a} * {b}?"), a * b),
    }
}

fn fibonacci(n: u32) -> i64 {
    let (mut a, mut b) = (0i64, 1i64);
    for _ in 0..n {
        (a, b) = (b, a + b);
    }
    a
}

/// Issues challenges, checks answers, and escalates difficulty
pub struct ChallengeGatekeeper {
    generator: Arc<dyn ChallengeGenerator>,
    max_attempts: u32,
}

impl ChallengeGatekeeper {
    pub fn new(generator: Arc<dyn ChallengeGenerator>, max_attempts: u32) -> Self {
        Self {
            generator,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Generate a fresh challenge at the given difficulty
    pub fn issue(&self, difficulty: u8) -> Challenge {
        let difficulty_level = difficulty.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY);
        let (prompt, expected_answer) = self.generator.generate(difficulty_level);
        Challenge {
            prompt,
            expected_answer,
            difficulty_level,
        }
    }

    /// Check an answer; anything that is not the expected integer is incorrect
    pub fn verify(&self, challenge: &Challenge, answer: &str) -> Verdict {
        match answer.trim().parse::<i64>() {
            Ok(value) if value == challenge.expected_answer => Verdict::Correct,
            _ => Verdict::Incorrect,
        }
    }

    /// Fold a round's outcome into the counters
    ///
    /// A pass resets the failure streak. Every second exhausted round in a
    /// row raises the difficulty by one (capped) and resets the streak.
    pub fn record_outcome(&self, state: &mut EnforcementState, outcome: RoundOutcome) -> Option<Escalation> {
        match outcome {
            RoundOutcome::Passed { .. } => {
                state.consecutive_challenge_failures = 0;
                None
            }
            RoundOutcome::Exhausted => {
                state.consecutive_challenge_failures += 1;
                if state.consecutive_challenge_failures < ROUNDS_BEFORE_ESCALATION {
                    return None;
                }
                state.consecutive_challenge_failures = 0;
                let from = state.difficulty_level;
                let to = (from + 1).min(MAX_DIFFICULTY);
                if to == from {
                    return None;
                }
                state.difficulty_level = to;
                tracing::info!(from, to, "Challenge difficulty escalated");
                Some(Escalation { from, to })
            }
        }
    }

    /// Run one round of up to `max_attempts` challenges
    ///
    /// Abandoned or unreadable answers count as failed attempts.
    pub async fn run_round(&self, difficulty: u8, answers: &mut dyn AnswerSource) -> RoundOutcome {
        for attempt in 1..=self.max_attempts {
            let challenge = self.issue(difficulty);
            let verdict = match answers.answer(&challenge, attempt, self.max_attempts).await {
                Ok(text) => self.verify(&challenge, &text),
                Err(FocusError::ChallengeAbandoned) => {
                    tracing::info!(attempt, "Challenge abandoned");
                    Verdict::Incorrect
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Failed to read challenge answer");
                    Verdict::Incorrect
                }
            };

            if verdict == Verdict::Correct {
                tracing::info!(attempt, difficulty, "Challenge solved");
                return RoundOutcome::Passed { attempts: attempt };
            }
            tracing::info!(attempt, max = self.max_attempts, "Challenge answer incorrect");
        }
        RoundOutcome::Exhausted
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gatekeeper() -> ChallengeGatekeeper {
        ChallengeGatekeeper::new(Arc::new(FixedGenerator), DEFAULT_MAX_ATTEMPTS)
    }

    fn numbers(prompt: &str) -> Vec<i64> {
        prompt
            .split(|c: char| !c.is_ascii_digit())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse().unwrap())
            .collect()
    }

    #[test]
    fn test_ladder_answers_match_prompts() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let (prompt, answer) = ArithmeticLadder::generate_with(&mut rng, 1);
            let n = numbers(&prompt);
            let expected = if prompt.contains('+') {
                n[0] + n[1]
            } else if prompt.contains(" - ") {
                n[0] - n[1]
            } else {
                n[0] * n[1]
            };
            assert_eq!(answer, expected, "{prompt}");
            assert!((10..=99).contains(&n[0]) && (10..=99).contains(&n[1]));

            let (prompt, answer) = ArithmeticLadder::generate_with(&mut rng, 2);
            assert!((100..=999).contains(&numbers(&prompt)[0]), "{prompt}");
            let _ = answer;

            let (prompt, answer) = ArithmeticLadder::generate_with(&mut rng, 3);
            let n = numbers(&prompt);
            assert_eq!(answer, (n[0] + n[1]) * n[2]);

            let (_, answer) = ArithmeticLadder::generate_with(&mut rng, 4);
            assert!([5, 8, 13, 21, 34, 55].contains(&answer));

            let (prompt, answer) = ArithmeticLadder::generate_with(&mut rng, 5);
            let mut n = numbers(&prompt);
            n.sort_unstable();
            assert_eq!(n.len(), 5);
            assert_eq!(answer, n[2]);
        }
    }

    #[test]
    fn test_fibonacci() {
        assert_eq!(fibonacci(1), 1);
        assert_eq!(fibonacci(2), 1);
        assert_eq!(fibonacci(10), 55);
    }

    #[test]
    fn test_verify() {
        let gk = gatekeeper();
        let challenge = gk.issue(1);
        assert_eq!(gk.verify(&challenge, " 2\n"), Verdict::Correct);
        assert_eq!(gk.verify(&challenge, "3"), Verdict::Incorrect);
        assert_eq!(gk.verify(&challenge, "two"), Verdict::Incorrect);
        assert_eq!(gk.verify(&challenge, ""), Verdict::Incorrect);
    }

    #[test]
    fn test_issue_clamps_difficulty() {
        let gk = gatekeeper();
        assert_eq!(gk.issue(0).difficulty_level, 1);
        assert_eq!(gk.issue(9).difficulty_level, 5);
    }

    #[tokio::test]
    async fn test_round_passes_on_later_attempt() {
        let gk = gatekeeper();
        let mut answers = ScriptedAnswers::new([Some("5"), Some("2")]);
        let outcome = gk.run_round(1, &mut answers).await;
        assert_eq!(outcome, RoundOutcome::Passed { attempts: 2 });
        assert_eq!(answers.asked.len(), 2);
    }

    #[tokio::test]
    async fn test_round_exhausts_after_max_attempts() {
        let gk = gatekeeper();
        let mut answers = ScriptedAnswers::new([Some("1"), None, Some("x"), Some("2")]);
        let outcome = gk.run_round(1, &mut answers).await;
        assert_eq!(outcome, RoundOutcome::Exhausted);
        // The fourth answer is never requested
        assert_eq!(answers.asked.len(), 3);
    }

    #[test]
    fn test_two_exhausted_rounds_escalate() {
        let gk = gatekeeper();
        let mut state = EnforcementState {
            difficulty_level: 2,
            ..Default::default()
        };

        assert_eq!(gk.record_outcome(&mut state, RoundOutcome::Exhausted), None);
        assert_eq!(state.consecutive_challenge_failures, 1);

        let escalation = gk.record_outcome(&mut state, RoundOutcome::Exhausted);
        assert_eq!(escalation, Some(Escalation { from: 2, to: 3 }));
        assert_eq!(state.difficulty_level, 3);
        assert_eq!(state.consecutive_challenge_failures, 0);
    }

    #[test]
    fn test_escalation_caps_at_max() {
        let gk = gatekeeper();
        let mut state = EnforcementState {
            difficulty_level: MAX_DIFFICULTY,
            ..Default::default()
        };
        gk.record_outcome(&mut state, RoundOutcome::Exhausted);
        assert_eq!(gk.record_outcome(&mut state, RoundOutcome::Exhausted), None);
        assert_eq!(state.difficulty_level, MAX_DIFFICULTY);
        assert_eq!(state.consecutive_challenge_failures, 0);
    }

    #[test]
    fn test_pass_resets_streak() {
        let gk = gatekeeper();
        let mut state = EnforcementState::default();
        gk.record_outcome(&mut state, RoundOutcome::Exhausted);
        gk.record_outcome(&mut state, RoundOutcome::Passed { attempts: 1 });
        assert_eq!(state.consecutive_challenge_failures, 0);
        assert_eq!(state.difficulty_level, 1);
    }
}
