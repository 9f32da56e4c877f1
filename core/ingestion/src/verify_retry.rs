//! Bounded propose / verify / retry loop shared by every document-derived extraction.
//!
//! A unit optionally prechecks its input, then proposes a candidate and has it
//! verified, up to `max_attempts` times. Rejection after the last attempt is a
//! `Failed` outcome, never an error. Errors from the classifier (including
//! schema mismatches) propagate unchanged and are fatal for the run.

use anyhow::Result;
use async_trait::async_trait;
use ecu_synth_indexing::is_affirmative;
use tracing::debug;

use crate::audit::AuditLog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub approved: bool,
    pub reason: String,
}

impl Verdict {
    pub fn approve(reason: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: reason.into(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
        }
    }

    /// Verdict from a yes/no answer string, compared case-insensitively.
    pub fn from_answer(answer: &str, reason: impl Into<String>) -> Self {
        Self {
            approved: is_affirmative(answer),
            reason: reason.into(),
        }
    }
}

/// What a single propose step produced.
#[derive(Debug)]
pub enum Proposal<C> {
    Candidate(C),
    /// The unit holds nothing extractable; ends the loop without verifying.
    Nothing(String),
}

#[derive(Debug, PartialEq)]
pub enum Outcome<C> {
    Accepted { candidate: C, attempts: u32 },
    Skipped { reason: String },
    Failed { attempts: u32, reason: String },
}

impl<C> Outcome<C> {
    pub fn accepted(self) -> Option<C> {
        match self {
            Outcome::Accepted { candidate, .. } => Some(candidate),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }
}

#[async_trait]
pub trait ExtractionUnit: Send + Sync {
    type Candidate: Send;

    /// Short identifier for logs, e.g. `DTC page 3 of spec.pdf`.
    fn label(&self) -> String;

    /// Whether the input holds anything worth extracting.
    async fn precheck(&self) -> Result<Verdict> {
        Ok(Verdict::approve("no precheck"))
    }

    async fn propose(&self, attempt: u32) -> Result<Proposal<Self::Candidate>>;

    async fn verify(&self, candidate: &Self::Candidate) -> Result<Verdict>;
}

pub async fn run_unit<U>(unit: &U, max_attempts: u32, audit: &AuditLog) -> Result<Outcome<U::Candidate>>
where
    U: ExtractionUnit + ?Sized,
{
    let label = unit.label();

    let precheck = unit.precheck().await?;
    if !precheck.approved {
        audit.record(format!("{}: nothing to extract ({})", label, precheck.reason));
        return Ok(Outcome::Skipped {
            reason: precheck.reason,
        });
    }

    let max_attempts = max_attempts.max(1);
    let mut last_reason = String::new();

    for attempt in 1..=max_attempts {
        debug!("{}: attempt {}/{}", label, attempt, max_attempts);

        let candidate = match unit.propose(attempt).await? {
            Proposal::Candidate(candidate) => candidate,
            Proposal::Nothing(reason) => {
                audit.record(format!("{}: nothing to extract ({})", label, reason));
                return Ok(Outcome::Skipped { reason });
            }
        };

        let verdict = unit.verify(&candidate).await?;
        if verdict.approved {
            audit.record(format!("{}: accepted on attempt {} ({})", label, attempt, verdict.reason));
            return Ok(Outcome::Accepted {
                candidate,
                attempts: attempt,
            });
        }

        audit.record(format!("{}: attempt {} rejected ({})", label, attempt, verdict.reason));
        last_reason = verdict.reason;
    }

    audit.record(format!("{}: failed after {} attempts", label, max_attempts));
    Ok(Outcome::Failed {
        attempts: max_attempts,
        reason: last_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::Mutex;

    struct Scripted {
        has_data: bool,
        approve_on: Option<u32>,
        fail_propose: bool,
        seen: Mutex<Vec<u32>>,
    }

    impl Scripted {
        fn new(has_data: bool, approve_on: Option<u32>) -> Self {
            Self {
                has_data,
                approve_on,
                fail_propose: false,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ExtractionUnit for Scripted {
        type Candidate = u32;

        fn label(&self) -> String {
            "scripted".to_string()
        }

        async fn precheck(&self) -> Result<Verdict> {
            Ok(Verdict::from_answer(if self.has_data { "Yes" } else { "no" }, "checked"))
        }

        async fn propose(&self, attempt: u32) -> Result<Proposal<u32>> {
            if self.fail_propose {
                bail!("schema mismatch");
            }
            self.seen.lock().unwrap().push(attempt);
            Ok(Proposal::Candidate(attempt))
        }

        async fn verify(&self, candidate: &u32) -> Result<Verdict> {
            Ok(match self.approve_on {
                Some(n) if *candidate == n => Verdict::approve("fine"),
                _ => Verdict::reject("wrong"),
            })
        }
    }

    #[tokio::test]
    async fn test_accepts_on_later_attempt() {
        let unit = Scripted::new(true, Some(2));
        let outcome = run_unit(&unit, 3, &AuditLog::new()).await.unwrap();
        assert_eq!(outcome, Outcome::Accepted { candidate: 2, attempts: 2 });
        assert_eq!(*unit.seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_terminates_within_budget() {
        let unit = Scripted::new(true, None);
        let audit = AuditLog::new();
        let outcome = run_unit(&unit, 3, &audit).await.unwrap();

        assert!(outcome.is_failed());
        let seen = unit.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(audit.contains("failed after 3 attempts"));
    }

    #[tokio::test]
    async fn test_precheck_short_circuits() {
        let unit = Scripted::new(false, Some(1));
        let outcome = run_unit(&unit, 3, &AuditLog::new()).await.unwrap();
        assert!(matches!(outcome, Outcome::Skipped { .. }));
        assert!(unit.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_propose_errors_are_not_retried() {
        let mut unit = Scripted::new(true, Some(1));
        unit.fail_propose = true;
        assert!(run_unit(&unit, 3, &AuditLog::new()).await.is_err());
    }
}
