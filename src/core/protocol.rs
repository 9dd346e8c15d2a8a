//! Step protocol state machine.
//!
//! Two interleaved cycles share one network:
//!
//! - the tick: `update` -> (`learn`) -> `step_end`, repeated;
//! - the prediction cycle: at most one `predict`, exactly one
//!   `learn_prediction`, closed by `prediction_end` once the current tick
//!   has ended.
//!
//! Calls outside this order are rejected before any device work is issued.

use std::fmt;

use thiserror::Error;

/// Orchestrator entry points tracked by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Update,
    Predict,
    Learn,
    LearnPrediction,
    StepEnd,
    PredictionEnd,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Update => "update",
            Operation::Predict => "predict",
            Operation::Learn => "learn",
            Operation::LearnPrediction => "learn_prediction",
            Operation::StepEnd => "step_end",
            Operation::PredictionEnd => "prediction_end",
        };
        f.write_str(name)
    }
}

/// Where the current tick stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TickPhase {
    #[default]
    Idle,
    Updated,
    Learned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("`{operation}` out of order: {reason} (tick phase {phase:?})")]
pub struct ProtocolError {
    pub operation: Operation,
    pub phase: TickPhase,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct StepProtocol {
    phase: TickPhase,
    predicted: bool,
    prediction_learned: bool,
    ticks: u64,
    cycles: u64,
}

impl StepProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> TickPhase {
        self.phase
    }

    /// Completed ticks.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Completed prediction cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn predicted(&self) -> bool {
        self.predicted
    }

    pub fn prediction_learned(&self) -> bool {
        self.prediction_learned
    }

    /// Whether `operation` may run now.
    pub fn check(&self, operation: Operation) -> Result<(), ProtocolError> {
        let reason = match operation {
            Operation::Update if self.phase != TickPhase::Idle => {
                Some("the previous tick has not ended")
            }
            Operation::Learn => match self.phase {
                TickPhase::Idle => Some("no update ran this tick"),
                TickPhase::Learned => Some("already learned this tick"),
                TickPhase::Updated => None,
            },
            Operation::StepEnd if self.phase == TickPhase::Idle => Some("no update ran this tick"),
            Operation::Predict if self.predicted => Some("already predicted this cycle"),
            Operation::Predict if self.prediction_learned => {
                Some("the prediction was already learned this cycle")
            }
            Operation::LearnPrediction if self.prediction_learned => {
                Some("already learned the prediction this cycle")
            }
            Operation::PredictionEnd if !self.prediction_learned => {
                Some("learn_prediction has not run this cycle")
            }
            Operation::PredictionEnd if self.phase != TickPhase::Idle => {
                Some("the current tick has not ended")
            }
            _ => None,
        };

        match reason {
            Some(reason) => Err(ProtocolError {
                operation,
                phase: self.phase,
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Record that `operation` completed. Call only after a successful `check`.
    pub fn advance(&mut self, operation: Operation) {
        match operation {
            Operation::Update => self.phase = TickPhase::Updated,
            Operation::Learn => self.phase = TickPhase::Learned,
            Operation::StepEnd => {
                self.phase = TickPhase::Idle;
                self.ticks += 1;
            }
            Operation::Predict => self.predicted = true,
            Operation::LearnPrediction => self.prediction_learned = true,
            Operation::PredictionEnd => {
                self.predicted = false;
                self.prediction_learned = false;
                self.cycles += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(protocol: &mut StepProtocol, ops: &[Operation]) -> Result<(), ProtocolError> {
        for op in ops {
            protocol.check(*op)?;
            protocol.advance(*op);
        }
        Ok(())
    }

    use Operation::*;

    #[test]
    fn canonical_tick_is_accepted() {
        let mut p = StepProtocol::new();
        run(
            &mut p,
            &[Update, Predict, Learn, LearnPrediction, StepEnd, PredictionEnd],
        )
        .unwrap();
        assert_eq!(p.phase(), TickPhase::Idle);
        assert_eq!((p.ticks(), p.cycles()), (1, 1));
    }

    #[test]
    fn several_ticks_per_prediction_cycle() {
        let mut p = StepProtocol::new();
        run(
            &mut p,
            &[
                Predict, Update, StepEnd, Update, Learn, StepEnd, LearnPrediction, PredictionEnd,
                Predict,
            ],
        )
        .unwrap();
        assert_eq!((p.ticks(), p.cycles()), (2, 1));
        assert!(p.predicted());
    }

    #[test]
    fn double_update_is_rejected() {
        let mut p = StepProtocol::new();
        let err = run(&mut p, &[Update, Update]).unwrap_err();
        assert_eq!(err.operation, Update);
        assert_eq!(err.phase, TickPhase::Updated);
    }

    #[test]
    fn learn_needs_an_update() {
        let p = StepProtocol::new();
        assert!(p.check(Learn).is_err());
        assert!(p.check(StepEnd).is_err());
    }

    #[test]
    fn prediction_end_needs_learned_prediction_and_closed_tick() {
        let mut p = StepProtocol::new();
        assert!(p.check(PredictionEnd).is_err());
        run(&mut p, &[Update, LearnPrediction]).unwrap();
        let err = p.check(PredictionEnd).unwrap_err();
        assert_eq!(err.reason, "the current tick has not ended");
        run(&mut p, &[StepEnd, PredictionEnd]).unwrap();
    }

    #[test]
    fn one_prediction_and_one_learn_per_cycle() {
        let mut p = StepProtocol::new();
        run(&mut p, &[Predict]).unwrap();
        assert!(p.check(Predict).is_err());
        run(&mut p, &[LearnPrediction]).unwrap();
        assert!(p.check(LearnPrediction).is_err());
    }
}
