//! Generation probes for a trained model.
//!
//! Provides:
//! - Built-in evaluation and adversarial prompt suites
//! - A greedy-by-default evaluator with progress reporting
//! - Console rendering and JSON reports

pub mod eval;
pub mod probes;

pub use eval::{EvalReport, Evaluator, ProbeResult};
pub use probes::{Probe, ProbeSuite, SuiteKind};
