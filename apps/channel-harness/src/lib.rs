//! Drives channel clients through scripted scenarios and reports one
//! [`CompletionSignal`] per test.

pub mod completion;
pub mod runner;
pub mod scenarios;

pub use completion::{Completion, CompletionReceiver, CompletionSignal};
pub use runner::{run_all, run_test, RunnerConfig, Summary, TestCase, TestOutcome, UnknownTest};
pub use scenarios::{EchoScenario, LivenessScenario, StopScenario};
