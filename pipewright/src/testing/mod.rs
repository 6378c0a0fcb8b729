//! Test support: scripted processors, run assertions and a scratch fixture.

mod assertions;
mod fixtures;
mod processors;

pub use assertions::{assert_ran_before, assert_run_failed, assert_run_succeeded, assert_stage_status};
pub use fixtures::TestFixture;
pub use processors::{FailingProcessor, FlakyProcessor, RecordingProcessor, SlowProcessor};
