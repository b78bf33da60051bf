/*!
# Hostwatch DevKit - doubles and harness for pipeline tests

Helps test checks and sinks without touching the host:
- Recording and failing report sinks
- A scripted check driven from task attributes
- Recording forwarder and abort handler
- `TestHarness`, a scheduler and collector wired to the doubles
*/

pub mod doubles;
pub mod test_utils;

pub use doubles::{
    scripted_registry, scripted_task, Failure, FailingSink, RecordingAbort, RecordingForwarder,
    RecordingSink, RunLedger, ScriptedCheck, SinkEvent, SinkLog, Step,
};
pub use test_utils::{at, init_test_logging, TestHarness};
