//! Control-side timing: the cooperative event loop and the lookahead
//! scheduler that turns coarse wake-ups into sample-accurate onsets.

pub mod event_loop;
pub mod scheduler;

pub use event_loop::{EngineTask, EventLoop, InstanceId, ModuleTask, TimerHandle, TimerKey};
pub use scheduler::{LookaheadScheduler, ScheduledStep, SchedulerState};
