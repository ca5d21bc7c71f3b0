//! Synchronized capture across several cameras.
//!
//! - Arming and firing via [`TriggerCoordinator`]
//! - Frame collection and matching via [`FrameCorrelator`]
//! - Request orchestration via [`CaptureSession`]

mod correlator;
mod session;
mod trigger;

pub use correlator::{
    assemble, CorrelatedSet, CorrelationPolicy, CorrelationStatus, FrameCorrelator,
    FrameIdPolicy, Pull, TimeoutPolicy,
};
pub use session::{capture_with_retry, CancelToken, CaptureSession, SessionConfig, SessionState};
pub use trigger::{FireEvent, TriggerCoordinator, TriggerMode};
