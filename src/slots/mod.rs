//! Process slots - local and remote worker-hosting processes

pub mod context;
pub mod host;
pub mod launcher;
pub mod manager;

pub use context::WorkerContext;
pub use host::SlotHost;
pub use launcher::{
    InProcessLauncher, LaunchedSlot, LocalAcceptor, ProcessLauncher, SlotEnv, SlotLauncher, SlotProcess,
    run_slot_process,
};
pub use manager::{InitReport, ProcessSlotManager, SlotEvent, select_slot};
