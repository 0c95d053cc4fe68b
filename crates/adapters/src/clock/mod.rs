pub mod replay_clock;
pub mod system_clock;
