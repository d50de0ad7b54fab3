mod replay;

pub use replay::{load_csv, read_bars, run_replay, ReplayCursor};
