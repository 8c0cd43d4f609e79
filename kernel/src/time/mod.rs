//! Time sources: the PIT tick counter and busy-wait delays.

pub mod timer;
