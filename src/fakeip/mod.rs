//! Synthetic address pool backing DNS hijacking

mod pool;

pub use pool::{FakeAddress, FakeIpPool, FakeIpStats, Family};
