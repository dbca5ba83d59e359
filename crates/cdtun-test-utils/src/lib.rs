//! Shared test fakes for cdtun.
//!
//! Provides an in-memory TUN device so device-dependent code paths can be
//! exercised without elevated privileges or real kernel interfaces.

mod fake_tun;

pub use fake_tun::FakeTun;
