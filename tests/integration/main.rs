//! End-to-end scenarios wiring real components together, rather than the
//! fakes/mocks each module's own `#[cfg(test)]` suite uses. Mirrors the
//! teacher's `tests/integration/main.rs` aggregator: one binary, one `mod`
//! per scenario group.

mod scenario_auth_rotation;
mod scenario_exhaustion;
mod scenario_health_eviction;
mod scenario_registration;
mod scenario_shutdown;
mod support;
