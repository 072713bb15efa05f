//! Generated Registration RPC types, compiled from `proto/registration.proto`
//! by `build.rs` via `tonic-build`, mirroring the teacher's
//! `authly-test-grpc` generated-proto module convention.

pub mod registration {
    tonic::include_proto!("otterscale.registration");
}
