//! Generated gRPC types and service stubs, produced by `build.rs` from `proto/castletown.proto`.

include!("castletown.rs");
