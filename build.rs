//! Generates gRPC client/message types from the `proto/` directory: the
//! bundle RPC tier and the report-forwarding client.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Server codegen is unused in production for either service (we are
    // always the client of both) but is kept so tests can drive a fake
    // in-process server over a `tokio::io::duplex` pair.
    tonic_prost_build::configure()
        .build_server(true)
        .compile_protos(
            &["proto/bundle.proto", "proto/report.proto"],
            &["proto"],
        )?;
    Ok(())
}
