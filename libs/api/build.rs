fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                "proto/machine.proto",
                "proto/storage.proto",
                "proto/state.proto",
                "proto/security.proto",
            ],
            &["proto"],
        )?;
    Ok(())
}
