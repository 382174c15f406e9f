fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Deterministic maps and cheap payload clones, to match the domain
    // types.
    let mut config = prost_build::Config::new();
    config.btree_map(["."]);
    config.bytes(["."]);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos_with_config(config, &["proto/warren.proto"], &["proto"])?;
    Ok(())
}
