fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    let mut config = prost_build::Config::new();
    config.bytes(["."]);
    config.disable_comments(["."]);

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_with_config(
            config,
            &[
                "protos/bmc/v1/common.proto",
                "protos/bmc/manager/v1/manager.proto",
                "protos/bmc/gateway/v1/gateway.proto",
                "protos/bmc/agent/v1/agent.proto",
            ],
            &["protos"],
        )?;

    Ok(())
}
