fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/supervisor.proto");
    let descriptors = protox::compile(["supervisor.proto"], ["proto"])?;
    tonic_build::configure()
        .build_server(false)
        .compile_fds(descriptors)?;
    Ok(())
}
